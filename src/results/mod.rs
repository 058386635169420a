// SPDX-License-Identifier: PMPL-1.0-or-later

//! Query results and batch reports

pub mod formatter;
pub mod output;

use crate::error::{EvalError, EvalResult};
use crate::exec::EvalStats;
use crate::plan::{Query, QueryKind};
use crate::store::FactStore;
use crate::types::{Column, EntityId, Location, Schema, Tuple, Value};
use serde::ser::SerializeStruct;
use serde::{Deserialize, Serialize, Serializer};

/// Distinct result tuples of one query, in the query's select order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultSet {
    pub query: String,
    pub kind: QueryKind,
    pub columns: Vec<Column>,
    pub rows: Vec<Tuple>,
}

impl ResultSet {
    /// Deduplicate and sort `rows`; the order is deterministic but carries
    /// no meaning
    pub fn materialize(query: &Query, schema: Schema, mut rows: Vec<Tuple>) -> Self {
        rows.sort_unstable();
        rows.dedup();
        Self {
            query: query.name.clone(),
            kind: query.kind,
            columns: schema.columns,
            rows,
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn contains(&self, row: &[Value]) -> bool {
        self.rows.iter().any(|r| r.as_slice() == row)
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    /// `(entity, message, severity)` records of a diagnostic query
    pub fn diagnostics(&self) -> EvalResult<Vec<Diagnostic>> {
        if self.kind != QueryKind::Diagnostic {
            return Err(EvalError::InvalidPlan(format!(
                "query `{}` is not a diagnostic query",
                self.query
            )));
        }
        self.rows
            .iter()
            .map(|row| match row.as_slice() {
                [Value::Entity(entity), Value::String(message), Value::Int(severity)] => {
                    Ok(Diagnostic {
                        entity: *entity,
                        message: message.to_string(),
                        severity: *severity,
                    })
                }
                _ => Err(EvalError::InvalidPlan(format!(
                    "row of diagnostic query `{}` is not (entity, string, int)",
                    self.query
                ))),
            })
            .collect()
    }

    /// Rows with entity values expanded to their label, kind and location
    pub fn resolve(&self, store: &FactStore) -> ResolvedResult {
        let rows = self
            .rows
            .iter()
            .map(|row| row.iter().map(|v| ResolvedValue::of(v, store)).collect())
            .collect();
        ResolvedResult {
            query: self.query.clone(),
            columns: self.columns.iter().map(|c| c.name.clone()).collect(),
            rows,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub entity: EntityId,
    pub message: String,
    /// Opaque, caller-defined
    pub severity: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum ResolvedValue {
    Entity {
        id: EntityId,
        #[serde(skip_serializing_if = "Option::is_none")]
        kind: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        label: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        location: Option<Location>,
    },
    String(String),
    Int(i64),
    Bool(bool),
}

impl ResolvedValue {
    fn of(value: &Value, store: &FactStore) -> Self {
        match value {
            Value::Entity(id) => {
                let info = store.entity(*id);
                ResolvedValue::Entity {
                    id: *id,
                    kind: info.map(|i| i.kind.clone()),
                    label: info.map(|i| i.label.clone()),
                    location: info.and_then(|i| i.location.clone()),
                }
            }
            Value::String(s) => ResolvedValue::String(s.to_string()),
            Value::Int(i) => ResolvedValue::Int(*i),
            Value::Bool(b) => ResolvedValue::Bool(*b),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedResult {
    pub query: String,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<ResolvedValue>>,
}

/// Result of one query in a batch
#[derive(Debug, Clone)]
pub struct QueryOutcome {
    pub query: String,
    pub elapsed_ms: u64,
    pub result: EvalResult<ResultSet>,
}

impl QueryOutcome {
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }

    pub fn error(&self) -> Option<&EvalError> {
        self.result.as_ref().err()
    }

    pub fn rows(&self) -> Option<&ResultSet> {
        self.result.as_ref().ok()
    }
}

impl Serialize for QueryOutcome {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("QueryOutcome", 4)?;
        state.serialize_field("query", &self.query)?;
        state.serialize_field("elapsed_ms", &self.elapsed_ms)?;
        match &self.result {
            Ok(result) => {
                state.serialize_field("status", "ok")?;
                state.serialize_field("result", result)?;
            }
            Err(err) => {
                state.serialize_field("status", "failed")?;
                state.serialize_field(
                    "error",
                    &ErrorRecord {
                        kind: err.kind(),
                        message: err.to_string(),
                    },
                )?;
            }
        }
        state.end()
    }
}

#[derive(Serialize)]
struct ErrorRecord {
    kind: &'static str,
    message: String,
}

/// Outcome of evaluating every query of a program
#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub created_at: String,
    pub store_fingerprint: String,
    pub outcomes: Vec<QueryOutcome>,
    pub stats: EvalStats,
}

impl BatchReport {
    pub fn new(store_fingerprint: String, outcomes: Vec<QueryOutcome>, stats: EvalStats) -> Self {
        Self {
            created_at: chrono::Utc::now().to_rfc3339(),
            store_fingerprint,
            outcomes,
            stats,
        }
    }

    pub fn outcome(&self, query: &str) -> Option<&QueryOutcome> {
        self.outcomes.iter().find(|o| o.query == query)
    }

    pub fn succeeded(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_ok()).count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes.len() - self.succeeded()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::{Expr, SelectItem};
    use crate::types::{ColumnType, EntityInfo};

    fn diag_query() -> Query {
        Query::new(
            "ExtractionErrors",
            QueryKind::Diagnostic,
            vec![],
            vec![
                SelectItem::new("err", Expr::var("err")),
                SelectItem::new("msg", Expr::var("msg")),
                SelectItem::new("sev", Expr::val(1i64)),
            ],
        )
    }

    fn diag_schema() -> Schema {
        Schema::of_types(&[ColumnType::Entity, ColumnType::String, ColumnType::Int])
    }

    #[test]
    fn test_materialize_dedups() {
        let row = vec![Value::entity(5), Value::string("boom"), Value::Int(1)];
        let set = ResultSet::materialize(&diag_query(), diag_schema(), vec![row.clone(), row.clone()]);
        assert_eq!(set.len(), 1);
        assert!(set.contains(&row));
        let diags = set.diagnostics().unwrap();
        assert_eq!(
            diags,
            vec![Diagnostic {
                entity: EntityId(5),
                message: "boom".into(),
                severity: 1,
            }]
        );
    }

    #[test]
    fn test_table_query_has_no_diagnostics() {
        let mut query = diag_query();
        query.kind = QueryKind::Table;
        let set = ResultSet::materialize(&query, diag_schema(), vec![]);
        assert!(set.diagnostics().is_err());
    }

    #[test]
    fn test_resolve_expands_entities() {
        let mut builder = FactStore::builder();
        builder.add_entity(EntityId(5), EntityInfo::new("extraction_error", "error #5"));
        let store = builder.build();
        let row = vec![Value::entity(5), Value::string("boom"), Value::Int(1)];
        let set = ResultSet::materialize(&diag_query(), diag_schema(), vec![row]);
        let resolved = set.resolve(&store);
        let json = serde_json::to_value(&resolved).unwrap();
        assert_eq!(json["rows"][0][0]["kind"], "extraction_error");
        assert_eq!(json["rows"][0][1], "boom");
        assert_eq!(json["rows"][0][2], 1);
    }

    #[test]
    fn test_outcome_serialization() {
        let failed = QueryOutcome {
            query: "q".into(),
            elapsed_ms: 3,
            result: Err(EvalError::UnknownPredicate("files".into())),
        };
        let json = serde_json::to_value(&failed).unwrap();
        assert_eq!(json["status"], "failed");
        assert_eq!(json["error"]["kind"], "UnknownPredicate");
    }
}
