// SPDX-License-Identifier: PMPL-1.0-or-later

//! Fact store: the read-only database produced by extraction
//!
//! A store is assembled once with [`FactStoreBuilder`] (or loaded from disk
//! through [`loader`]) and never mutated afterwards. Every query of a run
//! reads the same `Arc<FactStore>`.

pub mod index;
pub mod loader;
pub mod relation;

pub use index::HashIndex;
pub use relation::Relation;

use crate::error::{EvalError, EvalResult};
use crate::types::{Column, ColumnType, EntityId, EntityInfo, Schema, Tuple, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

pub const ENTITY_KIND: &str = "entity_kind";
pub const ENTITY_LOCATION: &str = "entity_location";

#[derive(Debug, Default)]
pub struct FactStore {
    relations: HashMap<String, Arc<Relation>>,
    entities: HashMap<EntityId, EntityInfo>,
}

impl FactStore {
    pub fn builder() -> FactStoreBuilder {
        FactStoreBuilder::default()
    }

    /// Look up a base relation by name
    pub fn get_relation(&self, name: &str) -> EvalResult<Arc<Relation>> {
        self.relations
            .get(name)
            .cloned()
            .ok_or_else(|| EvalError::UnknownPredicate(name.to_string()))
    }

    pub fn has_relation(&self, name: &str) -> bool {
        self.relations.contains_key(name)
    }

    pub fn schema(&self, name: &str) -> Option<&Schema> {
        self.relations.get(name).map(|r| r.schema())
    }

    /// Relation names in sorted order
    pub fn relation_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.relations.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn entity(&self, id: EntityId) -> Option<&EntityInfo> {
        self.entities.get(&id)
    }

    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    /// Total number of base facts
    pub fn len(&self) -> usize {
        self.relations.values().map(|r| r.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// String form of a value as it appears inside generated messages.
    /// Entities render as their label, falling back to `#id`.
    pub fn render(&self, value: &Value) -> String {
        match value {
            Value::Entity(id) => self
                .entity(*id)
                .map(|info| info.label.clone())
                .unwrap_or_else(|| id.to_string()),
            other => other.to_string(),
        }
    }

    /// Content digest, independent of insertion order
    pub fn fingerprint(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        let sorted: BTreeMap<&String, &Arc<Relation>> = self.relations.iter().collect();
        for (name, relation) in sorted {
            hasher.update(name.as_bytes());
            for column in &relation.schema().columns {
                hasher.update(column.name.as_bytes());
                hasher.update(column.ty.to_string().as_bytes());
            }
            let mut tuples: Vec<&Tuple> = relation.tuples().iter().collect();
            tuples.sort();
            for tuple in tuples {
                for value in tuple {
                    hasher.update(&[value.ty() as u8]);
                    hasher.update(value.to_string().as_bytes());
                    hasher.update(&[0]);
                }
            }
        }
        let entities: BTreeMap<&EntityId, &EntityInfo> = self.entities.iter().collect();
        for (id, info) in entities {
            hasher.update(&id.0.to_le_bytes());
            hasher.update(info.kind.as_bytes());
            hasher.update(info.label.as_bytes());
        }
        hex::encode(hasher.finalize().as_bytes())
    }
}

#[derive(Debug, Default)]
pub struct FactStoreBuilder {
    relations: HashMap<String, Arc<Relation>>,
    entities: HashMap<EntityId, EntityInfo>,
}

impl FactStoreBuilder {
    /// Add a base relation; every row is checked against `schema`
    pub fn add_relation<I>(&mut self, name: &str, schema: Schema, rows: I) -> EvalResult<&mut Self>
    where
        I: IntoIterator<Item = Tuple>,
    {
        if self.relations.contains_key(name) {
            return Err(EvalError::MalformedStore(format!(
                "relation `{}` defined twice",
                name
            )));
        }
        let relation = Relation::checked(name, schema, rows)?;
        self.relations.insert(name.to_string(), Arc::new(relation));
        Ok(self)
    }

    pub fn add_entity(&mut self, id: EntityId, info: EntityInfo) -> &mut Self {
        self.entities.insert(id, info);
        self
    }

    pub fn build(mut self) -> FactStore {
        if !self.entities.is_empty() {
            self.publish_entity_relations();
        }
        FactStore {
            relations: self.relations,
            entities: self.entities,
        }
    }

    fn publish_entity_relations(&mut self) {
        if !self.relations.contains_key(ENTITY_KIND) {
            let schema = Schema::new(vec![
                Column::new("entity", ColumnType::Entity),
                Column::new("kind", ColumnType::String),
            ]);
            let rows = self
                .entities
                .iter()
                .map(|(id, info)| vec![Value::Entity(*id), Value::string(&info.kind)]);
            let relation = Relation::new(ENTITY_KIND, schema, rows);
            self.relations
                .insert(ENTITY_KIND.to_string(), Arc::new(relation));
        }

        if !self.relations.contains_key(ENTITY_LOCATION) {
            let schema = Schema::new(vec![
                Column::new("entity", ColumnType::Entity),
                Column::new("file", ColumnType::String),
                Column::new("start_line", ColumnType::Int),
                Column::new("start_column", ColumnType::Int),
                Column::new("end_line", ColumnType::Int),
                Column::new("end_column", ColumnType::Int),
            ]);
            let rows = self.entities.iter().filter_map(|(id, info)| {
                info.location.as_ref().map(|loc| {
                    vec![
                        Value::Entity(*id),
                        Value::string(&loc.file),
                        Value::Int(loc.start_line as i64),
                        Value::Int(loc.start_column as i64),
                        Value::Int(loc.end_line as i64),
                        Value::Int(loc.end_column as i64),
                    ]
                })
            });
            let relation = Relation::new(ENTITY_LOCATION, schema, rows);
            self.relations
                .insert(ENTITY_LOCATION.to_string(), Arc::new(relation));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Location;

    fn sample() -> FactStore {
        let mut builder = FactStore::builder();
        builder
            .add_relation(
                "files",
                Schema::new(vec![
                    Column::new("id", ColumnType::Entity),
                    Column::new("name", ColumnType::String),
                ]),
                vec![vec![Value::entity(1), Value::string("/src/A.java")]],
            )
            .unwrap();
        builder.add_entity(
            EntityId(1),
            EntityInfo::new("file", "/src/A.java").with_location(Location {
                file: "/src/A.java".into(),
                start_line: 0,
                start_column: 0,
                end_line: 0,
                end_column: 0,
            }),
        );
        builder.build()
    }

    #[test]
    fn test_unknown_relation() {
        let store = sample();
        assert!(store.get_relation("files").is_ok());
        assert_eq!(
            store.get_relation("methods").unwrap_err(),
            EvalError::UnknownPredicate("methods".into())
        );
    }

    #[test]
    fn test_entity_relations_published() {
        let store = sample();
        let kinds = store.get_relation(ENTITY_KIND).unwrap();
        assert!(kinds.contains(&[Value::entity(1), Value::string("file")]));
        assert_eq!(store.get_relation(ENTITY_LOCATION).unwrap().len(), 1);
        assert_eq!(store.render(&Value::entity(1)), "/src/A.java");
        assert_eq!(store.render(&Value::entity(9)), "#9");
    }

    #[test]
    fn test_duplicate_relation_rejected() {
        let mut builder = FactStore::builder();
        let schema = Schema::of_types(&[ColumnType::Int]);
        builder.add_relation("r", schema.clone(), vec![]).unwrap();
        assert!(matches!(
            builder.add_relation("r", schema, vec![]),
            Err(EvalError::MalformedStore(_))
        ));
    }

    #[test]
    fn test_fingerprint_is_order_independent() {
        let schema = Schema::of_types(&[ColumnType::Int]);
        let mut a = FactStore::builder();
        a.add_relation("r", schema.clone(), vec![vec![Value::Int(1)], vec![Value::Int(2)]])
            .unwrap();
        let mut b = FactStore::builder();
        b.add_relation("r", schema, vec![vec![Value::Int(2)], vec![Value::Int(1)]])
            .unwrap();
        assert_eq!(a.build().fingerprint(), b.build().fingerprint());
        assert_ne!(sample().fingerprint(), FactStore::default().fingerprint());
    }
}
