// SPDX-License-Identifier: PMPL-1.0-or-later

//! Immutable, deduplicated relations with lazily built indices

use crate::error::{EvalError, EvalResult};
use crate::store::index::HashIndex;
use crate::types::{Schema, Tuple, Value};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

/// A named set of tuples sharing one schema.
///
/// Tuples never change once the relation is shared. Indices are the only
/// interior state: each one is built the first time a lookup needs it and
/// kept for the lifetime of the relation. An owned relation can still grow
/// through [`Relation::extended`], which carries its indices along.
pub struct Relation {
    name: String,
    schema: Schema,
    tuples: Vec<Tuple>,
    indices: RwLock<HashMap<Vec<usize>, Arc<HashIndex>>>,
    /// Rows hashed into indices so far, builds and extensions together
    indexed_rows: AtomicUsize,
}

impl Relation {
    /// Build a relation, dropping duplicate tuples (first occurrence wins)
    pub fn new<I>(name: &str, schema: Schema, tuples: I) -> Self
    where
        I: IntoIterator<Item = Tuple>,
    {
        let mut seen = HashSet::new();
        let tuples = tuples
            .into_iter()
            .filter(|t| seen.insert(t.clone()))
            .collect();
        Self::from_distinct(name, schema, tuples)
    }

    /// Build a relation from tuples already known to be distinct
    pub(crate) fn from_distinct(name: &str, schema: Schema, tuples: Vec<Tuple>) -> Self {
        Self {
            name: name.to_string(),
            schema,
            tuples,
            indices: RwLock::new(HashMap::new()),
            indexed_rows: AtomicUsize::new(0),
        }
    }

    /// Like [`Relation::new`] but every row is checked against the schema
    pub fn checked<I>(name: &str, schema: Schema, rows: I) -> EvalResult<Self>
    where
        I: IntoIterator<Item = Tuple>,
    {
        let mut tuples = Vec::new();
        for row in rows {
            if row.len() != schema.arity() {
                return Err(EvalError::ArityMismatch {
                    predicate: name.to_string(),
                    expected: schema.arity(),
                    found: row.len(),
                });
            }
            for (value, column) in row.iter().zip(&schema.columns) {
                if value.ty() != column.ty {
                    return Err(EvalError::type_mismatch(
                        format!("column `{}` of `{}`", column.name, name),
                        column.ty,
                        value.ty(),
                    ));
                }
            }
            tuples.push(row);
        }
        Ok(Self::new(name, schema, tuples))
    }

    pub fn empty(name: &str, schema: Schema) -> Self {
        Self::from_distinct(name, schema, Vec::new())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn arity(&self) -> usize {
        self.schema.arity()
    }

    pub fn len(&self) -> usize {
        self.tuples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tuples.is_empty()
    }

    pub fn tuples(&self) -> &[Tuple] {
        &self.tuples
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Tuple> {
        self.tuples.iter()
    }

    pub fn column(&self, idx: usize) -> impl Iterator<Item = &Value> + '_ {
        self.tuples.iter().map(move |t| &t[idx])
    }

    /// Membership test over all columns
    pub fn contains(&self, tuple: &[Value]) -> bool {
        if tuple.len() != self.arity() {
            return false;
        }
        let all: Vec<usize> = (0..self.arity()).collect();
        self.index(&all).contains_key(tuple)
    }

    /// Index on `columns`, building and caching it on first use
    pub fn index(&self, columns: &[usize]) -> Arc<HashIndex> {
        if let Some(index) = self.read_indices().get(columns) {
            return Arc::clone(index);
        }
        let mut indices = self
            .indices
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let index = indices.entry(columns.to_vec()).or_insert_with(|| {
            self.indexed_rows.fetch_add(self.tuples.len(), Ordering::Relaxed);
            Arc::new(HashIndex::build(&self.tuples, columns))
        });
        Arc::clone(index)
    }

    /// Append tuples that are distinct from each other and from every tuple
    /// already held. Cached indices are extended with the new rows only.
    pub(crate) fn extended(mut self, fresh: Vec<Tuple>) -> Relation {
        let start = self.tuples.len();
        self.tuples.extend(fresh);
        let added = self.tuples.len() - start;
        let indices = self
            .indices
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        for index in indices.values_mut() {
            Arc::make_mut(index).extend(&self.tuples, start);
        }
        *self.indexed_rows.get_mut() += added * indices.len();
        self
    }

    pub fn has_index(&self, columns: &[usize]) -> bool {
        self.read_indices().contains_key(columns)
    }

    pub fn index_count(&self) -> usize {
        self.read_indices().len()
    }

    /// Total rows hashed into this relation's indices over its lifetime
    pub fn indexed_rows(&self) -> usize {
        self.indexed_rows.load(Ordering::Relaxed)
    }

    /// Copy of this relation under another name, without its indices
    pub fn renamed(&self, name: &str) -> Relation {
        Self::from_distinct(name, self.schema.clone(), self.tuples.clone())
    }

    /// Set equality, ignoring tuple order
    pub fn same_tuples(&self, other: &Relation) -> bool {
        if self.len() != other.len() {
            return false;
        }
        let mine: HashSet<&Tuple> = self.tuples.iter().collect();
        other.tuples.iter().all(|t| mine.contains(t))
    }

    fn read_indices(
        &self,
    ) -> std::sync::RwLockReadGuard<'_, HashMap<Vec<usize>, Arc<HashIndex>>> {
        self.indices
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl fmt::Debug for Relation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Relation")
            .field("name", &self.name)
            .field("arity", &self.arity())
            .field("len", &self.len())
            .field("indices", &self.index_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ColumnType;

    fn edges() -> Relation {
        Relation::new(
            "edge",
            Schema::of_types(&[ColumnType::Int, ColumnType::Int]),
            vec![
                vec![Value::Int(1), Value::Int(2)],
                vec![Value::Int(2), Value::Int(3)],
                vec![Value::Int(1), Value::Int(2)],
            ],
        )
    }

    #[test]
    fn test_dedup_on_construction() {
        let rel = edges();
        assert_eq!(rel.len(), 2);
        assert!(rel.contains(&[Value::Int(2), Value::Int(3)]));
        assert!(!rel.contains(&[Value::Int(3), Value::Int(2)]));
    }

    #[test]
    fn test_indices_are_lazy_and_cached() {
        let rel = edges();
        assert_eq!(rel.index_count(), 0);
        assert!(!rel.has_index(&[0]));

        let first = rel.index(&[0]);
        let second = rel.index(&[0]);
        assert!(Arc::ptr_eq(&first, &second));
        assert!(rel.has_index(&[0]));
        assert_eq!(rel.index_count(), 1);

        rel.index(&[1]);
        assert_eq!(rel.index_count(), 2);
    }

    #[test]
    fn test_extended_keeps_indices_incremental() {
        let rel = edges();
        rel.index(&[0]);
        assert!(rel.contains(&[Value::Int(1), Value::Int(2)]));
        assert_eq!(rel.indexed_rows(), 4);

        let rel = rel.extended(vec![vec![Value::Int(3), Value::Int(4)]]);
        assert_eq!(rel.len(), 3);
        assert_eq!(rel.index_count(), 2);
        assert_eq!(rel.indexed_rows(), 6);
        assert_eq!(rel.index(&[0]).get(&[Value::Int(3)]), &[2]);
        assert!(rel.contains(&[Value::Int(3), Value::Int(4)]));
        assert_eq!(rel.indexed_rows(), 6);
    }

    #[test]
    fn test_checked_rejects_bad_rows() {
        let schema = Schema::of_types(&[ColumnType::Entity, ColumnType::String]);
        let err = Relation::checked("files", schema.clone(), vec![vec![Value::entity(1)]])
            .unwrap_err();
        assert!(matches!(err, EvalError::ArityMismatch { expected: 2, found: 1, .. }));

        let err = Relation::checked(
            "files",
            schema,
            vec![vec![Value::Int(1), Value::string("a.java")]],
        )
        .unwrap_err();
        assert!(matches!(err, EvalError::TypeMismatch { .. }));
    }
}
