// SPDX-License-Identifier: PMPL-1.0-or-later

//! Hash indices over a subset of a relation's columns

use crate::types::{Tuple, Value};
use std::collections::HashMap;

/// Maps a key (the values of the indexed columns) to the row ids holding it
#[derive(Debug, Clone)]
pub struct HashIndex {
    columns: Vec<usize>,
    buckets: HashMap<Vec<Value>, Vec<usize>>,
}

impl HashIndex {
    pub fn build(tuples: &[Tuple], columns: &[usize]) -> Self {
        let mut buckets: HashMap<Vec<Value>, Vec<usize>> = HashMap::new();
        for (row, tuple) in tuples.iter().enumerate() {
            buckets.entry(key_of(tuple, columns)).or_default().push(row);
        }
        Self {
            columns: columns.to_vec(),
            buckets,
        }
    }

    /// Index `tuples[start..]`, the rows appended since the last build or
    /// extension
    pub(crate) fn extend(&mut self, tuples: &[Tuple], start: usize) {
        for (row, tuple) in tuples.iter().enumerate().skip(start) {
            self.buckets
                .entry(key_of(tuple, &self.columns))
                .or_default()
                .push(row);
        }
    }

    pub fn columns(&self) -> &[usize] {
        &self.columns
    }

    /// Row ids whose indexed columns equal `key`
    pub fn get(&self, key: &[Value]) -> &[usize] {
        self.buckets.get(key).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn contains_key(&self, key: &[Value]) -> bool {
        self.buckets.contains_key(key)
    }

    /// Number of distinct keys
    pub fn key_count(&self) -> usize {
        self.buckets.len()
    }
}

/// Extract the values at `columns` from a tuple
pub fn key_of(tuple: &[Value], columns: &[usize]) -> Vec<Value> {
    columns.iter().map(|&c| tuple[c].clone()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_index_groups_rows() {
        let tuples = vec![
            vec![Value::Int(1), Value::string("a")],
            vec![Value::Int(2), Value::string("a")],
            vec![Value::Int(3), Value::string("b")],
        ];
        let index = HashIndex::build(&tuples, &[1]);
        assert_eq!(index.get(&[Value::string("a")]), &[0, 1]);
        assert_eq!(index.get(&[Value::string("b")]), &[2]);
        assert!(index.get(&[Value::string("c")]).is_empty());
        assert_eq!(index.key_count(), 2);
    }

    #[test]
    fn test_extend_indexes_only_new_rows() {
        let mut tuples = vec![vec![Value::Int(1), Value::Int(10)]];
        let mut index = HashIndex::build(&tuples, &[0]);
        tuples.push(vec![Value::Int(2), Value::Int(20)]);
        tuples.push(vec![Value::Int(1), Value::Int(11)]);
        index.extend(&tuples, 1);
        assert_eq!(index.get(&[Value::Int(1)]), &[0, 2]);
        assert_eq!(index.get(&[Value::Int(2)]), &[1]);
        assert_eq!(index.key_count(), 2);
    }

    #[test]
    fn test_empty_key_indexes_everything() {
        let tuples = vec![vec![Value::Int(1)], vec![Value::Int(2)]];
        let index = HashIndex::build(&tuples, &[]);
        assert_eq!(index.get(&[]), &[0, 1]);
    }
}
