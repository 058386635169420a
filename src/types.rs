// SPDX-License-Identifier: PMPL-1.0-or-later

//! Core value types shared by the fact store, the evaluator and the
//! result materializer.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Opaque, stable identifier of an extracted source construct
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(pub u64);

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Column types a relation may carry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    Entity,
    String,
    Int,
    Bool,
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ColumnType::Entity => "entity",
            ColumnType::String => "string",
            ColumnType::Int => "int",
            ColumnType::Bool => "bool",
        };
        f.write_str(name)
    }
}

/// A single typed column value
///
/// Strings are reference counted so that joins and projections copy a
/// pointer rather than the text.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Value {
    Entity(EntityId),
    String(Arc<str>),
    Int(i64),
    Bool(bool),
}

impl Value {
    pub fn entity(id: u64) -> Self {
        Value::Entity(EntityId(id))
    }

    pub fn string(s: &str) -> Self {
        Value::String(Arc::from(s))
    }

    pub fn ty(&self) -> ColumnType {
        match self {
            Value::Entity(_) => ColumnType::Entity,
            Value::String(_) => ColumnType::String,
            Value::Int(_) => ColumnType::Int,
            Value::Bool(_) => ColumnType::Bool,
        }
    }

    pub fn as_entity(&self) -> Option<EntityId> {
        match self {
            Value::Entity(id) => Some(*id),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Entity(id) => write!(f, "{}", id),
            Value::String(s) => f.write_str(s),
            Value::Int(i) => write!(f, "{}", i),
            Value::Bool(b) => write!(f, "{}", b),
        }
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::string(s)
    }
}

impl From<EntityId> for Value {
    fn from(id: EntityId) -> Self {
        Value::Entity(id)
    }
}

/// An ordered, fixed-length row of values
pub type Tuple = Vec<Value>;

/// Source span of an entity
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Location {
    pub file: String,
    pub start_line: u32,
    pub start_column: u32,
    pub end_line: u32,
    pub end_column: u32,
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}-{}:{}",
            self.file, self.start_line, self.start_column, self.end_line, self.end_column
        )
    }
}

/// Attributes the extractor records for every entity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityInfo {
    /// Syntactic category, e.g. `file`, `method`, `extraction_error`
    pub kind: String,
    /// String form used when the entity is interpolated into a message
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<Location>,
}

impl EntityInfo {
    pub fn new(kind: &str, label: &str) -> Self {
        Self {
            kind: kind.to_string(),
            label: label.to_string(),
            location: None,
        }
    }

    pub fn with_location(mut self, location: Location) -> Self {
        self.location = Some(location);
        self
    }
}

/// A named, typed column of a relation schema
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: ColumnType,
}

impl Column {
    pub fn new(name: &str, ty: ColumnType) -> Self {
        Self {
            name: name.to_string(),
            ty,
        }
    }
}

/// Ordered column list of a relation
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Schema {
    pub columns: Vec<Column>,
}

impl Schema {
    pub fn new(columns: Vec<Column>) -> Self {
        Self { columns }
    }

    /// Schema with generated column names `c0..cn`
    pub fn of_types(types: &[ColumnType]) -> Self {
        Self {
            columns: types
                .iter()
                .enumerate()
                .map(|(i, ty)| Column::new(&format!("c{}", i), *ty))
                .collect(),
        }
    }

    pub fn arity(&self) -> usize {
        self.columns.len()
    }

    pub fn types(&self) -> Vec<ColumnType> {
        self.columns.iter().map(|c| c.ty).collect()
    }

    pub fn ty(&self, idx: usize) -> Option<ColumnType> {
        self.columns.get(idx).map(|c| c.ty)
    }

    /// Concatenate two schemas, as produced by a join
    pub fn concat(&self, other: &Schema) -> Schema {
        let mut columns = self.columns.clone();
        columns.extend(other.columns.iter().cloned());
        Schema { columns }
    }

    /// Check that a tuple conforms to this schema
    pub fn accepts(&self, tuple: &[Value]) -> bool {
        tuple.len() == self.columns.len()
            && tuple
                .iter()
                .zip(&self.columns)
                .all(|(value, column)| value.ty() == column.ty)
    }
}
