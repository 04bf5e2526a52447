//! Row identity and the in-memory row view.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// An entity row: opaque fields plus a mandatory `id` attribute.
pub type Row = serde_json::Map<String, Value>;

/// Stable row identifier extracted from a row's `id` field.
///
/// Integer and string ids are both accepted; ids of mixed kinds within one
/// collection order integers before strings.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RowId {
    Int(i64),
    Str(String),
}

impl RowId {
    /// Extract the id of `row`, rejecting rows without a usable `id` field.
    pub fn of(row: &Row) -> Result<RowId, RowError> {
        let value = row.get("id").ok_or(RowError::MissingId)?;
        RowId::from_value(value)
    }

    pub fn from_value(value: &Value) -> Result<RowId, RowError> {
        match value {
            Value::Number(n) => n
                .as_i64()
                .map(RowId::Int)
                .ok_or_else(|| RowError::UnsupportedId {
                    found: value.to_string(),
                }),
            Value::String(s) => Ok(RowId::Str(s.clone())),
            other => Err(RowError::UnsupportedId {
                found: other.to_string(),
            }),
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            RowId::Int(n) => Value::from(*n),
            RowId::Str(s) => Value::from(s.clone()),
        }
    }
}

impl fmt::Display for RowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RowId::Int(n) => write!(f, "{n}"),
            RowId::Str(s) => write!(f, "{s}"),
        }
    }
}

impl From<i64> for RowId {
    fn from(n: i64) -> Self {
        RowId::Int(n)
    }
}

impl From<&str> for RowId {
    fn from(s: &str) -> Self {
        RowId::Str(s.to_string())
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum RowError {
    #[error("row has no id field")]
    MissingId,
    #[error("row id must be an integer or string, found {found}")]
    UnsupportedId { found: String },
}

/// The committed row view for one collection, keyed by row id.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RowSet {
    rows: BTreeMap<RowId, Row>,
}

impl RowSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Upsert `row` under its own id. Returns the displaced row, if any.
    pub fn insert(&mut self, row: Row) -> Result<Option<Row>, RowError> {
        let id = RowId::of(&row)?;
        Ok(self.rows.insert(id, row))
    }

    pub fn insert_at(&mut self, id: RowId, row: Row) -> Option<Row> {
        self.rows.insert(id, row)
    }

    pub fn remove(&mut self, id: &RowId) -> Option<Row> {
        self.rows.remove(id)
    }

    pub fn get(&self, id: &RowId) -> Option<&Row> {
        self.rows.get(id)
    }

    pub fn contains(&self, id: &RowId) -> bool {
        self.rows.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn ids(&self) -> Vec<RowId> {
        self.rows.keys().cloned().collect()
    }

    /// Clone out all rows in id order.
    pub fn rows(&self) -> Vec<Row> {
        self.rows.values().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&RowId, &Row)> {
        self.rows.iter()
    }
}
