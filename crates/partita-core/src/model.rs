//! Keys, records, and the identifiers that tie them to partitions.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

use crate::error::{PdalError, PdalResult};

/// A caller-supplied record key.
///
/// Keys arrive either as integers or as text. Text that parses as an
/// integer behaves exactly like the integer it spells, both for routing
/// and for storage, so `"42"` and `42` name the same record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Key {
    Integer(i64),
    Text(String),
}

impl Key {
    /// Build a key from raw text, preferring the integer form when the
    /// text parses as one.
    pub fn parse(raw: &str) -> Self {
        match raw.trim().parse::<i64>() {
            Ok(v) => Key::Integer(v),
            Err(_) => Key::Text(raw.to_string()),
        }
    }

    /// The integer this key stands for, if any.
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Key::Integer(v) => Some(*v),
            Key::Text(s) => s.trim().parse().ok(),
        }
    }

    /// The form the key is stored under.
    pub fn canonical(&self) -> String {
        match (self, self.as_integer()) {
            (_, Some(v)) => v.to_string(),
            (Key::Text(s), None) => s.clone(),
            (Key::Integer(v), None) => v.to_string(),
        }
    }

    /// Whether two keys address the same record.
    pub fn same_record(&self, other: &Key) -> bool {
        self.canonical() == other.canonical()
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Key::Integer(v) => write!(f, "{}", v),
            Key::Text(s) => write!(f, "{:?}", s),
        }
    }
}

impl From<i64> for Key {
    fn from(v: i64) -> Self {
        Key::Integer(v)
    }
}

impl From<&str> for Key {
    fn from(s: &str) -> Self {
        Key::Text(s.to_string())
    }
}

impl From<String> for Key {
    fn from(s: String) -> Self {
        Key::Text(s)
    }
}

/// The payload of a write.
///
/// Only `id` has meaning to the access layer; the remaining attributes are
/// handed to the store untouched. In JSON the attributes sit beside `id`:
///
/// ```json
/// { "id": 1, "name": "Alice", "email": "a@example.com" }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: Key,
    #[serde(flatten)]
    pub attributes: Map<String, Value>,
}

impl Record {
    pub fn new(id: impl Into<Key>) -> Self {
        Self {
            id: id.into(),
            attributes: Map::new(),
        }
    }

    /// Add or replace one attribute.
    pub fn with(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.attributes.insert(name.to_string(), value.into());
        self
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.attributes.get(name)
    }

    /// Parse a record out of a JSON object that carries an `id` field.
    pub fn from_json(value: Value) -> PdalResult<Self> {
        let Value::Object(mut fields) = value else {
            return Err(PdalError::InvalidRecord("record must be a JSON object".to_string()));
        };
        let id = match fields.remove("id") {
            Some(Value::Number(n)) => n
                .as_i64()
                .map(Key::Integer)
                .ok_or_else(|| PdalError::InvalidRecord(format!("id {} is not an integer", n)))?,
            Some(Value::String(s)) if !s.is_empty() => Key::Text(s),
            Some(other) => {
                return Err(PdalError::InvalidRecord(format!(
                    "id must be an integer or non-empty string, got {}",
                    other
                )));
            }
            None => return Err(PdalError::InvalidRecord("missing field: id".to_string())),
        };
        Ok(Self {
            id,
            attributes: fields,
        })
    }

    /// Attributes serialized as a JSON object, without the id.
    pub fn attributes_json(&self) -> String {
        Value::Object(self.attributes.clone()).to_string()
    }
}

/// Index of one partition, always in `[0, N)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct PartitionId(pub u32);

impl PartitionId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which store of a partition an endpoint is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Primary,
    Replica,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Primary => write!(f, "primary"),
            Role::Replica => write!(f, "replica"),
        }
    }
}

/// What an operation does to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
}
