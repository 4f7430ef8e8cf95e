//! Positional "proto" values returned by the batch RPC endpoint.
//!
//! These are plain JSON arrays whose meaning depends entirely on element
//! position; there is no object form. Accessors never fail on short arrays:
//! a missing trailing element reads as `Null`.

use serde::{Deserialize, Serialize};
use serde_json::Number;
use std::fmt;

static NULL: Proto = Proto::Null;

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Proto {
    #[default]
    Null,
    Bool(bool),
    Number(Number),
    String(String),
    Array(Vec<Proto>),
}

impl Proto {
    pub fn array<I>(items: I) -> Self
    where
        I: IntoIterator<Item = Proto>,
    {
        Proto::Array(items.into_iter().collect())
    }

    /// Decode JSON text. Objects anywhere in the tree are rejected.
    pub fn from_json_str(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn to_json_string(&self) -> String {
        // Serializing an in-memory Proto cannot fail: no maps, no non-string keys.
        serde_json::to_string(self).unwrap_or_else(|_| "null".to_string())
    }

    /// Element `index` of an array, or `Null` when absent or when `self` is not an array.
    pub fn at(&self, index: usize) -> &Proto {
        match self {
            Proto::Array(items) => items.get(index).unwrap_or(&NULL),
            _ => &NULL,
        }
    }

    /// Walk nested arrays by position.
    pub fn path(&self, indices: &[usize]) -> &Proto {
        indices.iter().fold(self, |node, &i| node.at(i))
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Proto::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Proto::String(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Proto::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Proto::Number(n) => n.as_i64(),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Proto::Number(n) => n.as_u64(),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Proto::Number(n) => n.as_f64(),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Proto]> {
        match self {
            Proto::Array(items) => Some(items.as_slice()),
            _ => None,
        }
    }

    /// Array elements, or an empty slice for anything else (including `Null`).
    pub fn items(&self) -> &[Proto] {
        self.as_array().unwrap_or(&[])
    }

    /// Short type label used in error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Proto::Null => "null",
            Proto::Bool(_) => "boolean",
            Proto::Number(_) => "number",
            Proto::String(_) => "string",
            Proto::Array(_) => "array",
        }
    }
}

impl fmt::Display for Proto {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_json_string())
    }
}

impl From<&str> for Proto {
    fn from(value: &str) -> Self {
        Proto::String(value.to_string())
    }
}

impl From<String> for Proto {
    fn from(value: String) -> Self {
        Proto::String(value)
    }
}

impl From<bool> for Proto {
    fn from(value: bool) -> Self {
        Proto::Bool(value)
    }
}

impl From<i64> for Proto {
    fn from(value: i64) -> Self {
        Proto::Number(value.into())
    }
}

impl From<u64> for Proto {
    fn from(value: u64) -> Self {
        Proto::Number(value.into())
    }
}

impl From<Vec<Proto>> for Proto {
    fn from(value: Vec<Proto>) -> Self {
        Proto::Array(value)
    }
}

impl<T: Into<Proto>> From<Option<T>> for Proto {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(Proto::Null)
    }
}
