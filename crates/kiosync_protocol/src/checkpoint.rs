//! Sync progress markers.

use crate::endpoint::EndpointId;
use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};
use std::fmt;

/// A server-side ordering cursor.
///
/// Endpoints issue cursors as JSON strings or numbers and expect them back
/// in the same form, so the JSON type is kept alongside the value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Cursor {
    /// A string cursor, such as an RFC 3339 timestamp.
    Text(String),
    /// A numeric cursor, such as a sequence number or epoch seconds.
    Number(Number),
}

impl Cursor {
    /// Reads a cursor from a JSON scalar. Returns `None` for anything else.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::String(s) => Some(Self::Text(s.clone())),
            Value::Number(n) => Some(Self::Number(n.clone())),
            _ => None,
        }
    }

    /// Renders the cursor as the JSON scalar it was read from.
    pub fn to_value(&self) -> Value {
        match self {
            Self::Text(s) => Value::String(s.clone()),
            Self::Number(n) => Value::Number(n.clone()),
        }
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text(s) => f.write_str(s),
            Self::Number(n) => write!(f, "{n}"),
        }
    }
}

impl From<&str> for Cursor {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<String> for Cursor {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<u64> for Cursor {
    fn from(n: u64) -> Self {
        Self::Number(n.into())
    }
}

impl From<i64> for Cursor {
    fn from(n: i64) -> Self {
        Self::Number(n.into())
    }
}

/// A marker of sync progress for one collection against one endpoint.
///
/// The cursor value is opaque to callers. It is tagged with the endpoint
/// that issued it, since endpoints name and order their cursors
/// independently and a cursor from one means nothing to the other.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Endpoint that issued this checkpoint.
    pub endpoint: EndpointId,
    /// Id of the last document included in the page.
    pub id: String,
    /// Server-side ordering cursor.
    pub cursor: Cursor,
}

impl Checkpoint {
    /// Creates a checkpoint.
    pub fn new(endpoint: EndpointId, id: impl Into<String>, cursor: impl Into<Cursor>) -> Self {
        Self {
            endpoint,
            id: id.into(),
            cursor: cursor.into(),
        }
    }

    /// Returns true if this checkpoint was issued by `endpoint`.
    pub fn belongs_to(&self, endpoint: EndpointId) -> bool {
        self.endpoint == endpoint
    }
}
