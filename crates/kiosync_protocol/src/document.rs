//! Documents exchanged with endpoints and locally changed records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Wire key for the document id.
pub(crate) const ID_KEY: &str = "id";
/// Wire key for the tombstone marker.
pub(crate) const DELETED_KEY: &str = "_deleted";
/// Wire key for the client-side modification time.
pub(crate) const CLIENT_UPDATED_KEY: &str = "client_updated_at";
/// Wire key for the server-side modification time.
pub(crate) const SERVER_UPDATED_KEY: &str = "server_updated_at";

/// A synchronized document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    /// Document id.
    pub id: String,
    /// Document body (a JSON object, without the sync metadata keys).
    pub data: Value,
    /// Whether the document is a tombstone.
    pub deleted: bool,
    /// Last modification on the kiosk.
    pub client_updated_at: Option<DateTime<Utc>>,
    /// Last modification accepted by the server.
    pub server_updated_at: Option<DateTime<Utc>>,
}

impl Document {
    /// Creates a live document with the given body.
    pub fn new(id: impl Into<String>, data: Value) -> Self {
        Self {
            id: id.into(),
            data,
            deleted: false,
            client_updated_at: None,
            server_updated_at: None,
        }
    }

    /// Sets the client-side modification time.
    pub fn with_client_updated_at(mut self, at: DateTime<Utc>) -> Self {
        self.client_updated_at = Some(at);
        self
    }

    /// Sets the server-side modification time.
    pub fn with_server_updated_at(mut self, at: DateTime<Utc>) -> Self {
        self.server_updated_at = Some(at);
        self
    }

    /// Returns a tombstone copy of this document.
    pub fn into_tombstone(mut self) -> Self {
        self.deleted = true;
        self
    }

    /// Parses a document from its wire object.
    ///
    /// Returns `None` if the value is not an object or has no string id.
    /// Unparseable timestamps are dropped rather than rejected.
    pub fn from_wire(value: &Value) -> Option<Self> {
        let object = value.as_object()?;
        let id = object.get(ID_KEY)?.as_str()?.to_string();
        let deleted = object
            .get(DELETED_KEY)
            .and_then(Value::as_bool)
            .unwrap_or(false);

        let mut data = Map::new();
        for (key, field) in object {
            if !is_meta_key(key) {
                data.insert(key.clone(), field.clone());
            }
        }

        Some(Self {
            id,
            data: Value::Object(data),
            deleted,
            client_updated_at: parse_timestamp(object.get(CLIENT_UPDATED_KEY)),
            server_updated_at: parse_timestamp(object.get(SERVER_UPDATED_KEY)),
        })
    }

    /// Renders the wire object for this document.
    pub fn to_wire(&self) -> Value {
        let mut object = match &self.data {
            Value::Object(map) => map.clone(),
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("value".into(), other.clone());
                map
            }
        };
        object.insert(ID_KEY.into(), Value::String(self.id.clone()));
        object.insert(DELETED_KEY.into(), Value::Bool(self.deleted));
        object.insert(CLIENT_UPDATED_KEY.into(), timestamp_value(self.client_updated_at));
        object.insert(SERVER_UPDATED_KEY.into(), timestamp_value(self.server_updated_at));
        Value::Object(object)
    }
}

/// A locally changed document waiting to be pushed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalChange {
    /// New local state of the document.
    pub document: Document,
    /// State the kiosk believes the server currently holds.
    pub assumed_prior: Option<Document>,
}

impl LocalChange {
    /// Creates a change with a known prior state.
    pub fn update(document: Document, assumed_prior: Document) -> Self {
        Self {
            document,
            assumed_prior: Some(assumed_prior),
        }
    }

    /// Creates a change with no assumed prior state.
    pub fn without_prior(document: Document) -> Self {
        Self {
            document,
            assumed_prior: None,
        }
    }

    /// Returns true if this change is pushed as a tombstone.
    ///
    /// A change with a null assumed prior state is always a delete on the
    /// wire, as is a change whose new state is already deleted.
    pub fn is_tombstone(&self) -> bool {
        self.assumed_prior.is_none() || self.document.deleted
    }
}

fn is_meta_key(key: &str) -> bool {
    matches!(
        key,
        ID_KEY | DELETED_KEY | CLIENT_UPDATED_KEY | SERVER_UPDATED_KEY
    )
}

fn parse_timestamp(value: Option<&Value>) -> Option<DateTime<Utc>> {
    value
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

fn timestamp_value(at: Option<DateTime<Utc>>) -> Value {
    at.map(|dt| Value::String(dt.to_rfc3339()))
        .unwrap_or(Value::Null)
}
