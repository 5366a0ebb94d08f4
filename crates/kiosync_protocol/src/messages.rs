//! Pull and push envelopes.

use crate::checkpoint::Checkpoint;
use crate::collection::CollectionId;
use crate::document::Document;
use crate::endpoint::EndpointId;
use serde_json::{json, Map, Value};

/// A pull request addressed to one endpoint.
///
/// Built by [`CheckpointAdapter::build_pull_request`](crate::CheckpointAdapter::build_pull_request);
/// the cursor field name is already the target endpoint's.
#[derive(Debug, Clone, PartialEq)]
pub struct PullRequest {
    /// Collection being pulled.
    pub collection: CollectionId,
    /// Endpoint the request is addressed to.
    pub endpoint: EndpointId,
    /// Name of the cursor field the endpoint expects.
    pub cursor_field: String,
    /// Checkpoint to resume from, or `None` for a full pull.
    pub checkpoint: Option<Checkpoint>,
    /// Maximum number of documents to return.
    pub limit: u32,
}

impl PullRequest {
    /// Renders the request body.
    ///
    /// Only the target endpoint's cursor field is emitted.
    pub fn to_json(&self) -> Value {
        let checkpoint = match &self.checkpoint {
            Some(cp) => {
                let mut object = Map::new();
                object.insert("id".into(), Value::String(cp.id.clone()));
                object.insert(self.cursor_field.clone(), cp.cursor.to_value());
                Value::Object(object)
            }
            None => Value::Null,
        };

        json!({
            "checkpoint": checkpoint,
            "limit": self.limit,
        })
    }

    /// Returns true if this request starts from the beginning.
    pub fn is_full_pull(&self) -> bool {
        self.checkpoint.is_none()
    }
}

/// One row of a push request.
#[derive(Debug, Clone, PartialEq)]
pub struct PushRow {
    /// New document state (a tombstone for deletes).
    pub document: Document,
    /// State the kiosk assumes the server holds.
    pub assumed_prior: Option<Document>,
}

impl PushRow {
    /// Renders the row.
    pub fn to_json(&self) -> Value {
        json!({
            "new_document_state": self.document.to_wire(),
            "assumed_prior_state": self
                .assumed_prior
                .as_ref()
                .map(Document::to_wire)
                .unwrap_or(Value::Null),
        })
    }
}

/// A batch of local changes for one collection.
#[derive(Debug, Clone, PartialEq)]
pub struct PushRequest {
    /// Collection being pushed.
    pub collection: CollectionId,
    /// Changed documents.
    pub rows: Vec<PushRow>,
}

impl PushRequest {
    /// Renders the request body.
    pub fn to_json(&self) -> Value {
        json!({
            "rows": self.rows.iter().map(PushRow::to_json).collect::<Vec<_>>(),
        })
    }

    /// Returns true if there is nothing to push.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Number of rows in the batch.
    pub fn len(&self) -> usize {
        self.rows.len()
    }
}

/// A pull response reduced to the uniform shape both endpoints map onto.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PullEnvelope {
    /// Pulled documents.
    pub documents: Vec<Document>,
    /// New checkpoint, or `None` if the endpoint had nothing newer.
    pub checkpoint: Option<Checkpoint>,
}

impl PullEnvelope {
    /// Returns true if no documents were pulled.
    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    /// Number of pulled documents.
    pub fn len(&self) -> usize {
        self.documents.len()
    }
}
