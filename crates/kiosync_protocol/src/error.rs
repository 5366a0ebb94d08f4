//! Error types for the protocol crate.

use crate::endpoint::EndpointId;
use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors raised while translating between endpoint wire shapes.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// A response did not have the shape the endpoint is configured for.
    #[error("protocol mismatch from {endpoint} for collection {collection}: {reason}")]
    ProtocolMismatch {
        /// Endpoint that produced the response.
        endpoint: EndpointId,
        /// Collection the response belongs to.
        collection: String,
        /// What was wrong with it.
        reason: String,
    },

    /// The collection has no sync configuration.
    #[error("unknown collection: {0}")]
    UnknownCollection(String),

    /// JSON (de)serialization failure.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ProtocolError {
    /// Creates a protocol mismatch error.
    pub fn mismatch(
        endpoint: EndpointId,
        collection: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::ProtocolMismatch {
            endpoint,
            collection: collection.into(),
            reason: reason.into(),
        }
    }

    /// Returns true for response-shape errors.
    pub fn is_mismatch(&self) -> bool {
        matches!(self, ProtocolError::ProtocolMismatch { .. })
    }
}
