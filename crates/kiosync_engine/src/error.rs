//! Error types for the sync engine.

use kiosync_protocol::{CollectionId, EndpointId, ProtocolError};
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur in the sync engine.
///
/// Probe and session errors are normally absorbed into state (health
/// counters, `was_started`) by the component that sees them; only
/// configuration errors and protocol mismatches are expected to reach
/// application code.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Invalid or missing configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// An endpoint returned a response of the wrong shape.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// A liveness probe did not answer within its timeout.
    #[error("probe of {endpoint} timed out")]
    ProbeTimeout {
        /// Probed endpoint.
        endpoint: EndpointId,
    },

    /// A liveness probe failed.
    #[error("probe of {endpoint} failed: {message}")]
    ProbeFailure {
        /// Probed endpoint.
        endpoint: EndpointId,
        /// Failure description.
        message: String,
    },

    /// A session failed to start.
    #[error("failed to start {collection} on {endpoint}: {message}")]
    SessionStart {
        /// Collection of the session.
        collection: CollectionId,
        /// Endpoint of the session.
        endpoint: EndpointId,
        /// Failure description.
        message: String,
    },

    /// A session failed to cancel.
    #[error("failed to cancel {collection} on {endpoint}: {message}")]
    SessionCancel {
        /// Collection of the session.
        collection: CollectionId,
        /// Endpoint of the session.
        endpoint: EndpointId,
        /// Failure description.
        message: String,
    },

    /// The transport had already released the session's resources.
    #[error("session resources already released")]
    AlreadyReleased,

    /// The session has not been started.
    #[error("session {collection} on {endpoint} was never started")]
    SessionNotStarted {
        /// Collection of the session.
        collection: CollectionId,
        /// Endpoint of the session.
        endpoint: EndpointId,
    },

    /// The collection's session against the other endpoint is still started.
    #[error("{collection} is still started on {active}")]
    PeerSessionActive {
        /// Collection of the session.
        collection: CollectionId,
        /// Endpoint whose session is still started.
        active: EndpointId,
    },

    /// No session exists for the pair.
    #[error("no session for {collection} on {endpoint}")]
    UnknownSession {
        /// Requested collection.
        collection: CollectionId,
        /// Requested endpoint.
        endpoint: EndpointId,
    },

    /// Network or transport error.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// The local document store failed.
    #[error("store error: {0}")]
    Store(String),

    /// The engine is shutting down.
    #[error("sync engine is shut down")]
    Shutdown,
}

impl SyncError {
    /// Creates a retryable transport error.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable transport error.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Transport { retryable, .. } => *retryable,
            SyncError::ProbeTimeout { .. } | SyncError::ProbeFailure { .. } => true,
            SyncError::SessionStart { .. } => true,
            _ => false,
        }
    }

    /// Returns true if this error must not be absorbed into state.
    pub fn is_hard_failure(&self) -> bool {
        match self {
            SyncError::Config(_) => true,
            SyncError::Protocol(err) => err.is_mismatch(),
            _ => false,
        }
    }
}
