//! HTTP plumbing.
//!
//! The actual HTTP client is abstracted via a trait so the engine can sit
//! on any HTTP library (reqwest, hyper, a platform bridge) or on an
//! in-memory double in tests. Bodies are JSON.

use crate::error::{SyncError, SyncResult};
use crate::transport::LivenessProbe;
use async_trait::async_trait;
use kiosync_protocol::Endpoint;
use serde_json::Value;
use std::sync::Arc;

/// HTTP client abstraction.
///
/// Errors are reported as plain messages; callers decide whether they
/// count as transport or health failures.
#[async_trait]
pub trait HttpClient: Send + Sync {
    /// Sends a GET request and returns the decoded JSON body.
    async fn get(&self, url: &str) -> Result<Value, String>;

    /// Sends a POST request with a JSON body and returns the decoded JSON
    /// response.
    async fn post(&self, url: &str, body: Value) -> Result<Value, String>;
}

/// Liveness probe issuing `GET {base_url}{probe_path}`.
///
/// Any well-formed JSON answer is success, whatever its content.
pub struct HttpProbe {
    client: Arc<dyn HttpClient>,
    path: String,
}

impl HttpProbe {
    /// Creates a probe hitting `path` on each endpoint.
    pub fn new(client: Arc<dyn HttpClient>, path: impl Into<String>) -> Self {
        Self {
            client,
            path: path.into(),
        }
    }

    /// Returns the probed path.
    pub fn path(&self) -> &str {
        &self.path
    }
}

#[async_trait]
impl LivenessProbe for HttpProbe {
    async fn probe(&self, endpoint: &Endpoint) -> SyncResult<()> {
        self.client
            .get(&endpoint.url(&self.path))
            .await
            .map(|_| ())
            .map_err(SyncError::transport_retryable)
    }
}
