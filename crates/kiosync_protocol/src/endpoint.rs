//! The two remote endpoints a kiosk synchronizes against.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies one of the two interchangeable remote endpoints.
///
/// The ordering is meaningful: `Primary` is always preferred over
/// `Secondary` when both are healthy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointId {
    /// The preferred endpoint.
    Primary,
    /// The standby endpoint.
    Secondary,
}

impl EndpointId {
    /// Both endpoints, in preference order.
    pub const ALL: [EndpointId; 2] = [EndpointId::Primary, EndpointId::Secondary];

    /// Returns the peer endpoint.
    pub fn other(&self) -> EndpointId {
        match self {
            EndpointId::Primary => EndpointId::Secondary,
            EndpointId::Secondary => EndpointId::Primary,
        }
    }

    /// Returns the lowercase name used in logs and on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            EndpointId::Primary => "primary",
            EndpointId::Secondary => "secondary",
        }
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A configured remote endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    /// Which endpoint this is.
    pub id: EndpointId,
    /// HTTP base address (e.g., "https://primary.example.com").
    pub base_url: String,
    /// Streaming address for live updates.
    pub stream_url: String,
}

impl Endpoint {
    /// Creates a new endpoint.
    pub fn new(id: EndpointId, base_url: impl Into<String>, stream_url: impl Into<String>) -> Self {
        Self {
            id,
            base_url: base_url.into(),
            stream_url: stream_url.into(),
        }
    }

    /// Joins a path onto the base address.
    pub fn url(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }
}

/// The primary/secondary endpoint pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointPair {
    /// The preferred endpoint.
    pub primary: Endpoint,
    /// The standby endpoint.
    pub secondary: Endpoint,
}

impl EndpointPair {
    /// Creates a pair from base and stream addresses.
    pub fn new(
        primary_url: impl Into<String>,
        primary_stream: impl Into<String>,
        secondary_url: impl Into<String>,
        secondary_stream: impl Into<String>,
    ) -> Self {
        Self {
            primary: Endpoint::new(EndpointId::Primary, primary_url, primary_stream),
            secondary: Endpoint::new(EndpointId::Secondary, secondary_url, secondary_stream),
        }
    }

    /// Returns the endpoint with the given id.
    pub fn get(&self, id: EndpointId) -> &Endpoint {
        match id {
            EndpointId::Primary => &self.primary,
            EndpointId::Secondary => &self.secondary,
        }
    }

    /// Iterates both endpoints in preference order.
    pub fn iter(&self) -> impl Iterator<Item = &Endpoint> {
        [&self.primary, &self.secondary].into_iter()
    }
}
