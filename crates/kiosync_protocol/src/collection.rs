//! Static per-collection sync configuration.

use crate::endpoint::EndpointId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a synchronized collection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CollectionId(String);

impl CollectionId {
    /// Creates a collection id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CollectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CollectionId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for CollectionId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Field names one endpoint uses on the wire for a collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointWireFields {
    /// Name of the checkpoint field carrying the server-side ordering cursor.
    pub cursor_field: String,
    /// Top-level response key holding the pulled documents.
    pub documents_key: String,
}

impl EndpointWireFields {
    /// Creates a field mapping.
    pub fn new(cursor_field: impl Into<String>, documents_key: impl Into<String>) -> Self {
        Self {
            cursor_field: cursor_field.into(),
            documents_key: documents_key.into(),
        }
    }

    /// Default naming used by the primary deployment.
    pub fn primary_default() -> Self {
        Self::new("updatedAt", "documents")
    }

    /// Default naming used by the secondary deployment.
    pub fn secondary_default() -> Self {
        Self::new("server_updated_at", "items")
    }
}

/// Describes how one collection is synchronized against both endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionSyncConfig {
    /// Collection identifier.
    pub id: CollectionId,
    /// Default page size for pull requests.
    pub batch_size: u32,
    /// Wire naming used by the primary endpoint.
    pub primary: EndpointWireFields,
    /// Wire naming used by the secondary endpoint.
    pub secondary: EndpointWireFields,
}

impl CollectionSyncConfig {
    /// Creates a configuration with default field naming.
    pub fn new(id: impl Into<CollectionId>) -> Self {
        Self {
            id: id.into(),
            batch_size: 100,
            primary: EndpointWireFields::primary_default(),
            secondary: EndpointWireFields::secondary_default(),
        }
    }

    /// Sets the default pull page size.
    pub fn with_batch_size(mut self, size: u32) -> Self {
        self.batch_size = size.max(1);
        self
    }

    /// Overrides the wire naming for one endpoint.
    pub fn with_fields(mut self, endpoint: EndpointId, fields: EndpointWireFields) -> Self {
        match endpoint {
            EndpointId::Primary => self.primary = fields,
            EndpointId::Secondary => self.secondary = fields,
        }
        self
    }

    /// Returns the wire naming for an endpoint.
    pub fn fields(&self, endpoint: EndpointId) -> &EndpointWireFields {
        match endpoint {
            EndpointId::Primary => &self.primary,
            EndpointId::Secondary => &self.secondary,
        }
    }

    /// Path of the pull route, relative to the endpoint base address.
    pub fn pull_path(&self) -> String {
        format!("/sync/{}/pull", self.id)
    }

    /// Path of the push route, relative to the endpoint base address.
    pub fn push_path(&self) -> String {
        format!("/sync/{}/push", self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_disagree_between_endpoints() {
        let config = CollectionSyncConfig::new("orders");
        assert_ne!(
            config.fields(EndpointId::Primary).cursor_field,
            config.fields(EndpointId::Secondary).cursor_field
        );
        assert_ne!(
            config.fields(EndpointId::Primary).documents_key,
            config.fields(EndpointId::Secondary).documents_key
        );
    }

    #[test]
    fn builder_overrides() {
        let config = CollectionSyncConfig::new("visits")
            .with_batch_size(25)
            .with_fields(EndpointId::Secondary, EndpointWireFields::new("lsn", "rows"));

        assert_eq!(config.id.as_str(), "visits");
        assert_eq!(config.batch_size, 25);
        assert_eq!(config.fields(EndpointId::Secondary).cursor_field, "lsn");
        assert_eq!(config.fields(EndpointId::Primary).cursor_field, "updatedAt");
        assert_eq!(config.pull_path(), "/sync/visits/pull");
        assert_eq!(config.push_path(), "/sync/visits/push");
    }

    #[test]
    fn zero_batch_size_is_clamped() {
        let config = CollectionSyncConfig::new("a").with_batch_size(0);
        assert_eq!(config.batch_size, 1);
    }
}
