//! Capability traits the engine drives sessions and probes through.
//!
//! The engine never inspects a session for optional methods at runtime.
//! Every session implements [`Startable`], [`Cancelable`] and
//! [`Resyncable`], combined as [`SessionTransport`], and the registry
//! dispatches through those traits only.

use crate::error::SyncResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kiosync_protocol::{CollectionSyncConfig, Endpoint, EndpointId};
use std::sync::Arc;

/// A session that can be started.
#[async_trait]
pub trait Startable: Send + Sync {
    /// Starts replicating.
    async fn start(&self) -> SyncResult<()>;

    /// Whether the underlying transport reports itself active.
    ///
    /// This reflects transport-level activity only. It does not say whether
    /// the session was ever explicitly started.
    fn is_active(&self) -> bool;
}

/// A session that can be cancelled.
#[async_trait]
pub trait Cancelable: Send + Sync {
    /// Stops replicating and releases transport resources.
    ///
    /// Returns [`SyncError::AlreadyReleased`](crate::SyncError::AlreadyReleased)
    /// if there was nothing left to release.
    async fn cancel(&self) -> SyncResult<()>;
}

/// A session that can run an out-of-band pull cycle.
#[async_trait]
pub trait Resyncable: Send + Sync {
    /// Triggers a pull cycle on a running session.
    async fn resync(&self) -> SyncResult<()>;
}

/// The full set of capabilities a registry session provides.
pub trait SessionTransport: Startable + Cancelable + Resyncable {
    /// Forgets the session's checkpoint so the next cycle pulls from scratch.
    fn reset_checkpoint(&self);

    /// Time of the last completed pull/push cycle.
    fn last_synced_at(&self) -> Option<DateTime<Utc>>;
}

/// Creates one session per (collection, endpoint) pair.
pub trait SessionFactory: Send + Sync {
    /// Creates a dormant session.
    fn create(
        &self,
        collection: &CollectionSyncConfig,
        endpoint: &Endpoint,
    ) -> Arc<dyn SessionTransport>;

    /// Gives sessions created from now on somewhere to report connection
    /// failures they observe. Factories without live streams ignore it.
    fn bind_health(&self, _health: Arc<dyn HealthSink>) {}
}

/// Receives connection failures observed outside the probe cycle.
#[async_trait]
pub trait HealthSink: Send + Sync {
    /// Counts a failed contact with `endpoint`.
    async fn report_failure(&self, endpoint: EndpointId, reason: String);
}

/// A lightweight liveness check against an endpoint.
#[async_trait]
pub trait LivenessProbe: Send + Sync {
    /// Probes the endpoint. Any well-formed answer is success.
    ///
    /// Timeouts are applied by the caller.
    async fn probe(&self, endpoint: &Endpoint) -> SyncResult<()>;
}
