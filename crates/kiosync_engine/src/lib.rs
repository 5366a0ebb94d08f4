//! # Kiosync Engine
//!
//! Replication coordination and failover for kiosks that synchronize
//! their local collections against a primary and a secondary endpoint.
//!
//! This crate provides:
//! - Connection health monitoring with degrade/offline thresholds
//! - A session registry that tracks whether each session was ever started
//! - A failover state machine (`Primary`, `Secondary`, `Stopped`)
//! - A read-only state monitor for status views
//! - An HTTP replication session built on the checkpoint adapter
//!
//! ## Architecture
//!
//! ```text
//!   HealthMonitor ──(mpsc: FailoverEvent)──▶ FailoverCoordinator
//!        │                                          │
//!        │                                          ▼
//!        │                                   SessionRegistry ──▶ sessions
//!        │                                          │
//!        └──────────────▶ StateMonitor ◀────────────┘
//! ```
//!
//! [`SyncSystem`] owns all four components and wires them together.
//!
//! ## Key Invariants
//!
//! - A session that was never started is never cancelled
//! - A collection is never live against both endpoints at once
//! - One transition runs at a time; concurrent events are rejected as busy
//! - The primary is preferred whenever both endpoints are healthy
//! - Cursors are never carried from one endpoint to the other

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod coordinator;
mod error;
mod health;
mod http;
pub mod mock;
mod monitor;
mod registry;
mod session;
mod system;
mod transport;

pub use config::{
    CoordinatorConfig, HealthConfig, SessionConfig, SyncSettings, ENV_DEGRADED_AFTER,
    ENV_HEALTH_INTERVAL_MS, ENV_OFFLINE_AFTER, ENV_POLL_INTERVAL_MS, ENV_PRIMARY_STREAM_URL,
    ENV_PRIMARY_URL, ENV_PROBE_TIMEOUT_MS, ENV_SECONDARY_STREAM_URL, ENV_SECONDARY_URL,
    ENV_SETTLE_DELAY_MS,
};
pub use coordinator::{
    CoordinatorState, FailoverCoordinator, FailoverEvent, FailoverState, TransitionOutcome,
};
pub use error::{SyncError, SyncResult};
pub use health::{HealthMonitor, HealthState, HealthStatus};
pub use http::{HttpClient, HttpProbe};
pub use monitor::{CollectionSessionInfo, MonitorHandle, StateMonitor, StateSnapshot};
pub use registry::{BatchReport, RegistryChange, SessionRegistry, SessionState};
pub use session::{
    CycleStats, DocumentStore, HttpSessionFactory, LiveStream, PendingChange, ReplicationSession,
    StreamItem,
};
pub use system::SyncSystem;
pub use transport::{
    Cancelable, HealthSink, LivenessProbe, Resyncable, SessionFactory, SessionTransport, Startable,
};
