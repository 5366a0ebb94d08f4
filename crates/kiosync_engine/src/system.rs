//! The sync system context object.
//!
//! Wires the health monitor, session registry, failover coordinator and
//! state monitor together. Each component is owned here and handed to the
//! others explicitly; nothing is global.

use crate::config::SyncSettings;
use crate::coordinator::{FailoverCoordinator, FailoverEvent, TransitionOutcome};
use crate::error::{SyncError, SyncResult};
use crate::health::HealthMonitor;
use crate::monitor::{MonitorHandle, StateMonitor, StateSnapshot};
use crate::registry::SessionRegistry;
use crate::transport::{HealthSink, LivenessProbe, SessionFactory};
use kiosync_protocol::CollectionSyncConfig;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::info;

/// Owns and connects every engine component.
pub struct SyncSystem {
    settings: SyncSettings,
    health: Arc<HealthMonitor>,
    registry: Arc<SessionRegistry>,
    coordinator: Arc<FailoverCoordinator>,
    monitor: Arc<StateMonitor>,
    events: Mutex<Option<mpsc::Receiver<FailoverEvent>>>,
    event_loop: Mutex<Option<JoinHandle<()>>>,
    monitor_handle: Mutex<Option<MonitorHandle>>,
}

impl SyncSystem {
    /// Builds the system. Fails if the settings are invalid.
    pub fn new(
        settings: SyncSettings,
        probe: Arc<dyn LivenessProbe>,
        factory: Arc<dyn SessionFactory>,
    ) -> SyncResult<Self> {
        settings.validate()?;

        let health = Arc::new(HealthMonitor::new(
            settings.health.clone(),
            settings.endpoints.clone(),
            probe,
        ));
        factory.bind_health(Arc::clone(&health) as Arc<dyn HealthSink>);

        let registry = Arc::new(SessionRegistry::new(settings.endpoints.clone(), factory));
        let coordinator = Arc::new(FailoverCoordinator::new(
            settings.coordinator.clone(),
            Arc::clone(&registry),
            Arc::clone(&health),
        ));
        let monitor = Arc::new(StateMonitor::new(
            Arc::clone(&coordinator),
            Arc::clone(&registry),
            Arc::clone(&health),
        ));

        let (sender, receiver) = mpsc::channel(settings.coordinator.event_capacity.max(1));
        health.attach(sender);

        Ok(Self {
            settings,
            health,
            registry,
            coordinator,
            monitor,
            events: Mutex::new(Some(receiver)),
            event_loop: Mutex::new(None),
            monitor_handle: Mutex::new(None),
        })
    }

    /// Creates sessions, starts health checks and activates replication.
    ///
    /// Calling it again only re-runs activation; sessions are not recreated.
    pub async fn start(&self, collections: &[CollectionSyncConfig]) -> SyncResult<TransitionOutcome> {
        if self.coordinator.is_shut_down() {
            return Err(SyncError::Shutdown);
        }

        let created = self.registry.initialize(collections, false).await;
        if let Some(receiver) = self.events.lock().take() {
            *self.event_loop.lock() = Some(self.coordinator.spawn_event_loop(receiver));
        }
        {
            let mut handle = self.monitor_handle.lock();
            if handle.is_none() {
                *handle = Some(self.monitor.spawn());
            }
        }
        if !self.health.is_running() {
            self.health.start(self.settings.health.interval);
        }

        info!(sessions = created, "sync system started");
        let outcome = self.coordinator.handle_network_online().await;
        self.monitor.refresh();
        Ok(outcome)
    }

    /// Reports device connectivity.
    pub async fn set_network_available(&self, available: bool) -> TransitionOutcome {
        let event = if available {
            FailoverEvent::NetworkOnline
        } else {
            FailoverEvent::NetworkOffline
        };
        let outcome = self.coordinator.dispatch(event).await;
        self.monitor.refresh();
        outcome
    }

    /// Re-probes both endpoints and starts on whichever is reachable, the
    /// same way automatic reconnection does.
    pub async fn retry(&self) -> TransitionOutcome {
        let outcome = self.coordinator.handle_manual_start().await;
        self.monitor.refresh();
        outcome
    }

    /// Current diagnostics snapshot.
    pub fn snapshot(&self) -> StateSnapshot {
        self.monitor.snapshot()
    }

    /// Receives snapshots as they change.
    pub fn changes(&self) -> watch::Receiver<StateSnapshot> {
        self.monitor.changes()
    }

    /// Stops every session and background task. Terminal.
    pub async fn shutdown(&self) -> TransitionOutcome {
        let outcome = self.coordinator.handle_shutdown().await;
        if let Some(handle) = self.monitor_handle.lock().take() {
            handle.stop();
        }
        if let Some(task) = self.event_loop.lock().take() {
            task.abort();
        }
        self.monitor.refresh();
        info!("sync system shut down");
        outcome
    }

    /// The resolved settings.
    pub fn settings(&self) -> &SyncSettings {
        &self.settings
    }

    /// The health monitor.
    pub fn health(&self) -> &Arc<HealthMonitor> {
        &self.health
    }

    /// The session registry.
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// The failover coordinator.
    pub fn coordinator(&self) -> &Arc<FailoverCoordinator> {
        &self.coordinator
    }
}

impl Drop for SyncSystem {
    fn drop(&mut self) {
        if let Some(task) = self.event_loop.get_mut().take() {
            task.abort();
        }
        self.health.stop();
    }
}
