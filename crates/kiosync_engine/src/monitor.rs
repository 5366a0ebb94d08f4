//! Read-only state monitor.
//!
//! Derives a [`StateSnapshot`] from the coordinator, the registry and the
//! health monitor, and republishes it whenever any of them reports a
//! change. It never writes to any of them.

use crate::coordinator::{FailoverCoordinator, FailoverState};
use crate::health::{HealthMonitor, HealthState};
use crate::registry::{SessionRegistry, SessionState};
use chrono::{DateTime, Utc};
use kiosync_protocol::{CollectionId, EndpointId};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

/// Diagnostics for one collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionSessionInfo {
    /// The collection.
    pub collection: CollectionId,
    /// Endpoint the collection is (or should be) replicating against.
    pub active_endpoint: Option<EndpointId>,
    /// Whether the session on that endpoint is started.
    pub was_started: bool,
    /// Whether its transport reports itself active.
    pub is_live: bool,
    /// Most recent completed sync against either endpoint.
    pub last_synced_at: Option<DateTime<Utc>>,
}

/// Everything a status view needs, in one value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateSnapshot {
    /// Endpoint the coordinator is replicating against.
    pub active_endpoint: Option<EndpointId>,
    /// Coordinator state.
    pub state: FailoverState,
    /// Whether neither endpoint was reachable at the last activation.
    pub both_unavailable: bool,
    /// Whether a transition is running.
    pub is_processing: bool,
    /// Health of both endpoints.
    pub health: Vec<HealthState>,
    /// Per-collection session info.
    pub sessions: Vec<CollectionSessionInfo>,
}

/// Derives snapshots from the engine components.
pub struct StateMonitor {
    coordinator: Arc<FailoverCoordinator>,
    registry: Arc<SessionRegistry>,
    health: Arc<HealthMonitor>,
    snapshots: watch::Sender<StateSnapshot>,
}

impl StateMonitor {
    /// Creates a monitor.
    pub fn new(
        coordinator: Arc<FailoverCoordinator>,
        registry: Arc<SessionRegistry>,
        health: Arc<HealthMonitor>,
    ) -> Self {
        let initial = derive(&coordinator, &registry, &health);
        let (snapshots, _) = watch::channel(initial);
        Self {
            coordinator,
            registry,
            health,
            snapshots,
        }
    }

    /// Computes a fresh snapshot.
    pub fn snapshot(&self) -> StateSnapshot {
        derive(&self.coordinator, &self.registry, &self.health)
    }

    /// Receives every published snapshot.
    pub fn changes(&self) -> watch::Receiver<StateSnapshot> {
        self.snapshots.subscribe()
    }

    /// Recomputes and publishes if anything changed.
    pub fn refresh(&self) {
        let next = self.snapshot();
        self.snapshots.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }

    /// Spawns a task that refreshes on every registry, health or
    /// coordinator notification.
    pub fn spawn(self: &Arc<Self>) -> MonitorHandle {
        let monitor = Arc::clone(self);
        let mut registry = self.registry.subscribe();
        let mut health = self.health.subscribe();
        let mut coordinator = self.coordinator.subscribe();

        let task = tokio::spawn(async move {
            loop {
                let open = tokio::select! {
                    result = registry.recv() => !matches!(result, Err(RecvError::Closed)),
                    result = health.recv() => !matches!(result, Err(RecvError::Closed)),
                    result = coordinator.changed() => result.is_ok(),
                };
                if !open {
                    debug!("state monitor source closed");
                    break;
                }
                monitor.refresh();
            }
        });

        MonitorHandle { task: Some(task) }
    }
}

/// Keeps a spawned [`StateMonitor`] subscribed. Dropping it unsubscribes.
#[derive(Debug)]
pub struct MonitorHandle {
    task: Option<JoinHandle<()>>,
}

impl MonitorHandle {
    /// Unsubscribes from all sources.
    pub fn stop(mut self) {
        self.abort();
    }

    fn abort(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for MonitorHandle {
    fn drop(&mut self) {
        self.abort();
    }
}

fn derive(
    coordinator: &FailoverCoordinator,
    registry: &SessionRegistry,
    health: &HealthMonitor,
) -> StateSnapshot {
    let coordinator_state = coordinator.coordinator_state();
    let active_endpoint = coordinator_state.state.active_endpoint();
    let states = registry.get_all_states();

    let sessions = registry
        .collections()
        .into_iter()
        .map(|collection| {
            let pair: Vec<&SessionState> = states
                .iter()
                .filter(|state| state.collection == collection)
                .collect();
            let started = pair.iter().find(|state| state.was_started);
            let endpoint = started.map(|state| state.endpoint).or(active_endpoint);
            let current = endpoint.and_then(|endpoint| pair.iter().find(|s| s.endpoint == endpoint));

            CollectionSessionInfo {
                collection,
                active_endpoint: endpoint,
                was_started: current.is_some_and(|state| state.was_started),
                is_live: current.is_some_and(|state| state.is_live),
                last_synced_at: pair.iter().filter_map(|state| state.last_synced_at).max(),
            }
        })
        .collect();

    StateSnapshot {
        active_endpoint,
        state: coordinator_state.state,
        both_unavailable: coordinator_state.both_unavailable,
        is_processing: coordinator_state.is_processing,
        health: health.all(),
        sessions,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CoordinatorConfig, HealthConfig};
    use crate::mock::{MockProbe, MockSessionFactory};
    use crate::transport::{LivenessProbe, SessionFactory};
    use kiosync_protocol::{CollectionSyncConfig, EndpointPair};
    use std::time::Duration;

    async fn monitor() -> (Arc<StateMonitor>, Arc<FailoverCoordinator>, Arc<MockProbe>) {
        let endpoints = EndpointPair::new("https://p", "wss://p", "https://s", "wss://s");
        let probe = Arc::new(MockProbe::new());
        let health = Arc::new(HealthMonitor::new(
            HealthConfig::default(),
            endpoints.clone(),
            Arc::clone(&probe) as Arc<dyn LivenessProbe>,
        ));
        let registry = Arc::new(SessionRegistry::new(
            endpoints,
            Arc::new(MockSessionFactory::new()) as Arc<dyn SessionFactory>,
        ));
        registry
            .initialize(&[CollectionSyncConfig::new("orders")], false)
            .await;
        let coordinator = Arc::new(FailoverCoordinator::new(
            CoordinatorConfig::default().with_settle_delay(Duration::ZERO),
            Arc::clone(&registry),
            Arc::clone(&health),
        ));
        let monitor = Arc::new(StateMonitor::new(
            Arc::clone(&coordinator),
            registry,
            health,
        ));
        (monitor, coordinator, probe)
    }

    #[tokio::test]
    async fn snapshot_of_idle_system() {
        let (monitor, _, _) = monitor().await;
        let snapshot = monitor.snapshot();

        assert_eq!(snapshot.state, FailoverState::Stopped);
        assert_eq!(snapshot.active_endpoint, None);
        assert_eq!(snapshot.health.len(), 2);
        assert_eq!(snapshot.sessions.len(), 1);
        let orders = &snapshot.sessions[0];
        assert_eq!(orders.active_endpoint, None);
        assert!(!orders.was_started);
        assert!(orders.last_synced_at.is_none());
    }

    #[tokio::test]
    async fn snapshot_follows_active_endpoint() {
        let (monitor, coordinator, probe) = monitor().await;
        probe.set_healthy(EndpointId::Primary, false);
        coordinator.handle_manual_start().await;

        let snapshot = monitor.snapshot();
        assert_eq!(snapshot.active_endpoint, Some(EndpointId::Secondary));
        let orders = &snapshot.sessions[0];
        assert_eq!(orders.active_endpoint, Some(EndpointId::Secondary));
        assert!(orders.was_started);
        assert!(orders.is_live);
        assert!(orders.last_synced_at.is_some());
    }

    #[tokio::test]
    async fn snapshot_serializes_for_status_views() {
        let (monitor, coordinator, _) = monitor().await;
        coordinator.handle_manual_start().await;

        let json = serde_json::to_value(monitor.snapshot()).unwrap();
        assert_eq!(json["state"], "primary");
        assert_eq!(json["active_endpoint"], "primary");
        assert_eq!(json["sessions"][0]["collection"], "orders");
        assert_eq!(json["sessions"][0]["was_started"], true);
    }

    #[tokio::test]
    async fn spawned_monitor_publishes_changes() {
        let (monitor, coordinator, _) = monitor().await;
        let mut changes = monitor.changes();
        let handle = monitor.spawn();

        coordinator.handle_manual_start().await;
        let snapshot = changes
            .wait_for(|s| s.state == FailoverState::Primary && s.sessions[0].was_started)
            .await
            .unwrap()
            .clone();
        assert_eq!(snapshot.active_endpoint, Some(EndpointId::Primary));

        handle.stop();
    }

    #[tokio::test]
    async fn stopped_handle_no_longer_refreshes() {
        let (monitor, coordinator, _) = monitor().await;
        let changes = monitor.changes();
        monitor.spawn().stop();
        tokio::task::yield_now().await;

        coordinator.handle_manual_start().await;
        tokio::task::yield_now().await;
        assert_eq!(changes.borrow().state, FailoverState::Stopped);
    }
}
