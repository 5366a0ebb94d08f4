//! Connection health monitoring.
//!
//! The monitor probes both endpoints on a fixed interval and derives a
//! tri-state status from each endpoint's consecutive-failure count:
//!
//! ```text
//!   failures < degraded_after              -> Online
//!   degraded_after <= failures < offline   -> Degraded
//!   failures >= offline_after              -> Offline
//! ```
//!
//! A single success resets the count and the status to `Online`
//! immediately. Degradation is slow, recovery is instant.
//!
//! Status changes are broadcast to subscribers. Crossing into `Offline`,
//! and the primary answering again after failures, are additionally pushed
//! to the failover coordinator through its event channel.

use crate::config::HealthConfig;
use crate::coordinator::FailoverEvent;
use crate::error::SyncError;
use crate::transport::{HealthSink, LivenessProbe};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kiosync_protocol::{EndpointId, EndpointPair};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Derived availability of an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Answering probes.
    Online,
    /// Failing probes, not yet written off.
    Degraded,
    /// Considered unreachable.
    Offline,
}

/// Health of one endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthState {
    /// Endpoint this state describes.
    pub endpoint: EndpointId,
    /// Derived status.
    pub status: HealthStatus,
    /// Failures since the last success.
    pub consecutive_failures: u32,
    /// Time of the last probe, if any.
    pub last_checked_at: Option<DateTime<Utc>>,
    /// Message of the last failure since the last success.
    pub last_error: Option<String>,
}

impl HealthState {
    fn initial(endpoint: EndpointId) -> Self {
        Self {
            endpoint,
            status: HealthStatus::Online,
            consecutive_failures: 0,
            last_checked_at: None,
            last_error: None,
        }
    }

    /// Returns true if the endpoint is online.
    pub fn is_online(&self) -> bool {
        self.status == HealthStatus::Online
    }
}

/// Periodically probes both endpoints and tracks their health.
pub struct HealthMonitor {
    config: HealthConfig,
    endpoints: EndpointPair,
    probe: Arc<dyn LivenessProbe>,
    states: RwLock<[HealthState; 2]>,
    changes: broadcast::Sender<HealthState>,
    coordinator: Mutex<Option<mpsc::Sender<FailoverEvent>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl HealthMonitor {
    /// Creates a monitor. Both endpoints start `Online` and unchecked.
    pub fn new(config: HealthConfig, endpoints: EndpointPair, probe: Arc<dyn LivenessProbe>) -> Self {
        let (changes, _) = broadcast::channel(64);
        Self {
            config,
            endpoints,
            probe,
            states: RwLock::new([
                HealthState::initial(EndpointId::Primary),
                HealthState::initial(EndpointId::Secondary),
            ]),
            changes,
            coordinator: Mutex::new(None),
            task: Mutex::new(None),
        }
    }

    /// Returns the monitor configuration.
    pub fn config(&self) -> &HealthConfig {
        &self.config
    }

    /// Routes offline/recovery notifications to the coordinator.
    pub fn attach(&self, sender: mpsc::Sender<FailoverEvent>) {
        *self.coordinator.lock() = Some(sender);
    }

    /// Stops routing notifications to the coordinator.
    pub fn detach(&self) {
        self.coordinator.lock().take();
    }

    /// Starts probing every `interval`. Restarting replaces the old task.
    pub fn start(self: &Arc<Self>, interval: Duration) {
        let monitor = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                monitor.check_now().await;
            }
        });

        if let Some(previous) = self.task.lock().replace(handle) {
            previous.abort();
        }
        info!(interval_ms = interval.as_millis() as u64, "health monitor started");
    }

    /// Stops probing. In-flight probes are abandoned, not awaited.
    pub fn stop(&self) {
        if let Some(handle) = self.task.lock().take() {
            handle.abort();
            info!("health monitor stopped");
        }
    }

    /// Returns true while the periodic task is running.
    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Probes both endpoints concurrently, once.
    pub async fn check_now(&self) {
        tokio::join!(
            self.probe(EndpointId::Primary),
            self.probe(EndpointId::Secondary)
        );
    }

    /// Probes one endpoint with the configured timeout and records the result.
    ///
    /// Returns whether the probe succeeded.
    pub async fn probe(&self, endpoint: EndpointId) -> bool {
        let target = self.endpoints.get(endpoint);
        let outcome =
            match tokio::time::timeout(self.config.probe_timeout, self.probe.probe(target)).await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(err)) => Err(SyncError::ProbeFailure {
                    endpoint,
                    message: err.to_string(),
                }),
                Err(_) => Err(SyncError::ProbeTimeout { endpoint }),
            };

        match outcome {
            Ok(()) => {
                self.record_success(endpoint).await;
                true
            }
            Err(err) => {
                debug!(%endpoint, error = %err, "probe failed");
                self.record_failure(endpoint, err.to_string()).await;
                false
            }
        }
    }

    /// Records a successful contact with an endpoint.
    pub async fn record_success(&self, endpoint: EndpointId) {
        if let Some(event) = self.apply(endpoint, None) {
            self.notify(event);
        }
    }

    /// Records a failed contact with an endpoint.
    ///
    /// Probe failures and live-stream failures both land here.
    pub async fn record_failure(&self, endpoint: EndpointId, reason: impl Into<String>) {
        if let Some(event) = self.apply(endpoint, Some(reason.into())) {
            self.notify(event);
        }
    }

    /// Returns the health of one endpoint.
    pub fn get_health(&self, endpoint: EndpointId) -> HealthState {
        self.states.read()[index(endpoint)].clone()
    }

    /// Returns the health of both endpoints.
    pub fn all(&self) -> Vec<HealthState> {
        self.states.read().to_vec()
    }

    /// Subscribes to status changes.
    pub fn subscribe(&self) -> broadcast::Receiver<HealthState> {
        self.changes.subscribe()
    }

    /// Updates the state and returns the coordinator event the change implies.
    ///
    /// Besides status changes, a primary success that clears earlier
    /// failures reports recovery, so a brief outage that never reached
    /// `Degraded` still lets the coordinator move back from the secondary.
    fn apply(&self, endpoint: EndpointId, failure: Option<String>) -> Option<FailoverEvent> {
        let succeeded = failure.is_none();
        let (previous, previous_failures, current, peer) = {
            let mut states = self.states.write();
            let peer = states[index(endpoint.other())].status;
            let state = &mut states[index(endpoint)];
            let previous = state.status;
            let previous_failures = state.consecutive_failures;

            state.last_checked_at = Some(Utc::now());
            match failure {
                None => {
                    state.consecutive_failures = 0;
                    state.last_error = None;
                }
                Some(reason) => {
                    state.consecutive_failures = state.consecutive_failures.saturating_add(1);
                    state.last_error = Some(reason);
                }
            }
            state.status = self.classify(state.consecutive_failures);
            (previous, previous_failures, state.clone(), peer)
        };

        let status = current.status;
        if previous != status {
            match status {
                HealthStatus::Online => info!(%endpoint, "endpoint back online"),
                HealthStatus::Degraded => warn!(
                    %endpoint,
                    failures = current.consecutive_failures,
                    "endpoint degraded"
                ),
                HealthStatus::Offline => warn!(
                    %endpoint,
                    failures = current.consecutive_failures,
                    "endpoint offline"
                ),
            }
            // No receivers is fine.
            let _ = self.changes.send(current);
        }

        let went_offline = previous != HealthStatus::Offline && status == HealthStatus::Offline;
        match endpoint {
            _ if went_offline && peer == HealthStatus::Offline => Some(FailoverEvent::BothDown),
            EndpointId::Primary if went_offline => Some(FailoverEvent::PrimaryDown),
            EndpointId::Secondary if went_offline => Some(FailoverEvent::SecondaryDown),
            EndpointId::Primary if succeeded && previous_failures > 0 => {
                Some(FailoverEvent::PrimaryRecovered)
            }
            _ => None,
        }
    }

    fn classify(&self, failures: u32) -> HealthStatus {
        if failures >= self.config.offline_after {
            HealthStatus::Offline
        } else if failures >= self.config.degraded_after {
            HealthStatus::Degraded
        } else {
            HealthStatus::Online
        }
    }

    /// Hands `event` to the coordinator without waiting on its queue.
    ///
    /// The coordinator probes through this monitor while it drains the same
    /// queue, so a full queue is handed off to a forwarding task instead of
    /// blocking the caller.
    fn notify(&self, event: FailoverEvent) {
        let Some(sender) = self.coordinator.lock().clone() else {
            return;
        };
        match sender.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                debug!(?event, "coordinator queue full, forwarding in background");
                tokio::spawn(async move {
                    if sender.send(event).await.is_err() {
                        debug!(?event, "coordinator event loop has gone away");
                    }
                });
            }
            Err(TrySendError::Closed(event)) => {
                debug!(?event, "coordinator event loop has gone away");
            }
        }
    }
}

#[async_trait]
impl HealthSink for HealthMonitor {
    async fn report_failure(&self, endpoint: EndpointId, reason: String) {
        self.record_failure(endpoint, reason).await;
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        if let Some(handle) = self.task.get_mut().take() {
            handle.abort();
        }
    }
}

fn index(endpoint: EndpointId) -> usize {
    match endpoint {
        EndpointId::Primary => 0,
        EndpointId::Secondary => 1,
    }
}
