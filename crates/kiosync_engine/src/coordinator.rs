//! Failover coordinator state machine.
//!
//! ```text
//!              PrimaryDown (secondary healthy)
//!   Primary ─────────────────────────────────▶ Secondary
//!      ▲  ◀───────────────────────────────────    │
//!      │     PrimaryRecovered / SecondaryDown     │
//!      │          (primary healthy)               │
//!      │                                          │
//!      │   NetworkOnline / ManualStartRequested   │
//!      └────────────── Stopped ◀──────────────────┘
//!                        ▲   NetworkOffline, BothDown,
//!                        │   failed re-probe, AppShuttingDown
//! ```
//!
//! The coordinator is the single owner of [`CoordinatorState`]. Every
//! event first claims the `is_processing` flag; an event arriving while
//! another transition runs is rejected with [`TransitionOutcome::Busy`]
//! rather than queued. `AppShuttingDown` is the exception: it bypasses the
//! flag, stops every session and leaves the coordinator terminated.

use crate::config::CoordinatorConfig;
use crate::health::HealthMonitor;
use crate::registry::{BatchReport, SessionRegistry};
use kiosync_protocol::EndpointId;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Which endpoint the system is replicating against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailoverState {
    /// All collections replicate against the primary endpoint.
    Primary,
    /// All collections replicate against the secondary endpoint.
    Secondary,
    /// No collection replicates.
    Stopped,
}

impl FailoverState {
    /// The endpoint sessions are live against, if any.
    pub fn active_endpoint(&self) -> Option<EndpointId> {
        match self {
            FailoverState::Primary => Some(EndpointId::Primary),
            FailoverState::Secondary => Some(EndpointId::Secondary),
            FailoverState::Stopped => None,
        }
    }

    fn on(endpoint: EndpointId) -> Self {
        match endpoint {
            EndpointId::Primary => FailoverState::Primary,
            EndpointId::Secondary => FailoverState::Secondary,
        }
    }
}

impl fmt::Display for FailoverState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FailoverState::Primary => "primary",
            FailoverState::Secondary => "secondary",
            FailoverState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Inputs to the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailoverEvent {
    /// The device lost connectivity.
    NetworkOffline,
    /// The device regained connectivity.
    NetworkOnline,
    /// The primary endpoint went offline.
    PrimaryDown,
    /// The secondary endpoint went offline.
    SecondaryDown,
    /// Both endpoints are offline.
    BothDown,
    /// The primary endpoint answered again.
    PrimaryRecovered,
    /// The user asked to reconnect.
    ManualStartRequested,
    /// The process is exiting.
    AppShuttingDown,
}

/// Result of delivering one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionOutcome {
    /// The state changed.
    Transitioned {
        /// State before the event.
        from: FailoverState,
        /// State after the event.
        to: FailoverState,
    },
    /// The event was handled and the state stayed the same.
    Unchanged(FailoverState),
    /// Another transition was running; nothing was done.
    Busy,
    /// The coordinator has shut down; nothing was done.
    Terminated,
}

impl TransitionOutcome {
    /// Returns true if the event was rejected as busy.
    pub fn is_busy(&self) -> bool {
        matches!(self, TransitionOutcome::Busy)
    }

    /// The state after the event, if it was handled.
    pub fn state(&self) -> Option<FailoverState> {
        match self {
            TransitionOutcome::Transitioned { to, .. } => Some(*to),
            TransitionOutcome::Unchanged(state) => Some(*state),
            TransitionOutcome::Busy | TransitionOutcome::Terminated => None,
        }
    }
}

/// Observable coordinator state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoordinatorState {
    /// Current state.
    pub state: FailoverState,
    /// Whether a transition is running.
    pub is_processing: bool,
    /// Whether the last activation found neither endpoint reachable.
    pub both_unavailable: bool,
    /// Whether the coordinator has shut down.
    pub shut_down: bool,
}

impl Default for CoordinatorState {
    fn default() -> Self {
        Self {
            state: FailoverState::Stopped,
            is_processing: false,
            both_unavailable: false,
            shut_down: false,
        }
    }
}

/// Where a transition lands.
#[derive(Debug, Clone, Copy)]
struct Landing {
    state: FailoverState,
    both_unavailable: bool,
}

impl Landing {
    fn on(state: FailoverState) -> Self {
        Self {
            state,
            both_unavailable: false,
        }
    }

    fn unavailable() -> Self {
        Self {
            state: FailoverState::Stopped,
            both_unavailable: true,
        }
    }
}

/// Clears `is_processing` when a transition ends, however it ends.
struct ProcessingGuard<'a> {
    coordinator: &'a FailoverCoordinator,
}

impl Drop for ProcessingGuard<'_> {
    fn drop(&mut self) {
        self.coordinator.processing.store(false, Ordering::SeqCst);
        self.coordinator
            .state
            .send_if_modified(|state| std::mem::replace(&mut state.is_processing, false));
    }
}

/// Serializes failover transitions across the registry.
pub struct FailoverCoordinator {
    config: CoordinatorConfig,
    registry: Arc<SessionRegistry>,
    health: Arc<HealthMonitor>,
    processing: AtomicBool,
    shut_down: AtomicBool,
    last_active: Mutex<Option<EndpointId>>,
    state: watch::Sender<CoordinatorState>,
}

impl FailoverCoordinator {
    /// Creates a coordinator in the `Stopped` state.
    pub fn new(
        config: CoordinatorConfig,
        registry: Arc<SessionRegistry>,
        health: Arc<HealthMonitor>,
    ) -> Self {
        let (state, _) = watch::channel(CoordinatorState::default());
        Self {
            config,
            registry,
            health,
            processing: AtomicBool::new(false),
            shut_down: AtomicBool::new(false),
            last_active: Mutex::new(None),
            state,
        }
    }

    /// Current state.
    pub fn state(&self) -> FailoverState {
        self.state.borrow().state
    }

    /// Current state with its flags.
    pub fn coordinator_state(&self) -> CoordinatorState {
        *self.state.borrow()
    }

    /// Subscribes to state changes.
    pub fn subscribe(&self) -> watch::Receiver<CoordinatorState> {
        self.state.subscribe()
    }

    /// Returns true once `AppShuttingDown` was handled.
    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    /// Handles `NetworkOffline`.
    pub async fn handle_network_offline(&self) -> TransitionOutcome {
        self.dispatch(FailoverEvent::NetworkOffline).await
    }

    /// Handles `NetworkOnline`.
    pub async fn handle_network_online(&self) -> TransitionOutcome {
        self.dispatch(FailoverEvent::NetworkOnline).await
    }

    /// Handles `PrimaryDown`.
    pub async fn handle_primary_down(&self) -> TransitionOutcome {
        self.dispatch(FailoverEvent::PrimaryDown).await
    }

    /// Handles `SecondaryDown`.
    pub async fn handle_secondary_down(&self) -> TransitionOutcome {
        self.dispatch(FailoverEvent::SecondaryDown).await
    }

    /// Handles `BothDown`.
    pub async fn handle_both_down(&self) -> TransitionOutcome {
        self.dispatch(FailoverEvent::BothDown).await
    }

    /// Handles `PrimaryRecovered`.
    pub async fn handle_primary_recovery(&self) -> TransitionOutcome {
        self.dispatch(FailoverEvent::PrimaryRecovered).await
    }

    /// Handles `ManualStartRequested`.
    pub async fn handle_manual_start(&self) -> TransitionOutcome {
        self.dispatch(FailoverEvent::ManualStartRequested).await
    }

    /// Handles `AppShuttingDown`.
    pub async fn handle_shutdown(&self) -> TransitionOutcome {
        self.dispatch(FailoverEvent::AppShuttingDown).await
    }

    /// Delivers one event.
    pub async fn dispatch(&self, event: FailoverEvent) -> TransitionOutcome {
        if event == FailoverEvent::AppShuttingDown {
            return self.shutdown().await;
        }
        if self.is_shut_down() {
            debug!(?event, "coordinator shut down, ignoring event");
            return TransitionOutcome::Terminated;
        }

        let Some(_guard) = self.begin() else {
            debug!(?event, "transition already in progress");
            return TransitionOutcome::Busy;
        };

        let current = self.coordinator_state();
        let from = current.state;
        let stay = Landing {
            state: from,
            both_unavailable: current.both_unavailable,
        };

        let landing = match (event, from) {
            (FailoverEvent::NetworkOffline, _) => {
                self.log_report("stop", &self.registry.stop_everything().await);
                Landing::on(FailoverState::Stopped)
            }
            (FailoverEvent::BothDown, FailoverState::Stopped) => Landing::unavailable(),
            (FailoverEvent::BothDown, _) => {
                self.log_report("stop", &self.registry.stop_everything().await);
                Landing::unavailable()
            }
            (
                FailoverEvent::NetworkOnline | FailoverEvent::ManualStartRequested,
                FailoverState::Stopped,
            ) => self.activate().await,
            (FailoverEvent::PrimaryRecovered, FailoverState::Secondary) => {
                self.switch(EndpointId::Secondary, EndpointId::Primary).await
            }
            (FailoverEvent::PrimaryDown, FailoverState::Primary) => {
                self.fail_over(EndpointId::Primary).await
            }
            (FailoverEvent::SecondaryDown, FailoverState::Secondary) => {
                self.fail_over(EndpointId::Secondary).await
            }
            _ => {
                debug!(?event, state = %from, "event does not apply to current state");
                stay
            }
        };

        self.finish(event, from, landing)
    }

    /// Spawns a task that feeds events from `receiver` through
    /// [`dispatch`](Self::dispatch) one at a time.
    ///
    /// An event rejected as busy is re-raised once after the settle delay
    /// and dropped with a warning if the coordinator is still busy. The
    /// task ends when the channel closes or the coordinator shuts down.
    pub fn spawn_event_loop(
        self: &Arc<Self>,
        mut receiver: mpsc::Receiver<FailoverEvent>,
    ) -> JoinHandle<()> {
        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(event) = receiver.recv().await {
                let mut outcome = coordinator.dispatch(event).await;
                if outcome.is_busy() {
                    tokio::time::sleep(coordinator.config.settle_delay).await;
                    outcome = coordinator.dispatch(event).await;
                }
                match outcome {
                    TransitionOutcome::Busy => {
                        warn!(?event, "coordinator still busy, dropping event");
                    }
                    TransitionOutcome::Terminated => return,
                    _ => {}
                }
                if coordinator.is_shut_down() {
                    return;
                }
            }
            debug!("coordinator event channel closed");
        })
    }

    fn begin(&self) -> Option<ProcessingGuard<'_>> {
        self.processing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()?;
        self.state.send_modify(|state| state.is_processing = true);
        Some(ProcessingGuard { coordinator: self })
    }

    /// Re-probes both endpoints and starts on the preferred healthy one.
    async fn activate(&self) -> Landing {
        let (primary, secondary) = tokio::join!(
            self.health.probe(EndpointId::Primary),
            self.health.probe(EndpointId::Secondary)
        );

        let target = match (primary, secondary) {
            (true, _) => EndpointId::Primary,
            (false, true) => EndpointId::Secondary,
            (false, false) => {
                warn!("neither endpoint reachable, staying stopped");
                return Landing::unavailable();
            }
        };

        // Leftovers from a failed stop would block the peer's start.
        self.log_report("stop", &self.registry.stop_all(target.other()).await);
        self.start_on(target).await
    }

    /// Re-probes the surviving endpoint after `down` went offline.
    async fn fail_over(&self, down: EndpointId) -> Landing {
        let target = down.other();
        if self.health.probe(target).await {
            self.switch(down, target).await
        } else {
            warn!(%down, %target, "failover target unreachable, stopping");
            self.log_report("stop", &self.registry.stop_everything().await);
            Landing::unavailable()
        }
    }

    /// Stops `from`, waits for transports to release, then starts `to`.
    async fn switch(&self, from: EndpointId, to: EndpointId) -> Landing {
        self.log_report("stop", &self.registry.stop_all(from).await);
        tokio::time::sleep(self.config.settle_delay).await;
        self.start_on(to).await
    }

    async fn start_on(&self, endpoint: EndpointId) -> Landing {
        // Cursors are endpoint-specific; switching endpoints pulls from scratch.
        let fresh = *self.last_active.lock() != Some(endpoint);
        let report = self.registry.start_all(endpoint, fresh).await;
        self.log_report("start", &report);

        if self.is_shut_down() {
            self.registry.stop_all(endpoint).await;
            return Landing::on(FailoverState::Stopped);
        }

        if report.succeeded.is_empty() && !report.failed.is_empty() {
            warn!(%endpoint, "no session could be started");
            return Landing::on(FailoverState::Stopped);
        }

        *self.last_active.lock() = Some(endpoint);
        Landing::on(FailoverState::on(endpoint))
    }

    async fn shutdown(&self) -> TransitionOutcome {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return TransitionOutcome::Terminated;
        }

        let from = self.state();
        info!(state = %from, "shutting down failover coordinator");
        self.health.detach();
        self.health.stop();

        let report = self.registry.stop_everything().await;
        self.log_report("stop", &report);

        self.state.send_modify(|state| {
            state.state = FailoverState::Stopped;
            state.both_unavailable = false;
            state.shut_down = true;
        });

        if from == FailoverState::Stopped {
            TransitionOutcome::Unchanged(FailoverState::Stopped)
        } else {
            TransitionOutcome::Transitioned {
                from,
                to: FailoverState::Stopped,
            }
        }
    }

    fn finish(&self, event: FailoverEvent, from: FailoverState, landing: Landing) -> TransitionOutcome {
        // A shutdown that ran alongside this transition has the last word.
        // The check sits under the watch lock so it cannot interleave with
        // the shutdown's own write.
        let mut terminated = false;
        self.state.send_if_modified(|state| {
            if state.shut_down || self.is_shut_down() {
                terminated = true;
                return false;
            }
            let changed =
                state.state != landing.state || state.both_unavailable != landing.both_unavailable;
            state.state = landing.state;
            state.both_unavailable = landing.both_unavailable;
            changed
        });
        if terminated {
            return TransitionOutcome::Terminated;
        }

        if from == landing.state {
            TransitionOutcome::Unchanged(from)
        } else {
            info!(?event, %from, to = %landing.state, "failover transition");
            TransitionOutcome::Transitioned {
                from,
                to: landing.state,
            }
        }
    }

    fn log_report(&self, action: &str, report: &BatchReport) {
        if !report.is_clean() {
            warn!(
                action,
                succeeded = report.succeeded.len(),
                failed = report.failed.len(),
                "batch completed with failures"
            );
        }
    }
}
