//! Session registry.
//!
//! Owns one session per (collection, endpoint) pair and the explicit
//! `was_started` flag for each. The flag is the only thing that decides
//! whether a cancel reaches the transport: transport activity flags
//! cannot tell "idle between cycles" from "never started", and cancelling
//! a transport that was never started is the failure this module exists
//! to prevent.

use crate::error::{SyncError, SyncResult};
use crate::transport::{SessionFactory, SessionTransport};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use kiosync_protocol::{CollectionId, CollectionSyncConfig, EndpointId, EndpointPair};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex as AsyncMutex};
use tracing::{debug, info, warn};

/// Read-only view of one session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionState {
    /// Collection of the session.
    pub collection: CollectionId,
    /// Endpoint of the session.
    pub endpoint: EndpointId,
    /// Whether the session was explicitly started and not since cancelled.
    pub was_started: bool,
    /// Whether the transport reports itself active right now.
    pub is_live: bool,
    /// Time of the last completed sync cycle.
    pub last_synced_at: Option<DateTime<Utc>>,
}

/// A change to the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryChange {
    /// Sessions were (re)created.
    Initialized {
        /// Number of sessions created.
        sessions: usize,
    },
    /// A session was started (or resynced in place of a start).
    Started {
        /// Collection of the session.
        collection: CollectionId,
        /// Endpoint of the session.
        endpoint: EndpointId,
    },
    /// A session was cancelled.
    Stopped {
        /// Collection of the session.
        collection: CollectionId,
        /// Endpoint of the session.
        endpoint: EndpointId,
    },
    /// A started session ran an out-of-band pull.
    Resynced {
        /// Collection of the session.
        collection: CollectionId,
        /// Endpoint of the session.
        endpoint: EndpointId,
    },
    /// All sessions were destroyed.
    TornDown,
}

/// Outcome of a batch operation over many sessions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    /// Sessions the operation acted on.
    pub succeeded: Vec<(CollectionId, EndpointId)>,
    /// Sessions left alone (e.g. stop on a never-started session).
    pub skipped: Vec<(CollectionId, EndpointId)>,
    /// Sessions that failed, with the error message.
    pub failed: Vec<(CollectionId, EndpointId, String)>,
}

impl BatchReport {
    /// Returns true if nothing failed.
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }

    fn record(&mut self, collection: CollectionId, endpoint: EndpointId, result: SyncResult<bool>) {
        match result {
            Ok(true) => self.succeeded.push((collection, endpoint)),
            Ok(false) => self.skipped.push((collection, endpoint)),
            Err(err) => self.failed.push((collection, endpoint, err.to_string())),
        }
    }
}

struct SessionSlot {
    collection: CollectionId,
    endpoint: EndpointId,
    transport: Arc<dyn SessionTransport>,
    was_started: AtomicBool,
    // Per-session critical section for start/stop/resync.
    op_lock: AsyncMutex<()>,
}

impl SessionSlot {
    fn was_started(&self) -> bool {
        self.was_started.load(Ordering::SeqCst)
    }

    fn state(&self) -> SessionState {
        SessionState {
            collection: self.collection.clone(),
            endpoint: self.endpoint,
            was_started: self.was_started(),
            is_live: self.transport.is_active(),
            last_synced_at: self.transport.last_synced_at(),
        }
    }
}

type SlotKey = (CollectionId, EndpointId);

/// Owns every synchronization session.
pub struct SessionRegistry {
    endpoints: EndpointPair,
    factory: Arc<dyn SessionFactory>,
    collections: RwLock<Vec<CollectionSyncConfig>>,
    sessions: RwLock<BTreeMap<SlotKey, Arc<SessionSlot>>>,
    lifecycle: AsyncMutex<()>,
    changes: broadcast::Sender<RegistryChange>,
}

impl SessionRegistry {
    /// Creates an empty registry.
    pub fn new(endpoints: EndpointPair, factory: Arc<dyn SessionFactory>) -> Self {
        let (changes, _) = broadcast::channel(256);
        Self {
            endpoints,
            factory,
            collections: RwLock::new(Vec::new()),
            sessions: RwLock::new(BTreeMap::new()),
            lifecycle: AsyncMutex::new(()),
            changes,
        }
    }

    /// Creates one dormant session per (collection, endpoint) pair.
    ///
    /// A no-op returning 0 while sessions exist, unless
    /// `force_reinitialize` is set, in which case the existing sessions are
    /// stopped and replaced. Duplicate collection ids keep the last entry.
    pub async fn initialize(
        &self,
        collections: &[CollectionSyncConfig],
        force_reinitialize: bool,
    ) -> usize {
        let _lifecycle = self.lifecycle.lock().await;

        if !self.sessions.read().is_empty() {
            if !force_reinitialize {
                debug!("registry already initialized");
                return 0;
            }
            let report = self.stop_everything().await;
            if !report.is_clean() {
                warn!(
                    failed = report.failed.len(),
                    "some sessions failed to stop before reinitialization"
                );
            }
        }

        let mut unique: BTreeMap<CollectionId, CollectionSyncConfig> = BTreeMap::new();
        for config in collections {
            unique.insert(config.id.clone(), config.clone());
        }

        let mut sessions = BTreeMap::new();
        for config in unique.values() {
            for endpoint in self.endpoints.iter() {
                let transport = self.factory.create(config, endpoint);
                sessions.insert(
                    (config.id.clone(), endpoint.id),
                    Arc::new(SessionSlot {
                        collection: config.id.clone(),
                        endpoint: endpoint.id,
                        transport,
                        was_started: AtomicBool::new(false),
                        op_lock: AsyncMutex::new(()),
                    }),
                );
            }
        }

        let count = sessions.len();
        *self.collections.write() = unique.into_values().collect();
        *self.sessions.write() = sessions;

        info!(sessions = count, "session registry initialized");
        self.notify(RegistryChange::Initialized { sessions: count });
        count
    }

    /// Starts a session.
    ///
    /// If the session is already started, or its transport reports itself
    /// active, this resyncs instead of starting twice. Fails with
    /// [`SyncError::PeerSessionActive`] while the same collection is
    /// started on the other endpoint.
    pub async fn start(&self, collection: &CollectionId, endpoint: EndpointId) -> SyncResult<()> {
        self.start_session(collection, endpoint, false).await
    }

    /// Starts a session after discarding its checkpoint.
    pub async fn start_fresh(
        &self,
        collection: &CollectionId,
        endpoint: EndpointId,
    ) -> SyncResult<()> {
        self.start_session(collection, endpoint, true).await
    }

    async fn start_session(
        &self,
        collection: &CollectionId,
        endpoint: EndpointId,
        fresh: bool,
    ) -> SyncResult<()> {
        let slot = self.slot(collection, endpoint)?;
        let peer = self.slot(collection, endpoint.other()).ok();

        // Both slots are held so a concurrent start on the peer cannot slip
        // past the guard. Primary is always locked first.
        let (_op, _peer_op) = match &peer {
            Some(peer) => {
                let (first, second) = match endpoint {
                    EndpointId::Primary => (&slot, peer),
                    EndpointId::Secondary => (peer, &slot),
                };
                let first = first.op_lock.lock().await;
                let second = second.op_lock.lock().await;
                (first, Some(second))
            }
            None => (slot.op_lock.lock().await, None),
        };

        if let Some(peer) = peer.as_ref().filter(|peer| peer.was_started()) {
            return Err(SyncError::PeerSessionActive {
                collection: collection.clone(),
                active: peer.endpoint,
            });
        }

        if fresh {
            slot.transport.reset_checkpoint();
        }

        let result = if slot.was_started() || slot.transport.is_active() {
            debug!(%collection, %endpoint, "session already running, resyncing");
            slot.transport.resync().await
        } else {
            slot.transport.start().await
        };

        result.map_err(|err| SyncError::SessionStart {
            collection: collection.clone(),
            endpoint,
            message: err.to_string(),
        })?;

        slot.was_started.store(true, Ordering::SeqCst);
        debug!(%collection, %endpoint, "session started");
        self.notify(RegistryChange::Started {
            collection: collection.clone(),
            endpoint,
        });
        Ok(())
    }

    /// Stops a session.
    ///
    /// Returns `Ok(false)` without touching the transport if the session
    /// was never started. A transport that reports its resources already
    /// released counts as stopped.
    pub async fn stop(&self, collection: &CollectionId, endpoint: EndpointId) -> SyncResult<bool> {
        let slot = self.slot(collection, endpoint)?;
        let _op = slot.op_lock.lock().await;

        if !slot.was_started() {
            debug!(%collection, %endpoint, "session never started, nothing to cancel");
            return Ok(false);
        }

        match slot.transport.cancel().await {
            Ok(()) => {}
            Err(SyncError::AlreadyReleased) => {
                debug!(%collection, %endpoint, "transport already released");
            }
            Err(err) => {
                return Err(SyncError::SessionCancel {
                    collection: collection.clone(),
                    endpoint,
                    message: err.to_string(),
                })
            }
        }

        slot.was_started.store(false, Ordering::SeqCst);
        debug!(%collection, %endpoint, "session stopped");
        self.notify(RegistryChange::Stopped {
            collection: collection.clone(),
            endpoint,
        });
        Ok(true)
    }

    /// Runs an out-of-band pull on a started session.
    ///
    /// Leaves `was_started` untouched.
    pub async fn resync(&self, collection: &CollectionId, endpoint: EndpointId) -> SyncResult<()> {
        let slot = self.slot(collection, endpoint)?;
        let _op = slot.op_lock.lock().await;

        if !slot.was_started() {
            return Err(SyncError::SessionNotStarted {
                collection: collection.clone(),
                endpoint,
            });
        }

        slot.transport.resync().await?;
        self.notify(RegistryChange::Resynced {
            collection: collection.clone(),
            endpoint,
        });
        Ok(())
    }

    /// Starts every collection on `endpoint` concurrently.
    ///
    /// With `fresh`, each session's checkpoint is discarded first.
    /// Failures are logged and reported, never propagated.
    pub async fn start_all(&self, endpoint: EndpointId, fresh: bool) -> BatchReport {
        let collections = self.collections();
        let results = join_all(collections.iter().map(|collection| async move {
            let result = self.start_session(collection, endpoint, fresh).await;
            (collection.clone(), result.map(|()| true))
        }))
        .await;

        self.collect_report("start", endpoint, results)
    }

    /// Stops every collection on `endpoint` concurrently.
    pub async fn stop_all(&self, endpoint: EndpointId) -> BatchReport {
        let collections = self.collections();
        let results = join_all(collections.iter().map(|collection| async move {
            let result = self.stop(collection, endpoint).await;
            (collection.clone(), result)
        }))
        .await;

        self.collect_report("stop", endpoint, results)
    }

    /// Stops every session on both endpoints.
    pub async fn stop_everything(&self) -> BatchReport {
        let (primary, secondary) = tokio::join!(
            self.stop_all(EndpointId::Primary),
            self.stop_all(EndpointId::Secondary)
        );

        let mut report = primary;
        report.succeeded.extend(secondary.succeeded);
        report.skipped.extend(secondary.skipped);
        report.failed.extend(secondary.failed);
        report
    }

    /// Stops everything and destroys all sessions.
    pub async fn teardown(&self) -> BatchReport {
        let _lifecycle = self.lifecycle.lock().await;
        let report = self.stop_everything().await;
        self.sessions.write().clear();
        self.collections.write().clear();
        info!("session registry torn down");
        self.notify(RegistryChange::TornDown);
        report
    }

    /// Returns a snapshot of every session.
    pub fn get_all_states(&self) -> Vec<SessionState> {
        self.sessions
            .read()
            .values()
            .map(|slot| slot.state())
            .collect()
    }

    /// Returns a snapshot of one session.
    pub fn state(&self, collection: &CollectionId, endpoint: EndpointId) -> Option<SessionState> {
        self.sessions
            .read()
            .get(&(collection.clone(), endpoint))
            .map(|slot| slot.state())
    }

    /// Returns whether a session is started.
    pub fn is_started(&self, collection: &CollectionId, endpoint: EndpointId) -> bool {
        self.sessions
            .read()
            .get(&(collection.clone(), endpoint))
            .is_some_and(|slot| slot.was_started())
    }

    /// Number of started sessions on `endpoint`.
    pub fn started_count(&self, endpoint: EndpointId) -> usize {
        self.sessions
            .read()
            .values()
            .filter(|slot| slot.endpoint == endpoint && slot.was_started())
            .count()
    }

    /// Registered collection ids, in order.
    pub fn collections(&self) -> Vec<CollectionId> {
        self.collections
            .read()
            .iter()
            .map(|config| config.id.clone())
            .collect()
    }

    /// Registered collection configurations.
    pub fn collection_configs(&self) -> Vec<CollectionSyncConfig> {
        self.collections.read().clone()
    }

    /// Returns true if no sessions exist.
    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    /// Subscribes to registry changes.
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryChange> {
        self.changes.subscribe()
    }

    fn slot(&self, collection: &CollectionId, endpoint: EndpointId) -> SyncResult<Arc<SessionSlot>> {
        self.sessions
            .read()
            .get(&(collection.clone(), endpoint))
            .cloned()
            .ok_or_else(|| SyncError::UnknownSession {
                collection: collection.clone(),
                endpoint,
            })
    }

    fn collect_report(
        &self,
        action: &str,
        endpoint: EndpointId,
        results: Vec<(CollectionId, SyncResult<bool>)>,
    ) -> BatchReport {
        let mut report = BatchReport::default();
        for (collection, result) in results {
            if let Err(err) = &result {
                warn!(%collection, %endpoint, error = %err, "session {action} failed");
            }
            report.record(collection, endpoint, result);
        }
        report
    }

    fn notify(&self, change: RegistryChange) {
        // No receivers is fine.
        let _ = self.changes.send(change);
    }
}
