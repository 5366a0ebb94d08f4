//! HTTP replication session.
//!
//! One [`ReplicationSession`] replicates one collection against one
//! endpoint using a pull-then-push cycle:
//!
//! 1. Pull pages from the endpoint until a short page comes back
//! 2. Apply pulled documents to the local store
//! 3. Push pending local changes and acknowledge them
//!
//! `start()` runs the first cycle inline, so a session that cannot reach
//! its endpoint fails to start, then hands further cycles to a background
//! task that wakes on the poll interval, on live-stream batches and on
//! cancellation. Live-stream failures are reported to the health monitor.

use crate::config::SessionConfig;
use crate::error::{SyncError, SyncResult};
use crate::http::HttpClient;
use crate::transport::{
    Cancelable, HealthSink, Resyncable, SessionFactory, SessionTransport, Startable,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kiosync_protocol::{
    Checkpoint, CheckpointAdapter, CollectionId, CollectionSyncConfig, Document, Endpoint,
    LocalChange,
};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

/// Local document storage a session replicates into.
pub trait DocumentStore: Send + Sync {
    /// Applies documents pulled from an endpoint. Tombstones delete.
    fn apply_pulled(&self, collection: &CollectionId, documents: &[Document]) -> SyncResult<()>;

    /// Returns up to `limit` local changes not yet acknowledged, oldest
    /// first.
    fn pending_changes(&self, collection: &CollectionId, limit: usize)
        -> SyncResult<Vec<PendingChange>>;

    /// Marks exactly the changes with these sequence numbers as pushed.
    ///
    /// Other changes to the same documents, including ones recorded while
    /// the push was in flight, stay pending.
    fn acknowledge(&self, collection: &CollectionId, seqs: &[u64]) -> SyncResult<()>;
}

/// A local change as queued by a [`DocumentStore`].
#[derive(Debug, Clone, PartialEq)]
pub struct PendingChange {
    /// Store-assigned sequence number, unique within the collection.
    pub seq: u64,
    /// The change itself.
    pub change: LocalChange,
}

/// A batch delivered on a live stream.
pub type StreamItem = SyncResult<Vec<Document>>;

/// Optional live-update channel per endpoint.
#[async_trait]
pub trait LiveStream: Send + Sync {
    /// Opens a stream of document batches for one collection.
    ///
    /// The receiver yielding an error, or closing, is a connection failure.
    async fn subscribe(
        &self,
        endpoint: &Endpoint,
        collection: &CollectionId,
    ) -> SyncResult<mpsc::Receiver<StreamItem>>;
}

/// Counts from one pull/push cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleStats {
    /// Documents pulled.
    pub pulled: usize,
    /// Changes pushed.
    pub pushed: usize,
}

struct SessionCore {
    config: CollectionSyncConfig,
    endpoint: Endpoint,
    adapter: CheckpointAdapter,
    client: Arc<dyn HttpClient>,
    store: Arc<dyn DocumentStore>,
    stream: Option<Arc<dyn LiveStream>>,
    health: Option<Arc<dyn HealthSink>>,
    settings: SessionConfig,
    checkpoint: Mutex<Option<Checkpoint>>,
    last_synced_at: Mutex<Option<DateTime<Utc>>>,
    // Serializes cycles between the background task and resync().
    cycle_lock: AsyncMutex<()>,
}

impl SessionCore {
    fn id(&self) -> &CollectionId {
        &self.config.id
    }

    async fn cycle(&self) -> SyncResult<CycleStats> {
        let _cycle = self.cycle_lock.lock().await;
        let pulled = self.pull().await?;
        let pushed = self.push().await?;
        *self.last_synced_at.lock() = Some(Utc::now());
        debug!(
            collection = %self.id(),
            endpoint = %self.endpoint.id,
            pulled,
            pushed,
            "sync cycle complete"
        );
        Ok(CycleStats { pulled, pushed })
    }

    async fn pull(&self) -> SyncResult<usize> {
        let url = self.endpoint.url(&self.config.pull_path());
        let mut total = 0;

        loop {
            let checkpoint = self.checkpoint.lock().clone();
            let request = self.adapter.build_pull_request(
                self.id(),
                checkpoint.as_ref(),
                self.settings.pull_batch_size,
                self.endpoint.id,
            )?;

            let raw = self
                .client
                .post(&url, request.to_json())
                .await
                .map_err(SyncError::transport_retryable)?;
            let envelope = self
                .adapter
                .normalize_response(self.id(), &raw, self.endpoint.id)?;

            let count = envelope.len();
            if count > 0 {
                self.store.apply_pulled(self.id(), &envelope.documents)?;
            }
            total += count;

            let advanced = envelope.checkpoint.is_some() && envelope.checkpoint != checkpoint;
            if let Some(next) = envelope.checkpoint {
                *self.checkpoint.lock() = Some(next);
            }

            // A full page that did not move the cursor would loop forever.
            if count < request.limit as usize || !advanced {
                return Ok(total);
            }
        }
    }

    async fn push(&self) -> SyncResult<usize> {
        let pending = self
            .store
            .pending_changes(self.id(), self.settings.push_batch_size as usize)?;
        if pending.is_empty() {
            return Ok(0);
        }
        let changes: Vec<LocalChange> = pending.iter().map(|p| p.change.clone()).collect();

        let request = self.adapter.build_push_request(self.id(), &changes)?;
        let url = self.endpoint.url(&self.config.push_path());
        let response = self
            .client
            .post(&url, request.to_json())
            .await
            .map_err(SyncError::transport_retryable)?;

        // The endpoint answers with the server state of conflicting rows.
        let conflicts = conflicting_documents(&response);
        if !conflicts.is_empty() {
            debug!(
                collection = %self.id(),
                endpoint = %self.endpoint.id,
                conflicts = conflicts.len(),
                "push conflicts, keeping server state"
            );
            self.store.apply_pulled(self.id(), &conflicts)?;
        }

        let seqs: Vec<u64> = pending.iter().map(|p| p.seq).collect();
        self.store.acknowledge(self.id(), &seqs)?;
        Ok(changes.len())
    }

    async fn report(&self, reason: String) {
        warn!(
            collection = %self.id(),
            endpoint = %self.endpoint.id,
            %reason,
            "live stream failure"
        );
        if let Some(health) = &self.health {
            health.report_failure(self.endpoint.id, reason).await;
        }
    }

    async fn run(self: Arc<Self>, mut cancel: watch::Receiver<bool>) {
        let mut feed = match &self.stream {
            Some(stream) => tokio::select! {
                _ = cancel.changed() => return,
                subscribed = stream.subscribe(&self.endpoint, self.id()) => match subscribed {
                    Ok(feed) => Some(feed),
                    Err(err) => {
                        self.report(err.to_string()).await;
                        None
                    }
                },
            },
            None => None,
        };

        let mut ticker = tokio::time::interval(self.settings.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick fires immediately; start() already ran that cycle.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.changed() => break,
                _ = ticker.tick() => {
                    // An endpoint that stops answering mid-cycle must not hold
                    // up cancellation.
                    tokio::select! {
                        _ = cancel.changed() => break,
                        result = self.cycle() => if let Err(err) = result {
                            warn!(
                                collection = %self.id(),
                                endpoint = %self.endpoint.id,
                                error = %err,
                                "sync cycle failed"
                            );
                        },
                    }
                }
                item = next_item(&mut feed) => match item {
                    Some(Ok(documents)) => {
                        if let Err(err) = self.store.apply_pulled(self.id(), &documents) {
                            warn!(collection = %self.id(), error = %err, "failed to apply stream batch");
                        }
                    }
                    Some(Err(err)) => self.report(err.to_string()).await,
                    None => {
                        self.report("live stream closed".into()).await;
                        feed = None;
                    }
                },
            }
        }
    }
}

async fn next_item(feed: &mut Option<mpsc::Receiver<StreamItem>>) -> Option<StreamItem> {
    match feed {
        Some(feed) => feed.recv().await,
        None => std::future::pending().await,
    }
}

fn conflicting_documents(response: &Value) -> Vec<Document> {
    let rows = match response {
        Value::Array(rows) => rows,
        Value::Object(object) => match object.get("conflicts") {
            Some(Value::Array(rows)) => rows,
            _ => return Vec::new(),
        },
        _ => return Vec::new(),
    };
    rows.iter().filter_map(Document::from_wire).collect()
}

struct Running {
    cancel: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Replicates one collection against one endpoint over HTTP.
pub struct ReplicationSession {
    core: Arc<SessionCore>,
    running: Mutex<Option<Running>>,
}

impl ReplicationSession {
    /// Creates a dormant session.
    pub fn new(
        config: CollectionSyncConfig,
        endpoint: Endpoint,
        client: Arc<dyn HttpClient>,
        store: Arc<dyn DocumentStore>,
        settings: SessionConfig,
    ) -> Self {
        Self::assemble(config, endpoint, client, store, settings, None, None)
    }

    fn assemble(
        config: CollectionSyncConfig,
        endpoint: Endpoint,
        client: Arc<dyn HttpClient>,
        store: Arc<dyn DocumentStore>,
        settings: SessionConfig,
        stream: Option<Arc<dyn LiveStream>>,
        health: Option<Arc<dyn HealthSink>>,
    ) -> Self {
        Self {
            core: Arc::new(SessionCore {
                adapter: CheckpointAdapter::for_collection(config.clone()),
                config,
                endpoint,
                client,
                store,
                stream,
                health,
                settings,
                checkpoint: Mutex::new(None),
                last_synced_at: Mutex::new(None),
                cycle_lock: AsyncMutex::new(()),
            }),
            running: Mutex::new(None),
        }
    }

    /// Current checkpoint, if any.
    pub fn checkpoint(&self) -> Option<Checkpoint> {
        self.core.checkpoint.lock().clone()
    }

    /// Runs one pull/push cycle now.
    pub async fn sync_once(&self) -> SyncResult<CycleStats> {
        self.core.cycle().await
    }
}

#[async_trait]
impl Startable for ReplicationSession {
    async fn start(&self) -> SyncResult<()> {
        if self.is_active() {
            return Ok(());
        }

        self.core.cycle().await?;

        let (cancel, cancelled) = watch::channel(false);
        let task = tokio::spawn(Arc::clone(&self.core).run(cancelled));
        if let Some(previous) = self.running.lock().replace(Running { cancel, task }) {
            previous.task.abort();
        }
        Ok(())
    }

    fn is_active(&self) -> bool {
        self.running
            .lock()
            .as_ref()
            .is_some_and(|running| !running.task.is_finished())
    }
}

#[async_trait]
impl Cancelable for ReplicationSession {
    async fn cancel(&self) -> SyncResult<()> {
        let Some(running) = self.running.lock().take() else {
            return Err(SyncError::AlreadyReleased);
        };
        // A closed receiver means the task is already gone.
        let _ = running.cancel.send(true);
        if let Err(err) = running.task.await {
            if err.is_panic() {
                return Err(SyncError::transport_fatal("session task panicked"));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Resyncable for ReplicationSession {
    async fn resync(&self) -> SyncResult<()> {
        self.core.cycle().await.map(|_| ())
    }
}

impl SessionTransport for ReplicationSession {
    fn reset_checkpoint(&self) {
        self.core.checkpoint.lock().take();
    }

    fn last_synced_at(&self) -> Option<DateTime<Utc>> {
        *self.core.last_synced_at.lock()
    }
}

/// Builds [`ReplicationSession`]s sharing one client, store and stream.
pub struct HttpSessionFactory {
    client: Arc<dyn HttpClient>,
    store: Arc<dyn DocumentStore>,
    stream: Option<Arc<dyn LiveStream>>,
    settings: SessionConfig,
    health: RwLock<Option<Arc<dyn HealthSink>>>,
}

impl HttpSessionFactory {
    /// Creates a factory.
    pub fn new(
        client: Arc<dyn HttpClient>,
        store: Arc<dyn DocumentStore>,
        settings: SessionConfig,
    ) -> Self {
        Self {
            client,
            store,
            stream: None,
            settings,
            health: RwLock::new(None),
        }
    }

    /// Attaches a live stream to every session built from now on.
    pub fn with_stream(mut self, stream: Arc<dyn LiveStream>) -> Self {
        self.stream = Some(stream);
        self
    }
}

impl SessionFactory for HttpSessionFactory {
    fn create(
        &self,
        collection: &CollectionSyncConfig,
        endpoint: &Endpoint,
    ) -> Arc<dyn SessionTransport> {
        Arc::new(ReplicationSession::assemble(
            collection.clone(),
            endpoint.clone(),
            Arc::clone(&self.client),
            Arc::clone(&self.store),
            self.settings.clone(),
            self.stream.clone(),
            self.health.read().clone(),
        ))
    }

    fn bind_health(&self, health: Arc<dyn HealthSink>) {
        *self.health.write() = Some(health);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MemoryStore, MockHttpClient};
    use kiosync_protocol::EndpointId;
    use serde_json::json;
    use std::time::Duration;

    const PULL: &str = "https://p.example/sync/orders/pull";
    const PUSH: &str = "https://p.example/sync/orders/push";
    const SECONDARY_PULL: &str = "https://s.example/sync/orders/pull";

    fn primary() -> Endpoint {
        Endpoint::new(EndpointId::Primary, "https://p.example", "wss://p.example")
    }

    fn secondary() -> Endpoint {
        Endpoint::new(EndpointId::Secondary, "https://s.example", "wss://s.example")
    }

    fn session(
        endpoint: Endpoint,
        client: &Arc<MockHttpClient>,
        store: &Arc<MemoryStore>,
    ) -> ReplicationSession {
        ReplicationSession::new(
            CollectionSyncConfig::new("orders").with_batch_size(2),
            endpoint,
            client.clone(),
            store.clone(),
            SessionConfig::default().with_poll_interval(Duration::from_secs(30)),
        )
    }

    fn empty_page() -> Value {
        json!({"documents": [], "checkpoint": null})
    }

    #[tokio::test]
    async fn pulls_until_short_page() {
        let client = Arc::new(MockHttpClient::new());
        client.enqueue(
            PULL,
            Ok(json!({
                "documents": [{"id": "a", "total": 1}, {"id": "b", "total": 2}],
                "checkpoint": {"id": "b", "updatedAt": "2024-01-01T00:00:02Z"}
            })),
        );
        client.respond(
            PULL,
            json!({
                "documents": [{"id": "c", "total": 3}],
                "checkpoint": {"id": "c", "updatedAt": "2024-01-01T00:00:03Z"}
            }),
        );
        let store = Arc::new(MemoryStore::new());
        let session = session(primary(), &client, &store);

        let stats = session.sync_once().await.unwrap();
        assert_eq!(stats, CycleStats { pulled: 3, pushed: 0 });
        assert_eq!(store.len(&CollectionId::new("orders")), 3);

        let checkpoint = session.checkpoint().unwrap();
        assert_eq!(checkpoint.endpoint, EndpointId::Primary);
        assert_eq!(checkpoint.id, "c");

        let bodies = client.bodies(PULL);
        assert_eq!(bodies[0]["checkpoint"], Value::Null);
        assert_eq!(bodies[1]["checkpoint"]["updatedAt"], "2024-01-01T00:00:02Z");
        assert_eq!(bodies[1]["limit"], 2);
    }

    #[tokio::test]
    async fn pushes_pending_changes_and_acknowledges() {
        let client = Arc::new(MockHttpClient::new());
        client.respond(PULL, empty_page());
        client.respond(PUSH, json!([]));
        let store = Arc::new(MemoryStore::new());
        let orders = CollectionId::new("orders");
        store.record_change(
            &orders,
            LocalChange::update(
                Document::new("a", json!({"total": 2})),
                Document::new("a", json!({"total": 1})),
            ),
        );
        store.record_change(&orders, LocalChange::without_prior(Document::new("b", json!({}))));
        let session = session(primary(), &client, &store);

        let stats = session.sync_once().await.unwrap();
        assert_eq!(stats.pushed, 2);
        assert!(store.pending(&orders).is_empty());

        let body = &client.bodies(PUSH)[0];
        assert_eq!(body["rows"][0]["new_document_state"]["_deleted"], false);
        assert_eq!(body["rows"][1]["new_document_state"]["_deleted"], true);
        assert_eq!(body["rows"][1]["assumed_prior_state"], Value::Null);
    }

    #[tokio::test]
    async fn later_change_to_same_document_survives_acknowledgement() {
        let client = Arc::new(MockHttpClient::new());
        client.respond(PULL, empty_page());
        client.respond(PUSH, json!([]));
        let store = Arc::new(MemoryStore::new());
        let orders = CollectionId::new("orders");
        store.record_change(
            &orders,
            LocalChange::update(
                Document::new("a", json!({"n": 1})),
                Document::new("a", json!({"n": 0})),
            ),
        );
        store.record_change(
            &orders,
            LocalChange::update(
                Document::new("a", json!({"n": 2})),
                Document::new("a", json!({"n": 1})),
            ),
        );
        let session = ReplicationSession::new(
            CollectionSyncConfig::new("orders"),
            primary(),
            client.clone(),
            store.clone(),
            SessionConfig::default().with_push_batch_size(1),
        );

        let stats = session.sync_once().await.unwrap();
        assert_eq!(stats.pushed, 1);
        let pending = store.pending(&orders);
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].document.data["n"], 2);

        let stats = session.sync_once().await.unwrap();
        assert_eq!(stats.pushed, 1);
        assert!(store.pending(&orders).is_empty());

        let bodies = client.bodies(PUSH);
        assert_eq!(bodies.len(), 2);
        assert_eq!(bodies[0]["rows"][0]["new_document_state"]["n"], 1);
        assert_eq!(bodies[1]["rows"][0]["new_document_state"]["n"], 2);
    }

    #[tokio::test]
    async fn push_conflicts_keep_server_state() {
        let client = Arc::new(MockHttpClient::new());
        client.respond(PULL, empty_page());
        client.respond(PUSH, json!([{"id": "a", "total": 99}]));
        let store = Arc::new(MemoryStore::new());
        let orders = CollectionId::new("orders");
        store.record_change(
            &orders,
            LocalChange::update(
                Document::new("a", json!({"total": 2})),
                Document::new("a", json!({"total": 1})),
            ),
        );
        let session = session(primary(), &client, &store);

        session.sync_once().await.unwrap();
        let stored = store.document(&orders, "a").unwrap();
        assert_eq!(stored.data["total"], 99);
    }

    #[tokio::test]
    async fn mismatched_response_surfaces_as_protocol_error() {
        let client = Arc::new(MockHttpClient::new());
        // Secondary-shaped payload returned by the primary.
        client.respond(PULL, json!({"items": [], "checkpoint": null}));
        let store = Arc::new(MemoryStore::new());
        let session = session(primary(), &client, &store);

        let err = session.start().await.unwrap_err();
        assert!(err.is_hard_failure());
        assert!(!session.is_active());
    }

    #[tokio::test]
    async fn unreachable_endpoint_fails_start() {
        let client = Arc::new(MockHttpClient::new());
        client.fail(PULL, "connection refused");
        let store = Arc::new(MemoryStore::new());
        let session = session(primary(), &client, &store);

        let err = session.start().await.unwrap_err();
        assert!(err.is_retryable());
        assert!(!session.is_active());
    }

    #[tokio::test]
    async fn start_cancel_lifecycle() {
        let client = Arc::new(MockHttpClient::new());
        client.respond(PULL, empty_page());
        let store = Arc::new(MemoryStore::new());
        let session = session(primary(), &client, &store);

        session.start().await.unwrap();
        assert!(session.is_active());
        assert!(session.last_synced_at().is_some());

        session.cancel().await.unwrap();
        assert!(!session.is_active());
        assert!(matches!(
            session.cancel().await,
            Err(SyncError::AlreadyReleased)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn background_task_polls_on_interval() {
        let client = Arc::new(MockHttpClient::new());
        client.respond(PULL, empty_page());
        let store = Arc::new(MemoryStore::new());
        let session = session(primary(), &client, &store);

        session.start().await.unwrap();
        tokio::time::sleep(Duration::from_secs(65)).await;
        session.cancel().await.unwrap();

        // Inline start cycle plus ticks at 30s and 60s.
        assert_eq!(client.bodies(PULL).len(), 3);
    }

    #[tokio::test]
    async fn reset_checkpoint_forces_full_pull() {
        let client = Arc::new(MockHttpClient::new());
        client.respond(
            PULL,
            json!({
                "documents": [{"id": "a"}],
                "checkpoint": {"id": "a", "updatedAt": 5}
            }),
        );
        let store = Arc::new(MemoryStore::new());
        let session = session(primary(), &client, &store);

        session.sync_once().await.unwrap();
        assert_eq!(session.checkpoint().unwrap().cursor.to_value(), json!(5));
        session.sync_once().await.unwrap();
        assert_eq!(client.bodies(PULL)[1]["checkpoint"]["updatedAt"], json!(5));
        session.reset_checkpoint();
        assert!(session.checkpoint().is_none());

        session.resync().await.unwrap();
        let bodies = client.bodies(PULL);
        assert_eq!(bodies.last().unwrap()["checkpoint"], Value::Null);
    }

    #[tokio::test]
    async fn secondary_session_uses_its_own_cursor_field() {
        let client = Arc::new(MockHttpClient::new());
        client.enqueue(
            SECONDARY_PULL,
            Ok(json!({
                "items": [{"id": "a"}],
                "checkpoint": {"id": "a", "server_updated_at": "2024-01-01T00:00:00Z"}
            })),
        );
        client.respond(SECONDARY_PULL, json!({"items": [], "checkpoint": null}));
        let store = Arc::new(MemoryStore::new());
        let session = session(secondary(), &client, &store);

        session.sync_once().await.unwrap();
        session.sync_once().await.unwrap();

        let bodies = client.bodies(SECONDARY_PULL);
        let checkpoint = &bodies[1]["checkpoint"];
        assert_eq!(checkpoint["server_updated_at"], "2024-01-01T00:00:00Z");
        assert!(checkpoint.get("updatedAt").is_none());
    }

    struct ScriptedStream {
        items: Mutex<Vec<StreamItem>>,
    }

    #[async_trait]
    impl LiveStream for ScriptedStream {
        async fn subscribe(
            &self,
            _endpoint: &Endpoint,
            _collection: &CollectionId,
        ) -> SyncResult<mpsc::Receiver<StreamItem>> {
            let items: Vec<StreamItem> = self.items.lock().drain(..).collect();
            let (tx, rx) = mpsc::channel(items.len().max(1));
            for item in items {
                // Capacity covers every item.
                let _ = tx.try_send(item);
            }
            Ok(rx)
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        failures: Mutex<Vec<(EndpointId, String)>>,
    }

    #[async_trait]
    impl HealthSink for RecordingSink {
        async fn report_failure(&self, endpoint: EndpointId, reason: String) {
            self.failures.lock().push((endpoint, reason));
        }
    }

    #[tokio::test]
    async fn stream_batches_apply_and_failures_reach_health() {
        let client = Arc::new(MockHttpClient::new());
        client.respond(PULL, empty_page());
        let store = Arc::new(MemoryStore::new());
        let sink = Arc::new(RecordingSink::default());
        let stream = Arc::new(ScriptedStream {
            items: Mutex::new(vec![
                Ok(vec![Document::new("live", json!({"total": 7}))]),
                Err(SyncError::transport_retryable("socket reset")),
            ]),
        });

        let factory = HttpSessionFactory::new(client.clone(), store.clone(), SessionConfig::default())
            .with_stream(stream);
        factory.bind_health(sink.clone());
        let config = CollectionSyncConfig::new("orders");
        let session = factory.create(&config, &primary());

        session.start().await.unwrap();
        for _ in 0..50 {
            if sink.failures.lock().len() >= 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        session.cancel().await.unwrap();

        assert!(store.document(&CollectionId::new("orders"), "live").is_some());
        let failures = sink.failures.lock().clone();
        assert_eq!(failures[0].0, EndpointId::Primary);
        assert!(failures[0].1.contains("socket reset"));
        assert!(failures[1].1.contains("closed"));
    }

    /// Answers normally until stalled, then never answers a POST again.
    struct StallingClient {
        inner: Arc<MockHttpClient>,
        stalled: std::sync::atomic::AtomicBool,
    }

    #[async_trait]
    impl HttpClient for StallingClient {
        async fn get(&self, url: &str) -> Result<Value, String> {
            self.inner.get(url).await
        }

        async fn post(&self, url: &str, body: Value) -> Result<Value, String> {
            if self.stalled.load(std::sync::atomic::Ordering::SeqCst) {
                std::future::pending::<()>().await;
            }
            self.inner.post(url, body).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_interrupts_a_cycle_stuck_on_the_endpoint() {
        let inner = Arc::new(MockHttpClient::new());
        inner.respond(PULL, empty_page());
        let client = Arc::new(StallingClient {
            inner,
            stalled: std::sync::atomic::AtomicBool::new(false),
        });
        let store = Arc::new(MemoryStore::new());
        let session = ReplicationSession::new(
            CollectionSyncConfig::new("orders"),
            primary(),
            client.clone(),
            store,
            SessionConfig::default().with_poll_interval(Duration::from_secs(30)),
        );

        session.start().await.unwrap();
        client
            .stalled
            .store(true, std::sync::atomic::Ordering::SeqCst);
        // The 30s tick is now parked on a request that never returns.
        tokio::time::sleep(Duration::from_secs(31)).await;

        tokio::time::timeout(Duration::from_secs(1), session.cancel())
            .await
            .expect("cancel waited on the stuck cycle")
            .unwrap();
        assert!(!session.is_active());
    }
}
