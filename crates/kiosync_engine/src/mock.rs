//! In-memory probes and sessions for tests and simulations.

use crate::error::{SyncError, SyncResult};
use crate::http::HttpClient;
use crate::session::{DocumentStore, PendingChange};
use crate::transport::{
    Cancelable, LivenessProbe, Resyncable, SessionFactory, SessionTransport, Startable,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kiosync_protocol::{
    CollectionId, CollectionSyncConfig, Document, Endpoint, EndpointId, LocalChange,
};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// A liveness probe whose answers are set by the test.
#[derive(Debug)]
pub struct MockProbe {
    healthy: [AtomicBool; 2],
    delay: Mutex<[Duration; 2]>,
    probes: [AtomicUsize; 2],
}

impl MockProbe {
    /// Creates a probe that reports both endpoints healthy.
    pub fn new() -> Self {
        Self {
            healthy: [AtomicBool::new(true), AtomicBool::new(true)],
            delay: Mutex::new([Duration::ZERO; 2]),
            probes: [AtomicUsize::new(0), AtomicUsize::new(0)],
        }
    }

    /// Sets whether probes of `endpoint` succeed.
    pub fn set_healthy(&self, endpoint: EndpointId, healthy: bool) {
        self.healthy[slot(endpoint)].store(healthy, Ordering::SeqCst);
    }

    /// Returns whether probes of `endpoint` succeed.
    pub fn is_healthy(&self, endpoint: EndpointId) -> bool {
        self.healthy[slot(endpoint)].load(Ordering::SeqCst)
    }

    /// Delays every probe of `endpoint`.
    pub fn set_delay(&self, endpoint: EndpointId, delay: Duration) {
        self.delay.lock()[slot(endpoint)] = delay;
    }

    /// Number of probes issued against `endpoint`.
    pub fn probe_count(&self, endpoint: EndpointId) -> usize {
        self.probes[slot(endpoint)].load(Ordering::SeqCst)
    }
}

impl Default for MockProbe {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LivenessProbe for MockProbe {
    async fn probe(&self, endpoint: &Endpoint) -> SyncResult<()> {
        self.probes[slot(endpoint.id)].fetch_add(1, Ordering::SeqCst);
        let delay = self.delay.lock()[slot(endpoint.id)];
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.is_healthy(endpoint.id) {
            Ok(())
        } else {
            Err(SyncError::transport_retryable(format!(
                "{} unreachable",
                endpoint.base_url
            )))
        }
    }
}

/// A call made on a mock session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOp {
    /// `start()`
    Start,
    /// `cancel()`
    Cancel,
    /// `resync()`
    Resync,
    /// `reset_checkpoint()`
    ResetCheckpoint,
}

/// One recorded call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionCall {
    /// Collection of the session.
    pub collection: CollectionId,
    /// Endpoint of the session.
    pub endpoint: EndpointId,
    /// The call.
    pub op: SessionOp,
}

/// Shared, ordered record of calls across all mock sessions.
#[derive(Debug, Clone, Default)]
pub struct SessionLog {
    calls: Arc<Mutex<Vec<SessionCall>>>,
}

impl SessionLog {
    fn push(&self, collection: &CollectionId, endpoint: EndpointId, op: SessionOp) {
        self.calls.lock().push(SessionCall {
            collection: collection.clone(),
            endpoint,
            op,
        });
    }

    /// Returns all calls so far.
    pub fn calls(&self) -> Vec<SessionCall> {
        self.calls.lock().clone()
    }

    /// Returns calls of one kind.
    pub fn calls_of(&self, op: SessionOp) -> Vec<SessionCall> {
        self.calls
            .lock()
            .iter()
            .filter(|call| call.op == op)
            .cloned()
            .collect()
    }

    /// Number of start/cancel/resync calls (checkpoint resets excluded).
    pub fn transport_call_count(&self) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|call| call.op != SessionOp::ResetCheckpoint)
            .count()
    }

    /// Forgets all recorded calls.
    pub fn clear(&self) {
        self.calls.lock().clear();
    }
}

/// A session that records calls and tracks a transport-level active flag.
#[derive(Debug)]
pub struct MockSession {
    collection: CollectionId,
    endpoint: EndpointId,
    log: SessionLog,
    active: AtomicBool,
    fail_start: AtomicBool,
    fail_cancel: AtomicBool,
    start_delay: Mutex<Duration>,
    untracked_cancels: AtomicUsize,
    last_synced_at: Mutex<Option<DateTime<Utc>>>,
}

impl MockSession {
    fn new(collection: CollectionId, endpoint: EndpointId, log: SessionLog) -> Self {
        Self {
            collection,
            endpoint,
            log,
            active: AtomicBool::new(false),
            fail_start: AtomicBool::new(false),
            fail_cancel: AtomicBool::new(false),
            start_delay: Mutex::new(Duration::ZERO),
            untracked_cancels: AtomicUsize::new(0),
            last_synced_at: Mutex::new(None),
        }
    }

    /// Makes subsequent starts fail.
    pub fn set_fail_start(&self, fail: bool) {
        self.fail_start.store(fail, Ordering::SeqCst);
    }

    /// Makes subsequent cancels fail.
    pub fn set_fail_cancel(&self, fail: bool) {
        self.fail_cancel.store(fail, Ordering::SeqCst);
    }

    /// Delays subsequent starts.
    pub fn set_start_delay(&self, delay: Duration) {
        *self.start_delay.lock() = delay;
    }

    /// Forces the transport-level active flag, as a transport that
    /// reconnected on its own would.
    pub fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::SeqCst);
    }

    /// Number of cancels that reached a transport with nothing to release.
    pub fn untracked_cancels(&self) -> usize {
        self.untracked_cancels.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Startable for MockSession {
    async fn start(&self) -> SyncResult<()> {
        self.log.push(&self.collection, self.endpoint, SessionOp::Start);
        let delay = *self.start_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(SyncError::transport_retryable("mock start failure"));
        }
        self.active.store(true, Ordering::SeqCst);
        *self.last_synced_at.lock() = Some(Utc::now());
        Ok(())
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Cancelable for MockSession {
    async fn cancel(&self) -> SyncResult<()> {
        self.log.push(&self.collection, self.endpoint, SessionOp::Cancel);
        if self.fail_cancel.load(Ordering::SeqCst) {
            return Err(SyncError::transport_fatal("mock cancel failure"));
        }
        if !self.active.swap(false, Ordering::SeqCst) {
            self.untracked_cancels.fetch_add(1, Ordering::SeqCst);
            return Err(SyncError::AlreadyReleased);
        }
        Ok(())
    }
}

#[async_trait]
impl Resyncable for MockSession {
    async fn resync(&self) -> SyncResult<()> {
        self.log.push(&self.collection, self.endpoint, SessionOp::Resync);
        *self.last_synced_at.lock() = Some(Utc::now());
        Ok(())
    }
}

impl SessionTransport for MockSession {
    fn reset_checkpoint(&self) {
        self.log
            .push(&self.collection, self.endpoint, SessionOp::ResetCheckpoint);
    }

    fn last_synced_at(&self) -> Option<DateTime<Utc>> {
        *self.last_synced_at.lock()
    }
}

/// Creates [`MockSession`]s and keeps handles to them.
#[derive(Debug, Default)]
pub struct MockSessionFactory {
    log: SessionLog,
    sessions: Mutex<HashMap<(CollectionId, EndpointId), Arc<MockSession>>>,
    failing_starts: Mutex<HashSet<(CollectionId, EndpointId)>>,
    start_delay: Mutex<Duration>,
}

impl MockSessionFactory {
    /// Creates a factory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the shared call log.
    pub fn log(&self) -> &SessionLog {
        &self.log
    }

    /// Returns the most recently created session for a pair.
    pub fn session(&self, collection: &str, endpoint: EndpointId) -> Option<Arc<MockSession>> {
        self.sessions
            .lock()
            .get(&(CollectionId::new(collection), endpoint))
            .cloned()
    }

    /// Number of sessions created so far.
    pub fn created(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Makes starts fail for a pair, including sessions created later.
    pub fn fail_starts_for(&self, collection: &str, endpoint: EndpointId) {
        let key = (CollectionId::new(collection), endpoint);
        if let Some(session) = self.sessions.lock().get(&key) {
            session.set_fail_start(true);
        }
        self.failing_starts.lock().insert(key);
    }

    /// Delays starts on every session, including sessions created later.
    pub fn set_start_delay(&self, delay: Duration) {
        *self.start_delay.lock() = delay;
        for session in self.sessions.lock().values() {
            session.set_start_delay(delay);
        }
    }

    /// Total cancels that reached a transport with nothing to release.
    pub fn untracked_cancels(&self) -> usize {
        self.sessions
            .lock()
            .values()
            .map(|session| session.untracked_cancels())
            .sum()
    }

    /// Collections with an active transport on each endpoint.
    pub fn active_on(&self, endpoint: EndpointId) -> Vec<CollectionId> {
        let mut active: Vec<_> = self
            .sessions
            .lock()
            .iter()
            .filter(|((_, id), session)| *id == endpoint && session.is_active())
            .map(|((collection, _), _)| collection.clone())
            .collect();
        active.sort();
        active
    }
}

impl SessionFactory for MockSessionFactory {
    fn create(
        &self,
        collection: &CollectionSyncConfig,
        endpoint: &Endpoint,
    ) -> Arc<dyn SessionTransport> {
        let key = (collection.id.clone(), endpoint.id);
        let session = Arc::new(MockSession::new(
            collection.id.clone(),
            endpoint.id,
            self.log.clone(),
        ));
        session.set_start_delay(*self.start_delay.lock());
        if self.failing_starts.lock().contains(&key) {
            session.set_fail_start(true);
        }
        self.sessions.lock().insert(key, Arc::clone(&session));
        session
    }
}

/// One request seen by [`MockHttpClient`].
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedRequest {
    /// `"GET"` or `"POST"`.
    pub method: &'static str,
    /// Full URL.
    pub url: String,
    /// JSON body of a POST.
    pub body: Option<Value>,
}

#[derive(Debug, Default)]
struct Route {
    queued: VecDeque<Result<Value, String>>,
    fallback: Option<Result<Value, String>>,
}

/// An HTTP client answering from scripted per-URL responses.
///
/// Queued responses are served first, in order; after that the URL's
/// standing response repeats. Unscripted URLs fail.
#[derive(Debug, Default)]
pub struct MockHttpClient {
    routes: Mutex<HashMap<String, Route>>,
    requests: Mutex<Vec<RecordedRequest>>,
}

impl MockHttpClient {
    /// Creates a client with no routes.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the standing response for `url`.
    pub fn respond(&self, url: &str, body: Value) {
        self.routes.lock().entry(url.to_string()).or_default().fallback = Some(Ok(body));
    }

    /// Makes `url` fail until told otherwise.
    pub fn fail(&self, url: &str, message: &str) {
        self.routes.lock().entry(url.to_string()).or_default().fallback =
            Some(Err(message.to_string()));
    }

    /// Queues a one-shot response for `url`.
    pub fn enqueue(&self, url: &str, response: Result<Value, String>) {
        self.routes
            .lock()
            .entry(url.to_string())
            .or_default()
            .queued
            .push_back(response);
    }

    /// Returns every request so far.
    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().clone()
    }

    /// Returns the bodies posted to `url`, in order.
    pub fn bodies(&self, url: &str) -> Vec<Value> {
        self.requests
            .lock()
            .iter()
            .filter(|request| request.url == url)
            .filter_map(|request| request.body.clone())
            .collect()
    }

    fn answer(&self, method: &'static str, url: &str, body: Option<Value>) -> Result<Value, String> {
        self.requests.lock().push(RecordedRequest {
            method,
            url: url.to_string(),
            body,
        });

        let mut routes = self.routes.lock();
        let Some(route) = routes.get_mut(url) else {
            return Err(format!("no route for {url}"));
        };
        match route.queued.pop_front() {
            Some(response) => response,
            None => route
                .fallback
                .clone()
                .unwrap_or_else(|| Err(format!("no response left for {url}"))),
        }
    }
}

#[async_trait]
impl HttpClient for MockHttpClient {
    async fn get(&self, url: &str) -> Result<Value, String> {
        self.answer("GET", url, None)
    }

    async fn post(&self, url: &str, body: Value) -> Result<Value, String> {
        self.answer("POST", url, Some(body))
    }
}

/// An in-memory [`DocumentStore`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    documents: Mutex<BTreeMap<CollectionId, BTreeMap<String, Document>>>,
    pending: Mutex<BTreeMap<CollectionId, Vec<PendingChange>>>,
    next_seq: AtomicU64,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a local change waiting to be pushed and applies it locally.
    ///
    /// Returns the change's sequence number.
    pub fn record_change(&self, collection: &CollectionId, change: LocalChange) -> u64 {
        self.write_document(collection, change.document.clone());
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        self.pending
            .lock()
            .entry(collection.clone())
            .or_default()
            .push(PendingChange { seq, change });
        seq
    }

    /// Returns a stored document.
    pub fn document(&self, collection: &CollectionId, id: &str) -> Option<Document> {
        self.documents
            .lock()
            .get(collection)
            .and_then(|docs| docs.get(id))
            .cloned()
    }

    /// Number of live documents in a collection.
    pub fn len(&self, collection: &CollectionId) -> usize {
        self.documents.lock().get(collection).map_or(0, BTreeMap::len)
    }

    /// Returns true if the collection holds no documents.
    pub fn is_empty(&self, collection: &CollectionId) -> bool {
        self.len(collection) == 0
    }

    /// Changes not yet acknowledged.
    pub fn pending(&self, collection: &CollectionId) -> Vec<LocalChange> {
        self.pending
            .lock()
            .get(collection)
            .map(|pending| pending.iter().map(|p| p.change.clone()).collect())
            .unwrap_or_default()
    }

    fn write_document(&self, collection: &CollectionId, document: Document) {
        let mut documents = self.documents.lock();
        let docs = documents.entry(collection.clone()).or_default();
        if document.deleted {
            docs.remove(&document.id);
        } else {
            docs.insert(document.id.clone(), document);
        }
    }
}

impl DocumentStore for MemoryStore {
    fn apply_pulled(&self, collection: &CollectionId, documents: &[Document]) -> SyncResult<()> {
        for document in documents {
            self.write_document(collection, document.clone());
        }
        Ok(())
    }

    fn pending_changes(
        &self,
        collection: &CollectionId,
        limit: usize,
    ) -> SyncResult<Vec<PendingChange>> {
        Ok(self
            .pending
            .lock()
            .get(collection)
            .map(|changes| changes.iter().take(limit).cloned().collect())
            .unwrap_or_default())
    }

    fn acknowledge(&self, collection: &CollectionId, seqs: &[u64]) -> SyncResult<()> {
        if let Some(pending) = self.pending.lock().get_mut(collection) {
            pending.retain(|p| !seqs.contains(&p.seq));
        }
        Ok(())
    }
}

fn slot(endpoint: EndpointId) -> usize {
    match endpoint {
        EndpointId::Primary => 0,
        EndpointId::Secondary => 1,
    }
}
