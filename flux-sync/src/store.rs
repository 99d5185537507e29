//! In-memory document cache with garbage collection.
//!
//! Architecture:
//! ```text
//!  Gateway ──connect()──►┌──────────────────────────────┐
//!                        │ DocumentStore                 │
//!  Relay ──get_loaded()─►│  name → DocumentEntry         │
//!                        │          ├── replica          │──save()──► Persistence
//!                        │          ├── awareness        │
//!                        │          ├── connections      │
//!                        │          └── events (fan-out) │
//!                        └──────────────┬───────────────┘
//!                                       │ every gc_interval
//!                                       ▼
//!                  stale presence → expire
//!                  idle + connection-less → persist → remove → on_destroy
//! ```
//!
//! Each name maps to at most one live replica. Loading happens outside the
//! map lock; concurrent callers for the same name wait on a shared
//! `OnceCell` so the persistence hook runs once.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::{broadcast, watch, OnceCell};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::awareness::{Awareness, AwarenessChange, AwarenessUpdate, ClientId, RemovalReason};
use crate::hooks::{lock, LifecycleHooks, NoopHooks, Persistence, PersistenceError};
use crate::mergeable::{yrs_factory, MergeError, Mergeable, ReplicaFactory};
use crate::protocol::Frame;

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Period of the GC sweep.
    pub gc_interval: Duration,
    /// Idle time after which a connection-less document is evicted.
    pub gc_ttl: Duration,
    /// Coalesce persistence of bursts of updates. `None` persists every update.
    pub persist_debounce: Option<Duration>,
    /// Events buffered per subscriber before it starts lagging.
    pub broadcast_capacity: usize,
    /// Relayed presence not refreshed for this long is dropped at the next
    /// sweep; removed entries are forgotten after the same delay.
    pub presence_ttl: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            gc_interval: Duration::from_secs(60),
            gc_ttl: Duration::from_secs(30 * 60),
            persist_debounce: None,
            broadcast_capacity: 256,
            presence_ttl: Duration::from_secs(30),
        }
    }
}

/// Where a mutation came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Origin {
    /// A local client connection.
    Connection(Uuid),
    /// Another server, delivered through the relay.
    Relay,
    /// The server itself (load, administrative writes).
    Server,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Update,
    Awareness,
}

/// A pre-encoded frame fanned out to every subscriber of a document.
#[derive(Debug, Clone)]
pub struct DocEvent {
    pub origin: Origin,
    pub kind: EventKind,
    pub frame: Arc<Vec<u8>>,
}

/// Cancellation handle for a background listener. Dropping it stops the task.
#[derive(Debug)]
pub struct Subscription {
    handle: JoinHandle<()>,
}

impl Subscription {
    pub fn new(handle: JoinHandle<()>) -> Self {
        Self { handle }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// One cached document.
pub struct DocumentEntry {
    name: String,
    replica: Box<dyn Mergeable>,
    awareness: Mutex<Awareness>,
    connections: Mutex<HashSet<Uuid>>,
    last_access: Mutex<Instant>,
    /// Bumped on every applied update.
    version: AtomicU64,
    /// Set when the initial load failed; the next persist retries it first.
    needs_reload: AtomicBool,
    events: broadcast::Sender<DocEvent>,
    subscriptions: Mutex<Vec<Subscription>>,
}

impl DocumentEntry {
    fn new(name: &str, replica: Box<dyn Mergeable>, capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity.max(1));
        Self {
            name: name.to_string(),
            replica,
            awareness: Mutex::new(Awareness::new()),
            connections: Mutex::new(HashSet::new()),
            last_access: Mutex::new(Instant::now()),
            version: AtomicU64::new(0),
            needs_reload: AtomicBool::new(false),
            events,
            subscriptions: Mutex::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Receive every update and awareness frame of this document.
    pub fn subscribe(&self) -> broadcast::Receiver<DocEvent> {
        self.events.subscribe()
    }

    /// Apply an update and fan it out tagged with `origin`.
    pub fn apply_update(&self, update: &[u8], origin: Origin) -> Result<(), MergeError> {
        self.replica.apply_update(update)?;
        self.version.fetch_add(1, Ordering::SeqCst);
        self.touch();
        let frame = Frame::update(update.to_vec()).encode();
        self.emit(origin, EventKind::Update, frame);
        Ok(())
    }

    pub fn encode_state_as_update(&self) -> Vec<u8> {
        self.replica.encode_state_as_update()
    }

    pub fn encode_state_vector(&self) -> Vec<u8> {
        self.replica.encode_state_vector()
    }

    pub fn encode_diff(&self, state_vector: &[u8]) -> Result<Vec<u8>, MergeError> {
        self.replica.encode_diff(state_vector)
    }

    /// Replace `client`'s presence. Returns the diff to publish, if any.
    pub fn set_presence(&self, client: ClientId, state: Value) -> Option<AwarenessUpdate> {
        self.mutate_awareness(Origin::Connection(client), |a| a.set_local_state(client, state))
    }

    pub fn set_presence_field(
        &self,
        client: ClientId,
        field: &str,
        value: Value,
    ) -> Option<AwarenessUpdate> {
        self.mutate_awareness(Origin::Connection(client), |a| {
            a.set_local_state_field(client, field, value)
        })
    }

    /// Drop presence entries and broadcast their removal immediately.
    pub fn remove_presence(
        &self,
        clients: &[ClientId],
        reason: RemovalReason,
    ) -> Option<AwarenessUpdate> {
        let origin = match clients {
            [only] => Origin::Connection(*only),
            _ => Origin::Server,
        };
        self.mutate_awareness(origin, |a| a.remove_states(clients, reason))
    }

    /// Merge presence published by another server.
    pub fn apply_remote_awareness(&self, update: &AwarenessUpdate) -> AwarenessChange {
        let mut change = AwarenessChange::default();
        self.mutate_awareness(Origin::Relay, |a| {
            change = a.apply_update(update);
            change.clone()
        });
        change
    }

    /// Expire stale relayed presence and old tombstones. Removals are
    /// broadcast to local connections only.
    pub fn expire_presence(&self, now: Instant, ttl: Duration) -> Option<AwarenessUpdate> {
        self.mutate_awareness(Origin::Server, |a| a.expire(now, ttl))
    }

    /// Every live presence entry.
    pub fn awareness_snapshot(&self) -> AwarenessUpdate {
        lock(&self.awareness).encode_full()
    }

    pub fn presence_of(&self, client: &ClientId) -> Option<Value> {
        lock(&self.awareness).get_state(client).cloned()
    }

    pub fn presence_count(&self) -> usize {
        lock(&self.awareness).len()
    }

    pub fn connection_count(&self) -> usize {
        lock(&self.connections).len()
    }

    pub fn version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }

    pub fn touch(&self) {
        *lock(&self.last_access) = Instant::now();
    }

    pub fn last_access(&self) -> Instant {
        *lock(&self.last_access)
    }

    /// Connection-less and untouched for at least `ttl` as of `now`.
    pub fn is_idle(&self, now: Instant, ttl: Duration) -> bool {
        self.connection_count() == 0 && now.saturating_duration_since(self.last_access()) >= ttl
    }

    fn mutate_awareness(
        &self,
        origin: Origin,
        f: impl FnOnce(&mut Awareness) -> AwarenessChange,
    ) -> Option<AwarenessUpdate> {
        let update = {
            let mut awareness = lock(&self.awareness);
            let change = f(&mut awareness);
            if change.is_empty() {
                return None;
            }
            awareness.encode_change(&change)
        };
        match update.encode() {
            Ok(payload) => {
                self.emit(origin, EventKind::Awareness, Frame::Awareness(payload).encode());
                Some(update)
            }
            Err(e) => {
                log::error!("awareness encode failed for {}: {e}", self.name);
                None
            }
        }
    }

    fn emit(&self, origin: Origin, kind: EventKind, frame: Vec<u8>) {
        // No receivers is fine: nobody is listening yet.
        let _ = self.events.send(DocEvent {
            origin,
            kind,
            frame: Arc::new(frame),
        });
    }

    fn attach(&self, subscription: Subscription) {
        lock(&self.subscriptions).push(subscription);
    }

    /// Cancel every background listener bound to this entry.
    fn release(&self) {
        lock(&self.subscriptions).clear();
    }
}

impl std::fmt::Debug for DocumentEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentEntry")
            .field("name", &self.name)
            .field("connections", &self.connection_count())
            .field("version", &self.version())
            .finish()
    }
}

/// Store statistics.
#[derive(Debug, Clone, Default)]
pub struct StoreStats {
    pub documents: usize,
    pub connections: usize,
    pub per_document: BTreeMap<String, usize>,
    pub persisted: u64,
    pub persist_failures: u64,
    pub evicted: u64,
}

#[derive(Default)]
struct StoreCounters {
    persisted: AtomicU64,
    persist_failures: AtomicU64,
    evicted: AtomicU64,
}

type Slot = Arc<OnceCell<Arc<DocumentEntry>>>;

/// Owns every replica of this process.
pub struct DocumentStore {
    config: StoreConfig,
    persistence: Arc<dyn Persistence>,
    hooks: Arc<dyn LifecycleHooks>,
    factory: ReplicaFactory,
    docs: Mutex<HashMap<String, Slot>>,
    counters: Arc<StoreCounters>,
}

impl DocumentStore {
    pub fn new(config: StoreConfig, persistence: Arc<dyn Persistence>) -> Self {
        Self {
            config,
            persistence,
            hooks: Arc::new(NoopHooks),
            factory: yrs_factory(),
            docs: Mutex::new(HashMap::new()),
            counters: Arc::new(StoreCounters::default()),
        }
    }

    pub fn with_hooks(mut self, hooks: Arc<dyn LifecycleHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn with_factory(mut self, factory: ReplicaFactory) -> Self {
        self.factory = factory;
        self
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn hooks(&self) -> &Arc<dyn LifecycleHooks> {
        &self.hooks
    }

    /// Cached entry (access time refreshed) or a freshly loaded one.
    pub async fn get_document(&self, name: &str) -> Arc<DocumentEntry> {
        self.resolve(name, None).await.0
    }

    /// Like [`get_document`](Self::get_document) but registers `connection`
    /// in the same critical section, so GC cannot evict in between.
    /// Returns the entry and its connection count.
    pub async fn connect(&self, name: &str, connection: Uuid) -> (Arc<DocumentEntry>, usize) {
        self.resolve(name, Some(connection)).await
    }

    /// Loaded entry without creating or touching it.
    pub fn get_loaded(&self, name: &str) -> Option<Arc<DocumentEntry>> {
        lock(&self.docs).get(name).and_then(|slot| slot.get().cloned())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get_loaded(name).is_some()
    }

    /// Register a connection. Returns the new count.
    pub fn add_connection(&self, entry: &DocumentEntry, connection: Uuid) -> usize {
        entry.touch();
        let mut conns = lock(&entry.connections);
        conns.insert(connection);
        conns.len()
    }

    /// Deregister a connection. Returns the remaining count.
    pub fn remove_connection(&self, entry: &DocumentEntry, connection: Uuid) -> usize {
        entry.touch();
        let mut conns = lock(&entry.connections);
        conns.remove(&connection);
        conns.len()
    }

    async fn resolve(&self, name: &str, connection: Option<Uuid>) -> (Arc<DocumentEntry>, usize) {
        loop {
            let slot = {
                let mut docs = lock(&self.docs);
                docs.entry(name.to_string())
                    .or_insert_with(|| Arc::new(OnceCell::new()))
                    .clone()
            };
            let entry = slot.get_or_init(|| self.load(name)).await.clone();

            // GC may have evicted the entry while we waited on the slot.
            let docs = lock(&self.docs);
            if docs.get(name).is_some_and(|current| Arc::ptr_eq(current, &slot)) {
                let count = match connection {
                    Some(id) => self.add_connection(&entry, id),
                    None => {
                        entry.touch();
                        entry.connection_count()
                    }
                };
                return (entry, count);
            }
            log::debug!("document {name} was evicted during lookup, retrying");
        }
    }

    async fn load(&self, name: &str) -> Arc<DocumentEntry> {
        let replica = (self.factory)();
        let mut needs_reload = false;
        match self.persistence.load(name).await {
            Ok(Some(state)) => match replica.apply_update(&state) {
                Ok(()) => log::info!("loaded document {name} ({} bytes)", state.len()),
                Err(e) => {
                    // Every save retries the stored state first and fails the
                    // same way, so the bytes on disk are never overwritten.
                    needs_reload = true;
                    log::error!("stored state of {name} is unreadable, saves blocked: {e}");
                }
            },
            Ok(None) => log::debug!("created empty document {name}"),
            Err(e) => {
                needs_reload = true;
                log::error!("failed to load {name}, serving from memory: {e}");
            }
        }

        let entry = Arc::new(DocumentEntry::new(
            name,
            replica,
            self.config.broadcast_capacity,
        ));
        entry.needs_reload.store(needs_reload, Ordering::SeqCst);

        let persister = tokio::spawn(persist_loop(
            Arc::downgrade(&entry),
            entry.subscribe(),
            self.persistence.clone(),
            self.counters.clone(),
            self.config.persist_debounce,
        ));
        entry.attach(Subscription::new(persister));
        entry
    }

    /// One GC sweep as of now.
    pub async fn collect_garbage(&self) -> usize {
        self.collect_garbage_at(Instant::now()).await
    }

    /// One GC sweep as of `now`. Returns the number of evicted documents.
    ///
    /// A failure on one document is logged and does not stop the sweep.
    pub async fn collect_garbage_at(&self, now: Instant) -> usize {
        let ttl = self.config.gc_ttl;
        let loaded: Vec<Arc<DocumentEntry>> = lock(&self.docs)
            .values()
            .filter_map(|slot| slot.get().cloned())
            .collect();
        let mut candidates = Vec::new();
        for entry in loaded {
            if let Some(expired) = entry.expire_presence(now, self.config.presence_ttl) {
                log::debug!(
                    "gc: expired {} presence entries of {}",
                    expired.entries.len(),
                    entry.name()
                );
            }
            if entry.is_idle(now, ttl) {
                candidates.push(entry);
            }
        }

        let mut evicted = 0;
        for entry in candidates {
            match self.evict(&entry, Some(now)).await {
                Ok(true) => evicted += 1,
                Ok(false) => {}
                Err(e) => {
                    log::error!("gc: keeping {} in memory, persist failed: {e}", entry.name())
                }
            }
        }
        if evicted > 0 {
            log::info!("gc: evicted {evicted} idle documents");
        }
        evicted
    }

    /// Persist and drop a connection-less document now, regardless of age.
    ///
    /// Returns `Ok(false)` when the document is not loaded or still has
    /// connections.
    pub async fn destroy(&self, name: &str) -> Result<bool, PersistenceError> {
        match self.get_loaded(name) {
            Some(entry) => self.evict(&entry, None).await,
            None => Ok(false),
        }
    }

    /// Persist first, then remove from the map, then notify.
    async fn evict(
        &self,
        entry: &Arc<DocumentEntry>,
        idle_as_of: Option<Instant>,
    ) -> Result<bool, PersistenceError> {
        if entry.connection_count() > 0 {
            return Ok(false);
        }
        let version = entry.version();
        persist(entry, self.persistence.as_ref(), &self.counters).await?;

        {
            let mut docs = lock(&self.docs);
            let still_idle = match idle_as_of {
                Some(now) => entry.is_idle(now, self.config.gc_ttl),
                None => entry.connection_count() == 0,
            };
            if !still_idle || entry.version() != version {
                log::debug!("gc: {} became active while persisting", entry.name());
                return Ok(false);
            }
            let owned = docs
                .get(entry.name())
                .and_then(|slot| slot.get())
                .is_some_and(|current| Arc::ptr_eq(current, entry));
            if !owned {
                return Ok(false);
            }
            docs.remove(entry.name());
        }

        entry.release();
        self.counters.evicted.fetch_add(1, Ordering::Relaxed);
        self.hooks.on_destroy(entry.name());
        log::info!("destroyed document {}", entry.name());
        Ok(true)
    }

    /// Run the periodic sweep until `shutdown` flips to true.
    pub async fn run_gc(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.gc_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = ticker.tick() => {
                    self.collect_garbage().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        log::debug!("gc loop stopped");
    }

    /// Persist and drop every document. Used on process shutdown.
    pub async fn close(&self) {
        let entries: Vec<Arc<DocumentEntry>> = lock(&self.docs)
            .drain()
            .filter_map(|(_, slot)| slot.get().cloned())
            .collect();
        for entry in entries {
            if let Err(e) = persist(&entry, self.persistence.as_ref(), &self.counters).await {
                log::error!("shutdown: failed to persist {}: {e}", entry.name());
            }
            entry.release();
            self.hooks.on_destroy(entry.name());
        }
    }

    pub fn len(&self) -> usize {
        lock(&self.docs)
            .values()
            .filter(|slot| slot.initialized())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> StoreStats {
        let per_document: BTreeMap<String, usize> = lock(&self.docs)
            .iter()
            .filter_map(|(name, slot)| slot.get().map(|e| (name.clone(), e.connection_count())))
            .collect();
        StoreStats {
            documents: per_document.len(),
            connections: per_document.values().sum(),
            per_document,
            persisted: self.counters.persisted.load(Ordering::Relaxed),
            persist_failures: self.counters.persist_failures.load(Ordering::Relaxed),
            evicted: self.counters.evicted.load(Ordering::Relaxed),
        }
    }
}

/// Save the full state of `entry`, merging in the stored state first when
/// the initial load failed.
async fn persist(
    entry: &DocumentEntry,
    persistence: &dyn Persistence,
    counters: &StoreCounters,
) -> Result<(), PersistenceError> {
    let result = async {
        if entry.needs_reload.load(Ordering::SeqCst) {
            if let Some(state) = persistence.load(entry.name()).await? {
                entry
                    .replica
                    .apply_update(&state)
                    .map_err(|e| PersistenceError::Codec(e.to_string()))?;
            }
            entry.needs_reload.store(false, Ordering::SeqCst);
            log::info!("recovered stored state of {}", entry.name());
        }
        let state = entry.encode_state_as_update();
        persistence.save(entry.name(), &state).await
    }
    .await;

    match &result {
        Ok(()) => {
            counters.persisted.fetch_add(1, Ordering::Relaxed);
        }
        Err(e) => {
            counters.persist_failures.fetch_add(1, Ordering::Relaxed);
            log::error!("failed to persist {}: {e}", entry.name());
        }
    }
    result
}

async fn persist_loop(
    entry: Weak<DocumentEntry>,
    mut events: broadcast::Receiver<DocEvent>,
    persistence: Arc<dyn Persistence>,
    counters: Arc<StoreCounters>,
    debounce: Option<Duration>,
) {
    use tokio::sync::broadcast::error::{RecvError, TryRecvError};

    loop {
        match events.recv().await {
            Ok(event) if event.kind != EventKind::Update => continue,
            // Lagging is harmless: the full state is saved anyway.
            Ok(_) | Err(RecvError::Lagged(_)) => {}
            Err(RecvError::Closed) => break,
        }
        if let Some(delay) = debounce {
            tokio::time::sleep(delay).await;
            loop {
                match events.try_recv() {
                    Ok(_) | Err(TryRecvError::Lagged(_)) => continue,
                    Err(_) => break,
                }
            }
        }
        let Some(entry) = entry.upgrade() else { break };
        // Errors are counted and logged inside; the document keeps serving.
        let _ = persist(&entry, persistence.as_ref(), &counters).await;
    }
}
