//! Cross-server relay.
//!
//! Every process holds its own replica of a document. The relay wraps
//! locally originated updates and awareness diffs in a [`RelayMessage`]
//! stamped with this process's id and publishes them on the document's
//! channel. Incoming messages carrying our own id are discarded; the rest
//! are merged into the local entry with [`Origin::Relay`], which the
//! gateway never publishes again.
//!
//! Channel layout under the configured prefix:
//! - `{prefix}:doc:{name}` update and awareness traffic
//! - `{prefix}:snapshot:{name}` durable snapshot
//! - `{prefix}:presence:{name}` TTL presence hash, one field per client
//!
//! A bus outage never fails a caller. It is logged once per transition and
//! shows up in [`RelayStats::degraded`]. Any failed call, or a link that was
//! re-established underneath us, marks the relay for a resync. The next
//! health tick with a reachable bus re-subscribes every channel, then for
//! each loaded document publishes its full state and a
//! [`RelayKind::SyncRequest`] carrying its state vector. Peers answer the
//! request with the diff the requester lacks, so both sides recover what was
//! published while they were apart.

pub mod bus;
pub mod hub;
pub mod memory;
pub mod remote;

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;
use uuid::Uuid;

use crate::awareness::AwarenessUpdate;
use crate::hooks::{lock, Persistence, PersistenceError};
use crate::protocol::ProtocolError;
use crate::store::{DocumentEntry, DocumentStore, Origin};

pub use bus::{Bus, BusDelivery, BusError};
pub use hub::BusHub;
pub use memory::{MemoryBroker, MemoryBus};
pub use remote::{RemoteBus, RemoteBusConfig};

#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Namespace for every channel and key.
    pub prefix: String,
    /// Lifetime of a presence hash field without refresh.
    pub presence_ttl: Duration,
    /// How often the relay checks whether a resync is due.
    pub health_interval: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            prefix: "flux".to_string(),
            presence_ttl: Duration::from_secs(30),
            health_interval: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RelayKind {
    Update,
    Awareness,
    /// Payload is the sender's state vector; peers reply with an `Update`
    /// holding what the sender lacks.
    SyncRequest,
}

/// Envelope published on a document channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayMessage {
    pub kind: RelayKind,
    pub doc: String,
    pub payload: Vec<u8>,
    pub origin: Uuid,
    pub timestamp_ms: u64,
}

impl RelayMessage {
    pub fn new(kind: RelayKind, doc: &str, payload: Vec<u8>, origin: Uuid) -> Self {
        let timestamp_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Self {
            kind,
            doc: doc.to_string(),
            payload,
            origin,
            timestamp_ms,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Codec(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (message, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Codec(e.to_string()))?;
        Ok(message)
    }
}

/// What the relay did with one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Applied,
    /// Published by this process.
    Suppressed,
    /// Nobody here has the document open.
    NotLoaded,
    /// A peer's sync request was answered with a diff.
    Answered,
    Rejected,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub server_id: Uuid,
    pub published: u64,
    pub received: u64,
    pub applied: u64,
    pub suppressed: u64,
    pub answered: u64,
    pub failures: u64,
    pub channels: usize,
    pub degraded: bool,
    pub resyncs: u64,
}

#[derive(Default)]
struct RelayCounters {
    published: AtomicU64,
    received: AtomicU64,
    applied: AtomicU64,
    suppressed: AtomicU64,
    answered: AtomicU64,
    failures: AtomicU64,
    resyncs: AtomicU64,
}

pub struct Relay {
    server_id: Uuid,
    bus: Arc<dyn Bus>,
    config: RelayConfig,
    channels: Mutex<HashSet<String>>,
    counters: RelayCounters,
    available: AtomicBool,
    /// Set by any bus failure or link change, cleared when a health check starts resyncing.
    resync_pending: AtomicBool,
    seen_epoch: AtomicU64,
}

impl Relay {
    pub fn new(bus: Arc<dyn Bus>, config: RelayConfig) -> Self {
        Self {
            server_id: Uuid::new_v4(),
            config,
            channels: Mutex::new(HashSet::new()),
            counters: RelayCounters::default(),
            available: AtomicBool::new(true),
            resync_pending: AtomicBool::new(false),
            seen_epoch: AtomicU64::new(bus.link_epoch()),
            bus,
        }
    }

    pub fn with_server_id(mut self, server_id: Uuid) -> Self {
        self.server_id = server_id;
        self
    }

    pub fn server_id(&self) -> Uuid {
        self.server_id
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn channel_for(&self, doc: &str) -> String {
        format!("{}:doc:{doc}", self.config.prefix)
    }

    fn snapshot_key(&self, doc: &str) -> String {
        format!("{}:snapshot:{doc}", self.config.prefix)
    }

    fn presence_key(&self, doc: &str) -> String {
        format!("{}:presence:{doc}", self.config.prefix)
    }

    /// Start receiving `doc` traffic. Kept in the channel set even when the
    /// bus is down so the next health check restores it.
    pub async fn subscribe(&self, doc: &str) {
        let channel = self.channel_for(doc);
        if !lock(&self.channels).insert(channel.clone()) {
            return;
        }
        let result = self.bus.subscribe(&channel).await;
        if self.observe("subscribe", result).is_some() {
            log::debug!("relay subscribed to {channel}");
        }
    }

    pub async fn unsubscribe(&self, doc: &str) {
        let channel = self.channel_for(doc);
        if !lock(&self.channels).remove(&channel) {
            return;
        }
        let result = self.bus.unsubscribe(&channel).await;
        if self.observe("unsubscribe", result).is_some() {
            log::debug!("relay unsubscribed from {channel}");
        }
    }

    pub fn is_subscribed(&self, doc: &str) -> bool {
        lock(&self.channels).contains(&self.channel_for(doc))
    }

    /// Publish a locally originated update.
    pub async fn publish_update(&self, doc: &str, update: &[u8]) {
        self.publish(RelayMessage::new(
            RelayKind::Update,
            doc,
            update.to_vec(),
            self.server_id,
        ))
        .await;
    }

    /// Publish a locally originated awareness diff and mirror it into the
    /// shared presence hash.
    pub async fn publish_awareness(&self, doc: &str, update: &AwarenessUpdate) {
        let payload = match update.encode() {
            Ok(payload) => payload,
            Err(e) => {
                log::error!("relay: cannot encode awareness for {doc}: {e}");
                return;
            }
        };
        if !self
            .publish(RelayMessage::new(
                RelayKind::Awareness,
                doc,
                payload,
                self.server_id,
            ))
            .await
        {
            return;
        }

        let key = self.presence_key(doc);
        for entry in &update.entries {
            let field = entry.client.to_string();
            let result = match &entry.state {
                Some(state) => {
                    self.bus
                        .presence_set(
                            &key,
                            &field,
                            state.as_bytes().to_vec(),
                            self.config.presence_ttl,
                        )
                        .await
                }
                None => self.bus.presence_remove(&key, &field).await,
            };
            if self.observe("presence", result).is_none() {
                return;
            }
        }
    }

    async fn publish(&self, message: RelayMessage) -> bool {
        let bytes = match message.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                log::error!("relay: cannot encode message for {}: {e}", message.doc);
                return false;
            }
        };
        let result = self.bus.publish(&self.channel_for(&message.doc), bytes).await;
        let sent = self.observe("publish", result).is_some();
        if sent {
            self.counters.published.fetch_add(1, Ordering::Relaxed);
        }
        sent
    }

    pub async fn store_snapshot(&self, doc: &str, state: &[u8]) -> Result<(), BusError> {
        let result = self
            .bus
            .set_snapshot(&self.snapshot_key(doc), state.to_vec())
            .await;
        self.observe_err("store snapshot", result)
    }

    pub async fn load_snapshot(&self, doc: &str) -> Result<Option<Vec<u8>>, BusError> {
        let result = self.bus.get_snapshot(&self.snapshot_key(doc)).await;
        self.observe_err("load snapshot", result)
    }

    /// Merge the shared snapshot into an entry that stayed loaded while this
    /// process was not subscribed to it.
    pub async fn catch_up(&self, entry: &DocumentEntry) {
        let Ok(Some(state)) = self.load_snapshot(entry.name()).await else {
            return;
        };
        if let Err(e) = entry.apply_update(&state, Origin::Relay) {
            log::warn!("relay: shared snapshot of {} rejected: {e}", entry.name());
        }
    }

    /// Cross-server presence from the TTL hash, keyed by client id.
    pub async fn presence(&self, doc: &str) -> Result<BTreeMap<String, Value>, BusError> {
        let result = self.bus.presence_all(&self.presence_key(doc)).await;
        let fields = self.observe_err("presence query", result)?;
        Ok(fields
            .into_iter()
            .filter_map(|(client, bytes)| {
                serde_json::from_slice(&bytes)
                    .ok()
                    .map(|state| (client, state))
            })
            .collect())
    }

    /// Apply one bus delivery to `store`. Nothing applied here is published
    /// again; a sync request is answered with a fresh diff of local state.
    pub async fn handle_delivery(
        &self,
        store: &DocumentStore,
        delivery: BusDelivery,
    ) -> DeliveryOutcome {
        self.counters.received.fetch_add(1, Ordering::Relaxed);
        let message = match RelayMessage::decode(&delivery.payload) {
            Ok(message) => message,
            Err(e) => {
                self.counters.failures.fetch_add(1, Ordering::Relaxed);
                log::warn!("relay: malformed message on {}: {e}", delivery.channel);
                return DeliveryOutcome::Rejected;
            }
        };
        if message.origin == self.server_id {
            self.counters.suppressed.fetch_add(1, Ordering::Relaxed);
            return DeliveryOutcome::Suppressed;
        }
        let Some(entry) = store.get_loaded(&message.doc) else {
            return DeliveryOutcome::NotLoaded;
        };

        if message.kind == RelayKind::SyncRequest {
            return self.answer(&entry, &message).await;
        }

        let applied = match message.kind {
            RelayKind::SyncRequest => Ok(()),
            RelayKind::Update => entry
                .apply_update(&message.payload, Origin::Relay)
                .map_err(|e| e.to_string()),
            RelayKind::Awareness => AwarenessUpdate::decode(&message.payload)
                .map(|update| {
                    entry.apply_remote_awareness(&update);
                })
                .map_err(|e| e.to_string()),
        };
        match applied {
            Ok(()) => {
                self.counters.applied.fetch_add(1, Ordering::Relaxed);
                DeliveryOutcome::Applied
            }
            Err(e) => {
                self.counters.failures.fetch_add(1, Ordering::Relaxed);
                log::warn!(
                    "relay: rejected {:?} for {} from {}: {e}",
                    message.kind,
                    message.doc,
                    message.origin
                );
                DeliveryOutcome::Rejected
            }
        }
    }

    async fn answer(&self, entry: &DocumentEntry, request: &RelayMessage) -> DeliveryOutcome {
        match entry.encode_diff(&request.payload) {
            Ok(diff) => {
                log::debug!(
                    "relay: answering sync request for {} from {}",
                    request.doc,
                    request.origin
                );
                self.publish_update(&request.doc, &diff).await;
                self.counters.answered.fetch_add(1, Ordering::Relaxed);
                DeliveryOutcome::Answered
            }
            Err(e) => {
                self.counters.failures.fetch_add(1, Ordering::Relaxed);
                log::warn!(
                    "relay: bad sync request for {} from {}: {e}",
                    request.doc,
                    request.origin
                );
                DeliveryOutcome::Rejected
            }
        }
    }

    /// Receive loop. Runs until `shutdown` flips to true.
    pub async fn run(
        self: Arc<Self>,
        store: Arc<DocumentStore>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let Some(mut inbox) = self.bus.take_inbox() else {
            log::error!("relay inbox already taken; cross-server delivery disabled");
            return;
        };
        let mut health = tokio::time::interval(self.config.health_interval);
        health.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        health.tick().await;

        log::info!("relay {} started", self.server_id);
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                delivery = inbox.recv() => match delivery {
                    Some(delivery) => {
                        self.handle_delivery(&store, delivery).await;
                    }
                    None => {
                        log::warn!("relay inbox closed");
                        break;
                    }
                },
                _ = health.tick() => self.check_health(&store).await,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        log::debug!("relay loop stopped");
    }

    /// Resync once the bus is reachable after a failure or a new link:
    /// re-subscribe every channel, then push the full state and pull the
    /// missing diff of every loaded document among them.
    async fn check_health(&self, store: &DocumentStore) {
        let epoch = self.bus.link_epoch();
        if self.seen_epoch.swap(epoch, Ordering::SeqCst) != epoch {
            self.resync_pending.store(true, Ordering::SeqCst);
        }
        if !self.bus.is_available() {
            self.resync_pending.store(true, Ordering::SeqCst);
            return;
        }
        // Failures from here on set the flag again.
        if !self.resync_pending.swap(false, Ordering::SeqCst) {
            return;
        }

        let channels: Vec<String> = lock(&self.channels).iter().cloned().collect();
        for channel in &channels {
            let result = self.bus.subscribe(channel).await;
            if self.observe("resubscribe", result).is_none() {
                return;
            }
        }
        self.observe("health check", Ok(()));

        let doc_prefix = self.channel_for("");
        let mut resynced = 0;
        for channel in &channels {
            let Some(entry) = channel
                .strip_prefix(&doc_prefix)
                .and_then(|doc| store.get_loaded(doc))
            else {
                continue;
            };
            self.publish_update(entry.name(), &entry.encode_state_as_update())
                .await;
            self.publish(RelayMessage::new(
                RelayKind::SyncRequest,
                entry.name(),
                entry.encode_state_vector(),
                self.server_id,
            ))
            .await;
            resynced += 1;
        }
        self.counters.resyncs.fetch_add(1, Ordering::Relaxed);
        log::info!(
            "relay resynced {} channels, {resynced} loaded documents",
            channels.len()
        );
    }

    /// True while the last bus call failed or the link is down.
    pub fn is_degraded(&self) -> bool {
        !self.available.load(Ordering::SeqCst) || !self.bus.is_available()
    }

    fn observe<T>(&self, op: &str, result: Result<T, BusError>) -> Option<T> {
        match result {
            Ok(value) => {
                if !self.available.swap(true, Ordering::SeqCst) {
                    log::info!("relay bus reachable again; cross-server sync resumed");
                }
                Some(value)
            }
            Err(e) => {
                self.counters.failures.fetch_add(1, Ordering::Relaxed);
                self.resync_pending.store(true, Ordering::SeqCst);
                if self.available.swap(false, Ordering::SeqCst) {
                    log::warn!("relay bus failed during {op}: {e}; serving this instance only");
                } else {
                    log::debug!("relay {op} skipped: {e}");
                }
                None
            }
        }
    }

    fn observe_err<T>(&self, op: &str, result: Result<T, BusError>) -> Result<T, BusError> {
        match &result {
            Ok(_) => self.observe(op, Ok(())),
            Err(e) => self.observe::<()>(op, Err(e.clone())),
        };
        result
    }

    pub fn stats(&self) -> RelayStats {
        RelayStats {
            server_id: self.server_id,
            published: self.counters.published.load(Ordering::Relaxed),
            received: self.counters.received.load(Ordering::Relaxed),
            applied: self.counters.applied.load(Ordering::Relaxed),
            suppressed: self.counters.suppressed.load(Ordering::Relaxed),
            answered: self.counters.answered.load(Ordering::Relaxed),
            failures: self.counters.failures.load(Ordering::Relaxed),
            channels: lock(&self.channels).len(),
            degraded: self.is_degraded(),
            resyncs: self.counters.resyncs.load(Ordering::Relaxed),
        }
    }
}

/// Durable snapshots kept in the bus's key-value store, so any process can
/// load what another persisted.
pub struct RelayPersistence {
    relay: Arc<Relay>,
}

impl RelayPersistence {
    pub fn new(relay: Arc<Relay>) -> Self {
        Self { relay }
    }
}

#[async_trait]
impl Persistence for RelayPersistence {
    async fn load(&self, doc: &str) -> Result<Option<Vec<u8>>, PersistenceError> {
        self.relay
            .load_snapshot(doc)
            .await
            .map_err(|e| PersistenceError::Unavailable(e.to_string()))
    }

    async fn save(&self, doc: &str, state: &[u8]) -> Result<(), PersistenceError> {
        self.relay
            .store_snapshot(doc, state)
            .await
            .map_err(|e| PersistenceError::Unavailable(e.to_string()))
    }
}
