//! In-process broker shared by several gateways.
//!
//! Backs single-host deployments, the WebSocket hub, and tests. Like a
//! real broker it delivers to every subscriber, the publisher included;
//! dropping loops is the relay's job.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::bus::{Bus, BusDelivery, BusError};
use crate::hooks::lock;

#[derive(Default)]
struct BrokerState {
    next_client: u64,
    clients: HashMap<u64, mpsc::UnboundedSender<BusDelivery>>,
    channels: HashMap<String, HashSet<u64>>,
    snapshots: HashMap<String, Vec<u8>>,
    /// key → field → (value, expires_at)
    presence: HashMap<String, HashMap<String, (Vec<u8>, Instant)>>,
}

/// Shared broker state. Cloning yields another handle to the same broker.
#[derive(Clone)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
    available: Arc<AtomicBool>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(BrokerState::default())),
            available: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Open a new client connection to this broker.
    pub fn client(&self) -> MemoryBus {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = {
            let mut state = lock(&self.state);
            state.next_client += 1;
            let id = state.next_client;
            state.clients.insert(id, tx.clone());
            id
        };
        MemoryBus {
            id,
            broker: self.clone(),
            sender: tx,
            linked: AtomicBool::new(true),
            epoch: AtomicU64::new(0),
            inbox: Mutex::new(Some(rx)),
            published: AtomicU64::new(0),
        }
    }

    /// Simulate an outage: every client call fails with `Unavailable`.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    pub fn subscriber_count(&self, channel: &str) -> usize {
        lock(&self.state)
            .channels
            .get(channel)
            .map_or(0, HashSet::len)
    }

    pub fn client_count(&self) -> usize {
        lock(&self.state).clients.len()
    }

    fn check(&self) -> Result<(), BusError> {
        if self.is_available() {
            Ok(())
        } else {
            Err(BusError::Unavailable)
        }
    }

    fn publish(&self, channel: &str, payload: Vec<u8>) -> usize {
        let state = lock(&self.state);
        let Some(subscribers) = state.channels.get(channel) else {
            return 0;
        };
        let mut delivered = 0;
        for id in subscribers {
            if let Some(tx) = state.clients.get(id) {
                let delivery = BusDelivery {
                    channel: channel.to_string(),
                    payload: payload.clone(),
                };
                if tx.send(delivery).is_ok() {
                    delivered += 1;
                }
            }
        }
        delivered
    }

    fn subscribe(&self, client: u64, channel: &str) {
        lock(&self.state)
            .channels
            .entry(channel.to_string())
            .or_default()
            .insert(client);
    }

    fn unsubscribe(&self, client: u64, channel: &str) {
        let mut state = lock(&self.state);
        if let Some(subscribers) = state.channels.get_mut(channel) {
            subscribers.remove(&client);
            if subscribers.is_empty() {
                state.channels.remove(channel);
            }
        }
    }

    fn reconnect(&self, client: u64, sender: mpsc::UnboundedSender<BusDelivery>) {
        lock(&self.state).clients.insert(client, sender);
    }

    fn disconnect(&self, client: u64) {
        let mut state = lock(&self.state);
        state.clients.remove(&client);
        state.channels.retain(|_, subscribers| {
            subscribers.remove(&client);
            !subscribers.is_empty()
        });
    }

    fn presence_all(&self, key: &str) -> Vec<(String, Vec<u8>)> {
        let now = Instant::now();
        let mut state = lock(&self.state);
        let Some(hash) = state.presence.get_mut(key) else {
            return Vec::new();
        };
        hash.retain(|_, (_, expires_at)| *expires_at > now);
        let fields = hash
            .iter()
            .map(|(field, (value, _))| (field.clone(), value.clone()))
            .collect();
        if hash.is_empty() {
            state.presence.remove(key);
        }
        fields
    }
}

/// One client of a [`MemoryBroker`].
pub struct MemoryBus {
    id: u64,
    broker: MemoryBroker,
    sender: mpsc::UnboundedSender<BusDelivery>,
    linked: AtomicBool,
    epoch: AtomicU64,
    inbox: Mutex<Option<mpsc::UnboundedReceiver<BusDelivery>>>,
    published: AtomicU64,
}

impl MemoryBus {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Successful publish calls made through this client.
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::SeqCst)
    }

    pub fn broker(&self) -> &MemoryBroker {
        &self.broker
    }

    /// Drop or restore this client's link alone. Like a broker losing a
    /// connection, a dropped link forgets every subscription of the client;
    /// restoring it does not bring them back.
    pub fn set_linked(&self, linked: bool) {
        if linked {
            if !self.linked.swap(true, Ordering::SeqCst) {
                self.broker.reconnect(self.id, self.sender.clone());
                self.epoch.fetch_add(1, Ordering::SeqCst);
            }
        } else if self.linked.swap(false, Ordering::SeqCst) {
            self.broker.disconnect(self.id);
        }
    }

    fn check(&self) -> Result<(), BusError> {
        self.broker.check()?;
        if self.linked.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BusError::Unavailable)
        }
    }
}

impl Drop for MemoryBus {
    fn drop(&mut self) {
        self.broker.disconnect(self.id);
    }
}

#[async_trait]
impl Bus for MemoryBus {
    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<(), BusError> {
        self.check()?;
        self.published.fetch_add(1, Ordering::SeqCst);
        self.broker.publish(channel, payload);
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<(), BusError> {
        self.check()?;
        self.broker.subscribe(self.id, channel);
        Ok(())
    }

    async fn unsubscribe(&self, channel: &str) -> Result<(), BusError> {
        self.check()?;
        self.broker.unsubscribe(self.id, channel);
        Ok(())
    }

    async fn set_snapshot(&self, key: &str, value: Vec<u8>) -> Result<(), BusError> {
        self.check()?;
        lock(&self.broker.state)
            .snapshots
            .insert(key.to_string(), value);
        Ok(())
    }

    async fn get_snapshot(&self, key: &str) -> Result<Option<Vec<u8>>, BusError> {
        self.check()?;
        Ok(lock(&self.broker.state).snapshots.get(key).cloned())
    }

    async fn presence_set(
        &self,
        key: &str,
        field: &str,
        value: Vec<u8>,
        ttl: Duration,
    ) -> Result<(), BusError> {
        self.check()?;
        lock(&self.broker.state)
            .presence
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), (value, Instant::now() + ttl));
        Ok(())
    }

    async fn presence_remove(&self, key: &str, field: &str) -> Result<(), BusError> {
        self.check()?;
        let mut state = lock(&self.broker.state);
        if let Some(hash) = state.presence.get_mut(key) {
            hash.remove(field);
        }
        Ok(())
    }

    async fn presence_all(&self, key: &str) -> Result<Vec<(String, Vec<u8>)>, BusError> {
        self.check()?;
        Ok(self.broker.presence_all(key))
    }

    fn take_inbox(&self) -> Option<mpsc::UnboundedReceiver<BusDelivery>> {
        lock(&self.inbox).take()
    }

    fn is_available(&self) -> bool {
        self.broker.is_available() && self.linked.load(Ordering::SeqCst)
    }

    fn link_epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }
}
