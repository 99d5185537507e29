//! Shared message bus seen by every server process.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BusError {
    #[error("bus unavailable")]
    Unavailable,
    #[error("bus request timed out")]
    Timeout,
    #[error("bus codec error: {0}")]
    Codec(String),
}

/// A message received on a subscribed channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusDelivery {
    pub channel: String,
    pub payload: Vec<u8>,
}

/// Pub/sub channels, a durable key-value store for snapshots and a
/// TTL-bearing hash per key for best-effort presence.
///
/// Implementations must fail fast instead of blocking when the backend is
/// unreachable.
#[async_trait]
pub trait Bus: Send + Sync + 'static {
    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<(), BusError>;

    async fn subscribe(&self, channel: &str) -> Result<(), BusError>;

    async fn unsubscribe(&self, channel: &str) -> Result<(), BusError>;

    async fn set_snapshot(&self, key: &str, value: Vec<u8>) -> Result<(), BusError>;

    async fn get_snapshot(&self, key: &str) -> Result<Option<Vec<u8>>, BusError>;

    /// Set `field` of the hash at `key`; the field expires after `ttl`.
    async fn presence_set(
        &self,
        key: &str,
        field: &str,
        value: Vec<u8>,
        ttl: Duration,
    ) -> Result<(), BusError>;

    async fn presence_remove(&self, key: &str, field: &str) -> Result<(), BusError>;

    /// Unexpired fields of the hash at `key`.
    async fn presence_all(&self, key: &str) -> Result<Vec<(String, Vec<u8>)>, BusError>;

    /// Deliveries for subscribed channels. Yields the receiver once.
    fn take_inbox(&self) -> Option<mpsc::UnboundedReceiver<BusDelivery>>;

    fn is_available(&self) -> bool;

    /// Bumped each time the link to the backend is established again.
    /// Subscriptions made under an older epoch may be gone.
    fn link_epoch(&self) -> u64 {
        0
    }
}
