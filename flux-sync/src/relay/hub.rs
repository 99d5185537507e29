//! WebSocket front for a [`MemoryBroker`], so gateways in separate
//! processes can share one bus.
//!
//! Every frame is a bincode-encoded [`HubRequest`] (peer → hub) or
//! [`HubEvent`] (hub → peer). Requests that expect an answer carry an id
//! that the hub echoes back. Snapshot writes are acknowledged, so a peer
//! only treats a document as persisted once the hub holds it.

use std::net::SocketAddr;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_tungstenite::tungstenite::Message;

use super::bus::{Bus, BusError};
use super::memory::MemoryBroker;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HubRequest {
    Publish { channel: String, payload: Vec<u8> },
    Subscribe { channel: String },
    Unsubscribe { channel: String },
    SetSnapshot { id: u64, key: String, value: Vec<u8> },
    GetSnapshot { id: u64, key: String },
    PresenceSet { key: String, field: String, value: Vec<u8>, ttl_ms: u64 },
    PresenceRemove { key: String, field: String },
    PresenceAll { id: u64, key: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HubEvent {
    Message { channel: String, payload: Vec<u8> },
    Snapshot { id: u64, value: Option<Vec<u8>> },
    Presence { id: u64, fields: Vec<(String, Vec<u8>)> },
    /// Outcome of a [`HubRequest::SetSnapshot`].
    Ack { id: u64, stored: bool },
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, BusError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| BusError::Codec(e.to_string()))
}

fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, BusError> {
    bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map(|(value, _)| value)
        .map_err(|e| BusError::Codec(e.to_string()))
}

impl HubRequest {
    pub fn encode(&self) -> Result<Vec<u8>, BusError> {
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, BusError> {
        decode(bytes)
    }
}

impl HubEvent {
    pub fn encode(&self) -> Result<Vec<u8>, BusError> {
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, BusError> {
        decode(bytes)
    }
}

/// Bus server.
pub struct BusHub {
    bind_addr: String,
    broker: MemoryBroker,
}

impl BusHub {
    pub fn new(bind_addr: impl Into<String>) -> Self {
        Self::with_broker(bind_addr, MemoryBroker::new())
    }

    pub fn with_broker(bind_addr: impl Into<String>, broker: MemoryBroker) -> Self {
        Self {
            bind_addr: bind_addr.into(),
            broker,
        }
    }

    pub fn broker(&self) -> &MemoryBroker {
        &self.broker
    }

    /// Bind and serve until `shutdown` flips to true.
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> std::io::Result<()> {
        let listener = TcpListener::bind(&self.bind_addr).await?;
        self.serve(listener, shutdown).await;
        Ok(())
    }

    /// Serve on an already bound listener.
    pub async fn serve(self, listener: TcpListener, mut shutdown: watch::Receiver<bool>) {
        match listener.local_addr() {
            Ok(addr) => log::info!("bus hub listening on {addr}"),
            Err(e) => log::warn!("bus hub listening on unknown address: {e}"),
        }
        let mut peers = JoinSet::new();
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        let broker = self.broker.clone();
                        let peer_shutdown = shutdown.clone();
                        peers.spawn(async move {
                            if let Err(e) = serve_peer(stream, addr, broker, peer_shutdown).await {
                                log::warn!("bus hub peer {addr} failed: {e}");
                            }
                        });
                    }
                    Err(e) => {
                        log::error!("bus hub accept failed: {e}");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
                Some(_) = peers.join_next(), if !peers.is_empty() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        peers.shutdown().await;
        log::info!("bus hub stopped");
    }
}

async fn serve_peer(
    stream: TcpStream,
    addr: SocketAddr,
    broker: MemoryBroker,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let bus = broker.client();
    let mut inbox = bus.take_inbox().ok_or("bus client inbox missing")?;
    log::info!("bus hub peer {addr} connected as client {}", bus.id());

    loop {
        tokio::select! {
            msg = ws_receiver.next() => match msg {
                Some(Ok(Message::Binary(data))) => {
                    let request = match HubRequest::decode(&data) {
                        Ok(request) => request,
                        Err(e) => {
                            log::warn!("bus hub: bad request from {addr}: {e}");
                            continue;
                        }
                    };
                    if let Some(reply) = handle_request(&bus, request).await {
                        ws_sender.send(Message::Binary(reply.encode()?.into())).await?;
                    }
                }
                Some(Ok(Message::Ping(payload))) => {
                    ws_sender.send(Message::Pong(payload)).await?;
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e.into()),
            },
            delivery = inbox.recv() => {
                let Some(delivery) = delivery else { break };
                let event = HubEvent::Message {
                    channel: delivery.channel,
                    payload: delivery.payload,
                };
                ws_sender.send(Message::Binary(event.encode()?.into())).await?;
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    let _ = ws_sender.send(Message::Close(None)).await;
                    break;
                }
            }
        }
    }
    log::info!("bus hub peer {addr} disconnected");
    Ok(())
}

/// Execute one request against the broker. Returns the reply, if the
/// request expects one. Failures of fire-and-forget requests are only
/// logged; the hub's own broker is always reachable.
async fn handle_request(bus: &impl Bus, request: HubRequest) -> Option<HubEvent> {
    let result = match request {
        HubRequest::Publish { channel, payload } => bus.publish(&channel, payload).await,
        HubRequest::Subscribe { channel } => bus.subscribe(&channel).await,
        HubRequest::Unsubscribe { channel } => bus.unsubscribe(&channel).await,
        HubRequest::SetSnapshot { id, key, value } => {
            let stored = match bus.set_snapshot(&key, value).await {
                Ok(()) => true,
                Err(e) => {
                    log::warn!("bus hub: snapshot {key} not stored: {e}");
                    false
                }
            };
            return Some(HubEvent::Ack { id, stored });
        }
        HubRequest::PresenceSet {
            key,
            field,
            value,
            ttl_ms,
        } => {
            bus.presence_set(&key, &field, value, Duration::from_millis(ttl_ms))
                .await
        }
        HubRequest::PresenceRemove { key, field } => bus.presence_remove(&key, &field).await,
        HubRequest::GetSnapshot { id, key } => {
            let value = bus.get_snapshot(&key).await.unwrap_or_else(|e| {
                log::warn!("bus hub: snapshot {key} unavailable: {e}");
                None
            });
            return Some(HubEvent::Snapshot { id, value });
        }
        HubRequest::PresenceAll { id, key } => {
            let fields = bus.presence_all(&key).await.unwrap_or_else(|e| {
                log::warn!("bus hub: presence {key} unavailable: {e}");
                Vec::new()
            });
            return Some(HubEvent::Presence { id, fields });
        }
    };
    if let Err(e) = result {
        log::warn!("bus hub request failed: {e}");
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_codec() {
        let request = HubRequest::PresenceSet {
            key: "k".into(),
            field: "f".into(),
            value: vec![1],
            ttl_ms: 500,
        };
        assert_eq!(HubRequest::decode(&request.encode().unwrap()).unwrap(), request);
        assert!(matches!(HubEvent::decode(&[0xFF, 0xFF]), Err(BusError::Codec(_))));
    }

    #[tokio::test]
    async fn test_handle_request_replies_to_queries_and_snapshot_writes() {
        let broker = MemoryBroker::new();
        let bus = broker.client();

        let reply = handle_request(
            &bus,
            HubRequest::Subscribe {
                channel: "c".into(),
            },
        )
        .await;
        assert_eq!(reply, None);

        let reply = handle_request(
            &bus,
            HubRequest::SetSnapshot {
                id: 6,
                key: "s".into(),
                value: vec![9],
            },
        )
        .await;
        assert_eq!(reply, Some(HubEvent::Ack { id: 6, stored: true }));

        let reply = handle_request(
            &bus,
            HubRequest::GetSnapshot {
                id: 7,
                key: "s".into(),
            },
        )
        .await;
        assert_eq!(
            reply,
            Some(HubEvent::Snapshot {
                id: 7,
                value: Some(vec![9])
            })
        );

        broker.set_available(false);
        let reply = handle_request(
            &bus,
            HubRequest::SetSnapshot {
                id: 8,
                key: "s".into(),
                value: vec![1],
            },
        )
        .await;
        assert_eq!(reply, Some(HubEvent::Ack { id: 8, stored: false }));
    }
}
