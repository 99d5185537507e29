//! Client side of the [`BusHub`](super::hub::BusHub).
//!
//! A supervisor task owns the socket. It reconnects with exponential
//! backoff and re-subscribes every channel the relay asked for. While the
//! socket is down each call fails immediately with
//! [`BusError::Unavailable`].

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

use super::bus::{Bus, BusDelivery, BusError};
use super::hub::{HubEvent, HubRequest};
use crate::hooks::lock;

#[derive(Debug, Clone)]
pub struct RemoteBusConfig {
    /// `ws://host:port` of the hub.
    pub url: String,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Deadline for snapshot and presence queries.
    pub request_timeout: Duration,
}

impl Default for RemoteBusConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:6380".to_string(),
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
            request_timeout: Duration::from_secs(2),
        }
    }
}

struct Shared {
    config: RemoteBusConfig,
    outgoing: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    pending: Mutex<HashMap<u64, oneshot::Sender<HubEvent>>>,
    next_request: AtomicU64,
    channels: Mutex<HashSet<String>>,
    inbox_tx: mpsc::UnboundedSender<BusDelivery>,
    connected: AtomicBool,
    epoch: AtomicU64,
}

impl Shared {
    fn send(&self, request: &HubRequest) -> Result<(), BusError> {
        let bytes = request.encode()?;
        match lock(&self.outgoing).as_ref() {
            Some(tx) => tx.send(bytes).map_err(|_| BusError::Unavailable),
            None => Err(BusError::Unavailable),
        }
    }

    fn route(&self, bytes: &[u8]) {
        let event = match HubEvent::decode(bytes) {
            Ok(event) => event,
            Err(e) => {
                log::warn!("remote bus: bad event from hub: {e}");
                return;
            }
        };
        match event {
            HubEvent::Message { channel, payload } => {
                let _ = self.inbox_tx.send(BusDelivery { channel, payload });
            }
            HubEvent::Snapshot { id, .. }
            | HubEvent::Presence { id, .. }
            | HubEvent::Ack { id, .. } => {
                if let Some(waiter) = lock(&self.pending).remove(&id) {
                    let _ = waiter.send(event);
                }
            }
        }
    }
}

/// Bus reached over a WebSocket connection to a hub.
pub struct RemoteBus {
    shared: Arc<Shared>,
    inbox: Mutex<Option<mpsc::UnboundedReceiver<BusDelivery>>>,
    supervisor: JoinHandle<()>,
}

impl RemoteBus {
    /// Start connecting in the background. Returns immediately.
    pub fn connect(config: RemoteBusConfig) -> Self {
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            config,
            outgoing: Mutex::new(None),
            pending: Mutex::new(HashMap::new()),
            next_request: AtomicU64::new(1),
            channels: Mutex::new(HashSet::new()),
            inbox_tx,
            connected: AtomicBool::new(false),
            epoch: AtomicU64::new(0),
        });
        let supervisor = tokio::spawn(supervise(shared.clone()));
        Self {
            shared,
            inbox: Mutex::new(Some(inbox_rx)),
            supervisor,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    async fn request(&self, build: impl FnOnce(u64) -> HubRequest) -> Result<HubEvent, BusError> {
        let id = self.shared.next_request.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        lock(&self.shared.pending).insert(id, tx);
        if let Err(e) = self.shared.send(&build(id)) {
            lock(&self.shared.pending).remove(&id);
            return Err(e);
        }
        match tokio::time::timeout(self.shared.config.request_timeout, rx).await {
            Ok(Ok(event)) => Ok(event),
            // Connection dropped and the waiter with it.
            Ok(Err(_)) => Err(BusError::Unavailable),
            Err(_) => {
                lock(&self.shared.pending).remove(&id);
                Err(BusError::Timeout)
            }
        }
    }
}

impl Drop for RemoteBus {
    fn drop(&mut self) {
        self.supervisor.abort();
    }
}

async fn supervise(shared: Arc<Shared>) {
    let mut backoff = shared.config.initial_backoff;
    loop {
        match tokio_tungstenite::connect_async(shared.config.url.as_str()).await {
            Ok((ws_stream, _)) => {
                backoff = shared.config.initial_backoff;
                run_connection(&shared, ws_stream).await;
                log::warn!("remote bus: lost connection to {}", shared.config.url);
            }
            Err(e) => {
                log::debug!(
                    "remote bus: connect to {} failed, retrying in {backoff:?}: {e}",
                    shared.config.url
                );
            }
        }
        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(shared.config.max_backoff);
    }
}

async fn run_connection<S>(shared: &Shared, ws_stream: tokio_tungstenite::WebSocketStream<S>)
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Vec<u8>>();

    // Queue re-subscriptions before callers can enqueue anything else.
    {
        let mut outgoing = lock(&shared.outgoing);
        for channel in lock(&shared.channels).iter() {
            match (HubRequest::Subscribe {
                channel: channel.clone(),
            })
            .encode()
            {
                Ok(bytes) => {
                    let _ = out_tx.send(bytes);
                }
                Err(e) => log::error!("remote bus: cannot resubscribe {channel}: {e}"),
            }
        }
        *outgoing = Some(out_tx);
    }
    shared.connected.store(true, Ordering::SeqCst);
    shared.epoch.fetch_add(1, Ordering::SeqCst);
    log::info!("remote bus: connected to {}", shared.config.url);

    let writer = async {
        while let Some(bytes) = out_rx.recv().await {
            if ws_sender.send(Message::Binary(bytes.into())).await.is_err() {
                break;
            }
        }
    };
    let reader = async {
        while let Some(msg) = ws_receiver.next().await {
            match msg {
                Ok(Message::Binary(data)) => shared.route(&data),
                Ok(Message::Close(_)) | Err(_) => break,
                Ok(_) => {}
            }
        }
    };
    tokio::select! {
        _ = writer => {}
        _ = reader => {}
    }

    shared.connected.store(false, Ordering::SeqCst);
    *lock(&shared.outgoing) = None;
    // Dropping the senders wakes every waiter with Unavailable.
    lock(&shared.pending).clear();
}

#[async_trait]
impl Bus for RemoteBus {
    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<(), BusError> {
        self.shared.send(&HubRequest::Publish {
            channel: channel.to_string(),
            payload,
        })
    }

    async fn subscribe(&self, channel: &str) -> Result<(), BusError> {
        lock(&self.shared.channels).insert(channel.to_string());
        self.shared.send(&HubRequest::Subscribe {
            channel: channel.to_string(),
        })
    }

    async fn unsubscribe(&self, channel: &str) -> Result<(), BusError> {
        lock(&self.shared.channels).remove(channel);
        self.shared.send(&HubRequest::Unsubscribe {
            channel: channel.to_string(),
        })
    }

    /// Resolves once the hub has stored the snapshot.
    async fn set_snapshot(&self, key: &str, value: Vec<u8>) -> Result<(), BusError> {
        let key = key.to_string();
        match self
            .request(|id| HubRequest::SetSnapshot { id, key, value })
            .await?
        {
            HubEvent::Ack { stored: true, .. } => Ok(()),
            HubEvent::Ack { stored: false, .. } => Err(BusError::Unavailable),
            other => Err(BusError::Codec(format!("unexpected reply {other:?}"))),
        }
    }

    async fn get_snapshot(&self, key: &str) -> Result<Option<Vec<u8>>, BusError> {
        let key = key.to_string();
        match self.request(|id| HubRequest::GetSnapshot { id, key }).await? {
            HubEvent::Snapshot { value, .. } => Ok(value),
            other => Err(BusError::Codec(format!("unexpected reply {other:?}"))),
        }
    }

    async fn presence_set(
        &self,
        key: &str,
        field: &str,
        value: Vec<u8>,
        ttl: Duration,
    ) -> Result<(), BusError> {
        self.shared.send(&HubRequest::PresenceSet {
            key: key.to_string(),
            field: field.to_string(),
            value,
            ttl_ms: ttl.as_millis() as u64,
        })
    }

    async fn presence_remove(&self, key: &str, field: &str) -> Result<(), BusError> {
        self.shared.send(&HubRequest::PresenceRemove {
            key: key.to_string(),
            field: field.to_string(),
        })
    }

    async fn presence_all(&self, key: &str) -> Result<Vec<(String, Vec<u8>)>, BusError> {
        let key = key.to_string();
        match self.request(|id| HubRequest::PresenceAll { id, key }).await? {
            HubEvent::Presence { fields, .. } => Ok(fields),
            other => Err(BusError::Codec(format!("unexpected reply {other:?}"))),
        }
    }

    fn take_inbox(&self) -> Option<mpsc::UnboundedReceiver<BusDelivery>> {
        lock(&self.inbox).take()
    }

    fn is_available(&self) -> bool {
        self.is_connected()
    }

    fn link_epoch(&self) -> u64 {
        self.shared.epoch.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::hub::BusHub;
    use crate::relay::memory::MemoryBroker;
    use tokio::net::TcpListener;
    use tokio::sync::watch;

    async fn start_hub() -> (String, watch::Sender<bool>) {
        let (url, tx, _) = start_hub_on(MemoryBroker::new()).await;
        (url, tx)
    }

    async fn start_hub_on(broker: MemoryBroker) -> (String, watch::Sender<bool>, MemoryBroker) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let (tx, rx) = watch::channel(false);
        tokio::spawn(BusHub::with_broker("unused", broker.clone()).serve(listener, rx));
        (url, tx, broker)
    }

    fn config(url: String) -> RemoteBusConfig {
        RemoteBusConfig {
            url,
            initial_backoff: Duration::from_millis(20),
            max_backoff: Duration::from_millis(200),
            request_timeout: Duration::from_secs(2),
        }
    }

    async fn wait_connected(bus: &RemoteBus) {
        for _ in 0..200 {
            if bus.is_connected() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("remote bus never connected");
    }

    #[tokio::test]
    async fn test_unreachable_hub_fails_fast() {
        // Nothing listens on port 1.
        let bus = RemoteBus::connect(config("ws://127.0.0.1:1".into()));
        assert_eq!(bus.publish("x", vec![1]).await, Err(BusError::Unavailable));
        assert_eq!(bus.get_snapshot("x").await, Err(BusError::Unavailable));
        assert!(!bus.is_available());
    }

    #[tokio::test]
    async fn test_pubsub_and_queries_through_hub() {
        let (url, _shutdown) = start_hub().await;
        let a = RemoteBus::connect(config(url.clone()));
        let b = RemoteBus::connect(config(url));
        wait_connected(&a).await;
        wait_connected(&b).await;
        assert_eq!(a.link_epoch(), 1);
        let mut inbox = b.take_inbox().unwrap();

        b.subscribe("flux:doc:room").await.unwrap();
        // Round-trip a query so the subscribe is processed first.
        assert_eq!(b.get_snapshot("none").await.unwrap(), None);
        a.publish("flux:doc:room", vec![1, 2]).await.unwrap();

        let delivery = tokio::time::timeout(Duration::from_secs(2), inbox.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(delivery.channel, "flux:doc:room");
        assert_eq!(delivery.payload, vec![1, 2]);

        a.set_snapshot("snap", vec![5]).await.unwrap();
        a.presence_set("p", "c1", b"{}".to_vec(), Duration::from_secs(30))
            .await
            .unwrap();
        // Requests on one socket are handled in order.
        assert_eq!(a.get_snapshot("snap").await.unwrap(), Some(vec![5]));
        assert_eq!(a.presence_all("p").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_snapshot_is_stored_before_set_returns() {
        let (url, _shutdown, broker) = start_hub_on(MemoryBroker::new()).await;
        let bus = RemoteBus::connect(config(url));
        wait_connected(&bus).await;

        bus.set_snapshot("flux:snapshot:room", vec![7, 7])
            .await
            .unwrap();
        drop(bus);

        let reader = broker.client();
        assert_eq!(
            reader.get_snapshot("flux:snapshot:room").await.unwrap(),
            Some(vec![7, 7])
        );
    }

    #[tokio::test]
    async fn test_refused_snapshot_is_an_error() {
        let (url, _shutdown, broker) = start_hub_on(MemoryBroker::new()).await;
        let bus = RemoteBus::connect(config(url));
        wait_connected(&bus).await;

        broker.set_available(false);
        assert_eq!(
            bus.set_snapshot("flux:snapshot:room", vec![1]).await,
            Err(BusError::Unavailable)
        );
    }
}
