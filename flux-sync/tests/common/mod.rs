//! Shared helpers for the end-to-end tests: a gateway on an ephemeral port
//! and a minimal WebSocket client holding its own Yrs replica.

#![allow(dead_code)]

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration, Instant};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{GetString, ReadTxn, StateVector, Text, Transact, Update, WriteTxn};

use flux_sync::auth::{Claims, Permission};
use flux_sync::awareness::AwarenessEntry;
use flux_sync::{
    AllowAnonymous, Authenticator, AwarenessUpdate, DocumentStore, Frame, Gateway, GatewayConfig,
    GatewayError, NoopPersistence, Persistence, Relay, StoreConfig, SyncMessage,
};

pub const SECRET: &[u8] = b"integration-secret";

pub struct TestServer {
    pub gateway: Arc<Gateway>,
    pub url: String,
    pub task: JoinHandle<Result<(), GatewayError>>,
}

impl TestServer {
    pub fn store(&self) -> &Arc<DocumentStore> {
        self.gateway.store()
    }

    /// Stop the gateway and wait until it has persisted everything.
    pub async fn stop(self) {
        self.gateway.shutdown();
        timeout(Duration::from_secs(10), self.task)
            .await
            .expect("gateway did not stop")
            .unwrap()
            .unwrap();
    }
}

pub struct ServerBuilder {
    pub gateway: GatewayConfig,
    pub store: StoreConfig,
    pub persistence: Arc<dyn Persistence>,
    pub auth: Arc<dyn Authenticator>,
    pub relay: Option<Arc<Relay>>,
}

impl Default for ServerBuilder {
    fn default() -> Self {
        Self {
            gateway: GatewayConfig::default(),
            store: StoreConfig::default(),
            persistence: Arc::new(NoopPersistence),
            auth: Arc::new(AllowAnonymous),
            relay: None,
        }
    }
}

impl ServerBuilder {
    pub async fn start(self) -> TestServer {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let store = Arc::new(DocumentStore::new(self.store, self.persistence));
        let mut gateway = Gateway::new(self.gateway, store, self.auth);
        if let Some(relay) = self.relay {
            gateway = gateway.with_relay(relay);
        }
        let gateway = Arc::new(gateway);
        let task = {
            let gateway = gateway.clone();
            tokio::spawn(async move { gateway.serve(listener).await })
        };
        TestServer {
            gateway,
            url: format!("ws://127.0.0.1:{port}"),
            task,
        }
    }
}

pub async fn start_server() -> TestServer {
    ServerBuilder::default().start().await
}

/// HS256 token for `user` with the given permissions.
pub fn token(user: &str, docs: &[&str], permissions: &[Permission]) -> String {
    let claims = Claims {
        sub: user.to_string(),
        exp: 4_000_000_000,
        docs: docs.iter().map(|d| d.to_string()).collect(),
        permissions: permissions.to_vec(),
    };
    jsonwebtoken::encode(
        &jsonwebtoken::Header::default(),
        &claims,
        &jsonwebtoken::EncodingKey::from_secret(SECRET),
    )
    .unwrap()
}

pub type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// A raw client speaking the binary protocol with its own replica.
pub struct TestClient {
    pub ws: Socket,
    pub doc: yrs::Doc,
    /// Every awareness update received, in order.
    pub awareness: Vec<AwarenessUpdate>,
    /// Bytes of every Step2 received from the server.
    pub step2_sizes: Vec<usize>,
    /// Updates received as Sync Update frames.
    pub updates_received: usize,
}

impl TestClient {
    pub async fn connect(url: &str, path: &str) -> Self {
        Self::connect_with(url, path, yrs::Doc::new()).await
    }

    /// Connect reusing an existing replica, as a reconnecting client does.
    pub async fn connect_with(url: &str, path: &str, doc: yrs::Doc) -> Self {
        let (ws, _) = tokio_tungstenite::connect_async(format!("{url}/{path}"))
            .await
            .unwrap();
        Self {
            ws,
            doc,
            awareness: Vec::new(),
            step2_sizes: Vec::new(),
            updates_received: 0,
        }
    }

    /// Connect and run the two-step handshake in both directions.
    pub async fn join(url: &str, path: &str) -> Self {
        let mut client = Self::connect(url, path).await;
        client.handshake().await;
        client
    }

    /// Answer the server's Step1 and request what we lack.
    pub async fn handshake(&mut self) {
        self.recv_until(|frame| matches!(frame, Frame::Sync(SyncMessage::Step1(_))))
            .await
            .expect("server did not send step 1");
        self.handshake_reply().await;
    }

    /// Second half of the handshake: send our state vector and wait for
    /// the diff.
    pub async fn handshake_reply(&mut self) {
        let sv = self.doc.transact().state_vector().encode_v1();
        self.send(Frame::step1(sv)).await;
        self.recv_until(|frame| matches!(frame, Frame::Sync(SyncMessage::Step2(_))))
            .await
            .expect("server did not answer step 1");
    }

    pub async fn send(&mut self, frame: Frame) {
        self.send_raw(frame.encode()).await;
    }

    pub async fn send_raw(&mut self, bytes: Vec<u8>) {
        self.ws.send(Message::Binary(bytes.into())).await.unwrap();
    }

    /// Insert text locally and send the resulting update.
    pub async fn insert(&mut self, index: u32, chunk: &str) {
        let update = edit(&self.doc, index, chunk);
        self.send(Frame::update(update)).await;
    }

    pub fn text(&self) -> String {
        let txn = self.doc.transact();
        txn.get_text("content")
            .map(|t| t.get_string(&txn))
            .unwrap_or_default()
    }

    pub async fn set_presence(&mut self, state: serde_json::Value) {
        let update = AwarenessUpdate {
            entries: vec![AwarenessEntry {
                client: uuid::Uuid::new_v4(),
                clock: 1,
                state: Some(state.to_string()),
            }],
        };
        self.send(Frame::Awareness(update.encode().unwrap())).await;
    }

    /// Next decodable frame, applying it to the local replica. `None` on
    /// timeout or close. Control frames do not count.
    pub async fn recv(&mut self, wait: Duration) -> Option<Frame> {
        let deadline = Instant::now() + wait;
        loop {
            let msg = tokio::time::timeout_at(deadline, self.ws.next())
                .await
                .ok()??
                .ok()?;
            match msg {
                Message::Binary(data) => {
                    let frame = Frame::decode(&data).ok()?;
                    self.absorb(&frame).await;
                    return Some(frame);
                }
                Message::Close(_) => return None,
                _ => continue,
            }
        }
    }

    /// Read frames until one matches, or fail after two seconds.
    pub async fn recv_until(&mut self, mut matches: impl FnMut(&Frame) -> bool) -> Option<Frame> {
        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            let left = deadline.saturating_duration_since(Instant::now());
            let frame = self.recv(left).await?;
            if matches(&frame) {
                return Some(frame);
            }
        }
    }

    /// Keep reading until the replica text equals `expected`.
    pub async fn wait_for_text(&mut self, expected: &str) -> bool {
        let deadline = Instant::now() + Duration::from_secs(3);
        while self.text() != expected {
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() || self.recv(left).await.is_none() {
                return self.text() == expected;
            }
        }
        true
    }

    /// True if nothing arrives for `wait`.
    pub async fn is_quiet(&mut self, wait: Duration) -> bool {
        self.recv(wait).await.is_none()
    }

    /// Skip everything up to the close frame and return its code.
    pub async fn close_code(&mut self) -> Option<u16> {
        loop {
            match timeout(Duration::from_secs(5), self.ws.next()).await.ok()?? {
                Ok(Message::Close(frame)) => return frame.map(|f| u16::from(f.code)),
                Ok(_) => continue,
                Err(_) => return None,
            }
        }
    }

    async fn absorb(&mut self, frame: &Frame) {
        match frame {
            Frame::Sync(SyncMessage::Step1(sv)) => {
                let sv = StateVector::decode_v1(sv).unwrap();
                let diff = self.doc.transact().encode_diff_v1(&sv);
                self.send(Frame::step2(diff)).await;
            }
            Frame::Sync(SyncMessage::Step2(update)) => {
                self.step2_sizes.push(update.len());
                apply(&self.doc, update);
            }
            Frame::Sync(SyncMessage::Update(update)) => {
                self.updates_received += 1;
                apply(&self.doc, update);
            }
            Frame::Awareness(payload) => {
                if let Ok(update) = AwarenessUpdate::decode(payload) {
                    self.awareness.push(update);
                }
            }
            Frame::QueryAwareness => {}
        }
    }
}

fn apply(doc: &yrs::Doc, update: &[u8]) {
    let update = Update::decode_v1(update).unwrap();
    doc.transact_mut().apply_update(update).unwrap();
}

/// Insert into the shared text of `doc` and return the incremental update.
pub fn edit(doc: &yrs::Doc, index: u32, chunk: &str) -> Vec<u8> {
    let before = doc.transact().state_vector();
    {
        let mut txn = doc.transact_mut();
        let text = txn.get_or_insert_text("content");
        text.insert(&mut txn, index, chunk);
    }
    let txn = doc.transact();
    txn.encode_diff_v1(&before)
}

/// Full state of a fresh document holding `text`.
pub fn state_with(text: &str) -> Vec<u8> {
    let doc = yrs::Doc::new();
    edit(&doc, 0, text);
    let txn = doc.transact();
    txn.encode_state_as_update_v1(&StateVector::default())
}

/// Text of a store entry, read through a scratch replica.
pub fn entry_text(entry: &flux_sync::DocumentEntry) -> String {
    text_of_state(&entry.encode_state_as_update())
}

/// Text held by a full-state update.
pub fn text_of_state(state: &[u8]) -> String {
    let doc = yrs::Doc::new();
    apply(&doc, state);
    let txn = doc.transact();
    txn.get_text("content")
        .map(|t| t.get_string(&txn))
        .unwrap_or_default()
}

/// Poll `check` every 10ms for up to two seconds.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
