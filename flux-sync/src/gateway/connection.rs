//! One WebSocket session bound to one document.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::Uri;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;

use super::{GatewayCounters, GatewayError, GatewayShared};
use crate::auth::{AuthError, Identity};
use crate::awareness::RemovalReason;
use crate::hooks::lock;
use crate::protocol::{CloseReason, Frame, ProtocolError};
use crate::store::{DocumentEntry, Origin};
use crate::sync::{self, SyncOutcome};

type WsSender = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsReceiver = SplitStream<WebSocketStream<TcpStream>>;

const MAX_DOC_NAME_LEN: usize = 256;

/// Document and token requested by a connecting client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectTarget {
    pub doc: String,
    pub token: Option<String>,
}

impl ConnectTarget {
    /// `/<doc>?token=<token>`. A `doc` query parameter is accepted when the
    /// path is empty.
    pub fn parse(uri: &Uri) -> Option<Self> {
        let mut token = None;
        let mut doc_param = None;
        if let Some(query) = uri.query() {
            for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
                match key.as_ref() {
                    "token" if !value.is_empty() => token = Some(value.into_owned()),
                    "doc" => doc_param = Some(value.into_owned()),
                    _ => {}
                }
            }
        }

        let path = uri.path().trim_matches('/');
        let doc = if path.is_empty() {
            doc_param?
        } else {
            path.to_string()
        };
        valid_doc_name(&doc).then_some(Self { doc, token })
    }
}

fn valid_doc_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_DOC_NAME_LEN
        && !name.chars().any(|c| c.is_control() || c.is_whitespace())
}

pub(crate) async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    shared: Arc<GatewayShared>,
    shutdown: watch::Receiver<bool>,
) -> Result<(), GatewayError> {
    let requested: Arc<Mutex<Option<Uri>>> = Arc::new(Mutex::new(None));
    let holder = requested.clone();
    let callback = move |req: &Request, resp: Response| {
        *lock(&holder) = Some(req.uri().clone());
        Ok::<_, ErrorResponse>(resp)
    };
    let ws_stream = tokio_tungstenite::accept_hdr_async(stream, callback).await?;
    let uri = lock(&requested).take();
    let (mut ws_sender, ws_receiver) = ws_stream.split();

    let Some(target) = uri.as_ref().and_then(ConnectTarget::parse) else {
        log::info!("rejecting {addr}: invalid document in {uri:?}");
        GatewayCounters::bump(&shared.counters.rejected_connections);
        close(&mut ws_sender, CloseReason::InvalidRoom).await;
        return Ok(());
    };

    let identity = match shared
        .auth
        .authenticate(target.token.as_deref(), &target.doc)
        .await
    {
        Ok(identity) if identity.permissions.can_read() => identity,
        Ok(_) | Err(AuthError::Forbidden(_)) => {
            log::info!("rejecting {addr}: access to {} forbidden", target.doc);
            GatewayCounters::bump(&shared.counters.rejected_connections);
            close(&mut ws_sender, CloseReason::Forbidden).await;
            return Ok(());
        }
        Err(AuthError::Unauthenticated) => {
            log::info!("rejecting {addr}: unauthenticated");
            GatewayCounters::bump(&shared.counters.rejected_connections);
            close(&mut ws_sender, CloseReason::Unauthorized).await;
            return Ok(());
        }
    };

    let session = Session::open(shared, target.doc, identity, addr).await;
    let result = session.run(ws_sender, ws_receiver, shutdown).await;
    session.close().await;
    result
}

async fn close(sender: &mut WsSender, reason: CloseReason) {
    let frame = CloseFrame {
        code: CloseCode::from(reason.code()),
        reason: reason.as_str().into(),
    };
    // The peer may already be gone.
    let _ = sender.send(Message::Close(Some(frame))).await;
}

struct Session {
    id: Uuid,
    doc: String,
    addr: SocketAddr,
    identity: Identity,
    entry: Arc<DocumentEntry>,
    shared: Arc<GatewayShared>,
}

impl Session {
    /// Register the connection with the store, and with the relay when it
    /// is the document's first local connection.
    async fn open(
        shared: Arc<GatewayShared>,
        doc: String,
        identity: Identity,
        addr: SocketAddr,
    ) -> Self {
        let id = Uuid::new_v4();
        let (entry, count) = shared.store.connect(&doc, id).await;
        if count == 1 {
            if let Some(relay) = &shared.relay {
                relay.subscribe(&doc).await;
                relay.catch_up(&entry).await;
            }
        }
        shared
            .store
            .hooks()
            .on_connect(&doc, id, identity.user_id.as_deref());
        GatewayCounters::bump(&shared.counters.total_connections);
        log::info!(
            "connection {id} from {addr} joined {doc} ({count} local, user {:?})",
            identity.user_id
        );
        Self {
            id,
            doc,
            addr,
            identity,
            entry,
            shared,
        }
    }

    async fn run(
        &self,
        mut ws_sender: WsSender,
        mut ws_receiver: WsReceiver,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), GatewayError> {
        let mut events = self.entry.subscribe();
        for frame in sync::handshake(&self.entry) {
            self.send(&mut ws_sender, frame.encode()).await?;
        }

        let mut heartbeat = tokio::time::interval(self.shared.config.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        heartbeat.tick().await;
        let mut alive = true;

        loop {
            if *shutdown.borrow() {
                let frame = CloseFrame {
                    code: CloseCode::Away,
                    reason: "server shutting down".into(),
                };
                let _ = ws_sender.send(Message::Close(Some(frame))).await;
                return Ok(());
            }
            tokio::select! {
                msg = ws_receiver.next() => match msg {
                    Some(Ok(Message::Binary(data))) => {
                        alive = true;
                        GatewayCounters::bump(&self.shared.counters.frames_received);
                        if let Some(reply) = self.on_frame(&data).await {
                            self.send(&mut ws_sender, reply.encode()).await?;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => return Ok(()),
                    Some(Ok(Message::Text(_))) => {
                        alive = true;
                        log::debug!("{}: ignoring text frame", self.id);
                    }
                    // Pongs, and pings (answered by tungstenite).
                    Some(Ok(_)) => alive = true,
                    Some(Err(e)) => return Err(e.into()),
                },
                event = events.recv() => match event {
                    Ok(event) => {
                        if event.origin == Origin::Connection(self.id) {
                            continue;
                        }
                        self.send(&mut ws_sender, event.frame.to_vec()).await?;
                    }
                    Err(RecvError::Lagged(missed)) => {
                        log::warn!(
                            "{} lagged by {missed} events on {}, resending state",
                            self.id,
                            self.doc
                        );
                        let state = Frame::update(self.entry.encode_state_as_update());
                        self.send(&mut ws_sender, state.encode()).await?;
                    }
                    Err(RecvError::Closed) => return Ok(()),
                },
                _ = heartbeat.tick() => {
                    if !alive {
                        log::info!("connection {} from {} timed out", self.id, self.addr);
                        GatewayCounters::bump(&self.shared.counters.heartbeat_timeouts);
                        close(&mut ws_sender, CloseReason::Timeout).await;
                        return Ok(());
                    }
                    alive = false;
                    ws_sender.send(Message::Ping(Vec::new().into())).await?;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        return Ok(());
                    }
                }
            }
        }
    }

    async fn send(&self, ws_sender: &mut WsSender, bytes: Vec<u8>) -> Result<(), GatewayError> {
        ws_sender.send(Message::Binary(bytes.into())).await?;
        GatewayCounters::bump(&self.shared.counters.frames_sent);
        Ok(())
    }

    /// Dispatch one inbound frame. Malformed input is logged and ignored.
    /// Returns the reply for this connection, if any.
    async fn on_frame(&self, data: &[u8]) -> Option<Frame> {
        let counters = &self.shared.counters;
        let limit = self.shared.config.max_frame_size;
        let frame = if data.len() > limit {
            Err(ProtocolError::TooLarge {
                size: data.len(),
                limit,
            })
        } else {
            Frame::decode(data)
        };
        let frame = match frame {
            Ok(frame) => frame,
            Err(e) => {
                GatewayCounters::bump(&counters.protocol_errors);
                log::warn!("{} on {}: ignoring frame: {e}", self.id, self.doc);
                return None;
            }
        };

        match frame {
            Frame::Sync(message) => {
                let can_write = self.identity.permissions.can_write();
                match sync::handle_sync(&self.entry, message, self.id, can_write) {
                    Ok(SyncOutcome::Reply(reply)) => return Some(reply),
                    Ok(SyncOutcome::Applied(update)) => {
                        if let Some(relay) = &self.shared.relay {
                            relay.publish_update(&self.doc, &update).await;
                        }
                    }
                    Ok(SyncOutcome::Dropped) => {
                        GatewayCounters::bump(&counters.dropped_writes);
                    }
                    Err(e) => {
                        GatewayCounters::bump(&counters.protocol_errors);
                        log::warn!("{} on {}: ignoring sync frame: {e}", self.id, self.doc);
                    }
                }
            }
            Frame::Awareness(payload) => {
                match sync::handle_awareness(
                    &self.entry,
                    &payload,
                    self.id,
                    self.identity.user_id.as_deref(),
                ) {
                    Ok(Some(update)) => {
                        if let Some(relay) = &self.shared.relay {
                            relay.publish_awareness(&self.doc, &update).await;
                        }
                    }
                    Ok(None) => {}
                    Err(e) => {
                        GatewayCounters::bump(&counters.protocol_errors);
                        log::warn!("{} on {}: ignoring awareness: {e}", self.id, self.doc);
                    }
                }
            }
            Frame::QueryAwareness => match sync::query_awareness(&self.entry) {
                Ok(reply) => return Some(reply),
                Err(e) => log::error!("awareness snapshot of {} failed: {e}", self.doc),
            },
        }
        None
    }

    /// Presence and refcount go first, with no suspension point in between;
    /// relay and hook notifications follow.
    async fn close(self) {
        let removed = self
            .entry
            .remove_presence(&[self.id], RemovalReason::Disconnect);
        let remaining = self.shared.store.remove_connection(&self.entry, self.id);

        if let Some(relay) = &self.shared.relay {
            if let Some(update) = &removed {
                relay.publish_awareness(&self.doc, update).await;
            }
            if remaining == 0 {
                relay.unsubscribe(&self.doc).await;
                // Someone joined while we were unsubscribing.
                if self.entry.connection_count() > 0 {
                    relay.subscribe(&self.doc).await;
                }
            }
        }

        self.shared
            .store
            .hooks()
            .on_disconnect(&self.doc, self.id, self.identity.user_id.as_deref());
        log::info!(
            "connection {} left {} ({remaining} local remaining)",
            self.id,
            self.doc
        );
    }
}
