//! Connection gateway.
//!
//! Accepts WebSocket connections at `ws://host:port/<document>?token=...`,
//! authenticates them, and drives one [`connection`] session per socket
//! against the shared [`DocumentStore`]. The accept loop also owns the GC
//! sweep and the relay receive loop so that [`Gateway::shutdown`] stops
//! everything in order: connections are closed with 1001, background loops
//! stop, then every document is persisted.

mod connection;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinSet;

use crate::auth::Authenticator;
use crate::protocol::ProtocolError;
use crate::relay::{Relay, RelayStats};
use crate::store::{DocumentStore, StoreStats};

pub use connection::ConnectTarget;

/// How long shutdown waits for sessions to say goodbye.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub bind_addr: String,
    /// Ping period. A peer silent for a whole period is dropped.
    pub heartbeat_interval: Duration,
    /// Largest inbound frame accepted, in bytes.
    pub max_frame_size: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:1234".to_string(),
            heartbeat_interval: Duration::from_secs(30),
            max_frame_size: 16 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Snapshot for observability tooling.
#[derive(Debug, Clone, Default)]
pub struct GatewayStats {
    /// Live connections across all documents.
    pub connections: usize,
    /// Loaded documents.
    pub documents: usize,
    pub per_document: BTreeMap<String, usize>,
    pub total_connections: u64,
    pub rejected_connections: u64,
    pub frames_received: u64,
    pub frames_sent: u64,
    pub protocol_errors: u64,
    pub dropped_writes: u64,
    pub heartbeat_timeouts: u64,
    pub store: StoreStats,
    /// `None` when running without a relay.
    pub relay: Option<RelayStats>,
}

#[derive(Default)]
pub(crate) struct GatewayCounters {
    pub(crate) total_connections: AtomicU64,
    pub(crate) rejected_connections: AtomicU64,
    pub(crate) frames_received: AtomicU64,
    pub(crate) frames_sent: AtomicU64,
    pub(crate) protocol_errors: AtomicU64,
    pub(crate) dropped_writes: AtomicU64,
    pub(crate) heartbeat_timeouts: AtomicU64,
}

impl GatewayCounters {
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Everything a session needs, shared across connection tasks.
pub(crate) struct GatewayShared {
    pub(crate) config: GatewayConfig,
    pub(crate) store: Arc<DocumentStore>,
    pub(crate) auth: Arc<dyn Authenticator>,
    pub(crate) relay: Option<Arc<Relay>>,
    pub(crate) counters: Arc<GatewayCounters>,
}

pub struct Gateway {
    config: GatewayConfig,
    store: Arc<DocumentStore>,
    auth: Arc<dyn Authenticator>,
    relay: Option<Arc<Relay>>,
    counters: Arc<GatewayCounters>,
    shutdown_tx: watch::Sender<bool>,
}

impl Gateway {
    pub fn new(
        config: GatewayConfig,
        store: Arc<DocumentStore>,
        auth: Arc<dyn Authenticator>,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            config,
            store,
            auth,
            relay: None,
            counters: Arc::new(GatewayCounters::default()),
            shutdown_tx,
        }
    }

    pub fn with_relay(mut self, relay: Arc<Relay>) -> Self {
        self.relay = Some(relay);
        self
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<DocumentStore> {
        &self.store
    }

    pub fn relay(&self) -> Option<&Arc<Relay>> {
        self.relay.as_ref()
    }

    /// Bind the configured address and serve until shutdown.
    pub async fn run(&self) -> Result<(), GatewayError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener until [`shutdown`](Self::shutdown).
    pub async fn serve(&self, listener: TcpListener) -> Result<(), GatewayError> {
        let mut shutdown = self.shutdown_tx.subscribe();
        let store = self.store.clone();
        let shared = Arc::new(GatewayShared {
            config: self.config.clone(),
            store: store.clone(),
            auth: self.auth.clone(),
            relay: self.relay.clone(),
            counters: self.counters.clone(),
        });

        let gc = tokio::spawn(store.clone().run_gc(shutdown.clone()));
        let relay_loop = self
            .relay
            .clone()
            .map(|relay| tokio::spawn(relay.run(store.clone(), shutdown.clone())));

        log::info!("sync gateway listening on {}", listener.local_addr()?);

        let mut sessions = JoinSet::new();
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        log::debug!("new TCP connection from {addr}");
                        let shared = shared.clone();
                        let session_shutdown = shutdown.clone();
                        let session =
                            connection::handle_connection(stream, addr, shared, session_shutdown);
                        sessions.spawn(async move {
                            if let Err(e) = session.await {
                                log::warn!("connection {addr} ended with error: {e}");
                            }
                        });
                    }
                    Err(e) => {
                        log::error!("accept failed: {e}");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
                Some(_) = sessions.join_next(), if !sessions.is_empty() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        log::info!("shutting down: closing {} sessions", sessions.len());
        let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
            while sessions.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            log::warn!("sessions did not close in time, aborting them");
            sessions.shutdown().await;
        }

        if let Err(e) = gc.await {
            log::error!("gc task failed: {e}");
        }
        if let Some(task) = relay_loop {
            if let Err(e) = task.await {
                log::error!("relay task failed: {e}");
            }
        }
        store.close().await;
        log::info!("sync gateway stopped");
        Ok(())
    }

    /// Ask [`serve`](Self::serve) to stop. Idempotent.
    pub fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
    }

    pub fn stats(&self) -> GatewayStats {
        let store = self.store.stats();
        let counters = &self.counters;
        GatewayStats {
            connections: store.connections,
            documents: store.documents,
            per_document: store.per_document.clone(),
            total_connections: counters.total_connections.load(Ordering::Relaxed),
            rejected_connections: counters.rejected_connections.load(Ordering::Relaxed),
            frames_received: counters.frames_received.load(Ordering::Relaxed),
            frames_sent: counters.frames_sent.load(Ordering::Relaxed),
            protocol_errors: counters.protocol_errors.load(Ordering::Relaxed),
            dropped_writes: counters.dropped_writes.load(Ordering::Relaxed),
            heartbeat_timeouts: counters.heartbeat_timeouts.load(Ordering::Relaxed),
            store,
            relay: self.relay.as_ref().map(|relay| relay.stats()),
        }
    }
}
