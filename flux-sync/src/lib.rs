//! # flux-sync: real-time multi-writer document sync
//!
//! Keeps CRDT replicas of shared documents convergent across many WebSocket
//! clients and across several server processes.
//!
//! ## Architecture
//!
//! ```text
//!  clients ──ws──► Gateway ──connect()──► DocumentStore ──save()──► Persistence
//!                   │  ▲                    │ DocumentEntry
//!                   │  └── DocEvent fan-out ┘  ├── replica (Mergeable)
//!                   │                          └── Awareness
//!                   ▼
//!                 Relay ◄──── Bus (MemoryBroker | RemoteBus ──ws──► BusHub)
//!                   │
//!                   └── remote updates applied with Origin::Relay,
//!                       never published again
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] tagged binary frames and close codes
//! - [`mergeable`] CRDT replica abstraction, `yrs` implementation
//! - [`awareness`] per-document presence map
//! - [`store`] document cache, fan-out events, GC
//! - [`sync`] handshake and frame dispatch, socket-free
//! - [`relay`] cross-server pub/sub and snapshot handoff
//! - [`gateway`] WebSocket accept loop and sessions
//! - [`auth`], [`hooks`], [`storage`] collaborator implementations

pub mod auth;
pub mod awareness;
pub mod gateway;
pub mod hooks;
pub mod mergeable;
pub mod protocol;
pub mod relay;
pub mod storage;
pub mod store;
pub mod sync;

pub use auth::{AllowAnonymous, AuthError, Authenticator, Identity, JwtAuthenticator, Permissions};
pub use awareness::{Awareness, AwarenessUpdate, RemovalReason};
pub use gateway::{Gateway, GatewayConfig, GatewayError, GatewayStats};
pub use hooks::{
    LifecycleHooks, MemoryPersistence, NoopHooks, NoopPersistence, Persistence, PersistenceError,
};
pub use mergeable::{MergeError, Mergeable, YrsDocument};
pub use protocol::{CloseReason, Frame, ProtocolError, SyncMessage};
pub use relay::{
    Bus, BusError, BusHub, MemoryBroker, MemoryBus, Relay, RelayConfig, RelayPersistence,
    RelayStats, RemoteBus, RemoteBusConfig,
};
pub use storage::{RocksConfig, RocksPersistence, RocksStore};
pub use store::{DocumentEntry, DocumentStore, Origin, StoreConfig, StoreStats, Subscription};
