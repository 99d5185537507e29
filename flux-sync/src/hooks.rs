//! Collaborator interfaces consumed by the store and gateway.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use thiserror::Error;

/// Persistence errors. A failed save leaves the document serving from memory.
#[derive(Debug, Clone, Error)]
pub enum PersistenceError {
    #[error("storage backend error: {0}")]
    Backend(String),
    #[error("snapshot codec error: {0}")]
    Codec(String),
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

/// Durable snapshot storage keyed by document name.
///
/// `save` always receives the full encoded state, so repeated calls are
/// idempotent.
#[async_trait]
pub trait Persistence: Send + Sync + 'static {
    async fn load(&self, doc: &str) -> Result<Option<Vec<u8>>, PersistenceError>;
    async fn save(&self, doc: &str, state: &[u8]) -> Result<(), PersistenceError>;
}

/// Lifecycle notifications. Every method defaults to a no-op.
pub trait LifecycleHooks: Send + Sync + 'static {
    fn on_connect(&self, _doc: &str, _connection: uuid::Uuid, _user: Option<&str>) {}
    fn on_disconnect(&self, _doc: &str, _connection: uuid::Uuid, _user: Option<&str>) {}
    fn on_destroy(&self, _doc: &str) {}
}

/// Hooks that ignore every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHooks;

impl LifecycleHooks for NoopHooks {}

/// Persistence that never stores anything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopPersistence;

#[async_trait]
impl Persistence for NoopPersistence {
    async fn load(&self, _doc: &str) -> Result<Option<Vec<u8>>, PersistenceError> {
        Ok(None)
    }

    async fn save(&self, _doc: &str, _state: &[u8]) -> Result<(), PersistenceError> {
        Ok(())
    }
}

/// One recorded persistence call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PersistenceCall {
    Load(String),
    Save(String),
}

/// In-memory persistence that keeps a call log.
#[derive(Debug, Default)]
pub struct MemoryPersistence {
    snapshots: Mutex<HashMap<String, Vec<u8>>>,
    calls: Mutex<Vec<PersistenceCall>>,
    fail_saves: std::sync::atomic::AtomicBool,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, doc: &str, state: Vec<u8>) {
        lock(&self.snapshots).insert(doc.to_string(), state);
    }

    pub fn snapshot(&self, doc: &str) -> Option<Vec<u8>> {
        lock(&self.snapshots).get(doc).cloned()
    }

    pub fn calls(&self) -> Vec<PersistenceCall> {
        lock(&self.calls).clone()
    }

    pub fn save_count(&self, doc: &str) -> usize {
        lock(&self.calls)
            .iter()
            .filter(|c| matches!(c, PersistenceCall::Save(d) if d == doc))
            .count()
    }

    /// Make every subsequent save fail.
    pub fn set_failing(&self, failing: bool) {
        self.fail_saves
            .store(failing, std::sync::atomic::Ordering::SeqCst);
    }
}

#[async_trait]
impl Persistence for MemoryPersistence {
    async fn load(&self, doc: &str) -> Result<Option<Vec<u8>>, PersistenceError> {
        lock(&self.calls).push(PersistenceCall::Load(doc.to_string()));
        Ok(self.snapshot(doc))
    }

    async fn save(&self, doc: &str, state: &[u8]) -> Result<(), PersistenceError> {
        lock(&self.calls).push(PersistenceCall::Save(doc.to_string()));
        if self.fail_saves.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(PersistenceError::Unavailable("saves disabled".into()));
        }
        self.insert(doc, state.to_vec());
        Ok(())
    }
}

/// Lock a mutex, recovering the data if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
