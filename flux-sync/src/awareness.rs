//! Per-document ephemeral presence.
//!
//! Each connection owns at most one presence entry: a small JSON object
//! (cursor, selection, identity) plus a per-entry clock. Every mutation
//! returns an [`AwarenessChange`] naming only the ids that changed, and the
//! matching [`AwarenessUpdate`] to broadcast. Nothing here is persisted.
//!
//! Clock rules when merging an update from another server:
//! - a higher clock always wins
//! - an equal clock wins only when it removes the entry
//!
//! Removed entries stay behind as tombstones so a late, older update cannot
//! resurrect them. [`Awareness::expire`] forgets tombstones after a while and
//! drops relayed entries whose origin stopped refreshing them.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::protocol::ProtocolError;

/// Connection id owning a presence entry.
pub type ClientId = Uuid;

/// Why an entry was removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalReason {
    Disconnect,
    Timeout,
    Remote,
}

impl RemovalReason {
    pub fn as_str(self) -> &'static str {
        match self {
            RemovalReason::Disconnect => "disconnect",
            RemovalReason::Timeout => "timeout",
            RemovalReason::Remote => "remote",
        }
    }
}

/// One entry inside an [`AwarenessUpdate`]. `state == None` means removed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AwarenessEntry {
    pub client: ClientId,
    pub clock: u64,
    /// JSON text of the state, kept as a string so the payload stays
    /// self-describing under bincode.
    pub state: Option<String>,
}

/// Wire payload of an awareness frame.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AwarenessUpdate {
    pub entries: Vec<AwarenessEntry>,
}

impl AwarenessUpdate {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Codec(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (update, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Codec(e.to_string()))?;
        Ok(update)
    }

    /// Parsed state of an entry; `None` for removals or unparsable JSON.
    pub fn state_of(entry: &AwarenessEntry) -> Option<Value> {
        entry
            .state
            .as_deref()
            .and_then(|s| serde_json::from_str(s).ok())
    }
}

/// Ids touched by one mutation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AwarenessChange {
    pub added: Vec<ClientId>,
    pub updated: Vec<ClientId>,
    pub removed: Vec<ClientId>,
}

impl AwarenessChange {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }

    fn touched(&self) -> impl Iterator<Item = &ClientId> {
        self.added
            .iter()
            .chain(self.updated.iter())
            .chain(self.removed.iter())
    }
}

#[derive(Debug, Clone)]
struct PresenceEntry {
    clock: u64,
    state: Option<Value>,
    last_updated: Instant,
    /// Learned from another server rather than set by a local connection.
    remote: bool,
}

/// Presence map for one document.
#[derive(Debug, Default)]
pub struct Awareness {
    entries: HashMap<ClientId, PresenceEntry>,
    /// Monotonic counter bumped on every accepted change.
    version: u64,
}

impl Awareness {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole state of `client`. `Value::Null` clears it.
    pub fn set_local_state(&mut self, client: ClientId, state: Value) -> AwarenessChange {
        let state = if state.is_null() { None } else { Some(state) };
        self.write(client, state)
    }

    /// Set one field of `client`'s object state, creating the object if needed.
    pub fn set_local_state_field(
        &mut self,
        client: ClientId,
        field: &str,
        value: Value,
    ) -> AwarenessChange {
        let mut state = self
            .entries
            .get(&client)
            .and_then(|e| e.state.clone())
            .filter(Value::is_object)
            .unwrap_or_else(|| Value::Object(Default::default()));
        if let Some(map) = state.as_object_mut() {
            map.insert(field.to_string(), value);
        }
        self.write(client, Some(state))
    }

    /// Remove the entries of `clients`. Unknown ids are skipped.
    pub fn remove_states(
        &mut self,
        clients: &[ClientId],
        reason: RemovalReason,
    ) -> AwarenessChange {
        let mut change = AwarenessChange::default();
        for client in clients {
            let Some(entry) = self.entries.get_mut(client) else {
                continue;
            };
            if entry.state.is_none() {
                continue;
            }
            entry.clock += 1;
            entry.state = None;
            entry.last_updated = Instant::now();
            change.removed.push(*client);
            log::trace!("awareness: removed {client} ({})", reason.as_str());
        }
        if !change.is_empty() {
            self.version += 1;
        }
        change
    }

    /// Merge an update received from another server.
    pub fn apply_update(&mut self, update: &AwarenessUpdate) -> AwarenessChange {
        let mut change = AwarenessChange::default();
        let now = Instant::now();
        for incoming in &update.entries {
            let state = AwarenessUpdate::state_of(incoming);
            match self.entries.get_mut(&incoming.client) {
                Some(current) => {
                    let newer = incoming.clock > current.clock;
                    let removal = incoming.clock == current.clock
                        && state.is_none()
                        && current.state.is_some();
                    if !newer && !removal {
                        continue;
                    }
                    match (&current.state, &state) {
                        (Some(_), None) => change.removed.push(incoming.client),
                        (None, Some(_)) => change.added.push(incoming.client),
                        (Some(a), Some(b)) if a != b => change.updated.push(incoming.client),
                        _ => {}
                    }
                    current.clock = incoming.clock;
                    current.state = state;
                    current.last_updated = now;
                    current.remote = true;
                }
                None => {
                    if state.is_some() {
                        change.added.push(incoming.client);
                    }
                    self.entries.insert(
                        incoming.client,
                        PresenceEntry {
                            clock: incoming.clock,
                            state,
                            last_updated: now,
                            remote: true,
                        },
                    );
                }
            }
        }
        if !change.is_empty() {
            self.version += 1;
        }
        change
    }

    /// Encode the entries named in `change` for broadcast.
    pub fn encode_change(&self, change: &AwarenessChange) -> AwarenessUpdate {
        AwarenessUpdate {
            entries: change
                .touched()
                .filter_map(|client| self.entry_for(client))
                .collect(),
        }
    }

    /// Full snapshot of every live entry, answered to Query-Awareness.
    pub fn encode_full(&self) -> AwarenessUpdate {
        AwarenessUpdate {
            entries: self
                .entries
                .iter()
                .filter(|(_, e)| e.state.is_some())
                .filter_map(|(client, _)| self.entry_for(client))
                .collect(),
        }
    }

    pub fn get_state(&self, client: &ClientId) -> Option<&Value> {
        self.entries.get(client).and_then(|e| e.state.as_ref())
    }

    /// Live (non-removed) entries.
    pub fn states(&self) -> impl Iterator<Item = (&ClientId, &Value)> {
        self.entries
            .iter()
            .filter_map(|(id, e)| e.state.as_ref().map(|s| (id, s)))
    }

    pub fn len(&self) -> usize {
        self.states().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// Expire what nobody refreshed within `ttl` as of `now`: relayed
    /// entries are removed (and reported), tombstones are forgotten. Entries
    /// of local connections live until the connection closes.
    pub fn expire(&mut self, now: Instant, ttl: Duration) -> AwarenessChange {
        let mut change = AwarenessChange::default();
        self.entries.retain(|client, entry| {
            if now.saturating_duration_since(entry.last_updated) < ttl {
                return true;
            }
            if entry.state.is_none() {
                return false;
            }
            if entry.remote {
                entry.state = None;
                entry.last_updated = now;
                change.removed.push(*client);
                log::trace!(
                    "awareness: removed {client} ({})",
                    RemovalReason::Timeout.as_str()
                );
            }
            true
        });
        if !change.is_empty() {
            self.version += 1;
        }
        change
    }

    fn write(&mut self, client: ClientId, state: Option<Value>) -> AwarenessChange {
        let mut change = AwarenessChange::default();
        let now = Instant::now();
        match self.entries.get_mut(&client) {
            Some(entry) => {
                match (&entry.state, &state) {
                    (None, Some(_)) => change.added.push(client),
                    (Some(_), None) => change.removed.push(client),
                    // Unchanged content still bumps the clock so peers refresh it.
                    (Some(_), Some(_)) => change.updated.push(client),
                    (None, None) => {}
                }
                entry.clock += 1;
                entry.state = state;
                entry.last_updated = now;
                entry.remote = false;
            }
            None => {
                if state.is_some() {
                    change.added.push(client);
                }
                self.entries.insert(
                    client,
                    PresenceEntry {
                        clock: 1,
                        state,
                        last_updated: now,
                        remote: false,
                    },
                );
            }
        }
        if !change.is_empty() {
            self.version += 1;
        }
        change
    }

    fn entry_for(&self, client: &ClientId) -> Option<AwarenessEntry> {
        self.entries.get(client).map(|e| AwarenessEntry {
            client: *client,
            clock: e.clock,
            state: e.state.as_ref().map(Value::to_string),
        })
    }
}
