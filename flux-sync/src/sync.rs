//! Sync protocol engine: handshake and per-frame dispatch against one
//! document entry. Socket-free so it can be exercised directly.

use serde_json::Value;
use uuid::Uuid;

use crate::awareness::AwarenessUpdate;
use crate::mergeable::MergeError;
use crate::protocol::{Frame, ProtocolError, SyncMessage};
use crate::store::{DocumentEntry, Origin};

/// Result of handling one Sync frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Send this frame back to the requesting connection only.
    Reply(Frame),
    /// The update was merged and fanned out locally; publish it to the relay.
    Applied(Vec<u8>),
    /// A write from a connection without write permission.
    Dropped,
}

/// Frames sent right after a connection is registered: the server's state
/// vector (asking the client for what the server lacks) and, when anyone
/// is present, the current awareness snapshot.
pub fn handshake(entry: &DocumentEntry) -> Vec<Frame> {
    let mut frames = vec![Frame::step1(entry.encode_state_vector())];
    let snapshot = entry.awareness_snapshot();
    if !snapshot.is_empty() {
        match snapshot.encode() {
            Ok(payload) => frames.push(Frame::Awareness(payload)),
            Err(e) => log::error!("awareness snapshot of {} failed: {e}", entry.name()),
        }
    }
    frames
}

/// Handle a Sync frame from `connection`.
pub fn handle_sync(
    entry: &DocumentEntry,
    message: SyncMessage,
    connection: Uuid,
    can_write: bool,
) -> Result<SyncOutcome, MergeError> {
    match message {
        SyncMessage::Step1(state_vector) => {
            let diff = entry.encode_diff(&state_vector)?;
            Ok(SyncOutcome::Reply(Frame::step2(diff)))
        }
        SyncMessage::Step2(update) | SyncMessage::Update(update) => {
            if !can_write {
                log::debug!(
                    "dropping write from read-only connection {connection} on {}",
                    entry.name()
                );
                return Ok(SyncOutcome::Dropped);
            }
            entry.apply_update(&update, Origin::Connection(connection))?;
            Ok(SyncOutcome::Applied(update))
        }
    }
}

/// Handle an Awareness frame: the connection's presence becomes the last
/// state carried in the update. Authenticated users get `userId` stamped
/// into object states.
pub fn handle_awareness(
    entry: &DocumentEntry,
    payload: &[u8],
    connection: Uuid,
    user_id: Option<&str>,
) -> Result<Option<AwarenessUpdate>, ProtocolError> {
    let update = AwarenessUpdate::decode(payload)?;
    let Some(last) = update.entries.last() else {
        return Ok(None);
    };
    let mut state = match &last.state {
        Some(json) => {
            serde_json::from_str::<Value>(json).map_err(|e| ProtocolError::Codec(e.to_string()))?
        }
        None => Value::Null,
    };
    if let (Some(user), Some(map)) = (user_id, state.as_object_mut()) {
        map.insert("userId".to_string(), Value::String(user.to_string()));
    }
    Ok(entry.set_presence(connection, state))
}

/// Answer to Query-Awareness.
pub fn query_awareness(entry: &DocumentEntry) -> Result<Frame, ProtocolError> {
    Ok(Frame::Awareness(entry.awareness_snapshot().encode()?))
}
