//! Binary frame protocol spoken over the client WebSocket.
//!
//! Wire format:
//! ```text
//! ┌─────────┬──────────────────────────────────────────────┐
//! │ tag     │ payload                                      │
//! │ 1 byte  │ variable                                     │
//! └─────────┴──────────────────────────────────────────────┘
//!
//! tag 0  Sync            ┌──────────┬────────────────────┐
//!                        │ sub-tag  │ state vector or    │
//!                        │ 1 byte   │ update bytes       │
//!                        └──────────┴────────────────────┘
//!                        sub-tag 0 = Step1, 1 = Step2, 2 = Update
//! tag 1  Awareness       bincode-encoded awareness update
//! tag 3  QueryAwareness  (empty)
//! ```
//!
//! The state vector and update bytes are opaque here; only the replica
//! implementation behind [`crate::mergeable::Mergeable`] interprets them.

use thiserror::Error;

/// Top-level frame tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageKind {
    Sync = 0,
    Awareness = 1,
    QueryAwareness = 3,
}

impl TryFrom<u8> for MessageKind {
    type Error = ProtocolError;

    fn try_from(tag: u8) -> Result<Self, Self::Error> {
        match tag {
            0 => Ok(Self::Sync),
            1 => Ok(Self::Awareness),
            3 => Ok(Self::QueryAwareness),
            other => Err(ProtocolError::UnknownTag(other)),
        }
    }
}

/// Sync sub-messages carried inside a [`Frame::Sync`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncMessage {
    /// Sender's state vector; the receiver answers with the missing diff.
    Step1(Vec<u8>),
    /// Diff computed against a Step1 state vector.
    Step2(Vec<u8>),
    /// Incremental update produced by a local mutation.
    Update(Vec<u8>),
}

impl SyncMessage {
    const STEP1: u8 = 0;
    const STEP2: u8 = 1;
    const UPDATE: u8 = 2;

    fn sub_tag(&self) -> u8 {
        match self {
            Self::Step1(_) => Self::STEP1,
            Self::Step2(_) => Self::STEP2,
            Self::Update(_) => Self::UPDATE,
        }
    }

    fn payload(&self) -> &[u8] {
        match self {
            Self::Step1(b) | Self::Step2(b) | Self::Update(b) => b,
        }
    }
}

/// One decoded protocol frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Sync(SyncMessage),
    Awareness(Vec<u8>),
    QueryAwareness,
}

impl Frame {
    pub fn kind(&self) -> MessageKind {
        match self {
            Frame::Sync(_) => MessageKind::Sync,
            Frame::Awareness(_) => MessageKind::Awareness,
            Frame::QueryAwareness => MessageKind::QueryAwareness,
        }
    }

    /// Serialize to the binary wire format.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Frame::Sync(msg) => {
                let payload = msg.payload();
                let mut out = Vec::with_capacity(2 + payload.len());
                out.push(MessageKind::Sync as u8);
                out.push(msg.sub_tag());
                out.extend_from_slice(payload);
                out
            }
            Frame::Awareness(payload) => {
                let mut out = Vec::with_capacity(1 + payload.len());
                out.push(MessageKind::Awareness as u8);
                out.extend_from_slice(payload);
                out
            }
            Frame::QueryAwareness => vec![MessageKind::QueryAwareness as u8],
        }
    }

    /// Deserialize from the binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (&tag, rest) = bytes.split_first().ok_or(ProtocolError::Empty)?;
        match MessageKind::try_from(tag)? {
            MessageKind::Sync => {
                let (&sub, payload) = rest.split_first().ok_or(ProtocolError::Truncated)?;
                let payload = payload.to_vec();
                let msg = match sub {
                    SyncMessage::STEP1 => SyncMessage::Step1(payload),
                    SyncMessage::STEP2 => SyncMessage::Step2(payload),
                    SyncMessage::UPDATE => SyncMessage::Update(payload),
                    other => return Err(ProtocolError::UnknownSyncTag(other)),
                };
                Ok(Frame::Sync(msg))
            }
            MessageKind::Awareness => Ok(Frame::Awareness(rest.to_vec())),
            MessageKind::QueryAwareness => Ok(Frame::QueryAwareness),
        }
    }

    pub fn step1(state_vector: Vec<u8>) -> Self {
        Frame::Sync(SyncMessage::Step1(state_vector))
    }

    pub fn step2(diff: Vec<u8>) -> Self {
        Frame::Sync(SyncMessage::Step2(diff))
    }

    pub fn update(update: Vec<u8>) -> Self {
        Frame::Sync(SyncMessage::Update(update))
    }
}

/// Application close codes sent when the gateway terminates a connection.
///
/// Values sit in the 4000-4999 range reserved for applications.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Malformed document identifier.
    InvalidRoom,
    /// Missing or invalid token.
    Unauthorized,
    /// Authenticated, but denied access to the document.
    Forbidden,
    /// Heartbeat was not answered within one interval.
    Timeout,
}

impl CloseReason {
    pub fn code(self) -> u16 {
        match self {
            CloseReason::InvalidRoom => 4400,
            CloseReason::Unauthorized => 4401,
            CloseReason::Forbidden => 4403,
            CloseReason::Timeout => 4408,
        }
    }

    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            4400 => Some(CloseReason::InvalidRoom),
            4401 => Some(CloseReason::Unauthorized),
            4403 => Some(CloseReason::Forbidden),
            4408 => Some(CloseReason::Timeout),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CloseReason::InvalidRoom => "invalid room",
            CloseReason::Unauthorized => "unauthorized",
            CloseReason::Forbidden => "forbidden",
            CloseReason::Timeout => "heartbeat timeout",
        }
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("empty frame")]
    Empty,
    #[error("truncated frame")]
    Truncated,
    #[error("unknown message tag {0}")]
    UnknownTag(u8),
    #[error("unknown sync message tag {0}")]
    UnknownSyncTag(u8),
    #[error("frame of {size} bytes exceeds limit of {limit}")]
    TooLarge { size: usize, limit: usize },
    #[error("payload codec error: {0}")]
    Codec(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sync_layout() {
        let frame = Frame::update(vec![7, 8, 9]);
        assert_eq!(frame.encode(), vec![0, 2, 7, 8, 9]);

        let frame = Frame::step1(vec![1]);
        assert_eq!(frame.encode(), vec![0, 0, 1]);
    }

    #[test]
    fn test_decode_each_kind() {
        assert_eq!(
            Frame::decode(&[0, 1, 4, 5]).unwrap(),
            Frame::Sync(SyncMessage::Step2(vec![4, 5]))
        );
        assert_eq!(Frame::decode(&[1, 9]).unwrap(), Frame::Awareness(vec![9]));
        assert_eq!(Frame::decode(&[3]).unwrap(), Frame::QueryAwareness);
    }

    #[test]
    fn test_empty_step1_is_valid() {
        let decoded = Frame::decode(&Frame::step1(Vec::new()).encode()).unwrap();
        assert_eq!(decoded, Frame::Sync(SyncMessage::Step1(Vec::new())));
    }

    #[test]
    fn test_malformed_frames() {
        assert_eq!(Frame::decode(&[]), Err(ProtocolError::Empty));
        assert_eq!(Frame::decode(&[0]), Err(ProtocolError::Truncated));
        assert_eq!(Frame::decode(&[2, 1]), Err(ProtocolError::UnknownTag(2)));
        assert_eq!(Frame::decode(&[0, 7]), Err(ProtocolError::UnknownSyncTag(7)));
    }

    #[test]
    fn test_kind_values() {
        assert_eq!(MessageKind::Sync as u8, 0);
        assert_eq!(MessageKind::Awareness as u8, 1);
        assert_eq!(MessageKind::QueryAwareness as u8, 3);
        assert_eq!(Frame::QueryAwareness.kind(), MessageKind::QueryAwareness);
    }

    #[test]
    fn test_close_codes() {
        for reason in [
            CloseReason::InvalidRoom,
            CloseReason::Unauthorized,
            CloseReason::Forbidden,
            CloseReason::Timeout,
        ] {
            assert!(reason.code() >= 4000);
            assert_eq!(CloseReason::from_code(reason.code()), Some(reason));
        }
        assert_eq!(CloseReason::from_code(1000), None);
    }
}
