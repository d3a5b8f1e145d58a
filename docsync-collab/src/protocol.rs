//! Binary wire protocol for document synchronization.
//!
//! Wire format (lib0 variable-length encoding, y-websocket compatible):
//! ```text
//! ┌──────────────┬──────────────────────────────────────────────┐
//! │ kind (varint)│ payload                                      │
//! ├──────────────┼──────────────────────────────────────────────┤
//! │ 0 SYNC       │ sub-kind (varint) │ data (varint len + bytes)│
//! │ 1 AWARENESS  │ update (varint len + bytes)                  │
//! │ 3 QUERY      │ (empty)                                      │
//! └──────────────┴──────────────────────────────────────────────┘
//! ```
//!
//! Sync sub-kinds: `0` step 1 (state vector), `1` step 2 (diff), `2` update.
//!
//! Awareness updates carry `count` entries of
//! `client_id (varint) │ clock (varint) │ state (varint len + utf8 json)`,
//! where the JSON literal `null` marks a removed client.
//!
//! Decoding never panics: truncated or unknown frames come back as
//! [`ProtocolError`] so the caller can drop the frame and keep the connection.

use thiserror::Error;
use yrs::encoding::read::{Cursor, Read};
use yrs::encoding::write::Write;

/// Top-level message kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageKind {
    /// Document content synchronization
    Sync = 0,
    /// Presence (cursor, identity) delta or snapshot
    Awareness = 1,
    /// Request for a full awareness snapshot
    QueryAwareness = 3,
}

impl MessageKind {
    fn from_tag(tag: u32) -> Result<Self, ProtocolError> {
        match tag {
            0 => Ok(MessageKind::Sync),
            1 => Ok(MessageKind::Awareness),
            3 => Ok(MessageKind::QueryAwareness),
            other => Err(ProtocolError::UnknownKind(other)),
        }
    }
}

const SYNC_STEP1: u32 = 0;
const SYNC_STEP2: u32 = 1;
const SYNC_UPDATE: u32 = 2;

/// Sync sub-messages, wrapped inside a [`MessageKind::Sync`] frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncMessage {
    /// State vector of the sender; the receiver answers with a diff.
    Step1(Vec<u8>),
    /// Diff answering a step 1.
    Step2(Vec<u8>),
    /// Incremental delta.
    Update(Vec<u8>),
}

impl SyncMessage {
    fn tag(&self) -> u32 {
        match self {
            SyncMessage::Step1(_) => SYNC_STEP1,
            SyncMessage::Step2(_) => SYNC_STEP2,
            SyncMessage::Update(_) => SYNC_UPDATE,
        }
    }

    fn data(&self) -> &[u8] {
        match self {
            SyncMessage::Step1(d) | SyncMessage::Step2(d) | SyncMessage::Update(d) => d,
        }
    }

    /// Whether this message carries document content (and therefore mutates state).
    pub fn is_content(&self) -> bool {
        !matches!(self, SyncMessage::Step1(_))
    }
}

/// A decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Sync(SyncMessage),
    /// Raw awareness update, decoded by the awareness tracker.
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
        let mut buf = Vec::new();
        buf.write_var(self.kind() as u32);
        match self {
            Frame::Sync(msg) => {
                buf.write_var(msg.tag());
                buf.write_buf(msg.data());
            }
            Frame::Awareness(update) => buf.write_buf(update),
            Frame::QueryAwareness => {}
        }
        buf
    }

    /// Deserialize from the binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        if bytes.is_empty() {
            return Err(ProtocolError::Empty);
        }
        let mut cursor = Cursor::new(bytes);
        let kind = MessageKind::from_tag(cursor.read_var()?)?;
        match kind {
            MessageKind::Sync => {
                let tag: u32 = cursor.read_var()?;
                let data = cursor.read_buf()?.to_vec();
                let msg = match tag {
                    SYNC_STEP1 => SyncMessage::Step1(data),
                    SYNC_STEP2 => SyncMessage::Step2(data),
                    SYNC_UPDATE => SyncMessage::Update(data),
                    other => return Err(ProtocolError::UnknownSyncKind(other)),
                };
                Ok(Frame::Sync(msg))
            }
            MessageKind::Awareness => Ok(Frame::Awareness(cursor.read_buf()?.to_vec())),
            MessageKind::QueryAwareness => Ok(Frame::QueryAwareness),
        }
    }
}

/// One client's presence entry inside an awareness update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceEntry {
    pub client_id: u64,
    pub clock: u32,
    /// Opaque JSON presence blob; `None` means the client was removed.
    pub state: Option<String>,
}

impl PresenceEntry {
    pub fn new(client_id: u64, clock: u32, state: impl Into<String>) -> Self {
        Self {
            client_id,
            clock,
            state: Some(state.into()),
        }
    }

    pub fn removed(client_id: u64, clock: u32) -> Self {
        Self {
            client_id,
            clock,
            state: None,
        }
    }
}

const NULL_STATE: &str = "null";

/// Encode presence entries as an awareness update.
pub fn encode_entries(entries: &[PresenceEntry]) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.write_var(entries.len() as u32);
    for entry in entries {
        buf.write_var(entry.client_id);
        buf.write_var(entry.clock);
        buf.write_string(entry.state.as_deref().unwrap_or(NULL_STATE));
    }
    buf
}

/// Decode an awareness update into presence entries.
pub fn decode_entries(bytes: &[u8]) -> Result<Vec<PresenceEntry>, ProtocolError> {
    let mut cursor = Cursor::new(bytes);
    let count: u32 = cursor.read_var()?;
    // Each entry is at least three bytes; a larger count is a lie.
    if count as usize > bytes.len() {
        return Err(ProtocolError::InvalidLength(count as usize));
    }
    let mut entries = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let client_id: u64 = cursor.read_var()?;
        let clock: u32 = cursor.read_var()?;
        let json = cursor.read_string()?;
        let state = if json == NULL_STATE {
            None
        } else {
            Some(json.to_string())
        };
        entries.push(PresenceEntry {
            client_id,
            clock,
            state,
        });
    }
    Ok(entries)
}

/// Close codes sent when the server terminates a connection.
///
/// Clients reconnect on `ConnectionError` and re-authenticate on the others.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    ConnectionError,
    MissingToken,
    MissingDocument,
    InvalidToken,
}

impl CloseReason {
    pub fn code(self) -> u16 {
        match self {
            CloseReason::ConnectionError => 4000,
            CloseReason::MissingToken => 4001,
            CloseReason::MissingDocument => 4002,
            CloseReason::InvalidToken => 4003,
        }
    }

    pub fn message(self) -> &'static str {
        match self {
            CloseReason::ConnectionError => "connection error",
            CloseReason::MissingToken => "missing token",
            CloseReason::MissingDocument => "missing document parameter",
            CloseReason::InvalidToken => "invalid or expired token",
        }
    }

    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            4000 => Some(CloseReason::ConnectionError),
            4001 => Some(CloseReason::MissingToken),
            4002 => Some(CloseReason::MissingDocument),
            4003 => Some(CloseReason::InvalidToken),
            _ => None,
        }
    }
}

/// Protocol errors.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("empty frame")]
    Empty,
    #[error("unknown message kind {0}")]
    UnknownKind(u32),
    #[error("unknown sync message kind {0}")]
    UnknownSyncKind(u32),
    #[error("invalid entry count {0}")]
    InvalidLength(usize),
    #[error("malformed frame: {0}")]
    Malformed(#[from] yrs::encoding::read::Error),
}
