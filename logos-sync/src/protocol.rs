//! Binary frame format for document synchronization.
//!
//! Wire format (lib0 encoding, compatible with `y-websocket` clients):
//! ```text
//! ┌────────────┬───────────────────────────────────────────────┐
//! │ tag varuint│ payload                                       │
//! ├────────────┼───────────────────────────────────────────────┤
//! │ 0 sync     │ subtype varuint ++ byteArray                  │
//! │            │   0 step 1 (state vector)                     │
//! │            │   1 step 2 (update)                           │
//! │            │   2 update (update)                           │
//! │ 1 aware    │ byteArray (awareness update blob)             │
//! │ 2 auth     │ opaque, ignored by the server                 │
//! │ 3 query    │ empty (request full awareness)                │
//! └────────────┴───────────────────────────────────────────────┘
//! ```

use crate::encoding::{DecodeError, Decoder, Encoder};

pub const MSG_SYNC: u64 = 0;
pub const MSG_AWARENESS: u64 = 1;
pub const MSG_AUTH: u64 = 2;
pub const MSG_QUERY_AWARENESS: u64 = 3;

pub const SYNC_STEP1: u64 = 0;
pub const SYNC_STEP2: u64 = 1;
pub const SYNC_UPDATE: u64 = 2;

/// Top-level frame tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Sync = 0,
    Awareness = 1,
    Auth = 2,
    QueryAwareness = 3,
}

/// Sync sub-protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncMessage {
    /// v1-encoded state vector of the sender.
    Step1(Vec<u8>),
    /// v1-encoded update answering a step 1.
    Step2(Vec<u8>),
    /// v1-encoded incremental update.
    Update(Vec<u8>),
}

impl SyncMessage {
    fn subtype(&self) -> u64 {
        match self {
            Self::Step1(_) => SYNC_STEP1,
            Self::Step2(_) => SYNC_STEP2,
            Self::Update(_) => SYNC_UPDATE,
        }
    }

    fn body(&self) -> &[u8] {
        match self {
            Self::Step1(b) | Self::Step2(b) | Self::Update(b) => b,
        }
    }
}

/// A decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Sync(SyncMessage),
    /// Encoded awareness update blob, see [`crate::awareness`].
    Awareness(Vec<u8>),
    /// Raw auth payload; admission control happens before this layer.
    Auth(Vec<u8>),
    QueryAwareness,
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::Sync(_) => MessageType::Sync,
            Self::Awareness(_) => MessageType::Awareness,
            Self::Auth(_) => MessageType::Auth,
            Self::QueryAwareness => MessageType::QueryAwareness,
        }
    }

    /// Serialize to the binary wire format.
    pub fn encode(&self) -> Vec<u8> {
        let mut enc = Encoder::with_capacity(self.encoded_len_hint());
        match self {
            Self::Sync(sync) => {
                enc.write_var_u64(MSG_SYNC);
                enc.write_var_u64(sync.subtype());
                enc.write_buf(sync.body());
            }
            Self::Awareness(blob) => {
                enc.write_var_u64(MSG_AWARENESS);
                enc.write_buf(blob);
            }
            Self::Auth(raw) => {
                enc.write_var_u64(MSG_AUTH);
                let mut out = enc.into_vec();
                out.extend_from_slice(raw);
                return out;
            }
            Self::QueryAwareness => {
                enc.write_var_u64(MSG_QUERY_AWARENESS);
            }
        }
        enc.into_vec()
    }

    /// Deserialize one frame.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let mut dec = Decoder::new(bytes);
        match dec.read_var_u64()? {
            MSG_SYNC => {
                let subtype = dec.read_var_u64()?;
                let body = dec.read_buf()?.to_vec();
                match subtype {
                    SYNC_STEP1 => Ok(Self::Sync(SyncMessage::Step1(body))),
                    SYNC_STEP2 => Ok(Self::Sync(SyncMessage::Step2(body))),
                    SYNC_UPDATE => Ok(Self::Sync(SyncMessage::Update(body))),
                    other => Err(ProtocolError::UnknownSyncType(other)),
                }
            }
            MSG_AWARENESS => Ok(Self::Awareness(dec.read_buf()?.to_vec())),
            MSG_AUTH => {
                let rest = dec.read_exact(dec.remaining())?;
                Ok(Self::Auth(rest.to_vec()))
            }
            MSG_QUERY_AWARENESS => Ok(Self::QueryAwareness),
            other => Err(ProtocolError::UnknownMessageType(other)),
        }
    }

    fn encoded_len_hint(&self) -> usize {
        match self {
            Self::Sync(sync) => sync.body().len() + 12,
            Self::Awareness(blob) => blob.len() + 11,
            Self::Auth(raw) => raw.len() + 1,
            Self::QueryAwareness => 1,
        }
    }
}

/// Protocol errors. Every variant is non-fatal for the connection.
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolError {
    /// Malformed varint / byte array / string.
    Decode(DecodeError),
    UnknownMessageType(u64),
    UnknownSyncType(u64),
    /// Payload bytes are not a valid state vector or update.
    InvalidPayload(String),
    /// The CRDT engine rejected an update.
    Merge(String),
    /// Awareness entry carried unparseable presence JSON.
    InvalidPresence(String),
    FrameTooLarge { size: usize, max: usize },
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Decode(e) => write!(f, "Decode error: {e}"),
            Self::UnknownMessageType(t) => write!(f, "Unknown message type: {t}"),
            Self::UnknownSyncType(t) => write!(f, "Unknown sync message type: {t}"),
            Self::InvalidPayload(e) => write!(f, "Invalid payload: {e}"),
            Self::Merge(e) => write!(f, "Merge error: {e}"),
            Self::InvalidPresence(e) => write!(f, "Invalid presence state: {e}"),
            Self::FrameTooLarge { size, max } => {
                write!(f, "Frame of {size} bytes exceeds limit of {max} bytes")
            }
        }
    }
}

impl std::error::Error for ProtocolError {}

impl From<DecodeError> for ProtocolError {
    fn from(e: DecodeError) -> Self {
        Self::Decode(e)
    }
}
