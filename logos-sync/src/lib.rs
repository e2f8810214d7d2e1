//! # logos-sync: collaborative document sync server
//!
//! Relays Yjs-compatible CRDT updates and presence between WebSocket peers
//! editing the same named document.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   WebSocket (lib0)   ┌─────────────┐
//! │  Peer A     │ ◄──────────────────► │  Session    │──┐
//! └─────────────┘                      └─────────────┘  │
//! ┌─────────────┐                      ┌─────────────┐  │   ┌─────────────┐
//! │  Peer B     │ ◄──────────────────► │  Session    │──┼──►│ DocRegistry │
//! └─────────────┘                      └─────────────┘  │   └──────┬──────┘
//!                                                       │          │ name
//!                                                       │   ┌──────▼──────┐
//!                                                       └──►│  SharedDoc  │
//!                                                           │ Doc         │
//!                                                           │ Awareness   │
//!                                                           │ broadcast   │
//!                                                           └─────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`encoding`]: lib0 variable-length integers and byte arrays
//! - [`protocol`]: Message framing (sync, awareness, auth, query)
//! - [`sync`]: Step 1 / step 2 / update handling against a yrs `Doc`
//! - [`awareness`]: Presence map with per-client clocks
//! - [`room`]: One shared document and its connections
//! - [`registry`]: Room name to live room, with teardown on last leave
//! - [`session`]: Per-connection state machine
//! - [`server`]: WebSocket accept loop
//! - [`config`]: Server and registry limits

pub mod awareness;
pub mod config;
pub mod encoding;
pub mod protocol;
pub mod registry;
pub mod room;
pub mod server;
pub mod session;
pub mod sync;

// Re-exports for convenience
pub use awareness::{
    Awareness, AwarenessChange, AwarenessEntry, AwarenessUpdate, ClientId, PresenceState,
    PresenceUser,
};
pub use config::{RegistryConfig, ServerConfig};
pub use encoding::{DecodeError, Decoder, Encoder};
pub use protocol::{Message, MessageType, ProtocolError, SyncMessage};
pub use registry::{DocRegistry, RegistryError};
pub use room::{JoinError, Joined, RoomEvent, SessionId, SharedDoc};
pub use server::{ServerError, ServerStats, SyncServer};
pub use session::{CloseReason, Session, SessionState, SessionSummary};
