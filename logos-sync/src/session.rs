//! Per-connection session handler.
//!
//! ```text
//! Connecting ──► Handshaking ──► Active ──► Closed
//!     │               │             │          ▲
//!     └───────────────┴─────────────┴──────────┘  (error / peer close)
//! ```
//!
//! The handler only needs a stream of inbound binary frames and a sink for
//! outbound ones, so it runs the same over a WebSocket or an in-memory pipe.
//! Frame-level failures are logged and dropped; only the transport can end a
//! session early.

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use std::fmt::Display;
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use uuid::Uuid;

use crate::protocol::{Message, ProtocolError};
use crate::registry::{DocRegistry, RegistryError};
use crate::room::{RoomEvent, SessionId, SharedDoc};

/// Lifecycle of one connection. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionState {
    Connecting,
    Handshaking,
    Active,
    Closed,
}

/// Why a session ended.
#[derive(Debug, Clone, PartialEq)]
pub enum CloseReason {
    /// The peer closed the connection.
    PeerClosed,
    /// Reading or writing the transport failed.
    Transport(String),
    /// The registry refused admission.
    Rejected(RegistryError),
}

/// What a finished session reports back to the accept loop.
#[derive(Debug, Clone)]
pub struct SessionSummary {
    pub id: SessionId,
    pub room: String,
    pub frames_received: u64,
    pub frames_dropped: u64,
    pub reason: CloseReason,
}

/// One client's connection to one room.
pub struct Session {
    id: SessionId,
    room: String,
    state: SessionState,
    max_message_size: usize,
    frames_received: u64,
    frames_dropped: u64,
}

impl Session {
    pub fn new(room: impl Into<String>, max_message_size: usize) -> Self {
        Self {
            id: Uuid::new_v4(),
            room: room.into(),
            state: SessionState::Connecting,
            max_message_size,
            frames_received: 0,
            frames_dropped: 0,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    fn transition(&mut self, next: SessionState) {
        debug_assert!(next > self.state, "session cannot go from {:?} to {next:?}", self.state);
        log::debug!("Session {} ({}): {:?} -> {next:?}", self.id, self.room, self.state);
        self.state = next;
    }

    /// Drive the connection until the peer leaves or the transport fails.
    ///
    /// Always deregisters from the room before returning.
    pub async fn run<S, K, E>(
        mut self,
        registry: DocRegistry,
        mut inbound: S,
        mut outbound: K,
    ) -> SessionSummary
    where
        S: Stream<Item = Result<Vec<u8>, E>> + Unpin,
        K: Sink<Vec<u8>> + Unpin,
        K::Error: Display,
        E: Display,
    {
        let (room, joined) = match registry.join(&self.room, self.id).await {
            Ok(joined) => joined,
            Err(e) => {
                log::warn!("Session {} rejected from room {}: {e}", self.id, self.room);
                self.transition(SessionState::Closed);
                let _ = outbound.close().await;
                return self.summary(CloseReason::Rejected(e));
            }
        };

        self.transition(SessionState::Handshaking);
        let mut events = joined.events;
        let reason = match self
            .pump(&room, joined.handshake, &mut events, &mut inbound, &mut outbound)
            .await
        {
            Ok(()) => CloseReason::PeerClosed,
            Err(e) => {
                log::warn!("Session {} transport error: {e}", self.id);
                CloseReason::Transport(e)
            }
        };

        self.transition(SessionState::Closed);
        drop(events);
        room.remove_connection(self.id).await;
        let _ = outbound.close().await;
        self.summary(reason)
    }

    async fn pump<S, K, E>(
        &mut self,
        room: &Arc<SharedDoc>,
        handshake: Vec<Vec<u8>>,
        events: &mut broadcast::Receiver<RoomEvent>,
        inbound: &mut S,
        outbound: &mut K,
    ) -> Result<(), String>
    where
        S: Stream<Item = Result<Vec<u8>, E>> + Unpin,
        K: Sink<Vec<u8>> + Unpin,
        K::Error: Display,
        E: Display,
    {
        for frame in handshake {
            outbound.send(frame).await.map_err(|e| e.to_string())?;
        }
        self.transition(SessionState::Active);

        loop {
            tokio::select! {
                frame = inbound.next() => match frame {
                    Some(Ok(bytes)) => {
                        if let Some(reply) = self.handle_frame(room, &bytes).await {
                            outbound.send(reply).await.map_err(|e| e.to_string())?;
                        }
                    }
                    Some(Err(e)) => return Err(e.to_string()),
                    None => return Ok(()),
                },

                event = events.recv() => match event {
                    Ok(event) => {
                        // Never echo a peer's own change back to it.
                        if event.is_for(self.id) {
                            outbound
                                .send(event.frame.as_ref().clone())
                                .await
                                .map_err(|e| e.to_string())?;
                        }
                    }
                    Err(RecvError::Lagged(n)) => {
                        log::warn!(
                            "Session {} lagged by {n} frames in room {}, resending full state",
                            self.id,
                            self.room
                        );
                        let frame = room.full_state_frame().await;
                        outbound.send(frame).await.map_err(|e| e.to_string())?;
                        let frame = room.awareness_resync_frame().await;
                        outbound.send(frame).await.map_err(|e| e.to_string())?;
                    }
                    Err(RecvError::Closed) => return Ok(()),
                },
            }
        }
    }

    /// Dispatch one inbound frame; returns a reply for this peer, if any.
    async fn handle_frame(&mut self, room: &SharedDoc, bytes: &[u8]) -> Option<Vec<u8>> {
        self.frames_received += 1;

        let result = self.dispatch(room, bytes).await;
        match result {
            Ok(reply) => reply,
            Err(e) => {
                self.frames_dropped += 1;
                log::warn!("Session {} dropped frame in room {}: {e}", self.id, self.room);
                None
            }
        }
    }

    async fn dispatch(&self, room: &SharedDoc, bytes: &[u8]) -> Result<Option<Vec<u8>>, ProtocolError> {
        if bytes.len() > self.max_message_size {
            return Err(ProtocolError::FrameTooLarge {
                size: bytes.len(),
                max: self.max_message_size,
            });
        }

        match Message::decode(bytes)? {
            Message::Sync(msg) => room.handle_sync(self.id, &msg).await,
            Message::Awareness(blob) => {
                let change = room.handle_awareness(self.id, &blob).await?;
                log::trace!("Session {}: awareness change {change:?}", self.id);
                Ok(None)
            }
            Message::QueryAwareness => Ok(Some(room.query_awareness().await)),
            Message::Auth(_) => {
                log::debug!("Session {}: ignoring auth message", self.id);
                Ok(None)
            }
        }
    }

    fn summary(&self, reason: CloseReason) -> SessionSummary {
        SessionSummary {
            id: self.id,
            room: self.room.clone(),
            frames_received: self.frames_received,
            frames_dropped: self.frames_dropped,
            reason,
        }
    }
}
