//! Room state: one shared document, its awareness, and its connections.
//!
//! ```text
//!  session A ──┐                       ┌──► session B
//!              │   Mutex<RoomState>    │
//!  frame ──────┼─► yrs Doc / Awareness ├──► session C
//!              │        │              │
//!              │   broadcast::Sender ──┘   (origin A filtered by A)
//!              │        │
//!              │   update stream ──────────► external persistence
//! ```
//!
//! Every mutation of the document, the awareness map and the connection set
//! happens under the room mutex. Broadcast is a bounded tokio channel, so
//! publishing never waits on a slow peer.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, Mutex};
use uuid::Uuid;
use yrs::Doc;

use crate::awareness::{Awareness, AwarenessChange, AwarenessUpdate, ClientId};
use crate::protocol::{Message, ProtocolError, SyncMessage};
use crate::registry::RegistryInner;
use crate::sync::{self, SyncOutcome};

/// Identity of one transport connection.
pub type SessionId = Uuid;

/// A pre-encoded frame published to every session of a room.
#[derive(Debug, Clone)]
pub struct RoomEvent {
    /// Session whose input produced the frame; that session skips it.
    pub origin: Option<SessionId>,
    pub frame: Arc<Vec<u8>>,
}

impl RoomEvent {
    /// Whether `session` should forward this frame to its peer.
    pub fn is_for(&self, session: SessionId) -> bool {
        self.origin != Some(session)
    }
}

/// Handed to a session once it is registered in a room.
#[derive(Debug)]
pub struct Joined {
    /// Subscription to the room's fan-out; dropping it unsubscribes.
    pub events: broadcast::Receiver<RoomEvent>,
    /// Frames to send before anything else: sync step 1, then current
    /// awareness if any client is present.
    pub handshake: Vec<Vec<u8>>,
}

/// Why a session could not be added to a room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinError {
    /// The room was torn down; resolve it again through the registry.
    Closed,
    Full { max: usize },
}

impl std::fmt::Display for JoinError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "Room is closed"),
            Self::Full { max } => write!(f, "Room is full ({max} connections)"),
        }
    }
}

impl std::error::Error for JoinError {}

struct RoomState {
    doc: Doc,
    awareness: Awareness,
    /// Session → awareness client ids it speaks for.
    connections: HashMap<SessionId, HashSet<ClientId>>,
    closed: bool,
}

/// One collaboratively edited document and its connected sessions.
pub struct SharedDoc {
    name: String,
    state: Mutex<RoomState>,
    events: broadcast::Sender<RoomEvent>,
    updates: broadcast::Sender<Arc<Vec<u8>>>,
    max_connections: usize,
    registry: Weak<RegistryInner>,
    frames_broadcast: AtomicU64,
}

impl std::fmt::Debug for SharedDoc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedDoc")
            .field("name", &self.name)
            .field("max_connections", &self.max_connections)
            .finish_non_exhaustive()
    }
}

impl SharedDoc {
    pub(crate) fn new(
        name: impl Into<String>,
        broadcast_capacity: usize,
        max_connections: usize,
        registry: Weak<RegistryInner>,
    ) -> Self {
        let capacity = broadcast_capacity.max(1);
        let (events, _) = broadcast::channel(capacity);
        let (updates, _) = broadcast::channel(capacity);
        Self {
            name: name.into(),
            state: Mutex::new(RoomState {
                doc: Doc::new(),
                awareness: Awareness::new(),
                connections: HashMap::new(),
                closed: false,
            }),
            events,
            updates,
            max_connections,
            registry,
            frames_broadcast: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Register `session` and compute its handshake atomically, so no update
    /// can slip between the handshake snapshot and the subscription.
    pub async fn add_connection(&self, session: SessionId) -> Result<Joined, JoinError> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;

        if state.closed {
            return Err(JoinError::Closed);
        }
        if state.connections.len() >= self.max_connections {
            return Err(JoinError::Full {
                max: self.max_connections,
            });
        }

        state.connections.insert(session, HashSet::new());
        let events = self.events.subscribe();

        let mut handshake = vec![sync::step1(&state.doc).encode()];
        if !state.awareness.is_empty() {
            handshake.push(Message::Awareness(state.awareness.encode_full()).encode());
        }

        log::info!(
            "Session {session} joined room {} ({} connected)",
            self.name,
            state.connections.len()
        );
        Ok(Joined { events, handshake })
    }

    /// Deregister `session`, clear the presence it controlled and, if it was
    /// the last one, tear the room down and drop it from the registry.
    ///
    /// Returns `true` when the room was torn down.
    pub async fn remove_connection(&self, session: SessionId) -> bool {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;

        let Some(controlled) = state.connections.remove(&session) else {
            return false;
        };

        let mut controlled: Vec<ClientId> = controlled.into_iter().collect();
        controlled.sort_unstable();
        let removed = state.awareness.remove_states(&controlled, Instant::now());
        if !removed.is_empty() {
            let frame = Message::Awareness(state.awareness.encode_update(&removed)).encode();
            self.publish(None, frame);
        }

        log::info!(
            "Session {session} left room {} ({} remaining)",
            self.name,
            state.connections.len()
        );

        if !state.connections.is_empty() {
            return false;
        }

        state.closed = true;
        state.awareness.clear();
        state.doc = Doc::new();

        // Still under the room lock: a joiner holding this Arc sees `closed`
        // and re-resolves, finding the entry already gone.
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(&self.name, self).await;
        }
        log::info!("Room {} destroyed (empty)", self.name);
        true
    }

    /// Handle a sync message from `session`.
    ///
    /// Returns the reply frame for `session` (step 2 for a step 1). Merged
    /// updates are relayed to the other sessions and the update stream.
    pub async fn handle_sync(
        &self,
        session: SessionId,
        msg: &SyncMessage,
    ) -> Result<Option<Vec<u8>>, ProtocolError> {
        let guard = self.state.lock().await;

        match sync::handle_sync_message(&guard.doc, msg)? {
            SyncOutcome::Reply(reply) => Ok(Some(reply.encode())),
            SyncOutcome::Applied(Some(update)) => {
                let frame = Message::Sync(SyncMessage::Update(update.clone())).encode();
                self.publish(Some(session), frame);
                let _ = self.updates.send(Arc::new(update));
                Ok(None)
            }
            SyncOutcome::Applied(None) => Ok(None),
        }
    }

    /// Apply an awareness blob from `session` and relay the recomputed change.
    pub async fn handle_awareness(
        &self,
        session: SessionId,
        blob: &[u8],
    ) -> Result<AwarenessChange, ProtocolError> {
        let update = AwarenessUpdate::decode(blob)?;

        let mut guard = self.state.lock().await;
        let state = &mut *guard;

        let change = state.awareness.apply_update(&update, Instant::now());
        if let Some(controlled) = state.connections.get_mut(&session) {
            controlled.extend(change.added.iter().chain(&change.updated).copied());
            for id in &change.removed {
                controlled.remove(id);
            }
        }

        if !change.is_empty() {
            let frame = Message::Awareness(state.awareness.encode_update(&change.changed())).encode();
            self.publish(Some(session), frame);
        }
        Ok(change)
    }

    /// Awareness frame covering every present client.
    pub async fn query_awareness(&self) -> Vec<u8> {
        let guard = self.state.lock().await;
        Message::Awareness(guard.awareness.encode_full()).encode()
    }

    /// Awareness frame with every live state and every known removal, for a
    /// peer that may have missed relayed presence changes.
    pub async fn awareness_resync_frame(&self) -> Vec<u8> {
        let guard = self.state.lock().await;
        Message::Awareness(guard.awareness.encode_known()).encode()
    }

    /// Remove presence not renewed within `timeout` and relay the removals.
    pub async fn sweep_awareness(&self, timeout: Duration) -> Vec<ClientId> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        if state.closed {
            return Vec::new();
        }

        let removed = state.awareness.remove_outdated(Instant::now(), timeout);
        if !removed.is_empty() {
            for controlled in state.connections.values_mut() {
                for id in &removed {
                    controlled.remove(id);
                }
            }
            log::debug!("Room {}: expired presence for {removed:?}", self.name);
            let frame = Message::Awareness(state.awareness.encode_update(&removed)).encode();
            self.publish(None, frame);
        }
        removed
    }

    /// Full document state as one v1 update.
    pub async fn snapshot(&self) -> Vec<u8> {
        let guard = self.state.lock().await;
        sync::full_state(&guard.doc)
    }

    /// Sync frame carrying the full document state.
    pub async fn full_state_frame(&self) -> Vec<u8> {
        Message::Sync(SyncMessage::Update(self.snapshot().await)).encode()
    }

    /// Every update merged into the document from now on.
    pub fn subscribe_updates(&self) -> broadcast::Receiver<Arc<Vec<u8>>> {
        self.updates.subscribe()
    }

    /// Run `f` against the document under the room lock.
    pub async fn with_doc<R>(&self, f: impl FnOnce(&Doc) -> R) -> R {
        let guard = self.state.lock().await;
        f(&guard.doc)
    }

    pub async fn connection_count(&self) -> usize {
        self.state.lock().await.connections.len()
    }

    pub async fn is_closed(&self) -> bool {
        self.state.lock().await.closed
    }

    /// Client ids with live presence, sorted.
    pub async fn awareness_clients(&self) -> Vec<ClientId> {
        self.state.lock().await.awareness.client_ids()
    }

    /// Client ids `session` is responsible for, sorted.
    pub async fn controlled_clients(&self, session: SessionId) -> Vec<ClientId> {
        let guard = self.state.lock().await;
        let mut ids: Vec<ClientId> = guard
            .connections
            .get(&session)
            .map(|c| c.iter().copied().collect())
            .unwrap_or_default();
        ids.sort_unstable();
        ids
    }

    /// Frames published since the room was created.
    pub fn frames_broadcast(&self) -> u64 {
        self.frames_broadcast.load(Ordering::Relaxed)
    }

    fn publish(&self, origin: Option<SessionId>, frame: Vec<u8>) {
        self.frames_broadcast.fetch_add(1, Ordering::Relaxed);
        // No receivers is not an error: the room may have a single member.
        let receivers = self
            .events
            .send(RoomEvent {
                origin,
                frame: Arc::new(frame),
            })
            .unwrap_or(0);
        log::trace!("Room {}: frame published to {receivers} receivers", self.name);
    }
}
