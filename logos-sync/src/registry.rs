//! Document registry: room name → live shared document.
//!
//! An explicit service object built once at startup and handed to the
//! accept path; tests build their own isolated registries.
//!
//! Lock order is always room → registry. `get_or_create` only ever takes the
//! registry lock, and a room removes itself while still holding its own lock,
//! so a room is never dropped from the map while a joiner is inside it.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::config::RegistryConfig;
use crate::room::{JoinError, Joined, SessionId, SharedDoc};

/// Admission errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    EmptyRoomName,
    TooManyRooms { max: usize },
    RoomFull { room: String, max: usize },
}

impl std::fmt::Display for RegistryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmptyRoomName => write!(f, "Room name is empty"),
            Self::TooManyRooms { max } => write!(f, "Room limit of {max} reached"),
            Self::RoomFull { room, max } => {
                write!(f, "Room {room} is full ({max} connections)")
            }
        }
    }
}

impl std::error::Error for RegistryError {}

pub(crate) struct RegistryInner {
    rooms: RwLock<HashMap<String, Arc<SharedDoc>>>,
    config: RegistryConfig,
}

impl RegistryInner {
    /// Drop `room` from the map. Only called by the room itself, under its lock.
    pub(crate) async fn remove(&self, name: &str, room: &SharedDoc) -> bool {
        let mut rooms = self.rooms.write().await;
        let same = rooms
            .get(name)
            .is_some_and(|entry| std::ptr::eq(Arc::as_ptr(entry), room));

        if same {
            rooms.remove(name);
            return true;
        }

        // Two live instances for one name: the locking discipline is broken.
        debug_assert!(
            !rooms.contains_key(name),
            "second live SharedDoc registered for room {name}"
        );
        if rooms.contains_key(name) {
            log::error!("Room {name} closed but the registry holds a different instance");
        }
        false
    }
}

/// Process-wide map of live rooms.
#[derive(Clone)]
pub struct DocRegistry {
    inner: Arc<RegistryInner>,
}

impl DocRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                rooms: RwLock::new(HashMap::new()),
                config,
            }),
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.inner.config
    }

    /// Return the live room for `name`, creating it if absent.
    pub async fn get_or_create(&self, name: &str) -> Result<Arc<SharedDoc>, RegistryError> {
        if name.is_empty() {
            return Err(RegistryError::EmptyRoomName);
        }

        // Fast path: read lock
        {
            let rooms = self.inner.rooms.read().await;
            if let Some(room) = rooms.get(name) {
                return Ok(room.clone());
            }
        }

        let mut rooms = self.inner.rooms.write().await;
        // Double-check after acquiring write lock
        if let Some(room) = rooms.get(name) {
            return Ok(room.clone());
        }

        if let Some(max) = self.inner.config.max_rooms {
            if rooms.len() >= max {
                return Err(RegistryError::TooManyRooms { max });
            }
        }

        let room = Arc::new(SharedDoc::new(
            name,
            self.inner.config.broadcast_capacity,
            self.inner.config.max_connections_per_room,
            Arc::downgrade(&self.inner),
        ));
        rooms.insert(name.to_string(), room.clone());
        log::info!("Room {name} created ({} live)", rooms.len());
        Ok(room)
    }

    /// Resolve `name` and register `session` in it.
    ///
    /// A room that closed between lookup and join is re-resolved; by then the
    /// closing room has already left the map, so a fresh one is created.
    pub async fn join(
        &self,
        name: &str,
        session: SessionId,
    ) -> Result<(Arc<SharedDoc>, Joined), RegistryError> {
        loop {
            let room = self.get_or_create(name).await?;
            match room.add_connection(session).await {
                Ok(joined) => return Ok((room, joined)),
                Err(JoinError::Closed) => {
                    log::debug!("Room {name} closed during join, retrying");
                    tokio::task::yield_now().await;
                }
                Err(JoinError::Full { max }) => {
                    return Err(RegistryError::RoomFull {
                        room: name.to_string(),
                        max,
                    })
                }
            }
        }
    }

    pub async fn get(&self, name: &str) -> Option<Arc<SharedDoc>> {
        self.inner.rooms.read().await.get(name).cloned()
    }

    pub async fn room_count(&self) -> usize {
        self.inner.rooms.read().await.len()
    }

    /// Names of live rooms, sorted.
    pub async fn room_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.rooms.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn rooms(&self) -> Vec<Arc<SharedDoc>> {
        self.inner.rooms.read().await.values().cloned().collect()
    }
}

impl Default for DocRegistry {
    fn default() -> Self {
        Self::new(RegistryConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::SyncMessage;
    use crate::sync;
    use uuid::Uuid;
    use yrs::updates::decoder::Decode;
    use yrs::{Doc, StateVector, Text, Transact};

    fn text_update(content: &str) -> Vec<u8> {
        let doc = Doc::with_client_id(1);
        let text = doc.get_or_insert_text("content");
        let mut txn = doc.transact_mut();
        text.insert(&mut txn, 0, content);
        txn.encode_update_v1()
    }

    #[tokio::test]
    async fn test_get_or_create_is_idempotent() {
        let registry = DocRegistry::default();
        let a = registry.get_or_create("notes").await.unwrap();
        let b = registry.get_or_create("notes").await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.room_count().await, 1);
    }

    #[tokio::test]
    async fn test_rooms_are_isolated() {
        let registry = DocRegistry::default();
        let _a = registry.get_or_create("a").await.unwrap();
        let _b = registry.get_or_create("b").await.unwrap();
        assert_eq!(registry.room_names().await, vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn test_empty_name_rejected() {
        let registry = DocRegistry::default();
        assert_eq!(
            registry.get_or_create("").await.unwrap_err(),
            RegistryError::EmptyRoomName
        );
    }

    #[tokio::test]
    async fn test_room_limit() {
        let registry = DocRegistry::new(RegistryConfig {
            max_rooms: Some(1),
            ..RegistryConfig::default()
        });
        registry.get_or_create("one").await.unwrap();
        assert_eq!(
            registry.get_or_create("two").await.unwrap_err(),
            RegistryError::TooManyRooms { max: 1 }
        );
        // Existing rooms stay reachable at the limit.
        assert!(registry.get_or_create("one").await.is_ok());
    }

    #[tokio::test]
    async fn test_room_full_reported() {
        let registry = DocRegistry::new(RegistryConfig {
            max_connections_per_room: 1,
            ..RegistryConfig::default()
        });
        registry.join("solo", Uuid::new_v4()).await.unwrap();
        let err = registry.join("solo", Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, RegistryError::RoomFull { max: 1, .. }));
    }

    #[tokio::test]
    async fn test_last_close_removes_room_and_discards_state() {
        let registry = DocRegistry::default();
        let a = Uuid::new_v4();
        let (room, _joined) = registry.join("lifecycle", a).await.unwrap();
        room.handle_sync(a, &SyncMessage::Update(text_update("hello")))
            .await
            .unwrap();

        assert!(room.remove_connection(a).await);
        assert_eq!(registry.room_count().await, 0);
        assert!(registry.get("lifecycle").await.is_none());

        let b = Uuid::new_v4();
        let (fresh, joined) = registry.join("lifecycle", b).await.unwrap();
        assert!(!Arc::ptr_eq(&room, &fresh));

        let sv = match crate::protocol::Message::decode(&joined.handshake[0]).unwrap() {
            crate::protocol::Message::Sync(SyncMessage::Step1(sv)) => sv,
            other => panic!("expected step 1, got {other:?}"),
        };
        assert!(StateVector::decode_v1(&sv).unwrap().is_empty());
        assert_eq!(fresh.snapshot().await, sync::full_state(&Doc::new()));
    }

    #[tokio::test]
    async fn test_join_retries_closed_room() {
        let registry = DocRegistry::default();
        let a = Uuid::new_v4();
        let (stale, _joined) = registry.join("race", a).await.unwrap();

        // The last member leaves; a joiner that already resolved `stale`
        // must land in a new instance.
        stale.remove_connection(a).await;
        assert_eq!(
            stale.add_connection(Uuid::new_v4()).await.unwrap_err(),
            JoinError::Closed
        );

        let (room, _joined) = registry.join("race", Uuid::new_v4()).await.unwrap();
        assert!(!Arc::ptr_eq(&stale, &room));
        assert_eq!(registry.room_count().await, 1);
    }

    #[tokio::test]
    async fn test_concurrent_join_and_leave() {
        let registry = DocRegistry::default();
        let mut handles = Vec::new();
        for _ in 0..32 {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move {
                let session = Uuid::new_v4();
                let (room, _joined) = registry.join("busy", session).await.unwrap();
                tokio::task::yield_now().await;
                room.remove_connection(session).await;
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(registry.room_count().await, 0);
    }
}
