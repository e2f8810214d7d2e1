//! Awareness protocol: ephemeral per-client presence.
//!
//! Presence (display name, color, cursor range) is never persisted. Each
//! entry is keyed by the numeric Yjs client id and versioned by a per-client
//! logical clock; a `null` state marks removal.
//!
//! ## Update blob
//!
//! ```text
//! varuint count
//! repeat count:
//!   varuint   client_id
//!   varuint   clock
//!   varString state JSON  ("null" = removed)
//! ```
//!
//! Applying a blob yields an [`AwarenessChange`]; the room re-encodes the
//! changed ids from its own map and relays that, never the inbound bytes.

use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::encoding::{Decoder, Encoder};
use crate::protocol::ProtocolError;

/// Yjs document client id.
pub type ClientId = u64;

// ───────────────────────────────────────────────────────────────────
// Presence payload
// ───────────────────────────────────────────────────────────────────

/// Identity token shown next to a remote cursor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceUser {
    pub name: String,
    pub color: String,
    #[serde(flatten)]
    pub extensions: serde_json::Map<String, serde_json::Value>,
}

impl PresenceUser {
    pub fn new(name: impl Into<String>, color: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            color: color.into(),
            extensions: serde_json::Map::new(),
        }
    }
}

/// One client's presence record.
///
/// `user` and `cursor` are the fields every editor binding understands;
/// anything else a client sends is kept verbatim in `extensions`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PresenceState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<PresenceUser>,
    /// Application-defined cursor range (relative positions). An explicit
    /// `null` ("no selection") is `Some(Value::Null)`; only a missing key is `None`.
    #[serde(
        default,
        deserialize_with = "present_value",
        skip_serializing_if = "Option::is_none"
    )]
    pub cursor: Option<serde_json::Value>,
    #[serde(flatten)]
    pub extensions: serde_json::Map<String, serde_json::Value>,
}

impl PresenceState {
    pub fn with_user(user: PresenceUser) -> Self {
        Self {
            user: Some(user),
            ..Self::default()
        }
    }

    fn to_json(&self) -> String {
        // Only string keys and JSON values: serialization cannot fail.
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

fn present_value<'de, D: Deserializer<'de>>(d: D) -> Result<Option<serde_json::Value>, D::Error> {
    serde_json::Value::deserialize(d).map(Some)
}

// ───────────────────────────────────────────────────────────────────
// Wire codec
// ───────────────────────────────────────────────────────────────────

/// A single entry of an awareness update blob.
#[derive(Debug, Clone, PartialEq)]
pub struct AwarenessEntry {
    pub client_id: ClientId,
    pub clock: u64,
    /// `None` removes the client's state.
    pub state: Option<PresenceState>,
}

/// Decoded awareness update blob.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AwarenessUpdate {
    pub entries: Vec<AwarenessEntry>,
}

impl AwarenessUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, client_id: ClientId, clock: u64, state: Option<PresenceState>) {
        self.entries.push(AwarenessEntry {
            client_id,
            clock,
            state,
        });
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut enc = Encoder::new();
        enc.write_var_u64(self.entries.len() as u64);
        for entry in &self.entries {
            enc.write_var_u64(entry.client_id);
            enc.write_var_u64(entry.clock);
            match &entry.state {
                Some(state) => enc.write_string(&state.to_json()),
                None => enc.write_string("null"),
            }
        }
        enc.into_vec()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let mut dec = Decoder::new(bytes);
        let count = dec.read_var_u64()?;
        // Every entry takes at least 3 bytes; cap the preallocation.
        let mut entries = Vec::with_capacity((count as usize).min(dec.remaining() / 3));
        for _ in 0..count {
            let client_id = dec.read_var_u64()?;
            let clock = dec.read_var_u64()?;
            let json = dec.read_string()?;
            let state: Option<PresenceState> = serde_json::from_str(json)
                .map_err(|e| ProtocolError::InvalidPresence(e.to_string()))?;
            entries.push(AwarenessEntry {
                client_id,
                clock,
                state,
            });
        }
        Ok(Self { entries })
    }
}

// ───────────────────────────────────────────────────────────────────
// Awareness state
// ───────────────────────────────────────────────────────────────────

/// Ids touched by one awareness mutation.
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

    /// Every changed id, in added → updated → removed order.
    pub fn changed(&self) -> Vec<ClientId> {
        self.added
            .iter()
            .chain(&self.updated)
            .chain(&self.removed)
            .copied()
            .collect()
    }
}

#[derive(Debug, Clone, Copy)]
struct ClientMeta {
    clock: u64,
    last_updated: Instant,
}

/// Presence map for one room.
///
/// Meta (clock) outlives a removed state so that a delayed, older update for
/// the same client cannot resurrect it.
#[derive(Debug, Default)]
pub struct Awareness {
    states: HashMap<ClientId, PresenceState>,
    meta: HashMap<ClientId, ClientMeta>,
}

impl Awareness {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of clients with a live state.
    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    pub fn state(&self, client_id: ClientId) -> Option<&PresenceState> {
        self.states.get(&client_id)
    }

    pub fn clock(&self, client_id: ClientId) -> Option<u64> {
        self.meta.get(&client_id).map(|m| m.clock)
    }

    /// Ids with a live state, sorted.
    pub fn client_ids(&self) -> Vec<ClientId> {
        let mut ids: Vec<ClientId> = self.states.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Apply a decoded update.
    ///
    /// An entry wins if its clock is newer, or if it has the same clock and
    /// removes a present state. A newer clock carrying an identical state is
    /// reported as `updated` so peers keep seeing the client as alive.
    pub fn apply_update(&mut self, update: &AwarenessUpdate, now: Instant) -> AwarenessChange {
        let mut change = AwarenessChange::default();

        for entry in &update.entries {
            let id = entry.client_id;
            let current_clock = self.meta.get(&id).map_or(0, |m| m.clock);
            let present = self.states.contains_key(&id);

            let accept = current_clock < entry.clock
                || (current_clock == entry.clock && entry.state.is_none() && present);
            if !accept {
                log::trace!(
                    "Awareness: stale entry for client {id} (clock {} <= {current_clock})",
                    entry.clock
                );
                continue;
            }

            self.meta.insert(
                id,
                ClientMeta {
                    clock: entry.clock,
                    last_updated: now,
                },
            );

            match &entry.state {
                Some(state) => {
                    if self.states.insert(id, state.clone()).is_some() {
                        change.updated.push(id);
                    } else {
                        change.added.push(id);
                    }
                }
                None => {
                    if self.states.remove(&id).is_some() {
                        change.removed.push(id);
                    }
                }
            }
        }

        change
    }

    /// Remove the states of `clients`, keeping their clocks.
    ///
    /// The removal is encoded at the client's current clock, which peers
    /// accept as a same-clock removal; the client's next clock still wins.
    /// Returns the ids that actually had a state.
    pub fn remove_states(&mut self, clients: &[ClientId], now: Instant) -> Vec<ClientId> {
        let mut removed = Vec::new();
        for id in clients {
            if self.states.remove(id).is_some() {
                if let Some(meta) = self.meta.get_mut(id) {
                    meta.last_updated = now;
                }
                removed.push(*id);
            }
        }
        removed
    }

    /// Remove states that were not renewed within `timeout`.
    pub fn remove_outdated(&mut self, now: Instant, timeout: Duration) -> Vec<ClientId> {
        let stale: Vec<ClientId> = self
            .states
            .keys()
            .filter(|id| {
                self.meta
                    .get(*id)
                    .is_some_and(|m| now.saturating_duration_since(m.last_updated) >= timeout)
            })
            .copied()
            .collect();
        self.remove_states(&stale, now)
    }

    /// Encode the current clock and state (or removal) of `clients`.
    ///
    /// Ids this awareness has never seen are skipped.
    pub fn encode_update(&self, clients: &[ClientId]) -> Vec<u8> {
        let mut update = AwarenessUpdate::new();
        for id in clients {
            if let Some(meta) = self.meta.get(id) {
                update.push(*id, meta.clock, self.states.get(id).cloned());
            }
        }
        update.encode()
    }

    /// Encode every live state.
    pub fn encode_full(&self) -> Vec<u8> {
        self.encode_update(&self.client_ids())
    }

    /// Encode every id this awareness has a clock for: live states, and
    /// removals at their last clock for ids that are gone.
    ///
    /// Lets a peer that missed relayed removals drop its stale entries.
    pub fn encode_known(&self) -> Vec<u8> {
        let mut ids: Vec<ClientId> = self.meta.keys().copied().collect();
        ids.sort_unstable();
        self.encode_update(&ids)
    }

    /// Drop every state and clock.
    pub fn clear(&mut self) {
        self.states.clear();
        self.meta.clear();
    }
}
