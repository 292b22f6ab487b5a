//! Session state: identity, membership and the latest synchronized snapshot.
//!
//! Readers get cheap clones or `Arc`s; every mutator is crate-private so only
//! the lifecycle, membership and synchronization components write.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use gambit_net::{Fields, PlayerNotice, StatePayload, Value};
use tokio::sync::watch;
use tokio::time::Instant;

/// Who the local player is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionIdentity {
    /// Server-assigned on the first successful registration, then stable.
    pub player_id: Option<String>,
    pub player_name: String,
}

/// Which game the session belongs to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MembershipState {
    pub game_id: Option<String>,
    pub joined: bool,
    /// Connection epoch the join was acknowledged on.
    pub epoch: u64,
}

impl MembershipState {
    /// The joined game, if any.
    pub fn joined_game(&self) -> Option<&str> {
        if self.joined {
            self.game_id.as_deref()
        } else {
            None
        }
    }
}

/// Retry bookkeeping of the connection controller.
///
/// A successful connection resets `attempt_count` and `next_delay` but keeps
/// `last_attempt_at`, which the caller-attempt throttle measures from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconnectState {
    /// Consecutive failed attempts since the last successful connection.
    pub attempt_count: u32,
    /// When the latest attempt started. Survives successful connections.
    pub last_attempt_at: Option<Instant>,
    /// Delay of the scheduled retry, if one is pending.
    pub next_delay: Option<Duration>,
}

/// Latest synchronized game state.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GameSnapshot {
    /// Server timestamp in milliseconds.
    pub timestamp: u64,
    pub payload: Fields,
}

impl GameSnapshot {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.payload.get(key)
    }
}

impl From<StatePayload> for GameSnapshot {
    fn from(p: StatePayload) -> Self {
        Self {
            timestamp: p.timestamp,
            payload: p.payload,
        }
    }
}

/// A roster change reported by the server.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlayerInfo {
    pub game_id: Option<String>,
    pub player_id: Option<String>,
    pub player_name: Option<String>,
}

impl From<&PlayerNotice> for PlayerInfo {
    fn from(n: &PlayerNotice) -> Self {
        Self {
            game_id: n.game_id.clone(),
            player_id: n.player_id.clone(),
            player_name: n.player_name.clone(),
        }
    }
}

impl PlayerInfo {
    /// Build from a named-event field map (`gameId`, `playerId`, `playerName`).
    pub fn from_fields(fields: &Fields) -> Self {
        let text = |camel: &str, snake: &str| {
            fields
                .get(camel)
                .or_else(|| fields.get(snake))
                .and_then(Value::as_str)
                .map(str::to_owned)
        };
        Self {
            game_id: text("gameId", "game_id"),
            player_id: text("playerId", "player_id"),
            player_name: text("playerName", "player_name"),
        }
    }
}

#[derive(Debug)]
struct IdentityRecord {
    identity: SessionIdentity,
    registered_epoch: Option<u64>,
}

/// Shared session state.
pub struct SessionState {
    identity: RwLock<IdentityRecord>,
    membership: watch::Sender<MembershipState>,
    snapshot: RwLock<Option<Arc<GameSnapshot>>>,
}

impl SessionState {
    pub fn new(player_name: impl Into<String>) -> Self {
        let (membership, _) = watch::channel(MembershipState::default());
        Self {
            identity: RwLock::new(IdentityRecord {
                identity: SessionIdentity {
                    player_id: None,
                    player_name: player_name.into(),
                },
                registered_epoch: None,
            }),
            membership,
            snapshot: RwLock::new(None),
        }
    }

    /// Copy of the current identity.
    pub fn identity(&self) -> SessionIdentity {
        self.read_identity().identity.clone()
    }

    /// Copy of the current membership.
    pub fn membership(&self) -> MembershipState {
        self.membership.borrow().clone()
    }

    /// Watch membership transitions.
    pub fn subscribe_membership(&self) -> watch::Receiver<MembershipState> {
        self.membership.subscribe()
    }

    /// Latest snapshot, if one has been fetched.
    pub fn snapshot(&self) -> Option<Arc<GameSnapshot>> {
        self.snapshot
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub(crate) fn set_player_name(&self, name: String) {
        self.write_identity().identity.player_name = name;
    }

    /// Connection epoch of the latest registration.
    pub(crate) fn registered_epoch(&self) -> Option<u64> {
        self.read_identity().registered_epoch
    }

    /// Record a registration on `epoch`. The first assigned id sticks.
    pub(crate) fn record_registration(&self, epoch: u64, player_id: String) {
        let mut record = self.write_identity();
        record.registered_epoch = Some(epoch);
        if record.identity.player_id.is_none() {
            record.identity.player_id = Some(player_id);
        }
    }

    pub(crate) fn set_membership(&self, game_id: String, epoch: u64) {
        let next = MembershipState {
            game_id: Some(game_id),
            joined: true,
            epoch,
        };
        self.membership.send_if_modified(|current| {
            let changed = *current != next;
            *current = next;
            changed
        });
    }

    pub(crate) fn clear_membership(&self) {
        self.membership.send_if_modified(|current| {
            let changed = current.joined || current.game_id.is_some();
            *current = MembershipState::default();
            changed
        });
    }

    /// Replace the snapshot unless `incoming` is older than the current one.
    ///
    /// Returns the stored snapshot when accepted.
    pub(crate) fn replace_snapshot(&self, incoming: GameSnapshot) -> Option<Arc<GameSnapshot>> {
        let mut slot = self.snapshot.write().unwrap_or_else(|e| e.into_inner());
        if let Some(current) = slot.as_ref()
            && incoming.timestamp < current.timestamp
        {
            return None;
        }
        let stored = Arc::new(incoming);
        *slot = Some(Arc::clone(&stored));
        Some(stored)
    }

    /// Merge a delta field-by-field. Only strictly newer deltas apply, and
    /// only on top of an existing snapshot.
    pub(crate) fn merge_delta(&self, delta: GameSnapshot) -> Option<Arc<GameSnapshot>> {
        let mut slot = self.snapshot.write().unwrap_or_else(|e| e.into_inner());
        let current = slot.as_ref()?;
        if delta.timestamp <= current.timestamp {
            return None;
        }
        let mut payload = current.payload.clone();
        payload.extend(delta.payload);
        let merged = Arc::new(GameSnapshot {
            timestamp: delta.timestamp,
            payload,
        });
        *slot = Some(Arc::clone(&merged));
        Some(merged)
    }

    pub(crate) fn clear_snapshot(&self) {
        *self.snapshot.write().unwrap_or_else(|e| e.into_inner()) = None;
    }

    fn read_identity(&self) -> std::sync::RwLockReadGuard<'_, IdentityRecord> {
        self.identity.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_identity(&self) -> std::sync::RwLockWriteGuard<'_, IdentityRecord> {
        self.identity.write().unwrap_or_else(|e| e.into_inner())
    }
}
