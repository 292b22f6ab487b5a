//! Synchronous publish/subscribe registry keyed by event type.
//!
//! Handlers run on the publisher's task, in registration order. A handler
//! that returns an error or panics is logged and skipped; the publisher never
//! sees it. Unsubscribing is allowed at any time, including from inside a
//! handler: a removed handle is not invoked for the rest of the current pass.

use std::collections::HashMap;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use crate::error::SessionError;
use crate::state::{GameSnapshot, PlayerInfo};

/// Event type names produced on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Connect,
    Disconnect,
    Error,
    Connecting,
    StateSnapshot,
    StateUpdate,
    PlayerJoined,
    PlayerLeft,
}

impl EventKind {
    pub const ALL: [EventKind; 8] = [
        EventKind::Connect,
        EventKind::Disconnect,
        EventKind::Error,
        EventKind::Connecting,
        EventKind::StateSnapshot,
        EventKind::StateUpdate,
        EventKind::PlayerJoined,
        EventKind::PlayerLeft,
    ];

    pub fn name(self) -> &'static str {
        match self {
            EventKind::Connect => "connect",
            EventKind::Disconnect => "disconnect",
            EventKind::Error => "error",
            EventKind::Connecting => "connecting",
            EventKind::StateSnapshot => "state_snapshot",
            EventKind::StateUpdate => "state_update",
            EventKind::PlayerJoined => "player_joined",
            EventKind::PlayerLeft => "player_left",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Returned when parsing an unknown event name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown event type {0:?}")]
pub struct UnknownEventKind(pub String);

impl FromStr for EventKind {
    type Err = UnknownEventKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventKind::ALL
            .into_iter()
            .find(|kind| kind.name() == s)
            .ok_or_else(|| UnknownEventKind(s.to_string()))
    }
}

/// Payload of a published event.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// A connection was established; `epoch` counts successful connections.
    Connect { epoch: u64 },
    /// The connection closed. `reconnecting` is false for caller-initiated closes.
    Disconnect { reason: String, reconnecting: bool },
    /// A connection attempt failed. `attempt` is the consecutive failure count.
    Error { error: SessionError, attempt: u32 },
    /// A connection attempt started.
    Connecting { attempt: u32 },
    StateSnapshot(Arc<GameSnapshot>),
    StateUpdate(Arc<GameSnapshot>),
    PlayerJoined(PlayerInfo),
    PlayerLeft(PlayerInfo),
}

impl SessionEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            SessionEvent::Connect { .. } => EventKind::Connect,
            SessionEvent::Disconnect { .. } => EventKind::Disconnect,
            SessionEvent::Error { .. } => EventKind::Error,
            SessionEvent::Connecting { .. } => EventKind::Connecting,
            SessionEvent::StateSnapshot(_) => EventKind::StateSnapshot,
            SessionEvent::StateUpdate(_) => EventKind::StateUpdate,
            SessionEvent::PlayerJoined(_) => EventKind::PlayerJoined,
            SessionEvent::PlayerLeft(_) => EventKind::PlayerLeft,
        }
    }
}

/// Outcome of one handler invocation.
pub type HandlerResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

type Handler = Arc<dyn Fn(&SessionEvent) -> HandlerResult + Send + Sync>;

/// Handle identifying one subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Subscription {
    kind: EventKind,
    id: u64,
}

impl Subscription {
    pub fn kind(&self) -> EventKind {
        self.kind
    }
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    handlers: HashMap<EventKind, Vec<(u64, Handler)>>,
}

/// Cloneable handle to a shared handler registry.
#[derive(Clone, Default)]
pub struct EventBus {
    registry: Arc<Mutex<Registry>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `handler` to the list for `kind`.
    pub fn subscribe<F>(&self, kind: EventKind, handler: F) -> Subscription
    where
        F: Fn(&SessionEvent) -> HandlerResult + Send + Sync + 'static,
    {
        let mut registry = self.lock();
        registry.next_id += 1;
        let id = registry.next_id;
        registry
            .handlers
            .entry(kind)
            .or_default()
            .push((id, Arc::new(handler)));
        Subscription { kind, id }
    }

    /// Subscribe by event name, e.g. `"state_update"`.
    pub fn subscribe_named<F>(&self, name: &str, handler: F) -> Result<Subscription, UnknownEventKind>
    where
        F: Fn(&SessionEvent) -> HandlerResult + Send + Sync + 'static,
    {
        Ok(self.subscribe(name.parse()?, handler))
    }

    /// Remove a subscription. Returns `false` if it was already gone.
    pub fn unsubscribe(&self, subscription: &Subscription) -> bool {
        let mut registry = self.lock();
        let Some(list) = registry.handlers.get_mut(&subscription.kind) else {
            return false;
        };
        let before = list.len();
        list.retain(|(id, _)| *id != subscription.id);
        before != list.len()
    }

    /// Deliver `event` to every handler registered for its kind.
    pub fn publish(&self, event: &SessionEvent) {
        let kind = event.kind();
        let pass: Vec<(u64, Handler)> = self
            .lock()
            .handlers
            .get(&kind)
            .cloned()
            .unwrap_or_default();

        for (id, handler) in pass {
            if !self.is_registered(kind, id) {
                continue;
            }
            match catch_unwind(AssertUnwindSafe(|| handler(event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!("{kind} handler failed: {e}"),
                Err(_) => tracing::error!("{kind} handler panicked"),
            }
        }
    }

    /// Number of handlers registered for `kind`.
    pub fn handler_count(&self, kind: EventKind) -> usize {
        self.lock().handlers.get(&kind).map_or(0, Vec::len)
    }

    fn is_registered(&self, kind: EventKind, id: u64) -> bool {
        self.lock()
            .handlers
            .get(&kind)
            .is_some_and(|list| list.iter().any(|(h, _)| *h == id))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let registry = self.lock();
        let mut map = f.debug_map();
        for (kind, list) in &registry.handlers {
            map.entry(&kind.name(), &list.len());
        }
        map.finish()
    }
}
