//! Message routing: dispatch unsolicited messages to type-specific handlers.
//!
//! Replies are consumed by [`crate::correlation`]; everything else the server
//! pushes (roster notices, named dialect events) goes through a
//! [`MessageRouter`], keyed by [`MessageTag`]. This is the transport-level
//! `on_message` registry; the session layer bridges it into its event bus.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::messages::Message;

// ---------------------------------------------------------------------------
// MessageTag
// ---------------------------------------------------------------------------

/// Unique tag identifying a message type, used as the key for routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageTag {
    Register,
    Registered,
    JoinGame,
    JoinAck,
    LeaveGame,
    LeaveAck,
    SnapshotRequest,
    Snapshot,
    DeltaRequest,
    Delta,
    PlayerJoined,
    PlayerLeft,
    Named,
    Error,
}

impl MessageTag {
    /// Conventional event name of this message on the wire.
    pub fn wire_name(self) -> &'static str {
        match self {
            MessageTag::Register => "register",
            MessageTag::Registered => "registered",
            MessageTag::JoinGame => "game:join",
            MessageTag::JoinAck => "game:join:ack",
            MessageTag::LeaveGame => "game:leave",
            MessageTag::LeaveAck => "game:leave:ack",
            MessageTag::SnapshotRequest => "state:snapshot",
            MessageTag::Snapshot => "state:snapshot:data",
            MessageTag::DeltaRequest => "state:delta",
            MessageTag::Delta => "state:delta:data",
            MessageTag::PlayerJoined => "player:joined",
            MessageTag::PlayerLeft => "player:left",
            MessageTag::Named => "named",
            MessageTag::Error => "error",
        }
    }
}

impl Message {
    /// Extract the routing tag from a message without consuming it.
    pub fn tag(&self) -> MessageTag {
        match self {
            Message::Register(_) => MessageTag::Register,
            Message::Registered(_) => MessageTag::Registered,
            Message::JoinGame(_) => MessageTag::JoinGame,
            Message::JoinAck(_) => MessageTag::JoinAck,
            Message::LeaveGame(_) => MessageTag::LeaveGame,
            Message::LeaveAck(_) => MessageTag::LeaveAck,
            Message::SnapshotRequest(_) => MessageTag::SnapshotRequest,
            Message::Snapshot(_) => MessageTag::Snapshot,
            Message::DeltaRequest(_) => MessageTag::DeltaRequest,
            Message::Delta(_) => MessageTag::Delta,
            Message::PlayerJoined(_) => MessageTag::PlayerJoined,
            Message::PlayerLeft(_) => MessageTag::PlayerLeft,
            Message::Named(_) => MessageTag::Named,
            Message::Error(_) => MessageTag::Error,
        }
    }
}

// ---------------------------------------------------------------------------
// Handler
// ---------------------------------------------------------------------------

/// Trait for message handlers.
pub trait MessageHandler: Send + Sync {
    /// Process a single incoming message.
    fn handle(&self, msg: &Message);
}

/// Blanket implementation for closures.
impl<F> MessageHandler for F
where
    F: Fn(&Message) + Send + Sync,
{
    fn handle(&self, msg: &Message) {
        self(msg);
    }
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Identifies one registration made with [`MessageRouter::register`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RouteHandle {
    tag: MessageTag,
    id: u64,
}

type Routes = HashMap<MessageTag, Vec<(u64, Arc<dyn MessageHandler>)>>;

#[derive(Default)]
struct RouteTable {
    next_id: u64,
    routes: Routes,
}

/// Routes incoming messages to registered handlers by [`MessageTag`].
///
/// Any number of handlers may share a tag; they run in registration order
/// and are removed individually through their [`RouteHandle`].
/// Registration may happen while messages are being routed.
#[derive(Default)]
pub struct MessageRouter {
    table: RwLock<RouteTable>,
}

impl MessageRouter {
    /// Create an empty router.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a handler for a specific message tag.
    pub fn register<H: MessageHandler + 'static>(
        &self,
        tag: MessageTag,
        handler: H,
    ) -> RouteHandle {
        let mut table = self.table.write().unwrap_or_else(|e| e.into_inner());
        table.next_id += 1;
        let id = table.next_id;
        table
            .routes
            .entry(tag)
            .or_default()
            .push((id, Arc::new(handler)));
        RouteHandle { tag, id }
    }

    /// Remove one handler. Returns whether it was still registered.
    pub fn unregister(&self, handle: RouteHandle) -> bool {
        let mut table = self.table.write().unwrap_or_else(|e| e.into_inner());
        let Some(handlers) = table.routes.get_mut(&handle.tag) else {
            return false;
        };
        let before = handlers.len();
        handlers.retain(|(id, _)| *id != handle.id);
        let removed = handlers.len() != before;
        if handlers.is_empty() {
            table.routes.remove(&handle.tag);
        }
        removed
    }

    /// Route an incoming message to every handler registered for its tag.
    ///
    /// Returns `true` if at least one handler ran, `false` if the message
    /// was dropped.
    pub fn route(&self, msg: &Message) -> bool {
        let tag = msg.tag();
        let handlers: Vec<Arc<dyn MessageHandler>> = self
            .table
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .routes
            .get(&tag)
            .map(|handlers| handlers.iter().map(|(_, h)| Arc::clone(h)).collect())
            .unwrap_or_default();
        if handlers.is_empty() {
            tracing::debug!("No handler registered for {}, dropping message", tag.wire_name());
            return false;
        }
        for handler in handlers {
            handler.handle(msg);
        }
        true
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
