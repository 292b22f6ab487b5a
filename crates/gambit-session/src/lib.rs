//! Client session management: connection lifecycle with backoff, the
//! join/leave protocol, snapshot and delta synchronization, and the event
//! bus that reports all of it.
//!
//! [`SessionManager`] is the entry point; the components it wires together
//! are public for callers that need finer control.

mod error;
mod event_bus;
mod lifecycle;
mod manager;
mod membership;
mod state;
mod sync;

#[cfg(test)]
mod testing;

pub use error::{Operation, SessionError, SessionResult};
pub use event_bus::{EventBus, EventKind, HandlerResult, SessionEvent, Subscription, UnknownEventKind};
pub use lifecycle::{ConnectionController, ConnectionSettings, ConnectionState, ConnectionStateWatch};
pub use manager::{SessionManager, SessionSettings};
pub use membership::{
    JOIN_ACK_ALIASES, Membership, MembershipResult, MembershipSettings, PLAYER_JOINED_ALIASES,
    PLAYER_LEFT_ALIASES,
};
pub use state::{
    GameSnapshot, MembershipState, PlayerInfo, ReconnectState, SessionIdentity, SessionState,
};
pub use sync::{StateSync, SyncSettings};
