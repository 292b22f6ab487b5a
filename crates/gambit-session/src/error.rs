//! Session-level error taxonomy.

use std::fmt;
use std::time::Duration;

use gambit_net::TransportError;

/// Network operation a deadline applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Connect,
    Register,
    Join,
    Leave,
    Snapshot,
    Delta,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Operation::Connect => "connect",
            Operation::Register => "register",
            Operation::Join => "join",
            Operation::Leave => "leave",
            Operation::Snapshot => "snapshot",
            Operation::Delta => "delta",
        })
    }
}

/// Errors surfaced by the session manager.
///
/// `Clone` so the outcome of one connection attempt can be handed to every
/// caller coalesced onto it.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SessionError {
    /// The transport could not be opened.
    #[error("connection failed: {0}")]
    Connection(String),

    /// The operation's deadline elapsed. Its reply waiter is gone.
    #[error("{operation} timed out after {after:?}")]
    Timeout { operation: Operation, after: Duration },

    /// A caller-initiated connection attempt came too soon after the last one.
    #[error("connection attempt throttled, retry in {retry_after:?}")]
    Throttled { retry_after: Duration },

    /// A connection attempt is already running.
    #[error("a connection attempt is already in progress")]
    AlreadyInProgress,

    /// The server's reply was malformed or of the wrong type.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The server refused the request.
    #[error("rejected by server: {0}")]
    Rejected(String),

    /// No connection is open.
    #[error("not connected")]
    NotConnected,

    /// The connection dropped while the operation was waiting.
    #[error("connection closed before the operation completed")]
    Disconnected,

    /// The session has been shut down.
    #[error("session is shut down")]
    Shutdown,

    /// The operation is not allowed right now.
    #[error("invalid state: {0}")]
    InvalidState(String),
}

impl SessionError {
    /// Whether this is a coalesced duplicate rather than a real failure.
    pub fn is_already_in_progress(&self) -> bool {
        matches!(self, SessionError::AlreadyInProgress)
    }
}

impl From<TransportError> for SessionError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::NotConnected => SessionError::NotConnected,
            TransportError::Codec(e) => SessionError::Protocol(e.to_string()),
            TransportError::Frame(e) => SessionError::Protocol(e.to_string()),
            other => SessionError::Connection(other.to_string()),
        }
    }
}

pub type SessionResult<T> = Result<T, SessionError>;
