//! Wire message catalogue.
//!
//! Every frame carries one [`Envelope`]: an optional request id (set on
//! requests that expect an acknowledgement), an optional `reply_to` (set on
//! acknowledgements, echoing the request id) and the [`Message`] itself.
//! Payload maps use [`Value`] so arbitrary game state survives the
//! non-self-describing postcard encoding.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Field map carried by snapshots, deltas and named events.
pub type Fields = BTreeMap<String, Value>;

/// Dynamically typed payload value.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    List(Vec<Value>),
    Map(Fields),
}

impl Value {
    /// Borrow the inner string of a [`Value::Text`].
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Return the inner integer of a [`Value::Int`].
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Return the inner flag of a [`Value::Bool`].
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(v) => Some(*v),
            _ => None,
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// One framed unit on the wire.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Envelope {
    /// Set by the client on requests that expect a correlated reply.
    pub request_id: Option<u64>,
    /// Set by the server on replies; echoes the request's `request_id`.
    pub reply_to: Option<u64>,
    /// The message body.
    pub message: Message,
}

impl Envelope {
    /// Fire-and-forget envelope with no correlation ids.
    pub fn notice(message: Message) -> Self {
        Self {
            request_id: None,
            reply_to: None,
            message,
        }
    }

    /// Request envelope expecting a reply correlated by `request_id`.
    pub fn request(request_id: u64, message: Message) -> Self {
        Self {
            request_id: Some(request_id),
            reply_to: None,
            message,
        }
    }

    /// Reply envelope answering `request_id`.
    pub fn reply(request_id: u64, message: Message) -> Self {
        Self {
            request_id: None,
            reply_to: Some(request_id),
            message,
        }
    }
}

// ---------------------------------------------------------------------------
// Top-level enum
// ---------------------------------------------------------------------------

/// Top-level network message. The enum discriminant is the type tag.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum Message {
    // --- Identity ---
    /// `register`: client announces itself.
    Register(Register),
    /// Reply to `register` with the server-assigned player id.
    Registered(Registered),

    // --- Membership ---
    /// `game:join`.
    JoinGame(JoinGame),
    /// Reply to `game:join`.
    JoinAck(JoinAck),
    /// `game:leave`.
    LeaveGame(LeaveGame),
    /// Reply to `game:leave`.
    LeaveAck(LeaveAck),

    // --- State ---
    /// `state:snapshot`.
    SnapshotRequest(SnapshotRequest),
    /// Full state reply.
    Snapshot(StatePayload),
    /// `state:delta`.
    DeltaRequest(DeltaRequest),
    /// Partial state reply.
    Delta(StatePayload),

    // --- Roster notices (server push) ---
    /// Another player entered the game.
    PlayerJoined(PlayerNotice),
    /// Another player left the game.
    PlayerLeft(PlayerNotice),

    // --- Dialects ---
    /// Event carried by name, used by servers that speak older dialects.
    Named(NamedEvent),
    /// Generic failure reply to any request.
    Error(ErrorReply),
}

// ---------------------------------------------------------------------------
// Payload structs
// ---------------------------------------------------------------------------

/// Client registration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Register {
    /// Display name.
    pub player_name: String,
    /// Previously assigned id, if this process already registered once.
    pub player_id: Option<String>,
}

/// Registration reply.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Registered {
    /// Server-assigned player identifier.
    pub player_id: String,
}

/// Join request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JoinGame {
    /// Requested game. `None` asks the server for its default game.
    pub game_id: Option<String>,
    pub player_name: String,
    pub player_id: Option<String>,
}

/// Join reply.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JoinAck {
    pub success: bool,
    /// Server-confirmed game id; may differ from the requested one.
    pub game_id: Option<String>,
    pub player_id: Option<String>,
    /// Reason when `success` is false.
    pub error: Option<String>,
}

/// Leave request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LeaveGame {
    pub game_id: String,
    pub player_id: Option<String>,
}

/// Leave reply.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LeaveAck {
    pub success: bool,
}

/// Full state request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SnapshotRequest {
    pub game_id: String,
}

/// Incremental state request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeltaRequest {
    pub game_id: String,
    /// Timestamp (ms) of the newest state the client holds.
    pub since: u64,
}

/// Timestamped state, full or partial depending on the message carrying it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatePayload {
    /// Server timestamp in milliseconds.
    pub timestamp: u64,
    pub payload: Fields,
}

/// Roster change pushed by the server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlayerNotice {
    pub game_id: Option<String>,
    pub player_id: Option<String>,
    pub player_name: Option<String>,
}

/// Event addressed by name rather than by variant.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NamedEvent {
    pub name: String,
    pub fields: Fields,
}

/// Failure reply.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorReply {
    pub message: String,
}
