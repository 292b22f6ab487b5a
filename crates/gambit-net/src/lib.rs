//! Client networking: wire messages, codec, framing, request correlation,
//! message routing, reconnection backoff and the TCP transport.

pub mod backoff;
pub mod codec;
pub mod correlation;
pub mod framing;
pub mod messages;
pub mod platform;
pub mod routing;
pub mod tcp_client;
pub mod transport;

pub use backoff::{BackoffPolicy, MAX_JITTER_FRACTION};
pub use codec::{CodecConfig, CodecError, PROTOCOL_VERSION, decode_envelope, encode_envelope};
pub use correlation::{Abandoned, PendingReply, PendingRequests};
pub use framing::{FrameConfig, FrameError, FrameReader, write_frame};
pub use messages::{
    DeltaRequest, Envelope, ErrorReply, Fields, JoinAck, JoinGame, LeaveAck, LeaveGame, Message,
    NamedEvent, PlayerNotice, Register, Registered, SnapshotRequest, StatePayload, Value,
};
pub use platform::{SocketConfig, configure_stream};
pub use routing::{MessageHandler, MessageRouter, MessageTag, RouteHandle};
pub use tcp_client::{TcpConnection, TcpConnector, parse_endpoint};
pub use transport::{
    Connection, Connector, InboundReceiver, InboundSender, TransportError, TransportEvent,
    inbound_channel,
};
