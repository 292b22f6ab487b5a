//! Transport abstraction: one physical channel to the game server.
//!
//! A [`Connector`] opens a [`Connection`] for an endpoint. An open either
//! succeeds or fails exactly once; afterwards the connection reports inbound
//! traffic and at most one [`TransportEvent::Disconnected`] through the
//! channel handed to [`Connector::open`]. Sending fails fast once the link is
//! gone instead of queueing.

use std::future::Future;

use tokio::sync::mpsc;

use crate::codec::CodecError;
use crate::framing::FrameError;
use crate::messages::Envelope;

/// Something the transport observed on an open connection.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// A decoded inbound envelope.
    Message(Envelope),
    /// The link went down without the caller closing it.
    Disconnected { reason: String },
}

/// Channel the transport reports [`TransportEvent`]s through.
pub type InboundSender = mpsc::UnboundedSender<TransportEvent>;

/// Receiving half of [`InboundSender`].
pub type InboundReceiver = mpsc::UnboundedReceiver<TransportEvent>;

/// Errors raised by a transport.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The endpoint could not be reached or parsed.
    #[error("cannot connect to {endpoint}: {reason}")]
    Connect { endpoint: String, reason: String },

    /// The connection is closed; nothing was sent.
    #[error("not connected")]
    NotConnected,

    /// An envelope could not be encoded or decoded.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// The framing layer rejected a frame.
    #[error(transparent)]
    Frame(#[from] FrameError),

    /// Socket-level I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Opens connections to an endpoint.
pub trait Connector: Send + Sync + 'static {
    type Connection: Connection;

    /// Open a connection. Inbound traffic and the disconnect signal are
    /// delivered through `inbound` until the connection is closed.
    fn open(
        &self,
        endpoint: &str,
        inbound: InboundSender,
    ) -> impl Future<Output = Result<Self::Connection, TransportError>> + Send;
}

/// One open link.
pub trait Connection: Send + Sync + 'static {
    /// Queue an envelope for sending. Fails with
    /// [`TransportError::NotConnected`] once the link is down.
    fn send(&self, envelope: Envelope) -> Result<(), TransportError>;

    /// Close the link. Idempotent; suppresses the disconnect event.
    fn close(&self);

    /// Whether the link is still usable.
    fn is_open(&self) -> bool;
}

/// Create the inbound channel pair for one connection.
pub fn inbound_channel() -> (InboundSender, InboundReceiver) {
    mpsc::unbounded_channel()
}
