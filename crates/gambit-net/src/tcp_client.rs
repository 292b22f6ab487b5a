//! TCP transport for connecting to a Gambit game server.
//!
//! [`TcpConnector`] resolves `tcp://host:port` endpoints, applies socket
//! tuning and splits the stream into two background tasks: a writer fed by
//! an unbounded queue of encoded frames and a reader that decodes frames into
//! [`TransportEvent`]s. Whichever task notices the link dying first reports a
//! single [`TransportEvent::Disconnected`]; a caller [`close`] stops both
//! tasks quietly.
//!
//! [`close`]: Connection::close

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{mpsc, watch};

use crate::codec::{CodecConfig, decode_envelope, encode_envelope};
use crate::framing::{FrameConfig, FrameError, FrameReader, write_frame};
use crate::messages::Envelope;
use crate::platform::{SocketConfig, configure_stream};
use crate::transport::{Connection, Connector, InboundSender, TransportError, TransportEvent};

/// Split an endpoint URL into the `host:port` part. Accepts `tcp://` or no scheme.
pub fn parse_endpoint(endpoint: &str) -> Result<&str, TransportError> {
    let address = match endpoint.split_once("://") {
        Some(("tcp", rest)) => rest,
        Some((scheme, _)) => {
            return Err(TransportError::Connect {
                endpoint: endpoint.to_string(),
                reason: format!("unsupported scheme {scheme:?}"),
            });
        }
        None => endpoint,
    };
    let address = address.trim_end_matches('/');
    if address.is_empty() {
        return Err(TransportError::Connect {
            endpoint: endpoint.to_string(),
            reason: "missing host".to_string(),
        });
    }
    Ok(address)
}

/// Opens framed TCP connections.
#[derive(Debug, Clone, Default)]
pub struct TcpConnector {
    frame: FrameConfig,
    codec: CodecConfig,
    socket: SocketConfig,
}

impl TcpConnector {
    pub fn new(frame: FrameConfig, codec: CodecConfig, socket: SocketConfig) -> Self {
        Self {
            frame,
            codec,
            socket,
        }
    }
}

impl Connector for TcpConnector {
    type Connection = TcpConnection;

    fn open(
        &self,
        endpoint: &str,
        inbound: InboundSender,
    ) -> impl std::future::Future<Output = Result<TcpConnection, TransportError>> + Send {
        let address = parse_endpoint(endpoint).map(str::to_owned);
        let endpoint = endpoint.to_owned();
        let frame = self.frame.clone();
        let codec = self.codec.clone();
        let socket = self.socket.clone();

        async move {
            let address = address?;
            let stream =
                TcpStream::connect(&address)
                    .await
                    .map_err(|e| TransportError::Connect {
                        endpoint: endpoint.clone(),
                        reason: e.to_string(),
                    })?;
            configure_stream(&stream, &socket)?;
            tracing::debug!("TCP link to {endpoint} established");
            TcpConnection::spawn(stream, frame, codec, inbound)
        }
    }
}

/// State shared between a connection handle and its tasks.
struct Link {
    open: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
}

impl Link {
    /// Mark the link dead. Only the first caller reports it.
    fn lost(&self, inbound: &InboundSender, reason: String) {
        if self.open.swap(false, Ordering::SeqCst) {
            tracing::info!("Connection lost: {reason}");
            let _ = inbound.send(TransportEvent::Disconnected { reason });
            let _ = self.shutdown_tx.send(true);
        }
    }
}

/// Handle to one open TCP connection.
pub struct TcpConnection {
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    link: Arc<Link>,
    codec: CodecConfig,
    frame: FrameConfig,
    peer: SocketAddr,
}

impl TcpConnection {
    fn spawn(
        stream: TcpStream,
        frame: FrameConfig,
        codec: CodecConfig,
        inbound: InboundSender,
    ) -> Result<Self, TransportError> {
        let peer = stream.peer_addr()?;
        let (reader, writer) = stream.into_split();
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let link = Arc::new(Link {
            open: AtomicBool::new(true),
            shutdown_tx,
        });

        tokio::spawn(read_loop(
            FrameReader::new(reader, frame.clone()),
            Arc::clone(&link),
            inbound.clone(),
            shutdown_rx.clone(),
        ));
        tokio::spawn(write_loop(
            writer,
            frame.clone(),
            outbound_rx,
            Arc::clone(&link),
            inbound,
            shutdown_rx,
        ));

        Ok(Self {
            outbound,
            link,
            codec,
            frame,
            peer,
        })
    }

    /// Remote address of the server.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }
}

impl Connection for TcpConnection {
    fn send(&self, envelope: Envelope) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::NotConnected);
        }
        let bytes = encode_envelope(&envelope, &self.codec)?;
        let max = self.frame.max_frame_bytes;
        if bytes.len() > max as usize {
            return Err(FrameError::TooLarge {
                size: bytes.len(),
                max,
            }
            .into());
        }
        self.outbound
            .send(bytes)
            .map_err(|_| TransportError::NotConnected)
    }

    fn close(&self) {
        if self.link.open.swap(false, Ordering::SeqCst) {
            tracing::debug!("Closing connection to {}", self.peer);
            let _ = self.link.shutdown_tx.send(true);
        }
    }

    fn is_open(&self) -> bool {
        self.link.open.load(Ordering::SeqCst)
    }
}

impl Drop for TcpConnection {
    fn drop(&mut self) {
        self.close();
    }
}

/// Decode incoming frames until the peer closes or shutdown is signalled.
async fn read_loop(
    mut frames: FrameReader<OwnedReadHalf>,
    link: Arc<Link>,
    inbound: InboundSender,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            result = frames.next_frame() => match result {
                Ok(Some(bytes)) => match decode_envelope(&bytes) {
                    Ok(envelope) => {
                        if inbound.send(TransportEvent::Message(envelope)).is_err() {
                            break;
                        }
                    }
                    Err(e) => tracing::warn!("Dropping undecodable frame: {e}"),
                },
                Ok(None) => {
                    link.lost(&inbound, "server closed the connection".to_string());
                    break;
                }
                Err(e) => {
                    link.lost(&inbound, e.to_string());
                    break;
                }
            },
            _ = shutdown_rx.changed() => break,
        }
    }
}

/// Write queued frames until the queue closes or shutdown is signalled.
async fn write_loop(
    mut writer: OwnedWriteHalf,
    frame: FrameConfig,
    mut outbound_rx: mpsc::UnboundedReceiver<Vec<u8>>,
    link: Arc<Link>,
    inbound: InboundSender,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            next = outbound_rx.recv() => match next {
                Some(bytes) => {
                    if let Err(e) = write_frame(&mut writer, &bytes, &frame).await {
                        link.lost(&inbound, e.to_string());
                        break;
                    }
                }
                None => break,
            },
            _ = shutdown_rx.changed() => break,
        }
    }
}
