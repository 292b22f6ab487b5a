//! Scripted in-memory server used by the session tests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use gambit_net::{
    Connection, Connector, Envelope, Fields, InboundSender, JoinAck, LeaveAck, Message,
    MessageTag, Registered, StatePayload, TransportError, TransportEvent, Value,
};

/// What the scripted server does with a request.
pub(crate) enum Reply {
    Answer(Message),
    Silent,
}

type Responder = Box<dyn Fn(&Message) -> Reply + Send>;

struct ServerState {
    opens: usize,
    fail_opens: usize,
    open_delay: Duration,
    requests: Vec<Message>,
    last_request_id: Option<u64>,
    responder: Responder,
    links: Vec<Arc<MockLink>>,
}

/// Shared handle to the scripted server.
#[derive(Clone)]
pub(crate) struct MockServer {
    state: Arc<Mutex<ServerState>>,
}

struct MockLink {
    open: AtomicBool,
    inbound: InboundSender,
}

impl MockLink {
    fn deliver(&self, envelope: Envelope) {
        if self.open.load(Ordering::SeqCst) {
            let _ = self.inbound.send(TransportEvent::Message(envelope));
        }
    }
}

/// A well-behaved game server: registers as `p-1`, joins `lobby` when no
/// game is named, acknowledges leaves and serves a snapshot at t=100 plus
/// deltas advancing the timestamp by one.
pub(crate) fn default_reply(message: &Message) -> Reply {
    match message {
        Message::Register(_) => Reply::Answer(Message::Registered(Registered {
            player_id: "p-1".into(),
        })),
        Message::JoinGame(join) => Reply::Answer(Message::JoinAck(JoinAck {
            success: true,
            game_id: Some(join.game_id.clone().unwrap_or_else(|| "lobby".into())),
            player_id: join.player_id.clone(),
            error: None,
        })),
        Message::LeaveGame(_) => Reply::Answer(Message::LeaveAck(LeaveAck { success: true })),
        Message::SnapshotRequest(_) => Reply::Answer(Message::Snapshot(StatePayload {
            timestamp: 100,
            payload: fields(&[("turn", Value::Int(1)), ("board", Value::from("start"))]),
        })),
        Message::DeltaRequest(delta) => Reply::Answer(Message::Delta(StatePayload {
            timestamp: delta.since + 1,
            payload: fields(&[("turn", Value::Int(delta.since as i64 + 1))]),
        })),
        _ => Reply::Silent,
    }
}

pub(crate) fn fields(pairs: &[(&str, Value)]) -> Fields {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

impl MockServer {
    pub(crate) fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(ServerState {
                opens: 0,
                fail_opens: 0,
                open_delay: Duration::ZERO,
                requests: Vec::new(),
                last_request_id: None,
                responder: Box::new(default_reply),
                links: Vec::new(),
            })),
        }
    }

    pub(crate) fn connector(&self) -> MockConnector {
        MockConnector {
            server: self.clone(),
        }
    }

    /// Fail the next `n` opens.
    pub(crate) fn fail_next_opens(&self, n: usize) {
        self.lock().fail_opens = n;
    }

    /// Make every open take `delay` before completing.
    pub(crate) fn set_open_delay(&self, delay: Duration) {
        self.lock().open_delay = delay;
    }

    pub(crate) fn respond_with<F>(&self, responder: F)
    where
        F: Fn(&Message) -> Reply + Send + 'static,
    {
        self.lock().responder = Box::new(responder);
    }

    pub(crate) fn opens(&self) -> usize {
        self.lock().opens
    }

    pub(crate) fn requests(&self) -> Vec<Message> {
        self.lock().requests.clone()
    }

    pub(crate) fn last_request_id(&self) -> Option<u64> {
        self.lock().last_request_id
    }

    /// Wire names of every request received, in order.
    pub(crate) fn request_names(&self) -> Vec<&'static str> {
        self.lock()
            .requests
            .iter()
            .map(|m| m.tag().wire_name())
            .collect()
    }

    pub(crate) fn count(&self, tag: MessageTag) -> usize {
        self.lock()
            .requests
            .iter()
            .filter(|m| m.tag() == tag)
            .count()
    }

    /// Push an unsolicited message over the newest open link.
    pub(crate) fn push(&self, message: Message) {
        let link = self
            .lock()
            .links
            .iter()
            .rev()
            .find(|l| l.open.load(Ordering::SeqCst))
            .cloned();
        if let Some(link) = link {
            link.deliver(Envelope::notice(message));
        }
    }

    /// Answer request `request_id` by hand, e.g. after it timed out.
    pub(crate) fn reply_late(&self, request_id: u64, message: Message) {
        let links = self.lock().links.clone();
        for link in links {
            link.deliver(Envelope::reply(request_id, message.clone()));
        }
    }

    /// Drop every open link as if the network failed.
    pub(crate) fn drop_links(&self) {
        let links = std::mem::take(&mut self.lock().links);
        for link in links {
            if link.open.swap(false, Ordering::SeqCst) {
                let _ = link.inbound.send(TransportEvent::Disconnected {
                    reason: "link dropped".into(),
                });
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ServerState> {
        self.state.lock().unwrap()
    }
}

pub(crate) struct MockConnector {
    server: MockServer,
}

impl Connector for MockConnector {
    type Connection = MockConnection;

    fn open(
        &self,
        endpoint: &str,
        inbound: InboundSender,
    ) -> impl std::future::Future<Output = Result<MockConnection, TransportError>> + Send {
        let server = self.server.clone();
        let endpoint = endpoint.to_string();
        async move {
            let delay = server.lock().open_delay;
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let mut state = server.lock();
            state.opens += 1;
            if state.fail_opens > 0 {
                state.fail_opens -= 1;
                return Err(TransportError::Connect {
                    endpoint,
                    reason: "connection refused".into(),
                });
            }
            let link = Arc::new(MockLink {
                open: AtomicBool::new(true),
                inbound,
            });
            state.links.push(Arc::clone(&link));
            drop(state);
            Ok(MockConnection {
                link,
                server: server.clone(),
            })
        }
    }
}

pub(crate) struct MockConnection {
    link: Arc<MockLink>,
    server: MockServer,
}

impl Connection for MockConnection {
    fn send(&self, envelope: Envelope) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::NotConnected);
        }
        let reply = {
            let mut state = self.server.lock();
            state.requests.push(envelope.message.clone());
            state.last_request_id = envelope.request_id;
            (state.responder)(&envelope.message)
        };
        if let (Reply::Answer(message), Some(id)) = (reply, envelope.request_id) {
            self.link.deliver(Envelope::reply(id, message));
        }
        Ok(())
    }

    fn close(&self) {
        self.link.open.store(false, Ordering::SeqCst);
    }

    fn is_open(&self) -> bool {
        self.link.open.load(Ordering::SeqCst)
    }
}
