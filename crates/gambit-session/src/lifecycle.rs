//! Connection lifecycle controller.
//!
//! Drives a [`Connector`] through the connection state machine:
//!
//! ```text
//! Disconnected --connect()--> Connecting --opened--> Connected
//!                               |    ^                  |
//!                  error/timeout|    |retry timer       |link lost
//!                               v    |                  v
//!                  Failed <--- Reconnecting <-----------+
//!            (max attempts)
//! ```
//!
//! One attempt runs at a time; concurrent `connect()` callers share its
//! outcome. Failed attempts are counted and retried after
//! [`BackoffPolicy::next_delay`]; a successful connection resets the count.
//! While connected, a pump task hands replies to [`PendingRequests`] and
//! everything else to the [`MessageRouter`].

use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use gambit_config::Config;
use gambit_net::{
    BackoffPolicy, Connection, Connector, Envelope, InboundReceiver, Message, MessageRouter,
    PendingRequests, TransportEvent, inbound_channel,
};
use rand::SeedableRng;
use rand::rngs::StdRng;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::error::{Operation, SessionError, SessionResult};
use crate::event_bus::{EventBus, SessionEvent};
use crate::state::ReconnectState;

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Idle; initial state and the state after `disconnect()`/`shutdown()`.
    Disconnected,
    /// An attempt is in flight.
    Connecting,
    /// The transport is open.
    Connected,
    /// Waiting for the retry timer.
    Reconnecting,
    /// Gave up after the configured number of attempts.
    Failed,
}

/// Observable connection state backed by a [`watch`] channel.
///
/// Multiple subscribers can observe state transitions without polling.
pub struct ConnectionStateWatch {
    tx: watch::Sender<ConnectionState>,
    rx: watch::Receiver<ConnectionState>,
}

impl Default for ConnectionStateWatch {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionStateWatch {
    /// Create a new watch initialized to [`ConnectionState::Disconnected`].
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(ConnectionState::Disconnected);
        Self { tx, rx }
    }

    /// Set the current connection state, notifying subscribers on change.
    pub fn set(&self, state: ConnectionState) {
        self.tx.send_if_modified(|current| {
            let changed = *current != state;
            *current = state;
            changed
        });
    }

    /// Return a new subscriber receiver.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.rx.clone()
    }

    /// Return the current state without blocking.
    pub fn current(&self) -> ConnectionState {
        *self.rx.borrow()
    }
}

/// Controller configuration.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub endpoint: String,
    /// Deadline for a single transport open.
    pub connect_timeout: Duration,
    pub backoff: BackoffPolicy,
    /// Consecutive failures before entering [`ConnectionState::Failed`].
    pub max_attempts: Option<u32>,
    /// Minimum spacing of caller-initiated attempts.
    pub min_attempt_interval: Duration,
    /// Seed for backoff jitter; `None` seeds from the OS.
    pub jitter_seed: Option<u64>,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl ConnectionSettings {
    /// Build settings from the `network`, `timeouts` and `reconnect`
    /// sections. Jitter is seeded from the OS.
    pub fn from_config(config: &Config) -> Self {
        Self {
            endpoint: config.network.endpoint.clone(),
            connect_timeout: config.timeouts.connect(),
            backoff: BackoffPolicy {
                base_delay: config.reconnect.base_delay(),
                growth_factor: config.reconnect.growth_factor,
                max_delay: config.reconnect.max_delay(),
            },
            max_attempts: config.reconnect.max_attempts,
            min_attempt_interval: config.reconnect.min_attempt_interval(),
            jitter_seed: None,
        }
    }
}

type Outcome = Option<SessionResult<()>>;

struct Inner<K> {
    reconnect: ReconnectState,
    connection: Option<Arc<K>>,
    /// Bumped whenever an attempt starts or the caller tears the link down;
    /// tasks carrying an older value are stale.
    generation: u64,
    in_flight: Option<watch::Receiver<Outcome>>,
    retry: Option<JoinHandle<()>>,
    pump: Option<JoinHandle<()>>,
    shut_down: bool,
}

enum Start {
    Ready,
    Waiting(watch::Receiver<Outcome>),
}

/// Owns the transport and keeps it connected.
pub struct ConnectionController<C: Connector> {
    connector: C,
    settings: ConnectionSettings,
    state: ConnectionStateWatch,
    epoch: watch::Sender<u64>,
    inner: Mutex<Inner<C::Connection>>,
    rng: Mutex<StdRng>,
    pending: Arc<PendingRequests>,
    router: MessageRouter,
    bus: EventBus,
}

impl<C: Connector> ConnectionController<C> {
    /// Create an idle controller. Nothing connects until [`Self::connect`].
    pub fn new(connector: C, settings: ConnectionSettings, bus: EventBus) -> Arc<Self> {
        let rng = match settings.jitter_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        let (epoch, _) = watch::channel(0);
        Arc::new(Self {
            connector,
            settings,
            state: ConnectionStateWatch::new(),
            epoch,
            inner: Mutex::new(Inner {
                reconnect: ReconnectState::default(),
                connection: None,
                generation: 0,
                in_flight: None,
                retry: None,
                pump: None,
                shut_down: false,
            }),
            rng: Mutex::new(rng),
            pending: PendingRequests::new(),
            router: MessageRouter::new(),
            bus,
        })
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.state.current()
    }

    /// Receiver notified on every state transition.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Number of successful connections so far.
    pub fn epoch(&self) -> u64 {
        *self.epoch.borrow()
    }

    /// Copy of the retry bookkeeping.
    pub fn reconnect_state(&self) -> ReconnectState {
        self.lock().reconnect.clone()
    }

    /// Settings the controller was built with.
    pub fn settings(&self) -> &ConnectionSettings {
        &self.settings
    }

    /// Handlers for unsolicited server messages.
    pub fn router(&self) -> &MessageRouter {
        &self.router
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Requests still waiting for a reply.
    pub fn pending_requests(&self) -> usize {
        self.pending.len()
    }

    /// Connect, or join the attempt already in flight.
    ///
    /// Resolves with the outcome of that attempt. A failed attempt is also
    /// published as an `error` event and retried in the background.
    pub async fn connect(self: &Arc<Self>) -> SessionResult<()> {
        match self.start(true)? {
            Start::Ready => Ok(()),
            Start::Waiting(rx) => wait_outcome(rx).await,
        }
    }

    /// Wait until connected, starting an attempt only when idle.
    ///
    /// From `Disconnected` or `Failed` this is [`Self::connect`]. While an
    /// attempt or a retry timer is pending it waits for that machinery
    /// instead of starting another attempt, so the throttle does not apply.
    /// Fails once the controller gives up or is closed.
    pub async fn wait_connected(self: &Arc<Self>) -> SessionResult<()> {
        let mut state = self.subscribe_state();
        let current = *state.borrow_and_update();
        match current {
            ConnectionState::Connected => return Ok(()),
            ConnectionState::Disconnected | ConnectionState::Failed => {
                return self.connect().await;
            }
            ConnectionState::Connecting | ConnectionState::Reconnecting => {}
        }

        let settled = state
            .wait_for(|s| {
                !matches!(s, ConnectionState::Connecting | ConnectionState::Reconnecting)
            })
            .await
            .map(|s| *s);
        match settled {
            Ok(ConnectionState::Connected) => Ok(()),
            Ok(ConnectionState::Failed) => Err(SessionError::Connection(format!(
                "gave up after {} failed attempts",
                self.reconnect_state().attempt_count
            ))),
            Ok(_) => Err(self.abandoned_error()),
            Err(_) => Err(SessionError::Shutdown),
        }
    }

    /// Start an attempt without waiting for it.
    ///
    /// Fails with [`SessionError::AlreadyInProgress`] while one is running.
    pub fn begin_connect(self: &Arc<Self>) -> SessionResult<()> {
        self.start(false).map(|_| ())
    }

    /// Caller-initiated close. No retry is scheduled.
    pub fn disconnect(&self) {
        self.tear_down(false, "disconnected by caller");
    }

    /// Close everything and refuse further work.
    pub fn shutdown(&self) {
        self.tear_down(true, "session shut down");
    }

    pub fn is_shut_down(&self) -> bool {
        self.lock().shut_down
    }

    /// Send `message` and wait up to `deadline` for its correlated reply.
    pub async fn request(
        &self,
        message: Message,
        deadline: Duration,
        operation: Operation,
    ) -> SessionResult<Message> {
        let connection = self.lock().connection.clone();
        let connection = connection.ok_or(SessionError::NotConnected)?;

        let reply = self.pending.register();
        tracing::debug!("Sending {} as request {}", message.tag().wire_name(), reply.id());
        connection.send(Envelope::request(reply.id(), message))?;

        match tokio::time::timeout(deadline, reply).await {
            Ok(Ok(message)) => Ok(message),
            Ok(Err(_)) => Err(SessionError::Disconnected),
            Err(_) => Err(SessionError::Timeout {
                operation,
                after: deadline,
            }),
        }
    }

    fn start(self: &Arc<Self>, coalesce: bool) -> SessionResult<Start> {
        let mut inner = self.lock();
        if inner.shut_down {
            return Err(SessionError::Shutdown);
        }
        match self.state.current() {
            ConnectionState::Connected => Ok(Start::Ready),
            ConnectionState::Connecting => match (&inner.in_flight, coalesce) {
                (Some(rx), true) => {
                    tracing::debug!("Joining connection attempt already in flight");
                    Ok(Start::Waiting(rx.clone()))
                }
                _ => Err(SessionError::AlreadyInProgress),
            },
            previous @ (ConnectionState::Disconnected
            | ConnectionState::Reconnecting
            | ConnectionState::Failed) => {
                if let Some(last) = inner.reconnect.last_attempt_at {
                    let elapsed = last.elapsed();
                    if elapsed < self.settings.min_attempt_interval {
                        let retry_after = self.settings.min_attempt_interval - elapsed;
                        tracing::debug!("Connection attempt throttled for {retry_after:?}");
                        return Err(SessionError::Throttled { retry_after });
                    }
                }
                if previous == ConnectionState::Failed {
                    inner.reconnect.attempt_count = 0;
                }
                if let Some(retry) = inner.retry.take() {
                    retry.abort();
                }
                Ok(Start::Waiting(self.begin_attempt(&mut inner)))
            }
        }
    }

    fn begin_attempt(self: &Arc<Self>, inner: &mut Inner<C::Connection>) -> watch::Receiver<Outcome> {
        inner.generation += 1;
        inner.reconnect.last_attempt_at = Some(Instant::now());
        inner.reconnect.next_delay = None;
        let (tx, rx) = watch::channel(None);
        inner.in_flight = Some(rx.clone());
        self.state.set(ConnectionState::Connecting);

        let attempt = inner.reconnect.attempt_count;
        tokio::spawn(Arc::clone(self).run_attempt(inner.generation, attempt, tx));
        rx
    }

    async fn run_attempt(self: Arc<Self>, generation: u64, attempt: u32, tx: watch::Sender<Outcome>) {
        self.bus.publish(&SessionEvent::Connecting { attempt });
        tracing::info!("Connecting to {} (attempt {})", self.settings.endpoint, attempt + 1);

        let (inbound, inbound_rx) = inbound_channel();
        let deadline = self.settings.connect_timeout;
        let opened = tokio::time::timeout(deadline, self.connector.open(&self.settings.endpoint, inbound)).await;
        let result = match opened {
            Ok(Ok(connection)) => Ok(connection),
            Ok(Err(e)) => Err(SessionError::from(e)),
            Err(_) => Err(SessionError::Timeout {
                operation: Operation::Connect,
                after: deadline,
            }),
        };

        match result {
            Ok(connection) => self.on_connected(generation, Arc::new(connection), inbound_rx, tx),
            Err(error) => self.on_attempt_failed(generation, error, tx),
        }
    }

    fn on_connected(
        self: &Arc<Self>,
        generation: u64,
        connection: Arc<C::Connection>,
        inbound_rx: InboundReceiver,
        tx: watch::Sender<Outcome>,
    ) {
        let epoch = {
            let mut inner = self.lock();
            if inner.generation != generation || inner.shut_down {
                drop(inner);
                connection.close();
                tx.send_replace(Some(Err(self.abandoned_error())));
                return;
            }
            inner.reconnect.attempt_count = 0;
            inner.reconnect.next_delay = None;
            inner.in_flight = None;
            inner.connection = Some(connection);
            inner.pump = Some(tokio::spawn(pump(Arc::downgrade(self), generation, inbound_rx)));
            self.epoch.send_modify(|epoch| *epoch += 1);
            self.state.set(ConnectionState::Connected);
            *self.epoch.borrow()
        };

        tracing::info!("Connected to {} (epoch {epoch})", self.settings.endpoint);
        tx.send_replace(Some(Ok(())));
        self.bus.publish(&SessionEvent::Connect { epoch });
    }

    fn on_attempt_failed(self: &Arc<Self>, generation: u64, error: SessionError, tx: watch::Sender<Outcome>) {
        let attempt = {
            let mut inner = self.lock();
            if inner.generation != generation || inner.shut_down {
                drop(inner);
                tx.send_replace(Some(Err(error)));
                return;
            }
            inner.in_flight = None;
            inner.reconnect.attempt_count = inner.reconnect.attempt_count.saturating_add(1);
            let attempt = inner.reconnect.attempt_count;

            if self.settings.max_attempts.is_some_and(|max| attempt >= max) {
                tracing::warn!("Giving up after {attempt} failed connection attempts: {error}");
                self.state.set(ConnectionState::Failed);
            } else {
                let delay = self.backoff_delay(attempt);
                tracing::warn!("Connection attempt {attempt} failed: {error}; retrying in {delay:?}");
                self.schedule_retry(&mut inner, delay);
            }
            attempt
        };

        tx.send_replace(Some(Err(error.clone())));
        self.bus.publish(&SessionEvent::Error { error, attempt });
    }

    fn on_link_lost(self: &Arc<Self>, generation: u64, reason: String) {
        {
            let mut inner = self.lock();
            if inner.generation != generation || inner.shut_down {
                return;
            }
            inner.connection = None;
            inner.pump = None;
            let delay = self.backoff_delay(inner.reconnect.attempt_count);
            self.schedule_retry(&mut inner, delay);
        }

        let abandoned = self.pending.fail_all();
        tracing::warn!("Connection lost ({reason}); {abandoned} pending requests abandoned");
        self.bus.publish(&SessionEvent::Disconnect {
            reason,
            reconnecting: true,
        });
    }

    /// Enter `Reconnecting` and start the retry timer.
    fn schedule_retry(self: &Arc<Self>, inner: &mut Inner<C::Connection>, delay: Duration) {
        inner.reconnect.next_delay = Some(delay);
        self.state.set(ConnectionState::Reconnecting);
        if let Some(previous) = inner.retry.take() {
            previous.abort();
        }

        let weak = Arc::downgrade(self);
        let generation = inner.generation;
        inner.retry = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(this) = weak.upgrade() {
                this.retry_now(generation);
            }
        }));
    }

    /// Retry timer fired. Timer-driven attempts are not throttled.
    fn retry_now(self: &Arc<Self>, generation: u64) {
        let mut inner = self.lock();
        if inner.shut_down
            || inner.generation != generation
            || self.state.current() != ConnectionState::Reconnecting
        {
            return;
        }
        inner.retry = None;
        self.begin_attempt(&mut inner);
    }

    fn tear_down(&self, terminal: bool, reason: &str) {
        let (previous, connection) = {
            let mut inner = self.lock();
            if inner.shut_down {
                return;
            }
            inner.shut_down = terminal;
            inner.generation += 1;
            inner.in_flight = None;
            inner.reconnect.next_delay = None;
            if let Some(retry) = inner.retry.take() {
                retry.abort();
            }
            if let Some(pump) = inner.pump.take() {
                pump.abort();
            }
            let previous = self.state.current();
            self.state.set(ConnectionState::Disconnected);
            (previous, inner.connection.take())
        };

        if let Some(connection) = connection {
            connection.close();
        }
        self.pending.fail_all();

        if previous != ConnectionState::Disconnected {
            tracing::info!("Connection closed: {reason}");
            self.bus.publish(&SessionEvent::Disconnect {
                reason: reason.to_string(),
                reconnecting: false,
            });
        }
    }

    fn dispatch(&self, envelope: Envelope) {
        match envelope.reply_to {
            Some(id) => {
                if !self.pending.resolve(id, envelope.message) {
                    tracing::debug!("Dropping reply {id}: no request is waiting for it");
                }
            }
            None => {
                self.router.route(&envelope.message);
            }
        }
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());
        self.settings.backoff.next_delay(attempt, &mut *rng)
    }

    fn abandoned_error(&self) -> SessionError {
        if self.lock().shut_down {
            SessionError::Shutdown
        } else {
            SessionError::Disconnected
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner<C::Connection>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Forward transport events of one connection until it goes away.
async fn pump<C: Connector>(
    controller: Weak<ConnectionController<C>>,
    generation: u64,
    mut inbound_rx: InboundReceiver,
) {
    while let Some(event) = inbound_rx.recv().await {
        let Some(controller) = controller.upgrade() else {
            break;
        };
        match event {
            TransportEvent::Message(envelope) => controller.dispatch(envelope),
            TransportEvent::Disconnected { reason } => {
                controller.on_link_lost(generation, reason);
                break;
            }
        }
    }
}

async fn wait_outcome(mut rx: watch::Receiver<Outcome>) -> SessionResult<()> {
    match rx.wait_for(Option::is_some).await {
        Ok(outcome) => (*outcome).clone().unwrap_or(Err(SessionError::Shutdown)),
        Err(_) => Err(SessionError::Shutdown),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_bus::EventKind;
    use crate::testing::{MockConnector, MockServer, Reply};
    use gambit_net::{LeaveAck, LeaveGame, MessageTag, PlayerNotice};
    use tokio::sync::mpsc;

    fn settings() -> ConnectionSettings {
        ConnectionSettings {
            endpoint: "mock://server".into(),
            jitter_seed: Some(7),
            ..Default::default()
        }
    }

    fn controller(server: &MockServer) -> Arc<ConnectionController<MockConnector>> {
        ConnectionController::new(server.connector(), settings(), EventBus::new())
    }

    fn forward(bus: &EventBus, kind: EventKind) -> mpsc::UnboundedReceiver<SessionEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        bus.subscribe(kind, move |event| {
            let _ = tx.send(event.clone());
            Ok(())
        });
        rx
    }

    fn leave() -> Message {
        Message::LeaveGame(LeaveGame {
            game_id: "g1".into(),
            player_id: None,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_reaches_connected() {
        let server = MockServer::new();
        let ctl = controller(&server);
        let mut connects = forward(ctl.bus(), EventKind::Connect);
        assert_eq!(ctl.state(), ConnectionState::Disconnected);

        ctl.connect().await.unwrap();
        assert_eq!(ctl.state(), ConnectionState::Connected);
        assert_eq!(ctl.epoch(), 1);
        assert!(matches!(
            connects.recv().await,
            Some(SessionEvent::Connect { epoch: 1 })
        ));

        let reconnect = ctl.reconnect_state();
        assert_eq!(reconnect.attempt_count, 0);
        assert_eq!(reconnect.next_delay, None);
        assert!(reconnect.last_attempt_at.is_some());

        // Idempotent while connected.
        ctl.connect().await.unwrap();
        assert_eq!(server.opens(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_connects_share_one_attempt() {
        let server = MockServer::new();
        server.set_open_delay(Duration::from_millis(200));
        let ctl = controller(&server);

        let (a, b, c) = tokio::join!(ctl.connect(), ctl.connect(), ctl.connect());
        assert_eq!((a, b, c), (Ok(()), Ok(()), Ok(())));
        assert_eq!(server.opens(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_begin_connect_reports_attempt_in_flight() {
        let server = MockServer::new();
        server.set_open_delay(Duration::from_millis(200));
        let ctl = controller(&server);

        ctl.begin_connect().unwrap();
        assert_eq!(ctl.state(), ConnectionState::Connecting);
        assert_eq!(ctl.begin_connect(), Err(SessionError::AlreadyInProgress));

        let mut state = ctl.subscribe_state();
        state
            .wait_for(|s| *s == ConnectionState::Connected)
            .await
            .unwrap();
        assert_eq!(server.opens(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_connect_within_interval_is_throttled() {
        let server = MockServer::new();
        server.fail_next_opens(1);
        let ctl = controller(&server);

        assert!(matches!(
            ctl.connect().await,
            Err(SessionError::Connection(_))
        ));
        assert_eq!(ctl.state(), ConnectionState::Reconnecting);

        assert!(matches!(
            ctl.connect().await,
            Err(SessionError::Throttled { .. })
        ));
        assert_eq!(server.opens(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_three_failures_back_off() {
        let server = MockServer::new();
        server.fail_next_opens(usize::MAX);
        let ctl = controller(&server);
        let mut errors = forward(ctl.bus(), EventKind::Error);

        let _ = ctl.connect().await;
        for expected in 1..=3 {
            match errors.recv().await {
                Some(SessionEvent::Error { attempt, .. }) => assert_eq!(attempt, expected),
                other => panic!("expected error event, got {other:?}"),
            }
        }

        let reconnect = ctl.reconnect_state();
        assert_eq!(reconnect.attempt_count, 3);
        assert_eq!(ctl.state(), ConnectionState::Reconnecting);
        assert_eq!(server.opens(), 3);

        // base 1s, growth 2: n = 3 gives [8s, 12s].
        let delay = reconnect.next_delay.unwrap();
        assert!(
            delay >= Duration::from_secs(8) && delay <= Duration::from_secs(12),
            "delay {delay:?} out of bounds"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_max_attempts_enters_failed_and_connect_resets() {
        let server = MockServer::new();
        server.fail_next_opens(2);
        let ctl = ConnectionController::new(
            server.connector(),
            ConnectionSettings {
                max_attempts: Some(2),
                ..settings()
            },
            EventBus::new(),
        );

        let _ = ctl.connect().await;
        let mut state = ctl.subscribe_state();
        state
            .wait_for(|s| *s == ConnectionState::Failed)
            .await
            .unwrap();
        assert_eq!(ctl.reconnect_state().attempt_count, 2);

        // Terminal: nothing retries on its own.
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(server.opens(), 2);

        ctl.connect().await.unwrap();
        assert_eq!(ctl.state(), ConnectionState::Connected);
        assert_eq!(ctl.reconnect_state().attempt_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_connected_rides_pending_retry() {
        let server = MockServer::new();
        server.fail_next_opens(1);
        let ctl = controller(&server);

        ctl.begin_connect().unwrap();
        let mut state = ctl.subscribe_state();
        state
            .wait_for(|s| *s == ConnectionState::Reconnecting)
            .await
            .unwrap();
        assert!(matches!(ctl.connect().await, Err(SessionError::Throttled { .. })));

        ctl.wait_connected().await.unwrap();
        assert_eq!(ctl.state(), ConnectionState::Connected);
        assert_eq!(server.opens(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_connected_fails_when_controller_gives_up() {
        let server = MockServer::new();
        server.fail_next_opens(2);
        let ctl = ConnectionController::new(
            server.connector(),
            ConnectionSettings {
                max_attempts: Some(2),
                ..settings()
            },
            EventBus::new(),
        );

        ctl.begin_connect().unwrap();
        let result = ctl.wait_connected().await;
        assert!(matches!(result, Err(SessionError::Connection(_))), "{result:?}");
        assert_eq!(ctl.state(), ConnectionState::Failed);
        assert_eq!(server.opens(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_connected_starts_attempt_when_idle() {
        let server = MockServer::new();
        let ctl = controller(&server);

        ctl.wait_connected().await.unwrap();
        assert_eq!(ctl.state(), ConnectionState::Connected);
        assert_eq!(server.opens(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_timeout_schedules_retry() {
        let server = MockServer::new();
        server.set_open_delay(Duration::from_secs(60));
        let ctl = controller(&server);

        let result = ctl.connect().await;
        assert_eq!(
            result,
            Err(SessionError::Timeout {
                operation: Operation::Connect,
                after: Duration::from_secs(10),
            })
        );
        assert_eq!(ctl.state(), ConnectionState::Reconnecting);
        assert_eq!(ctl.reconnect_state().attempt_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lost_link_reconnects_and_abandons_requests() {
        let server = MockServer::new();
        server.respond_with(|_| Reply::Silent);
        let ctl = controller(&server);
        let mut disconnects = forward(ctl.bus(), EventKind::Disconnect);
        ctl.connect().await.unwrap();

        let waiting = {
            let ctl = Arc::clone(&ctl);
            tokio::spawn(async move {
                ctl.request(leave(), Duration::from_secs(30), Operation::Leave)
                    .await
            })
        };
        while ctl.pending_requests() == 0 {
            tokio::task::yield_now().await;
        }

        server.drop_links();
        assert!(matches!(
            disconnects.recv().await,
            Some(SessionEvent::Disconnect {
                reconnecting: true,
                ..
            })
        ));
        assert_eq!(waiting.await.unwrap(), Err(SessionError::Disconnected));
        assert_eq!(ctl.state(), ConnectionState::Reconnecting);

        let mut state = ctl.subscribe_state();
        state
            .wait_for(|s| *s == ConnectionState::Connected)
            .await
            .unwrap();
        assert_eq!(ctl.epoch(), 2);
        assert_eq!(server.opens(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_caller_disconnect_does_not_retry() {
        let server = MockServer::new();
        let ctl = controller(&server);
        let mut disconnects = forward(ctl.bus(), EventKind::Disconnect);
        ctl.connect().await.unwrap();

        ctl.disconnect();
        assert_eq!(ctl.state(), ConnectionState::Disconnected);
        assert!(matches!(
            disconnects.recv().await,
            Some(SessionEvent::Disconnect {
                reconnecting: false,
                ..
            })
        ));

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(server.opens(), 1);
        assert_eq!(ctl.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_is_terminal() {
        let server = MockServer::new();
        let ctl = controller(&server);
        ctl.connect().await.unwrap();

        ctl.shutdown();
        assert!(ctl.is_shut_down());
        assert_eq!(ctl.state(), ConnectionState::Disconnected);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(ctl.connect().await, Err(SessionError::Shutdown));
        assert_eq!(server.opens(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_timeout_rejects_late_reply() {
        let server = MockServer::new();
        server.respond_with(|_| Reply::Silent);
        let ctl = controller(&server);
        ctl.connect().await.unwrap();

        let result = ctl
            .request(leave(), Duration::from_secs(3), Operation::Leave)
            .await;
        assert!(matches!(
            result,
            Err(SessionError::Timeout {
                operation: Operation::Leave,
                ..
            })
        ));
        assert_eq!(ctl.pending_requests(), 0);

        let id = server.last_request_id().unwrap();
        server.reply_late(id, Message::LeaveAck(LeaveAck { success: true }));
        tokio::task::yield_now().await;
        assert_eq!(ctl.pending_requests(), 0);
        assert_eq!(ctl.state(), ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_without_connection_fails_fast() {
        let server = MockServer::new();
        let ctl = controller(&server);
        let result = ctl
            .request(leave(), Duration::from_secs(3), Operation::Leave)
            .await;
        assert_eq!(result, Err(SessionError::NotConnected));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsolicited_messages_reach_router() {
        let server = MockServer::new();
        let ctl = controller(&server);
        let (tx, mut rx) = mpsc::unbounded_channel();
        ctl.router().register(MessageTag::PlayerJoined, move |msg: &Message| {
            let _ = tx.send(msg.clone());
        });
        ctl.connect().await.unwrap();

        let notice = Message::PlayerJoined(PlayerNotice {
            game_id: Some("g1".into()),
            player_id: Some("p-9".into()),
            player_name: Some("Cy".into()),
        });
        server.push(notice.clone());
        assert_eq!(rx.recv().await, Some(notice));
    }
}
