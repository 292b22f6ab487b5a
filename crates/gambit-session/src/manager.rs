//! The session facade: one object owning the whole client session.

use std::sync::{Arc, Mutex};

use gambit_config::Config;
use gambit_net::{Connector, Message, MessageHandler, MessageTag, RouteHandle};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::error::{SessionError, SessionResult};
use crate::event_bus::{EventBus, SessionEvent};
use crate::lifecycle::{ConnectionController, ConnectionSettings, ConnectionState};
use crate::membership::{
    Membership, MembershipResult, MembershipSettings, PLAYER_JOINED_ALIASES, PLAYER_LEFT_ALIASES,
};
use crate::state::{
    GameSnapshot, MembershipState, PlayerInfo, ReconnectState, SessionIdentity, SessionState,
};
use crate::sync::{StateSync, SyncSettings};

/// Everything needed to build a [`SessionManager`].
#[derive(Debug, Clone, Default)]
pub struct SessionSettings {
    pub player_name: String,
    pub connection: ConnectionSettings,
    pub membership: MembershipSettings,
    pub sync: SyncSettings,
}

impl SessionSettings {
    /// Derive every component's settings from one config.
    pub fn from_config(config: &Config) -> Self {
        Self {
            player_name: config.player.name.clone(),
            connection: ConnectionSettings::from_config(config),
            membership: MembershipSettings::from_config(config),
            sync: SyncSettings::from_config(config),
        }
    }
}

/// Client session: connection lifecycle, membership, state sync and the
/// event bus behind one handle.
///
/// Construction spawns the synchronization driver, so it must happen inside
/// a Tokio runtime.
pub struct SessionManager<C: Connector> {
    bus: EventBus,
    state: Arc<SessionState>,
    controller: Arc<ConnectionController<C>>,
    membership: Arc<Membership<C>>,
    sync: Arc<StateSync<C>>,
    shutdown_tx: watch::Sender<bool>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl<C: Connector> SessionManager<C> {
    /// Build a session from config over `connector`.
    pub fn new(config: &Config, connector: C) -> Self {
        Self::with_settings(SessionSettings::from_config(config), connector)
    }

    /// Build a session from explicit settings.
    pub fn with_settings(settings: SessionSettings, connector: C) -> Self {
        let bus = EventBus::new();
        let state = Arc::new(SessionState::new(settings.player_name));
        let controller = ConnectionController::new(connector, settings.connection, bus.clone());
        let membership = Arc::new(Membership::new(
            Arc::clone(&controller),
            Arc::clone(&state),
            settings.membership,
        ));
        let sync = Arc::new(StateSync::new(
            Arc::clone(&controller),
            Arc::clone(&membership),
            Arc::clone(&state),
            settings.sync,
        ));
        bridge_roster_events(&controller, &bus);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let driver = tokio::spawn(Arc::clone(&sync).run(shutdown_rx));

        Self {
            bus,
            state,
            controller,
            membership,
            sync,
            shutdown_tx,
            driver: Mutex::new(Some(driver)),
        }
    }

    /// Connect, or share the attempt already in flight.
    pub async fn connect(&self) -> SessionResult<()> {
        self.controller.connect().await
    }

    /// Start connecting without waiting.
    pub fn begin_connect(&self) -> SessionResult<()> {
        self.controller.begin_connect()
    }

    /// Close the connection without scheduling a retry. Membership is kept
    /// locally and re-sent on the next connection.
    pub fn disconnect(&self) {
        self.controller.disconnect();
    }

    /// Join `game_id`, or the server's default game for `None`.
    pub async fn join(&self, game_id: Option<&str>) -> SessionResult<MembershipResult> {
        self.membership.join(game_id.map(str::to_owned)).await
    }

    /// Leave the current game. Returns whether the server acknowledged.
    pub async fn leave(&self) -> bool {
        self.membership.leave().await
    }

    /// Change the player name. Only allowed while disconnected or before the
    /// server has assigned a player id.
    pub fn set_player_name(&self, name: impl Into<String>) -> SessionResult<()> {
        let idle = matches!(
            self.controller.state(),
            ConnectionState::Disconnected | ConnectionState::Failed
        );
        if !idle && self.state.identity().player_id.is_some() {
            return Err(SessionError::InvalidState(
                "player name is fixed while registered and connected".into(),
            ));
        }
        self.state.set_player_name(name.into());
        Ok(())
    }

    /// Add a handler for unsolicited server messages of one type.
    ///
    /// Runs alongside the built-in roster bridging; it never replaces it.
    pub fn on_message<H: MessageHandler + 'static>(
        &self,
        tag: MessageTag,
        handler: H,
    ) -> RouteHandle {
        self.controller.router().register(tag, handler)
    }

    /// Remove a handler added with [`SessionManager::on_message`].
    pub fn remove_message_handler(&self, handle: RouteHandle) -> bool {
        self.controller.router().unregister(handle)
    }

    /// Fetch a full snapshot of the joined game now, outside the polling
    /// schedule.
    pub async fn request_snapshot(&self) -> SessionResult<Arc<GameSnapshot>> {
        self.sync.request_snapshot().await
    }

    /// Poll one delta now. `None` means the server had nothing newer.
    pub async fn poll_delta(&self) -> SessionResult<Option<Arc<GameSnapshot>>> {
        self.sync.poll_delta().await
    }

    /// Stop synchronization and close the connection for good.
    pub fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
        self.controller.shutdown();
        if let Some(driver) = self.driver.lock().unwrap_or_else(|e| e.into_inner()).take() {
            driver.abort();
        }
    }

    /// Event bus carrying every session event.
    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Current connection lifecycle state.
    pub fn connection_state(&self) -> ConnectionState {
        self.controller.state()
    }

    /// Receiver notified on connection state transitions.
    pub fn subscribe_connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.controller.subscribe_state()
    }

    /// Current game membership.
    pub fn membership(&self) -> MembershipState {
        self.state.membership()
    }

    /// Receiver notified when membership changes.
    pub fn subscribe_membership(&self) -> watch::Receiver<MembershipState> {
        self.state.subscribe_membership()
    }

    /// Player name and server-assigned id.
    pub fn identity(&self) -> SessionIdentity {
        self.state.identity()
    }

    /// Latest synchronized game state, if any.
    pub fn snapshot(&self) -> Option<Arc<GameSnapshot>> {
        self.state.snapshot()
    }

    /// Retry bookkeeping of the connection.
    pub fn reconnect_state(&self) -> ReconnectState {
        self.controller.reconnect_state()
    }
}

impl<C: Connector> Drop for SessionManager<C> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Publish roster notices, including their named aliases, on the bus.
fn bridge_roster_events<C: Connector>(controller: &ConnectionController<C>, bus: &EventBus) {
    let router = controller.router();

    let joined_bus = bus.clone();
    router.register(MessageTag::PlayerJoined, move |msg: &Message| {
        if let Message::PlayerJoined(notice) = msg {
            joined_bus.publish(&SessionEvent::PlayerJoined(PlayerInfo::from(notice)));
        }
    });

    let left_bus = bus.clone();
    router.register(MessageTag::PlayerLeft, move |msg: &Message| {
        if let Message::PlayerLeft(notice) = msg {
            left_bus.publish(&SessionEvent::PlayerLeft(PlayerInfo::from(notice)));
        }
    });

    let named_bus = bus.clone();
    router.register(MessageTag::Named, move |msg: &Message| {
        let Message::Named(event) = msg else {
            return;
        };
        let name = event.name.as_str();
        if PLAYER_JOINED_ALIASES.contains(&name) {
            named_bus.publish(&SessionEvent::PlayerJoined(PlayerInfo::from_fields(&event.fields)));
        } else if PLAYER_LEFT_ALIASES.contains(&name) {
            named_bus.publish(&SessionEvent::PlayerLeft(PlayerInfo::from_fields(&event.fields)));
        } else {
            tracing::debug!("Ignoring named event {name}");
        }
    });
}
