//! Join/leave protocol.
//!
//! Operations are strictly sequenced by an async lock: a second `join` waits
//! for the first and then usually finds nothing left to do. Before the first
//! join on each connection the client registers, so the server knows its
//! name and the player id it was given earlier.

use std::sync::Arc;
use std::time::Duration;

use gambit_config::Config;
use gambit_net::{Connector, Fields, JoinGame, LeaveGame, Message, Register, Value};
use tokio::sync::Mutex;

use crate::error::{Operation, SessionError, SessionResult};
use crate::lifecycle::{ConnectionController, ConnectionState};
use crate::state::SessionState;

/// Named events some servers send instead of a join acknowledgement.
pub const JOIN_ACK_ALIASES: [&str; 4] = ["game:joined", "gameJoined", "joinedGame", "room:joined"];

/// Named events announcing another player entering the game.
pub const PLAYER_JOINED_ALIASES: [&str; 2] = ["player:joined", "playerJoined"];

/// Named events announcing another player leaving the game.
pub const PLAYER_LEFT_ALIASES: [&str; 2] = ["player:left", "playerLeft"];

/// Outcome of a successful join.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MembershipResult {
    /// Server-confirmed game id.
    pub game_id: String,
    pub player_id: Option<String>,
    /// True when the session was already in this game and nothing was sent.
    pub already_joined: bool,
}

#[derive(Debug, Clone)]
pub struct MembershipSettings {
    /// Deadline for register and join acknowledgements.
    pub join_timeout: Duration,
    /// Deadline for a leave acknowledgement before clearing locally.
    pub leave_timeout: Duration,
}

impl Default for MembershipSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl MembershipSettings {
    /// Read the join and leave deadlines from `timeouts`.
    pub fn from_config(config: &Config) -> Self {
        Self {
            join_timeout: config.timeouts.join(),
            leave_timeout: config.timeouts.leave(),
        }
    }
}

pub struct Membership<C: Connector> {
    controller: Arc<ConnectionController<C>>,
    state: Arc<SessionState>,
    settings: MembershipSettings,
    op_lock: Mutex<()>,
}

impl<C: Connector> Membership<C> {
    /// Create the protocol over a shared controller and session state.
    pub fn new(
        controller: Arc<ConnectionController<C>>,
        state: Arc<SessionState>,
        settings: MembershipSettings,
    ) -> Self {
        Self {
            controller,
            state,
            settings,
            op_lock: Mutex::new(()),
        }
    }

    /// Join `game_id`, or the server's default game when `None`.
    ///
    /// Already being in the requested game (or in any game, for `None`)
    /// resolves at once. Being in another game leaves it first. A pending
    /// connection attempt or retry is awaited; an idle controller is told to
    /// connect. On failure the membership is left as it was.
    pub async fn join(&self, game_id: Option<String>) -> SessionResult<MembershipResult> {
        let _op = self.op_lock.lock().await;

        let current = self.state.membership();
        if let Some(joined) = current.joined_game() {
            if game_id.as_deref().is_none_or(|wanted| wanted == joined) {
                return Ok(MembershipResult {
                    game_id: joined.to_string(),
                    player_id: self.state.identity().player_id,
                    already_joined: true,
                });
            }
            tracing::info!("Leaving {joined} before joining another game");
            self.leave_locked().await;
        }

        self.controller.wait_connected().await?;
        self.send_join(game_id).await
    }

    /// Leave the current game.
    ///
    /// Membership and the snapshot are always cleared locally. Returns
    /// whether the server acknowledged; with nothing to leave it returns
    /// `true` without sending anything.
    pub async fn leave(&self) -> bool {
        let _op = self.op_lock.lock().await;
        self.leave_locked().await
    }

    /// Re-send the join for the current game on a new connection.
    ///
    /// Returns `None` when there is nothing to rejoin. A refusal clears the
    /// membership.
    pub async fn rejoin(&self) -> SessionResult<Option<MembershipResult>> {
        let _op = self.op_lock.lock().await;

        let current = self.state.membership();
        let Some(game_id) = current.joined_game().map(str::to_owned) else {
            return Ok(None);
        };
        if current.epoch == self.controller.epoch() {
            return Ok(None);
        }

        tracing::info!("Rejoining {game_id} after reconnection");
        match self.send_join(Some(game_id)).await {
            Ok(result) => Ok(Some(result)),
            Err(e @ SessionError::Rejected(_)) => {
                self.state.clear_membership();
                self.state.clear_snapshot();
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    async fn send_join(&self, requested: Option<String>) -> SessionResult<MembershipResult> {
        let epoch = self.controller.epoch();
        self.ensure_registered(epoch).await?;

        let identity = self.state.identity();
        let reply = self
            .controller
            .request(
                Message::JoinGame(JoinGame {
                    game_id: requested.clone(),
                    player_name: identity.player_name,
                    player_id: identity.player_id,
                }),
                self.settings.join_timeout,
                Operation::Join,
            )
            .await?;

        let (game_id, player_id) = interpret_join_reply(reply, requested.as_deref())?;
        if let Some(id) = &player_id {
            self.state.record_registration(epoch, id.clone());
        }
        self.state.set_membership(game_id.clone(), epoch);
        tracing::info!("Joined game {game_id}");

        Ok(MembershipResult {
            game_id,
            player_id: self.state.identity().player_id,
            already_joined: false,
        })
    }

    async fn ensure_registered(&self, epoch: u64) -> SessionResult<()> {
        if self.state.registered_epoch() == Some(epoch) {
            return Ok(());
        }
        let identity = self.state.identity();
        let reply = self
            .controller
            .request(
                Message::Register(Register {
                    player_name: identity.player_name,
                    player_id: identity.player_id,
                }),
                self.settings.join_timeout,
                Operation::Register,
            )
            .await?;

        match reply {
            Message::Registered(registered) => {
                tracing::debug!("Registered as {}", registered.player_id);
                self.state.record_registration(epoch, registered.player_id);
                Ok(())
            }
            Message::Error(e) => Err(SessionError::Rejected(e.message)),
            other => Err(SessionError::Protocol(format!(
                "unexpected reply to register: {}",
                other.tag().wire_name()
            ))),
        }
    }

    async fn leave_locked(&self) -> bool {
        let current = self.state.membership();
        let Some(game_id) = current.joined_game().map(str::to_owned) else {
            return true;
        };

        let acknowledged = if self.controller.state() == ConnectionState::Connected {
            let request = Message::LeaveGame(LeaveGame {
                game_id: game_id.clone(),
                player_id: self.state.identity().player_id,
            });
            match self
                .controller
                .request(request, self.settings.leave_timeout, Operation::Leave)
                .await
            {
                Ok(Message::LeaveAck(ack)) => ack.success,
                Ok(other) => {
                    tracing::warn!("Unexpected reply to game:leave: {}", other.tag().wire_name());
                    false
                }
                Err(e) => {
                    tracing::warn!("Leave of {game_id} not acknowledged: {e}");
                    false
                }
            }
        } else {
            false
        };

        self.state.clear_membership();
        self.state.clear_snapshot();
        tracing::info!("Left game {game_id}");
        acknowledged
    }
}

/// Map a join reply to `(game_id, player_id)`.
fn interpret_join_reply(
    reply: Message,
    requested: Option<&str>,
) -> SessionResult<(String, Option<String>)> {
    let confirmed = |game_id: Option<String>| {
        game_id
            .or_else(|| requested.map(str::to_owned))
            .ok_or_else(|| SessionError::Protocol("join acknowledged without a game id".into()))
    };

    match reply {
        Message::JoinAck(ack) if ack.success => Ok((confirmed(ack.game_id)?, ack.player_id)),
        Message::JoinAck(ack) => Err(SessionError::Rejected(
            ack.error.unwrap_or_else(|| "join refused".into()),
        )),
        Message::Error(e) => Err(SessionError::Rejected(e.message)),
        Message::Named(event) if JOIN_ACK_ALIASES.contains(&event.name.as_str()) => {
            tracing::debug!("Join acknowledged through alias {}", event.name);
            let game_id = field_text(&event.fields, "gameId", "game_id");
            let player_id = field_text(&event.fields, "playerId", "player_id");
            Ok((confirmed(game_id)?, player_id))
        }
        other => Err(SessionError::Protocol(format!(
            "unexpected reply to game:join: {}",
            other.tag().wire_name()
        ))),
    }
}

fn field_text(fields: &Fields, camel: &str, snake: &str) -> Option<String> {
    fields
        .get(camel)
        .or_else(|| fields.get(snake))
        .and_then(Value::as_str)
        .map(str::to_owned)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_bus::EventBus;
    use crate::lifecycle::ConnectionSettings;
    use crate::testing::{MockConnector, MockServer, Reply, default_reply, fields};
    use gambit_net::{ErrorReply, JoinAck, MessageTag, NamedEvent};

    fn membership(server: &MockServer) -> (Arc<Membership<MockConnector>>, Arc<SessionState>) {
        let controller = ConnectionController::new(
            server.connector(),
            ConnectionSettings {
                jitter_seed: Some(1),
                ..Default::default()
            },
            EventBus::new(),
        );
        let state = Arc::new(SessionState::new("Ada"));
        let membership = Membership::new(controller, Arc::clone(&state), MembershipSettings::default());
        (Arc::new(membership), state)
    }

    #[tokio::test(start_paused = true)]
    async fn test_join_connects_registers_and_joins() {
        let server = MockServer::new();
        let (m, state) = membership(&server);

        let result = m.join(Some("g1".into())).await.unwrap();
        assert_eq!(result.game_id, "g1");
        assert_eq!(result.player_id.as_deref(), Some("p-1"));
        assert!(!result.already_joined);
        assert_eq!(server.request_names(), ["register", "game:join"]);

        let current = state.membership();
        assert!(current.joined);
        assert_eq!(current.game_id.as_deref(), Some("g1"));
        assert_eq!(current.epoch, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_join_waits_out_pending_retry() {
        let server = MockServer::new();
        server.fail_next_opens(1);
        let (m, state) = membership(&server);

        m.controller.begin_connect().unwrap();
        let mut conn = m.controller.subscribe_state();
        conn.wait_for(|s| *s == ConnectionState::Reconnecting).await.unwrap();

        let result = m.join(Some("g1".into())).await.unwrap();
        assert_eq!(result.game_id, "g1");
        assert_eq!(server.opens(), 2);
        assert_eq!(server.request_names(), ["register", "game:join"]);
        assert_eq!(state.membership().joined_game(), Some("g1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_join_without_game_uses_confirmed_id() {
        let server = MockServer::new();
        let (m, state) = membership(&server);

        let result = m.join(None).await.unwrap();
        assert_eq!(result.game_id, "lobby");
        assert_eq!(state.membership().joined_game(), Some("lobby"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_joins_send_one_request() {
        let server = MockServer::new();
        let (m, _state) = membership(&server);

        let (a, b) = tokio::join!(m.join(Some("g1".into())), m.join(Some("g1".into())));
        let (a, b) = (a.unwrap(), b.unwrap());
        assert_eq!(a.game_id, "g1");
        assert_eq!(b.game_id, "g1");
        assert!(a.already_joined != b.already_joined);
        assert_eq!(server.count(MessageTag::JoinGame), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejoining_same_game_sends_nothing() {
        let server = MockServer::new();
        let (m, _state) = membership(&server);
        m.join(Some("g1".into())).await.unwrap();
        let sent = server.requests().len();

        assert!(m.join(Some("g1".into())).await.unwrap().already_joined);
        assert!(m.join(None).await.unwrap().already_joined);
        assert_eq!(server.requests().len(), sent);
    }

    #[tokio::test(start_paused = true)]
    async fn test_switching_games_leaves_then_joins() {
        let server = MockServer::new();
        let (m, state) = membership(&server);
        m.join(Some("gameA".into())).await.unwrap();

        m.join(Some("gameB".into())).await.unwrap();
        let requests = server.requests();
        let tail: Vec<_> = requests[2..].to_vec();
        assert_eq!(tail.len(), 2);
        assert!(matches!(&tail[0], Message::LeaveGame(l) if l.game_id == "gameA"));
        assert!(matches!(&tail[1], Message::JoinGame(j) if j.game_id.as_deref() == Some("gameB")));
        assert_eq!(state.membership().joined_game(), Some("gameB"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_join_leaves_membership_untouched() {
        let server = MockServer::new();
        server.respond_with(|msg| match msg {
            Message::JoinGame(_) => Reply::Answer(Message::JoinAck(JoinAck {
                success: false,
                game_id: None,
                player_id: None,
                error: Some("game full".into()),
            })),
            other => default_reply(other),
        });
        let (m, state) = membership(&server);

        let result = m.join(Some("g1".into())).await;
        assert_eq!(result, Err(SessionError::Rejected("game full".into())));
        assert!(!state.membership().joined);
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_reply_is_rejection() {
        let server = MockServer::new();
        server.respond_with(|msg| match msg {
            Message::JoinGame(_) => Reply::Answer(Message::Error(ErrorReply {
                message: "no such game".into(),
            })),
            other => default_reply(other),
        });
        let (m, _state) = membership(&server);
        assert!(matches!(
            m.join(Some("nope".into())).await,
            Err(SessionError::Rejected(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_join_timeout_leaves_membership_untouched() {
        let server = MockServer::new();
        server.respond_with(|msg| match msg {
            Message::JoinGame(_) => Reply::Silent,
            other => default_reply(other),
        });
        let (m, state) = membership(&server);

        let result = m.join(Some("g1".into())).await;
        assert_eq!(
            result,
            Err(SessionError::Timeout {
                operation: Operation::Join,
                after: Duration::from_secs(5),
            })
        );
        assert!(!state.membership().joined);
    }

    #[tokio::test(start_paused = true)]
    async fn test_named_alias_acknowledges_join() {
        let server = MockServer::new();
        server.respond_with(|msg| match msg {
            Message::JoinGame(_) => Reply::Answer(Message::Named(NamedEvent {
                name: "gameJoined".into(),
                fields: fields(&[("gameId", Value::from("room-7"))]),
            })),
            other => default_reply(other),
        });
        let (m, state) = membership(&server);

        let result = m.join(None).await.unwrap();
        assert_eq!(result.game_id, "room-7");
        assert_eq!(state.membership().joined_game(), Some("room-7"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ack_without_any_game_id_is_protocol_error() {
        let server = MockServer::new();
        server.respond_with(|msg| match msg {
            Message::JoinGame(_) => Reply::Answer(Message::JoinAck(JoinAck {
                success: true,
                game_id: None,
                player_id: None,
                error: None,
            })),
            other => default_reply(other),
        });
        let (m, _state) = membership(&server);
        assert!(matches!(m.join(None).await, Err(SessionError::Protocol(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_leave_timeout_still_clears_membership() {
        let server = MockServer::new();
        server.respond_with(|msg| match msg {
            Message::LeaveGame(_) => Reply::Silent,
            other => default_reply(other),
        });
        let (m, state) = membership(&server);
        m.join(Some("g1".into())).await.unwrap();

        assert!(!m.leave().await);
        assert!(!state.membership().joined);
        assert_eq!(state.membership().game_id, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_leave_without_membership_sends_nothing() {
        let server = MockServer::new();
        let (m, _state) = membership(&server);
        assert!(m.leave().await);
        assert!(server.requests().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_acknowledged_leave() {
        let server = MockServer::new();
        let (m, state) = membership(&server);
        m.join(Some("g1".into())).await.unwrap();

        assert!(m.leave().await);
        assert_eq!(state.membership().joined_game(), None);
        assert_eq!(server.count(MessageTag::LeaveGame), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejoin_after_reconnection() {
        let server = MockServer::new();
        let (m, state) = membership(&server);
        m.join(Some("g1".into())).await.unwrap();
        assert_eq!(m.rejoin().await, Ok(None));

        server.drop_links();
        let mut conn = m.controller.subscribe_state();
        conn.wait_for(|s| *s == ConnectionState::Reconnecting).await.unwrap();
        conn.wait_for(|s| *s == ConnectionState::Connected).await.unwrap();

        let rejoined = m.rejoin().await.unwrap().unwrap();
        assert_eq!(rejoined.game_id, "g1");
        assert_eq!(state.membership().epoch, 2);
        assert_eq!(server.count(MessageTag::Register), 2);
        assert_eq!(server.count(MessageTag::JoinGame), 2);
        assert_eq!(state.identity().player_id.as_deref(), Some("p-1"));
    }
}
