//! State synchronization: full snapshots plus periodic delta polling.
//!
//! The driver loop ([`StateSync::run`]) waits until the session is connected
//! and in a game, then fetches a full snapshot (rejoining first if the
//! connection is new) and polls deltas on a fixed interval. Any change of
//! connection, connection epoch or game ends the polling phase, so a gap is
//! always followed by a fresh full fetch rather than a resumed delta chain.

use std::sync::Arc;
use std::time::Duration;

use gambit_config::Config;
use gambit_net::{Connector, DeltaRequest, Message, SnapshotRequest};
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};

use crate::error::{Operation, SessionError, SessionResult};
use crate::event_bus::{EventBus, SessionEvent};
use crate::lifecycle::{ConnectionController, ConnectionState};
use crate::membership::Membership;
use crate::state::{GameSnapshot, MembershipState, SessionState};

#[derive(Debug, Clone)]
pub struct SyncSettings {
    /// Spacing of delta polls while connected and joined.
    pub poll_interval: Duration,
    /// Deadline for a full snapshot reply.
    pub snapshot_timeout: Duration,
    /// Deadline for a delta reply; a miss skips that tick.
    pub delta_timeout: Duration,
    /// Wait before retrying a failed full fetch.
    pub snapshot_retry: Duration,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl SyncSettings {
    /// Read polling and retry periods from `sync` and deadlines from `timeouts`.
    pub fn from_config(config: &Config) -> Self {
        Self {
            poll_interval: config.sync.poll_interval(),
            snapshot_timeout: config.timeouts.snapshot(),
            delta_timeout: config.timeouts.delta(),
            snapshot_retry: config.sync.snapshot_retry(),
        }
    }
}

pub struct StateSync<C: Connector> {
    controller: Arc<ConnectionController<C>>,
    membership: Arc<Membership<C>>,
    state: Arc<SessionState>,
    bus: EventBus,
    settings: SyncSettings,
}

impl<C: Connector> StateSync<C> {
    /// Create the synchronizer. Call [`Self::run`] to start the driver.
    pub fn new(
        controller: Arc<ConnectionController<C>>,
        membership: Arc<Membership<C>>,
        state: Arc<SessionState>,
        settings: SyncSettings,
    ) -> Self {
        let bus = controller.bus().clone();
        Self {
            controller,
            membership,
            state,
            bus,
            settings,
        }
    }

    /// Fetch the full state of the joined game.
    ///
    /// Publishes `state_snapshot` when the snapshot is stored. A snapshot
    /// older than the one held is ignored and the current one returned.
    pub async fn request_snapshot(&self) -> SessionResult<Arc<GameSnapshot>> {
        let game_id = self.joined_game()?;
        let reply = self
            .controller
            .request(
                Message::SnapshotRequest(SnapshotRequest {
                    game_id: game_id.clone(),
                }),
                self.settings.snapshot_timeout,
                Operation::Snapshot,
            )
            .await?;

        let payload = match reply {
            Message::Snapshot(payload) => payload,
            Message::Error(e) => return Err(SessionError::Rejected(e.message)),
            other => {
                return Err(SessionError::Protocol(format!(
                    "unexpected reply to state:snapshot: {}",
                    other.tag().wire_name()
                )));
            }
        };
        self.ensure_still_in(&game_id)?;

        match self.state.replace_snapshot(GameSnapshot::from(payload)) {
            Some(snapshot) => {
                tracing::debug!("Snapshot of {game_id} at t={}", snapshot.timestamp);
                self.bus
                    .publish(&SessionEvent::StateSnapshot(Arc::clone(&snapshot)));
                Ok(snapshot)
            }
            None => {
                tracing::debug!("Ignoring stale snapshot of {game_id}");
                self.state
                    .snapshot()
                    .ok_or_else(|| SessionError::InvalidState("snapshot vanished".into()))
            }
        }
    }

    /// Ask for changes since the held snapshot and merge them.
    ///
    /// Returns `None` when the delta was not newer. Publishes `state_update`
    /// otherwise.
    pub async fn poll_delta(&self) -> SessionResult<Option<Arc<GameSnapshot>>> {
        let game_id = self.joined_game()?;
        let since = self
            .state
            .snapshot()
            .ok_or_else(|| SessionError::InvalidState("no snapshot to update".into()))?
            .timestamp;

        let reply = self
            .controller
            .request(
                Message::DeltaRequest(DeltaRequest {
                    game_id: game_id.clone(),
                    since,
                }),
                self.settings.delta_timeout,
                Operation::Delta,
            )
            .await?;

        let payload = match reply {
            Message::Delta(payload) => payload,
            Message::Error(e) => return Err(SessionError::Rejected(e.message)),
            other => {
                return Err(SessionError::Protocol(format!(
                    "unexpected reply to state:delta: {}",
                    other.tag().wire_name()
                )));
            }
        };
        self.ensure_still_in(&game_id)?;

        let merged = self.state.merge_delta(GameSnapshot::from(payload));
        if let Some(snapshot) = &merged {
            self.bus
                .publish(&SessionEvent::StateUpdate(Arc::clone(snapshot)));
        }
        Ok(merged)
    }

    /// Drive synchronization until `shutdown` turns true.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut connection = self.controller.subscribe_state();
        let mut membership = self.state.subscribe_membership();
        let stopped = async {
            let _ = shutdown.wait_for(|stop| *stop).await;
        };
        let driving = async {
            loop {
                self.synchronize(&mut connection, &mut membership).await;
            }
        };
        tokio::select! {
            _ = stopped => {}
            _ = driving => {}
        }
        tracing::debug!("State sync stopped");
    }

    /// One synchronized stretch: wait, full fetch, then poll until
    /// something relevant changes.
    async fn synchronize(
        &self,
        connection: &mut watch::Receiver<ConnectionState>,
        membership: &mut watch::Receiver<MembershipState>,
    ) {
        wait_until_ready(connection, membership).await;

        let epoch = self.controller.epoch();
        loop {
            match self.resync().await {
                Ok(()) => break,
                Err(e) => {
                    tracing::warn!("Full state fetch failed: {e}");
                    if !self.is_current(epoch) {
                        return;
                    }
                    tokio::time::sleep(self.settings.snapshot_retry).await;
                    if !self.is_current(epoch) {
                        return;
                    }
                }
            }
        }

        let joined = membership.borrow_and_update().clone();
        connection.mark_unchanged();
        if joined.epoch != epoch || !self.is_current(epoch) {
            return;
        }

        let period = self.settings.poll_interval;
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.poll_delta().await {
                        tracing::debug!("Skipping delta tick: {e}");
                    }
                }
                changed = connection.changed() => {
                    if changed.is_err() || *connection.borrow_and_update() != ConnectionState::Connected {
                        return;
                    }
                }
                changed = membership.changed() => {
                    if changed.is_err() || *membership.borrow_and_update() != joined {
                        return;
                    }
                }
            }
        }
    }

    async fn resync(&self) -> SessionResult<()> {
        self.membership.rejoin().await?;
        self.request_snapshot().await.map(|_| ())
    }

    fn is_current(&self, epoch: u64) -> bool {
        self.controller.state() == ConnectionState::Connected
            && self.controller.epoch() == epoch
            && self.state.membership().joined
    }

    fn joined_game(&self) -> SessionResult<String> {
        self.state
            .membership()
            .joined_game()
            .map(str::to_owned)
            .ok_or_else(|| SessionError::InvalidState("not in a game".into()))
    }

    fn ensure_still_in(&self, game_id: &str) -> SessionResult<()> {
        if self.state.membership().joined_game() == Some(game_id) {
            Ok(())
        } else {
            Err(SessionError::InvalidState(format!(
                "left {game_id} while waiting for its state"
            )))
        }
    }
}

/// Wait until the session is connected and in a game.
async fn wait_until_ready(
    connection: &mut watch::Receiver<ConnectionState>,
    membership: &mut watch::Receiver<MembershipState>,
) {
    loop {
        let connected = *connection.borrow_and_update() == ConnectionState::Connected;
        let joined = membership.borrow_and_update().joined;
        if connected && joined {
            return;
        }
        let closed = tokio::select! {
            changed = connection.changed() => changed.is_err(),
            changed = membership.changed() => changed.is_err(),
        };
        if closed {
            std::future::pending::<()>().await;
        }
    }
}
