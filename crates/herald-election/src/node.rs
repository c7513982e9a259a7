//! Election state machine of a single peer
//!
//! `ElectionNode` owns the role, the timers and the store handle of one peer.
//! It never runs concurrently with itself: the [`Peer`](crate::Peer) actor
//! feeds it store notifications, timer expiries and application commands one
//! at a time.
//!
//! Role transitions:
//!
//! ```text
//! Unknown ──► Candidate ──► Slave ◄──► Master
//!    │                         ▲         ▲
//!    └─────────────────────────┴─────────┘
//! ```

use crate::config::{millis, ElectionConfig};
use crate::error::{ElectionError, Result};
use crate::events::{ElectionEvent, EventName, ListenerRegistry};
use crate::identity::PeerId;
use crate::role::Role;
use crate::round::ElectionRound;
use crate::store::{BroadcastStore, StoreChange, StoreKeys};
use crate::timer::{TimerFired, TimerKind, Timers};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

// Protocol steps are INFO when the peer runs with `debug`, DEBUG otherwise.
macro_rules! step {
    ($node:expr, $($arg:tt)+) => {
        if $node.config.debug {
            tracing::info!(peer = %$node.id, $($arg)+)
        } else {
            tracing::debug!(peer = %$node.id, $($arg)+)
        }
    };
}

pub struct ElectionNode {
    id: PeerId,
    config: ElectionConfig,
    heartbeat_offset: Duration,
    keys: StoreKeys,
    store: Option<Arc<dyn BroadcastStore>>,
    role: Role,
    role_tx: watch::Sender<Role>,
    listeners: Arc<ListenerRegistry>,
    timers: Timers,
}

impl ElectionNode {
    pub fn new(
        id: PeerId,
        config: ElectionConfig,
        store: Option<Arc<dyn BroadcastStore>>,
        listeners: Arc<ListenerRegistry>,
        timer_tx: mpsc::UnboundedSender<TimerFired>,
    ) -> Self {
        let heartbeat_offset = config.draw_heartbeat_offset();
        let keys = StoreKeys::new(&config.namespace);
        let (role_tx, _) = watch::channel(Role::Unknown);

        Self {
            id,
            config,
            heartbeat_offset,
            keys,
            store,
            role: Role::Unknown,
            role_tx,
            listeners,
            timers: Timers::new(timer_tx),
        }
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn config(&self) -> &ElectionConfig {
        &self.config
    }

    /// Effective heartbeat offset drawn for this peer
    pub fn heartbeat_offset(&self) -> Duration {
        self.heartbeat_offset
    }

    pub fn keys(&self) -> &StoreKeys {
        &self.keys
    }

    pub fn watch_role(&self) -> watch::Receiver<Role> {
        self.role_tx.subscribe()
    }

    pub fn timer_armed(&self, kind: TimerKind) -> bool {
        self.timers.is_armed(kind)
    }

    pub fn store_handle(&self) -> Option<Arc<dyn BroadcastStore>> {
        self.store.clone()
    }

    /// Drop the store; the peer continues in solo mode
    pub fn detach_store(&mut self) {
        self.store = None;
    }

    /// Decide the initial role from what is already in the store
    pub async fn bootstrap(&mut self) {
        step!(self, heartbeat_offset_ms = self.heartbeat_offset.as_millis() as u64, "Peer starting");

        let Some(store) = self.store.clone() else {
            step!(self, "No broadcast store, running solo");
            self.become_master().await;
            return;
        };

        match self.inspect(store.as_ref()).await {
            Ok(Startup::JoinRound) => {
                step!(self, "Ongoing election, casting vote");
                self.cast_vote().await;
            }
            Ok(Startup::FollowLeader) => {
                step!(self, "Found fresh heartbeat");
                self.become_slave(None).await;
            }
            Ok(Startup::Elect) => self.start_election().await,
            Err(e) => {
                tracing::warn!(peer = %self.id, "Failed to inspect store: {}", e);
                self.start_election().await;
            }
        }
    }

    async fn inspect(&self, store: &dyn BroadcastStore) -> Result<Startup> {
        let now = now_millis();

        if let Some(round) = ElectionRound::read(store, &self.keys).await? {
            if round.is_open(now, self.config.election_time) {
                return Ok(Startup::JoinRound);
            }
        }

        let last_heartbeat = store
            .get(&self.keys.heartbeat)
            .await?
            .and_then(|v| v.as_i64())
            .unwrap_or(0);
        if now.saturating_sub(last_heartbeat) < millis(self.config.heartbeat_ttl) {
            return Ok(Startup::FollowLeader);
        }

        Ok(Startup::Elect)
    }

    /// Open a fresh round. Safe to call repeatedly; the latest call's
    /// conclusion timer replaces any earlier one.
    pub async fn start_election(&mut self) {
        step!(self, "Initiating election");

        let Some(store) = self.store.clone() else {
            self.become_master().await;
            return;
        };

        if let Err(e) = self.open_round(store.as_ref()).await {
            tracing::warn!(peer = %self.id, "Failed to open election round: {}", e);
            self.timers.schedule(TimerKind::Sanity, self.sanity_delay());
        }
        self.timers
            .schedule(TimerKind::RoundConclusion, self.config.election_time);
    }

    async fn open_round(&mut self, store: &dyn BroadcastStore) -> Result<()> {
        store.remove(&self.keys.current_leader).await?;
        store.remove(&self.keys.heartbeat).await?;
        // Start from an empty list so every peer observes a new round.
        ElectionRound::clear(store, &self.keys).await?;
        // Our own write is never echoed back, so the initiator votes here.
        self.cast_vote().await;
        store
            .set(&self.keys.election_start, Value::from(now_millis()))
            .await?;
        Ok(())
    }

    /// Append this peer to the candidate list and arm the sanity timer
    pub async fn cast_vote(&mut self) {
        self.timers.cancel(TimerKind::Sanity);
        step!(self, "Casting vote");

        if let Some(store) = self.store.clone() {
            if let Err(e) = ElectionRound::append_vote(store.as_ref(), &self.keys, self.id).await {
                tracing::warn!(peer = %self.id, "Failed to cast vote: {}", e);
            }
        }

        if self.role == Role::Unknown {
            self.transition(Role::Candidate);
        }
        self.timers.schedule(TimerKind::Sanity, self.sanity_delay());
    }

    /// Close the round: tally, publish the leader, clear the round keys
    pub async fn conclude_round(&mut self) {
        let Some(store) = self.store.clone() else {
            self.become_master().await;
            return;
        };

        let candidates = match ElectionRound::read(store.as_ref(), &self.keys).await {
            Ok(Some(round)) if !round.candidates.is_empty() => round.candidates,
            Ok(_) => vec![self.id],
            Err(e) => {
                tracing::warn!(peer = %self.id, "Failed to read round, standing alone: {}", e);
                vec![self.id]
            }
        };
        let winner = crate::round::tally(&candidates).unwrap_or(self.id);
        step!(self, %winner, candidates = candidates.len(), "Election concluded");

        if let Err(e) = self.publish_winner(store.as_ref(), winner).await {
            tracing::warn!(peer = %self.id, "Failed to publish election result: {}", e);
        }

        // The store will not tell us about our own result.
        if winner == self.id {
            self.become_master().await;
        } else {
            self.become_slave(Some(winner)).await;
        }
    }

    async fn publish_winner(&self, store: &dyn BroadcastStore, winner: PeerId) -> Result<()> {
        store.set(&self.keys.current_leader, winner.to_value()).await?;
        ElectionRound::clear(store, &self.keys).await
    }

    pub async fn become_master(&mut self) {
        self.timers.cancel(TimerKind::HeartbeatTimeout);
        self.timers.cancel(TimerKind::Sanity);
        self.timers
            .schedule_interval(TimerKind::HeartbeatEmit, self.config.heartbeat_interval());

        if self.transition(Role::Master) {
            step!(self, "Became master");
            self.emit(EventName::WonElection, Some(self.id)).await;
        }
    }

    pub async fn become_slave(&mut self, leader: Option<PeerId>) {
        self.timers.cancel(TimerKind::HeartbeatEmit);
        self.arm_heartbeat_timeout();

        if self.transition(Role::Slave) {
            step!(self, leader = ?leader, "Became slave");
            self.emit(EventName::LostElection, leader).await;
        }
    }

    /// Give up mastership. Followers notice the silence on their own.
    pub async fn resign(&mut self) {
        if !self.role.is_master() {
            step!(self, role = %self.role, "Not master, nothing to resign");
            return;
        }

        step!(self, "Resigning");
        self.become_slave(None).await;
    }

    /// React to a change another peer made in the store
    pub async fn handle_change(&mut self, change: StoreChange) {
        if !self.keys.owns(&change.key) {
            return;
        }
        tracing::trace!(peer = %self.id, key = %change.key, "Store change");

        if change.key == self.keys.election && change.old_value.is_none() && change.new_value.is_some() {
            self.timers.cancel(TimerKind::HeartbeatTimeout);
            self.timers.cancel(TimerKind::Sanity);
            self.cast_vote().await;
        }

        if change.key == self.keys.current_leader {
            let leader = change.new_value.as_ref().and_then(|value| {
                PeerId::from_value(value)
                    .map_err(|e| tracing::warn!(peer = %self.id, "Unreadable leader record: {}", e))
                    .ok()
            });

            if leader == Some(self.id) {
                self.become_master().await;
            } else {
                self.become_slave(leader).await;
            }
        }

        if change.key == self.keys.heartbeat && !self.role.is_master() {
            self.arm_heartbeat_timeout();
        }
    }

    /// React to a timer expiry; stale expiries are ignored
    pub async fn handle_timer(&mut self, fired: TimerFired) {
        if !self.timers.accept(fired) {
            tracing::trace!(peer = %self.id, kind = ?fired.kind, "Ignoring stale timer");
            return;
        }

        match fired.kind {
            TimerKind::HeartbeatEmit => self.emit_heartbeat().await,
            TimerKind::HeartbeatTimeout => {
                step!(self, "Leader heartbeat timed out");
                self.start_election().await;
            }
            TimerKind::RoundConclusion => self.conclude_round().await,
            TimerKind::Sanity => self.check_sanity().await,
        }
    }

    /// Stop every timer. Used when the peer goes away.
    pub fn halt(&mut self) {
        self.timers.cancel_all();
    }

    async fn emit_heartbeat(&mut self) {
        let Some(store) = self.store.clone() else {
            return;
        };

        tracing::trace!(peer = %self.id, "Heartbeat");
        if let Err(e) = store.set(&self.keys.heartbeat, Value::from(now_millis())).await {
            tracing::warn!(peer = %self.id, "Failed to write heartbeat: {}", e);
        }
    }

    async fn check_sanity(&mut self) {
        let Some(store) = self.store.clone() else {
            return;
        };

        match store.get(&self.keys.current_leader).await {
            Ok(Some(_)) => {}
            Ok(None) => {
                step!(self, "No leader after election window, restarting election");
                self.start_election().await;
            }
            Err(e) => {
                tracing::warn!(peer = %self.id, "Sanity check failed, restarting election: {}", e);
                self.start_election().await;
            }
        }
    }

    fn arm_heartbeat_timeout(&mut self) {
        self.timers.schedule(
            TimerKind::HeartbeatTimeout,
            self.config.heartbeat_ttl.saturating_add(self.heartbeat_offset),
        );
    }

    fn sanity_delay(&self) -> Duration {
        self.config.election_time.saturating_add(self.heartbeat_offset)
    }

    /// Move to `next`; returns whether the role actually changed
    fn transition(&mut self, next: Role) -> bool {
        if self.role == next {
            return false;
        }

        if !self.role.can_transition_to(next) {
            let err = ElectionError::invalid_transition(self.role, next);
            tracing::error!(peer = %self.id, "{}", err);
            return false;
        }

        tracing::debug!(peer = %self.id, from = %self.role, to = %next, "Role change");
        self.role = next;
        self.role_tx.send_replace(next);
        true
    }

    async fn emit(&self, event: EventName, leader: Option<PeerId>) {
        let mut extra = Map::new();
        extra.insert("peerId".to_string(), self.id.to_value());
        if let Some(leader) = leader {
            extra.insert("leader".to_string(), leader.to_value());
        }

        let failed = self
            .listeners
            .emit(ElectionEvent::new(event, self.id, extra))
            .await;
        if failed > 0 {
            tracing::warn!(peer = %self.id, %event, failed, "Some listeners failed");
        }
    }
}

enum Startup {
    JoinRound,
    FollowLeader,
    Elect,
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
