//! Application-facing handle and the per-peer event loop

use crate::config::ElectionConfig;
use crate::error::{ElectionError, Result};
use crate::events::{ElectionEvent, EventName, ListenerRegistry};
use crate::identity::PeerId;
use crate::node::ElectionNode;
use crate::role::Role;
use crate::store::{BroadcastStore, StoreChange, StoreKeys};
use crate::timer::TimerFired;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

/// Requests from the application to the event loop
#[derive(Debug)]
enum Command {
    StartElection,
    Resign,
}

/// A participant in leader election.
///
/// Construction never fails. Register listeners with [`on`](Self::on) before
/// calling [`start`](Self::start) to see the first role change.
///
/// ```no_run
/// use herald_election::{ElectionConfig, EventName, MemoryBroadcast, Peer};
/// use std::sync::Arc;
///
/// # async fn demo() {
/// let hub = MemoryBroadcast::new();
/// let mut peer = Peer::new(ElectionConfig::default(), Some(Arc::new(hub.connect())));
/// peer.on(EventName::WonElection, |event| {
///     println!("{} is now master", event.peer_id);
///     Ok(())
/// })
/// .await;
/// peer.start();
/// # }
/// ```
pub struct Peer {
    id: PeerId,
    heartbeat_offset: Duration,
    keys: StoreKeys,
    store: Option<Arc<dyn BroadcastStore>>,
    listeners: Arc<ListenerRegistry>,
    role_rx: watch::Receiver<Role>,
    command_tx: mpsc::UnboundedSender<Command>,
    pending: Option<Pending>,
    task: Option<JoinHandle<()>>,
}

struct Pending {
    node: ElectionNode,
    command_rx: mpsc::UnboundedReceiver<Command>,
    timer_rx: mpsc::UnboundedReceiver<TimerFired>,
}

impl Peer {
    /// Create a peer with a random id. `None` means no broadcast store is
    /// available and the peer will run as a solo master.
    pub fn new(config: ElectionConfig, store: Option<Arc<dyn BroadcastStore>>) -> Self {
        Self::with_id(PeerId::new(), config, store)
    }

    pub fn with_id(
        id: PeerId,
        config: ElectionConfig,
        store: Option<Arc<dyn BroadcastStore>>,
    ) -> Self {
        let config = match config.validate() {
            Ok(()) => config,
            Err(e) => {
                tracing::warn!(peer = %id, "Invalid election config, using defaults: {}", e);
                ElectionConfig::default()
            }
        };

        let listeners = Arc::new(ListenerRegistry::new());
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (timer_tx, timer_rx) = mpsc::unbounded_channel();
        let node = ElectionNode::new(id, config, store.clone(), listeners.clone(), timer_tx);

        Self {
            id,
            heartbeat_offset: node.heartbeat_offset(),
            keys: node.keys().clone(),
            store,
            listeners,
            role_rx: node.watch_role(),
            command_tx,
            pending: Some(Pending {
                node,
                command_rx,
                timer_rx,
            }),
            task: None,
        }
    }

    /// Create and immediately start a peer
    pub fn spawn(config: ElectionConfig, store: Option<Arc<dyn BroadcastStore>>) -> Self {
        let mut peer = Self::new(config, store);
        peer.start();
        peer
    }

    /// Launch the event loop. Must be called from within a tokio runtime.
    /// Calling it again has no effect.
    pub fn start(&mut self) {
        if let Some(pending) = self.pending.take() {
            self.task = Some(tokio::spawn(run(pending)));
        }
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    pub fn role(&self) -> Role {
        *self.role_rx.borrow()
    }

    pub fn is_master(&self) -> bool {
        self.role().is_master()
    }

    /// Per-peer heartbeat offset drawn at construction
    pub fn heartbeat_offset(&self) -> Duration {
        self.heartbeat_offset
    }

    /// Watch role changes
    pub fn watch_role(&self) -> watch::Receiver<Role> {
        self.role_rx.clone()
    }

    /// Register a listener; handlers run in registration order on the peer's
    /// event loop and must not block
    pub async fn on<F>(&self, event: EventName, handler: F)
    where
        F: Fn(&ElectionEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.listeners.on(event, handler).await;
    }

    /// Deliver an event to this peer's listeners; returns how many failed
    pub async fn emit(&self, event: EventName, extra: Map<String, Value>) -> usize {
        self.listeners
            .emit(ElectionEvent::new(event, self.id, extra))
            .await
    }

    /// Async stream of every emitted event
    pub fn subscribe(&self) -> broadcast::Receiver<ElectionEvent> {
        self.listeners.subscribe()
    }

    /// Ask the peer to open a new round
    pub fn start_election(&self) -> Result<()> {
        self.send(Command::StartElection)
    }

    /// Voluntarily give up mastership
    pub fn resign(&self) -> Result<()> {
        self.send(Command::Resign)
    }

    /// Current leader according to the store
    pub async fn leader(&self) -> Result<Option<PeerId>> {
        let Some(store) = &self.store else {
            return Ok(self.is_master().then_some(self.id));
        };

        match store.get(&self.keys.current_leader).await? {
            Some(value) => Ok(Some(PeerId::from_value(&value)?)),
            None => Ok(None),
        }
    }

    /// Wait until the peer holds `role`, or give up after `timeout`
    pub async fn wait_for_role(&self, role: Role, timeout: Duration) -> Result<()> {
        let mut rx = self.role_rx.clone();
        let wait = async {
            loop {
                if *rx.borrow_and_update() == role {
                    return Ok(());
                }
                if rx.changed().await.is_err() {
                    return Err(ElectionError::Shutdown);
                }
            }
        };

        tokio::time::timeout(timeout, wait).await.map_err(|_| {
            ElectionError::Generic(anyhow::anyhow!("Timed out waiting for role {}", role))
        })?
    }

    /// Stop the event loop and every timer without resigning, as if the
    /// process had died
    pub async fn shutdown(&mut self) {
        self.pending = None;
        if let Some(task) = self.task.take() {
            task.abort();
            let _ = task.await;
        }
        tracing::info!(peer = %self.id, "Peer shut down");
    }

    fn send(&self, command: Command) -> Result<()> {
        self.command_tx
            .send(command)
            .map_err(|_| ElectionError::Shutdown)
    }
}

impl Drop for Peer {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn run(pending: Pending) {
    let Pending {
        mut node,
        mut command_rx,
        mut timer_rx,
    } = pending;

    let mut changes = subscribe(&mut node).await;
    node.bootstrap().await;

    loop {
        tokio::select! {
            change = next_change(&mut changes) => match change {
                Some(change) => node.handle_change(change).await,
                None => {
                    tracing::warn!(peer = %node.id(), "Store subscription closed");
                    changes = None;
                }
            },
            Some(fired) = timer_rx.recv() => node.handle_timer(fired).await,
            command = command_rx.recv() => match command {
                Some(Command::StartElection) => node.start_election().await,
                Some(Command::Resign) => node.resign().await,
                None => break,
            },
        }
    }

    node.halt();
}

async fn subscribe(node: &mut ElectionNode) -> Option<mpsc::UnboundedReceiver<StoreChange>> {
    let store = node.store_handle()?;
    match store.subscribe().await {
        Ok(rx) => Some(rx),
        Err(e) => {
            tracing::warn!(peer = %node.id(), "Broadcast store unavailable, running solo: {}", e);
            node.detach_store();
            None
        }
    }
}

async fn next_change(
    changes: &mut Option<mpsc::UnboundedReceiver<StoreChange>>,
) -> Option<StoreChange> {
    match changes {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
