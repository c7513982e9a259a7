//! Role-change events and the local listener registry

use crate::identity::PeerId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};

/// Events a peer emits to application code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EventName {
    /// This peer became master
    WonElection,

    /// This peer became slave
    LostElection,
}

impl EventName {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::WonElection => "wonElection",
            Self::LostElection => "lostElection",
        }
    }
}

impl fmt::Display for EventName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload handed to listeners. Serializes as `{ "eventName": .., ...extra }`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ElectionEvent {
    pub event_name: EventName,
    #[serde(skip)]
    pub peer_id: PeerId,
    #[serde(skip)]
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ElectionEvent {
    pub fn new(event_name: EventName, peer_id: PeerId, extra: Map<String, Value>) -> Self {
        Self {
            event_name,
            peer_id,
            timestamp: Utc::now(),
            extra,
        }
    }

    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Listener callback. Errors and panics are contained to the failing handler.
pub type Handler = Arc<dyn Fn(&ElectionEvent) -> anyhow::Result<()> + Send + Sync>;

/// Per-peer mapping from event name to handlers in registration order
pub struct ListenerRegistry {
    handlers: RwLock<HashMap<EventName, Vec<Handler>>>,
    event_tx: broadcast::Sender<ElectionEvent>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        let (event_tx, _) = broadcast::channel(256);
        Self {
            handlers: RwLock::new(HashMap::new()),
            event_tx,
        }
    }

    /// Register a handler; handlers for one event run in registration order
    pub async fn on<F>(&self, event: EventName, handler: F)
    where
        F: Fn(&ElectionEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let mut handlers = self.handlers.write().await;
        handlers.entry(event).or_default().push(Arc::new(handler));
    }

    /// Async view of every emitted event
    pub fn subscribe(&self) -> broadcast::Receiver<ElectionEvent> {
        self.event_tx.subscribe()
    }

    pub async fn listener_count(&self, event: EventName) -> usize {
        self.handlers
            .read()
            .await
            .get(&event)
            .map_or(0, |handlers| handlers.len())
    }

    /// Deliver `event` to every registered handler. Returns how many failed.
    pub async fn emit(&self, event: ElectionEvent) -> usize {
        // Snapshot so handlers may register further listeners without deadlocking.
        let handlers: Vec<Handler> = self
            .handlers
            .read()
            .await
            .get(&event.event_name)
            .cloned()
            .unwrap_or_default();

        let mut failed = 0;
        for (index, handler) in handlers.iter().enumerate() {
            match catch_unwind(AssertUnwindSafe(|| handler(&event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    failed += 1;
                    tracing::warn!(event = %event.event_name, index, "Listener failed: {:#}", e);
                }
                Err(_) => {
                    failed += 1;
                    tracing::warn!(event = %event.event_name, index, "Listener panicked");
                }
            }
        }

        let _ = self.event_tx.send(event);
        failed
    }
}

impl Default for ListenerRegistry {
    fn default() -> Self {
        Self::new()
    }
}
