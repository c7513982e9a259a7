//! In-memory broadcast store shared by peers of one process

use super::{BroadcastStore, StoreChange};
use crate::error::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};

struct Subscriber {
    handle: u64,
    tx: mpsc::UnboundedSender<StoreChange>,
}

#[derive(Default)]
struct Shared {
    data: RwLock<HashMap<String, Value>>,
    subscribers: RwLock<Vec<Subscriber>>,
    next_handle: AtomicU64,
}

/// Shared medium; hand each peer its own [`MemoryStore`] via [`connect`](Self::connect)
#[derive(Clone, Default)]
pub struct MemoryBroadcast {
    shared: Arc<Shared>,
}

impl MemoryBroadcast {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store handle with its own writer identity
    pub fn connect(&self) -> MemoryStore {
        let handle = self.shared.next_handle.fetch_add(1, Ordering::Relaxed);
        MemoryStore {
            handle,
            shared: self.shared.clone(),
        }
    }

    /// Read a value without going through a peer handle
    pub async fn peek(&self, key: &str) -> Option<Value> {
        self.shared.data.read().await.get(key).cloned()
    }

    /// Number of live subscriptions
    pub async fn subscriber_count(&self) -> usize {
        let mut subscribers = self.shared.subscribers.write().await;
        subscribers.retain(|s| !s.tx.is_closed());
        subscribers.len()
    }
}

/// One peer's view of a [`MemoryBroadcast`].
///
/// Writes made through a handle are delivered to every other handle's
/// subscription, never to its own.
#[derive(Clone)]
pub struct MemoryStore {
    handle: u64,
    shared: Arc<Shared>,
}

impl MemoryStore {
    // Called with the data lock held so subscribers see changes in commit order.
    async fn notify(&self, key: &str, old_value: Option<Value>, new_value: Option<Value>) {
        let mut subscribers = self.shared.subscribers.write().await;
        subscribers.retain(|subscriber| {
            if subscriber.handle == self.handle {
                return !subscriber.tx.is_closed();
            }

            let change = StoreChange {
                key: key.to_string(),
                old_value: old_value.clone(),
                new_value: new_value.clone(),
            };
            subscriber.tx.send(change).is_ok()
        });
    }
}

#[async_trait]
impl BroadcastStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        let data = self.shared.data.read().await;
        Ok(data.get(key).cloned())
    }

    async fn set(&self, key: &str, value: Value) -> Result<()> {
        let mut data = self.shared.data.write().await;
        let old_value = data.insert(key.to_string(), value.clone());
        self.notify(key, old_value, Some(value)).await;
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let mut data = self.shared.data.write().await;
        if let Some(old_value) = data.remove(key) {
            self.notify(key, Some(old_value), None).await;
        }
        Ok(())
    }

    async fn subscribe(&self) -> Result<mpsc::UnboundedReceiver<StoreChange>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut subscribers = self.shared.subscribers.write().await;
        subscribers.push(Subscriber {
            handle: self.handle,
            tx,
        });
        Ok(rx)
    }
}
