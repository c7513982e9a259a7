//! Broadcast key-value store abstraction
//!
//! Peers never talk to each other directly. Every write goes to a shared store
//! that notifies all *other* subscribers of the change; the writer itself is
//! never notified of its own writes. The election protocol is shaped around
//! that asymmetry.

pub mod memory;

use crate::error::Result;
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

pub use memory::{MemoryBroadcast, MemoryStore};

/// Trait for the shared store peers coordinate through
#[async_trait]
pub trait BroadcastStore: Send + Sync {
    /// Read a value
    async fn get(&self, key: &str) -> Result<Option<Value>>;

    /// Write a value; every other subscriber observes the change
    async fn set(&self, key: &str, value: Value) -> Result<()>;

    /// Remove a value; every other subscriber observes the change
    async fn remove(&self, key: &str) -> Result<()>;

    /// Receive changes made by other writers
    async fn subscribe(&self) -> Result<mpsc::UnboundedReceiver<StoreChange>>;
}

/// Change notification delivered to subscribers
#[derive(Debug, Clone, PartialEq)]
pub struct StoreChange {
    pub key: String,
    pub old_value: Option<Value>,
    pub new_value: Option<Value>,
}

/// The four well-known keys of one coordination group
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreKeys {
    prefix: String,
    pub heartbeat: String,
    pub election: String,
    pub election_start: String,
    pub current_leader: String,
}

impl StoreKeys {
    pub fn new(namespace: &str) -> Self {
        let prefix = format!("{}.", namespace);
        Self {
            heartbeat: format!("{}heartbeat", prefix),
            election: format!("{}election", prefix),
            election_start: format!("{}electionStart", prefix),
            current_leader: format!("{}currentLeader", prefix),
            prefix,
        }
    }

    /// Whether `key` belongs to this group's namespace
    pub fn owns(&self, key: &str) -> bool {
        key.starts_with(&self.prefix)
    }
}
