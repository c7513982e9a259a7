//! Peer identity

use crate::error::{ElectionError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Unique, totally ordered identifier of a peer.
///
/// Ids are random v4 UUIDs compared by their 128-bit value, so the bully tally
/// (`max`) is well defined. Two peers drawing the same id is possible in
/// principle and ignored in practice.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(Uuid);

impl PeerId {
    /// Create a new random peer ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create a peer ID with a fixed numeric value
    pub fn from_u128(value: u128) -> Self {
        Self(Uuid::from_u128(value))
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    /// Encode as a broadcast store value
    pub fn to_value(&self) -> Value {
        Value::String(self.0.to_string())
    }

    /// Decode from a broadcast store value
    pub fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::String(s) => s.parse(),
            other => Err(ElectionError::invalid_peer_id(other.to_string())),
        }
    }
}

impl FromStr for PeerId {
    type Err = ElectionError;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| ElectionError::invalid_peer_id(format!("{}: {}", s, e)))
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Default for PeerId {
    fn default() -> Self {
        Self::new()
    }
}
