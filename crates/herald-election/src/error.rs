//! Election error types

use crate::role::Role;

/// Result type for election operations
pub type Result<T> = std::result::Result<T, ElectionError>;

/// Election-specific error types
#[derive(Debug, thiserror::Error)]
pub enum ElectionError {
    #[error("Store error: {0}")]
    Store(String),

    #[error("Broadcast store unavailable")]
    StoreUnavailable,

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Invalid peer id: {0}")]
    InvalidPeerId(String),

    #[error("Invalid role transition: {from} -> {to}")]
    InvalidTransition { from: Role, to: Role },

    #[error("Peer has shut down")]
    Shutdown,

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Generic error: {0}")]
    Generic(#[from] anyhow::Error),
}

impl ElectionError {
    pub fn store<T: Into<String>>(msg: T) -> Self {
        Self::Store(msg.into())
    }

    pub fn configuration<T: Into<String>>(msg: T) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn invalid_peer_id<T: Into<String>>(msg: T) -> Self {
        Self::InvalidPeerId(msg.into())
    }

    pub fn invalid_transition(from: Role, to: Role) -> Self {
        Self::InvalidTransition { from, to }
    }
}

impl From<toml::de::Error> for ElectionError {
    fn from(err: toml::de::Error) -> Self {
        Self::configuration(format!("Failed to parse config: {}", err))
    }
}

impl From<toml::ser::Error> for ElectionError {
    fn from(err: toml::ser::Error) -> Self {
        Self::configuration(format!("Failed to serialize config: {}", err))
    }
}
