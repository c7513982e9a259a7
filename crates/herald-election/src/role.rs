//! Peer roles and the transitions allowed between them

use serde::{Deserialize, Serialize};
use std::fmt;

/// Role a peer currently believes it holds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    /// Freshly constructed, nothing observed yet
    Unknown,

    /// Took part in a round whose outcome is still open
    Candidate,

    /// Follows a leader and watches its heartbeat
    Slave,

    /// Leader; emits heartbeats
    Master,
}

impl Role {
    /// Whether the state machine may move from `self` to `next`.
    ///
    /// Staying in the same role is always allowed. No role leads back to
    /// `Unknown`, and only a fresh peer enters `Candidate`.
    pub fn can_transition_to(self, next: Role) -> bool {
        if self == next {
            return true;
        }

        matches!(
            (self, next),
            (Role::Unknown, Role::Candidate)
                | (Role::Unknown, Role::Slave)
                | (Role::Unknown, Role::Master)
                | (Role::Candidate, Role::Slave)
                | (Role::Candidate, Role::Master)
                | (Role::Slave, Role::Master)
                | (Role::Master, Role::Slave)
        )
    }

    pub fn is_master(self) -> bool {
        self == Role::Master
    }
}

impl Default for Role {
    fn default() -> Self {
        Self::Unknown
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown => write!(f, "unknown"),
            Self::Candidate => write!(f, "candidate"),
            Self::Slave => write!(f, "slave"),
            Self::Master => write!(f, "master"),
        }
    }
}
