//! Herald leader election
//!
//! Elects a single master among peers that share nothing but a broadcast
//! key-value store: every write is observed by all other peers, never by the
//! writer. Peers run a bully-style round (the largest id wins), the master
//! proves liveness with periodic heartbeats, and followers start a new round
//! when the heartbeat goes quiet.

pub mod config;
pub mod error;
pub mod events;
pub mod identity;
pub mod node;
pub mod peer;
pub mod role;
pub mod round;
pub mod store;
pub mod timer;

pub use config::ElectionConfig;
pub use error::{ElectionError, Result};
pub use events::{ElectionEvent, EventName, ListenerRegistry};
pub use identity::PeerId;
pub use node::ElectionNode;
pub use peer::Peer;
pub use role::Role;
pub use round::ElectionRound;
pub use store::{BroadcastStore, MemoryBroadcast, MemoryStore, StoreChange, StoreKeys};
pub use timer::{TimerFired, TimerKind};
