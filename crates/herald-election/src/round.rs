//! Election round records kept in the broadcast store
//!
//! The candidate list is appended with a plain read-modify-write. Two peers
//! voting at the same time can each read the same list and the later write
//! silently drops the earlier vote. The protocol tolerates this: only the
//! maximum surviving candidate matters.

use crate::config::millis;
use crate::error::Result;
use crate::identity::PeerId;
use crate::store::{BroadcastStore, StoreKeys};
use serde_json::Value;
use std::time::Duration;

/// Snapshot of the round currently stored under the election keys
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ElectionRound {
    pub candidates: Vec<PeerId>,
    pub started_at: Option<i64>,
}

impl ElectionRound {
    /// Read the round, or `None` when no candidate list is stored
    pub async fn read(store: &dyn BroadcastStore, keys: &StoreKeys) -> Result<Option<Self>> {
        let Some(value) = store.get(&keys.election).await? else {
            return Ok(None);
        };

        let started_at = store
            .get(&keys.election_start)
            .await?
            .and_then(|v| v.as_i64());

        Ok(Some(Self {
            candidates: decode_candidates(&value),
            started_at,
        }))
    }

    /// Append `id` to the stored candidate list. Not atomic across peers.
    pub async fn append_vote(
        store: &dyn BroadcastStore,
        keys: &StoreKeys,
        id: PeerId,
    ) -> Result<Vec<PeerId>> {
        let mut candidates = match store.get(&keys.election).await? {
            Some(value) => decode_candidates(&value),
            None => Vec::new(),
        };
        candidates.push(id);
        store.set(&keys.election, encode_candidates(&candidates)).await?;
        Ok(candidates)
    }

    /// Delete both round keys
    pub async fn clear(store: &dyn BroadcastStore, keys: &StoreKeys) -> Result<()> {
        store.remove(&keys.election).await?;
        store.remove(&keys.election_start).await?;
        Ok(())
    }

    /// Whether the round was started less than `election_time` before `now_ms`
    pub fn is_open(&self, now_ms: i64, election_time: Duration) -> bool {
        match self.started_at {
            Some(started) => now_ms.saturating_sub(started) < millis(election_time),
            None => false,
        }
    }

    pub fn winner(&self) -> Option<PeerId> {
        tally(&self.candidates)
    }
}

/// Bully tally: the largest id wins. Duplicates are harmless.
pub fn tally(candidates: &[PeerId]) -> Option<PeerId> {
    candidates.iter().copied().max()
}

pub fn encode_candidates(candidates: &[PeerId]) -> Value {
    Value::Array(candidates.iter().map(PeerId::to_value).collect())
}

/// Decode a stored candidate list, skipping entries that are not peer ids
pub fn decode_candidates(value: &Value) -> Vec<PeerId> {
    let Some(entries) = value.as_array() else {
        tracing::warn!("Ignoring malformed candidate list: {}", value);
        return Vec::new();
    };

    entries
        .iter()
        .filter_map(|entry| match PeerId::from_value(entry) {
            Ok(id) => Some(id),
            Err(e) => {
                tracing::warn!("Skipping candidate: {}", e);
                None
            }
        })
        .collect()
}
