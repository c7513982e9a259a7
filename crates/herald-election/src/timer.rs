//! Cancellable protocol timers
//!
//! Each timer runs as a small tokio task that reports back through the peer's
//! queue. Expiries carry a generation number; an expiry whose generation no
//! longer matches the armed slot was cancelled or replaced and is dropped.

use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

/// The four independent timers of a peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// Master: periodic heartbeat write
    HeartbeatEmit,

    /// Slave: leader presumed dead when this fires
    HeartbeatTimeout,

    /// Initiator: close the round and write the leader
    RoundConclusion,

    /// Voter: restart the election if no leader emerged
    Sanity,
}

/// Expiry report sent to the peer's queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerFired {
    pub kind: TimerKind,
    pub generation: u64,
}

struct Slot {
    generation: u64,
    periodic: bool,
    handle: JoinHandle<()>,
}

pub struct Timers {
    tx: mpsc::UnboundedSender<TimerFired>,
    slots: HashMap<TimerKind, Slot>,
    next_generation: u64,
}

impl Timers {
    pub fn new(tx: mpsc::UnboundedSender<TimerFired>) -> Self {
        Self {
            tx,
            slots: HashMap::new(),
            next_generation: 0,
        }
    }

    /// Arm a one-shot timer, replacing any pending timer of the same kind
    pub fn schedule(&mut self, kind: TimerKind, delay: Duration) {
        let generation = self.bump();
        let tx = self.tx.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(TimerFired { kind, generation });
        });
        self.install(kind, generation, false, handle);
    }

    /// Arm a repeating timer whose first tick is one `period` from now
    pub fn schedule_interval(&mut self, kind: TimerKind, period: Duration) {
        let generation = self.bump();
        let tx = self.tx.clone();
        let handle = tokio::spawn(async move {
            // A first tick past the clock's range never fires.
            let Some(start) = Instant::now().checked_add(period) else {
                return;
            };
            let mut ticker = interval_at(start, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if tx.send(TimerFired { kind, generation }).is_err() {
                    break;
                }
            }
        });
        self.install(kind, generation, true, handle);
    }

    pub fn cancel(&mut self, kind: TimerKind) {
        if let Some(slot) = self.slots.remove(&kind) {
            slot.handle.abort();
        }
    }

    pub fn cancel_all(&mut self) {
        for (_, slot) in self.slots.drain() {
            slot.handle.abort();
        }
    }

    pub fn is_armed(&self, kind: TimerKind) -> bool {
        self.slots.contains_key(&kind)
    }

    /// Whether `fired` belongs to the currently armed timer. A one-shot timer
    /// is disarmed by accepting its expiry.
    pub fn accept(&mut self, fired: TimerFired) -> bool {
        match self.slots.get(&fired.kind) {
            Some(slot) if slot.generation == fired.generation => {
                if !slot.periodic {
                    self.slots.remove(&fired.kind);
                }
                true
            }
            _ => false,
        }
    }

    fn bump(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }

    fn install(&mut self, kind: TimerKind, generation: u64, periodic: bool, handle: JoinHandle<()>) {
        let slot = Slot {
            generation,
            periodic,
            handle,
        };
        if let Some(previous) = self.slots.insert(kind, slot) {
            previous.handle.abort();
        }
    }
}

impl Drop for Timers {
    fn drop(&mut self) {
        self.cancel_all();
    }
}
