//! Outbox status view: per-state counts for operators and drain checks.

use serde::{Deserialize, Serialize};

/// Number of outbox events per state. `failed` excludes dead letters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxCounts {
    pub pending: usize,
    pub processing: usize,
    pub processed: usize,
    pub failed: usize,
    pub dead: usize,
}

impl OutboxCounts {
    pub fn total(&self) -> usize {
        self.pending + self.processing + self.processed + self.failed + self.dead
    }

    /// Nothing left for the relay to do, short of an operator replay.
    pub fn is_drained(&self) -> bool {
        self.pending == 0 && self.processing == 0 && self.failed == 0
    }
}
