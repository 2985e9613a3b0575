//! Cumulative sync metrics.

use crate::{coordinator::DrainSummary, Timestamp};
use serde::{Deserialize, Serialize};

/// Weight of the previous average in the drain-duration EMA.
const EMA_DECAY: f64 = 0.8;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncMetrics {
    /// Operations attempted against the remote
    pub total_operations: u64,
    pub successful_operations: u64,
    pub failed_operations: u64,
    /// Operations not yet confirmed by the remote (filled from the queue)
    pub pending_operations: u64,
    pub conflict_count: u64,
    /// Exponential moving average of drain duration
    pub average_sync_time_ms: f64,
    pub last_sync_at: Option<Timestamp>,
    /// Completed drain cycles
    pub drain_count: u64,
}

impl SyncMetrics {
    /// Fold one finished drain into the totals.
    pub fn record_drain(&mut self, summary: &DrainSummary) {
        self.total_operations += summary.attempted as u64;
        self.successful_operations += summary.succeeded as u64;
        self.failed_operations += summary.failed as u64;
        self.conflict_count += summary.conflicts as u64;

        let duration = summary.duration_ms as f64;
        self.average_sync_time_ms = if self.drain_count == 0 {
            duration
        } else {
            EMA_DECAY * self.average_sync_time_ms + (1.0 - EMA_DECAY) * duration
        };
        self.drain_count += 1;
        self.last_sync_at = Some(summary.finished_at);
    }
}
