//! Engine configuration.
//!
//! The live configuration sits in a `watch` channel owned by the engine so the
//! running scheduler and coordinator pick up changes without a restart.
//! [`SyncConfig::apply`] validates a [`ConfigPatch`] against the current value
//! and returns the merged result; on error the caller keeps the old config.

use crate::{conflict::ResolutionStrategy, error::Result, EntityType, Error};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

pub const MAX_BATCH_SIZE: usize = 500;
pub const MAX_RETRIES_LIMIT: u32 = 50;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncConfig {
    /// Period of the scheduler tick
    pub sync_interval_ms: u64,
    /// Retry budget given to new operations
    pub max_retries: u32,
    /// Base delay of the exponential retry backoff
    pub retry_delay_ms: u64,
    /// Cap of the retry backoff
    pub max_retry_delay_ms: u64,
    /// Operations pulled per batch
    pub batch_size: usize,
    /// Pause between batches
    pub batch_delay_ms: u64,
    /// Delay between regaining the network and draining
    pub reconnect_debounce_ms: u64,
    /// Writes closer than this count as concurrent
    pub concurrent_window_ms: u64,
    /// When false, local writes are never queued
    pub sync_enabled: bool,
    pub default_strategy: ResolutionStrategy,
    /// Per-entity-type overrides of `default_strategy`
    pub strategies: HashMap<EntityType, ResolutionStrategy>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            sync_interval_ms: 30_000,
            max_retries: 3,
            retry_delay_ms: 1_000,
            max_retry_delay_ms: 300_000,
            batch_size: 10,
            batch_delay_ms: 100,
            reconnect_debounce_ms: 1_500,
            concurrent_window_ms: 1_000,
            sync_enabled: true,
            default_strategy: ResolutionStrategy::LastWriteWins,
            strategies: HashMap::new(),
        }
    }
}

impl SyncConfig {
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 || self.batch_size > MAX_BATCH_SIZE {
            return Err(Error::InvalidConfig(format!(
                "batchSize must be between 1 and {MAX_BATCH_SIZE}, got {}",
                self.batch_size
            )));
        }
        if self.sync_interval_ms == 0 {
            return Err(Error::InvalidConfig("syncIntervalMs must be positive".into()));
        }
        if self.retry_delay_ms == 0 {
            return Err(Error::InvalidConfig("retryDelayMs must be positive".into()));
        }
        if self.max_retry_delay_ms < self.retry_delay_ms {
            return Err(Error::InvalidConfig(
                "maxRetryDelayMs must not be below retryDelayMs".into(),
            ));
        }
        if self.max_retries > MAX_RETRIES_LIMIT {
            return Err(Error::InvalidConfig(format!(
                "maxRetries must be at most {MAX_RETRIES_LIMIT}, got {}",
                self.max_retries
            )));
        }
        Ok(())
    }

    /// Merge a patch into a copy of this config and validate the result.
    pub fn apply(&self, patch: &ConfigPatch) -> Result<SyncConfig> {
        let mut next = self.clone();
        if let Some(v) = patch.sync_interval_ms {
            next.sync_interval_ms = v;
        }
        if let Some(v) = patch.max_retries {
            next.max_retries = v;
        }
        if let Some(v) = patch.retry_delay_ms {
            next.retry_delay_ms = v;
        }
        if let Some(v) = patch.max_retry_delay_ms {
            next.max_retry_delay_ms = v;
        }
        if let Some(v) = patch.batch_size {
            next.batch_size = v;
        }
        if let Some(v) = patch.batch_delay_ms {
            next.batch_delay_ms = v;
        }
        if let Some(v) = patch.reconnect_debounce_ms {
            next.reconnect_debounce_ms = v;
        }
        if let Some(v) = patch.concurrent_window_ms {
            next.concurrent_window_ms = v;
        }
        if let Some(v) = patch.sync_enabled {
            next.sync_enabled = v;
        }
        if let Some(v) = patch.default_strategy {
            next.default_strategy = v;
        }
        if let Some(overrides) = &patch.strategies {
            next.strategies.extend(overrides.iter().map(|(k, v)| (*k, *v)));
        }
        next.validate()?;
        Ok(next)
    }

    /// Strategy for one entity type.
    pub fn strategy_for(&self, entity_type: EntityType) -> ResolutionStrategy {
        self.strategies
            .get(&entity_type)
            .copied()
            .unwrap_or(self.default_strategy)
    }

    /// Delay before the next attempt of an operation that has failed
    /// `retry_count` times: `retryDelayMs * 2^(retryCount - 1)`, capped.
    pub fn backoff_ms(&self, retry_count: u32) -> u64 {
        let exponent = retry_count.saturating_sub(1).min(63);
        self.retry_delay_ms
            .saturating_mul(1u64 << exponent)
            .min(self.max_retry_delay_ms)
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_millis(self.sync_interval_ms)
    }

    pub fn batch_delay(&self) -> Duration {
        Duration::from_millis(self.batch_delay_ms)
    }

    pub fn reconnect_debounce(&self) -> Duration {
        Duration::from_millis(self.reconnect_debounce_ms)
    }
}

/// Partial update of [`SyncConfig`]. Absent fields keep their value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigPatch {
    pub sync_interval_ms: Option<u64>,
    pub max_retries: Option<u32>,
    pub retry_delay_ms: Option<u64>,
    pub max_retry_delay_ms: Option<u64>,
    pub batch_size: Option<usize>,
    pub batch_delay_ms: Option<u64>,
    pub reconnect_debounce_ms: Option<u64>,
    pub concurrent_window_ms: Option<u64>,
    pub sync_enabled: Option<bool>,
    pub default_strategy: Option<ResolutionStrategy>,
    pub strategies: Option<HashMap<EntityType, ResolutionStrategy>>,
}
