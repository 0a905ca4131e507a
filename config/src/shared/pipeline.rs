use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::shared::ValidationError;

/// Timings and buffer sizes shared by every view pipeline.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct PipelineConfig {
    /// Interval between two listings of a stream's shards, in milliseconds.
    #[serde(default = "default_shard_poll_interval_ms")]
    pub shard_poll_interval_ms: u64,
    /// Maximum age of the newest record of a batch for the shard to be considered in sync,
    /// in milliseconds.
    #[serde(default = "default_in_sync_threshold_ms")]
    pub in_sync_threshold_ms: u64,
    /// Lower bound of the adaptive delay between two fetches of a shard, in milliseconds.
    #[serde(default = "default_min_poll_delay_ms")]
    pub min_poll_delay_ms: u64,
    /// Upper bound of the adaptive delay between two fetches of a shard, in milliseconds.
    #[serde(default = "default_max_poll_delay_ms")]
    pub max_poll_delay_ms: u64,
    /// Time to wait before restarting a failed pipeline, in milliseconds.
    #[serde(default = "default_restart_delay_ms")]
    pub restart_delay_ms: u64,
    /// Time a pipeline keeps running after its last subscriber left, in milliseconds.
    #[serde(default = "default_teardown_grace_ms")]
    pub teardown_grace_ms: u64,
    /// Capacity of the channel carrying row changes from shard consumers to the view.
    #[serde(default = "default_changes_buffer_size")]
    pub changes_buffer_size: usize,
}

impl PipelineConfig {
    pub const DEFAULT_SHARD_POLL_INTERVAL_MS: u64 = 10_000;

    pub const DEFAULT_IN_SYNC_THRESHOLD_MS: u64 = 3_000;

    pub const DEFAULT_MIN_POLL_DELAY_MS: u64 = 1;

    pub const DEFAULT_MAX_POLL_DELAY_MS: u64 = 1_000;

    pub const DEFAULT_RESTART_DELAY_MS: u64 = 1_000;

    /// Three minutes.
    pub const DEFAULT_TEARDOWN_GRACE_MS: u64 = 180_000;

    pub const DEFAULT_CHANGES_BUFFER_SIZE: usize = 1_024;

    pub fn shard_poll_interval(&self) -> Duration {
        Duration::from_millis(self.shard_poll_interval_ms)
    }

    pub fn in_sync_threshold(&self) -> Duration {
        Duration::from_millis(self.in_sync_threshold_ms)
    }

    pub fn min_poll_delay(&self) -> Duration {
        Duration::from_millis(self.min_poll_delay_ms)
    }

    pub fn max_poll_delay(&self) -> Duration {
        Duration::from_millis(self.max_poll_delay_ms)
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }

    pub fn teardown_grace(&self) -> Duration {
        Duration::from_millis(self.teardown_grace_ms)
    }

    /// Validates pipeline timings.
    ///
    /// Polling intervals, the minimum poll delay and the buffer size must be non-zero, and the
    /// poll delay bounds must be ordered.
    pub fn validate(&self) -> Result<(), ValidationError> {
        let non_zero = [
            ("pipeline.shard_poll_interval_ms", self.shard_poll_interval_ms),
            ("pipeline.min_poll_delay_ms", self.min_poll_delay_ms),
            ("pipeline.changes_buffer_size", self.changes_buffer_size as u64),
        ];
        for (field, value) in non_zero {
            if value == 0 {
                return Err(ValidationError::InvalidFieldValue {
                    field: field.to_owned(),
                    constraint: "must be greater than 0".to_owned(),
                });
            }
        }

        if self.min_poll_delay_ms > self.max_poll_delay_ms {
            return Err(ValidationError::InvalidFieldValue {
                field: "pipeline.min_poll_delay_ms".to_owned(),
                constraint: "must not exceed `pipeline.max_poll_delay_ms`".to_owned(),
            });
        }

        Ok(())
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            shard_poll_interval_ms: default_shard_poll_interval_ms(),
            in_sync_threshold_ms: default_in_sync_threshold_ms(),
            min_poll_delay_ms: default_min_poll_delay_ms(),
            max_poll_delay_ms: default_max_poll_delay_ms(),
            restart_delay_ms: default_restart_delay_ms(),
            teardown_grace_ms: default_teardown_grace_ms(),
            changes_buffer_size: default_changes_buffer_size(),
        }
    }
}

fn default_shard_poll_interval_ms() -> u64 {
    PipelineConfig::DEFAULT_SHARD_POLL_INTERVAL_MS
}

fn default_in_sync_threshold_ms() -> u64 {
    PipelineConfig::DEFAULT_IN_SYNC_THRESHOLD_MS
}

fn default_min_poll_delay_ms() -> u64 {
    PipelineConfig::DEFAULT_MIN_POLL_DELAY_MS
}

fn default_max_poll_delay_ms() -> u64 {
    PipelineConfig::DEFAULT_MAX_POLL_DELAY_MS
}

fn default_restart_delay_ms() -> u64 {
    PipelineConfig::DEFAULT_RESTART_DELAY_MS
}

fn default_teardown_grace_ms() -> u64 {
    PipelineConfig::DEFAULT_TEARDOWN_GRACE_MS
}

fn default_changes_buffer_size() -> usize {
    PipelineConfig::DEFAULT_CHANGES_BUFFER_SIZE
}
