//! Command processor configuration loaded from environment variables.

use std::time::Duration;

use crate::snapshot::SnapshotPolicy;

/// Command processor settings with sensible defaults.
///
/// Reads from environment variables:
/// - `PROCESSOR_MAX_RETRIES`: attempts per command before a conflict is fatal (default: `10`)
/// - `SNAPSHOT_MIN_HYDRATION_MS`: only re-save snapshots when hydration took at
///   least this long (default: unset, always re-save)
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    pub max_retries: u32,
    pub snapshot: SnapshotPolicy,
}

impl ProcessorConfig {
    pub const DEFAULT_MAX_RETRIES: u32 = 10;

    /// Loads configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            max_retries: lookup("PROCESSOR_MAX_RETRIES")
                .and_then(|v| v.parse().ok())
                .filter(|&n| n > 0)
                .unwrap_or(Self::DEFAULT_MAX_RETRIES),
            snapshot: SnapshotPolicy {
                min_hydration_time: lookup("SNAPSHOT_MIN_HYDRATION_MS")
                    .and_then(|v| v.parse().ok())
                    .map(Duration::from_millis),
            },
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries.max(1);
        self
    }

    pub fn with_snapshot_policy(mut self, policy: SnapshotPolicy) -> Self {
        self.snapshot = policy;
        self
    }
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            max_retries: Self::DEFAULT_MAX_RETRIES,
            snapshot: SnapshotPolicy::always(),
        }
    }
}
