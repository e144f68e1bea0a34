//! Catch-up worker configuration loaded from environment variables.

use std::time::Duration;

/// Catch-up worker settings with sensible defaults.
///
/// Reads from environment variables:
/// - `CATCH_UP_PAGE_SIZE`: events read from the log per page (default: `500`)
/// - `CATCH_UP_REFRESH_MS`: period of the catch-up-to-end refresh (default: `1000`)
/// - `CATCH_UP_POLL_MS`: watermark polling interval while waiting (default: `20`)
#[derive(Debug, Clone)]
pub struct CatchUpConfig {
    pub page_size: usize,
    pub refresh_interval: Duration,
    pub poll_interval: Duration,
}

impl CatchUpConfig {
    /// Loads configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let millis = |key: &str| {
            lookup(key)
                .and_then(|v| v.parse::<u64>().ok())
                .filter(|&ms| ms > 0)
                .map(Duration::from_millis)
        };
        Self {
            page_size: lookup("CATCH_UP_PAGE_SIZE")
                .and_then(|v| v.parse().ok())
                .filter(|&n| n > 0)
                .unwrap_or(defaults.page_size),
            refresh_interval: millis("CATCH_UP_REFRESH_MS").unwrap_or(defaults.refresh_interval),
            poll_interval: millis("CATCH_UP_POLL_MS").unwrap_or(defaults.poll_interval),
        }
    }
}

impl Default for CatchUpConfig {
    fn default() -> Self {
        Self {
            page_size: 500,
            refresh_interval: Duration::from_secs(1),
            poll_interval: Duration::from_millis(20),
        }
    }
}
