//! Engine tuning knobs.

use crate::error::{BatchError, Result};
use serde::Deserialize;
use std::time::Duration;

/// TTL below this multiple of the idle timeout leaves little room for poller jitter.
const RECOMMENDED_TTL_MARGIN: u64 = 10;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BatchSettings {
    /// Fragment count that makes a batch ready regardless of idle time.
    pub max_batch_size: usize,
    /// Silence required before a non-full batch is ready.
    pub idle_timeout_ms: u64,
    /// Expiry refreshed on every append; a safety net for abandoned batches.
    pub entry_ttl_seconds: u64,
    pub scan_interval_ms: u64,
    /// How long a drain claim stays valid if its holder never releases it.
    pub claim_lease_ms: u64,
    /// Upper bound on senders evaluated concurrently within one scan cycle.
    pub scan_concurrency: usize,
    pub joiner: String,
    /// Consecutive dispatch failures for one sender before each further failure is logged as an error.
    pub failure_alert_threshold: u32,
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            max_batch_size: 10,
            idle_timeout_ms: 9_000,
            entry_ttl_seconds: 120,
            scan_interval_ms: 1_000,
            claim_lease_ms: 30_000,
            scan_concurrency: 8,
            joiner: " ".to_string(),
            failure_alert_threshold: 5,
        }
    }
}

impl BatchSettings {
    pub fn validate(&self) -> Result<()> {
        if self.max_batch_size == 0 {
            return Err(BatchError::Settings(
                "batch.max_batch_size must be >= 1".to_string(),
            ));
        }
        if self.idle_timeout_ms == 0 {
            return Err(BatchError::Settings(
                "batch.idle_timeout_ms must be > 0".to_string(),
            ));
        }
        if self.scan_interval_ms == 0 {
            return Err(BatchError::Settings(
                "batch.scan_interval_ms must be > 0".to_string(),
            ));
        }
        if self.scan_concurrency == 0 {
            return Err(BatchError::Settings(
                "batch.scan_concurrency must be >= 1".to_string(),
            ));
        }
        if self.claim_lease_ms == 0 {
            return Err(BatchError::Settings(
                "batch.claim_lease_ms must be > 0".to_string(),
            ));
        }
        let ttl_ms = self.entry_ttl_seconds.saturating_mul(1_000);
        if ttl_ms < self.idle_timeout_ms.saturating_mul(2) {
            return Err(BatchError::Settings(format!(
                "batch.entry_ttl_seconds ({}s) must be at least twice batch.idle_timeout_ms ({}ms)",
                self.entry_ttl_seconds, self.idle_timeout_ms
            )));
        }
        if ttl_ms < self.idle_timeout_ms.saturating_mul(RECOMMENDED_TTL_MARGIN) {
            tracing::warn!(
                entry_ttl_seconds = self.entry_ttl_seconds,
                idle_timeout_ms = self.idle_timeout_ms,
                "entry TTL is less than {RECOMMENDED_TTL_MARGIN}x the idle timeout; slow poller cycles may let batches expire"
            );
        }
        Ok(())
    }

    pub fn idle_timeout_millis(&self) -> i64 {
        i64::try_from(self.idle_timeout_ms).unwrap_or(i64::MAX)
    }

    pub fn entry_ttl(&self) -> Duration {
        Duration::from_secs(self.entry_ttl_seconds)
    }

    pub fn scan_interval(&self) -> Duration {
        Duration::from_millis(self.scan_interval_ms)
    }

    pub fn claim_lease(&self) -> Duration {
        Duration::from_millis(self.claim_lease_ms)
    }
}
