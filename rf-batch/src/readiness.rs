//! Pure readiness decision. No store access, no side effects.

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum Readiness {
    /// Nothing pending.
    Empty,
    /// Size cap reached; ready regardless of idle time.
    Full,
    /// Fragments present but no last-activity marker. Never ready on a
    /// regular scan; TTL reclaims it if it stays this way.
    Ambiguous,
    Waiting { remaining_millis: i64 },
    Idle,
}

impl Readiness {
    pub fn is_ready(self) -> bool {
        matches!(self, Self::Full | Self::Idle)
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Empty => "empty",
            Self::Full => "full",
            Self::Ambiguous => "ambiguous",
            Self::Waiting { .. } => "waiting",
            Self::Idle => "idle",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanMode {
    Regular,
    /// Shutdown or operator flush: every non-empty batch is ready.
    Forced,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadinessPolicy {
    pub max_batch_size: usize,
    pub idle_timeout_millis: i64,
}

impl ReadinessPolicy {
    pub fn new(max_batch_size: usize, idle_timeout_millis: i64) -> Self {
        Self {
            max_batch_size,
            idle_timeout_millis,
        }
    }

    /// Rules apply in order: empty, size cap, missing marker, idle timeout.
    pub fn evaluate(&self, size: usize, idle_millis: Option<i64>) -> Readiness {
        if size == 0 {
            return Readiness::Empty;
        }
        if size >= self.max_batch_size {
            return Readiness::Full;
        }
        let Some(idle_millis) = idle_millis else {
            return Readiness::Ambiguous;
        };
        if idle_millis >= self.idle_timeout_millis {
            Readiness::Idle
        } else {
            Readiness::Waiting {
                remaining_millis: self.idle_timeout_millis - idle_millis,
            }
        }
    }

    pub fn should_process(&self, size: usize, idle_millis: Option<i64>, mode: ScanMode) -> bool {
        match mode {
            ScanMode::Regular => self.evaluate(size, idle_millis).is_ready(),
            ScanMode::Forced => size > 0,
        }
    }
}

pub fn is_ready(
    size: usize,
    idle_millis: Option<i64>,
    max_batch_size: usize,
    idle_timeout_millis: i64,
) -> bool {
    ReadinessPolicy::new(max_batch_size, idle_timeout_millis)
        .evaluate(size, idle_millis)
        .is_ready()
}
