//! Read-only view over pending batches for operators. The snapshot is stale
//! as soon as it is taken; nothing in the engine relies on it.

use crate::error::Result;
use crate::keys::SenderKey;
use crate::readiness::{Readiness, ReadinessPolicy};
use crate::store::BatchStore;
use serde::Serialize;
use std::cmp::Reverse;

#[derive(Debug, Clone, Serialize)]
pub struct SenderStats {
    pub sender: SenderKey,
    pub size: usize,
    pub idle_millis: Option<i64>,
    pub readiness: Readiness,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchStats {
    pub collected_at_millis: i64,
    pub pending_batches: usize,
    pub total_fragments: usize,
    pub ready_batches: usize,
    pub ambiguous_batches: usize,
    pub oldest_idle_millis: Option<i64>,
    /// Longest-idle first; senders without a marker last.
    pub senders: Vec<SenderStats>,
}

impl BatchStats {
    pub async fn collect(batches: &BatchStore, policy: &ReadinessPolicy) -> Result<Self> {
        let mut senders = Vec::new();
        for sender in batches.pending_senders().await? {
            let size = batches.size(&sender).await?;
            if size == 0 {
                // Dispatched or expired since the scan.
                continue;
            }
            let idle_millis = batches.idle_millis(&sender).await?;
            senders.push(SenderStats {
                readiness: policy.evaluate(size, idle_millis),
                sender,
                size,
                idle_millis,
            });
        }
        senders.sort_by_key(|s| (Reverse(s.idle_millis.unwrap_or(-1)), s.sender.clone()));

        Ok(Self {
            collected_at_millis: batches.now_millis(),
            pending_batches: senders.len(),
            total_fragments: senders.iter().map(|s| s.size).sum(),
            ready_batches: senders.iter().filter(|s| s.readiness.is_ready()).count(),
            ambiguous_batches: senders
                .iter()
                .filter(|s| s.readiness == Readiness::Ambiguous)
                .count(),
            oldest_idle_millis: senders.iter().filter_map(|s| s.idle_millis).max(),
            senders,
        })
    }
}
