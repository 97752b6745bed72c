//! Fragment payloads and the coalesced unit handed downstream.

use crate::keys::SenderKey;
use serde::{Deserialize, Serialize};

/// One inbound message before coalescing. Opaque to the engine apart from
/// its enqueue timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageFragment {
    pub text: String,
    /// Downstream tenant/company identifier; constant across one batch.
    #[serde(default)]
    pub routing_context: serde_json::Value,
    #[serde(default)]
    pub metadata: serde_json::Value,
    pub enqueued_at_millis: i64,
}

/// All fragments of one batch, merged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergedBatch {
    pub sender: SenderKey,
    pub routing_context: serde_json::Value,
    pub metadata: serde_json::Value,
    pub text: String,
    pub fragment_count: usize,
    /// Time between the first and the last fragment of the batch.
    pub span_millis: i64,
    pub first_enqueued_at_millis: i64,
    pub last_enqueued_at_millis: i64,
}

impl MergedBatch {
    /// Returns `None` for an empty fragment list. Routing context and metadata
    /// come from the first fragment.
    pub fn merge(sender: SenderKey, fragments: &[MessageFragment], joiner: &str) -> Option<Self> {
        let first = fragments.first()?;
        let last = fragments.last()?;
        let text = fragments
            .iter()
            .map(|f| f.text.trim())
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>()
            .join(joiner);
        Some(Self {
            sender,
            routing_context: first.routing_context.clone(),
            metadata: first.metadata.clone(),
            text,
            fragment_count: fragments.len(),
            span_millis: last
                .enqueued_at_millis
                .saturating_sub(first.enqueued_at_millis),
            first_enqueued_at_millis: first.enqueued_at_millis,
            last_enqueued_at_millis: last.enqueued_at_millis,
        })
    }
}
