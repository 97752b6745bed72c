use crate::fragment::MergedBatch;
use async_trait::async_trait;

/// Downstream work queue receiving coalesced batches.
///
/// The engine's responsibility ends when `dispatch` returns `Ok`. Delivery is
/// at-least-once: a failed or timed-out call leaves the batch pending and it
/// is merged again (possibly with newer fragments) on a later scan.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    /// Short identifier for logs: "http", "log".
    fn name(&self) -> &str;

    async fn dispatch(&self, batch: &MergedBatch) -> anyhow::Result<()>;
}
