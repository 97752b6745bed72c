//! Per-sender fragment accumulation on top of an [`ExpiringStore`].
//!
//! Layout per sender: a list of JSON-encoded fragments, a last-activity
//! marker (epoch millis) and, while a poller holds it, a drain claim. The
//! list and marker are written with separate store calls, so a producer that
//! dies between them leaves fragments without a marker; readers surface that
//! as `idle_millis == None`. The list gets its TTL before the marker is
//! written, so such a batch still expires.

use crate::error::Result;
use crate::fragment::MessageFragment;
use crate::keys::{KeySpace, SenderKey};
use crate::settings::BatchSettings;
use rf_store::{Clock, ExpiringStore};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize)]
pub struct EnqueueReceipt {
    pub sender: SenderKey,
    pub batch_size: usize,
}

/// Snapshot taken by [`BatchStore::drain`]. An empty value means another
/// consumer already holds (or has finished) this sender's batch.
#[derive(Debug)]
pub struct DrainedBatch {
    pub sender: SenderKey,
    /// Decodable fragments in append order.
    pub fragments: Vec<MessageFragment>,
    /// Raw list entries covered by this snapshot, including undecodable ones.
    consumed: usize,
    claim_token: Option<String>,
}

impl DrainedBatch {
    fn empty(sender: SenderKey) -> Self {
        Self {
            sender,
            fragments: Vec::new(),
            consumed: 0,
            claim_token: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.consumed == 0
    }

    pub fn consumed(&self) -> usize {
        self.consumed
    }

    /// Entries that were present but could not be decoded.
    pub fn corrupt(&self) -> usize {
        self.consumed.saturating_sub(self.fragments.len())
    }
}

#[derive(Clone)]
pub struct BatchStore {
    store: Arc<dyn ExpiringStore>,
    clock: Arc<dyn Clock>,
    keys: KeySpace,
    entry_ttl: Duration,
    claim_lease: Duration,
}

impl BatchStore {
    pub fn new(
        store: Arc<dyn ExpiringStore>,
        clock: Arc<dyn Clock>,
        keys: KeySpace,
        settings: &BatchSettings,
    ) -> Self {
        Self {
            store,
            clock,
            keys,
            entry_ttl: settings.entry_ttl(),
            claim_lease: settings.claim_lease(),
        }
    }

    pub fn key_space(&self) -> &KeySpace {
        &self.keys
    }

    pub fn backend(&self) -> &dyn ExpiringStore {
        self.store.as_ref()
    }

    pub fn now_millis(&self) -> i64 {
        self.clock.now_millis()
    }

    /// Producer entry point: normalize the raw sender and append one fragment.
    #[tracing::instrument(level = "debug", skip_all)]
    pub async fn enqueue(
        &self,
        raw_sender: &str,
        text: &str,
        routing_context: serde_json::Value,
        metadata: serde_json::Value,
    ) -> Result<EnqueueReceipt> {
        let sender = SenderKey::normalize(raw_sender)?;
        let fragment = MessageFragment {
            text: text.to_string(),
            routing_context,
            metadata,
            enqueued_at_millis: self.clock.now_millis(),
        };
        let batch_size = self.append(&sender, &fragment).await?;
        Ok(EnqueueReceipt { sender, batch_size })
    }

    /// Append a fragment, stamp the activity marker and refresh TTL on both
    /// keys. Concurrent appends for one sender interleave; none is lost.
    /// Returns the batch size after the append.
    pub async fn append(&self, sender: &SenderKey, fragment: &MessageFragment) -> Result<usize> {
        let batch_key = self.keys.batch_key(sender);
        let marker_key = self.keys.marker_key(sender);
        let payload = serde_json::to_string(fragment)?;

        let size = self.store.list_push(&batch_key, &payload).await?;
        self.store.expire(&batch_key, self.entry_ttl).await?;
        self.store
            .set_with_ttl(
                &marker_key,
                &self.clock.now_millis().to_string(),
                self.entry_ttl,
            )
            .await?;

        tracing::debug!(sender = %sender, batch_size = size, "fragment appended");
        Ok(size)
    }

    pub async fn size(&self, sender: &SenderKey) -> Result<usize> {
        Ok(self.store.list_len(&self.keys.batch_key(sender)).await?)
    }

    /// Milliseconds since the last append, or `None` when the marker is absent.
    pub async fn idle_millis(&self, sender: &SenderKey) -> Result<Option<i64>> {
        let marker_key = self.keys.marker_key(sender);
        let Some(raw) = self.store.get(&marker_key).await? else {
            return Ok(None);
        };
        match raw.trim().parse::<i64>() {
            Ok(last_activity) => Ok(Some(
                self.clock.now_millis().saturating_sub(last_activity).max(0),
            )),
            Err(error) => {
                tracing::warn!(sender = %sender, raw = %raw, %error, "unparseable activity marker");
                Ok(None)
            }
        }
    }

    /// Claim the sender and snapshot its fragments without deleting them.
    ///
    /// Only one caller at a time can hold the claim; everyone else gets an
    /// empty batch. The claim expires after the configured lease if the
    /// holder neither acknowledges nor releases it.
    pub async fn drain(&self, sender: &SenderKey) -> Result<DrainedBatch> {
        let claim_key = self.keys.claim_key(sender);
        let token = Uuid::new_v4().to_string();
        if !self
            .store
            .set_if_absent(&claim_key, &token, self.claim_lease)
            .await?
        {
            return Ok(DrainedBatch::empty(sender.clone()));
        }

        let raw = match self.store.list_range(&self.keys.batch_key(sender)).await {
            Ok(raw) => raw,
            Err(error) => {
                self.release_claim(sender, &token).await;
                return Err(error.into());
            }
        };
        if raw.is_empty() {
            self.release_claim(sender, &token).await;
            return Ok(DrainedBatch::empty(sender.clone()));
        }

        let mut fragments = Vec::with_capacity(raw.len());
        for (index, entry) in raw.iter().enumerate() {
            match serde_json::from_str::<MessageFragment>(entry) {
                Ok(fragment) => fragments.push(fragment),
                Err(error) => {
                    tracing::warn!(sender = %sender, index, %error, "skipping undecodable fragment");
                }
            }
        }

        Ok(DrainedBatch {
            sender: sender.clone(),
            fragments,
            consumed: raw.len(),
            claim_token: Some(token),
        })
    }

    /// Remove exactly the drained fragments and release the claim. Fragments
    /// appended after the drain stay pending with their marker. When nothing
    /// is left the marker goes too, unless a producer has rewritten it since.
    pub async fn acknowledge(&self, drained: &DrainedBatch) -> Result<()> {
        let Some(token) = drained.claim_token.as_deref() else {
            return Ok(());
        };
        let batch_key = self.keys.batch_key(&drained.sender);
        let marker_key = self.keys.marker_key(&drained.sender);
        let marker = self.store.get(&marker_key).await?;
        self.store
            .list_trim_front(&batch_key, drained.consumed)
            .await?;
        if let Some(marker) = marker {
            if self.store.list_len(&batch_key).await? == 0 {
                self.store.delete_if_equals(&marker_key, &marker).await?;
            }
        }
        self.store
            .delete_if_equals(&self.keys.claim_key(&drained.sender), token)
            .await?;
        Ok(())
    }

    /// Give the claim back without touching the fragments.
    pub async fn release(&self, drained: &DrainedBatch) -> Result<()> {
        let Some(token) = drained.claim_token.as_deref() else {
            return Ok(());
        };
        self.store
            .delete_if_equals(&self.keys.claim_key(&drained.sender), token)
            .await?;
        Ok(())
    }

    async fn release_claim(&self, sender: &SenderKey, token: &str) {
        if let Err(error) = self
            .store
            .delete_if_equals(&self.keys.claim_key(sender), token)
            .await
        {
            tracing::warn!(sender = %sender, %error, "failed to release drain claim; lease will expire");
        }
    }

    /// Delete every key of the sender. Discarding an absent batch is a no-op.
    pub async fn discard(&self, sender: &SenderKey) -> Result<()> {
        let keys = [
            self.keys.batch_key(sender),
            self.keys.marker_key(sender),
            self.keys.claim_key(sender),
        ];
        let removed = self.store.delete(&keys).await?;
        tracing::debug!(sender = %sender, removed, "batch discarded");
        Ok(())
    }

    /// Senders whose batch key matches `pattern`. Keys may vanish before the
    /// caller reads them.
    pub async fn list_pending_sender_keys(&self, pattern: &str) -> Result<Vec<SenderKey>> {
        let keys = self.store.scan(pattern).await?;
        Ok(keys
            .iter()
            .filter_map(|key| self.keys.sender_from_batch_key(key))
            .collect())
    }

    pub async fn pending_senders(&self) -> Result<Vec<SenderKey>> {
        self.list_pending_sender_keys(&self.keys.batch_pattern())
            .await
    }
}
