//! Periodic discovery, readiness evaluation and dispatch of pending batches.
//!
//! Multiple pollers may run against the same store. The drain claim decides
//! which one dispatches a given batch; the others see an empty drain and move
//! on.

use crate::dispatch::Dispatcher;
use crate::error::Result;
use crate::fragment::MergedBatch;
use crate::keys::SenderKey;
use crate::readiness::{Readiness, ReadinessPolicy, ScanMode};
use crate::settings::BatchSettings;
use crate::store::BatchStore;
use dashmap::DashMap;
use futures_util::StreamExt;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ScanReport {
    pub discovered: usize,
    pub ready: usize,
    pub dispatched: usize,
    /// Ready batches another consumer claimed first.
    pub raced: usize,
    pub failed: usize,
    pub errors: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct PollerStatus {
    pub active: bool,
    pub dispatcher: String,
    pub scan_interval_ms: u64,
    pub dispatch_timeout_ms: u64,
    pub started_at_millis: Option<i64>,
    pub cycles: u64,
    pub last_cycle_at_millis: Option<i64>,
    pub last_cycle_duration_ms: Option<u64>,
    pub last_report: Option<ScanReport>,
    pub total_dispatched: u64,
    pub total_dispatch_failures: u64,
    pub total_raced: u64,
    pub total_errors: u64,
    /// Consecutive dispatch failures per sender still pending.
    pub failing_senders: BTreeMap<String, u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SenderOutcome {
    NotReady,
    Dispatched,
    Raced,
    DispatchFailed,
    /// Every entry was undecodable; nothing to dispatch.
    Dropped,
    Error,
}

pub struct CoalescingPoller {
    batches: BatchStore,
    dispatcher: Arc<dyn Dispatcher>,
    policy: ReadinessPolicy,
    settings: BatchSettings,
    dispatch_timeout: Duration,
    failures: DashMap<SenderKey, u32>,
    state: RwLock<PollerStatus>,
    shutdown: CancellationToken,
    task_handle: Mutex<Option<JoinHandle<()>>>,
}

impl CoalescingPoller {
    pub fn new(
        batches: BatchStore,
        dispatcher: Arc<dyn Dispatcher>,
        settings: BatchSettings,
        dispatch_timeout: Duration,
    ) -> Self {
        let policy = ReadinessPolicy::new(settings.max_batch_size, settings.idle_timeout_millis());
        let lease = settings.claim_lease();
        let dispatch_timeout = if dispatch_timeout >= lease {
            let clamped = lease / 2;
            tracing::warn!(
                requested_ms = dispatch_timeout.as_millis() as u64,
                claim_lease_ms = settings.claim_lease_ms,
                clamped_ms = clamped.as_millis() as u64,
                "dispatch timeout must be shorter than the claim lease; clamping"
            );
            clamped
        } else {
            dispatch_timeout
        };
        let status = PollerStatus {
            active: false,
            dispatcher: dispatcher.name().to_string(),
            scan_interval_ms: settings.scan_interval_ms,
            dispatch_timeout_ms: u64::try_from(dispatch_timeout.as_millis()).unwrap_or(u64::MAX),
            started_at_millis: None,
            cycles: 0,
            last_cycle_at_millis: None,
            last_cycle_duration_ms: None,
            last_report: None,
            total_dispatched: 0,
            total_dispatch_failures: 0,
            total_raced: 0,
            total_errors: 0,
            failing_senders: BTreeMap::new(),
        };
        Self {
            batches,
            dispatcher,
            policy,
            settings,
            dispatch_timeout,
            failures: DashMap::new(),
            state: RwLock::new(status),
            shutdown: CancellationToken::new(),
            task_handle: Mutex::new(None),
        }
    }

    pub fn policy(&self) -> ReadinessPolicy {
        self.policy
    }

    pub fn batches(&self) -> &BatchStore {
        &self.batches
    }

    /// Spawn the periodic scan loop. Calling it twice is a no-op.
    pub async fn start(self: &Arc<Self>) {
        let mut task_handle = self.task_handle.lock().await;
        if task_handle.is_some() {
            return;
        }

        {
            let mut guard = self.state.write().await;
            guard.active = true;
            guard.started_at_millis = Some(self.batches.now_millis());
        }

        let poller = Arc::clone(self);
        *task_handle = Some(tokio::spawn(async move {
            poller.run_loop().await;
        }));
        tracing::info!(
            scan_interval_ms = self.settings.scan_interval_ms,
            max_batch_size = self.settings.max_batch_size,
            idle_timeout_ms = self.settings.idle_timeout_ms,
            dispatcher = %self.dispatcher.name(),
            "coalescing poller started"
        );
    }

    /// Stop the loop, then run one forced pass so batches still waiting for
    /// their idle timeout are dispatched instead of left to expire.
    pub async fn shutdown(&self) -> ScanReport {
        self.shutdown.cancel();
        let handle = self.task_handle.lock().await.take();
        if let Some(handle) = handle {
            if let Err(error) = handle.await {
                tracing::warn!(?error, "poller shutdown join failed");
            }
        }

        let report = self.scan_once(ScanMode::Forced).await;
        self.state.write().await.active = false;
        tracing::info!(
            dispatched = report.dispatched,
            failed = report.failed,
            errors = report.errors,
            "coalescing poller stopped after final flush"
        );
        report
    }

    pub async fn flush(&self) -> ScanReport {
        self.scan_once(ScanMode::Forced).await
    }

    pub async fn status_snapshot(&self) -> PollerStatus {
        let mut snapshot = self.state.read().await.clone();
        snapshot.failing_senders = self
            .failures
            .iter()
            .map(|entry| (entry.key().to_string(), *entry.value()))
            .collect();
        snapshot
    }

    async fn run_loop(&self) {
        let mut ticker = tokio::time::interval(self.settings.scan_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    self.scan_once(ScanMode::Regular).await;
                }
            }
        }
    }

    /// One discover/evaluate/dispatch cycle. Per-sender failures are logged
    /// and counted; they never abort the cycle.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn scan_once(&self, mode: ScanMode) -> ScanReport {
        let started = Instant::now();
        let mut report = ScanReport::default();

        match self.batches.pending_senders().await {
            Ok(senders) => {
                report.discovered = senders.len();
                let discovered: HashSet<SenderKey> = senders.iter().cloned().collect();
                let outcomes: Vec<SenderOutcome> = futures_util::stream::iter(senders)
                    .map(|sender| self.process_sender(sender, mode))
                    .buffer_unordered(self.settings.scan_concurrency.max(1))
                    .collect()
                    .await;
                for outcome in outcomes {
                    match outcome {
                        SenderOutcome::NotReady => {}
                        SenderOutcome::Dispatched => {
                            report.ready += 1;
                            report.dispatched += 1;
                        }
                        SenderOutcome::Raced => {
                            report.ready += 1;
                            report.raced += 1;
                        }
                        SenderOutcome::DispatchFailed => {
                            report.ready += 1;
                            report.failed += 1;
                        }
                        SenderOutcome::Dropped => report.ready += 1,
                        SenderOutcome::Error => report.errors += 1,
                    }
                }
                // Batches that expired or were discarded no longer count as failing.
                self.failures.retain(|sender, _| discovered.contains(sender));
            }
            Err(error) => {
                tracing::warn!(%error, retryable = error.is_retryable(), "pending batch discovery failed");
                report.errors += 1;
            }
        }

        self.record_cycle(report, started.elapsed()).await;
        if report.ready > 0 || report.errors > 0 {
            tracing::debug!(?mode, ?report, "scan cycle finished");
        }
        report
    }

    async fn process_sender(&self, sender: SenderKey, mode: ScanMode) -> SenderOutcome {
        match self.try_process_sender(&sender, mode).await {
            Ok(outcome) => outcome,
            Err(error) => {
                tracing::warn!(
                    sender = %sender,
                    %error,
                    retryable = error.is_retryable(),
                    "sender evaluation failed"
                );
                SenderOutcome::Error
            }
        }
    }

    async fn try_process_sender(&self, sender: &SenderKey, mode: ScanMode) -> Result<SenderOutcome> {
        let size = self.batches.size(sender).await?;
        let idle_millis = self.batches.idle_millis(sender).await?;
        if !self.policy.should_process(size, idle_millis, mode) {
            if self.policy.evaluate(size, idle_millis) == Readiness::Ambiguous {
                tracing::debug!(sender = %sender, size, "batch has no activity marker; leaving it to TTL");
            }
            return Ok(SenderOutcome::NotReady);
        }

        let drained = self.batches.drain(sender).await?;
        if drained.is_empty() {
            tracing::debug!(sender = %sender, "batch already claimed by another consumer");
            return Ok(SenderOutcome::Raced);
        }

        // Another consumer may have finished the batch between evaluation and
        // claim, leaving only fresh fragments behind.
        if mode == ScanMode::Regular {
            match self.still_ready(sender).await {
                Ok(true) => {}
                Ok(false) => {
                    tracing::debug!(sender = %sender, "batch changed before claim; waiting for its idle timeout");
                    self.batches.release(&drained).await?;
                    return Ok(SenderOutcome::NotReady);
                }
                Err(error) => {
                    if let Err(release_error) = self.batches.release(&drained).await {
                        tracing::warn!(sender = %sender, error = %release_error, "failed to release claim; lease will expire");
                    }
                    return Err(error);
                }
            }
        }

        let Some(merged) =
            MergedBatch::merge(sender.clone(), &drained.fragments, &self.settings.joiner)
        else {
            tracing::warn!(
                sender = %sender,
                corrupt = drained.corrupt(),
                "dropping batch with no decodable fragments"
            );
            self.failures.remove(sender);
            self.batches.acknowledge(&drained).await?;
            return Ok(SenderOutcome::Dropped);
        };

        let outcome = match tokio::time::timeout(
            self.dispatch_timeout,
            self.dispatcher.dispatch(&merged),
        )
        .await
        {
            Ok(Ok(())) => Ok(()),
            Ok(Err(error)) => Err(error.to_string()),
            Err(_) => Err(format!(
                "dispatch timed out after {}ms",
                self.dispatch_timeout.as_millis()
            )),
        };

        if let Err(error) = outcome {
            self.record_dispatch_failure(sender, &error);
            if let Err(release_error) = self.batches.release(&drained).await {
                tracing::warn!(
                    sender = %sender,
                    error = %release_error,
                    "failed to release claim after dispatch failure; lease will expire"
                );
            }
            return Ok(SenderOutcome::DispatchFailed);
        }

        self.failures.remove(sender);
        if let Err(error) = self.batches.acknowledge(&drained).await {
            tracing::error!(
                sender = %sender,
                %error,
                "dispatched batch could not be acknowledged; it will be redelivered once the claim lease expires"
            );
        }
        tracing::info!(
            sender = %sender,
            fragment_count = merged.fragment_count,
            span_millis = merged.span_millis,
            corrupt = drained.corrupt(),
            ?mode,
            "batch dispatched"
        );
        Ok(SenderOutcome::Dispatched)
    }

    async fn still_ready(&self, sender: &SenderKey) -> Result<bool> {
        let size = self.batches.size(sender).await?;
        let idle_millis = self.batches.idle_millis(sender).await?;
        Ok(self
            .policy
            .should_process(size, idle_millis, ScanMode::Regular))
    }

    fn record_dispatch_failure(&self, sender: &SenderKey, error: &str) {
        let consecutive = {
            let mut entry = self.failures.entry(sender.clone()).or_insert(0);
            *entry = entry.saturating_add(1);
            *entry
        };
        if consecutive >= self.settings.failure_alert_threshold {
            tracing::error!(
                sender = %sender,
                consecutive_failures = consecutive,
                %error,
                "dispatch keeps failing; batch retained"
            );
        } else {
            tracing::warn!(
                sender = %sender,
                consecutive_failures = consecutive,
                %error,
                "dispatch failed; batch retained for next cycle"
            );
        }
    }

    async fn record_cycle(&self, report: ScanReport, elapsed: Duration) {
        let mut guard = self.state.write().await;
        guard.cycles = guard.cycles.saturating_add(1);
        guard.last_cycle_at_millis = Some(self.batches.now_millis());
        guard.last_cycle_duration_ms = Some(u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX));
        guard.last_report = Some(report);
        guard.total_dispatched = guard
            .total_dispatched
            .saturating_add(report.dispatched as u64);
        guard.total_dispatch_failures = guard
            .total_dispatch_failures
            .saturating_add(report.failed as u64);
        guard.total_raced = guard.total_raced.saturating_add(report.raced as u64);
        guard.total_errors = guard.total_errors.saturating_add(report.errors as u64);
    }
}

#[cfg(test)]
mod tests {
    use super::CoalescingPoller;
    use crate::dispatch::Dispatcher;
    use crate::fragment::MergedBatch;
    use crate::readiness::ScanMode;
    use crate::settings::BatchSettings;
    use crate::store::tests::{Harness, faulty_harness, harness, sender};
    use async_trait::async_trait;
    use rf_store::ExpiringStore;
    use serde_json::json;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingDispatcher {
        delivered: std::sync::Mutex<Vec<MergedBatch>>,
        failures_remaining: AtomicUsize,
        delay: Option<Duration>,
    }

    impl RecordingDispatcher {
        fn failing(times: usize) -> Self {
            Self {
                failures_remaining: AtomicUsize::new(times),
                ..Self::default()
            }
        }

        fn slow(delay: Duration) -> Self {
            Self {
                delay: Some(delay),
                ..Self::default()
            }
        }

        fn delivered(&self) -> Vec<MergedBatch> {
            self.delivered.lock().expect("lock").clone()
        }
    }

    #[async_trait]
    impl Dispatcher for RecordingDispatcher {
        fn name(&self) -> &str {
            "recording"
        }

        async fn dispatch(&self, batch: &MergedBatch) -> anyhow::Result<()> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            let should_fail = self
                .failures_remaining
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if should_fail {
                return Err(anyhow::anyhow!("queue unavailable"));
            }
            self.delivered.lock().expect("lock").push(batch.clone());
            Ok(())
        }
    }

    fn poller(
        h: &Harness,
        settings: &BatchSettings,
        dispatcher: Arc<RecordingDispatcher>,
    ) -> Arc<CoalescingPoller> {
        Arc::new(CoalescingPoller::new(
            h.batches.clone(),
            dispatcher,
            settings.clone(),
            Duration::from_secs(5),
        ))
    }

    async fn enqueue(h: &Harness, raw: &str, text: &str) {
        h.batches
            .enqueue(raw, text, json!({"company_id": 962302}), json!({"source": "whatsapp"}))
            .await
            .expect("enqueue");
    }

    #[tokio::test]
    async fn rapid_fragments_coalesce_into_one_dispatch() {
        let settings = BatchSettings::default();
        let h = harness(&settings);
        let dispatcher = Arc::new(RecordingDispatcher::default());
        let poller = poller(&h, &settings, dispatcher.clone());

        enqueue(&h, "79001234567", "запишите").await;
        h.clock.advance(100);
        enqueue(&h, "79001234567", "меня на стрижку").await;
        h.clock.advance(150);
        enqueue(&h, "79001234567", "к Бари на завтра в 8 вечера").await;

        assert_eq!(poller.scan_once(ScanMode::Regular).await.dispatched, 0);
        h.clock.advance(8_999);
        assert_eq!(poller.scan_once(ScanMode::Regular).await.dispatched, 0);
        h.clock.advance(1);
        let report = poller.scan_once(ScanMode::Regular).await;
        assert_eq!(report.discovered, 1);
        assert_eq!(report.dispatched, 1);

        let delivered = dispatcher.delivered();
        assert_eq!(delivered.len(), 1);
        assert_eq!(
            delivered[0].text,
            "запишите меня на стрижку к Бари на завтра в 8 вечера"
        );
        assert_eq!(delivered[0].fragment_count, 3);
        assert_eq!(delivered[0].span_millis, 250);
        assert_eq!(delivered[0].routing_context, json!({"company_id": 962302}));

        assert_eq!(poller.scan_once(ScanMode::Regular).await.discovered, 0);
        assert_eq!(dispatcher.delivered().len(), 1);
    }

    #[tokio::test]
    async fn full_batch_dispatches_without_waiting() {
        let settings = BatchSettings {
            max_batch_size: 3,
            ..BatchSettings::default()
        };
        let h = harness(&settings);
        let dispatcher = Arc::new(RecordingDispatcher::default());
        let poller = poller(&h, &settings, dispatcher.clone());

        for text in ["1", "2", "3"] {
            enqueue(&h, "79001234567", text).await;
            h.clock.advance(10);
        }
        let report = poller.scan_once(ScanMode::Regular).await;
        assert_eq!(report.dispatched, 1);
        assert_eq!(dispatcher.delivered()[0].text, "1 2 3");
    }

    #[tokio::test]
    async fn forced_flush_delivers_single_fragment() {
        let settings = BatchSettings::default();
        let h = harness(&settings);
        let dispatcher = Arc::new(RecordingDispatcher::default());
        let poller = poller(&h, &settings, dispatcher.clone());

        enqueue(&h, "79001234567", "привет").await;
        let report = poller.flush().await;
        assert_eq!(report.dispatched, 1);
        assert_eq!(dispatcher.delivered()[0].text, "привет");
        assert_eq!(dispatcher.delivered()[0].fragment_count, 1);
        assert_eq!(dispatcher.delivered()[0].span_millis, 0);
    }

    #[tokio::test]
    async fn batch_without_marker_waits_for_ttl_or_forced_flush() {
        let settings = BatchSettings::default();
        let h = harness(&settings);
        let dispatcher = Arc::new(RecordingDispatcher::default());
        let poller = poller(&h, &settings, dispatcher.clone());

        enqueue(&h, "79001234567", "a").await;
        enqueue(&h, "79001234567", "b").await;
        let s = sender("79001234567");
        h.memory
            .delete(&[h.batches.key_space().marker_key(&s)])
            .await
            .expect("delete marker");

        h.clock.advance(60_000);
        let report = poller.scan_once(ScanMode::Regular).await;
        assert_eq!(report.discovered, 1);
        assert_eq!(report.ready, 0);
        assert!(dispatcher.delivered().is_empty());
        assert_eq!(h.batches.size(&s).await.expect("size"), 2);

        let forced = poller.flush().await;
        assert_eq!(forced.dispatched, 1);
        assert_eq!(dispatcher.delivered()[0].text, "a b");
    }

    #[tokio::test]
    async fn failed_dispatch_keeps_batch_and_remerges_late_fragments() {
        let settings = BatchSettings::default();
        let h = harness(&settings);
        let dispatcher = Arc::new(RecordingDispatcher::failing(1));
        let poller = poller(&h, &settings, dispatcher.clone());
        let s = sender("79001234567");

        enqueue(&h, "79001234567", "a").await;
        h.clock.advance(9_000);
        let report = poller.scan_once(ScanMode::Regular).await;
        assert_eq!(report.failed, 1);
        assert_eq!(h.batches.size(&s).await.expect("size"), 1);
        assert_eq!(
            poller.status_snapshot().await.failing_senders.get("79001234567"),
            Some(&1)
        );

        enqueue(&h, "79001234567", "b").await;
        assert_eq!(poller.scan_once(ScanMode::Regular).await.dispatched, 0);
        h.clock.advance(9_000);
        let report = poller.scan_once(ScanMode::Regular).await;
        assert_eq!(report.dispatched, 1);

        let delivered = dispatcher.delivered();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].text, "a b");
        assert_eq!(delivered[0].fragment_count, 2);
        assert!(poller.status_snapshot().await.failing_senders.is_empty());
        assert_eq!(h.batches.size(&s).await.expect("size"), 0);
    }

    #[tokio::test]
    async fn dispatch_timeout_counts_as_failure() {
        let settings = BatchSettings::default();
        let h = harness(&settings);
        let dispatcher = Arc::new(RecordingDispatcher::slow(Duration::from_secs(5)));
        let poller = Arc::new(CoalescingPoller::new(
            h.batches.clone(),
            dispatcher.clone(),
            settings.clone(),
            Duration::from_millis(20),
        ));

        enqueue(&h, "79001234567", "a").await;
        let report = poller.flush().await;
        assert_eq!(report.failed, 1);
        assert!(dispatcher.delivered().is_empty());
        assert_eq!(
            h.batches
                .size(&sender("79001234567"))
                .await
                .expect("size"),
            1
        );
        // Claim was released, so the next cycle can try again.
        assert!(
            !h.batches
                .drain(&sender("79001234567"))
                .await
                .expect("drain")
                .is_empty()
        );
    }

    #[tokio::test]
    async fn concurrent_pollers_dispatch_each_batch_once() {
        let settings = BatchSettings::default();
        let h = harness(&settings);
        let dispatcher = Arc::new(RecordingDispatcher::default());
        let first = poller(&h, &settings, dispatcher.clone());
        let second = poller(&h, &settings, dispatcher.clone());

        for raw in ["79001234567", "79007654321", "79990000000"] {
            enqueue(&h, raw, "hello").await;
        }
        h.clock.advance(9_000);

        let (a, b) = tokio::join!(
            first.scan_once(ScanMode::Regular),
            second.scan_once(ScanMode::Regular)
        );
        assert_eq!(a.dispatched + b.dispatched, 3);
        assert_eq!(dispatcher.delivered().len(), 3);
        assert_eq!(second.scan_once(ScanMode::Regular).await.discovered, 0);
    }

    #[tokio::test]
    async fn broken_sender_does_not_block_others() {
        let settings = BatchSettings::default();
        let h = harness(&settings);
        let dispatcher = Arc::new(RecordingDispatcher::default());
        let poller = poller(&h, &settings, dispatcher.clone());

        h.memory
            .set_with_ttl("rapidfire:batch:111", "not a list", Duration::from_secs(60))
            .await
            .expect("set");
        enqueue(&h, "79001234567", "ok").await;
        h.clock.advance(9_000);

        let report = poller.scan_once(ScanMode::Regular).await;
        assert_eq!(report.discovered, 2);
        assert_eq!(report.errors, 1);
        assert_eq!(report.dispatched, 1);
        assert_eq!(poller.status_snapshot().await.total_errors, 1);
    }

    #[tokio::test]
    async fn shutdown_flushes_batches_still_waiting() {
        let settings = BatchSettings {
            scan_interval_ms: 60_000,
            ..BatchSettings::default()
        };
        let h = harness(&settings);
        let dispatcher = Arc::new(RecordingDispatcher::default());
        let poller = poller(&h, &settings, dispatcher.clone());

        enqueue(&h, "79001234567", "almost").await;
        enqueue(&h, "79001234567", "done").await;
        poller.start().await;
        assert!(poller.status_snapshot().await.active);

        let report = poller.shutdown().await;
        assert_eq!(report.dispatched, 1);
        assert_eq!(dispatcher.delivered()[0].text, "almost done");

        let status = poller.status_snapshot().await;
        assert!(!status.active);
        assert_eq!(status.total_dispatched, 1);
    }

    #[tokio::test]
    async fn status_counts_consecutive_failures() {
        let settings = BatchSettings {
            failure_alert_threshold: 2,
            ..BatchSettings::default()
        };
        let h = harness(&settings);
        let dispatcher = Arc::new(RecordingDispatcher::failing(3));
        let poller = poller(&h, &settings, dispatcher.clone());

        enqueue(&h, "79001234567", "a").await;
        for _ in 0..3 {
            poller.flush().await;
        }
        let status = poller.status_snapshot().await;
        assert_eq!(status.total_dispatch_failures, 3);
        assert_eq!(status.failing_senders.get("79001234567"), Some(&3));
        assert_eq!(status.cycles, 3);

        assert_eq!(poller.flush().await.dispatched, 1);
        assert!(poller.status_snapshot().await.failing_senders.is_empty());
    }

    #[tokio::test]
    async fn fragment_without_marker_after_dispatch_is_held() {
        let settings = BatchSettings::default();
        let h = harness(&settings);
        let dispatcher = Arc::new(RecordingDispatcher::default());
        let poller = poller(&h, &settings, dispatcher.clone());
        let s = sender("79001234567");

        enqueue(&h, "79001234567", "first").await;
        h.clock.advance(9_000);
        assert_eq!(poller.scan_once(ScanMode::Regular).await.dispatched, 1);

        h.memory
            .list_push(
                &h.batches.key_space().batch_key(&s),
                r#"{"text":"new burst","enqueued_at_millis":1700000009000}"#,
            )
            .await
            .expect("push");
        let report = poller.scan_once(ScanMode::Regular).await;
        assert_eq!(report.discovered, 1);
        assert_eq!(report.ready, 0);
        assert_eq!(dispatcher.delivered().len(), 1);
        assert_eq!(dispatcher.delivered()[0].text, "first");
    }

    #[tokio::test]
    async fn failing_sender_is_forgotten_once_its_batch_is_gone() {
        let settings = BatchSettings::default();
        let h = harness(&settings);
        let dispatcher = Arc::new(RecordingDispatcher::failing(2));
        let poller = poller(&h, &settings, dispatcher.clone());

        enqueue(&h, "79001234567", "expires").await;
        enqueue(&h, "79007654321", "discarded").await;
        assert_eq!(poller.flush().await.failed, 2);
        assert_eq!(poller.status_snapshot().await.failing_senders.len(), 2);

        h.batches
            .discard(&sender("79007654321"))
            .await
            .expect("discard");
        poller.scan_once(ScanMode::Regular).await;
        let failing = poller.status_snapshot().await.failing_senders;
        assert_eq!(failing.keys().collect::<Vec<_>>(), vec!["79001234567"]);

        h.clock.advance(120_000);
        poller.scan_once(ScanMode::Regular).await;
        assert!(poller.status_snapshot().await.failing_senders.is_empty());
        assert!(dispatcher.delivered().is_empty());
    }

    #[tokio::test]
    async fn batch_finished_by_another_consumer_is_not_redispatched_early() {
        let settings = BatchSettings::default();
        let (h, faulty) = faulty_harness(&settings);
        let dispatcher = Arc::new(RecordingDispatcher::default());
        let poller = poller(&h, &settings, dispatcher.clone());
        let s = sender("79001234567");

        enqueue(&h, "79001234567", "old").await;
        h.clock.advance(9_000);

        // Between this poller's evaluation and its claim, a peer dispatches
        // the old batch and the sender starts a new burst.
        let peer = h.batches.clone();
        let peer_sender = s.clone();
        faulty.run_before_next_claim(Box::pin(async move {
            let drained = peer.drain(&peer_sender).await.expect("peer drain");
            assert_eq!(drained.fragments[0].text, "old");
            peer.acknowledge(&drained).await.expect("peer ack");
            peer.enqueue(&peer_sender, "new burst", json!(null), json!(null))
                .await
                .expect("enqueue");
        }));

        let report = poller.scan_once(ScanMode::Regular).await;
        assert_eq!(report.dispatched, 0);
        assert_eq!(report.errors, 0);
        assert!(dispatcher.delivered().is_empty());
        assert_eq!(h.batches.size(&s).await.expect("size"), 1);

        h.clock.advance(9_000);
        let report = poller.scan_once(ScanMode::Regular).await;
        assert_eq!(report.dispatched, 1);
        assert_eq!(dispatcher.delivered()[0].text, "new burst");
    }

    #[tokio::test]
    async fn discarded_batch_is_never_dispatched() {
        let settings = BatchSettings::default();
        let h = harness(&settings);
        let dispatcher = Arc::new(RecordingDispatcher::default());
        let poller = poller(&h, &settings, dispatcher.clone());
        let s = sender("79001234567");

        enqueue(&h, "79001234567", "cancel me").await;
        h.clock.advance(9_000);
        h.batches.discard(&s).await.expect("discard");
        let report = poller.scan_once(ScanMode::Regular).await;
        h.batches.discard(&s).await.expect("discard again");
        let forced = poller.flush().await;

        for r in [report, forced] {
            assert_eq!(r.discovered, 0);
            assert_eq!(r.dispatched, 0);
            assert_eq!(r.errors, 0);
        }
        assert!(dispatcher.delivered().is_empty());
    }

    #[tokio::test]
    async fn dispatch_timeout_is_clamped_below_claim_lease() {
        let settings = BatchSettings {
            claim_lease_ms: 30_000,
            ..BatchSettings::default()
        };
        let h = harness(&settings);
        let poller = CoalescingPoller::new(
            h.batches.clone(),
            Arc::new(RecordingDispatcher::default()),
            settings.clone(),
            Duration::from_secs(60),
        );
        assert_eq!(poller.status_snapshot().await.dispatch_timeout_ms, 15_000);

        let within = CoalescingPoller::new(
            h.batches.clone(),
            Arc::new(RecordingDispatcher::default()),
            settings,
            Duration::from_secs(10),
        );
        assert_eq!(within.status_snapshot().await.dispatch_timeout_ms, 10_000);
    }
}
