use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

use super::metrics::DispatcherMetrics;
use crate::clock::{saturating_add, Clock, SystemClock};
use crate::config::DispatcherConfig;
use crate::model::OutboxEntry;
use crate::queue::{EnqueueOptions, WorkQueue};
use crate::storage::{ClaimRequest, OutboxStore, StoreError};
use crate::telemetry::create_dispatch_span;

/// What one claim-and-dispatch pass did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub claimed: usize,
    pub dispatched: usize,
    pub failed: usize,
    /// Entries whose failure used up their last attempt
    pub exhausted: usize,
    /// Entries whose claim lapsed and was retaken before this pass finished
    pub lost_claims: usize,
}

impl TickReport {
    fn absorb(&mut self, other: TickReport) {
        self.claimed += other.claimed;
        self.dispatched += other.dispatched;
        self.failed += other.failed;
        self.exhausted += other.exhausted;
        self.lost_claims += other.lost_claims;
    }
}

/// Turns pending outbox entries into work queue submissions.
///
/// Several dispatchers may run against one store: each tick stamps a fresh
/// claim token on its batch, so an entry is only ever worked by one of them
/// until the claim lapses.
pub struct OutboxDispatcher {
    store: Arc<dyn OutboxStore>,
    queue: Arc<dyn WorkQueue>,
    config: DispatcherConfig,
    clock: Arc<dyn Clock>,
    metrics: Arc<DispatcherMetrics>,
    instance_id: String,
}

impl OutboxDispatcher {
    pub fn new(
        store: Arc<dyn OutboxStore>,
        queue: Arc<dyn WorkQueue>,
        config: DispatcherConfig,
    ) -> Self {
        let instance_id = config
            .instance_id
            .clone()
            .unwrap_or_else(default_instance_id);
        Self {
            store,
            queue,
            config,
            clock: Arc::new(SystemClock),
            metrics: Arc::new(DispatcherMetrics::new()),
            instance_id,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn metrics(&self) -> Arc<DispatcherMetrics> {
        Arc::clone(&self.metrics)
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Claim one batch and dispatch every entry in it. Only a failed claim is
    /// an error; per-entry failures are recorded on the entry.
    pub async fn run_once(&self) -> Result<TickReport, StoreError> {
        let claim_token = Uuid::new_v4();
        let now = self.clock.now();
        let request = ClaimRequest {
            claim_token,
            batch_size: self.config.batch_size,
            max_attempts: self.config.max_attempts,
            now,
            claimed_until: saturating_add(now, self.config.claim_timeout()),
        };
        let span = create_dispatch_span(&self.instance_id, &claim_token.to_string());

        async move {
            let entries = self.store.claim_pending(&request).await?;
            let mut report = TickReport {
                claimed: entries.len(),
                ..TickReport::default()
            };

            if !entries.is_empty() {
                debug!(claimed = entries.len(), "Claimed outbox batch");
                for entry in entries {
                    self.dispatch_entry(entry, claim_token, &mut report).await;
                }
                self.metrics.record_batch();
            }

            match self.store.pending_count(self.config.max_attempts).await {
                Ok(depth) => self.metrics.set_queue_depth(depth),
                Err(e) => warn!(error = %e, "Failed to read outbox depth"),
            }

            Ok(report)
        }
        .instrument(span)
        .await
    }

    /// Tick until a pass claims nothing or `max_ticks` passes have run
    pub async fn run_until_idle(&self, max_ticks: usize) -> Result<TickReport, StoreError> {
        let mut total = TickReport::default();
        for _ in 0..max_ticks {
            let report = self.run_once().await?;
            total.absorb(report);
            if report.claimed == 0 {
                break;
            }
        }
        Ok(total)
    }

    async fn dispatch_entry(&self, entry: OutboxEntry, claim_token: Uuid, report: &mut TickReport) {
        let job_id = entry.job_id();

        let submitted = match entry.payload.validate_for_queue(&entry.queue_name) {
            Ok(()) => self
                .queue
                .enqueue(
                    &entry.queue_name,
                    &entry.payload,
                    EnqueueOptions {
                        priority: entry.priority,
                    },
                    &job_id,
                )
                .await
                .map_err(|e| (e.reason_code(), e.to_string())),
            Err(e) => Err(("invalid_payload", e.to_string())),
        };

        match submitted {
            Ok(queue_job_id) => {
                match self
                    .store
                    .mark_processed(entry.id, claim_token, self.clock.now())
                    .await
                {
                    Ok(true) => {
                        report.dispatched += 1;
                        self.metrics.record_job_created();
                        debug!(
                            outbox_id = %entry.id,
                            job_id = %queue_job_id,
                            queue = %entry.queue_name,
                            "Outbox entry dispatched"
                        );
                    }
                    Ok(false) => {
                        // The queue dedupes on job_id, so whoever retook the
                        // claim resubmits harmlessly
                        report.lost_claims += 1;
                        warn!(
                            outbox_id = %entry.id,
                            job_id = %job_id,
                            "Claim lapsed before the entry could be marked processed"
                        );
                    }
                    Err(e) => {
                        report.failed += 1;
                        self.metrics.record_failure("store_error");
                        error!(
                            outbox_id = %entry.id,
                            error = %e,
                            "Job submitted but marking the entry processed failed; it will be resubmitted after the claim lapses"
                        );
                    }
                }
            }
            Err((reason_code, message)) => {
                report.failed += 1;
                self.metrics.record_failure(reason_code);
                let attempts = entry.attempts + 1;

                match self
                    .store
                    .record_failure(entry.id, claim_token, &message)
                    .await
                {
                    Ok(true) if attempts >= self.config.max_attempts => {
                        report.exhausted += 1;
                        self.metrics.record_exhausted();
                        error!(
                            outbox_id = %entry.id,
                            entity_id = %entry.entity_id,
                            queue = %entry.queue_name,
                            attempts,
                            error = %message,
                            "Outbox entry exhausted its attempts and needs operator attention"
                        );
                    }
                    Ok(true) => {
                        warn!(
                            outbox_id = %entry.id,
                            queue = %entry.queue_name,
                            attempts,
                            error = %message,
                            "Outbox dispatch failed, will retry"
                        );
                    }
                    Ok(false) => {
                        report.lost_claims += 1;
                        warn!(
                            outbox_id = %entry.id,
                            "Claim lapsed before the failure could be recorded"
                        );
                    }
                    Err(e) => {
                        error!(
                            outbox_id = %entry.id,
                            error = %e,
                            "Failed to record outbox dispatch failure"
                        );
                    }
                }
            }
        }
    }

    /// Current number of dispatchable entries
    pub async fn queue_depth(&self) -> Result<u64, StoreError> {
        self.store.pending_count(self.config.max_attempts).await
    }

    /// Entries left for an operator after running out of attempts
    pub async fn exhausted_entries(&self) -> Result<Vec<OutboxEntry>, StoreError> {
        self.store.exhausted_entries(self.config.max_attempts).await
    }

    /// Give an exhausted (or failing) entry a fresh set of attempts
    pub async fn requeue(&self, id: Uuid) -> Result<bool, StoreError> {
        let requeued = self.store.requeue(id).await?;
        if requeued {
            info!(outbox_id = %id, "Outbox entry requeued by operator");
        }
        Ok(requeued)
    }

    /// Spawn the polling loop
    pub fn start(self: Arc<Self>) -> DispatcherHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(self.run_loop(shutdown_rx));
        DispatcherHandle {
            shutdown: shutdown_tx,
            task,
        }
    }

    async fn run_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(
            instance_id = %self.instance_id,
            poll_interval_ms = self.config.poll_interval_ms,
            batch_size = self.config.batch_size,
            "Outbox dispatcher started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            // Stop is only observed between ticks, so a claimed batch is
            // always carried through to its per-entry writes
            let full_batch = match self.run_once().await {
                Ok(report) => report.claimed > 0 && report.claimed >= self.config.batch_size,
                Err(e) => {
                    warn!(error = %e, "Outbox claim failed");
                    false
                }
            };
            if full_batch {
                continue;
            }

            tokio::select! {
                _ = tokio::time::sleep(self.next_delay()) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        self.metrics.log_stats();
        info!(instance_id = %self.instance_id, "Outbox dispatcher stopped");
    }

    fn next_delay(&self) -> Duration {
        let jitter = if self.config.poll_jitter_ms > 0 {
            rand::rng().random_range(0..=self.config.poll_jitter_ms)
        } else {
            0
        };
        self.config.poll_interval() + Duration::from_millis(jitter)
    }
}

fn default_instance_id() -> String {
    let host = hostname::get()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "dispatcher".to_string());
    format!("{}-{}", host, std::process::id())
}

/// Running dispatcher loop
pub struct DispatcherHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl DispatcherHandle {
    /// Ask the loop to exit and wait for it. A batch in flight finishes first.
    pub async fn stop(self) -> Result<(), JoinError> {
        // Err only if the loop already exited
        let _ = self.shutdown.send(true);
        self.task.await
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}
