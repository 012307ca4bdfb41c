use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use tracing::info;

/// Counters the dispatcher exposes to the reporting layer
#[derive(Debug, Default)]
pub struct DispatcherMetrics {
    batches_processed: AtomicU64,
    jobs_created: AtomicU64,
    dispatch_failures: AtomicU64,
    exhausted_entries: AtomicU64,
    queue_depth: AtomicU64,
    error_reasons: Mutex<BTreeMap<String, u64>>,
}

impl DispatcherMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_batch(&self) {
        self.batches_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_job_created(&self) {
        self.jobs_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self, reason: &str) {
        self.dispatch_failures.fetch_add(1, Ordering::Relaxed);
        let mut reasons = self
            .error_reasons
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *reasons.entry(reason.to_string()).or_insert(0) += 1;
    }

    pub fn record_exhausted(&self) {
        self.exhausted_entries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_queue_depth(&self, depth: u64) {
        self.queue_depth.store(depth, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DispatcherStats {
        DispatcherStats {
            batches_processed: self.batches_processed.load(Ordering::Relaxed),
            jobs_created: self.jobs_created.load(Ordering::Relaxed),
            dispatch_failures: self.dispatch_failures.load(Ordering::Relaxed),
            exhausted_entries: self.exhausted_entries.load(Ordering::Relaxed),
            queue_depth: self.queue_depth.load(Ordering::Relaxed),
            error_reasons: self
                .error_reasons
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
        }
    }

    pub fn log_stats(&self) {
        let stats = self.snapshot();
        info!(
            "Outbox dispatcher metrics: batches={}, jobs_created={}, failures={}, exhausted={}, queue_depth={}",
            stats.batches_processed,
            stats.jobs_created,
            stats.dispatch_failures,
            stats.exhausted_entries,
            stats.queue_depth
        );
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatcherStats {
    pub batches_processed: u64,
    pub jobs_created: u64,
    pub dispatch_failures: u64,
    pub exhausted_entries: u64,
    /// Dispatchable entries left after the last tick
    pub queue_depth: u64,
    /// Failure count per reason code
    pub error_reasons: BTreeMap<String, u64>,
}
