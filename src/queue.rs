// Work queue boundary
//
// The only assumption made about the external queue is that submitting the
// same dedupe key twice does not create a second job.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::Mutex;

#[cfg(any(test, feature = "testing"))]
use mockall::automock;

use crate::payload::JobPayload;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnqueueOptions {
    pub priority: i32,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QueueError {
    #[error("Queue '{queue}' is unavailable: {reason}")]
    Unavailable { queue: String, reason: String },

    #[error("Job rejected by queue '{queue}': {reason}")]
    Rejected { queue: String, reason: String },
}

impl QueueError {
    /// Short label used to bucket failures in metrics
    pub fn reason_code(&self) -> &'static str {
        match self {
            QueueError::Unavailable { .. } => "queue_unavailable",
            QueueError::Rejected { .. } => "queue_rejected",
        }
    }
}

#[cfg_attr(any(test, feature = "testing"), automock)]
#[async_trait]
pub trait WorkQueue: Send + Sync {
    /// Submit a job and return its queue-side id. Resubmitting an already
    /// known `dedupe_key` returns the existing job's id.
    async fn enqueue(
        &self,
        queue_name: &str,
        payload: &JobPayload,
        options: EnqueueOptions,
        dedupe_key: &str,
    ) -> Result<String, QueueError>;
}

/// Job as seen by the in-memory queue
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedJob {
    pub job_id: String,
    pub queue_name: String,
    pub payload: JobPayload,
    pub priority: i32,
    /// Times this job id was submitted, including merged duplicates
    pub submissions: u32,
}

#[derive(Debug, Default)]
struct QueueState {
    jobs: HashMap<String, QueuedJob>,
    order: Vec<String>,
    failures_remaining: HashMap<String, u32>,
    total_submissions: u64,
}

/// Deduplicating in-process queue, used in tests and local runs
#[derive(Debug, Default)]
pub struct InMemoryWorkQueue {
    state: Mutex<QueueState>,
}

impl InMemoryWorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `times` submissions to `queue_name`
    pub async fn fail_queue(&self, queue_name: &str, times: u32) {
        self.state
            .lock()
            .await
            .failures_remaining
            .insert(queue_name.to_string(), times);
    }

    /// Distinct jobs, in first-submission order
    pub async fn jobs(&self) -> Vec<QueuedJob> {
        let state = self.state.lock().await;
        state
            .order
            .iter()
            .filter_map(|job_id| state.jobs.get(job_id).cloned())
            .collect()
    }

    pub async fn job(&self, job_id: &str) -> Option<QueuedJob> {
        self.state.lock().await.jobs.get(job_id).cloned()
    }

    /// Accepted submissions, duplicates included
    pub async fn total_submissions(&self) -> u64 {
        self.state.lock().await.total_submissions
    }
}

#[async_trait]
impl WorkQueue for InMemoryWorkQueue {
    async fn enqueue(
        &self,
        queue_name: &str,
        payload: &JobPayload,
        options: EnqueueOptions,
        dedupe_key: &str,
    ) -> Result<String, QueueError> {
        let mut state = self.state.lock().await;

        if let Some(remaining) = state.failures_remaining.get_mut(queue_name) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(QueueError::Unavailable {
                    queue: queue_name.to_string(),
                    reason: "injected failure".to_string(),
                });
            }
        }

        state.total_submissions += 1;
        if let Some(existing) = state.jobs.get_mut(dedupe_key) {
            existing.submissions += 1;
            return Ok(existing.job_id.clone());
        }

        state.jobs.insert(
            dedupe_key.to_string(),
            QueuedJob {
                job_id: dedupe_key.to_string(),
                queue_name: queue_name.to_string(),
                payload: payload.clone(),
                priority: options.priority,
                submissions: 1,
            },
        );
        state.order.push(dedupe_key.to_string());
        Ok(dedupe_key.to_string())
    }
}
