use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::clock::saturating_add;
use crate::payload::{JobPayload, StageContext};

/// Live workflow state of one course. Overwritten on every transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowState {
    pub entity_id: String,
    /// Enum-like tag such as `stage_5_init`
    pub state: String,
    pub context_data: StageContext,
    pub updated_at: DateTime<Utc>,
}

/// Metadata captured in the audit log for each transition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEventData {
    pub initial_state: String,
    #[serde(default)]
    pub previous_state: Option<String>,
    pub user_id: String,
    pub organization_id: String,
    pub initiated_by: String,
    pub idempotency_key: String,
    pub job_count: usize,
}

/// Append-only transition record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: Uuid,
    pub entity_id: String,
    pub event_data: AuditEventData,
    pub created_at: DateTime<Utc>,
}

/// Intent to submit one job to the work queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxEntry {
    pub id: Uuid,
    pub entity_id: String,
    pub queue_name: String,
    pub payload: JobPayload,
    pub priority: i32,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

impl OutboxEntry {
    pub fn new(
        entity_id: &str,
        queue_name: &str,
        payload: JobPayload,
        priority: i32,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            entity_id: entity_id.to_string(),
            queue_name: queue_name.to_string(),
            payload,
            priority,
            attempts: 0,
            last_error: None,
            created_at,
            processed_at: None,
        }
    }

    /// Job id handed to the work queue. Derived from the entry id only, so a
    /// resubmission after a crash carries the same id.
    pub fn job_id(&self) -> String {
        format!("outbox-{}", self.id)
    }

    pub fn is_pending(&self) -> bool {
        self.processed_at.is_none()
    }

    pub fn is_exhausted(&self, max_attempts: u32) -> bool {
        self.is_pending() && self.attempts >= max_attempts
    }
}

/// Result of a transition, cached against its idempotency key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionSnapshot {
    pub state: WorkflowState,
    pub outbox_entries: Vec<OutboxEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub idempotency_key: String,
    pub result_snapshot: TransitionSnapshot,
    pub created_at: DateTime<Utc>,
}

/// Per-course mutual exclusion record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationLock {
    pub entity_id: String,
    pub locked_by: String,
    pub locked_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl GenerationLock {
    pub fn new(entity_id: &str, holder_id: &str, now: DateTime<Utc>, ttl: Duration) -> Self {
        Self {
            entity_id: entity_id.to_string(),
            locked_by: holder_id.to_string(),
            locked_at: now,
            expires_at: saturating_add(now, ttl),
        }
    }

    /// Expired locks are treated as absent everywhere
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    pub fn remaining(&self, now: DateTime<Utc>) -> Duration {
        if self.is_expired(now) {
            Duration::zero()
        } else {
            self.expires_at - now
        }
    }
}
