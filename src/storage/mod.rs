// Durable storage seams for the pipeline core
//
// Each trait is implemented by the in-memory adapter (tests, single process)
// and by the SQLite adapter behind the `database` feature. Correctness of the
// command handler, dispatcher and lock service rests on the atomicity each
// method documents here, not on any in-process locking by the callers.

pub mod memory;
#[cfg(feature = "database")]
pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::model::{
    AuditEvent, GenerationLock, IdempotencyRecord, OutboxEntry, WorkflowState,
};

pub use memory::MemoryStore;
#[cfg(feature = "database")]
pub use sqlite::SqliteStore;

/// Errors raised by storage adapters
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Corrupt row in {table}: {reason}")]
    Corrupt { table: &'static str, reason: String },

    #[cfg(feature = "database")]
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[cfg(feature = "database")]
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

/// Every write a single transition performs
#[derive(Debug, Clone)]
pub struct TransitionUnit {
    pub state: WorkflowState,
    pub audit_event: AuditEvent,
    pub outbox_entries: Vec<OutboxEntry>,
    pub idempotency: IdempotencyRecord,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    Committed,
    /// Another caller already committed under this idempotency key; nothing
    /// from this unit was written
    DuplicateKey,
}

#[async_trait]
pub trait TransitionStore: Send + Sync {
    async fn find_idempotency_record(
        &self,
        idempotency_key: &str,
    ) -> Result<Option<IdempotencyRecord>, StoreError>;

    /// Apply all writes of `unit` atomically. The idempotency record is
    /// unique on its key: a conflicting insert rolls the whole unit back and
    /// reports `DuplicateKey`.
    async fn commit_transition(&self, unit: &TransitionUnit) -> Result<CommitOutcome, StoreError>;

    async fn workflow_state(&self, entity_id: &str) -> Result<Option<WorkflowState>, StoreError>;

    /// Audit events for one entity, oldest first
    async fn audit_events(&self, entity_id: &str) -> Result<Vec<AuditEvent>, StoreError>;
}

/// Parameters of one exclusive outbox claim
#[derive(Debug, Clone)]
pub struct ClaimRequest {
    pub claim_token: Uuid,
    pub batch_size: usize,
    pub max_attempts: u32,
    pub now: DateTime<Utc>,
    /// Claims older than this are considered abandoned and may be retaken
    pub claimed_until: DateTime<Utc>,
}

#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Atomically stamp `claim_token` on up to `batch_size` unprocessed,
    /// non-exhausted entries whose previous claim (if any) has lapsed, oldest
    /// `created_at` first, and return them. Two concurrent claims never
    /// return the same entry.
    async fn claim_pending(&self, request: &ClaimRequest) -> Result<Vec<OutboxEntry>, StoreError>;

    /// Set `processed_at`, bump `attempts` and drop the claim. Applies only
    /// while `claim_token` still owns the entry and it is unprocessed.
    async fn mark_processed(
        &self,
        id: Uuid,
        claim_token: Uuid,
        processed_at: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Bump `attempts`, record `last_error` and drop the claim so a later
    /// tick can retry. Same ownership rule as `mark_processed`.
    async fn record_failure(
        &self,
        id: Uuid,
        claim_token: Uuid,
        error: &str,
    ) -> Result<bool, StoreError>;

    /// Unprocessed entries still eligible for dispatch
    async fn pending_count(&self, max_attempts: u32) -> Result<u64, StoreError>;

    /// Unprocessed entries that ran out of attempts
    async fn exhausted_entries(&self, max_attempts: u32) -> Result<Vec<OutboxEntry>, StoreError>;

    /// Reset attempts and last error of an unprocessed entry
    async fn requeue(&self, id: Uuid) -> Result<bool, StoreError>;

    async fn entry(&self, id: Uuid) -> Result<Option<OutboxEntry>, StoreError>;

    async fn entries_for_entity(&self, entity_id: &str) -> Result<Vec<OutboxEntry>, StoreError>;
}

/// Outcome of a conditional lock write
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockWrite {
    Written(GenerationLock),
    /// A live lock was present; nothing was written
    Held(GenerationLock),
}

#[async_trait]
pub trait LockStore: Send + Sync {
    /// Write `candidate` if no lock row exists for its entity or the existing
    /// one expired at or before `now`. Check and write are one atomic step.
    async fn try_acquire(
        &self,
        candidate: &GenerationLock,
        now: DateTime<Utc>,
    ) -> Result<LockWrite, StoreError>;

    /// Raw row, expired or not
    async fn lock_row(&self, entity_id: &str) -> Result<Option<GenerationLock>, StoreError>;

    /// Delete the lock if it is live and held by `holder_id`
    async fn delete_if_held_by(
        &self,
        entity_id: &str,
        holder_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Delete any lock row for the entity. Returns whether a live lock was
    /// removed.
    async fn delete_lock(&self, entity_id: &str, now: DateTime<Utc>) -> Result<bool, StoreError>;

    async fn live_locks(&self, now: DateTime<Utc>) -> Result<Vec<GenerationLock>, StoreError>;
}
