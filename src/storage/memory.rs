use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use super::{
    ClaimRequest, CommitOutcome, LockStore, LockWrite, OutboxStore, StoreError, TransitionStore,
    TransitionUnit,
};
use crate::model::{AuditEvent, GenerationLock, IdempotencyRecord, OutboxEntry, WorkflowState};

#[derive(Debug, Clone)]
struct OutboxRow {
    entry: OutboxEntry,
    claim_token: Option<Uuid>,
    claimed_until: Option<DateTime<Utc>>,
}

impl OutboxRow {
    fn owned_by(&self, claim_token: Uuid) -> bool {
        self.claim_token == Some(claim_token) && self.entry.processed_at.is_none()
    }
}

#[derive(Debug, Default)]
struct Tables {
    workflow_state: HashMap<String, WorkflowState>,
    audit_event: Vec<AuditEvent>,
    outbox_entry: Vec<OutboxRow>,
    idempotency_record: HashMap<String, IdempotencyRecord>,
    generation_lock: HashMap<String, GenerationLock>,
    failing_commits: u32,
}

/// Process-local store holding every table behind one async mutex.
///
/// Each trait call runs entirely under the mutex, which gives the same
/// atomic-unit and uniqueness guarantees the SQLite adapter gets from
/// transactions and primary keys.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` transition commits fail as if storage went away
    pub async fn fail_next_commits(&self, n: u32) {
        self.tables.lock().await.failing_commits = n;
    }

    pub async fn audit_event_count(&self) -> usize {
        self.tables.lock().await.audit_event.len()
    }

    pub async fn outbox_len(&self) -> usize {
        self.tables.lock().await.outbox_entry.len()
    }

    pub async fn idempotency_record_count(&self) -> usize {
        self.tables.lock().await.idempotency_record.len()
    }

    /// Outbox rows still carrying a claim token
    pub async fn claimed_count(&self) -> usize {
        self.tables
            .lock()
            .await
            .outbox_entry
            .iter()
            .filter(|row| row.claim_token.is_some())
            .count()
    }
}

#[async_trait]
impl TransitionStore for MemoryStore {
    async fn find_idempotency_record(
        &self,
        idempotency_key: &str,
    ) -> Result<Option<IdempotencyRecord>, StoreError> {
        Ok(self
            .tables
            .lock()
            .await
            .idempotency_record
            .get(idempotency_key)
            .cloned())
    }

    async fn commit_transition(&self, unit: &TransitionUnit) -> Result<CommitOutcome, StoreError> {
        let mut tables = self.tables.lock().await;

        if tables.failing_commits > 0 {
            tables.failing_commits -= 1;
            return Err(StoreError::Unavailable(
                "injected commit failure".to_string(),
            ));
        }

        let key = &unit.idempotency.idempotency_key;
        if tables.idempotency_record.contains_key(key) {
            debug!(idempotency_key = %key, "Idempotency key already committed");
            return Ok(CommitOutcome::DuplicateKey);
        }

        tables
            .workflow_state
            .insert(unit.state.entity_id.clone(), unit.state.clone());
        tables.audit_event.push(unit.audit_event.clone());
        tables
            .outbox_entry
            .extend(unit.outbox_entries.iter().cloned().map(|entry| OutboxRow {
                entry,
                claim_token: None,
                claimed_until: None,
            }));
        tables
            .idempotency_record
            .insert(key.clone(), unit.idempotency.clone());

        Ok(CommitOutcome::Committed)
    }

    async fn workflow_state(&self, entity_id: &str) -> Result<Option<WorkflowState>, StoreError> {
        Ok(self
            .tables
            .lock()
            .await
            .workflow_state
            .get(entity_id)
            .cloned())
    }

    async fn audit_events(&self, entity_id: &str) -> Result<Vec<AuditEvent>, StoreError> {
        let tables = self.tables.lock().await;
        let mut events: Vec<AuditEvent> = tables
            .audit_event
            .iter()
            .filter(|event| event.entity_id == entity_id)
            .cloned()
            .collect();
        events.sort_by_key(|event| event.created_at);
        Ok(events)
    }
}

#[async_trait]
impl OutboxStore for MemoryStore {
    async fn claim_pending(&self, request: &ClaimRequest) -> Result<Vec<OutboxEntry>, StoreError> {
        let mut tables = self.tables.lock().await;

        let mut eligible: Vec<usize> = tables
            .outbox_entry
            .iter()
            .enumerate()
            .filter(|(_, row)| {
                row.entry.processed_at.is_none()
                    && row.entry.attempts < request.max_attempts
                    && row
                        .claimed_until
                        .map_or(true, |until| until <= request.now)
            })
            .map(|(index, _)| index)
            .collect();
        // stable: insertion order breaks created_at ties
        eligible.sort_by_key(|&index| tables.outbox_entry[index].entry.created_at);
        eligible.truncate(request.batch_size);

        let mut claimed = Vec::with_capacity(eligible.len());
        for index in eligible {
            let row = &mut tables.outbox_entry[index];
            row.claim_token = Some(request.claim_token);
            row.claimed_until = Some(request.claimed_until);
            claimed.push(row.entry.clone());
        }
        Ok(claimed)
    }

    async fn mark_processed(
        &self,
        id: Uuid,
        claim_token: Uuid,
        processed_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut tables = self.tables.lock().await;
        match tables
            .outbox_entry
            .iter_mut()
            .find(|row| row.entry.id == id && row.owned_by(claim_token))
        {
            Some(row) => {
                row.entry.processed_at = Some(processed_at);
                row.entry.attempts += 1;
                row.claim_token = None;
                row.claimed_until = None;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn record_failure(
        &self,
        id: Uuid,
        claim_token: Uuid,
        error: &str,
    ) -> Result<bool, StoreError> {
        let mut tables = self.tables.lock().await;
        match tables
            .outbox_entry
            .iter_mut()
            .find(|row| row.entry.id == id && row.owned_by(claim_token))
        {
            Some(row) => {
                row.entry.attempts += 1;
                row.entry.last_error = Some(error.to_string());
                row.claim_token = None;
                row.claimed_until = None;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn pending_count(&self, max_attempts: u32) -> Result<u64, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .outbox_entry
            .iter()
            .filter(|row| row.entry.is_pending() && row.entry.attempts < max_attempts)
            .count() as u64)
    }

    async fn exhausted_entries(&self, max_attempts: u32) -> Result<Vec<OutboxEntry>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .outbox_entry
            .iter()
            .filter(|row| row.entry.is_exhausted(max_attempts))
            .map(|row| row.entry.clone())
            .collect())
    }

    async fn requeue(&self, id: Uuid) -> Result<bool, StoreError> {
        let mut tables = self.tables.lock().await;
        match tables
            .outbox_entry
            .iter_mut()
            .find(|row| row.entry.id == id && row.entry.is_pending())
        {
            Some(row) => {
                row.entry.attempts = 0;
                row.entry.last_error = None;
                row.claim_token = None;
                row.claimed_until = None;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn entry(&self, id: Uuid) -> Result<Option<OutboxEntry>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .outbox_entry
            .iter()
            .find(|row| row.entry.id == id)
            .map(|row| row.entry.clone()))
    }

    async fn entries_for_entity(&self, entity_id: &str) -> Result<Vec<OutboxEntry>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .outbox_entry
            .iter()
            .filter(|row| row.entry.entity_id == entity_id)
            .map(|row| row.entry.clone())
            .collect())
    }
}

#[async_trait]
impl LockStore for MemoryStore {
    async fn try_acquire(
        &self,
        candidate: &GenerationLock,
        now: DateTime<Utc>,
    ) -> Result<LockWrite, StoreError> {
        let mut tables = self.tables.lock().await;
        if let Some(existing) = tables.generation_lock.get(&candidate.entity_id) {
            if !existing.is_expired(now) {
                return Ok(LockWrite::Held(existing.clone()));
            }
        }
        tables
            .generation_lock
            .insert(candidate.entity_id.clone(), candidate.clone());
        Ok(LockWrite::Written(candidate.clone()))
    }

    async fn lock_row(&self, entity_id: &str) -> Result<Option<GenerationLock>, StoreError> {
        Ok(self
            .tables
            .lock()
            .await
            .generation_lock
            .get(entity_id)
            .cloned())
    }

    async fn delete_if_held_by(
        &self,
        entity_id: &str,
        holder_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut tables = self.tables.lock().await;
        let owned = tables
            .generation_lock
            .get(entity_id)
            .is_some_and(|lock| lock.locked_by == holder_id && !lock.is_expired(now));
        if owned {
            tables.generation_lock.remove(entity_id);
        }
        Ok(owned)
    }

    async fn delete_lock(&self, entity_id: &str, now: DateTime<Utc>) -> Result<bool, StoreError> {
        let mut tables = self.tables.lock().await;
        Ok(tables
            .generation_lock
            .remove(entity_id)
            .is_some_and(|lock| !lock.is_expired(now)))
    }

    async fn live_locks(&self, now: DateTime<Utc>) -> Result<Vec<GenerationLock>, StoreError> {
        let tables = self.tables.lock().await;
        let mut locks: Vec<GenerationLock> = tables
            .generation_lock
            .values()
            .filter(|lock| !lock.is_expired(now))
            .cloned()
            .collect();
        locks.sort_by(|a, b| a.entity_id.cmp(&b.entity_id));
        Ok(locks)
    }
}
