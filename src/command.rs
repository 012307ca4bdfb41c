// Idempotent workflow transition handler
//
// A transition upserts the course's workflow state, appends an audit event,
// writes one outbox entry per follow-on job and records the result under the
// caller's idempotency key, all as one storage unit. Replays of a key return
// the recorded result without writing anything.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn, Instrument};
use uuid::Uuid;

use crate::clock::{Clock, SystemClock};
use crate::model::{
    AuditEvent, AuditEventData, IdempotencyRecord, OutboxEntry, TransitionSnapshot, WorkflowState,
};
use crate::payload::{JobPayload, PayloadError, StageContext};
use crate::storage::{CommitOutcome, StoreError, TransitionStore, TransitionUnit};
use crate::telemetry::{create_transition_span, generate_correlation_id};

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("Invalid transition request: {0}")]
    InvalidRequest(String),

    #[error("Invalid payload: {0}")]
    InvalidPayload(#[from] PayloadError),

    #[error("Storage failure: {0}")]
    Store(#[from] StoreError),

    #[error("Idempotency key '{0}' conflicted but no committed record was found")]
    MissingIdempotencyRecord(String),
}

/// One follow-on job to schedule with the transition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    pub queue_name: String,
    pub payload: JobPayload,
    #[serde(default)]
    pub priority: i32,
}

impl JobSpec {
    /// Job on the queue its payload kind belongs to
    pub fn for_payload(payload: JobPayload, priority: i32) -> Self {
        Self {
            queue_name: payload.job.queue_name().to_string(),
            payload,
            priority,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionRequest {
    pub entity_id: String,
    pub user_id: String,
    pub organization_id: String,
    pub idempotency_key: String,
    pub initiated_by: String,
    pub initial_state: String,
    pub context_data: StageContext,
    /// Empty for a pure state transition
    #[serde(default)]
    pub jobs: Vec<JobSpec>,
}

impl TransitionRequest {
    fn validate(&self) -> Result<(), CommandError> {
        if self.entity_id.trim().is_empty() {
            return Err(CommandError::InvalidRequest(
                "entity_id must not be empty".to_string(),
            ));
        }
        if self.initial_state.trim().is_empty() {
            return Err(CommandError::InvalidRequest(
                "initial_state must not be empty".to_string(),
            ));
        }
        self.context_data.validate()?;
        for job in &self.jobs {
            if job.queue_name.trim().is_empty() {
                return Err(CommandError::InvalidRequest(
                    "job queue_name must not be empty".to_string(),
                ));
            }
            job.payload.validate_for_queue(&job.queue_name)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionResult {
    pub state: WorkflowState,
    pub outbox_entries: Vec<OutboxEntry>,
    /// True when the result was replayed from the idempotency record
    pub from_cache: bool,
}

impl TransitionResult {
    fn from_snapshot(snapshot: TransitionSnapshot, from_cache: bool) -> Self {
        Self {
            state: snapshot.state,
            outbox_entries: snapshot.outbox_entries,
            from_cache,
        }
    }
}

/// Applies workflow transitions exactly once per idempotency key.
///
/// Holds no state between calls; any number of handlers may share one store.
pub struct CommandHandler {
    store: Arc<dyn TransitionStore>,
    clock: Arc<dyn Clock>,
}

impl CommandHandler {
    pub fn new(store: Arc<dyn TransitionStore>) -> Self {
        Self::with_clock(store, Arc::new(SystemClock))
    }

    pub fn with_clock(store: Arc<dyn TransitionStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    pub async fn handle(&self, request: TransitionRequest) -> Result<TransitionResult, CommandError> {
        if request.idempotency_key.trim().is_empty() {
            return Err(CommandError::InvalidRequest(
                "idempotency_key must not be empty".to_string(),
            ));
        }

        let correlation_id = generate_correlation_id();
        let span = create_transition_span(
            &request.entity_id,
            &request.idempotency_key,
            &correlation_id,
        );

        async move {
            if let Some(record) = self
                .store
                .find_idempotency_record(&request.idempotency_key)
                .await?
            {
                debug!(
                    idempotency_key = %request.idempotency_key,
                    "Replaying cached transition result"
                );
                return Ok(TransitionResult::from_snapshot(record.result_snapshot, true));
            }

            request.validate()?;

            let previous_state = self
                .store
                .workflow_state(&request.entity_id)
                .await?
                .map(|state| state.state);
            let unit = self.build_unit(&request, previous_state);

            match self.store.commit_transition(&unit).await {
                Ok(CommitOutcome::Committed) => {
                    info!(
                        entity_id = %request.entity_id,
                        state = %request.initial_state,
                        jobs = unit.outbox_entries.len(),
                        initiated_by = %request.initiated_by,
                        "Workflow transition committed"
                    );
                    Ok(TransitionResult::from_snapshot(
                        unit.idempotency.result_snapshot,
                        false,
                    ))
                }
                Ok(CommitOutcome::DuplicateKey) => {
                    // Lost the race on this key; the winner's result is the answer
                    debug!(
                        idempotency_key = %request.idempotency_key,
                        "Concurrent transition won the idempotency key"
                    );
                    let record = self
                        .store
                        .find_idempotency_record(&request.idempotency_key)
                        .await?
                        .ok_or_else(|| {
                            CommandError::MissingIdempotencyRecord(request.idempotency_key.clone())
                        })?;
                    Ok(TransitionResult::from_snapshot(record.result_snapshot, true))
                }
                Err(e) => {
                    warn!(
                        entity_id = %request.entity_id,
                        error = %e,
                        "Workflow transition aborted; safe to retry with the same idempotency key"
                    );
                    Err(e.into())
                }
            }
        }
        .instrument(span)
        .await
    }

    pub async fn current_state(&self, entity_id: &str) -> Result<Option<WorkflowState>, CommandError> {
        Ok(self.store.workflow_state(entity_id).await?)
    }

    pub async fn audit_trail(&self, entity_id: &str) -> Result<Vec<AuditEvent>, CommandError> {
        Ok(self.store.audit_events(entity_id).await?)
    }

    fn build_unit(&self, request: &TransitionRequest, previous_state: Option<String>) -> TransitionUnit {
        let now = self.clock.now();

        let state = WorkflowState {
            entity_id: request.entity_id.clone(),
            state: request.initial_state.clone(),
            context_data: request.context_data.clone(),
            updated_at: now,
        };

        let outbox_entries: Vec<OutboxEntry> = request
            .jobs
            .iter()
            .map(|job| {
                OutboxEntry::new(
                    &request.entity_id,
                    &job.queue_name,
                    job.payload.clone(),
                    job.priority,
                    now,
                )
            })
            .collect();

        let audit_event = AuditEvent {
            id: Uuid::new_v4(),
            entity_id: request.entity_id.clone(),
            event_data: AuditEventData {
                initial_state: request.initial_state.clone(),
                previous_state,
                user_id: request.user_id.clone(),
                organization_id: request.organization_id.clone(),
                initiated_by: request.initiated_by.clone(),
                idempotency_key: request.idempotency_key.clone(),
                job_count: outbox_entries.len(),
            },
            created_at: now,
        };

        let idempotency = IdempotencyRecord {
            idempotency_key: request.idempotency_key.clone(),
            result_snapshot: TransitionSnapshot {
                state: state.clone(),
                outbox_entries: outbox_entries.clone(),
            },
            created_at: now,
        };

        TransitionUnit {
            state,
            audit_event,
            outbox_entries,
            idempotency,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::{JobKind, StageData};
    use crate::storage::MemoryStore;

    fn request(key: &str, jobs: Vec<JobSpec>) -> TransitionRequest {
        TransitionRequest {
            entity_id: "c1".to_string(),
            user_id: "u1".to_string(),
            organization_id: "org1".to_string(),
            idempotency_key: key.to_string(),
            initiated_by: "stage-4-handler".to_string(),
            initial_state: "stage_5_init".to_string(),
            context_data: StageContext::new(StageData::StructureGeneration {
                analysis_id: Some("an-1".to_string()),
                lesson_count: None,
            }),
            jobs,
        }
    }

    fn structure_job() -> JobSpec {
        JobSpec::for_payload(
            JobPayload::new(JobKind::StructureGeneration {
                analysis_id: Some("an-1".to_string()),
            }),
            5,
        )
    }

    #[tokio::test]
    async fn first_call_writes_and_replay_reads_cache() {
        let store = Arc::new(MemoryStore::new());
        let handler = CommandHandler::new(store.clone());

        let first = handler
            .handle(request("k1", vec![structure_job()]))
            .await
            .unwrap();
        assert!(!first.from_cache);
        assert_eq!(first.state.state, "stage_5_init");
        assert_eq!(first.outbox_entries.len(), 1);

        let second = handler
            .handle(request("k1", vec![structure_job()]))
            .await
            .unwrap();
        assert!(second.from_cache);
        assert_eq!(second.state, first.state);
        assert_eq!(second.outbox_entries, first.outbox_entries);

        assert_eq!(store.audit_event_count().await, 1);
        assert_eq!(store.outbox_len().await, 1);
    }

    #[tokio::test]
    async fn empty_idempotency_key_is_rejected() {
        let store = Arc::new(MemoryStore::new());
        let handler = CommandHandler::new(store.clone());

        let err = handler.handle(request("  ", vec![])).await.unwrap_err();
        assert!(matches!(err, CommandError::InvalidRequest(_)));
        assert_eq!(store.audit_event_count().await, 0);
    }

    #[tokio::test]
    async fn mismatched_job_is_rejected_before_any_write() {
        let store = Arc::new(MemoryStore::new());
        let handler = CommandHandler::new(store.clone());

        let mut job = structure_job();
        job.queue_name = "lesson_content".to_string();
        let err = handler.handle(request("k2", vec![job])).await.unwrap_err();

        assert!(matches!(err, CommandError::InvalidPayload(_)));
        assert_eq!(store.outbox_len().await, 0);
        assert_eq!(store.idempotency_record_count().await, 0);
    }

    #[tokio::test]
    async fn audit_event_records_previous_state() {
        let store = Arc::new(MemoryStore::new());
        let handler = CommandHandler::new(store.clone());

        handler.handle(request("k1", vec![])).await.unwrap();
        let mut next = request("k2", vec![]);
        next.initial_state = "stage_6_init".to_string();
        handler.handle(next).await.unwrap();

        let trail = handler.audit_trail("c1").await.unwrap();
        assert_eq!(trail.len(), 2);
        assert_eq!(trail[0].event_data.previous_state, None);
        assert_eq!(
            trail[1].event_data.previous_state.as_deref(),
            Some("stage_5_init")
        );
        assert_eq!(
            handler.current_state("c1").await.unwrap().unwrap().state,
            "stage_6_init"
        );
    }
}
