//! Tests for the idempotent transition command handler.
//! Testing library/framework: Rust built-in test framework with Tokio async runtime (#[tokio::test]),
//! plus proptest for the replay property over arbitrary job lists.

use coursegen_pipeline::{
    CommandError, CommandHandler, JobKind, JobPayload, JobSpec, MemoryStore, OutboxStore,
    StageContext, StageData, TransitionRequest, TransitionStore,
};
use proptest::prelude::*;
use std::sync::Arc;

fn request(entity_id: &str, key: &str, state: &str, jobs: Vec<JobSpec>) -> TransitionRequest {
    TransitionRequest {
        entity_id: entity_id.to_string(),
        user_id: "user-1".to_string(),
        organization_id: "org-1".to_string(),
        idempotency_key: key.to_string(),
        initiated_by: "pipeline-orchestrator".to_string(),
        initial_state: state.to_string(),
        context_data: StageContext::new(StageData::DocumentProcessing {
            file_ids: vec!["f-1".to_string(), "f-2".to_string()],
        }),
        jobs,
    }
}

fn document_job(file_id: &str) -> JobSpec {
    JobSpec::for_payload(
        JobPayload::new(JobKind::DocumentProcessing {
            file_id: file_id.to_string(),
        }),
        0,
    )
}

#[tokio::test]
async fn replay_returns_identical_result_and_writes_once() {
    let store = Arc::new(MemoryStore::new());
    let handler = CommandHandler::new(store.clone());

    let jobs = vec![document_job("f-1"), document_job("f-2")];
    let first = handler
        .handle(request("c1", "k1", "stage_2_init", jobs.clone()))
        .await
        .unwrap();
    let replay = handler
        .handle(request("c1", "k1", "stage_2_init", jobs))
        .await
        .unwrap();

    assert!(!first.from_cache);
    assert!(replay.from_cache);
    assert_eq!(replay.state, first.state);
    assert_eq!(replay.outbox_entries, first.outbox_entries);

    assert_eq!(store.audit_events("c1").await.unwrap().len(), 1);
    assert_eq!(store.entries_for_entity("c1").await.unwrap().len(), 2);
}

#[tokio::test]
async fn replay_ignores_a_changed_request_body() {
    let store = Arc::new(MemoryStore::new());
    let handler = CommandHandler::new(store.clone());

    let first = handler
        .handle(request("c1", "k1", "stage_2_init", vec![document_job("f-1")]))
        .await
        .unwrap();
    let replay = handler
        .handle(request("c1", "k1", "stage_3_init", vec![]))
        .await
        .unwrap();

    assert!(replay.from_cache);
    assert_eq!(replay.state.state, "stage_2_init");
    assert_eq!(replay.outbox_entries, first.outbox_entries);
    assert_eq!(
        store.workflow_state("c1").await.unwrap().unwrap().state,
        "stage_2_init"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_callers_with_one_key_write_once() {
    let store = Arc::new(MemoryStore::new());
    let handler = Arc::new(CommandHandler::new(store.clone()));

    let mut tasks = Vec::new();
    for _ in 0..16 {
        let handler = handler.clone();
        tasks.push(tokio::spawn(async move {
            handler
                .handle(request("c1", "race-key", "stage_4_init", vec![document_job("f-9")]))
                .await
        }));
    }

    let mut results = Vec::new();
    for task in tasks {
        results.push(task.await.unwrap().unwrap());
    }

    let fresh = results.iter().filter(|result| !result.from_cache).count();
    assert_eq!(fresh, 1, "exactly one caller performs the write path");

    let winner = results.iter().find(|result| !result.from_cache).unwrap();
    for result in &results {
        assert_eq!(result.state, winner.state);
        assert_eq!(result.outbox_entries, winner.outbox_entries);
    }

    assert_eq!(store.audit_event_count().await, 1);
    assert_eq!(store.outbox_len().await, 1);
    assert_eq!(store.idempotency_record_count().await, 1);
}

#[tokio::test]
async fn storage_failure_leaves_nothing_behind_and_retry_succeeds() {
    let store = Arc::new(MemoryStore::new());
    let handler = CommandHandler::new(store.clone());
    store.fail_next_commits(1).await;

    let err = handler
        .handle(request("c1", "k1", "stage_2_init", vec![document_job("f-1")]))
        .await
        .unwrap_err();
    assert!(matches!(err, CommandError::Store(_)));

    assert!(store.workflow_state("c1").await.unwrap().is_none());
    assert_eq!(store.audit_event_count().await, 0);
    assert_eq!(store.outbox_len().await, 0);
    assert!(store.find_idempotency_record("k1").await.unwrap().is_none());

    let retried = handler
        .handle(request("c1", "k1", "stage_2_init", vec![document_job("f-1")]))
        .await
        .unwrap();
    assert!(!retried.from_cache);
    assert_eq!(retried.outbox_entries.len(), 1);
}

#[tokio::test]
async fn pure_transition_schedules_no_jobs() {
    let store = Arc::new(MemoryStore::new());
    let handler = CommandHandler::new(store.clone());

    let mut pure = request("c1", "k-pure", "stage_3_complete", vec![]);
    pure.context_data = StageContext::idle();
    let result = handler.handle(pure).await.unwrap();

    assert!(result.outbox_entries.is_empty());
    assert_eq!(result.state.context_data, StageContext::idle());
    assert_eq!(store.pending_count(5).await.unwrap(), 0);
    assert_eq!(store.audit_event_count().await, 1);
}

#[tokio::test]
async fn transitions_on_different_courses_are_independent() {
    let store = Arc::new(MemoryStore::new());
    let handler = Arc::new(CommandHandler::new(store.clone()));

    let (a, b) = tokio::join!(
        handler.handle(request("c1", "c1-k", "stage_2_init", vec![document_job("a")])),
        handler.handle(request("c2", "c2-k", "stage_5_init", vec![document_job("b")])),
    );
    assert!(!a.unwrap().from_cache);
    assert!(!b.unwrap().from_cache);

    assert_eq!(
        store.workflow_state("c1").await.unwrap().unwrap().state,
        "stage_2_init"
    );
    assert_eq!(
        store.workflow_state("c2").await.unwrap().unwrap().state,
        "stage_5_init"
    );
}

#[tokio::test]
async fn pending_outbox_entries_start_unprocessed() {
    let store = Arc::new(MemoryStore::new());
    let handler = CommandHandler::new(store.clone());

    let result = handler
        .handle(request("c1", "k1", "stage_2_init", vec![document_job("f-1")]))
        .await
        .unwrap();
    let entry = &result.outbox_entries[0];

    assert_eq!(entry.attempts, 0);
    assert!(entry.processed_at.is_none());
    assert!(entry.last_error.is_none());
    assert_eq!(entry.queue_name, "document_processing");
    assert_eq!(entry.entity_id, "c1");
}

fn job_strategy() -> impl Strategy<Value = JobSpec> {
    prop_oneof![
        "[a-z0-9]{1,8}".prop_map(|id| JobSpec::for_payload(
            JobPayload::new(JobKind::DocumentProcessing { file_id: id }),
            0
        )),
        "[a-z0-9]{1,8}".prop_map(|id| JobSpec::for_payload(
            JobPayload::new(JobKind::SummaryGeneration { file_id: id }),
            1
        )),
        (0i32..10).prop_map(|priority| JobSpec::for_payload(
            JobPayload::new(JobKind::StructureGeneration { analysis_id: None }),
            priority
        )),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn any_request_replayed_yields_one_write_set(
        jobs in prop::collection::vec(job_strategy(), 0..6),
        replays in 1usize..4,
    ) {
        tokio_test::block_on(async {
            let store = Arc::new(MemoryStore::new());
            let handler = CommandHandler::new(store.clone());
            let job_count = jobs.len();

            let first = handler
                .handle(request("c1", "prop-key", "stage_2_init", jobs.clone()))
                .await
                .unwrap();
            for _ in 0..replays {
                let again = handler
                    .handle(request("c1", "prop-key", "stage_2_init", jobs.clone()))
                    .await
                    .unwrap();
                assert!(again.from_cache);
                assert_eq!(again.outbox_entries, first.outbox_entries);
                assert_eq!(again.state, first.state);
            }

            assert_eq!(store.outbox_len().await, job_count);
            assert_eq!(store.audit_event_count().await, 1);
        });
    }
}
