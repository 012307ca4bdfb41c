//! SQLite store tests: transactional commit, claim exclusivity and atomic lock writes.
//! Testing library/framework: Rust built-in test framework with Tokio async runtime (#[tokio::test]),
//! tempfile for throwaway database files.
#![cfg(feature = "database")]

use chrono::{DateTime, Duration, Utc};
use coursegen_pipeline::storage::{ClaimRequest, SqliteStore};
use coursegen_pipeline::{
    CommandHandler, DatabaseConfig, DispatcherConfig, InMemoryWorkQueue, JobKind, JobPayload,
    JobSpec, LockConfig, LockService, ManualClock, OutboxDispatcher, OutboxStore, StageContext,
    StageData, TransitionRequest, TransitionStore,
};
use std::collections::HashSet;
use std::sync::Arc;
use tempfile::TempDir;
use uuid::Uuid;

async fn open_store() -> (Arc<SqliteStore>, TempDir) {
    let dir = TempDir::new().unwrap();
    let config = DatabaseConfig {
        url: format!("sqlite://{}", dir.path().join("pipeline.db").display()),
        max_connections: 4,
        auto_migrate: true,
    };
    let store = SqliteStore::connect(&config).await.unwrap();
    (Arc::new(store), dir)
}

fn request(entity_id: &str, key: &str, jobs: usize) -> TransitionRequest {
    TransitionRequest {
        entity_id: entity_id.to_string(),
        user_id: "user-1".to_string(),
        organization_id: "org-1".to_string(),
        idempotency_key: key.to_string(),
        initiated_by: "pipeline-orchestrator".to_string(),
        initial_state: "stage_2_init".to_string(),
        context_data: StageContext::new(StageData::DocumentProcessing {
            file_ids: vec!["f-1".to_string()],
        }),
        jobs: (0..jobs)
            .map(|n| {
                JobSpec::for_payload(
                    JobPayload::new(JobKind::DocumentProcessing {
                        file_id: format!("f-{n}"),
                    }),
                    n as i32,
                )
            })
            .collect(),
    }
}

#[tokio::test]
async fn transition_round_trips_and_replays_from_disk() {
    let (store, _dir) = open_store().await;
    let handler = CommandHandler::new(store.clone());

    let first = handler.handle(request("c1", "k1", 2)).await.unwrap();
    let replay = handler.handle(request("c1", "k1", 2)).await.unwrap();

    assert!(!first.from_cache);
    assert!(replay.from_cache);
    assert_eq!(replay.state, first.state);
    assert_eq!(replay.outbox_entries, first.outbox_entries);

    let stored = store.workflow_state("c1").await.unwrap().unwrap();
    assert_eq!(stored, first.state);
    assert_eq!(store.audit_events("c1").await.unwrap().len(), 1);

    let entries = store.entries_for_entity("c1").await.unwrap();
    assert_eq!(entries.len(), 2);
    for entry in &first.outbox_entries {
        assert_eq!(store.entry(entry.id).await.unwrap().as_ref(), Some(entry));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_commits_on_one_key_leave_one_write_set() {
    let (store, _dir) = open_store().await;
    let handler = Arc::new(CommandHandler::new(store.clone()));

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let handler = handler.clone();
        tasks.push(tokio::spawn(async move {
            handler.handle(request("c1", "race", 3)).await
        }));
    }

    let mut fresh = 0;
    let mut entry_sets = HashSet::new();
    for task in tasks {
        let result = task.await.unwrap().unwrap();
        if !result.from_cache {
            fresh += 1;
        }
        let ids: Vec<Uuid> = result.outbox_entries.iter().map(|entry| entry.id).collect();
        entry_sets.insert(ids);
    }

    assert_eq!(fresh, 1);
    assert_eq!(entry_sets.len(), 1);
    assert_eq!(store.entries_for_entity("c1").await.unwrap().len(), 3);
    assert_eq!(store.audit_events("c1").await.unwrap().len(), 1);
}

#[tokio::test]
async fn claims_are_exclusive_until_they_lapse() {
    let (store, _dir) = open_store().await;
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let handler = CommandHandler::with_clock(store.clone(), clock.clone());
    handler.handle(request("c1", "k1", 4)).await.unwrap();

    let now = Utc::now();
    let claim = |token: Uuid, at: DateTime<Utc>| ClaimRequest {
        claim_token: token,
        batch_size: 3,
        max_attempts: 5,
        now: at,
        claimed_until: at + Duration::seconds(30),
    };

    let first_token = Uuid::new_v4();
    let first = store.claim_pending(&claim(first_token, now)).await.unwrap();
    let second = store.claim_pending(&claim(Uuid::new_v4(), now)).await.unwrap();
    assert_eq!(first.len(), 3);
    assert_eq!(second.len(), 1);

    let first_ids: HashSet<Uuid> = first.iter().map(|entry| entry.id).collect();
    assert!(!first_ids.contains(&second[0].id));

    // oldest first: priorities were assigned in insertion order
    let mut priorities: Vec<i32> = first.iter().map(|entry| entry.priority).collect();
    priorities.sort();
    assert_eq!(priorities, vec![0, 1, 2]);

    let retaken = store
        .claim_pending(&claim(Uuid::new_v4(), now + Duration::seconds(31)))
        .await
        .unwrap();
    assert_eq!(retaken.len(), 3);

    // the original claimant lost its rows
    assert!(!store
        .mark_processed(first[0].id, first_token, now)
        .await
        .unwrap());
}

#[tokio::test]
async fn failure_bookkeeping_and_requeue() {
    let (store, _dir) = open_store().await;
    let handler = CommandHandler::new(store.clone());
    let result = handler.handle(request("c1", "k1", 1)).await.unwrap();
    let id = result.outbox_entries[0].id;

    for _ in 0..2 {
        let token = Uuid::new_v4();
        let now = Utc::now();
        let claimed = store
            .claim_pending(&ClaimRequest {
                claim_token: token,
                batch_size: 10,
                max_attempts: 2,
                now,
                claimed_until: now + Duration::seconds(30),
            })
            .await
            .unwrap();
        assert_eq!(claimed.len(), 1);
        assert!(store.record_failure(id, token, "queue down").await.unwrap());
    }

    assert_eq!(store.pending_count(2).await.unwrap(), 0);
    let exhausted = store.exhausted_entries(2).await.unwrap();
    assert_eq!(exhausted.len(), 1);
    assert_eq!(exhausted[0].attempts, 2);
    assert_eq!(exhausted[0].last_error.as_deref(), Some("queue down"));

    assert!(store.requeue(id).await.unwrap());
    assert_eq!(store.pending_count(2).await.unwrap(), 1);
    assert!(store.exhausted_entries(2).await.unwrap().is_empty());
}

#[tokio::test]
async fn dispatcher_drains_sqlite_outbox() {
    let (store, _dir) = open_store().await;
    let handler = CommandHandler::new(store.clone());
    for course in 0..3 {
        handler
            .handle(request(&format!("c{course}"), &format!("k{course}"), 2))
            .await
            .unwrap();
    }

    let queue = Arc::new(InMemoryWorkQueue::new());
    let dispatcher = OutboxDispatcher::new(
        store.clone(),
        queue.clone(),
        DispatcherConfig {
            batch_size: 4,
            instance_id: Some("sqlite-test".to_string()),
            ..DispatcherConfig::default()
        },
    );

    let report = dispatcher.run_until_idle(10).await.unwrap();
    assert_eq!(report.dispatched, 6);
    assert_eq!(queue.jobs().await.len(), 6);
    assert_eq!(dispatcher.queue_depth().await.unwrap(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn lock_acquisition_is_atomic_on_disk() {
    let (store, _dir) = open_store().await;
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let locks = Arc::new(
        LockService::new(store.clone(), &LockConfig { ttl_seconds: 60 }).with_clock(clock.clone()),
    );

    let mut tasks = Vec::new();
    for n in 0..6 {
        let locks = locks.clone();
        tasks.push(tokio::spawn(async move {
            locks.acquire_lock("c1", &format!("worker-{n}")).await
        }));
    }
    let mut acquired = 0;
    for task in tasks {
        if task.await.unwrap().unwrap().is_acquired() {
            acquired += 1;
        }
    }
    assert_eq!(acquired, 1);

    let holder = locks.get_lock("c1").await.unwrap().unwrap().locked_by;
    assert!(!locks.release_lock("c1", "intruder").await.unwrap());

    clock.advance(Duration::seconds(61));
    assert!(locks.get_all_locks().await.unwrap().is_empty());
    assert!(!locks.release_lock("c1", &holder).await.unwrap());
    assert!(locks.acquire_lock("c1", "late-worker").await.unwrap().is_acquired());

    assert!(locks.force_release("c1").await.unwrap());
    assert!(!locks.force_release("c1").await.unwrap());
}
