use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

use super::{
    ClaimRequest, CommitOutcome, LockStore, LockWrite, OutboxStore, StoreError, TransitionStore,
    TransitionUnit,
};
use crate::config::DatabaseConfig;
use crate::model::{AuditEvent, GenerationLock, IdempotencyRecord, OutboxEntry, WorkflowState};

const OUTBOX_COLUMNS: &str = "id, entity_id, queue_name, payload, priority, attempts, last_error, created_at, processed_at";

/// SQLite-backed store. Every multi-row write runs inside one transaction.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (creating if needed) the database and optionally run migrations
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, StoreError> {
        info!("Opening pipeline database at {}", config.url);

        let options = SqliteConnectOptions::from_str(&config.url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        if config.auto_migrate {
            store.migrate().await?;
        }
        Ok(store)
    }

    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        info!("Running database migrations...");
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("Database migrations completed");
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Close database connections gracefully
    pub async fn shutdown(&self) {
        info!("Shutting down database connections...");
        self.pool.close().await;
        info!("Database connections closed");
    }
}

fn to_ms(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn from_ms(table: &'static str, ms: i64) -> Result<DateTime<Utc>, StoreError> {
    DateTime::from_timestamp_millis(ms).ok_or_else(|| StoreError::Corrupt {
        table,
        reason: format!("timestamp out of range: {ms}"),
    })
}

fn parse_uuid(table: &'static str, raw: &str) -> Result<Uuid, StoreError> {
    Uuid::parse_str(raw).map_err(|e| StoreError::Corrupt {
        table,
        reason: format!("invalid id '{raw}': {e}"),
    })
}

fn outbox_from_row(row: &SqliteRow) -> Result<OutboxEntry, StoreError> {
    let id: String = row.try_get("id")?;
    let payload: String = row.try_get("payload")?;
    let attempts: i64 = row.try_get("attempts")?;
    let processed_at: Option<i64> = row.try_get("processed_at")?;

    Ok(OutboxEntry {
        id: parse_uuid("outbox_entry", &id)?,
        entity_id: row.try_get("entity_id")?,
        queue_name: row.try_get("queue_name")?,
        payload: serde_json::from_str(&payload)?,
        priority: row.try_get("priority")?,
        attempts: u32::try_from(attempts).map_err(|_| StoreError::Corrupt {
            table: "outbox_entry",
            reason: format!("negative attempts: {attempts}"),
        })?,
        last_error: row.try_get("last_error")?,
        created_at: from_ms("outbox_entry", row.try_get("created_at")?)?,
        processed_at: processed_at
            .map(|ms| from_ms("outbox_entry", ms))
            .transpose()?,
    })
}

fn lock_from_row(row: &SqliteRow) -> Result<GenerationLock, StoreError> {
    Ok(GenerationLock {
        entity_id: row.try_get("entity_id")?,
        locked_by: row.try_get("locked_by")?,
        locked_at: from_ms("generation_lock", row.try_get("locked_at")?)?,
        expires_at: from_ms("generation_lock", row.try_get("expires_at")?)?,
    })
}

#[async_trait]
impl TransitionStore for SqliteStore {
    async fn find_idempotency_record(
        &self,
        idempotency_key: &str,
    ) -> Result<Option<IdempotencyRecord>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT idempotency_key, result_snapshot, created_at
            FROM idempotency_record
            WHERE idempotency_key = ?1
            "#,
        )
        .bind(idempotency_key)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let snapshot: String = row.try_get("result_snapshot")?;
                Ok(Some(IdempotencyRecord {
                    idempotency_key: row.try_get("idempotency_key")?,
                    result_snapshot: serde_json::from_str(&snapshot)?,
                    created_at: from_ms("idempotency_record", row.try_get("created_at")?)?,
                }))
            }
            None => Ok(None),
        }
    }

    async fn commit_transition(&self, unit: &TransitionUnit) -> Result<CommitOutcome, StoreError> {
        let mut tx = self.pool.begin().await?;

        // Key first: a losing racer stops here without touching other tables
        let inserted = sqlx::query(
            r#"
            INSERT INTO idempotency_record (idempotency_key, result_snapshot, created_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT (idempotency_key) DO NOTHING
            "#,
        )
        .bind(&unit.idempotency.idempotency_key)
        .bind(serde_json::to_string(&unit.idempotency.result_snapshot)?)
        .bind(to_ms(unit.idempotency.created_at))
        .execute(&mut *tx)
        .await?;

        if inserted.rows_affected() == 0 {
            tx.rollback().await?;
            debug!(
                idempotency_key = %unit.idempotency.idempotency_key,
                "Idempotency key already committed"
            );
            return Ok(CommitOutcome::DuplicateKey);
        }

        sqlx::query(
            r#"
            INSERT INTO workflow_state (entity_id, state, context_data, updated_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT (entity_id) DO UPDATE SET
                state = excluded.state,
                context_data = excluded.context_data,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&unit.state.entity_id)
        .bind(&unit.state.state)
        .bind(serde_json::to_string(&unit.state.context_data)?)
        .bind(to_ms(unit.state.updated_at))
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO audit_event (id, entity_id, event_data, created_at)
            VALUES (?1, ?2, ?3, ?4)
            "#,
        )
        .bind(unit.audit_event.id.to_string())
        .bind(&unit.audit_event.entity_id)
        .bind(serde_json::to_string(&unit.audit_event.event_data)?)
        .bind(to_ms(unit.audit_event.created_at))
        .execute(&mut *tx)
        .await?;

        for entry in &unit.outbox_entries {
            sqlx::query(
                r#"
                INSERT INTO outbox_entry
                    (id, entity_id, queue_name, payload, priority, attempts, last_error, created_at, processed_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, NULL)
                "#,
            )
            .bind(entry.id.to_string())
            .bind(&entry.entity_id)
            .bind(&entry.queue_name)
            .bind(serde_json::to_string(&entry.payload)?)
            .bind(entry.priority)
            .bind(i64::from(entry.attempts))
            .bind(&entry.last_error)
            .bind(to_ms(entry.created_at))
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(CommitOutcome::Committed)
    }

    async fn workflow_state(&self, entity_id: &str) -> Result<Option<WorkflowState>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT entity_id, state, context_data, updated_at
            FROM workflow_state
            WHERE entity_id = ?1
            "#,
        )
        .bind(entity_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let context: String = row.try_get("context_data")?;
                Ok(Some(WorkflowState {
                    entity_id: row.try_get("entity_id")?,
                    state: row.try_get("state")?,
                    context_data: serde_json::from_str(&context)?,
                    updated_at: from_ms("workflow_state", row.try_get("updated_at")?)?,
                }))
            }
            None => Ok(None),
        }
    }

    async fn audit_events(&self, entity_id: &str) -> Result<Vec<AuditEvent>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, entity_id, event_data, created_at
            FROM audit_event
            WHERE entity_id = ?1
            ORDER BY created_at ASC, rowid ASC
            "#,
        )
        .bind(entity_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let id: String = row.try_get("id")?;
                let event_data: String = row.try_get("event_data")?;
                Ok(AuditEvent {
                    id: parse_uuid("audit_event", &id)?,
                    entity_id: row.try_get("entity_id")?,
                    event_data: serde_json::from_str(&event_data)?,
                    created_at: from_ms("audit_event", row.try_get("created_at")?)?,
                })
            })
            .collect()
    }
}

#[async_trait]
impl OutboxStore for SqliteStore {
    async fn claim_pending(&self, request: &ClaimRequest) -> Result<Vec<OutboxEntry>, StoreError> {
        // One statement: SQLite serialises writers, so the subselect and the
        // claim stamp cannot interleave with another dispatcher's claim.
        let sql = format!(
            r#"
            UPDATE outbox_entry
            SET claim_token = ?1, claimed_until = ?2
            WHERE id IN (
                SELECT id FROM outbox_entry
                WHERE processed_at IS NULL
                  AND attempts < ?3
                  AND (claimed_until IS NULL OR claimed_until <= ?4)
                ORDER BY created_at ASC, rowid ASC
                LIMIT ?5
            )
            RETURNING {OUTBOX_COLUMNS}
            "#
        );

        let rows = sqlx::query(&sql)
            .bind(request.claim_token.to_string())
            .bind(to_ms(request.claimed_until))
            .bind(i64::from(request.max_attempts))
            .bind(to_ms(request.now))
            .bind(i64::try_from(request.batch_size).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await?;

        let mut entries = rows
            .iter()
            .map(outbox_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        // RETURNING order is unspecified
        entries.sort_by_key(|entry| entry.created_at);
        Ok(entries)
    }

    async fn mark_processed(
        &self,
        id: Uuid,
        claim_token: Uuid,
        processed_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_entry
            SET processed_at = ?1,
                attempts = attempts + 1,
                claim_token = NULL,
                claimed_until = NULL
            WHERE id = ?2 AND claim_token = ?3 AND processed_at IS NULL
            "#,
        )
        .bind(to_ms(processed_at))
        .bind(id.to_string())
        .bind(claim_token.to_string())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn record_failure(
        &self,
        id: Uuid,
        claim_token: Uuid,
        error: &str,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_entry
            SET attempts = attempts + 1,
                last_error = ?1,
                claim_token = NULL,
                claimed_until = NULL
            WHERE id = ?2 AND claim_token = ?3 AND processed_at IS NULL
            "#,
        )
        .bind(error)
        .bind(id.to_string())
        .bind(claim_token.to_string())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn pending_count(&self, max_attempts: u32) -> Result<u64, StoreError> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM outbox_entry
            WHERE processed_at IS NULL AND attempts < ?1
            "#,
        )
        .bind(i64::from(max_attempts))
        .fetch_one(&self.pool)
        .await?;

        Ok(u64::try_from(count).unwrap_or(0))
    }

    async fn exhausted_entries(&self, max_attempts: u32) -> Result<Vec<OutboxEntry>, StoreError> {
        let sql = format!(
            r#"
            SELECT {OUTBOX_COLUMNS} FROM outbox_entry
            WHERE processed_at IS NULL AND attempts >= ?1
            ORDER BY created_at ASC, rowid ASC
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(i64::from(max_attempts))
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(outbox_from_row).collect()
    }

    async fn requeue(&self, id: Uuid) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_entry
            SET attempts = 0, last_error = NULL, claim_token = NULL, claimed_until = NULL
            WHERE id = ?1 AND processed_at IS NULL
            "#,
        )
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn entry(&self, id: Uuid) -> Result<Option<OutboxEntry>, StoreError> {
        let sql = format!("SELECT {OUTBOX_COLUMNS} FROM outbox_entry WHERE id = ?1");
        let row = sqlx::query(&sql)
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(outbox_from_row).transpose()
    }

    async fn entries_for_entity(&self, entity_id: &str) -> Result<Vec<OutboxEntry>, StoreError> {
        let sql = format!(
            r#"
            SELECT {OUTBOX_COLUMNS} FROM outbox_entry
            WHERE entity_id = ?1
            ORDER BY created_at ASC, rowid ASC
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(entity_id)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(outbox_from_row).collect()
    }
}

#[async_trait]
impl LockStore for SqliteStore {
    async fn try_acquire(
        &self,
        candidate: &GenerationLock,
        now: DateTime<Utc>,
    ) -> Result<LockWrite, StoreError> {
        let mut tx = self.pool.begin().await?;

        // Insert, or overwrite only a row that has already expired
        let written = sqlx::query(
            r#"
            INSERT INTO generation_lock (entity_id, locked_by, locked_at, expires_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT (entity_id) DO UPDATE SET
                locked_by = excluded.locked_by,
                locked_at = excluded.locked_at,
                expires_at = excluded.expires_at
            WHERE generation_lock.expires_at <= ?5
            "#,
        )
        .bind(&candidate.entity_id)
        .bind(&candidate.locked_by)
        .bind(to_ms(candidate.locked_at))
        .bind(to_ms(candidate.expires_at))
        .bind(to_ms(now))
        .execute(&mut *tx)
        .await?;

        if written.rows_affected() == 1 {
            tx.commit().await?;
            return Ok(LockWrite::Written(candidate.clone()));
        }

        let row = sqlx::query(
            r#"
            SELECT entity_id, locked_by, locked_at, expires_at
            FROM generation_lock
            WHERE entity_id = ?1
            "#,
        )
        .bind(&candidate.entity_id)
        .fetch_one(&mut *tx)
        .await?;
        let existing = lock_from_row(&row)?;
        tx.commit().await?;

        Ok(LockWrite::Held(existing))
    }

    async fn lock_row(&self, entity_id: &str) -> Result<Option<GenerationLock>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT entity_id, locked_by, locked_at, expires_at
            FROM generation_lock
            WHERE entity_id = ?1
            "#,
        )
        .bind(entity_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(lock_from_row).transpose()
    }

    async fn delete_if_held_by(
        &self,
        entity_id: &str,
        holder_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            DELETE FROM generation_lock
            WHERE entity_id = ?1 AND locked_by = ?2 AND expires_at > ?3
            "#,
        )
        .bind(entity_id)
        .bind(holder_id)
        .bind(to_ms(now))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn delete_lock(&self, entity_id: &str, now: DateTime<Utc>) -> Result<bool, StoreError> {
        let expires_at: Option<i64> = sqlx::query_scalar(
            r#"
            DELETE FROM generation_lock
            WHERE entity_id = ?1
            RETURNING expires_at
            "#,
        )
        .bind(entity_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(expires_at.is_some_and(|ms| ms > to_ms(now)))
    }

    async fn live_locks(&self, now: DateTime<Utc>) -> Result<Vec<GenerationLock>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT entity_id, locked_by, locked_at, expires_at
            FROM generation_lock
            WHERE expires_at > ?1
            ORDER BY entity_id ASC
            "#,
        )
        .bind(to_ms(now))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(lock_from_row).collect()
    }
}
