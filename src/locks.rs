// Per-course generation locks
//
// Unlocked -> Locked(holder, expiry) -> Unlocked. A lock leaves the locked
// state on release, force-release, or when its expiry passes; expired rows
// are simply treated as absent, nothing evicts them in the background.
// No operation here waits for a lock to become free.

use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn, Instrument};

use crate::clock::{Clock, SystemClock};
use crate::config::LockConfig;
use crate::model::GenerationLock;
use crate::storage::{LockStore, LockWrite, StoreError};
use crate::telemetry::create_lock_span;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockAcquisition {
    Acquired(GenerationLock),
    /// Someone else holds a live lock; carries it for diagnostics
    Held {
        reason: String,
        existing: GenerationLock,
    },
}

impl LockAcquisition {
    pub fn is_acquired(&self) -> bool {
        matches!(self, LockAcquisition::Acquired(_))
    }

    pub fn existing_lock(&self) -> Option<&GenerationLock> {
        match self {
            LockAcquisition::Acquired(_) => None,
            LockAcquisition::Held { existing, .. } => Some(existing),
        }
    }
}

pub struct LockService {
    store: Arc<dyn LockStore>,
    clock: Arc<dyn Clock>,
    ttl: Duration,
}

impl LockService {
    pub fn new(store: Arc<dyn LockStore>, config: &LockConfig) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock),
            ttl: config.ttl(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Take the course's lock if it is free or expired. A live lock, even one
    /// held by `holder_id` itself, is reported as `Held`.
    pub async fn acquire_lock(
        &self,
        entity_id: &str,
        holder_id: &str,
    ) -> Result<LockAcquisition, StoreError> {
        let span = create_lock_span("acquire", entity_id, Some(holder_id));
        async move {
            let now = self.clock.now();
            let candidate = GenerationLock::new(entity_id, holder_id, now, self.ttl);

            match self.store.try_acquire(&candidate, now).await? {
                LockWrite::Written(lock) => {
                    info!(
                        entity_id = %entity_id,
                        holder_id = %holder_id,
                        expires_at = %lock.expires_at,
                        "Generation lock acquired"
                    );
                    Ok(LockAcquisition::Acquired(lock))
                }
                LockWrite::Held(existing) => {
                    debug!(
                        entity_id = %entity_id,
                        holder_id = %holder_id,
                        locked_by = %existing.locked_by,
                        "Generation lock already held"
                    );
                    Ok(LockAcquisition::Held {
                        reason: format!(
                            "Course {} is locked by {} until {}",
                            entity_id,
                            existing.locked_by,
                            existing.expires_at.to_rfc3339()
                        ),
                        existing,
                    })
                }
            }
        }
        .instrument(span)
        .await
    }

    /// Release the lock only if `holder_id` holds it. False means "not held
    /// by you" (or not held at all); the lock is left untouched.
    pub async fn release_lock(&self, entity_id: &str, holder_id: &str) -> Result<bool, StoreError> {
        let span = create_lock_span("release", entity_id, Some(holder_id));
        async move {
            let released = self
                .store
                .delete_if_held_by(entity_id, holder_id, self.clock.now())
                .await?;
            if released {
                info!(entity_id = %entity_id, holder_id = %holder_id, "Generation lock released");
            } else {
                debug!(
                    entity_id = %entity_id,
                    holder_id = %holder_id,
                    "Release ignored: lock not held by caller"
                );
            }
            Ok(released)
        }
        .instrument(span)
        .await
    }

    pub async fn is_locked(&self, entity_id: &str) -> Result<bool, StoreError> {
        Ok(self.get_lock(entity_id).await?.is_some())
    }

    /// Live lock for the course, if any
    pub async fn get_lock(&self, entity_id: &str) -> Result<Option<GenerationLock>, StoreError> {
        let now = self.clock.now();
        Ok(self
            .store
            .lock_row(entity_id)
            .await?
            .filter(|lock| !lock.is_expired(now)))
    }

    /// Remove the course's lock whoever holds it. Returns whether a live lock
    /// was removed, so a second call answers false.
    pub async fn force_release(&self, entity_id: &str) -> Result<bool, StoreError> {
        let span = create_lock_span("force_release", entity_id, None);
        async move {
            let removed = self.store.delete_lock(entity_id, self.clock.now()).await?;
            if removed {
                warn!(entity_id = %entity_id, "Generation lock force-released");
            }
            Ok(removed)
        }
        .instrument(span)
        .await
    }

    /// Every live lock, for operators
    pub async fn get_all_locks(&self) -> Result<Vec<GenerationLock>, StoreError> {
        self.store.live_locks(self.clock.now()).await
    }
}
