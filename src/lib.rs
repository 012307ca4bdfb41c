// Course generation pipeline core
// Idempotent workflow transitions, a transactional outbox with its
// dispatcher, and per-course generation locks.

pub mod clock;
pub mod command;
pub mod config;
pub mod locks;
pub mod model;
pub mod outbox;
pub mod payload;
pub mod queue;
pub mod storage;
pub mod telemetry;

// Re-export key types for easy access
pub use clock::{Clock, ManualClock, SystemClock};
pub use command::{CommandError, CommandHandler, JobSpec, TransitionRequest, TransitionResult};
pub use config::{DatabaseConfig, DispatcherConfig, LockConfig, ObservabilityConfig, PipelineConfig};
pub use locks::{LockAcquisition, LockService};
pub use model::{
    AuditEvent, AuditEventData, GenerationLock, IdempotencyRecord, OutboxEntry, TransitionSnapshot,
    WorkflowState,
};
pub use outbox::{DispatcherHandle, DispatcherMetrics, DispatcherStats, OutboxDispatcher, TickReport};
pub use payload::{JobKind, JobPayload, PayloadError, StageContext, StageData};
pub use queue::{EnqueueOptions, InMemoryWorkQueue, QueueError, WorkQueue};
pub use storage::{LockStore, MemoryStore, OutboxStore, StoreError, TransitionStore};
pub use telemetry::{generate_correlation_id, init_telemetry, shutdown_telemetry};
