// Transactional outbox dispatch
// Pending outbox entries written by the command handler are claimed in
// batches and submitted to the work queue under a job id derived from the
// entry, so a resubmission after a crash is merged by the queue.

pub mod dispatcher;
pub mod metrics;

pub use dispatcher::{DispatcherHandle, OutboxDispatcher, TickReport};
pub use metrics::{DispatcherMetrics, DispatcherStats};
