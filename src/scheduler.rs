//! Bridge to the hosting application's job system.

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use crate::run::RunId;

/// Identifier of a scheduled unit of work, recorded on the run so stuck
/// runs can be reconciled against the job system.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct JobId(pub String);

/// Error type for scheduling operations.
#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("enqueue failed: {0}")]
    Enqueue(String),
}

/// Schedules a run continuation to be performed later, possibly on
/// another process.
///
/// Delivery is at-least-once; `Runner::perform` is idempotent against
/// duplicate delivery, so bridges need not deduplicate.
#[async_trait]
pub trait Scheduler: Send + Sync {
    /// Enqueue one unit of work that will call `Runner::perform(run_id)`.
    async fn enqueue(&self, run_id: RunId) -> Result<JobId, SchedulerError>;
}

/// Bridge for deployments where workers poll the store directly: the run
/// row in `Enqueued` status is itself the queue entry, so enqueueing only
/// mints a job id.
#[derive(Debug, Clone, Default)]
pub struct PollingScheduler;

impl PollingScheduler {
    /// Create a new polling scheduler.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Scheduler for PollingScheduler {
    async fn enqueue(&self, _run_id: RunId) -> Result<JobId, SchedulerError> {
        Ok(JobId(Uuid::new_v4().to_string()))
    }
}
