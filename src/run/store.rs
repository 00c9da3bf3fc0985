//! Run storage trait and error type.

use async_trait::async_trait;
use thiserror::Error;

use super::record::{ErrorInfo, Run, RunId, RunStatus};
use crate::params::Params;

/// Error type for run storage operations.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("storage error: {0}")]
    Storage(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("run {0} not found")]
    NotFound(i64),

    /// An active run already exists for the task. Raised by `create`,
    /// inside the same transaction as the insert it refused.
    #[error("task '{0}' already has an active run")]
    AlreadyActive(String),
}

/// Trait for run storage backends.
///
/// The run row is the only state shared between invocations; every
/// status-changing write is a compare-and-set so that of two concurrent
/// writers, exactly one takes effect and the other can detect the loss.
#[async_trait]
pub trait RunStore: Send + Sync {
    /// Create a run in `Enqueued` for `task_name`, refusing atomically if
    /// the task already has a run in an active status.
    async fn create(&self, task_name: &str, params: &Params) -> Result<Run, StoreError>;

    /// Load a run by id.
    async fn load(&self, id: RunId) -> Result<Run, StoreError>;

    /// Current status only; cheaper than `load` for boundary re-checks.
    async fn status(&self, id: RunId) -> Result<RunStatus, StoreError>;

    /// Compare-and-set the status from `from` to `to`. Returns false when
    /// the run was no longer in `from`, meaning another actor won; the
    /// caller stops without persisting anything further. Transitions into
    /// a terminal status also set `ended_at`; transitions into `Running`
    /// set `started_at` if unset.
    async fn transition(&self, id: RunId, from: RunStatus, to: RunStatus)
        -> Result<bool, StoreError>;

    /// Persist cursor and counter progress, guarded on the run still
    /// being in an active status. Returns false when the guard failed.
    async fn save_progress(
        &self,
        id: RunId,
        cursor: Option<&str>,
        tick_count: i64,
    ) -> Result<bool, StoreError>;

    /// Record the total estimate for progress reporting.
    async fn set_total(&self, id: RunId, total: Option<i64>) -> Result<(), StoreError>;

    /// Record the job id of the most recently scheduled unit of work.
    async fn set_job_id(&self, id: RunId, job_id: &str) -> Result<(), StoreError>;

    /// Move the run to `Errored` with diagnostic detail, from whatever
    /// active status it is in.
    async fn record_error(&self, id: RunId, info: &ErrorInfo) -> Result<(), StoreError>;

    /// The active run for a task, if any.
    async fn active_run(&self, task_name: &str) -> Result<Option<Run>, StoreError>;

    /// Runs currently in `Enqueued`, oldest first, for worker polling.
    async fn list_enqueued(&self, limit: usize) -> Result<Vec<Run>, StoreError>;

    /// Move `Interrupted` runs back to `Enqueued` and return their ids.
    /// Called at worker startup to recover from crashes and shutdowns.
    async fn recover_interrupted(&self) -> Result<Vec<RunId>, StoreError>;
}
