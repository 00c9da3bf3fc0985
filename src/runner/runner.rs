//! Runner facade: starting runs and operator lifecycle requests.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tokio::sync::watch;
use tracing::info;

use crate::cursor::CursorError;
use crate::params::{self, Params, ValidationError};
use crate::run::{Run, RunId, RunStatus, RunStore, StoreError};
use crate::scheduler::{PollingScheduler, Scheduler, SchedulerError};
use crate::task::{Task, TaskRegistry};

/// Error type for runner operations.
#[derive(Error, Debug)]
pub enum RunnerError {
    #[error("no task registered under '{0}'")]
    TaskNotFound(String),

    #[error("task '{0}' already has an active run")]
    AlreadyActive(String),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("run {0} not found")]
    RunNotFound(i64),

    #[error("run {id} is {status}; {action} is not allowed")]
    InvalidTransition {
        id: i64,
        status: &'static str,
        action: &'static str,
    },

    #[error(transparent)]
    Cursor(#[from] CursorError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
}

/// Tuning knobs for run execution. Passed explicitly to the builder;
/// there is no global configuration.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Items fetched and processed between control-signal checks.
    pub batch_size: u64,
    /// Minimum interval between progress writes.
    pub tick_interval: Duration,
    /// Wall-clock budget for one invocation; exceeding it re-enqueues a
    /// continuation instead of holding the worker.
    pub invocation_budget: Option<Duration>,
    /// Item budget for one invocation, checked at batch boundaries.
    pub max_items_per_invocation: Option<u64>,
    /// How long a cancelling run may go untouched before a second cancel
    /// call force-cancels it.
    pub stuck_grace: Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            tick_interval: Duration::from_secs(1),
            invocation_budget: Some(Duration::from_secs(300)),
            max_items_per_invocation: None,
            stuck_grace: Duration::from_secs(300),
        }
    }
}

/// Drives task runs: creates them, performs them in budgeted
/// invocations, and applies operator pause/cancel/resume requests.
pub struct Runner<S: RunStore> {
    pub(crate) store: Arc<S>,
    pub(crate) registry: Arc<TaskRegistry>,
    pub(crate) scheduler: Arc<dyn Scheduler>,
    pub(crate) config: RunnerConfig,
    pub(crate) shutdown_rx: watch::Receiver<bool>,
    shutdown_tx: watch::Sender<bool>,
}

impl<S: RunStore + 'static> Runner<S> {
    /// The underlying store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Signal a graceful shutdown: in-flight runs move to `Interrupted`
    /// at their next batch boundary and workers stop polling.
    pub fn request_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Validate parameters, create a run in `Enqueued`, and hand it to
    /// the scheduler bridge.
    pub async fn start(&self, task_name: &str, params: Params) -> Result<Run, RunnerError> {
        let task = self
            .registry
            .get(task_name)
            .ok_or_else(|| RunnerError::TaskNotFound(task_name.to_string()))?;

        let effective = params::validate(&task.parameters(), &params)?;

        let run = self
            .store
            .create(task_name, &effective)
            .await
            .map_err(|e| match e {
                StoreError::AlreadyActive(name) => RunnerError::AlreadyActive(name),
                other => RunnerError::Store(other),
            })?;

        let job_id = self.scheduler.enqueue(run.id).await?;
        self.store.set_job_id(run.id, &job_id.0).await?;

        info!(run_id = run.id.0, task = task_name, "run enqueued");
        Ok(run)
    }

    /// Request a pause. An enqueued run pauses immediately; a running run
    /// moves to `Pausing` and stops at its next batch boundary.
    pub async fn pause(&self, id: RunId) -> Result<(), RunnerError> {
        let run = self.load(id).await?;
        match run.status {
            RunStatus::Enqueued => {
                self.apply(id, RunStatus::Enqueued, RunStatus::Paused, "pause").await
            }
            RunStatus::Running => {
                self.apply(id, RunStatus::Running, RunStatus::Pausing, "pause").await
            }
            status => Err(RunnerError::InvalidTransition {
                id: id.0,
                status: status.as_str(),
                action: "pause",
            }),
        }
    }

    /// Request a cancel. Idle runs cancel immediately; a running run
    /// moves to `Cancelling` and stops at its next batch boundary. A
    /// cancelling run whose worker died is force-cancelled once the
    /// stuck grace period has passed.
    pub async fn cancel(&self, id: RunId) -> Result<(), RunnerError> {
        let run = self.load(id).await?;
        match run.status {
            RunStatus::Enqueued | RunStatus::Paused | RunStatus::Interrupted => {
                self.apply(id, run.status, RunStatus::Cancelled, "cancel").await
            }
            RunStatus::Running | RunStatus::Pausing => {
                self.apply(id, run.status, RunStatus::Cancelling, "cancel").await
            }
            RunStatus::Cancelling if run.is_stuck(Utc::now(), self.stuck_grace()) => {
                info!(run_id = id.0, "force-cancelling stuck run");
                self.apply(id, RunStatus::Cancelling, RunStatus::Cancelled, "cancel").await
            }
            status => Err(RunnerError::InvalidTransition {
                id: id.0,
                status: status.as_str(),
                action: "cancel",
            }),
        }
    }

    /// Resume a paused run from its saved cursor.
    pub async fn resume(&self, id: RunId) -> Result<(), RunnerError> {
        let run = self.load(id).await?;
        match run.status {
            RunStatus::Paused => {
                self.apply(id, RunStatus::Paused, RunStatus::Enqueued, "resume").await?;
                let job_id = self.scheduler.enqueue(id).await?;
                self.store.set_job_id(id, &job_id.0).await?;
                info!(run_id = id.0, task = %run.task_name, "run resumed");
                Ok(())
            }
            status => Err(RunnerError::InvalidTransition {
                id: id.0,
                status: status.as_str(),
                action: "resume",
            }),
        }
    }

    /// Perform one budgeted invocation of the run. This is the unit of
    /// work the scheduler bridge delivers; it is idempotent against
    /// duplicate delivery.
    pub async fn perform(&self, id: RunId) -> Result<(), RunnerError> {
        super::executor::perform(self, id).await
    }

    pub(crate) async fn load(&self, id: RunId) -> Result<Run, RunnerError> {
        match self.store.load(id).await {
            Ok(run) => Ok(run),
            Err(StoreError::NotFound(id)) => Err(RunnerError::RunNotFound(id)),
            Err(e) => Err(e.into()),
        }
    }

    fn stuck_grace(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.config.stuck_grace.as_secs() as i64)
    }

    async fn apply(
        &self,
        id: RunId,
        from: RunStatus,
        to: RunStatus,
        action: &'static str,
    ) -> Result<(), RunnerError> {
        if self.store.transition(id, from, to).await? {
            info!(run_id = id.0, from = from.as_str(), to = to.as_str(), "run transition");
            Ok(())
        } else {
            // Another actor moved the run between our read and write.
            Err(RunnerError::InvalidTransition {
                id: id.0,
                status: from.as_str(),
                action,
            })
        }
    }
}

/// Builder for constructing a Runner.
pub struct RunnerBuilder<S: RunStore> {
    store: S,
    registry: TaskRegistry,
    scheduler: Arc<dyn Scheduler>,
    config: RunnerConfig,
}

impl<S: RunStore + 'static> RunnerBuilder<S> {
    /// Create a new builder with the given store.
    pub fn new(store: S) -> Self {
        Self {
            store,
            registry: TaskRegistry::new(),
            scheduler: Arc::new(PollingScheduler::new()),
            config: RunnerConfig::default(),
        }
    }

    /// Register a task definition.
    pub fn task(mut self, task: impl Task + 'static) -> Self {
        self.registry.register(task);
        self
    }

    /// Use a custom scheduler bridge.
    pub fn scheduler(mut self, scheduler: impl Scheduler + 'static) -> Self {
        self.scheduler = Arc::new(scheduler);
        self
    }

    /// Set the batch size.
    pub fn batch_size(mut self, n: u64) -> Self {
        self.config.batch_size = n;
        self
    }

    /// Set the minimum interval between progress writes.
    pub fn tick_interval(mut self, interval: Duration) -> Self {
        self.config.tick_interval = interval;
        self
    }

    /// Set or disable the wall-clock budget per invocation.
    pub fn invocation_budget(mut self, budget: Option<Duration>) -> Self {
        self.config.invocation_budget = budget;
        self
    }

    /// Set or disable the item budget per invocation.
    pub fn max_items_per_invocation(mut self, max: Option<u64>) -> Self {
        self.config.max_items_per_invocation = max;
        self
    }

    /// Replace the whole configuration.
    pub fn config(mut self, config: RunnerConfig) -> Self {
        self.config = config;
        self
    }

    /// Build the runner.
    pub fn build(self) -> Runner<S> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Runner {
            store: Arc::new(self.store),
            registry: Arc::new(self.registry),
            scheduler: self.scheduler,
            config: self.config,
            shutdown_rx,
            shutdown_tx,
        }
    }
}
