//! # Upkeep
//!
//! The embeddable maintenance-task engine.
//!
//! Define long-running, pausable, resumable batch operations over huge
//! collections. A library, not a service: runs in your process, persists
//! its state in your database.
//!
//! ## Why Upkeep?
//!
//! - **Resumable by construction** - Every item advances a durable cursor;
//!   a crash costs at most one persistence interval of re-processing
//! - **Budgeted invocations** - A run yields its worker after a time or
//!   item budget and continues in a later invocation, so one task never
//!   monopolizes a worker
//! - **Operator control** - Pause, resume, and cancel are observed at
//!   batch boundaries, with compare-and-set guards against racing workers
//! - **Embeddable** - Bring your own job system via the `Scheduler` trait,
//!   or let a `Worker` poll the store
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use upkeep::{RunnerBuilder, SqliteRunStore, Worker};
//!
//! let store = SqliteRunStore::new(pool);
//! store.run_migrations().await?;
//!
//! let runner = Arc::new(
//!     RunnerBuilder::new(store)
//!         .task(BackfillAccounts)
//!         .batch_size(100)
//!         .build(),
//! );
//!
//! let run = runner.start("backfill_accounts", Params::new()).await?;
//! Worker::new(runner).max_concurrent(4).run().await;
//! ```
//!
//! ## Defining a task
//!
//! ```rust,ignore
//! #[async_trait]
//! impl Task for BackfillAccounts {
//!     fn name(&self) -> &'static str { "backfill_accounts" }
//!
//!     async fn collection(&self, _params: &Params) -> Result<Collection, anyhow::Error> {
//!         Ok(Collection::Keyed(Box::new(AccountsByIdQuery)))
//!     }
//!
//!     async fn process(&self, item: serde_json::Value, _params: &Params) -> Result<(), anyhow::Error> {
//!         backfill(item).await
//!     }
//! }
//! ```
//!
//! ## Feature Flags
//!
//! - `sqlite` (default) - Enable the SQLite-backed run store

pub mod collection;
pub mod cursor;
pub mod params;
pub mod run;
pub mod runner;
pub mod scheduler;
pub mod task;
pub mod ticker;

pub use collection::{Batch, BatchEnumerator, Collection, Keyed, Sliceable, VecCollection};
pub use cursor::{CursorError, Position};
pub use params::{
    FieldError, Inclusion, ParamKind, ParamSpec, ParamValue, Params, Rule, ValidationError,
};
pub use run::{ErrorInfo, Run, RunId, RunStatus, RunStore, StoreError};
pub use runner::{Runner, RunnerBuilder, RunnerConfig, RunnerError, Worker};
pub use scheduler::{JobId, PollingScheduler, Scheduler, SchedulerError};
pub use task::{Task, TaskRegistry};
pub use ticker::Ticker;

#[cfg(feature = "sqlite")]
pub use run::SqliteRunStore;
