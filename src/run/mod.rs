//! Durable run records and their storage.

pub mod record;
pub mod store;

#[cfg(feature = "sqlite")]
pub mod sqlite_store;

pub use record::{ErrorInfo, Run, RunId, RunStatus};
pub use store::{RunStore, StoreError};

#[cfg(feature = "sqlite")]
pub use sqlite_store::SqliteRunStore;
