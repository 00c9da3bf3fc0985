//! Task definitions and the name-keyed registry.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::collection::Collection;
use crate::params::{ParamSpec, Params};

/// A maintenance task: what collection to iterate and what to do per item.
///
/// Implementations are plugged in by registration, looked up by name at
/// run start and resume time. Items cross the boundary as JSON values so
/// the engine can drive any task without knowing its item type.
#[async_trait]
pub trait Task: Send + Sync {
    /// Unique registry name.
    fn name(&self) -> &'static str;

    /// Parameters this task accepts, with their validation rules.
    fn parameters(&self) -> Vec<ParamSpec> {
        Vec::new()
    }

    /// Produce the collection to iterate for this attempt.
    async fn collection(&self, params: &Params) -> Result<Collection, anyhow::Error>;

    /// Process one item. A failure here is fatal to the run: the failing
    /// item is not retried and no further items are processed.
    async fn process(&self, item: serde_json::Value, params: &Params) -> Result<(), anyhow::Error>;

    /// Estimated total item count, used for progress reporting. `None`
    /// means progress is reported as a bare item count.
    async fn count(&self, _params: &Params) -> Option<u64> {
        None
    }
}

/// Name-keyed registry of task definitions.
///
/// Lookups happen by string name on every start and resume; a name with
/// no registered definition is reported to the caller, never a panic, so
/// a run whose task code was removed surfaces as a deleted task.
#[derive(Default)]
pub struct TaskRegistry {
    tasks: HashMap<&'static str, Arc<dyn Task>>,
}

impl TaskRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a task definition under its own name, replacing any
    /// previous definition with that name.
    pub fn register(&mut self, task: impl Task + 'static) {
        self.tasks.insert(task.name(), Arc::new(task));
    }

    /// Look up a task definition by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Task>> {
        self.tasks.get(name).cloned()
    }

    /// Registered task names, sorted for stable listings.
    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.tasks.keys().copied().collect();
        names.sort_unstable();
        names
    }
}
