//! Run execution: the perform loop, the runner facade, and the worker.

mod executor;
mod runner;
mod worker;

pub use runner::{Runner, RunnerBuilder, RunnerConfig, RunnerError};
pub use worker::Worker;
