//! Worker that polls the store for enqueued runs and performs them.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tracing::{error, info};

use crate::run::RunStore;

use super::runner::Runner;

/// Polls for enqueued runs and performs them with bounded concurrency.
pub struct Worker<S: RunStore> {
    runner: Arc<Runner<S>>,
    poll_interval: Duration,
    max_concurrent: usize,
}

impl<S: RunStore + 'static> Worker<S> {
    /// Create a worker over the given runner.
    pub fn new(runner: Arc<Runner<S>>) -> Self {
        Self {
            runner,
            poll_interval: Duration::from_secs(1),
            max_concurrent: 1,
        }
    }

    /// Set the poll interval.
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the maximum concurrently performing runs.
    pub fn max_concurrent(mut self, n: usize) -> Self {
        self.max_concurrent = n;
        self
    }

    /// Run the poll loop until shutdown is requested, then drain
    /// in-flight runs (they reach `Interrupted` at their next batch
    /// boundary).
    pub async fn run(&self) {
        // Re-enqueue runs stranded by a previous shutdown or crash.
        match self.runner.store.recover_interrupted().await {
            Ok(ids) if !ids.is_empty() => {
                info!(count = ids.len(), "re-enqueued interrupted runs");
                for id in ids {
                    match self.runner.scheduler.enqueue(id).await {
                        Ok(job_id) => {
                            if let Err(e) = self.runner.store.set_job_id(id, &job_id.0).await {
                                error!(run_id = id.0, error = %e, "failed to record job id");
                            }
                        }
                        Err(e) => error!(run_id = id.0, error = %e, "failed to re-enqueue run"),
                    }
                }
            }
            Ok(_) => {}
            Err(e) => error!(error = %e, "interrupted-run recovery failed"),
        }

        let semaphore = Arc::new(Semaphore::new(self.max_concurrent));
        let mut shutdown = self.runner.shutdown_rx.clone();

        loop {
            if *shutdown.borrow() {
                break;
            }

            let available = semaphore.available_permits();
            if available > 0 {
                if let Ok(runs) = self.runner.store.list_enqueued(available).await {
                    for run in runs {
                        // Permits matched `available` when we listed, but
                        // a race just means the run waits for the next poll.
                        if let Ok(permit) = semaphore.clone().try_acquire_owned() {
                            let runner = self.runner.clone();

                            tokio::spawn(async move {
                                if let Err(e) = runner.perform(run.id).await {
                                    error!(run_id = run.id.0, error = %e, "run invocation failed");
                                }
                                drop(permit);
                            });
                        }
                    }
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                _ = shutdown.changed() => {}
            }
        }

        // Wait for every permit, i.e. for all in-flight runs to stop.
        let _ = semaphore.acquire_many(self.max_concurrent as u32).await;
        info!("worker drained");
    }
}
