//! The perform loop: one budgeted invocation of a run.

use std::time::Instant;

use tracing::{debug, error, info, warn};

use crate::collection::BatchEnumerator;
use crate::cursor::Position;
use crate::run::{ErrorInfo, RunId, RunStatus, RunStore};
use crate::ticker::Ticker;

use super::runner::{Runner, RunnerError};

/// Drive one invocation of `run_id`.
///
/// Loads the run, claims it via compare-and-set, and processes batches
/// until the collection is exhausted, an item fails, an operator request
/// or shutdown is observed at a batch boundary, or an invocation budget
/// is exceeded (in which case a continuation is re-enqueued).
///
/// All state crossing invocations lives in the run row; a lost
/// compare-and-set anywhere means another actor owns the run and this
/// invocation exits silently.
pub(crate) async fn perform<S: RunStore + 'static>(
    r: &Runner<S>,
    id: RunId,
) -> Result<(), RunnerError> {
    let run = r.load(id).await?;

    match run.status {
        RunStatus::Enqueued | RunStatus::Running => {}
        // An operator request that landed before this job did: honor it.
        RunStatus::Pausing => {
            r.store.transition(id, RunStatus::Pausing, RunStatus::Paused).await?;
            return Ok(());
        }
        RunStatus::Cancelling => {
            r.store.transition(id, RunStatus::Cancelling, RunStatus::Cancelled).await?;
            return Ok(());
        }
        // Duplicate or stale delivery: no-op.
        status => {
            debug!(run_id = id.0, status = status.as_str(), "run not resumable; skipping");
            return Ok(());
        }
    }

    if !r.store.transition(id, run.status, RunStatus::Running).await? {
        debug!(run_id = id.0, "lost claim to another worker; exiting");
        return Ok(());
    }

    let Some(task) = r.registry.get(&run.task_name) else {
        warn!(run_id = id.0, task = %run.task_name, "task definition deleted");
        let info = ErrorInfo {
            class: "TaskNotFound".to_string(),
            message: format!("no task registered under '{}'", run.task_name),
            backtrace: Vec::new(),
        };
        r.store.record_error(id, &info).await?;
        return Ok(());
    };

    let position = match run.cursor.as_deref().map(Position::decode).transpose() {
        Ok(position) => position,
        Err(e) => {
            error!(run_id = id.0, error = %e, "cursor unreadable");
            r.store.record_error(id, &ErrorInfo::capture(&e.into())).await?;
            return Ok(());
        }
    };

    let collection = match task.collection(&run.params).await {
        Ok(collection) => collection,
        Err(e) => {
            error!(run_id = id.0, error = %e, "collection construction failed");
            r.store.record_error(id, &ErrorInfo::capture(&e)).await?;
            return Ok(());
        }
    };

    let mut batches = match BatchEnumerator::new(collection, r.config.batch_size, position) {
        Ok(batches) => batches,
        Err(e) => {
            error!(run_id = id.0, error = %e, "cursor does not match collection");
            r.store.record_error(id, &ErrorInfo::capture(&e.into())).await?;
            return Ok(());
        }
    };

    if run.tick_total.is_none() {
        if let Some(total) = task.count(&run.params).await {
            r.store.set_total(id, Some(total as i64)).await?;
        }
    }

    let started = Instant::now();
    let mut ticker = Ticker::new(r.config.tick_interval);
    let mut tick_count = run.tick_count;
    let mut cursor = run.cursor.clone();
    let mut items_this_invocation: u64 = 0;

    loop {
        let batch = match batches.next_batch().await {
            Ok(batch) => batch,
            Err(e) => {
                error!(run_id = id.0, error = %e, "collection fetch failed");
                let _ = r.store.save_progress(id, cursor.as_deref(), tick_count).await?;
                r.store.record_error(id, &ErrorInfo::capture(&e)).await?;
                return Ok(());
            }
        };

        let Some(batch) = batch else {
            // Exhausted.
            if !r.store.save_progress(id, cursor.as_deref(), tick_count).await? {
                return Ok(());
            }
            if r.store.transition(id, RunStatus::Running, RunStatus::Succeeded).await? {
                info!(run_id = id.0, task = %run.task_name, ticks = tick_count, "run succeeded");
            } else {
                finish_with_requested_status(r, id, tick_count).await?;
            }
            return Ok(());
        };

        for (item, position) in batch {
            if let Err(e) = task.process(item, &run.params).await {
                // Fail fast: the failing item is not counted, items after
                // it are never processed, and progress up to it persists.
                error!(run_id = id.0, task = %run.task_name, error = %e, "item processing failed");
                let _ = r.store.save_progress(id, cursor.as_deref(), tick_count).await?;
                r.store.record_error(id, &ErrorInfo::capture(&e)).await?;
                return Ok(());
            }

            tick_count += 1;
            items_this_invocation += 1;
            cursor = Some(position.encode());

            if ticker.tick() {
                if !r.store.save_progress(id, cursor.as_deref(), tick_count).await? {
                    debug!(run_id = id.0, "progress write rejected; exiting");
                    return Ok(());
                }
                ticker.mark_persisted();
            }
        }

        // Batch boundary: operator requests and shutdown first, budgets
        // second. This is the only place signals are observed, so their
        // latency is bounded by one batch.
        match r.store.status(id).await? {
            RunStatus::Running => {}
            RunStatus::Pausing => {
                if r.store.save_progress(id, cursor.as_deref(), tick_count).await? {
                    r.store.transition(id, RunStatus::Pausing, RunStatus::Paused).await?;
                    info!(run_id = id.0, ticks = tick_count, "run paused");
                }
                return Ok(());
            }
            RunStatus::Cancelling => {
                if r.store.save_progress(id, cursor.as_deref(), tick_count).await? {
                    r.store.transition(id, RunStatus::Cancelling, RunStatus::Cancelled).await?;
                    info!(run_id = id.0, ticks = tick_count, "run cancelled");
                }
                return Ok(());
            }
            status => {
                debug!(run_id = id.0, status = status.as_str(), "run moved externally; exiting");
                return Ok(());
            }
        }

        if *r.shutdown_rx.borrow() {
            if r.store.save_progress(id, cursor.as_deref(), tick_count).await? {
                r.store.transition(id, RunStatus::Running, RunStatus::Interrupted).await?;
                info!(run_id = id.0, ticks = tick_count, "run interrupted for shutdown");
            }
            return Ok(());
        }

        let over_time = r
            .config
            .invocation_budget
            .is_some_and(|budget| started.elapsed() >= budget);
        let over_items = r
            .config
            .max_items_per_invocation
            .is_some_and(|max| items_this_invocation >= max);

        if over_time || over_items {
            if !r.store.save_progress(id, cursor.as_deref(), tick_count).await? {
                return Ok(());
            }
            // Hand the run back to the queue: the Enqueued row is the
            // queue entry a polling worker picks up, so the continuation
            // survives even when the scheduler bridge is a no-op.
            if !r.store.transition(id, RunStatus::Running, RunStatus::Enqueued).await? {
                yield_to_pending_request(r, id, tick_count).await?;
                return Ok(());
            }
            let job_id = r.scheduler.enqueue(id).await?;
            r.store.set_job_id(id, &job_id.0).await?;
            debug!(
                run_id = id.0,
                ticks = tick_count,
                job_id = %job_id.0,
                "invocation budget exceeded; continuation enqueued"
            );
            return Ok(());
        }
    }
}

/// An operator request slipped in between the boundary status check and
/// the budget hand-back: honor it instead of re-enqueueing.
async fn yield_to_pending_request<S: RunStore>(
    r: &Runner<S>,
    id: RunId,
    tick_count: i64,
) -> Result<(), RunnerError> {
    match r.store.status(id).await? {
        RunStatus::Pausing => {
            if r.store.transition(id, RunStatus::Pausing, RunStatus::Paused).await? {
                info!(run_id = id.0, ticks = tick_count, "run paused");
            }
        }
        RunStatus::Cancelling => {
            if r.store.transition(id, RunStatus::Cancelling, RunStatus::Cancelled).await? {
                info!(run_id = id.0, ticks = tick_count, "run cancelled");
            }
        }
        status => {
            debug!(run_id = id.0, status = status.as_str(), "run moved externally; exiting");
        }
    }
    Ok(())
}

/// The collection ran out while an operator request was pending: honor
/// the request, but a pause of a finished collection is a success.
async fn finish_with_requested_status<S: RunStore>(
    r: &Runner<S>,
    id: RunId,
    tick_count: i64,
) -> Result<(), RunnerError> {
    match r.store.status(id).await? {
        RunStatus::Pausing => {
            if r.store.transition(id, RunStatus::Pausing, RunStatus::Succeeded).await? {
                info!(run_id = id.0, ticks = tick_count, "run succeeded");
            }
        }
        RunStatus::Cancelling => {
            if r.store.transition(id, RunStatus::Cancelling, RunStatus::Cancelled).await? {
                info!(run_id = id.0, ticks = tick_count, "run cancelled");
            }
        }
        status => {
            debug!(run_id = id.0, status = status.as_str(), "run moved externally; exiting");
        }
    }
    Ok(())
}
