//! Worker poll-loop, graceful shutdown, and crash recovery tests.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use upkeep::{
    Collection, Params, Runner, RunnerBuilder, RunStatus, RunStore, SqliteRunStore, Task,
    VecCollection, Worker,
};

async fn pool() -> SqlitePool {
    SqlitePoolOptions::new()
        .max_connections(1)
        .connect(":memory:")
        .await
        .unwrap()
}

#[derive(Clone)]
struct LoggingTask {
    total: u64,
    processed: Arc<Mutex<Vec<u64>>>,
}

#[async_trait]
impl Task for LoggingTask {
    fn name(&self) -> &'static str {
        "logging"
    }

    async fn collection(&self, _params: &Params) -> Result<Collection, anyhow::Error> {
        let items = (0..self.total).map(|n| serde_json::json!(n)).collect();
        Ok(Collection::Sliced(Box::new(VecCollection::new(items))))
    }

    async fn process(&self, item: serde_json::Value, _params: &Params) -> Result<(), anyhow::Error> {
        self.processed.lock().unwrap().push(item.as_u64().unwrap());
        Ok(())
    }
}

fn build_runner(store: SqliteRunStore, task: LoggingTask) -> Arc<Runner<SqliteRunStore>> {
    Arc::new(
        RunnerBuilder::new(store)
            .task(task)
            .tick_interval(Duration::ZERO)
            .batch_size(2)
            .build(),
    )
}

async fn wait_for_status(
    store: &SqliteRunStore,
    id: upkeep::RunId,
    expected: RunStatus,
) {
    for _ in 0..200 {
        if store.status(id).await.unwrap() == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("run {} never reached {expected:?}", id.0);
}

#[tokio::test]
async fn test_worker_performs_enqueued_runs() {
    let pool = pool().await;
    let store = SqliteRunStore::new(pool.clone());
    store.run_migrations().await.unwrap();

    let task = LoggingTask {
        total: 5,
        processed: Arc::new(Mutex::new(Vec::new())),
    };
    let runner = build_runner(store, task.clone());

    let worker_runner = runner.clone();
    let handle = tokio::spawn(async move {
        Worker::new(worker_runner)
            .poll_interval(Duration::from_millis(10))
            .run()
            .await;
    });

    let run = runner.start("logging", Params::new()).await.unwrap();
    wait_for_status(runner.store(), run.id, RunStatus::Succeeded).await;

    assert_eq!(*task.processed.lock().unwrap(), (0..5).collect::<Vec<_>>());

    runner.request_shutdown();
    tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .expect("worker did not drain after shutdown")
        .unwrap();
}

#[tokio::test]
async fn test_budget_exceeded_run_completes_under_the_polling_worker() {
    let pool = pool().await;
    let store = SqliteRunStore::new(pool.clone());
    store.run_migrations().await.unwrap();

    let task = LoggingTask {
        total: 6,
        processed: Arc::new(Mutex::new(Vec::new())),
    };
    // Each invocation yields after two items; the run must come back as
    // an enqueued row the poll loop picks up again.
    let runner = Arc::new(
        RunnerBuilder::new(store)
            .task(task.clone())
            .tick_interval(Duration::ZERO)
            .batch_size(2)
            .max_items_per_invocation(Some(2))
            .build(),
    );

    let worker_runner = runner.clone();
    let handle = tokio::spawn(async move {
        Worker::new(worker_runner)
            .poll_interval(Duration::from_millis(10))
            .run()
            .await;
    });

    let run = runner.start("logging", Params::new()).await.unwrap();
    wait_for_status(runner.store(), run.id, RunStatus::Succeeded).await;

    let done = runner.store().load(run.id).await.unwrap();
    assert_eq!(done.tick_count, 6);
    assert_eq!(*task.processed.lock().unwrap(), (0..6).collect::<Vec<_>>());

    runner.request_shutdown();
    tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .expect("worker did not drain after shutdown")
        .unwrap();
}

#[tokio::test]
async fn test_shutdown_interrupts_then_recovery_finishes_the_run() {
    let pool = pool().await;
    let processed = Arc::new(Mutex::new(Vec::new()));

    // First "process": shuts down mid-run.
    let store = SqliteRunStore::new(pool.clone());
    store.run_migrations().await.unwrap();
    let task = LoggingTask {
        total: 6,
        processed: processed.clone(),
    };
    let first = build_runner(store, task.clone());

    let run = first.start("logging", Params::new()).await.unwrap();
    first.request_shutdown();
    first.perform(run.id).await.unwrap();

    let interrupted = first.store().load(run.id).await.unwrap();
    assert_eq!(interrupted.status, RunStatus::Interrupted);
    // One batch made it through before the boundary check.
    assert_eq!(interrupted.tick_count, 2);

    // Second "process": a fresh worker recovers and finishes.
    let second = build_runner(SqliteRunStore::new(pool.clone()), task);
    let worker_runner = second.clone();
    let handle = tokio::spawn(async move {
        Worker::new(worker_runner)
            .poll_interval(Duration::from_millis(10))
            .run()
            .await;
    });

    wait_for_status(second.store(), run.id, RunStatus::Succeeded).await;

    let done = second.store().load(run.id).await.unwrap();
    assert_eq!(done.tick_count, 6);
    // The cursor carried across processes: no item repeated, none skipped.
    assert_eq!(*processed.lock().unwrap(), (0..6).collect::<Vec<_>>());

    second.request_shutdown();
    tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .expect("worker did not drain after shutdown")
        .unwrap();
}
