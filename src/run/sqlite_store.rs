//! SQLite implementation of RunStore.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use super::record::{ErrorInfo, Run, RunId, RunStatus};
use super::store::{RunStore, StoreError};
use crate::params::Params;

const COLUMNS: &str = "id, task_name, status, cursor, tick_count, tick_total, \
     error_class, error_message, backtrace, params, job_id, \
     created_at, started_at, ended_at, updated_at";

const ACTIVE: &str = "('enqueued','running','pausing','paused','interrupted','cancelling')";

type RunRow = (
    i64,
    String,
    String,
    Option<String>,
    i64,
    Option<i64>,
    Option<String>,
    Option<String>,
    Option<String>,
    String,
    Option<String>,
    String,
    Option<String>,
    Option<String>,
    String,
);

/// SQLite-backed run store.
pub struct SqliteRunStore {
    pool: SqlitePool,
}

impl SqliteRunStore {
    /// Create a new SqliteRunStore.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Run migrations to create the runs table.
    pub async fn run_migrations(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS upkeep_runs (
                id INTEGER PRIMARY KEY,
                task_name TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'enqueued',
                cursor TEXT,
                tick_count INTEGER NOT NULL DEFAULT 0,
                tick_total INTEGER,
                error_class TEXT,
                error_message TEXT,
                backtrace TEXT,
                params TEXT NOT NULL DEFAULT '{}',
                job_id TEXT,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                started_at TEXT,
                ended_at TEXT,
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Storage(e.to_string()))?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_upkeep_runs_status
            ON upkeep_runs(status, created_at)
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Storage(e.to_string()))?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_upkeep_runs_task
            ON upkeep_runs(task_name, status)
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Storage(e.to_string()))?;

        Ok(())
    }
}

fn parse_datetime(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&format!("{}Z", raw.replace(' ', "T")))
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

/// Cut `s` to at most `max` bytes without splitting a character.
fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

fn row_to_run(row: RunRow) -> Result<Run, StoreError> {
    let (
        id,
        task_name,
        status,
        cursor,
        tick_count,
        tick_total,
        error_class,
        error_message,
        backtrace,
        params,
        job_id,
        created_at,
        started_at,
        ended_at,
        updated_at,
    ) = row;

    let status = RunStatus::parse(&status)
        .ok_or_else(|| StoreError::Serialization(format!("unknown status '{status}'")))?;
    let params: Params = serde_json::from_str(&params)
        .map_err(|e| StoreError::Serialization(e.to_string()))?;

    Ok(Run {
        id: RunId(id),
        task_name,
        status,
        cursor,
        tick_count,
        tick_total,
        error_class,
        error_message,
        backtrace,
        params,
        job_id,
        created_at: parse_datetime(&created_at),
        started_at: started_at.as_deref().map(parse_datetime),
        ended_at: ended_at.as_deref().map(parse_datetime),
        updated_at: parse_datetime(&updated_at),
    })
}

#[async_trait]
impl RunStore for SqliteRunStore {
    async fn create(&self, task_name: &str, params: &Params) -> Result<Run, StoreError> {
        let params_str = serde_json::to_string(params)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        // The uniqueness check and the insert share one transaction so
        // two concurrent starts cannot both observe "no active run".
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::Storage(e.to_string()))?;

        let existing: Option<i64> = sqlx::query_scalar(&format!(
            "SELECT id FROM upkeep_runs WHERE task_name = ? AND status IN {ACTIVE} LIMIT 1"
        ))
        .bind(task_name)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| StoreError::Storage(e.to_string()))?;

        if existing.is_some() {
            tx.rollback()
                .await
                .map_err(|e| StoreError::Storage(e.to_string()))?;
            return Err(StoreError::AlreadyActive(task_name.to_string()));
        }

        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO upkeep_runs (task_name, params)
            VALUES (?, ?)
            RETURNING id
            "#,
        )
        .bind(task_name)
        .bind(params_str)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| StoreError::Storage(e.to_string()))?;

        let row: RunRow =
            sqlx::query_as(&format!("SELECT {COLUMNS} FROM upkeep_runs WHERE id = ?"))
                .bind(id)
                .fetch_one(&mut *tx)
                .await
                .map_err(|e| StoreError::Storage(e.to_string()))?;

        tx.commit()
            .await
            .map_err(|e| StoreError::Storage(e.to_string()))?;

        row_to_run(row)
    }

    async fn load(&self, id: RunId) -> Result<Run, StoreError> {
        let row: Option<RunRow> =
            sqlx::query_as(&format!("SELECT {COLUMNS} FROM upkeep_runs WHERE id = ?"))
                .bind(id.0)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| StoreError::Storage(e.to_string()))?;

        row.ok_or(StoreError::NotFound(id.0)).and_then(row_to_run)
    }

    async fn status(&self, id: RunId) -> Result<RunStatus, StoreError> {
        let raw: Option<String> =
            sqlx::query_scalar("SELECT status FROM upkeep_runs WHERE id = ?")
                .bind(id.0)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| StoreError::Storage(e.to_string()))?;

        let raw = raw.ok_or(StoreError::NotFound(id.0))?;
        RunStatus::parse(&raw)
            .ok_or_else(|| StoreError::Serialization(format!("unknown status '{raw}'")))
    }

    async fn transition(
        &self,
        id: RunId,
        from: RunStatus,
        to: RunStatus,
    ) -> Result<bool, StoreError> {
        let mut sets = String::from("status = ?, updated_at = datetime('now')");
        if to == RunStatus::Running {
            sets.push_str(", started_at = COALESCE(started_at, datetime('now'))");
        }
        if to.is_terminal() {
            sets.push_str(", ended_at = datetime('now')");
        }

        let result = sqlx::query(&format!(
            "UPDATE upkeep_runs SET {sets} WHERE id = ? AND status = ?"
        ))
        .bind(to.as_str())
        .bind(id.0)
        .bind(from.as_str())
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Storage(e.to_string()))?;

        Ok(result.rows_affected() == 1)
    }

    async fn save_progress(
        &self,
        id: RunId,
        cursor: Option<&str>,
        tick_count: i64,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(&format!(
            r#"
            UPDATE upkeep_runs
            SET cursor = ?, tick_count = ?, updated_at = datetime('now')
            WHERE id = ? AND status IN {ACTIVE}
            "#
        ))
        .bind(cursor)
        .bind(tick_count)
        .bind(id.0)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Storage(e.to_string()))?;

        Ok(result.rows_affected() == 1)
    }

    async fn set_total(&self, id: RunId, total: Option<i64>) -> Result<(), StoreError> {
        sqlx::query("UPDATE upkeep_runs SET tick_total = ?, updated_at = datetime('now') WHERE id = ?")
            .bind(total)
            .bind(id.0)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Storage(e.to_string()))?;

        Ok(())
    }

    async fn set_job_id(&self, id: RunId, job_id: &str) -> Result<(), StoreError> {
        sqlx::query("UPDATE upkeep_runs SET job_id = ?, updated_at = datetime('now') WHERE id = ?")
            .bind(job_id)
            .bind(id.0)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Storage(e.to_string()))?;

        Ok(())
    }

    async fn record_error(&self, id: RunId, info: &ErrorInfo) -> Result<(), StoreError> {
        let message = truncate(&info.message, 2000);
        let backtrace = info.backtrace.join("\n");

        sqlx::query(&format!(
            r#"
            UPDATE upkeep_runs
            SET status = 'errored', error_class = ?, error_message = ?, backtrace = ?,
                ended_at = datetime('now'), updated_at = datetime('now')
            WHERE id = ? AND status IN {ACTIVE}
            "#
        ))
        .bind(&info.class)
        .bind(message)
        .bind(backtrace)
        .bind(id.0)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Storage(e.to_string()))?;

        Ok(())
    }

    async fn active_run(&self, task_name: &str) -> Result<Option<Run>, StoreError> {
        let row: Option<RunRow> = sqlx::query_as(&format!(
            "SELECT {COLUMNS} FROM upkeep_runs WHERE task_name = ? AND status IN {ACTIVE} LIMIT 1"
        ))
        .bind(task_name)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::Storage(e.to_string()))?;

        row.map(row_to_run).transpose()
    }

    async fn list_enqueued(&self, limit: usize) -> Result<Vec<Run>, StoreError> {
        let rows: Vec<RunRow> = sqlx::query_as(&format!(
            r#"
            SELECT {COLUMNS} FROM upkeep_runs
            WHERE status = 'enqueued'
            ORDER BY created_at, id
            LIMIT ?
            "#
        ))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Storage(e.to_string()))?;

        rows.into_iter().map(row_to_run).collect()
    }

    async fn recover_interrupted(&self) -> Result<Vec<RunId>, StoreError> {
        let ids: Vec<i64> = sqlx::query_scalar(
            r#"
            UPDATE upkeep_runs
            SET status = 'enqueued', job_id = NULL, updated_at = datetime('now')
            WHERE status = 'interrupted'
            RETURNING id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Storage(e.to_string()))?;

        Ok(ids.into_iter().map(RunId).collect())
    }
}
