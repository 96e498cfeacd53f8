use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension, params};

use super::models::{QueueJob, QueueState};
use crate::errors::QueueError;
use crate::pipeline::PipelinePayload;

/// Async-safe handle to the queue database.
///
/// Wraps `QueueDb` behind `Arc<Mutex>` and runs every access on tokio's
/// blocking pool via `spawn_blocking`.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<QueueDb>>,
}

impl DbHandle {
    pub fn new(db: QueueDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R, QueueError>
    where
        F: FnOnce(&QueueDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db.lock().map_err(|_| QueueError::LockPoisoned)?;
            f(&guard).map_err(QueueError::Database)
        })
        .await
        .context("Queue DB task panicked")?
    }
}

pub struct QueueDb {
    conn: Connection,
}

impl QueueDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .busy_timeout(Duration::from_secs(5))
            .context("Failed to set busy timeout")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS queue_jobs (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    project_id TEXT NOT NULL,
                    prompt TEXT NOT NULL,
                    state TEXT NOT NULL DEFAULT 'waiting',
                    attempts INTEGER NOT NULL DEFAULT 0,
                    max_attempts INTEGER NOT NULL DEFAULT 1,
                    result TEXT,
                    error TEXT,
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE INDEX IF NOT EXISTS idx_queue_jobs_state ON queue_jobs(state, id);
                ",
            )
            .context("Failed to create queue tables")?;
        Ok(())
    }

    pub fn enqueue(&self, payload: &PipelinePayload, max_attempts: u32) -> Result<i64> {
        self.conn
            .execute(
                "INSERT INTO queue_jobs (project_id, prompt, max_attempts) VALUES (?1, ?2, ?3)",
                params![payload.project_id, payload.prompt, max_attempts.max(1)],
            )
            .context("Failed to insert queue job")?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn get(&self, id: i64) -> Result<Option<QueueJob>> {
        let row = self
            .conn
            .query_row(
                "SELECT id, project_id, prompt, state, attempts, max_attempts, result, error, created_at, updated_at
                 FROM queue_jobs WHERE id = ?1",
                params![id],
                |row| {
                    Ok(QueueJobRow {
                        id: row.get(0)?,
                        project_id: row.get(1)?,
                        prompt: row.get(2)?,
                        state: row.get(3)?,
                        attempts: row.get(4)?,
                        max_attempts: row.get(5)?,
                        result: row.get(6)?,
                        error: row.get(7)?,
                        created_at: row.get(8)?,
                        updated_at: row.get(9)?,
                    })
                },
            )
            .optional()
            .context("Failed to query queue job")?;
        row.map(QueueJobRow::into_queue_job).transpose()
    }

    /// Atomically move the oldest waiting job to `active` and return it.
    pub fn claim_next(&self) -> Result<Option<QueueJob>> {
        let id: Option<i64> = self
            .conn
            .query_row(
                "UPDATE queue_jobs
                 SET state = 'active', attempts = attempts + 1, updated_at = datetime('now')
                 WHERE id = (SELECT id FROM queue_jobs WHERE state = 'waiting' ORDER BY id LIMIT 1)
                 RETURNING id",
                [],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to claim queue job")?;
        match id {
            Some(id) => self.get(id),
            None => Ok(None),
        }
    }

    pub fn complete(&self, id: i64, result: &str) -> Result<()> {
        let changed = self
            .conn
            .execute(
                "UPDATE queue_jobs SET state = 'completed', result = ?1, error = NULL, updated_at = datetime('now')
                 WHERE id = ?2",
                params![result, id],
            )
            .context("Failed to complete queue job")?;
        anyhow::ensure!(changed == 1, "Queue job {} not found", id);
        Ok(())
    }

    /// Record a failed attempt. The job returns to `waiting` while attempts
    /// remain, otherwise it becomes `failed`.
    pub fn fail(&self, id: i64, error: &str) -> Result<QueueState> {
        let state: String = self
            .conn
            .query_row(
                "UPDATE queue_jobs
                 SET state = CASE WHEN attempts < max_attempts THEN 'waiting' ELSE 'failed' END,
                     error = ?1, updated_at = datetime('now')
                 WHERE id = ?2
                 RETURNING state",
                params![error, id],
                |row| row.get(0),
            )
            .context("Failed to record queue job failure")?;
        parse_state(&state)
    }

    /// Hand a claimed job back without consuming an attempt.
    pub fn release(&self, id: i64) -> Result<()> {
        self.conn
            .execute(
                "UPDATE queue_jobs
                 SET state = 'waiting', attempts = MAX(attempts - 1, 0), updated_at = datetime('now')
                 WHERE id = ?1 AND state = 'active'",
                params![id],
            )
            .context("Failed to release queue job")?;
        Ok(())
    }

    /// Move jobs left `active` by a crashed process back to `waiting`.
    pub fn requeue_active(&self) -> Result<usize> {
        self.conn
            .execute(
                "UPDATE queue_jobs SET state = 'waiting', updated_at = datetime('now') WHERE state = 'active'",
                [],
            )
            .context("Failed to requeue active jobs")
    }

    pub fn count_by_state(&self, state: QueueState) -> Result<i64> {
        self.conn
            .query_row(
                "SELECT COUNT(*) FROM queue_jobs WHERE state = ?1",
                params![state.as_str()],
                |row| row.get(0),
            )
            .context("Failed to count queue jobs")
    }
}

fn parse_state(s: &str) -> Result<QueueState> {
    QueueState::from_str(s)
        .map_err(|e| anyhow::anyhow!(e))
        .context("Failed to parse queue job state")
}

/// Intermediate row struct for queue_jobs.
struct QueueJobRow {
    id: i64,
    project_id: String,
    prompt: String,
    state: String,
    attempts: u32,
    max_attempts: u32,
    result: Option<String>,
    error: Option<String>,
    created_at: String,
    updated_at: String,
}

impl QueueJobRow {
    fn into_queue_job(self) -> Result<QueueJob> {
        let result = self
            .result
            .as_deref()
            .map(serde_json::from_str::<serde_json::Value>)
            .transpose()
            .context("Failed to parse stored job result")?;
        Ok(QueueJob {
            id: self.id,
            payload: PipelinePayload {
                project_id: self.project_id,
                prompt: self.prompt,
            },
            state: parse_state(&self.state)?,
            attempts: self.attempts,
            max_attempts: self.max_attempts,
            result,
            error: self.error,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}
