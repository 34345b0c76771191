//! Thin adapter over the SQLite-backed task queue.
//!
//! The orchestration core only relies on enqueue / revoke-by-id / is-revoked
//! plus the worker-side claim; scheduling policy beyond FIFO lives outside
//! this crate. Connections are opened per call so the API process and the
//! worker process can share one WAL database file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::algorithms::{AlgorithmId, AlgorithmParams};

const DEFAULT_QUEUE_NAME: &str = "mrserve";

const STATE_QUEUED: &str = "queued";
const STATE_CLAIMED: &str = "claimed";
const STATE_DONE: &str = "done";
const STATE_FAILED: &str = "failed";

/// Payload enqueued per reconstruction job and handed to the worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskMessage {
    pub job_id: String,
    pub algorithm: AlgorithmId,
    pub input_path: PathBuf,
    pub output_path: PathBuf,
    pub params: AlgorithmParams,
}

#[derive(Debug, Clone)]
pub struct ClaimedTask {
    pub task_id: String,
    pub message: TaskMessage,
}

#[derive(Debug, Clone)]
pub struct TaskQueue {
    name: String,
    db_path: PathBuf,
}

impl TaskQueue {
    pub fn new(db_path: impl Into<PathBuf>) -> Result<Self> {
        Self::with_name(DEFAULT_QUEUE_NAME, db_path)
    }

    pub fn with_name(name: &str, db_path: impl Into<PathBuf>) -> Result<Self> {
        let db_path = db_path.into();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!(
                    "failed to create queue database directory: {}",
                    parent.display()
                )
            })?;
        }

        let queue = Self {
            name: name.to_string(),
            db_path,
        };
        queue.initialize_schema()?;
        Ok(queue)
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub fn enqueue(&self, message: &TaskMessage) -> Result<String> {
        let task_id = Uuid::new_v4().to_string();
        let payload = serde_json::to_string(message)
            .with_context(|| format!("failed to serialize task payload for job {}", message.job_id))?;
        let now = Utc::now().to_rfc3339();

        self.with_connection(|conn| {
            conn.execute(
                "INSERT INTO tasks (id, queue, job_id, payload_json, state, revoked, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6, ?6)",
                params![task_id, self.name, message.job_id, payload, STATE_QUEUED, now],
            )
            .context("failed to enqueue task")?;
            Ok(())
        })?;
        Ok(task_id)
    }

    /// Mark a task revoked so it is never handed to a worker. Revoking an
    /// unknown or already-running task is a no-op.
    pub fn revoke_by_id(&self, task_id: &str) -> Result<()> {
        self.with_connection(|conn| {
            conn.execute(
                "UPDATE tasks SET revoked = 1, updated_at = ?2 WHERE id = ?1",
                params![task_id, Utc::now().to_rfc3339()],
            )
            .with_context(|| format!("failed to revoke task {task_id}"))?;
            Ok(())
        })
    }

    pub fn is_revoked(&self, task_id: &str) -> Result<bool> {
        self.with_connection(|conn| {
            let revoked: Option<i64> = conn
                .query_row(
                    "SELECT revoked FROM tasks WHERE id = ?1",
                    params![task_id],
                    |row| row.get(0),
                )
                .optional()
                .with_context(|| format!("failed to query revocation of task {task_id}"))?;
            Ok(revoked == Some(1))
        })
    }

    /// Atomically claim the oldest queued, unrevoked task of this queue.
    pub fn claim_next(&self) -> Result<Option<ClaimedTask>> {
        self.with_connection(|conn| {
            let tx = conn
                .unchecked_transaction()
                .context("failed to open claim transaction")?;

            let row: Option<(String, String)> = tx
                .query_row(
                    "SELECT id, payload_json FROM tasks
                     WHERE queue = ?1 AND state = ?2 AND revoked = 0
                     ORDER BY created_at ASC, id ASC LIMIT 1",
                    params![self.name, STATE_QUEUED],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()
                .context("failed to query next task")?;

            let Some((task_id, payload)) = row else {
                return Ok(None);
            };

            tx.execute(
                "UPDATE tasks SET state = ?2, updated_at = ?3 WHERE id = ?1",
                params![task_id, STATE_CLAIMED, Utc::now().to_rfc3339()],
            )
            .with_context(|| format!("failed to claim task {task_id}"))?;
            tx.commit().context("failed to commit claim")?;

            let message: TaskMessage = serde_json::from_str(&payload)
                .with_context(|| format!("failed to parse payload of task {task_id}"))?;
            Ok(Some(ClaimedTask { task_id, message }))
        })
    }

    pub fn mark_done(&self, task_id: &str) -> Result<()> {
        self.set_state(task_id, STATE_DONE, None)
    }

    /// Queue-side failure bookkeeping, fed by the runner's re-signaled error.
    pub fn mark_failed(&self, task_id: &str, error: &str) -> Result<()> {
        self.set_state(task_id, STATE_FAILED, Some(error))
    }

    fn set_state(&self, task_id: &str, state: &str, error: Option<&str>) -> Result<()> {
        self.with_connection(|conn| {
            conn.execute(
                "UPDATE tasks SET state = ?2, error = ?3, updated_at = ?4 WHERE id = ?1",
                params![task_id, state, error, Utc::now().to_rfc3339()],
            )
            .with_context(|| format!("failed to set task {task_id} state to {state}"))?;
            Ok(())
        })
    }

    fn initialize_schema(&self) -> Result<()> {
        self.with_connection(|conn| {
            conn.execute_batch(
                "PRAGMA journal_mode = WAL;
                 CREATE TABLE IF NOT EXISTS tasks (
                    id TEXT PRIMARY KEY,
                    queue TEXT NOT NULL,
                    job_id TEXT NOT NULL,
                    payload_json TEXT NOT NULL,
                    state TEXT NOT NULL,
                    revoked INTEGER NOT NULL DEFAULT 0,
                    error TEXT,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                 );
                 CREATE INDEX IF NOT EXISTS idx_tasks_claim
                    ON tasks(queue, state, revoked, created_at);",
            )
            .with_context(|| {
                format!(
                    "failed to initialize queue schema: {}",
                    self.db_path.display()
                )
            })
        })
    }

    fn with_connection<T>(&self, operation: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = Connection::open(&self.db_path).with_context(|| {
            format!("failed to open queue database: {}", self.db_path.display())
        })?;
        conn.busy_timeout(Duration::from_secs(5))
            .context("failed to set queue busy timeout")?;
        operation(&conn)
    }
}
