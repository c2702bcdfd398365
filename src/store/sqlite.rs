//! SQLite-based task store.

use super::{
    build_checkpoints, build_task, now_string, Checkpoint, CheckpointVerification, Job,
    JobStatus, NewTask, RedactionPolicy, RequiredProgress, Task, TaskStatus, TaskStore,
    VerificationEvent,
};
use super::EventKind;
use crate::checkpoints::CheckpointType;
use crate::ledger::LedgerReceipt;
use crate::monitor::InputMode;
use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

const SCHEMA: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS tasks (
    id TEXT PRIMARY KEY NOT NULL,
    agent_id TEXT NOT NULL,
    description TEXT NOT NULL,
    title TEXT,
    webhook_url TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    stream_url TEXT NOT NULL,
    human_id TEXT,
    max_duration_seconds INTEGER NOT NULL DEFAULT 3600,
    redaction_policy TEXT NOT NULL DEFAULT '{}',
    verification_hash TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    started_at TEXT,
    completed_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);
CREATE INDEX IF NOT EXISTS idx_tasks_updated_at ON tasks(updated_at DESC);

CREATE TABLE IF NOT EXISTS checkpoints (
    id TEXT PRIMARY KEY NOT NULL,
    task_id TEXT NOT NULL,
    type TEXT NOT NULL,
    target TEXT NOT NULL,
    description TEXT,
    confidence_threshold REAL NOT NULL DEFAULT 0.8,
    required INTEGER NOT NULL DEFAULT 1,
    ordering INTEGER NOT NULL DEFAULT 0,
    verified INTEGER NOT NULL DEFAULT 0,
    verified_at TEXT,
    confidence REAL,
    explanation TEXT,
    evidence_frame TEXT,
    FOREIGN KEY (task_id) REFERENCES tasks(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_checkpoints_task ON checkpoints(task_id, ordering);

CREATE TABLE IF NOT EXISTS jobs (
    job_id TEXT PRIMARY KEY NOT NULL,
    task_id TEXT NOT NULL,
    condition TEXT NOT NULL,
    interval_seconds INTEGER NOT NULL,
    input_mode TEXT NOT NULL,
    enable_prefilter INTEGER NOT NULL DEFAULT 1,
    status TEXT NOT NULL DEFAULT 'running',
    stop_reason TEXT,
    restart_count INTEGER NOT NULL DEFAULT 0,
    last_restart_at TEXT,
    last_restart_gap_ms INTEGER,
    started_at TEXT NOT NULL,
    stopped_at TEXT,
    FOREIGN KEY (task_id) REFERENCES tasks(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status);
CREATE INDEX IF NOT EXISTS idx_jobs_task ON jobs(task_id, status);

CREATE TABLE IF NOT EXISTS job_aliases (
    old_job_id TEXT PRIMARY KEY NOT NULL,
    new_job_id TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS verification_events (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    event_id TEXT NOT NULL UNIQUE,
    task_id TEXT NOT NULL,
    job_id TEXT,
    checkpoint_id TEXT,
    event_type TEXT NOT NULL,
    confidence REAL,
    explanation TEXT,
    metadata TEXT NOT NULL DEFAULT '{}',
    created_at TEXT NOT NULL,
    FOREIGN KEY (task_id) REFERENCES tasks(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_events_task ON verification_events(task_id, seq);
"#;

const TASK_COLUMNS: &str = "id, agent_id, description, title, webhook_url, status, stream_url,
    human_id, max_duration_seconds, redaction_policy, verification_hash, ledger_receipt,
    created_at, updated_at, started_at, completed_at";

const CHECKPOINT_COLUMNS: &str = "id, task_id, type, target, description, confidence_threshold,
    required, ordering, verified, verified_at, confidence, explanation, evidence_frame";

const JOB_COLUMNS: &str = "job_id, task_id, condition, interval_seconds, input_mode,
    enable_prefilter, status, stop_reason, restart_count, last_restart_at,
    last_restart_gap_ms, started_at, stopped_at";

/// Upper bound on alias hops when resolving a superseded job identifier.
const MAX_ALIAS_HOPS: usize = 1024;

pub struct SqliteTaskStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteTaskStore {
    pub async fn new(db_path: PathBuf) -> Result<Self, String> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| format!("Failed to create task store dir: {}", e))?;
            }
        }

        // Open database in blocking task
        let conn = tokio::task::spawn_blocking(move || {
            let conn = Connection::open(&db_path)
                .map_err(|e| format!("Failed to open SQLite database: {}", e))?;

            conn.execute_batch(SCHEMA)
                .map_err(|e| format!("Failed to run schema: {}", e))?;

            Self::run_migrations(&conn)?;

            Ok::<_, String>(conn)
        })
        .await
        .map_err(|e| format!("Task join error: {}", e))??;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run database migrations for existing databases.
    /// CREATE TABLE IF NOT EXISTS doesn't add columns to existing tables,
    /// so schema changes are applied here.
    fn run_migrations(conn: &Connection) -> Result<(), String> {
        let has_receipt_column: bool = conn
            .prepare("SELECT 1 FROM pragma_table_info('tasks') WHERE name = 'ledger_receipt'")
            .map_err(|e| format!("Failed to check for ledger_receipt column: {}", e))?
            .exists([])
            .map_err(|e| format!("Failed to query table info: {}", e))?;

        if !has_receipt_column {
            tracing::info!("Running migration: adding 'ledger_receipt' column to tasks table");
            conn.execute("ALTER TABLE tasks ADD COLUMN ledger_receipt TEXT", [])
                .map_err(|e| format!("Failed to add ledger_receipt column: {}", e))?;
        }

        Ok(())
    }

    /// Run `f` against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> Result<T, String>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, String> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            f(&conn)
        })
        .await
        .map_err(|e| e.to_string())?
    }
}

fn invalid_column(idx: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        rusqlite::types::Type::Text,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, message)),
    )
}

fn parse_uuid(row: &Row<'_>, idx: usize) -> rusqlite::Result<Uuid> {
    let raw: String = row.get(idx)?;
    Uuid::parse_str(&raw).map_err(|e| invalid_column(idx, e.to_string()))
}

fn task_from_row(row: &Row<'_>) -> rusqlite::Result<Task> {
    let status: String = row.get(5)?;
    let policy_json: String = row.get(9)?;
    let receipt_json: Option<String> = row.get(11)?;
    Ok(Task {
        id: parse_uuid(row, 0)?,
        agent_id: row.get(1)?,
        description: row.get(2)?,
        title: row.get(3)?,
        webhook_url: row.get(4)?,
        status: TaskStatus::parse(&status)
            .ok_or_else(|| invalid_column(5, format!("unknown task status {}", status)))?,
        stream_url: row.get(6)?,
        human_id: row.get(7)?,
        max_duration_seconds: row.get::<_, i64>(8)?.max(0) as u64,
        redaction_policy: serde_json::from_str::<RedactionPolicy>(&policy_json)
            .unwrap_or_default(),
        verification_hash: row.get(10)?,
        ledger_receipt: receipt_json.and_then(|s| serde_json::from_str(&s).ok()),
        created_at: row.get(12)?,
        updated_at: row.get(13)?,
        started_at: row.get(14)?,
        completed_at: row.get(15)?,
    })
}

fn checkpoint_from_row(row: &Row<'_>) -> rusqlite::Result<Checkpoint> {
    let kind: String = row.get(2)?;
    Ok(Checkpoint {
        id: parse_uuid(row, 0)?,
        task_id: parse_uuid(row, 1)?,
        kind: CheckpointType::parse(&kind)
            .ok_or_else(|| invalid_column(2, format!("unknown checkpoint type {}", kind)))?,
        target: row.get(3)?,
        description: row.get(4)?,
        confidence_threshold: row.get(5)?,
        required: row.get::<_, i64>(6)? != 0,
        ordering: row.get(7)?,
        verified: row.get::<_, i64>(8)? != 0,
        verified_at: row.get(9)?,
        confidence: row.get(10)?,
        explanation: row.get(11)?,
        evidence_frame: row.get(12)?,
    })
}

fn job_from_row(row: &Row<'_>) -> rusqlite::Result<Job> {
    let mode: String = row.get(4)?;
    let status: String = row.get(6)?;
    Ok(Job {
        job_id: row.get(0)?,
        task_id: parse_uuid(row, 1)?,
        condition: row.get(2)?,
        interval_seconds: row.get::<_, i64>(3)?.max(0) as u32,
        input_mode: InputMode::parse(&mode)
            .ok_or_else(|| invalid_column(4, format!("unknown input mode {}", mode)))?,
        enable_prefilter: row.get::<_, i64>(5)? != 0,
        status: JobStatus::parse(&status)
            .ok_or_else(|| invalid_column(6, format!("unknown job status {}", status)))?,
        stop_reason: row.get(7)?,
        restart_count: row.get::<_, i64>(8)?.max(0) as u32,
        last_restart_at: row.get(9)?,
        last_restart_gap_ms: row.get::<_, Option<i64>>(10)?.map(|v| v.max(0) as u64),
        started_at: row.get(11)?,
        stopped_at: row.get(12)?,
    })
}

fn event_from_row(row: &Row<'_>) -> rusqlite::Result<VerificationEvent> {
    let checkpoint_id: Option<String> = row.get(3)?;
    let kind: String = row.get(4)?;
    let metadata: String = row.get(7)?;
    Ok(VerificationEvent {
        event_id: parse_uuid(row, 0)?,
        task_id: parse_uuid(row, 1)?,
        job_id: row.get(2)?,
        checkpoint_id: checkpoint_id.and_then(|s| Uuid::parse_str(&s).ok()),
        event_type: EventKind::parse(&kind)
            .ok_or_else(|| invalid_column(4, format!("unknown event type {}", kind)))?,
        confidence: row.get(5)?,
        explanation: row.get(6)?,
        metadata: serde_json::from_str(&metadata).unwrap_or_else(|_| serde_json::json!({})),
        created_at: row.get(8)?,
    })
}

fn query_job(conn: &Connection, job_id: &str) -> Result<Option<Job>, String> {
    conn.query_row(
        &format!("SELECT {} FROM jobs WHERE job_id = ?1", JOB_COLUMNS),
        params![job_id],
        job_from_row,
    )
    .optional()
    .map_err(|e| e.to_string())
}

fn query_jobs(conn: &Connection, sql: &str, task_id: Option<String>) -> Result<Vec<Job>, String> {
    let mut stmt = conn.prepare(sql).map_err(|e| e.to_string())?;
    let rows = match task_id {
        Some(id) => stmt.query_map(params![id], job_from_row),
        None => stmt.query_map([], job_from_row),
    }
    .map_err(|e| e.to_string())?;
    rows.collect::<Result<Vec<_>, _>>().map_err(|e| e.to_string())
}

fn update_task(conn: &Connection, sql: &str, id: Uuid, value: Option<String>) -> Result<(), String> {
    let now = now_string();
    let changed = match value {
        Some(v) => conn.execute(sql, params![id.to_string(), now, v]),
        None => conn.execute(sql, params![id.to_string(), now]),
    }
    .map_err(|e| e.to_string())?;
    if changed == 0 {
        return Err(format!("Task {} not found", id));
    }
    Ok(())
}

#[async_trait]
impl TaskStore for SqliteTaskStore {
    fn is_persistent(&self) -> bool {
        true
    }

    async fn create_task(&self, new_task: NewTask) -> Result<Task, String> {
        let task = build_task(&new_task);
        let checkpoints = build_checkpoints(task.id, &new_task.checkpoints);
        let policy = serde_json::to_string(&task.redaction_policy).map_err(|e| e.to_string())?;
        let row = task.clone();

        self.with_conn(move |conn| {
            let tx = conn.unchecked_transaction().map_err(|e| e.to_string())?;
            tx.execute(
                "INSERT INTO tasks (id, agent_id, description, title, webhook_url, status,
                    stream_url, max_duration_seconds, redaction_policy, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    row.id.to_string(),
                    row.agent_id,
                    row.description,
                    row.title,
                    row.webhook_url,
                    row.status.as_str(),
                    row.stream_url,
                    row.max_duration_seconds as i64,
                    policy,
                    row.created_at,
                    row.updated_at,
                ],
            )
            .map_err(|e| e.to_string())?;

            for cp in &checkpoints {
                tx.execute(
                    "INSERT INTO checkpoints (id, task_id, type, target, description,
                        confidence_threshold, required, ordering)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    params![
                        cp.id.to_string(),
                        cp.task_id.to_string(),
                        cp.kind.as_str(),
                        cp.target,
                        cp.description,
                        cp.confidence_threshold,
                        cp.required as i64,
                        cp.ordering,
                    ],
                )
                .map_err(|e| e.to_string())?;
            }
            tx.commit().map_err(|e| e.to_string())
        })
        .await?;

        Ok(task)
    }

    async fn get_task(&self, id: Uuid) -> Result<Option<Task>, String> {
        self.with_conn(move |conn| {
            conn.query_row(
                &format!("SELECT {} FROM tasks WHERE id = ?1", TASK_COLUMNS),
                params![id.to_string()],
                task_from_row,
            )
            .optional()
            .map_err(|e| e.to_string())
        })
        .await
    }

    async fn list_tasks(&self, limit: usize, offset: usize) -> Result<Vec<Task>, String> {
        self.with_conn(move |conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {} FROM tasks ORDER BY updated_at DESC LIMIT ?1 OFFSET ?2",
                    TASK_COLUMNS
                ))
                .map_err(|e| e.to_string())?;
            let tasks = stmt
                .query_map(params![limit as i64, offset as i64], task_from_row)
                .map_err(|e| e.to_string())?
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| e.to_string())?;
            Ok(tasks)
        })
        .await
    }

    async fn tasks_with_status(&self, statuses: &[TaskStatus]) -> Result<Vec<Task>, String> {
        let wanted: Vec<&'static str> = statuses.iter().map(|s| s.as_str()).collect();
        self.with_conn(move |conn| {
            let mut stmt = conn
                .prepare(&format!("SELECT {} FROM tasks WHERE status = ?1", TASK_COLUMNS))
                .map_err(|e| e.to_string())?;
            let mut tasks = Vec::new();
            for status in wanted {
                let rows = stmt
                    .query_map(params![status], task_from_row)
                    .map_err(|e| e.to_string())?;
                for row in rows {
                    tasks.push(row.map_err(|e| e.to_string())?);
                }
            }
            Ok(tasks)
        })
        .await
    }

    async fn update_task_status(&self, id: Uuid, status: TaskStatus) -> Result<(), String> {
        self.with_conn(move |conn| {
            update_task(
                conn,
                "UPDATE tasks SET updated_at = ?2, status = ?3 WHERE id = ?1",
                id,
                Some(status.as_str().to_string()),
            )
        })
        .await
    }

    async fn mark_task_claimed(&self, id: Uuid, human_id: &str) -> Result<(), String> {
        let human_id = human_id.to_string();
        self.with_conn(move |conn| {
            update_task(
                conn,
                "UPDATE tasks SET updated_at = ?2, human_id = ?3, status = 'awaiting_stream'
                 WHERE id = ?1",
                id,
                Some(human_id),
            )
        })
        .await
    }

    async fn mark_task_streaming(&self, id: Uuid) -> Result<(), String> {
        self.with_conn(move |conn| {
            update_task(
                conn,
                "UPDATE tasks SET updated_at = ?2, started_at = ?2, status = 'streaming'
                 WHERE id = ?1",
                id,
                None,
            )
        })
        .await
    }

    async fn mark_task_completed(
        &self,
        id: Uuid,
        verification_hash: &str,
    ) -> Result<bool, String> {
        let hash = verification_hash.to_string();
        self.with_conn(move |conn| {
            let now = now_string();
            let changed = conn
                .execute(
                    "UPDATE tasks
                     SET status = 'completed', verification_hash = ?2, completed_at = ?3,
                         updated_at = ?3
                     WHERE id = ?1 AND verification_hash IS NULL",
                    params![id.to_string(), hash, now],
                )
                .map_err(|e| e.to_string())?;
            Ok(changed > 0)
        })
        .await
    }

    async fn set_ledger_receipt(&self, id: Uuid, receipt: &LedgerReceipt) -> Result<(), String> {
        let json = serde_json::to_string(receipt).map_err(|e| e.to_string())?;
        self.with_conn(move |conn| {
            update_task(
                conn,
                "UPDATE tasks SET updated_at = ?2, ledger_receipt = ?3 WHERE id = ?1",
                id,
                Some(json),
            )
        })
        .await
    }

    async fn get_checkpoints(&self, task_id: Uuid) -> Result<Vec<Checkpoint>, String> {
        self.with_conn(move |conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {} FROM checkpoints WHERE task_id = ?1 ORDER BY ordering, id",
                    CHECKPOINT_COLUMNS
                ))
                .map_err(|e| e.to_string())?;
            let rows = stmt
                .query_map(params![task_id.to_string()], checkpoint_from_row)
                .map_err(|e| e.to_string())?
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| e.to_string())?;
            Ok(rows)
        })
        .await
    }

    async fn get_unverified_checkpoints(&self, task_id: Uuid) -> Result<Vec<Checkpoint>, String> {
        self.with_conn(move |conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {} FROM checkpoints WHERE task_id = ?1 AND verified = 0
                     ORDER BY ordering, id",
                    CHECKPOINT_COLUMNS
                ))
                .map_err(|e| e.to_string())?;
            let rows = stmt
                .query_map(params![task_id.to_string()], checkpoint_from_row)
                .map_err(|e| e.to_string())?
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| e.to_string())?;
            Ok(rows)
        })
        .await
    }

    async fn mark_checkpoint_verified(
        &self,
        checkpoint_id: Uuid,
        verification: &CheckpointVerification,
    ) -> Result<bool, String> {
        let v = verification.clone();
        self.with_conn(move |conn| {
            let id = checkpoint_id.to_string();
            let changed = conn
                .execute(
                    "UPDATE checkpoints
                     SET verified = 1, verified_at = ?2, confidence = ?3, explanation = ?4,
                         evidence_frame = ?5
                     WHERE id = ?1 AND verified = 0",
                    params![id, v.verified_at, v.confidence, v.explanation, v.evidence_frame],
                )
                .map_err(|e| e.to_string())?;
            if changed > 0 {
                return Ok(true);
            }
            let exists = conn
                .prepare("SELECT 1 FROM checkpoints WHERE id = ?1")
                .map_err(|e| e.to_string())?
                .exists(params![id])
                .map_err(|e| e.to_string())?;
            if exists {
                Ok(false)
            } else {
                Err(format!("Checkpoint {} not found", checkpoint_id))
            }
        })
        .await
    }

    async fn required_progress(&self, task_id: Uuid) -> Result<RequiredProgress, String> {
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT COUNT(*), COALESCE(SUM(CASE WHEN verified = 1 THEN 1 ELSE 0 END), 0)
                 FROM checkpoints WHERE task_id = ?1 AND required = 1",
                params![task_id.to_string()],
                |row| {
                    Ok(RequiredProgress {
                        total: row.get::<_, i64>(0)?.max(0) as usize,
                        verified: row.get::<_, i64>(1)?.max(0) as usize,
                    })
                },
            )
            .map_err(|e| e.to_string())
        })
        .await
    }

    async fn clear_evidence_before(&self, cutoff: &str) -> Result<usize, String> {
        let cutoff = cutoff.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE checkpoints SET evidence_frame = NULL
                 WHERE evidence_frame IS NOT NULL AND verified_at < ?1",
                params![cutoff],
            )
            .map_err(|e| e.to_string())
        })
        .await
    }

    async fn insert_job(&self, job: &Job) -> Result<(), String> {
        let job = job.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO jobs (job_id, task_id, condition, interval_seconds, input_mode,
                    enable_prefilter, status, stop_reason, restart_count, started_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    job.job_id,
                    job.task_id.to_string(),
                    job.condition,
                    job.interval_seconds as i64,
                    job.input_mode.as_str(),
                    job.enable_prefilter as i64,
                    job.status.as_str(),
                    job.stop_reason,
                    job.restart_count as i64,
                    job.started_at,
                ],
            )
            .map_err(|e| e.to_string())?;
            Ok(())
        })
        .await
    }

    async fn get_job(&self, job_id: &str) -> Result<Option<Job>, String> {
        let job_id = job_id.to_string();
        self.with_conn(move |conn| query_job(conn, &job_id)).await
    }

    async fn resolve_job_id(&self, job_id: &str) -> Result<Option<String>, String> {
        let start = job_id.to_string();
        self.with_conn(move |conn| {
            let mut current = start.clone();
            for _ in 0..MAX_ALIAS_HOPS {
                let exists = conn
                    .prepare_cached("SELECT 1 FROM jobs WHERE job_id = ?1")
                    .map_err(|e| e.to_string())?
                    .exists(params![current])
                    .map_err(|e| e.to_string())?;
                if exists {
                    return Ok(Some(current));
                }
                let next: Option<String> = conn
                    .query_row(
                        "SELECT new_job_id FROM job_aliases WHERE old_job_id = ?1",
                        params![current],
                        |row| row.get(0),
                    )
                    .optional()
                    .map_err(|e| e.to_string())?;
                match next {
                    Some(next) => current = next,
                    None => return Ok(None),
                }
            }
            Err(format!("Job alias chain too long from {}", start))
        })
        .await
    }

    async fn update_job_status(
        &self,
        job_id: &str,
        status: JobStatus,
        stop_reason: Option<&str>,
    ) -> Result<(), String> {
        let job_id = job_id.to_string();
        let stop_reason = stop_reason.map(|s| s.to_string());
        self.with_conn(move |conn| {
            let changed = conn
                .execute(
                    "UPDATE jobs SET status = ?2, stop_reason = ?3, stopped_at = ?4
                     WHERE job_id = ?1",
                    params![job_id, status.as_str(), stop_reason, now_string()],
                )
                .map_err(|e| e.to_string())?;
            if changed == 0 {
                return Err(format!("Job {} not found", job_id));
            }
            Ok(())
        })
        .await
    }

    async fn record_job_restart(
        &self,
        old_job_id: &str,
        new_job_id: &str,
        gap_ms: u64,
    ) -> Result<Job, String> {
        let old_id = old_job_id.to_string();
        let new_id = new_job_id.to_string();
        self.with_conn(move |conn| {
            let now = now_string();
            let tx = conn.unchecked_transaction().map_err(|e| e.to_string())?;
            let changed = tx
                .execute(
                    "UPDATE jobs
                     SET job_id = ?2, status = 'running', stop_reason = NULL, stopped_at = NULL,
                         restart_count = restart_count + 1, last_restart_at = ?3,
                         last_restart_gap_ms = ?4
                     WHERE job_id = ?1",
                    params![old_id, new_id, now, gap_ms as i64],
                )
                .map_err(|e| e.to_string())?;
            if changed == 0 {
                return Err(format!("Job {} not found", old_id));
            }
            tx.execute(
                "INSERT OR REPLACE INTO job_aliases (old_job_id, new_job_id, created_at)
                 VALUES (?1, ?2, ?3)",
                params![old_id, new_id, now],
            )
            .map_err(|e| e.to_string())?;
            let job = query_job(&tx, &new_id)?
                .ok_or_else(|| format!("Job {} vanished during restart", new_id))?;
            tx.commit().map_err(|e| e.to_string())?;
            Ok(job)
        })
        .await
    }

    async fn running_jobs_for_task(&self, task_id: Uuid) -> Result<Vec<Job>, String> {
        self.with_conn(move |conn| {
            query_jobs(
                conn,
                &format!(
                    "SELECT {} FROM jobs WHERE task_id = ?1 AND status = 'running'",
                    JOB_COLUMNS
                ),
                Some(task_id.to_string()),
            )
        })
        .await
    }

    async fn all_running_jobs(&self) -> Result<Vec<Job>, String> {
        self.with_conn(move |conn| {
            query_jobs(
                conn,
                &format!("SELECT {} FROM jobs WHERE status = 'running'", JOB_COLUMNS),
                None,
            )
        })
        .await
    }

    async fn count_running_jobs(&self) -> Result<usize, String> {
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM jobs WHERE status = 'running'",
                [],
                |row| row.get::<_, i64>(0),
            )
            .map(|n| n.max(0) as usize)
            .map_err(|e| e.to_string())
        })
        .await
    }

    async fn insert_event(&self, event: &VerificationEvent) -> Result<(), String> {
        let event = event.clone();
        let metadata = serde_json::to_string(&event.metadata).map_err(|e| e.to_string())?;
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO verification_events (event_id, task_id, job_id, checkpoint_id,
                    event_type, confidence, explanation, metadata, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    event.event_id.to_string(),
                    event.task_id.to_string(),
                    event.job_id,
                    event.checkpoint_id.map(|id| id.to_string()),
                    event.event_type.as_str(),
                    event.confidence,
                    event.explanation,
                    metadata,
                    event.created_at,
                ],
            )
            .map_err(|e| e.to_string())?;
            Ok(())
        })
        .await
    }

    async fn get_events(
        &self,
        task_id: Uuid,
        limit: usize,
    ) -> Result<Vec<VerificationEvent>, String> {
        self.with_conn(move |conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT event_id, task_id, job_id, checkpoint_id, event_type, confidence,
                            explanation, metadata, created_at
                     FROM verification_events
                     WHERE task_id = ?1
                     ORDER BY seq DESC
                     LIMIT ?2",
                )
                .map_err(|e| e.to_string())?;
            let events = stmt
                .query_map(params![task_id.to_string(), limit as i64], event_from_row)
                .map_err(|e| e.to_string())?
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| e.to_string())?;
            Ok(events)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::tests::{exercise_store, sample_new_task};

    #[tokio::test]
    async fn sqlite_store_behaviour() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = SqliteTaskStore::new(temp.path().join("tasks.db"))
            .await
            .expect("open store");
        exercise_store(&store).await;
    }

    #[tokio::test]
    async fn sqlite_store_survives_reopen() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("nested").join("tasks.db");

        let task_id = {
            let store = SqliteTaskStore::new(path.clone()).await.expect("open store");
            let task = store.create_task(sample_new_task(1)).await.expect("create");
            store
                .mark_task_claimed(task.id, "human-7")
                .await
                .expect("claim");
            task.id
        };

        let store = SqliteTaskStore::new(path).await.expect("reopen store");
        let task = store.get_task(task_id).await.unwrap().expect("task persisted");
        assert_eq!(task.status, TaskStatus::AwaitingStream);
        assert_eq!(task.human_id.as_deref(), Some("human-7"));
        assert_eq!(store.get_checkpoints(task_id).await.unwrap().len(), 1);

        let receipt = LedgerReceipt {
            reference: "tx-1".to_string(),
            sequence: 42,
            lookup_url: "local://receipts/42".to_string(),
        };
        store.set_ledger_receipt(task_id, &receipt).await.unwrap();
        let task = store.get_task(task_id).await.unwrap().unwrap();
        assert_eq!(task.ledger_receipt, Some(receipt));
    }
}
