//! Durable job state.
//!
//! [`JobStore`] is the interface the engine writes through; phases that run
//! concurrently never talk to each other except via this store. The SQLite
//! implementation keeps one connection behind a mutex and runs every query
//! on tokio's blocking pool.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};

use super::models::*;
use crate::completion::CallResult;
use crate::dag::state::PhaseOutcome;

/// Persistence interface for jobs, checkpoints, phase results and documents.
///
/// Checkpoint and phase-result writes are upserts keyed by coordinate, so
/// replaying a write is an overwrite, never a duplicate.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn create_job(&self, job: &JobRecord) -> Result<()>;
    /// The job record with its checkpoints and phase results.
    async fn load_job(&self, job_id: &str) -> Result<Option<JobSnapshot>>;
    async fn get_job(&self, job_id: &str) -> Result<Option<JobRecord>>;
    async fn list_jobs(&self) -> Result<Vec<JobRecord>>;
    async fn jobs_with_status(&self, status: JobStatus) -> Result<Vec<JobRecord>>;
    /// Returns false if the job does not exist.
    async fn update_job_status(&self, job_id: &str, status: JobStatus, error: Option<String>) -> Result<bool>;
    async fn request_cancel(&self, job_id: &str) -> Result<bool>;
    /// Stamp the job as owned by a live worker. Returns false if the job
    /// does not exist or is already terminal.
    async fn touch_heartbeat(&self, job_id: &str) -> Result<bool>;

    async fn upsert_checkpoint(
        &self,
        job_id: &str,
        coordinate: &Coordinate,
        result: &CallResult,
        input_hash: &str,
    ) -> Result<()>;
    async fn get_checkpoint(&self, job_id: &str, coordinate: &Coordinate) -> Result<Option<Checkpoint>>;

    async fn upsert_phase_result(&self, job_id: &str, outcome: &PhaseOutcome) -> Result<()>;
    async fn phase_results(&self, job_id: &str) -> Result<Vec<PhaseOutcome>>;

    async fn insert_document(&self, document: &Document) -> Result<()>;
    async fn get_document(&self, id: &str) -> Result<Option<Document>>;
    async fn list_documents(&self) -> Result<Vec<DocumentSummary>>;
    async fn delete_document(&self, id: &str) -> Result<bool>;
}

/// Async-safe handle to the SQLite job database.
#[derive(Clone)]
pub struct SqliteJobStore {
    inner: Arc<std::sync::Mutex<JobDb>>,
}

impl SqliteJobStore {
    /// Open (or create) the database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        Ok(Self::from_db(JobDb::new(path)?))
    }

    pub fn open_in_memory() -> Result<Self> {
        Ok(Self::from_db(JobDb::new_in_memory()?))
    }

    fn from_db(db: JobDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&JobDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db.lock().map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }
}

#[async_trait]
impl JobStore for SqliteJobStore {
    async fn create_job(&self, job: &JobRecord) -> Result<()> {
        let job = job.clone();
        self.call(move |db| db.insert_job(&job)).await
    }

    async fn load_job(&self, job_id: &str) -> Result<Option<JobSnapshot>> {
        let job_id = job_id.to_string();
        self.call(move |db| {
            let Some(job) = db.get_job(&job_id)? else {
                return Ok(None);
            };
            Ok(Some(JobSnapshot {
                checkpoints: db.list_checkpoints(&job_id)?,
                phase_results: db.list_phase_results(&job_id)?,
                job,
            }))
        })
        .await
    }

    async fn get_job(&self, job_id: &str) -> Result<Option<JobRecord>> {
        let job_id = job_id.to_string();
        self.call(move |db| db.get_job(&job_id)).await
    }

    async fn list_jobs(&self) -> Result<Vec<JobRecord>> {
        self.call(|db| db.list_jobs(None)).await
    }

    async fn jobs_with_status(&self, status: JobStatus) -> Result<Vec<JobRecord>> {
        self.call(move |db| db.list_jobs(Some(status))).await
    }

    async fn update_job_status(&self, job_id: &str, status: JobStatus, error: Option<String>) -> Result<bool> {
        let job_id = job_id.to_string();
        self.call(move |db| db.update_job_status(&job_id, status, error.as_deref()))
            .await
    }

    async fn request_cancel(&self, job_id: &str) -> Result<bool> {
        let job_id = job_id.to_string();
        self.call(move |db| db.set_cancel_requested(&job_id)).await
    }

    async fn touch_heartbeat(&self, job_id: &str) -> Result<bool> {
        let job_id = job_id.to_string();
        self.call(move |db| db.touch_heartbeat(&job_id)).await
    }

    async fn upsert_checkpoint(
        &self,
        job_id: &str,
        coordinate: &Coordinate,
        result: &CallResult,
        input_hash: &str,
    ) -> Result<()> {
        let job_id = job_id.to_string();
        let coordinate = coordinate.clone();
        let result = result.clone();
        let input_hash = input_hash.to_string();
        self.call(move |db| db.upsert_checkpoint(&job_id, &coordinate, &result, &input_hash))
            .await
    }

    async fn get_checkpoint(&self, job_id: &str, coordinate: &Coordinate) -> Result<Option<Checkpoint>> {
        let job_id = job_id.to_string();
        let coordinate = coordinate.clone();
        self.call(move |db| db.get_checkpoint(&job_id, &coordinate)).await
    }

    async fn upsert_phase_result(&self, job_id: &str, outcome: &PhaseOutcome) -> Result<()> {
        let job_id = job_id.to_string();
        let outcome = outcome.clone();
        self.call(move |db| db.upsert_phase_result(&job_id, &outcome)).await
    }

    async fn phase_results(&self, job_id: &str) -> Result<Vec<PhaseOutcome>> {
        let job_id = job_id.to_string();
        self.call(move |db| db.list_phase_results(&job_id)).await
    }

    async fn insert_document(&self, document: &Document) -> Result<()> {
        let document = document.clone();
        self.call(move |db| db.insert_document(&document)).await
    }

    async fn get_document(&self, id: &str) -> Result<Option<Document>> {
        let id = id.to_string();
        self.call(move |db| db.get_document(&id)).await
    }

    async fn list_documents(&self) -> Result<Vec<DocumentSummary>> {
        self.call(|db| db.list_documents()).await
    }

    async fn delete_document(&self, id: &str) -> Result<bool> {
        let id = id.to_string();
        self.call(move |db| db.delete_document(&id)).await
    }
}

fn to_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339()
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(raw)
        .with_context(|| format!("Invalid timestamp in database: {}", raw))?
        .with_timezone(&Utc))
}

struct JobRow {
    id: String,
    plan: String,
    document_ids: String,
    status: String,
    fail_fast: bool,
    cancel_requested: bool,
    error: Option<String>,
    created_at: String,
    updated_at: String,
    last_progress_at: String,
    heartbeat_at: Option<String>,
}

impl JobRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            plan: row.get(1)?,
            document_ids: row.get(2)?,
            status: row.get(3)?,
            fail_fast: row.get(4)?,
            cancel_requested: row.get(5)?,
            error: row.get(6)?,
            created_at: row.get(7)?,
            updated_at: row.get(8)?,
            last_progress_at: row.get(9)?,
            heartbeat_at: row.get(10)?,
        })
    }

    fn into_job(self) -> Result<JobRecord> {
        Ok(JobRecord {
            plan: serde_json::from_str(&self.plan)
                .with_context(|| format!("Corrupt plan snapshot for job {}", self.id))?,
            document_ids: serde_json::from_str(&self.document_ids)
                .context("Corrupt document id list")?,
            status: self.status.parse().map_err(anyhow::Error::msg)?,
            fail_fast: self.fail_fast,
            cancel_requested: self.cancel_requested,
            error: self.error,
            created_at: parse_ts(&self.created_at)?,
            updated_at: parse_ts(&self.updated_at)?,
            last_progress_at: parse_ts(&self.last_progress_at)?,
            heartbeat_at: self.heartbeat_at.as_deref().map(parse_ts).transpose()?,
            id: self.id,
        })
    }
}

const JOB_COLUMNS: &str = "id, plan, document_ids, status, fail_fast, cancel_requested, error, \
                           created_at, updated_at, last_progress_at, heartbeat_at";

pub struct JobDb {
    conn: Connection,
}

impl JobDb {
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS jobs (
                    id TEXT PRIMARY KEY,
                    plan TEXT NOT NULL,
                    document_ids TEXT NOT NULL DEFAULT '[]',
                    status TEXT NOT NULL DEFAULT 'pending',
                    fail_fast INTEGER NOT NULL DEFAULT 0,
                    cancel_requested INTEGER NOT NULL DEFAULT 0,
                    error TEXT,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL,
                    last_progress_at TEXT NOT NULL,
                    heartbeat_at TEXT
                );

                CREATE TABLE IF NOT EXISTS checkpoints (
                    job_id TEXT NOT NULL REFERENCES jobs(id) ON DELETE CASCADE,
                    phase_id TEXT NOT NULL,
                    operation TEXT NOT NULL,
                    pass INTEGER NOT NULL,
                    item TEXT NOT NULL DEFAULT '',
                    text TEXT NOT NULL,
                    model TEXT NOT NULL,
                    prompt_tokens INTEGER NOT NULL DEFAULT 0,
                    completion_tokens INTEGER NOT NULL DEFAULT 0,
                    elapsed_ms INTEGER NOT NULL DEFAULT 0,
                    chunked INTEGER NOT NULL DEFAULT 0,
                    chunk_count INTEGER NOT NULL DEFAULT 0,
                    partial INTEGER NOT NULL DEFAULT 0,
                    attempts INTEGER NOT NULL DEFAULT 1,
                    input_hash TEXT NOT NULL,
                    recorded_at TEXT NOT NULL,
                    PRIMARY KEY (job_id, phase_id, operation, pass, item)
                );

                CREATE TABLE IF NOT EXISTS phase_results (
                    job_id TEXT NOT NULL REFERENCES jobs(id) ON DELETE CASCADE,
                    phase_id TEXT NOT NULL,
                    status TEXT NOT NULL,
                    outcome TEXT NOT NULL,
                    updated_at TEXT NOT NULL,
                    PRIMARY KEY (job_id, phase_id)
                );

                CREATE TABLE IF NOT EXISTS documents (
                    id TEXT PRIMARY KEY,
                    title TEXT NOT NULL,
                    content TEXT NOT NULL,
                    content_hash TEXT NOT NULL,
                    char_count INTEGER NOT NULL,
                    created_at TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status);
                CREATE INDEX IF NOT EXISTS idx_checkpoints_job ON checkpoints(job_id);
                ",
            )
            .context("Failed to create tables")?;

        // Databases created before worker heartbeats existed
        match self.conn.execute("ALTER TABLE jobs ADD COLUMN heartbeat_at TEXT", []) {
            Ok(_) => {}
            Err(e) if e.to_string().contains("duplicate column") => {}
            Err(e) => return Err(anyhow::anyhow!("Failed to add heartbeat_at column: {}", e)),
        }
        Ok(())
    }

    // ── Jobs ──────────────────────────────────────────────────────────

    pub fn insert_job(&self, job: &JobRecord) -> Result<()> {
        let plan = serde_json::to_string(&job.plan).context("Failed to serialize plan")?;
        let document_ids =
            serde_json::to_string(&job.document_ids).context("Failed to serialize document ids")?;
        self.conn
            .execute(
                "INSERT INTO jobs (id, plan, document_ids, status, fail_fast, cancel_requested, error,
                                   created_at, updated_at, last_progress_at, heartbeat_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    job.id,
                    plan,
                    document_ids,
                    job.status.as_str(),
                    job.fail_fast,
                    job.cancel_requested,
                    job.error,
                    to_ts(&job.created_at),
                    to_ts(&job.updated_at),
                    to_ts(&job.last_progress_at),
                    job.heartbeat_at.as_ref().map(to_ts),
                ],
            )
            .context("Failed to insert job")?;
        Ok(())
    }

    pub fn get_job(&self, id: &str) -> Result<Option<JobRecord>> {
        let row = self
            .conn
            .query_row(
                &format!("SELECT {} FROM jobs WHERE id = ?1", JOB_COLUMNS),
                params![id],
                JobRow::from_row,
            )
            .optional()
            .context("Failed to query job")?;
        row.map(JobRow::into_job).transpose()
    }

    pub fn list_jobs(&self, status: Option<JobStatus>) -> Result<Vec<JobRecord>> {
        let sql = match status {
            Some(_) => format!(
                "SELECT {} FROM jobs WHERE status = ?1 ORDER BY created_at DESC",
                JOB_COLUMNS
            ),
            None => format!("SELECT {} FROM jobs ORDER BY created_at DESC", JOB_COLUMNS),
        };
        let mut stmt = self.conn.prepare(&sql).context("Failed to prepare list_jobs")?;
        let rows = match status {
            Some(s) => stmt.query_map(params![s.as_str()], JobRow::from_row),
            None => stmt.query_map([], JobRow::from_row),
        }
        .context("Failed to query jobs")?;

        rows.map(|row| row.context("Failed to read job row")?.into_job())
            .collect()
    }

    pub fn update_job_status(&self, id: &str, status: JobStatus, error: Option<&str>) -> Result<bool> {
        let now = to_ts(&Utc::now());
        let changed = self
            .conn
            .execute(
                "UPDATE jobs SET status = ?1, error = ?2, updated_at = ?3, last_progress_at = ?3,
                                 heartbeat_at = CASE WHEN ?5 THEN NULL ELSE heartbeat_at END
                 WHERE id = ?4",
                params![status.as_str(), error, now, id, status.is_terminal()],
            )
            .context("Failed to update job status")?;
        Ok(changed > 0)
    }

    pub fn set_cancel_requested(&self, id: &str) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "UPDATE jobs SET cancel_requested = 1, updated_at = ?1 WHERE id = ?2",
                params![to_ts(&Utc::now()), id],
            )
            .context("Failed to flag job cancellation")?;
        Ok(changed > 0)
    }

    pub fn touch_heartbeat(&self, id: &str) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "UPDATE jobs SET heartbeat_at = ?1
                 WHERE id = ?2 AND status IN ('pending', 'running')",
                params![to_ts(&Utc::now()), id],
            )
            .context("Failed to record worker heartbeat")?;
        Ok(changed > 0)
    }

    // ── Checkpoints ───────────────────────────────────────────────────

    pub fn upsert_checkpoint(
        &self,
        job_id: &str,
        coordinate: &Coordinate,
        result: &CallResult,
        input_hash: &str,
    ) -> Result<()> {
        let now = to_ts(&Utc::now());
        self.conn
            .execute(
                "INSERT INTO checkpoints (job_id, phase_id, operation, pass, item, text, model,
                                          prompt_tokens, completion_tokens, elapsed_ms, chunked,
                                          chunk_count, partial, attempts, input_hash, recorded_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)
                 ON CONFLICT(job_id, phase_id, operation, pass, item) DO UPDATE SET
                    text = excluded.text,
                    model = excluded.model,
                    prompt_tokens = excluded.prompt_tokens,
                    completion_tokens = excluded.completion_tokens,
                    elapsed_ms = excluded.elapsed_ms,
                    chunked = excluded.chunked,
                    chunk_count = excluded.chunk_count,
                    partial = excluded.partial,
                    attempts = excluded.attempts,
                    input_hash = excluded.input_hash,
                    recorded_at = excluded.recorded_at",
                params![
                    job_id,
                    coordinate.phase,
                    coordinate.operation,
                    coordinate.pass,
                    coordinate.item,
                    result.text,
                    result.model,
                    result.prompt_tokens as i64,
                    result.completion_tokens as i64,
                    result.elapsed_ms as i64,
                    result.chunked,
                    result.chunk_count,
                    result.partial,
                    result.attempts,
                    input_hash,
                    now,
                ],
            )
            .context("Failed to upsert checkpoint")?;

        self.conn
            .execute(
                "UPDATE jobs SET last_progress_at = ?1 WHERE id = ?2",
                params![now, job_id],
            )
            .context("Failed to record job progress")?;
        Ok(())
    }

    fn checkpoint_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<(Checkpoint, String)> {
        let prompt_tokens: i64 = row.get(5)?;
        let completion_tokens: i64 = row.get(6)?;
        let elapsed_ms: i64 = row.get(7)?;
        Ok((
            Checkpoint {
                coordinate: Coordinate {
                    phase: row.get(0)?,
                    operation: row.get(1)?,
                    pass: row.get(2)?,
                    item: row.get(3)?,
                },
                result: CallResult {
                    text: row.get(4)?,
                    model: row.get(12)?,
                    prompt_tokens: prompt_tokens.max(0) as u64,
                    completion_tokens: completion_tokens.max(0) as u64,
                    elapsed_ms: elapsed_ms.max(0) as u64,
                    chunked: row.get(8)?,
                    chunk_count: row.get(9)?,
                    partial: row.get(10)?,
                    attempts: row.get(11)?,
                },
                input_hash: row.get(13)?,
                recorded_at: Utc::now(),
            },
            row.get(14)?,
        ))
    }

    const CHECKPOINT_COLUMNS: &'static str = "phase_id, operation, pass, item, text, prompt_tokens, \
         completion_tokens, elapsed_ms, chunked, chunk_count, partial, attempts, model, \
         input_hash, recorded_at";

    pub fn get_checkpoint(&self, job_id: &str, coordinate: &Coordinate) -> Result<Option<Checkpoint>> {
        let row = self
            .conn
            .query_row(
                &format!(
                    "SELECT {} FROM checkpoints
                     WHERE job_id = ?1 AND phase_id = ?2 AND operation = ?3 AND pass = ?4 AND item = ?5",
                    Self::CHECKPOINT_COLUMNS
                ),
                params![
                    job_id,
                    coordinate.phase,
                    coordinate.operation,
                    coordinate.pass,
                    coordinate.item
                ],
                Self::checkpoint_from_row,
            )
            .optional()
            .context("Failed to query checkpoint")?;

        row.map(|(mut checkpoint, recorded_at)| {
            checkpoint.recorded_at = parse_ts(&recorded_at)?;
            Ok(checkpoint)
        })
        .transpose()
    }

    pub fn list_checkpoints(&self, job_id: &str) -> Result<Vec<Checkpoint>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {} FROM checkpoints WHERE job_id = ?1
                 ORDER BY recorded_at ASC, phase_id, operation, pass, item",
                Self::CHECKPOINT_COLUMNS
            ))
            .context("Failed to prepare list_checkpoints")?;
        let rows = stmt
            .query_map(params![job_id], Self::checkpoint_from_row)
            .context("Failed to query checkpoints")?;

        rows.map(|row| {
            let (mut checkpoint, recorded_at) = row.context("Failed to read checkpoint row")?;
            checkpoint.recorded_at = parse_ts(&recorded_at)?;
            Ok(checkpoint)
        })
        .collect()
    }

    // ── Phase results ─────────────────────────────────────────────────

    pub fn upsert_phase_result(&self, job_id: &str, outcome: &PhaseOutcome) -> Result<()> {
        let json = serde_json::to_string(outcome).context("Failed to serialize phase outcome")?;
        self.conn
            .execute(
                "INSERT INTO phase_results (job_id, phase_id, status, outcome, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(job_id, phase_id) DO UPDATE SET
                    status = excluded.status,
                    outcome = excluded.outcome,
                    updated_at = excluded.updated_at",
                params![
                    job_id,
                    outcome.phase.to_string(),
                    outcome.status.label(),
                    json,
                    to_ts(&Utc::now())
                ],
            )
            .context("Failed to upsert phase result")?;
        Ok(())
    }

    pub fn list_phase_results(&self, job_id: &str) -> Result<Vec<PhaseOutcome>> {
        let mut stmt = self
            .conn
            .prepare("SELECT outcome FROM phase_results WHERE job_id = ?1")
            .context("Failed to prepare list_phase_results")?;
        let rows = stmt
            .query_map(params![job_id], |row| row.get::<_, String>(0))
            .context("Failed to query phase results")?;

        let mut outcomes = rows
            .map(|row| {
                let json = row.context("Failed to read phase result row")?;
                serde_json::from_str::<PhaseOutcome>(&json).context("Corrupt phase result")
            })
            .collect::<Result<Vec<_>>>()?;
        outcomes.sort_by(|a, b| a.phase.cmp(&b.phase));
        Ok(outcomes)
    }

    // ── Documents ─────────────────────────────────────────────────────

    pub fn insert_document(&self, doc: &Document) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO documents (id, title, content, content_hash, char_count, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    doc.id,
                    doc.title,
                    doc.content,
                    doc.content_hash,
                    doc.char_count as i64,
                    to_ts(&doc.created_at)
                ],
            )
            .context("Failed to insert document")?;
        Ok(())
    }

    pub fn get_document(&self, id: &str) -> Result<Option<Document>> {
        let row = self
            .conn
            .query_row(
                "SELECT id, title, content, content_hash, char_count, created_at
                 FROM documents WHERE id = ?1",
                params![id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, i64>(4)?,
                        row.get::<_, String>(5)?,
                    ))
                },
            )
            .optional()
            .context("Failed to query document")?;

        row.map(|(id, title, content, content_hash, char_count, created_at)| {
            Ok(Document {
                id,
                title,
                content,
                content_hash,
                char_count: char_count.max(0) as usize,
                created_at: parse_ts(&created_at)?,
            })
        })
        .transpose()
    }

    pub fn list_documents(&self) -> Result<Vec<DocumentSummary>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, title, content_hash, char_count, created_at
                 FROM documents ORDER BY created_at ASC, id ASC",
            )
            .context("Failed to prepare list_documents")?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, String>(4)?,
                ))
            })
            .context("Failed to query documents")?;

        rows.map(|row| {
            let (id, title, content_hash, char_count, created_at) =
                row.context("Failed to read document row")?;
            Ok(DocumentSummary {
                id,
                title,
                content_hash,
                char_count: char_count.max(0) as usize,
                created_at: parse_ts(&created_at)?,
            })
        })
        .collect()
    }

    pub fn delete_document(&self, id: &str) -> Result<bool> {
        let changed = self
            .conn
            .execute("DELETE FROM documents WHERE id = ?1", params![id])
            .context("Failed to delete document")?;
        Ok(changed > 0)
    }
}
