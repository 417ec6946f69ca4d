//! SQLite client for the externally-owned job record store.
//!
//! The job store belongs to the hosting application; this module only reads
//! job records by logical state and writes back the scheduler request ref
//! assigned during reconciliation. Schema creation exists so tests and dev
//! runs can start from an empty file; production opens the application's
//! existing database.

use std::path::Path;
use std::sync::Mutex;

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use jobsync_statemap::{JobState, Priority};

/// Errors from job store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

/// A job record as read from the store.
///
/// `request_ref`, when set, must reference a scheduler request whose tags
/// decode to this job's id. The reconciler's write path maintains that.
#[derive(Debug, Clone)]
pub struct JobRecord {
    /// Stable, opaque job id.
    pub id: String,

    /// Function name of the job body.
    pub func: String,

    /// Priority tier.
    pub priority: Priority,

    /// Logical lifecycle state.
    pub state: JobState,

    /// Scheduler request id last linked to this job, if any.
    pub request_ref: Option<Uuid>,

    /// Last-update timestamp (Unix seconds). Used for read ordering only.
    pub updated_at: i64,
}

/// SQLite job store client.
///
/// The connection is serialized behind a mutex; reads are small and the only
/// write is a single-row ref update.
pub struct JobStore {
    conn: Mutex<Connection>,
}

impl JobStore {
    /// Open the job store at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;

        // WAL keeps readers from blocking the owning application's writers.
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;

        Ok(store)
    }

    /// Open an in-memory store (for testing).
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<(), StoreError> {
        let conn = self.conn.lock().expect("job store mutex poisoned");
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS jobs (
                id TEXT PRIMARY KEY,
                func TEXT NOT NULL,
                priority INTEGER NOT NULL DEFAULT 10,
                state TEXT NOT NULL,
                request_ref TEXT,
                updated_at INTEGER NOT NULL DEFAULT 0
            );

            CREATE INDEX IF NOT EXISTS idx_jobs_state ON jobs(state);
            "#,
        )?;

        debug!("Job store schema initialized");
        Ok(())
    }

    /// List jobs in the given logical state, newest-updated first.
    pub fn list_jobs(&self, state: JobState) -> Result<Vec<JobRecord>, StoreError> {
        let conn = self.conn.lock().expect("job store mutex poisoned");
        let mut stmt = conn.prepare(
            "SELECT id, func, priority, state, request_ref, updated_at
             FROM jobs WHERE state = ?1 ORDER BY updated_at DESC",
        )?;

        let records = stmt
            .query_map(params![state.as_str()], row_to_record)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(records)
    }

    /// Get a single job record.
    pub fn get_job(&self, id: &str) -> Result<Option<JobRecord>, StoreError> {
        let conn = self.conn.lock().expect("job store mutex poisoned");
        let mut stmt = conn.prepare(
            "SELECT id, func, priority, state, request_ref, updated_at
             FROM jobs WHERE id = ?1",
        )?;

        stmt.query_row(params![id], row_to_record)
            .optional()
            .map_err(Into::into)
    }

    /// Persist the scheduler request ref for a job and touch its update time.
    ///
    /// The touch moves the job to the front of subsequent newest-first
    /// reads, so freshly repaired jobs are re-examined before stale ones.
    ///
    /// Returns the number of rows affected; 0 means the job disappeared
    /// between the check and the repair, which the caller logs and leaves
    /// for the next pass.
    pub fn update_request_ref(&self, job_id: &str, request_ref: Uuid) -> Result<usize, StoreError> {
        let conn = self.conn.lock().expect("job store mutex poisoned");
        let rows = conn.execute(
            "UPDATE jobs SET request_ref = ?1, updated_at = ?2 WHERE id = ?3",
            params![request_ref.to_string(), Utc::now().timestamp(), job_id],
        )?;
        Ok(rows)
    }

    /// Insert or update a job record. Used by tests and dev tooling; the
    /// hosting application owns this table in production.
    pub fn upsert_job(&self, record: &JobRecord) -> Result<(), StoreError> {
        let conn = self.conn.lock().expect("job store mutex poisoned");
        conn.execute(
            r#"
            INSERT INTO jobs (id, func, priority, state, request_ref, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(id) DO UPDATE SET
                func = excluded.func,
                priority = excluded.priority,
                state = excluded.state,
                request_ref = excluded.request_ref,
                updated_at = excluded.updated_at
            "#,
            params![
                record.id,
                record.func,
                record.priority.value(),
                record.state.as_str(),
                record.request_ref.map(|r| r.to_string()),
                record.updated_at,
            ],
        )?;
        Ok(())
    }
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<JobRecord> {
    let state_str: String = row.get(3)?;
    // Unknown states read as FAILED rather than aborting the whole batch.
    let state = JobState::parse(&state_str).unwrap_or(JobState::Failed);

    let ref_str: Option<String> = row.get(4)?;
    let request_ref = ref_str.and_then(|s| Uuid::parse_str(&s).ok());

    Ok(JobRecord {
        id: row.get(0)?,
        func: row.get(1)?,
        priority: Priority::from_value(row.get(2)?),
        state,
        request_ref,
        updated_at: row.get(5)?,
    })
}
