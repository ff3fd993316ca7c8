//! SQLite-backed Job Record Store.
//!
//! Every mutation is a conditional UPDATE so that terminal records can never
//! be rewritten, whichever convergence path gets there first.
//!
//! Calls are synchronous and run on the calling task. Each one is a single
//! indexed statement (or one short transaction) on a local file, and no lock
//! is held across an `.await`, so the worker thread is blocked for at most
//! one statement. A networked database would need `spawn_blocking` or an
//! async driver here.

use std::{
    path::Path,
    sync::{Mutex, MutexGuard},
    time::Duration,
};

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use uuid::Uuid;

use crate::models::{
    ApplyOutcome, JobKind, JobRecord, JobRef, JobState, NewJob, StorageMode, TerminalUpdate,
};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS jobs (
        id TEXT PRIMARY KEY,
        owner_id TEXT NOT NULL,
        kind TEXT NOT NULL,
        external_id TEXT UNIQUE,
        status TEXT NOT NULL,
        progress REAL,
        output_urls TEXT NOT NULL DEFAULT '[]',
        thumbnail_urls TEXT NOT NULL DEFAULT '[]',
        storage_keys TEXT NOT NULL DEFAULT '[]',
        storage_mode TEXT,
        error_message TEXT,
        finalize_claimed_at TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        completed_at TEXT
    );
    CREATE INDEX IF NOT EXISTS idx_jobs_status_created ON jobs(status, created_at);
    CREATE INDEX IF NOT EXISTS idx_jobs_owner ON jobs(owner_id);
";

const COLUMNS: &str = "id,owner_id,kind,external_id,status,progress,output_urls,thumbnail_urls,storage_keys,storage_mode,error_message,created_at,updated_at,completed_at";

const NON_TERMINAL: &str = "status IN ('QUEUED','RUNNING')";

pub struct JobStore {
    conn: Mutex<Connection>,
}

impl JobStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed creating database directory {}", parent.display()))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("Failed opening job store {}", path.display()))?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;")?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)
            .context("Failed applying job store schema")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("job store connection lock poisoned"))
    }

    pub fn insert(&self, job: &NewJob) -> Result<JobRecord> {
        let now = Utc::now();
        let id = Uuid::new_v4().to_string();
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO jobs(id,owner_id,kind,status,created_at,updated_at) VALUES(?1,?2,?3,?4,?5,?5)",
            params![
                id,
                job.owner_id,
                job.kind.as_str(),
                JobState::Queued.as_str(),
                ts(now)
            ],
        )
        .context("Failed inserting job record")?;
        select_one(&conn, "id = ?1 AND owner_id = ?2", params![id, job.owner_id])?
            .ok_or_else(|| anyhow!("job {id} vanished after insert"))
    }

    pub fn attach_external_id(&self, job: &JobRef, external_id: &str) -> Result<bool> {
        let conn = self.conn()?;
        let changed = conn
            .execute(
                &format!(
                    "UPDATE jobs SET external_id = ?1, updated_at = ?2 WHERE id = ?3 AND owner_id = ?4 AND {NON_TERMINAL}"
                ),
                params![external_id, ts(Utc::now()), job.job_id, job.owner_id],
            )
            .with_context(|| format!("Failed attaching external id to job {}", job.job_id))?;
        Ok(changed == 1)
    }

    pub fn get(&self, job: &JobRef) -> Result<Option<JobRecord>> {
        let conn = self.conn()?;
        select_one(
            &conn,
            "id = ?1 AND owner_id = ?2",
            params![job.job_id, job.owner_id],
        )
    }

    pub fn find_by_external_id(&self, external_id: &str) -> Result<Option<JobRecord>> {
        let conn = self.conn()?;
        select_one(&conn, "external_id = ?1", params![external_id])
    }

    /// QUEUED/RUNNING -> RUNNING. Returns `false` when the record is already
    /// terminal or unknown.
    pub fn mark_running(&self, job: &JobRef, progress: Option<f64>) -> Result<bool> {
        let conn = self.conn()?;
        let changed = conn.execute(
            &format!(
                "UPDATE jobs SET status = 'RUNNING', progress = COALESCE(?1, progress), updated_at = ?2 WHERE id = ?3 AND owner_id = ?4 AND {NON_TERMINAL}"
            ),
            params![progress, ts(Utc::now()), job.job_id, job.owner_id],
        )?;
        Ok(changed == 1)
    }

    /// Take the right to run finalization for a non-terminal record. A claim
    /// older than `lease` is considered abandoned and can be retaken.
    pub fn claim_finalization(&self, job: &JobRef, lease: Duration) -> Result<bool> {
        let now = Utc::now();
        let lease = chrono::Duration::from_std(lease).unwrap_or_else(|_| chrono::Duration::days(365));
        let expired_before = now.checked_sub_signed(lease).unwrap_or(DateTime::<Utc>::MIN_UTC);
        let conn = self.conn()?;
        let changed = conn.execute(
            &format!(
                "UPDATE jobs SET finalize_claimed_at = ?1 WHERE id = ?2 AND owner_id = ?3 AND {NON_TERMINAL} AND (finalize_claimed_at IS NULL OR finalize_claimed_at < ?4)"
            ),
            params![ts(now), job.job_id, job.owner_id, ts(expired_before)],
        )?;
        Ok(changed == 1)
    }

    /// The single guarded entry point for terminal transitions. A record that
    /// is already terminal is returned untouched as [`ApplyOutcome::Noop`].
    pub fn apply_terminal_status(
        &self,
        job: &JobRef,
        update: TerminalUpdate,
    ) -> Result<ApplyOutcome> {
        self.write_terminal(job, update, None)
    }

    /// Terminal transition that did not come from the provider (poll budget
    /// exhausted, user cancel). It also yields to a live finalization claim,
    /// so a success that is still being stored wins.
    pub fn apply_local_terminal(
        &self,
        job: &JobRef,
        update: TerminalUpdate,
        lease: Duration,
    ) -> Result<ApplyOutcome> {
        let lease = chrono::Duration::from_std(lease).unwrap_or_else(|_| chrono::Duration::days(365));
        let expired_before = Utc::now()
            .checked_sub_signed(lease)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        self.write_terminal(job, update, Some(expired_before))
    }

    fn write_terminal(
        &self,
        job: &JobRef,
        update: TerminalUpdate,
        claim_expired_before: Option<DateTime<Utc>>,
    ) -> Result<ApplyOutcome> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let current = select_one(
            &tx,
            "id = ?1 AND owner_id = ?2",
            params![job.job_id, job.owner_id],
        )?
        .ok_or_else(|| anyhow!("Unknown job {} for owner {}", job.job_id, job.owner_id))?;

        if current.status.is_terminal() {
            return Ok(ApplyOutcome::Noop(current));
        }

        if let Some(cutoff) = claim_expired_before {
            let claimed_at: Option<String> = tx.query_row(
                "SELECT finalize_claimed_at FROM jobs WHERE id = ?1 AND owner_id = ?2",
                params![job.job_id, job.owner_id],
                |row| row.get(0),
            )?;
            if claimed_at.is_some_and(|claimed| claimed >= ts(cutoff)) {
                return Ok(ApplyOutcome::Noop(current));
            }
        }

        let now = ts(Utc::now());
        let state = update.state();
        let changed = match update {
            TerminalUpdate::Completed(outputs) => tx.execute(
                &format!(
                    "UPDATE jobs SET status = ?1, progress = 100.0, output_urls = ?2, thumbnail_urls = ?3, storage_keys = ?4, storage_mode = ?5, error_message = ?6, finalize_claimed_at = NULL, updated_at = ?7, completed_at = ?7 WHERE id = ?8 AND owner_id = ?9 AND {NON_TERMINAL}"
                ),
                params![
                    state.as_str(),
                    encode_list(&outputs.permanent_urls)?,
                    encode_list(&outputs.thumbnail_urls)?,
                    encode_list(&outputs.storage_keys)?,
                    outputs.mode.as_str(),
                    outputs.warning,
                    now,
                    job.job_id,
                    job.owner_id
                ],
            )?,
            TerminalUpdate::Failed(message) => tx.execute(
                &format!(
                    "UPDATE jobs SET status = ?1, error_message = ?2, finalize_claimed_at = NULL, updated_at = ?3, completed_at = ?3 WHERE id = ?4 AND owner_id = ?5 AND {NON_TERMINAL}"
                ),
                params![state.as_str(), message, now, job.job_id, job.owner_id],
            )?,
            TerminalUpdate::Cancelled(message) => tx.execute(
                &format!(
                    "UPDATE jobs SET status = ?1, error_message = ?2, finalize_claimed_at = NULL, updated_at = ?3, completed_at = ?3 WHERE id = ?4 AND owner_id = ?5 AND {NON_TERMINAL}"
                ),
                params![state.as_str(), message, now, job.job_id, job.owner_id],
            )?,
        };

        let updated = select_one(
            &tx,
            "id = ?1 AND owner_id = ?2",
            params![job.job_id, job.owner_id],
        )?
        .ok_or_else(|| anyhow!("job {} vanished during update", job.job_id))?;
        tx.commit()?;

        if changed == 1 {
            Ok(ApplyOutcome::Updated(updated))
        } else {
            Ok(ApplyOutcome::Noop(updated))
        }
    }

    /// In-flight records created before `cutoff`, oldest first.
    pub fn list_stale(
        &self,
        cutoff: DateTime<Utc>,
        owner_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<JobRecord>> {
        let conn = self.conn()?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let mut stmt = conn.prepare(&format!(
            "SELECT {COLUMNS} FROM jobs WHERE {NON_TERMINAL} AND created_at < ?1 AND (?2 IS NULL OR owner_id = ?2) ORDER BY created_at ASC LIMIT ?3"
        ))?;
        let rows = stmt.query_map(params![ts(cutoff), owner_id, limit], read_record)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed listing stale jobs")
    }
}

fn select_one(
    conn: &Connection,
    predicate: &str,
    params: impl rusqlite::Params,
) -> Result<Option<JobRecord>> {
    conn.query_row(
        &format!("SELECT {COLUMNS} FROM jobs WHERE {predicate}"),
        params,
        read_record,
    )
    .optional()
    .context("Failed reading job record")
}

fn read_record(row: &Row<'_>) -> rusqlite::Result<JobRecord> {
    let kind: String = row.get(2)?;
    let status: String = row.get(4)?;
    let storage_mode: Option<String> = row.get(9)?;
    Ok(JobRecord {
        id: row.get(0)?,
        owner_id: row.get(1)?,
        kind: JobKind::parse(&kind).ok_or_else(|| invalid_column(2, &kind))?,
        external_id: row.get(3)?,
        status: JobState::parse(&status).ok_or_else(|| invalid_column(4, &status))?,
        progress: row.get(5)?,
        output_urls: decode_list(row, 6)?,
        thumbnail_urls: decode_list(row, 7)?,
        storage_keys: decode_list(row, 8)?,
        storage_mode: storage_mode.as_deref().and_then(StorageMode::parse),
        error_message: row.get(10)?,
        created_at: parse_ts(row, 11)?,
        updated_at: parse_ts(row, 12)?,
        completed_at: match row.get::<_, Option<String>>(13)? {
            Some(_) => Some(parse_ts(row, 13)?),
            None => None,
        },
    })
}

fn invalid_column(idx: usize, value: &str) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        rusqlite::types::Type::Text,
        format!("unexpected value `{value}`").into(),
    )
}

fn decode_list(row: &Row<'_>, idx: usize) -> rusqlite::Result<Vec<String>> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn encode_list(items: &[String]) -> Result<String> {
    serde_json::to_string(items).context("Failed encoding URL list")
}

fn parse_ts(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|v| v.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
}

/// Fixed-width UTC timestamps so string comparison in SQL orders correctly.
fn ts(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}
