//! SQLite-backed job-result store.
//!
//! The database file is the shared durable storage between the node that
//! submits a job and the worker that runs it. WAL mode lets readers poll
//! while a writer commits; writes take an immediate transaction so the
//! read-decide-write of an upsert is serialized across processes.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use tracing::{debug, info, warn};

use super::{apply_write, Consumed, JobResult, JobResultStore, JobStatus, ResultWrite, WriteOutcome};
use crate::error::{CoreError, Result};

/// SQLite database file name inside the data directory.
pub const DB_FILENAME: &str = "job_results.db";

/// Schema version stored in `PRAGMA user_version`.
const SCHEMA_VERSION: i64 = 1;

fn init_schema(conn: &Connection) -> Result<()> {
    let version: i64 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
    if version >= SCHEMA_VERSION {
        return Ok(());
    }
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS job_results (
            job_id TEXT PRIMARY KEY,
            request_id TEXT NOT NULL,
            status TEXT NOT NULL,
            result TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            completed_at INTEGER,
            delivered_at INTEGER
        );

        CREATE INDEX IF NOT EXISTS idx_job_results_delivered
            ON job_results (delivered_at);

        PRAGMA user_version = 1;
        ",
    )?;
    info!("initialized job_results schema v{}", SCHEMA_VERSION);
    Ok(())
}

/// Open a connection with WAL, and a busy timeout so concurrent processes
/// wait for each other instead of failing with `SQLITE_BUSY`.
fn open_conn(db_path: &Path) -> Result<Connection> {
    let conn = Connection::open(db_path)
        .map_err(|e| CoreError::Storage(format!("open {}: {e}", db_path.display())))?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "busy_timeout", 5000)?;
    Ok(conn)
}

fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| CoreError::Serialization(format!("timestamp out of range: {ms}")))
}

struct RawRow {
    job_id: String,
    request_id: String,
    status: String,
    result: String,
    created_at: i64,
    completed_at: Option<i64>,
    delivered_at: Option<i64>,
}

impl RawRow {
    fn into_result(self) -> Result<JobResult> {
        Ok(JobResult {
            job_id: self.job_id,
            request_id: self.request_id,
            status: self.status.parse::<JobStatus>()?,
            result: serde_json::from_str(&self.result)?,
            created_at: from_millis(self.created_at)?,
            completed_at: self.completed_at.map(from_millis).transpose()?,
            delivered_at: self.delivered_at.map(from_millis).transpose()?,
        })
    }
}

const SELECT_COLUMNS: &str =
    "job_id, request_id, status, result, created_at, completed_at, delivered_at";

fn read_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRow> {
    Ok(RawRow {
        job_id: row.get(0)?,
        request_id: row.get(1)?,
        status: row.get(2)?,
        result: row.get(3)?,
        created_at: row.get(4)?,
        completed_at: row.get(5)?,
        delivered_at: row.get(6)?,
    })
}

fn select_one(conn: &Connection, job_id: &str) -> Result<Option<JobResult>> {
    let raw = conn
        .query_row(
            &format!("SELECT {SELECT_COLUMNS} FROM job_results WHERE job_id = ?1"),
            params![job_id],
            read_row,
        )
        .optional()?;
    raw.map(RawRow::into_result).transpose()
}

#[derive(Clone)]
pub struct SqliteJobResults {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteJobResults {
    /// Open (or create) `job_results.db` inside `data_dir`.
    pub fn open(data_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(data_dir)
            .map_err(|e| CoreError::Storage(format!("create {}: {e}", data_dir.display())))?;
        Self::open_file(&data_dir.join(DB_FILENAME))
    }

    pub fn open_file(db_path: &Path) -> Result<Self> {
        let conn = open_conn(db_path)?;
        init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run a closure against the connection on the blocking pool.
    async fn with_conn<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut Connection) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock();
            f(&mut *conn)
        })
        .await
        .map_err(|e| CoreError::Storage(format!("blocking task failed: {e}")))?
    }
}

#[async_trait]
impl JobResultStore for SqliteJobResults {
    async fn write_result(&self, write: ResultWrite) -> Result<WriteOutcome> {
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let existing = select_one(&tx, &write.job_id)?;
            let (outcome, row) = apply_write(existing.as_ref(), &write, Utc::now());
            if let Some(row) = row {
                tx.execute(
                    "INSERT INTO job_results
                        (job_id, request_id, status, result, created_at, completed_at, delivered_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                     ON CONFLICT(job_id) DO UPDATE SET
                        status = excluded.status,
                        result = excluded.result,
                        completed_at = excluded.completed_at",
                    params![
                        row.job_id,
                        row.request_id,
                        row.status.as_str(),
                        serde_json::to_string(&row.result)?,
                        to_millis(row.created_at),
                        row.completed_at.map(to_millis),
                        row.delivered_at.map(to_millis),
                    ],
                )?;
            }
            tx.commit()?;
            if outcome == WriteOutcome::Stale {
                warn!(job_id = %write.job_id, status = write.status.as_str(), "ignoring stale result write");
            }
            Ok(outcome)
        })
        .await
    }

    async fn consume(&self, job_id: &str) -> Result<Consumed> {
        let job_id = job_id.to_string();
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let marked = tx.execute(
                "UPDATE job_results SET delivered_at = ?2
                 WHERE job_id = ?1 AND delivered_at IS NULL AND status != 'pending'",
                params![job_id, to_millis(Utc::now())],
            )?;
            let row = select_one(&tx, &job_id)?;
            tx.commit()?;
            if marked > 0 {
                debug!(%job_id, "result delivered");
            }
            Ok(match row {
                None => Consumed::NotFound,
                Some(row) if !row.status.is_terminal() => Consumed::NotReady,
                Some(row) => Consumed::Ready(row),
            })
        })
        .await
    }

    async fn peek(&self, job_id: &str) -> Result<Option<JobResult>> {
        let job_id = job_id.to_string();
        self.with_conn(move |conn| select_one(conn, &job_id)).await
    }

    async fn cleanup(&self, before: DateTime<Utc>) -> Result<usize> {
        let removed = self
            .with_conn(move |conn| {
                let n = conn.execute(
                    "DELETE FROM job_results
                     WHERE delivered_at IS NOT NULL AND delivered_at < ?1",
                    params![to_millis(before)],
                )?;
                Ok(n)
            })
            .await?;
        if removed > 0 {
            debug!(removed, "purged delivered job results");
        }
        Ok(removed)
    }

    async fn undelivered_before(&self, before: DateTime<Utc>) -> Result<Vec<JobResult>> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SELECT_COLUMNS} FROM job_results
                 WHERE delivered_at IS NULL AND status != 'pending' AND completed_at < ?1
                 ORDER BY completed_at"
            ))?;
            let raws = stmt
                .query_map(params![to_millis(before)], read_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            raws.into_iter().map(RawRow::into_result).collect()
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::{Job, GENERATION_QUEUE};
    use chrono::Duration;
    use serde_json::json;

    fn job() -> Job {
        Job::new("req-1", GENERATION_QUEUE, json!({}))
    }

    #[tokio::test]
    async fn test_sqlite_round_trip_and_idempotent_write() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteJobResults::open(dir.path()).unwrap();
        let job = job();

        assert_eq!(
            store.write_result(ResultWrite::pending(&job)).await.unwrap(),
            WriteOutcome::Inserted
        );
        let done = ResultWrite::completed(&job, json!({"text": "hello"}));
        assert_eq!(store.write_result(done.clone()).await.unwrap(), WriteOutcome::Advanced);
        assert_eq!(store.write_result(done).await.unwrap(), WriteOutcome::Unchanged);
        assert_eq!(
            store.write_result(ResultWrite::pending(&job)).await.unwrap(),
            WriteOutcome::Stale
        );

        let row = store.peek(&job.job_id).await.unwrap().unwrap();
        assert_eq!(row.status, JobStatus::Completed);
        assert_eq!(row.result, json!({"text": "hello"}));
        assert!(row.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_sqlite_consume_marks_delivery_once() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteJobResults::open(dir.path()).unwrap();
        let job = job();

        assert_eq!(store.consume(&job.job_id).await.unwrap(), Consumed::NotFound);
        store.write_result(ResultWrite::pending(&job)).await.unwrap();
        assert_eq!(store.consume(&job.job_id).await.unwrap(), Consumed::NotReady);

        store
            .write_result(ResultWrite::failed(&job, "boom"))
            .await
            .unwrap();
        let Consumed::Ready(first) = store.consume(&job.job_id).await.unwrap() else {
            panic!("expected ready");
        };
        let Consumed::Ready(second) = store.consume(&job.job_id).await.unwrap() else {
            panic!("expected ready");
        };
        assert_eq!(first.error_message(), "boom");
        assert_eq!(first.delivered_at, second.delivered_at);
    }

    #[tokio::test]
    async fn test_sqlite_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let job = job();
        {
            let store = SqliteJobResults::open(dir.path()).unwrap();
            store
                .write_result(ResultWrite::completed(&job, json!("persisted")))
                .await
                .unwrap();
        }
        // A restarted caller still finds the undelivered result.
        let store = SqliteJobResults::open(dir.path()).unwrap();
        let Consumed::Ready(row) = store.consume(&job.job_id).await.unwrap() else {
            panic!("expected ready");
        };
        assert_eq!(row.result, json!("persisted"));
    }

    #[tokio::test]
    async fn test_sqlite_cleanup_never_purges_undelivered() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteJobResults::open(dir.path()).unwrap();
        let delivered = job();
        let undelivered = job();
        for j in [&delivered, &undelivered] {
            store
                .write_result(ResultWrite::completed(j, json!("x")))
                .await
                .unwrap();
        }
        store.consume(&delivered.job_id).await.unwrap();

        let future = Utc::now() + Duration::hours(1);
        assert_eq!(store.cleanup(future).await.unwrap(), 1);
        assert!(store.peek(&undelivered.job_id).await.unwrap().is_some());
        let stuck = store.undelivered_before(future).await.unwrap();
        assert_eq!(stuck.len(), 1);
        assert_eq!(stuck[0].job_id, undelivered.job_id);
    }
}
