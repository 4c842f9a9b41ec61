//! libSQL backend for `MessageStore` and `JobLog`.
//!
//! Supports local file and in-memory databases. Lifecycle transitions are
//! single conditional `UPDATE` statements, so two workers racing for the
//! same record cannot both win.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, TimeDelta, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{DatabaseError, PipelineError};
use crate::scheduler::job::{Job, JobType};
use crate::store::migrations;
use crate::store::traits::{
    JobLog, MessageRecord, MessageStatus, MessageStore, ProcessingStats, cutoff_before,
    not_discovered, retries_exhausted, transition_error,
};

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
pub struct LibSqlStore {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlStore {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;
        let store = Self::connect(db).await?;
        info!(path = %path.display(), "Database opened");
        Ok(store)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;
        Self::connect(db).await
    }

    async fn connect(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;
        migrations::run_migrations(&conn).await?;
        Ok(Self {
            db: Arc::new(db),
            conn,
        })
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }

    async fn query_records(
        &self,
        op: &str,
        sql: &str,
        params: impl libsql::params::IntoParams,
    ) -> Result<Vec<MessageRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, params)
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?;

        let mut records = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?
        {
            records.push(row_to_record(&row)?);
        }
        Ok(records)
    }

    async fn fetch(
        &self,
        user_id: &str,
        message_id: &str,
    ) -> Result<Option<MessageRecord>, DatabaseError> {
        let mut records = self
            .query_records(
                "get_record",
                &format!(
                    "SELECT {RECORD_COLUMNS} FROM message_records WHERE user_id = ?1 AND message_id = ?2"
                ),
                params![user_id, message_id],
            )
            .await?;
        Ok(records.pop())
    }

    /// Run a conditional transition `UPDATE`. When no row matched, `refuse`
    /// turns the current record into the error to report.
    async fn transition(
        &self,
        op: &str,
        user_id: &str,
        message_id: &str,
        sql: &str,
        params: impl libsql::params::IntoParams,
        refuse: impl FnOnce(&MessageRecord) -> PipelineError,
    ) -> Result<MessageRecord, PipelineError> {
        let changed = self
            .conn()
            .execute(sql, params)
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?;

        let record = self
            .fetch(user_id, message_id)
            .await?
            .ok_or_else(|| not_discovered(message_id))?;
        if changed == 0 {
            return Err(refuse(&record));
        }
        debug!(user_id, message_id, status = %record.status, "Message record updated");
        Ok(record)
    }
}

// ── Helper functions ────────────────────────────────────────────────

const RECORD_COLUMNS: &str = "id, user_id, message_id, status, discovery_count, discovered_at, \
     processing_started_at, processing_completed_at, attempt_count, max_retries, last_result, \
     success, filter_snapshot";

const JOB_COLUMNS: &str =
    "id, job_type, status, attempts, scheduled_for, started_at, completed_at, metadata, error";

/// Fixed-width UTC timestamps so string comparison in SQL is chronological.
fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, DatabaseError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| DatabaseError::Serialization(format!("bad timestamp {s:?}: {e}")))
}

fn parse_optional_datetime(s: Option<String>) -> Result<Option<DateTime<Utc>>, DatabaseError> {
    s.as_deref().map(parse_datetime).transpose()
}

fn parse_optional_json(s: Option<String>) -> Result<Option<serde_json::Value>, DatabaseError> {
    s.as_deref()
        .map(serde_json::from_str)
        .transpose()
        .map_err(|e| DatabaseError::Serialization(e.to_string()))
}

fn opt_text(s: Option<String>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s),
        None => libsql::Value::Null,
    }
}

fn limit_param(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

fn text(row: &libsql::Row, idx: i32) -> Result<String, DatabaseError> {
    row.get::<String>(idx)
        .map_err(|e| DatabaseError::Serialization(format!("column {idx}: {e}")))
}

fn int(row: &libsql::Row, idx: i32) -> Result<i64, DatabaseError> {
    row.get::<i64>(idx)
        .map_err(|e| DatabaseError::Serialization(format!("column {idx}: {e}")))
}

fn row_to_record(row: &libsql::Row) -> Result<MessageRecord, DatabaseError> {
    let id = text(row, 0)?;
    let status = text(row, 3)?;
    let discovered_at = text(row, 5)?;

    Ok(MessageRecord {
        id: Uuid::parse_str(&id).map_err(|e| DatabaseError::Serialization(e.to_string()))?,
        user_id: text(row, 1)?,
        message_id: text(row, 2)?,
        status: status.parse().map_err(DatabaseError::Serialization)?,
        discovery_count: int(row, 4)? as u32,
        discovered_at: parse_datetime(&discovered_at)?,
        processing_started_at: parse_optional_datetime(row.get::<String>(6).ok())?,
        processing_completed_at: parse_optional_datetime(row.get::<String>(7).ok())?,
        attempt_count: int(row, 8)? as u32,
        max_retries: int(row, 9)? as u32,
        last_result: parse_optional_json(row.get::<String>(10).ok())?,
        success: row.get::<i64>(11).ok().map(|v| v != 0),
        filter_snapshot: parse_optional_json(row.get::<String>(12).ok())?,
    })
}

fn row_to_job(row: &libsql::Row) -> Result<Job, DatabaseError> {
    let id = text(row, 0)?;
    let job_type = text(row, 1)?;
    let status = text(row, 2)?;
    let scheduled_for = text(row, 4)?;
    let metadata = text(row, 7)?;

    Ok(Job {
        id: Uuid::parse_str(&id).map_err(|e| DatabaseError::Serialization(e.to_string()))?,
        job_type: job_type.parse().map_err(DatabaseError::Serialization)?,
        status: status.parse().map_err(DatabaseError::Serialization)?,
        attempts: int(row, 3)? as u32,
        scheduled_for: parse_datetime(&scheduled_for)?,
        started_at: parse_optional_datetime(row.get::<String>(5).ok())?,
        completed_at: parse_optional_datetime(row.get::<String>(6).ok())?,
        metadata: serde_json::from_str(&metadata)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?,
        error: row.get::<String>(8).ok(),
    })
}

// ── MessageStore ────────────────────────────────────────────────────

#[async_trait]
impl MessageStore for LibSqlStore {
    async fn mark_discovered(
        &self,
        user_id: &str,
        message_id: &str,
        filter_snapshot: Option<serde_json::Value>,
        max_retries: u32,
    ) -> Result<MessageRecord, PipelineError> {
        let record = MessageRecord::new(user_id, message_id, max_retries);
        let snapshot = filter_snapshot.map(|v| v.to_string());

        self.conn()
            .execute(
                "INSERT INTO message_records (id, user_id, message_id, status, discovery_count, discovered_at, attempt_count, max_retries, filter_snapshot)
                 VALUES (?1, ?2, ?3, 'discovered', 1, ?4, 0, ?5, ?6)
                 ON CONFLICT (user_id, message_id) DO UPDATE SET
                     discovery_count = discovery_count + 1,
                     discovered_at = excluded.discovered_at",
                params![
                    record.id.to_string(),
                    user_id,
                    message_id,
                    ts(record.discovered_at),
                    i64::from(max_retries),
                    opt_text(snapshot),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("mark_discovered: {e}")))?;

        self.fetch(user_id, message_id)
            .await?
            .ok_or_else(|| not_discovered(message_id))
    }

    async fn mark_processing_started(
        &self,
        user_id: &str,
        message_id: &str,
    ) -> Result<MessageRecord, PipelineError> {
        self.transition(
            "mark_processing_started",
            user_id,
            message_id,
            "UPDATE message_records
             SET status = 'processing', processing_started_at = ?3,
                 processing_completed_at = NULL, attempt_count = attempt_count + 1
             WHERE user_id = ?1 AND message_id = ?2 AND status = 'discovered'",
            params![user_id, message_id, ts(Utc::now())],
            |r| transition_error(r, MessageStatus::Processing),
        )
        .await
    }

    async fn mark_processing_completed(
        &self,
        user_id: &str,
        message_id: &str,
        result: serde_json::Value,
        success: bool,
    ) -> Result<MessageRecord, PipelineError> {
        let target = if success {
            MessageStatus::Completed
        } else {
            MessageStatus::Failed
        };
        self.transition(
            "mark_processing_completed",
            user_id,
            message_id,
            "UPDATE message_records
             SET status = ?3, processing_completed_at = ?4, last_result = ?5, success = ?6
             WHERE user_id = ?1 AND message_id = ?2 AND status = 'processing'",
            params![
                user_id,
                message_id,
                target.as_str(),
                ts(Utc::now()),
                result.to_string(),
                i64::from(success),
            ],
            |r| transition_error(r, target),
        )
        .await
    }

    async fn mark_for_retry(
        &self,
        user_id: &str,
        message_id: &str,
    ) -> Result<MessageRecord, PipelineError> {
        self.transition(
            "mark_for_retry",
            user_id,
            message_id,
            "UPDATE message_records
             SET status = 'discovered', processing_started_at = NULL,
                 processing_completed_at = NULL, success = NULL
             WHERE user_id = ?1 AND message_id = ?2 AND status = 'failed'
               AND attempt_count < max_retries",
            params![user_id, message_id],
            |r| {
                if r.status == MessageStatus::Failed {
                    retries_exhausted(r)
                } else {
                    transition_error(r, MessageStatus::Discovered)
                }
            },
        )
        .await
    }

    async fn mark_processing_timeout(
        &self,
        user_id: &str,
        message_id: &str,
    ) -> Result<MessageRecord, PipelineError> {
        self.transition(
            "mark_processing_timeout",
            user_id,
            message_id,
            "UPDATE message_records
             SET status = 'failed', processing_completed_at = ?3,
                 last_result = '{\"error\":\"processing_timeout\"}', success = 0
             WHERE user_id = ?1 AND message_id = ?2 AND status = 'processing'",
            params![user_id, message_id, ts(Utc::now())],
            |r| transition_error(r, MessageStatus::Failed),
        )
        .await
    }

    async fn get_record(
        &self,
        user_id: &str,
        message_id: &str,
    ) -> Result<Option<MessageRecord>, PipelineError> {
        Ok(self.fetch(user_id, message_id).await?)
    }

    async fn get_unprocessed(
        &self,
        user_id: &str,
        limit: usize,
    ) -> Result<Vec<MessageRecord>, PipelineError> {
        Ok(self
            .query_records(
                "get_unprocessed",
                &format!(
                    "SELECT {RECORD_COLUMNS} FROM message_records
                     WHERE user_id = ?1 AND status = 'discovered'
                     ORDER BY discovered_at ASC, message_id ASC LIMIT ?2"
                ),
                params![user_id, limit_param(limit)],
            )
            .await?)
    }

    async fn get_processing_history(
        &self,
        user_id: &str,
        status: Option<MessageStatus>,
        limit: usize,
    ) -> Result<Vec<MessageRecord>, PipelineError> {
        let records = match status {
            Some(status) => {
                self.query_records(
                    "get_processing_history",
                    &format!(
                        "SELECT {RECORD_COLUMNS} FROM message_records
                         WHERE user_id = ?1 AND status = ?2
                           AND status IN ('completed', 'failed')
                         ORDER BY processing_completed_at DESC LIMIT ?3"
                    ),
                    params![user_id, status.as_str(), limit_param(limit)],
                )
                .await?
            }
            None => {
                self.query_records(
                    "get_processing_history",
                    &format!(
                        "SELECT {RECORD_COLUMNS} FROM message_records
                         WHERE user_id = ?1 AND status IN ('completed', 'failed')
                         ORDER BY processing_completed_at DESC LIMIT ?2"
                    ),
                    params![user_id, limit_param(limit)],
                )
                .await?
            }
        };
        Ok(records)
    }

    async fn get_stats(&self, user_id: Option<&str>) -> Result<ProcessingStats, PipelineError> {
        let records = match user_id {
            Some(user_id) => {
                self.query_records(
                    "get_stats",
                    &format!("SELECT {RECORD_COLUMNS} FROM message_records WHERE user_id = ?1"),
                    params![user_id],
                )
                .await?
            }
            None => {
                self.query_records(
                    "get_stats",
                    &format!("SELECT {RECORD_COLUMNS} FROM message_records"),
                    (),
                )
                .await?
            }
        };
        Ok(ProcessingStats::from_records(&records))
    }

    async fn get_stale(&self, minutes: i64) -> Result<Vec<MessageRecord>, PipelineError> {
        let cutoff = cutoff_before(TimeDelta::try_minutes(minutes), "stale age")?;
        Ok(self
            .query_records(
                "get_stale",
                &format!(
                    "SELECT {RECORD_COLUMNS} FROM message_records
                     WHERE status = 'processing' AND processing_started_at < ?1"
                ),
                params![ts(cutoff)],
            )
            .await?)
    }

    async fn get_duplicates(&self, user_id: &str) -> Result<Vec<MessageRecord>, PipelineError> {
        Ok(self
            .query_records(
                "get_duplicates",
                &format!(
                    "SELECT {RECORD_COLUMNS} FROM message_records
                     WHERE user_id = ?1 AND discovery_count > 1
                     ORDER BY discovery_count DESC"
                ),
                params![user_id],
            )
            .await?)
    }

    async fn cleanup_old_records(&self, days: i64) -> Result<u64, PipelineError> {
        let cutoff = cutoff_before(TimeDelta::try_days(days), "retention period")?;
        let deleted = self
            .conn()
            .execute(
                "DELETE FROM message_records
                 WHERE status IN ('completed', 'failed') AND processing_completed_at < ?1",
                params![ts(cutoff)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("cleanup_old_records: {e}")))?;
        Ok(deleted)
    }

    async fn delete_user_data(&self, user_id: &str) -> Result<u64, PipelineError> {
        let deleted = self
            .conn()
            .execute(
                "DELETE FROM message_records WHERE user_id = ?1",
                params![user_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("delete_user_data: {e}")))?;
        Ok(deleted)
    }
}

// ── JobLog ──────────────────────────────────────────────────────────

#[async_trait]
impl JobLog for LibSqlStore {
    async fn create(&self, job: &Job) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO jobs (id, job_type, status, attempts, scheduled_for, started_at, completed_at, metadata, error, seq)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, (SELECT COALESCE(MAX(seq), 0) + 1 FROM jobs))",
                params![
                    job.id.to_string(),
                    job.job_type.as_str(),
                    job.status.as_str(),
                    i64::from(job.attempts),
                    ts(job.scheduled_for),
                    opt_text(job.started_at.map(ts)),
                    opt_text(job.completed_at.map(ts)),
                    job.metadata.to_string(),
                    opt_text(job.error.clone()),
                ],
            )
            .await
            .map_err(|e| {
                if e.to_string().contains("UNIQUE") {
                    DatabaseError::Constraint(format!("job {} already exists", job.id))
                } else {
                    DatabaseError::Query(format!("create job: {e}"))
                }
            })?;
        debug!(job_id = %job.id, status = %job.status, "Job recorded");
        Ok(())
    }

    async fn latest(&self, job_type: JobType) -> Result<Option<Job>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {JOB_COLUMNS} FROM jobs WHERE job_type = ?1 ORDER BY seq DESC LIMIT 1"
                ),
                params![job_type.as_str()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("latest job: {e}")))?;

        match rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("latest job: {e}")))?
        {
            Some(row) => Ok(Some(row_to_job(&row)?)),
            None => Ok(None),
        }
    }

    async fn recent(&self, limit: usize) -> Result<Vec<Job>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {JOB_COLUMNS} FROM jobs ORDER BY seq DESC LIMIT ?1"),
                params![limit_param(limit)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("recent jobs: {e}")))?;

        let mut jobs = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("recent jobs: {e}")))?
        {
            jobs.push(row_to_job(&row)?);
        }
        Ok(jobs)
    }
}
