//! libSQL backend: async `JobStore` and `HistoryStore` implementation.
//!
//! Supports local file and in-memory databases.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::jobs::{Job, JobStatus, JobType, PayloadEnvelope};
use crate::scheduler::history::ActivationRecord;
use crate::store::migrations;
use crate::store::traits::{HistoryStore, JobStore};

/// Maximum stored length of the `result` and `error_message` cells.
const MAX_CELL_LEN: usize = 500;

/// How many times `claim_next` retries when another claimer wins the race.
const CLAIM_ATTEMPTS: usize = 5;

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
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

        let backend = Self::from_database(db)?;
        backend.init_schema().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let backend = Self::from_database(db)?;
        backend.init_schema().await?;
        Ok(backend)
    }

    fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;
        Ok(Self {
            db: Arc::new(db),
            conn,
        })
    }

    /// Run all pending schema migrations.
    pub async fn init_schema(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Explain why a conditional status update touched no rows.
    async fn transition_error(&self, id: Uuid, target: JobStatus) -> DatabaseError {
        match self.get_job(id).await {
            Ok(Some(job)) => DatabaseError::InvalidTransition {
                id,
                state: job.status.to_string(),
                target: target.to_string(),
            },
            Ok(None) => DatabaseError::NotFound {
                entity: "job".into(),
                id: id.to_string(),
            },
            Err(e) => e,
        }
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Canonical timestamp format. Fixed width, so text order is time order.
fn fmt_datetime(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_datetime(s: &Option<String>) -> Option<DateTime<Utc>> {
    s.as_ref().map(|s| parse_datetime(s))
}

/// Convert `Option<&str>` to libsql Value.
fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

/// Cut `s` to at most `max` chars, marking the cut with "...".
fn truncate_cell(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let keep: String = s.chars().take(max.saturating_sub(3)).collect();
    format!("{keep}...")
}

/// Map a libsql Row to a Job.
///
/// Column order matches JOB_COLUMNS.
fn row_to_job(row: &libsql::Row) -> Result<Job, DatabaseError> {
    let get_text = |idx: i32| -> Result<String, DatabaseError> {
        row.get::<String>(idx)
            .map_err(|e| DatabaseError::Query(format!("job column {idx}: {e}")))
    };

    let id_str = get_text(0)?;
    let job_type = JobType::from(get_text(1)?);
    let status_str = get_text(2)?;
    let payload_str: String = row.get(3).unwrap_or_default();
    let enqueued_str = get_text(4)?;
    let claimed_str: Option<String> = row.get(6).ok();
    let completed_str: Option<String> = row.get(7).ok();

    let status: JobStatus = status_str
        .parse()
        .map_err(|e: String| DatabaseError::Serialization(format!("job {id_str}: {e}")))?;
    let id = Uuid::parse_str(&id_str)
        .map_err(|e| DatabaseError::Serialization(format!("job id {id_str}: {e}")))?;

    let decoded = PayloadEnvelope::decode(&payload_str, &job_type);

    Ok(Job {
        id,
        job_type,
        status,
        payload: decoded.envelope,
        payload_decoding: decoded.decoding,
        enqueued_at: parse_datetime(&enqueued_str),
        user_email: row.get(5).ok(),
        claimed_at: parse_optional_datetime(&claimed_str),
        completed_at: parse_optional_datetime(&completed_str),
        result: row.get(8).ok(),
        error_code: row.get(9).ok(),
        error_message: row.get(10).ok(),
    })
}

/// Map a libsql Row to an ActivationRecord.
///
/// Column order matches HISTORY_COLUMNS.
fn row_to_activation(row: &libsql::Row) -> Result<ActivationRecord, DatabaseError> {
    let map_err = |e: libsql::Error| DatabaseError::Query(format!("activation row: {e}"));

    let timestamp: String = row.get(0).map_err(map_err)?;
    let total_jobs: i64 = row.get(1).map_err(map_err)?;
    let job_types: String = row.get(2).unwrap_or_else(|_| "{}".into());
    let estimated: i64 = row.get(3).map_err(map_err)?;
    let configured: i64 = row.get(4).map_err(map_err)?;
    let auto_stop: String = row.get(5).map_err(map_err)?;
    let initiator: String = row.get(6).map_err(map_err)?;

    let by_type: BTreeMap<JobType, usize> = serde_json::from_str(&job_types).unwrap_or_else(|e| {
        warn!("Unreadable job_types in activation history: {e}");
        BTreeMap::new()
    });

    Ok(ActivationRecord {
        timestamp: parse_datetime(&timestamp),
        total_jobs: total_jobs.max(0) as usize,
        by_type,
        estimated_minutes: estimated.max(0) as u32,
        configured_minutes: configured.max(0) as u32,
        scheduled_stop_at: parse_datetime(&auto_stop),
        initiator,
    })
}

const JOB_COLUMNS: &str = "id, job_name, status, payload, timestamp_enqueued, user_email, timestamp_claimed, timestamp_completed, result, error_code, error_message";

const HISTORY_COLUMNS: &str = "timestamp, total_jobs, job_types, estimated_duration_min, configured_duration_min, auto_stop_time, initiator";

// ── Job store ───────────────────────────────────────────────────────

#[async_trait]
impl JobStore for LibSqlBackend {
    async fn enqueue(
        &self,
        job_type: &JobType,
        body: serde_json::Value,
        user_email: Option<&str>,
    ) -> Result<Uuid, DatabaseError> {
        let job = Job::new(job_type.clone(), body, user_email.map(String::from));
        let payload = job
            .payload
            .encode()
            .map_err(|e| DatabaseError::Serialization(format!("payload: {e}")))?;

        self.conn()
            .execute(
                &format!(
                    "INSERT INTO job_queue ({JOB_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, NULL, NULL, NULL, NULL, NULL)"
                ),
                params![
                    job.id.to_string(),
                    job.job_type.as_str(),
                    JobStatus::Pending.as_str(),
                    payload,
                    fmt_datetime(job.enqueued_at),
                    opt_text(user_email),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("enqueue: {e}")))?;

        debug!(job_id = %job.id, job_type = %job.job_type, "Job enqueued");
        Ok(job.id)
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {JOB_COLUMNS} FROM job_queue WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_job: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_job(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_job: {e}"))),
        }
    }

    async fn list_pending(&self) -> Result<Vec<Job>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {JOB_COLUMNS} FROM job_queue WHERE status = ?1 ORDER BY timestamp_enqueued ASC, rowid ASC"
                ),
                params![JobStatus::Pending.as_str()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_pending: {e}")))?;

        let mut jobs = Vec::new();
        loop {
            match rows.next().await {
                Ok(Some(row)) => match row_to_job(&row) {
                    Ok(job) => jobs.push(job),
                    Err(e) => warn!("Skipping job row: {e}"),
                },
                Ok(None) => break,
                Err(e) => return Err(DatabaseError::Query(format!("list_pending: {e}"))),
            }
        }
        Ok(jobs)
    }

    async fn count_by_status(&self) -> Result<BTreeMap<JobStatus, u64>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT status, COUNT(*) FROM job_queue GROUP BY status",
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("count_by_status: {e}")))?;

        let mut counts: BTreeMap<JobStatus, u64> =
            JobStatus::ALL.iter().map(|s| (*s, 0)).collect();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("count_by_status: {e}")))?
        {
            let status: String = row.get(0).unwrap_or_default();
            let count: i64 = row.get(1).unwrap_or(0);
            match status.parse::<JobStatus>() {
                Ok(s) => *counts.entry(s).or_insert(0) += count.max(0) as u64,
                Err(e) => debug!("Ignoring rows with {e}"),
            }
        }
        Ok(counts)
    }

    async fn claim_next(&self, now: DateTime<Utc>) -> Result<Option<Job>, DatabaseError> {
        let conn = self.conn();

        for _ in 0..CLAIM_ATTEMPTS {
            let mut rows = conn
                .query(
                    "SELECT id FROM job_queue WHERE status = ?1 ORDER BY timestamp_enqueued ASC, rowid ASC LIMIT 1",
                    params![JobStatus::Pending.as_str()],
                )
                .await
                .map_err(|e| DatabaseError::Query(format!("claim_next: {e}")))?;

            let id: String = match rows.next().await {
                Ok(Some(row)) => row
                    .get(0)
                    .map_err(|e| DatabaseError::Query(format!("claim_next: {e}")))?,
                Ok(None) => return Ok(None),
                Err(e) => return Err(DatabaseError::Query(format!("claim_next: {e}"))),
            };

            let claimed = conn
                .execute(
                    "UPDATE job_queue SET status = ?1, timestamp_claimed = ?2 WHERE id = ?3 AND status = ?4",
                    params![
                        JobStatus::Running.as_str(),
                        fmt_datetime(now),
                        id.clone(),
                        JobStatus::Pending.as_str(),
                    ],
                )
                .await
                .map_err(|e| DatabaseError::Query(format!("claim_next: {e}")))?;

            if claimed == 1 {
                let uuid = Uuid::parse_str(&id)
                    .map_err(|e| DatabaseError::Serialization(format!("job id {id}: {e}")))?;
                debug!(job_id = %uuid, "Job claimed");
                return self.get_job(uuid).await;
            }
            debug!(job_id = %id, "Lost claim race, retrying");
        }

        Ok(None)
    }

    async fn complete_job(
        &self,
        id: Uuid,
        result: &serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        let result_str = truncate_cell(&result.to_string(), MAX_CELL_LEN);
        let updated = self
            .conn()
            .execute(
                "UPDATE job_queue SET status = ?1, timestamp_completed = ?2, result = ?3 WHERE id = ?4 AND status = ?5",
                params![
                    JobStatus::Completed.as_str(),
                    fmt_datetime(now),
                    result_str,
                    id.to_string(),
                    JobStatus::Running.as_str(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("complete_job: {e}")))?;

        if updated == 0 {
            return Err(self.transition_error(id, JobStatus::Completed).await);
        }
        debug!(job_id = %id, "Job completed");
        Ok(())
    }

    async fn fail_job(
        &self,
        id: Uuid,
        error_code: &str,
        error_message: &str,
        now: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        let message: String = error_message.chars().take(MAX_CELL_LEN).collect();
        let updated = self
            .conn()
            .execute(
                "UPDATE job_queue SET status = ?1, timestamp_completed = ?2, error_code = ?3, error_message = ?4 WHERE id = ?5 AND status = ?6",
                params![
                    JobStatus::Failed.as_str(),
                    fmt_datetime(now),
                    error_code,
                    message,
                    id.to_string(),
                    JobStatus::Running.as_str(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("fail_job: {e}")))?;

        if updated == 0 {
            return Err(self.transition_error(id, JobStatus::Failed).await);
        }
        debug!(job_id = %id, error_code, "Job failed");
        Ok(())
    }
}

// ── Activation history ──────────────────────────────────────────────

#[async_trait]
impl HistoryStore for LibSqlBackend {
    async fn append_activation(&self, record: &ActivationRecord) -> Result<(), DatabaseError> {
        let job_types = serde_json::to_string(&record.by_type)
            .map_err(|e| DatabaseError::Serialization(format!("job_types: {e}")))?;

        self.conn()
            .execute(
                &format!(
                    "INSERT INTO activation_history ({HISTORY_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"
                ),
                params![
                    fmt_datetime(record.timestamp),
                    record.total_jobs as i64,
                    job_types,
                    record.estimated_minutes as i64,
                    record.configured_minutes as i64,
                    fmt_datetime(record.scheduled_stop_at),
                    record.initiator.clone(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("append_activation: {e}")))?;

        debug!(
            total_jobs = record.total_jobs,
            minutes = record.configured_minutes,
            "Activation recorded"
        );
        Ok(())
    }

    async fn list_activations(&self) -> Result<Vec<ActivationRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {HISTORY_COLUMNS} FROM activation_history ORDER BY rowid ASC"),
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_activations: {e}")))?;

        let mut records = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_activation(&row) {
                Ok(r) => records.push(r),
                Err(e) => warn!("Skipping activation row: {e}"),
            }
        }
        Ok(records)
    }

    async fn recent_activations(
        &self,
        limit: usize,
    ) -> Result<Vec<ActivationRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {HISTORY_COLUMNS} FROM activation_history ORDER BY rowid DESC LIMIT ?1"
                ),
                params![limit as i64],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("recent_activations: {e}")))?;

        let mut records = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_activation(&row) {
                Ok(r) => records.push(r),
                Err(e) => warn!("Skipping activation row: {e}"),
            }
        }
        Ok(records)
    }
}
