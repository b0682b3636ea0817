//! Storage traits for the job queue and the activation history.
//!
//! The scheduler core only calls the read side of `JobStore` plus `enqueue`.
//! The claim/finish operations belong to the worker host.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::jobs::{Job, JobStatus, JobType};
use crate::scheduler::history::ActivationRecord;

/// Durable append/read/update access to job records.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Append a new `PENDING` job. Returns its id only once the write is confirmed.
    async fn enqueue(
        &self,
        job_type: &JobType,
        body: serde_json::Value,
        user_email: Option<&str>,
    ) -> Result<Uuid, DatabaseError>;

    /// Get a job by ID.
    async fn get_job(&self, id: Uuid) -> Result<Option<Job>, DatabaseError>;

    /// All `PENDING` jobs, oldest first. Best-effort; no locking.
    async fn list_pending(&self) -> Result<Vec<Job>, DatabaseError>;

    /// Job counts keyed by status. Every status is present.
    async fn count_by_status(&self) -> Result<BTreeMap<JobStatus, u64>, DatabaseError>;

    // ── Worker side ─────────────────────────────────────────────────

    /// Move the oldest `PENDING` job to `RUNNING` and return it.
    async fn claim_next(&self, now: DateTime<Utc>) -> Result<Option<Job>, DatabaseError>;

    /// Mark a `RUNNING` job `COMPLETED` with its result.
    async fn complete_job(
        &self,
        id: Uuid,
        result: &serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<(), DatabaseError>;

    /// Mark a `RUNNING` job `FAILED`.
    async fn fail_job(
        &self,
        id: Uuid,
        error_code: &str,
        error_message: &str,
        now: DateTime<Utc>,
    ) -> Result<(), DatabaseError>;
}

/// Append-only storage for activation decisions.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Append one record. Never overwrites.
    async fn append_activation(&self, record: &ActivationRecord) -> Result<(), DatabaseError>;

    /// All records, oldest first.
    async fn list_activations(&self) -> Result<Vec<ActivationRecord>, DatabaseError>;

    /// The newest `limit` records, newest first.
    async fn recent_activations(&self, limit: usize)
    -> Result<Vec<ActivationRecord>, DatabaseError>;
}
