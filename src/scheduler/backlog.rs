//! Backlog analysis: what is waiting in the queue right now.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::jobs::{Job, JobStatus, JobType};
use crate::store::JobStore;

/// Shape of the pending backlog at one instant. Recomputed every tick.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BacklogSnapshot {
    pub total: usize,
    pub by_type: BTreeMap<JobType, usize>,
    pub jobs: Vec<Job>,
    /// Jobs whose payload cell was not valid JSON. Still counted above.
    pub malformed_payloads: usize,
}

impl BacklogSnapshot {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Group pending jobs by type. Non-pending jobs are ignored.
    pub fn from_jobs(jobs: Vec<Job>) -> Self {
        let jobs: Vec<Job> = jobs
            .into_iter()
            .filter(|j| j.status == JobStatus::Pending)
            .collect();

        let mut by_type = BTreeMap::new();
        let mut malformed_payloads = 0;
        for job in &jobs {
            *by_type.entry(job.job_type.clone()).or_insert(0) += 1;
            if job.payload_malformed() {
                malformed_payloads += 1;
            }
        }

        Self {
            total: jobs.len(),
            by_type,
            jobs,
            malformed_payloads,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.total == 0
    }
}

/// Reads the pending backlog from the job store.
pub struct BacklogAnalyzer {
    store: Arc<dyn JobStore>,
}

impl BacklogAnalyzer {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self { store }
    }

    /// Snapshot of all pending jobs.
    ///
    /// An unreachable store reads as an empty backlog: the scheduler then
    /// does nothing this tick and tries again on the next one.
    pub async fn analyze_pending(&self) -> BacklogSnapshot {
        let jobs = match self.store.list_pending().await {
            Ok(jobs) => jobs,
            Err(e) => {
                warn!("Job store unavailable, treating backlog as empty: {e}");
                return BacklogSnapshot::empty();
            }
        };

        let snapshot = BacklogSnapshot::from_jobs(jobs);
        if snapshot.malformed_payloads > 0 {
            let ids: Vec<String> = snapshot
                .jobs
                .iter()
                .filter(|j| j.payload_malformed())
                .map(|j| j.id.to_string())
                .collect();
            warn!(
                count = snapshot.malformed_payloads,
                jobs = %ids.join(","),
                "Pending jobs with unparseable payloads (treated as empty objects)"
            );
        }
        debug!(
            total = snapshot.total,
            types = snapshot.by_type.len(),
            "Backlog analyzed"
        );
        snapshot
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DatabaseError;
    use crate::store::LibSqlBackend;
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use serde_json::json;
    use uuid::Uuid;

    /// A store whose every call fails.
    struct DownStore;

    #[async_trait]
    impl JobStore for DownStore {
        async fn enqueue(
            &self,
            _job_type: &JobType,
            _body: serde_json::Value,
            _user_email: Option<&str>,
        ) -> Result<Uuid, DatabaseError> {
            Err(DatabaseError::Pool("offline".into()))
        }
        async fn get_job(&self, _id: Uuid) -> Result<Option<Job>, DatabaseError> {
            Err(DatabaseError::Pool("offline".into()))
        }
        async fn list_pending(&self) -> Result<Vec<Job>, DatabaseError> {
            Err(DatabaseError::Query("no such table: job_queue".into()))
        }
        async fn count_by_status(&self) -> Result<BTreeMap<JobStatus, u64>, DatabaseError> {
            Err(DatabaseError::Pool("offline".into()))
        }
        async fn claim_next(&self, _now: DateTime<Utc>) -> Result<Option<Job>, DatabaseError> {
            Err(DatabaseError::Pool("offline".into()))
        }
        async fn complete_job(
            &self,
            _id: Uuid,
            _result: &serde_json::Value,
            _now: DateTime<Utc>,
        ) -> Result<(), DatabaseError> {
            Err(DatabaseError::Pool("offline".into()))
        }
        async fn fail_job(
            &self,
            _id: Uuid,
            _code: &str,
            _message: &str,
            _now: DateTime<Utc>,
        ) -> Result<(), DatabaseError> {
            Err(DatabaseError::Pool("offline".into()))
        }
    }

    async fn store() -> Arc<LibSqlBackend> {
        Arc::new(LibSqlBackend::new_memory().await.unwrap())
    }

    #[tokio::test]
    async fn empty_queue_is_empty_snapshot() {
        let analyzer = BacklogAnalyzer::new(store().await);
        let snapshot = analyzer.analyze_pending().await;
        assert_eq!(snapshot.total, 0);
        assert!(snapshot.by_type.is_empty());
        assert!(snapshot.is_empty());
    }

    #[tokio::test]
    async fn unavailable_store_is_empty_snapshot() {
        let analyzer = BacklogAnalyzer::new(Arc::new(DownStore));
        let snapshot = analyzer.analyze_pending().await;
        assert_eq!(snapshot, BacklogSnapshot::empty());
    }

    #[tokio::test]
    async fn groups_by_type_including_unknown() {
        let db = store().await;
        db.enqueue(&JobType::ExportCsv, json!({}), None).await.unwrap();
        db.enqueue(&JobType::ExportCsv, json!({}), None).await.unwrap();
        db.enqueue(&JobType::Other("RESIZE_IMAGES".into()), json!({}), None)
            .await
            .unwrap();

        let snapshot = BacklogAnalyzer::new(db).analyze_pending().await;
        assert_eq!(snapshot.total, 3);
        assert_eq!(snapshot.by_type[&JobType::ExportCsv], 2);
        assert_eq!(snapshot.by_type[&JobType::Other("RESIZE_IMAGES".into())], 1);
        assert_eq!(snapshot.jobs.len(), 3);
    }

    #[tokio::test]
    async fn claimed_jobs_are_not_backlog() {
        let db = store().await;
        db.enqueue(&JobType::ExportCsv, json!({}), None).await.unwrap();
        db.enqueue(&JobType::GenerateReport, json!({}), None).await.unwrap();
        db.claim_next(Utc::now()).await.unwrap();

        let snapshot = BacklogAnalyzer::new(db).analyze_pending().await;
        assert_eq!(snapshot.total, 1);
        assert_eq!(snapshot.by_type.get(&JobType::ExportCsv), None);
    }

    #[tokio::test]
    async fn analysis_is_idempotent() {
        let db = store().await;
        db.enqueue(&JobType::BatchCleanup, json!({"days": 30}), None)
            .await
            .unwrap();
        db.enqueue(&JobType::CalculateStats, json!({}), None).await.unwrap();

        let analyzer = BacklogAnalyzer::new(db);
        let first = analyzer.analyze_pending().await;
        let second = analyzer.analyze_pending().await;
        assert_eq!(first, second);
    }

    #[test]
    fn malformed_payload_is_counted_and_empty() {
        let mut job = Job::new(JobType::GenerateReport, json!({}), None);
        let decoded = crate::jobs::PayloadEnvelope::decode("{not json", &job.job_type);
        job.payload = decoded.envelope;
        job.payload_decoding = decoded.decoding;

        let snapshot = BacklogSnapshot::from_jobs(vec![job]);
        assert_eq!(snapshot.total, 1);
        assert_eq!(snapshot.by_type[&JobType::GenerateReport], 1);
        assert_eq!(snapshot.malformed_payloads, 1);
        assert_eq!(snapshot.jobs[0].payload.body, json!({}));
    }

    #[test]
    fn from_jobs_ignores_non_pending() {
        let mut running = Job::new(JobType::ExportCsv, json!({}), None);
        running.status = JobStatus::Running;
        let pending = Job::new(JobType::ExportCsv, json!({}), None);

        let snapshot = BacklogSnapshot::from_jobs(vec![running, pending]);
        assert_eq!(snapshot.total, 1);
    }
}
