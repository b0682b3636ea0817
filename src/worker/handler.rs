//! Job handlers and the registry that maps job types to them.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Value, json};

use crate::error::JobError;
use crate::jobs::{Job, JobType};

/// Executes one kind of job. The returned value is stored as the job result.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &Job) -> Result<Value, JobError>;
}

/// Handlers keyed by job type. A type without a handler fails with
/// `UnknownJobType`.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<JobType, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with a handler for each of the four known job types.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register(JobType::ExportCsv, Arc::new(ExportCsvHandler));
        registry.register(JobType::BatchCleanup, Arc::new(BatchCleanupHandler));
        registry.register(JobType::GenerateReport, Arc::new(GenerateReportHandler));
        registry.register(JobType::CalculateStats, Arc::new(CalculateStatsHandler));
        registry
    }

    /// Register (or replace) the handler for `job_type`.
    pub fn register(&mut self, job_type: JobType, handler: Arc<dyn JobHandler>) {
        self.handlers.insert(job_type, handler);
    }

    pub fn get(&self, job_type: &JobType) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(job_type).cloned()
    }

    pub fn job_types(&self) -> Vec<JobType> {
        let mut types: Vec<JobType> = self.handlers.keys().cloned().collect();
        types.sort();
        types
    }
}

// ── Built-in handlers ───────────────────────────────────────────────

/// `EXPORT_CSV`: requires `sheetName`.
pub struct ExportCsvHandler;

#[async_trait]
impl JobHandler for ExportCsvHandler {
    async fn handle(&self, job: &Job) -> Result<Value, JobError> {
        let sheet = job
            .payload
            .str_field("sheetName")
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| JobError::InvalidPayload {
                job_type: job.job_type.to_string(),
                reason: "sheetName is required".into(),
            })?;
        Ok(json!({
            "message": "CSV export generated",
            "sheet": sheet,
        }))
    }
}

/// `BATCH_CLEANUP`: `days` (default 30) sets the cutoff.
pub struct BatchCleanupHandler;

#[async_trait]
impl JobHandler for BatchCleanupHandler {
    async fn handle(&self, job: &Job) -> Result<Value, JobError> {
        let days = match job.payload.body.get("days") {
            None | Some(Value::Null) => 30,
            Some(v) => v.as_i64().filter(|d| *d >= 0).ok_or_else(|| {
                JobError::InvalidPayload {
                    job_type: job.job_type.to_string(),
                    reason: format!("days must be a non-negative integer, got {v}"),
                }
            })?,
        };
        let cutoff = chrono::TimeDelta::try_days(days)
            .and_then(|age| Utc::now().checked_sub_signed(age))
            .ok_or_else(|| JobError::InvalidPayload {
                job_type: job.job_type.to_string(),
                reason: format!("days is out of range: {days}"),
            })?;
        Ok(json!({
            "message": format!("Cleanup finished (older than {days} days)"),
            "cutoff_date": cutoff.to_rfc3339(),
        }))
    }
}

/// `CALCULATE_STATS`
pub struct CalculateStatsHandler;

#[async_trait]
impl JobHandler for CalculateStatsHandler {
    async fn handle(&self, job: &Job) -> Result<Value, JobError> {
        Ok(json!({
            "message": "Statistics calculated",
            "sheet": job.payload.str_field("sheetName"),
        }))
    }
}

/// `GENERATE_REPORT`
pub struct GenerateReportHandler;

#[async_trait]
impl JobHandler for GenerateReportHandler {
    async fn handle(&self, _job: &Job) -> Result<Value, JobError> {
        Ok(json!({
            "message": "Report generated",
            "format": "PDF",
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(job_type: JobType, body: Value) -> Job {
        Job::new(job_type, body, None)
    }

    #[test]
    fn builtin_covers_known_types() {
        let registry = HandlerRegistry::with_builtin();
        assert_eq!(
            registry.job_types(),
            vec![
                JobType::ExportCsv,
                JobType::BatchCleanup,
                JobType::GenerateReport,
                JobType::CalculateStats,
            ]
        );
        assert!(registry.get(&JobType::Other("NOPE".into())).is_none());
    }

    #[tokio::test]
    async fn export_csv_requires_sheet_name() {
        let err = ExportCsvHandler
            .handle(&job(JobType::ExportCsv, json!({})))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "InvalidPayload");

        let ok = ExportCsvHandler
            .handle(&job(JobType::ExportCsv, json!({"sheetName": "Sales"})))
            .await
            .unwrap();
        assert_eq!(ok["sheet"], "Sales");
    }

    #[tokio::test]
    async fn batch_cleanup_defaults_to_thirty_days() {
        let result = BatchCleanupHandler
            .handle(&job(JobType::BatchCleanup, json!({})))
            .await
            .unwrap();
        assert!(result["message"].as_str().unwrap().contains("30 days"));

        let err = BatchCleanupHandler
            .handle(&job(JobType::BatchCleanup, json!({"days": "lots"})))
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::InvalidPayload { .. }));
    }

    #[tokio::test]
    async fn batch_cleanup_rejects_huge_day_counts() {
        for days in [1_000_000_000_000_000_i64, 200_000_000] {
            let err = BatchCleanupHandler
                .handle(&job(JobType::BatchCleanup, json!({"days": days})))
                .await
                .unwrap_err();
            assert!(matches!(err, JobError::InvalidPayload { .. }), "{days}: {err}");
        }

        let ok = BatchCleanupHandler
            .handle(&job(JobType::BatchCleanup, json!({"days": 3650})))
            .await
            .unwrap();
        assert!(ok["cutoff_date"].is_string());
    }

    #[tokio::test]
    async fn report_is_pdf() {
        let result = GenerateReportHandler
            .handle(&job(JobType::GenerateReport, json!({})))
            .await
            .unwrap();
        assert_eq!(result["format"], "PDF");
    }
}
