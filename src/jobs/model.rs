//! Core job types.
//!
//! A job is a unit of deferred work. Callers enqueue it in `PENDING`; only the
//! external worker moves it forward through `RUNNING` to a terminal state.

use std::convert::Infallible;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::payload::{PayloadDecoding, PayloadEnvelope};

/// Kind of work a job represents.
///
/// Known types are enum arms so the duration table can match on them
/// exhaustively. Anything else is kept verbatim in `Other`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum JobType {
    ExportCsv,
    BatchCleanup,
    GenerateReport,
    CalculateStats,
    Other(String),
}

impl JobType {
    /// The name stored in the `job_name` column.
    pub fn as_str(&self) -> &str {
        match self {
            JobType::ExportCsv => "EXPORT_CSV",
            JobType::BatchCleanup => "BATCH_CLEANUP",
            JobType::GenerateReport => "GENERATE_REPORT",
            JobType::CalculateStats => "CALCULATE_STATS",
            JobType::Other(name) => name,
        }
    }

    /// Whether this type has a dedicated arm.
    pub fn is_known(&self) -> bool {
        !matches!(self, JobType::Other(_))
    }
}

impl std::fmt::Display for JobType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobType {
    type Err = Infallible;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.trim() {
            "EXPORT_CSV" => JobType::ExportCsv,
            "BATCH_CLEANUP" => JobType::BatchCleanup,
            "GENERATE_REPORT" => JobType::GenerateReport,
            "CALCULATE_STATS" => JobType::CalculateStats,
            _ => JobType::Other(s.to_string()),
        })
    }
}

impl From<String> for JobType {
    fn from(s: String) -> Self {
        match s.parse() {
            Ok(t) => t,
            Err(never) => match never {},
        }
    }
}

impl From<&str> for JobType {
    fn from(s: &str) -> Self {
        JobType::from(s.to_string())
    }
}

impl From<JobType> for String {
    fn from(t: JobType) -> Self {
        t.as_str().to_string()
    }
}

/// Lifecycle state of a job. Only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub const ALL: [JobStatus; 4] = [
        JobStatus::Pending,
        JobStatus::Running,
        JobStatus::Completed,
        JobStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Running => "RUNNING",
            JobStatus::Completed => "COMPLETED",
            JobStatus::Failed => "FAILED",
        }
    }

    /// Whether `self → next` is a legal forward transition.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Pending, JobStatus::Running)
                | (JobStatus::Running, JobStatus::Completed)
                | (JobStatus::Running, JobStatus::Failed)
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "PENDING" => Ok(JobStatus::Pending),
            "RUNNING" => Ok(JobStatus::Running),
            "COMPLETED" => Ok(JobStatus::Completed),
            "FAILED" => Ok(JobStatus::Failed),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

/// A unit of deferred work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub job_type: JobType,
    pub status: JobStatus,
    pub payload: PayloadEnvelope,
    /// How the stored payload cell was decoded.
    pub payload_decoding: PayloadDecoding,
    pub enqueued_at: DateTime<Utc>,
    pub user_email: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result: Option<String>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
}

impl Job {
    /// Build a fresh `PENDING` job.
    pub fn new(job_type: JobType, body: serde_json::Value, user_email: Option<String>) -> Self {
        let payload = PayloadEnvelope::new(&job_type, body);
        Self {
            id: Uuid::new_v4(),
            job_type,
            status: JobStatus::Pending,
            payload,
            payload_decoding: PayloadDecoding::Envelope,
            enqueued_at: Utc::now(),
            user_email,
            claimed_at: None,
            completed_at: None,
            result: None,
            error_code: None,
            error_message: None,
        }
    }

    pub fn payload_malformed(&self) -> bool {
        self.payload_decoding == PayloadDecoding::Malformed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_type_known_names() {
        for (name, expected) in [
            ("EXPORT_CSV", JobType::ExportCsv),
            ("BATCH_CLEANUP", JobType::BatchCleanup),
            ("GENERATE_REPORT", JobType::GenerateReport),
            ("CALCULATE_STATS", JobType::CalculateStats),
        ] {
            let parsed: JobType = name.into();
            assert_eq!(parsed, expected);
            assert_eq!(parsed.to_string(), name);
            assert!(parsed.is_known());
        }
    }

    #[test]
    fn job_type_unknown_kept_literally() {
        let t = JobType::from("RESIZE_IMAGES");
        assert_eq!(t, JobType::Other("RESIZE_IMAGES".into()));
        assert_eq!(t.as_str(), "RESIZE_IMAGES");
        assert!(!t.is_known());
    }

    #[test]
    fn job_type_padding_only_trimmed_for_known_names() {
        assert_eq!(JobType::from(" EXPORT_CSV\n"), JobType::ExportCsv);
        let t = JobType::from(" RESIZE ");
        assert_eq!(t, JobType::Other(" RESIZE ".into()));
        assert_eq!(t.as_str(), " RESIZE ");
    }

    #[test]
    fn job_type_serializes_as_name() {
        let json = serde_json::to_string(&JobType::GenerateReport).unwrap();
        assert_eq!(json, "\"GENERATE_REPORT\"");
        let back: JobType = serde_json::from_str("\"SOMETHING_ELSE\"").unwrap();
        assert_eq!(back, JobType::Other("SOMETHING_ELSE".into()));
    }

    #[test]
    fn status_display_parse() {
        for status in JobStatus::ALL {
            let parsed: JobStatus = status.to_string().parse().unwrap();
            assert_eq!(parsed, status);
        }
        assert!("CLAIMED".parse::<JobStatus>().is_err());
    }

    #[test]
    fn status_only_moves_forward() {
        assert!(JobStatus::Pending.can_transition_to(JobStatus::Running));
        assert!(JobStatus::Running.can_transition_to(JobStatus::Completed));
        assert!(JobStatus::Running.can_transition_to(JobStatus::Failed));
        assert!(!JobStatus::Pending.can_transition_to(JobStatus::Completed));
        assert!(!JobStatus::Completed.can_transition_to(JobStatus::Running));
        assert!(!JobStatus::Failed.can_transition_to(JobStatus::Pending));
        assert!(!JobStatus::Running.can_transition_to(JobStatus::Pending));
    }

    #[test]
    fn new_job_is_pending() {
        let job = Job::new(
            JobType::ExportCsv,
            serde_json::json!({"sheetName": "Sales"}),
            Some("ana@example.com".into()),
        );
        assert_eq!(job.status, JobStatus::Pending);
        assert!(job.claimed_at.is_none());
        assert_eq!(job.payload.schema, "EXPORT_CSV");
        assert!(!job.payload_malformed());
    }
}
