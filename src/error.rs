//! Error types for the job autoscaler.

use std::time::Duration;

use uuid::Uuid;

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),
}

/// Database-related errors. Any of these means the store is unavailable
/// for the operation that produced it.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Job {id} is {state}, cannot transition to {target}")]
    InvalidTransition {
        id: Uuid,
        state: String,
        target: String,
    },

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Errors returned by the worker control client.
///
/// Everything except `Rejected` is a transient network failure: the next
/// scheduler tick retries naturally.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ControlError {
    #[error("{operation} timed out after {timeout:?}")]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },

    #[error("{operation} request failed: {reason}")]
    Request {
        operation: &'static str,
        reason: String,
    },

    #[error("{operation} returned HTTP {status}: {body}")]
    HttpStatus {
        operation: &'static str,
        status: u16,
        body: String,
    },

    #[error("Invalid {operation} response: {reason}")]
    InvalidResponse {
        operation: &'static str,
        reason: String,
    },

    #[error("Worker rejected {operation}: {message}")]
    Rejected {
        operation: &'static str,
        message: String,
    },
}

impl ControlError {
    /// Whether this failure came from the network rather than from the worker.
    pub fn is_transient(&self) -> bool {
        !matches!(self, ControlError::Rejected { .. })
    }
}

/// Job handler errors, raised on the worker side.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("No handler registered for job type {job_type}")]
    UnknownJobType { job_type: String },

    #[error("Invalid payload for {job_type}: {reason}")]
    InvalidPayload { job_type: String, reason: String },

    #[error("Job {id} failed: {reason}")]
    Failed { id: Uuid, reason: String },
}

impl JobError {
    /// Short machine-readable code written to the `error_code` column.
    pub fn code(&self) -> &'static str {
        match self {
            JobError::UnknownJobType { .. } => "UnknownJobType",
            JobError::InvalidPayload { .. } => "InvalidPayload",
            JobError::Failed { .. } => "JobFailed",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_required_carries_hint() {
        let err = ConfigError::MissingRequired {
            key: "WORKER_CONTROL_URL".into(),
            hint: "Set it to the worker's public base URL.".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("WORKER_CONTROL_URL"));
        assert!(msg.contains("public base URL"));
    }

    #[test]
    fn only_rejections_are_not_transient() {
        let rejected = ControlError::Rejected {
            operation: "activate",
            message: "not configured".into(),
        };
        let timeout = ControlError::Timeout {
            operation: "status",
            timeout: Duration::from_secs(30),
        };
        assert!(!rejected.is_transient());
        assert!(timeout.is_transient());
    }

    #[test]
    fn job_error_codes() {
        let err = JobError::UnknownJobType {
            job_type: "FOO".into(),
        };
        assert_eq!(err.code(), "UnknownJobType");
    }
}
