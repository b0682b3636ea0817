//! Remote worker control.
//!
//! The scheduler talks to the worker only through the `WorkerControl` trait.
//! `WebhookControlClient` is the HTTP implementation; tests substitute stubs.

pub mod client;
pub mod protocol;

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::Serialize;

use crate::error::ControlError;

pub use client::WebhookControlClient;

/// The worker accepted an activation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActivationAck {
    pub message: Option<String>,
    pub details: Option<serde_json::Value>,
    /// The worker was already processing; no new run was started.
    pub already_running: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeactivationAck {
    pub message: Option<String>,
}

/// Snapshot reported by the worker's `/status` endpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct WorkerStatus {
    pub running: bool,
    pub job_stats: BTreeMap<String, u64>,
    pub spreadsheet_name: Option<String>,
}

/// Whether the worker is processing. `Unknown` when status could not be read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerLiveness {
    Running,
    Stopped,
    Unknown,
}

impl WorkerLiveness {
    /// A failed status call is `Unknown`, never "not running".
    pub fn from_status(status: &Result<WorkerStatus, ControlError>) -> Self {
        match status {
            Ok(s) if s.running => WorkerLiveness::Running,
            Ok(_) => WorkerLiveness::Stopped,
            Err(_) => WorkerLiveness::Unknown,
        }
    }
}

impl std::fmt::Display for WorkerLiveness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            WorkerLiveness::Running => "running",
            WorkerLiveness::Stopped => "stopped",
            WorkerLiveness::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Ok,
    Offline,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    pub state: HealthState,
    pub running: Option<bool>,
    pub error: Option<String>,
}

impl HealthReport {
    pub fn offline(error: impl Into<String>) -> Self {
        Self {
            state: HealthState::Offline,
            running: None,
            error: Some(error.into()),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.state == HealthState::Ok
    }
}

/// Remote control surface of the worker.
#[async_trait]
pub trait WorkerControl: Send + Sync {
    /// Start processing with the given poll interval and auto-stop.
    async fn activate(
        &self,
        interval_secs: u64,
        auto_stop_minutes: u32,
        max_iterations: Option<u64>,
    ) -> Result<ActivationAck, ControlError>;

    async fn deactivate(&self) -> Result<DeactivationAck, ControlError>;

    async fn status(&self) -> Result<WorkerStatus, ControlError>;

    /// Never fails; an unreachable worker is `HealthState::Offline`.
    async fn health(&self) -> HealthReport;
}
