//! Wire types of the worker control protocol (HTTP/JSON).
//!
//! Shared by the client and the worker host routes so both sides agree on
//! field names and defaults.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Poll interval used when the request omits one.
pub const DEFAULT_INTERVAL_SECS: u64 = 5;

/// Auto-stop used when the request omits one. An explicit `null` disables it.
pub const DEFAULT_AUTO_STOP_MINUTES: u32 = 30;

fn default_interval() -> u64 {
    DEFAULT_INTERVAL_SECS
}

fn default_auto_stop() -> Option<u32> {
    Some(DEFAULT_AUTO_STOP_MINUTES)
}

/// `POST /activate` body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivateRequest {
    #[serde(default = "default_interval")]
    pub interval: u64,
    #[serde(default = "default_auto_stop")]
    pub auto_stop_minutes: Option<u32>,
    #[serde(default)]
    pub max_iterations: Option<u64>,
}

impl Default for ActivateRequest {
    fn default() -> Self {
        Self {
            interval: DEFAULT_INTERVAL_SECS,
            auto_stop_minutes: default_auto_stop(),
            max_iterations: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActivateResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_stop_minutes: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeactivateResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// `GET /status` body.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusResponse {
    pub success: bool,
    #[serde(default)]
    pub processor_running: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spreadsheet_name: Option<String>,
    /// Counts keyed by status name (`PENDING`, `RUNNING`, ...).
    #[serde(default)]
    pub job_stats: BTreeMap<String, u64>,
    /// Informational only. Workers send ISO-8601 with or without an offset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// `GET /health` body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    #[serde(default)]
    pub processor_running: Option<bool>,
    #[serde(default)]
    pub timestamp: Option<String>,
}
