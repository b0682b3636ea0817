//! HTTP client for the worker control webhook.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue};
use secrecy::ExposeSecret;
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

use super::protocol::{
    ActivateRequest, ActivateResponse, DeactivateResponse, HealthResponse, StatusResponse,
};
use super::{
    ActivationAck, DeactivationAck, HealthReport, HealthState, WorkerControl, WorkerStatus,
};
use crate::config::WorkerControlConfig;
use crate::error::{ConfigError, ControlError};

/// Longest error body kept in `ControlError::HttpStatus`.
const MAX_ERROR_BODY: usize = 200;

/// Talks to the worker's `/activate`, `/deactivate`, `/status` and `/health`.
pub struct WebhookControlClient {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl WebhookControlClient {
    /// Build a client. A missing base URL is a configuration error, never a
    /// silent no-op.
    pub fn new(config: &WorkerControlConfig) -> Result<Self, ConfigError> {
        let base_url = config.require_base_url()?;

        let mut headers = HeaderMap::new();
        if let Some(token) = &config.token {
            let mut value = HeaderValue::from_str(&format!("Bearer {}", token.expose_secret()))
                .map_err(|e| ConfigError::InvalidValue {
                    key: "WORKER_CONTROL_TOKEN".into(),
                    message: e.to_string(),
                })?;
            value.set_sensitive(true);
            headers.insert(AUTHORIZATION, value);
        }

        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .default_headers(headers)
            .build()
            .map_err(|e| ConfigError::ParseError(format!("HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url,
            timeout: config.timeout,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    /// Send a request and decode a 2xx JSON body.
    async fn send<T: DeserializeOwned>(
        &self,
        operation: &'static str,
        request: reqwest::RequestBuilder,
    ) -> Result<T, ControlError> {
        let resp = request
            .send()
            .await
            .map_err(|e| self.transport_error(operation, e))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ControlError::HttpStatus {
                operation,
                status: status.as_u16(),
                body: truncate(&body, MAX_ERROR_BODY),
            });
        }

        resp.json::<T>().await.map_err(|e| {
            if e.is_timeout() {
                self.transport_error(operation, e)
            } else {
                ControlError::InvalidResponse {
                    operation,
                    reason: e.to_string(),
                }
            }
        })
    }

    fn transport_error(&self, operation: &'static str, e: reqwest::Error) -> ControlError {
        if e.is_timeout() {
            ControlError::Timeout {
                operation,
                timeout: self.timeout,
            }
        } else {
            ControlError::Request {
                operation,
                reason: e.to_string(),
            }
        }
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max).collect();
        format!("{cut}...")
    }
}

fn rejection(operation: &'static str, error: Option<String>, message: Option<String>) -> ControlError {
    ControlError::Rejected {
        operation,
        message: error
            .or(message)
            .unwrap_or_else(|| "worker reported failure".to_string()),
    }
}

#[async_trait]
impl WorkerControl for WebhookControlClient {
    async fn activate(
        &self,
        interval_secs: u64,
        auto_stop_minutes: u32,
        max_iterations: Option<u64>,
    ) -> Result<ActivationAck, ControlError> {
        let body = ActivateRequest {
            interval: interval_secs,
            auto_stop_minutes: Some(auto_stop_minutes),
            max_iterations,
        };
        debug!(interval_secs, auto_stop_minutes, "Sending activate");

        let resp: ActivateResponse = self
            .send("activate", self.client.post(self.url("activate")).json(&body))
            .await?;
        if !resp.success {
            return Err(rejection("activate", resp.error, resp.message));
        }

        let already_running = resp
            .details
            .as_ref()
            .and_then(|d| d.get("already_running"))
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false);

        info!(
            auto_stop_minutes,
            already_running, "Worker acknowledged activation"
        );
        Ok(ActivationAck {
            message: resp.message,
            details: resp.details,
            already_running,
        })
    }

    async fn deactivate(&self) -> Result<DeactivationAck, ControlError> {
        let resp: DeactivateResponse = self
            .send(
                "deactivate",
                self.client
                    .post(self.url("deactivate"))
                    .json(&serde_json::json!({})),
            )
            .await?;
        if !resp.success {
            return Err(rejection("deactivate", resp.error, resp.message));
        }
        info!("Worker acknowledged deactivation");
        Ok(DeactivationAck {
            message: resp.message,
        })
    }

    async fn status(&self) -> Result<WorkerStatus, ControlError> {
        let resp: StatusResponse = self
            .send("status", self.client.get(self.url("status")))
            .await?;
        if !resp.success {
            return Err(rejection("status", resp.error, None));
        }
        Ok(WorkerStatus {
            running: resp.processor_running,
            job_stats: resp.job_stats,
            spreadsheet_name: resp.spreadsheet_name,
        })
    }

    async fn health(&self) -> HealthReport {
        let resp: HealthResponse = match self
            .send("health", self.client.get(self.url("health")))
            .await
        {
            Ok(resp) => resp,
            Err(e) => {
                warn!("Worker health check failed: {e}");
                return HealthReport::offline(e.to_string());
            }
        };

        match resp.status.to_ascii_lowercase().as_str() {
            "ok" | "online" => HealthReport {
                state: HealthState::Ok,
                running: resp.processor_running,
                error: None,
            },
            other => HealthReport {
                state: HealthState::Offline,
                running: resp.processor_running,
                error: Some(format!("worker reported status '{other}'")),
            },
        }
    }
}
