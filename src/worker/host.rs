//! The worker process: remote side of the control protocol.
//!
//! `activate` starts one processor loop in a background task. The loop claims
//! jobs from the store, runs their handlers and records the outcome until it
//! is deactivated or hits one of its stop conditions.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::handler::HandlerRegistry;
use crate::config::WorkerHostConfig;
use crate::control::protocol::{
    ActivateRequest, ActivateResponse, DeactivateResponse, HealthResponse, StatusResponse,
};
use crate::error::JobError;
use crate::jobs::Job;
use crate::store::JobStore;

/// Why a processor run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Deactivated,
    MaxIterations,
    AutoStop,
    Idle,
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StopReason::Deactivated => "deactivated",
            StopReason::MaxIterations => "iteration limit reached",
            StopReason::AutoStop => "auto-stop deadline reached",
            StopReason::Idle => "no jobs for too long",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub iterations: u64,
    pub completed: u64,
    pub failed: u64,
    pub reason: StopReason,
}

/// One background processor run.
struct ActiveRun {
    stop: Arc<AtomicBool>,
    wake: Arc<Notify>,
    join: JoinHandle<RunSummary>,
    started_at: DateTime<Utc>,
    auto_stop_at: Option<DateTime<Utc>>,
}

impl ActiveRun {
    fn is_running(&self) -> bool {
        !self.join.is_finished() && !self.stop.load(Ordering::SeqCst)
    }
}

/// Everything the processor loop needs, moved into its task.
struct RunContext {
    store: Arc<dyn JobStore>,
    handlers: Arc<HandlerRegistry>,
    stop: Arc<AtomicBool>,
    wake: Arc<Notify>,
    interval: Duration,
    max_iterations: Option<u64>,
    deadline: Option<Instant>,
    idle_limit: u32,
}

pub struct WorkerHost {
    config: WorkerHostConfig,
    store: Arc<dyn JobStore>,
    handlers: Arc<HandlerRegistry>,
    run: Mutex<Option<ActiveRun>>,
}

impl WorkerHost {
    pub fn new(
        config: WorkerHostConfig,
        store: Arc<dyn JobStore>,
        handlers: HandlerRegistry,
    ) -> Self {
        Self {
            config,
            store,
            handlers: Arc::new(handlers),
            run: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &WorkerHostConfig {
        &self.config
    }

    pub async fn is_running(&self) -> bool {
        self.run.lock().await.as_ref().is_some_and(ActiveRun::is_running)
    }

    /// Start processing. A second activation while running starts nothing
    /// and leaves the existing deadline alone.
    pub async fn activate(&self, req: ActivateRequest) -> ActivateResponse {
        if req.interval == 0 {
            return ActivateResponse {
                success: false,
                error: Some("interval must be at least 1 second".into()),
                ..Default::default()
            };
        }

        let mut run = self.run.lock().await;
        if let Some(active) = run.as_ref()
            && active.is_running()
        {
            info!("Activation requested while already running");
            return ActivateResponse {
                success: true,
                message: Some("Processor already running".into()),
                details: Some(json!({
                    "already_running": true,
                    "started_at": active.started_at,
                    "auto_stop_at": active.auto_stop_at,
                })),
                auto_stop_minutes: None,
                error: None,
            };
        }

        let started_at = Utc::now();
        let auto_stop = req
            .auto_stop_minutes
            .filter(|m| *m > 0)
            .map(|m| Duration::from_secs(m as u64 * 60));
        let auto_stop_at = auto_stop
            .and_then(|d| chrono::Duration::from_std(d).ok())
            .map(|d| started_at + d);

        let stop = Arc::new(AtomicBool::new(false));
        let wake = Arc::new(Notify::new());
        let ctx = RunContext {
            store: Arc::clone(&self.store),
            handlers: Arc::clone(&self.handlers),
            stop: Arc::clone(&stop),
            wake: Arc::clone(&wake),
            interval: Duration::from_secs(req.interval),
            max_iterations: req.max_iterations,
            deadline: auto_stop.map(|d| Instant::now() + d),
            idle_limit: self.config.idle_limit,
        };

        info!(
            interval = req.interval,
            auto_stop_minutes = ?req.auto_stop_minutes,
            max_iterations = ?req.max_iterations,
            "Processor starting"
        );
        let join = tokio::spawn(run_processor(ctx));

        *run = Some(ActiveRun {
            stop,
            wake,
            join,
            started_at,
            auto_stop_at,
        });

        ActivateResponse {
            success: true,
            message: Some("Processor started".into()),
            details: Some(json!({
                "already_running": false,
                "interval": req.interval,
                "max_iterations": req.max_iterations,
                "started_at": started_at,
                "auto_stop_at": auto_stop_at,
            })),
            auto_stop_minutes: req.auto_stop_minutes,
            error: None,
        }
    }

    /// Signal the loop to stop and wait up to `stop_timeout` for it.
    /// The run lock is released before waiting, so `/status` and `/health`
    /// keep answering while the loop finishes its current job.
    pub async fn deactivate(&self) -> DeactivateResponse {
        let taken = self.run.lock().await.take().filter(ActiveRun::is_running);
        let Some(mut active) = taken else {
            return DeactivateResponse {
                success: false,
                message: Some("Processor not running".into()),
                error: None,
            };
        };

        active.stop.store(true, Ordering::SeqCst);
        active.wake.notify_one();
        info!("Stop signal sent to processor");

        let message = match tokio::time::timeout(self.config.stop_timeout, &mut active.join).await {
            Ok(Ok(summary)) => format!(
                "Processor stopped after {} iterations ({} completed, {} failed)",
                summary.iterations, summary.completed, summary.failed
            ),
            Ok(Err(e)) => {
                error!("Processor task ended abnormally: {e}");
                "Processor stopped".to_string()
            }
            Err(_) => {
                warn!(
                    "Processor did not stop within {:?}; it will exit after its current job",
                    self.config.stop_timeout
                );
                "Stop requested; processor is finishing its current job".to_string()
            }
        };

        DeactivateResponse {
            success: true,
            message: Some(message),
            error: None,
        }
    }

    pub async fn status(&self) -> StatusResponse {
        let processor_running = self.is_running().await;
        match self.store.count_by_status().await {
            Ok(counts) => StatusResponse {
                success: true,
                processor_running,
                spreadsheet_name: Some(self.config.name.clone()),
                job_stats: counts
                    .into_iter()
                    .map(|(status, n)| (status.to_string(), n))
                    .collect::<BTreeMap<_, _>>(),
                timestamp: Some(Utc::now().to_rfc3339()),
                error: None,
            },
            Err(e) => StatusResponse {
                success: false,
                processor_running,
                error: Some(e.to_string()),
                timestamp: Some(Utc::now().to_rfc3339()),
                ..Default::default()
            },
        }
    }

    pub async fn health(&self) -> HealthResponse {
        HealthResponse {
            status: "ok".into(),
            processor_running: Some(self.is_running().await),
            timestamp: Some(Utc::now().to_rfc3339()),
        }
    }
}

async fn run_processor(ctx: RunContext) -> RunSummary {
    let mut iterations = 0u64;
    let mut idle = 0u32;
    let mut completed = 0u64;
    let mut failed = 0u64;

    let reason = loop {
        if ctx.stop.load(Ordering::SeqCst) {
            break StopReason::Deactivated;
        }
        iterations += 1;
        if let Some(max) = ctx.max_iterations
            && iterations > max
        {
            break StopReason::MaxIterations;
        }
        if let Some(deadline) = ctx.deadline
            && Instant::now() >= deadline
        {
            break StopReason::AutoStop;
        }

        match ctx.store.claim_next(Utc::now()).await {
            Ok(Some(job)) => {
                idle = 0;
                if process_job(&ctx, job).await {
                    completed += 1;
                } else {
                    failed += 1;
                }
                continue;
            }
            Ok(None) => {
                idle += 1;
                debug!(iteration = iterations, "No pending jobs");
            }
            Err(e) => {
                idle += 1;
                warn!("Could not claim next job: {e}");
            }
        }

        if ctx.deadline.is_some() && idle >= ctx.idle_limit {
            break StopReason::Idle;
        }

        tokio::select! {
            _ = tokio::time::sleep(ctx.interval) => {}
            _ = ctx.wake.notified() => {}
        }
    };

    // Natural exits also count as stopped for anyone still holding the flag.
    ctx.stop.store(true, Ordering::SeqCst);
    info!(
        iterations,
        completed,
        failed,
        reason = %reason,
        "Processor stopped"
    );
    RunSummary {
        iterations,
        completed,
        failed,
        reason,
    }
}

/// Run one claimed job to a terminal state. Returns whether it completed.
async fn process_job(ctx: &RunContext, job: Job) -> bool {
    let id = job.id;
    info!(job_id = %id, job_type = %job.job_type, "Processing job");

    let outcome: Result<serde_json::Value, (String, String)> =
        match ctx.handlers.get(&job.job_type) {
            None => {
                let err = JobError::UnknownJobType {
                    job_type: job.job_type.to_string(),
                };
                Err((err.code().to_string(), err.to_string()))
            }
            Some(handler) => {
                // Spawned so a panicking handler fails the job instead of the loop.
                let task = tokio::spawn(async move { handler.handle(&job).await });
                match task.await {
                    Ok(Ok(value)) => Ok(value),
                    Ok(Err(e)) => Err((e.code().to_string(), e.to_string())),
                    Err(e) => Err(("HandlerPanicked".to_string(), e.to_string())),
                }
            }
        };

    match outcome {
        Ok(result) => match ctx.store.complete_job(id, &result, Utc::now()).await {
            Ok(()) => {
                info!(job_id = %id, "Job completed");
                true
            }
            Err(e) => {
                error!(job_id = %id, "Could not mark job completed: {e}");
                false
            }
        },
        Err((code, message)) => {
            warn!(job_id = %id, error_code = %code, "Job failed: {message}");
            if let Err(e) = ctx.store.fail_job(id, &code, &message, Utc::now()).await {
                error!(job_id = %id, "Could not mark job failed: {e}");
            }
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::{Value, json};

    use crate::jobs::{JobStatus, JobType};
    use crate::store::LibSqlBackend;
    use crate::worker::handler::JobHandler;

    struct Exploding;

    #[async_trait]
    impl JobHandler for Exploding {
        async fn handle(&self, _job: &Job) -> Result<Value, JobError> {
            panic!("boom");
        }
    }

    struct Refusing;

    #[async_trait]
    impl JobHandler for Refusing {
        async fn handle(&self, job: &Job) -> Result<Value, JobError> {
            Err(JobError::Failed {
                id: job.id,
                reason: "upstream said no".into(),
            })
        }
    }

    async fn host_with(config: WorkerHostConfig, handlers: HandlerRegistry) -> (WorkerHost, Arc<LibSqlBackend>) {
        let db = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        (WorkerHost::new(config, db.clone(), handlers), db)
    }

    async fn host() -> (WorkerHost, Arc<LibSqlBackend>) {
        host_with(WorkerHostConfig::default(), HandlerRegistry::with_builtin()).await
    }

    fn request(max_iterations: Option<u64>) -> ActivateRequest {
        ActivateRequest {
            interval: 1,
            auto_stop_minutes: Some(30),
            max_iterations,
        }
    }

    /// Wait until no job is PENDING or RUNNING.
    async fn drained(db: &LibSqlBackend) -> BTreeMap<JobStatus, u64> {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let counts = db.count_by_status().await.unwrap();
            if counts[&JobStatus::Pending] == 0 && counts[&JobStatus::Running] == 0 {
                return counts;
            }
            assert!(Instant::now() < deadline, "queue never drained: {counts:?}");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    async fn stopped(host: &WorkerHost) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while host.is_running().await {
            assert!(Instant::now() < deadline, "processor never stopped");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    #[tokio::test]
    async fn processes_queue_and_deactivates() {
        let (host, db) = host().await;
        let export = db
            .enqueue(&JobType::ExportCsv, json!({"sheetName": "Sales"}), None)
            .await
            .unwrap();
        db.enqueue(&JobType::GenerateReport, json!({}), None).await.unwrap();

        let resp = host.activate(request(None)).await;
        assert!(resp.success);
        assert_eq!(resp.auto_stop_minutes, Some(30));
        assert!(host.is_running().await);

        let counts = drained(&db).await;
        assert_eq!(counts[&JobStatus::Completed], 2);
        let job = db.get_job(export).await.unwrap().unwrap();
        assert!(job.result.unwrap().contains("Sales"));

        let resp = host.deactivate().await;
        assert!(resp.success);
        assert!(!host.is_running().await);
    }

    #[tokio::test]
    async fn second_activation_reports_already_running() {
        let (host, _db) = host().await;
        assert!(host.activate(request(None)).await.success);

        let resp = host.activate(request(None)).await;
        assert!(resp.success);
        assert_eq!(resp.details.unwrap()["already_running"], true);

        host.deactivate().await;
    }

    #[tokio::test]
    async fn deactivate_when_idle_is_unsuccessful() {
        let (host, _db) = host().await;
        let resp = host.deactivate().await;
        assert!(!resp.success);
        assert_eq!(resp.message.as_deref(), Some("Processor not running"));
    }

    #[tokio::test]
    async fn zero_interval_rejected() {
        let (host, _db) = host().await;
        let resp = host
            .activate(ActivateRequest {
                interval: 0,
                ..Default::default()
            })
            .await;
        assert!(!resp.success);
        assert!(!host.is_running().await);
    }

    #[tokio::test]
    async fn unknown_type_fails_job() {
        let (host, db) = host().await;
        let id = db
            .enqueue(&JobType::Other("MYSTERY".into()), json!({}), None)
            .await
            .unwrap();

        host.activate(request(None)).await;
        drained(&db).await;
        host.deactivate().await;

        let job = db.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error_code.as_deref(), Some("UnknownJobType"));
    }

    #[tokio::test]
    async fn handler_errors_and_panics_fail_the_job() {
        let mut handlers = HandlerRegistry::new();
        handlers.register(JobType::ExportCsv, Arc::new(Refusing));
        handlers.register(JobType::BatchCleanup, Arc::new(Exploding));
        let (host, db) = host_with(WorkerHostConfig::default(), handlers).await;

        let refused = db.enqueue(&JobType::ExportCsv, json!({}), None).await.unwrap();
        let exploded = db.enqueue(&JobType::BatchCleanup, json!({}), None).await.unwrap();

        host.activate(request(None)).await;
        let counts = drained(&db).await;
        assert_eq!(counts[&JobStatus::Failed], 2);
        // The loop survived the panic.
        assert!(host.is_running().await);
        host.deactivate().await;

        let job = db.get_job(refused).await.unwrap().unwrap();
        assert_eq!(job.error_code.as_deref(), Some("JobFailed"));
        let job = db.get_job(exploded).await.unwrap().unwrap();
        assert_eq!(job.error_code.as_deref(), Some("HandlerPanicked"));
    }

    /// Holds its job until the gate opens.
    struct Gated(Arc<Notify>);

    #[async_trait]
    impl JobHandler for Gated {
        async fn handle(&self, _job: &Job) -> Result<Value, JobError> {
            self.0.notified().await;
            Ok(json!({"message": "released"}))
        }
    }

    #[tokio::test]
    async fn status_answers_while_deactivate_waits() {
        let gate = Arc::new(Notify::new());
        let mut handlers = HandlerRegistry::new();
        handlers.register(JobType::GenerateReport, Arc::new(Gated(gate.clone())));
        let (host, db) = host_with(WorkerHostConfig::default(), handlers).await;
        let host = Arc::new(host);
        db.enqueue(&JobType::GenerateReport, json!({}), None).await.unwrap();

        host.activate(request(None)).await;
        let deadline = Instant::now() + Duration::from_secs(5);
        while db.count_by_status().await.unwrap()[&JobStatus::Running] == 0 {
            assert!(Instant::now() < deadline, "job never claimed");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let stopping = tokio::spawn({
            let host = Arc::clone(&host);
            async move { host.deactivate().await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!stopping.is_finished());

        let status = tokio::time::timeout(Duration::from_millis(500), host.status())
            .await
            .expect("status blocked behind deactivate");
        assert!(status.success);
        assert!(!status.processor_running);
        let health = tokio::time::timeout(Duration::from_millis(500), host.health())
            .await
            .expect("health blocked behind deactivate");
        assert_eq!(health.processor_running, Some(false));

        gate.notify_one();
        let resp = stopping.await.unwrap();
        assert!(resp.success);
        assert!(resp.message.unwrap().starts_with("Processor stopped"));
        assert_eq!(drained(&db).await[&JobStatus::Completed], 1);
    }

    #[tokio::test]
    async fn stops_after_max_iterations() {
        let (host, _db) = host().await;
        host.activate(request(Some(1))).await;
        stopped(&host).await;
        assert!(!host.deactivate().await.success);
    }

    #[tokio::test]
    async fn stops_after_idle_limit() {
        let config = WorkerHostConfig {
            idle_limit: 2,
            ..WorkerHostConfig::default()
        };
        let (host, _db) = host_with(config, HandlerRegistry::with_builtin()).await;
        host.activate(request(None)).await;
        stopped(&host).await;
    }

    #[tokio::test]
    async fn can_restart_after_stop() {
        let (host, _db) = host().await;
        host.activate(request(None)).await;
        host.deactivate().await;

        let resp = host.activate(request(None)).await;
        assert_eq!(resp.details.unwrap()["already_running"], false);
        host.deactivate().await;
    }

    #[tokio::test]
    async fn status_reports_counts_and_name() {
        let (host, db) = host().await;
        db.enqueue(&JobType::ExportCsv, json!({}), None).await.unwrap();

        let status = host.status().await;
        assert!(status.success);
        assert!(!status.processor_running);
        assert_eq!(status.job_stats["PENDING"], 1);
        assert_eq!(status.job_stats["FAILED"], 0);
        assert_eq!(status.spreadsheet_name.as_deref(), Some("job-autoscaler"));

        let health = host.health().await;
        assert_eq!(health.status, "ok");
        assert_eq!(health.processor_running, Some(false));
    }
}
