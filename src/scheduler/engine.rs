//! The activation scheduler.
//!
//! One `tick()` looks at the backlog, estimates how long the worker needs,
//! checks whether it is already running, and activates it if not:
//!
//! ```text
//! Idle → Analyzing → Deciding → Activating     → Idle
//!                             → AlreadyRunning → Idle
//!                  → NoOp                      → Idle
//!                             → Failed (until the next tick)
//! ```
//!
//! Ticks are serialized by an internal lock, so a tick always sees the
//! effect of the previous one.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use super::backlog::{BacklogAnalyzer, BacklogSnapshot};
use super::clock::Clock;
use super::estimator::{DurationEstimate, DurationEstimator};
use super::history::{ActivationHistory, ActivationRecord, HistoryAggregate};
use crate::config::{EstimatorConfig, SchedulerConfig};
use crate::control::{
    DeactivationAck, HealthReport, WorkerControl, WorkerLiveness, WorkerStatus,
};
use crate::error::ControlError;
use crate::jobs::JobStatus;
use crate::store::{HistoryStore, JobStore};

/// Collaborators injected into the scheduler.
pub struct SchedulerDeps {
    pub store: Arc<dyn JobStore>,
    pub control: Arc<dyn WorkerControl>,
    pub history: Arc<dyn HistoryStore>,
    pub clock: Arc<dyn Clock>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TickPhase {
    Idle,
    Analyzing,
    Deciding,
    Activating,
    AlreadyRunning,
    NoOp,
    Failed,
}

impl std::fmt::Display for TickPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TickPhase::Idle => "idle",
            TickPhase::Analyzing => "analyzing",
            TickPhase::Deciding => "deciding",
            TickPhase::Activating => "activating",
            TickPhase::AlreadyRunning => "already_running",
            TickPhase::NoOp => "no_op",
            TickPhase::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Result of one tick (or one manual activation).
#[derive(Debug, Clone)]
pub enum TickOutcome {
    NoPendingJobs,
    AlreadyRunning {
        backlog: BacklogSnapshot,
        estimate: DurationEstimate,
    },
    Activated {
        record: ActivationRecord,
        estimate: DurationEstimate,
        /// What `status` said before activating.
        liveness: WorkerLiveness,
    },
    Failed {
        error: ControlError,
        backlog: BacklogSnapshot,
        estimate: DurationEstimate,
    },
}

impl TickOutcome {
    pub fn activated(&self) -> bool {
        matches!(self, TickOutcome::Activated { .. })
    }

    pub fn reason(&self) -> String {
        match self {
            TickOutcome::NoPendingJobs => "no pending jobs".to_string(),
            TickOutcome::AlreadyRunning { .. } => "already running".to_string(),
            TickOutcome::Activated { .. } => "activated".to_string(),
            TickOutcome::Failed { error, .. } => format!("activation failed: {error}"),
        }
    }

    pub fn scheduled_stop_at(&self) -> Option<DateTime<Utc>> {
        match self {
            TickOutcome::Activated { record, .. } => Some(record.scheduled_stop_at),
            _ => None,
        }
    }

    /// The phase the tick ended in.
    pub fn phase(&self) -> TickPhase {
        match self {
            TickOutcome::NoPendingJobs => TickPhase::NoOp,
            TickOutcome::AlreadyRunning { .. } => TickPhase::AlreadyRunning,
            TickOutcome::Activated { .. } => TickPhase::Activating,
            TickOutcome::Failed { .. } => TickPhase::Failed,
        }
    }
}

/// Everything `status` prints.
#[derive(Debug, Clone, Serialize)]
pub struct Diagnostics {
    /// `None` when the store could not be read.
    pub job_counts: Option<BTreeMap<JobStatus, u64>>,
    pub worker: WorkerLiveness,
    pub worker_status: Option<WorkerStatus>,
    pub health: HealthReport,
    pub history: Option<HistoryAggregate>,
    pub phase: TickPhase,
    pub last_phase: Option<TickPhase>,
    pub errors: Vec<String>,
}

pub struct ActivationScheduler {
    config: SchedulerConfig,
    store: Arc<dyn JobStore>,
    control: Arc<dyn WorkerControl>,
    clock: Arc<dyn Clock>,
    analyzer: BacklogAnalyzer,
    estimator: DurationEstimator,
    history: ActivationHistory,
    phase: RwLock<TickPhase>,
    last_phase: RwLock<Option<TickPhase>>,
    tick_lock: Mutex<()>,
}

impl ActivationScheduler {
    pub fn new(config: SchedulerConfig, estimator: EstimatorConfig, deps: SchedulerDeps) -> Self {
        Self {
            config,
            analyzer: BacklogAnalyzer::new(Arc::clone(&deps.store)),
            history: ActivationHistory::new(deps.history),
            estimator: DurationEstimator::new(estimator),
            store: deps.store,
            control: deps.control,
            clock: deps.clock,
            phase: RwLock::new(TickPhase::Idle),
            last_phase: RwLock::new(None),
            tick_lock: Mutex::new(()),
        }
    }

    /// Current phase. `Idle` between ticks, `Failed` after a failed one.
    pub async fn phase(&self) -> TickPhase {
        *self.phase.read().await
    }

    /// Phase the most recent tick ended in.
    pub async fn last_phase(&self) -> Option<TickPhase> {
        *self.last_phase.read().await
    }

    pub fn history(&self) -> &ActivationHistory {
        &self.history
    }

    pub fn estimator(&self) -> &DurationEstimator {
        &self.estimator
    }

    async fn set_phase(&self, phase: TickPhase) {
        *self.phase.write().await = phase;
    }

    async fn finish(&self, outcome: TickOutcome) -> TickOutcome {
        let terminal = outcome.phase();
        *self.last_phase.write().await = Some(terminal);
        self.set_phase(if terminal == TickPhase::Failed {
            TickPhase::Failed
        } else {
            TickPhase::Idle
        })
        .await;
        outcome
    }

    /// Run one scheduling decision.
    pub async fn tick(&self) -> TickOutcome {
        let _guard = self.tick_lock.lock().await;

        self.set_phase(TickPhase::Analyzing).await;
        let backlog = self.analyzer.analyze_pending().await;
        if backlog.is_empty() {
            debug!("No pending jobs, nothing to activate");
            return self.finish(TickOutcome::NoPendingJobs).await;
        }

        self.set_phase(TickPhase::Deciding).await;
        let estimate = self.estimator.estimate(&backlog);
        let status = self.control.status().await;
        if let Err(e) = &status {
            warn!("Worker status unavailable, attempting activation anyway: {e}");
        }
        let liveness = WorkerLiveness::from_status(&status);

        if liveness == WorkerLiveness::Running {
            info!(
                pending = backlog.total,
                "Worker already running, leaving it alone"
            );
            return self
                .finish(TickOutcome::AlreadyRunning { backlog, estimate })
                .await;
        }

        let initiator = self.config.initiator.clone();
        let outcome = self
            .activate_for(backlog, estimate, estimate.capped_minutes, &initiator, liveness)
            .await;
        self.finish(outcome).await
    }

    /// Activate regardless of the worker's reported status.
    ///
    /// `minutes` is clamped to the configured bounds; without it the current
    /// estimate is used.
    pub async fn activate_now(&self, minutes: Option<u32>, initiator: &str) -> TickOutcome {
        let _guard = self.tick_lock.lock().await;

        self.set_phase(TickPhase::Analyzing).await;
        let backlog = self.analyzer.analyze_pending().await;

        self.set_phase(TickPhase::Deciding).await;
        let estimate = self.estimator.estimate(&backlog);
        let granted = match minutes {
            Some(m) => self.estimator.config().clamp_minutes(m as u64),
            None => estimate.capped_minutes,
        };

        let outcome = self
            .activate_for(backlog, estimate, granted, initiator, WorkerLiveness::Unknown)
            .await;
        self.finish(outcome).await
    }

    async fn activate_for(
        &self,
        backlog: BacklogSnapshot,
        estimate: DurationEstimate,
        minutes: u32,
        initiator: &str,
        liveness: WorkerLiveness,
    ) -> TickOutcome {
        self.set_phase(TickPhase::Activating).await;
        info!(
            pending = backlog.total,
            minutes,
            initiator,
            "Activating worker"
        );

        let ack = match self
            .control
            .activate(self.config.poll_interval_secs, minutes, None)
            .await
        {
            Ok(ack) => ack,
            Err(error) => {
                warn!("Worker activation failed: {error}");
                return TickOutcome::Failed {
                    error,
                    backlog,
                    estimate,
                };
            }
        };

        if ack.already_running {
            info!("Worker reported it was already running; nothing recorded");
            return TickOutcome::AlreadyRunning { backlog, estimate };
        }

        let now = self.clock.now();
        let record = ActivationRecord {
            timestamp: now,
            total_jobs: backlog.total,
            by_type: backlog.by_type,
            estimated_minutes: u32::try_from(estimate.estimated_minutes).unwrap_or(u32::MAX),
            configured_minutes: minutes,
            scheduled_stop_at: now + chrono::Duration::minutes(minutes as i64),
            initiator: initiator.to_string(),
        };

        if let Err(e) = self.history.record(&record).await {
            error!("Worker activated but history append failed: {e}");
        }

        info!(
            stop_at = %record.scheduled_stop_at,
            "Worker activated"
        );
        TickOutcome::Activated {
            record,
            estimate,
            liveness,
        }
    }

    pub async fn deactivate(&self) -> Result<DeactivationAck, ControlError> {
        self.control.deactivate().await
    }

    /// Job counts, worker state and history summary. Never fails.
    pub async fn diagnostics(&self) -> Diagnostics {
        let mut errors = Vec::new();

        let job_counts = match self.store.count_by_status().await {
            Ok(counts) => Some(counts),
            Err(e) => {
                errors.push(format!("job store: {e}"));
                None
            }
        };

        let status = self.control.status().await;
        let worker = WorkerLiveness::from_status(&status);
        let worker_status = match status {
            Ok(s) => Some(s),
            Err(e) => {
                errors.push(format!("worker status: {e}"));
                None
            }
        };

        let health = self.control.health().await;

        let history = match self.history.aggregate().await {
            Ok(agg) => Some(agg),
            Err(e) => {
                errors.push(format!("activation history: {e}"));
                None
            }
        };

        Diagnostics {
            job_counts,
            worker,
            worker_status,
            health,
            history,
            phase: self.phase().await,
            last_phase: self.last_phase().await,
            errors,
        }
    }
}
