//! Periodic trigger that drives `ActivationScheduler::tick`.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use super::engine::ActivationScheduler;
use crate::config::TickSchedule;

/// Spawn the background ticker.
///
/// Each tick is awaited before the next is scheduled, so ticks never overlap.
/// Returns a `JoinHandle` and a shutdown flag. Set the flag to stop ticking.
pub fn spawn_ticker(
    scheduler: Arc<ActivationScheduler>,
    schedule: TickSchedule,
) -> (JoinHandle<()>, Arc<AtomicBool>) {
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_flag = Arc::clone(&shutdown);

    let handle = tokio::spawn(async move {
        match schedule {
            TickSchedule::Every(period) => {
                info!("Scheduler started, ticking every {}s", period.as_secs());
                let mut ticker = tokio::time::interval(period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

                loop {
                    ticker.tick().await;
                    if shutdown.load(Ordering::Relaxed) {
                        break;
                    }
                    run_tick(&scheduler).await;
                }
            }
            TickSchedule::Cron(cron) => {
                info!("Scheduler started on cron schedule '{}'", cron.source());
                loop {
                    let Some(next) = cron.upcoming(Utc).next() else {
                        warn!("Cron schedule has no upcoming fire times, stopping");
                        break;
                    };
                    let wait = (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);
                    tokio::time::sleep(wait).await;
                    if shutdown.load(Ordering::Relaxed) {
                        break;
                    }
                    run_tick(&scheduler).await;
                }
            }
        }
        info!("Scheduler shutting down");
    });

    (handle, shutdown_flag)
}

async fn run_tick(scheduler: &ActivationScheduler) {
    let outcome = scheduler.tick().await;
    info!(
        activated = outcome.activated(),
        reason = %outcome.reason(),
        "Scheduler tick"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    use async_trait::async_trait;
    use serde_json::json;

    use crate::config::{EstimatorConfig, SchedulerConfig};
    use crate::control::{
        ActivationAck, DeactivationAck, HealthReport, WorkerControl, WorkerStatus,
    };
    use crate::error::ControlError;
    use crate::jobs::JobType;
    use crate::scheduler::SystemClock;
    use crate::scheduler::engine::SchedulerDeps;
    use crate::store::{JobStore, LibSqlBackend};

    #[derive(Default)]
    struct CountingWorker {
        status_calls: AtomicUsize,
    }

    #[async_trait]
    impl WorkerControl for CountingWorker {
        async fn activate(
            &self,
            _interval_secs: u64,
            _auto_stop_minutes: u32,
            _max_iterations: Option<u64>,
        ) -> Result<ActivationAck, ControlError> {
            Err(ControlError::Rejected {
                operation: "activate",
                message: "test worker".into(),
            })
        }
        async fn deactivate(&self) -> Result<DeactivationAck, ControlError> {
            Ok(DeactivationAck { message: None })
        }
        async fn status(&self) -> Result<WorkerStatus, ControlError> {
            self.status_calls.fetch_add(1, Ordering::SeqCst);
            Ok(WorkerStatus::default())
        }
        async fn health(&self) -> HealthReport {
            HealthReport::offline("test worker")
        }
    }

    #[tokio::test]
    async fn ticker_runs_until_shutdown() {
        let db = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        db.enqueue(&JobType::ExportCsv, json!({}), None).await.unwrap();
        let worker = Arc::new(CountingWorker::default());

        let scheduler = Arc::new(ActivationScheduler::new(
            SchedulerConfig::default(),
            EstimatorConfig::default(),
            SchedulerDeps {
                store: db.clone(),
                control: worker.clone(),
                history: db.clone(),
                clock: Arc::new(SystemClock),
            },
        ));

        let (handle, shutdown) =
            spawn_ticker(scheduler, TickSchedule::Every(Duration::from_millis(20)));
        tokio::time::sleep(Duration::from_millis(150)).await;
        shutdown.store(true, Ordering::Relaxed);
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("ticker did not stop")
            .unwrap();

        // First tick fires immediately, then every 20ms.
        assert!(worker.status_calls.load(Ordering::SeqCst) >= 2);
    }
}
