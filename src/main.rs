use std::sync::Arc;

use anyhow::{Context, bail};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

use job_autoscaler::config::{
    EstimatorConfig, SchedulerConfig, StorageConfig, WorkerControlConfig, WorkerHostConfig,
};
use job_autoscaler::control::{WebhookControlClient, WorkerControl};
use job_autoscaler::jobs::JobType;
use job_autoscaler::scheduler::{
    ActivationHistory, ActivationScheduler, SchedulerDeps, SystemClock, TickOutcome, spawn_ticker,
};
use job_autoscaler::store::{JobStore, LibSqlBackend};
use job_autoscaler::worker::{HandlerRegistry, WorkerHost, worker_routes};

const USAGE: &str = "\
Usage: job-autoscaler [command]

Commands:
  run                                   Tick periodically until Ctrl-C (default)
  tick                                  Run one scheduling decision and exit
  enqueue <JOB_NAME> [payload] [email]  Add a job to the queue
  status                                Job counts, worker state, history summary
  history [limit]                       Recent activations, newest first
  activate [minutes]                    Activate the worker now
  deactivate                            Stop the worker
  worker                                Serve the worker host";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let storage = StorageConfig::from_env();
    let _log_guard = init_tracing(&storage)?;

    let args: Vec<String> = std::env::args().skip(1).collect();
    let command = args.first().map(String::as_str).unwrap_or("run");
    let rest = args.get(1..).unwrap_or_default();

    match command {
        "run" => run(&storage).await,
        "tick" => tick(&storage).await,
        "enqueue" => enqueue(&storage, rest).await,
        "status" => status(&storage).await,
        "history" => history(&storage, rest).await,
        "activate" => activate(&storage, rest).await,
        "deactivate" => deactivate().await,
        "worker" => serve_worker(&storage).await,
        "help" | "-h" | "--help" => {
            println!("{USAGE}");
            Ok(())
        }
        other => {
            eprintln!("{USAGE}");
            bail!("unknown command '{other}'")
        }
    }
}

/// stderr always; a daily rolling file too when `AUTOSCALER_LOG_DIR` is set.
fn init_tracing(storage: &StorageConfig) -> anyhow::Result<Option<WorkerGuard>> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stderr = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr);

    let Some(dir) = &storage.log_dir else {
        tracing_subscriber::registry().with(filter).with(stderr).init();
        return Ok(None);
    };

    std::fs::create_dir_all(dir)
        .with_context(|| format!("creating log directory {}", dir.display()))?;
    let (writer, guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, "job-autoscaler.log"));
    tracing_subscriber::registry()
        .with(filter)
        .with(stderr)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_ansi(false)
                .with_writer(writer),
        )
        .init();
    Ok(Some(guard))
}

async fn open_store(storage: &StorageConfig) -> anyhow::Result<Arc<LibSqlBackend>> {
    let db = LibSqlBackend::new_local(&storage.db_path)
        .await
        .with_context(|| format!("opening database at {}", storage.db_path.display()))?;
    Ok(Arc::new(db))
}

async fn build_scheduler(storage: &StorageConfig) -> anyhow::Result<ActivationScheduler> {
    let db = open_store(storage).await?;
    let control = WebhookControlClient::new(&WorkerControlConfig::from_env()?)?;
    Ok(ActivationScheduler::new(
        SchedulerConfig::from_env()?,
        EstimatorConfig::from_env()?,
        SchedulerDeps {
            store: db.clone(),
            control: Arc::new(control),
            history: db,
            clock: Arc::new(SystemClock),
        },
    ))
}

fn print_outcome(outcome: &TickOutcome) {
    println!("activated: {}", outcome.activated());
    println!("reason:    {}", outcome.reason());
    match outcome {
        TickOutcome::Activated {
            record, estimate, ..
        } => {
            println!("pending:   {}", record.total_jobs);
            println!(
                "estimate:  {} min (granted {} min)",
                estimate.estimated_minutes, record.configured_minutes
            );
            println!("stops at:  {}", record.scheduled_stop_at);
        }
        TickOutcome::AlreadyRunning { backlog, .. } | TickOutcome::Failed { backlog, .. } => {
            println!("pending:   {}", backlog.total);
        }
        TickOutcome::NoPendingJobs => {}
    }
}

async fn run(storage: &StorageConfig) -> anyhow::Result<()> {
    let scheduler = Arc::new(build_scheduler(storage).await?);
    let schedule = SchedulerConfig::from_env()?.schedule;

    let (handle, shutdown) = spawn_ticker(scheduler, schedule);
    tokio::signal::ctrl_c().await?;
    info!("Ctrl-C received, stopping scheduler");
    shutdown.store(true, std::sync::atomic::Ordering::Relaxed);
    handle.abort();
    Ok(())
}

async fn tick(storage: &StorageConfig) -> anyhow::Result<()> {
    let scheduler = build_scheduler(storage).await?;
    print_outcome(&scheduler.tick().await);
    Ok(())
}

async fn enqueue(storage: &StorageConfig, args: &[String]) -> anyhow::Result<()> {
    let Some(name) = args.first() else {
        bail!("enqueue needs a job name, e.g. `enqueue EXPORT_CSV '{{\"sheetName\":\"Sales\"}}'`");
    };
    let body: serde_json::Value = match args.get(1) {
        Some(raw) => serde_json::from_str(raw).context("payload must be JSON")?,
        None => serde_json::json!({}),
    };
    let email = args.get(2).map(String::as_str);

    let db = open_store(storage).await?;
    let id = db.enqueue(&JobType::from(name.as_str()), body, email).await?;
    println!("{id}");
    Ok(())
}

async fn status(storage: &StorageConfig) -> anyhow::Result<()> {
    let scheduler = build_scheduler(storage).await?;
    let diagnostics = scheduler.diagnostics().await;
    println!("{}", serde_json::to_string_pretty(&diagnostics)?);
    Ok(())
}

async fn history(storage: &StorageConfig, args: &[String]) -> anyhow::Result<()> {
    let limit: usize = match args.first() {
        Some(raw) => raw.parse().context("limit must be a number")?,
        None => 10,
    };
    let db = open_store(storage).await?;
    let history = ActivationHistory::new(db);

    for record in history.recent(limit).await? {
        println!(
            "{}  {:>4} jobs  {:>3}/{:>3} min  until {}  by {}",
            record.timestamp.format("%Y-%m-%d %H:%M:%S"),
            record.total_jobs,
            record.estimated_minutes,
            record.configured_minutes,
            record.scheduled_stop_at.format("%H:%M:%S"),
            record.initiator,
        );
    }
    let agg = history.aggregate().await?;
    println!(
        "{} activations, {} jobs, avg {:.1} min, avg {:.1} jobs",
        agg.total_activations,
        agg.total_jobs_processed,
        agg.avg_configured_minutes,
        agg.avg_jobs_per_activation
    );
    Ok(())
}

async fn activate(storage: &StorageConfig, args: &[String]) -> anyhow::Result<()> {
    let minutes: Option<u32> = match args.first() {
        Some(raw) => Some(raw.parse().context("minutes must be a number")?),
        None => None,
    };
    let initiator = std::env::var("USER").unwrap_or_else(|_| "manual".to_string());
    let scheduler = build_scheduler(storage).await?;
    let outcome = scheduler.activate_now(minutes, &initiator).await;
    print_outcome(&outcome);
    if let TickOutcome::Failed { error, .. } = outcome {
        bail!(error);
    }
    Ok(())
}

async fn deactivate() -> anyhow::Result<()> {
    let control = WebhookControlClient::new(&WorkerControlConfig::from_env()?)?;
    let ack = control.deactivate().await?;
    println!("{}", ack.message.unwrap_or_else(|| "deactivated".into()));
    Ok(())
}

async fn serve_worker(storage: &StorageConfig) -> anyhow::Result<()> {
    let config = WorkerHostConfig::from_env()?;
    let port = config.port;
    let db = open_store(storage).await?;
    let host = Arc::new(WorkerHost::new(config, db, HandlerRegistry::with_builtin()));

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{port}"))
        .await
        .with_context(|| format!("binding port {port}"))?;
    eprintln!("Worker host listening on http://0.0.0.0:{port}");
    eprintln!("   export WORKER_CONTROL_URL=http://<this-host>:{port}");

    let app = worker_routes(Arc::clone(&host));
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
        })
        .await?;

    if host.is_running().await {
        host.deactivate().await;
    }
    Ok(())
}
