//! telemetry-ingest CLI
//!
//! Usage:
//!   telemetry-ingest sync [--every 300]
//!   telemetry-ingest backfill --start 2024-01-01 --end 2024-02-01
//!   telemetry-ingest resume --job <job-id>
//!   telemetry-ingest status
//!   telemetry-ingest metrics --days 7 --top 10
//!
//! Configuration comes from the environment (and `.env`), see `IngestConfig`.

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use telemetry_ingest::ingest::{IncrementalSync, SyncReport};
use telemetry_ingest::queue::{EnqueueOptions, JobQueue, INCREMENTAL_QUEUE, INCREMENTAL_SYNC_JOB};
use telemetry_ingest::{IngestConfig, IngestContext};

#[derive(Parser, Debug)]
#[command(name = "telemetry-ingest")]
#[command(about = "Fleet telemetry ingestion from the telematics provider")]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run incremental sync cycles
    Sync {
        /// Repeat every N seconds until Ctrl-C (single cycle when omitted)
        #[arg(long)]
        every: Option<u64>,
    },

    /// Create and run a historical backfill job over [start, end)
    Backfill {
        /// RFC 3339 timestamp or YYYY-MM-DD
        #[arg(long, value_parser = parse_datetime)]
        start: DateTime<Utc>,

        #[arg(long, value_parser = parse_datetime)]
        end: DateTime<Utc>,
    },

    /// Continue a failed or cancelled backfill job as a new job
    Resume {
        #[arg(long)]
        job: String,
    },

    /// Print the ingestion status summary as JSON
    Status,

    /// Print hourly, daily and top-N metrics as JSON
    Metrics {
        #[arg(long, default_value = "7")]
        days: u32,

        #[arg(long, default_value = "10")]
        top: usize,
    },
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, String> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
        return Ok(ts.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M") {
        return Ok(Utc.from_utc_datetime(&naive));
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| Utc.from_utc_datetime(&naive))
        .ok_or_else(|| format!("invalid timestamp '{}': expected RFC 3339 or YYYY-MM-DD", s))
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();

    let config = IngestConfig::from_env()?;
    let ctx = IngestContext::build(config).context("Failed to initialize ingestion context")?;

    match args.command {
        Commands::Sync { every } => run_sync(&ctx, every).await?,
        Commands::Backfill { start, end } => {
            let worker = ctx.backfill_worker();
            let job = worker.create_job(start, end)?;
            run_backfill(&ctx, &job.job_id).await?;
        }
        Commands::Resume { job } => {
            let worker = ctx.backfill_worker();
            let resumed = worker.resume_from(&job)?;
            run_backfill(&ctx, &resumed.job_id).await?;
        }
        Commands::Status => {
            let summary = ctx.status_service().summary()?;
            print_json(&summary)?;
        }
        Commands::Metrics { days, top } => {
            let service = ctx.status_service();
            let now = Utc::now();

            #[derive(Serialize)]
            struct MetricsReport {
                hourly: Vec<telemetry_ingest::storage::TimeBucket>,
                daily: Vec<telemetry_ingest::storage::TimeBucket>,
                breakdown: telemetry_ingest::status::Breakdown,
            }

            print_json(&MetricsReport {
                hourly: service.hourly_metrics(now)?,
                daily: service.daily_metrics(now, days)?,
                breakdown: service.breakdown(now, days, top)?,
            })?;
        }
    }

    Ok(())
}

/// Cancelled on the first Ctrl-C.
fn shutdown_token() -> CancellationToken {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Ctrl-C received, stopping at the next boundary");
            trigger.cancel();
        }
    });
    cancel
}

async fn run_backfill(ctx: &IngestContext, job_id: &str) -> Result<()> {
    let cancel = shutdown_token();
    let worker = ctx.backfill_worker();

    let report = worker.run(job_id, &cancel).await?;
    print_json(&report)?;
    Ok(())
}

async fn run_sync(ctx: &IngestContext, every: Option<u64>) -> Result<()> {
    let sync = ctx.incremental_sync();
    let Some(every) = every else {
        let report = sync_cycle(ctx, &sync).await?;
        return print_json(&report);
    };

    let cancel = shutdown_token();
    let interval = Duration::from_secs(every.max(1));
    info!(every_secs = interval.as_secs(), "Incremental sync loop started");

    while !cancel.is_cancelled() {
        if let Err(e) = sync_cycle(ctx, &sync).await {
            error!(error = %format!("{:#}", e), "Incremental sync cycle failed");
        }
        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = tokio::time::sleep(interval) => {}
        }
    }

    info!("Incremental sync loop stopped");
    Ok(())
}

/// One cycle, recorded as a job on the incremental queue.
async fn sync_cycle(ctx: &IngestContext, sync: &IncrementalSync) -> Result<SyncReport> {
    let payload = serde_json::json!({ "process": sync.process_name() });
    ctx.queue.enqueue(
        INCREMENTAL_QUEUE,
        INCREMENTAL_SYNC_JOB,
        &payload,
        EnqueueOptions::default(),
    )?;
    let job = ctx
        .queue
        .claim_next(INCREMENTAL_QUEUE)?
        .context("incremental queue job disappeared after enqueue")?;

    match sync.run_once().await {
        Ok(report) => {
            ctx.queue.complete(job.id)?;
            Ok(report)
        }
        Err(e) => {
            ctx.queue.fail(job.id, &format!("{:#}", e))?;
            Err(e)
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "telemetry_ingest=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}
