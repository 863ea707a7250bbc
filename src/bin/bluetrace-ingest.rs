//! One-shot ingestion outside the API server.

use std::process::ExitCode;
use std::sync::Arc;

use bluetrace::{
    Result,
    config::IngestConfig,
    database::{MemoryRecordStore, PgRecordStore, RecordStore, schema},
    ingest::{DatasetType, HttpSourceClient, IngestContext, JobResult, Trigger, Window, datasets},
    scheduler::Scheduler,
};
use chrono::Utc;
use clap::Parser;
use sqlx::postgres::PgPoolOptions;
use tracing::{error, info};

#[derive(Debug, Parser)]
#[command(name = "bluetrace-ingest", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Normalize into memory instead of Postgres; nothing is persisted
    #[arg(long, global = true)]
    dry_run: bool,
}

#[derive(Debug, clap::Subcommand)]
enum Commands {
    /// Run one dataset once
    ///
    /// Without --days the dataset's default lookback is used (tides: 7 days).
    Run {
        /// tides, sst, currents or turbidity
        dataset: DatasetType,
        /// Trailing window length in days
        #[arg(long)]
        days: Option<i64>,
    },
    /// Run every enabled dataset once, concurrently
    All {
        #[arg(long)]
        days: Option<i64>,
    },
    /// List enabled datasets and their schedule
    List,
}

fn window(days: Option<i64>) -> Result<Option<Window>> {
    let Some(days) = days else {
        return Ok(None);
    };
    let lookback = chrono::Duration::try_days(days.max(1))
        .ok_or_else(|| bluetrace::Error::Configuration(format!("--days {days} is out of range")))?;
    Window::trailing(Utc::now(), lookback).map(Some)
}

async fn record_store(dry_run: bool) -> Result<Arc<dyn RecordStore>> {
    if dry_run {
        info!("Dry run: records are kept in memory only");
        return Ok(Arc::new(MemoryRecordStore::new()));
    }

    let database_url = std::env::var("DATABASE_URL")
        .map_err(|_| bluetrace::Error::Configuration("DATABASE_URL is not set".into()))?;
    let pool = PgPoolOptions::new()
        .max_connections(4)
        .connect(&database_url)
        .await?;
    schema::ensure_schema(&pool).await?;
    Ok(Arc::new(PgRecordStore::new(Arc::new(pool))))
}

fn report(dataset: DatasetType, outcome: &Result<JobResult>) -> bool {
    match outcome {
        Ok(result) if result.succeeded() => {
            info!(
                "✓ {}: {} seen, {} written in {} attempt(s)",
                dataset, result.records_seen, result.records_written, result.attempts
            );
            true
        }
        Ok(result) => {
            let cause = result
                .error
                .as_ref()
                .map(|e| e.message.as_str())
                .unwrap_or("unknown error");
            error!("✗ {}: failed after {} attempt(s): {}", dataset, result.attempts, cause);
            false
        }
        Err(e) => {
            error!("✗ {}: {}", dataset, e);
            false
        }
    }
}

async fn run(cli: Cli) -> Result<bool> {
    let config = IngestConfig::from_env()?;

    if let Commands::List = cli.command {
        for dataset in &config.enabled {
            println!("{:<10} every {:?}", dataset, config.interval(*dataset));
        }
        return Ok(true);
    }

    let store = record_store(cli.dry_run).await?;
    let source = Arc::new(HttpSourceClient::new()?);
    let ctx = IngestContext::new(store, config.retry, config.fetch_timeout);
    let mut scheduler = Scheduler::new(ctx, config.max_concurrency);

    let outcomes = match cli.command {
        Commands::Run { dataset, days } => {
            scheduler.register(datasets::build(dataset, &config, source), config.interval(dataset));
            let scheduler = Arc::new(scheduler);
            vec![(dataset, scheduler.run_now(dataset, window(days)?, Trigger::Manual).await)]
        }
        Commands::All { days } => {
            for ingester in datasets::build_registry(&config, source) {
                let interval = config.interval(ingester.dataset());
                scheduler.register(ingester, interval);
            }
            let scheduler = Arc::new(scheduler);
            scheduler.run_all_once(window(days)?, Trigger::Manual).await
        }
        Commands::List => Vec::new(),
    };

    let mut ok = true;
    for (dataset, outcome) in &outcomes {
        ok &= report(*dataset, outcome);
    }
    Ok(ok)
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    info!("Starting manual ingestion...");

    match run(cli).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            error!("Ingestion aborted: {}", e);
            ExitCode::FAILURE
        }
    }
}
