//! CDR Sync command line driver
//!
//! Pulls call detail records from the PBX CDR API into PostgreSQL, keeps a
//! ledger of every sync attempt, retries failed windows and fills records
//! the upstream skipped on earlier pulls.

use anyhow::{bail, Context};
use cdrsync_core::time::today_in;
use cdrsync_core::traits::{CdrRepository, SyncLogRepository};
use cdrsync_core::AppConfig;
use cdrsync_db::{create_pool, run_migrations, PgRecordStore};
use cdrsync_pbx::PbxClient;
use cdrsync_services::{Reconciler, RetryScheduler, SyncRunner};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::env;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "cdrsync", version, about = "Call center CDR sync")]
struct Cli {
    /// Configuration file (defaults to config/default + CDRSYNC__* env vars)
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Apply database migrations
    Migrate,

    /// Sync CDR records (yesterday unless --date is given)
    Sync {
        /// Date to sync (YYYY-MM-DD)
        #[arg(short = 'd', long)]
        date: Option<NaiveDate>,

        /// End date for a range sync (YYYY-MM-DD)
        #[arg(short = 't', long, requires = "date")]
        to_date: Option<NaiveDate>,
    },

    /// Retry failed and partial syncs
    Retry,

    /// Check recent days for records missing locally
    MissingCheck {
        /// Days to check back
        #[arg(short = 'd', long)]
        days: Option<u32>,
    },

    /// Show configuration, record statistics and the last sync
    Status,

    /// Show recent sync logs
    Logs {
        /// Number of logs to show
        #[arg(short = 'l', long, default_value_t = 10)]
        limit: i64,
    },
}

type Runner = SyncRunner<PgRecordStore, PbxClient>;

/// Initialize tracing/logging
fn init_tracing() {
    let log_level = env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "cdrsync={},cdrsync_core={},cdrsync_db={},cdrsync_pbx={},cdrsync_services={},sqlx=warn",
            log_level, log_level, log_level, log_level, log_level
        ))
    });

    let json = env::var("LOG_FORMAT")
        .map(|f| f.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let registry = tracing_subscriber::registry().with(env_filter);

    if json {
        registry
            .with(
                fmt::layer()
                    .json()
                    .with_target(true)
                    .with_file(true)
                    .with_line_number(true),
            )
            .init();
    } else {
        registry
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_file(true)
                    .with_line_number(true),
            )
            .init();
    }
}

fn load_config(path: Option<&str>) -> anyhow::Result<AppConfig> {
    let config = match path {
        Some(path) => {
            let config = AppConfig::from_file(path)
                .with_context(|| format!("Failed to load configuration from {}", path))?;
            config.validate_all()?;
            config
        }
        None => AppConfig::load_validated().context("Failed to load configuration")?,
    };
    Ok(config)
}

async fn connect_store(config: &AppConfig) -> anyhow::Result<Arc<PgRecordStore>> {
    let pool = create_pool(&config.database).await?;
    Ok(Arc::new(PgRecordStore::new(pool, config.sync.tz()?)))
}

async fn build_runner(config: &AppConfig) -> anyhow::Result<Runner> {
    let store = connect_store(config).await?;
    let client = Arc::new(PbxClient::new(&config.pbx)?);
    Ok(SyncRunner::new(store, client, config.sync.tz()?))
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn cmd_sync(
    config: &AppConfig,
    date: Option<NaiveDate>,
    to_date: Option<NaiveDate>,
) -> anyhow::Result<()> {
    let runner = build_runner(config).await?;

    let outcome = match (date, to_date) {
        (Some(from), to) => {
            let to = to.unwrap_or(from);
            info!("Running manual sync: {} -> {}", from, to);
            runner.run_manual(from, to).await?
        }
        (None, Some(_)) => bail!("--to-date requires --date"),
        (None, None) => {
            info!("Running daily sync (yesterday)");
            runner.run_daily().await?
        }
    };

    print_json(&outcome)
}

async fn cmd_retry(config: &AppConfig) -> anyhow::Result<()> {
    let runner = build_runner(config).await?;
    let scheduler = RetryScheduler::from_config(runner, &config.sync);
    let summary = scheduler.run().await?;
    print_json(&summary)
}

async fn cmd_missing_check(config: &AppConfig, days: Option<u32>) -> anyhow::Result<()> {
    let days = days.unwrap_or(config.sync.default_days_back);
    let runner = build_runner(config).await?;
    let reconciler = Reconciler::new(
        runner.store().clone(),
        runner.fetcher().clone(),
        runner.timezone(),
    );

    info!("Running missing check for {} days", days);
    let summary = reconciler.run(days).await?;
    print_json(&summary)
}

async fn cmd_status(config: &AppConfig) -> anyhow::Result<()> {
    let api_key = match config.pbx.bearer_token() {
        Some(_) => "<redacted>",
        None => "<none>",
    };

    println!("Configuration:");
    println!("  PBX API URL:  {}", config.pbx.api_url);
    println!("  PBX domain:   {}", config.pbx.domain);
    println!("  PBX API key:  {}", api_key);
    println!("  Batch size:   {}", config.pbx.batch_size);
    println!("  Timezone:     {}", config.sync.timezone);
    println!("  Max retries:  {}", config.sync.max_retries);

    let runner = build_runner(config).await?;
    let store = runner.store();

    match runner
        .fetcher()
        .test_connection(today_in(runner.timezone()))
        .await
    {
        Ok(count) => println!("  PBX API:      reachable ({} records on today's first page)", count),
        Err(e) => {
            warn!("PBX connection test failed: {}", e);
            println!("  PBX API:      unreachable ({})", e);
        }
    }

    let stats = store.record_stats().await?;
    println!("\nRecords:");
    println!("  Total:        {}", stats.total);
    println!(
        "  Date range:   {} -> {}",
        stats
            .earliest_start
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "-".to_string()),
        stats
            .latest_start
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "-".to_string())
    );
    println!("  By direction: {:?}", stats.by_direction);
    println!("  By status:    {:?}", stats.by_call_status);

    match store.last_sync_log(None).await? {
        Some(last) => {
            println!("\nLast sync:");
            println!("  ID:           {}", last.id);
            println!("  Type:         {}", last.sync_type);
            println!("  Status:       {}", last.status);
            println!("  Date range:   {} -> {}", last.date_from, last.date_to);
            println!("  Records:      {}/{}", last.success_count, last.total_records);
            println!("  Started:      {}", last.start_time.to_rfc3339());
            if let Some(message) = &last.error_message {
                println!("  Error:        {}", message);
            }
        }
        None => println!("\nNo sync has run yet"),
    }

    Ok(())
}

async fn cmd_logs(config: &AppConfig, limit: i64) -> anyhow::Result<()> {
    let store = connect_store(config).await?;
    let logs = store.recent_sync_logs(limit).await?;

    println!(
        "{:>6} | {:<13} | {:<9} | {:<23} | {:>7} | {:<5} | {:<19}",
        "ID", "Type", "Status", "Date Range", "Records", "Retry", "Started"
    );
    println!("{}", "-".repeat(100));

    for log in logs {
        println!(
            "{:>6} | {:<13} | {:<9} | {:<23} | {:>7} | {:<5} | {:<19}",
            log.id,
            log.sync_type.as_str(),
            log.status.as_str(),
            format!("{} -> {}", log.date_from, log.date_to),
            format!("{}/{}", log.success_count, log.total_records),
            log.retry_count,
            log.start_time.format("%Y-%m-%d %H:%M:%S")
        );
    }

    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    init_tracing();

    info!("CDR Sync v{}", env!("CARGO_PKG_VERSION"));

    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Command::Migrate => {
            let store = connect_store(&config).await?;
            run_migrations(store.pool()).await?;
            println!("Database schema is up to date");
        }
        Command::Sync { date, to_date } => cmd_sync(&config, date, to_date).await?,
        Command::Retry => cmd_retry(&config).await?,
        Command::MissingCheck { days } => cmd_missing_check(&config, days).await?,
        Command::Status => cmd_status(&config).await?,
        Command::Logs { limit } => cmd_logs(&config, limit).await?,
    }

    Ok(())
}
