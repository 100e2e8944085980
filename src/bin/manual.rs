//! Manual single-asset runner.
//!
//! Drives one archiver directly, outside the manifest sweep. Useful for
//! targeted re-runs, first-time backfills of a single dataset, and
//! inspecting an asset's request history.
//!
//! ```bash
//! # Backfill one statement dataset from 2007
//! manual --archiver-kind period --data-type income --mode backfill
//!
//! # Update dividends over the last 10 days
//! manual --archiver-kind event_date --data-type dividend --mode update --lookback 10
//!
//! # Holder counts for whatever codes are still missing
//! manual --archiver-kind code --data-type stk_holdernumber --mode update \
//!        --driver-source stock_basic
//!
//! # Request-log summary for an asset
//! manual --data-type income --mode summary
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use tracing::error;

use tickvault::archivers::{
    ArchiverCtx, CodeDrivenArchiver, EventDateArchiver, IndexMonthlyArchiver, PeriodArchiver,
    SnapshotArchiver, TradeDateArchiver,
};
use tickvault::client::VendorClient;
use tickvault::config::Config;
use tickvault::manifest::{ArchiverKind, DriverSource, COMMON_INDEXES};
use tickvault::request_log::RequestLog;

#[derive(Parser, Debug)]
#[command(name = "manual")]
#[command(about = "Run a single archiver outside the manifest sweep")]
struct Args {
    /// Archiver kind: period, trade_date, event_date, snapshot, code,
    /// index_monthly. Unused for --mode summary.
    #[arg(long)]
    archiver_kind: Option<String>,

    /// Dataset to process (must be a registered endpoint).
    #[arg(long)]
    data_type: String,

    #[arg(long, value_enum, default_value = "update")]
    mode: RunMode,

    /// Backfill origin override, YYYYMMDD.
    #[arg(long)]
    start_date: Option<String>,

    /// Update window in the archiver's natural unit (quarters, days, or
    /// months).
    #[arg(long)]
    lookback: Option<u32>,

    /// Code-driven kinds: 'common_indexes' or a snapshot asset name whose
    /// ts_code column drives the traversal.
    #[arg(long)]
    driver_source: Option<String>,

    /// Event-date kinds: the date parameter / directory prefix.
    #[arg(long, default_value = "ann_date")]
    date_field: String,

    /// Data root override (defaults to $DATA_PATH, then ./data).
    #[arg(long)]
    data_path: Option<PathBuf>,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq)]
enum RunMode {
    Backfill,
    Update,
    Summary,
}

#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tickvault=info,manual=info".into()),
        )
        .init();

    let args = Args::parse();
    if let Err(e) = run(args).await {
        error!("{e:#}");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<()> {
    let mut config = Config::from_env()?;
    if let Some(path) = args.data_path.clone() {
        config.base_data_path = path;
    }

    if args.mode == RunMode::Summary {
        return print_summary(&config, &args.data_type);
    }

    let kind_raw = args
        .archiver_kind
        .as_deref()
        .context("--archiver-kind is required for backfill/update")?;
    let kind = ArchiverKind::parse(kind_raw)
        .with_context(|| format!("unknown archiver kind '{kind_raw}'"))?;

    let client = Arc::new(VendorClient::from_config(&config)?);
    let ctx = ArchiverCtx::new(&config, client, &args.data_type)?;

    match kind {
        ArchiverKind::Period => {
            let start_year = match args.start_date.as_deref() {
                Some(date) if date.len() >= 4 => date[..4].parse()?,
                Some(date) => bail!("malformed --start-date '{date}'"),
                None => 2007,
            };
            let archiver =
                PeriodArchiver::new(ctx, start_year, args.lookback.unwrap_or(12));
            match args.mode {
                RunMode::Backfill => archiver.backfill().await?,
                RunMode::Update => archiver.update().await?,
                RunMode::Summary => unreachable!(),
            }
        }
        ArchiverKind::TradeDate => {
            let start = args.start_date.as_deref().unwrap_or("20070101");
            let archiver = TradeDateArchiver::new(ctx, start, args.lookback.unwrap_or(30))?;
            match args.mode {
                RunMode::Backfill => archiver.backfill(None).await?,
                RunMode::Update => archiver.update().await?,
                RunMode::Summary => unreachable!(),
            }
        }
        ArchiverKind::EventDate => {
            let start = args.start_date.as_deref().unwrap_or("20070101");
            let archiver =
                EventDateArchiver::new(ctx, &args.date_field, start, args.lookback.unwrap_or(30));
            match args.mode {
                RunMode::Backfill => archiver.backfill(None).await?,
                RunMode::Update => archiver.update().await?,
                RunMode::Summary => unreachable!(),
            }
        }
        ArchiverKind::Snapshot => {
            let archiver = SnapshotArchiver::new(ctx, 30);
            // Snapshots re-route backfill to update anyway.
            archiver.update(None).await?;
        }
        ArchiverKind::CodeDriven => {
            let driver = match args.driver_source.as_deref() {
                Some("common_indexes") | Some("COMMON_INDEXES") => DriverSource::CommonIndexes,
                Some("stock_basic") | None => DriverSource::SnapshotCodes("stock_basic"),
                Some(other) => bail!(
                    "unsupported --driver-source '{other}' (expected common_indexes or stock_basic)"
                ),
            };
            let archiver = CodeDrivenArchiver::new(ctx, driver);
            match args.mode {
                RunMode::Backfill => archiver.backfill().await?,
                RunMode::Update => archiver.update().await?,
                RunMode::Summary => unreachable!(),
            }
        }
        ArchiverKind::IndexMonthly => {
            let start = args.start_date.clone().unwrap_or_else(|| "20070101".to_string());
            let indexes = COMMON_INDEXES.iter().map(|s| s.to_string()).collect();
            let archiver =
                IndexMonthlyArchiver::new(ctx, indexes, &start, args.lookback.unwrap_or(12));
            match args.mode {
                RunMode::Backfill => archiver.backfill().await?,
                RunMode::Update => archiver.update().await?,
                RunMode::Summary => unreachable!(),
            }
        }
    }

    println!("done");
    Ok(())
}

/// Request-log summary: totals per status plus the most recent attempts.
fn print_summary(config: &Config, data_type: &str) -> Result<()> {
    let log = RequestLog::open(config.log_db_path())?;
    let history = log.history(data_type, None)?;

    println!("=== '{data_type}' request log summary ===");
    println!("total entries: {}", history.len());
    if history.is_empty() {
        return Ok(());
    }

    let mut by_status: Vec<(String, usize)> = Vec::new();
    for record in &history {
        match by_status.iter_mut().find(|(s, _)| *s == record.status) {
            Some((_, count)) => *count += 1,
            None => by_status.push((record.status.clone(), 1)),
        }
    }
    by_status.sort_by(|a, b| b.1.cmp(&a.1));
    for (status, count) in &by_status {
        println!("  {status}: {count}");
    }

    if let Some(last) = log.last_success_ingest_date(data_type)? {
        println!("last successful ingest date: {last}");
    }

    println!("\nmost recent attempts:");
    for record in history.iter().take(10) {
        println!(
            "  {} {} rows={} status={} ({})",
            record.ingest_date,
            record.partition_key,
            record.row_count,
            record.status,
            record.created_at
        );
    }

    Ok(())
}
