//! Pipeline orchestrator CLI.
//!
//! Entry point for scheduled runs over the full asset manifest.
//!
//! # Usage
//!
//! ```bash
//! # Full historical backfill (resumable; skips partitions already on disk)
//! tickvault --mode backfill
//!
//! # Daily incremental update per each asset's policy
//! tickvault --mode update
//!
//! # Standalone check → targeted refetch → report workflow
//! tickvault --mode quality-check
//! ```
//!
//! # Exit Codes
//!
//! - 0: Success, all assets processed and quality checks clean
//! - 1: Hard failure (initialization, missing dependency asset)
//! - 2: Quality-check failures remain after targeted refetch

use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tracing::{error, info, warn};

use tickvault::client::VendorClient;
use tickvault::config::Config;
use tickvault::pipeline::{Pipeline, PipelineReport};

#[derive(Parser, Debug)]
#[command(name = "tickvault")]
#[command(about = "Vendor data ingestion and archival pipeline")]
struct Args {
    /// Pipeline mode to run.
    #[arg(long, value_enum)]
    mode: Mode,

    /// Data root override (defaults to $DATA_PATH, then ./data).
    #[arg(long)]
    data_path: Option<PathBuf>,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Mode {
    Backfill,
    Update,
    #[value(alias = "quality_check")]
    QualityCheck,
}

#[tokio::main]
async fn main() {
    std::process::exit(run().await);
}

async fn run() -> i32 {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tickvault=info".into()),
        )
        .init();

    let args = Args::parse();

    let mut config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("configuration error: {e:#}");
            return 1;
        }
    };
    if let Some(path) = args.data_path {
        config.base_data_path = path;
    }

    let client = match VendorClient::from_config(&config) {
        Ok(client) => Arc::new(client),
        Err(e) => {
            error!("failed to initialize vendor client: {e:#}");
            return 1;
        }
    };

    let pipeline = Pipeline::new(config, client);

    // Stop at the next partition boundary on ctrl-c; in-flight fetches
    // complete and the atomic writer never leaves a torn partition.
    let cancel = pipeline.cancel_flag();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; finishing the current partition then stopping");
            cancel.store(true, Ordering::Relaxed);
        }
    });

    let report = match args.mode {
        Mode::Backfill => pipeline.run_backfill().await,
        Mode::Update => pipeline.run_update().await,
        Mode::QualityCheck => pipeline.run_quality_check().await,
    };

    exit_code(&report)
}

fn exit_code(report: &PipelineReport) -> i32 {
    if !report.failed_assets.is_empty() {
        error!(
            failed = report.failed_assets.len(),
            assets = ?report.failed_assets,
            "pipeline finished with failed assets"
        );
        return 1;
    }
    if !report.unresolved_qa.is_empty() {
        error!(
            unresolved = report.unresolved_qa.len(),
            "pipeline finished with unresolved quality failures"
        );
        return 2;
    }
    info!("pipeline finished clean");
    0
}
