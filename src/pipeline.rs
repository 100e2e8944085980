//! Pipeline orchestrator.
//!
//! Drives the asset manifest in one of three modes. `backfill` and `update`
//! sweep every asset in manifest order with per-asset error isolation (one
//! asset failing to construct or fetch never stops the sweep), and finish
//! with the quality workflow: check, targeted refetch of anything missing,
//! re-check, report. `quality_check` runs the workflow alone.
//!
//! Cancellation is cooperative: the flag is honored between partitions and
//! between assets, never mid-request, so no partial partition is left
//! behind.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use chrono::{Datelike, Local, NaiveDate};
use tracing::{error, info, warn};

use crate::archivers::Archiver;
use crate::client::VendorClient;
use crate::config::Config;
use crate::manifest::{data_assets, Asset};
use crate::quality::{QaFailure, QualityChecker};

/// End state of one orchestrator run.
#[derive(Debug, Default)]
pub struct PipelineReport {
    /// Assets that failed outright (construction or sweep error).
    pub failed_assets: Vec<String>,
    /// Quality failures that survived the targeted refetch.
    pub unresolved_qa: Vec<QaFailure>,
}

impl PipelineReport {
    pub fn is_clean(&self) -> bool {
        self.failed_assets.is_empty() && self.unresolved_qa.is_empty()
    }
}

pub struct Pipeline {
    config: Config,
    client: Arc<VendorClient>,
    assets: Vec<Asset>,
    cancel: Arc<AtomicBool>,
    today: NaiveDate,
}

impl Pipeline {
    pub fn new(config: Config, client: Arc<VendorClient>) -> Pipeline {
        Pipeline {
            config,
            client,
            assets: data_assets(),
            cancel: Arc::new(AtomicBool::new(false)),
            today: Local::now().date_naive(),
        }
    }

    pub fn with_assets(mut self, assets: Vec<Asset>) -> Pipeline {
        self.assets = assets;
        self
    }

    pub fn with_today(mut self, today: NaiveDate) -> Pipeline {
        self.today = today;
        self
    }

    /// Handle for signal handlers; setting it stops the run at the next
    /// partition boundary.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }

    fn archiver_for(&self, asset: &Asset) -> Result<Archiver> {
        Archiver::for_asset(
            &self.config,
            self.client.clone(),
            asset,
            self.cancel.clone(),
            self.today,
        )
    }

    /// Full historical backfill over the manifest, then the QA workflow.
    pub async fn run_backfill(&self) -> PipelineReport {
        info!("starting full historical backfill pipeline");
        let mut report = self.sweep(Mode::Backfill).await;
        report.unresolved_qa = self.run_quality_workflow().await;
        report
    }

    /// Incremental update over the manifest, then the QA workflow.
    pub async fn run_update(&self) -> PipelineReport {
        info!("starting incremental update pipeline");
        let mut report = self.sweep(Mode::Update).await;
        report.unresolved_qa = self.run_quality_workflow().await;
        report
    }

    /// The QA workflow alone, no ingestion sweep.
    pub async fn run_quality_check(&self) -> PipelineReport {
        PipelineReport {
            failed_assets: Vec::new(),
            unresolved_qa: self.run_quality_workflow().await,
        }
    }

    async fn sweep(&self, mode: Mode) -> PipelineReport {
        let mut report = PipelineReport::default();
        let total = self.assets.len();

        for (idx, asset) in self.assets.iter().enumerate() {
            if self.cancelled() {
                info!("pipeline cancelled; stopping sweep");
                break;
            }
            info!(
                asset = asset.name,
                kind = asset.kind.as_str(),
                position = idx + 1,
                total,
                "processing asset"
            );

            if mode == Mode::Update && !asset.policy.runs_in_month(self.today.month()) {
                info!(
                    asset = asset.name,
                    month = self.today.month(),
                    "outside run window, skipping"
                );
                continue;
            }

            let outcome = match self.archiver_for(asset) {
                Ok(archiver) => match mode {
                    Mode::Backfill => archiver.backfill().await,
                    Mode::Update => archiver.update().await,
                },
                Err(e) => Err(e),
            };

            if let Err(e) = outcome {
                // Isolation boundary: report, record, move on.
                error!(asset = asset.name, "asset failed: {e:#}");
                report.failed_assets.push(asset.name.to_string());
            }
        }
        report
    }

    /// Check → targeted refetch → re-check. Returns the failures that
    /// persist after the refetch attempt.
    pub async fn run_quality_workflow(&self) -> Vec<QaFailure> {
        let checker = QualityChecker::new(self.config.clone(), self.assets.clone(), self.today);

        let initial = checker.run_checks();
        if initial.is_empty() {
            info!("all data assets passed quality checks");
            return Vec::new();
        }

        warn!(count = initial.len(), "quality issues found");
        for failure in &initial {
            warn!("  {failure}");
        }

        self.targeted_refetch(&initial).await;

        let persistent = checker.run_checks();
        if persistent.is_empty() {
            info!("all quality issues resolved by targeted refetch");
        } else {
            error!(count = persistent.len(), "quality issues persist after refetch");
            for failure in &persistent {
                error!("  {failure}");
            }
        }
        persistent
    }

    /// Re-run the single-partition process routine for each failed key,
    /// grouping by asset so each archiver is constructed once.
    async fn targeted_refetch(&self, failures: &[QaFailure]) {
        let mut by_asset: Vec<(&Asset, Vec<&QaFailure>)> = Vec::new();
        for failure in failures {
            match by_asset.iter_mut().find(|(a, _)| a.name == failure.asset.name) {
                Some((_, keys)) => keys.push(failure),
                None => by_asset.push((&failure.asset, vec![failure])),
            }
        }

        for (asset, asset_failures) in by_asset {
            if self.cancelled() {
                info!("pipeline cancelled; stopping refetch");
                return;
            }
            info!(
                asset = asset.name,
                partitions = asset_failures.len(),
                "refetching failed partitions"
            );
            let archiver = match self.archiver_for(asset) {
                Ok(archiver) => archiver,
                Err(e) => {
                    error!(asset = asset.name, "cannot construct archiver for refetch: {e:#}");
                    continue;
                }
            };
            for failure in asset_failures {
                if self.cancelled() {
                    return;
                }
                if let Err(e) = archiver.process_one(&failure.partition_key).await {
                    error!(
                        asset = asset.name,
                        partition = failure.partition_key,
                        "refetch failed: {e:#}"
                    );
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Backfill,
    Update,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archivers::test_support::{scripted_client, ScriptedTransport};
    use crate::frame::{Cell, Frame};
    use crate::manifest::find_asset;
    use crate::storage::{snapshot_leaf, trade_date_leaf, PartitionMetadata, PartitionStore};

    fn daily_frame() -> Frame {
        Frame::new(
            vec!["ts_code".into(), "trade_date".into(), "close".into()],
            vec![vec![
                Cell::Str("000001.SZ".into()),
                Cell::Str("20240105".into()),
                Cell::Float(10.0),
            ]],
        )
    }

    fn seed_calendar(config: &Config, days: &[(&str, i64)]) {
        let store = PartitionStore::open(&config.landing_root(), "trade_cal").unwrap();
        let frame = Frame::new(
            vec!["cal_date".into(), "is_open".into()],
            days.iter()
                .map(|(d, open)| vec![Cell::Str(d.to_string()), Cell::Int(*open)])
                .collect(),
        );
        let meta = PartitionMetadata::for_frame("20240105", "2024-01-05", &frame);
        store
            .write_partition(&snapshot_leaf("20240105"), &frame, &meta)
            .unwrap();
    }

    #[tokio::test]
    async fn asset_failures_are_isolated() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::for_base_path(dir.path());
        // daily requires trade_cal, which is missing: construction fails.
        // stock_basic still runs and succeeds.
        let transport = Arc::new(ScriptedTransport::new(vec![Ok(daily_frame())]));
        let client = Arc::new(scripted_client(transport, dir.path()));
        let pipeline = Pipeline::new(config.clone(), client)
            .with_assets(vec![
                find_asset("daily").unwrap(),
                find_asset("stock_basic").unwrap(),
            ])
            .with_today(NaiveDate::from_ymd_opt(2024, 1, 5).unwrap());

        let report = pipeline.run_update().await;
        assert_eq!(report.failed_assets, vec!["daily".to_string()]);

        let store = PartitionStore::open(&config.landing_root(), "stock_basic").unwrap();
        assert!(store.partition_exists("snapshot_date=20240105"));
    }

    #[tokio::test]
    async fn run_window_gates_update_sweeps() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::for_base_path(dir.path());
        let mut asset = find_asset("income").unwrap();
        asset.policy.run_window = Some((4, 8));

        let transport = Arc::new(ScriptedTransport::new(vec![]));
        let client = Arc::new(scripted_client(transport.clone(), dir.path()));
        let pipeline = Pipeline::new(config, client)
            .with_assets(vec![asset])
            // January: outside the April–August window.
            .with_today(NaiveDate::from_ymd_opt(2024, 1, 15).unwrap());

        let report = pipeline.sweep(Mode::Update).await;
        assert!(report.failed_assets.is_empty());
        assert_eq!(transport.call_count(), 0);
    }

    #[tokio::test]
    async fn quality_workflow_refetches_missing_trade_date_partition() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::for_base_path(dir.path());
        seed_calendar(&config, &[("20240104", 1), ("20240105", 1)]);

        // Both days on disk, then one goes missing.
        let store = PartitionStore::open(&config.landing_root(), "daily").unwrap();
        for day in ["20240104", "20240105"] {
            let frame = daily_frame();
            let meta = PartitionMetadata::for_frame(day, "2024-01-05", &frame);
            store
                .write_partition(&trade_date_leaf(day), &frame, &meta)
                .unwrap();
        }
        store.remove_partition(&trade_date_leaf("20240104")).unwrap();

        // The refetch fetches exactly the missing day.
        let transport = Arc::new(ScriptedTransport::new(vec![Ok(daily_frame())]));
        let client = Arc::new(scripted_client(transport.clone(), dir.path()));
        let pipeline = Pipeline::new(config.clone(), client)
            .with_assets(vec![find_asset("daily").unwrap()])
            .with_today(NaiveDate::from_ymd_opt(2024, 1, 5).unwrap());

        let report = pipeline.run_quality_check().await;
        assert!(report.unresolved_qa.is_empty());
        assert_eq!(transport.call_count(), 1);
        assert!(store.partition_exists("trade_date=20240104"));
    }

    #[tokio::test]
    async fn persistent_failures_survive_into_the_report() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::for_base_path(dir.path());
        seed_calendar(&config, &[("20240105", 1)]);

        // The refetch keeps failing.
        let transport = Arc::new(ScriptedTransport::new(vec![Err(anyhow::anyhow!("down"))]));
        let client = Arc::new(scripted_client(transport, dir.path()));
        let pipeline = Pipeline::new(config, client)
            .with_assets(vec![find_asset("daily").unwrap()])
            .with_today(NaiveDate::from_ymd_opt(2024, 1, 5).unwrap());

        let report = pipeline.run_quality_check().await;
        assert_eq!(report.unresolved_qa.len(), 1);
        assert_eq!(report.unresolved_qa[0].partition_key, "20240105");
        assert!(!report.is_clean());
    }

    #[tokio::test]
    async fn cancellation_stops_between_assets() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::for_base_path(dir.path());
        let transport = Arc::new(ScriptedTransport::new(vec![]));
        let client = Arc::new(scripted_client(transport.clone(), dir.path()));
        let pipeline = Pipeline::new(config, client)
            .with_assets(vec![
                find_asset("stock_basic").unwrap(),
                find_asset("index_basic").unwrap(),
            ])
            .with_today(NaiveDate::from_ymd_opt(2024, 1, 5).unwrap());

        pipeline.cancel_flag().store(true, Ordering::Relaxed);
        let report = pipeline.sweep(Mode::Update).await;
        assert!(report.failed_assets.is_empty());
        assert_eq!(transport.call_count(), 0);
    }
}
