//! Data quality checker.
//!
//! Computes the partition set each asset is *expected* to have (quarters
//! within the reporting lookback, trading days within the daily lookback,
//! a current snapshot) and reports what is missing or unreadable on disk.
//! Event-date assets are exempt: an empty day is valid, so absence proves
//! nothing.

use anyhow::Result;
use chrono::{Datelike, Months, NaiveDate};
use tracing::{info, warn};

use crate::archivers::period::generate_quarters;
use crate::calendar::TradingCalendar;
use crate::config::Config;
use crate::manifest::{ArchiverKind, Asset, Lookback};
use crate::request_log::RequestLog;
use crate::storage::{period_leaf, trade_date_leaf, PartitionStore};

/// Expected reporting window when a period asset's policy does not carry a
/// month lookback.
const DEFAULT_PERIOD_LOOKBACK_MONTHS: u32 = 8;
const DEFAULT_TRADE_DATE_LOOKBACK_DAYS: u32 = 30;

#[derive(Debug, Clone)]
pub struct QaFailure {
    pub asset: Asset,
    pub partition_key: String,
    pub reason: String,
}

impl std::fmt::Display for QaFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "asset '{}' partition '{}': {}",
            self.asset.name, self.partition_key, self.reason
        )
    }
}

pub struct QualityChecker {
    config: Config,
    assets: Vec<Asset>,
    today: NaiveDate,
}

impl QualityChecker {
    pub fn new(config: Config, assets: Vec<Asset>, today: NaiveDate) -> QualityChecker {
        QualityChecker {
            config,
            assets,
            today,
        }
    }

    /// Run every defined check; returns the failures, empty when clean.
    pub fn run_checks(&self) -> Vec<QaFailure> {
        info!("starting data quality check");
        let mut failures = Vec::new();
        for asset in &self.assets {
            let result = match asset.kind {
                ArchiverKind::Period => self.check_period(asset),
                ArchiverKind::TradeDate => self.check_trade_date(asset),
                ArchiverKind::Snapshot => self.check_snapshot(asset),
                // Event-driven and whole-history assets have no completeness
                // contract to verify.
                ArchiverKind::EventDate
                | ArchiverKind::CodeDriven
                | ArchiverKind::IndexMonthly => Ok(Vec::new()),
            };
            match result {
                Ok(mut asset_failures) => failures.append(&mut asset_failures),
                Err(e) => {
                    warn!(asset = asset.name, "quality check skipped: {e:#}");
                }
            }
        }
        info!(failures = failures.len(), "data quality check complete");
        failures
    }

    fn store_for(&self, asset: &Asset) -> Result<PartitionStore> {
        PartitionStore::open(&self.config.landing_root(), asset.name)
    }

    /// Every expected quarter in the reporting window must resolve to a
    /// readable, non-empty partition.
    fn check_period(&self, asset: &Asset) -> Result<Vec<QaFailure>> {
        let lookback_months = match asset.policy.lookback {
            Lookback::Months(n) => n,
            _ => DEFAULT_PERIOD_LOOKBACK_MONTHS,
        };
        let window_start = self.today - Months::new(lookback_months);
        let start_compact = window_start.format("%Y%m%d").to_string();
        let today_compact = self.today.format("%Y%m%d").to_string();

        // Quarter-end keys inside the window; a quarter whose end date has
        // not arrived yet cannot be missing.
        let expected: Vec<String> =
            generate_quarters(window_start.year(), self.today.year(), self.today.month())
                .into_iter()
                .filter(|key| *key >= start_compact && *key <= today_compact)
                .collect();

        let store = self.store_for(asset)?;
        let log = RequestLog::open(self.config.log_db_path())?;
        let mut failures = Vec::new();
        for key in expected {
            let readable = store
                .read_latest(&period_leaf(&key))?
                .map(|frame| !frame.is_empty())
                .unwrap_or(false);
            if !readable {
                failures.push(QaFailure {
                    asset: *asset,
                    partition_key: key,
                    reason: "missing or empty".to_string(),
                });
                continue;
            }
            // The partition must also be accounted for in the request log.
            if log.last_checksum(asset.name, &key)?.is_none() {
                failures.push(QaFailure {
                    asset: *asset,
                    partition_key: key,
                    reason: "no successful log record".to_string(),
                });
            }
        }
        Ok(failures)
    }

    /// Every trading day in the lookback window must be on disk.
    fn check_trade_date(&self, asset: &Asset) -> Result<Vec<QaFailure>> {
        let lookback_days = match asset.policy.lookback {
            Lookback::Days(n) => n,
            _ => DEFAULT_TRADE_DATE_LOOKBACK_DAYS,
        };
        let calendar = TradingCalendar::load(&self.config.landing_root())?;
        let window_start = self.today - chrono::Duration::days(lookback_days as i64);
        let expected = calendar.open_days_between(
            &window_start.format("%Y%m%d").to_string(),
            &self.today.format("%Y%m%d").to_string(),
        );

        let store = self.store_for(asset)?;
        let mut failures = Vec::new();
        for day in expected {
            let readable = store
                .read_latest(&trade_date_leaf(&day))?
                .map(|frame| !frame.is_empty())
                .unwrap_or(false);
            if !readable {
                failures.push(QaFailure {
                    asset: *asset,
                    partition_key: day,
                    reason: "missing or empty".to_string(),
                });
            }
        }
        Ok(failures)
    }

    /// The latest snapshot must exist and be non-empty.
    fn check_snapshot(&self, asset: &Asset) -> Result<Vec<QaFailure>> {
        let store = self.store_for(asset)?;
        let healthy = store
            .read_latest_snapshot()?
            .map(|(_, frame)| !frame.is_empty())
            .unwrap_or(false);
        if healthy {
            Ok(Vec::new())
        } else {
            Ok(vec![QaFailure {
                asset: *asset,
                partition_key: "latest".to_string(),
                reason: "missing or empty".to_string(),
            }])
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{Cell, Frame};
    use crate::manifest::{find_asset, UpdatePolicy};
    use crate::storage::{snapshot_leaf, PartitionMetadata};

    fn write_frame(store: &PartitionStore, leaf: &str, key: &str) {
        let frame = Frame::new(
            vec!["ts_code".into(), "value".into()],
            vec![vec![Cell::Str("000001.SZ".into()), Cell::Int(1)]],
        );
        let meta = PartitionMetadata::for_frame(key, "2024-01-05", &frame);
        store.write_partition(leaf, &frame, &meta).unwrap();
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

    #[test]
    fn snapshot_check_flags_missing_asset() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::for_base_path(dir.path());
        let asset = find_asset("stock_basic").unwrap();
        let checker = QualityChecker::new(
            config.clone(),
            vec![asset],
            NaiveDate::from_ymd_opt(2024, 1, 5).unwrap(),
        );
        let failures = checker.run_checks();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].partition_key, "latest");

        // Seed a snapshot; the check passes.
        let store = PartitionStore::open(&config.landing_root(), "stock_basic").unwrap();
        write_frame(&store, &snapshot_leaf("20240105"), "20240105");
        assert!(checker.run_checks().is_empty());
    }

    #[test]
    fn trade_date_check_flags_missing_open_days_only() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::for_base_path(dir.path());
        seed_calendar(
            &config,
            &[("20240103", 1), ("20240104", 0), ("20240105", 1)],
        );

        let asset = find_asset("daily").unwrap();
        let store = PartitionStore::open(&config.landing_root(), "daily").unwrap();
        write_frame(&store, &trade_date_leaf("20240103"), "20240103");

        let checker = QualityChecker::new(
            config,
            vec![asset],
            NaiveDate::from_ymd_opt(2024, 1, 5).unwrap(),
        );
        let failures = checker.run_checks();
        // 20240105 open and missing; 20240104 closed and ignored.
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].partition_key, "20240105");
    }

    #[test]
    fn period_check_expects_quarters_in_window() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::for_base_path(dir.path());
        let asset = Asset {
            policy: UpdatePolicy {
                lookback: Lookback::Months(8),
                run_window: None,
            },
            ..find_asset("income").unwrap()
        };

        let today = NaiveDate::from_ymd_opt(2023, 11, 15).unwrap();
        let checker = QualityChecker::new(config.clone(), vec![asset], today);

        // Window start 2023-03-15: expected quarters 20230331..20230930.
        let failures = checker.run_checks();
        let keys: Vec<_> = failures.iter().map(|f| f.partition_key.clone()).collect();
        assert_eq!(keys, vec!["20230331", "20230630", "20230930"]);

        // Land the missing quarters on disk only: the disk failure clears
        // but the log condition still flags them.
        let store = PartitionStore::open(&config.landing_root(), "income").unwrap();
        for key in ["20230331", "20230630", "20230930"] {
            write_frame(
                &store,
                &crate::storage::period_version_leaf(key, "2023-11-15"),
                key,
            );
        }
        let failures = checker.run_checks();
        assert_eq!(failures.len(), 3);
        assert!(failures.iter().all(|f| f.reason == "no successful log record"));

        // Record the ingests; the check clears completely.
        let log = crate::request_log::RequestLog::open(config.log_db_path()).unwrap();
        for key in ["20230331", "20230630", "20230930"] {
            log.record(
                "income",
                key,
                "2023-11-15",
                &crate::client::Params::new(),
                1,
                "0123456789abcdef0123456789abcdef",
                crate::request_log::LogStatus::Success,
                None,
            );
        }
        assert!(checker.run_checks().is_empty());
    }

    #[test]
    fn event_date_assets_are_exempt() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::for_base_path(dir.path());
        let asset = find_asset("dividend").unwrap();
        let checker = QualityChecker::new(
            config,
            vec![asset],
            NaiveDate::from_ymd_opt(2024, 1, 5).unwrap(),
        );
        assert!(checker.run_checks().is_empty());
    }
}
