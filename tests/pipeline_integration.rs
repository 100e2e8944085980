//! End-to-end pipeline scenarios against a scripted vendor transport.
//!
//! Each test drives the real orchestrator/archiver/storage/log stack over a
//! tempdir data root; only the outermost transport is scripted.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::NaiveDate;
use parking_lot::Mutex;

use tickvault::client::{Params, RateLimiter, VendorClient, VendorTransport};
use tickvault::config::{Config, LimitmaxStore};
use tickvault::frame::{Cell, Frame};
use tickvault::manifest::{find_asset, Asset};
use tickvault::pipeline::Pipeline;
use tickvault::request_log::RequestLog;
use tickvault::storage::{
    snapshot_leaf, trade_date_leaf, PartitionMetadata, PartitionStore,
};

// ----------------------------------------------------------------------
// Scripted transport
// ----------------------------------------------------------------------

struct ScriptedTransport {
    responses: Mutex<Vec<Result<Frame>>>,
    calls: Mutex<Vec<(String, Params)>>,
}

impl ScriptedTransport {
    fn new(responses: Vec<Result<Frame>>) -> Arc<ScriptedTransport> {
        Arc::new(ScriptedTransport {
            responses: Mutex::new(responses),
            calls: Mutex::new(Vec::new()),
        })
    }

    fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    fn requested_keys(&self, param: &str) -> Vec<String> {
        self.calls
            .lock()
            .iter()
            .filter_map(|(_, p)| p.get(param).cloned())
            .collect()
    }
}

#[async_trait]
impl VendorTransport for ScriptedTransport {
    async fn call(&self, api_name: &str, params: &Params) -> Result<Frame> {
        self.calls
            .lock()
            .push((api_name.to_string(), params.clone()));
        let mut responses = self.responses.lock();
        if responses.is_empty() {
            return Ok(Frame::empty());
        }
        responses.remove(0)
    }
}

fn client_for(transport: Arc<ScriptedTransport>, config: &Config) -> Arc<VendorClient> {
    Arc::new(VendorClient::new(
        transport,
        Arc::new(RateLimiter::new(100_000)),
        Arc::new(LimitmaxStore::load(config.limitmax_path())),
        0,
        Duration::from_millis(1),
    ))
}

// ----------------------------------------------------------------------
// Fixtures
// ----------------------------------------------------------------------

fn income_frame(rows: usize) -> Frame {
    Frame::new(
        vec!["ts_code".into(), "end_date".into(), "revenue".into()],
        (0..rows)
            .map(|i| {
                vec![
                    Cell::Str(format!("{:06}.SZ", i)),
                    Cell::Str("20230331".into()),
                    Cell::Float(1_000_000.0 + i as f64),
                ]
            })
            .collect(),
    )
}

fn daily_frame(trade_date: &str) -> Frame {
    Frame::new(
        vec!["ts_code".into(), "trade_date".into(), "close".into()],
        vec![
            vec![
                Cell::Str("000001.SZ".into()),
                Cell::Str(trade_date.to_string()),
                Cell::Float(10.52),
            ],
            vec![
                Cell::Str("600000.SH".into()),
                Cell::Str(trade_date.to_string()),
                Cell::Float(7.31),
            ],
        ],
    )
}

fn trade_cal_frame(days: &[(&str, i64)]) -> Frame {
    Frame::new(
        vec!["exchange".into(), "cal_date".into(), "is_open".into()],
        days.iter()
            .map(|(date, open)| {
                vec![
                    Cell::Str("SSE".into()),
                    Cell::Str(date.to_string()),
                    Cell::Int(*open),
                ]
            })
            .collect(),
    )
}

fn income_asset_from_2022() -> Asset {
    Asset {
        backfill_start: Some("20220101"),
        ..find_asset("income").unwrap()
    }
}

// ----------------------------------------------------------------------
// Scenarios
// ----------------------------------------------------------------------

/// Fresh period backfill lands a versioned parquet partition, a sidecar
/// whose checksum matches, and a `success` log row; the automatic QA sweep
/// comes back clean.
#[tokio::test]
async fn period_backfill_into_fresh_directory() {
    let dir = tempfile::tempdir().unwrap();
    let config = Config::for_base_path(dir.path());
    let today = NaiveDate::from_ymd_opt(2023, 4, 2).unwrap();

    // Six quarters: 2022 Q1-Q4 plus 2023 Q1-Q2 (Q2 in progress).
    let responses = (0..6).map(|_| Ok(income_frame(50))).collect();
    let transport = ScriptedTransport::new(responses);
    let pipeline = Pipeline::new(config.clone(), client_for(transport.clone(), &config))
        .with_assets(vec![income_asset_from_2022()])
        .with_today(today);

    let report = pipeline.run_backfill().await;
    assert!(report.is_clean(), "unexpected failures: {report:?}");
    assert_eq!(transport.call_count(), 6);

    let store = PartitionStore::open(&config.landing_root(), "income").unwrap();
    let leaf = "period=20230331/ingest_date=2023-04-02";
    let frame = store.read_partition_frame(leaf).unwrap().unwrap();
    assert_eq!(frame.row_count(), 50);

    let metadata = store.read_metadata(leaf).unwrap().unwrap();
    assert_eq!(metadata.partition_key, "20230331");
    assert_eq!(metadata.row_count, 50);
    assert_eq!(metadata.checksum.len(), 32);
    assert!(metadata.checksum.chars().all(|c| c.is_ascii_hexdigit()));
    // The sidecar checksum is the checksum of the stored file.
    assert_eq!(metadata.checksum, frame.checksum());

    let log = RequestLog::open(config.log_db_path()).unwrap();
    let success_rows: Vec<_> = log
        .history("income", None)
        .unwrap()
        .into_iter()
        .filter(|r| r.partition_key == "20230331")
        .collect();
    assert_eq!(success_rows.len(), 1);
    assert_eq!(success_rows[0].status, "success");
}

/// Re-running update the next day with identical vendor output creates no
/// new version directory and logs `no_change` with the same checksum.
#[tokio::test]
async fn period_update_with_stable_vendor_data_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let config = Config::for_base_path(dir.path());
    let asset = income_asset_from_2022();

    let day1 = NaiveDate::from_ymd_opt(2023, 4, 2).unwrap();
    let responses = (0..6).map(|_| Ok(income_frame(50))).collect();
    let transport = ScriptedTransport::new(responses);
    let pipeline = Pipeline::new(config.clone(), client_for(transport, &config))
        .with_assets(vec![asset])
        .with_today(day1);
    assert!(pipeline.run_backfill().await.is_clean());

    // Next day: identical data for every quarter in the lookback.
    let day2 = NaiveDate::from_ymd_opt(2023, 4, 3).unwrap();
    let responses = (0..6).map(|_| Ok(income_frame(50))).collect();
    let transport = ScriptedTransport::new(responses);
    let pipeline = Pipeline::new(config.clone(), client_for(transport, &config))
        .with_assets(vec![asset])
        .with_today(day2);
    assert!(pipeline.run_update().await.is_clean());

    let store = PartitionStore::open(&config.landing_root(), "income").unwrap();
    // Still exactly one version per key.
    assert_eq!(
        store.versions("period=20230331"),
        vec!["ingest_date=2023-04-02"]
    );

    let log = RequestLog::open(config.log_db_path()).unwrap();
    let rows: Vec<_> = log
        .history("income", None)
        .unwrap()
        .into_iter()
        .filter(|r| r.partition_key == "20230331")
        .collect();
    assert_eq!(rows.len(), 2);
    let day2_row = rows.iter().find(|r| r.ingest_date == "2023-04-03").unwrap();
    assert_eq!(day2_row.status, "no_change");
    let day1_row = rows.iter().find(|r| r.ingest_date == "2023-04-02").unwrap();
    assert_eq!(day2_row.checksum, day1_row.checksum);
}

/// The trade_cal snapshot is refreshed first, then the trade-date asset
/// traverses only open days: a holiday gets no fetch, no directory, and no
/// log row.
#[tokio::test]
async fn update_sweep_resolves_calendar_dependency_and_skips_holidays() {
    let dir = tempfile::tempdir().unwrap();
    let config = Config::for_base_path(dir.path());
    let today = NaiveDate::from_ymd_opt(2024, 1, 5).unwrap();

    let responses = vec![
        // trade_cal snapshot fetch.
        Ok(trade_cal_frame(&[
            ("20240101", 0),
            ("20240102", 1),
            ("20240103", 1),
            ("20240104", 1),
            ("20240105", 1),
        ])),
        // daily fetches for the four open days.
        Ok(daily_frame("20240102")),
        Ok(daily_frame("20240103")),
        Ok(daily_frame("20240104")),
        Ok(daily_frame("20240105")),
    ];
    let transport = ScriptedTransport::new(responses);
    let pipeline = Pipeline::new(config.clone(), client_for(transport.clone(), &config))
        .with_assets(vec![
            find_asset("trade_cal").unwrap(),
            find_asset("daily").unwrap(),
        ])
        .with_today(today);

    let report = pipeline.run_update().await;
    assert!(report.is_clean(), "unexpected failures: {report:?}");

    let requested = transport.requested_keys("trade_date");
    assert_eq!(
        requested,
        vec!["20240102", "20240103", "20240104", "20240105"]
    );

    let store = PartitionStore::open(&config.landing_root(), "daily").unwrap();
    assert!(!store.partition_exists(&trade_date_leaf("20240101")));
    assert!(store.partition_exists(&trade_date_leaf("20240105")));

    let log = RequestLog::open(config.log_db_path()).unwrap();
    assert!(log
        .history("daily", None)
        .unwrap()
        .iter()
        .all(|r| r.partition_key != "20240101"));
}

/// Deleting a trading-day partition and running quality_check restores it
/// through the targeted refetch, ending with a clean report.
#[tokio::test]
async fn quality_check_restores_deleted_partition() {
    let dir = tempfile::tempdir().unwrap();
    let config = Config::for_base_path(dir.path());
    let today = NaiveDate::from_ymd_opt(2024, 1, 5).unwrap();

    // Seed the calendar snapshot and both daily partitions directly.
    let cal_store = PartitionStore::open(&config.landing_root(), "trade_cal").unwrap();
    let cal = trade_cal_frame(&[("20240104", 1), ("20240105", 1)]);
    cal_store
        .write_partition(
            &snapshot_leaf("20240105"),
            &cal,
            &PartitionMetadata::for_frame("20240105", "2024-01-05", &cal),
        )
        .unwrap();

    let store = PartitionStore::open(&config.landing_root(), "daily").unwrap();
    for day in ["20240104", "20240105"] {
        let frame = daily_frame(day);
        store
            .write_partition(
                &trade_date_leaf(day),
                &frame,
                &PartitionMetadata::for_frame(day, "2024-01-05", &frame),
            )
            .unwrap();
    }

    // Simulate the loss of one partition.
    store.remove_partition(&trade_date_leaf("20240104")).unwrap();

    let transport = ScriptedTransport::new(vec![Ok(daily_frame("20240104"))]);
    let pipeline = Pipeline::new(config.clone(), client_for(transport.clone(), &config))
        .with_assets(vec![
            find_asset("trade_cal").unwrap(),
            find_asset("daily").unwrap(),
        ])
        .with_today(today);

    let report = pipeline.run_quality_check().await;
    assert!(report.is_clean(), "failures persisted: {report:?}");

    // Exactly one targeted fetch, for the deleted day.
    assert_eq!(transport.requested_keys("trade_date"), vec!["20240104"]);
    assert!(store.partition_exists(&trade_date_leaf("20240104")));
    let restored = store
        .read_partition_frame(&trade_date_leaf("20240104"))
        .unwrap()
        .unwrap();
    assert_eq!(restored.row_count(), 2);
}

/// A vendor outage mid-backfill leaves earlier keys intact; the next run
/// picks up only what is missing (resume idempotence), and a fully-landed
/// keyspace triggers zero fetches.
#[tokio::test]
async fn backfill_resumes_after_partial_failure() {
    let dir = tempfile::tempdir().unwrap();
    let config = Config::for_base_path(dir.path());
    let asset = income_asset_from_2022();
    let today = NaiveDate::from_ymd_opt(2022, 12, 31).unwrap();

    // Q1 and Q2 land, Q3 errors, Q4 errors.
    let responses = vec![
        Ok(income_frame(40)),
        Ok(income_frame(41)),
        Err(anyhow::anyhow!("gateway timeout")),
        Err(anyhow::anyhow!("gateway timeout")),
    ];
    let transport = ScriptedTransport::new(responses);
    let pipeline = Pipeline::new(config.clone(), client_for(transport, &config))
        .with_assets(vec![asset])
        .with_today(today);
    let report = pipeline.run_backfill().await;
    // The asset itself did not fail; the failed keys are logged `error` and
    // surface through QA instead.
    assert!(report.failed_assets.is_empty());
    assert_eq!(report.unresolved_qa.len(), 2);

    // Second run: only Q3 and Q4 are fetched, and both land.
    let responses = vec![Ok(income_frame(42)), Ok(income_frame(43))];
    let transport = ScriptedTransport::new(responses);
    let pipeline = Pipeline::new(config.clone(), client_for(transport.clone(), &config))
        .with_assets(vec![asset])
        .with_today(today);
    let report = pipeline.run_backfill().await;
    assert!(report.is_clean(), "unexpected failures: {report:?}");
    assert_eq!(
        transport.requested_keys("period"),
        vec!["20220930", "20221231"]
    );

    // Third run: nothing to do.
    let transport = ScriptedTransport::new(vec![]);
    let pipeline = Pipeline::new(config.clone(), client_for(transport.clone(), &config))
        .with_assets(vec![asset])
        .with_today(today);
    assert!(pipeline.run_backfill().await.is_clean());
    assert_eq!(transport.call_count(), 0);
}

/// Invariant sweep over a populated tree: every leaf directory carries a
/// sidecar, and a sidecar with `row_count > 0` sits next to a data file
/// whose recomputed canonical checksum matches the stored one.
#[tokio::test]
async fn stored_checksums_match_recomputed_content() {
    let dir = tempfile::tempdir().unwrap();
    let config = Config::for_base_path(dir.path());
    let today = NaiveDate::from_ymd_opt(2022, 12, 31).unwrap();

    // Three quarters with data, one known-empty.
    let responses = vec![
        Ok(income_frame(40)),
        Ok(income_frame(41)),
        Ok(income_frame(42)),
        Ok(Frame::empty()),
    ];
    let transport = ScriptedTransport::new(responses);
    let pipeline = Pipeline::new(config.clone(), client_for(transport, &config))
        .with_assets(vec![income_asset_from_2022()])
        .with_today(today);
    pipeline.run_backfill().await;

    let mut leaves_checked = 0usize;
    let mut stack = vec![config.landing_root().join("income")];
    while let Some(current) = stack.pop() {
        let sidecar = current.join("metadata.json");
        if sidecar.exists() {
            let metadata: tickvault::storage::PartitionMetadata =
                serde_json::from_str(&std::fs::read_to_string(&sidecar).unwrap()).unwrap();
            let data_file = current.join("data.parquet");
            if metadata.row_count > 0 {
                let frame = Frame::read_parquet(&data_file).unwrap();
                assert_eq!(frame.row_count(), metadata.row_count);
                assert_eq!(frame.checksum(), metadata.checksum);
            } else {
                assert!(!data_file.exists());
                assert_eq!(metadata.checksum, "empty");
            }
            leaves_checked += 1;
        }
        for entry in std::fs::read_dir(&current).unwrap() {
            let path = entry.unwrap().path();
            if path.is_dir() {
                stack.push(path);
            }
        }
    }
    // 2022 Q1-Q3 landed with data; Q4 logged no_data and wrote nothing.
    assert_eq!(leaves_checked, 3);
}
