//! Archiver family.
//!
//! Six traversal strategies over per-asset partition keyspaces, sharing one
//! context: the resolved endpoint binding, the partition store, the request
//! log, and the vendor client. Dispatch is a tagged enum: the manifest
//! names a kind, construction resolves everything up front, and an unknown
//! data type fails before any request is made.
//!
//! For any single partition key every variant follows the same contract:
//! compose params → fetch → on error log `error` and leave disk untouched →
//! on empty log `no_data` → checksum → (update of a versioned asset only)
//! `no_change` short-circuit → row-regression confirmation → atomic write →
//! log `success`/`updated`.

pub mod code_driven;
pub mod event_date;
pub mod index_monthly;
pub mod period;
pub mod snapshot;
pub mod trade_date;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{Local, NaiveDate};
use tracing::warn;

use crate::client::{resolve, EndpointDef, FetchStatus, ParamStyle, Params, VendorClient};
use crate::config::Config;
use crate::frame::Frame;
use crate::manifest::{ArchiverKind, Asset, DriverSource, Lookback};
use crate::request_log::{LogStatus, RequestLog};
use crate::storage::PartitionStore;

pub use code_driven::CodeDrivenArchiver;
pub use event_date::EventDateArchiver;
pub use index_monthly::IndexMonthlyArchiver;
pub use period::PeriodArchiver;
pub use snapshot::SnapshotArchiver;
pub use trade_date::TradeDateArchiver;

/// Shared state behind every archiver variant.
pub struct ArchiverCtx {
    pub data_type: String,
    pub endpoint: &'static EndpointDef,
    pub client: Arc<VendorClient>,
    pub store: PartitionStore,
    pub log: RequestLog,
    pub landing_root: PathBuf,
    pub today: NaiveDate,
    pub cancel: Arc<AtomicBool>,
}

impl ArchiverCtx {
    pub fn new(config: &Config, client: Arc<VendorClient>, data_type: &str) -> Result<ArchiverCtx> {
        let endpoint = resolve(data_type)?;
        let landing_root = config.landing_root();
        let store = PartitionStore::open(&landing_root, data_type)?;
        let log = RequestLog::open(config.log_db_path())?;
        Ok(ArchiverCtx {
            data_type: data_type.to_string(),
            endpoint,
            client,
            store,
            log,
            landing_root,
            today: Local::now().date_naive(),
            cancel: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Pin the wall-clock date (tests, replayed runs).
    pub fn with_today(mut self, today: NaiveDate) -> ArchiverCtx {
        self.today = today;
        self
    }

    pub fn with_cancel(mut self, cancel: Arc<AtomicBool>) -> ArchiverCtx {
        self.cancel = cancel;
        self
    }

    pub fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }

    /// Wall-clock date a fetch is performed on, ISO (`2024-01-05`).
    pub fn ingest_date(&self) -> String {
        self.today.format("%Y-%m-%d").to_string()
    }

    /// Today in partition-key form (`20240105`).
    pub fn today_compact(&self) -> String {
        self.today.format("%Y%m%d").to_string()
    }

    pub async fn fetch(&self, request: &Params) -> (Frame, FetchStatus) {
        self.client.fetch(self.endpoint, request).await
    }

    pub fn log_error(&self, key: &str, request: &Params, message: &str) {
        self.log.record(
            &self.data_type,
            key,
            &self.ingest_date(),
            request,
            0,
            "error",
            LogStatus::Error,
            Some(message),
        );
    }

    pub fn log_outcome(
        &self,
        key: &str,
        request: &Params,
        frame: &Frame,
        status: LogStatus,
    ) {
        self.log.record(
            &self.data_type,
            key,
            &self.ingest_date(),
            request,
            frame.row_count(),
            &frame.checksum(),
            status,
            None,
        );
    }

    /// Row-regression guard. A strict shrink versus the last logged state of
    /// the same key needs a second, agreeing fetch before it is believed.
    /// Returns `false` when the key must be aborted.
    pub async fn confirm_row_regression(
        &self,
        key: &str,
        request: &Params,
        frame: &Frame,
    ) -> bool {
        if frame.is_empty() {
            return true;
        }
        let previous = match self.log.last_row_count(&self.data_type, key) {
            Ok(Some(count)) => count,
            _ => return true,
        };
        if frame.row_count() as i64 >= previous {
            return true;
        }

        warn!(
            data_type = %self.data_type,
            key,
            previous,
            current = frame.row_count(),
            "row count shrank; issuing confirming fetch"
        );
        let (confirmation, status) = self.fetch(request).await;
        if status == FetchStatus::Error {
            return false;
        }
        confirmation.checksum() == frame.checksum()
    }
}

/// Concrete archiver, dispatched by manifest kind.
pub enum Archiver {
    Period(PeriodArchiver),
    TradeDate(TradeDateArchiver),
    EventDate(EventDateArchiver),
    Snapshot(SnapshotArchiver),
    CodeDriven(CodeDrivenArchiver),
    IndexMonthly(IndexMonthlyArchiver),
}

impl Archiver {
    /// Build the archiver an asset declares, with everything resolved.
    pub fn for_asset(
        config: &Config,
        client: Arc<VendorClient>,
        asset: &Asset,
        cancel: Arc<AtomicBool>,
        today: NaiveDate,
    ) -> Result<Archiver> {
        let ctx = ArchiverCtx::new(config, client, asset.name)?
            .with_cancel(cancel)
            .with_today(today);

        let expected_style = match asset.kind {
            ArchiverKind::Period => ParamStyle::Period,
            ArchiverKind::TradeDate => ParamStyle::TradeDate,
            ArchiverKind::EventDate => ParamStyle::EventDate,
            ArchiverKind::Snapshot => ParamStyle::FullState,
            ArchiverKind::CodeDriven => ParamStyle::Code,
            ArchiverKind::IndexMonthly => ParamStyle::IndexMonth,
        };
        if ctx.endpoint.param_style != expected_style {
            bail!(
                "asset '{}' declares kind {} but endpoint '{}' is keyed as {:?}",
                asset.name,
                asset.kind.as_str(),
                ctx.endpoint.data_type,
                ctx.endpoint.param_style
            );
        }

        Ok(match asset.kind {
            ArchiverKind::Period => {
                let start_year = parse_start_year(asset)?;
                let lookback = match asset.policy.lookback {
                    Lookback::Quarters(n) => n,
                    _ => period::DEFAULT_LOOKBACK_QUARTERS,
                };
                Archiver::Period(PeriodArchiver::new(ctx, start_year, lookback))
            }
            ArchiverKind::TradeDate => {
                let start = asset
                    .backfill_start
                    .context("trade_date asset needs a backfill_start")?;
                let lookback = match asset.policy.lookback {
                    Lookback::Days(n) => n,
                    _ => 0,
                };
                Archiver::TradeDate(TradeDateArchiver::new(ctx, start, lookback)?)
            }
            ArchiverKind::EventDate => {
                let start = asset
                    .backfill_start
                    .context("event_date asset needs a backfill_start")?;
                let lookback = match asset.policy.lookback {
                    Lookback::Days(n) => n,
                    _ => event_date::DEFAULT_LOOKBACK_DAYS,
                };
                let field = asset.date_field.unwrap_or("ann_date");
                Archiver::EventDate(EventDateArchiver::new(ctx, field, start, lookback))
            }
            ArchiverKind::Snapshot => {
                Archiver::Snapshot(SnapshotArchiver::new(ctx, snapshot::DEFAULT_RETENTION_DAYS))
            }
            ArchiverKind::CodeDriven => {
                let driver = asset
                    .driver_source
                    .context("code-driven asset needs a driver_source")?;
                Archiver::CodeDriven(CodeDrivenArchiver::new(ctx, driver))
            }
            ArchiverKind::IndexMonthly => {
                let start = asset
                    .backfill_start
                    .context("index_monthly asset needs a backfill_start")?;
                let lookback = match asset.policy.lookback {
                    Lookback::Months(n) => n,
                    _ => index_monthly::DEFAULT_LOOKBACK_MONTHS,
                };
                let indexes = match asset.driver_source {
                    Some(DriverSource::CommonIndexes) | None => {
                        crate::manifest::COMMON_INDEXES
                            .iter()
                            .map(|s| s.to_string())
                            .collect()
                    }
                    Some(DriverSource::SnapshotCodes(_)) => {
                        bail!("index_monthly assets take a static index list")
                    }
                };
                Archiver::IndexMonthly(IndexMonthlyArchiver::new(ctx, indexes, start, lookback))
            }
        })
    }

    pub fn kind(&self) -> ArchiverKind {
        match self {
            Archiver::Period(_) => ArchiverKind::Period,
            Archiver::TradeDate(_) => ArchiverKind::TradeDate,
            Archiver::EventDate(_) => ArchiverKind::EventDate,
            Archiver::Snapshot(_) => ArchiverKind::Snapshot,
            Archiver::CodeDriven(_) => ArchiverKind::CodeDriven,
            Archiver::IndexMonthly(_) => ArchiverKind::IndexMonthly,
        }
    }

    pub async fn backfill(&self) -> Result<()> {
        match self {
            Archiver::Period(a) => a.backfill().await,
            Archiver::TradeDate(a) => a.backfill(None).await,
            Archiver::EventDate(a) => a.backfill(None).await,
            Archiver::Snapshot(a) => a.backfill().await,
            Archiver::CodeDriven(a) => a.backfill().await,
            Archiver::IndexMonthly(a) => a.backfill().await,
        }
    }

    pub async fn update(&self) -> Result<()> {
        match self {
            Archiver::Period(a) => a.update().await,
            Archiver::TradeDate(a) => a.update().await,
            Archiver::EventDate(a) => a.update().await,
            Archiver::Snapshot(a) => a.update(None).await,
            Archiver::CodeDriven(a) => a.update().await,
            Archiver::IndexMonthly(a) => a.update().await,
        }
    }

    /// Reprocess exactly one partition key; the quality workflow's targeted
    /// refetch path.
    pub async fn process_one(&self, key: &str) -> Result<()> {
        match self {
            // `is_update = false` so a refetched key is written even when
            // the log still carries its checksum (the directory may be the
            // thing that went missing).
            Archiver::Period(a) => {
                a.process_period(key, false).await;
                Ok(())
            }
            Archiver::TradeDate(a) => {
                a.process_day(key).await;
                Ok(())
            }
            Archiver::EventDate(a) => {
                a.process_day(key).await;
                Ok(())
            }
            Archiver::Snapshot(a) => a.update(None).await,
            Archiver::CodeDriven(a) => {
                a.process_code(key).await;
                Ok(())
            }
            Archiver::IndexMonthly(a) => {
                let (index_code, month_end) = key
                    .rsplit_once('-')
                    .with_context(|| format!("malformed index-month key '{key}'"))?;
                a.process_month(index_code, month_end).await;
                Ok(())
            }
        }
    }
}

fn parse_start_year(asset: &Asset) -> Result<i32> {
    let start = asset
        .backfill_start
        .context("period asset needs a backfill_start")?;
    if start.len() < 4 {
        bail!("malformed backfill_start '{start}'");
    }
    start[..4]
        .parse()
        .with_context(|| format!("malformed backfill_start '{start}'"))
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::config::LimitmaxStore;
    use crate::client::{RateLimiter, VendorTransport};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::time::Duration;

    /// Transport that replays scripted frames and records every call.
    pub struct ScriptedTransport {
        responses: Mutex<Vec<Result<Frame>>>,
        pub calls: Mutex<Vec<(String, Params)>>,
        /// Returned when the script runs dry.
        fallback_empty: bool,
    }

    impl ScriptedTransport {
        pub fn new(responses: Vec<Result<Frame>>) -> ScriptedTransport {
            ScriptedTransport {
                responses: Mutex::new(responses),
                calls: Mutex::new(Vec::new()),
                fallback_empty: true,
            }
        }

        pub fn call_count(&self) -> usize {
            self.calls.lock().len()
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
                if self.fallback_empty {
                    return Ok(Frame::empty());
                }
                bail!("transport script exhausted");
            }
            responses.remove(0)
        }
    }

    pub fn scripted_client(transport: Arc<ScriptedTransport>, base: &std::path::Path) -> VendorClient {
        VendorClient::new(
            transport,
            Arc::new(RateLimiter::new(100_000)),
            Arc::new(LimitmaxStore::load(base.join("config").join("limitmax.json"))),
            // retry_count 0 keeps scripted sequences one-call-per-fetch.
            0,
            Duration::from_millis(1),
        )
    }

    pub fn ctx_for(
        config: &Config,
        client: Arc<VendorClient>,
        data_type: &str,
        today: NaiveDate,
    ) -> ArchiverCtx {
        ArchiverCtx::new(config, client, data_type)
            .unwrap()
            .with_today(today)
    }
}
