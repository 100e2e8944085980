//! Period archiver.
//!
//! Traverses fiscal-quarter keys (`YYYY0331`, `YYYY0630`, `YYYY0930`,
//! `YYYY1231`) for statement-style datasets. Each key is versioned on disk
//! by ingest date, so restated financials accumulate as point-in-time
//! history instead of overwriting it.

use chrono::Datelike;
use tracing::{debug, info};

use crate::client::{params, FetchStatus};
use crate::request_log::LogStatus;
use crate::storage::{period_leaf, period_version_leaf, PartitionMetadata};

use super::ArchiverCtx;

pub const DEFAULT_LOOKBACK_QUARTERS: u32 = 12;

const QUARTER_END_MONTH_DAY: [&str; 4] = ["0331", "0630", "0930", "1231"];

pub struct PeriodArchiver {
    ctx: ArchiverCtx,
    start_year: i32,
    lookback_quarters: u32,
}

impl PeriodArchiver {
    pub fn new(ctx: ArchiverCtx, start_year: i32, lookback_quarters: u32) -> PeriodArchiver {
        PeriodArchiver {
            ctx,
            start_year,
            lookback_quarters,
        }
    }

    /// All quarter-end keys from the origin year through the current
    /// quarter. Exactly four per fully elapsed year, at most four for the
    /// current one.
    pub fn generate_quarters(&self) -> Vec<String> {
        generate_quarters(self.start_year, self.ctx.today.year(), self.ctx.today.month())
    }

    /// Fetch every quarter not yet on disk. The `period=` directory is the
    /// resume marker, so an interrupted backfill picks up where it stopped.
    pub async fn backfill(&self) -> anyhow::Result<()> {
        info!(data_type = %self.ctx.data_type, "starting period backfill");
        for period in self.generate_quarters() {
            if self.ctx.cancelled() {
                info!(data_type = %self.ctx.data_type, "backfill cancelled");
                break;
            }
            if self.ctx.store.partition_exists(&period_leaf(&period)) {
                debug!(period, "already on disk, skipping");
                continue;
            }
            self.process_period(&period, false).await;
        }
        Ok(())
    }

    /// Re-fetch the trailing quarters and version any restatements. An
    /// unchanged checksum is logged as `no_change` and writes nothing.
    pub async fn update(&self) -> anyhow::Result<()> {
        info!(
            data_type = %self.ctx.data_type,
            lookback = self.lookback_quarters,
            "starting period update"
        );
        let quarters = self.generate_quarters();
        let skip = quarters.len().saturating_sub(self.lookback_quarters as usize);
        for period in &quarters[skip..] {
            if self.ctx.cancelled() {
                info!(data_type = %self.ctx.data_type, "update cancelled");
                break;
            }
            self.process_period(period, true).await;
        }
        Ok(())
    }

    /// One key through the full process contract.
    pub async fn process_period(&self, period: &str, is_update: bool) {
        let request = params(&[("period", period)]);
        let (frame, status) = self.ctx.fetch(&request).await;

        if status == FetchStatus::Error {
            self.ctx
                .log_error(period, &request, &format!("API fetch failed for period {period}"));
            return;
        }
        if frame.is_empty() {
            self.ctx.log_outcome(period, &request, &frame, LogStatus::NoData);
            debug!(period, "no data");
            return;
        }

        let new_checksum = frame.checksum();
        if is_update {
            let last = self
                .ctx
                .log
                .last_checksum(&self.ctx.data_type, period)
                .unwrap_or(None);
            if last.as_deref() == Some(new_checksum.as_str()) {
                self.ctx.log_outcome(period, &request, &frame, LogStatus::NoChange);
                debug!(period, "no change");
                return;
            }
        }

        if !self.ctx.confirm_row_regression(period, &request, &frame).await {
            self.ctx.log_error(
                period,
                &request,
                &format!("row count regression unconfirmed for period {period}"),
            );
            return;
        }

        let ingest_date = self.ctx.ingest_date();
        let leaf = period_version_leaf(period, &ingest_date);
        let metadata = PartitionMetadata::for_frame(period, &ingest_date, &frame);
        let had_history = !self.ctx.store.versions(&period_leaf(period)).is_empty();

        match self.ctx.store.write_partition(&leaf, &frame, &metadata) {
            Ok(()) => {
                let status = if is_update || had_history {
                    LogStatus::Updated
                } else {
                    LogStatus::Success
                };
                self.ctx.log_outcome(period, &request, &frame, status);
                info!(
                    data_type = %self.ctx.data_type,
                    period,
                    rows = frame.row_count(),
                    status = status.as_str(),
                    "period stored"
                );
            }
            Err(e) => {
                self.ctx
                    .log_error(period, &request, &format!("failed to store period {period}: {e:#}"));
            }
        }
    }
}

/// Quarter-end keys from `start_year` through the quarter containing
/// (`current_year`, `current_month`).
pub fn generate_quarters(start_year: i32, current_year: i32, current_month: u32) -> Vec<String> {
    let current_quarter = (current_month - 1) / 3 + 1;
    let mut quarters = Vec::new();
    for year in start_year..=current_year {
        for (idx, month_day) in QUARTER_END_MONTH_DAY.iter().enumerate() {
            let quarter = idx as u32 + 1;
            if year == current_year && quarter > current_quarter {
                break;
            }
            quarters.push(format!("{year}{month_day}"));
        }
    }
    quarters
}
