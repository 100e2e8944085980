//! Trade-date archiver.
//!
//! Traverses the exchange trading calendar, one partition per open day. The
//! calendar comes from the local `trade_cal` snapshot, never the vendor;
//! the manifest refreshes that snapshot before any trade-date asset runs.
//! Non-trading days are skipped entirely: no fetch, no directory, no log
//! row.

use anyhow::Result;
use tracing::{debug, info, warn};

use crate::calendar::TradingCalendar;
use crate::client::{params, FetchStatus};
use crate::frame::Frame;
use crate::request_log::LogStatus;
use crate::storage::{trade_date_leaf, PartitionMetadata};

use super::ArchiverCtx;

pub struct TradeDateArchiver {
    ctx: ArchiverCtx,
    start_date: String,
    /// Update window; 0 selects resume-from-last-processed semantics.
    lookback_days: u32,
    calendar: TradingCalendar,
}

impl TradeDateArchiver {
    /// Loading the calendar here makes a missing `trade_cal` snapshot a
    /// construction-time failure with a clear message, not a mid-sweep one.
    pub fn new(ctx: ArchiverCtx, start_date: &str, lookback_days: u32) -> Result<TradeDateArchiver> {
        let calendar = TradingCalendar::load(&ctx.landing_root)?;
        Ok(TradeDateArchiver {
            ctx,
            start_date: start_date.to_string(),
            lookback_days,
            calendar,
        })
    }

    /// Every trading day from the origin (or `start_override`) through
    /// today that is not already on disk.
    pub async fn backfill(&self, start_override: Option<&str>) -> Result<()> {
        let start = start_override.unwrap_or(&self.start_date);
        let today = self.ctx.today_compact();
        info!(
            data_type = %self.ctx.data_type,
            start,
            "starting trade-date backfill"
        );

        for day in self.calendar.open_days_between(start, &today) {
            if self.ctx.cancelled() {
                info!(data_type = %self.ctx.data_type, "backfill cancelled");
                break;
            }
            if self.ctx.store.partition_exists(&trade_date_leaf(&day)) {
                debug!(day, "already on disk, skipping");
                continue;
            }
            self.process_day(&day).await;
        }
        Ok(())
    }

    /// Reprocess the trailing window of trading days unconditionally
    /// (overwrite semantics). With no window configured, resume from the
    /// first trading day after the newest partition on disk.
    pub async fn update(&self) -> Result<()> {
        if self.lookback_days == 0 {
            return self.resume_update().await;
        }
        let today = self.ctx.today_compact();
        let days = self
            .calendar
            .last_open_days(&today, self.lookback_days as usize);
        info!(
            data_type = %self.ctx.data_type,
            lookback = self.lookback_days,
            days = days.len(),
            "starting trade-date update"
        );
        for day in days {
            if self.ctx.cancelled() {
                info!(data_type = %self.ctx.data_type, "update cancelled");
                break;
            }
            self.process_day(&day).await;
        }
        Ok(())
    }

    async fn resume_update(&self) -> Result<()> {
        let last_on_disk = self
            .ctx
            .store
            .list_partitions()
            .into_iter()
            .filter_map(|name| {
                name.strip_prefix("trade_date=").map(|value| value.to_string())
            })
            .max();

        match last_on_disk {
            Some(last) => match self.calendar.next_open_day(&last) {
                Some(next) => {
                    info!(
                        data_type = %self.ctx.data_type,
                        last, next, "resuming from next trading day"
                    );
                    self.backfill(Some(&next)).await
                }
                None => {
                    info!(data_type = %self.ctx.data_type, "already up to date");
                    Ok(())
                }
            },
            None => {
                info!(data_type = %self.ctx.data_type, "no previous data; running full backfill");
                self.backfill(None).await
            }
        }
    }

    /// One trading day through the process contract, with the
    /// suspicious-empty guard: an empty frame on a day the calendar says is
    /// open, for an asset that has produced data before, gets one confirming
    /// fetch before being believed.
    pub async fn process_day(&self, trade_date: &str) {
        let request = params(&[("trade_date", trade_date)]);
        let (mut frame, status) = self.ctx.fetch(&request).await;

        if status == FetchStatus::Error {
            self.ctx
                .log_error(trade_date, &request, &format!("API fetch failed for {trade_date}"));
            return;
        }

        if frame.is_empty() && self.calendar.is_open(trade_date) && self.asset_has_history() {
            warn!(
                data_type = %self.ctx.data_type,
                trade_date,
                "empty frame on a trading day with prior history; confirming"
            );
            let (confirmed, confirm_status) = self.ctx.fetch(&request).await;
            if confirm_status == FetchStatus::Error {
                self.ctx.log_error(
                    trade_date,
                    &request,
                    &format!("confirming fetch failed for {trade_date}"),
                );
                return;
            }
            frame = confirmed;
        }

        if frame.is_empty() {
            self.write_empty(trade_date, &request);
            return;
        }

        if !self
            .ctx
            .confirm_row_regression(trade_date, &request, &frame)
            .await
        {
            self.ctx.log_error(
                trade_date,
                &request,
                &format!("row count regression unconfirmed for {trade_date}"),
            );
            return;
        }

        let leaf = trade_date_leaf(trade_date);
        let existed = self.ctx.store.partition_exists(&leaf);
        let metadata = PartitionMetadata::for_frame(trade_date, &self.ctx.ingest_date(), &frame);
        match self.ctx.store.write_partition(&leaf, &frame, &metadata) {
            Ok(()) => {
                let status = if existed { LogStatus::Updated } else { LogStatus::Success };
                self.ctx.log_outcome(trade_date, &request, &frame, status);
                info!(
                    data_type = %self.ctx.data_type,
                    trade_date,
                    rows = frame.row_count(),
                    "trading day stored"
                );
            }
            Err(e) => {
                self.ctx.log_error(
                    trade_date,
                    &request,
                    &format!("failed to store {trade_date}: {e:#}"),
                );
            }
        }
    }

    fn write_empty(&self, trade_date: &str, request: &crate::client::Params) {
        let leaf = trade_date_leaf(trade_date);
        if let Err(e) = self
            .ctx
            .store
            .write_empty_partition(&leaf, trade_date, &self.ctx.ingest_date())
        {
            self.ctx.log_error(
                trade_date,
                request,
                &format!("failed to store empty partition for {trade_date}: {e:#}"),
            );
            return;
        }
        self.ctx
            .log_outcome(trade_date, request, &Frame::empty(), LogStatus::NoData);
        debug!(trade_date, "no data");
    }

    /// Whether any prior fetch of this asset produced rows; gates the
    /// suspicious-empty guard so sparsely-populated young assets are not
    /// hammered with confirmations.
    fn asset_has_history(&self) -> bool {
        matches!(
            self.ctx
                .log
                .last_success_ingest_date(&self.ctx.data_type),
            Ok(Some(_))
        )
    }
}
