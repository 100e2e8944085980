//! Event-date archiver.
//!
//! Traverses every calendar day, not only trading days: announcement-driven
//! datasets (dividends, restatements) can land on any date, and an empty
//! day is a legitimate, archivable fact. The date field is configurable;
//! it names both the request parameter and the directory prefix.

use anyhow::Result;
use chrono::{Duration, NaiveDate};
use tracing::{debug, info};

use crate::client::{FetchStatus, Params};
use crate::frame::Frame;
use crate::request_log::LogStatus;
use crate::storage::{event_date_leaf, PartitionMetadata};

use super::ArchiverCtx;

pub const DEFAULT_LOOKBACK_DAYS: u32 = 30;

pub struct EventDateArchiver {
    ctx: ArchiverCtx,
    date_field: String,
    start_date: String,
    lookback_days: u32,
}

impl EventDateArchiver {
    pub fn new(
        ctx: ArchiverCtx,
        date_field: &str,
        start_date: &str,
        lookback_days: u32,
    ) -> EventDateArchiver {
        EventDateArchiver {
            ctx,
            date_field: date_field.to_string(),
            start_date: start_date.to_string(),
            lookback_days,
        }
    }

    fn request_for(&self, date: &str) -> Params {
        let mut request = Params::new();
        request.insert(self.date_field.clone(), date.to_string());
        request
    }

    fn leaf_for(&self, date: &str) -> String {
        event_date_leaf(&self.date_field, date)
    }

    /// Process only the dates missing from disk, oldest first.
    pub async fn backfill(&self, start_override: Option<&str>) -> Result<()> {
        let start = start_override.unwrap_or(&self.start_date);
        info!(
            data_type = %self.ctx.data_type,
            start,
            "starting event-date backfill"
        );

        let mut missing = Vec::new();
        for date in date_range(start, &self.ctx.today_compact())? {
            if !self.ctx.store.partition_exists(&self.leaf_for(&date)) {
                missing.push(date);
            }
        }
        info!(
            data_type = %self.ctx.data_type,
            remaining = missing.len(),
            "dates to process"
        );

        for date in missing {
            if self.ctx.cancelled() {
                info!(data_type = %self.ctx.data_type, "backfill cancelled");
                break;
            }
            self.process_day(&date).await;
        }
        Ok(())
    }

    /// Re-fetch the trailing window unconditionally; late announcements and
    /// corrections land inside it.
    pub async fn update(&self) -> Result<()> {
        let end = self.ctx.today;
        let start = end - Duration::days(self.lookback_days as i64);
        info!(
            data_type = %self.ctx.data_type,
            lookback = self.lookback_days,
            "starting event-date update"
        );
        for date in date_range(
            &start.format("%Y%m%d").to_string(),
            &self.ctx.today_compact(),
        )? {
            if self.ctx.cancelled() {
                info!(data_type = %self.ctx.data_type, "update cancelled");
                break;
            }
            self.process_day(&date).await;
        }
        Ok(())
    }

    pub async fn process_day(&self, date: &str) {
        let request = self.request_for(date);
        let (frame, status) = self.ctx.fetch(&request).await;

        if status == FetchStatus::Error {
            self.ctx
                .log_error(date, &request, &format!("API fetch failed for {date}"));
            return;
        }

        if frame.is_empty() {
            // Most days genuinely have no announcements.
            if let Err(e) = self
                .ctx
                .store
                .write_empty_partition(&self.leaf_for(date), date, &self.ctx.ingest_date())
            {
                self.ctx
                    .log_error(date, &request, &format!("failed to store empty {date}: {e:#}"));
                return;
            }
            self.ctx
                .log_outcome(date, &request, &Frame::empty(), LogStatus::NoData);
            debug!(date, "no events");
            return;
        }

        if !self.ctx.confirm_row_regression(date, &request, &frame).await {
            self.ctx.log_error(
                date,
                &request,
                &format!("row count regression unconfirmed for {date}"),
            );
            return;
        }

        let leaf = self.leaf_for(date);
        let existed = self.ctx.store.partition_exists(&leaf);
        let metadata = PartitionMetadata::for_frame(date, &self.ctx.ingest_date(), &frame);
        match self.ctx.store.write_partition(&leaf, &frame, &metadata) {
            Ok(()) => {
                let status = if existed { LogStatus::Updated } else { LogStatus::Success };
                self.ctx.log_outcome(date, &request, &frame, status);
                info!(
                    data_type = %self.ctx.data_type,
                    date,
                    rows = frame.row_count(),
                    "event date stored"
                );
            }
            Err(e) => {
                self.ctx
                    .log_error(date, &request, &format!("failed to store {date}: {e:#}"));
            }
        }
    }
}

/// Every calendar day in `[start, end]`, compact form.
fn date_range(start: &str, end: &str) -> Result<Vec<String>> {
    let start = NaiveDate::parse_from_str(start, "%Y%m%d")
        .map_err(|e| anyhow::anyhow!("malformed start date '{start}': {e}"))?;
    let end = NaiveDate::parse_from_str(end, "%Y%m%d")
        .map_err(|e| anyhow::anyhow!("malformed end date '{end}': {e}"))?;

    let mut dates = Vec::new();
    let mut current = start;
    while current <= end {
        dates.push(current.format("%Y%m%d").to_string());
        current += Duration::days(1);
    }
    Ok(dates)
}
