//! Index×month archiver.
//!
//! Traverses the Cartesian product of an index list and month-end dates,
//! one partition per `(index_code, month_end)` pair. Constituent-weight
//! endpoints serve one month window per call, so the request carries the
//! month's first and last day and the composite log key is
//! `<index_code>-<YYYYMMDD>`.

use std::collections::BTreeSet;

use anyhow::Result;
use chrono::{Datelike, Duration, Months, NaiveDate};
use tracing::{debug, info};

use crate::client::{params, FetchStatus};
use crate::frame::Frame;
use crate::request_log::LogStatus;
use crate::storage::{index_month_leaf, PartitionMetadata};

use super::ArchiverCtx;

pub const DEFAULT_LOOKBACK_MONTHS: u32 = 12;

pub struct IndexMonthlyArchiver {
    ctx: ArchiverCtx,
    indexes: Vec<String>,
    start_date: String,
    lookback_months: u32,
}

impl IndexMonthlyArchiver {
    pub fn new(
        ctx: ArchiverCtx,
        indexes: Vec<String>,
        start_date: &str,
        lookback_months: u32,
    ) -> IndexMonthlyArchiver {
        IndexMonthlyArchiver {
            ctx,
            indexes,
            start_date: start_date.to_string(),
            lookback_months,
        }
    }

    /// `(index_code, month_end)` pairs already on disk.
    fn processed_pairs(&self) -> BTreeSet<(String, String)> {
        let mut processed = BTreeSet::new();
        for index_dir in self.ctx.store.list_partitions() {
            let Some(index_code) = index_dir.strip_prefix("index_code=") else {
                continue;
            };
            for date_dir in self.ctx.store.list_subpartitions(&index_dir) {
                if let Some(month_end) = date_dir.strip_prefix("trade_date=") {
                    processed.insert((index_code.to_string(), month_end.to_string()));
                }
            }
        }
        processed
    }

    /// Process the missing complement of the full keyspace, ordered by
    /// index then month.
    pub async fn backfill(&self) -> Result<()> {
        let months = month_ends(&self.start_date, self.ctx.today)?;
        let mut keyspace = BTreeSet::new();
        for index_code in &self.indexes {
            for month_end in &months {
                keyspace.insert((index_code.clone(), month_end.clone()));
            }
        }
        let processed = self.processed_pairs();
        let remaining: Vec<_> = keyspace.difference(&processed).cloned().collect();
        info!(
            data_type = %self.ctx.data_type,
            total = keyspace.len(),
            processed = processed.len(),
            remaining = remaining.len(),
            "starting index-monthly backfill"
        );

        for (index_code, month_end) in remaining {
            if self.ctx.cancelled() {
                info!(data_type = %self.ctx.data_type, "backfill cancelled");
                break;
            }
            self.process_month(&index_code, &month_end).await;
        }
        Ok(())
    }

    /// Reprocess the trailing months for every index (overwrite semantics).
    pub async fn update(&self) -> Result<()> {
        let window_start = self.ctx.today - Months::new(self.lookback_months);
        let start = window_start.format("%Y%m%d").to_string();
        let months = month_ends(&start, self.ctx.today)?;
        info!(
            data_type = %self.ctx.data_type,
            lookback = self.lookback_months,
            months = months.len(),
            "starting index-monthly update"
        );

        for index_code in &self.indexes {
            for month_end in &months {
                if self.ctx.cancelled() {
                    info!(data_type = %self.ctx.data_type, "update cancelled");
                    return Ok(());
                }
                self.process_month(index_code, month_end).await;
            }
        }
        Ok(())
    }

    pub async fn process_month(&self, index_code: &str, month_end: &str) {
        let key = format!("{index_code}-{month_end}");
        let month_start = format!("{}01", &month_end[..6.min(month_end.len())]);
        let request = params(&[
            ("index_code", index_code),
            ("start_date", month_start.as_str()),
            ("end_date", month_end),
        ]);

        let (frame, status) = self.ctx.fetch(&request).await;
        if status == FetchStatus::Error {
            self.ctx
                .log_error(&key, &request, &format!("API fetch failed for {key}"));
            return;
        }

        let leaf = index_month_leaf(index_code, month_end);
        if frame.is_empty() {
            if let Err(e) = self
                .ctx
                .store
                .write_empty_partition(&leaf, &key, &self.ctx.ingest_date())
            {
                self.ctx
                    .log_error(&key, &request, &format!("failed to store empty {key}: {e:#}"));
                return;
            }
            self.ctx
                .log_outcome(&key, &request, &Frame::empty(), LogStatus::NoData);
            debug!(key, "no data");
            return;
        }

        if !self.ctx.confirm_row_regression(&key, &request, &frame).await {
            self.ctx.log_error(
                &key,
                &request,
                &format!("row count regression unconfirmed for {key}"),
            );
            return;
        }

        let existed = self.ctx.store.partition_exists(&leaf);
        let metadata = PartitionMetadata::for_frame(&key, &self.ctx.ingest_date(), &frame);
        match self.ctx.store.write_partition(&leaf, &frame, &metadata) {
            Ok(()) => {
                let status = if existed { LogStatus::Updated } else { LogStatus::Success };
                self.ctx.log_outcome(&key, &request, &frame, status);
                info!(
                    data_type = %self.ctx.data_type,
                    key,
                    rows = frame.row_count(),
                    "index month stored"
                );
            }
            Err(e) => {
                self.ctx
                    .log_error(&key, &request, &format!("failed to store {key}: {e:#}"));
            }
        }
    }
}

/// Month-end dates from the month containing `start` through the month
/// containing `today`, compact form.
pub fn month_ends(start: &str, today: NaiveDate) -> Result<Vec<String>> {
    let start = NaiveDate::parse_from_str(start, "%Y%m%d")
        .map_err(|e| anyhow::anyhow!("malformed start date '{start}': {e}"))?;
    let mut current = start.with_day(1).expect("day 1 is always valid");
    let end_month = today.with_day(1).expect("day 1 is always valid");

    let mut months = Vec::new();
    while current <= end_month {
        let next_month = current + Months::new(1);
        let last_day = next_month - Duration::days(1);
        months.push(last_day.format("%Y%m%d").to_string());
        current = next_month;
    }
    Ok(months)
}
