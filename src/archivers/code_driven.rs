//! Code-driven archiver.
//!
//! Traverses instrument codes instead of dates: one whole-history fetch per
//! code, one `ts_code=` partition per code. The driver list comes either
//! from the built-in index constants or from the `ts_code` column of the
//! latest `stock_basic` snapshot, read from storage rather than the vendor.
//!
//! Because every fetch is a full reload, update and backfill are the same
//! operation: process whatever the request log has not yet seen succeed.

use std::collections::BTreeSet;

use anyhow::{bail, Context, Result};
use tracing::{debug, info};

use crate::client::{params, FetchStatus};
use crate::frame::Frame;
use crate::manifest::{DriverSource, COMMON_INDEXES};
use crate::request_log::LogStatus;
use crate::storage::{code_leaf, PartitionMetadata, PartitionStore};

use super::ArchiverCtx;

pub struct CodeDrivenArchiver {
    ctx: ArchiverCtx,
    driver: DriverSource,
}

impl CodeDrivenArchiver {
    pub fn new(ctx: ArchiverCtx, driver: DriverSource) -> CodeDrivenArchiver {
        CodeDrivenArchiver { ctx, driver }
    }

    /// Resolve the driver list. Snapshot-backed drivers fail loudly when the
    /// snapshot has not been ingested yet.
    fn driver_codes(&self) -> Result<Vec<String>> {
        match self.driver {
            DriverSource::CommonIndexes => {
                Ok(COMMON_INDEXES.iter().map(|s| s.to_string()).collect())
            }
            DriverSource::SnapshotCodes(source) => {
                let store = PartitionStore::open(&self.ctx.landing_root, source)?;
                let Some((_, frame)) = store.read_latest_snapshot()? else {
                    bail!("{source} snapshot not found; run the '{source}' snapshot first");
                };
                let mut codes: Vec<String> = frame
                    .column_values("ts_code")
                    .into_iter()
                    .collect::<BTreeSet<_>>()
                    .into_iter()
                    .collect();
                if codes.is_empty() {
                    bail!("{source} snapshot has no ts_code values");
                }
                codes.sort();
                Ok(codes)
            }
        }
    }

    /// Process every code without a prior `success` in the log.
    pub async fn backfill(&self) -> Result<()> {
        let all_codes = self.driver_codes()?;
        let done = self
            .ctx
            .log
            .successful_keys(&self.ctx.data_type)
            .context("failed to read processed codes from the request log")?;

        let remaining: Vec<&String> = all_codes.iter().filter(|c| !done.contains(*c)).collect();
        info!(
            data_type = %self.ctx.data_type,
            total = all_codes.len(),
            processed = done.len(),
            remaining = remaining.len(),
            "starting code-driven backfill"
        );

        for code in remaining {
            if self.ctx.cancelled() {
                info!(data_type = %self.ctx.data_type, "backfill cancelled");
                break;
            }
            self.process_code(code).await;
        }
        Ok(())
    }

    /// Whole-history pulls make update identical to backfill: pick up
    /// whatever is missing.
    pub async fn update(&self) -> Result<()> {
        self.backfill().await
    }

    pub async fn process_code(&self, code: &str) {
        let request = params(&[("ts_code", code)]);
        let (frame, status) = self.ctx.fetch(&request).await;

        if status == FetchStatus::Error {
            self.ctx
                .log_error(code, &request, &format!("API fetch failed for {code}"));
            return;
        }

        if frame.is_empty() {
            if let Err(e) = self
                .ctx
                .store
                .write_empty_partition(&code_leaf(code), code, &self.ctx.ingest_date())
            {
                self.ctx
                    .log_error(code, &request, &format!("failed to store empty {code}: {e:#}"));
                return;
            }
            self.ctx
                .log_outcome(code, &request, &Frame::empty(), LogStatus::NoData);
            debug!(code, "no data");
            return;
        }

        if !self.ctx.confirm_row_regression(code, &request, &frame).await {
            self.ctx.log_error(
                code,
                &request,
                &format!("row count regression unconfirmed for {code}"),
            );
            return;
        }

        let metadata = PartitionMetadata::for_frame(code, &self.ctx.ingest_date(), &frame);
        match self.ctx.store.write_partition(&code_leaf(code), &frame, &metadata) {
            Ok(()) => {
                self.ctx
                    .log_outcome(code, &request, &frame, LogStatus::Success);
                info!(
                    data_type = %self.ctx.data_type,
                    code,
                    rows = frame.row_count(),
                    "code stored"
                );
            }
            Err(e) => {
                self.ctx
                    .log_error(code, &request, &format!("failed to store {code}: {e:#}"));
            }
        }
    }
}
