//! Snapshot archiver.
//!
//! Full-state datasets (instrument masters, the trading calendar) are
//! replaced wholesale: one fetch per day, one `snapshot_date=` partition per
//! ingest day, and a retention sweep that prunes snapshots older than the
//! horizon. There is no historical keyspace, so backfill routes to update.

use anyhow::Result;
use chrono::{Duration, NaiveDate};
use tracing::{info, warn};

use crate::client::{FetchStatus, Params};
use crate::request_log::LogStatus;
use crate::storage::{leaf_value, snapshot_leaf, PartitionMetadata};

use super::ArchiverCtx;

pub const DEFAULT_RETENTION_DAYS: u32 = 30;

pub struct SnapshotArchiver {
    ctx: ArchiverCtx,
    retention_days: u32,
}

impl SnapshotArchiver {
    pub fn new(ctx: ArchiverCtx, retention_days: u32) -> SnapshotArchiver {
        SnapshotArchiver {
            ctx,
            retention_days,
        }
    }

    /// Snapshots have no history to refill.
    pub async fn backfill(&self) -> Result<()> {
        info!(
            data_type = %self.ctx.data_type,
            "snapshot assets have no backfill; running update"
        );
        self.update(None).await
    }

    /// Fetch the full current state and store it under today's key (or the
    /// supplied one). On success, prune expired snapshots.
    pub async fn update(&self, snapshot_date: Option<&str>) -> Result<()> {
        let key = match snapshot_date {
            Some(date) => date.to_string(),
            None => self.ctx.today_compact(),
        };
        info!(data_type = %self.ctx.data_type, key, "taking snapshot");

        let request = Params::new();
        let (frame, status) = self.ctx.fetch(&request).await;

        if status == FetchStatus::Error {
            self.ctx
                .log_error(&key, &request, &format!("API fetch failed for snapshot {key}"));
            return Ok(());
        }
        if frame.is_empty() {
            // The previous snapshot stays authoritative; record the attempt.
            self.ctx
                .log_outcome(&key, &request, &frame, LogStatus::NoData);
            warn!(data_type = %self.ctx.data_type, key, "snapshot fetch returned no rows");
            return Ok(());
        }

        let leaf = snapshot_leaf(&key);
        let metadata = PartitionMetadata::for_frame(&key, &self.ctx.ingest_date(), &frame);
        match self.ctx.store.write_partition(&leaf, &frame, &metadata) {
            Ok(()) => {
                self.ctx
                    .log_outcome(&key, &request, &frame, LogStatus::Success);
                info!(
                    data_type = %self.ctx.data_type,
                    key,
                    rows = frame.row_count(),
                    "snapshot stored"
                );
                if self.retention_days > 0 {
                    self.prune_expired();
                }
            }
            Err(e) => {
                self.ctx
                    .log_error(&key, &request, &format!("failed to store snapshot {key}: {e:#}"));
            }
        }
        Ok(())
    }

    /// Remove `snapshot_date=` partitions older than the retention horizon.
    /// Unparseable directory names are left alone.
    fn prune_expired(&self) {
        let cutoff = self.ctx.today - Duration::days(self.retention_days as i64);
        let mut removed = 0usize;
        for name in self.ctx.store.list_partitions() {
            let Some(date_str) = leaf_value(&name) else {
                continue;
            };
            let Ok(date) = NaiveDate::parse_from_str(date_str, "%Y%m%d") else {
                warn!(partition = name, "cannot parse snapshot date; leaving in place");
                continue;
            };
            if date <= cutoff {
                match self.ctx.store.remove_partition(&name) {
                    Ok(()) => {
                        info!(data_type = %self.ctx.data_type, partition = name, "pruned expired snapshot");
                        removed += 1;
                    }
                    Err(e) => warn!("failed to prune {name}: {e:#}"),
                }
            }
        }
        if removed > 0 {
            info!(data_type = %self.ctx.data_type, removed, "snapshot retention sweep complete");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archivers::test_support::{ctx_for, scripted_client, ScriptedTransport};
    use crate::config::Config;
    use crate::frame::{Cell, Frame};
    use crate::request_log::RequestLog;
    use crate::storage::PartitionStore;
    use std::sync::Arc;

    fn basics_frame() -> Frame {
        Frame::new(
            vec!["ts_code".into(), "name".into()],
            vec![
                vec![Cell::Str("000001.SZ".into()), Cell::Str("PAB".into())],
                vec![Cell::Str("600000.SH".into()), Cell::Str("SPDB".into())],
            ],
        )
    }

    fn archiver_with(
        base: &std::path::Path,
        responses: Vec<anyhow::Result<Frame>>,
        retention_days: u32,
        today: NaiveDate,
    ) -> (SnapshotArchiver, Arc<ScriptedTransport>) {
        let config = Config::for_base_path(base);
        let transport = Arc::new(ScriptedTransport::new(responses));
        let client = Arc::new(scripted_client(transport.clone(), base));
        let ctx = ctx_for(&config, client, "index_basic", today);
        (SnapshotArchiver::new(ctx, retention_days), transport)
    }

    #[tokio::test]
    async fn snapshot_lands_under_todays_key() {
        let dir = tempfile::tempdir().unwrap();
        let today = NaiveDate::from_ymd_opt(2024, 1, 5).unwrap();
        let (archiver, _) = archiver_with(dir.path(), vec![Ok(basics_frame())], 30, today);
        archiver.update(None).await.unwrap();

        let config = Config::for_base_path(dir.path());
        let store = PartitionStore::open(&config.landing_root(), "index_basic").unwrap();
        assert!(store.partition_exists("snapshot_date=20240105"));

        let (name, frame) = store.read_latest_snapshot().unwrap().unwrap();
        assert_eq!(name, "snapshot_date=20240105");
        assert_eq!(frame.row_count(), 2);
    }

    #[tokio::test]
    async fn retention_keeps_only_recent_snapshots() {
        let dir = tempfile::tempdir().unwrap();
        // Five consecutive daily runs with a three-day horizon.
        for day in 1..=5u32 {
            let today = NaiveDate::from_ymd_opt(2024, 1, day).unwrap();
            let (archiver, _) = archiver_with(dir.path(), vec![Ok(basics_frame())], 3, today);
            archiver.update(None).await.unwrap();
        }

        let config = Config::for_base_path(dir.path());
        let store = PartitionStore::open(&config.landing_root(), "index_basic").unwrap();
        assert_eq!(
            store.list_partitions(),
            vec![
                "snapshot_date=20240103",
                "snapshot_date=20240104",
                "snapshot_date=20240105"
            ]
        );
    }

    #[tokio::test]
    async fn empty_snapshot_leaves_previous_state_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let day1 = NaiveDate::from_ymd_opt(2024, 1, 4).unwrap();
        let (archiver, _) = archiver_with(dir.path(), vec![Ok(basics_frame())], 30, day1);
        archiver.update(None).await.unwrap();

        let day2 = NaiveDate::from_ymd_opt(2024, 1, 5).unwrap();
        let (archiver, _) = archiver_with(dir.path(), vec![Ok(Frame::empty())], 30, day2);
        archiver.update(None).await.unwrap();

        let config = Config::for_base_path(dir.path());
        let store = PartitionStore::open(&config.landing_root(), "index_basic").unwrap();
        let (name, _) = store.read_latest_snapshot().unwrap().unwrap();
        assert_eq!(name, "snapshot_date=20240104");

        let log = RequestLog::open(config.log_db_path()).unwrap();
        let newest = &log.history("index_basic", None).unwrap()[0];
        assert_eq!(newest.status, "no_data");
    }

    #[tokio::test]
    async fn backfill_routes_to_update() {
        let dir = tempfile::tempdir().unwrap();
        let today = NaiveDate::from_ymd_opt(2024, 1, 5).unwrap();
        let (archiver, transport) = archiver_with(dir.path(), vec![Ok(basics_frame())], 30, today);
        archiver.backfill().await.unwrap();
        assert_eq!(transport.call_count(), 1);

        let config = Config::for_base_path(dir.path());
        let store = PartitionStore::open(&config.landing_root(), "index_basic").unwrap();
        assert!(store.partition_exists("snapshot_date=20240105"));
    }
}
