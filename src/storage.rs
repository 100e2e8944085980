//! Partitioned landing store.
//!
//! One directory per data type under `<base>/raw/landing/tushare/`, one leaf
//! directory per partition key. A leaf holds `data.parquet` plus a
//! `metadata.json` sidecar; a known-empty partition holds only the sidecar
//! (`row_count = 0`, checksum `"empty"`). Period assets version each key
//! with `ingest_date=` subdirectories, newest authoritative.
//!
//! Writes are staged in a temporary sibling directory and renamed into
//! place, so a reader sees either the previous complete version or the new
//! one, never a torn partition.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::frame::{Frame, EMPTY_CHECKSUM};

pub const DATA_FILE: &str = "data.parquet";
pub const METADATA_FILE: &str = "metadata.json";

static STAGE_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Sidecar describing one stored partition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PartitionMetadata {
    pub partition_key: String,
    pub ingest_date: String,
    pub row_count: usize,
    pub checksum: String,
    pub created_at: String,
    pub schema_fields: Vec<String>,
}

impl PartitionMetadata {
    pub fn for_frame(partition_key: &str, ingest_date: &str, frame: &Frame) -> PartitionMetadata {
        PartitionMetadata {
            partition_key: partition_key.to_string(),
            ingest_date: ingest_date.to_string(),
            row_count: frame.row_count(),
            checksum: frame.checksum(),
            created_at: Utc::now().to_rfc3339(),
            schema_fields: frame.columns().to_vec(),
        }
    }
}

// ----------------------------------------------------------------------
// Leaf naming
// ----------------------------------------------------------------------

pub fn period_leaf(key: &str) -> String {
    format!("period={key}")
}

pub fn period_version_leaf(key: &str, ingest_date: &str) -> String {
    format!("period={key}/ingest_date={ingest_date}")
}

pub fn trade_date_leaf(key: &str) -> String {
    format!("trade_date={key}")
}

pub fn event_date_leaf(date_field: &str, key: &str) -> String {
    format!("{date_field}={key}")
}

pub fn snapshot_leaf(key: &str) -> String {
    format!("snapshot_date={key}")
}

pub fn code_leaf(code: &str) -> String {
    format!("ts_code={code}")
}

pub fn index_month_leaf(index_code: &str, month_end: &str) -> String {
    format!("index_code={index_code}/trade_date={month_end}")
}

/// The value part of a `name=value` partition directory name.
pub fn leaf_value(dir_name: &str) -> Option<&str> {
    dir_name.split_once('=').map(|(_, v)| v)
}

// ----------------------------------------------------------------------
// Store
// ----------------------------------------------------------------------

pub struct PartitionStore {
    asset_root: PathBuf,
    data_type: String,
}

impl PartitionStore {
    /// Open the store for one data type, creating its directory tree.
    pub fn open(landing_root: &Path, data_type: &str) -> Result<PartitionStore> {
        let asset_root = landing_root.join(data_type);
        fs::create_dir_all(&asset_root)
            .with_context(|| format!("failed to create {}", asset_root.display()))?;
        Ok(PartitionStore {
            asset_root,
            data_type: data_type.to_string(),
        })
    }

    pub fn data_type(&self) -> &str {
        &self.data_type
    }

    pub fn asset_root(&self) -> &Path {
        &self.asset_root
    }

    pub fn partition_path(&self, leaf: &str) -> PathBuf {
        self.asset_root.join(leaf)
    }

    pub fn partition_exists(&self, leaf: &str) -> bool {
        self.partition_path(leaf).is_dir()
    }

    /// Commit a partition atomically: stage both files in a temporary
    /// sibling, rename into place, and retire any previous version of the
    /// leaf only after the new one has landed.
    pub fn write_partition(
        &self,
        leaf: &str,
        frame: &Frame,
        metadata: &PartitionMetadata,
    ) -> Result<()> {
        let dest = self.partition_path(leaf);
        let parent = dest
            .parent()
            .context("partition leaf has no parent directory")?;
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;

        let nonce = format!(
            "{}-{}",
            std::process::id(),
            STAGE_COUNTER.fetch_add(1, Ordering::Relaxed)
        );
        let staging = parent.join(format!(".tmp-{nonce}"));
        fs::create_dir_all(&staging)
            .with_context(|| format!("failed to create {}", staging.display()))?;

        let staged = (|| -> Result<()> {
            if !frame.is_empty() {
                frame.write_parquet(&staging.join(DATA_FILE))?;
            }
            let body = serde_json::to_string_pretty(metadata)?;
            fs::write(staging.join(METADATA_FILE), body)
                .context("failed to write metadata sidecar")?;
            Ok(())
        })();
        if let Err(e) = staged {
            let _ = fs::remove_dir_all(&staging);
            return Err(e);
        }

        if dest.exists() {
            let retired = parent.join(format!(".retired-{nonce}"));
            fs::rename(&dest, &retired)
                .with_context(|| format!("failed to retire {}", dest.display()))?;
            if let Err(e) = fs::rename(&staging, &dest) {
                // Put the old version back so the partition never vanishes.
                let _ = fs::rename(&retired, &dest);
                let _ = fs::remove_dir_all(&staging);
                return Err(e).with_context(|| format!("failed to commit {}", dest.display()));
            }
            if let Err(e) = fs::remove_dir_all(&retired) {
                warn!("failed to remove retired partition {}: {e}", retired.display());
            }
        } else {
            fs::rename(&staging, &dest)
                .with_context(|| format!("failed to commit {}", dest.display()))?;
        }

        debug!(
            data_type = %self.data_type,
            leaf,
            rows = metadata.row_count,
            "partition committed"
        );
        Ok(())
    }

    /// Write the canonical known-empty representation: sidecar only.
    pub fn write_empty_partition(&self, leaf: &str, partition_key: &str, ingest_date: &str) -> Result<()> {
        let metadata = PartitionMetadata {
            partition_key: partition_key.to_string(),
            ingest_date: ingest_date.to_string(),
            row_count: 0,
            checksum: EMPTY_CHECKSUM.to_string(),
            created_at: Utc::now().to_rfc3339(),
            schema_fields: Vec::new(),
        };
        self.write_partition(leaf, &Frame::empty(), &metadata)
    }

    pub fn read_metadata(&self, leaf: &str) -> Result<Option<PartitionMetadata>> {
        let path = self.partition_path(leaf).join(METADATA_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let metadata = serde_json::from_str(&raw)
            .with_context(|| format!("malformed metadata in {}", path.display()))?;
        Ok(Some(metadata))
    }

    /// Frame stored in a leaf. Sidecar-without-data means known-empty.
    pub fn read_partition_frame(&self, leaf: &str) -> Result<Option<Frame>> {
        let dir = self.partition_path(leaf);
        let data = dir.join(DATA_FILE);
        if data.exists() {
            return Frame::read_parquet(&data).map(Some);
        }
        if dir.join(METADATA_FILE).exists() {
            return Ok(Some(Frame::empty()));
        }
        Ok(None)
    }

    /// Version subdirectories of a period partition, oldest first.
    pub fn versions(&self, leaf: &str) -> Vec<String> {
        sorted_dir_names(&self.partition_path(leaf))
    }

    /// Read the authoritative content of a partition. Period partitions
    /// resolve through their newest `ingest_date=` version.
    pub fn read_latest(&self, leaf: &str) -> Result<Option<Frame>> {
        if leaf.starts_with("period=") && !leaf.contains('/') {
            let versions = self.versions(leaf);
            let Some(newest) = versions.last() else {
                return Ok(None);
            };
            return self.read_partition_frame(&format!("{leaf}/{newest}"));
        }
        self.read_partition_frame(leaf)
    }

    /// Top-level partition directory names, sorted.
    pub fn list_partitions(&self) -> Vec<String> {
        sorted_dir_names(&self.asset_root)
    }

    /// Sub-partitions beneath one top-level directory, sorted (index×month
    /// layout).
    pub fn list_subpartitions(&self, leaf: &str) -> Vec<String> {
        sorted_dir_names(&self.partition_path(leaf))
    }

    /// Latest partition of the asset (by directory-name order) and its
    /// frame; how snapshot consumers read "the current state".
    pub fn read_latest_snapshot(&self) -> Result<Option<(String, Frame)>> {
        for name in self.list_partitions().into_iter().rev() {
            if let Some(frame) = self.read_latest(&name)? {
                return Ok(Some((name, frame)));
            }
        }
        Ok(None)
    }

    pub fn remove_partition(&self, leaf: &str) -> Result<()> {
        let path = self.partition_path(leaf);
        fs::remove_dir_all(&path)
            .with_context(|| format!("failed to remove {}", path.display()))
    }
}

fn sorted_dir_names(dir: &Path) -> Vec<String> {
    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut names: Vec<String> = entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().is_dir())
        .filter_map(|entry| entry.file_name().into_string().ok())
        .filter(|name| !name.starts_with('.'))
        .collect();
    names.sort();
    names
}
