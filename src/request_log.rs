//! Durable request log.
//!
//! One SQLite file records every partition attempt across all assets. The
//! unique key `(data_type, partition_key, ingest_date)` makes the log
//! append-only in practice: re-running a key on the same day overwrites that
//! day's own row via `INSERT OR REPLACE`, and history accumulates across
//! days. The filesystem stays the source of truth for partition existence;
//! the log is the source of truth for version history and checksums.
//!
//! A failed log write is reported and swallowed; data already on disk is
//! authoritative and an archive sweep must not die on logging.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use tracing::error;

use crate::client::Params;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS request_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    data_type TEXT NOT NULL,
    partition_key TEXT NOT NULL,
    ingest_date TEXT NOT NULL,
    params TEXT,
    row_count INTEGER,
    checksum TEXT,
    status TEXT,
    error_message TEXT,
    created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
    UNIQUE(data_type, partition_key, ingest_date)
);
"#;

/// Lock-acquisition budget under concurrent writers.
const BUSY_TIMEOUT: Duration = Duration::from_secs(10);

/// Outcome of one partition attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogStatus {
    Success,
    Updated,
    NoChange,
    NoData,
    Skipped,
    Error,
}

impl LogStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogStatus::Success => "success",
            LogStatus::Updated => "updated",
            LogStatus::NoChange => "no_change",
            LogStatus::NoData => "no_data",
            LogStatus::Skipped => "skipped",
            LogStatus::Error => "error",
        }
    }

    pub fn parse(raw: &str) -> Option<LogStatus> {
        match raw {
            "success" => Some(LogStatus::Success),
            "updated" => Some(LogStatus::Updated),
            "no_change" => Some(LogStatus::NoChange),
            "no_data" => Some(LogStatus::NoData),
            "skipped" => Some(LogStatus::Skipped),
            "error" => Some(LogStatus::Error),
            _ => None,
        }
    }
}

/// One attempt, as recorded.
#[derive(Debug, Clone)]
pub struct LogRecord {
    pub data_type: String,
    pub partition_key: String,
    pub ingest_date: String,
    pub params_json: Option<String>,
    pub row_count: i64,
    pub checksum: String,
    pub status: String,
    pub error_message: Option<String>,
    pub created_at: String,
}

pub struct RequestLog {
    db_path: PathBuf,
}

impl RequestLog {
    /// Open (and initialize) the log at the given path.
    pub fn open(db_path: impl Into<PathBuf>) -> Result<RequestLog> {
        let db_path = db_path.into();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let log = RequestLog { db_path };
        let conn = log.connect()?;
        conn.execute_batch(SCHEMA)
            .context("failed to initialize request_log schema")?;
        Ok(log)
    }

    /// Connections are short-lived and autocommit; each write opens, commits,
    /// and closes so concurrent archivers only contend for the busy timeout.
    fn connect(&self) -> Result<Connection> {
        let conn = Connection::open_with_flags(
            &self.db_path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE,
        )
        .with_context(|| format!("failed to open {}", self.db_path.display()))?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        Ok(conn)
    }

    /// Record one attempt. Failures are reported, never propagated.
    #[allow(clippy::too_many_arguments)]
    pub fn record(
        &self,
        data_type: &str,
        partition_key: &str,
        ingest_date: &str,
        request: &Params,
        row_count: usize,
        checksum: &str,
        status: LogStatus,
        error_message: Option<&str>,
    ) {
        if let Err(e) = self.try_record(
            data_type,
            partition_key,
            ingest_date,
            request,
            row_count,
            checksum,
            status,
            error_message,
        ) {
            error!(
                data_type,
                partition_key, "failed to write request log entry: {e:#}"
            );
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn try_record(
        &self,
        data_type: &str,
        partition_key: &str,
        ingest_date: &str,
        request: &Params,
        row_count: usize,
        checksum: &str,
        status: LogStatus,
        error_message: Option<&str>,
    ) -> Result<()> {
        let conn = self.connect()?;
        conn.execute(
            "INSERT OR REPLACE INTO request_log
             (data_type, partition_key, ingest_date, params, row_count, checksum,
              status, error_message, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                data_type,
                partition_key,
                ingest_date,
                serde_json::to_string(request)?,
                row_count as i64,
                checksum,
                status.as_str(),
                error_message,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Latest checksum for a key, considering only entries that reflect real
    /// data state (success / updated / no_change).
    pub fn last_checksum(&self, data_type: &str, partition_key: &str) -> Result<Option<String>> {
        let conn = self.connect()?;
        conn.query_row(
            "SELECT checksum FROM request_log
             WHERE data_type = ?1 AND partition_key = ?2
               AND status IN ('success', 'updated', 'no_change')
             ORDER BY ingest_date DESC LIMIT 1",
            params![data_type, partition_key],
            |row| row.get(0),
        )
        .optional()
        .context("failed to query last checksum")
    }

    /// Latest recorded row count for a key (same status filter as
    /// [`last_checksum`]); feeds the row-regression guard.
    pub fn last_row_count(&self, data_type: &str, partition_key: &str) -> Result<Option<i64>> {
        let conn = self.connect()?;
        conn.query_row(
            "SELECT row_count FROM request_log
             WHERE data_type = ?1 AND partition_key = ?2
               AND status IN ('success', 'updated', 'no_change')
             ORDER BY ingest_date DESC LIMIT 1",
            params![data_type, partition_key],
            |row| row.get(0),
        )
        .optional()
        .context("failed to query last row count")
    }

    /// Keys that have ever completed successfully; drives code-archiver
    /// resume.
    pub fn successful_keys(&self, data_type: &str) -> Result<HashSet<String>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            "SELECT DISTINCT partition_key FROM request_log
             WHERE data_type = ?1 AND status = 'success'",
        )?;
        let keys = stmt
            .query_map(params![data_type], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<HashSet<_>, _>>()?;
        Ok(keys)
    }

    /// Most recent ingest date with any successful outcome for the asset.
    pub fn last_success_ingest_date(&self, data_type: &str) -> Result<Option<String>> {
        let conn = self.connect()?;
        conn.query_row(
            "SELECT ingest_date FROM request_log
             WHERE data_type = ?1 AND status IN ('success', 'updated')
             ORDER BY ingest_date DESC LIMIT 1",
            params![data_type],
            |row| row.get(0),
        )
        .optional()
        .context("failed to query last success date")
    }

    /// Full history for an asset, newest first, optionally bounded.
    pub fn history(&self, data_type: &str, limit: Option<usize>) -> Result<Vec<LogRecord>> {
        let conn = self.connect()?;
        let sql = format!(
            "SELECT data_type, partition_key, ingest_date, params, row_count,
                    checksum, status, error_message, created_at
             FROM request_log
             WHERE data_type = ?1
             ORDER BY created_at DESC{}",
            match limit {
                Some(n) => format!(" LIMIT {n}"),
                None => String::new(),
            }
        );
        let mut stmt = conn.prepare(&sql)?;
        let records = stmt
            .query_map(params![data_type], |row| {
                Ok(LogRecord {
                    data_type: row.get(0)?,
                    partition_key: row.get(1)?,
                    ingest_date: row.get(2)?,
                    params_json: row.get(3)?,
                    row_count: row.get::<_, Option<i64>>(4)?.unwrap_or(0),
                    checksum: row.get::<_, Option<String>>(5)?.unwrap_or_default(),
                    status: row.get(6)?,
                    error_message: row.get(7)?,
                    created_at: row.get::<_, Option<String>>(8)?.unwrap_or_default(),
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(records)
    }

    /// Whether a key has a log entry reflecting a known data state.
    pub fn has_completed(&self, data_type: &str, partition_key: &str) -> Result<bool> {
        let conn = self.connect()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM request_log
             WHERE data_type = ?1 AND partition_key = ?2
               AND status IN ('success', 'updated', 'no_change', 'no_data')",
            params![data_type, partition_key],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }
}
