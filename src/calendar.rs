//! Trading calendar.
//!
//! The calendar is itself an archived asset: the latest `trade_cal` snapshot
//! on disk. Trade-date archivers and the quality checker read it through
//! here instead of calling the vendor, which is why the manifest refreshes
//! `trade_cal` before any trade-date asset runs.

use std::collections::BTreeSet;
use std::path::Path;

use anyhow::{bail, Context, Result};

use crate::frame::{Cell, Frame};
use crate::storage::PartitionStore;

pub const TRADE_CAL_DATA_TYPE: &str = "trade_cal";

pub struct TradingCalendar {
    open_days: BTreeSet<String>,
}

impl TradingCalendar {
    /// Load from the latest `trade_cal` snapshot beneath `landing_root`.
    /// Missing or unreadable snapshots are an initialization error: the
    /// dependent asset cannot run until the calendar has been ingested.
    pub fn load(landing_root: &Path) -> Result<TradingCalendar> {
        let store = PartitionStore::open(landing_root, TRADE_CAL_DATA_TYPE)?;
        let Some((_, frame)) = store.read_latest_snapshot()? else {
            bail!("trade calendar snapshot not found; run the 'trade_cal' snapshot first");
        };
        TradingCalendar::from_frame(&frame)
    }

    pub fn from_frame(frame: &Frame) -> Result<TradingCalendar> {
        let cal_idx = frame
            .column_index("cal_date")
            .context("trade calendar is missing the cal_date column")?;
        let open_idx = frame
            .column_index("is_open")
            .context("trade calendar is missing the is_open column")?;

        let mut open_days = BTreeSet::new();
        for row in frame.rows() {
            if is_open(&row[open_idx]) {
                open_days.insert(row[cal_idx].as_str_lossy());
            }
        }
        if open_days.is_empty() {
            bail!("trade calendar snapshot contains no open days");
        }
        Ok(TradingCalendar { open_days })
    }

    pub fn is_open(&self, date: &str) -> bool {
        self.open_days.contains(date)
    }

    /// Open days in `[start, end]`, ascending, both bounds `YYYYMMDD`.
    pub fn open_days_between(&self, start: &str, end: &str) -> Vec<String> {
        self.open_days
            .range(start.to_string()..=end.to_string())
            .cloned()
            .collect()
    }

    /// The most recent `n` open days at or before `end`, ascending.
    pub fn last_open_days(&self, end: &str, n: usize) -> Vec<String> {
        let mut days: Vec<String> = self
            .open_days
            .range(..=end.to_string())
            .rev()
            .take(n)
            .cloned()
            .collect();
        days.reverse();
        days
    }

    /// The first open day strictly after `date`, if the calendar extends
    /// that far.
    pub fn next_open_day(&self, date: &str) -> Option<String> {
        use std::ops::Bound;
        self.open_days
            .range((Bound::Excluded(date.to_string()), Bound::Unbounded))
            .next()
            .cloned()
    }
}

/// The vendor has shipped `is_open` both as an integer and as a string;
/// accept either.
fn is_open(cell: &Cell) -> bool {
    match cell {
        Cell::Int(i) => *i == 1,
        Cell::Float(f) => *f == 1.0,
        Cell::Str(s) => s.trim() == "1",
        _ => false,
    }
}
