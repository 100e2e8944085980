//! Asset manifest.
//!
//! The declarative core of the pipeline: every dataset under management,
//! which archiver traverses it, where its backfill starts, and how its
//! update window is sized. The orchestrator walks this list in order;
//! snapshots (notably `trade_cal`) are declared before the trade-date assets
//! that depend on them.

/// Indexes traversed by the code-driven `index_daily` asset and the
/// index-monthly `index_weight` asset.
pub const COMMON_INDEXES: &[&str] = &[
    "000001.SH", // SSE Composite
    "000300.SH", // CSI 300
    "000905.SH", // CSI 500
    "000852.SH", // CSI 1000
    "399001.SZ", // SZSE Component
    "399006.SZ", // ChiNext
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiverKind {
    Period,
    TradeDate,
    EventDate,
    Snapshot,
    CodeDriven,
    IndexMonthly,
}

impl ArchiverKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArchiverKind::Period => "period",
            ArchiverKind::TradeDate => "trade_date",
            ArchiverKind::EventDate => "event_date",
            ArchiverKind::Snapshot => "snapshot",
            ArchiverKind::CodeDriven => "code",
            ArchiverKind::IndexMonthly => "index_monthly",
        }
    }

    pub fn parse(raw: &str) -> Option<ArchiverKind> {
        match raw {
            "period" => Some(ArchiverKind::Period),
            "trade_date" => Some(ArchiverKind::TradeDate),
            "event_date" | "date" => Some(ArchiverKind::EventDate),
            "snapshot" => Some(ArchiverKind::Snapshot),
            "code" | "code_driven" => Some(ArchiverKind::CodeDriven),
            "index_monthly" => Some(ArchiverKind::IndexMonthly),
            _ => None,
        }
    }
}

/// Update window, in the archiver's natural unit. At most one applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lookback {
    Quarters(u32),
    Months(u32),
    Days(u32),
    /// No window: the archiver's own resume semantics apply.
    None,
}

#[derive(Debug, Clone, Copy)]
pub struct UpdatePolicy {
    pub lookback: Lookback,
    /// Restrict update runs to calendar months `start..=end` (1-based);
    /// `None` runs every month.
    pub run_window: Option<(u32, u32)>,
}

impl UpdatePolicy {
    pub const fn quarterly() -> UpdatePolicy {
        UpdatePolicy {
            lookback: Lookback::Quarters(12),
            run_window: None,
        }
    }

    pub const fn monthly() -> UpdatePolicy {
        UpdatePolicy {
            lookback: Lookback::Months(12),
            run_window: None,
        }
    }

    pub const fn daily_30d_lookback() -> UpdatePolicy {
        UpdatePolicy {
            lookback: Lookback::Days(30),
            run_window: None,
        }
    }

    pub const fn daily_full_reload() -> UpdatePolicy {
        UpdatePolicy {
            lookback: Lookback::None,
            run_window: None,
        }
    }

    pub const fn snapshot() -> UpdatePolicy {
        UpdatePolicy {
            lookback: Lookback::None,
            run_window: None,
        }
    }

    pub fn runs_in_month(&self, month: u32) -> bool {
        match self.run_window {
            Some((start, end)) => (start..=end).contains(&month),
            None => true,
        }
    }
}

/// Where a code-driven archiver gets its traversal keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverSource {
    /// The built-in index list.
    CommonIndexes,
    /// The `ts_code` column of the latest snapshot of the named asset.
    SnapshotCodes(&'static str),
}

#[derive(Debug, Clone, Copy)]
pub struct Asset {
    pub name: &'static str,
    pub kind: ArchiverKind,
    pub policy: UpdatePolicy,
    /// First key of the historical keyspace, `YYYYMMDD`. `None` for kinds
    /// without a backfill mode.
    pub backfill_start: Option<&'static str>,
    pub driver_source: Option<DriverSource>,
    /// Event-date assets: the request parameter and directory prefix.
    pub date_field: Option<&'static str>,
}

impl Asset {
    const fn new(name: &'static str, kind: ArchiverKind, policy: UpdatePolicy) -> Asset {
        Asset {
            name,
            kind,
            policy,
            backfill_start: None,
            driver_source: None,
            date_field: None,
        }
    }

    const fn with_backfill(mut self, start: &'static str) -> Asset {
        self.backfill_start = Some(start);
        self
    }

    const fn with_driver(mut self, driver: DriverSource) -> Asset {
        self.driver_source = Some(driver);
        self
    }
}

/// Every dataset under management, in processing order.
pub fn data_assets() -> Vec<Asset> {
    vec![
        // Quarterly financial statements.
        Asset::new("income", ArchiverKind::Period, UpdatePolicy::quarterly())
            .with_backfill("20070101"),
        Asset::new("balancesheet", ArchiverKind::Period, UpdatePolicy::quarterly())
            .with_backfill("20070101"),
        Asset::new("cashflow", ArchiverKind::Period, UpdatePolicy::quarterly())
            .with_backfill("20070101"),
        Asset::new("fina_indicator", ArchiverKind::Period, UpdatePolicy::quarterly())
            .with_backfill("20070101"),
        Asset::new("express", ArchiverKind::Period, UpdatePolicy::quarterly())
            .with_backfill("20070101"),
        Asset::new("forecast", ArchiverKind::Period, UpdatePolicy::quarterly())
            .with_backfill("20070101"),
        Asset::new("fina_mainbz", ArchiverKind::Period, UpdatePolicy::quarterly())
            .with_backfill("20070101"),
        // Event-driven corporate actions.
        Asset {
            date_field: Some("ann_date"),
            ..Asset::new("dividend", ArchiverKind::EventDate, UpdatePolicy::daily_30d_lookback())
                .with_backfill("20070101")
        },
        // Full-state snapshots; trade_cal must precede the trade-date assets.
        Asset::new("stock_basic", ArchiverKind::Snapshot, UpdatePolicy::snapshot()),
        Asset::new("index_basic", ArchiverKind::Snapshot, UpdatePolicy::snapshot()),
        Asset::new("index_classify", ArchiverKind::Snapshot, UpdatePolicy::snapshot()),
        Asset::new("trade_cal", ArchiverKind::Snapshot, UpdatePolicy::snapshot()),
        // Per-trading-day market data.
        Asset::new("daily", ArchiverKind::TradeDate, UpdatePolicy::daily_30d_lookback())
            .with_backfill("19901219"),
        Asset::new("daily_basic", ArchiverKind::TradeDate, UpdatePolicy::daily_30d_lookback())
            .with_backfill("20070101"),
        Asset::new("adj_factor", ArchiverKind::TradeDate, UpdatePolicy::daily_30d_lookback())
            .with_backfill("20070101"),
        // Code-driven whole-history pulls.
        Asset::new("index_daily", ArchiverKind::CodeDriven, UpdatePolicy::daily_full_reload())
            .with_driver(DriverSource::CommonIndexes),
        Asset::new(
            "stk_holdernumber",
            ArchiverKind::CodeDriven,
            UpdatePolicy::daily_full_reload(),
        )
        .with_driver(DriverSource::SnapshotCodes("stock_basic")),
        // Index constituent weights.
        Asset::new("index_weight", ArchiverKind::IndexMonthly, UpdatePolicy::monthly())
            .with_backfill("20070101")
            .with_driver(DriverSource::CommonIndexes),
    ]
}

pub fn find_asset(name: &str) -> Option<Asset> {
    data_assets().into_iter().find(|asset| asset.name == name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::resolve;

    #[test]
    fn every_asset_has_a_registered_endpoint() {
        for asset in data_assets() {
            assert!(
                resolve(asset.name).is_ok(),
                "asset {} has no endpoint",
                asset.name
            );
        }
    }

    #[test]
    fn trade_cal_is_declared_before_trade_date_assets() {
        let assets = data_assets();
        let cal_pos = assets.iter().position(|a| a.name == "trade_cal").unwrap();
        for (idx, asset) in assets.iter().enumerate() {
            if asset.kind == ArchiverKind::TradeDate {
                assert!(cal_pos < idx, "{} runs before trade_cal", asset.name);
            }
        }
    }

    #[test]
    fn run_window_gates_months() {
        let policy = UpdatePolicy {
            lookback: Lookback::Quarters(16),
            run_window: Some((4, 8)),
        };
        assert!(!policy.runs_in_month(3));
        assert!(policy.runs_in_month(4));
        assert!(policy.runs_in_month(8));
        assert!(!policy.runs_in_month(9));
    }

    #[test]
    fn kind_strings_round_trip() {
        for kind in [
            ArchiverKind::Period,
            ArchiverKind::TradeDate,
            ArchiverKind::EventDate,
            ArchiverKind::Snapshot,
            ArchiverKind::CodeDriven,
            ArchiverKind::IndexMonthly,
        ] {
            assert_eq!(ArchiverKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(ArchiverKind::parse("bogus"), None);
    }
}
