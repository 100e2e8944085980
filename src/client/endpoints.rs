//! Static endpoint registry.
//!
//! Every dataset the manifest can name maps to one vendor endpoint here.
//! Resolution happens once, at archiver construction; an unknown data type
//! is a construction-time error, never a runtime lookup failure. Datasets
//! with an authoritative "vip" variant resolve to it; the standard name is
//! the fallback.

use anyhow::{bail, Result};

/// How a fetched key is parameterized on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamStyle {
    /// `period=YYYYMMDD` (fiscal quarter end).
    Period,
    /// `trade_date=YYYYMMDD`.
    TradeDate,
    /// Configurable event-date field, `ann_date` unless overridden.
    EventDate,
    /// No key parameter; the endpoint returns its full current state.
    FullState,
    /// `ts_code=<code>`, whole history per instrument.
    Code,
    /// `index_code=<code>` plus a `start_date`/`end_date` month window.
    IndexMonth,
}

#[derive(Debug, Clone, Copy)]
pub struct EndpointDef {
    /// Manifest-facing dataset name.
    pub data_type: &'static str,
    /// Whether the account's authoritative `<name>_vip` variant exists.
    pub has_vip: bool,
    pub param_style: ParamStyle,
    /// Whether responses are capped and must be assembled by offset.
    pub paginated: bool,
    /// Paginated endpoints whose offset must be advanced with a small
    /// overlap (rows − 100) to avoid boundary loss.
    pub overlap_pagination: bool,
    /// Parameters sent on every call.
    pub default_params: &'static [(&'static str, &'static str)],
    /// Issue one call per value of the named parameter and concatenate.
    pub param_sweep: Option<(&'static str, &'static [&'static str])>,
}

impl EndpointDef {
    /// Wire name, with the vip preference applied.
    pub fn api_name(&self) -> String {
        if self.has_vip {
            format!("{}_vip", self.data_type)
        } else {
            self.data_type.to_string()
        }
    }
}

const fn endpoint(
    data_type: &'static str,
    has_vip: bool,
    param_style: ParamStyle,
    paginated: bool,
) -> EndpointDef {
    EndpointDef {
        data_type,
        has_vip,
        param_style,
        paginated,
        overlap_pagination: false,
        default_params: &[],
        param_sweep: None,
    }
}

pub static ENDPOINTS: &[EndpointDef] = &[
    // Quarterly financial statements (vip variants return the whole market
    // per period).
    endpoint("income", true, ParamStyle::Period, true),
    endpoint("balancesheet", true, ParamStyle::Period, true),
    endpoint("cashflow", true, ParamStyle::Period, true),
    endpoint("fina_indicator", true, ParamStyle::Period, true),
    endpoint("express", true, ParamStyle::Period, false),
    endpoint("forecast", true, ParamStyle::Period, false),
    endpoint("fina_mainbz", true, ParamStyle::Period, true),
    // Event-dated corporate actions.
    endpoint("dividend", false, ParamStyle::EventDate, false),
    // Per-trading-day market data. `daily` pages with an overlap because the
    // vendor has been observed to drop boundary rows on exact offsets.
    EndpointDef {
        data_type: "daily",
        has_vip: false,
        param_style: ParamStyle::TradeDate,
        paginated: true,
        overlap_pagination: true,
        default_params: &[],
        param_sweep: None,
    },
    endpoint("daily_basic", false, ParamStyle::TradeDate, true),
    endpoint("adj_factor", false, ParamStyle::TradeDate, true),
    // Full-state snapshots.
    EndpointDef {
        data_type: "stock_basic",
        has_vip: false,
        param_style: ParamStyle::FullState,
        paginated: false,
        overlap_pagination: false,
        default_params: &[(
            "fields",
            "ts_code,symbol,name,area,industry,fullname,enname,cnspell,market,\
             exchange,curr_type,list_status,list_date,delist_date,is_hs,act_name,act_ent_type",
        )],
        param_sweep: Some(("list_status", &["L", "D", "P"])),
    },
    endpoint("index_basic", false, ParamStyle::FullState, false),
    endpoint("index_classify", false, ParamStyle::FullState, false),
    EndpointDef {
        data_type: "trade_cal",
        has_vip: false,
        param_style: ParamStyle::FullState,
        paginated: false,
        overlap_pagination: false,
        default_params: &[
            ("start_date", "20000101"),
            ("end_date", "20301231"),
            ("fields", "exchange,cal_date,is_open,pretrade_date"),
        ],
        param_sweep: None,
    },
    // Code-driven whole-history pulls.
    endpoint("index_daily", false, ParamStyle::Code, true),
    endpoint("stk_holdernumber", false, ParamStyle::Code, false),
    // Index constituent weights, one month window per call.
    endpoint("index_weight", false, ParamStyle::IndexMonth, true),
];

/// Resolve a manifest data type to its endpoint definition.
pub fn resolve(data_type: &str) -> Result<&'static EndpointDef> {
    match ENDPOINTS.iter().find(|e| e.data_type == data_type) {
        Some(def) => Ok(def),
        None => bail!("unsupported data_type '{data_type}': no endpoint registered"),
    }
}
