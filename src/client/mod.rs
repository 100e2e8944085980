//! Vendor API client.
//!
//! Single chokepoint for outbound calls. Every fetch goes through the shared
//! rate limiter, a bounded retry policy (transient errors and the vendor's
//! occasional spurious empty responses), and, for capped endpoints, offset
//! pagination with on-the-fly `limitmax` discovery. Archivers only ever see
//! `(Frame, FetchStatus)`; errors never propagate past this module.

pub mod endpoints;
pub mod rate_limit;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, error, info, warn};

use crate::config::{Config, LimitmaxStore, DEFAULT_LIMITMAX};
use crate::frame::Frame;
pub use endpoints::{resolve, EndpointDef, ParamStyle};
pub use rate_limit::RateLimiter;

/// Rows deliberately refetched when advancing an overlapping offset.
const PAGE_OVERLAP: usize = 100;

/// Request parameters, ordered so the logged JSON is stable.
pub type Params = BTreeMap<String, String>;

pub fn params(entries: &[(&str, &str)]) -> Params {
    entries
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchStatus {
    Success,
    Error,
}

/// Transport seam under the client: one raw API call, one frame back.
/// Production uses HTTP; tests script this.
#[async_trait]
pub trait VendorTransport: Send + Sync {
    async fn call(&self, api_name: &str, params: &Params) -> Result<Frame>;
}

#[derive(Deserialize)]
struct ApiEnvelope {
    code: i64,
    msg: Option<String>,
    data: Option<ApiData>,
}

#[derive(Deserialize)]
struct ApiData {
    fields: Vec<String>,
    items: Vec<Vec<serde_json::Value>>,
}

/// HTTP transport speaking the vendor's JSON-POST protocol.
pub struct HttpTransport {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

impl HttpTransport {
    pub fn new(config: &Config) -> Result<HttpTransport> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .pool_max_idle_per_host(4)
            .build()
            .context("failed to build vendor HTTP client")?;
        Ok(HttpTransport {
            http,
            base_url: config.api_base_url.clone(),
            token: config.token.clone(),
        })
    }
}

#[async_trait]
impl VendorTransport for HttpTransport {
    async fn call(&self, api_name: &str, params: &Params) -> Result<Frame> {
        let body = serde_json::json!({
            "api_name": api_name,
            "token": self.token,
            "params": params,
            "fields": "",
        });

        let resp = self
            .http
            .post(&self.base_url)
            .json(&body)
            .send()
            .await
            .with_context(|| format!("POST {api_name} failed"))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            bail!("POST {api_name} {status}: {text}");
        }

        let envelope: ApiEnvelope = resp
            .json()
            .await
            .with_context(|| format!("failed to parse {api_name} response"))?;

        if envelope.code != 0 {
            bail!(
                "vendor error on {api_name}: code {} ({})",
                envelope.code,
                envelope.msg.unwrap_or_default()
            );
        }

        Ok(match envelope.data {
            Some(data) => Frame::from_vendor_payload(&data.fields, &data.items),
            None => Frame::empty(),
        })
    }
}

pub struct VendorClient {
    transport: Arc<dyn VendorTransport>,
    limiter: Arc<RateLimiter>,
    limitmax: Arc<LimitmaxStore>,
    retry_count: u32,
    retry_delay: Duration,
}

impl VendorClient {
    pub fn new(
        transport: Arc<dyn VendorTransport>,
        limiter: Arc<RateLimiter>,
        limitmax: Arc<LimitmaxStore>,
        retry_count: u32,
        retry_delay: Duration,
    ) -> VendorClient {
        VendorClient {
            transport,
            limiter,
            limitmax,
            retry_count,
            retry_delay,
        }
    }

    pub fn from_config(config: &Config) -> Result<VendorClient> {
        Ok(VendorClient::new(
            Arc::new(HttpTransport::new(config)?),
            Arc::new(RateLimiter::new(config.max_requests_per_minute)),
            Arc::new(LimitmaxStore::load(config.limitmax_path())),
            config.retry_count,
            Duration::from_millis(config.retry_delay_ms),
        ))
    }

    /// Fetch one partition's worth of data. Never fails: errors come back as
    /// an empty frame with [`FetchStatus::Error`] after logging.
    pub async fn fetch(&self, endpoint: &EndpointDef, request: &Params) -> (Frame, FetchStatus) {
        match self.fetch_inner(endpoint, request).await {
            Ok(frame) => (frame, FetchStatus::Success),
            Err(e) => {
                error!(
                    endpoint = endpoint.data_type,
                    "fetch failed after retries: {e:#}"
                );
                (Frame::empty(), FetchStatus::Error)
            }
        }
    }

    // ------------------------------------------------------------------
    // Typed entry points
    // ------------------------------------------------------------------

    pub async fn income(&self, period: &str) -> (Frame, FetchStatus) {
        self.keyed("income", "period", period).await
    }

    pub async fn balancesheet(&self, period: &str) -> (Frame, FetchStatus) {
        self.keyed("balancesheet", "period", period).await
    }

    pub async fn cashflow(&self, period: &str) -> (Frame, FetchStatus) {
        self.keyed("cashflow", "period", period).await
    }

    pub async fn daily(&self, trade_date: &str) -> (Frame, FetchStatus) {
        self.keyed("daily", "trade_date", trade_date).await
    }

    pub async fn daily_basic(&self, trade_date: &str) -> (Frame, FetchStatus) {
        self.keyed("daily_basic", "trade_date", trade_date).await
    }

    pub async fn adj_factor(&self, trade_date: &str) -> (Frame, FetchStatus) {
        self.keyed("adj_factor", "trade_date", trade_date).await
    }

    pub async fn dividend(&self, ann_date: &str) -> (Frame, FetchStatus) {
        self.keyed("dividend", "ann_date", ann_date).await
    }

    pub async fn stock_basic(&self) -> (Frame, FetchStatus) {
        self.unkeyed("stock_basic").await
    }

    pub async fn trade_cal(&self) -> (Frame, FetchStatus) {
        self.unkeyed("trade_cal").await
    }

    pub async fn stk_holdernumber(&self, ts_code: &str) -> (Frame, FetchStatus) {
        self.keyed("stk_holdernumber", "ts_code", ts_code).await
    }

    pub async fn index_daily(&self, ts_code: &str) -> (Frame, FetchStatus) {
        self.keyed("index_daily", "ts_code", ts_code).await
    }

    pub async fn index_weight(
        &self,
        index_code: &str,
        start_date: &str,
        end_date: &str,
    ) -> (Frame, FetchStatus) {
        match resolve("index_weight") {
            Ok(def) => {
                let request = params(&[
                    ("index_code", index_code),
                    ("start_date", start_date),
                    ("end_date", end_date),
                ]);
                self.fetch(def, &request).await
            }
            Err(e) => {
                error!("index_weight endpoint missing: {e:#}");
                (Frame::empty(), FetchStatus::Error)
            }
        }
    }

    async fn keyed(&self, data_type: &str, key_param: &str, key: &str) -> (Frame, FetchStatus) {
        match resolve(data_type) {
            Ok(def) => self.fetch(def, &params(&[(key_param, key)])).await,
            Err(e) => {
                error!("{data_type} endpoint missing: {e:#}");
                (Frame::empty(), FetchStatus::Error)
            }
        }
    }

    async fn unkeyed(&self, data_type: &str) -> (Frame, FetchStatus) {
        match resolve(data_type) {
            Ok(def) => self.fetch(def, &Params::new()).await,
            Err(e) => {
                error!("{data_type} endpoint missing: {e:#}");
                (Frame::empty(), FetchStatus::Error)
            }
        }
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    async fn fetch_inner(&self, endpoint: &EndpointDef, request: &Params) -> Result<Frame> {
        let mut merged: Params = endpoints_defaults(endpoint);
        merged.extend(request.clone());

        match endpoint.param_sweep {
            Some((sweep_param, values)) => {
                let mut combined = Frame::empty();
                for value in values {
                    let mut swept = merged.clone();
                    swept.insert(sweep_param.to_string(), value.to_string());
                    let page = self.fetch_one(endpoint, &swept).await?;
                    if !page.is_empty() {
                        debug!(
                            endpoint = endpoint.data_type,
                            sweep_param,
                            sweep_value = value,
                            rows = page.row_count(),
                            "sweep page fetched"
                        );
                        combined.append(page)?;
                    }
                }
                Ok(combined)
            }
            None => self.fetch_one(endpoint, &merged).await,
        }
    }

    async fn fetch_one(&self, endpoint: &EndpointDef, request: &Params) -> Result<Frame> {
        if endpoint.paginated {
            self.fetch_paginated(endpoint, request).await
        } else {
            self.call_with_retry(&endpoint.api_name(), request).await
        }
    }

    /// Offset pagination with limitmax discovery.
    ///
    /// Termination: a page smaller than the cap, or an empty page. A page
    /// *larger* than the cap means the configured cap was stale; the
    /// observed size becomes the new cap and is persisted.
    async fn fetch_paginated(&self, endpoint: &EndpointDef, request: &Params) -> Result<Frame> {
        let api_name = endpoint.api_name();
        let mut limitmax = self
            .limitmax
            .get(endpoint.data_type)
            .unwrap_or(DEFAULT_LIMITMAX);

        let mut combined = Frame::empty();
        let mut offset = 0usize;
        let mut page_no = 0usize;

        loop {
            page_no += 1;
            let mut page_params = request.clone();
            if offset > 0 {
                page_params.insert("offset".to_string(), offset.to_string());
            }
            let page = self.call_with_retry(&api_name, &page_params).await?;
            if page.is_empty() {
                debug!(endpoint = endpoint.data_type, page_no, "empty page, pagination done");
                break;
            }

            let rows = page.row_count();
            combined.append(page)?;
            debug!(endpoint = endpoint.data_type, page_no, rows, offset, "page fetched");

            if rows > limitmax {
                self.limitmax.record(endpoint.data_type, rows);
                limitmax = rows;
            } else if rows < limitmax {
                break;
            }

            // The overlap deliberately refetches boundary rows; the final
            // dedup removes them again.
            offset += if endpoint.overlap_pagination {
                rows.saturating_sub(PAGE_OVERLAP).max(1)
            } else {
                rows
            };
        }

        let removed = combined.dedup_rows();
        if removed > 0 {
            debug!(
                endpoint = endpoint.data_type,
                removed, "dropped duplicate rows after pagination"
            );
        }
        Ok(combined)
    }

    /// One logical call: rate-limited, retried on transport errors and on
    /// suspicious empty responses. The final empty is accepted as truth.
    async fn call_with_retry(&self, api_name: &str, request: &Params) -> Result<Frame> {
        for attempt in 0..=self.retry_count {
            self.limiter.acquire().await;
            match self.transport.call(api_name, request).await {
                Ok(frame) if !frame.is_empty() => {
                    if attempt > 0 {
                        info!(api_name, attempt, rows = frame.row_count(), "retry recovered data");
                    }
                    return Ok(frame);
                }
                Ok(frame) => {
                    if attempt < self.retry_count {
                        warn!(api_name, attempt, "empty response, retrying");
                        tokio::time::sleep(self.retry_delay / 2).await;
                    } else {
                        debug!(api_name, "empty response confirmed after retries");
                        return Ok(frame);
                    }
                }
                Err(e) => {
                    if attempt < self.retry_count {
                        warn!(api_name, attempt, "call failed: {e:#}, retrying");
                        tokio::time::sleep(self.retry_delay).await;
                    } else {
                        return Err(e);
                    }
                }
            }
        }
        Ok(Frame::empty())
    }
}

fn endpoints_defaults(endpoint: &EndpointDef) -> Params {
    endpoint
        .default_params
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}
