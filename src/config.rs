//! Process configuration.
//!
//! Everything the pipeline needs from the environment lives here, plus the
//! persisted per-endpoint `limitmax` discoveries: when pagination observes a
//! page larger than the configured cap, the new cap is written through to
//! `<base>/config/limitmax.json` so later runs start from the corrected
//! value.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use parking_lot::Mutex;
use tracing::{info, warn};

pub const DEFAULT_API_BASE: &str = "http://api.tushare.pro";
pub const DEFAULT_MAX_REQUESTS_PER_MINUTE: usize = 80;
pub const DEFAULT_RETRY_COUNT: u32 = 3;
pub const DEFAULT_RETRY_DELAY_MS: u64 = 1000;
pub const DEFAULT_LIMITMAX: usize = 3000;

#[derive(Debug, Clone)]
pub struct Config {
    /// Root of the on-disk data asset (`DATA_PATH`, default `./data`).
    pub base_data_path: PathBuf,
    /// Vendor credential (`TUSHARE_TOKEN`).
    pub token: String,
    /// Vendor API entry point (`TUSHARE_API_URL`).
    pub api_base_url: String,
    /// Sliding-window budget (`MAX_REQUESTS_PER_MINUTE`).
    pub max_requests_per_minute: usize,
    /// Retry attempts for transient errors and suspicious empties.
    pub retry_count: u32,
    /// Base back-off between retries, in milliseconds.
    pub retry_delay_ms: u64,
}

impl Config {
    /// Read configuration from the environment. Only the credential is
    /// required; everything else has a default.
    pub fn from_env() -> Result<Config> {
        let base_data_path = std::env::var("DATA_PATH").unwrap_or_else(|_| "./data".to_string());
        let token = std::env::var("TUSHARE_TOKEN")
            .context("TUSHARE_TOKEN is not set; the vendor client cannot authenticate")?;
        let api_base_url =
            std::env::var("TUSHARE_API_URL").unwrap_or_else(|_| DEFAULT_API_BASE.to_string());

        Ok(Config {
            base_data_path: PathBuf::from(base_data_path),
            token,
            api_base_url,
            max_requests_per_minute: env_parse(
                "MAX_REQUESTS_PER_MINUTE",
                DEFAULT_MAX_REQUESTS_PER_MINUTE,
            ),
            retry_count: env_parse("FETCH_RETRY_COUNT", DEFAULT_RETRY_COUNT),
            retry_delay_ms: env_parse("FETCH_RETRY_DELAY_MS", DEFAULT_RETRY_DELAY_MS),
        })
    }

    /// Configuration for tests and offline runs: no credential, tempdir root.
    pub fn for_base_path(base: impl Into<PathBuf>) -> Config {
        Config {
            base_data_path: base.into(),
            token: String::new(),
            api_base_url: DEFAULT_API_BASE.to_string(),
            max_requests_per_minute: DEFAULT_MAX_REQUESTS_PER_MINUTE,
            retry_count: DEFAULT_RETRY_COUNT,
            retry_delay_ms: DEFAULT_RETRY_DELAY_MS,
        }
    }

    pub fn landing_root(&self) -> PathBuf {
        self.base_data_path.join("raw").join("landing").join("tushare")
    }

    pub fn log_db_path(&self) -> PathBuf {
        self.base_data_path.join("logs").join("request_log.db")
    }

    pub fn limitmax_path(&self) -> PathBuf {
        self.base_data_path.join("config").join("limitmax.json")
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    match std::env::var(name) {
        Ok(raw) => raw.parse().unwrap_or_else(|_| {
            warn!("ignoring unparseable {name}={raw}");
            default
        }),
        Err(_) => default,
    }
}

/// Persisted per-endpoint page-size caps.
///
/// The vendor caps response size per call, but the cap differs by endpoint
/// and account tier and is not advertised; it is discovered when a page comes
/// back larger than expected. Discoveries survive the process so pagination
/// converges over time.
pub struct LimitmaxStore {
    path: PathBuf,
    entries: Mutex<HashMap<String, usize>>,
}

impl LimitmaxStore {
    pub fn load(path: impl Into<PathBuf>) -> LimitmaxStore {
        let path = path.into();
        let entries = match fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str::<HashMap<String, usize>>(&raw) {
                Ok(entries) => entries,
                Err(e) => {
                    warn!("ignoring malformed limitmax file {}: {e}", path.display());
                    HashMap::new()
                }
            },
            Err(_) => HashMap::new(),
        };
        LimitmaxStore {
            path,
            entries: Mutex::new(entries),
        }
    }

    pub fn get(&self, endpoint: &str) -> Option<usize> {
        self.entries.lock().get(endpoint).copied()
    }

    /// Record a larger observed page size and persist the file. Smaller
    /// observations never lower a recorded cap.
    pub fn record(&self, endpoint: &str, observed: usize) {
        let mut entries = self.entries.lock();
        let current = entries.get(endpoint).copied().unwrap_or(0);
        if observed <= current {
            return;
        }
        entries.insert(endpoint.to_string(), observed);
        info!(endpoint, limitmax = observed, "persisting discovered limitmax");
        if let Err(e) = persist(&self.path, &entries) {
            warn!("failed to persist limitmax file: {e:#}");
        }
    }
}

fn persist(path: &Path, entries: &HashMap<String, usize>) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let body = serde_json::to_string_pretty(entries)?;
    fs::write(path, body).with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}
