//! tickvault: vendor-data ingestion and archival pipeline.
//!
//! Pulls tabular datasets from a rate-limited vendor API, lands them as
//! partitioned parquet files with sidecar metadata, records every request in
//! a durable SQLite log, and exposes backfill / update / quality-check
//! primitives over the whole asset manifest.

pub mod archivers;
pub mod calendar;
pub mod client;
pub mod config;
pub mod frame;
pub mod manifest;
pub mod pipeline;
pub mod quality;
pub mod request_log;
pub mod storage;

pub use client::{FetchStatus, VendorClient};
pub use frame::Frame;
pub use manifest::{ArchiverKind, Asset};
