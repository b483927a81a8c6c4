//! Strata - Multi-Target Storage Telemetry Poller
//!
//! This crate collects performance and capacity counters from managed
//! storage clusters and publishes them to time-series backends. It can
//! be used as a library by other Rust projects, or run as a standalone
//! binary with the `strata` executable.
//!
//! # Architecture
//!
//! - **Matrix**: columnar store for one object's counters per cycle
//! - **Schedule**: per-collector task timing with standoff on failure
//! - **Plugins**: post-processing chain (label shaping, aggregation, ...)
//! - **Collectors**: adapt protocol responses into Matrix form
//! - **Exporters**: prometheus pull and influxdb push fan-out
//! - **Poller**: runtime wiring one target's collectors and exporters
//!
//! Data flows `protocol client -> collector -> matrix -> plugin chain ->
//! exporter fan-out`.

pub mod collector;
pub mod config;
pub mod errors;
pub mod exporter;
pub mod matrix;
pub mod plugin;
pub mod poller;
pub mod schedule;
pub mod server;

pub use errors::PollerError;
pub use matrix::Matrix;
pub use poller::Poller;
