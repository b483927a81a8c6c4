//! Configuration loading for pollers and exporters.
//!
//! One YAML file drives the whole process: an `exporters` section, a
//! `pollers` section, and a `defaults` section merged into every poller.
//! Environment variables in the file are expanded before parsing.

pub mod app;
pub mod validation;

pub use app::{
    AppConfig, CollectorConfig, ExporterConfig, PollerConfig, PollerDefaults, ServerConfig,
    DEFAULT_PREFIX,
};
pub use validation::{expand_env_vars, ConfigError};
