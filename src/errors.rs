//! Error types shared across the poller.
//!
//! `PollerError` enumerates the semantic failure classes of the collection
//! pipeline. The collector's cycle loop routes on these kinds (standoff,
//! re-discovery, skip-cell, ...), so variants carry the failing subject
//! rather than wrapping arbitrary sources.

use thiserror::Error;

/// Errors raised by collectors, plugins, exporters and the runtime.
#[derive(Debug, Error)]
pub enum PollerError {
    /// Invalid or unreadable configuration.
    #[error("config error: {0}")]
    Config(String),

    /// A required parameter is missing.
    #[error("missing parameter: {0}")]
    MissingParam(String),

    /// A parameter has an invalid value.
    #[error("invalid parameter: {0}")]
    InvalidParam(String),

    /// The protocol client could not authenticate.
    #[error("authentication failed: {0}")]
    AuthFailure(String),

    /// The target system is unreachable.
    #[error("connection error: {0}")]
    Connection(String),

    /// The target responded with something we could not use.
    #[error("protocol response error: {0}")]
    ProtocolResponse(String),

    /// The source counter list changed incompatibly.
    #[error("schema conflict: {0}")]
    SchemaConflict(String),

    /// The source returned no instances for the object.
    #[error("no instances of object {0}")]
    NoInstances(String),

    /// The source returned no metrics for the object.
    #[error("no metrics of object {0}")]
    NoMetrics(String),

    /// A cell value could not be parsed into a number.
    #[error("parse value: {0}")]
    ParseValue(String),

    /// An exporter failed to publish a matrix.
    #[error("exporter failure: {0}")]
    ExporterFailure(String),

    /// Shutdown was requested; always treated as clean.
    #[error("cancelled")]
    Cancelled,
}

impl PollerError {
    /// Failures that put the collector into standoff and retry re-init.
    pub fn is_standoff(&self) -> bool {
        matches!(
            self,
            Self::AuthFailure(_) | Self::Connection(_) | Self::ProtocolResponse(_)
        )
    }

    /// Short class name used in status messages and metadata labels.
    pub fn class(&self) -> &'static str {
        match self {
            Self::Config(_) => "config",
            Self::MissingParam(_) => "missing_param",
            Self::InvalidParam(_) => "invalid_param",
            Self::AuthFailure(_) => "auth_failure",
            Self::Connection(_) => "connection",
            Self::ProtocolResponse(_) => "protocol_response",
            Self::SchemaConflict(_) => "schema_conflict",
            Self::NoInstances(_) => "no_instances",
            Self::NoMetrics(_) => "no_metrics",
            Self::ParseValue(_) => "parse_value",
            Self::ExporterFailure(_) => "exporter_failure",
            Self::Cancelled => "cancelled",
        }
    }
}
