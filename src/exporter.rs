//! Exporter trait and per-cycle fan-out.
//!
//! Every matrix a cycle produces is offered to every exporter in the
//! collector's set, in registration order. Exporter failures are counted
//! and logged but never abort the cycle or starve other exporters.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use strum_macros::{AsRefStr, Display, EnumString};

use crate::errors::PollerError;
use crate::matrix::Matrix;

pub mod influxdb;
pub mod prometheus;

pub use influxdb::InfluxDbExporter;
pub use prometheus::PrometheusExporter;

/// Wire family an exporter speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, AsRefStr)]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum ExporterClass {
    Prometheus,
    Influxdb,
}

/// Success and error counters, shared with the status endpoint.
#[derive(Debug, Default)]
pub struct ExportCounters {
    exported: AtomicU64,
    errors: AtomicU64,
}

impl ExportCounters {
    pub fn record_ok(&self) {
        self.exported.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    /// (exported, errors) as of now.
    pub fn snapshot(&self) -> (u64, u64) {
        (
            self.exported.load(Ordering::Relaxed),
            self.errors.load(Ordering::Relaxed),
        )
    }
}

/// One downstream time-series consumer.
#[async_trait]
pub trait Exporter: Send + Sync {
    /// Configured exporter name, unique within the poller.
    fn name(&self) -> &str;

    fn class(&self) -> ExporterClass;

    /// One-time setup before the first export.
    async fn init(&self) -> Result<(), PollerError> {
        Ok(())
    }

    /// Publish one matrix. Pull-style exporters buffer a snapshot here;
    /// push-style exporters enqueue and flush in the background.
    async fn export(&self, matrix: &Matrix) -> Result<(), PollerError>;

    fn counters(&self) -> &ExportCounters;

    /// (code, message) for the status endpoint; 0 means healthy.
    fn status(&self) -> (u8, String) {
        (0, "ok".to_string())
    }
}

/// Offer every matrix to every exporter, isolating failures.
///
/// Returns the number of failed (exporter, matrix) deliveries.
pub async fn fan_out(exporters: &[Arc<dyn Exporter>], matrices: &[&Matrix]) -> u64 {
    let mut failures = 0u64;
    for exporter in exporters {
        for matrix in matrices {
            if !matrix.is_exportable() {
                continue;
            }
            match exporter.export(matrix).await {
                Ok(()) => exporter.counters().record_ok(),
                Err(e) => {
                    exporter.counters().record_error();
                    failures += 1;
                    tracing::warn!(
                        exporter = %exporter.name(),
                        object = %matrix.object(),
                        error = %e,
                        "export failed"
                    );
                }
            }
        }
    }
    failures
}
