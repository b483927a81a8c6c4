//! Pull exporter: renders matrices to text exposition format.
//!
//! `export` renders the matrix into complete text lines and swaps them
//! into a shared cache keyed by (collector identifier, object), so the
//! HTTP endpoint never sees a half-written matrix. `/metrics` concatenates
//! the most recent snapshot of every key.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::errors::PollerError;
use crate::matrix::{Matrix, MetricKind};

use super::{ExportCounters, Exporter, ExporterClass};

type Cache = Arc<RwLock<BTreeMap<String, String>>>;

/// Shared read side of the exposition cache, handed to the HTTP server.
#[derive(Clone, Default)]
pub struct MetricsHandle {
    cache: Cache,
}

impl MetricsHandle {
    /// The full exposition payload as of the last exports.
    pub async fn text(&self) -> String {
        let cache = self.cache.read().await;
        let mut out = String::new();
        for chunk in cache.values() {
            out.push_str(chunk);
        }
        out
    }
}

pub struct PrometheusExporter {
    name: String,
    prefix: String,
    cache: Cache,
    counters: ExportCounters,
}

impl PrometheusExporter {
    pub fn new(name: impl Into<String>, prefix: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            prefix: prefix.into(),
            cache: Cache::default(),
            counters: ExportCounters::default(),
        }
    }

    /// Read handle for the HTTP server.
    pub fn handle(&self) -> MetricsHandle {
        MetricsHandle {
            cache: Arc::clone(&self.cache),
        }
    }

    fn render(&self, matrix: &Matrix) -> String {
        let mut out = String::new();
        for metric in matrix.metrics() {
            if !metric.is_exportable() {
                continue;
            }
            let line_name = metric_name(&self.prefix, matrix.object(), metric.export_name());
            for (key, instance) in matrix.instances() {
                if !instance.is_exportable() {
                    continue;
                }
                let Some(value) = matrix.export_value(metric.name(), key) else {
                    continue;
                };
                // Raw percent values may overshoot on counter wrap; the
                // exported rendering is clamped, the stored value is not.
                let value = if metric.kind() == MetricKind::Percent {
                    value.clamp(0.0, 100.0)
                } else {
                    value
                };

                let mut labels: BTreeMap<&str, &str> = matrix
                    .global_labels()
                    .iter()
                    .map(|(k, v)| (k.as_str(), v.as_str()))
                    .collect();
                for (k, v) in instance.labels() {
                    labels.insert(k, v);
                }
                if let Some(bucket) = metric.bucket() {
                    labels.insert("bucket", bucket);
                }

                out.push_str(&line_name);
                if !labels.is_empty() {
                    out.push('{');
                    for (i, (k, v)) in labels.iter().enumerate() {
                        if i > 0 {
                            out.push(',');
                        }
                        let _ = write!(out, "{k}=\"{}\"", escape_label(v));
                    }
                    out.push('}');
                }
                let _ = writeln!(out, " {value}");
            }
        }
        out
    }
}

#[async_trait]
impl Exporter for PrometheusExporter {
    fn name(&self) -> &str {
        &self.name
    }

    fn class(&self) -> ExporterClass {
        ExporterClass::Prometheus
    }

    async fn export(&self, matrix: &Matrix) -> Result<(), PollerError> {
        let rendered = self.render(matrix);
        let key = format!("{}:{}", matrix.identifier(), matrix.object());
        self.cache.write().await.insert(key, rendered);
        Ok(())
    }

    fn counters(&self) -> &ExportCounters {
        &self.counters
    }
}

fn metric_name(prefix: &str, object: &str, metric: &str) -> String {
    let raw = format!("{prefix}_{object}_{metric}");
    raw.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect()
}

fn escape_label(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}
