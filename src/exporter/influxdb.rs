//! Push exporter: InfluxDB line protocol over HTTP.
//!
//! `export` only renders and enqueues; a single background worker flushes
//! batches so the collection cycle never blocks on network I/O. The queue
//! is bounded with a drop-oldest policy.

use std::collections::VecDeque;
use std::fmt::Write as _;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::errors::PollerError;
use crate::matrix::Matrix;

use super::{ExportCounters, Exporter, ExporterClass};

const DEFAULT_QUEUE_CAP: usize = 10_000;
const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(5);
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub struct InfluxDbExporter {
    name: String,
    prefix: String,
    url: String,
    token: Option<String>,
    client: reqwest::Client,
    queue: Arc<Mutex<VecDeque<String>>>,
    queue_cap: usize,
    flush_interval: Duration,
    counters: Arc<ExportCounters>,
}

impl InfluxDbExporter {
    pub fn new(
        name: impl Into<String>,
        prefix: impl Into<String>,
        url: impl Into<String>,
        token: Option<String>,
    ) -> Result<Self, PollerError> {
        let client = reqwest::Client::builder()
            .timeout(DEFAULT_REQUEST_TIMEOUT)
            .build()
            .map_err(|e| PollerError::Config(format!("influxdb client: {e}")))?;
        Ok(Self {
            name: name.into(),
            prefix: prefix.into(),
            url: url.into(),
            token,
            client,
            queue: Arc::new(Mutex::new(VecDeque::new())),
            queue_cap: DEFAULT_QUEUE_CAP,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            counters: Arc::new(ExportCounters::default()),
        })
    }

    pub fn with_queue_cap(mut self, cap: usize) -> Self {
        self.queue_cap = cap.max(1);
        self
    }

    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    /// Start the background flush worker; one per exporter.
    pub fn spawn_flusher(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let queue = Arc::clone(&self.queue);
        let counters = Arc::clone(&self.counters);
        let client = self.client.clone();
        let url = self.url.clone();
        let token = self.token.clone();
        let name = self.name.clone();
        let interval = self.flush_interval;

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                flush(&client, &url, token.as_deref(), &queue, &counters, &name).await;
            }
            // Best-effort final flush on shutdown.
            flush(&client, &url, token.as_deref(), &queue, &counters, &name).await;
            tracing::debug!(exporter = %name, "flush worker stopped");
        })
    }

    fn enqueue(&self, lines: Vec<String>) {
        let mut queue = self
            .queue
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut dropped = 0usize;
        for line in lines {
            if queue.len() >= self.queue_cap {
                queue.pop_front();
                dropped += 1;
            }
            queue.push_back(line);
        }
        if dropped > 0 {
            tracing::warn!(exporter = %self.name, dropped, "queue full, dropped oldest lines");
        }
    }

    fn render(&self, matrix: &Matrix) -> Vec<String> {
        let ts = chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default();
        let mut lines = Vec::new();
        for (key, instance) in matrix.instances() {
            if !instance.is_exportable() {
                continue;
            }
            let mut fields = String::new();
            for metric in matrix.metrics() {
                if !metric.is_exportable() {
                    continue;
                }
                let Some(value) = matrix.export_value(metric.name(), key) else {
                    continue;
                };
                if !fields.is_empty() {
                    fields.push(',');
                }
                let _ = write!(fields, "{}={value}", field_key(metric.export_name()));
            }
            if fields.is_empty() {
                continue;
            }

            let mut line = format!("{}_{}", self.prefix, matrix.object());
            for (k, v) in matrix.global_labels() {
                let _ = write!(line, ",{}={}", escape_tag(k), escape_tag(v));
            }
            for (k, v) in instance.labels() {
                if v.is_empty() {
                    continue;
                }
                let _ = write!(line, ",{}={}", escape_tag(k), escape_tag(v));
            }
            let _ = write!(line, " {fields} {ts}");
            lines.push(line);
        }
        lines
    }

    #[cfg(test)]
    fn queued(&self) -> Vec<String> {
        self.queue.lock().unwrap().iter().cloned().collect()
    }
}

async fn flush(
    client: &reqwest::Client,
    url: &str,
    token: Option<&str>,
    queue: &Mutex<VecDeque<String>>,
    counters: &ExportCounters,
    name: &str,
) {
    let batch: Vec<String> = {
        let mut queue = queue.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        queue.drain(..).collect()
    };
    if batch.is_empty() {
        return;
    }
    let body = batch.join("\n");
    let mut request = client.post(url).body(body);
    if let Some(token) = token {
        request = request.header("Authorization", format!("Token {token}"));
    }
    match request.send().await {
        Ok(response) if response.status().is_success() => {
            tracing::debug!(exporter = %name, lines = batch.len(), "flushed batch");
        }
        Ok(response) => {
            counters.record_error();
            tracing::warn!(
                exporter = %name,
                status = %response.status(),
                lines = batch.len(),
                "influxdb write rejected, batch dropped"
            );
        }
        Err(e) => {
            counters.record_error();
            tracing::warn!(exporter = %name, error = %e, lines = batch.len(), "influxdb write failed, batch dropped");
        }
    }
}

#[async_trait]
impl Exporter for InfluxDbExporter {
    fn name(&self) -> &str {
        &self.name
    }

    fn class(&self) -> ExporterClass {
        ExporterClass::Influxdb
    }

    async fn export(&self, matrix: &Matrix) -> Result<(), PollerError> {
        self.enqueue(self.render(matrix));
        Ok(())
    }

    fn counters(&self) -> &ExportCounters {
        &self.counters
    }
}

fn field_key(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect()
}

fn escape_tag(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace(',', "\\,")
        .replace('=', "\\=")
        .replace(' ', "\\ ")
}
