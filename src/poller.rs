//! Poller runtime: wiring, workers, shutdown.
//!
//! A poller owns one target's collectors and exporters. Exporters are
//! built first from the config's `exporters` section, then each
//! collector is wired to its poller's exporter subset. One worker task
//! drives each collector; the HTTP server runs alongside until the
//! cancel token fires, after which workers get a drain deadline.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::collector::{runner, Collector, CollectorStatus, ProtocolClient};
use crate::config::{AppConfig, ExporterConfig, PollerConfig, ServerConfig};
use crate::errors::PollerError;
use crate::exporter::{
    Exporter, ExporterClass, InfluxDbExporter, PrometheusExporter, prometheus::MetricsHandle,
};
use crate::server::{create_router, AppState};

/// How long workers get to exit after cancellation.
const DRAIN_DEADLINE: Duration = Duration::from_secs(30);

/// Builds protocol clients for a poller's collectors.
///
/// Concrete clients stay outside the collection pipeline; the runtime
/// asks the factory for one per collector, handing it the poller's
/// target address and credentials.
pub type ClientFactory =
    dyn Fn(&str, &PollerConfig) -> Result<Box<dyn ProtocolClient>, PollerError> + Send + Sync;

pub struct Poller {
    name: String,
    server: ServerConfig,
    collectors: Vec<Collector>,
    exporters: Vec<Arc<dyn Exporter>>,
    influx: Vec<Arc<InfluxDbExporter>>,
    metrics: Option<MetricsHandle>,
    drain_deadline: Duration,
}

impl std::fmt::Debug for Poller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Poller")
            .field("name", &self.name)
            .field("collectors", &self.collectors.len())
            .field("exporters", &self.exporters.len())
            .finish_non_exhaustive()
    }
}

impl Poller {
    /// Wire one poller from the loaded config.
    ///
    /// A collector that fails to initialize is logged and skipped; the
    /// poller comes up with the rest. All collectors failing is an error.
    pub fn new(
        name: impl Into<String>,
        config: &AppConfig,
        client_factory: &ClientFactory,
    ) -> Result<Self, PollerError> {
        let name = name.into();
        let poller_config = config.poller(&name)?;

        let mut exporters: Vec<Arc<dyn Exporter>> = Vec::new();
        let mut influx = Vec::new();
        let mut metrics = None;
        for exporter_name in poller_config.exporter_names() {
            let spec = config.exporters.get(exporter_name).ok_or_else(|| {
                PollerError::Config(format!("exporter not found: {exporter_name}"))
            })?;
            match build_exporter(exporter_name, spec)? {
                BuiltExporter::Prometheus(exporter) => {
                    if metrics.is_none() {
                        metrics = Some(exporter.handle());
                    }
                    exporters.push(exporter);
                }
                BuiltExporter::Influx(exporter) => {
                    influx.push(Arc::clone(&exporter));
                    exporters.push(exporter);
                }
            }
        }

        let intervals = poller_config.schedule();
        let global_labels = poller_config.global_labels(&name);
        let mut collectors = Vec::new();
        let mut configured = 0usize;
        for collector_config in &poller_config.collectors {
            for template in &collector_config.objects {
                configured += 1;
                let client = match client_factory(&collector_config.name, poller_config) {
                    Ok(client) => client,
                    Err(e) => {
                        tracing::error!(
                            collector = %collector_config.name,
                            object = %template.object,
                            error = %e,
                            "client init failed, skipping collector"
                        );
                        continue;
                    }
                };
                match Collector::new(
                    collector_config.name.clone(),
                    template.clone(),
                    client,
                    exporters.clone(),
                    &intervals,
                    &global_labels,
                ) {
                    Ok(collector) => collectors.push(collector),
                    Err(e) => {
                        tracing::error!(
                            collector = %collector_config.name,
                            object = %template.object,
                            error = %e,
                            "collector init failed, skipping"
                        );
                    }
                }
            }
        }
        if collectors.is_empty() && configured > 0 {
            return Err(PollerError::Config(format!(
                "poller {name}: all {configured} collectors failed to initialize"
            )));
        }

        Ok(Self {
            name,
            server: poller_config.server(),
            collectors,
            exporters,
            influx,
            metrics,
            drain_deadline: DRAIN_DEADLINE,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn collector_count(&self) -> usize {
        self.collectors.len()
    }

    /// Rendered scrape text handle, when a prometheus exporter is wired.
    pub fn metrics_handle(&self) -> Option<MetricsHandle> {
        self.metrics.clone()
    }

    /// Status handles of all collectors, in wiring order.
    pub fn status_handles(&self) -> Vec<Arc<RwLock<CollectorStatus>>> {
        self.collectors
            .iter()
            .map(Collector::status_handle)
            .collect()
    }

    #[cfg(test)]
    pub(crate) fn set_drain_deadline(&mut self, deadline: Duration) {
        self.drain_deadline = deadline;
    }

    /// Run until `cancel` fires, then drain workers under the deadline.
    pub async fn run(self, cancel: CancellationToken) -> Result<(), PollerError> {
        for exporter in &self.exporters {
            exporter.init().await?;
        }

        // Bind before spawning anything; a bind failure must not leave
        // workers polling with nobody to stop them.
        let addr: SocketAddr = format!("{}:{}", self.server.bind, self.server.port)
            .parse()
            .map_err(|e| PollerError::Config(format!("server address: {e}")))?;
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| PollerError::Connection(format!("bind {addr}: {e}")))?;
        if let Ok(local) = listener.local_addr() {
            tracing::info!(poller = %self.name, addr = %local, "serving /metrics and /status");
        }

        let mut background: Vec<JoinHandle<()>> = Vec::new();
        for exporter in &self.influx {
            background.push(exporter.spawn_flusher(cancel.clone()));
        }

        let state = AppState {
            poller: self.name.clone(),
            metrics: self.metrics.clone(),
            collectors: self.status_handles(),
            exporters: self.exporters.clone(),
        };

        let mut workers: Vec<JoinHandle<()>> = Vec::new();
        for collector in self.collectors {
            workers.push(tokio::spawn(runner::run(collector, cancel.clone())));
        }

        let app = create_router(state);
        let shutdown = cancel.clone();
        let serve = axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await;
        if let Err(e) = serve {
            tracing::error!(poller = %self.name, error = %e, "server failed");
            cancel.cancel();
        }

        drain(workers, self.drain_deadline).await;
        // Flush workers run their final flush on cancellation.
        for task in background {
            let _ = task.await;
        }
        tracing::info!(poller = %self.name, "stopped");
        Ok(())
    }
}

enum BuiltExporter {
    Prometheus(Arc<PrometheusExporter>),
    Influx(Arc<InfluxDbExporter>),
}

fn build_exporter(name: &str, config: &ExporterConfig) -> Result<BuiltExporter, PollerError> {
    let class: ExporterClass = config
        .class
        .parse()
        .map_err(|_| PollerError::Config(format!("exporter {name}: unknown class {}", config.class)))?;
    match class {
        ExporterClass::Prometheus => Ok(BuiltExporter::Prometheus(Arc::new(
            PrometheusExporter::new(name, config.prefix.clone()),
        ))),
        ExporterClass::Influxdb => {
            let url = config.url.clone().ok_or_else(|| {
                PollerError::MissingParam(format!("exporter {name}: url"))
            })?;
            Ok(BuiltExporter::Influx(Arc::new(InfluxDbExporter::new(
                name,
                config.prefix.clone(),
                url,
                config.token.clone(),
            )?)))
        }
    }
}

/// Wait for workers up to `deadline`, then abandon stragglers.
async fn drain(workers: Vec<JoinHandle<()>>, deadline: Duration) {
    let total = workers.len();
    let joined = tokio::time::timeout(deadline, async {
        for worker in workers {
            let _ = worker.await;
        }
    })
    .await;
    if joined.is_err() {
        tracing::warn!(
            workers = total,
            deadline = ?deadline,
            "drain deadline hit, abandoning remaining workers"
        );
    }
}
