//! One collector: schedule-driven collection of one object from one
//! protocol client, through the plugin chain, out to the exporter set.
//!
//! The collector owns its matrices exclusively while mutating them; the
//! plugin chain and exporters see them for the rest of the cycle only.
//! It also maintains a self-monitoring metadata matrix exported through
//! the same pipeline as the data it collects.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};
use tokio::sync::RwLock;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::errors::PollerError;
use crate::exporter::{fan_out, Exporter};
use crate::matrix::{Matrix, MetricKind};
use crate::plugin::{self, Plugin};
use crate::schedule::Schedule;

pub mod client;
pub mod rest;
pub mod runner;
pub mod template;

pub use client::ProtocolClient;
pub use rest::RestClient;
pub use template::{CounterDef, ObjectTemplate, PluginSpec};

/// How often NoInstances/NoMetrics no-ops are worth an info line.
const NOOP_LOG_INTERVAL: Duration = Duration::from_secs(600);

/// Lifecycle state surfaced by the status endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, AsRefStr, Serialize)]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
#[serde(rename_all = "snake_case")]
pub enum CollectorState {
    Running,
    Standby,
    Failed,
    Stopped,
}

impl CollectorState {
    /// Numeric form published as `collector_status`.
    fn code(self) -> f64 {
        match self {
            Self::Running => 0.0,
            Self::Standby => 1.0,
            Self::Failed => 2.0,
            Self::Stopped => 3.0,
        }
    }
}

/// Snapshot of one collector for `/status`, shared with the HTTP server.
#[derive(Debug, Clone, Serialize)]
pub struct CollectorStatus {
    pub name: String,
    pub object: String,
    pub state: CollectorState,
    pub last_error: Option<String>,
    pub cycles: u64,
    pub last_cycle_ms: u64,
}

/// Per-task intervals of a collector's schedule.
#[derive(Debug, Clone, Deserialize)]
pub struct TaskIntervals {
    #[serde(with = "humantime_serde", default = "TaskIntervals::default_data")]
    pub data: Duration,
    #[serde(with = "humantime_serde", default = "TaskIntervals::default_instance")]
    pub instance: Duration,
    #[serde(with = "humantime_serde", default = "TaskIntervals::default_counter")]
    pub counter: Duration,
}

impl TaskIntervals {
    fn default_data() -> Duration {
        Duration::from_secs(60)
    }

    fn default_instance() -> Duration {
        Duration::from_secs(600)
    }

    fn default_counter() -> Duration {
        Duration::from_secs(1200)
    }
}

impl Default for TaskIntervals {
    fn default() -> Self {
        Self {
            data: Self::default_data(),
            instance: Self::default_instance(),
            counter: Self::default_counter(),
        }
    }
}

pub struct Collector {
    name: String,
    identifier: String,
    template: ObjectTemplate,
    client: Box<dyn ProtocolClient>,
    matrices: BTreeMap<String, Matrix>,
    metadata: Matrix,
    plugins: Vec<Box<dyn Plugin>>,
    exporters: Vec<Arc<dyn Exporter>>,
    pub(crate) schedule: Schedule,
    state: CollectorState,
    status: Arc<RwLock<CollectorStatus>>,
    epoch: Instant,
    connected: bool,
    rediscover: bool,
    last_noop_log: Option<Instant>,
    last_error: Option<String>,
    cycles: u64,
    last_cycle_ms: u64,
    last_plugin_ms: f64,
}

impl Collector {
    pub fn new(
        name: impl Into<String>,
        template: ObjectTemplate,
        client: Box<dyn ProtocolClient>,
        exporters: Vec<Arc<dyn Exporter>>,
        intervals: &TaskIntervals,
        global_labels: &BTreeMap<String, String>,
    ) -> Result<Self, PollerError> {
        let name = name.into();
        template.validate()?;

        let identifier = format!("{}:{}", client.name(), template.object);
        let mut matrix = Matrix::new(template.object.clone(), identifier.clone());
        for (label, value) in global_labels {
            matrix.set_global_label(label.clone(), value.clone());
        }

        let mut plugins = Vec::with_capacity(template.plugins.len());
        for spec in &template.plugins {
            let mut plugin = plugin::create(&spec.name, &template.object, &spec.params)?;
            plugin.init()?;
            plugins.push(plugin);
        }

        // FIFO tie-break means discovery runs before the first data cycle.
        let mut schedule = Schedule::new();
        schedule.add_task("counter", intervals.counter, true)?;
        schedule.add_task("instance", intervals.instance, true)?;
        schedule.add_task("data", intervals.data, true)?;

        let metadata = build_metadata(&name, &identifier, global_labels);
        let status = Arc::new(RwLock::new(CollectorStatus {
            name: name.clone(),
            object: template.object.clone(),
            state: CollectorState::Standby,
            last_error: None,
            cycles: 0,
            last_cycle_ms: 0,
        }));

        let matrices = BTreeMap::from([(template.object.clone(), matrix)]);
        Ok(Self {
            name,
            identifier,
            template,
            client,
            matrices,
            metadata,
            plugins,
            exporters,
            schedule,
            state: CollectorState::Standby,
            status,
            epoch: Instant::now(),
            connected: false,
            rediscover: false,
            last_noop_log: None,
            last_error: None,
            cycles: 0,
            last_cycle_ms: 0,
            last_plugin_ms: 0.0,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn state(&self) -> CollectorState {
        self.state
    }

    /// Shared status snapshot; the server reads it, the worker writes it.
    pub fn status_handle(&self) -> Arc<RwLock<CollectorStatus>> {
        Arc::clone(&self.status)
    }

    fn matrix(&self) -> &Matrix {
        &self.matrices[&self.template.object]
    }

    fn matrix_mut(&mut self) -> &mut Matrix {
        self.matrices
            .get_mut(&self.template.object)
            .unwrap_or_else(|| unreachable!("primary matrix always present"))
    }

    /// Dispatch one scheduled task.
    pub(crate) async fn run_task(
        &mut self,
        task: &str,
        cancel: &CancellationToken,
    ) -> Result<(), PollerError> {
        if cancel.is_cancelled() {
            return Err(PollerError::Cancelled);
        }
        self.ensure_connected(cancel).await?;
        match task {
            "counter" => self.discover_counters(),
            "instance" => self.refresh_instances(cancel).await,
            "data" => self.collect_data(cancel).await,
            other => Err(PollerError::InvalidParam(format!("unknown task: {other}"))),
        }
    }

    async fn ensure_connected(&mut self, cancel: &CancellationToken) -> Result<(), PollerError> {
        if !self.connected {
            self.client.connect(cancel).await?;
            self.connected = true;
            tracing::debug!(collector = %self.identifier, "client connected");
        }
        Ok(())
    }

    /// Reconcile the matrix's metric descriptors with the template.
    fn discover_counters(&mut self) -> Result<(), PollerError> {
        if self.template.counters.is_empty() {
            return Err(PollerError::NoMetrics(self.template.object.clone()));
        }
        let counters = self.template.counters.clone();
        let identifier = self.identifier.clone();
        let matrix = self.matrix_mut();
        for counter in &counters {
            let name = counter.metric_name().to_string();
            let metric = match matrix.add_metric(&name, counter.kind) {
                Ok(metric) => metric,
                Err(PollerError::SchemaConflict(msg)) => {
                    // The descriptor changed kind; drop the old column and
                    // its history, then re-add.
                    tracing::warn!(
                        collector = %identifier,
                        metric = %name,
                        %msg,
                        "counter changed kind, resetting"
                    );
                    matrix.remove_metric(&name);
                    matrix.add_metric(&name, counter.kind)?
                }
                Err(e) => return Err(e),
            };
            if let Some(base) = &counter.base {
                metric.set_base(base.clone());
            }
            if let Some(bucket) = &counter.bucket {
                metric.set_bucket(bucket.clone());
            }
        }
        tracing::debug!(
            collector = %self.identifier,
            metrics = self.matrix().metric_count(),
            "counters discovered"
        );
        Ok(())
    }

    /// Refresh the instance set: add new keys, drop absent ones. Surviving
    /// instances keep their slots and their derived-counter history.
    async fn refresh_instances(&mut self, cancel: &CancellationToken) -> Result<(), PollerError> {
        let response = self.client.fetch(&self.template.query, cancel).await?;
        let records = client::records(&response);
        if records.is_empty() {
            return Err(PollerError::NoInstances(self.template.object.clone()));
        }

        let mut seen = std::collections::BTreeSet::new();
        for record in records {
            if let Some(key) = self.template.instance_key(record) {
                seen.insert(key);
            }
        }

        let matrix = self.matrix_mut();
        let known: Vec<String> = matrix.instance_keys().map(str::to_owned).collect();
        let mut removed = 0usize;
        for key in &known {
            if !seen.contains(key) {
                matrix.remove_instance(key);
                removed += 1;
            }
        }
        let mut added = 0usize;
        for key in &seen {
            if matrix.instance(key).is_none() {
                matrix.add_instance(key)?;
                added += 1;
            }
        }
        let instances = matrix.instance_count();
        tracing::debug!(
            collector = %self.identifier,
            instances,
            added,
            removed,
            "instances refreshed"
        );
        Ok(())
    }

    /// One data cycle: fetch, parse, derive, transform, export, commit.
    async fn collect_data(&mut self, cancel: &CancellationToken) -> Result<(), PollerError> {
        if self.rediscover {
            self.discover_counters()?;
            self.rediscover = false;
        }

        let response = self.client.fetch(&self.template.query, cancel).await?;
        let records = client::records(&response);
        if records.is_empty() {
            return Err(PollerError::NoInstances(self.template.object.clone()));
        }

        let mut parse_errors = 0usize;
        {
            let template = self.template.clone();
            let matrix = self
                .matrices
                .get_mut(&template.object)
                .ok_or_else(|| PollerError::InvalidParam("primary matrix missing".into()))?;
            matrix.reset_data();
            for record in records {
                let Some(key) = template.instance_key(record) else {
                    parse_errors += 1;
                    continue;
                };
                if matrix.instance(&key).is_none() {
                    matrix.add_instance(&key)?;
                }

                // Labels and visibility are rebuilt from the source every
                // cycle; plugin mutations live for one cycle only.
                let mut labels = BTreeMap::new();
                for (label, path) in &template.labels {
                    if let Some(value) = client::lookup_str(record, path) {
                        labels.insert(label.clone(), value);
                    }
                }
                if let Some(instance) = matrix.instance_mut(&key) {
                    instance.set_labels(labels);
                    instance.set_exportable(true);
                }

                for counter in &template.counters {
                    let name = counter.metric_name();
                    match client::lookup(record, &counter.path) {
                        Some(serde_json::Value::Number(n)) => match n.as_f64() {
                            Some(value) => matrix.set_value(name, &key, value)?,
                            None => parse_errors += 1,
                        },
                        Some(serde_json::Value::String(raw)) => {
                            if matrix.set_value_string(name, &key, raw).is_err() {
                                parse_errors += 1;
                            }
                        }
                        Some(_) => parse_errors += 1,
                        None => {} // absent at the source
                    }
                }
            }
        }
        if parse_errors > 0 {
            tracing::debug!(
                collector = %self.identifier,
                parse_errors,
                "cells skipped this cycle"
            );
        }

        let now = self.epoch.elapsed().as_secs_f64();
        self.matrix_mut().publish_prepare(now)?;

        let plugin_started = Instant::now();
        let derived = plugin::run_chain(&mut self.plugins, &mut self.matrices);
        self.last_plugin_ms = plugin_started.elapsed().as_secs_f64() * 1000.0;

        let mut export_set: Vec<&Matrix> = self.matrices.values().collect();
        export_set.extend(derived.iter());
        fan_out(&self.exporters, &export_set).await;

        // Committed whether or not exporters succeeded, and also on
        // partial parses: per-cycle gaps beat unbounded delta drift.
        self.matrix_mut().snapshot_commit(now);
        Ok(())
    }

    /// Update the metadata matrix after a task ran and export it.
    pub(crate) async fn record_task(&mut self, task: &str, elapsed: Duration, ok: bool) {
        // Discovery tasks are bookkeeping; only data tasks count as cycles.
        if task == "data" {
            self.cycles += 1;
            self.last_cycle_ms = elapsed.as_millis() as u64;
        }

        let status_code = self.state.code();
        let task_ms = elapsed.as_secs_f64() * 1000.0;
        let exporter_count = self.exporters.len() as f64;
        let exporter_errors: u64 = self
            .exporters
            .iter()
            .map(|e| e.counters().snapshot().1)
            .sum();
        let plugin_ms = self.last_plugin_ms;

        let set = |md: &mut Matrix, metric: &str, key: &str, value: f64| {
            if let Err(e) = md.set_value(metric, key, value) {
                tracing::debug!(error = %e, "metadata cell skipped");
            }
        };
        set(&mut self.metadata, "collector_task_time", task, task_ms);
        if task == "data" {
            set(&mut self.metadata, "plugin_time", task, plugin_ms);
        }
        for key in ["counter", "instance", "data"] {
            set(&mut self.metadata, "collector_status", key, status_code);
            set(&mut self.metadata, "exporter_count", key, exporter_count);
            set(
                &mut self.metadata,
                "exporter_error_count",
                key,
                exporter_errors as f64,
            );
        }
        if !ok {
            tracing::debug!(collector = %self.identifier, task, "task recorded as failed");
        }

        fan_out(&self.exporters, &[&self.metadata]).await;
    }

    pub(crate) fn set_state(&mut self, state: CollectorState) {
        if self.state != state {
            tracing::info!(
                collector = %self.identifier,
                from = %self.state,
                to = %state,
                "state change"
            );
            self.state = state;
        }
    }

    pub(crate) fn set_last_error(&mut self, error: &PollerError) {
        self.last_error = Some(error.to_string());
    }

    /// Forget the session so the next task re-authenticates.
    pub(crate) fn disconnect(&mut self) {
        self.connected = false;
    }

    /// Next data cycle re-reads the descriptor set first.
    pub(crate) fn force_rediscovery(&mut self) {
        self.rediscover = true;
    }

    /// Info-log a no-op cycle, at most once per 10 minutes.
    pub(crate) fn log_noop(&mut self, error: &PollerError) {
        let now = Instant::now();
        let due = self
            .last_noop_log
            .is_none_or(|last| now.duration_since(last) >= NOOP_LOG_INTERVAL);
        if due {
            tracing::info!(collector = %self.identifier, %error, "nothing to collect");
            self.last_noop_log = Some(now);
        }
    }

    /// Push the current state into the shared status snapshot.
    pub(crate) async fn publish_status(&self) {
        let mut status = self.status.write().await;
        status.state = self.state;
        status.last_error = self.last_error.clone();
        status.cycles = self.cycles;
        status.last_cycle_ms = self.last_cycle_ms;
    }

    pub(crate) async fn shutdown(&mut self) {
        self.set_state(CollectorState::Stopped);
        self.publish_status().await;
        self.client.close().await;
        tracing::info!(collector = %self.identifier, "collector stopped");
    }
}

fn build_metadata(
    name: &str,
    identifier: &str,
    global_labels: &BTreeMap<String, String>,
) -> Matrix {
    let mut md = Matrix::new("metadata_collector", format!("{identifier}:metadata"));
    md.set_publish_raw(true);
    md.set_global_label("collector", name);
    for (label, value) in global_labels {
        md.set_global_label(label.clone(), value.clone());
    }
    for metric in [
        "collector_status",
        "collector_task_time",
        "plugin_time",
        "exporter_count",
        "exporter_error_count",
    ] {
        // Infallible on a fresh matrix.
        let _ = md.add_metric(metric, MetricKind::Raw);
    }
    for task in ["counter", "instance", "data"] {
        if let Ok(instance) = md.add_instance(task) {
            instance.set_label("task", task);
        }
    }
    md
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exporter::PrometheusExporter;
    use serde_json::{json, Value};
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU64, Ordering};

    /// Scripted protocol client: pops one response per fetch.
    struct MockClient {
        responses: VecDeque<Result<Value, PollerError>>,
        fetches: Arc<AtomicU64>,
        fail_connect: bool,
    }

    impl MockClient {
        fn new(responses: Vec<Result<Value, PollerError>>) -> Self {
            Self {
                responses: responses.into(),
                fetches: Arc::new(AtomicU64::new(0)),
                fail_connect: false,
            }
        }
    }

    #[async_trait::async_trait]
    impl ProtocolClient for MockClient {
        fn name(&self) -> &str {
            "Mock"
        }

        async fn connect(&mut self, _cancel: &CancellationToken) -> Result<(), PollerError> {
            if self.fail_connect {
                return Err(PollerError::AuthFailure("bad credentials".into()));
            }
            Ok(())
        }

        async fn fetch(
            &mut self,
            _query: &str,
            cancel: &CancellationToken,
        ) -> Result<Value, PollerError> {
            if cancel.is_cancelled() {
                return Err(PollerError::Cancelled);
            }
            self.fetches.fetch_add(1, Ordering::Relaxed);
            self.responses
                .pop_front()
                .unwrap_or(Err(PollerError::Connection("script exhausted".into())))
        }

        async fn close(&mut self) {}
    }

    fn volume_template() -> ObjectTemplate {
        serde_yaml::from_str(
            r#"
object: volume
query: api/storage/volumes
key: [svm, name]
labels:
  volume: name
  vserver_name: svm
  state: state
counters:
  - path: bytes_read
    kind: rate
  - path: size_used
"#,
        )
        .unwrap()
    }

    fn volume_record(name: &str, bytes_read: f64, state: &str) -> Value {
        json!({
            "name": name,
            "svm": "svm1",
            "state": state,
            "bytes_read": bytes_read,
            "size_used": 1024,
        })
    }

    fn collector_with(
        responses: Vec<Result<Value, PollerError>>,
        exporters: Vec<Arc<dyn Exporter>>,
    ) -> Collector {
        Collector::new(
            "Mock",
            volume_template(),
            Box::new(MockClient::new(responses)),
            exporters,
            &TaskIntervals::default(),
            &BTreeMap::from([("cluster".to_string(), "c1".to_string())]),
        )
        .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_cycle_produces_rates() {
        let prom = Arc::new(PrometheusExporter::new("prom", "strata"));
        let handle = prom.handle();
        let responses = vec![
            Ok(json!({"records": [volume_record("vol1", 1000.0, "online")]})), // instance
            Ok(json!({"records": [volume_record("vol1", 1000.0, "online")]})), // data 1
            Ok(json!({"records": [volume_record("vol1", 3000.0, "online")]})), // data 2
        ];
        let mut c = collector_with(responses, vec![prom]);
        let cancel = CancellationToken::new();

        c.run_task("counter", &cancel).await.unwrap();
        c.run_task("instance", &cancel).await.unwrap();

        c.run_task("data", &cancel).await.unwrap();
        // First cycle has no history, so the rate is absent.
        assert!(!handle.text().await.contains("bytes_read"));

        tokio::time::advance(Duration::from_secs(10)).await;
        c.run_task("data", &cancel).await.unwrap();
        let text = handle.text().await;
        assert!(
            text.contains("strata_volume_bytes_read{cluster=\"c1\""),
            "{text}"
        );
        assert!(text.contains("} 200\n"), "{text}");
        assert!(text.contains("strata_volume_size_used"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_instance_refresh_keeps_survivors() {
        let responses = vec![
            Ok(json!({"records": [
                volume_record("vol1", 1.0, "online"),
                volume_record("vol2", 1.0, "online"),
            ]})),
            Ok(json!({"records": [
                volume_record("vol2", 1.0, "online"),
                volume_record("vol3", 1.0, "online"),
            ]})),
        ];
        let mut c = collector_with(responses, Vec::new());
        let cancel = CancellationToken::new();

        c.run_task("counter", &cancel).await.unwrap();
        c.run_task("instance", &cancel).await.unwrap();
        assert_eq!(c.matrix().instance_count(), 2);

        c.run_task("instance", &cancel).await.unwrap();
        let keys: Vec<&str> = c.matrix().instance_keys().collect();
        assert_eq!(keys, vec!["svm1.vol2", "svm1.vol3"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_fetch_leaves_snapshot_uncommitted() {
        let responses = vec![Ok(
            json!({"records": [volume_record("vol1", 1.0, "online")]}),
        )];
        let mut c = collector_with(responses, Vec::new());
        let cancel = CancellationToken::new();

        c.run_task("counter", &cancel).await.unwrap();
        c.run_task("data", &cancel).await.unwrap();
        assert!(c.matrix().has_snapshot());

        // Next fetch fails; publish_prepare must be callable again next
        // cycle, and the last good snapshot survives for rate derivation.
        let err = c.run_task("data", &cancel).await.unwrap_err();
        assert!(err.is_standoff());
        assert!(c.matrix().has_snapshot());
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_response_is_no_instances() {
        let responses = vec![Ok(json!({"records": []}))];
        let mut c = collector_with(responses, Vec::new());
        let cancel = CancellationToken::new();

        c.run_task("counter", &cancel).await.unwrap();
        let err = c.run_task("data", &cancel).await.unwrap_err();
        assert!(matches!(err, PollerError::NoInstances(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_task_issues_no_fetch() {
        let client = MockClient::new(Vec::new());
        let fetches = Arc::clone(&client.fetches);
        let mut c = Collector::new(
            "Mock",
            volume_template(),
            Box::new(client),
            Vec::new(),
            &TaskIntervals::default(),
            &BTreeMap::new(),
        )
        .unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = c.run_task("data", &cancel).await.unwrap_err();
        assert!(matches!(err, PollerError::Cancelled));
        assert_eq!(fetches.load(Ordering::Relaxed), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_auth_failure_routes_to_standoff() {
        let mut client = MockClient::new(Vec::new());
        client.fail_connect = true;
        let mut c = Collector::new(
            "Mock",
            volume_template(),
            Box::new(client),
            Vec::new(),
            &TaskIntervals::default(),
            &BTreeMap::new(),
        )
        .unwrap();

        let cancel = CancellationToken::new();
        let err = c.run_task("data", &cancel).await.unwrap_err();
        assert!(err.is_standoff());
    }

    #[tokio::test(start_paused = true)]
    async fn test_only_data_tasks_count_as_cycles() {
        let responses = vec![Ok(
            json!({"records": [volume_record("vol1", 1.0, "online")]}),
        )];
        let mut c = collector_with(responses, Vec::new());

        c.record_task("counter", Duration::from_millis(5), true).await;
        c.record_task("instance", Duration::from_millis(5), true).await;
        c.record_task("data", Duration::from_millis(7), true).await;
        c.publish_status().await;

        let status = c.status_handle();
        let status = status.read().await;
        assert_eq!(status.cycles, 1);
        assert_eq!(status.last_cycle_ms, 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_metadata_matrix_tracks_tasks() {
        let prom = Arc::new(PrometheusExporter::new("prom", "strata"));
        let handle = prom.handle();
        let responses = vec![Ok(
            json!({"records": [volume_record("vol1", 1.0, "online")]}),
        )];
        let mut c = collector_with(responses, vec![prom]);
        let cancel = CancellationToken::new();

        c.run_task("counter", &cancel).await.unwrap();
        c.run_task("data", &cancel).await.unwrap();
        c.record_task("data", Duration::from_millis(12), true).await;

        let text = handle.text().await;
        assert!(
            text.contains(
                "strata_metadata_collector_collector_status{cluster=\"c1\",collector=\"Mock\",task=\"data\"} 1\n"
            ),
            "{text}"
        );
        assert!(text.contains("strata_metadata_collector_collector_task_time"));
        assert!(text.contains("strata_metadata_collector_exporter_count"));
    }
}
