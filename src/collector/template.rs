//! Object templates: how one record tree becomes one matrix.
//!
//! A template names the query to run, the record paths forming the
//! instance key, label paths, and counter definitions. It is declarative;
//! the collector does the actual adaptation each cycle.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde_json::Value;

use crate::errors::PollerError;
use crate::matrix::MetricKind;

use super::client::lookup_str;

fn default_kind() -> MetricKind {
    MetricKind::Raw
}

/// One counter to collect: record path plus metric descriptor options.
#[derive(Debug, Clone, Deserialize)]
pub struct CounterDef {
    pub path: String,
    /// Exported metric name; defaults to the last path segment.
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default = "default_kind")]
    pub kind: MetricKind,
    #[serde(default)]
    pub base: Option<String>,
    #[serde(default)]
    pub bucket: Option<String>,
}

impl CounterDef {
    /// Name the metric is stored and exported under.
    pub fn metric_name(&self) -> &str {
        match &self.name {
            Some(name) => name,
            None => self.path.rsplit('.').next().unwrap_or(&self.path),
        }
    }
}

/// One plugin in the chain, in configured order.
#[derive(Debug, Clone, Deserialize)]
pub struct PluginSpec {
    pub name: String,
    #[serde(default)]
    pub params: serde_yaml::Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ObjectTemplate {
    /// Matrix object name (`volume`, `lun`, ...).
    pub object: String,
    /// Protocol query producing the records.
    pub query: String,
    /// Record paths joined with `.` to form the instance key.
    pub key: Vec<String>,
    /// label name -> record path.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    pub counters: Vec<CounterDef>,
    #[serde(default)]
    pub plugins: Vec<PluginSpec>,
}

impl ObjectTemplate {
    pub fn validate(&self) -> Result<(), PollerError> {
        if self.object.is_empty() {
            return Err(PollerError::MissingParam("template: object".into()));
        }
        if self.query.is_empty() {
            return Err(PollerError::MissingParam(format!(
                "template {}: query",
                self.object
            )));
        }
        if self.key.is_empty() {
            return Err(PollerError::MissingParam(format!(
                "template {}: key",
                self.object
            )));
        }
        for counter in &self.counters {
            if counter.kind.needs_base() && counter.base.is_none() {
                return Err(PollerError::InvalidParam(format!(
                    "template {}: counter {} is {} but names no base",
                    self.object,
                    counter.metric_name(),
                    counter.kind
                )));
            }
        }
        Ok(())
    }

    /// Instance key for one record; `None` when any key part is missing.
    pub fn instance_key(&self, record: &Value) -> Option<String> {
        let parts: Vec<String> = self
            .key
            .iter()
            .map(|path| lookup_str(record, path))
            .collect::<Option<_>>()?;
        Some(parts.join("."))
    }
}
