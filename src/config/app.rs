//! Application configuration structures.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::path::Path;
use std::str::FromStr;

use serde::Deserialize;

use crate::collector::{ObjectTemplate, TaskIntervals};
use crate::exporter::ExporterClass;

use super::validation::{expand_env_vars, ConfigError};

/// Default Prometheus metric prefix.
pub const DEFAULT_PREFIX: &str = "strata";

/// Status/metrics server configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Server bind address (default: "0.0.0.0").
    pub bind: String,

    /// Server port (default: 12990).
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: 12990,
        }
    }
}

/// One exporter definition under the `exporters` section.
#[derive(Debug, Clone, Deserialize)]
pub struct ExporterConfig {
    pub class: String,

    /// Metric name prefix (prometheus) or measurement prefix (influxdb).
    #[serde(default = "default_prefix")]
    pub prefix: String,

    /// Write endpoint, push exporters only.
    #[serde(default)]
    pub url: Option<String>,

    /// Auth token, push exporters only.
    #[serde(default)]
    pub token: Option<String>,
}

fn default_prefix() -> String {
    DEFAULT_PREFIX.to_string()
}

/// One collector entry of a poller: protocol name plus its objects.
#[derive(Debug, Clone, Deserialize)]
pub struct CollectorConfig {
    pub name: String,
    pub objects: Vec<ObjectTemplate>,
}

/// Settings shared by `defaults` and each poller; poller wins per field.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PollerDefaults {
    #[serde(default)]
    pub exporters: Option<Vec<String>>,

    #[serde(default)]
    pub schedule: Option<TaskIntervals>,

    /// Extra global labels stamped on every exported row.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

/// One poller definition under the `pollers` section.
#[derive(Debug, Clone, Deserialize)]
pub struct PollerConfig {
    /// Address of the monitored cluster; exported as the `target` label.
    pub addr: String,

    /// Credentials handed to the protocol client. Usually pulled from the
    /// environment via `${VAR}` expansion.
    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,

    /// Accept self-signed certificates on the target.
    #[serde(default)]
    pub insecure_tls: bool,

    #[serde(default)]
    pub exporters: Option<Vec<String>>,

    #[serde(default)]
    pub schedule: Option<TaskIntervals>,

    #[serde(default)]
    pub labels: BTreeMap<String, String>,

    #[serde(default)]
    pub collectors: Vec<CollectorConfig>,

    #[serde(default)]
    pub server: Option<ServerConfig>,
}

impl PollerConfig {
    /// Fill unset fields from the `defaults` section. Labels are a union
    /// with poller labels winning.
    fn merge_defaults(&mut self, defaults: &PollerDefaults) {
        if self.exporters.is_none() {
            self.exporters = defaults.exporters.clone();
        }
        if self.schedule.is_none() {
            self.schedule = defaults.schedule.clone();
        }
        for (label, value) in &defaults.labels {
            self.labels
                .entry(label.clone())
                .or_insert_with(|| value.clone());
        }
    }

    pub fn exporter_names(&self) -> &[String] {
        self.exporters.as_deref().unwrap_or(&[])
    }

    pub fn schedule(&self) -> TaskIntervals {
        self.schedule.clone().unwrap_or_default()
    }

    pub fn server(&self) -> ServerConfig {
        self.server.clone().unwrap_or_default()
    }

    /// Global labels for every matrix of this poller.
    pub fn global_labels(&self, poller_name: &str) -> BTreeMap<String, String> {
        let mut labels = self.labels.clone();
        labels
            .entry("poller".to_string())
            .or_insert_with(|| poller_name.to_string());
        labels
            .entry("target".to_string())
            .or_insert_with(|| self.addr.clone());
        labels
    }
}

/// Top-level configuration: `pollers`, `exporters`, `defaults`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub pollers: BTreeMap<String, PollerConfig>,

    #[serde(default)]
    pub exporters: BTreeMap<String, ExporterConfig>,

    #[serde(default)]
    pub defaults: PollerDefaults,
}

impl AppConfig {
    /// Load configuration from a YAML file.
    ///
    /// Environment variables in the file are expanded first and the
    /// `defaults` section is merged into every poller.
    ///
    /// # Errors
    /// Returns `ConfigError` if the file cannot be read, parsed, or
    /// validated.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from a YAML string; same pipeline as `load`.
    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        let expanded = expand_env_vars(content);
        let mut config: Self = serde_yaml::from_str(&expanded)?;
        for poller in config.pollers.values_mut() {
            poller.merge_defaults(&config.defaults);
        }
        config.validate()?;
        Ok(config)
    }

    /// One poller by name.
    pub fn poller(&self, name: &str) -> Result<&PollerConfig, ConfigError> {
        self.pollers.get(name).ok_or_else(|| {
            ConfigError::ValidationError(format!("poller not found in config: {name}"))
        })
    }

    /// Validate configuration values.
    ///
    /// # Errors
    /// Returns `ConfigError::ValidationError` if any field is invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, exporter) in &self.exporters {
            ExporterClass::from_str(&exporter.class).map_err(|_| {
                ConfigError::ValidationError(format!(
                    "exporter {name}: unknown class '{}'",
                    exporter.class
                ))
            })?;
            if exporter.class.eq_ignore_ascii_case("influxdb") && exporter.url.is_none() {
                return Err(ConfigError::ValidationError(format!(
                    "exporter {name}: influxdb requires a url"
                )));
            }
        }

        for (name, poller) in &self.pollers {
            if poller.addr.is_empty() {
                return Err(ConfigError::ValidationError(format!(
                    "poller {name}: addr must be set"
                )));
            }
            for exporter in poller.exporter_names() {
                if !self.exporters.contains_key(exporter) {
                    return Err(ConfigError::ValidationError(format!(
                        "poller {name}: unknown exporter '{exporter}'"
                    )));
                }
            }
            if let Some(server) = &poller.server {
                server.bind.parse::<IpAddr>().map_err(|_| {
                    ConfigError::ValidationError(format!(
                        "poller {name}: invalid server bind address: '{}'",
                        server.bind
                    ))
                })?;
            }
            for collector in &poller.collectors {
                if collector.name.is_empty() {
                    return Err(ConfigError::ValidationError(format!(
                        "poller {name}: collector without a name"
                    )));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
exporters:
  prom:
    class: prometheus
    prefix: strata
  influx:
    class: influxdb
    url: http://influx:8086/api/v2/write
    token: ${STRATA_TEST_INFLUX_TOKEN:-t0ken}

defaults:
  exporters: [prom]
  schedule:
    data: 30s
  labels:
    datacenter: dc1

pollers:
  cluster-a:
    addr: 10.0.0.1
    labels:
      cluster: cluster-a
    collectors:
      - name: Rest
        objects:
          - object: volume
            query: api/storage/volumes
            key: [name]
            counters:
              - path: bytes_read
                kind: rate
  cluster-b:
    addr: 10.0.0.2
    exporters: [prom, influx]
"#;

    #[test]
    fn test_defaults_merge_into_pollers() {
        let config = AppConfig::from_yaml(SAMPLE).unwrap();

        let a = config.poller("cluster-a").unwrap();
        assert_eq!(a.exporter_names(), ["prom"]);
        assert_eq!(a.schedule().data.as_secs(), 30);
        assert_eq!(a.labels["datacenter"], "dc1");
        assert_eq!(a.labels["cluster"], "cluster-a");

        // Explicit poller settings win over defaults.
        let b = config.poller("cluster-b").unwrap();
        assert_eq!(b.exporter_names(), ["prom", "influx"]);
    }

    #[test]
    fn test_env_expansion_in_exporter_token() {
        let config = AppConfig::from_yaml(SAMPLE).unwrap();
        assert_eq!(config.exporters["influx"].token.as_deref(), Some("t0ken"));
    }

    #[test]
    fn test_global_labels_include_poller_and_target() {
        let config = AppConfig::from_yaml(SAMPLE).unwrap();
        let labels = config
            .poller("cluster-a")
            .unwrap()
            .global_labels("cluster-a");
        assert_eq!(labels["poller"], "cluster-a");
        assert_eq!(labels["target"], "10.0.0.1");
        assert_eq!(labels["datacenter"], "dc1");
    }

    #[test]
    fn test_unknown_exporter_reference_rejected() {
        let yaml = r#"
pollers:
  p1:
    addr: 1.2.3.4
    exporters: [nope]
"#;
        let err = AppConfig::from_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("unknown exporter"));
    }

    #[test]
    fn test_influx_without_url_rejected() {
        let yaml = r#"
exporters:
  influx:
    class: influxdb
"#;
        let err = AppConfig::from_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("requires a url"));
    }

    #[test]
    fn test_unknown_class_rejected() {
        let yaml = r#"
exporters:
  g:
    class: graphite_ng
"#;
        assert!(AppConfig::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_missing_poller_lookup() {
        let config = AppConfig::from_yaml(SAMPLE).unwrap();
        assert!(config.poller("cluster-z").is_err());
    }
}
