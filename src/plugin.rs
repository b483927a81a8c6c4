//! Data-shaping transforms applied between parse and export.
//!
//! A collector runs an ordered chain of plugins on every data cycle. Each
//! plugin sees the full `object -> matrix` map, may mutate matrices in
//! place (relabel instances, hide rows, cook metrics) and may emit derived
//! matrices that are appended to what the cycle exports.
//!
//! Plugins are wired statically: [`create`] looks factories up by name,
//! so configuration decides the chain but the set of available plugins
//! is fixed at link time.

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;

use crate::errors::PollerError;
use crate::matrix::Matrix;

pub mod aggregator;
pub mod exclude;
pub mod flexgroup;
pub mod label_shaper;
mod registry;
pub mod status_cook;

pub use registry::create;

/// One transform in a collector's plugin chain.
pub trait Plugin: Send + Sync {
    /// Name the plugin was registered under.
    fn name(&self) -> &str;

    /// One-time setup at collector startup; configuration problems
    /// surface here, not in `run`.
    fn init(&mut self) -> Result<(), PollerError> {
        Ok(())
    }

    /// Transform the cycle's matrices.
    ///
    /// Mutating the input map is allowed and visible to later plugins in
    /// the chain. Returned matrices are appended to the cycle's export
    /// set; plugins must not keep references to the inputs beyond the
    /// call.
    fn run(&mut self, data: &mut BTreeMap<String, Matrix>) -> Result<Vec<Matrix>, PollerError>;
}

impl std::fmt::Debug for dyn Plugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Plugin").field("name", &self.name()).finish()
    }
}

/// Run the chain in configured order, collecting derived matrices.
///
/// A failing plugin is logged and skipped; the rest of the chain still
/// runs on whatever state the map is in.
pub fn run_chain(
    plugins: &mut [Box<dyn Plugin>],
    data: &mut BTreeMap<String, Matrix>,
) -> Vec<Matrix> {
    let mut derived = Vec::new();
    for plugin in plugins {
        match plugin.run(data) {
            Ok(mut out) => derived.append(&mut out),
            Err(e) => {
                tracing::warn!(plugin = %plugin.name(), error = %e, "plugin failed, continuing chain");
            }
        }
    }
    derived
}

/// Deserialize a plugin's parameter block, mapping failures to a config
/// error naming the plugin.
fn parse_params<T: DeserializeOwned>(
    plugin: &str,
    params: &serde_yaml::Value,
) -> Result<T, PollerError> {
    // An absent parameter block arrives as null; treat it as empty.
    let value = if params.is_null() {
        serde_yaml::Value::Mapping(serde_yaml::Mapping::new())
    } else {
        params.clone()
    };
    serde_yaml::from_value(value).map_err(|e| PollerError::Config(format!("plugin {plugin}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matrix::MetricKind;

    struct NoOp;

    impl Plugin for NoOp {
        fn name(&self) -> &str {
            "noop"
        }

        fn run(
            &mut self,
            _data: &mut BTreeMap<String, Matrix>,
        ) -> Result<Vec<Matrix>, PollerError> {
            Ok(Vec::new())
        }
    }

    struct Failing;

    impl Plugin for Failing {
        fn name(&self) -> &str {
            "failing"
        }

        fn run(
            &mut self,
            _data: &mut BTreeMap<String, Matrix>,
        ) -> Result<Vec<Matrix>, PollerError> {
            Err(PollerError::InvalidParam("boom".into()))
        }
    }

    fn sample_data() -> BTreeMap<String, Matrix> {
        let mut m = Matrix::new("volume", "Rest:volume");
        m.add_metric("read_ops", MetricKind::Raw).unwrap();
        m.add_instance("vol1").unwrap();
        m.set_label("vol1", "state", "online").unwrap();
        m.set_value("read_ops", "vol1", 7.0).unwrap();
        BTreeMap::from([("volume".to_string(), m)])
    }

    #[test]
    fn test_noop_chain_leaves_matrices_unchanged() {
        let mut data = sample_data();
        let mut chain: Vec<Box<dyn Plugin>> = vec![Box::new(NoOp)];

        let derived = run_chain(&mut chain, &mut data);
        assert!(derived.is_empty());

        let m = &data["volume"];
        assert_eq!(m.instance_count(), 1);
        assert_eq!(m.get_value("read_ops", "vol1"), Some(7.0));
        assert_eq!(m.get_label("vol1", "state"), Some("online"));
        assert!(m.instance("vol1").unwrap().is_exportable());
    }

    #[test]
    fn test_failing_plugin_does_not_abort_chain() {
        let mut data = sample_data();
        let mut chain: Vec<Box<dyn Plugin>> = vec![Box::new(Failing), Box::new(NoOp)];
        let derived = run_chain(&mut chain, &mut data);
        assert!(derived.is_empty());
        assert_eq!(data["volume"].get_value("read_ops", "vol1"), Some(7.0));
    }
}
