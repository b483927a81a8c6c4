//! Group-by-label aggregation into a derived matrix.
//!
//! Sums the published values of exportable instances per group key. Metrics
//! of kind percent/average cannot be summed meaningfully, so they are
//! normalized by the number of contributing cells.

use std::collections::{BTreeMap, HashMap};

use serde::Deserialize;

use crate::errors::PollerError;
use crate::matrix::{Matrix, MetricKind};

use super::{parse_params, Plugin};

#[derive(Debug, Deserialize)]
struct Params {
    /// Labels forming the group key, joined with `.` in configured order.
    group_by: Vec<String>,
    /// Object name of the derived matrix; defaults to
    /// `<object>_<first group label>`.
    target_object: Option<String>,
}

#[derive(Debug)]
pub struct Aggregator {
    object: String,
    params: Params,
}

impl Aggregator {
    pub fn new(object: &str, params: &serde_yaml::Value) -> Result<Self, PollerError> {
        let params: Params = parse_params("aggregator", params)?;
        if params.group_by.is_empty() {
            return Err(PollerError::MissingParam("aggregator: group_by".into()));
        }
        Ok(Self {
            object: object.to_string(),
            params,
        })
    }

    fn target_object(&self) -> String {
        self.params
            .target_object
            .clone()
            .unwrap_or_else(|| format!("{}_{}", self.object, self.params.group_by[0]))
    }
}

impl Plugin for Aggregator {
    fn name(&self) -> &str {
        "aggregator"
    }

    fn run(&mut self, data: &mut BTreeMap<String, Matrix>) -> Result<Vec<Matrix>, PollerError> {
        let Some(source) = data.get(&self.object) else {
            return Ok(Vec::new());
        };

        let mut out = source.clone_schema(false);
        out.set_object(self.target_object());
        out.set_identifier(format!("{}/aggregator", source.identifier()));
        // The sums below are already-published values.
        out.set_publish_raw(true);

        // Contributing cells per (group key, metric), for normalization.
        let mut contributions: HashMap<(String, String), u64> = HashMap::new();

        let metric_names: Vec<String> = source.metric_names().map(str::to_owned).collect();
        for (key, instance) in source.instances() {
            if !instance.is_exportable() {
                continue;
            }
            let group_key = self
                .params
                .group_by
                .iter()
                .map(|label| instance.label(label))
                .collect::<Vec<_>>()
                .join(".");

            if out.instance(&group_key).is_none() {
                let row = out.add_instance(&group_key)?;
                for label in &self.params.group_by {
                    let value = instance.label(label).to_string();
                    row.set_label(label.clone(), value);
                }
            }
            for metric in &metric_names {
                if let Some(value) = source.export_value(metric, key) {
                    out.add_value(metric, &group_key, value)?;
                    *contributions
                        .entry((group_key.clone(), metric.clone()))
                        .or_default() += 1;
                }
            }
        }

        // Percent/average metrics become the mean over their contributors.
        for metric in &metric_names {
            let Some(kind) = source.metric(metric).map(|m| m.kind()) else {
                continue;
            };
            if !matches!(kind, MetricKind::Percent | MetricKind::Average) {
                continue;
            }
            let group_keys: Vec<String> = out.instance_keys().map(str::to_owned).collect();
            for group_key in group_keys {
                let count = contributions
                    .get(&(group_key.clone(), metric.clone()))
                    .copied()
                    .unwrap_or(0);
                if count > 1 {
                    if let Some(sum) = out.get_value(metric, &group_key) {
                        out.set_value(metric, &group_key, sum / count as f64)?;
                    }
                }
            }
        }

        Ok(vec![out])
    }
}
