//! Cook 0/1 status metrics out of string labels.
//!
//! Each rule maps a label to a numeric metric: the configured `ok_value`
//! publishes `0`, any other value publishes `1`, a missing label leaves the
//! cell absent. Mutates the source matrix in place.

use std::collections::BTreeMap;

use serde::Deserialize;

use crate::errors::PollerError;
use crate::matrix::{Matrix, MetricKind};

use super::{parse_params, Plugin};

#[derive(Debug, Deserialize)]
struct Rule {
    label: String,
    ok_value: String,
}

#[derive(Debug)]
pub struct StatusCook {
    object: String,
    // metric name -> rule
    rules: BTreeMap<String, Rule>,
}

impl StatusCook {
    pub fn new(object: &str, params: &serde_yaml::Value) -> Result<Self, PollerError> {
        let rules: BTreeMap<String, Rule> = parse_params("status_cook", params)?;
        if rules.is_empty() {
            return Err(PollerError::MissingParam("status_cook: rules".into()));
        }
        Ok(Self {
            object: object.to_string(),
            rules,
        })
    }
}

impl Plugin for StatusCook {
    fn name(&self) -> &str {
        "status_cook"
    }

    fn run(&mut self, data: &mut BTreeMap<String, Matrix>) -> Result<Vec<Matrix>, PollerError> {
        let Some(matrix) = data.get_mut(&self.object) else {
            return Ok(Vec::new());
        };
        let keys: Vec<String> = matrix.instance_keys().map(str::to_owned).collect();
        for (metric, rule) in &self.rules {
            matrix.add_metric(metric, MetricKind::Raw)?;
            for key in &keys {
                let Some(instance) = matrix.instance(key) else {
                    continue;
                };
                if !instance.has_label(&rule.label) {
                    continue;
                }
                let value = if instance.label(&rule.label) == rule.ok_value {
                    0.0
                } else {
                    1.0
                };
                matrix.set_value(metric, key, value)?;
            }
        }
        Ok(Vec::new())
    }
}
