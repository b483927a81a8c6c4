//! Row filtering on label values.
//!
//! Matching instances get `exportable = false` for the rest of the cycle;
//! the data itself is untouched, so later plugins still see the rows.

use std::collections::BTreeMap;

use serde::Deserialize;

use crate::errors::PollerError;
use crate::matrix::Matrix;

use super::{parse_params, Plugin};

#[derive(Debug, Default, Deserialize)]
struct Params {
    /// Hide instances whose label value equals the configured value.
    #[serde(default)]
    equals: BTreeMap<String, String>,
    /// Hide instances whose label value contains the configured fragment.
    #[serde(default)]
    contains: BTreeMap<String, String>,
    /// When non-empty, only instances matching one of these stay visible.
    #[serde(default)]
    include_equals: BTreeMap<String, String>,
}

pub struct Exclude {
    object: String,
    params: Params,
}

impl Exclude {
    pub fn new(object: &str, params: &serde_yaml::Value) -> Result<Self, PollerError> {
        Ok(Self {
            object: object.to_string(),
            params: parse_params("exclude", params)?,
        })
    }
}

impl Plugin for Exclude {
    fn name(&self) -> &str {
        "exclude"
    }

    fn run(&mut self, data: &mut BTreeMap<String, Matrix>) -> Result<Vec<Matrix>, PollerError> {
        let Some(matrix) = data.get_mut(&self.object) else {
            return Ok(Vec::new());
        };
        let mut excluded = 0usize;
        for (_, instance) in matrix.instances_mut() {
            if !instance.is_exportable() {
                continue;
            }
            let hide = self
                .params
                .equals
                .iter()
                .any(|(label, value)| instance.label(label) == value.as_str())
                || self
                    .params
                    .contains
                    .iter()
                    .any(|(label, frag)| instance.label(label).contains(frag.as_str()))
                || (!self.params.include_equals.is_empty()
                    && !self
                        .params
                        .include_equals
                        .iter()
                        .any(|(label, value)| instance.label(label) == value.as_str()));
            if hide {
                instance.set_exportable(false);
                excluded += 1;
            }
        }
        if excluded > 0 {
            tracing::debug!(object = %self.object, excluded, "instances excluded from export");
        }
        Ok(Vec::new())
    }
}
