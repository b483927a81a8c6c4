//! FlexGroup constituent roll-up for the volume object.
//!
//! Constituent volumes are named `<flexgroup>__NNNN` and labeled
//! `style=flexgroup_constituent`. They are summed into one derived instance
//! per `<vserver>.<flexgroup>` and hidden from export themselves, so a
//! flexgroup shows up as a single volume downstream.

use std::collections::BTreeMap;

use regex::Regex;

use crate::errors::PollerError;
use crate::matrix::{Matrix, MetricKind};

use super::Plugin;

pub struct FlexGroup {
    object: String,
    suffix: Regex,
}

impl FlexGroup {
    pub fn new(object: &str) -> Result<Self, PollerError> {
        let suffix = Regex::new(r"^(.+)__\d{4}$")
            .map_err(|e| PollerError::Config(format!("flexgroup: {e}")))?;
        Ok(Self {
            object: object.to_string(),
            suffix,
        })
    }
}

impl Plugin for FlexGroup {
    fn name(&self) -> &str {
        "flexgroup"
    }

    fn run(&mut self, data: &mut BTreeMap<String, Matrix>) -> Result<Vec<Matrix>, PollerError> {
        let Some(source) = data.get(&self.object) else {
            return Ok(Vec::new());
        };

        let mut out = source.clone_schema(false);
        out.set_identifier(format!("{}/flexgroup", source.identifier()));
        out.set_publish_raw(true);

        let mut constituents: Vec<String> = Vec::new();
        let mut group_sizes: BTreeMap<String, u64> = BTreeMap::new();
        let metric_names: Vec<String> = source.metric_names().map(str::to_owned).collect();

        for (key, instance) in source.instances() {
            if instance.label("style") != "flexgroup_constituent" {
                continue;
            }
            let Some(caps) = self.suffix.captures(instance.label("volume")) else {
                continue;
            };
            let flexgroup = &caps[1];
            let vserver = instance.label("vserver_name").to_string();
            let group_key = format!("{vserver}.{flexgroup}");

            if out.instance(&group_key).is_none() {
                let row = out.add_instance(&group_key)?;
                row.set_label("flexgroup", flexgroup);
                row.set_label("style", "flexgroup");
                row.set_label("vserver", vserver);
            }
            *group_sizes.entry(group_key.clone()).or_default() += 1;
            for metric in &metric_names {
                if let Some(value) = source.export_value(metric, key) {
                    out.add_value(metric, &group_key, value)?;
                }
            }
            constituents.push(key.to_string());
        }

        if constituents.is_empty() {
            return Ok(Vec::new());
        }

        for (group_key, count) in &group_sizes {
            out.set_label(group_key, "count", count.to_string())?;
            // Summed percentages mean nothing; publish the constituent mean.
            for metric in &metric_names {
                let is_percent = source
                    .metric(metric)
                    .is_some_and(|m| m.kind() == MetricKind::Percent);
                if is_percent {
                    if let Some(sum) = out.get_value(metric, group_key) {
                        out.set_value(metric, group_key, sum / *count as f64)?;
                    }
                }
            }
        }

        tracing::debug!(
            object = %self.object,
            constituents = constituents.len(),
            flexgroups = group_sizes.len(),
            "rolled up flexgroup constituents"
        );

        // The roll-up replaces its constituents downstream.
        let matrix = data
            .get_mut(&self.object)
            .ok_or_else(|| PollerError::InvalidParam(format!("object vanished: {}", self.object)))?;
        for key in &constituents {
            if let Some(instance) = matrix.instance_mut(key) {
                instance.set_exportable(false);
            }
        }

        Ok(vec![out])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn constituent_volumes() -> BTreeMap<String, Matrix> {
        let mut m = Matrix::new("volume", "Rest:volume");
        m.add_metric("read_ops", MetricKind::Raw).unwrap();
        m.add_metric("used_percent", MetricKind::Percent).unwrap();
        m.set_publish_raw(true);
        for key in ["v1__0001", "v1__0002", "v1__0003"] {
            m.add_instance(key).unwrap();
            m.set_label(key, "volume", key).unwrap();
            m.set_label(key, "style", "flexgroup_constituent").unwrap();
            m.set_label(key, "vserver_name", "svm1").unwrap();
            m.set_value("read_ops", key, 10.0).unwrap();
            m.set_value("used_percent", key, 50.0).unwrap();
        }
        BTreeMap::from([("volume".to_string(), m)])
    }

    #[test]
    fn test_constituents_roll_up_into_one_instance() {
        let mut data = constituent_volumes();
        let out = FlexGroup::new("volume").unwrap().run(&mut data).unwrap();
        assert_eq!(out.len(), 1);

        let fg = &out[0];
        assert_eq!(fg.instance_count(), 1);
        assert_eq!(fg.export_value("read_ops", "svm1.v1"), Some(30.0));
        assert_eq!(fg.export_value("used_percent", "svm1.v1"), Some(50.0));

        let row = fg.instance("svm1.v1").unwrap();
        assert_eq!(row.label("flexgroup"), "v1");
        assert_eq!(row.label("style"), "flexgroup");
        assert_eq!(row.label("vserver"), "svm1");
        assert_eq!(row.label("count"), "3");
    }

    #[test]
    fn test_constituents_are_hidden_from_export() {
        let mut data = constituent_volumes();
        FlexGroup::new("volume").unwrap().run(&mut data).unwrap();
        let m = &data["volume"];
        for key in ["v1__0001", "v1__0002", "v1__0003"] {
            assert!(!m.instance(key).unwrap().is_exportable());
        }
    }

    #[test]
    fn test_regular_volumes_are_ignored() {
        let mut data = constituent_volumes();
        {
            let m = data.get_mut("volume").unwrap();
            m.add_instance("plain").unwrap();
            m.set_label("plain", "volume", "plain").unwrap();
            m.set_label("plain", "style", "flexvol").unwrap();
            m.set_value("read_ops", "plain", 99.0).unwrap();
        }
        let out = FlexGroup::new("volume").unwrap().run(&mut data).unwrap();
        assert_eq!(out[0].instance_count(), 1);
        assert!(data["volume"].instance("plain").unwrap().is_exportable());
    }

    #[test]
    fn test_no_constituents_emits_nothing() {
        let mut m = Matrix::new("volume", "Rest:volume");
        m.add_metric("read_ops", MetricKind::Raw).unwrap();
        m.add_instance("plain").unwrap();
        m.set_label("plain", "style", "flexvol").unwrap();
        let mut data = BTreeMap::from([("volume".to_string(), m)]);
        let out = FlexGroup::new("volume").unwrap().run(&mut data).unwrap();
        assert!(out.is_empty());
    }
}
