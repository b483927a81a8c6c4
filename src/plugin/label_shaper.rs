//! Label shaping: split one label into several, join several into one,
//! and regex-rewrite label values. Mutates instances in place.

use std::collections::BTreeMap;

use regex::Regex;
use serde::Deserialize;

use crate::errors::PollerError;
use crate::matrix::Matrix;

use super::{parse_params, Plugin};

#[derive(Debug, Deserialize)]
struct SplitRule {
    source: String,
    /// Tried in order; the first separator present in the value wins.
    #[serde(default = "default_separators")]
    separators: Vec<String>,
    targets: Vec<String>,
}

fn default_separators() -> Vec<String> {
    vec![".".to_string(), "_".to_string()]
}

#[derive(Debug, Deserialize)]
struct JoinRule {
    target: String,
    separator: String,
    sources: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ReplaceRule {
    label: String,
    pattern: String,
    replacement: String,
}

#[derive(Debug, Default, Deserialize)]
struct Params {
    #[serde(default)]
    split: Vec<SplitRule>,
    #[serde(default)]
    join: Vec<JoinRule>,
    #[serde(default)]
    replace: Vec<ReplaceRule>,
}

#[derive(Debug)]
pub struct LabelShaper {
    object: String,
    params: Params,
    replace: Vec<(Regex, String, String)>,
}

impl LabelShaper {
    pub fn new(object: &str, params: &serde_yaml::Value) -> Result<Self, PollerError> {
        let params: Params = parse_params("label_shaper", params)?;
        let mut replace = Vec::with_capacity(params.replace.len());
        for rule in &params.replace {
            let re = Regex::new(&rule.pattern).map_err(|e| {
                PollerError::Config(format!("label_shaper replace {}: {e}", rule.label))
            })?;
            replace.push((re, rule.label.clone(), rule.replacement.clone()));
        }
        Ok(Self {
            object: object.to_string(),
            params,
            replace,
        })
    }

    fn apply_splits(&self, labels: &mut BTreeMap<String, String>) {
        for rule in &self.params.split {
            let Some(value) = labels.get(&rule.source).cloned() else {
                continue;
            };
            let Some(sep) = rule.separators.iter().find(|s| value.contains(s.as_str())) else {
                // No separator matches: leave the labels untouched.
                continue;
            };
            let parts: Vec<&str> = value.splitn(rule.targets.len(), sep.as_str()).collect();
            for (target, part) in rule.targets.iter().zip(parts) {
                labels.insert(target.clone(), part.to_string());
            }
        }
    }

    fn apply_joins(&self, labels: &mut BTreeMap<String, String>) {
        for rule in &self.params.join {
            let parts: Vec<&str> = rule
                .sources
                .iter()
                .filter_map(|s| labels.get(s).map(String::as_str))
                .collect();
            if parts.len() == rule.sources.len() {
                labels.insert(rule.target.clone(), parts.join(&rule.separator));
            }
        }
    }

    fn apply_replaces(&self, labels: &mut BTreeMap<String, String>) {
        for (re, label, replacement) in &self.replace {
            if let Some(value) = labels.get(label) {
                let rewritten = re.replace_all(value, replacement.as_str()).into_owned();
                labels.insert(label.clone(), rewritten);
            }
        }
    }
}

impl Plugin for LabelShaper {
    fn name(&self) -> &str {
        "label_shaper"
    }

    fn run(&mut self, data: &mut BTreeMap<String, Matrix>) -> Result<Vec<Matrix>, PollerError> {
        let Some(matrix) = data.get_mut(&self.object) else {
            return Ok(Vec::new());
        };
        for (_, instance) in matrix.instances_mut() {
            let mut labels = instance.labels().clone();
            self.apply_splits(&mut labels);
            self.apply_joins(&mut labels);
            self.apply_replaces(&mut labels);
            instance.set_labels(labels);
        }
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matrix::MetricKind;

    fn shaper(yaml: &str) -> LabelShaper {
        let params = serde_yaml::from_str(yaml).unwrap();
        LabelShaper::new("fcp_adapter", &params).unwrap()
    }

    fn data_with_path(path: &str) -> BTreeMap<String, Matrix> {
        let mut m = Matrix::new("fcp_adapter", "Rest:fcp_adapter");
        m.add_metric("total_ops", MetricKind::Raw).unwrap();
        m.add_instance("a1").unwrap();
        m.set_label("a1", "path", path).unwrap();
        BTreeMap::from([("fcp_adapter".to_string(), m)])
    }

    const PATH_SPLIT: &str = r#"
split:
  - source: path
    targets: [hostadapter, target_wwpn]
"#;

    #[test]
    fn test_split_on_dot_separator() {
        let mut data = data_with_path("1a.2100001086a45d80");
        shaper(PATH_SPLIT).run(&mut data).unwrap();
        let m = &data["fcp_adapter"];
        assert_eq!(m.get_label("a1", "hostadapter"), Some("1a"));
        assert_eq!(m.get_label("a1", "target_wwpn"), Some("2100001086a45d80"));
    }

    #[test]
    fn test_split_falls_back_to_underscore() {
        let mut data = data_with_path("1a_2100001086a45d80");
        shaper(PATH_SPLIT).run(&mut data).unwrap();
        let m = &data["fcp_adapter"];
        assert_eq!(m.get_label("a1", "hostadapter"), Some("1a"));
        assert_eq!(m.get_label("a1", "target_wwpn"), Some("2100001086a45d80"));
    }

    #[test]
    fn test_split_without_separator_leaves_labels_untouched() {
        let mut data = data_with_path("no-separator");
        shaper(PATH_SPLIT).run(&mut data).unwrap();
        let m = &data["fcp_adapter"];
        assert_eq!(m.get_label("a1", "path"), Some("no-separator"));
        assert!(!m.instance("a1").unwrap().has_label("hostadapter"));
        assert!(!m.instance("a1").unwrap().has_label("target_wwpn"));
    }

    #[test]
    fn test_join_and_replace() {
        let mut data = data_with_path("1a.2100001086a45d80");
        let mut plugin = shaper(
            r#"
split:
  - source: path
    targets: [hostadapter, target_wwpn]
join:
  - target: port_id
    separator: ":"
    sources: [hostadapter, target_wwpn]
replace:
  - label: hostadapter
    pattern: "^1"
    replacement: "adapter_1"
"#,
        );
        plugin.run(&mut data).unwrap();
        let m = &data["fcp_adapter"];
        assert_eq!(m.get_label("a1", "port_id"), Some("1a:2100001086a45d80"));
        assert_eq!(m.get_label("a1", "hostadapter"), Some("adapter_1a"));
    }

    #[test]
    fn test_bad_replace_pattern_is_config_error() {
        let params = serde_yaml::from_str(
            r#"
replace:
  - label: x
    pattern: "["
    replacement: ""
"#,
        )
        .unwrap();
        let err = LabelShaper::new("volume", &params).unwrap_err();
        assert!(matches!(err, PollerError::Config(_)));
    }
}
