//! Static plugin factory.

use serde_yaml::Value;

use crate::errors::PollerError;

use super::aggregator::Aggregator;
use super::exclude::Exclude;
use super::flexgroup::FlexGroup;
use super::label_shaper::LabelShaper;
use super::status_cook::StatusCook;
use super::Plugin;

/// Instantiate a plugin by registered name, bound to `object` (the matrix
/// it operates on) and configured from its YAML parameter block.
pub fn create(name: &str, object: &str, params: &Value) -> Result<Box<dyn Plugin>, PollerError> {
    let plugin: Box<dyn Plugin> = match name {
        "label_shaper" => Box::new(LabelShaper::new(object, params)?),
        "exclude" => Box::new(Exclude::new(object, params)?),
        "aggregator" => Box::new(Aggregator::new(object, params)?),
        "flexgroup" => Box::new(FlexGroup::new(object)?),
        "status_cook" => Box::new(StatusCook::new(object, params)?),
        other => {
            return Err(PollerError::Config(format!("unknown plugin: {other}")));
        }
    };
    Ok(plugin)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_names_resolve() {
        for name in ["label_shaper", "exclude", "aggregator", "flexgroup", "status_cook"] {
            let params = match name {
                "aggregator" => serde_yaml::from_str("group_by: [node]").unwrap(),
                "status_cook" => {
                    serde_yaml::from_str("status:\n  label: state\n  ok_value: online").unwrap()
                }
                _ => Value::Null,
            };
            let plugin = create(name, "volume", &params).unwrap();
            assert_eq!(plugin.name(), name);
        }
    }

    #[test]
    fn test_unknown_name_is_config_error() {
        let err = create("bogus", "volume", &Value::Null).unwrap_err();
        assert!(matches!(err, PollerError::Config(_)));
        assert!(err.to_string().contains("bogus"));
    }
}
