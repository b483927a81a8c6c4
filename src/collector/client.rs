//! Protocol client contract and record addressing.
//!
//! Concrete clients (REST, ZAPI, ...) live outside the pipeline; the
//! collector only depends on this trait. Responses are JSON record trees
//! addressed by dotted paths, so templates stay protocol-agnostic.

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::errors::PollerError;

/// One connection to a monitored target.
///
/// Every call takes the cancel token and must return promptly once it is
/// triggered, reporting [`PollerError::Cancelled`].
#[async_trait]
pub trait ProtocolClient: Send + Sync {
    /// Protocol family name (`Rest`, `Zapi`, ...); tags matrices.
    fn name(&self) -> &str;

    /// Authenticate and establish the session.
    async fn connect(&mut self, cancel: &CancellationToken) -> Result<(), PollerError>;

    /// Run one query and return its record tree.
    async fn fetch(&mut self, query: &str, cancel: &CancellationToken)
        -> Result<Value, PollerError>;

    async fn close(&mut self);
}

/// Walk a dotted path through a record tree. Numeric segments index
/// arrays.
pub fn lookup<'a>(record: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = record;
    for segment in path.split('.') {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Scalar at a dotted path, rendered as a string.
pub fn lookup_str(record: &Value, path: &str) -> Option<String> {
    match lookup(record, path)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// The record list of a response: a top-level array, or its `records`
/// field.
pub fn records(response: &Value) -> &[Value] {
    match response {
        Value::Array(items) => items,
        Value::Object(map) => match map.get("records") {
            Some(Value::Array(items)) => items,
            _ => &[],
        },
        _ => &[],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_lookup_nested_paths() {
        let record = json!({
            "volume": {"name": "vol1", "aggregates": [{"name": "aggr1"}]},
            "iops": 250
        });
        assert_eq!(lookup_str(&record, "volume.name").as_deref(), Some("vol1"));
        assert_eq!(
            lookup_str(&record, "volume.aggregates.0.name").as_deref(),
            Some("aggr1")
        );
        assert_eq!(lookup_str(&record, "iops").as_deref(), Some("250"));
        assert_eq!(lookup_str(&record, "volume.missing"), None);
        assert_eq!(lookup_str(&record, "volume"), None); // not a scalar
    }

    #[test]
    fn test_records_extraction() {
        let wrapped = json!({"records": [{"a": 1}, {"a": 2}], "num_records": 2});
        assert_eq!(records(&wrapped).len(), 2);

        let bare = json!([{"a": 1}]);
        assert_eq!(records(&bare).len(), 1);

        assert!(records(&json!({"no": "records"})).is_empty());
        assert!(records(&json!(42)).is_empty());
    }
}
