//! Normalization of the listing shapes the appliance returns.
use serde_json::Value;

/// A listing response, either an ordered run of records or a payload we
/// could not interpret (kept for logging).
#[derive(Debug, Clone, PartialEq)]
pub enum Shape {
    Records(Vec<Value>),
    Unrecognized(Value),
}

/// Accepts a bare array, `{items: [...]}` or `{data: [...]}`.
pub fn normalize(value: Value) -> Shape {
    match value {
        Value::Array(records) => Shape::Records(records),
        Value::Object(mut map) => {
            for key in ["items", "data"] {
                if matches!(map.get(key), Some(Value::Array(_))) {
                    if let Some(Value::Array(records)) = map.remove(key) {
                        return Shape::Records(records);
                    }
                }
            }
            Shape::Unrecognized(Value::Object(map))
        }
        other => Shape::Unrecognized(other),
    }
}

/// Total item count reported alongside a page, when the endpoint provides one.
pub fn reported_total(value: &Value) -> Option<usize> {
    ["total", "totalCount", "count"].iter().find_map(|key| {
        value
            .get(key)
            .and_then(Value::as_u64)
            .and_then(|total| usize::try_from(total).ok())
    })
}

/// Records of a response, or an empty list when the shape is unknown.
pub fn records_or_empty(value: Value, endpoint: &str) -> Vec<Value> {
    match normalize(value) {
        Shape::Records(records) => records,
        Shape::Unrecognized(raw) => {
            tracing::debug!(
                endpoint,
                payload = %crate::util::truncate_string(&raw.to_string(), 200),
                "unrecognized listing shape"
            );
            Vec::new()
        }
    }
}
