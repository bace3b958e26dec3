//! Scalar normalization: engine [`Value`]s to JSON.
//!
//! The materializer never decides how a cell is spelled in the output. It hands
//! each cell to a [`ScalarNormalizer`], which is shared read-only by every worker.

use serde_json::{Number, Value as JsonValue};

use crate::common::{DEFAULT_TIMESTAMP_FORMAT, Value};

pub trait ScalarNormalizer: Send + Sync {
    fn normalize(&self, value: &Value) -> JsonValue;
}

impl<F> ScalarNormalizer for F
where
    F: Fn(&Value) -> JsonValue + Send + Sync,
{
    fn normalize(&self, value: &Value) -> JsonValue {
        self(value)
    }
}

/// Missing numbers become `null`, infinities and instants become strings,
/// everything else passes through.
#[derive(Debug, Clone)]
pub struct DefaultNormalizer {
    pub timestamp_format: String,
}

impl Default for DefaultNormalizer {
    fn default() -> Self {
        Self {
            timestamp_format: DEFAULT_TIMESTAMP_FORMAT.to_string(),
        }
    }
}

impl DefaultNormalizer {
    pub fn with_format(timestamp_format: impl Into<String>) -> Self {
        Self {
            timestamp_format: timestamp_format.into(),
        }
    }
}

impl ScalarNormalizer for DefaultNormalizer {
    fn normalize(&self, value: &Value) -> JsonValue {
        match value {
            Value::Null => JsonValue::Null,
            Value::Bool(b) => JsonValue::Bool(*b),
            Value::Int(i) => JsonValue::from(*i),
            Value::Float(f) if f.is_nan() => JsonValue::Null,
            Value::Float(f) if f.is_infinite() => {
                JsonValue::String(if *f > 0.0 { "inf" } else { "-inf" }.to_string())
            }
            Value::Float(f) => Number::from_f64(*f).map_or(JsonValue::Null, JsonValue::Number),
            Value::Str(s) => JsonValue::String(s.clone()),
            Value::Timestamp(ts) => JsonValue::String(ts.format(&self.timestamp_format)),
            Value::List(items) => {
                JsonValue::Array(items.iter().map(|v| self.normalize(v)).collect())
            }
        }
    }
}
