//! Canonical encoding used for value equality and keyed ordering.

use serde::{Deserialize, Deserializer};
use serde_json::Value;

/// Canonical encoding of a JSON value: compact, with object fields in
/// sorted order, so two equal values always encode identically.
pub fn canonical(value: &Value) -> String {
    value.to_string()
}

/// Equality under the canonical encoding.
pub fn same(a: &Value, b: &Value) -> bool {
    canonical(a) == canonical(b)
}

/// `deserialize_with` target for optional JSON arguments: a field given as
/// `null` is `Some(Value::Null)`. Pair with `#[serde(default)]` so only an
/// absent field is `None`.
pub fn present<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}
