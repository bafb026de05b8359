//! Field-level differences between two serialized records.
//!
//! Absent fields and explicit nulls are equivalent, and numbers compare by
//! value so that `1` and `1.0` are the same field state.

use serde_json::Value;

use crate::types::Record;

// ============================================================================
// Equality
// ============================================================================

/// Structural equality for serialized field values.
pub fn json_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_f64(), y.as_f64()) {
            (Some(fx), Some(fy)) => fx == fy,
            _ => x == y,
        },
        (Value::Array(xs), Value::Array(ys)) => {
            xs.len() == ys.len() && xs.iter().zip(ys).all(|(x, y)| json_equal(x, y))
        }
        (Value::Object(xs), Value::Object(ys)) => {
            xs.len() == ys.len()
                && xs
                    .iter()
                    .all(|(k, x)| ys.get(k).map(|y| json_equal(x, y)).unwrap_or(false))
        }
        _ => a == b,
    }
}

/// Equality treating an absent field the same as an explicit null.
pub fn field_equal(a: Option<&Value>, b: Option<&Value>) -> bool {
    let a = a.unwrap_or(&Value::Null);
    let b = b.unwrap_or(&Value::Null);
    json_equal(a, b)
}

// ============================================================================
// Differences
// ============================================================================

/// Compare `from` and `to` over `keys`, returning the previous value of every
/// field that changed (null when it was absent).
pub fn differences<'a>(
    from: &Record,
    to: &Record,
    keys: impl IntoIterator<Item = &'a str>,
) -> Record {
    let mut changed = Record::new();
    for key in keys {
        if !field_equal(from.get(key), to.get(key)) {
            changed.insert(
                key.to_string(),
                from.get(key).cloned().unwrap_or(Value::Null),
            );
        }
    }
    changed
}
