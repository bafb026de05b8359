//! Value ordering and filter operator evaluation.
//! Array-valued fields are lifted: a comparison matches when any scalar
//! element matches, mirroring multi-entry index semantics.

use std::cmp::Ordering;

use serde_json::Value;

use super::descriptor::Operator;
use crate::diff::json_equal;

// ============================================================================
// Value Comparison
// ============================================================================

/// Compare two JSON values for ordering.
///
/// - Both Null → Equal
/// - a is Null → Greater (nulls sort to end)
/// - b is Null → Less
/// - Both numbers → f64 comparison (NaN treated as Equal)
/// - Both strings → lexicographic (codepoint order)
/// - Both booleans → false < true
/// - Cross-type → type rank: number(0), string(1), bool(2), other(3)
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Null, _) => Ordering::Greater,
        (_, Value::Null) => Ordering::Less,
        (Value::Number(na), Value::Number(nb)) => {
            let fa = na.as_f64().unwrap_or(f64::NAN);
            let fb = nb.as_f64().unwrap_or(f64::NAN);
            fa.partial_cmp(&fb).unwrap_or(Ordering::Equal)
        }
        (Value::String(sa), Value::String(sb)) => sa.cmp(sb),
        (Value::Bool(ba), Value::Bool(bb)) => ba.cmp(bb),
        _ => type_rank(a).cmp(&type_rank(b)),
    }
}

fn type_rank(v: &Value) -> u8 {
    match v {
        Value::Number(_) => 0,
        Value::String(_) => 1,
        Value::Bool(_) => 2,
        _ => 3,
    }
}

fn is_scalar(v: &Value) -> bool {
    match v {
        Value::String(_) | Value::Bool(_) => true,
        Value::Number(n) => n.as_f64().map(|f| !f.is_nan()).unwrap_or(false),
        _ => false,
    }
}

/// Scalar values a field contributes to comparisons: the value itself, or
/// the scalar elements of an array.
fn candidates(value: &Value) -> Vec<&Value> {
    match value {
        Value::Array(items) => items.iter().filter(|v| is_scalar(v)).collect(),
        v if is_scalar(v) => vec![v],
        _ => Vec::new(),
    }
}

// ============================================================================
// Operator Evaluation
// ============================================================================

fn equals(value: &Value, operand: &Value) -> bool {
    if operand.is_null() {
        return value.is_null();
    }
    json_equal(value, operand) || candidates(value).iter().any(|v| json_equal(v, operand))
}

fn in_range(v: &Value, lower: Option<&Value>, upper: Option<&Value>) -> bool {
    let above = lower
        .map(|lo| !lo.is_null() && compare_values(v, lo) != Ordering::Less)
        .unwrap_or(true);
    let below = upper
        .map(|hi| !hi.is_null() && compare_values(v, hi) != Ordering::Greater)
        .unwrap_or(true);
    above && below
}

/// Evaluate `operator` against a field value (`None` when the field is
/// absent) and its operand.
pub fn evaluate(operator: Operator, value: Option<&Value>, operand: &Value) -> bool {
    let value = value.unwrap_or(&Value::Null);
    match operator {
        Operator::Eq => equals(value, operand),
        Operator::Ne => !equals(value, operand),
        Operator::Any => !operand.is_null() && equals(value, operand),
        Operator::Gte => candidates(value)
            .into_iter()
            .any(|v| in_range(v, Some(operand), None)),
        Operator::Lte => candidates(value)
            .into_iter()
            .any(|v| in_range(v, None, Some(operand))),
        Operator::Between => match operand.as_array().map(Vec::as_slice) {
            Some([lower, upper]) => candidates(value)
                .into_iter()
                .any(|v| in_range(v, Some(lower), Some(upper))),
            _ => false,
        },
        Operator::In => match operand.as_array() {
            Some(options) => candidates(value)
                .into_iter()
                .any(|v| options.iter().any(|o| json_equal(v, o))),
            None => false,
        },
    }
}
