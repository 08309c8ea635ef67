//! Document value helpers shared by the optimizer and the execution blocks.
//!
//! Documents and intermediate values are plain [`serde_json::Value`]s. This
//! module supplies the query language semantics on top of them: a total order
//! across types, truthiness and numeric coercion.

use std::cmp::Ordering;

pub use serde_json::Value;

/// Attribute name of the primary key.
pub const KEY_ATTRIBUTE: &str = "_key";

/// Shared `null`, for lookups that fall back to null by reference.
pub static NULL: Value = Value::Null;

/// Rank of a value's type in the cross-type ordering.
fn type_weight(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Array(_) => 4,
        Value::Object(_) => 5,
    }
}

/// Compares two values using the query language ordering:
/// `null < bool < number < string < array < object`.
pub fn compare_values(lhs: &Value, rhs: &Value) -> Ordering {
    let (wl, wr) = (type_weight(lhs), type_weight(rhs));
    if wl != wr {
        return wl.cmp(&wr);
    }
    match (lhs, rhs) {
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
        (Value::Number(a), Value::Number(b)) => {
            match (a.as_i64(), b.as_i64()) {
                (Some(x), Some(y)) => x.cmp(&y),
                _ => {
                    let x = a.as_f64().unwrap_or(0.0);
                    let y = b.as_f64().unwrap_or(0.0);
                    x.total_cmp(&y)
                }
            }
        }
        (Value::String(a), Value::String(b)) => a.cmp(b),
        (Value::Array(a), Value::Array(b)) => {
            let len = a.len().max(b.len());
            for idx in 0..len {
                let x = a.get(idx).unwrap_or(&NULL);
                let y = b.get(idx).unwrap_or(&NULL);
                match compare_values(x, y) {
                    Ordering::Equal => continue,
                    other => return other,
                }
            }
            Ordering::Equal
        }
        (Value::Object(a), Value::Object(b)) => {
            // serde_json maps iterate in key order, so the key sequences are canonical.
            let mut keys: Vec<&String> = a.keys().chain(b.keys()).collect();
            keys.sort();
            keys.dedup();
            for key in keys {
                let x = a.get(key).unwrap_or(&NULL);
                let y = b.get(key).unwrap_or(&NULL);
                match compare_values(x, y) {
                    Ordering::Equal => continue,
                    other => return other,
                }
            }
            Ordering::Equal
        }
        _ => Ordering::Equal,
    }
}

/// Equality under [`compare_values`].
pub fn values_equal(lhs: &Value, rhs: &Value) -> bool {
    compare_values(lhs, rhs) == Ordering::Equal
}

/// Boolean interpretation of a value.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// Numeric interpretation of a value. Values without a sensible number map to `0`.
pub fn to_number(value: &Value) -> f64 {
    match value {
        Value::Null => 0.0,
        Value::Bool(b) => {
            if *b {
                1.0
            } else {
                0.0
            }
        }
        Value::Number(n) => n.as_f64().unwrap_or(0.0),
        Value::String(s) => s
            .trim()
            .parse::<f64>()
            .ok()
            .filter(|f| f.is_finite())
            .unwrap_or(0.0),
        Value::Array(items) => match items.as_slice() {
            [single] => to_number(single),
            _ => 0.0,
        },
        Value::Object(_) => 0.0,
    }
}

/// Builds a number value, preferring an integer representation.
pub fn number_value(number: f64) -> Value {
    if number.fract() == 0.0 && number.abs() < 9.0e15 {
        return Value::from(number as i64);
    }
    serde_json::Number::from_f64(number)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

/// String interpretation of a value.
pub fn to_string_value(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Reads an attribute path from a document, returning `null` when any step is absent.
pub fn get_path<'a>(doc: &'a Value, path: &[String]) -> &'a Value {
    let mut current = doc;
    for step in path {
        match current {
            Value::Object(map) => match map.get(step) {
                Some(next) => current = next,
                None => return &NULL,
            },
            _ => return &NULL,
        }
    }
    current
}

/// Writes `value` at `path` inside `doc`, creating intermediate objects.
pub fn set_path(doc: &mut Value, path: &[String], value: Value) {
    let Some((last, parents)) = path.split_last() else {
        *doc = value;
        return;
    };
    let mut current = doc;
    for step in parents {
        if !current.is_object() {
            *current = Value::Object(serde_json::Map::new());
        }
        let Value::Object(map) = current else {
            return;
        };
        current = map
            .entry(step.clone())
            .or_insert_with(|| Value::Object(serde_json::Map::new()));
    }
    if !current.is_object() {
        *current = Value::Object(serde_json::Map::new());
    }
    if let Value::Object(map) = current {
        map.insert(last.clone(), value);
    }
}

/// Returns the document key when present and a string.
pub fn document_key(doc: &Value) -> Option<&str> {
    doc.get(KEY_ATTRIBUTE).and_then(Value::as_str)
}
