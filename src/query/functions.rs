//! Built-in function registry.

use rand::Rng;

use crate::query::value::{self, Value};
use crate::types::{AqlError, Result};

/// Static properties of a function, consulted by the optimizer.
#[derive(Clone, Copy, Debug)]
pub struct FunctionInfo {
    /// Upper-case name.
    pub name: &'static str,
    /// Minimum argument count.
    pub min_args: usize,
    /// Maximum argument count.
    pub max_args: usize,
    /// Same arguments always give the same result.
    pub deterministic: bool,
    /// May raise an error at runtime.
    pub can_throw: bool,
    /// May be evaluated at plan time when all arguments are constant.
    pub foldable: bool,
}

const fn pure(name: &'static str, min_args: usize, max_args: usize) -> FunctionInfo {
    FunctionInfo {
        name,
        min_args,
        max_args,
        deterministic: true,
        can_throw: false,
        foldable: true,
    }
}

static FUNCTIONS: &[FunctionInfo] = &[
    pure("ABS", 1, 1),
    pure("ATTRIBUTES", 1, 1),
    pure("CONCAT", 0, usize::MAX),
    FunctionInfo {
        name: "FAIL",
        min_args: 0,
        max_args: 1,
        deterministic: true,
        can_throw: true,
        foldable: false,
    },
    pure("FLOOR", 1, 1),
    pure("LENGTH", 1, 1),
    pure("LOWER", 1, 1),
    pure("MERGE", 1, usize::MAX),
    FunctionInfo {
        name: "NOOPT",
        min_args: 1,
        max_args: 1,
        deterministic: true,
        can_throw: false,
        foldable: false,
    },
    FunctionInfo {
        name: "RAND",
        min_args: 0,
        max_args: 0,
        deterministic: false,
        can_throw: false,
        foldable: false,
    },
    pure("TO_NUMBER", 1, 1),
    pure("TO_STRING", 1, 1),
    pure("UPPER", 1, 1),
];

/// Looks up a function by upper-case name.
pub fn lookup(name: &str) -> Option<&'static FunctionInfo> {
    FUNCTIONS.iter().find(|f| f.name == name)
}

/// Calls a function with evaluated arguments.
pub fn call(name: &str, args: Vec<Value>) -> Result<Value> {
    let info = lookup(name).ok_or_else(|| AqlError::UnknownFunction(name.to_owned()))?;
    if args.len() < info.min_args || args.len() > info.max_args {
        return Err(AqlError::ArgumentCount {
            name: name.to_owned(),
            min: info.min_args,
            max: info.max_args,
        });
    }
    let first = || args.first().cloned().unwrap_or(Value::Null);
    Ok(match info.name {
        "ABS" => value::number_value(value::to_number(&first()).abs()),
        "FLOOR" => value::number_value(value::to_number(&first()).floor()),
        "TO_NUMBER" => value::number_value(value::to_number(&first())),
        "TO_STRING" => Value::String(value::to_string_value(&first())),
        "UPPER" => Value::String(value::to_string_value(&first()).to_uppercase()),
        "LOWER" => Value::String(value::to_string_value(&first()).to_lowercase()),
        "LENGTH" => Value::from(match &first() {
            Value::Null => 0,
            Value::Bool(b) => u64::from(*b),
            Value::Number(n) => n.to_string().len() as u64,
            Value::String(s) => s.chars().count() as u64,
            Value::Array(items) => items.len() as u64,
            Value::Object(map) => map.len() as u64,
        }),
        "CONCAT" => Value::String(args.iter().map(value::to_string_value).collect()),
        "ATTRIBUTES" => match first() {
            Value::Object(map) => Value::Array(map.keys().cloned().map(Value::String).collect()),
            _ => Value::Null,
        },
        "MERGE" => {
            let mut merged = serde_json::Map::new();
            for arg in args {
                match arg {
                    Value::Object(map) => merged.extend(map),
                    other => {
                        return Err(AqlError::Type(format!(
                            "MERGE expects objects, got {other}"
                        )))
                    }
                }
            }
            Value::Object(merged)
        }
        "NOOPT" => first(),
        "RAND" => value::number_value(rand::thread_rng().gen::<f64>()),
        "FAIL" => {
            let message = args
                .first()
                .map(value::to_string_value)
                .unwrap_or_else(|| "FAIL called".to_owned());
            return Err(AqlError::FailCalled(message));
        }
        other => return Err(AqlError::UnknownFunction(other.to_owned())),
    })
}
