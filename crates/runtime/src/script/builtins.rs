//! Pure builtin functions available to every fragment.

use serde_json::{Map, Value};

use super::ExecError;
use super::value::{float, to_display, type_name};

/// Key under which `respond(status, body)` wraps an explicit HTTP response.
pub const RESPONSE_TAG: &str = "$response";

/// Builtin names with their (min, max) argument counts.
const BUILTINS: &[(&str, usize, usize)] = &[
    ("len", 1, 1),
    ("keys", 1, 1),
    ("values", 1, 1),
    ("contains", 2, 2),
    ("push", 2, 2),
    ("concat", 2, 2),
    ("join", 1, 2),
    ("split", 2, 2),
    ("upper", 1, 1),
    ("lower", 1, 1),
    ("trim", 1, 1),
    ("str", 1, 1),
    ("num", 1, 1),
    ("floor", 1, 1),
    ("round", 1, 1),
    ("merge", 2, 2),
    ("now", 0, 0),
    ("typeof", 1, 1),
    ("respond", 1, 2),
];

/// Argument bounds for a builtin, or `None` if no such builtin exists.
pub fn arity(name: &str) -> Option<(usize, usize)> {
    BUILTINS
        .iter()
        .find(|(n, _, _)| *n == name)
        .map(|(_, min, max)| (*min, *max))
}

/// Invoke a builtin. Arity has already been checked at compile time.
pub fn call(name: &str, mut args: Vec<Value>) -> Result<Value, ExecError> {
    let mut arg = |i: usize| -> Value { args.get_mut(i).map(Value::take).unwrap_or(Value::Null) };

    match name {
        "len" => {
            let v = arg(0);
            let n = match &v {
                Value::String(s) => s.chars().count(),
                Value::Array(a) => a.len(),
                Value::Object(o) => o.len(),
                Value::Null => 0,
                other => return Err(type_error("len", "string, array or object", other)),
            };
            Ok(Value::from(n))
        }
        "keys" => match arg(0) {
            Value::Object(o) => Ok(Value::Array(o.keys().cloned().map(Value::String).collect())),
            other => Err(type_error("keys", "object", &other)),
        },
        "values" => match arg(0) {
            Value::Object(o) => Ok(Value::Array(o.into_iter().map(|(_, v)| v).collect())),
            other => Err(type_error("values", "object", &other)),
        },
        "contains" => {
            let (haystack, needle) = (arg(0), arg(1));
            let found = match (&haystack, &needle) {
                (Value::String(s), Value::String(n)) => s.contains(n.as_str()),
                (Value::Array(items), n) => items.iter().any(|i| super::value::loose_eq(i, n)),
                (Value::Object(o), Value::String(k)) => o.contains_key(k),
                (other, _) => return Err(type_error("contains", "string, array or object", other)),
            };
            Ok(Value::Bool(found))
        }
        "push" => match arg(0) {
            Value::Array(mut items) => {
                items.push(arg(1));
                Ok(Value::Array(items))
            }
            other => Err(type_error("push", "array", &other)),
        },
        "concat" => match (arg(0), arg(1)) {
            (Value::Array(mut a), Value::Array(b)) => {
                a.extend(b);
                Ok(Value::Array(a))
            }
            (Value::String(a), b) => Ok(Value::String(a + &to_display(&b))),
            (other, _) => Err(type_error("concat", "array or string", &other)),
        },
        "join" => {
            let items = arg(0);
            let separator = match arg(1) {
                Value::Null => ",".to_string(),
                sep => to_display(&sep),
            };
            match items {
                Value::Array(items) => Ok(Value::String(
                    items
                        .iter()
                        .map(to_display)
                        .collect::<Vec<_>>()
                        .join(&separator),
                )),
                other => Err(type_error("join", "array", &other)),
            }
        }
        "split" => match (arg(0), arg(1)) {
            (Value::String(s), Value::String(sep)) => Ok(Value::Array(
                s.split(sep.as_str())
                    .map(|part| Value::String(part.to_string()))
                    .collect(),
            )),
            (other, _) => Err(type_error("split", "string", &other)),
        },
        "upper" => string_map("upper", arg(0), |s| s.to_uppercase()),
        "lower" => string_map("lower", arg(0), |s| s.to_lowercase()),
        "trim" => string_map("trim", arg(0), |s| s.trim().to_string()),
        "str" => Ok(Value::String(to_display(&arg(0)))),
        "num" => match arg(0) {
            Value::Number(n) => Ok(Value::Number(n)),
            Value::String(s) => {
                let s = s.trim();
                if let Ok(i) = s.parse::<i64>() {
                    Ok(Value::from(i))
                } else if let Ok(f) = s.parse::<f64>() {
                    float(f)
                } else {
                    Ok(Value::Null)
                }
            }
            Value::Bool(b) => Ok(Value::from(i64::from(b))),
            _ => Ok(Value::Null),
        },
        "floor" => number_map("floor", arg(0), f64::floor),
        "round" => number_map("round", arg(0), f64::round),
        "merge" => match (arg(0), arg(1)) {
            (Value::Object(mut base), Value::Object(overlay)) => {
                base.extend(overlay);
                Ok(Value::Object(base))
            }
            (Value::Null, Value::Object(overlay)) => Ok(Value::Object(overlay)),
            (base @ Value::Object(_), Value::Null) => Ok(base),
            (other, _) => Err(type_error("merge", "object", &other)),
        },
        "now" => Ok(Value::String(chrono::Utc::now().to_rfc3339())),
        "typeof" => Ok(Value::String(type_name(&arg(0)).to_string())),
        "respond" => {
            let status = arg(0);
            let body = arg(1);
            let code = status
                .as_u64()
                .filter(|c| (100..=599).contains(c))
                .ok_or_else(|| {
                    ExecError::Type(format!("respond: invalid status code {status}"))
                })?;
            let mut inner = Map::new();
            inner.insert("status".to_string(), Value::from(code));
            inner.insert("body".to_string(), body);
            let mut outer = Map::new();
            outer.insert(RESPONSE_TAG.to_string(), Value::Object(inner));
            Ok(Value::Object(outer))
        }
        other => Err(ExecError::Type(format!("unknown function '{other}'"))),
    }
}

fn type_error(function: &str, expected: &str, got: &Value) -> ExecError {
    ExecError::Type(format!(
        "{function}: expected {expected}, got {}",
        type_name(got)
    ))
}

fn string_map(function: &str, value: Value, f: impl Fn(&str) -> String) -> Result<Value, ExecError> {
    match value {
        Value::String(s) => Ok(Value::String(f(&s))),
        other => Err(type_error(function, "string", &other)),
    }
}

fn number_map(function: &str, value: Value, f: impl Fn(f64) -> f64) -> Result<Value, ExecError> {
    match value {
        Value::Number(n) => {
            if n.is_i64() || n.is_u64() {
                return Ok(Value::Number(n));
            }
            let rounded = f(n.as_f64().unwrap_or(f64::NAN));
            // Keep integral results integral so they compare and print cleanly.
            if rounded.fract() == 0.0 && rounded.abs() < 9.0e15 {
                Ok(Value::from(rounded as i64))
            } else {
                float(rounded)
            }
        }
        other => Err(type_error(function, "number", &other)),
    }
}
