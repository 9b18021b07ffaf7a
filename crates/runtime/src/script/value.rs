//! Operator semantics over JSON values.

use std::cmp::Ordering;

use serde_json::{Number, Value};

use super::ExecError;
use super::ast::BinaryOp;

/// Truthiness: `null`, `false`, `0` and `""` are false, everything else is true.
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// Name of a value's type, as reported by `typeof`.
pub fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Render a value as display text (strings unquoted).
pub fn to_display(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        other => other.to_string(),
    }
}

/// Structural equality that treats `1` and `1.0` as equal.
pub fn loose_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_i64(), y.as_i64()) {
            (Some(i), Some(j)) => i == j,
            _ => x.as_f64() == y.as_f64(),
        },
        (Value::Array(xs), Value::Array(ys)) => {
            xs.len() == ys.len() && xs.iter().zip(ys).all(|(x, y)| loose_eq(x, y))
        }
        (Value::Object(xs), Value::Object(ys)) => {
            xs.len() == ys.len()
                && xs
                    .iter()
                    .all(|(k, v)| ys.get(k).is_some_and(|w| loose_eq(v, w)))
        }
        _ => a == b,
    }
}

/// Deepest nesting a script value may reach; matches the JSON parser's limit.
pub const MAX_VALUE_DEPTH: usize = 128;

/// Approximate footprint of a value: one unit per node plus the bytes of
/// every string and object key. `None` as soon as it exceeds `limit` or
/// nests deeper than [`MAX_VALUE_DEPTH`].
pub fn size_within(value: &Value, limit: usize) -> Option<usize> {
    let mut size = 0usize;
    let mut pending = vec![(value, 1)];
    while let Some((value, depth)) = pending.pop() {
        if depth > MAX_VALUE_DEPTH {
            return None;
        }
        size += 1;
        match value {
            Value::String(s) => size += s.len(),
            Value::Array(items) => pending.extend(items.iter().map(|v| (v, depth + 1))),
            Value::Object(map) => {
                for (key, value) in map {
                    size += key.len();
                    pending.push((value, depth + 1));
                }
            }
            Value::Null | Value::Bool(_) | Value::Number(_) => {}
        }
        if size > limit {
            return None;
        }
    }
    Some(size)
}

pub fn float(f: f64) -> Result<Value, ExecError> {
    Number::from_f64(f)
        .map(Value::Number)
        .ok_or_else(|| ExecError::Type(format!("arithmetic produced a non-finite number ({f})")))
}

/// Apply an arithmetic or comparison operator. Logical operators are
/// short-circuited by the interpreter and never reach this function.
pub fn binary(op: BinaryOp, left: &Value, right: &Value) -> Result<Value, ExecError> {
    match op {
        BinaryOp::Eq => Ok(Value::Bool(loose_eq(left, right))),
        BinaryOp::NotEq => Ok(Value::Bool(!loose_eq(left, right))),
        BinaryOp::Lt | BinaryOp::LtEq | BinaryOp::Gt | BinaryOp::GtEq => {
            let ordering = compare(left, right)?;
            Ok(Value::Bool(match op {
                BinaryOp::Lt => ordering == Ordering::Less,
                BinaryOp::LtEq => ordering != Ordering::Greater,
                BinaryOp::Gt => ordering == Ordering::Greater,
                _ => ordering != Ordering::Less,
            }))
        }
        BinaryOp::Add => add(left, right),
        BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div | BinaryOp::Rem => {
            arithmetic(op, left, right)
        }
        BinaryOp::And | BinaryOp::Or | BinaryOp::Coalesce => Err(ExecError::Type(
            "logical operator evaluated eagerly".to_string(),
        )),
    }
}

fn compare(left: &Value, right: &Value) -> Result<Ordering, ExecError> {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => {
            if let (Some(i), Some(j)) = (a.as_i64(), b.as_i64()) {
                return Ok(i.cmp(&j));
            }
            let (x, y) = (a.as_f64().unwrap_or(f64::NAN), b.as_f64().unwrap_or(f64::NAN));
            x.partial_cmp(&y)
                .ok_or_else(|| ExecError::Type("cannot compare NaN".to_string()))
        }
        (Value::String(a), Value::String(b)) => Ok(a.cmp(b)),
        _ => Err(ExecError::Type(format!(
            "cannot compare {} with {}",
            type_name(left),
            type_name(right)
        ))),
    }
}

fn add(left: &Value, right: &Value) -> Result<Value, ExecError> {
    match (left, right) {
        (Value::String(a), b) => Ok(Value::String(format!("{a}{}", to_display(b)))),
        (a, Value::String(b)) => Ok(Value::String(format!("{}{b}", to_display(a)))),
        (Value::Array(a), Value::Array(b)) => {
            let mut out = a.clone();
            out.extend(b.iter().cloned());
            Ok(Value::Array(out))
        }
        _ => arithmetic(BinaryOp::Add, left, right),
    }
}

fn arithmetic(op: BinaryOp, left: &Value, right: &Value) -> Result<Value, ExecError> {
    let (Value::Number(a), Value::Number(b)) = (left, right) else {
        return Err(ExecError::Type(format!(
            "cannot apply arithmetic to {} and {}",
            type_name(left),
            type_name(right)
        )));
    };

    if let (Some(i), Some(j)) = (a.as_i64(), b.as_i64()) {
        let exact = match op {
            BinaryOp::Add => i.checked_add(j),
            BinaryOp::Sub => i.checked_sub(j),
            BinaryOp::Mul => i.checked_mul(j),
            BinaryOp::Div => {
                if j == 0 {
                    return Err(ExecError::Type("division by zero".to_string()));
                }
                if i % j == 0 { i.checked_div(j) } else { None }
            }
            BinaryOp::Rem => {
                if j == 0 {
                    return Err(ExecError::Type("division by zero".to_string()));
                }
                i.checked_rem(j)
            }
            _ => None,
        };
        if let Some(n) = exact {
            return Ok(Value::from(n));
        }
    }

    let (x, y) = (a.as_f64().unwrap_or(f64::NAN), b.as_f64().unwrap_or(f64::NAN));
    let result = match op {
        BinaryOp::Add => x + y,
        BinaryOp::Sub => x - y,
        BinaryOp::Mul => x * y,
        BinaryOp::Div => {
            if y == 0.0 {
                return Err(ExecError::Type("division by zero".to_string()));
            }
            x / y
        }
        BinaryOp::Rem => {
            if y == 0.0 {
                return Err(ExecError::Type("division by zero".to_string()));
            }
            x % y
        }
        _ => return Err(ExecError::Type("unsupported arithmetic operator".to_string())),
    };
    float(result)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn integer_arithmetic_stays_integral() {
        assert_eq!(binary(BinaryOp::Add, &json!(2), &json!(3)).unwrap(), json!(5));
        assert_eq!(binary(BinaryOp::Div, &json!(6), &json!(3)).unwrap(), json!(2));
        assert_eq!(binary(BinaryOp::Div, &json!(7), &json!(2)).unwrap(), json!(3.5));
    }

    #[test]
    fn overflow_falls_back_to_float() {
        let v = binary(BinaryOp::Mul, &json!(i64::MAX), &json!(2)).unwrap();
        assert!(v.as_f64().unwrap() > 1e18);
    }

    #[test]
    fn division_by_zero_is_an_error() {
        assert!(binary(BinaryOp::Div, &json!(1), &json!(0)).is_err());
        assert!(binary(BinaryOp::Rem, &json!(1.5), &json!(0.0)).is_err());
    }

    #[test]
    fn string_concatenation() {
        assert_eq!(
            binary(BinaryOp::Add, &json!("total: "), &json!(42)).unwrap(),
            json!("total: 42")
        );
    }

    #[test]
    fn loose_equality_across_number_kinds() {
        assert!(loose_eq(&json!(1), &json!(1.0)));
        assert!(loose_eq(&json!({"a": [1]}), &json!({"a": [1.0]})));
        assert!(!loose_eq(&json!("1"), &json!(1)));
    }

    #[test]
    fn comparing_mismatched_types_fails() {
        assert!(binary(BinaryOp::Lt, &json!("a"), &json!(1)).is_err());
        assert_eq!(
            binary(BinaryOp::Lt, &json!("a"), &json!("b")).unwrap(),
            json!(true)
        );
    }

    #[test]
    fn size_counts_nodes_and_bytes() {
        assert_eq!(size_within(&json!(1), 100), Some(1));
        assert_eq!(size_within(&json!("abc"), 100), Some(4));
        assert_eq!(size_within(&json!({"ab": [1, 2]}), 100), Some(6));
        assert_eq!(size_within(&json!("x".repeat(50)), 10), None);

        let mut deep = json!(1);
        for _ in 0..MAX_VALUE_DEPTH {
            deep = json!([deep]);
        }
        assert_eq!(size_within(&deep, usize::MAX), None);
    }

    #[test]
    fn truthiness() {
        assert!(!truthy(&json!(null)));
        assert!(!truthy(&json!(0)));
        assert!(!truthy(&json!("")));
        assert!(truthy(&json!([])));
        assert!(truthy(&json!("x")));
    }
}
