//! Pure utility functions reachable from expressions.
//!
//! Namespaces: `Math`, `JSON`, `Array`, `Object`, `String`, `Number`.
//! Globals: `String(x)`, `Number(x)`, `Boolean(x)`.
//! Methods on strings and arrays: `includes`, `indexOf`, `join`, `slice`,
//! `startsWith`, `endsWith`, `toUpperCase`, `toLowerCase`, `trim`, `split`.

use serde_json::{Map, Value};

use super::eval::{strict_equals, to_number};
use super::{number, to_display_string, truthy, ExpressionError};

const NAMESPACES: &[&str] = &["Math", "JSON", "Array", "Object", "String", "Number"];

pub fn is_namespace(name: &str) -> bool {
    NAMESPACES.contains(&name)
}

fn arg(args: &[Value], i: usize) -> &Value {
    args.get(i).unwrap_or(&Value::Null)
}

fn unknown(what: &str) -> ExpressionError {
    ExpressionError::Type(format!("{what} is not a function"))
}

pub fn call_namespace(ns: &str, name: &str, args: &[Value]) -> Result<Value, ExpressionError> {
    let nums = || args.iter().map(to_number);
    Ok(match (ns, name) {
        ("Math", "min") => number(nums().fold(f64::INFINITY, f64::min)),
        ("Math", "max") => number(nums().fold(f64::NEG_INFINITY, f64::max)),
        ("Math", "abs") => number(to_number(arg(args, 0)).abs()),
        ("Math", "floor") => number(to_number(arg(args, 0)).floor()),
        ("Math", "ceil") => number(to_number(arg(args, 0)).ceil()),
        // JS rounds halves toward +infinity.
        ("Math", "round") => number((to_number(arg(args, 0)) + 0.5).floor()),
        ("Math", "pow") => number(to_number(arg(args, 0)).powf(to_number(arg(args, 1)))),
        ("Math", "sqrt") => number(to_number(arg(args, 0)).sqrt()),
        ("JSON", "stringify") => Value::String(
            serde_json::to_string(arg(args, 0)).map_err(|e| ExpressionError::Type(e.to_string()))?,
        ),
        ("JSON", "parse") => {
            let text = to_display_string(arg(args, 0));
            serde_json::from_str(&text).map_err(|e| ExpressionError::Type(format!("JSON.parse: {e}")))?
        }
        ("Array", "isArray") => Value::Bool(arg(args, 0).is_array()),
        ("Object", "keys") => match arg(args, 0) {
            Value::Object(map) => Value::Array(map.keys().cloned().map(Value::String).collect()),
            _ => Value::Array(Vec::new()),
        },
        ("Object", "values") => match arg(args, 0) {
            Value::Object(map) => Value::Array(map.values().cloned().collect()),
            _ => Value::Array(Vec::new()),
        },
        ("Object", "entries") => match arg(args, 0) {
            Value::Object(map) => Value::Array(
                map.iter()
                    .map(|(k, v)| Value::Array(vec![Value::String(k.clone()), v.clone()]))
                    .collect(),
            ),
            _ => Value::Array(Vec::new()),
        },
        ("String", "isString") => Value::Bool(arg(args, 0).is_string()),
        ("Number", "isInteger") => Value::Bool(arg(args, 0).as_f64().is_some_and(|f| f.fract() == 0.0)),
        ("Number", "parseFloat") => number(to_number(arg(args, 0))),
        _ => return Err(unknown(&format!("{ns}.{name}"))),
    })
}

pub fn call_global(name: &str, args: &[Value]) -> Result<Value, ExpressionError> {
    match name {
        "String" => Ok(Value::String(to_display_string(arg(args, 0)))),
        "Number" => Ok(number(to_number(arg(args, 0)))),
        "Boolean" => Ok(Value::Bool(truthy(arg(args, 0)))),
        _ => Err(ExpressionError::Reference(name.to_owned())),
    }
}

pub fn call_method(receiver: &Value, method: &str, args: &[Value]) -> Result<Value, ExpressionError> {
    match receiver {
        Value::String(s) => string_method(s, method, args),
        Value::Array(items) => array_method(items, method, args),
        Value::Object(map) => object_method(map, method, args),
        Value::Null => Err(ExpressionError::Type(format!("cannot call '{method}' on null"))),
        _ => Err(unknown(method)),
    }
}

fn string_method(s: &str, method: &str, args: &[Value]) -> Result<Value, ExpressionError> {
    let needle = || to_display_string(arg(args, 0));
    Ok(match method {
        "includes" => Value::Bool(s.contains(&needle())),
        "startsWith" => Value::Bool(s.starts_with(&needle())),
        "endsWith" => Value::Bool(s.ends_with(&needle())),
        "indexOf" => match s.find(&needle()) {
            Some(byte) => Value::from(s[..byte].chars().count()),
            None => Value::from(-1),
        },
        "toUpperCase" => Value::String(s.to_uppercase()),
        "toLowerCase" => Value::String(s.to_lowercase()),
        "trim" => Value::String(s.trim().to_owned()),
        "split" => {
            let sep = needle();
            let parts: Vec<Value> = if sep.is_empty() {
                s.chars().map(|c| Value::String(c.to_string())).collect()
            } else {
                s.split(sep.as_str()).map(|p| Value::String(p.to_owned())).collect()
            };
            Value::Array(parts)
        }
        "slice" => {
            let chars: Vec<char> = s.chars().collect();
            let (start, end) = slice_bounds(chars.len(), args);
            Value::String(chars[start..end].iter().collect())
        }
        "toString" => Value::String(s.to_owned()),
        _ => return Err(unknown(method)),
    })
}

fn array_method(items: &[Value], method: &str, args: &[Value]) -> Result<Value, ExpressionError> {
    Ok(match method {
        "includes" => Value::Bool(items.iter().any(|v| strict_equals(v, arg(args, 0)))),
        "indexOf" => match items.iter().position(|v| strict_equals(v, arg(args, 0))) {
            Some(i) => Value::from(i),
            None => Value::from(-1),
        },
        "join" => {
            let sep = match arg(args, 0) {
                Value::Null => ",".to_owned(),
                other => to_display_string(other),
            };
            let parts: Vec<String> = items.iter().map(to_display_string).collect();
            Value::String(parts.join(&sep))
        }
        "slice" => {
            let (start, end) = slice_bounds(items.len(), args);
            Value::Array(items[start..end].to_vec())
        }
        _ => return Err(unknown(method)),
    })
}

fn object_method(map: &Map<String, Value>, method: &str, args: &[Value]) -> Result<Value, ExpressionError> {
    match method {
        "hasOwnProperty" => Ok(Value::Bool(map.contains_key(&to_display_string(arg(args, 0))))),
        _ => Err(unknown(method)),
    }
}

/// JS-style `slice(start, end)` bounds with negative offsets from the end.
fn slice_bounds(len: usize, args: &[Value]) -> (usize, usize) {
    let resolve = |v: &Value, default: usize| -> usize {
        if v.is_null() {
            return default;
        }
        let n = to_number(v);
        if n.is_nan() {
            return 0;
        }
        let n = n.trunc();
        if n < 0.0 {
            (len as f64 + n).max(0.0) as usize
        } else {
            (n as usize).min(len)
        }
    };
    let start = resolve(arg(args, 0), 0);
    let end = resolve(arg(args, 1), len);
    (start, end.max(start))
}
