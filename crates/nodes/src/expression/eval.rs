//! Tree-walking evaluator over an explicit lookup table.

use serde_json::{Map, Value};

use super::functions;
use super::parser::{BinaryOp, Expr, LogicalOp, UnaryOp};
use super::{number, to_display_string, truthy, ExpressionError};

pub fn eval(expr: &Expr, scope: &Map<String, Value>) -> Result<Value, ExpressionError> {
    match expr {
        Expr::Literal(v) => Ok(v.clone()),
        Expr::Ident(name) => scope
            .get(name)
            .cloned()
            .ok_or_else(|| ExpressionError::Reference(name.clone())),
        Expr::Member(object, name) => {
            let target = eval(object, scope)?;
            Ok(member(&target, name))
        }
        Expr::Index(object, index) => {
            let target = eval(object, scope)?;
            let key = eval(index, scope)?;
            Ok(index_value(&target, &key))
        }
        Expr::Call(callee, args) => call(callee, args, scope),
        Expr::Unary(op, operand) => {
            let v = eval(operand, scope)?;
            Ok(match op {
                UnaryOp::Not => Value::Bool(!truthy(&v)),
                UnaryOp::Neg => number(-to_number(&v)),
                UnaryOp::Plus => number(to_number(&v)),
            })
        }
        Expr::Binary(op, lhs, rhs) => {
            let l = eval(lhs, scope)?;
            let r = eval(rhs, scope)?;
            Ok(binary(*op, &l, &r))
        }
        Expr::Logical(op, lhs, rhs) => {
            let l = eval(lhs, scope)?;
            match op {
                LogicalOp::And if !truthy(&l) => Ok(l),
                LogicalOp::Or if truthy(&l) => Ok(l),
                LogicalOp::Nullish if !l.is_null() => Ok(l),
                _ => eval(rhs, scope),
            }
        }
        Expr::Conditional(cond, then, otherwise) => {
            if truthy(&eval(cond, scope)?) {
                eval(then, scope)
            } else {
                eval(otherwise, scope)
            }
        }
        Expr::Array(items) => items
            .iter()
            .map(|e| eval(e, scope))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Expr::Object(entries) => {
            let mut map = Map::new();
            for (key, value) in entries {
                map.insert(key.clone(), eval(value, scope)?);
            }
            Ok(Value::Object(map))
        }
    }
}

fn call(callee: &Expr, args: &[Expr], scope: &Map<String, Value>) -> Result<Value, ExpressionError> {
    let args = args
        .iter()
        .map(|a| eval(a, scope))
        .collect::<Result<Vec<_>, _>>()?;

    match callee {
        // Utility namespaces, unless a variable of the same name shadows them.
        Expr::Member(object, method) => match object.as_ref() {
            Expr::Ident(ns) if !scope.contains_key(ns) && functions::is_namespace(ns) => {
                functions::call_namespace(ns, method, &args)
            }
            _ => {
                let receiver = eval(object, scope)?;
                functions::call_method(&receiver, method, &args)
            }
        },
        Expr::Ident(name) if !scope.contains_key(name) => functions::call_global(name, &args),
        _ => Err(ExpressionError::Type("expression is not callable".into())),
    }
}

pub(super) fn member(target: &Value, name: &str) -> Value {
    match (target, name) {
        (Value::Array(items), "length") => Value::from(items.len()),
        (Value::String(s), "length") => Value::from(s.chars().count()),
        (Value::Object(map), key) => map.get(key).cloned().unwrap_or(Value::Null),
        _ => Value::Null,
    }
}

fn index_value(target: &Value, key: &Value) -> Value {
    match (target, key) {
        (Value::Array(items), Value::Number(n)) => n
            .as_f64()
            .filter(|f| *f >= 0.0 && f.fract() == 0.0)
            .and_then(|f| items.get(f as usize))
            .cloned()
            .unwrap_or(Value::Null),
        (Value::String(s), Value::Number(n)) => n
            .as_u64()
            .and_then(|i| s.chars().nth(i as usize))
            .map(|c| Value::String(c.to_string()))
            .unwrap_or(Value::Null),
        (_, Value::String(name)) => member(target, name),
        (Value::Object(map), other) => map.get(&to_display_string(other)).cloned().unwrap_or(Value::Null),
        _ => Value::Null,
    }
}

pub(super) fn to_number(v: &Value) -> f64 {
    match v {
        Value::Null => 0.0,
        Value::Bool(b) => f64::from(u8::from(*b)),
        Value::Number(n) => n.as_f64().unwrap_or(f64::NAN),
        Value::String(s) if s.trim().is_empty() => 0.0,
        Value::String(s) => s.trim().parse().unwrap_or(f64::NAN),
        Value::Array(_) | Value::Object(_) => f64::NAN,
    }
}

fn binary(op: BinaryOp, l: &Value, r: &Value) -> Value {
    match op {
        BinaryOp::Add => {
            if l.is_string() || r.is_string() {
                Value::String(format!("{}{}", concat_string(l), concat_string(r)))
            } else {
                number(to_number(l) + to_number(r))
            }
        }
        BinaryOp::Sub => number(to_number(l) - to_number(r)),
        BinaryOp::Mul => number(to_number(l) * to_number(r)),
        BinaryOp::Div => number(to_number(l) / to_number(r)),
        BinaryOp::Rem => number(to_number(l) % to_number(r)),
        BinaryOp::StrictEq => Value::Bool(strict_equals(l, r)),
        BinaryOp::StrictNotEq => Value::Bool(!strict_equals(l, r)),
        BinaryOp::Eq => Value::Bool(loose_equals(l, r)),
        BinaryOp::NotEq => Value::Bool(!loose_equals(l, r)),
        BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => Value::Bool(compare(op, l, r)),
    }
}

/// String form used by `+` concatenation, where null prints as `null`.
fn concat_string(v: &Value) -> String {
    match v {
        Value::Null => "null".into(),
        other => to_display_string(other),
    }
}

pub(super) fn strict_equals(l: &Value, r: &Value) -> bool {
    match (l, r) {
        (Value::Number(a), Value::Number(b)) => a.as_f64() == b.as_f64(),
        (Value::Array(a), Value::Array(b)) => {
            a.len() == b.len() && a.iter().zip(b).all(|(x, y)| strict_equals(x, y))
        }
        (Value::Object(a), Value::Object(b)) => {
            a.len() == b.len() && a.iter().all(|(k, v)| b.get(k).is_some_and(|w| strict_equals(v, w)))
        }
        _ => l == r,
    }
}

fn loose_equals(l: &Value, r: &Value) -> bool {
    if strict_equals(l, r) {
        return true;
    }
    match (l, r) {
        (Value::Number(_), Value::String(_))
        | (Value::String(_), Value::Number(_))
        | (Value::Bool(_), Value::Number(_) | Value::String(_))
        | (Value::Number(_) | Value::String(_), Value::Bool(_)) => to_number(l) == to_number(r),
        _ => false,
    }
}

fn compare(op: BinaryOp, l: &Value, r: &Value) -> bool {
    let ordering = match (l, r) {
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => to_number(l).partial_cmp(&to_number(r)),
    };
    let Some(ordering) = ordering else { return false };
    match op {
        BinaryOp::Lt => ordering.is_lt(),
        BinaryOp::Le => ordering.is_le(),
        BinaryOp::Gt => ordering.is_gt(),
        BinaryOp::Ge => ordering.is_ge(),
        _ => false,
    }
}
