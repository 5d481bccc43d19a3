//! Sandboxed expression language.
//!
//! A small tokenizer/parser/evaluator over a fixed grammar: literals (numbers,
//! strings, booleans, null, arrays, objects), identifiers, property and index
//! access, calls into a fixed set of pure utility functions, unary `!`/`-`,
//! arithmetic, comparisons, `&&`/`||`/`??` and the ternary operator.
//!
//! Every name resolves against an explicit lookup table (a JSON object); the
//! evaluator has no access to the process, filesystem or network.

mod eval;
mod functions;
mod lexer;
mod parser;

use serde_json::{Map, Value};
use thiserror::Error;

pub use parser::Expr;

/// Errors produced while parsing or evaluating an expression.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ExpressionError {
    #[error("syntax error at offset {position}: {message}")]
    Syntax { position: usize, message: String },

    #[error("{0} is not defined")]
    Reference(String),

    #[error("type error: {0}")]
    Type(String),
}

/// Parse `source` into an expression tree.
pub fn parse(source: &str) -> Result<Expr, ExpressionError> {
    parser::Parser::new(lexer::tokenize(source)?).parse()
}

/// Parse and evaluate `source` against `scope`.
pub fn evaluate(source: &str, scope: &Map<String, Value>) -> Result<Value, ExpressionError> {
    eval::eval(&parse(source)?, scope)
}

/// Evaluate an already-parsed tree.
pub fn evaluate_expr(expr: &Expr, scope: &Map<String, Value>) -> Result<Value, ExpressionError> {
    eval::eval(expr, scope)
}

/// JSON number from an `f64`, integral values stored as integers so they
/// print without a trailing `.0`. Non-finite results become `null`.
pub fn number(n: f64) -> Value {
    if !n.is_finite() {
        return Value::Null;
    }
    if n.fract() == 0.0 && n.abs() < 9_007_199_254_740_992.0 {
        return Value::from(n as i64);
    }
    serde_json::Number::from_f64(n).map(Value::Number).unwrap_or(Value::Null)
}

/// JS-style truthiness.
pub fn truthy(v: &Value) -> bool {
    match v {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0 && !f.is_nan()),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// Plain string form: strings verbatim, null empty, objects and arrays as
/// canonical JSON, everything else via its JSON text.
pub fn to_display_string(v: &Value) -> String {
    match v {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
