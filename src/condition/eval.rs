//! Evaluator: walks the AST against a [`RunState`], producing a [`Value`].
//!
//! Comparison and arithmetic are permissive: operands are coerced to the
//! type the operator needs (numbers for arithmetic/relational, strings for
//! equality fallback) rather than erroring, since a single ill-typed
//! sub-expression must not turn "condition fails" into a workflow error —
//! it should simply make the edge gate off.

use super::ast::{BinaryOp, Expr, UnaryOp};
use crate::state::{truthy, RunState, Value};

pub fn eval(expr: &Expr, state: &RunState) -> Value {
    match expr {
        Expr::Bool(b) => Value::Bool(*b),
        Expr::Null => Value::Null,
        Expr::Number(n) => serde_json::Number::from_f64(*n)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        Expr::Str(s) => Value::String(s.clone()),
        Expr::Var(name) => {
            // `__`-prefixed keys are internal and hidden from the
            // expression environment, whether referenced directly or via
            // the dotted form's root key.
            let root = name.split_once('.').map(|(root, _)| root).unwrap_or(name);
            if root.starts_with("__") {
                return Value::Null;
            }
            // Dotted form (`key.sub`) is matched but treated as a single
            // lookup key, per the template resolver's convention — the
            // condition evaluator mirrors that so `a.b == "x"` looks up the
            // literal key `"a.b"` if present, falling back to `a` if not.
            state
                .get(name)
                .cloned()
                .or_else(|| state.get(root).cloned())
                .unwrap_or(Value::Null)
        }
        Expr::Unary(op, inner) => {
            let v = eval(inner, state);
            match op {
                UnaryOp::Not => Value::Bool(!truthy(&v)),
                UnaryOp::Neg => Value::from(-as_number(&v)),
            }
        }
        Expr::Binary(lhs, op, rhs) => eval_binary(lhs, *op, rhs, state),
    }
}

fn eval_binary(lhs: &Expr, op: BinaryOp, rhs: &Expr, state: &RunState) -> Value {
    match op {
        BinaryOp::And => {
            let l = eval(lhs, state);
            if !truthy(&l) {
                return Value::Bool(false);
            }
            Value::Bool(truthy(&eval(rhs, state)))
        }
        BinaryOp::Or => {
            let l = eval(lhs, state);
            if truthy(&l) {
                return Value::Bool(true);
            }
            Value::Bool(truthy(&eval(rhs, state)))
        }
        BinaryOp::Eq => Value::Bool(values_equal(&eval(lhs, state), &eval(rhs, state))),
        BinaryOp::Ne => Value::Bool(!values_equal(&eval(lhs, state), &eval(rhs, state))),
        BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
            let l = eval(lhs, state);
            let r = eval(rhs, state);
            let ord = compare(&l, &r);
            Value::Bool(match op {
                BinaryOp::Lt => ord == std::cmp::Ordering::Less,
                BinaryOp::Le => ord != std::cmp::Ordering::Greater,
                BinaryOp::Gt => ord == std::cmp::Ordering::Greater,
                BinaryOp::Ge => ord != std::cmp::Ordering::Less,
                _ => unreachable!(),
            })
        }
        BinaryOp::Add => {
            let l = eval(lhs, state);
            let r = eval(rhs, state);
            if let (Value::String(a), Value::String(b)) = (&l, &r) {
                Value::String(format!("{a}{b}"))
            } else {
                Value::from(as_number(&l) + as_number(&r))
            }
        }
        BinaryOp::Sub => Value::from(as_number(&eval(lhs, state)) - as_number(&eval(rhs, state))),
        BinaryOp::Mul => Value::from(as_number(&eval(lhs, state)) * as_number(&eval(rhs, state))),
        BinaryOp::Div => {
            let denom = as_number(&eval(rhs, state));
            if denom == 0.0 {
                Value::Null
            } else {
                Value::from(as_number(&eval(lhs, state)) / denom)
            }
        }
    }
}

fn as_number(v: &Value) -> f64 {
    match v {
        Value::Number(n) => n.as_f64().unwrap_or(0.0),
        Value::Bool(b) => {
            if *b {
                1.0
            } else {
                0.0
            }
        }
        Value::String(s) => s.trim().parse().unwrap_or(0.0),
        _ => 0.0,
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    if a == b {
        return true;
    }
    // Cross-type comparison: fall back to string representation so
    // `status == "true"` compares sensibly against a boolean result.
    value_to_display(a) == value_to_display(b)
}

fn compare(a: &Value, b: &Value) -> std::cmp::Ordering {
    match (a, b) {
        (Value::String(x), Value::String(y)) => x.cmp(y),
        _ => as_number(a)
            .partial_cmp(&as_number(b))
            .unwrap_or(std::cmp::Ordering::Equal),
    }
}

fn value_to_display(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}
