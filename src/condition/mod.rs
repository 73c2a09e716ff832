//! Condition evaluator: compiles and evaluates the boolean expression
//! language referenced by edge conditions and `branch` nodes.
//!
//! Supports comparison (`==`, `!=`, `<`, `<=`, `>`, `>=`), logical (`&&`,
//! `||`, `!`), arithmetic, and string operators over free variables bound to
//! run-state keys. `__`-prefixed keys are invisible to expressions. An empty
//! expression is equivalent to `true`.
//!
//! Policy: a compilation error is not a workflow error. It makes the
//! condition evaluate to `false` so the owning edge simply gates off,
//! matching the specification's "ungrammatical conditions must not halt a
//! run."

mod ast;
mod eval;
mod lexer;
mod parser;

use crate::state::{truthy, RunState};

/// A compiled condition. Carries the original source for diagnostics.
pub struct CompiledCondition {
    source: String,
    expr: Option<ast::Expr>,
}

/// Compiles an expression string. Never fails: a malformed expression
/// compiles into a condition that always evaluates to `false` (except the
/// empty string, which always evaluates to `true`).
pub fn compile(source: &str) -> CompiledCondition {
    let trimmed = source.trim();
    if trimmed.is_empty() {
        return CompiledCondition {
            source: source.to_string(),
            expr: Some(ast::Expr::Bool(true)),
        };
    }
    let expr = lexer::lex(trimmed)
        .ok()
        .and_then(|tokens| parser::parse(&tokens).ok());
    CompiledCondition {
        source: source.to_string(),
        expr,
    }
}

impl CompiledCondition {
    /// Evaluates the condition against run state, coercing the result to a
    /// boolean via the standard truthiness rule. A condition that failed to
    /// compile evaluates to `false`.
    pub fn evaluate(&self, state: &RunState) -> bool {
        match &self.expr {
            Some(expr) => truthy(&eval::eval(expr, state)),
            None => false,
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn compiled_ok(&self) -> bool {
        self.expr.is_some()
    }
}

/// Convenience one-shot helper: compile and evaluate in one call.
pub fn evaluate(source: &str, state: &RunState) -> bool {
    compile(source).evaluate(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn state_with(pairs: &[(&str, serde_json::Value)]) -> RunState {
        let mut s = RunState::new();
        for (k, v) in pairs {
            s.insert(*k, v.clone());
        }
        s
    }

    #[test]
    fn empty_expression_is_true() {
        let s = RunState::new();
        assert!(evaluate("", &s));
    }

    #[test]
    fn comparison_operators() {
        let s = state_with(&[("x", json!(5))]);
        assert!(evaluate("x == 5", &s));
        assert!(evaluate("x != 4", &s));
        assert!(evaluate("x > 3", &s));
        assert!(evaluate("x >= 5", &s));
        assert!(evaluate("x < 10", &s));
        assert!(evaluate("x <= 5", &s));
    }

    #[test]
    fn logical_operators() {
        let s = state_with(&[("a", json!(true)), ("b", json!(false))]);
        assert!(evaluate("a && !b", &s));
        assert!(evaluate("a || b", &s));
        assert!(!evaluate("!a", &s));
    }

    #[test]
    fn string_equality() {
        let s = state_with(&[("status", json!("approved"))]);
        assert!(evaluate("status == \"approved\"", &s));
        assert!(evaluate("status != 'rejected'", &s));
    }

    #[test]
    fn malformed_expression_is_false_not_error() {
        let s = RunState::new();
        assert!(!evaluate("x ===", &s));
        assert!(!evaluate("(((", &s));
    }

    #[test]
    fn internal_keys_hidden_resolve_to_null() {
        // A present, truthy internal value must still be invisible to the
        // expression environment: referencing it directly or through the
        // dotted form resolves to null, not the actual state value.
        let s = state_with(&[("__status__", json!("running"))]);
        assert!(!evaluate("__status__ == \"running\"", &s));
        assert!(!evaluate("__status__", &s));
        assert!(!evaluate("__status__.sub == \"running\"", &s));
    }

    #[test]
    fn truthiness_coercion_of_non_bool_result() {
        let s = state_with(&[("count", json!(0))]);
        assert!(!evaluate("count", &s));
        let s2 = state_with(&[("count", json!(3))]);
        assert!(evaluate("count", &s2));
    }
}
