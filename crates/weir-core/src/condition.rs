//! Edge-condition evaluation.
//!
//! The router only understands a narrow boolean grammar over the emitted
//! output data:
//!
//! 1. `output.<name> <op> <literal>` with ops `==  !=  >  <  >=  <=`
//! 2. `output.<name>` (truthy test)
//! 3. bare `true` / `false`
//!
//! Missing properties evaluate to false; syntactic garbage is a
//! recoverable error the router turns into a dead-letter entry.
//!
//! Control-flow nodes may need richer expressions; those go through the
//! [`ExpressionEvaluator`] trait so a host can plug in a real language.
//! The bundled [`BasicEvaluator`] covers the same grammar plus
//! `variables.<name>` references, JSON literals, and JSON-array
//! collections.

use std::collections::HashMap;

use serde_json::Value;

use crate::context::WorkflowVariables;
use crate::{Result, WeirError};

/// Lookup scope for expression evaluation.
pub struct EvalScope<'a> {
    pub output: &'a HashMap<String, Value>,
    pub variables: &'a WorkflowVariables,
}

impl<'a> EvalScope<'a> {
    pub fn new(output: &'a HashMap<String, Value>, variables: &'a WorkflowVariables) -> Self {
        Self { output, variables }
    }

    fn resolve(&self, reference: &str) -> Option<Value> {
        if let Some(name) = reference.strip_prefix("output.") {
            return self.output.get(name).cloned();
        }
        if let Some(name) = reference.strip_prefix("variables.") {
            return self.variables.get(name);
        }
        None
    }
}

/// Pluggable expression seam for control-flow nodes.
///
/// `IfElse`/`While` use `evaluate_bool`, `Switch` uses `evaluate_value`,
/// `ForEach` uses `evaluate_items`.
pub trait ExpressionEvaluator: Send + Sync {
    fn evaluate_bool(&self, expr: &str, scope: &EvalScope<'_>) -> Result<bool>;
    fn evaluate_value(&self, expr: &str, scope: &EvalScope<'_>) -> Result<Value>;
    fn evaluate_items(&self, expr: &str, scope: &EvalScope<'_>) -> Result<Vec<Value>>;
}

// ---------------------------------------------------------------------------
// Router mini-grammar
// ---------------------------------------------------------------------------

/// Comparison operators, longest first so `>=` wins over `>`.
const OPERATORS: [&str; 6] = ["==", "!=", ">=", "<=", ">", "<"];

/// Evaluate an edge condition against emitted output.
pub fn evaluate_condition(expr: &str, scope: &EvalScope<'_>) -> Result<bool> {
    let expr = expr.trim();
    if expr.is_empty() {
        return Err(WeirError::Condition("empty condition".into()));
    }

    if expr.eq_ignore_ascii_case("true") {
        return Ok(true);
    }
    if expr.eq_ignore_ascii_case("false") {
        return Ok(false);
    }

    if let Some((lhs, op, rhs)) = split_comparison(expr) {
        let reference = lhs.trim();
        if !reference.starts_with("output.") && !reference.starts_with("variables.") {
            return Err(WeirError::Condition(format!(
                "left side must be a property reference: '{reference}'"
            )));
        }
        let Some(value) = scope.resolve(reference) else {
            // Missing property: false, not an error.
            return Ok(false);
        };
        if value.is_null() {
            return Ok(false);
        }
        return Ok(compare(&value, op, unquote(rhs.trim())));
    }

    // No operator: truthy property reference.
    if expr.starts_with("output.") || expr.starts_with("variables.") {
        return Ok(scope.resolve(expr).map(|v| truthy(&v)).unwrap_or(false));
    }

    Err(WeirError::Condition(format!(
        "unrecognised condition '{expr}'"
    )))
}

/// Split at the first operator occurrence, longest match first.
fn split_comparison(expr: &str) -> Option<(&str, &str, &str)> {
    for (i, _) in expr.char_indices() {
        for op in OPERATORS {
            if expr[i..].starts_with(op) {
                let lhs = &expr[..i];
                let rhs = &expr[i + op.len()..];
                return Some((lhs, op, rhs));
            }
        }
    }
    None
}

fn unquote(literal: &str) -> &str {
    let trimmed = literal.trim();
    if trimmed.len() >= 2 {
        let first = trimmed.chars().next().unwrap();
        let last = trimmed.chars().last().unwrap();
        if (first == '"' && last == '"') || (first == '\'' && last == '\'') {
            return &trimmed[1..trimmed.len() - 1];
        }
    }
    trimmed
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn compare(value: &Value, op: &str, literal: &str) -> bool {
    let left = value_text(value);
    let left_num = left.parse::<f64>().ok();
    let right_num = literal.parse::<f64>().ok();

    match op {
        "==" | "!=" => {
            let equal = match (left_num, right_num) {
                (Some(l), Some(r)) => l == r,
                _ => left.eq_ignore_ascii_case(literal),
            };
            if op == "==" {
                equal
            } else {
                !equal
            }
        }
        _ => {
            let ordering = match (left_num, right_num) {
                (Some(l), Some(r)) => l.partial_cmp(&r),
                _ => Some(
                    left.to_ascii_lowercase()
                        .cmp(&literal.to_ascii_lowercase()),
                ),
            };
            let Some(ordering) = ordering else {
                return false;
            };
            match op {
                ">" => ordering.is_gt(),
                "<" => ordering.is_lt(),
                ">=" => ordering.is_ge(),
                "<=" => ordering.is_le(),
                _ => false,
            }
        }
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Null => false,
        Value::String(s) => {
            if s.eq_ignore_ascii_case("true") {
                true
            } else if s.eq_ignore_ascii_case("false") {
                false
            } else {
                true
            }
        }
        _ => true,
    }
}

// ---------------------------------------------------------------------------
// Basic rich evaluator
// ---------------------------------------------------------------------------

/// Default [`ExpressionEvaluator`]: the router grammar plus JSON literals
/// and property references for values and collections.
#[derive(Debug, Default, Clone, Copy)]
pub struct BasicEvaluator;

impl ExpressionEvaluator for BasicEvaluator {
    fn evaluate_bool(&self, expr: &str, scope: &EvalScope<'_>) -> Result<bool> {
        evaluate_condition(expr, scope)
    }

    fn evaluate_value(&self, expr: &str, scope: &EvalScope<'_>) -> Result<Value> {
        let expr = expr.trim();
        if expr.is_empty() {
            return Err(WeirError::Condition("empty expression".into()));
        }
        if expr.starts_with("output.") || expr.starts_with("variables.") {
            return Ok(scope.resolve(expr).unwrap_or(Value::Null));
        }
        if let Ok(value) = serde_json::from_str::<Value>(expr) {
            return Ok(value);
        }
        // Bare word: treat as a string literal.
        Ok(Value::String(expr.to_string()))
    }

    fn evaluate_items(&self, expr: &str, scope: &EvalScope<'_>) -> Result<Vec<Value>> {
        match self.evaluate_value(expr, scope)? {
            Value::Array(items) => Ok(items),
            Value::Null => Ok(Vec::new()),
            Value::String(s) => match serde_json::from_str::<Value>(&s) {
                Ok(Value::Array(items)) => Ok(items),
                _ => Err(WeirError::Condition(format!(
                    "collection expression '{expr}' did not yield an array"
                ))),
            },
            _ => Err(WeirError::Condition(format!(
                "collection expression '{expr}' did not yield an array"
            ))),
        }
    }
}
