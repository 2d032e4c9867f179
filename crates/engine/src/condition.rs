//! Condition evaluator — pure boolean expressions over the run context.
//!
//! An expression is parsed once (at registration or run start) into a small
//! typed AST and evaluated against a [`RunContext`]. Operands are either
//! `${...}` path references into prior step outputs / the trigger payload, or
//! JSON literals:
//!
//! ```text
//! ${fetch.count} > 10
//! ${trigger.region} == "eu-west"
//! ${validate.ok}
//! ```
//!
//! Path roots are checked against the workflow's step ids at run start so an
//! unresolvable reference fails before any step executes.

use std::collections::HashSet;

use serde_json::Value;

use crate::{models::RunContext, EngineError};

// ---------------------------------------------------------------------------
// AST
// ---------------------------------------------------------------------------

/// Comparison operator inside a condition expression.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Gt,
    Lt,
    Ge,
    Le,
}

impl CmpOp {
    fn parse(token: &str) -> Option<Self> {
        match token {
            "==" => Some(Self::Eq),
            "!=" => Some(Self::Ne),
            ">" => Some(Self::Gt),
            "<" => Some(Self::Lt),
            ">=" => Some(Self::Ge),
            "<=" => Some(Self::Le),
            _ => None,
        }
    }
}

/// One side of a comparison.
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    /// `${root.seg.seg}` — resolved against the run context.
    Path { raw: String, segments: Vec<String> },
    /// A JSON literal (number, string, bool, null).
    Literal(Value),
}

/// A parsed condition: either a comparison or a bare operand tested for
/// truthiness.
#[derive(Debug, Clone, PartialEq)]
pub struct Expr {
    pub lhs: Operand,
    pub cmp: Option<(CmpOp, Operand)>,
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Split an expression into tokens, keeping double-quoted strings intact.
fn tokenize(input: &str) -> Result<Vec<String>, EngineError> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;

    for ch in input.chars() {
        match ch {
            '"' => {
                in_quotes = !in_quotes;
                current.push(ch);
            }
            c if c.is_whitespace() && !in_quotes => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }
    if in_quotes {
        return Err(EngineError::Validation(format!(
            "unterminated string in expression '{input}'"
        )));
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    Ok(tokens)
}

fn parse_operand(token: &str) -> Result<Operand, EngineError> {
    if let Some(inner) = token.strip_prefix("${").and_then(|t| t.strip_suffix('}')) {
        if inner.is_empty() {
            return Err(EngineError::Validation(format!("empty path in '{token}'")));
        }
        let segments: Vec<String> = inner.split('.').map(str::to_string).collect();
        if segments.iter().any(|s| s.is_empty()) {
            return Err(EngineError::Validation(format!(
                "malformed path '{token}': empty segment"
            )));
        }
        return Ok(Operand::Path { raw: token.to_string(), segments });
    }

    // JSON literal (number, "string", true/false, null); bare words fall back
    // to plain strings so `== pending` reads naturally.
    match serde_json::from_str::<Value>(token) {
        Ok(v) => Ok(Operand::Literal(v)),
        Err(_) => Ok(Operand::Literal(Value::String(token.to_string()))),
    }
}

/// Parse an expression into its AST.
pub fn parse(input: &str) -> Result<Expr, EngineError> {
    let tokens = tokenize(input)?;
    match tokens.as_slice() {
        [single] => Ok(Expr { lhs: parse_operand(single)?, cmp: None }),
        [lhs, op, rhs] => {
            let op = CmpOp::parse(op).ok_or_else(|| {
                EngineError::Validation(format!("unknown operator '{op}' in '{input}'"))
            })?;
            Ok(Expr {
                lhs: parse_operand(lhs)?,
                cmp: Some((op, parse_operand(rhs)?)),
            })
        }
        _ => Err(EngineError::Validation(format!(
            "expected '<operand>' or '<operand> <op> <operand>', got '{input}'"
        ))),
    }
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

impl Expr {
    /// Check that every path root names a prior step or `trigger`.
    pub fn validate_roots(&self, step_ids: &HashSet<&str>) -> Result<(), EngineError> {
        let mut check = |operand: &Operand| -> Result<(), EngineError> {
            if let Operand::Path { raw, segments } = operand {
                let root = segments[0].as_str();
                if root != "trigger" && !step_ids.contains(root) {
                    return Err(EngineError::Validation(format!(
                        "path '{raw}' references unknown step '{root}'"
                    )));
                }
            }
            Ok(())
        };
        check(&self.lhs)?;
        if let Some((_, rhs)) = &self.cmp {
            check(rhs)?;
        }
        Ok(())
    }

    /// Evaluate against the run context.
    pub fn evaluate(&self, ctx: &RunContext) -> Result<bool, EngineError> {
        let lhs = resolve_operand(&self.lhs, ctx)?;
        match &self.cmp {
            None => Ok(truthy(&lhs)),
            Some((op, rhs)) => {
                let rhs = resolve_operand(rhs, ctx)?;
                compare(*op, &lhs, &rhs)
            }
        }
    }
}

fn resolve_operand(operand: &Operand, ctx: &RunContext) -> Result<Value, EngineError> {
    match operand {
        Operand::Literal(v) => Ok(v.clone()),
        Operand::Path { raw, segments } => resolve_path(raw, segments, ctx),
    }
}

/// Resolve `${root.rest...}` — `trigger` roots into the trigger payload,
/// anything else into the named step's output.
pub fn resolve_path(raw: &str, segments: &[String], ctx: &RunContext) -> Result<Value, EngineError> {
    let root = segments[0].as_str();
    let mut current: &Value = if root == "trigger" {
        &ctx.trigger_payload
    } else {
        &ctx.results
            .get(root)
            .ok_or_else(|| {
                EngineError::Validation(format!("path '{raw}': no result for step '{root}'"))
            })?
            .output
    };

    for segment in &segments[1..] {
        current = match current {
            Value::Object(map) => map.get(segment).ok_or_else(|| {
                EngineError::Validation(format!("path '{raw}': missing field '{segment}'"))
            })?,
            Value::Array(items) => {
                let idx: usize = segment.parse().map_err(|_| {
                    EngineError::Validation(format!(
                        "path '{raw}': '{segment}' is not an array index"
                    ))
                })?;
                items.get(idx).ok_or_else(|| {
                    EngineError::Validation(format!("path '{raw}': index {idx} out of bounds"))
                })?
            }
            other => {
                return Err(EngineError::Validation(format!(
                    "path '{raw}': cannot index into {other} with '{segment}'"
                )))
            }
        };
    }

    Ok(current.clone())
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn compare(op: CmpOp, lhs: &Value, rhs: &Value) -> Result<bool, EngineError> {
    // Equality works across any pair of values.
    match op {
        CmpOp::Eq => return Ok(lhs == rhs),
        CmpOp::Ne => return Ok(lhs != rhs),
        _ => {}
    }

    // Ordering needs two numbers or two strings.
    match (lhs, rhs) {
        (Value::Number(a), Value::Number(b)) => {
            let (a, b) = (a.as_f64().unwrap_or(f64::NAN), b.as_f64().unwrap_or(f64::NAN));
            Ok(match op {
                CmpOp::Gt => a > b,
                CmpOp::Lt => a < b,
                CmpOp::Ge => a >= b,
                CmpOp::Le => a <= b,
                _ => unreachable!(),
            })
        }
        (Value::String(a), Value::String(b)) => Ok(match op {
            CmpOp::Gt => a > b,
            CmpOp::Lt => a < b,
            CmpOp::Ge => a >= b,
            CmpOp::Le => a <= b,
            _ => unreachable!(),
        }),
        (a, b) => Err(EngineError::Validation(format!(
            "cannot order {a} against {b}"
        ))),
    }
}

// ---------------------------------------------------------------------------
// Parameter interpolation
// ---------------------------------------------------------------------------

/// Substitute `${...}` references inside a JSON parameter tree.
///
/// A string value that is exactly one `${...}` reference is replaced by the
/// resolved value (preserving its type); references embedded in longer
/// strings are stringified in place.
pub fn interpolate(value: &Value, ctx: &RunContext) -> Result<Value, EngineError> {
    match value {
        Value::String(s) => interpolate_string(s, ctx),
        Value::Array(items) => Ok(Value::Array(
            items.iter().map(|v| interpolate(v, ctx)).collect::<Result<_, _>>()?,
        )),
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (k, v) in map {
                out.insert(k.clone(), interpolate(v, ctx)?);
            }
            Ok(Value::Object(out))
        }
        other => Ok(other.clone()),
    }
}

/// Check every `${...}` reference in a JSON parameter tree against the known
/// path roots, without resolving anything. Used at run start so a step with
/// an unresolvable reference never executes.
pub fn validate_refs(value: &Value, step_ids: &HashSet<&str>) -> Result<(), EngineError> {
    match value {
        Value::String(s) => validate_str_refs(s, step_ids),
        Value::Array(items) => items.iter().try_for_each(|v| validate_refs(v, step_ids)),
        Value::Object(map) => map.values().try_for_each(|v| validate_refs(v, step_ids)),
        _ => Ok(()),
    }
}

/// Check the `${...}` references embedded in one string.
pub fn validate_str_refs(s: &str, step_ids: &HashSet<&str>) -> Result<(), EngineError> {
    let mut rest = s;
    while let Some(start) = rest.find("${") {
        let after = &rest[start + 2..];
        let end = after.find('}').ok_or_else(|| {
            EngineError::Validation(format!("unterminated reference in '{s}'"))
        })?;
        let inner = &after[..end];
        let root = inner.split('.').next().unwrap_or_default();
        if root.is_empty() {
            return Err(EngineError::Validation(format!("empty path in '{s}'")));
        }
        if root != "trigger" && !step_ids.contains(root) {
            return Err(EngineError::Validation(format!(
                "reference '${{{inner}}}' names unknown step '{root}'"
            )));
        }
        rest = &after[end + 1..];
    }
    Ok(())
}

fn interpolate_string(s: &str, ctx: &RunContext) -> Result<Value, EngineError> {
    if !s.contains("${") {
        return Ok(Value::String(s.to_string()));
    }

    // Whole-string reference keeps the resolved value's type.
    if let Some(inner) = s.strip_prefix("${").and_then(|t| t.strip_suffix('}')) {
        if !inner.contains("${") {
            let segments: Vec<String> = inner.split('.').map(str::to_string).collect();
            return resolve_path(s, &segments, ctx);
        }
    }

    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after.find('}').ok_or_else(|| {
            EngineError::Validation(format!("unterminated reference in '{s}'"))
        })?;
        let raw = &rest[start..start + 2 + end + 1];
        let segments: Vec<String> = after[..end].split('.').map(str::to_string).collect();
        let resolved = resolve_path(raw, &segments, ctx)?;
        match resolved {
            Value::String(v) => out.push_str(&v),
            other => out.push_str(&other.to_string()),
        }
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    Ok(Value::String(out))
}
