//! Routing and guard conditions.
//!
//! A condition is either `<path> <op> <literal>` or a bare `<path>`
//! (optionally negated with `!`), evaluated against a JSON value:
//!
//! ```text
//! doc_type == "invoice"
//! confidence >= 0.8
//! classify.needs_review
//! !flags.skip_signing
//! ```
//!
//! Paths are dotted keys; a missing key resolves to `null`. Literals are
//! JSON (`"text"`, `3`, `true`, `null`); anything that is not valid JSON is
//! taken as a bare string.

use crate::errors::{ErrorInfo, PipelineValidationError};
use regex::Regex;
use serde_json::Value;
use std::cmp::Ordering;
use std::fmt;
use std::sync::OnceLock;

/// Comparison operator of a condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    /// `==`
    Eq,
    /// `!=`
    Ne,
    /// `>`
    Gt,
    /// `>=`
    Ge,
    /// `<`
    Lt,
    /// `<=`
    Le,
}

impl CompareOp {
    fn parse(op: &str) -> Option<Self> {
        match op {
            "==" => Some(Self::Eq),
            "!=" => Some(Self::Ne),
            ">" => Some(Self::Gt),
            ">=" => Some(Self::Ge),
            "<" => Some(Self::Lt),
            "<=" => Some(Self::Le),
            _ => None,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::Eq => "==",
            Self::Ne => "!=",
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::Lt => "<",
            Self::Le => "<=",
        }
    }
}

/// A parsed condition.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    /// `<path> <op> <literal>`
    Compare {
        /// Dotted path into the evaluated value.
        path: String,
        /// Operator.
        op: CompareOp,
        /// Right-hand literal.
        literal: Value,
    },
    /// `<path>` or `!<path>`
    Truthy {
        /// Dotted path into the evaluated value.
        path: String,
        /// Whether the test is negated.
        negated: bool,
    },
}

static NULL: Value = Value::Null;

fn compare_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| {
            Regex::new(r"^\s*([A-Za-z_][\w\-]*(?:\.[\w\-]+)*)\s*(==|!=|>=|<=|>|<)\s*(.+?)\s*$").ok()
        })
        .as_ref()
}

fn truthy_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"^\s*(!?)\s*([A-Za-z_][\w\-]*(?:\.[\w\-]+)*)\s*$").ok())
        .as_ref()
}

impl Condition {
    /// Parses a condition expression.
    ///
    /// # Errors
    ///
    /// Returns a [`PipelineValidationError`] with code `PIPELINE-CONDITION`
    /// if the expression matches neither form.
    pub fn parse(expr: &str) -> Result<Self, PipelineValidationError> {
        if let Some(caps) = compare_pattern().and_then(|re| re.captures(expr)) {
            let op = CompareOp::parse(&caps[2]).ok_or_else(|| invalid(expr))?;
            let raw = &caps[3];
            let literal = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
            return Ok(Self::Compare {
                path: caps[1].to_string(),
                op,
                literal,
            });
        }
        if let Some(caps) = truthy_pattern().and_then(|re| re.captures(expr)) {
            return Ok(Self::Truthy {
                path: caps[2].to_string(),
                negated: &caps[1] == "!",
            });
        }
        Err(invalid(expr))
    }

    /// Evaluates the condition against `value`.
    #[must_use]
    pub fn evaluate(&self, value: &Value) -> bool {
        match self {
            Self::Compare { path, op, literal } => {
                let left = lookup(value, path);
                compare(left, *op, literal)
            }
            Self::Truthy { path, negated } => is_truthy(lookup(value, path)) != *negated,
        }
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Compare { path, op, literal } => write!(f, "{path} {} {literal}", op.as_str()),
            Self::Truthy { path, negated: true } => write!(f, "!{path}"),
            Self::Truthy { path, negated: false } => write!(f, "{path}"),
        }
    }
}

/// Parses and evaluates `expr` in one go.
///
/// # Errors
///
/// Returns the parse error for malformed expressions.
pub fn evaluate(expr: &str, value: &Value) -> Result<bool, PipelineValidationError> {
    Ok(Condition::parse(expr)?.evaluate(value))
}

fn invalid(expr: &str) -> PipelineValidationError {
    PipelineValidationError::new(format!("Invalid condition expression: '{expr}'")).with_error_info(
        ErrorInfo::new("PIPELINE-CONDITION", "Condition could not be parsed")
            .with_fix_hint("Use '<path> <op> <literal>' or a bare '<path>'")
            .with_context_entry("expression", expr),
    )
}

fn lookup<'a>(value: &'a Value, path: &str) -> &'a Value {
    path.split('.')
        .try_fold(value, |current, key| current.get(key))
        .unwrap_or(&NULL)
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn ordering(left: &Value, right: &Value) -> Option<Ordering> {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

fn compare(left: &Value, op: CompareOp, right: &Value) -> bool {
    let equal = match (left, right) {
        (Value::Number(a), Value::Number(b)) => a.as_f64() == b.as_f64(),
        _ => left == right,
    };
    match op {
        CompareOp::Eq => equal,
        CompareOp::Ne => !equal,
        CompareOp::Gt => ordering(left, right) == Some(Ordering::Greater),
        CompareOp::Ge => matches!(ordering(left, right), Some(Ordering::Greater | Ordering::Equal)),
        CompareOp::Lt => ordering(left, right) == Some(Ordering::Less),
        CompareOp::Le => matches!(ordering(left, right), Some(Ordering::Less | Ordering::Equal)),
    }
}
