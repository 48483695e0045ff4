//! Step conditions and loop predicates.
//!
//! A `Condition` is a small tree evaluated against the run context when a
//! step becomes ready. Leaves check a step's status, compare a context path
//! with a literal using the `$eq`/`$ne`/`$gt`/`$gte`/`$lt`/`$lte` operators,
//! run a JEXL expression, or call a closure.

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use serde_json::{json, Value};
use trellis_types::workflow::StepStatus;

use super::context::ExecutionContext;
use super::expression::ConditionEvaluator;
use super::resolver::lookup_path;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConditionError {
    #[error("cannot apply {op} to '{path}': {reason}")]
    Operand {
        path: String,
        op: CompareOp,
        reason: String,
    },

    #[error("expression '{expression}' failed: {reason}")]
    Expression { expression: String, reason: String },

    #[error("custom condition failed: {0}")]
    Custom(String),

    #[error("invalid query: {0}")]
    InvalidQuery(String),
}

// ---------------------------------------------------------------------------
// CompareOp
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
}

impl CompareOp {
    /// Parse `$eq`, `$ne`, `$gt`, `$gte`, `$lt` or `$lte`.
    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "$eq" => CompareOp::Eq,
            "$ne" => CompareOp::Ne,
            "$gt" => CompareOp::Gt,
            "$gte" => CompareOp::Gte,
            "$lt" => CompareOp::Lt,
            "$lte" => CompareOp::Lte,
            _ => return None,
        })
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CompareOp::Eq => "$eq",
            CompareOp::Ne => "$ne",
            CompareOp::Gt => "$gt",
            CompareOp::Gte => "$gte",
            CompareOp::Lt => "$lt",
            CompareOp::Lte => "$lte",
        }
    }

    /// Apply the operator. Equality works on any JSON (absent equals null);
    /// ordering needs two numbers or two strings.
    fn apply(self, path: &str, actual: Option<&Value>, expected: &Value) -> Result<bool, ConditionError> {
        let operand_error = |reason: String| ConditionError::Operand {
            path: path.to_string(),
            op: self,
            reason,
        };

        match self {
            CompareOp::Eq => return Ok(actual.unwrap_or(&Value::Null) == expected),
            CompareOp::Ne => return Ok(actual.unwrap_or(&Value::Null) != expected),
            _ => {}
        }

        let actual = actual.ok_or_else(|| operand_error("value is absent".to_string()))?;
        let ordering = match (actual, expected) {
            (Value::Number(a), Value::Number(b)) => {
                let (a, b) = (a.as_f64().unwrap_or(f64::NAN), b.as_f64().unwrap_or(f64::NAN));
                a.partial_cmp(&b)
                    .ok_or_else(|| operand_error("numbers are not comparable".to_string()))?
            }
            (Value::String(a), Value::String(b)) => a.cmp(b),
            (a, b) => {
                return Err(operand_error(format!(
                    "cannot order {} against {}",
                    kind_of(a),
                    kind_of(b)
                )));
            }
        };

        Ok(match self {
            CompareOp::Gt => ordering == Ordering::Greater,
            CompareOp::Gte => ordering != Ordering::Less,
            CompareOp::Lt => ordering == Ordering::Less,
            CompareOp::Lte => ordering != Ordering::Greater,
            CompareOp::Eq | CompareOp::Ne => unreachable!("handled above"),
        })
    }
}

impl fmt::Display for CompareOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// ---------------------------------------------------------------------------
// Condition
// ---------------------------------------------------------------------------

pub type CustomPredicate = Arc<dyn Fn(&ExecutionContext) -> Result<bool, String> + Send + Sync>;

#[derive(Clone)]
pub enum Condition {
    /// True when `step` currently has status `is`.
    Status { step: String, is: StepStatus },
    /// Compare the value at a context path with a literal.
    Compare {
        path: String,
        op: CompareOp,
        value: Value,
    },
    /// JEXL expression; the result is coerced to a boolean.
    Expression(String),
    All(Vec<Condition>),
    Any(Vec<Condition>),
    Not(Box<Condition>),
    Custom(CustomPredicate),
}

impl Condition {
    pub fn status(step: impl Into<String>, is: StepStatus) -> Self {
        Condition::Status {
            step: step.into(),
            is,
        }
    }

    pub fn compare(path: impl Into<String>, op: CompareOp, value: Value) -> Self {
        Condition::Compare {
            path: path.into(),
            op,
            value,
        }
    }

    /// Compare a field of a step's output: `output("count", "n", Gte, 3)`
    /// checks `steps.count.output.n >= 3`.
    pub fn output(step: &str, path: &str, op: CompareOp, value: Value) -> Self {
        let path = if path.is_empty() || path == "." {
            format!("steps.{step}.output")
        } else {
            format!("steps.{step}.output.{path}")
        };
        Self::compare(path, op, value)
    }

    /// Build a comparison from a query object such as `{"$gte": 3}`.
    /// Several operators are combined with `All`.
    pub fn query(path: impl Into<String>, query: Value) -> Result<Self, ConditionError> {
        let path = path.into();
        let Value::Object(ops) = query else {
            return Err(ConditionError::InvalidQuery(format!(
                "expected an operator object for '{path}'"
            )));
        };
        let mut parts = Vec::with_capacity(ops.len());
        for (key, value) in ops {
            let op = CompareOp::parse(&key)
                .ok_or_else(|| ConditionError::InvalidQuery(format!("unknown operator '{key}'")))?;
            parts.push(Self::compare(path.clone(), op, value));
        }
        match parts.len() {
            0 => Err(ConditionError::InvalidQuery(format!("no operators for '{path}'"))),
            1 => Ok(parts.remove(0)),
            _ => Ok(Condition::All(parts)),
        }
    }

    pub fn expression(expr: impl Into<String>) -> Self {
        Condition::Expression(expr.into())
    }

    pub fn custom<F>(f: F) -> Self
    where
        F: Fn(&ExecutionContext) -> Result<bool, String> + Send + Sync + 'static,
    {
        Condition::Custom(Arc::new(f))
    }

    pub fn negate(self) -> Self {
        match self {
            Condition::Not(inner) => *inner,
            other => Condition::Not(Box::new(other)),
        }
    }

    pub fn and(self, other: Condition) -> Self {
        match self {
            Condition::All(mut parts) => {
                parts.push(other);
                Condition::All(parts)
            }
            first => Condition::All(vec![first, other]),
        }
    }

    pub fn evaluate(&self, ctx: &ExecutionContext) -> Result<bool, ConditionError> {
        match self {
            Condition::Status { step, is } => Ok(ctx.status_of(step) == *is),
            Condition::Compare { path, op, value } => {
                let actual = resolve_path(ctx, path);
                op.apply(path, actual.as_ref(), value)
            }
            Condition::Expression(expr) => ConditionEvaluator::new()
                .evaluate_in_context(expr, ctx)
                .map_err(|e| ConditionError::Expression {
                    expression: expr.clone(),
                    reason: e.to_string(),
                }),
            Condition::All(parts) => {
                for part in parts {
                    if !part.evaluate(ctx)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            Condition::Any(parts) => {
                for part in parts {
                    if part.evaluate(ctx)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            Condition::Not(inner) => Ok(!inner.evaluate(ctx)?),
            Condition::Custom(f) => f(ctx).map_err(ConditionError::Custom),
        }
    }

    /// Ids of steps whose `failed` status this condition inspects.
    ///
    /// A failed step referenced this way is handled by a failure branch and
    /// does not fail the run.
    pub fn checks_failure_of(&self) -> Vec<String> {
        let mut ids = Vec::new();
        self.collect_failure_checks(&mut ids);
        ids.sort();
        ids.dedup();
        ids
    }

    /// Ids of every step whose state this condition reads. The graph
    /// treats them as dependencies so the condition is never evaluated
    /// before they settle.
    pub fn referenced_steps(&self) -> Vec<String> {
        let mut ids = Vec::new();
        self.collect_step_refs(&mut ids);
        ids.sort();
        ids.dedup();
        ids
    }

    fn collect_step_refs(&self, ids: &mut Vec<String>) {
        match self {
            Condition::Status { step, .. } => ids.push(step.clone()),
            Condition::Compare { path, .. } => {
                if let Some(step) = path_step(path) {
                    ids.push(step.to_string());
                }
            }
            Condition::Expression(expr) => {
                ids.extend(expression_step_refs(expr).into_iter().map(|(id, _)| id));
            }
            Condition::All(parts) | Condition::Any(parts) => {
                for part in parts {
                    part.collect_step_refs(ids);
                }
            }
            Condition::Not(inner) => inner.collect_step_refs(ids),
            Condition::Custom(_) => {}
        }
    }

    fn collect_failure_checks(&self, ids: &mut Vec<String>) {
        match self {
            Condition::Status {
                step,
                is: StepStatus::Failed,
            } => ids.push(step.clone()),
            Condition::Status { .. } | Condition::Custom(_) => {}
            Condition::Compare { path, value, .. } => {
                if value == &json!("failed") {
                    if let Some(step) = status_path_step(path) {
                        ids.push(step.to_string());
                    }
                }
            }
            Condition::Expression(expr) => {
                if expr.contains("'failed'") || expr.contains("\"failed\"") {
                    ids.extend(expression_status_refs(expr));
                }
            }
            Condition::All(parts) | Condition::Any(parts) => {
                for part in parts {
                    part.collect_failure_checks(ids);
                }
            }
            Condition::Not(inner) => inner.collect_failure_checks(ids),
        }
    }
}

impl fmt::Debug for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Condition::Status { step, is } => write!(f, "Status({step} is {is})"),
            Condition::Compare { path, op, value } => write!(f, "Compare({path} {op} {value})"),
            Condition::Expression(expr) => write!(f, "Expression({expr:?})"),
            Condition::All(parts) => f.debug_tuple("All").field(parts).finish(),
            Condition::Any(parts) => f.debug_tuple("Any").field(parts).finish(),
            Condition::Not(inner) => f.debug_tuple("Not").field(inner).finish(),
            Condition::Custom(_) => f.write_str("Custom(<fn>)"),
        }
    }
}

/// `steps.<id>...` -> `<id>`.
fn path_step(path: &str) -> Option<&str> {
    let rest = path.strip_prefix("steps.")?;
    let step = rest.split('.').next()?;
    (!step.is_empty()).then_some(step)
}

/// `steps.<id>.status` -> `<id>`.
fn status_path_step(path: &str) -> Option<&str> {
    let rest = path.strip_prefix("steps.")?;
    let (step, field) = rest.split_once('.')?;
    (field == "status").then_some(step)
}

/// `(id, rest)` for every `steps.<id>` inside an expression, where `rest` is
/// the text following the id.
fn expression_step_refs(expr: &str) -> Vec<(String, &str)> {
    let mut refs = Vec::new();
    let mut rest = expr;
    while let Some(pos) = rest.find("steps.") {
        rest = &rest[pos + "steps.".len()..];
        let end = rest
            .find(|c: char| !(c.is_alphanumeric() || c == '_' || c == '-'))
            .unwrap_or(rest.len());
        let (id, tail) = rest.split_at(end);
        if !id.is_empty() {
            refs.push((id.to_string(), tail));
        }
        rest = tail;
    }
    refs
}

/// Step ids referenced as `steps.<id>.status` inside an expression.
fn expression_status_refs(expr: &str) -> Vec<String> {
    expression_step_refs(expr)
        .into_iter()
        .filter(|(_, tail)| tail.starts_with(".status"))
        .map(|(id, _)| id)
        .collect()
}

/// Resolve a condition path against run state.
///
/// Roots: `trigger`, `variables`, `steps.<id>.status`, `steps.<id>.output`
/// and `steps.<id>.error`.
pub fn resolve_path(ctx: &ExecutionContext, path: &str) -> Option<Value> {
    let segments: Vec<&str> = path.split('.').filter(|s| !s.is_empty()).collect();
    match segments.as_slice() {
        ["trigger", rest @ ..] => lookup_path(&ctx.trigger_input, rest).cloned(),
        ["variables", name, rest @ ..] => {
            lookup_path(ctx.variables.get(*name)?, rest).cloned()
        }
        ["variables"] => Some(Value::Object(ctx.variables.clone())),
        ["steps", step, "status"] => Some(json!(ctx.status_of(step).as_str())),
        ["steps", step, "output", rest @ ..] => lookup_path(ctx.output_of(step)?, rest).cloned(),
        ["steps", step, "error"] => ctx
            .step(step)
            .and_then(|r| r.error.as_ref())
            .map(|e| json!(e.message)),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
