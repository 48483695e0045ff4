//! JEXL expression evaluation for free-form step conditions.
//!
//! Wraps `jexl_eval::Evaluator` with a few string/collection transforms.
//! Run state is always passed as the context object and never interpolated
//! into expression text.
//!
//! The evaluator is not `Send`; build one where it is used and drop it
//! before any `.await`.

use serde_json::{json, Value};

use super::context::ExecutionContext;

#[derive(Debug, thiserror::Error)]
pub enum ExpressionError {
    #[error("expression evaluation failed: {0}")]
    EvalFailed(String),

    #[error("invalid context: {0}")]
    InvalidContext(String),
}

fn first_str(args: &[Value]) -> &str {
    args.first().and_then(|v| v.as_str()).unwrap_or("")
}

/// JEXL evaluator with the standard transforms registered.
///
/// Expressions see `steps.<id>.status`, `steps.<id>.output`, `trigger`,
/// `variables` and `workflow.id`.
pub struct ConditionEvaluator {
    evaluator: jexl_eval::Evaluator<'static>,
}

impl ConditionEvaluator {
    pub fn new() -> Self {
        let evaluator = jexl_eval::Evaluator::new()
            .with_transform("lower", |args: &[Value]| Ok(json!(first_str(args).to_lowercase())))
            .with_transform("upper", |args: &[Value]| Ok(json!(first_str(args).to_uppercase())))
            .with_transform("trim", |args: &[Value]| Ok(json!(first_str(args).trim())))
            .with_transform("contains", |args: &[Value]| {
                let needle = args.get(1).and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(first_str(args).contains(needle)))
            })
            .with_transform("words", |args: &[Value]| {
                Ok(json!(first_str(args).split_whitespace().count() as f64))
            })
            .with_transform("length", |args: &[Value]| {
                let len = match args.first() {
                    Some(Value::String(s)) => s.chars().count(),
                    Some(Value::Array(a)) => a.len(),
                    Some(Value::Object(o)) => o.len(),
                    _ => 0,
                };
                Ok(json!(len as f64))
            });

        Self { evaluator }
    }

    /// Evaluate an expression to a boolean using JavaScript-like truthiness.
    pub fn evaluate_bool(&self, expression: &str, context: &Value) -> Result<bool, ExpressionError> {
        let result = self.evaluate_value(expression, context)?;
        Ok(truthy(&result))
    }

    pub fn evaluate_value(&self, expression: &str, context: &Value) -> Result<Value, ExpressionError> {
        if !context.is_object() {
            return Err(ExpressionError::InvalidContext(
                "context must be a JSON object".to_string(),
            ));
        }
        self.evaluator
            .eval_in_context(expression, context)
            .map_err(|e| ExpressionError::EvalFailed(e.to_string()))
    }

    /// Evaluate against the run state of `ctx`.
    pub fn evaluate_in_context(
        &self,
        expression: &str,
        ctx: &ExecutionContext,
    ) -> Result<bool, ExpressionError> {
        self.evaluate_bool(expression, &ctx.to_expression_context())
    }
}

impl Default for ConditionEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Null => false,
        Value::Number(n) => n.as_f64().unwrap_or(0.0) != 0.0,
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}
