//! Output projection: maps the final run context to the workflow's result.

use std::fmt;
use std::sync::Arc;

use serde_json::{Map, Value};
use trellis_types::variable::VariableRef;
use trellis_types::workflow::StepStatus;

use super::context::ExecutionContext;
use super::graph::StepGraph;
use super::resolver::resolve;

pub type Transform = Arc<dyn Fn(Option<&Value>) -> Value + Send + Sync>;

#[derive(Clone)]
struct OutputField {
    name: String,
    source: VariableRef,
    transform: Option<Transform>,
}

impl fmt::Debug for OutputField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutputField")
            .field("name", &self.name)
            .field("source", &self.source.to_string())
            .field("transform", &self.transform.is_some())
            .finish()
    }
}

/// Declared output fields in declaration order.
#[derive(Debug, Clone, Default)]
pub struct OutputProjection {
    fields: Vec<OutputField>,
}

impl OutputProjection {
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn field(&mut self, name: impl Into<String>, source: VariableRef) {
        self.push(name.into(), source, None);
    }

    /// A field computed by `transform` from the resolved value (or `None`).
    pub fn field_with<F>(&mut self, name: impl Into<String>, source: VariableRef, transform: F)
    where
        F: Fn(Option<&Value>) -> Value + Send + Sync + 'static,
    {
        self.push(name.into(), source, Some(Arc::new(transform)));
    }

    fn push(&mut self, name: String, source: VariableRef, transform: Option<Transform>) {
        self.fields.retain(|f| f.name != name);
        self.fields.push(OutputField {
            name,
            source,
            transform,
        });
    }

    /// Build the run output.
    ///
    /// Without declared fields the output holds the results of successful
    /// leaf steps (steps nothing depends on), keyed by step id. Declared
    /// fields whose source is absent and that carry no transform are left
    /// out.
    pub fn project(&self, graph: &StepGraph, ctx: &ExecutionContext) -> Value {
        let mut output = Map::new();

        if self.fields.is_empty() {
            for step in graph.steps() {
                if !graph.dependents(&step.id).is_empty()
                    || ctx.status_of(&step.id) != StepStatus::Success
                {
                    continue;
                }
                if let Some(value) = ctx.output_of(&step.id) {
                    output.insert(step.id.clone(), value.clone());
                }
            }
            return Value::Object(output);
        }

        for field in &self.fields {
            let resolved = resolve(&field.source, ctx);
            let value = match &field.transform {
                Some(transform) => transform(resolved.as_ref()),
                None => match resolved {
                    Some(value) => value,
                    None => continue,
                },
            };
            output.insert(field.name.clone(), value);
        }
        Value::Object(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::step::{Step, StepInput, StepOutcome};
    use serde_json::json;
    use trellis_types::workflow::StepResult;
    use uuid::Uuid;

    fn noop(id: &str) -> Step {
        Step::new(id, |_input: StepInput| async {
            Ok(StepOutcome::output(json!(null)))
        })
    }

    fn finished(ctx: &mut ExecutionContext, id: &str, output: Value) {
        ctx.steps.insert(
            id.to_string(),
            StepResult {
                status: StepStatus::Success,
                output: Some(output),
                ..StepResult::default()
            },
        );
    }

    fn article_run() -> (StepGraph, ExecutionContext) {
        let graph = StepGraph::new(vec![noop("research"), noop("writing").after("research")]).unwrap();
        let mut ctx = ExecutionContext::new("article", Uuid::now_v7(), json!({"topic": "AI"}));
        finished(&mut ctx, "research", json!({"text": "notes"}));
        finished(&mut ctx, "writing", json!({"text": "one two three"}));
        (graph, ctx)
    }

    #[test]
    fn test_declared_fields_with_transform() {
        let (graph, ctx) = article_run();
        let mut projection = OutputProjection::default();
        projection.field("article", VariableRef::step("writing", "text"));
        projection.field_with("wordCount", VariableRef::step("writing", "text"), |v| {
            let words = v.and_then(Value::as_str).map(|s| s.split_whitespace().count()).unwrap_or(0);
            json!(words)
        });

        let output = projection.project(&graph, &ctx);
        assert_eq!(output, json!({"article": "one two three", "wordCount": 3}));
    }

    #[test]
    fn test_absent_field_is_omitted() {
        let (graph, ctx) = article_run();
        let mut projection = OutputProjection::default();
        projection.field("summary", VariableRef::step("summarize", "text"));
        projection.field("topic", VariableRef::trigger("topic"));
        assert_eq!(projection.project(&graph, &ctx), json!({"topic": "AI"}));
    }

    #[test]
    fn test_transform_sees_absent_value() {
        let (graph, ctx) = article_run();
        let mut projection = OutputProjection::default();
        projection.field_with("hasSummary", VariableRef::step("summarize", "text"), |v| {
            json!(v.is_some())
        });
        assert_eq!(projection.project(&graph, &ctx), json!({"hasSummary": false}));
    }

    #[test]
    fn test_default_projection_uses_leaf_steps() {
        let (graph, ctx) = article_run();
        let output = OutputProjection::default().project(&graph, &ctx);
        assert_eq!(output, json!({"writing": {"text": "one two three"}}));
    }

    #[test]
    fn test_redeclared_field_replaces_previous() {
        let (graph, ctx) = article_run();
        let mut projection = OutputProjection::default();
        projection.field("text", VariableRef::step("research", "text"));
        projection.field("text", VariableRef::step("writing", "text"));
        assert_eq!(projection.project(&graph, &ctx), json!({"text": "one two three"}));
    }
}
