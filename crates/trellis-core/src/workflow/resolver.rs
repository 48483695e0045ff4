//! Variable resolution against run state.
//!
//! Absence is not an error: a reference to a step that has not produced
//! output, or a path that does not exist, resolves to `None`. Numeric path
//! segments index into arrays.

use std::collections::BTreeMap;

use serde_json::{Map, Value};
use trellis_types::variable::{VariableRef, VariableSource};

use super::context::ExecutionContext;

/// Resolve one reference. Returns `None` when any part of the path is absent.
pub fn resolve(reference: &VariableRef, ctx: &ExecutionContext) -> Option<Value> {
    let segments = reference.segments();
    match &reference.source {
        VariableSource::Trigger => lookup_path(&ctx.trigger_input, &segments).cloned(),
        VariableSource::Step(step_id) => {
            let output = ctx.output_of(step_id)?;
            lookup_path(output, &segments).cloned()
        }
        VariableSource::Variables => {
            let (first, rest) = match segments.split_first() {
                Some(split) => split,
                None => return Some(Value::Object(ctx.variables.clone())),
            };
            let root = ctx.variables.get(*first)?;
            lookup_path(root, rest).cloned()
        }
    }
}

/// Resolve a named set of references into one object.
///
/// Names whose reference is absent are left out of the result entirely.
pub fn resolve_all(
    references: &BTreeMap<String, VariableRef>,
    ctx: &ExecutionContext,
) -> Map<String, Value> {
    let mut resolved = Map::new();
    for (name, reference) in references {
        match resolve(reference, ctx) {
            Some(value) => {
                resolved.insert(name.clone(), value);
            }
            None => {
                tracing::trace!(name = %name, reference = %reference, "variable absent, omitting");
            }
        }
    }
    resolved
}

/// Walk `segments` from `root`.
pub fn lookup_path<'a>(root: &'a Value, segments: &[&str]) -> Option<&'a Value> {
    let mut current = root;
    for segment in segments {
        current = match current {
            Value::Object(map) => map.get(*segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use trellis_types::workflow::{StepResult, StepStatus};
    use uuid::Uuid;

    fn test_context() -> ExecutionContext {
        let mut ctx = ExecutionContext::new(
            "article",
            Uuid::now_v7(),
            json!({"topic": "AI", "tags": ["rust", "async"]}),
        );
        ctx.steps.insert(
            "research".to_string(),
            StepResult {
                status: StepStatus::Success,
                output: Some(json!({"text": "findings", "sources": [{"url": "a"}, {"url": "b"}]})),
                ..StepResult::default()
            },
        );
        ctx.variables.insert("count".to_string(), json!(3));
        ctx
    }

    #[test]
    fn test_resolve_trigger_field() {
        let ctx = test_context();
        let value = resolve(&VariableRef::trigger("topic"), &ctx);
        assert_eq!(value, Some(json!("AI")));
    }

    #[test]
    fn test_resolve_whole_trigger() {
        let ctx = test_context();
        let value = resolve(&VariableRef::trigger("."), &ctx).unwrap();
        assert_eq!(value["topic"], json!("AI"));
    }

    #[test]
    fn test_resolve_step_output_with_array_index() {
        let ctx = test_context();
        let r: VariableRef = "research.output.sources.1.url".parse().unwrap();
        assert_eq!(resolve(&r, &ctx), Some(json!("b")));
    }

    #[test]
    fn test_missing_step_resolves_to_none() {
        let ctx = test_context();
        assert_eq!(resolve(&VariableRef::step("writing", "text"), &ctx), None);
    }

    #[test]
    fn test_missing_path_resolves_to_none() {
        let ctx = test_context();
        assert_eq!(resolve(&VariableRef::step("research", "summary"), &ctx), None);
        assert_eq!(resolve(&VariableRef::trigger("tags.9"), &ctx), None);
        assert_eq!(resolve(&VariableRef::trigger("topic.length"), &ctx), None);
    }

    #[test]
    fn test_resolve_variables() {
        let ctx = test_context();
        assert_eq!(resolve(&VariableRef::variable("count"), &ctx), Some(json!(3)));
        assert_eq!(resolve(&VariableRef::variable("."), &ctx), Some(json!({"count": 3})));
        assert_eq!(resolve(&VariableRef::variable("missing"), &ctx), None);
    }

    #[test]
    fn test_resolve_all_omits_absent() {
        let ctx = test_context();
        let mut refs = BTreeMap::new();
        refs.insert("topic".to_string(), VariableRef::trigger("topic"));
        refs.insert("draft".to_string(), VariableRef::step("writing", "text"));
        refs.insert("research".to_string(), VariableRef::step("research", "text"));

        let resolved = resolve_all(&refs, &ctx);
        assert_eq!(resolved.len(), 2);
        assert_eq!(resolved["topic"], json!("AI"));
        assert_eq!(resolved["research"], json!("findings"));
        assert!(!resolved.contains_key("draft"));
    }
}
