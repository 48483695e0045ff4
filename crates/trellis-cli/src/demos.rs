//! Built-in demo workflows.
//!
//! Registered on every start so runs persisted by an earlier invocation can
//! be resumed by id.

use std::time::Duration;

use serde_json::{Value, json};
use trellis_core::capability::{BoxTextGenerator, CapabilityError, TextGenerator};
use trellis_core::repository::run::RunStore;
use trellis_core::workflow::{
    CompareOp, Condition, Engine, Step, StepError, StepInput, StepOutcome, Workflow,
    WorkflowBuilder, WorkflowError,
};
use trellis_types::variable::VariableRef;
use trellis_types::workflow::RetryPolicy;

/// One entry of `trellis demos`.
pub struct DemoInfo {
    pub id: &'static str,
    pub summary: &'static str,
    pub sample_input: &'static str,
}

pub const DEMOS: &[DemoInfo] = &[
    DemoInfo {
        id: "article",
        summary: "research a topic, write it up, project the word count",
        sample_input: r#"{"topic": "rust"}"#,
    },
    DemoInfo {
        id: "approval",
        summary: "draft, suspend for approval, publish",
        sample_input: r#"{"title": "release notes"}"#,
    },
    DemoInfo {
        id: "resilient-fetch",
        summary: "fetch fails after retries, fallback runs on failure",
        sample_input: "{}",
    },
    DemoInfo {
        id: "publishing",
        summary: "nested review workflow with an approval gate",
        sample_input: r#"{"title": "launch post"}"#,
    },
    DemoInfo {
        id: "countdown",
        summary: "repeat a step until the counter reaches zero",
        sample_input: r#"{"from": 3}"#,
    },
];

// ---------------------------------------------------------------------------
// Text generation
// ---------------------------------------------------------------------------

/// Deterministic generator standing in for an agent.
pub struct TemplateGenerator;

impl TextGenerator for TemplateGenerator {
    fn name(&self) -> &str {
        "template"
    }

    async fn generate(&self, prompt: &str) -> Result<String, CapabilityError> {
        if prompt.trim().is_empty() {
            return Err(CapabilityError::Failed("empty prompt".to_string()));
        }
        Ok(format!("{prompt} is covered in detail"))
    }
}

fn generation_error(err: CapabilityError) -> StepError {
    StepError::failed(err.to_string())
}

// ---------------------------------------------------------------------------
// Registration
// ---------------------------------------------------------------------------

pub fn register_all<R: RunStore>(engine: &Engine<R>, generator: BoxTextGenerator) -> Result<(), WorkflowError> {
    engine.register(article(generator)?);
    engine.register(approval()?);
    engine.register(resilient_fetch()?);
    engine.register(publishing()?);
    engine.register(countdown()?);
    tracing::debug!(count = DEMOS.len(), "registered demo workflows");
    Ok(())
}

pub fn article(generator: BoxTextGenerator) -> Result<Workflow, WorkflowError> {
    let researcher = generator.clone();
    let research = Step::new("research", move |input: StepInput| {
        let generator = researcher.clone();
        async move {
            let topic = input.get_str("topic").unwrap_or("nothing").to_string();
            let facts = generator.generate(&topic).await.map_err(generation_error)?;
            Ok(StepOutcome::output(json!({ "facts": facts })))
        }
    })
    .variable("topic", VariableRef::trigger("topic"));

    let writing = Step::new("writing", move |input: StepInput| {
        let generator = generator.clone();
        async move {
            let facts = input.get_str("facts").unwrap_or_default().to_string();
            let text = generator
                .generate(&format!("An article where {facts}"))
                .await
                .map_err(generation_error)?;
            Ok(StepOutcome::output(json!({ "text": text })))
        }
    })
    .variable("facts", VariableRef::step("research", "facts"));

    WorkflowBuilder::new("article")
        .description("research a topic, then write an article")
        .step(research)
        .then(writing)
        .output("article", VariableRef::step("writing", "text"))
        .output_with("wordCount", VariableRef::step("writing", "text"), word_count)
        .build()
}

fn word_count(text: Option<&Value>) -> Value {
    json!(text.and_then(Value::as_str).map_or(0, |t| t.split_whitespace().count()))
}

/// Suspends on first entry; the resume input becomes its output.
fn approval_gate(id: &str) -> Step {
    Step::new(id, |input: StepInput| async move {
        if input.resumed {
            return Ok(StepOutcome::output(input.input));
        }
        Ok(StepOutcome::suspend(json!({
            "reason": "waiting for approval",
            "step": input.step_path,
        })))
    })
}

pub fn approval() -> Result<Workflow, WorkflowError> {
    let draft = Step::new("draft", |input: StepInput| async move {
        let title = input.get_str("title").unwrap_or("untitled").to_string();
        Ok(StepOutcome::output(json!({ "draft": format!("draft of {title}") })))
    })
    .variable("title", VariableRef::trigger("title"));

    let publish = Step::new("publish", |input: StepInput| async move {
        Ok(StepOutcome::output(json!({ "published": input.get_str("draft") })))
    })
    .variable("draft", VariableRef::step("draft", "draft"))
    .when(Condition::output("approve", "approved", CompareOp::Eq, json!(true)));

    WorkflowBuilder::new("approval")
        .description("draft, wait for approval, publish")
        .step(draft)
        .then(approval_gate("approve"))
        .then(publish)
        .build()
}

pub fn resilient_fetch() -> Result<Workflow, WorkflowError> {
    let fetch = Step::new("fetch", |input: StepInput| async move {
        Err(StepError::failed(format!(
            "upstream unavailable (attempt {})",
            input.attempt
        )))
    })
    .retry(RetryPolicy::new(3, 50, 2.0));

    let fallback = Step::new("fallback", |_input: StepInput| async {
        Ok(StepOutcome::output(json!({ "source": "cache", "items": [] })))
    })
    .after("fetch")
    .when(Condition::compare("steps.fetch.status", CompareOp::Eq, json!("failed")));

    WorkflowBuilder::new("resilient-fetch")
        .description("fall back to a cache when the fetch fails")
        .step(fetch)
        .step(fallback)
        .timeout(Duration::from_secs(30))
        .build()
}

pub fn publishing() -> Result<Workflow, WorkflowError> {
    let check = Step::new("check", |input: StepInput| async move {
        let title = input.get_str("title").unwrap_or_default();
        Ok(StepOutcome::output(json!({ "ok": !title.is_empty() })))
    })
    .variable("title", VariableRef::trigger("title"));

    let review = WorkflowBuilder::new("review")
        .step(check)
        .then(approval_gate("approve"))
        .build()?;

    let draft = Step::new("draft", |input: StepInput| async move {
        let title = input.get_str("title").unwrap_or("untitled").to_string();
        Ok(StepOutcome::output(json!({ "title": title })))
    })
    .variable("title", VariableRef::trigger("title"));

    let publish = Step::new("publish", |input: StepInput| async move {
        Ok(StepOutcome::output(json!({ "published": input.get("review") })))
    })
    .variable("review", VariableRef::step("review", "approve"));

    WorkflowBuilder::new("publishing")
        .description("draft, run the review workflow, publish")
        .step(draft)
        .then(Step::workflow(review).variable("title", VariableRef::step("draft", "title")))
        .then(publish)
        .output("published", VariableRef::step("publish", "published"))
        .build()
}

pub fn countdown() -> Result<Workflow, WorkflowError> {
    let tick = Step::new("tick", |input: StepInput| async move {
        let from = input.get("from").and_then(Value::as_i64).unwrap_or(3);
        let remaining = (from - i64::from(input.iteration)).max(0);
        Ok(StepOutcome::output(json!({ "remaining": remaining }))
            .with_variable("ticks", json!(input.iteration)))
    })
    .variable("from", VariableRef::trigger("from"))
    .max_iterations(20);

    WorkflowBuilder::new("countdown")
        .description("tick until the counter reaches zero")
        .until(
            tick,
            Condition::output("tick", "remaining", CompareOp::Lte, json!(0)),
        )
        .output("remaining", VariableRef::step("tick", "remaining"))
        .output("ticks", VariableRef::variable("ticks"))
        .build()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use trellis_core::repository::memory::InMemoryRunStore;
    use trellis_types::config::EngineConfig;
    use trellis_types::workflow::{RunStatus, StepStatus};

    fn engine() -> Engine<InMemoryRunStore> {
        let engine = Engine::new(InMemoryRunStore::new(), EngineConfig::default());
        register_all(&engine, BoxTextGenerator::new(TemplateGenerator)).unwrap();
        engine
    }

    #[test]
    fn test_every_demo_is_registered() {
        let engine = engine();
        let ids = engine.workflow_ids();
        for demo in DEMOS {
            assert!(ids.iter().any(|id| id == demo.id), "missing {}", demo.id);
            serde_json::from_str::<Value>(demo.sample_input).unwrap();
        }
    }

    #[tokio::test]
    async fn test_article_counts_words() {
        let result = engine().start("article", json!({"topic": "rust"})).await.unwrap();
        assert_eq!(result.status, RunStatus::Completed);
        let output = result.output.unwrap();
        // "An article where rust is covered in detail is covered in detail"
        assert_eq!(output["wordCount"], json!(12));
    }

    #[tokio::test]
    async fn test_approval_resume_publishes() {
        let engine = engine();
        let run = engine.start("approval", json!({"title": "notes"})).await.unwrap();
        assert_eq!(run.status, RunStatus::Suspended);

        let done = engine
            .resume(run.run_id, "approve", json!({"approved": true}))
            .await
            .unwrap();
        assert_eq!(done.status, RunStatus::Completed);
        assert_eq!(done.step_status("publish"), StepStatus::Success);
    }

    #[tokio::test]
    async fn test_rejected_approval_skips_publish() {
        let engine = engine();
        let run = engine.start("approval", json!({})).await.unwrap();
        let done = engine
            .resume(run.run_id, "approve", json!({"approved": false}))
            .await
            .unwrap();
        assert_eq!(done.status, RunStatus::Completed);
        assert_eq!(done.step_status("publish"), StepStatus::Skipped);
    }

    #[tokio::test]
    async fn test_fetch_falls_back() {
        let result = engine().start("resilient-fetch", json!({})).await.unwrap();
        assert_eq!(result.status, RunStatus::Completed);
        assert_eq!(result.step_status("fetch"), StepStatus::Failed);
        assert_eq!(result.context.step("fetch").unwrap().attempts, 4);
        assert_eq!(result.step_status("fallback"), StepStatus::Success);
    }

    #[tokio::test]
    async fn test_publishing_suspends_inside_review() {
        let engine = engine();
        let run = engine.start("publishing", json!({"title": "launch"})).await.unwrap();
        assert_eq!(run.suspended_step_path.as_deref(), Some("review.approve"));

        let done = engine
            .resume(run.run_id, "review.approve", json!({"approved": true}))
            .await
            .unwrap();
        assert_eq!(done.status, RunStatus::Completed);
        assert_eq!(
            done.output,
            Some(json!({"published": {"approved": true}}))
        );
    }

    #[tokio::test]
    async fn test_countdown_stops_at_zero() {
        let result = engine().start("countdown", json!({"from": 3})).await.unwrap();
        assert_eq!(result.status, RunStatus::Completed);
        assert_eq!(result.output, Some(json!({"remaining": 0, "ticks": 3})));
    }
}
