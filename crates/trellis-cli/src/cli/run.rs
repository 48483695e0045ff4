//! `trellis run`, `trellis resume` and `trellis cancel`.

use std::time::Duration;

use anyhow::{Result, bail};
use console::style;
use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use trellis_core::workflow::{EngineError, RunOptions, RunResult};
use trellis_observe::run_attrs::{log_event, record_run_id, run_span};
use trellis_types::event::RunEvent;
use trellis_types::workflow::RunStatus;

use super::render::{print_event, print_result};
use super::{parse_json_arg, parse_run_id};
use crate::state::AppState;

// ---------------------------------------------------------------------------
// Run
// ---------------------------------------------------------------------------

pub async fn handle_run(
    state: &AppState,
    workflow: &str,
    input: Option<&str>,
    stream: bool,
    timeout: Option<u64>,
    json: bool,
) -> Result<()> {
    let trigger = parse_json_arg(input)?;
    if state.engine.workflow(workflow).is_none() {
        bail!(
            "workflow '{workflow}' not found (available: {})",
            state.engine.workflow_ids().join(", ")
        );
    }

    if stream {
        if timeout.is_some() {
            bail!("--timeout cannot be combined with --stream; set run_timeout_secs in config.toml");
        }
        return stream_run(state, workflow, trigger, json).await;
    }

    let run_id = uuid::Uuid::now_v7();
    let mut options = RunOptions::default()
        .run_id(run_id)
        .cancel(cancel_on_ctrl_c());
    if let Some(secs) = timeout {
        options = options.timeout(Duration::from_secs(secs));
    }
    let span = run_span(workflow);
    record_run_id(&span, run_id);

    let result = state
        .engine
        .start_with(workflow, trigger, options)
        .instrument(span)
        .await
        .map_err(engine_error)?;
    report(&result, json)
}

async fn stream_run(state: &AppState, workflow: &str, trigger: serde_json::Value, json: bool) -> Result<()> {
    let events = state.engine.stream_start(workflow, trigger);
    futures_util::pin_mut!(events);

    let mut last = None;
    while let Some(event) = events.next().await {
        log_event(&event);
        if json {
            println!("{}", serde_json::to_string(&event)?);
        } else {
            print_event(&event);
        }
        last = Some(event);
    }

    match last {
        Some(RunEvent::Failed { error, .. }) => bail!("run failed: {error}"),
        Some(_) => Ok(()),
        None => bail!("run ended without reporting an outcome"),
    }
}

// ---------------------------------------------------------------------------
// Resume
// ---------------------------------------------------------------------------

pub async fn handle_resume(
    state: &AppState,
    run_id: &str,
    step: &str,
    input: Option<&str>,
    json: bool,
) -> Result<()> {
    let run_id = parse_run_id(run_id)?;
    let input = parse_json_arg(input)?;

    let record = state.engine.get_run(run_id).await.map_err(engine_error)?;
    let span = run_span(&record.workflow_id);
    record_run_id(&span, run_id);

    let options = RunOptions::default().cancel(cancel_on_ctrl_c());
    let result = state
        .engine
        .resume_with(run_id, step, input, options)
        .instrument(span)
        .await
        .map_err(engine_error)?;
    report(&result, json)
}

// ---------------------------------------------------------------------------
// Cancel
// ---------------------------------------------------------------------------

pub async fn handle_cancel(state: &AppState, run_id: &str, json: bool) -> Result<()> {
    let run_id = parse_run_id(run_id)?;
    state.engine.cancel(run_id).await.map_err(engine_error)?;
    let record = state.engine.get_run(run_id).await.map_err(engine_error)?;

    if json {
        let out = serde_json::json!({
            "run_id": run_id.to_string(),
            "status": record.status.as_str(),
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else {
        println!();
        println!(
            "  {} Cancelled run {} ({})",
            style("*").green().bold(),
            style(run_id).cyan(),
            record.status
        );
        println!();
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn report(result: &RunResult, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(result)?);
    } else {
        print_result(result)?;
    }
    if result.status == RunStatus::Failed {
        let message = result
            .error
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_else(|| "unknown error".to_string());
        bail!("run {} failed: {message}", result.run_id);
    }
    Ok(())
}

/// Token cancelled on the first Ctrl+C, so an interrupted run is recorded
/// as failed instead of left running.
fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let child = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, cancelling run");
            child.cancel();
        }
    });
    token
}

/// Attach the error kind to engine errors that carry one.
pub fn engine_error(err: EngineError) -> anyhow::Error {
    match err.kind() {
        Some(kind) => anyhow::anyhow!("{err} ({kind})"),
        None => anyhow::Error::new(err),
    }
}
