//! `trellis runs`: list, show and purge stored runs.

use anyhow::{Result, bail};
use clap::Subcommand;
use comfy_table::{Cell, Color};
use console::style;
use trellis_types::workflow::RunStatus;

use super::render::{new_table, print_record, status_color};
use super::run::engine_error;
use super::parse_run_id;
use crate::state::AppState;

#[derive(Subcommand)]
pub enum RunsCommand {
    /// List stored runs, newest first.
    List {
        /// Only runs of this workflow.
        #[arg(long)]
        workflow: Option<String>,

        /// Only runs with this status (created, running, suspended, completed, failed).
        #[arg(long)]
        status: Option<String>,

        /// Maximum number of runs to display.
        #[arg(long, default_value = "20")]
        limit: u32,
    },

    /// Show one run with its step states.
    Show {
        /// Run UUID.
        run_id: String,
    },

    /// Delete a stored run.
    Purge {
        /// Run UUID.
        run_id: String,
    },
}

pub async fn handle_runs_command(cmd: RunsCommand, state: &AppState, json: bool) -> Result<()> {
    match cmd {
        RunsCommand::List {
            workflow,
            status,
            limit,
        } => handle_list(state, workflow.as_deref(), status.as_deref(), limit, json).await,
        RunsCommand::Show { run_id } => handle_show(state, &run_id, json).await,
        RunsCommand::Purge { run_id } => handle_purge(state, &run_id, json).await,
    }
}

async fn handle_list(
    state: &AppState,
    workflow: Option<&str>,
    status: Option<&str>,
    limit: u32,
    json: bool,
) -> Result<()> {
    let status = match status {
        Some(raw) => match raw.parse::<RunStatus>() {
            Ok(status) => Some(status),
            Err(_) => bail!("unknown run status '{raw}'"),
        },
        None => None,
    };

    let runs = state
        .engine
        .list_runs(workflow, status, Some(limit))
        .await
        .map_err(engine_error)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&runs)?);
        return Ok(());
    }

    if runs.is_empty() {
        println!();
        println!("  No runs found.");
        println!("  Start one with: {}", style("trellis run <workflow>").dim());
        println!();
        return Ok(());
    }

    let mut table = new_table(vec![
        Cell::new("Run ID").fg(Color::Cyan),
        Cell::new("Workflow"),
        Cell::new("Status"),
        Cell::new("Started"),
        Cell::new("Suspended at"),
        Cell::new("Error"),
    ]);
    for run in &runs {
        table.add_row(vec![
            Cell::new(run.run_id),
            Cell::new(&run.workflow_id),
            Cell::new(run.status).fg(status_color(run.status)),
            Cell::new(run.started_at.format("%Y-%m-%d %H:%M:%S")),
            Cell::new(run.suspended_step_path.as_deref().unwrap_or("-")),
            Cell::new(run.error.as_ref().map(|e| e.kind.to_string()).unwrap_or_default()),
        ]);
    }

    println!();
    println!("{table}");
    println!();
    Ok(())
}

async fn handle_show(state: &AppState, run_id: &str, json: bool) -> Result<()> {
    let run_id = parse_run_id(run_id)?;
    let record = state.engine.get_run(run_id).await.map_err(engine_error)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&record)?);
        return Ok(());
    }
    print_record(&record)
}

async fn handle_purge(state: &AppState, run_id: &str, json: bool) -> Result<()> {
    let run_id = parse_run_id(run_id)?;
    let deleted = state.engine.purge_run(run_id).await.map_err(engine_error)?;

    if json {
        let out = serde_json::json!({ "run_id": run_id.to_string(), "deleted": deleted });
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else if deleted {
        println!();
        println!("  {} Purged run {}", style("*").green().bold(), style(run_id).cyan());
        println!();
    } else {
        println!();
        println!("  No run {} was stored.", style(run_id).dim());
        println!();
    }
    Ok(())
}
