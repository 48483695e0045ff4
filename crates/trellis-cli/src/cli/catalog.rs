//! `trellis demos`: list the registered workflows.

use anyhow::Result;
use comfy_table::{Cell, Color};
use console::style;

use crate::cli::render::new_table;
use crate::demos::DEMOS;
use crate::state::AppState;

pub fn list_demos(state: &AppState, json: bool) -> Result<()> {
    let registered = state.engine.workflow_ids();

    if json {
        let out: Vec<_> = DEMOS
            .iter()
            .filter(|d| registered.iter().any(|id| id == d.id))
            .map(|d| {
                serde_json::json!({
                    "id": d.id,
                    "summary": d.summary,
                    "sample_input": d.sample_input,
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    let mut table = new_table(vec![
        Cell::new("Workflow").fg(Color::Cyan),
        Cell::new("Steps"),
        Cell::new("Summary"),
        Cell::new("Sample input"),
    ]);
    for demo in DEMOS {
        let Some(workflow) = state.engine.workflow(demo.id) else {
            continue;
        };
        table.add_row(vec![
            Cell::new(demo.id).fg(Color::Cyan),
            Cell::new(workflow.graph().len()),
            Cell::new(demo.summary),
            Cell::new(demo.sample_input),
        ]);
    }

    println!();
    println!("{table}");
    println!();
    println!(
        "  Start one with: {}",
        style("trellis run article --input '{\"topic\": \"rust\"}'").dim()
    );
    println!("  Runs are stored under {}", style(state.data_dir.display()).dim());
    println!();
    Ok(())
}
