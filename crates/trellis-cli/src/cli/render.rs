//! Shared text rendering for run results, records and events.

use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use trellis_core::workflow::{ExecutionContext, RunResult};
use trellis_types::event::RunEvent;
use trellis_types::workflow::{RunRecord, RunStatus, StepStatus};

pub fn status_color(status: RunStatus) -> Color {
    match status {
        RunStatus::Created => Color::Grey,
        RunStatus::Running => Color::Blue,
        RunStatus::Suspended => Color::Yellow,
        RunStatus::Completed => Color::Green,
        RunStatus::Failed => Color::Red,
    }
}

fn step_marker(status: StepStatus) -> String {
    match status {
        StepStatus::Success => format!("{}", style("✓").green()),
        StepStatus::Failed => format!("{}", style("✗").red()),
        StepStatus::Suspended => format!("{}", style("⏸").yellow()),
        StepStatus::Skipped => format!("{}", style("-").dim()),
        StepStatus::Running => format!("{}", style("…").blue()),
        StepStatus::Pending => format!("{}", style("·").dim()),
    }
}

pub fn new_table(header: Vec<Cell>) -> Table {
    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(header);
    table
}

/// Print the outcome of `run`, `resume` or a finished stream.
pub fn print_result(result: &RunResult) -> anyhow::Result<()> {
    println!();
    println!(
        "  {} Run {} of '{}' is {}",
        style("*").bold(),
        style(result.run_id).dim(),
        style(&result.workflow_id).cyan(),
        styled_status(result.status),
    );
    println!();
    for (path, status) in &result.steps {
        let depth = path.matches('.').count();
        println!("  {}{} {path} ({status})", "  ".repeat(depth), step_marker(*status));
    }

    if let Some(error) = &result.error {
        println!();
        println!("  {} {}: {}", style("error").red().bold(), error.kind, error.message);
    }
    if let Some(path) = &result.suspended_step_path {
        println!();
        println!("  Suspended at {}", style(path).yellow());
        if let Some(payload) = &result.suspend_payload {
            println!("  Payload: {}", serde_json::to_string(payload)?);
        }
        println!(
            "  Resume with: {}",
            style(format!("trellis resume {} {path} --input '{{}}'", result.run_id)).dim()
        );
    }
    if let Some(output) = &result.output {
        println!();
        println!("  Output:");
        for line in serde_json::to_string_pretty(output)?.lines() {
            println!("    {line}");
        }
    }
    println!();
    Ok(())
}

pub fn print_record(record: &RunRecord) -> anyhow::Result<()> {
    println!();
    println!(
        "  {} Run {}",
        style("*").bold(),
        style(record.run_id).cyan()
    );
    println!("  Workflow:  {}", record.workflow_id);
    println!("  Status:    {}", styled_status(record.status));
    println!("  Started:   {}", record.started_at.format("%Y-%m-%d %H:%M:%S%.3f UTC"));
    println!("  Updated:   {}", record.updated_at.format("%Y-%m-%d %H:%M:%S%.3f UTC"));
    if let Some(completed) = record.completed_at {
        println!("  Completed: {}", completed.format("%Y-%m-%d %H:%M:%S%.3f UTC"));
    }
    if let Some(path) = &record.suspended_step_path {
        println!("  Suspended: {}", style(path).yellow());
    }
    if let Some(error) = &record.error {
        println!("  Error:     {} ({})", error.message, error.kind);
    }

    match ExecutionContext::from_json(record.context.clone()) {
        Ok(ctx) if !ctx.steps.is_empty() => {
            println!();
            let mut table = new_table(vec![
                Cell::new("Step").fg(Color::Cyan),
                Cell::new("Status"),
                Cell::new("Attempts"),
                Cell::new("Output"),
            ]);
            for (id, step) in &ctx.steps {
                let output = step
                    .output
                    .as_ref()
                    .map(|o| truncate(&o.to_string(), 60))
                    .unwrap_or_default();
                table.add_row(vec![
                    Cell::new(id),
                    Cell::new(step.status),
                    Cell::new(step.attempts),
                    Cell::new(output),
                ]);
            }
            println!("{table}");
        }
        Ok(_) => {}
        Err(e) => tracing::warn!(run_id = %record.run_id, error = %e, "stored context is unreadable"),
    }
    println!();
    Ok(())
}

/// One line per event for `run --stream`.
pub fn print_event(event: &RunEvent) {
    println!("{}", event_line(event));
}

fn event_line(event: &RunEvent) -> String {
    match event {
        RunEvent::Started { workflow_id, resumed, .. } => {
            let verb = if *resumed { "resumed" } else { "started" };
            format!("{} {workflow_id} {verb}", style("▶").bold())
        }
        RunEvent::StepStarted { step_path, attempt, .. } if *attempt > 1 => {
            format!("  {} {step_path} (attempt {attempt})", style("↻").yellow())
        }
        RunEvent::StepStarted { step_path, .. } => format!("  {} {step_path}", style("…").blue()),
        RunEvent::StepCompleted { step_path, duration_ms, .. } => {
            format!("  {} {step_path} {}", style("✓").green(), style(format!("{duration_ms}ms")).dim())
        }
        RunEvent::StepFailed { step_path, error, will_retry, .. } => {
            let suffix = if *will_retry { ", retrying" } else { "" };
            format!("  {} {step_path}: {}{suffix}", style("✗").red(), error.message)
        }
        RunEvent::StepSkipped { step_path, .. } => format!("  {} {step_path} skipped", style("-").dim()),
        RunEvent::StepSuspended { step_path, .. } => {
            format!("  {} {step_path} suspended", style("⏸").yellow())
        }
        RunEvent::Suspended { run_id, step_path } => format!(
            "{} suspended at {step_path}; resume with {}",
            style("⏸").yellow(),
            style(format!("trellis resume {run_id} {step_path}")).dim()
        ),
        RunEvent::Completed { duration_ms, output, .. } => {
            format!("{} completed in {duration_ms}ms: {output}", style("■").green())
        }
        RunEvent::Failed { error, .. } => {
            format!("{} failed ({}): {}", style("■").red(), error.kind, error.message)
        }
    }
}

fn styled_status(status: RunStatus) -> String {
    let text = status.to_string();
    match status {
        RunStatus::Completed => style(text).green().to_string(),
        RunStatus::Failed => style(text).red().to_string(),
        RunStatus::Suspended => style(text).yellow().to_string(),
        _ => style(text).blue().to_string(),
    }
}

pub fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let cut: String = s.chars().take(max.saturating_sub(1)).collect();
    format!("{cut}…")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("abcdefghij", 5), "abcd…");
        assert_eq!(truncate("héllo wörld", 6).chars().count(), 6);
    }

    #[test]
    fn test_event_line_shows_completed_output() {
        let line = event_line(&RunEvent::Completed {
            run_id: uuid::Uuid::now_v7(),
            workflow_id: "article".into(),
            duration_ms: 12,
            output: serde_json::json!({"wordCount": 6}),
        });
        assert!(line.contains("12ms"));
        assert!(line.contains(r#"{"wordCount":6}"#));
    }

    #[test]
    fn test_status_colors_are_distinct_for_terminal_states() {
        assert_ne!(status_color(RunStatus::Completed), status_color(RunStatus::Failed));
        assert_eq!(status_color(RunStatus::Suspended), Color::Yellow);
    }
}
