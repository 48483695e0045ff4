//! CLI command definitions for the `trellis` binary.

pub mod catalog;
pub mod render;
pub mod run;
pub mod runs;

use clap::{Parser, Subcommand};
use clap_complete::Shell;

/// Run and inspect step-based workflows.
#[derive(Parser)]
#[command(name = "trellis", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress all output except errors.
    #[arg(long, global = true)]
    pub quiet: bool,

    /// Detailed output (-v for verbose, -vv for debug/trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Emit logs as JSON lines.
    #[arg(long, global = true, env = "TRELLIS_LOG_JSON")]
    pub log_json: bool,

    /// Export spans to stdout through OpenTelemetry.
    #[arg(long, global = true, env = "TRELLIS_OTEL")]
    pub otel: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// List the built-in demo workflows.
    Demos,

    /// Start a workflow run.
    Run {
        /// Workflow id (see `trellis demos`).
        workflow: String,

        /// Trigger input as a JSON object.
        #[arg(long, short)]
        input: Option<String>,

        /// Print events as they happen.
        #[arg(long)]
        stream: bool,

        /// Fail the run after this many seconds.
        #[arg(long)]
        timeout: Option<u64>,
    },

    /// Resume a suspended run at a dotted step path.
    Resume {
        /// Run UUID.
        run_id: String,

        /// Suspended step path, e.g. `review.approve`.
        step: String,

        /// Resume input as JSON.
        #[arg(long, short)]
        input: Option<String>,
    },

    /// Inspect stored runs.
    Runs {
        #[command(subcommand)]
        action: runs::RunsCommand,
    },

    /// Cancel a suspended run.
    Cancel {
        /// Run UUID.
        run_id: String,
    },

    /// Generate shell completions.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
}

/// Parse an optional JSON argument, defaulting to `{}`.
pub fn parse_json_arg(raw: Option<&str>) -> anyhow::Result<serde_json::Value> {
    use anyhow::Context;
    match raw {
        Some(raw) => serde_json::from_str(raw).with_context(|| format!("invalid JSON input: {raw}")),
        None => Ok(serde_json::json!({})),
    }
}

/// Parse a run id argument.
pub fn parse_run_id(raw: &str) -> anyhow::Result<uuid::Uuid> {
    uuid::Uuid::parse_str(raw).map_err(|e| anyhow::anyhow!("invalid run id '{raw}': {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_run_subcommand() {
        let cli = Cli::try_parse_from(["trellis", "run", "article", "--input", r#"{"topic":"ai"}"#, "--stream"])
            .unwrap();
        match cli.command {
            Commands::Run { workflow, input, stream, timeout } => {
                assert_eq!(workflow, "article");
                assert_eq!(input.as_deref(), Some(r#"{"topic":"ai"}"#));
                assert!(stream);
                assert!(timeout.is_none());
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn test_parse_json_arg() {
        assert_eq!(parse_json_arg(None).unwrap(), serde_json::json!({}));
        assert_eq!(parse_json_arg(Some(r#"{"a":1}"#)).unwrap()["a"], 1);
        assert!(parse_json_arg(Some("{oops")).is_err());
    }

    #[test]
    fn test_parse_run_id_rejects_garbage() {
        assert!(parse_run_id("not-a-uuid").is_err());
        let id = uuid::Uuid::now_v7();
        assert_eq!(parse_run_id(&id.to_string()).unwrap(), id);
    }
}
