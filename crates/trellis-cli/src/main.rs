//! Trellis CLI entry point.
//!
//! Binary name: `trellis`
//!
//! Parses CLI arguments, opens the configured run store, registers the demo
//! workflows, then dispatches to the command handler.

mod cli;
mod demos;
mod state;

use clap::Parser;
use clap_complete::generate;

use cli::{Cli, Commands};
use state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "warn",
        1 => "info,trellis_core=debug",
        _ => "trace",
    };
    trellis_observe::tracing_setup::init_tracing(filter, cli.log_json, cli.otel)
        .map_err(|e| anyhow::anyhow!("failed to initialize tracing: {e}"))?;

    let outcome = dispatch(cli).await;
    trellis_observe::tracing_setup::shutdown_tracing();
    outcome
}

async fn dispatch(cli: Cli) -> anyhow::Result<()> {
    // Shell completions don't need app state
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = <Cli as clap::CommandFactory>::command();
        generate(*shell, &mut cmd, "trellis", &mut std::io::stdout());
        return Ok(());
    }

    let state = AppState::init().await?;

    match cli.command {
        Commands::Demos => cli::catalog::list_demos(&state, cli.json),
        Commands::Run {
            workflow,
            input,
            stream,
            timeout,
        } => cli::run::handle_run(&state, &workflow, input.as_deref(), stream, timeout, cli.json).await,
        Commands::Resume {
            run_id,
            step,
            input,
        } => cli::run::handle_resume(&state, &run_id, &step, input.as_deref(), cli.json).await,
        Commands::Runs { action } => cli::runs::handle_runs_command(action, &state, cli.json).await,
        Commands::Cancel { run_id } => cli::run::handle_cancel(&state, &run_id, cli.json).await,
        Commands::Completions { .. } => unreachable!("handled above"),
    }
}
