//! Switchyard CLI entry point.
//!
//! Binary name: `syard`
//!
//! Parses CLI arguments, initializes tracing, opens the checkpoint database,
//! then dispatches to the matching command handler.

mod cli;
mod demo;
mod state;

use clap::Parser;
use clap_complete::generate;
use switchyard_observe::{TracingOptions, init_tracing, shutdown_tracing};
use switchyard_types::outcome::Decision;

use cli::{Cli, Commands};
use state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Shell completions don't need tracing or app state
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = <Cli as clap::CommandFactory>::command();
        generate(*shell, &mut cmd, "syard", &mut std::io::stdout());
        return Ok(());
    }

    let options = TracingOptions {
        json: cli.json,
        otel: cli.otel,
        ..TracingOptions::default()
    }
    .with_verbosity(cli.verbose);
    init_tracing(&options).map_err(|e| anyhow::anyhow!("failed to initialize tracing: {e}"))?;

    let result = run(cli).await;
    shutdown_tracing();
    result
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let state = AppState::init().await?;

    match cli.command {
        Commands::Advance { session, message } => {
            cli::session::handle_advance(&state, &session, &message, cli.json).await
        }
        Commands::Approve { session } => {
            cli::session::handle_release(&state, &session, Decision::Approve, cli.json).await
        }
        Commands::Deny { session, reason } => {
            cli::session::handle_release(&state, &session, Decision::deny(reason), cli.json).await
        }
        Commands::Show { session, turns } => {
            cli::session::handle_show(&state, &session, turns, cli.json).await
        }
        Commands::History { session, limit } => {
            cli::session::handle_history(&state, &session, limit, cli.json).await
        }
        Commands::Sessions => cli::session::handle_sessions(&state, cli.json).await,
        Commands::Completions { .. } => unreachable!("handled before state init"),
    }
}
