//! Stepwise CLI entry point.
//!
//! Binary name: `stepwise`
//!
//! Parses CLI arguments, initializes tracing, the database and the engine
//! services, then dispatches to the command handler.

mod cli;
mod state;

use clap::Parser;
use stepwise_observe::{TracingOptions, init_tracing, shutdown_tracing};

use cli::{Cli, Commands};
use state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let options = TracingOptions::from_verbosity(cli.verbose, cli.quiet)
        .with_json(cli.json)
        .with_otel(cli.otel);
    if let Err(e) = init_tracing(&options) {
        eprintln!("Warning: tracing setup failed: {e}");
    }

    let result = dispatch(cli).await;
    shutdown_tracing();
    result
}

async fn dispatch(cli: Cli) -> anyhow::Result<()> {
    let state = AppState::init().await?;
    let tenant = cli.tenant.as_str();

    match cli.command {
        Commands::Definition { action } => {
            cli::definition::handle_definition_command(action, &state, tenant, cli.json).await
        }
        Commands::Execution { action } => {
            cli::execution::handle_execution_command(action, &state, tenant, cli.json).await
        }
        Commands::Dlq { action } => {
            cli::dlq::handle_dlq_command(action, &state, tenant, cli.json).await
        }
        Commands::Worker { interval_ms, once } => {
            cli::worker::run_worker(&state, interval_ms, once, cli.json).await
        }
    }
}
