//! CLI command definitions for the `stepwise` binary.
//!
//! Noun-verb layout: `stepwise definition publish`, `stepwise execution run`,
//! `stepwise dlq list`, plus the long-running `stepwise worker`.

pub mod definition;
pub mod dlq;
pub mod execution;
pub mod output;
pub mod worker;

use clap::{Parser, Subcommand};

/// Durable, tenant-scoped step execution.
#[derive(Parser)]
#[command(name = "stepwise", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress all output except errors.
    #[arg(long, global = true)]
    pub quiet: bool,

    /// Detailed output (-v for info, -vv for debug, -vvv for trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Export spans to stdout through OpenTelemetry.
    #[arg(long, global = true)]
    pub otel: bool,

    /// Tenant every command operates on.
    #[arg(long, global = true, env = "STEPWISE_TENANT", default_value = "default")]
    pub tenant: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Manage workflow definitions (validate, publish, list, deprecate).
    #[command(alias = "def")]
    Definition {
        #[command(subcommand)]
        action: definition::DefinitionCommand,
    },

    /// Create, run, cancel and inspect executions.
    #[command(alias = "exec")]
    Execution {
        #[command(subcommand)]
        action: execution::ExecutionCommand,
    },

    /// Inspect the dead-letter queue.
    Dlq {
        #[command(subcommand)]
        action: dlq::DlqCommand,
    },

    /// Resume due retries until interrupted.
    Worker {
        /// Poll interval in milliseconds (overrides config).
        #[arg(long)]
        interval_ms: Option<u64>,

        /// Run a single poller pass and exit.
        #[arg(long)]
        once: bool,
    },
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
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "stepwise", "execution", "list", "--tenant", "acme", "--json", "-vv",
        ])
        .unwrap();
        assert_eq!(cli.tenant, "acme");
        assert!(cli.json);
        assert_eq!(cli.verbose, 2);
    }

    #[test]
    fn test_worker_flags() {
        let cli = Cli::try_parse_from(["stepwise", "worker", "--once", "--interval-ms", "250"])
            .unwrap();
        match cli.command {
            Commands::Worker { interval_ms, once } => {
                assert_eq!(interval_ms, Some(250));
                assert!(once);
            }
            _ => panic!("expected worker command"),
        }
    }
}
