//! CLI command definitions for the `syard` binary.
//!
//! Uses clap derive macros for argument parsing. Each command maps onto one
//! engine call or one read of the checkpoint store.

pub mod session;

use clap::{Parser, Subcommand};
use clap_complete::Shell;

/// Drive checkpointed support-desk sessions from the terminal.
#[derive(Parser)]
#[command(name = "syard", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Detailed logging on stderr (-v for info, -vv for debug).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Export tracing spans through OpenTelemetry (stdout exporter).
    #[arg(long, global = true, env = "SWITCHYARD_OTEL")]
    pub otel: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Send a message to a session (created on first use).
    Advance {
        /// Session identifier.
        session: String,

        /// Message text.
        message: String,
    },

    /// Approve the step a session is waiting on.
    Approve {
        /// Session identifier.
        session: String,
    },

    /// Deny the step a session is waiting on.
    Deny {
        /// Session identifier.
        session: String,

        /// Why the step was denied; fed back to the proposing step.
        reason: String,
    },

    /// Show a session's current state and recent turns.
    Show {
        /// Session identifier.
        session: String,

        /// Number of recent turns to display.
        #[arg(long, default_value = "10")]
        turns: usize,
    },

    /// List stored checkpoint versions for a session.
    History {
        /// Session identifier.
        session: String,

        /// Maximum number of versions to display.
        #[arg(long, default_value = "20")]
        limit: u32,
    },

    /// List all sessions.
    #[command(alias = "ls")]
    Sessions,

    /// Generate shell completions.
    Completions {
        /// Target shell.
        shell: Shell,
    },
}
