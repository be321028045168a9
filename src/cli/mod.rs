//! CLI module for triangulate
//!
//! Command-line parsing for the `triangulate-server` binary. Uses clap for
//! argument parsing and owo-colors for colored terminal output.

pub mod output;

use crate::escalation::EscalationStatus;
use crate::types::EscalationId;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Triangulate - multimodal evidence triangulation server
///
/// Fuses vision, retrieval, web search and generation signals into one
/// calibrated answer, escalating uncertain cases to human review.
#[derive(Parser, Debug)]
#[command(
    name = "triangulate-server",
    version,
    about = "Triangulate - multimodal evidence triangulation server",
    long_about = "Fuses vision, retrieval, web search and generation signals into one\n\
                  calibrated answer, escalating uncertain cases to a human-review queue.\n\n\
                  Run without arguments to start the server.",
    after_help = "EXAMPLES:\n    \
                  triangulate-server                                  # Start the server\n    \
                  triangulate-server config --validate                # Check triangulate.toml\n    \
                  triangulate-server escalations list --status pending\n    \
                  triangulate-server escalations transition <ID> in_review --note \"triage\""
)]
pub struct Cli {
    /// Path to the configuration file
    #[arg(short, long, default_value = "triangulate.toml", global = true)]
    pub config: PathBuf,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Disable colored output
    #[arg(long, global = true)]
    pub no_color: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Available CLI subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the HTTP server (default)
    Serve,

    /// Show configuration information
    Config {
        /// Validate the configuration file and report warnings
        #[arg(long)]
        validate: bool,
    },

    /// Inspect and review the escalation queue
    #[command(subcommand)]
    Escalations(EscalationCommands),
}

/// Escalation queue subcommands
#[derive(Subcommand, Debug)]
pub enum EscalationCommands {
    /// List escalations, oldest first
    List {
        /// Only show items in this status (pending, in_review, resolved)
        #[arg(short, long)]
        status: Option<EscalationStatus>,
    },

    /// Show one escalation in full
    Show {
        /// Escalation id
        id: EscalationId,
    },

    /// Move an escalation forward (pending -> in_review -> resolved)
    Transition {
        /// Escalation id
        id: EscalationId,

        /// Target status
        status: EscalationStatus,

        /// Reviewer note to record
        #[arg(short, long)]
        note: Option<String>,
    },

    /// Count escalations per status
    Stats,
}

impl Cli {
    /// Parse CLI arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
