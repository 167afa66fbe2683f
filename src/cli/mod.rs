//! CLI module for Agora
//!
//! Provides command-line interface parsing and handling for the `agora` binary.
//! Uses clap for argument parsing and owo-colors for colored terminal output.

pub mod commands;
pub mod output;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::utils::toml_config::OrchestrationMode;

/// Agora - multi-agent query coordinator
///
/// Fans a query out to the configured agents, waits for them within a
/// deadline, fills gaps from cache and prints the ranked result.
#[derive(Parser, Debug)]
#[command(
    name = "agora",
    author = "Dirmacs <build@dirmacs.com>",
    version,
    about = "Agora - multi-agent query coordinator",
    long_about = "Coordinates a set of data agents to answer one query within a deadline.\n\n\
                  Agents with a `catalog` file in agora.toml are hosted in-process.",
    after_help = "EXAMPLES:\n    \
                  agora query \"burton snowboard under $500\"\n    \
                  agora query \"all-mountain board\" --mode maximum-reliability --json\n    \
                  agora agents                  # List configured agents\n    \
                  agora config --validate       # Check agora.toml"
)]
pub struct Cli {
    /// Path to the configuration file
    #[arg(
        short,
        long,
        default_value = "agora.toml",
        env = "AGORA_CONFIG",
        global = true
    )]
    pub config: PathBuf,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Disable colored output
    #[arg(long, global = true)]
    pub no_color: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Answer a query using the configured agents
    Query {
        /// Free-text query
        text: String,

        /// User id for personalized cache entries and ranking
        #[arg(short, long)]
        user: Option<String>,

        /// Overall deadline in milliseconds
        #[arg(short, long)]
        deadline_ms: Option<u64>,

        /// Orchestration mode (optimized or maximum-reliability)
        #[arg(short, long)]
        mode: Option<OrchestrationMode>,

        /// Print the full response as JSON
        #[arg(long)]
        json: bool,
    },

    /// List configured agents and their capabilities
    Agents,

    /// Show configuration information
    Config {
        /// Validate the configuration file and report warnings
        #[arg(long)]
        validate: bool,
    },
}

impl Cli {
    /// Parse CLI arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
