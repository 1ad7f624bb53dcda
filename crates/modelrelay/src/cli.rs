//! Command-line interface.

use clap::{Parser, Subcommand};

/// modelrelay: single-host LLM execution gateway.
#[derive(Debug, Parser)]
#[command(name = "modelrelay", version, about)]
pub struct Cli {
    /// What to run.
    #[command(subcommand)]
    pub command: Command,
}

/// Top-level commands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the HTTP gateway.
    Serve {
        /// Bind address override (e.g. `0.0.0.0:8023`).
        #[arg(long)]
        bind: Option<String>,
        /// Key-value store URL override.
        #[arg(long)]
        redis_url: Option<String>,
        /// Preset directory override.
        #[arg(long)]
        presets_dir: Option<String>,
        /// Verbose logging (debug level) unless RUST_LOG is set.
        #[arg(long, short)]
        verbose: bool,
    },
    /// List the presets the catalog would load, then exit.
    Presets {
        /// Preset directory override.
        #[arg(long)]
        presets_dir: Option<String>,
    },
}
