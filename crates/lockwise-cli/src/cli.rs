//! CLI argument definitions for Lockwise.
//!
//! All `clap` structures live here so that `main.rs` stays focused on
//! dispatching subcommands.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Lockwise -- session and auto-lock core of a password manager.
#[derive(Parser)]
#[command(
    name = "lockwise",
    version,
    about = "Lockwise -- password manager session and auto-lock core",
    long_about = "Drives the credential store, idle auto-lock and autofill coordinator \
                  from the terminal."
)]
pub struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, short, global = true, default_value = "lockwise.toml")]
    pub config: PathBuf,

    /// Default log level when `RUST_LOG` is not set.
    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start a session and read commands from stdin.
    Run,

    /// Show the effective configuration and persisted session state.
    Status,

    /// Wipe the datastore and every secure-storage entry.
    Reset {
        /// Skip the confirmation prompt.
        #[arg(long, short)]
        yes: bool,
    },
}
