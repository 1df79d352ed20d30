//! CLI entry point for Lockwise.
//!
//! This binary provides the `lockwise` command with subcommands for running
//! an interactive session, inspecting persisted state, and wiping it.

mod cli;
mod helpers;
mod host;
mod repl;

use std::io::{self, BufRead, Write};
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use lockwise_kernel::{ActionBus, SyncCredential};
use lockwise_session::CredentialStore;
use lockwise_session::auto_lock::{DEADLINE_KEY, SETTING_KEY};
use lockwise_session::context::APP_BUILD_KEY;
use lockwise_session::credential_store::ACCOUNT_SESSION_KEY;
use lockwise_vault::{Datastore, SecureStorage, SqliteDatastore};
use tracing::info;

use crate::cli::{Cli, Commands};
use crate::helpers::{init_tracing, load_config, open_storage};

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    match cli.command {
        Commands::Run => repl::cmd_run(&cli.config).await,
        Commands::Status => cmd_status(&cli.config).await,
        Commands::Reset { yes } => cmd_reset(&cli.config, yes).await,
    }
}

// ---------------------------------------------------------------------------
// Subcommand: status
// ---------------------------------------------------------------------------

async fn cmd_status(config_path: &Path) -> Result<()> {
    let config = load_config(config_path)?;
    let data_dir = config.storage.data_dir.clone();

    println!();
    println!("  Lockwise Status");
    println!("  ===============");
    println!();

    if config_path.exists() {
        println!("  Config:       {}", config_path.display());
    } else {
        println!("  Config:       defaults ({} not found)", config_path.display());
    }
    println!(
        "{}",
        serde_json::to_string_pretty(&config).context("failed to render configuration")?
    );
    println!();

    let db_path = SqliteDatastore::default_path(&data_dir);
    if !db_path.exists() {
        println!("  Datastore:    NOT INITIALIZED ({})", db_path.display());
        println!();
        return Ok(());
    }

    let (datastore, keychain) = open_storage(&data_dir)?;
    datastore.open().await.context("failed to open datastore")?;
    let initialized = datastore.is_initialized().await?;
    println!(
        "  Datastore:    {} ({})",
        if initialized { "OK" } else { "EMPTY" },
        db_path.display()
    );

    let setting = keychain.retrieve(SETTING_KEY)?;
    println!(
        "  Auto-lock:    {}",
        setting.as_ref().map_or("default", |s| s.expose())
    );
    let deadline = keychain.retrieve(DEADLINE_KEY)?;
    println!(
        "  Locks at:     {}",
        deadline.as_ref().map_or("-", |d| d.expose())
    );

    match keychain.retrieve(ACCOUNT_SESSION_KEY)? {
        Some(raw) => match serde_json::from_str::<SyncCredential>(raw.expose()) {
            Ok(session) => println!("  Account:      {}", session.uid),
            Err(e) => println!("  Account:      UNREADABLE ({e})"),
        },
        None => println!("  Account:      not signed in"),
    }
    println!();

    Ok(())
}

// ---------------------------------------------------------------------------
// Subcommand: reset
// ---------------------------------------------------------------------------

async fn cmd_reset(config_path: &Path, yes: bool) -> Result<()> {
    let config = load_config(config_path)?;
    let data_dir = config.storage.data_dir.clone();

    if !yes && !confirm(&format!("Wipe every login under {}?", data_dir.display()))? {
        println!("  Aborted.");
        return Ok(());
    }

    let (datastore, keychain) = open_storage(&data_dir)?;
    let store = CredentialStore::new(
        datastore,
        Arc::clone(&keychain),
        ActionBus::new(config.session.bus_capacity),
    );
    store.reset().await.context("failed to reset credential store")?;

    for key in [DEADLINE_KEY, SETTING_KEY, APP_BUILD_KEY] {
        keychain
            .delete(key)
            .with_context(|| format!("failed to delete `{key}` from secure storage"))?;
    }

    info!(data_dir = %data_dir.display(), "reset complete");
    println!("  Reset complete.");
    Ok(())
}

/// Ask a yes/no question on stdin.  Anything but `y`/`yes` is a no.
fn confirm(question: &str) -> Result<bool> {
    print!("  {question} [y/N] ");
    io::stdout().flush()?;

    let mut answer = String::new();
    io::stdin().lock().read_line(&mut answer)?;
    Ok(matches!(answer.trim().to_lowercase().as_str(), "y" | "yes"))
}
