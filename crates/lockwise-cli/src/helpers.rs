//! Shared helper functions used across CLI subcommands.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use lockwise_session::SessionConfig;
use lockwise_vault::{SecureStorage, SqliteDatastore, platform_keychain};
use tracing_subscriber::EnvFilter;

// ---------------------------------------------------------------------------
// Tracing
// ---------------------------------------------------------------------------

/// Initialize the tracing subscriber with the given default log level.
pub fn init_tracing(default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}

// ---------------------------------------------------------------------------
// Configuration and storage
// ---------------------------------------------------------------------------

/// Load `.env`, then the configuration file with environment overrides.
pub fn load_config(path: &Path) -> Result<SessionConfig> {
    if let Err(e) = dotenvy::dotenv()
        && !e.not_found()
    {
        tracing::warn!(error = %e, "failed to read .env file");
    }
    SessionConfig::load(path)
        .with_context(|| format!("failed to load configuration from {}", path.display()))
}

/// The SQLite datastore and platform keychain under `data_dir`.
pub fn open_storage(data_dir: &Path) -> Result<(Arc<SqliteDatastore>, Arc<dyn SecureStorage>)> {
    if !data_dir.exists() {
        std::fs::create_dir_all(data_dir).context("failed to create data directory")?;
    }
    let datastore = Arc::new(SqliteDatastore::new(SqliteDatastore::default_path(data_dir)));
    let keychain: Arc<dyn SecureStorage> = Arc::from(platform_keychain(data_dir));
    tracing::debug!(path = %data_dir.display(), "storage ready");
    Ok((datastore, keychain))
}
