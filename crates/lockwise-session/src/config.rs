//! Session configuration.
//!
//! Loaded from a TOML file with `LOCKWISE_*` environment overrides.  A
//! missing file yields the defaults:
//!
//! ```toml
//! [auto_lock]
//! setting = "five_minutes"
//! tick_interval_secs = 15
//!
//! [session]
//! display_grace_ms = 1500
//! relock_after_autofill = false
//! bus_capacity = 256
//! app_build = 1
//!
//! [storage]
//! data_dir = "data"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use lockwise_kernel::AutoLockSetting;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SessionError};

/// Environment variable overriding `auto_lock.setting`.
pub const ENV_AUTO_LOCK: &str = "LOCKWISE_AUTO_LOCK";
/// Environment variable overriding `storage.data_dir`.
pub const ENV_DATA_DIR: &str = "LOCKWISE_DATA_DIR";
/// Environment variable overriding `session.display_grace_ms`.
pub const ENV_DISPLAY_GRACE_MS: &str = "LOCKWISE_DISPLAY_GRACE_MS";

/// Largest bus capacity the broadcast channel accepts.
const MAX_BUS_CAPACITY: usize = usize::MAX / 2;

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub auto_lock: AutoLockConfig,
    pub session: SessionSettings,
    pub storage: StorageConfig,
}

/// `[auto_lock]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoLockConfig {
    /// Default idle timeout; the user's runtime choice overrides it.
    pub setting: AutoLockSetting,
    /// Period of the background deadline check.
    pub tick_interval_secs: u64,
}

impl Default for AutoLockConfig {
    fn default() -> Self {
        Self {
            setting: AutoLockSetting::FiveMinutes,
            tick_interval_secs: 15,
        }
    }
}

impl AutoLockConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs.max(1))
    }
}

/// `[session]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    /// Delay between the list becoming `Populated` and `ExtensionConfigured`.
    pub display_grace_ms: u64,
    /// Relock flag attached to logins picked through `provide_credential`.
    pub relock_after_autofill: bool,
    pub bus_capacity: usize,
    /// Build number of this binary, compared against the last run's.
    pub app_build: u32,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            display_grace_ms: 1500,
            relock_after_autofill: false,
            bus_capacity: 256,
            app_build: 1,
        }
    }
}

impl SessionSettings {
    pub fn display_grace(&self) -> Duration {
        Duration::from_millis(self.display_grace_ms)
    }
}

/// `[storage]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
        }
    }
}

impl SessionConfig {
    /// Load from `path` (defaults when the file does not exist), then apply
    /// environment overrides.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config = Self::from_toml(&content)?;
            tracing::debug!(path = %path.display(), "loaded configuration file");
            config
        } else {
            tracing::debug!(path = %path.display(), "configuration file missing, using defaults");
            Self::default()
        };
        config.apply_overrides(|name| std::env::var(name).ok())?;
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content).map_err(|e| SessionError::Config {
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the runtime cannot start with.
    pub fn validate(&self) -> Result<()> {
        let capacity = self.session.bus_capacity;
        if capacity == 0 || capacity > MAX_BUS_CAPACITY {
            return Err(SessionError::Config {
                reason: format!(
                    "session.bus_capacity must be between 1 and {MAX_BUS_CAPACITY}, got {capacity}"
                ),
            });
        }
        Ok(())
    }

    /// Apply overrides looked up through `lookup` (normally the process
    /// environment).
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup(ENV_AUTO_LOCK) {
            self.auto_lock.setting =
                AutoLockSetting::parse(value.trim()).ok_or_else(|| SessionError::Config {
                    reason: format!("{ENV_AUTO_LOCK}: unknown auto-lock setting {value:?}"),
                })?;
        }
        if let Some(value) = lookup(ENV_DATA_DIR) {
            self.storage.data_dir = PathBuf::from(value);
        }
        if let Some(value) = lookup(ENV_DISPLAY_GRACE_MS) {
            self.session.display_grace_ms =
                value.trim().parse().map_err(|_| SessionError::Config {
                    reason: format!("{ENV_DISPLAY_GRACE_MS}: expected milliseconds, got {value:?}"),
                })?;
        }
        self.validate()
    }
}
