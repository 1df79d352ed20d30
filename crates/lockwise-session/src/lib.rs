//! Lock and session lifecycle for Lockwise.
//!
//! Three components cooperate over the kernel's [`ActionBus`]:
//!
//! - [`CredentialStore`] owns lock state and the login cache and adapts a
//!   [`lockwise_vault::Datastore`].
//! - [`AutoLockTimer`] owns the idle deadline and requests a lock when it
//!   passes.
//! - [`SessionCoordinator`] sequences unlock, populate and ready for the
//!   autofill extension and notifies the [`HostShell`].
//!
//! [`AppContext`] constructs them once and keeps their listeners alive.
//!
//! ```rust,no_run
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! use lockwise_session::{AppContext, HostShell, SessionConfig, SystemClock};
//! use lockwise_vault::{MemoryKeychain, SqliteDatastore};
//!
//! # async fn example(host: Arc<dyn HostShell>) -> lockwise_session::Result<()> {
//! let config = SessionConfig::load(Path::new("lockwise.toml"))?;
//! let datastore = SqliteDatastore::new(SqliteDatastore::default_path(&config.storage.data_dir));
//! let mut context = AppContext::start(
//!     config,
//!     Arc::new(datastore),
//!     Arc::new(MemoryKeychain::new()),
//!     host,
//!     Arc::new(SystemClock),
//! )
//! .await?;
//!
//! context.coordinator().extension_configuration_requested(None);
//! context.shutdown();
//! # Ok(())
//! # }
//! ```
//!
//! [`ActionBus`]: lockwise_kernel::ActionBus

pub mod auto_lock;
pub mod clock;
pub mod config;
pub mod context;
pub mod coordinator;
pub mod credential_store;
pub mod error;

pub use auto_lock::{AutoLockTimer, RestoreOutcome};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{AutoLockConfig, SessionConfig, SessionSettings, StorageConfig};
pub use context::AppContext;
pub use coordinator::{HostShell, SessionCoordinator};
pub use credential_store::{CredentialList, CredentialStore};
pub use error::{Result, SessionError};
