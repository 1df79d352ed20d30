//! Encrypted login datastore and secure storage for Lockwise.
//!
//! This crate provides the two storage collaborators the session layer
//! drives: the login [`Datastore`] and [`SecureStorage`] for small session
//! secrets.  Logins are encrypted at rest with AES-256-GCM under a key
//! derived from the account's scoped key; secure storage uses the OS
//! keychain (or a sealed file fallback).
//!
//! # Modules
//!
//! - [`crypto`]: AES-256-GCM encryption, HKDF and PBKDF2 key derivation.
//! - [`keychain`]: [`SecureStorage`] backends.
//! - [`datastore`]: the async [`Datastore`] trait.
//! - [`sqlite`]: SQLite-backed [`SqliteDatastore`].
//! - [`memory`]: in-process [`MemoryDatastore`].
//! - [`error`]: [`VaultError`] and its conversion to the shared error type.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use lockwise_kernel::{NewCredential, UnlockKey};
//! use lockwise_vault::{Datastore, InitOptions, SqliteDatastore};
//!
//! # async fn example() -> lockwise_kernel::Result<()> {
//! let store = SqliteDatastore::new("data/logins.db");
//! store.open().await?;
//!
//! if !store.is_initialized().await? {
//!     store
//!         .initialize(InitOptions {
//!             scoped_key: UnlockKey::new("scoped-key"),
//!             salt: "account-uid".into(),
//!         })
//!         .await?;
//! }
//!
//! store.unlock(&UnlockKey::new("scoped-key")).await?;
//! store
//!     .add(NewCredential {
//!         origin: "https://example.com".into(),
//!         username: Some("alice".into()),
//!         password: "hunter2".into(),
//!     })
//!     .await?;
//! let logins = store.list().await?;
//! # Ok(())
//! # }
//! ```

pub mod crypto;
pub mod datastore;
pub mod error;
pub mod keychain;
pub mod memory;
pub mod sqlite;

pub use datastore::{Datastore, InitOptions};
pub use error::{Result, VaultError};
pub use keychain::{FileKeychain, MemoryKeychain, SecureStorage, platform_keychain};
#[cfg(target_os = "macos")]
pub use keychain::MacOSKeychain;
pub use memory::MemoryDatastore;
pub use sqlite::SqliteDatastore;
