//! The backing login datastore.
//!
//! [`Datastore`] is the async seam between the credential store and the
//! embedded storage engine.  Two implementations ship with this crate:
//! [`SqliteDatastore`](crate::SqliteDatastore) for real use and
//! [`MemoryDatastore`](crate::MemoryDatastore) for tests and demos.
//!
//! Every method returns the shared [`lockwise_kernel::Result`] so failures
//! can be published on the action bus unchanged.

use async_trait::async_trait;
use lockwise_kernel::{Credential, NewCredential, Result, UnlockKey};

/// Options for first-time initialization.
#[derive(Debug, Clone)]
pub struct InitOptions {
    /// Key that will unlock the datastore from now on.
    pub scoped_key: UnlockKey,
    /// Account-specific salt (the account uid).
    pub salt: String,
}

/// Asynchronous login datastore.
///
/// A datastore moves through three conditions: closed, open but locked, and
/// unlocked.  `open` is idempotent.  Login operations (`list`, `add`,
/// `remove`, `touch`) require the unlocked condition.
#[async_trait]
pub trait Datastore: Send + Sync {
    /// Prepare the backing medium.  Fails with `StorageUnavailable` when it
    /// cannot be reached.
    async fn open(&self) -> Result<()>;

    /// Whether [`initialize`](Self::initialize) has ever succeeded.
    async fn is_initialized(&self) -> Result<bool>;

    /// Set up an empty datastore protected by `options.scoped_key`.
    async fn initialize(&self, options: InitOptions) -> Result<()>;

    /// Unlock with `key`.  Fails with `AuthenticationFailed` when the key
    /// does not match and `NotInitialized` before initialization.
    async fn unlock(&self, key: &UnlockKey) -> Result<()>;

    /// Forget the unlocked key.  Locking a locked datastore is a no-op.
    async fn lock(&self) -> Result<()>;

    async fn is_locked(&self) -> bool;

    /// Every stored login, ordered by origin then username.
    async fn list(&self) -> Result<Vec<Credential>>;

    /// Store a new login and return it with its assigned id.
    async fn add(&self, login: NewCredential) -> Result<Credential>;

    async fn remove(&self, id: &str) -> Result<()>;

    /// Record a use of the login: bump `times_used` and set `last_used_at`.
    /// Concurrent touches are applied in arrival order; the last write wins.
    async fn touch(&self, id: &str) -> Result<Credential>;

    /// Delete every login and the initialization record.  The datastore
    /// stays open, locked and uninitialized.
    async fn reset(&self) -> Result<()>;
}

/// Sort order shared by every implementation.
pub(crate) fn sort_logins(logins: &mut [Credential]) {
    logins.sort_by(|a, b| {
        a.origin
            .cmp(&b.origin)
            .then_with(|| a.username.cmp(&b.username))
            .then_with(|| a.id.cmp(&b.id))
    });
}

/// Build a fresh login record from an add request.
pub(crate) fn new_login(login: NewCredential) -> Credential {
    Credential {
        id: uuid::Uuid::now_v7().to_string(),
        origin: login.origin,
        username: login.username,
        password: login.password,
        modified_at: chrono::Utc::now(),
        last_used_at: None,
        times_used: 0,
    }
}

/// Apply a use to `login`.
pub(crate) fn apply_touch(login: &mut Credential) {
    login.last_used_at = Some(chrono::Utc::now());
    login.times_used = login.times_used.saturating_add(1);
}
