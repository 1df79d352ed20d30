//! In-process [`Datastore`] implementation.
//!
//! Behaves like the SQLite datastore without touching disk.  Tests can
//! simulate an unreachable medium with [`MemoryDatastore::set_reachable`]
//! and slow calls with [`MemoryDatastore::set_unlock_delay`] and
//! [`MemoryDatastore::set_list_delay`].

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use lockwise_kernel::{Credential, LockwiseError, NewCredential, Result, UnlockKey};

use crate::datastore::{Datastore, InitOptions, apply_touch, new_login, sort_logins};

#[derive(Default)]
struct MemoryState {
    reachable: bool,
    opened: bool,
    /// Key and salt recorded by `initialize`.
    init: Option<InitOptions>,
    unlocked: bool,
    logins: BTreeMap<String, Credential>,
}

/// A datastore that lives entirely in memory.
pub struct MemoryDatastore {
    state: Mutex<MemoryState>,
    unlock_delay: Mutex<Option<Duration>>,
    list_delay: Mutex<Option<Duration>>,
    unlock_calls: AtomicUsize,
}

impl Default for MemoryDatastore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDatastore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryState {
                reachable: true,
                ..MemoryState::default()
            }),
            unlock_delay: Mutex::new(None),
            list_delay: Mutex::new(None),
            unlock_calls: AtomicUsize::new(0),
        }
    }

    /// A datastore that is already initialized with `key` and `salt`.
    pub fn initialized(key: UnlockKey, salt: impl Into<String>) -> Self {
        let store = Self::new();
        store.lock_state().init = Some(InitOptions {
            scoped_key: key,
            salt: salt.into(),
        });
        store
    }

    fn lock_state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Toggle whether the simulated medium can be reached.
    pub fn set_reachable(&self, reachable: bool) {
        let mut state = self.lock_state();
        state.reachable = reachable;
        if !reachable {
            state.opened = false;
            state.unlocked = false;
        }
    }

    /// Make every `unlock` call take at least `delay`.
    pub fn set_unlock_delay(&self, delay: Option<Duration>) {
        *self
            .unlock_delay
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = delay;
    }

    /// Make every `list` call take at least `delay`.
    pub fn set_list_delay(&self, delay: Option<Duration>) {
        *self
            .list_delay
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = delay;
    }

    /// How many times `unlock` reached the datastore.
    pub fn unlock_calls(&self) -> usize {
        self.unlock_calls.load(Ordering::SeqCst)
    }

    fn unlocked_state(&self) -> Result<MutexGuard<'_, MemoryState>> {
        let state = self.opened_state()?;
        if !state.unlocked {
            return Err(LockwiseError::NotUnlocked);
        }
        Ok(state)
    }

    fn opened_state(&self) -> Result<MutexGuard<'_, MemoryState>> {
        let state = self.lock_state();
        if !state.reachable || !state.opened {
            return Err(LockwiseError::StorageUnavailable {
                reason: "memory datastore is not open".into(),
            });
        }
        Ok(state)
    }
}

#[async_trait]
impl Datastore for MemoryDatastore {
    async fn open(&self) -> Result<()> {
        let mut state = self.lock_state();
        if !state.reachable {
            return Err(LockwiseError::StorageUnavailable {
                reason: "memory datastore unreachable".into(),
            });
        }
        state.opened = true;
        Ok(())
    }

    async fn is_initialized(&self) -> Result<bool> {
        Ok(self.opened_state()?.init.is_some())
    }

    async fn initialize(&self, options: InitOptions) -> Result<()> {
        let mut state = self.opened_state()?;
        if state.init.is_some() {
            return Err(LockwiseError::Internal(
                "datastore already initialized".into(),
            ));
        }
        state.init = Some(options);
        Ok(())
    }

    async fn unlock(&self, key: &UnlockKey) -> Result<()> {
        self.unlock_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self
            .unlock_delay
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.opened_state()?;
        let Some(init) = state.init.as_ref() else {
            return Err(LockwiseError::NotInitialized);
        };
        if init.scoped_key.expose() != key.expose() {
            return Err(LockwiseError::AuthenticationFailed {
                reason: "key does not open the datastore".into(),
            });
        }
        state.unlocked = true;
        Ok(())
    }

    async fn lock(&self) -> Result<()> {
        self.lock_state().unlocked = false;
        Ok(())
    }

    async fn is_locked(&self) -> bool {
        !self.lock_state().unlocked
    }

    async fn list(&self) -> Result<Vec<Credential>> {
        let delay = *self
            .list_delay
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let state = self.unlocked_state()?;
        let mut logins: Vec<Credential> = state.logins.values().cloned().collect();
        sort_logins(&mut logins);
        Ok(logins)
    }

    async fn add(&self, login: NewCredential) -> Result<Credential> {
        let mut state = self.unlocked_state()?;
        let login = new_login(login);
        state.logins.insert(login.id.clone(), login.clone());
        Ok(login)
    }

    async fn remove(&self, id: &str) -> Result<()> {
        let mut state = self.unlocked_state()?;
        state
            .logins
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| LockwiseError::CredentialNotFound { id: id.to_string() })
    }

    async fn touch(&self, id: &str) -> Result<Credential> {
        let mut state = self.unlocked_state()?;
        let login = state
            .logins
            .get_mut(id)
            .ok_or_else(|| LockwiseError::CredentialNotFound { id: id.to_string() })?;
        apply_touch(login);
        Ok(login.clone())
    }

    async fn reset(&self) -> Result<()> {
        let mut state = self.opened_state()?;
        state.logins.clear();
        state.init = None;
        state.unlocked = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(s: &str) -> UnlockKey {
        UnlockKey::new(s)
    }

    fn login(origin: &str, user: &str) -> NewCredential {
        NewCredential {
            origin: origin.into(),
            username: Some(user.into()),
            password: "pw".into(),
        }
    }

    #[tokio::test]
    async fn operations_before_open_are_unavailable() {
        let store = MemoryDatastore::initialized(key("k"), "uid");
        let err = store.unlock(&key("k")).await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn unlock_checks_key() {
        let store = MemoryDatastore::initialized(key("k"), "uid");
        store.open().await.unwrap();

        let err = store.unlock(&key("bad")).await.unwrap_err();
        assert!(matches!(err, LockwiseError::AuthenticationFailed { .. }));
        assert!(store.is_locked().await);

        store.unlock(&key("k")).await.unwrap();
        assert!(!store.is_locked().await);
        assert_eq!(store.unlock_calls(), 2);
    }

    #[tokio::test]
    async fn uninitialized_unlock_fails() {
        let store = MemoryDatastore::new();
        store.open().await.unwrap();
        assert!(!store.is_initialized().await.unwrap());
        assert_eq!(
            store.unlock(&key("k")).await.unwrap_err(),
            LockwiseError::NotInitialized
        );
    }

    #[tokio::test]
    async fn list_requires_unlock() {
        let store = MemoryDatastore::initialized(key("k"), "uid");
        store.open().await.unwrap();
        assert_eq!(
            store.list().await.unwrap_err(),
            LockwiseError::NotUnlocked
        );
    }

    #[tokio::test]
    async fn touch_bumps_usage() {
        let store = MemoryDatastore::initialized(key("k"), "uid");
        store.open().await.unwrap();
        store.unlock(&key("k")).await.unwrap();

        let added = store.add(login("https://a.example", "ann")).await.unwrap();
        store.touch(&added.id).await.unwrap();
        let touched = store.touch(&added.id).await.unwrap();

        assert_eq!(touched.times_used, 2);
        assert!(touched.last_used_at.is_some());
        assert!(matches!(
            store.touch("missing").await,
            Err(LockwiseError::CredentialNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn unreachable_medium() {
        let store = MemoryDatastore::new();
        store.set_reachable(false);
        assert!(store.open().await.unwrap_err().is_retryable());

        store.set_reachable(true);
        store.open().await.unwrap();
    }

    #[tokio::test]
    async fn reset_clears_everything() {
        let store = MemoryDatastore::initialized(key("k"), "uid");
        store.open().await.unwrap();
        store.unlock(&key("k")).await.unwrap();
        store.add(login("https://a.example", "ann")).await.unwrap();

        store.reset().await.unwrap();
        assert!(store.is_locked().await);
        assert!(!store.is_initialized().await.unwrap());
    }
}
