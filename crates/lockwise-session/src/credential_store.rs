//! The credential store.
//!
//! [`CredentialStore`] is the single owner of lock state and of the cached
//! login list.  It is a thin adapter over a [`Datastore`]: every operation
//! that touches the datastore runs under one async mutex, so state changes
//! never overlap.  Lock state is published twice over: as an observable
//! [`StateChannel`] (latest value plus updates) and as
//! [`Action::LockStateChanged`] on the bus for every effective transition.
//!
//! Unlock attempts are coalesced.  While one is in flight every further
//! `unlock` call joins it and receives the same result.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use lockwise_kernel::{
    Action, ActionBus, ActionKind, Credential, DataStoreAction, ListenerHandle, LockState,
    LockwiseError, NewCredential, Result, SecretValue, ServiceIdentifier, StateChannel,
    StateObserver, StateReceiver, SyncCredential, UnlockKey,
};
use lockwise_vault::{Datastore, InitOptions, SecureStorage};

/// Secure-storage key of the serialized account session.
pub const ACCOUNT_SESSION_KEY: &str = "account-session";
/// Secure-storage key of the scoped key that unlocks the datastore.
pub const LOGINS_KEY: &str = "logins-key";

type UnlockAttempt = Shared<BoxFuture<'static, Result<()>>>;

fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ---------------------------------------------------------------------------
// Credential list
// ---------------------------------------------------------------------------

/// A snapshot of the logins, optionally narrowed to one service.
///
/// Filtering happens while iterating, and [`iter`](Self::iter) can be
/// called any number of times.
#[derive(Debug, Clone)]
pub struct CredentialList {
    items: Arc<[Credential]>,
    filter: Option<ServiceIdentifier>,
}

impl CredentialList {
    fn new(items: Arc<[Credential]>, filter: Option<ServiceIdentifier>) -> Self {
        Self { items, filter }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Credential> + '_ {
        self.items.iter().filter(move |credential| {
            self.filter
                .as_ref()
                .is_none_or(|service| service.matches(&credential.origin))
        })
    }

    pub fn filter(&self) -> Option<&ServiceIdentifier> {
        self.filter.as_ref()
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.iter().next().is_none()
    }

    pub fn to_vec(&self) -> Vec<Credential> {
        self.iter().cloned().collect()
    }
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Owner of lock state and the login cache.  Cheap to clone.
#[derive(Clone)]
pub struct CredentialStore {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    datastore: Arc<dyn Datastore>,
    keychain: Arc<dyn SecureStorage>,
    bus: ActionBus,
    state: StateChannel<LockState>,
    /// Serializes every datastore operation and lock state transition.
    ops: tokio::sync::Mutex<()>,
    inflight: Mutex<Option<UnlockAttempt>>,
    cache: Mutex<Arc<[Credential]>>,
    session: Mutex<Option<SyncCredential>>,
}

impl CredentialStore {
    pub fn new(
        datastore: Arc<dyn Datastore>,
        keychain: Arc<dyn SecureStorage>,
        bus: ActionBus,
    ) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                datastore,
                keychain,
                bus,
                state: StateChannel::new(LockState::Locked, 64),
                ops: tokio::sync::Mutex::new(()),
                inflight: Mutex::new(None),
                cache: Mutex::new(Arc::from(Vec::new())),
                session: Mutex::new(None),
            }),
        }
    }

    pub fn state(&self) -> LockState {
        self.inner.state.get()
    }

    /// Read-only lock state handle for other components.
    pub fn observe_state(&self) -> StateObserver<LockState> {
        self.inner.state.observer()
    }

    /// Current lock state followed by every transition.
    pub fn subscribe_state(&self) -> StateReceiver<LockState> {
        self.inner.state.subscribe()
    }

    /// The merged account session, if one has been supplied.
    pub fn session(&self) -> Option<SyncCredential> {
        guard(&self.inner.session).clone()
    }

    /// Whether a scoped key is available for unlocking without input.
    pub fn has_stored_key(&self) -> bool {
        matches!(self.inner.keychain.retrieve(LOGINS_KEY), Ok(Some(_)))
    }

    /// Prepare the datastore and reload the persisted account session.
    ///
    /// Failure is also published as an error action.
    pub async fn open(&self) -> Result<()> {
        let result = {
            let _ops = self.inner.ops.lock().await;
            self.inner.ensure_open().await
        };
        match result {
            Ok(()) => {
                self.inner.load_session();
                Ok(())
            }
            Err(err) => {
                tracing::warn!(error = %err, "failed to open credential datastore");
                self.inner.bus.publish(Action::error(err.clone(), "open"));
                Err(err)
            }
        }
    }

    /// Unlock with `key`, or with the stored scoped key when `key` is `None`.
    ///
    /// Joins the in-flight attempt if there is one.  Returns immediately
    /// when already unlocked.
    pub async fn unlock(&self, key: Option<UnlockKey>) -> Result<()> {
        let attempt = {
            let mut inflight = guard(&self.inner.inflight);
            match inflight.as_ref() {
                Some(attempt) => {
                    tracing::debug!("joining in-flight unlock");
                    attempt.clone()
                }
                None => {
                    if self.inner.state.get() == LockState::Unlocked {
                        return Ok(());
                    }
                    let attempt = self.spawn_unlock(key);
                    *inflight = Some(attempt.clone());
                    attempt
                }
            }
        };
        attempt.await
    }

    fn spawn_unlock(&self, key: Option<UnlockKey>) -> UnlockAttempt {
        let inner = Arc::clone(&self.inner);
        let task = tokio::spawn(async move {
            let result = inner.run_unlock(key).await;
            if let Err(err) = &result {
                inner.bus.publish(Action::error(err.clone(), "unlock"));
            }
            guard(&inner.inflight).take();
            result
        });
        async move {
            task.await.unwrap_or_else(|e| {
                Err(LockwiseError::Internal(format!("unlock task failed: {e}")))
            })
        }
        .boxed()
        .shared()
    }

    /// Lock the store.  Locking a locked store does nothing.
    pub async fn lock(&self) {
        let _ops = self.inner.ops.lock().await;
        self.inner.lock_now().await;
    }

    /// Logins visible to autofill, optionally narrowed to `service`.
    ///
    /// Fails with `NotUnlocked` unless the store is unlocked.
    pub async fn list(&self, service: Option<&ServiceIdentifier>) -> Result<CredentialList> {
        let _ops = self.inner.ops.lock().await;
        self.inner.require_unlocked()?;
        let items = self.inner.refresh_cache().await?;
        Ok(CredentialList::new(items, service.cloned()))
    }

    /// The cached login with `id`.  `None` when absent or locked.
    pub fn get(&self, id: &str) -> Option<Credential> {
        if self.inner.state.get() != LockState::Unlocked {
            return None;
        }
        guard(&self.inner.cache)
            .iter()
            .find(|credential| credential.id == id)
            .cloned()
    }

    /// Merge account metadata into the session context and persist it.
    ///
    /// A supplied scoped key is stored for later unlocks and initializes
    /// the datastore if it has never been initialized.  Stored logins are
    /// not touched.
    pub async fn update_credentials(&self, info: SyncCredential) -> Result<()> {
        let _ops = self.inner.ops.lock().await;
        let merged = {
            let mut session = guard(&self.inner.session);
            let mut current = session.take().unwrap_or_default();
            current.merge(info);
            *session = Some(current.clone());
            current
        };

        let blob = serde_json::to_string(&merged)
            .map_err(|e| LockwiseError::Internal(format!("failed to encode session: {e}")))?;
        self.inner
            .keychain
            .store(ACCOUNT_SESSION_KEY, &SecretValue::new(blob))?;

        if let Some(scoped_key) = merged.scoped_key.as_ref() {
            self.inner.keychain.store(LOGINS_KEY, scoped_key)?;
            self.inner.ensure_open().await?;
            if !self.inner.datastore.is_initialized().await? {
                self.inner
                    .datastore
                    .initialize(InitOptions {
                        scoped_key: UnlockKey::from(scoped_key.clone()),
                        salt: merged.uid.clone(),
                    })
                    .await?;
                tracing::info!(uid = %merged.uid, "credential datastore initialized");
            }
        }
        tracing::debug!(uid = %merged.uid, "account session updated");
        Ok(())
    }

    pub async fn add(&self, login: NewCredential) -> Result<Credential> {
        let _ops = self.inner.ops.lock().await;
        self.inner.require_unlocked()?;
        let credential = self.inner.datastore.add(login).await?;
        self.inner.refresh_cache().await?;
        tracing::debug!(id = %credential.id, "login added");
        Ok(credential)
    }

    pub async fn remove(&self, id: &str) -> Result<()> {
        let _ops = self.inner.ops.lock().await;
        self.inner.require_unlocked()?;
        self.inner.datastore.remove(id).await?;
        self.inner.refresh_cache().await?;
        tracing::debug!(id, "login removed");
        Ok(())
    }

    /// Record a use of the login with `id`.
    pub async fn touch(&self, id: &str) -> Result<Credential> {
        let _ops = self.inner.ops.lock().await;
        self.inner.require_unlocked()?;
        let credential = self.inner.datastore.touch(id).await?;
        self.inner.refresh_cache().await?;
        Ok(credential)
    }

    /// Wipe the datastore and every local trace of the account.
    pub async fn reset(&self) -> Result<()> {
        let _ops = self.inner.ops.lock().await;
        *guard(&self.inner.cache) = Arc::from(Vec::new());
        guard(&self.inner.session).take();
        self.inner.keychain.delete(ACCOUNT_SESSION_KEY)?;
        self.inner.keychain.delete(LOGINS_KEY)?;
        self.inner.set_state(LockState::Locked);

        self.inner.ensure_open().await?;
        self.inner.datastore.reset().await?;
        tracing::info!("credential store reset");
        Ok(())
    }

    /// Spawn the bus listener that maps `DataStore` actions onto this store.
    pub fn listen(&self) -> ListenerHandle {
        let mut actions = self.inner.bus.subscribe_kinds(&[ActionKind::DataStore]);
        let store = self.clone();
        ListenerHandle::new(
            "credential-store",
            tokio::spawn(async move {
                while let Some(action) = actions.next().await {
                    if let Action::DataStore(action) = action.as_ref() {
                        store.handle(action.clone()).await;
                    }
                }
            }),
        )
    }

    async fn handle(&self, action: DataStoreAction) {
        let (context, result) = match action {
            // Unlock publishes its own failures; lock cannot fail.
            DataStoreAction::Unlock { key } => {
                let _ = self.unlock(key).await;
                return;
            }
            DataStoreAction::Lock => {
                self.lock().await;
                return;
            }
            DataStoreAction::Reset => ("reset", self.reset().await),
            DataStoreAction::UpdateCredentials(info) => {
                ("update_credentials", self.update_credentials(info).await)
            }
            DataStoreAction::Touch { id } => ("touch", self.touch(&id).await.map(drop)),
            DataStoreAction::Add(login) => ("add", self.add(login).await.map(drop)),
            DataStoreAction::Remove { id } => ("remove", self.remove(&id).await),
        };
        if let Err(err) = result {
            tracing::warn!(context, error = %err, "datastore action failed");
            self.inner.bus.publish(Action::error(err, context));
        }
    }
}

impl StoreInner {
    fn set_state(&self, next: LockState) {
        if self.state.set(next) {
            tracing::debug!(state = %next, "lock state changed");
            self.bus.publish(Action::LockStateChanged(next));
        }
    }

    fn require_unlocked(&self) -> Result<()> {
        match self.state.get() {
            LockState::Unlocked => Ok(()),
            _ => Err(LockwiseError::NotUnlocked),
        }
    }

    async fn ensure_open(&self) -> Result<()> {
        self.datastore.open().await
    }

    fn load_session(&self) {
        let stored = match self.keychain.retrieve(ACCOUNT_SESSION_KEY) {
            Ok(Some(stored)) => stored,
            Ok(None) => return,
            Err(err) => {
                tracing::warn!(error = %err, "failed to read stored account session");
                return;
            }
        };
        match serde_json::from_str::<SyncCredential>(stored.expose()) {
            Ok(session) => {
                tracing::debug!(uid = %session.uid, "restored account session");
                *guard(&self.session) = Some(session);
            }
            Err(err) => tracing::warn!(error = %err, "ignoring unreadable account session"),
        }
    }

    async fn refresh_cache(&self) -> Result<Arc<[Credential]>> {
        let items: Arc<[Credential]> = Arc::from(self.datastore.list().await?);
        *guard(&self.cache) = Arc::clone(&items);
        Ok(items)
    }

    async fn run_unlock(&self, key: Option<UnlockKey>) -> Result<()> {
        let _ops = self.ops.lock().await;
        if self.state.get() == LockState::Unlocked {
            return Ok(());
        }

        self.set_state(LockState::Unlocking);
        match self.try_unlock(key).await {
            Ok(count) => {
                self.set_state(LockState::Unlocked);
                tracing::info!(logins = count, "credential store unlocked");
                Ok(())
            }
            Err(err) => {
                if let Err(lock_err) = self.datastore.lock().await {
                    tracing::warn!(error = %lock_err, "failed to relock datastore");
                }
                self.set_state(LockState::Locked);
                tracing::warn!(error = %err, "unlock failed");
                Err(err)
            }
        }
    }

    async fn try_unlock(&self, key: Option<UnlockKey>) -> Result<usize> {
        self.ensure_open().await?;
        if !self.datastore.is_initialized().await? {
            return Err(LockwiseError::NotInitialized);
        }

        let key = match key {
            Some(key) => key,
            None => self
                .keychain
                .retrieve(LOGINS_KEY)?
                .map(UnlockKey::from)
                .ok_or_else(|| LockwiseError::AuthenticationFailed {
                    reason: "no stored key".into(),
                })?,
        };

        self.datastore.unlock(&key).await?;
        Ok(self.refresh_cache().await?.len())
    }

    async fn lock_now(&self) {
        *guard(&self.cache) = Arc::from(Vec::new());
        if self.state.get() == LockState::Locked {
            return;
        }
        if let Err(err) = self.datastore.lock().await {
            tracing::warn!(error = %err, "failed to lock datastore");
        }
        self.set_state(LockState::Locked);
        tracing::info!("credential store locked");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
