//! Autofill session coordination.
//!
//! The [`SessionCoordinator`] sequences the credential-provider flow:
//! unlock, populate the list for the requested service, hand it to the
//! host, and signal `ExtensionConfigured` once a short display grace has
//! passed.  It talks to the host through the [`HostShell`] notification
//! trait and to everything else through the bus.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use lockwise_kernel::{
    Action, ActionBus, ActionKind, CancelReason, Credential, CredentialProviderAction,
    CredentialStatusAction, DataStoreAction, ListenerHandle, LockState, PopulateState,
    ServiceIdentifier, StateChannel, StateReceiver, SyncCredential,
};
use tokio::task::JoinHandle;

use crate::config::SessionSettings;
use crate::credential_store::{CredentialList, CredentialStore};

/// Notifications delivered to the host application or extension.
///
/// Pure notifications: nothing is returned and implementations should not
/// block.
pub trait HostShell: Send + Sync {
    /// Ask the user to authenticate.
    fn display_welcome(&self);

    fn display_item_list(&self, list: &CredentialList);

    /// Configuration (or list selection) is ready.
    fn complete_extension_configuration_request(&self);

    /// Hand the chosen login back to the requesting app.
    fn complete_request(&self, credential: &Credential);

    fn cancel_request(&self, reason: CancelReason);
}

fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Drives the populate state machine.  Cheap to clone.
#[derive(Clone)]
pub struct SessionCoordinator {
    inner: Arc<CoordinatorInner>,
}

struct CoordinatorInner {
    bus: ActionBus,
    store: CredentialStore,
    host: Arc<dyn HostShell>,
    populate: StateChannel<PopulateState>,
    /// Refresh requested while locked, replayed on unlock.
    pending: Mutex<Option<Option<ServiceIdentifier>>>,
    task: Mutex<Option<JoinHandle<()>>>,
    /// Bumped on every new or cancelled populate; stale tasks check it.
    generation: AtomicU64,
    items: Mutex<Option<CredentialList>>,
    display_grace: Duration,
    relock_after_autofill: bool,
}

impl SessionCoordinator {
    pub fn new(
        bus: ActionBus,
        store: CredentialStore,
        host: Arc<dyn HostShell>,
        settings: &SessionSettings,
    ) -> Self {
        Self {
            inner: Arc::new(CoordinatorInner {
                bus,
                store,
                host,
                populate: StateChannel::new(PopulateState::NotAllowed, 16),
                pending: Mutex::new(None),
                task: Mutex::new(None),
                generation: AtomicU64::new(0),
                items: Mutex::new(None),
                display_grace: settings.display_grace(),
                relock_after_autofill: settings.relock_after_autofill,
            }),
        }
    }

    pub fn populate_state(&self) -> PopulateState {
        self.inner.populate.get()
    }

    pub fn subscribe_populate(&self) -> StateReceiver<PopulateState> {
        self.inner.populate.subscribe()
    }

    /// The most recently populated list, until the next lock or cancel.
    pub fn items(&self) -> Option<CredentialList> {
        guard(&self.inner.items).clone()
    }

    /// Recompute the autofill list for `service`.
    ///
    /// While the store is not unlocked the request is remembered, the host
    /// is asked to authenticate, and the refresh runs once unlocked.
    pub fn refresh(&self, service: Option<ServiceIdentifier>) {
        if self.inner.store.state() != LockState::Unlocked {
            tracing::debug!("refresh while locked, requesting authentication");
            *guard(&self.inner.pending) = Some(service);
            self.inner
                .bus
                .publish(Action::CredentialProvider(
                    CredentialProviderAction::AuthenticationRequested,
                ));
            return;
        }

        let mut task = guard(&self.inner.task);
        if let Some(previous) = task.take() {
            previous.abort();
        }
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.populate.set(PopulateState::Populating);

        let inner = Arc::clone(&self.inner);
        *task = Some(tokio::spawn(inner.populate(generation, service)));
    }

    /// The host asked for the extension to be configured for `service`.
    pub fn extension_configuration_requested(&self, service: Option<ServiceIdentifier>) {
        self.inner
            .bus
            .publish(Action::CredentialProvider(CredentialProviderAction::Refresh {
                service,
            }));
    }

    /// The host asked for the login with `id` without showing the list.
    ///
    /// Uses the configured relock-after-autofill flag.
    pub fn provide_credential(&self, id: &str) {
        self.select(id, self.inner.relock_after_autofill);
    }

    /// Select the login with `id`, relocking afterwards when `relock` is set.
    ///
    /// While locked the host is asked to authenticate and the request is
    /// cancelled as needing user interaction.
    pub fn select(&self, id: &str, relock: bool) {
        let bus = &self.inner.bus;
        if self.inner.store.state() != LockState::Unlocked {
            bus.publish(Action::CredentialProvider(
                CredentialProviderAction::AuthenticationRequested,
            ));
            bus.publish(Action::CredentialStatus(CredentialStatusAction::UserCancelled {
                reason: CancelReason::UserInteractionRequired,
            }));
            return;
        }

        let action = match self.inner.store.get(id) {
            Some(credential) => CredentialStatusAction::LoginSelected { credential, relock },
            None => {
                tracing::debug!(id, "requested login not found");
                CredentialStatusAction::UserCancelled {
                    reason: CancelReason::CredentialIdentityNotFound,
                }
            }
        };
        bus.publish(Action::CredentialStatus(action));
    }

    /// The user dismissed the extension.
    pub fn cancel(&self, reason: CancelReason) {
        self.inner
            .bus
            .publish(Action::CredentialStatus(CredentialStatusAction::UserCancelled {
                reason,
            }));
    }

    /// Account session info arrived from the identity provider.
    pub fn account_session_available(&self, info: SyncCredential) {
        self.inner
            .bus
            .publish(Action::DataStore(DataStoreAction::UpdateCredentials(info)));
    }

    pub fn listen(&self) -> ListenerHandle {
        let mut actions = self.inner.bus.subscribe_kinds(&[
            ActionKind::CredentialProvider,
            ActionKind::CredentialStatus,
            ActionKind::LockState,
        ]);
        let coordinator = self.clone();
        ListenerHandle::new(
            "session-coordinator",
            tokio::spawn(async move {
                while let Some(action) = actions.next().await {
                    coordinator.handle(&action);
                }
            }),
        )
    }

    fn handle(&self, action: &Action) {
        let host = &self.inner.host;
        match action {
            Action::CredentialProvider(CredentialProviderAction::Refresh { service }) => {
                self.refresh(service.clone());
            }
            Action::CredentialProvider(CredentialProviderAction::AuthenticationRequested) => {
                host.display_welcome();
            }
            Action::CredentialStatus(CredentialStatusAction::ExtensionConfigured) => {
                host.complete_extension_configuration_request();
            }
            Action::CredentialStatus(CredentialStatusAction::LoginSelected {
                credential,
                relock,
            }) => {
                host.complete_request(credential);
                self.inner
                    .bus
                    .publish(Action::DataStore(DataStoreAction::Touch {
                        id: credential.id.clone(),
                    }));
                if *relock {
                    self.inner.bus.publish(Action::DataStore(DataStoreAction::Lock));
                }
            }
            Action::CredentialStatus(CredentialStatusAction::UserCancelled { reason }) => {
                self.inner.cancel_populate();
                host.cancel_request(*reason);
            }
            Action::LockStateChanged(LockState::Locked) => self.inner.cancel_populate(),
            Action::LockStateChanged(LockState::Unlocked) => {
                let pending = guard(&self.inner.pending).take();
                if let Some(service) = pending {
                    self.inner
                        .bus
                        .publish(Action::CredentialProvider(
                            CredentialProviderAction::Authenticated,
                        ));
                    self.refresh(service);
                }
            }
            _ => {}
        }
    }
}

impl CoordinatorInner {
    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    async fn populate(self: Arc<Self>, generation: u64, service: Option<ServiceIdentifier>) {
        match self.store.list(service.as_ref()).await {
            Ok(list) => {
                if !self.is_current(generation) {
                    return;
                }
                self.populate.set(PopulateState::Populated);
                *guard(&self.items) = Some(list.clone());
                tracing::debug!(count = list.len(), "credential list populated");
                self.host.display_item_list(&list);

                tokio::time::sleep(self.display_grace).await;
                if self.is_current(generation) {
                    self.bus.publish(Action::CredentialStatus(
                        CredentialStatusAction::ExtensionConfigured,
                    ));
                }
            }
            Err(err) => {
                if !self.is_current(generation) {
                    return;
                }
                self.populate.set(PopulateState::NotAllowed);
                tracing::warn!(error = %err, "failed to populate credential list");
                self.bus.publish(Action::error(err, "populate"));
            }
        }
    }

    fn cancel_populate(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(task) = guard(&self.task).take() {
            task.abort();
        }
        if self.populate.set(PopulateState::NotAllowed) {
            tracing::debug!("populate discarded");
        }
        guard(&self.items).take();
    }
}
