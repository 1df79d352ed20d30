//! Application context.
//!
//! [`AppContext`] builds the bus and the three session components exactly
//! once and threads them to each other explicitly.  Dropping the context
//! (or calling [`AppContext::shutdown`]) releases every bus listener.

use std::sync::Arc;

use lockwise_kernel::{
    Action, ActionBus, AutoLockSetting, DataStoreAction, LifecycleAction, ListenerHandle,
    SecretValue,
};
use lockwise_vault::{Datastore, SecureStorage};

use crate::auto_lock::{AutoLockTimer, RestoreOutcome};
use crate::clock::Clock;
use crate::config::SessionConfig;
use crate::coordinator::{HostShell, SessionCoordinator};
use crate::credential_store::CredentialStore;
use crate::error::Result;

/// Secure-storage key of the build number that last ran.
pub const APP_BUILD_KEY: &str = "app-build";

pub struct AppContext {
    config: SessionConfig,
    bus: ActionBus,
    store: CredentialStore,
    timer: AutoLockTimer,
    coordinator: SessionCoordinator,
    listeners: Vec<ListenerHandle>,
}

impl AppContext {
    /// Wire up the components, open the store and resume the previous
    /// session when its idle deadline has not passed.
    ///
    /// An unreachable datastore does not fail startup; the failure is
    /// published on the bus and unlocking can be retried later.
    pub async fn start(
        config: SessionConfig,
        datastore: Arc<dyn Datastore>,
        keychain: Arc<dyn SecureStorage>,
        host: Arc<dyn HostShell>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;
        let bus = ActionBus::new(config.session.bus_capacity);
        let store = CredentialStore::new(datastore, Arc::clone(&keychain), bus.clone());
        let timer = AutoLockTimer::new(
            bus.clone(),
            Arc::clone(&keychain),
            clock,
            store.observe_state(),
            &config.auto_lock,
        );
        let coordinator =
            SessionCoordinator::new(bus.clone(), store.clone(), host, &config.session);
        let listeners = vec![store.listen(), timer.listen(), coordinator.listen()];

        if let Err(err) = store.open().await {
            tracing::warn!(error = %err, "starting with an unavailable datastore");
        }

        check_upgrade(&bus, keychain.as_ref(), config.session.app_build)?;
        bus.publish(Action::Lifecycle(LifecycleAction::Startup));

        let outcome = timer.restore();
        let resume = outcome == RestoreOutcome::Resume && store.has_stored_key();
        if resume {
            bus.publish(Action::DataStore(DataStoreAction::Unlock { key: None }));
        }
        tracing::info!(
            build = config.session.app_build,
            auto_lock = %timer.setting(),
            resume,
            "session started"
        );

        Ok(Self {
            config,
            bus,
            store,
            timer,
            coordinator,
            listeners,
        })
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn bus(&self) -> &ActionBus {
        &self.bus
    }

    pub fn store(&self) -> &CredentialStore {
        &self.store
    }

    pub fn timer(&self) -> &AutoLockTimer {
        &self.timer
    }

    pub fn coordinator(&self) -> &SessionCoordinator {
        &self.coordinator
    }

    /// Exit the app: apply the `on_app_exit` lock, then [`shutdown`].
    ///
    /// The lock runs directly on the store, since the listeners that would
    /// handle a bus request are released right after.
    ///
    /// [`shutdown`]: Self::shutdown
    pub async fn close(&mut self) {
        if self.timer.setting() == AutoLockSetting::OnAppExit {
            self.store.lock().await;
        }
        self.shutdown();
    }

    /// Publish `Shutdown` and release every listener.
    pub fn shutdown(&mut self) {
        self.bus.publish(Action::Lifecycle(LifecycleAction::Shutdown));
        for listener in self.listeners.drain(..) {
            tracing::debug!(listener = listener.name(), "stopping listener");
        }
        tracing::info!("session shut down");
    }
}

/// Publish `Upgrade` when the previous run was an older build, then record
/// the current build.
fn check_upgrade(bus: &ActionBus, keychain: &dyn SecureStorage, current: u32) -> Result<()> {
    let previous = keychain
        .retrieve(APP_BUILD_KEY)?
        .and_then(|stored| stored.expose().parse::<u32>().ok());

    if let Some(previous) = previous
        && previous < current
    {
        tracing::info!(from = previous, to = current, "upgrade detected");
        bus.publish(Action::Lifecycle(LifecycleAction::Upgrade {
            from: previous,
            to: current,
        }));
    }
    if previous != Some(current) {
        keychain.store(APP_BUILD_KEY, &SecretValue::new(current.to_string()))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use lockwise_kernel::{ActionKind, CancelReason, Credential, LockState, UnlockKey};
    use lockwise_vault::{Datastore, MemoryDatastore, MemoryKeychain};

    use super::*;
    use crate::clock::SystemClock;
    use crate::credential_store::CredentialList;
    use crate::error::SessionError;

    struct SilentHost;

    impl HostShell for SilentHost {
        fn display_welcome(&self) {}
        fn display_item_list(&self, _list: &CredentialList) {}
        fn complete_extension_configuration_request(&self) {}
        fn complete_request(&self, _credential: &Credential) {}
        fn cancel_request(&self, _reason: CancelReason) {}
    }

    #[tokio::test]
    async fn close_locks_with_on_app_exit() {
        let datastore = Arc::new(MemoryDatastore::initialized(
            UnlockKey::new("scoped"),
            "uid-1",
        ));
        let mut config = SessionConfig::default();
        config.auto_lock.setting = AutoLockSetting::OnAppExit;

        let mut context = AppContext::start(
            config,
            datastore.clone(),
            Arc::new(MemoryKeychain::new()),
            Arc::new(SilentHost),
            Arc::new(SystemClock),
        )
        .await
        .unwrap();
        context
            .store()
            .unlock(Some(UnlockKey::new("scoped")))
            .await
            .unwrap();

        context.close().await;
        assert_eq!(context.store().state(), LockState::Locked);
        assert!(datastore.is_locked().await);
    }

    #[tokio::test]
    async fn unusable_bus_capacity_fails_start() {
        let mut config = SessionConfig::default();
        config.session.bus_capacity = 0;

        let result = AppContext::start(
            config,
            Arc::new(MemoryDatastore::new()),
            Arc::new(MemoryKeychain::new()),
            Arc::new(SilentHost),
            Arc::new(SystemClock),
        )
        .await;
        assert!(matches!(result, Err(SessionError::Config { .. })));
    }

    #[test]
    fn first_run_records_build_without_upgrade() {
        let bus = ActionBus::new(8);
        let mut rx = bus.subscribe_kinds(&[ActionKind::Lifecycle]);
        let keychain = MemoryKeychain::new();

        check_upgrade(&bus, &keychain, 3).unwrap();
        assert!(rx.try_next().is_none());
        assert_eq!(
            keychain.retrieve(APP_BUILD_KEY).unwrap().unwrap().expose(),
            "3"
        );
    }

    #[test]
    fn newer_build_publishes_upgrade() {
        let bus = ActionBus::new(8);
        let mut rx = bus.subscribe_kinds(&[ActionKind::Lifecycle]);
        let keychain = MemoryKeychain::new();
        keychain.store(APP_BUILD_KEY, &"2".into()).unwrap();

        check_upgrade(&bus, &keychain, 5).unwrap();
        assert_eq!(
            *rx.try_next().unwrap(),
            Action::Lifecycle(LifecycleAction::Upgrade { from: 2, to: 5 })
        );

        // Same build again: nothing new.
        check_upgrade(&bus, &keychain, 5).unwrap();
        assert!(rx.try_next().is_none());
    }
}
