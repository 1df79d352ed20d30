//! Idle auto-lock.
//!
//! The [`AutoLockTimer`] owns a single idle deadline.  Qualifying activity
//! pushes the deadline to `now + timeout`; a periodic tick and every
//! foreground transition compare the clock against it and publish
//! `DataStore(Lock)` once it has passed.  The deadline and the user's
//! chosen [`AutoLockSetting`] are kept in secure storage so they survive a
//! restart.
//!
//! The timer never locks directly.  It only publishes a lock request and
//! reads the store's lock state through a [`StateObserver`].

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use lockwise_kernel::{
    Action, ActionBus, AutoLockSetting, DataStoreAction, LifecycleAction, ListenerHandle,
    LockState, SecretValue, SettingAction, StateObserver,
};
use lockwise_vault::SecureStorage;
use tokio::time::MissedTickBehavior;

use crate::clock::Clock;
use crate::config::AutoLockConfig;

/// Secure-storage key of the idle deadline (RFC 3339).
pub const DEADLINE_KEY: &str = "auto-lock-deadline";
/// Secure-storage key of the user's auto-lock setting.
pub const SETTING_KEY: &str = "auto-lock-setting";

/// What the context should do with the stored session at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreOutcome {
    /// The previous session has not expired; unlock it again.
    Resume,
    /// The previous session expired; stay locked.
    Locked,
}

/// Whether `action` counts as user activity for the idle countdown.
pub fn is_qualifying_activity(action: &Action) -> bool {
    matches!(
        action,
        Action::CredentialStatus(_) | Action::CredentialProvider(_) | Action::UserInteraction
    )
}

#[derive(Debug)]
struct TimerState {
    setting: AutoLockSetting,
    deadline: Option<DateTime<Utc>>,
}

/// Idle auto-lock timer.  Cheap to clone.
#[derive(Clone)]
pub struct AutoLockTimer {
    inner: Arc<TimerInner>,
}

struct TimerInner {
    bus: ActionBus,
    keychain: Arc<dyn SecureStorage>,
    clock: Arc<dyn Clock>,
    lock_state: StateObserver<LockState>,
    default_setting: AutoLockSetting,
    tick_interval: Duration,
    state: Mutex<TimerState>,
}

impl AutoLockTimer {
    /// Build the timer, picking up any setting and deadline left by a
    /// previous run.
    pub fn new(
        bus: ActionBus,
        keychain: Arc<dyn SecureStorage>,
        clock: Arc<dyn Clock>,
        lock_state: StateObserver<LockState>,
        config: &AutoLockConfig,
    ) -> Self {
        let setting = load_setting(keychain.as_ref()).unwrap_or(config.setting);
        let deadline = load_deadline(keychain.as_ref());
        tracing::debug!(%setting, ?deadline, "auto-lock timer loaded");

        Self {
            inner: Arc::new(TimerInner {
                bus,
                keychain,
                clock,
                lock_state,
                default_setting: config.setting,
                tick_interval: config.tick_interval(),
                state: Mutex::new(TimerState { setting, deadline }),
            }),
        }
    }

    pub fn setting(&self) -> AutoLockSetting {
        self.inner.state().setting
    }

    pub fn deadline(&self) -> Option<DateTime<Utc>> {
        self.inner.state().deadline
    }

    /// Push the deadline out after qualifying activity.  Ignored while the
    /// store is locked.
    pub fn record_activity(&self) {
        if self.inner.lock_state.get() == LockState::Locked {
            return;
        }
        let mut state = self.inner.state();
        let deadline = self.inner.next_deadline(state.setting);
        self.inner.store_deadline(&mut state, deadline);
    }

    /// Compare the clock against the deadline and request a lock once it
    /// has passed.  Only acts while unlocked.  Returns whether a lock was
    /// requested.
    pub fn check(&self) -> bool {
        if self.inner.lock_state.get() != LockState::Unlocked {
            return false;
        }
        let now = self.inner.clock.now();
        {
            let mut state = self.inner.state();
            let current = state.deadline;
            match current {
                Some(deadline) if now >= deadline => {
                    self.inner.store_deadline(&mut state, None);
                }
                _ => return false,
            }
        }
        tracing::info!("idle deadline passed, locking");
        self.inner.request_lock();
        true
    }

    /// Switch to `setting`, persist it and re-arm the deadline.
    pub fn set_setting(&self, setting: AutoLockSetting) {
        if let Err(err) = self
            .inner
            .keychain
            .store(SETTING_KEY, &SecretValue::new(setting.as_str()))
        {
            self.inner.report(err);
        }
        self.apply_setting(setting);
    }

    /// Return to the configured default setting.
    pub fn reset_setting(&self) {
        if let Err(err) = self.inner.keychain.delete(SETTING_KEY) {
            self.inner.report(err);
        }
        self.apply_setting(self.inner.default_setting);
    }

    /// Drop persisted entries an older build wrote in a form this build
    /// cannot read, so they are rewritten on the next change instead of
    /// being skipped with a warning on every start.
    pub fn migrate(&self, from: u32, to: u32) {
        let keychain = self.inner.keychain.as_ref();
        let stale_setting = matches!(
            keychain.retrieve(SETTING_KEY),
            Ok(Some(stored)) if AutoLockSetting::parse(stored.expose()).is_none()
        );
        let stale_deadline = matches!(
            keychain.retrieve(DEADLINE_KEY),
            Ok(Some(stored)) if DateTime::parse_from_rfc3339(stored.expose()).is_err()
        );

        for (key, stale) in [(SETTING_KEY, stale_setting), (DEADLINE_KEY, stale_deadline)] {
            if !stale {
                continue;
            }
            match keychain.delete(key) {
                Ok(()) => tracing::info!(from, to, key, "dropped stale auto-lock entry"),
                Err(err) => self.inner.report(err),
            }
        }
    }

    fn apply_setting(&self, setting: AutoLockSetting) {
        let mut state = self.inner.state();
        state.setting = setting;
        let deadline = match self.inner.lock_state.get() {
            LockState::Locked => None,
            _ => self.inner.next_deadline(setting),
        };
        self.inner.store_deadline(&mut state, deadline);
        tracing::info!(%setting, "auto-lock setting changed");
    }

    /// Follow a lock state transition of the store.
    pub fn on_lock_state(&self, lock_state: LockState) {
        let now = self.inner.clock.now();
        let mut state = self.inner.state();
        let current = state.deadline;
        match lock_state {
            LockState::Locked => self.inner.store_deadline(&mut state, None),
            LockState::Unlocking => {}
            LockState::Unlocked => match current {
                Some(deadline) if deadline > now => {}
                Some(_) => {
                    self.inner.store_deadline(&mut state, None);
                    drop(state);
                    tracing::info!("idle deadline passed while unlocking, locking");
                    self.inner.request_lock();
                }
                None => {
                    let deadline = self.inner.next_deadline(state.setting);
                    self.inner.store_deadline(&mut state, deadline);
                }
            },
        }
    }

    /// The app moved to the background.
    pub fn on_background(&self) {
        if self.setting() == AutoLockSetting::OnAppExit
            && self.inner.lock_state.get() != LockState::Locked
        {
            tracing::info!("locking on app exit");
            self.inner.request_lock();
        }
    }

    /// Decide at startup whether the previous session may be resumed.
    ///
    /// An absent or expired deadline means the session stays locked.
    pub fn restore(&self) -> RestoreOutcome {
        let now = self.inner.clock.now();
        let mut state = self.inner.state();
        let current = state.deadline;
        let outcome = match state.setting {
            AutoLockSetting::Never => RestoreOutcome::Resume,
            AutoLockSetting::OnAppExit => RestoreOutcome::Locked,
            _ => match current {
                Some(deadline) if deadline > now => RestoreOutcome::Resume,
                _ => RestoreOutcome::Locked,
            },
        };

        if outcome == RestoreOutcome::Locked {
            self.inner.store_deadline(&mut state, None);
            drop(state);
            if self.inner.lock_state.get() != LockState::Locked {
                self.inner.request_lock();
            }
        }
        tracing::debug!(?outcome, "auto-lock restore");
        outcome
    }

    /// Spawn the listener that feeds bus traffic, lock state changes and
    /// the periodic tick into the timer.
    pub fn listen(&self) -> ListenerHandle {
        let mut actions = self.inner.bus.subscribe();
        let mut states = self.inner.lock_state.subscribe();
        let timer = self.clone();

        ListenerHandle::new(
            "auto-lock",
            tokio::spawn(async move {
                // Skip the snapshot; startup state is handled by `restore`.
                let _ = states.next().await;

                let mut tick = tokio::time::interval(timer.inner.tick_interval);
                tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
                tick.tick().await;

                loop {
                    tokio::select! {
                        action = actions.next() => match action {
                            Some(action) => timer.handle(&action),
                            None => break,
                        },
                        lock_state = states.next() => timer.on_lock_state(lock_state),
                        _ = tick.tick() => {
                            timer.check();
                        }
                    }
                }
            }),
        )
    }

    fn handle(&self, action: &Action) {
        if is_qualifying_activity(action) {
            self.record_activity();
        }
        match action {
            Action::Lifecycle(LifecycleAction::Foreground) => {
                self.check();
            }
            Action::Lifecycle(LifecycleAction::Background) => self.on_background(),
            Action::Lifecycle(LifecycleAction::Upgrade { from, to }) => self.migrate(*from, *to),
            Action::Setting(SettingAction::AutoLockTime(setting)) => self.set_setting(*setting),
            Action::Setting(SettingAction::Reset) => self.reset_setting(),
            Action::DataStore(DataStoreAction::Reset) => {
                let mut state = self.inner.state();
                self.inner.store_deadline(&mut state, None);
            }
            _ => {}
        }
    }
}

impl TimerInner {
    fn state(&self) -> MutexGuard<'_, TimerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_deadline(&self, setting: AutoLockSetting) -> Option<DateTime<Utc>> {
        setting
            .seconds()
            .map(|secs| self.clock.now() + chrono::Duration::seconds(secs))
    }

    fn store_deadline(&self, state: &mut TimerState, deadline: Option<DateTime<Utc>>) {
        if state.deadline == deadline {
            return;
        }
        state.deadline = deadline;
        let result = match deadline {
            Some(deadline) => self
                .keychain
                .store(DEADLINE_KEY, &SecretValue::new(deadline.to_rfc3339())),
            None => self.keychain.delete(DEADLINE_KEY),
        };
        if let Err(err) = result {
            self.report(err);
        }
    }

    fn request_lock(&self) {
        self.bus.publish(Action::DataStore(DataStoreAction::Lock));
    }

    fn report(&self, err: lockwise_kernel::LockwiseError) {
        tracing::warn!(error = %err, "failed to persist auto-lock state");
        self.bus.publish(Action::error(err, "auto_lock"));
    }
}

fn load_setting(keychain: &dyn SecureStorage) -> Option<AutoLockSetting> {
    let stored = keychain.retrieve(SETTING_KEY).ok().flatten()?;
    let setting = AutoLockSetting::parse(stored.expose());
    if setting.is_none() {
        tracing::warn!("ignoring unknown stored auto-lock setting");
    }
    setting
}

fn load_deadline(keychain: &dyn SecureStorage) -> Option<DateTime<Utc>> {
    let stored = keychain.retrieve(DEADLINE_KEY).ok().flatten()?;
    match DateTime::parse_from_rfc3339(stored.expose()) {
        Ok(deadline) => Some(deadline.with_timezone(&Utc)),
        Err(err) => {
            tracing::warn!(error = %err, "ignoring unreadable auto-lock deadline");
            None
        }
    }
}
