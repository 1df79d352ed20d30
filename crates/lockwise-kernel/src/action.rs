//! Actions carried on the [`ActionBus`](crate::bus::ActionBus).
//!
//! [`Action`] is a closed sum type: subscribers match exhaustively instead
//! of probing payload types at runtime.  Each variant family maps to an
//! [`ActionKind`] so subscriptions can filter cheaply.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::LockwiseError;
use crate::model::{
    CancelReason, Credential, LockState, NewCredential, ServiceIdentifier, SyncCredential,
    UnlockKey,
};

/// An immutable event published on the bus.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Host application or extension lifecycle.
    Lifecycle(LifecycleAction),
    /// Commands addressed to the credential store.
    DataStore(DataStoreAction),
    /// Outcome of an autofill interaction.
    CredentialStatus(CredentialStatusAction),
    /// Autofill provider requests.
    CredentialProvider(CredentialProviderAction),
    /// User settings changes.
    Setting(SettingAction),
    /// The credential store's lock state changed.
    LockStateChanged(LockState),
    /// The user interacted with the host UI.
    UserInteraction,
    /// A component failed; the host decides how to present it.
    Error(ErrorAction),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleAction {
    Startup,
    Foreground,
    Background,
    Shutdown,
    /// The app build changed since the last run.
    Upgrade { from: u32, to: u32 },
}

#[derive(Debug, Clone, PartialEq)]
pub enum DataStoreAction {
    /// Unlock with `key`, or with the key kept in secure storage when absent.
    Unlock { key: Option<UnlockKey> },
    Lock,
    Reset,
    UpdateCredentials(SyncCredential),
    /// Record a use of the credential with this id.
    Touch { id: String },
    Add(NewCredential),
    Remove { id: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum CredentialStatusAction {
    /// The extension finished configuration and may be dismissed.
    ExtensionConfigured,
    UserCancelled { reason: CancelReason },
    /// A login was picked for autofill.  With `relock` the store locks
    /// again right after the selection is delivered.
    LoginSelected { credential: Credential, relock: bool },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialProviderAction {
    /// Recompute the autofill list, optionally filtered by service.
    Refresh { service: Option<ServiceIdentifier> },
    AuthenticationRequested,
    Authenticated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingAction {
    AutoLockTime(AutoLockSetting),
    /// Restore every setting to its default.
    Reset,
}

/// A failure converted into a bus event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorAction {
    pub error: LockwiseError,
    /// Short description of the operation that failed (e.g. "unlock").
    pub context: String,
}

impl ErrorAction {
    pub fn new(error: LockwiseError, context: impl Into<String>) -> Self {
        Self {
            error,
            context: context.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Kinds
// ---------------------------------------------------------------------------

/// Discriminant of an [`Action`], used for subscription filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionKind {
    Lifecycle,
    DataStore,
    CredentialStatus,
    CredentialProvider,
    Setting,
    LockState,
    UserInteraction,
    Error,
}

impl Action {
    pub fn kind(&self) -> ActionKind {
        match self {
            Self::Lifecycle(_) => ActionKind::Lifecycle,
            Self::DataStore(_) => ActionKind::DataStore,
            Self::CredentialStatus(_) => ActionKind::CredentialStatus,
            Self::CredentialProvider(_) => ActionKind::CredentialProvider,
            Self::Setting(_) => ActionKind::Setting,
            Self::LockStateChanged(_) => ActionKind::LockState,
            Self::UserInteraction => ActionKind::UserInteraction,
            Self::Error(_) => ActionKind::Error,
        }
    }

    /// Shorthand for publishing a failure.
    pub fn error(error: LockwiseError, context: impl Into<String>) -> Self {
        Self::Error(ErrorAction::new(error, context))
    }
}

// ---------------------------------------------------------------------------
// Auto-lock setting
// ---------------------------------------------------------------------------

/// How long the store may stay unlocked without qualifying activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AutoLockSetting {
    OneMinute,
    #[default]
    FiveMinutes,
    FifteenMinutes,
    ThirtyMinutes,
    OneHour,
    TwelveHours,
    TwentyFourHours,
    /// Never lock automatically.
    Never,
    /// Lock whenever the host goes to the background.
    OnAppExit,
}

impl AutoLockSetting {
    /// Idle timeout in seconds, or `None` for settings without a deadline.
    pub fn seconds(&self) -> Option<i64> {
        match self {
            Self::OneMinute => Some(60),
            Self::FiveMinutes => Some(60 * 5),
            Self::FifteenMinutes => Some(60 * 15),
            Self::ThirtyMinutes => Some(60 * 30),
            Self::OneHour => Some(60 * 60),
            Self::TwelveHours => Some(60 * 60 * 12),
            Self::TwentyFourHours => Some(60 * 60 * 24),
            Self::Never | Self::OnAppExit => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OneMinute => "one_minute",
            Self::FiveMinutes => "five_minutes",
            Self::FifteenMinutes => "fifteen_minutes",
            Self::ThirtyMinutes => "thirty_minutes",
            Self::OneHour => "one_hour",
            Self::TwelveHours => "twelve_hours",
            Self::TwentyFourHours => "twenty_four_hours",
            Self::Never => "never",
            Self::OnAppExit => "on_app_exit",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "one_minute" => Some(Self::OneMinute),
            "five_minutes" => Some(Self::FiveMinutes),
            "fifteen_minutes" => Some(Self::FifteenMinutes),
            "thirty_minutes" => Some(Self::ThirtyMinutes),
            "one_hour" => Some(Self::OneHour),
            "twelve_hours" => Some(Self::TwelveHours),
            "twenty_four_hours" => Some(Self::TwentyFourHours),
            "never" => Some(Self::Never),
            "on_app_exit" => Some(Self::OnAppExit),
            _ => None,
        }
    }
}

impl fmt::Display for AutoLockSetting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
