//! Lockwise kernel.
//!
//! Foundational plumbing shared by the Lockwise session components:
//!
//! - **[`bus`]** -- Publish/subscribe action bus backed by
//!   [`tokio::sync::broadcast`], with kind and predicate filters and RAII
//!   listener handles.
//! - **[`action`]** -- The closed [`Action`] sum type carried on the bus.
//! - **[`model`]** -- Credentials, account session metadata, lock and
//!   populate states, redacted secrets.
//! - **[`state`]** -- Latest-value-plus-updates channels for observable
//!   component state.
//! - **[`error`]** -- The shared [`LockwiseError`] type via [`thiserror`].
//!
//! All public types are `Send + Sync` and designed for use within a
//! multi-threaded tokio runtime.

pub mod action;
pub mod bus;
pub mod error;
pub mod model;
pub mod state;

// Re-export the most commonly used types at the crate root for convenience.
pub use action::{
    Action, ActionKind, AutoLockSetting, CredentialProviderAction, CredentialStatusAction,
    DataStoreAction, ErrorAction, LifecycleAction, SettingAction,
};
pub use bus::{ActionBus, ListenerHandle, Subscription};
pub use error::{LockwiseError, Result};
pub use model::{
    CancelReason, Credential, LockState, NewCredential, PopulateState, SecretValue,
    ServiceIdentifier, SyncCredential, UnlockKey,
};
pub use state::{StateChannel, StateObserver, StateReceiver};
