//! Kernel error types.
//!
//! [`LockwiseError`] is the error vocabulary shared by every Lockwise
//! component.  It is the payload of [`ErrorAction`](crate::action::ErrorAction)
//! on the bus, so it is `Clone` and carries only owned strings: a single
//! failed unlock attempt may be delivered to several waiters and to every
//! bus subscriber.

/// Unified error type for Lockwise components.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LockwiseError {
    // -- Lock-state errors --------------------------------------------------
    /// The backing storage medium cannot be reached.  Retryable.
    #[error("storage unavailable: {reason}")]
    StorageUnavailable { reason: String },

    /// The unlock key was rejected.  The store stays locked.
    #[error("authentication failed: {reason}")]
    AuthenticationFailed { reason: String },

    /// An operation that needs decrypted contents ran while locked.
    #[error("credential store is not unlocked")]
    NotUnlocked,

    /// The datastore has never been initialized with an account key.
    #[error("credential store is not initialized")]
    NotInitialized,

    // -- Data errors --------------------------------------------------------
    /// The requested credential does not exist.
    #[error("credential not found: id={id}")]
    CredentialNotFound { id: String },

    /// Reading or writing secure storage (keychain) failed.
    #[error("secure storage error: {reason}")]
    SecureStorage { reason: String },

    // -- Generic ------------------------------------------------------------
    /// Catch-all for unexpected internal errors that don't fit a specific
    /// variant.  Prefer a typed variant whenever possible.
    #[error("internal error: {0}")]
    Internal(String),
}

impl LockwiseError {
    /// Whether re-attempting the governing transition may succeed without
    /// user involvement.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::StorageUnavailable { .. })
    }
}

/// Convenience alias used throughout the Lockwise crates.
pub type Result<T> = std::result::Result<T, LockwiseError>;
