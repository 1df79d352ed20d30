//! Vault error types.
//!
//! All vault subsystems surface errors through [`VaultError`].  At the crate
//! boundary ([`Datastore`](crate::Datastore) and
//! [`SecureStorage`](crate::SecureStorage)) errors are converted into the
//! shared [`LockwiseError`] vocabulary so they can travel on the action bus.

use lockwise_kernel::LockwiseError;

/// Unified error type for the Lockwise vault.
#[derive(Debug, thiserror::Error)]
pub enum VaultError {
    // -- Crypto errors ------------------------------------------------------
    /// Encryption failed (e.g. invalid key length, ring internal error).
    #[error("encryption failed: {reason}")]
    EncryptionFailed { reason: String },

    /// Decryption failed (e.g. wrong key, corrupted ciphertext, bad nonce).
    #[error("decryption failed: {reason}")]
    DecryptionFailed { reason: String },

    /// Key derivation failed (e.g. HKDF output length rejected).
    #[error("key derivation failed: {reason}")]
    KeyDerivationFailed { reason: String },

    // -- Keychain errors ----------------------------------------------------
    /// The keychain backend is unavailable or unsupported on this platform.
    #[error("keychain unavailable: {reason}")]
    KeychainUnavailable { reason: String },

    /// Writing an entry to the keychain failed.
    #[error("failed to store keychain entry {key}: {reason}")]
    KeychainWriteFailed { key: String, reason: String },

    // -- Datastore errors ---------------------------------------------------
    /// The datastore file or medium cannot be reached.
    #[error("datastore unreachable: {reason}")]
    Unreachable { reason: String },

    /// The datastore has not been initialized with an account key.
    #[error("datastore not initialized")]
    NotInitialized,

    /// `initialize` was called on an already initialized datastore.
    #[error("datastore already initialized")]
    AlreadyInitialized,

    /// The supplied key does not open the datastore.
    #[error("wrong datastore key")]
    WrongKey,

    /// A login operation ran while the datastore was locked.
    #[error("datastore is locked")]
    Locked,

    /// The requested login does not exist.
    #[error("login not found: id={id}")]
    LoginNotFound { id: String },

    /// Database schema migration failed.
    #[error("migration failed: {reason}")]
    MigrationFailed { reason: String },

    // -- Underlying errors --------------------------------------------------
    /// SQLite error from `rusqlite`.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// JSON serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error from the filesystem (keychain file operations, etc.).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A blocking task panicked or was cancelled.
    #[error("task join error: {0}")]
    TaskJoin(String),

    // -- Generic ------------------------------------------------------------
    /// Catch-all for unexpected internal errors that don't fit a specific
    /// variant.  Prefer a typed variant whenever possible.
    #[error("internal vault error: {0}")]
    Internal(String),
}

impl From<tokio::task::JoinError> for VaultError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::TaskJoin(err.to_string())
    }
}

impl From<VaultError> for LockwiseError {
    fn from(err: VaultError) -> Self {
        match err {
            VaultError::Unreachable { reason } => Self::StorageUnavailable { reason },
            VaultError::Io(e) => Self::StorageUnavailable {
                reason: e.to_string(),
            },
            VaultError::Database(e) => match e.sqlite_error_code() {
                Some(
                    rusqlite::ErrorCode::CannotOpen
                    | rusqlite::ErrorCode::DatabaseBusy
                    | rusqlite::ErrorCode::DatabaseLocked
                    | rusqlite::ErrorCode::SystemIoFailure
                    | rusqlite::ErrorCode::PermissionDenied,
                ) => Self::StorageUnavailable {
                    reason: e.to_string(),
                },
                _ => Self::Internal(format!("database error: {e}")),
            },
            VaultError::WrongKey => Self::AuthenticationFailed {
                reason: "key does not open the datastore".into(),
            },
            VaultError::DecryptionFailed { reason } => Self::AuthenticationFailed { reason },
            VaultError::NotInitialized => Self::NotInitialized,
            VaultError::Locked => Self::NotUnlocked,
            VaultError::LoginNotFound { id } => Self::CredentialNotFound { id },
            e @ (VaultError::KeychainUnavailable { .. }
            | VaultError::KeychainWriteFailed { .. }) => Self::SecureStorage {
                reason: e.to_string(),
            },
            other => Self::Internal(other.to_string()),
        }
    }
}

/// Convenience alias used throughout the vault crate.
pub type Result<T> = std::result::Result<T, VaultError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn datastore_errors_map_to_shared_kinds() {
        let err: LockwiseError = VaultError::WrongKey.into();
        assert!(matches!(err, LockwiseError::AuthenticationFailed { .. }));

        let err: LockwiseError = VaultError::Unreachable {
            reason: "gone".into(),
        }
        .into();
        assert!(err.is_retryable());

        let err: LockwiseError = VaultError::Locked.into();
        assert_eq!(err, LockwiseError::NotUnlocked);

        let err: LockwiseError = VaultError::LoginNotFound { id: "x".into() }.into();
        assert_eq!(err, LockwiseError::CredentialNotFound { id: "x".into() });
    }

    #[test]
    fn keychain_errors_map_to_secure_storage() {
        let err: LockwiseError = VaultError::KeychainUnavailable {
            reason: "no daemon".into(),
        }
        .into();
        assert!(matches!(err, LockwiseError::SecureStorage { .. }));
    }

    #[test]
    fn io_errors_are_retryable() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: LockwiseError = VaultError::Io(io).into();
        assert!(err.is_retryable());
    }
}
