//! Session error types.

use lockwise_kernel::LockwiseError;

/// Errors raised while assembling or configuring a session.
///
/// Runtime failures of the components themselves travel on the bus as
/// [`LockwiseError`]s; this type only wraps them at the API edge.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The configuration file or an override could not be parsed.
    #[error("configuration error: {reason}")]
    Config { reason: String },

    /// Reading the configuration file failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Lockwise(#[from] LockwiseError),
}

/// Convenience alias used throughout the session crate.
pub type Result<T> = std::result::Result<T, SessionError>;
