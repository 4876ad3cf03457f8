//! Lifecycle error types.

use push_session::PushError;
use thiserror::Error;

/// Errors raised while managing background sockets
#[derive(Error, Debug)]
pub enum LifecycleError {
    /// Background host refused or failed an operation
    #[error("background host error: {0}")]
    Host(String),

    /// Lock file could not be opened or locked
    #[error("advisory lock error: {0}")]
    Lock(#[source] std::io::Error),

    /// Session store failed
    #[error("session store error: {0}")]
    Session(String),

    /// Activation for a socket whose session is not stored
    #[error("activation triggered without session {0}")]
    MissingSession(String),

    /// Connection error
    #[error(transparent)]
    Push(#[from] PushError),
}

/// Result type for lifecycle operations
pub type Result<T> = std::result::Result<T, LifecycleError>;
