//! Error taxonomy for push connections.
//!
//! Transport and protocol errors terminate the read loop. Registration errors
//! are reported on the exception channel and leave the connection up.
//! Concurrency errors are expected races and are never logged as failures.

use push_wire::{ConnectReturnCode, PacketType, WireError};
use thiserror::Error;

/// Connect, read or write failure on the broker stream
#[derive(Error, Debug)]
pub enum TransportError {
    /// Socket I/O failed
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// TLS setup or handshake failed
    #[error("tls error: {0}")]
    Tls(String),

    /// Broker closed the stream
    #[error("connection closed by broker")]
    Eof,
}

/// Malformed or unexpected traffic from the broker
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Frame could not be decoded
    #[error("wire error: {0}")]
    Wire(#[from] WireError),

    /// Broker answered the connect with a non-accepted code
    #[error("connection refused: {0:?}")]
    ConnectionRefused(ConnectReturnCode),

    /// Frame type the client never expects to receive
    #[error("unexpected {0:?} packet")]
    UnexpectedPacket(PacketType),

    /// Publish without payload
    #[error("publish carried an empty payload")]
    EmptyPayload,
}

/// Failures of the two-phase registration handshake
#[derive(Error, Debug)]
pub enum RegistrationError {
    /// Broker returned a non-empty `error` field
    #[error("registration rejected: {0}")]
    RegistrationRejected(String),

    /// Response carried no usable token
    #[error("invalid token in registration response: {0}")]
    InvalidToken(String),

    /// Response payload was not a JSON string map
    #[error("malformed registration response: {0}")]
    MalformedResponse(String),

    /// HTTP confirmation failed, was refused or was cancelled
    #[error("registration confirmation failed: {0}")]
    RegistrationConfirmationFailed(String),
}

/// Expected races between activation sources
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConcurrencyError {
    /// A connection is already running for this socket id
    #[error("connection already running")]
    AlreadyRunning,

    /// The socket has already been handed off
    #[error("socket already transferred")]
    AlreadyTransferred,

    /// Operation needs a running connection
    #[error("connection not running")]
    NotRunning,

    /// Another context holds the advisory lock
    #[error("advisory lock not acquired")]
    LockNotAcquired,
}

/// Errors raised by the push connection
#[derive(Error, Debug)]
pub enum PushError {
    /// Transport failure
    #[error("transport: {0}")]
    Transport(#[from] TransportError),

    /// Protocol failure
    #[error("protocol: {0}")]
    Protocol(#[from] ProtocolError),

    /// Registration failure
    #[error("registration: {0}")]
    Registration(#[from] RegistrationError),

    /// Expected race
    #[error("concurrency: {0}")]
    Concurrency(#[from] ConcurrencyError),

    /// Session has no logged-in user
    #[error("session is not authenticated")]
    NotAuthenticated,

    /// Operation abandoned because the connection was cancelled
    #[error("operation cancelled")]
    Cancelled,
}

impl PushError {
    /// Whether this is one of the expected races that callers treat as a no-op
    pub fn is_expected_race(&self) -> bool {
        matches!(self, PushError::Concurrency(_))
    }
}

impl From<WireError> for PushError {
    fn from(err: WireError) -> Self {
        PushError::Protocol(ProtocolError::Wire(err))
    }
}

impl From<std::io::Error> for PushError {
    fn from(err: std::io::Error) -> Self {
        PushError::Transport(TransportError::Io(err))
    }
}

/// Result alias for push connection operations
pub type Result<T> = std::result::Result<T, PushError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_conversions() {
        let err: PushError = WireError::MalformedLength.into();
        assert!(matches!(
            err,
            PushError::Protocol(ProtocolError::Wire(WireError::MalformedLength))
        ));

        let err: PushError = std::io::Error::from(std::io::ErrorKind::BrokenPipe).into();
        assert!(matches!(err, PushError::Transport(TransportError::Io(_))));
        assert!(!err.is_expected_race());

        let err: PushError = ConcurrencyError::AlreadyRunning.into();
        assert!(err.is_expected_race());
    }
}
