/*!
 * Error types for the edgelink access crate.
 *
 * Every failure surfaced by a public lifecycle operation carries an
 * [`ErrorKind`] naming the operation (or failure origin) it belongs to.
 * Internal helpers raise transport/protocol/precondition errors; the
 * public operation wrapping them performs any compensating rollback,
 * retags with its own kind, and rethrows.
 */
use std::fmt;

use thiserror::Error;

use edgelink_bus::BusError;

/// The operation (or failure origin) an error is tagged with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Session setup on behalf of a device
    Setup,
    /// Module registration against the broker
    RegisterModule,
    /// Device registration
    Register,
    /// Device connect (online)
    Connect,
    /// Device disconnect (offline)
    Disconnect,
    /// Device cleanup
    Cleanup,
    /// Device unregistration
    Unregister,
    /// Thing specification retrieval
    GetTsl,
    /// Driver configuration retrieval
    GetConfig,
    /// A required precondition did not hold; no RPC was issued
    Precondition,
    /// The bus transport failed
    Transport,
    /// A reply violated the wire protocol
    Protocol,
}

impl ErrorKind {
    /// The stable tag string for this kind
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Setup => "setup",
            ErrorKind::RegisterModule => "register_module",
            ErrorKind::Register => "register",
            ErrorKind::Connect => "connect",
            ErrorKind::Disconnect => "disconnect",
            ErrorKind::Cleanup => "cleanup",
            ErrorKind::Unregister => "unregister",
            ErrorKind::GetTsl => "get_tsl",
            ErrorKind::GetConfig => "get_config",
            ErrorKind::Precondition => "precondition",
            ErrorKind::Transport => "transport",
            ErrorKind::Protocol => "protocol",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Error type for session and device lifecycle operations.
///
/// The type is `Clone` on purpose: a memoized operation shares one
/// outcome among every concurrent caller.
#[derive(Error, Debug, Clone)]
#[error("{kind}: {message}")]
pub struct Error {
    kind: ErrorKind,
    message: String,
}

/// Result type for session and device lifecycle operations
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create an error with an explicit kind
    pub fn new<S: Into<String>>(kind: ErrorKind, message: S) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Create a precondition error
    pub fn precondition<S: Into<String>>(message: S) -> Self {
        Self::new(ErrorKind::Precondition, message)
    }

    /// Create a transport error
    pub fn transport<S: Into<String>>(message: S) -> Self {
        Self::new(ErrorKind::Transport, message)
    }

    /// Create a protocol error
    pub fn protocol<S: Into<String>>(message: S) -> Self {
        Self::new(ErrorKind::Protocol, message)
    }

    /// The kind this error is tagged with
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// The human-readable failure message
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Retag the error with the public operation it surfaced from
    pub fn with_kind(mut self, kind: ErrorKind) -> Self {
        self.kind = kind;
        self
    }
}

impl From<BusError> for Error {
    fn from(err: BusError) -> Self {
        Error::transport(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::protocol(err.to_string())
    }
}
