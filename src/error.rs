//! Error handling for onair.
//!
//! Errors carry a category ([`ErrorKind`]) modeled on gRPC status codes plus
//! the underlying error. Callers inside the crate mostly care about the
//! category: transport failures are `Unavailable`, `DeadlineExceeded` or
//! `Aborted` and lead to a reconnect, while configuration problems are
//! `InvalidArgument` or `FailedPrecondition` and disable the service.
//!
//! # Example
//!
//! ```rust
//! use onair::error::{Error, ErrorKind, Result};
//!
//! fn topic(value: &str) -> Result<&str> {
//!     if value.trim().is_empty() {
//!         return Err(Error::failed_precondition("no subscription topic"));
//!     }
//!     Ok(value)
//! }
//! ```

#![allow(clippy::enum_glob_use)]

use std::fmt;
use thiserror::Error;

/// Main error type combining error kind and details.
#[derive(Debug)]
pub struct Error {
    /// Classification of the error
    pub kind: ErrorKind,

    /// Details of the underlying error
    pub error: Box<dyn std::error::Error + Send + Sync>,
}

impl Error {
    /// Attempts to downcast the underlying error to a concrete type.
    #[must_use]
    pub fn downcast<E>(&self) -> Option<&E>
    where
        E: std::error::Error + 'static,
    {
        self.error.downcast_ref::<E>()
    }

    /// Whether this error came from the network side of a connection and
    /// warrants another attempt later.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self.kind,
            ErrorKind::Unavailable
                | ErrorKind::DeadlineExceeded
                | ErrorKind::Aborted
                | ErrorKind::Cancelled
                | ErrorKind::DataLoss
        )
    }
}

/// Standard result type for onair operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error categories based on gRPC status codes.
///
/// See [gRPC status codes](https://github.com/googleapis/googleapis/blob/master/google/rpc/code.proto)
/// for the original definitions.
#[expect(clippy::module_name_repetitions)]
#[derive(Clone, Copy, Debug, Eq, Error, Hash, Ord, PartialEq, PartialOrd)]
#[repr(u32)]
pub enum ErrorKind {
    /// The operation was cancelled, typically by the peer closing.
    #[error("operation was cancelled")]
    Cancelled = 1,

    #[error("unknown error")]
    Unknown = 2,

    /// A value supplied by the caller or the configuration is malformed.
    #[error("invalid argument specified")]
    InvalidArgument = 3,

    #[error("operation timed out")]
    DeadlineExceeded = 4,

    #[error("not found")]
    NotFound = 5,

    #[error("permission denied")]
    PermissionDenied = 7,

    /// The system is not in a state required for the operation.
    #[error("invalid state")]
    FailedPrecondition = 9,

    #[error("operation aborted")]
    Aborted = 10,

    #[error("internal error")]
    Internal = 13,

    /// The remote service is unreachable; retrying may succeed.
    #[error("service unavailable")]
    Unavailable = 14,

    #[error("unrecoverable data loss or corruption")]
    DataLoss = 15,
}

/// Generates one constructor per error kind.
macro_rules! constructors {
    ($($(#[$doc:meta])* $name:ident => $kind:ident,)+) => {
        impl Error {
            $(
                $(#[$doc])*
                pub fn $name<E>(error: E) -> Self
                where
                    E: Into<Box<dyn std::error::Error + Send + Sync>>,
                {
                    Self::new(ErrorKind::$kind, error)
                }
            )+
        }
    };
}

impl Error {
    pub fn new<E>(kind: ErrorKind, error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self {
            kind,
            error: error.into(),
        }
    }
}

constructors! {
    aborted => Aborted,
    cancelled => Cancelled,
    data_loss => DataLoss,
    deadline_exceeded => DeadlineExceeded,
    /// For operations attempted in the wrong state, such as connecting
    /// without a subscription topic.
    failed_precondition => FailedPrecondition,
    internal => Internal,
    invalid_argument => InvalidArgument,
    not_found => NotFound,
    permission_denied => PermissionDenied,
    unavailable => Unavailable,
    unknown => Unknown,
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.error.as_ref())
    }
}

/// Formats as "kind: details", e.g. "service unavailable: connection refused".
impl fmt::Display for Error {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(fmt, "{}: {}", self.kind, self.error)
    }
}

/// Converts I/O errors into error kinds by their `io::ErrorKind`.
impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind::*;
        match err.kind() {
            NotFound => Self::not_found(err),
            PermissionDenied => Self::permission_denied(err),
            AddrNotAvailable | ConnectionRefused | NotConnected => Self::unavailable(err),
            BrokenPipe | ConnectionReset | ConnectionAborted => Self::aborted(err),
            Interrupted | WouldBlock => Self::cancelled(err),
            UnexpectedEof => Self::data_loss(err),
            TimedOut => Self::deadline_exceeded(err),
            InvalidInput | InvalidData => Self::invalid_argument(err),
            _ => Self::unknown(err),
        }
    }
}

/// Converts WebSocket errors into appropriate error kinds.
///
/// Everything that happens on the wire maps to a retryable kind so the
/// reconnect path treats it uniformly:
/// * `ConnectionClosed` -> `Cancelled`
/// * `Io` -> by `io::ErrorKind`
/// * `Capacity` -> `DataLoss`
/// * `Protocol` -> `Aborted`
/// * `Url` -> `InvalidArgument`
/// * others (TLS, HTTP handshake) -> `Unavailable`
impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error::*;
        match err {
            ConnectionClosed => Self::cancelled(err),
            Io(err) => err.into(),
            Capacity(err) => Self::data_loss(err),
            Protocol(err) => Self::aborted(err),
            Url(err) => Self::invalid_argument(err),
            AttackAttempt => Self::permission_denied(err),
            _ => Self::unavailable(err),
        }
    }
}

/// Converts JSON errors to `InvalidArgument`.
impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::invalid_argument(err)
    }
}

/// Converts TOML parsing errors to `InvalidArgument`.
impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Self::invalid_argument(err)
    }
}

/// Converts TOML serialization errors to `Internal`.
impl From<toml::ser::Error> for Error {
    fn from(err: toml::ser::Error) -> Self {
        Self::internal(err)
    }
}

/// Converts URL parsing errors to `InvalidArgument`.
impl From<url::ParseError> for Error {
    fn from(e: url::ParseError) -> Self {
        Self::invalid_argument(e)
    }
}

/// Converts timeout errors to `DeadlineExceeded`.
impl From<tokio::time::error::Elapsed> for Error {
    fn from(e: tokio::time::error::Elapsed) -> Self {
        Self::deadline_exceeded(e.to_string())
    }
}

/// Converts mutex poisoning errors to `Internal`.
impl<T> From<std::sync::PoisonError<std::sync::MutexGuard<'_, T>>> for Error {
    fn from(e: std::sync::PoisonError<std::sync::MutexGuard<'_, T>>) -> Self {
        Self::internal(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_map_by_kind() {
        let refused = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        assert_eq!(Error::from(refused).kind, ErrorKind::Unavailable);

        let missing = std::io::Error::new(std::io::ErrorKind::NotFound, "no such file");
        let err = Error::from(missing);
        assert_eq!(err.kind, ErrorKind::NotFound);
        assert!(!err.is_transient());
    }

    #[test]
    fn websocket_closure_is_transient() {
        let err = Error::from(tokio_tungstenite::tungstenite::Error::ConnectionClosed);
        assert_eq!(err.kind, ErrorKind::Cancelled);
        assert!(err.is_transient());
    }

    #[test]
    fn display_includes_kind_and_details() {
        let err = Error::unavailable("connection refused");
        assert_eq!(err.to_string(), "service unavailable: connection refused");
        assert!(err.downcast::<std::io::Error>().is_none());
    }
}
