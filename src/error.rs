//! Error types
//!
//! `Error` is the crate-internal error. `AppError` is the small taxonomy that
//! is reported to the owning application through the event bus; raw
//! transport errors never leave the crate.

use std::io;

use crate::encoder::EncodeError;
use crate::registry::RegistryError;
use crate::server::LifecycleState;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Crate error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Socket or stream I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// TLS credentials could not be loaded
    #[error("TLS configuration error: {0}")]
    Tls(String),

    /// A frame could not be encoded
    #[error("Encode error: {0}")]
    Encode(#[from] EncodeError),

    /// HTTP protocol failure on one connection
    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),

    /// Client was not admitted
    #[error("Client rejected: {0}")]
    Registry(#[from] RegistryError),

    /// Operation is not valid in the current lifecycle state
    #[error("Invalid server state: {0:?}")]
    InvalidState(LifecycleState),

    /// Client made no write progress within the grace period
    #[error("Client evicted: no write progress")]
    Evicted,

    /// An operation did not complete in time
    #[error("Operation timed out")]
    Timeout,
}

impl Error {
    /// Whether this error is a bind conflict
    pub fn is_address_in_use(&self) -> bool {
        matches!(self, Error::Io(e) if e.kind() == io::ErrorKind::AddrInUse)
    }

    /// Map into the application-facing taxonomy
    pub fn to_app_error(&self) -> AppError {
        match self {
            Error::Io(e) if e.kind() == io::ErrorKind::AddrInUse => AppError::AddressInUse,
            Error::Encode(_) | Error::Http(_) | Error::Registry(_) | Error::Evicted => {
                AppError::ClientError(self.to_string())
            }
            Error::Io(_) | Error::Tls(_) | Error::InvalidState(_) | Error::Timeout => {
                AppError::HttpServerFault
            }
        }
    }
}

/// Errors surfaced to the owning application
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AppError {
    /// The listening address is already bound elsewhere
    #[error("Address already in use")]
    AddressInUse,
    /// Any other startup or runtime transport failure
    #[error("HTTP server fault")]
    HttpServerFault,
    /// Per-client or per-frame degradation; never stops the server
    #[error("Client error: {0}")]
    ClientError(String),
}

impl AppError {
    /// Whether this error leaves the server stopped
    pub fn is_fatal(&self) -> bool {
        !matches!(self, AppError::ClientError(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_addr_in_use_mapping() {
        let err = Error::from(io::Error::from(io::ErrorKind::AddrInUse));
        assert!(err.is_address_in_use());
        assert_eq!(err.to_app_error(), AppError::AddressInUse);
        assert!(err.to_app_error().is_fatal());
    }

    #[test]
    fn test_other_io_is_server_fault() {
        let err = Error::from(io::Error::from(io::ErrorKind::PermissionDenied));
        assert!(!err.is_address_in_use());
        assert_eq!(err.to_app_error(), AppError::HttpServerFault);
    }

    #[test]
    fn test_client_side_errors() {
        let err = Error::from(EncodeError::EmptyFrame);
        assert!(matches!(err.to_app_error(), AppError::ClientError(_)));
        assert!(!err.to_app_error().is_fatal());

        let err = Error::from(RegistryError::LimitReached(4));
        assert!(matches!(err.to_app_error(), AppError::ClientError(_)));
    }

    #[test]
    fn test_tls_is_server_fault() {
        let err = Error::Tls("no private key".into());
        assert_eq!(err.to_app_error(), AppError::HttpServerFault);
    }
}
