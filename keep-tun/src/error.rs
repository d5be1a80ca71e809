//! Error types for keep-tun

use std::io;
use thiserror::Error;

/// Result type alias for keep-tun operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while provisioning a tunnel interface
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error from underlying system calls
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Invalid IP address
    #[error("invalid IP address: {0}")]
    InvalidAddress(String),

    /// Invalid network prefix
    #[error("invalid network prefix: {0}")]
    InvalidPrefix(String),

    /// The tunnel capability has not been granted (or was revoked)
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Device creation error
    #[error("device creation error: {0}")]
    DeviceCreation(String),

    /// Route management error
    #[error("route error: {0}")]
    Route(String),

    /// The OS refused one item of the interface configuration
    #[error("rejected by the system: {0}")]
    Rejected(String),

    /// Operation not supported on this platform
    #[error("operation not supported: {0}")]
    NotSupported(String),

    /// `establish` was already called on this builder
    #[error("interface already established")]
    AlreadyEstablished,
}

impl Error {
    /// Check if the error is a permission-related error
    pub fn is_permission_denied(&self) -> bool {
        matches!(self, Error::PermissionDenied(_))
            || matches!(self, Error::Io(e) if e.kind() == io::ErrorKind::PermissionDenied)
    }
}
