//! Error types for the tunnel controller

use thiserror::Error;

/// Result type alias for controller operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while running a tunnel
#[derive(Debug, Error)]
pub enum Error {
    /// Bad or empty engine configuration
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    /// Failed to parse configuration file
    #[error("failed to parse config: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// The OS declined (or revoked) the tunnel capability
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// The engine rejected its configuration or crashed on start
    #[error("engine failed to start: {0}")]
    EngineStartFailed(String),

    /// The OS rejected the requested addresses or routes
    #[error("interface provisioning failed: {0}")]
    InterfaceProvisioningFailed(String),

    /// The underlying network went away
    #[error("network lost")]
    NetworkLost,

    /// Automatic reconnection gave up
    #[error("connection lost after {0} retries")]
    ReconnectExhausted(u32),

    /// Engine configure/stop failure
    #[error("engine error: {0}")]
    Engine(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// TUN provisioning error
    #[error("TUN error: {0}")]
    Tun(#[from] keep_tun::Error),

    /// Already running
    #[error("tunnel is already running")]
    AlreadyRunning,

    /// Not running
    #[error("tunnel is not running")]
    NotRunning,
}

impl Error {
    /// Short classification used in diagnostic log lines
    pub fn kind(&self) -> &'static str {
        match self {
            Error::ConfigInvalid(_) | Error::ConfigParse(_) => "ConfigInvalid",
            Error::PermissionDenied(_) => "PermissionDenied",
            Error::EngineStartFailed(_) => "EngineStartFailed",
            Error::InterfaceProvisioningFailed(_) => "InterfaceProvisioningFailed",
            Error::NetworkLost => "NetworkLost",
            Error::ReconnectExhausted(_) => "ReconnectExhausted",
            Error::Engine(_) => "EngineError",
            Error::Io(_) => "IoError",
            Error::Tun(e) if e.is_permission_denied() => "PermissionDenied",
            Error::Tun(_) => "InterfaceProvisioningFailed",
            Error::AlreadyRunning => "AlreadyRunning",
            Error::NotRunning => "NotRunning",
        }
    }

    /// Check if a reconnect may follow this error
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::NetworkLost | Error::EngineStartFailed(_) | Error::InterfaceProvisioningFailed(_)
        )
    }

    /// Check if this is a configuration error
    pub fn is_config_error(&self) -> bool {
        matches!(self, Error::ConfigInvalid(_) | Error::ConfigParse(_))
    }

    /// Map a provisioning failure into the controller's error kinds
    pub fn from_provisioning(err: keep_tun::Error) -> Self {
        if err.is_permission_denied() {
            Error::PermissionDenied(err.to_string())
        } else {
            Error::InterfaceProvisioningFailed(err.to_string())
        }
    }
}
