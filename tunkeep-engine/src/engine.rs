//! Boundary to the external tunneling engine
//!
//! The controller treats the engine as a black box: it is configured with an
//! opaque document, started and stopped. While running, the engine calls back
//! into the controller through an [`EngineHost`] to obtain its interface and
//! report what it is doing.

use std::sync::Arc;

use async_trait::async_trait;
use keep_tun::{InterfaceRequest, TunnelFd};

use crate::error::Result;
use crate::monitor::{DefaultInterface, InterfaceUpdateListener};

/// Factory for engine instances
#[async_trait]
pub trait TunnelEngine: Send + Sync {
    /// Parse `config` and prepare an instance bound to `host`.
    ///
    /// Bad or empty documents fail with `Error::ConfigInvalid`.
    async fn configure(
        &self,
        config: &[u8],
        host: Arc<dyn EngineHost>,
    ) -> Result<Box<dyn EngineInstance>>;
}

/// A configured engine
#[async_trait]
pub trait EngineInstance: Send + Sync {
    /// Bring the engine up. Fails with `Error::EngineStartFailed` when the
    /// engine rejects its configuration or dies while starting.
    async fn start(&mut self) -> Result<()>;

    /// Shut the engine down. Must be safe to call when `start` never
    /// completed, and more than once.
    async fn stop(&mut self) -> Result<()>;
}

/// Services the controller offers to a running engine
#[async_trait]
pub trait EngineHost: Send + Sync {
    /// Provision the tunnel interface and return its descriptor. A second
    /// call in the same session replaces the first interface.
    async fn open_tun(&self, request: InterfaceRequest) -> Result<TunnelFd>;

    /// Record a line of engine output
    fn write_log(&self, message: &str);

    /// Keep a socket out of the tunnel. Returns false if the OS refused.
    fn protect(&self, fd: TunnelFd) -> bool;

    /// Interface currently carrying the default route
    fn default_interface(&self) -> Option<DefaultInterface>;

    /// Register the engine's listener; the current interface is reported
    /// immediately
    fn start_default_interface_monitor(&self, listener: Arc<dyn InterfaceUpdateListener>);

    fn close_default_interface_monitor(&self);

    /// The engine asks for the tunnel to be shut down
    fn post_service_close(&self);
}
