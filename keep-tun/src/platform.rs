//! OS tunnel capability
//!
//! The provisioner never talks to the operating system directly. It drives a
//! [`TunPlatform`], which hands out one [`InterfaceBuilder`] per interface.
//! The system backend lives in [`crate::system`]; tests substitute recording
//! implementations.

use std::net::IpAddr;

use async_trait::async_trait;
use ipnet::IpNet;

use crate::error::Result;
use crate::route::Route;

/// Raw descriptor of an established tunnel interface
pub type TunnelFd = i32;

/// Accumulates the configuration of one virtual interface.
///
/// Each `add_*` call may be rejected by the platform (address conflict,
/// revoked permission); the error is returned to the provisioner unchanged.
#[async_trait]
pub trait InterfaceBuilder: Send {
    /// Name shown by the OS for the tunnel session
    fn set_session(&mut self, name: &str);

    /// Set the interface MTU
    fn set_mtu(&mut self, mtu: u16) -> Result<()>;

    /// Assign an address with its prefix length
    fn add_address(&mut self, address: IpNet) -> Result<()>;

    /// Capture a route through the interface
    fn add_route(&mut self, route: &Route) -> Result<()>;

    /// Advertise a DNS server on the interface
    fn add_dns_server(&mut self, server: IpAddr) -> Result<()>;

    /// Keep an application's traffic outside the tunnel
    fn exclude_application(&mut self, identifier: &str) -> Result<()>;

    /// Create the interface with everything accumulated so far
    async fn establish(self: Box<Self>) -> Result<Box<dyn TunInterface>>;
}

/// A live virtual interface
pub trait TunInterface: Send + Sync + std::fmt::Debug {
    /// Interface name
    fn name(&self) -> &str;

    /// Raw descriptor handed to the tunneling engine
    fn fd(&self) -> TunnelFd;

    /// MTU the interface was created with
    fn mtu(&self) -> u16;

    /// Release the interface. Calling it again is a no-op.
    fn close(&mut self) -> Result<()>;
}

/// Entry point to the OS tunnel capability
pub trait TunPlatform: Send + Sync {
    /// Whether the privileged tunnel capability is currently granted
    fn has_permission(&self) -> bool;

    /// Start building a new interface
    fn new_builder(&self) -> Result<Box<dyn InterfaceBuilder>>;

    /// Exclude a socket from tunnel routing. Returns false if the OS refused.
    fn protect(&self, fd: TunnelFd) -> bool;
}
