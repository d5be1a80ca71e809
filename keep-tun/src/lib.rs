//! Virtual interface provisioning for supervised tunnels
//!
//! This crate turns the addressing, routing and DNS a tunneling engine asks
//! for into a concrete virtual network interface.
//!
//! # Features
//!
//! - **Interface Requests**: ordered addresses, routes and DNS servers as
//!   reported by the engine
//! - **Provisioning**: catch-all route and fallback DNS defaults, host
//!   application always kept outside the tunnel
//! - **Platform Capability**: the OS side is a trait ([`TunPlatform`]), so the
//!   provisioner can be driven against a simulated platform
//! - **System Backend**: `tun-rs` devices and `net-route` routes
//!
//! # Feature Flags
//!
//! - `async-tokio` (default): system backend and route manager on Tokio
//!
//! # Platform Requirements
//!
//! ## Linux
//! - Root privileges or `CAP_NET_ADMIN` capability
//! - TUN kernel module loaded (`modprobe tun`)
//!
//! ## macOS
//! - Root privileges
//!
//! ## Windows
//! - Administrator privileges
//! - WinTun driver installed (<https://www.wintun.net/>)
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use keep_tun::{InterfaceRequest, Provisioner, ProvisionSettings, SystemTunPlatform};
//!
//! let request = InterfaceRequest::builder()
//!     .address_str("172.19.0.1/30")?
//!     .mtu(1500)
//!     .build()?;
//!
//! let provisioner = Provisioner::new(Arc::new(SystemTunPlatform::new()), ProvisionSettings::default());
//! let interface = provisioner.provision(&request).await?;
//! println!("tunnel on {} (fd {})", interface.name(), interface.fd());
//! ```

pub mod error;
pub mod platform;
pub mod provision;
pub mod request;
pub mod route;

#[cfg(feature = "async-tokio")]
pub mod system;

pub use error::{Error, Result};
pub use platform::{InterfaceBuilder, TunInterface, TunPlatform, TunnelFd};
pub use provision::{ProvisionPlan, ProvisionSettings, Provisioner, DEFAULT_FALLBACK_DNS, DEFAULT_SESSION_NAME};
pub use request::{InterfaceRequest, InterfaceRequestBuilder};
pub use route::{DefaultRoute, Route, RouteManager};

#[cfg(feature = "async-tokio")]
pub use system::SystemTunPlatform;

/// Default MTU when the engine does not request one
pub const DEFAULT_MTU: u16 = 1500;
