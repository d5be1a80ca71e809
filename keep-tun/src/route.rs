//! Route management for tunnel interfaces
//!
//! This module provides the route entries the provisioner installs on a
//! virtual interface and a thin `net-route` wrapper for the system backend.

#[cfg(unix)]
use std::ffi::{CStr, CString};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use ipnet::{IpNet, Ipv4Net, Ipv6Net};

use crate::error::{Error, Result};

/// Convert an interface name to its index
#[cfg(unix)]
pub fn interface_index(name: &str) -> Result<u32> {
    let c_name = CString::new(name)
        .map_err(|_| Error::Config("invalid interface name".into()))?;

    // SAFETY: if_nametoindex is safe to call with a valid C string
    let index = unsafe { libc::if_nametoindex(c_name.as_ptr()) };

    if index == 0 {
        return Err(Error::Route(format!(
            "interface '{}' not found (os error {})",
            name,
            std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
        )));
    }

    Ok(index)
}

#[cfg(not(unix))]
pub fn interface_index(name: &str) -> Result<u32> {
    Err(Error::NotSupported(format!(
        "interface routing by name not supported on this platform: {}",
        name
    )))
}

/// Convert an interface index back to its name
#[cfg(unix)]
pub fn interface_name(index: u32) -> Option<String> {
    let mut buf = [0 as libc::c_char; libc::IF_NAMESIZE];

    // SAFETY: buf holds IF_NAMESIZE bytes as required by if_indextoname
    let ptr = unsafe { libc::if_indextoname(index, buf.as_mut_ptr()) };
    if ptr.is_null() {
        return None;
    }

    // SAFETY: on success if_indextoname wrote a NUL-terminated name into buf
    let name = unsafe { CStr::from_ptr(buf.as_ptr()) };
    Some(name.to_string_lossy().into_owned())
}

#[cfg(not(unix))]
pub fn interface_name(_index: u32) -> Option<String> {
    None
}

/// A network route entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    /// Destination network
    pub destination: IpNet,
    /// Gateway address (None for interface routes)
    pub gateway: Option<IpAddr>,
    /// Interface name
    pub interface: Option<String>,
}

impl Route {
    /// Create an interface route (no gateway, traffic goes directly to interface)
    pub fn new(destination: IpNet) -> Self {
        Self {
            destination,
            gateway: None,
            interface: None,
        }
    }

    /// Create a new IPv4 route
    pub fn ipv4(dest_addr: Ipv4Addr, prefix_len: u8) -> Result<Self> {
        let destination = Ipv4Net::new(dest_addr, prefix_len)
            .map_err(|e| Error::InvalidPrefix(e.to_string()))?;
        Ok(Self::new(IpNet::V4(destination)))
    }

    /// Create a new IPv6 route
    pub fn ipv6(dest_addr: Ipv6Addr, prefix_len: u8) -> Result<Self> {
        let destination = Ipv6Net::new(dest_addr, prefix_len)
            .map_err(|e| Error::InvalidPrefix(e.to_string()))?;
        Ok(Self::new(IpNet::V6(destination)))
    }

    /// The IPv4 catch-all route (0.0.0.0/0)
    pub fn catch_all_v4() -> Self {
        Self::new(IpNet::V4(Ipv4Net::default()))
    }

    /// The IPv6 catch-all route (::/0)
    pub fn catch_all_v6() -> Self {
        Self::new(IpNet::V6(Ipv6Net::default()))
    }

    /// Set the gateway for this route
    pub fn with_gateway(mut self, gateway: IpAddr) -> Self {
        self.gateway = Some(gateway);
        self
    }

    /// Set the interface for this route
    pub fn with_interface(mut self, interface: impl Into<String>) -> Self {
        self.interface = Some(interface.into());
        self
    }

    /// Check if this is a default route
    pub fn is_default(&self) -> bool {
        self.destination.prefix_len() == 0
    }

    /// Check if this is an IPv4 route
    pub fn is_ipv4(&self) -> bool {
        matches!(self.destination, IpNet::V4(_))
    }

    /// Check if this is an IPv6 route
    pub fn is_ipv6(&self) -> bool {
        matches!(self.destination, IpNet::V6(_))
    }
}

impl From<Ipv4Net> for Route {
    fn from(net: Ipv4Net) -> Self {
        Self::new(IpNet::V4(net))
    }
}

impl From<Ipv6Net> for Route {
    fn from(net: Ipv6Net) -> Self {
        Self::new(IpNet::V6(net))
    }
}

impl std::fmt::Display for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.destination)?;
        if let Some(ref gw) = self.gateway {
            write!(f, " via {}", gw)?;
        }
        if let Some(ref iface) = self.interface {
            write!(f, " dev {}", iface)?;
        }
        Ok(())
    }
}

/// The system default route as seen by [`RouteManager::default_route`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DefaultRoute {
    /// Gateway of the default route, if any
    pub gateway: Option<IpAddr>,
    /// Index of the outgoing interface
    pub ifindex: Option<u32>,
}

/// Route manager for adding/removing routes
///
/// Uses the `net-route` crate for cross-platform route manipulation.
pub struct RouteManager {
    #[cfg(feature = "async-tokio")]
    handle: net_route::Handle,
}

impl RouteManager {
    /// Create a new route manager
    #[cfg(feature = "async-tokio")]
    pub fn new() -> Result<Self> {
        let handle = net_route::Handle::new()
            .map_err(|e| Error::Route(format!("failed to create route handle: {}", e)))?;

        Ok(Self { handle })
    }

    /// Add a route to the routing table
    #[cfg(feature = "async-tokio")]
    pub async fn add(&self, route: &Route) -> Result<()> {
        let net_route = to_net_route(route)?;

        match self.handle.add(&net_route).await {
            Ok(()) => {
                log::info!("Added route: {}", route);
            }
            Err(e) => {
                let err_str = e.to_string();
                // EEXIST: the route is already in place
                if err_str.contains("File exists") || err_str.contains("os error 17") {
                    log::debug!("Route already exists: {}", route);
                } else if e.kind() == std::io::ErrorKind::PermissionDenied {
                    return Err(Error::PermissionDenied(format!("failed to add route {}: {}", route, e)));
                } else {
                    return Err(Error::Route(format!("failed to add route {}: {}", route, e)));
                }
            }
        }

        Ok(())
    }

    /// Look up the current system default route
    #[cfg(feature = "async-tokio")]
    pub async fn default_route(&self) -> Result<Option<DefaultRoute>> {
        let route = self
            .handle
            .default_route()
            .await
            .map_err(|e| Error::Route(format!("failed to query default route: {}", e)))?;

        Ok(route.map(|r| DefaultRoute {
            gateway: r.gateway,
            ifindex: r.ifindex,
        }))
    }
}

#[cfg(feature = "async-tokio")]
fn to_net_route(route: &Route) -> Result<net_route::Route> {
    let mut net_route =
        net_route::Route::new(route.destination.addr(), route.destination.prefix_len());

    if let Some(gw) = route.gateway {
        net_route = net_route.with_gateway(gw);
    }

    if let Some(ref iface) = route.interface {
        net_route = net_route.with_ifindex(interface_index(iface)?);
    }

    Ok(net_route)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_route_creation() {
        let route = Route::ipv4(Ipv4Addr::new(10, 0, 0, 0), 24).unwrap();

        assert!(route.is_ipv4());
        assert!(!route.is_default());
        assert!(route.gateway.is_none());
    }

    #[test]
    fn test_catch_all_routes() {
        let v4 = Route::catch_all_v4();
        assert!(v4.is_default());
        assert!(v4.is_ipv4());
        assert_eq!(v4.destination.to_string(), "0.0.0.0/0");

        let v6 = Route::catch_all_v6();
        assert!(v6.is_default());
        assert!(v6.is_ipv6());
        assert_eq!(v6.destination.to_string(), "::/0");
    }

    #[test]
    fn test_route_display() {
        let route = Route::ipv4(Ipv4Addr::new(10, 0, 0, 0), 24)
            .unwrap()
            .with_gateway(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 1)))
            .with_interface("tun0");

        let display = format!("{}", route);
        assert!(display.contains("10.0.0.0/24"));
        assert!(display.contains("via 192.168.1.1"));
        assert!(display.contains("dev tun0"));
    }

    #[test]
    fn test_invalid_prefix() {
        assert!(Route::ipv6(Ipv6Addr::UNSPECIFIED, 129).is_err());
    }
}
