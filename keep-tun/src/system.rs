//! System tunnel backend
//!
//! A thin wrapper around `tun-rs` (device, addresses, MTU) and `net-route`
//! (routes). Requires root or `CAP_NET_ADMIN` on Linux, root on macOS and
//! Administrator with the WinTun driver on Windows.

use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::platform::{InterfaceBuilder, TunInterface, TunPlatform, TunnelFd};
use crate::route::{Route, RouteManager};
use crate::DEFAULT_MTU;

/// [`TunPlatform`] backed by the host operating system
#[derive(Debug, Clone, Default)]
pub struct SystemTunPlatform {
    /// Mark applied to protected sockets (Linux `SO_MARK`)
    fwmark: Option<u32>,
    /// Names of the devices currently open through this platform
    live: Registry,
}

type Registry = Arc<Mutex<HashSet<String>>>;

impl SystemTunPlatform {
    /// Create a platform handle
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark protected sockets with `fwmark` so policy routing can send them
    /// around the tunnel
    pub fn with_fwmark(mut self, fwmark: Option<u32>) -> Self {
        self.fwmark = fwmark;
        self
    }

    /// Whether `name` is a device this platform created and has not closed.
    /// The OS may pick the name itself (macOS `utunN`), so this is the only
    /// reliable way to recognise the tunnel from outside.
    pub fn owns_interface(&self, name: &str) -> bool {
        self.live.lock().contains(name)
    }
}

impl TunPlatform for SystemTunPlatform {
    fn has_permission(&self) -> bool {
        #[cfg(unix)]
        {
            // SAFETY: geteuid has no preconditions
            unsafe { libc::geteuid() == 0 }
        }

        #[cfg(not(unix))]
        {
            true
        }
    }

    fn new_builder(&self) -> Result<Box<dyn InterfaceBuilder>> {
        Ok(Box::new(SystemInterfaceBuilder {
            registry: self.live.clone(),
            ..SystemInterfaceBuilder::default()
        }))
    }

    fn protect(&self, fd: TunnelFd) -> bool {
        match self.fwmark {
            Some(mark) => set_socket_mark(fd, mark),
            None => {
                log::debug!("No fwmark configured, socket {} left unmarked", fd);
                true
            }
        }
    }
}

#[cfg(target_os = "linux")]
fn set_socket_mark(fd: TunnelFd, mark: u32) -> bool {
    let value: libc::c_uint = mark;
    // SAFETY: fd is owned by the caller; value outlives the call
    let ret = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_MARK,
            &value as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_uint>() as libc::socklen_t,
        )
    };
    if ret != 0 {
        log::warn!(
            "Failed to mark socket {}: {}",
            fd,
            std::io::Error::last_os_error()
        );
        return false;
    }
    true
}

#[cfg(not(target_os = "linux"))]
fn set_socket_mark(fd: TunnelFd, _mark: u32) -> bool {
    log::warn!("Socket marking not supported on this platform (fd {})", fd);
    false
}

#[derive(Debug)]
struct SystemInterfaceBuilder {
    session: Option<String>,
    mtu: u16,
    inet4: Option<Ipv4Net>,
    inet6: Vec<Ipv6Net>,
    routes: Vec<Route>,
    dns_servers: Vec<IpAddr>,
    excluded: Vec<String>,
    registry: Registry,
}

impl Default for SystemInterfaceBuilder {
    fn default() -> Self {
        Self {
            session: None,
            mtu: DEFAULT_MTU,
            inet4: None,
            inet6: Vec::new(),
            routes: Vec::new(),
            dns_servers: Vec::new(),
            excluded: Vec::new(),
            registry: Registry::default(),
        }
    }
}

/// Split a catch-all route into two halves so the system default route
/// stays in place underneath the tunnel
fn split_catch_all(route: &Route) -> Vec<Route> {
    if !route.is_default() {
        return vec![route.clone()];
    }
    let halves: [&str; 2] = if route.is_ipv4() {
        ["0.0.0.0/1", "128.0.0.0/1"]
    } else {
        ["::/1", "8000::/1"]
    };
    halves
        .iter()
        .filter_map(|h| h.parse::<IpNet>().ok())
        .map(Route::new)
        .collect()
}

#[async_trait]
impl InterfaceBuilder for SystemInterfaceBuilder {
    fn set_session(&mut self, name: &str) {
        self.session = Some(name.to_string());
    }

    fn set_mtu(&mut self, mtu: u16) -> Result<()> {
        if mtu < 68 {
            return Err(Error::Rejected(format!("MTU {} is too small", mtu)));
        }
        self.mtu = mtu;
        Ok(())
    }

    fn add_address(&mut self, address: IpNet) -> Result<()> {
        match address {
            IpNet::V4(net) => {
                if self.inet4.is_some() {
                    return Err(Error::Rejected(format!(
                        "only one IPv4 address per interface is supported, got {}",
                        net
                    )));
                }
                self.inet4 = Some(net);
            }
            IpNet::V6(net) => self.inet6.push(net),
        }
        Ok(())
    }

    fn add_route(&mut self, route: &Route) -> Result<()> {
        self.routes.extend(split_catch_all(route));
        Ok(())
    }

    fn add_dns_server(&mut self, server: IpAddr) -> Result<()> {
        self.dns_servers.push(server);
        Ok(())
    }

    fn exclude_application(&mut self, identifier: &str) -> Result<()> {
        self.excluded.push(identifier.to_string());
        Ok(())
    }

    async fn establish(self: Box<Self>) -> Result<Box<dyn TunInterface>> {
        #[allow(unused_mut)] // mut needed on non-macOS platforms
        let mut builder = tun_rs::DeviceBuilder::new();

        // On macOS the system assigns a utun name
        #[cfg(not(target_os = "macos"))]
        {
            if let Some(ref name) = self.session {
                builder = builder.name(name);
            }
        }

        if let Some(ref ipv4) = self.inet4 {
            builder = builder.ipv4(ipv4.addr(), ipv4.prefix_len(), None);
        }

        for ipv6 in &self.inet6 {
            builder = builder.ipv6(ipv6.addr(), ipv6.prefix_len());
        }

        builder = builder.mtu(self.mtu);

        let device = builder.build_async().map_err(|e| {
            if e.kind() == std::io::ErrorKind::PermissionDenied {
                Error::PermissionDenied(e.to_string())
            } else {
                Error::DeviceCreation(e.to_string())
            }
        })?;

        let name = device
            .name()
            .map_err(|e| Error::DeviceCreation(e.to_string()))?;

        #[cfg(unix)]
        let fd = {
            use std::os::unix::io::AsRawFd;
            device.as_raw_fd()
        };
        #[cfg(not(unix))]
        let fd: TunnelFd = -1;

        log::info!("Created TUN device: {} (MTU: {})", name, self.mtu);

        // Routes bound to the device disappear with it, so close() has
        // nothing to undo
        let route_manager = RouteManager::new()?;
        for route in &self.routes {
            route_manager
                .add(&route.clone().with_interface(&name))
                .await?;
        }

        if !self.dns_servers.is_empty() {
            let list: Vec<String> = self.dns_servers.iter().map(|d| d.to_string()).collect();
            log::info!("DNS servers for {}: {}", name, list.join(","));
        }

        for app in &self.excluded {
            log::warn!(
                "Per-application exclusion is not enforced on this platform ({}); use protected sockets",
                app
            );
        }

        self.registry.lock().insert(name.clone());

        Ok(Box::new(SystemInterface {
            device: Some(device),
            name,
            mtu: self.mtu,
            fd,
            registry: self.registry.clone(),
        }))
    }
}

/// A `tun-rs` device owned by a tunnel session
pub struct SystemInterface {
    device: Option<tun_rs::AsyncDevice>,
    name: String,
    mtu: u16,
    fd: TunnelFd,
    registry: Registry,
}

impl TunInterface for SystemInterface {
    fn name(&self) -> &str {
        &self.name
    }

    fn fd(&self) -> TunnelFd {
        self.fd
    }

    fn mtu(&self) -> u16 {
        self.mtu
    }

    fn close(&mut self) -> Result<()> {
        self.registry.lock().remove(&self.name);
        if self.device.take().is_some() {
            log::info!("Closed TUN device: {}", self.name);
        }
        Ok(())
    }
}

impl Drop for SystemInterface {
    fn drop(&mut self) {
        self.registry.lock().remove(&self.name);
    }
}

impl std::fmt::Debug for SystemInterface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SystemInterface")
            .field("name", &self.name)
            .field("mtu", &self.mtu)
            .field("open", &self.device.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_catch_all_v4() {
        let halves = split_catch_all(&Route::catch_all_v4());
        let rendered: Vec<String> = halves.iter().map(|r| r.destination.to_string()).collect();
        assert_eq!(rendered, vec!["0.0.0.0/1", "128.0.0.0/1"]);
    }

    #[test]
    fn test_split_catch_all_v6() {
        let halves = split_catch_all(&Route::catch_all_v6());
        let rendered: Vec<String> = halves.iter().map(|r| r.destination.to_string()).collect();
        assert_eq!(rendered, vec!["::/1", "8000::/1"]);
    }

    #[test]
    fn test_split_keeps_specific_route() {
        let route: Route = "10.0.0.0/8".parse::<Ipv4Net>().unwrap().into();
        assert_eq!(split_catch_all(&route), vec![route]);
    }

    #[test]
    fn test_builder_rejects_second_ipv4() {
        let mut builder = SystemInterfaceBuilder::default();
        builder.add_address("10.0.0.2/24".parse().unwrap()).unwrap();
        let result = builder.add_address("10.0.1.2/24".parse().unwrap());
        assert!(matches!(result, Err(Error::Rejected(_))));
    }

    #[test]
    fn test_builder_rejects_tiny_mtu() {
        let mut builder = SystemInterfaceBuilder::default();
        assert!(builder.set_mtu(40).is_err());
        assert!(builder.set_mtu(1400).is_ok());
    }

    fn idle_interface(platform: &SystemTunPlatform, name: &str) -> SystemInterface {
        platform.live.lock().insert(name.to_string());
        SystemInterface {
            device: None,
            name: name.to_string(),
            mtu: DEFAULT_MTU,
            fd: -1,
            registry: platform.live.clone(),
        }
    }

    #[test]
    fn test_owned_interface_released_on_close() {
        let platform = SystemTunPlatform::new();
        let mut iface = idle_interface(&platform, "utun7");
        assert!(platform.owns_interface("utun7"));
        assert!(!platform.owns_interface("en0"));

        iface.close().unwrap();
        assert!(!platform.owns_interface("utun7"));
    }

    #[test]
    fn test_owned_interface_released_on_drop() {
        let platform = SystemTunPlatform::new();
        let iface = idle_interface(&platform, "utun3");
        drop(iface);
        assert!(!platform.owns_interface("utun3"));
    }

    #[test]
    fn test_clones_share_ownership() {
        let platform = SystemTunPlatform::new().with_fwmark(Some(51820));
        let watcher_view = platform.clone();
        let _iface = idle_interface(&platform, "tunkeep");
        assert!(watcher_view.owns_interface("tunkeep"));
    }
}
