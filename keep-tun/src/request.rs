//! Interface requests reported by the tunneling engine

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use ipnet::{IpNet, Ipv4Net, Ipv6Net};

use crate::error::{Error, Result};
use crate::DEFAULT_MTU;

/// Addressing, routing and DNS the engine wants on its virtual interface.
///
/// Every list keeps the order in which the engine reported it; the
/// provisioner applies entries in that order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceRequest {
    /// IPv4 addresses with prefix length
    pub inet4_addresses: Vec<Ipv4Net>,
    /// IPv6 addresses with prefix length
    pub inet6_addresses: Vec<Ipv6Net>,
    /// IPv4 routes to capture
    pub inet4_routes: Vec<Ipv4Net>,
    /// IPv6 routes to capture
    pub inet6_routes: Vec<Ipv6Net>,
    /// DNS servers to advertise on the interface
    pub dns_servers: Vec<IpAddr>,
    /// Maximum transmission unit
    pub mtu: u16,
    /// Additional application to keep outside the tunnel
    pub excluded_application: Option<String>,
}

impl Default for InterfaceRequest {
    fn default() -> Self {
        Self {
            inet4_addresses: Vec::new(),
            inet6_addresses: Vec::new(),
            inet4_routes: Vec::new(),
            inet6_routes: Vec::new(),
            dns_servers: Vec::new(),
            mtu: DEFAULT_MTU,
            excluded_application: None,
        }
    }
}

impl InterfaceRequest {
    /// Create a new request builder
    pub fn builder() -> InterfaceRequestBuilder {
        InterfaceRequestBuilder::new()
    }

    /// Whether the request carries at least one IPv4 address
    pub fn has_inet4(&self) -> bool {
        !self.inet4_addresses.is_empty()
    }

    /// Whether the request carries at least one IPv6 address
    pub fn has_inet6(&self) -> bool {
        !self.inet6_addresses.is_empty()
    }

    /// Validate the request
    pub fn validate(&self) -> Result<()> {
        if self.inet4_addresses.is_empty() && self.inet6_addresses.is_empty() {
            return Err(Error::Config(
                "at least one IPv4 or IPv6 address must be requested".into(),
            ));
        }

        if self.mtu < 68 {
            return Err(Error::Config(format!(
                "MTU {} is too small (minimum 68)",
                self.mtu
            )));
        }

        if let Some(ref app) = self.excluded_application {
            if app.trim().is_empty() {
                return Err(Error::Config("excluded application must not be blank".into()));
            }
        }

        Ok(())
    }
}

/// Builder for [`InterfaceRequest`]
#[derive(Debug, Default)]
pub struct InterfaceRequestBuilder {
    request: InterfaceRequest,
}

impl InterfaceRequestBuilder {
    /// Create a new builder with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an IPv4 address
    pub fn ipv4(mut self, address: impl Into<Ipv4Addr>, prefix_len: u8) -> Result<Self> {
        let net = Ipv4Net::new(address.into(), prefix_len)
            .map_err(|e| Error::InvalidPrefix(e.to_string()))?;
        self.request.inet4_addresses.push(net);
        Ok(self)
    }

    /// Add an IPv6 address
    pub fn ipv6(mut self, address: impl Into<Ipv6Addr>, prefix_len: u8) -> Result<Self> {
        let net = Ipv6Net::new(address.into(), prefix_len)
            .map_err(|e| Error::InvalidPrefix(e.to_string()))?;
        self.request.inet6_addresses.push(net);
        Ok(self)
    }

    /// Add an address in CIDR notation, sorted by family (e.g. "172.19.0.1/30")
    pub fn address_str(mut self, cidr: &str) -> Result<Self> {
        match parse_cidr(cidr)? {
            IpNet::V4(net) => self.request.inet4_addresses.push(net),
            IpNet::V6(net) => self.request.inet6_addresses.push(net),
        }
        Ok(self)
    }

    /// Add an IPv4 route
    pub fn route_v4(mut self, destination: impl Into<Ipv4Addr>, prefix_len: u8) -> Result<Self> {
        let net = Ipv4Net::new(destination.into(), prefix_len)
            .map_err(|e| Error::InvalidPrefix(e.to_string()))?;
        self.request.inet4_routes.push(net);
        Ok(self)
    }

    /// Add an IPv6 route
    pub fn route_v6(mut self, destination: impl Into<Ipv6Addr>, prefix_len: u8) -> Result<Self> {
        let net = Ipv6Net::new(destination.into(), prefix_len)
            .map_err(|e| Error::InvalidPrefix(e.to_string()))?;
        self.request.inet6_routes.push(net);
        Ok(self)
    }

    /// Add a route in CIDR notation, sorted by family
    pub fn route_str(mut self, cidr: &str) -> Result<Self> {
        match parse_cidr(cidr)? {
            IpNet::V4(net) => self.request.inet4_routes.push(net),
            IpNet::V6(net) => self.request.inet6_routes.push(net),
        }
        Ok(self)
    }

    /// Add a DNS server
    pub fn dns(mut self, server: impl Into<IpAddr>) -> Self {
        self.request.dns_servers.push(server.into());
        self
    }

    /// Add DNS servers from a comma-separated list, skipping blank items
    pub fn dns_list(mut self, list: &str) -> Result<Self> {
        for item in list.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            let addr: IpAddr = item
                .parse()
                .map_err(|_| Error::InvalidAddress(item.to_string()))?;
            self.request.dns_servers.push(addr);
        }
        Ok(self)
    }

    /// Set the MTU
    pub fn mtu(mut self, mtu: u16) -> Self {
        self.request.mtu = mtu;
        self
    }

    /// Keep an additional application outside the tunnel
    pub fn exclude_application(mut self, identifier: impl Into<String>) -> Self {
        self.request.excluded_application = Some(identifier.into());
        self
    }

    /// Return the request without validating it
    pub fn into_request(self) -> InterfaceRequest {
        self.request
    }

    /// Build and validate the request
    pub fn build(self) -> Result<InterfaceRequest> {
        self.request.validate()?;
        Ok(self.request)
    }
}

fn parse_cidr(cidr: &str) -> Result<IpNet> {
    cidr.trim()
        .parse::<IpNet>()
        .map_err(|_| Error::InvalidAddress(cidr.to_string()))
}
