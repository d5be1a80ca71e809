//! Interface provisioning
//!
//! Turns an [`InterfaceRequest`] into a live [`TunInterface`]. Two defaults
//! are applied on top of what the engine asked for:
//!
//! - a family that has addresses but no routes gets a catch-all route, so
//!   traffic is captured even when the engine omitted explicit routes;
//! - a request without DNS servers gets one fallback resolver.
//!
//! The host application is always excluded from the tunnel so its own
//! traffic never loops back through the interface.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use ipnet::IpNet;

use crate::error::{Error, Result};
use crate::platform::{TunInterface, TunPlatform};
use crate::request::InterfaceRequest;
use crate::route::Route;

/// Resolver used when the engine supplies no DNS servers
pub const DEFAULT_FALLBACK_DNS: IpAddr = IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1));

/// Session name shown by the OS for the tunnel
pub const DEFAULT_SESSION_NAME: &str = "tunkeep";

/// Static provisioning settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionSettings {
    /// Name shown by the OS for the tunnel session
    pub session_name: String,
    /// Resolver used when the request carries none
    pub fallback_dns: IpAddr,
    /// Identifier of the host application, always kept outside the tunnel
    pub host_application: String,
}

impl Default for ProvisionSettings {
    fn default() -> Self {
        Self {
            session_name: DEFAULT_SESSION_NAME.to_string(),
            fallback_dns: DEFAULT_FALLBACK_DNS,
            host_application: DEFAULT_SESSION_NAME.to_string(),
        }
    }
}

/// Everything the provisioner will apply, in application order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionPlan {
    pub session_name: String,
    pub mtu: u16,
    /// IPv4 addresses first, then IPv6, each in request order
    pub addresses: Vec<IpNet>,
    /// IPv4 routes first, then IPv6, with catch-all defaults filled in
    pub routes: Vec<Route>,
    pub dns_servers: Vec<IpAddr>,
    /// Host application first
    pub excluded_applications: Vec<String>,
    pub default_route_v4: bool,
    pub default_route_v6: bool,
    pub fallback_dns: bool,
}

impl ProvisionPlan {
    /// One human-readable line per applied item
    pub fn describe(&self) -> Vec<String> {
        let mut lines = Vec::new();
        lines.push(format!("TUN session={} MTU={}", self.session_name, self.mtu));
        for address in &self.addresses {
            lines.push(format!("TUN address: {}", address));
        }
        for route in &self.routes {
            if route.is_default()
                && ((route.is_ipv4() && self.default_route_v4)
                    || (route.is_ipv6() && self.default_route_v6))
            {
                lines.push(format!("No routes requested, adding default {}", route));
            } else {
                lines.push(format!("TUN route: {}", route));
            }
        }
        for dns in &self.dns_servers {
            if self.fallback_dns {
                lines.push(format!("No DNS requested, using fallback {}", dns));
            } else {
                lines.push(format!("TUN DNS: {}", dns));
            }
        }
        for app in &self.excluded_applications {
            lines.push(format!("Excluding {} from tunnel", app));
        }
        lines
    }
}

/// Builds virtual interfaces on a [`TunPlatform`]
#[derive(Clone)]
pub struct Provisioner {
    platform: Arc<dyn TunPlatform>,
    settings: ProvisionSettings,
}

impl Provisioner {
    /// Create a provisioner for the given platform
    pub fn new(platform: Arc<dyn TunPlatform>, settings: ProvisionSettings) -> Self {
        Self { platform, settings }
    }

    /// Provisioning settings
    pub fn settings(&self) -> &ProvisionSettings {
        &self.settings
    }

    /// The platform this provisioner builds on
    pub fn platform(&self) -> &Arc<dyn TunPlatform> {
        &self.platform
    }

    /// Compute what [`apply`](Self::apply) would configure for a request
    pub fn plan(&self, request: &InterfaceRequest) -> ProvisionPlan {
        let mut addresses: Vec<IpNet> = Vec::new();
        addresses.extend(request.inet4_addresses.iter().map(|a| IpNet::V4(*a)));
        addresses.extend(request.inet6_addresses.iter().map(|a| IpNet::V6(*a)));

        let mut routes: Vec<Route> = Vec::new();
        routes.extend(request.inet4_routes.iter().map(|r| Route::from(*r)));
        let default_route_v4 = request.inet4_routes.is_empty() && request.has_inet4();
        if default_route_v4 {
            routes.push(Route::catch_all_v4());
        }

        routes.extend(request.inet6_routes.iter().map(|r| Route::from(*r)));
        let default_route_v6 = request.inet6_routes.is_empty() && request.has_inet6();
        if default_route_v6 {
            routes.push(Route::catch_all_v6());
        }

        let fallback_dns = request.dns_servers.is_empty();
        let dns_servers = if fallback_dns {
            vec![self.settings.fallback_dns]
        } else {
            request.dns_servers.clone()
        };

        let mut excluded_applications = vec![self.settings.host_application.clone()];
        if let Some(ref app) = request.excluded_application {
            if *app != self.settings.host_application {
                excluded_applications.push(app.clone());
            }
        }

        ProvisionPlan {
            session_name: self.settings.session_name.clone(),
            mtu: request.mtu,
            addresses,
            routes,
            dns_servers,
            excluded_applications,
            default_route_v4,
            default_route_v6,
            fallback_dns,
        }
    }

    /// Validate, plan and establish an interface for a request
    pub async fn provision(&self, request: &InterfaceRequest) -> Result<Box<dyn TunInterface>> {
        request.validate()?;
        let plan = self.plan(request);
        self.apply(&plan).await
    }

    /// Establish an interface from a precomputed plan
    pub async fn apply(&self, plan: &ProvisionPlan) -> Result<Box<dyn TunInterface>> {
        if !self.platform.has_permission() {
            return Err(Error::PermissionDenied(
                "tunnel capability is not granted".into(),
            ));
        }

        let mut builder = self.platform.new_builder()?;
        builder.set_session(&plan.session_name);
        builder.set_mtu(plan.mtu)?;

        for address in &plan.addresses {
            builder.add_address(*address)?;
        }

        for route in &plan.routes {
            builder.add_route(route)?;
        }

        for dns in &plan.dns_servers {
            builder.add_dns_server(*dns)?;
        }

        for app in &plan.excluded_applications {
            // The tunnel stays usable without the exclusion; report and go on
            if let Err(e) = builder.exclude_application(app) {
                log::warn!("Failed to exclude {} from tunnel: {}", app, e);
            }
        }

        let interface = builder.establish().await?;
        log::info!(
            "TUN established: {} fd={} MTU={}",
            interface.name(),
            interface.fd(),
            interface.mtu()
        );
        Ok(interface)
    }
}
