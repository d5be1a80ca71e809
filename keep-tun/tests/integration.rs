//! Integration tests for keep-tun
//!
//! # Permission Requirements
//!
//! Creating a real tunnel device needs elevated privileges. Those tests are
//! marked with `#[ignore]`; everything else runs unprivileged.
//!
//! ## Running Privileged Tests
//!
//! ### Linux
//! ```bash
//! # Option 1: Run as root
//! sudo cargo test -p keep-tun --test integration -- --ignored
//!
//! # Option 2: Add CAP_NET_ADMIN capability to the test binary
//! cargo test -p keep-tun --test integration --no-run
//! sudo setcap cap_net_admin+ep target/debug/deps/integration-*
//! cargo test -p keep-tun --test integration -- --ignored
//! ```
//!
//! ### macOS
//! ```bash
//! sudo cargo test -p keep-tun --test integration -- --ignored
//! ```
//!
//! ## Test Categories
//!
//! - `test_*` - Request and plan tests (no privileges required)
//! - `test_privileged_*` - Tests requiring root/admin (marked with `#[ignore]`)

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

use ipnet::IpNet;
use keep_tun::{
    Error, InterfaceRequest, ProvisionSettings, Provisioner, Route, SystemTunPlatform,
    TunPlatform, DEFAULT_FALLBACK_DNS,
};

fn system_provisioner() -> Provisioner {
    Provisioner::new(Arc::new(SystemTunPlatform::new()), ProvisionSettings::default())
}

/// A request needs at least one address
#[test]
fn test_request_requires_address() {
    let result = InterfaceRequest::builder().mtu(1400).build();
    assert!(matches!(result, Err(Error::Config(_))));
}

/// Mixed families keep their own lists, in request order
#[test]
fn test_request_mixed_families() {
    let request = InterfaceRequest::builder()
        .address_str("172.19.0.1/30")
        .unwrap()
        .address_str("fdfe:dcba:9876::1/126")
        .unwrap()
        .route_str("10.0.0.0/8")
        .unwrap()
        .dns_list("8.8.8.8, 2001:4860:4860::8888")
        .unwrap()
        .build()
        .unwrap();

    assert!(request.has_inet4());
    assert!(request.has_inet6());
    assert_eq!(request.inet4_addresses[0].addr(), Ipv4Addr::new(172, 19, 0, 1));
    assert_eq!(
        request.inet6_addresses[0].addr(),
        "fdfe:dcba:9876::1".parse::<Ipv6Addr>().unwrap()
    );
    assert_eq!(request.inet4_routes.len(), 1);
    assert!(request.inet6_routes.is_empty());
    assert_eq!(request.dns_servers.len(), 2);
}

/// Malformed CIDR strings are reported, not silently dropped
#[test]
fn test_request_rejects_bad_cidr() {
    let result = InterfaceRequest::builder().address_str("10.0.0.300/24");
    assert!(matches!(result, Err(Error::InvalidAddress(_))));
}

/// Families without routes get a catch-all; families with routes do not
#[test]
fn test_plan_default_route_per_family() {
    let request = InterfaceRequest::builder()
        .address_str("172.19.0.1/30")
        .unwrap()
        .address_str("fdfe:dcba:9876::1/126")
        .unwrap()
        .route_str("2001:db8::/32")
        .unwrap()
        .build()
        .unwrap();

    let plan = system_provisioner().plan(&request);

    assert!(plan.default_route_v4);
    assert!(!plan.default_route_v6);
    let destinations: Vec<String> = plan.routes.iter().map(|r| r.destination.to_string()).collect();
    assert_eq!(destinations, vec!["0.0.0.0/0", "2001:db8::/32"]);
}

/// Without requested resolvers exactly one fallback is used
#[test]
fn test_plan_fallback_dns() {
    let request = InterfaceRequest::builder()
        .address_str("172.19.0.1/30")
        .unwrap()
        .build()
        .unwrap();

    let plan = system_provisioner().plan(&request);
    assert!(plan.fallback_dns);
    assert_eq!(plan.dns_servers, vec![DEFAULT_FALLBACK_DNS]);
    assert_eq!(plan.excluded_applications, vec!["tunkeep".to_string()]);

    let lines = plan.describe();
    assert!(lines.iter().any(|l| l.contains("using fallback 1.1.1.1")));
    assert!(lines.iter().any(|l| l.contains("adding default 0.0.0.0/0")));
}

/// Requested resolvers replace the fallback
#[test]
fn test_plan_requested_dns() {
    let request = InterfaceRequest::builder()
        .address_str("172.19.0.1/30")
        .unwrap()
        .dns(IpAddr::V4(Ipv4Addr::new(9, 9, 9, 9)))
        .exclude_application("com.example.browser")
        .build()
        .unwrap();

    let plan = system_provisioner().plan(&request);
    assert!(!plan.fallback_dns);
    assert_eq!(plan.dns_servers, vec![IpAddr::V4(Ipv4Addr::new(9, 9, 9, 9))]);
    assert_eq!(
        plan.excluded_applications,
        vec!["tunkeep".to_string(), "com.example.browser".to_string()]
    );
}

/// Test route creation helpers
#[test]
fn test_route_catch_all() {
    let v4 = Route::catch_all_v4();
    assert!(v4.is_default());
    assert!(v4.is_ipv4());

    let v6 = Route::catch_all_v6();
    assert!(v6.is_default());
    assert!(v6.is_ipv6());

    let specific = Route::new("192.168.0.0/16".parse::<IpNet>().unwrap());
    assert!(!specific.is_default());
}

/// Provisioning without privileges fails with PermissionDenied
#[tokio::test]
async fn test_provision_without_permission() {
    let platform = SystemTunPlatform::new();
    if platform.has_permission() {
        // Running privileged; covered by the ignored tests below
        return;
    }

    let request = InterfaceRequest::builder()
        .address_str("172.19.0.1/30")
        .unwrap()
        .build()
        .unwrap();

    let result = system_provisioner().provision(&request).await;
    assert!(matches!(result, Err(Error::PermissionDenied(_))));
}

/// The default route lookup never fails hard on an ordinary host
#[tokio::test]
async fn test_default_route_query() {
    let manager = match keep_tun::RouteManager::new() {
        Ok(manager) => manager,
        Err(_) => return,
    };

    if let Ok(Some(route)) = manager.default_route().await {
        // Whatever the host reports must name a gateway or an interface
        assert!(route.gateway.is_some() || route.ifindex.is_some());
    }
}

/// Create a real device, check its identity and close it
#[tokio::test]
#[ignore = "requires root/admin privileges"]
async fn test_privileged_provision_and_close() {
    let request = InterfaceRequest::builder()
        .address_str("172.31.254.1/30")
        .unwrap()
        .route_str("172.31.253.0/24")
        .unwrap()
        .mtu(1400)
        .build()
        .unwrap();

    let settings = ProvisionSettings {
        session_name: "tunkeep-it".to_string(),
        ..ProvisionSettings::default()
    };
    let provisioner = Provisioner::new(Arc::new(SystemTunPlatform::new()), settings);

    let mut interface = provisioner
        .provision(&request)
        .await
        .expect("failed to provision interface");

    assert!(!interface.name().is_empty());
    assert_eq!(interface.mtu(), 1400);
    #[cfg(unix)]
    assert!(interface.fd() >= 0);

    interface.close().expect("failed to close interface");
    // Closing twice is harmless
    interface.close().expect("second close failed");
}
