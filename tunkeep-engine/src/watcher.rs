//! Default-route network watcher
//!
//! Polls the system default route and turns changes into [`NetworkChange`]
//! notifications. The tunnel's own interface is never reported as the
//! default network; the caller decides which names belong to the tunnel.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use keep_tun::route::interface_name;
use keep_tun::RouteManager;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use crate::monitor::{DefaultInterface, NetworkCallback, NetworkChange, NetworkWatcher, SubscriptionId};

/// Default polling interval
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Tells whether an interface name belongs to the tunnel
pub type TunnelFilter = Arc<dyn Fn(&str) -> bool + Send + Sync>;

#[derive(Default)]
struct Shared {
    subscribers: Mutex<HashMap<SubscriptionId, NetworkCallback>>,
    next_id: AtomicU64,
    /// `None` until the first successful poll
    last: Mutex<Option<Option<DefaultInterface>>>,
}

impl Shared {
    fn emit(&self, change: NetworkChange) {
        let subscribers: Vec<NetworkCallback> =
            self.subscribers.lock().values().cloned().collect();
        for callback in subscribers {
            callback(change.clone());
        }
    }

    fn observe(&self, current: Option<DefaultInterface>) {
        let change = {
            let mut last = self.last.lock();
            let previous = last.replace(current.clone()).flatten();
            diff(previous.as_ref(), current.as_ref())
        };

        if let Some(change) = change {
            log::debug!("Default network change: {:?}", change);
            self.emit(change);
        }
    }
}

/// Change between two samples of the default interface
fn diff(
    previous: Option<&DefaultInterface>,
    current: Option<&DefaultInterface>,
) -> Option<NetworkChange> {
    match (previous, current) {
        (None, Some(now)) => Some(NetworkChange::Available(now.clone())),
        (Some(_), None) => Some(NetworkChange::Lost),
        (Some(before), Some(now)) if before != now => Some(NetworkChange::Changed(now.clone())),
        _ => None,
    }
}

/// Default interface for a sampled route, `None` when the route runs
/// through the tunnel itself
fn outside_interface(
    name: String,
    index: Option<u32>,
    is_tunnel: &TunnelFilter,
) -> Option<DefaultInterface> {
    if is_tunnel(&name) {
        return None;
    }
    Some(DefaultInterface::new(name, index))
}

/// [`NetworkWatcher`] polling the routing table via `net-route`
pub struct RouteWatcher {
    shared: Arc<Shared>,
    task: JoinHandle<()>,
}

impl RouteWatcher {
    /// Start polling every `interval`. Samples whose interface satisfies
    /// `is_tunnel` are skipped. Match on the names the platform actually
    /// created (see `SystemTunPlatform::owns_interface`); the configured
    /// session name is not the device name on macOS.
    pub fn start(
        runtime: &Handle,
        interval: Duration,
        is_tunnel: impl Fn(&str) -> bool + Send + Sync + 'static,
    ) -> Self {
        let shared = Arc::new(Shared::default());
        let is_tunnel: TunnelFilter = Arc::new(is_tunnel);

        let poller = shared.clone();
        let task = runtime.spawn(async move {
            let manager = match RouteManager::new() {
                Ok(manager) => manager,
                Err(e) => {
                    log::error!("Network watcher disabled: {}", e);
                    return;
                }
            };

            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;

                let current = match manager.default_route().await {
                    Ok(Some(route)) => {
                        let name = route
                            .ifindex
                            .and_then(interface_name)
                            .unwrap_or_else(|| "unknown".to_string());
                        match outside_interface(name, route.ifindex, &is_tunnel) {
                            Some(iface) => Some(iface),
                            None => continue,
                        }
                    }
                    Ok(None) => None,
                    Err(e) => {
                        log::warn!("Failed to read default route: {}", e);
                        continue;
                    }
                };

                poller.observe(current);
            }
        });

        Self { shared, task }
    }
}

impl NetworkWatcher for RouteWatcher {
    fn subscribe(&self, on_change: NetworkCallback) -> SubscriptionId {
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.shared
            .subscribers
            .lock()
            .insert(id, on_change.clone());

        let known = self.shared.last.lock().clone().flatten();
        if let Some(iface) = known {
            on_change(NetworkChange::Available(iface));
        }
        id
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        self.shared.subscribers.lock().remove(&id);
    }
}

impl Drop for RouteWatcher {
    fn drop(&mut self) {
        self.task.abort();
    }
}
