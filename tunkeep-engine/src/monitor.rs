//! Connectivity monitor
//!
//! Watches the default network through a [`NetworkWatcher`] and decides when
//! a loss is real. A loss is reported to the engine's interface listener right
//! away, but the controller only hears about it once the network has stayed
//! down for the whole debounce window. Recreating the tunnel's own interface
//! can produce a short spurious loss, which this window absorbs.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use crate::logbuf::LogBuffer;

/// Identity of the network interface carrying the default route
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DefaultInterface {
    pub name: String,
    pub index: Option<u32>,
}

impl DefaultInterface {
    pub fn new(name: impl Into<String>, index: Option<u32>) -> Self {
        Self {
            name: name.into(),
            index,
        }
    }
}

impl std::fmt::Display for DefaultInterface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.index {
            Some(idx) => write!(f, "{} (index {})", self.name, idx),
            None => write!(f, "{}", self.name),
        }
    }
}

/// A change of the default network as reported by the OS
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkChange {
    /// A default network became available
    Available(DefaultInterface),
    /// The default network moved to another interface
    Changed(DefaultInterface),
    /// No default network
    Lost,
}

/// Handle returned by [`NetworkWatcher::subscribe`]
pub type SubscriptionId = u64;

/// Callback invoked for every network change. May run on any thread.
pub type NetworkCallback = Arc<dyn Fn(NetworkChange) + Send + Sync>;

/// OS network reachability capability
pub trait NetworkWatcher: Send + Sync {
    fn subscribe(&self, on_change: NetworkCallback) -> SubscriptionId;
    fn unsubscribe(&self, id: SubscriptionId);
}

/// The engine's view of the default interface
pub trait InterfaceUpdateListener: Send + Sync {
    /// `None` means there is currently no usable default interface
    fn update_default_interface(&self, interface: Option<&DefaultInterface>);
}

/// Receiver of debounced loss decisions
pub trait LossHandler: Send + Sync {
    fn on_loss_confirmed(&self);
}

#[derive(Default)]
struct MonitorState {
    running: bool,
    subscription: Option<SubscriptionId>,
    current: Option<DefaultInterface>,
    listener: Option<Arc<dyn InterfaceUpdateListener>>,
    pending: Option<JoinHandle<()>>,
}

struct MonitorInner {
    watcher: Arc<dyn NetworkWatcher>,
    handler: Arc<dyn LossHandler>,
    logs: Arc<LogBuffer>,
    debounce: Duration,
    runtime: Handle,
    state: Mutex<MonitorState>,
}

/// Per-session connectivity monitor
#[derive(Clone)]
pub struct ConnectivityMonitor {
    inner: Arc<MonitorInner>,
}

impl ConnectivityMonitor {
    pub fn new(
        watcher: Arc<dyn NetworkWatcher>,
        handler: Arc<dyn LossHandler>,
        logs: Arc<LogBuffer>,
        debounce: Duration,
        runtime: Handle,
    ) -> Self {
        Self {
            inner: Arc::new(MonitorInner {
                watcher,
                handler,
                logs,
                debounce,
                runtime,
                state: Mutex::new(MonitorState::default()),
            }),
        }
    }

    /// Register with the watcher. Calling it twice is a no-op.
    pub fn start(&self) {
        {
            let mut state = self.inner.state.lock();
            if state.running {
                return;
            }
            state.running = true;
        }

        let weak = Arc::downgrade(&self.inner);
        let callback: NetworkCallback = Arc::new(move |change| {
            if let Some(inner) = weak.upgrade() {
                inner.handle_change(change);
            }
        });

        // The watcher may invoke the callback before returning
        let id = self.inner.watcher.subscribe(callback);

        let mut state = self.inner.state.lock();
        if state.running {
            state.subscription = Some(id);
        } else {
            drop(state);
            self.inner.watcher.unsubscribe(id);
        }
        self.inner.logs.debug("Network monitor started");
    }

    /// Unregister, cancel any pending loss decision and forget the listener
    pub fn stop(&self) {
        let subscription = {
            let mut state = self.inner.state.lock();
            if !state.running {
                return;
            }
            state.running = false;
            state.listener = None;
            if let Some(task) = state.pending.take() {
                task.abort();
            }
            state.subscription.take()
        };

        if let Some(id) = subscription {
            self.inner.watcher.unsubscribe(id);
        }
        self.inner.logs.debug("Network monitor stopped");
    }

    /// Cancel an in-flight debounce without unregistering
    pub fn cancel_pending(&self) {
        if let Some(task) = self.inner.state.lock().pending.take() {
            task.abort();
            self.inner.logs.debug("Pending network loss check cancelled");
        }
    }

    pub fn has_pending_loss(&self) -> bool {
        self.inner.state.lock().pending.is_some()
    }

    /// Last interface seen by the monitor
    pub fn current(&self) -> Option<DefaultInterface> {
        self.inner.state.lock().current.clone()
    }

    /// Attach the engine's listener and report the current interface to it
    pub fn set_listener(&self, listener: Arc<dyn InterfaceUpdateListener>) {
        let current = {
            let mut state = self.inner.state.lock();
            state.listener = Some(listener.clone());
            state.current.clone()
        };
        listener.update_default_interface(current.as_ref());
    }

    pub fn clear_listener(&self) {
        self.inner.state.lock().listener = None;
    }
}

impl MonitorInner {
    fn handle_change(self: &Arc<Self>, change: NetworkChange) {
        let mut state = self.state.lock();
        if !state.running {
            return;
        }

        match change {
            NetworkChange::Available(iface) | NetworkChange::Changed(iface) => {
                if state.current.as_ref() != Some(&iface) {
                    self.logs.info(format!("Default network: {}", iface));
                }
                if let Some(task) = state.pending.take() {
                    task.abort();
                    self.logs.info("Network recovered before loss was confirmed");
                }
                state.current = Some(iface.clone());
                let listener = state.listener.clone();
                drop(state);

                if let Some(listener) = listener {
                    listener.update_default_interface(Some(&iface));
                }
            }
            NetworkChange::Lost => {
                state.current = None;
                let listener = state.listener.clone();

                if state.pending.is_none() {
                    self.logs.warn(format!(
                        "Default network lost, confirming in {}ms",
                        self.debounce.as_millis()
                    ));
                    let inner = Arc::clone(self);
                    state.pending = Some(self.runtime.spawn(async move {
                        tokio::time::sleep(inner.debounce).await;
                        inner.confirm_loss();
                    }));
                }
                drop(state);

                if let Some(listener) = listener {
                    listener.update_default_interface(None);
                }
            }
        }
    }

    fn confirm_loss(&self) {
        {
            let mut state = self.state.lock();
            state.pending = None;
            if !state.running || state.current.is_some() {
                return;
            }
        }

        self.logs.warn("Network loss persisted past debounce window");
        self.handler.on_loss_confirmed();
    }
}
