//! Per-connection resources
//!
//! A [`TunnelSession`] owns everything one connection attempt acquired: the
//! engine instance, the tunnel interface (through its [`SessionHost`]) and the
//! connectivity monitor. Dropping back to disconnected always goes through
//! [`TunnelSession::teardown`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use keep_tun::{InterfaceRequest, Provisioner, TunInterface, TunnelFd};
use parking_lot::Mutex;

use crate::engine::{EngineHost, EngineInstance};
use crate::error::{Error, Result};
use crate::logbuf::LogBuffer;
use crate::monitor::{ConnectivityMonitor, DefaultInterface, InterfaceUpdateListener};

/// Callback used when the engine asks for the tunnel to close
pub(crate) type CloseRequest = Arc<dyn Fn() + Send + Sync>;

/// [`EngineHost`] bound to one session
pub(crate) struct SessionHost {
    provisioner: Provisioner,
    monitor: ConnectivityMonitor,
    logs: Arc<LogBuffer>,
    interface: Mutex<Option<Box<dyn TunInterface>>>,
    closed: AtomicBool,
    on_close: CloseRequest,
}

impl SessionHost {
    pub(crate) fn new(
        provisioner: Provisioner,
        monitor: ConnectivityMonitor,
        logs: Arc<LogBuffer>,
        on_close: CloseRequest,
    ) -> Self {
        Self {
            provisioner,
            monitor,
            logs,
            interface: Mutex::new(None),
            closed: AtomicBool::new(false),
            on_close,
        }
    }

    /// Name of the interface currently held, if any
    pub(crate) fn interface_name(&self) -> Option<String> {
        self.interface.lock().as_ref().map(|i| i.name().to_string())
    }

    /// Refuse further interfaces and close the current one
    fn close_interface(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let iface = self.interface.lock().take();
        if let Some(mut iface) = iface {
            match iface.close() {
                Ok(()) => self.logs.info(format!("Interface {} closed", iface.name())),
                Err(e) => self
                    .logs
                    .warn(format!("Failed to close interface {}: {}", iface.name(), e)),
            }
        }
    }
}

#[async_trait]
impl EngineHost for SessionHost {
    async fn open_tun(&self, request: InterfaceRequest) -> Result<TunnelFd> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::NotRunning);
        }

        let previous = self.interface.lock().take();
        if let Some(mut previous) = previous {
            self.logs
                .info(format!("Replacing interface {}", previous.name()));
            if let Err(e) = previous.close() {
                self.logs.warn(format!("Failed to close interface: {}", e));
            }
        }

        request.validate().map_err(Error::from_provisioning)?;
        let plan = self.provisioner.plan(&request);
        for line in plan.describe() {
            self.logs.debug(line);
        }

        let mut iface = self
            .provisioner
            .apply(&plan)
            .await
            .map_err(Error::from_provisioning)?;
        let fd = iface.fd();

        let mut slot = self.interface.lock();
        if self.closed.load(Ordering::SeqCst) {
            drop(slot);
            let _ = iface.close();
            return Err(Error::NotRunning);
        }
        self.logs.info(format!(
            "Interface {} established (MTU {})",
            iface.name(),
            iface.mtu()
        ));
        *slot = Some(iface);
        Ok(fd)
    }

    fn write_log(&self, message: &str) {
        self.logs.engine(message);
    }

    fn protect(&self, fd: TunnelFd) -> bool {
        let ok = self.provisioner.platform().protect(fd);
        if !ok {
            self.logs.warn(format!("Failed to protect socket {}", fd));
        }
        ok
    }

    fn default_interface(&self) -> Option<DefaultInterface> {
        self.monitor.current()
    }

    fn start_default_interface_monitor(&self, listener: Arc<dyn InterfaceUpdateListener>) {
        self.monitor.set_listener(listener);
    }

    fn close_default_interface_monitor(&self) {
        self.monitor.clear_listener();
    }

    fn post_service_close(&self) {
        self.logs.info("Engine requested tunnel shutdown");
        (self.on_close)();
    }
}

/// Resources held by one connection attempt
pub(crate) struct TunnelSession {
    pub(crate) label: String,
    pub(crate) host: Arc<SessionHost>,
    pub(crate) monitor: ConnectivityMonitor,
    pub(crate) instance: Option<Box<dyn EngineInstance>>,
}

impl TunnelSession {
    /// Release everything. Errors are logged and never returned.
    pub(crate) async fn teardown(mut self, logs: &LogBuffer) {
        if let Some(mut instance) = self.instance.take() {
            if let Err(e) = instance.stop().await {
                logs.warn(format!("Engine stop failed [{}]: {}", e.kind(), e));
            }
        }
        self.host.close_interface();
        self.monitor.stop();

        if self.label.is_empty() {
            logs.debug("Session released");
        } else {
            logs.debug(format!("Session for {} released", self.label));
        }
    }
}
