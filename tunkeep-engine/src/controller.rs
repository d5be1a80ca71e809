//! Tunnel lifecycle controller
//!
//! [`TunnelController`] is a cheap handle to one controller instance. Every
//! request returns immediately; setup, teardown and retries run as tasks on
//! the controller's runtime and report back through the status publisher.
//!
//! Two locks guard the instance:
//!
//! - `core` (synchronous) holds the state machine and reconnect bookkeeping.
//!   Status events are published while it is held, which makes the event
//!   order identical to the order transitions were applied.
//! - `session` (async) owns the live [`TunnelSession`]. Whoever holds it may
//!   tear down and rebuild the session, so replacement is serialized and a new
//!   session never overlaps the previous one.
//!
//! Each connect or disconnect bumps a generation counter. Work started under
//! an older generation notices this at its next checkpoint and releases what
//! it acquired instead of publishing anything.

use std::sync::{Arc, Weak};
use std::time::Duration;

use keep_tun::{Provisioner, TunPlatform};
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::ControllerSettings;
use crate::engine::{EngineHost, TunnelEngine};
use crate::error::{Error, Result};
use crate::event::{StatusEvent, StatusObserver, TunnelState};
use crate::logbuf::LogBuffer;
use crate::monitor::{ConnectivityMonitor, LossHandler, NetworkWatcher};
use crate::policy::{ReconnectContext, ReconnectDecision};
use crate::publisher::StatusPublisher;
use crate::session::{CloseRequest, SessionHost, TunnelSession};

// ============================================================================
// Builder
// ============================================================================

/// Builder for [`TunnelController`]
#[derive(Default)]
pub struct ControllerBuilder {
    engine: Option<Arc<dyn TunnelEngine>>,
    platform: Option<Arc<dyn TunPlatform>>,
    watcher: Option<Arc<dyn NetworkWatcher>>,
    settings: ControllerSettings,
    runtime: Option<Handle>,
}

impl ControllerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tunneling engine started for every session
    pub fn engine(mut self, engine: Arc<dyn TunnelEngine>) -> Self {
        self.engine = Some(engine);
        self
    }

    /// OS tunnel capability used to provision interfaces
    pub fn platform(mut self, platform: Arc<dyn TunPlatform>) -> Self {
        self.platform = Some(platform);
        self
    }

    /// Source of default-network changes
    pub fn network_watcher(mut self, watcher: Arc<dyn NetworkWatcher>) -> Self {
        self.watcher = Some(watcher);
        self
    }

    pub fn settings(mut self, settings: ControllerSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Runtime for background tasks (default: the current one)
    pub fn runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    pub fn build(self) -> Result<TunnelController> {
        self.settings.validate()?;

        let engine = self
            .engine
            .ok_or_else(|| Error::ConfigInvalid("a tunnel engine is required".into()))?;
        let platform = self
            .platform
            .ok_or_else(|| Error::ConfigInvalid("a tunnel platform is required".into()))?;
        let watcher = self
            .watcher
            .ok_or_else(|| Error::ConfigInvalid("a network watcher is required".into()))?;
        let runtime = match self.runtime {
            Some(handle) => handle,
            None => Handle::try_current()
                .map_err(|_| Error::ConfigInvalid("no Tokio runtime available".into()))?,
        };

        let inner = Inner {
            engine,
            provisioner: Provisioner::new(platform, self.settings.provision.clone()),
            watcher,
            logs: Arc::new(LogBuffer::new(self.settings.max_log_entries)),
            publisher: StatusPublisher::new(&runtime),
            settings: self.settings,
            runtime,
            core: Mutex::new(Core::default()),
            session: tokio::sync::Mutex::new(None),
        };

        Ok(TunnelController {
            inner: Arc::new(inner),
        })
    }
}

// ============================================================================
// Controller
// ============================================================================

/// State machine and reconnect bookkeeping
struct Core {
    state: TunnelState,
    generation: u64,
    label: String,
    config: Option<Arc<[u8]>>,
    last_error: Option<String>,
    attempt: u32,
    last_connected: Option<Instant>,
    reconnecting: bool,
    user_stopped: bool,
    retry_task: Option<JoinHandle<()>>,
    monitor: Option<ConnectivityMonitor>,
}

impl Default for Core {
    fn default() -> Self {
        Self {
            state: TunnelState::Disconnected,
            generation: 0,
            label: String::new(),
            config: None,
            last_error: None,
            attempt: 0,
            last_connected: None,
            reconnecting: false,
            user_stopped: false,
            retry_task: None,
            monitor: None,
        }
    }
}

impl Core {
    /// Cancel a retry that is still waiting and any debounce in flight
    fn cancel_timers(&mut self, logs: &LogBuffer) {
        if let Some(task) = self.retry_task.take() {
            task.abort();
            logs.info("Pending reconnect cancelled");
        }
        if let Some(ref monitor) = self.monitor {
            monitor.cancel_pending();
        }
    }

    fn target(&self, generation: u64) -> Option<(Arc<[u8]>, String)> {
        if self.generation != generation {
            return None;
        }
        self.config.clone().map(|c| (c, self.label.clone()))
    }
}

struct Inner {
    engine: Arc<dyn TunnelEngine>,
    provisioner: Provisioner,
    watcher: Arc<dyn NetworkWatcher>,
    settings: ControllerSettings,
    logs: Arc<LogBuffer>,
    publisher: StatusPublisher,
    runtime: Handle,
    core: Mutex<Core>,
    session: tokio::sync::Mutex<Option<TunnelSession>>,
}

/// Handle to a tunnel lifecycle controller
#[derive(Clone)]
pub struct TunnelController {
    inner: Arc<Inner>,
}

impl TunnelController {
    pub fn builder() -> ControllerBuilder {
        ControllerBuilder::new()
    }

    /// Start a tunnel with `config`, replacing any active session.
    ///
    /// Returns once the request is accepted; the outcome arrives as a
    /// `connected` or `error` status. Only an empty config is rejected here.
    pub fn connect(&self, config: impl Into<Vec<u8>>, server_label: &str) -> Result<()> {
        let config: Arc<[u8]> = Arc::from(config.into());
        let inner = &self.inner;

        if config.is_empty() {
            let err = Error::ConfigInvalid("engine configuration is empty".into());
            inner.logs.error(format!("Connect rejected [{}]: {}", err.kind(), err));
            inner.core.lock().last_error = Some(err.to_string());
            return Err(err);
        }

        let generation = {
            let mut core = inner.core.lock();
            core.cancel_timers(&inner.logs);
            core.generation += 1;
            core.user_stopped = false;
            core.reconnecting = false;
            core.attempt = 0;
            core.label = server_label.to_string();
            core.config = Some(config);
            core.last_error = None;

            inner.logs.clear();
            if server_label.is_empty() {
                inner.logs.info("Connecting");
            } else {
                inner.logs.info(format!("Connecting to {}", server_label));
            }
            inner.transition(&mut core, TunnelState::Connecting, None);
            core.generation
        };

        let task = inner.clone();
        inner.runtime.spawn(async move {
            task.establish(generation).await;
        });
        Ok(())
    }

    /// Stop the tunnel and release every resource. Safe to call in any
    /// state; repeated calls are no-ops.
    pub fn disconnect(&self) {
        self.inner.disconnect();
    }

    /// The OS withdrew the tunnel permission
    pub fn revoke(&self) {
        self.inner.logs.warn("Tunnel permission revoked");
        self.inner.core.lock().user_stopped = true;
        self.inner.disconnect();
    }

    /// Whether the privileged tunnel capability is already granted
    pub fn check_permission(&self) -> bool {
        self.inner.provisioner.platform().has_permission()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.core.lock().state.is_connected()
    }

    pub fn state(&self) -> TunnelState {
        self.inner.core.lock().state
    }

    /// Snapshot of the diagnostic log, oldest first
    pub fn get_logs(&self) -> Vec<String> {
        self.inner.logs.snapshot()
    }

    pub fn get_last_error(&self) -> Option<String> {
        self.inner.core.lock().last_error.clone()
    }

    /// Deliver status events to `observer`, replacing any previous one
    pub fn attach_observer(&self, observer: Arc<dyn StatusObserver>) {
        self.inner.publisher.attach(observer);
    }

    pub fn detach_observer(&self) {
        self.inner.publisher.detach();
    }

    pub fn settings(&self) -> &ControllerSettings {
        &self.inner.settings
    }
}

impl Inner {
    /// Apply a transition and publish it. Callers hold the core lock.
    fn transition(&self, core: &mut Core, state: TunnelState, message: Option<String>) {
        if core.state != state {
            self.logs
                .debug(format!("State: {} -> {}", core.state, state));
        }
        core.state = state;

        let mut event = StatusEvent::new(state).with_label(&core.label);
        if let Some(message) = message {
            event = event.with_message(message);
        }
        self.publisher.publish(event);
    }

    fn is_current(&self, generation: u64) -> bool {
        self.core.lock().generation == generation
    }

    // ------------------------------------------------------------------------
    // Session setup
    // ------------------------------------------------------------------------

    async fn establish(self: Arc<Self>, generation: u64) {
        let mut slot = self.session.lock().await;

        // Only the newest request may touch the slot
        let target = self.core.lock().target(generation);
        let Some((config, label)) = target else {
            return;
        };

        if let Some(previous) = slot.take() {
            self.logs.info("Releasing previous session");
            previous.teardown(&self.logs).await;
        }
        if !self.is_current(generation) {
            return;
        }

        match self.setup_session(generation, config, label).await {
            Ok(session) => {
                if self.accept_session(&session, generation, false) {
                    *slot = Some(session);
                } else {
                    session.teardown(&self.logs).await;
                }
            }
            Err(err) => self.setup_failed(generation, &err),
        }
    }

    /// Build a complete session or release whatever was acquired
    async fn setup_session(
        self: &Arc<Self>,
        generation: u64,
        config: Arc<[u8]>,
        label: String,
    ) -> Result<TunnelSession> {
        if !self.provisioner.platform().has_permission() {
            return Err(Error::PermissionDenied(
                "tunnel permission has not been granted".into(),
            ));
        }

        let handler: Arc<dyn LossHandler> = Arc::new(LossSink {
            inner: Arc::downgrade(self),
            generation,
        });
        let monitor = ConnectivityMonitor::new(
            self.watcher.clone(),
            handler,
            self.logs.clone(),
            self.settings.debounce,
            self.runtime.clone(),
        );
        monitor.start();

        let weak = Arc::downgrade(self);
        let on_close: CloseRequest = Arc::new(move || {
            if let Some(inner) = weak.upgrade() {
                if inner.is_current(generation) {
                    inner.disconnect();
                }
            }
        });

        let host = Arc::new(SessionHost::new(
            self.provisioner.clone(),
            monitor.clone(),
            self.logs.clone(),
            on_close,
        ));
        let mut session = TunnelSession {
            label,
            host,
            monitor,
            instance: None,
        };

        match self.start_engine(&mut session, &config).await {
            Ok(()) => Ok(session),
            Err(err) => {
                session.teardown(&self.logs).await;
                Err(err)
            }
        }
    }

    async fn start_engine(&self, session: &mut TunnelSession, config: &[u8]) -> Result<()> {
        let host: Arc<dyn EngineHost> = session.host.clone();
        let instance = self.engine.configure(config, host).await?;
        self.logs.debug("Engine configured");

        let instance = session.instance.insert(instance);
        instance.start().await?;

        match session.host.interface_name() {
            Some(name) => self.logs.info(format!("Engine running on {}", name)),
            None => self.logs.warn("Engine started without an interface"),
        }
        Ok(())
    }

    /// Publish `connected` if the session still belongs to the current
    /// generation. Returns false when it must be released instead.
    fn accept_session(&self, session: &TunnelSession, generation: u64, reconnect: bool) -> bool {
        let mut core = self.core.lock();
        if core.generation != generation {
            self.logs.info("Connection superseded, releasing it");
            return false;
        }

        core.attempt = 0;
        core.reconnecting = false;
        core.retry_task = None;
        core.last_connected = Some(Instant::now());
        core.monitor = Some(session.monitor.clone());

        if reconnect {
            self.logs.info("Reconnected");
            self.transition(&mut core, TunnelState::Connected, Some("Reconnected".into()));
        } else {
            self.logs.info("Connected");
            self.transition(&mut core, TunnelState::Connected, None);
        }
        true
    }

    fn setup_failed(&self, generation: u64, err: &Error) {
        self.logs
            .error(format!("Setup failed [{}]: {}", err.kind(), err));

        let mut core = self.core.lock();
        if core.generation != generation {
            return;
        }
        core.last_error = Some(err.to_string());
        core.monitor = None;
        self.transition(&mut core, TunnelState::Error, Some(err.to_string()));
    }

    // ------------------------------------------------------------------------
    // Reconnection
    // ------------------------------------------------------------------------

    /// A loss outlasted the debounce window
    fn handle_loss(self: &Arc<Self>, generation: u64) {
        let mut core = self.core.lock();
        if core.generation != generation {
            self.logs.debug("Ignoring network loss from a previous session");
            return;
        }
        if !matches!(core.state, TunnelState::Connected | TunnelState::Reconnecting) {
            self.logs
                .debug(format!("Ignoring network loss while {}", core.state));
            return;
        }

        self.logs.warn(format!(
            "Connection interrupted [{}]",
            Error::NetworkLost.kind()
        ));
        let reconnecting = core.reconnecting;
        self.decide(&mut core, reconnecting);
    }

    fn decide(self: &Arc<Self>, core: &mut Core, already_reconnecting: bool) {
        let ctx = ReconnectContext {
            attempt: core.attempt,
            since_last_connect: core.last_connected.map(|t| t.elapsed()),
            user_stopped: core.user_stopped,
            already_reconnecting,
        };

        match self.settings.policy.decide(&ctx) {
            ReconnectDecision::Retry { attempt, delay } => {
                self.schedule_retry(core, attempt, delay);
            }
            ReconnectDecision::GiveUp => self.give_up(core),
            ReconnectDecision::Skip(reason) => {
                self.logs.info(format!("No reconnect: {}", reason));
            }
        }
    }

    fn schedule_retry(self: &Arc<Self>, core: &mut Core, attempt: u32, delay: Duration) {
        let max = self.settings.policy.max_attempts;
        core.reconnecting = true;
        core.attempt = attempt;

        self.logs.info(format!(
            "Reconnect attempt {}/{} in {}ms",
            attempt,
            max,
            delay.as_millis()
        ));
        self.transition(
            core,
            TunnelState::Reconnecting,
            Some(format!("Attempt {}/{}", attempt, max)),
        );

        let task = self.clone();
        let generation = core.generation;
        core.retry_task = Some(self.runtime.spawn(async move {
            task.retry(generation, delay).await;
        }));
    }

    async fn retry(self: Arc<Self>, generation: u64, delay: Duration) {
        tokio::time::sleep(delay).await;

        // Past this point the retry is no longer aborted; newer requests are
        // noticed through the generation instead
        let target = {
            let mut core = self.core.lock();
            if core.user_stopped {
                return;
            }
            let target = core.target(generation);
            if target.is_some() {
                core.retry_task = None;
            }
            target
        };
        let Some((config, label)) = target else {
            return;
        };

        let mut slot = self.session.lock().await;
        if !self.is_current(generation) {
            return;
        }
        if let Some(previous) = slot.take() {
            self.logs.info("Releasing interrupted session");
            previous.teardown(&self.logs).await;
        }
        if !self.is_current(generation) {
            return;
        }

        match self.setup_session(generation, config, label).await {
            Ok(session) => {
                if self.accept_session(&session, generation, true) {
                    *slot = Some(session);
                } else {
                    session.teardown(&self.logs).await;
                }
            }
            Err(err) => self.retry_failed(generation, &err),
        }
    }

    fn retry_failed(self: &Arc<Self>, generation: u64, err: &Error) {
        self.logs
            .error(format!("Reconnect failed [{}]: {}", err.kind(), err));

        let mut core = self.core.lock();
        if core.generation != generation {
            return;
        }
        core.last_error = Some(err.to_string());
        core.reconnecting = false;
        core.monitor = None;

        if !err.is_recoverable() {
            self.abandon(&mut core, err);
            return;
        }

        self.decide(&mut core, false);

        if core.state == TunnelState::Reconnecting && !core.reconnecting {
            // Nothing scheduled and no session left
            self.abandon(&mut core, err);
        }
    }

    /// Stop reconnecting after a failure that retrying cannot fix
    fn abandon(&self, core: &mut Core, err: &Error) {
        let message = format!("Reconnect abandoned: {}", err);
        core.reconnecting = false;
        core.attempt = 0;
        core.last_error = Some(message.clone());
        self.transition(core, TunnelState::Error, Some(message));
    }

    fn give_up(self: &Arc<Self>, core: &mut Core) {
        let max = self.settings.policy.max_attempts;
        let err = Error::ReconnectExhausted(max);
        let message = format!("Connection lost after {} retries", max);
        self.logs.error(format!("[{}] {}", err.kind(), message));

        core.reconnecting = false;
        core.attempt = 0;
        core.monitor = None;
        core.last_error = Some(message.clone());
        self.transition(core, TunnelState::Error, Some(message));

        let generation = core.generation;
        let task = self.clone();
        self.runtime.spawn(async move {
            let mut slot = task.session.lock().await;
            if task.is_current(generation) {
                if let Some(session) = slot.take() {
                    session.teardown(&task.logs).await;
                }
            }
        });
    }

    // ------------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------------

    fn disconnect(self: &Arc<Self>) {
        let generation = {
            let mut core = self.core.lock();
            core.user_stopped = true;
            core.reconnecting = false;
            core.cancel_timers(&self.logs);

            match core.state {
                TunnelState::Disconnected => {
                    self.logs.debug("Already disconnected");
                    return;
                }
                TunnelState::Disconnecting => {
                    self.logs.debug("Disconnect already in progress");
                    return;
                }
                _ => {}
            }

            self.logs.info("Disconnecting");
            core.generation += 1;
            self.transition(&mut core, TunnelState::Disconnecting, None);
            core.generation
        };

        let task = self.clone();
        self.runtime.spawn(async move {
            {
                // A newer connect owns the slot and releases the old session
                // itself; it may already hold its own session here
                let mut slot = task.session.lock().await;
                if task.is_current(generation) {
                    if let Some(session) = slot.take() {
                        session.teardown(&task.logs).await;
                    }
                }
            }
            task.finish_disconnect(generation);
        });
    }

    fn finish_disconnect(&self, generation: u64) {
        let mut core = self.core.lock();
        if core.generation != generation {
            self.logs.debug("Disconnect superseded by a new connection");
            return;
        }

        core.attempt = 0;
        core.last_connected = None;
        core.monitor = None;
        core.retry_task = None;
        self.logs.info("Disconnected");
        self.transition(&mut core, TunnelState::Disconnected, None);
    }
}

/// Routes debounced losses of one session back to the controller
struct LossSink {
    inner: Weak<Inner>,
    generation: u64,
}

impl LossHandler for LossSink {
    fn on_loss_confirmed(&self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.handle_loss(self.generation);
        }
    }
}
