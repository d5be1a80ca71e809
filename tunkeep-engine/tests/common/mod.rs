//! Simulated collaborators for controller tests

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ipnet::IpNet;
use keep_tun::{InterfaceBuilder, InterfaceRequest, Route, TunInterface, TunPlatform, TunnelFd};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use tunkeep_engine::{
    ChannelObserver, DefaultInterface, EngineHost, EngineInstance, Error, InterfaceUpdateListener,
    NetworkCallback, NetworkChange, NetworkWatcher, StatusEvent, SubscriptionId, TunnelController,
    TunnelEngine, TunnelState,
};

// ============================================================================
// Live-handle accounting
// ============================================================================

#[derive(Default)]
pub struct LiveCounter {
    live: AtomicI64,
    max: AtomicI64,
    total: AtomicUsize,
}

impl LiveCounter {
    fn acquire(&self) {
        let now = self.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.max.fetch_max(now, Ordering::SeqCst);
        self.total.fetch_add(1, Ordering::SeqCst);
    }

    fn release(&self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn live(&self) -> i64 {
        self.live.load(Ordering::SeqCst)
    }

    pub fn max(&self) -> i64 {
        self.max.load(Ordering::SeqCst)
    }

    pub fn total(&self) -> usize {
        self.total.load(Ordering::SeqCst)
    }
}

// ============================================================================
// Scripted engine
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Succeed,
    FailStart,
}

#[derive(Default)]
pub struct RecordingListener {
    pub updates: Mutex<Vec<Option<String>>>,
}

impl InterfaceUpdateListener for RecordingListener {
    fn update_default_interface(&self, interface: Option<&DefaultInterface>) {
        self.updates.lock().push(interface.map(|i| i.name.clone()));
    }
}

pub struct ScriptedEngine {
    outcomes: Mutex<VecDeque<Outcome>>,
    fallback: Outcome,
    start_delay: Duration,
    pub instances: Arc<LiveCounter>,
    pub listener: Arc<RecordingListener>,
    pub hosts: Mutex<Vec<Arc<dyn EngineHost>>>,
}

impl ScriptedEngine {
    /// Every start ends with `fallback` unless `outcomes` says otherwise
    pub fn new(outcomes: &[Outcome], fallback: Outcome) -> Self {
        Self {
            outcomes: Mutex::new(outcomes.iter().copied().collect()),
            fallback,
            start_delay: Duration::ZERO,
            instances: Arc::new(LiveCounter::default()),
            listener: Arc::new(RecordingListener::default()),
            hosts: Mutex::new(Vec::new()),
        }
    }

    pub fn succeeding() -> Self {
        Self::new(&[], Outcome::Succeed)
    }

    pub fn with_start_delay(mut self, delay: Duration) -> Self {
        self.start_delay = delay;
        self
    }

    pub fn last_host(&self) -> Option<Arc<dyn EngineHost>> {
        self.hosts.lock().last().cloned()
    }
}

#[async_trait]
impl TunnelEngine for ScriptedEngine {
    async fn configure(
        &self,
        config: &[u8],
        host: Arc<dyn EngineHost>,
    ) -> tunkeep_engine::Result<Box<dyn EngineInstance>> {
        if config == b"reject" {
            return Err(Error::ConfigInvalid("unparsable engine document".into()));
        }

        let outcome = self.outcomes.lock().pop_front().unwrap_or(self.fallback);
        self.instances.acquire();
        self.hosts.lock().push(host.clone());

        Ok(Box::new(ScriptedInstance {
            host,
            outcome,
            start_delay: self.start_delay,
            counter: self.instances.clone(),
            listener: self.listener.clone(),
            stopped: false,
        }))
    }
}

struct ScriptedInstance {
    host: Arc<dyn EngineHost>,
    outcome: Outcome,
    start_delay: Duration,
    counter: Arc<LiveCounter>,
    listener: Arc<RecordingListener>,
    stopped: bool,
}

#[async_trait]
impl EngineInstance for ScriptedInstance {
    async fn start(&mut self) -> tunkeep_engine::Result<()> {
        if !self.start_delay.is_zero() {
            tokio::time::sleep(self.start_delay).await;
        }

        let request = InterfaceRequest::builder()
            .address_str("172.19.0.1/30")?
            .build()?;
        self.host.open_tun(request).await?;
        self.host.protect(42);
        self.host.write_log("engine started");
        self.host
            .start_default_interface_monitor(self.listener.clone());

        match self.outcome {
            Outcome::Succeed => Ok(()),
            Outcome::FailStart => Err(Error::EngineStartFailed("handshake refused".into())),
        }
    }

    async fn stop(&mut self) -> tunkeep_engine::Result<()> {
        if !self.stopped {
            self.stopped = true;
            self.counter.release();
            self.host.close_default_interface_monitor();
        }
        Ok(())
    }
}

// ============================================================================
// Recording tunnel platform
// ============================================================================

pub struct RecordingPlatform {
    pub granted: AtomicBool,
    pub interfaces: Arc<LiveCounter>,
    pub protected: Mutex<Vec<TunnelFd>>,
    pub routes: Arc<Mutex<Vec<String>>>,
}

impl Default for RecordingPlatform {
    fn default() -> Self {
        Self {
            granted: AtomicBool::new(true),
            interfaces: Arc::new(LiveCounter::default()),
            protected: Mutex::new(Vec::new()),
            routes: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl TunPlatform for RecordingPlatform {
    fn has_permission(&self) -> bool {
        self.granted.load(Ordering::SeqCst)
    }

    fn new_builder(&self) -> keep_tun::Result<Box<dyn InterfaceBuilder>> {
        Ok(Box::new(RecordingBuilder {
            interfaces: self.interfaces.clone(),
            routes: self.routes.clone(),
        }))
    }

    fn protect(&self, fd: TunnelFd) -> bool {
        self.protected.lock().push(fd);
        true
    }
}

struct RecordingBuilder {
    interfaces: Arc<LiveCounter>,
    routes: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl InterfaceBuilder for RecordingBuilder {
    fn set_session(&mut self, _name: &str) {}

    fn set_mtu(&mut self, _mtu: u16) -> keep_tun::Result<()> {
        Ok(())
    }

    fn add_address(&mut self, _address: IpNet) -> keep_tun::Result<()> {
        Ok(())
    }

    fn add_route(&mut self, route: &Route) -> keep_tun::Result<()> {
        self.routes.lock().push(route.to_string());
        Ok(())
    }

    fn add_dns_server(&mut self, _server: IpAddr) -> keep_tun::Result<()> {
        Ok(())
    }

    fn exclude_application(&mut self, _identifier: &str) -> keep_tun::Result<()> {
        Ok(())
    }

    async fn establish(self: Box<Self>) -> keep_tun::Result<Box<dyn TunInterface>> {
        self.interfaces.acquire();
        Ok(Box::new(FakeInterface {
            counter: self.interfaces.clone(),
            open: true,
        }))
    }
}

#[derive(Debug)]
struct FakeInterface {
    counter: Arc<LiveCounter>,
    open: bool,
}

impl std::fmt::Debug for LiveCounter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "LiveCounter({})", self.live())
    }
}

impl TunInterface for FakeInterface {
    fn name(&self) -> &str {
        "tun-sim"
    }

    fn fd(&self) -> TunnelFd {
        9
    }

    fn mtu(&self) -> u16 {
        1500
    }

    fn close(&mut self) -> keep_tun::Result<()> {
        if self.open {
            self.open = false;
            self.counter.release();
        }
        Ok(())
    }
}

// ============================================================================
// Simulated network
// ============================================================================

#[derive(Default)]
pub struct SimWatcher {
    subscribers: Mutex<HashMap<SubscriptionId, NetworkCallback>>,
    next: AtomicU64,
    current: Mutex<Option<DefaultInterface>>,
}

impl SimWatcher {
    pub fn online(name: &str) -> Self {
        let watcher = Self::default();
        *watcher.current.lock() = Some(DefaultInterface::new(name, Some(2)));
        watcher
    }

    pub fn lose(&self) {
        *self.current.lock() = None;
        self.emit(NetworkChange::Lost);
    }

    pub fn restore(&self, name: &str) {
        let iface = DefaultInterface::new(name, Some(2));
        *self.current.lock() = Some(iface.clone());
        self.emit(NetworkChange::Available(iface));
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    fn emit(&self, change: NetworkChange) {
        let callbacks: Vec<NetworkCallback> = self.subscribers.lock().values().cloned().collect();
        for callback in callbacks {
            callback(change.clone());
        }
    }
}

impl NetworkWatcher for SimWatcher {
    fn subscribe(&self, on_change: NetworkCallback) -> SubscriptionId {
        let id = self.next.fetch_add(1, Ordering::SeqCst) + 1;
        self.subscribers.lock().insert(id, on_change.clone());

        let current = self.current.lock().clone();
        if let Some(iface) = current {
            on_change(NetworkChange::Available(iface));
        }
        id
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        self.subscribers.lock().remove(&id);
    }
}

// ============================================================================
// Harness
// ============================================================================

pub struct Harness {
    pub controller: TunnelController,
    pub engine: Arc<ScriptedEngine>,
    pub platform: Arc<RecordingPlatform>,
    pub watcher: Arc<SimWatcher>,
    events: mpsc::UnboundedReceiver<StatusEvent>,
}

impl Harness {
    /// Build a controller with default settings. Must run inside a runtime.
    pub fn new(engine: ScriptedEngine) -> Self {
        let engine = Arc::new(engine);
        let platform = Arc::new(RecordingPlatform::default());
        let watcher = Arc::new(SimWatcher::online("eth0"));

        let controller = TunnelController::builder()
            .engine(engine.clone())
            .platform(platform.clone())
            .network_watcher(watcher.clone())
            .build()
            .unwrap();

        let (observer, events) = ChannelObserver::new();
        controller.attach_observer(Arc::new(observer));

        Self {
            controller,
            engine,
            platform,
            watcher,
            events,
        }
    }

    /// Next status event; fails the test if none arrives
    pub async fn next(&mut self) -> StatusEvent {
        tokio::time::timeout(Duration::from_secs(600), self.events.recv())
            .await
            .expect("timed out waiting for status event")
            .expect("status channel closed")
    }

    pub async fn expect(&mut self, state: TunnelState) -> StatusEvent {
        let event = self.next().await;
        assert_eq!(event.status, state, "unexpected event {:?}", event);
        event
    }

    /// Let every timer run out, then return whatever was published
    pub async fn settle(&mut self) -> Vec<TunnelState> {
        tokio::time::sleep(Duration::from_secs(120)).await;
        let mut states = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            states.push(event.status);
        }
        states
    }

    pub async fn connect(&mut self) {
        self.controller.connect(b"{\"server\":\"edge\"}".to_vec(), "edge-1").unwrap();
        self.expect(TunnelState::Connecting).await;
        self.expect(TunnelState::Connected).await;
    }
}
