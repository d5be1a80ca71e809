//! Tunkeep Engine
//!
//! This crate keeps a privileged, revocable tunnel interface alive around an
//! external packet engine. It is used by the CLI and can be embedded by any
//! shell that needs connect/disconnect and a status stream.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Application Layer                        │
//! │  ┌─────────────────┐              ┌─────────────────────┐   │
//! │  │   tunkeep-cli   │              │    Other shells     │   │
//! │  └────────┬────────┘              └──────────┬──────────┘   │
//! │           └───────────────┬──────────────────┘              │
//! │                           ▼                                 │
//! │  ┌────────────────────────────────────────────────────────┐ │
//! │  │                   tunkeep-engine                       │ │
//! │  │  - TunnelController (state machine, entry point)      │ │
//! │  │  - ConnectivityMonitor / ReconnectPolicy              │ │
//! │  │  - StatusPublisher / LogBuffer                        │ │
//! │  │  - ProcessEngine / RouteWatcher (system adapters)     │ │
//! │  └────────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────┘
//!                           │
//!                           ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │  keep-tun: InterfaceRequest, Provisioner, TunPlatform       │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod controller;
pub mod engine;
pub mod error;
pub mod event;
pub mod logbuf;
pub mod monitor;
pub mod policy;
pub mod process;
pub mod publisher;
mod session;
pub mod watcher;

pub use config::{Config, ControllerSettings};
pub use controller::{ControllerBuilder, TunnelController};
pub use engine::{EngineHost, EngineInstance, TunnelEngine};
pub use error::{Error, Result};
pub use event::{ChannelObserver, StatusEvent, StatusObserver, TunnelState};
pub use logbuf::{LogBuffer, LogEntry, LogLevel};
pub use monitor::{
    ConnectivityMonitor, DefaultInterface, InterfaceUpdateListener, LossHandler, NetworkCallback,
    NetworkChange, NetworkWatcher, SubscriptionId,
};
pub use policy::{ReconnectContext, ReconnectDecision, ReconnectPolicy, SkipReason};
pub use process::{ProcessEngine, ProcessSettings};
pub use publisher::StatusPublisher;
pub use watcher::RouteWatcher;
