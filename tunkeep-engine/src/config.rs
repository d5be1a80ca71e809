//! Configuration types for the tunnel controller

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use keep_tun::{InterfaceRequest, ProvisionSettings, DEFAULT_MTU, DEFAULT_SESSION_NAME};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::logbuf::DEFAULT_MAX_ENTRIES;
use crate::policy::ReconnectPolicy;

/// Main configuration structure
///
/// # Example Configuration
///
/// ```toml
/// [reconnect]
/// max_attempts = 5
/// cooldown_ms = 10000
///
/// [interface]
/// session_name = "tunkeep"
/// fwmark = 51820
///
/// [engine]
/// command = "/usr/local/bin/tun2proxy"
/// args = ["--tun-fd", "{tun_fd}", "--config", "{config}"]
/// config_path = "/etc/tunkeep/engine.json"
///
/// [tunnel]
/// address = ["10.8.0.2/24"]
/// dns = ["1.1.1.1"]
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub reconnect: ReconnectConfig,

    #[serde(default)]
    pub logs: LogsConfig,

    #[serde(default)]
    pub interface: InterfaceConfig,

    /// External engine process (required by the CLI)
    pub engine: Option<EngineConfig>,

    #[serde(default)]
    pub tunnel: TunnelConfig,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        let r = &self.reconnect;
        if r.max_attempts == 0 {
            return Err(Error::ConfigInvalid("reconnect.max_attempts must be at least 1".into()));
        }
        if r.base_delay_ms == 0 {
            return Err(Error::ConfigInvalid("reconnect.base_delay_ms must be positive".into()));
        }
        if r.max_delay_ms < r.base_delay_ms {
            return Err(Error::ConfigInvalid(format!(
                "reconnect.max_delay_ms ({}) is below base_delay_ms ({})",
                r.max_delay_ms, r.base_delay_ms
            )));
        }

        if self.logs.max_entries == 0 {
            return Err(Error::ConfigInvalid("logs.max_entries must be at least 1".into()));
        }

        self.interface.fallback_dns_addr()?;

        if let Some(ref engine) = self.engine {
            if engine.command.trim().is_empty() {
                return Err(Error::ConfigInvalid("engine.command is empty".into()));
            }
        }

        self.tunnel.to_request()?;

        Ok(())
    }

    /// Controller settings derived from this configuration
    pub fn controller_settings(&self) -> Result<ControllerSettings> {
        Ok(ControllerSettings {
            policy: self.reconnect.policy(),
            debounce: Duration::from_millis(self.reconnect.debounce_ms),
            max_log_entries: self.logs.max_entries,
            provision: self.interface.provision_settings()?,
        })
    }

    /// Get the engine configuration, returning an error if not present
    pub fn engine_config(&self) -> Result<&EngineConfig> {
        self.engine
            .as_ref()
            .ok_or_else(|| Error::ConfigInvalid("[engine] section is required".into()))
    }

    /// Generate a sample configuration file
    pub fn sample() -> String {
        r#"# tunkeep configuration

# Automatic reconnection after the network drops
[reconnect]
# Retries before giving up (default: 5)
max_attempts = 5

# First retry delay; doubles on every attempt (default: 2000)
base_delay_ms = 2000

# Upper bound for the retry delay (default: 30000)
max_delay_ms = 30000

# Loss signals this soon after a successful connect are ignored (default: 10000)
cooldown_ms = 10000

# How long the network must stay down before it counts as lost (default: 3000)
debounce_ms = 3000

# Diagnostic log buffer
[logs]
# Entries kept in memory (default: 200)
max_entries = 200

# Virtual interface defaults
[interface]
# Session / device name (ignored on macOS)
session_name = "tunkeep"

# Resolver used when the engine asks for none (default: 1.1.1.1)
fallback_dns = "1.1.1.1"

# Application always kept outside the tunnel (default: session_name)
# host_application = "tunkeep"

# Linux: mark applied to sockets the engine protects
# fwmark = 51820

# External tunneling engine
[engine]
# Program to run
command = "/usr/local/bin/tun2proxy"

# Arguments. Placeholders:
#   {config}   - path of the engine configuration document
#   {tun_fd}   - descriptor of the tunnel interface
#   {tun_name} - name of the tunnel interface
args = ["--tun-fd", "{tun_fd}", "--config", "{config}"]

# Engine configuration document, read by `tunkeep connect` and handed
# to the engine at {config}
config_path = "/etc/tunkeep/engine.json"

# Label shown in status events
server_label = "default"

# Grace period before the engine is killed on stop (default: 5000)
stop_timeout_ms = 5000

# Interface requested for the engine
[tunnel]
address = ["10.8.0.2/24"]

# Routes through the tunnel. When empty, everything is routed.
# route = ["10.0.0.0/8"]

dns = ["1.1.1.1"]
mtu = 1500
"#
        .to_string()
    }
}

/// `[reconnect]` section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_base_delay")]
    pub base_delay_ms: u64,

    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,

    #[serde(default = "default_cooldown")]
    pub cooldown_ms: u64,

    #[serde(default = "default_debounce")]
    pub debounce_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay(),
            max_delay_ms: default_max_delay(),
            cooldown_ms: default_cooldown(),
            debounce_ms: default_debounce(),
        }
    }
}

impl ReconnectConfig {
    pub fn policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            cooldown: Duration::from_millis(self.cooldown_ms),
        }
    }
}

/// `[logs]` section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogsConfig {
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
}

impl Default for LogsConfig {
    fn default() -> Self {
        Self {
            max_entries: default_max_entries(),
        }
    }
}

/// `[interface]` section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterfaceConfig {
    #[serde(default = "default_session_name")]
    pub session_name: String,

    #[serde(default = "default_fallback_dns")]
    pub fallback_dns: String,

    /// Defaults to `session_name`
    pub host_application: Option<String>,

    /// Linux `SO_MARK` for protected sockets
    pub fwmark: Option<u32>,
}

impl Default for InterfaceConfig {
    fn default() -> Self {
        Self {
            session_name: default_session_name(),
            fallback_dns: default_fallback_dns(),
            host_application: None,
            fwmark: None,
        }
    }
}

impl InterfaceConfig {
    pub fn fallback_dns_addr(&self) -> Result<IpAddr> {
        self.fallback_dns.trim().parse().map_err(|_| {
            Error::ConfigInvalid(format!("invalid fallback_dns '{}'", self.fallback_dns))
        })
    }

    pub fn provision_settings(&self) -> Result<ProvisionSettings> {
        Ok(ProvisionSettings {
            session_name: self.session_name.clone(),
            fallback_dns: self.fallback_dns_addr()?,
            host_application: self
                .host_application
                .clone()
                .unwrap_or_else(|| self.session_name.clone()),
        })
    }
}

/// `[engine]` section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub command: String,

    #[serde(default)]
    pub args: Vec<String>,

    pub config_path: PathBuf,

    #[serde(default)]
    pub server_label: String,

    #[serde(default = "default_stop_timeout")]
    pub stop_timeout_ms: u64,
}

/// `[tunnel]` section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelConfig {
    /// Interface addresses in CIDR notation, IPv4 and IPv6 mixed
    #[serde(default)]
    pub address: Vec<String>,

    #[serde(default)]
    pub route: Vec<String>,

    #[serde(default)]
    pub dns: Vec<IpAddr>,

    #[serde(default = "default_mtu")]
    pub mtu: u16,

    pub exclude_application: Option<String>,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            address: Vec::new(),
            route: Vec::new(),
            dns: Vec::new(),
            mtu: default_mtu(),
            exclude_application: None,
        }
    }
}

impl TunnelConfig {
    /// Build the interface request. Only CIDR syntax is checked here; an
    /// empty address list is left for the provisioner to reject.
    pub fn to_request(&self) -> Result<InterfaceRequest> {
        let mut builder = InterfaceRequest::builder().mtu(self.mtu);

        for addr in &self.address {
            builder = builder
                .address_str(addr)
                .map_err(|e| Error::ConfigInvalid(format!("tunnel.address: {}", e)))?;
        }
        for route in &self.route {
            builder = builder
                .route_str(route)
                .map_err(|e| Error::ConfigInvalid(format!("tunnel.route: {}", e)))?;
        }
        for dns in &self.dns {
            builder = builder.dns(*dns);
        }
        if let Some(ref app) = self.exclude_application {
            builder = builder.exclude_application(app.clone());
        }

        Ok(builder.into_request())
    }
}

/// Everything the controller needs besides its collaborators
#[derive(Debug, Clone)]
pub struct ControllerSettings {
    pub policy: ReconnectPolicy,
    pub debounce: Duration,
    pub max_log_entries: usize,
    pub provision: ProvisionSettings,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            policy: ReconnectPolicy::default(),
            debounce: Duration::from_millis(default_debounce()),
            max_log_entries: DEFAULT_MAX_ENTRIES,
            provision: ProvisionSettings::default(),
        }
    }
}

impl ControllerSettings {
    pub fn validate(&self) -> Result<()> {
        if self.policy.max_attempts == 0 {
            return Err(Error::ConfigInvalid("max_attempts must be at least 1".into()));
        }
        if self.policy.base_delay.is_zero() {
            return Err(Error::ConfigInvalid("base delay must be positive".into()));
        }
        if self.policy.max_delay < self.policy.base_delay {
            return Err(Error::ConfigInvalid("max delay is below base delay".into()));
        }
        if self.max_log_entries == 0 {
            return Err(Error::ConfigInvalid("log buffer size must be at least 1".into()));
        }
        Ok(())
    }
}

fn default_max_attempts() -> u32 {
    5
}

fn default_base_delay() -> u64 {
    2000
}

fn default_max_delay() -> u64 {
    30_000
}

fn default_cooldown() -> u64 {
    10_000
}

fn default_debounce() -> u64 {
    3000
}

fn default_max_entries() -> usize {
    DEFAULT_MAX_ENTRIES
}

fn default_session_name() -> String {
    DEFAULT_SESSION_NAME.to_string()
}

fn default_fallback_dns() -> String {
    "1.1.1.1".to_string()
}

fn default_stop_timeout() -> u64 {
    5000
}

fn default_mtu() -> u16 {
    DEFAULT_MTU
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_literal_defaults() {
        let config = Config::from_toml("").unwrap();
        let settings = config.controller_settings().unwrap();

        assert_eq!(settings.policy, ReconnectPolicy::default());
        assert_eq!(settings.debounce, Duration::from_secs(3));
        assert_eq!(settings.max_log_entries, 200);
        assert_eq!(settings.provision.session_name, "tunkeep");
        assert_eq!(settings.provision.host_application, "tunkeep");
        assert!(config.engine.is_none());
    }

    #[test]
    fn test_sample_parses() {
        let config = Config::from_toml(&Config::sample()).unwrap();
        let engine = config.engine_config().unwrap();

        assert_eq!(engine.args, vec!["--tun-fd", "{tun_fd}", "--config", "{config}"]);
        assert_eq!(engine.server_label, "default");

        let request = config.tunnel.to_request().unwrap();
        assert_eq!(request.inet4_addresses.len(), 1);
        assert!(request.inet4_routes.is_empty());
        assert_eq!(request.mtu, 1500);
    }

    #[test]
    fn test_mixed_family_addresses() {
        let toml_str = r#"
[tunnel]
address = ["10.8.0.2/24", "fd00::2/64"]
route = ["10.0.0.0/8", "fd00::/8"]
"#;
        let config = Config::from_toml(toml_str).unwrap();
        let request = config.tunnel.to_request().unwrap();

        assert_eq!(request.inet4_addresses.len(), 1);
        assert_eq!(request.inet6_addresses.len(), 1);
        assert_eq!(request.inet4_routes.len(), 1);
        assert_eq!(request.inet6_routes.len(), 1);
    }

    #[test]
    fn test_host_application_override() {
        let toml_str = r#"
[interface]
session_name = "corp"
host_application = "com.example.shell"
fallback_dns = "9.9.9.9"
"#;
        let settings = Config::from_toml(toml_str).unwrap().controller_settings().unwrap();
        assert_eq!(settings.provision.host_application, "com.example.shell");
        assert_eq!(settings.provision.fallback_dns.to_string(), "9.9.9.9");
    }

    #[test]
    fn test_validation_failures() {
        let cases = [
            "[reconnect]\nmax_attempts = 0",
            "[reconnect]\nbase_delay_ms = 0",
            "[reconnect]\nbase_delay_ms = 5000\nmax_delay_ms = 1000",
            "[logs]\nmax_entries = 0",
            "[interface]\nfallback_dns = \"resolver\"",
            "[engine]\ncommand = \" \"\nconfig_path = \"/tmp/x\"",
            "[tunnel]\naddress = [\"10.0.0.300/24\"]",
        ];

        for case in cases {
            let err = Config::from_toml(case).unwrap_err();
            assert!(err.is_config_error(), "expected config error for {:?}", case);
        }
    }

    #[test]
    fn test_missing_engine_section() {
        let config = Config::from_toml("").unwrap();
        assert!(config.engine_config().is_err());
    }

    #[test]
    fn test_settings_default_validates() {
        assert!(ControllerSettings::default().validate().is_ok());
    }
}
