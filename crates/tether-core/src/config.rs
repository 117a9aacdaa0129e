//! Configuration management for Tether
//!
//! Handles loading and saving of the tunnel client configuration: broker
//! connection, RPC and negotiation timeouts, and the socket listeners and
//! relays started at boot.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Result, TetherError};
use crate::policy::RelayPolicy;

/// Main configuration for a Tether client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TetherConfig {
    /// Public host name this client answers for
    pub host_name: String,

    /// Broker URL (consumed by the broker binding)
    pub broker_url: String,

    /// Shared secret presented to the broker
    pub broker_secret: Option<String>,

    /// Broker identity whose `srpc` requests are served
    pub server_host: String,

    /// Path prefix of the well-known HTTP endpoints
    pub base_path: String,

    /// Scheme used for the HTTP fallback endpoint
    pub fallback_scheme: String,

    /// Default RPC call timeout in milliseconds
    pub rpc_timeout_ms: u64,

    /// Upper bound on local candidate gathering in milliseconds
    pub gathering_timeout_ms: u64,

    /// How long a listener waits for a data channel before using the relay
    pub negotiation_timeout_ms: u64,

    /// Send offers immediately and trickle candidates
    pub trickle_ice: bool,

    /// Attempt data-channel upgrades at all
    pub use_rtc: bool,

    /// STUN/TURN urls handed to the connector
    pub ice_servers: Vec<String>,

    /// Evict peers idle for longer than this (0 = never)
    pub peer_idle_timeout_secs: u64,

    /// Period of the idle-peer sweep
    pub eviction_interval_secs: u64,

    /// Keepalive period for the broker binding and open data channels
    pub keepalive_secs: u64,

    /// Socket listeners to start on boot
    pub listeners: Vec<ListenerConfig>,

    /// Socket relays to register on boot
    pub relays: Vec<RelayConfig>,
}

impl Default for TetherConfig {
    fn default() -> Self {
        Self {
            host_name: String::new(),
            broker_url: "wss://localhost/_hs/ws".to_string(),
            broker_secret: None,
            server_host: "server".to_string(),
            base_path: "_hs".to_string(),
            fallback_scheme: "https".to_string(),
            rpc_timeout_ms: 10_000,
            gathering_timeout_ms: 2_000,
            negotiation_timeout_ms: 10_000,
            trickle_ice: true,
            use_rtc: true,
            ice_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            peer_idle_timeout_secs: 600,
            eviction_interval_secs: 60,
            keepalive_secs: 25,
            listeners: Vec::new(),
            relays: Vec::new(),
        }
    }
}

impl TetherConfig {
    /// Creates a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads configuration from a file
    pub fn load(path: &PathBuf) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Saves configuration to a file
    pub fn save(&self, path: &PathBuf) -> Result<()> {
        let contents = toml::to_string_pretty(self)?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Returns the default configuration directory
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("tether")
    }

    /// Returns the default configuration file path
    pub fn default_config_path() -> PathBuf {
        Self::default_config_dir().join("config.toml")
    }

    /// Checks the fields the client cannot run without
    pub fn validate(&self) -> Result<()> {
        if self.host_name.trim().is_empty() {
            return Err(TetherError::ConfigError("host_name is required".into()));
        }
        if self.server_host.trim().is_empty() {
            return Err(TetherError::ConfigError("server_host is required".into()));
        }
        if self.rpc_timeout_ms == 0 {
            return Err(TetherError::ConfigError("rpc_timeout_ms must be > 0".into()));
        }
        if self.gathering_timeout_ms == 0 {
            return Err(TetherError::ConfigError(
                "gathering_timeout_ms must be > 0".into(),
            ));
        }
        for listener in &self.listeners {
            if listener.target_host.trim().is_empty() {
                return Err(TetherError::ConfigError(format!(
                    "listener on port {} has no target_host",
                    listener.port
                )));
            }
        }
        Ok(())
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    pub fn gathering_timeout(&self) -> Duration {
        Duration::from_millis(self.gathering_timeout_ms)
    }

    pub fn negotiation_timeout(&self) -> Duration {
        Duration::from_millis(self.negotiation_timeout_ms)
    }

    /// `None` when idle eviction is disabled
    pub fn peer_idle_timeout(&self) -> Option<Duration> {
        (self.peer_idle_timeout_secs > 0).then(|| Duration::from_secs(self.peer_idle_timeout_secs))
    }

    /// Builder pattern: set host name
    pub fn with_host_name(mut self, host: impl Into<String>) -> Self {
        self.host_name = host.into();
        self
    }

    /// Builder pattern: set broker url
    pub fn with_broker_url(mut self, url: impl Into<String>) -> Self {
        self.broker_url = url.into();
        self
    }

    /// Builder pattern: set broker secret
    pub fn with_broker_secret(mut self, secret: impl Into<String>) -> Self {
        self.broker_secret = Some(secret.into());
        self
    }

    /// Builder pattern: set the broker's server identity
    pub fn with_server_host(mut self, host: impl Into<String>) -> Self {
        self.server_host = host.into();
        self
    }

    /// Builder pattern: set HTTP fallback scheme
    pub fn with_fallback_scheme(mut self, scheme: impl Into<String>) -> Self {
        self.fallback_scheme = scheme.into();
        self
    }

    /// Builder pattern: set RPC timeout
    pub fn with_rpc_timeout_ms(mut self, ms: u64) -> Self {
        self.rpc_timeout_ms = ms;
        self
    }

    /// Builder pattern: set gathering timeout
    pub fn with_gathering_timeout_ms(mut self, ms: u64) -> Self {
        self.gathering_timeout_ms = ms;
        self
    }

    /// Builder pattern: set negotiation timeout
    pub fn with_negotiation_timeout_ms(mut self, ms: u64) -> Self {
        self.negotiation_timeout_ms = ms;
        self
    }

    /// Builder pattern: enable/disable trickle ICE
    pub fn with_trickle_ice(mut self, enable: bool) -> Self {
        self.trickle_ice = enable;
        self
    }

    /// Builder pattern: enable/disable data-channel upgrades
    pub fn with_rtc(mut self, enable: bool) -> Self {
        self.use_rtc = enable;
        self
    }

    /// Builder pattern: set idle eviction timeout
    pub fn with_peer_idle_timeout_secs(mut self, secs: u64) -> Self {
        self.peer_idle_timeout_secs = secs;
        self
    }

    /// Builder pattern: add a listener
    pub fn with_listener(mut self, listener: ListenerConfig) -> Self {
        self.listeners.push(listener);
        self
    }

    /// Builder pattern: add a relay
    pub fn with_relay(mut self, relay: RelayConfig) -> Self {
        self.relays.push(relay);
        self
    }
}

/// A local port tunnelled out to a remote relay
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListenerConfig {
    /// Local port to accept on (0 = ephemeral)
    pub port: u16,
    /// Remote host running the matching relay
    pub target_host: String,
    /// Port the remote relay is registered under (defaults to `port`)
    #[serde(default)]
    pub target_port: Option<u16>,
    /// Password presented with every connect request
    #[serde(default)]
    pub password: Option<String>,
}

impl ListenerConfig {
    pub fn new(port: u16, target_host: impl Into<String>) -> Self {
        Self {
            port,
            target_host: target_host.into(),
            target_port: None,
            password: None,
        }
    }

    pub fn with_target_port(mut self, port: u16) -> Self {
        self.target_port = Some(port);
        self
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }
}

/// A port this client will open connections for on request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Port remote listeners name in their connect requests
    pub port: u16,
    /// Destination host (defaults to `localhost`)
    #[serde(default)]
    pub target_host: Option<String>,
    /// Destination port (defaults to `port`)
    #[serde(default)]
    pub target_port: Option<u16>,
    #[serde(default)]
    pub whitelist: Vec<String>,
    #[serde(default)]
    pub blacklist: Vec<String>,
    #[serde(default)]
    pub password: Option<String>,
}

impl RelayConfig {
    pub fn new(port: u16) -> Self {
        Self {
            port,
            target_host: None,
            target_port: None,
            whitelist: Vec::new(),
            blacklist: Vec::new(),
            password: None,
        }
    }

    pub fn with_target(mut self, host: impl Into<String>, port: u16) -> Self {
        self.target_host = Some(host.into());
        self.target_port = Some(port);
        self
    }

    pub fn with_whitelist(mut self, patterns: &[&str]) -> Self {
        self.whitelist = patterns.iter().map(|p| p.to_string()).collect();
        self
    }

    pub fn with_blacklist(mut self, patterns: &[&str]) -> Self {
        self.blacklist = patterns.iter().map(|p| p.to_string()).collect();
        self
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn policy(&self) -> RelayPolicy {
        RelayPolicy::new(self.whitelist.clone(), self.blacklist.clone())
    }
}
