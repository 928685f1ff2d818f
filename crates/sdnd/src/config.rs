//! Daemon configuration.
//!
//! Values come from three layers, lowest first: built-in defaults, an
//! optional YAML file (`--config`), then explicit command line flags.

use clap::Parser;
use sdn_ipam::RetryPolicy;
use sdn_ovsdb::{Endpoint, SessionConfig, DEFAULT_ENDPOINT};
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{SdnError, SdnResult};

/// Default control surface address.
pub const DEFAULT_LISTEN: &str = "127.0.0.1:6675";

/// Default integration bridge.
pub const DEFAULT_BRIDGE_NAME: &str = "ovs-br0";

/// Default bridge MTU, leaving room for the VXLAN header.
pub const DEFAULT_BRIDGE_MTU: u32 = 1440;

/// In-memory cluster store backend name.
pub const MEMORY_STORE: &str = "memory";

/// SDN control-plane daemon
#[derive(Parser, Debug)]
#[command(name = "sdnd")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// YAML configuration file
    #[arg(short = 'c', long)]
    pub config: Option<PathBuf>,

    /// Control surface listen address
    #[arg(long)]
    pub listen: Option<SocketAddr>,

    /// Switch database endpoint (tcp:HOST:PORT or unix:PATH)
    #[arg(long)]
    pub switch: Option<String>,

    /// Cluster store: "memory" or a redis:// URL
    #[arg(long)]
    pub store: Option<String>,

    /// Address other nodes use to reach this node
    #[arg(long)]
    pub advertise: Option<Ipv4Addr>,

    /// Integration bridge name
    #[arg(long)]
    pub bridge: Option<String>,

    /// Gateway CIDR for the integration bridge
    #[arg(long)]
    pub bridge_ip: Option<String>,

    /// Attempts before a contended allocation gives up
    #[arg(long)]
    pub max_retries: Option<u32>,

    /// Delay between switch connection attempts in milliseconds
    #[arg(long)]
    pub connect_retry_ms: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, default_value = "info")]
    pub log_level: String,
}

/// Runtime bridge configuration, exchanged as JSON on `/configuration`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConf {
    #[serde(rename = "bridgeIP")]
    pub bridge_ip: String,
    #[serde(rename = "bridgeName")]
    pub bridge_name: String,
    #[serde(rename = "bridgeCIDR")]
    pub bridge_cidr: String,
    #[serde(rename = "bridgeMTU")]
    pub bridge_mtu: u32,
}

impl Default for BridgeConf {
    fn default() -> Self {
        Self {
            bridge_ip: String::new(),
            bridge_name: DEFAULT_BRIDGE_NAME.to_string(),
            bridge_cidr: String::new(),
            bridge_mtu: DEFAULT_BRIDGE_MTU,
        }
    }
}

/// Optimistic update tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            max_attempts: policy.max_attempts,
            base_delay_ms: policy.base_delay.as_millis() as u64,
            max_delay_ms: policy.max_delay.as_millis() as u64,
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::default()
            .with_max_attempts(self.max_attempts)
            .with_delays(
                Duration::from_millis(self.base_delay_ms),
                Duration::from_millis(self.max_delay_ms),
            )
    }
}

/// Switch connection tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SwitchConfig {
    pub endpoint: String,
    pub retry_delay_ms: u64,
    pub root_poll_ms: u64,
}

impl Default for SwitchConfig {
    fn default() -> Self {
        let session = SessionConfig::default();
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            retry_delay_ms: session.retry_delay.as_millis() as u64,
            root_poll_ms: session.root_poll_interval.as_millis() as u64,
        }
    }
}

impl SwitchConfig {
    pub fn endpoint(&self) -> SdnResult<Endpoint> {
        self.endpoint
            .parse()
            .map_err(|e: sdn_ovsdb::OvsdbError| SdnError::config(e.to_string()))
    }

    pub fn session(&self) -> SessionConfig {
        SessionConfig {
            retry_delay: Duration::from_millis(self.retry_delay_ms),
            root_poll_interval: Duration::from_millis(self.root_poll_ms),
        }
    }
}

/// Complete daemon configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub listen: SocketAddr,
    pub store: String,
    /// Local node address; loopback when unset.
    pub advertise: Option<Ipv4Addr>,
    pub switch: SwitchConfig,
    pub retry: RetryConfig,
    pub bridge: BridgeConf,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 6675)),
            store: MEMORY_STORE.to_string(),
            advertise: None,
            switch: SwitchConfig::default(),
            retry: RetryConfig::default(),
            bridge: BridgeConf::default(),
        }
    }
}

impl DaemonConfig {
    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> SdnResult<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> SdnResult<Self> {
        let config: Self = serde_yaml::from_str(content)
            .map_err(|e| SdnError::config(format!("invalid YAML: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Builds the effective configuration for `args`.
    pub fn load(args: &Args) -> SdnResult<Self> {
        let mut config = match &args.config {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_args(args);
        config.validate()?;
        Ok(config)
    }

    /// Overrides file values with flags given on the command line.
    pub fn apply_args(&mut self, args: &Args) {
        if let Some(listen) = args.listen {
            self.listen = listen;
        }
        if let Some(switch) = &args.switch {
            self.switch.endpoint = switch.clone();
        }
        if let Some(store) = &args.store {
            self.store = store.clone();
        }
        if let Some(advertise) = args.advertise {
            self.advertise = Some(advertise);
        }
        if let Some(bridge) = &args.bridge {
            self.bridge.bridge_name = bridge.clone();
        }
        if let Some(bridge_ip) = &args.bridge_ip {
            self.bridge.bridge_ip = bridge_ip.clone();
        }
        if let Some(max_retries) = args.max_retries {
            self.retry.max_attempts = max_retries;
        }
        if let Some(delay) = args.connect_retry_ms {
            self.switch.retry_delay_ms = delay;
        }
    }

    pub fn validate(&self) -> SdnResult<()> {
        if self.bridge.bridge_name.is_empty() {
            return Err(SdnError::config("bridge name cannot be empty"));
        }
        if self.store != MEMORY_STORE && !self.store.starts_with("redis://") {
            return Err(SdnError::config(format!(
                "unsupported store '{}', expected '{}' or a redis:// URL",
                self.store, MEMORY_STORE
            )));
        }
        if self.retry.max_attempts == 0 {
            return Err(SdnError::config("retry.max_attempts must be greater than 0"));
        }
        self.switch.endpoint()?;
        Ok(())
    }

    pub fn local_address(&self) -> Ipv4Addr {
        self.advertise.unwrap_or(Ipv4Addr::LOCALHOST)
    }
}
