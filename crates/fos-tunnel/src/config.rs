//! Tunnel Configuration
//!
//! Provides the configuration consumed by the controller: candidate remotes,
//! endpoint protocols, locally requested session options, timing knobs and
//! host capabilities. Loadable from TOML or JSON.

use crate::endpoint::TransportKind;
use crate::error::ConfigError;
use crate::policy::BetterPathPolicy;
use crate::session_config::SessionConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Transport kind + port pair tried against every remote
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EndpointProtocol {
    pub kind: TransportKind,
    pub port: u16,
}

impl EndpointProtocol {
    pub fn new(kind: TransportKind, port: u16) -> Self {
        Self { kind, port }
    }
}

impl std::fmt::Display for EndpointProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.kind, self.port)
    }
}

/// Host capabilities, resolved once at startup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    /// DNS-over-HTTPS / DNS-over-TLS can be applied
    #[serde(default = "default_true")]
    pub encrypted_dns: bool,
    /// Better-path notifications are honored
    #[serde(default = "default_true")]
    pub path_monitoring: bool,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            encrypted_dns: true,
            path_monitoring: true,
        }
    }
}

/// Controller timing and policy knobs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControllerOptions {
    /// Host name resolution timeout (ms)
    #[serde(default = "default_dns_timeout")]
    pub dns_timeout_ms: u64,
    /// Link inactivity timeout (ms)
    #[serde(default = "default_link_activity_timeout")]
    pub link_activity_timeout_ms: u64,
    /// Forced shutdown timeout (ms)
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_ms: u64,
    /// Delay before a reconnection attempt (ms)
    #[serde(default = "default_reconnection_delay")]
    pub reconnection_delay_ms: u64,
    #[serde(default)]
    pub better_path_policy: BetterPathPolicy,
}

fn default_dns_timeout() -> u64 {
    3000
}

fn default_link_activity_timeout() -> u64 {
    5000
}

fn default_shutdown_timeout() -> u64 {
    2000
}

fn default_reconnection_delay() -> u64 {
    1000
}

fn default_true() -> bool {
    true
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self {
            dns_timeout_ms: default_dns_timeout(),
            link_activity_timeout_ms: default_link_activity_timeout(),
            shutdown_timeout_ms: default_shutdown_timeout(),
            reconnection_delay_ms: default_reconnection_delay(),
            better_path_policy: BetterPathPolicy::default(),
        }
    }
}

impl ControllerOptions {
    pub fn dns_timeout(&self) -> Duration {
        Duration::from_millis(self.dns_timeout_ms)
    }

    pub fn link_activity_timeout(&self) -> Duration {
        Duration::from_millis(self.link_activity_timeout_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn reconnection_delay(&self) -> Duration {
        Duration::from_millis(self.reconnection_delay_ms)
    }
}

/// Complete tunnel configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelConfig {
    /// Remote host names or literal addresses, in preference order
    pub remotes: Vec<String>,
    /// Protocols tried against each remote, in preference order
    pub endpoint_protocols: Vec<EndpointProtocol>,
    /// Locally requested session options
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub options: ControllerOptions,
    #[serde(default)]
    pub capabilities: Capabilities,
}

impl TunnelConfig {
    pub fn new(remotes: Vec<String>, endpoint_protocols: Vec<EndpointProtocol>) -> Self {
        Self {
            remotes,
            endpoint_protocols,
            session: SessionConfig::default(),
            options: ControllerOptions::default(),
            capabilities: Capabilities::default(),
        }
    }

    /// Load from TOML file
    pub fn from_toml_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(e.to_string()))?;
        Self::from_toml(&content)
    }

    /// Load from TOML string
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content)
            .map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Load from JSON file
    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(e.to_string()))?;
        Self::from_json(&content)
    }

    /// Load from JSON string
    pub fn from_json(content: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(content)
            .map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Load from a file, picking the format from its extension
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json_file(path),
            _ => Self::from_toml_file(path),
        }
    }

    /// Export as TOML
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self)
            .map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Export as JSON
    pub fn to_json(&self) -> Result<String, ConfigError> {
        serde_json::to_string_pretty(self)
            .map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.remotes.is_empty() {
            return Err(ConfigError::NoRemotes);
        }
        if self.endpoint_protocols.is_empty() {
            return Err(ConfigError::NoEndpointProtocols);
        }
        Ok(())
    }
}
