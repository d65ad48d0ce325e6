//! Session Configuration
//!
//! The configuration blob exchanged with the session engine. The same type
//! describes both the locally requested options and the options negotiated
//! with the remote peer; every field is optional so that precedence can be
//! resolved field by field.

use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

/// Address family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IpFamily {
    V4,
    V6,
}

impl IpFamily {
    /// Longest prefix length for this family
    pub fn max_prefix_len(&self) -> u8 {
        match self {
            IpFamily::V4 => 32,
            IpFamily::V6 => 128,
        }
    }

    /// Family of an address
    pub fn of(addr: &IpAddr) -> Self {
        match addr {
            IpAddr::V4(_) => IpFamily::V4,
            IpAddr::V6(_) => IpFamily::V6,
        }
    }

    /// Family of a network
    pub fn of_net(net: &IpNet) -> Self {
        match net {
            IpNet::V4(_) => IpFamily::V4,
            IpNet::V6(_) => IpFamily::V6,
        }
    }
}

impl std::fmt::Display for IpFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IpFamily::V4 => write!(f, "IPv4"),
            IpFamily::V6 => write!(f, "IPv6"),
        }
    }
}

/// Routing policy flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingPolicy {
    /// Route all IPv4 traffic through the tunnel
    Ipv4,
    /// Route all IPv6 traffic through the tunnel
    Ipv6,
    /// Tunnel the physical LAN segment as well
    BlockLocal,
}

/// Explicit route pushed by the peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteSpec {
    /// Destination network
    pub destination: IpNet,
    /// Next hop, if any
    #[serde(default)]
    pub gateway: Option<IpAddr>,
}

impl RouteSpec {
    pub fn new(destination: IpNet, gateway: Option<IpAddr>) -> Self {
        Self { destination, gateway }
    }
}

/// Address assignment for one family
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpAssignment {
    /// Interface address with its prefix (e.g. `10.8.0.2/24`)
    pub address: IpNet,
    /// Gateway used for the synthesized default route
    pub default_gateway: IpAddr,
    /// Routes to include
    #[serde(default)]
    pub routes: Vec<RouteSpec>,
    /// Routes to keep outside the tunnel
    #[serde(default)]
    pub excluded_routes: Vec<IpNet>,
}

/// DNS transport
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DnsProtocol {
    #[default]
    Plain,
    Https { url: String },
    Tls { server_name: String },
}

/// HTTP(S) proxy server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyServer {
    pub address: String,
    pub port: u16,
}

impl ProxyServer {
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        Self {
            address: address.into(),
            port,
        }
    }
}

impl std::fmt::Display for ProxyServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.address, self.port)
    }
}

/// Session configuration (local or negotiated)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub ipv4: Option<IpAssignment>,
    pub ipv6: Option<IpAssignment>,
    pub routing_policies: Option<Vec<RoutingPolicy>>,

    /// `Some(false)` disables DNS settings entirely
    pub dns_enabled: Option<bool>,
    pub dns_protocol: Option<DnsProtocol>,
    pub dns_servers: Option<Vec<IpAddr>>,
    pub search_domains: Option<Vec<String>>,

    /// `Some(false)` disables proxy settings entirely
    pub proxy_enabled: Option<bool>,
    pub http_proxy: Option<ProxyServer>,
    pub https_proxy: Option<ProxyServer>,
    pub proxy_auto_config_url: Option<String>,
    pub proxy_bypass_domains: Option<Vec<String>>,

    pub mtu: Option<u32>,
}

impl SessionConfig {
    /// Assignment for a family
    pub fn assignment(&self, family: IpFamily) -> Option<&IpAssignment> {
        match family {
            IpFamily::V4 => self.ipv4.as_ref(),
            IpFamily::V6 => self.ipv6.as_ref(),
        }
    }

    pub fn has_routing_policy(&self, policy: RoutingPolicy) -> Option<bool> {
        self.routing_policies
            .as_ref()
            .map(|policies| policies.contains(&policy))
    }

    /// Print options at debug level
    pub fn log(&self, label: &str) {
        tracing::debug!("{} options:", label);
        if let Some(ref ipv4) = self.ipv4 {
            tracing::debug!("\tIPv4: {} via {}", ipv4.address, ipv4.default_gateway);
        }
        if let Some(ref ipv6) = self.ipv6 {
            tracing::debug!("\tIPv6: {} via {}", ipv6.address, ipv6.default_gateway);
        }
        if let Some(ref policies) = self.routing_policies {
            tracing::debug!("\tRouting policies: {:?}", policies);
        }
        if let Some(ref servers) = self.dns_servers {
            tracing::debug!("\tDNS: {:?}", servers);
        }
        if let Some(ref domains) = self.search_domains {
            tracing::debug!("\tSearch domains: {:?}", domains);
        }
        if let Some(mtu) = self.mtu {
            tracing::debug!("\tMTU: {}", mtu);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_routing_policy_lookup() {
        let mut config = SessionConfig::default();
        assert_eq!(config.has_routing_policy(RoutingPolicy::Ipv4), None);

        config.routing_policies = Some(vec![RoutingPolicy::Ipv4]);
        assert_eq!(config.has_routing_policy(RoutingPolicy::Ipv4), Some(true));
        assert_eq!(config.has_routing_policy(RoutingPolicy::Ipv6), Some(false));
    }

    #[test]
    fn test_parse_from_json() {
        let json = r#"{
            "ipv4": {
                "address": "10.8.0.2/24",
                "default_gateway": "10.8.0.1",
                "routes": [{ "destination": "192.168.50.0/24" }]
            },
            "routing_policies": ["ipv4", "block_local"],
            "dns_protocol": { "type": "https", "url": "https://dns.example/dns-query" },
            "dns_servers": ["9.9.9.9"]
        }"#;

        let config: SessionConfig = serde_json::from_str(json).unwrap();
        let ipv4 = config.ipv4.as_ref().unwrap();
        assert_eq!(ipv4.routes.len(), 1);
        assert!(ipv4.routes[0].gateway.is_none());
        assert_eq!(config.has_routing_policy(RoutingPolicy::BlockLocal), Some(true));
        assert!(matches!(config.dns_protocol, Some(DnsProtocol::Https { .. })));
        assert!(config.ipv6.is_none());
    }

    #[test]
    fn test_dns_protocol_defaults_to_plain() {
        assert_eq!(DnsProtocol::default(), DnsProtocol::Plain);

        let config: SessionConfig =
            serde_json::from_str(r#"{ "dns_servers": ["9.9.9.9"] }"#).unwrap();
        assert_eq!(config.dns_protocol.unwrap_or_default(), DnsProtocol::Plain);
    }

    #[test]
    fn test_family() {
        let v4: IpAddr = "1.2.3.4".parse().unwrap();
        let v6: IpAddr = "fd00::1".parse().unwrap();
        assert_eq!(IpFamily::of(&v4), IpFamily::V4);
        assert_eq!(IpFamily::of(&v6), IpFamily::V6);
        assert_eq!(IpFamily::V6.max_prefix_len(), 128);
    }
}
