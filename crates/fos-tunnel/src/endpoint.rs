//! Endpoint Strategy
//!
//! Hands out connection candidates in preference order and connects them.
//!
//! # Candidate Order
//!
//! Candidates are every remote combined with every endpoint protocol,
//! remote-major:
//!
//! ```text
//! remotes   = [a.example, b.example]
//! protocols = [udp:1194, tcp:443]
//!
//! a.example udp:1194 → a.example tcp:443 → b.example udp:1194 → b.example tcp:443
//! ```
//!
//! The cursor only moves forward and stops at the last candidate.

use crate::config::TunnelConfig;
use crate::error::{ConfigError, ConnectError};
use crate::transport::Transport;
use async_trait::async_trait;
use hickory_resolver::TokioAsyncResolver;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Socket flavor of an endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    Udp,
    Tcp,
    /// TCP with traffic obfuscation
    ObfuscatedTcp,
}

impl TransportKind {
    /// Stream transports time out on connect, so an inactivity timeout
    /// means the endpoint is unreachable and the next one should be tried.
    pub fn supports_endpoint_fallback(&self) -> bool {
        matches!(self, TransportKind::Tcp | TransportKind::ObfuscatedTcp)
    }
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportKind::Udp => write!(f, "UDP"),
            TransportKind::Tcp => write!(f, "TCP"),
            TransportKind::ObfuscatedTcp => write!(f, "TCP+XOR"),
        }
    }
}

/// One (address, port, transport) combination
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EndpointCandidate {
    /// Host name or literal IP address
    pub address: String,
    pub port: u16,
    pub kind: TransportKind,
}

impl EndpointCandidate {
    pub fn new(address: impl Into<String>, port: u16, kind: TransportKind) -> Self {
        Self {
            address: address.into(),
            port,
            kind,
        }
    }

    /// Address, if the candidate needs no resolution
    pub fn literal_address(&self) -> Option<IpAddr> {
        self.address.parse().ok()
    }
}

impl std::fmt::Display for EndpointCandidate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{} ({})", self.address, self.port, self.kind)
    }
}

/// Host name resolution
#[async_trait]
pub trait Resolver: Send + Sync {
    async fn resolve(&self, host: &str, timeout: Duration) -> Result<Vec<IpAddr>, ConnectError>;
}

/// Opens links to resolved endpoints
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        addr: SocketAddr,
        kind: TransportKind,
        timeout: Duration,
    ) -> Result<Arc<dyn Transport>, ConnectError>;
}

/// [`Resolver`] backed by the system DNS configuration
pub struct DnsResolver {
    resolver: TokioAsyncResolver,
}

impl DnsResolver {
    pub fn from_system_conf() -> Result<Self, ConnectError> {
        let resolver = TokioAsyncResolver::tokio_from_system_conf()
            .map_err(|e| ConnectError::Io(e.to_string()))?;
        Ok(Self { resolver })
    }
}

#[async_trait]
impl Resolver for DnsResolver {
    async fn resolve(&self, host: &str, timeout: Duration) -> Result<Vec<IpAddr>, ConnectError> {
        debug!("DNS lookup for: {}", host);
        match tokio::time::timeout(timeout, self.resolver.lookup_ip(host)).await {
            Ok(Ok(lookup)) => Ok(lookup.iter().collect()),
            Ok(Err(e)) => Err(ConnectError::NameResolutionFailure(format!("{}: {}", host, e))),
            Err(_) => Err(ConnectError::NameResolutionFailure(format!("{}: timed out", host))),
        }
    }
}

/// Ordered candidates plus a forward-only cursor
#[derive(Debug, Clone)]
pub struct EndpointStrategy {
    candidates: Vec<EndpointCandidate>,
    cursor: usize,
}

impl EndpointStrategy {
    /// Build candidates from remotes × endpoint protocols
    pub fn new(config: &TunnelConfig) -> Result<Self, ConfigError> {
        config.validate()?;

        let candidates = config
            .remotes
            .iter()
            .flat_map(|remote| {
                config
                    .endpoint_protocols
                    .iter()
                    .map(move |proto| {
                        EndpointCandidate::new(remote.clone(), proto.port, proto.kind)
                    })
            })
            .collect();

        Self::from_candidates(candidates)
    }

    pub fn from_candidates(candidates: Vec<EndpointCandidate>) -> Result<Self, ConfigError> {
        if candidates.is_empty() {
            return Err(ConfigError::NoRemotes);
        }
        Ok(Self { candidates, cursor: 0 })
    }

    pub fn current(&self) -> &EndpointCandidate {
        &self.candidates[self.cursor]
    }

    /// Move to the next candidate. Returns false (cursor unchanged) when the
    /// current candidate is the last one.
    pub fn advance(&mut self) -> bool {
        if self.cursor + 1 >= self.candidates.len() {
            warn!("Exhausted endpoints");
            return false;
        }
        self.cursor += 1;
        info!("Will try next endpoint: {}", self.current());
        true
    }

    pub fn is_exhausted(&self) -> bool {
        self.cursor + 1 >= self.candidates.len()
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    /// Resolve `candidate` and connect the first address that accepts.
    pub async fn resolve_and_connect(
        candidate: &EndpointCandidate,
        resolver: &dyn Resolver,
        connector: &dyn Connector,
        timeout: Duration,
    ) -> Result<Arc<dyn Transport>, ConnectError> {
        let addresses = match candidate.literal_address() {
            Some(addr) => vec![addr],
            None => resolver.resolve(&candidate.address, timeout).await?,
        };

        if addresses.is_empty() {
            return Err(ConnectError::NameResolutionFailure(candidate.address.clone()));
        }

        let mut last_error = ConnectError::NameResolutionFailure(candidate.address.clone());
        for addr in addresses {
            let socket_addr = SocketAddr::new(addr, candidate.port);
            debug!("Connecting to {} via {}", socket_addr, candidate.kind);

            match connector.connect(socket_addr, candidate.kind, timeout).await {
                Ok(transport) => return Ok(transport),
                Err(e) => {
                    warn!("Failed to connect to {}: {}", socket_addr, e);
                    last_error = e;
                }
            }
        }

        Err(last_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EndpointProtocol;
    use crate::testing::{MockConnector, MockResolver};

    fn config(remotes: &[&str]) -> TunnelConfig {
        TunnelConfig::new(
            remotes.iter().map(|r| r.to_string()).collect(),
            vec![
                EndpointProtocol::new(TransportKind::Udp, 1194),
                EndpointProtocol::new(TransportKind::Tcp, 443),
            ],
        )
    }

    #[test]
    fn test_candidate_order() {
        let mut strategy = EndpointStrategy::new(&config(&["a.example", "b.example"])).unwrap();
        assert_eq!(strategy.len(), 4);

        let mut visited = vec![strategy.current().clone()];
        while strategy.advance() {
            visited.push(strategy.current().clone());
        }

        assert_eq!(
            visited,
            vec![
                EndpointCandidate::new("a.example", 1194, TransportKind::Udp),
                EndpointCandidate::new("a.example", 443, TransportKind::Tcp),
                EndpointCandidate::new("b.example", 1194, TransportKind::Udp),
                EndpointCandidate::new("b.example", 443, TransportKind::Tcp),
            ]
        );
    }

    #[test]
    fn test_advance_stops_at_last() {
        let mut strategy = EndpointStrategy::from_candidates(vec![
            EndpointCandidate::new("198.51.100.1", 443, TransportKind::Tcp),
        ])
        .unwrap();

        assert!(strategy.is_exhausted());
        assert!(!strategy.advance());
        assert!(!strategy.advance());
        assert_eq!(strategy.current().address, "198.51.100.1");
    }

    #[test]
    fn test_empty_config_rejected() {
        assert!(EndpointStrategy::new(&config(&[])).is_err());
        assert!(EndpointStrategy::from_candidates(Vec::new()).is_err());
    }

    #[test]
    fn test_fallback_support() {
        assert!(!TransportKind::Udp.supports_endpoint_fallback());
        assert!(TransportKind::Tcp.supports_endpoint_fallback());
        assert!(TransportKind::ObfuscatedTcp.supports_endpoint_fallback());
    }

    #[tokio::test]
    async fn test_literal_address_skips_resolution() {
        let resolver = MockResolver::default();
        let connector = MockConnector::default();
        let candidate = EndpointCandidate::new("198.51.100.1", 1194, TransportKind::Udp);

        let result = EndpointStrategy::resolve_and_connect(
            &candidate,
            &resolver,
            &connector,
            Duration::from_secs(1),
        )
        .await;

        assert!(result.is_ok());
        assert_eq!(resolver.lookups(), 0);
        assert_eq!(connector.attempts(), vec!["198.51.100.1:1194".parse().unwrap()]);
    }

    #[tokio::test]
    async fn test_unresolved_host() {
        let resolver = MockResolver::default();
        let connector = MockConnector::default();
        let candidate = EndpointCandidate::new("nowhere.example", 1194, TransportKind::Udp);

        let result = EndpointStrategy::resolve_and_connect(
            &candidate,
            &resolver,
            &connector,
            Duration::from_secs(1),
        )
        .await;

        assert!(matches!(result, Err(ConnectError::NameResolutionFailure(_))));
        assert!(connector.attempts().is_empty());
    }

    #[tokio::test]
    async fn test_tries_each_resolved_address() {
        let resolver = MockResolver::default();
        resolver.insert(
            "vpn.example",
            vec!["198.51.100.1".parse().unwrap(), "198.51.100.2".parse().unwrap()],
        );
        let connector = MockConnector::default();
        connector.refuse("198.51.100.1:443".parse().unwrap());
        let candidate = EndpointCandidate::new("vpn.example", 443, TransportKind::Tcp);

        let result = EndpointStrategy::resolve_and_connect(
            &candidate,
            &resolver,
            &connector,
            Duration::from_secs(1),
        )
        .await;

        assert!(result.is_ok());
        assert_eq!(connector.attempts().len(), 2);
    }
}
