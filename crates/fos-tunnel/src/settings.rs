//! Network Settings
//!
//! Translates a local + negotiated [`SessionConfig`] pair into the settings
//! the host network stack must apply.
//!
//! # Precedence
//!
//! Local options override negotiated options field by field:
//!
//! ```text
//! routing policies:  local ?? negotiated
//! DNS servers:       local (non-empty) ?? negotiated (non-empty) ?? untouched
//! search domains:    local ?? negotiated
//! proxy fields:      local ?? negotiated   (HTTPS, HTTP, PAC independently)
//! MTU:               local only, positive
//! ```
//!
//! Derivation is pure: the same inputs (including the same route table
//! answers) always produce the same [`NetworkSettings`].

use crate::config::Capabilities;
use crate::error::TunnelError;
use crate::session_config::{
    DnsProtocol, IpAssignment, IpFamily, ProxyServer, RoutingPolicy, SessionConfig,
};
use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use tracing::{debug, info, warn};

/// Route entry handed to the host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpRoute {
    pub destination: IpNet,
    pub gateway: Option<IpAddr>,
}

impl IpRoute {
    pub fn new(destination: IpNet, gateway: Option<IpAddr>) -> Self {
        Self { destination, gateway }
    }

    /// Default route (`0.0.0.0/0` or `::/0`) via `gateway`
    pub fn default_via(gateway: IpAddr) -> Self {
        let destination = match gateway {
            IpAddr::V4(_) => IpNet::V4(Ipv4Net::default()),
            IpAddr::V6(_) => IpNet::V6(Ipv6Net::default()),
        };
        Self::new(destination, Some(gateway))
    }

    /// Single-address route (`/32` or `/128`) with no gateway
    pub fn host(addr: IpAddr) -> Self {
        Self::new(IpNet::from(addr), None)
    }

    pub fn is_default(&self) -> bool {
        self.destination.prefix_len() == 0
    }
}

/// Per-family interface settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpSettings {
    pub addresses: Vec<IpNet>,
    pub included_routes: Vec<IpRoute>,
    pub excluded_routes: Vec<IpRoute>,
}

/// Which queries go to the tunnel DNS servers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchDomains {
    /// All queries
    All,
    /// Split DNS: only these domains
    Only(Vec<String>),
}

impl MatchDomains {
    pub fn is_split(&self) -> bool {
        matches!(self, MatchDomains::Only(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsSettings {
    pub protocol: DnsProtocol,
    pub servers: Vec<IpAddr>,
    pub domain_name: Option<String>,
    pub search_domains: Vec<String>,
    pub match_domains: MatchDomains,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxySettings {
    pub http: Option<ProxyServer>,
    pub https: Option<ProxyServer>,
    pub auto_config_url: Option<String>,
    pub bypass_domains: Vec<String>,
}

/// Settings ready for application by the host.
///
/// Never mutated once derived; a reassert produces a fresh value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkSettings {
    pub remote_address: Option<IpAddr>,
    pub ipv4: Option<IpSettings>,
    pub ipv6: Option<IpSettings>,
    pub dns: Option<DnsSettings>,
    pub proxy: Option<ProxySettings>,
    pub mtu: Option<u32>,
}

impl NetworkSettings {
    pub fn family(&self, family: IpFamily) -> Option<&IpSettings> {
        match family {
            IpFamily::V4 => self.ipv4.as_ref(),
            IpFamily::V6 => self.ipv6.as_ref(),
        }
    }

    fn family_mut(&mut self, family: IpFamily) -> Option<&mut IpSettings> {
        match family {
            IpFamily::V4 => self.ipv4.as_mut(),
            IpFamily::V6 => self.ipv6.as_mut(),
        }
    }
}

/// Route of the host's routing table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostRoute {
    pub destination: IpNet,
    #[serde(default)]
    pub gateway: Option<IpAddr>,
    pub interface: String,
}

/// Read-only view of the host routing table.
///
/// Only consulted by the block-local rule.
pub trait RouteTable: Send + Sync {
    /// Current default route for the family
    fn default_route(&self, family: IpFamily) -> Option<HostRoute>;

    /// All routes for the family
    fn routes(&self, family: IpFamily) -> Vec<HostRoute>;
}

/// Route table backed by a fixed list of routes
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaticRouteTable {
    pub routes: Vec<HostRoute>,
}

impl StaticRouteTable {
    pub fn new(routes: Vec<HostRoute>) -> Self {
        Self { routes }
    }
}

impl RouteTable for StaticRouteTable {
    fn default_route(&self, family: IpFamily) -> Option<HostRoute> {
        self.routes
            .iter()
            .find(|r| IpFamily::of_net(&r.destination) == family && r.destination.prefix_len() == 0)
            .cloned()
    }

    fn routes(&self, family: IpFamily) -> Vec<HostRoute> {
        self.routes
            .iter()
            .filter(|r| IpFamily::of_net(&r.destination) == family)
            .cloned()
            .collect()
    }
}

/// Inputs of a settings derivation
#[derive(Debug, Clone, Copy)]
pub struct SettingsInput<'a> {
    pub local: &'a SessionConfig,
    pub negotiated: &'a SessionConfig,
    pub remote_address: Option<IpAddr>,
    pub capabilities: Capabilities,
}

impl<'a> SettingsInput<'a> {
    pub fn new(local: &'a SessionConfig, negotiated: &'a SessionConfig) -> Self {
        Self {
            local,
            negotiated,
            remote_address: None,
            capabilities: Capabilities::default(),
        }
    }

    fn routing_policies(&self) -> &'a [RoutingPolicy] {
        self.local
            .routing_policies
            .as_deref()
            .or(self.negotiated.routing_policies.as_deref())
            .unwrap_or(&[])
    }

    /// Whether the family is requested as a full-tunnel default route
    pub fn is_gateway(&self, family: IpFamily) -> bool {
        let policy = match family {
            IpFamily::V4 => RoutingPolicy::Ipv4,
            IpFamily::V6 => RoutingPolicy::Ipv6,
        };
        self.routing_policies().contains(&policy)
    }

    fn blocks_local(&self) -> bool {
        self.routing_policies().contains(&RoutingPolicy::BlockLocal)
    }
}

/// Derive host network settings.
///
/// Fails with [`TunnelError::GatewayUnattainable`] when a family is
/// requested as gateway but the peer assigned no address for it. Every other
/// rule degrades by omitting the affected sub-settings.
pub fn derive_network_settings(
    input: &SettingsInput<'_>,
    route_table: Option<&dyn RouteTable>,
) -> Result<NetworkSettings, TunnelError> {
    for family in [IpFamily::V4, IpFamily::V6] {
        if input.is_gateway(family) && input.negotiated.assignment(family).is_none() {
            warn!("{} requested as default gateway but no address was assigned", family);
            return Err(TunnelError::GatewayUnattainable);
        }
    }

    let mut settings = NetworkSettings {
        remote_address: input.remote_address,
        ipv4: input
            .negotiated
            .ipv4
            .as_ref()
            .map(|a| family_settings(a, IpFamily::V4, input.is_gateway(IpFamily::V4))),
        ipv6: input
            .negotiated
            .ipv6
            .as_ref()
            .map(|a| family_settings(a, IpFamily::V6, input.is_gateway(IpFamily::V6))),
        ..Default::default()
    };

    settings.dns = dns_settings(input, &mut settings);
    settings.proxy = proxy_settings(input.local, input.negotiated);

    if input.blocks_local() {
        if let Some(table) = route_table {
            apply_block_local(input, table, &mut settings);
        } else {
            debug!("Block local: no route table available, skipping");
        }
    }

    settings.mtu = input.local.mtu.filter(|mtu| *mtu > 0);

    Ok(settings)
}

fn family_settings(assignment: &IpAssignment, family: IpFamily, is_gateway: bool) -> IpSettings {
    let mut included_routes = Vec::new();

    if is_gateway {
        included_routes.push(IpRoute::default_via(assignment.default_gateway));
    }

    for route in &assignment.routes {
        if IpFamily::of_net(&route.destination) != family {
            warn!(
                "Ignoring {} route {} in {} assignment",
                IpFamily::of_net(&route.destination),
                route.destination,
                family
            );
            continue;
        }
        included_routes.push(IpRoute::new(route.destination.trunc(), route.gateway));
    }

    let excluded_routes = assignment
        .excluded_routes
        .iter()
        .filter(|net| IpFamily::of_net(net) == family)
        .map(|net| IpRoute::new(net.trunc(), None))
        .collect();

    IpSettings {
        addresses: vec![assignment.address],
        included_routes,
        excluded_routes,
    }
}

fn dns_settings(input: &SettingsInput<'_>, settings: &mut NetworkSettings) -> Option<DnsSettings> {
    if !input.local.dns_enabled.unwrap_or(true) {
        debug!("DNS settings disabled locally");
        return None;
    }

    let servers = non_empty(&input.local.dns_servers)
        .or_else(|| non_empty(&input.negotiated.dns_servers))?
        .clone();

    let mut protocol = input
        .local
        .dns_protocol
        .clone()
        .or_else(|| input.negotiated.dns_protocol.clone())
        .unwrap_or_default();

    if protocol != DnsProtocol::Plain && !input.capabilities.encrypted_dns {
        warn!("Encrypted DNS not supported on this host, falling back to plain DNS");
        protocol = DnsProtocol::Plain;
    }

    // DNS must reach the servers through the tunnel even without a default route
    for server in &servers {
        let family = IpFamily::of(server);
        if input.is_gateway(family) {
            continue;
        }
        if let Some(family_settings) = settings.family_mut(family) {
            family_settings.included_routes.push(IpRoute::host(*server));
        }
    }

    let search_domains = input
        .local
        .search_domains
        .clone()
        .or_else(|| input.negotiated.search_domains.clone())
        .unwrap_or_default();

    let is_full_gateway = input.is_gateway(IpFamily::V4) || input.is_gateway(IpFamily::V6);
    let match_domains = if !is_full_gateway && !search_domains.is_empty() {
        MatchDomains::Only(search_domains.clone())
    } else {
        MatchDomains::All
    };

    Some(DnsSettings {
        protocol,
        servers,
        domain_name: search_domains.first().cloned(),
        search_domains,
        match_domains,
    })
}

fn proxy_settings(local: &SessionConfig, negotiated: &SessionConfig) -> Option<ProxySettings> {
    if !local.proxy_enabled.unwrap_or(true) {
        debug!("Proxy settings disabled locally");
        return None;
    }

    let https = local.https_proxy.clone().or_else(|| negotiated.https_proxy.clone());
    let http = local.http_proxy.clone().or_else(|| negotiated.http_proxy.clone());
    let auto_config_url = local
        .proxy_auto_config_url
        .clone()
        .or_else(|| negotiated.proxy_auto_config_url.clone());

    if https.is_none() && http.is_none() && auto_config_url.is_none() {
        return None;
    }

    let bypass_domains = local
        .proxy_bypass_domains
        .clone()
        .or_else(|| negotiated.proxy_bypass_domains.clone())
        .unwrap_or_default();

    Some(ProxySettings {
        http,
        https,
        auto_config_url,
        bypass_domains,
    })
}

fn apply_block_local(
    input: &SettingsInput<'_>,
    table: &dyn RouteTable,
    settings: &mut NetworkSettings,
) {
    for family in [IpFamily::V4, IpFamily::V6] {
        if !input.is_gateway(family) {
            continue;
        }
        let Some(tunnel_gateway) = input.negotiated.assignment(family).map(|a| a.default_gateway)
        else {
            continue;
        };
        let routes = block_local_routes(table, family, tunnel_gateway);
        if let Some(family_settings) = settings.family_mut(family) {
            family_settings.included_routes.extend(routes);
        }
    }
}

/// Routes that re-tunnel the physical LAN segment for `family`.
///
/// Picks the narrowest non-default, non-host route on the default
/// interface that contains the physical gateway, splits it in two halves
/// and points both at the tunnel gateway. More specific than the LAN route,
/// the halves win the lookup.
pub fn block_local_routes(
    table: &dyn RouteTable,
    family: IpFamily,
    tunnel_gateway: IpAddr,
) -> Vec<IpRoute> {
    let Some(default_route) = table.default_route(family) else {
        debug!("Block local: no {} default route", family);
        return Vec::new();
    };
    let Some(physical_gateway) = default_route.gateway else {
        debug!("Block local: {} default route has no gateway", family);
        return Vec::new();
    };

    let lan = table
        .routes(family)
        .into_iter()
        .filter(|r| r.interface == default_route.interface)
        .filter(|r| {
            let prefix = r.destination.prefix_len();
            prefix > 0 && prefix < family.max_prefix_len()
        })
        .filter(|r| r.destination.contains(&physical_gateway))
        .max_by_key(|r| r.destination.prefix_len());

    let Some(lan) = lan else {
        debug!("Block local: no {} route contains gateway {}", family, physical_gateway);
        return Vec::new();
    };

    partition(&lan.destination)
        .into_iter()
        .map(|net| {
            info!("Block local: tunneling {} route {}", family, net);
            IpRoute::new(net, Some(tunnel_gateway))
        })
        .collect()
}

/// Split a network into its two halves (one prefix bit longer).
///
/// Host networks cannot be split and yield nothing.
pub fn partition(net: &IpNet) -> Vec<IpNet> {
    let net = net.trunc();
    match net.subnets(net.prefix_len() + 1) {
        Ok(subnets) => subnets.collect(),
        Err(_) => Vec::new(),
    }
}

fn non_empty<T>(values: &Option<Vec<T>>) -> Option<&Vec<T>> {
    values.as_ref().filter(|v| !v.is_empty())
}
