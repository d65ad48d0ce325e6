//! fOS Tunnel - VPN Lifecycle Controller
//!
//! Drives a VPN client session: picks an endpoint, opens a link, starts the
//! session over it, recovers from failures, and turns the negotiated
//! configuration into host network settings.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        Tunnel Queue                           │
//! │                                                               │
//! │  TunnelHandle ──▶ ┌────────────┐ ──▶ EndpointStrategy         │
//! │   start/stop/     │ Controller │ ──▶ Transport (observed)     │
//! │   pause/resume    │  (state    │ ──▶ Session                  │
//! │                   │  machine)  │ ──▶ derive_network_settings  │
//! │  link, session ──▶└────────────┘ ──▶ Host::apply              │
//! │  events, timers          │                                    │
//! │                          ▼                                    │
//! │                   Recovery policy                             │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! The tunnel protocol, the sockets and the host network stack are
//! collaborators behind traits ([`Session`], [`Transport`], [`Host`]).

mod completion;
mod config;
mod controller;
mod endpoint;
mod error;
mod handle;
mod policy;
mod session;
mod session_config;
mod settings;
mod transport;

#[cfg(test)]
mod testing;

pub use completion::{Callback, PendingCompletion};
pub use config::{Capabilities, ControllerOptions, EndpointProtocol, TunnelConfig};
pub use controller::{
    AuthFailureHook, Collaborators, Host, LifecycleObserver, TunnelController, TunnelState,
    TunnelStatus,
};
pub use endpoint::{
    Connector, DnsResolver, EndpointCandidate, EndpointStrategy, Resolver, TransportKind,
};
pub use error::{ConfigError, ConnectError, SessionError, TunnelError};
pub use handle::TunnelHandle;
pub use policy::{classify, BetterPathPolicy, LinkDown, Recovery};
pub use session::{
    Credentials, DataCount, Session, SessionEvent, SessionFactory, SessionObserver,
};
pub use session_config::{
    DnsProtocol, IpAssignment, IpFamily, ProxyServer, RouteSpec, RoutingPolicy, SessionConfig,
};
pub use settings::{
    block_local_routes, derive_network_settings, partition, DnsSettings, HostRoute, IpRoute,
    IpSettings, MatchDomains, NetworkSettings, ProxySettings, RouteTable, SettingsInput,
    StaticRouteTable,
};
pub use transport::{Transport, TransportEvent, TransportObserver};
