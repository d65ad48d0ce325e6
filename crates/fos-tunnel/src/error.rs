//! Tunnel Errors
//!
//! Error taxonomy shared by the controller and its collaborators.
//!
//! | Class | Variants | Handling |
//! |-------|----------|----------|
//! | Transient | name resolution, inactivity, negotiation timeout, network changed | endpoint advance or reconnect |
//! | Exhaustion | `EndpointsExhausted` | terminal |
//! | Configuration | `GatewayUnattainable` | terminal for the attempt |
//! | Authentication | `SessionError::AuthenticationFailed` | recovery hook, else terminal |
//! | Other | everything else | terminal, host cancellation |

/// Errors reported by the tunnel session engine.
///
/// These are "protocol level": a link that went down because of one of these
/// is never handed off to an upgraded transport.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("Negotiation timeout")]
    NegotiationTimeout,

    #[error("Authentication failed")]
    AuthenticationFailed,

    #[error("Protocol error: {0}")]
    Protocol(String),
}

/// Errors from resolving and connecting an endpoint candidate
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectError {
    #[error("Could not resolve host name: {0}")]
    NameResolutionFailure(String),

    #[error("Connection refused: {0}")]
    Refused(String),

    #[error("Connection timeout")]
    Timeout,

    #[error("Socket error: {0}")]
    Io(String),
}

impl ConnectError {
    /// Resolution failures are recovered by advancing the endpoint.
    pub fn is_name_resolution(&self) -> bool {
        matches!(self, ConnectError::NameResolutionFailure(_))
    }
}

/// Configuration errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("No remotes configured")]
    NoRemotes,

    #[error("No endpoint protocols configured")]
    NoEndpointProtocols,

    #[error("IO error: {0}")]
    Io(String),

    #[error("Parse error: {0}")]
    Parse(String),
}

/// Tunnel lifecycle errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TunnelError {
    #[error("All endpoints exhausted")]
    EndpointsExhausted,

    #[error("Default gateway is not attainable")]
    GatewayUnattainable,

    #[error("Socket activity failed")]
    SocketActivity,

    #[error("Link failed")]
    LinkError,

    #[error("Network changed")]
    NetworkChanged,

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Connect error: {0}")]
    Connect(#[from] ConnectError),

    #[error("Host error: {0}")]
    Host(String),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Invalid state: {0}")]
    InvalidState(&'static str),

    #[error("Tunnel stopped before start completed")]
    Cancelled,
}

impl TunnelError {
    /// Errors raised by the session engine itself (as opposed to the link).
    pub fn is_protocol_level(&self) -> bool {
        matches!(self, TunnelError::Session(_))
    }

    pub fn is_negotiation_timeout(&self) -> bool {
        matches!(self, TunnelError::Session(SessionError::NegotiationTimeout))
    }

    pub fn is_authentication_failure(&self) -> bool {
        matches!(self, TunnelError::Session(SessionError::AuthenticationFailed))
    }
}
