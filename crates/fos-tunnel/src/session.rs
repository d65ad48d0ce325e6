//! Session Engine Interface
//!
//! The tunnel protocol itself (handshake, keys, data channel) lives outside
//! this crate. The controller drives it through [`Session`] and hears back
//! through a [`SessionObserver`].

use crate::controller::Event;
use crate::error::TunnelError;
use crate::session_config::SessionConfig;
use crate::transport::Transport;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;
use tracing::debug;

/// Traffic counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataCount {
    /// Bytes received through tunnel
    pub bytes_in: u64,
    /// Bytes sent through tunnel
    pub bytes_out: u64,
}

impl DataCount {
    pub fn new(bytes_in: u64, bytes_out: u64) -> Self {
        Self { bytes_in, bytes_out }
    }

    /// Format as human-readable string
    pub fn format(&self) -> String {
        format!(
            "RX: {:.2}MB, TX: {:.2}MB",
            self.bytes_in as f64 / (1024.0 * 1024.0),
            self.bytes_out as f64 / (1024.0 * 1024.0),
        )
    }
}

/// User credentials handed to the session engine
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"[redacted]")
            .finish()
    }
}

/// A negotiated (or negotiating) tunnel session.
///
/// Implementations report progress through the [`SessionObserver`] they
/// were created with; none of these calls block.
pub trait Session: Send + Sync {
    /// Attach a fresh link and begin negotiation
    fn set_link(&self, link: Arc<dyn Transport>);

    /// Swap the link of an already negotiated session
    fn rebind_link(&self, link: Arc<dyn Transport>);

    /// Whether [`Session::rebind_link`] is supported
    fn can_rebind_link(&self) -> bool;

    /// Stop the session. Reported through `on_stopped`.
    fn shutdown(&self, error: Option<TunnelError>);

    /// Restart negotiation, asking the controller to reconnect
    fn reconnect(&self, error: TunnelError);

    /// Drop all session state
    fn cleanup(&self);

    fn data_count(&self) -> Option<DataCount>;

    fn server_configuration(&self) -> Option<SessionConfig>;
}

/// Creates sessions for a given configuration
pub trait SessionFactory: Send + Sync {
    fn create(
        &self,
        config: &SessionConfig,
        credentials: Option<&Credentials>,
        observer: SessionObserver,
    ) -> Result<Arc<dyn Session>, TunnelError>;
}

/// Notifications raised by a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Started {
        remote_address: Option<IpAddr>,
        negotiated: SessionConfig,
    },
    Stopped {
        error: Option<TunnelError>,
        should_reconnect: bool,
    },
}

/// Callback handle given to a [`Session`]
#[derive(Clone)]
pub struct SessionObserver {
    generation: u64,
    tx: UnboundedSender<Event>,
}

impl SessionObserver {
    pub(crate) fn new(generation: u64, tx: UnboundedSender<Event>) -> Self {
        Self { generation, tx }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Negotiation completed
    pub fn on_started(&self, remote_address: Option<IpAddr>, negotiated: SessionConfig) {
        self.forward(SessionEvent::Started {
            remote_address,
            negotiated,
        });
    }

    /// Session stopped, optionally asking to be reconnected
    pub fn on_stopped(&self, error: Option<TunnelError>, should_reconnect: bool) {
        self.forward(SessionEvent::Stopped {
            error,
            should_reconnect,
        });
    }

    fn forward(&self, event: SessionEvent) {
        let generation = self.generation;
        if self.tx.send(Event::Session { generation, event }).is_err() {
            debug!("Tunnel queue closed, dropping session event");
        }
    }
}
