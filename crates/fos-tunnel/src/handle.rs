//! Tunnel Handle
//!
//! Caller-facing side of the tunnel queue. Every operation is posted to the
//! queue; completions run on the queue once the operation settles.
//!
//! # Usage
//!
//! ```rust,ignore
//! let tunnel = TunnelController::spawn(collaborators);
//!
//! tunnel.start(config, Some(credentials), |result| match result {
//!     Ok(()) => println!("Tunnel up"),
//!     Err(e) => eprintln!("Tunnel failed: {}", e),
//! });
//!
//! // later
//! tunnel.stop(|| println!("Tunnel down"));
//! ```

use crate::completion::Callback;
use crate::config::TunnelConfig;
use crate::controller::{Event, TunnelState, TunnelStatus};
use crate::error::TunnelError;
use crate::session::{Credentials, DataCount};
use crate::session_config::SessionConfig;
use std::sync::Arc;
use tokio::sync::mpsc::error::SendError;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::debug;

/// Requests from the handle
pub(crate) enum Command {
    Start {
        config: Box<TunnelConfig>,
        credentials: Option<Credentials>,
        completion: Callback<Result<(), TunnelError>>,
    },
    Stop {
        completion: Callback<()>,
    },
    Pause {
        completion: Callback<()>,
    },
    Resume,
    DataCount {
        reply: oneshot::Sender<Option<DataCount>>,
    },
    ServerConfiguration {
        reply: oneshot::Sender<Option<SessionConfig>>,
    },
    LastError {
        reply: oneshot::Sender<Option<TunnelError>>,
    },
    /// Last handle dropped
    Detach,
}

struct HandleInner {
    tx: mpsc::UnboundedSender<Event>,
    status: watch::Receiver<TunnelStatus>,
}

impl Drop for HandleInner {
    fn drop(&mut self) {
        // Tear the tunnel down with the last handle
        let _ = self.tx.send(Event::Command(Command::Detach));
    }
}

/// Cloneable handle to a running tunnel queue
#[derive(Clone)]
pub struct TunnelHandle {
    inner: Arc<HandleInner>,
}

impl TunnelHandle {
    pub(crate) fn new(
        tx: mpsc::UnboundedSender<Event>,
        status: watch::Receiver<TunnelStatus>,
    ) -> Self {
        Self {
            inner: Arc::new(HandleInner { tx, status }),
        }
    }

    /// Start the tunnel. `on_complete` runs exactly once: with `Ok` once
    /// settings are applied, with the error on any failure.
    pub fn start<F>(&self, config: TunnelConfig, credentials: Option<Credentials>, on_complete: F)
    where
        F: FnOnce(Result<(), TunnelError>) + Send + 'static,
    {
        let command = Command::Start {
            config: Box::new(config),
            credentials,
            completion: Box::new(on_complete),
        };

        if let Err(SendError(Event::Command(Command::Start { completion, .. }))) =
            self.inner.tx.send(Event::Command(command))
        {
            completion(Err(TunnelError::Cancelled));
        }
    }

    /// Stop the tunnel. `on_complete` runs exactly once, at the latest after
    /// the shutdown timeout.
    pub fn stop<F>(&self, on_complete: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let command = Command::Stop {
            completion: Box::new(move |()| on_complete()),
        };

        if let Err(SendError(Event::Command(Command::Stop { completion }))) =
            self.inner.tx.send(Event::Command(command))
        {
            completion(());
        }
    }

    /// Drop the link but keep the session for a warm resume
    pub fn pause<F>(&self, on_complete: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let command = Command::Pause {
            completion: Box::new(move |()| on_complete()),
        };

        if let Err(SendError(Event::Command(Command::Pause { completion }))) =
            self.inner.tx.send(Event::Command(command))
        {
            completion(());
        }
    }

    pub fn resume(&self) {
        self.send(Command::Resume);
    }

    /// Traffic counters of the current session
    pub async fn data_count(&self) -> Option<DataCount> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::DataCount { reply });
        rx.await.ok().flatten()
    }

    /// Configuration the server pushed to the current session
    pub async fn server_configuration(&self) -> Option<SessionConfig> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::ServerConfiguration { reply });
        rx.await.ok().flatten()
    }

    /// Error the tunnel last terminated with
    pub async fn last_error(&self) -> Option<TunnelError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::LastError { reply });
        rx.await.ok().flatten()
    }

    pub fn status(&self) -> TunnelStatus {
        *self.inner.status.borrow()
    }

    pub fn state(&self) -> TunnelState {
        self.status().state
    }

    pub fn is_reasserting(&self) -> bool {
        self.status().reasserting
    }

    /// Watch status changes
    pub fn subscribe(&self) -> watch::Receiver<TunnelStatus> {
        self.inner.status.clone()
    }

    fn send(&self, command: Command) {
        if self.inner.tx.send(Event::Command(command)).is_err() {
            debug!("Tunnel queue closed, dropping command");
        }
    }
}
