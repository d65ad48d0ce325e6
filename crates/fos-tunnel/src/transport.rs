//! Transport Observation
//!
//! Wraps the single active link and forwards its activity onto the tunnel
//! queue. Every observed link gets a generation number; events from an
//! older generation are discarded by the controller.
//!
//! # Event Rules
//!
//! - `on_active` fires at most once
//! - `on_timeout` fires at most once
//! - `on_shutdown` is terminal: it fires at most once and silences the
//!   observer afterwards
//! - `on_better_path` may fire any number of times until shutdown

use crate::controller::Event;
use crate::endpoint::TransportKind;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tracing::debug;

/// Link-level socket consumed by the controller
pub trait Transport: Send + Sync {
    /// Kind of the underlying socket
    fn kind(&self) -> TransportKind;

    /// Remote peer, once known
    fn remote_address(&self) -> Option<SocketAddr>;

    /// Start reporting activity to `observer`, timing out after `timeout`
    /// without activity
    fn observe(&self, observer: TransportObserver, timeout: Duration);

    /// Stop reporting activity
    fn unobserve(&self);

    /// Close the link. Reported through `on_shutdown`.
    fn shutdown(&self);

    fn is_shutdown(&self) -> bool;

    /// Alternate live link discovered in the background, if any
    fn upgraded(&self) -> Option<Arc<dyn Transport>>;
}

/// Activity reported by a link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportEvent {
    Active,
    Timeout,
    Shutdown { had_failure: bool },
    BetterPath { viable: bool },
}

#[derive(Default)]
struct ObserverFlags {
    active: AtomicBool,
    timed_out: AtomicBool,
    shut_down: AtomicBool,
}

/// Callback handle given to a [`Transport`] while it is observed
#[derive(Clone)]
pub struct TransportObserver {
    generation: u64,
    tx: UnboundedSender<Event>,
    flags: Arc<ObserverFlags>,
}

impl TransportObserver {
    pub(crate) fn new(generation: u64, tx: UnboundedSender<Event>) -> Self {
        Self {
            generation,
            tx,
            flags: Arc::new(ObserverFlags::default()),
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// The link became usable
    pub fn on_active(&self) {
        if self.is_silenced() || self.flags.active.swap(true, Ordering::SeqCst) {
            return;
        }
        self.forward(TransportEvent::Active);
    }

    /// No activity within the observation timeout
    pub fn on_timeout(&self) {
        if self.is_silenced() || self.flags.timed_out.swap(true, Ordering::SeqCst) {
            return;
        }
        self.forward(TransportEvent::Timeout);
    }

    /// The link closed
    pub fn on_shutdown(&self, had_failure: bool) {
        if self.flags.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.forward(TransportEvent::Shutdown { had_failure });
    }

    /// A better network path became available
    pub fn on_better_path(&self, viable: bool) {
        if self.is_silenced() {
            return;
        }
        self.forward(TransportEvent::BetterPath { viable });
    }

    fn is_silenced(&self) -> bool {
        self.flags.shut_down.load(Ordering::SeqCst)
    }

    fn forward(&self, event: TransportEvent) {
        let generation = self.generation;
        if self.tx.send(Event::Transport { generation, event }).is_err() {
            debug!("Tunnel queue closed, dropping link event {:?}", event);
        }
    }
}

/// The link currently owned by the controller
pub(crate) struct ObservedTransport {
    generation: u64,
    transport: Arc<dyn Transport>,
}

impl ObservedTransport {
    pub(crate) fn new(transport: Arc<dyn Transport>, generation: u64) -> Self {
        Self { generation, transport }
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    pub(crate) fn kind(&self) -> TransportKind {
        self.transport.kind()
    }

    pub(crate) fn link(&self) -> Arc<dyn Transport> {
        self.transport.clone()
    }

    pub(crate) fn observe(&self, tx: UnboundedSender<Event>, timeout: Duration) {
        let observer = TransportObserver::new(self.generation, tx);
        self.transport.observe(observer, timeout);
    }

    pub(crate) fn shutdown(&self) {
        self.transport.shutdown();
    }

    /// Stop observing and close the link without waiting for the report
    pub(crate) fn dispose(&self) {
        self.transport.unobserve();
        if !self.transport.is_shutdown() {
            self.transport.shutdown();
        }
    }

    /// Live upgraded link that can replace this one
    pub(crate) fn upgrade(&self) -> Option<Arc<dyn Transport>> {
        self.transport.upgraded().filter(|t| !t.is_shutdown())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn drain(rx: &mut mpsc::UnboundedReceiver<Event>) -> Vec<TransportEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let Event::Transport { event, .. } = event {
                events.push(event);
            }
        }
        events
    }

    #[test]
    fn test_terminal_event_fires_once() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let observer = TransportObserver::new(3, tx);

        observer.on_active();
        observer.on_active();
        observer.on_shutdown(true);
        observer.on_shutdown(false);
        observer.on_timeout();
        observer.on_better_path(true);

        assert_eq!(
            drain(&mut rx),
            vec![TransportEvent::Active, TransportEvent::Shutdown { had_failure: true }]
        );
    }

    #[test]
    fn test_better_path_repeats() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let observer = TransportObserver::new(1, tx);

        observer.on_active();
        observer.on_better_path(true);
        observer.on_better_path(false);
        observer.on_timeout();
        observer.on_timeout();

        assert_eq!(
            drain(&mut rx),
            vec![
                TransportEvent::Active,
                TransportEvent::BetterPath { viable: true },
                TransportEvent::BetterPath { viable: false },
                TransportEvent::Timeout,
            ]
        );
    }

    #[test]
    fn test_events_carry_generation() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let observer = TransportObserver::new(42, tx);
        observer.clone().on_timeout();

        match rx.try_recv() {
            Ok(Event::Transport { generation, .. }) => assert_eq!(generation, 42),
            _ => panic!("expected a transport event"),
        }
    }
}
