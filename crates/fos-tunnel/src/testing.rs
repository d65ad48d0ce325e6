//! Scriptable collaborators for controller tests.

use crate::controller::{Host, LifecycleObserver};
use crate::endpoint::{Connector, Resolver, TransportKind};
use crate::error::{ConnectError, TunnelError};
use crate::session::{Credentials, DataCount, Session, SessionFactory, SessionObserver};
use crate::session_config::{IpAssignment, RoutingPolicy, SessionConfig};
use crate::settings::NetworkSettings;
use crate::transport::{Transport, TransportObserver};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

// ---- transport ----

pub struct MockTransport {
    kind: TransportKind,
    remote: SocketAddr,
    auto_active: bool,
    observer: Mutex<Option<TransportObserver>>,
    shut_down: AtomicBool,
    upgraded: Mutex<Option<Arc<dyn Transport>>>,
}

impl MockTransport {
    pub fn new(kind: TransportKind, remote: SocketAddr, auto_active: bool) -> Arc<Self> {
        Arc::new(Self {
            kind,
            remote,
            auto_active,
            observer: Mutex::new(None),
            shut_down: AtomicBool::new(false),
            upgraded: Mutex::new(None),
        })
    }

    fn observer(&self) -> Option<TransportObserver> {
        self.observer.lock().unwrap().clone()
    }

    pub fn fire_active(&self) {
        if let Some(observer) = self.observer() {
            observer.on_active();
        }
    }

    pub fn fire_timeout(&self) {
        if let Some(observer) = self.observer() {
            observer.on_timeout();
        }
    }

    pub fn fire_better_path(&self, viable: bool) {
        if let Some(observer) = self.observer() {
            observer.on_better_path(viable);
        }
    }

    /// Drop the link with a failure
    pub fn fail(&self) {
        if !self.shut_down.swap(true, Ordering::SeqCst) {
            if let Some(observer) = self.observer() {
                observer.on_shutdown(true);
            }
        }
    }

    pub fn set_upgrade(&self, link: Arc<dyn Transport>) {
        *self.upgraded.lock().unwrap() = Some(link);
    }
}

impl Transport for MockTransport {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    fn remote_address(&self) -> Option<SocketAddr> {
        Some(self.remote)
    }

    fn observe(&self, observer: TransportObserver, _timeout: Duration) {
        if self.auto_active {
            observer.on_active();
        }
        *self.observer.lock().unwrap() = Some(observer);
    }

    fn unobserve(&self) {
        self.observer.lock().unwrap().take();
    }

    fn shutdown(&self) {
        if !self.shut_down.swap(true, Ordering::SeqCst) {
            if let Some(observer) = self.observer() {
                observer.on_shutdown(false);
            }
        }
    }

    fn is_shutdown(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    fn upgraded(&self) -> Option<Arc<dyn Transport>> {
        self.upgraded.lock().unwrap().clone()
    }
}

// ---- resolver / connector ----

#[derive(Default)]
pub struct MockResolver {
    hosts: Mutex<HashMap<String, Vec<IpAddr>>>,
    lookups: AtomicUsize,
}

impl MockResolver {
    pub fn insert(&self, host: &str, addresses: Vec<IpAddr>) {
        self.hosts.lock().unwrap().insert(host.to_string(), addresses);
    }

    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Resolver for MockResolver {
    async fn resolve(&self, host: &str, _timeout: Duration) -> Result<Vec<IpAddr>, ConnectError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        self.hosts
            .lock()
            .unwrap()
            .get(host)
            .cloned()
            .ok_or_else(|| ConnectError::NameResolutionFailure(host.to_string()))
    }
}

pub struct MockConnector {
    attempts: Mutex<Vec<SocketAddr>>,
    refused: Mutex<HashSet<SocketAddr>>,
    transports: Mutex<Vec<Arc<MockTransport>>>,
    auto_active: AtomicBool,
}

impl Default for MockConnector {
    fn default() -> Self {
        Self {
            attempts: Mutex::new(Vec::new()),
            refused: Mutex::new(HashSet::new()),
            transports: Mutex::new(Vec::new()),
            auto_active: AtomicBool::new(true),
        }
    }
}

impl MockConnector {
    pub fn refuse(&self, addr: SocketAddr) {
        self.refused.lock().unwrap().insert(addr);
    }

    /// New links stay silent until told otherwise
    pub fn set_auto_active(&self, auto_active: bool) {
        self.auto_active.store(auto_active, Ordering::SeqCst);
    }

    pub fn attempts(&self) -> Vec<SocketAddr> {
        self.attempts.lock().unwrap().clone()
    }

    pub fn transports(&self) -> Vec<Arc<MockTransport>> {
        self.transports.lock().unwrap().clone()
    }

    pub fn last_transport(&self) -> Arc<MockTransport> {
        self.transports.lock().unwrap().last().cloned().expect("no link connected")
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(
        &self,
        addr: SocketAddr,
        kind: TransportKind,
        _timeout: Duration,
    ) -> Result<Arc<dyn Transport>, ConnectError> {
        self.attempts.lock().unwrap().push(addr);
        if self.refused.lock().unwrap().contains(&addr) {
            return Err(ConnectError::Refused(addr.to_string()));
        }

        let transport = MockTransport::new(kind, addr, self.auto_active.load(Ordering::SeqCst));
        self.transports.lock().unwrap().push(transport.clone());
        Ok(transport as Arc<dyn Transport>)
    }
}

// ---- session ----

pub struct MockSession {
    observer: SessionObserver,
    negotiated: SessionConfig,
    start_error: Option<TunnelError>,
    can_rebind: bool,
    responsive: bool,
    pub set_links: AtomicUsize,
    pub rebinds: AtomicUsize,
    pub cleanups: AtomicUsize,
    pub shutdowns: AtomicUsize,
}

impl MockSession {
    pub fn set_link_count(&self) -> usize {
        self.set_links.load(Ordering::SeqCst)
    }

    pub fn rebind_count(&self) -> usize {
        self.rebinds.load(Ordering::SeqCst)
    }

    /// Report a spontaneous stop
    pub fn fire_stopped(&self, error: Option<TunnelError>, should_reconnect: bool) {
        self.observer.on_stopped(error, should_reconnect);
    }
}

impl Session for MockSession {
    fn set_link(&self, link: Arc<dyn Transport>) {
        self.set_links.fetch_add(1, Ordering::SeqCst);
        match &self.start_error {
            Some(error) => self.observer.on_stopped(Some(error.clone()), false),
            None => self
                .observer
                .on_started(link.remote_address().map(|a| a.ip()), self.negotiated.clone()),
        }
    }

    fn rebind_link(&self, _link: Arc<dyn Transport>) {
        self.rebinds.fetch_add(1, Ordering::SeqCst);
    }

    fn can_rebind_link(&self) -> bool {
        self.can_rebind
    }

    fn shutdown(&self, error: Option<TunnelError>) {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
        if self.responsive {
            self.observer.on_stopped(error, false);
        }
    }

    fn reconnect(&self, error: TunnelError) {
        self.observer.on_stopped(Some(error), true);
    }

    fn cleanup(&self) {
        self.cleanups.fetch_add(1, Ordering::SeqCst);
    }

    fn data_count(&self) -> Option<DataCount> {
        Some(DataCount::new(2048, 1024))
    }

    fn server_configuration(&self) -> Option<SessionConfig> {
        Some(self.negotiated.clone())
    }
}

pub struct MockSessionFactory {
    pub negotiated: Mutex<SessionConfig>,
    pub start_error: Mutex<Option<TunnelError>>,
    pub create_error: Mutex<Option<TunnelError>>,
    pub can_rebind: AtomicBool,
    pub responsive: AtomicBool,
    sessions: Mutex<Vec<Arc<MockSession>>>,
}

impl Default for MockSessionFactory {
    fn default() -> Self {
        Self {
            negotiated: Mutex::new(negotiated_config()),
            start_error: Mutex::new(None),
            create_error: Mutex::new(None),
            can_rebind: AtomicBool::new(false),
            responsive: AtomicBool::new(true),
            sessions: Mutex::new(Vec::new()),
        }
    }
}

impl MockSessionFactory {
    pub fn sessions(&self) -> Vec<Arc<MockSession>> {
        self.sessions.lock().unwrap().clone()
    }

    pub fn last_session(&self) -> Arc<MockSession> {
        self.sessions.lock().unwrap().last().cloned().expect("no session created")
    }
}

impl SessionFactory for MockSessionFactory {
    fn create(
        &self,
        _config: &SessionConfig,
        _credentials: Option<&Credentials>,
        observer: SessionObserver,
    ) -> Result<Arc<dyn Session>, TunnelError> {
        if let Some(error) = self.create_error.lock().unwrap().clone() {
            return Err(error);
        }

        let session = Arc::new(MockSession {
            observer,
            negotiated: self.negotiated.lock().unwrap().clone(),
            start_error: self.start_error.lock().unwrap().clone(),
            can_rebind: self.can_rebind.load(Ordering::SeqCst),
            responsive: self.responsive.load(Ordering::SeqCst),
            set_links: AtomicUsize::new(0),
            rebinds: AtomicUsize::new(0),
            cleanups: AtomicUsize::new(0),
            shutdowns: AtomicUsize::new(0),
        });
        self.sessions.lock().unwrap().push(session.clone());
        Ok(session as Arc<dyn Session>)
    }
}

/// Full-tunnel IPv4 configuration as a server would push it
pub fn negotiated_config() -> SessionConfig {
    SessionConfig {
        ipv4: Some(IpAssignment {
            address: "10.8.0.2/24".parse().unwrap(),
            default_gateway: "10.8.0.1".parse().unwrap(),
            routes: Vec::new(),
            excluded_routes: Vec::new(),
        }),
        routing_policies: Some(vec![RoutingPolicy::Ipv4]),
        dns_servers: Some(vec!["10.8.0.1".parse().unwrap()]),
        ..Default::default()
    }
}

// ---- host / observer ----

#[derive(Default)]
pub struct MockHost {
    pub applied: Mutex<Vec<NetworkSettings>>,
    pub reasserting: Mutex<Vec<bool>>,
    pub cancelled: Mutex<Vec<Option<TunnelError>>>,
    pub fail_apply: Mutex<Option<TunnelError>>,
}

impl MockHost {
    pub fn applied_count(&self) -> usize {
        self.applied.lock().unwrap().len()
    }

    pub fn cancellations(&self) -> Vec<Option<TunnelError>> {
        self.cancelled.lock().unwrap().clone()
    }
}

#[async_trait]
impl Host for MockHost {
    async fn apply(&self, settings: NetworkSettings) -> Result<(), TunnelError> {
        if let Some(error) = self.fail_apply.lock().unwrap().clone() {
            return Err(error);
        }
        self.applied.lock().unwrap().push(settings);
        Ok(())
    }

    fn set_reasserting(&self, reasserting: bool) {
        self.reasserting.lock().unwrap().push(reasserting);
    }

    fn cancel(&self, error: Option<TunnelError>) {
        self.cancelled.lock().unwrap().push(error);
    }
}

#[derive(Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<String>>,
}

impl RecordingObserver {
    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }
}

impl LifecycleObserver for RecordingObserver {
    fn on_will_start(&self) {
        self.events.lock().unwrap().push("will_start".into());
    }

    fn on_did_start(&self, _negotiated: &SessionConfig) {
        self.events.lock().unwrap().push("did_start".into());
    }

    fn on_did_stop(&self, error: Option<&TunnelError>) {
        let event = match error {
            Some(e) => format!("did_stop({})", e),
            None => "did_stop".to_string(),
        };
        self.events.lock().unwrap().push(event);
    }
}
