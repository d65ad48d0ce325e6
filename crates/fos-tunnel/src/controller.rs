//! Lifecycle Controller
//!
//! Owns the tunnel state machine. Every state change happens on one task
//! (the tunnel queue); collaborators, timers and the public handle only post
//! [`Event`]s to it.
//!
//! # States
//!
//! ```text
//!            start()                link active            session started
//!   Idle ─────────────▶ Connecting ───────────▶ Awaiting ───────────────▶ Active
//!                          ▲  │ name resolution      │ settings applied      │
//!                          │  └──▶ next endpoint     │                       │ timeout / failure /
//!                          │                         │                       │ better path
//!                          └──────── Reasserting ◀───┴───────────────────────┘
//!
//!   any ── stop() ──▶ Stopping ── session stopped / watchdog ──▶ Stopped
//!   any ── pause() ─▶ Pausing ─── link down ──▶ Paused ── resume() ──▶ Connecting
//! ```
//!
//! Collaborator events carry the generation of the link or session that
//! raised them, and timers carry a token; anything older than the current
//! generation or token is dropped.

use crate::completion::{Callback, PendingCompletion};
use crate::config::{ControllerOptions, TunnelConfig};
use crate::endpoint::{Connector, EndpointStrategy, Resolver};
use crate::error::{ConnectError, TunnelError};
use crate::handle::{Command, TunnelHandle};
use crate::policy::{self, LinkDown, Recovery};
use crate::session::{Credentials, Session, SessionEvent, SessionFactory, SessionObserver};
use crate::session_config::SessionConfig;
use crate::settings::{derive_network_settings, NetworkSettings, RouteTable, SettingsInput};
use crate::transport::{ObservedTransport, Transport, TransportEvent};
use async_trait::async_trait;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

/// Tunnel lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TunnelState {
    /// Not started
    Idle,
    /// Resolving and connecting an endpoint
    ConnectingTransport,
    /// Link is up, session negotiating
    AwaitingSessionStart,
    /// Session negotiated, settings applied
    Active,
    /// Waiting to reconnect after a recoverable failure
    Reasserting,
    /// Link shutting down for a pause
    Pausing,
    /// Link down, session kept for a warm resume
    Paused,
    /// Waiting for the session to stop
    Stopping,
    /// Torn down
    Stopped,
}

impl TunnelState {
    /// Check if the tunnel carries traffic
    pub fn is_active(&self) -> bool {
        matches!(self, TunnelState::Active)
    }

    /// Check if a start() would be accepted
    pub fn is_startable(&self) -> bool {
        matches!(self, TunnelState::Idle | TunnelState::Stopped)
    }

    /// Check if pause() has anything to pause
    pub fn is_pausable(&self) -> bool {
        matches!(
            self,
            TunnelState::ConnectingTransport
                | TunnelState::AwaitingSessionStart
                | TunnelState::Active
                | TunnelState::Reasserting
        )
    }
}

/// Externally observable status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TunnelStatus {
    pub state: TunnelState,
    /// Connection is being re-established
    pub reasserting: bool,
}

impl Default for TunnelStatus {
    fn default() -> Self {
        Self {
            state: TunnelState::Idle,
            reasserting: false,
        }
    }
}

/// The host network stack
#[async_trait]
pub trait Host: Send + Sync {
    /// Apply settings to the host network stack
    async fn apply(&self, settings: NetworkSettings) -> Result<(), TunnelError>;

    /// Connection is being re-established
    fn set_reasserting(&self, reasserting: bool);

    /// The tunnel went down without being asked to
    fn cancel(&self, error: Option<TunnelError>);
}

/// Lifecycle notifications
pub trait LifecycleObserver: Send + Sync {
    fn on_will_start(&self) {}

    fn on_did_start(&self, _negotiated: &SessionConfig) {}

    fn on_did_stop(&self, _error: Option<&TunnelError>) {}
}

struct NoopObserver;

impl LifecycleObserver for NoopObserver {}

/// Recovery hook invoked on authentication failure
pub type AuthFailureHook = Arc<dyn Fn(TunnelError) + Send + Sync>;

/// Everything the controller talks to
#[derive(Clone)]
pub struct Collaborators {
    pub resolver: Arc<dyn Resolver>,
    pub connector: Arc<dyn Connector>,
    pub session_factory: Arc<dyn SessionFactory>,
    pub host: Arc<dyn Host>,
    /// Only consulted by the block-local rule
    pub route_table: Option<Arc<dyn RouteTable>>,
    pub observer: Arc<dyn LifecycleObserver>,
    pub auth_failure_hook: Option<AuthFailureHook>,
}

impl Collaborators {
    pub fn new(
        resolver: Arc<dyn Resolver>,
        connector: Arc<dyn Connector>,
        session_factory: Arc<dyn SessionFactory>,
        host: Arc<dyn Host>,
    ) -> Self {
        Self {
            resolver,
            connector,
            session_factory,
            host,
            route_table: None,
            observer: Arc::new(NoopObserver),
            auth_failure_hook: None,
        }
    }

    pub fn with_route_table(mut self, route_table: Arc<dyn RouteTable>) -> Self {
        self.route_table = Some(route_table);
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn LifecycleObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn with_auth_failure_hook(mut self, hook: AuthFailureHook) -> Self {
        self.auth_failure_hook = Some(hook);
        self
    }
}

/// Messages processed by the tunnel queue
pub(crate) enum Event {
    Command(Command),
    Connected {
        attempt: u64,
        result: Result<Arc<dyn Transport>, ConnectError>,
    },
    Transport {
        generation: u64,
        event: TransportEvent,
    },
    Session {
        generation: u64,
        event: SessionEvent,
    },
    SettingsApplied {
        epoch: u64,
        result: Result<(), TunnelError>,
    },
    StopWatchdog {
        token: u64,
    },
    ReconnectTimer {
        token: u64,
    },
}

/// Spawns the tunnel queue
pub struct TunnelController;

impl TunnelController {
    /// Start the tunnel queue on the current tokio runtime.
    ///
    /// The queue runs until the last [`TunnelHandle`] clone is dropped.
    pub fn spawn(collaborators: Collaborators) -> TunnelHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(TunnelStatus::default());

        let controller = Controller::new(collaborators, tx.clone(), status_tx);
        tokio::spawn(controller.run(rx));

        TunnelHandle::new(tx, status_rx)
    }
}

struct Controller {
    collaborators: Collaborators,
    tx: mpsc::UnboundedSender<Event>,
    status: watch::Sender<TunnelStatus>,

    state: TunnelState,
    reasserting: bool,
    should_reconnect: bool,

    config: Option<TunnelConfig>,
    strategy: Option<EndpointStrategy>,
    transport: Option<ObservedTransport>,
    session: Option<Arc<dyn Session>>,
    negotiated: Option<SessionConfig>,
    session_stop_error: Option<TunnelError>,
    pending_upgrade: Option<Arc<dyn Transport>>,
    last_error: Option<TunnelError>,

    start_completion: PendingCompletion<Result<(), TunnelError>>,
    stop_completion: PendingCompletion<()>,
    pause_completion: PendingCompletion<()>,

    connect_attempt: u64,
    transport_generation: u64,
    session_generation: u64,
    apply_epoch: u64,
    stop_token: u64,
    reconnect_token: u64,
}

impl Controller {
    fn new(
        collaborators: Collaborators,
        tx: mpsc::UnboundedSender<Event>,
        status: watch::Sender<TunnelStatus>,
    ) -> Self {
        Self {
            collaborators,
            tx,
            status,
            state: TunnelState::Idle,
            reasserting: false,
            should_reconnect: false,
            config: None,
            strategy: None,
            transport: None,
            session: None,
            negotiated: None,
            session_stop_error: None,
            pending_upgrade: None,
            last_error: None,
            start_completion: PendingCompletion::new(),
            stop_completion: PendingCompletion::new(),
            pause_completion: PendingCompletion::new(),
            connect_attempt: 0,
            transport_generation: 0,
            session_generation: 0,
            apply_epoch: 0,
            stop_token: 0,
            reconnect_token: 0,
        }
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Event>) {
        debug!("Tunnel queue started");

        while let Some(event) = rx.recv().await {
            match event {
                Event::Command(Command::Detach) => {
                    self.detach();
                    break;
                }
                Event::Command(command) => self.on_command(command),
                Event::Connected { attempt, result } => self.on_connected(attempt, result),
                Event::Transport { generation, event } => {
                    self.on_transport_event(generation, event)
                }
                Event::Session { generation, event } => self.on_session_event(generation, event),
                Event::SettingsApplied { epoch, result } => self.on_settings_applied(epoch, result),
                Event::StopWatchdog { token } => self.on_stop_watchdog(token),
                Event::ReconnectTimer { token } => self.on_reconnect_timer(token),
            }
        }

        debug!("Tunnel queue stopped");
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::Start {
                config,
                credentials,
                completion,
            } => self.start(*config, credentials, completion),
            Command::Stop { completion } => self.stop(completion),
            Command::Pause { completion } => self.pause(completion),
            Command::Resume => self.resume(),
            Command::DataCount { reply } => {
                let _ = reply.send(self.session.as_ref().and_then(|s| s.data_count()));
            }
            Command::ServerConfiguration { reply } => {
                let _ = reply.send(self.session.as_ref().and_then(|s| s.server_configuration()));
            }
            Command::LastError { reply } => {
                let _ = reply.send(self.last_error.clone());
            }
            Command::Detach => {}
        }
    }

    // ---- caller operations ----

    fn start(
        &mut self,
        config: TunnelConfig,
        credentials: Option<Credentials>,
        completion: Callback<Result<(), TunnelError>>,
    ) {
        if !self.state.is_startable() {
            warn!("Start requested while {:?}", self.state);
            completion(Err(TunnelError::InvalidState("tunnel already started")));
            return;
        }

        let strategy = match EndpointStrategy::new(&config) {
            Ok(strategy) => strategy,
            Err(e) => {
                error!("Invalid tunnel configuration: {}", e);
                completion(Err(e.into()));
                return;
            }
        };

        if let Err(completion) = self.start_completion.try_arm(completion) {
            completion(Err(TunnelError::InvalidState("start already pending")));
            return;
        }

        info!("Starting tunnel ({} endpoint candidates)", strategy.len());
        config.session.log("Local");

        self.should_reconnect = false;
        self.session_stop_error = None;
        self.last_error = None;
        self.negotiated = None;
        self.strategy = Some(strategy);
        self.collaborators.observer.on_will_start();

        self.session_generation += 1;
        let observer = SessionObserver::new(self.session_generation, self.tx.clone());
        let created = self
            .collaborators
            .session_factory
            .create(&config.session, credentials.as_ref(), observer);
        self.config = Some(config);

        match created {
            Ok(session) => {
                self.session = Some(session);
                self.connect_tunnel(None);
            }
            Err(e) => {
                error!("Could not create session: {}", e);
                self.terminate(Some(e));
            }
        }
    }

    fn stop(&mut self, completion: Callback<()>) {
        info!("Stopping tunnel");

        self.should_reconnect = false;
        self.reconnect_token += 1;
        if let Some(upgrade) = self.pending_upgrade.take() {
            upgrade.shutdown();
        }
        self.set_reasserting(false);

        // stop preempts a pending start or pause
        self.start_completion.complete(Err(TunnelError::Cancelled));
        self.pause_completion.complete(());

        match self.state {
            TunnelState::Idle | TunnelState::Stopped => {
                completion(());
                return;
            }
            TunnelState::Stopping => {
                debug!("Stop already in progress");
                completion(());
                return;
            }
            _ => {}
        }

        if let Err(completion) = self.stop_completion.try_arm(completion) {
            completion(());
            return;
        }

        self.set_state(TunnelState::Stopping);

        self.stop_token += 1;
        let token = self.stop_token;
        self.schedule(self.options().shutdown_timeout(), Event::StopWatchdog { token });

        match self.session.clone() {
            Some(session) => session.shutdown(None),
            None => self.finish_stop(),
        }
    }

    fn pause(&mut self, completion: Callback<()>) {
        if !self.state.is_pausable() {
            debug!("Nothing to pause while {:?}", self.state);
            completion(());
            return;
        }

        if let Err(completion) = self.pause_completion.try_arm(completion) {
            completion(());
            return;
        }

        info!("Pausing tunnel");
        self.should_reconnect = false;
        self.reconnect_token += 1;

        match self.transport.as_ref().map(|t| t.link()) {
            Some(link) => {
                self.set_state(TunnelState::Pausing);
                link.shutdown();
            }
            None => {
                // abandon any in-flight connect
                self.connect_attempt += 1;
                let upgrade = self.pending_upgrade.take();
                self.complete_pause(upgrade);
            }
        }
    }

    fn resume(&mut self) {
        if self.state != TunnelState::Paused {
            debug!("Resume ignored while {:?}", self.state);
            return;
        }

        info!("Resuming tunnel");
        if self.negotiated.is_some() {
            self.set_reasserting(true);
        }
        self.connect_tunnel(None);
    }

    fn detach(&mut self) {
        debug!("Last handle dropped, tearing tunnel down");

        self.should_reconnect = false;
        self.teardown();
        self.set_reasserting(false);
        if !self.state.is_startable() {
            self.set_state(TunnelState::Stopped);
        }

        self.start_completion.complete(Err(TunnelError::Cancelled));
        self.pause_completion.complete(());
        self.stop_completion.complete(());
    }

    // ---- connecting ----

    fn connect_tunnel(&mut self, upgraded: Option<Arc<dyn Transport>>) {
        self.set_state(TunnelState::ConnectingTransport);

        if let Some(link) = upgraded.filter(|t| !t.is_shutdown()) {
            info!("Switching to upgraded link");
            self.attach(link);
            return;
        }

        let Some(candidate) = self.strategy.as_ref().map(|s| s.current().clone()) else {
            self.terminate(Some(TunnelError::InvalidState("no endpoint strategy")));
            return;
        };

        info!("Connecting to {}", candidate);

        self.connect_attempt += 1;
        let attempt = self.connect_attempt;
        let resolver = self.collaborators.resolver.clone();
        let connector = self.collaborators.connector.clone();
        let timeout = self.options().dns_timeout();
        let tx = self.tx.clone();

        tokio::spawn(async move {
            let result = EndpointStrategy::resolve_and_connect(
                &candidate,
                resolver.as_ref(),
                connector.as_ref(),
                timeout,
            )
            .await;

            if let Err(e) = tx.send(Event::Connected { attempt, result }) {
                if let Event::Connected { result: Ok(link), .. } = e.0 {
                    link.shutdown();
                }
            }
        });
    }

    fn on_connected(&mut self, attempt: u64, result: Result<Arc<dyn Transport>, ConnectError>) {
        if attempt != self.connect_attempt || self.state != TunnelState::ConnectingTransport {
            debug!("Discarding stale connect attempt {}", attempt);
            if let Ok(link) = result {
                link.shutdown();
            }
            return;
        }

        match result {
            Ok(link) => self.attach(link),
            Err(e) if e.is_name_resolution() => {
                warn!("DNS resolution failed: {}", e);
                if self.advance_endpoint() {
                    self.connect_tunnel(None);
                }
            }
            Err(e) => {
                error!("Could not connect: {}", e);
                self.terminate(Some(e.into()));
            }
        }
    }

    fn attach(&mut self, link: Arc<dyn Transport>) {
        self.transport_generation += 1;
        let transport = ObservedTransport::new(link, self.transport_generation);
        debug!("Observing {} link (generation {})", transport.kind(), transport.generation());

        transport.observe(self.tx.clone(), self.options().link_activity_timeout());
        self.transport = Some(transport);
    }

    /// Returns false after terminating with `EndpointsExhausted`.
    fn advance_endpoint(&mut self) -> bool {
        let advanced = self.strategy.as_mut().is_some_and(|s| s.advance());
        if !advanced {
            self.should_reconnect = false;
            self.terminate(Some(TunnelError::EndpointsExhausted));
        }
        advanced
    }

    // ---- link events ----

    fn on_transport_event(&mut self, generation: u64, event: TransportEvent) {
        if self.transport.as_ref().map(|t| t.generation()) != Some(generation) {
            debug!("Ignoring {:?} from stale link (generation {})", event, generation);
            return;
        }

        match event {
            TransportEvent::Active => self.on_link_active(),
            TransportEvent::Timeout => self.on_link_timeout(),
            TransportEvent::Shutdown { had_failure } => {
                let transport = self.transport.take();
                if let Some(ref transport) = transport {
                    transport.dispose();
                }
                self.on_link_down(transport, had_failure);
            }
            TransportEvent::BetterPath { viable } => self.on_better_path(viable),
        }
    }

    fn on_link_active(&mut self) {
        if self.state != TunnelState::ConnectingTransport {
            return;
        }
        let (Some(session), Some(transport)) = (self.session.clone(), self.transport.as_ref())
        else {
            return;
        };
        let link = transport.link();

        if self.negotiated.is_some() && session.can_rebind_link() {
            info!("Link active, rebinding session");
            session.rebind_link(link);
            self.set_reasserting(false);
            self.set_state(TunnelState::Active);
        } else {
            info!("Link active, starting session");
            session.set_link(link);
            self.set_state(TunnelState::AwaitingSessionStart);
        }
    }

    fn on_link_timeout(&mut self) {
        let Some(transport) = self.transport.as_ref() else {
            return;
        };
        warn!("Link timed out waiting for activity");

        self.should_reconnect = true;
        let kind = transport.kind();
        transport.shutdown();

        if kind.supports_endpoint_fallback() {
            self.advance_endpoint();
        }
    }

    fn on_better_path(&mut self, viable: bool) {
        if self.state != TunnelState::Active {
            return;
        }
        let Some(config) = self.config.as_ref() else {
            return;
        };

        if !config.capabilities.path_monitoring {
            debug!("Path monitoring unavailable, ignoring better path");
            return;
        }
        if !config.options.better_path_policy.should_renegotiate(viable) {
            info!("Better path is not viable, keeping current link");
            return;
        }

        info!("Better path available, renegotiating");
        if let Some(session) = &self.session {
            session.reconnect(TunnelError::NetworkChanged);
        }
    }

    fn on_link_down(&mut self, transport: Option<ObservedTransport>, had_failure: bool) {
        if self.state == TunnelState::Stopping {
            self.finish_stop();
            return;
        }
        if self.state == TunnelState::Stopped {
            return;
        }

        let error = policy::shutdown_error(self.session_stop_error.take(), had_failure);
        let upgrade = if policy::allows_upgrade(error.as_ref()) {
            transport.and_then(|t| t.upgrade())
        } else {
            None
        };

        let recovery = policy::classify(&LinkDown {
            error: error.as_ref(),
            pause_pending: self.pause_completion.is_pending(),
            should_reconnect: self.should_reconnect,
            has_auth_hook: self.collaborators.auth_failure_hook.is_some(),
        });
        debug!("Link down ({:?}), recovery: {:?}", error, recovery);

        match recovery {
            Recovery::CompletePause => self.complete_pause(upgrade),
            Recovery::FallbackAndReconnect => {
                if let Some(upgrade) = upgrade {
                    upgrade.shutdown();
                }
                if self.advance_endpoint() {
                    self.should_reconnect = true;
                    self.schedule_reconnect(None);
                }
            }
            Recovery::Reconnect => self.schedule_reconnect(upgrade),
            Recovery::HandOffToHook => {
                if let Some(upgrade) = upgrade {
                    upgrade.shutdown();
                }
                self.hand_off_to_hook(error.unwrap_or(TunnelError::SocketActivity));
            }
            Recovery::Terminate => {
                if let Some(upgrade) = upgrade {
                    upgrade.shutdown();
                }
                self.terminate(error);
            }
        }
    }

    fn schedule_reconnect(&mut self, upgrade: Option<Arc<dyn Transport>>) {
        let delay = self.options().reconnection_delay();
        info!("Reconnecting in {:?}", delay);

        self.set_state(TunnelState::Reasserting);
        self.set_reasserting(true);

        let keep_session = self.negotiated.is_some()
            && self.session.as_ref().is_some_and(|s| s.can_rebind_link());
        if !keep_session {
            if let Some(session) = &self.session {
                session.cleanup();
            }
            self.negotiated = None;
        }

        if let Some(previous) = std::mem::replace(&mut self.pending_upgrade, upgrade) {
            previous.shutdown();
        }

        self.reconnect_token += 1;
        let token = self.reconnect_token;
        self.schedule(delay, Event::ReconnectTimer { token });
    }

    fn on_reconnect_timer(&mut self, token: u64) {
        if token != self.reconnect_token {
            return;
        }
        let upgrade = self.pending_upgrade.take();

        // stale timer: reconnection was abandoned while waiting
        if !self.should_reconnect || self.state != TunnelState::Reasserting {
            debug!("Reconnection no longer wanted ({:?})", self.state);
            if let Some(upgrade) = upgrade {
                upgrade.shutdown();
            }
            if self.state == TunnelState::Reasserting {
                let error = self.last_error.clone();
                self.terminate(error);
            }
            return;
        }

        self.should_reconnect = false;
        self.connect_tunnel(upgrade);
    }

    fn complete_pause(&mut self, upgrade: Option<Arc<dyn Transport>>) {
        if let Some(upgrade) = upgrade {
            upgrade.shutdown();
        }
        if let Some(transport) = self.transport.take() {
            transport.dispose();
        }

        let keep_session = self.negotiated.is_some()
            && self.session.as_ref().is_some_and(|s| s.can_rebind_link());
        if !keep_session {
            if let Some(session) = &self.session {
                session.cleanup();
            }
            self.negotiated = None;
        }

        self.set_reasserting(false);
        self.set_state(TunnelState::Paused);
        info!("Tunnel paused");
        self.pause_completion.complete(());
    }

    fn hand_off_to_hook(&mut self, error: TunnelError) {
        warn!("Authentication failed, handing off to recovery hook");

        self.should_reconnect = false;
        self.teardown();
        self.set_reasserting(false);
        self.set_state(TunnelState::Idle);
        self.last_error = Some(error.clone());
        self.start_completion.complete(Err(error.clone()));

        if let Some(hook) = self.collaborators.auth_failure_hook.clone() {
            hook(error);
        }
    }

    // ---- session events ----

    fn on_session_event(&mut self, generation: u64, event: SessionEvent) {
        if generation != self.session_generation || self.session.is_none() {
            debug!("Ignoring event from stale session (generation {})", generation);
            return;
        }

        match event {
            SessionEvent::Started {
                remote_address,
                negotiated,
            } => self.on_session_started(remote_address, negotiated),
            SessionEvent::Stopped {
                error,
                should_reconnect,
            } => self.on_session_stopped(error, should_reconnect),
        }
    }

    fn on_session_started(&mut self, remote_address: Option<IpAddr>, negotiated: SessionConfig) {
        if self.state != TunnelState::AwaitingSessionStart {
            debug!("Session started while {:?}, ignoring", self.state);
            return;
        }

        info!("Session started");
        negotiated.log("Negotiated");

        let settings = match self.derive_settings(remote_address, &negotiated) {
            Ok(settings) => settings,
            Err(e) => {
                error!("Could not derive network settings: {}", e);
                self.terminate(Some(e));
                return;
            }
        };
        self.negotiated = Some(negotiated);

        self.apply_epoch += 1;
        let epoch = self.apply_epoch;
        let host = self.collaborators.host.clone();
        let tx = self.tx.clone();

        tokio::spawn(async move {
            let result = host.apply(settings).await;
            if tx.send(Event::SettingsApplied { epoch, result }).is_err() {
                debug!("Tunnel queue closed before settings were applied");
            }
        });
    }

    fn derive_settings(
        &self,
        remote_address: Option<IpAddr>,
        negotiated: &SessionConfig,
    ) -> Result<NetworkSettings, TunnelError> {
        let config = self
            .config
            .as_ref()
            .ok_or(TunnelError::InvalidState("no configuration"))?;

        let input = SettingsInput {
            local: &config.session,
            negotiated,
            remote_address,
            capabilities: config.capabilities,
        };
        derive_network_settings(&input, self.collaborators.route_table.as_deref())
    }

    fn on_settings_applied(&mut self, epoch: u64, result: Result<(), TunnelError>) {
        if epoch != self.apply_epoch || self.state != TunnelState::AwaitingSessionStart {
            return;
        }

        match result {
            Ok(()) => {
                info!("Tunnel is up");
                self.set_reasserting(false);
                self.set_state(TunnelState::Active);

                if self.start_completion.complete(Ok(())) {
                    if let Some(negotiated) = &self.negotiated {
                        self.collaborators.observer.on_did_start(negotiated);
                    }
                }
            }
            Err(e) => {
                error!("Host rejected network settings: {}", e);
                self.terminate(Some(e));
            }
        }
    }

    fn on_session_stopped(&mut self, error: Option<TunnelError>, should_reconnect: bool) {
        match &error {
            Some(e) => warn!("Session stopped with error: {}", e),
            None => info!("Session stopped"),
        }

        self.negotiated = None;

        // the link is already down and recovery already chosen
        if self.transport.is_none()
            && matches!(self.state, TunnelState::Reasserting | TunnelState::Paused)
        {
            debug!("Session stopped while {:?} without a link, ignoring", self.state);
            return;
        }

        self.should_reconnect = should_reconnect
            && !matches!(
                self.state,
                TunnelState::Stopping | TunnelState::Pausing | TunnelState::Paused
            );
        self.session_stop_error = error;

        match &self.transport {
            Some(transport) => transport.shutdown(),
            None => self.on_link_down(None, false),
        }
    }

    // ---- stopping ----

    fn on_stop_watchdog(&mut self, token: u64) {
        if token != self.stop_token || !self.stop_completion.is_pending() {
            return;
        }
        warn!("Session did not stop within {:?}, forcing", self.options().shutdown_timeout());
        self.finish_stop();
    }

    fn finish_stop(&mut self) {
        self.stop_token += 1;
        self.teardown();
        self.set_reasserting(false);
        self.set_state(TunnelState::Stopped);
        info!("Tunnel stopped");

        self.start_completion.complete(Err(TunnelError::Cancelled));
        self.stop_completion.complete(());
        self.collaborators.observer.on_did_stop(None);
    }

    fn terminate(&mut self, error: Option<TunnelError>) {
        match self.state {
            TunnelState::Stopped => return,
            TunnelState::Stopping => {
                self.finish_stop();
                return;
            }
            _ => {}
        }

        match &error {
            Some(e) => error!("Tunnel terminated: {}", e),
            None => info!("Tunnel terminated"),
        }

        self.should_reconnect = false;
        self.teardown();
        self.set_reasserting(false);
        self.set_state(TunnelState::Stopped);
        self.last_error = error.clone();
        self.pause_completion.complete(());

        if self.start_completion.is_pending() {
            // an unresolved start reads as success to the host
            let reported = error.clone().unwrap_or(TunnelError::SocketActivity);
            self.start_completion.complete(Err(reported));
        } else {
            self.collaborators.host.cancel(error.clone());
        }

        self.collaborators.observer.on_did_stop(error.as_ref());
    }

    /// Release the link and the session, invalidating their pending events
    fn teardown(&mut self) {
        self.connect_attempt += 1;
        self.reconnect_token += 1;
        self.apply_epoch += 1;

        if let Some(transport) = self.transport.take() {
            transport.dispose();
        }
        if let Some(upgrade) = self.pending_upgrade.take() {
            upgrade.shutdown();
        }
        if let Some(session) = self.session.take() {
            session.cleanup();
        }
        self.session_generation += 1;
        self.negotiated = None;
        self.session_stop_error = None;
    }

    // ---- helpers ----

    fn options(&self) -> ControllerOptions {
        self.config.as_ref().map(|c| c.options).unwrap_or_default()
    }

    fn schedule(&self, delay: Duration, event: Event) {
        let tx = self.tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(event);
        });
    }

    fn set_state(&mut self, state: TunnelState) {
        if self.state == state {
            return;
        }
        debug!("State: {:?} -> {:?}", self.state, state);
        self.state = state;
        self.publish();
    }

    fn set_reasserting(&mut self, reasserting: bool) {
        if self.reasserting == reasserting {
            return;
        }
        self.reasserting = reasserting;
        self.collaborators.host.set_reasserting(reasserting);
        self.publish();
    }

    fn publish(&self) {
        self.status.send_replace(TunnelStatus {
            state: self.state,
            reasserting: self.reasserting,
        });
    }
}
