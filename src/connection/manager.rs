#![expect(
    clippy::module_name_repetitions,
    reason = "Connection types expose their domain in the name for clarity"
)]

use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use backoff::ExponentialBackoff;
use backoff::backoff::Backoff as _;
use serde_json::{Value, json};
use strum_macros::Display;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

use super::config::Config;
use super::network::Availability;
use super::protocol::{self, Disposition, Frame, PING, PONG, ProtocolEvent, ProtocolWrapper};
use super::timeline::Timeline;
use crate::Result;
use crate::error::Error;
use crate::events::{BindingId, EventDispatcher};
use crate::strategy::{self, Attempt, Runner, Strategy, wait_until};
use crate::transport::{Transport, TransportError, TransportEvent};

/// Emitted on every state transition, before the event named after the new state.
pub const STATE_CHANGE: &str = "state_change";
pub const MESSAGE: &str = "message";
pub const ERROR: &str = "error";

/// Externally observable connection state.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum ConnectionState {
    /// Never connected
    Initialized,
    /// A strategy is running or a transport is waiting for the handshake
    Connecting,
    /// The service sent its connection-established frame
    Connected,
    /// No connection could be made in time, or the network is offline
    Unavailable,
    /// Disconnected on request or after a refusal
    Disconnected,
    /// No strategy can work in this environment
    Failed,
}

impl ConnectionState {
    #[must_use]
    pub const fn is_connected(self) -> bool {
        matches!(self, Self::Connected)
    }
}

#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateChange {
    pub previous: ConnectionState,
    pub current: ConnectionState,
}

/// Payload of the events a [`ConnectionManager`] emits.
#[non_exhaustive]
#[derive(Debug)]
pub enum ConnectionEvent {
    /// Sent as [`STATE_CHANGE`] and as the name of the new state
    StateChange(StateChange),
    /// Sent as [`MESSAGE`] for every frame that is not a connection control frame
    Message(Frame),
    /// Sent as [`ERROR`]
    Error(Error),
}

enum Command {
    Connect,
    Disconnect,
}

struct Shared {
    state: watch::Sender<ConnectionState>,
    dispatcher: EventDispatcher<ConnectionEvent>,
    /// Transport of the established connection
    active: RwLock<Option<Arc<dyn Transport>>>,
    socket_id: RwLock<Option<String>>,
    timeline: Timeline,
}

/// Keeps a connection to the service alive.
///
/// All connection state lives in a background task; this handle only sends it
/// commands and observes it. Clones share the same connection, which is torn down once
/// the last handle is dropped.
///
/// The task picks a transport by running the configured strategy, waits for the
/// service handshake, pings when the connection goes quiet and reconnects according to
/// the close codes the service sends.
#[derive(Clone)]
pub struct ConnectionManager {
    shared: Arc<Shared>,
    commands: mpsc::UnboundedSender<Command>,
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("state", &self.state())
            .field("socket_id", &self.socket_id())
            .finish_non_exhaustive()
    }
}

impl ConnectionManager {
    /// Build the connection strategy and start the connection task, without connecting.
    ///
    /// Must be called from within a tokio runtime. Strategy schemes naming unknown
    /// strategy types or transports are rejected here.
    pub fn new(key: &str, config: Config) -> Result<Self> {
        if key.is_empty() {
            return Err(Error::validation("application key must not be empty"));
        }
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| Error::validation(format!("no tokio runtime available: {e}")))?;

        let strategy = build_strategy(key, &config, config.encrypted)?;
        let (state, _) = watch::channel(ConnectionState::Initialized);
        let shared = Arc::new(Shared {
            state,
            dispatcher: EventDispatcher::new(),
            active: RwLock::new(None),
            socket_id: RwLock::new(None),
            timeline: Timeline::new(config.timeline_limit),
        });
        let (commands, commands_rx) = mpsc::unbounded_channel();

        let engine = Engine {
            key: key.to_owned(),
            encrypted: config.encrypted,
            network: config.network.subscribe(),
            backoff: config.restart.clone().into(),
            activity_timeout: config.activity_timeout,
            config,
            shared: Arc::clone(&shared),
            commands: commands_rx,
            strategy: Arc::new(strategy),
            runner: None,
            protocol: None,
            failed_runs: 0,
            timers: Timers::default(),
        };
        runtime.spawn(engine.run());

        Ok(Self { shared, commands })
    }

    /// Start connecting. Does nothing while connected or already connecting.
    pub fn connect(&self) {
        _ = self.commands.send(Command::Connect);
    }

    /// Close the connection without reconnecting.
    pub fn disconnect(&self) {
        _ = self.commands.send(Command::Disconnect);
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    /// Receiver notified of every state transition.
    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// Identifier the service assigned to the current connection.
    #[must_use]
    pub fn socket_id(&self) -> Option<String> {
        self.shared
            .socket_id
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Send an event over the established connection. Returns `false` when there is
    /// none or the transport refused the frame.
    pub fn send_event(&self, event: &str, data: &Value, channel: Option<&str>) -> bool {
        let active = self
            .shared
            .active
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        active.is_some_and(|transport| {
            protocol::send_event(transport.as_ref(), event, data, channel)
        })
    }

    pub fn bind<F>(&self, event: &str, callback: F) -> BindingId
    where
        F: Fn(&ConnectionEvent) + Send + Sync + 'static,
    {
        self.shared.dispatcher.bind(event, callback)
    }

    pub fn bind_all<F>(&self, callback: F) -> BindingId
    where
        F: Fn(&str, &ConnectionEvent) + Send + Sync + 'static,
    {
        self.shared.dispatcher.bind_all(callback)
    }

    pub fn unbind(&self, id: BindingId) -> bool {
        self.shared.dispatcher.unbind(id)
    }

    #[must_use]
    pub fn timeline(&self) -> &Timeline {
        &self.shared.timeline
    }
}

/// The configured scheme with the connection-wide options set on its root.
fn build_strategy(key: &str, config: &Config, encrypted: bool) -> Result<Strategy> {
    let mut scheme = config
        .strategy
        .clone()
        .unwrap_or_else(|| config.default_scheme());

    if let Some(root) = scheme.as_object_mut() {
        root.insert("key".to_owned(), json!(key));
        root.insert("encrypted".to_owned(), json!(encrypted));
        root.insert(
            "disabledTransports".to_owned(),
            json!(config.disabled_transports),
        );
    }

    strategy::build(&scheme, &config.transports)
}

#[derive(Debug, Default)]
struct Timers {
    /// Report `unavailable` if still connecting
    unavailable: Option<Instant>,
    /// Tear down and connect again
    retry: Option<Instant>,
    /// Run the strategy again after it failed
    restart: Option<Instant>,
    /// Send a ping
    activity: Option<Instant>,
    /// Give up on the pong
    pong: Option<Instant>,
}

enum Wake {
    Command(Option<Command>),
    NetworkChanged(bool),
    Attempt(Option<Attempt>),
    Transport(Option<TransportEvent>),
    Unavailable,
    Retry,
    Restart,
    Activity,
    Pong,
}

/// Owner of all connection state, driven by a single task.
struct Engine {
    key: String,
    config: Config,
    encrypted: bool,
    shared: Arc<Shared>,
    commands: mpsc::UnboundedReceiver<Command>,
    network: watch::Receiver<Availability>,
    strategy: Arc<Strategy>,
    runner: Option<Runner>,
    protocol: Option<ProtocolWrapper>,
    backoff: ExponentialBackoff,
    failed_runs: u32,
    activity_timeout: Duration,
    timers: Timers,
}

async fn next_attempt(runner: Option<&mut Runner>) -> Option<Attempt> {
    match runner {
        Some(runner) => runner.next().await,
        None => std::future::pending().await,
    }
}

async fn next_event(protocol: Option<&mut ProtocolWrapper>) -> Option<TransportEvent> {
    match protocol {
        Some(protocol) => protocol.recv().await,
        None => std::future::pending().await,
    }
}

impl Engine {
    async fn run(mut self) {
        let mut network_open = true;

        loop {
            let wake = tokio::select! {
                command = self.commands.recv() => Wake::Command(command),
                changed = self.network.changed(), if network_open => Wake::NetworkChanged(changed.is_ok()),
                attempt = next_attempt(self.runner.as_mut()) => Wake::Attempt(attempt),
                event = next_event(self.protocol.as_mut()) => Wake::Transport(event),
                () = wait_until(self.timers.unavailable) => Wake::Unavailable,
                () = wait_until(self.timers.retry) => Wake::Retry,
                () = wait_until(self.timers.restart) => Wake::Restart,
                () = wait_until(self.timers.activity) => Wake::Activity,
                () = wait_until(self.timers.pong) => Wake::Pong,
            };

            match wake {
                Wake::Command(None) => {
                    self.disconnect_internally();
                    return;
                }
                Wake::Command(Some(Command::Connect)) => {
                    if self.state() != ConnectionState::Connecting {
                        self.timers.retry = None;
                        self.connect();
                    }
                }
                Wake::Command(Some(Command::Disconnect)) => self.disconnect(),
                Wake::NetworkChanged(false) => network_open = false,
                Wake::NetworkChanged(true) => {
                    let availability = *self.network.borrow_and_update();
                    self.on_network(availability);
                }
                Wake::Attempt(attempt) => self.on_attempt(attempt),
                Wake::Transport(event) => {
                    let events = match self.protocol.as_mut() {
                        Some(protocol) => protocol.handle(event),
                        None => continue,
                    };
                    for event in events {
                        self.on_protocol_event(event);
                    }
                }
                Wake::Unavailable => {
                    self.timers.unavailable = None;
                    self.set_state(ConnectionState::Unavailable);
                }
                Wake::Retry => {
                    self.timers.retry = None;
                    self.disconnect_internally();
                    self.connect();
                }
                Wake::Restart => {
                    self.timers.restart = None;
                    if self.protocol.is_none() && self.runner.is_none() {
                        self.runner = Some(Arc::clone(&self.strategy).connect());
                    }
                }
                Wake::Activity => {
                    self.timers.activity = None;
                    if let Some(protocol) = &self.protocol {
                        protocol::send_event(protocol.transport().as_ref(), PING, &json!({}), None);
                    }
                    self.timers.pong = Some(Instant::now() + self.config.pong_timeout);
                }
                Wake::Pong => {
                    self.timers.pong = None;
                    #[cfg(feature = "tracing")]
                    tracing::debug!("Pong not received in time, closing connection");
                    if let Some(protocol) = &self.protocol {
                        protocol.close();
                    }
                }
            }
        }
    }

    fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    fn set_state(&self, current: ConnectionState) {
        let previous = self.state();
        if previous == current {
            return;
        }
        self.shared.state.send_replace(current);

        #[cfg(feature = "tracing")]
        tracing::debug!(%previous, %current, "Connection state changed");
        self.shared.timeline.info(
            STATE_CHANGE,
            json!({ "previous": previous.to_string(), "current": current.to_string() }),
        );

        let change = ConnectionEvent::StateChange(StateChange { previous, current });
        self.shared.dispatcher.emit(STATE_CHANGE, &change);
        self.shared.dispatcher.emit(&current.to_string(), &change);
    }

    fn should_retry(&self) -> bool {
        matches!(
            self.state(),
            ConnectionState::Connecting | ConnectionState::Connected | ConnectionState::Unavailable
        )
    }

    fn connect(&mut self) {
        if self.protocol.is_some() || self.runner.is_some() {
            return;
        }
        if !self.strategy.is_supported() {
            self.set_state(ConnectionState::Failed);
            return;
        }
        if self.config.network.availability() == Availability::Offline {
            self.set_state(ConnectionState::Unavailable);
            return;
        }

        self.set_state(ConnectionState::Connecting);
        self.timers.unavailable = Some(Instant::now() + self.config.unavailable_timeout);
        self.runner = Some(Arc::clone(&self.strategy).connect());
    }

    fn disconnect(&mut self) {
        self.disconnect_internally();
        self.timers = Timers::default();
        self.set_state(ConnectionState::Disconnected);
    }

    /// Stop connecting and drop the connection, leaving the state alone.
    fn disconnect_internally(&mut self) {
        self.abort_runner();
        self.timers.unavailable = None;
        self.timers.restart = None;
        self.timers.retry = None;
        self.abandon_connection();
    }

    fn abort_runner(&mut self) {
        if let Some(mut runner) = self.runner.take() {
            runner.abort();
            // Transports that opened after the winner are not wanted anymore.
            while let Some(attempt) = runner.try_next() {
                if let Attempt::Connected(open) = attempt {
                    open.transport.close();
                }
            }
        }
    }

    fn abandon_connection(&mut self) {
        self.timers.activity = None;
        self.timers.pong = None;
        *self
            .shared
            .active
            .write()
            .unwrap_or_else(PoisonError::into_inner) = None;
        *self
            .shared
            .socket_id
            .write()
            .unwrap_or_else(PoisonError::into_inner) = None;

        if let Some(protocol) = self.protocol.take() {
            protocol.close();
        }
    }

    fn retry_in(&mut self, delay: Duration) {
        self.timers.retry = Some(Instant::now() + delay);
    }

    fn on_network(&mut self, availability: Availability) {
        #[cfg(feature = "tracing")]
        tracing::debug!(%availability, "Network availability changed");

        match availability {
            Availability::Offline if self.should_retry() => {
                self.disconnect_internally();
                self.timers = Timers::default();
                self.set_state(ConnectionState::Unavailable);
            }
            Availability::Online if self.state() == ConnectionState::Unavailable => self.connect(),
            _ => {}
        }
    }

    fn on_attempt(&mut self, attempt: Option<Attempt>) {
        match attempt {
            Some(Attempt::Connected(open)) => {
                #[cfg(feature = "tracing")]
                tracing::debug!(transport = open.transport.name(), "Transport opened");
                self.shared
                    .timeline
                    .info("transport", json!({ "transport": open.transport.name() }));

                self.abort_runner();
                self.timers.restart = None;
                self.protocol = Some(ProtocolWrapper::new(open));
                // A socket that never completes the handshake is pinged and dropped
                // like an idle one.
                self.reset_activity_check();
            }
            Some(Attempt::Failed(error)) => {
                self.abort_runner();
                self.restart_later(&error);
            }
            None => {
                self.runner = None;
                if self.protocol.is_none() {
                    self.restart_later(&TransportError::Exhausted.into());
                }
            }
        }
    }

    fn restart_later(&mut self, error: &Error) {
        #[cfg(feature = "tracing")]
        tracing::debug!(%error, "Connection strategy failed");
        self.shared
            .timeline
            .error("strategy_failed", json!(error.to_string()));

        self.failed_runs = self.failed_runs.saturating_add(1);
        if self
            .config
            .restart
            .max_attempts
            .is_some_and(|max| self.failed_runs > max)
        {
            self.disconnect_internally();
            self.timers = Timers::default();
            self.set_state(ConnectionState::Failed);
            return;
        }

        let delay = self
            .backoff
            .next_backoff()
            .unwrap_or(self.config.restart.max_delay);
        self.timers.restart = Some(Instant::now() + delay);
    }

    fn reset_activity_check(&mut self) {
        self.timers.pong = None;
        self.timers.activity = self
            .protocol
            .as_ref()
            .filter(|protocol| !protocol.supports_ping())
            .map(|_| Instant::now() + self.activity_timeout);
    }

    fn on_protocol_event(&mut self, event: ProtocolEvent) {
        match event {
            ProtocolEvent::Connected {
                socket_id,
                activity_timeout,
            } => {
                self.timers.unavailable = None;
                self.timers.restart = None;
                self.backoff.reset();
                self.failed_runs = 0;
                self.activity_timeout = activity_timeout.map_or(self.config.activity_timeout, |server| {
                    server.min(self.config.activity_timeout)
                });

                *self
                    .shared
                    .socket_id
                    .write()
                    .unwrap_or_else(PoisonError::into_inner) = Some(socket_id);
                *self
                    .shared
                    .active
                    .write()
                    .unwrap_or_else(PoisonError::into_inner) = self
                    .protocol
                    .as_ref()
                    .map(|protocol| Arc::clone(protocol.transport()));

                self.set_state(ConnectionState::Connected);
                self.reset_activity_check();
            }
            ProtocolEvent::Message(frame) => {
                self.reset_activity_check();
                self.shared
                    .dispatcher
                    .emit(MESSAGE, &ConnectionEvent::Message(frame));
            }
            ProtocolEvent::Ping => {
                self.reset_activity_check();
                if let Some(protocol) = &self.protocol {
                    protocol::send_event(protocol.transport().as_ref(), PONG, &json!({}), None);
                }
            }
            ProtocolEvent::Pong => self.reset_activity_check(),
            ProtocolEvent::Error(error) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(%error, "Connection error");
                self.shared.timeline.error(ERROR, json!(error.to_string()));
                self.shared
                    .dispatcher
                    .emit(ERROR, &ConnectionEvent::Error(error));
            }
            ProtocolEvent::Signal(disposition) => {
                #[cfg(feature = "tracing")]
                tracing::debug!(%disposition, "Service closed the connection");
                self.abandon_connection();
                self.on_disposition(disposition);
            }
            ProtocolEvent::Closed => {
                self.abandon_connection();
                if self.should_retry() {
                    self.retry_in(Duration::ZERO);
                }
            }
        }
    }

    fn on_disposition(&mut self, disposition: Disposition) {
        match disposition {
            Disposition::SslOnly => {
                self.encrypted = true;
                match build_strategy(&self.key, &self.config, true) {
                    Ok(strategy) => {
                        self.strategy = Arc::new(strategy);
                        self.retry_in(Duration::ZERO);
                    }
                    Err(error) => {
                        self.shared
                            .dispatcher
                            .emit(ERROR, &ConnectionEvent::Error(error));
                        self.set_state(ConnectionState::Failed);
                    }
                }
            }
            Disposition::Refused => self.disconnect(),
            Disposition::Backoff => self.retry_in(self.config.backoff_delay),
            Disposition::Retry => self.retry_in(Duration::ZERO),
        }
    }
}
