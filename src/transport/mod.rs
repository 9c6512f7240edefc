//! Socket-like transports the connection strategies pick from.
//!
//! A [`TransportFactory`] checks the environment and creates connections; every
//! [`Transport`] reports its lifecycle through a [`TransportEvents`] receiver:
//!
//! ```text
//! new -> initializing -> initialized -> connecting -> open -> closed
//! ```
//!
//! Factories are looked up by name in a [`TransportRegistry`], which is how a strategy
//! scheme refers to them (`{"type": "transport", "transport": "ws"}`).

pub mod error;
#[cfg(feature = "sockjs")]
pub mod sockjs;
#[cfg(test)]
pub(crate) mod testing;
#[cfg(feature = "ws")]
pub mod ws;

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use serde::Deserialize;
use strum_macros::Display;
use tokio::sync::mpsc;
use url::Url;

pub use self::error::TransportError;
use crate::Result;
use crate::error::Error;

/// Receiving end of a transport's lifecycle and message events.
pub type TransportEvents = mpsc::UnboundedReceiver<TransportEvent>;

#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum TransportState {
    New,
    Initializing,
    Initialized,
    Connecting,
    Open,
    Closed,
}

/// Close frame received from the remote end.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseInfo {
    pub code: u16,
    pub reason: String,
}

impl CloseInfo {
    #[must_use]
    pub fn new<S: Into<String>>(code: u16, reason: S) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }
}

#[non_exhaustive]
#[derive(Debug)]
pub enum TransportEvent {
    Initialized,
    Open,
    Message(String),
    Error(Error),
    /// The socket is gone. Carries the close frame when the remote sent one.
    Closed(Option<CloseInfo>),
}

/// A single socket-like connection.
///
/// Methods never block: `connect` and `close` start work whose outcome is reported as
/// [`TransportEvent`]s.
pub trait Transport: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn state(&self) -> TransportState;

    /// Whether the transport keeps itself alive, making protocol-level pings unnecessary.
    fn supports_ping(&self) -> bool;

    /// Move from `new` to `initialized`, emitting [`TransportEvent::Initialized`].
    fn initialize(&self);

    /// Open the socket. Returns `false` when a socket already exists or the transport is
    /// not `initialized`.
    fn connect(&self) -> bool;

    /// Queue `data` for sending. Only succeeds while `open`.
    fn send(&self, data: &str) -> bool;

    /// Close the socket. Returns `true` if there was a socket to close.
    fn close(&self) -> bool;
}

/// Creates [`Transport`]s of one kind.
pub trait TransportFactory: Send + Sync + 'static {
    /// Capability check.
    fn is_supported(&self, environment: &Environment) -> bool;

    fn create_connection(&self, options: &TransportOptions)
    -> (Arc<dyn Transport>, TransportEvents);
}

/// Feature flags the capability checks are evaluated against.
#[non_exhaustive]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Environment {
    pub disabled_transports: Vec<String>,
}

impl Environment {
    #[must_use]
    pub fn is_disabled(&self, transport: &str) -> bool {
        self.disabled_transports.iter().any(|name| name == transport)
    }
}

/// Options a transport leaf receives after inheritance from its ancestors in the scheme.
#[non_exhaustive]
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportOptions {
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub encrypted: bool,
    #[serde(default)]
    pub encrypted_port: Option<u16>,
    #[serde(default)]
    pub unencrypted_port: Option<u16>,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub disabled_transports: Vec<String>,
}

impl TransportOptions {
    #[must_use]
    pub fn port(&self) -> Option<u16> {
        if self.encrypted {
            self.encrypted_port
        } else {
            self.unencrypted_port
        }
    }

    #[must_use]
    pub fn environment(&self) -> Environment {
        Environment {
            disabled_transports: self.disabled_transports.clone(),
        }
    }
}

/// Base URL for `options`, choosing `secure` or `plain` as the scheme.
pub(crate) fn endpoint(
    plain: &str,
    secure: &str,
    options: &TransportOptions,
    path: &str,
) -> Result<Url> {
    let host = options
        .host
        .as_deref()
        .ok_or_else(|| Error::validation("transport options are missing a host"))?;
    let scheme = if options.encrypted { secure } else { plain };

    let mut url = Url::parse(&format!("{scheme}://{host}"))?;
    url.set_port(options.port())
        .map_err(|()| Error::validation(format!("{host} cannot carry a port")))?;
    url.set_path(path);

    Ok(url)
}

/// Lifecycle state shared between a transport handle and its socket task.
#[derive(Debug)]
pub(crate) struct StateCell(Mutex<TransportState>);

impl StateCell {
    pub(crate) fn new() -> Self {
        Self(Mutex::new(TransportState::New))
    }

    pub(crate) fn get(&self) -> TransportState {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn set(&self, state: TransportState) {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    /// Compare-and-set. Returns `false` (leaving the state alone) unless it was `from`.
    pub(crate) fn transition(&self, from: TransportState, to: TransportState) -> bool {
        let mut state = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        if *state != from {
            return false;
        }
        *state = to;
        true
    }
}

/// Name to factory lookup used by the strategy builder.
#[derive(Clone)]
pub struct TransportRegistry {
    factories: HashMap<String, Arc<dyn TransportFactory>>,
}

impl TransportRegistry {
    /// Registry without any transport.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Register `factory` under `name`, replacing any previous registration.
    #[must_use]
    pub fn with<F: TransportFactory>(mut self, name: &str, factory: F) -> Self {
        self.register(name, Arc::new(factory));
        self
    }

    pub fn register(&mut self, name: &str, factory: Arc<dyn TransportFactory>) {
        self.factories.insert(name.to_owned(), factory);
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn TransportFactory>> {
        self.factories.get(name).map(Arc::clone)
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }
}

impl Default for TransportRegistry {
    /// Registry with every transport compiled into the crate.
    fn default() -> Self {
        #[cfg_attr(
            not(any(feature = "ws", feature = "sockjs")),
            expect(unused_mut, reason = "No transport feature is enabled")
        )]
        let mut registry = Self::empty();
        #[cfg(feature = "ws")]
        registry.register(ws::NAME, Arc::new(ws::WsFactory));
        #[cfg(feature = "sockjs")]
        registry.register(sockjs::NAME, Arc::new(sockjs::SockJsFactory::default()));
        registry
    }
}

impl fmt::Debug for TransportRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&String> = self.factories.keys().collect();
        names.sort();
        f.debug_struct("TransportRegistry")
            .field("transports", &names)
            .finish()
    }
}
