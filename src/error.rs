use std::backtrace::Backtrace;
use std::error::Error as StdError;
use std::fmt;

/// HTTP status code type, re-exported for use with error inspection.
pub use reqwest::StatusCode;
use reqwest::header;

#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    /// Invalid input or state within the client
    Validation,
    /// Strategy scheme or client configuration that can never work
    Configuration,
    /// Error raised by a transport (socket failure, close, timeout)
    Transport,
    /// Malformed frame received from the service
    Protocol,
    /// Structured error frame sent by the service
    Service,
    /// Channel authorization callout failed
    Authorization,
    /// Internal error from dependencies
    Internal,
}

#[derive(Debug)]
pub struct Error {
    kind: Kind,
    source: Option<Box<dyn StdError + Send + Sync + 'static>>,
    backtrace: Backtrace,
}

impl Error {
    pub fn with_source<S: StdError + Send + Sync + 'static>(kind: Kind, source: S) -> Self {
        Self {
            kind,
            source: Some(Box::new(source)),
            backtrace: Backtrace::capture(),
        }
    }

    pub fn kind(&self) -> Kind {
        self.kind
    }

    pub fn backtrace(&self) -> &Backtrace {
        &self.backtrace
    }

    pub fn inner(&self) -> Option<&(dyn StdError + Send + Sync + 'static)> {
        self.source.as_deref()
    }

    pub fn downcast_ref<E: StdError + 'static>(&self) -> Option<&E> {
        let e = self.source.as_deref()?;
        e.downcast_ref::<E>()
    }

    pub fn validation<S: Into<String>>(message: S) -> Self {
        Validation {
            reason: message.into(),
        }
        .into()
    }

    pub fn authorization<S: Into<String>>(status: Option<StatusCode>, message: S) -> Self {
        AuthorizationError {
            status,
            message: message.into(),
        }
        .into()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.source {
            Some(src) => write!(f, "{:?}: {}", self.kind, src),
            None => write!(f, "{:?}", self.kind),
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_deref()
            .map(|e| e as &(dyn StdError + 'static))
    }
}

#[non_exhaustive]
#[derive(Debug)]
pub struct Validation {
    pub reason: String,
}

impl fmt::Display for Validation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid: {}", self.reason)
    }
}

impl StdError for Validation {}

/// A strategy scheme named a `type` the builder does not know.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct UnsupportedStrategy {
    pub strategy: String,
}

impl fmt::Display for UnsupportedStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unsupported strategy type: {}", self.strategy)
    }
}

impl StdError for UnsupportedStrategy {}

/// A strategy scheme named a transport that is not registered.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct UnsupportedTransport {
    pub transport: String,
}

impl fmt::Display for UnsupportedTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unsupported transport: {}", self.transport)
    }
}

impl StdError for UnsupportedTransport {}

/// Error frame (`pusher:error`) sent by the service.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceError {
    pub code: Option<u16>,
    pub message: Option<String>,
}

impl fmt::Display for ServiceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, &self.message) {
            (Some(code), Some(message)) => write!(f, "service error {code}: {message}"),
            (Some(code), None) => write!(f, "service error {code}"),
            (None, Some(message)) => write!(f, "service error: {message}"),
            (None, None) => write!(f, "service error"),
        }
    }
}

impl StdError for ServiceError {}

/// Frame that could not be decoded as JSON.
#[non_exhaustive]
#[derive(Debug)]
pub struct MessageParseError {
    /// The raw text that failed to parse
    pub data: String,
    source: serde_json::Error,
}

impl MessageParseError {
    pub(crate) fn new(data: String, source: serde_json::Error) -> Self {
        Self { data, source }
    }
}

impl fmt::Display for MessageParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unable to parse frame {:?}: {}", self.data, self.source)
    }
}

impl StdError for MessageParseError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        Some(&self.source)
    }
}

#[non_exhaustive]
#[derive(Debug)]
pub struct AuthorizationError {
    /// HTTP status of the auth endpoint, when the callout reached one
    pub status: Option<StatusCode>,
    pub message: String,
}

impl fmt::Display for AuthorizationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status {
            Some(status) => write!(f, "authorization failed ({status}): {}", self.message),
            None => write!(f, "authorization failed: {}", self.message),
        }
    }
}

impl StdError for AuthorizationError {}

/// A channel stream fell behind and missed events.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lagged {
    pub count: u64,
}

impl fmt::Display for Lagged {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stream lagged, missed {} events", self.count)
    }
}

impl StdError for Lagged {}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::with_source(Kind::Internal, e)
    }
}

impl From<header::InvalidHeaderValue> for Error {
    fn from(e: header::InvalidHeaderValue) -> Self {
        Error::with_source(Kind::Internal, e)
    }
}

impl From<header::InvalidHeaderName> for Error {
    fn from(e: header::InvalidHeaderName) -> Self {
        Error::with_source(Kind::Internal, e)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::with_source(Kind::Internal, e)
    }
}

impl From<url::ParseError> for Error {
    fn from(e: url::ParseError) -> Self {
        Error::with_source(Kind::Internal, e)
    }
}

impl From<Validation> for Error {
    fn from(err: Validation) -> Self {
        Error::with_source(Kind::Validation, err)
    }
}

impl From<UnsupportedStrategy> for Error {
    fn from(err: UnsupportedStrategy) -> Self {
        Error::with_source(Kind::Configuration, err)
    }
}

impl From<UnsupportedTransport> for Error {
    fn from(err: UnsupportedTransport) -> Self {
        Error::with_source(Kind::Configuration, err)
    }
}

impl From<ServiceError> for Error {
    fn from(err: ServiceError) -> Self {
        Error::with_source(Kind::Service, err)
    }
}

impl From<MessageParseError> for Error {
    fn from(err: MessageParseError) -> Self {
        Error::with_source(Kind::Protocol, err)
    }
}

impl From<Lagged> for Error {
    fn from(err: Lagged) -> Self {
        Error::with_source(Kind::Internal, err)
    }
}

impl From<AuthorizationError> for Error {
    fn from(err: AuthorizationError) -> Self {
        Error::with_source(Kind::Authorization, err)
    }
}
