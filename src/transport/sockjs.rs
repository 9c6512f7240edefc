//! HTTP long-polling fallback speaking the SockJS `xhr` protocol.
//!
//! A session is `{base}/{server}/{session}`: `POST .../xhr` long-polls for frames and
//! `POST .../xhr_send` delivers a JSON array of outgoing messages. Frames are `o`
//! (open), `h` (heartbeat), `a[...]` (messages) and `c[code,reason]` (close). The
//! server keeps the session alive with heartbeats, so no protocol pings are needed.

use std::sync::{Arc, Mutex, PoisonError};

use rand::Rng as _;
use rand::distr::Alphanumeric;
use reqwest::header::CONTENT_TYPE;
use serde_json::json;
use tokio::sync::mpsc;
use url::Url;

use super::{
    CloseInfo, Environment, StateCell, Transport, TransportError, TransportEvent,
    TransportEvents, TransportFactory, TransportOptions, TransportState,
};
use crate::Result;

/// Registry name of this transport.
pub const NAME: &str = "sockjs";

/// Path prefix of the SockJS endpoint when the scheme does not set one.
pub const DEFAULT_PATH: &str = "/pusher";

/// Creates [`SockJsTransport`]s sharing one HTTP client.
#[non_exhaustive]
#[derive(Debug, Clone, Default)]
pub struct SockJsFactory {
    client: reqwest::Client,
}

impl SockJsFactory {
    #[must_use]
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl TransportFactory for SockJsFactory {
    fn is_supported(&self, _environment: &Environment) -> bool {
        true
    }

    fn create_connection(
        &self,
        options: &TransportOptions,
    ) -> (Arc<dyn Transport>, TransportEvents) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let transport = SockJsTransport {
            client: self.client.clone(),
            base: url(options),
            app_path: format!("/app/{}", options.key),
            state: Arc::new(StateCell::new()),
            events: events_tx,
            session: Mutex::new(None),
        };

        (Arc::new(transport), events_rx)
    }
}

/// `http[s]://host:port/pusher`
pub fn url(options: &TransportOptions) -> Result<Url> {
    let path = options.path.as_deref().unwrap_or(DEFAULT_PATH);
    super::endpoint("http", "https", options, path)
}

/// One decoded SockJS frame.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Open,
    Heartbeat,
    Messages(Vec<String>),
    Close(CloseInfo),
}

impl Frame {
    /// Decode every frame in a polling response body (one frame per line).
    pub fn parse_body(body: &str) -> Result<Vec<Frame>> {
        body.lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(Self::parse)
            .collect()
    }

    pub fn parse(line: &str) -> Result<Frame> {
        let invalid = |e: serde_json::Error| TransportError::InvalidFrame(format!("{line}: {e}"));

        if line == "o" {
            Ok(Frame::Open)
        } else if line == "h" {
            Ok(Frame::Heartbeat)
        } else if let Some(payload) = line.strip_prefix('a') {
            let messages: Vec<String> = serde_json::from_str(payload).map_err(invalid)?;
            Ok(Frame::Messages(messages))
        } else if let Some(payload) = line.strip_prefix('c') {
            let (code, reason): (u16, String) = serde_json::from_str(payload).map_err(invalid)?;
            Ok(Frame::Close(CloseInfo::new(code, reason)))
        } else {
            Err(TransportError::InvalidFrame(line.to_owned()).into())
        }
    }
}

#[derive(Debug)]
enum Outgoing {
    Text(String),
    Close,
}

/// Long-polling connection. Polling and sending run in a background task.
#[derive(Debug)]
pub struct SockJsTransport {
    client: reqwest::Client,
    base: Result<Url>,
    app_path: String,
    state: Arc<StateCell>,
    events: mpsc::UnboundedSender<TransportEvent>,
    session: Mutex<Option<mpsc::UnboundedSender<Outgoing>>>,
}

impl Transport for SockJsTransport {
    fn name(&self) -> &str {
        NAME
    }

    fn state(&self) -> TransportState {
        self.state.get()
    }

    fn supports_ping(&self) -> bool {
        true
    }

    fn initialize(&self) {
        if self
            .state
            .transition(TransportState::New, TransportState::Initializing)
        {
            self.state.set(TransportState::Initialized);
            _ = self.events.send(TransportEvent::Initialized);
        }
    }

    fn connect(&self) -> bool {
        let mut session = self.session.lock().unwrap_or_else(PoisonError::into_inner);
        if session.is_some()
            || !self
                .state
                .transition(TransportState::Initialized, TransportState::Connecting)
        {
            return false;
        }

        let endpoints = match &self.base {
            Ok(base) => Endpoints::new(base),
            Err(e) => Err(crate::error::Error::validation(format!(
                "invalid SockJS endpoint: {e}"
            ))),
        };
        let endpoints = match endpoints {
            Ok(endpoints) => endpoints,
            Err(error) => {
                self.state.set(TransportState::Closed);
                _ = self.events.send(TransportEvent::Error(error));
                _ = self.events.send(TransportEvent::Closed(None));
                return false;
            }
        };

        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        *session = Some(outgoing_tx);

        tokio::spawn(run_session(
            self.client.clone(),
            endpoints,
            self.app_path.clone(),
            Arc::clone(&self.state),
            self.events.clone(),
            outgoing_rx,
        ));

        true
    }

    fn send(&self, data: &str) -> bool {
        if self.state.get() != TransportState::Open {
            return false;
        }

        self.session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|session| session.send(Outgoing::Text(data.to_owned())).is_ok())
    }

    fn close(&self) -> bool {
        self.session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|session| session.send(Outgoing::Close).is_ok())
    }
}

/// Polling and sending URLs of one session.
#[derive(Debug)]
struct Endpoints {
    poll: Url,
    send: Url,
}

impl Endpoints {
    fn new(base: &Url) -> Result<Self> {
        let mut rng = rand::rng();
        let server = rng.random_range(0..1000_u16);
        let session: String = (&mut rng)
            .sample_iter(&Alphanumeric)
            .take(8)
            .map(char::from)
            .collect();
        let prefix = format!("{}/{server:03}/{session}", base.as_str().trim_end_matches('/'));

        Ok(Self {
            poll: Url::parse(&format!("{prefix}/xhr"))?,
            send: Url::parse(&format!("{prefix}/xhr_send"))?,
        })
    }
}

async fn poll(client: &reqwest::Client, url: &Url) -> std::result::Result<String, TransportError> {
    client
        .post(url.clone())
        .send()
        .await
        .and_then(reqwest::Response::error_for_status)
        .map_err(TransportError::Http)?
        .text()
        .await
        .map_err(TransportError::Http)
}

async fn deliver(
    client: &reqwest::Client,
    url: &Url,
    messages: &[&str],
) -> std::result::Result<(), TransportError> {
    let body = json!(messages).to_string();
    let response = client
        .post(url.clone())
        .header(CONTENT_TYPE, "text/plain")
        .body(body)
        .send()
        .await
        .map_err(TransportError::Http)?;

    if response.status().is_success() {
        Ok(())
    } else {
        Err(TransportError::Status(response.status()))
    }
}

async fn run_session(
    client: reqwest::Client,
    endpoints: Endpoints,
    app_path: String,
    state: Arc<StateCell>,
    events: mpsc::UnboundedSender<TransportEvent>,
    mut outgoing: mpsc::UnboundedReceiver<Outgoing>,
) {
    #[cfg(feature = "tracing")]
    tracing::debug!(url = %endpoints.poll, "Opening SockJS session");

    let mut pending = Box::pin(poll(&client, &endpoints.poll));

    let close = 'session: loop {
        tokio::select! {
            body = &mut pending => {
                let frames = body
                    .map_err(crate::error::Error::from)
                    .and_then(|body| Frame::parse_body(&body));
                let frames = match frames {
                    Ok(frames) => frames,
                    Err(error) => {
                        _ = events.send(TransportEvent::Error(error));
                        break None;
                    }
                };

                for frame in frames {
                    match frame {
                        Frame::Open => {
                            let path = json!({ "path": app_path }).to_string();
                            if let Err(e) = deliver(&client, &endpoints.send, &[&path]).await {
                                _ = events.send(TransportEvent::Error(e.into()));
                                break 'session None;
                            }
                            state.set(TransportState::Open);
                            _ = events.send(TransportEvent::Open);
                        }
                        Frame::Heartbeat => {}
                        Frame::Messages(messages) => {
                            for message in messages {
                                _ = events.send(TransportEvent::Message(message));
                            }
                        }
                        Frame::Close(info) => break 'session Some(info),
                    }
                }

                pending.set(poll(&client, &endpoints.poll));
            }

            command = outgoing.recv() => {
                match command {
                    Some(Outgoing::Text(text)) => {
                        if let Err(e) = deliver(&client, &endpoints.send, &[&text]).await {
                            _ = events.send(TransportEvent::Error(e.into()));
                            break None;
                        }
                    }
                    Some(Outgoing::Close) | None => break None,
                }
            }
        }
    };

    state.set(TransportState::Closed);
    _ = events.send(TransportEvent::Closed(close));
}
