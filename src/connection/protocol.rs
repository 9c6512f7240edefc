//! Pusher framing on top of a raw transport.
//!
//! Every text frame is a JSON object `{"event": .., "data": .., "channel": ..}`. The
//! service often sends `data` as a string holding JSON; [`Frame::parse`] decodes it one
//! level further and keeps the string when it is not JSON.

use std::sync::Arc;
use std::time::Duration;

use phf::phf_map;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum_macros::Display;

use crate::Result;
use crate::error::{Error, MessageParseError, ServiceError};
use crate::strategy::OpenTransport;
use crate::transport::{CloseInfo, Transport, TransportEvent, TransportEvents};

pub const CONNECTION_ESTABLISHED: &str = "pusher:connection_established";
pub const ERROR: &str = "pusher:error";
pub const PING: &str = "pusher:ping";
pub const PONG: &str = "pusher:pong";

/// A decoded protocol frame.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub event: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
}

impl Frame {
    #[must_use]
    pub fn new<S: Into<String>>(event: S, data: Value, channel: Option<String>) -> Self {
        Self {
            event: event.into(),
            data,
            channel,
        }
    }

    /// Decode a text frame, unwrapping string-encoded `data`.
    pub fn parse(text: &str) -> Result<Self> {
        let mut frame: Self = serde_json::from_str(text)
            .map_err(|e| MessageParseError::new(text.to_owned(), e))?;

        if let Value::String(inner) = &frame.data
            && let Ok(decoded) = serde_json::from_str(inner)
        {
            frame.data = decoded;
        }

        Ok(frame)
    }

    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// What the connection manager should do after the service refused or closed a
/// connection with a close code.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum Disposition {
    /// Reconnect immediately using TLS
    SslOnly,
    /// Do not reconnect
    Refused,
    /// Reconnect after the configured backoff delay
    Backoff,
    /// Reconnect immediately
    Retry,
}

impl Disposition {
    /// Interpret a service close code. Unknown or missing codes refuse.
    #[must_use]
    pub fn from_code(code: Option<u16>) -> Self {
        match code {
            Some(4000) => Self::SslOnly,
            Some(4001..4100) => Self::Refused,
            Some(4100..4200) => Self::Backoff,
            Some(4200..4300) => Self::Retry,
            _ => Self::Refused,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Control {
    ConnectionEstablished,
    Error,
    Ping,
    Pong,
}

static CONTROL_EVENTS: phf::Map<&'static str, Control> = phf_map! {
    "pusher:connection_established" => Control::ConnectionEstablished,
    "pusher:error" => Control::Error,
    "pusher:ping" => Control::Ping,
    "pusher:pong" => Control::Pong,
};

#[derive(Debug, Deserialize)]
struct Established {
    socket_id: String,
    /// Seconds
    activity_timeout: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct ErrorData {
    code: Option<u16>,
    message: Option<String>,
}

impl From<ErrorData> for ServiceError {
    fn from(data: ErrorData) -> Self {
        Self {
            code: data.code,
            message: data.message,
        }
    }
}

/// Events the wrapper derives from its transport.
#[derive(Debug)]
pub(crate) enum ProtocolEvent {
    Connected {
        socket_id: String,
        activity_timeout: Option<Duration>,
    },
    Message(Frame),
    Ping,
    Pong,
    Error(Error),
    /// The service refused or ended the connection; the transport is being closed.
    Signal(Disposition),
    Closed,
}

/// Handshake-aware wrapper around one open transport.
pub(crate) struct ProtocolWrapper {
    transport: Arc<dyn Transport>,
    events: TransportEvents,
    socket_id: Option<String>,
}

impl ProtocolWrapper {
    pub(crate) fn new(open: OpenTransport) -> Self {
        let OpenTransport { transport, events } = open;
        Self {
            transport,
            events,
            socket_id: None,
        }
    }

    pub(crate) fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub(crate) fn supports_ping(&self) -> bool {
        self.transport.supports_ping()
    }

    pub(crate) fn close(&self) {
        self.transport.close();
    }

    pub(crate) async fn recv(&mut self) -> Option<TransportEvent> {
        self.events.recv().await
    }

    /// Translate one transport event. `None` stands for the event stream ending.
    pub(crate) fn handle(&mut self, event: Option<TransportEvent>) -> Vec<ProtocolEvent> {
        match event {
            Some(TransportEvent::Message(text)) => match Frame::parse(&text) {
                Ok(frame) if self.socket_id.is_some() => self.on_frame(frame),
                Ok(frame) => self.on_handshake_frame(frame),
                Err(e) => {
                    #[cfg(feature = "tracing")]
                    tracing::warn!(error = %e, "Dropping malformed frame");
                    vec![ProtocolEvent::Error(e)]
                }
            },
            Some(TransportEvent::Error(e)) => vec![ProtocolEvent::Error(e)],
            Some(TransportEvent::Closed(close)) => on_close(close),
            None => vec![ProtocolEvent::Closed],
            Some(TransportEvent::Initialized | TransportEvent::Open) => Vec::new(),
        }
    }

    fn on_handshake_frame(&mut self, frame: Frame) -> Vec<ProtocolEvent> {
        match CONTROL_EVENTS.get(frame.event.as_str()).copied() {
            Some(Control::ConnectionEstablished) => {
                match serde_json::from_value::<Established>(frame.data) {
                    Ok(established) => {
                        self.socket_id = Some(established.socket_id.clone());
                        vec![ProtocolEvent::Connected {
                            socket_id: established.socket_id,
                            activity_timeout: established
                                .activity_timeout
                                .map(Duration::from_secs),
                        }]
                    }
                    Err(e) => vec![ProtocolEvent::Error(e.into())],
                }
            }
            Some(Control::Error) => {
                let error: ServiceError = serde_json::from_value::<ErrorData>(frame.data)
                    .unwrap_or_default()
                    .into();
                let disposition = Disposition::from_code(error.code);
                self.transport.close();

                vec![
                    ProtocolEvent::Error(error.into()),
                    ProtocolEvent::Signal(disposition),
                ]
            }
            _ => {
                #[cfg(feature = "tracing")]
                tracing::debug!(event = %frame.event, "Ignoring frame before handshake");
                Vec::new()
            }
        }
    }

    fn on_frame(&self, frame: Frame) -> Vec<ProtocolEvent> {
        #[cfg(feature = "tracing")]
        tracing::trace!(event = %frame.event, channel = ?frame.channel, "Frame received");

        match CONTROL_EVENTS.get(frame.event.as_str()).copied() {
            Some(Control::Ping) => vec![ProtocolEvent::Ping],
            Some(Control::Pong) => vec![ProtocolEvent::Pong],
            Some(Control::Error) => {
                let error: ServiceError = serde_json::from_value::<ErrorData>(frame.data)
                    .unwrap_or_default()
                    .into();
                vec![ProtocolEvent::Error(error.into())]
            }
            _ => vec![ProtocolEvent::Message(frame)],
        }
    }
}

/// Close frames carrying a service code are interpreted like `pusher:error`.
fn on_close(close: Option<CloseInfo>) -> Vec<ProtocolEvent> {
    match close {
        Some(CloseInfo { code, reason }) if code >= 4000 => vec![
            ProtocolEvent::Error(
                ServiceError {
                    code: Some(code),
                    message: (!reason.is_empty()).then_some(reason),
                }
                .into(),
            ),
            ProtocolEvent::Signal(Disposition::from_code(Some(code))),
        ],
        _ => vec![ProtocolEvent::Closed],
    }
}

/// Encode and write an event. `false` when the transport cannot take it.
pub(crate) fn send_event(
    transport: &dyn Transport,
    event: &str,
    data: &Value,
    channel: Option<&str>,
) -> bool {
    let frame = Frame::new(event, data.clone(), channel.map(str::to_owned));
    match frame.encode() {
        Ok(text) => {
            #[cfg(feature = "tracing")]
            tracing::trace!(%event, ?channel, "Frame sent");
            transport.send(&text)
        }
        Err(e) => {
            #[cfg(feature = "tracing")]
            tracing::warn!(error = %e, %event, "Unable to encode frame");
            #[cfg(not(feature = "tracing"))]
            let _ = &e;
            false
        }
    }
}
