//! WebSocket transport over tokio-tungstenite.

use std::sync::{Arc, Mutex, PoisonError};

use futures::{SinkExt as _, StreamExt as _};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use url::Url;

use super::{
    CloseInfo, Environment, StateCell, Transport, TransportEvent, TransportEvents,
    TransportFactory, TransportOptions, TransportState,
};
use crate::error::Error;
use crate::{CLIENT_NAME, PROTOCOL_VERSION, Result, VERSION};

/// Registry name of this transport.
pub const NAME: &str = "ws";

/// Creates [`WsTransport`]s.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, Default)]
pub struct WsFactory;

impl TransportFactory for WsFactory {
    fn is_supported(&self, _environment: &Environment) -> bool {
        true
    }

    fn create_connection(
        &self,
        options: &TransportOptions,
    ) -> (Arc<dyn Transport>, TransportEvents) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let transport = WsTransport {
            url: url(options),
            state: Arc::new(StateCell::new()),
            events: events_tx,
            socket: Mutex::new(None),
        };

        (Arc::new(transport), events_rx)
    }
}

/// `ws[s]://host:port/app/{key}?protocol=..&client=..&version=..&flash=false`
pub fn url(options: &TransportOptions) -> Result<Url> {
    let mut url = super::endpoint("ws", "wss", options, &format!("/app/{}", options.key))?;
    url.query_pairs_mut()
        .append_pair("protocol", &PROTOCOL_VERSION.to_string())
        .append_pair("client", CLIENT_NAME)
        .append_pair("version", VERSION)
        .append_pair("flash", "false");

    Ok(url)
}

#[derive(Debug)]
enum Outgoing {
    Text(String),
    Close,
}

/// WebSocket connection. The socket itself lives in a background task; this handle
/// talks to it through a command channel.
#[derive(Debug)]
pub struct WsTransport {
    url: Result<Url>,
    state: Arc<StateCell>,
    events: mpsc::UnboundedSender<TransportEvent>,
    socket: Mutex<Option<mpsc::UnboundedSender<Outgoing>>>,
}

impl Transport for WsTransport {
    fn name(&self) -> &str {
        NAME
    }

    fn state(&self) -> TransportState {
        self.state.get()
    }

    fn supports_ping(&self) -> bool {
        false
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
        let mut socket = self.socket.lock().unwrap_or_else(PoisonError::into_inner);
        if socket.is_some()
            || !self
                .state
                .transition(TransportState::Initialized, TransportState::Connecting)
        {
            return false;
        }

        let url = match &self.url {
            Ok(url) => url.clone(),
            Err(e) => {
                let error = Error::validation(format!("invalid WebSocket endpoint: {e}"));
                self.state.set(TransportState::Closed);
                _ = self.events.send(TransportEvent::Error(error));
                _ = self.events.send(TransportEvent::Closed(None));
                return false;
            }
        };

        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        *socket = Some(outgoing_tx);

        tokio::spawn(run_socket(
            url,
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

        self.socket
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|socket| socket.send(Outgoing::Text(data.to_owned())).is_ok())
    }

    fn close(&self) -> bool {
        self.socket
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|socket| socket.send(Outgoing::Close).is_ok())
    }
}

fn close_info(frame: &CloseFrame) -> CloseInfo {
    CloseInfo::new(u16::from(frame.code), frame.reason.as_str())
}

async fn run_socket(
    url: Url,
    state: Arc<StateCell>,
    events: mpsc::UnboundedSender<TransportEvent>,
    mut outgoing: mpsc::UnboundedReceiver<Outgoing>,
) {
    #[cfg(feature = "tracing")]
    tracing::debug!(%url, "Opening WebSocket");

    // Any command before the socket opens can only be a close request.
    let connected = tokio::select! {
        result = connect_async(url.as_str()) => Some(result),
        _ = outgoing.recv() => None,
    };

    let stream = match connected {
        Some(Ok((stream, _))) => stream,
        Some(Err(e)) => {
            _ = events.send(TransportEvent::Error(e.into()));
            state.set(TransportState::Closed);
            _ = events.send(TransportEvent::Closed(None));
            return;
        }
        None => {
            state.set(TransportState::Closed);
            _ = events.send(TransportEvent::Closed(None));
            return;
        }
    };

    state.set(TransportState::Open);
    _ = events.send(TransportEvent::Open);

    let (mut write, mut read) = stream.split();

    let close = loop {
        tokio::select! {
            message = read.next() => {
                match message {
                    Some(Ok(Message::Text(text))) => {
                        #[cfg(feature = "tracing")]
                        tracing::trace!(%text, "Received WebSocket text message");
                        _ = events.send(TransportEvent::Message(text.to_string()));
                    }
                    Some(Ok(Message::Close(frame))) => break frame.as_ref().map(close_info),
                    Some(Ok(_)) => {
                        // Binary frames and control frames are not part of the protocol.
                    }
                    Some(Err(e)) => {
                        _ = events.send(TransportEvent::Error(e.into()));
                        break None;
                    }
                    None => break None,
                }
            }

            command = outgoing.recv() => {
                match command {
                    Some(Outgoing::Text(text)) => {
                        #[cfg(feature = "tracing")]
                        tracing::trace!(%text, "Sending WebSocket text message");
                        if let Err(e) = write.send(Message::Text(text.into())).await {
                            _ = events.send(TransportEvent::Error(e.into()));
                            break None;
                        }
                    }
                    Some(Outgoing::Close) | None => {
                        _ = write.send(Message::Close(None)).await;
                        break None;
                    }
                }
            }
        }
    };

    state.set(TransportState::Closed);
    _ = events.send(TransportEvent::Closed(close));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_carries_protocol_query() {
        let options = TransportOptions {
            key: "app-key".to_owned(),
            host: Some("ws.pusherapp.com".to_owned()),
            encrypted_port: Some(443),
            unencrypted_port: Some(80),
            ..TransportOptions::default()
        };

        let url = url(&options).unwrap();

        assert_eq!(url.scheme(), "ws");
        assert_eq!(url.path(), "/app/app-key");
        let query: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert_eq!(
            query,
            vec![
                ("protocol".to_owned(), PROTOCOL_VERSION.to_string()),
                ("client".to_owned(), CLIENT_NAME.to_owned()),
                ("version".to_owned(), VERSION.to_owned()),
                ("flash".to_owned(), "false".to_owned()),
            ]
        );
    }

    #[tokio::test]
    async fn invalid_endpoint_reports_error_then_closed() {
        let (transport, mut events) = WsFactory.create_connection(&TransportOptions::default());

        transport.initialize();
        assert!(matches!(
            events.recv().await,
            Some(TransportEvent::Initialized)
        ));

        assert!(!transport.connect());
        assert!(matches!(events.recv().await, Some(TransportEvent::Error(_))));
        assert!(matches!(
            events.recv().await,
            Some(TransportEvent::Closed(None))
        ));
        assert_eq!(transport.state(), TransportState::Closed);
        assert!(!transport.send("{}"));
    }
}
