//! Scriptable transport for exercising strategies and the connection manager.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use serde_json::Value;
use tokio::sync::mpsc;

use super::{
    CloseInfo, Environment, StateCell, Transport, TransportError, TransportEvent,
    TransportEvents, TransportFactory, TransportOptions, TransportState,
};

pub(crate) struct MockFactory {
    name: String,
    supported: bool,
    native_ping: bool,
    created: mpsc::UnboundedSender<Arc<MockTransport>>,
}

impl MockFactory {
    /// Factory plus a receiver yielding every transport it creates.
    pub(crate) fn new(
        name: &str,
        supported: bool,
    ) -> (Self, mpsc::UnboundedReceiver<Arc<MockTransport>>) {
        let (created, created_rx) = mpsc::unbounded_channel();
        let factory = Self {
            name: name.to_owned(),
            supported,
            native_ping: false,
            created,
        };
        (factory, created_rx)
    }

    pub(crate) fn with_native_ping(mut self) -> Self {
        self.native_ping = true;
        self
    }
}

impl TransportFactory for MockFactory {
    fn is_supported(&self, _environment: &Environment) -> bool {
        self.supported
    }

    fn create_connection(
        &self,
        options: &TransportOptions,
    ) -> (Arc<dyn Transport>, TransportEvents) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let transport = Arc::new(MockTransport {
            name: self.name.clone(),
            options: options.clone(),
            native_ping: self.native_ping,
            state: StateCell::new(),
            events,
            sent: Mutex::new(Vec::new()),
            close_requested: AtomicBool::new(false),
        });
        _ = self.created.send(Arc::clone(&transport));

        (transport, events_rx)
    }
}

pub(crate) struct MockTransport {
    name: String,
    pub(crate) options: TransportOptions,
    native_ping: bool,
    state: StateCell,
    events: mpsc::UnboundedSender<TransportEvent>,
    sent: Mutex<Vec<String>>,
    close_requested: AtomicBool,
}

impl MockTransport {
    /// Remote accepted the connection.
    pub(crate) fn open(&self) {
        self.state.set(TransportState::Open);
        _ = self.events.send(TransportEvent::Open);
    }

    /// Socket failed: error followed by close.
    pub(crate) fn fail(&self) {
        _ = self.events.send(TransportEvent::Error(
            TransportError::Closed {
                transport: self.name.clone(),
            }
            .into(),
        ));
        self.remote_close(None);
    }

    pub(crate) fn remote_close(&self, close: Option<CloseInfo>) {
        self.state.set(TransportState::Closed);
        _ = self.events.send(TransportEvent::Closed(close));
    }

    pub(crate) fn receive(&self, frame: &Value) {
        _ = self
            .events
            .send(TransportEvent::Message(frame.to_string()));
    }

    pub(crate) fn receive_raw(&self, text: &str) {
        _ = self.events.send(TransportEvent::Message(text.to_owned()));
    }

    /// Server handshake frame.
    pub(crate) fn establish(&self, socket_id: &str) {
        self.receive(&serde_json::json!({
            "event": "pusher:connection_established",
            "data": serde_json::json!({ "socket_id": socket_id }).to_string(),
        }));
    }

    pub(crate) fn sent(&self) -> Vec<Value> {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter_map(|text| serde_json::from_str(text).ok())
            .collect()
    }

    pub(crate) fn sent_events(&self) -> Vec<String> {
        self.sent()
            .iter()
            .filter_map(|frame| frame["event"].as_str().map(str::to_owned))
            .collect()
    }

    pub(crate) fn close_requested(&self) -> bool {
        self.close_requested.load(Ordering::SeqCst)
    }
}

impl Transport for MockTransport {
    fn name(&self) -> &str {
        &self.name
    }

    fn state(&self) -> TransportState {
        self.state.get()
    }

    fn supports_ping(&self) -> bool {
        self.native_ping
    }

    fn initialize(&self) {
        if self
            .state
            .transition(TransportState::New, TransportState::Initialized)
        {
            _ = self.events.send(TransportEvent::Initialized);
        }
    }

    fn connect(&self) -> bool {
        self.state
            .transition(TransportState::Initialized, TransportState::Connecting)
    }

    fn send(&self, data: &str) -> bool {
        if self.state.get() != TransportState::Open {
            return false;
        }
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(data.to_owned());
        true
    }

    fn close(&self) -> bool {
        self.close_requested.store(true, Ordering::SeqCst);
        if self.state.get() == TransportState::Closed {
            return false;
        }
        self.remote_close(None);
        true
    }
}
