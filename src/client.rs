use std::fmt;
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use serde_json::Value;
use tokio::runtime::Handle;

use crate::Result;
use crate::channel::auth::{AuthData, Authorizer, HttpAuthorizer};
use crate::channel::{Channel, INTERNAL_PREFIX};
use crate::connection::manager::{MESSAGE, STATE_CHANGE};
use crate::connection::{Config, ConnectionEvent, ConnectionManager, ConnectionState, Frame};
use crate::error::Error;
use crate::events::{BindingId, EventDispatcher};

/// Client for one application on the Pusher channels service.
///
/// Owns the connection and the set of subscribed channels. Channels stay registered
/// across reconnects and are subscribed again every time the connection is
/// established.
///
/// # Examples
///
/// ```rust, no_run
/// use pusher_client_sdk::Client;
/// use pusher_client_sdk::connection::Config;
///
/// #[tokio::main]
/// async fn main() -> anyhow::Result<()> {
///     let client = Client::new("app-key", Config::default())?;
///     client.connect();
///
///     let channel = client.subscribe("news")?;
///     channel.bind("breaking", |data| println!("{data}"));
///
///     tokio::signal::ctrl_c().await?;
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    key: String,
    connection: ConnectionManager,
    channels: DashMap<String, Channel>,
    /// Events received on any channel, internal ones excluded
    dispatcher: EventDispatcher<Frame>,
    authorizer: Option<Arc<dyn Authorizer>>,
    runtime: Handle,
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("key", &self.inner.key)
            .field("connection", &self.inner.connection)
            .field("channels", &self.inner.channels.len())
            .finish_non_exhaustive()
    }
}

impl Client {
    /// Create a client that authorizes private and presence channels through the
    /// configured auth endpoint, if any. Does not connect.
    pub fn new(key: &str, config: Config) -> Result<Self> {
        let authorizer = match config.auth.endpoint {
            Some(_) => Some(Arc::new(HttpAuthorizer::from_config(&config.auth)?) as Arc<dyn Authorizer>),
            None => None,
        };

        Self::build(key, config, authorizer)
    }

    /// Create a client that authorizes private and presence channels with `authorizer`.
    pub fn with_authorizer<A: Authorizer>(key: &str, config: Config, authorizer: A) -> Result<Self> {
        Self::build(key, config, Some(Arc::new(authorizer)))
    }

    fn build(key: &str, config: Config, authorizer: Option<Arc<dyn Authorizer>>) -> Result<Self> {
        let runtime = Handle::try_current()
            .map_err(|e| Error::validation(format!("no tokio runtime available: {e}")))?;
        let connection = ConnectionManager::new(key, config)?;

        let inner = Arc::new(ClientInner {
            key: key.to_owned(),
            connection,
            channels: DashMap::new(),
            dispatcher: EventDispatcher::new(),
            authorizer,
            runtime,
        });
        ClientInner::wire(&inner);

        Ok(Self { inner })
    }

    #[must_use]
    pub fn key(&self) -> &str {
        &self.inner.key
    }

    pub fn connect(&self) {
        self.inner.connection.connect();
    }

    pub fn disconnect(&self) {
        self.inner.connection.disconnect();
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.inner.connection.state()
    }

    #[must_use]
    pub fn socket_id(&self) -> Option<String> {
        self.inner.connection.socket_id()
    }

    /// The underlying connection, for binding to its state and error events.
    #[must_use]
    pub fn connection(&self) -> &ConnectionManager {
        &self.inner.connection
    }

    /// Register the channel and subscribe to it once connected.
    ///
    /// Subscribing to an already registered channel returns the existing one.
    pub fn subscribe(&self, name: &str) -> Result<Channel> {
        if name.is_empty() {
            return Err(Error::validation("channel name must not be empty"));
        }

        let mut created = false;
        let channel = self
            .inner
            .channels
            .entry(name.to_owned())
            .or_insert_with(|| {
                created = true;
                Channel::new(name, self.inner.connection.clone())
            })
            .clone();

        if created {
            #[cfg(feature = "tracing")]
            tracing::debug!(channel = name, kind = %channel.kind(), "Subscribing to channel");
            self.inner.subscribe_channel(&channel);
        }

        Ok(channel)
    }

    /// Forget the channel, telling the service if connected.
    pub fn unsubscribe(&self, name: &str) {
        let Some((_, channel)) = self.inner.channels.remove(name) else {
            return;
        };

        if self.inner.connection.state() == ConnectionState::Connected {
            channel.send_unsubscribe();
        }
        channel.disconnect();
    }

    #[must_use]
    pub fn channel(&self, name: &str) -> Option<Channel> {
        self.inner
            .channels
            .get(name)
            .map(|channel| channel.value().clone())
    }

    #[must_use]
    pub fn channels(&self) -> Vec<Channel> {
        self.inner.channels()
    }

    /// Register `callback` for events named `event` on any channel.
    pub fn bind<F>(&self, event: &str, callback: F) -> BindingId
    where
        F: Fn(&Frame) + Send + Sync + 'static,
    {
        self.inner.dispatcher.bind(event, callback)
    }

    /// Register `callback` for every event received on any channel.
    pub fn bind_all<F>(&self, callback: F) -> BindingId
    where
        F: Fn(&str, &Frame) + Send + Sync + 'static,
    {
        self.inner.dispatcher.bind_all(callback)
    }

    pub fn unbind(&self, id: BindingId) -> bool {
        self.inner.dispatcher.unbind(id)
    }

    /// Send a raw event over the connection. Returns `false` when not connected.
    pub fn send_event(&self, event: &str, data: &Value, channel: Option<&str>) -> bool {
        self.inner.connection.send_event(event, data, channel)
    }
}

impl ClientInner {
    /// Route connection events into the channels. Callbacks only hold weak references
    /// so dropping the client stops the connection.
    fn wire(inner: &Arc<Self>) {
        let weak = Arc::downgrade(inner);
        inner.connection.bind(STATE_CHANGE, move |event| {
            let (Some(inner), ConnectionEvent::StateChange(change)) = (weak.upgrade(), event) else {
                return;
            };

            if change.current == ConnectionState::Connected {
                inner.subscribe_all();
            } else if change.previous == ConnectionState::Connected {
                for channel in inner.channels() {
                    channel.disconnect();
                }
            }
        });

        let weak = Arc::downgrade(inner);
        inner.connection.bind(MESSAGE, move |event| {
            if let (Some(inner), ConnectionEvent::Message(frame)) = (weak.upgrade(), event) {
                inner.on_message(frame);
            }
        });
    }

    fn channels(&self) -> Vec<Channel> {
        self.channels
            .iter()
            .map(|channel| channel.value().clone())
            .collect()
    }

    fn on_message(&self, frame: &Frame) {
        let channel = frame
            .channel
            .as_deref()
            .and_then(|name| self.channels.get(name).map(|channel| channel.value().clone()));
        if let Some(channel) = channel {
            channel.handle_event(frame);
        }

        if !frame.event.starts_with(INTERNAL_PREFIX) {
            self.dispatcher.emit(&frame.event, frame);
        }
    }

    fn subscribe_all(self: &Arc<Self>) {
        for channel in self.channels() {
            self.subscribe_channel(&channel);
        }
    }

    fn subscribe_channel(self: &Arc<Self>, channel: &Channel) {
        if self.connection.state() != ConnectionState::Connected {
            return;
        }
        let Some(socket_id) = self.connection.socket_id() else {
            return;
        };

        if !channel.kind().requires_auth() {
            channel.send_subscribe(AuthData::default());
            return;
        }

        let weak = Arc::downgrade(self);
        let channel = channel.clone();
        self.runtime.spawn(async move {
            let authorizer = weak.upgrade().and_then(|inner| inner.authorizer.clone());
            let result = channel.authorize(&socket_id, authorizer.as_deref()).await;

            if !Self::still_wanted(&weak, &channel, &socket_id) {
                #[cfg(feature = "tracing")]
                tracing::debug!(channel = channel.name(), "Dropping stale channel authorization");
                return;
            }

            match result {
                Ok(auth) => {
                    channel.send_subscribe(auth);
                }
                Err(e) => channel.subscription_failed(&e),
            }
        });
    }

    /// The channel is still registered and the connection that asked for the
    /// authorization is still the current one.
    fn still_wanted(weak: &Weak<Self>, channel: &Channel, socket_id: &str) -> bool {
        weak.upgrade().is_some_and(|inner| {
            inner.channels.contains_key(channel.name())
                && inner.connection.socket_id().as_deref() == Some(socket_id)
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use serde_json::json;
    use tokio::sync::mpsc::UnboundedReceiver;

    use super::*;
    use crate::channel::SUBSCRIPTION_ERROR;
    use crate::channel::auth::SigningAuthorizer;
    use crate::transport::TransportRegistry;
    use crate::transport::testing::{MockFactory, MockTransport};

    const KEY: &str = "app-key";

    fn config() -> (Config, UnboundedReceiver<Arc<MockTransport>>) {
        let (factory, created) = MockFactory::new("mock", true);
        let config = Config::builder()
            .transports(TransportRegistry::empty().with("mock", factory))
            .strategy(json!({ "type": "transport", "transport": "mock", "host": "example.com" }))
            .build();
        (config, created)
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    async fn connected(
        client: &Client,
        created: &mut UnboundedReceiver<Arc<MockTransport>>,
        socket_id: &str,
    ) -> Arc<MockTransport> {
        client.connect();
        let transport = created.recv().await.unwrap();
        transport.open();
        transport.establish(socket_id);
        client
            .connection()
            .state_receiver()
            .wait_for(|state| *state == ConnectionState::Connected)
            .await
            .unwrap();
        settle().await;
        transport
    }

    fn subscribes(transport: &MockTransport) -> Vec<Value> {
        transport
            .sent()
            .into_iter()
            .filter(|frame| frame["event"] == "pusher:subscribe")
            .map(|frame| frame["data"].clone())
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn subscribes_registered_channels_on_connect() {
        let (config, mut created) = config();
        let client = Client::new(KEY, config).unwrap();
        let channel = client.subscribe("news").unwrap();

        let transport = connected(&client, &mut created, "1.1").await;

        assert_eq!(subscribes(&transport), vec![json!({ "channel": "news" })]);
        assert!(!channel.is_subscribed());

        transport.receive(&json!({
            "event": "pusher_internal:subscription_succeeded",
            "channel": "news",
            "data": "{}",
        }));
        settle().await;
        assert!(channel.is_subscribed());
    }

    #[tokio::test(start_paused = true)]
    async fn global_bindings_skip_internal_events() {
        let (config, mut created) = config();
        let client = Client::new(KEY, config).unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        client.bind_all(move |event, frame| {
            sink.lock().unwrap().push((event.to_owned(), frame.channel.clone()));
        });
        let channel = client.subscribe("news").unwrap();
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&received);
        channel.bind("breaking", move |data| sink.lock().unwrap().push(data.clone()));

        let transport = connected(&client, &mut created, "1.1").await;
        transport.receive(&json!({
            "event": "pusher_internal:subscription_succeeded",
            "channel": "news",
            "data": "{}",
        }));
        transport.receive(&json!({
            "event": "breaking",
            "channel": "news",
            "data": r#"{"title":"hello"}"#,
        }));
        settle().await;

        assert_eq!(*received.lock().unwrap(), vec![json!({ "title": "hello" })]);
        assert_eq!(
            *seen.lock().unwrap(),
            vec![("breaking".to_owned(), Some("news".to_owned()))]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn private_channel_is_signed_for_current_socket() {
        let (config, mut created) = config();
        let authorizer = SigningAuthorizer::new(KEY, "secret");
        let expected = authorizer.sign("1.1", "private-chat", None).unwrap();
        let client = Client::with_authorizer(KEY, config, authorizer).unwrap();

        let transport = connected(&client, &mut created, "1.1").await;
        client.subscribe("private-chat").unwrap();
        settle().await;

        assert_eq!(
            subscribes(&transport),
            vec![json!({ "channel": "private-chat", "auth": expected })]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn missing_authorizer_reports_subscription_error() {
        let (config, mut created) = config();
        let client = Client::new(KEY, config).unwrap();
        let channel = client.subscribe("private-chat").unwrap();
        let errors = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&errors);
        channel.bind(SUBSCRIPTION_ERROR, move |data| sink.lock().unwrap().push(data.clone()));

        let transport = connected(&client, &mut created, "1.1").await;

        assert!(subscribes(&transport).is_empty(), "nothing to send without auth");
        assert_eq!(errors.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_resubscribes_channels() {
        let (config, mut created) = config();
        let client = Client::new(KEY, config).unwrap();
        let channel = client.subscribe("news").unwrap();

        let first = connected(&client, &mut created, "1.1").await;
        first.receive(&json!({
            "event": "pusher_internal:subscription_succeeded",
            "channel": "news",
            "data": "{}",
        }));
        settle().await;
        assert!(channel.is_subscribed());

        first.remote_close(None);
        let second = created.recv().await.unwrap();
        assert!(!channel.is_subscribed());

        second.open();
        second.establish("2.2");
        settle().await;

        assert_eq!(client.socket_id().as_deref(), Some("2.2"));
        assert_eq!(subscribes(&second), vec![json!({ "channel": "news" })]);
        assert!(!channel.is_subscribed(), "waits for the new confirmation");

        second.receive(&json!({
            "event": "pusher_internal:subscription_succeeded",
            "channel": "news",
            "data": "{}",
        }));
        settle().await;
        assert!(channel.is_subscribed());
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_reseeds_presence_members() {
        let (config, mut created) = config();
        let authorizer = SigningAuthorizer::new(KEY, "secret").with_member("42", json!({}));
        let client = Client::with_authorizer(KEY, config, authorizer).unwrap();
        let channel = client.subscribe("presence-room").unwrap();
        let succeeded = |count: usize| {
            let hash: serde_json::Map<String, Value> = ["42", "43", "44"][..count]
                .iter()
                .map(|id| ((*id).to_owned(), json!({})))
                .collect();
            json!({
                "event": "pusher_internal:subscription_succeeded",
                "channel": "presence-room",
                "data": json!({ "presence": { "hash": hash, "count": count } }).to_string(),
            })
        };

        let first = connected(&client, &mut created, "1.1").await;
        first.receive(&succeeded(2));
        settle().await;
        assert_eq!(channel.members().unwrap().count(), 2);

        first.remote_close(None);
        let second = created.recv().await.unwrap();
        let members = channel.members().unwrap();
        assert!(!channel.is_subscribed());
        assert_eq!(members.count(), 0);
        assert!(members.me().is_none());

        second.open();
        second.establish("2.2");
        settle().await;
        assert_eq!(subscribes(&second).len(), 1);
        assert!(!channel.is_subscribed());

        second.receive(&succeeded(3));
        settle().await;
        let members = channel.members().unwrap();
        assert!(channel.is_subscribed());
        assert_eq!(members.count(), 3);
        assert_eq!(members.me().unwrap().id, "42");
    }

    #[tokio::test(start_paused = true)]
    async fn unsubscribe_notifies_service() {
        let (config, mut created) = config();
        let client = Client::new(KEY, config).unwrap();
        client.subscribe("news").unwrap();
        let transport = connected(&client, &mut created, "1.1").await;

        client.unsubscribe("news");

        assert!(client.channel("news").is_none());
        assert_eq!(
            transport.sent().last().unwrap(),
            &json!({ "event": "pusher:unsubscribe", "data": { "channel": "news" } })
        );
    }

    #[tokio::test]
    async fn subscribe_twice_returns_same_channel() {
        let (config, _created) = config();
        let client = Client::new(KEY, config).unwrap();

        client.subscribe("news").unwrap();
        client.subscribe("news").unwrap();

        assert_eq!(client.channels().len(), 1);
        assert!(client.subscribe("").is_err(), "empty names are rejected");
    }
}
