//! Channels and their subscription state.
//!
//! The channel name decides its [`ChannelKind`]: `private-` and `presence-` channels
//! need an authorization before the service accepts the subscription, and presence
//! channels additionally track their [`Members`].

pub mod auth;
pub mod members;

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_stream::try_stream;
use futures::Stream;
use serde_json::{Map, Value, json};
use strum_macros::Display;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

use self::auth::{AuthData, Authorizer};
pub use self::members::{Member, Members};
use crate::Result;
use crate::connection::{ConnectionManager, Frame};
use crate::error::{AuthorizationError, Error, Lagged};
use crate::events::{BindingId, EventDispatcher};

pub const SUBSCRIPTION_SUCCEEDED: &str = "pusher:subscription_succeeded";
pub const SUBSCRIPTION_ERROR: &str = "pusher:subscription_error";
pub const MEMBER_ADDED: &str = "pusher:member_added";
pub const MEMBER_REMOVED: &str = "pusher:member_removed";

pub(crate) const INTERNAL_PREFIX: &str = "pusher_internal:";
const INTERNAL_SUBSCRIPTION_SUCCEEDED: &str = "pusher_internal:subscription_succeeded";
const INTERNAL_MEMBER_ADDED: &str = "pusher_internal:member_added";
const INTERNAL_MEMBER_REMOVED: &str = "pusher_internal:member_removed";
const CLIENT_EVENT_PREFIX: &str = "client-";

/// Broadcast channel capacity for [`Channel::stream`].
const BROADCAST_CAPACITY: usize = 1024;

#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum ChannelKind {
    Public,
    Private,
    Presence,
}

impl ChannelKind {
    #[must_use]
    pub fn from_name(name: &str) -> Self {
        if name.starts_with("presence-") {
            Self::Presence
        } else if name.starts_with("private-") {
            Self::Private
        } else {
            Self::Public
        }
    }

    #[must_use]
    pub const fn requires_auth(self) -> bool {
        !matches!(self, Self::Public)
    }
}

/// An event delivered on a channel, as yielded by [`Channel::stream`].
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelEvent {
    pub event: String,
    pub data: Value,
}

struct Inner {
    name: String,
    kind: ChannelKind,
    subscribed: AtomicBool,
    dispatcher: EventDispatcher<Value>,
    members: Mutex<Members>,
    events: broadcast::Sender<ChannelEvent>,
    connection: ConnectionManager,
}

/// A named channel. Clones refer to the same channel.
///
/// Channels survive reconnects: the client subscribes them again every time the
/// connection is established.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<Inner>,
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("name", &self.inner.name)
            .field("kind", &self.inner.kind)
            .field("subscribed", &self.is_subscribed())
            .finish_non_exhaustive()
    }
}

impl Channel {
    pub(crate) fn new(name: &str, connection: ConnectionManager) -> Self {
        let (events, _) = broadcast::channel(BROADCAST_CAPACITY);
        let channel = name.to_owned();
        let dispatcher = EventDispatcher::with_fail_through(move |event: &str, _: &Value| {
            #[cfg(feature = "tracing")]
            tracing::debug!(%channel, event, "No callbacks bound for channel event");
            #[cfg(not(feature = "tracing"))]
            let _ = (&channel, event);
        });
        Self {
            inner: Arc::new(Inner {
                name: name.to_owned(),
                kind: ChannelKind::from_name(name),
                subscribed: AtomicBool::new(false),
                dispatcher,
                members: Mutex::new(Members::default()),
                events,
                connection,
            }),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    #[must_use]
    pub fn kind(&self) -> ChannelKind {
        self.inner.kind
    }

    /// Whether the service confirmed the subscription on the current connection.
    #[must_use]
    pub fn is_subscribed(&self) -> bool {
        self.inner.subscribed.load(Ordering::Acquire)
    }

    /// Snapshot of the member set, for presence channels.
    #[must_use]
    pub fn members(&self) -> Option<Members> {
        (self.inner.kind == ChannelKind::Presence).then(|| self.lock_members().clone())
    }

    pub fn bind<F>(&self, event: &str, callback: F) -> BindingId
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.inner.dispatcher.bind(event, callback)
    }

    pub fn bind_all<F>(&self, callback: F) -> BindingId
    where
        F: Fn(&str, &Value) + Send + Sync + 'static,
    {
        self.inner.dispatcher.bind_all(callback)
    }

    pub fn unbind(&self, id: BindingId) -> bool {
        self.inner.dispatcher.unbind(id)
    }

    /// Remove every callback bound to `event`.
    pub fn unbind_event(&self, event: &str) {
        self.inner.dispatcher.unbind_event(event);
    }

    /// Send a client event to the other subscribers.
    ///
    /// Client events must be named `client-*` and are only accepted on private and
    /// presence channels. Returns whether the frame was written.
    pub fn trigger(&self, event: &str, data: &Value) -> Result<bool> {
        if !event.starts_with(CLIENT_EVENT_PREFIX) {
            return Err(Error::validation(format!(
                "client event {event} must start with {CLIENT_EVENT_PREFIX}"
            )));
        }
        if !self.inner.kind.requires_auth() {
            return Err(Error::validation(format!(
                "client events are not supported on public channel {}",
                self.inner.name
            )));
        }

        Ok(self
            .inner
            .connection
            .send_event(event, data, Some(&self.inner.name)))
    }

    /// Every event emitted on this channel from now on.
    ///
    /// A consumer that falls behind by more than the buffer receives a [`Lagged`] error
    /// and continues with the newest events.
    pub fn stream(&self) -> impl Stream<Item = Result<ChannelEvent>> + use<> {
        let mut rx = self.inner.events.subscribe();

        try_stream! {
            loop {
                match rx.recv().await {
                    Ok(event) => yield event,
                    Err(RecvError::Lagged(count)) => {
                        #[cfg(feature = "tracing")]
                        tracing::warn!("Channel stream lagged, missed {count} events");
                        Err(Lagged { count })?;
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        }
    }

    fn lock_members(&self) -> std::sync::MutexGuard<'_, Members> {
        self.inner
            .members
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: &str, data: Value) {
        self.inner.dispatcher.emit(event, &data);
        _ = self.inner.events.send(ChannelEvent {
            event: event.to_owned(),
            data,
        });
    }

    /// Obtain the authorization ticket for subscribing on `socket_id`.
    pub(crate) async fn authorize(
        &self,
        socket_id: &str,
        authorizer: Option<&dyn Authorizer>,
    ) -> Result<AuthData> {
        if !self.inner.kind.requires_auth() {
            return Ok(AuthData::default());
        }
        let authorizer = authorizer.ok_or_else(|| {
            Error::authorization(None, "no authorizer configured for private channels")
        })?;

        let data = authorizer.authorize(socket_id, &self.inner.name).await?;

        if self.inner.kind == ChannelKind::Presence {
            let my_id = data
                .channel_data
                .as_deref()
                .and_then(|channel_data| serde_json::from_str::<Value>(channel_data).ok())
                .and_then(|channel_data| channel_data.get("user_id").and_then(members::user_id))
                .ok_or_else(|| {
                    Error::authorization(None, "presence authorization is missing a user_id")
                })?;
            self.lock_members().set_my_id(my_id);
        }

        Ok(data)
    }

    /// Send the subscribe frame carrying `auth`.
    pub(crate) fn send_subscribe(&self, auth: AuthData) -> bool {
        let mut data = Map::new();
        data.insert("channel".to_owned(), json!(self.inner.name));
        if !auth.auth.is_empty() {
            data.insert("auth".to_owned(), json!(auth.auth));
        }
        if let Some(channel_data) = auth.channel_data {
            data.insert("channel_data".to_owned(), json!(channel_data));
        }

        self.inner
            .connection
            .send_event("pusher:subscribe", &Value::Object(data), None)
    }

    pub(crate) fn send_unsubscribe(&self) -> bool {
        self.inner.connection.send_event(
            "pusher:unsubscribe",
            &json!({ "channel": self.inner.name }),
            None,
        )
    }

    pub(crate) fn subscription_failed(&self, error: &Error) {
        #[cfg(feature = "tracing")]
        tracing::warn!(channel = %self.inner.name, %error, "Channel authorization failed");

        let status = error
            .downcast_ref::<AuthorizationError>()
            .and_then(|e| e.status)
            .map(|status| status.as_u16());
        self.emit(
            SUBSCRIPTION_ERROR,
            json!({ "type": "AuthError", "error": error.to_string(), "status": status }),
        );
    }

    /// Route a frame addressed to this channel.
    pub(crate) fn handle_event(&self, frame: &Frame) {
        match frame.event.as_str() {
            INTERNAL_SUBSCRIPTION_SUCCEEDED => {
                self.inner.subscribed.store(true, Ordering::Release);
                let data = if self.inner.kind == ChannelKind::Presence {
                    let mut members = self.lock_members();
                    members.on_subscription(&frame.data);
                    json!(*members)
                } else {
                    frame.data.clone()
                };
                self.emit(SUBSCRIPTION_SUCCEEDED, data);
            }
            INTERNAL_MEMBER_ADDED if self.inner.kind == ChannelKind::Presence => {
                let added = self.lock_members().add(&frame.data);
                if let Some(member) = added {
                    self.emit(MEMBER_ADDED, json!(member));
                }
            }
            INTERNAL_MEMBER_REMOVED if self.inner.kind == ChannelKind::Presence => {
                let removed = self.lock_members().remove(&frame.data);
                if let Some(member) = removed {
                    self.emit(MEMBER_REMOVED, json!(member));
                }
            }
            event => self.emit(event, frame.data.clone()),
        }
    }

    /// The connection was lost; the subscription has to be made again.
    pub(crate) fn disconnect(&self) {
        self.inner.subscribed.store(false, Ordering::Release);
        if self.inner.kind == ChannelKind::Presence {
            self.lock_members().reset();
        }
    }
}
