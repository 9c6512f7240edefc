//! In-process event dispatch shared by the connection, the channels and the client.
//!
//! Callbacks are snapshotted before each emission, so a callback may bind or unbind
//! (itself included) while it is being invoked without affecting the current round.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;
type GlobalCallback<T> = Arc<dyn Fn(&str, &T) + Send + Sync>;

/// Handle returned by [`EventDispatcher::bind`] and [`EventDispatcher::bind_all`].
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BindingId(u64);

/// Named-event pub/sub with optional catch-all callbacks and a fail-through hook.
pub struct EventDispatcher<T> {
    callbacks: RwLock<HashMap<String, Vec<(BindingId, Callback<T>)>>>,
    global: RwLock<Vec<(BindingId, GlobalCallback<T>)>>,
    fail_through: Option<GlobalCallback<T>>,
    next_id: AtomicU64,
}

impl<T> Default for EventDispatcher<T> {
    fn default() -> Self {
        Self {
            callbacks: RwLock::new(HashMap::new()),
            global: RwLock::new(Vec::new()),
            fail_through: None,
            next_id: AtomicU64::new(0),
        }
    }
}

impl<T> fmt::Debug for EventDispatcher<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let callbacks = self
            .callbacks
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("EventDispatcher")
            .field("events", &callbacks.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl<T> EventDispatcher<T> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Dispatcher that invokes `fail_through` for events nobody bound by name.
    #[must_use]
    pub fn with_fail_through<F>(fail_through: F) -> Self
    where
        F: Fn(&str, &T) + Send + Sync + 'static,
    {
        Self {
            fail_through: Some(Arc::new(fail_through)),
            ..Self::default()
        }
    }

    fn next_id(&self) -> BindingId {
        BindingId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Register `callback` for events named `event`.
    pub fn bind<F>(&self, event: &str, callback: F) -> BindingId
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = self.next_id();
        self.callbacks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(event.to_owned())
            .or_default()
            .push((id, Arc::new(callback)));
        id
    }

    /// Register `callback` for every event. Global callbacks run before named ones.
    pub fn bind_all<F>(&self, callback: F) -> BindingId
    where
        F: Fn(&str, &T) + Send + Sync + 'static,
    {
        let id = self.next_id();
        self.global
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, Arc::new(callback)));
        id
    }

    /// Remove a single binding. Returns `false` if it was not registered.
    pub fn unbind(&self, id: BindingId) -> bool {
        {
            let mut global = self.global.write().unwrap_or_else(PoisonError::into_inner);
            if let Some(position) = global.iter().position(|(bound, _)| *bound == id) {
                global.remove(position);
                return true;
            }
        }

        let mut callbacks = self
            .callbacks
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let mut removed = false;
        callbacks.retain(|_, bound| {
            if let Some(position) = bound.iter().position(|(bound, _)| *bound == id) {
                bound.remove(position);
                removed = true;
            }
            !bound.is_empty()
        });
        removed
    }

    /// Remove every callback bound to `event`.
    pub fn unbind_event(&self, event: &str) {
        self.callbacks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(event);
    }

    /// Invoke global callbacks, then the callbacks bound to `event`, or the fail-through
    /// hook when there are none.
    pub fn emit(&self, event: &str, data: &T) {
        let global: Vec<GlobalCallback<T>> = self
            .global
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, callback)| Arc::clone(callback))
            .collect();
        let named: Vec<Callback<T>> = self
            .callbacks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(event)
            .map(|bound| bound.iter().map(|(_, callback)| Arc::clone(callback)).collect())
            .unwrap_or_default();

        for callback in &global {
            callback(event, data);
        }

        if named.is_empty() {
            if let Some(fail_through) = &self.fail_through {
                fail_through(event, data);
            }
            return;
        }

        for callback in &named {
            callback(data);
        }
    }
}
