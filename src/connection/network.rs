use std::sync::Arc;

use strum_macros::Display;
use tokio::sync::watch;

/// Network reachability as reported by the embedding application.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum Availability {
    /// Nothing reported yet; treated as online
    Unknown,
    Online,
    Offline,
}

/// Shared online/offline signal.
///
/// Clones observe the same signal. A connection manager started with a [`Network`]
/// goes `unavailable` when it is marked offline and reconnects once it is back
/// online.
#[derive(Debug, Clone)]
pub struct Network {
    availability: Arc<watch::Sender<Availability>>,
}

impl Default for Network {
    fn default() -> Self {
        Self::new()
    }
}

impl Network {
    #[must_use]
    pub fn new() -> Self {
        let (availability, _) = watch::channel(Availability::Unknown);
        Self {
            availability: Arc::new(availability),
        }
    }

    pub fn set_online(&self) {
        self.set(Availability::Online);
    }

    pub fn set_offline(&self) {
        self.set(Availability::Offline);
    }

    pub fn set(&self, availability: Availability) {
        self.availability.send_if_modified(|current| {
            let changed = *current != availability;
            *current = availability;
            changed
        });
    }

    #[must_use]
    pub fn availability(&self) -> Availability {
        *self.availability.borrow()
    }

    /// `false` only once the network has been reported offline.
    #[must_use]
    pub fn is_online(&self) -> bool {
        self.availability() != Availability::Offline
    }

    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Availability> {
        self.availability.subscribe()
    }
}
