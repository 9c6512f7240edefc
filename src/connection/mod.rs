//! Connection lifecycle: strategy execution, handshake, heartbeats and reconnection.
//!
//! ```text
//! initialized -> connecting -> connected
//!                    |   \          |
//!                    |    +-> unavailable (timeout or offline)
//!                    +-> failed     +-> disconnected (requested or refused)
//! ```

pub mod config;
pub mod manager;
pub mod network;
pub mod protocol;
pub mod timeline;

pub use self::config::{Config, RestartConfig};
pub use self::manager::{ConnectionEvent, ConnectionManager, ConnectionState, StateChange};
pub use self::network::{Availability, Network};
pub use self::protocol::{Disposition, Frame};
pub use self::timeline::{Timeline, TimelineEntry, TimelineLevel};
