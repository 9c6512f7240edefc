#![cfg_attr(doc, doc = include_str!("../README.md"))]

pub mod channel;
pub mod client;
pub mod connection;
pub mod error;
pub mod events;
pub mod strategy;
pub mod transport;

pub use self::channel::auth::{AuthConfig, AuthData, Authorizer, HttpAuthorizer, SigningAuthorizer};
pub use self::channel::{Channel, ChannelEvent, ChannelKind, Member, Members};
pub use self::client::Client;
pub use self::connection::{Config, ConnectionManager, ConnectionState};
pub use self::error::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Version of this crate, reported to the service in the connection URL.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Protocol revision spoken by this client.
pub const PROTOCOL_VERSION: u8 = 7;

/// Client identifier reported to the service.
pub const CLIENT_NAME: &str = "rust";
