#![allow(
    clippy::unwrap_used,
    clippy::missing_panics_doc,
    reason = "Do not need additional syntax for setting up tests"
)]
#![allow(
    unused,
    reason = "Not every test binary uses every helper"
)]

use std::net::SocketAddr;

use pusher_client_sdk::connection::Config;

// publicly documented example credentials
pub const KEY: &str = "278d425bdf160c739803";
pub const SECRET: &str = "7ad3773142a6692b25b8";

pub const SOCKET_ID: &str = "1234.1234";

/// Config pointing the WebSocket transport at a local server, without TLS.
#[must_use]
pub fn local_config(addr: SocketAddr) -> Config {
    Config::builder()
        .host(addr.ip().to_string())
        .ws_port(addr.port())
        .build()
}

/// Log through `tracing` when the feature is on; `RUST_LOG` selects the level.
pub fn init_tracing() {
    #[cfg(feature = "tracing")]
    {
        use tracing_subscriber::EnvFilter;

        _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }
}
