#![expect(
    clippy::module_name_repetitions,
    reason = "Configuration types intentionally mirror the module name for clarity"
)]

use std::time::Duration;

use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use bon::Builder;
use serde_json::{Value, json};

use super::network::Network;
use super::timeline::DEFAULT_TIMELINE_LIMIT;
use crate::channel::auth::AuthConfig;
use crate::transport::TransportRegistry;

pub const DEFAULT_HOST: &str = "ws.pusherapp.com";
pub const DEFAULT_WS_PORT: u16 = 80;
pub const DEFAULT_WSS_PORT: u16 = 443;
pub const DEFAULT_SOCKJS_HOST: &str = "sockjs.pusher.com";
pub const DEFAULT_SOCKJS_HTTP_PORT: u16 = 80;
pub const DEFAULT_SOCKJS_HTTPS_PORT: u16 = 443;

const DEFAULT_ACTIVITY_TIMEOUT: Duration = Duration::from_secs(120);
const DEFAULT_PONG_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_UNAVAILABLE_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_BACKOFF_DELAY: Duration = Duration::from_secs(1);
const DEFAULT_RESTART_INITIAL_DELAY: Duration = Duration::from_secs(1);
const DEFAULT_RESTART_MAX_DELAY: Duration = Duration::from_secs(60);
const DEFAULT_RESTART_MULTIPLIER: f64 = 2.0;

const STRATEGY_TIMEOUT_MS: u64 = 15_000;
const STRATEGY_TIMEOUT_LIMIT_MS: u64 = 60_000;
const SOCKJS_FALLBACK_DELAY_MS: u64 = 2_000;

/// Configuration for a connection and the client built on top of it.
///
/// ```
/// # use std::time::Duration;
/// # use pusher_client_sdk::connection::Config;
/// let config = Config::builder()
///     .encrypted(true)
///     .activity_timeout(Duration::from_secs(30))
///     .build();
/// # assert_eq!(config.host, "ws.pusherapp.com");
/// ```
#[non_exhaustive]
#[derive(Debug, Clone, Builder)]
pub struct Config {
    /// Start with TLS transports. A service close code may switch this on later.
    #[builder(default)]
    pub encrypted: bool,
    #[builder(into, default = DEFAULT_HOST.to_owned())]
    pub host: String,
    #[builder(default = DEFAULT_WS_PORT)]
    pub ws_port: u16,
    #[builder(default = DEFAULT_WSS_PORT)]
    pub wss_port: u16,
    #[builder(into, default = DEFAULT_SOCKJS_HOST.to_owned())]
    pub sockjs_host: String,
    #[builder(default = DEFAULT_SOCKJS_HTTP_PORT)]
    pub sockjs_http_port: u16,
    #[builder(default = DEFAULT_SOCKJS_HTTPS_PORT)]
    pub sockjs_https_port: u16,
    /// Inactivity after which a ping is sent, unless the transport pings natively
    #[builder(default = DEFAULT_ACTIVITY_TIMEOUT)]
    pub activity_timeout: Duration,
    /// Time allowed for the pong before the connection is closed
    #[builder(default = DEFAULT_PONG_TIMEOUT)]
    pub pong_timeout: Duration,
    /// Time in `connecting` before reporting `unavailable`
    #[builder(default = DEFAULT_UNAVAILABLE_TIMEOUT)]
    pub unavailable_timeout: Duration,
    /// Delay before reconnecting when the service asks to back off
    #[builder(default = DEFAULT_BACKOFF_DELAY)]
    pub backoff_delay: Duration,
    /// Delays between runs of a strategy that failed as a whole
    #[builder(default)]
    pub restart: RestartConfig,
    /// Custom strategy scheme replacing [`Config::default_scheme`]
    pub strategy: Option<Value>,
    #[builder(default)]
    pub disabled_transports: Vec<String>,
    #[builder(default)]
    pub auth: AuthConfig,
    #[builder(default = DEFAULT_TIMELINE_LIMIT)]
    pub timeline_limit: usize,
    #[builder(default)]
    pub transports: TransportRegistry,
    #[builder(default)]
    pub network: Network,
}

impl Default for Config {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl Config {
    /// The scheme used when no custom strategy is configured.
    ///
    /// WebSockets are preferred; when SockJS is compiled in as well it is raced against
    /// them after a short delay, or used alone when WebSockets are unsupported.
    #[must_use]
    pub fn default_scheme(&self) -> Value {
        let ws = json!({
            "type": "sequential",
            "children": [{
                "type": "transport",
                "transport": "ws",
                "host": self.host,
                "unencryptedPort": self.ws_port,
                "encryptedPort": self.wss_port,
            }],
        });
        let sockjs = json!({
            "type": "sequential",
            "children": [{
                "type": "transport",
                "transport": "sockjs",
                "host": self.sockjs_host,
                "unencryptedPort": self.sockjs_http_port,
                "encryptedPort": self.sockjs_https_port,
            }],
        });

        let children = match (cfg!(feature = "ws"), cfg!(feature = "sockjs")) {
            (true, true) => vec![
                json!({
                    "type": "all_supported",
                    "children": [
                        ws,
                        { "type": "delayed", "delay": SOCKJS_FALLBACK_DELAY_MS, "child": sockjs.clone() },
                    ],
                }),
                sockjs,
            ],
            (true, false) => vec![ws],
            (false, true) => vec![sockjs],
            (false, false) => Vec::new(),
        };

        json!({
            "type": "first_supported",
            "loop": true,
            "timeout": STRATEGY_TIMEOUT_MS,
            "timeoutLimit": STRATEGY_TIMEOUT_LIMIT_MS,
            "children": [{ "type": "first_supported", "children": children }],
        })
    }
}

/// Backoff between runs of a strategy that failed as a whole.
///
/// Reset once a connection completes the handshake.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct RestartConfig {
    /// Consecutive failed runs after which the connection enters `failed`.
    /// `None` keeps restarting forever.
    pub max_attempts: Option<u32>,
    /// Delay before the first restart
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for RestartConfig {
    fn default() -> Self {
        Self {
            max_attempts: None,
            initial_delay: DEFAULT_RESTART_INITIAL_DELAY,
            max_delay: DEFAULT_RESTART_MAX_DELAY,
            multiplier: DEFAULT_RESTART_MULTIPLIER,
        }
    }
}

impl From<RestartConfig> for ExponentialBackoff {
    fn from(config: RestartConfig) -> Self {
        ExponentialBackoffBuilder::default()
            .with_initial_interval(config.initial_delay)
            .with_max_interval(config.max_delay)
            .with_multiplier(config.multiplier)
            .with_max_elapsed_time(None) // Attempts are counted by the manager
            .build()
    }
}

#[cfg(test)]
mod tests {
    use backoff::backoff::Backoff as _;

    use super::*;

    #[test]
    fn restarts_are_unlimited_and_start_after_a_second() {
        let config = RestartConfig::default();
        assert!(config.max_attempts.is_none());

        let mut backoff: ExponentialBackoff = config.into();
        let first = backoff.next_backoff().unwrap();
        assert!(first >= Duration::from_millis(500) && first <= Duration::from_millis(1500));
    }

    #[test]
    fn restart_delays_never_run_out() {
        let config = RestartConfig {
            max_attempts: Some(3),
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(400),
            multiplier: 2.0,
        };
        let mut backoff: ExponentialBackoff = config.into();

        // The manager counts attempts, the backoff itself never gives up.
        let delays: Vec<Duration> = (0..50).map_while(|_| backoff.next_backoff()).collect();
        assert_eq!(delays.len(), 50);
        assert!(delays.iter().all(|delay| *delay <= Duration::from_millis(600)));
    }

    #[test]
    fn builder_defaults_match_default() {
        let config = Config::default();

        assert!(!config.encrypted);
        assert_eq!(config.host, DEFAULT_HOST);
        assert_eq!(config.activity_timeout, Duration::from_secs(120));
        assert_eq!(config.pong_timeout, Duration::from_secs(30));
        assert_eq!(config.unavailable_timeout, Duration::from_secs(10));
        assert_eq!(config.timeline_limit, 25);
        assert!(config.strategy.is_none());
    }

    #[test]
    fn default_scheme_carries_hosts_and_timeouts() {
        let config = Config::builder().host("ws.example.com").wss_port(8443).build();
        let scheme = config.default_scheme();

        assert_eq!(scheme["type"], "first_supported");
        assert_eq!(scheme["loop"], true);
        assert_eq!(scheme["timeout"], 15_000);
        assert_eq!(scheme["timeoutLimit"], 60_000);
        assert!(scheme.to_string().contains("ws.example.com"));
    }

    #[cfg(feature = "ws")]
    #[test]
    fn default_scheme_builds_with_default_transports() {
        use crate::strategy::build;

        let config = Config::default();
        let strategy = build(&config.default_scheme(), &config.transports).unwrap();

        assert!(strategy.is_supported());
    }
}
