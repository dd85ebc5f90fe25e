//! Client configuration.

use std::time::Duration;

/// Idle eviction window, in milliseconds.
pub const KEY_MAX_IDLE_TIME: &str = "ipc.client.connection.maxidletime";
/// Connect retry cap for non-timeout I/O failures.
pub const KEY_MAX_RETRIES: &str = "ipc.client.connect.max.retries";
/// Disable Nagle's algorithm on new sockets.
pub const KEY_TCP_NODELAY: &str = "ipc.client.tcpnodelay";
/// Read timeout and ping cadence, in milliseconds.
pub const KEY_PING_INTERVAL: &str = "ipc.ping.interval";

/// Settings that control the behavior of a [`Client`](crate::Client).
///
/// Deployments that carry flat key/value configuration can feed the dotted
/// keys above through [`apply`](Self::apply); everything else uses the
/// builder methods.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// How long a connection with no in-flight calls stays in the pool
    /// before its reader evicts it.
    pub max_idle_time: Duration,

    /// Connect retry cap for I/O failures other than connect timeouts.
    /// Timeouts have their own fixed cap.
    pub max_retries: u32,

    /// Disable Nagle's algorithm on new sockets.
    pub tcp_nodelay: bool,

    /// Read timeout on the response stream. An idle but healthy connection
    /// emits one ping per interval instead of failing the read.
    pub ping_interval: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            max_idle_time: Duration::from_secs(10),
            max_retries: 10,
            tcp_nodelay: false,
            ping_interval: Duration::from_secs(60),
        }
    }
}

impl ClientConfig {
    /// Returns the default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the idle eviction window.
    pub fn with_max_idle_time(mut self, max_idle_time: Duration) -> Self {
        self.max_idle_time = max_idle_time;
        self
    }

    /// Set the connect retry cap for non-timeout I/O failures.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Enable or disable Nagle's algorithm on new sockets.
    pub fn with_tcp_nodelay(mut self, tcp_nodelay: bool) -> Self {
        self.tcp_nodelay = tcp_nodelay;
        self
    }

    /// Set the read timeout and ping cadence.
    pub fn with_ping_interval(mut self, ping_interval: Duration) -> Self {
        self.ping_interval = ping_interval;
        self
    }

    /// Apply one dotted configuration key.
    ///
    /// Returns `true` if the key was recognized. Unparseable values are
    /// logged and leave the current setting untouched.
    pub fn apply(&mut self, key: &str, value: &str) -> bool {
        match key {
            KEY_MAX_IDLE_TIME => {
                if let Some(ms) = parse_millis(key, value) {
                    self.max_idle_time = ms;
                }
                true
            }
            KEY_MAX_RETRIES => {
                match value.parse::<u32>() {
                    Ok(n) => self.max_retries = n,
                    Err(_) => tracing::warn!(key, value, "ignoring unparseable config value"),
                }
                true
            }
            KEY_TCP_NODELAY => {
                match value.parse::<bool>() {
                    Ok(b) => self.tcp_nodelay = b,
                    Err(_) => tracing::warn!(key, value, "ignoring unparseable config value"),
                }
                true
            }
            KEY_PING_INTERVAL => {
                if let Some(ms) = parse_millis(key, value) {
                    self.ping_interval = ms;
                }
                true
            }
            _ => false,
        }
    }

    /// Apply every recognized key from an iterator of pairs.
    pub fn apply_all<'a>(mut self, pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        for (key, value) in pairs {
            self.apply(key, value);
        }
        self
    }
}

fn parse_millis(key: &str, value: &str) -> Option<Duration> {
    match value.parse::<u64>() {
        Ok(ms) => Some(Duration::from_millis(ms)),
        Err(_) => {
            tracing::warn!(key, value, "ignoring unparseable config value");
            None
        }
    }
}
