//! Network, session and logging settings.

use serde::{Deserialize, Serialize};

/// HTTP/WebSocket listener settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// Listen port. `0` picks a free port.
    pub port: u16,
    /// Interval between WebSocket pings, in seconds.
    pub heartbeat_interval_secs: u64,
    /// Disconnect after this long without a pong, in seconds.
    pub heartbeat_timeout_secs: u64,
    /// Capacity of each connection's outbound queue.
    pub send_queue_capacity: usize,
    /// How long shutdown waits for running jobs, in seconds.
    pub shutdown_timeout_secs: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5000,
            heartbeat_interval_secs: 30,
            heartbeat_timeout_secs: 90,
            send_queue_capacity: 256,
            shutdown_timeout_secs: 10,
        }
    }
}

/// Session lifetime settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionSettings {
    /// How long an unobserved, idle session survives before it is
    /// destroyed, in seconds.
    pub reconnect_grace_secs: u64,
    /// Interval of the session sweeper, in seconds.
    pub sweep_interval_secs: u64,
    /// Name of the cookie carrying the session token.
    pub cookie_name: String,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            reconnect_grace_secs: 300,
            sweep_interval_secs: 30,
            cookie_name: "haul_session".to_string(),
        }
    }
}

/// Logging settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default filter directive when `RUST_LOG` is unset.
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}
