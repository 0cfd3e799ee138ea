//! Server configuration.

use std::path::PathBuf;
use std::time::Duration;

use haul_settings::{HaulSettings, resolve_data_path};

/// Runtime configuration for [`HaulServer`](crate::server::HaulServer).
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Host to bind (default `"127.0.0.1"`).
    pub host: String,
    /// Port to bind (default `0` for auto-assign).
    pub port: u16,
    /// Heartbeat interval in seconds.
    pub heartbeat_interval_secs: u64,
    /// Disconnect after this many seconds without a pong.
    pub heartbeat_timeout_secs: u64,
    /// Outbound queue capacity per connection.
    pub send_queue_capacity: usize,
    /// Drain timeout on shutdown, in seconds.
    pub shutdown_timeout_secs: u64,
    /// Session cookie name.
    pub cookie_name: String,
    /// Grace period before an idle, unobserved session is destroyed.
    pub reconnect_grace_secs: u64,
    /// Session sweeper interval in seconds.
    pub session_sweep_interval_secs: u64,
    /// Jobs allowed to run source work concurrently.
    pub max_concurrent_jobs: usize,
    /// Existence lookup timeout in milliseconds.
    pub validation_timeout_ms: u64,
    /// Capacity of source → job progress channels.
    pub progress_buffer: usize,
    /// Root for job work directories and archives.
    pub downloads_dir: PathBuf,
    /// Unretrieved artifacts are deleted after this many seconds.
    pub artifact_ttl_secs: u64,
    /// Artifact sweeper interval in seconds.
    pub artifact_sweep_interval_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 0,
            heartbeat_interval_secs: 30,
            heartbeat_timeout_secs: 90,
            send_queue_capacity: 256,
            shutdown_timeout_secs: 10,
            cookie_name: "haul_session".into(),
            reconnect_grace_secs: 300,
            session_sweep_interval_secs: 30,
            max_concurrent_jobs: 8,
            validation_timeout_ms: 10_000,
            progress_buffer: 64,
            downloads_dir: std::env::temp_dir().join("haul-downloads"),
            artifact_ttl_secs: 600,
            artifact_sweep_interval_secs: 60,
        }
    }
}

impl ServerConfig {
    /// Build from loaded settings.
    pub fn from_settings(settings: &HaulSettings) -> Self {
        Self {
            host: settings.server.host.clone(),
            port: settings.server.port,
            heartbeat_interval_secs: settings.server.heartbeat_interval_secs,
            heartbeat_timeout_secs: settings.server.heartbeat_timeout_secs,
            send_queue_capacity: settings.server.send_queue_capacity,
            shutdown_timeout_secs: settings.server.shutdown_timeout_secs,
            cookie_name: settings.sessions.cookie_name.clone(),
            reconnect_grace_secs: settings.sessions.reconnect_grace_secs,
            session_sweep_interval_secs: settings.sessions.sweep_interval_secs,
            max_concurrent_jobs: settings.jobs.max_concurrent_jobs,
            validation_timeout_ms: settings.jobs.validation_timeout_ms,
            progress_buffer: settings.jobs.progress_buffer,
            downloads_dir: resolve_data_path(&settings.artifacts.downloads_dir),
            artifact_ttl_secs: settings.artifacts.ttl_secs,
            artifact_sweep_interval_secs: settings.artifacts.sweep_interval_secs,
        }
    }

    /// `host:port` bind address.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Heartbeat ping interval.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    /// Heartbeat timeout.
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }

    /// Session reconnect grace.
    pub fn reconnect_grace(&self) -> Duration {
        Duration::from_secs(self.reconnect_grace_secs)
    }

    /// Existence lookup timeout.
    pub fn validation_timeout(&self) -> Duration {
        Duration::from_millis(self.validation_timeout_ms)
    }

    /// Artifact time-to-live.
    pub fn artifact_ttl(&self) -> Duration {
        Duration::from_secs(self.artifact_ttl_secs)
    }

    /// Shutdown drain timeout.
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}
