//! Settings type definitions.
//!
//! All types use camelCase field names and `#[serde(default)]`, so a
//! settings file only needs the keys it changes.

mod jobs;
mod server;

pub use jobs::*;
pub use server::*;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings type.
///
/// ```json
/// {
///   "server": { "port": 8000 },
///   "jobs": { "maxConcurrentJobs": 2 }
/// }
/// ```
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HaulSettings {
    /// Listener settings.
    pub server: ServerSettings,
    /// Session lifetime.
    pub sessions: SessionSettings,
    /// Job execution limits.
    pub jobs: JobSettings,
    /// Produced archives.
    pub artifacts: ArtifactSettings,
    /// Simulated source behaviour.
    pub source: SourceSettings,
    /// Logging.
    pub logging: LoggingSettings,
}

impl HaulSettings {
    /// Reject values that deserialize fine but cannot work.
    pub fn validate(&self) -> Result<()> {
        let checks: [(bool, &str); 8] = [
            (self.jobs.max_concurrent_jobs == 0, "jobs.maxConcurrentJobs must be at least 1"),
            (self.server.send_queue_capacity == 0, "server.sendQueueCapacity must be at least 1"),
            (self.server.heartbeat_interval_secs == 0, "server.heartbeatIntervalSecs must be at least 1"),
            (self.sessions.sweep_interval_secs == 0, "sessions.sweepIntervalSecs must be at least 1"),
            (self.artifacts.sweep_interval_secs == 0, "artifacts.sweepIntervalSecs must be at least 1"),
            (self.source.layer_count == 0, "source.layerCount must be at least 1"),
            (self.source.chunk_bytes == 0, "source.chunkBytes must be at least 1"),
            (
                self.server.heartbeat_timeout_secs < self.server.heartbeat_interval_secs,
                "server.heartbeatTimeoutSecs must not be shorter than the interval",
            ),
        ];
        match checks.into_iter().find(|(failed, _)| *failed) {
            Some((_, message)) => Err(SettingsError::InvalidValue(message.to_string())),
            None => Ok(()),
        }
    }
}
