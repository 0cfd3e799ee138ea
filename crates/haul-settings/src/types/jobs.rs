//! Job, artifact and source settings.

use serde::{Deserialize, Serialize};

/// Job execution settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct JobSettings {
    /// Jobs allowed to do source work at the same time.
    pub max_concurrent_jobs: usize,
    /// Upper bound on one existence lookup, in milliseconds.
    pub validation_timeout_ms: u64,
    /// Capacity of the progress channel between the source and the job task.
    pub progress_buffer: usize,
}

impl Default for JobSettings {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 8,
            validation_timeout_ms: 10_000,
            progress_buffer: 64,
        }
    }
}

/// Produced artifact settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ArtifactSettings {
    /// Where staging directories and archives are written. Relative paths
    /// resolve under `~/.haul`.
    pub downloads_dir: String,
    /// Unretrieved archives are deleted after this many seconds.
    pub ttl_secs: u64,
    /// Interval of the artifact sweeper, in seconds.
    pub sweep_interval_secs: u64,
}

impl Default for ArtifactSettings {
    fn default() -> Self {
        Self {
            downloads_dir: "downloads".to_string(),
            ttl_secs: 600,
            sweep_interval_secs: 60,
        }
    }
}

/// Settings for the built-in simulated artifact source.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SourceSettings {
    /// Layers per image.
    pub layer_count: u32,
    /// Size of each layer in bytes.
    pub layer_bytes: u64,
    /// Bytes written per progress update.
    pub chunk_bytes: u64,
    /// Pause between chunks, in milliseconds.
    pub chunk_delay_ms: u64,
    /// Archive bytes between two `checkpoint` lines.
    pub checkpoint_bytes: u64,
    /// Simulated registry round-trip for existence lookups, in milliseconds.
    pub lookup_delay_ms: u64,
    /// References (canonical or short form) reported as missing.
    pub unavailable: Vec<String>,
}

impl Default for SourceSettings {
    fn default() -> Self {
        Self {
            layer_count: 3,
            layer_bytes: 1_048_576,
            chunk_bytes: 131_072,
            chunk_delay_ms: 20,
            checkpoint_bytes: 262_144,
            lookup_delay_ms: 50,
            unavailable: Vec::new(),
        }
    }
}
