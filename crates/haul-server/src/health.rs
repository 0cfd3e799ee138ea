//! `/health` endpoint body.

use std::time::Instant;

use serde::Serialize;

/// Live counters reported by `/health`.
#[derive(Clone, Copy, Debug, Default)]
pub struct LiveCounts {
    /// Open WebSocket connections.
    pub connections: usize,
    /// Sessions held by the registry.
    pub sessions: usize,
    /// Jobs not yet in a terminal phase.
    pub jobs: usize,
    /// Artifacts waiting for retrieval.
    pub artifacts: usize,
}

/// Health check response body.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Always `"ok"` when the server is running.
    pub status: String,
    /// Seconds since the server started.
    pub uptime_secs: u64,
    /// Current WebSocket connection count.
    pub connections: usize,
    /// Number of live sessions.
    pub active_sessions: usize,
    /// Number of running jobs.
    pub active_jobs: usize,
    /// Number of artifacts awaiting download.
    pub pending_artifacts: usize,
}

/// Build a health response from live counters.
pub fn health_check(start_time: Instant, counts: LiveCounts) -> HealthResponse {
    HealthResponse {
        status: "ok".into(),
        uptime_secs: start_time.elapsed().as_secs(),
        connections: counts.connections,
        active_sessions: counts.sessions,
        active_jobs: counts.jobs,
        pending_artifacts: counts.artifacts,
    }
}
