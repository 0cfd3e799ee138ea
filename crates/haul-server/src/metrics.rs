//! Prometheus metrics recorder and metric names.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing::info;

/// Install the Prometheus metrics recorder (global).
///
/// Must be called once at startup before any metrics are recorded.
pub fn install_recorder() -> PrometheusHandle {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("failed to install metrics recorder");
    info!("prometheus metrics recorder installed");
    handle
}

/// Render Prometheus text format from the installed recorder.
pub fn render(handle: &PrometheusHandle) -> String {
    handle.render()
}

/// WebSocket connections opened total (counter).
pub const WS_CONNECTIONS_TOTAL: &str = "ws_connections_total";
/// Active WebSocket connections (gauge).
pub const WS_CONNECTIONS_ACTIVE: &str = "ws_connections_active";
/// WebSocket connection lifetime (histogram).
pub const WS_CONNECTION_DURATION_SECONDS: &str = "ws_connection_duration_seconds";
/// Jobs started total (counter).
pub const JOBS_STARTED_TOTAL: &str = "jobs_started_total";
/// Jobs failed total (counter, labels: code).
pub const JOBS_FAILED_TOTAL: &str = "jobs_failed_total";
/// Jobs not yet terminal (gauge).
pub const JOBS_ACTIVE: &str = "jobs_active";
/// Job wall time from start to terminal phase (histogram).
pub const JOB_DURATION_SECONDS: &str = "job_duration_seconds";
/// Validation results discarded because a newer check was issued (counter).
pub const VALIDATIONS_SUPERSEDED_TOTAL: &str = "validations_superseded_total";
/// Artifacts downloaded (counter).
pub const ARTIFACTS_RETRIEVED_TOTAL: &str = "artifacts_retrieved_total";
/// Artifacts deleted by the TTL sweeper (counter).
pub const ARTIFACTS_EXPIRED_TOTAL: &str = "artifacts_expired_total";
/// Room events dropped on a full or closed connection queue (counter).
pub const BROADCAST_DROPS_TOTAL: &str = "broadcast_drops_total";
/// Sessions destroyed by the sweeper (counter).
pub const SESSIONS_EXPIRED_TOTAL: &str = "sessions_expired_total";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_without_global_install() {
        let handle = PrometheusBuilder::new().build_recorder().handle();
        let output = render(&handle);
        assert!(output.is_empty() || output.contains('\n'));
    }

    #[test]
    fn metric_constants_are_snake_case() {
        let names = [
            WS_CONNECTIONS_TOTAL,
            WS_CONNECTIONS_ACTIVE,
            WS_CONNECTION_DURATION_SECONDS,
            JOBS_STARTED_TOTAL,
            JOBS_FAILED_TOTAL,
            JOBS_ACTIVE,
            JOB_DURATION_SECONDS,
            VALIDATIONS_SUPERSEDED_TOTAL,
            ARTIFACTS_RETRIEVED_TOTAL,
            ARTIFACTS_EXPIRED_TOTAL,
            BROADCAST_DROPS_TOTAL,
            SESSIONS_EXPIRED_TOTAL,
        ];
        for name in names {
            assert!(
                name.chars().all(|c| c.is_ascii_lowercase() || c == '_'),
                "metric name '{name}' must be snake_case"
            );
        }
    }
}
