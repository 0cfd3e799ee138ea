//! HTTP routes: socket upgrade, existence checks, job start, download,
//! health and metrics.

use std::sync::Arc;

use axum::Json;
use axum::body::Body;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, Query, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use haul_core::{ArtifactReference, ConnectionId, HaulError, RoomId};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::io::ReaderStream;
use tracing::{debug, info};

use crate::health::{LiveCounts, health_check};
use crate::server::AppState;
use crate::validation::ValidationOutcome;
use crate::websocket::connection::ClientConnection;
use crate::websocket::session::run_ws_session;

/// Code returned when an existence check lost to a newer one.
pub const SUPERSEDED: &str = "SUPERSEDED";
/// Code returned when `?connection=` names no open socket.
pub const UNKNOWN_CONNECTION: &str = "UNKNOWN_CONNECTION";

/// Error returned by HTTP handlers.
#[derive(Debug)]
pub enum ApiError {
    /// A domain error.
    Haul(HaulError),
    /// A newer check was issued on the same connection.
    Superseded {
        /// Sequence of the discarded check.
        sequence: u64,
    },
    /// No open connection has this id.
    UnknownConnection(String),
}

impl From<HaulError> for ApiError {
    fn from(error: HaulError) -> Self {
        Self::Haul(error)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            Self::Haul(error) => match error {
                HaulError::InvalidReference { .. } => StatusCode::BAD_REQUEST,
                HaulError::ReferenceNotFound { .. }
                | HaulError::ArtifactConsumedOrMissing { .. }
                | HaulError::UnknownRoom(_)
                | HaulError::UnknownSession => StatusCode::NOT_FOUND,
                HaulError::JobAlreadyRunning { .. } => StatusCode::CONFLICT,
                HaulError::LookupFailed { .. } => StatusCode::BAD_GATEWAY,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
            Self::Superseded { .. } => StatusCode::CONFLICT,
            Self::UnknownConnection(_) => StatusCode::NOT_FOUND,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = match self {
            Self::Haul(error) => json!({ "code": error.code(), "message": error.to_string() }),
            Self::Superseded { sequence } => json!({
                "code": SUPERSEDED,
                "message": format!("check {sequence} was superseded by a newer one"),
            }),
            Self::UnknownConnection(id) => json!({
                "code": UNKNOWN_CONNECTION,
                "message": format!("no open connection '{id}'"),
            }),
        };
        (status, Json(body)).into_response()
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct WsParams {
    token: Option<String>,
}

/// Upgrade to a WebSocket bound to the presented (or a fresh) session.
pub(crate) async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<WsParams>,
    jar: CookieJar,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let cookie_name = state.config.cookie_name.clone();
    let presented = params
        .token
        .filter(|t| !t.is_empty())
        .or_else(|| jar.get(&cookie_name).map(|c| c.value().to_owned()));
    let (session, resumed) = state.sessions.resolve(presented.as_deref());

    let cookie = Cookie::build((cookie_name, session.token.to_string()))
        .path("/")
        .same_site(SameSite::Lax);
    let jar = jar.add(cookie);

    let (tx, rx) = mpsc::channel(state.config.send_queue_capacity);
    let connection = Arc::new(ClientConnection::new(ConnectionId::new(), tx));
    let upgrade = ws.on_upgrade(move |socket| {
        run_ws_session(socket, session, resumed, connection, rx, state)
    });
    (jar, upgrade)
}

#[derive(Debug, Deserialize)]
pub(crate) struct ExistsParams {
    connection: Option<String>,
}

/// `GET /api/exists/{*reference}`
pub(crate) async fn exists_handler(
    State(state): State<AppState>,
    Path(raw): Path<String>,
    Query(params): Query<ExistsParams>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let reference = ArtifactReference::parse(&raw)?;

    let exists = match params.connection {
        Some(id) => {
            let connection = state
                .connections
                .get(&ConnectionId::from(id.as_str()))
                .ok_or(ApiError::UnknownConnection(id))?;
            match state
                .validation
                .check_exists(connection.validation(), &reference, |_, _| {})
                .await
            {
                ValidationOutcome::Current { result, .. } => result?,
                ValidationOutcome::Superseded { sequence } => {
                    return Err(ApiError::Superseded { sequence });
                }
            }
        }
        None => state.validation.lookup(&reference).await?,
    };

    debug!(%reference, exists, "existence checked");
    Ok(Json(json!({ "exists": exists, "reference": reference.to_string() })))
}

/// `GET /api/pull/{room}/{*reference}`
pub(crate) async fn pull_handler(
    State(state): State<AppState>,
    Path((room, raw)): Path<(String, String)>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    let reference = ArtifactReference::parse(&raw)?;
    let job_id = state.jobs.start_job(&RoomId::from(room), reference)?;
    Ok((StatusCode::CREATED, Json(json!({ "job_id": job_id }))))
}

#[derive(Debug, Deserialize)]
pub(crate) struct DownloadParams {
    room: Option<String>,
}

/// `GET /api/download/{*tar_path}`
pub(crate) async fn download_handler(
    State(state): State<AppState>,
    Path(tar_path): Path<String>,
    Query(params): Query<DownloadParams>,
    jar: CookieJar,
) -> Result<Response, ApiError> {
    let missing = || HaulError::ArtifactConsumedOrMissing {
        tar_path: tar_path.clone(),
    };
    let room = params
        .room
        .filter(|r| !r.is_empty())
        .or_else(|| jar.get(&state.config.cookie_name).map(|c| c.value().to_owned()))
        .map(RoomId::from)
        .ok_or_else(missing)?;

    let artifact = state.handoff.retrieve(&room, &tar_path).await?;
    info!(room = %room, %tar_path, size = artifact.size, "streaming artifact");

    let headers = [
        (header::CONTENT_TYPE, "application/x-tar".to_owned()),
        (
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{}\"", artifact.file_name),
        ),
        (header::CONTENT_LENGTH, artifact.size.to_string()),
    ];
    let body = Body::from_stream(ReaderStream::new(artifact.file));
    Ok((headers, body).into_response())
}

/// `GET /health`
pub(crate) async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let counts = LiveCounts {
        connections: state.connections.count(),
        sessions: state.sessions.count(),
        jobs: state.broadcaster.active_jobs(),
        artifacts: state.handoff.pending_count(),
    };
    Json(health_check(state.start_time, counts))
}

/// `GET /metrics`
pub(crate) async fn metrics_handler(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            crate::metrics::render(handle),
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}
