//! `HaulServer`: wires the components together and serves them over Axum.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::Router;
use axum::routing::get;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::api;
use crate::broadcast::ProgressBroadcaster;
use crate::config::ServerConfig;
use crate::handoff::CompletionHandoff;
use crate::jobs::JobCoordinator;
use crate::session::SessionRegistry;
use crate::shutdown::ShutdownCoordinator;
use crate::source::ArtifactSource;
use crate::validation::ValidationDebouncer;
use crate::websocket::connection::ConnectionRegistry;

/// Shared state accessible from Axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// Server configuration.
    pub config: Arc<ServerConfig>,
    /// Open sockets by connection id.
    pub connections: Arc<ConnectionRegistry>,
    /// Session tokens and their rooms.
    pub sessions: Arc<SessionRegistry>,
    /// Rooms and ordered event delivery.
    pub broadcaster: Arc<ProgressBroadcaster>,
    /// Debounced existence checks.
    pub validation: Arc<ValidationDebouncer>,
    /// Job start and execution.
    pub jobs: JobCoordinator,
    /// Ready archives awaiting download.
    pub handoff: Arc<CompletionHandoff>,
    /// Shutdown coordinator.
    pub shutdown: Arc<ShutdownCoordinator>,
    /// Prometheus handle, when a recorder is installed.
    pub metrics: Option<PrometheusHandle>,
    /// When the server started.
    pub start_time: Instant,
}

/// The haul server.
pub struct HaulServer {
    state: AppState,
}

impl HaulServer {
    /// Create a server fetching from `source`.
    pub fn new(
        config: ServerConfig,
        source: Arc<dyn ArtifactSource>,
        metrics: Option<PrometheusHandle>,
    ) -> Self {
        let config = Arc::new(config);
        let shutdown = Arc::new(ShutdownCoordinator::new());
        let broadcaster = Arc::new(ProgressBroadcaster::new());
        let sessions = Arc::new(SessionRegistry::new(
            Arc::clone(&broadcaster),
            config.reconnect_grace(),
        ));
        let handoff = Arc::new(CompletionHandoff::new(
            Arc::clone(&broadcaster),
            config.artifact_ttl(),
        ));
        let validation = Arc::new(ValidationDebouncer::new(
            Arc::clone(&source),
            config.validation_timeout(),
        ));
        let jobs = JobCoordinator::new(
            Arc::clone(&broadcaster),
            Arc::clone(&handoff),
            source,
            config.max_concurrent_jobs,
            config.downloads_dir.clone(),
            config.progress_buffer,
            shutdown.tracker(),
        );

        Self {
            state: AppState {
                config,
                connections: Arc::new(ConnectionRegistry::new()),
                sessions,
                broadcaster,
                validation,
                jobs,
                handoff,
                shutdown,
                metrics,
                start_time: Instant::now(),
            },
        }
    }

    /// Build the Axum router with all routes.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/ws", get(api::ws_handler))
            .route("/api/exists/{*reference}", get(api::exists_handler))
            .route("/api/pull/{room}/{*reference}", get(api::pull_handler))
            .route("/api/download/{*tar_path}", get(api::download_handler))
            .route("/health", get(api::health_handler))
            .route("/metrics", get(api::metrics_handler))
            .with_state(self.state.clone())
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive())
    }

    /// Bind, start the sweepers and serve until shutdown is signalled.
    pub async fn listen(&self) -> std::io::Result<(SocketAddr, JoinHandle<()>)> {
        tokio::fs::create_dir_all(&self.state.config.downloads_dir).await?;

        let listener = TcpListener::bind(self.state.config.bind_addr()).await?;
        let addr = listener.local_addr()?;
        self.start_sweepers();

        let router = self.router();
        let token = self.state.shutdown.token();
        let handle = tokio::spawn(async move {
            let served = axum::serve(listener, router)
                .with_graceful_shutdown(async move { token.cancelled().await })
                .await;
            if let Err(error) = served {
                warn!(%error, "server stopped with error");
            }
        });

        info!(%addr, downloads_dir = %self.state.config.downloads_dir.display(), "haul server listening");
        Ok((addr, handle))
    }

    fn start_sweepers(&self) {
        let config = &self.state.config;

        let sessions = Arc::clone(&self.state.sessions);
        let _ = self.state.shutdown.spawn(sweep_every(
            Duration::from_secs(config.session_sweep_interval_secs.max(1)),
            self.state.shutdown.token(),
            move || {
                let sessions = Arc::clone(&sessions);
                async move { sessions.sweep() }
            },
        ));

        let handoff = Arc::clone(&self.state.handoff);
        let _ = self.state.shutdown.spawn(sweep_every(
            Duration::from_secs(config.artifact_sweep_interval_secs.max(1)),
            self.state.shutdown.token(),
            move || {
                let handoff = Arc::clone(&handoff);
                async move { handoff.sweep_expired().await }
            },
        ));
    }

    /// Shared handler state.
    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Get the shutdown coordinator.
    pub fn shutdown(&self) -> &Arc<ShutdownCoordinator> {
        &self.state.shutdown
    }

    /// Get the server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.state.config
    }
}

/// Run `sweep` every `period` until `cancel` fires.
async fn sweep_every<F, Fut>(period: Duration, cancel: tokio_util::sync::CancellationToken, sweep: F)
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = usize>,
{
    let mut ticker = tokio::time::interval(period);
    let _ = ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let removed = sweep().await;
                if removed > 0 {
                    debug!(removed, "sweep");
                }
            }
            () = cancel.cancelled() => break,
        }
    }
}
