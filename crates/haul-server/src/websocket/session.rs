//! Lifecycle of one WebSocket connection, from upgrade to disconnect.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use metrics::{counter, gauge, histogram};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::connection::ClientConnection;
use super::handler::handle_message;
use super::heartbeat::{HeartbeatResult, run_heartbeat};
use crate::metrics::{WS_CONNECTION_DURATION_SECONDS, WS_CONNECTIONS_ACTIVE, WS_CONNECTIONS_TOTAL};
use crate::server::AppState;
use crate::session::Session;

/// Drive a connected client until either side goes away.
///
/// The connection is attached to its session's room before anything is read,
/// so the first frame the client sees is the `session` greeting. On exit the
/// connection is always detached and unregistered.
#[instrument(skip_all, fields(connection_id = %connection.id, room = %session.room))]
pub async fn run_ws_session(
    ws: WebSocket,
    session: Arc<Session>,
    resumed: bool,
    connection: Arc<ClientConnection>,
    mut send_rx: mpsc::Receiver<Arc<String>>,
    state: AppState,
) {
    let (mut ws_tx, mut ws_rx) = ws.split();
    let closed = state.shutdown.token().child_token();

    info!(resumed, "client connected");
    counter!(WS_CONNECTIONS_TOTAL).increment(1);
    gauge!(WS_CONNECTIONS_ACTIVE).increment(1.0);

    state.connections.add(Arc::clone(&connection));
    state.sessions.attach(&session, resumed, &connection);

    let ping_every = state.config.heartbeat_interval();
    let outbound_closed = closed.clone();
    let outbound = tokio::spawn(async move {
        let mut ping = tokio::time::interval(ping_every.max(Duration::from_millis(10)));
        let _ = ping.tick().await;
        loop {
            tokio::select! {
                msg = send_rx.recv() => {
                    let Some(text) = msg else { break };
                    if ws_tx.send(Message::Text(text.as_str().into())).await.is_err() {
                        break;
                    }
                }
                _ = ping.tick() => {
                    if ws_tx.send(Message::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                }
                () = outbound_closed.cancelled() => {
                    let _ = ws_tx.send(Message::Close(None)).await;
                    break;
                }
            }
        }
    });

    let heartbeat = tokio::spawn(watch_liveness(
        Arc::clone(&connection),
        state.clone(),
        closed.clone(),
    ));

    loop {
        let frame = tokio::select! {
            frame = ws_rx.next() => frame,
            () = closed.cancelled() => break,
        };
        let Some(Ok(msg)) = frame else { break };
        match msg {
            Message::Text(text) => handle_message(text.as_str(), &connection, &state),
            Message::Binary(data) => match std::str::from_utf8(&data) {
                Ok(text) => handle_message(text, &connection, &state),
                Err(_) => debug!(len = data.len(), "ignoring non-UTF8 binary frame"),
            },
            Message::Ping(_) | Message::Pong(_) => connection.mark_alive(),
            Message::Close(_) => {
                debug!("client sent close frame");
                break;
            }
        }
    }

    closed.cancel();
    let _ = heartbeat.await;
    let _ = outbound.await;

    state.sessions.detach(&connection);
    state.connections.remove(&connection.id);

    info!(dropped = connection.drop_count(), "client disconnected");
    gauge!(WS_CONNECTIONS_ACTIVE).decrement(1.0);
    histogram!(WS_CONNECTION_DURATION_SECONDS).record(connection.age().as_secs_f64());
}

async fn watch_liveness(connection: Arc<ClientConnection>, state: AppState, closed: CancellationToken) {
    let result = run_heartbeat(
        connection,
        state.config.heartbeat_interval(),
        state.config.heartbeat_timeout(),
        closed.clone(),
    )
    .await;
    if result == HeartbeatResult::TimedOut {
        warn!("client unresponsive, disconnecting");
        closed.cancel();
    }
}
