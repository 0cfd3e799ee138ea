//! Client → server frame dispatch.

use std::sync::Arc;

use haul_core::errors::{INVALID_MESSAGE, UNKNOWN_ROOM};
use haul_core::{ArtifactReference, HaulError, ServerEvent};
use serde::Deserialize;
use tracing::{debug, instrument, warn};

use super::connection::ClientConnection;
use crate::server::AppState;

/// Frames a client may send.
#[derive(Debug, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Bind this connection to the room of `token`.
    Join {
        /// Session token to resume.
        token: String,
    },
    /// Stop observing the current room. The session stays resumable.
    Leave,
    /// Debounced existence check.
    CheckExists {
        /// Raw reference text.
        reference: String,
    },
    /// Start a job in this connection's room.
    StartJob {
        /// Raw reference text.
        reference: String,
    },
}

/// Handle one text frame. Replies go onto the connection's queue.
#[instrument(skip_all, fields(connection_id = %connection.id))]
pub fn handle_message(text: &str, connection: &Arc<ClientConnection>, state: &AppState) {
    let message: ClientMessage = match serde_json::from_str(text) {
        Ok(message) => message,
        Err(error) => {
            debug!(%error, "unparseable client frame");
            let _ = connection.send_event(&ServerEvent::error(
                INVALID_MESSAGE,
                format!("invalid message: {error}"),
            ));
            return;
        }
    };

    match message {
        ClientMessage::Join { token } => {
            let (session, resumed) = state.sessions.join(&token, connection);
            debug!(room = %session.room, resumed, "joined");
        }
        ClientMessage::Leave => leave(connection, state),
        ClientMessage::CheckExists { reference } => check_exists(reference, connection, state),
        ClientMessage::StartJob { reference } => start_job(&reference, connection, state),
    }
}

fn check_exists(raw: String, connection: &Arc<ClientConnection>, state: &AppState) {
    let reference = match ArtifactReference::parse(&raw) {
        Ok(reference) => reference,
        Err(error) => {
            // An invalid entry still supersedes whatever was in flight.
            let stream = connection.validation();
            let (sequence, _) = stream.issue();
            let _ = stream.deliver_if_current(sequence, || {
                connection.send_event(&ServerEvent::exists_error(
                    sequence,
                    &raw,
                    error.code(),
                    &error.to_string(),
                ))
            });
            return;
        }
    };

    let connection = Arc::clone(connection);
    let validation = Arc::clone(&state.validation);
    let _ = state.shutdown.spawn(async move {
        let canonical = reference.to_string();
        let _ = validation
            .check_exists(connection.validation(), &reference, |sequence, result| {
                let event = match result {
                    Ok(exists) => ServerEvent::exists_result(sequence, &canonical, *exists),
                    Err(error) => ServerEvent::exists_error(
                        sequence,
                        &canonical,
                        error.code(),
                        &error.to_string(),
                    ),
                };
                let _ = connection.send_event(&event);
            })
            .await;
    });
}

fn leave(connection: &ClientConnection, state: &AppState) {
    let Some(room) = connection.room() else {
        let _ = connection.send_event(&ServerEvent::error(
            UNKNOWN_ROOM,
            "connection is not bound to a room",
        ));
        return;
    };
    state.sessions.detach(connection);
    debug!(room = %room, "left");
    let _ = connection.send_event(&ServerEvent::left(&room));
}

fn start_job(raw: &str, connection: &ClientConnection, state: &AppState) {
    let Some(room) = connection.room() else {
        let _ = connection.send_event(&ServerEvent::error(
            UNKNOWN_ROOM,
            "connection is not bound to a room",
        ));
        return;
    };

    let started = ArtifactReference::parse(raw).and_then(|reference| {
        let job_id = state.jobs.start_job(&room, reference.clone())?;
        Ok::<_, HaulError>((job_id, reference))
    });
    match started {
        Ok((job_id, reference)) => {
            let _ = connection.send_event(&ServerEvent::job_started(&job_id, &reference));
        }
        Err(error) => {
            warn!(room = %room, code = error.code(), %error, "start_job rejected");
            let _ = connection.send_event(&ServerEvent::error(error.code(), error.to_string()));
        }
    }
}
