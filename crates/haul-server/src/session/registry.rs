//! Session registry.
//!
//! A session token is the only identity a browser keeps across reconnects.
//! Each session owns exactly one room; the room outlives individual
//! connections and is only torn down by [`SessionRegistry::sweep`] once it
//! has been unobserved and jobless for the reconnect grace period.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use haul_core::{HaulError, RoomId, ServerEvent, SessionToken};
use metrics::counter;
use tracing::{debug, info};

use crate::broadcast::ProgressBroadcaster;
use crate::metrics::SESSIONS_EXPIRED_TOTAL;
use crate::websocket::connection::ClientConnection;

/// A browser identity and the room it owns.
#[derive(Debug)]
pub struct Session {
    /// Opaque token the browser presents.
    pub token: SessionToken,
    /// Room the token maps to.
    pub room: RoomId,
    /// When the token was issued.
    pub created_at: DateTime<Utc>,
}

impl Session {
    fn issue() -> Self {
        let token = SessionToken::generate();
        Self {
            room: token.room(),
            token,
            created_at: Utc::now(),
        }
    }
}

/// Token → session map.
pub struct SessionRegistry {
    sessions: DashMap<SessionToken, Arc<Session>>,
    broadcaster: Arc<ProgressBroadcaster>,
    grace: Duration,
}

impl SessionRegistry {
    /// Create a registry whose rooms live in `broadcaster`.
    pub fn new(broadcaster: Arc<ProgressBroadcaster>, grace: Duration) -> Self {
        Self {
            sessions: DashMap::new(),
            broadcaster,
            grace,
        }
    }

    /// Find the session for `presented`, or issue a fresh one.
    ///
    /// The flag is `true` when an existing session was resumed. Unknown and
    /// expired tokens are replaced silently.
    pub fn resolve(&self, presented: Option<&str>) -> (Arc<Session>, bool) {
        if let Some(token) = presented.filter(|t| !t.is_empty()) {
            if let Ok(session) = self.lookup(&SessionToken::from(token)) {
                return (session, true);
            }
            debug!("presented token unknown, issuing a new one");
        }

        let session = Arc::new(Session::issue());
        let _ = self.broadcaster.open(&session.room);
        let _ = self
            .sessions
            .insert(session.token.clone(), Arc::clone(&session));
        info!(room = %session.room, "session created");
        (session, false)
    }

    /// Look up a live session.
    pub fn lookup(&self, token: &SessionToken) -> Result<Arc<Session>, HaulError> {
        self.sessions
            .get(token)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(HaulError::UnknownSession)
    }

    /// Make `connection` the observer of the session's room.
    ///
    /// Sends the `session` greeting followed by a job snapshot. A connection
    /// that was observing the room before is told it was displaced.
    pub fn attach(&self, session: &Arc<Session>, resumed: bool, connection: &Arc<ClientConnection>) {
        let greeting = ServerEvent::session(&session.token, &session.room, resumed, &connection.id);
        self.attach_with(session, connection, &greeting);
    }

    /// Move `connection` to the room of `presented`, answering with `joined`.
    /// An unknown token gets a fresh session, as on connect.
    pub fn join(&self, presented: &str, connection: &Arc<ClientConnection>) -> (Arc<Session>, bool) {
        self.detach(connection);
        let (session, resumed) = self.resolve(Some(presented));
        let greeting = ServerEvent::joined(&session.token, &session.room, resumed);
        self.attach_with(&session, connection, &greeting);
        (session, resumed)
    }

    fn attach_with(&self, session: &Arc<Session>, connection: &Arc<ClientConnection>, greeting: &ServerEvent) {
        connection.bind_room(session.room.clone());
        let displaced = loop {
            match self.broadcaster.open(&session.room).attach(Arc::clone(connection), greeting) {
                Ok(displaced) => break displaced,
                Err(_) => debug!(room = %session.room, "room swept during attach, reopening"),
            }
        };
        // The room is observed now, so no sweep can expire the session after
        // this. One that ran before the attach may have removed it.
        let _ = self
            .sessions
            .entry(session.token.clone())
            .or_insert_with(|| Arc::clone(session));

        if let Some(displaced) = displaced {
            let _ = displaced.unbind_room_if(&session.room);
            let _ = displaced.send_event(&ServerEvent::displaced(&session.room));
            info!(room = %session.room, displaced = %displaced.id, by = %connection.id, "observer displaced");
        }
        debug!(room = %session.room, connection_id = %connection.id, "attached");
    }

    /// Resolve and attach in one step.
    pub fn connect(&self, presented: Option<&str>, connection: &Arc<ClientConnection>) -> Arc<Session> {
        let (session, resumed) = self.resolve(presented);
        self.attach(&session, resumed, connection);
        session
    }

    /// Stop `connection` from observing its room. The session stays.
    pub fn detach(&self, connection: &ClientConnection) {
        let Some(room_id) = connection.room() else {
            return;
        };
        let _ = connection.unbind_room_if(&room_id);
        if let Some(room) = self.broadcaster.get(&room_id) {
            if room.detach(connection) {
                debug!(room = %room_id, connection_id = %connection.id, "detached");
            }
        }
    }

    /// Expire sessions whose room has been idle longer than the grace period.
    ///
    /// Each session is removed together with its room while its map entry is
    /// locked, and the room re-checks idleness under its own lock.
    pub fn sweep(&self) -> usize {
        let tokens: Vec<SessionToken> = self.sessions.iter().map(|entry| entry.key().clone()).collect();

        let mut removed = 0;
        for token in tokens {
            let expired = self.sessions.remove_if(&token, |_, session| {
                self.broadcaster.close_if_idle(&session.room, self.grace)
                    || self.broadcaster.get(&session.room).is_none()
            });
            if expired.is_some() {
                removed += 1;
            }
        }
        if removed > 0 {
            counter!(SESSIONS_EXPIRED_TOTAL).increment(removed as u64);
            info!(removed, "expired idle sessions");
        }
        removed
    }

    /// Number of live sessions.
    pub fn count(&self) -> usize {
        self.sessions.len()
    }
}
