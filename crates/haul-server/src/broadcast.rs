//! Room-scoped, ordered event delivery.
//!
//! A [`Room`] holds at most one observing connection and the job it is bound
//! to, both behind one lock. Attaching, detaching, binding a job and emitting
//! an event are therefore atomic with respect to each other. An observer that
//! attaches mid-job gets the snapshot and then every later event, with
//! nothing lost or repeated in between. Sends are non-blocking `try_send`s
//! onto the connection queue, so the lock is never held across I/O.
//!
//! Expiry goes through the same lock: [`ProgressBroadcaster::close_if_idle`]
//! re-checks idleness and marks the room closed in one step, and a closed
//! room refuses attaches and job binds.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use haul_core::{HaulError, JobEvent, JobId, JobSnapshot, Result, RoomId, ServerEvent};
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::jobs::JobRecord;
use crate::websocket::connection::ClientConnection;

/// Delivery scope for one session's job events.
pub struct Room {
    id: RoomId,
    inner: Mutex<RoomState>,
}

struct RoomState {
    observer: Option<Arc<ClientConnection>>,
    job: Option<JobRecord>,
    next_seq: u64,
    idle_since: Instant,
    closed: bool,
}

impl RoomState {
    /// How long the room has had no observer and no running job, or `None`
    /// while it has either.
    fn idle_for(&self) -> Option<Duration> {
        let busy = self.observer.is_some() || self.job.as_ref().is_some_and(JobRecord::is_active);
        (!busy).then(|| self.idle_since.elapsed())
    }
}

impl Room {
    fn new(id: RoomId) -> Self {
        Self {
            id,
            inner: Mutex::new(RoomState {
                observer: None,
                job: None,
                next_seq: 1,
                idle_since: Instant::now(),
                closed: false,
            }),
        }
    }

    /// Room id.
    pub fn id(&self) -> &RoomId {
        &self.id
    }

    /// Make `connection` the observer. `greeting` is sent first, then a
    /// snapshot of the bound job if there is one. Returns the connection that
    /// was displaced, if any.
    ///
    /// Fails with `UnknownRoom` once the room has been closed; nothing is sent.
    pub fn attach(
        &self,
        connection: Arc<ClientConnection>,
        greeting: &ServerEvent,
    ) -> Result<Option<Arc<ClientConnection>>> {
        let mut guard = self.inner.lock();
        let state = &mut *guard;
        if state.closed {
            return Err(HaulError::UnknownRoom(self.id.clone()));
        }
        let _ = connection.send_event(greeting);
        if let Some(job) = &state.job {
            let seq = state.next_seq;
            state.next_seq += 1;
            let _ = connection.send_event(&ServerEvent::snapshot(&self.id, seq, &job.snapshot()));
        }
        let incoming = connection.id.clone();
        Ok(state
            .observer
            .replace(connection)
            .filter(|previous| previous.id != incoming))
    }

    /// Clear the observer if it is still `connection`.
    pub fn detach(&self, connection: &ClientConnection) -> bool {
        let mut state = self.inner.lock();
        if state.observer.as_ref().is_some_and(|c| c.id == connection.id) {
            state.observer = None;
            state.idle_since = Instant::now();
            true
        } else {
            false
        }
    }

    /// Bind a new job. Fails while the current job is still running, and
    /// with `UnknownRoom` once the room has been closed.
    pub fn bind_job(&self, record: JobRecord) -> Result<()> {
        let mut state = self.inner.lock();
        if state.closed {
            return Err(HaulError::UnknownRoom(self.id.clone()));
        }
        if let Some(current) = state.job.as_ref().filter(|job| job.is_active()) {
            return Err(HaulError::JobAlreadyRunning {
                room: self.id.clone(),
                job_id: current.id.clone(),
            });
        }
        state.job = Some(record);
        Ok(())
    }

    /// Apply `event` to the bound job and deliver it to the observer.
    ///
    /// Rejected with `NotJobOwner` when `job_id` is not the bound job, and
    /// with `InvalidTransition` when the event would break phase order. A
    /// rejected event changes nothing and reaches nobody.
    pub fn emit(&self, job_id: &JobId, event: &JobEvent) -> Result<u64> {
        let mut state = self.inner.lock();
        let job = state
            .job
            .as_mut()
            .filter(|job| &job.id == job_id)
            .ok_or_else(|| HaulError::NotJobOwner {
                room: self.id.clone(),
                job_id: job_id.clone(),
            })?;
        job.apply(event)?;
        let finished = !job.is_active();

        let seq = state.next_seq;
        state.next_seq += 1;
        if finished {
            state.idle_since = Instant::now();
        }

        match &state.observer {
            Some(observer) => {
                let envelope = ServerEvent::from_job_event(&self.id, seq, event);
                if !observer.send_event(&envelope) {
                    warn!(room = %self.id, seq, event_type = event.event_type(), "observer queue full, event dropped");
                }
            }
            None => debug!(room = %self.id, seq, event_type = event.event_type(), "no observer, event dropped"),
        }
        Ok(seq)
    }

    /// Snapshot of the bound job.
    pub fn snapshot(&self) -> Option<JobSnapshot> {
        self.inner.lock().job.as_ref().map(JobRecord::snapshot)
    }

    /// Whether the bound job is still running.
    pub fn has_active_job(&self) -> bool {
        self.inner.lock().job.as_ref().is_some_and(JobRecord::is_active)
    }

    /// Whether a connection is observing.
    pub fn is_observed(&self) -> bool {
        self.inner.lock().observer.is_some()
    }

    /// Mark the room closed if it has been idle for at least `grace`.
    fn close_if_idle(&self, grace: Duration) -> bool {
        let mut state = self.inner.lock();
        if state.closed || state.idle_for().is_some_and(|idle| idle >= grace) {
            state.closed = true;
            true
        } else {
            false
        }
    }

    #[cfg(test)]
    pub(crate) fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }
}

/// All open rooms.
#[derive(Default)]
pub struct ProgressBroadcaster {
    rooms: DashMap<RoomId, Arc<Room>>,
}

impl ProgressBroadcaster {
    /// Create a broadcaster with no rooms.
    pub fn new() -> Self {
        Self::default()
    }

    /// Open `room`, or return it if already open.
    pub fn open(&self, room: &RoomId) -> Arc<Room> {
        self.rooms
            .entry(room.clone())
            .or_insert_with(|| Arc::new(Room::new(room.clone())))
            .value()
            .clone()
    }

    /// Look up an open room.
    pub fn get(&self, room: &RoomId) -> Option<Arc<Room>> {
        self.rooms.get(room).map(|entry| entry.value().clone())
    }

    /// Close and remove `room` if it has been idle for at least `grace`.
    ///
    /// The idle check and the close happen under the room lock, so an attach
    /// or bind racing with this either lands first and keeps the room, or
    /// fails with `UnknownRoom` and must reopen.
    pub fn close_if_idle(&self, room: &RoomId, grace: Duration) -> bool {
        self.rooms
            .remove_if(room, |_, open| open.close_if_idle(grace))
            .is_some()
    }

    /// Emit a job event into a room. Returns the room sequence it was stamped with.
    pub fn emit(&self, room: &RoomId, job_id: &JobId, event: &JobEvent) -> Result<u64> {
        let target = self
            .get(room)
            .ok_or_else(|| HaulError::UnknownRoom(room.clone()))?;
        target.emit(job_id, event)
    }

    /// Number of open rooms.
    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    /// Number of rooms with a running job.
    pub fn active_jobs(&self) -> usize {
        self.rooms.iter().filter(|entry| entry.value().has_active_job()).count()
    }
}
