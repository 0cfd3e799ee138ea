//! Room-scoped job events and the envelope pushed to WebSocket clients.
//!
//! [`JobEvent`] is what the job coordinator emits. Each variant either moves
//! the job to a new phase or reports progress inside the current one, which
//! is how a room re-derives its snapshot without keeping an event log.
//! [`ServerEvent`] is the JSON envelope every server → client frame uses.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::ids::{ConnectionId, JobId, RoomId, SessionToken};
use crate::phase::{Phase, PhaseProgress};
use crate::reference::ArtifactReference;

// ── Event type constants ────────────────────────────────────────────

/// Handshake reply carrying the effective session token.
pub const SESSION: &str = "session";
/// Reply to an explicit `join`.
pub const JOINED: &str = "joined";
/// Current job state sent to a newly attached observer.
pub const JOB_SNAPSHOT: &str = "job_snapshot";
/// Job accepted over the socket.
pub const JOB_STARTED: &str = "job_started";
/// Pull phase entered.
pub const START_PULL: &str = "start_pull";
/// Layer progress while pulling.
pub const PULL_PROGRESS: &str = "pull_progress";
/// Compress phase entered.
pub const START_COMPRESS: &str = "start_compress";
/// Archiver liveness line.
pub const COMPRESS_PROGRESS: &str = "compress_progress";
/// Artifact ready for one retrieval.
pub const PULL_DONE: &str = "pull_done";
/// Job failed terminally.
pub const PULL_FAILED: &str = "pull_failed";
/// Answer to the current `check_exists`.
pub const EXISTS_RESULT: &str = "exists_result";
/// Another connection took over this room.
pub const DISPLACED: &str = "displaced";
/// Reply to an explicit `leave`.
pub const LEFT: &str = "left";
/// Request-level error.
pub const ERROR: &str = "error";

/// Event emitted by a job into the room that owns it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum JobEvent {
    /// Entered `Pulling`.
    StartPull {
        /// What is being pulled.
        reference: ArtifactReference,
    },
    /// Progress within one layer.
    PullProgress {
        /// Zero-based layer index; equals `total` on the closing frame.
        index: u32,
        /// Number of layers.
        total: u32,
        /// Bytes fetched for this layer so far.
        current_bytes: u64,
        /// Size of this layer.
        total_bytes: u64,
    },
    /// Entered `Compressing`.
    StartCompress,
    /// Archiver output line.
    CompressProgress {
        /// Raw line.
        line: String,
    },
    /// Entered `Ready`; the artifact can be retrieved once.
    PullDone {
        /// Opaque retrieval path.
        tar_path: String,
    },
    /// Entered `Failed`.
    PullFailed {
        /// Phase the job was in when it failed.
        phase: Phase,
        /// Machine-readable error code.
        code: String,
        /// Human-readable reason.
        reason: String,
    },
}

impl JobEvent {
    /// Wire `type` of this event.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::StartPull { .. } => START_PULL,
            Self::PullProgress { .. } => PULL_PROGRESS,
            Self::StartCompress => START_COMPRESS,
            Self::CompressProgress { .. } => COMPRESS_PROGRESS,
            Self::PullDone { .. } => PULL_DONE,
            Self::PullFailed { .. } => PULL_FAILED,
        }
    }

    /// Phase this event moves the job into, if it is a transition.
    pub fn target_phase(&self) -> Option<Phase> {
        match self {
            Self::StartPull { .. } => Some(Phase::Pulling),
            Self::StartCompress => Some(Phase::Compressing),
            Self::PullDone { .. } => Some(Phase::Ready),
            Self::PullFailed { .. } => Some(Phase::Failed),
            Self::PullProgress { .. } | Self::CompressProgress { .. } => None,
        }
    }

    /// Phase a progress event must be reported in, and the progress it sets.
    pub fn progress(&self) -> Option<(Phase, PhaseProgress)> {
        match self {
            Self::PullProgress {
                index,
                total,
                current_bytes,
                total_bytes,
            } => Some((
                Phase::Pulling,
                PhaseProgress::Pulling {
                    layer_index: *index,
                    layer_count: *total,
                    bytes_fetched: *current_bytes,
                    bytes_total: *total_bytes,
                },
            )),
            Self::CompressProgress { line } => Some((
                Phase::Compressing,
                PhaseProgress::Compressing { line: line.clone() },
            )),
            _ => None,
        }
    }

    /// Event payload as it appears under `data` on the wire.
    pub fn data(&self) -> Value {
        match self {
            Self::StartPull { reference } => json!({ "reference": reference.to_string() }),
            Self::PullProgress {
                index,
                total,
                current_bytes,
                total_bytes,
            } => json!({
                "index": index,
                "total": total,
                "current_bytes": current_bytes,
                "total_bytes": total_bytes,
            }),
            Self::StartCompress => json!({}),
            Self::CompressProgress { line } => json!({ "line": line }),
            Self::PullDone { tar_path } => json!({ "tar_path": tar_path }),
            Self::PullFailed {
                phase,
                code,
                reason,
            } => json!({ "phase": phase, "code": code, "reason": reason }),
        }
    }
}

/// Terminal failure recorded on a job.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureInfo {
    /// Machine-readable error code.
    pub code: String,
    /// Human-readable reason.
    pub reason: String,
}

/// Point-in-time view of a room's job, sent to late joiners instead of a replay.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSnapshot {
    /// Job id.
    pub job_id: JobId,
    /// Reference being fetched.
    pub reference: ArtifactReference,
    /// Current phase.
    pub phase: Phase,
    /// Latest progress within the phase.
    pub progress: PhaseProgress,
    /// Retrieval path once `Ready`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tar_path: Option<String>,
    /// Failure details once `Failed`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<FailureInfo>,
}

/// Server → client frame.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerEvent {
    /// Event type (e.g. `pull_progress`).
    #[serde(rename = "type")]
    pub event_type: String,
    /// Room the event belongs to, for room-scoped events.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub room: Option<String>,
    /// Per-room delivery sequence, strictly increasing within a room.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
    /// ISO-8601 timestamp.
    pub timestamp: String,
    /// Event payload.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ServerEvent {
    /// Create an event with the current UTC timestamp.
    pub fn new(event_type: impl Into<String>, data: Option<Value>) -> Self {
        Self {
            event_type: event_type.into(),
            room: None,
            seq: None,
            timestamp: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            data,
        }
    }

    /// Envelope for a job event delivered into a room.
    pub fn from_job_event(room: &RoomId, seq: u64, event: &JobEvent) -> Self {
        let mut envelope = Self::new(event.event_type(), Some(event.data()));
        envelope.room = Some(room.to_string());
        envelope.seq = Some(seq);
        envelope
    }

    /// Handshake reply.
    pub fn session(token: &SessionToken, room: &RoomId, resumed: bool, connection: &ConnectionId) -> Self {
        Self::new(
            SESSION,
            Some(json!({
                "token": token,
                "room": room,
                "resumed": resumed,
                "connection_id": connection,
            })),
        )
    }

    /// Reply to `join`.
    pub fn joined(token: &SessionToken, room: &RoomId, resumed: bool) -> Self {
        Self::new(
            JOINED,
            Some(json!({ "token": token, "room": room, "resumed": resumed })),
        )
    }

    /// Snapshot of the room's job for a newly attached observer.
    pub fn snapshot(room: &RoomId, seq: u64, snapshot: &JobSnapshot) -> Self {
        let mut envelope = Self::new(JOB_SNAPSHOT, serde_json::to_value(snapshot).ok());
        envelope.room = Some(room.to_string());
        envelope.seq = Some(seq);
        envelope
    }

    /// Acknowledgement of a socket-started job.
    pub fn job_started(job_id: &JobId, reference: &ArtifactReference) -> Self {
        Self::new(
            JOB_STARTED,
            Some(json!({ "job_id": job_id, "reference": reference })),
        )
    }

    /// Current validation answer.
    pub fn exists_result(sequence: u64, reference: &str, exists: bool) -> Self {
        Self::new(
            EXISTS_RESULT,
            Some(json!({ "sequence": sequence, "reference": reference, "exists": exists })),
        )
    }

    /// Current validation failed.
    pub fn exists_error(sequence: u64, reference: &str, code: &str, message: &str) -> Self {
        Self::new(
            EXISTS_RESULT,
            Some(json!({
                "sequence": sequence,
                "reference": reference,
                "error": { "code": code, "message": message },
            })),
        )
    }

    /// Sent to a connection that lost its room to a newer attach.
    pub fn displaced(room: &RoomId) -> Self {
        Self::new(DISPLACED, Some(json!({ "room": room })))
    }

    /// The connection stopped observing `room`.
    pub fn left(room: &RoomId) -> Self {
        Self::new(LEFT, Some(json!({ "room": room })))
    }

    /// Request-level error.
    pub fn error(code: &str, message: impl Into<String>) -> Self {
        Self::new(
            ERROR,
            Some(json!({ "code": code, "message": message.into() })),
        )
    }

    /// Serialize to the JSON text sent over the socket.
    pub fn to_json(&self) -> Option<String> {
        serde_json::to_string(self).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alpine() -> ArtifactReference {
        ArtifactReference::parse("alpine:latest").unwrap()
    }

    #[test]
    fn pull_progress_wire_shape() {
        let ev = JobEvent::PullProgress {
            index: 1,
            total: 3,
            current_bytes: 512,
            total_bytes: 1024,
        };
        let env = ServerEvent::from_job_event(&RoomId::from("r"), 7, &ev);
        let v: Value = serde_json::from_str(&env.to_json().unwrap()).unwrap();
        assert_eq!(v["type"], "pull_progress");
        assert_eq!(v["room"], "r");
        assert_eq!(v["seq"], 7);
        assert_eq!(v["data"]["index"], 1);
        assert_eq!(v["data"]["total"], 3);
        assert_eq!(v["data"]["current_bytes"], 512);
        assert_eq!(v["data"]["total_bytes"], 1024);
        assert!(v["timestamp"].is_string());
    }

    #[test]
    fn pull_done_carries_tar_path() {
        let ev = JobEvent::PullDone {
            tar_path: "alpine-latest.tar".into(),
        };
        assert_eq!(ev.event_type(), "pull_done");
        assert_eq!(ev.data()["tar_path"], "alpine-latest.tar");
        assert_eq!(ev.target_phase(), Some(Phase::Ready));
    }

    #[test]
    fn failure_is_distinct_from_progress() {
        let ev = JobEvent::PullFailed {
            phase: Phase::Pulling,
            code: "FETCH_FAILED".into(),
            reason: "connection reset".into(),
        };
        assert_eq!(ev.event_type(), "pull_failed");
        assert_eq!(ev.target_phase(), Some(Phase::Failed));
        assert!(ev.progress().is_none());
        assert_eq!(ev.data()["phase"], "pulling");
        assert_eq!(ev.data()["reason"], "connection reset");
    }

    #[test]
    fn transitions_map_to_phases() {
        assert_eq!(
            JobEvent::StartPull { reference: alpine() }.target_phase(),
            Some(Phase::Pulling)
        );
        assert_eq!(JobEvent::StartCompress.target_phase(), Some(Phase::Compressing));
    }

    #[test]
    fn progress_events_name_their_phase() {
        let (phase, progress) = JobEvent::CompressProgress { line: "x".into() }
            .progress()
            .unwrap();
        assert_eq!(phase, Phase::Compressing);
        assert_eq!(progress, PhaseProgress::Compressing { line: "x".into() });
    }

    #[test]
    fn start_compress_has_empty_object() {
        assert_eq!(JobEvent::StartCompress.data(), json!({}));
    }

    #[test]
    fn session_event_has_token() {
        let token = SessionToken::from("T1");
        let ev = ServerEvent::session(&token, &token.room(), false, &ConnectionId::from("c1"));
        let v = serde_json::to_value(&ev).unwrap();
        assert_eq!(v["type"], "session");
        assert_eq!(v["data"]["token"], "T1");
        assert_eq!(v["data"]["room"], "T1");
        assert_eq!(v["data"]["resumed"], false);
        assert_eq!(v["data"]["connection_id"], "c1");
        assert!(v.get("seq").is_none());
    }

    #[test]
    fn snapshot_omits_absent_fields() {
        let snap = JobSnapshot {
            job_id: JobId::from("j"),
            reference: alpine(),
            phase: Phase::Pulling,
            progress: PhaseProgress::None,
            tar_path: None,
            error: None,
        };
        let ev = ServerEvent::snapshot(&RoomId::from("r"), 3, &snap);
        let v = serde_json::to_value(&ev).unwrap();
        assert_eq!(v["type"], "job_snapshot");
        assert_eq!(v["data"]["phase"], "pulling");
        assert_eq!(v["data"]["reference"], "library/alpine:latest");
        assert!(v["data"].get("tar_path").is_none());
        assert!(v["data"].get("error").is_none());
    }

    #[test]
    fn left_names_the_room() {
        let v = serde_json::to_value(ServerEvent::left(&RoomId::from("T1"))).unwrap();
        assert_eq!(v["type"], "left");
        assert_eq!(v["data"]["room"], "T1");
        assert!(v.get("room").is_none());
    }

    #[test]
    fn exists_error_nests_code() {
        let ev = ServerEvent::exists_error(4, "alpine", "LOOKUP_FAILED", "timeout");
        let data = ev.data.unwrap();
        assert_eq!(data["sequence"], 4);
        assert_eq!(data["error"]["code"], "LOOKUP_FAILED");
        assert!(data.get("exists").is_none());
    }
}
