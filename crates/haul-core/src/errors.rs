//! Error taxonomy shared by every haul component.
//!
//! Every variant carries a stable machine-readable code so the HTTP layer,
//! the socket layer and the `pull_failed` event all report the same string.

use thiserror::Error;

use crate::ids::{JobId, RoomId};
use crate::phase::Phase;

// ── Error code constants ────────────────────────────────────────────

/// Reference string is not a valid `[repo/]name[:tag]`.
pub const INVALID_REFERENCE: &str = "INVALID_REFERENCE";
/// Remote artifact does not exist.
pub const REFERENCE_NOT_FOUND: &str = "REFERENCE_NOT_FOUND";
/// Room already has a non-terminal job.
pub const JOB_ALREADY_RUNNING: &str = "JOB_ALREADY_RUNNING";
/// Pull phase failed.
pub const FETCH_FAILED: &str = "FETCH_FAILED";
/// Compress phase failed.
pub const COMPRESS_FAILED: &str = "COMPRESS_FAILED";
/// Artifact unknown, owned by another room, or already downloaded.
pub const ARTIFACT_NOT_FOUND: &str = "ARTIFACT_NOT_FOUND";
/// Session token not recognised.
pub const UNKNOWN_SESSION: &str = "UNKNOWN_SESSION";
/// Room is not open.
pub const UNKNOWN_ROOM: &str = "UNKNOWN_ROOM";
/// Event emitted for a job the room does not own.
pub const NOT_JOB_OWNER: &str = "NOT_JOB_OWNER";
/// Phase transition would skip or revisit a phase.
pub const INVALID_TRANSITION: &str = "INVALID_TRANSITION";
/// Existence lookup failed or timed out.
pub const LOOKUP_FAILED: &str = "LOOKUP_FAILED";
/// Unexpected internal error.
pub const INTERNAL_ERROR: &str = "INTERNAL_ERROR";
/// Client frame could not be parsed.
pub const INVALID_MESSAGE: &str = "INVALID_MESSAGE";

/// Errors produced by the session, job and delivery layers.
#[derive(Debug, Error)]
pub enum HaulError {
    /// The reference could not be parsed.
    #[error("invalid reference '{input}': {reason}")]
    InvalidReference {
        /// Raw client input.
        input: String,
        /// What is wrong with it.
        reason: String,
    },

    /// Validation says the artifact does not exist.
    #[error("{reference} was not found in the registry")]
    ReferenceNotFound {
        /// Canonical reference that was looked up.
        reference: String,
    },

    /// The room already has a job that has not reached a terminal phase.
    #[error("room {room} already has job {job_id} in progress")]
    JobAlreadyRunning {
        /// Room that tried to start a second job.
        room: RoomId,
        /// The job that keeps running.
        job_id: JobId,
    },

    /// Pulling the artifact failed.
    #[error("pull failed: {message}")]
    FetchFailed {
        /// Human-readable reason.
        message: String,
    },

    /// Packaging the pulled artifact failed.
    #[error("compression failed: {message}")]
    CompressFailed {
        /// Human-readable reason.
        message: String,
    },

    /// Retrieval of an unknown or already consumed artifact.
    #[error("artifact '{tar_path}' is not available")]
    ArtifactConsumedOrMissing {
        /// Retrieval path the client asked for.
        tar_path: String,
    },

    /// The presented session token is not known. Never surfaced to users.
    #[error("unknown session")]
    UnknownSession,

    /// No room with this id is open.
    #[error("room {0} is not open")]
    UnknownRoom(RoomId),

    /// An event was emitted for a job the room does not own.
    #[error("room {room} does not own job {job_id}")]
    NotJobOwner {
        /// Target room.
        room: RoomId,
        /// Job that tried to emit.
        job_id: JobId,
    },

    /// A phase transition that would skip or revisit a phase.
    #[error("cannot move job from {from} to {to}")]
    InvalidTransition {
        /// Current phase.
        from: Phase,
        /// Requested phase.
        to: Phase,
    },

    /// The existence lookup itself failed.
    #[error("lookup failed: {message}")]
    LookupFailed {
        /// Human-readable reason.
        message: String,
    },

    /// Unexpected internal failure.
    #[error("{message}")]
    Internal {
        /// Description.
        message: String,
    },

    /// Filesystem error.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl HaulError {
    /// Machine-readable error code for this variant.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidReference { .. } => INVALID_REFERENCE,
            Self::ReferenceNotFound { .. } => REFERENCE_NOT_FOUND,
            Self::JobAlreadyRunning { .. } => JOB_ALREADY_RUNNING,
            Self::FetchFailed { .. } => FETCH_FAILED,
            Self::CompressFailed { .. } => COMPRESS_FAILED,
            Self::ArtifactConsumedOrMissing { .. } => ARTIFACT_NOT_FOUND,
            Self::UnknownSession => UNKNOWN_SESSION,
            Self::UnknownRoom(_) => UNKNOWN_ROOM,
            Self::NotJobOwner { .. } => NOT_JOB_OWNER,
            Self::InvalidTransition { .. } => INVALID_TRANSITION,
            Self::LookupFailed { .. } => LOOKUP_FAILED,
            Self::Internal { .. } | Self::Io(_) => INTERNAL_ERROR,
        }
    }

    /// Whether the user can fix this by changing their input.
    pub fn is_user_correctable(&self) -> bool {
        matches!(
            self,
            Self::InvalidReference { .. } | Self::ReferenceNotFound { .. }
        )
    }
}

/// Result alias for haul operations.
pub type Result<T> = std::result::Result<T, HaulError>;
