//! Per-room job state machine.

use chrono::{DateTime, Utc};
use haul_core::{
    ArtifactReference, FailureInfo, HaulError, JobEvent, JobId, JobSnapshot, Phase, PhaseProgress,
    Result, RoomId,
};

/// The job a room is bound to, updated by every event emitted for it.
#[derive(Clone, Debug)]
pub struct JobRecord {
    /// Job id.
    pub id: JobId,
    /// Owning room.
    pub room: RoomId,
    /// Reference being fetched.
    pub reference: ArtifactReference,
    /// Current phase.
    pub phase: Phase,
    /// Latest progress inside the current phase.
    pub progress: PhaseProgress,
    /// When the job was accepted.
    pub started_at: DateTime<Utc>,
    /// When the job reached a terminal phase.
    pub finished_at: Option<DateTime<Utc>>,
    /// Retrieval path once `Ready`.
    pub tar_path: Option<String>,
    /// Failure details once `Failed`.
    pub failure: Option<FailureInfo>,
}

impl JobRecord {
    /// New job in `Validating`.
    pub fn new(room: RoomId, reference: ArtifactReference) -> Self {
        Self {
            id: JobId::new(),
            room,
            reference,
            phase: Phase::Validating,
            progress: PhaseProgress::None,
            started_at: Utc::now(),
            finished_at: None,
            tar_path: None,
            failure: None,
        }
    }

    /// Whether the job has not reached `Ready` or `Failed`.
    pub fn is_active(&self) -> bool {
        !self.phase.is_terminal()
    }

    /// Move to `to`, rejecting skips, revisits and moves out of terminal phases.
    pub fn advance(&mut self, to: Phase) -> Result<()> {
        if !self.phase.can_advance_to(to) {
            return Err(HaulError::InvalidTransition {
                from: self.phase,
                to,
            });
        }
        self.phase = to;
        self.progress = PhaseProgress::None;
        if to.is_terminal() {
            self.finished_at = Some(Utc::now());
        }
        Ok(())
    }

    /// Apply an event. The record is left untouched when this fails.
    pub fn apply(&mut self, event: &JobEvent) -> Result<()> {
        if let Some(to) = event.target_phase() {
            self.advance(to)?;
            match event {
                JobEvent::PullDone { tar_path } => self.tar_path = Some(tar_path.clone()),
                JobEvent::PullFailed { code, reason, .. } => {
                    self.failure = Some(FailureInfo {
                        code: code.clone(),
                        reason: reason.clone(),
                    });
                }
                _ => {}
            }
            return Ok(());
        }

        if let Some((phase, progress)) = event.progress() {
            if self.phase != phase {
                return Err(HaulError::InvalidTransition {
                    from: self.phase,
                    to: phase,
                });
            }
            self.progress = progress;
        }
        Ok(())
    }

    /// Point-in-time view for a newly attached observer.
    pub fn snapshot(&self) -> JobSnapshot {
        JobSnapshot {
            job_id: self.id.clone(),
            reference: self.reference.clone(),
            phase: self.phase,
            progress: self.progress.clone(),
            tar_path: self.tar_path.clone(),
            error: self.failure.clone(),
        }
    }
}
