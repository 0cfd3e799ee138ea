//! One-shot artifact delivery.
//!
//! A finished archive is registered under `(room, tar_path)`. The first
//! retrieval removes the mapping and unlinks the file after opening it, so a
//! second request (or a racing one) finds nothing. Unclaimed archives are
//! removed by [`CompletionHandoff::sweep_expired`] once their TTL passes.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use haul_core::{HaulError, JobEvent, JobId, Result, RoomId};
use metrics::counter;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::broadcast::ProgressBroadcaster;
use crate::metrics::{ARTIFACTS_EXPIRED_TOTAL, ARTIFACTS_RETRIEVED_TOTAL};

/// An archive waiting for its single download.
#[derive(Clone, Debug)]
pub struct Artifact {
    /// Archive location on disk.
    pub path: PathBuf,
    /// Owning room.
    pub room: RoomId,
    /// Job that produced it.
    pub job_id: JobId,
    /// Retrieval path handed to the client.
    pub tar_path: String,
    /// When it became ready.
    pub created_at: Instant,
}

/// An opened archive, already unlinked from disk.
#[derive(Debug)]
pub struct RetrievedArtifact {
    /// Open handle to stream from.
    pub file: tokio::fs::File,
    /// Download file name.
    pub file_name: String,
    /// Size in bytes.
    pub size: u64,
}

type ArtifactKey = (RoomId, String);

/// Registry of ready, unclaimed archives.
pub struct CompletionHandoff {
    pending: Mutex<HashMap<ArtifactKey, Artifact>>,
    broadcaster: Arc<ProgressBroadcaster>,
    ttl: Duration,
}

impl CompletionHandoff {
    /// Create a handoff that announces readiness through `broadcaster`.
    pub fn new(broadcaster: Arc<ProgressBroadcaster>, ttl: Duration) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            broadcaster,
            ttl,
        }
    }

    /// Emit `pull_done` into the room and register the finished archive.
    ///
    /// Both happen under the pending lock, so the archive becomes claimable
    /// only once the job is `Ready`. An unclaimed archive under the same key
    /// is replaced and deleted. If the room rejects the event, nothing is
    /// registered and the new archive is deleted.
    pub async fn on_ready(
        &self,
        room: &RoomId,
        job_id: &JobId,
        path: PathBuf,
        archive_name: &str,
    ) -> Result<String> {
        let tar_path = archive_name.to_owned();
        let artifact = Artifact {
            path,
            room: room.clone(),
            job_id: job_id.clone(),
            tar_path: tar_path.clone(),
            created_at: Instant::now(),
        };

        let event = JobEvent::PullDone {
            tar_path: tar_path.clone(),
        };
        let registered = {
            let mut pending = self.pending.lock();
            match self.broadcaster.emit(room, job_id, &event) {
                Ok(_) => Ok(pending.insert((room.clone(), tar_path.clone()), artifact)),
                Err(error) => Err((error, artifact)),
            }
        };
        let stale = match registered {
            Ok(stale) => stale,
            Err((error, orphan)) => {
                discard(&orphan.path).await;
                return Err(error);
            }
        };
        if let Some(stale) = stale.filter(|s| s.job_id != *job_id) {
            debug!(room = %room, job_id = %stale.job_id, "replacing unclaimed artifact");
            discard(&stale.path).await;
        }
        info!(room = %room, job_id = %job_id, %tar_path, "artifact ready");
        Ok(tar_path)
    }

    /// Claim an archive. Only the first call for a key succeeds.
    pub async fn retrieve(&self, room: &RoomId, tar_path: &str) -> Result<RetrievedArtifact> {
        let missing = || HaulError::ArtifactConsumedOrMissing {
            tar_path: tar_path.to_owned(),
        };
        let artifact = self
            .pending
            .lock()
            .remove(&(room.clone(), tar_path.to_owned()))
            .ok_or_else(missing)?;

        let file = match tokio::fs::File::open(&artifact.path).await {
            Ok(file) => file,
            Err(error) => {
                warn!(room = %room, path = %artifact.path.display(), %error, "artifact vanished");
                return Err(missing());
            }
        };
        let size = file.metadata().await?.len();
        discard(&artifact.path).await;

        counter!(ARTIFACTS_RETRIEVED_TOTAL).increment(1);
        info!(room = %room, job_id = %artifact.job_id, tar_path, size, "artifact retrieved");
        Ok(RetrievedArtifact {
            file,
            file_name: artifact.tar_path,
            size,
        })
    }

    /// Delete archives nobody retrieved within the TTL.
    pub async fn sweep_expired(&self) -> usize {
        let expired: Vec<Artifact> = {
            let mut pending = self.pending.lock();
            let keys: Vec<ArtifactKey> = pending
                .iter()
                .filter(|(_, artifact)| artifact.created_at.elapsed() >= self.ttl)
                .map(|(key, _)| key.clone())
                .collect();
            keys.iter().filter_map(|key| pending.remove(key)).collect()
        };

        for artifact in &expired {
            discard(&artifact.path).await;
        }
        if !expired.is_empty() {
            counter!(ARTIFACTS_EXPIRED_TOTAL).increment(expired.len() as u64);
            info!(removed = expired.len(), "expired unclaimed artifacts");
        }
        expired.len()
    }

    /// Number of archives waiting for retrieval.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }
}

/// Remove an archive and its job directory if that is now empty.
async fn discard(path: &Path) {
    if let Err(error) = tokio::fs::remove_file(path).await {
        if error.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), %error, "failed to remove artifact");
        }
    }
    if let Some(parent) = path.parent() {
        let _ = tokio::fs::remove_dir(parent).await;
    }
}
