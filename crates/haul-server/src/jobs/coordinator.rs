//! Job coordinator.
//!
//! `start_job` binds a fresh [`JobRecord`] to the room and hands the work to
//! a tracked task. The task walks `Validating → Pulling → Compressing →
//! Ready`, forwarding source progress into the room as it arrives. Any error
//! ends the job in `Failed` with a `pull_failed` event. Nothing is retried.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use haul_core::{ArtifactReference, HaulError, JobEvent, JobId, Phase, Result, RoomId};
use metrics::{counter, gauge, histogram};
use tokio::sync::{Semaphore, mpsc};
use tokio_util::task::TaskTracker;
use tracing::{Instrument, debug, info, info_span, warn};

use super::JobRecord;
use crate::broadcast::ProgressBroadcaster;
use crate::handoff::CompletionHandoff;
use crate::metrics::{JOB_DURATION_SECONDS, JOBS_ACTIVE, JOBS_FAILED_TOTAL, JOBS_STARTED_TOTAL};
use crate::source::{ArtifactSource, LayerProgress, SourceError, StagedArtifact};

/// Everything a running job needs to know about itself.
#[derive(Clone, Debug)]
struct JobContext {
    job_id: JobId,
    room: RoomId,
    reference: ArtifactReference,
    work_dir: PathBuf,
}

impl JobContext {
    fn staging_dir(&self) -> PathBuf {
        self.work_dir.join("staging")
    }

    fn archive_path(&self) -> PathBuf {
        self.work_dir.join(self.reference.archive_name())
    }
}

/// A failure together with the phase it happened in.
struct PhaseFailure {
    phase: Phase,
    error: HaulError,
}

/// Starts jobs and runs them to a terminal phase.
#[derive(Clone)]
pub struct JobCoordinator {
    broadcaster: Arc<ProgressBroadcaster>,
    handoff: Arc<CompletionHandoff>,
    source: Arc<dyn ArtifactSource>,
    permits: Arc<Semaphore>,
    downloads_dir: PathBuf,
    progress_buffer: usize,
    tracker: TaskTracker,
}

impl JobCoordinator {
    /// Create a coordinator. Jobs are spawned on `tracker` so shutdown can wait for them.
    pub fn new(
        broadcaster: Arc<ProgressBroadcaster>,
        handoff: Arc<CompletionHandoff>,
        source: Arc<dyn ArtifactSource>,
        max_concurrent_jobs: usize,
        downloads_dir: PathBuf,
        progress_buffer: usize,
        tracker: TaskTracker,
    ) -> Self {
        Self {
            broadcaster,
            handoff,
            source,
            permits: Arc::new(Semaphore::new(max_concurrent_jobs.max(1))),
            downloads_dir,
            progress_buffer: progress_buffer.max(1),
            tracker,
        }
    }

    /// Bind a new job to `room` and start it in the background.
    pub fn start_job(&self, room: &RoomId, reference: ArtifactReference) -> Result<JobId> {
        let handle = self
            .broadcaster
            .get(room)
            .ok_or_else(|| HaulError::UnknownRoom(room.clone()))?;

        let record = JobRecord::new(room.clone(), reference.clone());
        let job_id = record.id.clone();
        handle.bind_job(record)?;

        counter!(JOBS_STARTED_TOTAL).increment(1);
        gauge!(JOBS_ACTIVE).increment(1.0);
        info!(room = %room, job_id = %job_id, %reference, "job started");

        let ctx = JobContext {
            work_dir: self.downloads_dir.join(job_id.as_str()),
            job_id: job_id.clone(),
            room: room.clone(),
            reference,
        };
        let span = info_span!("job", room = %ctx.room, job_id = %ctx.job_id, reference = %ctx.reference);
        let runner = self.clone();
        let _ = self.tracker.spawn(async move { runner.run(ctx).await }.instrument(span));
        Ok(job_id)
    }

    async fn run(&self, ctx: JobContext) {
        let started = Instant::now();
        match self.execute(&ctx).await {
            Ok(tar_path) => info!(%tar_path, "job ready"),
            Err(PhaseFailure { phase, error }) => {
                let code = error.code();
                if error.is_user_correctable() {
                    info!(%phase, code, %error, "job rejected");
                } else {
                    warn!(%phase, code, %error, "job failed");
                }
                counter!(JOBS_FAILED_TOTAL, "code" => code).increment(1);
                let event = JobEvent::PullFailed {
                    phase,
                    code: code.to_owned(),
                    reason: error.to_string(),
                };
                if let Err(error) = self.broadcaster.emit(&ctx.room, &ctx.job_id, &event) {
                    warn!(%error, "could not record failure");
                }
                if let Err(error) = tokio::fs::remove_dir_all(&ctx.work_dir).await {
                    if error.kind() != std::io::ErrorKind::NotFound {
                        warn!(path = %ctx.work_dir.display(), %error, "failed to clean work dir");
                    }
                }
            }
        }
        gauge!(JOBS_ACTIVE).decrement(1.0);
        histogram!(JOB_DURATION_SECONDS).record(started.elapsed().as_secs_f64());
    }

    async fn execute(&self, ctx: &JobContext) -> std::result::Result<String, PhaseFailure> {
        let mut phase = Phase::Validating;
        let fail = |phase: Phase| move |error: HaulError| PhaseFailure { phase, error };

        let _permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|e| HaulError::Internal {
                message: format!("job permits closed: {e}"),
            })
            .map_err(fail(phase))?;

        let exists = self
            .source
            .exists(&ctx.reference)
            .await
            .map_err(|e| HaulError::LookupFailed {
                message: e.to_string(),
            })
            .map_err(fail(phase))?;
        if !exists {
            return Err(fail(phase)(HaulError::ReferenceNotFound {
                reference: ctx.reference.to_string(),
            }));
        }

        self.emit(
            ctx,
            &JobEvent::StartPull {
                reference: ctx.reference.clone(),
            },
        )
        .map_err(fail(phase))?;
        phase = Phase::Pulling;

        let staged = self.pull(ctx).await.map_err(fail(phase))?;

        self.emit(ctx, &JobEvent::StartCompress).map_err(fail(phase))?;
        phase = Phase::Compressing;

        self.compress(ctx, staged).await.map_err(fail(phase))?;

        self.handoff
            .on_ready(
                &ctx.room,
                &ctx.job_id,
                ctx.archive_path(),
                &ctx.reference.archive_name(),
            )
            .await
            .map_err(fail(phase))
    }

    async fn pull(&self, ctx: &JobContext) -> Result<StagedArtifact> {
        let (tx, mut rx) = mpsc::channel::<LayerProgress>(self.progress_buffer);
        let staging = ctx.staging_dir();
        let pull = self.source.pull(&ctx.reference, &staging, tx);
        tokio::pin!(pull);

        let mut closing: Option<u32> = None;
        let mut layer_total = 0;
        let outcome = loop {
            tokio::select! {
                biased;
                Some(frame) = rx.recv() => {
                    self.forward_layer(ctx, frame, &mut closing, &mut layer_total)?;
                }
                outcome = &mut pull => break outcome,
            }
        };
        while let Some(frame) = rx.recv().await {
            self.forward_layer(ctx, frame, &mut closing, &mut layer_total)?;
        }

        let staged = outcome.map_err(|e| match e {
            SourceError::NotFound(reference) => HaulError::ReferenceNotFound { reference },
            other => HaulError::FetchFailed {
                message: other.to_string(),
            },
        })?;

        if closing.is_none() {
            let total = u32::try_from(staged.layers.len()).unwrap_or(layer_total).max(layer_total);
            let frame = LayerProgress::closing(total);
            self.emit(ctx, &layer_event(frame))?;
        }
        Ok(staged)
    }

    fn forward_layer(
        &self,
        ctx: &JobContext,
        frame: LayerProgress,
        closing: &mut Option<u32>,
        layer_total: &mut u32,
    ) -> Result<()> {
        *layer_total = frame.total;
        if frame.is_closing() {
            *closing = Some(frame.total);
        }
        self.emit(ctx, &layer_event(frame)).map(|_| ())
    }

    async fn compress(&self, ctx: &JobContext, staged: StagedArtifact) -> Result<u64> {
        let (tx, mut rx) = mpsc::channel::<String>(self.progress_buffer);
        let output = ctx.archive_path();
        let compress = self.source.compress(staged, &output, tx);
        tokio::pin!(compress);

        let outcome = loop {
            tokio::select! {
                biased;
                Some(line) = rx.recv() => {
                    self.emit(ctx, &JobEvent::CompressProgress { line })?;
                }
                outcome = &mut compress => break outcome,
            }
        };
        while let Some(line) = rx.recv().await {
            self.emit(ctx, &JobEvent::CompressProgress { line })?;
        }

        let size = outcome.map_err(|e| HaulError::CompressFailed {
            message: e.to_string(),
        })?;
        debug!(size, "archive written");
        Ok(size)
    }

    fn emit(&self, ctx: &JobContext, event: &JobEvent) -> Result<u64> {
        self.broadcaster.emit(&ctx.room, &ctx.job_id, event)
    }
}

fn layer_event(frame: LayerProgress) -> JobEvent {
    JobEvent::PullProgress {
        index: frame.index,
        total: frame.total,
        current_bytes: frame.current_bytes,
        total_bytes: frame.total_bytes,
    }
}
