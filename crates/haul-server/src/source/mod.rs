//! Where artifacts come from.
//!
//! The job coordinator only talks to [`ArtifactSource`]. Progress flows back
//! over bounded channels the coordinator drains while the source works, so
//! no lock is ever held across source I/O.

mod simulated;

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use haul_core::ArtifactReference;
use thiserror::Error;
use tokio::sync::mpsc;

pub use simulated::SimulatedSource;

/// Failure inside a source operation.
#[derive(Debug, Error)]
pub enum SourceError {
    /// The registry does not know the reference.
    #[error("{0} not found")]
    NotFound(String),
    /// Talking to the registry failed.
    #[error("registry error: {0}")]
    Registry(String),
    /// Writing the archive failed.
    #[error("archive error: {0}")]
    Archive(String),
    /// Filesystem error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// One progress update while pulling.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LayerProgress {
    /// Zero-based layer index; equals `total` on the closing frame.
    pub index: u32,
    /// Number of layers.
    pub total: u32,
    /// Bytes of this layer fetched so far.
    pub current_bytes: u64,
    /// Size of this layer.
    pub total_bytes: u64,
}

impl LayerProgress {
    /// Frame sent after the last layer.
    pub fn closing(total: u32) -> Self {
        Self {
            index: total,
            total,
            current_bytes: 1,
            total_bytes: 1,
        }
    }

    /// Whether this is the closing frame.
    pub fn is_closing(&self) -> bool {
        self.index >= self.total
    }
}

/// A pulled image laid out in a staging directory.
#[derive(Clone, Debug)]
pub struct StagedArtifact {
    /// Directory holding the layers and manifest.
    pub staging_dir: PathBuf,
    /// Layer digests in order.
    pub layers: Vec<String>,
}

/// Remote artifact backend.
#[async_trait]
pub trait ArtifactSource: Send + Sync {
    /// Whether the reference exists remotely.
    async fn exists(&self, reference: &ArtifactReference) -> Result<bool, SourceError>;

    /// Fetch all layers into `staging_dir`, reporting progress on `progress`.
    async fn pull(
        &self,
        reference: &ArtifactReference,
        staging_dir: &Path,
        progress: mpsc::Sender<LayerProgress>,
    ) -> Result<StagedArtifact, SourceError>;

    /// Package the staged image into one archive at `output`, reporting
    /// archiver lines on `lines`. The staging directory is consumed.
    /// Returns the archive size in bytes.
    async fn compress(
        &self,
        staged: StagedArtifact,
        output: &Path,
        lines: mpsc::Sender<String>,
    ) -> Result<u64, SourceError>;
}
