//! Deterministic in-process source.
//!
//! Layers are synthesized from a SHA-256 of the reference, written into the
//! staging directory in the `docker save` layout (`<digest>/layer.tar`,
//! `manifest.json`, `repositories`) and packaged with a checkpointing tar
//! writer that reports `checkpoint N` lines while it works.

use std::collections::HashSet;
use std::io::{self, Write};
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use haul_core::ArtifactReference;
use haul_core::reference::DEFAULT_REPOSITORY;
use haul_settings::SourceSettings;
use serde_json::json;
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{ArtifactSource, LayerProgress, SourceError, StagedArtifact};

/// Source that fabricates images locally instead of contacting a registry.
pub struct SimulatedSource {
    settings: SourceSettings,
    unavailable: HashSet<ArtifactReference>,
}

impl SimulatedSource {
    /// Create from settings. Unparseable entries in `unavailable` are skipped.
    pub fn new(settings: SourceSettings) -> Self {
        let unavailable = settings
            .unavailable
            .iter()
            .filter_map(|raw| match ArtifactReference::parse(raw) {
                Ok(reference) => Some(reference),
                Err(error) => {
                    warn!(%error, "ignoring unavailable reference");
                    None
                }
            })
            .collect();
        Self {
            settings,
            unavailable,
        }
    }

    fn chunk_delay(&self) -> Duration {
        Duration::from_millis(self.settings.chunk_delay_ms)
    }

    async fn write_layer(
        &self,
        path: &Path,
        digest: &str,
        index: u32,
        total: u32,
        progress: &mpsc::Sender<LayerProgress>,
    ) -> Result<(), SourceError> {
        let layer_bytes = self.settings.layer_bytes;
        let mut file = tokio::fs::File::create(path).await?;
        let mut written = 0u64;
        while written < layer_bytes {
            let n = self.settings.chunk_bytes.min(layer_bytes - written);
            let chunk: Vec<u8> = digest
                .bytes()
                .cycle()
                .take(usize::try_from(n).unwrap_or(usize::MAX))
                .collect();
            file.write_all(&chunk).await?;
            written += n;
            let _ = progress
                .send(LayerProgress {
                    index,
                    total,
                    current_bytes: written,
                    total_bytes: layer_bytes,
                })
                .await;
            if !self.chunk_delay().is_zero() {
                tokio::time::sleep(self.chunk_delay()).await;
            }
        }
        file.flush().await?;
        Ok(())
    }
}

fn digest_hex(parts: &[&[u8]]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    format!("{:x}", hasher.finalize())
}

fn layer_digest(reference: &ArtifactReference, index: u32) -> String {
    digest_hex(&[reference.to_string().as_bytes(), &index.to_be_bytes()])
}

/// Name a registry prints for the image: `alpine` for library images,
/// `org/tool` otherwise.
fn display_name(reference: &ArtifactReference) -> String {
    if reference.repository() == DEFAULT_REPOSITORY {
        reference.name().to_string()
    } else {
        reference.repository_path()
    }
}

#[async_trait]
impl ArtifactSource for SimulatedSource {
    async fn exists(&self, reference: &ArtifactReference) -> Result<bool, SourceError> {
        if self.settings.lookup_delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.settings.lookup_delay_ms)).await;
        }
        Ok(!self.unavailable.contains(reference))
    }

    async fn pull(
        &self,
        reference: &ArtifactReference,
        staging_dir: &Path,
        progress: mpsc::Sender<LayerProgress>,
    ) -> Result<StagedArtifact, SourceError> {
        if self.unavailable.contains(reference) {
            return Err(SourceError::NotFound(reference.to_string()));
        }
        tokio::fs::create_dir_all(staging_dir).await?;

        let total = self.settings.layer_count;
        let mut layers = Vec::new();
        for index in 0..total {
            let digest = layer_digest(reference, index);
            let layer_dir = staging_dir.join(&digest);
            tokio::fs::create_dir_all(&layer_dir).await?;
            self.write_layer(&layer_dir.join("layer.tar"), &digest, index, total, &progress)
                .await?;
            debug!(%reference, index, %digest, "layer written");
            layers.push(digest);
        }

        let config_digest = digest_hex(&[layers.concat().as_bytes()]);
        let config_file = format!("{config_digest}.json");
        let diff_ids: Vec<String> = layers.iter().map(|d| format!("sha256:{d}")).collect();
        let config = json!({
            "architecture": "amd64",
            "os": "linux",
            "rootfs": { "type": "layers", "diff_ids": diff_ids },
        });
        tokio::fs::write(staging_dir.join(&config_file), config.to_string()).await?;

        let name = display_name(reference);
        let layer_paths: Vec<String> = layers.iter().map(|d| format!("{d}/layer.tar")).collect();
        let manifest = json!([{
            "Config": config_file,
            "RepoTags": [format!("{name}:{}", reference.tag())],
            "Layers": layer_paths,
        }]);
        tokio::fs::write(staging_dir.join("manifest.json"), manifest.to_string()).await?;

        let top = layers.last().cloned().unwrap_or_default();
        let repositories = json!({ name: { reference.tag(): top } });
        tokio::fs::write(staging_dir.join("repositories"), repositories.to_string()).await?;

        let _ = progress.send(LayerProgress::closing(total)).await;
        Ok(StagedArtifact {
            staging_dir: staging_dir.to_path_buf(),
            layers,
        })
    }

    async fn compress(
        &self,
        staged: StagedArtifact,
        output: &Path,
        lines: mpsc::Sender<String>,
    ) -> Result<u64, SourceError> {
        let every = self.settings.checkpoint_bytes.max(1);
        let delay = self.chunk_delay();
        let staging = staged.staging_dir.clone();
        let target = output.to_path_buf();

        let size = tokio::task::spawn_blocking(move || {
            write_archive(&staging, &target, every, delay, &lines)
        })
        .await
        .map_err(|e| SourceError::Archive(e.to_string()))??;

        tokio::fs::remove_dir_all(&staged.staging_dir).await?;
        Ok(size)
    }
}

fn write_archive(
    staging: &Path,
    output: &Path,
    every: u64,
    delay: Duration,
    lines: &mpsc::Sender<String>,
) -> Result<u64, SourceError> {
    let archive_err = |e: io::Error| SourceError::Archive(e.to_string());

    let file = std::fs::File::create(output)?;
    let writer = CheckpointWriter::new(io::BufWriter::new(file), every, delay, lines);
    let mut builder = tar::Builder::new(writer);
    builder.mode(tar::HeaderMode::Deterministic);
    builder.append_dir_all(".", staging).map_err(archive_err)?;
    let mut writer = builder.into_inner().map_err(archive_err)?;
    writer.flush()?;
    Ok(writer.written)
}

/// Counts bytes and emits a `checkpoint N` line every `every` bytes.
struct CheckpointWriter<'a, W> {
    inner: W,
    every: u64,
    delay: Duration,
    next_mark: u64,
    written: u64,
    checkpoints: u64,
    lines: &'a mpsc::Sender<String>,
}

impl<'a, W> CheckpointWriter<'a, W> {
    fn new(inner: W, every: u64, delay: Duration, lines: &'a mpsc::Sender<String>) -> Self {
        Self {
            inner,
            every,
            delay,
            next_mark: every,
            written: 0,
            checkpoints: 0,
            lines,
        }
    }
}

impl<W: Write> Write for CheckpointWriter<'_, W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.written += n as u64;
        while self.written >= self.next_mark {
            self.checkpoints += 1;
            let _ = self
                .lines
                .blocking_send(format!("checkpoint {}", self.checkpoints));
            self.next_mark += self.every;
            if !self.delay.is_zero() {
                std::thread::sleep(self.delay);
            }
        }
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_settings() -> SourceSettings {
        SourceSettings {
            layer_count: 2,
            layer_bytes: 4096,
            chunk_bytes: 1024,
            chunk_delay_ms: 0,
            checkpoint_bytes: 1024,
            lookup_delay_ms: 0,
            unavailable: vec!["ghost".into(), "NOT VALID".into()],
        }
    }

    fn alpine() -> ArtifactReference {
        ArtifactReference::parse("alpine:latest").unwrap()
    }

    #[tokio::test]
    async fn exists_respects_unavailable_list() {
        let source = SimulatedSource::new(fast_settings());
        assert!(source.exists(&alpine()).await.unwrap());
        let ghost = ArtifactReference::parse("library/ghost:latest").unwrap();
        assert!(!source.exists(&ghost).await.unwrap());
    }

    #[tokio::test]
    async fn pull_reports_every_chunk_then_closes() {
        let dir = tempfile::tempdir().unwrap();
        let source = SimulatedSource::new(fast_settings());
        let (tx, mut rx) = mpsc::channel(64);

        let staged = source
            .pull(&alpine(), &dir.path().join("staging"), tx)
            .await
            .unwrap();
        assert_eq!(staged.layers.len(), 2);

        let mut frames = Vec::new();
        while let Some(frame) = rx.recv().await {
            frames.push(frame);
        }
        // 2 layers × 4 chunks + closing frame
        assert_eq!(frames.len(), 9);
        assert_eq!(frames[0].index, 0);
        assert_eq!(frames[0].current_bytes, 1024);
        assert_eq!(frames[3].current_bytes, 4096);
        assert_eq!(frames[4].index, 1);
        assert_eq!(*frames.last().unwrap(), LayerProgress::closing(2));
    }

    #[tokio::test]
    async fn pull_writes_save_layout() {
        let dir = tempfile::tempdir().unwrap();
        let staging = dir.path().join("staging");
        let source = SimulatedSource::new(fast_settings());
        let (tx, _rx) = mpsc::channel(64);

        let staged = source.pull(&alpine(), &staging, tx).await.unwrap();

        let manifest: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(staging.join("manifest.json")).unwrap())
                .unwrap();
        assert_eq!(manifest[0]["RepoTags"][0], "alpine:latest");
        assert_eq!(manifest[0]["Layers"].as_array().unwrap().len(), 2);

        let repositories: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(staging.join("repositories")).unwrap())
                .unwrap();
        assert_eq!(repositories["alpine"]["latest"], staged.layers[1].as_str());

        let layer = staging.join(&staged.layers[0]).join("layer.tar");
        assert_eq!(std::fs::metadata(layer).unwrap().len(), 4096);
    }

    #[tokio::test]
    async fn digests_are_deterministic_per_reference() {
        assert_eq!(layer_digest(&alpine(), 0), layer_digest(&alpine(), 0));
        assert_ne!(layer_digest(&alpine(), 0), layer_digest(&alpine(), 1));
        assert_eq!(layer_digest(&alpine(), 0).len(), 64);
    }

    #[tokio::test]
    async fn pull_unavailable_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let source = SimulatedSource::new(fast_settings());
        let (tx, _rx) = mpsc::channel(8);
        let ghost = ArtifactReference::parse("ghost").unwrap();
        let result = source.pull(&ghost, dir.path(), tx).await;
        assert!(matches!(result, Err(SourceError::NotFound(_))));
    }

    #[tokio::test]
    async fn compress_writes_tar_and_removes_staging() {
        let dir = tempfile::tempdir().unwrap();
        let staging = dir.path().join("staging");
        let output = dir.path().join("alpine-latest.tar");
        let source = SimulatedSource::new(fast_settings());
        let (ptx, _prx) = mpsc::channel(64);
        let staged = source.pull(&alpine(), &staging, ptx).await.unwrap();

        let (ltx, mut lrx) = mpsc::channel(1024);
        let size = source.compress(staged, &output, ltx).await.unwrap();

        assert_eq!(std::fs::metadata(&output).unwrap().len(), size);
        assert!(!staging.exists());

        let mut lines = Vec::new();
        while let Some(line) = lrx.recv().await {
            lines.push(line);
        }
        assert!(!lines.is_empty());
        assert_eq!(lines[0], "checkpoint 1");

        let mut archive = tar::Archive::new(std::fs::File::open(&output).unwrap());
        let names: Vec<String> = archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().into_owned())
            .collect();
        assert!(names.iter().any(|n| n.ends_with("manifest.json")));
        assert!(names.iter().any(|n| n.ends_with("repositories")));
    }

    #[test]
    fn checkpoint_writer_marks_every_interval() {
        let (tx, mut rx) = mpsc::channel(16);
        let mut writer = CheckpointWriter::new(Vec::new(), 10, Duration::ZERO, &tx);
        writer.write_all(&[0u8; 25]).unwrap();
        drop(writer);
        drop(tx);
        assert_eq!(rx.blocking_recv().as_deref(), Some("checkpoint 1"));
        assert_eq!(rx.blocking_recv().as_deref(), Some("checkpoint 2"));
        assert_eq!(rx.blocking_recv(), None);
    }

    #[test]
    fn display_name_for_nested_repository() {
        let r = ArtifactReference::parse("org/tool:v1").unwrap();
        assert_eq!(display_name(&r), "org/tool");
        assert_eq!(display_name(&alpine()), "alpine");
    }
}
