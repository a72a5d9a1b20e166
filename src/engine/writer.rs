//! Local slice writer pool: one writer per `SliceKey`, registered in a
//! per-volume map so two writers can never open the same slice twice.
//! Disk allocation is attempted once at creation and its failure is
//! logged and skipped rather than propagated.

use crate::error::{Error, Result};
use crate::ids::VolumeId;
use crate::repo::model::{FileState, LocalStorageConfig, Slice, Stats};
use crate::repo::{FileRepository, VolumeRepository};
use dashmap::DashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex as AsyncMutex;
use tracing::warn;

/// Deterministic on-disk path for a slice's local file, shared by the
/// writer pool and the uploader so both agree on where bytes live
/// without the Slice record itself needing to carry a filesystem path.
pub fn local_slice_path(local_storage: &LocalStorageConfig, slice: &Slice) -> PathBuf {
    let file_name = slice.key().path().replace('/', "_");
    PathBuf::from(&local_storage.dir).join(format!("{file_name}.csv"))
}

#[derive(Debug)]
pub struct SliceWriterHandle {
    file: AsyncMutex<tokio::fs::File>,
    bytes_written: AtomicU64,
    records_written: AtomicU64,
}

impl SliceWriterHandle {
    pub fn stats(&self) -> Stats {
        Stats {
            records_count: self.records_written.load(Ordering::Relaxed),
            uncompressed_bytes: self.bytes_written.load(Ordering::Relaxed),
            compressed_bytes: self.bytes_written.load(Ordering::Relaxed),
        }
    }
}

pub struct WriterPool {
    file_repo: Arc<FileRepository>,
    volume_repo: Arc<VolumeRepository>,
    volumes: DashMap<VolumeId, DashMap<String, Arc<SliceWriterHandle>>>,
}

impl WriterPool {
    pub fn new(file_repo: Arc<FileRepository>, volume_repo: Arc<VolumeRepository>) -> Self {
        Self { file_repo, volume_repo, volumes: DashMap::new() }
    }

    /// Opens a new writer for `slice`, failing if one is already
    /// registered for that slice key on that volume.
    pub async fn open(&self, slice: &Slice, local_storage: &LocalStorageConfig) -> Result<Arc<SliceWriterHandle>> {
        let key = slice.key().path();
        let by_volume = self.volumes.entry(slice.volume_id.clone()).or_insert_with(DashMap::new);
        if by_volume.contains_key(&key) {
            return Err(Error::AlreadyExists(format!("writer for slice {key} already exists")));
        }

        let path = local_slice_path(local_storage, slice);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::Unavailable(format!("cannot create slice directory: {e}")))?;
        }
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| Error::Unavailable(format!("cannot open slice file {path:?}: {e}")))?;

        if let Some(allocate_bytes) = local_storage.allocate_bytes {
            if let Err(e) = file.set_len(allocate_bytes).await {
                warn!("disk space allocation failed for {path:?}, continuing without it: {e}");
            }
        }

        let handle = Arc::new(SliceWriterHandle {
            file: AsyncMutex::new(file),
            bytes_written: AtomicU64::new(0),
            records_written: AtomicU64::new(0),
        });
        by_volume.insert(key, handle.clone());
        Ok(handle)
    }

    /// Appends one record. Rejects with `Retryable` if the owning file
    /// is no longer `writing`, and with `VolumeGone` if the slice's
    /// volume has fallen out of the writer registry (its node's lease
    /// expired).
    pub async fn append(&self, slice: &Slice, handle: &SliceWriterHandle, record: &[u8]) -> Result<()> {
        let file = self.file_repo.get(&slice.key().file).await?;
        if file.state != FileState::Writing {
            return Err(Error::Retryable(format!("file {} is no longer writing", file.key().path())));
        }

        let writers = self.volume_repo.writer_volumes().await?;
        if !writers.iter().any(|v| v.volume_id == slice.volume_id) {
            return Err(Error::VolumeGone(format!("volume {} is no longer registered", slice.volume_id)));
        }

        let mut f = handle.file.lock().await;
        f.write_all(record).await.map_err(|e| Error::Unavailable(e.to_string()))?;
        f.write_all(b"\n").await.map_err(|e| Error::Unavailable(e.to_string()))?;
        handle.bytes_written.fetch_add(record.len() as u64 + 1, Ordering::Relaxed);
        handle.records_written.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub fn close(&self, slice: &Slice) {
        if let Some(by_volume) = self.volumes.get(&slice.volume_id) {
            by_volume.remove(&slice.key().path());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::{BranchKey, ProjectId, SinkId, SinkKey, SourceKey};
    use crate::kv::mock::MockStore;
    use crate::repo::model::VolumeAssignmentConfig;

    fn sink_key() -> SinkKey {
        SinkKey {
            source: SourceKey {
                branch: BranchKey { project_id: ProjectId::from("p"), branch_id: "b".into() },
                source_id: "s".into(),
            },
            sink_id: SinkId::from("k"),
        }
    }

    fn local_storage(dir: &std::path::Path) -> LocalStorageConfig {
        LocalStorageConfig { dir: dir.to_string_lossy().to_string(), compression: "none".into(), sync_every_bytes: None, allocate_bytes: None }
    }

    #[tokio::test]
    async fn second_writer_for_same_slice_and_volume_is_rejected() {
        let store = MockStore::new();
        let file_repo = Arc::new(FileRepository::new(store.clone()));
        let volume_repo = Arc::new(VolumeRepository::new(store.clone()));
        let pool = WriterPool::new(file_repo.clone(), volume_repo);
        let dir = std::env::temp_dir().join(format!("silorunner-writer-test-{}", uuid::Uuid::new_v4()));

        let now = chrono::Utc::now();
        let cfg = VolumeAssignmentConfig { count: 1, preferred_types: vec!["hdd".into()] };
        let volume = crate::repo::model::Volume { volume_id: "v1".into(), node_id: "n1".into(), volume_type: "hdd".into(), label: "v1".into(), path: "/mnt/v1".into() };
        let (_file, slices) = file_repo.rotate(&sink_key(), cfg, &[volume], local_storage(&dir), None, now).await.unwrap();
        let slice = &slices[0];

        let _handle = pool.open(slice, &local_storage(&dir)).await.unwrap();
        let err = pool.open(slice, &local_storage(&dir)).await.unwrap_err();
        assert!(matches!(err, Error::AlreadyExists(_)));

        let _ = std::fs::remove_dir_all(&dir);
    }
}
