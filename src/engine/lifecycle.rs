//! Watches the `level/local` index for both Slices and Files and turns
//! what it sees into `slice.upload` and `file.import` tasks. A File
//! only re-enters the index on its own state change, and nothing
//! rewrites it the moment its last Slice reaches `Uploaded`, so the
//! Slice side re-evaluates the parent File itself right after a
//! successful upload rather than waiting on a File-side event that
//! will never come. "Election" is simply lock contention in the task
//! runner: whichever node's watcher reacts first wins the lock, every
//! other watcher's attempt is ignored.

use crate::bridge::{TableKey, WarehouseBridge};
use crate::clock::Clock;
use crate::engine::writer::local_slice_path;
use crate::error::Result;
use crate::ids::{FileKey, ProjectId};
use crate::kv::{EventKind, WatchEvent, WatchMessage};
use crate::repo::model::{File, FileState, Level, Slice, SliceState};
use crate::repo::{FileRepository, SliceRepository, TokenRepository};
use crate::tasks::TaskRunner;
use futures::StreamExt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

pub struct LifecycleWatcher {
    clock: Arc<dyn Clock>,
    project_id: ProjectId,
    file_repo: Arc<FileRepository>,
    slice_repo: Arc<SliceRepository>,
    token_repo: Arc<TokenRepository>,
    bridge: Arc<dyn WarehouseBridge>,
    task_runner: Arc<TaskRunner>,
}

impl LifecycleWatcher {
    pub fn new(
        clock: Arc<dyn Clock>,
        project_id: ProjectId,
        file_repo: Arc<FileRepository>,
        slice_repo: Arc<SliceRepository>,
        token_repo: Arc<TokenRepository>,
        bridge: Arc<dyn WarehouseBridge>,
        task_runner: Arc<TaskRunner>,
    ) -> Self {
        Self { clock, project_id, file_repo, slice_repo, token_repo, bridge, task_runner }
    }

    pub async fn run(&self, cancel: CancellationToken) {
        let mut slices = self.slice_repo.watch_level(Level::Local);
        let mut files = self.file_repo.watch_level(Level::Local);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                msg = slices.next() => match msg {
                    Some(Ok(WatchMessage::Events { events, .. })) => self.handle_slice_events(events).await,
                    Some(Ok(WatchMessage::Restart)) => slices = self.slice_repo.watch_level(Level::Local),
                    Some(Err(e)) => warn!("slice level watch error: {e}"),
                    None => return,
                },
                msg = files.next() => match msg {
                    Some(Ok(WatchMessage::Events { events, .. })) => self.handle_file_events(events).await,
                    Some(Ok(WatchMessage::Restart)) => files = self.file_repo.watch_level(Level::Local),
                    Some(Err(e)) => warn!("file level watch error: {e}"),
                    None => return,
                },
            }
        }
    }

    async fn handle_slice_events(&self, events: Vec<WatchEvent>) {
        for event in events {
            if event.kind == EventKind::Delete {
                continue;
            }
            let Ok(slice) = serde_json::from_slice::<Slice>(&event.kv.value) else { continue };
            if slice.state != SliceState::Closing {
                continue;
            }
            self.start_slice_upload(slice).await;
        }
    }

    async fn start_slice_upload(&self, slice: Slice) {
        let slice_key = slice.key();
        let file_key = slice_key.file.clone();
        let lock_name = format!("slice.upload/{}", slice_key.path());
        let file_repo = self.file_repo.clone();
        let slice_repo = self.slice_repo.clone();
        let token_repo = self.token_repo.clone();
        let bridge = self.bridge.clone();
        let clock = self.clock.clone();

        let outcome = self
            .task_runner
            .start(self.project_id.clone(), "slice.upload", lock_name, move |_token| async move {
                upload_slice(&file_repo, &slice_repo, &token_repo, bridge.as_ref(), clock.as_ref(), &slice)
                    .await
                    .map_err(|e| e.to_string())
            })
            .await;
        match outcome {
            Ok(_) => {
                // The slice reaching Uploaded doesn't rewrite the parent
                // File record, so no watch event will ever fire for it;
                // check right here whether the File can now be imported.
                self.try_start_file_import(&file_key).await;
            }
            Err(e) => warn!("failed to start slice.upload: {e}"),
        }
    }

    async fn handle_file_events(&self, events: Vec<WatchEvent>) {
        for event in events {
            if event.kind == EventKind::Delete {
                continue;
            }
            let Ok(file) = serde_json::from_slice::<File>(&event.kv.value) else { continue };
            if file.state != FileState::Closing {
                continue;
            }
            self.try_start_file_import(&file.key()).await;
        }
    }

    /// Starts a `file.import` task if `file_key` is `Closing` and every
    /// one of its slices has reached `Uploaded`. Called both off the
    /// File watch (handles the file entering `Closing` after all its
    /// slices already uploaded) and right after each slice upload
    /// (handles the far more common case of the last slice finishing
    /// after the file was already `Closing`).
    async fn try_start_file_import(&self, file_key: &FileKey) {
        let Ok(file) = self.file_repo.get(file_key).await else { return };
        if file.state != FileState::Closing {
            return;
        }
        let Ok(slices) = self.slice_repo.list_in_file(file_key).await else { return };
        if slices.is_empty() || !slices.iter().all(|s| s.state == SliceState::Uploaded) {
            return;
        }

        let lock_name = format!("file.import/{}", file_key.path());
        let file_repo = self.file_repo.clone();
        let bridge = self.bridge.clone();
        let clock = self.clock.clone();
        let project_id = self.project_id.clone();

        let outcome = self
            .task_runner
            .start(project_id, "file.import", lock_name, move |_token| async move {
                import_file(&file_repo, bridge.as_ref(), clock.as_ref(), &file, &slices).await.map_err(|e| e.to_string())
            })
            .await;
        if let Err(e) = outcome {
            warn!("failed to start file.import: {e}");
        }
    }
}

async fn upload_slice(
    file_repo: &FileRepository,
    slice_repo: &SliceRepository,
    token_repo: &TokenRepository,
    bridge: &dyn WarehouseBridge,
    clock: &dyn Clock,
    slice: &Slice,
) -> Result<String> {
    let file = file_repo.get(&slice.key().file).await?;
    let path = local_slice_path(&file.local_storage, slice);
    let bytes = tokio::fs::read(&path).await.unwrap_or_default();

    let now = clock.now();
    slice_repo.state_transition(&slice.key(), SliceState::Closing, SliceState::Uploading, now, None).await?;

    let sink_key = slice.key().file.sink;
    let mut token = token_repo.get(&sink_key).await?;
    if let Err(e) = bridge.upload_slice(&token.token, bytes.clone()).await {
        if !e.code.is_credentials_expired() {
            slice_repo.increment_retry(&slice.key(), e.message.clone(), now).await?;
            return Err(crate::error::Error::Retryable(e.message));
        }
        let refreshed = bridge.create_file_resource(&sink_key).await.map_err(|e| crate::error::Error::Retryable(e.message))?;
        token = token_repo.refresh(&sink_key, refreshed.credentials, now).await?;
        bridge
            .upload_slice(&token.token, bytes)
            .await
            .map_err(|e| crate::error::Error::Retryable(e.message))?;
    }

    slice_repo.state_transition(&slice.key(), SliceState::Uploading, SliceState::Uploaded, now, None).await?;
    Ok(format!("uploaded {}", slice.key().path()))
}

async fn import_file(
    file_repo: &FileRepository,
    bridge: &dyn WarehouseBridge,
    clock: &dyn Clock,
    file: &File,
    slices: &[Slice],
) -> Result<String> {
    let now = clock.now();
    let Some(target_table) = file.target_table.clone() else {
        return Err(crate::error::Error::BadRequest(format!("file {} has no target table assigned", file.key().path())));
    };
    let table = TableKey { project_id: file.project_id.clone(), table_id: target_table };

    bridge
        .ensure_table(&table, &file.columns, &[])
        .await
        .map_err(|e| crate::error::Error::Retryable(e.message))?;

    let staged_files: Vec<String> = slices
        .iter()
        .filter(|s| !s.is_empty)
        .map(|s| local_slice_path(&file.local_storage, s).to_string_lossy().to_string())
        .collect();

    bridge
        .load_table(&table, &staged_files, &file.columns, &[])
        .await
        .map_err(|e| crate::error::Error::Retryable(e.message))?;

    file_repo.state_transition(&file.key(), FileState::Closing, FileState::Importing, now).await?;
    file_repo.state_transition(&file.key(), FileState::Importing, FileState::Imported, now).await?;
    Ok(format!("imported {}", file.key().path()))
}
