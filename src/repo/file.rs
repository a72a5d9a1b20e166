//! File repository: `Rotate`, `CloseAllIn`, `StateTransition`,
//! `IncrementRetry`, `Delete`. Every mutation compiles to one merged
//! transaction against the canonical `all/` record, the exact-state
//! index, and the coarser `level/` index.

use crate::clock::format_ts;
use crate::config::BackoffPolicy;
use crate::error::{Error, Result};
use crate::ids::{FileKey, SinkKey, TableId};
use crate::kv::{Compare, KvStore, RangeOptions, SortOrder, Txn, WatchOptions};
use crate::repo::model::{
    File, FileState, Level, LocalStorageConfig, RetryInfo, Slice, SliceState, StagingConfig,
    Stats, Volume, VolumeAssignmentConfig,
};
use crate::repo::schema;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::Arc;

pub struct FileRepository {
    store: Arc<dyn KvStore>,
}

fn decode(bytes: &[u8]) -> Result<File> {
    serde_json::from_slice(bytes).map_err(Error::from)
}

fn decode_slice(bytes: &[u8]) -> Result<Slice> {
    serde_json::from_slice(bytes).map_err(Error::from)
}

/// Picks `count` volumes, preferring listed types, spreading across
/// distinct nodes where possible, tie-broken by label.
pub fn assign_volumes(volumes: &[Volume], cfg: &VolumeAssignmentConfig) -> Vec<Volume> {
    let mut candidates: Vec<&Volume> = volumes.iter().collect();
    candidates.sort_by(|a, b| {
        let rank = |v: &&Volume| cfg.preferred_types.iter().position(|t| t == &v.volume_type).unwrap_or(usize::MAX);
        rank(a).cmp(&rank(b)).then_with(|| a.label.cmp(&b.label))
    });

    let mut chosen: Vec<Volume> = Vec::new();
    let mut used_nodes = HashSet::new();
    for v in &candidates {
        if chosen.len() >= cfg.count {
            break;
        }
        if used_nodes.insert(v.node_id.clone()) {
            chosen.push((*v).clone());
        }
    }
    if chosen.len() < cfg.count {
        for v in &candidates {
            if chosen.len() >= cfg.count {
                break;
            }
            if !chosen.iter().any(|c| c.volume_id == v.volume_id) {
                chosen.push((*v).clone());
            }
        }
    }
    chosen
}

impl FileRepository {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    pub async fn get(&self, key: &FileKey) -> Result<File> {
        let kv = self
            .store
            .get(&schema::file_all_key(key))
            .await?
            .ok_or_else(|| Error::NotFound(format!("file {}", key.path())))?;
        decode(&kv.value)
    }

    pub async fn writing_file(&self, sink: &SinkKey) -> Result<Option<File>> {
        let prefix = schema::file_state_sink_prefix(FileState::Writing, sink);
        let page = self.store.range_get(&prefix, RangeOptions { limit: 2, ..Default::default() }).await?;
        match page.items.first() {
            Some(kv) => Ok(Some(decode(&kv.value)?)),
            None => Ok(None),
        }
    }

    pub async fn list_in_sink(&self, sink: &SinkKey) -> Result<Vec<File>> {
        let prefix = schema::file_all_sink_prefix(sink);
        let mut out = Vec::new();
        let page = self
            .store
            .range_get(&prefix, RangeOptions { sort: SortOrder::Asc, limit: 10_000, from_rev: None })
            .await?;
        for kv in page.items {
            out.push(decode(&kv.value)?);
        }
        Ok(out)
    }

    async fn slices_of(&self, file: &FileKey) -> Result<Vec<Slice>> {
        let prefix = schema::slice_all_file_prefix(file);
        let page = self
            .store
            .range_get(&prefix, RangeOptions { sort: SortOrder::Asc, limit: 10_000, from_rev: None })
            .await?;
        page.items.iter().map(|kv| decode_slice(&kv.value)).collect()
    }

    /// Creates a new writing File with one writing Slice per assigned
    /// volume, closing the sink's previous writing file (and its
    /// slices) in the same transaction. Fails with `AlreadyExists` if
    /// `now` collides with an existing file's `openedAt`.
    pub async fn rotate(
        &self,
        sink: &SinkKey,
        volume_assignment: VolumeAssignmentConfig,
        volumes: &[Volume],
        local_storage: LocalStorageConfig,
        staging: Option<StagingConfig>,
        now: DateTime<Utc>,
    ) -> Result<(File, Vec<Slice>)> {
        self.rotate_for_table(sink, volume_assignment, volumes, local_storage, staging, None, Vec::new(), now).await
    }

    /// Same as [`Self::rotate`] but also stamps the File with the
    /// warehouse table and column list it will eventually be loaded
    /// into, so `file.import` has somewhere to load it without reaching
    /// back into the sink definition.
    #[allow(clippy::too_many_arguments)]
    pub async fn rotate_for_table(
        &self,
        sink: &SinkKey,
        volume_assignment: VolumeAssignmentConfig,
        volumes: &[Volume],
        local_storage: LocalStorageConfig,
        staging: Option<StagingConfig>,
        target_table: Option<TableId>,
        columns: Vec<String>,
        now: DateTime<Utc>,
    ) -> Result<(File, Vec<Slice>)> {
        let opened_at = format_ts(now);
        let new_key = FileKey { sink: sink.clone(), opened_at: opened_at.clone() };
        let new_all_key = schema::file_all_key(&new_key);

        let assigned = assign_volumes(volumes, &volume_assignment);
        let assigned_ids = assigned.iter().map(|v| v.volume_id.clone()).collect::<Vec<_>>();

        let file = File {
            project_id: sink.source.branch.project_id.clone(),
            branch_id: sink.source.branch.branch_id.clone(),
            source_id: sink.source.source_id.clone(),
            sink_id: sink.sink_id.clone(),
            opened_at: opened_at.clone(),
            state: FileState::Writing,
            file_type: "csv".to_string(),
            columns,
            volume_assignment,
            assigned_volume_ids: assigned_ids,
            local_storage,
            staging,
            target_table,
            closing_at: None,
            importing_at: None,
            imported_at: None,
            retry: RetryInfo::default(),
        };

        let mut base_txn = Txn::new()
            .if_cond(Compare::KeyMissing(new_all_key.clone()))
            .then_put(new_all_key, serde_json::to_vec(&file)?, None)
            .then_put(schema::file_state_key(FileState::Writing, &new_key), serde_json::to_vec(&file)?, None)
            .then_put(schema::file_level_key(Level::Local, &new_key), serde_json::to_vec(&file)?, None);

        let mut slices = Vec::with_capacity(assigned.len());
        for volume in &assigned {
            let slice = Slice {
                project_id: file.project_id.clone(),
                branch_id: file.branch_id.clone(),
                source_id: file.source_id.clone(),
                sink_id: file.sink_id.clone(),
                file_opened_at: opened_at.clone(),
                volume_id: volume.volume_id.clone(),
                slice_opened_at: opened_at.clone(),
                state: SliceState::Writing,
                is_empty: true,
                stats: Stats::default(),
                closing_at: None,
                uploading_at: None,
                uploaded_at: None,
                retry: RetryInfo::default(),
            };
            let slice_key = slice.key();
            let slice_all = schema::slice_all_key(&slice_key);
            base_txn = base_txn
                .if_cond(Compare::KeyMissing(slice_all.clone()))
                .then_put(slice_all, serde_json::to_vec(&slice)?, None)
                .then_put(schema::slice_state_key(SliceState::Writing, &slice_key), serde_json::to_vec(&slice)?, None)
                .then_put(schema::slice_level_key(Level::Local, &slice_key), serde_json::to_vec(&slice)?, None);
            slices.push(slice);
        }

        // Closing the predecessor reads current store state, so it has
        // to be redone on every retry rather than computed once.
        let resp = crate::kv::retry::retry_mutation(|| async {
            let mut txn = base_txn.clone();

            if let Some(mut predecessor) = self.writing_file(sink).await? {
                let pred_key = predecessor.key();
                let pred_slices = self.slices_of(&pred_key).await?;
                txn = txn
                    .then_delete(schema::file_state_key(FileState::Writing, &pred_key))
                    .then_delete(schema::file_level_key(Level::Local, &pred_key));
                predecessor.state = FileState::Closing;
                predecessor.closing_at = Some(opened_at.clone());
                txn = txn
                    .then_put(schema::file_all_key(&pred_key), serde_json::to_vec(&predecessor)?, None)
                    .then_put(schema::file_state_key(FileState::Closing, &pred_key), serde_json::to_vec(&predecessor)?, None)
                    .then_put(schema::file_level_key(Level::Local, &pred_key), serde_json::to_vec(&predecessor)?, None);

                for mut s in pred_slices {
                    if s.state != SliceState::Writing {
                        continue;
                    }
                    let sk = s.key();
                    s.state = SliceState::Closing;
                    s.closing_at = Some(opened_at.clone());
                    txn = txn
                        .then_delete(schema::slice_state_key(SliceState::Writing, &sk))
                        .then_put(schema::slice_all_key(&sk), serde_json::to_vec(&s)?, None)
                        .then_put(schema::slice_state_key(SliceState::Closing, &sk), serde_json::to_vec(&s)?, None)
                        .then_put(schema::slice_level_key(Level::Local, &sk), serde_json::to_vec(&s)?, None);
                }
            }

            txn.commit(self.store.as_ref()).await
        })
        .await?;

        if !resp.succeeded {
            return Err(Error::AlreadyExists(format!("file at {}", new_key.path())));
        }
        Ok((file, slices))
    }

    /// Transitions the sink's current writing file (and its writing
    /// slices) straight to `closing`. No-op if no file is writing.
    pub async fn close_all_in(&self, sink: &SinkKey, now: DateTime<Utc>) -> Result<Option<File>> {
        let now_s = format_ts(now);

        crate::kv::retry::retry_mutation(|| async {
            let Some(mut file) = self.writing_file(sink).await? else {
                return Ok(None);
            };
            let key = file.key();
            let slices = self.slices_of(&key).await?;

            let mut txn = Txn::new()
                .then_delete(schema::file_state_key(FileState::Writing, &key))
                .then_delete(schema::file_level_key(Level::Local, &key));
            file.state = FileState::Closing;
            file.closing_at = Some(now_s.clone());
            txn = txn
                .then_put(schema::file_all_key(&key), serde_json::to_vec(&file)?, None)
                .then_put(schema::file_state_key(FileState::Closing, &key), serde_json::to_vec(&file)?, None)
                .then_put(schema::file_level_key(Level::Local, &key), serde_json::to_vec(&file)?, None);

            for mut s in slices {
                if s.state != SliceState::Writing {
                    continue;
                }
                let sk = s.key();
                s.state = SliceState::Closing;
                s.closing_at = Some(now_s.clone());
                txn = txn
                    .then_delete(schema::slice_state_key(SliceState::Writing, &sk))
                    .then_put(schema::slice_all_key(&sk), serde_json::to_vec(&s)?, None)
                    .then_put(schema::slice_state_key(SliceState::Closing, &sk), serde_json::to_vec(&s)?, None)
                    .then_put(schema::slice_level_key(Level::Local, &sk), serde_json::to_vec(&s)?, None);
            }

            txn.commit(self.store.as_ref()).await?;
            Ok(Some(file))
        })
        .await
    }

    /// Guarded single-step transition. `closing→importing` asserts no
    /// sibling slice is still `closing`; `importing→imported` asserts
    /// every slice is `uploaded`.
    pub async fn state_transition(&self, key: &FileKey, from: FileState, to: FileState, now: DateTime<Utc>) -> Result<File> {
        crate::kv::retry::retry_mutation(|| async {
            let mut file = self.get(key).await?;
            if file.state != from {
                return Err(Error::BadRequest(format!(
                    "file {} is in state {:?}, expected {:?}",
                    key.path(),
                    file.state,
                    from
                )));
            }

            if to == FileState::Importing {
                let slices = self.slices_of(key).await?;
                if let Some(bad) = slices.iter().find(|s| s.state == SliceState::Closing) {
                    return Err(Error::BadRequest(format!(
                        "slice {} is still closing",
                        bad.key().path()
                    )));
                }
            }
            if to == FileState::Imported {
                let slices = self.slices_of(key).await?;
                if let Some(bad) = slices.iter().find(|s| s.state != SliceState::Uploaded) {
                    return Err(Error::BadRequest(format!(
                        "slice {} is not uploaded",
                        bad.key().path()
                    )));
                }
            }

            let now_s = format_ts(now);
            file.state = to;
            file.retry = RetryInfo::default();
            match to {
                FileState::Closing => file.closing_at = Some(now_s),
                FileState::Importing => file.importing_at = Some(now_s),
                FileState::Imported => file.imported_at = Some(now_s),
                FileState::Failed | FileState::Writing => {}
            }

            let txn = Txn::new()
                .if_cond(Compare::KeyExists(schema::file_state_key(from, key)))
                .then_delete(schema::file_state_key(from, key))
                .then_delete(schema::file_level_key(from.into(), key))
                .then_put(schema::file_all_key(key), serde_json::to_vec(&file)?, None)
                .then_put(schema::file_state_key(to, key), serde_json::to_vec(&file)?, None)
                .then_put(schema::file_level_key(to.into(), key), serde_json::to_vec(&file)?, None);
            let resp = txn.commit(self.store.as_ref()).await?;
            if !resp.succeeded {
                return Err(Error::StaleRevision(format!("file {} changed state concurrently", key.path())));
            }
            Ok(file)
        })
        .await
    }

    pub async fn increment_retry(&self, key: &FileKey, reason: String, now: DateTime<Utc>) -> Result<File> {
        crate::kv::retry::retry_mutation(|| async {
            let mut file = self.get(key).await?;
            file.retry.retry_attempt += 1;
            file.retry.retry_reason = Some(reason.clone());
            file.retry.last_failed_at = Some(format_ts(now));
            let delay = BackoffPolicy::RETRY_AFTER.delay_for_attempt(file.retry.retry_attempt);
            file.retry.retry_after = Some(format_ts(now + chrono::Duration::from_std(delay).unwrap_or_default()));
            self.store.put(&schema::file_all_key(key), serde_json::to_vec(&file)?, None).await?;
            Ok(file)
        })
        .await
    }

    /// Deletes the File and every Slice beneath it across all indices.
    pub async fn delete(&self, key: &FileKey) -> Result<()> {
        crate::kv::retry::retry_mutation(|| async {
            let file = self.get(key).await?;
            let slices = self.slices_of(key).await?;
            let mut txn = Txn::new()
                .then_delete(schema::file_all_key(key))
                .then_delete(schema::file_state_key(file.state, key))
                .then_delete(schema::file_level_key(file.level(), key));
            for s in slices {
                let sk = s.key();
                txn = txn
                    .then_delete(schema::slice_all_key(&sk))
                    .then_delete(schema::slice_state_key(s.state, &sk))
                    .then_delete(schema::slice_level_key(s.level(), &sk));
            }
            txn.commit(self.store.as_ref()).await?;
            Ok(())
        })
        .await
    }

    /// Watches the coarse `level/` index — the set a scheduler or
    /// uploader actually cares about.
    pub fn watch_level(&self, level: Level) -> crate::kv::WatchStream {
        self.store.watch(&schema::file_level_prefix(level), WatchOptions::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::{BranchKey, ProjectId, SinkId, SourceKey};
    use crate::kv::mock::MockStore;

    fn sink_key() -> SinkKey {
        SinkKey {
            source: SourceKey {
                branch: BranchKey { project_id: ProjectId::from("123"), branch_id: "456".into() },
                source_id: "s".into(),
            },
            sink_id: SinkId::from("k1"),
        }
    }

    fn volume(id: &str, kind: &str) -> Volume {
        Volume { volume_id: id.into(), node_id: format!("node-{id}"), volume_type: kind.into(), label: id.into(), path: format!("/mnt/{id}") }
    }

    #[test]
    fn assign_volumes_prefers_preferred_type_and_ties_by_label() {
        let volumes = vec![
            volume("v1", "hdd"),
            volume("v2", "ssd"),
            volume("v3", "hdd"),
            volume("v4", "ssd"),
            volume("v5", "hdd"),
        ];
        let cfg = VolumeAssignmentConfig { count: 3, preferred_types: vec!["hdd".into()] };
        let chosen = assign_volumes(&volumes, &cfg);
        let ids: Vec<_> = chosen.iter().map(|v| v.volume_id.to_string()).collect();
        assert_eq!(ids, vec!["v1", "v3", "v5"]);
    }

    #[tokio::test]
    async fn rotate_then_rotate_again_is_already_exists() {
        let store = MockStore::new();
        let repo = FileRepository::new(store);
        let now: DateTime<Utc> = "2000-01-01T02:00:00.000Z".parse().unwrap();
        let volumes = vec![volume("v1", "hdd")];
        let cfg = VolumeAssignmentConfig { count: 1, preferred_types: vec!["hdd".into()] };

        repo.rotate(&sink_key(), cfg.clone(), &volumes, LocalStorageConfig::default(), None, now).await.unwrap();
        let err = repo
            .rotate(&sink_key(), cfg, &volumes, LocalStorageConfig::default(), None, now)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn rotate_closes_predecessor_file_and_its_slices() {
        let store = MockStore::new();
        let repo = FileRepository::new(store);
        let volumes = vec![volume("v1", "hdd")];
        let cfg = VolumeAssignmentConfig { count: 1, preferred_types: vec!["hdd".into()] };

        let t1: DateTime<Utc> = "2000-01-01T02:00:00.000Z".parse().unwrap();
        let (first, _) = repo.rotate(&sink_key(), cfg.clone(), &volumes, LocalStorageConfig::default(), None, t1).await.unwrap();

        let t2: DateTime<Utc> = "2000-01-01T03:00:00.000Z".parse().unwrap();
        repo.rotate(&sink_key(), cfg, &volumes, LocalStorageConfig::default(), None, t2).await.unwrap();

        let reloaded = repo.get(&first.key()).await.unwrap();
        assert_eq!(reloaded.state, FileState::Closing);
        assert!(reloaded.closing_at.is_some());
    }

    #[tokio::test]
    async fn close_all_in_cascades_to_slices() {
        let store = MockStore::new();
        let repo = FileRepository::new(store);
        let volumes = vec![volume("v1", "hdd"), volume("v2", "hdd")];
        let cfg = VolumeAssignmentConfig { count: 2, preferred_types: vec!["hdd".into()] };
        let t1: DateTime<Utc> = "2000-01-01T02:00:00.000Z".parse().unwrap();
        let (file, slices) = repo.rotate(&sink_key(), cfg, &volumes, LocalStorageConfig::default(), None, t1).await.unwrap();
        assert_eq!(slices.len(), 2);

        let t2: DateTime<Utc> = "2000-01-01T05:00:00.000Z".parse().unwrap();
        let closed = repo.close_all_in(&sink_key(), t2).await.unwrap().unwrap();
        assert_eq!(closed.state, FileState::Closing);

        for s in repo.slices_of(&file.key()).await.unwrap() {
            assert_eq!(s.state, SliceState::Closing);
            assert!(s.closing_at.is_some());
        }
    }

    #[tokio::test]
    async fn state_transition_rejects_importing_with_closing_sibling() {
        let store = MockStore::new();
        let repo = FileRepository::new(store);
        let volumes = vec![volume("v1", "hdd")];
        let cfg = VolumeAssignmentConfig { count: 1, preferred_types: vec!["hdd".into()] };
        let t1: DateTime<Utc> = "2000-01-01T02:00:00.000Z".parse().unwrap();
        let (file, _) = repo.rotate(&sink_key(), cfg, &volumes, LocalStorageConfig::default(), None, t1).await.unwrap();

        let t2: DateTime<Utc> = "2000-01-01T05:00:00.000Z".parse().unwrap();
        repo.close_all_in(&sink_key(), t2).await.unwrap();

        let err = repo
            .state_transition(&file.key(), FileState::Closing, FileState::Importing, t2)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::BadRequest(_)));
    }
}
