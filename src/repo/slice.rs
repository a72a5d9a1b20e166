//! Slice repository: per-volume `Rotate`, `StateTransition`,
//! `IncrementRetry`, `Delete`. Mirrors `FileRepository` but additionally
//! enforces that no earlier sibling slice (by `sliceOpenedAt`) is still
//! open before a new one is allowed to open on the same volume.

use crate::clock::format_ts;
use crate::config::BackoffPolicy;
use crate::error::{Error, Result};
use crate::ids::{FileKey, SliceKey};
use crate::kv::{Compare, KvStore, RangeOptions, SortOrder, Txn, WatchOptions};
use crate::repo::model::{Level, RetryInfo, Slice, SliceState, Stats};
use crate::repo::schema;
use chrono::{DateTime, Utc};
use std::sync::Arc;

pub struct SliceRepository {
    store: Arc<dyn KvStore>,
}

fn decode(bytes: &[u8]) -> Result<Slice> {
    serde_json::from_slice(bytes).map_err(Error::from)
}

impl SliceRepository {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    pub async fn get(&self, key: &SliceKey) -> Result<Slice> {
        let kv = self
            .store
            .get(&schema::slice_all_key(key))
            .await?
            .ok_or_else(|| Error::NotFound(format!("slice {}", key.path())))?;
        decode(&kv.value)
    }

    pub async fn list_in_file(&self, file: &FileKey) -> Result<Vec<Slice>> {
        let prefix = schema::slice_all_file_prefix(file);
        let page = self
            .store
            .range_get(&prefix, RangeOptions { sort: SortOrder::Asc, limit: 10_000, from_rev: None })
            .await?;
        page.items.iter().map(|kv| decode(&kv.value)).collect()
    }

    /// Refuses to open a new slice on `volume_id` while an earlier one
    /// (by `sliceOpenedAt`) is not yet `closing` or beyond.
    async fn assert_no_earlier_open(&self, file: &FileKey, volume_id: &str, before: &str) -> Result<()> {
        let prefix = schema::slice_state_file_prefix(SliceState::Writing, file);
        let page = self.store.range_get(&prefix, RangeOptions { limit: 10_000, ..Default::default() }).await?;
        for kv in page.items {
            let s: Slice = decode(&kv.value)?;
            if s.volume_id.as_str() == volume_id && s.slice_opened_at.as_str() < before {
                return Err(Error::BadRequest(format!(
                    "slice {} on volume {volume_id} is still writing",
                    s.key().path()
                )));
            }
        }
        Ok(())
    }

    /// Opens a new writing slice on `volume_id` within `file`, e.g.
    /// because the previous one hit its size or age threshold.
    pub async fn rotate(&self, file: &FileKey, volume_id: &str, now: DateTime<Utc>) -> Result<Slice> {
        let opened_at = format_ts(now);
        let slice = Slice {
            project_id: file.sink.source.branch.project_id.clone(),
            branch_id: file.sink.source.branch.branch_id.clone(),
            source_id: file.sink.source.source_id.clone(),
            sink_id: file.sink.sink_id.clone(),
            file_opened_at: file.opened_at.clone(),
            volume_id: volume_id.into(),
            slice_opened_at: opened_at.clone(),
            state: SliceState::Writing,
            is_empty: true,
            stats: Stats::default(),
            closing_at: None,
            uploading_at: None,
            uploaded_at: None,
            retry: RetryInfo::default(),
        };
        let key = slice.key();
        let all_key = schema::slice_all_key(&key);
        let base_txn = Txn::new()
            .if_cond(Compare::KeyMissing(all_key.clone()))
            .then_put(all_key, serde_json::to_vec(&slice)?, None)
            .then_put(schema::slice_state_key(SliceState::Writing, &key), serde_json::to_vec(&slice)?, None)
            .then_put(schema::slice_level_key(Level::Local, &key), serde_json::to_vec(&slice)?, None);

        crate::kv::retry::retry_mutation(|| async {
            self.assert_no_earlier_open(file, volume_id, &opened_at).await?;
            let resp = base_txn.clone().commit(self.store.as_ref()).await?;
            if !resp.succeeded {
                return Err(Error::AlreadyExists(format!("slice at {}", key.path())));
            }
            Ok(slice.clone())
        })
        .await
    }

    /// Guarded single-step transition, folding per-node statistics and
    /// setting `isEmpty` the way a file-level close does for records
    /// that never made it into the statistics stream.
    pub async fn state_transition(
        &self,
        key: &SliceKey,
        from: SliceState,
        to: SliceState,
        now: DateTime<Utc>,
        stats: Option<Stats>,
    ) -> Result<Slice> {
        crate::kv::retry::retry_mutation(|| async {
            let mut slice = self.get(key).await?;
            if slice.state != from {
                return Err(Error::BadRequest(format!(
                    "slice {} is in state {:?}, expected {:?}",
                    key.path(),
                    slice.state,
                    from
                )));
            }

            let now_s = format_ts(now);
            slice.state = to;
            slice.retry = RetryInfo::default();
            if let Some(stats) = stats {
                slice.is_empty = stats.records_count == 0;
                slice.stats = stats;
            }
            match to {
                SliceState::Closing => slice.closing_at = Some(now_s),
                SliceState::Uploading => slice.uploading_at = Some(now_s),
                SliceState::Uploaded => slice.uploaded_at = Some(now_s),
                SliceState::Failed | SliceState::Writing => {}
            }

            let txn = Txn::new()
                .if_cond(Compare::KeyExists(schema::slice_state_key(from, key)))
                .then_delete(schema::slice_state_key(from, key))
                .then_delete(schema::slice_level_key(from.into(), key))
                .then_put(schema::slice_all_key(key), serde_json::to_vec(&slice)?, None)
                .then_put(schema::slice_state_key(to, key), serde_json::to_vec(&slice)?, None)
                .then_put(schema::slice_level_key(to.into(), key), serde_json::to_vec(&slice)?, None);
            let resp = txn.commit(self.store.as_ref()).await?;
            if !resp.succeeded {
                return Err(Error::StaleRevision(format!("slice {} changed state concurrently", key.path())));
            }
            Ok(slice)
        })
        .await
    }

    pub async fn increment_retry(&self, key: &SliceKey, reason: String, now: DateTime<Utc>) -> Result<Slice> {
        crate::kv::retry::retry_mutation(|| async {
            let mut slice = self.get(key).await?;
            slice.retry.retry_attempt += 1;
            slice.retry.retry_reason = Some(reason.clone());
            slice.retry.last_failed_at = Some(format_ts(now));
            let delay = BackoffPolicy::RETRY_AFTER.delay_for_attempt(slice.retry.retry_attempt);
            slice.retry.retry_after = Some(format_ts(now + chrono::Duration::from_std(delay).unwrap_or_default()));
            self.store.put(&schema::slice_all_key(key), serde_json::to_vec(&slice)?, None).await?;
            Ok(slice)
        })
        .await
    }

    pub async fn delete(&self, key: &SliceKey) -> Result<()> {
        crate::kv::retry::retry_mutation(|| async {
            let slice = self.get(key).await?;
            Txn::new()
                .then_delete(schema::slice_all_key(key))
                .then_delete(schema::slice_state_key(slice.state, key))
                .then_delete(schema::slice_level_key(slice.level(), key))
                .commit(self.store.as_ref())
                .await?;
            Ok(())
        })
        .await
    }

    pub fn watch_level(&self, level: Level) -> crate::kv::WatchStream {
        self.store.watch(&schema::slice_level_prefix(level), WatchOptions::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::{BranchKey, FileKey as IdsFileKey, ProjectId, SinkId, SinkKey, SourceKey};
    use crate::kv::mock::MockStore;

    fn file_key() -> IdsFileKey {
        IdsFileKey {
            sink: SinkKey {
                source: SourceKey {
                    branch: BranchKey { project_id: ProjectId::from("123"), branch_id: "456".into() },
                    source_id: "s".into(),
                },
                sink_id: SinkId::from("k1"),
            },
            opened_at: "2000-01-01T02:00:00.000Z".into(),
        }
    }

    #[tokio::test]
    async fn rotate_rejects_second_open_slice_on_same_volume() {
        let store = MockStore::new();
        let repo = SliceRepository::new(store);
        let file = file_key();
        let t1: DateTime<Utc> = "2000-01-01T02:00:00.000Z".parse().unwrap();
        repo.rotate(&file, "v1", t1).await.unwrap();

        let t2: DateTime<Utc> = "2000-01-01T02:05:00.000Z".parse().unwrap();
        let err = repo.rotate(&file, "v1", t2).await.unwrap_err();
        assert!(matches!(err, Error::BadRequest(_)));
    }

    #[tokio::test]
    async fn rotate_allows_open_slice_on_a_different_volume() {
        let store = MockStore::new();
        let repo = SliceRepository::new(store);
        let file = file_key();
        let t1: DateTime<Utc> = "2000-01-01T02:00:00.000Z".parse().unwrap();
        repo.rotate(&file, "v1", t1).await.unwrap();
        let t2: DateTime<Utc> = "2000-01-01T02:05:00.000Z".parse().unwrap();
        repo.rotate(&file, "v2", t2).await.unwrap();
    }

    #[tokio::test]
    async fn state_transition_folds_stats_and_sets_is_empty() {
        let store = MockStore::new();
        let repo = SliceRepository::new(store);
        let file = file_key();
        let t1: DateTime<Utc> = "2000-01-01T02:00:00.000Z".parse().unwrap();
        let slice = repo.rotate(&file, "v1", t1).await.unwrap();

        let updated = repo
            .state_transition(&slice.key(), SliceState::Writing, SliceState::Closing, t1, Some(Stats::default()))
            .await
            .unwrap();
        assert!(updated.is_empty);
        assert_eq!(updated.state, SliceState::Closing);
    }
}
