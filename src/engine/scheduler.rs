//! Wall-clock trigger: on each tick, close a sink's writing file once it
//! exceeds its configured age or byte threshold, and rotate any slice
//! that exceeds its own per-slice threshold.

use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::ids::SinkKey;
use crate::repo::model::SliceState;
use crate::repo::{FileRepository, SinkRepository, SliceRepository};
use crate::tasks::TaskRunner;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

fn sink_key_of(sink: &crate::repo::model::Sink) -> SinkKey {
    SinkKey {
        source: crate::ids::SourceKey {
            branch: crate::ids::BranchKey { project_id: sink.project_id.clone(), branch_id: sink.branch_id.clone() },
            source_id: sink.source_id.clone(),
        },
        sink_id: sink.sink_id.clone(),
    }
}

pub struct Scheduler {
    clock: Arc<dyn Clock>,
    sink_repo: Arc<SinkRepository>,
    file_repo: Arc<FileRepository>,
    slice_repo: Arc<SliceRepository>,
    task_runner: Arc<TaskRunner>,
    config: EngineConfig,
    tick_interval: Duration,
}

impl Scheduler {
    pub fn new(
        clock: Arc<dyn Clock>,
        sink_repo: Arc<SinkRepository>,
        file_repo: Arc<FileRepository>,
        slice_repo: Arc<SliceRepository>,
        task_runner: Arc<TaskRunner>,
        config: EngineConfig,
        tick_interval: Duration,
    ) -> Self {
        Self { clock, sink_repo, file_repo, slice_repo, task_runner, config, tick_interval }
    }

    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.tick_interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {
                    if let Err(e) = self.tick().await {
                        warn!("scheduler tick failed: {e}");
                    }
                }
            }
        }
    }

    async fn tick(&self) -> crate::error::Result<()> {
        let now = self.clock.now();
        for sink in self.sink_repo.list().await? {
            let sink_key = sink_key_of(&sink);
            let Some(file) = self.file_repo.writing_file(&sink_key).await? else { continue };
            let file_key = file.key();
            let opened_at = crate::clock::parse_ts(&file.opened_at)?;
            let age_seconds = (now - opened_at).num_seconds().max(0) as u64;

            let slices = self.slice_repo.list_in_file(&file_key).await?;
            let total_bytes: u64 = slices.iter().map(|s| s.stats.uncompressed_bytes).sum();

            if age_seconds > sink.max_file_age_seconds || total_bytes > sink.max_file_bytes {
                let lock_name = format!("file.close/{}", sink_key.path());
                let file_repo = self.file_repo.clone();
                let sk = sink_key.clone();
                self.task_runner
                    .start(sink.project_id.clone(), "file.close", lock_name, move |_token| async move {
                        file_repo.close_all_in(&sk, now).await.map(|_| "closed".to_string()).map_err(|e| e.to_string())
                    })
                    .await?;
                continue;
            }

            for slice in slices {
                if slice.state != SliceState::Writing {
                    continue;
                }
                let slice_opened_at = crate::clock::parse_ts(&slice.slice_opened_at)?;
                let slice_age_seconds = (now - slice_opened_at).num_seconds().max(0) as u64;
                if slice.stats.uncompressed_bytes <= self.config.per_slice_max_bytes
                    && slice_age_seconds <= self.config.per_slice_max_age_seconds
                {
                    continue;
                }

                let lock_name = format!("slice.rotate/{}", slice.key().path());
                let slice_repo = self.slice_repo.clone();
                let file_key = file_key.clone();
                let volume_id = slice.volume_id.clone();
                let slice_key = slice.key();
                self.task_runner
                    .start(sink.project_id.clone(), "slice.rotate", lock_name, move |_token| async move {
                        slice_repo
                            .state_transition(&slice_key, SliceState::Writing, SliceState::Closing, now, None)
                            .await
                            .map_err(|e| e.to_string())?;
                        slice_repo
                            .rotate(&file_key, volume_id.as_str(), now)
                            .await
                            .map(|_| "rotated".to_string())
                            .map_err(|e| e.to_string())
                    })
                    .await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;
    use crate::kv::mock::MockStore;
    use crate::kv::store::KvStore;
    use crate::repo::model::{LocalStorageConfig, Sink, VolumeAssignmentConfig, Volume};
    use crate::repo::VolumeRepository;

    #[tokio::test]
    async fn stale_file_triggers_a_close_task() {
        let store = MockStore::new();
        let file_repo = Arc::new(FileRepository::new(store.clone()));
        let slice_repo = Arc::new(SliceRepository::new(store.clone()));
        let sink_repo = Arc::new(crate::repo::SinkRepository::new(store.clone()));
        let volume_repo = Arc::new(VolumeRepository::new(store.clone()));

        let start: chrono::DateTime<chrono::Utc> = "2000-01-01T00:00:00.000Z".parse().unwrap();
        let clock = Arc::new(MockClock::new(start));

        let sink = Sink {
            project_id: "p".into(),
            branch_id: "b".into(),
            source_id: "s".into(),
            sink_id: "k".into(),
            name: "sink".into(),
            volume_assignment: VolumeAssignmentConfig { count: 1, preferred_types: vec!["hdd".into()] },
            target_table: "t".into(),
            columns: vec!["a".into(), "b".into()],
            max_file_age_seconds: 60,
            max_file_bytes: 1_000_000,
        };
        sink_repo.put(&sink).await.unwrap();

        let volume = Volume { volume_id: "v1".into(), node_id: "n1".into(), volume_type: "hdd".into(), label: "v1".into(), path: "/mnt/v1".into() };
        volume_repo.register_writer_volume(&volume, crate::kv::LeaseId(1)).await.unwrap();

        let sink_key = sink_key_of(&sink);
        file_repo
            .rotate_for_table(
                &sink_key,
                sink.volume_assignment.clone(),
                &[volume],
                LocalStorageConfig::default(),
                None,
                Some(sink.target_table.clone()),
                sink.columns.clone(),
                clock.now(),
            )
            .await
            .unwrap();

        clock.advance(Duration::from_secs(120));

        let session = store.new_session(Duration::from_secs(15)).await.unwrap();
        let task_runner = TaskRunner::new(store.clone(), clock.clone(), "node-a".into(), Arc::from(session));

        let scheduler = Scheduler::new(clock.clone(), sink_repo, file_repo.clone(), slice_repo, task_runner, EngineConfig::default(), Duration::from_secs(1));
        scheduler.tick().await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        let writing = file_repo.writing_file(&sink_key).await.unwrap();
        assert!(writing.is_none());
    }
}
