//! End-to-end scenarios against the in-memory store: rotation, cascade
//! close, guarded promotion, task exclusivity, and crash recovery.

use chrono::{DateTime, Utc};
use silorunner::bridge::mock::MockBridge;
use silorunner::clock::SystemClock;
use silorunner::engine::LifecycleWatcher;
use silorunner::ids::{BranchKey, ProjectId, SinkId, SinkKey, SourceKey};
use silorunner::kv::mock::MockStore;
use silorunner::kv::KvStore;
use silorunner::repo::model::{
    FileState, LocalStorageConfig, SliceState, Token, Volume, VolumeAssignmentConfig,
};
use silorunner::repo::{FileRepository, SliceRepository, TokenRepository};
use silorunner::tasks::{TaskOutcome, TaskRunner};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

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

fn ts(s: &str) -> DateTime<Utc> {
    s.parse().unwrap()
}

#[tokio::test]
async fn rotate_create_picks_preferred_volumes() {
    let store = MockStore::new();
    let repo = FileRepository::new(store);
    let volumes = vec![volume("v1", "hdd"), volume("v2", "ssd"), volume("v3", "hdd"), volume("v4", "ssd"), volume("v5", "hdd")];
    let cfg = VolumeAssignmentConfig { count: 3, preferred_types: vec!["hdd".into()] };

    let (file, slices) = repo
        .rotate(&sink_key(), cfg, &volumes, LocalStorageConfig::default(), None, ts("2000-01-01T02:00:00.000Z"))
        .await
        .unwrap();

    assert_eq!(file.key().path(), "123/456/s/k1/2000-01-01T02:00:00.000Z");
    assert_eq!(file.state, FileState::Writing);
    let volume_ids: Vec<_> = slices.iter().map(|s| s.volume_id.to_string()).collect();
    assert_eq!(volume_ids, vec!["v1", "v3", "v5"]);
    assert!(slices.iter().all(|s| s.state == SliceState::Writing));
}

#[tokio::test]
async fn idempotent_rotate_is_rejected_on_exact_collision() {
    let store = MockStore::new();
    let repo = FileRepository::new(store);
    let volumes = vec![volume("v1", "hdd")];
    let cfg = VolumeAssignmentConfig { count: 1, preferred_types: vec!["hdd".into()] };
    let now = ts("2000-01-01T02:00:00.000Z");

    repo.rotate(&sink_key(), cfg.clone(), &volumes, LocalStorageConfig::default(), None, now).await.unwrap();
    let err = repo.rotate(&sink_key(), cfg, &volumes, LocalStorageConfig::default(), None, now).await.unwrap_err();
    assert!(matches!(err, silorunner::Error::AlreadyExists(_)));
}

#[tokio::test]
async fn close_cascade_closes_file_and_every_slice() {
    let store = MockStore::new();
    let file_repo = FileRepository::new(store.clone());
    let slice_repo = SliceRepository::new(store);
    let volumes = vec![volume("v1", "hdd"), volume("v2", "hdd"), volume("v3", "hdd")];
    let cfg = VolumeAssignmentConfig { count: 3, preferred_types: vec!["hdd".into()] };

    let (file, _) = file_repo
        .rotate(&sink_key(), cfg, &volumes, LocalStorageConfig::default(), None, ts("2000-01-01T02:00:00.000Z"))
        .await
        .unwrap();

    let closed = file_repo.close_all_in(&sink_key(), ts("2000-01-01T05:00:00.000Z")).await.unwrap().unwrap();
    assert_eq!(closed.state, FileState::Closing);
    assert_eq!(closed.closing_at.as_deref(), Some("2000-01-01T05:00:00.000Z"));

    for slice in slice_repo.list_in_file(&file.key()).await.unwrap() {
        assert_eq!(slice.state, SliceState::Closing);
        assert_eq!(slice.closing_at.as_deref(), Some("2000-01-01T05:00:00.000Z"));
    }
}

#[tokio::test]
async fn guarded_promotion_requires_every_slice_uploaded_first() {
    let store = MockStore::new();
    let file_repo = FileRepository::new(store.clone());
    let slice_repo = SliceRepository::new(store);
    let volumes = vec![volume("v1", "hdd"), volume("v2", "hdd")];
    let cfg = VolumeAssignmentConfig { count: 2, preferred_types: vec!["hdd".into()] };

    let (file, _) = file_repo
        .rotate(&sink_key(), cfg, &volumes, LocalStorageConfig::default(), None, ts("2000-01-01T02:00:00.000Z"))
        .await
        .unwrap();
    file_repo.close_all_in(&sink_key(), ts("2000-01-01T05:00:00.000Z")).await.unwrap();

    let now = ts("2000-01-01T05:00:01.000Z");
    let err = file_repo.state_transition(&file.key(), FileState::Closing, FileState::Importing, now).await.unwrap_err();
    assert!(matches!(err, silorunner::Error::BadRequest(_)));

    for slice in slice_repo.list_in_file(&file.key()).await.unwrap() {
        slice_repo.state_transition(&slice.key(), SliceState::Closing, SliceState::Uploading, now, None).await.unwrap();
        slice_repo
            .state_transition(&slice.key(), SliceState::Uploading, SliceState::Uploaded, now, Some(Default::default()))
            .await
            .unwrap();
    }

    let importing = file_repo.state_transition(&file.key(), FileState::Closing, FileState::Importing, now).await.unwrap();
    assert_eq!(importing.state, FileState::Importing);
}

#[tokio::test]
async fn exactly_one_node_wins_the_cleanup_lock() {
    let store = MockStore::new();
    let session_a = store.new_session(Duration::from_secs(15)).await.unwrap();
    let session_b = store.new_session(Duration::from_secs(15)).await.unwrap();
    let runner_a = TaskRunner::new(store.clone(), Arc::new(silorunner::clock::SystemClock), "node-a".into(), Arc::from(session_a));
    let runner_b = TaskRunner::new(store, Arc::new(silorunner::clock::SystemClock), "node-b".into(), Arc::from(session_b));

    let outcome_a = runner_a
        .start(ProjectId::from("123"), "tasks.cleanup", "tasks.cleanup".into(), |_| async { Ok("done".to_string()) })
        .await
        .unwrap();
    let outcome_b = runner_b
        .start(ProjectId::from("123"), "tasks.cleanup", "tasks.cleanup".into(), |_| async { Ok("done".to_string()) })
        .await
        .unwrap();

    assert!(matches!(outcome_a, TaskOutcome::Started(_)));
    assert_eq!(outcome_b, TaskOutcome::Ignored);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!runner_a.is_running("tasks.cleanup"));
}

#[tokio::test(start_paused = true)]
async fn crash_recovery_reclaims_an_expired_lock() {
    let store = MockStore::new();
    let crashed_session = store.new_session(Duration::from_secs(15)).await.unwrap();
    let survivor_session = store.new_session(Duration::from_secs(15)).await.unwrap();
    let crashing = TaskRunner::new(store.clone(), Arc::new(silorunner::clock::SystemClock), "node-crash".into(), Arc::from(crashed_session));
    let survivor = TaskRunner::new(store, Arc::new(silorunner::clock::SystemClock), "node-live".into(), Arc::from(survivor_session));

    crashing
        .start(ProjectId::from("123"), "slice.upload", "slice.upload/v1".into(), |_| async {
            std::future::pending::<()>().await;
            Ok("never".to_string())
        })
        .await
        .unwrap();

    // The crashed node's session keepalive is no longer renewed once its
    // task future is wedged and the process is gone; advance past the
    // lease TTL so the reaper deletes the lock key it held.
    tokio::time::advance(Duration::from_secs(16)).await;
    tokio::time::sleep(Duration::from_millis(10)).await;

    let outcome = survivor
        .start(ProjectId::from("123"), "slice.upload", "slice.upload/v1".into(), |_| async { Ok("retried".to_string()) })
        .await
        .unwrap();
    assert!(matches!(outcome, TaskOutcome::Started(_)));
}

#[tokio::test]
async fn lifecycle_watcher_uploads_and_imports_a_closing_file() {
    let store = MockStore::new();
    let file_repo = Arc::new(FileRepository::new(store.clone()));
    let slice_repo = Arc::new(SliceRepository::new(store.clone()));
    let token_repo = Arc::new(TokenRepository::new(store.clone()));
    let bridge = Arc::new(MockBridge::new());
    let volumes = vec![volume("v1", "hdd")];
    let cfg = VolumeAssignmentConfig { count: 1, preferred_types: vec!["hdd".into()] };

    let (file, _) = file_repo
        .rotate_for_table(
            &sink_key(),
            cfg,
            &volumes,
            LocalStorageConfig::default(),
            None,
            Some("events".into()),
            vec!["a".into(), "b".into()],
            ts("2000-01-01T02:00:00.000Z"),
        )
        .await
        .unwrap();

    token_repo
        .put(&Token {
            project_id: file.project_id.clone(),
            branch_id: file.branch_id.clone(),
            source_id: file.source_id.clone(),
            sink_id: file.sink_id.clone(),
            token: "staging-creds".into(),
            refreshed_at: "2000-01-01T02:00:00.000Z".into(),
        })
        .await
        .unwrap();

    let session = store.new_session(Duration::from_secs(15)).await.unwrap();
    let task_runner = TaskRunner::new(store.clone(), Arc::new(SystemClock), "node-a".into(), Arc::from(session));
    let watcher = LifecycleWatcher::new(
        Arc::new(SystemClock),
        ProjectId::from("123"),
        file_repo.clone(),
        slice_repo.clone(),
        token_repo,
        bridge.clone() as Arc<dyn silorunner::bridge::WarehouseBridge>,
        task_runner,
    );

    let cancel = CancellationToken::new();
    let watcher_cancel = cancel.clone();
    let handle = tokio::spawn(async move { watcher.run(watcher_cancel).await });

    // Give the watcher a moment to subscribe before the Closing
    // transitions land, since watches only see events from the point
    // they start.
    tokio::time::sleep(Duration::from_millis(20)).await;
    file_repo.close_all_in(&sink_key(), ts("2000-01-01T05:00:00.000Z")).await.unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let reloaded = file_repo.get(&file.key()).await.unwrap();
        if reloaded.state == FileState::Imported {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "file never reached Imported, stuck at {:?}", reloaded.state);
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    for slice in slice_repo.list_in_file(&file.key()).await.unwrap() {
        assert_eq!(slice.state, SliceState::Uploaded);
    }
    assert!(bridge.calls().iter().any(|c| matches!(c, silorunner::bridge::mock::Call::EnsureTable(_))));
    assert!(bridge.calls().iter().any(|c| matches!(c, silorunner::bridge::mock::Call::LoadTable { .. })));

    cancel.cancel();
    let _ = handle.await;
}
