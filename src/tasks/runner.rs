//! Cluster-wide at-most-one task executor. An in-process lock (guarded
//! by a concurrent map) prevents double-starting a task on the same
//! node; a lease-bound `PutIfNotExists` prevents double-starting it
//! across the cluster. A crashed node's lease expires, its lock key
//! vanishes with it, and `tasks.cleanup` later reconciles the orphaned
//! task record.

use crate::clock::{format_ts, Clock};
use crate::error::Result;
use crate::ids::{random_task_suffix, ProjectId, TaskKey};
use crate::kv::{Compare, KvStore, RangeOptions, Session, TxnOp, TxnRequest};
use crate::repo::schema;
use crate::tasks::model::TaskRecord;
use dashmap::DashMap;
use futures::future::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Started(TaskKey),
    Ignored,
}

pub struct TaskRunner {
    store: Arc<dyn KvStore>,
    clock: Arc<dyn Clock>,
    node_id: String,
    session: Arc<dyn Session>,
    locks: Arc<DashMap<String, ()>>,
    cancellation: CancellationToken,
}

impl TaskRunner {
    pub fn new(store: Arc<dyn KvStore>, clock: Arc<dyn Clock>, node_id: String, session: Arc<dyn Session>) -> Arc<Self> {
        Arc::new(Self {
            store,
            clock,
            node_id,
            session,
            locks: Arc::new(DashMap::new()),
            cancellation: CancellationToken::new(),
        })
    }

    pub fn cancellation(&self) -> CancellationToken {
        self.cancellation.clone()
    }

    /// Tasks currently running on this node.
    pub fn tasks_count(&self) -> usize {
        self.locks.len()
    }

    pub fn is_running(&self, lock_name: &str) -> bool {
        self.locks.contains_key(lock_name)
    }

    /// Starts `f` under `lock_name` unless it's already held locally or
    /// cluster-wide, in which case it returns `Ignored` without running
    /// anything.
    pub async fn start<F, Fut>(
        self: &Arc<Self>,
        project_id: ProjectId,
        task_type: &str,
        lock_name: String,
        f: F,
    ) -> Result<TaskOutcome>
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = std::result::Result<String, String>> + Send + 'static,
    {
        if self.locks.insert(lock_name.clone(), ()).is_some() {
            return Ok(TaskOutcome::Ignored);
        }

        let now = self.clock.now();
        let task_key = TaskKey {
            project_id: project_id.clone(),
            task_type: task_type.to_string(),
            created_at: format_ts(now),
            rand_suffix: random_task_suffix(),
        };
        let record = TaskRecord {
            project_id,
            task_type: task_type.to_string(),
            lock: lock_name.clone(),
            node: self.node_id.clone(),
            created_at: format_ts(now),
            finished_at: None,
            duration_ms: None,
            result: None,
            error: None,
        };

        let lock_key = schema::lock_task_key(&lock_name);
        let task_all_key = schema::task_key(&task_key.path());
        let resp = self
            .store
            .txn(TxnRequest {
                ifs: vec![Compare::KeyMissing(lock_key.clone())],
                then: vec![
                    TxnOp::Put { key: lock_key.clone(), value: self.node_id.clone().into_bytes(), lease: Some(self.session.lease()) },
                    TxnOp::Put { key: task_all_key.clone(), value: serde_json::to_vec(&record)?, lease: None },
                ],
                or_else: vec![],
            })
            .await?;

        if !resp.succeeded {
            self.locks.remove(&lock_name);
            return Ok(TaskOutcome::Ignored);
        }

        info!(lock = %lock_name, task = %task_key.path(), "task started");
        let this = self.clone();
        let child_token = self.cancellation.child_token();
        let started_at = now;
        tokio::spawn(async move {
            let outcome = AssertUnwindSafe(f(child_token)).catch_unwind().await;
            let finished_at = this.clock.now();
            let duration_ms = (finished_at - started_at).num_milliseconds().max(0) as u64;

            let mut record = record;
            record.finished_at = Some(format_ts(finished_at));
            record.duration_ms = Some(duration_ms);
            match outcome {
                Ok(Ok(result)) => record.result = Some(result),
                Ok(Err(error)) => record.error = Some(error),
                Err(panic) => {
                    let message = panic
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "unknown panic".to_string());
                    warn!(lock = %lock_name, "task panicked: {message}");
                    record.error = Some(format!("panic: {message}"));
                }
            }

            let finish_txn = this.store.txn(TxnRequest {
                ifs: vec![],
                then: vec![
                    TxnOp::Delete { key: lock_key },
                    TxnOp::Put { key: task_all_key, value: serde_json::to_vec(&record).unwrap_or_default(), lease: None },
                ],
                or_else: vec![],
            });
            if let Err(e) = finish_txn.await {
                warn!(lock = %lock_name, "failed to commit task finish, lease expiry will reclaim the lock: {e}");
            }
            this.locks.remove(&lock_name);
        });

        Ok(TaskOutcome::Started(task_key))
    }

    /// Scans `storage/task/` deleting records finished more than
    /// `retention` ago, or never finished and older than `retention`.
    pub async fn cleanup_older_than(&self, retention: chrono::Duration) -> Result<usize> {
        let now = self.clock.now();
        let page = self
            .store
            .range_get(schema::TASK, RangeOptions { limit: 10_000, ..Default::default() })
            .await?;

        let mut deleted = 0;
        for kv in page.items {
            let record: TaskRecord = match serde_json::from_slice(&kv.value) {
                Ok(r) => r,
                Err(_) => continue,
            };
            let reference = record.finished_at.as_deref().unwrap_or(&record.created_at);
            let Ok(at) = crate::clock::parse_ts(reference) else { continue };
            if now - at > retention {
                self.store.delete(&kv.key).await?;
                deleted += 1;
            }
        }
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::kv::mock::MockStore;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    async fn runner() -> Arc<TaskRunner> {
        let store = MockStore::new();
        let session = store.new_session(Duration::from_secs(15)).await.unwrap();
        TaskRunner::new(store, Arc::new(SystemClock), "node-a".into(), Arc::from(session))
    }

    #[tokio::test]
    async fn second_start_with_same_lock_is_ignored() {
        let runner = runner().await;
        let calls = Arc::new(AtomicUsize::new(0));
        let c1 = calls.clone();
        let outcome1 = runner
            .start(ProjectId::from("p"), "tasks.cleanup", "lock-a".into(), move |_| async move {
                c1.fetch_add(1, Ordering::SeqCst);
                Ok("ok".to_string())
            })
            .await
            .unwrap();
        assert!(matches!(outcome1, TaskOutcome::Started(_)));

        let outcome2 = runner
            .start(ProjectId::from("p"), "tasks.cleanup", "lock-a".into(), |_| async { Ok("ok".to_string()) })
            .await
            .unwrap();
        assert_eq!(outcome2, TaskOutcome::Ignored);
    }

    #[tokio::test]
    async fn panicking_task_is_recorded_and_lock_released() {
        let runner = runner().await;
        runner
            .start(ProjectId::from("p"), "file.close", "lock-b".into(), |_| async { panic!("boom") })
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!runner.is_running("lock-b"));
    }
}
