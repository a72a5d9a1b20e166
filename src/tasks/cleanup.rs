//! Periodic `tasks.cleanup`: claims the cluster-wide lock like any
//! other task and deletes finished-or-orphaned task records older than
//! the configured retention window.

use crate::ids::ProjectId;
use crate::tasks::runner::TaskRunner;
use chrono::Duration as ChronoDuration;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub async fn run_cleanup_loop(
    runner: Arc<TaskRunner>,
    project_id: ProjectId,
    interval: Duration,
    retention: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("cleanup loop stopping");
                return;
            }
            _ = ticker.tick() => {
                let retention = ChronoDuration::from_std(retention).unwrap_or(ChronoDuration::zero());
                let runner = runner.clone();
                let project_id = project_id.clone();
                let runner_for_task = runner.clone();
                let outcome = runner
                    .start(project_id, "tasks.cleanup", "tasks.cleanup".to_string(), move |_token| async move {
                        runner_for_task
                            .cleanup_older_than(retention)
                            .await
                            .map(|n| format!("deleted {n} task records"))
                            .map_err(|e| e.to_string())
                    })
                    .await;
                if let Err(e) = outcome {
                    warn!("tasks.cleanup failed to start: {e}");
                }
            }
        }
    }
}
