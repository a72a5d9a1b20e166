use crate::ids::ProjectId;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub project_id: ProjectId,
    pub task_type: String,
    pub lock: String,
    pub node: String,
    pub created_at: String,
    pub finished_at: Option<String>,
    pub duration_ms: Option<u64>,
    pub result: Option<String>,
    pub error: Option<String>,
}

impl TaskRecord {
    pub fn is_finished(&self) -> bool {
        self.finished_at.is_some()
    }
}
