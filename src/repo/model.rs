//! Entity shapes stored by the definition & state repository. Every
//! type here round-trips through canonical JSON — these are the bytes
//! that live behind `PrefixT<T>`.

use crate::ids::{BranchId, FileKey, ProjectId, SinkId, SliceKey, SourceId, TableId, VolumeId};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FileState {
    Writing,
    Closing,
    Importing,
    Imported,
    Failed,
}

impl FileState {
    /// The ordered path a healthy file walks; `Failed` is a sideband
    /// entered from any of these and retried back into the one it left.
    pub const ORDER: [FileState; 4] =
        [FileState::Writing, FileState::Closing, FileState::Importing, FileState::Imported];

    pub fn is_terminal(self) -> bool {
        matches!(self, FileState::Imported)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SliceState {
    Writing,
    Closing,
    Uploading,
    Uploaded,
    Failed,
}

impl SliceState {
    pub const ORDER: [SliceState; 4] =
        [SliceState::Writing, SliceState::Closing, SliceState::Uploading, SliceState::Uploaded];

    pub fn is_terminal(self) -> bool {
        matches!(self, SliceState::Uploaded)
    }
}

/// The secondary index an entity currently belongs to: the furthest
/// stage it, or the furthest of its children, has reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Level {
    Local,
    Staging,
    Target,
}

impl From<FileState> for Level {
    fn from(state: FileState) -> Self {
        match state {
            FileState::Writing | FileState::Closing | FileState::Failed => Level::Local,
            FileState::Importing => Level::Staging,
            FileState::Imported => Level::Target,
        }
    }
}

impl From<SliceState> for Level {
    fn from(state: SliceState) -> Self {
        match state {
            SliceState::Writing | SliceState::Closing | SliceState::Failed => Level::Local,
            SliceState::Uploading => Level::Staging,
            SliceState::Uploaded => Level::Target,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Stats {
    pub records_count: u64,
    pub uncompressed_bytes: u64,
    pub compressed_bytes: u64,
}

/// Backoff/retry bookkeeping shared by File and Slice.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RetryInfo {
    pub retry_attempt: u32,
    pub retry_reason: Option<String>,
    pub last_failed_at: Option<String>,
    pub retry_after: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumeAssignmentConfig {
    pub count: usize,
    pub preferred_types: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LocalStorageConfig {
    pub dir: String,
    pub compression: String,
    pub sync_every_bytes: Option<u64>,
    pub allocate_bytes: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StagingConfig {
    pub credentials: String,
    pub expires_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct File {
    pub project_id: ProjectId,
    pub branch_id: BranchId,
    pub source_id: SourceId,
    pub sink_id: SinkId,
    pub opened_at: String,
    pub state: FileState,
    pub file_type: String,
    pub columns: Vec<String>,
    pub volume_assignment: VolumeAssignmentConfig,
    pub assigned_volume_ids: Vec<VolumeId>,
    pub local_storage: LocalStorageConfig,
    pub staging: Option<StagingConfig>,
    pub target_table: Option<TableId>,
    pub closing_at: Option<String>,
    pub importing_at: Option<String>,
    pub imported_at: Option<String>,
    pub retry: RetryInfo,
}

impl File {
    pub fn key(&self) -> FileKey {
        FileKey {
            sink: crate::ids::SinkKey {
                source: crate::ids::SourceKey {
                    branch: crate::ids::BranchKey {
                        project_id: self.project_id.clone(),
                        branch_id: self.branch_id.clone(),
                    },
                    source_id: self.source_id.clone(),
                },
                sink_id: self.sink_id.clone(),
            },
            opened_at: self.opened_at.clone(),
        }
    }

    pub fn level(&self) -> Level {
        self.state.into()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Slice {
    pub project_id: ProjectId,
    pub branch_id: BranchId,
    pub source_id: SourceId,
    pub sink_id: SinkId,
    pub file_opened_at: String,
    pub volume_id: VolumeId,
    pub slice_opened_at: String,
    pub state: SliceState,
    pub is_empty: bool,
    pub stats: Stats,
    pub closing_at: Option<String>,
    pub uploading_at: Option<String>,
    pub uploaded_at: Option<String>,
    pub retry: RetryInfo,
}

impl Slice {
    pub fn key(&self) -> SliceKey {
        SliceKey {
            file: FileKey {
                sink: crate::ids::SinkKey {
                    source: crate::ids::SourceKey {
                        branch: crate::ids::BranchKey {
                            project_id: self.project_id.clone(),
                            branch_id: self.branch_id.clone(),
                        },
                        source_id: self.source_id.clone(),
                    },
                    sink_id: self.sink_id.clone(),
                },
                opened_at: self.file_opened_at.clone(),
            },
            volume_id: self.volume_id.clone(),
            slice_opened_at: self.slice_opened_at.clone(),
        }
    }

    pub fn level(&self) -> Level {
        self.state.into()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Token {
    pub project_id: ProjectId,
    pub branch_id: BranchId,
    pub source_id: SourceId,
    pub sink_id: SinkId,
    pub token: String,
    pub refreshed_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Volume {
    pub volume_id: VolumeId,
    pub node_id: String,
    pub volume_type: String,
    pub label: String,
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Branch {
    pub project_id: ProjectId,
    pub branch_id: BranchId,
    pub is_default: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Source {
    pub project_id: ProjectId,
    pub branch_id: BranchId,
    pub source_id: SourceId,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sink {
    pub project_id: ProjectId,
    pub branch_id: BranchId,
    pub source_id: SourceId,
    pub sink_id: SinkId,
    pub name: String,
    pub volume_assignment: VolumeAssignmentConfig,
    pub target_table: TableId,
    pub columns: Vec<String>,
    pub max_file_age_seconds: u64,
    pub max_file_bytes: u64,
}
