//! Key-space builders. Every mutation touches three things for the
//! same entity: the canonical `all/` record, an exact-state secondary
//! key (swapped atomically on every transition, mirroring the
//! `InState(...).ByKey(...)` index pattern), and a coarser `level/`
//! key grouping multiple states into the stage a watcher actually
//! cares about.

use crate::ids::{FileKey, SinkKey, SliceKey};
use crate::repo::model::{FileState, Level, SliceState};

pub const FILE_ALL: &str = "storage/file/all/";
pub const FILE_STATE: &str = "storage/file/state/";
pub const FILE_LEVEL: &str = "storage/file/level/";
pub const SLICE_ALL: &str = "storage/slice/all/";
pub const SLICE_STATE: &str = "storage/slice/state/";
pub const SLICE_LEVEL: &str = "storage/slice/level/";
pub const TOKEN: &str = "storage/secret/token/";
pub const VOLUME_WRITER: &str = "storage/volume/writer/";
pub const VOLUME_READER: &str = "storage/volume/reader/";
pub const TASK: &str = "storage/task/";
pub const LOCK_TASK: &str = "runtime/lock/task/";
pub const DEFINITION_BRANCH: &str = "definition/branch/";
pub const DEFINITION_SOURCE: &str = "definition/source/";
pub const DEFINITION_SINK: &str = "definition/sink/";

fn file_state_name(s: FileState) -> &'static str {
    match s {
        FileState::Writing => "writing",
        FileState::Closing => "closing",
        FileState::Importing => "importing",
        FileState::Imported => "imported",
        FileState::Failed => "failed",
    }
}

fn slice_state_name(s: SliceState) -> &'static str {
    match s {
        SliceState::Writing => "writing",
        SliceState::Closing => "closing",
        SliceState::Uploading => "uploading",
        SliceState::Uploaded => "uploaded",
        SliceState::Failed => "failed",
    }
}

fn level_name(l: Level) -> &'static str {
    match l {
        Level::Local => "local",
        Level::Staging => "staging",
        Level::Target => "target",
    }
}

pub fn file_all_key(k: &FileKey) -> String {
    format!("{FILE_ALL}{}", k.path())
}

pub fn file_state_key(state: FileState, k: &FileKey) -> String {
    format!("{FILE_STATE}{}/{}", file_state_name(state), k.path())
}

pub fn file_state_prefix(state: FileState) -> String {
    format!("{FILE_STATE}{}/", file_state_name(state))
}

pub fn file_state_sink_prefix(state: FileState, sink: &SinkKey) -> String {
    format!("{FILE_STATE}{}/{}/", file_state_name(state), sink.path())
}

pub fn file_level_key(level: Level, k: &FileKey) -> String {
    format!("{FILE_LEVEL}{}/{}", level_name(level), k.path())
}

pub fn file_level_prefix(level: Level) -> String {
    format!("{FILE_LEVEL}{}/", level_name(level))
}

pub fn file_all_sink_prefix(sink: &SinkKey) -> String {
    format!("{FILE_ALL}{}/", sink.path())
}

pub fn slice_all_key(k: &SliceKey) -> String {
    format!("{SLICE_ALL}{}", k.path())
}

pub fn slice_state_key(state: SliceState, k: &SliceKey) -> String {
    format!("{SLICE_STATE}{}/{}", slice_state_name(state), k.path())
}

pub fn slice_state_prefix(state: SliceState) -> String {
    format!("{SLICE_STATE}{}/", slice_state_name(state))
}

pub fn slice_state_file_prefix(state: SliceState, file: &FileKey) -> String {
    format!("{SLICE_STATE}{}/{}/", slice_state_name(state), file.path())
}

pub fn slice_level_key(level: Level, k: &SliceKey) -> String {
    format!("{SLICE_LEVEL}{}/{}", level_name(level), k.path())
}

pub fn slice_level_prefix(level: Level) -> String {
    format!("{SLICE_LEVEL}{}/", level_name(level))
}

pub fn slice_all_file_prefix(file: &FileKey) -> String {
    format!("{SLICE_ALL}{}/", file.path())
}

pub fn token_key(sink: &SinkKey) -> String {
    format!("{TOKEN}{}", sink.path())
}

pub fn volume_writer_key(volume_id: &str) -> String {
    format!("{VOLUME_WRITER}{volume_id}")
}

pub fn volume_reader_key(volume_id: &str) -> String {
    format!("{VOLUME_READER}{volume_id}")
}

pub fn task_key(path: &str) -> String {
    format!("{TASK}{path}")
}

pub fn lock_task_key(lock_name: &str) -> String {
    format!("{LOCK_TASK}{lock_name}")
}
