//! Identifier hierarchy: every key is string-sortable and extends the
//! level above it. These are thin newtypes, not opaque UUIDs — the
//! coordination store keys on their string form directly.

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! string_id {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub String);

        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }
    };
}

string_id!(ProjectId);
string_id!(BranchId);
string_id!(SourceId);
string_id!(SinkId);
string_id!(VolumeId);
string_id!(TableId);

/// `project/branch`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BranchKey {
    pub project_id: ProjectId,
    pub branch_id: BranchId,
}

impl BranchKey {
    pub fn path(&self) -> String {
        format!("{}/{}", self.project_id, self.branch_id)
    }
}

/// `project/branch/source`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourceKey {
    pub branch: BranchKey,
    pub source_id: SourceId,
}

impl SourceKey {
    pub fn path(&self) -> String {
        format!("{}/{}", self.branch.path(), self.source_id)
    }
}

/// `project/branch/source/sink`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SinkKey {
    pub source: SourceKey,
    pub sink_id: SinkId,
}

impl SinkKey {
    pub fn path(&self) -> String {
        format!("{}/{}", self.source.path(), self.sink_id)
    }
}

/// `project/branch/source/sink/openedAt` — time-ordered.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileKey {
    pub sink: SinkKey,
    pub opened_at: String,
}

impl FileKey {
    pub fn path(&self) -> String {
        format!("{}/{}", self.sink.path(), self.opened_at)
    }
}

/// `project/branch/source/sink/fileOpenedAt/volumeID/sliceOpenedAt` — time-ordered.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SliceKey {
    pub file: FileKey,
    pub volume_id: VolumeId,
    pub slice_opened_at: String,
}

impl SliceKey {
    pub fn path(&self) -> String {
        format!("{}/{}/{}", self.file.path(), self.volume_id, self.slice_opened_at)
    }
}

/// Globally unique task key: `<project>/<type>/<createdAt>_<rand5>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskKey {
    pub project_id: ProjectId,
    pub task_type: String,
    pub created_at: String,
    pub rand_suffix: String,
}

impl TaskKey {
    pub fn path(&self) -> String {
        format!(
            "{}/{}/{}_{}",
            self.project_id, self.task_type, self.created_at, self.rand_suffix
        )
    }
}

/// 5-character unambiguous alphabet (no look-alike characters).
const TASK_ID_ALPHABET: &[u8] = b"23456789ABCDEFGHJKMNPQRSTUVWXYZ";

pub fn random_task_suffix() -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    (0..5)
        .map(|_| TASK_ID_ALPHABET[rng.gen_range(0..TASK_ID_ALPHABET.len())] as char)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sink_key() -> SinkKey {
        SinkKey {
            source: SourceKey {
                branch: BranchKey {
                    project_id: ProjectId::from("123"),
                    branch_id: BranchId::from("456"),
                },
                source_id: SourceId::from("s"),
            },
            sink_id: SinkId::from("k1"),
        }
    }

    #[test]
    fn key_paths_nest_by_level() {
        let sink = sink_key();
        assert_eq!(sink.path(), "123/456/s/k1");

        let file = FileKey {
            sink: sink.clone(),
            opened_at: "2000-01-01T02:00:00.000Z".into(),
        };
        assert_eq!(file.path(), "123/456/s/k1/2000-01-01T02:00:00.000Z");

        let slice = SliceKey {
            file: file.clone(),
            volume_id: VolumeId::from("v1"),
            slice_opened_at: "2000-01-01T02:00:00.000Z".into(),
        };
        assert_eq!(
            slice.path(),
            "123/456/s/k1/2000-01-01T02:00:00.000Z/v1/2000-01-01T02:00:00.000Z"
        );
    }

    #[test]
    fn task_suffix_uses_unambiguous_alphabet() {
        let s = random_task_suffix();
        assert_eq!(s.len(), 5);
        assert!(s.chars().all(|c| TASK_ID_ALPHABET.contains(&(c as u8))));
    }
}
