//! Shared value types: handles, modes, snapshot records, batches and tasks.

use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Upper bound on the number of keys a single batched delete may carry.
pub const MAX_BATCH_SIZE: usize = 1000;

/// Whether a run may touch anything. Fixed once per run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum OperationMode {
    DryRun,
    Execute,
}

impl OperationMode {
    pub fn from_dry_run(dry_run: bool) -> Self {
        if dry_run {
            OperationMode::DryRun
        } else {
            OperationMode::Execute
        }
    }

    pub fn is_dry_run(self) -> bool {
        self == OperationMode::DryRun
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OperationMode::DryRun => "dry-run",
            OperationMode::Execute => "execute",
        }
    }
}

/// One addressable unit of a collection, optionally pinned to a version.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ResourceHandle {
    pub collection: String,
    pub key: String,
    pub version_id: Option<String>,
}

impl ResourceHandle {
    pub fn new(collection: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            key: key.into(),
            version_id: None,
        }
    }

    pub fn versioned(
        collection: impl Into<String>,
        key: impl Into<String>,
        version_id: impl Into<String>,
    ) -> Self {
        Self {
            collection: collection.into(),
            key: key.into(),
            version_id: Some(version_id.into()),
        }
    }

    /// Logical folder markers are keys ending in a path separator.
    pub fn is_folder_marker(&self) -> bool {
        self.key.ends_with('/')
    }
}

impl fmt::Display for ResourceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.version_id {
            Some(version) => write!(f, "{}:{} (version: {})", self.collection, self.key, version),
            None => write!(f, "{}:{}", self.collection, self.key),
        }
    }
}

/// Entry returned by a listing of bucket contents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectEntry {
    pub handle: ResourceHandle,
    pub size: u64,
    pub delete_marker: bool,
}

impl ObjectEntry {
    pub fn object(handle: ResourceHandle, size: u64) -> Self {
        Self {
            handle,
            size,
            delete_marker: false,
        }
    }

    pub fn delete_marker(handle: ResourceHandle) -> Self {
        Self {
            handle,
            size: 0,
            delete_marker: true,
        }
    }
}

/// Why the exporter did not fetch a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SkipReason {
    FolderMarker,
    DeleteMarker,
    AlreadyExists,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SkipReason::FolderMarker => "folder marker",
            SkipReason::DeleteMarker => "delete marker",
            SkipReason::AlreadyExists => "already exists",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum SnapshotOutcome {
    Ok,
    /// Recorded without a download attempt.
    Skipped(SkipReason),
    /// Dry run: the download would have happened.
    Planned,
    Failed(String),
}

/// Result of one attempted download during an export.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SnapshotRecord {
    pub handle: ResourceHandle,
    pub local_path: PathBuf,
    pub outcome: SnapshotOutcome,
    pub bytes: u64,
}

impl SnapshotRecord {
    pub fn is_failed(&self) -> bool {
        matches!(self.outcome, SnapshotOutcome::Failed(_))
    }
}

/// An ordered group of handles deleted by one provider call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchJob {
    pub index: usize,
    pub handles: Vec<ResourceHandle>,
}

/// Per-item error surfaced by a quiet batched delete.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ItemError {
    pub handle: ResourceHandle,
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TaskState {
    Pending,
    Running,
    Completed,
    Failed,
}

impl TaskState {
    /// Maps a provider status code; cancelled and expired tasks are failures.
    pub fn from_code(code: &str) -> Self {
        match code.to_ascii_uppercase().as_str() {
            "PENDING" => TaskState::Pending,
            "RUNNING" => TaskState::Running,
            "COMPLETED" => TaskState::Completed,
            _ => TaskState::Failed,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskState::Pending => "PENDING",
            TaskState::Running => "RUNNING",
            TaskState::Completed => "COMPLETED",
            TaskState::Failed => "FAILED",
        }
    }
}

/// A provider-owned long-running job, observed by polling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AsyncTask {
    pub id: String,
    pub name: String,
    pub state: TaskState,
    pub next_poll_wait: Option<Duration>,
    pub destination: Option<String>,
    pub destination_prefix: Option<String>,
    pub created_at_ms: Option<i64>,
    pub completed_at_ms: Option<i64>,
}

impl AsyncTask {
    pub fn new(id: impl Into<String>, name: impl Into<String>, state: TaskState) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            state,
            next_poll_wait: None,
            destination: None,
            destination_prefix: None,
            created_at_ms: None,
            completed_at_ms: None,
        }
    }
}

/// Intended side effect, identical in DRY_RUN and EXECUTE.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Download { handle: ResourceHandle, path: PathBuf },
    Skip { handle: ResourceHandle, reason: SkipReason },
    DeleteBatch { index: usize, total: usize, handles: Vec<ResourceHandle> },
    DeleteCollection { collection: String },
    SetRetention { log_group: String, days: i32 },
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Download { handle, path } => {
                write!(f, "download {handle} to {}", path.display())
            }
            Action::Skip { handle, reason } => write!(f, "skip {reason}: {handle}"),
            Action::DeleteBatch { index, total, handles } => {
                write!(f, "delete batch {} of {total} ({} keys)", index + 1, handles.len())
            }
            Action::DeleteCollection { collection } => write!(f, "delete collection {collection}"),
            Action::SetRetention { log_group, days } => {
                write!(f, "set retention of {log_group} to {days} days")
            }
        }
    }
}

/// Metadata of a CloudWatch log group as listed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogGroupInfo {
    pub name: String,
    pub stored_bytes: u64,
    pub retention_days: Option<i32>,
    /// Filled in by listings that ask for tags
    pub tags: Vec<(String, String)>,
}

/// Human readable byte count, e.g. `1.50 KB`.
pub fn human_readable_size(bytes: u64) -> String {
    let mut num = bytes as f64;
    for unit in ["B", "KB", "MB", "GB", "TB"] {
        if num < 1024.0 {
            return format!("{num:.2} {unit}");
        }
        num /= 1024.0;
    }
    format!("{num:.2} PB")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn folder_marker_detection() {
        assert!(ResourceHandle::new("b", "dir/").is_folder_marker());
        assert!(!ResourceHandle::new("b", "dir/file").is_folder_marker());
    }

    #[test]
    fn task_state_codes() {
        assert_eq!(TaskState::from_code("running"), TaskState::Running);
        assert_eq!(TaskState::from_code("PENDING"), TaskState::Pending);
        assert_eq!(TaskState::from_code("CANCELLED"), TaskState::Failed);
        assert!(TaskState::Completed.is_terminal());
        assert!(!TaskState::Running.is_terminal());
    }

    #[test]
    fn sizes() {
        assert_eq!(human_readable_size(0), "0.00 B");
        assert_eq!(human_readable_size(1536), "1.50 KB");
        assert_eq!(human_readable_size(3 * 1024 * 1024 * 1024), "3.00 GB");
    }

    #[test]
    fn handle_display() {
        let h = ResourceHandle::versioned("bucket", "a/b", "v1");
        assert_eq!(h.to_string(), "bucket:a/b (version: v1)");
    }
}
