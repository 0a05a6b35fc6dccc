//! Local safety-net copies taken before anything is destroyed.
//!
//! An export first plans one [`Action`] per enumerated handle and then runs
//! the planned downloads on a bounded pool. Planning is the same in both
//! operation modes (including the skip-if-exists check), so a dry run lists
//! exactly what an execute run would do. Downloads land in `<path>.part` and
//! are renamed when complete.

use chrono::{DateTime, SecondsFormat, Utc};
use futures::stream::{self, StreamExt};
use std::future::Future;
use std::path::{Component, Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::config::{PaginationConfig, RunConfig};
use crate::error::{Result, RetireError};
use crate::paginate::Paginator;
use crate::provider::{LogEvent, LogStore, ObjectStore, TimeWindow};
use crate::types::{
    Action, ObjectEntry, OperationMode, ResourceHandle, SkipReason, SnapshotOutcome,
    SnapshotRecord,
};

/// Everything one export planned and did, in enumeration order.
#[derive(Debug, Clone, Default)]
pub struct SnapshotReport {
    pub collection: String,
    pub actions: Vec<Action>,
    pub records: Vec<SnapshotRecord>,
    /// Enumeration ended on a stalled cursor
    pub stalled: bool,
}

impl SnapshotReport {
    fn new(collection: &str) -> Self {
        Self {
            collection: collection.to_string(),
            ..Default::default()
        }
    }

    pub fn downloaded(&self) -> usize {
        self.count(|o| *o == SnapshotOutcome::Ok)
    }

    pub fn failed(&self) -> usize {
        self.records.iter().filter(|r| r.is_failed()).count()
    }

    pub fn skipped(&self) -> usize {
        self.count(|o| matches!(o, SnapshotOutcome::Skipped(_)))
    }

    pub fn bytes(&self) -> u64 {
        self.records.iter().map(|r| r.bytes).sum()
    }

    /// No download failed and the listing was not cut short.
    pub fn is_complete(&self) -> bool {
        self.failed() == 0 && !self.stalled
    }

    fn count(&self, pred: impl Fn(&SnapshotOutcome) -> bool) -> usize {
        self.records.iter().filter(|r| pred(&r.outcome)).count()
    }
}

/// A planned step: either already settled while planning or a fetch to run.
enum Step {
    Settled(SnapshotRecord),
    Fetch { handle: ResourceHandle, path: PathBuf },
}

/// Exports bucket contents and log streams below one snapshot root.
#[derive(Debug, Clone)]
pub struct SnapshotExporter {
    root: PathBuf,
    mode: OperationMode,
    pagination: PaginationConfig,
    downloads: usize,
}

impl SnapshotExporter {
    pub fn new(config: &RunConfig) -> Self {
        Self {
            root: config.snapshot_root.clone(),
            mode: config.mode,
            pagination: config.pagination,
            downloads: config.pools.downloads.max(1),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Copy every object of `bucket` (every version when `versioned`) to
    /// `<root>/<bucket>/`.
    pub async fn export_bucket(
        &self,
        store: &dyn ObjectStore,
        bucket: &str,
        versioned: bool,
    ) -> Result<SnapshotReport> {
        info!(bucket = %bucket, versioned, mode = self.mode.as_str(), "Exporting bucket");
        let mut report = SnapshotReport::new(bucket);
        let listing = if versioned { "object versions" } else { "objects" };
        let mut pages = Paginator::new(format!("{listing} of {bucket}"), self.pagination, |cursor| {
            if versioned {
                store.list_versions(bucket, cursor)
            } else {
                store.list_objects(bucket, cursor)
            }
        });

        let fetch = |handle: ResourceHandle, part: PathBuf| async move {
            store.download(&handle, &part).await
        };

        while let Some(entries) = pages.next_page().await? {
            let mut steps = Vec::with_capacity(entries.len());
            for entry in entries {
                let step = self.plan_object(entry).await;
                if let Some(action) = action_for(&step) {
                    report.actions.push(action);
                }
                steps.push(step);
            }
            report.records.extend(self.run(steps, &fetch).await);
        }
        report.stalled = pages.stalled();

        info!(
            bucket = %bucket,
            downloaded = report.downloaded(),
            skipped = report.skipped(),
            failed = report.failed(),
            bytes = report.bytes(),
            "Bucket export finished"
        );
        Ok(report)
    }

    /// Write every stream of `group` within `window` to
    /// `<root>/logs_<group>/<stream>.log`. Streams whose file exists are
    /// skipped.
    pub async fn export_log_group(
        &self,
        store: &dyn LogStore,
        group: &str,
        window: TimeWindow,
    ) -> Result<SnapshotReport> {
        self.export_streams(store, group, window, false).await
    }

    /// Export the whole history of `group`, replacing any stream file left by
    /// an earlier, possibly shorter, download.
    pub async fn export_log_history(
        &self,
        store: &dyn LogStore,
        group: &str,
        now_ms: i64,
    ) -> Result<SnapshotReport> {
        self.export_streams(store, group, TimeWindow::lookback(now_ms, None), true)
            .await
    }

    async fn export_streams(
        &self,
        store: &dyn LogStore,
        group: &str,
        window: TimeWindow,
        replace: bool,
    ) -> Result<SnapshotReport> {
        info!(log_group = %group, replace, mode = self.mode.as_str(), "Exporting log group");
        let mut report = SnapshotReport::new(group);
        let mut streams = Paginator::new(format!("streams of {group}"), self.pagination, |cursor| {
            store.list_streams(group, cursor)
        });

        let dir = self.root.join(format!("logs_{}", sanitize_name(group)));
        let pagination = self.pagination;
        let fetch = |handle: ResourceHandle, part: PathBuf| async move {
            download_stream(store, &handle.collection, &handle.key, window, pagination, &part).await
        };

        while let Some(names) = streams.next_page().await? {
            let mut steps = Vec::with_capacity(names.len());
            for name in names {
                let handle = ResourceHandle::new(group, name);
                let path = dir.join(format!("{}.log", sanitize_name(&handle.key)));
                let step = if replace {
                    Step::Fetch { handle, path }
                } else {
                    self.plan_path(handle, path).await
                };
                if let Some(action) = action_for(&step) {
                    report.actions.push(action);
                }
                steps.push(step);
            }
            report.records.extend(self.run(steps, &fetch).await);
        }
        report.stalled = streams.stalled();

        info!(
            log_group = %group,
            streams = report.records.len(),
            failed = report.failed(),
            bytes = report.bytes(),
            "Log group export finished"
        );
        Ok(report)
    }

    async fn plan_object(&self, entry: ObjectEntry) -> Step {
        let handle = entry.handle;
        if entry.delete_marker {
            return skipped(handle, SkipReason::DeleteMarker);
        }
        if handle.is_folder_marker() {
            return skipped(handle, SkipReason::FolderMarker);
        }
        match snapshot_path(&self.root, &handle) {
            Ok(path) => self.plan_path(handle, path).await,
            Err(reason) => {
                warn!(handle = %handle, %reason, "Refusing to export handle");
                Step::Settled(SnapshotRecord {
                    handle,
                    local_path: PathBuf::new(),
                    outcome: SnapshotOutcome::Failed(reason),
                    bytes: 0,
                })
            }
        }
    }

    async fn plan_path(&self, handle: ResourceHandle, path: PathBuf) -> Step {
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            debug!(path = %path.display(), "Snapshot already exists");
            return Step::Settled(SnapshotRecord {
                handle,
                local_path: path,
                outcome: SnapshotOutcome::Skipped(SkipReason::AlreadyExists),
                bytes: 0,
            });
        }
        Step::Fetch { handle, path }
    }

    /// Run planned steps on the download pool, keeping their order.
    async fn run<F, Fut>(&self, steps: Vec<Step>, fetch: &F) -> Vec<SnapshotRecord>
    where
        F: Fn(ResourceHandle, PathBuf) -> Fut,
        Fut: Future<Output = Result<u64>>,
    {
        let mode = self.mode;
        stream::iter(steps)
            .map(|step| async move {
                let (handle, path) = match step {
                    Step::Settled(record) => return record,
                    Step::Fetch { handle, path } => (handle, path),
                };
                if mode.is_dry_run() {
                    println!("Would download {handle} to {}", path.display());
                    return SnapshotRecord {
                        handle,
                        local_path: path,
                        outcome: SnapshotOutcome::Planned,
                        bytes: 0,
                    };
                }
                match fetch_to(&path, fetch(handle.clone(), part_path(&path))).await {
                    Ok(bytes) => {
                        debug!(handle = %handle, bytes, "Snapshot written");
                        SnapshotRecord {
                            handle,
                            local_path: path,
                            outcome: SnapshotOutcome::Ok,
                            bytes,
                        }
                    }
                    Err(err) => {
                        warn!(handle = %handle, error = %err, "Download failed");
                        SnapshotRecord {
                            handle,
                            local_path: path,
                            outcome: SnapshotOutcome::Failed(err.to_string()),
                            bytes: 0,
                        }
                    }
                }
            })
            .buffered(self.downloads)
            .collect()
            .await
    }
}

fn skipped(handle: ResourceHandle, reason: SkipReason) -> Step {
    Step::Settled(SnapshotRecord {
        handle,
        local_path: PathBuf::new(),
        outcome: SnapshotOutcome::Skipped(reason),
        bytes: 0,
    })
}

fn action_for(step: &Step) -> Option<Action> {
    match step {
        Step::Fetch { handle, path } => Some(Action::Download {
            handle: handle.clone(),
            path: path.clone(),
        }),
        Step::Settled(SnapshotRecord {
            handle,
            outcome: SnapshotOutcome::Skipped(reason),
            ..
        }) => Some(Action::Skip {
            handle: handle.clone(),
            reason: *reason,
        }),
        Step::Settled(_) => None,
    }
}

/// Await `fetch` (which writes `<path>.part`) and move the result into place.
async fn fetch_to(path: &Path, fetch: impl Future<Output = Result<u64>>) -> Result<u64> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| RetireError::io(parent, e))?;
    }
    let part = part_path(path);
    match fetch.await {
        Ok(bytes) => {
            tokio::fs::rename(&part, path)
                .await
                .map_err(|e| RetireError::io(path, e))?;
            Ok(bytes)
        }
        Err(err) => {
            let _ = tokio::fs::remove_file(&part).await;
            Err(err)
        }
    }
}

fn part_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".part");
    PathBuf::from(name)
}

/// `<root>/<bucket>/<key>`, with `#<versionId>` appended for versions.
///
/// Keys that would escape the bucket directory are rejected, as are keys with
/// empty or `.` segments: those would share a path with another key.
pub fn snapshot_path(root: &Path, handle: &ResourceHandle) -> std::result::Result<PathBuf, String> {
    let relative = match &handle.version_id {
        Some(version) => format!("{}#{version}", handle.key),
        None => handle.key.clone(),
    };
    let escapes = |p: &Path| p.components().any(|c| !matches!(c, Component::Normal(_)));
    let ambiguous = handle
        .key
        .split('/')
        .any(|segment| matches!(segment, "" | "." | ".."));
    if ambiguous || escapes(Path::new(&relative)) {
        return Err(format!("key {:?} does not map to a path below the snapshot root", handle.key));
    }
    if escapes(Path::new(&handle.collection)) {
        return Err(format!("bucket {:?} is not a plain directory name", handle.collection));
    }
    Ok(root.join(&handle.collection).join(relative))
}

/// Replace runs of characters that are unsafe in file names by `_`.
pub fn sanitize_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut in_run = false;
    for c in name.chars() {
        if matches!(c, '\\' | '/' | ':' | '"' | '*' | '?' | '<' | '>' | '|') {
            if !in_run {
                out.push('_');
            }
            in_run = true;
        } else {
            out.push(c);
            in_run = false;
        }
    }
    match out.as_str() {
        "" | "." | ".." => "_".to_string(),
        _ => out,
    }
}

fn format_event(event: &LogEvent) -> String {
    let ts = DateTime::<Utc>::from_timestamp_millis(event.timestamp_ms)
        .map(|t| t.to_rfc3339_opts(SecondsFormat::Millis, true))
        .unwrap_or_else(|| event.timestamp_ms.to_string());
    format!("[{ts}] {}\n", event.message)
}

async fn download_stream(
    store: &dyn LogStore,
    group: &str,
    stream: &str,
    window: TimeWindow,
    pagination: PaginationConfig,
    dest: &Path,
) -> Result<u64> {
    let file = tokio::fs::File::create(dest)
        .await
        .map_err(|e| RetireError::io(dest, e))?;
    let mut out = tokio::io::BufWriter::new(file);
    let mut events = Paginator::new(format!("events of {group}/{stream}"), pagination, |cursor| {
        store.log_events(group, stream, window, cursor)
    });

    let mut written = 0_u64;
    while let Some(batch) = events.next_page().await? {
        for event in &batch {
            let line = format_event(event);
            out.write_all(line.as_bytes())
                .await
                .map_err(|e| RetireError::io(dest, e))?;
            written += line.len() as u64;
        }
    }
    out.flush().await.map_err(|e| RetireError::io(dest, e))?;
    Ok(written)
}
