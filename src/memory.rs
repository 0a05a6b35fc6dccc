//! In-memory providers.
//!
//! They keep the same contracts as the AWS-backed stores (paged listings,
//! quiet batch deletes, provider-owned export tasks) and record every call,
//! which makes whole runs observable without an account.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::Mutex;

use crate::error::{ProviderError, RetireError};
use crate::provider::{
    ExportRequest, ExportTaskSource, LogEvent, LogStore, ObjectStore, Page, TimeWindow,
};
use crate::types::{AsyncTask, ItemError, LogGroupInfo, ObjectEntry, ResourceHandle};

/// Call log entry shared by the memory providers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    ListObjects(String),
    ListVersions(String),
    Download(ResourceHandle),
    DeleteBatch { bucket: String, size: usize },
    DeleteBucket(String),
    ListStreams(String),
    LogEvents { group: String, stream: String },
    PutRetention { group: String, days: i32 },
    DeleteLogGroup(String),
    ListExportTasks,
    SubmitExport(String),
}

#[derive(Debug, Default)]
struct Bucket {
    region: String,
    versioned: bool,
    tags: Vec<(String, String)>,
    entries: Vec<ObjectEntry>,
    contents: BTreeMap<ResourceHandle, Bytes>,
}

#[derive(Debug, Default)]
struct ObjectState {
    buckets: BTreeMap<String, Bucket>,
    failing_downloads: HashSet<String>,
    failing_deletes: HashSet<String>,
    failing_batch: Option<usize>,
    batches_seen: usize,
    /// Region this endpoint answers for; `None` answers for every region
    serving: Option<String>,
    calls: Vec<Call>,
}

/// Buckets held in memory, listed `page_size` entries at a time.
#[derive(Debug)]
pub struct MemoryObjectStore {
    page_size: usize,
    state: Mutex<ObjectState>,
}

impl Default for MemoryObjectStore {
    fn default() -> Self {
        Self::new(1000)
    }
}

impl MemoryObjectStore {
    pub fn new(page_size: usize) -> Self {
        Self {
            page_size: page_size.max(1),
            state: Mutex::new(ObjectState::default()),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, ObjectState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn create_bucket(&self, bucket: &str, region: &str, versioned: bool) {
        self.state().buckets.insert(
            bucket.to_string(),
            Bucket {
                region: region.to_string(),
                versioned,
                ..Default::default()
            },
        );
    }

    pub fn tag_bucket(&self, bucket: &str, key: &str, value: &str) {
        if let Some(b) = self.state().buckets.get_mut(bucket) {
            b.tags.push((key.to_string(), value.to_string()));
        }
    }

    /// Add an object (or a new version of it when `version` is given).
    pub fn put(&self, bucket: &str, key: &str, version: Option<&str>, body: &[u8]) {
        let handle = ResourceHandle {
            collection: bucket.to_string(),
            key: key.to_string(),
            version_id: version.map(str::to_string),
        };
        let mut state = self.state();
        if let Some(b) = state.buckets.get_mut(bucket) {
            b.entries
                .push(ObjectEntry::object(handle.clone(), body.len() as u64));
            b.contents.insert(handle, Bytes::copy_from_slice(body));
        }
    }

    pub fn put_delete_marker(&self, bucket: &str, key: &str, version: &str) {
        if let Some(b) = self.state().buckets.get_mut(bucket) {
            b.entries.push(ObjectEntry::delete_marker(ResourceHandle::versioned(
                bucket, key, version,
            )));
        }
    }

    /// Downloads of `key` fail with AccessDenied.
    pub fn fail_download(&self, key: &str) {
        self.state().failing_downloads.insert(key.to_string());
    }

    /// Batched deletes report `key` as a per-item error.
    pub fn fail_delete(&self, key: &str) {
        self.state().failing_deletes.insert(key.to_string());
    }

    /// The batch call with this zero-based index fails as a whole.
    pub fn fail_batch(&self, index: usize) {
        self.state().failing_batch = Some(index);
    }

    /// Behave like a regional endpoint: head and tagging requests for buckets
    /// in other regions are answered with a redirect error.
    pub fn serve_region(&self, region: &str) {
        self.state().serving = Some(region.to_string());
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state().calls.clone()
    }

    pub fn contains_bucket(&self, bucket: &str) -> bool {
        self.state().buckets.contains_key(bucket)
    }

    pub fn entry_count(&self, bucket: &str) -> usize {
        self.state()
            .buckets
            .get(bucket)
            .map(|b| b.entries.len())
            .unwrap_or_default()
    }

    fn page_of(&self, entries: Vec<ObjectEntry>, cursor: Option<String>) -> Page<ObjectEntry> {
        let start: usize = cursor.and_then(|c| c.parse().ok()).unwrap_or_default();
        let end = (start + self.page_size).min(entries.len());
        let items = entries.get(start..end).map(<[_]>::to_vec).unwrap_or_default();
        let next = (end < entries.len()).then(|| end.to_string());
        Page::new(items, next)
    }

    fn check_region(&self, operation: &str, bucket: &str) -> Result<(), ProviderError> {
        let state = self.state();
        match (&state.serving, state.buckets.get(bucket)) {
            (Some(serving), Some(b)) if *serving != b.region => Err(ProviderError::permanent(
                operation,
                "PermanentRedirect",
                format!("{bucket} lives in {}", b.region),
            )),
            _ => Ok(()),
        }
    }

    fn no_such_bucket(operation: &str, bucket: &str) -> ProviderError {
        ProviderError::permanent(operation, "NoSuchBucket", format!("{bucket} does not exist"))
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn bucket_exists(&self, bucket: &str) -> Result<bool, ProviderError> {
        self.check_region("head_bucket", bucket)?;
        Ok(self.state().buckets.contains_key(bucket))
    }

    async fn bucket_tags(&self, bucket: &str) -> Result<Vec<(String, String)>, ProviderError> {
        self.check_region("get_bucket_tagging", bucket)?;
        self.state()
            .buckets
            .get(bucket)
            .map(|b| b.tags.clone())
            .ok_or_else(|| Self::no_such_bucket("get_bucket_tagging", bucket))
    }

    async fn bucket_region(&self, bucket: &str) -> Result<String, ProviderError> {
        self.state()
            .buckets
            .get(bucket)
            .map(|b| b.region.clone())
            .ok_or_else(|| Self::no_such_bucket("get_bucket_location", bucket))
    }

    async fn is_versioned(&self, bucket: &str) -> Result<bool, ProviderError> {
        self.state()
            .buckets
            .get(bucket)
            .map(|b| b.versioned)
            .ok_or_else(|| Self::no_such_bucket("get_bucket_versioning", bucket))
    }

    async fn list_objects(
        &self,
        bucket: &str,
        cursor: Option<String>,
    ) -> Result<Page<ObjectEntry>, ProviderError> {
        let entries = {
            let mut state = self.state();
            state.calls.push(Call::ListObjects(bucket.to_string()));
            let b = state
                .buckets
                .get(bucket)
                .ok_or_else(|| Self::no_such_bucket("list_objects_v2", bucket))?;
            b.entries
                .iter()
                .filter(|e| !e.delete_marker)
                .map(|e| ObjectEntry {
                    handle: ResourceHandle::new(bucket, e.handle.key.clone()),
                    ..e.clone()
                })
                .collect::<Vec<_>>()
        };
        Ok(self.page_of(entries, cursor))
    }

    async fn list_versions(
        &self,
        bucket: &str,
        cursor: Option<String>,
    ) -> Result<Page<ObjectEntry>, ProviderError> {
        let entries = {
            let mut state = self.state();
            state.calls.push(Call::ListVersions(bucket.to_string()));
            state
                .buckets
                .get(bucket)
                .ok_or_else(|| Self::no_such_bucket("list_object_versions", bucket))?
                .entries
                .clone()
        };
        Ok(self.page_of(entries, cursor))
    }

    async fn download(&self, handle: &ResourceHandle, dest: &Path) -> Result<u64, RetireError> {
        let body = {
            let mut state = self.state();
            state.calls.push(Call::Download(handle.clone()));
            if state.failing_downloads.contains(&handle.key) {
                return Err(ProviderError::permanent("get_object", "AccessDenied", "denied").into());
            }
            let bucket = state
                .buckets
                .get(&handle.collection)
                .ok_or_else(|| Self::no_such_bucket("get_object", &handle.collection))?;
            let lookup = if bucket.versioned {
                handle.clone()
            } else {
                ResourceHandle::new(&handle.collection, &handle.key)
            };
            bucket
                .contents
                .get(&lookup)
                .or_else(|| bucket.contents.iter().find(|(h, _)| h.key == handle.key).map(|(_, b)| b))
                .cloned()
                .ok_or_else(|| ProviderError::permanent("get_object", "NoSuchKey", handle.key.clone()))?
        };
        tokio::fs::write(dest, &body)
            .await
            .map_err(|e| RetireError::io(dest, e))?;
        Ok(body.len() as u64)
    }

    async fn delete_batch(
        &self,
        bucket: &str,
        handles: &[ResourceHandle],
    ) -> Result<Vec<ItemError>, ProviderError> {
        let mut state = self.state();
        state.calls.push(Call::DeleteBatch {
            bucket: bucket.to_string(),
            size: handles.len(),
        });
        let index = state.batches_seen;
        state.batches_seen += 1;
        if state.failing_batch == Some(index) {
            return Err(ProviderError::transient("delete_objects", "connection reset"));
        }

        let failing = state.failing_deletes.clone();
        let b = state
            .buckets
            .get_mut(bucket)
            .ok_or_else(|| Self::no_such_bucket("delete_objects", bucket))?;
        let mut errors = Vec::new();
        for handle in handles {
            if failing.contains(&handle.key) {
                errors.push(ItemError {
                    handle: handle.clone(),
                    code: "AccessDenied".to_string(),
                    message: "Access Denied".to_string(),
                });
                continue;
            }
            b.entries.retain(|e| {
                !(e.handle.key == handle.key
                    && (handle.version_id.is_none() || e.handle.version_id == handle.version_id))
            });
        }
        Ok(errors)
    }

    async fn delete_bucket(&self, bucket: &str) -> Result<(), ProviderError> {
        let mut state = self.state();
        state.calls.push(Call::DeleteBucket(bucket.to_string()));
        match state.buckets.get(bucket) {
            None => Err(Self::no_such_bucket("delete_bucket", bucket)),
            Some(b) if !b.entries.is_empty() => Err(ProviderError::permanent(
                "delete_bucket",
                "BucketNotEmpty",
                "The bucket you tried to delete is not empty",
            )),
            Some(_) => {
                state.buckets.remove(bucket);
                Ok(())
            }
        }
    }
}

#[derive(Debug, Default)]
struct Group {
    retention_days: Option<i32>,
    tags: Vec<(String, String)>,
    streams: BTreeMap<String, Vec<LogEvent>>,
}

#[derive(Debug, Default)]
struct LogState {
    groups: BTreeMap<String, Group>,
    failing_streams: HashSet<String>,
    stuck_streams: HashSet<String>,
    calls: Vec<Call>,
}

/// Log groups held in memory. Listings are served `page_size` at a time.
#[derive(Debug)]
pub struct MemoryLogStore {
    page_size: usize,
    state: Mutex<LogState>,
}

impl Default for MemoryLogStore {
    fn default() -> Self {
        Self::new(50)
    }
}

impl MemoryLogStore {
    pub fn new(page_size: usize) -> Self {
        Self {
            page_size: page_size.max(1),
            state: Mutex::new(LogState::default()),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, LogState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn create_group(&self, name: &str, retention_days: Option<i32>) {
        self.state().groups.insert(
            name.to_string(),
            Group {
                retention_days,
                ..Default::default()
            },
        );
    }

    pub fn tag_group(&self, group: &str, key: &str, value: &str) {
        if let Some(g) = self.state().groups.get_mut(group) {
            g.tags.push((key.to_string(), value.to_string()));
        }
    }

    pub fn push_event(&self, group: &str, stream: &str, timestamp_ms: i64, message: &str) {
        if let Some(g) = self.state().groups.get_mut(group) {
            g.streams.entry(stream.to_string()).or_default().push(LogEvent {
                timestamp_ms,
                message: message.to_string(),
            });
        }
    }

    /// Reading events of `stream` fails with AccessDenied.
    pub fn fail_stream(&self, stream: &str) {
        self.state().failing_streams.insert(stream.to_string());
    }

    /// `stream` keeps returning its first page with an unchanged token.
    pub fn stick_stream(&self, stream: &str) {
        self.state().stuck_streams.insert(stream.to_string());
    }

    pub fn retention(&self, group: &str) -> Option<i32> {
        self.state().groups.get(group).and_then(|g| g.retention_days)
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state().calls.clone()
    }

    fn window<T: Clone>(&self, all: &[T], cursor: Option<String>) -> (Vec<T>, Option<String>) {
        let start: usize = cursor.and_then(|c| c.parse().ok()).unwrap_or_default();
        let end = (start + self.page_size).min(all.len());
        let items = all.get(start..end).map(<[_]>::to_vec).unwrap_or_default();
        (items, (end < all.len()).then(|| end.to_string()))
    }

    fn missing(operation: &str, group: &str) -> ProviderError {
        ProviderError::permanent(
            operation,
            "ResourceNotFoundException",
            format!("The specified log group does not exist: {group}"),
        )
    }
}

#[async_trait]
impl LogStore for MemoryLogStore {
    async fn list_log_groups(
        &self,
        cursor: Option<String>,
    ) -> Result<Page<LogGroupInfo>, ProviderError> {
        let infos: Vec<LogGroupInfo> = self
            .state()
            .groups
            .iter()
            .map(|(name, g)| LogGroupInfo {
                name: name.clone(),
                stored_bytes: g
                    .streams
                    .values()
                    .flatten()
                    .map(|e| e.message.len() as u64)
                    .sum(),
                retention_days: g.retention_days,
                tags: Vec::new(),
            })
            .collect();
        let (items, next) = self.window(&infos, cursor);
        Ok(Page::new(items, next))
    }

    async fn describe_log_group(&self, name: &str) -> Result<Option<LogGroupInfo>, ProviderError> {
        Ok(self.state().groups.get(name).map(|g| LogGroupInfo {
            name: name.to_string(),
            stored_bytes: 0,
            retention_days: g.retention_days,
            tags: Vec::new(),
        }))
    }

    async fn log_group_tags(&self, group: &str) -> Result<Vec<(String, String)>, ProviderError> {
        self.state()
            .groups
            .get(group)
            .map(|g| g.tags.clone())
            .ok_or_else(|| Self::missing("list_tags_log_group", group))
    }

    async fn list_streams(
        &self,
        group: &str,
        cursor: Option<String>,
    ) -> Result<Page<String>, ProviderError> {
        let names: Vec<String> = {
            let mut state = self.state();
            state.calls.push(Call::ListStreams(group.to_string()));
            state
                .groups
                .get(group)
                .ok_or_else(|| Self::missing("describe_log_streams", group))?
                .streams
                .keys()
                .cloned()
                .collect()
        };
        let (items, next) = self.window(&names, cursor);
        Ok(Page::new(items, next))
    }

    async fn log_events(
        &self,
        group: &str,
        stream: &str,
        window: TimeWindow,
        cursor: Option<String>,
    ) -> Result<Page<LogEvent>, ProviderError> {
        let (events, stuck) = {
            let mut state = self.state();
            state.calls.push(Call::LogEvents {
                group: group.to_string(),
                stream: stream.to_string(),
            });
            if state.failing_streams.contains(stream) {
                return Err(ProviderError::permanent("get_log_events", "AccessDeniedException", "denied"));
            }
            let events: Vec<LogEvent> = state
                .groups
                .get(group)
                .ok_or_else(|| Self::missing("get_log_events", group))?
                .streams
                .get(stream)
                .cloned()
                .unwrap_or_default()
                .into_iter()
                .filter(|e| e.timestamp_ms >= window.start_ms && e.timestamp_ms <= window.end_ms)
                .collect();
            (events, state.stuck_streams.contains(stream))
        };
        if stuck {
            let (items, _) = self.window(&events, None);
            return Ok(Page::new(items, Some("stuck".to_string())));
        }
        let (items, next) = self.window(&events, cursor);
        Ok(Page::new(items, next))
    }

    async fn put_retention(&self, group: &str, days: i32) -> Result<(), ProviderError> {
        let mut state = self.state();
        state.calls.push(Call::PutRetention {
            group: group.to_string(),
            days,
        });
        let g = state
            .groups
            .get_mut(group)
            .ok_or_else(|| Self::missing("put_retention_policy", group))?;
        g.retention_days = Some(days);
        Ok(())
    }

    async fn delete_log_group(&self, group: &str) -> Result<(), ProviderError> {
        let mut state = self.state();
        state.calls.push(Call::DeleteLogGroup(group.to_string()));
        state
            .groups
            .remove(group)
            .map(|_| ())
            .ok_or_else(|| Self::missing("delete_log_group", group))
    }
}

/// Export tasks whose observed state follows a script: every listing pops the
/// next snapshot, and the last snapshot repeats forever.
#[derive(Debug, Default)]
pub struct MemoryTaskSource {
    snapshots: Mutex<VecDeque<Vec<AsyncTask>>>,
    calls: Mutex<Vec<Call>>,
}

impl MemoryTaskSource {
    pub fn scripted(snapshots: Vec<Vec<AsyncTask>>) -> Self {
        Self {
            snapshots: Mutex::new(snapshots.into()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

#[async_trait]
impl ExportTaskSource for MemoryTaskSource {
    async fn list_export_tasks(
        &self,
        _cursor: Option<String>,
    ) -> Result<Page<AsyncTask>, ProviderError> {
        self.calls
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(Call::ListExportTasks);
        let mut snapshots = self
            .snapshots
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let tasks = if snapshots.len() > 1 {
            snapshots.pop_front().unwrap_or_default()
        } else {
            snapshots.front().cloned().unwrap_or_default()
        };
        Ok(Page::last(tasks))
    }

    async fn submit_export(&self, request: &ExportRequest) -> Result<String, ProviderError> {
        self.calls
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(Call::SubmitExport(request.task_name.clone()));
        let mut snapshots = self
            .snapshots
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let id = format!("task-{}", snapshots.iter().map(Vec::len).sum::<usize>() + 1);
        let task = AsyncTask::new(&id, &request.task_name, crate::types::TaskState::Pending);
        match snapshots.back_mut() {
            Some(last) => last.push(task),
            None => snapshots.push_back(vec![task]),
        }
        Ok(id)
    }
}
