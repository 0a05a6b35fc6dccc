//! Seams between the engine and the cloud provider.
//!
//! The engine only talks to these traits; `s3_aux` and `logs_aux` implement
//! them over the AWS SDK and `memory` keeps everything in process.

use async_trait::async_trait;
use std::path::Path;

use crate::error::{ProviderError, RetireError};
use crate::types::{AsyncTask, ItemError, LogGroupInfo, ObjectEntry, ResourceHandle};

/// One page of a cursor-based listing. `next_cursor == None` means exhausted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub next_cursor: Option<String>,
}

impl<T> Page<T> {
    pub fn new(items: Vec<T>, next_cursor: Option<String>) -> Self {
        Self { items, next_cursor }
    }

    pub fn last(items: Vec<T>) -> Self {
        Self {
            items,
            next_cursor: None,
        }
    }
}

/// Object storage: buckets with optionally versioned keys.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// `Ok(false)` when the bucket does not exist or is not visible.
    async fn bucket_exists(&self, bucket: &str) -> Result<bool, ProviderError>;

    async fn bucket_tags(&self, bucket: &str) -> Result<Vec<(String, String)>, ProviderError>;

    /// Region the bucket lives in.
    async fn bucket_region(&self, bucket: &str) -> Result<String, ProviderError>;

    async fn is_versioned(&self, bucket: &str) -> Result<bool, ProviderError>;

    /// Current objects only.
    async fn list_objects(
        &self,
        bucket: &str,
        cursor: Option<String>,
    ) -> Result<Page<ObjectEntry>, ProviderError>;

    /// All versions and delete markers.
    async fn list_versions(
        &self,
        bucket: &str,
        cursor: Option<String>,
    ) -> Result<Page<ObjectEntry>, ProviderError>;

    /// Write the content of `handle` to `dest`, returning the byte count.
    async fn download(&self, handle: &ResourceHandle, dest: &Path) -> Result<u64, RetireError>;

    /// Quiet batched delete: only failed items are reported back.
    async fn delete_batch(
        &self,
        bucket: &str,
        handles: &[ResourceHandle],
    ) -> Result<Vec<ItemError>, ProviderError>;

    async fn delete_bucket(&self, bucket: &str) -> Result<(), ProviderError>;
}

/// Inclusive time window in epoch milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    pub start_ms: i64,
    pub end_ms: i64,
}

impl TimeWindow {
    /// The last `days` days up to `now_ms`. `None` reaches back to the epoch.
    pub fn lookback(now_ms: i64, days: Option<u32>) -> Self {
        let start_ms = match days {
            Some(days) => now_ms.saturating_sub(i64::from(days) * 24 * 60 * 60 * 1000).max(0),
            None => 0,
        };
        Self {
            start_ms,
            end_ms: now_ms,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEvent {
    pub timestamp_ms: i64,
    pub message: String,
}

/// Log groups with a retention policy and streams of events.
#[async_trait]
pub trait LogStore: Send + Sync {
    async fn list_log_groups(
        &self,
        cursor: Option<String>,
    ) -> Result<Page<LogGroupInfo>, ProviderError>;

    /// Exact-name lookup; `Ok(None)` when the group does not exist.
    async fn describe_log_group(&self, name: &str) -> Result<Option<LogGroupInfo>, ProviderError>;

    async fn log_group_tags(&self, group: &str) -> Result<Vec<(String, String)>, ProviderError>;

    async fn list_streams(
        &self,
        group: &str,
        cursor: Option<String>,
    ) -> Result<Page<String>, ProviderError>;

    /// Events of one stream, oldest first. An empty page ends the stream.
    async fn log_events(
        &self,
        group: &str,
        stream: &str,
        window: TimeWindow,
        cursor: Option<String>,
    ) -> Result<Page<LogEvent>, ProviderError>;

    async fn put_retention(&self, group: &str, days: i32) -> Result<(), ProviderError>;

    async fn delete_log_group(&self, group: &str) -> Result<(), ProviderError>;
}

/// Parameters of a server-side export of a log group to a bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportRequest {
    pub task_name: String,
    pub log_group: String,
    pub from_ms: i64,
    pub to_ms: i64,
    pub destination: String,
    pub destination_prefix: String,
}

impl ExportRequest {
    /// Build the request for `[start, end]` given in epoch seconds.
    pub fn new(log_group: &str, start_secs: i64, end_secs: i64, destination: &str) -> Self {
        let modified = log_group.replace('/', "-");
        Self {
            task_name: format!("export-{modified}-{start_secs}-{end_secs}"),
            log_group: log_group.to_string(),
            from_ms: start_secs * 1000,
            to_ms: end_secs * 1000,
            destination: destination.to_string(),
            destination_prefix: format!("{modified}/{start_secs}-{end_secs}"),
        }
    }
}

/// Long-running provider jobs. The poller only observes them.
#[async_trait]
pub trait ExportTaskSource: Send + Sync {
    async fn list_export_tasks(
        &self,
        cursor: Option<String>,
    ) -> Result<Page<AsyncTask>, ProviderError>;

    /// Submit an export and return the provider task id.
    async fn submit_export(&self, request: &ExportRequest) -> Result<String, ProviderError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn export_request_naming() {
        let req = ExportRequest::new("/aws/lambda/fn", 100, 200, "bucket");
        assert_eq!(req.task_name, "export--aws-lambda-fn-100-200");
        assert_eq!(req.destination_prefix, "-aws-lambda-fn/100-200");
        assert_eq!(req.from_ms, 100_000);
        assert_eq!(req.to_ms, 200_000);
    }

    #[test]
    fn lookback_window() {
        let day = 24 * 60 * 60 * 1000;
        let w = TimeWindow::lookback(10 * day, Some(3));
        assert_eq!(w.start_ms, 7 * day);
        assert_eq!(w.end_ms, 10 * day);
        assert_eq!(TimeWindow::lookback(day, Some(10_000)).start_ms, 0);
        assert_eq!(TimeWindow::lookback(day, None).start_ms, 0);
    }
}
