//! CloudWatch Logs implementation of the log and export-task seams.

use async_trait::async_trait;
use aws_sdk_cloudwatchlogs::Client;
use tracing::info;

use crate::client::AwsContext;
use crate::error::{from_sdk, ProviderError};
use crate::provider::{ExportRequest, ExportTaskSource, LogEvent, LogStore, Page, TimeWindow};
use crate::types::{AsyncTask, LogGroupInfo, TaskState};

/// Commercial regions that serve CloudWatch Logs.
pub const LOGS_REGIONS: &[&str] = &[
    "af-south-1",
    "ap-east-1",
    "ap-northeast-1",
    "ap-northeast-2",
    "ap-northeast-3",
    "ap-south-1",
    "ap-south-2",
    "ap-southeast-1",
    "ap-southeast-2",
    "ap-southeast-3",
    "ap-southeast-4",
    "ca-central-1",
    "ca-west-1",
    "eu-central-1",
    "eu-central-2",
    "eu-north-1",
    "eu-south-1",
    "eu-south-2",
    "eu-west-1",
    "eu-west-2",
    "eu-west-3",
    "il-central-1",
    "me-central-1",
    "me-south-1",
    "sa-east-1",
    "us-east-1",
    "us-east-2",
    "us-west-1",
    "us-west-2",
];

#[derive(Debug, Clone)]
pub struct CloudWatchLogs {
    client: Client,
    region: String,
}

impl CloudWatchLogs {
    pub fn from_context(ctx: &AwsContext) -> Self {
        Self {
            client: ctx.logs_client(),
            region: ctx.region().to_string(),
        }
    }

    pub fn region(&self) -> &str {
        &self.region
    }
}

/// Bucket that receives export tasks: `cw-logs-export-<account>-<region>`.
pub async fn export_bucket_name(ctx: &AwsContext) -> Result<String, ProviderError> {
    let identity = ctx
        .sts_client()
        .get_caller_identity()
        .send()
        .await
        .map_err(|e| from_sdk("get_caller_identity", e))?;
    let account = identity.account().unwrap_or("unknown");
    Ok(format!("cw-logs-export-{account}-{}", ctx.region()))
}

fn group_info(group: &aws_sdk_cloudwatchlogs::types::LogGroup) -> Option<LogGroupInfo> {
    Some(LogGroupInfo {
        name: group.log_group_name()?.to_string(),
        stored_bytes: group.stored_bytes().unwrap_or_default().max(0) as u64,
        retention_days: group.retention_in_days(),
        tags: Vec::new(),
    })
}

#[async_trait]
impl LogStore for CloudWatchLogs {
    async fn list_log_groups(
        &self,
        cursor: Option<String>,
    ) -> Result<Page<LogGroupInfo>, ProviderError> {
        let resp = self
            .client
            .describe_log_groups()
            .set_next_token(cursor)
            .send()
            .await
            .map_err(|e| from_sdk("describe_log_groups", e))?;
        let items = resp.log_groups().iter().filter_map(group_info).collect();
        Ok(Page::new(items, resp.next_token().map(str::to_string)))
    }

    async fn describe_log_group(&self, name: &str) -> Result<Option<LogGroupInfo>, ProviderError> {
        let mut token = None;
        loop {
            let resp = self
                .client
                .describe_log_groups()
                .log_group_name_prefix(name)
                .set_next_token(token)
                .send()
                .await
                .map_err(|e| from_sdk("describe_log_groups", e))?;
            let found = resp
                .log_groups()
                .iter()
                .filter_map(group_info)
                .find(|g| g.name == name);
            if found.is_some() {
                return Ok(found);
            }
            match resp.next_token() {
                Some(next) => token = Some(next.to_string()),
                None => return Ok(None),
            }
        }
    }

    #[allow(deprecated)]
    async fn log_group_tags(&self, group: &str) -> Result<Vec<(String, String)>, ProviderError> {
        let resp = self
            .client
            .list_tags_log_group()
            .log_group_name(group)
            .send()
            .await
            .map_err(|e| from_sdk("list_tags_log_group", e))?;
        let mut tags: Vec<(String, String)> = resp
            .tags()
            .map(|t| t.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default();
        tags.sort();
        Ok(tags)
    }

    async fn list_streams(
        &self,
        group: &str,
        cursor: Option<String>,
    ) -> Result<Page<String>, ProviderError> {
        let resp = self
            .client
            .describe_log_streams()
            .log_group_name(group)
            .set_next_token(cursor)
            .send()
            .await
            .map_err(|e| from_sdk("describe_log_streams", e))?;
        let items = resp
            .log_streams()
            .iter()
            .filter_map(|s| s.log_stream_name().map(str::to_string))
            .collect();
        Ok(Page::new(items, resp.next_token().map(str::to_string)))
    }

    async fn log_events(
        &self,
        group: &str,
        stream: &str,
        window: TimeWindow,
        cursor: Option<String>,
    ) -> Result<Page<LogEvent>, ProviderError> {
        let resp = self
            .client
            .get_log_events()
            .log_group_name(group)
            .log_stream_name(stream)
            .start_time(window.start_ms)
            .end_time(window.end_ms)
            .start_from_head(true)
            .set_next_token(cursor)
            .send()
            .await
            .map_err(|e| from_sdk("get_log_events", e))?;

        let items: Vec<LogEvent> = resp
            .events()
            .iter()
            .map(|e| LogEvent {
                timestamp_ms: e.timestamp().unwrap_or_default(),
                message: e.message().unwrap_or_default().to_string(),
            })
            .collect();
        // the forward token keeps coming back at the end of a stream
        let next = if items.is_empty() {
            None
        } else {
            resp.next_forward_token().map(str::to_string)
        };
        Ok(Page::new(items, next))
    }

    async fn put_retention(&self, group: &str, days: i32) -> Result<(), ProviderError> {
        self.client
            .put_retention_policy()
            .log_group_name(group)
            .retention_in_days(days)
            .send()
            .await
            .map_err(|e| from_sdk("put_retention_policy", e))?;
        info!(log_group = %group, days, "Retention policy set");
        Ok(())
    }

    async fn delete_log_group(&self, group: &str) -> Result<(), ProviderError> {
        self.client
            .delete_log_group()
            .log_group_name(group)
            .send()
            .await
            .map_err(|e| from_sdk("delete_log_group", e))?;
        info!(log_group = %group, "Log group deleted");
        Ok(())
    }
}

#[async_trait]
impl ExportTaskSource for CloudWatchLogs {
    async fn list_export_tasks(
        &self,
        cursor: Option<String>,
    ) -> Result<Page<AsyncTask>, ProviderError> {
        let resp = self
            .client
            .describe_export_tasks()
            .set_next_token(cursor)
            .send()
            .await
            .map_err(|e| from_sdk("describe_export_tasks", e))?;

        let items = resp
            .export_tasks()
            .iter()
            .map(|t| {
                let state = t
                    .status()
                    .and_then(|s| s.code())
                    .map(|c| TaskState::from_code(c.as_str()))
                    .unwrap_or(TaskState::Pending);
                let mut task = AsyncTask::new(
                    t.task_id().unwrap_or("N/A"),
                    t.task_name().unwrap_or("N/A"),
                    state,
                );
                task.destination = t.destination().map(str::to_string);
                task.destination_prefix = t.destination_prefix().map(str::to_string);
                if let Some(info) = t.execution_info() {
                    task.created_at_ms = info.creation_time();
                    task.completed_at_ms = info.completion_time();
                }
                task
            })
            .collect();
        Ok(Page::new(items, resp.next_token().map(str::to_string)))
    }

    async fn submit_export(&self, request: &ExportRequest) -> Result<String, ProviderError> {
        let resp = self
            .client
            .create_export_task()
            .task_name(&request.task_name)
            .log_group_name(&request.log_group)
            .from(request.from_ms)
            .to(request.to_ms)
            .destination(&request.destination)
            .destination_prefix(&request.destination_prefix)
            .send()
            .await
            .map_err(|e| from_sdk("create_export_task", e))?;
        let task_id = resp.task_id().unwrap_or("N/A").to_string();
        info!(task_id = %task_id, log_group = %request.log_group, "Export task created");
        Ok(task_id)
    }
}
