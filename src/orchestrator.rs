//! Two-level bounded fan-out: regions first, then resources inside a region.
//!
//! Each unit of work runs as its own tokio task. Results are only merged after
//! the task has been joined, and a failing task is tagged with its key and
//! recorded without touching its siblings.

use futures::stream::{self, StreamExt};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::config::{PaginationConfig, RunConfig};
use crate::destroy::{enumerate_handles, BatchDestroyer, DestroyReport};
use crate::error::{Result, RetireError};
use crate::paginate::Paginator;
use crate::provider::{LogStore, ObjectStore, TimeWindow};
use crate::snapshot::{SnapshotExporter, SnapshotReport};
use crate::types::{Action, LogGroupInfo};

/// A unit of work that ended in an error, keyed by region or resource id.
#[derive(Debug)]
pub struct TaskFailure {
    pub key: String,
    pub error: RetireError,
}

/// Joined results of one fan-out, in the order the keys were given.
#[derive(Debug)]
pub struct FanOut<T> {
    pub succeeded: Vec<(String, T)>,
    pub failed: Vec<TaskFailure>,
}

impl<T> Default for FanOut<T> {
    fn default() -> Self {
        Self {
            succeeded: Vec::new(),
            failed: Vec::new(),
        }
    }
}

impl<T> FanOut<T> {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }

    /// First failure that must end the whole run.
    pub fn fatal(&self) -> Option<&TaskFailure> {
        self.failed.iter().find(|f| f.error.is_fatal())
    }
}

impl<T> FanOut<FanOut<T>> {
    /// Merge a region-level fan-out of resource-level fan-outs.
    pub fn flatten(self) -> FanOut<T> {
        let mut merged = FanOut {
            succeeded: Vec::new(),
            failed: self.failed,
        };
        for (_, inner) in self.succeeded {
            merged.succeeded.extend(inner.succeeded);
            merged.failed.extend(inner.failed);
        }
        merged
    }
}

/// Run `work(key)` for every key on at most `width` concurrent tasks.
///
/// `work` is only called when a slot frees up, so no more than `width`
/// tasks exist at any time.
pub async fn run_bounded<T, F, Fut>(keys: Vec<String>, width: usize, mut work: F) -> FanOut<T>
where
    F: FnMut(String) -> Fut,
    Fut: Future<Output = Result<T>> + Send + 'static,
    T: Send + 'static,
{
    let mut joined: Vec<_> = stream::iter(keys.into_iter().enumerate())
        .map(|(index, key)| {
            let handle = tokio::spawn(work(key.clone()));
            async move { (index, key, handle.await) }
        })
        .buffer_unordered(width.max(1))
        .collect()
        .await;
    joined.sort_by_key(|(index, _, _)| *index);

    let mut out = FanOut::default();
    for (_, key, result) in joined {
        let error = match result {
            Ok(Ok(value)) => {
                out.succeeded.push((key, value));
                continue;
            }
            Ok(Err(error)) => error,
            Err(join) => RetireError::Worker {
                key: key.clone(),
                message: join.to_string(),
            },
        };
        error!(key = %key, error = %error, "Task failed");
        out.failed.push(TaskFailure { key, error });
    }
    out
}

/// A bucket that passed the pre-destructive checks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketTarget {
    pub name: String,
    pub region: String,
    pub tags: Vec<(String, String)>,
}

/// Validate that `bucket` exists and look up its region and tags.
///
/// A missing bucket is a validation error and ends the run.
pub async fn inspect_bucket(store: &dyn ObjectStore, bucket: &str) -> Result<BucketTarget> {
    if !store.bucket_exists(bucket).await? {
        return Err(RetireError::Validation(format!(
            "bucket {bucket} does not exist or is not accessible"
        )));
    }
    let region = store.bucket_region(bucket).await?;
    let tags = match store.bucket_tags(bucket).await {
        Ok(tags) => tags,
        Err(err) => {
            warn!(bucket = %bucket, error = %err, "Could not read bucket tags");
            Vec::new()
        }
    };
    Ok(BucketTarget {
        name: bucket.to_string(),
        region,
        tags,
    })
}

/// Find the region of `bucket` through `home`, then inspect it through the
/// store for that region.
///
/// Location lookups are answered from any region; head and tagging requests
/// are not. Only a bucket that does not exist is a validation error; other
/// provider errors concern this bucket alone.
pub async fn locate_bucket<F>(home: &dyn ObjectStore, bucket: &str, store_for: F) -> Result<BucketTarget>
where
    F: Fn(&str) -> Arc<dyn ObjectStore>,
{
    let region = match home.bucket_region(bucket).await {
        Ok(region) => region,
        Err(err) if err.is_not_found() => {
            return Err(RetireError::Validation(format!("bucket {bucket} does not exist")));
        }
        Err(err) => return Err(err.into()),
    };
    debug!(bucket = %bucket, region = %region, "Resolved bucket region");
    let regional = store_for(&region);
    inspect_bucket(regional.as_ref(), bucket).await
}

#[derive(Debug, Clone)]
pub struct BucketRetirement {
    pub bucket: String,
    pub region: String,
    pub versioned: bool,
    pub snapshot: SnapshotReport,
    /// `None` when destruction was held back
    pub destroy: Option<DestroyReport>,
    pub held_back: Option<String>,
}

impl BucketRetirement {
    pub fn failed(&self) -> usize {
        self.snapshot.failed()
            + self.destroy.as_ref().map(DestroyReport::failed).unwrap_or_default()
            + usize::from(self.held_back.is_some())
    }

    /// Every planned side effect, snapshot first.
    pub fn actions(&self) -> Vec<Action> {
        let mut actions = self.snapshot.actions.clone();
        if let Some(destroy) = &self.destroy {
            actions.extend(destroy.actions.iter().cloned());
        }
        actions
    }
}

/// Snapshot, then empty and delete one bucket.
#[derive(Debug, Clone)]
pub struct BucketRetirer {
    exporter: SnapshotExporter,
    destroyer: BatchDestroyer,
    pagination: PaginationConfig,
    force: bool,
}

impl BucketRetirer {
    pub fn new(config: &RunConfig) -> Self {
        Self {
            exporter: SnapshotExporter::new(config),
            destroyer: BatchDestroyer::new(config.mode),
            pagination: config.pagination,
            force: false,
        }
    }

    /// Destroy even when some downloads of the snapshot failed.
    pub fn force(mut self, yes: bool) -> Self {
        self.force = yes;
        self
    }

    pub fn with_destroyer(mut self, destroyer: BatchDestroyer) -> Self {
        self.destroyer = destroyer;
        self
    }

    pub async fn retire(&self, store: &dyn ObjectStore, target: &BucketTarget) -> Result<BucketRetirement> {
        let bucket = target.name.as_str();
        let versioned = store.is_versioned(bucket).await?;
        let snapshot = self.exporter.export_bucket(store, bucket, versioned).await?;

        let mut retirement = BucketRetirement {
            bucket: bucket.to_string(),
            region: target.region.clone(),
            versioned,
            snapshot,
            destroy: None,
            held_back: None,
        };
        if !retirement.snapshot.is_complete() && !self.force {
            warn!(
                bucket = %bucket,
                failed = retirement.snapshot.failed(),
                stalled = retirement.snapshot.stalled,
                "Snapshot incomplete, bucket left in place"
            );
            retirement.held_back = Some("snapshot incomplete".to_string());
            return Ok(retirement);
        }

        let handles = enumerate_handles(store, bucket, versioned, self.pagination).await?;
        retirement.destroy = Some(self.destroyer.destroy(store, bucket, handles, true).await);
        Ok(retirement)
    }
}

/// Retire `targets`, grouped by region. `store_for` yields the store that
/// serves a region.
pub async fn retire_buckets<F>(
    targets: Vec<BucketTarget>,
    config: &RunConfig,
    retirer: BucketRetirer,
    store_for: F,
) -> FanOut<BucketRetirement>
where
    F: Fn(&str) -> Arc<dyn ObjectStore>,
{
    let mut by_region: BTreeMap<String, Vec<BucketTarget>> = BTreeMap::new();
    for target in targets {
        by_region.entry(target.region.clone()).or_default().push(target);
    }
    let regions: Vec<String> = by_region.keys().cloned().collect();
    let resources = config.pools.resources;

    run_bounded(regions, config.pools.regions, |region| {
        let store = store_for(&region);
        let targets = by_region.remove(&region).unwrap_or_default();
        let retirer = retirer.clone();
        async move {
            info!(region = %region, buckets = targets.len(), "Processing region");
            let names = targets.iter().map(|t| t.name.clone()).collect();
            let targets = Arc::new(targets);
            Ok(run_bounded(names, resources, |name| {
                let store = Arc::clone(&store);
                let retirer = retirer.clone();
                let target = targets.iter().find(|t| t.name == name).cloned();
                async move {
                    let target = target.ok_or_else(|| {
                        RetireError::Validation(format!("bucket {name} was not inspected"))
                    })?;
                    retirer.retire(store.as_ref(), &target).await
                }
            })
            .await)
        }
    })
    .await
    .flatten()
}

/// Every log group visible to `store`.
pub async fn list_log_groups(store: &dyn LogStore, pagination: PaginationConfig) -> Result<Vec<LogGroupInfo>> {
    Paginator::new("log groups", pagination, |cursor| store.list_log_groups(cursor))
        .collect_all()
        .await
}

/// Like [`list_log_groups`], with the tags of every group. A group whose tags
/// cannot be read is listed without them.
pub async fn list_tagged_log_groups(
    store: &dyn LogStore,
    pagination: PaginationConfig,
) -> Result<Vec<LogGroupInfo>> {
    let mut groups = list_log_groups(store, pagination).await?;
    for group in &mut groups {
        match store.log_group_tags(&group.name).await {
            Ok(tags) => group.tags = tags,
            Err(err) => debug!(log_group = %group.name, error = %err, "Could not read log group tags"),
        }
    }
    Ok(groups)
}

/// Tagged log groups of every region, one task per region.
pub async fn list_log_groups_by_region<F>(
    regions: Vec<String>,
    width: usize,
    pagination: PaginationConfig,
    store_for: F,
) -> FanOut<Vec<LogGroupInfo>>
where
    F: Fn(&str) -> Arc<dyn LogStore>,
{
    run_bounded(regions, width, |region| {
        let store = store_for(&region);
        async move { list_tagged_log_groups(store.as_ref(), pagination).await }
    })
    .await
}

/// Download `groups` within `window`, `width` groups at a time.
pub async fn download_log_groups(
    store: Arc<dyn LogStore>,
    groups: Vec<String>,
    exporter: SnapshotExporter,
    window: TimeWindow,
    width: usize,
) -> FanOut<SnapshotReport> {
    run_bounded(groups, width, |group| {
        let store = Arc::clone(&store);
        let exporter = exporter.clone();
        async move { exporter.export_log_group(store.as_ref(), &group, window).await }
    })
    .await
}
