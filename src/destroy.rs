//! Batched, strictly sequential deletion of a collection's contents.

use tracing::{error, info, warn};

use crate::config::PaginationConfig;
use crate::error::{ProviderError, Result};
use crate::paginate::Paginator;
use crate::provider::ObjectStore;
use crate::types::{Action, BatchJob, ItemError, OperationMode, ResourceHandle, MAX_BATCH_SIZE};

/// Split `handles` into consecutive jobs of at most `size` handles each.
pub fn partition(handles: Vec<ResourceHandle>, size: usize) -> Vec<BatchJob> {
    let size = size.clamp(1, MAX_BATCH_SIZE);
    let mut jobs = Vec::with_capacity(handles.len().div_ceil(size));
    let mut rest = handles.into_iter().peekable();
    while rest.peek().is_some() {
        jobs.push(BatchJob {
            index: jobs.len(),
            handles: rest.by_ref().take(size).collect(),
        });
    }
    jobs
}

/// Every handle a full wipe of `bucket` must delete: all versions and delete
/// markers when versioned, the current objects otherwise.
pub async fn enumerate_handles(
    store: &dyn ObjectStore,
    bucket: &str,
    versioned: bool,
    pagination: PaginationConfig,
) -> Result<Vec<ResourceHandle>> {
    let entries = Paginator::new(format!("deletion candidates of {bucket}"), pagination, |cursor| {
        if versioned {
            store.list_versions(bucket, cursor)
        } else {
            store.list_objects(bucket, cursor)
        }
    })
    .collect_all()
    .await?;
    Ok(entries.into_iter().map(|e| e.handle).collect())
}

#[derive(Debug, Clone, Default)]
pub struct DestroyReport {
    pub collection: String,
    pub actions: Vec<Action>,
    pub handles: usize,
    pub batches_issued: usize,
    /// Per-item failures inside otherwise successful batch calls
    pub item_errors: Vec<ItemError>,
    /// A batch call that failed as a whole; later batches were not issued
    pub fatal: Option<ProviderError>,
    pub collection_deleted: bool,
    pub collection_error: Option<ProviderError>,
}

impl DestroyReport {
    pub fn failed(&self) -> usize {
        self.item_errors.len()
            + usize::from(self.fatal.is_some())
            + usize::from(self.collection_error.is_some())
    }

    pub fn is_success(&self) -> bool {
        self.failed() == 0
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BatchDestroyer {
    mode: OperationMode,
    batch_size: usize,
}

impl BatchDestroyer {
    pub fn new(mode: OperationMode) -> Self {
        Self {
            mode,
            batch_size: MAX_BATCH_SIZE,
        }
    }

    /// Smaller batches; never above the provider ceiling.
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size.clamp(1, MAX_BATCH_SIZE);
        self
    }

    /// Delete `handles` from `bucket` one batch at a time, then the bucket
    /// itself when `delete_collection` is set and no batch failed as a whole.
    pub async fn destroy(
        &self,
        store: &dyn ObjectStore,
        bucket: &str,
        handles: Vec<ResourceHandle>,
        delete_collection: bool,
    ) -> DestroyReport {
        let mut report = DestroyReport {
            collection: bucket.to_string(),
            handles: handles.len(),
            ..Default::default()
        };
        let jobs = partition(handles, self.batch_size);
        let total = jobs.len();
        info!(bucket = %bucket, handles = report.handles, batches = total, mode = self.mode.as_str(), "Destroying contents");

        for job in jobs {
            report.actions.push(Action::DeleteBatch {
                index: job.index,
                total,
                handles: job.handles.clone(),
            });

            if self.mode.is_dry_run() {
                println!(
                    "Would delete batch {}/{total} from {bucket} ({} keys):",
                    job.index + 1,
                    job.handles.len()
                );
                for handle in &job.handles {
                    println!("  {handle}");
                }
                continue;
            }

            report.batches_issued += 1;
            match store.delete_batch(bucket, &job.handles).await {
                Ok(errors) => {
                    for e in &errors {
                        warn!(handle = %e.handle, code = %e.code, message = %e.message, "Failed to delete item");
                    }
                    info!(
                        bucket = %bucket,
                        batch = job.index + 1,
                        of = total,
                        deleted = job.handles.len() - errors.len(),
                        failed = errors.len(),
                        "Batch deleted"
                    );
                    report.item_errors.extend(errors);
                }
                Err(err) => {
                    error!(bucket = %bucket, batch = job.index + 1, error = %err, "Batch delete failed, stopping");
                    report.fatal = Some(err);
                    return report;
                }
            }
        }

        if !delete_collection {
            return report;
        }
        report.actions.push(Action::DeleteCollection {
            collection: bucket.to_string(),
        });
        if self.mode.is_dry_run() {
            println!("Would delete bucket {bucket}");
            return report;
        }
        match store.delete_bucket(bucket).await {
            Ok(()) => report.collection_deleted = true,
            Err(err) => {
                error!(bucket = %bucket, error = %err, "Bucket delete failed");
                report.collection_error = Some(err);
            }
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{Call, MemoryObjectStore};

    fn handles(n: usize) -> Vec<ResourceHandle> {
        (0..n)
            .map(|i| ResourceHandle::versioned("b", format!("k{i}"), "v"))
            .collect()
    }

    fn filled(n: usize) -> MemoryObjectStore {
        let store = MemoryObjectStore::new(1000);
        store.create_bucket("b", "us-east-1", true);
        for i in 0..n {
            store.put("b", &format!("k{i}"), Some("v"), b"x");
        }
        store
    }

    #[test]
    fn partition_covers_input_once() {
        for n in [0, 1, 999, 1000, 1001, 2500] {
            let input = handles(n);
            let jobs = partition(input.clone(), MAX_BATCH_SIZE);
            assert_eq!(jobs.len(), n.div_ceil(MAX_BATCH_SIZE));
            assert!(jobs.iter().all(|j| j.handles.len() <= MAX_BATCH_SIZE));
            let flat: Vec<_> = jobs.into_iter().flat_map(|j| j.handles).collect();
            assert_eq!(flat, input);
        }
    }

    #[test]
    fn batch_size_is_capped() {
        let jobs = partition(handles(2001), 5000);
        assert_eq!(jobs.iter().map(|j| j.handles.len()).collect::<Vec<_>>(), vec![1000, 1000, 1]);
    }

    #[tokio::test]
    async fn batches_run_in_order_and_bucket_goes_last() {
        let store = filled(2500);
        let report = BatchDestroyer::new(OperationMode::Execute)
            .destroy(&store, "b", handles(2500), true)
            .await;

        assert!(report.is_success());
        assert!(report.collection_deleted);
        assert_eq!(
            store.calls(),
            vec![
                Call::DeleteBatch { bucket: "b".into(), size: 1000 },
                Call::DeleteBatch { bucket: "b".into(), size: 1000 },
                Call::DeleteBatch { bucket: "b".into(), size: 500 },
                Call::DeleteBucket("b".into()),
            ]
        );
    }

    #[tokio::test]
    async fn item_errors_do_not_stop_later_batches() {
        let store = filled(1500);
        store.fail_delete("k3");
        let report = BatchDestroyer::new(OperationMode::Execute)
            .destroy(&store, "b", handles(1500), false)
            .await;

        assert_eq!(report.batches_issued, 2);
        assert_eq!(report.item_errors.len(), 1);
        assert_eq!(report.item_errors[0].handle.key, "k3");
        assert!(report.fatal.is_none());
        assert_eq!(store.entry_count("b"), 1);
    }

    #[tokio::test]
    async fn failed_batch_call_skips_the_rest_and_the_bucket() {
        let store = filled(2500);
        store.fail_batch(1);
        let report = BatchDestroyer::new(OperationMode::Execute)
            .destroy(&store, "b", handles(2500), true)
            .await;

        assert!(report.fatal.is_some());
        assert_eq!(report.batches_issued, 2);
        assert!(!report.collection_deleted);
        assert!(!store.calls().contains(&Call::DeleteBucket("b".into())));
        assert!(store.contains_bucket("b"));
    }

    #[tokio::test]
    async fn dry_run_partitions_identically_without_calls() {
        let store = filled(2500);
        let dry = BatchDestroyer::new(OperationMode::DryRun)
            .destroy(&store, "b", handles(2500), true)
            .await;
        assert!(store.calls().is_empty());
        assert_eq!(dry.batches_issued, 0);

        let exec = BatchDestroyer::new(OperationMode::Execute)
            .destroy(&store, "b", handles(2500), true)
            .await;
        assert_eq!(dry.actions, exec.actions);
        assert_eq!(dry.actions.len(), 4);
    }

    #[tokio::test]
    async fn enumerates_versions_and_delete_markers() {
        let store = MemoryObjectStore::new(2);
        store.create_bucket("b", "us-east-1", true);
        store.put("b", "a", Some("v1"), b"1");
        store.put("b", "a", Some("v2"), b"2");
        store.put_delete_marker("b", "a", "v3");

        let all = enumerate_handles(&store, "b", true, PaginationConfig::default())
            .await
            .unwrap();
        assert_eq!(all.len(), 3);
        let current = enumerate_handles(&store, "b", false, PaginationConfig::default())
            .await
            .unwrap();
        assert_eq!(current.len(), 2);
        assert!(current.iter().all(|h| h.version_id.is_none()));
    }
}
