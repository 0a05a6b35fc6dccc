use std::io::Write;
use std::sync::{Arc, Mutex};

use aws_retire::config::{PaginationConfig, RunConfig};
use aws_retire::memory::{Call, MemoryLogStore, MemoryObjectStore};
use aws_retire::orchestrator::{inspect_bucket, retire_buckets, BucketRetirer};
use aws_retire::paginate::Paginator;
use aws_retire::provider::{ObjectStore, Page};
use aws_retire::retention::{only_if_unset, GuardOutcome, RetentionGuard};
use aws_retire::snapshot::SnapshotExporter;
use aws_retire::OperationMode;

fn versioned_bucket(versions: usize) -> MemoryObjectStore {
    let store = MemoryObjectStore::new(1000);
    store.create_bucket("archive", "eu-west-1", true);
    for i in 0..versions {
        let key = format!("data/{:03}.csv", i / 5);
        store.put("archive", &key, Some(&format!("v{}", i % 5)), b"row");
    }
    store
}

fn config(root: &std::path::Path, mode: OperationMode) -> RunConfig {
    let mut config = RunConfig::new(mode);
    config.snapshot_root = root.to_path_buf();
    config
}

#[tokio::test]
async fn retiring_2500_versions_takes_three_batches_then_the_bucket() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(versioned_bucket(2500));
    let config = config(dir.path(), OperationMode::Execute);

    let target = inspect_bucket(store.as_ref(), "archive").await.unwrap();
    let handle = Arc::clone(&store);
    let out = retire_buckets(vec![target], &config, BucketRetirer::new(&config), move |_| -> Arc<dyn ObjectStore> {
        handle.clone()
    })
    .await;

    assert!(out.is_clean());
    let retirement = &out.succeeded[0].1;
    assert_eq!(retirement.snapshot.downloaded(), 2500);
    assert_eq!(retirement.failed(), 0);

    let destructive: Vec<Call> = store
        .calls()
        .into_iter()
        .filter(|c| matches!(c, Call::DeleteBatch { .. } | Call::DeleteBucket(_)))
        .collect();
    assert_eq!(
        destructive,
        vec![
            Call::DeleteBatch { bucket: "archive".into(), size: 1000 },
            Call::DeleteBatch { bucket: "archive".into(), size: 1000 },
            Call::DeleteBatch { bucket: "archive".into(), size: 500 },
            Call::DeleteBucket("archive".into()),
        ]
    );
    assert!(!store.contains_bucket("archive"));
    assert!(dir.path().join("archive/data/499.csv#v4").exists());
}

#[tokio::test]
async fn dry_run_and_execute_plan_the_same_actions() {
    let dir = tempfile::tempdir().unwrap();
    let dry_store = versioned_bucket(30);
    dry_store.put_delete_marker("archive", "data/000.csv", "dm");
    let exec_store = versioned_bucket(30);
    exec_store.put_delete_marker("archive", "data/000.csv", "dm");

    let dry_config = config(dir.path(), OperationMode::DryRun);
    let target = inspect_bucket(&dry_store, "archive").await.unwrap();
    let dry = BucketRetirer::new(&dry_config)
        .retire(&dry_store, &target)
        .await
        .unwrap();
    assert!(dry_store.contains_bucket("archive"));
    assert!(std::fs::read_dir(dir.path()).unwrap().next().is_none());

    let exec_config = config(dir.path(), OperationMode::Execute);
    let exec = BucketRetirer::new(&exec_config)
        .retire(&exec_store, &target)
        .await
        .unwrap();

    assert_eq!(dry.actions(), exec.actions());
    assert!(!exec_store.contains_bucket("archive"));
}

#[tokio::test]
async fn retention_already_set_performs_no_export() {
    let dir = tempfile::tempdir().unwrap();
    let store = MemoryLogStore::default();
    store.create_group("/aws/lambda/api", Some(90));
    store.push_event("/aws/lambda/api", "stream", 1, "event");

    let exporter = SnapshotExporter::new(&config(dir.path(), OperationMode::Execute));
    let report = RetentionGuard::new(&store, &exporter, OperationMode::Execute)
        .guarded_set("/aws/lambda/api", 30, only_if_unset)
        .await
        .unwrap();

    assert!(matches!(report.outcome, GuardOutcome::Skipped { .. }));
    assert!(store.calls().is_empty());
    assert_eq!(store.retention("/aws/lambda/api"), Some(90));
    assert!(std::fs::read_dir(dir.path()).unwrap().next().is_none());
}

#[derive(Clone, Default)]
struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

impl CapturedLogs {
    fn text(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

impl Write for CapturedLogs {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[tokio::test]
async fn repeated_cursor_yields_only_pages_before_it() {
    let logs = CapturedLogs::default();
    let writer = logs.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::WARN)
        .with_ansi(false)
        .with_writer(move || writer.clone())
        .finish();
    let _guard = tracing::subscriber::set_default(subscriber);

    let mut script = vec![
        Page::new(vec!["a", "b"], Some("p2".to_string())),
        Page::new(vec!["c"], Some("p3".to_string())),
    ]
    .into_iter()
    .chain(std::iter::repeat(Page::new(vec!["z"], Some("p3".to_string()))));

    let items = Paginator::new("scripted", PaginationConfig::default(), |_cursor| {
        futures::future::ready(Ok(script.next().unwrap()))
    })
    .collect_all()
    .await
    .unwrap();

    assert_eq!(items, vec!["a", "b", "c"]);
    let text = logs.text();
    let stall_warnings: Vec<&str> = text
        .lines()
        .filter(|l| l.contains("WARN") && l.contains("Cursor has not advanced"))
        .collect();
    assert_eq!(stall_warnings.len(), 1, "{text}");
}
