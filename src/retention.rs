//! Retention changes that never run ahead of a full-history export.

use chrono::Utc;
use std::fmt;
use tracing::{info, warn};

use crate::error::{Result, RetireError};
use crate::provider::LogStore;
use crate::snapshot::{SnapshotExporter, SnapshotReport};
use crate::types::{Action, OperationMode};

/// Retention periods CloudWatch Logs accepts, in days.
pub const RETENTION_DAYS: &[i32] = &[
    1, 3, 5, 7, 14, 30, 60, 90, 120, 150, 180, 365, 400, 545, 731, 1096, 1827, 2192, 2557, 2922,
    3288, 3653,
];

/// Apply only when the group keeps its events forever.
pub fn only_if_unset(current: Option<i32>) -> bool {
    current.is_none()
}

pub fn always(_current: Option<i32>) -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardOutcome {
    Applied,
    /// Dry run: export planned and the change would have been made.
    WouldApply,
    Skipped { reason: String },
}

impl fmt::Display for GuardOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GuardOutcome::Applied => f.write_str("applied"),
            GuardOutcome::WouldApply => f.write_str("would apply"),
            GuardOutcome::Skipped { reason } => write!(f, "skipped ({reason})"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct GuardReport {
    pub log_group: String,
    pub previous_days: Option<i32>,
    pub requested_days: i32,
    pub outcome: GuardOutcome,
    /// Present whenever the predicate held
    pub export: Option<SnapshotReport>,
    pub actions: Vec<Action>,
}

pub struct RetentionGuard<'a> {
    store: &'a dyn LogStore,
    exporter: &'a SnapshotExporter,
    mode: OperationMode,
}

impl<'a> RetentionGuard<'a> {
    pub fn new(store: &'a dyn LogStore, exporter: &'a SnapshotExporter, mode: OperationMode) -> Self {
        Self {
            store,
            exporter,
            mode,
        }
    }

    /// Set the retention of `log_group` to `days` if `predicate` accepts the
    /// current retention. The whole history is exported first; the policy is
    /// only written once that export finished without failures.
    pub async fn guarded_set(
        &self,
        log_group: &str,
        days: i32,
        predicate: impl Fn(Option<i32>) -> bool,
    ) -> Result<GuardReport> {
        if !RETENTION_DAYS.contains(&days) {
            return Err(RetireError::Validation(format!(
                "{days} is not a valid retention period, expected one of {RETENTION_DAYS:?}"
            )));
        }
        let current = self
            .store
            .describe_log_group(log_group)
            .await?
            .ok_or_else(|| RetireError::Validation(format!("log group {log_group} does not exist")))?;

        let mut report = GuardReport {
            log_group: log_group.to_string(),
            previous_days: current.retention_days,
            requested_days: days,
            outcome: GuardOutcome::Applied,
            export: None,
            actions: Vec::new(),
        };

        if !predicate(current.retention_days) {
            let reason = match current.retention_days {
                Some(d) => format!("retention already set to {d} days"),
                None => "predicate rejected current retention".to_string(),
            };
            info!(log_group = %log_group, %reason, "Leaving retention unchanged");
            report.outcome = GuardOutcome::Skipped { reason };
            return Ok(report);
        }

        let export = self
            .exporter
            .export_log_history(self.store, log_group, Utc::now().timestamp_millis())
            .await?;
        report.actions.extend(export.actions.iter().cloned());
        report.actions.push(Action::SetRetention {
            log_group: log_group.to_string(),
            days,
        });
        let complete = export.is_complete();
        report.export = Some(export);

        if !complete {
            warn!(log_group = %log_group, "Export incomplete, retention left unchanged");
            report.outcome = GuardOutcome::Skipped {
                reason: "export incomplete".to_string(),
            };
            return Ok(report);
        }

        if self.mode.is_dry_run() {
            println!("Would set retention of {log_group} to {days} days");
            report.outcome = GuardOutcome::WouldApply;
            return Ok(report);
        }

        self.store.put_retention(log_group, days).await?;
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RunConfig;
    use crate::memory::{Call, MemoryLogStore};

    fn exporter(root: &std::path::Path, mode: OperationMode) -> SnapshotExporter {
        let mut config = RunConfig::new(mode);
        config.snapshot_root = root.to_path_buf();
        SnapshotExporter::new(&config)
    }

    #[tokio::test]
    async fn already_set_is_skipped_without_export() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryLogStore::default();
        store.create_group("g", Some(14));
        store.push_event("g", "s", 1, "hello");

        let exporter = exporter(dir.path(), OperationMode::Execute);
        let report = RetentionGuard::new(&store, &exporter, OperationMode::Execute)
            .guarded_set("g", 30, only_if_unset)
            .await
            .unwrap();

        assert!(matches!(report.outcome, GuardOutcome::Skipped { .. }));
        assert!(report.export.is_none());
        assert!(store.calls().is_empty());
        assert_eq!(store.retention("g"), Some(14));
    }

    #[tokio::test]
    async fn exports_before_applying() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryLogStore::default();
        store.create_group("g", None);
        store.push_event("g", "s", 1, "hello");

        let exporter = exporter(dir.path(), OperationMode::Execute);
        let report = RetentionGuard::new(&store, &exporter, OperationMode::Execute)
            .guarded_set("g", 30, only_if_unset)
            .await
            .unwrap();

        assert_eq!(report.outcome, GuardOutcome::Applied);
        assert_eq!(store.retention("g"), Some(30));
        let calls = store.calls();
        let read = calls
            .iter()
            .position(|c| matches!(c, Call::LogEvents { .. }))
            .unwrap();
        let write = calls
            .iter()
            .position(|c| matches!(c, Call::PutRetention { .. }))
            .unwrap();
        assert!(read < write);
        assert!(dir.path().join("logs_g/s.log").exists());
    }

    #[tokio::test]
    async fn earlier_partial_download_is_replaced_by_full_history() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryLogStore::default();
        store.create_group("g", None);
        store.push_event("g", "s", 1, "old-event");
        store.push_event("g", "s", 2, "new-event");
        std::fs::create_dir_all(dir.path().join("logs_g")).unwrap();
        std::fs::write(dir.path().join("logs_g/s.log"), "[1970-01-01T00:00:00.002Z] new-event\n").unwrap();

        let exporter = exporter(dir.path(), OperationMode::Execute);
        let report = RetentionGuard::new(&store, &exporter, OperationMode::Execute)
            .guarded_set("g", 1, always)
            .await
            .unwrap();

        assert_eq!(report.outcome, GuardOutcome::Applied);
        assert_eq!(report.export.as_ref().map(|e| e.downloaded()), Some(1));
        assert!(store.calls().iter().any(|c| matches!(c, Call::LogEvents { .. })));
        let text = std::fs::read_to_string(dir.path().join("logs_g/s.log")).unwrap();
        assert!(text.contains("old-event"));
        assert!(text.contains("new-event"));
        assert_eq!(store.retention("g"), Some(1));
    }

    #[tokio::test]
    async fn failed_export_blocks_the_change() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryLogStore::default();
        store.create_group("g", None);
        store.push_event("g", "bad", 1, "x");
        store.fail_stream("bad");

        let exporter = exporter(dir.path(), OperationMode::Execute);
        let report = RetentionGuard::new(&store, &exporter, OperationMode::Execute)
            .guarded_set("g", 7, always)
            .await
            .unwrap();

        assert_eq!(
            report.outcome,
            GuardOutcome::Skipped {
                reason: "export incomplete".into()
            }
        );
        assert_eq!(store.retention("g"), None);
    }

    #[tokio::test]
    async fn dry_run_plans_without_writing() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryLogStore::default();
        store.create_group("g", None);
        store.push_event("g", "s", 1, "x");

        let exporter = exporter(dir.path(), OperationMode::DryRun);
        let report = RetentionGuard::new(&store, &exporter, OperationMode::DryRun)
            .guarded_set("g", 30, always)
            .await
            .unwrap();

        assert_eq!(report.outcome, GuardOutcome::WouldApply);
        assert_eq!(store.retention("g"), None);
        assert!(matches!(report.actions.last(), Some(Action::SetRetention { days: 30, .. })));
        assert!(!dir.path().join("logs_g").exists());
    }

    #[tokio::test]
    async fn rejects_unknown_group_and_invalid_days() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryLogStore::default();
        store.create_group("g", None);
        let exporter = exporter(dir.path(), OperationMode::Execute);
        let guard = RetentionGuard::new(&store, &exporter, OperationMode::Execute);

        assert!(guard.guarded_set("g", 31, always).await.unwrap_err().is_fatal());
        assert!(guard.guarded_set("missing", 30, always).await.unwrap_err().is_fatal());
    }
}
