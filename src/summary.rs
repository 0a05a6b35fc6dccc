//! Flat per-resource summary of a run and console renderings.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt::Write as _;
use std::io::Write;
use std::path::Path;
use uuid::Uuid;

use crate::error::{Result, RetireError};
use crate::types::{human_readable_size, LogGroupInfo};

/// One line of the JSON-lines summary file.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SummaryEntry {
    pub run_id: Uuid,
    pub resource_id: String,
    pub region: String,
    pub outcome: String,
    pub size: u64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct RunSummary {
    run_id: Uuid,
    entries: Vec<SummaryEntry>,
    attempted: usize,
    failed: usize,
}

impl Default for RunSummary {
    fn default() -> Self {
        Self::new()
    }
}

impl RunSummary {
    pub fn new() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            entries: Vec::new(),
            attempted: 0,
            failed: 0,
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Record a processed resource; `failures` counts its failed items.
    pub fn record(
        &mut self,
        resource_id: &str,
        region: &str,
        outcome: impl Into<String>,
        size: u64,
        failures: usize,
    ) {
        self.attempted += 1;
        self.failed += usize::from(failures > 0);
        self.entries.push(SummaryEntry {
            run_id: self.run_id,
            resource_id: resource_id.to_string(),
            region: region.to_string(),
            outcome: outcome.into(),
            size,
            timestamp: Utc::now(),
        });
    }

    pub fn record_error(&mut self, resource_id: &str, region: &str, error: &RetireError) {
        self.record(resource_id, region, format!("failed: {error}"), 0, 1);
    }

    pub fn entries(&self) -> &[SummaryEntry] {
        &self.entries
    }

    pub fn attempted(&self) -> usize {
        self.attempted
    }

    pub fn failed(&self) -> usize {
        self.failed
    }

    pub fn totals_line(&self) -> String {
        format!("attempted: {}, failed: {}", self.attempted, self.failed)
    }

    pub fn write_jsonl(&self, path: &Path) -> Result<()> {
        let file = std::fs::File::create(path).map_err(|e| RetireError::io(path, e))?;
        let mut out = std::io::BufWriter::new(file);
        for entry in &self.entries {
            serde_json::to_writer(&mut out, entry)
                .map_err(|e| RetireError::io(path, std::io::Error::other(e)))?;
            out.write_all(b"\n").map_err(|e| RetireError::io(path, e))?;
        }
        out.flush().map_err(|e| RetireError::io(path, e))
    }
}

/// Table of log groups with their size and retention.
pub fn render_log_groups(groups: &[LogGroupInfo]) -> String {
    let mut out = format!("{:<60} {:>12} {:>10}\n", "Log Group", "Size", "Retention");
    for g in groups {
        let retention = g
            .retention_days
            .map(|d| format!("{d} days"))
            .unwrap_or_else(|| "Never".to_string());
        let _ = writeln!(
            out,
            "{:<60} {:>12} {:>10}",
            g.name,
            human_readable_size(g.stored_bytes),
            retention
        );
        for (key, value) in &g.tags {
            let _ = writeln!(out, "{:<60} {:>12} {:>10}  Tag: {key}:{value}", "", "", "");
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProviderError;

    #[test]
    fn counts_resources_with_failures() {
        let mut summary = RunSummary::new();
        summary.record("b1", "us-east-1", "retired", 10, 0);
        summary.record("b2", "us-east-1", "held back", 3, 2);
        summary.record_error(
            "b3",
            "eu-west-1",
            &ProviderError::permanent("op", "AccessDenied", "no").into(),
        );
        assert_eq!(summary.totals_line(), "attempted: 3, failed: 2");
        assert!(summary.entries()[2].outcome.starts_with("failed: "));
    }

    #[test]
    fn writes_one_json_object_per_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("summary.jsonl");
        let mut summary = RunSummary::new();
        summary.record("g1", "us-east-1", "applied", 42, 0);
        summary.record("g2", "us-east-1", "skipped", 0, 0);
        summary.write_jsonl(&path).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<serde_json::Value> = text
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["resource_id"], "g1");
        assert_eq!(lines[0]["size"], 42);
        assert!(lines[1]["timestamp"].is_string());
        assert_eq!(lines[0]["run_id"], lines[1]["run_id"]);
        assert_eq!(lines[0]["run_id"], summary.run_id().to_string());
    }

    #[test]
    fn unset_retention_reads_never() {
        let table = render_log_groups(&[LogGroupInfo {
            name: "/aws/x".into(),
            stored_bytes: 2048,
            retention_days: None,
            tags: Vec::new(),
        }]);
        assert!(table.contains("Never"));
        assert!(table.contains("2.00 KB"));
        assert_eq!(table.lines().count(), 2);
    }

    #[test]
    fn tags_follow_their_group() {
        let table = render_log_groups(&[LogGroupInfo {
            name: "/aws/y".into(),
            stored_bytes: 0,
            retention_days: Some(7),
            tags: vec![("env".into(), "prod".into()), ("team".into(), "api".into())],
        }]);
        let lines: Vec<&str> = table.lines().collect();
        assert_eq!(lines.len(), 4);
        assert!(lines[1].starts_with("/aws/y"));
        assert!(lines[2].trim_start().starts_with("Tag: env:prod"));
        assert!(lines[3].ends_with("Tag: team:api"));
    }
}
