//! Observation of provider-owned export tasks with exponential backoff.
//!
//! Every poll re-lists the complete task set, so tasks may appear or vanish
//! between polls. The poller never creates or cancels a task.

use backon::{BackoffBuilder, ExponentialBackoff, ExponentialBuilder};
use chrono::{DateTime, Utc};
use std::fmt::Write as _;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::{PaginationConfig, PollConfig};
use crate::error::Result;
use crate::paginate::Paginator;
use crate::provider::ExportTaskSource;
use crate::types::{AsyncTask, TaskState};

#[derive(Debug, Clone, Default)]
pub struct PollReport {
    /// Task set seen by the final poll
    pub tasks: Vec<AsyncTask>,
    pub polls: u32,
    /// Sleeps between polls, in order
    pub waits: Vec<Duration>,
    /// Deadline reached while tasks were still in flight
    pub timed_out: bool,
}

pub struct Poller<'a> {
    source: &'a dyn ExportTaskSource,
    config: PollConfig,
    pagination: PaginationConfig,
    pending_only: bool,
}

impl<'a> Poller<'a> {
    pub fn new(source: &'a dyn ExportTaskSource, config: PollConfig, pagination: PaginationConfig) -> Self {
        Self {
            source,
            config,
            pagination,
            pending_only: false,
        }
    }

    /// Only keep tasks that are still PENDING or RUNNING.
    pub fn pending_only(mut self, yes: bool) -> Self {
        self.pending_only = yes;
        self
    }

    fn max_wait(&self) -> Duration {
        self.config.max_wait.max(self.config.base_interval)
    }

    /// Waits between polls: `base * 2^(n-1)` after poll `n`, capped at
    /// `max_wait`, without jitter.
    pub fn delays(&self) -> ExponentialBackoff {
        ExponentialBuilder::default()
            .with_min_delay(self.config.base_interval)
            .with_max_delay(self.max_wait())
            .with_factor(2.0)
            .without_max_times()
            .build()
    }

    /// One status fetch of the whole task set.
    pub async fn poll_once(&self) -> Result<Vec<AsyncTask>> {
        let source = self.source;
        let tasks = Paginator::new("export tasks", self.pagination, |cursor| {
            source.list_export_tasks(cursor)
        })
        .collect_all()
        .await?;
        Ok(if self.pending_only {
            tasks.into_iter().filter(|t| !t.state.is_terminal()).collect()
        } else {
            tasks
        })
    }

    /// Poll until no task is in flight or the deadline passes. `on_poll` sees
    /// every observed task set, with `next_poll_wait` filled in for tasks that
    /// are still in flight.
    pub async fn wait_until_terminal(&self, mut on_poll: impl FnMut(&[AsyncTask])) -> Result<PollReport> {
        let started = Instant::now();
        let mut report = PollReport::default();
        let mut delays = self.delays();

        loop {
            let mut tasks = self.poll_once().await?;
            report.polls += 1;
            let in_flight = tasks.iter().filter(|t| !t.state.is_terminal()).count();
            let wait = delays.next().unwrap_or_else(|| self.max_wait());
            if in_flight > 0 {
                for task in tasks.iter_mut().filter(|t| !t.state.is_terminal()) {
                    task.next_poll_wait = Some(wait);
                }
            }
            on_poll(&tasks);
            report.tasks = tasks;

            if in_flight == 0 {
                info!(polls = report.polls, "All export tasks finished");
                return Ok(report);
            }
            if started.elapsed() + wait > self.config.deadline {
                warn!(
                    polls = report.polls,
                    in_flight,
                    deadline_secs = self.config.deadline.as_secs(),
                    "Giving up on export tasks"
                );
                report.timed_out = true;
                return Ok(report);
            }

            debug!(in_flight, wait_secs = wait.as_secs(), "Export tasks still running");
            tokio::time::sleep(wait).await;
            report.waits.push(wait);
        }
    }
}

fn format_ms(ms: Option<i64>) -> String {
    ms.and_then(DateTime::<Utc>::from_timestamp_millis)
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "N/A".to_string())
}

/// Status table of export tasks, one line per task.
pub fn render_tasks(tasks: &[AsyncTask]) -> String {
    let mut out = format!(
        "{:<38} {:<50} {:<10} {:<40} {:<20} {:<20}\n",
        "Task ID", "Task Name", "Status", "Destination", "Created", "Completed"
    );
    for t in tasks {
        let destination = match (&t.destination, &t.destination_prefix) {
            (Some(bucket), Some(prefix)) => format!("{bucket}/{prefix}"),
            (Some(bucket), None) => bucket.clone(),
            _ => "N/A".to_string(),
        };
        let _ = writeln!(
            out,
            "{:<38} {:<50} {:<10} {:<40} {:<20} {:<20}",
            t.id,
            t.name,
            t.state.as_str(),
            destination,
            format_ms(t.created_at_ms),
            format_ms(t.completed_at_ms)
        );
    }
    out
}

/// True while some task has not reached COMPLETED or FAILED.
pub fn any_in_flight(tasks: &[AsyncTask]) -> bool {
    tasks.iter().any(|t| matches!(t.state, TaskState::Pending | TaskState::Running))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryTaskSource;

    fn task(id: &str, state: TaskState) -> AsyncTask {
        AsyncTask::new(id, format!("export-{id}"), state)
    }

    fn config(max_wait: u64, deadline: u64) -> PollConfig {
        PollConfig {
            base_interval: Duration::from_secs(60),
            max_wait: Duration::from_secs(max_wait),
            deadline: Duration::from_secs(deadline),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn wait_doubles_while_running() {
        let source = MemoryTaskSource::scripted(vec![
            vec![task("a", TaskState::Running)],
            vec![task("a", TaskState::Running)],
            vec![task("a", TaskState::Running)],
            vec![task("a", TaskState::Completed)],
        ]);
        let poller = Poller::new(&source, config(3600, 86_400), PaginationConfig::default());
        let mut seen = Vec::new();
        let started = Instant::now();
        let report = poller
            .wait_until_terminal(|tasks| seen.push(tasks[0].next_poll_wait))
            .await
            .unwrap();

        let secs: Vec<u64> = report.waits.iter().map(Duration::as_secs).collect();
        assert_eq!(secs, vec![60, 120, 240]);
        assert_eq!(report.polls, 4);
        assert!(!report.timed_out);
        assert_eq!(report.tasks[0].state, TaskState::Completed);
        assert_eq!(seen.last(), Some(&None));
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(420) && elapsed < Duration::from_secs(421));
    }

    #[tokio::test(start_paused = true)]
    async fn wait_is_capped_and_never_decreases() {
        let source = MemoryTaskSource::scripted(vec![
            vec![task("a", TaskState::Running)],
            vec![task("a", TaskState::Running)],
            vec![task("a", TaskState::Running)],
            vec![task("a", TaskState::Running)],
            vec![task("a", TaskState::Failed)],
        ]);
        let poller = Poller::new(&source, config(100, 86_400), PaginationConfig::default());
        let report = poller.wait_until_terminal(|_| {}).await.unwrap();
        let secs: Vec<u64> = report.waits.iter().map(Duration::as_secs).collect();
        assert_eq!(secs, vec![60, 100, 100, 100]);
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_ends_waiting() {
        let source = MemoryTaskSource::scripted(vec![vec![task("a", TaskState::Running)]]);
        let poller = Poller::new(&source, config(3600, 300), PaginationConfig::default());
        let report = poller.wait_until_terminal(|_| {}).await.unwrap();
        assert!(report.timed_out);
        let secs: Vec<u64> = report.waits.iter().map(Duration::as_secs).collect();
        assert_eq!(secs, vec![60, 120]);
        assert_eq!(report.polls, 3);
    }

    #[test]
    fn delay_sequence_starts_at_base_and_doubles() {
        let source = MemoryTaskSource::scripted(vec![vec![]]);
        let poller = Poller::new(&source, config(1800, 86_400), PaginationConfig::default());
        let secs: Vec<u64> = poller.delays().take(7).map(|d| d.as_secs()).collect();
        assert_eq!(secs, vec![60, 120, 240, 480, 960, 1800, 1800]);
    }

    #[tokio::test]
    async fn single_pass_can_filter_finished_tasks() {
        let snapshot = vec![
            task("a", TaskState::Completed),
            task("b", TaskState::Pending),
            task("c", TaskState::Running),
            task("d", TaskState::Failed),
        ];
        let source = MemoryTaskSource::scripted(vec![snapshot]);
        let all = Poller::new(&source, PollConfig::default(), PaginationConfig::default())
            .poll_once()
            .await
            .unwrap();
        assert_eq!(all.len(), 4);
        assert!(any_in_flight(&all));

        let pending = Poller::new(&source, PollConfig::default(), PaginationConfig::default())
            .pending_only(true)
            .poll_once()
            .await
            .unwrap();
        let ids: Vec<&str> = pending.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c"]);
    }

    #[test]
    fn table_lists_every_task() {
        let mut t = task("id-1", TaskState::Completed);
        t.destination = Some("bucket".into());
        t.destination_prefix = Some("p/1-2".into());
        t.created_at_ms = Some(0);
        let table = render_tasks(&[t]);
        assert_eq!(table.lines().count(), 2);
        assert!(table.contains("bucket/p/1-2"));
        assert!(table.contains("1970-01-01 00:00:00"));
        assert!(table.contains("COMPLETED"));
    }
}
