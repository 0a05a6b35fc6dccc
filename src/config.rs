//! Run configuration
//!
//! Composed of focused sub-configs; the CLI builds one `RunConfig` per run
//! and every component receives the parts it needs by value.

use crate::types::OperationMode;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_REGION: &str = "us-east-1";

/// Widths of the two fan-out levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolConfig {
    /// Concurrent regions
    pub regions: usize,
    /// Concurrent resources (buckets, log groups) inside one region
    pub resources: usize,
    /// Concurrent downloads inside one export
    pub downloads: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            regions: 5,
            resources: 2,
            downloads: 10,
        }
    }
}

/// What an enumeration does once the cursor stops advancing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StallPolicy {
    /// Log a warning and end as if the listing were exhausted.
    #[default]
    Finish,
    /// Raise `RetireError::PaginationStall`.
    Fail,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PaginationConfig {
    /// Consecutive repeats of the same cursor that end an enumeration
    pub stall_threshold: u32,
    pub on_stall: StallPolicy,
}

impl Default for PaginationConfig {
    fn default() -> Self {
        Self {
            stall_threshold: 3,
            on_stall: StallPolicy::Finish,
        }
    }
}

/// Backoff for the export task poller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollConfig {
    /// First wait; doubled after every poll that still sees a running task
    pub base_interval: Duration,
    /// Cap for a single wait
    pub max_wait: Duration,
    /// Give up waiting after this long
    pub deadline: Duration,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            base_interval: Duration::from_secs(60),
            max_wait: Duration::from_secs(30 * 60),
            deadline: Duration::from_secs(24 * 60 * 60),
        }
    }
}

/// Per-call network timeouts handed to the SDK.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutConfig {
    pub connect: Duration,
    pub read: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(10),
            read: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunConfig {
    pub mode: OperationMode,
    pub pools: PoolConfig,
    pub pagination: PaginationConfig,
    pub polling: PollConfig,
    pub timeouts: TimeoutConfig,
    /// Directory that receives all snapshot files
    pub snapshot_root: PathBuf,
    /// AWS profile name (overrides default credential resolution)
    pub aws_profile: Option<String>,
}

impl RunConfig {
    pub fn new(mode: OperationMode) -> Self {
        Self {
            mode,
            pools: PoolConfig::default(),
            pagination: PaginationConfig::default(),
            polling: PollConfig::default(),
            timeouts: TimeoutConfig::default(),
            snapshot_root: PathBuf::from("."),
            aws_profile: None,
        }
    }

    pub fn is_dry_run(&self) -> bool {
        self.mode.is_dry_run()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = RunConfig::new(OperationMode::DryRun);
        assert_eq!(cfg.pools.regions, 5);
        assert_eq!(cfg.pools.downloads, 10);
        assert_eq!(cfg.pagination.stall_threshold, 3);
        assert_eq!(cfg.pagination.on_stall, StallPolicy::Finish);
        assert_eq!(cfg.polling.base_interval, Duration::from_secs(60));
        assert!(cfg.polling.max_wait >= cfg.polling.base_interval);
        assert_eq!(cfg.timeouts.connect, Duration::from_secs(10));
        assert!(cfg.is_dry_run());
    }
}
