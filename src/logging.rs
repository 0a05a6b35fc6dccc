//! Console and per-run log file set up on one tracing registry.

use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing_subscriber::filter::{Directive, EnvFilter};
use tracing_subscriber::prelude::*;

use crate::types::OperationMode;

/// `<command>_<dry-run|execute>_<UTC timestamp>.log`
pub fn log_file_name(command: &str, mode: OperationMode, now: DateTime<Utc>) -> String {
    format!(
        "{}_{}_{}.log",
        command.replace(' ', "-"),
        mode.as_str(),
        now.format("%Y%m%dT%H%M%SZ")
    )
}

/// SDK and transport crates that only log at warn and above.
const QUIET_TARGETS: &[&str] = &[
    "aws_config=warn",
    "aws_smithy_runtime=warn",
    "aws_sdk_s3=warn",
    "aws_sdk_cloudwatchlogs=warn",
    "aws_sdk_sts=warn",
    "hyper=warn",
];

fn filter(level: &str) -> EnvFilter {
    let base = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    QUIET_TARGETS
        .iter()
        .filter_map(|d| d.parse::<Directive>().ok())
        .fold(base, EnvFilter::add_directive)
}

/// Install the global subscriber and return the path of the run log.
///
/// The console honours `RUST_LOG` (default `info`, `debug` when verbose); the
/// file always records debug detail without ANSI colours.
pub fn init(command: &str, mode: OperationMode, dir: &Path, verbose: bool) -> std::io::Result<PathBuf> {
    std::fs::create_dir_all(dir)?;
    let path = dir.join(log_file_name(command, mode, Utc::now()));
    let file = std::fs::File::create(&path)?;

    let console = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_filter(filter(if verbose { "debug" } else { "info" }));
    let logfile = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(Mutex::new(file))
        .with_filter(filter("debug"));

    tracing_subscriber::registry()
        .with(console)
        .with(logfile)
        .try_init()
        .map_err(std::io::Error::other)?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn file_name_carries_command_mode_and_time() {
        let now = Utc.with_ymd_and_hms(2024, 3, 9, 7, 5, 1).unwrap();
        assert_eq!(
            log_file_name("bucket retire", OperationMode::DryRun, now),
            "bucket-retire_dry-run_20240309T070501Z.log"
        );
        assert_eq!(
            log_file_name("logs", OperationMode::Execute, now),
            "logs_execute_20240309T070501Z.log"
        );
    }

    #[test]
    fn every_sdk_in_use_is_quieted() {
        for sdk in ["aws_sdk_s3", "aws_sdk_cloudwatchlogs", "aws_sdk_sts"] {
            assert!(QUIET_TARGETS.contains(&format!("{sdk}=warn").as_str()));
        }
        for target in QUIET_TARGETS {
            assert!(target.parse::<Directive>().is_ok(), "{target}");
        }
        let rendered = filter("info").to_string().to_lowercase();
        assert!(rendered.contains("aws_sdk_cloudwatchlogs=warn"));
    }
}
