use anyhow::{bail, Context};
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, warn};

use aws_retire::config::{PaginationConfig, PoolConfig, StallPolicy, DEFAULT_REGION};
use aws_retire::confirm::confirm_on_terminal;
use aws_retire::logs_aux::{export_bucket_name, CloudWatchLogs, LOGS_REGIONS};
use aws_retire::orchestrator::{
    download_log_groups, list_log_groups, list_log_groups_by_region, list_tagged_log_groups,
    locate_bucket, retire_buckets, BucketRetirement, BucketRetirer,
};
use aws_retire::poller::{render_tasks, Poller};
use aws_retire::provider::{ExportRequest, ExportTaskSource, LogStore, ObjectStore, TimeWindow};
use aws_retire::retention::{always, only_if_unset, GuardOutcome, RetentionGuard};
use aws_retire::s3_aux::S3Store;
use aws_retire::snapshot::SnapshotExporter;
use aws_retire::summary::{render_log_groups, RunSummary};
use aws_retire::{logging, AwsContext, OperationMode, RetireError, RunConfig};

const FIVE_YEARS_SECS: i64 = 5 * 365 * 24 * 60 * 60;

#[derive(Parser)]
#[command(name = "aws-retire", version, about = "Snapshot, then retire S3 buckets and CloudWatch log groups")]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args)]
struct GlobalArgs {
    /// Show what would happen without changing or writing anything
    #[arg(long, global = true, env = "AWS_RETIRE_DRY_RUN")]
    dry_run: bool,

    /// Debug output on the console
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Skip the interactive confirmation
    #[arg(short, long, global = true)]
    yes: bool,

    /// AWS region
    #[arg(long, global = true, env = "AWS_REGION", default_value = DEFAULT_REGION)]
    region: String,

    /// AWS profile name
    #[arg(long, global = true, env = "AWS_PROFILE")]
    profile: Option<String>,

    /// Directory for the per-run log file
    #[arg(long, global = true, env = "AWS_RETIRE_LOG_DIR", default_value = ".")]
    log_dir: PathBuf,

    /// Directory that receives snapshots
    #[arg(long, global = true, env = "AWS_RETIRE_SNAPSHOT_ROOT", default_value = ".")]
    snapshot_root: PathBuf,

    /// Write a JSON-lines run summary to this file
    #[arg(long, global = true, env = "AWS_RETIRE_SUMMARY")]
    summary: Option<PathBuf>,

    /// Regions processed concurrently
    #[arg(long, global = true, env = "AWS_RETIRE_REGION_WORKERS", default_value_t = 5)]
    region_workers: usize,

    /// Buckets or log groups processed concurrently within a region
    #[arg(long, global = true, env = "AWS_RETIRE_RESOURCE_WORKERS", default_value_t = 2)]
    resource_workers: usize,

    /// Concurrent downloads within one snapshot
    #[arg(long, global = true, env = "AWS_RETIRE_WORKERS", default_value_t = 10)]
    workers: usize,

    /// Consecutive repeats of a pagination cursor that end a listing
    #[arg(long, global = true, env = "AWS_RETIRE_STALL_THRESHOLD", default_value_t = 3)]
    stall_threshold: u32,

    /// Treat a stalled listing as an error instead of its end
    #[arg(long, global = true)]
    fail_on_stall: bool,
}

impl GlobalArgs {
    fn run_config(&self) -> RunConfig {
        let mut config = RunConfig::new(OperationMode::from_dry_run(self.dry_run));
        config.pools = PoolConfig {
            regions: self.region_workers.max(1),
            resources: self.resource_workers.max(1),
            downloads: self.workers.max(1),
        };
        config.pagination = PaginationConfig {
            stall_threshold: self.stall_threshold.max(1),
            on_stall: if self.fail_on_stall {
                StallPolicy::Fail
            } else {
                StallPolicy::Finish
            },
        };
        config.snapshot_root = self.snapshot_root.clone();
        config.aws_profile = self.profile.clone();
        config
    }
}

#[derive(Subcommand)]
enum Command {
    /// S3 buckets
    #[command(subcommand)]
    Bucket(BucketCommand),

    /// CloudWatch log groups
    #[command(subcommand)]
    Logs(LogsCommand),
}

#[derive(Subcommand)]
enum BucketCommand {
    /// Download every object and version, then delete the bucket
    Retire {
        #[arg(required = true)]
        buckets: Vec<String>,

        /// Delete even when some downloads failed
        #[arg(long)]
        force: bool,
    },
}

#[derive(Subcommand)]
enum LogsCommand {
    /// List log groups with size and retention
    List {
        #[arg(long)]
        all_regions: bool,
    },
    /// Download the events of a log group (or ALL) to local files
    Download {
        log_group: String,
        #[arg(long, default_value_t = 365)]
        days: u32,
    },
    /// Export the full history, then set the retention period
    SetRetention {
        log_group: String,
        #[arg(default_value_t = 30)]
        days: i32,
        /// Only when no retention is set
        #[arg(long)]
        if_never: bool,
    },
    /// Delete a log group
    Delete { log_group: String },
    /// Export a log group to S3
    Export {
        log_group: String,
        /// Start, epoch seconds (default: five years ago)
        #[arg(long)]
        start: Option<i64>,
        /// End, epoch seconds (default: now)
        #[arg(long)]
        end: Option<i64>,
    },
    /// Show export tasks
    ListExports {
        /// Only PENDING and RUNNING tasks
        #[arg(long)]
        pending: bool,
        /// Poll until every task has finished
        #[arg(long)]
        wait: bool,
    },
}

impl Command {
    fn name(&self) -> &'static str {
        match self {
            Command::Bucket(BucketCommand::Retire { .. }) => "bucket-retire",
            Command::Logs(LogsCommand::List { .. }) => "logs-list",
            Command::Logs(LogsCommand::Download { .. }) => "logs-download",
            Command::Logs(LogsCommand::SetRetention { .. }) => "logs-set-retention",
            Command::Logs(LogsCommand::Delete { .. }) => "logs-delete",
            Command::Logs(LogsCommand::Export { .. }) => "logs-export",
            Command::Logs(LogsCommand::ListExports { .. }) => "logs-list-exports",
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let config = cli.global.run_config();

    let log_path = match logging::init(cli.command.name(), config.mode, &cli.global.log_dir, cli.global.verbose) {
        Ok(path) => path,
        Err(e) => {
            eprintln!("Error: cannot set up logging: {e}");
            return ExitCode::FAILURE;
        }
    };

    let mut summary = RunSummary::new();
    info!(run_id = %summary.run_id(), command = cli.command.name(), mode = config.mode.as_str(), "Starting");

    let outcome = run(&cli, &config, &mut summary).await;

    if let Some(path) = &cli.global.summary {
        match summary.write_jsonl(path) {
            Ok(()) => info!(path = %path.display(), "Summary written"),
            Err(e) => error!(error = %e, "Failed to write summary"),
        }
    }
    if !config.is_dry_run() && summary.attempted() > 0 {
        println!("{}", summary.totals_line());
    }

    let code = match outcome {
        Ok(()) if !config.is_dry_run() && summary.failed() > 0 => ExitCode::FAILURE,
        Ok(()) => {
            if config.is_dry_run() {
                println!("Dry-run completed. No changes were made.");
            }
            ExitCode::SUCCESS
        }
        Err(e) if matches!(e.downcast_ref::<RetireError>(), Some(RetireError::Aborted)) => {
            info!("Operation aborted by user");
            println!("Aborted by user.");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %format!("{e:#}"), "Run failed");
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    };
    println!("Logs can be found in {}", log_path.display());
    code
}

async fn run(cli: &Cli, config: &RunConfig, summary: &mut RunSummary) -> anyhow::Result<()> {
    let global = &cli.global;
    let ctx = AwsContext::new(&global.region, &config.timeouts, global.profile.as_deref()).await;
    info!(region = %ctx.region(), "AWS context loaded");

    match &cli.command {
        Command::Bucket(BucketCommand::Retire { buckets, force }) => {
            retire(&ctx, config, buckets, *force, global.yes, summary).await
        }
        Command::Logs(cmd) => logs(&ctx, config, cmd, global.yes, summary).await,
    }
}

async fn retire(
    ctx: &AwsContext,
    config: &RunConfig,
    buckets: &[String],
    force: bool,
    assume_yes: bool,
    summary: &mut RunSummary,
) -> anyhow::Result<()> {
    let home = S3Store::from_context(ctx);
    let store_for = |region: &str| -> Arc<dyn ObjectStore> {
        Arc::new(S3Store::from_context(&ctx.for_region(region)))
    };
    let mut targets = Vec::with_capacity(buckets.len());
    for bucket in buckets {
        let target = match locate_bucket(&home, bucket, store_for).await {
            Ok(target) => target,
            Err(err) if err.is_fatal() => return Err(err.into()),
            Err(err) => {
                error!(bucket = %bucket, error = %err, "Could not inspect bucket");
                summary.record_error(bucket, ctx.region(), &err);
                continue;
            }
        };
        println!("Bucket: {} ({})", target.name, target.region);
        if target.tags.is_empty() {
            println!("  No tags found for the bucket.");
        }
        for (key, value) in &target.tags {
            println!("  {key}: {value}");
        }
        targets.push(target);
    }

    if targets.is_empty() {
        warn!("No bucket left to retire");
        return Ok(());
    }
    if !config.is_dry_run() {
        let names: Vec<&str> = targets.iter().map(|t| t.name.as_str()).collect();
        confirm_on_terminal(
            &format!(
                "WARNING: You are about to PERMANENTLY delete {} and all of its objects and versions.",
                names.join(", ")
            ),
            assume_yes,
        )?;
    }

    let regions: Vec<(String, String)> = targets
        .iter()
        .map(|t| (t.name.clone(), t.region.clone()))
        .collect();
    let retirer = BucketRetirer::new(config).force(force);
    let out = retire_buckets(targets, config, retirer, store_for).await;

    for (_, r) in &out.succeeded {
        summary.record(&r.bucket, &r.region, retirement_outcome(r, config.mode), r.snapshot.bytes(), r.failed());
    }
    for failure in &out.failed {
        let region = regions
            .iter()
            .find(|(name, _)| *name == failure.key)
            .map(|(_, region)| region.as_str())
            .unwrap_or(failure.key.as_str());
        summary.record_error(&failure.key, region, &failure.error);
    }
    if let Some(fatal) = out.fatal() {
        bail!("{}: {}", fatal.key, fatal.error);
    }
    Ok(())
}

fn retirement_outcome(r: &BucketRetirement, mode: OperationMode) -> String {
    if let Some(reason) = &r.held_back {
        return format!("held back: {reason}");
    }
    match &r.destroy {
        _ if mode.is_dry_run() => "planned".to_string(),
        Some(d) if d.collection_deleted => "retired".to_string(),
        Some(d) if d.fatal.is_some() => "destroy stopped".to_string(),
        _ => "partially retired".to_string(),
    }
}

async fn logs(
    ctx: &AwsContext,
    config: &RunConfig,
    cmd: &LogsCommand,
    assume_yes: bool,
    summary: &mut RunSummary,
) -> anyhow::Result<()> {
    let logs = Arc::new(CloudWatchLogs::from_context(ctx));
    let region = ctx.region().to_string();

    match cmd {
        LogsCommand::List { all_regions: false } => {
            let groups = list_tagged_log_groups(logs.as_ref(), config.pagination).await?;
            print!("{}", render_log_groups(&groups));
        }
        LogsCommand::List { all_regions: true } => {
            let regions = LOGS_REGIONS.iter().map(|r| r.to_string()).collect();
            let out = list_log_groups_by_region(regions, config.pools.regions, config.pagination, |r| -> Arc<dyn LogStore> {
                Arc::new(CloudWatchLogs::from_context(&ctx.for_region(r)))
            })
            .await;
            for (region, groups) in &out.succeeded {
                println!("Region: {region}");
                print!("{}", render_log_groups(groups));
                println!();
            }
            for failure in &out.failed {
                warn!(region = %failure.key, error = %failure.error, "Region skipped");
            }
        }
        LogsCommand::Download { log_group, days } => {
            let groups = if log_group == "ALL" {
                list_log_groups(logs.as_ref(), config.pagination)
                    .await?
                    .into_iter()
                    .map(|g| g.name)
                    .collect()
            } else {
                require_group(logs.as_ref(), log_group).await?;
                vec![log_group.clone()]
            };
            let window = TimeWindow::lookback(Utc::now().timestamp_millis(), Some(*days));
            let out = download_log_groups(
                logs.clone(),
                groups,
                SnapshotExporter::new(config),
                window,
                config.pools.resources,
            )
            .await;
            for (group, report) in &out.succeeded {
                let outcome = if config.is_dry_run() { "planned" } else { "downloaded" };
                summary.record(group, &region, outcome, report.bytes(), report.failed());
            }
            for failure in &out.failed {
                summary.record_error(&failure.key, &region, &failure.error);
            }
        }
        LogsCommand::SetRetention {
            log_group,
            days,
            if_never,
        } => {
            if !config.is_dry_run() {
                confirm_on_terminal(
                    &format!("WARNING: Events of {log_group} older than {days} days will be deleted after the export."),
                    assume_yes,
                )?;
            }
            let exporter = SnapshotExporter::new(config);
            let predicate: fn(Option<i32>) -> bool = if *if_never { only_if_unset } else { always };
            let report = RetentionGuard::new(logs.as_ref(), &exporter, config.mode)
                .guarded_set(log_group, *days, predicate)
                .await?;
            println!("Retention of {log_group}: {}", report.outcome);
            let (bytes, failed) = report
                .export
                .as_ref()
                .map(|e| (e.bytes(), e.failed()))
                .unwrap_or_default();
            let incomplete = matches!(&report.outcome, GuardOutcome::Skipped { reason } if reason == "export incomplete");
            summary.record(log_group, &region, report.outcome.to_string(), bytes, failed + usize::from(incomplete));
        }
        LogsCommand::Delete { log_group } => {
            require_group(logs.as_ref(), log_group).await?;
            if config.is_dry_run() {
                println!("Would delete log group {log_group}");
                summary.record(log_group, &region, "planned", 0, 0);
                return Ok(());
            }
            confirm_on_terminal(
                &format!("WARNING: You are about to PERMANENTLY delete log group {log_group}."),
                assume_yes,
            )?;
            match logs.delete_log_group(log_group).await {
                Ok(()) => summary.record(log_group, &region, "deleted", 0, 0),
                Err(e) => {
                    let e = RetireError::from(e);
                    summary.record_error(log_group, &region, &e);
                    return Err(e.into());
                }
            }
        }
        LogsCommand::Export { log_group, start, end } => {
            let now = Utc::now().timestamp();
            let start = start.unwrap_or(now - FIVE_YEARS_SECS);
            let end = end.unwrap_or(now);
            if start >= end {
                return Err(RetireError::Validation(format!("start {start} is not before end {end}")).into());
            }
            require_group(logs.as_ref(), log_group).await?;
            let bucket = export_bucket_name(ctx).await.context("resolving the export bucket")?;
            let request = ExportRequest::new(log_group, start, end, &bucket);
            if config.is_dry_run() {
                println!(
                    "Would export {log_group} to s3://{bucket}/{} as task {}",
                    request.destination_prefix, request.task_name
                );
                summary.record(log_group, &region, "planned", 0, 0);
                return Ok(());
            }
            let s3 = S3Store::from_context(ctx);
            s3.ensure_bucket(&bucket).await?;
            s3.allow_log_exports(&bucket).await?;
            let task_id = logs.submit_export(&request).await?;
            println!("Export task created: {task_id}");
            summary.record(log_group, &region, format!("export task {task_id}"), 0, 0);
        }
        LogsCommand::ListExports { pending, wait } => {
            let poller = Poller::new(logs.as_ref(), config.polling, config.pagination).pending_only(*pending);
            if *wait {
                let report = poller
                    .wait_until_terminal(|tasks| {
                        print!("{}", render_tasks(tasks));
                        if let Some(wait) = tasks.iter().find_map(|t| t.next_poll_wait) {
                            println!("Waiting {} seconds before next poll...", wait.as_secs());
                        }
                    })
                    .await?;
                if report.timed_out {
                    println!("Stopped waiting after {} polls; tasks are still running.", report.polls);
                }
            } else {
                print!("{}", render_tasks(&poller.poll_once().await?));
            }
        }
    }
    Ok(())
}

async fn require_group(logs: &dyn LogStore, log_group: &str) -> Result<(), RetireError> {
    match logs.describe_log_group(log_group).await? {
        Some(_) => Ok(()),
        None => Err(RetireError::Validation(format!("log group {log_group} does not exist"))),
    }
}
