mod aggregate;
mod candidates;
mod collector;
mod config;
mod monitor;
mod notify;
mod schedulers;
mod sync;

use crate::{
    aggregate::{AggregateError, Aggregator, RunSummary},
    collector::CollectError,
    config::{ConfigErrors, FitterConfig},
    monitor::Monitor,
    notify::Notifier,
    schedulers::Schedulers,
    sync::SyncClient,
};
use chrono::Utc;
use clap::Parser;
use std::{path::PathBuf, process::ExitCode};
use thiserror::Error;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "fitter-runner",
    about = "Submit and track lightcurve fitting jobs for newly observed candidates"
)]
struct Args {
    /// Path to the run configuration
    #[arg(short, long)]
    config: PathBuf,

    /// Override the staging directory from the config
    #[arg(long)]
    staging_dir: Option<PathBuf>,

    /// Fit only this subset of the configured models, comma separated
    #[arg(long, value_delimiter = ',')]
    models: Vec<String>,

    /// Wall-clock budget for outstanding jobs, in seconds
    #[arg(short, long)]
    timeout: Option<u64>,

    /// Seconds between completion marker scans
    #[arg(long)]
    poll_interval: Option<u64>,

    /// Re-enumerate every pair, ignoring markers and existing fits
    #[arg(long)]
    force: bool,

    /// Post the run summary to the configured webhook
    #[arg(long)]
    notify: bool,

    /// Enumerate and log work items without submitting anything
    #[arg(long)]
    dry_run: bool,
}

/// How a run ended. A dry run stops after enumeration on purpose and is
/// reported as such, not as an empty run.
#[derive(Debug)]
enum RunOutcome {
    Completed(RunSummary),
    NothingToDo,
    DryRun(usize),
}

#[derive(Error, Debug)]
enum RunError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigErrors),
    #[error("Failed to enumerate work items: {0}")]
    Collect(#[from] CollectError),
    #[error("Failed to close the run: {0}")]
    Aggregate(#[from] AggregateError),
    #[error("Failed to prepare the output directory: {0}")]
    OutputDir(#[from] std::io::Error),
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    match run(args) {
        Ok(RunOutcome::Completed(summary)) => {
            info!(
                succeeded = summary.succeeded,
                failed = summary.failed,
                timed_out = summary.timed_out,
                "Orchestration run complete"
            );
            ExitCode::SUCCESS
        }
        Ok(RunOutcome::NothingToDo) => {
            info!("Nothing to fit");
            ExitCode::SUCCESS
        }
        Ok(RunOutcome::DryRun(items)) => {
            info!(items, "Dry run complete, nothing was submitted");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

/// One orchestration run: pull, enumerate, dispatch, watch, aggregate,
/// publish. Per-item trouble never aborts the run; only configuration and
/// aggregation failures do.
fn run(args: Args) -> Result<RunOutcome, RunError> {
    let mut config = FitterConfig::load(&args.config)?;

    if let Some(staging_dir) = args.staging_dir {
        config.staging_dir = staging_dir;
    }
    if let Some(timeout) = args.timeout {
        config.timeout_secs = timeout;
    }
    if let Some(poll_interval) = args.poll_interval {
        config.poll_interval_secs = poll_interval;
    }

    let mut contains_error = false;
    if !args.models.is_empty() {
        contains_error |= config.retain_models(&args.models);
    }
    contains_error |= config.preflight_checks();
    if contains_error {
        return Err(ConfigErrors::PreflightFailed.into());
    }

    std::fs::create_dir_all(&config.output_dir)?;
    let started_at = Utc::now();

    let sync = config.sync.clone().map(SyncClient::new);
    if let Some(sync) = &sync {
        match sync.pull(&config.staging_dir) {
            Ok(true) => info!("New candidate files arrived"),
            Ok(false) => info!("Candidate store unchanged since the last run"),
            Err(e) => {
                warn!(error = %e, "Failed to pull candidates, fitting whatever is already staged")
            }
        }
    }

    let items = collector::collect(&config, args.force)?;
    if items.is_empty() {
        info!("No unfitted (candidate, model) pairs found");
        return Ok(RunOutcome::NothingToDo);
    }
    info!(items = items.len(), "Enumerated work items");

    if args.dry_run {
        for item in &items {
            info!(candidate = %item.candidate, model = %item.model, "Would submit fit job");
        }
        return Ok(RunOutcome::DryRun(items.len()));
    }

    let scheduler = Schedulers::load(&config)?;
    let (submitted, mut resolutions) = schedulers::dispatch(&scheduler, items, &config);

    let monitor = Monitor::from_config(&config);
    resolutions.extend(monitor.watch(submitted));

    let aggregator = Aggregator::new(config.output_dir.clone());
    let summary = aggregator.finalize(&resolutions, started_at)?;

    let notifier = if args.notify {
        match config.notify.clone() {
            Some(notify_config) => match Notifier::new(notify_config) {
                Ok(notifier) => Some(notifier),
                Err(e) => {
                    warn!(error = %e, "Failed to build the webhook client, skipping notification");
                    None
                }
            },
            None => {
                warn!("--notify passed but no webhook is configured");
                None
            }
        }
    } else {
        None
    };

    aggregate::publish(&summary, &config.output_dir, sync.as_ref(), notifier.as_ref());

    Ok(RunOutcome::Completed(summary))
}
