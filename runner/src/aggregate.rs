use crate::{collector::WorkItem, notify::Notifier, sync::SyncClient};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::{debug, error, info};

/// Terminal marker of a finished orchestration run.
pub const SUMMARY_FILE: &str = "run_summary.yaml";

#[derive(Error, Debug)]
pub enum AggregateError {
    #[error("Failed to write the run summary")]
    WriteSummary(#[source] std::io::Error),
    #[error("Failed to serialize the run summary")]
    Serialize(#[from] serde_yaml::Error),
    #[error("Failed to clean up transient run files")]
    Cleanup(#[source] std::io::Error),
}

/// Terminal state of one work item. Exactly one of these per enumerated item
/// ends up in the summary; timed-out is deliberately distinct from failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Succeeded,
    Failed,
    TimedOut,
}

#[derive(Debug, Clone)]
pub struct Resolution {
    pub item: WorkItem,
    pub outcome: Outcome,
    pub job_id: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemReport {
    pub candidate: String,
    pub model: String,
    pub outcome: Outcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    // every enumerated item, including submissions the scheduler rejected
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub timed_out: usize,
    pub items: Vec<ItemReport>,
}

pub struct Aggregator {
    run_dir: PathBuf,
}

impl Aggregator {
    pub fn new(run_dir: PathBuf) -> Self {
        Self { run_dir }
    }

    pub fn summary_path(&self) -> PathBuf {
        self.run_dir.join(SUMMARY_FILE)
    }

    /// Close the run: clean transient markers, then write the summary.
    ///
    /// Markers are deleted so the next run starts from a clean slate; a
    /// marker dropped by a job finishing after this point belongs to a closed
    /// run and is never reconciled into its summary.
    pub fn finalize(
        &self,
        resolutions: &[Resolution],
        started_at: DateTime<Utc>,
    ) -> Result<RunSummary, AggregateError> {
        let summary = build_summary(resolutions, started_at);

        self.cleanup(resolutions)?;
        self.write_summary(&summary)?;

        info!(
            total = summary.total,
            succeeded = summary.succeeded,
            failed = summary.failed,
            timed_out = summary.timed_out,
            "Run closed"
        );

        Ok(summary)
    }

    /// Remove completion markers and scheduler spool files. Idempotent:
    /// already-removed files are not an error.
    pub fn cleanup(&self, resolutions: &[Resolution]) -> Result<(), AggregateError> {
        for resolution in resolutions {
            remove_if_present(&resolution.item.marker_path())?;

            if let Some(id) = resolution.job_id {
                remove_if_present(&self.run_dir.join(format!("{id}.out")))?;
                remove_if_present(&self.run_dir.join(format!("{id}.err")))?;
            }
        }

        Ok(())
    }

    fn write_summary(&self, summary: &RunSummary) -> Result<(), AggregateError> {
        let rendered = serde_yaml::to_string(summary)?;

        fs::write(self.summary_path(), rendered).map_err(AggregateError::WriteSummary)
    }
}

pub fn build_summary(resolutions: &[Resolution], started_at: DateTime<Utc>) -> RunSummary {
    let count = |outcome: Outcome| {
        resolutions
            .iter()
            .filter(|resolution| resolution.outcome == outcome)
            .count()
    };

    RunSummary {
        started_at,
        finished_at: Utc::now(),
        total: resolutions.len(),
        succeeded: count(Outcome::Succeeded),
        failed: count(Outcome::Failed),
        timed_out: count(Outcome::TimedOut),
        items: resolutions
            .iter()
            .map(|resolution| ItemReport {
                candidate: resolution.item.candidate.clone(),
                model: resolution.item.model.clone(),
                outcome: resolution.outcome,
                job_id: resolution.job_id,
            })
            .collect(),
    }
}

/// Downstream steps after the summary is durable. Both are best-effort: the
/// fit results stand whether or not they could be announced.
pub fn publish(
    summary: &RunSummary,
    run_dir: &Path,
    sync: Option<&SyncClient>,
    notifier: Option<&Notifier>,
) {
    if let Some(sync) = sync {
        match sync.push(run_dir) {
            Ok(()) => info!("Synced run outputs to the remote store"),
            Err(e) => error!(error = %e, "Failed to sync run outputs, results remain local"),
        }
    }

    if let Some(notifier) = notifier {
        if notifier.publish(summary) {
            debug!("Posted the run summary notification");
        } else {
            error!("Failed to post the run summary notification");
        }
    }
}

fn remove_if_present(path: &Path) -> Result<(), AggregateError> {
    match fs::remove_file(path) {
        Ok(()) => {
            debug!(path = ?path, "Removed transient run file");
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(AggregateError::Cleanup(e)),
    }
}
