use crate::{
    aggregate::{Outcome, Resolution},
    collector::WorkItem,
    config::FitterConfig,
    schedulers::JobHandle,
};
use std::{
    path::Path,
    thread,
    time::{Duration, Instant},
};
use tracing::{debug, error, info};

/// How much of a failed job's stderr spool is carried into the run log.
const SPOOL_TAIL_LINES: usize = 20;

/// Watches outstanding fit jobs for their completion markers.
///
/// The timeout is mandatory: without it a deadlocked fit or a job dropped by
/// the scheduler would hang the run forever. Jobs may resolve in any order.
pub struct Monitor {
    poll_interval: Duration,
    timeout: Duration,
}

impl Monitor {
    pub fn new(poll_interval: Duration, timeout: Duration) -> Self {
        Self {
            poll_interval,
            timeout,
        }
    }

    pub fn from_config(config: &FitterConfig) -> Self {
        Self::new(
            Duration::from_secs(config.poll_interval_secs),
            Duration::from_secs(config.timeout_secs),
        )
    }

    /// Poll until every job resolved or the wall-clock budget is spent.
    /// Terminates within `timeout` plus one poll interval. Items still
    /// outstanding at the deadline are recorded as timed-out, which is a
    /// terminal outcome of its own, not a failure.
    pub fn watch(&self, mut outstanding: Vec<(WorkItem, JobHandle)>) -> Vec<Resolution> {
        let deadline = Instant::now() + self.timeout;
        let mut resolved = Vec::with_capacity(outstanding.len());

        loop {
            let mut still_running = Vec::with_capacity(outstanding.len());

            for (item, handle) in outstanding {
                match poll_item(&item, &handle) {
                    Some(outcome) => {
                        info!(
                            candidate = %item.candidate,
                            model = %item.model,
                            job_id = handle.id,
                            outcome = ?outcome,
                            "Fit job resolved"
                        );
                        resolved.push(Resolution {
                            item,
                            outcome,
                            job_id: Some(handle.id),
                        });
                    }
                    None => still_running.push((item, handle)),
                }
            }
            outstanding = still_running;

            if outstanding.is_empty() {
                break;
            }

            let now = Instant::now();
            if now >= deadline {
                info!(
                    outstanding = outstanding.len(),
                    "Wall-clock budget spent with jobs still outstanding"
                );
                resolved.extend(outstanding.into_iter().map(|(item, handle)| Resolution {
                    item,
                    outcome: Outcome::TimedOut,
                    job_id: Some(handle.id),
                }));
                break;
            }

            let wait = self.poll_interval.min(deadline - now);
            debug!(outstanding = outstanding.len(), "Waiting on markers");
            thread::sleep(wait);
        }

        resolved
    }
}

/// A marker means success. A non-empty stderr spool from the scheduler means
/// the job exited without one, i.e. failed. Anything else is still running.
///
/// The spool is logged here because the aggregator deletes it at cleanup;
/// this is the only place the diagnostics survive.
fn poll_item(item: &WorkItem, handle: &JobHandle) -> Option<Outcome> {
    if item.marker_path().is_file() {
        return Some(Outcome::Succeeded);
    }

    let err_file = item.outdir.join(format!("{}.err", handle.id));
    match std::fs::metadata(&err_file) {
        Ok(metadata) if metadata.len() > 0 => {
            if let Some(tail) = spool_tail(&err_file, SPOOL_TAIL_LINES) {
                error!(
                    candidate = %item.candidate,
                    model = %item.model,
                    job_id = handle.id,
                    "Fit job reported errors:\n{tail}"
                );
            }
            Some(Outcome::Failed)
        }
        _ => None,
    }
}

/// Last lines of a scheduler spool file.
fn spool_tail(path: &Path, max_lines: usize) -> Option<String> {
    let contents = std::fs::read_to_string(path).ok()?;
    let lines: Vec<&str> = contents.lines().collect();
    let start = lines.len().saturating_sub(max_lines);

    Some(lines[start..].join("\n"))
}
