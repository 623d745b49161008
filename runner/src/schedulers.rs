mod local;
mod slurm;

use crate::{
    aggregate::{Outcome, Resolution},
    collector::WorkItem,
    config::{ConfigErrors, FitterConfig, ModelProfile},
};
use std::path::Path;
use thiserror::Error;
use tracing::{info, warn};

// Fit settings shared by every model, from the original pipeline tuning.
const ERROR_BUDGET: f64 = 1.0;
const EBV_MAX: f64 = 0.5724;
const DETECTION_LIMIT: &str = "{'r':21.5, 'g':21.5, 'i':21.5}";

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("Failed to spawn the submission command")]
    Spawn(#[from] std::io::Error),
    #[error("Scheduler rejected the job: {stderr}")]
    Rejected { stderr: String },
    #[error("Could not parse a job id from scheduler output: {0:?}")]
    UnparsableJobId(String),
}

/// Handle to one submitted fit job. Status is never queried through the
/// scheduler; completion is observed via the filesystem marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobHandle {
    pub id: u64,
}

/// All scheduler variants, selected by name from the config
/// (deliberately not made with dynamic dispatch to avoid the headache).
#[derive(Debug, Clone)]
pub enum Schedulers {
    Slurm(slurm::SlurmScheduler),
    Local(local::LocalScheduler),
}

impl Schedulers {
    pub fn load(config: &FitterConfig) -> Result<Self, ConfigErrors> {
        match config.scheduler.name.as_str() {
            "slurm" => Ok(Self::Slurm(slurm::SlurmScheduler::new(config))),
            "local" => Ok(Self::Local(local::LocalScheduler::new(config))),
            _ => Err(ConfigErrors::UnsupportedScheduler(
                config.scheduler.name.clone(),
            )),
        }
    }

    /// Submit one fit job, fire-and-forget.
    pub fn submit(
        &self,
        item: &WorkItem,
        profile: &ModelProfile,
    ) -> Result<JobHandle, SchedulerError> {
        match self {
            Self::Slurm(scheduler) => scheduler.submit(item, profile),
            Self::Local(scheduler) => scheduler.submit(item, profile),
        }
    }
}

/// Submit every work item once. Rejected submissions are recorded as failed
/// on the spot and never retried within the run; the run itself continues.
pub fn dispatch(
    scheduler: &Schedulers,
    items: Vec<WorkItem>,
    config: &FitterConfig,
) -> (Vec<(WorkItem, JobHandle)>, Vec<Resolution>) {
    let mut submitted = Vec::with_capacity(items.len());
    let mut failed = Vec::new();

    for item in items {
        let Some(profile) = config.models.get(&item.model) else {
            // cannot happen for items built by the collector
            warn!(model = %item.model, "No profile for model, marking item failed");
            failed.push(Resolution {
                item,
                outcome: Outcome::Failed,
                job_id: None,
            });
            continue;
        };

        // a marker left over from a force-re-run would read as instant success
        if let Err(e) = std::fs::remove_file(item.marker_path()) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(candidate = %item.candidate, model = %item.model, error = %e, "Failed to clear a stale completion marker");
            }
        }

        match scheduler.submit(&item, profile) {
            Ok(handle) => {
                info!(
                    candidate = %item.candidate,
                    model = %item.model,
                    job_id = handle.id,
                    "Submitted fit job"
                );
                submitted.push((item, handle));
            }
            Err(e) => {
                warn!(
                    candidate = %item.candidate,
                    model = %item.model,
                    error = %e,
                    "Submission rejected, marking item failed"
                );
                failed.push(Resolution {
                    item,
                    outcome: Outcome::Failed,
                    job_id: None,
                });
            }
        }
    }

    (submitted, failed)
}

/// Shell command running one fit and dropping the completion marker on
/// success. The marker is the only success signal the monitor sees.
pub(crate) fn fit_command(item: &WorkItem, profile: &ModelProfile, svd_path: &Path) -> String {
    let mut command = format!(
        "mkdir -p {fit_dir} && \
         mpiexec -np {cpus} light_curve_analysis \
         --model {model} --svd-path {svd} --outdir {fit_dir} --label {model} \
         --trigger-time {trigger} --data {data} --prior {prior} \
         --tmin {tmin} --tmax {tmax} --dt {dt} \
         --error-budget {budget} --nlive {nlive} --Ebv-max {ebv} \
         --detection-limit \"{limit}\"",
        fit_dir = item.fit_dir().display(),
        cpus = profile.cpus,
        model = item.model,
        svd = svd_path.display(),
        trigger = item.trigger_time_mjd,
        data = item.data_file.display(),
        prior = profile.prior.display(),
        tmin = profile.tmin,
        tmax = profile.tmax,
        dt = profile.dt,
        budget = ERROR_BUDGET,
        nlive = profile.nlive,
        ebv = EBV_MAX,
        limit = DETECTION_LIMIT,
    );

    if profile.joint_lightcurve {
        command.push_str(" --joint-light-curve");
    }

    command.push_str(&format!(" && touch {}", item.marker_path().display()));

    command
}
