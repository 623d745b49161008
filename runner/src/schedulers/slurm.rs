use super::{fit_command, JobHandle, SchedulerError};
use crate::{
    collector::WorkItem,
    config::{FitterConfig, ModelProfile},
};
use std::{
    path::PathBuf,
    process::{Command, Stdio},
};
use tracing::debug;

/// Submits one batch job per work item via `sbatch`. The per-model batch
/// scripts of the old pipeline are replaced by directives built from the
/// model profile.
#[derive(Debug, Clone)]
pub struct SlurmScheduler {
    sbatch_exec: PathBuf,
    account: Option<String>,
    svd_path: PathBuf,
}

impl SlurmScheduler {
    pub fn new(config: &FitterConfig) -> Self {
        Self {
            sbatch_exec: config.scheduler.sbatch_exec.clone(),
            account: config.scheduler.account.clone(),
            svd_path: config.svd_path.clone(),
        }
    }

    pub fn submit(
        &self,
        item: &WorkItem,
        profile: &ModelProfile,
    ) -> Result<JobHandle, SchedulerError> {
        let mut command = Command::new(&self.sbatch_exec);
        command
            .arg("--parsable")
            .arg(format!("--job-name={}", item.key()))
            .arg(format!("--time={}", profile.time_limit))
            .arg(format!("--mem={}M", profile.memory_mb))
            .arg(format!("--ntasks={}", profile.cpus))
            .arg(format!("--output={}", item.outdir.join("%j.out").display()))
            .arg(format!("--error={}", item.outdir.join("%j.err").display()));

        if let Some(partition) = &profile.partition {
            command.arg(format!("--partition={partition}"));
        }
        if let Some(account) = &self.account {
            command.arg(format!("--account={account}"));
        }

        command.arg(format!(
            "--wrap={}",
            fit_command(item, profile, &self.svd_path)
        ));

        debug!(command = ?command, "Submitting batch job");

        let output = command
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()?;

        if !output.status.success() {
            return Err(SchedulerError::Rejected {
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
            });
        }

        parse_job_id(&String::from_utf8_lossy(&output.stdout)).map(|id| JobHandle { id })
    }
}

/// `sbatch --parsable` prints `<id>` or `<id>;<cluster>`; without the flag it
/// prints `Submitted batch job <id>`. Accept all three.
pub(crate) fn parse_job_id(stdout: &str) -> Result<u64, SchedulerError> {
    let token = stdout.trim().split_whitespace().last().unwrap_or("");
    let token = token.split(';').next().unwrap_or(token);

    token
        .parse()
        .map_err(|_| SchedulerError::UnparsableJobId(stdout.trim().to_owned()))
}
