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

/// Runs fits directly on the current host, for workstations without a batch
/// scheduler. Children are spawned detached; like batch jobs they report
/// completion only through the marker file.
#[derive(Debug, Clone)]
pub struct LocalScheduler {
    svd_path: PathBuf,
}

impl LocalScheduler {
    pub fn new(config: &FitterConfig) -> Self {
        Self {
            svd_path: config.svd_path.clone(),
        }
    }

    pub fn submit(
        &self,
        item: &WorkItem,
        profile: &ModelProfile,
    ) -> Result<JobHandle, SchedulerError> {
        let command = fit_command(item, profile, &self.svd_path);
        debug!(command = %command, "Spawning local fit");

        let child = Command::new("sh")
            .arg("-c")
            .arg(&command)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?;

        Ok(JobHandle {
            id: u64::from(child.id()),
        })
    }
}
