use crate::config::SyncConfig;
use std::{
    io::Read,
    path::Path,
    process::{Command, Stdio},
    time::Duration,
};
use thiserror::Error;
use tracing::{debug, info};
use wait_timeout::ChildExt;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Failed to run the sync command")]
    Io(#[from] std::io::Error),
    #[error("Sync command exited with status {status}: {stderr}")]
    Failed { status: i32, stderr: String },
    #[error("Sync command timed out")]
    Timeout,
}

/// Thin wrapper around rsync. Pulls new candidate files from the remote
/// store into staging and pushes finished fits back.
pub struct SyncClient {
    config: SyncConfig,
}

impl SyncClient {
    pub fn new(config: SyncConfig) -> Self {
        Self { config }
    }

    /// Mirror the remote candidate store into the staging directory.
    /// Returns true when new files arrived.
    pub fn pull(&self, staging_dir: &Path) -> Result<bool, SyncError> {
        let stdout = self.run(&self.config.remote, &staging_dir.display().to_string())?;

        // --itemize-changes prints one `>f...` line per received file;
        // directory touch-ups alone do not count as new data
        let changed = stdout.lines().any(|line| line.starts_with(">f"));
        if changed {
            info!("Pulled new candidate files into staging");
        } else {
            debug!("Remote candidate store unchanged");
        }

        Ok(changed)
    }

    /// Copy the run output tree to the results remote, if one is configured.
    pub fn push(&self, run_dir: &Path) -> Result<(), SyncError> {
        let Some(results_remote) = &self.config.results_remote else {
            debug!("No results remote configured, keeping outputs local");
            return Ok(());
        };

        // trailing slash: copy the directory contents, not the directory
        self.run(&format!("{}/", run_dir.display()), results_remote)
            .map(|_| ())
    }

    fn run(&self, source: &str, dest: &str) -> Result<String, SyncError> {
        let mut child = Command::new(&self.config.rsync_exec)
            .arg("-az")
            .arg("--itemize-changes")
            .arg(source)
            .arg(dest)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        match child.wait_timeout(Duration::from_secs(self.config.timeout_secs))? {
            Some(status) => {
                let mut stdout = String::new();
                if let Some(mut pipe) = child.stdout.take() {
                    pipe.read_to_string(&mut stdout)?;
                }

                if status.success() {
                    Ok(stdout)
                } else {
                    let mut stderr = String::new();
                    if let Some(mut pipe) = child.stderr.take() {
                        pipe.read_to_string(&mut stderr)?;
                    }

                    Err(SyncError::Failed {
                        status: status.code().unwrap_or(-1),
                        stderr: stderr.trim().to_owned(),
                    })
                }
            }
            None => {
                let _ = child.kill();
                Err(SyncError::Timeout)
            }
        }
    }
}
