use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fs::File,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::error;

#[derive(Error, Debug)]
pub enum ConfigErrors {
    #[error("Failed to read config file")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config file")]
    Parse(#[from] serde_yaml::Error),
    #[error("Scheduler not supported")]
    UnsupportedScheduler(String),
    #[error("Config failed preflight checks")]
    PreflightFailed,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct FitterConfig {
    // where the sync client drops new candidate photometry files
    pub staging_dir: PathBuf,
    // run outputs: per-candidate fit directories, markers and the run summary
    pub output_dir: PathBuf,
    // surrogate model files consumed by the external fit program
    pub svd_path: PathBuf,
    // Models as resource/configuration templates, keyed by the name the fit
    // program knows them under
    pub models: BTreeMap<String, ModelProfile>,
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub sync: Option<SyncConfig>,
    #[serde(default)]
    pub notify: Option<NotifyConfig>,
    // seconds between completion marker scans
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    // wall-clock budget for outstanding jobs; never unbounded
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

/// Per-model resource template. What used to live in one hand-edited batch
/// script per model is plain configuration here.
#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct ModelProfile {
    pub prior: PathBuf,
    #[serde(default = "default_nlive")]
    pub nlive: u32,
    #[serde(default = "default_cpus")]
    pub cpus: u32,
    #[serde(default = "default_memory_mb")]
    pub memory_mb: u32,
    // scheduler formatted, e.g. "23:59:00"
    #[serde(default = "default_time_limit")]
    pub time_limit: String,
    #[serde(default)]
    pub partition: Option<String>,
    // fit window; afterglow models need a coarser, offset grid to evaluate
    // without running over their time limit
    #[serde(default = "default_tmin")]
    pub tmin: f64,
    #[serde(default = "default_tmax")]
    pub tmax: f64,
    #[serde(default = "default_dt")]
    pub dt: f64,
    #[serde(default)]
    pub joint_lightcurve: bool,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct SchedulerConfig {
    // Name of the selected scheduler, see Schedulers::load for the selection
    // process
    pub name: String,
    #[serde(default = "default_sbatch")]
    pub sbatch_exec: PathBuf,
    #[serde(default)]
    pub account: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct SyncConfig {
    // rsync-style remote the candidate files are pulled from
    pub remote: String,
    // where finished fits are pushed; push is skipped when unset
    #[serde(default)]
    pub results_remote: Option<String>,
    #[serde(default = "default_rsync")]
    pub rsync_exec: PathBuf,
    #[serde(default = "default_sync_timeout")]
    pub timeout_secs: u64,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct NotifyConfig {
    pub webhook_url: String,
    #[serde(default)]
    pub channel: Option<String>,
}

impl FitterConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigErrors> {
        let file = File::open(path)?;

        Ok(serde_yaml::from_reader(file)?)
    }

    /// Restrict the model table to a selection from the command line.
    /// Returns true when the selection references undefined models.
    pub fn retain_models(&mut self, selected: &[String]) -> bool {
        let mut contains_error = false;

        for name in selected {
            if !self.models.contains_key(name) {
                error!("Model {name} is not defined in the configuration");
                contains_error = true;
            }
        }
        self.models
            .retain(|name, _| selected.iter().any(|selected| selected == name));

        contains_error
    }

    pub fn preflight_checks(&mut self) -> bool {
        // attempt to catch all errors instead of piece-by-piece to make
        // debugging easier for users
        let mut contains_error = false;

        if self.models.is_empty() {
            error!("No model was defined, unable to build a queue of fits");
            contains_error = true;
        }

        if self.timeout_secs == 0 {
            error!("timeout_secs cannot be 0, the monitor would give up immediately");
            contains_error = true;
        }

        if self.poll_interval_secs == 0 {
            error!("poll_interval_secs cannot be 0, the monitor would spin on the filesystem");
            contains_error = true;
        }

        if self.sync.is_none() && !self.staging_dir.is_dir() {
            error!(
                "staging_dir {} is not a directory and no sync remote is configured to create it",
                self.staging_dir.to_string_lossy()
            );
            contains_error = true;
        }

        for (name, profile) in self.models.iter() {
            if !profile.prior.is_file() {
                error!(
                    "Failed to find models.{name}.prior at {}",
                    profile.prior.to_string_lossy()
                );
                contains_error = true;
            }

            if profile.cpus == 0 {
                error!("models.{name}.cpus cannot be 0");
                contains_error = true;
            }

            if profile.nlive == 0 {
                error!("models.{name}.nlive cannot be 0");
                contains_error = true;
            }

            if profile.tmax <= profile.tmin {
                error!(
                    "models.{name} has an empty fit window (tmin {}, tmax {})",
                    profile.tmin, profile.tmax
                );
                contains_error = true;
            }
        }

        contains_error
    }
}

fn default_poll_interval() -> u64 {
    60
}

// six hours, the longest the original pipeline would wait on a fit
fn default_timeout() -> u64 {
    21_600
}

fn default_nlive() -> u32 {
    256
}

fn default_cpus() -> u32 {
    2
}

fn default_memory_mb() -> u32 {
    8_192
}

fn default_time_limit() -> String {
    "23:59:00".to_owned()
}

fn default_tmin() -> f64 {
    0.0
}

fn default_tmax() -> f64 {
    7.0
}

fn default_dt() -> f64 {
    0.1
}

fn default_sbatch() -> PathBuf {
    PathBuf::from("sbatch")
}

fn default_rsync() -> PathBuf {
    PathBuf::from("rsync")
}

fn default_sync_timeout() -> u64 {
    300
}

#[cfg(test)]
mod tests {
    use super::*;

    const FIXTURE: &str = "\
staging_dir: /staging/candidates
output_dir: /fits
svd_path: /shared/svdmodels
scheduler:
  name: slurm
  account: astro
models:
  Bu2019lm:
    prior: /shared/priors/ZTF_kn_t0.prior
  TrPi2018:
    prior: /shared/priors/ZTF_grb_t0.prior
    cpus: 4
    tmin: 0.01
    tmax: 7.01
    dt: 0.35
  nugent-hyper:
    prior: /shared/priors/ZTF_sn_t0.prior
    joint_lightcurve: true
";

    #[test]
    fn parse_with_defaults() {
        let config: FitterConfig = serde_yaml::from_str(FIXTURE).unwrap();

        assert_eq!(config.models.len(), 3);
        assert_eq!(config.poll_interval_secs, 60);
        assert_eq!(config.timeout_secs, 21_600);

        let kn = &config.models["Bu2019lm"];
        assert_eq!(kn.nlive, 256);
        assert_eq!(kn.cpus, 2);
        assert_eq!(kn.tmax, 7.0);

        let grb = &config.models["TrPi2018"];
        assert_eq!(grb.cpus, 4);
        assert_eq!(grb.dt, 0.35);

        assert!(config.models["nugent-hyper"].joint_lightcurve);
        assert_eq!(config.scheduler.sbatch_exec, PathBuf::from("sbatch"));
    }

    #[test]
    fn unknown_fields_rejected() {
        let with_typo = FIXTURE.replace("svd_path", "svdpath");

        assert!(serde_yaml::from_str::<FitterConfig>(&with_typo).is_err());
    }

    #[test]
    fn retain_models_filters_selection() {
        let mut config: FitterConfig = serde_yaml::from_str(FIXTURE).unwrap();

        assert!(!config.retain_models(&["Bu2019lm".to_owned()]));
        assert_eq!(config.models.len(), 1);
        assert!(config.models.contains_key("Bu2019lm"));

        assert!(config.retain_models(&["NotAModel".to_owned()]));
    }
}
