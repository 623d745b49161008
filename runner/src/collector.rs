use crate::{
    candidates::{self, Candidate, MIN_DETECTIONS},
    config::FitterConfig,
};
use globset::{GlobBuilder, GlobMatcher};
use ignore::{DirEntry, WalkBuilder};
use itertools::{iproduct, Itertools};
use once_cell::sync::Lazy;
use std::{
    collections::BTreeSet,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Candidate photometry files as dropped off by the sync client.
static CANDIDATE_GLOB: Lazy<Option<GlobMatcher>> = Lazy::new(|| {
    GlobBuilder::new("lc_*.csv")
        .build()
        .map(|glob| glob.compile_matcher())
        .ok()
});

#[derive(Error, Debug)]
pub enum CollectError {
    #[error("Candidate glob was invalid")]
    InvalidGlob,
    #[error("Failed to read staging directory {0}")]
    StagingUnreadable(PathBuf),
    #[error("Failed to prepare the candidate data directory")]
    DataDir(#[from] std::io::Error),
}

/// One (candidate, model) fit that still has to run. Fixed at enumeration
/// time; consumed exactly once by the dispatcher.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkItem {
    pub candidate: String,
    pub model: String,
    // photometry converted to the format the fit program loads
    pub data_file: PathBuf,
    // run-level output directory shared by all items of the run
    pub outdir: PathBuf,
    pub trigger_time_mjd: f64,
}

impl WorkItem {
    pub fn key(&self) -> String {
        format!("{}_{}", self.candidate, self.model)
    }

    /// Directory the fit program writes its artifacts into.
    pub fn fit_dir(&self) -> PathBuf {
        self.outdir.join(&self.candidate)
    }

    /// Posterior samples file, the durable evidence a fit already ran.
    pub fn posterior_path(&self) -> PathBuf {
        self.fit_dir()
            .join(format!("{}_posterior_samples.dat", self.model))
    }

    /// Empty file dropped by the fit job on success, watched by the monitor.
    pub fn marker_path(&self) -> PathBuf {
        self.outdir.join(format!("{}.fin", self.key()))
    }
}

/// Enumerate the (candidate, model) pairs that still need a fit.
///
/// Scans the staging directory for photometry files, validates them, and
/// crosses the surviving candidates with the configured model table. Pairs
/// with an existing completion marker or posterior file are skipped unless
/// `force`. Read-only apart from the converted data files.
pub fn collect(config: &FitterConfig, force: bool) -> Result<Vec<WorkItem>, CollectError> {
    if !config.staging_dir.is_dir() {
        return Err(CollectError::StagingUnreadable(config.staging_dir.clone()));
    }
    let glob = CANDIDATE_GLOB.as_ref().ok_or(CollectError::InvalidGlob)?;

    let files = WalkBuilder::new(&config.staging_dir)
        .build()
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(e) => {
                warn!("Failed to scan staging directory: {e}");
                None
            }
        })
        .map(DirEntry::into_path)
        .filter(|path| path.is_file() && matches_candidate(glob, path))
        .sorted()
        .collect_vec();

    let data_dir = config.output_dir.join("candidate_data");
    std::fs::create_dir_all(&data_dir)?;

    let mut staged = Vec::new();
    let mut seen = BTreeSet::new();

    for path in files {
        let Some(name) = candidates::candidate_name(&path) else {
            warn!(path = ?path, "Skipping file without a parsable candidate name");
            continue;
        };

        if !seen.insert(name.clone()) {
            warn!(candidate = %name, path = ?path, "Duplicate candidate file, keeping the first");
            continue;
        }

        match candidates::parse_photometry(&path, &name) {
            Ok(candidate) => match prepare(candidate, &data_dir) {
                Some(prepared) => staged.push(prepared),
                None => continue,
            },
            Err(e) => {
                warn!(candidate = %name, error = %e, "Skipping malformed candidate file");
            }
        }
    }

    let models = config.models.keys().collect_vec();
    let items = iproduct!(staged.iter(), models.iter())
        .map(|((candidate, data_file, trigger_time_mjd), model)| WorkItem {
            candidate: candidate.clone(),
            model: (*model).clone(),
            data_file: data_file.clone(),
            outdir: config.output_dir.clone(),
            trigger_time_mjd: *trigger_time_mjd,
        })
        .filter(|item| {
            if !force && already_fitted(item) {
                debug!(candidate = %item.candidate, model = %item.model, "Already fitted, skipping");
                false
            } else {
                true
            }
        })
        .collect_vec();

    Ok(items)
}

/// Validate one parsed candidate and convert it for the fit program.
fn prepare(candidate: Candidate, data_dir: &Path) -> Option<(String, PathBuf, f64)> {
    if candidate.detections() < MIN_DETECTIONS {
        info!(
            candidate = %candidate.name,
            path = ?candidate.source,
            detections = candidate.detections(),
            "Not enough data for candidate, continuing"
        );
        return None;
    }

    // at least one detection exists, the gate above guarantees it
    let trigger_time_mjd = candidate.trigger_time_mjd()?;

    match candidate.write_dat(data_dir) {
        Ok(data_file) => Some((candidate.name, data_file, trigger_time_mjd)),
        Err(e) => {
            warn!(
                candidate = %candidate.name,
                path = ?candidate.source,
                error = %e,
                "Failed to convert candidate data"
            );
            None
        }
    }
}

fn matches_candidate(glob: &GlobMatcher, path: &Path) -> bool {
    path.file_name()
        .map(|name| glob.is_match(name))
        .unwrap_or(false)
}

fn already_fitted(item: &WorkItem) -> bool {
    item.marker_path().is_file() || item.posterior_path().is_file()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SchedulerConfig;
    use std::{collections::BTreeMap, fs::File, io::Write};
    use tempfile::TempDir;

    const PHOTOMETRY: &str = "\
,jd,mag,mag_unc,filter,limmag,programid,forced
0,2459778.0,18.5,0.1,g,20.5,1,1
1,2459779.0,18.7,0.2,r,20.4,1,1
";

    const THIN_PHOTOMETRY: &str = "\
,jd,mag,mag_unc,filter,limmag,programid,forced
0,2459778.0,18.5,0.1,g,20.5,1,1
1,2459779.0,99.0,99.0,r,20.4,1,0
";

    fn stage(dir: &Path, candidate: &str, contents: &str) {
        let path = dir.join(format!("lc_{candidate}_forced1_stacked0.csv"));
        let mut file = File::create(path).unwrap();
        file.write_all(contents.as_bytes()).unwrap();
    }

    fn test_config(staging: &TempDir, output: &TempDir, models: &[&str]) -> FitterConfig {
        let profiles = models
            .iter()
            .map(|name| {
                let profile = serde_yaml::from_str(&format!("prior: /priors/{name}.prior")).unwrap();
                (name.to_string(), profile)
            })
            .collect::<BTreeMap<_, _>>();

        FitterConfig {
            staging_dir: staging.path().to_owned(),
            output_dir: output.path().to_owned(),
            svd_path: PathBuf::from("/shared/svdmodels"),
            models: profiles,
            scheduler: SchedulerConfig {
                name: "slurm".to_owned(),
                sbatch_exec: PathBuf::from("sbatch"),
                account: None,
            },
            sync: None,
            notify: None,
            poll_interval_secs: 1,
            timeout_secs: 60,
        }
    }

    #[test]
    fn crosses_candidates_with_models() {
        let staging = TempDir::new().unwrap();
        let output = TempDir::new().unwrap();
        stage(staging.path(), "ZTFaaa", PHOTOMETRY);
        stage(staging.path(), "ZTFbbb", PHOTOMETRY);

        let config = test_config(&staging, &output, &["m1", "m2"]);
        let items = collect(&config, false).unwrap();

        assert_eq!(items.len(), 4);
        let keys = items.iter().map(WorkItem::key).collect_vec();
        assert_eq!(
            keys,
            ["ZTFaaa_m1", "ZTFaaa_m2", "ZTFbbb_m1", "ZTFbbb_m2"]
        );
        // no duplicates
        assert_eq!(keys.iter().collect::<BTreeSet<_>>().len(), 4);
    }

    #[test]
    fn excludes_pairs_with_existing_markers() {
        let staging = TempDir::new().unwrap();
        let output = TempDir::new().unwrap();
        stage(staging.path(), "ZTFaaa", PHOTOMETRY);

        let config = test_config(&staging, &output, &["m1", "m2"]);
        File::create(output.path().join("ZTFaaa_m1.fin")).unwrap();

        let items = collect(&config, false).unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].key(), "ZTFaaa_m2");

        // force ignores completion state
        let items = collect(&config, true).unwrap();
        assert_eq!(items.len(), 2);
    }

    #[test]
    fn excludes_pairs_with_posterior_artifacts() {
        let staging = TempDir::new().unwrap();
        let output = TempDir::new().unwrap();
        stage(staging.path(), "ZTFaaa", PHOTOMETRY);

        let config = test_config(&staging, &output, &["m1"]);
        let fit_dir = output.path().join("ZTFaaa");
        std::fs::create_dir_all(&fit_dir).unwrap();
        File::create(fit_dir.join("m1_posterior_samples.dat")).unwrap();

        assert!(collect(&config, false).unwrap().is_empty());
    }

    #[test]
    fn skips_thin_and_malformed_candidates() {
        let staging = TempDir::new().unwrap();
        let output = TempDir::new().unwrap();
        stage(staging.path(), "ZTFthin", THIN_PHOTOMETRY);
        stage(staging.path(), "ZTFbad", "not,a,photometry\nfile,at,all\n");
        stage(staging.path(), "ZTFgood", PHOTOMETRY);

        let config = test_config(&staging, &output, &["m1"]);
        let items = collect(&config, false).unwrap();

        assert_eq!(items.len(), 1);
        assert_eq!(items[0].candidate, "ZTFgood");
    }

    #[test]
    fn empty_staging_is_a_noop() {
        let staging = TempDir::new().unwrap();
        let output = TempDir::new().unwrap();

        let config = test_config(&staging, &output, &["m1", "m2"]);
        assert!(collect(&config, false).unwrap().is_empty());
    }

    #[test]
    fn missing_staging_is_fatal() {
        let staging = TempDir::new().unwrap();
        let output = TempDir::new().unwrap();
        let mut config = test_config(&staging, &output, &["m1"]);
        config.staging_dir = staging.path().join("does-not-exist");

        assert!(matches!(
            collect(&config, false),
            Err(CollectError::StagingUnreadable(_))
        ));
    }
}
