use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use std::{
    fs::File,
    io::{BufWriter, Write},
    path::{Path, PathBuf},
};
use thiserror::Error;

/// Offset between the Julian date scale and the unix epoch, in days.
const JD_UNIX_EPOCH: f64 = 2_440_587.5;
/// Offset between Julian and modified Julian dates.
const MJD_OFFSET: f64 = 2_400_000.5;
const SECONDS_PER_DAY: f64 = 86_400.0;

/// Sentinel magnitude used by the forced photometry exports for non-detections.
const NONDETECTION_MAG: f64 = 99.0;

/// Candidates with fewer real detections than this are not worth a fit.
pub const MIN_DETECTIONS: usize = 2;

#[derive(Error, Debug)]
pub enum CandidateError {
    #[error("Failed to read candidate file")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse photometry: {0}")]
    Malformed(#[from] csv::Error),
    #[error("Julian date {0} is out of range")]
    BadTimestamp(f64),
}

/// One row of the forced photometry export, as written by the upstream
/// converter. The leading index column and trailing program flags are ignored.
#[derive(Debug, Clone, Deserialize)]
struct PhotometryRow {
    jd: f64,
    mag: f64,
    mag_unc: f64,
    filter: String,
    limmag: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Photometry {
    pub jd: f64,
    pub time: DateTime<Utc>,
    pub filter: String,
    pub mag: f64,
    pub mag_err: f64,
}

impl Photometry {
    /// Non-detections carry the limiting magnitude with an infinite error.
    pub fn is_detection(&self) -> bool {
        self.mag_err.is_finite()
    }
}

#[derive(Debug, Clone)]
pub struct Candidate {
    pub name: String,
    pub source: PathBuf,
    /// Photometry sorted by Julian date, earliest first.
    pub points: Vec<Photometry>,
}

impl Candidate {
    pub fn detections(&self) -> usize {
        self.points.iter().filter(|point| point.is_detection()).count()
    }

    /// Trigger time handed to the fit program: the earliest real detection,
    /// on the modified Julian date scale.
    pub fn trigger_time_mjd(&self) -> Option<f64> {
        self.points
            .iter()
            .find(|point| point.is_detection())
            .map(|point| jd_to_mjd(point.jd))
    }

    /// Write the photometry in the whitespace-separated format the fit
    /// program loads: `<isot> <filter> <mag> <mag_err>` per line.
    pub fn write_dat(&self, dir: &Path) -> Result<PathBuf, CandidateError> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(format!("{}.dat", self.name));
        let mut writer = BufWriter::new(File::create(&path)?);

        for point in &self.points {
            let mag_err = if point.mag_err.is_finite() {
                format!("{}", point.mag_err)
            } else {
                "inf".to_owned()
            };

            writeln!(
                writer,
                "{} {} {} {}",
                point.time.format("%Y-%m-%dT%H:%M:%S%.3f"),
                point.filter,
                point.mag,
                mag_err
            )?;
        }
        writer.flush()?;

        Ok(path)
    }
}

/// Extract the candidate name from a staged filename, e.g.
/// `lc_ZTF22aatuvld_forced1_stacked0.csv` -> `ZTF22aatuvld`.
pub fn candidate_name(path: &Path) -> Option<String> {
    let stem = path.file_stem()?.to_str()?;

    stem.split('_')
        .nth(1)
        .filter(|name| !name.is_empty())
        .map(str::to_owned)
}

pub fn jd_to_mjd(jd: f64) -> f64 {
    jd - MJD_OFFSET
}

pub fn jd_to_utc(jd: f64) -> Result<DateTime<Utc>, CandidateError> {
    let unix_millis = (jd - JD_UNIX_EPOCH) * SECONDS_PER_DAY * 1_000.0;

    if !unix_millis.is_finite() {
        return Err(CandidateError::BadTimestamp(jd));
    }

    Utc.timestamp_millis_opt(unix_millis.round() as i64)
        .single()
        .ok_or(CandidateError::BadTimestamp(jd))
}

/// Parse a staged forced-photometry CSV into a validated candidate.
pub fn parse_photometry(path: &Path, name: &str) -> Result<Candidate, CandidateError> {
    let mut reader = csv::Reader::from_path(path)?;
    let mut points = Vec::new();

    for row in reader.deserialize::<PhotometryRow>() {
        let row = row?;

        // The export writes the sentinel magnitude for epochs with no
        // detection; keep them as upper limits with an infinite error so the
        // fit program can treat them as such.
        let (mag, mag_err) = if row.mag == NONDETECTION_MAG {
            (row.limmag, f64::INFINITY)
        } else {
            (row.mag, row.mag_unc)
        };

        points.push(Photometry {
            jd: row.jd,
            time: jd_to_utc(row.jd)?,
            filter: row.filter,
            mag,
            mag_err,
        });
    }

    points.sort_by(|a, b| a.jd.total_cmp(&b.jd));

    Ok(Candidate {
        name: name.to_owned(),
        source: path.to_owned(),
        points,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    const FIXTURE: &str = "\
,jd,mag,mag_unc,filter,limmag,programid,forced
0,2459779.0,18.5,0.1,g,20.5,1,1
1,2459778.0,18.7,0.2,r,20.4,1,1
2,2459780.0,99.0,99.0,g,21.0,1,0
";

    fn write_fixture(dir: &Path, filename: &str, contents: &str) -> PathBuf {
        let path = dir.join(filename);
        let mut file = File::create(&path).unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        path
    }

    #[test]
    fn name_from_staged_filename() {
        assert_eq!(
            candidate_name(Path::new("/staging/lc_ZTF22aatuvld_forced1_stacked0.csv")),
            Some("ZTF22aatuvld".to_owned())
        );
        assert_eq!(candidate_name(Path::new("/staging/noseparator.csv")), None);
        assert_eq!(candidate_name(Path::new("/staging/lc_.csv")), None);
    }

    #[test]
    fn julian_date_conversions() {
        // JD 2440587.5 is the unix epoch
        assert_eq!(
            jd_to_utc(JD_UNIX_EPOCH).unwrap(),
            Utc.with_ymd_and_hms(1970, 1, 1, 0, 0, 0).unwrap()
        );
        assert_eq!(
            jd_to_utc(2459778.0).unwrap(),
            Utc.with_ymd_and_hms(2022, 7, 17, 12, 0, 0).unwrap()
        );
        assert_eq!(jd_to_mjd(2459778.0), 59777.5);
        assert!(jd_to_utc(f64::NAN).is_err());
    }

    #[test]
    fn parse_sorts_and_maps_nondetections() {
        let dir = tempdir().unwrap();
        let path = write_fixture(dir.path(), "lc_ZTFtest_forced1_stacked0.csv", FIXTURE);

        let candidate = parse_photometry(&path, "ZTFtest").unwrap();
        assert_eq!(candidate.source, path);
        assert_eq!(candidate.points.len(), 3);
        assert_eq!(candidate.detections(), 2);

        // sorted by jd, earliest first
        assert_eq!(candidate.points[0].jd, 2459778.0);
        assert_eq!(candidate.points[0].filter, "r");

        // the sentinel row becomes an upper limit at the limiting magnitude
        let limit = &candidate.points[2];
        assert!(!limit.is_detection());
        assert_eq!(limit.mag, 21.0);

        // trigger time comes from the earliest detection
        assert_eq!(candidate.trigger_time_mjd(), Some(jd_to_mjd(2459778.0)));
    }

    #[test]
    fn parse_rejects_malformed_rows() {
        let dir = tempdir().unwrap();
        let path = write_fixture(
            dir.path(),
            "lc_ZTFbad_forced1_stacked0.csv",
            ",jd,mag,mag_unc,filter,limmag\n0,not-a-number,18.5,0.1,g,20.5\n",
        );

        assert!(matches!(
            parse_photometry(&path, "ZTFbad"),
            Err(CandidateError::Malformed(_))
        ));
    }

    #[test]
    fn dat_output_format() {
        let dir = tempdir().unwrap();
        let path = write_fixture(dir.path(), "lc_ZTFdat_forced1_stacked0.csv", FIXTURE);

        let candidate = parse_photometry(&path, "ZTFdat").unwrap();
        let dat = candidate.write_dat(dir.path()).unwrap();
        let contents = std::fs::read_to_string(&dat).unwrap();
        let lines: Vec<&str> = contents.lines().collect();

        assert_eq!(dat.file_name().unwrap(), "ZTFdat.dat");
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], "2022-07-17T12:00:00.000 r 18.7 0.2");
        assert!(lines[2].ends_with("g 21 inf"));
    }
}
