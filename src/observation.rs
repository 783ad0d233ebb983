use chrono::{NaiveDateTime, TimeDelta};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::fits::{parse_iso_timestamp, FitsHeader};
use crate::utils::truncate_string;

/// Target names used for calibration exposures
pub const CALIBRATION_NAMES: [&str; 8] = [
    "biases",
    "autofocus",
    "domeflats",
    "arcs",
    "test",
    "skyflats",
    "twilight",
    "twilights",
];

/// Longest exposure time accepted from a log or a header, one day
pub const MAX_EXPTIME_SECS: f64 = 86_400.0;

pub fn is_valid_exptime(seconds: f64) -> bool {
    seconds.is_finite() && (0.0..=MAX_EXPTIME_SECS).contains(&seconds)
}

/// Expected guide-star position on the guider, 1-based FITS pixel coordinates
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Fiducial {
    pub x: f64,
    pub y: f64,
}

impl Fiducial {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn offset(self, dx: f64, dy: f64) -> Self {
        Self {
            x: self.x + dx,
            y: self.y + dy,
        }
    }
}

/// One VIRUS-W exposure as noted in the observation log
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    /// File stem, `vw######`
    pub filename: String,
    /// Where the observation file is (or would be)
    pub fpath: PathBuf,
    pub target: String,
    /// Dither position, starting at 1
    pub dither: u32,
    /// UT start of the exposure
    pub start_time: NaiveDateTime,
    /// Exposure time in seconds
    pub exptime: Option<f64>,
    pub focus: Option<f64>,
    /// Seeing noted by the observer, arcsec
    pub fwhm_noted: Option<f64>,
    pub fiducial: Option<Fiducial>,
    pub airmass: Option<f64>,
    pub comments: String,
    /// Log line this observation was parsed from
    pub log_line: Option<usize>,
}

impl Observation {
    /// UT end of the exposure, whole seconds after the start. None without
    /// a usable exposure time.
    pub fn end_time(&self) -> Option<NaiveDateTime> {
        let seconds = self.exptime.filter(|&t| is_valid_exptime(t))?;
        TimeDelta::try_seconds(seconds as i64)
            .and_then(|delta| self.start_time.checked_add_signed(delta))
    }

    /// Inclusive `[start, end]` window, absent without an exposure time
    pub fn time_window(&self) -> Option<(NaiveDateTime, NaiveDateTime)> {
        self.end_time().map(|end| (self.start_time, end))
    }

    pub fn contains(&self, timestamp: NaiveDateTime) -> bool {
        match self.time_window() {
            Some((start, end)) => start <= timestamp && timestamp <= end,
            None => false,
        }
    }

    /// Sky observations have an airmass
    pub fn is_sky_obs(&self) -> bool {
        self.airmass.is_some()
    }

    pub fn is_calibration(&self) -> bool {
        let target = self.target.to_lowercase();
        CALIBRATION_NAMES.iter().any(|name| target.contains(name))
    }

    pub fn file_available(&self) -> bool {
        self.fpath.is_file()
    }

    pub fn long_name(&self) -> String {
        format!(
            "{} ({}, {} UT, dither {})",
            self.target,
            self.filename,
            self.start_time.format("%Y-%m-%d %H:%M:%S"),
            self.dither
        )
    }

    pub fn trimmed_comments(&self) -> String {
        truncate_string(&self.comments, 60)
    }

    pub fn summary(&self) -> String {
        let mut s = format!("Observation: {}\n", self.filename);
        s.push_str(&format!("  Target: {}, dither {}\n", self.target, self.dither));
        match self.time_window() {
            Some((start, end)) => s.push_str(&format!(
                "  Time slot: {} to {} ({} s)\n",
                start.format("%Y-%m-%d %H:%M:%S"),
                end.format("%H:%M:%S"),
                (end - start).num_seconds()
            )),
            None => s.push_str(&format!(
                "  Start time (UT): {}\n",
                self.start_time.format("%Y-%m-%dT%H:%M:%S")
            )),
        }
        if let Some(airmass) = self.airmass {
            s.push_str(&format!("  Airmass: {:.2}\n", airmass));
        }
        if let Some(fwhm) = self.fwhm_noted {
            s.push_str(&format!("  FWHM: {:.2} arcsec\n", fwhm));
        }
        if let Some(exptime) = self.exptime {
            s.push_str(&format!("  Exposure time per frame: {:.1} s\n", exptime));
        }
        if !self.comments.is_empty() {
            s.push_str(&format!("  Comments: {}\n", self.comments));
        }
        match self.fiducial {
            Some(fid) => s.push_str(&format!("  Fiducial coords: ({:.1}, {:.1})\n", fid.x, fid.y)),
            None => s.push_str("  Fiducial coords: none\n"),
        }
        s
    }

    /// Refine a log entry with the values recorded in the observation file's header.
    /// Fields missing from the header keep their logged value.
    pub fn with_header(&self, header: &FitsHeader) -> Observation {
        let mut refreshed = self.clone();

        if let Some(start) = header.get("DATE-OBS").and_then(parse_iso_timestamp) {
            refreshed.start_time = start;
        }
        if let Some(object) = header.get("OBJECT") {
            let (target, dither) = parse_object_keyword(object);
            refreshed.target = target;
            refreshed.dither = dither;
        }
        if let Some(exptime) = header.get_f64("EXPTIME").filter(|&t| is_valid_exptime(t)) {
            refreshed.exptime = Some(exptime);
        }
        if let Some(focus) = header.get_f64("FOCUS") {
            refreshed.focus = Some(focus);
        }
        if let Some(airmass) = header.get_f64("AIRMASS") {
            refreshed.airmass = Some(airmass);
        }
        refreshed
    }

    pub fn to_record(&self) -> ObservationRecord {
        ObservationRecord {
            filename: self.filename.clone(),
            fpath: self.fpath.display().to_string(),
            fpath_available: self.file_available(),
            dither: self.dither,
            target: self.target.clone(),
            start_time_ut: self.start_time,
            exptime: self.exptime,
            focus: self.focus,
            fwhm_noted: self.fwhm_noted,
            fiducial_x: self.fiducial.map(|f| f.x),
            fiducial_y: self.fiducial.map(|f| f.y),
            airmass_noted: self.airmass,
            comments: self.comments.clone(),
            log_line: self.log_line,
        }
    }

    pub fn from_record(record: ObservationRecord) -> Result<Observation, String> {
        let fiducial = match (record.fiducial_x, record.fiducial_y) {
            (Some(x), Some(y)) => Some(Fiducial::new(x, y)),
            (None, None) => None,
            _ => return Err("fiducial_x and fiducial_y must both be set or both be empty".into()),
        };
        if record.dither == 0 {
            return Err("dither must be at least 1".into());
        }
        Ok(Observation {
            filename: record.filename,
            fpath: PathBuf::from(record.fpath),
            target: record.target,
            dither: record.dither,
            start_time: record.start_time_ut,
            exptime: record.exptime,
            focus: record.focus,
            fwhm_noted: record.fwhm_noted,
            fiducial,
            airmass: record.airmass_noted,
            comments: record.comments,
            log_line: record.log_line,
        })
    }
}

/// `OBJECT` keywords look like `"NGC 1234 dither 1"` with a 0-based dither
fn parse_object_keyword(object: &str) -> (String, u32) {
    let mut parts = object.splitn(2, "dither");
    let target = parts
        .next()
        .unwrap_or_default()
        .trim()
        .replace("PGC", "P");
    let dither = parts
        .next()
        .and_then(|d| d.trim().parse::<u32>().ok())
        .and_then(|d| d.checked_add(1))
        .unwrap_or(1);
    (target, dither)
}

/// Default location of an observation file when it has not been found on disk
pub fn default_observation_path(observation_dir: &Path, filename: &str) -> PathBuf {
    observation_dir.join(format!("{}.fits", filename))
}

/// Flat CSV row for an [`Observation`]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ObservationRecord {
    pub filename: String,
    pub fpath: String,
    #[serde(default)]
    pub fpath_available: bool,
    pub dither: u32,
    pub target: String,
    pub start_time_ut: NaiveDateTime,
    pub exptime: Option<f64>,
    pub focus: Option<f64>,
    pub fwhm_noted: Option<f64>,
    pub fiducial_x: Option<f64>,
    pub fiducial_y: Option<f64>,
    pub airmass_noted: Option<f64>,
    pub comments: String,
    #[serde(default)]
    pub log_line: Option<usize>,
}
