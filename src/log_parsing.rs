//! Observation log parsing.
//!
//! The log is a plain text file written at the telescope. Only two kinds of
//! lines matter; everything else is free text and ignored:
//!
//! ```text
//! # date: 2024-11-02
//! vw004123-125 03:12 NGC1234_D1 600 3.10 1.4 320.5,241.0 1.12 light cirrus
//! ```
//!
//! Observation columns are `files UT target[_Dn] exptime focus FWHM fiducial
//! AM comments...`. A file range expands into one observation per file with
//! increasing dither position.
use chrono::{NaiveDate, NaiveDateTime, NaiveTime, TimeDelta};
use regex::Regex;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::error::{LogError, LogFormatError};
use crate::fits::FitsHeader;
use crate::observation::{
    default_observation_path, is_valid_exptime, Fiducial, Observation, CALIBRATION_NAMES,
    MAX_EXPTIME_SECS,
};

/// Number of whitespace-separated columns before the free-text comments
const FIXED_COLUMNS: usize = 8;
/// Lines expanding to more observations than this are probably typos
const MAX_EXPECTED_RANGE: usize = 20;
/// Largest dither position accepted in a `_Dn` target suffix
const MAX_DITHER: u32 = 99;
const DATE_PREFIX: &str = "# date:";

/// Guider fiducial shift for each dither position of the VIRUS-W pattern
const DITHER_OFFSETS: [(u32, f64, f64); 6] = [
    (1, 0.0, 0.0),
    (2, 5.3, 2.8),
    (3, 0.0, 5.6),
    (4, -1.5, 2.8),
    (5, 3.8, 0.0),
    (6, 3.8, 5.8),
];

#[derive(Debug, Clone)]
pub struct LogParseOptions {
    /// Fail on the first bad line instead of collecting errors
    pub strict: bool,
    /// Readout overhead added between the files of a range, seconds
    pub exposure_overhead_secs: f64,
    /// Directory searched (recursively) for `vw*.fits`; headers of found
    /// files refine the logged values
    pub observation_dir: Option<PathBuf>,
}

impl Default for LogParseOptions {
    fn default() -> Self {
        Self {
            strict: false,
            exposure_overhead_secs: 90.0,
            observation_dir: None,
        }
    }
}

/// Result of parsing a log: observations in file order plus every line that
/// was rejected
#[derive(Debug, Clone, Default)]
pub struct ParsedLog {
    pub observations: Vec<Observation>,
    pub errors: Vec<LogFormatError>,
    pub total_lines: usize,
    /// Date and observation lines
    pub relevant_lines: usize,
}

impl ParsedLog {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

struct LogGrammar {
    date_line: Regex,
    file_spec: Regex,
}

impl LogGrammar {
    fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            date_line: Regex::new(r"^#\s*date:\s*(\d{4}-\d{2}-\d{2})\s*$")?,
            file_spec: Regex::new(r"^(?:vw)?(\d+)(?:-(\d+))?$")?,
        })
    }

    fn parse_date(&self, line: &str, line_number: usize) -> Result<NaiveDate, LogFormatError> {
        let caps = self
            .date_line
            .captures(line.trim())
            .ok_or_else(|| LogFormatError::new(line_number, "date line must read '# date: YYYY-MM-DD'"))?;
        NaiveDate::parse_from_str(&caps[1], "%Y-%m-%d")
            .map_err(|e| LogFormatError::new(line_number, format!("invalid date '{}': {}", &caps[1], e)))
    }

    /// Expand `vw004123`, `vw004123-125` or `4123` into `vw######` names.
    /// The end of a range only replaces the trailing digits of the start.
    fn expand_files(&self, spec: &str) -> Result<Vec<String>, String> {
        let cleaned = spec.trim().to_lowercase().replace(".fits", "");
        let caps = self
            .file_spec
            .captures(&cleaned)
            .ok_or_else(|| format!("invalid file name or range '{}'", spec))?;
        let start: u64 = caps[1]
            .parse()
            .map_err(|_| format!("invalid file number in '{}'", spec))?;

        let Some(end_match) = caps.get(2) else {
            return Ok(vec![format!("vw{:06}", start)]);
        };
        let end_short: u64 = end_match
            .as_str()
            .parse()
            .map_err(|_| format!("invalid range end in '{}'", spec))?;
        let end_digits = end_short.to_string();
        let start_digits = start.to_string();
        let prefix = start_digits
            .get(..start_digits.len().saturating_sub(end_digits.len()))
            .unwrap_or("");
        let end: u64 = format!("{}{}", prefix, end_digits)
            .parse()
            .map_err(|_| format!("invalid range end in '{}'", spec))?;
        if end <= start {
            return Err(format!("invalid file range '{}': end is not after start", spec));
        }
        Ok((start..=end).map(|n| format!("vw{:06}", n)).collect())
    }
}

/// Expand a file name or range like `vw004123-125` into single file stems
pub fn parse_vw_filenames(spec: &str) -> Result<Vec<String>, String> {
    let grammar = LogGrammar::new().map_err(|e| e.to_string())?;
    grammar.expand_files(spec)
}

pub fn parse_log_file(path: &Path, options: &LogParseOptions) -> Result<ParsedLog, LogError> {
    let text = std::fs::read_to_string(path).map_err(|source| LogError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let available = match &options.observation_dir {
        Some(dir) => find_observation_files(dir),
        None => HashMap::new(),
    };
    parse_log_text(&text, path, options, &available)
}

/// Parse log text. `available` maps file stems to observation files on disk.
pub fn parse_log_text(
    text: &str,
    source: &Path,
    options: &LogParseOptions,
    available: &HashMap<String, PathBuf>,
) -> Result<ParsedLog, LogError> {
    let grammar = LogGrammar::new()?;
    let lines: Vec<&str> = text.lines().collect();
    check_date_order(&grammar, &lines, source)?;

    let relevant: Vec<(usize, &str)> = lines
        .iter()
        .enumerate()
        .map(|(i, line)| (i + 1, *line))
        .filter(|(_, line)| is_observation_line(line) || is_date_line(line))
        .collect();
    if relevant.iter().all(|(_, line)| is_date_line(line)) {
        return Err(LogError::NoObservations(source.to_path_buf()));
    }
    info!(
        "Filtered log lines: {} out of {} kept",
        relevant.len(),
        lines.len()
    );

    let observation_dir = options
        .observation_dir
        .clone()
        .unwrap_or_else(|| PathBuf::from("."));
    let mut parsed = ParsedLog {
        total_lines: lines.len(),
        relevant_lines: relevant.len(),
        ..Default::default()
    };
    let mut seen: HashSet<String> = HashSet::new();
    let mut current_date: Option<NaiveDate> = None;

    for (line_number, line) in relevant {
        let result = if is_date_line(line) {
            grammar.parse_date(line, line_number).map(|date| {
                current_date = Some(date);
                Vec::new()
            })
        } else {
            match current_date {
                None => Err(LogFormatError::new(
                    line_number,
                    "observation line before the first '# date:' line",
                )),
                Some(date) => parse_observation_line(
                    &grammar,
                    line,
                    date,
                    line_number,
                    options.exposure_overhead_secs,
                )
                .and_then(|entries| reject_duplicates(entries, &seen, line_number)),
            }
        };

        match result {
            Ok(entries) => {
                if entries.len() > MAX_EXPECTED_RANGE {
                    warn!(
                        "Line {} yielded {} observations, which seems excessive; check the log there",
                        line_number,
                        entries.len()
                    );
                }
                for entry in entries {
                    seen.insert(entry.filename.clone());
                    parsed
                        .observations
                        .push(locate_file(entry, &observation_dir, available));
                }
            }
            Err(e) => {
                if options.strict {
                    return Err(LogError::Line(e));
                }
                warn!("Could not parse {}\n\t{}", e, line.trim());
                parsed.errors.push(e);
            }
        }
    }

    info!(
        "Parsed {} observations from {} ({} rejected lines)",
        parsed.observations.len(),
        source.display(),
        parsed.errors.len()
    );
    Ok(parsed)
}

fn is_date_line(line: &str) -> bool {
    line.starts_with(DATE_PREFIX)
}

fn is_observation_line(line: &str) -> bool {
    line.starts_with("vw")
}

/// Consecutive dates may step back by at most two days or forward by one
fn check_date_order(grammar: &LogGrammar, lines: &[&str], source: &Path) -> Result<(), LogError> {
    let mut previous: Option<NaiveDate> = None;
    let mut any = false;
    for (i, line) in lines.iter().enumerate() {
        if !is_date_line(line) {
            continue;
        }
        any = true;
        // Malformed date lines are reported by the line parser
        let Ok(date) = grammar.parse_date(line, i + 1) else {
            continue;
        };
        if let Some(prev) = previous {
            let delta = (date - prev).num_days();
            if !(-2..=1).contains(&delta) {
                return Err(LogError::DateOrder { line: i + 1, delta });
            }
        }
        previous = Some(date);
    }
    if any {
        Ok(())
    } else {
        Err(LogError::NoDates(source.to_path_buf()))
    }
}

fn reject_duplicates(
    entries: Vec<Observation>,
    seen: &HashSet<String>,
    line_number: usize,
) -> Result<Vec<Observation>, LogFormatError> {
    let duplicates: Vec<&str> = entries
        .iter()
        .map(|o| o.filename.as_str())
        .filter(|name| seen.contains(*name))
        .collect();
    if duplicates.is_empty() {
        Ok(entries)
    } else {
        Err(LogFormatError::new(
            line_number,
            format!("duplicate file name(s): {}", duplicates.join(", ")),
        ))
    }
}

/// Attach the file path and, when the file exists, refine with its header
fn locate_file(
    mut observation: Observation,
    observation_dir: &Path,
    available: &HashMap<String, PathBuf>,
) -> Observation {
    match available.get(&observation.filename) {
        Some(path) => {
            observation.fpath = path.clone();
            match FitsHeader::read(path) {
                Ok(header) => observation.with_header(&header),
                Err(e) => {
                    warn!("Keeping logged values for {}: {}", observation.filename, e);
                    observation
                }
            }
        }
        None => {
            observation.fpath = default_observation_path(observation_dir, &observation.filename);
            observation
        }
    }
}

fn parse_observation_line(
    grammar: &LogGrammar,
    line: &str,
    date: NaiveDate,
    line_number: usize,
    overhead_secs: f64,
) -> Result<Vec<Observation>, LogFormatError> {
    let err = |msg: String| LogFormatError::new(line_number, msg);
    let parts: Vec<&str> = line.split_whitespace().collect();
    if parts.len() < FIXED_COLUMNS {
        return Err(err(format!(
            "only {} columns, expected at least {}",
            parts.len(),
            FIXED_COLUMNS
        )));
    }

    let files = grammar.expand_files(parts[0]).map_err(err)?;
    let ut = parse_ut(parts[1]).map_err(err)?;
    let (target, base_dither) = parse_target_and_dither(parts[2]).map_err(err)?;
    let exptime = parse_number(parts[3], "exptime").map_err(err)?;
    if let Some(t) = exptime.filter(|&t| !is_valid_exptime(t)) {
        return Err(err(format!(
            "exposure time {} s outside 0 to {} s",
            t, MAX_EXPTIME_SECS
        )));
    }
    let focus = parse_number(parts[4], "focus").map_err(err)?;
    let fwhm = parse_number(parts[5], "FWHM").map_err(err)?;
    let fiducial = parse_fiducial(parts[6]).map_err(err)?;
    let airmass = parse_number(parts[7], "AM").map_err(err)?;
    let comments = match parts[FIXED_COLUMNS..].join(" ") {
        c if c == "-" => String::new(),
        c => c,
    };

    let is_calibration = CALIBRATION_NAMES.contains(&target.to_lowercase().as_str());
    let base_start = NaiveDateTime::new(date, ut);

    let mut observations = Vec::with_capacity(files.len());
    for (i, filename) in files.into_iter().enumerate() {
        let dither = u32::try_from(i)
            .ok()
            .and_then(|i| base_dither.checked_add(i))
            .ok_or_else(|| err("dither position overflows in file range".to_string()))?;
        let fiducial = match fiducial {
            Some(fid) if !is_calibration && dither != base_dither => {
                Some(apply_dither_offset(fid, dither).map_err(err)?)
            }
            other => other,
        };
        // Only approximate: the real start is refined from the file header
        let start_time = match exptime {
            Some(t) => offset_start(base_start, (t + overhead_secs) * i as f64)
                .ok_or_else(|| err(format!("start time of file {} out of range", i + 1)))?,
            None => base_start,
        };
        observations.push(Observation {
            filename,
            fpath: PathBuf::new(),
            target: target.clone(),
            dither,
            start_time,
            exptime,
            focus,
            fwhm_noted: fwhm,
            fiducial,
            airmass,
            comments: comments.clone(),
            log_line: Some(line_number),
        });
    }
    debug!("Line {}: {} observation(s) of {}", line_number, observations.len(), target);
    Ok(observations)
}

fn offset_start(base: NaiveDateTime, seconds: f64) -> Option<NaiveDateTime> {
    let ms = (seconds * 1000.0).round();
    if !ms.is_finite() || ms.abs() > i64::MAX as f64 / 2.0 {
        return None;
    }
    TimeDelta::try_milliseconds(ms as i64).and_then(|delta| base.checked_add_signed(delta))
}

fn parse_ut(s: &str) -> Result<NaiveTime, String> {
    let parts: Vec<&str> = s.split(':').collect();
    if parts.len() != 2 && parts.len() != 3 {
        return Err(format!("UT '{}' must be HH:MM or HH:MM:SS", s));
    }
    let mut values = [0u32; 3];
    for (slot, part) in values.iter_mut().zip(parts.iter()) {
        *slot = part
            .parse()
            .map_err(|_| format!("UT '{}' contains invalid values", s))?;
    }
    NaiveTime::from_hms_opt(values[0], values[1], values[2])
        .ok_or_else(|| format!("UT '{}' contains invalid values", s))
}

/// `M52` → (M52, 1), `M52_D2` → (M52, 2), `M52_3` → (M52, 3)
fn parse_target_and_dither(s: &str) -> Result<(String, u32), String> {
    let Some((name, dither_str)) = s.rsplit_once('_') else {
        return Ok((s.to_string(), 1));
    };
    let dither: u32 = dither_str
        .to_lowercase()
        .trim_start_matches('d')
        .parse()
        .map_err(|_| format!("could not parse dither position from target '{}'", s))?;
    if dither == 0 || dither > MAX_DITHER {
        return Err(format!(
            "dither position must be between 1 and {} (target '{}')",
            MAX_DITHER, s
        ));
    }
    Ok((name.to_string(), dither))
}

/// Numbers may be unknown (`-`, `auto`) or carry a repeat count (`120x6`)
fn parse_number(s: &str, column: &str) -> Result<Option<f64>, String> {
    if s.is_empty() || s == "-" || s.eq_ignore_ascii_case("auto") {
        return Ok(None);
    }
    let value = s.split('x').next().unwrap_or(s);
    value
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .map(Some)
        .ok_or_else(|| format!("could not convert '{}' to a number in column {}", s, column))
}

fn parse_fiducial(s: &str) -> Result<Option<Fiducial>, String> {
    if s.is_empty() || s == "-" {
        return Ok(None);
    }
    let parsed = s
        .split_once(',')
        .and_then(|(x, y)| Some(Fiducial::new(x.parse().ok()?, y.parse().ok()?)));
    match parsed {
        Some(fid) if fid.x.is_finite() && fid.y.is_finite() => Ok(Some(fid)),
        _ => Err(format!("fiducial '{}' must be 'x,y' with numeric values", s)),
    }
}

fn apply_dither_offset(fiducial: Fiducial, dither: u32) -> Result<Fiducial, String> {
    DITHER_OFFSETS
        .iter()
        .find(|(d, _, _)| *d == dither)
        .map(|&(_, dx, dy)| fiducial.offset(dx, dy))
        .ok_or_else(|| format!("dither position must be between 1 and 6, not {}", dither))
}

/// Map of `vw######` stems to files found anywhere below `observation_dir`
pub fn find_observation_files(observation_dir: &Path) -> HashMap<String, PathBuf> {
    let pattern = observation_dir.join("**").join("vw*.fits");
    let mut files = HashMap::new();
    let Ok(paths) = glob::glob(&pattern.to_string_lossy()) else {
        warn!("Invalid observation directory pattern {}", pattern.display());
        return files;
    };
    for path in paths.flatten() {
        if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
            files.insert(stem.to_string(), path.clone());
        }
    }
    debug!("Found {} observation files below {}", files.len(), observation_dir.display());
    files
}

/// Keep only date and observation lines, normalized
pub fn sanitize_log(text: &str) -> String {
    let mut out = String::new();
    for line in text.lines() {
        if is_date_line(line) {
            out.push_str(line.trim());
            out.push('\n');
        } else if is_observation_line(line) {
            out.push_str(&line.split_whitespace().collect::<Vec<_>>().join(" "));
            out.push('\n');
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(text: &str) -> ParsedLog {
        parse_log_text(text, Path::new("log.txt"), &LogParseOptions::default(), &HashMap::new()).unwrap()
    }

    #[test]
    fn test_file_ranges() {
        assert_eq!(parse_vw_filenames("vw004200").unwrap(), vec!["vw004200"]);
        assert_eq!(
            parse_vw_filenames("vw004123-125").unwrap(),
            vec!["vw004123", "vw004124", "vw004125"]
        );
        assert_eq!(
            parse_vw_filenames("vw001432-34").unwrap(),
            vec!["vw001432", "vw001433", "vw001434"]
        );
        assert_eq!(parse_vw_filenames("4123").unwrap(), vec!["vw004123"]);
        assert!(parse_vw_filenames("vw004125-123").is_err());
        assert!(parse_vw_filenames("vwabc").is_err());
    }

    #[test]
    fn test_well_formed_lines_in_file_order() {
        let log = "\
Night of 2024-11-02, observer notes
# date: 2024-11-02
vw004120 01:00 biases - - - - - -
vw004121 02:00 NGC1234 600 3.10 1.4 320.5,241.0 1.12 light cirrus
some free text between entries
vw004122 01:30:15 M52_D2 300 3.12 auto - 1.30 -
";
        let parsed = parse(log);
        assert!(parsed.is_clean());
        assert_eq!(parsed.total_lines, 6);
        assert_eq!(parsed.relevant_lines, 4);
        let names: Vec<_> = parsed.observations.iter().map(|o| o.filename.as_str()).collect();
        assert_eq!(names, vec!["vw004120", "vw004121", "vw004122"]);

        let obs = &parsed.observations[1];
        assert_eq!(obs.target, "NGC1234");
        assert_eq!(obs.exptime, Some(600.0));
        assert_eq!(obs.fiducial, Some(Fiducial::new(320.5, 241.0)));
        assert_eq!(obs.comments, "light cirrus");
        assert_eq!(obs.log_line, Some(4));
        assert_eq!(obs.fpath, PathBuf::from("./vw004121.fits"));

        let m52 = &parsed.observations[2];
        assert_eq!(m52.dither, 2);
        assert_eq!(m52.fwhm_noted, None);
        assert_eq!(m52.fiducial, None);
        assert_eq!(m52.comments, "");
        assert_eq!(m52.start_time.format("%H:%M:%S").to_string(), "01:30:15");
    }

    #[test]
    fn test_range_expands_dithers_times_and_offsets() {
        let log = "# date: 2024-11-02\nvw004123-125 03:00 NGC1234 120x6 3.1 1.4 100,200 1.1 -\n";
        let parsed = parse(log);
        assert_eq!(parsed.observations.len(), 3);
        let third = &parsed.observations[2];
        assert_eq!(third.filename, "vw004125");
        assert_eq!(third.dither, 3);
        assert_eq!(third.exptime, Some(120.0));
        // 2 * (120 s + 90 s overhead)
        assert_eq!(third.start_time.format("%H:%M:%S").to_string(), "03:07:00");
        let fid = third.fiducial.unwrap();
        assert_eq!(fid.x, 100.0);
        assert!((fid.y - 205.6).abs() < 1e-9);
        assert_eq!(parsed.observations[0].fiducial, Some(Fiducial::new(100.0, 200.0)));
    }

    #[test]
    fn test_calibration_ranges_keep_fiducial() {
        let log = "# date: 2024-11-02\nvw004123-124 03:00 arcs 10 - - 100,200 - -\n";
        let parsed = parse(log);
        assert_eq!(parsed.observations[1].dither, 2);
        assert_eq!(parsed.observations[1].fiducial, Some(Fiducial::new(100.0, 200.0)));
    }

    #[test]
    fn test_malformed_line_reports_line_number() {
        let log = "\
# date: 2024-11-02
vw004121 02:00 NGC1234 600 3.10 1.4 320,241 1.12 ok
vw004122 25:99 NGC1234 600 3.10 1.4 320,241 1.12 bad time
vw004123 02:30 NGC1234 600 3.10 1.4 320,241 1.12 ok again
";
        let parsed = parse(log);
        assert_eq!(parsed.observations.len(), 2);
        assert_eq!(parsed.errors.len(), 1);
        assert_eq!(parsed.errors[0].line, 3);
        assert!(parsed.errors[0].message.contains("UT"));
    }

    #[test]
    fn test_strict_mode_fails_on_first_error() {
        let log = "# date: 2024-11-02\nvw004121 02:00 NGC1234 abc 3.1 1.4 - 1.1 -\n";
        let options = LogParseOptions {
            strict: true,
            ..Default::default()
        };
        match parse_log_text(log, Path::new("log.txt"), &options, &HashMap::new()) {
            Err(LogError::Line(e)) => {
                assert_eq!(e.line, 2);
                assert!(e.message.contains("exptime"));
            }
            other => panic!("unexpected result: {:?}", other.map(|p| p.observations.len())),
        }
    }

    #[test]
    fn test_line_errors() {
        let log = "\
# date: 2024-11-02
vw004121 02:00 NGC1234
vw004122 02:00 NGC1234_D0 600 3.1 1.4 - 1.1 -
vw004123 02:00 NGC1234 600 3.1 1.4 12;4 1.1 -
vw004124-130 02:00 NGC1234_D2 600 3.1 1.4 1,1 1.1 -
vw004140 02:00 NGC1234 600 3.1 1.4 1,1 1.1 -
vw004140 02:10 NGC1234 600 3.1 1.4 1,1 1.1 -
";
        let parsed = parse(log);
        let lines: Vec<usize> = parsed.errors.iter().map(|e| e.line).collect();
        assert_eq!(lines, vec![2, 3, 4, 5, 7]);
        assert!(parsed.errors[3].message.contains("between 1 and 6"));
        assert!(parsed.errors[4].message.contains("duplicate"));
        assert_eq!(parsed.observations.len(), 1);
    }

    #[test]
    fn test_out_of_range_exptime_and_dither() {
        let log = "\
# date: 2024-11-02
vw000001 03:00 X 1e13 1 1 1,1 1 -
vw000002 03:00 X -5 1 1 1,1 1 -
vw000003-4 03:00 X_D4294967295 60 1 1 1,1 1 -
vw000005 03:00 X_D100 60 1 1 1,1 1 -
vw000006 03:00 X 86400 1 1 1,1 1 -
vw000007-8 03:00 biases_D99 86400 - - - - -
";
        let parsed = parse(log);
        let lines: Vec<usize> = parsed.errors.iter().map(|e| e.line).collect();
        assert_eq!(lines, vec![2, 3, 4, 5]);
        assert!(parsed.errors[0].message.contains("exposure time"));
        assert!(parsed.errors[1].message.contains("exposure time"));
        assert!(parsed.errors[2].message.contains("between 1 and 99"));

        assert_eq!(parsed.observations.len(), 3);
        let (start, end) = parsed.observations[0].time_window().unwrap();
        assert_eq!((end - start).num_seconds(), 86_400);
        let last = &parsed.observations[2];
        assert_eq!(last.dither, 100);
        assert_eq!(last.start_time.format("%Y-%m-%d %H:%M:%S").to_string(), "2024-11-03 03:01:30");
    }

    #[test]
    fn test_observation_before_first_date() {
        let log = "vw004121 02:00 NGC1234 600 3.1 1.4 - 1.1 -\n# date: 2024-11-02\nvw004122 02:00 NGC1234 600 3.1 1.4 - 1.1 -\n";
        let parsed = parse(log);
        assert_eq!(parsed.errors[0].line, 1);
        assert_eq!(parsed.observations.len(), 1);
    }

    #[test]
    fn test_file_level_errors() {
        let opts = LogParseOptions::default();
        let none = HashMap::new();
        let src = Path::new("log.txt");
        assert!(matches!(
            parse_log_text("vw004121 02:00 X 1 1 1 - 1 -\n", src, &opts, &none),
            Err(LogError::NoDates(_))
        ));
        assert!(matches!(
            parse_log_text("# date: 2024-11-02\nnothing here\n", src, &opts, &none),
            Err(LogError::NoObservations(_))
        ));
        assert!(matches!(
            parse_log_text("# date: 2024-11-02\n# date: 2024-11-05\nvw000001 01:00 X 1 1 1 - 1 -\n", src, &opts, &none),
            Err(LogError::DateOrder { line: 2, delta: 3 })
        ));
        // Newest night first is the usual layout
        assert!(parse_log_text(
            "# date: 2024-11-03\nvw000002 01:00 X 1 1 1 - 1 -\n# date: 2024-11-02\nvw000001 01:00 X 1 1 1 - 1 -\n",
            src,
            &opts,
            &none
        )
        .is_ok());
    }

    #[test]
    fn test_sanitize_log() {
        let text = "header\n# date: 2024-11-02  \nvw000001   01:00  X 1 1 1 - 1   some   note\nfree text\n";
        assert_eq!(
            sanitize_log(text),
            "# date: 2024-11-02\nvw000001 01:00 X 1 1 1 - 1 some note\n"
        );
    }

    #[test]
    fn test_header_refines_logged_values() {
        use crate::fits::{write_header_only, CardValue};
        let dir = tempfile::tempdir().unwrap();
        let raw = dir.path().join("night1");
        std::fs::create_dir_all(&raw).unwrap();
        write_header_only(
            &raw.join("vw004121.fits"),
            &[
                ("DATE-OBS", CardValue::from("2024-11-02T02:00:41.5")),
                ("OBJECT", CardValue::from("PGC1234 dither 1")),
                ("EXPTIME", CardValue::Real(610.0)),
            ],
        )
        .unwrap();

        let log_path = dir.path().join("log.txt");
        std::fs::write(&log_path, "# date: 2024-11-02\nvw004121 02:00 P1234 600 3.1 1.4 - 1.1 -\n").unwrap();
        let options = LogParseOptions {
            observation_dir: Some(dir.path().to_path_buf()),
            ..Default::default()
        };
        let parsed = parse_log_file(&log_path, &options).unwrap();
        let obs = &parsed.observations[0];
        assert_eq!(obs.fpath, raw.join("vw004121.fits"));
        assert_eq!(obs.target, "P1234");
        assert_eq!(obs.dither, 2);
        assert_eq!(obs.exptime, Some(610.0));
        assert_eq!(obs.start_time.format("%H:%M:%S%.3f").to_string(), "02:00:41.500");
        assert_eq!(obs.focus, Some(3.1));
    }
}
