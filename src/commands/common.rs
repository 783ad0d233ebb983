//! Loading steps shared by several commands
use anyhow::{bail, Context, Result};
use std::io::Write;
use std::path::Path;
use tracing::info;

use crate::config::Config;
use crate::error::LogFormatError;
use crate::guider_index::{build_index, GuiderIndex, IndexBuildOptions, IndexBuildReport};
use crate::log_parsing::{parse_log_file, parse_vw_filenames, sanitize_log, LogParseOptions};
use crate::observation::Observation;
use crate::observation_sequence::ObservationSequence;
use crate::utils::write_atomically;

/// Locate, load and validate the configuration
pub fn load_config(explicit: Option<&Path>) -> Result<Config> {
    let path = Config::locate(explicit)?;
    let config = Config::load(&path)
        .with_context(|| format!("Failed to load configuration {}", path.display()))?;
    config.validate()?;
    info!("Using configuration {}", path.display());
    Ok(config)
}

/// Observations from `observations_raw.csv`, or parsed from the log when the
/// table does not exist yet, `reload` is set or an explicit log is given.
/// Parsing writes the raw table and the sanitized log and returns the
/// rejected lines.
pub fn load_observations(
    config: &Config,
    reload: bool,
    strict: bool,
    log_file: Option<&Path>,
) -> Result<(ObservationSequence, Vec<LogFormatError>)> {
    let raw_csv = config.raw_observations_csv();
    if !reload && log_file.is_none() && raw_csv.is_file() {
        let sequence = ObservationSequence::load_csv(&raw_csv)
            .with_context(|| format!("Failed to load {}", raw_csv.display()))?;
        info!("Loaded {} observations from {}", sequence.len(), raw_csv.display());
        return Ok((sequence, Vec::new()));
    }

    let log = log_file
        .map(Path::to_path_buf)
        .unwrap_or_else(|| config.log_file());
    let options = LogParseOptions {
        strict,
        exposure_overhead_secs: config.analysis.exposure_overhead_secs,
        observation_dir: Some(config.paths.observation_dir.clone()),
    };
    let parsed = parse_log_file(&log, &options)
        .with_context(|| format!("Invalid observation log {}", log.display()))?;
    if parsed.observations.is_empty() {
        bail!("No valid observations in {}", log.display());
    }

    let sequence = ObservationSequence::new(parsed.observations);
    sequence.save_csv(&raw_csv)?;
    info!("Wrote {} observations to {}", sequence.len(), raw_csv.display());

    let text = std::fs::read_to_string(&log)
        .with_context(|| format!("Failed to read {}", log.display()))?;
    let sanitized_path = config.sanitized_log_path();
    write_atomically(&sanitized_path, |file| file.write_all(sanitize_log(&text).as_bytes()))
        .with_context(|| format!("Failed to write {}", sanitized_path.display()))?;

    Ok((sequence, parsed.errors))
}

/// Bring the persisted guider index up to date
pub fn load_or_build_index(config: &Config) -> Result<(GuiderIndex, IndexBuildReport)> {
    let index_path = config.guider_index_path();
    build_index(
        &config.paths.guider_dir,
        &index_path,
        &IndexBuildOptions::default(),
    )
    .with_context(|| format!("Failed to build guider index {}", index_path.display()))
}

/// Look up one observation by `vw######` name or bare number
pub fn find_observation<'a>(sequence: &'a ObservationSequence, name: &str) -> Result<&'a Observation> {
    let names = parse_vw_filenames(name).map_err(anyhow::Error::msg)?;
    let [single] = names.as_slice() else {
        bail!("'{}' names {} observations, expected one", name, names.len());
    };
    sequence
        .find(single)
        .with_context(|| format!("Observation {} is not in the log", single))
}
