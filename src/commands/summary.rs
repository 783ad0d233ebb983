use anyhow::{bail, Context, Result};
use std::collections::HashMap;
use std::path::Path;
use tracing::warn;

use super::common::{load_config, load_observations};
use crate::guider_sequence::{load_processed_csv, ProcessedRecord};
use crate::observation_sequence::ObservationSequence;
use crate::utils::{format_opt, truncate_string};

pub fn show_summary(config_path: Option<&Path>, target: Option<&str>, format: &str) -> Result<()> {
    let config = load_config(config_path)?;
    let (sequence, log_errors) = load_observations(&config, false, false, None)?;
    if !log_errors.is_empty() {
        warn!("{} log lines were rejected, see `process` for details", log_errors.len());
    }

    let sequence = match target {
        Some(t) => {
            let selected = sequence.for_target(t, None, None);
            if selected.is_empty() {
                bail!("No observations of target '{}'", t);
            }
            selected
        }
        None => sequence,
    };

    // fit results are only there after a `process` run
    let processed_csv = config.processed_observations_csv();
    let fits: HashMap<String, ProcessedRecord> = if processed_csv.is_file() {
        load_processed_csv(&processed_csv)
            .with_context(|| format!("Failed to load {}", processed_csv.display()))?
            .into_iter()
            .map(|r| (r.filename.clone(), r))
            .collect()
    } else {
        HashMap::new()
    };

    match format {
        "json" => output_json(&sequence, &fits)?,
        "csv" => output_csv(&sequence, &fits)?,
        _ => output_table(&sequence, &fits)?,
    }
    Ok(())
}

fn output_table(sequence: &ObservationSequence, fits: &HashMap<String, ProcessedRecord>) -> Result<()> {
    println!("{}", sequence.summary(Some(100)));
    println!(
        "{:<10} {:<16} {:>3} {:<19} {:>6} {:>8} {:>8} {:>6} {:>6} {:>7} {:<30}",
        "File", "Target", "D", "Start (UT)", "Exp", "Fid X", "Fid Y", "Airm", "Noted", "FWHM\"", "Comments"
    );
    println!("{:-<140}", "");

    for obs in sequence {
        let fit = fits.get(&obs.filename);
        println!(
            "{:<10} {:<16} {:>3} {:<19} {:>6} {:>8} {:>8} {:>6} {:>6} {:>7} {:<30}",
            obs.filename,
            truncate_string(&obs.target, 16),
            obs.dither,
            obs.start_time.format("%Y-%m-%d %H:%M:%S"),
            format_opt(obs.exptime, 0),
            format_opt(obs.fiducial.map(|f| f.x), 1),
            format_opt(obs.fiducial.map(|f| f.y), 1),
            format_opt(obs.airmass, 2),
            format_opt(obs.fwhm_noted, 1),
            format_opt(fit.and_then(|f| f.fwhm_arcsec_mean), 2),
            truncate_string(&obs.trimmed_comments(), 30),
        );
    }

    println!("\nTotal: {} observations", sequence.len());
    Ok(())
}

fn output_json(sequence: &ObservationSequence, fits: &HashMap<String, ProcessedRecord>) -> Result<()> {
    let rows: Vec<serde_json::Value> = sequence
        .iter()
        .map(|obs| {
            serde_json::json!({
                "observation": obs.to_record(),
                "end_time_ut": obs.end_time(),
                "is_sky_obs": obs.is_sky_obs(),
                "fit": fits.get(&obs.filename),
            })
        })
        .collect();

    println!("{}", serde_json::to_string_pretty(&rows)?);
    Ok(())
}

fn output_csv(sequence: &ObservationSequence, fits: &HashMap<String, ProcessedRecord>) -> Result<()> {
    let mut wtr = csv::Writer::from_writer(std::io::stdout());
    wtr.write_record([
        "filename",
        "target",
        "dither",
        "start_time_ut",
        "exptime",
        "fiducial_x",
        "fiducial_y",
        "airmass_noted",
        "fwhm_noted",
        "status",
        "n_fits",
        "fwhm_arcsec_mean",
        "fwhm_arcsec_std",
        "comments",
    ])?;

    let opt = |v: Option<f64>| v.map(|v| v.to_string()).unwrap_or_default();
    for obs in sequence {
        let fit = fits.get(&obs.filename);
        wtr.write_record([
            obs.filename.clone(),
            obs.target.clone(),
            obs.dither.to_string(),
            obs.start_time.format("%Y-%m-%dT%H:%M:%S").to_string(),
            opt(obs.exptime),
            opt(obs.fiducial.map(|f| f.x)),
            opt(obs.fiducial.map(|f| f.y)),
            opt(obs.airmass),
            opt(obs.fwhm_noted),
            fit.map(|f| f.status.clone()).unwrap_or_default(),
            fit.map(|f| f.n_fits.to_string()).unwrap_or_default(),
            opt(fit.and_then(|f| f.fwhm_arcsec_mean)),
            opt(fit.and_then(|f| f.fwhm_arcsec_std)),
            obs.comments.clone(),
        ])?;
    }
    wtr.flush()?;
    Ok(())
}
