use anyhow::{Context, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use super::common::{load_config, load_observations, load_or_build_index};
use crate::config::Config;
use crate::dither_chunk::{all_chunks, save_chunks_csv};
use crate::error::PlotError;
use crate::fits::{write_image, CardValue};
use crate::guider_sequence::{
    save_processed_csv, AggregateFit, GuiderSequence, ProcessedRecord, StackedFrame,
};
use crate::observation_sequence::ObservationSequence;
use crate::plotting::guider_plots::{
    frame_plot_name, plot_cutout_animation, plot_dither_chunk_summary, plot_frame_diagnostic,
    plot_observation_summary, plot_stacked, render_animation_frame, ANIMATION_NAME,
};
use crate::report::BatchReport;
use crate::utils::format_opt;

#[derive(Debug, Clone, Default)]
pub struct ProcessOptions {
    /// Parse the log even when `observations_raw.csv` exists
    pub reload_log: bool,
    pub plots: bool,
    pub strict: bool,
    pub log_file: Option<PathBuf>,
}

/// Everything a pipeline run produced
#[derive(Debug)]
pub struct ProcessOutcome {
    pub observations: ObservationSequence,
    pub sequences: Vec<(GuiderSequence, AggregateFit)>,
    pub records: Vec<ProcessedRecord>,
    pub report: BatchReport,
}

/// Log, index, fits and plots for every observation in the log. Per-frame
/// and per-observation failures end up in the report; only configuration,
/// log and table errors abort the run.
pub fn run_pipeline(config: &Config, options: &ProcessOptions) -> Result<ProcessOutcome> {
    let log = options
        .log_file
        .clone()
        .unwrap_or_else(|| config.log_file());
    let mut report = BatchReport::new(&log);

    let (observations, log_errors) = load_observations(
        config,
        options.reload_log,
        options.strict,
        options.log_file.as_deref(),
    )?;
    report.observations = observations.len();
    report.record_log_errors(&log_errors);

    let chunks = all_chunks(&observations);
    let n_chunks = save_chunks_csv(chunks.values().flatten(), &config.dither_chunks_csv())?;
    info!("Wrote {} dither chunks", n_chunks);
    let chunk_of: HashMap<&str, usize> = chunks
        .values()
        .flatten()
        .flat_map(|chunk| {
            chunk
                .observations
                .iter()
                .map(move |obs| (obs.filename.as_str(), chunk.chunk_index))
        })
        .collect();

    let (index, index_report) = load_or_build_index(config)?;
    report.record_index(&index_report);

    let settings = &config.analysis;
    let mut sequences = Vec::new();
    let mut records = Vec::with_capacity(observations.len());
    for obs in &observations {
        let chunk_index = chunk_of.get(obs.filename.as_str()).copied();
        if !obs.is_sky_obs() {
            debug!("{}: not a sky observation, skipped", obs.filename);
            records.push(ProcessedRecord::new(obs, chunk_index, None));
            continue;
        }

        let plot_dir = config.observation_plot_dir(&obs.filename);
        let mut plot_errors: Vec<(String, PlotError)> = Vec::new();
        let mut animation = Vec::new();
        let fitted = GuiderSequence::fit_with(obs, &index, settings, |frame| {
            if !options.plots {
                return;
            }
            animation.extend(render_animation_frame(&frame));
            let path = plot_dir.join(frame_plot_name(frame.result.frame_index));
            if let Err(e) = plot_frame_diagnostic(&frame, &obs.filename, settings, &path) {
                plot_errors.push((
                    format!("{} frame {}", obs.filename, frame.result.frame_index),
                    e,
                ));
            }
        });
        for (context, e) in &plot_errors {
            report.record_plot_error(context, e);
        }

        let sequence = match fitted {
            Ok(sequence) => sequence,
            Err(e) => {
                warn!("{}", e);
                report.record_sequence_error(&e);
                records.push(ProcessedRecord::new(obs, chunk_index, None));
                continue;
            }
        };
        let aggregate = sequence.aggregate(settings);
        info!(
            "{}: {} of {} frames fitted, FWHM {}\"",
            obs.filename,
            sequence.successes().count(),
            sequence.len(),
            format_opt(aggregate.stats().map(|s| s.fwhm_arcsec_mean), 2)
        );
        report.record_sequence(&sequence, &aggregate);
        records.push(ProcessedRecord::new(obs, chunk_index, Some(&aggregate)));

        if options.plots {
            let summary = plot_dir.join("summary.png");
            if let Err(e) = plot_observation_summary(&sequence, &aggregate, settings, &summary) {
                report.record_plot_error(&format!("{} summary", obs.filename), &e);
            }
            if !animation.is_empty() {
                if let Err(e) = plot_cutout_animation(&animation, &plot_dir.join(ANIMATION_NAME)) {
                    report.record_plot_error(&format!("{} {}", obs.filename, ANIMATION_NAME), &e);
                }
            }
            if let Some(stack) = sequence.stack(settings) {
                if let Err(e) = write_stacked_fits(&stack, &obs.target, &plot_dir.join("stacked.fits")) {
                    report.record_plot_error(&format!("{} stacked.fits", obs.filename), &e);
                }
                let title = format!("{} STACK OF {}", obs.filename, stack.frames_used);
                if let Err(e) = plot_stacked(&stack, &title, &plot_dir.join("stacked.png")) {
                    report.record_plot_error(&format!("{} stacked.png", obs.filename), &e);
                }
            }
        }
        sequences.push((sequence, aggregate));
    }

    if options.plots {
        let chunk_dir = config.dither_chunk_plot_dir();
        for chunk in chunks.values().flatten() {
            let fitted: Vec<&GuiderSequence> = sequences
                .iter()
                .map(|(s, _)| s)
                .filter(|s| chunk.observations.find(&s.observation.filename).is_some())
                .collect();
            if fitted.is_empty() {
                continue;
            }
            let path = chunk_dir.join(chunk.plot_name());
            if let Err(e) = plot_dither_chunk_summary(chunk, &fitted, settings, &path) {
                report.record_plot_error(&chunk.plot_name(), &e);
            }
        }
    }

    let processed_csv = config.processed_observations_csv();
    save_processed_csv(&records, &processed_csv)?;
    info!("Wrote {}", processed_csv.display());

    let report_path = config.batch_report_path();
    report
        .save(&report_path)
        .with_context(|| format!("Failed to write {}", report_path.display()))?;

    Ok(ProcessOutcome {
        observations,
        sequences,
        records,
        report,
    })
}

fn write_stacked_fits(stack: &StackedFrame, target: &str, path: &Path) -> Result<(), PlotError> {
    let io_error = |source| PlotError::Io {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(io_error)?;
    }
    let data: Vec<f32> = stack.data.iter().map(|&v| v as f32).collect();
    write_image(
        path,
        stack.width,
        stack.height,
        &data,
        &[
            ("OBJECT", target.into()),
            ("NFRAMES", CardValue::Integer(stack.frames_used as i64)),
            ("BUNIT", "counts/s".into()),
        ],
    )
    .map_err(io_error)
}

pub fn process(config_path: Option<&Path>, options: ProcessOptions) -> Result<()> {
    let config = load_config(config_path)?;
    let outcome = run_pipeline(&config, &options)?;

    println!(
        "{:<10} {:<16} {:>6} {:<12} {:>7} {:>5} {:>9} {:>9} {:>8} {:>8}",
        "File", "Target", "Dither", "Status", "Frames", "Fits", "X", "Y", "FWHM\"", "Std"
    );
    println!("{:-<100}", "");
    for record in &outcome.records {
        println!(
            "{:<10} {:<16} {:>6} {:<12} {:>7} {:>5} {:>9} {:>9} {:>8} {:>8}",
            record.filename,
            crate::utils::truncate_string(&record.target, 16),
            record.dither,
            record.status,
            record.n_frames,
            record.n_fits,
            format_opt(record.centroid_x_mean, 2),
            format_opt(record.centroid_y_mean, 2),
            format_opt(record.fwhm_arcsec_mean, 2),
            format_opt(record.fwhm_arcsec_std, 2),
        );
    }
    println!("\nTotal: {} observations", outcome.records.len());
    println!();
    print!("{}", outcome.report.render());
    println!("\nResults written to {}", config.paths.output_dir.display());
    Ok(())
}
