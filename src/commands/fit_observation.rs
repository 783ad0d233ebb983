use anyhow::{Context, Result};
use std::path::Path;
use tracing::warn;

use super::common::{find_observation, load_config, load_observations, load_or_build_index};
use crate::config::Config;
use crate::guider_index::{load_index, GuiderIndex};
use crate::guider_sequence::{AggregateFit, GuiderSequence};
use crate::plotting::guider_plots::{
    frame_plot_name, plot_cutout_animation, plot_frame_diagnostic, plot_observation_summary,
    render_animation_frame, ANIMATION_NAME,
};
use crate::utils::{format_opt, truncate_string};

/// The persisted index when there is one, otherwise a fresh scan
fn open_index(config: &Config) -> Result<GuiderIndex> {
    let index_path = config.guider_index_path();
    if index_path.is_file() {
        return load_index(&config.paths.guider_dir, &index_path)
            .with_context(|| format!("Failed to load guider index {}", index_path.display()));
    }
    Ok(load_or_build_index(config)?.0)
}

pub fn fit_observation(
    config_path: Option<&Path>,
    name: &str,
    follow_star: bool,
    plot: bool,
) -> Result<()> {
    let mut config = load_config(config_path)?;
    if follow_star {
        config.analysis.follow_star = true;
    }
    let (sequence, _) = load_observations(&config, false, false, None)?;
    let observation = find_observation(&sequence, name)?;
    let index = open_index(&config)?;

    let plot_dir = config.observation_plot_dir(&observation.filename);
    let settings = &config.analysis;
    let mut animation = Vec::new();
    let fitted = GuiderSequence::fit_with(observation, &index, settings, |frame| {
        if !plot {
            return;
        }
        animation.extend(render_animation_frame(&frame));
        let path = plot_dir.join(frame_plot_name(frame.result.frame_index));
        if let Err(e) = plot_frame_diagnostic(&frame, &observation.filename, settings, &path) {
            warn!("{}", e);
        }
    })
    .with_context(|| format!("Cannot fit {}", observation.filename))?;
    let aggregate = fitted.aggregate(settings);

    println!("{}\n", observation.summary());
    output_table(&fitted);
    output_aggregate(&aggregate);

    if plot {
        let summary = plot_dir.join("summary.png");
        plot_observation_summary(&fitted, &aggregate, settings, &summary)
            .with_context(|| format!("Failed to plot {}", summary.display()))?;
        if !animation.is_empty() {
            let gif = plot_dir.join(ANIMATION_NAME);
            plot_cutout_animation(&animation, &gif)
                .with_context(|| format!("Failed to write {}", gif.display()))?;
        }
        println!("\nPlots written to {}", plot_dir.display());
    }
    Ok(())
}

fn output_table(sequence: &GuiderSequence) {
    println!(
        "{:>5} {:<28} {:<12} {:>8} {:>8} {:>7} {:>7} {:>10} {:>6} {:<30}",
        "Frame", "File", "Time (UT)", "X", "Y", "FWHM px", "FWHM\"", "Flux/s", "R2", "Problem"
    );
    println!("{:-<140}", "");

    for result in &sequence.results {
        let star = result.star();
        println!(
            "{:>5} {:<28} {:<12} {:>8} {:>8} {:>7} {:>7} {:>10} {:>6} {:<30}",
            result.frame_index,
            truncate_string(&result.file_name(), 28),
            result.timestamp.format("%H:%M:%S%.3f"),
            format_opt(star.map(|s| s.x), 2),
            format_opt(star.map(|s| s.y), 2),
            format_opt(star.map(|s| s.fwhm_pix), 2),
            format_opt(star.map(|s| s.fwhm_arcsec), 2),
            format_opt(star.and_then(|s| s.flux_rate), 0),
            format_opt(star.map(|s| s.r_squared), 3),
            result.failure().map(|f| f.to_string()).unwrap_or_default(),
        );
    }

    println!(
        "\nTotal: {} frames, {} fitted",
        sequence.len(),
        sequence.successes().count()
    );
}

fn output_aggregate(aggregate: &AggregateFit) {
    let Some(stats) = aggregate.stats() else {
        println!("No aggregate: none of the frames could be fitted");
        return;
    };
    println!(
        "Centroid:  x = {:.2} ± {:.2}, y = {:.2} ± {:.2} ({} of {} kept)",
        stats.centroid_x_mean,
        stats.centroid_x_std,
        stats.centroid_y_mean,
        stats.centroid_y_std,
        stats.n_centroids_kept,
        stats.n_fits
    );
    println!(
        "FWHM:      {:.2} ± {:.2} px, {:.2} ± {:.2} arcsec ({} of {} kept)",
        stats.fwhm_pix_mean,
        stats.fwhm_pix_std,
        stats.fwhm_arcsec_mean,
        stats.fwhm_arcsec_std,
        stats.n_fwhm_kept,
        stats.n_fits
    );
    println!(
        "Flux rate: {} ± {} counts/s",
        format_opt(stats.flux_rate_mean, 0),
        format_opt(stats.flux_rate_std, 0)
    );
}
