//! Guide-star diagnostics: per frame, per observation, per dither chunk and
//! the stacked frame
use chrono::NaiveDateTime;
use image::{Rgb, RgbImage};
use imageproc::drawing::draw_hollow_rect_mut;
use imageproc::rect::Rect;
use std::path::Path;
use tracing::debug;

use super::stretch::{finite_range, Stretch, StretchParameters};
use super::text_render::{draw_text, draw_text_centered, draw_text_with_bg};
use super::{
    blank_canvas, draw_plus, draw_x, paint_grid, save_gif, save_png, Axes, ColorMap, BLUE,
    FOREGROUND, GREEN, GRID, ORANGE, PALETTE, RED,
};
use crate::clipping::{distance_clip_mask, sigma_clip_mask};
use crate::config::AnalysisConfig;
use crate::dither_chunk::DitherChunk;
use crate::error::PlotError;
use crate::guider_sequence::{AggregateFit, FrameInspection, GuiderSequence, StackedFrame};
use crate::psf_fitting::{PSFFitter, PixelWindow};
use crate::utils::{format_opt, truncate_string, wrap_line};

const CUTOUT_SIZE: u32 = 280;
const PANEL_SIZE: u32 = 150;
const ANIMATION_DELAY_MS: u32 = 200;

/// Cutout animation of one observation, next to its summary plot
pub const ANIMATION_NAME: &str = "guider_frames.gif";

pub fn frame_plot_name(frame_index: usize) -> String {
    format!("frame_{:03}.png", frame_index)
}

fn seconds_since(start: NaiveDateTime, t: NaiveDateTime) -> f64 {
    (t - start).num_milliseconds() as f64 / 1000.0
}

/// Linear 0..1 scaling over `range`; a flat range maps to 0.5
fn normalize(value: f64, range: (f64, f64)) -> f64 {
    if range.1 > range.0 {
        (value - range.0) / (range.1 - range.0)
    } else {
        0.5
    }
}

fn paint_panel(
    img: &mut RgbImage,
    left: u32,
    top: u32,
    window: &PixelWindow,
    color: impl Fn(f64) -> Rgb<u8>,
    label: &str,
) {
    let placed = paint_grid(img, left, top, (window.width, window.height, &window.data), PANEL_SIZE, color);
    placed.draw_border(img, GRID);
    draw_text_centered(img, left + PANEL_SIZE / 2, top + PANEL_SIZE + 6, label, FOREGROUND, 1);
}

/// Stretched cutout with the window center (`+`), the fit window and the
/// fitted centroid (`x`). False when the frame has no cutout.
fn paint_cutout(img: &mut RgbImage, left: u32, top: u32, frame: &FrameInspection<'_>) -> bool {
    let Some(cutout) = frame.cutout else {
        return false;
    };
    let result = frame.result;
    let stretch = Stretch::fit(&cutout.pixels.data, StretchParameters::default());
    let placed = paint_grid(
        img,
        left,
        top,
        (cutout.pixels.width, cutout.pixels.height, &cutout.pixels.data),
        CUTOUT_SIZE,
        |v| match &stretch {
            Some(s) => ColorMap::Grayscale.color(s.apply(v)),
            None => ColorMap::Grayscale.color(f64::NAN),
        },
    );
    placed.draw_border(img, GRID);

    if let Some(detail) = frame.detail {
        let (wx, wy) = detail.window_origin;
        let x0 = placed.left as f64 + wx as f64 * placed.scale;
        let y0 = placed.top as f64 + wy as f64 * placed.scale;
        let w = (detail.window.width as f64 * placed.scale).round() as u32;
        let h = (detail.window.height as f64 * placed.scale).round() as u32;
        if w > 0 && h > 0 {
            draw_hollow_rect_mut(img, Rect::at(x0 as i32, y0 as i32).of_size(w, h), ORANGE);
        }
    }
    let (gx, gy) = cutout.from_frame(result.guess.x, result.guess.y);
    draw_plus(img, placed.to_canvas(gx, gy), 6.0, GREEN);
    if let Some(star) = result.star() {
        let (sx, sy) = cutout.from_frame(star.x, star.y);
        draw_x(img, placed.to_canvas(sx, sy), 5.0, RED);
    }
    draw_text_centered(
        img,
        left + CUTOUT_SIZE / 2,
        top + CUTOUT_SIZE + 6,
        &format!("CUTOUT AT ({}, {})", cutout.origin.0 + 1, cutout.origin.1 + 1),
        FOREGROUND,
        1,
    );
    true
}

/// Cutout with the window center (`+`) and fitted centroid (`x`), followed
/// by observed, model and residual panels of the fit window
pub fn plot_frame_diagnostic(
    frame: &FrameInspection<'_>,
    observation: &str,
    settings: &AnalysisConfig,
    path: &Path,
) -> Result<(), PlotError> {
    let result = frame.result;
    let mut img = blank_canvas(820, 400);
    let title = format!(
        "{} FRAME {:03} {}",
        observation,
        result.frame_index,
        result.file_name()
    );
    draw_text(&mut img, 12, 10, &truncate_string(&title, 66), FOREGROUND, 2);
    let time = result.timestamp.format("%Y-%m-%d %H:%M:%S").to_string();
    let exptime = format_opt(result.exptime, 1);
    draw_text(&mut img, 12, 32, &format!("UT {}  EXPTIME {} S", time, exptime), FOREGROUND, 1);

    if !paint_cutout(&mut img, 20, 60, frame) {
        draw_text(&mut img, 20, 60, "NO CUTOUT", RED, 2);
    }

    match (frame.detail, result.star()) {
        (Some(detail), Some(star)) => {
            let fitter = PSFFitter::new(
                detail.gaussian.model,
                settings.sigma_guess,
                settings.max_fit_iterations,
            );
            let (observed, model, residual) = fitter.generate_residuals(&detail.window, &detail.gaussian);
            let range = finite_range(&observed.data).unwrap_or((0.0, 1.0));
            let res_absmax = finite_range(&residual.data)
                .map(|(lo, hi)| lo.abs().max(hi.abs()))
                .filter(|m| *m > 0.0)
                .unwrap_or(1.0);

            paint_panel(&mut img, 330, 60, &observed, |v| ColorMap::Grayscale.color(normalize(v, range)), "OBSERVED");
            paint_panel(&mut img, 495, 60, &model, |v| ColorMap::Grayscale.color(normalize(v, range)), "MODEL");
            paint_panel(
                &mut img,
                660,
                60,
                &residual,
                |v| ColorMap::Residual.color((v + res_absmax) / (2.0 * res_absmax)),
                "RESIDUAL",
            );

            let lines = [
                format!("X {:.2}  Y {:.2}  (FITS PIXELS)", star.x, star.y),
                format!("FWHM {:.2} PX  {:.2}\"", star.fwhm_pix, star.fwhm_arcsec),
                format!(
                    "SIGMA {:.2} / {:.2}  THETA {:.1}",
                    star.sigma_x,
                    star.sigma_y,
                    star.theta.to_degrees()
                ),
                format!("AMPLITUDE {:.0}  BACKGROUND {:.1}", star.amplitude, star.background),
                format!("FLUX RATE {}", format_opt(star.flux_rate, 0)),
                format!(
                    "R2 {:.3}  RMSE {:.1}  ITERATIONS {}",
                    star.r_squared, star.rmse, star.iterations
                ),
            ];
            for (i, line) in lines.iter().enumerate() {
                draw_text(&mut img, 330, 250 + i as u32 * 14, line, FOREGROUND, 1);
            }
        }
        _ => {
            let reason = result
                .failure()
                .map(|f| format!("{} FAILURE: {}", f.kind(), f))
                .unwrap_or_else(|| "NO FIT".to_string());
            draw_text_with_bg(&mut img, 330, 70, "FIT FAILED", Rgb([255, 255, 255]), RED, 2);
            for (i, line) in wrap_line(&reason, 75).iter().take(8).enumerate() {
                draw_text(&mut img, 330, 100 + i as u32 * 14, line, FOREGROUND, 1);
            }
        }
    }

    debug!("Writing {}", path.display());
    save_png(&img, path)
}

/// One frame of the cutout animation, None when the frame has no cutout
pub fn render_animation_frame(frame: &FrameInspection<'_>) -> Option<RgbImage> {
    let result = frame.result;
    let mut img = blank_canvas(CUTOUT_SIZE + 40, CUTOUT_SIZE + 80);
    let label = format!(
        "FRAME {:03}  {} UT",
        result.frame_index,
        result.timestamp.format("%H:%M:%S")
    );
    draw_text(&mut img, 20, 12, &label, FOREGROUND, 1);
    paint_cutout(&mut img, 20, 40, frame).then_some(img)
}

pub fn plot_cutout_animation(frames: &[RgbImage], path: &Path) -> Result<(), PlotError> {
    debug!("Writing {} ({} frames)", path.display(), frames.len());
    save_gif(frames, ANIMATION_DELAY_MS, path)
}

/// Centroid offsets from the fiducial, FWHM, flux rate and amplitude against
/// time plus the aggregate statistics. Points removed by clipping are drawn in
/// orange.
pub fn plot_observation_summary(
    sequence: &GuiderSequence,
    aggregate: &AggregateFit,
    settings: &AnalysisConfig,
    path: &Path,
) -> Result<(), PlotError> {
    let obs = &sequence.observation;
    let mut img = blank_canvas(900, 920);
    draw_text(&mut img, 12, 10, &truncate_string(&obs.long_name(), 72), FOREGROUND, 2);

    let fits: Vec<_> = sequence
        .results
        .iter()
        .filter_map(|r| r.star().map(|s| (r, s)))
        .collect();
    let fiducial = obs.fiducial;
    let times: Vec<f64> = fits.iter().map(|(r, _)| seconds_since(obs.start_time, r.timestamp)).collect();
    let dx: Vec<f64> = fits
        .iter()
        .map(|(r, s)| s.x - fiducial.unwrap_or(r.guess).x)
        .collect();
    let dy: Vec<f64> = fits
        .iter()
        .map(|(r, s)| s.y - fiducial.unwrap_or(r.guess).y)
        .collect();
    let centroids: Vec<(f64, f64)> = fits.iter().map(|(_, s)| (s.x, s.y)).collect();
    let centroid_mask = distance_clip_mask(&centroids, settings.clip_sigma, settings.clip_max_iters);
    let fwhm: Vec<f64> = fits.iter().map(|(_, s)| s.fwhm_arcsec).collect();
    let fwhm_mask = sigma_clip_mask(&fwhm, settings.clip_sigma, settings.clip_max_iters);
    let flux: Vec<f64> = fits.iter().map(|(_, s)| s.flux_rate.unwrap_or(f64::NAN)).collect();
    let amplitude: Vec<f64> = fits.iter().map(|(_, s)| s.amplitude).collect();

    let split = |values: &[f64], mask: &[bool], keep: bool| -> Vec<f64> {
        values
            .iter()
            .zip(mask)
            .map(|(v, k)| if *k == keep { *v } else { f64::NAN })
            .collect()
    };

    let offsets_rect = (90, 70, 330, 260);
    match Axes::fit_equal(offsets_rect, &dx, &dy) {
        Some(axes) => {
            axes.draw_frame(&mut img, "CENTROID - FIDUCIAL", "DX (PX)", "DY");
            axes.hline(&mut img, 0.0, GRID);
            axes.vline(&mut img, 0.0, GRID);
            axes.scatter(&mut img, &split(&dx, &centroid_mask, true), &split(&dy, &centroid_mask, true), BLUE, 3);
            axes.scatter(&mut img, &split(&dx, &centroid_mask, false), &split(&dy, &centroid_mask, false), ORANGE, 3);
        }
        None => Axes::draw_empty(&mut img, offsets_rect, "CENTROID - FIDUCIAL"),
    }

    let fwhm_rect = (530, 70, 330, 260);
    match Axes::fit(fwhm_rect, &times, &fwhm) {
        Some(axes) => {
            axes.draw_frame(&mut img, "FWHM", "SECONDS SINCE START", "ARCSEC");
            if let Some(stats) = aggregate.stats() {
                axes.hline(&mut img, stats.fwhm_arcsec_mean, GREEN);
            }
            axes.scatter(&mut img, &times, &split(&fwhm, &fwhm_mask, true), BLUE, 3);
            axes.scatter(&mut img, &times, &split(&fwhm, &fwhm_mask, false), ORANGE, 3);
        }
        None => Axes::draw_empty(&mut img, fwhm_rect, "FWHM"),
    }

    let flux_rect = (90, 410, 330, 240);
    match Axes::fit(flux_rect, &times, &flux) {
        Some(axes) => {
            axes.draw_frame(&mut img, "FLUX RATE", "SECONDS SINCE START", "CTS/S");
            axes.scatter(&mut img, &times, &flux, BLUE, 3);
        }
        None => Axes::draw_empty(&mut img, flux_rect, "FLUX RATE"),
    }

    let amplitude_rect = (530, 410, 330, 240);
    match Axes::fit(amplitude_rect, &times, &amplitude) {
        Some(axes) => {
            axes.draw_frame(&mut img, "AMPLITUDE", "SECONDS SINCE START", "CTS");
            axes.scatter(&mut img, &times, &amplitude, BLUE, 3);
        }
        None => Axes::draw_empty(&mut img, amplitude_rect, "AMPLITUDE"),
    }

    let mut lines = vec![
        format!("FRAMES {}  FITS {}", sequence.len(), fits.len()),
        format!(
            "FIDUCIAL {}",
            fiducial
                .map(|f| format!("({:.1}, {:.1})", f.x, f.y))
                .unwrap_or_else(|| "-".to_string())
        ),
    ];
    match aggregate.stats() {
        Some(s) => {
            lines.push(format!("CENTROIDS KEPT {}  FWHM KEPT {}", s.n_centroids_kept, s.n_fwhm_kept));
            lines.push(format!("X {:.2} +- {:.2}", s.centroid_x_mean, s.centroid_x_std));
            lines.push(format!("Y {:.2} +- {:.2}", s.centroid_y_mean, s.centroid_y_std));
            lines.push(format!("FWHM {:.2} +- {:.2} PX", s.fwhm_pix_mean, s.fwhm_pix_std));
            lines.push(format!("FWHM {:.2} +- {:.2}\"", s.fwhm_arcsec_mean, s.fwhm_arcsec_std));
            lines.push(format!(
                "FLUX RATE {} +- {}",
                format_opt(s.flux_rate_mean, 0),
                format_opt(s.flux_rate_std, 0)
            ));
        }
        None => lines.push("AGGREGATE UNAVAILABLE".to_string()),
    }
    if let Some(noted) = obs.fwhm_noted {
        lines.push(format!("LOGGED FWHM {:.2}\"", noted));
    }
    for (i, line) in lines.iter().enumerate() {
        draw_text(&mut img, 90, 720 + i as u32 * 18, line, FOREGROUND, 1);
    }
    let failures = sequence.failures().count();
    if failures > 0 {
        draw_text(&mut img, 90, 720 + lines.len() as u32 * 18, &format!("{} FRAMES FAILED", failures), RED, 1);
    }

    debug!("Writing {}", path.display());
    save_png(&img, path)
}

/// Centroids of every observation in a chunk colored by dither position,
/// and FWHM mean with its standard deviation per observation
pub fn plot_dither_chunk_summary(
    chunk: &DitherChunk,
    sequences: &[&GuiderSequence],
    settings: &AnalysisConfig,
    path: &Path,
) -> Result<(), PlotError> {
    if sequences.is_empty() {
        return Err(PlotError::Empty(format!(
            "dither chunk {} of {} has no fitted observations",
            chunk.chunk_index, chunk.target
        )));
    }
    let mut img = blank_canvas(900, 460);
    let title = format!("{} DITHER CHUNK {}", chunk.target, chunk.chunk_index);
    draw_text(&mut img, 12, 10, &truncate_string(&title, 72), FOREGROUND, 2);

    let color_of = |dither: u32| PALETTE[(dither.saturating_sub(1) as usize) % PALETTE.len()];
    let all_x: Vec<f64> = sequences
        .iter()
        .flat_map(|s| s.successes().filter_map(|r| r.star().map(|st| st.x)))
        .chain(sequences.iter().filter_map(|s| s.observation.fiducial.map(|f| f.x)))
        .collect();
    let all_y: Vec<f64> = sequences
        .iter()
        .flat_map(|s| s.successes().filter_map(|r| r.star().map(|st| st.y)))
        .chain(sequences.iter().filter_map(|s| s.observation.fiducial.map(|f| f.y)))
        .collect();

    let centroid_rect = (90, 70, 330, 300);
    match Axes::fit_equal(centroid_rect, &all_x, &all_y) {
        Some(axes) => {
            axes.draw_frame(&mut img, "CENTROIDS", "X (PX)", "Y");
            for seq in sequences {
                let color = color_of(seq.observation.dither);
                let xs: Vec<f64> = seq.successes().filter_map(|r| r.star().map(|s| s.x)).collect();
                let ys: Vec<f64> = seq.successes().filter_map(|r| r.star().map(|s| s.y)).collect();
                axes.scatter(&mut img, &xs, &ys, color, 2);
                if let Some(fid) = seq.observation.fiducial {
                    draw_plus(&mut img, axes.to_pixel(fid.x, fid.y), 7.0, color);
                }
            }
        }
        None => Axes::draw_empty(&mut img, centroid_rect, "CENTROIDS"),
    }

    let aggregates: Vec<AggregateFit> = sequences.iter().map(|s| s.aggregate(settings)).collect();
    let positions: Vec<f64> = (1..=sequences.len()).map(|i| i as f64).collect();
    let means: Vec<f64> = aggregates
        .iter()
        .map(|a| a.stats().map_or(f64::NAN, |s| s.fwhm_arcsec_mean))
        .collect();
    let stds: Vec<f64> = aggregates
        .iter()
        .map(|a| a.stats().map_or(f64::NAN, |s| s.fwhm_arcsec_std))
        .collect();
    let upper: Vec<f64> = means.iter().zip(&stds).map(|(m, s)| m + s).collect();
    let lower: Vec<f64> = means.iter().zip(&stds).map(|(m, s)| m - s).collect();
    let span: Vec<f64> = upper.iter().chain(&lower).copied().collect();
    let x_extent = [0.5, sequences.len() as f64 + 0.5];

    let fwhm_rect = (530, 70, 330, 300);
    match Axes::fit(fwhm_rect, &x_extent, &span) {
        Some(axes) => {
            axes.draw_frame(&mut img, "FWHM PER OBSERVATION", "OBSERVATION", "ARCSEC");
            axes.error_bars(&mut img, &positions, &means, &stds, FOREGROUND);
            for (i, seq) in sequences.iter().enumerate() {
                let color = color_of(seq.observation.dither);
                axes.scatter(&mut img, &positions[i..=i], &means[i..=i], color, 4);
            }
        }
        None => Axes::draw_empty(&mut img, fwhm_rect, "FWHM PER OBSERVATION"),
    }

    // legend
    for (i, seq) in sequences.iter().enumerate() {
        let y = 400 + (i as u32 / 3) * 16;
        let x = 90 + (i as u32 % 3) * 260;
        let label = format!("D{} {}", seq.observation.dither, seq.observation.filename);
        draw_text_with_bg(&mut img, x, y, "  ", FOREGROUND, color_of(seq.observation.dither), 1);
        draw_text(&mut img, x + 18, y, &label, FOREGROUND, 1);
    }

    debug!("Writing {}", path.display());
    save_png(&img, path)
}

/// Auto-stretched view of a stacked frame
pub fn plot_stacked(stack: &StackedFrame, title: &str, path: &Path) -> Result<(), PlotError> {
    let stretch = Stretch::fit(&stack.data, StretchParameters::default())
        .ok_or_else(|| PlotError::Empty(format!("stacked frame for {} has no finite pixels", title)))?;
    let mut img = blank_canvas(640, 680);
    draw_text(&mut img, 12, 10, &truncate_string(title, 50), FOREGROUND, 2);
    draw_text(
        &mut img,
        12,
        34,
        &format!("{} FRAMES, {}X{} PX, CTS/S", stack.frames_used, stack.width, stack.height),
        FOREGROUND,
        1,
    );
    let placed = paint_grid(
        &mut img,
        20,
        60,
        (stack.width, stack.height, &stack.data),
        600,
        |v| ColorMap::Grayscale.color(stretch.apply(v)),
    );
    placed.draw_border(&mut img, GRID);
    save_png(&img, path)
}
