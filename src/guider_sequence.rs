//! Guide-star fits over all guider frames of one observation
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, warn};

use crate::clipping::{distance_clip_mask, masked_stats, sigma_clip_mask};
use crate::config::AnalysisConfig;
use crate::error::{FrameFailure, SequenceError, TableError};
use crate::fits::FitsImage;
use crate::guider_frame::{fit_cutout, Cutout, FitDetail, FitResult, GuiderFrame};
use crate::guider_index::{GuiderEntry, GuiderIndex};
use crate::observation::{Fiducial, Observation};
use crate::utils::write_atomically;

/// What a per-frame callback gets to see while a sequence is fitted
pub struct FrameInspection<'a> {
    pub result: &'a FitResult,
    pub cutout: Option<&'a Cutout>,
    pub detail: Option<&'a FitDetail>,
}

/// Fitted guider frames of one observation
#[derive(Debug, Clone)]
pub struct GuiderSequence {
    pub observation: Observation,
    pub results: Vec<FitResult>,
}

impl GuiderSequence {
    /// Guider frames whose timestamps fall inside the observation window
    pub fn frames_for<'a>(
        observation: &Observation,
        index: &'a GuiderIndex,
    ) -> Result<Vec<&'a GuiderEntry>, SequenceError> {
        let (start, end) = observation
            .time_window()
            .ok_or_else(|| SequenceError::NoTimeWindow(observation.filename.clone()))?;
        Ok(index.frames_between(start, end))
    }

    pub fn fit(
        observation: &Observation,
        index: &GuiderIndex,
        settings: &AnalysisConfig,
    ) -> Result<Self, SequenceError> {
        Self::fit_with(observation, index, settings, |_| {})
    }

    /// Fit every frame in the observation window. Frame failures are recorded
    /// in the results and never abort the sequence.
    pub fn fit_with<F>(
        observation: &Observation,
        index: &GuiderIndex,
        settings: &AnalysisConfig,
        mut inspect: F,
    ) -> Result<Self, SequenceError>
    where
        F: FnMut(FrameInspection<'_>),
    {
        let fiducial = observation
            .fiducial
            .ok_or_else(|| SequenceError::NoFiducial(observation.filename.clone()))?;
        let entries = Self::frames_for(observation, index)?;
        debug!(
            "{}: {} guider frames between {} and {}",
            observation.filename,
            entries.len(),
            observation.start_time,
            observation.end_time().unwrap_or(observation.start_time)
        );

        let mut results = Vec::with_capacity(entries.len());
        let mut guess = fiducial;
        for (frame_index, entry) in entries.into_iter().enumerate() {
            let mut cutout = None;
            let mut detail = None;
            let mut exptime = None;
            let mut airmass = None;
            let outcome = GuiderFrame::open(entry)
                .map_err(FrameFailure::from)
                .and_then(|mut frame| {
                    exptime = frame.exptime;
                    airmass = frame.airmass;
                    let c = frame.cutout(guess, settings.cutout_size)?;
                    let fitted = fit_cutout(&c, frame.exptime, settings);
                    cutout = Some(c);
                    let (star, d) = fitted?;
                    detail = Some(d);
                    Ok(star)
                });
            let result = FitResult {
                frame_index,
                path: entry.path.clone(),
                timestamp: entry.timestamp,
                exptime,
                airmass,
                guess,
                outcome,
            };

            match &result.outcome {
                Ok(star) => {
                    if settings.follow_star {
                        guess = Fiducial::new(star.x, star.y);
                    }
                }
                Err(e) => warn!(
                    "{} frame {} ({}): {}",
                    observation.filename,
                    frame_index,
                    result.file_name(),
                    e
                ),
            }

            inspect(FrameInspection {
                result: &result,
                cutout: cutout.as_ref(),
                detail: detail.as_ref(),
            });
            results.push(result);
        }

        Ok(Self {
            observation: observation.clone(),
            results,
        })
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn successes(&self) -> impl Iterator<Item = &FitResult> {
        self.results.iter().filter(|r| r.is_success())
    }

    pub fn failures(&self) -> impl Iterator<Item = &FitResult> {
        self.results.iter().filter(|r| !r.is_success())
    }

    pub fn aggregate(&self, settings: &AnalysisConfig) -> AggregateFit {
        aggregate(&self.results, settings.clip_sigma, settings.clip_max_iters)
    }

    /// Stack the frames of all successful fits, see [`stack_frames`]
    pub fn stack(&self, settings: &AnalysisConfig) -> Option<StackedFrame> {
        stack_frames(&self.results, settings.clip_sigma, settings.clip_max_iters)
    }
}

/// Sigma-clipped statistics of the successful fits of one observation
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregateStats {
    pub n_frames: usize,
    pub n_fits: usize,
    /// Centroids left after distance clipping
    pub n_centroids_kept: usize,
    pub n_fwhm_kept: usize,
    pub centroid_x_mean: f64,
    pub centroid_x_std: f64,
    pub centroid_y_mean: f64,
    pub centroid_y_std: f64,
    pub fwhm_pix_mean: f64,
    pub fwhm_pix_std: f64,
    pub fwhm_arcsec_mean: f64,
    pub fwhm_arcsec_std: f64,
    /// Not clipped
    pub flux_rate_mean: Option<f64>,
    pub flux_rate_std: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum AggregateFit {
    Unavailable { n_frames: usize },
    Available(AggregateStats),
}

impl AggregateFit {
    pub fn stats(&self) -> Option<&AggregateStats> {
        match self {
            AggregateFit::Available(stats) => Some(stats),
            AggregateFit::Unavailable { .. } => None,
        }
    }

    pub fn is_available(&self) -> bool {
        self.stats().is_some()
    }
}

/// Aggregate per-frame results. Centroids are clipped by their distance from
/// the median centroid, FWHMs by value; flux rates are averaged unclipped.
pub fn aggregate(results: &[FitResult], sigma: f64, max_iters: usize) -> AggregateFit {
    let stars: Vec<_> = results.iter().filter_map(|r| r.star()).collect();
    if stars.is_empty() {
        return AggregateFit::Unavailable {
            n_frames: results.len(),
        };
    }

    let centroids: Vec<(f64, f64)> = stars.iter().map(|s| (s.x, s.y)).collect();
    let xs: Vec<f64> = centroids.iter().map(|c| c.0).collect();
    let ys: Vec<f64> = centroids.iter().map(|c| c.1).collect();
    let centroid_mask = distance_clip_mask(&centroids, sigma, max_iters);
    let (Some(x), Some(y)) = (masked_stats(&xs, &centroid_mask), masked_stats(&ys, &centroid_mask)) else {
        return AggregateFit::Unavailable {
            n_frames: results.len(),
        };
    };

    let fwhm_pix: Vec<f64> = stars.iter().map(|s| s.fwhm_pix).collect();
    let fwhm_arcsec: Vec<f64> = stars.iter().map(|s| s.fwhm_arcsec).collect();
    let fwhm_mask = sigma_clip_mask(&fwhm_pix, sigma, max_iters);
    let (Some(fwhm), Some(fwhm_as)) = (
        masked_stats(&fwhm_pix, &fwhm_mask),
        masked_stats(&fwhm_arcsec, &fwhm_mask),
    ) else {
        return AggregateFit::Unavailable {
            n_frames: results.len(),
        };
    };

    let flux_rates: Vec<f64> = stars.iter().filter_map(|s| s.flux_rate).collect();
    let flux = masked_stats(&flux_rates, &vec![true; flux_rates.len()]);

    AggregateFit::Available(AggregateStats {
        n_frames: results.len(),
        n_fits: stars.len(),
        n_centroids_kept: x.kept,
        n_fwhm_kept: fwhm.kept,
        centroid_x_mean: x.mean,
        centroid_x_std: x.std,
        centroid_y_mean: y.mean,
        centroid_y_std: y.std,
        fwhm_pix_mean: fwhm.mean,
        fwhm_pix_std: fwhm.std,
        fwhm_arcsec_mean: fwhm_as.mean,
        fwhm_arcsec_std: fwhm_as.std,
        flux_rate_mean: flux.map(|f| f.mean),
        flux_rate_std: flux.map(|f| f.std),
    })
}

/// Mean of aligned, exposure-normalized guider frames
#[derive(Debug, Clone)]
pub struct StackedFrame {
    pub width: usize,
    pub height: usize,
    /// Counts per second
    pub data: Vec<f64>,
    pub frames_used: usize,
}

impl StackedFrame {
    pub fn to_image(&self) -> FitsImage {
        FitsImage {
            width: self.width,
            height: self.height,
            data: self.data.clone(),
        }
    }
}

/// Shift the frames of successful fits so their centroids coincide and
/// average them, each divided by its exposure time. Centroid outliers (by
/// distance) and frames without an exposure time are left out.
pub fn stack_frames(results: &[FitResult], sigma: f64, max_iters: usize) -> Option<StackedFrame> {
    let fitted: Vec<&FitResult> = results
        .iter()
        .filter(|r| r.is_success() && r.exptime.is_some_and(|t| t > 0.0))
        .collect();
    let centroids: Vec<(f64, f64)> = fitted
        .iter()
        .filter_map(|r| r.star().map(|s| (s.x, s.y)))
        .collect();
    let mask = distance_clip_mask(&centroids, sigma, max_iters);

    let mut frames = Vec::new();
    for (result, keep) in fitted.into_iter().zip(mask) {
        if !keep {
            continue;
        }
        match load_pixels(&result.path) {
            Ok(image) => frames.push((result, image)),
            Err(e) => warn!("Skipping {} in stack: {}", result.file_name(), e),
        }
    }
    let (first, first_image) = frames.first()?;
    let (frame_w, frame_h) = (first_image.width, first_image.height);
    debug!("Stacking {} frames starting at {}", frames.len(), first.file_name());

    let max_x = frames
        .iter()
        .filter_map(|(r, _)| r.star().map(|s| s.x))
        .fold(f64::NEG_INFINITY, f64::max);
    let max_y = frames
        .iter()
        .filter_map(|(r, _)| r.star().map(|s| s.y))
        .fold(f64::NEG_INFINITY, f64::max);
    let offsets: Vec<(usize, usize)> = frames
        .iter()
        .map(|(r, _)| match r.star() {
            Some(s) => ((max_x - s.x).round() as usize, (max_y - s.y).round() as usize),
            None => (0, 0),
        })
        .collect();
    let width = frame_w + offsets.iter().map(|o| o.0).max().unwrap_or(0);
    let height = frame_h + offsets.iter().map(|o| o.1).max().unwrap_or(0);

    let mut sum = vec![0.0; width * height];
    let mut count = vec![0u32; width * height];
    let mut frames_used = 0;
    for ((result, image), (dx, dy)) in frames.iter().zip(&offsets) {
        if image.width != frame_w || image.height != frame_h {
            warn!(
                "Skipping {} in stack: {}x{} differs from {}x{}",
                result.file_name(),
                image.width,
                image.height,
                frame_w,
                frame_h
            );
            continue;
        }
        let exptime = result.exptime.unwrap_or(1.0);
        for y in 0..frame_h {
            for x in 0..frame_w {
                let v = image.get(x, y);
                if v.is_finite() {
                    let i = (y + dy) * width + x + dx;
                    sum[i] += v / exptime;
                    count[i] += 1;
                }
            }
        }
        frames_used += 1;
    }

    let data = sum
        .iter()
        .zip(&count)
        .map(|(s, &n)| if n > 0 { s / n as f64 } else { f64::NAN })
        .collect();
    Some(StackedFrame {
        width,
        height,
        data,
        frames_used,
    })
}

fn load_pixels(path: &Path) -> Result<FitsImage, crate::error::FrameReadError> {
    FitsImage::from_file(path)
}

/// Row of `observations_processed.csv`: the logged observation plus its
/// aggregate fit. `status` is `available`, `unavailable` or `skipped`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProcessedRecord {
    pub filename: String,
    pub fpath: String,
    pub target: String,
    pub dither: u32,
    pub dither_chunk_index: Option<usize>,
    pub start_time_ut: NaiveDateTime,
    pub exptime: Option<f64>,
    pub focus: Option<f64>,
    pub fwhm_noted: Option<f64>,
    pub fiducial_x: Option<f64>,
    pub fiducial_y: Option<f64>,
    pub airmass_noted: Option<f64>,
    pub comments: String,
    pub status: String,
    pub n_frames: usize,
    pub n_fits: usize,
    pub centroid_x_mean: Option<f64>,
    pub centroid_x_std: Option<f64>,
    pub centroid_y_mean: Option<f64>,
    pub centroid_y_std: Option<f64>,
    pub fwhm_arcsec_mean: Option<f64>,
    pub fwhm_arcsec_std: Option<f64>,
    pub fwhm_pix_mean: Option<f64>,
    pub fwhm_pix_std: Option<f64>,
    pub flux_rate_mean: Option<f64>,
    pub flux_rate_std: Option<f64>,
}

impl ProcessedRecord {
    /// `aggregate` is `None` for observations that were not fitted
    pub fn new(
        observation: &Observation,
        dither_chunk_index: Option<usize>,
        aggregate: Option<&AggregateFit>,
    ) -> Self {
        let stats = aggregate.and_then(|a| a.stats());
        let (status, n_frames) = match aggregate {
            Some(AggregateFit::Available(s)) => ("available", s.n_frames),
            Some(AggregateFit::Unavailable { n_frames }) => ("unavailable", *n_frames),
            None => ("skipped", 0),
        };
        Self {
            filename: observation.filename.clone(),
            fpath: observation.fpath.display().to_string(),
            target: observation.target.clone(),
            dither: observation.dither,
            dither_chunk_index,
            start_time_ut: observation.start_time,
            exptime: observation.exptime,
            focus: observation.focus,
            fwhm_noted: observation.fwhm_noted,
            fiducial_x: observation.fiducial.map(|f| f.x),
            fiducial_y: observation.fiducial.map(|f| f.y),
            airmass_noted: observation.airmass,
            comments: observation.comments.clone(),
            status: status.to_string(),
            n_frames,
            n_fits: stats.map_or(0, |s| s.n_fits),
            centroid_x_mean: stats.map(|s| s.centroid_x_mean),
            centroid_x_std: stats.map(|s| s.centroid_x_std),
            centroid_y_mean: stats.map(|s| s.centroid_y_mean),
            centroid_y_std: stats.map(|s| s.centroid_y_std),
            fwhm_arcsec_mean: stats.map(|s| s.fwhm_arcsec_mean),
            fwhm_arcsec_std: stats.map(|s| s.fwhm_arcsec_std),
            fwhm_pix_mean: stats.map(|s| s.fwhm_pix_mean),
            fwhm_pix_std: stats.map(|s| s.fwhm_pix_std),
            flux_rate_mean: stats.and_then(|s| s.flux_rate_mean),
            flux_rate_std: stats.and_then(|s| s.flux_rate_std),
        }
    }
}

pub fn save_processed_csv(records: &[ProcessedRecord], path: &Path) -> Result<(), TableError> {
    write_atomically(path, |file| {
        let mut wtr = csv::Writer::from_writer(&mut *file);
        for record in records {
            wtr.serialize(record).map_err(std::io::Error::other)?;
        }
        wtr.flush()
    })
    .map_err(|source| TableError::Io {
        path: path.to_path_buf(),
        source,
    })
}

pub fn load_processed_csv(path: &Path) -> Result<Vec<ProcessedRecord>, TableError> {
    let csv_error = |source| TableError::Csv {
        path: path.to_path_buf(),
        source,
    };
    let mut rdr = csv::Reader::from_path(path).map_err(csv_error)?;
    rdr.deserialize().collect::<Result<Vec<ProcessedRecord>, _>>().map_err(csv_error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FitError;
    use crate::fits::{write_image, CardValue};
    use crate::guider_frame::tests::star_image;
    use crate::guider_frame::StarFit;
    use crate::observation::tests::sample_observation;
    use chrono::{Duration, NaiveDateTime};
    use std::path::PathBuf;

    fn ts(s: i64) -> NaiveDateTime {
        chrono::NaiveDate::from_ymd_opt(2024, 11, 2)
            .and_then(|d| d.and_hms_opt(3, 0, 0))
            .unwrap()
            + Duration::seconds(s)
    }

    fn fitted(i: usize, x: f64, y: f64, fwhm: f64) -> FitResult {
        FitResult {
            frame_index: i,
            path: PathBuf::from(format!("g{}.fits", i)),
            timestamp: ts(i as i64 * 10),
            exptime: Some(5.0),
            airmass: None,
            guess: Fiducial::new(100.0, 100.0),
            outcome: Ok(StarFit {
                x,
                y,
                fwhm_pix: fwhm,
                fwhm_arcsec: fwhm * 0.533,
                amplitude: 1000.0,
                background: 100.0,
                sigma_x: fwhm / 2.3548,
                sigma_y: fwhm / 2.3548,
                theta: 0.0,
                flux_rate: Some(2000.0 + i as f64),
                r_squared: 0.99,
                rmse: 3.0,
                iterations: 8,
            }),
        }
    }

    fn failed(i: usize) -> FitResult {
        FitResult {
            outcome: Err(FitError::NoSignal.into()),
            ..fitted(i, 0.0, 0.0, 0.0)
        }
    }

    #[test]
    fn test_aggregate_clips_outlier_centroid() {
        let mut results: Vec<FitResult> = (0..10)
            .map(|i| fitted(i, 100.0 + 0.1 * (i % 3) as f64, 200.0 - 0.1 * (i % 2) as f64, 4.0))
            .collect();
        results.push(fitted(10, 140.0, 230.0, 4.0));
        results.push(failed(11));

        let agg = aggregate(&results, 2.5, 5);
        let stats = agg.stats().unwrap();
        assert_eq!(stats.n_frames, 12);
        assert_eq!(stats.n_fits, 11);
        assert_eq!(stats.n_centroids_kept, 10);
        assert!((stats.centroid_x_mean - 100.09).abs() < 0.01);
        assert!((stats.centroid_y_mean - 199.95).abs() < 0.01);
        assert!(stats.centroid_x_std < 0.1);
        assert!((stats.fwhm_arcsec_mean - 4.0 * 0.533).abs() < 1e-9);
        assert!(stats.flux_rate_mean.unwrap() > 2000.0);
    }

    #[test]
    fn test_no_successes_is_unavailable() {
        let agg = aggregate(&[failed(0), failed(1)], 2.5, 5);
        assert_eq!(agg, AggregateFit::Unavailable { n_frames: 2 });
        assert!(!aggregate(&[], 2.5, 5).is_available());
    }

    #[test]
    fn test_aggregate_serializes_with_status() {
        let json = serde_json::to_value(aggregate(&[failed(0)], 2.5, 5)).unwrap();
        assert_eq!(json["status"], "unavailable");
        let json = serde_json::to_value(aggregate(&[fitted(0, 1.0, 2.0, 3.0)], 2.5, 5)).unwrap();
        assert_eq!(json["status"], "available");
        assert_eq!(json["n_fits"], 1);
    }

    fn write_frame(dir: &Path, name: &str, star: (f64, f64), seed: u64, time: &str) -> PathBuf {
        let image = star_image(80, 60, star, 2.0, 4000.0, seed);
        let data: Vec<f32> = image.data.iter().map(|v| *v as f32).collect();
        let path = dir.join(name);
        write_image(
            &path,
            80,
            60,
            &data,
            &[
                ("DATE-OBS", CardValue::from("2024-11-02")),
                ("UT", CardValue::from(time)),
                ("EXPTIME", CardValue::Real(4.0)),
                ("AIRMASS", CardValue::Real(1.2)),
            ],
        )
        .unwrap();
        path
    }

    #[test]
    fn test_fit_sequence_from_index() {
        let dir = tempfile::tempdir().unwrap();
        let mut index = GuiderIndex::new();
        let stars = [(40.0, 30.0), (41.0, 30.2), (40.2, 28.9)];
        for (i, star) in stars.iter().enumerate() {
            let time = format!("03:00:{:02}.0", 10 + i * 10);
            let path = write_frame(dir.path(), &format!("g{}.fits", i), *star, i as u64, &time);
            index.insert(ts(10 + i as i64 * 10), path);
        }
        // outside the window
        index.insert(ts(500), dir.path().join("late.fits"));

        let mut obs = sample_observation("vw000010", "NGC1234", (3, 0, 0));
        obs.fiducial = Some(crate::observation::Fiducial::new(42.0, 31.0));
        let mut inspected = 0;
        let seq = GuiderSequence::fit_with(&obs, &index, &AnalysisConfig::default(), |frame| {
            assert!(frame.cutout.is_some());
            inspected += 1;
        })
        .unwrap();
        assert_eq!(inspected, 3);
        assert_eq!(seq.len(), 3);
        assert_eq!(seq.successes().count(), 3);
        let first = seq.results[0].star().unwrap();
        assert!((first.x - 41.0).abs() < 0.05);
        assert!((first.y - 31.0).abs() < 0.05);
        assert_eq!(seq.results[0].airmass, Some(1.2));

        let stack = seq.stack(&AnalysisConfig::default()).unwrap();
        assert_eq!(stack.frames_used, 3);
        assert_eq!((stack.width, stack.height), (81, 61));
        // every star is shifted onto the largest centroid, 0-based (41, 30.2)
        let image = stack.to_image();
        let (px, py) = (0..image.data.len())
            .filter(|&i| image.data[i].is_finite())
            .max_by(|&a, &b| image.data[a].total_cmp(&image.data[b]))
            .map(|i| (i % image.width, i / image.width))
            .unwrap();
        assert_eq!((px, py), (41, 30));
    }

    #[test]
    fn test_follow_star_moves_the_window() {
        let dir = tempfile::tempdir().unwrap();
        let mut index = GuiderIndex::new();
        // the star drifts out of a 20 px cutout around the fiducial
        let stars = [(30.0, 30.0), (38.0, 30.0), (46.0, 30.0), (54.0, 30.0)];
        for (i, star) in stars.iter().enumerate() {
            let time = format!("03:00:{:02}.0", 10 + i * 10);
            let path = write_frame(dir.path(), &format!("g{}.fits", i), *star, i as u64, &time);
            index.insert(ts(10 + i as i64 * 10), path);
        }
        let mut obs = sample_observation("vw000011", "NGC1234", (3, 0, 0));
        obs.fiducial = Some(crate::observation::Fiducial::new(31.0, 31.0));

        let fixed = AnalysisConfig {
            cutout_size: 20,
            ..AnalysisConfig::default()
        };
        let following = AnalysisConfig {
            follow_star: true,
            ..fixed.clone()
        };
        let seq = GuiderSequence::fit(&obs, &index, &following).unwrap();
        assert_eq!(seq.successes().count(), 4);
        let last = seq.results[3].star().unwrap();
        assert!((last.x - 55.0).abs() < 0.1);
        assert_eq!(seq.results[3].guess.x.round(), 47.0);

        let seq = GuiderSequence::fit(&obs, &index, &fixed).unwrap();
        let last = seq.results[3].star();
        assert!(last.map_or(true, |s| (s.x - 55.0).abs() > 1.0));
    }

    #[test]
    fn test_observation_without_window_or_fiducial() {
        let index = GuiderIndex::new();
        let mut obs = sample_observation("vw000012", "NGC1234", (3, 0, 0));
        obs.exptime = None;
        assert_eq!(
            GuiderSequence::fit(&obs, &index, &AnalysisConfig::default()).unwrap_err(),
            SequenceError::NoTimeWindow("vw000012".to_string())
        );
        obs.exptime = Some(60.0);
        obs.fiducial = None;
        assert!(matches!(
            GuiderSequence::fit(&obs, &index, &AnalysisConfig::default()),
            Err(SequenceError::NoFiducial(_))
        ));
    }

    #[test]
    fn test_processed_table() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("observations_processed.csv");
        let obs = sample_observation("vw000013", "NGC1234", (3, 0, 0));
        let results: Vec<FitResult> = (0..3).map(|i| fitted(i, 10.0, 20.0, 4.0)).collect();
        let agg = aggregate(&results, 2.5, 5);
        let records = vec![
            ProcessedRecord::new(&obs, Some(0), Some(&agg)),
            ProcessedRecord::new(&obs, None, Some(&AggregateFit::Unavailable { n_frames: 4 })),
            ProcessedRecord::new(&obs, None, None),
        ];
        save_processed_csv(&records, &path).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let header = text.lines().next().unwrap();
        assert!(header.contains("dither_chunk_index"));
        assert!(header.ends_with("flux_rate_std"));

        let loaded = load_processed_csv(&path).unwrap();
        assert_eq!(loaded, records);
        assert_eq!(loaded[0].status, "available");
        assert_eq!(loaded[0].centroid_x_mean, Some(10.0));
        assert_eq!(loaded[1].n_frames, 4);
        assert_eq!(loaded[2].status, "skipped");
    }
}
