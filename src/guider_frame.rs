//! Single guider frames and the guide-star fit on one frame
use chrono::NaiveDateTime;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::config::AnalysisConfig;
use crate::error::{FitError, FrameFailure, FrameReadError};
use crate::fits::{FitsHeader, FitsImage};
use crate::guider_index::GuiderEntry;
use crate::observation::Fiducial;
use crate::psf_fitting::{GaussianFit, PSFFitter, PixelWindow};

/// A guider exposure. Pixels are loaded on first use.
#[derive(Debug, Clone)]
pub struct GuiderFrame {
    pub path: PathBuf,
    pub timestamp: NaiveDateTime,
    pub exptime: Option<f64>,
    pub airmass: Option<f64>,
    image: Option<FitsImage>,
}

impl GuiderFrame {
    /// Read the header of an indexed frame
    pub fn open(entry: &GuiderEntry) -> Result<Self, FrameReadError> {
        let header = FitsHeader::read(&entry.path)?;
        Ok(Self {
            path: entry.path.clone(),
            timestamp: entry.timestamp,
            exptime: header.get_f64("EXPTIME"),
            airmass: header.get_f64("AIRMASS"),
            image: None,
        })
    }

    /// A frame whose pixels are already in memory
    pub fn from_image(
        path: impl Into<PathBuf>,
        timestamp: NaiveDateTime,
        exptime: Option<f64>,
        image: FitsImage,
    ) -> Self {
        Self {
            path: path.into(),
            timestamp,
            exptime,
            airmass: None,
            image: Some(image),
        }
    }

    pub fn image(&mut self) -> Result<&FitsImage, FrameReadError> {
        if self.image.is_none() {
            debug!("Loading guider pixels from {}", self.path.display());
            self.image = Some(FitsImage::from_file(&self.path)?);
        }
        self.image
            .as_ref()
            .ok_or_else(|| FrameReadError::new(&self.path, "pixels not loaded"))
    }

    /// Square cutout of `size` pixels around a 1-based FITS position,
    /// clipped at the frame edges
    pub fn cutout(&mut self, center: Fiducial, size: usize) -> Result<Cutout, FrameFailure> {
        let image = self.image()?;
        Ok(Cutout::extract(image, center, size)?)
    }
}

/// Region of a frame around the expected star position
#[derive(Debug, Clone)]
pub struct Cutout {
    /// 0-based frame pixel of the cutout's first column and row
    pub origin: (usize, usize),
    pub pixels: PixelWindow,
    /// Requested center, 1-based frame pixels
    pub center: Fiducial,
}

impl Cutout {
    pub fn extract(image: &FitsImage, center: Fiducial, size: usize) -> Result<Self, FitError> {
        let out_of_bounds = || FitError::WindowOutOfBounds {
            x: center.x,
            y: center.y,
            width: image.width,
            height: image.height,
        };
        let cx = center.x - 1.0;
        let cy = center.y - 1.0;
        if !cx.is_finite()
            || !cy.is_finite()
            || cx < 0.0
            || cy < 0.0
            || cx >= image.width as f64
            || cy >= image.height as f64
        {
            return Err(out_of_bounds());
        }

        let half = size as f64 / 2.0;
        let x0 = (cx - half).floor().max(0.0) as usize;
        let y0 = (cy - half).floor().max(0.0) as usize;
        let x1 = ((cx - half).floor() as i64 + size as i64).clamp(0, image.width as i64) as usize;
        let y1 = ((cy - half).floor() as i64 + size as i64).clamp(0, image.height as i64) as usize;
        let crop = image
            .crop(x0, y0, x1.saturating_sub(x0), y1.saturating_sub(y0))
            .ok_or_else(out_of_bounds)?;

        Ok(Self {
            origin: (x0, y0),
            pixels: PixelWindow::new(crop.width, crop.height, crop.data),
            center,
        })
    }

    /// Convert a 0-based cutout position to 1-based frame pixels
    pub fn to_frame(&self, x: f64, y: f64) -> (f64, f64) {
        (
            x + self.origin.0 as f64 + 1.0,
            y + self.origin.1 as f64 + 1.0,
        )
    }

    /// Convert 1-based frame pixels to a 0-based cutout position
    pub fn from_frame(&self, x: f64, y: f64) -> (f64, f64) {
        (
            x - self.origin.0 as f64 - 1.0,
            y - self.origin.1 as f64 - 1.0,
        )
    }
}

/// Accepted guide-star fit on one frame, in 1-based frame pixels
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StarFit {
    pub x: f64,
    pub y: f64,
    pub fwhm_pix: f64,
    pub fwhm_arcsec: f64,
    pub amplitude: f64,
    pub background: f64,
    pub sigma_x: f64,
    pub sigma_y: f64,
    pub theta: f64,
    /// Integrated counts per second, absent without an exposure time
    pub flux_rate: Option<f64>,
    pub r_squared: f64,
    pub rmse: f64,
    pub iterations: usize,
}

/// The fitted sub-window of a cutout, kept for diagnostic plots
#[derive(Debug, Clone)]
pub struct FitDetail {
    /// 0-based position of the fit window inside the cutout
    pub window_origin: (usize, usize),
    pub window: PixelWindow,
    pub gaussian: GaussianFit,
}

/// Fit the brightest source of a cutout and check the result is plausible
pub fn fit_cutout(
    cutout: &Cutout,
    exptime: Option<f64>,
    settings: &AnalysisConfig,
) -> Result<(StarFit, FitDetail), FitError> {
    let (peak_x, peak_y, _) = cutout.pixels.peak().ok_or(FitError::NoSignal)?;
    let half = (settings.fit_window / 2).max(1);
    let (wx, wy, window) = cutout.pixels.sub_window(
        peak_x.saturating_sub(half),
        peak_y.saturating_sub(half),
        peak_x + half + 1,
        peak_y + half + 1,
    );

    let fitter = PSFFitter::new(
        settings.star_model,
        settings.sigma_guess,
        settings.max_fit_iterations,
    );
    let gaussian = fitter.fit_window(&window)?;

    let fwhm_pix = gaussian.fwhm();
    if !fwhm_pix.is_finite() {
        return Err(FitError::NonFinite);
    }
    if fwhm_pix > settings.max_fwhm_pix {
        return Err(FitError::Implausible(format!(
            "FWHM {:.1} px above {:.1} px",
            fwhm_pix, settings.max_fwhm_pix
        )));
    }
    if gaussian.amplitude <= 0.0 {
        return Err(FitError::Implausible("no star above the background".to_string()));
    }

    let (x, y) = cutout.to_frame(gaussian.x + wx as f64, gaussian.y + wy as f64);
    let flux_rate = exptime
        .filter(|t| *t > 0.0)
        .map(|t| gaussian.total_flux() / t);

    let star = StarFit {
        x,
        y,
        fwhm_pix,
        fwhm_arcsec: fwhm_pix * settings.pixel_scale,
        amplitude: gaussian.amplitude,
        background: gaussian.background,
        sigma_x: gaussian.sigma_x,
        sigma_y: gaussian.sigma_y,
        theta: gaussian.theta,
        flux_rate,
        r_squared: gaussian.r_squared,
        rmse: gaussian.rmse,
        iterations: gaussian.iterations,
    };
    Ok((
        star,
        FitDetail {
            window_origin: (wx, wy),
            window,
            gaussian,
        },
    ))
}

/// Outcome of fitting one guider frame
#[derive(Debug, Clone)]
pub struct FitResult {
    /// Position of the frame in its observation's guider sequence
    pub frame_index: usize,
    pub path: PathBuf,
    pub timestamp: NaiveDateTime,
    pub exptime: Option<f64>,
    pub airmass: Option<f64>,
    /// Window center used for this frame, 1-based frame pixels
    pub guess: Fiducial,
    pub outcome: Result<StarFit, FrameFailure>,
}

impl FitResult {
    pub fn star(&self) -> Option<&StarFit> {
        self.outcome.as_ref().ok()
    }

    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }

    pub fn failure(&self) -> Option<&FrameFailure> {
        self.outcome.as_ref().err()
    }

    pub fn file_name(&self) -> String {
        file_name(&self.path)
    }
}

pub(crate) fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    /// Synthetic guider image with one Gaussian star at a 0-based position
    pub(crate) fn star_image(
        width: usize,
        height: usize,
        star: (f64, f64),
        sigma: f64,
        amplitude: f64,
        seed: u64,
    ) -> FitsImage {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut data = Vec::with_capacity(width * height);
        for y in 0..height {
            for x in 0..width {
                let r2 = (x as f64 - star.0).powi(2) + (y as f64 - star.1).powi(2);
                let noise: f64 = rng.gen_range(-2.0..2.0);
                data.push(100.0 + amplitude * (-r2 / (2.0 * sigma * sigma)).exp() + noise);
            }
        }
        FitsImage {
            width,
            height,
            data,
        }
    }

    fn ts() -> NaiveDateTime {
        chrono::NaiveDate::from_ymd_opt(2024, 11, 2)
            .and_then(|d| d.and_hms_opt(3, 0, 0))
            .unwrap()
    }

    #[test]
    fn test_fit_recovers_one_based_position() {
        let image = star_image(120, 100, (60.3, 45.7), 2.0, 5000.0, 7);
        let mut frame = GuiderFrame::from_image("g.fits", ts(), Some(10.0), image);
        // fiducial a few pixels off the true star
        let cutout = frame.cutout(Fiducial::new(58.0, 49.0), 70).unwrap();
        assert_eq!(cutout.origin, (22, 13));
        assert_eq!((cutout.pixels.width, cutout.pixels.height), (70, 70));

        let (star, detail) = fit_cutout(&cutout, Some(10.0), &AnalysisConfig::default()).unwrap();
        assert!((star.x - 61.3).abs() < 0.05, "x = {}", star.x);
        assert!((star.y - 46.7).abs() < 0.05, "y = {}", star.y);
        assert!((star.fwhm_pix - 2.0 * crate::psf_fitting::FWHM_PER_SIGMA).abs() < 0.1);
        assert!((star.fwhm_arcsec - star.fwhm_pix * 0.533).abs() < 1e-12);
        let expected_flux = 2.0 * std::f64::consts::PI * 5000.0 * 4.0 / 10.0;
        assert!((star.flux_rate.unwrap() - expected_flux).abs() / expected_flux < 0.02);
        assert_eq!((detail.window.width, detail.window.height), (21, 21));
    }

    #[test]
    fn test_cutout_is_clipped_at_edges() {
        let image = star_image(50, 40, (3.0, 3.0), 1.5, 800.0, 1);
        let cutout = Cutout::extract(&image, Fiducial::new(4.0, 4.0), 20).unwrap();
        assert_eq!(cutout.origin, (0, 0));
        assert_eq!((cutout.pixels.width, cutout.pixels.height), (13, 13));
        assert_eq!(cutout.to_frame(0.0, 0.0), (1.0, 1.0));
        assert_eq!(cutout.from_frame(1.0, 1.0), (0.0, 0.0));
    }

    #[test]
    fn test_fiducial_outside_frame() {
        let image = star_image(50, 40, (3.0, 3.0), 1.5, 800.0, 1);
        let err = Cutout::extract(&image, Fiducial::new(300.0, 4.0), 20).unwrap_err();
        assert!(matches!(err, FitError::WindowOutOfBounds { width: 50, height: 40, .. }));
    }

    #[test]
    fn test_blank_frame_has_no_signal() {
        let blank = FitsImage {
            width: 40,
            height: 40,
            data: vec![f64::NAN; 1600],
        };
        let cutout = Cutout::extract(&blank, Fiducial::new(20.0, 20.0), 30).unwrap();
        let err = fit_cutout(&cutout, Some(5.0), &AnalysisConfig::default()).unwrap_err();
        assert_eq!(err, FitError::NoSignal);
    }

    #[test]
    fn test_broad_blob_exceeds_fwhm_limit() {
        let image = star_image(120, 120, (60.0, 60.0), 6.0, 3000.0, 3);
        let settings = AnalysisConfig {
            max_fwhm_pix: 10.0,
            ..AnalysisConfig::default()
        };
        let cutout = Cutout::extract(&image, Fiducial::new(61.0, 61.0), 70).unwrap();
        let err = fit_cutout(&cutout, None, &settings).unwrap_err();
        assert!(matches!(err, FitError::Implausible(ref m) if m.contains("FWHM")));
    }

    #[test]
    fn test_unreadable_pixels() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.fits");
        std::fs::write(&path, b"not a fits file").unwrap();
        let mut frame = GuiderFrame {
            path: path.clone(),
            timestamp: ts(),
            exptime: None,
            airmass: None,
            image: None,
        };
        let err = frame.cutout(Fiducial::new(10.0, 10.0), 20).unwrap_err();
        assert_eq!(err.kind(), "read");
    }
}
