/// PSF fitting module
/// Gaussian star models with a bounded Levenberg-Marquardt least-squares fit
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

use crate::error::FitError;

/// FWHM = sigma * 2 * sqrt(2 ln 2)
pub const FWHM_PER_SIGMA: f64 = 2.354_820_045_030_949_3;

/// Star model used for guide-star fits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StarModel {
    /// Single sigma: [A, B, x0, y0, sigma]
    #[default]
    Symmetric,
    /// Rotated ellipse: [A, B, x0, y0, sigma_x, sigma_y, theta]
    Elliptical,
}

impl std::str::FromStr for StarModel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "symmetric" | "gaussian" | "circular" => Ok(StarModel::Symmetric),
            "elliptical" | "elliptic" => Ok(StarModel::Elliptical),
            _ => Err(format!("Unknown star model: {}", s)),
        }
    }
}

impl std::fmt::Display for StarModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StarModel::Symmetric => write!(f, "symmetric"),
            StarModel::Elliptical => write!(f, "elliptical"),
        }
    }
}

/// Trait for PSF models
pub trait PSFFunction {
    fn n_params(&self) -> usize;

    /// Evaluate the model at pixel (x, y)
    fn value(&self, x: f64, y: f64, params: &[f64]) -> f64;

    /// Partial derivatives of `value` with respect to each parameter
    fn gradient(&self, x: f64, y: f64, params: &[f64], grad: &mut [f64]);
}

/// Circular Gaussian plus constant background
pub struct SymmetricGaussianPSF;

impl PSFFunction for SymmetricGaussianPSF {
    fn n_params(&self) -> usize {
        5
    }

    fn value(&self, x: f64, y: f64, params: &[f64]) -> f64 {
        let (a, b, x0, y0, sigma) = (params[0], params[1], params[2], params[3], params[4]);
        let r2 = (x - x0).powi(2) + (y - y0).powi(2);
        b + a * (-r2 / (2.0 * sigma * sigma)).exp()
    }

    fn gradient(&self, x: f64, y: f64, params: &[f64], grad: &mut [f64]) {
        let (a, x0, y0, sigma) = (params[0], params[2], params[3], params[4]);
        let dx = x - x0;
        let dy = y - y0;
        let s2 = sigma * sigma;
        let r2 = dx * dx + dy * dy;
        let e = (-r2 / (2.0 * s2)).exp();

        grad[0] = e;
        grad[1] = 1.0;
        grad[2] = a * e * dx / s2;
        grad[3] = a * e * dy / s2;
        grad[4] = a * e * r2 / (s2 * sigma);
    }
}

/// Rotated elliptical Gaussian plus constant background
pub struct EllipticalGaussianPSF;

impl PSFFunction for EllipticalGaussianPSF {
    fn n_params(&self) -> usize {
        7
    }

    fn value(&self, x: f64, y: f64, params: &[f64]) -> f64 {
        let a = params[0]; // Amplitude
        let b = params[1]; // Background
        let x0 = params[2];
        let y0 = params[3];
        let sigma_x = params[4];
        let sigma_y = params[5];
        let theta = params[6]; // Rotation angle

        // Rotate coordinates
        let cos_t = theta.cos();
        let sin_t = theta.sin();
        let dx = x - x0;
        let dy = y - y0;
        let xp = dx * cos_t + dy * sin_t;
        let yp = -dx * sin_t + dy * cos_t;

        let arg = -(xp * xp / (2.0 * sigma_x * sigma_x) + yp * yp / (2.0 * sigma_y * sigma_y));
        b + a * arg.exp()
    }

    fn gradient(&self, x: f64, y: f64, params: &[f64], grad: &mut [f64]) {
        let a = params[0];
        let x0 = params[2];
        let y0 = params[3];
        let sigma_x = params[4];
        let sigma_y = params[5];
        let theta = params[6];

        let cos_t = theta.cos();
        let sin_t = theta.sin();
        let dx = x - x0;
        let dy = y - y0;
        let xp = dx * cos_t + dy * sin_t;
        let yp = -dx * sin_t + dy * cos_t;

        let sx2 = sigma_x * sigma_x;
        let sy2 = sigma_y * sigma_y;
        let exp_arg = (-(xp * xp / (2.0 * sx2) + yp * yp / (2.0 * sy2))).exp();

        grad[0] = exp_arg;
        grad[1] = 1.0;
        grad[2] = a * exp_arg * (xp * cos_t / sx2 - yp * sin_t / sy2);
        grad[3] = a * exp_arg * (xp * sin_t / sx2 + yp * cos_t / sy2);
        grad[4] = a * exp_arg * xp * xp / (sx2 * sigma_x);
        grad[5] = a * exp_arg * yp * yp / (sy2 * sigma_y);
        // d(xp)/dtheta = yp, d(yp)/dtheta = -xp
        grad[6] = -a * exp_arg * xp * yp * (1.0 / sx2 - 1.0 / sy2);
    }
}

/// Outcome of a least-squares run
#[derive(Debug, Clone)]
pub struct LmSolution {
    pub params: Vec<f64>,
    pub iterations: usize,
    /// Sum of squared residuals
    pub chi2: f64,
}

/// Levenberg-Marquardt optimizer with Marquardt diagonal scaling and box
/// bounds applied by clamping
#[derive(Debug, Clone)]
pub struct LevenbergMarquardt {
    max_iterations: usize,
    tolerance: f64,
    lambda: f64,
    lambda_factor: f64,
}

impl Default for LevenbergMarquardt {
    fn default() -> Self {
        Self {
            max_iterations: 200,
            tolerance: 1e-10,
            lambda: 1e-3,
            lambda_factor: 10.0,
        }
    }
}

impl LevenbergMarquardt {
    pub fn with_max_iterations(max_iterations: usize) -> Self {
        Self {
            max_iterations,
            ..Self::default()
        }
    }

    fn sum_squares(psf: &dyn PSFFunction, positions: &[(f64, f64)], values: &[f64], params: &[f64]) -> f64 {
        positions
            .iter()
            .zip(values)
            .map(|((x, y), observed)| (observed - psf.value(*x, *y, params)).powi(2))
            .sum()
    }

    /// Fit `psf` to the samples. Converged means the relative chi² improvement
    /// fell below the tolerance or no step could improve it any further.
    pub fn fit(
        &self,
        psf: &dyn PSFFunction,
        positions: &[(f64, f64)],
        values: &[f64],
        initial_params: &[f64],
        lower_bounds: &[f64],
        upper_bounds: &[f64],
    ) -> Result<LmSolution, FitError> {
        let n_params = initial_params.len();
        let n_points = positions.len();
        if n_points <= n_params {
            return Err(FitError::TooFewPoints {
                points: n_points,
                params: n_params,
            });
        }

        let clamp = |p: &mut [f64]| {
            for (i, v) in p.iter_mut().enumerate() {
                *v = v.max(lower_bounds[i]).min(upper_bounds[i]);
            }
        };

        let mut params = initial_params.to_vec();
        clamp(&mut params);
        let mut error = Self::sum_squares(psf, positions, values, &params);
        if !error.is_finite() {
            return Err(FitError::NonFinite);
        }

        let mut lambda = self.lambda;
        let mut jacobian = DMatrix::<f64>::zeros(n_points, n_params);
        let mut residuals = DVector::<f64>::zeros(n_points);
        let mut gradient = vec![0.0; n_params];

        for iteration in 1..=self.max_iterations {
            for (i, ((x, y), observed)) in positions.iter().zip(values).enumerate() {
                residuals[i] = observed - psf.value(*x, *y, &params);
                psf.gradient(*x, *y, &params, &mut gradient);
                for (j, &g) in gradient.iter().enumerate() {
                    jacobian[(i, j)] = g;
                }
            }

            let jt = jacobian.transpose();
            let jtj = &jt * &jacobian;
            let jtr = &jt * &residuals;

            loop {
                let mut h = jtj.clone();
                for i in 0..n_params {
                    h[(i, i)] += lambda * (jtj[(i, i)] + 1e-9);
                }

                let step = h.lu().solve(&jtr).and_then(|delta| {
                    let mut candidate = params.clone();
                    for (i, p) in candidate.iter_mut().enumerate() {
                        *p += delta[i];
                    }
                    clamp(&mut candidate);
                    let candidate_error = Self::sum_squares(psf, positions, values, &candidate);
                    (candidate_error.is_finite() && candidate_error < error)
                        .then_some((candidate, candidate_error))
                });

                match step {
                    Some((candidate, candidate_error)) => {
                        let improvement = (error - candidate_error) / error.max(f64::MIN_POSITIVE);
                        params = candidate;
                        error = candidate_error;
                        lambda = (lambda / self.lambda_factor).max(1e-12);
                        if improvement < self.tolerance {
                            return Ok(LmSolution {
                                params,
                                iterations: iteration,
                                chi2: error,
                            });
                        }
                        break;
                    }
                    None => {
                        lambda *= self.lambda_factor;
                        if lambda > 1e10 {
                            // No downhill step left: at a minimum
                            return Ok(LmSolution {
                                params,
                                iterations: iteration,
                                chi2: error,
                            });
                        }
                    }
                }
            }
        }

        Err(FitError::NotConverged)
    }
}

/// Fitted Gaussian in the coordinates of the fitted window
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GaussianFit {
    pub model: StarModel,
    pub amplitude: f64,
    pub background: f64,
    pub x: f64,
    pub y: f64,
    pub sigma_x: f64,
    pub sigma_y: f64,
    /// Rotation angle in radians (0 for the symmetric model)
    pub theta: f64,
    pub r_squared: f64,
    pub rmse: f64,
    pub iterations: usize,
}

impl GaussianFit {
    /// Width from the narrower axis
    pub fn fwhm(&self) -> f64 {
        FWHM_PER_SIGMA * self.sigma_x.min(self.sigma_y)
    }

    /// Integrated flux of the Gaussian, 2π·A·σx·σy
    pub fn total_flux(&self) -> f64 {
        2.0 * PI * self.amplitude * self.sigma_x * self.sigma_y
    }

    /// Eccentricity (0 = circular, 1 = line)
    pub fn eccentricity(&self) -> f64 {
        let a = self.sigma_x.max(self.sigma_y);
        let b = self.sigma_x.min(self.sigma_y);
        if a > 0.0 {
            (1.0 - (b / a).powi(2)).sqrt()
        } else {
            0.0
        }
    }

    fn params(&self) -> Vec<f64> {
        match self.model {
            StarModel::Symmetric => vec![self.amplitude, self.background, self.x, self.y, self.sigma_x],
            StarModel::Elliptical => vec![
                self.amplitude,
                self.background,
                self.x,
                self.y,
                self.sigma_x,
                self.sigma_y,
                self.theta,
            ],
        }
    }

    pub fn value_at(&self, x: f64, y: f64) -> f64 {
        psf_for(self.model).value(x, y, &self.params())
    }
}

fn psf_for(model: StarModel) -> Box<dyn PSFFunction> {
    match model {
        StarModel::Symmetric => Box::new(SymmetricGaussianPSF),
        StarModel::Elliptical => Box::new(EllipticalGaussianPSF),
    }
}

/// A rectangular block of pixels, row-major, NaN for missing values
#[derive(Debug, Clone, PartialEq)]
pub struct PixelWindow {
    pub width: usize,
    pub height: usize,
    pub data: Vec<f64>,
}

impl PixelWindow {
    pub fn new(width: usize, height: usize, data: Vec<f64>) -> Self {
        Self {
            width,
            height,
            data,
        }
    }

    pub fn get(&self, x: usize, y: usize) -> f64 {
        self.data[y * self.width + x]
    }

    /// Brightest finite pixel as (x, y, value)
    pub fn peak(&self) -> Option<(usize, usize, f64)> {
        self.data
            .iter()
            .enumerate()
            .filter(|(_, v)| v.is_finite())
            .fold(None, |best: Option<(usize, f64)>, (i, &v)| match best {
                Some((_, bv)) if bv >= v => best,
                _ => Some((i, v)),
            })
            .map(|(i, v)| (i % self.width, i / self.width, v))
    }

    /// Sub-window clipped to the bounds, with its origin
    pub fn sub_window(&self, x0: usize, y0: usize, x1: usize, y1: usize) -> (usize, usize, PixelWindow) {
        let x1 = x1.min(self.width);
        let y1 = y1.min(self.height);
        let x0 = x0.min(x1);
        let y0 = y0.min(y1);
        let mut data = Vec::with_capacity((x1 - x0) * (y1 - y0));
        for y in y0..y1 {
            data.extend_from_slice(&self.data[y * self.width + x0..y * self.width + x1]);
        }
        (x0, y0, PixelWindow::new(x1 - x0, y1 - y0, data))
    }
}

/// PSF Fitter
#[derive(Debug, Clone)]
pub struct PSFFitter {
    model: StarModel,
    sigma_guess: f64,
    optimizer: LevenbergMarquardt,
}

impl PSFFitter {
    pub fn new(model: StarModel, sigma_guess: f64, max_iterations: usize) -> Self {
        Self {
            model,
            sigma_guess,
            optimizer: LevenbergMarquardt::with_max_iterations(max_iterations),
        }
    }

    pub fn model(&self) -> StarModel {
        self.model
    }

    /// Fit a Gaussian plus background to every finite pixel of `window`,
    /// starting from its brightest pixel and median background
    pub fn fit_window(&self, window: &PixelWindow) -> Result<GaussianFit, FitError> {
        let mut positions = Vec::with_capacity(window.data.len());
        let mut values = Vec::with_capacity(window.data.len());
        for (i, &v) in window.data.iter().enumerate() {
            if v.is_finite() {
                positions.push(((i % window.width) as f64, (i / window.width) as f64));
                values.push(v);
            }
        }
        let (peak_x, peak_y, peak_value) = window.peak().ok_or(FitError::NoSignal)?;

        let background = median(&values).ok_or(FitError::NoSignal)?;
        let amplitude = (peak_value - background).max(1.0);
        let w = window.width as f64;
        let h = window.height as f64;
        let sigma_max = (w.min(h) / 2.0).max(0.5);
        let sigma0 = self.sigma_guess.clamp(0.5, sigma_max);

        let (initial, lower, upper) = match self.model {
            StarModel::Symmetric => (
                vec![amplitude, background, peak_x as f64, peak_y as f64, sigma0],
                vec![0.0, f64::NEG_INFINITY, -0.5, -0.5, 0.5],
                vec![f64::INFINITY, f64::INFINITY, w - 0.5, h - 0.5, sigma_max],
            ),
            StarModel::Elliptical => (
                vec![amplitude, background, peak_x as f64, peak_y as f64, sigma0, sigma0, 0.0],
                vec![0.0, f64::NEG_INFINITY, -0.5, -0.5, 0.5, 0.5, -PI / 2.0],
                vec![f64::INFINITY, f64::INFINITY, w - 0.5, h - 0.5, w / 2.0, h / 2.0, PI / 2.0],
            ),
        };

        let psf = psf_for(self.model);
        let solution = self
            .optimizer
            .fit(&*psf, &positions, &values, &initial, &lower, &upper)?;
        let p = &solution.params;
        if p.iter().any(|v| !v.is_finite()) {
            return Err(FitError::NonFinite);
        }

        // Goodness of fit
        let mean_value = values.iter().sum::<f64>() / values.len() as f64;
        let sum_squared_total: f64 = values.iter().map(|v| (v - mean_value).powi(2)).sum();
        let r_squared = if sum_squared_total > 0.0 {
            1.0 - solution.chi2 / sum_squared_total
        } else {
            0.0
        };
        let rmse = (solution.chi2 / values.len() as f64).sqrt();

        let (sigma_x, sigma_y, theta) = match self.model {
            StarModel::Symmetric => (p[4].abs(), p[4].abs(), 0.0),
            StarModel::Elliptical => (p[4].abs(), p[5].abs(), p[6]),
        };

        Ok(GaussianFit {
            model: self.model,
            amplitude: p[0],
            background: p[1],
            x: p[2],
            y: p[3],
            sigma_x,
            sigma_y,
            theta,
            r_squared,
            rmse,
            iterations: solution.iterations,
        })
    }

    /// Observed, fitted and residual grids over `window` for visualization
    pub fn generate_residuals(
        &self,
        window: &PixelWindow,
        fit: &GaussianFit,
    ) -> (PixelWindow, PixelWindow, PixelWindow) {
        let mut fitted = Vec::with_capacity(window.data.len());
        let mut residuals = Vec::with_capacity(window.data.len());
        for (i, &observed) in window.data.iter().enumerate() {
            let x = (i % window.width) as f64;
            let y = (i / window.width) as f64;
            let model = fit.value_at(x, y);
            fitted.push(model);
            residuals.push(if observed.is_finite() { observed - model } else { f64::NAN });
        }
        (
            window.clone(),
            PixelWindow::new(window.width, window.height, fitted),
            PixelWindow::new(window.width, window.height, residuals),
        )
    }
}

/// Median of the values, averaging the middle pair for even counts
pub fn median(values: &[f64]) -> Option<f64> {
    let mut sorted: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
    if sorted.is_empty() {
        return None;
    }
    sorted.sort_by(|a, b| a.total_cmp(b));
    let mid = sorted.len() / 2;
    Some(if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gaussian_window(size: usize, x0: f64, y0: f64, sigma: f64, amp: f64, bg: f64) -> PixelWindow {
        let psf = SymmetricGaussianPSF;
        let data = (0..size * size)
            .map(|i| psf.value((i % size) as f64, (i / size) as f64, &[amp, bg, x0, y0, sigma]))
            .collect();
        PixelWindow::new(size, size, data)
    }

    fn numeric_gradient(psf: &dyn PSFFunction, x: f64, y: f64, params: &[f64]) -> Vec<f64> {
        let h = 1e-6;
        (0..params.len())
            .map(|j| {
                let mut up = params.to_vec();
                let mut down = params.to_vec();
                up[j] += h;
                down[j] -= h;
                (psf.value(x, y, &up) - psf.value(x, y, &down)) / (2.0 * h)
            })
            .collect()
    }

    #[test]
    fn test_analytic_gradients_match_numeric() {
        let elliptical = [500.0, 20.0, 4.3, 5.1, 2.0, 3.1, 0.4];
        let mut grad = vec![0.0; 7];
        for &(x, y) in &[(3.0, 4.0), (6.5, 2.0), (4.3, 8.0)] {
            EllipticalGaussianPSF.gradient(x, y, &elliptical, &mut grad);
            let numeric = numeric_gradient(&EllipticalGaussianPSF, x, y, &elliptical);
            for (a, n) in grad.iter().zip(&numeric) {
                assert!((a - n).abs() < 1e-4 * (1.0 + n.abs()), "{} vs {}", a, n);
            }
        }

        let symmetric = [500.0, 20.0, 4.3, 5.1, 2.5];
        let mut grad = vec![0.0; 5];
        SymmetricGaussianPSF.gradient(3.0, 7.0, &symmetric, &mut grad);
        let numeric = numeric_gradient(&SymmetricGaussianPSF, 3.0, 7.0, &symmetric);
        for (a, n) in grad.iter().zip(&numeric) {
            assert!((a - n).abs() < 1e-4 * (1.0 + n.abs()));
        }
    }

    #[test]
    fn test_symmetric_fit_recovers_parameters() {
        let window = gaussian_window(21, 10.3, 9.6, 2.2, 1000.0, 50.0);
        let fitter = PSFFitter::new(StarModel::Symmetric, 3.0, 200);
        let fit = fitter.fit_window(&window).unwrap();
        assert!((fit.x - 10.3).abs() < 1e-3, "x = {}", fit.x);
        assert!((fit.y - 9.6).abs() < 1e-3, "y = {}", fit.y);
        assert!((fit.sigma_x - 2.2).abs() < 1e-3);
        assert!((fit.amplitude - 1000.0).abs() < 0.5);
        assert!((fit.background - 50.0).abs() < 0.5);
        assert!(fit.r_squared > 0.999);
        assert!((fit.fwhm() - 2.2 * FWHM_PER_SIGMA).abs() < 1e-2);
    }

    #[test]
    fn test_elliptical_fit_reports_narrow_axis() {
        let psf = EllipticalGaussianPSF;
        let truth = [800.0, 10.0, 10.0, 11.0, 1.8, 3.0, 0.3];
        let data = (0..21 * 21)
            .map(|i| psf.value((i % 21) as f64, (i / 21) as f64, &truth))
            .collect();
        let window = PixelWindow::new(21, 21, data);
        let fit = PSFFitter::new(StarModel::Elliptical, 3.0, 200)
            .fit_window(&window)
            .unwrap();
        assert!((fit.x - 10.0).abs() < 1e-2);
        assert!((fit.y - 11.0).abs() < 1e-2);
        assert!((fit.sigma_x.min(fit.sigma_y) - 1.8).abs() < 1e-2);
        assert!((fit.sigma_x.max(fit.sigma_y) - 3.0).abs() < 1e-2);
        assert!(fit.eccentricity() > 0.7);
    }

    #[test]
    fn test_nan_pixels_are_ignored() {
        let mut window = gaussian_window(15, 7.0, 7.0, 2.0, 400.0, 10.0);
        window.data[0] = f64::NAN;
        window.data[20] = f64::NAN;
        let fit = PSFFitter::new(StarModel::Symmetric, 3.0, 200)
            .fit_window(&window)
            .unwrap();
        assert!((fit.x - 7.0).abs() < 1e-3);

        let (_, fitted, residuals) = PSFFitter::new(StarModel::Symmetric, 3.0, 200)
            .generate_residuals(&window, &fit);
        assert!(residuals.data[0].is_nan());
        assert!(fitted.data[0].is_finite());
        assert!(residuals.data[7 * 15 + 7].abs() < 1e-2);
    }

    #[test]
    fn test_all_nan_window_has_no_signal() {
        let window = PixelWindow::new(5, 5, vec![f64::NAN; 25]);
        let err = PSFFitter::new(StarModel::Symmetric, 3.0, 200)
            .fit_window(&window)
            .unwrap_err();
        assert_eq!(err, FitError::NoSignal);
    }

    #[test]
    fn test_too_few_points() {
        let window = PixelWindow::new(2, 2, vec![1.0, 2.0, 3.0, 4.0]);
        let err = PSFFitter::new(StarModel::Symmetric, 3.0, 200)
            .fit_window(&window)
            .unwrap_err();
        assert!(matches!(err, FitError::TooFewPoints { points: 4, params: 5 }));
    }

    #[test]
    fn test_peak_and_sub_window() {
        let window = gaussian_window(9, 6.0, 2.0, 1.0, 100.0, 0.0);
        assert_eq!(window.peak().map(|(x, y, _)| (x, y)), Some((6, 2)));
        let (x0, y0, sub) = window.sub_window(4, 0, 12, 5);
        assert_eq!((x0, y0, sub.width, sub.height), (4, 0, 5, 5));
        assert_eq!(sub.get(2, 2), window.get(6, 2));
    }

    #[test]
    fn test_median() {
        assert_eq!(median(&[3.0, 1.0, 2.0]), Some(2.0));
        assert_eq!(median(&[4.0, 1.0, 2.0, 3.0]), Some(2.5));
        assert_eq!(median(&[f64::NAN]), None);
    }

    #[test]
    fn test_star_model_parsing() {
        assert_eq!("Elliptical".parse::<StarModel>(), Ok(StarModel::Elliptical));
        assert_eq!("gaussian".parse::<StarModel>(), Ok(StarModel::Symmetric));
        assert!("moffat".parse::<StarModel>().is_err());
    }
}
