/// Midtone Transfer Function (MTF) stretching for display of guider data
/// Based on N.I.N.A.'s auto-stretch: shadows are clipped relative to the
/// median and MAD, then the midtones are pulled towards a target level
use crate::psf_fitting::median;

/// MAD to sigma conversion factor
const MAD_TO_SIGMA: f64 = 1.4826;

/// Configuration for MTF stretching matching N.I.N.A. defaults
#[derive(Debug, Clone, Copy)]
pub struct StretchParameters {
    pub factor: f64,         // Target histogram median position
    pub black_clipping: f64, // Shadow clipping in MAD units
}

impl Default for StretchParameters {
    fn default() -> Self {
        Self {
            factor: 0.2,          // N.I.N.A. default AutoStretchFactor
            black_clipping: -2.8, // N.I.N.A. default BlackClipping
        }
    }
}

/// Display stretch fitted to one set of pixels
#[derive(Debug, Clone, Copy)]
pub struct Stretch {
    low: f64,
    range: f64,
    shadows: f64,
    midtones: f64,
    highlights: f64,
}

impl Stretch {
    /// Fit the stretch to the finite values of `data`. `None` when there are
    /// no finite values.
    pub fn fit(data: &[f64], params: StretchParameters) -> Option<Self> {
        let (low, high) = finite_range(data)?;
        let range = if high > low { high - low } else { 1.0 };
        let normalized: Vec<f64> = data
            .iter()
            .filter(|v| v.is_finite())
            .map(|v| (v - low) / range)
            .collect();
        let med = median(&normalized)?;
        let deviations: Vec<f64> = normalized.iter().map(|v| (v - med).abs()).collect();
        let mad = median(&deviations).unwrap_or(0.0);

        let (shadows, midtones, highlights) = if med > 0.5 {
            // inverted or overexposed
            let highlights = med - params.black_clipping * mad * MAD_TO_SIGMA;
            let midtones = midtones_transfer_function(params.factor, 1.0 - (highlights - med));
            (0.0, midtones, highlights)
        } else {
            let shadows = (med + params.black_clipping * mad * MAD_TO_SIGMA).max(0.0);
            let midtones = midtones_transfer_function(params.factor, med - shadows);
            (shadows, midtones, 1.0)
        };

        Some(Self {
            low,
            range,
            shadows,
            midtones,
            highlights,
        })
    }

    /// Map a raw value to 0..1; NaN stays NaN
    pub fn apply(&self, value: f64) -> f64 {
        if !value.is_finite() {
            return f64::NAN;
        }
        let normalized = (value - self.low) / self.range;
        let input = (1.0 - self.highlights + normalized - self.shadows).clamp(0.0, 1.0);
        midtones_transfer_function(self.midtones, input)
    }
}

/// Min and max of the finite values
pub fn finite_range(data: &[f64]) -> Option<(f64, f64)> {
    data.iter()
        .copied()
        .filter(|v| v.is_finite())
        .fold(None, |range, v| match range {
            None => Some((v, v)),
            Some((lo, hi)) => Some((lo.min(v), hi.max(v))),
        })
}

/// Midtones Transfer Function (MTF)
/// This is the key stretching function used by N.I.N.A.
fn midtones_transfer_function(midtone_balance: f64, x: f64) -> f64 {
    if x > 0.0 {
        if x < 1.0 {
            return (midtone_balance - 1.0) * x
                / ((2.0 * midtone_balance - 1.0) * x - midtone_balance);
        }
        return 1.0;
    }
    0.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_midtones_transfer_function() {
        // Test boundary conditions
        assert_eq!(midtones_transfer_function(0.5, 0.0), 0.0);
        assert_eq!(midtones_transfer_function(0.5, 1.0), 1.0);
        assert_eq!(midtones_transfer_function(0.5, 0.5), 0.5);

        // Test typical values
        let mtf = midtones_transfer_function(0.5, 0.25);
        assert!(mtf > 0.0 && mtf < 0.5);

        let mtf = midtones_transfer_function(0.5, 0.75);
        assert!(mtf > 0.5 && mtf < 1.0);
    }

    #[test]
    fn test_stretch_brightens_faint_background() {
        // sky around 100 with a little scatter, one bright star pixel
        let mut data: Vec<f64> = (0..100).map(|i| 100.0 + (i % 5) as f64).collect();
        data.push(5000.0);
        let stretch = Stretch::fit(&data, StretchParameters::default()).unwrap();

        let sky = stretch.apply(102.0);
        let star = stretch.apply(5000.0);
        assert!(sky > 0.0 && sky < star);
        assert_eq!(star, 1.0);
        // the linear position of the sky is ~0.0004; the stretch lifts it
        assert!(sky > 0.01, "sky = {}", sky);
        assert!(stretch.apply(f64::NAN).is_nan());
    }

    #[test]
    fn test_stretch_of_empty_or_constant_data() {
        assert!(Stretch::fit(&[f64::NAN, f64::NAN], StretchParameters::default()).is_none());
        let flat = Stretch::fit(&[3.0; 10], StretchParameters::default()).unwrap();
        let v = flat.apply(3.0);
        assert!((0.0..=1.0).contains(&v));
        assert_eq!(finite_range(&[2.0, f64::NAN, -1.0]), Some((-1.0, 2.0)));
    }
}
