//! Iterative sigma clipping of per-frame measurements

use crate::psf_fitting::median;

/// Mean and population standard deviation of the kept values
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize)]
pub struct ClippedStats {
    pub mean: f64,
    pub std: f64,
    pub kept: usize,
    pub total: usize,
}

fn mean_std(values: impl Iterator<Item = f64> + Clone) -> Option<(f64, f64)> {
    let n = values.clone().count();
    if n == 0 {
        return None;
    }
    let mean = values.clone().sum::<f64>() / n as f64;
    let var = values.map(|v| (v - mean).powi(2)).sum::<f64>() / n as f64;
    Some((mean, var.sqrt()))
}

/// Kept-mask of an iterative, median-centered sigma clip. Each pass
/// rejects values further than `sigma` standard deviations from the median
/// of the values kept so far; stops when nothing changes or after
/// `max_iters` passes. Non-finite values are never kept.
pub fn sigma_clip_mask(values: &[f64], sigma: f64, max_iters: usize) -> Vec<bool> {
    clip_mask(values, sigma, max_iters, true)
}

fn clip_mask(values: &[f64], sigma: f64, max_iters: usize, two_sided: bool) -> Vec<bool> {
    let mut kept: Vec<bool> = values.iter().map(|v| v.is_finite()).collect();
    for _ in 0..max_iters {
        let current: Vec<f64> = values
            .iter()
            .zip(&kept)
            .filter(|(_, k)| **k)
            .map(|(v, _)| *v)
            .collect();
        let (Some(center), Some((_, std))) = (median(&current), mean_std(current.iter().copied())) else {
            break;
        };

        let mut changed = false;
        for (v, k) in values.iter().zip(kept.iter_mut()) {
            if !*k {
                continue;
            }
            let deviation = if two_sided { (v - center).abs() } else { v - center };
            if deviation > sigma * std {
                *k = false;
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }
    kept
}

/// Kept-mask for centroids, clipping on the distance from the median
/// centroid. Only distances that are too large are rejected. A single
/// centroid is always kept.
pub fn distance_clip_mask(points: &[(f64, f64)], sigma: f64, max_iters: usize) -> Vec<bool> {
    match points.len() {
        0 => return Vec::new(),
        1 => return vec![points[0].0.is_finite() && points[0].1.is_finite()],
        _ => {}
    }
    let xs: Vec<f64> = points.iter().map(|p| p.0).collect();
    let ys: Vec<f64> = points.iter().map(|p| p.1).collect();
    let (Some(mx), Some(my)) = (median(&xs), median(&ys)) else {
        return vec![false; points.len()];
    };
    let distances: Vec<f64> = points.iter().map(|(x, y)| (x - mx).hypot(y - my)).collect();
    clip_mask(&distances, sigma, max_iters, false)
}

/// Statistics over the entries selected by `mask`
pub fn masked_stats(values: &[f64], mask: &[bool]) -> Option<ClippedStats> {
    let kept = values
        .iter()
        .zip(mask)
        .filter(|(v, k)| **k && v.is_finite())
        .map(|(v, _)| *v);
    let (mean, std) = mean_std(kept.clone())?;
    Some(ClippedStats {
        mean,
        std,
        kept: kept.count(),
        total: values.len(),
    })
}

/// Sigma-clipped mean and standard deviation
pub fn clipped_stats(values: &[f64], sigma: f64, max_iters: usize) -> Option<ClippedStats> {
    masked_stats(values, &sigma_clip_mask(values, sigma, max_iters))
}
