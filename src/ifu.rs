//! Collapse of VIRUS-W IFU exposures to one flux value per fiber
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::error::IfuError;
use crate::fits::FitsImage;
use crate::psf_fitting::median;

/// Unbinned detector height; shorter images are y-binned by two
const FULL_HEIGHT: usize = 4096;
/// Narrower images are x-binned, which the fiber table does not describe
const MIN_WIDTH: usize = 2048;

/// Amplifier A data columns and its overscan strip
const AMP_A_DATA: (usize, usize) = (0, 1025);
const AMP_A_OVERSCAN: (usize, usize) = (1030, 1060);
/// Amplifier B data starts here and runs to the right edge
const AMP_B_DATA_START: usize = 1124;
const AMP_B_OVERSCAN: (usize, usize) = (1090, 1120);

/// Row the extraction boxes are centered on (unbinned)
const Y_CUT: f64 = 2048.0;
const BOX_WIDTH: f64 = 6.0;
/// Box height in unbinned rows
const BOX_HEIGHT: f64 = 300.0;
/// Pixels further than KAPPA standard deviations from the box median are dropped
const KAPPA: f64 = 2.0;

#[derive(Debug, Clone, PartialEq)]
pub struct Fiber {
    pub id: u32,
    /// Sky position in arcsec, y flipped to match the guider orientation
    pub x: f64,
    pub y: f64,
    /// Column of the fiber trace on the stitched detector image
    pub detector_x: f64,
}

/// Fiber positions from the whitespace table `id x y detector_x`
#[derive(Debug, Clone, PartialEq)]
pub struct FiberTable {
    pub fibers: Vec<Fiber>,
}

impl FiberTable {
    pub fn load(path: &Path) -> Result<Self, IfuError> {
        let text = std::fs::read_to_string(path).map_err(|source| IfuError::FiberTableIo {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&text, path)
    }

    pub fn parse(text: &str, source: &Path) -> Result<Self, IfuError> {
        let mut fibers = Vec::new();
        for (i, raw) in text.lines().enumerate() {
            let line = raw.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }
            let invalid = |message: String| IfuError::FiberTable {
                path: source.to_path_buf(),
                line: i + 1,
                message,
            };
            let columns: Vec<&str> = line.split_whitespace().collect();
            if columns.len() < 4 {
                return Err(invalid(format!("expected 4 columns, found {}", columns.len())));
            }
            let number = |s: &str| {
                s.parse::<f64>()
                    .map_err(|_| invalid(format!("'{}' is not a number", s)))
            };
            let id = number(columns[0])?;
            fibers.push(Fiber {
                id: id as u32,
                x: number(columns[1])?,
                y: -number(columns[2])?,
                detector_x: number(columns[3])?,
            });
        }
        if fibers.is_empty() {
            return Err(IfuError::NoFibers(source.to_path_buf()));
        }
        Ok(Self { fibers })
    }

    pub fn len(&self) -> usize {
        self.fibers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fibers.is_empty()
    }
}

/// Mean flux per fiber of one exposure
#[derive(Debug, Clone)]
pub struct CollapsedIfu {
    pub source: PathBuf,
    pub fibers: Vec<Fiber>,
    /// NaN where the extraction box held no usable pixels
    pub flux: Vec<f64>,
}

impl CollapsedIfu {
    /// `ln(flux + 0.1)` with non-positive fluxes raised to 0.1
    pub fn log_flux(&self) -> Vec<f64> {
        self.flux
            .iter()
            .map(|&f| if f <= 0.0 { 0.1 } else { f })
            .map(|f| (f + 0.1).ln())
            .collect()
    }

    /// Min and max of the finite log fluxes
    pub fn log_flux_range(&self) -> Option<(f64, f64)> {
        self.log_flux()
            .into_iter()
            .filter(|v| v.is_finite())
            .fold(None, |range, v| match range {
                None => Some((v, v)),
                Some((lo, hi)) => Some((lo.min(v), hi.max(v))),
            })
    }

    pub fn title(&self) -> String {
        self.source
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

fn column_block_median(image: &FitsImage, columns: (usize, usize)) -> f64 {
    let x1 = columns.1.min(image.width);
    let mut values = Vec::with_capacity(image.height * x1.saturating_sub(columns.0));
    for y in 0..image.height {
        for x in columns.0.min(x1)..x1 {
            values.push(image.get(x, y));
        }
    }
    median(&values).unwrap_or(0.0)
}

/// Subtract each amplifier's overscan median and join the two data regions
pub fn stitch_amplifiers(image: &FitsImage) -> FitsImage {
    let bias_a = column_block_median(image, AMP_A_OVERSCAN);
    let bias_b = column_block_median(image, AMP_B_OVERSCAN);
    debug!("Overscan levels: A {:.1}, B {:.1}", bias_a, bias_b);

    let a_end = AMP_A_DATA.1.min(image.width);
    let b_start = AMP_B_DATA_START.min(image.width);
    let width = (a_end - AMP_A_DATA.0) + (image.width - b_start);
    let mut data = Vec::with_capacity(width * image.height);
    for y in 0..image.height {
        let row = &image.data[y * image.width..(y + 1) * image.width];
        data.extend(row[AMP_A_DATA.0..a_end].iter().map(|v| v - bias_a));
        data.extend(row[b_start..].iter().map(|v| v - bias_b));
    }
    FitsImage {
        width,
        height: image.height,
        data,
    }
}

/// Mean of the box after dropping pixels more than KAPPA standard
/// deviations away from the box median
fn box_flux(image: &FitsImage, x_range: (i64, i64), y_range: (i64, i64)) -> f64 {
    let clamp_x = |v: i64| v.clamp(0, image.width as i64) as usize;
    let clamp_y = |v: i64| v.clamp(0, image.height as i64) as usize;
    let mut values = Vec::new();
    for y in clamp_y(y_range.0)..clamp_y(y_range.1) {
        for x in clamp_x(x_range.0)..clamp_x(x_range.1) {
            let v = image.get(x, y);
            if v.is_finite() {
                values.push(v);
            }
        }
    }
    let Some(center) = median(&values) else {
        return f64::NAN;
    };
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let std = (values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n).sqrt();
    let kept: Vec<f64> = values
        .into_iter()
        .filter(|v| (v - center).abs() <= KAPPA * std)
        .collect();
    if kept.is_empty() {
        return f64::NAN;
    }
    kept.iter().sum::<f64>() / kept.len() as f64
}

/// Collapse a raw exposure to one flux per fiber
pub fn collapse(image: &FitsImage, fibers: &FiberTable, source: &Path) -> Result<CollapsedIfu, IfuError> {
    if image.width < MIN_WIDTH {
        return Err(IfuError::XBinned {
            path: source.to_path_buf(),
            width: image.width,
        });
    }
    let (y_cut, box_height) = if image.height < FULL_HEIGHT {
        debug!("{} rows, treating as y-binned", image.height);
        (Y_CUT / 2.0, BOX_HEIGHT / 2.0)
    } else {
        (Y_CUT, BOX_HEIGHT)
    };

    let stitched = stitch_amplifiers(image);
    let y_range = (
        (y_cut - box_height / 2.0) as i64,
        (y_cut + box_height / 2.0) as i64,
    );
    let flux = fibers
        .fibers
        .iter()
        .map(|fiber| {
            let x_range = (
                (fiber.detector_x - BOX_WIDTH / 2.0) as i64,
                (fiber.detector_x + BOX_WIDTH / 2.0) as i64,
            );
            box_flux(&stitched, x_range, y_range)
        })
        .collect();

    Ok(CollapsedIfu {
        source: source.to_path_buf(),
        fibers: fibers.fibers.clone(),
        flux,
    })
}

/// Read an exposure and collapse it
pub fn load_ifu_data(path: &Path, fibers: &FiberTable) -> Result<CollapsedIfu, IfuError> {
    info!("Reading {}", path.display());
    let image = FitsImage::from_file(path)?;
    collapse(&image, fibers, path)
}
