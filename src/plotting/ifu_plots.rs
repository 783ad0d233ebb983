//! Fiber map of a collapsed IFU exposure
use image::RgbImage;
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_polygon_mut};
use imageproc::point::Point;
use imageproc::rect::Rect;
use std::path::{Path, PathBuf};
use tracing::info;

use super::text_render::{draw_text, draw_text_centered};
use super::{blank_canvas, format_tick, save_png, Axes, ColorMap, FOREGROUND, MISSING};
use crate::error::PlotError;
use crate::ifu::CollapsedIfu;

const MAP_RECT: (u32, u32, u32, u32) = (40, 60, 600, 600);
const COLORBAR_LEFT: u32 = 680;
const COLORBAR_WIDTH: u32 = 24;

/// `<output>/<stem>_quicklook.png`
pub fn quicklook_path(output_dir: &Path, ifu: &CollapsedIfu) -> PathBuf {
    output_dir.join(format!("{}_quicklook.png", ifu.title()))
}

fn hexagon(center: (f32, f32), radius: f32) -> Vec<Point<i32>> {
    // pointy-top hexagon
    (0..6)
        .map(|i| {
            let angle = std::f32::consts::PI / 3.0 * i as f32 + std::f32::consts::PI / 6.0;
            Point::new(
                (center.0 + radius * angle.cos()).round() as i32,
                (center.1 + radius * angle.sin()).round() as i32,
            )
        })
        .collect()
}

/// Half the smallest canvas distance between two fibers
fn marker_radius(points: &[(f32, f32)]) -> f32 {
    let mut min_dist = f32::INFINITY;
    for (i, a) in points.iter().enumerate() {
        for b in &points[i + 1..] {
            let d = ((a.0 - b.0).powi(2) + (a.1 - b.1).powi(2)).sqrt();
            if d > 0.0 {
                min_dist = min_dist.min(d);
            }
        }
    }
    if min_dist.is_finite() {
        (min_dist / 2.0).clamp(3.0, 24.0)
    } else {
        12.0
    }
}

/// Draw every fiber as a hexagon colored by its normalized log flux
pub fn render_quicklook(ifu: &CollapsedIfu, cmap: ColorMap) -> Result<RgbImage, PlotError> {
    let (lo, hi) = ifu
        .log_flux_range()
        .ok_or_else(|| PlotError::Empty(format!("{} has no finite fiber fluxes", ifu.title())))?;
    let xs: Vec<f64> = ifu.fibers.iter().map(|f| f.x).collect();
    let ys: Vec<f64> = ifu.fibers.iter().map(|f| f.y).collect();
    let axes = Axes::fit_equal(MAP_RECT, &xs, &ys)
        .ok_or_else(|| PlotError::Empty(format!("{} has no fiber positions", ifu.title())))?;

    let mut img = blank_canvas(780, 720);
    draw_text_centered(&mut img, MAP_RECT.0 + MAP_RECT.2 / 2, 12, &ifu.title(), FOREGROUND, 3);

    let centers: Vec<(f32, f32)> = xs.iter().zip(&ys).map(|(&x, &y)| axes.to_pixel(x, y)).collect();
    let radius = marker_radius(&centers);
    let span = if hi > lo { hi - lo } else { 1.0 };
    for (center, value) in centers.iter().zip(ifu.log_flux()) {
        let color = if value.is_finite() {
            cmap.color((value - lo) / span)
        } else {
            MISSING
        };
        draw_polygon_mut(&mut img, &hexagon(*center, radius), color);
    }

    // colorbar, maximum at the top
    let (bar_top, bar_height) = (MAP_RECT.1, MAP_RECT.3);
    for row in 0..bar_height {
        let t = 1.0 - row as f64 / (bar_height - 1) as f64;
        draw_filled_rect_mut(
            &mut img,
            Rect::at(COLORBAR_LEFT as i32, (bar_top + row) as i32).of_size(COLORBAR_WIDTH, 1),
            cmap.color(t),
        );
    }
    draw_hollow_rect_mut(
        &mut img,
        Rect::at(COLORBAR_LEFT as i32, bar_top as i32).of_size(COLORBAR_WIDTH, bar_height),
        FOREGROUND,
    );
    let label_x = COLORBAR_LEFT + COLORBAR_WIDTH + 6;
    draw_text(&mut img, label_x, bar_top, &format_tick(hi), FOREGROUND, 1);
    draw_text(&mut img, label_x, bar_top + bar_height - 7, &format_tick(lo), FOREGROUND, 1);
    draw_text(&mut img, COLORBAR_LEFT - 4, bar_top - 14, "LN FLUX", FOREGROUND, 1);

    let range = format!("VALUE RANGE: {:.2} (MIN), {:.2} (MAX)", lo, hi);
    draw_text_centered(&mut img, MAP_RECT.0 + MAP_RECT.2 / 2, 690, &range, FOREGROUND, 2);
    Ok(img)
}

/// Render and save the quicklook PNG into `output_dir`
pub fn plot_quicklook(
    ifu: &CollapsedIfu,
    cmap: ColorMap,
    output_dir: &Path,
) -> Result<PathBuf, PlotError> {
    let img = render_quicklook(ifu, cmap)?;
    let path = quicklook_path(output_dir, ifu);
    save_png(&img, &path)?;
    info!("Wrote quicklook {}", path.display());
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ifu::tests::{raw_exposure, FIBER_TABLE};
    use crate::ifu::{collapse, FiberTable};

    fn collapsed() -> CollapsedIfu {
        let table = FiberTable::parse(FIBER_TABLE, Path::new("IFUcen.txt")).unwrap();
        collapse(&raw_exposure(), &table, Path::new("/data/vw004123.fits")).unwrap()
    }

    #[test]
    fn test_brightest_fiber_gets_top_color() {
        let ifu = collapsed();
        let axes = Axes::fit_equal(MAP_RECT, &[0.0, 3.2, -3.2], &[-1.5, 1.0, 0.0]).unwrap();
        let brightest = axes.to_pixel(0.0, -1.5);
        let faintest = axes.to_pixel(-3.2, 0.0);
        for cmap in [ColorMap::Viridis, ColorMap::Grayscale] {
            let img = render_quicklook(&ifu, cmap).unwrap();
            let pixel = |(x, y): (f32, f32)| *img.get_pixel(x as u32, y as u32);
            assert_eq!(pixel(brightest), cmap.color(1.0), "{:?}", cmap);
            assert_eq!(pixel(faintest), cmap.color(0.0), "{:?}", cmap);
        }
        assert_eq!(ColorMap::default(), ColorMap::Grayscale);
    }

    #[test]
    fn test_quicklook_file_name() {
        let ifu = collapsed();
        let dir = tempfile::tempdir().unwrap();
        let path = plot_quicklook(&ifu, ColorMap::default(), dir.path()).unwrap();
        assert_eq!(path, dir.path().join("vw004123_quicklook.png"));
        assert!(path.is_file());
    }

    #[test]
    fn test_all_nan_fluxes_are_not_plotted() {
        let mut ifu = collapsed();
        ifu.flux = vec![f64::NAN; ifu.fibers.len()];
        assert!(matches!(render_quicklook(&ifu, ColorMap::Viridis), Err(PlotError::Empty(_))));
    }

    #[test]
    fn test_marker_radius() {
        assert_eq!(marker_radius(&[(0.0, 0.0), (10.0, 0.0), (40.0, 0.0)]), 5.0);
        assert_eq!(marker_radius(&[(0.0, 0.0)]), 12.0);
    }
}
