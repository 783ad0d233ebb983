//! PNG and GIF diagnostics drawn directly with `image`/`imageproc`
pub mod guider_plots;
pub mod ifu_plots;
pub mod stretch;
pub mod text_render;

use image::codecs::gif::{GifEncoder, Repeat};
use image::codecs::png::{CompressionType, FilterType, PngEncoder};
use image::{ColorType, Delay, DynamicImage, Frame, ImageEncoder, Rgb, RgbImage};
use imageproc::drawing::{
    draw_filled_circle_mut, draw_hollow_rect_mut, draw_line_segment_mut,
};
use imageproc::rect::Rect;
use std::fs::File;
use std::io::BufWriter;
use std::path::Path;

use crate::error::PlotError;
use text_render::{draw_text, draw_text_centered, text_width};

pub const BACKGROUND: Rgb<u8> = Rgb([255, 255, 255]);
pub const FOREGROUND: Rgb<u8> = Rgb([20, 20, 20]);
pub const GRID: Rgb<u8> = Rgb([200, 200, 200]);
/// Pixels without data
pub const MISSING: Rgb<u8> = Rgb([90, 30, 90]);
pub const BLUE: Rgb<u8> = Rgb([31, 119, 180]);
pub const ORANGE: Rgb<u8> = Rgb([255, 127, 14]);
pub const GREEN: Rgb<u8> = Rgb([44, 160, 44]);
pub const RED: Rgb<u8> = Rgb([214, 39, 40]);

/// Cycle used to tell dither positions apart
pub const PALETTE: [Rgb<u8>; 6] = [
    BLUE,
    ORANGE,
    GREEN,
    RED,
    Rgb([148, 103, 189]),
    Rgb([140, 86, 75]),
];

const VIRIDIS: [[f64; 3]; 9] = [
    [68.0, 1.0, 84.0],
    [71.0, 44.0, 122.0],
    [59.0, 81.0, 139.0],
    [44.0, 113.0, 142.0],
    [33.0, 144.0, 141.0],
    [39.0, 173.0, 129.0],
    [92.0, 200.0, 99.0],
    [170.0, 220.0, 50.0],
    [253.0, 231.0, 37.0],
];

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum ColorMap {
    #[default]
    Grayscale,
    /// Blue-white-red, 0.5 is white
    Residual,
    Viridis,
}

impl ColorMap {
    /// Color for a value in 0..1; out-of-range values are clamped, NaN is
    /// drawn as [`MISSING`]
    pub fn color(self, value: f64) -> Rgb<u8> {
        if !value.is_finite() {
            return MISSING;
        }
        let clamped = value.clamp(0.0, 1.0);
        match self {
            ColorMap::Grayscale => {
                let gray = (255.0 * clamped) as u8;
                Rgb([gray, gray, gray])
            }
            ColorMap::Residual => {
                if clamped < 0.5 {
                    // Blue to white (negative residuals)
                    let t = clamped * 2.0;
                    let c = (255.0 * t) as u8;
                    Rgb([c, c, 255])
                } else {
                    // White to red (positive residuals)
                    let t = (clamped - 0.5) * 2.0;
                    let c = (255.0 * (1.0 - t)) as u8;
                    Rgb([255, c, c])
                }
            }
            ColorMap::Viridis => {
                let pos = clamped * (VIRIDIS.len() - 1) as f64;
                let i = (pos.floor() as usize).min(VIRIDIS.len() - 2);
                let t = pos - i as f64;
                let (a, b) = (VIRIDIS[i], VIRIDIS[i + 1]);
                Rgb([
                    (a[0] + t * (b[0] - a[0])).round() as u8,
                    (a[1] + t * (b[1] - a[1])).round() as u8,
                    (a[2] + t * (b[2] - a[2])).round() as u8,
                ])
            }
        }
    }
}

pub fn blank_canvas(width: u32, height: u32) -> RgbImage {
    RgbImage::from_pixel(width, height, BACKGROUND)
}

fn create_plot_file(path: &Path) -> Result<BufWriter<File>, PlotError> {
    let io_error = |source| PlotError::Io {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(io_error)?;
    }
    File::create(path).map(BufWriter::new).map_err(io_error)
}

/// Write an RGB image as PNG, creating the parent directory
pub fn save_png(img: &RgbImage, path: &Path) -> Result<(), PlotError> {
    let writer = create_plot_file(path)?;
    let encoder = PngEncoder::new_with_quality(writer, CompressionType::Best, FilterType::Adaptive);
    encoder
        .write_image(img, img.width(), img.height(), ColorType::Rgb8.into())
        .map_err(|source| PlotError::Encode {
            path: path.to_path_buf(),
            source,
        })
}

/// Write equally sized frames as a looping GIF, `delay_ms` per frame
pub fn save_gif(frames: &[RgbImage], delay_ms: u32, path: &Path) -> Result<(), PlotError> {
    if frames.is_empty() {
        return Err(PlotError::Empty(format!("no frames for {}", path.display())));
    }
    let encode_error = |source| PlotError::Encode {
        path: path.to_path_buf(),
        source,
    };
    let mut encoder = GifEncoder::new_with_speed(create_plot_file(path)?, 10);
    encoder.set_repeat(Repeat::Infinite).map_err(encode_error)?;
    let delay = Delay::from_numer_denom_ms(delay_ms, 1);
    encoder
        .encode_frames(frames.iter().map(|img| {
            let rgba = DynamicImage::ImageRgb8(img.clone()).into_rgba8();
            Frame::from_parts(rgba, 0, 0, delay)
        }))
        .map_err(encode_error)
}

/// Placement of a resampled data grid on the canvas
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Placement {
    pub left: u32,
    pub top: u32,
    pub width: u32,
    pub height: u32,
    /// Canvas pixels per data pixel
    pub scale: f64,
}

impl Placement {
    /// Canvas position of the center of 0-based data pixel `(x, y)`
    pub fn to_canvas(&self, x: f64, y: f64) -> (f32, f32) {
        (
            (self.left as f64 + (x + 0.5) * self.scale) as f32,
            (self.top as f64 + (y + 0.5) * self.scale) as f32,
        )
    }

    pub fn draw_border(&self, img: &mut RgbImage, color: Rgb<u8>) {
        if self.width == 0 || self.height == 0 {
            return;
        }
        draw_hollow_rect_mut(
            img,
            Rect::at(self.left as i32 - 1, self.top as i32 - 1).of_size(self.width + 2, self.height + 2),
            color,
        );
    }
}

/// Paint a row-major grid scaled (nearest neighbour) so its longer side is
/// `size` canvas pixels. Row 0 is drawn at the top.
pub fn paint_grid<F>(
    img: &mut RgbImage,
    left: u32,
    top: u32,
    grid: (usize, usize, &[f64]),
    size: u32,
    color: F,
) -> Placement
where
    F: Fn(f64) -> Rgb<u8>,
{
    let (width, height, data) = grid;
    let longest = width.max(height).max(1);
    let scale = size as f64 / longest as f64;
    let out_w = (width as f64 * scale).round() as u32;
    let out_h = (height as f64 * scale).round() as u32;
    for py in 0..out_h {
        let y = ((py as f64 / scale) as usize).min(height.saturating_sub(1));
        for px in 0..out_w {
            let x = ((px as f64 / scale) as usize).min(width.saturating_sub(1));
            let (cx, cy) = (left + px, top + py);
            if cx < img.width() && cy < img.height() {
                let value = data.get(y * width + x).copied().unwrap_or(f64::NAN);
                img.put_pixel(cx, cy, color(value));
            }
        }
    }
    Placement {
        left,
        top,
        width: out_w,
        height: out_h,
        scale,
    }
}

/// Small `+` marker
pub fn draw_plus(img: &mut RgbImage, center: (f32, f32), size: f32, color: Rgb<u8>) {
    let (x, y) = center;
    draw_line_segment_mut(img, (x - size, y), (x + size, y), color);
    draw_line_segment_mut(img, (x, y - size), (x, y + size), color);
}

/// Small `x` marker
pub fn draw_x(img: &mut RgbImage, center: (f32, f32), size: f32, color: Rgb<u8>) {
    let (x, y) = center;
    draw_line_segment_mut(img, (x - size, y - size), (x + size, y + size), color);
    draw_line_segment_mut(img, (x - size, y + size), (x + size, y - size), color);
}

/// Compact label for an axis limit
pub fn format_tick(value: f64) -> String {
    let magnitude = value.abs();
    if magnitude >= 1000.0 {
        format!("{:.0}", value)
    } else if magnitude >= 10.0 {
        format!("{:.1}", value)
    } else {
        format!("{:.2}", value)
    }
}

/// Rectangular plot area mapping data coordinates to canvas pixels
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Axes {
    pub left: u32,
    pub top: u32,
    pub width: u32,
    pub height: u32,
    pub x_range: (f64, f64),
    pub y_range: (f64, f64),
}

fn padded_range(values: &[f64], pad_fraction: f64) -> Option<(f64, f64)> {
    let (lo, hi) = stretch::finite_range(values)?;
    if hi > lo {
        let pad = (hi - lo) * pad_fraction;
        Some((lo - pad, hi + pad))
    } else {
        let pad = if lo == 0.0 { 1.0 } else { lo.abs() * 0.05 };
        Some((lo - pad, hi + pad))
    }
}

impl Axes {
    pub fn new(rect: (u32, u32, u32, u32), x_range: (f64, f64), y_range: (f64, f64)) -> Self {
        Self {
            left: rect.0,
            top: rect.1,
            width: rect.2.max(1),
            height: rect.3.max(1),
            x_range,
            y_range,
        }
    }

    /// Axes spanning the finite data with 5% padding; `None` without data
    pub fn fit(rect: (u32, u32, u32, u32), xs: &[f64], ys: &[f64]) -> Option<Self> {
        Some(Self::new(
            rect,
            padded_range(xs, 0.05)?,
            padded_range(ys, 0.05)?,
        ))
    }

    /// Like [`Axes::fit`] but with equal data units per pixel on both axes
    pub fn fit_equal(rect: (u32, u32, u32, u32), xs: &[f64], ys: &[f64]) -> Option<Self> {
        let axes = Self::fit(rect, xs, ys)?;
        let per_px_x = (axes.x_range.1 - axes.x_range.0) / axes.width as f64;
        let per_px_y = (axes.y_range.1 - axes.y_range.0) / axes.height as f64;
        let per_px = per_px_x.max(per_px_y);
        let widen = |(lo, hi): (f64, f64), pixels: u32| {
            let center = (lo + hi) / 2.0;
            let half = per_px * pixels as f64 / 2.0;
            (center - half, center + half)
        };
        Some(Self {
            x_range: widen(axes.x_range, axes.width),
            y_range: widen(axes.y_range, axes.height),
            ..axes
        })
    }

    pub fn to_pixel(&self, x: f64, y: f64) -> (f32, f32) {
        let fx = (x - self.x_range.0) / (self.x_range.1 - self.x_range.0);
        let fy = (y - self.y_range.0) / (self.y_range.1 - self.y_range.0);
        (
            (self.left as f64 + fx * self.width as f64) as f32,
            (self.top as f64 + (1.0 - fy) * self.height as f64) as f32,
        )
    }

    fn contains(&self, p: (f32, f32)) -> bool {
        p.0 >= self.left as f32
            && p.0 <= (self.left + self.width) as f32
            && p.1 >= self.top as f32
            && p.1 <= (self.top + self.height) as f32
    }

    /// Frame, title above, limit labels and axis labels
    pub fn draw_frame(&self, img: &mut RgbImage, title: &str, x_label: &str, y_label: &str) {
        draw_hollow_rect_mut(
            img,
            Rect::at(self.left as i32, self.top as i32).of_size(self.width, self.height),
            FOREGROUND,
        );
        draw_text_centered(img, self.left + self.width / 2, self.top.saturating_sub(14), title, FOREGROUND, 1);

        let bottom = self.top + self.height;
        let x_min = format_tick(self.x_range.0);
        let x_max = format_tick(self.x_range.1);
        draw_text(img, self.left, bottom + 4, &x_min, FOREGROUND, 1);
        draw_text(
            img,
            (self.left + self.width).saturating_sub(text_width(&x_max, 1)),
            bottom + 4,
            &x_max,
            FOREGROUND,
            1,
        );
        draw_text_centered(img, self.left + self.width / 2, bottom + 14, x_label, FOREGROUND, 1);

        let y_min = format_tick(self.y_range.0);
        let y_max = format_tick(self.y_range.1);
        draw_text(
            img,
            self.left.saturating_sub(text_width(&y_max, 1) + 4),
            self.top,
            &y_max,
            FOREGROUND,
            1,
        );
        draw_text(
            img,
            self.left.saturating_sub(text_width(&y_min, 1) + 4),
            bottom.saturating_sub(7),
            &y_min,
            FOREGROUND,
            1,
        );
        draw_text(
            img,
            self.left.saturating_sub(text_width(y_label, 1) + 4),
            self.top + self.height / 2,
            y_label,
            FOREGROUND,
            1,
        );
    }

    /// "NO DATA" placeholder for a panel without points
    pub fn draw_empty(img: &mut RgbImage, rect: (u32, u32, u32, u32), title: &str) {
        let axes = Self::new(rect, (0.0, 1.0), (0.0, 1.0));
        draw_hollow_rect_mut(
            img,
            Rect::at(rect.0 as i32, rect.1 as i32).of_size(axes.width, axes.height),
            GRID,
        );
        draw_text_centered(img, rect.0 + axes.width / 2, rect.1.saturating_sub(14), title, FOREGROUND, 1);
        draw_text_centered(img, rect.0 + axes.width / 2, rect.1 + axes.height / 2, "NO DATA", GRID, 2);
    }

    pub fn scatter(&self, img: &mut RgbImage, xs: &[f64], ys: &[f64], color: Rgb<u8>, radius: i32) {
        for (&x, &y) in xs.iter().zip(ys) {
            if !(x.is_finite() && y.is_finite()) {
                continue;
            }
            let p = self.to_pixel(x, y);
            if self.contains(p) {
                draw_filled_circle_mut(img, (p.0.round() as i32, p.1.round() as i32), radius, color);
            }
        }
    }

    /// Vertical error bars of half-length `errors`
    pub fn error_bars(&self, img: &mut RgbImage, xs: &[f64], ys: &[f64], errors: &[f64], color: Rgb<u8>) {
        for ((&x, &y), &e) in xs.iter().zip(ys).zip(errors) {
            if !(x.is_finite() && y.is_finite() && e.is_finite()) {
                continue;
            }
            let low = self.clamp_point(self.to_pixel(x, y - e));
            let high = self.clamp_point(self.to_pixel(x, y + e));
            draw_line_segment_mut(img, low, high, color);
            draw_line_segment_mut(img, (low.0 - 3.0, low.1), (low.0 + 3.0, low.1), color);
            draw_line_segment_mut(img, (high.0 - 3.0, high.1), (high.0 + 3.0, high.1), color);
        }
    }

    fn clamp_point(&self, p: (f32, f32)) -> (f32, f32) {
        (
            p.0.clamp(self.left as f32, (self.left + self.width) as f32),
            p.1.clamp(self.top as f32, (self.top + self.height) as f32),
        )
    }

    pub fn hline(&self, img: &mut RgbImage, y: f64, color: Rgb<u8>) {
        if !y.is_finite() || y < self.y_range.0 || y > self.y_range.1 {
            return;
        }
        let (_, py) = self.to_pixel(self.x_range.0, y);
        draw_line_segment_mut(img, (self.left as f32, py), ((self.left + self.width) as f32, py), color);
    }

    pub fn vline(&self, img: &mut RgbImage, x: f64, color: Rgb<u8>) {
        if !x.is_finite() || x < self.x_range.0 || x > self.x_range.1 {
            return;
        }
        let (px, _) = self.to_pixel(x, self.y_range.0);
        draw_line_segment_mut(img, (px, self.top as f32), (px, (self.top + self.height) as f32), color);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_colormaps() {
        assert_eq!(ColorMap::Grayscale.color(1.0), Rgb([255, 255, 255]));
        assert_eq!(ColorMap::Grayscale.color(-3.0), Rgb([0, 0, 0]));
        assert_eq!(ColorMap::Residual.color(0.5), Rgb([255, 255, 255]));
        assert_eq!(ColorMap::Residual.color(0.0), Rgb([0, 0, 255]));
        assert_eq!(ColorMap::Residual.color(1.0), Rgb([255, 0, 0]));
        assert_eq!(ColorMap::Viridis.color(0.0), Rgb([68, 1, 84]));
        assert_eq!(ColorMap::Viridis.color(1.0), Rgb([253, 231, 37]));
        assert_eq!(ColorMap::Viridis.color(f64::NAN), MISSING);
    }

    #[test]
    fn test_axes_mapping() {
        let axes = Axes::new((100, 50, 200, 100), (0.0, 10.0), (-1.0, 1.0));
        assert_eq!(axes.to_pixel(0.0, -1.0), (100.0, 150.0));
        assert_eq!(axes.to_pixel(10.0, 1.0), (300.0, 50.0));
        assert_eq!(axes.to_pixel(5.0, 0.0), (200.0, 100.0));

        assert!(Axes::fit((0, 0, 10, 10), &[], &[]).is_none());
        let flat = Axes::fit((0, 0, 10, 10), &[1.0, 2.0], &[3.0, 3.0]).unwrap();
        assert!(flat.y_range.0 < 3.0 && flat.y_range.1 > 3.0);
    }

    #[test]
    fn test_equal_aspect() {
        let axes = Axes::fit_equal((0, 0, 200, 100), &[0.0, 10.0], &[0.0, 10.0]).unwrap();
        let per_px_x = (axes.x_range.1 - axes.x_range.0) / 200.0;
        let per_px_y = (axes.y_range.1 - axes.y_range.0) / 100.0;
        assert!((per_px_x - per_px_y).abs() < 1e-12);
        assert!(axes.y_range.0 <= 0.0 && axes.y_range.1 >= 10.0);
    }

    #[test]
    fn test_paint_grid_and_save() {
        let mut img = blank_canvas(50, 40);
        let data = [0.0, 1.0, 0.5, f64::NAN];
        let placed = paint_grid(&mut img, 5, 5, (2, 2, &data), 20, |v| ColorMap::Grayscale.color(v));
        assert_eq!((placed.width, placed.height), (20, 20));
        assert_eq!(*img.get_pixel(5, 5), Rgb([0, 0, 0]));
        assert_eq!(*img.get_pixel(24, 5), Rgb([255, 255, 255]));
        assert_eq!(*img.get_pixel(24, 24), MISSING);
        assert_eq!(placed.to_canvas(0.0, 0.0), (10.0, 10.0));

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("grid.png");
        save_png(&img, &path).unwrap();
        let reread = image::open(&path).unwrap().to_rgb8();
        assert_eq!(reread.dimensions(), (50, 40));
        assert_eq!(*reread.get_pixel(24, 24), MISSING);
    }

    #[test]
    fn test_format_tick() {
        assert_eq!(format_tick(1234.4), "1234");
        assert_eq!(format_tick(-12.34), "-12.3");
        assert_eq!(format_tick(0.5333), "0.53");
    }
}
