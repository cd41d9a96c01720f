use image::{Rgba, RgbaImage};
use imageproc::drawing::{draw_filled_circle_mut, draw_line_segment_mut};

use crate::geometry::{FloorMeasurement, GeometryError, Point2D, Quadrilateral};

/// Longest side allowed for a rectified floor view
pub const MAX_RECTIFIED_SIDE: u32 = 4096;

const PAPER_COLOR: Rgba<u8> = Rgba([0, 200, 0, 255]);
const FLOOR_COLOR: Rgba<u8> = Rgba([230, 30, 30, 255]);
const TRANSPARENT: Rgba<u8> = Rgba([0, 0, 0, 0]);

/// Outline the paper (green) and floor (red) quads on a copy of the photo
pub fn draw_overlay(img: &RgbaImage, measurement: &FloorMeasurement) -> RgbaImage {
    let mut output = img.clone();
    let (width, height) = img.dimensions();

    // Scale stroke with the photo so outlines stay visible on large images
    let thickness = (width.max(height) / 500).max(1) as i32;
    let radius = thickness * 3;

    draw_quad(&mut output, &measurement.floor_corners, FLOOR_COLOR, thickness, radius);
    draw_quad(&mut output, &measurement.paper_corners, PAPER_COLOR, thickness, radius);

    output
}

fn draw_quad(img: &mut RgbaImage, quad: &Quadrilateral, color: Rgba<u8>, thickness: i32, radius: i32) {
    let corners = quad.points();
    for i in 0..corners.len() {
        let a = corners[i];
        let b = corners[(i + 1) % corners.len()];
        let half = thickness / 2;
        for dy in -half..=half {
            for dx in -half..=half {
                draw_line_segment_mut(
                    img,
                    ((a.x + dx as f64) as f32, (a.y + dy as f64) as f32),
                    ((b.x + dx as f64) as f32, (b.y + dy as f64) as f32),
                    color,
                );
            }
        }
    }
    for p in corners {
        draw_filled_circle_mut(img, (p.x.round() as i32, p.y.round() as i32), radius, color);
    }
}

/// Photo resampler working on premultiplied alpha
struct Sampler {
    pixels: Vec<[f64; 4]>,
    width: u32,
    height: u32,
}

impl Sampler {
    fn new(img: &RgbaImage) -> Self {
        let pixels = img
            .pixels()
            .map(|p| {
                let alpha = p[3] as f64 / 255.0;
                [
                    p[0] as f64 * alpha,
                    p[1] as f64 * alpha,
                    p[2] as f64 * alpha,
                    p[3] as f64,
                ]
            })
            .collect();
        Self {
            pixels,
            width: img.width(),
            height: img.height(),
        }
    }

    fn contains(&self, x: f64, y: f64) -> bool {
        x >= -0.5 && y >= -0.5 && x <= self.width as f64 - 0.5 && y <= self.height as f64 - 0.5
    }

    fn texel(&self, x: i64, y: i64) -> [f64; 4] {
        let x = x.clamp(0, self.width as i64 - 1) as u32;
        let y = y.clamp(0, self.height as i64 - 1) as u32;
        self.pixels[(y * self.width + x) as usize]
    }

    /// Catmull-Rom bicubic sample at pixel-center coordinates
    fn bicubic(&self, x: f64, y: f64) -> Rgba<u8> {
        let (x0, y0) = (x.floor(), y.floor());
        let wx = catmull_rom(x - x0);
        let wy = catmull_rom(y - y0);

        let mut acc = [0.0; 4];
        for (j, wy) in wy.iter().enumerate() {
            for (i, wx) in wx.iter().enumerate() {
                let texel = self.texel(x0 as i64 + i as i64 - 1, y0 as i64 + j as i64 - 1);
                for c in 0..4 {
                    acc[c] += texel[c] * wx * wy;
                }
            }
        }
        unpremultiply(acc)
    }
}

fn catmull_rom(t: f64) -> [f64; 4] {
    let t2 = t * t;
    let t3 = t2 * t;
    [
        -0.5 * t3 + t2 - 0.5 * t,
        1.5 * t3 - 2.5 * t2 + 1.0,
        -1.5 * t3 + 2.0 * t2 + 0.5 * t,
        0.5 * t3 - 0.5 * t2,
    ]
}

fn unpremultiply(p: [f64; 4]) -> Rgba<u8> {
    let alpha = p[3].clamp(0.0, 255.0);
    if alpha < 1.0 {
        return TRANSPARENT;
    }
    let norm = alpha / 255.0;
    Rgba([
        (p[0] / norm).round().clamp(0.0, 255.0) as u8,
        (p[1] / norm).round().clamp(0.0, 255.0) as u8,
        (p[2] / norm).round().clamp(0.0, 255.0) as u8,
        alpha.round() as u8,
    ])
}

/// Crossing-number test
fn inside_polygon(p: Point2D, polygon: &[Point2D]) -> bool {
    let mut inside = false;
    let n = polygon.len();
    for i in 0..n {
        let a = polygon[i];
        let b = polygon[(i + 1) % n];
        if (a.y > p.y) != (b.y > p.y) {
            let x_cross = a.x + (p.y - a.y) * (b.x - a.x) / (b.y - a.y);
            if p.x < x_cross {
                inside = !inside;
            }
        }
    }
    inside
}

/// Render a top-down view of the floor in the metric frame.
///
/// Each output pixel is mapped back into the photo through the inverse
/// homography. Pixels outside the floor polygon or the photo are transparent.
/// `pixels_per_meter` is lowered if the view would exceed [`MAX_RECTIFIED_SIDE`].
pub fn rectify_floor(
    img: &RgbaImage,
    measurement: &FloorMeasurement,
    pixels_per_meter: f64,
) -> Result<RgbaImage, GeometryError> {
    if !pixels_per_meter.is_finite() || pixels_per_meter <= 0.0 {
        return Err(GeometryError::InvalidInput(format!(
            "pixels per meter must be positive, got {pixels_per_meter}"
        )));
    }

    let metric = &measurement.floor_metric;
    let min_x = metric.iter().map(|p| p.x).fold(f64::INFINITY, f64::min);
    let max_x = metric.iter().map(|p| p.x).fold(f64::NEG_INFINITY, f64::max);
    let min_y = metric.iter().map(|p| p.y).fold(f64::INFINITY, f64::min);
    let max_y = metric.iter().map(|p| p.y).fold(f64::NEG_INFINITY, f64::max);
    let extent = (max_x - min_x).max(max_y - min_y);
    if extent <= 0.0 {
        return Err(GeometryError::DegenerateGeometry(
            "floor has no extent in the metric frame".to_string(),
        ));
    }

    let scale = pixels_per_meter.min(MAX_RECTIFIED_SIDE as f64 / extent);
    if scale < pixels_per_meter {
        tracing::info!(
            requested = pixels_per_meter,
            used = scale,
            "rectified view capped at {} px",
            MAX_RECTIFIED_SIDE
        );
    }
    let out_width = (((max_x - min_x) * scale).round() as u32).clamp(1, MAX_RECTIFIED_SIDE);
    let out_height = (((max_y - min_y) * scale).round() as u32).clamp(1, MAX_RECTIFIED_SIDE);

    let to_pixels = measurement.homography.inverse()?;
    let sampler = Sampler::new(img);
    let mut output = RgbaImage::from_pixel(out_width, out_height, TRANSPARENT);

    for out_y in 0..out_height {
        for out_x in 0..out_width {
            let m = Point2D::new(
                min_x + (out_x as f64 + 0.5) / scale,
                min_y + (out_y as f64 + 0.5) / scale,
            );
            if !inside_polygon(m, metric) {
                continue;
            }
            // Points on the horizon have no photo counterpart
            let Ok(src) = to_pixels.apply(m) else {
                continue;
            };
            if sampler.contains(src.x, src.y) {
                output.put_pixel(out_x, out_y, sampler.bicubic(src.x, src.y));
            }
        }
    }

    tracing::debug!(
        width = out_width,
        height = out_height,
        pixels_per_meter = scale,
        "rendered rectified floor"
    );
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::{measure_floor, ReferenceObjectSpec};

    fn fixture() -> FloorMeasurement {
        let paper = [(100.0, 100.0), (300.0, 100.0), (300.0, 250.0), (100.0, 250.0)]
            .map(Point2D::from);
        let floor = [(0.0, 0.0), (600.0, 0.0), (600.0, 450.0), (0.0, 450.0)].map(Point2D::from);
        measure_floor(&paper, &floor, &ReferenceObjectSpec::A4).unwrap()
    }

    #[test]
    fn test_overlay_marks_corners() {
        let img = RgbaImage::from_pixel(640, 480, Rgba([128, 128, 128, 255]));
        let out = draw_overlay(&img, &fixture());

        assert_eq!(out.dimensions(), (640, 480));
        assert_eq!(*out.get_pixel(300, 250), PAPER_COLOR);
        assert_eq!(*out.get_pixel(600, 450), FLOOR_COLOR);
        assert_eq!(*out.get_pixel(450, 350), Rgba([128, 128, 128, 255]));
    }

    #[test]
    fn test_rectify_dimensions_and_color() {
        let img = RgbaImage::from_pixel(640, 480, Rgba([40, 90, 160, 255]));
        let out = rectify_floor(&img, &fixture(), 100.0).unwrap();

        // 0.63 m x 0.891 m at 100 px/m
        assert_eq!(out.dimensions(), (63, 89));
        assert_eq!(*out.get_pixel(31, 44), Rgba([40, 90, 160, 255]));
    }

    #[test]
    fn test_rectify_caps_size() {
        let img = RgbaImage::from_pixel(640, 480, Rgba([255, 255, 255, 255]));
        let out = rectify_floor(&img, &fixture(), 1.0e6).unwrap();
        assert!(out.width().max(out.height()) <= MAX_RECTIFIED_SIDE);
    }

    #[test]
    fn test_rectify_rejects_bad_scale() {
        let img = RgbaImage::new(4, 4);
        assert!(rectify_floor(&img, &fixture(), 0.0).is_err());
    }

    #[test]
    fn test_inside_polygon() {
        let square = [(0.0, 0.0), (1.0, 0.0), (1.0, 1.0), (0.0, 1.0)].map(Point2D::from);
        assert!(inside_polygon(Point2D::new(0.5, 0.5), &square));
        assert!(!inside_polygon(Point2D::new(1.5, 0.5), &square));
    }
}
