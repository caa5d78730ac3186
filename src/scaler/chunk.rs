//! Per-chunk pixel routines.
//!
//! Every destination pixel is computed from global destination coordinates,
//! so a chunk is bit-identical to the same area cut out of a single
//! whole-image pass and seams never show.

use image::{Rgba, RgbaImage};

use super::TransformationMode;
use crate::geometry::Rect;

/// Scale the part of `source` that lands in `dest` (destination coordinates)
/// at `zoom`.
pub fn scale_rect(source: &RgbaImage, zoom: f64, dest: Rect, mode: TransformationMode) -> RgbaImage {
    let width = dest.width.max(0) as u32;
    let height = dest.height.max(0) as u32;
    if source.width() == 0 || source.height() == 0 || zoom <= 0.0 {
        return RgbaImage::new(0, 0);
    }

    let sample: fn(&RgbaImage, f64, i32, i32) -> Rgba<u8> = match mode {
        TransformationMode::Fast => nearest,
        TransformationMode::Smooth if zoom >= 1.0 => bilinear,
        TransformationMode::Smooth => box_average,
    };

    RgbaImage::from_fn(width, height, |x, y| {
        sample(source, zoom, dest.x + x as i32, dest.y + y as i32)
    })
}

/// Source coordinate of the destination pixel centre `d`.
fn centre(d: i32, zoom: f64) -> f64 {
    (f64::from(d) + 0.5) / zoom
}

fn clamp_index(value: f64, len: u32) -> u32 {
    (value.floor().max(0.0) as u32).min(len - 1)
}

fn nearest(source: &RgbaImage, zoom: f64, dx: i32, dy: i32) -> Rgba<u8> {
    let sx = clamp_index(centre(dx, zoom), source.width());
    let sy = clamp_index(centre(dy, zoom), source.height());
    *source.get_pixel(sx, sy)
}

fn bilinear(source: &RgbaImage, zoom: f64, dx: i32, dy: i32) -> Rgba<u8> {
    let max_x = f64::from(source.width() - 1);
    let max_y = f64::from(source.height() - 1);
    let fx = (centre(dx, zoom) - 0.5).clamp(0.0, max_x);
    let fy = (centre(dy, zoom) - 0.5).clamp(0.0, max_y);

    let x0 = fx.floor() as u32;
    let y0 = fy.floor() as u32;
    let x1 = (x0 + 1).min(source.width() - 1);
    let y1 = (y0 + 1).min(source.height() - 1);
    let tx = fx - f64::from(x0);
    let ty = fy - f64::from(y0);

    let p00 = source.get_pixel(x0, y0).0;
    let p10 = source.get_pixel(x1, y0).0;
    let p01 = source.get_pixel(x0, y1).0;
    let p11 = source.get_pixel(x1, y1).0;

    let mut out = [0u8; 4];
    for c in 0..4 {
        let top = f64::from(p00[c]) * (1.0 - tx) + f64::from(p10[c]) * tx;
        let bottom = f64::from(p01[c]) * (1.0 - tx) + f64::from(p11[c]) * tx;
        out[c] = (top * (1.0 - ty) + bottom * ty).round().clamp(0.0, 255.0) as u8;
    }
    Rgba(out)
}

/// Source index range covered by destination pixel `d` when shrinking.
fn footprint(d: i32, zoom: f64, len: u32) -> (u32, u32) {
    let start = clamp_index(f64::from(d) / zoom, len);
    let end = ((f64::from(d + 1) / zoom).ceil().max(0.0) as u32).clamp(start + 1, len);
    (start, end)
}

fn box_average(source: &RgbaImage, zoom: f64, dx: i32, dy: i32) -> Rgba<u8> {
    let (x0, x1) = footprint(dx, zoom, source.width());
    let (y0, y1) = footprint(dy, zoom, source.height());

    let mut sum = [0u64; 4];
    for y in y0..y1 {
        for x in x0..x1 {
            let p = source.get_pixel(x, y).0;
            for c in 0..4 {
                sum[c] += u64::from(p[c]);
            }
        }
    }
    let count = u64::from(x1 - x0) * u64::from(y1 - y0);
    let mut out = [0u8; 4];
    for c in 0..4 {
        out[c] = ((sum[c] + count / 2) / count) as u8;
    }
    Rgba(out)
}
