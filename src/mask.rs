use image::{GrayImage, Luma};

use crate::params::Zone;

/// Rasterize polygon zones into a keep(255)/drop(0) mask at the working
/// resolution. Pixels inside any zone are kept. An empty zone list yields
/// an all-pass mask.
pub fn rasterize_zones(zones: &[Zone], width: u32, height: u32) -> GrayImage {
    if zones.is_empty() {
        return GrayImage::from_pixel(width, height, Luma([255]));
    }
    let mut mask = GrayImage::from_pixel(width, height, Luma([0]));
    for zone in zones {
        fill_polygon(&mut mask, &zone.points);
    }
    mask
}

/// Whether masking should actually execute: it must be toggled on AND the
/// rasterized mask must drop at least one pixel. An all-pass mask is
/// treated as disabled so no full-frame bitwise pass is wasted on it.
pub fn mask_active(enabled: bool, mask: &GrayImage) -> bool {
    enabled && mask.pixels().any(|p| p[0] == 0)
}

/// Zero out every dropped pixel of a single-channel frame.
pub fn apply_mask(frame: &mut GrayImage, mask: &GrayImage) {
    for (pixel, keep) in frame.pixels_mut().zip(mask.pixels()) {
        if keep[0] == 0 {
            pixel[0] = 0;
        }
    }
}

/// Scanline even-odd fill of one normalized-coordinate polygon.
fn fill_polygon(mask: &mut GrayImage, points: &[(f32, f32)]) {
    if points.len() < 3 {
        return;
    }
    let (width, height) = mask.dimensions();
    let pts: Vec<(f32, f32)> = points
        .iter()
        .map(|&(x, y)| (x * width as f32, y * height as f32))
        .collect();

    for y in 0..height {
        let yc = y as f32 + 0.5;
        let mut crossings: Vec<f32> = Vec::new();
        for i in 0..pts.len() {
            let (x0, y0) = pts[i];
            let (x1, y1) = pts[(i + 1) % pts.len()];
            if (y0 <= yc && y1 > yc) || (y1 <= yc && y0 > yc) {
                let t = (yc - y0) / (y1 - y0);
                crossings.push(x0 + t * (x1 - x0));
            }
        }
        crossings.sort_by(|a, b| a.total_cmp(b));
        for pair in crossings.chunks_exact(2) {
            // Pixel x is covered when its center x + 0.5 lies in [xa, xb).
            let start = (pair[0] - 0.5).ceil().max(0.0) as u32;
            let end = ((pair[1] - 0.5).ceil() as i64 - 1).min(width as i64 - 1);
            let mut x = start as i64;
            while x <= end {
                mask.put_pixel(x as u32, y, Luma([255]));
                x += 1;
            }
        }
    }
}
