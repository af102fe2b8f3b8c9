use image::{GrayImage, Luma};

use crate::params::{MorphOp, MorphShape};

/// Immutable structuring element, rebuilt on every `setup` from
/// (shape, size).
#[derive(Debug, Clone)]
pub struct Kernel {
    offsets: Vec<(i32, i32)>,
}

/// Build a structuring element of the given shape and radius. Size 0 has
/// no neighborhood at all and maps to `None`; the caller skips the stage
/// through its enable flag instead of running a no-op kernel.
pub fn build_kernel(shape: MorphShape, size: u32) -> Option<Kernel> {
    if size == 0 {
        return None;
    }
    let r = size as i32;
    let mut offsets = Vec::new();
    for dy in -r..=r {
        for dx in -r..=r {
            let keep = match shape {
                MorphShape::Square => true,
                MorphShape::Circle => dx * dx + dy * dy <= r * r,
                MorphShape::Cross => dx == 0 || dy == 0,
            };
            if keep {
                offsets.push((dx, dy));
            }
        }
    }
    Some(Kernel { offsets })
}

pub fn apply(op: MorphOp, frame: &GrayImage, kernel: &Kernel) -> GrayImage {
    match op {
        MorphOp::Erode => erode(frame, kernel),
        MorphOp::Dilate => dilate(frame, kernel),
        MorphOp::Open => dilate(&erode(frame, kernel), kernel),
        MorphOp::Close => erode(&dilate(frame, kernel), kernel),
    }
}

fn erode(frame: &GrayImage, kernel: &Kernel) -> GrayImage {
    let (width, height) = frame.dimensions();
    GrayImage::from_fn(width, height, |x, y| {
        let mut min = 255u8;
        for &(dx, dy) in &kernel.offsets {
            let nx = x as i32 + dx;
            let ny = y as i32 + dy;
            if nx < 0 || ny < 0 || nx >= width as i32 || ny >= height as i32 {
                continue;
            }
            min = min.min(frame.get_pixel(nx as u32, ny as u32)[0]);
        }
        Luma([min])
    })
}

fn dilate(frame: &GrayImage, kernel: &Kernel) -> GrayImage {
    let (width, height) = frame.dimensions();
    GrayImage::from_fn(width, height, |x, y| {
        let mut max = 0u8;
        for &(dx, dy) in &kernel.offsets {
            let nx = x as i32 + dx;
            let ny = y as i32 + dy;
            if nx < 0 || ny < 0 || nx >= width as i32 || ny >= height as i32 {
                continue;
            }
            max = max.max(frame.get_pixel(nx as u32, ny as u32)[0]);
        }
        Luma([max])
    })
}

/// Gaussian sigma for a blur-size slider value.
pub fn blur_sigma(size: u32) -> f32 {
    size as f32 * 0.5
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_size_is_noop_sentinel() {
        assert!(build_kernel(MorphShape::Square, 0).is_none());
        assert!(build_kernel(MorphShape::Circle, 0).is_none());
    }

    #[test]
    fn kernel_shapes_have_expected_footprints() {
        let square = build_kernel(MorphShape::Square, 1).unwrap();
        let cross = build_kernel(MorphShape::Cross, 1).unwrap();
        assert_eq!(square.offsets.len(), 9);
        assert_eq!(cross.offsets.len(), 5);

        let circle = build_kernel(MorphShape::Circle, 2).unwrap();
        let square2 = build_kernel(MorphShape::Square, 2).unwrap();
        assert!(circle.offsets.len() < square2.offsets.len());
    }

    #[test]
    fn open_removes_isolated_speck() {
        let mut frame = GrayImage::new(9, 9);
        frame.put_pixel(4, 4, Luma([255]));
        let kernel = build_kernel(MorphShape::Square, 1).unwrap();
        let opened = apply(MorphOp::Open, &frame, &kernel);
        assert!(opened.pixels().all(|p| p[0] == 0));
    }

    #[test]
    fn close_fills_single_pixel_hole() {
        let mut frame = GrayImage::from_pixel(9, 9, Luma([255]));
        frame.put_pixel(4, 4, Luma([0]));
        let kernel = build_kernel(MorphShape::Square, 1).unwrap();
        let closed = apply(MorphOp::Close, &frame, &kernel);
        assert_eq!(closed.get_pixel(4, 4)[0], 255);
    }

    #[test]
    fn dilate_expands_bright_region() {
        let mut frame = GrayImage::new(9, 9);
        frame.put_pixel(4, 4, Luma([255]));
        let kernel = build_kernel(MorphShape::Cross, 1).unwrap();
        let dilated = apply(MorphOp::Dilate, &frame, &kernel);
        assert_eq!(dilated.get_pixel(4, 3)[0], 255);
        assert_eq!(dilated.get_pixel(3, 4)[0], 255);
        assert_eq!(dilated.get_pixel(3, 3)[0], 0);
    }
}
