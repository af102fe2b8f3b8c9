use anyhow::{Context, Result};
use image::imageops::{self, FilterType};
use image::{GrayImage, Luma, Rgb, RgbImage};
use ndarray::Array2;

use crate::deck::Deck;
use crate::params::{ChangeSet, FlowParams, SharedParams};

use super::core::ExtractorCore;
use super::types::{ExtractError, ExtractorOutput, ForegroundExtractor, FrameMeta};

/// Dense optical-flow extraction: per-pixel motion magnitude between the
/// previous and current frame becomes the difference signal. The previous
/// frame is the most recent entry of a small deck of preprocessed frames,
/// so both flow inputs went through the same downscale/blur path.
///
/// Flow is estimated with pyramidal iterative Lucas-Kanade over a square
/// matching window; the field is also encoded as an HSV-style color image
/// (hue = direction, brightness = magnitude) for visualization.
pub struct OpticalFlowExtractor {
    core: ExtractorCore,
    params: FlowParams,
    deck: Option<Deck<Luma<u8>>>,
}

impl OpticalFlowExtractor {
    pub fn new(shared: SharedParams, params: FlowParams) -> Self {
        Self {
            core: ExtractorCore::new(shared),
            params,
            deck: None,
        }
    }

    pub fn shared_params_mut(&mut self) -> &mut SharedParams {
        &mut self.core.params
    }

    pub fn params_mut(&mut self) -> &mut FlowParams {
        &mut self.params
    }

    fn extract(&mut self, frame: &RgbImage) -> Result<(GrayImage, Option<RgbImage>)> {
        let processed = self.core.preprocess(frame)?;
        let gray = self.core.collapse(&processed)?;
        let deck = self.deck.as_mut().ok_or(ExtractError::Unconfigured)?;
        deck.push(gray.clone());
        if deck.len() < 2 {
            // No previous frame to measure motion against yet.
            return Ok((self.core.blank_binary(), None));
        }
        let previous = deck.read_at_depth(1);

        let (u, v) = dense_flow(&previous, &gray, &self.params);
        let (magnitude, vis) = encode_flow(&u, &v, self.params.magnitude_scale);
        let binary = self.core.finish(magnitude)?;
        Ok((binary, Some(vis)))
    }
}

impl ForegroundExtractor for OpticalFlowExtractor {
    fn setup(&mut self, changed: &ChangeSet) -> Result<()> {
        let resolution_changed = self.core.resolution_changed(changed);
        self.core
            .setup(changed)
            .context("optical-flow setup failed")?;

        let (w, h) = self.core.working_size();
        match &mut self.deck {
            // Previous + current is all the history flow ever needs.
            None => self.deck = Some(Deck::new(2, w, h)),
            Some(deck) => {
                if resolution_changed {
                    deck.rescale_contents(w, h, self.core.params.interpolation);
                }
            }
        }
        Ok(())
    }

    fn reset(&mut self) {
        self.core.reset();
        if let Some(deck) = &mut self.deck {
            deck.clear();
        }
    }

    fn run(
        &mut self,
        frame: &RgbImage,
        background: Option<&RgbImage>,
        background_refreshed: bool,
        meta: FrameMeta,
    ) -> Result<ExtractorOutput> {
        let result = match self.core.refresh_background(background, background_refreshed) {
            Ok(()) => self.extract(frame),
            Err(err) => Err(err.into()),
        };
        let (binary_result, debug_vis) = match result {
            Ok((binary, vis)) => (Ok(binary), vis),
            Err(err) => (Err(err), None),
        };
        let binary = self.core.resolve(binary_result)?;
        Ok(ExtractorOutput {
            binary,
            frame: frame.clone(),
            background: background.cloned(),
            background_refreshed,
            meta,
            debug_vis,
        })
    }
}

/// Pyramidal Lucas-Kanade dense flow from `prev` to `cur`. Returns the
/// horizontal and vertical displacement fields in pixels.
fn dense_flow(prev: &GrayImage, cur: &GrayImage, params: &FlowParams) -> (Array2<f32>, Array2<f32>) {
    let scale = params.pyramid_scale.clamp(0.1, 0.9);
    let levels = params.pyramid_levels.max(1);

    let mut prev_pyramid = vec![to_f32(prev)];
    let mut cur_pyramid = vec![to_f32(cur)];
    for level in 1..levels {
        let factor = scale.powi(level as i32);
        let w = ((prev.width() as f32) * factor).round() as u32;
        let h = ((prev.height() as f32) * factor).round() as u32;
        if w < 8 || h < 8 {
            break;
        }
        prev_pyramid.push(to_f32(&imageops::resize(prev, w, h, FilterType::Triangle)));
        cur_pyramid.push(to_f32(&imageops::resize(cur, w, h, FilterType::Triangle)));
    }

    let coarsest = prev_pyramid.len() - 1;
    let (ch, cw) = prev_pyramid[coarsest].dim();
    let mut u = Array2::<f32>::zeros((ch, cw));
    let mut v = Array2::<f32>::zeros((ch, cw));

    for level in (0..prev_pyramid.len()).rev() {
        let (h, w) = prev_pyramid[level].dim();
        if u.dim() != (h, w) {
            let gain_x = w as f32 / u.dim().1 as f32;
            let gain_y = h as f32 / u.dim().0 as f32;
            u = resample_field(&u, h, w, gain_x);
            v = resample_field(&v, h, w, gain_y);
        }
        lk_refine(
            &prev_pyramid[level],
            &cur_pyramid[level],
            &mut u,
            &mut v,
            params.window_size,
            params.iterations,
        );
    }
    (u, v)
}

/// One or more Lucas-Kanade refinement sweeps at a single pyramid level.
fn lk_refine(
    prev: &Array2<f32>,
    cur: &Array2<f32>,
    u: &mut Array2<f32>,
    v: &mut Array2<f32>,
    window: usize,
    iterations: usize,
) {
    let (h, w) = prev.dim();
    let r = (window.max(3) / 2) as i32;

    // Spatial gradients of the reference frame, central differences.
    let mut ix = Array2::<f32>::zeros((h, w));
    let mut iy = Array2::<f32>::zeros((h, w));
    for y in 0..h {
        for x in 0..w {
            ix[[y, x]] =
                (sample(prev, y as f32, x as f32 + 1.0) - sample(prev, y as f32, x as f32 - 1.0))
                    * 0.5;
            iy[[y, x]] =
                (sample(prev, y as f32 + 1.0, x as f32) - sample(prev, y as f32 - 1.0, x as f32))
                    * 0.5;
        }
    }

    for _ in 0..iterations.max(1) {
        let u_prev = u.clone();
        let v_prev = v.clone();
        for y in 0..h {
            for x in 0..w {
                let mut sxx = 0.0f32;
                let mut sxy = 0.0f32;
                let mut syy = 0.0f32;
                let mut sxt = 0.0f32;
                let mut syt = 0.0f32;
                for dy in -r..=r {
                    for dx in -r..=r {
                        let ny = y as i32 + dy;
                        let nx = x as i32 + dx;
                        if ny < 0 || nx < 0 || ny >= h as i32 || nx >= w as i32 {
                            continue;
                        }
                        let (ny, nx) = (ny as usize, nx as usize);
                        let gx = ix[[ny, nx]];
                        let gy = iy[[ny, nx]];
                        let warped = sample(
                            cur,
                            ny as f32 + v_prev[[ny, nx]],
                            nx as f32 + u_prev[[ny, nx]],
                        );
                        let it = warped - prev[[ny, nx]];
                        sxx += gx * gx;
                        sxy += gx * gy;
                        syy += gy * gy;
                        sxt += gx * it;
                        syt += gy * it;
                    }
                }
                let det = sxx * syy - sxy * sxy;
                if det.abs() < 1e-4 {
                    continue;
                }
                let du = (sxy * syt - syy * sxt) / det;
                let dv = (sxy * sxt - sxx * syt) / det;
                u[[y, x]] = u_prev[[y, x]] + du;
                v[[y, x]] = v_prev[[y, x]] + dv;
            }
        }
    }
}

/// Convert the flow field into the thresholdable magnitude image and the
/// color visualization (hue = direction, brightness = magnitude).
fn encode_flow(u: &Array2<f32>, v: &Array2<f32>, magnitude_scale: f32) -> (GrayImage, RgbImage) {
    let (h, w) = u.dim();
    let mut magnitude = GrayImage::new(w as u32, h as u32);
    let mut vis = RgbImage::new(w as u32, h as u32);
    for y in 0..h {
        for x in 0..w {
            let du = u[[y, x]];
            let dv = v[[y, x]];
            let m = (du * du + dv * dv).sqrt();
            let value = (m * magnitude_scale).clamp(0.0, 255.0) as u8;
            magnitude.put_pixel(x as u32, y as u32, Luma([value]));

            let hue = (dv.atan2(du) + std::f32::consts::PI)
                / (2.0 * std::f32::consts::PI)
                * 360.0;
            vis.put_pixel(
                x as u32,
                y as u32,
                Rgb(hsv_to_rgb(hue, 1.0, value as f32 / 255.0)),
            );
        }
    }
    (magnitude, vis)
}

fn hsv_to_rgb(h_deg: f32, s: f32, v: f32) -> [u8; 3] {
    let c = v * s;
    let hp = (h_deg.rem_euclid(360.0)) / 60.0;
    let x = c * (1.0 - (hp % 2.0 - 1.0).abs());
    let (r, g, b) = match hp as u32 {
        0 => (c, x, 0.0),
        1 => (x, c, 0.0),
        2 => (0.0, c, x),
        3 => (0.0, x, c),
        4 => (x, 0.0, c),
        _ => (c, 0.0, x),
    };
    let m = v - c;
    [
        ((r + m) * 255.0).clamp(0.0, 255.0) as u8,
        ((g + m) * 255.0).clamp(0.0, 255.0) as u8,
        ((b + m) * 255.0).clamp(0.0, 255.0) as u8,
    ]
}

fn to_f32(image: &GrayImage) -> Array2<f32> {
    let (w, h) = image.dimensions();
    let mut arr = Array2::zeros((h as usize, w as usize));
    for (x, y, p) in image.enumerate_pixels() {
        arr[[y as usize, x as usize]] = p[0] as f32;
    }
    arr
}

/// Bilinear resample of a flow component onto new dimensions, scaling the
/// displacement values by the resolution gain.
fn resample_field(field: &Array2<f32>, new_h: usize, new_w: usize, gain: f32) -> Array2<f32> {
    let (h, w) = field.dim();
    Array2::from_shape_fn((new_h, new_w), |(y, x)| {
        let sy = (y as f32 + 0.5) * h as f32 / new_h as f32 - 0.5;
        let sx = (x as f32 + 0.5) * w as f32 / new_w as f32 - 0.5;
        sample(field, sy, sx) * gain
    })
}

/// Clamped bilinear sample.
fn sample(arr: &Array2<f32>, y: f32, x: f32) -> f32 {
    let (h, w) = arr.dim();
    let xc = x.clamp(0.0, (w - 1) as f32);
    let yc = y.clamp(0.0, (h - 1) as f32);
    let x0 = xc.floor() as usize;
    let y0 = yc.floor() as usize;
    let x1 = (x0 + 1).min(w - 1);
    let y1 = (y0 + 1).min(h - 1);
    let fx = xc - x0 as f32;
    let fy = yc - y0 as f32;
    arr[[y0, x0]] * (1.0 - fx) * (1.0 - fy)
        + arr[[y0, x1]] * fx * (1.0 - fy)
        + arr[[y1, x0]] * (1.0 - fx) * fy
        + arr[[y1, x1]] * fx * fy
}
