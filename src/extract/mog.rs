use anyhow::{Context, Result};
use image::{GrayImage, RgbImage};
use ndarray::Array3;

use crate::params::{ChangeSet, MogParams, SharedParams};
use crate::trigger::PeriodicTrigger;

use super::core::{binarize, ExtractorCore};
use super::types::{ExtractorOutput, ForegroundExtractor, FrameMeta};

const MIXTURES: usize = 5;
const BACKGROUND_RATIO: f32 = 0.9;
const VAR_INIT: f32 = 225.0;
const VAR_MIN: f32 = 16.0;
const VAR_MAX: f32 = 5.0 * VAR_INIT;
/// Distinguished mid-gray emitted for shadow pixels in the raw mask.
const SHADOW_VALUE: u8 = 127;

/// Adaptive mixture-model subtraction: every pixel is modeled as a
/// mixture of Gaussians over its grayscale history. Until an internal
/// estimate exists the extractor emits blank output and keeps trying to
/// seed the model from the static background; afterwards the model adapts
/// at the configured (or auto) learning rate, gated by the sample timer.
pub struct MogExtractor {
    core: ExtractorCore,
    params: MogParams,
    trigger: PeriodicTrigger,
    model: Option<MogModel>,
}

/// Per-pixel mixture state, owned exclusively by its extractor and reset
/// through it.
struct MogModel {
    weights: Array3<f32>,
    means: Array3<f32>,
    vars: Array3<f32>,
}

impl MogModel {
    /// Initialize every pixel with one confident component centered on
    /// the background estimate.
    fn seeded(background: &GrayImage) -> Self {
        let (w, h) = background.dimensions();
        let shape = (h as usize, w as usize, MIXTURES);
        let mut weights = Array3::zeros(shape);
        let mut means = Array3::zeros(shape);
        let vars = Array3::from_elem(shape, VAR_INIT);
        for (x, y, p) in background.enumerate_pixels() {
            weights[[y as usize, x as usize, 0]] = 1.0;
            means[[y as usize, x as usize, 0]] = p[0] as f32;
        }
        Self {
            weights,
            means,
            vars,
        }
    }

    fn dimensions(&self) -> (u32, u32) {
        let (h, w, _) = self.weights.dim();
        (w as u32, h as u32)
    }

    /// One classify-and-update pass. An `alpha` of 0 classifies without
    /// adapting the model.
    fn apply(&mut self, frame: &GrayImage, alpha: f32, var_threshold: f32, detect_shadows: bool) -> GrayImage {
        let (w, h) = frame.dimensions();
        let mut out = Vec::with_capacity((w * h) as usize);
        for y in 0..h as usize {
            for x in 0..w as usize {
                let value = frame.get_pixel(x as u32, y as u32)[0] as f32;
                out.push(self.update_pixel(y, x, value, alpha, var_threshold, detect_shadows));
            }
        }
        GrayImage::from_raw(w, h, out).expect("raw mask length matches frame shape")
    }

    fn update_pixel(
        &mut self,
        y: usize,
        x: usize,
        value: f32,
        alpha: f32,
        var_threshold: f32,
        detect_shadows: bool,
    ) -> u8 {
        // Match against the heaviest component whose squared distance
        // passes the variance gate.
        let mut matched: Option<usize> = None;
        let mut matched_weight = 0.0;
        for k in 0..MIXTURES {
            let weight = self.weights[[y, x, k]];
            if weight <= 0.0 {
                continue;
            }
            let d = value - self.means[[y, x, k]];
            if d * d <= var_threshold * self.vars[[y, x, k]] && weight > matched_weight {
                matched = Some(k);
                matched_weight = weight;
            }
        }

        let label = match matched {
            Some(k) => {
                if self.is_background_component(y, x, k) {
                    0
                } else {
                    255
                }
            }
            None => {
                if detect_shadows && self.is_shadow(y, x, value) {
                    SHADOW_VALUE
                } else {
                    255
                }
            }
        };

        if alpha > 0.0 {
            match matched {
                Some(k) => {
                    for j in 0..MIXTURES {
                        self.weights[[y, x, j]] *= 1.0 - alpha;
                    }
                    self.weights[[y, x, k]] += alpha;
                    let d = value - self.means[[y, x, k]];
                    self.means[[y, x, k]] += alpha * d;
                    let var = self.vars[[y, x, k]] + alpha * (d * d - self.vars[[y, x, k]]);
                    self.vars[[y, x, k]] = var.clamp(VAR_MIN, VAR_MAX);
                }
                None => {
                    // No component explains this value: recycle the
                    // weakest slot for it.
                    for j in 0..MIXTURES {
                        self.weights[[y, x, j]] *= 1.0 - alpha;
                    }
                    let weakest = (0..MIXTURES)
                        .min_by(|&a, &b| {
                            self.weights[[y, x, a]].total_cmp(&self.weights[[y, x, b]])
                        })
                        .unwrap_or(0);
                    self.weights[[y, x, weakest]] = alpha.max(0.05);
                    self.means[[y, x, weakest]] = value;
                    self.vars[[y, x, weakest]] = VAR_INIT;
                    let total: f32 = (0..MIXTURES).map(|j| self.weights[[y, x, j]]).sum();
                    if total > 0.0 {
                        for j in 0..MIXTURES {
                            self.weights[[y, x, j]] /= total;
                        }
                    }
                }
            }
        }

        label
    }

    /// Background components are the heaviest ones whose cumulative
    /// weight reaches the background ratio.
    fn is_background_component(&self, y: usize, x: usize, k: usize) -> bool {
        let mut order: Vec<usize> = (0..MIXTURES).collect();
        order.sort_by(|&a, &b| self.weights[[y, x, b]].total_cmp(&self.weights[[y, x, a]]));
        let mut cumulative = 0.0;
        for &j in &order {
            if j == k {
                return true;
            }
            cumulative += self.weights[[y, x, j]];
            if cumulative >= BACKGROUND_RATIO {
                return false;
            }
        }
        false
    }

    /// A pixel darker than the dominant background mean by a bounded
    /// ratio is a cast shadow, not an object.
    fn is_shadow(&self, y: usize, x: usize, value: f32) -> bool {
        let dominant = (0..MIXTURES)
            .max_by(|&a, &b| self.weights[[y, x, a]].total_cmp(&self.weights[[y, x, b]]))
            .unwrap_or(0);
        let mean = self.means[[y, x, dominant]];
        if mean <= 0.0 {
            return false;
        }
        let ratio = value / mean;
        (0.5..1.0).contains(&ratio)
    }
}

impl MogExtractor {
    pub fn new(shared: SharedParams, params: MogParams) -> Self {
        let trigger = PeriodicTrigger::new(params.sample_period, false);
        Self {
            core: ExtractorCore::new(shared),
            params,
            trigger,
            model: None,
        }
    }

    pub fn shared_params_mut(&mut self) -> &mut SharedParams {
        &mut self.core.params
    }

    pub fn params_mut(&mut self) -> &mut MogParams {
        &mut self.params
    }

    fn extract(&mut self, frame: &RgbImage, meta: FrameMeta) -> Result<GrayImage> {
        let processed = self.core.preprocess(frame)?;
        let gray = self.core.collapse(&processed)?;

        if self.model.is_none() {
            if let Some(background) = self.core.processed_background() {
                let seed = self.core.collapse(background)?;
                self.model = Some(MogModel::seeded(&seed));
            }
        }
        let due = self.trigger.check_trigger(meta.instant);
        let Some(model) = &mut self.model else {
            // Warm-up: no estimate yet, emit blank output and keep trying
            // to seed on subsequent frames.
            return Ok(self.core.blank_binary());
        };

        let alpha = if due {
            self.params.learning_rate.value(self.params.history)
        } else {
            0.0
        };
        let raw = model.apply(&gray, alpha, self.params.var_threshold, self.params.detect_shadows);
        let cleaned = if self.params.detect_shadows {
            binarize(&raw, SHADOW_VALUE)
        } else {
            raw
        };
        Ok(self.core.finish(cleaned)?)
    }
}

impl ForegroundExtractor for MogExtractor {
    fn setup(&mut self, changed: &ChangeSet) -> Result<()> {
        let resolution_changed = self.core.resolution_changed(changed);
        self.core
            .setup(changed)
            .context("adaptive-mixture setup failed")?;
        self.trigger.set_period(self.params.sample_period);

        // The per-pixel model is tied to the working resolution; a live
        // resolution edit invalidates it and forces a reseed.
        if resolution_changed
            && self
                .model
                .as_ref()
                .is_some_and(|model| model.dimensions() != self.core.working_size())
        {
            self.model = None;
        }
        Ok(())
    }

    fn reset(&mut self) {
        self.core.reset();
        self.trigger.reset();
        self.model = None;
    }

    fn run(
        &mut self,
        frame: &RgbImage,
        background: Option<&RgbImage>,
        background_refreshed: bool,
        meta: FrameMeta,
    ) -> Result<ExtractorOutput> {
        let result = match self.core.refresh_background(background, background_refreshed) {
            Ok(()) => self.extract(frame, meta),
            Err(err) => Err(err.into()),
        };
        let binary = self.core.resolve(result)?;
        Ok(ExtractorOutput {
            binary,
            frame: frame.clone(),
            background: background.cloned(),
            background_refreshed,
            meta,
            debug_vis: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::LearningRate;
    use image::Rgb;
    use std::time::{Duration, Instant};

    fn shared() -> SharedParams {
        SharedParams {
            input_size: (16, 16),
            ..SharedParams::default()
        }
    }

    fn meta_at(index: u64, instant: Instant) -> FrameMeta {
        FrameMeta::new(index, index * 33, instant)
    }

    fn gray_frame(value: u8) -> RgbImage {
        RgbImage::from_pixel(16, 16, Rgb([value, value, value]))
    }

    fn coverage(mask: &GrayImage) -> usize {
        mask.pixels().filter(|p| p[0] == 255).count()
    }

    #[test]
    fn warm_up_emits_blank_until_seeded() {
        let mut extractor = MogExtractor::new(shared(), MogParams::default());
        extractor.setup(&ChangeSet::new()).unwrap();
        let t0 = Instant::now();

        // No background reference yet: blank, not an error.
        let out = extractor
            .run(&gray_frame(90), None, false, meta_at(0, t0))
            .unwrap();
        assert_eq!(coverage(&out.binary), 0);
        assert!(extractor.model.is_none());

        // Once the background arrives the model seeds and classifies.
        let background = gray_frame(90);
        let mut frame = gray_frame(90);
        for y in 4..8 {
            for x in 4..8 {
                frame.put_pixel(x, y, Rgb([230, 230, 230]));
            }
        }
        let out = extractor
            .run(&frame, Some(&background), true, meta_at(1, t0))
            .unwrap();
        assert!(extractor.model.is_some());
        assert_eq!(coverage(&out.binary), 16);
        assert_eq!(out.binary.get_pixel(5, 5)[0], 255);
        assert_eq!(out.binary.get_pixel(12, 12)[0], 0);
    }

    #[test]
    fn shadows_are_thresholded_away_when_enabled() {
        let params = MogParams {
            learning_rate: LearningRate::Fixed(1.0),
            sample_period: Duration::ZERO,
            detect_shadows: true,
            ..MogParams::default()
        };
        let mut extractor = MogExtractor::new(shared(), params);
        extractor.setup(&ChangeSet::new()).unwrap();
        let t0 = Instant::now();

        let background = gray_frame(90);
        // Converge the variance down to its floor.
        for i in 0..3 {
            extractor
                .run(&gray_frame(90), Some(&background), i == 0, meta_at(i as u64, t0))
                .unwrap();
        }

        // Shadowed region at 60 (ratio 0.67) and a real object at 230.
        let mut frame = gray_frame(90);
        for y in 2..6 {
            for x in 2..6 {
                frame.put_pixel(x, y, Rgb([60, 60, 60]));
            }
        }
        for y in 10..14 {
            for x in 10..14 {
                frame.put_pixel(x, y, Rgb([230, 230, 230]));
            }
        }
        let out = extractor
            .run(&frame, Some(&background), false, meta_at(3, t0))
            .unwrap();
        assert_eq!(out.binary.get_pixel(3, 3)[0], 0, "shadow removed");
        assert_eq!(out.binary.get_pixel(11, 11)[0], 255, "object kept");
    }

    #[test]
    fn shadows_stay_foreground_when_detection_is_off() {
        let params = MogParams {
            learning_rate: LearningRate::Fixed(1.0),
            sample_period: Duration::ZERO,
            detect_shadows: false,
            ..MogParams::default()
        };
        let mut extractor = MogExtractor::new(shared(), params);
        extractor.setup(&ChangeSet::new()).unwrap();
        let t0 = Instant::now();

        let background = gray_frame(90);
        for i in 0..3 {
            extractor
                .run(&gray_frame(90), Some(&background), i == 0, meta_at(i as u64, t0))
                .unwrap();
        }

        let mut frame = gray_frame(90);
        for y in 2..6 {
            for x in 2..6 {
                frame.put_pixel(x, y, Rgb([60, 60, 60]));
            }
        }
        let out = extractor
            .run(&frame, Some(&background), false, meta_at(3, t0))
            .unwrap();
        assert_eq!(out.binary.get_pixel(3, 3)[0], 255);
    }

    #[test]
    fn reset_discards_the_model() {
        let mut extractor = MogExtractor::new(shared(), MogParams::default());
        extractor.setup(&ChangeSet::new()).unwrap();
        let t0 = Instant::now();

        let background = gray_frame(90);
        extractor
            .run(&gray_frame(90), Some(&background), true, meta_at(0, t0))
            .unwrap();
        assert!(extractor.model.is_some());

        extractor.reset();
        assert!(extractor.model.is_none());

        // The background cache survives reset, so the model reseeds from
        // it on the next frame.
        let out = extractor
            .run(&gray_frame(90), None, false, meta_at(1, t0))
            .unwrap();
        assert!(extractor.model.is_some());
        assert_eq!(coverage(&out.binary), 0);
    }
}
