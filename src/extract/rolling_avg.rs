use anyhow::{Context, Result};
use image::{GrayImage, Rgb, RgbImage};
use ndarray::Array3;

use crate::params::{ChangeSet, RollingParams, SharedParams};
use crate::trigger::PeriodicTrigger;

use super::core::{absdiff, ExtractorCore};
use super::types::{ExtractError, ExtractorOutput, ForegroundExtractor, FrameMeta};

/// Rolling-average background subtraction: the background is an
/// exponential moving average of past frames, refreshed on a capture
/// timer rather than every frame.
///
/// The blended accumulator stays in f32 so repeated blending does not
/// collect rounding error; only the processing copy used for differencing
/// is truncated to 8 bits.
pub struct RollingAvgExtractor {
    core: ExtractorCore,
    params: RollingParams,
    trigger: PeriodicTrigger,
    accum: Option<Array3<f32>>,
    /// Truncated copy of the accumulator, at working resolution.
    display: Option<RgbImage>,
}

impl RollingAvgExtractor {
    pub fn new(shared: SharedParams, params: RollingParams) -> Self {
        let trigger = PeriodicTrigger::new(params.capture_period, false);
        Self {
            core: ExtractorCore::new(shared),
            params,
            trigger,
            accum: None,
            display: None,
        }
    }

    pub fn shared_params_mut(&mut self) -> &mut SharedParams {
        &mut self.core.params
    }

    pub fn params_mut(&mut self) -> &mut RollingParams {
        &mut self.params
    }

    /// Fold one sample into the accumulator. The first sample after a
    /// reset seeds the background directly instead of blending against an
    /// undefined prior.
    fn blend(&mut self, sample: &RgbImage) {
        let sample_arr = to_f32(sample);
        match &mut self.accum {
            Some(accum) if accum.dim() == sample_arr.dim() => {
                let weight = self.params.sample_weight.clamp(0.0, 1.0);
                accum.zip_mut_with(&sample_arr, |old, &new| {
                    *old = *old * (1.0 - weight) + new * weight;
                });
            }
            _ => self.accum = Some(sample_arr),
        }
        self.display = self.accum.as_ref().map(to_u8);
    }

    fn extract(&mut self, frame: &RgbImage, meta: FrameMeta) -> Result<GrayImage> {
        let processed = self.core.preprocess(frame)?;
        let due = self.trigger.check_trigger(meta.instant);
        if self.accum.is_none() || due {
            self.blend(&processed);
        }
        let signal = {
            let background = self
                .display
                .as_ref()
                .ok_or(ExtractError::MissingBackground)?;
            let diff = absdiff(&processed, background)?;
            self.core.collapse(&diff)?
        };
        Ok(self.core.finish(signal)?)
    }
}

impl ForegroundExtractor for RollingAvgExtractor {
    fn setup(&mut self, changed: &ChangeSet) -> Result<()> {
        let resolution_changed = self.core.resolution_changed(changed);
        self.core
            .setup(changed)
            .context("rolling-average setup failed")?;
        self.trigger.set_period(self.params.capture_period);

        // Carry the background across a live resolution edit by rescaling
        // the truncated copy and rebuilding the accumulator from it.
        if resolution_changed {
            if let Some(display) = self.display.take() {
                let (w, h) = self.core.working_size();
                let rescaled = if display.dimensions() != (w, h) {
                    self.core.params.interpolation.resize(&display, w, h)
                } else {
                    display
                };
                self.accum = Some(to_f32(&rescaled));
                self.display = Some(rescaled);
            }
        }
        Ok(())
    }

    fn reset(&mut self) {
        self.core.reset();
        self.trigger.reset();
        self.accum = None;
        self.display = None;
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

fn to_f32(image: &RgbImage) -> Array3<f32> {
    let (w, h) = image.dimensions();
    let mut arr = Array3::zeros((h as usize, w as usize, 3));
    for (x, y, p) in image.enumerate_pixels() {
        for c in 0..3 {
            arr[[y as usize, x as usize, c]] = p[c] as f32;
        }
    }
    arr
}

fn to_u8(arr: &Array3<f32>) -> RgbImage {
    let (h, w, _) = arr.dim();
    RgbImage::from_fn(w as u32, h as u32, |x, y| {
        let px = |c: usize| arr[[y as usize, x as usize, c]].round().clamp(0.0, 255.0) as u8;
        Rgb([px(0), px(1), px(2)])
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    fn extractor(weight: f32, period_ms: u64) -> RollingAvgExtractor {
        let shared = SharedParams {
            input_size: (8, 8),
            ..SharedParams::default()
        };
        let params = RollingParams {
            capture_period: Duration::from_millis(period_ms),
            sample_weight: weight,
        };
        let mut extractor = RollingAvgExtractor::new(shared, params);
        extractor.setup(&ChangeSet::new()).unwrap();
        extractor
    }

    fn meta_at(index: u64, instant: Instant) -> FrameMeta {
        FrameMeta::new(index, index * 33, instant)
    }

    fn gray_frame(value: u8) -> RgbImage {
        RgbImage::from_pixel(8, 8, Rgb([value, value, value]))
    }

    fn coverage(mask: &GrayImage) -> usize {
        mask.pixels().filter(|p| p[0] == 255).count()
    }

    #[test]
    fn first_sample_seeds_background_exactly() {
        let mut extractor = extractor(0.05, 100);
        let t0 = Instant::now();

        // The very first frame becomes the background: zero difference.
        let out = extractor
            .run(&gray_frame(90), None, false, meta_at(0, t0))
            .unwrap();
        assert_eq!(coverage(&out.binary), 0);
        assert_eq!(
            extractor.display.as_ref().unwrap().get_pixel(0, 0),
            &Rgb([90, 90, 90])
        );
    }

    #[test]
    fn blend_waits_for_the_capture_timer() {
        let mut extractor = extractor(1.0, 100);
        let t0 = Instant::now();

        extractor
            .run(&gray_frame(90), None, false, meta_at(0, t0))
            .unwrap();

        // Within the period the bright frame is pure foreground and must
        // not leak into the background.
        let out = extractor
            .run(
                &gray_frame(200),
                None,
                false,
                meta_at(1, t0 + Duration::from_millis(10)),
            )
            .unwrap();
        assert_eq!(coverage(&out.binary), 64);

        // Once the period elapses the blend runs (weight 1.0 replaces the
        // background outright), so the same frame goes quiet.
        let out = extractor
            .run(
                &gray_frame(200),
                None,
                false,
                meta_at(2, t0 + Duration::from_millis(110)),
            )
            .unwrap();
        assert_eq!(coverage(&out.binary), 0);

        // And the old background is now foreground against the new one.
        let out = extractor
            .run(
                &gray_frame(90),
                None,
                false,
                meta_at(3, t0 + Duration::from_millis(120)),
            )
            .unwrap();
        assert_eq!(coverage(&out.binary), 64);
    }

    #[test]
    fn reset_discards_the_rolling_background() {
        let mut extractor = extractor(0.05, 100);
        let t0 = Instant::now();

        extractor
            .run(&gray_frame(90), None, false, meta_at(0, t0))
            .unwrap();
        extractor.reset();
        assert!(extractor.accum.is_none());

        // Post-reset the next frame reseeds, so even a very different
        // frame produces no foreground.
        let out = extractor
            .run(&gray_frame(200), None, false, meta_at(1, t0))
            .unwrap();
        assert_eq!(coverage(&out.binary), 0);
    }

    #[test]
    fn partial_blend_moves_background_toward_sample() {
        let mut extractor = extractor(0.5, 100);
        let t0 = Instant::now();

        extractor
            .run(&gray_frame(100), None, false, meta_at(0, t0))
            .unwrap();
        extractor
            .run(
                &gray_frame(200),
                None,
                false,
                meta_at(1, t0 + Duration::from_millis(110)),
            )
            .unwrap();

        // 100 * 0.5 + 200 * 0.5 = 150.
        assert_eq!(
            extractor.display.as_ref().unwrap().get_pixel(0, 0),
            &Rgb([150, 150, 150])
        );
    }
}
