use anyhow::{Context, Result};
use image::{GrayImage, RgbImage};

use crate::params::{ChangeSet, SharedParams};

use super::core::{absdiff, ExtractorCore};
use super::types::{ExtractError, ExtractorOutput, ForegroundExtractor, FrameMeta};

/// Static-background subtraction: the difference signal is the current
/// frame against the processed copy of the upstream background reference.
/// No temporal state beyond the background cache.
pub struct StaticBgExtractor {
    core: ExtractorCore,
}

impl StaticBgExtractor {
    pub fn new(shared: SharedParams) -> Self {
        Self {
            core: ExtractorCore::new(shared),
        }
    }

    pub fn shared_params_mut(&mut self) -> &mut SharedParams {
        &mut self.core.params
    }

    fn extract(&mut self, frame: &RgbImage) -> Result<GrayImage> {
        let processed = self.core.preprocess(frame)?;
        let signal = {
            let background = self
                .core
                .processed_background()
                .ok_or(ExtractError::MissingBackground)?;
            let diff = absdiff(&processed, background)?;
            self.core.collapse(&diff)?
        };
        Ok(self.core.finish(signal)?)
    }
}

impl ForegroundExtractor for StaticBgExtractor {
    fn setup(&mut self, changed: &ChangeSet) -> Result<()> {
        self.core
            .setup(changed)
            .context("static-background setup failed")
    }

    fn reset(&mut self) {
        self.core.reset();
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
    use crate::params::{CollapseMode, RunMode};
    use image::Rgb;
    use std::time::Instant;

    fn meta(index: u64) -> FrameMeta {
        FrameMeta::new(index, index * 33, Instant::now())
    }

    fn gray_frame(size: (u32, u32), value: u8) -> RgbImage {
        RgbImage::from_pixel(size.0, size.1, Rgb([value, value, value]))
    }

    #[test]
    fn bright_square_is_segmented_exactly() {
        let shared = SharedParams {
            input_size: (32, 32),
            threshold: 30,
            ..SharedParams::default()
        };
        let mut extractor = StaticBgExtractor::new(shared);
        extractor.setup(&ChangeSet::new()).unwrap();

        let background = gray_frame((32, 32), 90);
        let mut frame = background.clone();
        for y in 10..20 {
            for x in 10..20 {
                frame.put_pixel(x, y, Rgb([230, 230, 230]));
            }
        }

        let out = extractor
            .run(&frame, Some(&background), true, meta(0))
            .unwrap();
        for (x, y, p) in out.binary.enumerate_pixels() {
            let inside = (10..20).contains(&x) && (10..20).contains(&y);
            assert_eq!(p[0] == 255, inside, "pixel ({x},{y})");
        }
    }

    #[test]
    fn max_channel_collapse_catches_single_channel_change() {
        let shared = SharedParams {
            input_size: (8, 8),
            collapse_mode: CollapseMode::MaxChannel,
            ..SharedParams::default()
        };
        let mut extractor = StaticBgExtractor::new(shared);
        extractor.setup(&ChangeSet::new()).unwrap();

        let background = gray_frame((8, 8), 90);
        // Only the blue channel moves; luma barely registers it.
        let frame = RgbImage::from_pixel(8, 8, Rgb([90, 90, 200]));

        let out = extractor
            .run(&frame, Some(&background), true, meta(0))
            .unwrap();
        assert!(out.binary.pixels().all(|p| p[0] == 255));

        let shared_gray = SharedParams {
            input_size: (8, 8),
            collapse_mode: CollapseMode::Grayscale,
            ..SharedParams::default()
        };
        let mut extractor = StaticBgExtractor::new(shared_gray);
        extractor.setup(&ChangeSet::new()).unwrap();
        let out = extractor
            .run(&frame, Some(&background), true, meta(0))
            .unwrap();
        assert!(out.binary.pixels().all(|p| p[0] == 0));
    }

    #[test]
    fn missing_background_degrades_to_blank_in_production() {
        let shared = SharedParams {
            input_size: (8, 8),
            run_mode: RunMode::Production,
            ..SharedParams::default()
        };
        let mut extractor = StaticBgExtractor::new(shared);
        extractor.setup(&ChangeSet::new()).unwrap();

        let out = extractor
            .run(&gray_frame((8, 8), 90), None, false, meta(0))
            .unwrap();
        assert_eq!(out.binary.dimensions(), (8, 8));
        assert!(out.binary.pixels().all(|p| p[0] == 0));
    }

    #[test]
    fn tuning_mode_propagates_failures() {
        let shared = SharedParams {
            input_size: (8, 8),
            run_mode: RunMode::Tuning,
            ..SharedParams::default()
        };
        let mut extractor = StaticBgExtractor::new(shared);
        extractor.setup(&ChangeSet::new()).unwrap();

        // No background reference: tuning mode surfaces the failure.
        assert!(extractor
            .run(&gray_frame((8, 8), 90), None, false, meta(0))
            .is_err());

        // A mid-edit shape mismatch propagates too.
        assert!(extractor
            .run(&gray_frame((4, 4), 90), None, false, meta(1))
            .is_err());
    }
}
