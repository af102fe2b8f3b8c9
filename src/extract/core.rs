use anyhow::Result;
use image::{imageops, GrayImage, Luma, RgbImage};

use crate::background::BackgroundCache;
use crate::deck::Deck;
use crate::mask;
use crate::morph::{self, Kernel};
use crate::params::{
    ChangeSet, CollapseMode, MorphOp, Param, RunMode, SharedParams, MAX_TEMPORAL_DEPTH,
};

use super::types::ExtractError;

/// State shared by every algorithm variant: the downscale/blur
/// preprocessing path, the background cache, the summation deck and the
/// post-difference chain, plus the per-frame error policy.
///
/// Owned by composition: each extractor embeds one of these and drives it
/// from its own `setup`/`reset`/`run`.
pub struct ExtractorCore {
    pub params: SharedParams,
    derived: Option<Derived>,
    background: BackgroundCache,
    sum_deck: Option<Deck<Luma<u8>>>,
    error_logged: bool,
}

/// Everything derivable from the current parameter values. Rebuilt
/// wholesale on every `setup` and swapped in, never patched incrementally.
struct Derived {
    working_size: (u32, u32),
    pre_blur_sigma: Option<f32>,
    post_blur_sigma: Option<f32>,
    morph_pre: Option<(MorphOp, Kernel)>,
    morph_post: Option<(MorphOp, Kernel)>,
    summation_depth: usize,
    summation_enabled: bool,
    threshold: u8,
    collapse: CollapseMode,
    mask: GrayImage,
    mask_active: bool,
}

impl Derived {
    fn build(params: &SharedParams) -> Self {
        let working_size = params.working_size();
        let mask_img = mask::rasterize_zones(&params.mask_zones, working_size.0, working_size.1);
        let mask_active = mask::mask_active(params.mask_enabled, &mask_img);
        let summation_depth = params.summation_depth.min(MAX_TEMPORAL_DEPTH);
        Self {
            working_size,
            pre_blur_sigma: (params.pre_blur_size > 0)
                .then(|| morph::blur_sigma(params.pre_blur_size)),
            post_blur_sigma: (params.post_blur_size > 0)
                .then(|| morph::blur_sigma(params.post_blur_size)),
            morph_pre: morph::build_kernel(params.morph_pre.shape, params.morph_pre.size)
                .map(|kernel| (params.morph_pre.op, kernel)),
            morph_post: morph::build_kernel(params.morph_post.shape, params.morph_post.size)
                .map(|kernel| (params.morph_post.op, kernel)),
            summation_depth,
            summation_enabled: summation_depth > 0,
            threshold: params.threshold,
            collapse: params.collapse_mode,
            mask: mask_img,
            mask_active,
        }
    }
}

impl ExtractorCore {
    pub fn new(params: SharedParams) -> Self {
        Self {
            params,
            derived: None,
            background: BackgroundCache::new(),
            sum_deck: None,
            error_logged: false,
        }
    }

    /// Whether the working resolution is affected by this change set.
    /// Deck contents are only rescaled when it is, not on every edit.
    pub fn resolution_changed(&self, changed: &ChangeSet) -> bool {
        self.derived.is_none()
            || changed.contains(&Param::DownscaleFactor)
            || changed.contains(&Param::Interpolation)
    }

    pub fn setup(&mut self, changed: &ChangeSet) -> Result<(), ExtractError> {
        let resolution_changed = self.resolution_changed(changed);
        let preprocess_changed = resolution_changed || changed.contains(&Param::PreBlurSize);

        let derived = Derived::build(&self.params);
        let (w, h) = derived.working_size;

        let capacity = self.temporal_capacity(derived.summation_depth);
        match &mut self.sum_deck {
            None => self.sum_deck = Some(Deck::new(capacity, w, h)),
            Some(deck) => {
                if resolution_changed {
                    deck.rescale_contents(w, h, self.params.interpolation);
                }
                if deck.capacity() != capacity {
                    deck.resize_capacity(capacity, false);
                }
            }
        }

        self.derived = Some(derived);
        self.error_logged = false;

        if preprocess_changed {
            if let Some(clean) = self.background.clean().cloned() {
                let processed = self.preprocess(&clean)?;
                self.background.set_processed(processed);
            }
        }
        Ok(())
    }

    /// Deck capacity policy: tuning mode pre-allocates the maximum
    /// configurable depth so depth sliders never reallocate; run mode
    /// sizes exactly to `1 + configured depth`.
    pub fn temporal_capacity(&self, configured_depth: usize) -> usize {
        match self.params.run_mode {
            RunMode::Tuning => MAX_TEMPORAL_DEPTH + 1,
            RunMode::Production => configured_depth.min(MAX_TEMPORAL_DEPTH) + 1,
        }
    }

    pub fn reset(&mut self) {
        if let Some(deck) = &mut self.sum_deck {
            deck.clear();
        }
        self.error_logged = false;
    }

    pub fn working_size(&self) -> (u32, u32) {
        self.params.working_size()
    }

    pub fn blank_binary(&self) -> GrayImage {
        let (w, h) = self.params.working_size();
        GrayImage::new(w, h)
    }

    fn derived(&self) -> Result<&Derived, ExtractError> {
        self.derived.as_ref().ok_or(ExtractError::Unconfigured)
    }

    /// Downscale and pre-blur one frame. The identical path is applied to
    /// live frames and to the clean background reference.
    pub fn preprocess(&self, frame: &RgbImage) -> Result<RgbImage, ExtractError> {
        let derived = self.derived()?;
        let (want_w, want_h) = self.params.input_size;
        if frame.dimensions() != (want_w, want_h) {
            return Err(ExtractError::ShapeMismatch {
                want_w,
                want_h,
                got_w: frame.width(),
                got_h: frame.height(),
            });
        }
        let (w, h) = derived.working_size;
        let mut out = if frame.dimensions() == (w, h) {
            frame.clone()
        } else {
            self.params.interpolation.resize(frame, w, h)
        };
        if let Some(sigma) = derived.pre_blur_sigma {
            out = imageops::blur(&out, sigma);
        }
        Ok(out)
    }

    /// Update the background cache when upstream reports a refresh, or
    /// when no cached copy exists yet.
    pub fn refresh_background(
        &mut self,
        background: Option<&RgbImage>,
        refreshed: bool,
    ) -> Result<(), ExtractError> {
        let Some(clean) = background else {
            return Ok(());
        };
        if refreshed || !self.background.has_clean() {
            let processed = self.preprocess(clean)?;
            self.background.refresh(clean.clone(), processed);
        }
        Ok(())
    }

    pub fn processed_background(&self) -> Option<&RgbImage> {
        self.background.processed()
    }

    pub fn collapse(&self, diff: &RgbImage) -> Result<GrayImage, ExtractError> {
        Ok(collapse(self.derived()?.collapse, diff))
    }

    /// The shared post-difference chain: post-blur, pre-threshold
    /// morphology, temporal summation, threshold, post-threshold
    /// morphology, then the zone mask. Each stage is individually
    /// enable-gated.
    pub fn finish(&mut self, mut signal: GrayImage) -> Result<GrayImage, ExtractError> {
        let derived = self.derived.as_ref().ok_or(ExtractError::Unconfigured)?;

        if let Some(sigma) = derived.post_blur_sigma {
            signal = imageops::blur(&signal, sigma);
        }
        if let Some((op, kernel)) = &derived.morph_pre {
            signal = morph::apply(*op, &signal, kernel);
        }
        if let Some(deck) = &mut self.sum_deck {
            deck.push(signal.clone());
            if derived.summation_enabled {
                signal = deck.sum_over_depth(derived.summation_depth);
            }
        }
        let mut binary = binarize(&signal, derived.threshold);
        if let Some((op, kernel)) = &derived.morph_post {
            binary = morph::apply(*op, &binary, kernel);
        }
        if derived.mask_active {
            mask::apply_mask(&mut binary, &derived.mask);
        }
        Ok(binary)
    }

    /// Per-frame error policy. Production logs the first failure and
    /// substitutes a correctly-shaped blank frame for that frame only;
    /// tuning propagates immediately so the operator sees the failure at
    /// the moment it is introduced.
    pub fn resolve(&mut self, result: Result<GrayImage>) -> Result<GrayImage> {
        match result {
            Ok(binary) => {
                self.error_logged = false;
                Ok(binary)
            }
            Err(err) => match self.params.run_mode {
                RunMode::Tuning => Err(err),
                RunMode::Production => {
                    if !self.error_logged {
                        tracing::error!("extraction failed, substituting blank output: {err:#}");
                        self.error_logged = true;
                    }
                    Ok(self.blank_binary())
                }
            },
        }
    }
}

/// Collapse a 3-channel difference image to one channel.
pub fn collapse(mode: CollapseMode, frame: &RgbImage) -> GrayImage {
    GrayImage::from_fn(frame.width(), frame.height(), |x, y| {
        let p = frame.get_pixel(x, y);
        let v = match mode {
            CollapseMode::MaxChannel => p[0].max(p[1]).max(p[2]),
            CollapseMode::Grayscale => luma(p[0], p[1], p[2]),
        };
        Luma([v])
    })
}

fn luma(r: u8, g: u8, b: u8) -> u8 {
    (0.299 * r as f32 + 0.587 * g as f32 + 0.114 * b as f32).clamp(0.0, 255.0) as u8
}

pub fn binarize(signal: &GrayImage, threshold: u8) -> GrayImage {
    GrayImage::from_fn(signal.width(), signal.height(), |x, y| {
        Luma([if signal.get_pixel(x, y)[0] > threshold {
            255
        } else {
            0
        }])
    })
}

/// Per-pixel absolute difference of two equally-shaped color frames.
pub fn absdiff(a: &RgbImage, b: &RgbImage) -> Result<RgbImage, ExtractError> {
    if a.dimensions() != b.dimensions() {
        return Err(ExtractError::ShapeMismatch {
            want_w: a.width(),
            want_h: a.height(),
            got_w: b.width(),
            got_h: b.height(),
        });
    }
    let data: Vec<u8> = a
        .as_raw()
        .iter()
        .zip(b.as_raw().iter())
        .map(|(&x, &y)| x.abs_diff(y))
        .collect();
    Ok(RgbImage::from_raw(a.width(), a.height(), data)
        .expect("difference length matches input shape"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn collapse_modes_differ_on_single_channel_signals() {
        let diff = RgbImage::from_pixel(2, 2, Rgb([0, 0, 110]));
        let max = collapse(CollapseMode::MaxChannel, &diff);
        let gray = collapse(CollapseMode::Grayscale, &diff);
        assert_eq!(max.get_pixel(0, 0)[0], 110);
        // Plain luma weighs blue at 0.114, far below the max-channel value.
        assert!(gray.get_pixel(0, 0)[0] < 20);
    }

    #[test]
    fn binarize_is_strict_greater_than() {
        let mut signal = GrayImage::new(3, 1);
        signal.put_pixel(0, 0, Luma([30]));
        signal.put_pixel(1, 0, Luma([31]));
        let binary = binarize(&signal, 30);
        assert_eq!(binary.get_pixel(0, 0)[0], 0);
        assert_eq!(binary.get_pixel(1, 0)[0], 255);
        assert_eq!(binary.get_pixel(2, 0)[0], 0);
    }

    #[test]
    fn absdiff_rejects_mismatched_shapes() {
        let a = RgbImage::new(4, 4);
        let b = RgbImage::new(4, 2);
        assert!(absdiff(&a, &b).is_err());
    }
}
