use anyhow::{Context, Result};
use image::{GrayImage, Rgb, RgbImage};

use crate::deck::Deck;
use crate::params::{ChangeSet, FrameDiffParams, SharedParams};

use super::core::ExtractorCore;
use super::types::{ExtractError, ExtractorOutput, ForegroundExtractor, FrameMeta};

/// Frame-to-frame differencing: the difference signal is the current frame
/// against the frame pushed `difference_depth` frames ago. Cheap, needs no
/// background reference, and highlights only moving edges.
pub struct FrameDiffExtractor {
    core: ExtractorCore,
    params: FrameDiffParams,
    deck: Option<Deck<Rgb<u8>>>,
    /// Depth actually used at runtime, clamped against deck capacity.
    depth: usize,
}

impl FrameDiffExtractor {
    pub fn new(shared: SharedParams, params: FrameDiffParams) -> Self {
        let depth = params.difference_depth;
        Self {
            core: ExtractorCore::new(shared),
            params,
            deck: None,
            depth,
        }
    }

    pub fn shared_params_mut(&mut self) -> &mut SharedParams {
        &mut self.core.params
    }

    pub fn params_mut(&mut self) -> &mut FrameDiffParams {
        &mut self.params
    }

    fn extract(&mut self, frame: &RgbImage) -> Result<GrayImage> {
        let processed = self.core.preprocess(frame)?;
        let deck = self.deck.as_mut().ok_or(ExtractError::Unconfigured)?;
        deck.push(processed);
        let diff = deck.diff_against_depth(self.depth);
        let signal = self.core.collapse(&diff)?;
        Ok(self.core.finish(signal)?)
    }
}

impl ForegroundExtractor for FrameDiffExtractor {
    fn setup(&mut self, changed: &ChangeSet) -> Result<()> {
        let resolution_changed = self.core.resolution_changed(changed);
        self.core
            .setup(changed)
            .context("frame-diff setup failed")?;

        let (w, h) = self.core.working_size();
        let capacity = self.core.temporal_capacity(self.params.difference_depth);
        match &mut self.deck {
            None => self.deck = Some(Deck::new(capacity, w, h)),
            Some(deck) => {
                if resolution_changed {
                    deck.rescale_contents(w, h, self.core.params.interpolation);
                }
                if deck.capacity() != capacity {
                    deck.resize_capacity(capacity, false);
                }
            }
        }
        // Clamp here so the deck never sees an out-of-range read, even
        // while the depth slider is being dragged.
        self.depth = self.params.difference_depth.min(capacity - 1);
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
