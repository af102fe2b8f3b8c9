use std::time::Instant;

use anyhow::Result;
use image::{GrayImage, RgbImage};
use thiserror::Error;

use crate::params::ChangeSet;

/// Timing metadata threaded through the pipeline unchanged.
#[derive(Debug, Clone, Copy)]
pub struct FrameMeta {
    /// Frame index within the current stream.
    pub index: u64,
    /// Capture time as epoch milliseconds.
    pub epoch_ms: u64,
    /// Monotonic capture instant, used for timer-gated work.
    pub instant: Instant,
}

impl FrameMeta {
    pub fn new(index: u64, epoch_ms: u64, instant: Instant) -> Self {
        Self {
            index,
            epoch_ms,
            instant,
        }
    }
}

/// Everything a downstream stage needs from one extraction step: the
/// binary foreground mask plus pass-through copies of the inputs, so later
/// stages never re-fetch earlier-stage outputs.
#[derive(Debug, Clone)]
pub struct ExtractorOutput {
    /// Single-channel foreground mask, 0 or 255, at working resolution.
    pub binary: GrayImage,
    /// The input frame, unchanged.
    pub frame: RgbImage,
    /// The input background reference, unchanged.
    pub background: Option<RgbImage>,
    pub background_refreshed: bool,
    pub meta: FrameMeta,
    /// Optional visualization (e.g. the flow color encoding).
    pub debug_vis: Option<RgbImage>,
}

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("frame is {got_w}x{got_h} but the configured input shape is {want_w}x{want_h}")]
    ShapeMismatch {
        want_w: u32,
        want_h: u32,
        got_w: u32,
        got_h: u32,
    },
    #[error("run() called before setup()")]
    Unconfigured,
    #[error("no background reference available")]
    MissingBackground,
}

/// The per-frame protocol shared by every extraction algorithm.
///
/// Lifecycle: `setup` once at configuration time and again after every
/// parameter change, `run` once per frame, `reset` on stream
/// discontinuities, `close` when the stage is torn down. Callers must
/// serialize `setup` and `run`; neither is safe to invoke concurrently
/// with the other.
pub trait ForegroundExtractor {
    /// Recompute every derived value (kernels, enable flags, deck
    /// capacities, mask) from current parameters. Idempotent. The change
    /// set names the parameters edited since the last call so only the
    /// affected caches are rebuilt expensively.
    fn setup(&mut self, changed: &ChangeSet) -> Result<()>;

    /// Clear all temporal state (decks, adaptive models, timers) without
    /// touching configuration.
    ///
    /// Call this on:
    /// - Seeks or jumps in the video stream
    /// - Camera switches
    /// - Any other discontinuity where differencing across the gap would
    ///   produce garbage
    fn reset(&mut self);

    /// Process one frame. The background cache is refreshed first when
    /// `background_refreshed` is set or no cached copy exists yet.
    fn run(
        &mut self,
        frame: &RgbImage,
        background: Option<&RgbImage>,
        background_refreshed: bool,
        meta: FrameMeta,
    ) -> Result<ExtractorOutput>;

    /// Release resources held outside the frame loop.
    fn close(&mut self) {
        // Default implementation: nothing to release.
    }
}
