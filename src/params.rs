use std::collections::HashSet;
use std::time::Duration;

use image::imageops::{self, FilterType};
use image::{ImageBuffer, Pixel};

/// Deepest temporal reach any depth slider can request. Tuning-mode decks
/// are pre-allocated to this bound so dragging a depth slider never
/// reallocates.
pub const MAX_TEMPORAL_DEPTH: usize = 30;

/// Names of tunable parameters, used to tell `setup` which caches need to
/// be rebuilt after a live edit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Param {
    DownscaleFactor,
    Interpolation,
    PreBlurSize,
    CollapseMode,
    PostBlurSize,
    MorphPre,
    MorphPost,
    SummationDepth,
    Threshold,
    MaskZones,
    MaskEnabled,
    RunMode,
    DifferenceDepth,
    CapturePeriod,
    SampleWeight,
    History,
    VarianceThreshold,
    LearningRate,
    DetectShadows,
    PyramidScale,
    PyramidLevels,
    WindowSize,
    Iterations,
}

/// Set of parameters changed since the last `setup` call.
pub type ChangeSet = HashSet<Param>;

/// Resize filter used for the downscale path and for in-place deck
/// rescaling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interpolation {
    Nearest,
    Bilinear,
    /// Box sampling; the best choice for strong downscales.
    Area,
}

impl Interpolation {
    pub fn resize<P>(
        self,
        image: &ImageBuffer<P, Vec<u8>>,
        width: u32,
        height: u32,
    ) -> ImageBuffer<P, Vec<u8>>
    where
        P: Pixel<Subpixel = u8> + 'static,
    {
        match self {
            Interpolation::Nearest => imageops::resize(image, width, height, FilterType::Nearest),
            Interpolation::Bilinear => imageops::resize(image, width, height, FilterType::Triangle),
            Interpolation::Area => imageops::thumbnail(image, width, height),
        }
    }
}

/// How a 3-channel difference image collapses to a single channel.
/// `MaxChannel` keeps the strongest per-pixel response for higher
/// sensitivity; `Grayscale` is a plain luma conversion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollapseMode {
    MaxChannel,
    Grayscale,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MorphOp {
    /// Shrink bright regions (expand dark).
    Erode,
    /// Expand bright regions.
    Dilate,
    /// Erode then dilate; removes bright specks.
    Open,
    /// Dilate then erode; fills dark holes.
    Close,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MorphShape {
    Square,
    Circle,
    Cross,
}

/// Morphology stage settings. `size` is the neighborhood radius; 0
/// disables the stage entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MorphParams {
    pub op: MorphOp,
    pub shape: MorphShape,
    pub size: u32,
}

impl Default for MorphParams {
    fn default() -> Self {
        Self {
            op: MorphOp::Open,
            shape: MorphShape::Square,
            size: 0,
        }
    }
}

/// Adaptation rate for the mixture model. `Auto` derives the rate from the
/// configured history length (`1 / history`).
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LearningRate {
    Auto,
    Fixed(f32),
}

impl LearningRate {
    pub fn value(self, history: usize) -> f32 {
        match self {
            LearningRate::Auto => 1.0 / history.max(1) as f32,
            LearningRate::Fixed(rate) => rate.clamp(0.0, 1.0),
        }
    }
}

/// Interactive tuning pre-allocates decks to their maximum depth and
/// propagates per-frame errors to the operator; production sizes buffers
/// exactly and degrades to blank output instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    Production,
    Tuning,
}

/// A polygon zone in normalized coordinates (0.0–1.0 in both axes).
/// Pixels inside any zone are kept; everything else is dropped.
#[derive(Debug, Clone, PartialEq)]
pub struct Zone {
    pub points: Vec<(f32, f32)>,
}

impl Zone {
    pub fn new(points: Vec<(f32, f32)>) -> Self {
        Self { points }
    }
}

/// Parameters shared by every extraction algorithm: the downscale path,
/// the post-difference chain and the zone mask.
#[derive(Debug, Clone)]
pub struct SharedParams {
    /// Resolution frames arrive at, before downscaling.
    pub input_size: (u32, u32),
    /// Working-resolution scale factor, clamped to 0.1–1.0.
    pub downscale_factor: f32,
    pub interpolation: Interpolation,
    /// Gaussian blur applied to frames (and the background) before
    /// differencing; 0 disables.
    pub pre_blur_size: u32,
    pub collapse_mode: CollapseMode,
    /// Blur applied to the single-channel difference; 0 disables.
    pub post_blur_size: u32,
    pub morph_pre: MorphParams,
    pub morph_post: MorphParams,
    /// Number of prior difference frames accumulated before thresholding;
    /// 0 disables summation.
    pub summation_depth: usize,
    /// Binarization threshold on the 8-bit difference signal.
    pub threshold: u8,
    pub mask_enabled: bool,
    pub mask_zones: Vec<Zone>,
    pub run_mode: RunMode,
}

impl SharedParams {
    /// The (possibly downscaled) resolution all per-frame processing
    /// operates on.
    pub fn working_size(&self) -> (u32, u32) {
        let factor = self.downscale_factor.clamp(0.1, 1.0);
        let (w, h) = self.input_size;
        (
            ((w as f32 * factor).round() as u32).max(1),
            ((h as f32 * factor).round() as u32).max(1),
        )
    }
}

impl Default for SharedParams {
    fn default() -> Self {
        Self {
            input_size: (320, 240),
            downscale_factor: 1.0,
            interpolation: Interpolation::Bilinear,
            pre_blur_size: 0,
            collapse_mode: CollapseMode::MaxChannel,
            post_blur_size: 0,
            morph_pre: MorphParams::default(),
            morph_post: MorphParams {
                op: MorphOp::Close,
                shape: MorphShape::Square,
                size: 0,
            },
            summation_depth: 0,
            threshold: 30,
            mask_enabled: false,
            mask_zones: Vec::new(),
            run_mode: RunMode::Production,
        }
    }
}

/// Frame-to-frame differencing settings.
#[derive(Debug, Clone, Copy)]
pub struct FrameDiffParams {
    /// How many pushes back the reference frame sits.
    pub difference_depth: usize,
}

impl Default for FrameDiffParams {
    fn default() -> Self {
        Self { difference_depth: 1 }
    }
}

/// Rolling-average background settings.
#[derive(Debug, Clone, Copy)]
pub struct RollingParams {
    /// Minimum interval between blend operations.
    pub capture_period: Duration,
    /// Weight of a new sample in the exponential blend (0.0–1.0).
    pub sample_weight: f32,
}

impl Default for RollingParams {
    fn default() -> Self {
        Self {
            capture_period: Duration::from_secs(2),
            sample_weight: 0.05,
        }
    }
}

/// Adaptive Gaussian-mixture settings.
#[derive(Debug, Clone, Copy)]
pub struct MogParams {
    /// History length; also the denominator of the `Auto` learning rate.
    pub history: usize,
    /// Squared-distance gate, in multiples of the component variance.
    pub var_threshold: f32,
    pub learning_rate: LearningRate,
    pub detect_shadows: bool,
    /// Minimum interval between model updates.
    pub sample_period: Duration,
}

impl Default for MogParams {
    fn default() -> Self {
        Self {
            history: 250,
            var_threshold: 16.0,
            learning_rate: LearningRate::Auto,
            detect_shadows: true,
            sample_period: Duration::from_millis(500),
        }
    }
}

/// Dense optical-flow settings.
#[derive(Debug, Clone, Copy)]
pub struct FlowParams {
    /// Scale between pyramid levels (0.0–1.0 exclusive).
    pub pyramid_scale: f32,
    pub pyramid_levels: usize,
    /// Side length of the matching window, in pixels.
    pub window_size: usize,
    /// Refinement iterations per pyramid level.
    pub iterations: usize,
    /// Multiplier mapping flow magnitude (pixels) onto the 8-bit
    /// difference signal.
    pub magnitude_scale: f32,
}

impl Default for FlowParams {
    fn default() -> Self {
        Self {
            pyramid_scale: 0.5,
            pyramid_levels: 3,
            window_size: 9,
            iterations: 3,
            magnitude_scale: 32.0,
        }
    }
}
