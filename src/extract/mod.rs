mod core;
mod frame_diff;
mod mog;
mod optical_flow;
mod rolling_avg;
mod static_bg;
pub mod types;

pub use self::core::{absdiff, binarize, collapse, ExtractorCore};
pub use frame_diff::FrameDiffExtractor;
pub use mog::MogExtractor;
pub use optical_flow::OpticalFlowExtractor;
pub use rolling_avg::RollingAvgExtractor;
pub use static_bg::StaticBgExtractor;
pub use types::{ExtractError, ExtractorOutput, ForegroundExtractor, FrameMeta};

use crate::params::SharedParams;

/// The interchangeable extraction algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Algorithm {
    FrameDiff,
    StaticBackground,
    RollingAverage,
    AdaptiveMixture,
    OpticalFlow,
}

/// Build an extractor with default algorithm-specific settings. Call
/// `setup` before the first frame.
pub fn create_extractor(
    algorithm: Algorithm,
    shared: SharedParams,
) -> Box<dyn ForegroundExtractor> {
    match algorithm {
        Algorithm::FrameDiff => Box::new(FrameDiffExtractor::new(shared, Default::default())),
        Algorithm::StaticBackground => Box::new(StaticBgExtractor::new(shared)),
        Algorithm::RollingAverage => Box::new(RollingAvgExtractor::new(shared, Default::default())),
        Algorithm::AdaptiveMixture => Box::new(MogExtractor::new(shared, Default::default())),
        Algorithm::OpticalFlow => Box::new(OpticalFlowExtractor::new(shared, Default::default())),
    }
}
