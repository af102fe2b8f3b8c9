//! Foreground-extraction / background-modeling stage of a live-tunable
//! video-analytics pipeline.
//!
//! Five interchangeable algorithms convert a color frame (plus an optional
//! background reference) into a single-channel foreground mask behind one
//! contract ([`extract::ForegroundExtractor`]): frame-to-frame
//! differencing, static-background subtraction, rolling-average
//! subtraction, adaptive mixture-model subtraction and dense optical
//! flow. Temporal state lives in fixed-capacity frame decks; every
//! derived cache (kernels, enable flags, zone masks) is rebuilt wholesale
//! on `setup` so mid-stream parameter edits stay cheap and predictable.

pub mod background;
pub mod deck;
pub mod extract;
pub mod mask;
pub mod morph;
pub mod params;
pub mod trigger;

pub use extract::{
    create_extractor, Algorithm, ExtractError, ExtractorOutput, ForegroundExtractor, FrameMeta,
};
pub use params::{ChangeSet, SharedParams};
