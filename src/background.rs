use std::sync::{Arc, Mutex};

use image::RgbImage;

/// Cached background reference: the clean frame as delivered by the
/// background-capture collaborator, and a processed copy that went through
/// the same downscale/blur path as live frames.
///
/// The processed copy is only ever derived from the clean copy. It is
/// recomputed when the clean copy changes and again whenever a shared
/// processing parameter changes.
#[derive(Default)]
pub struct BackgroundCache {
    clean: Option<RgbImage>,
    processed: Option<RgbImage>,
}

impl BackgroundCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_clean(&self) -> bool {
        self.clean.is_some()
    }

    pub fn clean(&self) -> Option<&RgbImage> {
        self.clean.as_ref()
    }

    pub fn processed(&self) -> Option<&RgbImage> {
        self.processed.as_ref()
    }

    /// Store a new clean background together with its processed copy.
    pub fn refresh(&mut self, clean: RgbImage, processed: RgbImage) {
        self.clean = Some(clean);
        self.processed = Some(processed);
    }

    /// Replace only the processed copy, re-derived from the unchanged
    /// clean frame after a processing-parameter change.
    pub fn set_processed(&mut self, processed: RgbImage) {
        self.processed = Some(processed);
    }
}

/// Hand-off point between an off-thread background generator and the
/// per-frame path. The producer publishes a completed image wholesale; the
/// consumer only ever observes a complete old image or a complete new one,
/// never a partial write.
#[derive(Default)]
pub struct BackgroundSlot {
    slot: Mutex<Option<Arc<RgbImage>>>,
}

impl BackgroundSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the slot contents with a finished background image.
    pub fn publish(&self, image: RgbImage) {
        let mut slot = self.slot.lock().expect("background slot poisoned");
        *slot = Some(Arc::new(image));
    }

    /// Take the most recently published image, leaving the slot empty so
    /// the consumer refreshes at most once per publication.
    pub fn take_latest(&self) -> Option<Arc<RgbImage>> {
        self.slot.lock().expect("background slot poisoned").take()
    }
}
