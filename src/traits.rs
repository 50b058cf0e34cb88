use image::RgbImage;

use crate::errors::Result;
use crate::object::Object;

/// Task a detection facade was built for. Decides which drawing routine
/// may be applied to its results.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Task {
    Detect,
    Segment,
}

/// Abstraction over detection and instance-segmentation facades.
///
/// The batch driver depends on this trait rather than on a concrete model so
/// it can be exercised with mocks. Images are RGB; callers convert before
/// calling.
pub trait ObjectDetector: Send + Sync {
    fn detect(&self, image: &RgbImage) -> Result<Vec<Object>>;

    fn task(&self) -> Task;

    /// Display names indexed by label; may be empty.
    fn class_names(&self) -> &[String] {
        &[]
    }
}
