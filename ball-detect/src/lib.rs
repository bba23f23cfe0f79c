//! Ball detection on captured frames.
//!
//! The detector itself is pluggable ([`Detector`]); the service wraps it
//! with per-camera bounded queues, a worker pool, a frame_index reorder
//! stage, and the error boundary required at every worker thread.

use pitch_types::{Detection, Frame};

mod centroid;
mod reorder;
mod service;

pub use centroid::CentroidDetector;
pub use reorder::ReorderBuffer;
pub use service::{DetectionService, DetectionStats};

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Result of running the detector over one frame.
pub type DetectResult = std::result::Result<Vec<Detection>, BoxError>;

/// A per-frame ball detector. Implementations must be pure with respect
/// to the frame: the same frame always yields the same detections.
pub trait Detector: Send + Sync {
    fn detect(&self, frame: &Frame) -> DetectResult;
}

impl<F> Detector for F
where
    F: Fn(&Frame) -> DetectResult + Send + Sync,
{
    fn detect(&self, frame: &Frame) -> DetectResult {
        self(frame)
    }
}
