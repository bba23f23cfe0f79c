//! Shared data model for the pitch tracking pipeline.
//!
//! Everything that crosses a service boundary lives here: frames,
//! detections, stereo observations, pitch lifecycle data, event payloads,
//! the error taxonomy and the configuration tree.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

mod clock;
mod config;
mod manifest;

pub use clock::monotonic_now_ns;
pub use config::{
    default_codec_preference, CameraConfig, DetectionConfig, GatingVolume, PairingConfig,
    PitchConfig, RecordingConfig, StateMachineConfig, TrackingParams,
};
pub use manifest::{
    pitch_dirname, AnalysisRecord, Codec, PitchManifest, Resolution, SessionManifest,
    MANIFEST_SCHEMA, PITCH_MANIFEST_FNAME, SESSION_MANIFEST_FNAME,
};

/// Version of the running application, stamped into manifests.
pub fn app_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

// --------------------------------------------------------------------
// cameras and frames

/// Which side of the stereo rig a camera is mounted on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CamSide {
    Left,
    Right,
}

impl CamSide {
    pub const BOTH: [CamSide; 2] = [CamSide::Left, CamSide::Right];

    pub fn as_str(&self) -> &'static str {
        match self {
            CamSide::Left => "left",
            CamSide::Right => "right",
        }
    }

    /// Index into per-camera `[T; 2]` tables.
    #[inline]
    pub fn idx(&self) -> usize {
        match self {
            CamSide::Left => 0,
            CamSide::Right => 1,
        }
    }

    pub fn other(&self) -> CamSide {
        match self {
            CamSide::Left => CamSide::Right,
            CamSide::Right => CamSide::Left,
        }
    }
}

impl std::fmt::Display for CamSide {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pixel format of a captured frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixFmt {
    /// 8-bit grayscale.
    Mono8,
    /// Packed 24-bit RGB.
    Rgb8,
}

impl PixFmt {
    #[inline]
    pub fn bytes_per_pixel(&self) -> usize {
        match self {
            PixFmt::Mono8 => 1,
            PixFmt::Rgb8 => 3,
        }
    }
}

impl std::fmt::Display for PixFmt {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            PixFmt::Mono8 => f.write_str("mono8"),
            PixFmt::Rgb8 => f.write_str("rgb8"),
        }
    }
}

/// One captured image from one camera.
///
/// Frames are shared by reference ([`FrameHandle`]) from the capture thread
/// to every subscriber; nobody mutates a published frame.
#[derive(Clone)]
pub struct Frame {
    pub cam: CamSide,
    /// Strictly increasing per camera.
    pub frame_index: u64,
    /// Monotonic capture stamp, ns (see [`monotonic_now_ns`]).
    pub t_capture_ns: i64,
    pub width: u32,
    pub height: u32,
    /// Bytes per image row (may exceed `width * bytes_per_pixel`).
    pub stride: u32,
    pub pixfmt: PixFmt,
    pub data: Vec<u8>,
}

impl Frame {
    /// Image row `row` as a byte slice of valid pixels.
    pub fn row(&self, row: u32) -> &[u8] {
        let start = row as usize * self.stride as usize;
        let valid = self.width as usize * self.pixfmt.bytes_per_pixel();
        &self.data[start..start + valid]
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("cam", &self.cam)
            .field("frame_index", &self.frame_index)
            .field("t_capture_ns", &self.t_capture_ns)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("pixfmt", &self.pixfmt)
            .finish_non_exhaustive()
    }
}

pub type FrameHandle = Arc<Frame>;

// --------------------------------------------------------------------
// detections and observations

/// Axis-aligned bounding box in pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bbox {
    pub x: f64,
    pub y: f64,
    pub w: f64,
    pub h: f64,
}

/// Candidate ball in one frame of one camera.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub cam: CamSide,
    pub frame_index: u64,
    /// Centroid, pixel coordinates.
    pub x: f64,
    pub y: f64,
    pub bbox: Option<Bbox>,
    pub confidence: f64,
    /// Copied from the source frame.
    pub t_capture_ns: i64,
}

/// A matched (left, right) detection pair with its triangulated position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StereoObservation {
    /// The later of the two capture stamps.
    pub t_ref_ns: i64,
    pub left: Detection,
    pub right: Detection,
    /// 3D position in the calibration frame, feet.
    pub xyz_ft: [f64; 3],
    /// 1 / (1 + mean reprojection distance in px).
    pub quality: f64,
}

// --------------------------------------------------------------------
// pitch lifecycle

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PitchPhase {
    Inactive,
    RampUp,
    Active,
    Ending,
    Finalized,
}

impl std::fmt::Display for PitchPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let s = match self {
            PitchPhase::Inactive => "INACTIVE",
            PitchPhase::RampUp => "RAMP_UP",
            PitchPhase::Active => "ACTIVE",
            PitchPhase::Ending => "ENDING",
            PitchPhase::Finalized => "FINALIZED",
        };
        f.write_str(s)
    }
}

/// One complete (or in-flight) pitch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PitchData {
    /// 0-based within the session.
    pub pitch_index: u32,
    pub phase: PitchPhase,
    pub start_t_ns: i64,
    pub end_t_ns: Option<i64>,
    pub observations: Vec<StereoObservation>,
    pub analysis: Option<AnalysisRecord>,
}

// --------------------------------------------------------------------
// events

/// A new frame was captured and validated.
#[derive(Debug, Clone)]
pub struct FrameCapturedEvent {
    pub frame: FrameHandle,
}

/// Detection results for one frame of one camera.
///
/// Published in frame_index order per camera, including frames where the
/// detector found nothing (empty `detections`).
#[derive(Debug, Clone)]
pub struct ObservationDetectedEvent {
    pub cam: CamSide,
    pub frame_index: u64,
    pub t_capture_ns: i64,
    pub detections: Vec<Detection>,
}

#[derive(Debug, Clone)]
pub struct PitchStartEvent {
    pub pitch_index: u32,
    pub t_start_ns: i64,
}

#[derive(Debug, Clone)]
pub struct PitchEndEvent {
    pub pitch_index: u32,
    pub t_start_ns: i64,
    pub t_end_ns: i64,
    pub observations: Vec<StereoObservation>,
}

/// A pitch clip (videos + manifest) is complete on disk. Published by
/// the recorder once the post-roll closes; the analysis service updates
/// the manifest in place when it sees this.
#[derive(Debug, Clone)]
pub struct PitchClipClosedEvent {
    pub pitch_index: u32,
    pub manifest_path: std::path::PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// The downstream detection queue was full.
    QueueFull,
    /// A subscriber signalled sustained backpressure.
    SlowConsumer,
}

impl std::fmt::Display for DropReason {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            DropReason::QueueFull => f.write_str("queue full"),
            DropReason::SlowConsumer => f.write_str("slow consumer"),
        }
    }
}

/// Frames were dropped due to backpressure. Throttled to at most one per
/// second per camera.
#[derive(Debug, Clone)]
pub struct FrameDropEvent {
    pub cam: CamSide,
    /// Total drops for this camera since capture start.
    pub dropped_count: u64,
    pub reason: DropReason,
}

// --------------------------------------------------------------------
// errors

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCategory {
    Camera,
    Detection,
    Tracking,
    Recording,
    DiskSpace,
    Shutdown,
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let s = match self {
            ErrorCategory::Camera => "CAMERA",
            ErrorCategory::Detection => "DETECTION",
            ErrorCategory::Tracking => "TRACKING",
            ErrorCategory::Recording => "RECORDING",
            ErrorCategory::DiskSpace => "DISK_SPACE",
            ErrorCategory::Shutdown => "SHUTDOWN",
        };
        f.write_str(s)
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorSeverity {
    Info,
    Warning,
    Error,
    Critical,
}

impl std::fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let s = match self {
            ErrorSeverity::Info => "INFO",
            ErrorSeverity::Warning => "WARNING",
            ErrorSeverity::Error => "ERROR",
            ErrorSeverity::Critical => "CRITICAL",
        };
        f.write_str(s)
    }
}

/// A categorized, severity-tagged error, delivered on the bus like any
/// other event.
#[derive(Debug, Clone)]
pub struct ErrorEvent {
    pub category: ErrorCategory,
    pub severity: ErrorSeverity,
    /// Identifier of the originating component, e.g. `"capture/left"`.
    pub source: String,
    pub message: String,
    pub timestamp_ns: i64,
    pub metadata: BTreeMap<String, String>,
}

impl ErrorEvent {
    pub fn new(
        category: ErrorCategory,
        severity: ErrorSeverity,
        source: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            category,
            severity,
            source: source.into(),
            message: message.into(),
            timestamp_ns: monotonic_now_ns(),
            metadata: BTreeMap::new(),
        }
    }
}
