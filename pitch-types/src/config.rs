use serde::{Deserialize, Serialize};

use crate::manifest::Codec;
use crate::PixFmt;

fn default_fps() -> f64 {
    60.0
}
fn default_width() -> u32 {
    1280
}
fn default_height() -> u32 {
    720
}
fn default_pixfmt() -> PixFmt {
    PixFmt::Mono8
}
fn default_false() -> bool {
    false
}

/// Camera acquisition settings, applied to both cameras.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CameraConfig {
    #[serde(default = "default_fps")]
    pub fps: f64,
    #[serde(default = "default_width")]
    pub width: u32,
    #[serde(default = "default_height")]
    pub height: u32,
    #[serde(default = "default_pixfmt")]
    pub pixfmt: PixFmt,
    #[serde(default = "default_false")]
    pub color_mode: bool,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            fps: default_fps(),
            width: default_width(),
            height: default_height(),
            pixfmt: default_pixfmt(),
            color_mode: default_false(),
        }
    }
}

fn default_queue_depth() -> usize {
    6
}
fn default_workers_per_camera() -> usize {
    1
}
fn default_drain_timeout_ms() -> u64 {
    1000
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DetectionConfig {
    /// Bounded queue depth per camera.
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,
    /// Workers per camera. More than one enables the reorder stage.
    #[serde(default = "default_workers_per_camera")]
    pub workers_per_camera: usize,
    /// How long `stop` waits for queued frames to drain.
    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            queue_depth: default_queue_depth(),
            workers_per_camera: default_workers_per_camera(),
            drain_timeout_ms: default_drain_timeout_ms(),
        }
    }
}

fn default_pairing_window_ms() -> f64 {
    10.0
}
fn default_max_reproj_err_px() -> f64 {
    4.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PairingConfig {
    /// Maximum |t_left - t_right| for a stereo pair, milliseconds.
    #[serde(default = "default_pairing_window_ms")]
    pub window_ms: f64,
    /// Epipolar consistency gate: pairs with mean reprojection error above
    /// this are rejected.
    #[serde(default = "default_max_reproj_err_px")]
    pub max_reproj_err_px: f64,
}

impl Default for PairingConfig {
    fn default() -> Self {
        Self {
            window_ms: default_pairing_window_ms(),
            max_reproj_err_px: default_max_reproj_err_px(),
        }
    }
}

fn default_min_observations_to_confirm() -> usize {
    3
}
fn default_ramp_up_timeout_ms() -> u64 {
    500
}
fn default_active_gap_ms() -> u64 {
    300
}
fn default_post_roll_observations() -> usize {
    5
}
fn default_post_roll_ms() -> u64 {
    500
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StateMachineConfig {
    /// Consecutive consistent observations required for RAMP_UP -> ACTIVE.
    #[serde(default = "default_min_observations_to_confirm")]
    pub min_observations_to_confirm: usize,
    /// RAMP_UP falls back to INACTIVE after this long without a consistent
    /// observation.
    #[serde(default = "default_ramp_up_timeout_ms")]
    pub ramp_up_timeout_ms: u64,
    /// ACTIVE -> ENDING when no observation arrives for this long.
    #[serde(default = "default_active_gap_ms")]
    pub active_gap_ms: u64,
    /// ENDING collects up to this many additional observations.
    #[serde(default = "default_post_roll_observations")]
    pub post_roll_observations: usize,
    /// ENDING -> FINALIZED at the latest after this long.
    #[serde(default = "default_post_roll_ms")]
    pub post_roll_ms: u64,
}

impl Default for StateMachineConfig {
    fn default() -> Self {
        Self {
            min_observations_to_confirm: default_min_observations_to_confirm(),
            ramp_up_timeout_ms: default_ramp_up_timeout_ms(),
            active_gap_ms: default_active_gap_ms(),
            post_roll_observations: default_post_roll_observations(),
            post_roll_ms: default_post_roll_ms(),
        }
    }
}

/// Spatial gate for pitch-start candidates, calibration frame, feet.
///
/// The plate sits near y = 0 with y increasing toward the mound.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GatingVolume {
    pub x_min: f64,
    pub x_max: f64,
    pub y_min: f64,
    pub y_max: f64,
    pub z_min: f64,
    pub z_max: f64,
}

impl GatingVolume {
    pub fn contains(&self, p: &[f64; 3]) -> bool {
        p[0] >= self.x_min
            && p[0] <= self.x_max
            && p[1] >= self.y_min
            && p[1] <= self.y_max
            && p[2] >= self.z_min
            && p[2] <= self.z_max
    }
}

impl Default for GatingVolume {
    fn default() -> Self {
        Self {
            x_min: -8.0,
            x_max: 8.0,
            y_min: 2.0,
            y_max: 60.0,
            z_min: 0.0,
            z_max: 12.0,
        }
    }
}

fn default_min_start_speed_fps() -> f64 {
    40.0
}
fn default_min_speed_floor_fps() -> f64 {
    20.0
}
fn default_max_fit_residual_ft() -> f64 {
    1.5
}
fn default_plate_y_ft() -> f64 {
    1.4
}
fn default_gate() -> GatingVolume {
    GatingVolume::default()
}

/// Empirically tuned thresholds for the pitch-start predicate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TrackingParams {
    /// Minimum speed estimate between consecutive observations for a
    /// start candidate, ft/s.
    #[serde(default = "default_min_start_speed_fps")]
    pub min_start_speed_fps: f64,
    /// ACTIVE exits to ENDING when the speed estimate collapses below
    /// this floor, ft/s.
    #[serde(default = "default_min_speed_floor_fps")]
    pub min_speed_floor_fps: f64,
    /// Maximum straight-line fit residual for RAMP_UP consistency, ft.
    #[serde(default = "default_max_fit_residual_ft")]
    pub max_fit_residual_ft: f64,
    /// Front plane of home plate; an observation past it ends the pitch.
    #[serde(default = "default_plate_y_ft")]
    pub plate_y_ft: f64,
    #[serde(default = "default_gate")]
    pub gate: GatingVolume,
}

impl Default for TrackingParams {
    fn default() -> Self {
        Self {
            min_start_speed_fps: default_min_start_speed_fps(),
            min_speed_floor_fps: default_min_speed_floor_fps(),
            max_fit_residual_ft: default_max_fit_residual_ft(),
            plate_y_ft: default_plate_y_ft(),
            gate: default_gate(),
        }
    }
}

fn default_output_dir() -> std::path::PathBuf {
    std::path::PathBuf::from("sessions")
}
fn default_pre_roll_ms() -> u64 {
    500
}
pub fn default_codec_preference() -> Vec<Codec> {
    vec![Codec::H264, Codec::H264Alt, Codec::Mjpeg]
}
fn default_disk_warning_gb() -> f64 {
    50.0
}
fn default_disk_elevated_gb() -> f64 {
    20.0
}
fn default_disk_critical_gb() -> f64 {
    5.0
}
fn default_disk_poll_seconds() -> u64 {
    5
}
fn default_write_failure_threshold() -> u32 {
    5
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RecordingConfig {
    /// Base directory for session directories.
    #[serde(default = "default_output_dir")]
    pub output_dir: std::path::PathBuf,
    #[serde(default = "default_pre_roll_ms")]
    pub pre_roll_ms: u64,
    #[serde(default = "default_post_roll_ms")]
    pub post_roll_ms: u64,
    /// Ordered codec fallback chain.
    #[serde(default = "default_codec_preference")]
    pub codec_preference: Vec<Codec>,
    #[serde(default = "default_disk_warning_gb")]
    pub disk_warning_gb: f64,
    #[serde(default = "default_disk_elevated_gb")]
    pub disk_elevated_gb: f64,
    #[serde(default = "default_disk_critical_gb")]
    pub disk_critical_gb: f64,
    #[serde(default = "default_disk_poll_seconds")]
    pub disk_poll_seconds: u64,
    /// Consecutive write failures per camera before recording auto-stops.
    #[serde(default = "default_write_failure_threshold")]
    pub write_failure_threshold: u32,
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            pre_roll_ms: default_pre_roll_ms(),
            post_roll_ms: default_post_roll_ms(),
            codec_preference: default_codec_preference(),
            disk_warning_gb: default_disk_warning_gb(),
            disk_elevated_gb: default_disk_elevated_gb(),
            disk_critical_gb: default_disk_critical_gb(),
            disk_poll_seconds: default_disk_poll_seconds(),
            write_failure_threshold: default_write_failure_threshold(),
        }
    }
}

/// The full configuration tree.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PitchConfig {
    #[serde(default)]
    pub camera: CameraConfig,
    #[serde(default)]
    pub detection: DetectionConfig,
    #[serde(default)]
    pub pairing: PairingConfig,
    #[serde(default)]
    pub state_machine: StateMachineConfig,
    #[serde(default)]
    pub tracking: TrackingParams,
    #[serde(default)]
    pub recording: RecordingConfig,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = PitchConfig::default();
        assert_eq!(cfg.detection.queue_depth, 6);
        assert_eq!(cfg.detection.workers_per_camera, 1);
        assert_eq!(cfg.pairing.window_ms, 10.0);
        assert_eq!(cfg.state_machine.min_observations_to_confirm, 3);
        assert_eq!(cfg.state_machine.ramp_up_timeout_ms, 500);
        assert_eq!(cfg.state_machine.active_gap_ms, 300);
        assert_eq!(cfg.recording.pre_roll_ms, 500);
        assert_eq!(cfg.recording.post_roll_ms, 500);
        assert_eq!(cfg.recording.disk_critical_gb, 5.0);
        assert_eq!(
            cfg.recording.codec_preference,
            vec![Codec::H264, Codec::H264Alt, Codec::Mjpeg]
        );
    }

    #[test]
    fn gating_volume_contains() {
        let gate = GatingVolume::default();
        assert!(gate.contains(&[0.0, 50.0, 6.0]));
        assert!(!gate.contains(&[0.0, 0.5, 6.0]));
        assert!(!gate.contains(&[9.0, 50.0, 6.0]));
    }

    #[test]
    fn empty_config_deserializes_to_defaults() {
        let cfg: PitchConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg, PitchConfig::default());
    }
}
