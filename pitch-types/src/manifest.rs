use serde::{Deserialize, Serialize};

use crate::StereoObservation;

/// Schema tag for session and pitch manifests. Bump on any change to the
/// manifest structs or the on-disk session layout.
pub const MANIFEST_SCHEMA: u16 = 1;

pub const SESSION_MANIFEST_FNAME: &str = "manifest.json";
pub const PITCH_MANIFEST_FNAME: &str = "manifest.json";

/// Directory name for pitch `idx` within a session, e.g. `pitch_003`.
pub fn pitch_dirname(idx: u32) -> String {
    format!("pitch_{:03}", idx)
}

/// Video codec actually used for a recording.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Codec {
    /// H.264 in an MP4 container (in-process software encoder).
    H264,
    /// H.264 in an MP4 container, alternate encoder.
    H264Alt,
    /// Motion-JPEG in an AVI container.
    Mjpeg,
}

impl Codec {
    /// Container file extension.
    pub fn extension(&self) -> &'static str {
        match self {
            Codec::H264 | Codec::H264Alt => "mp4",
            Codec::Mjpeg => "avi",
        }
    }
}

impl std::fmt::Display for Codec {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let s = match self {
            Codec::H264 => "h264",
            Codec::H264Alt => "h264-alt",
            Codec::Mjpeg => "mjpeg",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub w: u32,
    pub h: u32,
}

/// Session-level `manifest.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionManifest {
    pub session_id: String,
    pub created_utc: chrono::DateTime<chrono::Utc>,
    pub app_version: String,
    pub schema_version: u16,
    pub codec: Codec,
    pub fps: f64,
    pub resolution: Resolution,
    pub num_pitches: u32,
}

/// Per-pitch metrics computed by the analysis service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisRecord {
    pub release_speed_mph: f64,
    pub plate_speed_mph: f64,
    /// Horizontal break at the plate, inches.
    pub h_break_in: f64,
    /// Vertical break at the plate, inches.
    pub v_break_in: f64,
    /// RMSE of the constant-acceleration trajectory fit, feet.
    pub rmse_ft: f64,
    /// Fraction of observations with fit residual under the inlier bound.
    pub inlier_ratio: f64,
    pub n_observations: usize,
}

/// Pitch-level `manifest.json`, written when the pitch clip is finalized.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PitchManifest {
    pub session_id: String,
    pub pitch_id: u32,
    pub created_utc: chrono::DateTime<chrono::Utc>,
    pub app_version: String,
    pub schema_version: u16,
    pub codec: Codec,
    pub fps: f64,
    pub resolution: Resolution,
    /// Pre-roll actually honored (limited by ring contents), ms.
    pub pre_roll_ms: u64,
    /// Post-roll actually honored, ms.
    pub post_roll_ms: u64,
    pub observations: Vec<StereoObservation>,
    pub analysis: Option<AnalysisRecord>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pitch_dirname_is_zero_padded() {
        assert_eq!(pitch_dirname(0), "pitch_000");
        assert_eq!(pitch_dirname(42), "pitch_042");
        assert_eq!(pitch_dirname(1000), "pitch_1000");
    }

    #[test]
    fn codec_extensions() {
        assert_eq!(Codec::H264.extension(), "mp4");
        assert_eq!(Codec::Mjpeg.extension(), "avi");
        assert_eq!(serde_json::to_string(&Codec::H264Alt).unwrap(), "\"h264-alt\"");
    }

    #[test]
    fn pitch_manifest_roundtrip_preserves_observation_shape() {
        use crate::{CamSide, Detection, StereoObservation};
        let obs = StereoObservation {
            t_ref_ns: 123,
            left: Detection {
                cam: CamSide::Left,
                frame_index: 7,
                x: 100.0,
                y: 200.0,
                bbox: None,
                confidence: 0.9,
                t_capture_ns: 120,
            },
            right: Detection {
                cam: CamSide::Right,
                frame_index: 7,
                x: 90.0,
                y: 200.0,
                bbox: None,
                confidence: 0.8,
                t_capture_ns: 123,
            },
            xyz_ft: [0.1, 50.0, 5.5],
            quality: 0.95,
        };
        let manifest = PitchManifest {
            session_id: "session_20260801_120000_demo".to_string(),
            pitch_id: 0,
            created_utc: chrono::Utc::now(),
            app_version: crate::app_version().to_string(),
            schema_version: MANIFEST_SCHEMA,
            codec: Codec::Mjpeg,
            fps: 60.0,
            resolution: Resolution { w: 1280, h: 720 },
            pre_roll_ms: 500,
            post_roll_ms: 500,
            observations: vec![obs],
            analysis: None,
        };
        let json = serde_json::to_string_pretty(&manifest).unwrap();
        assert!(json.contains("\"xyz_ft\""));
        assert!(json.contains("\"t_ref_ns\""));
        let back: PitchManifest = serde_json::from_str(&json).unwrap();
        assert_eq!(back.observations.len(), 1);
        assert_eq!(back.observations[0].xyz_ft, [0.1, 50.0, 5.5]);
    }
}
