//! TOML configuration file for the pitch tracker.
//!
//! Relative paths in the file are interpreted relative to the config
//! file location; `~` and `$VAR` are expanded.

use serde::{Deserialize, Serialize};

use pitch_types::{
    CameraConfig, DetectionConfig, PairingConfig, PitchConfig, RecordingConfig,
    StateMachineConfig, TrackingParams,
};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("lookup error on variable: {source}")]
    ShellExpandLookupVarError {
        #[from]
        source: shellexpand::LookupError<std::env::VarError>,
    },
    #[error("IO error: {source}")]
    IoError {
        #[from]
        source: std::io::Error,
    },
    #[error("TOML deserialization error: {source}")]
    TomlDeError {
        #[from]
        source: toml::de::Error,
    },
    #[error("TOML serialization error: {source}")]
    TomlSerError {
        #[from]
        source: toml::ser::Error,
    },
}

fn default_left_camera() -> String {
    "left".to_string()
}

fn default_right_camera() -> String {
    "right".to_string()
}

/// The stereo rig: calibration file and camera identifiers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RigConfig {
    /// Stereo calibration JSON. Can contain shell variables such as
    /// `~`, `$A`, or `${B}`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub calibration: Option<std::path::PathBuf>,
    #[serde(default = "default_left_camera")]
    pub left_camera: String,
    #[serde(default = "default_right_camera")]
    pub right_camera: String,
}

impl Default for RigConfig {
    fn default() -> Self {
        Self {
            calibration: None,
            left_camera: default_left_camera(),
            right_camera: default_right_camera(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PitchTrackConfig {
    #[serde(default)]
    pub rig: RigConfig,
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

impl PitchTrackConfig {
    /// The pipeline subset handed to the orchestrator.
    pub fn pipeline(&self) -> PitchConfig {
        PitchConfig {
            camera: self.camera.clone(),
            detection: self.detection.clone(),
            pairing: self.pairing.clone(),
            state_machine: self.state_machine.clone(),
            tracking: self.tracking.clone(),
            recording: self.recording.clone(),
        }
    }

    /// For all paths which are relative, make them relative to the
    /// config file location.
    fn fixup_relative_paths(&mut self, orig_path: &std::path::Path) -> Result<()> {
        let dirname = orig_path
            .parent()
            .unwrap_or_else(|| std::path::Path::new("."));
        if let Some(cal) = self.rig.calibration.as_mut() {
            fixup_relative_path(cal, dirname)?;
        }
        fixup_relative_path(&mut self.recording.output_dir, dirname)?;
        Ok(())
    }
}

/// If `path` is relative, make it relative to `dirname`.
///
/// `path` must be utf-8 encoded and can start with a tilde, which is
/// expanded to the home directory.
fn fixup_relative_path(path: &mut std::path::PathBuf, dirname: &std::path::Path) -> Result<()> {
    let pathstr = path.to_str().expect("config path is valid utf-8");
    let expanded = shellexpand::full(pathstr)?;
    *path = std::path::PathBuf::from(expanded.to_string());
    if path.is_relative() {
        *path = dirname.join(&path);
    }
    Ok(())
}

pub fn parse_config_file<P: AsRef<std::path::Path>>(fname: P) -> Result<PitchTrackConfig> {
    let contents = std::fs::read_to_string(fname.as_ref())?;
    let mut cfg: PitchTrackConfig = toml::from_str(&contents)?;
    cfg.fixup_relative_paths(fname.as_ref())?;
    Ok(cfg)
}

/// A default configuration file, for `pitch-run default-config`.
pub fn default_config_toml() -> Result<String> {
    Ok(toml::to_string_pretty(&PitchTrackConfig::default())?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_file_parses_with_defaults() {
        let cfg: PitchTrackConfig = toml::from_str("").unwrap();
        assert_eq!(cfg.rig.left_camera, "left");
        assert_eq!(cfg.camera.fps, 60.0);
        assert_eq!(cfg.detection.queue_depth, 6);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let r: std::result::Result<PitchTrackConfig, _> =
            toml::from_str("[rig]\nleft_camera = \"a\"\nrecieve_buffer = 3\n");
        assert!(r.is_err());
    }

    #[test]
    fn relative_paths_resolve_against_config_dir() {
        let dir = tempfile::tempdir().unwrap();
        let cfg_path = dir.path().join("pitchtrack.toml");
        std::fs::write(
            &cfg_path,
            "[rig]\ncalibration = \"cal.json\"\n[recording]\noutput_dir = \"sessions\"\n",
        )
        .unwrap();
        let cfg = parse_config_file(&cfg_path).unwrap();
        assert_eq!(cfg.rig.calibration.unwrap(), dir.path().join("cal.json"));
        assert_eq!(cfg.recording.output_dir, dir.path().join("sessions"));
    }

    #[test]
    fn absolute_paths_are_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let cfg_path = dir.path().join("pitchtrack.toml");
        std::fs::write(
            &cfg_path,
            "[recording]\noutput_dir = \"/data/sessions\"\n",
        )
        .unwrap();
        let cfg = parse_config_file(&cfg_path).unwrap();
        assert_eq!(
            cfg.recording.output_dir,
            std::path::PathBuf::from("/data/sessions")
        );
    }

    #[test]
    fn default_config_roundtrips() {
        let text = default_config_toml().unwrap();
        let back: PitchTrackConfig = toml::from_str(&text).unwrap();
        assert_eq!(back, PitchTrackConfig::default());
    }
}
