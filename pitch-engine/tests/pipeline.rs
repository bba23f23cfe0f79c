//! End-to-end pipeline tests over simulated cameras: capture through
//! detection, pairing, the pitch state machine, recording and analysis.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use cam_iface::sim::{SimCameraModule, SimScript};
use pitch_engine::{ControlOutcome, Orchestrator, SignalBridge, UiEvent};
use pitch_record::FreeSpaceProbe;
use pitch_types::{
    CameraConfig, Codec, PitchConfig, PitchManifest, PixFmt, RecordingConfig, SessionManifest,
};
use stereo_mvg::StereoCalibration;

struct PlentyOfSpace;

impl FreeSpaceProbe for PlentyOfSpace {
    fn free_bytes(&self, _path: &Path) -> std::io::Result<u64> {
        Ok(200_000_000_000)
    }
}

const FPS: f64 = 60.0;
const W: u32 = 64;
const H: u32 = 48;

fn rig() -> Arc<StereoCalibration> {
    Arc::new(StereoCalibration::simple_rig(60.0, 32.0, 24.0, 2.0, 4.0))
}

fn test_config(output_dir: &Path) -> PitchConfig {
    PitchConfig {
        camera: CameraConfig {
            fps: FPS,
            width: W,
            height: H,
            pixfmt: PixFmt::Mono8,
            color_mode: false,
        },
        recording: RecordingConfig {
            output_dir: output_dir.to_path_buf(),
            codec_preference: vec![Codec::Mjpeg],
            ..RecordingConfig::default()
        },
        ..PitchConfig::default()
    }
}

/// Scripted cameras showing one pitch: the ball appears at frame 30 and
/// flies from y = 45 ft toward the plate at 1 ft/frame (60 ft/s) for 36
/// frames, then disappears.
fn pitch_cameras(cal: &StereoCalibration) -> SimCameraModule {
    let mut left = BTreeMap::new();
    let mut right = BTreeMap::new();
    for k in 0..36u64 {
        let world = [0.0, 45.0 - k as f64, 4.0];
        let frame = 30 + k;
        left.insert(frame, cal.left.project(&world).unwrap());
        right.insert(frame, cal.right.project(&world).unwrap());
    }
    let script = SimScript::default()
        .size(W, H)
        .fps(FPS)
        .realtime(true)
        .blob_explicit(BTreeMap::new());
    SimCameraModule::new()
        .with_camera("left", script.clone().blob_explicit(left))
        .with_camera("right", script.blob_explicit(right))
}

#[test]
fn clean_pitch_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let cal = rig();
    let engine = Orchestrator::with_parts(
        test_config(dir.path()),
        cal.clone(),
        Arc::new(ball_detect::CentroidDetector::default()),
        Arc::new(PlentyOfSpace),
    );
    let bridge = SignalBridge::new(engine.bus());

    let module = pitch_cameras(&cal);
    assert_eq!(
        engine.start_capture(module, "left", "right").unwrap(),
        ControlOutcome::Done
    );
    let session_dir = engine.start_recording("e2e").unwrap();

    // Ball flight starts 500 ms in and lasts 600 ms; the pitch finalizes
    // after the 300 ms observation gap plus 500 ms post-roll.
    let mut starts = Vec::new();
    let mut ends = Vec::new();
    let deadline = Instant::now() + Duration::from_secs(8);
    while Instant::now() < deadline {
        for ev in bridge.try_iter() {
            match ev {
                UiEvent::PitchStart(s) => starts.push(s),
                UiEvent::PitchEnd(e) => ends.push(e),
                _ => {}
            }
        }
        if !ends.is_empty() {
            break;
        }
        std::thread::sleep(Duration::from_millis(50));
    }

    assert_eq!(starts.len(), 1, "expected exactly one pitch start");
    assert_eq!(starts[0].pitch_index, 0);
    assert_eq!(ends.len(), 1, "expected exactly one pitch end");
    assert_eq!(ends[0].pitch_index, 0);
    assert!(
        ends[0].observations.len() >= 10,
        "too few observations: {}",
        ends[0].observations.len()
    );
    // Triangulated positions follow the scripted flight path.
    let first = &ends[0].observations[0];
    let last = ends[0].observations.last().unwrap();
    assert!(first.xyz_ft[1] > last.xyz_ft[1]);
    assert!(first.xyz_ft[1] <= 45.5);

    // Give the recorder time to close the post-roll and the analysis
    // service time to annotate the manifest.
    let pitch_manifest_path = session_dir.join("pitch_000").join("manifest.json");
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        let annotated = pitch_manifest_path.is_file()
            && std::fs::File::open(&pitch_manifest_path)
                .ok()
                .and_then(|f| serde_json::from_reader::<_, PitchManifest>(f).ok())
                .is_some_and(|m| m.analysis.is_some());
        if annotated {
            break;
        }
        std::thread::sleep(Duration::from_millis(50));
    }

    let summary = engine.stop_recording().unwrap();
    engine.stop_capture().unwrap();
    assert!(!engine.is_capturing());

    assert_eq!(summary.pitch_count, 1);
    assert!(summary.frames_written > 50);
    assert!(session_dir.join("session_left.avi").is_file());
    assert!(session_dir.join("session_right.avi").is_file());
    assert!(session_dir.join("pitch_000").join("left.avi").is_file());
    assert!(session_dir.join("pitch_000").join("right.avi").is_file());

    let manifest: PitchManifest =
        serde_json_from(&pitch_manifest_path);
    assert_eq!(manifest.pitch_id, 0);
    assert_eq!(manifest.codec, Codec::Mjpeg);
    assert_eq!(manifest.observations.len(), ends[0].observations.len());
    let analysis = manifest.analysis.expect("analysis written into manifest");
    // 60 ft/s is about 41 mph.
    assert!(
        (35.0..50.0).contains(&analysis.release_speed_mph),
        "speed {} mph out of range",
        analysis.release_speed_mph
    );

    let session_manifest: SessionManifest =
        serde_json_from(&session_dir.join("manifest.json"));
    assert_eq!(session_manifest.num_pitches, 1);

    let recent = engine.get_recent_pitches();
    assert_eq!(recent.len(), 1);
    assert_eq!(recent[0].pitch_index, 0);

    let stats = engine.get_stats();
    assert!(stats.left.frames > 50);
    assert!(stats.right.frames > 50);
}

fn serde_json_from<T: serde::de::DeserializeOwned>(path: &Path) -> T {
    serde_json::from_reader(std::fs::File::open(path).unwrap()).unwrap()
}

#[test]
fn control_surface_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let cal = rig();
    let engine = Orchestrator::with_parts(
        test_config(dir.path()),
        cal.clone(),
        Arc::new(ball_detect::CentroidDetector::default()),
        Arc::new(PlentyOfSpace),
    );

    // Recording requires capture.
    assert!(matches!(
        engine.start_recording("early"),
        Err(pitch_engine::Error::NotCapturing)
    ));

    let script = SimScript::default().size(W, H).fps(FPS).realtime(true);
    let module = SimCameraModule::new()
        .with_camera("left", script.clone())
        .with_camera("right", script.clone());
    assert_eq!(
        engine.start_capture(module, "left", "right").unwrap(),
        ControlOutcome::Done
    );
    // A second start is a warning, not an error, and changes nothing.
    let module2 = SimCameraModule::new()
        .with_camera("left", script.clone())
        .with_camera("right", script);
    assert!(matches!(
        engine.start_capture(module2, "left", "right").unwrap(),
        ControlOutcome::Warning(_)
    ));
    assert!(engine.is_capturing());

    std::thread::sleep(Duration::from_millis(100));
    let (left, right) = engine.get_preview_frames();
    assert!(left.is_some() && right.is_some());

    // Calibration is locked while capturing.
    assert!(matches!(
        engine.set_calibration(rig()),
        Err(pitch_engine::Error::CalibrationLocked)
    ));

    assert_eq!(engine.stop_capture().unwrap(), ControlOutcome::Done);
    assert!(matches!(
        engine.stop_capture().unwrap(),
        ControlOutcome::Warning(_)
    ));
    assert!(!engine.is_capturing());
    // After stopping, a new calibration is accepted.
    engine.set_calibration(rig()).unwrap();
}

#[test]
fn capture_then_stop_leaves_no_session_files() {
    let dir = tempfile::tempdir().unwrap();
    let cal = rig();
    let engine = Orchestrator::with_parts(
        test_config(dir.path()),
        cal,
        Arc::new(ball_detect::CentroidDetector::default()),
        Arc::new(PlentyOfSpace),
    );
    let script = SimScript::default().size(W, H).fps(FPS).realtime(true);
    let module = SimCameraModule::new()
        .with_camera("left", script.clone())
        .with_camera("right", script);
    engine.start_capture(module, "left", "right").unwrap();
    std::thread::sleep(Duration::from_millis(100));
    engine.stop_capture().unwrap();
    // Capture without recording writes nothing to the output directory.
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}
