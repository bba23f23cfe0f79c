//! CLI host for the pitch tracking engine.
//!
//! Runs the full pipeline against the simulated camera backend (the
//! only in-tree driver): a scripted ball flight exercises capture,
//! detection, stereo tracking, recording and analysis end to end.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};

use cam_iface::sim::{SimCameraModule, SimScript};
use pitch_config_data::{parse_config_file, PitchTrackConfig};
use pitch_engine::{Orchestrator, SignalBridge, UiEvent};
use stereo_mvg::StereoCalibration;

#[derive(Debug, Parser)]
#[command(author, version, about)]
enum Cli {
    /// Run a capture + recording session from a config file.
    Run {
        /// Configuration file (TOML).
        config_file: std::path::PathBuf,
        /// Session name used in the output directory.
        #[arg(long, default_value = "demo")]
        session: String,
        /// How long to run before stopping.
        #[arg(long, default_value_t = 10)]
        duration_secs: u64,
    },
    /// Print a default configuration file and exit.
    DefaultConfig,
}

fn init_logging() {
    use tracing_subscriber::layer::SubscriberExt;
    let collector = tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::filter::EnvFilter::from_default_env());
    if tracing::subscriber::set_global_default(collector).is_err() {
        eprintln!("logging already initialized");
    }
}

fn load_calibration(cfg: &PitchTrackConfig) -> Result<Arc<StereoCalibration>> {
    match &cfg.rig.calibration {
        Some(path) => {
            let cal = StereoCalibration::from_json_file(path)
                .with_context(|| format!("loading calibration {}", path.display()))?;
            info!("calibration loaded from {}", path.display());
            Ok(Arc::new(cal))
        }
        None => {
            warn!("no calibration configured; using the built-in simulated rig");
            Ok(Arc::new(StereoCalibration::simple_rig(
                cfg.camera.width as f64 / 2.0,
                cfg.camera.width as f64 / 2.0,
                cfg.camera.height as f64 / 2.0,
                2.0,
                4.0,
            )))
        }
    }
}

/// Scripted cameras showing one ball flight per `repeat_every` frames.
fn demo_cameras(cfg: &PitchTrackConfig, cal: &StereoCalibration) -> SimCameraModule {
    let mut left = BTreeMap::new();
    let mut right = BTreeMap::new();
    let flight_frames = 36u64;
    let repeat_every = (cfg.camera.fps * 3.0) as u64;
    for rep in 0..20 {
        let first = rep * repeat_every + (cfg.camera.fps as u64 / 2);
        for k in 0..flight_frames {
            let world = [0.0, 45.0 - k as f64, 4.0];
            let (Ok(l), Ok(r)) = (cal.left.project(&world), cal.right.project(&world)) else {
                continue;
            };
            left.insert(first + k, l);
            right.insert(first + k, r);
        }
    }
    let base = SimScript::default()
        .size(cfg.camera.width, cfg.camera.height)
        .fps(cfg.camera.fps)
        .pixfmt(cfg.camera.pixfmt)
        .realtime(true);
    SimCameraModule::new()
        .with_camera(&cfg.rig.left_camera, base.clone().blob_explicit(left))
        .with_camera(&cfg.rig.right_camera, base.blob_explicit(right))
}

fn run(config_file: &std::path::Path, session: &str, duration_secs: u64) -> Result<()> {
    let cfg = parse_config_file(config_file)
        .with_context(|| format!("parsing {}", config_file.display()))?;
    let cal = load_calibration(&cfg)?;
    let module = demo_cameras(&cfg, &cal);

    let engine = Orchestrator::new(cfg.pipeline(), cal);
    let bridge = SignalBridge::new(engine.bus());

    engine.start_capture(module, &cfg.rig.left_camera, &cfg.rig.right_camera)?;
    let session_dir = engine.start_recording(session)?;
    info!("recording to {}", session_dir.display());

    let deadline = Instant::now() + Duration::from_secs(duration_secs);
    while Instant::now() < deadline {
        for ev in bridge.try_iter() {
            match ev {
                UiEvent::PitchStart(s) => info!("pitch {} started", s.pitch_index),
                UiEvent::PitchEnd(e) => info!(
                    "pitch {} ended with {} observations",
                    e.pitch_index,
                    e.observations.len()
                ),
                UiEvent::FrameDrop(d) => {
                    warn!("{}: {} frames dropped ({})", d.cam, d.dropped_count, d.reason)
                }
                UiEvent::Error(e) if e.severity >= pitch_types::ErrorSeverity::Warning => {
                    warn!("[{}/{}] {}: {}", e.category, e.severity, e.source, e.message)
                }
                _ => {}
            }
        }
        std::thread::sleep(Duration::from_millis(50));
    }

    let summary = engine.stop_recording()?;
    engine.stop_capture()?;

    let stats = engine.get_stats();
    info!(
        "session {}: {} pitches, {} frames written ({} codec)",
        summary.session_id, summary.pitch_count, summary.frames_written, summary.codec
    );
    info!(
        "capture: left {} frames ({} drops), right {} frames ({} drops)",
        stats.left.frames, stats.left.capture_drops, stats.right.frames, stats.right.capture_drops
    );
    Ok(())
}

fn main() -> Result<()> {
    init_logging();
    match Cli::parse() {
        Cli::Run {
            config_file,
            session,
            duration_secs,
        } => run(&config_file, &session, duration_secs),
        Cli::DefaultConfig => {
            print!("{}", pitch_config_data::default_config_toml()?);
            Ok(())
        }
    }
}
