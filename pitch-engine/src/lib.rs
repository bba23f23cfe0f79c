//! The orchestrator: owns the bus and every service, hosts the stereo
//! pairer and pitch state machine, and exposes the public control
//! surface. One coarse state lock serializes the public operations;
//! the per-event hot path goes through the services' own locks.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tracing::{info, warn};

use ball_detect::{CentroidDetector, DetectionService, Detector};
use cam_iface::CameraModule;
use eventbus::{ErrorBus, EventBus, Flow, SubscriptionId};
use pitch_capture::CaptureService;
use pitch_record::{FreeSpaceProbe, RecordingService, SessionSummary, StatvfsProbe};
use pitch_tracking::TrackerCore;
use pitch_types::{
    CamSide, ErrorCategory, ErrorSeverity, FrameCapturedEvent, FrameHandle,
    ObservationDetectedEvent, PitchConfig, PitchData, PitchEndEvent, PitchPhase, Resolution,
};
use stereo_mvg::StereoCalibration;

mod bridge;

pub use bridge::{SignalBridge, UiEvent};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("capture error: {source}")]
    Capture {
        #[from]
        source: pitch_capture::Error,
    },
    #[error("recording error: {source}")]
    Recording {
        #[from]
        source: pitch_record::Error,
    },
    #[error("cannot start recording: capture is not running")]
    NotCapturing,
    #[error("calibration cannot change while capturing; stop capture first")]
    CalibrationLocked,
}

/// Result of an idempotent control operation: either it acted, or it
/// explains why it was a no-op.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlOutcome {
    Done,
    /// Non-fatal: nothing changed.
    Warning(String),
}

/// Finished pitches retained for `get_recent_pitches`.
const RECENT_PITCHES: usize = 32;

/// Per-camera counters exposed by `get_stats`.
#[derive(Debug, Clone, Copy, Default)]
pub struct CameraStats {
    pub frames: u64,
    pub capture_drops: u64,
    pub read_errors: u64,
    pub reconnects: u64,
    pub detections_processed: u64,
    pub detection_drops: u64,
    pub detection_failures: u64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct EngineStats {
    pub left: CameraStats,
    pub right: CameraStats,
    pub capturing: bool,
    pub recording: bool,
    pub pitch_phase: Option<PitchPhase>,
    pub pitch_count: u32,
}

struct TrackerWiring {
    core: Arc<Mutex<TrackerCore>>,
    subs: Vec<SubscriptionId>,
}

struct EngineState {
    capture: CaptureService,
    detection: DetectionService,
    tracker: Option<TrackerWiring>,
    capturing: bool,
}

pub struct Orchestrator {
    bus: EventBus,
    error_bus: ErrorBus,
    config: PitchConfig,
    calibration: Mutex<Arc<StereoCalibration>>,
    detector: Arc<dyn Detector>,
    state: Mutex<EngineState>,
    recording: RecordingService,
    _analysis: pitch_analysis::AnalysisService,
    recent: Arc<Mutex<VecDeque<PitchData>>>,
    recent_sub: SubscriptionId,
}

impl Orchestrator {
    pub fn new(config: PitchConfig, calibration: Arc<StereoCalibration>) -> Self {
        Self::with_parts(
            config,
            calibration,
            Arc::new(CentroidDetector::default()),
            Arc::new(StatvfsProbe),
        )
    }

    /// Construct with an injected detector and free-space probe.
    pub fn with_parts(
        config: PitchConfig,
        calibration: Arc<StereoCalibration>,
        detector: Arc<dyn Detector>,
        probe: Arc<dyn FreeSpaceProbe>,
    ) -> Self {
        let bus = EventBus::new();
        let error_bus = bus.error_bus();
        let capture = CaptureService::new(bus.clone());
        let detection = DetectionService::new(bus.clone());
        let recording =
            RecordingService::with_probe(bus.clone(), config.recording.clone(), probe);
        recording.set_auto_stop_callback(Arc::new(|| {
            warn!("recording auto-stopped");
        }));
        let analysis = pitch_analysis::AnalysisService::new(bus.clone());

        let recent = Arc::new(Mutex::new(VecDeque::with_capacity(RECENT_PITCHES)));
        let recent_sub = {
            let recent = recent.clone();
            bus.subscribe_infallible::<PitchEndEvent, _>(
                "engine/recent-pitches",
                ErrorCategory::Tracking,
                move |ev| {
                    let mut guard = recent.lock().unwrap();
                    if guard.len() == RECENT_PITCHES {
                        guard.pop_front();
                    }
                    guard.push_back(PitchData {
                        pitch_index: ev.pitch_index,
                        phase: PitchPhase::Finalized,
                        start_t_ns: ev.t_start_ns,
                        end_t_ns: Some(ev.t_end_ns),
                        observations: ev.observations.clone(),
                        analysis: None,
                    });
                },
            )
        };

        Self {
            bus: bus.clone(),
            error_bus,
            config,
            calibration: Mutex::new(calibration),
            detector,
            state: Mutex::new(EngineState {
                capture,
                detection,
                tracker: None,
                capturing: false,
            }),
            recording,
            _analysis: analysis,
            recent,
            recent_sub,
        }
    }

    /// The bus, for additional subscribers (UI bridge, tests).
    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Start the capture half of the pipeline: wire the tracker, start
    /// the detection pool, then the cameras. Calling while already
    /// capturing is a warning no-op.
    pub fn start_capture<M>(
        &self,
        module: M,
        left_id: &str,
        right_id: &str,
    ) -> Result<ControlOutcome>
    where
        M: CameraModule + Send + 'static,
        M::CameraType: 'static,
    {
        let mut state = self.state.lock().unwrap();
        if state.capturing {
            return Ok(ControlOutcome::Warning(
                "capture already running".to_string(),
            ));
        }

        // Subscribers first: frames must have somewhere to go before the
        // grab threads start publishing.
        let calibration = self.calibration.lock().unwrap().clone();
        let core = Arc::new(Mutex::new(TrackerCore::new(
            self.bus.clone(),
            calibration,
            &self.config.pairing,
            &self.config.state_machine,
            &self.config.tracking,
        )));
        let mut subs = Vec::new();
        {
            let core = core.clone();
            subs.push(self.bus.subscribe_infallible::<ObservationDetectedEvent, _>(
                "tracker/observations",
                ErrorCategory::Tracking,
                move |ev| {
                    core.lock().unwrap().handle_detections(ev);
                },
            ));
        }
        {
            let core = core.clone();
            subs.push(self.bus.subscribe::<FrameCapturedEvent, _>(
                "tracker/tick",
                ErrorCategory::Tracking,
                move |ev| {
                    core.lock().unwrap().tick(ev.frame.t_capture_ns);
                    Ok(Flow::Handled)
                },
            ));
        }
        state.tracker = Some(TrackerWiring { core, subs });

        state
            .detection
            .start(&self.config.detection, self.detector.clone());

        if let Err(e) = state
            .capture
            .start(&self.config.camera, module, left_id, right_id)
        {
            // Roll back so a later attempt starts clean.
            state.detection.stop();
            if let Some(w) = state.tracker.take() {
                for sub in w.subs {
                    self.bus.unsubscribe(sub);
                }
            }
            return Err(e.into());
        }
        state.capturing = true;
        info!("pipeline capturing");
        Ok(ControlOutcome::Done)
    }

    /// Stop capture in reverse order. Resources are released even when
    /// individual services report errors.
    pub fn stop_capture(&self) -> Result<ControlOutcome> {
        let mut state = self.state.lock().unwrap();
        if !state.capturing {
            return Ok(ControlOutcome::Warning("capture not running".to_string()));
        }
        if let Err(e) = state.capture.stop() {
            self.error_bus.report(
                ErrorCategory::Shutdown,
                ErrorSeverity::Error,
                "engine",
                format!("capture stop: {e}"),
            );
        }
        state.detection.stop();
        if let Some(w) = state.tracker.take() {
            for sub in w.subs {
                self.bus.unsubscribe(sub);
            }
        }
        state.capturing = false;
        info!("pipeline stopped");
        Ok(ControlOutcome::Done)
    }

    pub fn is_capturing(&self) -> bool {
        self.state.lock().unwrap().capturing
    }

    /// Start a recording session. Requires capture to be running.
    pub fn start_recording(&self, session_name: &str) -> Result<std::path::PathBuf> {
        if !self.is_capturing() {
            return Err(Error::NotCapturing);
        }
        let resolution = Resolution {
            w: self.config.camera.width,
            h: self.config.camera.height,
        };
        Ok(self
            .recording
            .start_recording(session_name, self.config.camera.fps, resolution)?)
    }

    pub fn stop_recording(&self) -> Result<SessionSummary> {
        Ok(self.recording.stop_recording()?)
    }

    pub fn is_recording(&self) -> bool {
        self.recording.is_recording()
    }

    pub fn set_record_directory(&self, dir: std::path::PathBuf) {
        self.recording.set_output_dir(dir);
    }

    /// Calibration is read-only once capture starts. Attempting to swap
    /// it mid-session aborts any in-flight pitch (no PitchEndEvent) and
    /// is rejected; stop capture first.
    pub fn set_calibration(&self, calibration: Arc<StereoCalibration>) -> Result<()> {
        let state = self.state.lock().unwrap();
        if state.capturing {
            if let Some(w) = &state.tracker {
                w.core.lock().unwrap().abort_for_calibration_change();
            }
            self.error_bus.report(
                ErrorCategory::Tracking,
                ErrorSeverity::Warning,
                "engine",
                "calibration change attempted mid-session; in-flight pitch aborted",
            );
            return Err(Error::CalibrationLocked);
        }
        *self.calibration.lock().unwrap() = calibration;
        Ok(())
    }

    pub fn get_preview_frames(&self) -> (Option<FrameHandle>, Option<FrameHandle>) {
        self.state.lock().unwrap().capture.preview_frames()
    }

    pub fn get_recent_pitches(&self) -> Vec<PitchData> {
        self.recent.lock().unwrap().iter().cloned().collect()
    }

    pub fn get_stats(&self) -> EngineStats {
        let state = self.state.lock().unwrap();
        let cam = |side: CamSide| {
            let c = state.capture.stats(side);
            let d = state.detection.stats(side);
            CameraStats {
                frames: c.frames,
                capture_drops: c.drops,
                read_errors: c.read_errors,
                reconnects: c.reconnects,
                detections_processed: d.processed,
                detection_drops: d.drops,
                detection_failures: d.failures,
            }
        };
        let (phase, pitch_count) = match &state.tracker {
            Some(w) => {
                let core = w.core.lock().unwrap();
                (
                    Some(core.machine().phase()),
                    core.machine().pitch_index(),
                )
            }
            None => (None, 0),
        };
        EngineStats {
            left: cam(CamSide::Left),
            right: cam(CamSide::Right),
            capturing: state.capturing,
            recording: self.recording.is_recording(),
            pitch_phase: phase,
            pitch_count,
        }
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        let _ = self.stop_capture();
        self.bus.unsubscribe(self.recent_sub);
    }
}
