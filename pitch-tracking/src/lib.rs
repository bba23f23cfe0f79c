//! Stereo pairing and pitch segmentation.
//!
//! [`StereoPairer`] matches per-camera detections into 3D observations;
//! [`PitchStateMachine`] turns the observation stream into
//! PitchStart/PitchEnd events. [`TrackerCore`] composes the two behind a
//! single entry point so the orchestrator can drive them from bus
//! handlers under one lock.

mod machine;
mod pairer;

pub use machine::PitchStateMachine;
pub use pairer::StereoPairer;

use std::sync::Arc;

use eventbus::EventBus;
use pitch_types::{ObservationDetectedEvent, PairingConfig, StateMachineConfig, TrackingParams};
use stereo_mvg::StereoCalibration;

/// Pairer + state machine, driven from the bus-dispatch threads.
///
/// All mutation happens through `&mut self`; the orchestrator serializes
/// calls with a mutex, which also guarantees the non-decreasing t_ref
/// order of emitted observations across the two detection lanes.
pub struct TrackerCore {
    pairer: StereoPairer,
    machine: PitchStateMachine,
}

impl TrackerCore {
    pub fn new(
        bus: EventBus,
        calibration: Arc<StereoCalibration>,
        pairing: &PairingConfig,
        state_machine: &StateMachineConfig,
        params: &TrackingParams,
    ) -> Self {
        Self {
            pairer: StereoPairer::new(calibration, pairing),
            machine: PitchStateMachine::new(bus, state_machine.clone(), params.clone()),
        }
    }

    /// Feed one per-camera detection event through pairing into the
    /// state machine.
    pub fn handle_detections(&mut self, ev: &ObservationDetectedEvent) {
        for det in &ev.detections {
            if let Some(obs) = self.pairer.push(det.clone()) {
                self.machine.observe(obs);
            }
        }
    }

    /// Advance time-based transitions. Driven from frame arrival, so the
    /// machine progresses at camera rate even when detections stop.
    pub fn tick(&mut self, now_ns: i64) {
        self.machine.tick(now_ns);
    }

    /// Calibration changed mid-session: abort any in-flight pitch without
    /// publishing a PitchEndEvent.
    pub fn abort_for_calibration_change(&mut self) {
        self.machine.abort();
        self.pairer.clear();
    }

    pub fn machine(&self) -> &PitchStateMachine {
        &self.machine
    }
}
