use std::collections::VecDeque;

use tracing::{debug, info};

use eventbus::{ErrorBus, EventBus};
use pitch_types::{
    ErrorCategory, ErrorSeverity, PitchEndEvent, PitchPhase, PitchStartEvent, StateMachineConfig,
    StereoObservation, TrackingParams,
};

/// Oldest observation considered when seeding a start candidate.
const MAX_CANDIDATE_GAP_NS: i64 = 100_000_000;

/// Observations remembered while INACTIVE for candidate seeding.
const RECENT_BUFFER: usize = 4;

enum State {
    Inactive,
    RampUp {
        obs: Vec<StereoObservation>,
        last_t_ns: i64,
    },
    Active {
        obs: Vec<StereoObservation>,
        start_t_ns: i64,
        last_t_ns: i64,
    },
    Ending {
        obs: Vec<StereoObservation>,
        start_t_ns: i64,
        end_t_ns: i64,
        extra: usize,
    },
}

/// Segments the stereo observation stream into discrete pitches.
///
/// All transitions happen on the thread delivering the observation (or
/// tick); the machine holds no locks of its own. PitchStart/PitchEnd are
/// published on the bus; a failed PitchStartEvent handler retracts the
/// activation (back to RAMP_UP, index unchanged, observations kept),
/// while a failed PitchEndEvent handler still resets and advances the
/// index: the pitch is lost downstream but the machine stays healthy.
pub struct PitchStateMachine {
    bus: EventBus,
    error_bus: ErrorBus,
    cfg: StateMachineConfig,
    params: TrackingParams,
    state: State,
    pitch_index: u32,
    recent: VecDeque<StereoObservation>,
    queued: Vec<StereoObservation>,
    in_finalize: bool,
}

impl PitchStateMachine {
    pub fn new(bus: EventBus, cfg: StateMachineConfig, params: TrackingParams) -> Self {
        let error_bus = bus.error_bus();
        Self {
            bus,
            error_bus,
            cfg,
            params,
            state: State::Inactive,
            pitch_index: 0,
            recent: VecDeque::new(),
            queued: Vec::new(),
            in_finalize: false,
        }
    }

    pub fn phase(&self) -> PitchPhase {
        if self.in_finalize {
            return PitchPhase::Finalized;
        }
        match self.state {
            State::Inactive => PitchPhase::Inactive,
            State::RampUp { .. } => PitchPhase::RampUp,
            State::Active { .. } => PitchPhase::Active,
            State::Ending { .. } => PitchPhase::Ending,
        }
    }

    pub fn pitch_index(&self) -> u32 {
        self.pitch_index
    }

    /// Feed one stereo observation.
    pub fn observe(&mut self, obs: StereoObservation) {
        if self.in_finalize {
            // Race with reset: redelivered to INACTIVE handling after the
            // finalize completes.
            self.queued.push(obs);
            return;
        }
        match std::mem::replace(&mut self.state, State::Inactive) {
            State::Inactive => self.handle_inactive(obs),
            State::RampUp { obs: cand, last_t_ns } => self.handle_ramp_up(cand, last_t_ns, obs),
            State::Active {
                obs: collected,
                start_t_ns,
                last_t_ns,
            } => self.handle_active(collected, start_t_ns, last_t_ns, obs),
            State::Ending {
                obs: mut collected,
                start_t_ns,
                end_t_ns,
                extra,
            } => {
                collected.push(obs);
                let extra = extra + 1;
                if extra >= self.cfg.post_roll_observations {
                    self.finalize(collected, start_t_ns, end_t_ns);
                } else {
                    self.state = State::Ending {
                        obs: collected,
                        start_t_ns,
                        end_t_ns,
                        extra,
                    };
                }
            }
        }
    }

    /// Evaluate time-based transitions against `now_ns`.
    pub fn tick(&mut self, now_ns: i64) {
        match &self.state {
            State::Inactive => {}
            State::RampUp { last_t_ns, .. } => {
                if now_ns - last_t_ns >= ms_to_ns(self.cfg.ramp_up_timeout_ms) {
                    debug!("ramp-up timed out; back to INACTIVE");
                    self.state = State::Inactive;
                }
            }
            State::Active { last_t_ns, .. } => {
                if now_ns - last_t_ns >= ms_to_ns(self.cfg.active_gap_ms) {
                    let last_t_ns = *last_t_ns;
                    if let State::Active {
                        obs,
                        start_t_ns,
                        ..
                    } = std::mem::replace(&mut self.state, State::Inactive)
                    {
                        debug!("observation gap; pitch {} ending", self.pitch_index);
                        self.state = State::Ending {
                            obs,
                            start_t_ns,
                            end_t_ns: last_t_ns,
                            extra: 0,
                        };
                    }
                }
            }
            State::Ending { end_t_ns, .. } => {
                if now_ns - end_t_ns >= ms_to_ns(self.cfg.post_roll_ms) {
                    if let State::Ending {
                        obs,
                        start_t_ns,
                        end_t_ns,
                        ..
                    } = std::mem::replace(&mut self.state, State::Inactive)
                    {
                        self.finalize(obs, start_t_ns, end_t_ns);
                    }
                }
            }
        }
    }

    /// Abort the in-flight pitch (calibration change): no PitchEndEvent,
    /// index unchanged.
    pub fn abort(&mut self) {
        if !matches!(self.state, State::Inactive) {
            info!("aborting in-flight pitch {}", self.pitch_index);
        }
        self.state = State::Inactive;
        self.recent.clear();
    }

    fn handle_inactive(&mut self, obs: StereoObservation) {
        // A start candidate is a pair of recent observations inside the
        // gate moving toward the plate at sufficient speed. If several
        // recent observations qualify, the fastest pairing wins.
        let mut best: Option<(f64, usize)> = None;
        if self.params.gate.contains(&obs.xyz_ft) {
            for (i, p) in self.recent.iter().enumerate() {
                let dt = obs.t_ref_ns - p.t_ref_ns;
                if dt <= 0 || dt > MAX_CANDIDATE_GAP_NS {
                    continue;
                }
                if !self.params.gate.contains(&p.xyz_ft) {
                    continue;
                }
                if obs.xyz_ft[1] >= p.xyz_ft[1] {
                    continue;
                }
                let v = speed_fps(p, &obs);
                if v >= self.params.min_start_speed_fps
                    && best.map(|(bv, _)| v > bv).unwrap_or(true)
                {
                    best = Some((v, i));
                }
            }
        }
        match best {
            Some((v, i)) => {
                let seed = self.recent[i].clone();
                self.recent.clear();
                debug!("start candidate at {:.0} ft/s", v);
                let last_t_ns = obs.t_ref_ns;
                self.state = State::RampUp {
                    obs: vec![seed, obs],
                    last_t_ns,
                };
            }
            None => {
                self.recent.push_back(obs);
                while self.recent.len() > RECENT_BUFFER {
                    self.recent.pop_front();
                }
                self.state = State::Inactive;
            }
        }
    }

    fn handle_ramp_up(
        &mut self,
        mut cand: Vec<StereoObservation>,
        last_t_ns: i64,
        obs: StereoObservation,
    ) {
        if obs.t_ref_ns - last_t_ns >= ms_to_ns(self.cfg.ramp_up_timeout_ms) {
            // Stale candidate; this observation starts over.
            self.recent.clear();
            self.handle_inactive(obs);
            return;
        }
        let prev = cand.last().expect("candidate is never empty");
        let approaching = obs.xyz_ft[1] < prev.xyz_ft[1];
        let consistent = approaching && {
            let mut with_new = cand.clone();
            with_new.push(obs.clone());
            fit_residual(&with_new) <= self.params.max_fit_residual_ft
        };
        if !consistent {
            debug!("ramp-up candidate broken; restarting from this observation");
            self.recent.clear();
            self.handle_inactive(obs);
            return;
        }

        let last_t_ns = obs.t_ref_ns;
        cand.push(obs);
        if cand.len() < self.cfg.min_observations_to_confirm {
            self.state = State::RampUp {
                obs: cand,
                last_t_ns,
            };
            return;
        }

        // Confirmed: publish the start. A failing handler retracts the
        // activation; the observations stay for a retry on the next
        // qualifying observation.
        let start_t_ns = cand[0].t_ref_ns;
        let outcome = self.bus.publish(&PitchStartEvent {
            pitch_index: self.pitch_index,
            t_start_ns: start_t_ns,
        });
        if outcome.failed > 0 {
            self.error_bus.report(
                ErrorCategory::Tracking,
                ErrorSeverity::Error,
                "state-machine",
                format!(
                    "PitchStartEvent handler failed; pitch {} start retracted",
                    self.pitch_index
                ),
            );
            self.state = State::RampUp {
                obs: cand,
                last_t_ns,
            };
        } else {
            info!("pitch {} started", self.pitch_index);
            self.state = State::Active {
                obs: cand,
                start_t_ns,
                last_t_ns,
            };
        }
    }

    fn handle_active(
        &mut self,
        mut collected: Vec<StereoObservation>,
        start_t_ns: i64,
        _last_t_ns: i64,
        obs: StereoObservation,
    ) {
        let prev = collected.last().expect("active list is never empty");
        let speed = speed_fps(prev, &obs);
        let past_plate = obs.xyz_ft[1] <= self.params.plate_y_ft;
        let collapsed = speed < self.params.min_speed_floor_fps;
        let t = obs.t_ref_ns;
        collected.push(obs);

        if past_plate || collapsed {
            if past_plate {
                debug!("pitch {} past the plate", self.pitch_index);
            } else {
                debug!("pitch {} speed collapsed ({speed:.0} ft/s)", self.pitch_index);
            }
            self.state = State::Ending {
                obs: collected,
                start_t_ns,
                end_t_ns: t,
                extra: 0,
            };
        } else {
            self.state = State::Active {
                obs: collected,
                start_t_ns,
                last_t_ns: t,
            };
        }
    }

    fn finalize(&mut self, obs: Vec<StereoObservation>, start_t_ns: i64, end_t_ns: i64) {
        self.in_finalize = true;
        let index = self.pitch_index;
        let n = obs.len();
        let outcome = self.bus.publish(&PitchEndEvent {
            pitch_index: index,
            t_start_ns: start_t_ns,
            t_end_ns: end_t_ns,
            observations: obs,
        });
        self.in_finalize = false;
        if outcome.failed > 0 {
            // The pitch is recorded as lost downstream, but the machine
            // resets and the index still advances.
            self.error_bus.report(
                ErrorCategory::Tracking,
                ErrorSeverity::Error,
                "state-machine",
                format!("PitchEndEvent handler failed; pitch {index} lost"),
            );
        } else {
            info!("pitch {index} finalized with {n} observations");
        }
        self.state = State::Inactive;
        self.pitch_index += 1;
        self.recent.clear();

        let queued = std::mem::take(&mut self.queued);
        for q in queued {
            self.observe(q);
        }
    }
}

fn ms_to_ns(ms: u64) -> i64 {
    ms as i64 * 1_000_000
}

fn speed_fps(a: &StereoObservation, b: &StereoObservation) -> f64 {
    let dt = (b.t_ref_ns - a.t_ref_ns) as f64 * 1e-9;
    if dt.abs() < 1e-9 {
        return 0.0;
    }
    let dx = b.xyz_ft[0] - a.xyz_ft[0];
    let dy = b.xyz_ft[1] - a.xyz_ft[1];
    let dz = b.xyz_ft[2] - a.xyz_ft[2];
    (dx * dx + dy * dy + dz * dz).sqrt() / dt.abs()
}

/// Maximum point deviation from a constant-velocity least-squares fit.
fn fit_residual(points: &[StereoObservation]) -> f64 {
    let n = points.len();
    if n < 3 {
        return 0.0;
    }
    let t0 = points[0].t_ref_ns;
    let ts: Vec<f64> = points
        .iter()
        .map(|p| (p.t_ref_ns - t0) as f64 * 1e-9)
        .collect();
    let t_mean = ts.iter().sum::<f64>() / n as f64;
    let denom: f64 = ts.iter().map(|t| (t - t_mean) * (t - t_mean)).sum();
    if denom < 1e-12 {
        return 0.0;
    }

    let mut residuals = vec![0.0f64; n];
    for axis in 0..3 {
        let xs: Vec<f64> = points.iter().map(|p| p.xyz_ft[axis]).collect();
        let x_mean = xs.iter().sum::<f64>() / n as f64;
        let slope: f64 = ts
            .iter()
            .zip(&xs)
            .map(|(t, x)| (t - t_mean) * (x - x_mean))
            .sum::<f64>()
            / denom;
        let intercept = x_mean - slope * t_mean;
        for (i, (t, x)) in ts.iter().zip(&xs).enumerate() {
            let r = x - (intercept + slope * t);
            residuals[i] += r * r;
        }
    }
    residuals
        .into_iter()
        .map(f64::sqrt)
        .fold(0.0, f64::max)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pitch_types::{CamSide, Detection};
    use std::sync::{Arc, Mutex};

    fn mk_obs(t_ms: i64, y_ft: f64) -> StereoObservation {
        let t_ns = t_ms * 1_000_000;
        let det = |cam| Detection {
            cam,
            frame_index: t_ms as u64 / 10,
            x: 100.0,
            y: 100.0,
            bbox: None,
            confidence: 0.9,
            t_capture_ns: t_ns,
        };
        StereoObservation {
            t_ref_ns: t_ns,
            left: det(CamSide::Left),
            right: det(CamSide::Right),
            xyz_ft: [0.0, y_ft, 5.0],
            quality: 0.99,
        }
    }

    struct Harness {
        bus: EventBus,
        machine: PitchStateMachine,
        starts: Arc<Mutex<Vec<PitchStartEvent>>>,
        ends: Arc<Mutex<Vec<PitchEndEvent>>>,
        errors: Arc<Mutex<Vec<ErrorCategory>>>,
    }

    fn harness() -> Harness {
        let bus = EventBus::new();
        let starts = Arc::new(Mutex::new(Vec::new()));
        let ends = Arc::new(Mutex::new(Vec::new()));
        let errors = Arc::new(Mutex::new(Vec::new()));
        {
            let starts = starts.clone();
            bus.subscribe_infallible::<PitchStartEvent, _>(
                "starts",
                ErrorCategory::Tracking,
                move |ev| starts.lock().unwrap().push(ev.clone()),
            );
        }
        {
            let ends = ends.clone();
            bus.subscribe_infallible::<PitchEndEvent, _>(
                "ends",
                ErrorCategory::Tracking,
                move |ev| ends.lock().unwrap().push(ev.clone()),
            );
        }
        {
            let errors = errors.clone();
            bus.error_bus().subscribe_errors("errors", move |ev| {
                errors.lock().unwrap().push(ev.category)
            });
        }
        let machine = PitchStateMachine::new(
            bus.clone(),
            StateMachineConfig::default(),
            TrackingParams::default(),
        );
        Harness {
            bus,
            machine,
            starts,
            ends,
            errors,
        }
    }

    /// 30 observations at 10 ms spacing, ~90 mph, ending past the plate.
    fn feed_clean_pitch(machine: &mut PitchStateMachine) -> i64 {
        let mut last_t = 0;
        for k in 0..30i64 {
            let t_ms = k * 10;
            let y = 39.0 - 1.32 * k as f64;
            machine.observe(mk_obs(t_ms, y));
            last_t = t_ms;
        }
        last_t
    }

    #[test]
    fn clean_pitch_start_and_end() {
        let mut h = harness();
        let last_t_ms = feed_clean_pitch(&mut h.machine);

        // Confirmed on the third observation.
        let starts = h.starts.lock().unwrap().clone();
        assert_eq!(starts.len(), 1);
        assert_eq!(starts[0].pitch_index, 0);
        assert_eq!(starts[0].t_start_ns, 0);

        // The final observation crossed the plate plane.
        assert_eq!(h.machine.phase(), PitchPhase::Ending);

        // Post-roll elapses with no further observations.
        h.machine.tick((last_t_ms + 501) * 1_000_000);
        assert_eq!(h.machine.phase(), PitchPhase::Inactive);
        let ends = h.ends.lock().unwrap().clone();
        assert_eq!(ends.len(), 1);
        assert_eq!(ends[0].pitch_index, 0);
        assert_eq!(ends[0].observations.len(), 30);
        assert_eq!(h.machine.pitch_index(), 1);
        assert!(h.errors.lock().unwrap().is_empty());
    }

    #[test]
    fn exactly_min_observations_confirm_one_fewer_does_not() {
        let mut h = harness();
        h.machine.observe(mk_obs(0, 39.0));
        h.machine.observe(mk_obs(10, 37.7));
        // Two observations: candidate exists but is not confirmed.
        assert_eq!(h.machine.phase(), PitchPhase::RampUp);
        assert!(h.starts.lock().unwrap().is_empty());
        h.machine.observe(mk_obs(20, 36.4));
        // Third consistent observation confirms.
        assert_eq!(h.machine.phase(), PitchPhase::Active);
        assert_eq!(h.starts.lock().unwrap().len(), 1);
    }

    #[test]
    fn ramp_up_times_out_back_to_inactive() {
        let mut h = harness();
        h.machine.observe(mk_obs(0, 39.0));
        h.machine.observe(mk_obs(10, 37.7));
        assert_eq!(h.machine.phase(), PitchPhase::RampUp);
        // 600 ms of silence exceeds the 500 ms ramp-up timeout.
        h.machine.tick(610 * 1_000_000);
        assert_eq!(h.machine.phase(), PitchPhase::Inactive);
        assert!(h.starts.lock().unwrap().is_empty());
        assert_eq!(h.machine.pitch_index(), 0);
    }

    #[test]
    fn active_gap_exactly_at_threshold_ends_the_pitch() {
        let mut h = harness();
        for k in 0..5i64 {
            h.machine.observe(mk_obs(k * 10, 39.0 - 1.32 * k as f64));
        }
        assert_eq!(h.machine.phase(), PitchPhase::Active);
        let last_t_ns = 40 * 1_000_000;
        // One ns short of the gap: still active.
        h.machine.tick(last_t_ns + 300 * 1_000_000 - 1);
        assert_eq!(h.machine.phase(), PitchPhase::Active);
        // Exactly at the gap: ending.
        h.machine.tick(last_t_ns + 300 * 1_000_000);
        assert_eq!(h.machine.phase(), PitchPhase::Ending);
    }

    #[test]
    fn speed_collapse_ends_the_pitch() {
        let mut h = harness();
        for k in 0..5i64 {
            h.machine.observe(mk_obs(k * 10, 39.0 - 1.32 * k as f64));
        }
        assert_eq!(h.machine.phase(), PitchPhase::Active);
        // Nearly stationary observation: far below the 20 ft/s floor.
        h.machine.observe(mk_obs(60, 39.0 - 1.32 * 4.0 - 0.001));
        assert_eq!(h.machine.phase(), PitchPhase::Ending);
    }

    #[test]
    fn post_roll_observation_budget_finalizes() {
        let mut h = harness();
        for k in 0..5i64 {
            h.machine.observe(mk_obs(k * 10, 39.0 - 1.32 * k as f64));
        }
        // Force ENDING by gap.
        h.machine.tick((40 + 300) * 1_000_000);
        assert_eq!(h.machine.phase(), PitchPhase::Ending);
        // Default budget is 5 additional observations.
        for k in 0..5i64 {
            h.machine.observe(mk_obs(400 + k * 10, 30.0));
        }
        assert_eq!(h.machine.phase(), PitchPhase::Inactive);
        let ends = h.ends.lock().unwrap();
        assert_eq!(ends.len(), 1);
        assert_eq!(ends[0].observations.len(), 10);
    }

    #[test]
    fn failed_start_handler_reverts_and_retries() {
        let mut h = harness();
        let fail = Arc::new(std::sync::atomic::AtomicBool::new(true));
        {
            let fail = fail.clone();
            h.bus
                .subscribe::<PitchStartEvent, _>("bad", ErrorCategory::Tracking, move |_| {
                    if fail.load(std::sync::atomic::Ordering::SeqCst) {
                        Err("recorder rejected pitch start".into())
                    } else {
                        Ok(eventbus::Flow::Handled)
                    }
                });
        }
        h.machine.observe(mk_obs(0, 39.0));
        h.machine.observe(mk_obs(10, 37.7));
        h.machine.observe(mk_obs(20, 36.4));
        // Activation retracted: back to RAMP_UP, index unchanged.
        assert_eq!(h.machine.phase(), PitchPhase::RampUp);
        assert_eq!(h.machine.pitch_index(), 0);
        assert!(h
            .errors
            .lock()
            .unwrap()
            .contains(&ErrorCategory::Tracking));

        // Handler recovers; the next qualifying observation retries.
        fail.store(false, std::sync::atomic::Ordering::SeqCst);
        h.machine.observe(mk_obs(30, 35.0));
        assert_eq!(h.machine.phase(), PitchPhase::Active);
        let starts = h.starts.lock().unwrap();
        assert_eq!(starts.last().unwrap().pitch_index, 0);
    }

    #[test]
    fn failed_end_handler_still_advances_index() {
        let mut h = harness();
        h.bus
            .subscribe::<PitchEndEvent, _>("bad-end", ErrorCategory::Tracking, |_| {
                Err("manifest write failed".into())
            });
        let last_t_ms = feed_clean_pitch(&mut h.machine);
        h.machine.tick((last_t_ms + 501) * 1_000_000);
        assert_eq!(h.machine.phase(), PitchPhase::Inactive);
        // Lost downstream, but the machine advanced.
        assert_eq!(h.machine.pitch_index(), 1);
        assert!(h
            .errors
            .lock()
            .unwrap()
            .contains(&ErrorCategory::Tracking));

        // The next pitch proceeds normally with the next index.
        for k in 0..30i64 {
            h.machine
                .observe(mk_obs(2000 + k * 10, 39.0 - 1.32 * k as f64));
        }
        let starts = h.starts.lock().unwrap();
        assert_eq!(starts.last().unwrap().pitch_index, 1);
    }

    #[test]
    fn faster_candidate_pair_wins_the_tie_break() {
        let mut h = harness();
        // Slow mover: would qualify at ~66 ft/s against the new obs.
        h.machine.observe(mk_obs(0, 50.0));
        // Fast mover 10 ms later.
        h.machine.observe(mk_obs(10, 49.9));
        // Speeds: (0 -> now) = (50.0-47.5)/20ms = 125 ft/s over 20 ms;
        // (10ms -> now) = 2.4/10ms = 240 ft/s. The faster pair seeds the
        // candidate, so t_start is the 10 ms observation.
        h.machine.observe(mk_obs(20, 47.5));
        assert_eq!(h.machine.phase(), PitchPhase::RampUp);
        h.machine.observe(mk_obs(30, 45.1));
        h.machine.observe(mk_obs(40, 42.7));
        assert_eq!(h.machine.phase(), PitchPhase::Active);
        let starts = h.starts.lock().unwrap();
        assert_eq!(starts[0].t_start_ns, 10 * 1_000_000);
    }

    #[test]
    fn slow_drifting_observations_never_start_a_pitch() {
        let mut h = harness();
        for k in 0..20i64 {
            // 1 ft/s drift: far below the 40 ft/s start threshold.
            h.machine.observe(mk_obs(k * 10, 50.0 - 0.01 * k as f64));
        }
        assert_eq!(h.machine.phase(), PitchPhase::Inactive);
        assert!(h.starts.lock().unwrap().is_empty());
    }

    #[test]
    fn abort_discards_pitch_without_end_event() {
        let mut h = harness();
        for k in 0..5i64 {
            h.machine.observe(mk_obs(k * 10, 39.0 - 1.32 * k as f64));
        }
        assert_eq!(h.machine.phase(), PitchPhase::Active);
        h.machine.abort();
        assert_eq!(h.machine.phase(), PitchPhase::Inactive);
        assert!(h.ends.lock().unwrap().is_empty());
        assert_eq!(h.machine.pitch_index(), 0);
    }

    #[test]
    fn observations_outside_the_gate_are_ignored_for_candidates() {
        let mut h = harness();
        // Fast but outside the gating volume (y > 60).
        h.machine.observe(mk_obs(0, 80.0));
        h.machine.observe(mk_obs(10, 78.0));
        h.machine.observe(mk_obs(20, 76.0));
        assert_eq!(h.machine.phase(), PitchPhase::Inactive);
    }
}
