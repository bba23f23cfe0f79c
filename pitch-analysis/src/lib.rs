//! Per-pitch trajectory analysis.
//!
//! Consumes finished pitches from the bus, fits a constant-acceleration
//! model to the observation track, and writes the resulting metrics into
//! the pitch manifest once the clip is closed on disk. No feedback path
//! into capture or recording.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use nalgebra::{DMatrix, DVector};
use tracing::{debug, info};

use eventbus::{ErrorBus, EventBus, SubscriptionId};
use pitch_types::{
    AnalysisRecord, ErrorCategory, ErrorSeverity, PitchClipClosedEvent, PitchEndEvent,
    PitchManifest, StereoObservation,
};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("io error: {source}")]
    IoError {
        #[from]
        source: std::io::Error,
    },
    #[error("manifest error: {source}")]
    JsonError {
        #[from]
        source: serde_json::Error,
    },
    #[error("least-squares fit failed: {0}")]
    FitFailed(&'static str),
}

const FPS_TO_MPH: f64 = 3600.0 / 5280.0;

/// Residual bound for counting an observation as an inlier, feet.
const INLIER_RESIDUAL_FT: f64 = 0.25;

/// Fewest observations for a meaningful quadratic fit.
const MIN_OBSERVATIONS: usize = 4;

/// Fit a constant-acceleration model per axis and derive pitch metrics.
///
/// Returns `None` when there are too few observations to fit.
pub fn analyze(observations: &[StereoObservation]) -> Option<AnalysisRecord> {
    let n = observations.len();
    if n < MIN_OBSERVATIONS {
        return None;
    }
    let t0 = observations[0].t_ref_ns;
    let ts: Vec<f64> = observations
        .iter()
        .map(|o| (o.t_ref_ns - t0) as f64 * 1e-9)
        .collect();

    // x(t) = c0 + c1 t + c2 t^2 per axis, least squares.
    let design = DMatrix::from_fn(n, 3, |r, c| ts[r].powi(c as i32));
    let mut coeffs = [[0.0f64; 3]; 3];
    for axis in 0..3 {
        let rhs = DVector::from_iterator(n, observations.iter().map(|o| o.xyz_ft[axis]));
        let fit = lstsq::lstsq(&design, &rhs, 1e-12).ok()?;
        coeffs[axis] = [fit.solution[0], fit.solution[1], fit.solution[2]];
    }

    let pos_at = |axis: usize, t: f64| {
        let c = &coeffs[axis];
        c[0] + c[1] * t + c[2] * t * t
    };
    let vel_at = |axis: usize, t: f64| {
        let c = &coeffs[axis];
        c[1] + 2.0 * c[2] * t
    };
    let speed_at = |t: f64| {
        (0..3)
            .map(|axis| vel_at(axis, t).powi(2))
            .sum::<f64>()
            .sqrt()
    };

    let mut sum_sq = 0.0;
    let mut inliers = 0usize;
    for (i, o) in observations.iter().enumerate() {
        let r2: f64 = (0..3)
            .map(|axis| (o.xyz_ft[axis] - pos_at(axis, ts[i])).powi(2))
            .sum();
        sum_sq += r2;
        if r2.sqrt() < INLIER_RESIDUAL_FT {
            inliers += 1;
        }
    }
    let rmse_ft = (sum_sq / n as f64).sqrt();

    let t_release = ts[0];
    let t_plate = ts[n - 1];
    let dt = t_plate - t_release;
    // Break: deviation at the plate from a straight-line extrapolation
    // of the release velocity. For the quadratic model this is the
    // acceleration term, c2 * dt^2.
    let chord = |axis: usize| {
        pos_at(axis, t_plate) - (pos_at(axis, t_release) + vel_at(axis, t_release) * dt)
    };

    Some(AnalysisRecord {
        release_speed_mph: speed_at(t_release) * FPS_TO_MPH,
        plate_speed_mph: speed_at(t_plate) * FPS_TO_MPH,
        h_break_in: chord(0) * 12.0,
        v_break_in: chord(2) * 12.0,
        rmse_ft,
        inlier_ratio: inliers as f64 / n as f64,
        n_observations: n,
    })
}

struct AnalysisInner {
    error_bus: ErrorBus,
    /// Records computed at PitchEndEvent, waiting for the clip to close.
    pending: Mutex<HashMap<u32, AnalysisRecord>>,
}

impl AnalysisInner {
    fn update_manifest(&self, path: &Path, record: &AnalysisRecord) -> Result<()> {
        let manifest: PitchManifest =
            serde_json::from_reader(std::io::BufReader::new(std::fs::File::open(path)?))?;
        let manifest = PitchManifest {
            analysis: Some(record.clone()),
            ..manifest
        };
        let f = std::fs::File::create(path)?;
        serde_json::to_writer_pretty(std::io::BufWriter::new(f), &manifest)?;
        Ok(())
    }
}

/// Subscribes to pitch completion and annotates pitch manifests.
pub struct AnalysisService {
    bus: EventBus,
    inner: Arc<AnalysisInner>,
    subs: Vec<SubscriptionId>,
}

impl AnalysisService {
    pub fn new(bus: EventBus) -> Self {
        let inner = Arc::new(AnalysisInner {
            error_bus: bus.error_bus(),
            pending: Mutex::new(HashMap::new()),
        });
        let mut subs = Vec::new();
        {
            let inner = inner.clone();
            subs.push(bus.subscribe_infallible::<PitchEndEvent, _>(
                "analysis/pitch-end",
                ErrorCategory::Tracking,
                move |ev| {
                    match analyze(&ev.observations) {
                        Some(record) => {
                            info!(
                                "pitch {}: {:.1} mph, break {:+.1}\"H / {:+.1}\"V, rmse {:.2} ft",
                                ev.pitch_index,
                                record.release_speed_mph,
                                record.h_break_in,
                                record.v_break_in,
                                record.rmse_ft
                            );
                            inner
                                .pending
                                .lock()
                                .unwrap()
                                .insert(ev.pitch_index, record);
                        }
                        None => {
                            debug!(
                                "pitch {}: too few observations to analyze ({})",
                                ev.pitch_index,
                                ev.observations.len()
                            );
                        }
                    }
                },
            ));
        }
        {
            let inner = inner.clone();
            subs.push(bus.subscribe_infallible::<PitchClipClosedEvent, _>(
                "analysis/clip-closed",
                ErrorCategory::Recording,
                move |ev| {
                    let record = inner.pending.lock().unwrap().remove(&ev.pitch_index);
                    let record = match record {
                        Some(r) => Some(r),
                        // Computed lazily when the end event was missed
                        // (e.g. pitch closed at session teardown).
                        None => read_observations(&ev.manifest_path)
                            .ok()
                            .as_deref()
                            .and_then(analyze),
                    };
                    let Some(record) = record else {
                        return;
                    };
                    if let Err(e) = inner.update_manifest(&ev.manifest_path, &record) {
                        inner.error_bus.report(
                            ErrorCategory::Recording,
                            ErrorSeverity::Error,
                            "analysis",
                            format!(
                                "cannot write analysis into {}: {e}",
                                ev.manifest_path.display()
                            ),
                        );
                    }
                },
            ));
        }
        Self { bus, inner, subs }
    }

    /// Analysis computed for `pitch_index` but not yet written to disk.
    pub fn pending_for(&self, pitch_index: u32) -> Option<AnalysisRecord> {
        self.inner.pending.lock().unwrap().get(&pitch_index).cloned()
    }
}

impl Drop for AnalysisService {
    fn drop(&mut self) {
        for sub in self.subs.drain(..) {
            self.bus.unsubscribe(sub);
        }
    }
}

fn read_observations(path: &Path) -> Result<Vec<StereoObservation>> {
    let manifest: PitchManifest =
        serde_json::from_reader(std::io::BufReader::new(std::fs::File::open(path)?))?;
    Ok(manifest.observations)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use pitch_types::{CamSide, Detection};

    /// Ballistic track: vy = -132 ft/s (90 mph), gravity on z.
    fn ballistic(n: usize, dt_ms: i64) -> Vec<StereoObservation> {
        (0..n)
            .map(|k| {
                let t = k as f64 * dt_ms as f64 * 1e-3;
                let t_ns = k as i64 * dt_ms * 1_000_000;
                let det = |cam| Detection {
                    cam,
                    frame_index: k as u64,
                    x: 0.0,
                    y: 0.0,
                    bbox: None,
                    confidence: 0.9,
                    t_capture_ns: t_ns,
                };
                StereoObservation {
                    t_ref_ns: t_ns,
                    left: det(CamSide::Left),
                    right: det(CamSide::Right),
                    xyz_ft: [0.3, 55.0 - 132.0 * t, 6.0 - 16.085 * t * t],
                    quality: 0.99,
                }
            })
            .collect()
    }

    #[test]
    fn recovers_release_speed_and_break() {
        let obs = ballistic(30, 10);
        let rec = analyze(&obs).unwrap();
        assert_relative_eq!(rec.release_speed_mph, 90.0, epsilon = 0.5);
        assert!(rec.plate_speed_mph > 85.0);
        // Pure gravity: no horizontal break, downward vertical break of
        // 16.085 * dt^2 ft at dt = 0.29 s.
        assert_relative_eq!(rec.h_break_in, 0.0, epsilon = 0.1);
        let expected_v = -16.085 * 0.29f64.powi(2) * 12.0;
        assert_relative_eq!(rec.v_break_in, expected_v, epsilon = 0.2);
        assert!(rec.rmse_ft < 1e-6);
        assert_relative_eq!(rec.inlier_ratio, 1.0);
        assert_eq!(rec.n_observations, 30);
    }

    #[test]
    fn too_few_observations_yield_nothing() {
        let obs = ballistic(3, 10);
        assert!(analyze(&obs).is_none());
    }

    #[test]
    fn noisy_track_degrades_inlier_ratio() {
        let mut obs = ballistic(20, 10);
        obs[10].xyz_ft[0] += 3.0; // one wild outlier
        let rec = analyze(&obs).unwrap();
        assert!(rec.inlier_ratio < 1.0);
        assert!(rec.rmse_ft > 0.1);
    }

    #[test]
    fn writes_analysis_into_manifest_via_bus() {
        let dir = tempfile::tempdir().unwrap();
        let manifest_path = dir.path().join("manifest.json");
        let obs = ballistic(30, 10);
        let manifest = PitchManifest {
            session_id: "session_20260801_101500_demo".to_string(),
            pitch_id: 0,
            created_utc: chrono::Utc::now(),
            app_version: pitch_types::app_version().to_string(),
            schema_version: pitch_types::MANIFEST_SCHEMA,
            codec: pitch_types::Codec::Mjpeg,
            fps: 60.0,
            resolution: pitch_types::Resolution { w: 64, h: 48 },
            pre_roll_ms: 500,
            post_roll_ms: 500,
            observations: obs.clone(),
            analysis: None,
        };
        serde_json::to_writer_pretty(
            std::fs::File::create(&manifest_path).unwrap(),
            &manifest,
        )
        .unwrap();

        let bus = EventBus::new();
        let _svc = AnalysisService::new(bus.clone());
        bus.publish(&PitchEndEvent {
            pitch_index: 0,
            t_start_ns: 0,
            t_end_ns: 290_000_000,
            observations: obs,
        });
        bus.publish(&PitchClipClosedEvent {
            pitch_index: 0,
            manifest_path: manifest_path.clone(),
        });

        let updated: PitchManifest =
            serde_json::from_reader(std::fs::File::open(&manifest_path).unwrap()).unwrap();
        let analysis = updated.analysis.expect("analysis recorded");
        assert_relative_eq!(analysis.release_speed_mph, 90.0, epsilon = 0.5);
        assert_eq!(updated.observations.len(), 30);
    }

    #[test]
    fn clip_closed_without_end_event_reads_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let manifest_path = dir.path().join("manifest.json");
        let obs = ballistic(10, 10);
        let manifest = PitchManifest {
            session_id: "s".to_string(),
            pitch_id: 3,
            created_utc: chrono::Utc::now(),
            app_version: pitch_types::app_version().to_string(),
            schema_version: pitch_types::MANIFEST_SCHEMA,
            codec: pitch_types::Codec::Mjpeg,
            fps: 60.0,
            resolution: pitch_types::Resolution { w: 64, h: 48 },
            pre_roll_ms: 0,
            post_roll_ms: 0,
            observations: obs,
            analysis: None,
        };
        serde_json::to_writer_pretty(
            std::fs::File::create(&manifest_path).unwrap(),
            &manifest,
        )
        .unwrap();

        let bus = EventBus::new();
        let _svc = AnalysisService::new(bus.clone());
        bus.publish(&PitchClipClosedEvent {
            pitch_index: 3,
            manifest_path: manifest_path.clone(),
        });
        let updated: PitchManifest =
            serde_json::from_reader(std::fs::File::open(&manifest_path).unwrap()).unwrap();
        assert!(updated.analysis.is_some());
    }
}
