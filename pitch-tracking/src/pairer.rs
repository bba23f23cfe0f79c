use std::sync::Arc;

use tracing::{debug, trace};

use pitch_types::{CamSide, Detection, PairingConfig, StereoObservation};
use stereo_mvg::StereoCalibration;

/// Combines left/right detections into [`StereoObservation`]s.
///
/// The most recent detection per camera is buffered. When both sides
/// hold a detection within the pairing window, the pair is triangulated
/// and emitted with t_ref equal to the later of the two stamps, and the
/// older buffered detection is discarded. Pairs failing the epipolar
/// consistency gate are dropped the same way.
///
/// Emitted observations are non-decreasing in t_ref.
pub struct StereoPairer {
    calibration: Arc<StereoCalibration>,
    window_ns: i64,
    max_reproj_err_px: f64,
    buf: [Option<Detection>; 2],
    last_emitted_t_ns: Option<i64>,
}

impl StereoPairer {
    pub fn new(calibration: Arc<StereoCalibration>, config: &PairingConfig) -> Self {
        Self {
            calibration,
            window_ns: (config.window_ms * 1e6) as i64,
            max_reproj_err_px: config.max_reproj_err_px,
            buf: [None, None],
            last_emitted_t_ns: None,
        }
    }

    pub fn clear(&mut self) {
        self.buf = [None, None];
    }

    /// Feed one detection; returns a stereo observation when this
    /// detection completes a pair.
    pub fn push(&mut self, det: Detection) -> Option<StereoObservation> {
        let idx = det.cam.idx();
        self.buf[idx] = Some(det);
        let (left, right) = match (&self.buf[0], &self.buf[1]) {
            (Some(l), Some(r)) => (l, r),
            _ => return None,
        };

        let dt = left.t_capture_ns - right.t_capture_ns;
        if dt.abs() > self.window_ns {
            // Too far apart in time: the older detection can never pair
            // again, so drop it and keep waiting.
            self.discard_older();
            return None;
        }

        let tri = match self
            .calibration
            .triangulate_with_quality((left.x, left.y), (right.x, right.y))
        {
            Ok(tri) => tri,
            Err(e) => {
                debug!("triangulation failed: {e}");
                self.discard_older();
                return None;
            }
        };
        if tri.mean_reproj_px > self.max_reproj_err_px {
            trace!(
                "epipolar gate rejected pair (reproj {:.1} px)",
                tri.mean_reproj_px
            );
            self.discard_older();
            return None;
        }

        let t_ref_ns = left.t_capture_ns.max(right.t_capture_ns);
        let obs = StereoObservation {
            t_ref_ns,
            left: left.clone(),
            right: right.clone(),
            xyz_ft: tri.xyz_ft,
            quality: tri.quality,
        };
        self.discard_older();

        // Output ordering guard: a pair formed from a late-arriving
        // detection must not step backwards in t_ref.
        if let Some(last) = self.last_emitted_t_ns {
            if obs.t_ref_ns < last {
                trace!("discarding out-of-order pair (t_ref regressed)");
                return None;
            }
        }
        self.last_emitted_t_ns = Some(obs.t_ref_ns);
        Some(obs)
    }

    fn discard_older(&mut self) {
        let older = match (&self.buf[0], &self.buf[1]) {
            (Some(l), Some(r)) => {
                if l.t_capture_ns <= r.t_capture_ns {
                    CamSide::Left
                } else {
                    CamSide::Right
                }
            }
            (Some(_), None) => CamSide::Left,
            (None, Some(_)) => CamSide::Right,
            (None, None) => return,
        };
        self.buf[older.idx()] = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use pitch_types::CamSide;

    fn rig() -> Arc<StereoCalibration> {
        Arc::new(StereoCalibration::simple_rig(800.0, 640.0, 360.0, 2.0, 4.0))
    }

    fn det_for_point(cal: &StereoCalibration, cam: CamSide, p: [f64; 3], t_ns: i64) -> Detection {
        let c = match cam {
            CamSide::Left => &cal.left,
            CamSide::Right => &cal.right,
        };
        let (x, y) = c.project(&p).unwrap();
        Detection {
            cam,
            frame_index: (t_ns / 1_000_000) as u64,
            x,
            y,
            bbox: None,
            confidence: 0.9,
            t_capture_ns: t_ns,
        }
    }

    fn pairer(cal: Arc<StereoCalibration>) -> StereoPairer {
        StereoPairer::new(cal, &PairingConfig::default())
    }

    #[test]
    fn detections_within_window_pair_up() {
        let cal = rig();
        let mut p = pairer(cal.clone());
        let world = [1.0, 40.0, 5.0];
        assert!(p
            .push(det_for_point(&cal, CamSide::Left, world, 1_000_000))
            .is_none());
        let obs = p
            .push(det_for_point(&cal, CamSide::Right, world, 4_000_000))
            .expect("pair expected");
        assert_eq!(obs.t_ref_ns, 4_000_000);
        assert_relative_eq!(obs.xyz_ft[0], 1.0, epsilon = 1e-6);
        assert_relative_eq!(obs.xyz_ft[1], 40.0, epsilon = 1e-6);
        assert!(obs.quality > 0.99);
    }

    #[test]
    fn detections_outside_window_discard_the_older() {
        let cal = rig();
        let mut p = pairer(cal.clone());
        let world = [0.0, 40.0, 5.0];
        assert!(p
            .push(det_for_point(&cal, CamSide::Left, world, 0))
            .is_none());
        // 50 ms later: outside the 10 ms window. Left is discarded.
        assert!(p
            .push(det_for_point(&cal, CamSide::Right, world, 50_000_000))
            .is_none());
        // A fresh left detection close to the right one pairs.
        let obs = p.push(det_for_point(&cal, CamSide::Left, world, 52_000_000));
        assert!(obs.is_some());
    }

    #[test]
    fn epipolar_gate_rejects_mismatched_points() {
        let cal = rig();
        let mut p = pairer(cal.clone());
        // Two different physical points cannot be the same ball.
        assert!(p
            .push(det_for_point(&cal, CamSide::Left, [3.0, 40.0, 8.0], 1_000_000))
            .is_none());
        let obs = p.push(det_for_point(
            &cal,
            CamSide::Right,
            [-3.0, 20.0, 2.0],
            2_000_000,
        ));
        assert!(obs.is_none());
    }

    #[test]
    fn emitted_t_ref_is_non_decreasing() {
        let cal = rig();
        let mut p = pairer(cal.clone());
        let mut last = None;
        for k in 0..10i64 {
            let world = [0.0, 50.0 - k as f64, 5.0];
            let t = k * 10_000_000;
            p.push(det_for_point(&cal, CamSide::Left, world, t));
            if let Some(obs) = p.push(det_for_point(&cal, CamSide::Right, world, t + 2_000_000)) {
                if let Some(prev) = last {
                    assert!(obs.t_ref_ns >= prev);
                }
                last = Some(obs.t_ref_ns);
            }
        }
        assert!(last.is_some());
    }
}
