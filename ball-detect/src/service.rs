use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, info};

use eventbus::{ErrorBus, EventBus, Flow, SubscriptionId};
use pitch_types::{
    CamSide, DetectionConfig, ErrorCategory, ErrorSeverity, FrameCapturedEvent, FrameHandle,
    ObservationDetectedEvent,
};

use crate::{Detector, ReorderBuffer};

/// Bound on the enqueue wait when the lane queue is full. Capture must
/// never stall longer than this on a slow detector.
const ENQUEUE_TIMEOUT: Duration = Duration::from_millis(5);

/// Worker receive timeout; bounds the stop-flag check interval.
const RECV_TIMEOUT: Duration = Duration::from_millis(50);

/// Consecutive failures per camera before severity escalates to CRITICAL.
const ESCALATION_LIMIT: u32 = 10;

#[derive(Default)]
struct LaneCounters {
    processed: AtomicU64,
    drops: AtomicU64,
    failures: AtomicU64,
}

/// Snapshot of per-camera detection counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DetectionStats {
    pub processed: u64,
    pub drops: u64,
    pub failures: u64,
}

struct LaneShared {
    side: CamSide,
    stop: AtomicBool,
    consecutive_failures: AtomicU32,
    counters: LaneCounters,
    reorder: Mutex<ReorderBuffer<Option<ObservationDetectedEvent>>>,
}

struct Lane {
    tx: crossbeam_channel::Sender<FrameHandle>,
    shared: Arc<LaneShared>,
    workers: Vec<std::thread::JoinHandle<()>>,
}

/// Bounded multi-worker detection with explicit backpressure.
///
/// The FrameCapturedEvent handler enqueues without blocking beyond
/// [`ENQUEUE_TIMEOUT`]; a full queue drops the frame and signals
/// [`Flow::Dropped`] back to the capture loop. Workers run the pluggable
/// [`Detector`] behind an error boundary and publish
/// [`ObservationDetectedEvent`]s strictly in frame_index order per camera
/// via the reorder stage.
pub struct DetectionService {
    bus: EventBus,
    error_bus: ErrorBus,
    lanes: Option<[Lane; 2]>,
    subscription: Option<SubscriptionId>,
    drain_timeout: Duration,
}

impl DetectionService {
    pub fn new(bus: EventBus) -> Self {
        let error_bus = bus.error_bus();
        Self {
            bus,
            error_bus,
            lanes: None,
            subscription: None,
            drain_timeout: Duration::from_secs(1),
        }
    }

    pub fn is_running(&self) -> bool {
        self.lanes.is_some()
    }

    pub fn start(&mut self, config: &DetectionConfig, detector: Arc<dyn Detector>) {
        assert!(self.lanes.is_none(), "detection service already started");
        self.drain_timeout = Duration::from_millis(config.drain_timeout_ms);

        let lanes: [Lane; 2] = CamSide::BOTH.map(|side| {
            let (tx, rx) = crossbeam_channel::bounded::<FrameHandle>(config.queue_depth);
            let shared = Arc::new(LaneShared {
                side,
                stop: AtomicBool::new(false),
                consecutive_failures: AtomicU32::new(0),
                counters: LaneCounters::default(),
                reorder: Mutex::new(ReorderBuffer::new()),
            });
            let workers = (0..config.workers_per_camera.max(1))
                .map(|i| {
                    let rx = rx.clone();
                    let shared = shared.clone();
                    let detector = detector.clone();
                    let bus = self.bus.clone();
                    let error_bus = self.error_bus.clone();
                    std::thread::Builder::new()
                        .name(format!("detect-{side}-{i}"))
                        .spawn(move || worker_loop(rx, shared, detector, bus, error_bus))
                        .expect("spawn detection worker")
                })
                .collect();
            Lane {
                tx,
                shared,
                workers,
            }
        });

        let txs = [lanes[0].tx.clone(), lanes[1].tx.clone()];
        let shareds = [lanes[0].shared.clone(), lanes[1].shared.clone()];
        let sub = self.bus.subscribe::<FrameCapturedEvent, _>(
            "detection",
            ErrorCategory::Detection,
            move |ev| {
                let side = ev.frame.cam;
                let i = side.idx();
                // Ticket first: per camera this handler runs on the single
                // capture thread, so tickets are issued in index order.
                shareds[i]
                    .reorder
                    .lock()
                    .unwrap()
                    .ticket(ev.frame.frame_index);
                match txs[i].send_timeout(ev.frame.clone(), ENQUEUE_TIMEOUT) {
                    Ok(()) => Ok(Flow::Handled),
                    Err(_) => {
                        shareds[i]
                            .reorder
                            .lock()
                            .unwrap()
                            .cancel(ev.frame.frame_index);
                        shareds[i].counters.drops.fetch_add(1, Ordering::Relaxed);
                        Ok(Flow::Dropped)
                    }
                }
            },
        );
        self.subscription = Some(sub);
        self.lanes = Some(lanes);
        info!("detection started");
    }

    /// Stop accepting frames, drain outstanding work (bounded by the
    /// configured drain timeout), then shut the pool down and join every
    /// worker. No worker thread survives this call.
    pub fn stop(&mut self) {
        let lanes = match self.lanes.take() {
            Some(l) => l,
            None => return,
        };
        if let Some(sub) = self.subscription.take() {
            self.bus.unsubscribe(sub);
        }

        let deadline = Instant::now() + self.drain_timeout;
        while Instant::now() < deadline {
            let outstanding: usize = lanes
                .iter()
                .map(|l| l.tx.len() + l.shared.reorder.lock().unwrap().in_flight())
                .sum();
            if outstanding == 0 {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }

        for lane in lanes {
            lane.shared.stop.store(true, Ordering::SeqCst);
            drop(lane.tx);
            for w in lane.workers {
                let _ = w.join();
            }
            debug!("detection lane {} joined", lane.shared.side);
        }
        info!("detection stopped");
    }

    pub fn stats(&self, side: CamSide) -> DetectionStats {
        match &self.lanes {
            Some(lanes) => {
                let c = &lanes[side.idx()].shared.counters;
                DetectionStats {
                    processed: c.processed.load(Ordering::Relaxed),
                    drops: c.drops.load(Ordering::Relaxed),
                    failures: c.failures.load(Ordering::Relaxed),
                }
            }
            None => DetectionStats::default(),
        }
    }
}

impl Drop for DetectionService {
    fn drop(&mut self) {
        self.stop();
    }
}

fn worker_loop(
    rx: crossbeam_channel::Receiver<FrameHandle>,
    shared: Arc<LaneShared>,
    detector: Arc<dyn Detector>,
    bus: EventBus,
    error_bus: ErrorBus,
) {
    loop {
        let frame = match rx.recv_timeout(RECV_TIMEOUT) {
            Ok(f) => f,
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => {
                if shared.stop.load(Ordering::SeqCst) {
                    return;
                }
                continue;
            }
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => return,
        };

        let result = match catch_unwind(AssertUnwindSafe(|| detector.detect(&frame))) {
            Ok(Ok(detections)) => {
                shared.consecutive_failures.store(0, Ordering::Relaxed);
                shared.counters.processed.fetch_add(1, Ordering::Relaxed);
                Some(ObservationDetectedEvent {
                    cam: frame.cam,
                    frame_index: frame.frame_index,
                    t_capture_ns: frame.t_capture_ns,
                    detections,
                })
            }
            Ok(Err(e)) => {
                report_failure(&shared, &error_bus, &format!("{e}"));
                None
            }
            Err(panic) => {
                let msg = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "detector panicked".to_string());
                report_failure(&shared, &error_bus, &msg);
                None
            }
        };

        // Publish while holding the reorder lock: releases from competing
        // workers of this lane stay in frame_index order.
        let mut reorder = shared.reorder.lock().unwrap();
        let released = reorder.complete(frame.frame_index, result);
        for (_idx, maybe_ev) in released {
            if let Some(ev) = maybe_ev {
                bus.publish(&ev);
            }
        }
    }
}

fn report_failure(shared: &LaneShared, error_bus: &ErrorBus, msg: &str) {
    shared.counters.failures.fetch_add(1, Ordering::Relaxed);
    let n = shared.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
    let severity = if n >= ESCALATION_LIMIT {
        ErrorSeverity::Critical
    } else {
        ErrorSeverity::Error
    };
    error_bus.report(
        ErrorCategory::Detection,
        severity,
        format!("detect/{}", shared.side),
        format!("detector failed ({n} consecutive): {msg}"),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use pitch_types::{Detection, Frame, PixFmt};
    use std::sync::Mutex as StdMutex;

    fn make_frame(side: CamSide, idx: u64) -> FrameCapturedEvent {
        FrameCapturedEvent {
            frame: Arc::new(Frame {
                cam: side,
                frame_index: idx,
                t_capture_ns: idx as i64 * 1_000_000,
                width: 4,
                height: 4,
                stride: 4,
                pixfmt: PixFmt::Mono8,
                data: vec![0; 16],
            }),
        }
    }

    fn one_detection(frame: &Frame) -> Vec<Detection> {
        vec![Detection {
            cam: frame.cam,
            frame_index: frame.frame_index,
            x: 1.0,
            y: 1.0,
            bbox: None,
            confidence: 1.0,
            t_capture_ns: frame.t_capture_ns,
        }]
    }

    fn collect_observations(bus: &EventBus) -> Arc<StdMutex<Vec<(CamSide, u64)>>> {
        let seen = Arc::new(StdMutex::new(Vec::new()));
        {
            let seen = seen.clone();
            bus.subscribe_infallible::<ObservationDetectedEvent, _>(
                "collect",
                ErrorCategory::Detection,
                move |ev| {
                    seen.lock().unwrap().push((ev.cam, ev.frame_index));
                },
            );
        }
        seen
    }

    fn wait_for<F: Fn() -> bool>(cond: F, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        cond()
    }

    #[test]
    fn publishes_in_frame_index_order_with_two_workers() {
        let bus = EventBus::new();
        let seen = collect_observations(&bus);
        let mut svc = DetectionService::new(bus.clone());
        // Even frames take much longer than odd frames: with two workers
        // frame 1 finishes before frame 0 and must be held back.
        let detector = move |frame: &Frame| -> crate::DetectResult {
            if frame.frame_index % 2 == 0 {
                std::thread::sleep(Duration::from_millis(40));
            }
            Ok(one_detection(frame))
        };
        svc.start(
            &DetectionConfig {
                queue_depth: 16,
                workers_per_camera: 2,
                drain_timeout_ms: 2000,
            },
            Arc::new(detector),
        );
        for idx in 0..8u64 {
            bus.publish(&make_frame(CamSide::Left, idx));
        }
        assert!(wait_for(
            || seen.lock().unwrap().len() == 8,
            Duration::from_secs(3)
        ));
        svc.stop();
        let seen = seen.lock().unwrap();
        let indices: Vec<u64> = seen.iter().map(|(_, i)| *i).collect();
        assert_eq!(indices, (0..8).collect::<Vec<u64>>());
    }

    #[test]
    fn full_queue_drops_and_signals_backpressure() {
        let bus = EventBus::new();
        let seen = collect_observations(&bus);
        let mut svc = DetectionService::new(bus.clone());
        let detector = move |frame: &Frame| -> crate::DetectResult {
            std::thread::sleep(Duration::from_millis(60));
            Ok(one_detection(frame))
        };
        svc.start(
            &DetectionConfig {
                queue_depth: 1,
                workers_per_camera: 1,
                drain_timeout_ms: 3000,
            },
            Arc::new(detector),
        );
        let mut dropped = 0;
        for idx in 0..6u64 {
            let outcome = bus.publish(&make_frame(CamSide::Right, idx));
            dropped += outcome.dropped;
        }
        assert!(dropped > 0, "expected at least one drop");
        assert!(svc.stats(CamSide::Right).drops > 0);
        svc.stop();
        let seen = seen.lock().unwrap();
        // Whatever made it through is still strictly increasing.
        for pair in seen.windows(2) {
            assert!(pair[1].1 > pair[0].1);
        }
    }

    #[test]
    fn detector_failures_escalate_to_critical() {
        let bus = EventBus::new();
        let errors = Arc::new(StdMutex::new(Vec::new()));
        {
            let errors = errors.clone();
            bus.error_bus().subscribe_errors("collect", move |ev| {
                errors.lock().unwrap().push(ev.severity);
            });
        }
        let mut svc = DetectionService::new(bus.clone());
        let detector =
            move |_frame: &Frame| -> crate::DetectResult { Err("no ball model loaded".into()) };
        svc.start(
            &DetectionConfig {
                queue_depth: 16,
                workers_per_camera: 1,
                drain_timeout_ms: 2000,
            },
            Arc::new(detector),
        );
        for idx in 0..12u64 {
            bus.publish(&make_frame(CamSide::Left, idx));
        }
        assert!(wait_for(
            || errors.lock().unwrap().len() == 12,
            Duration::from_secs(3)
        ));
        svc.stop();
        let errors = errors.lock().unwrap();
        assert_eq!(errors[0], ErrorSeverity::Error);
        assert_eq!(errors[8], ErrorSeverity::Error);
        // The 10th consecutive failure and later escalate.
        assert_eq!(errors[9], ErrorSeverity::Critical);
        assert_eq!(errors[11], ErrorSeverity::Critical);
    }

    #[test]
    fn a_success_resets_the_escalation_counter() {
        let bus = EventBus::new();
        let errors = Arc::new(StdMutex::new(Vec::new()));
        {
            let errors = errors.clone();
            bus.error_bus().subscribe_errors("collect", move |ev| {
                errors.lock().unwrap().push(ev.severity);
            });
        }
        let mut svc = DetectionService::new(bus.clone());
        // Frame 5 succeeds, everything else fails.
        let detector = move |frame: &Frame| -> crate::DetectResult {
            if frame.frame_index == 5 {
                Ok(Vec::new())
            } else {
                Err("blurred".into())
            }
        };
        svc.start(
            &DetectionConfig {
                queue_depth: 32,
                workers_per_camera: 1,
                drain_timeout_ms: 2000,
            },
            Arc::new(detector),
        );
        for idx in 0..15u64 {
            bus.publish(&make_frame(CamSide::Left, idx));
        }
        assert!(wait_for(
            || errors.lock().unwrap().len() == 14,
            Duration::from_secs(3)
        ));
        svc.stop();
        // 5 failures, one success, then 9 more failures: the counter never
        // reaches the escalation limit.
        assert!(errors
            .lock()
            .unwrap()
            .iter()
            .all(|s| *s == ErrorSeverity::Error));
    }

    #[test]
    fn panicking_detector_is_contained() {
        let bus = EventBus::new();
        let seen = collect_observations(&bus);
        let mut svc = DetectionService::new(bus.clone());
        let detector = move |frame: &Frame| -> crate::DetectResult {
            if frame.frame_index == 0 {
                panic!("index out of bounds in model")
            }
            Ok(one_detection(frame))
        };
        svc.start(&DetectionConfig::default(), Arc::new(detector));
        bus.publish(&make_frame(CamSide::Left, 0));
        bus.publish(&make_frame(CamSide::Left, 1));
        assert!(wait_for(
            || seen.lock().unwrap().len() == 1,
            Duration::from_secs(2)
        ));
        svc.stop();
        assert_eq!(seen.lock().unwrap()[0], (CamSide::Left, 1));
    }

    #[test]
    fn stop_drains_outstanding_frames() {
        let bus = EventBus::new();
        let seen = collect_observations(&bus);
        let mut svc = DetectionService::new(bus.clone());
        let detector = move |frame: &Frame| -> crate::DetectResult {
            std::thread::sleep(Duration::from_millis(20));
            Ok(one_detection(frame))
        };
        svc.start(
            &DetectionConfig {
                queue_depth: 8,
                workers_per_camera: 1,
                drain_timeout_ms: 2000,
            },
            Arc::new(detector),
        );
        for idx in 0..5u64 {
            bus.publish(&make_frame(CamSide::Left, idx));
        }
        svc.stop();
        assert_eq!(seen.lock().unwrap().len(), 5);
        // After stop, published frames go nowhere.
        bus.publish(&make_frame(CamSide::Left, 99));
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(seen.lock().unwrap().len(), 5);
    }
}
