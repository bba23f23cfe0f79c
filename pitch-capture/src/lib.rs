//! Frame capture service.
//!
//! Owns the two camera drivers. One grab thread per camera reads frames,
//! validates them against the dimensions and pixel format negotiated at
//! open, stamps them with the monotonic clock and a per-camera frame
//! index, and publishes [`FrameCapturedEvent`]s on the bus.
//!
//! Read failures are counted; after [`CONSECUTIVE_ERROR_LIMIT`] in a row
//! the camera is reported on the error bus and re-opened with backoff.
//! Downstream queue-full signals (see [`eventbus::Flow::Dropped`]) are
//! counted per camera and surfaced as throttled [`FrameDropEvent`]s; the
//! grab loop itself never stalls on a slow consumer.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use cam_iface::{Camera, CameraModule};
use eventbus::{ErrorBus, EventBus};
use pitch_types::{
    monotonic_now_ns, CamSide, CameraConfig, DropReason, ErrorCategory, ErrorSeverity, Frame,
    FrameCapturedEvent, FrameDropEvent, FrameHandle, PixFmt,
};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("camera \"{name}\" ({side}) failed to open: {source}")]
    CameraOpenError {
        side: CamSide,
        name: String,
        source: cam_iface::Error,
    },
    #[error("capture already running")]
    AlreadyCapturing,
    #[error("capture not running")]
    NotCapturing,
}

/// Consecutive read failures before the camera is reported and re-opened.
pub const CONSECUTIVE_ERROR_LIMIT: u32 = 10;

/// Open retry policy: attempts and backoff between them.
const OPEN_ATTEMPTS: u32 = 3;
const OPEN_BACKOFF: Duration = Duration::from_millis(100);

/// Bound on a single driver read.
const READ_TIMEOUT: Duration = Duration::from_millis(100);

/// Sleep after a failed read before retrying.
const READ_FAILURE_SLEEP: Duration = Duration::from_millis(10);

/// Pause between reconnection rounds once a camera is lost.
const RECONNECT_PAUSE: Duration = Duration::from_millis(500);

/// Per-service join timeout on stop.
const JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Minimum interval between FrameDropEvents per camera.
const DROP_EVENT_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Default)]
struct CamCounters {
    frames: AtomicU64,
    drops: AtomicU64,
    read_errors: AtomicU64,
    reconnects: AtomicU64,
}

/// Snapshot of per-camera capture counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CamStats {
    pub frames: u64,
    pub drops: u64,
    pub read_errors: u64,
    pub reconnects: u64,
}

struct Shared {
    stop: AtomicBool,
    preview: Mutex<[Option<FrameHandle>; 2]>,
    counters: [CamCounters; 2],
}

struct GrabThread {
    side: CamSide,
    join: std::thread::JoinHandle<()>,
    done_rx: crossbeam_channel::Receiver<()>,
}

pub struct CaptureService {
    bus: EventBus,
    error_bus: ErrorBus,
    shared: Arc<Shared>,
    threads: Vec<GrabThread>,
    capturing: bool,
}

impl CaptureService {
    pub fn new(bus: EventBus) -> Self {
        let error_bus = bus.error_bus();
        Self {
            bus,
            error_bus,
            shared: Arc::new(Shared {
                stop: AtomicBool::new(false),
                preview: Mutex::new([None, None]),
                counters: [CamCounters::default(), CamCounters::default()],
            }),
            threads: Vec::new(),
            capturing: false,
        }
    }

    /// Open both cameras and start the grab threads.
    ///
    /// Either camera failing to open (after retries) fails the whole call;
    /// an already-opened left camera is released before returning.
    pub fn start<M>(
        &mut self,
        config: &CameraConfig,
        module: M,
        left_id: &str,
        right_id: &str,
    ) -> Result<()>
    where
        M: CameraModule + Send + 'static,
        M::CameraType: 'static,
    {
        if self.capturing {
            return Err(Error::AlreadyCapturing);
        }
        let module = Arc::new(Mutex::new(module));

        let left = open_with_retry(&module, CamSide::Left, left_id, config)?;
        let right = match open_with_retry(&module, CamSide::Right, right_id, config) {
            Ok(cam) => cam,
            Err(e) => {
                // `left` is dropped here, releasing the driver handle.
                return Err(e);
            }
        };

        self.shared.stop.store(false, Ordering::SeqCst);
        *self.shared.preview.lock().unwrap() = [None, None];

        for (side, cam, id) in [
            (CamSide::Left, left, left_id.to_string()),
            (CamSide::Right, right, right_id.to_string()),
        ] {
            let (done_tx, done_rx) = crossbeam_channel::bounded::<()>(1);
            let shared = self.shared.clone();
            let bus = self.bus.clone();
            let error_bus = self.error_bus.clone();
            let module = module.clone();
            let config = config.clone();
            let join = std::thread::Builder::new()
                .name(format!("grab-{side}"))
                .spawn(move || {
                    grab_loop(side, cam, id, module, config, shared, bus, error_bus);
                    let _ = done_tx.send(());
                })
                .expect("spawn grab thread");
            self.threads.push(GrabThread {
                side,
                join,
                done_rx,
            });
        }
        self.capturing = true;
        info!("capture started ({left_id} / {right_id})");
        Ok(())
    }

    /// Signal the grab threads and join them, bounded by [`JOIN_TIMEOUT`]
    /// per thread. A thread exceeding the timeout is reported on the
    /// error bus and abandoned; driver handles it owns are released when
    /// it eventually exits.
    pub fn stop(&mut self) -> Result<()> {
        if !self.capturing {
            return Err(Error::NotCapturing);
        }
        self.shared.stop.store(true, Ordering::SeqCst);
        for t in self.threads.drain(..) {
            match t.done_rx.recv_timeout(JOIN_TIMEOUT) {
                Ok(()) => {
                    let _ = t.join.join();
                    debug!("grab-{} joined", t.side);
                }
                Err(_) => {
                    self.error_bus.report(
                        ErrorCategory::Shutdown,
                        ErrorSeverity::Error,
                        format!("capture/{}", t.side),
                        "grab thread did not exit within join timeout",
                    );
                }
            }
        }
        self.capturing = false;
        info!("capture stopped");
        Ok(())
    }

    pub fn is_capturing(&self) -> bool {
        self.capturing
    }

    /// Most recently captured frame pair.
    pub fn preview_frames(&self) -> (Option<FrameHandle>, Option<FrameHandle>) {
        let guard = self.shared.preview.lock().unwrap();
        (guard[0].clone(), guard[1].clone())
    }

    pub fn stats(&self, side: CamSide) -> CamStats {
        let c = &self.shared.counters[side.idx()];
        CamStats {
            frames: c.frames.load(Ordering::Relaxed),
            drops: c.drops.load(Ordering::Relaxed),
            read_errors: c.read_errors.load(Ordering::Relaxed),
            reconnects: c.reconnects.load(Ordering::Relaxed),
        }
    }
}

impl Drop for CaptureService {
    fn drop(&mut self) {
        if self.capturing {
            let _ = self.stop();
        }
    }
}

fn open_with_retry<M>(
    module: &Arc<Mutex<M>>,
    side: CamSide,
    name: &str,
    config: &CameraConfig,
) -> Result<M::CameraType>
where
    M: CameraModule,
{
    let mut last_err = None;
    for attempt in 0..OPEN_ATTEMPTS {
        if attempt > 0 {
            std::thread::sleep(OPEN_BACKOFF);
        }
        let mut guard = module.lock().unwrap();
        match guard.camera(name) {
            Ok(mut cam) => match configure(&mut cam, config) {
                Ok(()) => return Ok(cam),
                Err(e) => {
                    warn!("camera \"{name}\" configure failed (attempt {attempt}): {e}");
                    last_err = Some(e);
                }
            },
            Err(e) => {
                warn!("camera \"{name}\" open failed (attempt {attempt}): {e}");
                last_err = Some(e);
            }
        }
    }
    Err(Error::CameraOpenError {
        side,
        name: name.to_string(),
        source: last_err.unwrap_or(cam_iface::Error::Timeout),
    })
}

fn configure<C: Camera>(cam: &mut C, config: &CameraConfig) -> cam_iface::Result<()> {
    let pixfmt = if config.color_mode {
        PixFmt::Rgb8
    } else {
        config.pixfmt
    };
    cam.set_pixel_format(pixfmt)?;
    cam.set_acquisition_frame_rate(config.fps)?;
    cam.acquisition_start()?;
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn grab_loop<M>(
    side: CamSide,
    mut cam: M::CameraType,
    cam_id: String,
    module: Arc<Mutex<M>>,
    config: CameraConfig,
    shared: Arc<Shared>,
    bus: EventBus,
    error_bus: ErrorBus,
) where
    M: CameraModule,
{
    let source = format!("capture/{side}");
    // Validation targets come from the driver, not the config: the open
    // path already negotiated what the camera actually delivers.
    let (mut want_w, mut want_h, mut want_fmt) = match negotiated(&cam) {
        Ok(v) => v,
        Err(e) => {
            error_bus.report(
                ErrorCategory::Camera,
                ErrorSeverity::Error,
                &source,
                format!("cannot query camera geometry: {e}"),
            );
            return;
        }
    };

    let counters = &shared.counters[side.idx()];
    let mut frame_index: u64 = 0;
    let mut last_t_ns: i64 = 0;
    let mut consecutive_errors: u32 = 0;
    let mut last_drop_event: Option<Instant> = None;

    while !shared.stop.load(Ordering::SeqCst) {
        match cam.next_frame(READ_TIMEOUT) {
            Ok(raw) => {
                if raw.width != want_w || raw.height != want_h || raw.pixfmt != want_fmt {
                    counters.read_errors.fetch_add(1, Ordering::Relaxed);
                    consecutive_errors += 1;
                    warn!(
                        "{source}: invalid frame {}x{} {} (expected {}x{} {})",
                        raw.width, raw.height, raw.pixfmt, want_w, want_h, want_fmt
                    );
                } else {
                    consecutive_errors = 0;
                    let t = monotonic_now_ns().max(last_t_ns);
                    last_t_ns = t;
                    let frame: FrameHandle = Arc::new(Frame {
                        cam: side,
                        frame_index,
                        t_capture_ns: t,
                        width: raw.width,
                        height: raw.height,
                        stride: raw.stride,
                        pixfmt: raw.pixfmt,
                        data: raw.data,
                    });
                    frame_index += 1;
                    counters.frames.fetch_add(1, Ordering::Relaxed);
                    shared.preview.lock().unwrap()[side.idx()] = Some(frame.clone());

                    let outcome = bus.publish(&FrameCapturedEvent { frame });
                    if outcome.dropped > 0 {
                        let total =
                            counters.drops.fetch_add(outcome.dropped as u64, Ordering::Relaxed)
                                + outcome.dropped as u64;
                        let due = last_drop_event
                            .map(|at| at.elapsed() >= DROP_EVENT_INTERVAL)
                            .unwrap_or(true);
                        if due {
                            last_drop_event = Some(Instant::now());
                            bus.publish(&FrameDropEvent {
                                cam: side,
                                dropped_count: total,
                                reason: DropReason::QueueFull,
                            });
                        }
                    }
                    continue;
                }
            }
            Err(e) => {
                counters.read_errors.fetch_add(1, Ordering::Relaxed);
                consecutive_errors += 1;
                debug!("{source}: read failed ({consecutive_errors} consecutive): {e}");
            }
        }

        // Failure path (read error or invalid frame).
        std::thread::sleep(READ_FAILURE_SLEEP);
        if consecutive_errors >= CONSECUTIVE_ERROR_LIMIT {
            let metadata = std::collections::BTreeMap::from([
                ("camera_id".to_string(), cam_id.clone()),
                (
                    "consecutive_failures".to_string(),
                    consecutive_errors.to_string(),
                ),
            ]);
            error_bus.report_with(
                ErrorCategory::Camera,
                ErrorSeverity::Error,
                &source,
                format!("{consecutive_errors} consecutive read failures; reconnecting"),
                metadata,
            );
            let _ = cam.acquisition_stop();
            match reconnect(&module, side, &cam_id, &config, &shared) {
                Some(new_cam) => {
                    cam = new_cam;
                    if let Ok(v) = negotiated(&cam) {
                        (want_w, want_h, want_fmt) = v;
                    }
                    consecutive_errors = 0;
                    counters.reconnects.fetch_add(1, Ordering::Relaxed);
                    info!("{source}: reconnected");
                }
                None => return, // stop requested during reconnection
            }
        }
    }
    let _ = cam.acquisition_stop();
}

fn negotiated<C: Camera>(cam: &C) -> cam_iface::Result<(u32, u32, PixFmt)> {
    Ok((cam.width()?, cam.height()?, cam.pixel_format()?))
}

/// Re-open loop; returns `None` when a stop was requested before success.
fn reconnect<M>(
    module: &Arc<Mutex<M>>,
    side: CamSide,
    cam_id: &str,
    config: &CameraConfig,
    shared: &Arc<Shared>,
) -> Option<M::CameraType>
where
    M: CameraModule,
{
    loop {
        if shared.stop.load(Ordering::SeqCst) {
            return None;
        }
        match open_with_retry(module, side, cam_id, config) {
            Ok(cam) => return Some(cam),
            Err(e) => {
                debug!("reconnect {side}: {e}");
            }
        }
        // Sleep in small steps so stop stays prompt.
        let mut waited = Duration::ZERO;
        while waited < RECONNECT_PAUSE {
            if shared.stop.load(Ordering::SeqCst) {
                return None;
            }
            std::thread::sleep(Duration::from_millis(50));
            waited += Duration::from_millis(50);
        }
    }
}
