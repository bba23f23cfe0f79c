//! Recording service: continuous session video, per-pitch clips with
//! pre/post-roll, manifests, and disk-space enforcement.
//!
//! All video writes happen synchronously in bus handlers, on the thread
//! that delivered the frame. The ordering argument of the pipeline
//! (a frame is recorded before capture moves on) depends on this, and it
//! keeps the writer handles free of locks beyond the session mutex.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use tracing::{debug, info, warn};

use clip_writer::VideoWriter;
use eventbus::{ErrorBus, EventBus, Flow, SubscriptionId};
use pitch_types::{
    app_version, pitch_dirname, CamSide, Codec, ErrorCategory, ErrorSeverity, FrameCapturedEvent,
    FrameHandle, PitchClipClosedEvent, PitchEndEvent, PitchManifest, PitchStartEvent,
    RecordingConfig, Resolution, SessionManifest, StereoObservation, MANIFEST_SCHEMA,
    SESSION_MANIFEST_FNAME,
};

mod disk;
mod ring;

pub use disk::{classify, DiskMonitor, FreeSpaceProbe, SpaceLevel, StatvfsProbe};
pub use ring::{pre_roll_capacity, PreRollRing};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("io error: {source}")]
    IoError {
        #[from]
        source: std::io::Error,
    },
    #[error("clip writer error: {source}")]
    ClipError {
        #[from]
        source: clip_writer::Error,
    },
    #[error("manifest error: {source}")]
    JsonError {
        #[from]
        source: serde_json::Error,
    },
    #[error("already recording")]
    AlreadyRecording,
    #[error("not recording")]
    NotRecording,
    #[error("free disk space critical ({free_gb:.1} GB); refusing to start")]
    DiskCritical { free_gb: f64 },
    #[error("no codec in the preference list could open both cameras")]
    AllCodecsFailed,
}

/// Descriptor returned by `stop_recording`.
#[derive(Debug, Clone)]
pub struct SessionSummary {
    pub session_id: String,
    pub session_dir: PathBuf,
    pub codec: Codec,
    pub pitch_count: u32,
    pub frames_written: u64,
}

struct PitchEndInfo {
    t_end_ns: i64,
    observations: Vec<StereoObservation>,
}

struct ActivePitch {
    index: u32,
    dir: PathBuf,
    writers: [Box<dyn VideoWriter>; 2],
    t0_ns: [Option<i64>; 2],
    pre_roll_honored_ms: u64,
    end: Option<PitchEndInfo>,
    post_done: [bool; 2],
    last_t_ns: i64,
}

struct ActiveSession {
    session_id: String,
    dir: PathBuf,
    codec: Codec,
    fps: f64,
    resolution: Resolution,
    created_utc: chrono::DateTime<chrono::Utc>,
    writers: [Box<dyn VideoWriter>; 2],
    write_failures: [u32; 2],
    t0_ns: Option<i64>,
    rings: [PreRollRing; 2],
    pitch: Option<ActivePitch>,
    pitch_count: u32,
    frames_written: u64,
}

struct RecInner {
    bus: EventBus,
    error_bus: ErrorBus,
    config: Mutex<RecordingConfig>,
    probe: Arc<dyn FreeSpaceProbe>,
    session: Mutex<Option<ActiveSession>>,
    monitor: Mutex<Option<DiskMonitor>>,
    finished: Mutex<Option<SessionSummary>>,
    on_auto_stop: Mutex<Option<Arc<dyn Fn() + Send + Sync>>>,
}

/// Owns session and pitch writers, the pre-roll rings and the disk
/// monitor. Subscribes to frame and pitch lifecycle events on creation.
pub struct RecordingService {
    bus: EventBus,
    inner: Arc<RecInner>,
    subs: Vec<SubscriptionId>,
}

impl RecordingService {
    pub fn new(bus: EventBus, config: RecordingConfig) -> Self {
        Self::with_probe(bus, config, Arc::new(StatvfsProbe))
    }

    /// Construct with an injected free-space probe (tests).
    pub fn with_probe(
        bus: EventBus,
        config: RecordingConfig,
        probe: Arc<dyn FreeSpaceProbe>,
    ) -> Self {
        let inner = Arc::new(RecInner {
            bus: bus.clone(),
            error_bus: bus.error_bus(),
            config: Mutex::new(config),
            probe,
            session: Mutex::new(None),
            monitor: Mutex::new(None),
            finished: Mutex::new(None),
            on_auto_stop: Mutex::new(None),
        });

        let mut subs = Vec::new();
        {
            let inner = inner.clone();
            subs.push(bus.subscribe::<FrameCapturedEvent, _>(
                "recording/frames",
                ErrorCategory::Recording,
                move |ev| {
                    RecInner::handle_frame(&inner, ev);
                    Ok(Flow::Handled)
                },
            ));
        }
        {
            let inner = inner.clone();
            subs.push(bus.subscribe::<PitchStartEvent, _>(
                "recording/pitch-start",
                ErrorCategory::Recording,
                move |ev| RecInner::handle_pitch_start(&inner, ev),
            ));
        }
        {
            let inner = inner.clone();
            subs.push(bus.subscribe_infallible::<PitchEndEvent, _>(
                "recording/pitch-end",
                ErrorCategory::Recording,
                move |ev| RecInner::handle_pitch_end(&inner, ev),
            ));
        }

        Self { bus, inner, subs }
    }

    /// Callback invoked after recording auto-stops (disk critical or
    /// sustained write failure). Runs outside the session lock.
    pub fn set_auto_stop_callback(&self, cb: Arc<dyn Fn() + Send + Sync>) {
        *self.inner.on_auto_stop.lock().unwrap() = Some(cb);
    }

    pub fn set_output_dir(&self, dir: PathBuf) {
        self.inner.config.lock().unwrap().output_dir = dir;
    }

    pub fn output_dir(&self) -> PathBuf {
        self.inner.config.lock().unwrap().output_dir.clone()
    }

    pub fn is_recording(&self) -> bool {
        self.inner.session.lock().unwrap().is_some()
    }

    /// Open the session: create the directory, check disk space, open
    /// both continuous writers on one shared codec, write the session
    /// manifest, and start the disk monitor.
    pub fn start_recording(
        &self,
        session_name: &str,
        fps: f64,
        resolution: Resolution,
    ) -> Result<PathBuf> {
        let cfg = self.inner.config.lock().unwrap().clone();
        let mut guard = self.inner.session.lock().unwrap();
        if guard.is_some() {
            return Err(Error::AlreadyRecording);
        }
        // A previous auto-stopped session may have left its monitor and
        // summary behind; clear them. The guard is released before the
        // join: the monitor thread itself takes this mutex.
        let old_monitor = self.inner.monitor.lock().unwrap().take();
        if let Some(mut m) = old_monitor {
            m.stop();
        }
        self.inner.finished.lock().unwrap().take();

        let created_utc = chrono::Utc::now();
        let local: chrono::DateTime<chrono::Local> = created_utc.with_timezone(&chrono::Local);
        let session_id = format!("session_{}_{}", local.format("%Y%m%d_%H%M%S"), session_name);
        let dir = cfg.output_dir.join(&session_id);
        std::fs::create_dir_all(&dir)?;

        // Immediate disk check: a session must not start below critical.
        let free = self.inner.probe.free_bytes(&dir)?;
        if classify(free, &cfg) == SpaceLevel::Critical {
            let _ = std::fs::remove_dir(&dir);
            return Err(Error::DiskCritical {
                free_gb: free as f64 / 1e9,
            });
        }

        let (writers, codec) = open_session_writers(&dir, &cfg, fps)?;
        let cap = pre_roll_capacity(cfg.pre_roll_ms, fps);
        let session = ActiveSession {
            session_id: session_id.clone(),
            dir: dir.clone(),
            codec,
            fps,
            resolution,
            created_utc,
            writers,
            write_failures: [0, 0],
            t0_ns: None,
            rings: [PreRollRing::new(cap), PreRollRing::new(cap)],
            pitch: None,
            pitch_count: 0,
            frames_written: 0,
        };
        write_session_manifest(&session)?;
        *guard = Some(session);
        drop(guard);

        let weak = Arc::downgrade(&self.inner);
        *self.inner.monitor.lock().unwrap() = Some(DiskMonitor::spawn(
            dir.clone(),
            cfg,
            self.inner.probe.clone(),
            self.inner.error_bus.clone(),
            Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    RecInner::auto_stop(&inner);
                }
            }),
        ));
        info!("recording started: {} ({})", session_id, codec);
        Ok(dir)
    }

    /// Close everything and return the bundle descriptor. Also succeeds
    /// (returning the stored summary) when the session already
    /// auto-stopped.
    pub fn stop_recording(&self) -> Result<SessionSummary> {
        let (summary, closed) = {
            let mut guard = self.inner.session.lock().unwrap();
            match guard.take() {
                Some(sess) => RecInner::finish_session(&self.inner, sess),
                None => match self.inner.finished.lock().unwrap().take() {
                    Some(s) => (s, None),
                    None => return Err(Error::NotRecording),
                },
            }
        };
        if let Some(ev) = closed {
            self.bus.publish(&ev);
        }
        let monitor = self.inner.monitor.lock().unwrap().take();
        if let Some(mut m) = monitor {
            m.stop();
        }
        info!(
            "recording stopped: {} ({} pitches, {} frames)",
            summary.session_id, summary.pitch_count, summary.frames_written
        );
        Ok(summary)
    }
}

impl Drop for RecordingService {
    fn drop(&mut self) {
        for sub in self.subs.drain(..) {
            self.bus.unsubscribe(sub);
        }
        let _ = self.stop_recording();
    }
}

impl RecInner {
    fn handle_frame(inner: &Arc<RecInner>, ev: &FrameCapturedEvent) {
        let (cfg_post_roll_ms, threshold) = {
            let cfg = inner.config.lock().unwrap();
            (cfg.post_roll_ms, cfg.write_failure_threshold)
        };
        let mut tripped = false;
        let mut closed: Option<PitchClipClosedEvent> = None;
        {
            let mut guard = inner.session.lock().unwrap();
            let sess = match guard.as_mut() {
                Some(s) => s,
                None => return,
            };
            let frame = &ev.frame;
            let i = frame.cam.idx();

            sess.rings[i].push(frame.clone());

            // Per-pitch writer, while a pitch is open.
            let mut close_now = false;
            if let Some(p) = sess.pitch.as_mut() {
                let in_post_roll_window = match &p.end {
                    None => true,
                    Some(end) => {
                        frame.t_capture_ns <= end.t_end_ns + cfg_post_roll_ms as i64 * 1_000_000
                    }
                };
                if in_post_roll_window {
                    write_pitch_frame(p, frame);
                } else {
                    p.post_done[i] = true;
                }
                close_now = p.post_done == [true, true];
            }
            if close_now {
                let p = sess.pitch.take().unwrap();
                closed = Some(close_pitch(inner, sess, p, cfg_post_roll_ms));
            }

            // Continuous session writer.
            let t0 = *sess.t0_ns.get_or_insert(frame.t_capture_ns);
            let pts = frame.t_capture_ns - t0;
            match sess.writers[i].write(frame, pts) {
                Ok(()) => {
                    sess.write_failures[i] = 0;
                    sess.frames_written += 1;
                }
                Err(e) => {
                    sess.write_failures[i] += 1;
                    warn!(
                        "session write failed for {} ({} consecutive): {e}",
                        frame.cam, sess.write_failures[i]
                    );
                    if sess.write_failures[i] >= threshold {
                        inner.error_bus.report(
                            ErrorCategory::Recording,
                            ErrorSeverity::Critical,
                            format!("recording/{}", frame.cam),
                            format!(
                                "{} consecutive write failures; stopping recording",
                                sess.write_failures[i]
                            ),
                        );
                        tripped = true;
                    }
                }
            }
        }
        // Publish outside the session lock: the analysis handler does
        // file IO of its own.
        if let Some(ev) = closed {
            inner.bus.publish(&ev);
        }
        if tripped {
            RecInner::auto_stop(inner);
        }
    }

    fn handle_pitch_start(
        inner: &Arc<RecInner>,
        ev: &PitchStartEvent,
    ) -> eventbus::HandlerResult {
        let mut guard = inner.session.lock().unwrap();
        let sess = match guard.as_mut() {
            Some(s) => s,
            None => return Ok(Flow::Handled), // capturing without recording
        };
        if sess.pitch.is_some() {
            warn!("pitch {} started while previous pitch still open", ev.pitch_index);
        }

        let dir = sess.dir.join(pitch_dirname(ev.pitch_index));
        let open = || -> Result<ActivePitch> {
            std::fs::create_dir_all(&dir)?;
            let ext = sess.codec.extension();
            let left =
                clip_writer::open_one(&dir.join(format!("left.{ext}")), sess.codec, sess.fps)?;
            let right =
                clip_writer::open_one(&dir.join(format!("right.{ext}")), sess.codec, sess.fps)?;
            Ok(ActivePitch {
                index: ev.pitch_index,
                dir: dir.clone(),
                writers: [left, right],
                t0_ns: [None, None],
                pre_roll_honored_ms: 0,
                end: None,
                post_done: [false, false],
                last_t_ns: ev.t_start_ns,
            })
        };
        let mut pitch = match open() {
            Ok(p) => p,
            Err(e) => {
                // Failing this handler makes the state machine retract the
                // pitch start and retry.
                inner.error_bus.report(
                    ErrorCategory::Recording,
                    ErrorSeverity::Error,
                    "recording/pitch",
                    format!("cannot open pitch writers: {e}"),
                );
                return Err(Box::new(e));
            }
        };

        // Drain the pre-roll rings, oldest first, preserving per-camera
        // interleave (each camera has its own file).
        let mut oldest_t: Option<i64> = None;
        for side in CamSide::BOTH {
            let i = side.idx();
            for frame in sess.rings[i].drain_oldest_first() {
                oldest_t = Some(oldest_t.map_or(frame.t_capture_ns, |t| t.min(frame.t_capture_ns)));
                write_pitch_frame(&mut pitch, &frame);
            }
        }
        if let Some(oldest) = oldest_t {
            let honored = (ev.t_start_ns - oldest).max(0) / 1_000_000;
            let configured = inner.config.lock().unwrap().pre_roll_ms;
            pitch.pre_roll_honored_ms = (honored as u64).min(configured);
        }
        debug!(
            "pitch {} recording to {} (pre-roll {} ms)",
            ev.pitch_index,
            dir.display(),
            pitch.pre_roll_honored_ms
        );
        sess.pitch = Some(pitch);
        Ok(Flow::Handled)
    }

    fn handle_pitch_end(inner: &Arc<RecInner>, ev: &PitchEndEvent) {
        let mut guard = inner.session.lock().unwrap();
        let sess = match guard.as_mut() {
            Some(s) => s,
            None => return,
        };
        match sess.pitch.as_mut() {
            Some(p) if p.index == ev.pitch_index => {
                p.end = Some(PitchEndInfo {
                    t_end_ns: ev.t_end_ns,
                    observations: ev.observations.clone(),
                });
            }
            _ => {
                debug!("pitch end {} without matching open pitch", ev.pitch_index);
            }
        }
    }

    /// Close the session from inside (disk critical or write failure).
    /// The registered callback runs after the lock is released.
    fn auto_stop(inner: &Arc<RecInner>) {
        let finished = {
            let mut guard = inner.session.lock().unwrap();
            guard.take().map(|sess| RecInner::finish_session(inner, sess))
        };
        if let Some((summary, closed)) = finished {
            if let Some(ev) = closed {
                inner.bus.publish(&ev);
            }
            *inner.finished.lock().unwrap() = Some(summary);
            // Signal (but do not join: this may be the monitor thread
            // itself) so the monitor winds down.
            if let Some(m) = inner.monitor.lock().unwrap().as_ref() {
                m.signal();
            }
            let cb = inner.on_auto_stop.lock().unwrap().clone();
            if let Some(cb) = cb {
                cb();
            }
        }
    }

    fn finish_session(
        inner: &Arc<RecInner>,
        mut sess: ActiveSession,
    ) -> (SessionSummary, Option<PitchClipClosedEvent>) {
        let post_roll_ms = inner.config.lock().unwrap().post_roll_ms;
        let closed = sess
            .pitch
            .take()
            // Partial pitch at teardown: close and keep it on disk.
            .map(|p| close_pitch(inner, &mut sess, p, post_roll_ms));
        for w in sess.writers.iter_mut() {
            if let Err(e) = w.finish() {
                warn!("closing session writer failed: {e}");
            }
        }
        if let Err(e) = write_session_manifest(&sess) {
            warn!("rewriting session manifest failed: {e}");
        }
        let summary = SessionSummary {
            session_id: sess.session_id,
            session_dir: sess.dir,
            codec: sess.codec,
            pitch_count: sess.pitch_count,
            frames_written: sess.frames_written,
        };
        (summary, closed)
    }
}

fn write_pitch_frame(pitch: &mut ActivePitch, frame: &FrameHandle) {
    let i = frame.cam.idx();
    let t0 = *pitch.t0_ns[i].get_or_insert(frame.t_capture_ns);
    if let Err(e) = pitch.writers[i].write(frame, frame.t_capture_ns - t0) {
        warn!("pitch write failed for {}: {e}", frame.cam);
        return;
    }
    pitch.last_t_ns = pitch.last_t_ns.max(frame.t_capture_ns);
}

fn close_pitch(
    inner: &Arc<RecInner>,
    sess: &mut ActiveSession,
    mut pitch: ActivePitch,
    post_roll_ms: u64,
) -> PitchClipClosedEvent {
    for w in pitch.writers.iter_mut() {
        if let Err(e) = w.finish() {
            warn!("closing pitch writer failed: {e}");
        }
    }
    let (observations, post_roll_honored_ms) = match pitch.end.take() {
        Some(end) => {
            let honored = ((pitch.last_t_ns - end.t_end_ns).max(0) / 1_000_000) as u64;
            (end.observations, honored.min(post_roll_ms))
        }
        None => (Vec::new(), 0),
    };
    let manifest = PitchManifest {
        session_id: sess.session_id.clone(),
        pitch_id: pitch.index,
        created_utc: chrono::Utc::now(),
        app_version: app_version().to_string(),
        schema_version: MANIFEST_SCHEMA,
        codec: sess.codec,
        fps: sess.fps,
        resolution: sess.resolution,
        pre_roll_ms: pitch.pre_roll_honored_ms,
        post_roll_ms: post_roll_honored_ms,
        observations,
        analysis: None,
    };
    let path = pitch.dir.join(pitch_types::PITCH_MANIFEST_FNAME);
    match std::fs::File::create(&path) {
        Ok(f) => {
            if let Err(e) = serde_json::to_writer_pretty(std::io::BufWriter::new(f), &manifest) {
                inner.error_bus.report(
                    ErrorCategory::Recording,
                    ErrorSeverity::Error,
                    "recording/pitch",
                    format!("pitch manifest write failed: {e}"),
                );
            }
        }
        Err(e) => {
            inner.error_bus.report(
                ErrorCategory::Recording,
                ErrorSeverity::Error,
                "recording/pitch",
                format!("pitch manifest create failed: {e}"),
            );
        }
    }
    sess.pitch_count += 1;
    info!("pitch {} clip closed", pitch.index);
    PitchClipClosedEvent {
        pitch_index: pitch.index,
        manifest_path: path,
    }
}

fn open_session_writers(
    dir: &std::path::Path,
    cfg: &RecordingConfig,
    fps: f64,
) -> Result<([Box<dyn VideoWriter>; 2], Codec)> {
    // Both cameras must land on the same codec: a right-side failure
    // releases the left writer and retries the whole pair on the next
    // codec in the chain.
    for &codec in &cfg.codec_preference {
        let ext = codec.extension();
        let left_path = dir.join(format!("session_left.{ext}"));
        let right_path = dir.join(format!("session_right.{ext}"));
        let left = match clip_writer::open_one(&left_path, codec, fps) {
            Ok(w) => w,
            Err(e) => {
                warn!("codec {codec} failed for left session writer: {e}");
                let _ = std::fs::remove_file(&left_path);
                continue;
            }
        };
        match clip_writer::open_one(&right_path, codec, fps) {
            Ok(right) => return Ok(([left, right], codec)),
            Err(e) => {
                warn!("codec {codec} failed for right session writer: {e}");
                drop(left);
                let _ = std::fs::remove_file(&left_path);
                let _ = std::fs::remove_file(&right_path);
            }
        }
    }
    Err(Error::AllCodecsFailed)
}

fn write_session_manifest(sess: &ActiveSession) -> Result<()> {
    let manifest = SessionManifest {
        session_id: sess.session_id.clone(),
        created_utc: sess.created_utc,
        app_version: app_version().to_string(),
        schema_version: MANIFEST_SCHEMA,
        codec: sess.codec,
        fps: sess.fps,
        resolution: sess.resolution,
        num_pitches: sess.pitch_count,
    };
    let f = std::fs::File::create(sess.dir.join(SESSION_MANIFEST_FNAME))?;
    serde_json::to_writer_pretty(std::io::BufWriter::new(f), &manifest)?;
    Ok(())
}
