//! Deterministic synthetic camera backend.
//!
//! Frames are rendered on demand: a flat background with an optional
//! bright circular blob following a scripted path. Read failures, open
//! failures and end-of-stream are scriptable so the capture service's
//! retry and reconnect paths can be exercised without hardware.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use pitch_types::PixFmt;

use crate::{Camera, CameraInfo, CameraModule, Error, RawFrame, Result};

#[derive(Debug, Clone)]
pub enum BlobPath {
    /// No blob; background only.
    None,
    /// Blob at `(x0 + i*dx, y0 + i*dy)` for frame index `i`.
    Linear { x0: f64, y0: f64, dx: f64, dy: f64 },
    /// Explicit per-frame positions; frames not listed have no blob.
    Explicit(BTreeMap<u64, (f64, f64)>),
}

impl BlobPath {
    fn pos(&self, frame_index: u64) -> Option<(f64, f64)> {
        match self {
            BlobPath::None => None,
            BlobPath::Linear { x0, y0, dx, dy } => {
                let i = frame_index as f64;
                Some((x0 + i * dx, y0 + i * dy))
            }
            BlobPath::Explicit(map) => map.get(&frame_index).copied(),
        }
    }
}

/// Behavior script for one simulated camera.
#[derive(Debug, Clone)]
pub struct SimScript {
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    pub pixfmt: PixFmt,
    pub background: u8,
    pub blob_value: u8,
    pub blob_radius: f64,
    pub blob: BlobPath,
    fail_reads: HashSet<u64>,
    fail_opens: u32,
    max_frames: Option<u64>,
    realtime: bool,
}

impl Default for SimScript {
    fn default() -> Self {
        Self {
            width: 64,
            height: 48,
            fps: 60.0,
            pixfmt: PixFmt::Mono8,
            background: 10,
            blob_value: 255,
            blob_radius: 3.0,
            blob: BlobPath::None,
            fail_reads: HashSet::new(),
            fail_opens: 0,
            max_frames: None,
            realtime: false,
        }
    }
}

impl SimScript {
    pub fn size(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    pub fn fps(mut self, fps: f64) -> Self {
        self.fps = fps;
        self
    }

    pub fn pixfmt(mut self, pixfmt: PixFmt) -> Self {
        self.pixfmt = pixfmt;
        self
    }

    pub fn blob_linear(mut self, x0: f64, y0: f64, dx: f64, dy: f64) -> Self {
        self.blob = BlobPath::Linear { x0, y0, dx, dy };
        self
    }

    pub fn blob_explicit(mut self, positions: BTreeMap<u64, (f64, f64)>) -> Self {
        self.blob = BlobPath::Explicit(positions);
        self
    }

    /// Reads of these frame indices fail with a read error.
    pub fn fail_reads(mut self, indices: impl IntoIterator<Item = u64>) -> Self {
        self.fail_reads = indices.into_iter().collect();
        self
    }

    /// The first `n` open attempts fail.
    pub fn fail_opens(mut self, n: u32) -> Self {
        self.fail_opens = n;
        self
    }

    /// Reads past `n` frames time out.
    pub fn limit_frames(mut self, n: u64) -> Self {
        self.max_frames = Some(n);
        self
    }

    /// Pace `next_frame` to the configured fps instead of returning
    /// immediately.
    pub fn realtime(mut self, yes: bool) -> Self {
        self.realtime = yes;
        self
    }
}

struct SimEntry {
    script: SimScript,
    remaining_open_failures: u32,
    /// Shared across opens of the same camera: device time marches on
    /// over a reconnect.
    read_counter: Arc<AtomicU64>,
}

/// A [`CameraModule`] holding scripted cameras.
#[derive(Default)]
pub struct SimCameraModule {
    cameras: BTreeMap<String, SimEntry>,
}

impl SimCameraModule {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_camera(mut self, name: impl Into<String>, script: SimScript) -> Self {
        let remaining_open_failures = script.fail_opens;
        self.cameras.insert(
            name.into(),
            SimEntry {
                script,
                remaining_open_failures,
                read_counter: Arc::new(AtomicU64::new(0)),
            },
        );
        self
    }
}

struct SimInfo {
    name: String,
}

impl CameraInfo for SimInfo {
    fn name(&self) -> &str {
        &self.name
    }
    fn serial(&self) -> &str {
        "sim-0"
    }
    fn model(&self) -> &str {
        "simcam"
    }
    fn vendor(&self) -> &str {
        "pitchtrack"
    }
}

impl CameraModule for SimCameraModule {
    type CameraType = SimCamera;

    fn name(&self) -> &str {
        "sim"
    }

    fn camera_infos(&self) -> Result<Vec<Box<dyn CameraInfo>>> {
        Ok(self
            .cameras
            .keys()
            .map(|name| Box::new(SimInfo { name: name.clone() }) as Box<dyn CameraInfo>)
            .collect())
    }

    fn camera(&mut self, name: &str) -> Result<SimCamera> {
        let entry = self
            .cameras
            .get_mut(name)
            .ok_or_else(|| Error::CameraNotFound(name.to_string()))?;
        if entry.remaining_open_failures > 0 {
            entry.remaining_open_failures -= 1;
            return Err(Error::OpenFailed(format!(
                "simulated open failure for \"{name}\""
            )));
        }
        Ok(SimCamera {
            name: name.to_string(),
            script: entry.script.clone(),
            started: false,
            read_counter: entry.read_counter.clone(),
            last_frame_at: None,
        })
    }
}

pub struct SimCamera {
    name: String,
    script: SimScript,
    started: bool,
    read_counter: Arc<AtomicU64>,
    last_frame_at: Option<Instant>,
}

impl SimCamera {
    fn render(&self, frame_index: u64) -> RawFrame {
        let s = &self.script;
        let bpp = s.pixfmt.bytes_per_pixel();
        let stride = s.width as usize * bpp;
        let mut data = vec![s.background; stride * s.height as usize];
        if let Some((cx, cy)) = s.blob.pos(frame_index) {
            let r = s.blob_radius;
            let x_lo = ((cx - r).floor().max(0.0)) as i64;
            let x_hi = ((cx + r).ceil().min(f64::from(s.width) - 1.0)) as i64;
            let y_lo = ((cy - r).floor().max(0.0)) as i64;
            let y_hi = ((cy + r).ceil().min(f64::from(s.height) - 1.0)) as i64;
            for py in y_lo..=y_hi {
                for px in x_lo..=x_hi {
                    let dx = px as f64 - cx;
                    let dy = py as f64 - cy;
                    if dx * dx + dy * dy <= r * r {
                        let off = py as usize * stride + px as usize * bpp;
                        for b in &mut data[off..off + bpp] {
                            *b = s.blob_value;
                        }
                    }
                }
            }
        }
        RawFrame {
            width: s.width,
            height: s.height,
            stride: stride as u32,
            pixfmt: s.pixfmt,
            data,
        }
    }
}

impl CameraInfo for SimCamera {
    fn name(&self) -> &str {
        &self.name
    }
    fn serial(&self) -> &str {
        "sim-0"
    }
    fn model(&self) -> &str {
        "simcam"
    }
    fn vendor(&self) -> &str {
        "pitchtrack"
    }
}

impl Camera for SimCamera {
    fn width(&self) -> Result<u32> {
        Ok(self.script.width)
    }

    fn height(&self) -> Result<u32> {
        Ok(self.script.height)
    }

    fn pixel_format(&self) -> Result<PixFmt> {
        Ok(self.script.pixfmt)
    }

    fn set_pixel_format(&mut self, pixel_format: PixFmt) -> Result<()> {
        self.script.pixfmt = pixel_format;
        Ok(())
    }

    fn acquisition_frame_rate(&self) -> Result<f64> {
        Ok(self.script.fps)
    }

    fn set_acquisition_frame_rate(&mut self, value: f64) -> Result<()> {
        self.script.fps = value;
        Ok(())
    }

    fn acquisition_start(&mut self) -> Result<()> {
        self.started = true;
        Ok(())
    }

    fn acquisition_stop(&mut self) -> Result<()> {
        self.started = false;
        Ok(())
    }

    fn next_frame(&mut self, timeout: Duration) -> Result<RawFrame> {
        if !self.started {
            return Err("acquisition not started".into());
        }
        if let Some(max) = self.script.max_frames {
            if self.read_counter.load(Ordering::SeqCst) >= max {
                if self.script.realtime {
                    std::thread::sleep(timeout);
                }
                return Err(Error::Timeout);
            }
        }
        if self.script.realtime {
            let interval = Duration::from_secs_f64(1.0 / self.script.fps);
            if let Some(last) = self.last_frame_at {
                let next_due = last + interval;
                let now = Instant::now();
                if next_due > now {
                    std::thread::sleep(next_due - now);
                }
                self.last_frame_at = Some(next_due);
            } else {
                self.last_frame_at = Some(Instant::now());
            }
        }
        let idx = self.read_counter.fetch_add(1, Ordering::SeqCst);
        if self.script.fail_reads.contains(&idx) {
            return Err(Error::ReadFailed(format!(
                "simulated read failure at frame {idx}"
            )));
        }
        Ok(self.render(idx))
    }
}
