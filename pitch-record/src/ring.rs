use std::collections::VecDeque;

use pitch_types::FrameHandle;

/// Bounded pre-roll ring for one camera.
///
/// Capacity is `ceil(pre_roll_ms * fps / 1000 * 1.2)` (20% margin over
/// the nominal frame count) and is a hard bound: `push` evicts the
/// oldest frame in O(1) once full. The bound is a correctness invariant;
/// an unbounded ring would hold every frame of the session alive.
#[derive(Debug)]
pub struct PreRollRing {
    cap: usize,
    frames: VecDeque<FrameHandle>,
}

/// Ring capacity for the given pre-roll duration and frame rate.
pub fn pre_roll_capacity(pre_roll_ms: u64, fps: f64) -> usize {
    let nominal = pre_roll_ms as f64 * fps / 1000.0 * 1.2;
    (nominal.ceil() as usize).max(1)
}

impl PreRollRing {
    pub fn new(cap: usize) -> Self {
        Self {
            cap: cap.max(1),
            frames: VecDeque::with_capacity(cap.max(1)),
        }
    }

    pub fn push(&mut self, frame: FrameHandle) {
        if self.frames.len() == self.cap {
            self.frames.pop_front();
        }
        self.frames.push_back(frame);
    }

    /// Remove and return all buffered frames, oldest first.
    pub fn drain_oldest_first(&mut self) -> Vec<FrameHandle> {
        self.frames.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.cap
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pitch_types::{CamSide, Frame, PixFmt};
    use std::sync::Arc;

    fn frame(idx: u64) -> FrameHandle {
        Arc::new(Frame {
            cam: CamSide::Left,
            frame_index: idx,
            t_capture_ns: idx as i64,
            width: 2,
            height: 2,
            stride: 2,
            pixfmt: PixFmt::Mono8,
            data: vec![0; 4],
        })
    }

    #[test]
    fn capacity_formula_includes_margin() {
        // 500 ms at 60 fps: 30 frames nominal, 36 with the 20% margin.
        assert_eq!(pre_roll_capacity(500, 60.0), 36);
        assert_eq!(pre_roll_capacity(0, 60.0), 1);
    }

    #[test]
    fn push_evicts_oldest_at_capacity() {
        let mut ring = PreRollRing::new(3);
        for i in 0..5 {
            ring.push(frame(i));
            assert!(ring.len() <= ring.capacity());
        }
        let drained = ring.drain_oldest_first();
        let indices: Vec<u64> = drained.iter().map(|f| f.frame_index).collect();
        assert_eq!(indices, vec![2, 3, 4]);
        assert!(ring.is_empty());
    }
}
