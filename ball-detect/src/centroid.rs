use pitch_types::{Bbox, Detection, Frame, PixFmt};

use crate::{DetectResult, Detector};

/// Brightness-threshold centroid detector.
///
/// Finds the intensity-weighted centroid of all pixels at or above the
/// threshold. Assumes at most one ball in frame, which holds for the
/// narrow field of view of a pitch tunnel; a multi-target detector can be
/// plugged in through the [`Detector`] trait without touching the
/// service.
#[derive(Debug, Clone)]
pub struct CentroidDetector {
    /// Minimum pixel intensity (luma for color frames) to count.
    pub threshold: u8,
    /// Minimum number of above-threshold pixels for a detection.
    pub min_area: usize,
}

impl Default for CentroidDetector {
    fn default() -> Self {
        Self {
            threshold: 128,
            min_area: 4,
        }
    }
}

impl CentroidDetector {
    pub fn new(threshold: u8, min_area: usize) -> Self {
        Self {
            threshold,
            min_area,
        }
    }
}

impl Detector for CentroidDetector {
    fn detect(&self, frame: &Frame) -> DetectResult {
        let mut sum_w = 0.0f64;
        let mut sum_x = 0.0f64;
        let mut sum_y = 0.0f64;
        let mut area = 0usize;
        let (mut min_x, mut min_y) = (f64::MAX, f64::MAX);
        let (mut max_x, mut max_y) = (f64::MIN, f64::MIN);

        for row in 0..frame.height {
            let bytes = frame.row(row);
            for col in 0..frame.width as usize {
                let v = match frame.pixfmt {
                    PixFmt::Mono8 => bytes[col],
                    PixFmt::Rgb8 => {
                        let off = col * 3;
                        // Integer luma approximation.
                        ((bytes[off] as u16 + bytes[off + 1] as u16 + bytes[off + 2] as u16) / 3)
                            as u8
                    }
                };
                if v >= self.threshold {
                    let w = v as f64;
                    let (x, y) = (col as f64, row as f64);
                    sum_w += w;
                    sum_x += w * x;
                    sum_y += w * y;
                    area += 1;
                    min_x = min_x.min(x);
                    min_y = min_y.min(y);
                    max_x = max_x.max(x);
                    max_y = max_y.max(y);
                }
            }
        }

        if area < self.min_area {
            return Ok(Vec::new());
        }

        let confidence = area as f64 / (area as f64 + 50.0);
        Ok(vec![Detection {
            cam: frame.cam,
            frame_index: frame.frame_index,
            x: sum_x / sum_w,
            y: sum_y / sum_w,
            bbox: Some(Bbox {
                x: min_x,
                y: min_y,
                w: max_x - min_x + 1.0,
                h: max_y - min_y + 1.0,
            }),
            confidence,
            t_capture_ns: frame.t_capture_ns,
        }])
    }
}
