//! Pixel format conversion for the H.264 encoder.
//!
//! The encoder consumes planar YCbCr with strides aligned to the 16 px
//! macroblock size and even luma dimensions for 4:2:0 subsampling; frames
//! are trimmed to even width/height on the way in.

use pitch_types::{Frame, PixFmt};

pub(crate) fn align16(v: usize) -> usize {
    v.div_ceil(16) * 16
}

/// Planar image handed to the encoder. Mono frames carry only the luma
/// plane; color frames carry 4:2:0 chroma.
pub(crate) struct EncoderImage {
    pub width: u32,
    pub height: u32,
    pub y: Vec<u8>,
    pub y_stride: usize,
    pub chroma: Option<ChromaPlanes>,
}

pub(crate) struct ChromaPlanes {
    pub u: Vec<u8>,
    pub v: Vec<u8>,
    pub stride: usize,
}

pub(crate) fn to_encoder_image(frame: &Frame) -> EncoderImage {
    let width = frame.width & !1;
    let height = frame.height & !1;
    match frame.pixfmt {
        PixFmt::Mono8 => {
            let y_stride = align16(width as usize);
            let mut y = vec![0u8; y_stride * height as usize];
            for row in 0..height {
                let src = &frame.row(row)[..width as usize];
                let dst = row as usize * y_stride;
                y[dst..dst + width as usize].copy_from_slice(src);
            }
            EncoderImage {
                width,
                height,
                y,
                y_stride,
                chroma: None,
            }
        }
        PixFmt::Rgb8 => rgb_to_i420(frame, width, height),
    }
}

/// BT.601 full-range RGB -> I420.
fn rgb_to_i420(frame: &Frame, width: u32, height: u32) -> EncoderImage {
    let y_stride = align16(width as usize);
    let c_stride = align16(width as usize / 2);
    let mut y = vec![0u8; y_stride * height as usize];
    let mut u = vec![128u8; c_stride * height as usize / 2];
    let mut v = vec![128u8; c_stride * height as usize / 2];

    for row in 0..height as usize {
        let src = frame.row(row as u32);
        for col in 0..width as usize {
            let r = src[col * 3] as f32;
            let g = src[col * 3 + 1] as f32;
            let b = src[col * 3 + 2] as f32;
            let yy = 0.299 * r + 0.587 * g + 0.114 * b;
            y[row * y_stride + col] = yy.round().clamp(0.0, 255.0) as u8;
            if row % 2 == 0 && col % 2 == 0 {
                let uu = -0.168_736 * r - 0.331_264 * g + 0.5 * b + 128.0;
                let vv = 0.5 * r - 0.418_688 * g - 0.081_312 * b + 128.0;
                let off = (row / 2) * c_stride + col / 2;
                u[off] = uu.round().clamp(0.0, 255.0) as u8;
                v[off] = vv.round().clamp(0.0, 255.0) as u8;
            }
        }
    }
    EncoderImage {
        width,
        height,
        y,
        y_stride,
        chroma: Some(ChromaPlanes {
            u,
            v,
            stride: c_stride,
        }),
    }
}

/// Packed bytes (stride removed) for the JPEG encoder.
pub(crate) fn packed_pixels(frame: &Frame) -> Vec<u8> {
    let valid = frame.width as usize * frame.pixfmt.bytes_per_pixel();
    if frame.stride as usize == valid {
        return frame.data[..valid * frame.height as usize].to_vec();
    }
    let mut out = Vec::with_capacity(valid * frame.height as usize);
    for row in 0..frame.height {
        out.extend_from_slice(frame.row(row));
    }
    out
}
