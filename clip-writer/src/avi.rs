//! Motion-JPEG in a RIFF/AVI container.
//!
//! The container is written by hand: header sizes, frame counts and the
//! `idx1` index are patched on finish, so an unfinished file is readable
//! up to its last complete chunk by tolerant players. Frames are encoded
//! with the `image` JPEG encoder.

use std::fs::File;
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::Path;

use pitch_types::{Codec, Frame, PixFmt};

use crate::convert::packed_pixels;
use crate::{Error, Result, VideoWriter};

const JPEG_QUALITY: u8 = 85;

/// AVIF_HASINDEX / AVIIF_KEYFRAME share the same bit value.
const FLAG_INDEX: u32 = 0x10;

pub struct MjpegAviWriter {
    inner: Inner,
    fps: f64,
}

enum Inner {
    Starting(BufWriter<File>),
    Recording(RecordingState),
    Finished,
}

struct RecordingState {
    fd: BufWriter<File>,
    width: u32,
    height: u32,
    /// Byte positions that get patched on finish.
    riff_size_pos: u64,
    total_frames_pos: u64,
    stream_length_pos: u64,
    movi_size_pos: u64,
    /// `(offset_in_movi, unpadded_len)` per frame for idx1.
    index: Vec<(u32, u32)>,
    frames: u32,
}

impl MjpegAviWriter {
    pub fn create(path: &Path, fps: f64) -> Result<Self> {
        let fd = BufWriter::new(File::create(path)?);
        Ok(Self {
            inner: Inner::Starting(fd),
            fps,
        })
    }

    fn start_container(
        &self,
        mut fd: BufWriter<File>,
        width: u32,
        height: u32,
    ) -> Result<RecordingState> {
        fd.write_all(b"RIFF")?;
        let riff_size_pos = fd.stream_position()?;
        fd.write_all(&0u32.to_le_bytes())?;
        fd.write_all(b"AVI ")?;

        // hdrl list: avih + one strl. All fixed-size, so the list size is
        // known up front: 'hdrl' + avih chunk + strl list.
        let strl_size = 4 + (8 + 56) + (8 + 40);
        let hdrl_size = 4 + (8 + 56) + (8 + strl_size);
        fd.write_all(b"LIST")?;
        fd.write_all(&(hdrl_size as u32).to_le_bytes())?;
        fd.write_all(b"hdrl")?;

        // avih: MainAVIHeader.
        fd.write_all(b"avih")?;
        fd.write_all(&56u32.to_le_bytes())?;
        let us_per_frame = (1_000_000.0 / self.fps).round() as u32;
        fd.write_all(&us_per_frame.to_le_bytes())?;
        fd.write_all(&0u32.to_le_bytes())?; // max bytes/sec
        fd.write_all(&0u32.to_le_bytes())?; // padding granularity
        fd.write_all(&FLAG_INDEX.to_le_bytes())?;
        let total_frames_pos = fd.stream_position()?;
        fd.write_all(&0u32.to_le_bytes())?; // total frames (patched)
        fd.write_all(&0u32.to_le_bytes())?; // initial frames
        fd.write_all(&1u32.to_le_bytes())?; // streams
        fd.write_all(&0u32.to_le_bytes())?; // suggested buffer size
        fd.write_all(&width.to_le_bytes())?;
        fd.write_all(&height.to_le_bytes())?;
        fd.write_all(&[0u8; 16])?; // reserved

        // strl list: strh + strf.
        fd.write_all(b"LIST")?;
        fd.write_all(&(strl_size as u32).to_le_bytes())?;
        fd.write_all(b"strl")?;

        fd.write_all(b"strh")?;
        fd.write_all(&56u32.to_le_bytes())?;
        fd.write_all(b"vids")?;
        fd.write_all(b"MJPG")?;
        fd.write_all(&0u32.to_le_bytes())?; // flags
        fd.write_all(&0u32.to_le_bytes())?; // priority + language
        fd.write_all(&0u32.to_le_bytes())?; // initial frames
        let scale = 1000u32;
        let rate = (self.fps * scale as f64).round() as u32;
        fd.write_all(&scale.to_le_bytes())?;
        fd.write_all(&rate.to_le_bytes())?;
        fd.write_all(&0u32.to_le_bytes())?; // start
        let stream_length_pos = fd.stream_position()?;
        fd.write_all(&0u32.to_le_bytes())?; // length in frames (patched)
        fd.write_all(&0u32.to_le_bytes())?; // suggested buffer size
        fd.write_all(&u32::MAX.to_le_bytes())?; // quality: default
        fd.write_all(&0u32.to_le_bytes())?; // sample size
        fd.write_all(&0u16.to_le_bytes())?; // rcFrame left
        fd.write_all(&0u16.to_le_bytes())?; // top
        fd.write_all(&(width as u16).to_le_bytes())?;
        fd.write_all(&(height as u16).to_le_bytes())?;

        // strf: BITMAPINFOHEADER.
        fd.write_all(b"strf")?;
        fd.write_all(&40u32.to_le_bytes())?;
        fd.write_all(&40u32.to_le_bytes())?; // biSize
        fd.write_all(&(width as i32).to_le_bytes())?;
        fd.write_all(&(height as i32).to_le_bytes())?;
        fd.write_all(&1u16.to_le_bytes())?; // planes
        fd.write_all(&24u16.to_le_bytes())?; // bit count
        fd.write_all(b"MJPG")?;
        fd.write_all(&(width * height * 3).to_le_bytes())?;
        fd.write_all(&[0u8; 16])?; // ppm + clr fields

        fd.write_all(b"LIST")?;
        let movi_size_pos = fd.stream_position()?;
        fd.write_all(&0u32.to_le_bytes())?; // movi size (patched)
        fd.write_all(b"movi")?;

        Ok(RecordingState {
            fd,
            width,
            height,
            riff_size_pos,
            total_frames_pos,
            stream_length_pos,
            movi_size_pos,
            index: Vec::new(),
            frames: 0,
        })
    }
}

fn encode_jpeg(frame: &Frame) -> Result<Vec<u8>> {
    let packed = packed_pixels(frame);
    let color = match frame.pixfmt {
        PixFmt::Mono8 => image::ExtendedColorType::L8,
        PixFmt::Rgb8 => image::ExtendedColorType::Rgb8,
    };
    let mut out = Vec::new();
    let mut enc = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut out, JPEG_QUALITY);
    enc.encode(&packed, frame.width, frame.height, color)?;
    Ok(out)
}

fn write_frame_chunk(state: &mut RecordingState, jpeg: &[u8]) -> Result<()> {
    // Offset convention: relative to the position of the 'movi' fourcc.
    let movi_start = state.movi_size_pos + 4;
    let chunk_pos = state.fd.stream_position()?;
    state.fd.write_all(b"00dc")?;
    let len: u32 = jpeg.len().try_into().unwrap();
    state.fd.write_all(&len.to_le_bytes())?;
    state.fd.write_all(jpeg)?;
    if jpeg.len() % 2 == 1 {
        state.fd.write_all(&[0u8])?;
    }
    state.index.push(((chunk_pos - movi_start) as u32, len));
    state.frames += 1;
    Ok(())
}

impl VideoWriter for MjpegAviWriter {
    fn codec(&self) -> Codec {
        Codec::Mjpeg
    }

    fn write(&mut self, frame: &Frame, _pts_ns: i64) -> Result<()> {
        match std::mem::replace(&mut self.inner, Inner::Finished) {
            Inner::Starting(fd) => {
                let mut state = self.start_container(fd, frame.width, frame.height)?;
                let jpeg = encode_jpeg(frame)?;
                write_frame_chunk(&mut state, &jpeg)?;
                self.inner = Inner::Recording(state);
                Ok(())
            }
            Inner::Recording(mut state) => {
                if frame.width != state.width || frame.height != state.height {
                    self.inner = Inner::Recording(state);
                    return Err(Error::IoError {
                        source: std::io::Error::new(
                            std::io::ErrorKind::InvalidInput,
                            "frame dimensions changed mid-file",
                        ),
                    });
                }
                let jpeg = encode_jpeg(frame)?;
                write_frame_chunk(&mut state, &jpeg)?;
                self.inner = Inner::Recording(state);
                Ok(())
            }
            Inner::Finished => Err(Error::AlreadyFinished),
        }
    }

    fn finish(&mut self) -> Result<()> {
        match std::mem::replace(&mut self.inner, Inner::Finished) {
            Inner::Starting(mut fd) => {
                fd.flush()?;
                Ok(())
            }
            Inner::Recording(mut state) => {
                let movi_end = state.fd.stream_position()?;

                // idx1.
                state.fd.write_all(b"idx1")?;
                let idx_len: u32 = (state.index.len() * 16).try_into().unwrap();
                state.fd.write_all(&idx_len.to_le_bytes())?;
                for (offset, len) in &state.index {
                    state.fd.write_all(b"00dc")?;
                    state.fd.write_all(&FLAG_INDEX.to_le_bytes())?;
                    state.fd.write_all(&offset.to_le_bytes())?;
                    state.fd.write_all(&len.to_le_bytes())?;
                }
                let file_end = state.fd.stream_position()?;

                // Patch the deferred sizes.
                let patch = |fd: &mut BufWriter<File>, pos: u64, value: u32| -> Result<()> {
                    fd.seek(SeekFrom::Start(pos))?;
                    fd.write_all(&value.to_le_bytes())?;
                    Ok(())
                };
                patch(
                    &mut state.fd,
                    state.riff_size_pos,
                    (file_end - state.riff_size_pos - 4) as u32,
                )?;
                patch(&mut state.fd, state.total_frames_pos, state.frames)?;
                patch(&mut state.fd, state.stream_length_pos, state.frames)?;
                patch(
                    &mut state.fd,
                    state.movi_size_pos,
                    (movi_end - state.movi_size_pos - 4) as u32,
                )?;
                state.fd.seek(SeekFrom::Start(file_end))?;
                state.fd.flush()?;
                Ok(())
            }
            Inner::Finished => Err(Error::AlreadyFinished),
        }
    }
}

impl Drop for MjpegAviWriter {
    fn drop(&mut self) {
        if matches!(self.inner, Inner::Recording(_)) && !std::thread::panicking() {
            let _ = self.finish();
        }
    }
}
