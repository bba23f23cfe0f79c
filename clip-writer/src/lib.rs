//! Video clip writers with a codec fallback chain.
//!
//! Two container paths: H.264 in MP4 (in-process software encoders) and
//! motion-JPEG in AVI. [`open_with_fallback`] walks the configured codec
//! preference, releasing each failed attempt before trying the next, and
//! reports which codec actually opened so session and pitch writers can
//! be forced onto the same choice.
//!
//! Writers are single-threaded by design: the recording service calls
//! them only from the bus-dispatch thread that delivered the frame.

use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use pitch_types::{Codec, Frame};

mod avi;
mod convert;
mod mp4box;

pub use avi::MjpegAviWriter;
pub use mp4box::H264Mp4Writer;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("io error: {source}")]
    IoError {
        #[from]
        source: std::io::Error,
    },
    #[error("mp4 mux error: {source}")]
    Mp4Error {
        #[from]
        source: mp4::Error,
    },
    #[error("h264 encode error: {source}")]
    LessAvcError {
        #[from]
        source: less_avc::Error,
    },
    #[cfg(feature = "openh264-encode")]
    #[error("openh264 error: {source}")]
    OpenH264Error {
        #[from]
        source: openh264::Error,
    },
    #[error("jpeg encode error: {source}")]
    JpegError {
        #[from]
        source: image::ImageError,
    },
    #[error("codec {0} is not available in this build")]
    CodecUnavailable(Codec),
    #[error("file already finished")]
    AlreadyFinished,
    #[error("required SPS/PPS not found in encoder output")]
    MissingParameterSets,
    #[error("no codec in the preference list could be opened")]
    AllCodecsFailed,
}

/// A single-file video sink. `pts_ns` is relative to the first written
/// frame; frames must be delivered in presentation order from one thread.
pub trait VideoWriter: Send {
    fn codec(&self) -> Codec;
    fn write(&mut self, frame: &Frame, pts_ns: i64) -> Result<()>;
    /// Flush indexes/headers and close. Idempotent errors: a second call
    /// fails with [`Error::AlreadyFinished`].
    fn finish(&mut self) -> Result<()>;
}

/// A successfully opened writer plus where it landed on disk.
pub struct OpenedWriter {
    pub writer: Box<dyn VideoWriter>,
    pub codec: Codec,
    pub path: PathBuf,
}

/// Open a writer for `base` (path without extension), trying `codecs` in
/// order. A failed attempt is released and its partial file removed
/// before the next codec is tried.
pub fn open_with_fallback(base: &Path, codecs: &[Codec], fps: f64) -> Result<OpenedWriter> {
    for &codec in codecs {
        let path = base.with_extension(codec.extension());
        match open_one(&path, codec, fps) {
            Ok(writer) => {
                debug!("opened {} with codec {}", path.display(), codec);
                return Ok(OpenedWriter {
                    writer,
                    codec,
                    path,
                });
            }
            Err(e) => {
                warn!("codec {} failed for {}: {}", codec, path.display(), e);
                let _ = std::fs::remove_file(&path);
            }
        }
    }
    Err(Error::AllCodecsFailed)
}

/// Open a writer for one specific codec (used to force the second camera
/// onto the codec the first one got).
pub fn open_one(path: &Path, codec: Codec, fps: f64) -> Result<Box<dyn VideoWriter>> {
    match codec {
        Codec::H264 => Ok(Box::new(H264Mp4Writer::create(path, codec, fps)?)),
        Codec::H264Alt => {
            #[cfg(feature = "openh264-encode")]
            {
                Ok(Box::new(H264Mp4Writer::create(path, codec, fps)?))
            }
            #[cfg(not(feature = "openh264-encode"))]
            {
                Err(Error::CodecUnavailable(codec))
            }
        }
        Codec::Mjpeg => Ok(Box::new(MjpegAviWriter::create(path, fps)?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pitch_types::{CamSide, PixFmt};

    pub(crate) fn gradient_frame(idx: u64, width: u32, height: u32, pixfmt: PixFmt) -> Frame {
        let bpp = pixfmt.bytes_per_pixel();
        let stride = width as usize * bpp;
        let mut data = vec![0u8; stride * height as usize];
        for row in 0..height as usize {
            for col in 0..width as usize {
                let v = ((row + col + idx as usize * 3) % 256) as u8;
                for b in 0..bpp {
                    data[row * stride + col * bpp + b] = v;
                }
            }
        }
        Frame {
            cam: CamSide::Left,
            frame_index: idx,
            t_capture_ns: idx as i64 * 16_666_667,
            width,
            height,
            stride: stride as u32,
            pixfmt,
            data,
        }
    }

    #[test]
    fn fallback_skips_unavailable_codec() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("clip");
        // H264Alt is only available with the openh264-encode feature; the
        // chain must fall through to MJPEG.
        let chain = [Codec::H264Alt, Codec::Mjpeg];
        let opened = open_with_fallback(&base, &chain, 60.0).unwrap();
        #[cfg(not(feature = "openh264-encode"))]
        {
            assert_eq!(opened.codec, Codec::Mjpeg);
            assert_eq!(opened.path.extension().unwrap(), "avi");
        }
        #[cfg(feature = "openh264-encode")]
        assert_eq!(opened.codec, Codec::H264Alt);
        drop(opened);
    }

    #[test]
    fn empty_chain_fails() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("clip");
        assert!(matches!(
            open_with_fallback(&base, &[], 60.0),
            Err(Error::AllCodecsFailed)
        ));
    }

    #[test]
    fn preferred_codec_wins_when_available() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("clip");
        let opened =
            open_with_fallback(&base, &pitch_types::default_codec_preference(), 60.0).unwrap();
        assert_eq!(opened.codec, Codec::H264);
        assert_eq!(opened.path.extension().unwrap(), "mp4");
    }
}
