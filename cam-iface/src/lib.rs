//! Generic camera driver interface.
//!
//! Concrete camera backends implement [`CameraModule`] / [`Camera`]; the
//! capture service is written against these traits only. The in-tree
//! [`sim`] backend provides deterministic synthetic cameras for tests and
//! the demo binary.

use std::time::Duration;

use pitch_types::PixFmt;

pub mod probe;
pub mod sim;

pub type Result<M> = std::result::Result<M, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Timeout")]
    Timeout,
    #[error("camera not found: {0}")]
    CameraNotFound(String),
    #[error("camera open failed: {0}")]
    OpenFailed(String),
    #[error("frame read failed: {0}")]
    ReadFailed(String),
    #[error("unsupported pixel format {0}")]
    UnsupportedPixelFormat(PixFmt),
    #[error("CamError({0})")]
    CamError(String),
    #[error("io error: {source}")]
    IoError {
        #[from]
        source: std::io::Error,
    },
}

fn _test_error_is_send() {
    // Compile-time test to ensure Error implements Send trait.
    fn implements<T: Send>() {}
    implements::<Error>();
}

impl<'a> From<&'a str> for Error {
    fn from(orig: &'a str) -> Error {
        Error::CamError(orig.to_string())
    }
}

impl From<String> for Error {
    fn from(msg: String) -> Error {
        Error::CamError(msg)
    }
}

/// An unstamped image as delivered by a driver. The capture service turns
/// this into a [`pitch_types::Frame`] by stamping it.
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub width: u32,
    pub height: u32,
    pub stride: u32,
    pub pixfmt: PixFmt,
    pub data: Vec<u8>,
}

/// A backend for opening cameras (e.g. a vendor SDK wrapper or [`sim`]).
pub trait CameraModule {
    type CameraType: Camera;

    fn name(&self) -> &str;
    fn camera_infos(&self) -> Result<Vec<Box<dyn CameraInfo>>>;
    /// Open the named camera. Implementations must bound this call by
    /// [`probe::OPEN_TIMEOUT`].
    fn camera(&mut self, name: &str) -> Result<Self::CameraType>;
}

pub trait CameraInfo {
    fn name(&self) -> &str;
    fn serial(&self) -> &str;
    fn model(&self) -> &str;
    fn vendor(&self) -> &str;
}

pub trait Camera: CameraInfo + Send {
    /// Sensor width in pixels.
    fn width(&self) -> Result<u32>;
    /// Sensor height in pixels.
    fn height(&self) -> Result<u32>;

    fn pixel_format(&self) -> Result<PixFmt>;
    fn set_pixel_format(&mut self, pixel_format: PixFmt) -> Result<()>;

    fn acquisition_frame_rate(&self) -> Result<f64>;
    fn set_acquisition_frame_rate(&mut self, value: f64) -> Result<()>;

    fn acquisition_start(&mut self) -> Result<()>;
    fn acquisition_stop(&mut self) -> Result<()>;

    /// Synchronous (blocking) frame acquisition, bounded by `timeout`.
    fn next_frame(&mut self, timeout: Duration) -> Result<RawFrame>;
}
