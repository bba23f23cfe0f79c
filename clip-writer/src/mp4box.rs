//! H.264 in MP4.
//!
//! The encoder emits Annex-B NAL units; SPS (0x67) and PPS (0x68) are
//! captured from the stream to configure the `avc1` track, and every NAL
//! is re-framed with a 4-byte length prefix (AVCC) for the sample data.
//! The MP4 boxes are only started once parameter sets are known, so a
//! writer that never receives a frame leaves an empty file.

use std::fs::File;
use std::io::BufWriter;
use std::path::Path;

use pitch_types::{Codec, Frame};

use crate::convert::{to_encoder_image, EncoderImage};
use crate::{Error, Result, VideoWriter};

/// Time units per second in the movie header.
const MOVIE_TIMESCALE: u32 = 90_000;

const TRACK_ID: u32 = 1;

pub struct H264Mp4Writer {
    codec: Codec,
    sample_duration: u32,
    inner: Inner,
}

enum Inner {
    Starting(BufWriter<File>),
    Recording {
        mp4: mp4::Mp4Writer<BufWriter<File>>,
        encoder: Enc,
        parser: H264Parser,
        first_pts_ns: i64,
    },
    Finished,
    // Transient placeholder while moving between states; observing it
    // means a previous write errored mid-transition.
    Poisoned,
}

enum Enc {
    Less(Option<less_avc::LessEncoder>),
    #[cfg(feature = "openh264-encode")]
    Open(openh264::encoder::Encoder),
}

impl H264Mp4Writer {
    pub fn create(path: &Path, codec: Codec, fps: f64) -> Result<Self> {
        debug_assert!(matches!(codec, Codec::H264 | Codec::H264Alt));
        let fd = BufWriter::new(File::create(path)?);
        let sample_duration = (MOVIE_TIMESCALE as f64 / fps).round() as u32;
        Ok(Self {
            codec,
            sample_duration,
            inner: Inner::Starting(fd),
        })
    }

    fn make_encoder(&self, im: &EncoderImage) -> Result<Enc> {
        match self.codec {
            Codec::H264 => Ok(Enc::Less(None)),
            Codec::H264Alt => {
                #[cfg(feature = "openh264-encode")]
                {
                    let cfg = openh264::encoder::EncoderConfig::new(im.width, im.height);
                    Ok(Enc::Open(openh264::encoder::Encoder::with_config(cfg)?))
                }
                #[cfg(not(feature = "openh264-encode"))]
                {
                    let _ = im;
                    Err(Error::CodecUnavailable(self.codec))
                }
            }
            Codec::Mjpeg => unreachable!("mjpeg goes through the AVI writer"),
        }
    }
}

impl VideoWriter for H264Mp4Writer {
    fn codec(&self) -> Codec {
        self.codec
    }

    fn write(&mut self, frame: &Frame, pts_ns: i64) -> Result<()> {
        let im = to_encoder_image(frame);
        match std::mem::replace(&mut self.inner, Inner::Poisoned) {
            Inner::Starting(fd) => {
                let mut encoder = self.make_encoder(&im)?;
                let (annex_b, is_keyframe) = encode(&mut encoder, &im)?;
                let mut parser = H264Parser::new();
                let avcc = parser.push_annex_b(&annex_b);
                let sps = parser.sps().ok_or(Error::MissingParameterSets)?;
                let pps = parser.pps().ok_or(Error::MissingParameterSets)?;
                let mut mp4 = start_mp4_writer(fd, sps, pps, im.width, im.height)?;
                mp4.write_sample(
                    TRACK_ID,
                    &mp4_sample(avcc, 0, self.sample_duration, is_keyframe),
                )?;
                self.inner = Inner::Recording {
                    mp4,
                    encoder,
                    parser,
                    first_pts_ns: pts_ns,
                };
                Ok(())
            }
            Inner::Recording {
                mut mp4,
                mut encoder,
                mut parser,
                first_pts_ns,
            } => {
                let (annex_b, is_keyframe) = encode(&mut encoder, &im)?;
                let avcc = parser.push_annex_b(&annex_b);
                let start_time = pts_to_timescale(pts_ns - first_pts_ns);
                mp4.write_sample(
                    TRACK_ID,
                    &mp4_sample(avcc, start_time, self.sample_duration, is_keyframe),
                )?;
                self.inner = Inner::Recording {
                    mp4,
                    encoder,
                    parser,
                    first_pts_ns,
                };
                Ok(())
            }
            Inner::Finished => {
                self.inner = Inner::Finished;
                Err(Error::AlreadyFinished)
            }
            Inner::Poisoned => Err(Error::AlreadyFinished),
        }
    }

    fn finish(&mut self) -> Result<()> {
        match std::mem::replace(&mut self.inner, Inner::Finished) {
            Inner::Starting(_fd) => Ok(()), // no frames were written
            Inner::Recording { mut mp4, .. } => {
                mp4.write_end()?;
                Ok(())
            }
            Inner::Finished | Inner::Poisoned => Err(Error::AlreadyFinished),
        }
    }
}

impl Drop for H264Mp4Writer {
    fn drop(&mut self) {
        if matches!(self.inner, Inner::Recording { .. }) && !std::thread::panicking() {
            let _ = self.finish();
        }
    }
}

fn pts_to_timescale(delta_ns: i64) -> u64 {
    (delta_ns.max(0) as u128 * MOVIE_TIMESCALE as u128 / 1_000_000_000u128) as u64
}

fn mp4_sample(avcc: Vec<u8>, start_time: u64, duration: u32, is_sync: bool) -> mp4::Mp4Sample {
    mp4::Mp4Sample {
        start_time,
        duration,
        rendering_offset: 0,
        is_sync,
        bytes: avcc.into(),
    }
}

fn encode(encoder: &mut Enc, im: &EncoderImage) -> Result<(Vec<u8>, bool)> {
    match encoder {
        Enc::Less(state) => {
            let buf = less_encode(state, im)?;
            // less-avc output is all-intra.
            Ok((buf, true))
        }
        #[cfg(feature = "openh264-encode")]
        Enc::Open(enc) => {
            let yuv = YUVData::from_encoder_image(im);
            let encoded = enc.encode(&yuv)?;
            use openh264::encoder::FrameType;
            let is_keyframe = (encoded.frame_type() == FrameType::IDR)
                | (encoded.frame_type() == FrameType::I);
            Ok((encoded.to_vec(), is_keyframe))
        }
    }
}

fn less_encode(state: &mut Option<less_avc::LessEncoder>, im: &EncoderImage) -> Result<Vec<u8>> {
    use less_avc::ycbcr_image::{DataPlane, Planes, YCbCrImage};

    let y_plane = DataPlane {
        data: &im.y,
        stride: im.y_stride,
        bit_depth: less_avc::BitDepth::Depth8,
    };
    let planes = match &im.chroma {
        None => Planes::Mono(y_plane),
        Some(c) => Planes::YCbCr((
            y_plane,
            DataPlane {
                data: &c.u,
                stride: c.stride,
                bit_depth: less_avc::BitDepth::Depth8,
            },
            DataPlane {
                data: &c.v,
                stride: c.stride,
                bit_depth: less_avc::BitDepth::Depth8,
            },
        )),
    };
    let image = YCbCrImage {
        planes,
        width: im.width,
        height: im.height,
    };

    let (buf, encoder) = match state.take() {
        None => {
            let (nal_units, encoder) = less_avc::LessEncoder::new(&image)?;
            let buf: Vec<u8> = nal_units
                .into_iter()
                .flat_map(|nal_unit| nal_unit.to_annex_b_data())
                .collect();
            (buf, encoder)
        }
        Some(mut encoder) => {
            let nal_unit = encoder.encode(&image)?;
            (nal_unit.to_annex_b_data(), encoder)
        }
    };
    *state = Some(encoder);
    Ok(buf)
}

fn start_mp4_writer(
    fd: BufWriter<File>,
    sps: &[u8],
    pps: &[u8],
    width: u32,
    height: u32,
) -> Result<mp4::Mp4Writer<BufWriter<File>>> {
    let mp4_config = mp4::Mp4Config {
        major_brand: str::parse("isom").unwrap(),
        minor_version: 512,
        compatible_brands: vec![
            str::parse("isom").unwrap(),
            str::parse("iso2").unwrap(),
            str::parse("avc1").unwrap(),
            str::parse("mp41").unwrap(),
        ],
        timescale: MOVIE_TIMESCALE,
    };
    let mut writer = mp4::Mp4Writer::write_start(fd, &mp4_config)?;
    let media_conf = mp4::MediaConfig::AvcConfig(mp4::AvcConfig {
        width: width.try_into().unwrap(),
        height: height.try_into().unwrap(),
        seq_param_set: sps.to_vec(),
        pic_param_set: pps.to_vec(),
    });
    let track_conf = mp4::TrackConfig {
        track_type: mp4::TrackType::Video,
        timescale: MOVIE_TIMESCALE,
        language: String::from("eng"),
        media_conf,
    };
    writer.add_track(&track_conf)?;
    Ok(writer)
}

/// Captures SPS/PPS and converts Annex-B access units to AVCC samples.
///
/// Not a general Annex-B parser: it assumes complete NAL units delimited
/// by 4-byte start codes, which holds for the encoders used here.
struct H264Parser {
    sps: Option<Vec<u8>>,
    pps: Option<Vec<u8>>,
}

impl H264Parser {
    fn new() -> Self {
        Self {
            sps: None,
            pps: None,
        }
    }

    fn sps(&self) -> Option<&[u8]> {
        self.sps.as_deref()
    }

    fn pps(&self) -> Option<&[u8]> {
        self.pps.as_deref()
    }

    fn push_annex_b(&mut self, annex_b: &[u8]) -> Vec<u8> {
        let mut avcc = Vec::with_capacity(annex_b.len() + 16);
        for ebsp in split_nal_units(annex_b) {
            if ebsp.is_empty() {
                continue;
            }
            match ebsp[0] {
                0x67 => self.sps = Some(ebsp.to_vec()),
                0x68 => self.pps = Some(ebsp.to_vec()),
                _ => {}
            }
            let len: u32 = ebsp.len().try_into().unwrap();
            avcc.extend_from_slice(&len.to_be_bytes());
            avcc.extend_from_slice(ebsp);
        }
        avcc
    }
}

fn split_nal_units(buf: &[u8]) -> impl Iterator<Item = &[u8]> {
    const START: [u8; 4] = [0x00, 0x00, 0x00, 0x01];
    let mut starts = Vec::new();
    let mut i = 0;
    while i + START.len() <= buf.len() {
        if buf[i..i + 4] == START {
            starts.push(i + 4);
            i += 4;
        } else {
            i += 1;
        }
    }
    let mut spans = Vec::with_capacity(starts.len());
    for (k, &s) in starts.iter().enumerate() {
        let end = if k + 1 < starts.len() {
            starts[k + 1] - 4
        } else {
            buf.len()
        };
        spans.push(&buf[s..end]);
    }
    spans.into_iter()
}

#[cfg(feature = "openh264-encode")]
struct YUVData {
    width: usize,
    height: usize,
    data: Vec<u8>,
    y_stride: usize,
    u_stride: usize,
    v_stride: usize,
}

#[cfg(feature = "openh264-encode")]
impl YUVData {
    fn from_encoder_image(im: &EncoderImage) -> Self {
        let (width, height) = (im.width as usize, im.height as usize);
        match &im.chroma {
            Some(c) => {
                let mut data =
                    Vec::with_capacity(im.y.len() + c.u.len() + c.v.len());
                data.extend_from_slice(&im.y);
                data.extend_from_slice(&c.u);
                data.extend_from_slice(&c.v);
                Self {
                    width,
                    height,
                    data,
                    y_stride: im.y_stride,
                    u_stride: c.stride,
                    v_stride: c.stride,
                }
            }
            None => {
                // Expand mono to I420 with neutral chroma.
                let c_stride = im.y_stride / 2;
                let mut data = Vec::with_capacity(im.y.len() + c_stride * height);
                data.extend_from_slice(&im.y);
                data.resize(im.y.len() + c_stride * height, 128);
                Self {
                    width,
                    height,
                    data,
                    y_stride: im.y_stride,
                    u_stride: c_stride,
                    v_stride: c_stride,
                }
            }
        }
    }

    #[inline]
    fn u_start(&self) -> usize {
        self.height * self.y_stride
    }
    #[inline]
    fn v_start(&self) -> usize {
        self.u_start() + self.height / 2 * self.u_stride
    }
    #[inline]
    fn v_end(&self) -> usize {
        self.v_start() + self.height / 2 * self.u_stride
    }
}

#[cfg(feature = "openh264-encode")]
impl openh264::formats::YUVSource for YUVData {
    fn width(&self) -> i32 {
        self.width.try_into().unwrap()
    }
    fn height(&self) -> i32 {
        self.height.try_into().unwrap()
    }
    fn y(&self) -> &[u8] {
        &self.data[0..self.u_start()]
    }
    fn u(&self) -> &[u8] {
        &self.data[self.u_start()..self.v_start()]
    }
    fn v(&self) -> &[u8] {
        &self.data[self.v_start()..self.v_end()]
    }
    fn y_stride(&self) -> i32 {
        self.y_stride.try_into().unwrap()
    }
    fn u_stride(&self) -> i32 {
        self.u_stride.try_into().unwrap()
    }
    fn v_stride(&self) -> i32 {
        self.v_stride.try_into().unwrap()
    }
}
