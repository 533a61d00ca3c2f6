//! video: frames, face crops and the FFmpeg-backed source
//!
//! Frames enter the pipeline as packed RGB24 plus a capture timestamp in
//! seconds. Sources are pull-based (`VideoSource::next_frame`) so the same
//! ingestion loop serves decoded files, in-memory fixtures and live capture
//! adapters. Rotation metadata is applied before a frame leaves the source.

use std::collections::VecDeque;
use std::path::Path;

use anyhow::{Context, Result};
use fast_image_resize as fr;
use ffmpeg_next as ffmpeg;
use ffmpeg_next::{codec, format, frame, media, software::scaling};
use image::{RgbImage, imageops};
use tracing::{debug, info, warn};

use crate::detection::BoundingBox;

/// Scaling flags for the decode → RGB conversion.
const SCALE_FLAGS: scaling::Flags = scaling::Flags::BILINEAR;

/// A single video frame in packed RGB24, row-major.
#[derive(Debug, Clone, PartialEq)]
pub struct RgbFrame {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

impl RgbFrame {
    pub fn new(width: u32, height: u32, data: Vec<u8>) -> Result<Self> {
        let expected = width as usize * height as usize * 3;
        anyhow::ensure!(
            data.len() == expected,
            "RGB buffer has {} bytes, expected {expected} for {width}x{height}",
            data.len()
        );
        Ok(Self {
            data,
            width,
            height,
        })
    }

    /// Uniformly coloured frame; handy for fixtures and padding.
    pub fn filled(width: u32, height: u32, rgb: [u8; 3]) -> Self {
        let data = rgb
            .iter()
            .copied()
            .cycle()
            .take(width as usize * height as usize * 3)
            .collect();
        Self {
            data,
            width,
            height,
        }
    }

    /// Copy the region covered by `bbox`, clipped to the frame. Returns
    /// `None` when the clipped region is empty.
    pub fn crop(&self, bbox: &BoundingBox) -> Option<RgbFrame> {
        let top = bbox.top.min(self.height);
        let bottom = bbox.bottom.min(self.height);
        let left = bbox.left.min(self.width);
        let right = bbox.right.min(self.width);
        if bottom <= top || right <= left {
            return None;
        }

        let crop_w = right - left;
        let crop_h = bottom - top;
        let src_stride = self.width as usize * 3;
        let dst_stride = crop_w as usize * 3;
        let mut data = vec![0u8; dst_stride * crop_h as usize];

        for row in 0..crop_h as usize {
            let src_start = (top as usize + row) * src_stride + left as usize * 3;
            let dst_start = row * dst_stride;
            data[dst_start..dst_start + dst_stride]
                .copy_from_slice(&self.data[src_start..src_start + dst_stride]);
        }

        Some(RgbFrame {
            data,
            width: crop_w,
            height: crop_h,
        })
    }

    /// Rotate clockwise by `degrees` (multiples of 90; anything else is a no-op).
    pub fn rotated(self, degrees: u32) -> Result<RgbFrame> {
        let steps = degrees % 360;
        if !matches!(steps, 90 | 180 | 270) {
            return Ok(self);
        }
        let img = RgbImage::from_raw(self.width, self.height, self.data)
            .context("frame buffer does not match its dimensions")?;
        let out = match steps {
            90 => imageops::rotate90(&img),
            180 => imageops::rotate180(&img),
            _ => imageops::rotate270(&img),
        };
        Ok(RgbFrame {
            width: out.width(),
            height: out.height(),
            data: out.into_raw(),
        })
    }
}

// ── Crop resizing ────────────────────────────────────────────────────────────

/// Reusable resize context that brings face crops to the model's input
/// resolution with area-style (box) averaging.
pub struct CropResizer {
    resizer: fr::Resizer,
    width: u32,
    height: u32,
}

impl CropResizer {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            resizer: fr::Resizer::new(),
            width,
            height,
        }
    }

    pub fn target(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn resize(&mut self, crop: &RgbFrame) -> Result<RgbFrame> {
        if crop.width == self.width && crop.height == self.height {
            return Ok(crop.clone());
        }

        let src = fr::images::ImageRef::new(crop.width, crop.height, &crop.data, fr::PixelType::U8x3)
            .context("failed to create crop resize source")?;
        let mut dst = fr::images::Image::new(self.width, self.height, fr::PixelType::U8x3);

        let options =
            fr::ResizeOptions::new().resize_alg(fr::ResizeAlg::Convolution(fr::FilterType::Box));
        self.resizer
            .resize(&src, &mut dst, Some(&options))
            .context("face crop resize failed")?;

        Ok(RgbFrame {
            data: dst.into_vec(),
            width: self.width,
            height: self.height,
        })
    }
}

// ── Sources ──────────────────────────────────────────────────────────────────

/// Ordered producer of `(frame, timestamp_seconds)` pairs. Timestamps must be
/// non-decreasing; they need not start at zero.
pub trait VideoSource: Send {
    fn next_frame(&mut self) -> Result<Option<(RgbFrame, f64)>>;
}

/// In-memory source over pre-built frames.
pub struct VecSource {
    frames: VecDeque<(RgbFrame, f64)>,
}

impl VecSource {
    pub fn new(frames: impl IntoIterator<Item = (RgbFrame, f64)>) -> Self {
        Self {
            frames: frames.into_iter().collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

impl VideoSource for VecSource {
    fn next_frame(&mut self) -> Result<Option<(RgbFrame, f64)>> {
        Ok(self.frames.pop_front())
    }
}

impl<S: VideoSource + ?Sized> VideoSource for Box<S> {
    fn next_frame(&mut self) -> Result<Option<(RgbFrame, f64)>> {
        (**self).next_frame()
    }
}

/// Decodes the best video stream of a file with FFmpeg.
pub struct FfmpegSource {
    input: format::context::Input,
    decoder: ffmpeg::decoder::Video,
    to_rgb: scaling::Context,
    stream_index: usize,
    time_base: f64,
    /// Clockwise degrees; `None` until resolved from the first frame.
    rotation: Option<u32>,
    decoded: frame::Video,
    rgb: frame::Video,
    frame_count: u64,
    eof_sent: bool,
}

// SAFETY: the FFmpeg contexts are owned exclusively by this source and only
// touched through `&mut self`, so moving the whole source to a capture thread
// never aliases them.
unsafe impl Send for FfmpegSource {}

impl FfmpegSource {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        ffmpeg::init().context("failed to initialise FFmpeg")?;

        let input = format::input(&path).context("could not open input file")?;
        let stream = input
            .streams()
            .best(media::Type::Video)
            .context("no video stream found in input")?;
        let stream_index = stream.index();
        let tb = stream.time_base();
        let time_base = if tb.denominator() != 0 {
            tb.numerator() as f64 / tb.denominator() as f64
        } else {
            0.0
        };
        let rotation = stream_rotation(&stream);

        let decoder_ctx = codec::context::Context::from_parameters(stream.parameters())
            .context("failed to build decoder context")?;
        let decoder = decoder_ctx
            .decoder()
            .video()
            .context("failed to open video decoder")?;

        let to_rgb = scaling::Context::get(
            decoder.format(),
            decoder.width(),
            decoder.height(),
            format::Pixel::RGB24,
            decoder.width(),
            decoder.height(),
            SCALE_FLAGS,
        )
        .context("failed to create to-RGB scaler")?;

        info!(
            width = decoder.width(),
            height = decoder.height(),
            rotation = rotation.unwrap_or(0),
            "opened input video stream"
        );

        Ok(Self {
            input,
            decoder,
            to_rgb,
            stream_index,
            time_base,
            rotation,
            decoded: frame::Video::empty(),
            rgb: frame::Video::empty(),
            frame_count: 0,
            eof_sent: false,
        })
    }

    /// Overrides the rotation read from stream metadata.
    pub fn with_rotation(mut self, degrees: u32) -> Self {
        self.rotation = Some(degrees % 360);
        self
    }

    /// Rotation for the current frame. Streams that carry no display matrix
    /// of their own may still have one attached to decoded frames.
    fn resolve_rotation(&mut self) -> u32 {
        if let Some(r) = self.rotation {
            return r;
        }
        let r = self
            .decoded
            .side_data(frame::side_data::Type::DisplayMatrix)
            .and_then(|sd| display_matrix_from_bytes(sd.data()))
            .and_then(|m| display_rotation(&m))
            .unwrap_or(0);
        if r != 0 {
            info!(rotation = r, "rotation taken from frame display matrix");
        }
        self.rotation = Some(r);
        r
    }

    fn convert_decoded(&mut self) -> Result<(RgbFrame, f64)> {
        self.to_rgb
            .run(&self.decoded, &mut self.rgb)
            .context("to-RGB scaling failed")?;

        // Compact to a plain Vec<u8> (remove stride padding if any)
        let width = self.decoded.width();
        let height = self.decoded.height();
        let stride = self.rgb.stride(0);
        let raw = self.rgb.data(0);
        let mut data = Vec::with_capacity(width as usize * height as usize * 3);
        for row in 0..height as usize {
            let start = row * stride;
            data.extend_from_slice(&raw[start..start + width as usize * 3]);
        }

        let pts = self
            .decoded
            .timestamp()
            .or_else(|| self.decoded.pts())
            .unwrap_or(self.frame_count as i64);
        let ts = pts as f64 * self.time_base;

        self.frame_count += 1;
        if self.frame_count % 300 == 0 {
            debug!(frames = self.frame_count, ts, "decoded frames");
        }

        let rotation = self.resolve_rotation();
        let frame = RgbFrame {
            data,
            width,
            height,
        }
        .rotated(rotation)?;
        Ok((frame, ts))
    }
}

/// Clockwise rotation of a stream: the display matrix side data, then the
/// legacy `rotate` tag that FFmpeg < 5 exported.
fn stream_rotation(stream: &format::stream::Stream) -> Option<u32> {
    let from_matrix = stream
        .side_data()
        .find(|sd| sd.kind() == codec::packet::side_data::Type::DisplayMatrix)
        .and_then(|sd| display_matrix_from_bytes(sd.data()))
        .and_then(|m| display_rotation(&m));
    from_matrix.or_else(|| {
        stream
            .metadata()
            .get("rotate")
            .and_then(|r| r.trim().parse::<i32>().ok())
            .map(|r| r.rem_euclid(360) as u32)
    })
}

/// Reads the nine native-endian `i32` entries of an FFmpeg display matrix.
fn display_matrix_from_bytes(bytes: &[u8]) -> Option<[i32; 9]> {
    if bytes.len() < 36 {
        return None;
    }
    let mut m = [0i32; 9];
    for (i, chunk) in bytes.chunks_exact(4).take(9).enumerate() {
        m[i] = i32::from_ne_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
    }
    Some(m)
}

/// Clockwise rotation in degrees, snapped to a quarter turn, that brings a
/// frame to its display orientation.
///
/// The matrix entries `a, b, c, d` are 16.16 fixed point. This is the
/// negation of `av_display_rotation_get`, which reports counterclockwise
/// degrees. Degenerate matrices yield `None`.
pub fn display_rotation(matrix: &[i32; 9]) -> Option<u32> {
    let fp = |i: usize| matrix[i] as f64 / 65536.0;
    let scale0 = fp(0).hypot(fp(3));
    let scale1 = fp(1).hypot(fp(4));
    if scale0 == 0.0 || scale1 == 0.0 {
        return None;
    }
    let clockwise = (fp(1) / scale1).atan2(fp(0) / scale0).to_degrees();
    let quarter = (clockwise / 90.0).round() as i64;
    Some((quarter * 90).rem_euclid(360) as u32)
}

impl VideoSource for FfmpegSource {
    fn next_frame(&mut self) -> Result<Option<(RgbFrame, f64)>> {
        loop {
            if self.decoder.receive_frame(&mut self.decoded).is_ok() {
                return self.convert_decoded().map(Some);
            }
            if self.eof_sent {
                return Ok(None);
            }

            let mut packet = ffmpeg::Packet::empty();
            match packet.read(&mut self.input) {
                Ok(()) => {
                    if packet.stream() != self.stream_index {
                        continue;
                    }
                    if let Err(e) = self.decoder.send_packet(&packet) {
                        warn!("decoder rejected packet: {e}");
                    }
                }
                Err(ffmpeg::Error::Eof) => {
                    self.decoder.send_eof().ok();
                    self.eof_sent = true;
                }
                Err(e) => return Err(e).context("failed to read packet"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gradient(width: u32, height: u32) -> RgbFrame {
        let mut data = Vec::new();
        for y in 0..height {
            for x in 0..width {
                data.extend_from_slice(&[x as u8, y as u8, 0]);
            }
        }
        RgbFrame::new(width, height, data).unwrap()
    }

    /// `av_display_rotation_set` layout for a clockwise quarter-turn count.
    fn matrix_for(clockwise: i32) -> [i32; 9] {
        let one = 1 << 16;
        let (c, s) = match clockwise.rem_euclid(360) {
            0 => (one, 0),
            90 => (0, -one),
            180 => (-one, 0),
            _ => (0, one),
        };
        [c, -s, 0, s, c, 0, 0, 0, 1 << 30]
    }

    #[test]
    fn display_matrix_maps_to_clockwise_quarter_turns() {
        assert_eq!(display_rotation(&matrix_for(0)), Some(0));
        assert_eq!(display_rotation(&matrix_for(90)), Some(90));
        assert_eq!(display_rotation(&matrix_for(180)), Some(180));
        assert_eq!(display_rotation(&matrix_for(270)), Some(270));
        // iPhone portrait: b = 1.0, c = -1.0
        let portrait = [0, 65536, 0, -65536, 0, 0, 0, 0, 1 << 30];
        assert_eq!(display_rotation(&portrait), Some(90));
    }

    #[test]
    fn display_matrix_snaps_and_rejects_degenerate_input() {
        // 88 degrees clockwise, scaled by 2
        let t = 88f64.to_radians();
        let k = 2.0 * 65536.0;
        let m = [
            (t.cos() * k) as i32,
            (t.sin() * k) as i32,
            0,
            (-t.sin() * k) as i32,
            (t.cos() * k) as i32,
            0,
            0,
            0,
            1 << 30,
        ];
        assert_eq!(display_rotation(&m), Some(90));
        assert_eq!(display_rotation(&[0; 9]), None);
    }

    #[test]
    fn display_matrix_bytes_are_read_native_endian() {
        let m = matrix_for(270);
        let bytes: Vec<u8> = m.iter().flat_map(|v| v.to_ne_bytes()).collect();
        assert_eq!(display_matrix_from_bytes(&bytes), Some(m));
        assert_eq!(display_matrix_from_bytes(&bytes[..35]), None);
        let frame = gradient(4, 2)
            .rotated(display_rotation(&m).unwrap())
            .unwrap();
        assert_eq!((frame.width, frame.height), (2, 4));
    }

    #[test]
    fn new_rejects_mismatched_buffer() {
        assert!(RgbFrame::new(4, 4, vec![0; 10]).is_err());
    }

    #[test]
    fn crop_copies_the_requested_region() {
        let frame = gradient(8, 6);
        let bbox = BoundingBox {
            top: 1,
            bottom: 4,
            left: 2,
            right: 5,
        };
        let crop = frame.crop(&bbox).unwrap();
        assert_eq!((crop.width, crop.height), (3, 3));
        // first pixel is (x=2, y=1)
        assert_eq!(&crop.data[0..3], &[2, 1, 0]);
        // last pixel is (x=4, y=3)
        assert_eq!(&crop.data[crop.data.len() - 3..], &[4, 3, 0]);
    }

    #[test]
    fn crop_clips_to_frame_and_rejects_empty_regions() {
        let frame = gradient(8, 6);
        let clipped = frame
            .crop(&BoundingBox {
                top: 4,
                bottom: 100,
                left: 6,
                right: 100,
            })
            .unwrap();
        assert_eq!((clipped.width, clipped.height), (2, 2));

        let empty = BoundingBox {
            top: 3,
            bottom: 3,
            left: 0,
            right: 8,
        };
        assert!(frame.crop(&empty).is_none());
    }

    #[test]
    fn rotation_swaps_dimensions() {
        let frame = gradient(8, 6);
        let r90 = frame.clone().rotated(90).unwrap();
        assert_eq!((r90.width, r90.height), (6, 8));
        let r180 = frame.clone().rotated(180).unwrap();
        assert_eq!((r180.width, r180.height), (8, 6));
        assert_eq!(&r180.data[0..3], &[7, 5, 0]);
        let same = frame.clone().rotated(45).unwrap();
        assert_eq!(same, frame);
    }

    #[test]
    fn resizer_hits_target_resolution() {
        let mut resizer = CropResizer::new(4, 4);
        let out = resizer.resize(&RgbFrame::filled(16, 12, [10, 20, 30])).unwrap();
        assert_eq!((out.width, out.height), (4, 4));
        assert_eq!(out.data.len(), 4 * 4 * 3);
        assert_eq!(&out.data[0..3], &[10, 20, 30]);
    }

    #[test]
    fn vec_source_yields_in_order_then_ends() {
        let mut src = VecSource::new([
            (RgbFrame::filled(2, 2, [0, 0, 0]), 0.0),
            (RgbFrame::filled(2, 2, [1, 1, 1]), 0.5),
        ]);
        assert_eq!(src.next_frame().unwrap().unwrap().1, 0.0);
        assert_eq!(src.next_frame().unwrap().unwrap().1, 0.5);
        assert!(src.next_frame().unwrap().is_none());
    }
}
