//! Face localisation contract plus an ONNX single-shot face detector.
//!
//! The pipeline only needs zero-or-one face per frame. Any detector that can
//! answer `detect(frame, timestamp)` plugs in through [`FaceDetector`];
//! [`OnnxFaceDetector`] covers the common "scores + boxes" SSD-style export
//! (e.g. the 320×240 RFB face models).

use std::path::Path;

use anyhow::{Context, Result};
use fast_image_resize as fr;
use ort::execution_providers as ep;
use ort::session::Session;
use ort::value::Tensor;
use rayon::prelude::*;
use serde::Serialize;
use tracing::debug;

use crate::config::BoxMargin;
use crate::video::RgbFrame;

// ── Constants ────────────────────────────────────────────────────────────────

/// Default detector input size (width × height).
const DETECTOR_WIDTH: u32 = 320;
const DETECTOR_HEIGHT: u32 = 240;
/// Minimum face score for a detection to count.
const CONF_THRESHOLD: f32 = 0.7;
/// Input normalisation: (pixel - MEAN) / STD.
const PIXEL_MEAN: f32 = 127.0;
const PIXEL_STD: f32 = 128.0;

// ── Public types ─────────────────────────────────────────────────────────────

/// Raw detector output: axis-aligned box in pixel coordinates of the frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
    pub confidence: f32,
}

impl BBox {
    pub fn width(&self) -> f32 {
        self.x2 - self.x1
    }
    pub fn height(&self) -> f32 {
        self.y2 - self.y1
    }

    /// Expand vertically by `margin` and return the raw crop coordinates
    /// `[top, bottom, left, right]`, clamped at zero.
    pub fn to_crop_coords(&self, margin: &BoxMargin) -> [f64; 4] {
        let h = self.height() as f64;
        let top = self.y1 as f64 - (h * margin.top).round();
        let bottom = self.y1 as f64 + (h * margin.bottom).round();
        [
            top.max(0.0),
            bottom.max(0.0),
            (self.x1 as f64).max(0.0),
            (self.x2 as f64).max(0.0),
        ]
    }
}

/// Face region used for cropping: non-negative pixel rows/columns,
/// half-open (`bottom` and `right` are exclusive).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct BoundingBox {
    pub top: u32,
    pub bottom: u32,
    pub left: u32,
    pub right: u32,
}

impl BoundingBox {
    /// Round and clamp raw `[top, bottom, left, right]` coordinates.
    pub fn from_coords(coords: [f64; 4]) -> Self {
        let px = |v: f64| if v.is_finite() { v.round().max(0.0) as u32 } else { 0 };
        Self {
            top: px(coords[0]),
            bottom: px(coords[1]),
            left: px(coords[2]),
            right: px(coords[3]),
        }
    }

    pub fn coords(&self) -> [f64; 4] {
        [
            self.top as f64,
            self.bottom as f64,
            self.left as f64,
            self.right as f64,
        ]
    }

    pub fn width(&self) -> u32 {
        self.right.saturating_sub(self.left)
    }

    pub fn height(&self) -> u32 {
        self.bottom.saturating_sub(self.top)
    }
}

/// Face-localisation collaborator. Invoked from the ingestion path at the
/// configured cadence; never called concurrently.
pub trait FaceDetector: Send {
    fn detect(&mut self, frame: &RgbFrame, timestamp: f64) -> Result<Option<BBox>>;
}

impl<D: FaceDetector + ?Sized> FaceDetector for Box<D> {
    fn detect(&mut self, frame: &RgbFrame, timestamp: f64) -> Result<Option<BBox>> {
        (**self).detect(frame, timestamp)
    }
}

// ── OnnxFaceDetector ─────────────────────────────────────────────────────────

/// Wraps an SSD-style face detection ONNX session with `scores [1, A, 2]`
/// and `boxes [1, A, 4]` outputs (normalised corner coordinates).
pub struct OnnxFaceDetector {
    session: Session,
    resizer: fr::Resizer,
    resize_buf: Vec<u8>,
    input_width: u32,
    input_height: u32,
    threshold: f32,
}

impl OnnxFaceDetector {
    /// Load a face detector ONNX model from `model_path`.
    pub fn load<P: AsRef<Path>>(model_path: P) -> Result<Self> {
        let session =
            build_ort_session(model_path.as_ref(), "failed to load face detector ONNX model")?;
        Ok(Self {
            session,
            resizer: fr::Resizer::new(),
            resize_buf: vec![0u8; (DETECTOR_WIDTH * DETECTOR_HEIGHT * 3) as usize],
            input_width: DETECTOR_WIDTH,
            input_height: DETECTOR_HEIGHT,
            threshold: CONF_THRESHOLD,
        })
    }

    pub fn with_threshold(mut self, threshold: f32) -> Self {
        self.threshold = threshold.clamp(0.0, 1.0);
        self
    }

    fn preprocess(&mut self, frame: &RgbFrame) -> Result<ort::value::DynValue> {
        let src =
            fr::images::ImageRef::new(frame.width, frame.height, &frame.data, fr::PixelType::U8x3)
                .context("failed to create fast_image_resize source")?;

        let mut dst = fr::images::Image::from_vec_u8(
            self.input_width,
            self.input_height,
            std::mem::take(&mut self.resize_buf),
            fr::PixelType::U8x3,
        )
        .context("failed to create fast_image_resize destination")?;

        let options = fr::ResizeOptions::new()
            .resize_alg(fr::ResizeAlg::Convolution(fr::FilterType::Bilinear));
        self.resizer
            .resize(&src, &mut dst, Some(&options))
            .context("detector input resize failed")?;

        self.resize_buf = dst.into_vec();
        let raw = &self.resize_buf;

        // NCHW float tensor: [1, 3, H, W].
        let size = (self.input_width * self.input_height) as usize;
        let mut tensor_data = vec![0f32; 3 * size];
        tensor_data
            .par_chunks_mut(size)
            .enumerate()
            .for_each(|(channel, plane)| {
                for (idx, out) in plane.iter_mut().enumerate() {
                    *out = (raw[idx * 3 + channel] as f32 - PIXEL_MEAN) / PIXEL_STD;
                }
            });

        let shape = [1usize, 3, self.input_height as usize, self.input_width as usize];
        Ok(Tensor::from_array((shape, tensor_data.into_boxed_slice()))
            .context("failed to create detector input tensor")?
            .into_dyn())
    }
}

impl FaceDetector for OnnxFaceDetector {
    fn detect(&mut self, frame: &RgbFrame, timestamp: f64) -> Result<Option<BBox>> {
        let input_tensor = self.preprocess(frame)?;

        let outputs = self
            .session
            .run(ort::inputs!["input" => input_tensor])
            .context("face detector inference failed")?;

        let (_shape, scores) = outputs["scores"]
            .try_extract_tensor::<f32>()
            .context("failed to extract detector scores")?;
        let (_shape, boxes) = outputs["boxes"]
            .try_extract_tensor::<f32>()
            .context("failed to extract detector boxes")?;

        let anchors = scores.len() / 2;
        anyhow::ensure!(
            boxes.len() == anchors * 4,
            "detector outputs disagree: {anchors} scores vs {} box values",
            boxes.len()
        );

        let best = (0..anchors)
            .map(|i| (i, scores[i * 2 + 1]))
            .filter(|&(_, s)| s >= self.threshold)
            .max_by(|a, b| a.1.total_cmp(&b.1));

        let Some((i, confidence)) = best else {
            debug!(timestamp, "no face above threshold");
            return Ok(None);
        };

        let w = frame.width as f32;
        let h = frame.height as f32;
        let b = &boxes[i * 4..i * 4 + 4];
        let bbox = BBox {
            x1: (b[0] * w).clamp(0.0, w),
            y1: (b[1] * h).clamp(0.0, h),
            x2: (b[2] * w).clamp(0.0, w),
            y2: (b[3] * h).clamp(0.0, h),
            confidence,
        };
        debug!(timestamp, confidence, x1 = bbox.x1, y1 = bbox.y1, "face detected");
        Ok(Some(bbox))
    }
}

/// Build an ORT session the way every model in this crate is loaded:
/// single-threaded intra/inter op, CoreML when available.
pub(crate) fn build_ort_session(model_path: &Path, load_error: &'static str) -> Result<Session> {
    let mut builder = Session::builder().context("failed to create ORT session builder")?;
    builder = builder
        .with_intra_threads(1)
        .context("failed to set ORT intra threads")?;
    builder = builder
        .with_inter_threads(1)
        .context("failed to set ORT inter threads")?;
    builder = builder
        .with_parallel_execution(false)
        .context("failed to set ORT parallel execution")?;
    builder = builder
        .with_execution_providers([ep::CoreMLExecutionProvider::default()
            .with_compute_units(ep::coreml::CoreMLComputeUnits::CPUAndNeuralEngine)
            .build()])
        .context("failed to register execution providers")?;
    builder.commit_from_file(model_path).context(load_error)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crop_coords_extend_above_and_below_the_face() {
        let bbox = BBox {
            x1: 40.0,
            y1: 50.0,
            x2: 90.0,
            y2: 100.0,
            confidence: 0.9,
        };
        let coords = bbox.to_crop_coords(&BoxMargin::default());
        // height 50: 10 px above, 45 px below the top edge
        assert_eq!(coords, [40.0, 95.0, 40.0, 90.0]);
    }

    #[test]
    fn crop_coords_clamp_at_zero() {
        let bbox = BBox {
            x1: -5.0,
            y1: 2.0,
            x2: 30.0,
            y2: 52.0,
            confidence: 0.9,
        };
        let coords = bbox.to_crop_coords(&BoxMargin::default());
        assert_eq!(coords[0], 0.0);
        assert_eq!(coords[2], 0.0);
    }

    #[test]
    fn bounding_box_rounds_and_clamps() {
        let b = BoundingBox::from_coords([-3.2, 10.6, 4.4, f64::NAN]);
        assert_eq!(
            b,
            BoundingBox {
                top: 0,
                bottom: 11,
                left: 4,
                right: 0
            }
        );
        assert_eq!(b.width(), 0);
        assert_eq!(b.height(), 11);
    }
}
