use std::path::Path;

use anyhow::{Context, Result};
use ort::session::Session;
use ort::value::{DynValue, Tensor};
use rayon::prelude::*;
use tracing::{debug, info};

use super::{ModelMeta, ModelState, SignalExtractor, StateTensor};
use crate::buffer::{FaceCrop, SignalChunk};
use crate::detection::build_ort_session;

/// Input tensor name shared by every exported extraction model.
const INPUT_NAME: &str = "input";

/// Runs an exported extraction model through ONNX Runtime.
///
/// Input is `[1, N, H, W, 3]` float in `[0, 1]`; each state tensor is fed
/// under its own name and read back from `<name>_out`; one output per
/// channel, flattened to `N` values.
pub struct OnnxExtractor {
    session: Session,
    chunk: usize,
    height: u32,
    width: u32,
    channels: Vec<String>,
}

impl OnnxExtractor {
    pub fn load(model_path: &Path, meta: &ModelMeta, state: &ModelState) -> Result<Self> {
        anyhow::ensure!(
            model_path.is_file(),
            "model file not found: {}",
            model_path.display()
        );
        let session = build_ort_session(model_path, "failed to load extraction ONNX model")?;
        info!(
            path = %model_path.display(),
            chunk = meta.chunk,
            state_tensors = state.tensors.len(),
            "extraction model loaded"
        );
        Ok(Self {
            session,
            chunk: meta.chunk,
            height: meta.height,
            width: meta.width,
            channels: meta.channels.clone(),
        })
    }

    fn batch_tensor(&self, batch: &[FaceCrop]) -> Result<DynValue> {
        let frame_len = (self.height * self.width * 3) as usize;
        for crop in batch {
            anyhow::ensure!(
                crop.width == self.width && crop.height == self.height,
                "crop is {}x{}, model expects {}x{}",
                crop.width,
                crop.height,
                self.width,
                self.height
            );
        }

        let mut data = vec![0f32; batch.len() * frame_len];
        data.par_chunks_mut(frame_len)
            .zip(batch.par_iter())
            .for_each(|(out, crop)| {
                for (dst, &src) in out.iter_mut().zip(&crop.data) {
                    *dst = src as f32 / 255.0;
                }
            });

        let shape = [
            1usize,
            batch.len(),
            self.height as usize,
            self.width as usize,
            3,
        ];
        Ok(Tensor::from_array((shape, data.into_boxed_slice()))
            .context("failed to create batch tensor")?
            .into_dyn())
    }
}

impl SignalExtractor for OnnxExtractor {
    fn extract(
        &mut self,
        batch: &[FaceCrop],
        state: ModelState,
    ) -> Result<(SignalChunk, ModelState)> {
        anyhow::ensure!(
            batch.len() == self.chunk,
            "batch of {} crops, model expects {}",
            batch.len(),
            self.chunk
        );

        let mut inputs: Vec<(String, DynValue)> = Vec::with_capacity(1 + state.tensors.len());
        inputs.push((INPUT_NAME.to_string(), self.batch_tensor(batch)?));
        for t in &state.tensors {
            let shape: Vec<i64> = t.shape.iter().map(|&d| d as i64).collect();
            let value = Tensor::from_array((shape, t.data.clone().into_boxed_slice()))
                .with_context(|| format!("failed to create state tensor '{}'", t.name))?
                .into_dyn();
            inputs.push((t.name.clone(), value));
        }

        let outputs = self
            .session
            .run(inputs)
            .context("extraction inference failed")?;

        let mut chunk = SignalChunk::new();
        for name in &self.channels {
            let value = outputs
                .get(name.as_str())
                .with_context(|| format!("model has no '{name}' output"))?;
            let (_shape, data) = value
                .try_extract_tensor::<f32>()
                .with_context(|| format!("failed to extract '{name}' output"))?;
            anyhow::ensure!(
                data.len() == batch.len(),
                "'{name}' output has {} values for {} crops",
                data.len(),
                batch.len()
            );
            chunk.insert(name.clone(), data.iter().map(|&v| f64::from(v)).collect());
        }

        let mut next = ModelState::empty();
        for t in &state.tensors {
            let out_name = format!("{}_out", t.name);
            let value = outputs
                .get(out_name.as_str())
                .with_context(|| format!("model has no '{out_name}' output"))?;
            let (shape, data) = value
                .try_extract_tensor::<f32>()
                .with_context(|| format!("failed to extract '{out_name}' output"))?;
            next.tensors.push(StateTensor {
                name: t.name.clone(),
                shape: shape.iter().map(|&d| d.max(0) as usize).collect(),
                data: data.to_vec(),
            });
        }

        debug!(crops = batch.len(), "extraction call complete");
        Ok((chunk, next))
    }
}
