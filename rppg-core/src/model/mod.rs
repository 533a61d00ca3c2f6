//! Signal-extraction contract and the model registry.
//!
//! A model is data: metadata (rate, chunk size, input resolution, output
//! channels) plus an initial recurrent state and something implementing
//! [`SignalExtractor`]. The registry maps each [`ModelId`] to a loader that
//! produces those three pieces.

mod onnx;

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

pub use onnx::OnnxExtractor;

use crate::buffer::{FaceCrop, SignalChunk};
use crate::config::{ModelFamily, ModelId};
use crate::error::{Error, Result};

/// Name of the pulse channel every model emits.
pub const BVP_CHANNEL: &str = "bvp";

// ── Metadata ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelMeta {
    /// Nominal frame rate the model was trained at.
    pub fps: f64,
    /// Crops consumed per extraction call.
    pub chunk: usize,
    pub height: u32,
    pub width: u32,
    pub channels: Vec<String>,
    /// The pulse channel is a derivative and must be integrated.
    pub cumsum_output: bool,
}

impl ModelMeta {
    pub fn for_family(family: ModelFamily) -> Self {
        let (chunk, side, cumsum_output) = match family {
            ModelFamily::MeChunk => (180, 36, false),
            ModelFamily::MeFlow => (1, 36, false),
            ModelFamily::PhysMamba => (128, 128, false),
            ModelFamily::RhythmMamba => (160, 128, false),
            ModelFamily::PhysFormer => (160, 128, false),
            ModelFamily::Tscan => (180, 72, true),
            ModelFamily::PhysNet => (128, 32, false),
            ModelFamily::EfficientPhys => (180, 72, true),
        };
        Self {
            fps: 30.0,
            chunk,
            height: side,
            width: side,
            channels: vec![BVP_CHANNEL.to_string()],
            cumsum_output,
        }
    }
}

// ── Recurrent state ──────────────────────────────────────────────────────────

/// One named state tensor, row-major.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateTensor {
    pub name: String,
    pub shape: Vec<usize>,
    #[serde(default)]
    pub data: Vec<f32>,
}

impl StateTensor {
    pub fn zeros(name: impl Into<String>, shape: Vec<usize>) -> Self {
        let len = shape.iter().product();
        Self {
            name: name.into(),
            shape,
            data: vec![0.0; len],
        }
    }
}

/// Recurrent model state, threaded by value through successive calls.
/// Empty for stateless models.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelState {
    pub tensors: Vec<StateTensor>,
}

impl ModelState {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    /// Read a state layout sidecar (`[{"name": .., "shape": [..]}, ..]`);
    /// tensors without data start at zero.
    pub fn from_layout_file(path: &Path) -> anyhow::Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read state layout {}", path.display()))?;
        let tensors: Vec<StateTensor> = serde_json::from_str(&text)
            .with_context(|| format!("failed to parse state layout {}", path.display()))?;
        let tensors = tensors
            .into_iter()
            .map(|t| {
                let len: usize = t.shape.iter().product();
                if t.data.len() == len {
                    t
                } else {
                    StateTensor::zeros(t.name, t.shape)
                }
            })
            .collect();
        Ok(Self { tensors })
    }
}

// ── Extraction contract ──────────────────────────────────────────────────────

/// Converts a batch of face crops into per-frame signal values.
///
/// Calls are strictly sequential: the consumer thread owns the extractor and
/// never issues a second call before the first returns.
pub trait SignalExtractor: Send {
    fn extract(
        &mut self,
        batch: &[FaceCrop],
        state: ModelState,
    ) -> anyhow::Result<(SignalChunk, ModelState)>;
}

impl<E: SignalExtractor + ?Sized> SignalExtractor for Box<E> {
    fn extract(
        &mut self,
        batch: &[FaceCrop],
        state: ModelState,
    ) -> anyhow::Result<(SignalChunk, ModelState)> {
        (**self).extract(batch, state)
    }
}

/// What a loader produces.
pub struct ModelSpec {
    pub meta: ModelMeta,
    pub state: ModelState,
    pub extractor: Box<dyn SignalExtractor>,
}

impl fmt::Debug for ModelSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelSpec")
            .field("meta", &self.meta)
            .field("state_tensors", &self.state.tensors.len())
            .finish_non_exhaustive()
    }
}

// ── Registry ─────────────────────────────────────────────────────────────────

type Loader = Box<dyn Fn(&Path) -> anyhow::Result<ModelSpec> + Send + Sync>;

struct Entry {
    meta: ModelMeta,
    loader: Loader,
}

/// Model identifier → loader.
pub struct ModelRegistry {
    model_dir: PathBuf,
    entries: HashMap<ModelId, Entry>,
}

impl ModelRegistry {
    pub fn new(model_dir: impl Into<PathBuf>) -> Self {
        Self {
            model_dir: model_dir.into(),
            entries: HashMap::new(),
        }
    }

    /// Every known identifier bound to `<model_dir>/<id>.onnx`, with an
    /// optional `<id>.state.json` layout for recurrent models.
    pub fn with_onnx_defaults(model_dir: impl Into<PathBuf>) -> Self {
        let mut registry = Self::new(model_dir);
        for id in ModelId::ALL {
            let meta = ModelMeta::for_family(id.family());
            let loader_meta = meta.clone();
            registry.register(id, meta, move |dir| {
                let onnx = dir.join(format!("{id}.onnx"));
                let layout = dir.join(format!("{id}.state.json"));
                let state = if layout.is_file() {
                    ModelState::from_layout_file(&layout)?
                } else {
                    ModelState::empty()
                };
                let extractor = OnnxExtractor::load(&onnx, &loader_meta, &state)?;
                Ok(ModelSpec {
                    meta: loader_meta.clone(),
                    state,
                    extractor: Box::new(extractor),
                })
            });
        }
        registry
    }

    pub fn register<F>(&mut self, id: ModelId, meta: ModelMeta, loader: F)
    where
        F: Fn(&Path) -> anyhow::Result<ModelSpec> + Send + Sync + 'static,
    {
        self.entries.insert(
            id,
            Entry {
                meta,
                loader: Box::new(loader),
            },
        );
    }

    pub fn meta(&self, id: ModelId) -> Option<&ModelMeta> {
        self.entries.get(&id).map(|e| &e.meta)
    }

    /// Registered identifiers in declaration order.
    pub fn ids(&self) -> Vec<ModelId> {
        let mut ids: Vec<_> = self.entries.keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn load(&self, id: ModelId) -> Result<ModelSpec> {
        let entry = self
            .entries
            .get(&id)
            .ok_or_else(|| Error::UnknownModel(id.to_string()))?;
        (entry.loader)(&self.model_dir).map_err(Error::Extraction)
    }
}
