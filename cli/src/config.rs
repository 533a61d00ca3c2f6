//! Config file support for `rppg`.
//!
//! A TOML file supplies defaults: `--config <path>` if given, otherwise
//! `./rppg.toml` when present. Command-line flags override anything read
//! here.
//!
//! ```toml
//! model_dir = "models"
//! detector = "models/face_detector.onnx"
//! json = false
//!
//! [pipeline]
//! model = "PhysNet.pure"
//! detect_every = 2
//!
//! [pipeline.hr_band]
//! max_bpm = 150
//! ```

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use rppg_core::{ModelId, PipelineConfig};
use serde::Deserialize;
use tracing::{debug, info, warn};

const LOCAL_CONFIG: &str = "rppg.toml";

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    /// Directory holding `<model-id>.onnx` files.
    pub model_dir: Option<PathBuf>,
    /// Face detector ONNX model.
    pub detector: Option<PathBuf>,
    /// Print the report as JSON.
    pub json: Option<bool>,
    pub pipeline: PipelineConfig,
}

/// Flag values that take precedence over the file.
#[derive(Debug, Default, Clone)]
pub struct Overrides {
    pub model_dir: Option<PathBuf>,
    pub detector: Option<PathBuf>,
    pub model: Option<ModelId>,
    pub detect_every: Option<u32>,
    pub sample_rate: Option<f64>,
    pub json: bool,
}

/// Fully resolved settings for one run.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub model_dir: PathBuf,
    pub detector: PathBuf,
    pub json: bool,
    pub pipeline: PipelineConfig,
}

impl FileConfig {
    /// Read `explicit`, or `./rppg.toml` if it exists, or fall back to
    /// defaults. An explicit path must exist and parse; the implicit one is
    /// skipped with a warning when it does not parse.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            info!(path = %path.display(), "loading config");
            return Self::from_file(path);
        }
        let local = PathBuf::from(LOCAL_CONFIG);
        if !local.is_file() {
            debug!("no {LOCAL_CONFIG} in the working directory; using defaults");
            return Ok(Self::default());
        }
        info!(path = %local.display(), "loading config");
        match Self::from_file(&local) {
            Ok(config) => Ok(config),
            Err(e) => {
                warn!(error = %format!("{e:#}"), "ignoring unreadable local config");
                Ok(Self::default())
            }
        }
    }

    fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        toml::from_str(&text)
            .with_context(|| format!("failed to parse config file {}", path.display()))
    }

    /// Layer `flags` over the file values and fill remaining defaults.
    pub fn resolve(self, flags: Overrides) -> RunConfig {
        let model_dir = flags
            .model_dir
            .or(self.model_dir)
            .unwrap_or_else(|| PathBuf::from("models"));
        let detector = flags
            .detector
            .or(self.detector)
            .unwrap_or_else(|| model_dir.join("face_detector.onnx"));

        let mut pipeline = self.pipeline;
        if let Some(model) = flags.model {
            pipeline.model = model;
        }
        if let Some(n) = flags.detect_every {
            pipeline.detect_every = n;
        }
        if flags.sample_rate.is_some() {
            pipeline.sample_rate = flags.sample_rate;
        }

        RunConfig {
            model_dir,
            detector,
            json: flags.json || self.json.unwrap_or(false),
            pipeline,
        }
    }
}
