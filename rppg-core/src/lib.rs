pub mod buffer;
pub mod config;
pub mod detection;
pub mod dsp;
pub mod error;
pub mod ingest;
pub mod model;
pub mod pipeline;
pub mod preview;
pub mod runtime;
pub mod scheduler;
pub mod tracking;
pub mod video;
pub mod vitals;
pub mod window;

// Re-export the session surface so callers rarely need the module paths.
pub use config::{ModelId, PipelineConfig};
pub use detection::{BBox, BoundingBox, FaceDetector, OnnxFaceDetector};
pub use error::{Error, Result};
pub use model::{ModelMeta, ModelRegistry, ModelSpec, ModelState, SignalExtractor};
pub use pipeline::{CaptureHandle, Pipeline, Session, run_to_completion};
pub use preview::Preview;
pub use video::{FfmpegSource, RgbFrame, VecSource, VideoSource};
pub use vitals::{BeatDetector, PeakBeatDetector, VitalsReport};
pub use window::Window;
