//! Typed failures of the public session surface.
//!
//! Collaborators (detector, extractor, beat detector, video source) speak
//! `anyhow::Result`; their errors are wrapped here at the pipeline boundary.

use std::sync::PoisonError;

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("unknown model '{0}'")]
    UnknownModel(String),

    #[error("start must be less than end (start = {start:.3}s, end = {end:.3}s)")]
    InvalidRange { start: f64, end: f64 },

    #[error("a session is already running")]
    AlreadyRunning,

    #[error("no session is running")]
    NotRunning,

    #[error("signal too short: need at least {needed} samples, got {got}")]
    SignalTooShort { needed: usize, got: usize },

    /// Per-beat normalisation needs a first and a last extremum to splice
    /// between; fewer than two leaves the segment rescaling undefined.
    #[error("per-beat normalisation needs at least two extrema, found {found}")]
    TooFewExtrema { found: usize },

    #[error("channel '{0}' not present in extracted signal")]
    MissingChannel(String),

    /// Sticky failure latched by the consumer thread.
    #[error("pipeline failed: {0}")]
    PipelineFailed(String),

    #[error("face detector failed: {0:#}")]
    Detector(anyhow::Error),

    #[error("signal extraction failed: {0:#}")]
    Extraction(anyhow::Error),

    #[error("video source failed: {0:#}")]
    Video(anyhow::Error),
}

impl<T> From<PoisonError<T>> for Error {
    fn from(_: PoisonError<T>) -> Self {
        Error::PipelineFailed("shared buffer lock poisoned".into())
    }
}
