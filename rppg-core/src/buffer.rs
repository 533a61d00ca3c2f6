//! buffer: the two queues shared between ingestion and the consumer thread
//!
//! `FaceBuffer` holds admitted crops waiting for extraction plus the
//! timestamp of every admitted frame. `SignalBuffer` is the append-only log
//! of extraction results. Each sits behind its own mutex; nothing ever holds
//! both locks at once.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use crate::error::{Error, Result};
use crate::video::RgbFrame;

/// A resized face crop. Forward-filled admissions share one allocation.
pub type FaceCrop = Arc<RgbFrame>;

/// Channel name → one value per consumed crop.
pub type SignalChunk = BTreeMap<String, Vec<f64>>;

// ── FaceBuffer ───────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct FaceBuffer {
    pending: VecDeque<FaceCrop>,
    timestamps: Vec<f64>,
}

impl FaceBuffer {
    pub fn push(&mut self, crop: FaceCrop, timestamp: f64) {
        self.pending.push_back(crop);
        self.timestamps.push(timestamp);
    }

    /// Crops admitted but not yet handed to the extractor.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Frames admitted over the whole session.
    pub fn admitted(&self) -> usize {
        self.timestamps.len()
    }

    /// Remove exactly `n` crops from the front, or nothing if fewer are queued.
    pub fn take_chunk(&mut self, n: usize) -> Option<Vec<FaceCrop>> {
        if self.pending.len() < n {
            return None;
        }
        Some(self.pending.drain(..n).collect())
    }

    /// Remove everything still queued.
    pub fn drain(&mut self) -> Vec<FaceCrop> {
        self.pending.drain(..).collect()
    }

    pub fn timestamps(&self) -> &[f64] {
        &self.timestamps
    }
}

// ── SignalBuffer ─────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct SignalBuffer {
    chunks: Vec<SignalChunk>,
    produced: usize,
}

impl SignalBuffer {
    /// Append one extraction result covering `samples` admitted frames.
    pub fn append(&mut self, chunk: SignalChunk, samples: usize) {
        self.chunks.push(chunk);
        self.produced += samples;
    }

    /// Samples produced so far.
    pub fn produced(&self) -> usize {
        self.produced
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Every channel of the first chunk, concatenated across all chunks.
    pub fn concat(&self) -> SignalChunk {
        let Some(first) = self.chunks.first() else {
            return SignalChunk::new();
        };
        first
            .keys()
            .map(|name| {
                let joined = self
                    .chunks
                    .iter()
                    .filter_map(|c| c.get(name))
                    .flat_map(|v| v.iter().copied())
                    .collect();
                (name.clone(), joined)
            })
            .collect()
    }
}

// ── Shared session state ─────────────────────────────────────────────────────

/// Everything the ingestion path, the consumer thread and readers share.
#[derive(Debug, Default)]
pub struct SharedBuffers {
    pub faces: Mutex<FaceBuffer>,
    pub signal: Mutex<SignalBuffer>,
    active: AtomicBool,
    failure: OnceLock<String>,
}

impl SharedBuffers {
    pub fn new() -> Arc<Self> {
        let shared = Self::default();
        shared.active.store(true, Ordering::Release);
        Arc::new(shared)
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// One-way stop signal.
    pub fn deactivate(&self) {
        self.active.store(false, Ordering::Release);
    }

    /// Latch the first consumer failure; later ones are ignored.
    pub fn latch_failure(&self, message: String) {
        let _ = self.failure.set(message);
    }

    pub fn failure(&self) -> Option<&str> {
        self.failure.get().map(String::as_str)
    }

    pub fn check_failure(&self) -> Result<()> {
        match self.failure() {
            Some(msg) => Err(Error::PipelineFailed(msg.to_string())),
            None => Ok(()),
        }
    }

    /// Concatenated signal and the absolute timestamps of its samples.
    ///
    /// The signal lock is released before the face lock is taken; `produced`
    /// is read under the same lock as the chunks, so the two always agree.
    pub fn snapshot(&self) -> Result<(SignalChunk, Vec<f64>)> {
        let (signals, produced) = {
            let signal = self.signal.lock()?;
            (signal.concat(), signal.produced())
        };
        let faces = self.faces.lock()?;
        let ts = faces.timestamps();
        Ok((signals, ts[..produced.min(ts.len())].to_vec()))
    }

    /// Samples produced so far.
    pub fn produced(&self) -> Result<usize> {
        Ok(self.signal.lock()?.produced())
    }
}
