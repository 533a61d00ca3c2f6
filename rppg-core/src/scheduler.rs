//! scheduler: the single consumer thread feeding the extractor
//!
//! The thread sleeps on a counting channel (one message per admitted frame,
//! one more at shutdown). Each wake-up with at least a chunk's worth of
//! crops queued removes exactly one chunk and runs one extraction call.
//! After the stop flag falls, full chunks are drained without blocking and
//! any remainder is padded with its last crop, extracted, and cut back to its
//! true length.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::Context;
use crossbeam_channel::Receiver;
use tracing::{debug, error, info};

use crate::buffer::{FaceCrop, SharedBuffers, SignalChunk};
use crate::model::{ModelState, SignalExtractor};

/// Log a throughput summary every this many chunks.
const SUMMARY_EVERY: u64 = 10;

/// The extractor and the last state, handed back when the thread ends.
pub type ConsumerExit = (Box<dyn SignalExtractor>, ModelState);

pub struct PipelineScheduler {
    extractor: Box<dyn SignalExtractor>,
    state: ModelState,
    chunk: usize,
    wake: Receiver<()>,
    shared: Arc<SharedBuffers>,
    chunks_done: u64,
    prof_extract: Duration,
}

impl PipelineScheduler {
    pub fn new(
        extractor: Box<dyn SignalExtractor>,
        state: ModelState,
        chunk: usize,
        wake: Receiver<()>,
        shared: Arc<SharedBuffers>,
    ) -> Self {
        Self {
            extractor,
            state,
            chunk: chunk.max(1),
            wake,
            shared,
            chunks_done: 0,
            prof_extract: Duration::ZERO,
        }
    }

    pub fn spawn(self) -> std::io::Result<JoinHandle<ConsumerExit>> {
        thread::Builder::new()
            .name("rppg-consumer".into())
            .spawn(move || self.run())
    }

    fn run(mut self) -> ConsumerExit {
        if let Err(e) = self.consume() {
            let message = format!("{e:#}");
            error!(error = %message, "consumer thread stopped");
            self.shared.latch_failure(message);
        }
        info!(chunks = self.chunks_done, "consumer thread exited");
        (self.extractor, self.state)
    }

    fn consume(&mut self) -> anyhow::Result<()> {
        loop {
            if self.shared.is_active() && self.wake.recv().is_err() {
                // Every sender is gone; nothing more can arrive.
                self.shared.deactivate();
            }

            let batch = {
                let mut faces = self.shared.faces.lock().map_err(poisoned)?;
                match faces.take_chunk(self.chunk) {
                    Some(batch) => batch,
                    None if self.shared.is_active() => continue,
                    None => break,
                }
            };
            let len = batch.len();
            let result = self.call(&batch)?;
            self.append(result, len)?;
        }

        let rest = self.shared.faces.lock().map_err(poisoned)?.drain();
        for piece in rest.chunks(self.chunk) {
            let len = piece.len();
            if len == self.chunk {
                let result = self.call(piece)?;
                self.append(result, len)?;
                continue;
            }
            let mut padded = piece.to_vec();
            padded.resize(self.chunk, Arc::clone(&piece[len - 1]));
            let mut result = self.call(&padded)?;
            for values in result.values_mut() {
                values.truncate(len);
            }
            debug!(remainder = len, padded_to = self.chunk, "final chunk flushed");
            self.append(result, len)?;
        }
        Ok(())
    }

    /// One extraction call; a panic inside the extractor counts as an error.
    fn call(&mut self, batch: &[FaceCrop]) -> anyhow::Result<SignalChunk> {
        let state = std::mem::take(&mut self.state);
        let start = Instant::now();
        let extractor = &mut self.extractor;
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| extractor.extract(batch, state)));
        self.prof_extract += start.elapsed();

        let (result, state) = match outcome {
            Ok(r) => r.context("extraction call failed")?,
            Err(payload) => {
                let msg = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                anyhow::bail!("extractor panicked: {msg}");
            }
        };
        for (name, values) in &result {
            anyhow::ensure!(
                values.len() == batch.len(),
                "channel '{name}' returned {} values for {} crops",
                values.len(),
                batch.len()
            );
        }
        self.state = state;
        Ok(result)
    }

    fn append(&mut self, result: SignalChunk, samples: usize) -> anyhow::Result<()> {
        self.shared
            .signal
            .lock()
            .map_err(poisoned)?
            .append(result, samples);
        self.chunks_done += 1;

        if self.chunks_done % SUMMARY_EVERY == 0 {
            info!(
                chunks = self.chunks_done,
                extract_ms_per_chunk = format!(
                    "{:.2}",
                    self.prof_extract.as_secs_f64() * 1000.0 / self.chunks_done as f64
                ),
                "consumer timings"
            );
        }
        Ok(())
    }
}

fn poisoned<T>(_: std::sync::PoisonError<T>) -> anyhow::Error {
    anyhow::anyhow!("shared buffer lock poisoned")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::BVP_CHANNEL;
    use crate::video::RgbFrame;
    use crossbeam_channel::unbounded;

    /// Emits the first pixel value of each crop; counts calls in its state.
    struct PixelEcho;

    impl SignalExtractor for PixelEcho {
        fn extract(
            &mut self,
            batch: &[FaceCrop],
            mut state: ModelState,
        ) -> anyhow::Result<(SignalChunk, ModelState)> {
            if state.tensors.is_empty() {
                state
                    .tensors
                    .push(crate::model::StateTensor::zeros("calls", vec![1]));
            }
            state.tensors[0].data[0] += 1.0;
            let values = batch.iter().map(|c| f64::from(c.data[0])).collect();
            Ok((
                SignalChunk::from([(BVP_CHANNEL.to_string(), values)]),
                state,
            ))
        }
    }

    struct Exploding;

    impl SignalExtractor for Exploding {
        fn extract(
            &mut self,
            _batch: &[FaceCrop],
            _state: ModelState,
        ) -> anyhow::Result<(SignalChunk, ModelState)> {
            panic!("kernel fault");
        }
    }

    fn push(shared: &SharedBuffers, tx: &crossbeam_channel::Sender<()>, v: u8) {
        shared
            .faces
            .lock()
            .unwrap()
            .push(Arc::new(RgbFrame::filled(1, 1, [v, v, v])), f64::from(v));
        tx.send(()).unwrap();
    }

    #[test]
    fn full_chunks_then_truncated_flush() {
        let shared = SharedBuffers::new();
        let (tx, rx) = unbounded();
        let handle = PipelineScheduler::new(
            Box::new(PixelEcho),
            ModelState::empty(),
            4,
            rx,
            Arc::clone(&shared),
        )
        .spawn()
        .unwrap();

        for v in 0..10u8 {
            push(&shared, &tx, v);
        }
        shared.deactivate();
        tx.send(()).unwrap();
        let (_, state) = handle.join().unwrap();

        let signal = shared.signal.lock().unwrap();
        assert_eq!(signal.produced(), 10);
        let bvp = &signal.concat()[BVP_CHANNEL];
        assert_eq!(bvp.len(), 10);
        assert_eq!(bvp[9], 9.0);
        // two full chunks + one padded flush
        assert_eq!(state.tensors[0].data[0], 3.0);
        assert!(shared.failure().is_none());
    }

    #[test]
    fn disconnected_sender_ends_the_thread() {
        let shared = SharedBuffers::new();
        let (tx, rx) = unbounded();
        let handle = PipelineScheduler::new(
            Box::new(PixelEcho),
            ModelState::empty(),
            3,
            rx,
            Arc::clone(&shared),
        )
        .spawn()
        .unwrap();
        push(&shared, &tx, 1);
        drop(tx);
        handle.join().unwrap();
        assert_eq!(shared.signal.lock().unwrap().produced(), 1);
    }

    #[test]
    fn extractor_panic_latches_failure() {
        let shared = SharedBuffers::new();
        let (tx, rx) = unbounded();
        let handle = PipelineScheduler::new(
            Box::new(Exploding),
            ModelState::empty(),
            1,
            rx,
            Arc::clone(&shared),
        )
        .spawn()
        .unwrap();
        push(&shared, &tx, 7);
        handle.join().unwrap();
        let failure = shared.failure().unwrap();
        assert!(failure.contains("kernel fault"), "{failure}");
        assert_eq!(shared.signal.lock().unwrap().produced(), 0);
    }
}
