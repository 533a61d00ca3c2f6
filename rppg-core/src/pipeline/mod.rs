//! pipeline: session lifecycle, capture loop and read-side queries
//!
//! A [`Pipeline`] owns the long-lived collaborators (detector, extractor,
//! initial model state) while idle. [`Pipeline::open`] moves the detector into
//! the ingestion path and the extractor onto the consumer thread of a new
//! [`Session`]; [`Pipeline::close`] drains and joins that thread and takes
//! both back, so one pipeline can run any number of sessions in sequence.
//! A closed session stays readable.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use crossbeam_channel::unbounded;
use tracing::{debug, info, warn};

use crate::buffer::SharedBuffers;
use crate::config::PipelineConfig;
use crate::detection::FaceDetector;
use crate::dsp::{Butterworth, process_bvp};
use crate::error::{Error, Result};
use crate::ingest::FrameIngestor;
use crate::model::{BVP_CHANNEL, ModelMeta, ModelSpec, ModelState, SignalExtractor};
use crate::preview::{Preview, PreviewSlot};
use crate::scheduler::PipelineScheduler;
use crate::video::{RgbFrame, VideoSource};
use crate::vitals::{self, BeatDetector, PeakBeatDetector, VitalsReport};
use crate::window::{self, Window, slice_window};

/// Collaborators held by the pipeline between sessions.
struct Parts {
    detector: Box<dyn FaceDetector>,
    extractor: Box<dyn SignalExtractor>,
}

// ── Session ──────────────────────────────────────────────────────────────────

/// One open/close bracket: ingestion on the caller's thread (or a capture
/// thread), extraction on the consumer thread, reads from anywhere.
pub struct Session {
    config: PipelineConfig,
    meta: ModelMeta,
    sample_rate: f64,
    beats: Arc<dyn BeatDetector>,
    shared: Arc<SharedBuffers>,
    preview: Arc<PreviewSlot<Preview>>,
    ingestor: Mutex<Option<FrameIngestor>>,
    consumer: Mutex<Option<JoinHandle<(Box<dyn SignalExtractor>, ModelState)>>>,
    capturing: AtomicBool,
    capture_stop: Mutex<Option<Arc<AtomicBool>>>,
}

impl Session {
    /// Ingest one frame. Returns how many virtual frames it filled.
    pub fn feed(&self, frame: RgbFrame, timestamp: f64) -> Result<usize> {
        self.shared.check_failure()?;
        let mut guard = self.ingestor.lock()?;
        let ingestor = guard.as_mut().ok_or(Error::NotRunning)?;
        ingestor.feed(frame, timestamp)
    }

    /// Still accepting frames.
    pub fn is_open(&self) -> bool {
        self.ingestor.lock().map(|g| g.is_some()).unwrap_or(false)
    }

    /// Every channel over `[start, end]` seconds of session time.
    pub fn query(&self, start: Option<f64>, end: Option<f64>) -> Result<Window> {
        self.shared.check_failure()?;
        let (signals, timestamps) = self.shared.snapshot()?;
        slice_window(&signals, &timestamps, start, end)
    }

    /// The pulse channel over a window with its timestamps. Derivative
    /// models are integrated first; unless `raw`, the DSP chain runs on the
    /// result. An empty session yields two empty vectors.
    pub fn bvp(
        &self,
        start: Option<f64>,
        end: Option<f64>,
        raw: bool,
    ) -> Result<(Vec<f64>, Vec<f64>)> {
        let window = self.query(start, end)?;
        if window.is_empty() {
            return Ok((Vec::new(), Vec::new()));
        }
        let mut waveform = window.channel(BVP_CHANNEL)?.to_vec();
        if self.meta.cumsum_output {
            let mut acc = 0.0;
            for v in &mut waveform {
                acc += *v;
                *v = acc;
            }
        }
        if !raw {
            waveform = process_bvp(&waveform, self.sample_rate, &self.config.filter)?;
        }
        Ok((waveform, window.timestamps.unwrap_or_default()))
    }

    /// Heart rate, signal quality and HRV over a window; `None` until the
    /// first chunk has been extracted.
    pub fn vitals(&self, start: Option<f64>, end: Option<f64>) -> Result<Option<VitalsReport>> {
        if !self.has_signal()? {
            return Ok(None);
        }
        let (bvp, _) = self.bvp(start, end, false)?;
        let hr = vitals::heart_rate(&bvp, self.sample_rate, &self.config.hr_band)?;
        let sqi = vitals::sqi(&bvp, self.sample_rate, &self.config.filter);
        let hrv = vitals::hrv(&bvp, self.sample_rate, self.beats.as_ref());
        let latency = self.latency()?;
        debug!(hr, sqi, hrv_keys = hrv.len(), latency, "vitals");
        Ok(Some(VitalsReport {
            hr,
            sqi,
            hrv,
            latency,
        }))
    }

    /// Session time of the newest produced sample, seconds.
    pub fn now(&self) -> Result<f64> {
        self.shared.check_failure()?;
        let produced = self.shared.produced()?;
        let faces = self.shared.faces.lock()?;
        let ts = faces.timestamps();
        Ok(window::now(&ts[..produced.min(ts.len())]))
    }

    /// Seconds between the newest produced sample and the newest admitted
    /// frame.
    pub fn latency(&self) -> Result<f64> {
        self.shared.check_failure()?;
        let produced = self.shared.produced()?;
        let faces = self.shared.faces.lock()?;
        let ts = faces.timestamps();
        match (produced.min(ts.len()).checked_sub(1), ts.last()) {
            (Some(newest), Some(last)) => Ok(last - ts[newest]),
            _ => Ok(0.0),
        }
    }

    pub fn has_signal(&self) -> Result<bool> {
        self.shared.check_failure()?;
        Ok(!self.shared.signal.lock()?.is_empty())
    }

    /// The latched consumer failure, if any.
    pub fn failure(&self) -> Option<String> {
        self.shared.failure().map(str::to_string)
    }

    /// Block until a new frame has been ingested and take it with its box.
    /// `None` once the session is closed.
    pub fn preview(&self) -> Option<Preview> {
        self.preview.wait()
    }

    pub fn try_preview(&self) -> Option<Preview> {
        self.preview.try_take()
    }

    pub fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    pub fn meta(&self) -> &ModelMeta {
        &self.meta
    }

    /// Feed `source` from a background thread until it ends, the handle is
    /// stopped, or the session closes.
    pub fn spawn_capture<S>(self: &Arc<Self>, source: S) -> Result<CaptureHandle>
    where
        S: VideoSource + 'static,
    {
        if !self.is_open() {
            return Err(Error::NotRunning);
        }
        let mut slot = self.capture_stop.lock()?;
        if self.capturing.swap(true, Ordering::AcqRel) {
            return Err(Error::AlreadyRunning);
        }
        let stop = Arc::new(AtomicBool::new(false));
        *slot = Some(Arc::clone(&stop));
        drop(slot);

        let session = Arc::clone(self);
        let thread_stop = Arc::clone(&stop);
        let spawned = thread::Builder::new()
            .name("rppg-capture".into())
            .spawn(move || {
                let mut source = source;
                let result = session.capture(&mut source, &thread_stop);
                session.capturing.store(false, Ordering::Release);
                match &result {
                    Ok(frames) => info!(frames, "capture finished"),
                    Err(e) => warn!(error = %e, "capture stopped"),
                }
                result
            });
        match spawned {
            Ok(thread) => Ok(CaptureHandle { stop, thread }),
            Err(e) => {
                self.capturing.store(false, Ordering::Release);
                Err(Error::Video(
                    anyhow::Error::new(e).context("failed to spawn capture thread"),
                ))
            }
        }
    }

    fn capture(&self, source: &mut dyn VideoSource, stop: &AtomicBool) -> Result<u64> {
        let mut frames = 0;
        while !stop.load(Ordering::Acquire) {
            let Some((frame, ts)) = source.next_frame().map_err(Error::Video)? else {
                break;
            };
            match self.feed(frame, ts) {
                Ok(_) => frames += 1,
                Err(Error::NotRunning) if stop.load(Ordering::Acquire) => break,
                Err(e) => return Err(e),
            }
        }
        Ok(frames)
    }

    /// Stop capture, lower the active flag, release and join the consumer,
    /// then close the preview slot.
    fn shutdown(&self) -> Result<Parts> {
        if let Some(stop) = self.capture_stop.lock()?.take() {
            stop.store(true, Ordering::Release);
        }
        let ingestor = self.ingestor.lock()?.take().ok_or(Error::NotRunning)?;
        let detector = ingestor.close();

        let handle = self.consumer.lock()?.take().ok_or(Error::NotRunning)?;
        let joined = handle.join();
        self.preview.close();

        let (extractor, state) = joined.map_err(|_| {
            let message = "consumer thread panicked".to_string();
            self.shared.latch_failure(message.clone());
            Error::PipelineFailed(message)
        })?;
        debug!(state_tensors = state.tensors.len(), "consumer joined");
        Ok(Parts {
            detector,
            extractor,
        })
    }
}

// ── Capture handle ───────────────────────────────────────────────────────────

/// Background ingestion started by [`Session::spawn_capture`].
pub struct CaptureHandle {
    stop: Arc<AtomicBool>,
    thread: JoinHandle<Result<u64>>,
}

impl CaptureHandle {
    /// Ask the capture loop to finish after the frame in progress.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }

    /// Join the capture thread; returns the number of frames fed.
    pub fn wait(self) -> Result<u64> {
        self.thread
            .join()
            .map_err(|_| Error::Video(anyhow::anyhow!("capture thread panicked")))?
    }
}

// ── Pipeline ─────────────────────────────────────────────────────────────────

pub struct Pipeline {
    config: PipelineConfig,
    meta: ModelMeta,
    sample_rate: f64,
    initial_state: ModelState,
    beats: Arc<dyn BeatDetector>,
    parts: Option<Parts>,
    session: Option<Arc<Session>>,
}

impl Pipeline {
    /// Validate `config` against the model and take ownership of the
    /// collaborators.
    pub fn new(
        config: PipelineConfig,
        spec: ModelSpec,
        detector: Box<dyn FaceDetector>,
    ) -> Result<Self> {
        config.validate()?;
        let ModelSpec {
            meta,
            state,
            extractor,
        } = spec;
        if meta.chunk == 0 {
            return Err(Error::InvalidConfig("model chunk size must be at least 1".into()));
        }
        if !(meta.fps.is_finite() && meta.fps > 0.0) {
            return Err(Error::InvalidConfig(format!(
                "model frame rate must be positive, got {}",
                meta.fps
            )));
        }
        if !meta.channels.iter().any(|c| c == BVP_CHANNEL) {
            return Err(Error::InvalidConfig(format!(
                "model emits no '{BVP_CHANNEL}' channel"
            )));
        }
        let sample_rate = config.sample_rate_or(meta.fps);
        // Rejects a pass band at or above Nyquist before any frame arrives.
        Butterworth::bandpass(
            config.filter.order,
            config.filter.low_hz,
            config.filter.high_hz,
            sample_rate,
        )?;

        info!(
            model = %config.model,
            chunk = meta.chunk,
            input = format!("{}x{}", meta.width, meta.height),
            sample_rate,
            "pipeline ready"
        );
        Ok(Self {
            config,
            meta,
            sample_rate,
            initial_state: state,
            beats: Arc::new(PeakBeatDetector::default()),
            parts: Some(Parts {
                detector,
                extractor,
            }),
            session: None,
        })
    }

    /// Replace the beat detector used for HRV.
    pub fn with_beat_detector(mut self, beats: Arc<dyn BeatDetector>) -> Self {
        self.beats = beats;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn meta(&self) -> &ModelMeta {
        &self.meta
    }

    pub fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    /// The running session, if any.
    pub fn session(&self) -> Option<&Arc<Session>> {
        self.session.as_ref()
    }

    /// Start a session: spawn the consumer thread and arm ingestion. Every
    /// session starts from the model's initial state.
    pub fn open(&mut self) -> Result<Arc<Session>> {
        if self.session.is_some() {
            return Err(Error::AlreadyRunning);
        }
        let Parts {
            detector,
            extractor,
        } = self.parts.take().ok_or_else(|| {
            Error::PipelineFailed("collaborators were lost by an earlier session".into())
        })?;

        let shared = SharedBuffers::new();
        let preview = Arc::new(PreviewSlot::new());
        let (wake_tx, wake_rx) = unbounded();

        let consumer = PipelineScheduler::new(
            extractor,
            self.initial_state.clone(),
            self.meta.chunk,
            wake_rx,
            Arc::clone(&shared),
        )
        .spawn()
        .map_err(|e| Error::PipelineFailed(format!("failed to spawn consumer thread: {e}")))?;

        let ingestor = FrameIngestor::new(
            &self.config,
            &self.meta,
            self.sample_rate,
            detector,
            wake_tx,
            Arc::clone(&shared),
            Arc::clone(&preview),
        );

        let session = Arc::new(Session {
            config: self.config.clone(),
            meta: self.meta.clone(),
            sample_rate: self.sample_rate,
            beats: Arc::clone(&self.beats),
            shared,
            preview,
            ingestor: Mutex::new(Some(ingestor)),
            consumer: Mutex::new(Some(consumer)),
            capturing: AtomicBool::new(false),
            capture_stop: Mutex::new(None),
        });
        self.session = Some(Arc::clone(&session));
        info!(model = %self.config.model, "session opened");
        Ok(session)
    }

    /// Drain, stop and join the running session and take the collaborators
    /// back. The returned session remains queryable.
    pub fn close(&mut self) -> Result<Arc<Session>> {
        let session = self.session.take().ok_or(Error::NotRunning)?;
        let start = Instant::now();
        let parts = session.shutdown()?;
        self.parts = Some(parts);

        let produced = session.shared.produced()?;
        match session.failure() {
            Some(failure) => warn!(produced, failure = %failure, "session closed after failure"),
            None => info!(
                produced,
                drain_ms = format!("{:.1}", start.elapsed().as_secs_f64() * 1000.0),
                "session closed"
            ),
        }
        Ok(session)
    }

    /// Run a whole bounded source through one session and report vitals
    /// over the full recording.
    pub fn process_video<S: VideoSource>(&mut self, source: S) -> Result<Option<VitalsReport>> {
        self.process_video_with(source, |_| {})
    }

    /// Like [`Pipeline::process_video`], calling `on_frame` with the running
    /// frame count after every fed frame.
    pub fn process_video_with<S, F>(
        &mut self,
        mut source: S,
        mut on_frame: F,
    ) -> Result<Option<VitalsReport>>
    where
        S: VideoSource,
        F: FnMut(u64),
    {
        let session = self.open()?;
        let start = Instant::now();
        let fed = feed_all(&session, &mut source, &mut on_frame);
        // Close even when feeding failed so the consumer is always joined.
        let closed = self.close();
        let frames = fed?;
        let session = closed?;
        info!(
            frames,
            elapsed_s = format!("{:.2}", start.elapsed().as_secs_f64()),
            "video processed"
        );
        session.vitals(None, None)
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        if self.session.is_some() {
            if let Err(e) = self.close() {
                warn!(error = %e, "session did not close cleanly");
            }
        }
    }
}

fn feed_all<F: FnMut(u64)>(
    session: &Session,
    source: &mut dyn VideoSource,
    on_frame: &mut F,
) -> Result<u64> {
    let mut frames = 0;
    while let Some((frame, ts)) = source.next_frame().map_err(Error::Video)? {
        session.feed(frame, ts)?;
        frames += 1;
        on_frame(frames);
    }
    Ok(frames)
}

/// One-shot convenience: build a pipeline, process `source` to the end and
/// return the final report.
pub fn run_to_completion<S: VideoSource>(
    config: PipelineConfig,
    spec: ModelSpec,
    detector: Box<dyn FaceDetector>,
    source: S,
) -> Result<Option<VitalsReport>> {
    Pipeline::new(config, spec, detector)?.process_video(source)
}
