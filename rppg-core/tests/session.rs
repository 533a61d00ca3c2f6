use std::f64::consts::PI;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use approx::assert_abs_diff_eq;
use crossbeam_channel::{Receiver, unbounded};

use rppg_core::buffer::{FaceCrop, SignalChunk};
use rppg_core::model::{BVP_CHANNEL, StateTensor};
use rppg_core::{
    BBox, Error, FaceDetector, ModelMeta, ModelSpec, ModelState, Pipeline, PipelineConfig,
    RgbFrame, SignalExtractor, VecSource, VideoSource, run_to_completion,
};

const FPS: f64 = 30.0;

// ── Fakes ────────────────────────────────────────────────────────────────────

/// Reports the same face on every call.
struct FixedFace;

impl FaceDetector for FixedFace {
    fn detect(&mut self, _frame: &RgbFrame, _ts: f64) -> anyhow::Result<Option<BBox>> {
        Ok(Some(BBox {
            x1: 10.0,
            y1: 10.0,
            x2: 50.0,
            y2: 40.0,
            confidence: 0.99,
        }))
    }
}

/// Emits a sinusoid indexed by a sample counter kept in the model state.
struct Sine {
    freq: f64,
}

impl SignalExtractor for Sine {
    fn extract(
        &mut self,
        batch: &[FaceCrop],
        mut state: ModelState,
    ) -> anyhow::Result<(SignalChunk, ModelState)> {
        let counter = state
            .tensors
            .first_mut()
            .ok_or_else(|| anyhow::anyhow!("state was not threaded through"))?;
        let mut values = Vec::with_capacity(batch.len());
        for _ in batch {
            let k = f64::from(counter.data[0]);
            counter.data[0] += 1.0;
            values.push((2.0 * PI * self.freq * k / FPS).sin());
        }
        Ok((SignalChunk::from([(BVP_CHANNEL.to_string(), values)]), state))
    }
}

#[derive(Clone, Default)]
struct CallLog {
    in_flight: Arc<AtomicBool>,
    overlapped: Arc<AtomicBool>,
    sizes: Arc<Mutex<Vec<usize>>>,
}

/// Records batch sizes and flags any overlapping call.
struct Recorder {
    log: CallLog,
    emitted: f64,
}

impl SignalExtractor for Recorder {
    fn extract(
        &mut self,
        batch: &[FaceCrop],
        state: ModelState,
    ) -> anyhow::Result<(SignalChunk, ModelState)> {
        if self.log.in_flight.swap(true, Ordering::SeqCst) {
            self.log.overlapped.store(true, Ordering::SeqCst);
        }
        thread::sleep(Duration::from_micros(300));
        self.log.sizes.lock().unwrap().push(batch.len());
        let values = batch
            .iter()
            .map(|_| {
                self.emitted += 1.0;
                self.emitted
            })
            .collect();
        self.log.in_flight.store(false, Ordering::SeqCst);
        Ok((SignalChunk::from([(BVP_CHANNEL.to_string(), values)]), state))
    }
}

/// Succeeds `limit` times, then fails.
struct FailAfter {
    limit: usize,
    calls: usize,
}

impl SignalExtractor for FailAfter {
    fn extract(
        &mut self,
        batch: &[FaceCrop],
        state: ModelState,
    ) -> anyhow::Result<(SignalChunk, ModelState)> {
        self.calls += 1;
        anyhow::ensure!(self.calls <= self.limit, "model exploded on call {}", self.calls);
        Ok((
            SignalChunk::from([(BVP_CHANNEL.to_string(), vec![0.0; batch.len()])]),
            state,
        ))
    }
}

/// Yields whatever arrives on a channel; ends when the sender is dropped.
struct GatedSource(Receiver<(RgbFrame, f64)>);

impl VideoSource for GatedSource {
    fn next_frame(&mut self) -> anyhow::Result<Option<(RgbFrame, f64)>> {
        Ok(self.0.recv().ok())
    }
}

// ── Helpers ──────────────────────────────────────────────────────────────────

fn meta(chunk: usize) -> ModelMeta {
    ModelMeta {
        fps: FPS,
        chunk,
        height: 8,
        width: 8,
        channels: vec![BVP_CHANNEL.to_string()],
        cumsum_output: false,
    }
}

fn counter_state() -> ModelState {
    ModelState {
        tensors: vec![StateTensor::zeros("t", vec![1])],
    }
}

fn spec(chunk: usize, extractor: impl SignalExtractor + 'static) -> ModelSpec {
    ModelSpec {
        meta: meta(chunk),
        state: counter_state(),
        extractor: Box::new(extractor),
    }
}

fn frame() -> RgbFrame {
    RgbFrame::filled(64, 64, [120, 90, 80])
}

fn frames(n: usize, t0: f64) -> Vec<(RgbFrame, f64)> {
    (0..n).map(|i| (frame(), t0 + i as f64 / FPS)).collect()
}

fn pipeline(chunk: usize, extractor: impl SignalExtractor + 'static) -> Pipeline {
    Pipeline::new(
        PipelineConfig::default(),
        spec(chunk, extractor),
        Box::new(FixedFace),
    )
    .unwrap()
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[test]
fn seventy_two_bpm_end_to_end() {
    let report = run_to_completion(
        PipelineConfig::default(),
        spec(16, Sine { freq: 1.2 }),
        Box::new(FixedFace),
        VecSource::new(frames(900, 5.0)),
    )
    .unwrap()
    .expect("signal should have been produced");

    assert!((report.hr - 72.0).abs() <= 2.0, "hr = {}", report.hr);
    assert!(report.sqi > 0.9, "sqi = {}", report.sqi);
    assert_abs_diff_eq!(report.latency, 0.0);
}

#[test]
fn flush_returns_the_true_remainder() {
    let log = CallLog::default();
    let mut pipeline = pipeline(
        16,
        Recorder {
            log: log.clone(),
            emitted: 0.0,
        },
    );
    let session = pipeline.open().unwrap();

    let mut admitted = 0;
    for (f, ts) in frames(37, 0.0) {
        admitted += session.feed(f, ts).unwrap();
    }
    pipeline.close().unwrap();

    let window = session.query(None, None).unwrap();
    let bvp = window.channel(BVP_CHANNEL).unwrap();
    assert_eq!(bvp.len(), admitted);
    assert_eq!(window.timestamps.as_ref().unwrap().len(), admitted);
    // values are the running count, so nothing was dropped or duplicated
    assert_eq!(bvp.last().copied(), Some(admitted as f64));

    let sizes = log.sizes.lock().unwrap();
    assert!(sizes.iter().all(|&s| s == 16), "{sizes:?}");
    assert_eq!(sizes.len(), admitted.div_ceil(16));
}

#[test]
fn extraction_calls_never_overlap() {
    let log = CallLog::default();
    let mut pipeline = pipeline(
        4,
        Recorder {
            log: log.clone(),
            emitted: 0.0,
        },
    );
    let session = pipeline.open().unwrap();
    for (f, ts) in frames(200, 0.0) {
        session.feed(f, ts).unwrap();
    }
    pipeline.close().unwrap();

    assert!(!log.overlapped.load(Ordering::SeqCst));
    assert!(session.failure().is_none());
    assert!(log.sizes.lock().unwrap().len() >= 45);
}

#[test]
fn empty_session_answers_empty_then_ranges_are_checked() {
    let mut pipeline = pipeline(16, Sine { freq: 1.0 });
    let session = pipeline.open().unwrap();

    let window = session.query(Some(5.0), Some(1.0)).unwrap();
    assert!(window.is_empty());
    assert!(window.timestamps.is_none());
    assert!(session.vitals(None, None).unwrap().is_none());
    let (bvp, ts) = session.bvp(None, None, true).unwrap();
    assert!(bvp.is_empty() && ts.is_empty());

    for (f, t) in frames(64, 0.0) {
        session.feed(f, t).unwrap();
    }
    pipeline.close().unwrap();

    assert!(matches!(
        session.query(Some(2.0), Some(1.0)),
        Err(Error::InvalidRange { .. })
    ));
    assert!(session.now().unwrap() > 2.0);

    let recent = session.query(Some(-1.0), None).unwrap();
    let stamps = recent.timestamps.unwrap();
    let span = stamps.last().unwrap() - stamps.first().unwrap();
    assert!(span <= 1.0 + 1e-9, "span = {span}");
    assert!(span > 0.9, "span = {span}");
}

#[test]
fn lifecycle_errors_and_reopen() {
    let mut pipeline = pipeline(8, Sine { freq: 1.0 });
    assert!(matches!(pipeline.close(), Err(Error::NotRunning)));

    let first = pipeline.open().unwrap();
    assert!(matches!(pipeline.open(), Err(Error::AlreadyRunning)));
    for (f, t) in frames(20, 0.0) {
        first.feed(f, t).unwrap();
    }
    pipeline.close().unwrap();
    assert!(!first.is_open());
    assert!(matches!(first.feed(frame(), 1.0), Err(Error::NotRunning)));

    // a new session starts from the initial model state and an empty buffer
    let second = pipeline.open().unwrap();
    assert!(!second.has_signal().unwrap());
    for (f, t) in frames(8, 100.0) {
        second.feed(f, t).unwrap();
    }
    pipeline.close().unwrap();
    let (bvp, ts) = second.bvp(None, None, true).unwrap();
    assert_abs_diff_eq!(bvp[0], 0.0);
    assert_abs_diff_eq!(ts[0], 0.0);
    assert!(first.has_signal().unwrap());
}

#[test]
fn consumer_failure_is_sticky() {
    let mut pipeline = pipeline(4, FailAfter { limit: 1, calls: 0 });
    let session = pipeline.open().unwrap();
    for (f, t) in frames(40, 0.0) {
        match session.feed(f, t) {
            Ok(_) | Err(Error::PipelineFailed(_)) => {}
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    pipeline.close().unwrap();

    let failure = session.failure().expect("failure should be latched");
    assert!(failure.contains("model exploded"), "{failure}");
    assert!(matches!(session.query(None, None), Err(Error::PipelineFailed(_))));
    assert!(matches!(session.vitals(None, None), Err(Error::PipelineFailed(_))));
    assert!(matches!(session.feed(frame(), 9.0), Err(Error::PipelineFailed(_))));

    // the pipeline itself is reusable
    let next = pipeline.open().unwrap();
    assert!(next.failure().is_none());
    pipeline.close().unwrap();
}

#[test]
fn capture_thread_is_exclusive_and_feeds_everything() {
    let mut pipeline = pipeline(8, Sine { freq: 1.0 });
    let session = pipeline.open().unwrap();

    let (tx, rx) = unbounded();
    let handle = session.spawn_capture(GatedSource(rx)).unwrap();
    let (_tx2, rx2) = unbounded();
    assert!(matches!(
        session.spawn_capture(GatedSource(rx2)),
        Err(Error::AlreadyRunning)
    ));

    for item in frames(40, 0.0) {
        tx.send(item).unwrap();
    }
    drop(tx);
    assert_eq!(handle.wait().unwrap(), 40);
    pipeline.close().unwrap();
    assert!(session.has_signal().unwrap());
}

#[test]
fn close_stops_a_blocked_capture() {
    let mut pipeline = pipeline(8, Sine { freq: 1.0 });
    let session = pipeline.open().unwrap();
    let (tx, rx) = unbounded();
    let handle = session.spawn_capture(GatedSource(rx)).unwrap();

    pipeline.close().unwrap();
    drop(tx);
    assert_eq!(handle.wait().unwrap(), 0);
    assert!(matches!(
        session.spawn_capture(VecSource::new(frames(3, 0.0))),
        Err(Error::NotRunning)
    ));
}

#[test]
fn preview_shows_the_latest_frame_and_box() {
    let mut pipeline = pipeline(8, Sine { freq: 1.0 });
    let session = pipeline.open().unwrap();
    for (f, t) in frames(3, 2.0) {
        session.feed(f, t).unwrap();
    }
    let preview = session.preview().unwrap();
    assert_abs_diff_eq!(preview.timestamp, 2.0 + 2.0 / FPS);
    let bbox = preview.bbox.unwrap();
    assert_eq!((bbox.left, bbox.right), (10, 50));
    assert_eq!(bbox.top, 4);

    pipeline.close().unwrap();
    assert!(session.preview().is_none());
}

#[test]
fn derivative_models_are_integrated() {
    let mut m = meta(4);
    m.cumsum_output = true;
    let spec = ModelSpec {
        meta: m,
        state: ModelState::empty(),
        extractor: Box::new(Recorder {
            log: CallLog::default(),
            emitted: 0.0,
        }),
    };
    let mut pipeline =
        Pipeline::new(PipelineConfig::default(), spec, Box::new(FixedFace)).unwrap();
    let session = pipeline.open().unwrap();
    for (f, t) in frames(12, 0.0) {
        session.feed(f, t).unwrap();
    }
    pipeline.close().unwrap();

    // the extractor emits 1, 2, 3, ..; integrated that is 1, 3, 6, ..
    let (bvp, ts) = session.bvp(None, None, true).unwrap();
    assert_eq!(bvp.len(), ts.len());
    assert_eq!(&bvp[..4], &[1.0, 3.0, 6.0, 10.0]);
}
