//! ingest: detection cadence, box smoothing, cropping and rate pacing
//!
//! Every fed frame may run the detector, updates the preview slot, and, once
//! a face box exists, is cropped, resized and admitted zero or more times to
//! the face buffer so that the buffer's virtual timebase tracks the nominal
//! model rate.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::Sender;
use tracing::{debug, info};

use crate::buffer::SharedBuffers;
use crate::config::{BoxMargin, PipelineConfig};
use crate::detection::FaceDetector;
use crate::error::{Error, Result};
use crate::model::ModelMeta;
use crate::preview::{Preview, PreviewSlot};
use crate::tracking::BoxTracker;
use crate::video::{CropResizer, RgbFrame};

// ── Pacer ────────────────────────────────────────────────────────────────────

/// Resamples an irregular timestamp stream onto a fixed-rate grid.
///
/// Frame `k` of the grid sits at `first + k / fps`; a call for timestamp
/// `ts` admits every grid slot at or before `ts` not yet admitted.
#[derive(Debug, Clone)]
pub struct Pacer {
    fps: f64,
    first: Option<f64>,
    last: Option<f64>,
    admitted: u64,
}

impl Pacer {
    pub fn new(fps: f64) -> Self {
        Self {
            fps,
            first: None,
            last: None,
            admitted: 0,
        }
    }

    /// Number of grid slots `ts` fills. The first call always admits one.
    pub fn admit(&mut self, ts: f64) -> usize {
        let first = *self.first.get_or_insert(ts);
        let mut n = 0;
        while self.admitted as f64 / self.fps <= ts - first {
            self.admitted += 1;
            n += 1;
        }
        if n > 0 {
            self.last = Some(ts);
        }
        n
    }

    pub fn admitted(&self) -> u64 {
        self.admitted
    }

    /// Timestamp of the most recent frame that was admitted at least once.
    pub fn last_admitted(&self) -> Option<f64> {
        self.last
    }
}

// ── FrameIngestor ────────────────────────────────────────────────────────────

pub struct FrameIngestor {
    detector: Box<dyn FaceDetector>,
    tracker: BoxTracker,
    resizer: CropResizer,
    pacer: Pacer,
    margin: BoxMargin,
    detect_every: u64,
    fed: u64,
    dropped: u64,
    consumer_gone: bool,
    wake: Sender<()>,
    shared: Arc<SharedBuffers>,
    preview: Arc<PreviewSlot<Preview>>,
    prof_detect: Duration,
}

impl FrameIngestor {
    pub fn new(
        config: &PipelineConfig,
        meta: &ModelMeta,
        sample_rate: f64,
        detector: Box<dyn FaceDetector>,
        wake: Sender<()>,
        shared: Arc<SharedBuffers>,
        preview: Arc<PreviewSlot<Preview>>,
    ) -> Self {
        Self {
            detector,
            tracker: BoxTracker::new(config.kalman),
            resizer: CropResizer::new(meta.width, meta.height),
            pacer: Pacer::new(sample_rate),
            margin: config.box_margin,
            detect_every: u64::from(config.detect_every),
            fed: 0,
            dropped: 0,
            consumer_gone: false,
            wake,
            shared,
            preview,
            prof_detect: Duration::ZERO,
        }
    }

    /// Process one frame; returns how many times its crop was admitted.
    ///
    /// The detector runs whenever the admitted count is a multiple of
    /// `detect_every`, so it fires on every frame until a face is found.
    pub fn feed(&mut self, frame: RgbFrame, timestamp: f64) -> Result<usize> {
        if self.pacer.admitted() % self.detect_every == 0 {
            let detect_start = Instant::now();
            let found = self
                .detector
                .detect(&frame, timestamp)
                .map_err(Error::Detector)?;
            self.prof_detect += detect_start.elapsed();

            if let Some(raw) = found {
                let dt = self.pacer.last_admitted().map(|last| timestamp - last);
                self.tracker.update(raw.to_crop_coords(&self.margin), dt);
            }
        }
        self.fed += 1;

        let bbox = self.tracker.current();
        let frame = Arc::new(frame);
        self.preview.publish(Preview {
            frame: Arc::clone(&frame),
            bbox,
            timestamp,
        });

        let Some(bbox) = bbox else {
            self.dropped += 1;
            debug!(timestamp, "no face box yet; frame dropped");
            return Ok(0);
        };
        let Some(cropped) = frame.crop(&bbox) else {
            self.dropped += 1;
            debug!(timestamp, ?bbox, "face box outside frame; frame dropped");
            return Ok(0);
        };
        let crop = Arc::new(self.resizer.resize(&cropped).map_err(Error::Video)?);

        let n = self.pacer.admit(timestamp);
        if n > 0 {
            let mut faces = self.shared.faces.lock()?;
            for _ in 0..n {
                faces.push(Arc::clone(&crop), timestamp);
            }
        }
        for _ in 0..n {
            if self.wake.send(()).is_err() {
                self.on_consumer_gone()?;
                break;
            }
        }

        if self.fed % 300 == 0 {
            info!(
                frames = self.fed,
                admitted = self.pacer.admitted(),
                dropped = self.dropped,
                detect_ms_per_frame = format!(
                    "{:.2}",
                    self.prof_detect.as_secs_f64() * 1000.0 / self.fed as f64
                ),
                "ingest timings"
            );
        }
        Ok(n)
    }

    /// The consumer only exits early after latching a failure; surface it.
    fn on_consumer_gone(&mut self) -> Result<()> {
        if !self.consumer_gone {
            self.consumer_gone = true;
            debug!(frames = self.fed, "consumer has exited; wake-ups are discarded");
        }
        self.shared.check_failure()
    }

    /// Lower the stop flag, release the consumer one last time and hand the
    /// detector back.
    pub fn close(self) -> Box<dyn FaceDetector> {
        self.shared.deactivate();
        let _ = self.wake.send(());
        info!(
            frames = self.fed,
            admitted = self.pacer.admitted(),
            dropped = self.dropped,
            "ingestion closed"
        );
        self.detector
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelFamily;
    use crate::detection::BBox;
    use std::sync::Mutex;

    #[test]
    fn first_frame_is_always_admitted() {
        let mut pacer = Pacer::new(30.0);
        assert_eq!(pacer.admit(12.5), 1);
        assert_eq!(pacer.last_admitted(), Some(12.5));
    }

    #[test]
    fn lagging_capture_is_forward_filled() {
        let mut pacer = Pacer::new(10.0);
        assert_eq!(pacer.admit(0.0), 1);
        assert_eq!(pacer.admit(0.35), 3);
        assert_eq!(pacer.admitted(), 4);
        assert_eq!(pacer.admit(1.0), 7);
        assert_eq!(pacer.admitted(), 11);
    }

    #[test]
    fn fast_capture_is_thinned() {
        let mut pacer = Pacer::new(10.0);
        assert_eq!(pacer.admit(0.0), 1);
        assert_eq!(pacer.admit(0.02), 0);
        assert_eq!(pacer.admit(0.05), 0);
        assert_eq!(pacer.last_admitted(), Some(0.0));
        assert_eq!(pacer.admit(0.1), 1);
    }

    #[test]
    fn cumulative_admissions_follow_the_grid() {
        // 32 fps and timestamps on a 1/64 s lattice are exact in f64.
        let mut pacer = Pacer::new(32.0);
        let t0 = 3.0;
        let steps = [1u64, 3, 2, 5, 1, 8, 4];
        let mut k = 0u64;
        for i in 0..200 {
            let t = t0 + k as f64 / 64.0;
            pacer.admit(t);
            assert_eq!(pacer.admitted(), k / 2 + 1, "t={t}");
            k += steps[i % steps.len()];
        }
    }

    #[test]
    fn timestamp_on_a_grid_point_admits_that_slot() {
        let mut pacer = Pacer::new(32.0);
        assert_eq!(pacer.admit(0.0), 1);
        assert_eq!(pacer.admit(3.0 / 32.0), 3);
        assert_eq!(pacer.admitted(), 4);
        assert_eq!(pacer.admit(9.0 / 64.0), 1);
        assert_eq!(pacer.admit(5.0 / 32.0), 1);
        assert_eq!(pacer.admitted(), 6);
    }

    /// Records the timestamps it was asked about; finds a face from `from` on.
    struct Scripted {
        from: f64,
        calls: Arc<Mutex<Vec<f64>>>,
    }

    impl FaceDetector for Scripted {
        fn detect(&mut self, _frame: &RgbFrame, ts: f64) -> anyhow::Result<Option<BBox>> {
            self.calls.lock().unwrap().push(ts);
            Ok((ts >= self.from).then_some(BBox {
                x1: 10.0,
                y1: 10.0,
                x2: 50.0,
                y2: 50.0,
                confidence: 0.9,
            }))
        }
    }

    fn ingestor(
        detect_every: u32,
        from: f64,
    ) -> (
        FrameIngestor,
        Arc<Mutex<Vec<f64>>>,
        crossbeam_channel::Receiver<()>,
        Arc<SharedBuffers>,
    ) {
        let config = PipelineConfig {
            detect_every,
            ..PipelineConfig::default()
        };
        let meta = ModelMeta::for_family(ModelFamily::PhysNet);
        let calls = Arc::new(Mutex::new(Vec::new()));
        let (tx, rx) = crossbeam_channel::unbounded();
        let shared = SharedBuffers::new();
        let ingestor = FrameIngestor::new(
            &config,
            &meta,
            8.0,
            Box::new(Scripted {
                from,
                calls: Arc::clone(&calls),
            }),
            tx,
            Arc::clone(&shared),
            Arc::new(PreviewSlot::new()),
        );
        (ingestor, calls, rx, shared)
    }

    fn frame() -> RgbFrame {
        RgbFrame::filled(64, 64, [90, 60, 40])
    }

    #[test]
    fn detection_cadence_follows_admitted_frames() {
        let (mut ing, calls, rx, _shared) = ingestor(2, 0.0);
        // 32 fps input paced to 8 Hz: frames 0, 4, 8 and 12 are admitted.
        for i in 0..13 {
            ing.feed(frame(), i as f64 / 32.0).unwrap();
        }
        assert_eq!(ing.pacer.admitted(), 4);
        assert_eq!(rx.len(), 4);
        // Admitted count is 0 before frame 0 and 2 over frames 5..=8.
        let calls = calls.lock().unwrap().clone();
        let expected: Vec<f64> = [0, 5, 6, 7, 8].iter().map(|&i| i as f64 / 32.0).collect();
        assert_eq!(calls, expected);
    }

    #[test]
    fn detector_runs_every_frame_until_a_face_appears() {
        let (mut ing, calls, _rx, _shared) = ingestor(5, 3.0 / 8.0);
        for i in 0..6 {
            ing.feed(frame(), i as f64 / 8.0).unwrap();
        }
        // Frames 0..=3 all query the detector; a face is found at frame 3.
        assert_eq!(calls.lock().unwrap().len(), 4);
        assert_eq!(ing.pacer.admitted(), 3);
    }

    #[test]
    fn feeding_after_the_consumer_failed_reports_the_failure() {
        let (mut ing, _calls, rx, shared) = ingestor(1, 0.0);
        assert_eq!(ing.feed(frame(), 0.0).unwrap(), 1);
        drop(rx);

        // Consumer gone without a failure: admissions still count.
        assert_eq!(ing.feed(frame(), 0.125).unwrap(), 1);

        shared.latch_failure("extractor exploded".into());
        let err = ing.feed(frame(), 0.25).unwrap_err();
        assert!(matches!(err, Error::PipelineFailed(ref m) if m == "extractor exploded"));
    }
}
