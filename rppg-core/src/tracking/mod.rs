//! Per-coordinate Kalman smoothing of the face box.
//!
//! Each of the four crop coordinates gets its own scalar filter. There is no
//! motion model: the estimate is a random walk whose process noise grows with
//! the square of the elapsed time relative to a reference frame interval, so
//! irregular frame spacing neither over- nor under-smooths.

use tracing::debug;

use crate::config::KalmanConfig;
use crate::detection::BoundingBox;

// ── Kalman filter ─────────────────────────────────────────────────────────────

/// A scalar random-walk Kalman filter.
#[derive(Debug, Clone, Copy)]
struct Kalman1D {
    estimate: f64,
    error: f64,
}

impl Kalman1D {
    fn new(initial: f64, initial_error: f64) -> Self {
        Self {
            estimate: initial,
            error: initial_error,
        }
    }

    /// Predict over `dt_ratio` reference intervals, then fold in `measurement`.
    fn update(&mut self, measurement: f64, dt_ratio: f64, cfg: &KalmanConfig) -> f64 {
        let predicted = self.error + cfg.process_noise * dt_ratio * dt_ratio;
        let denom = predicted + cfg.measurement_noise;
        let gain = if denom > 0.0 { predicted / denom } else { 1.0 };
        self.estimate += gain * (measurement - self.estimate);
        self.error = (1.0 - gain) * predicted;
        self.estimate
    }
}

// ── BoxTracker ────────────────────────────────────────────────────────────────

/// Smooths raw `[top, bottom, left, right]` crop coordinates.
///
/// The filters are created lazily from the first measurement, which is
/// passed through unsmoothed.
pub struct BoxTracker {
    cfg: KalmanConfig,
    filters: Option<[Kalman1D; 4]>,
    current: Option<BoundingBox>,
}

impl BoxTracker {
    pub fn new(cfg: KalmanConfig) -> Self {
        Self {
            cfg,
            filters: None,
            current: None,
        }
    }

    /// The most recent smoothed box; `None` until the first detection.
    pub fn current(&self) -> Option<BoundingBox> {
        self.current
    }

    /// Fold a raw measurement in. `dt` is the time since the previous
    /// admitted frame; `None` means one reference interval.
    pub fn update(&mut self, raw: [f64; 4], dt: Option<f64>) -> BoundingBox {
        let smoothed = match self.filters.as_mut() {
            None => {
                self.filters = Some(raw.map(|v| Kalman1D::new(v, self.cfg.initial_error)));
                raw
            }
            Some(filters) => {
                let dt = dt
                    .filter(|d| d.is_finite() && *d >= 0.0)
                    .unwrap_or(self.cfg.reference_interval);
                let ratio = dt / self.cfg.reference_interval;
                let mut out = [0.0; 4];
                for ((filter, &z), slot) in filters.iter_mut().zip(&raw).zip(&mut out) {
                    *slot = filter.update(z, ratio, &self.cfg);
                }
                out
            }
        };

        let bbox = BoundingBox::from_coords(smoothed);
        debug!(
            top = bbox.top,
            bottom = bbox.bottom,
            left = bbox.left,
            right = bbox.right,
            "box updated"
        );
        self.current = Some(bbox);
        bbox
    }
}
