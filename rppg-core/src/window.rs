//! window: timestamp-aligned slices of the accumulated signal

use crate::buffer::SignalChunk;
use crate::error::{Error, Result};

/// A slice of every channel plus its timestamps, re-based to the first
/// admitted frame of the session.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Window {
    pub signals: SignalChunk,
    /// `None` when nothing had been produced yet.
    pub timestamps: Option<Vec<f64>>,
}

impl Window {
    pub fn is_empty(&self) -> bool {
        self.signals.is_empty()
    }

    pub fn channel(&self, name: &str) -> Result<&[f64]> {
        self.signals
            .get(name)
            .map(Vec::as_slice)
            .ok_or_else(|| Error::MissingChannel(name.to_string()))
    }
}

/// Seconds between the first admitted frame and the newest produced sample.
pub fn now(timestamps: &[f64]) -> f64 {
    match (timestamps.first(), timestamps.last()) {
        (Some(first), Some(last)) => last - first,
        _ => 0.0,
    }
}

/// Resolve optional, possibly negative offsets against `now`.
///
/// Omitted start is 0, omitted end is `now`; negative values count back
/// from `now`.
pub fn resolve_range(start: Option<f64>, end: Option<f64>, now: f64) -> (f64, f64) {
    let rel = |v: f64| if v < 0.0 { v + now } else { v };
    (rel(start.unwrap_or(0.0)), rel(end.unwrap_or(now)))
}

/// Slice `signals` (concatenated channels) to the produced samples whose
/// relative time lies in `[start, end]`.
///
/// `timestamps` are the absolute timestamps of the produced samples, one per
/// sample, oldest first.
pub fn slice_window(
    signals: &SignalChunk,
    timestamps: &[f64],
    start: Option<f64>,
    end: Option<f64>,
) -> Result<Window> {
    if signals.is_empty() || timestamps.is_empty() {
        return Ok(Window::default());
    }

    let (start, end) = resolve_range(start, end, now(timestamps));
    if !(start < end) {
        return Err(Error::InvalidRange { start, end });
    }

    let t0 = timestamps[0];
    let rel: Vec<f64> = timestamps.iter().map(|t| t - t0).collect();
    let lo = rel.partition_point(|&t| t < start);
    let hi = rel.partition_point(|&t| t <= end).max(lo);

    let signals = signals
        .iter()
        .map(|(name, values)| {
            let hi = hi.min(values.len());
            let lo = lo.min(hi);
            (name.clone(), values[lo..hi].to_vec())
        })
        .collect();

    Ok(Window {
        signals,
        timestamps: Some(rel[lo..hi].to_vec()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn ramp(n: usize, fps: f64, t0: f64) -> (SignalChunk, Vec<f64>) {
        let values: Vec<f64> = (0..n).map(|i| i as f64).collect();
        let ts = (0..n).map(|i| t0 + i as f64 / fps).collect();
        (SignalChunk::from([("bvp".to_string(), values)]), ts)
    }

    #[test]
    fn empty_buffer_answers_empty_even_for_bad_range() {
        let w = slice_window(&SignalChunk::new(), &[], Some(5.0), Some(1.0)).unwrap();
        assert!(w.is_empty());
        assert!(w.timestamps.is_none());
    }

    #[test]
    fn inverted_range_is_rejected() {
        let (sig, ts) = ramp(30, 10.0, 100.0);
        let err = slice_window(&sig, &ts, Some(2.0), Some(1.0)).unwrap_err();
        assert!(matches!(err, Error::InvalidRange { .. }));
        assert!(slice_window(&sig, &ts, Some(1.0), Some(1.0)).is_err());
    }

    #[test]
    fn default_range_covers_everything() {
        let (sig, ts) = ramp(30, 10.0, 100.0);
        let w = slice_window(&sig, &ts, None, None).unwrap();
        assert_eq!(w.channel("bvp").unwrap().len(), 30);
        let stamps = w.timestamps.unwrap();
        assert_abs_diff_eq!(stamps[0], 0.0);
        assert_abs_diff_eq!(stamps[29], 2.9, epsilon = 1e-9);
    }

    #[test]
    fn bounds_are_inclusive() {
        let (sig, ts) = ramp(30, 10.0, 0.0);
        let w = slice_window(&sig, &ts, Some(1.0), Some(2.0)).unwrap();
        let bvp = w.channel("bvp").unwrap();
        assert_eq!(bvp.first(), Some(&10.0));
        assert_eq!(bvp.last(), Some(&20.0));
        assert_eq!(w.timestamps.as_ref().unwrap().len(), bvp.len());
    }

    #[test]
    fn negative_offsets_count_back_from_now() {
        let (sig, ts) = ramp(30, 10.0, 0.0);
        // now = 2.9
        let w = slice_window(&sig, &ts, Some(-0.95), None).unwrap();
        let bvp = w.channel("bvp").unwrap();
        assert_eq!(bvp.first(), Some(&20.0));
        assert_eq!(bvp.last(), Some(&29.0));
    }

    #[test]
    fn missing_channel_is_reported() {
        let (sig, ts) = ramp(5, 10.0, 0.0);
        let w = slice_window(&sig, &ts, None, None).unwrap();
        assert!(matches!(w.channel("resp"), Err(Error::MissingChannel(_))));
    }
}
