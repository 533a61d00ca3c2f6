//! Per-beat amplitude normalisation of a pulse waveform.

use super::detrend::detrend;
use super::peaks::{PeakOptions, find_peaks};
use super::zscore;
use crate::error::{Error, Result};

/// Minimum prominence of a beat extremum, in standard deviations.
const EXTREMUM_PROMINENCE: f64 = 1.5;
/// Minimum spacing between extrema of one polarity, in seconds.
const EXTREMUM_SPACING_S: f64 = 0.25;
/// Lowest frequency kept by the internal detrend.
const DETREND_MIN_FREQ: f64 = 0.5;

/// Replace NaNs with the previous finite sample; a leading NaN run takes the
/// first finite value. All-NaN input is an error.
pub fn fill_missing(x: &[f64]) -> Result<Vec<f64>> {
    let first = x
        .iter()
        .copied()
        .find(|v| !v.is_nan())
        .ok_or(Error::SignalTooShort {
            needed: 1,
            got: 0,
        })?;
    let mut last = first;
    Ok(x.iter()
        .map(|&v| {
            if !v.is_nan() {
                last = v;
            }
            last
        })
        .collect())
}

/// Rescale every half-beat (extremum to extremum) to a unit range.
///
/// Steps: fill gaps, detrend, z-score; find maxima and minima; map each
/// segment between consecutive extrema through `(x - mid) / range`; join
/// the segments, z-score the result and splice it over the span between the
/// first and last extremum; finally clip everything to the spliced range.
pub fn norm_bvp(bvp: &[f64], sample_rate: f64) -> Result<Vec<f64>> {
    let filled = fill_missing(bvp)?;
    let mut z = zscore(&detrend(&filled, sample_rate, DETREND_MIN_FREQ)?);

    let opts = PeakOptions {
        distance: Some(EXTREMUM_SPACING_S * sample_rate),
        prominence: Some(EXTREMUM_PROMINENCE),
    };
    let negated: Vec<f64> = z.iter().map(|v| -v).collect();
    let mut extrema = find_peaks(&z, opts);
    extrema.extend(find_peaks(&negated, opts));
    extrema.sort_unstable();

    if extrema.len() < 2 {
        return Err(Error::TooFewExtrema {
            found: extrema.len(),
        });
    }

    let mut inner = Vec::with_capacity(extrema[extrema.len() - 1] - extrema[0] + 1);
    let pairs = extrema.len() - 1;
    for (i, w) in extrema.windows(2).enumerate() {
        let seg = &z[w[0]..=w[1]];
        let max = seg.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let min = seg.iter().copied().fold(f64::INFINITY, f64::min);
        let range = max - min;
        let mid = (max + min) / 2.0;
        // Adjacent segments share their boundary sample; keep it once.
        let take = if i + 1 < pairs { seg.len() - 1 } else { seg.len() };
        inner.extend(seg[..take].iter().map(|v| {
            if range > 0.0 { (v - mid) / range } else { 0.0 }
        }));
    }
    let inner = zscore(&inner);

    let lo = inner.iter().copied().fold(f64::INFINITY, f64::min);
    let hi = inner.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    z[extrema[0]..=extrema[extrema.len() - 1]].copy_from_slice(&inner);
    for v in &mut z {
        *v = v.clamp(lo, hi);
    }
    Ok(z)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::PI;

    #[test]
    fn gaps_are_forward_filled_and_leading_run_back_filled() {
        let out = fill_missing(&[f64::NAN, f64::NAN, 2.0, f64::NAN, 5.0, f64::NAN]).unwrap();
        assert_eq!(out, vec![2.0, 2.0, 2.0, 2.0, 5.0, 5.0]);
        assert!(fill_missing(&[f64::NAN; 3]).is_err());
    }

    #[test]
    fn beats_of_different_size_come_out_alike() {
        let fs = 30.0;
        let x: Vec<f64> = (0..600)
            .map(|i| {
                let t = i as f64 / fs;
                let amp = if t < 10.0 { 1.0 } else { 2.0 };
                amp * (2.0 * PI * 1.2 * t).sin()
            })
            .collect();
        let out = norm_bvp(&x, fs).unwrap();
        assert_eq!(out.len(), x.len());

        let peak = |range: std::ops::Range<usize>| {
            out[range].iter().copied().fold(f64::NEG_INFINITY, f64::max)
        };
        let early = peak(60..240);
        let late = peak(360..540);
        assert!((early - late).abs() < 0.1, "{early} vs {late}");
    }

    #[test]
    fn flat_signal_has_too_few_extrema() {
        let err = norm_bvp(&[0.0; 100], 30.0).unwrap_err();
        assert!(matches!(err, Error::TooFewExtrema { found: 0 }));
    }
}
