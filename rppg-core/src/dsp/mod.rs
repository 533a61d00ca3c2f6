//! dsp: detrending, zero-phase band-pass, per-beat normalisation, spectra
//!
//! Everything here is a pure function over `f64` slices. The public chain
//! used by the session is [`process_bvp`]: detrend → band-pass → per-beat
//! normalise.

pub mod detrend;
pub mod filter;
pub mod normalize;
pub mod peaks;
pub mod spectral;

pub use detrend::detrend;
pub use filter::{Butterworth, filtfilt};
pub use normalize::norm_bvp;
pub use peaks::{PeakOptions, find_peaks};
pub use spectral::{Psd, welch};

use crate::config::BandConfig;
use crate::error::Result;

/// Full cleanup of a raw pulse waveform at `sample_rate`.
pub fn process_bvp(raw: &[f64], sample_rate: f64, band: &BandConfig) -> Result<Vec<f64>> {
    let detrended = detrend(raw, sample_rate, band.low_hz)?;
    let filter = Butterworth::bandpass(band.order, band.low_hz, band.high_hz, sample_rate)?;
    let filtered = filtfilt(&filter, &detrended)?;
    norm_bvp(&filtered, sample_rate)
}

pub(crate) fn mean(x: &[f64]) -> f64 {
    if x.is_empty() {
        return 0.0;
    }
    x.iter().sum::<f64>() / x.len() as f64
}

/// Population standard deviation.
pub(crate) fn std(x: &[f64]) -> f64 {
    if x.is_empty() {
        return 0.0;
    }
    let m = mean(x);
    (x.iter().map(|v| (v - m).powi(2)).sum::<f64>() / x.len() as f64).sqrt()
}

/// Zero-mean, unit-variance copy. A flat input maps to zeros.
pub(crate) fn zscore(x: &[f64]) -> Vec<f64> {
    let m = mean(x);
    let s = std(x);
    if s > 0.0 {
        x.iter().map(|v| (v - m) / s).collect()
    } else {
        vec![0.0; x.len()]
    }
}
