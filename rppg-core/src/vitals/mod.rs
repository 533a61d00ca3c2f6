//! Heart rate, signal quality and heart-rate variability.
//!
//! All three work on an already processed pulse waveform. Heart rate and
//! HRV come from Welch spectra; signal quality is the strongest normalised
//! autocorrelation within the plausible pulse-period range.

pub mod beats;

use std::collections::BTreeMap;

use serde::Serialize;
use tracing::{debug, warn};

pub use beats::{BeatDetector, Beats, PeakBeatDetector};

use crate::config::{BandConfig, HrBand};
use crate::dsp::{welch, zscore};
use crate::error::{Error, Result};

/// Rate the beat-interval series is resampled to, Hz.
const HRV_RESAMPLE_HZ: f64 = 4.0;
const HRV_NPERSEG: usize = 256;
const HRV_NFFT: usize = 4096;

/// HRV frequency bands, Hz, half-open.
const VLF_BAND: (f64, f64) = (0.0033, 0.04);
const LF_BAND: (f64, f64) = (0.04, 0.15);
const HF_BAND: (f64, f64) = (0.15, 0.4);

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VitalsReport {
    /// Beats per minute.
    pub hr: f64,
    /// Signal-quality index in `[0, 1]`.
    pub sqi: f64,
    /// Band powers, their ratio and beat statistics; empty when beats could
    /// not be resolved.
    pub hrv: BTreeMap<String, f64>,
    /// Seconds between the newest produced sample and the newest frame.
    pub latency: f64,
}

/// Dominant frequency of `bvp` within the HR band, in bpm.
pub fn heart_rate(bvp: &[f64], sample_rate: f64, band: &HrBand) -> Result<f64> {
    let n = bvp.len();
    if n < 2 {
        return Err(Error::SignalTooShort { needed: 2, got: n });
    }
    let nperseg = ((n - 1) as f64).min(256.0 / 30.0 * sample_rate) as usize;
    let nfft = (1e5 / sample_rate) as usize;
    let psd = welch(bvp, sample_rate, nperseg, nfft);
    let peak = psd
        .peak_in(band.min_bpm / 60.0, band.max_bpm / 60.0)
        .ok_or_else(|| {
            Error::InvalidConfig(format!(
                "no spectral bin inside {}..{} bpm at {sample_rate} Hz",
                band.min_bpm, band.max_bpm
            ))
        })?;
    Ok(peak * 60.0)
}

/// Peak normalised autocorrelation over lags matching `band`, in `[0, 1]`.
/// Too-short input or an empty lag range gives 0.
pub fn sqi(signal: &[f64], sample_rate: f64, band: &BandConfig) -> f64 {
    let n = signal.len();
    if n < 2 {
        return 0.0;
    }
    let x = zscore(signal);
    let min_lag = ((sample_rate / band.high_hz) as usize).max(1);
    let max_lag = (n - 1).min((sample_rate / band.low_hz) as usize);
    if min_lag >= max_lag {
        return 0.0;
    }

    let lag = |k: usize| -> f64 { x[..n - k].iter().zip(&x[k..]).map(|(a, b)| a * b).sum() };
    let zero = lag(0);
    if !(zero > 0.0) {
        return 0.0;
    }
    (min_lag..=max_lag)
        .map(|k| lag(k) / zero)
        .fold(f64::NEG_INFINITY, f64::max)
        .clamp(0.0, 1.0)
}

/// Frequency-domain HRV merged with the detector's beat statistics.
/// Any failure is logged and yields an empty map.
pub fn hrv(bvp: &[f64], sample_rate: f64, detector: &dyn BeatDetector) -> BTreeMap<String, f64> {
    match try_hrv(bvp, sample_rate, detector) {
        Ok(m) => m,
        Err(e) => {
            warn!(error = %format!("{e:#}"), "hrv unavailable");
            BTreeMap::new()
        }
    }
}

fn try_hrv(
    bvp: &[f64],
    sample_rate: f64,
    detector: &dyn BeatDetector,
) -> anyhow::Result<BTreeMap<String, f64>> {
    let beats = detector.detect(bvp, sample_rate)?;
    anyhow::ensure!(beats.peaks.len() >= 3, "need at least 3 beats, got {}", beats.peaks.len());

    let times: Vec<f64> = beats.peaks.iter().map(|&p| p as f64 / sample_rate).collect();
    let rr: Vec<f64> = times.windows(2).map(|w| w[1] - w[0]).collect();
    let mut t = Vec::with_capacity(rr.len());
    let mut acc = 0.0;
    for v in &rr {
        acc += v;
        t.push(acc);
    }

    let count = (acc * HRV_RESAMPLE_HZ) as usize;
    anyhow::ensure!(count >= 2, "beat series spans too little time");
    let resampled: Vec<f64> = (0..count)
        .map(|k| interpolate(&t, &rr, k as f64 / HRV_RESAMPLE_HZ))
        .collect();

    let psd = welch(
        &resampled,
        HRV_RESAMPLE_HZ,
        resampled.len().min(HRV_NPERSEG),
        HRV_NFFT,
    );
    let vlf = psd.band_power(VLF_BAND.0, VLF_BAND.1);
    let lf = psd.band_power(LF_BAND.0, LF_BAND.1);
    let hf = psd.band_power(HF_BAND.0, HF_BAND.1);
    anyhow::ensure!(hf > 0.0, "no high-frequency power");
    debug!(vlf, lf, hf, beats = beats.peaks.len(), "hrv bands");

    let mut out = beats.summary;
    out.insert("VLF".into(), vlf);
    out.insert("LF".into(), lf);
    out.insert("HF".into(), hf);
    out.insert("TP".into(), vlf + lf + hf);
    out.insert("LF/HF".into(), lf / hf);
    Ok(out)
}

/// Piecewise-linear interpolation; holds the end values outside `xs`.
fn interpolate(xs: &[f64], ys: &[f64], x: f64) -> f64 {
    let i = xs.partition_point(|&v| v <= x);
    if i == 0 {
        return ys[0];
    }
    if i == xs.len() {
        return ys[ys.len() - 1];
    }
    let (x0, x1) = (xs[i - 1], xs[i]);
    let (y0, y1) = (ys[i - 1], ys[i]);
    if x1 > x0 {
        y0 + (y1 - y0) * (x - x0) / (x1 - x0)
    } else {
        y0
    }
}
