//! Beat detection and time-domain interval statistics.

use std::collections::BTreeMap;
use std::f64::consts::{FRAC_1_SQRT_2, PI};

use crate::dsp::peaks::{PeakOptions, find_peaks};
use crate::dsp::{mean, std};

/// Beat positions (sample indices, ascending) and summary statistics.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Beats {
    pub peaks: Vec<usize>,
    pub summary: BTreeMap<String, f64>,
}

/// Locates heart beats in a processed pulse waveform.
pub trait BeatDetector: Send + Sync {
    fn detect(&self, waveform: &[f64], sample_rate: f64) -> anyhow::Result<Beats>;
}

/// Systolic-peak detector over the cleaned waveform.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PeakBeatDetector {
    /// Minimum spacing between beats, seconds.
    pub min_spacing_s: f64,
    /// Minimum prominence relative to the waveform's standard deviation.
    pub prominence_ratio: f64,
    /// Plausible interval range, milliseconds.
    pub min_rr_ms: f64,
    pub max_rr_ms: f64,
}

impl Default for PeakBeatDetector {
    fn default() -> Self {
        Self {
            min_spacing_s: 0.3,
            prominence_ratio: 0.5,
            min_rr_ms: 300.0,
            max_rr_ms: 2000.0,
        }
    }
}

impl BeatDetector for PeakBeatDetector {
    fn detect(&self, waveform: &[f64], sample_rate: f64) -> anyhow::Result<Beats> {
        anyhow::ensure!(sample_rate > 0.0, "sample rate must be positive");
        let opts = PeakOptions {
            distance: Some(self.min_spacing_s * sample_rate),
            prominence: Some(self.prominence_ratio * std(waveform)),
        };
        let peaks = find_peaks(waveform, opts);

        let rr: Vec<f64> = peaks
            .windows(2)
            .map(|w| (w[1] - w[0]) as f64 * 1000.0 / sample_rate)
            .filter(|ms| (self.min_rr_ms..=self.max_rr_ms).contains(ms))
            .collect();
        anyhow::ensure!(
            rr.len() >= 2,
            "only {} plausible beat intervals in {} peaks",
            rr.len(),
            peaks.len()
        );

        Ok(Beats {
            peaks,
            summary: interval_summary(&rr),
        })
    }
}

fn median(x: &[f64]) -> f64 {
    let mut v = x.to_vec();
    v.sort_by(f64::total_cmp);
    let n = v.len();
    match n {
        0 => 0.0,
        _ if n % 2 == 1 => v[n / 2],
        _ => (v[n / 2 - 1] + v[n / 2]) / 2.0,
    }
}

/// Standard time-domain and Poincaré measures over intervals in ms.
pub fn interval_summary(rr: &[f64]) -> BTreeMap<String, f64> {
    let ibi = mean(rr);
    let diffs: Vec<f64> = rr.windows(2).map(|w| (w[1] - w[0]).abs()).collect();
    let frac_over = |limit: f64| {
        if diffs.is_empty() {
            0.0
        } else {
            diffs.iter().filter(|d| **d > limit).count() as f64 / diffs.len() as f64
        }
    };
    let rmssd = if diffs.is_empty() {
        0.0
    } else {
        (diffs.iter().map(|d| d * d).sum::<f64>() / diffs.len() as f64).sqrt()
    };
    let med = median(rr);
    let deviations: Vec<f64> = rr.iter().map(|v| (v - med).abs()).collect();

    let (across, along): (Vec<f64>, Vec<f64>) = rr
        .windows(2)
        .map(|w| ((w[0] - w[1]) * FRAC_1_SQRT_2, (w[0] + w[1]) * FRAC_1_SQRT_2))
        .unzip();
    let sd1 = std(&across);
    let sd2 = std(&along);

    let mut m = BTreeMap::new();
    m.insert("bpm".into(), if ibi > 0.0 { 60_000.0 / ibi } else { 0.0 });
    m.insert("ibi".into(), ibi);
    m.insert("sdnn".into(), std(rr));
    m.insert("sdsd".into(), std(&diffs));
    m.insert("rmssd".into(), rmssd);
    m.insert("pnn20".into(), frac_over(20.0));
    m.insert("pnn50".into(), frac_over(50.0));
    m.insert("hr_mad".into(), median(&deviations));
    m.insert("sd1".into(), sd1);
    m.insert("sd2".into(), sd2);
    m.insert("s".into(), PI * sd1 * sd2);
    m.insert("sd1/sd2".into(), if sd2 > 0.0 { sd1 / sd2 } else { 0.0 });
    m
}
