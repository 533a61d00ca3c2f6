//! Welch power spectral density.

use std::f64::consts::PI;

use num_complex::Complex64;
use rustfft::FftPlanner;

/// One-sided power spectral density.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Psd {
    pub freqs: Vec<f64>,
    pub power: Vec<f64>,
}

impl Psd {
    /// Frequency of the largest power strictly inside `(low, high)`.
    pub fn peak_in(&self, low: f64, high: f64) -> Option<f64> {
        self.freqs
            .iter()
            .zip(&self.power)
            .filter(|(f, _)| **f > low && **f < high)
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(f, _)| *f)
    }

    /// Sum of power over `[low, high)`.
    pub fn band_power(&self, low: f64, high: f64) -> f64 {
        self.freqs
            .iter()
            .zip(&self.power)
            .filter(|(f, _)| **f >= low && **f < high)
            .map(|(_, p)| p)
            .sum()
    }
}

/// Periodic Hann window.
fn hann(n: usize) -> Vec<f64> {
    if n == 1 {
        return vec![1.0];
    }
    (0..n)
        .map(|i| 0.5 - 0.5 * (2.0 * PI * i as f64 / n as f64).cos())
        .collect()
}

/// Averaged periodogram of Hann-windowed, mean-removed segments of length
/// `nperseg` overlapping by half, each zero-padded to `nfft`, density
/// scaled.
///
/// `nperseg` is clamped to the input length and `nfft` to at least
/// `nperseg`. An empty input yields an empty spectrum.
pub fn welch(x: &[f64], fs: f64, nperseg: usize, nfft: usize) -> Psd {
    let n = x.len();
    if n == 0 {
        return Psd::default();
    }
    let nperseg = nperseg.clamp(1, n);
    let nfft = nfft.max(nperseg);
    let noverlap = nperseg / 2;
    let step = nperseg - noverlap;

    let window = hann(nperseg);
    let scale = 1.0 / (fs * window.iter().map(|w| w * w).sum::<f64>());
    let bins = nfft / 2 + 1;

    let mut planner = FftPlanner::<f64>::new();
    let fft = planner.plan_fft_forward(nfft);
    let mut buffer = vec![Complex64::new(0.0, 0.0); nfft];
    let mut power = vec![0.0; bins];

    let segments = (n - noverlap) / step;
    for s in 0..segments {
        let seg = &x[s * step..s * step + nperseg];
        let mean = seg.iter().sum::<f64>() / nperseg as f64;
        for (slot, (v, w)) in buffer.iter_mut().zip(seg.iter().zip(&window)) {
            *slot = Complex64::new((v - mean) * w, 0.0);
        }
        for slot in buffer.iter_mut().skip(nperseg) {
            *slot = Complex64::new(0.0, 0.0);
        }
        fft.process(&mut buffer);

        for (k, p) in power.iter_mut().enumerate() {
            let mut v = buffer[k].norm_sqr() * scale;
            let nyquist_bin = nfft % 2 == 0 && k == bins - 1;
            if k != 0 && !nyquist_bin {
                v *= 2.0;
            }
            *p += v;
        }
    }
    if segments > 0 {
        for p in &mut power {
            *p /= segments as f64;
        }
    }

    let freqs = (0..bins).map(|k| k as f64 * fs / nfft as f64).collect();
    Psd { freqs, power }
}
