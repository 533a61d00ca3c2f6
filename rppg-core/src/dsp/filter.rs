//! Digital Butterworth band-pass design and zero-phase filtering.
//!
//! Design goes analog prototype → low-pass to band-pass → bilinear
//! transform with pre-warped edges, all in zero/pole/gain form, and only
//! then to transfer-function coefficients.

use std::f64::consts::PI;

use nalgebra::{DMatrix, DVector};
use num_complex::Complex64;

use crate::error::{Error, Result};

/// Transfer-function coefficients, `a[0] == 1`.
#[derive(Debug, Clone, PartialEq)]
pub struct Butterworth {
    pub b: Vec<f64>,
    pub a: Vec<f64>,
}

impl Butterworth {
    /// Order-`order` band-pass over `[low_hz, high_hz]` at `sample_rate`.
    /// The resulting filter has order `2 * order`.
    pub fn bandpass(order: usize, low_hz: f64, high_hz: f64, sample_rate: f64) -> Result<Self> {
        let nyquist = sample_rate / 2.0;
        if order == 0 || !(0.0 < low_hz && low_hz < high_hz && high_hz < nyquist) {
            return Err(Error::InvalidConfig(format!(
                "band-pass needs 0 < {low_hz} < {high_hz} < {nyquist} Hz and order >= 1"
            )));
        }

        // Normalised to fs = 2, pre-warped.
        const FS: f64 = 2.0;
        let warp = |f: f64| 2.0 * FS * (PI * (f / nyquist) / FS).tan();
        let (w1, w2) = (warp(low_hz), warp(high_hz));
        let bw = w2 - w1;
        let wo = (w1 * w2).sqrt();

        // Analog prototype: unit-circle poles in the left half plane.
        let n = order as i32;
        let proto: Vec<Complex64> = (-(n - 1)..=(n - 1))
            .step_by(2)
            .map(|m| -Complex64::from_polar(1.0, PI * m as f64 / (2.0 * n as f64)))
            .collect();

        // Low-pass → band-pass: each pole splits in two, `order` zeros at 0.
        let mut poles = Vec::with_capacity(2 * order);
        for p in &proto {
            let p_lp = *p * (bw / 2.0);
            let root = (p_lp * p_lp - wo * wo).sqrt();
            poles.push(p_lp + root);
        }
        for p in &proto {
            let p_lp = *p * (bw / 2.0);
            let root = (p_lp * p_lp - wo * wo).sqrt();
            poles.push(p_lp - root);
        }
        let zeros = vec![Complex64::new(0.0, 0.0); order];
        let gain = bw.powi(n);

        // Bilinear transform.
        let fs2 = Complex64::new(2.0 * FS, 0.0);
        let mut z_zeros: Vec<Complex64> = zeros.iter().map(|z| (fs2 + z) / (fs2 - z)).collect();
        let z_poles: Vec<Complex64> = poles.iter().map(|p| (fs2 + p) / (fs2 - p)).collect();
        z_zeros.extend(std::iter::repeat_n(
            Complex64::new(-1.0, 0.0),
            poles.len() - zeros.len(),
        ));
        let num: Complex64 = zeros.iter().map(|z| fs2 - z).product();
        let den: Complex64 = poles.iter().map(|p| fs2 - p).product();
        let z_gain = gain * (num / den).re;

        let b = poly(&z_zeros).into_iter().map(|c| c.re * z_gain).collect();
        let a = poly(&z_poles).into_iter().map(|c| c.re).collect();
        Ok(Self { b, a })
    }

    /// Steady-state initial conditions for a unit step.
    pub fn initial_state(&self) -> Result<Vec<f64>> {
        let n = self.a.len().max(self.b.len());
        let a = padded(&self.a, n);
        let b = padded(&self.b, n);
        if n < 2 {
            return Ok(Vec::new());
        }

        // (I - Cᵀ)·zi = b[1:] - a[1:]·b[0], C the companion matrix of `a`.
        let m = n - 1;
        let mut lhs = DMatrix::<f64>::identity(m, m);
        for j in 0..m {
            lhs[(j, 0)] += a[j + 1];
        }
        for i in 1..m {
            lhs[(i - 1, i)] -= 1.0;
        }
        let rhs = DVector::from_iterator(m, (0..m).map(|j| b[j + 1] - a[j + 1] * b[0]));
        lhs.lu()
            .solve(&rhs)
            .map(|zi| zi.iter().copied().collect())
            .ok_or_else(|| Error::InvalidConfig("filter has no steady state".into()))
    }

    /// Direct form II transposed, starting from state `zi`.
    pub fn lfilter(&self, x: &[f64], zi: &[f64]) -> Vec<f64> {
        let n = self.a.len().max(self.b.len());
        let a = padded(&self.a, n);
        let b = padded(&self.b, n);
        let mut z = zi.to_vec();
        z.resize(n.saturating_sub(1), 0.0);

        let mut y = Vec::with_capacity(x.len());
        for &xi in x {
            let yi = b[0] * xi + z.first().copied().unwrap_or(0.0);
            for k in 0..z.len() {
                let next = z.get(k + 1).copied().unwrap_or(0.0);
                z[k] = b[k + 1] * xi + next - a[k + 1] * yi;
            }
            y.push(yi);
        }
        y
    }

    /// Edge padding used by [`filtfilt`].
    pub fn padlen(&self) -> usize {
        3 * self.a.len().max(self.b.len())
    }
}

fn padded(c: &[f64], n: usize) -> Vec<f64> {
    let mut v = c.to_vec();
    v.resize(n, 0.0);
    v
}

/// Monic polynomial with the given roots, highest power first.
fn poly(roots: &[Complex64]) -> Vec<Complex64> {
    let mut c = vec![Complex64::new(1.0, 0.0)];
    for r in roots {
        let mut next = c.clone();
        next.push(Complex64::new(0.0, 0.0));
        for i in 1..next.len() {
            next[i] -= r * c[i - 1];
        }
        c = next;
    }
    c
}

/// Forward-backward filtering with odd edge extension; zero phase.
pub fn filtfilt(filter: &Butterworth, x: &[f64]) -> Result<Vec<f64>> {
    let padlen = filter.padlen();
    let n = x.len();
    if n <= padlen {
        return Err(Error::SignalTooShort {
            needed: padlen + 1,
            got: n,
        });
    }

    let mut ext = Vec::with_capacity(n + 2 * padlen);
    ext.extend((1..=padlen).rev().map(|i| 2.0 * x[0] - x[i]));
    ext.extend_from_slice(x);
    ext.extend((1..=padlen).map(|i| 2.0 * x[n - 1] - x[n - 1 - i]));

    let zi = filter.initial_state()?;
    let scaled = |s: f64| zi.iter().map(|z| z * s).collect::<Vec<_>>();

    let forward = filter.lfilter(&ext, &scaled(ext[0]));
    let mut reversed: Vec<f64> = forward.into_iter().rev().collect();
    let backward = filter.lfilter(&reversed, &scaled(reversed[0]));
    reversed = backward.into_iter().rev().collect();

    Ok(reversed[padlen..padlen + n].to_vec())
}
