//! Whittaker-Henderson detrending.
//!
//! The trend `x` solves `(I + λ²·DᵀD)·x = y` where `D` is the second
//! difference operator. The system matrix is symmetric positive definite
//! and pentadiagonal, so it is factored in place as `L·diag(d)·Lᵀ` with a
//! unit lower-triangular `L` of bandwidth two.

use crate::error::{Error, Result};

/// Smoothing strength for a given rate and lowest frequency of interest,
/// normalised so 30 Hz / 0.5 Hz gives 50.
pub fn smoothness(sample_rate: f64, min_freq: f64) -> f64 {
    50.0 * (30.0 / sample_rate).powi(2) * (0.5 / min_freq).powi(2)
}

/// `signal` minus its smooth trend.
pub fn detrend(signal: &[f64], sample_rate: f64, min_freq: f64) -> Result<Vec<f64>> {
    let n = signal.len();
    if n < 3 {
        return Err(Error::SignalTooShort { needed: 3, got: n });
    }
    let lambda = smoothness(sample_rate, min_freq);
    let trend = solve_trend(signal, lambda * lambda);
    Ok(signal.iter().zip(&trend).map(|(y, t)| y - t).collect())
}

/// Bands of `I + w·DᵀD`: main diagonal, first and second super-diagonals.
fn system_bands(n: usize, w: f64) -> (Vec<f64>, Vec<f64>, Vec<f64>) {
    const STENCIL: [f64; 3] = [1.0, -2.0, 1.0];
    let mut d0 = vec![1.0; n];
    let mut d1 = vec![0.0; n - 1];
    let mut d2 = vec![0.0; n - 2];
    for k in 0..n - 2 {
        for a in 0..3 {
            d0[k + a] += w * STENCIL[a] * STENCIL[a];
            for b in a + 1..3 {
                let v = w * STENCIL[a] * STENCIL[b];
                match b - a {
                    1 => d1[k + a] += v,
                    _ => d2[k + a] += v,
                }
            }
        }
    }
    (d0, d1, d2)
}

fn solve_trend(y: &[f64], w: f64) -> Vec<f64> {
    let n = y.len();
    let (a0, a1, a2) = system_bands(n, w);

    // LDLᵀ: e[i] = L[i][i-1], f[i] = L[i][i-2].
    let mut d = vec![0.0; n];
    let mut e = vec![0.0; n];
    let mut f = vec![0.0; n];
    for i in 0..n {
        if i >= 2 {
            f[i] = a2[i - 2] / d[i - 2];
        }
        if i >= 1 {
            let coupling = if i >= 2 { f[i] * e[i - 1] * d[i - 2] } else { 0.0 };
            e[i] = (a1[i - 1] - coupling) / d[i - 1];
        }
        let mut di = a0[i];
        if i >= 1 {
            di -= e[i] * e[i] * d[i - 1];
        }
        if i >= 2 {
            di -= f[i] * f[i] * d[i - 2];
        }
        d[i] = di;
    }

    // L·z = y
    let mut z = vec![0.0; n];
    for i in 0..n {
        let mut v = y[i];
        if i >= 1 {
            v -= e[i] * z[i - 1];
        }
        if i >= 2 {
            v -= f[i] * z[i - 2];
        }
        z[i] = v;
    }
    for (zi, di) in z.iter_mut().zip(&d) {
        *zi /= di;
    }

    // Lᵀ·x = z
    let mut x = vec![0.0; n];
    for i in (0..n).rev() {
        let mut v = z[i];
        if i + 1 < n {
            v -= e[i + 1] * x[i + 1];
        }
        if i + 2 < n {
            v -= f[i + 2] * x[i + 2];
        }
        x[i] = v;
    }
    x
}
