//! Local-maximum search with minimum spacing and prominence.

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PeakOptions {
    /// Minimum spacing between kept peaks, in samples.
    pub distance: Option<f64>,
    /// Minimum prominence.
    pub prominence: Option<f64>,
}

/// Indices of peaks in `x`, ascending.
///
/// Plateaus report their midpoint (rounded down). Spacing is enforced first,
/// keeping the tallest peaks; prominence is filtered afterwards.
pub fn find_peaks(x: &[f64], opts: PeakOptions) -> Vec<usize> {
    let mut peaks = local_maxima(x);

    if let Some(distance) = opts.distance {
        if distance > 1.0 && peaks.len() > 1 {
            peaks = select_by_distance(x, &peaks, distance.ceil() as usize);
        }
    }

    if let Some(pmin) = opts.prominence {
        peaks.retain(|&p| prominence(x, p) >= pmin);
    }
    peaks
}

fn local_maxima(x: &[f64]) -> Vec<usize> {
    let mut peaks = Vec::new();
    if x.len() < 3 {
        return peaks;
    }
    let i_max = x.len() - 1;
    let mut i = 1;
    while i < i_max {
        if x[i - 1] < x[i] {
            let mut ahead = i + 1;
            while ahead < i_max && x[ahead] == x[i] {
                ahead += 1;
            }
            if x[ahead] < x[i] {
                peaks.push((i + ahead - 1) / 2);
                i = ahead;
            }
        }
        i += 1;
    }
    peaks
}

fn select_by_distance(x: &[f64], peaks: &[usize], distance: usize) -> Vec<usize> {
    let mut keep = vec![true; peaks.len()];
    let mut order: Vec<usize> = (0..peaks.len()).collect();
    order.sort_by(|&a, &b| x[peaks[a]].total_cmp(&x[peaks[b]]));

    for &j in order.iter().rev() {
        if !keep[j] {
            continue;
        }
        let mut k = j;
        while k > 0 && peaks[j] - peaks[k - 1] < distance {
            keep[k - 1] = false;
            k -= 1;
        }
        let mut k = j + 1;
        while k < peaks.len() && peaks[k] - peaks[j] < distance {
            keep[k] = false;
            k += 1;
        }
    }

    peaks
        .iter()
        .zip(keep)
        .filter_map(|(&p, k)| k.then_some(p))
        .collect()
}

/// Height of `x[peak]` above the higher of its two bases, where each base
/// is the lowest point before the signal climbs above the peak again.
pub fn prominence(x: &[f64], peak: usize) -> f64 {
    let height = x[peak];

    let mut left_min = height;
    let mut i = peak;
    loop {
        if x[i] > height {
            break;
        }
        left_min = left_min.min(x[i]);
        if i == 0 {
            break;
        }
        i -= 1;
    }

    let mut right_min = height;
    for &v in &x[peak..] {
        if v > height {
            break;
        }
        right_min = right_min.min(v);
    }

    height - left_min.max(right_min)
}
