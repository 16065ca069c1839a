//! Histogramming of raw energies.

use ge_core::{Error, Histogram, Result};
use serde::{Deserialize, Serialize};

/// How to split a range into bins.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BinSpec {
    /// Fixed bin width; the upper edge is extended to a whole number of bins.
    Width(f64),
    /// Fixed number of equal bins spanning the range exactly.
    Count(usize),
}

/// Histogram `data` over `range` with Poisson variance.
///
/// Values outside the range and NaNs are ignored; the last bin includes its
/// upper edge.
pub fn histogram(data: &[f64], range: (f64, f64), bins: BinSpec) -> Result<Histogram> {
    let (lo, hi) = range;
    if !(lo.is_finite() && hi.is_finite() && lo < hi) {
        return Err(Error::Validation(format!("invalid histogram range ({lo}, {hi})")));
    }
    let edges = match bins {
        BinSpec::Width(dx) => {
            if !(dx.is_finite() && dx > 0.0) {
                return Err(Error::Validation(format!("invalid bin width {dx}")));
            }
            let n = (((hi - lo) / dx) - 1e-9).ceil().max(1.0) as usize;
            (0..=n).map(|i| lo + i as f64 * dx).collect::<Vec<_>>()
        }
        BinSpec::Count(n) => {
            if n == 0 {
                return Err(Error::Validation("histogram needs at least one bin".to_string()));
            }
            let dx = (hi - lo) / n as f64;
            let mut e: Vec<f64> = (0..=n).map(|i| lo + i as f64 * dx).collect();
            e[n] = hi;
            e
        }
    };

    let n = edges.len() - 1;
    let first = edges[0];
    let last = edges[n];
    let dx = (last - first) / n as f64;
    let mut counts = vec![0.0; n];
    for &x in data {
        if !(x >= first && x <= last) {
            continue;
        }
        let mut i = (((x - first) / dx) as usize).min(n - 1);
        // Guard against rounding at bin boundaries.
        if x < edges[i] && i > 0 {
            i -= 1;
        } else if i + 1 < n && x >= edges[i + 1] {
            i += 1;
        }
        counts[i] += 1.0;
    }
    Histogram::with_poisson_variance(counts, edges)
}

/// Binning for integer ADC data: integer bin widths with edges halfway between
/// integers, so every bin holds the same number of possible values.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IntBinning {
    /// Lower edge (a half-integer)
    pub x_lo: f64,
    /// Upper edge (`x_lo + n_bins * dx`)
    pub x_hi: f64,
    /// Integer bin width (at least 1)
    pub dx: f64,
    /// Number of bins
    pub n_bins: usize,
}

impl IntBinning {
    /// Equivalent [`BinSpec`].
    pub fn bin_spec(&self) -> BinSpec {
        BinSpec::Count(self.n_bins)
    }
}

/// Snap `(x_lo, x_hi)` and the requested binning to integer-aligned bins.
///
/// The lower edge moves down to the nearest half-integer, the width rounds to a
/// whole number (at least 1) and the upper edge grows to cover `x_hi`.
pub fn int_aligned_binning(x_lo: f64, x_hi: f64, bins: BinSpec) -> Result<IntBinning> {
    if !(x_lo.is_finite() && x_hi.is_finite() && x_lo < x_hi) {
        return Err(Error::Validation(format!("invalid binning range ({x_lo}, {x_hi})")));
    }
    let lo = (x_lo + 0.5).floor() - 0.5;
    let raw_dx = match bins {
        BinSpec::Width(dx) => dx,
        BinSpec::Count(n) if n > 0 => (x_hi - lo) / n as f64,
        BinSpec::Count(_) => {
            return Err(Error::Validation("histogram needs at least one bin".to_string()));
        }
    };
    let mut dx = raw_dx.round();
    if !(dx >= 1.0) {
        dx = 1.0;
    }
    let n_bins = ((x_hi - lo) / dx).ceil().max(1.0) as usize;
    Ok(IntBinning { x_lo: lo, x_hi: lo + n_bins as f64 * dx, dx, n_bins })
}

/// Full width at `fraction` of the peak height above `baseline`.
///
/// Walks outwards from the bin containing `peak_pos` (or the tallest bin) and
/// linearly interpolates between bin centres where the counts cross the level.
pub fn fwfm(
    hist: &Histogram,
    fraction: f64,
    height: f64,
    baseline: f64,
    peak_pos: Option<f64>,
) -> Option<f64> {
    let counts = hist.counts();
    let centres = hist.bin_centers();
    let n = counts.len();
    let i_max = match peak_pos.and_then(|p| hist.find_bin(p)) {
        Some(i) => i,
        None => argmax(counts)?,
    };
    let level = baseline + fraction * (height - baseline);
    if !level.is_finite() {
        return None;
    }

    let mut left = None;
    for i in (0..i_max).rev() {
        if counts[i] < level {
            left = Some(interpolate(centres[i], counts[i], centres[i + 1], counts[i + 1], level));
            break;
        }
    }
    let mut right = None;
    for i in (i_max + 1)..n {
        if counts[i] < level {
            right = Some(interpolate(centres[i - 1], counts[i - 1], centres[i], counts[i], level));
            break;
        }
    }
    let width = right? - left?;
    (width.is_finite() && width > 0.0).then_some(width)
}

fn interpolate(x0: f64, y0: f64, x1: f64, y1: f64, level: f64) -> f64 {
    if y1 == y0 {
        return 0.5 * (x0 + x1);
    }
    x0 + (level - y0) * (x1 - x0) / (y1 - y0)
}

/// Index of the largest element (first one on ties).
pub fn argmax(values: &[f64]) -> Option<usize> {
    let mut best: Option<usize> = None;
    for (i, &v) in values.iter().enumerate() {
        if v.is_nan() {
            continue;
        }
        if best.is_none_or(|b| v > values[b]) {
            best = Some(i);
        }
    }
    best
}
