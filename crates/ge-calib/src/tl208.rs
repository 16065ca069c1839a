//! Bootstrap calibration from the most prominent peaks of a spectrum.
//!
//! [`calibrate_tl208`] needs no keV-per-unit guess. It keeps the tallest
//! baseline-subtracted peaks, aligns them with the reference lines by
//! exhaustive straight-line regression, fits every line with a binned Radford
//! peak and draws a line through the centroids.

use crate::extrema::local_maxima;
use crate::peak_fits::{FitMethod, FitPeaksOptions, PeakFit, PeakRequest, WindowSpec, fit_peaks};
use crate::reference::TH228_STRONG;
use ge_core::{DiagnosticsSink, Error, Polynomial, Result};
use ge_inference::Minimizer;
use ge_shapes::{BinSpec, ShapeModel, histogram};
use serde::{Deserialize, Serialize};

/// Running-median kernel for the baseline, in bins.
const BASELINE_KERNEL: usize = 21;
/// Minimum prominence above the baseline, in `sqrt(counts)` units.
const MIN_SNR: f64 = 5.0;
/// Bins of the histogram searched for prominent peaks.
const PROMINENT_BINS: usize = 4096;
/// Half-width of each line fit (keV).
const LINE_HALF_WIDTH_KEV: f64 = 10.0;
/// Bin width of each line fit (keV).
const LINE_BIN_KEV: f64 = 0.2;
/// Below this many samples the identity calibration is returned.
const MIN_SAMPLES: usize = 100;
/// Upper limit on the regressions tried by [`match_peaks`].
const MAX_ALIGNMENTS: u128 = 2_000_000;

/// Running median over `kernel` samples; windows shrink at the edges.
pub fn median_filter(data: &[f64], kernel: usize) -> Vec<f64> {
    let radius = kernel / 2;
    let n = data.len();
    let mut window = Vec::with_capacity(kernel.max(1));
    (0..n)
        .map(|i| {
            window.clear();
            window.extend_from_slice(&data[i.saturating_sub(radius)..(i + radius + 1).min(n)]);
            window.sort_by(f64::total_cmp);
            let mid = window.len() / 2;
            if window.len() % 2 == 1 { window[mid] } else { 0.5 * (window[mid - 1] + window[mid]) }
        })
        .collect()
}

/// Bin centres of the most prominent peaks of `samples` in `range`, ascending.
///
/// The spectrum is flattened by subtracting a running median. Maxima rising
/// [`MIN_SNR`] standard deviations above the flattened spectrum qualify; with
/// `max_peaks` set only the tallest survive.
pub fn most_prominent_peaks(
    samples: &[f64],
    range: (f64, f64),
    bin_width: f64,
    max_peaks: Option<usize>,
    sink: &dyn DiagnosticsSink,
) -> Result<Vec<f64>> {
    let hist = histogram(samples, range, BinSpec::Width(bin_width))?;
    let counts = hist.counts();
    let baseline = median_filter(counts, BASELINE_KERNEL);
    let residual: Vec<f64> = counts.iter().zip(&baseline).map(|(c, b)| c - b).collect();
    let signal: Vec<f64> = residual.iter().zip(counts).map(|(r, c)| r / c.max(1.0).sqrt()).collect();

    let mut maxima = local_maxima(&signal, MIN_SNR, sink);
    sink.debug("most_prominent_peaks", format!("{} maxima above {MIN_SNR} sigma", maxima.len()));
    match max_peaks {
        Some(k) if k < maxima.len() => {
            maxima.sort_by(|&a, &b| residual[b].total_cmp(&residual[a]));
            maxima.truncate(k);
            maxima.sort_unstable();
        }
        _ => {}
    }
    let centres = hist.bin_centers();
    Ok(maxima.into_iter().map(|i| centres[i]).collect())
}

/// Straight-line alignment found by [`match_peaks`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinearMatch {
    /// keV per raw unit
    pub slope: f64,
    /// keV at raw zero
    pub offset: f64,
    /// Indices into the detected positions
    pub detected_indices: Vec<usize>,
    /// Indices into the reference energies
    pub reference_indices: Vec<usize>,
    /// Sum of squared residuals (keV²)
    pub residual: f64,
}

impl LinearMatch {
    /// `E = slope · raw + offset`.
    pub fn polynomial(&self) -> Polynomial {
        Polynomial::new(vec![self.slope, self.offset])
    }
}

fn binomial(n: usize, k: usize) -> u128 {
    (0..k as u128).fold(1u128, |acc, i| acc.saturating_mul(n as u128 - i) / (i + 1))
}

/// Calls `f` with every ascending `k`-subset of `0..n`, in lexicographic order.
fn for_each_combination(n: usize, k: usize, f: &mut dyn FnMut(&[usize])) {
    if k > n {
        return;
    }
    let mut idx: Vec<usize> = (0..k).collect();
    loop {
        f(&idx);
        let mut i = k;
        loop {
            if i == 0 {
                return;
            }
            i -= 1;
            if idx[i] != i + n - k {
                break;
            }
        }
        idx[i] += 1;
        for j in i + 1..k {
            idx[j] = idx[j - 1] + 1;
        }
    }
}

fn line_fit(x: &[f64], y: &[f64]) -> Option<(f64, f64)> {
    let n = x.len() as f64;
    let mx = x.iter().sum::<f64>() / n;
    let my = y.iter().sum::<f64>() / n;
    let sxx: f64 = x.iter().map(|x| (x - mx).powi(2)).sum();
    if !(sxx > 0.0) {
        return None;
    }
    let sxy: f64 = x.iter().zip(y).map(|(x, y)| (x - mx) * (y - my)).sum();
    let slope = sxy / sxx;
    Some((slope, my - slope * mx))
}

/// Align `detected` (raw) with `references` (keV) by a straight line.
///
/// Every subset of the shorter list's length is tried on both sides; the
/// regression with the smallest squared residual wins.
pub fn match_peaks(detected: &[f64], references: &[f64]) -> Result<LinearMatch> {
    let k = detected.len().min(references.len());
    if k < 2 {
        return Err(Error::InsufficientData(format!(
            "matching needs two peaks on both sides, got {} detected and {} references",
            detected.len(),
            references.len()
        )));
    }
    let tries = binomial(detected.len(), k).saturating_mul(binomial(references.len(), k));
    if tries > MAX_ALIGNMENTS {
        return Err(Error::Validation(format!(
            "{tries} alignments of {} detected peaks and {} references; cap the detected peaks",
            detected.len(),
            references.len()
        )));
    }

    let mut best: Option<LinearMatch> = None;
    let mut x = vec![0.0; k];
    let mut y = vec![0.0; k];
    for_each_combination(references.len(), k, &mut |ri: &[usize]| {
        for (slot, &i) in y.iter_mut().zip(ri) {
            *slot = references[i];
        }
        for_each_combination(detected.len(), k, &mut |di: &[usize]| {
            for (slot, &i) in x.iter_mut().zip(di) {
                *slot = detected[i];
            }
            let Some((slope, offset)) = line_fit(&x, &y) else {
                return;
            };
            let residual: f64 = x.iter().zip(&y).map(|(x, y)| (y - slope * x - offset).powi(2)).sum();
            if best.as_ref().is_none_or(|b| residual < b.residual) {
                best = Some(LinearMatch {
                    slope,
                    offset,
                    detected_indices: di.to_vec(),
                    reference_indices: ri.to_vec(),
                    residual,
                });
            }
        });
    });
    best.ok_or_else(|| Error::Computation("all detected peaks coincide".to_string()))
}

/// Outcome of [`calibrate_tl208`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tl208Calibration {
    /// `E = poly(raw)` through the fitted centroids
    pub polynomial: Polynomial,
    /// Alignment of the prominent peaks; `None` when there were too few samples
    pub rough: Option<LinearMatch>,
    /// Prominent peak positions (raw)
    pub prominent: Vec<f64>,
    /// Line fits, one per reference energy, ascending
    pub fits: Vec<PeakFit>,
}

/// Linear calibration without a scale guess.
///
/// `references` defaults to [`TH228_STRONG`]. Fewer than 100 samples give the
/// identity calibration.
pub fn calibrate_tl208(
    samples: &[f64],
    references: Option<&[f64]>,
    minimizer: &Minimizer,
    sink: &dyn DiagnosticsSink,
) -> Result<Tl208Calibration> {
    let mut refs = references.map_or_else(|| TH228_STRONG.to_vec(), <[f64]>::to_vec);
    if refs.len() < 2 || refs.iter().any(|e| !(e.is_finite() && *e > 0.0)) {
        return Err(Error::Validation("need at least two finite, positive reference energies".into()));
    }
    refs.sort_by(f64::total_cmp);

    if samples.len() < MIN_SAMPLES {
        sink.warn(
            "calibrate_tl208",
            format!("only {} samples, returning the identity calibration", samples.len()),
        );
        return Ok(Tl208Calibration {
            polynomial: Polynomial::new(vec![1.0, 0.0]),
            rough: None,
            prominent: Vec::new(),
            fits: Vec::new(),
        });
    }
    if samples.iter().any(|x| !x.is_finite()) {
        return Err(Error::Validation("samples contain non-finite values".to_string()));
    }
    let (lo, hi) = samples
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &x| (lo.min(x), hi.max(x)));
    if !(lo < hi) {
        return Err(Error::Validation(format!("samples span no range ({lo}, {hi})")));
    }

    let prominent =
        most_prominent_peaks(samples, (lo, hi), (hi - lo) / PROMINENT_BINS as f64, Some(refs.len()), sink)?;
    let rough = match_peaks(&prominent, &refs)?;
    if !(rough.slope.is_finite() && rough.slope > 0.0) {
        return Err(Error::Computation(format!("rough calibration has slope {}", rough.slope)));
    }
    sink.info(
        "calibrate_tl208",
        format!("rough calibration {:.6} keV per unit, offset {:.3} keV", rough.slope, rough.offset),
    );

    let n_bins = (2.0 * LINE_HALF_WIDTH_KEV / LINE_BIN_KEV).round() as usize;
    let requests: Vec<PeakRequest> = refs
        .iter()
        .map(|&e| PeakRequest {
            mode_guess: (e - rough.offset) / rough.slope,
            window: WindowSpec::Width(2.0 * LINE_HALF_WIDTH_KEV / rough.slope),
            n_bins,
            model: ShapeModel::Radford,
        })
        .collect();
    let options =
        FitPeaksOptions { method: FitMethod::Binned, allowed_p_value: 0.0, ..FitPeaksOptions::default() };
    let fits = fit_peaks(samples, &requests, &options, minimizer, sink);

    let mut centroids = Vec::with_capacity(fits.len());
    let mut energies = Vec::with_capacity(fits.len());
    for (&e, fit) in refs.iter().zip(&fits) {
        if fit.valid {
            centroids.push(fit.centroid().0);
            energies.push(e);
        } else {
            sink.warn("calibrate_tl208", format!("no usable fit at {e} keV"));
        }
    }
    if centroids.len() < 2 {
        return Err(Error::InsufficientData(format!(
            "{} usable line fits; a linear calibration needs two",
            centroids.len()
        )));
    }
    let polynomial = Polynomial::fit(&centroids, &energies, 1, None)?;
    sink.info("calibrate_tl208", format!("calibration: {polynomial}"));
    Ok(Tl208Calibration { polynomial, rough: Some(rough), prominent, fits })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ge_core::{CollectingSink, Level};

    #[test]
    fn test_median_filter() {
        let data = [1.0, 1.0, 9.0, 1.0, 1.0, 2.0];
        assert_eq!(median_filter(&data, 3), vec![1.0, 1.0, 1.0, 1.0, 1.0, 1.5]);
        assert_eq!(median_filter(&data, 1), data.to_vec());
        assert!(median_filter(&[], 21).is_empty());
    }

    #[test]
    fn test_combinations() {
        let mut seen = Vec::new();
        for_each_combination(4, 2, &mut |c: &[usize]| seen.push(c.to_vec()));
        assert_eq!(seen, vec![vec![0, 1], vec![0, 2], vec![0, 3], vec![1, 2], vec![1, 3], vec![2, 3]]);
        assert_eq!(binomial(12, 6), 924);
        assert_eq!(binomial(5, 0), 1);
    }

    #[test]
    fn test_match_peaks_skips_spurious_detection() {
        let refs = [238.632, 583.191, 2614.533];
        let detected = [50.0, 238.632 * 2.0 + 4.0, 583.191 * 2.0 + 4.0, 2614.533 * 2.0 + 4.0];
        let m = match_peaks(&detected, &refs).unwrap();
        assert_eq!(m.detected_indices, vec![1, 2, 3]);
        assert_eq!(m.reference_indices, vec![0, 1, 2]);
        assert_relative_eq!(m.slope, 0.5, max_relative = 1e-12);
        assert_relative_eq!(m.offset, -2.0, epsilon = 1e-9);
        assert!(m.residual < 1e-12);
        assert_relative_eq!(m.polynomial().eval(2.0 * 583.191 + 4.0), 583.191, epsilon = 1e-9);
    }

    #[test]
    fn test_match_peaks_needs_two() {
        assert!(matches!(match_peaks(&[100.0], &[238.6, 583.2]), Err(Error::InsufficientData(_))));
        let many: Vec<f64> = (0..60).map(|i| i as f64).collect();
        assert!(matches!(match_peaks(&many, &many[..30]), Err(Error::Validation(_))));
    }

    #[test]
    fn test_few_samples_give_identity() {
        let sink = CollectingSink::new();
        let cal = calibrate_tl208(&[1.0; 10], None, &Minimizer::default(), &sink).unwrap();
        assert_eq!(cal.polynomial.coefficients(), &[1.0, 0.0]);
        assert!(cal.rough.is_none());
        assert!(sink.contains(Level::Warn, "identity calibration"));
        assert!(calibrate_tl208(&[1.0; 10], Some(&[583.2][..]), &Minimizer::default(), &sink).is_err());
    }
}
