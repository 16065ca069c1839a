//! Rough peak search and re-location against reference energies.

use crate::extrema::local_maxima;
use crate::peak_tops::fit_peak_tops;
use crate::poly_match::poly_match;
use ge_core::{DiagnosticsSink, Error, Histogram, Polynomial, Result};
use ge_inference::Minimizer;
use serde::{Deserialize, Serialize};

/// Peak-top window used to estimate the matching tolerance.
const TOLERANCE_TOP_BINS: usize = 15;
/// At most this many maxima enter the tolerance estimate.
const TOLERANCE_MAX_PEAKS: usize = 15;

/// Settings for one peak-search pass.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PeakSearch {
    /// Minimum prominence of a maximum in `counts / sqrt(variance)` units
    pub significance: f64,
    /// Degree of the raw → keV polynomial (0 is a scale through the origin)
    pub degree: usize,
    /// Matching tolerance in keV; estimated from peak widths when absent
    pub energy_tolerance: Option<f64>,
    /// Replacement for zero variances
    pub var_zero: f64,
}

impl PeakSearch {
    /// Blind search on a coarse histogram.
    pub fn rough(degree: usize) -> Self {
        Self { significance: 5.0, degree, energy_tolerance: None, var_zero: 1.0 }
    }

    /// Re-location on a fine histogram with a known rough calibration.
    pub fn relocate(degree: usize) -> Self {
        Self { significance: 3.0, degree, energy_tolerance: Some(5.0), var_zero: 1.0 }
    }
}

/// Output of [`find_peaks`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoughPeaks {
    /// Raw positions of the matched maxima
    pub raw_positions: Vec<f64>,
    /// Reference energies they were matched to
    pub energies: Vec<f64>,
    /// raw → keV polynomial from the match
    pub polynomial: Polynomial,
    /// Every maximum found, matched or not
    pub detected: Vec<f64>,
    /// Tolerance used for matching (keV)
    pub energy_tolerance: f64,
}

/// Output of [`get_peaks`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelocatedPeaks {
    /// Raw positions, one per matched reference, ascending
    pub raw_positions: Vec<f64>,
    /// Matched reference energies; no energy appears twice
    pub energies: Vec<f64>,
    /// Energies predicted by the rough polynomial
    pub predicted: Vec<f64>,
    /// raw → keV polynomial refitted over the matched pairs
    pub polynomial: Polynomial,
}

fn sorted_finite(values: &[f64]) -> Vec<f64> {
    let mut v: Vec<f64> = values.iter().copied().filter(|e| e.is_finite()).collect();
    v.sort_by(f64::total_cmp);
    v
}

fn maxima_positions(hist: &Histogram, search: &PeakSearch, sink: &dyn DiagnosticsSink) -> (Vec<usize>, Vec<f64>) {
    let signal = hist.noise_normalized(search.var_zero);
    let maxima = local_maxima(&signal, search.significance, sink);
    let centres = hist.bin_centers();
    let positions = maxima.iter().map(|&i| centres[i]).collect();
    (maxima, positions)
}

/// Estimate the matching tolerance from the relative widths of the tallest peaks.
///
/// `tol = 5 · median(σ / mode) / 0.003` keV, i.e. 5 keV for a detector with
/// 0.3 % relative width.
pub fn estimate_energy_tolerance(
    hist: &Histogram,
    maxima: &[usize],
    var_zero: f64,
    minimizer: &Minimizer,
) -> Result<f64> {
    let signal = hist.noise_normalized(var_zero);
    let centres = hist.bin_centers();
    let mut ranked: Vec<usize> = maxima.to_vec();
    ranked.sort_by(|&a, &b| signal[b].total_cmp(&signal[a]));
    ranked.truncate(TOLERANCE_MAX_PEAKS);
    let positions: Vec<f64> = ranked.iter().map(|&i| centres[i]).collect();

    let mut ratios: Vec<f64> = fit_peak_tops(hist, &positions, TOLERANCE_TOP_BINS, minimizer)
        .into_iter()
        .flatten()
        .map(|top| top.sigma / top.mode)
        .filter(|r| r.is_finite() && *r > 0.0)
        .collect();
    if ratios.is_empty() {
        return Err(Error::FitFailed(
            "no peak-top fit succeeded; cannot estimate the energy tolerance".to_string(),
        ));
    }
    ratios.sort_by(f64::total_cmp);
    let n = ratios.len();
    let median = if n % 2 == 1 { ratios[n / 2] } else { 0.5 * (ratios[n / 2 - 1] + ratios[n / 2]) };
    Ok(5.0 * (median / 0.003))
}

/// Blind search: find significant maxima and match them to `reference_energies`.
pub fn find_peaks(
    hist: &Histogram,
    reference_energies: &[f64],
    search: &PeakSearch,
    minimizer: &Minimizer,
    sink: &dyn DiagnosticsSink,
) -> Result<RoughPeaks> {
    let refs = sorted_finite(reference_energies);
    let (maxima, detected) = maxima_positions(hist, search, sink);
    sink.debug("find_peaks", format!("{} maxima above {} sigma", detected.len(), search.significance));
    if detected.is_empty() {
        return Err(Error::InsufficientData(format!(
            "no maxima above {} sigma",
            search.significance
        )));
    }

    let energy_tolerance = match search.energy_tolerance {
        Some(t) => t,
        None => {
            let t = estimate_energy_tolerance(hist, &maxima, search.var_zero, minimizer)?;
            sink.debug("find_peaks", format!("estimated energy tolerance {t:.3} keV"));
            t
        }
    };

    let m = poly_match(&detected, &refs, search.degree as i32, 1e-5, energy_tolerance)?;
    if m.n_matches() < refs.len() {
        sink.info(
            "find_peaks",
            format!("only found {} of {} expected peaks", m.n_matches(), refs.len()),
        );
    }
    Ok(RoughPeaks {
        raw_positions: m.x_indices.iter().map(|&i| detected[i]).collect(),
        energies: m.y_indices.iter().map(|&i| refs[i]).collect(),
        polynomial: m.polynomial,
        detected,
        energy_tolerance,
    })
}

/// Refit a raw → keV polynomial of `degree` over matched pairs.
///
/// Degree 0 is a scale through the origin.
pub fn refit_polynomial(raw: &[f64], energies: &[f64], degree: usize) -> Result<Polynomial> {
    let needed = if degree == 0 { 1 } else { degree + 1 };
    if raw.len() < needed {
        return Err(Error::InsufficientData(format!(
            "degree {degree} calibration needs at least {needed} peaks, got {}",
            raw.len()
        )));
    }
    if degree == 0 {
        Polynomial::fit_scale(raw, energies, None).map(|(s, _)| Polynomial::scale(s))
    } else {
        Polynomial::fit(raw, energies, degree, None)
    }
}

/// Re-locate reference peaks on a finer histogram using a rough calibration.
///
/// Maxima whose predicted energy is within `energy_tolerance` of a reference are
/// assigned to the nearest reference; when several claim the same reference,
/// only the one with the smallest prediction error is kept.
pub fn get_peaks(
    hist: &Histogram,
    rough: &Polynomial,
    reference_energies: &[f64],
    search: &PeakSearch,
    sink: &dyn DiagnosticsSink,
) -> Result<RelocatedPeaks> {
    let refs = sorted_finite(reference_energies);
    if refs.is_empty() {
        return Err(Error::Validation("no reference energies".to_string()));
    }
    let tol = search.energy_tolerance.unwrap_or(5.0);
    let (_, detected) = maxima_positions(hist, search, sink);

    // Best claimant per reference: (raw position, predicted energy).
    let mut claims: Vec<Option<(f64, f64)>> = vec![None; refs.len()];
    for &x in &detected {
        let e = rough.eval(x);
        let Some((j, dist)) = refs
            .iter()
            .map(|r| (r - e).abs())
            .enumerate()
            .min_by(|a, b| a.1.total_cmp(&b.1))
        else {
            continue;
        };
        if !(dist < tol) {
            continue;
        }
        match claims[j] {
            Some((_, prev)) if (prev - refs[j]).abs() <= dist => {
                sink.debug("get_peaks", format!("dropping duplicate claim on {} keV at {x}", refs[j]));
            }
            _ => claims[j] = Some((x, e)),
        }
    }

    let mut raw_positions = Vec::new();
    let mut energies = Vec::new();
    let mut predicted = Vec::new();
    for (j, claim) in claims.into_iter().enumerate() {
        if let Some((x, e)) = claim {
            raw_positions.push(x);
            energies.push(refs[j]);
            predicted.push(e);
        }
    }
    sink.info("get_peaks", format!("{} of {} peaks obtained", energies.len(), refs.len()));

    let polynomial = refit_polynomial(&raw_positions, &energies, search.degree)?;
    Ok(RelocatedPeaks { raw_positions, energies, predicted, polynomial })
}
