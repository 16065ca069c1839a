//! End-to-end energy calibration.
//!
//! [`calibrate`] chains the stages:
//! 1. coarse histogram (~1 keV bins) and blind peak search,
//! 2. fine histogram (~0.2 keV bins) and re-location of every reference line,
//! 3. per-peak window selection and shape fits,
//! 4. energy scale fit `raw = poly(E)` and its inversion `E = poly(raw)`,
//! 5. FWHM conversion to keV.
//!
//! Every stage reports through the caller's [`DiagnosticsSink`]; the messages are
//! also kept in the returned [`CalibrationResult`].

use crate::peak_fits::{FitMethod, FitPeaksOptions, PeakFit, PeakRequest, WindowSpec, fit_peaks};
use crate::peak_search::{PeakSearch, RelocatedPeaks, RoughPeaks, find_peaks, get_peaks};
use crate::peak_tops::fit_peak_tops;
use crate::scale_fit::{CurveFit, FixedCoefficients, fit_inverse, fit_scale};
use ge_core::{
    Diagnostic, DiagnosticsSink, Error, Histogram, Polynomial, RecordingSink, Result,
};
use ge_inference::{Minimizer, MinimizerConfig};
use ge_shapes::{BinSpec, PeakTop, ShapeModel, histogram, int_aligned_binning};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Bins per peak-top fit when windows come from the fitted widths.
const TOP_FIT_BINS: usize = 7;
/// Window width in units of the peak-top σ.
const SIGMA_WINDOW: f64 = 20.0;
/// Histogram bins for σ-derived windows.
const SIGMA_WINDOW_BINS: usize = 50;
/// Bin width (keV) for windows given in keV.
const WINDOW_BIN_KEV: f64 = 0.5;

/// A fit window in keV.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PeakRange {
    /// Total width, centred on the peak
    Width(f64),
    /// Extent below and above the peak
    LeftRight(f64, f64),
}

/// How fit windows are chosen.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RangeSpec {
    /// Same total width for every peak
    Width(f64),
    /// Same asymmetric window for every peak
    LeftRight(f64, f64),
    /// One entry per reference energy; `None` skips that peak
    PerPeak(Vec<Option<PeakRange>>),
}

/// Shape model choice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ModelSpec {
    /// Same model everywhere
    Uniform(ShapeModel),
    /// One entry per reference energy; `None` skips that peak
    PerPeak(Vec<Option<ShapeModel>>),
}

impl Default for ModelSpec {
    fn default() -> Self {
        ModelSpec::Uniform(ShapeModel::GaussStep)
    }
}

/// Calibration settings; every field has a default.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    /// Degree of `E = poly(raw)`; 0 is a scale through the origin
    pub degree: usize,
    /// Raw values are integers (ADC codes); bin on integer-aligned edges
    pub uncal_is_int: bool,
    /// Fit windows in keV; `None` derives them from peak-top widths
    pub range_kev: Option<RangeSpec>,
    /// Peak shapes
    pub models: ModelSpec,
    /// Likelihood for the peak fits
    pub method: FitMethod,
    /// Cap on events per window for unbinned fits
    pub n_events: Option<usize>,
    /// Simplex phase before gradient minimisation in binned fits
    pub simplex: bool,
    /// Minimum χ² p-value of an accepted peak fit
    pub allowed_p_value: f64,
    /// Tail prior weight
    pub tail_weight: f64,
    /// Minimum fitted signal count for unbinned fits
    pub min_signal_counts: f64,
    /// Variance substituted for empty bins in the peak search
    pub var_zero: f64,
    /// Minimizer settings shared by every fit
    pub minimizer: MinimizerConfig,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        let peaks = FitPeaksOptions::default();
        Self {
            degree: 0,
            uncal_is_int: false,
            range_kev: None,
            models: ModelSpec::default(),
            method: FitMethod::Unbinned,
            n_events: None,
            simplex: false,
            allowed_p_value: peaks.allowed_p_value,
            tail_weight: peaks.tail_weight,
            min_signal_counts: peaks.min_signal_counts,
            var_zero: 1.0,
            minimizer: MinimizerConfig::default(),
        }
    }
}

impl CalibrationConfig {
    /// Load from YAML, or JSON when the extension is `.json`.
    pub fn from_path(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        let ext = path.extension().and_then(|s| s.to_str()).unwrap_or("").to_ascii_lowercase();
        let cfg: Self = if ext == "json" {
            serde_json::from_slice(&bytes)?
        } else {
            serde_yaml_ng::from_slice(&bytes)?
        };
        Ok(cfg)
    }

    /// Check settings that do not depend on the data.
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.allowed_p_value) {
            return Err(Error::Validation(format!(
                "allowed_p_value must be in [0, 1], got {}",
                self.allowed_p_value
            )));
        }
        if !(self.tail_weight.is_finite() && self.tail_weight >= 0.0) {
            return Err(Error::Validation(format!("invalid tail_weight {}", self.tail_weight)));
        }
        if !(self.var_zero.is_finite() && self.var_zero > 0.0) {
            return Err(Error::Validation(format!("var_zero must be positive, got {}", self.var_zero)));
        }
        if self.n_events == Some(0) {
            return Err(Error::Validation("n_events must be positive".to_string()));
        }
        let bad_range = |r: &PeakRange| match *r {
            PeakRange::Width(w) => !(w.is_finite() && w > 0.0),
            PeakRange::LeftRight(l, r) => !(l.is_finite() && r.is_finite() && l > 0.0 && r > 0.0),
        };
        let invalid = match &self.range_kev {
            None => false,
            Some(RangeSpec::Width(w)) => bad_range(&PeakRange::Width(*w)),
            Some(RangeSpec::LeftRight(l, r)) => bad_range(&PeakRange::LeftRight(*l, *r)),
            Some(RangeSpec::PerPeak(list)) => list.iter().flatten().any(bad_range),
        };
        if invalid {
            return Err(Error::Validation("fit windows must be positive and finite".to_string()));
        }
        Ok(())
    }

    fn fit_options(&self) -> FitPeaksOptions {
        FitPeaksOptions {
            method: self.method,
            n_events: self.n_events,
            allowed_p_value: self.allowed_p_value,
            uncal_is_int: self.uncal_is_int,
            simplex: self.simplex,
            tail_weight: self.tail_weight,
            min_signal_counts: self.min_signal_counts,
        }
    }

    /// Window for the reference at `index`.
    ///
    /// `None` skips the peak; `Some(None)` derives the window from the peak-top width.
    fn window_kev(&self, index: usize) -> Option<Option<PeakRange>> {
        match &self.range_kev {
            None => Some(None),
            Some(RangeSpec::Width(w)) => Some(Some(PeakRange::Width(*w))),
            Some(RangeSpec::LeftRight(l, r)) => Some(Some(PeakRange::LeftRight(*l, *r))),
            Some(RangeSpec::PerPeak(list)) => list.get(index).copied().flatten().map(Some),
        }
    }

    fn model(&self, index: usize) -> Option<ShapeModel> {
        match &self.models {
            ModelSpec::Uniform(m) => Some(*m),
            ModelSpec::PerPeak(list) => list.get(index).copied().flatten(),
        }
    }
}

/// Calibrated quantities of one accepted peak.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeakSummary {
    /// Reference energy (keV)
    pub energy_kev: f64,
    /// Fitted centroid (raw)
    pub centroid: f64,
    /// Centroid uncertainty (raw)
    pub centroid_error: f64,
    /// FWHM (keV)
    pub fwhm_kev: f64,
    /// FWHM uncertainty (keV)
    pub fwhm_kev_error: f64,
}

/// A peak fit tagged with its reference energy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FittedPeak {
    /// Reference energy (keV)
    pub energy_kev: f64,
    /// Fit outcome
    pub fit: PeakFit,
}

/// Intermediate products of every stage.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CalibrationDiagnostics {
    /// Blind search output
    pub rough: Option<RoughPeaks>,
    /// Re-located peaks on the fine histogram
    pub relocated: Option<RelocatedPeaks>,
    /// Peak-top fits used for σ-derived windows
    pub peak_tops: Vec<Option<PeakTop>>,
    /// Every peak fit, valid or not
    pub peak_fits: Vec<FittedPeak>,
    /// Messages emitted during the run
    pub messages: Vec<Diagnostic>,
}

/// Outcome of [`calibrate`].
///
/// `calibration` and `scale` are `None` when too few peaks survived to
/// constrain the requested degree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalibrationResult {
    /// `E = poly(raw)`
    pub calibration: Option<CurveFit>,
    /// `raw = poly(E)`
    pub scale: Option<CurveFit>,
    /// Accepted peaks, ascending in energy
    pub peaks: Vec<PeakSummary>,
    /// Stage outputs and messages
    pub diagnostics: CalibrationDiagnostics,
}

impl CalibrationResult {
    /// The raw → keV polynomial, if the calibration succeeded.
    pub fn polynomial(&self) -> Option<&Polynomial> {
        self.calibration.as_ref().map(|c| &c.polynomial)
    }

    /// Row-major covariance of [`CalibrationResult::polynomial`].
    pub fn covariance(&self) -> Option<&[f64]> {
        self.calibration.as_ref().map(|c| c.covariance.as_slice())
    }
}

fn validate_inputs(
    raw: &[f64],
    reference_energies: &[f64],
    guess_kev: f64,
    config: &CalibrationConfig,
) -> Result<Vec<f64>> {
    config.validate()?;
    if !(guess_kev.is_finite() && guess_kev > 0.0) {
        return Err(Error::Validation(format!("guess_kev must be positive, got {guess_kev}")));
    }
    if raw.is_empty() {
        return Err(Error::Validation("no raw data".to_string()));
    }
    if raw.iter().any(|x| !x.is_finite()) {
        return Err(Error::Validation("raw data contain non-finite values".to_string()));
    }
    if reference_energies.iter().any(|e| !(e.is_finite() && *e > 0.0)) {
        return Err(Error::Validation("reference energies must be finite and positive".into()));
    }
    let required = 2.max(config.degree + 2);
    if reference_energies.len() < required {
        return Err(Error::Validation(format!(
            "degree {} needs at least {required} reference energies, got {}",
            config.degree,
            reference_energies.len()
        )));
    }
    let n = reference_energies.len();
    let per_peak_len = match (&config.range_kev, &config.models) {
        (Some(RangeSpec::PerPeak(r)), _) if r.len() != n => Some(r.len()),
        (_, ModelSpec::PerPeak(m)) if m.len() != n => Some(m.len()),
        _ => None,
    };
    if let Some(len) = per_peak_len {
        return Err(Error::Validation(format!(
            "per-peak settings have {len} entries for {n} reference energies"
        )));
    }
    let mut refs = reference_energies.to_vec();
    refs.sort_by(f64::total_cmp);
    if refs.windows(2).any(|w| w[0] == w[1]) {
        return Err(Error::Validation("duplicate reference energies".to_string()));
    }
    Ok(refs)
}

fn binned(raw: &[f64], lo: f64, hi: f64, dx: f64, uncal_is_int: bool) -> Result<Histogram> {
    if uncal_is_int {
        let b = int_aligned_binning(lo, hi, BinSpec::Width(dx))?;
        histogram(raw, (b.x_lo, b.x_hi), b.bin_spec())
    } else {
        histogram(raw, (lo, hi), BinSpec::Width(dx))
    }
}

/// Raw value at which `poly` reaches `energy`, from the linear estimate.
fn invert(poly: &Polynomial, energy: f64) -> f64 {
    let linear = (energy - poly.eval(0.0)) / poly.linear_coefficient();
    poly.solve(energy, linear).unwrap_or(linear)
}

/// Result of a run that stopped before enough peaks were found.
fn uncalibrated(mut diagnostics: CalibrationDiagnostics, sink: &RecordingSink<'_>) -> CalibrationResult {
    diagnostics.messages = sink.take();
    CalibrationResult { calibration: None, scale: None, peaks: Vec::new(), diagnostics }
}

/// Calibrate `raw` against `reference_energies` (keV).
///
/// `guess_kev` is the approximate keV per raw unit. Input errors fail before any
/// fitting. When fewer peaks survive any stage than the degree requires, the
/// result has no polynomial and keeps the diagnostics gathered so far.
pub fn calibrate(
    raw: &[f64],
    reference_energies: &[f64],
    guess_kev: f64,
    config: &CalibrationConfig,
    sink: &dyn DiagnosticsSink,
) -> Result<CalibrationResult> {
    let refs = validate_inputs(raw, reference_energies, guess_kev, config)?;
    // Per-peak settings follow the caller's order.
    let caller_index = |e: f64| reference_energies.iter().position(|&r| r == e);
    let sink = RecordingSink::new(sink);
    let minimizer = Minimizer::new(config.minimizer.clone());
    let degree = config.degree;
    let mut diagnostics = CalibrationDiagnostics::default();

    let (e_first, e_last) = (refs[0], refs[refs.len() - 1]);
    let coarse = binned(raw, e_first / guess_kev * 0.6, e_last / guess_kev * 1.1, 1.0 / guess_kev, config.uncal_is_int)?;
    let rough = match find_peaks(
        &coarse,
        &refs,
        &PeakSearch { var_zero: config.var_zero, ..PeakSearch::rough(degree) },
        &minimizer,
        &sink,
    ) {
        Ok(r) => r,
        // No usable peak top means no peaks to match either.
        Err(Error::InsufficientData(msg) | Error::FitFailed(msg)) => {
            sink.warn("calibrate", format!("rough peak search failed: {msg}"));
            return Ok(uncalibrated(diagnostics, &sink));
        }
        Err(e) => return Err(e),
    };
    sink.info("calibrate", format!("{} peaks found", rough.energies.len()));
    for (x, e) in rough.raw_positions.iter().zip(&rough.energies) {
        sink.debug("calibrate", format!("  {e:>9.3} keV | {x:.3}"));
    }

    let slope = rough.polynomial.linear_coefficient();
    if !(slope.is_finite() && slope > 0.0) {
        return Err(Error::Computation(format!("rough calibration has slope {slope}")));
    }
    let raw_max = raw.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let lo = invert(&rough.polynomial, 0.9 * e_first).max(0.0);
    let hi = invert(&rough.polynomial, 1.1 * e_last).min(raw_max * 1.1);
    if !(lo < hi) {
        return Err(Error::Computation(format!("empty fine search range ({lo}, {hi})")));
    }
    let fine = binned(raw, lo, hi, 0.2 / slope, config.uncal_is_int)?;
    let relocated = match get_peaks(
        &fine,
        &rough.polynomial,
        &refs,
        &PeakSearch { var_zero: config.var_zero, ..PeakSearch::relocate(degree) },
        &sink,
    ) {
        Ok(r) => r,
        Err(Error::InsufficientData(msg)) => {
            sink.warn("calibrate", format!("peak re-location failed: {msg}"));
            diagnostics.rough = Some(rough);
            return Ok(uncalibrated(diagnostics, &sink));
        }
        Err(e) => return Err(e),
    };
    for (x, e) in relocated.raw_positions.iter().zip(&relocated.energies) {
        sink.debug("calibrate", format!("  {e:>9.3} keV | {x:.3}"));
    }

    // Peaks the caller wants fitted, with their window and model.
    let mut selected: Vec<(f64, f64, Option<PeakRange>, ShapeModel)> = Vec::new();
    for (&x, &e) in relocated.raw_positions.iter().zip(&relocated.energies) {
        let Some(i) = caller_index(e) else { continue };
        match (config.window_kev(i), config.model(i)) {
            (Some(window), Some(model)) => selected.push((x, e, window, model)),
            _ => sink.debug("calibrate", format!("skipping {e} keV")),
        }
    }

    let derivative = rough.polynomial.derivative();
    let mut requests = Vec::with_capacity(selected.len());
    let mut energies = Vec::with_capacity(selected.len());
    if config.range_kev.is_none() {
        let positions: Vec<f64> = selected.iter().map(|s| s.0).collect();
        let tops = fit_peak_tops(&fine, &positions, TOP_FIT_BINS, &minimizer);
        for (s, top) in selected.iter().zip(&tops) {
            match top {
                Some(t) => {
                    requests.push(PeakRequest {
                        mode_guess: s.0,
                        window: WindowSpec::Width(SIGMA_WINDOW * t.sigma),
                        n_bins: SIGMA_WINDOW_BINS,
                        model: s.3,
                    });
                    energies.push(s.1);
                }
                None => sink.info("calibrate", format!("peak-top fit failed at {} keV, dropping", s.1)),
            }
        }
        diagnostics.peak_tops = tops;
    } else {
        for &(x, e, window, model) in &selected {
            let Some(window) = window else { continue };
            let der = derivative.eval(x);
            if !(der.is_finite() && der > 0.0) {
                sink.warn("calibrate", format!("non-positive calibration slope at {e} keV, dropping"));
                continue;
            }
            let (window, width_kev) = match window {
                PeakRange::Width(w) => (WindowSpec::Width(w / der), w),
                PeakRange::LeftRight(l, r) => (WindowSpec::LeftRight(l / der, r / der), l + r),
            };
            let n_bins = ((width_kev / WINDOW_BIN_KEV) as usize).max(1);
            requests.push(PeakRequest { mode_guess: x, window, n_bins, model });
            energies.push(e);
        }
    }

    let fits = fit_peaks(raw, &requests, &config.fit_options(), &minimizer, &sink);
    let accepted: Vec<(f64, &PeakFit)> =
        energies.iter().copied().zip(&fits).filter(|(_, f)| f.valid).collect();
    sink.info("calibrate", format!("{} of {} peaks fitted", accepted.len(), fits.len()));

    let mus: Vec<f64> = accepted.iter().map(|(_, f)| f.centroid().0).collect();
    let mu_vars: Vec<f64> = accepted.iter().map(|(_, f)| f.centroid().1.powi(2)).collect();
    let fitted_kev: Vec<f64> = accepted.iter().map(|(e, _)| *e).collect();
    let fixed = FixedCoefficients::new();

    let scale = match fit_scale(&mus, &mu_vars, &fitted_kev, degree, &fixed, &minimizer) {
        Ok(s) => Some(s),
        Err(Error::InsufficientData(msg)) => {
            sink.warn("calibrate", format!("failed to fit enough peaks for the calibration: {msg}"));
            None
        }
        Err(e) => return Err(e),
    };
    let calibration = match &scale {
        Some(s) => Some(fit_inverse(&mus, &mu_vars, &fitted_kev, &s.polynomial, degree, &fixed, &minimizer)?),
        None => None,
    };

    let mut peaks = Vec::new();
    if let Some(cal) = &calibration {
        let der = cal.polynomial.derivative();
        for (e, fit) in &accepted {
            let (centroid, centroid_error) = fit.centroid();
            let (fwhm, fwhm_error) = fit.fwhm();
            let d = der.eval(centroid);
            peaks.push(PeakSummary {
                energy_kev: *e,
                centroid,
                centroid_error,
                fwhm_kev: fwhm * d,
                fwhm_kev_error: fwhm_error * d,
            });
        }
        sink.info("calibrate", format!("calibration: {}", cal.polynomial));
        for p in &peaks {
            sink.debug(
                "calibrate",
                format!("  {:>9.3} keV | FWHM {:.2} ± {:.2} keV", p.energy_kev, p.fwhm_kev, p.fwhm_kev_error),
            );
        }
    }

    diagnostics.peak_fits =
        energies.into_iter().zip(fits).map(|(energy_kev, fit)| FittedPeak { energy_kev, fit }).collect();
    diagnostics.rough = Some(rough);
    diagnostics.relocated = Some(relocated);
    diagnostics.messages = sink.take();
    Ok(CalibrationResult { calibration, scale, peaks, diagnostics })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ge_core::NullSink;

    #[test]
    fn test_config_defaults_from_yaml() {
        let cfg: CalibrationConfig = serde_yaml_ng::from_str("degree: 1\n").unwrap();
        assert_eq!(cfg.degree, 1);
        assert_eq!(cfg.models, ModelSpec::Uniform(ShapeModel::GaussStep));
        assert_eq!(cfg.allowed_p_value, 0.05);
        assert_eq!(cfg.tail_weight, 100.0);
        assert!(cfg.range_kev.is_none());
    }

    #[test]
    fn test_config_windows_and_models() {
        let yaml = "range_kev:\n  per_peak: [20, null, [10, 15]]\nmodels: [radford, null, gauss_step]\n";
        let cfg: CalibrationConfig = serde_yaml_ng::from_str(yaml).unwrap();
        assert_eq!(cfg.window_kev(0), Some(Some(PeakRange::Width(20.0))));
        assert_eq!(cfg.window_kev(1), None);
        assert_eq!(cfg.window_kev(2), Some(Some(PeakRange::LeftRight(10.0, 15.0))));
        assert_eq!(cfg.model(0), Some(ShapeModel::Radford));
        assert_eq!(cfg.model(1), None);

        let cfg: CalibrationConfig =
            serde_json::from_str(r#"{"range_kev": {"left_right": [8, 12]}, "models": "radford"}"#).unwrap();
        assert_eq!(cfg.window_kev(5), Some(Some(PeakRange::LeftRight(8.0, 12.0))));
        assert_eq!(cfg.model(5), Some(ShapeModel::Radford));
    }

    #[test]
    fn test_input_validation() {
        let cfg = CalibrationConfig::default();
        let raw = [100.0, 200.0];
        let refs = [238.6, 583.2, 2614.5];
        let check = |raw: &[f64], refs: &[f64], g: f64, cfg: &CalibrationConfig| {
            matches!(calibrate(raw, refs, g, cfg, &NullSink), Err(Error::Validation(_)))
        };
        assert!(check(&raw, &refs, 0.0, &cfg));
        assert!(check(&raw, &refs, -1.0, &cfg));
        assert!(check(&[], &refs, 1.0, &cfg));
        assert!(check(&[1.0, f64::NAN], &refs, 1.0, &cfg));
        assert!(check(&raw, &[238.6], 1.0, &cfg));
        let quad = CalibrationConfig { degree: 2, ..CalibrationConfig::default() };
        assert!(check(&raw, &refs, 1.0, &quad));
        let bad_p = CalibrationConfig { allowed_p_value: 2.0, ..CalibrationConfig::default() };
        assert!(check(&raw, &refs, 1.0, &bad_p));
        let per_peak = CalibrationConfig {
            models: ModelSpec::PerPeak(vec![Some(ShapeModel::Radford)]),
            ..CalibrationConfig::default()
        };
        assert!(check(&raw, &refs, 1.0, &per_peak));
    }

    #[test]
    fn test_invert_rough_polynomial() {
        let p = Polynomial::new(vec![1e-6, 0.5, 2.0]);
        let x = invert(&p, 1000.0);
        assert!((p.eval(x) - 1000.0).abs() < 1e-8);
        let flat = Polynomial::scale(0.25);
        assert_eq!(invert(&flat, 100.0), 400.0);
    }
}
