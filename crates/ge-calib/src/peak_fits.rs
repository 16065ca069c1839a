//! Batch fits of individual peaks in raw units.

use crate::staged_fit::{StagedFitOptions, StagedFitter};
use ge_core::{DiagnosticsSink, Error, FitResult, Histogram, Result};
use ge_inference::{ErrorDef, Minimizer, Strategy};
use ge_shapes::math::chi2_sf;
use ge_shapes::{BinSpec, ExtendedBinnedNll, ShapeModel, histogram, int_aligned_binning};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Fit window around a mode guess, in raw units.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowSpec {
    /// Total width, split evenly around the mode
    Width(f64),
    /// Distances below and above the mode
    LeftRight(f64, f64),
}

impl WindowSpec {
    /// `(left, right)` extents.
    pub fn extents(self) -> (f64, f64) {
        match self {
            WindowSpec::Width(w) => (0.5 * w, 0.5 * w),
            WindowSpec::LeftRight(l, r) => (l, r),
        }
    }
}

/// One peak to fit.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PeakRequest {
    /// Approximate peak position
    pub mode_guess: f64,
    /// Fit window
    pub window: WindowSpec,
    /// Histogram bins over the window
    pub n_bins: usize,
    /// Peak shape
    pub model: ShapeModel,
}

/// Likelihood used for the per-peak fits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FitMethod {
    /// Extended unbinned likelihood through the staged fitter
    #[default]
    Unbinned,
    /// Extended binned Poisson likelihood
    Binned,
}

/// Options shared by every peak of a [`fit_peaks`] call.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FitPeaksOptions {
    /// Likelihood
    pub method: FitMethod,
    /// Cap on the number of window samples used by unbinned fits
    pub n_events: Option<usize>,
    /// Minimum acceptable χ² p-value
    pub allowed_p_value: f64,
    /// Snap windows to integer-aligned binning
    pub uncal_is_int: bool,
    /// Run a simplex phase before the gradient fit (binned method)
    pub simplex: bool,
    /// Tail prior weight for tailed models
    pub tail_weight: f64,
    /// Minimum fitted signal count for unbinned fits
    pub min_signal_counts: f64,
}

impl Default for FitPeaksOptions {
    fn default() -> Self {
        Self {
            method: FitMethod::Unbinned,
            n_events: None,
            allowed_p_value: 0.05,
            uncal_is_int: false,
            simplex: false,
            tail_weight: 100.0,
            min_signal_counts: 100.0,
        }
    }
}

/// Why a peak fit was rejected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "detail")]
pub enum InvalidReason {
    /// Free-parameter covariance missing, or its sum is zero or not finite
    CovarianceDegenerate,
    /// The minimiser did not converge
    NotConverged,
    /// A free relative uncertainty is below 1e-7 or NaN
    ErrorTooSmall,
    /// Fitted total events differ from the window content by more than 10 %
    TotalEventsMismatch,
    /// χ² p-value below the threshold or NaN
    PValueTooLow,
    /// Fitted signal below the minimum count
    TooFewSignalCounts,
    /// The fit raised an error
    FitError(String),
}

/// Outcome of one peak fit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeakFit {
    /// The request that produced this fit
    pub request: PeakRequest,
    /// Model of the returned parameters (tail-free when the tail was dropped)
    pub model: ShapeModel,
    /// Parameter values, NaN when the fit errored
    pub parameters: Vec<f64>,
    /// Parameter uncertainties
    pub errors: Vec<f64>,
    /// Row-major covariance
    pub covariance: Option<Vec<f64>>,
    /// χ² p-value, 0 when the fit errored
    pub p_value: f64,
    /// Accepted for calibration
    pub valid: bool,
    /// Reason for rejection
    pub reason: Option<InvalidReason>,
    /// Histogram bin width
    pub bin_width: f64,
    /// Fit window
    pub range: (f64, f64),
}

impl PeakFit {
    /// Parameter names of [`PeakFit::model`].
    pub fn parameter_names(&self) -> &'static [&'static str] {
        self.model.parameter_names()
    }

    /// Centroid and its error.
    pub fn centroid(&self) -> (f64, f64) {
        self.model.mean_and_uncertainty(&self.parameters, &self.errors)
    }

    /// FWHM and its error.
    pub fn fwhm(&self) -> (f64, f64) {
        self.model.fwhm_and_uncertainty(&self.parameters, self.covariance.as_deref())
    }

    fn failed(request: PeakRequest, range: (f64, f64), bin_width: f64, err: &Error) -> Self {
        let n = request.model.n_params();
        Self {
            request,
            model: request.model,
            parameters: vec![f64::NAN; n],
            errors: vec![f64::NAN; n],
            covariance: None,
            p_value: 0.0,
            valid: false,
            reason: Some(InvalidReason::FitError(err.to_string())),
            bin_width,
            range,
        }
    }
}

/// Fit every request independently; results come back in input order.
pub fn fit_peaks(
    samples: &[f64],
    requests: &[PeakRequest],
    options: &FitPeaksOptions,
    minimizer: &Minimizer,
    sink: &dyn DiagnosticsSink,
) -> Vec<PeakFit> {
    requests.par_iter().map(|r| fit_peak(samples, *r, options, minimizer, sink)).collect()
}

/// Fit a single request; errors become an invalid entry.
pub fn fit_peak(
    samples: &[f64],
    request: PeakRequest,
    options: &FitPeaksOptions,
    minimizer: &Minimizer,
    sink: &dyn DiagnosticsSink,
) -> PeakFit {
    let (left, right) = request.window.extents();
    let mut range = (request.mode_guess - left, request.mode_guess + right);
    let mut n_bins = request.n_bins;
    if options.uncal_is_int {
        match int_aligned_binning(range.0, range.1, BinSpec::Count(n_bins)) {
            Ok(b) => {
                range = (b.x_lo, b.x_hi);
                n_bins = b.n_bins;
            }
            Err(e) => return PeakFit::failed(request, range, f64::NAN, &e),
        }
    }
    let bin_width = (range.1 - range.0) / n_bins.max(1) as f64;

    match try_fit_peak(samples, request, range, n_bins, options, minimizer, sink) {
        Ok(fit) => {
            if let Some(reason) = &fit.reason {
                sink.debug(
                    "fit_peaks",
                    format!("peak at {:.1} rejected: {reason:?}", request.mode_guess),
                );
            }
            fit
        }
        Err(e) => {
            sink.debug("fit_peaks", format!("fit failed for peak at {:.1}: {e}", request.mode_guess));
            PeakFit::failed(request, range, bin_width, &e)
        }
    }
}

fn try_fit_peak(
    samples: &[f64],
    request: PeakRequest,
    range: (f64, f64),
    n_bins: usize,
    options: &FitPeaksOptions,
    minimizer: &Minimizer,
    sink: &dyn DiagnosticsSink,
) -> Result<PeakFit> {
    let (lo, hi) = range;
    let bin_width = (hi - lo) / n_bins as f64;
    let model = request.model;

    let (model, fit, hist, unbinned) = match options.method {
        FitMethod::Unbinned => {
            let cap = options.n_events.unwrap_or(usize::MAX);
            let window: Vec<f64> =
                samples.iter().copied().filter(|&x| x > lo && x < hi).take(cap).collect();
            let hist = histogram(&window, range, BinSpec::Count(n_bins))?;
            let fitter = StagedFitter::new(
                minimizer,
                StagedFitOptions { bin_width, tail_weight: options.tail_weight, allow_tail_drop: true },
            );
            let staged = fitter.fit_unbinned(&window, model, None, Some(request.mode_guess), range, sink)?;
            (staged.selected.model, staged.selected.fit, hist, true)
        }
        FitMethod::Binned => {
            let hist = histogram(samples, range, BinSpec::Count(n_bins))?;
            let guess = model.guess(&hist, range, Some(request.mode_guess), minimizer)?;
            let cost = ExtendedBinnedNll::new(model, &hist);
            let strategy = if options.simplex { Strategy::SimplexThenGradient } else { Strategy::Gradient };
            let fit = minimizer.minimize(
                &cost,
                &guess,
                &model.bounds(&guess),
                &model.fixed_mask(),
                ErrorDef::Likelihood,
                strategy,
            )?;
            (model, fit, hist, false)
        }
    };

    if fit.parameters.iter().any(|p| p.is_nan()) {
        return Err(Error::FitFailed(format!("NaN parameters: {:?}", fit.parameters)));
    }

    let gof = model.goodness_of_fit(&hist, &fit.parameters)?;
    let p_value = chi2_sf(gof.statistic, gof.n_bins_used as f64);
    let reason = rejection(model, &fit, &hist, p_value, unbinned, options);

    Ok(PeakFit {
        request,
        model,
        errors: fit.uncertainties.clone(),
        covariance: fit.covariance.clone(),
        parameters: fit.parameters,
        p_value,
        valid: reason.is_none(),
        reason,
        bin_width,
        range,
    })
}

/// First failed acceptance criterion, in order of precedence.
fn rejection(
    model: ShapeModel,
    fit: &FitResult,
    hist: &Histogram,
    p_value: f64,
    unbinned: bool,
    options: &FitPeaksOptions,
) -> Option<InvalidReason> {
    let free: Vec<usize> =
        model.fixed_mask().iter().enumerate().filter(|(_, f)| !**f).map(|(i, _)| i).collect();

    let cov_sum = fit.covariance.as_ref().map(|c| {
        let n = model.n_params();
        free.iter().flat_map(|&i| free.iter().map(move |&j| c[i * n + j])).sum::<f64>()
    });
    match cov_sum {
        Some(s) if s.is_finite() && s != 0.0 => {}
        _ => return Some(InvalidReason::CovarianceDegenerate),
    }
    if !fit.converged {
        return Some(InvalidReason::NotConverged);
    }
    let tiny = free.iter().any(|&i| {
        let e = fit.uncertainties[i];
        e.is_nan() || (e / fit.parameters[i]).abs() < 1e-7
    });
    if tiny {
        return Some(InvalidReason::ErrorTooSmall);
    }
    let (total, _) = model.total_event_count(&fit.parameters, &fit.uncertainties);
    let observed = hist.sum();
    if !((total - observed).abs() / observed <= 0.1) {
        return Some(InvalidReason::TotalEventsMismatch);
    }
    if p_value.is_nan() || p_value < options.allowed_p_value {
        return Some(InvalidReason::PValueTooLow);
    }
    let (i_sig, _) = model.count_indices();
    if unbinned && fit.parameters[i_sig] < options.min_signal_counts {
        return Some(InvalidReason::TooFewSignalCounts);
    }
    None
}
