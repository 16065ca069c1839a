//! Multi-attempt unbinned peak fits with tail arbitration.
//!
//! A staged fit walks an explicit state machine:
//!
//! ```text
//! Guessing ─► FittingNoTail ─► Arbitrating ─► Done
//!         └─► FittingNoTail ─► FittingTailed ─► Arbitrating ─► Done | Failed
//! ```
//!
//! Every fitting stage runs a gradient-only attempt and a simplex-then-gradient
//! attempt from the same guess, bounds and fixed mask, plus a retry with a doubled
//! simplex phase when both are invalid. Arbitrating picks one attempt and, for
//! tailed models, decides whether the tail is worth keeping.

use ge_core::{DiagnosticsSink, Error, FitResult, Result};
use ge_inference::{ErrorDef, Minimizer, Strategy};
use ge_shapes::math::chi2_sf;
use ge_shapes::{BinSpec, ExtendedUnbinnedNll, GoodnessOfFit, ShapeModel, histogram};
use serde::{Deserialize, Serialize};

/// States of the staged fit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Building the initial parameters
    Guessing,
    /// Fitting the tail-free model (primary fit or fallback)
    FittingNoTail,
    /// Fitting the tailed model with the tail prior
    FittingTailed,
    /// Choosing between attempts and models
    Arbitrating,
    /// A result was selected
    Done,
    /// No acceptable result
    Failed,
}

/// Options for [`StagedFitter`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StagedFitOptions {
    /// Bin width of the histogram used for guesses and goodness of fit
    pub bin_width: f64,
    /// Weight of the `ln(htail + 0.1)` prior for tailed models
    pub tail_weight: f64,
    /// Whether a tailed model may fall back to its tail-free counterpart
    pub allow_tail_drop: bool,
}

impl Default for StagedFitOptions {
    fn default() -> Self {
        Self { bin_width: 1.0, tail_weight: 10.0, allow_tail_drop: true }
    }
}

/// One minimisation attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attempt {
    /// Model that was fitted
    pub model: ShapeModel,
    /// Optimizer sequence used
    pub strategy: Strategy,
    /// Minimiser output
    pub fit: FitResult,
    /// Pearson χ² on the guess histogram
    pub gof: GoodnessOfFit,
    /// Converged, no NaN free error, and not all free errors zero
    pub valid: bool,
}

impl Attempt {
    /// `Σ |err / value|` over the free parameters.
    ///
    /// A free parameter sitting at exactly zero makes the sum infinite, so the
    /// attempt loses to any attempt with a finite sum.
    pub fn relative_error_sum(&self) -> f64 {
        let fixed = self.model.fixed_mask();
        self.fit
            .parameters
            .iter()
            .zip(&self.fit.uncertainties)
            .zip(fixed)
            .filter(|(_, f)| !*f)
            .map(|((v, e), _)| if *v == 0.0 { f64::INFINITY } else { (e / v).abs() })
            .sum()
    }

    /// χ² survival probability of the attempt.
    pub fn p_value(&self) -> f64 {
        chi2_sf(self.gof.statistic, self.gof.dof)
    }
}

/// Result of a staged fit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StagedFit {
    /// Model requested by the caller
    pub requested: ShapeModel,
    /// The selected attempt; its model differs from `requested` when the tail was dropped
    pub selected: Attempt,
    /// Whether the tail-free fallback replaced the tailed fit
    pub tail_dropped: bool,
    /// States visited, in order
    pub trace: Vec<Stage>,
}

impl StagedFit {
    /// Model of the selected fit.
    pub fn model(&self) -> ShapeModel {
        self.selected.model
    }

    /// Parameters of the selected fit.
    pub fn parameters(&self) -> &[f64] {
        &self.selected.fit.parameters
    }

    /// Uncertainties of the selected fit.
    pub fn uncertainties(&self) -> &[f64] {
        &self.selected.fit.uncertainties
    }
}

/// Pick one of a stage's attempts.
///
/// With a retry present (both primary attempts invalid) only the retry counts.
/// Otherwise: the single valid attempt; else the one whose χ² is more than 5 %
/// smaller; else the one with the smaller summed relative error. A full tie is
/// an [`Error::AmbiguousFit`].
pub fn arbitrate(attempts: &[Attempt]) -> Result<usize> {
    match attempts {
        [a, b] => match (a.valid, b.valid) {
            (true, false) => Ok(0),
            (false, true) => Ok(1),
            (false, false) => Err(Error::FitFailed("both fit attempts are invalid".to_string())),
            (true, true) => {
                let (cs1, cs2) = (a.gof.statistic, b.gof.statistic);
                if cs1 * 1.05 < cs2 {
                    return Ok(0);
                }
                if cs2 * 1.05 < cs1 {
                    return Ok(1);
                }
                let (f1, f2) = (a.relative_error_sum(), b.relative_error_sum());
                if !(f1.is_finite() || f2.is_finite()) {
                    return Err(Error::AmbiguousFit(format!(
                        "attempts tie on chi2 ({cs1}, {cs2}) and neither has finite relative errors"
                    )));
                }
                if f1 < f2 {
                    Ok(0)
                } else if f1 > f2 {
                    Ok(1)
                } else {
                    Err(Error::AmbiguousFit(format!(
                        "attempts tie on chi2 ({cs1}, {cs2}) and relative errors ({f1}, {f2})"
                    )))
                }
            }
        },
        [_, _, retry] if retry.valid => Ok(2),
        [_, _, _] => Err(Error::FitFailed(
            "fit invalid after the intensified simplex retry".to_string(),
        )),
        _ => Err(Error::Validation(format!("cannot arbitrate {} attempts", attempts.len()))),
    }
}

/// Unbinned maximum-likelihood fitter with fallback and tail arbitration.
pub struct StagedFitter<'a> {
    minimizer: &'a Minimizer,
    options: StagedFitOptions,
}

struct Run<'s> {
    samples: Vec<f64>,
    fit_range: (f64, f64),
    hist: ge_core::Histogram,
    mode_guess: Option<f64>,
    sink: &'s dyn DiagnosticsSink,
}

impl<'a> StagedFitter<'a> {
    /// Fitter using `minimizer` for every attempt.
    pub fn new(minimizer: &'a Minimizer, options: StagedFitOptions) -> Self {
        Self { minimizer, options }
    }

    /// Options in use.
    pub fn options(&self) -> &StagedFitOptions {
        &self.options
    }

    /// Fit `model` to the samples inside `fit_range`.
    ///
    /// A supplied `guess` competes with a fresh one on Pearson χ²; `mode_guess`
    /// seeds the fresh guess.
    pub fn fit_unbinned(
        &self,
        samples: &[f64],
        model: ShapeModel,
        guess: Option<&[f64]>,
        mode_guess: Option<f64>,
        fit_range: (f64, f64),
        sink: &dyn DiagnosticsSink,
    ) -> Result<StagedFit> {
        let (lo, hi) = fit_range;
        if !(lo.is_finite() && hi.is_finite() && lo < hi) {
            return Err(Error::Validation(format!("invalid fit range ({lo}, {hi})")));
        }
        let in_range: Vec<f64> = samples.iter().copied().filter(|&x| x >= lo && x <= hi).collect();
        if in_range.is_empty() {
            return Err(Error::InsufficientData(format!("no samples in ({lo}, {hi})")));
        }
        let hist = histogram(&in_range, fit_range, BinSpec::Width(self.options.bin_width))?;
        let run = Run { samples: in_range, fit_range, hist, mode_guess, sink };

        let mut trace = Vec::new();
        let mut stage = Stage::Guessing;
        let mut guess_params: Option<Vec<f64>> = None;
        let mut fallback: Option<Result<Attempt>> = None;
        let mut tailed: Option<Vec<Attempt>> = None;
        let mut outcome: Option<Result<(Attempt, bool)>> = None;

        loop {
            trace.push(stage);
            sink.debug("staged_fit", format!("{model}: {stage:?}"));
            stage = match stage {
                Stage::Guessing => {
                    if let Some(g) = guess {
                        guess_params = Some(self.compare_guesses(&run, model, g)?);
                    }
                    // Tailed models without a guess are seeded from the tail-free fit.
                    if guess_params.is_none() && !model.has_tail() {
                        guess_params = Some(self.fresh_guess(&run, model)?);
                    }
                    Stage::FittingNoTail
                }
                Stage::FittingNoTail => {
                    let core = model.tail_free().unwrap_or(model);
                    let seed_needed = model.has_tail() && guess_params.is_none();
                    if core == model || self.options.allow_tail_drop || seed_needed {
                        let core_guess = match (&guess_params, core == model) {
                            (Some(g), true) => Ok(g.clone()),
                            _ => self.fresh_guess(&run, core),
                        };
                        let result = core_guess.and_then(|g| {
                            let attempts = self.fit_attempts(&run, core, &g, 0.0);
                            arbitrate(&attempts).map(|i| attempts[i].clone())
                        });
                        fallback = Some(result);
                    }
                    if core == model {
                        Stage::Arbitrating
                    } else {
                        if guess_params.is_none() {
                            let tail_guess = self.fresh_guess(&run, model)?;
                            guess_params = Some(match &fallback {
                                Some(Ok(nt)) if nt.valid => {
                                    model.with_tail_from(&nt.fit.parameters, &tail_guess)?
                                }
                                _ => tail_guess,
                            });
                        }
                        Stage::FittingTailed
                    }
                }
                Stage::FittingTailed => {
                    let g = guess_params
                        .as_deref()
                        .ok_or_else(|| Error::Computation("tailed fit without a guess".into()))?;
                    tailed = Some(self.fit_attempts(&run, model, g, self.options.tail_weight));
                    Stage::Arbitrating
                }
                Stage::Arbitrating => {
                    let result = match tailed.take() {
                        None => match fallback.take() {
                            Some(r) => r.map(|a| (a, false)),
                            None => Err(Error::Computation("nothing to arbitrate".into())),
                        },
                        Some(attempts) => {
                            let allow_drop = self.options.allow_tail_drop;
                            self.arbitrate_tail(&run, attempts, fallback.take(), allow_drop)
                        }
                    };
                    let next = if result.is_ok() { Stage::Done } else { Stage::Failed };
                    outcome = Some(result);
                    next
                }
                Stage::Done | Stage::Failed => break,
            };
        }

        let (selected, tail_dropped) = outcome
            .unwrap_or_else(|| Err(Error::Computation("staged fit ended without outcome".into())))?;
        Ok(StagedFit { requested: model, selected, tail_dropped, trace })
    }

    fn fresh_guess(&self, run: &Run<'_>, model: ShapeModel) -> Result<Vec<f64>> {
        model.guess(&run.hist, run.fit_range, run.mode_guess, self.minimizer)
    }

    /// Keep whichever of the supplied and the fresh guess describes the data better.
    fn compare_guesses(&self, run: &Run<'_>, model: ShapeModel, supplied: &[f64]) -> Result<Vec<f64>> {
        let fresh = self.fresh_guess(run, model)?;
        if supplied.len() != model.n_params() {
            run.sink.debug(
                "staged_fit",
                format!("supplied guess has {} parameters, using a fresh guess", supplied.len()),
            );
            return Ok(fresh);
        }
        let mut x0 = supplied.to_vec();
        let ri = model.range_index();
        x0[ri] = run.fit_range.0;
        x0[ri + 1] = run.fit_range.1;
        let cs0 = model.goodness_of_fit(&run.hist, &x0).map(|g| g.statistic).unwrap_or(f64::INFINITY);
        let cs1 = model.goodness_of_fit(&run.hist, &fresh).map(|g| g.statistic).unwrap_or(f64::INFINITY);
        Ok(if cs0 >= cs1 { fresh } else { x0 })
    }

    fn attempt(
        &self,
        run: &Run<'_>,
        model: ShapeModel,
        guess: &[f64],
        tail_weight: f64,
        strategy: Strategy,
    ) -> Attempt {
        let cost = ExtendedUnbinnedNll::new(model, &run.samples).with_tail_prior(tail_weight);
        let fixed = model.fixed_mask();
        let fit = self
            .minimizer
            .minimize(&cost, guess, &model.bounds(guess), &fixed, ErrorDef::Likelihood, strategy)
            .unwrap_or_else(|e| {
                run.sink.debug("staged_fit", format!("{model} {strategy:?} attempt failed: {e}"));
                FitResult::nan(model.n_params())
            });
        let gof = model.goodness_of_fit(&run.hist, &fit.parameters).unwrap_or(GoodnessOfFit {
            statistic: f64::NAN,
            dof: f64::NAN,
            n_bins_used: 0,
        });
        let free_errors: Vec<f64> = fit
            .uncertainties
            .iter()
            .zip(&fixed)
            .filter(|(_, f)| !**f)
            .map(|(e, _)| *e)
            .collect();
        let valid = fit.converged
            && !free_errors.iter().any(|e| e.is_nan())
            && !free_errors.iter().all(|&e| e == 0.0);
        Attempt { model, strategy, fit, gof, valid }
    }

    fn fit_attempts(
        &self,
        run: &Run<'_>,
        model: ShapeModel,
        guess: &[f64],
        tail_weight: f64,
    ) -> Vec<Attempt> {
        let mut attempts = vec![
            self.attempt(run, model, guess, tail_weight, Strategy::Gradient),
            self.attempt(run, model, guess, tail_weight, Strategy::SimplexThenGradient),
        ];
        if attempts.iter().all(|a| !a.valid) {
            run.sink.debug("staged_fit", format!("{model}: extra simplex needed"));
            attempts.push(self.attempt(run, model, guess, tail_weight, Strategy::IntensifiedSimplex));
        }
        attempts
    }

    /// Pick the tailed attempt and decide whether the fallback replaces it.
    fn arbitrate_tail(
        &self,
        run: &Run<'_>,
        attempts: Vec<Attempt>,
        fallback: Option<Result<Attempt>>,
        allow_drop: bool,
    ) -> Result<(Attempt, bool)> {
        let fallback = if allow_drop { fallback.and_then(|r| r.ok()) } else { None };
        let chosen = match arbitrate(&attempts) {
            Ok(i) => attempts[i].clone(),
            Err(e @ Error::AmbiguousFit(_)) => return Err(e),
            Err(e) => {
                return match fallback {
                    Some(nt) => {
                        run.sink.info("staged_fit", format!("tailed fit failed ({e}); using tail-free fit"));
                        Ok((nt, true))
                    }
                    None => Err(e),
                };
            }
        };
        let Some(nt) = fallback else {
            return Ok((chosen, false));
        };

        let hi = chosen.model.htail_index().unwrap_or(3);
        let (htail, err_htail) = (chosen.fit.parameters[hi], chosen.fit.uncertainties[hi]);
        let (p_tail, p_no_tail) = (chosen.p_value(), nt.p_value());
        if htail < err_htail || p_no_tail >= p_tail {
            run.sink.debug(
                "staged_fit",
                format!(
                    "dropping tail: htail = {htail:.3} ± {err_htail:.3}, p = {p_tail:.3e} vs {p_no_tail:.3e}"
                ),
            );
            return Ok((nt, true));
        }
        Ok((chosen, false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ge_core::NullSink;

    fn attempt(valid: bool, chi2: f64, errors: [f64; 2]) -> Attempt {
        let mut fit = FitResult::nan(ShapeModel::GaussStep.n_params());
        fit.parameters = vec![100.0, 50.0, 1.0, 10.0, 0.1, 0.0, 100.0];
        fit.uncertainties = vec![errors[0], errors[1], 0.1, 1.0, 0.01, 0.0, 0.0];
        Attempt {
            model: ShapeModel::GaussStep,
            strategy: Strategy::Gradient,
            fit,
            gof: GoodnessOfFit { statistic: chi2, dof: 10.0, n_bins_used: 15 },
            valid,
        }
    }

    #[test]
    fn test_arbitrate_single_valid() {
        assert_eq!(arbitrate(&[attempt(false, 1.0, [1.0, 1.0]), attempt(true, 50.0, [1.0, 1.0])]).unwrap(), 1);
        assert_eq!(arbitrate(&[attempt(true, 50.0, [1.0, 1.0]), attempt(false, 1.0, [1.0, 1.0])]).unwrap(), 0);
    }

    #[test]
    fn test_arbitrate_by_chi2_then_errors() {
        let a = attempt(true, 10.0, [1.0, 1.0]);
        let b = attempt(true, 10.6, [0.5, 0.5]);
        assert_eq!(arbitrate(&[a.clone(), b.clone()]).unwrap(), 0);
        // Within 5 %: smaller summed relative error wins.
        let b = attempt(true, 10.2, [0.5, 0.5]);
        assert_eq!(arbitrate(&[a.clone(), b]).unwrap(), 1);
    }

    #[test]
    fn test_arbitrate_tie_is_ambiguous() {
        let a = attempt(true, 10.0, [1.0, 1.0]);
        assert!(matches!(arbitrate(&[a.clone(), a]), Err(Error::AmbiguousFit(_))));
    }

    #[test]
    fn test_arbitrate_parameter_at_zero() {
        let good = attempt(true, 10.0, [1.0, 1.0]);
        let mut pinned = attempt(true, 10.0, [0.5, 0.5]);
        pinned.fit.parameters[4] = 0.0;
        assert!(pinned.relative_error_sum().is_infinite());
        assert_eq!(arbitrate(&[pinned.clone(), good]).unwrap(), 1);
        let err = arbitrate(&[pinned.clone(), pinned]).unwrap_err();
        assert!(matches!(err, Error::AmbiguousFit(ref m) if m.contains("finite relative errors")));
    }

    #[test]
    fn test_arbitrate_retry() {
        let bad = attempt(false, 1.0, [1.0, 1.0]);
        assert!(matches!(arbitrate(&[bad.clone(), bad.clone()]), Err(Error::FitFailed(_))));
        let good = attempt(true, 1.0, [1.0, 1.0]);
        assert_eq!(arbitrate(&[bad.clone(), bad.clone(), good]).unwrap(), 2);
        assert!(matches!(arbitrate(&[bad.clone(), bad.clone(), bad]), Err(Error::FitFailed(_))));
    }

    #[test]
    fn test_invalid_range() {
        let m = Minimizer::default();
        let fitter = StagedFitter::new(&m, StagedFitOptions::default());
        let err = fitter
            .fit_unbinned(&[1.0, 2.0], ShapeModel::GaussStep, None, None, (5.0, 1.0), &NullSink)
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        let err = fitter
            .fit_unbinned(&[1.0, 2.0], ShapeModel::GaussStep, None, None, (5.0, 10.0), &NullSink)
            .unwrap_err();
        assert!(matches!(err, Error::InsufficientData(_)));
    }
}
