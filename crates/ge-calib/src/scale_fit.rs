//! Energy scale and calibration curve fits.
//!
//! [`fit_scale`] fits `measured = poly(E)` and [`fit_inverse`] fits
//! `E = poly(measured)`, propagating the measured variances through the scale's
//! slope.

use ge_core::{Error, Polynomial, Result};
use ge_inference::{ErrorDef, Minimizer, Strategy, WeightedLeastSquares};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Coefficients held fixed, keyed by index (highest degree first).
///
/// `None` keeps the least-squares estimate of that coefficient.
pub type FixedCoefficients = BTreeMap<usize, Option<f64>>;

/// A fitted calibration polynomial.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CurveFit {
    /// Fitted polynomial
    pub polynomial: Polynomial,
    /// Coefficient uncertainties
    pub errors: Vec<f64>,
    /// Row-major coefficient covariance
    pub covariance: Vec<f64>,
    /// Weighted χ² at the solution
    pub chi2: f64,
}

/// Fit `measured = poly(energies)` weighted by `measured_variance`.
pub fn fit_scale(
    measured: &[f64],
    measured_variance: &[f64],
    energies: &[f64],
    degree: usize,
    fixed: &FixedCoefficients,
    minimizer: &Minimizer,
) -> Result<CurveFit> {
    fit_curve(energies, measured, measured_variance, degree, fixed, minimizer)
}

/// Fit `energies = poly(measured)`.
///
/// Energy variances are `var_measured / scale'(E)²` at each reference energy.
pub fn fit_inverse(
    measured: &[f64],
    measured_variance: &[f64],
    energies: &[f64],
    scale: &Polynomial,
    degree: usize,
    fixed: &FixedCoefficients,
    minimizer: &Minimizer,
) -> Result<CurveFit> {
    if measured_variance.len() != energies.len() {
        return Err(Error::Validation(format!(
            "{} variances for {} energies",
            measured_variance.len(),
            energies.len()
        )));
    }
    let slope = scale.derivative();
    let energy_variance: Vec<f64> =
        measured_variance.iter().zip(energies).map(|(v, &e)| v / slope.eval(e).powi(2)).collect();
    fit_curve(measured, energies, &energy_variance, degree, fixed, minimizer)
}

fn fit_curve(
    x: &[f64],
    y: &[f64],
    variance: &[f64],
    degree: usize,
    fixed: &FixedCoefficients,
    minimizer: &Minimizer,
) -> Result<CurveFit> {
    if x.len() != y.len() || x.len() != variance.len() {
        return Err(Error::Validation(format!(
            "curve fit length mismatch: x={}, y={}, variance={}",
            x.len(),
            y.len(),
            variance.len()
        )));
    }
    if variance.iter().any(|v| !(v.is_finite() && *v > 0.0)) {
        return Err(Error::Validation("curve fit variances must be finite and positive".into()));
    }
    let sigma: Vec<f64> = variance.iter().map(|v| v.sqrt()).collect();

    if degree == 0 {
        // The intercept of a scale is zero; only the slope can be fixed freely.
        for (&i, value) in fixed {
            if i > 1 || (i == 1 && value.is_some_and(|v| v != 0.0)) {
                return Err(Error::Validation(format!(
                    "degree 0 fit cannot fix coefficient {i} to {value:?}"
                )));
            }
        }
        let (s, var) = match fixed.get(&0) {
            Some(Some(v)) => (*v, 0.0),
            Some(None) => (Polynomial::fit_scale(x, y, Some(variance))?.0, 0.0),
            None => Polynomial::fit_scale(x, y, Some(variance))?,
        };
        let polynomial = Polynomial::scale(s);
        let chi2 = chi2(&polynomial, x, y, &sigma);
        return Ok(CurveFit {
            polynomial,
            errors: vec![var.sqrt(), 0.0],
            covariance: vec![var, 0.0, 0.0, 0.0],
            chi2,
        });
    }

    let n = degree + 1;
    if let Some(&i) = fixed.keys().find(|&&i| i >= n) {
        return Err(Error::Validation(format!("fixed index {i} out of range for degree {degree}")));
    }
    let n_free = n - fixed.len();
    if x.len() < n_free.max(1) {
        return Err(Error::InsufficientData(format!(
            "{} points cannot constrain {n_free} free coefficients",
            x.len()
        )));
    }

    let weights: Vec<f64> = sigma.iter().map(|s| 1.0 / s).collect();
    let (ls, ls_cov) = Polynomial::fit_with_covariance(x, y, degree, Some(&weights))?;
    let mut start = ls.coefficients().to_vec();
    for (&i, value) in fixed {
        if let Some(v) = value {
            start[i] = *v;
        }
    }
    let start_poly = Polynomial::new(start.clone());
    let start_chi2 = chi2(&start_poly, x, y, &sigma);

    let mask: Vec<bool> = (0..n).map(|i| fixed.contains_key(&i)).collect();
    let cost = WeightedLeastSquares::new(x, y, &sigma, |x, p: &[f64]| {
        p.iter().fold(0.0, |acc, &c| acc * x + c)
    })?;
    let bounds = vec![(f64::NEG_INFINITY, f64::INFINITY); n];
    let refined = minimizer.minimize(
        &cost,
        &start,
        &bounds,
        &mask,
        ErrorDef::LeastSquares,
        Strategy::SimplexThenGradient,
    );

    match refined {
        Ok(fit)
            if fit.fval.is_finite()
                && fit.fval <= start_chi2 * (1.0 + 1e-9) + 1e-12
                && fit.covariance.is_some() =>
        {
            let covariance = fit.covariance.unwrap_or_default();
            Ok(CurveFit {
                polynomial: Polynomial::new(fit.parameters),
                errors: fit.uncertainties,
                covariance,
                chi2: fit.fval,
            })
        }
        other => {
            if let Err(e) = &other {
                log::debug!("calibration curve refinement failed: {e}");
            }
            // Linear covariance restricted to the free coefficients.
            let mut covariance = vec![0.0; n * n];
            for i in 0..n {
                for j in 0..n {
                    if !mask[i] && !mask[j] {
                        covariance[i * n + j] = ls_cov[(i, j)];
                    }
                }
            }
            let errors = (0..n).map(|i| covariance[i * n + i].max(0.0).sqrt()).collect();
            Ok(CurveFit { polynomial: start_poly, errors, covariance, chi2: start_chi2 })
        }
    }
}

fn chi2(poly: &Polynomial, x: &[f64], y: &[f64], sigma: &[f64]) -> f64 {
    x.iter().zip(y).zip(sigma).map(|((&x, &y), s)| ((y - poly.eval(x)) / s).powi(2)).sum()
}
