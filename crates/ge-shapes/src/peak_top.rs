//! Gaussian fit to the top of a peak.

use crate::histogram::argmax;
use ge_core::{Error, Histogram, Result};
use ge_inference::{ErrorDef, Minimizer, Strategy, WeightedLeastSquares};
use serde::{Deserialize, Serialize};

/// Result of [`fit_peak_top`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeakTop {
    /// Position of the maximum
    pub mode: f64,
    /// Gaussian width
    pub sigma: f64,
    /// Amplitude at the mode (counts per bin)
    pub height: f64,
    /// Row-major 3x3 covariance of (mode, sigma, height)
    pub covariance: [f64; 9],
}

impl PeakTop {
    /// Uncertainty on the mode.
    pub fn mode_error(&self) -> f64 {
        self.covariance[0].max(0.0).sqrt()
    }
}

fn gauss_top(x: f64, p: &[f64]) -> f64 {
    let z = (x - p[0]) / p[1];
    p[2] * (-0.5 * z * z).exp()
}

/// Fit `A exp(-(x-mode)²/2σ²)` to `n_bins` bins centred on the peak.
///
/// The window is centred on the bin containing `mode_guess`, or on the tallest
/// bin when no guess is given. Fails when the window leaves the histogram, when
/// it holds no counts, or when the fit does not converge.
pub fn fit_peak_top(
    hist: &Histogram,
    mode_guess: Option<f64>,
    n_bins: usize,
    minimizer: &Minimizer,
) -> Result<PeakTop> {
    if n_bins < 3 {
        return Err(Error::Validation(format!("peak top needs at least 3 bins, got {n_bins}")));
    }
    let centre = match mode_guess {
        Some(m) => hist
            .find_bin(m)
            .ok_or_else(|| Error::Validation(format!("mode guess {m} outside histogram")))?,
        None => argmax(hist.counts())
            .ok_or_else(|| Error::Validation("empty histogram".to_string()))?,
    };
    let half = n_bins / 2;
    if centre < half || centre - half + n_bins > hist.n_bins() {
        return Err(Error::FitFailed(format!(
            "peak top window of {n_bins} bins around bin {centre} leaves the histogram"
        )));
    }
    let i0 = centre - half;
    let x = hist.bin_centers()[i0..i0 + n_bins].to_vec();
    let y = &hist.counts()[i0..i0 + n_bins];
    let sigma_y: Vec<f64> = hist.floored_variance(1.0)[i0..i0 + n_bins].iter().map(|v| v.sqrt()).collect();

    let total: f64 = y.iter().sum();
    if !(total > 0.0) {
        return Err(Error::FitFailed("no counts in peak top window".to_string()));
    }
    let mean = x.iter().zip(y).map(|(xi, yi)| xi * yi).sum::<f64>() / total;
    let var = x.iter().zip(y).map(|(xi, yi)| yi * (xi - mean).powi(2)).sum::<f64>() / total;
    let width = x[n_bins - 1] - x[0];
    let sigma0 = if var > 0.0 { var.sqrt() } else { width / 4.0 };
    let height0 = y.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let mode0 = hist.bin_centers()[centre];

    let cost = WeightedLeastSquares::new(&x, y, &sigma_y, gauss_top)?;
    let unbounded = (f64::NEG_INFINITY, f64::INFINITY);
    let fit = minimizer.minimize(
        &cost,
        &[mode0, sigma0, height0],
        &[unbounded; 3],
        &[false; 3],
        ErrorDef::LeastSquares,
        Strategy::SimplexThenGradient,
    )?;
    if !fit.converged || fit.parameters.iter().any(|p| !p.is_finite()) {
        return Err(Error::FitFailed(format!("peak top fit did not converge near {mode0}")));
    }

    let mut covariance = [0.0; 9];
    for i in 0..3 {
        for j in 0..3 {
            covariance[i * 3 + j] = fit.covariance_at(i, j).unwrap_or(f64::NAN);
        }
    }
    // sigma enters squared; report the positive root and flip its correlations.
    let sign = fit.parameters[1].signum();
    for k in 0..3 {
        if k != 1 {
            covariance[k * 3 + 1] *= sign;
            covariance[3 + k] *= sign;
        }
    }
    Ok(PeakTop {
        mode: fit.parameters[0],
        sigma: fit.parameters[1].abs(),
        height: fit.parameters[2],
        covariance,
    })
}
