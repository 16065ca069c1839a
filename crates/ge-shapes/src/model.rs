//! Peak-shape models and their capability table.
//!
//! Every model is an extended density over a fit window `[x_lo, x_hi]`: a
//! normalised signal shape scaled by `n_sig` plus a normalised step background
//! scaled by `n_bkg`. The window bounds are carried as the last two parameters
//! and are always fixed during minimisation.

use crate::histogram::fwfm;
use crate::math::{SQRT_2, erf_antiderivative, error_function, exp_erfc, normal_cdf, normal_pdf};
use crate::peak_top::fit_peak_top;
use ge_core::{Error, Histogram, Result};
use ge_inference::Minimizer;
use serde::{Deserialize, Serialize};

const FWHM_PER_SIGMA: f64 = 2.354_820_045_030_949_3;

const GAUSS_STEP_NAMES: [&str; 7] = ["n_sig", "mu", "sigma", "n_bkg", "hstep", "x_lo", "x_hi"];
const RADFORD_NAMES: [&str; 9] =
    ["n_sig", "mu", "sigma", "htail", "tau", "n_bkg", "hstep", "x_lo", "x_hi"];

/// Closed set of supported peak shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShapeModel {
    /// Gaussian signal on an erf step background.
    #[default]
    GaussStep,
    /// Gaussian plus low-side exponential tail on an erf step background.
    Radford,
}

/// Pearson χ² of a histogram against a model.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GoodnessOfFit {
    /// Σ (observed − expected)² / expected over bins with positive expectation
    pub statistic: f64,
    /// Bins used minus free parameters
    pub dof: f64,
    /// Bins that entered the statistic
    pub n_bins_used: usize,
}

impl ShapeModel {
    /// Short identifier.
    pub fn name(self) -> &'static str {
        match self {
            ShapeModel::GaussStep => "gauss_step",
            ShapeModel::Radford => "radford",
        }
    }

    /// Parameter names in vector order.
    pub fn parameter_names(self) -> &'static [&'static str] {
        match self {
            ShapeModel::GaussStep => &GAUSS_STEP_NAMES,
            ShapeModel::Radford => &RADFORD_NAMES,
        }
    }

    /// Number of parameters including the fixed window bounds.
    pub fn n_params(self) -> usize {
        self.parameter_names().len()
    }

    /// Position of `name` in the parameter vector.
    pub fn index_of(self, name: &str) -> Option<usize> {
        self.parameter_names().iter().position(|&n| n == name)
    }

    /// Whether the model carries a tail component.
    pub fn has_tail(self) -> bool {
        matches!(self, ShapeModel::Radford)
    }

    /// The same model without its tail, if it has one.
    pub fn tail_free(self) -> Option<ShapeModel> {
        match self {
            ShapeModel::GaussStep => None,
            ShapeModel::Radford => Some(ShapeModel::GaussStep),
        }
    }

    /// Index of the tail fraction.
    pub fn htail_index(self) -> Option<usize> {
        self.has_tail().then_some(3)
    }

    /// Indices of `mu` and `sigma`.
    pub fn mu_sigma_indices(self) -> (usize, usize) {
        (1, 2)
    }

    /// Indices of `n_sig` and `n_bkg`.
    pub fn count_indices(self) -> (usize, usize) {
        match self {
            ShapeModel::GaussStep => (0, 3),
            ShapeModel::Radford => (0, 5),
        }
    }

    /// Index of `x_lo`; `x_hi` follows.
    pub fn range_index(self) -> usize {
        self.n_params() - 2
    }

    /// Check the parameter count.
    pub fn check_len(self, params: &[f64]) -> Result<()> {
        if params.len() != self.n_params() {
            return Err(Error::Validation(format!(
                "{} expects {} parameters, got {}",
                self.name(),
                self.n_params(),
                params.len()
            )));
        }
        Ok(())
    }

    /// Pre-compute normalisations for `params`.
    pub fn shape(self, params: &[f64]) -> Result<Shape> {
        Shape::new(self, params)
    }

    /// Extended density `n_sig·s(x) + n_bkg·b(x)`.
    pub fn pdf(self, x: f64, params: &[f64]) -> Result<f64> {
        Ok(self.shape(params)?.density(x))
    }

    /// Expected counts in `[x_lo, x]`.
    pub fn cdf(self, x: f64, params: &[f64]) -> Result<f64> {
        Ok(self.shape(params)?.cdf(x))
    }

    /// Expected counts per bin.
    pub fn expected_counts(self, edges: &[f64], params: &[f64]) -> Result<Vec<f64>> {
        let shape = self.shape(params)?;
        let cdf: Vec<f64> = edges.iter().map(|&e| shape.cdf(e)).collect();
        Ok(cdf.windows(2).map(|w| w[1] - w[0]).collect())
    }

    /// Initial parameters from a histogram of the fit window.
    ///
    /// The peak top gives the mode, the outer ten bins on each side give the
    /// background level and step, and the width at `1/√e` of the maximum gives σ.
    pub fn guess(
        self,
        hist: &Histogram,
        fit_range: (f64, f64),
        mode_guess: Option<f64>,
        minimizer: &Minimizer,
    ) -> Result<Vec<f64>> {
        let (lo, hi) = fit_range;
        if !(lo < hi) {
            return Err(Error::Validation(format!("invalid fit range ({lo}, {hi})")));
        }
        let counts = hist.counts();
        let centres = hist.bin_centers();
        let n = counts.len();
        let top = fit_peak_top(hist, mode_guess, 10.min(n), minimizer).ok();
        let (mu, height, sigma_top) = match &top {
            Some(t) if t.mode > lo && t.mode < hi => (t.mode, t.height, Some(t.sigma)),
            _ => {
                let i = crate::histogram::argmax(counts)
                    .ok_or_else(|| Error::Validation("empty histogram".to_string()))?;
                (centres[i], counts[i], None)
            }
        };

        let edge = 10.min(n);
        let high_side = counts[n - edge..].iter().sum::<f64>() / edge as f64;
        let low_side = counts[..edge].iter().sum::<f64>() / edge as f64;
        let step = high_side - low_side;
        let baseline = 0.5 * (high_side + low_side);

        let sigma = match fwfm(hist, 0.6065, height, baseline, Some(mu)) {
            Some(w) => 0.5 * w,
            None => sigma_top
                .ok_or_else(|| Error::FitFailed(format!("sigma estimation failed near {mu}")))?,
        };
        let sigma = match self {
            ShapeModel::GaussStep => sigma,
            ShapeModel::Radford => 0.8 * sigma,
        };

        let n_sig: f64 = centres
            .iter()
            .zip(counts)
            .filter(|(c, _)| **c > mu - 3.0 * sigma && **c < mu + 3.0 * sigma)
            .map(|(_, n)| n)
            .sum();
        let n_bkg = hist.sum() - n_sig;
        let hstep = step / (high_side + low_side);

        let mut guess = match self {
            ShapeModel::GaussStep => vec![n_sig, mu, sigma, n_bkg, hstep, lo, hi],
            ShapeModel::Radford => {
                vec![n_sig, mu, sigma, 0.2, 0.5 * sigma, n_bkg, hstep, lo, hi]
            }
        };
        for g in guess.iter_mut() {
            if g.is_nan() {
                *g = 0.0;
            }
        }
        let (i_sig, i_bkg) = self.count_indices();
        guess[i_sig] = guess[i_sig].max(1.0);
        guess[i_bkg] = guess[i_bkg].max(1.0);
        let i_step = self.range_index() - 1;
        guess[i_step] = guess[i_step].clamp(-0.99, 0.99);
        let width = hi - lo;
        guess[2] = guess[2].clamp(1e-3 * width, 0.5 * width);
        if let Some(i) = self.htail_index() {
            guess[i + 1] = guess[i + 1].max(0.1 * guess[2]);
        }
        Ok(guess)
    }

    /// Build a tailed guess from a fitted tail-free parameter vector.
    pub fn with_tail_from(self, core: &[f64], tail_guess: &[f64]) -> Result<Vec<f64>> {
        ShapeModel::GaussStep.check_len(core)?;
        match self {
            ShapeModel::GaussStep => Ok(core.to_vec()),
            ShapeModel::Radford => {
                self.check_len(tail_guess)?;
                let mut p = core[..3].to_vec();
                p.extend_from_slice(&tail_guess[3..5]);
                p.extend_from_slice(&core[3..]);
                Ok(p)
            }
        }
    }

    /// Parameter bounds; `x_lo`/`x_hi` are pinned to their values.
    pub fn bounds(self, params: &[f64]) -> Vec<(f64, f64)> {
        let ri = self.range_index();
        let (lo, hi) = (params[ri], params[ri + 1]);
        let width = hi - lo;
        let inf = f64::INFINITY;
        let sigma = (1e-4 * width, width);
        match self {
            ShapeModel::GaussStep => {
                vec![(0.0, inf), (lo, hi), sigma, (0.0, inf), (-1.0, 1.0), (lo, lo), (hi, hi)]
            }
            ShapeModel::Radford => {
                let s = params[2].abs();
                vec![
                    (0.0, inf),
                    (lo, hi),
                    sigma,
                    (0.0, 0.5),
                    (0.1 * s, 10.0 * s),
                    (0.0, inf),
                    (-1.0, 1.0),
                    (lo, lo),
                    (hi, hi),
                ]
            }
        }
    }

    /// `true` for parameters held fixed (the window bounds).
    pub fn fixed_mask(self) -> Vec<bool> {
        let mut fixed = vec![false; self.n_params()];
        let ri = self.range_index();
        fixed[ri] = true;
        fixed[ri + 1] = true;
        fixed
    }

    /// Number of free parameters.
    pub fn n_free(self) -> usize {
        self.fixed_mask().iter().filter(|f| !**f).count()
    }

    /// Peak centroid and its error.
    pub fn mean_and_uncertainty(self, params: &[f64], errors: &[f64]) -> (f64, f64) {
        (params[1], errors[1])
    }

    /// FWHM of the signal shape and its error propagated through `covariance`.
    pub fn fwhm_and_uncertainty(self, params: &[f64], covariance: Option<&[f64]>) -> (f64, f64) {
        let n = self.n_params();
        match self {
            ShapeModel::GaussStep => {
                let var = covariance.map_or(f64::NAN, |c| c[2 * n + 2]);
                (FWHM_PER_SIGMA * params[2], FWHM_PER_SIGMA * var.max(0.0).sqrt())
            }
            ShapeModel::Radford => {
                let (sigma, htail, tau) = (params[2], params[3], params[4]);
                let fwhm = radford_fwhm(sigma, htail, tau);
                let Some(cov) = covariance else {
                    return (fwhm, f64::NAN);
                };
                let idx = [2usize, 3, 4];
                let mut grad = [0.0; 3];
                for (k, &i) in idx.iter().enumerate() {
                    let h = 1e-5 * params[i].abs().max(1e-3);
                    let mut up = [sigma, htail, tau];
                    let mut dn = up;
                    up[k] += h;
                    dn[k] -= h;
                    grad[k] = (radford_fwhm(up[0], up[1], up[2])
                        - radford_fwhm(dn[0], dn[1], dn[2]))
                        / (2.0 * h);
                }
                let mut var = 0.0;
                for (a, &i) in idx.iter().enumerate() {
                    for (b, &j) in idx.iter().enumerate() {
                        var += grad[a] * grad[b] * cov[i * n + j];
                    }
                }
                (fwhm, var.max(0.0).sqrt())
            }
        }
    }

    /// Total expected events `n_sig + n_bkg` and its error.
    pub fn total_event_count(self, params: &[f64], errors: &[f64]) -> (f64, f64) {
        let (s, b) = self.count_indices();
        (params[s] + params[b], errors[s].hypot(errors[b]))
    }

    /// Pearson χ² against `hist`, using exact bin integrals of the model.
    pub fn goodness_of_fit(self, hist: &Histogram, params: &[f64]) -> Result<GoodnessOfFit> {
        let expected = self.expected_counts(hist.edges(), params)?;
        let mut statistic = 0.0;
        let mut used = 0usize;
        for (&obs, &exp) in hist.counts().iter().zip(&expected) {
            if exp > 0.0 && exp.is_finite() {
                statistic += (obs - exp).powi(2) / exp;
                used += 1;
            }
        }
        Ok(GoodnessOfFit {
            statistic,
            dof: used as f64 - self.n_free() as f64,
            n_bins_used: used,
        })
    }
}

impl std::fmt::Display for ShapeModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A model evaluated at fixed parameters with its normalisations cached.
#[derive(Debug, Clone)]
pub struct Shape {
    n_sig: f64,
    mu: f64,
    sigma: f64,
    htail: f64,
    tau: f64,
    n_bkg: f64,
    hstep: f64,
    lo: f64,
    hi: f64,
    gauss_lo: f64,
    gauss_norm: f64,
    tail_lo: f64,
    tail_norm: f64,
    bkg_norm: f64,
}

impl Shape {
    fn new(model: ShapeModel, p: &[f64]) -> Result<Self> {
        model.check_len(p)?;
        let (n_sig, mu, sigma) = (p[0], p[1], p[2]);
        let (htail, tau, n_bkg, hstep, lo, hi) = match model {
            ShapeModel::GaussStep => (0.0, 1.0, p[3], p[4], p[5], p[6]),
            ShapeModel::Radford => (p[3], p[4], p[5], p[6], p[7], p[8]),
        };
        if p.iter().any(|v| !v.is_finite()) {
            return Err(Error::Computation(format!("non-finite {} parameters", model.name())));
        }
        if !(sigma > 0.0 && tau > 0.0 && lo < hi) {
            return Err(Error::Computation(format!(
                "{} outside its domain: sigma={sigma}, tau={tau}, range=({lo}, {hi})",
                model.name()
            )));
        }

        let gauss_lo = normal_cdf((lo - mu) / sigma);
        let gauss_norm = (normal_cdf((hi - mu) / sigma) - gauss_lo).max(f64::MIN_POSITIVE);
        let (tail_lo, tail_norm) = if htail != 0.0 {
            let t_lo = tail_cdf(lo - mu, sigma, tau);
            (t_lo, (tail_cdf(hi - mu, sigma, tau) - t_lo).max(f64::MIN_POSITIVE))
        } else {
            (0.0, 1.0)
        };
        let s2 = SQRT_2 * sigma;
        let bkg_norm = (hi - lo)
            + hstep * s2 * (erf_antiderivative((hi - mu) / s2) - erf_antiderivative((lo - mu) / s2));

        Ok(Self {
            n_sig,
            mu,
            sigma,
            htail,
            tau,
            n_bkg,
            hstep,
            lo,
            hi,
            gauss_lo,
            gauss_norm,
            tail_lo,
            tail_norm,
            bkg_norm: bkg_norm.max(f64::MIN_POSITIVE),
        })
    }

    /// Expected total events.
    pub fn n_total(&self) -> f64 {
        self.n_sig + self.n_bkg
    }

    /// Tail fraction (zero for tail-free models).
    pub fn htail(&self) -> f64 {
        self.htail
    }

    /// Normalised signal density.
    pub fn signal(&self, x: f64) -> f64 {
        if x < self.lo || x > self.hi {
            return 0.0;
        }
        let z = (x - self.mu) / self.sigma;
        let gauss = normal_pdf(z) / self.sigma / self.gauss_norm;
        if self.htail == 0.0 {
            return gauss;
        }
        let tail = tail_pdf(x - self.mu, self.sigma, self.tau) / self.tail_norm;
        (1.0 - self.htail) * gauss + self.htail * tail
    }

    /// Normalised background density.
    pub fn background(&self, x: f64) -> f64 {
        if x < self.lo || x > self.hi {
            return 0.0;
        }
        let u = (x - self.mu) / (SQRT_2 * self.sigma);
        (1.0 + self.hstep * error_function(u)) / self.bkg_norm
    }

    /// Extended density.
    pub fn density(&self, x: f64) -> f64 {
        self.n_sig * self.signal(x) + self.n_bkg * self.background(x)
    }

    /// Expected counts in `[x_lo, x]`.
    pub fn cdf(&self, x: f64) -> f64 {
        let x = x.clamp(self.lo, self.hi);
        let dx = x - self.mu;
        let gauss = (normal_cdf(dx / self.sigma) - self.gauss_lo) / self.gauss_norm;
        let signal = if self.htail == 0.0 {
            gauss
        } else {
            let tail = (tail_cdf(dx, self.sigma, self.tau) - self.tail_lo) / self.tail_norm;
            (1.0 - self.htail) * gauss + self.htail * tail
        };
        let s2 = SQRT_2 * self.sigma;
        let bkg = ((x - self.lo)
            + self.hstep
                * s2
                * (erf_antiderivative(dx / s2) - erf_antiderivative((self.lo - self.mu) / s2)))
            / self.bkg_norm;
        self.n_sig * signal + self.n_bkg * bkg
    }
}

/// Low-side exponentially modified Gaussian, unit area over the real line.
fn tail_pdf(dx: f64, sigma: f64, tau: f64) -> f64 {
    let (a, v) = tail_args(dx, sigma, tau);
    exp_erfc(a, v) / (2.0 * tau)
}

fn tail_cdf(dx: f64, sigma: f64, tau: f64) -> f64 {
    let (a, v) = tail_args(dx, sigma, tau);
    normal_cdf(dx / sigma) + 0.5 * exp_erfc(a, v)
}

fn tail_args(dx: f64, sigma: f64, tau: f64) -> (f64, f64) {
    let a = dx / tau + sigma * sigma / (2.0 * tau * tau);
    let v = dx / (SQRT_2 * sigma) + sigma / (SQRT_2 * tau);
    (a, v)
}

fn radford_signal(dx: f64, sigma: f64, htail: f64, tau: f64) -> f64 {
    let gauss = normal_pdf(dx / sigma) / sigma;
    (1.0 - htail) * gauss + htail * tail_pdf(dx, sigma, tau)
}

/// Full width at half maximum of the Gaussian-plus-tail signal.
fn radford_fwhm(sigma: f64, htail: f64, tau: f64) -> f64 {
    if !(sigma > 0.0 && tau > 0.0 && htail.is_finite()) {
        return f64::NAN;
    }
    let f = |x: f64| radford_signal(x, sigma, htail, tau);

    // Coarse grid for the mode, then golden-section refinement.
    let lo = -(5.0 * sigma + 5.0 * tau);
    let hi = sigma;
    let n = 400;
    let step = (hi - lo) / n as f64;
    let mut i_best = 0;
    let mut f_best = f64::NEG_INFINITY;
    for i in 0..=n {
        let v = f(lo + i as f64 * step);
        if v > f_best {
            f_best = v;
            i_best = i;
        }
    }
    let (mut a, mut b) = (lo + (i_best as f64 - 1.0) * step, lo + (i_best as f64 + 1.0) * step);
    let g = 0.618_033_988_749_895;
    for _ in 0..80 {
        let c = b - g * (b - a);
        let d = a + g * (b - a);
        if f(c) > f(d) {
            b = d;
        } else {
            a = c;
        }
    }
    let mode = 0.5 * (a + b);
    let half = 0.5 * f(mode);

    let crossing = |inside: f64, outside: f64| {
        let (mut i, mut o) = (inside, outside);
        for _ in 0..100 {
            let m = 0.5 * (i + o);
            if f(m) > half {
                i = m;
            } else {
                o = m;
            }
        }
        0.5 * (i + o)
    };
    let right = crossing(mode, mode + 10.0 * sigma);
    let left = crossing(mode, mode - 10.0 * sigma - 40.0 * tau);
    right - left
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn integrate(shape: &Shape, lo: f64, hi: f64, n: usize) -> f64 {
        // Simpson's rule
        let h = (hi - lo) / n as f64;
        let mut s = shape.density(lo) + shape.density(hi);
        for i in 1..n {
            let w = if i % 2 == 1 { 4.0 } else { 2.0 };
            s += w * shape.density(lo + i as f64 * h);
        }
        s * h / 3.0
    }

    #[test]
    fn test_gauss_step_normalisation() {
        let p = [1000.0, 50.0, 2.0, 300.0, -0.3, 30.0, 70.0];
        let shape = ShapeModel::GaussStep.shape(&p).unwrap();
        assert_relative_eq!(integrate(&shape, 30.0, 70.0, 4000), 1300.0, max_relative = 1e-6);
        assert_relative_eq!(shape.cdf(70.0), 1300.0, max_relative = 1e-12);
        assert_relative_eq!(shape.cdf(30.0), 0.0, epsilon = 1e-9);
    }

    #[test]
    fn test_radford_normalisation() {
        let p = [1000.0, 50.0, 1.5, 0.3, 2.0, 300.0, 0.2, 30.0, 70.0];
        let shape = ShapeModel::Radford.shape(&p).unwrap();
        assert_relative_eq!(integrate(&shape, 30.0, 70.0, 4000), 1300.0, max_relative = 1e-6);
        assert_relative_eq!(shape.cdf(70.0), 1300.0, max_relative = 1e-12);
    }

    #[test]
    fn test_cdf_derivative_matches_density() {
        let p = [800.0, 100.0, 1.2, 0.15, 0.9, 500.0, -0.4, 80.0, 120.0];
        let shape = ShapeModel::Radford.shape(&p).unwrap();
        for x in [85.0, 97.5, 99.0, 100.0, 101.3, 110.0] {
            let h = 1e-5;
            let d = (shape.cdf(x + h) - shape.cdf(x - h)) / (2.0 * h);
            assert_relative_eq!(d, shape.density(x), max_relative = 1e-5);
        }
    }

    #[test]
    fn test_expected_counts_sum_to_total() {
        let p = [1000.0, 50.0, 2.0, 300.0, 0.1, 30.0, 70.0];
        let edges: Vec<f64> = (0..=40).map(|i| 30.0 + i as f64).collect();
        let exp = ShapeModel::GaussStep.expected_counts(&edges, &p).unwrap();
        assert_relative_eq!(exp.iter().sum::<f64>(), 1300.0, max_relative = 1e-12);
        assert!(exp.iter().all(|&e| e > 0.0));
    }

    #[test]
    fn test_fwhm() {
        let n = ShapeModel::GaussStep.n_params();
        let mut cov = vec![0.0; n * n];
        cov[2 * n + 2] = 0.01;
        let (fwhm, err) = ShapeModel::GaussStep
            .fwhm_and_uncertainty(&[1.0, 0.0, 2.0, 1.0, 0.0, -10.0, 10.0], Some(&cov));
        assert_relative_eq!(fwhm, 2.0 * FWHM_PER_SIGMA);
        assert_relative_eq!(err, 0.1 * FWHM_PER_SIGMA);

        // No tail reduces to the Gaussian width; a tail widens the peak.
        assert_relative_eq!(radford_fwhm(2.0, 0.0, 1.0), 2.0 * FWHM_PER_SIGMA, max_relative = 1e-6);
        assert!(radford_fwhm(2.0, 0.3, 3.0) > 2.0 * FWHM_PER_SIGMA);
    }

    #[test]
    fn test_bounds_and_mask() {
        let p = [1.0, 50.0, 2.0, 0.2, 1.0, 1.0, 0.0, 30.0, 70.0];
        let b = ShapeModel::Radford.bounds(&p);
        assert_eq!(b[1], (30.0, 70.0));
        assert_eq!(b[4], (0.2, 20.0));
        assert_eq!(b[7], (30.0, 30.0));
        let mask = ShapeModel::Radford.fixed_mask();
        assert_eq!(mask.iter().filter(|f| **f).count(), 2);
        assert_eq!(ShapeModel::Radford.n_free(), 7);
        assert_eq!(ShapeModel::GaussStep.n_free(), 5);
    }

    #[test]
    fn test_guess_on_binned_peak() {
        let p = [5000.0, 50.0, 2.0, 2000.0, -0.2, 30.0, 70.0];
        let edges: Vec<f64> = (0..=80).map(|i| 30.0 + 0.5 * i as f64).collect();
        let counts = ShapeModel::GaussStep.expected_counts(&edges, &p).unwrap();
        let h = Histogram::with_poisson_variance(counts, edges).unwrap();
        let g = ShapeModel::GaussStep.guess(&h, (30.0, 70.0), None, &Minimizer::default()).unwrap();
        assert_relative_eq!(g[1], 50.0, epsilon = 0.3);
        assert_relative_eq!(g[2], 2.0, max_relative = 0.15);
        assert_relative_eq!(g[0] + g[3], 7000.0, max_relative = 1e-9);
        assert!(g[4] < 0.0);
        assert_eq!(&g[5..], &[30.0, 70.0]);

        let r = ShapeModel::Radford.guess(&h, (30.0, 70.0), None, &Minimizer::default()).unwrap();
        assert_eq!(r.len(), 9);
        assert_relative_eq!(r[3], 0.2);
    }

    #[test]
    fn test_pearson_gof_zero_on_expectation() {
        let p = [1000.0, 50.0, 2.0, 300.0, 0.0, 30.0, 70.0];
        let edges: Vec<f64> = (0..=40).map(|i| 30.0 + i as f64).collect();
        let counts = ShapeModel::GaussStep.expected_counts(&edges, &p).unwrap();
        let h = Histogram::with_poisson_variance(counts, edges).unwrap();
        let gof = ShapeModel::GaussStep.goodness_of_fit(&h, &p).unwrap();
        assert_relative_eq!(gof.statistic, 0.0, epsilon = 1e-18);
        assert_eq!(gof.n_bins_used, 40);
        assert_relative_eq!(gof.dof, 35.0);
    }

    #[test]
    fn test_invalid_parameters() {
        assert!(ShapeModel::GaussStep.shape(&[1.0, 0.0, -1.0, 1.0, 0.0, -1.0, 1.0]).is_err());
        assert!(ShapeModel::GaussStep.shape(&[1.0, 0.0, 1.0]).is_err());
    }
}
