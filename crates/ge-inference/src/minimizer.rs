//! Masked minimisation with covariance and EDM estimation.
//!
//! [`Minimizer::minimize`] optimises only the free parameters, optionally runs one
//! or more Nelder–Mead passes before L-BFGS, then polishes the optimum with damped
//! Newton steps on a finite-difference Hessian. The inverse Hessian gives the
//! covariance (scaled by the objective's [`ErrorDef`]) and the estimated distance
//! to minimum `EDM = ½ gᵀ H⁻¹ g`, which decides convergence.

use crate::optimizer::{
    LbfgsbOptimizer, ObjectiveFunction, OptimizerConfig, SimplexOptimizer, clamp_params,
};
use ge_core::{Error, FitResult, Result};
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Objective normalisation: the objective change that defines a 1σ interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorDef {
    /// Negative log-likelihood (Δ = 0.5)
    Likelihood,
    /// Chi-square / weighted least squares (Δ = 1)
    LeastSquares,
}

impl ErrorDef {
    /// Numerical value of the 1σ objective change.
    pub fn value(self) -> f64 {
        match self {
            ErrorDef::Likelihood => 0.5,
            ErrorDef::LeastSquares => 1.0,
        }
    }
}

/// Sequence of optimizers run from the initial guess.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Strategy {
    /// Gradient minimisation only
    Gradient,
    /// One Nelder–Mead pass, then gradient minimisation
    SimplexThenGradient,
    /// Two Nelder–Mead passes, then gradient minimisation
    IntensifiedSimplex,
}

impl Strategy {
    fn simplex_passes(self) -> usize {
        match self {
            Strategy::Gradient => 0,
            Strategy::SimplexThenGradient => 1,
            Strategy::IntensifiedSimplex => 2,
        }
    }
}

/// Minimizer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MinimizerConfig {
    /// Settings shared by the L-BFGS and simplex phases
    pub optimizer: OptimizerConfig,
    /// Convergence requires `EDM < edm_tolerance * errordef`
    pub edm_tolerance: f64,
    /// Maximum number of Newton polishing steps after L-BFGS
    pub newton_steps: usize,
}

impl Default for MinimizerConfig {
    fn default() -> Self {
        Self { optimizer: OptimizerConfig::default(), edm_tolerance: 2e-3, newton_steps: 10 }
    }
}

/// Objective restricted to the free parameters, with bound-aware differences.
struct Reduced<'a> {
    inner: &'a dyn ObjectiveFunction,
    base: Vec<f64>,
    free: Vec<usize>,
    bounds: Vec<(f64, f64)>,
    evals: AtomicUsize,
}

impl Reduced<'_> {
    fn expand(&self, x: &[f64]) -> Vec<f64> {
        let mut full = self.base.clone();
        for (k, &i) in self.free.iter().enumerate() {
            full[i] = x[k];
        }
        full
    }

    /// Objective value, mapping evaluation errors to `+inf`.
    fn value(&self, x: &[f64]) -> f64 {
        self.eval(x).unwrap_or(f64::INFINITY)
    }
}

impl ObjectiveFunction for Reduced<'_> {
    fn eval(&self, params: &[f64]) -> Result<f64> {
        self.evals.fetch_add(1, Ordering::Relaxed);
        self.inner.eval(&self.expand(params))
    }

    fn gradient(&self, params: &[f64]) -> Result<Vec<f64>> {
        let mut grad = vec![0.0; params.len()];
        let mut work = params.to_vec();
        let f0 = self.eval(params)?;
        for i in 0..params.len() {
            let eps = 1e-7 * params[i].abs().max(1.0);
            let (lo, hi) = self.bounds[i];
            let up = params[i] + eps <= hi;
            let down = params[i] - eps >= lo;
            grad[i] = match (up, down) {
                (true, true) => {
                    work[i] = params[i] + eps;
                    let fp = self.eval(&work)?;
                    work[i] = params[i] - eps;
                    let fm = self.eval(&work)?;
                    (fp - fm) / (2.0 * eps)
                }
                (true, false) => {
                    work[i] = params[i] + eps;
                    (self.eval(&work)? - f0) / eps
                }
                (false, true) => {
                    work[i] = params[i] - eps;
                    (f0 - self.eval(&work)?) / eps
                }
                (false, false) => 0.0,
            };
            work[i] = params[i];
        }
        Ok(grad)
    }
}

/// Bounded minimiser with covariance estimation.
pub struct Minimizer {
    config: MinimizerConfig,
}

struct Polished {
    x: Vec<f64>,
    fval: f64,
    covariance: Option<DMatrix<f64>>,
    edm: f64,
}

impl Minimizer {
    /// Create a minimizer with the given configuration.
    pub fn new(config: MinimizerConfig) -> Self {
        Self { config }
    }

    /// Configuration in use.
    pub fn config(&self) -> &MinimizerConfig {
        &self.config
    }

    /// Minimise `objective` over the parameters not marked in `fixed`.
    ///
    /// Fixed parameters keep their `init` value and get zero uncertainty and zero
    /// covariance rows. The returned covariance is `2·errordef·H⁻¹` over the free
    /// block; `converged` requires an invertible Hessian and a small EDM.
    pub fn minimize(
        &self,
        objective: &dyn ObjectiveFunction,
        init: &[f64],
        bounds: &[(f64, f64)],
        fixed: &[bool],
        errordef: ErrorDef,
        strategy: Strategy,
    ) -> Result<FitResult> {
        let n = init.len();
        if bounds.len() != n || fixed.len() != n {
            return Err(Error::Validation(format!(
                "minimizer expects {n} bounds and fixed flags, got {} and {}",
                bounds.len(),
                fixed.len()
            )));
        }
        if let Some((i, _)) =
            bounds.iter().enumerate().find(|(_, (lo, hi))| lo.is_nan() || hi.is_nan() || lo > hi)
        {
            return Err(Error::Validation(format!("invalid bounds for parameter {i}")));
        }
        if init.iter().any(|v| !v.is_finite()) {
            return Err(Error::Validation(format!("non-finite initial parameters: {init:?}")));
        }

        let start = clamp_params(init, bounds);
        let free: Vec<usize> = (0..n).filter(|&i| !fixed[i]).collect();
        if free.is_empty() {
            let fval = objective.eval(&start)?;
            return Ok(FitResult::with_covariance(
                start,
                vec![0.0; n],
                vec![0.0; n * n],
                fval,
                fval.is_finite(),
                1,
            )
            .with_edm(0.0));
        }

        let reduced = Reduced {
            inner: objective,
            base: start.clone(),
            bounds: free.iter().map(|&i| bounds[i]).collect(),
            free,
            evals: AtomicUsize::new(0),
        };
        let rb = reduced.bounds.clone();
        let mut x: Vec<f64> = reduced.free.iter().map(|&i| start[i]).collect();
        let mut fx = reduced.value(&x);

        let simplex = SimplexOptimizer::new(self.config.optimizer.clone());
        for pass in 0..strategy.simplex_passes() {
            let steps = initial_steps(&x, &rb);
            match simplex.minimize(&reduced, &x, &rb, &steps) {
                Ok(r) if r.fval.is_finite() && !(r.fval > fx) => {
                    x = r.parameters;
                    fx = r.fval;
                }
                Ok(r) => log::debug!("simplex pass {pass} did not improve: {r}"),
                Err(e) => log::debug!("simplex pass {pass} failed: {e}"),
            }
        }

        let lbfgs = LbfgsbOptimizer::new(self.config.optimizer.clone());
        match lbfgs.minimize(&reduced, &x, &rb) {
            Ok(r) if r.fval.is_finite() && !(r.fval > fx) => {
                if !r.converged {
                    log::debug!("L-BFGS stopped without convergence: {}", r.message);
                }
                x = r.parameters;
            }
            Ok(r) => log::debug!("L-BFGS did not improve: {r}"),
            Err(e) => log::debug!("L-BFGS failed: {e}"),
        }

        let polished = self.polish(&reduced, x, &rb)?;
        let edm_max = self.config.edm_tolerance * errordef.value();
        let converged =
            polished.covariance.is_some() && polished.edm.is_finite() && polished.edm < edm_max;

        let parameters = reduced.expand(&polished.x);
        let n_evaluations = reduced.evals.load(Ordering::Relaxed);
        let result = match &polished.covariance {
            Some(cov_free) => {
                let scale = 2.0 * errordef.value();
                let mut cov = vec![0.0; n * n];
                for (a, &i) in reduced.free.iter().enumerate() {
                    for (b, &j) in reduced.free.iter().enumerate() {
                        cov[i * n + j] = scale * cov_free[(a, b)];
                    }
                }
                let uncertainties = (0..n).map(|i| cov[i * n + i].max(0.0).sqrt()).collect();
                FitResult::with_covariance(
                    parameters,
                    uncertainties,
                    cov,
                    polished.fval,
                    converged,
                    n_evaluations,
                )
            }
            None => {
                log::warn!("Hessian inversion failed; covariance unavailable");
                let mut uncertainties = vec![0.0; n];
                for &i in &reduced.free {
                    uncertainties[i] = f64::NAN;
                }
                FitResult::new(parameters, uncertainties, polished.fval, false, n_evaluations)
            }
        };
        Ok(result.with_edm(polished.edm))
    }

    /// Damped Newton iterations until the EDM is below tolerance.
    fn polish(&self, obj: &Reduced<'_>, mut x: Vec<f64>, bounds: &[(f64, f64)]) -> Result<Polished> {
        let mut fval = obj.eval(&x)?;
        if !fval.is_finite() {
            return Err(Error::Computation(format!("objective is not finite at {x:?}")));
        }
        let edm_target = 1e-6 * self.config.edm_tolerance;

        let mut step = 0;
        loop {
            let g = projected(&obj.gradient(&x)?, &x, bounds);
            let h = hessian(obj, &x, bounds)?;
            let covariance = invert_hessian(&h);
            let edm = match &covariance {
                Some(c) => {
                    let gv = DVector::from_column_slice(&g);
                    0.5 * gv.dot(&(c * &gv))
                }
                None => f64::INFINITY,
            };

            let done = edm < edm_target || step >= self.config.newton_steps;
            let Some(c) = covariance.as_ref().filter(|_| !done) else {
                return Ok(Polished { x, fval, covariance, edm });
            };

            let delta = c * DVector::from_column_slice(&g);
            let mut t = 1.0;
            let mut accepted = false;
            for _ in 0..10 {
                let cand: Vec<f64> = x
                    .iter()
                    .zip(delta.iter())
                    .zip(bounds.iter())
                    .map(|((&xi, &di), &(lo, hi))| (xi - t * di).clamp(lo, hi))
                    .collect();
                let fc = obj.value(&cand);
                if fc.is_finite() && fc < fval {
                    x = cand;
                    fval = fc;
                    accepted = true;
                    break;
                }
                t *= 0.5;
            }
            if !accepted {
                return Ok(Polished { x, fval, covariance, edm });
            }
            step += 1;
        }
    }
}

impl Default for Minimizer {
    fn default() -> Self {
        Self::new(MinimizerConfig::default())
    }
}

/// Initial simplex steps: 10% of the value, capped at 5% of a finite bound interval.
fn initial_steps(x: &[f64], bounds: &[(f64, f64)]) -> Vec<f64> {
    x.iter()
        .zip(bounds.iter())
        .map(|(&v, &(lo, hi))| {
            let mut s = 0.1 * v.abs().max(1e-2);
            let width = hi - lo;
            if width.is_finite() && width > 0.0 {
                s = s.min(0.05 * width);
            }
            s
        })
        .collect()
}

/// Zero gradient components that push a parameter sitting on a bound further out.
fn projected(g: &[f64], x: &[f64], bounds: &[(f64, f64)]) -> Vec<f64> {
    g.iter()
        .zip(x.iter())
        .zip(bounds.iter())
        .map(|((&gi, &xi), &(lo, hi))| {
            let scale = 1e-9 * xi.abs().max(1.0);
            if (xi <= lo + scale && gi > 0.0) || (xi >= hi - scale && gi < 0.0) { 0.0 } else { gi }
        })
        .collect()
}

/// Hessian from differences of the numerical gradient, one-sided next to bounds.
fn hessian(obj: &Reduced<'_>, x: &[f64], bounds: &[(f64, f64)]) -> Result<DMatrix<f64>> {
    let n = x.len();
    let mut h = DMatrix::zeros(n, n);
    let mut work = x.to_vec();
    let g0 = obj.gradient(x)?;

    for j in 0..n {
        let eps = 1e-4 * x[j].abs().max(1.0);
        let (lo, hi) = bounds[j];
        let up = x[j] + eps <= hi;
        let down = x[j] - eps >= lo;

        let column: Vec<f64> = match (up, down) {
            (true, true) => {
                work[j] = x[j] + eps;
                let gp = obj.gradient(&work)?;
                work[j] = x[j] - eps;
                let gm = obj.gradient(&work)?;
                gp.iter().zip(gm.iter()).map(|(p, m)| (p - m) / (2.0 * eps)).collect()
            }
            (true, false) => {
                work[j] = x[j] + eps;
                let gp = obj.gradient(&work)?;
                gp.iter().zip(g0.iter()).map(|(p, z)| (p - z) / eps).collect()
            }
            (false, true) => {
                work[j] = x[j] - eps;
                let gm = obj.gradient(&work)?;
                g0.iter().zip(gm.iter()).map(|(z, m)| (z - m) / eps).collect()
            }
            (false, false) => {
                let mut c = vec![0.0; n];
                c[j] = 1.0;
                c
            }
        };
        work[j] = x[j];
        for i in 0..n {
            h[(i, j)] = column[i];
        }
    }

    let h = (&h + h.transpose()) * 0.5;
    if h.iter().any(|v| !v.is_finite()) {
        return Err(Error::Computation("Hessian has non-finite entries".to_string()));
    }
    Ok(h)
}

/// Invert a Hessian, damping the diagonal until Cholesky succeeds.
fn invert_hessian(hessian: &DMatrix<f64>) -> Option<DMatrix<f64>> {
    // Work on the unit-diagonal form so parameters of very different scale
    // (event counts vs. widths) see the same relative damping.
    let n = hessian.nrows();
    let scale: Vec<f64> = (0..n)
        .map(|i| {
            let d = hessian[(i, i)];
            if d.is_finite() && d > 0.0 { 1.0 / d.sqrt() } else { 1.0 }
        })
        .collect();
    let scaled = DMatrix::from_fn(n, n, |i, j| hessian[(i, j)] * scale[i] * scale[j]);
    let identity = DMatrix::identity(n, n);

    let mut h_damped = scaled;
    let mut damping = 0.0_f64;
    let max_attempts = 10;
    let mut inverse = None;

    for attempt in 0..max_attempts {
        if let Some(chol) = nalgebra::linalg::Cholesky::new(h_damped.clone()) {
            inverse = Some(chol.solve(&identity));
            break;
        }

        if attempt + 1 == max_attempts {
            break;
        }

        // Increase diagonal damping geometrically.
        let next_damping = if damping == 0.0 { 1e-9 } else { damping * 10.0 };
        let add = next_damping - damping;
        for i in 0..n {
            h_damped[(i, i)] += add;
        }
        damping = next_damping;
    }

    let inverse = match inverse {
        Some(inv) => inv,
        None => h_damped.lu().try_inverse()?,
    };
    let cov = DMatrix::from_fn(n, n, |i, j| inverse[(i, j)] * scale[i] * scale[j]);
    for i in 0..n {
        let v = cov[(i, i)];
        if !(v.is_finite() && v > 0.0) {
            return None;
        }
    }
    Some(cov)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use rand_distr::{Distribution, Normal};

    /// Gaussian NLL in (mu, sigma) for a fixed sample.
    struct GaussNll {
        data: Vec<f64>,
    }

    impl ObjectiveFunction for GaussNll {
        fn eval(&self, p: &[f64]) -> Result<f64> {
            let (mu, sigma) = (p[0], p[1]);
            if sigma <= 0.0 {
                return Err(Error::Computation("sigma <= 0".to_string()));
            }
            let n = self.data.len() as f64;
            let ss: f64 = self.data.iter().map(|x| (x - mu).powi(2)).sum();
            Ok(n * sigma.ln() + ss / (2.0 * sigma * sigma))
        }
    }

    fn sample(n: usize, seed: u64) -> Vec<f64> {
        let mut rng = StdRng::seed_from_u64(seed);
        let normal = Normal::new(10.0, 2.0).unwrap();
        (0..n).map(|_| normal.sample(&mut rng)).collect()
    }

    #[test]
    fn test_gaussian_mle_errors_match_analytic() {
        let data = sample(4000, 7);
        let n = data.len() as f64;
        let mean = data.iter().sum::<f64>() / n;
        let sd = (data.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n).sqrt();

        let obj = GaussNll { data };
        let fit = Minimizer::default()
            .minimize(
                &obj,
                &[8.0, 3.0],
                &[(0.0, 20.0), (0.1, 10.0)],
                &[false, false],
                ErrorDef::Likelihood,
                Strategy::Gradient,
            )
            .unwrap();

        assert!(fit.converged, "edm = {}", fit.edm);
        assert_relative_eq!(fit.parameters[0], mean, epsilon = 1e-4);
        assert_relative_eq!(fit.parameters[1], sd, epsilon = 1e-4);
        assert_relative_eq!(fit.uncertainties[0], sd / n.sqrt(), max_relative = 1e-2);
        assert_relative_eq!(fit.uncertainties[1], sd / (2.0 * n).sqrt(), max_relative = 1e-2);
    }

    #[test]
    fn test_fixed_parameter_is_untouched() {
        let obj = GaussNll { data: sample(500, 11) };
        let fit = Minimizer::default()
            .minimize(
                &obj,
                &[9.0, 2.5],
                &[(0.0, 20.0), (0.1, 10.0)],
                &[false, true],
                ErrorDef::Likelihood,
                Strategy::SimplexThenGradient,
            )
            .unwrap();
        assert_eq!(fit.parameters[1], 2.5);
        assert_eq!(fit.uncertainties[1], 0.0);
        assert_eq!(fit.covariance_at(0, 1), Some(0.0));
        assert!(fit.uncertainties[0] > 0.0);
    }

    struct Bowl;

    impl ObjectiveFunction for Bowl {
        fn eval(&self, p: &[f64]) -> Result<f64> {
            Ok((p[0] + 1.0).powi(2) + 4.0 * (p[1] - 0.5).powi(2))
        }
    }

    #[test]
    fn test_minimum_on_bound_converges() {
        let fit = Minimizer::default()
            .minimize(
                &Bowl,
                &[2.0, 0.0],
                &[(0.0, 5.0), (-1.0, 1.0)],
                &[false, false],
                ErrorDef::LeastSquares,
                Strategy::IntensifiedSimplex,
            )
            .unwrap();
        assert_relative_eq!(fit.parameters[0], 0.0, epsilon = 1e-6);
        assert_relative_eq!(fit.parameters[1], 0.5, epsilon = 1e-5);
        assert!(fit.converged);
        // chi2 Hessian in p1 is 8, covariance = 2 * 1 / 8
        assert_relative_eq!(fit.uncertainties[1], 0.5, max_relative = 1e-3);
    }

    #[test]
    fn test_all_fixed_returns_objective() {
        let fit = Minimizer::default()
            .minimize(
                &Bowl,
                &[0.0, 0.0],
                &[(-5.0, 5.0), (-5.0, 5.0)],
                &[true, true],
                ErrorDef::LeastSquares,
                Strategy::Gradient,
            )
            .unwrap();
        assert_relative_eq!(fit.fval, 2.0);
        assert!(fit.converged);
    }

    #[test]
    fn test_rejects_inverted_bounds() {
        let err = Minimizer::default()
            .minimize(&Bowl, &[0.0, 0.0], &[(1.0, -1.0), (0.0, 1.0)], &[false, false],
                ErrorDef::LeastSquares, Strategy::Gradient)
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }
}
