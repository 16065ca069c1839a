//! Optimization algorithms
//!
//! This module provides wrappers around argmin optimizers with a clean interface.

use argmin::core::{CostFunction, Executor, Gradient, State, TerminationReason, TerminationStatus};
use argmin::solver::linesearch::MoreThuenteLineSearch;
use argmin::solver::neldermead::NelderMead;
use argmin::solver::quasinewton::LBFGS;
use ge_core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

pub use ge_core::ObjectiveFunction;

/// Configuration for the L-BFGS-B and simplex optimizers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    /// Maximum number of L-BFGS iterations
    pub max_iter: u64,
    /// Convergence tolerance for gradient norm
    pub tol: f64,
    /// Number of corrections to approximate inverse Hessian
    pub m: usize,
    /// Maximum number of Nelder–Mead iterations per simplex pass
    pub simplex_max_iter: u64,
    /// Nelder–Mead tolerance on the standard deviation of vertex costs
    pub simplex_tol: f64,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self { max_iter: 1000, tol: 1e-6, m: 10, simplex_max_iter: 1000, simplex_tol: 1e-8 }
    }
}

/// Result of optimization
#[derive(Debug, Clone)]
pub struct OptimizationResult {
    /// Best-fit parameters
    pub parameters: Vec<f64>,
    /// Function value at minimum
    pub fval: f64,
    /// Number of iterations
    pub n_iter: u64,
    /// Number of objective (cost) evaluations.
    pub n_fev: usize,
    /// Number of gradient evaluations.
    pub n_gev: usize,
    /// Convergence status
    pub converged: bool,
    /// Termination message
    pub message: String,
}

impl fmt::Display for OptimizationResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "OptimizationResult(fval={:.6}, n_iter={}, n_fev={}, n_gev={}, converged={})",
            self.fval, self.n_iter, self.n_fev, self.n_gev, self.converged
        )
    }
}

/// Wrapper to make ObjectiveFunction compatible with argmin
struct ArgminProblem<'a> {
    objective: &'a dyn ObjectiveFunction,
    bounds: &'a [(f64, f64)],
    counts: Arc<FuncCounts>,
}

pub(crate) fn clamp_params(params: &[f64], bounds: &[(f64, f64)]) -> Vec<f64> {
    params.iter().zip(bounds.iter()).map(|(&v, &(lo, hi))| v.clamp(lo, hi)).collect()
}

/// Evaluation counters plus the best point seen, so an aborted run still
/// yields its best evaluation.
#[derive(Default)]
struct FuncCounts {
    cost: AtomicUsize,
    grad: AtomicUsize,
    best: Mutex<Option<(f64, Vec<f64>)>>,
}

impl FuncCounts {
    fn observe(&self, params: &[f64], value: f64) {
        if !value.is_finite() {
            return;
        }
        let mut best = self.best.lock().unwrap_or_else(|e| e.into_inner());
        if best.as_ref().is_none_or(|(b, _)| value < *b) {
            *best = Some((value, params.to_vec()));
        }
    }

    fn fallback(&self, message: String) -> Result<OptimizationResult> {
        let best = self.best.lock().unwrap_or_else(|e| e.into_inner()).clone();
        match best {
            Some((fval, parameters)) => Ok(OptimizationResult {
                parameters,
                fval,
                n_iter: 0,
                n_fev: self.cost.load(Ordering::Relaxed),
                n_gev: self.grad.load(Ordering::Relaxed),
                converged: false,
                message,
            }),
            None => Err(Error::Computation(message)),
        }
    }
}

impl<'a> CostFunction for ArgminProblem<'a> {
    type Param = Vec<f64>;
    type Output = f64;

    fn cost(&self, params: &Self::Param) -> std::result::Result<Self::Output, argmin::core::Error> {
        self.counts.cost.fetch_add(1, Ordering::Relaxed);
        let clamped = clamp_params(params, self.bounds);
        let value =
            self.objective.eval(&clamped).map_err(|e| argmin::core::Error::msg(e.to_string()))?;
        self.counts.observe(&clamped, value);
        Ok(value)
    }
}

impl<'a> Gradient for ArgminProblem<'a> {
    type Param = Vec<f64>;
    type Gradient = Vec<f64>;

    fn gradient(
        &self,
        params: &Self::Param,
    ) -> std::result::Result<Self::Gradient, argmin::core::Error> {
        self.counts.grad.fetch_add(1, Ordering::Relaxed);
        let clamped = clamp_params(params, self.bounds);
        let mut g = self
            .objective
            .gradient(&clamped)
            .map_err(|e| argmin::core::Error::msg(e.to_string()))?;

        // At a bound, drop gradient components that point further outside so the
        // line search does not keep stepping into the flat clamped region.
        const EPS: f64 = 1e-12;
        for (i, (&x, &(lo, hi))) in clamped.iter().zip(self.bounds.iter()).enumerate() {
            if x <= lo + EPS && g[i] > 0.0 {
                g[i] = 0.0;
            }
            if x >= hi - EPS && g[i] < 0.0 {
                g[i] = 0.0;
            }
        }

        Ok(g)
    }
}

fn check_lengths(init_params: &[f64], bounds: &[(f64, f64)]) -> Result<()> {
    if init_params.len() != bounds.len() {
        return Err(Error::Validation(format!(
            "Parameter and bounds length mismatch: {} != {}",
            init_params.len(),
            bounds.len()
        )));
    }
    if init_params.is_empty() {
        return Err(Error::Validation("Nothing to optimize: no free parameters".to_string()));
    }
    Ok(())
}

fn summarize<S>(state: &S, bounds: &[(f64, f64)], counts: &FuncCounts) -> Result<OptimizationResult>
where
    S: State<Param = Vec<f64>, Float = f64>,
{
    let best_params_unclamped = state
        .get_best_param()
        .ok_or_else(|| Error::Computation("No best parameters found".to_string()))?
        .clone();
    let parameters = clamp_params(&best_params_unclamped, bounds);
    let termination = state.get_termination_status();
    let converged = matches!(
        termination,
        TerminationStatus::Terminated(TerminationReason::SolverConverged)
            | TerminationStatus::Terminated(TerminationReason::TargetCostReached)
    );
    Ok(OptimizationResult {
        parameters,
        fval: state.get_best_cost(),
        n_iter: state.get_iter(),
        n_fev: counts.cost.load(Ordering::Relaxed),
        n_gev: counts.grad.load(Ordering::Relaxed),
        converged,
        message: termination.to_string(),
    })
}

/// L-BFGS-B optimizer with box constraints
pub struct LbfgsbOptimizer {
    config: OptimizerConfig,
}

impl LbfgsbOptimizer {
    /// Create new L-BFGS-B optimizer with given configuration
    pub fn new(config: OptimizerConfig) -> Self {
        Self { config }
    }

    /// Minimize objective function with bounds
    ///
    /// # Arguments
    /// * `objective` - Objective function to minimize
    /// * `init_params` - Initial parameter values
    /// * `bounds` - Parameter bounds as (lower, upper) for each parameter
    ///
    /// # Returns
    /// Optimization result with best-fit parameters. If argmin aborts (typically a
    /// line search failure close to the minimum), the best point evaluated so far
    /// is returned with `converged = false`.
    pub fn minimize(
        &self,
        objective: &dyn ObjectiveFunction,
        init_params: &[f64],
        bounds: &[(f64, f64)],
    ) -> Result<OptimizationResult> {
        check_lengths(init_params, bounds)?;

        let init_clamped = clamp_params(init_params, bounds);
        let counts = Arc::new(FuncCounts::default());
        let problem = ArgminProblem { objective, bounds, counts: counts.clone() };

        let linesearch = MoreThuenteLineSearch::new();
        // argmin's default cost tolerance is ~EPS, far too strict for likelihood scales.
        let tol_cost =
            if self.config.tol == 0.0 { 0.0 } else { (0.1 * self.config.tol).max(1e-12) };
        let solver = LBFGS::new(linesearch, self.config.m)
            .with_tolerance_grad(self.config.tol)
            .map_err(|e| Error::Validation(format!("Invalid optimizer configuration (tol): {e}")))?;
        let solver = solver.with_tolerance_cost(tol_cost).map_err(|e| {
            Error::Validation(format!("Invalid optimizer configuration (tol_cost): {e}"))
        })?;

        let res = match Executor::new(problem, solver)
            .configure(|state| state.param(init_clamped).max_iters(self.config.max_iter))
            .run()
        {
            Ok(res) => res,
            Err(e) => return counts.fallback(format!("L-BFGS terminated early: {e}")),
        };

        summarize(res.state(), bounds, &counts)
    }
}

impl Default for LbfgsbOptimizer {
    fn default() -> Self {
        Self::new(OptimizerConfig::default())
    }
}

/// Derivative-free Nelder–Mead optimizer; bounds are enforced by clamping.
pub struct SimplexOptimizer {
    config: OptimizerConfig,
}

impl SimplexOptimizer {
    /// Create new simplex optimizer with given configuration
    pub fn new(config: OptimizerConfig) -> Self {
        Self { config }
    }

    /// Minimize from `init_params`, building the initial simplex from `steps`.
    ///
    /// Vertex `i` moves parameter `i` by `steps[i]`, towards the interior when the
    /// upper bound would be crossed.
    pub fn minimize(
        &self,
        objective: &dyn ObjectiveFunction,
        init_params: &[f64],
        bounds: &[(f64, f64)],
        steps: &[f64],
    ) -> Result<OptimizationResult> {
        check_lengths(init_params, bounds)?;
        if steps.len() != init_params.len() {
            return Err(Error::Validation(format!(
                "Parameter and step length mismatch: {} != {}",
                init_params.len(),
                steps.len()
            )));
        }

        let init_clamped = clamp_params(init_params, bounds);
        let mut vertices = vec![init_clamped.clone()];
        for (i, (&step, &(lo, hi))) in steps.iter().zip(bounds.iter()).enumerate() {
            let mut v = init_clamped.clone();
            v[i] = if v[i] + step <= hi { v[i] + step } else { (v[i] - step).max(lo) };
            vertices.push(v);
        }

        let counts = Arc::new(FuncCounts::default());
        let problem = ArgminProblem { objective, bounds, counts: counts.clone() };
        let solver = NelderMead::new(vertices)
            .with_sd_tolerance(self.config.simplex_tol)
            .map_err(|e| Error::Validation(format!("Invalid simplex configuration: {e}")))?;

        let res = match Executor::new(problem, solver)
            .configure(|state| state.max_iters(self.config.simplex_max_iter))
            .run()
        {
            Ok(res) => res,
            Err(e) => return counts.fallback(format!("simplex terminated early: {e}")),
        };

        summarize(res.state(), bounds, &counts)
    }
}

impl Default for SimplexOptimizer {
    fn default() -> Self {
        Self::new(OptimizerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    // f(x, y) = (x - 2)^2 + (y - 3)^2, minimum at (2, 3)
    struct QuadraticFunction;

    impl ObjectiveFunction for QuadraticFunction {
        fn eval(&self, params: &[f64]) -> Result<f64> {
            Ok((params[0] - 2.0).powi(2) + (params[1] - 3.0).powi(2))
        }

        fn gradient(&self, params: &[f64]) -> Result<Vec<f64>> {
            Ok(vec![2.0 * (params[0] - 2.0), 2.0 * (params[1] - 3.0)])
        }
    }

    #[test]
    fn test_optimizer_quadratic() {
        let optimizer = LbfgsbOptimizer::default();
        let result =
            optimizer.minimize(&QuadraticFunction, &[0.0, 0.0], &[(-10.0, 10.0), (-10.0, 10.0)]);
        let result = result.unwrap();

        assert!(result.converged, "Optimizer should converge: {}", result.message);
        assert_relative_eq!(result.parameters[0], 2.0, epsilon = 1e-4);
        assert_relative_eq!(result.parameters[1], 3.0, epsilon = 1e-4);
        assert_relative_eq!(result.fval, 0.0, epsilon = 1e-6);
    }

    #[test]
    fn test_optimizer_with_bounds() {
        // Constrained optimum of the quadratic in x in [3, 5], y in [1, 2] is (3, 2).
        let optimizer = LbfgsbOptimizer::default();
        let result =
            optimizer.minimize(&QuadraticFunction, &[4.0, 1.5], &[(3.0, 5.0), (1.0, 2.0)]).unwrap();

        assert_relative_eq!(result.parameters[0], 3.0, epsilon = 1e-4);
        assert_relative_eq!(result.parameters[1], 2.0, epsilon = 1e-4);
    }

    // Rosenbrock, minimum at (1, 1)
    struct RosenbrockFunction;

    impl ObjectiveFunction for RosenbrockFunction {
        fn eval(&self, params: &[f64]) -> Result<f64> {
            let (x, y) = (params[0], params[1]);
            Ok((1.0 - x).powi(2) + 100.0 * (y - x * x).powi(2))
        }
    }

    #[test]
    fn test_simplex_rosenbrock() {
        let config = OptimizerConfig { simplex_max_iter: 5000, simplex_tol: 1e-12, ..Default::default() };
        let optimizer = SimplexOptimizer::new(config);
        let result = optimizer
            .minimize(&RosenbrockFunction, &[-1.0, 1.5], &[(-5.0, 5.0), (-5.0, 5.0)], &[0.5, 0.5])
            .unwrap();

        assert_relative_eq!(result.parameters[0], 1.0, epsilon = 1e-2);
        assert_relative_eq!(result.parameters[1], 1.0, epsilon = 2e-2);
        assert!(result.fval < 1e-3);
    }

    #[test]
    fn test_simplex_respects_bounds() {
        let optimizer = SimplexOptimizer::default();
        let result = optimizer
            .minimize(&QuadraticFunction, &[4.0, 1.5], &[(3.0, 5.0), (1.0, 2.0)], &[0.5, 0.2])
            .unwrap();
        assert!(result.parameters[0] >= 3.0 && result.parameters[1] <= 2.0);
        assert_relative_eq!(result.fval, 2.0, epsilon = 1e-4);
    }

    struct FailsAwayFromOrigin;

    impl ObjectiveFunction for FailsAwayFromOrigin {
        fn eval(&self, params: &[f64]) -> Result<f64> {
            if params[0].abs() > 0.5 {
                return Err(Error::Computation("outside support".to_string()));
            }
            Ok(params[0] * params[0])
        }
    }

    #[test]
    fn test_aborted_run_returns_best_point() {
        let optimizer = SimplexOptimizer::default();
        let result = optimizer.minimize(&FailsAwayFromOrigin, &[0.1], &[(-10.0, 10.0)], &[2.0]);
        let result = result.unwrap();
        assert!(!result.converged);
        assert_relative_eq!(result.parameters[0], 0.1, epsilon = 1e-12);
        assert!(result.message.contains("terminated early"));
    }

    #[test]
    fn test_length_mismatch_is_validation_error() {
        let err = LbfgsbOptimizer::default().minimize(&QuadraticFunction, &[0.0], &[]).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }
}
