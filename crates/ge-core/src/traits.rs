//! Core traits for gecal
//!
//! The optimizer in `ge-inference` only sees [`ObjectiveFunction`]; likelihoods and
//! least-squares costs built by the shape and calibration crates implement it.

use crate::Result;

/// Scalar objective to be minimised.
pub trait ObjectiveFunction: Send + Sync {
    /// Evaluate function at given parameters
    fn eval(&self, params: &[f64]) -> Result<f64>;

    /// Compute gradient at given parameters (numerical if not overridden)
    fn gradient(&self, params: &[f64]) -> Result<Vec<f64>> {
        let n = params.len();
        let mut grad = vec![0.0; n];
        let mut work = params.to_vec();

        for i in 0..n {
            let eps = 1e-7 * params[i].abs().max(1.0);

            work[i] = params[i] + eps;
            let f_plus = self.eval(&work)?;
            work[i] = params[i] - eps;
            let f_minus = self.eval(&work)?;
            work[i] = params[i];

            grad[i] = (f_plus - f_minus) / (2.0 * eps);
        }

        Ok(grad)
    }
}
