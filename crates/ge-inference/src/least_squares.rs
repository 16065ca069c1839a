use crate::optimizer::ObjectiveFunction;
use ge_core::{Error, Result};

/// `χ²(p) = Σ ((y_i − model(x_i, p)) / σ_i)²`
pub struct WeightedLeastSquares<'a, F>
where
    F: Fn(f64, &[f64]) -> f64 + Send + Sync,
{
    x: &'a [f64],
    y: &'a [f64],
    sigma: &'a [f64],
    model: F,
}

impl<'a, F> WeightedLeastSquares<'a, F>
where
    F: Fn(f64, &[f64]) -> f64 + Send + Sync,
{
    /// Build the cost; all `sigma` must be finite and positive.
    pub fn new(x: &'a [f64], y: &'a [f64], sigma: &'a [f64], model: F) -> Result<Self> {
        if x.len() != y.len() || x.len() != sigma.len() {
            return Err(Error::Validation(format!(
                "least squares length mismatch: x={}, y={}, sigma={}",
                x.len(),
                y.len(),
                sigma.len()
            )));
        }
        if sigma.iter().any(|s| !(s.is_finite() && *s > 0.0)) {
            return Err(Error::Validation("least squares sigmas must be positive".to_string()));
        }
        Ok(Self { x, y, sigma, model })
    }

    /// Number of data points.
    pub fn n_points(&self) -> usize {
        self.x.len()
    }
}

impl<F> ObjectiveFunction for WeightedLeastSquares<'_, F>
where
    F: Fn(f64, &[f64]) -> f64 + Send + Sync,
{
    fn eval(&self, params: &[f64]) -> Result<f64> {
        let mut chi2 = 0.0;
        for i in 0..self.x.len() {
            let r = (self.y[i] - (self.model)(self.x[i], params)) / self.sigma[i];
            chi2 += r * r;
        }
        if chi2.is_nan() {
            return Err(Error::Computation(format!("chi2 is NaN at {params:?}")));
        }
        Ok(chi2)
    }
}
