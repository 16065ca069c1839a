//! Calibration polynomials.
//!
//! Coefficients are stored highest degree first (`c[0] x^d + ... + c[d]`). A pure
//! scale through the origin is the degree-one polynomial `[scale, 0]`.

use crate::{Error, Result};
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

/// Polynomial with coefficients ordered highest degree first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Polynomial {
    coefficients: Vec<f64>,
}

impl Polynomial {
    /// Create a polynomial; an empty coefficient list is the zero polynomial.
    pub fn new(coefficients: Vec<f64>) -> Self {
        if coefficients.is_empty() {
            return Self { coefficients: vec![0.0] };
        }
        Self { coefficients }
    }

    /// `y = scale * x`, stored as `[scale, 0]`.
    pub fn scale(scale: f64) -> Self {
        Self { coefficients: vec![scale, 0.0] }
    }

    /// Coefficients, highest degree first.
    pub fn coefficients(&self) -> &[f64] {
        &self.coefficients
    }

    /// Degree (length of the coefficient list minus one).
    pub fn degree(&self) -> usize {
        self.coefficients.len() - 1
    }

    /// Coefficient of `x^1` (0 for constants).
    pub fn linear_coefficient(&self) -> f64 {
        let n = self.coefficients.len();
        if n < 2 { 0.0 } else { self.coefficients[n - 2] }
    }

    /// Horner evaluation.
    #[inline]
    pub fn eval(&self, x: f64) -> f64 {
        self.coefficients.iter().fold(0.0, |acc, &c| acc * x + c)
    }

    /// Evaluate at every point of `xs`.
    pub fn eval_many(&self, xs: &[f64]) -> Vec<f64> {
        xs.iter().map(|&x| self.eval(x)).collect()
    }

    /// First derivative.
    pub fn derivative(&self) -> Polynomial {
        let d = self.degree();
        if d == 0 {
            return Polynomial::new(vec![0.0]);
        }
        let coefficients =
            self.coefficients[..d].iter().enumerate().map(|(i, &c)| c * (d - i) as f64).collect();
        Polynomial { coefficients }
    }

    /// Solve `self(x) = y` by Newton iteration from `seed`.
    ///
    /// Returns `None` when the iteration hits a flat spot or does not settle.
    pub fn solve(&self, y: f64, seed: f64) -> Option<f64> {
        let deriv = self.derivative();
        let mut x = seed;
        for _ in 0..100 {
            let f = self.eval(x) - y;
            let d = deriv.eval(x);
            if !(d.is_finite() && f.is_finite()) || d == 0.0 {
                return None;
            }
            let step = f / d;
            x -= step;
            if step.abs() <= 1e-12 * x.abs().max(1.0) {
                return Some(x);
            }
        }
        None
    }

    /// Least-squares fit of degree `degree`, optionally with per-point weights
    /// `w_i` multiplying the residuals (`w = 1/sigma`).
    pub fn fit(x: &[f64], y: &[f64], degree: usize, weights: Option<&[f64]>) -> Result<Self> {
        Self::fit_with_covariance(x, y, degree, weights).map(|(p, _)| p)
    }

    /// Least-squares fit returning the unscaled coefficient covariance `(AᵀWA)⁻¹`.
    pub fn fit_with_covariance(
        x: &[f64],
        y: &[f64],
        degree: usize,
        weights: Option<&[f64]>,
    ) -> Result<(Self, DMatrix<f64>)> {
        if x.len() != y.len() {
            return Err(Error::Validation(format!(
                "polynomial fit length mismatch: x has {}, y has {}",
                x.len(),
                y.len()
            )));
        }
        if let Some(w) = weights {
            if w.len() != x.len() {
                return Err(Error::Validation(format!(
                    "polynomial fit weights length mismatch: expected {}, got {}",
                    x.len(),
                    w.len()
                )));
            }
        }
        let n = degree + 1;
        let m = x.len();
        if m < n {
            return Err(Error::InsufficientData(format!(
                "degree {degree} fit needs at least {n} points, got {m}"
            )));
        }

        let mut a = DMatrix::<f64>::zeros(m, n);
        let mut b = DVector::<f64>::zeros(m);
        for i in 0..m {
            let w = weights.map_or(1.0, |w| w[i]);
            for j in 0..n {
                a[(i, j)] = w * x[i].powi((degree - j) as i32);
            }
            b[i] = w * y[i];
        }

        // Column scaling keeps high powers of ADC-sized values well conditioned.
        let mut norms = vec![1.0; n];
        for (j, norm) in norms.iter_mut().enumerate() {
            let s = a.column(j).norm();
            if s > 0.0 && s.is_finite() {
                *norm = s;
                for i in 0..m {
                    a[(i, j)] /= s;
                }
            }
        }

        let svd = a.clone().svd(true, true);
        let sol = svd
            .solve(&b, 1e-14)
            .map_err(|e| Error::Computation(format!("polynomial least squares failed: {e}")))?;
        let coefficients: Vec<f64> = (0..n).map(|j| sol[j] / norms[j]).collect();
        if coefficients.iter().any(|c| !c.is_finite()) {
            return Err(Error::Computation("polynomial fit produced non-finite coefficients".into()));
        }

        let ata = a.transpose() * &a;
        let inv = ata.try_inverse().ok_or_else(|| {
            Error::Computation("polynomial fit normal matrix is singular".to_string())
        })?;
        let cov = DMatrix::from_fn(n, n, |i, j| inv[(i, j)] / (norms[i] * norms[j]));

        Ok((Polynomial { coefficients }, cov))
    }

    /// Closed-form scale through the origin, `y = s·x`, weighted by `1/variance`.
    ///
    /// Returns `(s, var(s))`.
    pub fn fit_scale(x: &[f64], y: &[f64], variance: Option<&[f64]>) -> Result<(f64, f64)> {
        if x.len() != y.len() || variance.is_some_and(|v| v.len() != x.len()) {
            return Err(Error::Validation("scale fit inputs must have equal lengths".to_string()));
        }
        if x.is_empty() {
            return Err(Error::InsufficientData("scale fit needs at least one point".into()));
        }
        let mut sxy = 0.0;
        let mut sxx = 0.0;
        for i in 0..x.len() {
            let v = variance.map_or(1.0, |v| v[i]);
            sxy += x[i] * y[i] / v;
            sxx += x[i] * x[i] / v;
        }
        if !(sxx.is_finite() && sxx > 0.0) {
            return Err(Error::Computation(format!("degenerate scale fit (sum x^2/var = {sxx})")));
        }
        Ok((sxy / sxx, 1.0 / sxx))
    }
}

impl std::fmt::Display for Polynomial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let d = self.degree();
        let terms: Vec<String> = self
            .coefficients
            .iter()
            .enumerate()
            .map(|(i, c)| match d - i {
                0 => format!("{c:.6e}"),
                1 => format!("{c:.6e}*x"),
                p => format!("{c:.6e}*x^{p}"),
            })
            .collect();
        write!(f, "{}", terms.join(" + "))
    }
}
