//! Common data types for gecal

use crate::{Error, Result};
use serde::{Deserialize, Serialize};

/// Fit result containing parameter estimates and uncertainties
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FitResult {
    /// Best-fit parameter values (fixed parameters included)
    pub parameters: Vec<f64>,

    /// Parameter uncertainties (sqrt of covariance diagonal, 0 for fixed parameters)
    pub uncertainties: Vec<f64>,

    /// Covariance matrix (row-major, N×N). `None` if Hessian inversion failed.
    pub covariance: Option<Vec<f64>>,

    /// Objective value at minimum
    pub fval: f64,

    /// Estimated distance to minimum
    pub edm: f64,

    /// Convergence status
    pub converged: bool,

    /// Number of objective evaluations
    pub n_evaluations: usize,
}

impl FitResult {
    /// Create a new fit result
    pub fn new(
        parameters: Vec<f64>,
        uncertainties: Vec<f64>,
        fval: f64,
        converged: bool,
        n_evaluations: usize,
    ) -> Self {
        Self {
            parameters,
            uncertainties,
            covariance: None,
            fval,
            edm: f64::NAN,
            converged,
            n_evaluations,
        }
    }

    /// Create a fit result with covariance matrix
    pub fn with_covariance(
        parameters: Vec<f64>,
        uncertainties: Vec<f64>,
        covariance: Vec<f64>,
        fval: f64,
        converged: bool,
        n_evaluations: usize,
    ) -> Self {
        Self {
            parameters,
            uncertainties,
            covariance: Some(covariance),
            fval,
            edm: f64::NAN,
            converged,
            n_evaluations,
        }
    }

    /// Attach the estimated distance to minimum.
    pub fn with_edm(mut self, edm: f64) -> Self {
        self.edm = edm;
        self
    }

    /// A result of `n` NaN parameters, used to report failed fits.
    pub fn nan(n: usize) -> Self {
        Self {
            parameters: vec![f64::NAN; n],
            uncertainties: vec![f64::NAN; n],
            covariance: Some(vec![f64::NAN; n * n]),
            fval: f64::NAN,
            edm: f64::NAN,
            converged: false,
            n_evaluations: 0,
        }
    }

    /// Covariance element (i, j). Returns `None` if covariance is unavailable.
    pub fn covariance_at(&self, i: usize, j: usize) -> Option<f64> {
        let cov = self.covariance.as_ref()?;
        let n = self.parameters.len();
        if i >= n || j >= n {
            return None;
        }
        Some(cov[i * n + j])
    }

    /// Get correlation matrix element (i, j). Returns `None` if covariance is unavailable.
    pub fn correlation(&self, i: usize, j: usize) -> Option<f64> {
        let c = self.covariance_at(i, j)?;
        let sigma_i = self.uncertainties[i];
        let sigma_j = self.uncertainties[j];
        if sigma_i <= 0.0 || sigma_j <= 0.0 {
            return None;
        }
        Some(c / (sigma_i * sigma_j))
    }
}

/// Binned spectrum: counts, strictly increasing edges and per-bin variance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Histogram {
    counts: Vec<f64>,
    edges: Vec<f64>,
    variance: Vec<f64>,
}

impl Histogram {
    /// Build a histogram, checking `len(edges) == len(counts) + 1` and edge ordering.
    pub fn new(counts: Vec<f64>, edges: Vec<f64>, variance: Vec<f64>) -> Result<Self> {
        if counts.is_empty() {
            return Err(Error::Validation("histogram must have at least one bin".to_string()));
        }
        if edges.len() != counts.len() + 1 {
            return Err(Error::Validation(format!(
                "histogram edges length mismatch: expected {}, got {}",
                counts.len() + 1,
                edges.len()
            )));
        }
        if variance.len() != counts.len() {
            return Err(Error::Validation(format!(
                "histogram variance length mismatch: expected {}, got {}",
                counts.len(),
                variance.len()
            )));
        }
        if edges.iter().any(|e| !e.is_finite()) || edges.windows(2).any(|w| w[1] <= w[0]) {
            return Err(Error::Validation(
                "histogram edges must be finite and strictly increasing".to_string(),
            ));
        }
        Ok(Self { counts, edges, variance })
    }

    /// Build a histogram of raw counts with Poisson variance (`var = counts`).
    pub fn with_poisson_variance(counts: Vec<f64>, edges: Vec<f64>) -> Result<Self> {
        let variance = counts.clone();
        Self::new(counts, edges, variance)
    }

    /// Bin contents.
    pub fn counts(&self) -> &[f64] {
        &self.counts
    }

    /// Bin edges (`n_bins + 1` entries).
    pub fn edges(&self) -> &[f64] {
        &self.edges
    }

    /// Per-bin variance as stored (may contain zeros).
    pub fn variance(&self) -> &[f64] {
        &self.variance
    }

    /// Number of bins.
    pub fn n_bins(&self) -> usize {
        self.counts.len()
    }

    /// Lower and upper edge of the binned range.
    pub fn range(&self) -> (f64, f64) {
        (self.edges[0], self.edges[self.edges.len() - 1])
    }

    /// Bin centres.
    pub fn bin_centers(&self) -> Vec<f64> {
        self.edges.windows(2).map(|w| 0.5 * (w[0] + w[1])).collect()
    }

    /// Bin widths.
    pub fn bin_widths(&self) -> Vec<f64> {
        self.edges.windows(2).map(|w| w[1] - w[0]).collect()
    }

    /// Sum of all bin contents.
    pub fn sum(&self) -> f64 {
        self.counts.iter().sum()
    }

    /// Variance with non-positive entries replaced by `var_zero`.
    pub fn floored_variance(&self, var_zero: f64) -> Vec<f64> {
        self.variance.iter().map(|&v| if v > 0.0 { v } else { var_zero }).collect()
    }

    /// Noise-normalised signal `counts / sqrt(variance)` with the variance floor applied.
    pub fn noise_normalized(&self, var_zero: f64) -> Vec<f64> {
        self.counts
            .iter()
            .zip(self.floored_variance(var_zero))
            .map(|(&c, v)| c / v.sqrt())
            .collect()
    }

    /// Index of the bin containing `x`. The last bin includes its upper edge.
    pub fn find_bin(&self, x: f64) -> Option<usize> {
        let (lo, hi) = self.range();
        if !(x >= lo && x <= hi) {
            return None;
        }
        let idx = self.edges.partition_point(|&e| e <= x);
        Some(idx.saturating_sub(1).min(self.n_bins() - 1))
    }
}
