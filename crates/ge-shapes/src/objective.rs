//! Likelihood objectives for the peak-shape models.

use crate::model::ShapeModel;
use ge_core::{Error, Histogram, ObjectiveFunction, Result};

/// Extended unbinned negative log-likelihood `N − Σ ln f(x_i)`.
///
/// With a positive `tail_weight` and a tailed model, adds the prior
/// `tail_weight · ln(htail + 0.1)`, which pulls the tail fraction towards zero
/// on low-statistics peaks.
pub struct ExtendedUnbinnedNll<'a> {
    model: ShapeModel,
    data: &'a [f64],
    tail_weight: f64,
}

impl<'a> ExtendedUnbinnedNll<'a> {
    /// NLL of `data` under `model` without a tail prior.
    pub fn new(model: ShapeModel, data: &'a [f64]) -> Self {
        Self { model, data, tail_weight: 0.0 }
    }

    /// Add the tail prior with the given weight (ignored for tail-free models).
    pub fn with_tail_prior(mut self, tail_weight: f64) -> Self {
        self.tail_weight = tail_weight;
        self
    }

    /// Shape model being fitted.
    pub fn model(&self) -> ShapeModel {
        self.model
    }
}

impl ObjectiveFunction for ExtendedUnbinnedNll<'_> {
    fn eval(&self, params: &[f64]) -> Result<f64> {
        let shape = self.model.shape(params)?;
        let mut nll = shape.n_total();
        for &x in self.data {
            nll -= shape.density(x).max(f64::MIN_POSITIVE).ln();
        }
        if self.tail_weight != 0.0 && self.model.has_tail() {
            let t = shape.htail() + 0.1;
            if !(t > 0.0) {
                return Err(Error::Computation(format!("tail fraction {} below -0.1", t - 0.1)));
            }
            nll += self.tail_weight * t.ln();
        }
        if !nll.is_finite() {
            return Err(Error::Computation(format!("unbinned NLL not finite at {params:?}")));
        }
        Ok(nll)
    }
}

/// Extended binned Poisson likelihood, offset so a perfect model scores zero.
pub struct ExtendedBinnedNll<'a> {
    model: ShapeModel,
    hist: &'a Histogram,
}

impl<'a> ExtendedBinnedNll<'a> {
    /// Binned NLL of `hist` under `model`.
    pub fn new(model: ShapeModel, hist: &'a Histogram) -> Self {
        Self { model, hist }
    }
}

impl ObjectiveFunction for ExtendedBinnedNll<'_> {
    fn eval(&self, params: &[f64]) -> Result<f64> {
        let expected = self.model.expected_counts(self.hist.edges(), params)?;
        let mut nll = 0.0;
        for (&n, &mu) in self.hist.counts().iter().zip(&expected) {
            let mu = mu.max(f64::MIN_POSITIVE);
            nll += mu - n;
            if n > 0.0 {
                nll += n * (n / mu).ln();
            }
        }
        if !nll.is_finite() {
            return Err(Error::Computation(format!("binned NLL not finite at {params:?}")));
        }
        Ok(nll)
    }
}
