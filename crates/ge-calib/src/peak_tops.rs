//! Batch peak-top fits.

use ge_core::Histogram;
use ge_inference::Minimizer;
use ge_shapes::{PeakTop, fit_peak_top};
use rayon::prelude::*;

/// Fit a Gaussian to the top `window_bins` bins around each candidate.
///
/// Each candidate is independent: any failure gives `None` at its position.
pub fn fit_peak_tops(
    hist: &Histogram,
    candidates: &[f64],
    window_bins: usize,
    minimizer: &Minimizer,
) -> Vec<Option<PeakTop>> {
    candidates
        .par_iter()
        .map(|&c| match fit_peak_top(hist, Some(c), window_bins, minimizer) {
            Ok(top) if top.mode.is_finite() && top.sigma > 0.0 && top.mode > 0.0 => Some(top),
            Ok(_) => None,
            Err(e) => {
                log::debug!("peak top fit at {c} failed: {e}");
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_failures_are_isolated() {
        let edges: Vec<f64> = (0..=300).map(|i| i as f64).collect();
        let counts: Vec<f64> = edges
            .windows(2)
            .map(|w| {
                let c = 0.5 * (w[0] + w[1]);
                let g = |mu: f64, s: f64| 800.0 * (-0.5 * ((c - mu) / s).powi(2)).exp();
                (g(100.0, 3.0) + g(200.0, 4.0) + 5.0).round()
            })
            .collect();
        let h = Histogram::with_poisson_variance(counts, edges).unwrap();
        let tops = fit_peak_tops(&h, &[100.0, 1.0, 200.0, 5000.0], 7, &Minimizer::default());
        assert_eq!(tops.len(), 4);
        assert_relative_eq!(tops[0].as_ref().unwrap().mode, 100.0, epsilon = 0.2);
        assert!(tops[1].is_none());
        assert_relative_eq!(tops[2].as_ref().unwrap().mode, 200.0, epsilon = 0.2);
        assert!(tops[3].is_none());
    }
}
