//! Pattern matching of detected peak positions against reference energies.

use ge_core::{Error, Polynomial, Result};
use serde::{Deserialize, Serialize};

/// Best alignment found by [`poly_match`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolyMatch {
    /// `poly(x) ≈ y` fitted over the winning window
    pub polynomial: Polynomial,
    /// Indices into `xx` of the matched pairs
    pub x_indices: Vec<usize>,
    /// Indices into `yy` of the matched pairs
    pub y_indices: Vec<usize>,
    /// Sum of squared residuals over the matched pairs
    pub residual: f64,
}

impl PolyMatch {
    /// Number of matched pairs.
    pub fn n_matches(&self) -> usize {
        self.x_indices.len()
    }
}

/// Fit `y = poly(x)` for one aligned window.
///
/// `degree == -1` is a pure shift and `degree == 0` a pure scale through the
/// origin; both are closed form.
pub fn fit_window(x: &[f64], y: &[f64], degree: i32) -> Result<Polynomial> {
    match degree {
        -1 => {
            let shift = y.iter().zip(x).map(|(y, x)| y - x).sum::<f64>() / x.len() as f64;
            Ok(Polynomial::new(vec![1.0, shift]))
        }
        0 => Polynomial::fit_scale(x, y, None).map(|(s, _)| Polynomial::scale(s)),
        d if d > 0 => Polynomial::fit(x, y, d as usize, None),
        d => Err(Error::Validation(format!("polynomial degree must be >= -1, got {d}"))),
    }
}

#[inline]
fn is_close(a: f64, b: f64, rtol: f64, atol: f64) -> bool {
    (a - b).abs() <= atol + rtol * b.abs()
}

/// Find the polynomial that maps the most of `xx` onto `yy`.
///
/// Both inputs must be ascending. Contiguous windows of equal length are
/// aligned at every pair of start offsets, starting from the longest possible
/// overlap and shrinking by one. Each alignment is fitted and scored by the
/// number of pairs with `|poly(x) − y| <= atol + rtol·|y|`, ties going to the
/// smaller squared residual over the matched pairs. The search stops after the
/// first length that yields a perfect alignment.
pub fn poly_match(xx: &[f64], yy: &[f64], degree: i32, rtol: f64, atol: f64) -> Result<PolyMatch> {
    if degree < -1 {
        return Err(Error::Validation(format!("polynomial degree must be >= -1, got {degree}")));
    }
    let required = 2.max(degree + 2) as usize;
    if xx.len() < required || yy.len() < required {
        return Err(Error::InsufficientData(format!(
            "degree {degree} matching needs at least {required} values on both sides, got {} and {}",
            xx.len(),
            yy.len()
        )));
    }

    // Best match over all window lengths, not just the current one: a shorter
    // perfect window never replaces a longer window with more matches.
    let mut best: Option<PolyMatch> = None;
    let max_len = xx.len().min(yy.len());
    for len in (required..=max_len).rev() {
        let mut perfect = false;
        for ix in 0..=xx.len() - len {
            for iy in 0..=yy.len() - len {
                let xs = &xx[ix..ix + len];
                let ys = &yy[iy..iy + len];
                let Ok(poly) = fit_window(xs, ys, degree) else {
                    continue;
                };
                let mut x_indices = Vec::new();
                let mut y_indices = Vec::new();
                let mut residual = 0.0;
                for k in 0..len {
                    let p = poly.eval(xs[k]);
                    if is_close(p, ys[k], rtol, atol) {
                        x_indices.push(ix + k);
                        y_indices.push(iy + k);
                        residual += (p - ys[k]).powi(2);
                    }
                }
                if x_indices.len() == len {
                    perfect = true;
                }
                let better = match &best {
                    None => !x_indices.is_empty(),
                    Some(b) => {
                        x_indices.len() > b.n_matches()
                            || (x_indices.len() == b.n_matches() && residual < b.residual)
                    }
                };
                if better {
                    best = Some(PolyMatch { polynomial: poly, x_indices, y_indices, residual });
                }
            }
        }
        if perfect {
            break;
        }
    }

    best.ok_or_else(|| Error::InsufficientData("no alignment produced a single match".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_recovers_linear_map() {
        let xx = [100.0, 250.0, 400.0, 900.0, 1300.0];
        let yy: Vec<f64> = xx.iter().map(|x| 0.5 * x + 3.0).collect();
        let m = poly_match(&xx, &yy, 1, 1e-5, 1e-8).unwrap();
        assert_eq!(m.n_matches(), 5);
        assert_eq!(m.x_indices, vec![0, 1, 2, 3, 4]);
        assert_relative_eq!(m.polynomial.coefficients()[0], 0.5, epsilon = 1e-10);
        assert_relative_eq!(m.polynomial.coefficients()[1], 3.0, epsilon = 1e-7);
    }

    #[test]
    fn test_recovers_quadratic_map() {
        let f = |x: f64| 1e-5 * x * x + 0.3 * x + 1.0;
        let xx = [50.0, 120.0, 300.0, 700.0, 1100.0, 2000.0];
        let yy: Vec<f64> = xx.iter().map(|&x| f(x)).collect();
        let m = poly_match(&xx, &yy, 2, 1e-6, 1e-6).unwrap();
        assert_eq!(m.n_matches(), 6);
        for &x in &xx {
            assert_relative_eq!(m.polynomial.eval(x), f(x), max_relative = 1e-9);
        }
    }

    #[test]
    fn test_shift_and_scale() {
        let xx = [1.0, 2.0, 4.0];
        let yy = [11.0, 12.0, 14.0];
        let m = poly_match(&xx, &yy, -1, 1e-9, 1e-9).unwrap();
        assert_eq!(m.polynomial.coefficients(), &[1.0, 10.0]);

        let yy = [3.0, 6.0, 12.0];
        let m = poly_match(&xx, &yy, 0, 1e-9, 1e-9).unwrap();
        assert_relative_eq!(m.polynomial.coefficients()[0], 3.0);
        assert_eq!(m.n_matches(), 3);
    }

    #[test]
    fn test_extra_detection_outside_references() {
        // A spurious low-energy detection shifts the alignment by one.
        let refs = [238.6, 583.2, 1000.0, 2614.5];
        let xx = [40.0, 238.6 / 0.4, 583.2 / 0.4, 1000.0 / 0.4, 2614.5 / 0.4];
        let m = poly_match(&xx, &refs, 0, 1e-5, 1.0).unwrap();
        assert_eq!(m.x_indices, vec![1, 2, 3, 4]);
        assert_eq!(m.y_indices, vec![0, 1, 2, 3]);
        assert_relative_eq!(m.polynomial.coefficients()[0], 0.4, max_relative = 1e-12);
    }

    #[test]
    fn test_shorter_window_wins_over_poor_full_overlap() {
        // The full overlap fits the outlier and matches nothing; the four-point
        // window is perfect and ends the search.
        let xx = [1.0, 2.0, 3.0, 4.0, 5.0];
        let yy = [2.0, 4.0, 6.0, 8.0, 30.0];
        let m = poly_match(&xx, &yy, 0, 0.0, 0.5).unwrap();
        assert_eq!(m.x_indices, vec![0, 1, 2, 3]);
        assert_eq!(m.y_indices, vec![0, 1, 2, 3]);
        assert_relative_eq!(m.polynomial.coefficients()[0], 2.0, max_relative = 1e-12);
        assert_eq!(m.residual, 0.0);
    }

    #[test]
    fn test_errors() {
        assert!(matches!(poly_match(&[1.0, 2.0], &[1.0, 2.0], -2, 0.0, 0.0), Err(Error::Validation(_))));
        assert!(matches!(
            poly_match(&[1.0, 2.0], &[1.0, 2.0], 1, 0.0, 0.0),
            Err(Error::InsufficientData(_))
        ));
    }
}
