//! Numerically stable special-function helpers built on `statrs`.

use statrs::distribution::{ChiSquared, ContinuousCDF};
use statrs::function::erf::{erf, erfc};

pub(crate) const SQRT_2: f64 = std::f64::consts::SQRT_2;
const INV_SQRT_2PI: f64 = 0.398_942_280_401_432_7;
const INV_SQRT_PI: f64 = 0.564_189_583_547_756_3;

/// Standard normal density.
#[inline]
pub fn normal_pdf(z: f64) -> f64 {
    INV_SQRT_2PI * (-0.5 * z * z).exp()
}

/// Standard normal CDF via `erfc` (accurate in the lower tail).
#[inline]
pub fn normal_cdf(z: f64) -> f64 {
    0.5 * erfc(-z / SQRT_2)
}

/// `erf` re-export so callers do not depend on statrs directly.
#[inline]
pub fn error_function(x: f64) -> f64 {
    erf(x)
}

/// `exp(a) * erfc(v)` without overflow when `a` is large and `erfc(v)` tiny.
///
/// For `v > 3` this uses `erfc(v) = exp(-v²) / (√π · cf(v))` with the Laplace
/// continued fraction `cf(v) = v + (1/2)/(v + 1/(v + (3/2)/(v + ...)))`.
pub fn exp_erfc(a: f64, v: f64) -> f64 {
    if v <= 3.0 {
        return a.exp() * erfc(v);
    }
    let mut cf = v;
    for k in (1..=60).rev() {
        cf = v + (0.5 * k as f64) / cf;
    }
    (a - v * v).exp() * INV_SQRT_PI / cf
}

/// Antiderivative of `erf`: `∫ erf(u) du = u·erf(u) + exp(-u²)/√π`.
#[inline]
pub fn erf_antiderivative(u: f64) -> f64 {
    u * erf(u) + INV_SQRT_PI * (-u * u).exp()
}

/// Chi-square survival function; NaN for non-positive degrees of freedom.
pub fn chi2_sf(stat: f64, dof: f64) -> f64 {
    if stat.is_nan() || !(dof > 0.0) {
        return f64::NAN;
    }
    match ChiSquared::new(dof) {
        Ok(dist) => dist.sf(stat.max(0.0)),
        Err(_) => f64::NAN,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_normal_cdf_symmetry() {
        assert_relative_eq!(normal_cdf(0.0), 0.5, epsilon = 1e-15);
        assert_relative_eq!(normal_cdf(1.3) + normal_cdf(-1.3), 1.0, epsilon = 1e-14);
        assert_relative_eq!(normal_cdf(1.0), 0.841_344_746_068_543, epsilon = 1e-12);
    }

    #[test]
    fn test_exp_erfc_matches_direct_form() {
        for &v in &[3.01, 3.5, 4.0, 5.0, 6.0] {
            let direct = erfc(v);
            assert_relative_eq!(exp_erfc(0.0, v), direct, max_relative = 1e-10);
        }
        // exp(900) overflows on its own; the product must not.
        let big = exp_erfc(900.0, 30.0);
        assert!(big.is_finite() && big > 0.0);
        assert_relative_eq!(exp_erfc(1.0, -2.0), 1.0f64.exp() * erfc(-2.0), max_relative = 1e-14);
    }

    #[test]
    fn test_erf_antiderivative_derivative() {
        let h = 1e-6;
        for &u in &[-2.0, -0.3, 0.0, 0.7, 3.0] {
            let d = (erf_antiderivative(u + h) - erf_antiderivative(u - h)) / (2.0 * h);
            assert_relative_eq!(d, erf(u), epsilon = 1e-8);
        }
    }

    #[test]
    fn test_chi2_sf() {
        // Mean of chi2(k) is k; sf(k; k) for k = 2 is exp(-1).
        assert_relative_eq!(chi2_sf(2.0, 2.0), (-1.0f64).exp(), epsilon = 1e-12);
        assert!(chi2_sf(1.0, 0.0).is_nan());
        assert!(chi2_sf(f64::NAN, 3.0).is_nan());
    }
}
