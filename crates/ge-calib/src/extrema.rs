//! Hysteresis extrema search.

use ge_core::DiagnosticsSink;
use serde::{Deserialize, Serialize};

/// Indices of local maxima and minima, each in increasing order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Extrema {
    /// Maxima that rise at least `delta` above the surrounding minima
    pub maxima: Vec<usize>,
    /// Minima that sit at least `delta` below the surrounding maxima
    pub minima: Vec<usize>,
}

/// Zigzag scan for extrema with prominence greater than `delta`.
///
/// A running maximum is committed once a later sample falls more than `delta`
/// below it; the scan then looks for a minimum seeded at that sample, and vice
/// versa. Committed maxima and minima alternate in index order. A non-positive
/// or non-finite `delta` yields no extrema.
pub fn find_extrema(data: &[f64], delta: f64, sink: &dyn DiagnosticsSink) -> Extrema {
    let mut out = Extrema::default();
    if !(delta.is_finite() && delta > 0.0) {
        sink.warn("find_extrema", format!("delta must be positive, got {delta}"));
        return out;
    }

    let (mut imax, mut imin) = (0usize, 0usize);
    let mut find_max = true;
    for (i, &v) in data.iter().enumerate() {
        if v > data[imax] {
            imax = i;
        }
        if v < data[imin] {
            imin = i;
        }
        if find_max {
            if v < data[imax] - delta {
                out.maxima.push(imax);
                imin = i;
                find_max = false;
            }
        } else if v > data[imin] + delta {
            out.minima.push(imin);
            imax = i;
            find_max = true;
        }
    }
    out
}

/// Maxima only.
pub fn local_maxima(data: &[f64], delta: f64, sink: &dyn DiagnosticsSink) -> Vec<usize> {
    find_extrema(data, delta, sink).maxima
}

/// Minima only.
pub fn local_minima(data: &[f64], delta: f64, sink: &dyn DiagnosticsSink) -> Vec<usize> {
    find_extrema(data, delta, sink).minima
}

#[cfg(test)]
mod tests {
    use super::*;
    use ge_core::{CollectingSink, Level, NullSink};

    #[test]
    fn test_single_hump() {
        let data: Vec<f64> = (0..41).map(|i| (-((i as f64 - 20.0) / 4.0).powi(2)).exp() * 10.0).collect();
        let ex = find_extrema(&data, 1.0, &NullSink);
        assert_eq!(ex.maxima, vec![20]);
        assert!(ex.minima.is_empty());
    }

    #[test]
    fn test_alternating() {
        let data = [0.0, 5.0, 1.0, 6.0, 0.5, 7.0, 0.0];
        let ex = find_extrema(&data, 2.0, &NullSink);
        assert_eq!(ex.maxima, vec![1, 3, 5]);
        assert_eq!(ex.minima, vec![2, 4]);
    }

    #[test]
    fn test_plateau_does_not_retrigger() {
        let data = [0.0, 5.0, 5.0, 5.0, 5.0, 0.0, 0.0, 0.0];
        let ex = find_extrema(&data, 1.0, &NullSink);
        assert_eq!(ex.maxima, vec![1]);
        assert!(ex.minima.is_empty());
    }

    #[test]
    fn test_small_wiggles_ignored() {
        let data = [0.0, 0.5, 0.2, 0.6, 10.0, 9.5, 9.8, 0.0];
        assert_eq!(local_maxima(&data, 1.0, &NullSink), vec![4]);
        assert!(local_minima(&data, 1.0, &NullSink).is_empty());
    }

    #[test]
    fn test_nonpositive_delta() {
        let sink = CollectingSink::new();
        let ex = find_extrema(&[0.0, 3.0, 0.0], 0.0, &sink);
        assert!(ex.maxima.is_empty() && ex.minima.is_empty());
        assert!(sink.contains(Level::Warn, "delta must be positive"));
    }
}
