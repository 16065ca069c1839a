//! Built-in reference line lists (keV).

use ge_core::{Error, Result};

/// Th-228 chain lines.
pub const TH228: [f64; 12] =
    [238.0, 277.0, 300.0, 452.0, 510.77, 583.191, 727.0, 763.0, 785.0, 860.564, 1620.0, 2614.533];

/// The six strongest Th-228 lines, used by [`crate::tl208::calibrate_tl208`].
pub const TH228_STRONG: [f64; 6] = [238.632, 510.77, 583.191, 727.33, 860.564, 2614.533];

/// Lab background lines.
pub const UWMJLAB: [f64; 5] = [239.0, 911.0, 1460.0, 1764.0, 2615.0];

/// Names accepted by [`reference_energies`].
pub const SOURCES: [&str; 2] = ["th228", "uwmjlab"];

/// Reference energies of a named source.
pub fn reference_energies(name: &str) -> Result<Vec<f64>> {
    match name.to_ascii_lowercase().as_str() {
        "th228" => Ok(TH228.to_vec()),
        "uwmjlab" => Ok(UWMJLAB.to_vec()),
        other => Err(Error::Validation(format!(
            "unknown calibration source '{other}' (expected one of {})",
            SOURCES.join(", ")
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lists_are_ascending() {
        for name in SOURCES {
            let e = reference_energies(name).unwrap();
            assert!(e.windows(2).all(|w| w[0] < w[1]), "{name}");
        }
        assert_eq!(reference_energies("Th228").unwrap().len(), 12);
        assert!(TH228_STRONG.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_unknown_source() {
        assert!(matches!(reference_energies("co60"), Err(Error::Validation(_))));
    }
}
