//! # ge-calib
//!
//! Automatic energy calibration of HPGe detector spectra.
//!
//! This crate provides:
//! - Hysteresis extrema search and polynomial pattern matching of detected peaks
//!   against reference line energies
//! - Rough peak search on a coarse histogram and re-location on a fine one
//! - Staged unbinned peak fits with tail arbitration, and a parallel multi-peak
//!   orchestrator with explicit rejection reasons
//! - Energy scale and calibration curve fits
//! - The [`calibrate`] pipeline and its YAML/JSON [`CalibrationConfig`]
//! - [`calibrate_tl208`], a linear calibration that needs no scale guess
//!
//! ## Architecture
//!
//! Shapes, histograms and likelihoods live in `ge-shapes`, minimisation in
//! `ge-inference`. Diagnostics flow through an injected
//! `ge_core::DiagnosticsSink`.

#![warn(missing_docs)]
#![warn(clippy::all)]

/// End-to-end calibration.
pub mod calibration;
/// Local extrema.
pub mod extrema;
/// Per-peak fits.
pub mod peak_fits;
/// Peak search and re-location.
pub mod peak_search;
/// Batch peak-top fits.
pub mod peak_tops;
/// Peak/reference pattern matching.
pub mod poly_match;
/// Built-in reference energies.
pub mod reference;
/// Calibration curve fits.
pub mod scale_fit;
/// Staged unbinned fits.
pub mod staged_fit;
/// Bootstrap calibration without a scale guess.
pub mod tl208;

pub use calibration::{
    CalibrationConfig, CalibrationDiagnostics, CalibrationResult, FittedPeak, ModelSpec,
    PeakRange, PeakSummary, RangeSpec, calibrate,
};
pub use extrema::{Extrema, find_extrema, local_maxima, local_minima};
pub use peak_fits::{
    FitMethod, FitPeaksOptions, InvalidReason, PeakFit, PeakRequest, WindowSpec, fit_peak,
    fit_peaks,
};
pub use peak_search::{PeakSearch, RelocatedPeaks, RoughPeaks, find_peaks, get_peaks};
pub use peak_tops::fit_peak_tops;
pub use poly_match::{PolyMatch, poly_match};
pub use reference::reference_energies;
pub use scale_fit::{CurveFit, FixedCoefficients, fit_inverse, fit_scale};
pub use staged_fit::{Attempt, Stage, StagedFit, StagedFitOptions, StagedFitter, arbitrate};
pub use tl208::{LinearMatch, Tl208Calibration, calibrate_tl208, match_peaks, most_prominent_peaks};
