//! # ge-shapes
//!
//! Peak-shape models and histogram utilities for gecal.
//!
//! This crate provides:
//! - Histogramming with Poisson variance and integer-aligned binning
//! - Gaussian peak-top fits
//! - The [`ShapeModel`] capability table: extended densities and CDFs, guesses,
//!   bounds, fixed masks and derived quantities (centroid, FWHM, total events)
//! - Extended unbinned and binned likelihood objectives
//! - Pearson goodness of fit

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Binning helpers.
pub mod histogram;
/// Special functions.
pub mod math;
/// Shape models.
pub mod model;
/// Likelihood objectives.
pub mod objective;
/// Peak-top Gaussian fits.
pub mod peak_top;

pub use histogram::{BinSpec, IntBinning, fwfm, histogram, int_aligned_binning};
pub use model::{GoodnessOfFit, Shape, ShapeModel};
pub use objective::{ExtendedBinnedNll, ExtendedUnbinnedNll};
pub use peak_top::{PeakTop, fit_peak_top};
