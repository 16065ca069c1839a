//! # ge-inference
//!
//! Numerical minimisation for gecal.
//!
//! This crate provides:
//! - argmin-backed L-BFGS (box bounds via clamping) and Nelder–Mead optimizers
//! - A [`Minimizer`] with fixed/free masking, an optional derivative-free
//!   pre-conditioning phase, Hessian-based covariance and EDM convergence checks
//! - A weighted least-squares objective
//!
//! ## Architecture
//!
//! Objectives implement `ge_core::ObjectiveFunction`; this crate does not know
//! about peak shapes or histograms.

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Weighted least-squares objective.
pub mod least_squares;
/// Masked minimisation with covariance estimation.
pub mod minimizer;
/// Generic numerical optimizers (L-BFGS, Nelder–Mead).
pub mod optimizer;

pub use least_squares::WeightedLeastSquares;
pub use minimizer::{ErrorDef, Minimizer, MinimizerConfig, Strategy};
pub use optimizer::{
    LbfgsbOptimizer, ObjectiveFunction, OptimizationResult, OptimizerConfig, SimplexOptimizer,
};
