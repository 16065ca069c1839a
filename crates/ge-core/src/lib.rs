//! # ge-core
//!
//! Core types and traits for gecal.
//!
//! This crate provides:
//! - The shared [`Error`] type and [`Result`] alias.
//! - Value types passed between pipeline stages: [`Histogram`], [`Polynomial`],
//!   [`FitResult`].
//! - The [`ObjectiveFunction`] trait consumed by the optimizer in `ge-inference`.
//! - An injected [`DiagnosticsSink`] used instead of global logging state.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod diagnostics;
pub mod error;
pub mod polynomial;
pub mod traits;
pub mod types;

pub use diagnostics::{
    CollectingSink, Diagnostic, DiagnosticsSink, Level, LogSink, NullSink, RecordingSink,
};
pub use error::{Error, Result};
pub use polynomial::Polynomial;
pub use traits::ObjectiveFunction;
pub use types::{FitResult, Histogram};
