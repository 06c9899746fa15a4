// Partial least squares (PLS) regression

#![doc = include_str!("../README.md")]

pub mod diagnostics;
pub mod linalg_backends;
pub mod nipals;

pub use diagnostics::FitDiagnostics;
pub use nipals::{Nipals, NipalsConfig, NipalsError, NipalsModel, PlsVersion};
