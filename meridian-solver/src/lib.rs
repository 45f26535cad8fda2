//! meridian-solver: sparse nonlinear least squares with forward-mode autodiff
//!
//! This crate is the optimization backend of the meridian workspace. It
//! provides dual numbers (`Jet`) with compile-time derivative counts, small
//! 3D math types that work generically under autodiff, and a sparse
//! Levenberg-Marquardt solver over an explicit Jacobian sparsity pattern.

mod jet;
pub mod math3d;
pub mod sparse_solver;

pub use jet::{Jet, Real};
pub use sparse_solver::SparseLevenbergMarquardt;

// Re-export nalgebra for convenience
pub use nalgebra;
