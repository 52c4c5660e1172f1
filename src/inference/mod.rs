//! Delta-method inference on fit records.
//!
//! - `delta`: the single propagation primitive `Var(g) ≈ J Σ Jᵀ`
//! - `engine`: point, derivative, AUC, formula and inverse functionals, tangents
//! - `coefficients`: coefficient tables, confidence intervals, fitted values

pub mod coefficients;
pub mod delta;
pub mod engine;

pub use coefficients::{Coefficient, ConfInt};
pub use delta::{DeltaEstimate, delta_method};
pub use engine::{Engine, InferenceTable, Tangent};
