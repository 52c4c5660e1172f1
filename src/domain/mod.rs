//! Domain types used throughout the pipeline.
//!
//! This module defines:
//!
//! - fit inputs (`ObservationGroup`, `ParamTable`, `Bounds`, `SolverControl`, `ExecOptions`)
//! - fit outputs (`FitRecord`, `Parameter`, `FitQuality`, `AttemptMetric`)
//! - inference requests and rows (`FunctionalRequest`, `Formula`, `InferenceRow`)

pub mod types;

pub use types::*;
