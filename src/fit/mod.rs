//! Curve fitting orchestration.
//!
//! Responsibilities:
//!
//! - build the SSE objective over the free parameters (`objective`)
//! - run pluggable solvers on it (`solvers`)
//! - pick the best attempt per group and build its record (`fitter`)
//! - validate a run and fit all groups, sequentially or in parallel (`scheduler`)

pub mod fitter;
pub mod objective;
pub mod scheduler;
pub mod solvers;

pub use fitter::*;
pub use objective::*;
pub use scheduler::*;
pub use solvers::*;
