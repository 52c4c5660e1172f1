//! Numeric helpers shared by fitting and inference: grids and trapezoid
//! integration, Richardson differentiation, Hessian inversion, and formula
//! expressions.

pub mod expr;
pub mod grid;
pub mod linalg;
pub mod numdiff;

pub use expr::{Expr, ExprError};
pub use grid::*;
pub use linalg::*;
pub use numdiff::*;
