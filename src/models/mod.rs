//! Curve registry and the built-in curve catalog.
//!
//! Curves are small, pure functions so that fitting and inference code can
//! stay generic over the model family.

pub mod catalog;
pub mod curve;

pub use curve::*;
