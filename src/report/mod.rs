//! Reporting utilities: plain-text tables for the `flex` binary.

pub mod format;

pub use format::*;
