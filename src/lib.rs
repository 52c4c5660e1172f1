//! `flex-curves` library crate.
//!
//! Fits a registered curve to many independent observation groups and
//! answers delta-method questions about the fits. The binary (`flex`) is a
//! thin wrapper around this library so that:
//!
//! - core logic is testable without spawning processes
//! - the fitting and inference engines are usable from other Rust code

pub mod app;
pub mod cli;
pub mod domain;
pub mod error;
pub mod fit;
pub mod inference;
pub mod io;
pub mod math;
pub mod models;
pub mod report;
