//! Input/output helpers.
//!
//! - long-format CSV ingest + validation (`ingest`)
//! - record JSON and metrics/inference CSV exports (`export`)

pub mod export;
pub mod ingest;

pub use export::*;
pub use ingest::*;
