//! Error types.
//!
//! - `FitError`: configuration errors (fatal to a whole `fit_all` call) and
//!   per-group fit errors (isolated to one group).
//! - `InferenceError`: rejection of a single inference request.
//! - `AppError`: what the `flex` binary prints, with a process exit code.

use thiserror::Error;

/// Errors raised while validating a fit request or fitting a group.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FitError {
    #[error("unknown curve `{0}`")]
    UnknownCurve(String),

    #[error("curve `{0}` is already registered")]
    DuplicateCurve(String),

    #[error("invalid curve signature for `{curve}`: {reason}")]
    CurveSignature { curve: String, reason: String },

    #[error("no initial value for free parameter `{param}` (group `{uid}`)")]
    MissingInitialValue { uid: String, param: String },

    #[error("{kind} table has no row for group(s): {}", .missing.join(", "))]
    IncompleteParameterCoverage { kind: &'static str, missing: Vec<String> },

    #[error("invalid bounds for `{param}`: {reason}")]
    InvalidBounds { param: String, reason: String },

    #[error("unknown solver `{0}`")]
    UnknownSolver(String),

    #[error("at least one solver must be configured")]
    NoSolvers,

    #[error("invalid solver control: {0}")]
    InvalidControl(String),

    #[error("group `{0}` appears more than once")]
    DuplicateGroup(String),

    #[error("group `{0}` has no observations")]
    EmptyGroup(String),

    #[error("group `{uid}` has {x} x value(s) but {y} y value(s)")]
    MismatchedLengths { uid: String, x: usize, y: usize },

    #[error("group `{uid}` has {n} observation(s) but {p} free parameter(s)")]
    InsufficientObservations { uid: String, n: usize, p: usize },

    #[error("all solvers failed for group `{uid}`: {}", .failures.join("; "))]
    AllSolversFailed { uid: String, failures: Vec<String> },

    #[error("failed to build worker pool: {0}")]
    WorkerPool(String),
}

impl FitError {
    /// True for errors that abort a whole fitting call before any solver runs.
    pub fn is_configuration(&self) -> bool {
        !matches!(
            self,
            FitError::InsufficientObservations { .. } | FitError::AllSolversFailed { .. }
        )
    }
}

/// Errors that reject a single inference request.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum InferenceError {
    #[error("no fit record for group `{0}`")]
    UnknownGroup(String),

    #[error("unknown curve `{0}`")]
    UnknownCurve(String),

    #[error("x = {x} is outside the observed domain [{lo}, {hi}] of group `{uid}`")]
    OutOfDomain { uid: String, x: f64, lo: f64, hi: f64 },

    #[error("malformed formula `{expr}`: {reason}")]
    MalformedFormula { expr: String, reason: String },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("no solution for y = {y} in group `{uid}`")]
    NoSolution { uid: String, y: f64 },
}

#[derive(Clone)]
pub struct AppError {
    exit_code: u8,
    message: String,
}

impl AppError {
    pub fn new(exit_code: u8, message: impl Into<String>) -> Self {
        Self {
            exit_code,
            message: message.into(),
        }
    }

    pub fn exit_code(&self) -> u8 {
        self.exit_code
    }
}

impl From<FitError> for AppError {
    fn from(err: FitError) -> Self {
        let code = if err.is_configuration() { 2 } else { 3 };
        AppError::new(code, err.to_string())
    }
}

impl From<InferenceError> for AppError {
    fn from(err: InferenceError) -> Self {
        AppError::new(2, err.to_string())
    }
}

impl std::fmt::Display for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::fmt::Debug for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppError")
            .field("exit_code", &self.exit_code)
            .field("message", &self.message)
            .finish()
    }
}

impl std::error::Error for AppError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn per_group_errors_are_not_configuration_errors() {
        let e = FitError::AllSolversFailed {
            uid: "p1".into(),
            failures: vec!["nelder_mead: boom".into()],
        };
        assert!(!e.is_configuration());
        assert_eq!(AppError::from(e).exit_code(), 3);

        let e = FitError::IncompleteParameterCoverage {
            kind: "fixed",
            missing: vec!["p2".into()],
        };
        assert!(e.is_configuration());
        assert_eq!(e.to_string(), "fixed table has no row for group(s): p2");
    }
}
