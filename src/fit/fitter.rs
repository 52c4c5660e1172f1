//! Multi-solver fitting for a single group.
//!
//! Given:
//! - the group's `x_i`, `y_i`
//! - a loss with the free/fixed partition already resolved
//! - one shared starting point and the free-parameter bounds
//! - the configured solvers
//!
//! we run every solver independently from the same start, log each attempt,
//! and keep the attempt with the lowest finite objective. Only the winner's
//! Hessian is computed; everything derived from it (covariance, standard
//! errors) degrades to "unavailable" rather than failing the group.

use std::collections::BTreeMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use nalgebra::DMatrix;
use tracing::{debug, warn};

use crate::domain::{AttemptMetric, Bounds, FitQuality, FitRecord, ObservationGroup, SolverControl};
use crate::error::FitError;
use crate::fit::objective::{Loss, Objective, build_loss};
use crate::fit::solvers::{Solver, SolverFailure, SolverOutput};
use crate::math::invert_hessian;
use crate::models::Curve;

/// One solver's outcome, kept in the attempt log whether or not it won.
#[derive(Debug, Clone, PartialEq)]
pub struct FitAttempt {
    pub solver: String,
    pub outcome: Result<SolverOutput, SolverFailure>,
}

impl FitAttempt {
    /// Objective value, if the attempt is eligible for selection.
    pub fn objective(&self) -> Option<f64> {
        match &self.outcome {
            Ok(out) if out.objective.is_finite() => Some(out.objective),
            _ => None,
        }
    }

    fn failure_reason(&self) -> Option<String> {
        match &self.outcome {
            Err(e) => Some(e.reason.clone()),
            Ok(out) if !out.objective.is_finite() => {
                Some(format!("non-finite objective ({})", out.objective))
            }
            Ok(_) => None,
        }
    }
}

/// Run every solver from `x0` and return the attempt log, in solver order.
///
/// Solvers are independent: none sees another's result. A panicking solver
/// is recorded as a failed attempt.
pub fn fit(
    objective: &Objective<'_>,
    x0: &[f64],
    bounds: &[(f64, f64)],
    solvers: &[Arc<dyn Solver>],
    control: &SolverControl,
) -> Vec<FitAttempt> {
    solvers
        .iter()
        .map(|solver| {
            let outcome = catch_unwind(AssertUnwindSafe(|| {
                solver.minimize(objective, x0, bounds, control)
            }))
            .unwrap_or_else(|_| Err(SolverFailure::new("solver panicked")));

            match &outcome {
                Ok(out) => debug!(
                    solver = solver.name(),
                    objective = out.objective,
                    converged = out.converged,
                    iterations = out.iterations,
                    "solver attempt finished"
                ),
                Err(e) => warn!(solver = solver.name(), reason = %e, "solver attempt failed"),
            }

            FitAttempt {
                solver: solver.name().to_string(),
                outcome,
            }
        })
        .collect()
}

/// Index of the winning attempt: lowest finite objective, first-listed on ties.
pub fn select_best(attempts: &[FitAttempt]) -> Option<usize> {
    let mut best: Option<(usize, f64)> = None;
    for (i, attempt) in attempts.iter().enumerate() {
        let Some(obj) = attempt.objective() else {
            continue;
        };
        match best {
            Some((_, b)) if obj >= b => {}
            _ => best = Some((i, obj)),
        }
    }
    best.map(|(i, _)| i)
}

/// Outcome of fitting one group: the record (or why there is none) plus the
/// per-solver metrics rows.
#[derive(Debug, Clone)]
pub struct GroupOutcome {
    pub uid: String,
    pub result: Result<FitRecord, FitError>,
    pub metrics: Vec<AttemptMetric>,
}

/// Everything needed to fit one group, already resolved for that group.
#[derive(Debug, Clone, Copy)]
pub struct GroupProblem<'a> {
    pub curve: &'a Arc<Curve>,
    pub initial: &'a BTreeMap<String, f64>,
    pub fixed: &'a BTreeMap<String, f64>,
    pub bounds: &'a Bounds,
    pub solvers: &'a [Arc<dyn Solver>],
    pub control: &'a SolverControl,
}

/// Fit one group end to end: partition, attempts, selection, record.
pub fn fit_group(group: &ObservationGroup, problem: GroupProblem<'_>) -> GroupOutcome {
    let mut metrics = Vec::new();
    let result = fit_group_inner(group, problem, &mut metrics);
    if let Err(e) = &result {
        warn!(uid = %group.uid, error = %e, "group fit failed");
    }
    GroupOutcome {
        uid: group.uid.clone(),
        result,
        metrics,
    }
}

fn fit_group_inner(
    group: &ObservationGroup,
    problem: GroupProblem<'_>,
    metrics: &mut Vec<AttemptMetric>,
) -> Result<FitRecord, FitError> {
    let loss = build_loss(problem.curve.clone(), problem.fixed)?;

    let x0 = loss
        .free_names()
        .iter()
        .map(|name| {
            problem
                .initial
                .get(name)
                .copied()
                .ok_or_else(|| FitError::MissingInitialValue {
                    uid: group.uid.clone(),
                    param: name.clone(),
                })
        })
        .collect::<Result<Vec<f64>, FitError>>()?;

    let (x, y) = group.clean_columns();
    let n = x.len();
    let p = loss.n_free();
    if n < p {
        return Err(FitError::InsufficientObservations {
            uid: group.uid.clone(),
            n,
            p,
        });
    }

    let bounds = problem.bounds.resolve(loss.free_names());
    let objective = loss.bind(&x, &y);
    let attempts = fit(&objective, &x0, &bounds, problem.solvers, problem.control);
    let winner = select_best(&attempts);

    metrics.extend(attempts.iter().enumerate().map(|(i, a)| AttemptMetric {
        uid: group.uid.clone(),
        solver: a.solver.clone(),
        objective: a.objective(),
        converged: a.outcome.as_ref().map(|o| o.converged).unwrap_or(false),
        iterations: a.outcome.as_ref().map(|o| o.iterations).unwrap_or(0),
        selected: Some(i) == winner,
        error: a.failure_reason(),
    }));

    let Some(idx) = winner else {
        return Err(FitError::AllSolversFailed {
            uid: group.uid.clone(),
            failures: attempts
                .iter()
                .map(|a| format!("{}: {}", a.solver, a.failure_reason().unwrap_or_default()))
                .collect(),
        });
    };
    let Ok(best) = &attempts[idx].outcome else {
        return Err(FitError::AllSolversFailed {
            uid: group.uid.clone(),
            failures: Vec::new(),
        });
    };

    let hessian = problem.solvers[idx].hessian(&objective, &best.estimates);
    Ok(build_record(group, &loss, &x, &y, best, &attempts[idx].solver, hessian))
}

/// Assemble the immutable record for the winning attempt.
fn build_record(
    group: &ObservationGroup,
    loss: &Loss,
    x: &[f64],
    y: &[f64],
    best: &SolverOutput,
    solver: &str,
    hessian: Option<DMatrix<f64>>,
) -> FitRecord {
    let n = x.len();
    let p = loss.n_free();
    let df = n - p;
    let sse = loss.value(&best.estimates, x, y);

    // A singular Hessian is stored as unavailable, same as a missing one.
    let inverse = hessian.as_ref().and_then(invert_hessian);
    if inverse.is_none() {
        warn!(uid = %group.uid, solver, "hessian unavailable or singular; standard errors will be missing");
    }
    let hessian = if inverse.is_some() { hessian } else { None };
    let covariance = match inverse {
        Some(h_inv) if df > 0 => Some(h_inv * (2.0 * sse / df as f64)),
        _ => None,
    };

    let x_range = x.iter().fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| {
        (lo.min(v), hi.max(v))
    });

    FitRecord {
        uid: group.uid.clone(),
        fn_name: loss.curve().name().to_string(),
        n,
        p,
        sse,
        df,
        parameters: loss.parameters(&best.estimates),
        hessian,
        covariance,
        solver_used: solver.to_string(),
        converged: best.converged,
        iterations: best.iterations,
        x_range,
        quality: fit_quality(y, sse, p),
        meta: group.meta.clone(),
    }
}

fn fit_quality(y: &[f64], sse: f64, k: usize) -> FitQuality {
    let n = y.len();
    let n_f = n as f64;
    let mean = y.iter().sum::<f64>() / n_f;
    let sst: f64 = y.iter().map(|v| (v - mean).powi(2)).sum();
    let r_squared = (sst > 0.0).then(|| 1.0 - sse / sst);
    let log_lik_term = n_f * (sse / n_f).max(1e-12).ln();

    FitQuality {
        sse,
        rmse: (sse / n_f).sqrt(),
        r_squared,
        aic: log_lik_term + 2.0 * k as f64,
        bic: log_lik_term + (k as f64) * n_f.ln(),
        n,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fit::solvers::{LbfgsbSolver, NelderMeadSolver};
    use crate::models::CurveRegistry;

    fn ok_attempt(solver: &str, objective: f64) -> FitAttempt {
        FitAttempt {
            solver: solver.to_string(),
            outcome: Ok(SolverOutput {
                estimates: vec![0.0],
                objective,
                converged: true,
                iterations: 1,
                evaluations: 1,
                message: String::new(),
            }),
        }
    }

    fn failed_attempt(solver: &str) -> FitAttempt {
        FitAttempt {
            solver: solver.to_string(),
            outcome: Err(SolverFailure::new("boom")),
        }
    }

    #[test]
    fn selection_prefers_lowest_then_first_listed() {
        let attempts = vec![
            failed_attempt("a"),
            ok_attempt("b", 2.0),
            ok_attempt("c", 1.0),
            ok_attempt("d", 1.0),
            ok_attempt("e", f64::NAN),
        ];
        assert_eq!(select_best(&attempts), Some(2));
    }

    #[test]
    fn selection_skips_non_finite_and_failed() {
        let attempts = vec![failed_attempt("a"), ok_attempt("b", f64::INFINITY)];
        assert_eq!(select_best(&attempts), None);
        assert_eq!(select_best(&[]), None);
    }

    struct Panicky;

    impl Solver for Panicky {
        fn name(&self) -> &str {
            "panicky"
        }

        fn minimize(
            &self,
            _: &Objective<'_>,
            _: &[f64],
            _: &[(f64, f64)],
            _: &SolverControl,
        ) -> Result<SolverOutput, SolverFailure> {
            panic!("solver bug")
        }
    }

    fn line_group() -> ObservationGroup {
        let x: Vec<f64> = (0..8).map(|i| i as f64).collect();
        let y = vec![1.1, 2.9, 5.2, 6.8, 9.1, 11.0, 12.9, 15.1];
        ObservationGroup::new("g1", x, y)
    }

    #[test]
    fn panicking_solver_is_isolated() {
        let curve = CurveRegistry::builtin().get("linear").unwrap();
        let initial = BTreeMap::from([("m".to_string(), 1.0), ("b".to_string(), 0.0)]);
        let fixed = BTreeMap::new();
        let solvers: Vec<Arc<dyn Solver>> = vec![Arc::new(Panicky), Arc::new(NelderMeadSolver)];
        let control = SolverControl::default();
        let bounds = Bounds::new();
        let out = fit_group(
            &line_group(),
            GroupProblem {
                curve: &curve,
                initial: &initial,
                fixed: &fixed,
                bounds: &bounds,
                solvers: &solvers,
                control: &control,
            },
        );

        let record = out.result.unwrap();
        assert_eq!(record.solver_used(), "nelder_mead");
        assert_eq!(out.metrics.len(), 2);
        assert_eq!(out.metrics[0].error.as_deref(), Some("solver panicked"));
        assert!(out.metrics[1].selected);
        assert!(record.covariance().is_some());
        assert_eq!(record.df(), 6);
    }

    #[test]
    fn too_few_observations_is_a_group_error() {
        let curve = CurveRegistry::builtin().get("quadratic").unwrap();
        let initial = BTreeMap::from([
            ("a".to_string(), 1.0),
            ("b".to_string(), 1.0),
            ("c".to_string(), 1.0),
        ]);
        let fixed = BTreeMap::new();
        let solvers: Vec<Arc<dyn Solver>> = vec![Arc::new(LbfgsbSolver)];
        let control = SolverControl::default();
        let bounds = Bounds::new();
        let group = ObservationGroup::new("tiny", vec![0.0, 1.0], vec![1.0, 2.0]);
        let out = fit_group(
            &group,
            GroupProblem {
                curve: &curve,
                initial: &initial,
                fixed: &fixed,
                bounds: &bounds,
                solvers: &solvers,
                control: &control,
            },
        );
        assert_eq!(
            out.result.unwrap_err(),
            FitError::InsufficientObservations {
                uid: "tiny".into(),
                n: 2,
                p: 3
            }
        );
        assert!(out.metrics.is_empty());
    }

    #[test]
    fn quality_matches_bic_formula() {
        let q = fit_quality(&[1.0, 2.0, 3.0, 4.0], 0.4, 2);
        let expected = 4.0 * (0.1_f64).ln() + 2.0 * 4.0_f64.ln();
        assert!((q.bic - expected).abs() < 1e-12);
        assert!((q.r_squared.unwrap() - (1.0 - 0.4 / 5.0)).abs() < 1e-12);
    }
}
