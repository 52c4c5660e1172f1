//! Pluggable solvers.
//!
//! The fitter only orchestrates: each [`Solver`] receives the bound objective,
//! the shared starting point and the free-parameter bounds, and reports either
//! a [`SolverOutput`] or a [`SolverFailure`]. The built-in solvers wrap
//! `argmin` (Nelder–Mead and L-BFGS with More–Thuente line search) and add a
//! seeded multistart around Nelder–Mead.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use argmin::core::{CostFunction, Executor, Gradient, State, TerminationReason, TerminationStatus};
use argmin::solver::linesearch::MoreThuenteLineSearch;
use argmin::solver::neldermead::NelderMead;
use argmin::solver::quasinewton::LBFGS;
use nalgebra::DMatrix;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, Normal};
use thiserror::Error;

use crate::domain::SolverControl;
use crate::error::FitError;
use crate::fit::objective::Objective;
use crate::math::{central_gradient, hessian};

/// Relative size of the initial simplex edges.
const SIMPLEX_STEP: f64 = 0.1;
/// Central-difference gradients are not accurate below this norm.
const GRAD_TOL_FLOOR: f64 = 1e-7;
/// Relative spread of multistart perturbations.
const RESTART_SCALE: f64 = 0.25;

/// Successful solver call.
#[derive(Debug, Clone, PartialEq)]
pub struct SolverOutput {
    /// Best free-parameter vector found.
    pub estimates: Vec<f64>,
    /// Loss at `estimates`.
    pub objective: f64,
    pub converged: bool,
    pub iterations: u64,
    /// Loss evaluations spent.
    pub evaluations: usize,
    /// Termination status as reported by the solver.
    pub message: String,
}

/// Failed solver call, with the reason.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{reason}")]
pub struct SolverFailure {
    pub reason: String,
}

impl SolverFailure {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

impl From<argmin::core::Error> for SolverFailure {
    fn from(err: argmin::core::Error) -> Self {
        SolverFailure::new(err.to_string())
    }
}

/// A numerical minimiser usable by the multi-solver fitter.
///
/// Implementations must be pure functions of their inputs: no state may carry
/// over between calls, so attempts can run on any worker.
pub trait Solver: Send + Sync {
    /// Identifier used in attempt logs and metrics.
    fn name(&self) -> &str;

    /// Whether `minimize` honours the bounds it is given.
    fn bound_aware(&self) -> bool {
        false
    }

    fn minimize(
        &self,
        objective: &Objective<'_>,
        x0: &[f64],
        bounds: &[(f64, f64)],
        control: &SolverControl,
    ) -> Result<SolverOutput, SolverFailure>;

    /// Hessian of the loss at `at`, for solvers that provide one.
    fn hessian(&self, objective: &Objective<'_>, at: &[f64]) -> Option<DMatrix<f64>> {
        let _ = (objective, at);
        None
    }
}

impl fmt::Debug for dyn Solver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Solver")
            .field("name", &self.name())
            .field("bound_aware", &self.bound_aware())
            .finish()
    }
}

/// Names accepted by [`solver_by_name`].
pub const BUILTIN_SOLVERS: [&str; 3] = ["nelder_mead", "lbfgsb", "multistart"];

pub fn solver_by_name(name: &str) -> Result<Arc<dyn Solver>, FitError> {
    match name {
        "nelder_mead" => Ok(Arc::new(NelderMeadSolver)),
        "lbfgsb" => Ok(Arc::new(LbfgsbSolver)),
        "multistart" => Ok(Arc::new(MultiStartSolver)),
        other => Err(FitError::UnknownSolver(other.to_string())),
    }
}

pub fn solvers_by_name<S: AsRef<str>>(names: &[S]) -> Result<Vec<Arc<dyn Solver>>, FitError> {
    if names.is_empty() {
        return Err(FitError::NoSolvers);
    }
    names.iter().map(|n| solver_by_name(n.as_ref())).collect()
}

/// Solvers used when the caller does not pick any.
pub fn default_solvers() -> Vec<Arc<dyn Solver>> {
    vec![Arc::new(NelderMeadSolver), Arc::new(LbfgsbSolver)]
}

/// Adapter exposing an [`Objective`] to `argmin`.
struct ArgminProblem<'a> {
    objective: &'a Objective<'a>,
    bounds: Option<&'a [(f64, f64)]>,
    evaluations: Arc<AtomicUsize>,
}

fn clamp_params(params: &[f64], bounds: &[(f64, f64)]) -> Vec<f64> {
    params
        .iter()
        .zip(bounds.iter())
        .map(|(&v, &(lo, hi))| v.clamp(lo, hi))
        .collect()
}

impl<'a> ArgminProblem<'a> {
    fn project(&self, params: &[f64]) -> Vec<f64> {
        match self.bounds {
            Some(b) => clamp_params(params, b),
            None => params.to_vec(),
        }
    }
}

impl<'a> CostFunction for ArgminProblem<'a> {
    type Param = Vec<f64>;
    type Output = f64;

    fn cost(&self, params: &Self::Param) -> Result<Self::Output, argmin::core::Error> {
        self.evaluations.fetch_add(1, Ordering::Relaxed);
        Ok(self.objective.value_or_inf(&self.project(params)))
    }
}

impl<'a> Gradient for ArgminProblem<'a> {
    type Param = Vec<f64>;
    type Gradient = Vec<f64>;

    fn gradient(&self, params: &Self::Param) -> Result<Self::Gradient, argmin::core::Error> {
        let at = self.project(params);
        let mut g = central_gradient(|p| self.objective.value(p), &at);
        if g.iter().any(|v| !v.is_finite()) {
            return Err(argmin::core::Error::msg("non-finite gradient"));
        }

        // Projected gradient: at an active bound, drop components pointing outward.
        if let Some(bounds) = self.bounds {
            const EPS: f64 = 1e-12;
            for (i, (&x, &(lo, hi))) in at.iter().zip(bounds.iter()).enumerate() {
                if x <= lo + EPS && g[i] > 0.0 {
                    g[i] = 0.0;
                }
                if x >= hi - EPS && g[i] < 0.0 {
                    g[i] = 0.0;
                }
            }
        }
        Ok(g)
    }
}

fn is_converged(status: &TerminationStatus) -> bool {
    matches!(
        status,
        TerminationStatus::Terminated(TerminationReason::SolverConverged)
            | TerminationStatus::Terminated(TerminationReason::TargetCostReached)
    )
}

fn check_dims(objective: &Objective<'_>, x0: &[f64], bounds: &[(f64, f64)]) -> Result<(), SolverFailure> {
    if x0.len() != objective.dim() {
        return Err(SolverFailure::new(format!(
            "initial point has {} value(s), objective expects {}",
            x0.len(),
            objective.dim()
        )));
    }
    if bounds.len() != x0.len() {
        return Err(SolverFailure::new(format!(
            "bounds length {} does not match parameter count {}",
            bounds.len(),
            x0.len()
        )));
    }
    if x0.iter().any(|v| !v.is_finite()) {
        return Err(SolverFailure::new("initial point is not finite"));
    }
    Ok(())
}

/// Initial simplex: `x0` plus one vertex per coordinate.
fn initial_simplex(x0: &[f64], bounds: Option<&[(f64, f64)]>) -> Vec<Vec<f64>> {
    let mut vertices = Vec::with_capacity(x0.len() + 1);
    vertices.push(x0.to_vec());
    for i in 0..x0.len() {
        let step = SIMPLEX_STEP * x0[i].abs().max(1.0);
        let mut v = x0.to_vec();
        v[i] += step;
        if let Some(b) = bounds {
            if v[i] > b[i].1 {
                v[i] = x0[i] - step;
            }
            v = clamp_params(&v, b);
        }
        vertices.push(v);
    }
    vertices
}

fn run_nelder_mead(
    objective: &Objective<'_>,
    x0: &[f64],
    bounds: Option<&[(f64, f64)]>,
    control: &SolverControl,
) -> Result<SolverOutput, SolverFailure> {
    let evaluations = Arc::new(AtomicUsize::new(0));
    let problem = ArgminProblem {
        objective,
        bounds,
        evaluations: evaluations.clone(),
    };

    let solver = NelderMead::new(initial_simplex(x0, bounds)).with_sd_tolerance(control.tolerance)?;
    let res = Executor::new(problem, solver)
        .configure(|state| state.max_iters(control.max_iters))
        .run()?;

    let state = res.state();
    let best = state
        .get_best_param()
        .ok_or_else(|| SolverFailure::new("no best parameters found"))?;
    let best = match bounds {
        Some(b) => clamp_params(best, b),
        None => best.clone(),
    };
    let status = state.get_termination_status();

    Ok(SolverOutput {
        objective: objective.value(&best),
        estimates: best,
        converged: is_converged(status),
        iterations: state.get_iter(),
        evaluations: evaluations.load(Ordering::Relaxed),
        message: status.to_string(),
    })
}

/// Nelder–Mead simplex. Derivative-free; ignores bounds.
#[derive(Debug, Clone, Copy, Default)]
pub struct NelderMeadSolver;

impl Solver for NelderMeadSolver {
    fn name(&self) -> &str {
        "nelder_mead"
    }

    fn minimize(
        &self,
        objective: &Objective<'_>,
        x0: &[f64],
        bounds: &[(f64, f64)],
        control: &SolverControl,
    ) -> Result<SolverOutput, SolverFailure> {
        check_dims(objective, x0, bounds)?;
        run_nelder_mead(objective, x0, None, control)
    }

    fn hessian(&self, objective: &Objective<'_>, at: &[f64]) -> Option<DMatrix<f64>> {
        hessian(|p| objective.value(p), at)
    }
}

/// L-BFGS with More–Thuente line search; box constraints via clamping and a
/// projected gradient.
#[derive(Debug, Clone, Copy, Default)]
pub struct LbfgsbSolver;

impl Solver for LbfgsbSolver {
    fn name(&self) -> &str {
        "lbfgsb"
    }

    fn bound_aware(&self) -> bool {
        true
    }

    fn minimize(
        &self,
        objective: &Objective<'_>,
        x0: &[f64],
        bounds: &[(f64, f64)],
        control: &SolverControl,
    ) -> Result<SolverOutput, SolverFailure> {
        check_dims(objective, x0, bounds)?;
        let init = clamp_params(x0, bounds);
        let evaluations = Arc::new(AtomicUsize::new(0));
        let problem = ArgminProblem {
            objective,
            bounds: Some(bounds),
            evaluations: evaluations.clone(),
        };

        let linesearch = MoreThuenteLineSearch::new();
        let tol_cost = (0.1 * control.tolerance).max(1e-12);
        let solver = LBFGS::new(linesearch, control.lbfgs_memory)
            .with_tolerance_grad(control.tolerance.max(GRAD_TOL_FLOOR))?
            .with_tolerance_cost(tol_cost)?;

        let res = Executor::new(problem, solver)
            .configure(|state| state.param(init).max_iters(control.max_iters))
            .run()?;

        let state = res.state();
        let best = state
            .get_best_param()
            .ok_or_else(|| SolverFailure::new("no best parameters found"))?;
        let best = clamp_params(best, bounds);
        let status = state.get_termination_status();

        Ok(SolverOutput {
            objective: objective.value(&best),
            estimates: best,
            converged: is_converged(status),
            iterations: state.get_iter(),
            evaluations: evaluations.load(Ordering::Relaxed),
            message: status.to_string(),
        })
    }

    fn hessian(&self, objective: &Objective<'_>, at: &[f64]) -> Option<DMatrix<f64>> {
        hessian(|p| objective.value(p), at)
    }
}

/// Nelder–Mead from `x0` plus `control.restarts` seeded random starts,
/// all clamped into the bounds; keeps the lowest objective.
#[derive(Debug, Clone, Copy, Default)]
pub struct MultiStartSolver;

impl Solver for MultiStartSolver {
    fn name(&self) -> &str {
        "multistart"
    }

    fn bound_aware(&self) -> bool {
        true
    }

    fn minimize(
        &self,
        objective: &Objective<'_>,
        x0: &[f64],
        bounds: &[(f64, f64)],
        control: &SolverControl,
    ) -> Result<SolverOutput, SolverFailure> {
        check_dims(objective, x0, bounds)?;

        let mut rng = StdRng::seed_from_u64(control.seed);
        let normal = Normal::new(0.0, 1.0).map_err(|e| SolverFailure::new(e.to_string()))?;

        let mut starts = vec![clamp_params(x0, bounds)];
        for _ in 0..control.restarts {
            let start: Vec<f64> = x0
                .iter()
                .map(|&v| v + RESTART_SCALE * v.abs().max(1.0) * normal.sample(&mut rng))
                .collect();
            starts.push(clamp_params(&start, bounds));
        }

        let mut best: Option<SolverOutput> = None;
        let mut iterations = 0;
        let mut evaluations = 0;
        let mut last_error = None;
        for start in &starts {
            match run_nelder_mead(objective, start, Some(bounds), control) {
                Ok(out) => {
                    iterations += out.iterations;
                    evaluations += out.evaluations;
                    let better = out.objective.is_finite()
                        && best.as_ref().map_or(true, |b| out.objective < b.objective);
                    if better {
                        best = Some(out);
                    }
                }
                Err(e) => last_error = Some(e),
            }
        }

        match best {
            Some(out) => Ok(SolverOutput {
                iterations,
                evaluations,
                message: format!("best of {} start(s): {}", starts.len(), out.message),
                ..out
            }),
            None => Err(last_error
                .unwrap_or_else(|| SolverFailure::new("no start reached a finite objective"))),
        }
    }

    fn hessian(&self, objective: &Objective<'_>, at: &[f64]) -> Option<DMatrix<f64>> {
        hessian(|p| objective.value(p), at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fit::objective::build_loss;
    use crate::models::CurveRegistry;
    use std::collections::BTreeMap;

    fn line_data() -> (Vec<f64>, Vec<f64>) {
        let x: Vec<f64> = (0..10).map(|i| i as f64).collect();
        let y = x.iter().map(|v| 2.0 * v - 1.0).collect();
        (x, y)
    }

    fn unbounded(n: usize) -> Vec<(f64, f64)> {
        vec![(f64::NEG_INFINITY, f64::INFINITY); n]
    }

    #[test]
    fn every_builtin_solver_recovers_a_line() {
        let (x, y) = line_data();
        let curve = CurveRegistry::builtin().get("linear").unwrap();
        let loss = build_loss(curve, &BTreeMap::new()).unwrap();
        let obj = loss.bind(&x, &y);
        let control = SolverControl::default();

        for name in BUILTIN_SOLVERS {
            let solver = solver_by_name(name).unwrap();
            let out = solver
                .minimize(&obj, &[0.5, 0.5], &unbounded(2), &control)
                .unwrap();
            assert!((out.estimates[0] - 2.0).abs() < 1e-4, "{name}: {:?}", out.estimates);
            assert!((out.estimates[1] + 1.0).abs() < 1e-3, "{name}: {:?}", out.estimates);
            assert!(out.objective < 1e-6, "{name}: {}", out.objective);
            assert!(solver.hessian(&obj, &out.estimates).is_some());
        }
    }

    #[test]
    fn lbfgsb_respects_bounds() {
        let (x, y) = line_data();
        let curve = CurveRegistry::builtin().get("linear").unwrap();
        let fixed = BTreeMap::from([("b".to_string(), -1.0)]);
        let loss = build_loss(curve, &fixed).unwrap();
        let obj = loss.bind(&x, &y);

        let out = LbfgsbSolver
            .minimize(&obj, &[4.0], &[(2.5, 5.0)], &SolverControl::default())
            .unwrap();
        assert!((out.estimates[0] - 2.5).abs() < 1e-6);
    }

    #[test]
    fn multistart_is_reproducible_for_a_seed() {
        let (x, y) = line_data();
        let curve = CurveRegistry::builtin().get("linear").unwrap();
        let loss = build_loss(curve, &BTreeMap::new()).unwrap();
        let obj = loss.bind(&x, &y);
        let control = SolverControl::default();
        let a = MultiStartSolver
            .minimize(&obj, &[1.0, 1.0], &unbounded(2), &control)
            .unwrap();
        let b = MultiStartSolver
            .minimize(&obj, &[1.0, 1.0], &unbounded(2), &control)
            .unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn multistart_never_returns_a_non_finite_best() {
        use crate::models::Curve;
        let curve = Arc::new(Curve::new("nan", &["a"], |_, _| f64::NAN).unwrap());
        let loss = build_loss(curve, &BTreeMap::new()).unwrap();
        let (x, y) = line_data();
        let obj = loss.bind(&x, &y);
        let control = SolverControl {
            max_iters: 50,
            restarts: 2,
            ..SolverControl::default()
        };
        let out = MultiStartSolver.minimize(&obj, &[1.0], &unbounded(1), &control);
        assert!(out.is_err());
    }

    #[test]
    fn dimension_mismatch_is_a_failure_not_a_panic() {
        let (x, y) = line_data();
        let curve = CurveRegistry::builtin().get("linear").unwrap();
        let loss = build_loss(curve, &BTreeMap::new()).unwrap();
        let obj = loss.bind(&x, &y);
        let err = NelderMeadSolver
            .minimize(&obj, &[1.0], &unbounded(1), &SolverControl::default())
            .unwrap_err();
        assert!(err.reason.contains("expects 2"));
    }

    #[test]
    fn unknown_solver_names() {
        assert!(matches!(solver_by_name("bfgs"), Err(FitError::UnknownSolver(_))));
        let empty: [&str; 0] = [];
        assert!(matches!(solvers_by_name(&empty), Err(FitError::NoSolvers)));
    }
}
