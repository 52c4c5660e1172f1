//! Group scheduler: validate the whole request, then fit every group
//! independently, sequentially or on a bounded rayon pool.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use rayon::ThreadPoolBuilder;
use rayon::prelude::*;
use tracing::info;

use crate::domain::{
    AttemptMetric, Bounds, ExecOptions, FitRecord, ObservationGroup, ParamTable, SolverControl,
};
use crate::error::FitError;
use crate::fit::fitter::{GroupOutcome, GroupProblem, fit_group};
use crate::fit::objective::build_loss;
use crate::fit::solvers::{Solver, default_solvers};
use crate::models::{Curve, CurveRegistry};

/// Everything a fitting run needs besides the data.
#[derive(Debug, Clone)]
pub struct FitSpec {
    /// Registered curve name.
    pub curve: String,
    /// Starting values for the free parameters.
    pub initial: ParamTable,
    /// Parameters held constant, if any.
    pub fixed: Option<ParamTable>,
    pub bounds: Bounds,
    /// Tried in order; ties go to the earlier solver.
    pub solvers: Vec<Arc<dyn Solver>>,
    pub control: SolverControl,
}

impl FitSpec {
    pub fn new(curve: impl Into<String>, initial: ParamTable) -> Self {
        Self {
            curve: curve.into(),
            initial,
            fixed: None,
            bounds: Bounds::new(),
            solvers: default_solvers(),
            control: SolverControl::default(),
        }
    }

    pub fn with_fixed(mut self, fixed: ParamTable) -> Self {
        self.fixed = Some(fixed);
        self
    }

    pub fn with_bounds(mut self, bounds: Bounds) -> Self {
        self.bounds = bounds;
        self
    }

    pub fn with_solvers(mut self, solvers: Vec<Arc<dyn Solver>>) -> Self {
        self.solvers = solvers;
        self
    }

    pub fn with_control(mut self, control: SolverControl) -> Self {
        self.control = control;
        self
    }
}

/// Aggregate result of [`fit_all`].
#[derive(Debug, Clone, Default)]
pub struct FitRun {
    /// One record per successfully fitted group.
    pub records: BTreeMap<String, FitRecord>,
    /// One row per `(uid, solver)` attempt, in group order.
    pub metrics: Vec<AttemptMetric>,
    /// Groups that could not be fitted, with the reason.
    pub failures: BTreeMap<String, FitError>,
}

impl FitRun {
    pub fn record(&self, uid: &str) -> Option<&FitRecord> {
        self.records.get(uid)
    }

    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Passed to the progress callback after each group completes.
#[derive(Debug, Clone, Copy)]
pub struct Progress<'a> {
    pub uid: &'a str,
    /// Groups finished so far, this one included.
    pub done: usize,
    pub total: usize,
    /// Whether this group produced a record.
    pub fitted: bool,
}

/// Progress callback; may be called from any worker.
pub type ProgressFn<'f> = dyn Fn(Progress<'_>) + Send + Sync + 'f;

/// Fit every group.
///
/// Configuration errors are returned before any solver runs. Per-group
/// failures land in [`FitRun::failures`] and never affect sibling groups.
pub fn fit_all(
    groups: &[ObservationGroup],
    registry: &CurveRegistry,
    spec: &FitSpec,
    exec: ExecOptions,
    progress: Option<&ProgressFn<'_>>,
) -> Result<FitRun, FitError> {
    let curve = validate(groups, registry, spec)?;

    info!(
        curve = %spec.curve,
        groups = groups.len(),
        solvers = spec.solvers.len(),
        parallel = exec.parallel,
        workers = exec.workers,
        "fitting started"
    );

    let total = groups.len();
    let done = AtomicUsize::new(0);
    let empty = BTreeMap::new();

    let run_one = |group: &ObservationGroup| -> GroupOutcome {
        let problem = GroupProblem {
            curve: &curve,
            initial: spec.initial.for_group(&group.uid).unwrap_or(&empty),
            fixed: spec
                .fixed
                .as_ref()
                .and_then(|t| t.for_group(&group.uid))
                .unwrap_or(&empty),
            bounds: &spec.bounds,
            solvers: &spec.solvers,
            control: &spec.control,
        };
        let outcome = fit_group(group, problem);
        let finished = done.fetch_add(1, Ordering::Relaxed) + 1;
        if let Some(cb) = progress {
            cb(Progress {
                uid: &group.uid,
                done: finished,
                total,
                fitted: outcome.result.is_ok(),
            });
        }
        outcome
    };

    let outcomes: Vec<GroupOutcome> = if exec.parallel {
        let pool = ThreadPoolBuilder::new()
            .num_threads(exec.workers)
            .build()
            .map_err(|e| FitError::WorkerPool(e.to_string()))?;
        pool.install(|| groups.par_iter().map(run_one).collect())
    } else {
        groups.iter().map(run_one).collect()
    };

    let mut run = FitRun::default();
    for outcome in outcomes {
        run.metrics.extend(outcome.metrics);
        match outcome.result {
            Ok(record) => {
                run.records.insert(outcome.uid, record);
            }
            Err(e) => {
                run.failures.insert(outcome.uid, e);
            }
        }
    }

    info!(
        fitted = run.records.len(),
        failed = run.failures.len(),
        "fitting finished"
    );
    Ok(run)
}

/// Reject anything that would make the run meaningless before fitting starts.
fn validate(
    groups: &[ObservationGroup],
    registry: &CurveRegistry,
    spec: &FitSpec,
) -> Result<Arc<Curve>, FitError> {
    let curve = registry.get(&spec.curve)?;

    if spec.solvers.is_empty() {
        return Err(FitError::NoSolvers);
    }
    spec.control.validate()?;
    spec.bounds.validate(curve.params())?;

    let mut seen = BTreeSet::new();
    for g in groups {
        if !seen.insert(g.uid.as_str()) {
            return Err(FitError::DuplicateGroup(g.uid.clone()));
        }
        if g.x.is_empty() || g.y.is_empty() {
            return Err(FitError::EmptyGroup(g.uid.clone()));
        }
        if g.x.len() != g.y.len() {
            return Err(FitError::MismatchedLengths {
                uid: g.uid.clone(),
                x: g.x.len(),
                y: g.y.len(),
            });
        }
    }

    let uids = || groups.iter().map(|g| g.uid.as_str());
    if let Some(fixed) = &spec.fixed {
        let missing = fixed.missing_groups(uids());
        if !missing.is_empty() {
            return Err(FitError::IncompleteParameterCoverage {
                kind: "fixed",
                missing,
            });
        }
    }
    let missing = spec.initial.missing_groups(uids());
    if !missing.is_empty() {
        return Err(FitError::IncompleteParameterCoverage {
            kind: "initial",
            missing,
        });
    }

    for name in spec.initial.names() {
        if curve.param_index(name).is_none() {
            return Err(FitError::CurveSignature {
                curve: curve.name().to_string(),
                reason: format!("initial value given for unknown parameter `{name}`"),
            });
        }
    }

    // Resolve each group's partition now so signature and coverage problems
    // surface before the first solver call.
    let empty = BTreeMap::new();
    for g in groups {
        let fixed = spec
            .fixed
            .as_ref()
            .and_then(|t| t.for_group(&g.uid))
            .unwrap_or(&empty);
        let loss = build_loss(curve.clone(), fixed)?;
        let initial = spec.initial.for_group(&g.uid).unwrap_or(&empty);
        if let Some(name) = loss.free_names().iter().find(|n| !initial.contains_key(*n)) {
            return Err(FitError::MissingInitialValue {
                uid: g.uid.clone(),
                param: name.clone(),
            });
        }
    }

    Ok(curve)
}
