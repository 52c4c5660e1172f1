//! Shared "fit pipeline" logic behind the `fit` and `infer` commands.
//!
//! Keeping this in one place avoids duplicating the core workflow:
//! CSV ingest -> fit spec -> per-group fits -> functionals
//!
//! The command handlers can then focus on presentation and exports.

use std::collections::BTreeMap;

use crate::cli::{FitArgs, InferenceArgs};
use crate::domain::{Bounds, ExecOptions, FitRecord, FunctionalRequest, ParamTable, SolverControl};
use crate::error::AppError;
use crate::fit::{FitRun, FitSpec, Progress, ProgressFn, fit_all, solvers_by_name};
use crate::inference::{Engine, InferenceTable};
use crate::io::ingest::{IngestSpec, IngestedData, load_groups};
use crate::models::CurveRegistry;

/// All computed outputs of a single `flex fit` run.
#[derive(Debug, Clone)]
pub struct RunOutput {
    pub ingest: IngestedData,
    pub spec: FitSpec,
    pub run: FitRun,
}

/// Build the ingest layout from CLI flags.
pub fn ingest_spec_from_args(args: &FitArgs) -> IngestSpec {
    IngestSpec {
        path: args.data.clone(),
        uid_col: args.uid_col.clone(),
        x_col: args.x_col.clone(),
        y_col: args.y_col.clone(),
    }
}

/// Build a [`FitSpec`] from CLI flags. Tables given on the command line are global.
pub fn fit_spec_from_args(args: &FitArgs) -> Result<FitSpec, AppError> {
    let solvers = solvers_by_name(&args.solvers)?;

    let mut bounds = Bounds::new();
    for (name, lo) in &args.lower {
        bounds = bounds.lower(name.clone(), *lo);
    }
    for (name, hi) in &args.upper {
        bounds = bounds.upper(name.clone(), *hi);
    }

    let control = SolverControl {
        max_iters: args.max_iters,
        tolerance: args.tolerance,
        restarts: args.restarts,
        seed: args.seed,
        ..SolverControl::default()
    };

    let mut spec = FitSpec::new(args.curve.clone(), ParamTable::global(args.init.iter().cloned()))
        .with_bounds(bounds)
        .with_solvers(solvers)
        .with_control(control);
    if !args.fixed.is_empty() {
        spec = spec.with_fixed(ParamTable::global(args.fixed.iter().cloned()));
    }
    Ok(spec)
}

pub fn exec_from_args(args: &FitArgs) -> ExecOptions {
    if args.parallel {
        ExecOptions::parallel(args.workers)
    } else {
        ExecOptions::sequential()
    }
}

/// Execute ingest and fitting, returning every computed output.
///
/// Exits with code 3 when no group could be fitted.
pub fn run_fit(
    args: &FitArgs,
    registry: &CurveRegistry,
    progress: Option<&ProgressFn<'_>>,
) -> Result<RunOutput, AppError> {
    // 1) Read and group the observations.
    let ingest = load_groups(&ingest_spec_from_args(args))?;

    // 2) Assemble the fit request.
    let spec = fit_spec_from_args(args)?;

    // 3) Fit every group.
    let run = fit_all(&ingest.groups, registry, &spec, exec_from_args(args), progress)?;

    if run.records.is_empty() {
        let reasons = run
            .failures
            .iter()
            .map(|(uid, e)| format!("{uid}: {e}"))
            .collect::<Vec<_>>()
            .join("; ");
        return Err(AppError::new(3, format!("No group could be fitted ({reasons})")));
    }

    Ok(RunOutput { ingest, spec, run })
}

/// Stderr progress line, used by `--progress`.
pub fn print_progress(p: Progress<'_>) {
    eprintln!(
        "[{}/{}] {} {}",
        p.done,
        p.total,
        p.uid,
        if p.fitted { "fitted" } else { "failed" }
    );
}

/// Turn the inference flags into titled requests, in display order.
pub fn requests_from_args(args: &InferenceArgs) -> Result<Vec<(String, FunctionalRequest)>, AppError> {
    let mut requests = Vec::new();

    if !args.predict.is_empty() {
        requests.push((
            "Predictions".to_string(),
            FunctionalRequest::Point {
                x: args.predict.clone(),
                interval: args.interval.into(),
            },
        ));
    }
    if !args.derivative.is_empty() {
        requests.push((
            format!("Derivatives (order {})", args.order),
            FunctionalRequest::derivative(args.derivative.clone(), args.order),
        ));
    }
    if let Some((lo, hi)) = args.auc {
        requests.push((
            "Area under curve".to_string(),
            FunctionalRequest::auc(lo, hi, args.auc_points),
        ));
    }
    for source in &args.formula {
        requests.push((format!("Formula {source}"), FunctionalRequest::formula(source)?));
    }
    if let Some(y) = args.inverse {
        requests.push(("Inverse prediction".to_string(), FunctionalRequest::Inverse { y }));
    }

    Ok(requests)
}

/// Evaluate every requested functional against `records`.
pub fn run_inference(
    args: &InferenceArgs,
    records: &BTreeMap<String, FitRecord>,
    registry: &CurveRegistry,
) -> Result<Vec<(String, InferenceTable)>, AppError> {
    let mut engine = Engine::new(registry);
    if let Some(level) = args.level {
        engine = engine.with_level(level)?;
    }

    let requests = requests_from_args(args)?;
    let tables = requests
        .into_iter()
        .map(|(title, request)| {
            let table = if args.uids.is_empty() {
                engine.evaluate_all(records, &request)
            } else {
                engine.evaluate(records, args.uids.iter().map(String::as_str), &request)
            };
            (title, table)
        })
        .collect();
    Ok(tables)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::IntervalArg;

    #[test]
    fn requests_follow_flag_order() {
        let args = InferenceArgs {
            predict: vec![1.0, 2.0],
            interval: IntervalArg::Prediction,
            auc: Some((0.0, 5.0)),
            auc_points: 11,
            formula: vec!["t2 - t1".into()],
            inverse: Some(50.0),
            ..InferenceArgs::default()
        };
        let requests = requests_from_args(&args).unwrap();
        let titles: Vec<_> = requests.iter().map(|(t, _)| t.as_str()).collect();
        assert_eq!(
            titles,
            vec!["Predictions", "Area under curve", "Formula t2 - t1", "Inverse prediction"]
        );
        assert!(matches!(
            requests[0].1,
            FunctionalRequest::Point {
                interval: crate::domain::SeInterval::Prediction,
                ..
            }
        ));
    }

    #[test]
    fn malformed_formula_is_a_usage_error() {
        let args = InferenceArgs {
            formula: vec!["t2 - ".into()],
            ..InferenceArgs::default()
        };
        let err = requests_from_args(&args).unwrap_err();
        assert_eq!(err.exit_code(), 2);
    }
}
