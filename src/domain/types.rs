//! Shared domain types.
//!
//! These types are kept lightweight and serializable so they can be:
//!
//! - used in-memory during fitting and inference
//! - exported to JSON/CSV
//! - reloaded later for further inference (a `FitRecord` is the unit of reuse)

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};

use crate::error::{FitError, InferenceError};
use crate::math::Expr;

/// One group's observations: `(x, y)` pairs plus retained metadata columns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservationGroup {
    pub uid: String,
    pub x: Vec<f64>,
    pub y: Vec<f64>,
    /// Extra columns carried through for reporting (first value per group).
    #[serde(default)]
    pub meta: BTreeMap<String, String>,
}

impl ObservationGroup {
    pub fn new(uid: impl Into<String>, x: Vec<f64>, y: Vec<f64>) -> Self {
        Self {
            uid: uid.into(),
            x,
            y,
            meta: BTreeMap::new(),
        }
    }

    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.meta.insert(key.into(), value.into());
        self
    }

    /// Number of usable observations (pairs with finite `x` and `y`).
    pub fn len(&self) -> usize {
        self.pairs().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Finite `(x, y)` pairs; missing `y` values are dropped at this level.
    pub fn pairs(&self) -> impl Iterator<Item = (f64, f64)> + '_ {
        self.x
            .iter()
            .zip(self.y.iter())
            .filter(|(x, y)| x.is_finite() && y.is_finite())
            .map(|(&x, &y)| (x, y))
    }

    /// `(x, y)` columns restricted to finite pairs.
    pub fn clean_columns(&self) -> (Vec<f64>, Vec<f64>) {
        self.pairs().unzip()
    }
}

/// Parameter values supplied either once for every group or per group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamTable {
    Global(BTreeMap<String, f64>),
    PerGroup(BTreeMap<String, BTreeMap<String, f64>>),
}

impl ParamTable {
    /// A table shared by all groups.
    pub fn global<I, K>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, f64)>,
        K: Into<String>,
    {
        ParamTable::Global(pairs.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    /// An empty per-group table; fill it with [`ParamTable::with_row`].
    pub fn per_group() -> Self {
        ParamTable::PerGroup(BTreeMap::new())
    }

    /// Add (or replace) one group's row. Turns a global table into a per-group one.
    pub fn with_row<I, K>(self, uid: impl Into<String>, pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, f64)>,
        K: Into<String>,
    {
        let mut rows = match self {
            ParamTable::PerGroup(rows) => rows,
            ParamTable::Global(_) => BTreeMap::new(),
        };
        rows.insert(
            uid.into(),
            pairs.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        );
        ParamTable::PerGroup(rows)
    }

    /// Per-group initial values taken from previous fits (refit workflow).
    pub fn from_records<'a, I>(records: I) -> Self
    where
        I: IntoIterator<Item = &'a FitRecord>,
    {
        ParamTable::PerGroup(
            records
                .into_iter()
                .map(|r| {
                    let row = r
                        .parameters()
                        .iter()
                        .filter(|p| p.kind == ParamKind::Free)
                        .map(|p| (p.name.clone(), p.value))
                        .collect();
                    (r.uid().to_string(), row)
                })
                .collect(),
        )
    }

    /// The row that applies to `uid`.
    pub fn for_group(&self, uid: &str) -> Option<&BTreeMap<String, f64>> {
        match self {
            ParamTable::Global(row) => Some(row),
            ParamTable::PerGroup(rows) => rows.get(uid),
        }
    }

    /// Requested groups with no row (always empty for a global table).
    pub fn missing_groups<'a, I>(&self, uids: I) -> Vec<String>
    where
        I: IntoIterator<Item = &'a str>,
    {
        match self {
            ParamTable::Global(_) => Vec::new(),
            ParamTable::PerGroup(rows) => uids
                .into_iter()
                .filter(|uid| !rows.contains_key(*uid))
                .map(str::to_string)
                .collect(),
        }
    }

    /// Every parameter name mentioned anywhere in the table.
    pub fn names(&self) -> Vec<&str> {
        let mut out: Vec<&str> = match self {
            ParamTable::Global(row) => row.keys().map(String::as_str).collect(),
            ParamTable::PerGroup(rows) => rows
                .values()
                .flat_map(|r| r.keys().map(String::as_str))
                .collect(),
        };
        out.sort_unstable();
        out.dedup();
        out
    }
}

/// Optional per-parameter box constraints, keyed by parameter name.
///
/// Unset sides default to `-inf` / `+inf`. Only bound-aware solvers enforce them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    #[serde(default)]
    lower: BTreeMap<String, f64>,
    #[serde(default)]
    upper: BTreeMap<String, f64>,
}

impl Bounds {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lower(mut self, name: impl Into<String>, value: f64) -> Self {
        self.lower.insert(name.into(), value);
        self
    }

    pub fn upper(mut self, name: impl Into<String>, value: f64) -> Self {
        self.upper.insert(name.into(), value);
        self
    }

    pub fn between(self, name: impl Into<String>, lo: f64, hi: f64) -> Self {
        let name = name.into();
        self.lower(name.clone(), lo).upper(name, hi)
    }

    pub fn is_unbounded(&self) -> bool {
        self.lower.is_empty() && self.upper.is_empty()
    }

    /// Check every bound names a formal parameter and is numeric and ordered.
    pub fn validate(&self, params: &[String]) -> Result<(), FitError> {
        for (name, v) in self.lower.iter().chain(self.upper.iter()) {
            if !params.iter().any(|p| p == name) {
                return Err(FitError::InvalidBounds {
                    param: name.clone(),
                    reason: "not a parameter of the curve".into(),
                });
            }
            if v.is_nan() {
                return Err(FitError::InvalidBounds {
                    param: name.clone(),
                    reason: "bound is not a number".into(),
                });
            }
        }
        for (name, lo) in &self.lower {
            if let Some(hi) = self.upper.get(name) {
                if lo > hi {
                    return Err(FitError::InvalidBounds {
                        param: name.clone(),
                        reason: format!("lower {lo} exceeds upper {hi}"),
                    });
                }
            }
        }
        Ok(())
    }

    /// `(lower, upper)` pairs aligned to `free_names`.
    pub fn resolve(&self, free_names: &[String]) -> Vec<(f64, f64)> {
        free_names
            .iter()
            .map(|n| {
                (
                    self.lower.get(n).copied().unwrap_or(f64::NEG_INFINITY),
                    self.upper.get(n).copied().unwrap_or(f64::INFINITY),
                )
            })
            .collect()
    }
}

/// Per-solver-call controls. One instance is shared by every solver attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SolverControl {
    /// Iteration cap for a single solver call.
    pub max_iters: u64,
    /// Convergence tolerance (simplex spread / gradient norm).
    pub tolerance: f64,
    /// L-BFGS history size.
    pub lbfgs_memory: usize,
    /// Extra random starts for the multistart solver.
    pub restarts: usize,
    /// Seed for solvers that draw random numbers.
    pub seed: u64,
}

impl Default for SolverControl {
    fn default() -> Self {
        Self {
            max_iters: 2000,
            tolerance: 1e-10,
            lbfgs_memory: 7,
            restarts: 5,
            seed: 42,
        }
    }
}

impl SolverControl {
    pub fn validate(&self) -> Result<(), FitError> {
        if self.max_iters == 0 {
            return Err(FitError::InvalidControl("max_iters must be >= 1".into()));
        }
        if !(self.tolerance.is_finite() && self.tolerance > 0.0) {
            return Err(FitError::InvalidControl(format!(
                "tolerance must be finite and > 0 (got {})",
                self.tolerance
            )));
        }
        if self.lbfgs_memory == 0 {
            return Err(FitError::InvalidControl("lbfgs_memory must be >= 1".into()));
        }
        Ok(())
    }
}

/// How the scheduler runs groups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ExecOptions {
    /// Submit groups to a worker pool instead of fitting them in order.
    pub parallel: bool,
    /// Worker count for parallel mode (`0` = one per core).
    pub workers: usize,
}

impl ExecOptions {
    pub fn sequential() -> Self {
        Self::default()
    }

    pub fn parallel(workers: usize) -> Self {
        Self {
            parallel: true,
            workers,
        }
    }
}

/// Whether a parameter was estimated or supplied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamKind {
    Free,
    Fixed,
}

/// One formal parameter of a fitted curve with its classification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Parameter {
    pub name: String,
    pub kind: ParamKind,
    pub value: f64,
}

/// Fit quality diagnostics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FitQuality {
    pub sse: f64,
    pub rmse: f64,
    /// Missing when `y` is constant.
    pub r_squared: Option<f64>,
    pub aic: f64,
    pub bic: f64,
    pub n: usize,
}

/// Immutable result of fitting one group.
///
/// Produced once by the multi-solver fitter; any refit produces a new record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FitRecord {
    pub(crate) uid: String,
    pub(crate) fn_name: String,
    pub(crate) n: usize,
    pub(crate) p: usize,
    pub(crate) sse: f64,
    pub(crate) df: usize,
    /// Every formal parameter, in curve order, tagged free or fixed.
    pub(crate) parameters: Vec<Parameter>,
    /// Hessian of the loss at the optimum; `None` when unavailable or singular.
    pub(crate) hessian: Option<DMatrix<f64>>,
    /// `2 σ̂² H⁻¹` over the free parameters; present iff `hessian` is and `df > 0`.
    pub(crate) covariance: Option<DMatrix<f64>>,
    pub(crate) solver_used: String,
    pub(crate) converged: bool,
    pub(crate) iterations: u64,
    pub(crate) x_range: (f64, f64),
    pub(crate) quality: FitQuality,
    pub(crate) meta: BTreeMap<String, String>,
}

impl FitRecord {
    pub fn uid(&self) -> &str {
        &self.uid
    }

    pub fn fn_name(&self) -> &str {
        &self.fn_name
    }

    pub fn n(&self) -> usize {
        self.n
    }

    /// Number of free parameters.
    pub fn p(&self) -> usize {
        self.p
    }

    pub fn sse(&self) -> f64 {
        self.sse
    }

    /// Residual degrees of freedom, `n - p`.
    pub fn df(&self) -> usize {
        self.df
    }

    pub fn parameters(&self) -> &[Parameter] {
        &self.parameters
    }

    pub fn free_names(&self) -> Vec<&str> {
        self.parameters
            .iter()
            .filter(|p| p.kind == ParamKind::Free)
            .map(|p| p.name.as_str())
            .collect()
    }

    /// Free-parameter estimates, in curve order.
    pub fn estimates(&self) -> Vec<f64> {
        self.parameters
            .iter()
            .filter(|p| p.kind == ParamKind::Free)
            .map(|p| p.value)
            .collect()
    }

    pub fn estimate(&self, name: &str) -> Option<f64> {
        self.parameters
            .iter()
            .find(|p| p.kind == ParamKind::Free && p.name == name)
            .map(|p| p.value)
    }

    pub fn fixed(&self) -> BTreeMap<&str, f64> {
        self.parameters
            .iter()
            .filter(|p| p.kind == ParamKind::Fixed)
            .map(|p| (p.name.as_str(), p.value))
            .collect()
    }

    /// Value of any parameter, free or fixed.
    pub fn value(&self, name: &str) -> Option<f64> {
        self.parameters
            .iter()
            .find(|p| p.name == name)
            .map(|p| p.value)
    }

    /// All parameter values in curve order.
    pub fn full_params(&self) -> Vec<f64> {
        self.parameters.iter().map(|p| p.value).collect()
    }

    /// Full curve-order vector with the free slots replaced by `free`.
    pub fn with_free(&self, free: &[f64]) -> Vec<f64> {
        let mut it = free.iter();
        self.parameters
            .iter()
            .map(|p| match p.kind {
                ParamKind::Free => it.next().copied().unwrap_or(p.value),
                ParamKind::Fixed => p.value,
            })
            .collect()
    }

    pub fn hessian(&self) -> Option<&DMatrix<f64>> {
        self.hessian.as_ref()
    }

    pub fn covariance(&self) -> Option<&DMatrix<f64>> {
        self.covariance.as_ref()
    }

    /// Residual variance `SSE / df`; `None` when `df = 0`.
    pub fn sigma2(&self) -> Option<f64> {
        (self.df > 0).then(|| self.sse / self.df as f64)
    }

    pub fn solver_used(&self) -> &str {
        &self.solver_used
    }

    pub fn converged(&self) -> bool {
        self.converged
    }

    pub fn iterations(&self) -> u64 {
        self.iterations
    }

    /// Observed `(min, max)` of `x`.
    pub fn x_range(&self) -> (f64, f64) {
        self.x_range
    }

    pub fn quality(&self) -> &FitQuality {
        &self.quality
    }

    pub fn meta(&self) -> &BTreeMap<String, String> {
        &self.meta
    }
}

/// One `(uid, solver)` row of the metrics table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptMetric {
    pub uid: String,
    pub solver: String,
    /// Loss at the solver's best point; `None` if the attempt failed.
    pub objective: Option<f64>,
    pub converged: bool,
    pub iterations: u64,
    pub selected: bool,
    pub error: Option<String>,
}

/// Standard error flavour for point predictions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SeInterval {
    /// SE of the fitted mean.
    #[default]
    Confidence,
    /// SE of a new observation: adds the residual variance.
    Prediction,
}

/// Closure form of a formula: a scalar function of named parameters.
pub type ParamFn = Arc<dyn Fn(&[f64]) -> f64 + Send + Sync>;

/// A scalar function of fitted parameters.
#[derive(Clone)]
pub enum Formula {
    /// Parsed textual expression, e.g. `t2 - t1`.
    Expression { source: String, expr: Expr },
    /// User closure; receives values for `params` in the listed order.
    Closure {
        label: String,
        params: Vec<String>,
        f: ParamFn,
    },
}

impl Formula {
    pub fn parse(source: &str) -> Result<Self, InferenceError> {
        let expr = Expr::parse(source).map_err(|e| InferenceError::MalformedFormula {
            expr: source.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Formula::Expression {
            source: source.trim().to_string(),
            expr,
        })
    }

    pub fn from_fn<F>(label: impl Into<String>, params: &[&str], f: F) -> Self
    where
        F: Fn(&[f64]) -> f64 + Send + Sync + 'static,
    {
        Formula::Closure {
            label: label.into(),
            params: params.iter().map(|p| p.to_string()).collect(),
            f: Arc::new(f),
        }
    }

    /// Text reported in the `expression` column.
    pub fn label(&self) -> &str {
        match self {
            Formula::Expression { source, .. } => source,
            Formula::Closure { label, .. } => label,
        }
    }

    /// Parameter names the formula reads, in first-use order.
    pub fn param_names(&self) -> Vec<String> {
        match self {
            Formula::Expression { expr, .. } => expr.variables(),
            Formula::Closure { params, .. } => params.clone(),
        }
    }
}

impl fmt::Debug for Formula {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Formula").field(&self.label()).finish()
    }
}

/// A derived quantity to evaluate against fit records.
#[derive(Debug, Clone)]
pub enum FunctionalRequest {
    /// Fitted curve value at each `x`.
    Point { x: Vec<f64>, interval: SeInterval },
    /// First or second derivative in `x` at each `x`.
    Derivative { x: Vec<f64>, order: u8 },
    /// Area under the fitted curve over `[lo, hi]` on `n_points` nodes.
    Auc { lo: f64, hi: f64, n_points: usize },
    /// Scalar function of the parameters.
    Formula(Formula),
    /// The `x` at which the fitted curve reaches `y`.
    Inverse { y: f64 },
}

impl FunctionalRequest {
    pub fn point(x: impl Into<Vec<f64>>) -> Self {
        FunctionalRequest::Point {
            x: x.into(),
            interval: SeInterval::Confidence,
        }
    }

    pub fn derivative(x: impl Into<Vec<f64>>, order: u8) -> Self {
        FunctionalRequest::Derivative {
            x: x.into(),
            order,
        }
    }

    pub fn auc(lo: f64, hi: f64, n_points: usize) -> Self {
        FunctionalRequest::Auc { lo, hi, n_points }
    }

    pub fn formula(source: &str) -> Result<Self, InferenceError> {
        Formula::parse(source).map(FunctionalRequest::Formula)
    }

    pub fn kind(&self) -> FunctionalKind {
        match self {
            FunctionalRequest::Point { .. } => FunctionalKind::Point,
            FunctionalRequest::Derivative { .. } => FunctionalKind::Derivative,
            FunctionalRequest::Auc { .. } => FunctionalKind::Auc,
            FunctionalRequest::Formula(_) => FunctionalKind::Formula,
            FunctionalRequest::Inverse { .. } => FunctionalKind::Inverse,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FunctionalKind {
    Point,
    Derivative,
    Auc,
    Formula,
    Inverse,
}

impl FunctionalKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FunctionalKind::Point => "point",
            FunctionalKind::Derivative => "derivative",
            FunctionalKind::Auc => "auc",
            FunctionalKind::Formula => "formula",
            FunctionalKind::Inverse => "inverse",
        }
    }
}

/// One row of an inference result table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceRow {
    pub uid: String,
    pub fn_name: String,
    pub kind: FunctionalKind,
    /// Requested `x` (point / derivative) or solved `x` (inverse).
    pub x: Option<f64>,
    /// Derivative order, for derivative rows.
    pub order: Option<u8>,
    /// Integration interval, for AUC rows.
    pub x_min: Option<f64>,
    pub x_max: Option<f64>,
    /// Target response, for inverse rows.
    pub y: Option<f64>,
    /// Formula text, for formula rows.
    pub expression: Option<String>,
    pub predicted_value: f64,
    /// Missing when the covariance or the Jacobian is unavailable.
    pub std_error: Option<f64>,
    pub lower: Option<f64>,
    pub upper: Option<f64>,
}

impl InferenceRow {
    pub(crate) fn new(record: &FitRecord, kind: FunctionalKind, value: f64) -> Self {
        Self {
            uid: record.uid.clone(),
            fn_name: record.fn_name.clone(),
            kind,
            x: None,
            order: None,
            x_min: None,
            x_max: None,
            y: None,
            expression: None,
            predicted_value: value,
            std_error: None,
            lower: None,
            upper: None,
        }
    }
}
