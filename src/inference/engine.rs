//! Functional evaluation against fit records.
//!
//! Each request kind builds a scalar `g(θ)` over the record's free
//! parameters and hands it to [`delta_method`]. Requests fail individually:
//! a bad `x`, an unknown group or a malformed formula rejects that request
//! only, and a missing covariance yields a value with no standard error.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::domain::{
    FitRecord, Formula, FunctionalKind, FunctionalRequest, InferenceRow, ParamKind, SeInterval,
};
use crate::error::InferenceError;
use crate::inference::coefficients::{check_level, t_quantile};
use crate::inference::delta::delta_method;
use crate::math::{DerivOrder, integrate_trapezoid, linspace, richardson, submatrix};
use crate::models::{Curve, CurveRegistry};

/// Grid nodes scanned for a bracketing interval in inverse prediction.
const INVERSE_GRID: usize = 201;
const BISECT_MAX_ITERS: usize = 200;

/// Result rows plus the requests that were rejected, by group.
#[derive(Debug, Clone, Default)]
pub struct InferenceTable {
    pub rows: Vec<InferenceRow>,
    pub rejected: Vec<(String, InferenceError)>,
}

/// Tangent line to the fitted curve at `x`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tangent {
    pub uid: String,
    pub x: f64,
    pub y: f64,
    pub slope: f64,
    pub intercept: f64,
}

/// Evaluates functionals of fitted parameters.
#[derive(Debug, Clone, Copy)]
pub struct Engine<'r> {
    registry: &'r CurveRegistry,
    level: Option<f64>,
}

impl<'r> Engine<'r> {
    pub fn new(registry: &'r CurveRegistry) -> Self {
        Self {
            registry,
            level: None,
        }
    }

    /// Attach `(lower, upper)` bands at `level` to every row with a standard error.
    pub fn with_level(mut self, level: f64) -> Result<Self, InferenceError> {
        check_level(level)?;
        self.level = Some(level);
        Ok(self)
    }

    /// Evaluate `request` for each requested `uid`.
    pub fn evaluate<'u, I>(
        &self,
        records: &BTreeMap<String, FitRecord>,
        uids: I,
        request: &FunctionalRequest,
    ) -> InferenceTable
    where
        I: IntoIterator<Item = &'u str>,
    {
        let mut table = InferenceTable::default();
        for uid in uids {
            let Some(record) = records.get(uid) else {
                table
                    .rejected
                    .push((uid.to_string(), InferenceError::UnknownGroup(uid.to_string())));
                continue;
            };
            for result in self.evaluate_one(record, request) {
                match result {
                    Ok(row) => table.rows.push(row),
                    Err(e) => {
                        debug!(uid, error = %e, "inference request rejected");
                        table.rejected.push((uid.to_string(), e));
                    }
                }
            }
        }
        table
    }

    /// Evaluate `request` for every record, in `uid` order.
    pub fn evaluate_all(
        &self,
        records: &BTreeMap<String, FitRecord>,
        request: &FunctionalRequest,
    ) -> InferenceTable {
        self.evaluate(records, records.keys().map(String::as_str), request)
    }

    /// Evaluate `request` against one record; one result per requested `x`.
    pub fn evaluate_one(
        &self,
        record: &FitRecord,
        request: &FunctionalRequest,
    ) -> Vec<Result<InferenceRow, InferenceError>> {
        match request {
            FunctionalRequest::Point { x, interval } => {
                x.iter().map(|&x| self.point(record, x, *interval)).collect()
            }
            FunctionalRequest::Derivative { x, order } => {
                x.iter().map(|&x| self.derivative(record, x, *order)).collect()
            }
            FunctionalRequest::Auc { lo, hi, n_points } => {
                vec![self.auc(record, *lo, *hi, *n_points)]
            }
            FunctionalRequest::Formula(formula) => vec![self.formula(record, formula)],
            FunctionalRequest::Inverse { y } => vec![self.inverse(record, *y)],
        }
    }

    /// Fitted curve value at `x`.
    pub fn point(
        &self,
        record: &FitRecord,
        x: f64,
        interval: SeInterval,
    ) -> Result<InferenceRow, InferenceError> {
        check_domain(record, x)?;
        let curve = self.curve(record)?;
        let est = delta_method(
            |theta| curve.evaluate(x, &record.with_free(theta)),
            &record.estimates(),
            record.covariance(),
        );

        let variance = match interval {
            SeInterval::Confidence => est.variance,
            SeInterval::Prediction => est.variance.zip(record.sigma2()).map(|(v, s2)| v + s2),
        };
        let mut row = self.row(record, FunctionalKind::Point, est.value, variance);
        row.x = Some(x);
        Ok(row)
    }

    /// First or second derivative of the fitted curve in `x`.
    pub fn derivative(
        &self,
        record: &FitRecord,
        x: f64,
        order: u8,
    ) -> Result<InferenceRow, InferenceError> {
        let deriv = DerivOrder::from_u8(order).ok_or_else(|| {
            InferenceError::InvalidRequest(format!("derivative order must be 1 or 2, got {order}"))
        })?;
        check_domain(record, x)?;
        let curve = self.curve(record)?;
        let est = delta_method(
            |theta| {
                let full = record.with_free(theta);
                richardson(|t| curve.evaluate(t, &full), x, deriv)
            },
            &record.estimates(),
            record.covariance(),
        );

        let mut row = self.row(record, FunctionalKind::Derivative, est.value, est.variance);
        row.x = Some(x);
        row.order = Some(order);
        Ok(row)
    }

    /// Area under the fitted curve over `[lo, hi]` by the trapezoid rule.
    pub fn auc(
        &self,
        record: &FitRecord,
        lo: f64,
        hi: f64,
        n_points: usize,
    ) -> Result<InferenceRow, InferenceError> {
        if n_points < 2 {
            return Err(InferenceError::InvalidRequest(format!(
                "auc needs at least 2 points, got {n_points}"
            )));
        }
        if !(lo <= hi) {
            return Err(InferenceError::InvalidRequest(format!(
                "auc interval [{lo}, {hi}] is reversed"
            )));
        }
        check_domain(record, lo)?;
        check_domain(record, hi)?;
        let curve = self.curve(record)?;
        let est = delta_method(
            |theta| {
                let full = record.with_free(theta);
                integrate_trapezoid(|t| curve.evaluate(t, &full), lo, hi, n_points)
                    .unwrap_or(f64::NAN)
            },
            &record.estimates(),
            record.covariance(),
        );

        let mut row = self.row(record, FunctionalKind::Auc, est.value, est.variance);
        row.x_min = Some(lo);
        row.x_max = Some(hi);
        Ok(row)
    }

    /// Scalar formula of the parameters; only the free parameters it reads
    /// contribute variance.
    pub fn formula(
        &self,
        record: &FitRecord,
        formula: &Formula,
    ) -> Result<InferenceRow, InferenceError> {
        let malformed = |reason: String| InferenceError::MalformedFormula {
            expr: formula.label().to_string(),
            reason,
        };

        let names = formula.param_names();
        // Per name: Ok(index into the sub-vector) for free, Err(value) for fixed.
        let mut slots: Vec<Result<usize, f64>> = Vec::with_capacity(names.len());
        let mut free_idx = Vec::new();
        for name in &names {
            // Position among the free parameters, counted while searching.
            let mut free_pos = 0;
            let mut found = None;
            for param in record.parameters() {
                if &param.name == name {
                    found = Some((param, free_pos));
                    break;
                }
                if param.kind == ParamKind::Free {
                    free_pos += 1;
                }
            }
            let (param, free_pos) = found.ok_or_else(|| {
                malformed(format!("`{name}` is not a parameter of `{}`", record.fn_name()))
            })?;
            match param.kind {
                ParamKind::Free => {
                    slots.push(Ok(free_idx.len()));
                    free_idx.push(free_pos);
                }
                ParamKind::Fixed => slots.push(Err(param.value)),
            }
        }

        let args = |sub: &[f64]| -> Vec<f64> {
            slots
                .iter()
                .map(|s| match *s {
                    Ok(i) => sub[i],
                    Err(v) => v,
                })
                .collect()
        };
        let g = |sub: &[f64]| -> f64 {
            let values = args(sub);
            match formula {
                Formula::Expression { expr, .. } => {
                    let lookup = |n: &str| names.iter().position(|k| k == n).map(|i| values[i]);
                    expr.eval(&lookup).unwrap_or(f64::NAN)
                }
                Formula::Closure { f, .. } => f(&values),
            }
        };

        let estimates = record.estimates();
        let theta: Vec<f64> = free_idx.iter().map(|&i| estimates[i]).collect();

        // Surface evaluation errors once instead of as a NaN value.
        if let Formula::Expression { expr, .. } = formula {
            let values = args(&theta);
            let lookup = |n: &str| names.iter().position(|k| k == n).map(|i| values[i]);
            expr.eval(&lookup).map_err(|e| malformed(e.to_string()))?;
        }

        let sigma = record.covariance().map(|c| submatrix(c, &free_idx));
        let est = delta_method(g, &theta, sigma.as_ref());

        let mut row = self.row(record, FunctionalKind::Formula, est.value, est.variance);
        row.expression = Some(formula.label().to_string());
        Ok(row)
    }

    /// The `x` in the observed domain where the fitted curve equals `y`.
    ///
    /// Takes the first crossing on a fixed grid, refined by bisection.
    pub fn inverse(&self, record: &FitRecord, y: f64) -> Result<InferenceRow, InferenceError> {
        if !y.is_finite() {
            return Err(InferenceError::InvalidRequest(format!(
                "inverse target must be finite, got {y}"
            )));
        }
        let curve = self.curve(record)?;
        let (lo, hi) = record.x_range();
        let solve = |full: &[f64]| solve_inverse(&curve, full, y, lo, hi);

        if solve(&record.full_params()).is_none() {
            return Err(InferenceError::NoSolution {
                uid: record.uid().to_string(),
                y,
            });
        }
        let est = delta_method(
            |theta| solve(&record.with_free(theta)).unwrap_or(f64::NAN),
            &record.estimates(),
            record.covariance(),
        );

        let mut row = self.row(record, FunctionalKind::Inverse, est.value, est.variance);
        row.x = Some(est.value);
        row.y = Some(y);
        Ok(row)
    }

    /// Tangent line at `x`: value and first derivative of the fitted curve.
    pub fn tangent(&self, record: &FitRecord, x: f64) -> Result<Tangent, InferenceError> {
        check_domain(record, x)?;
        let curve = self.curve(record)?;
        let full = record.full_params();
        let y = curve.evaluate(x, &full);
        let slope = richardson(|t| curve.evaluate(t, &full), x, DerivOrder::First);
        Ok(Tangent {
            uid: record.uid().to_string(),
            x,
            y,
            slope,
            intercept: y - slope * x,
        })
    }

    fn curve(&self, record: &FitRecord) -> Result<Arc<Curve>, InferenceError> {
        self.registry
            .get(record.fn_name())
            .map_err(|_| InferenceError::UnknownCurve(record.fn_name().to_string()))
    }

    fn row(
        &self,
        record: &FitRecord,
        kind: FunctionalKind,
        value: f64,
        variance: Option<f64>,
    ) -> InferenceRow {
        let se = variance.map(f64::sqrt);
        let half = se
            .zip(self.level.and_then(|l| t_quantile(l, record.df())))
            .map(|(s, q)| s * q);

        let mut row = InferenceRow::new(record, kind, value);
        row.std_error = se;
        row.lower = half.map(|h| value - h);
        row.upper = half.map(|h| value + h);
        row
    }
}

fn check_domain(record: &FitRecord, x: f64) -> Result<(), InferenceError> {
    let (lo, hi) = record.x_range();
    if x.is_finite() && x >= lo && x <= hi {
        Ok(())
    } else {
        Err(InferenceError::OutOfDomain {
            uid: record.uid().to_string(),
            x,
            lo,
            hi,
        })
    }
}

/// First root of `curve(x) - y` on `[lo, hi]`.
fn solve_inverse(curve: &Curve, full: &[f64], y: f64, lo: f64, hi: f64) -> Option<f64> {
    let h = |x: f64| curve.evaluate(x, full) - y;
    let nodes = linspace(lo, hi, INVERSE_GRID)?;

    let mut prev = (nodes[0], h(nodes[0]));
    if prev.1 == 0.0 {
        return Some(prev.0);
    }
    for &x in &nodes[1..] {
        let hx = h(x);
        if hx == 0.0 {
            return Some(x);
        }
        if prev.1.is_finite() && hx.is_finite() && prev.1.signum() != hx.signum() {
            return Some(bisect(&h, prev.0, x, prev.1));
        }
        prev = (x, hx);
    }
    None
}

fn bisect<H>(h: &H, mut a: f64, mut b: f64, mut ha: f64) -> f64
where
    H: Fn(f64) -> f64,
{
    for _ in 0..BISECT_MAX_ITERS {
        let mid = 0.5 * (a + b);
        if mid <= a || mid >= b {
            break;
        }
        let hm = h(mid);
        if hm == 0.0 {
            return mid;
        }
        if hm.signum() == ha.signum() {
            a = mid;
            ha = hm;
        } else {
            b = mid;
        }
    }
    0.5 * (a + b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ExecOptions, ObservationGroup, ParamTable};
    use crate::fit::{FitSpec, NelderMeadSolver, fit_all};

    fn fitted_line() -> BTreeMap<String, FitRecord> {
        let x: Vec<f64> = (0..10).map(|i| i as f64).collect();
        let y: Vec<f64> = x
            .iter()
            .enumerate()
            .map(|(i, v)| 3.0 * v + 2.0 + if i % 2 == 0 { 0.1 } else { -0.1 })
            .collect();
        let spec = FitSpec::new("linear", ParamTable::global([("m", 1.0), ("b", 0.0)]))
            .with_solvers(vec![Arc::new(NelderMeadSolver)]);
        fit_all(
            &[ObservationGroup::new("l1", x, y)],
            CurveRegistry::builtin(),
            &spec,
            ExecOptions::default(),
            None,
        )
        .unwrap()
        .records
    }

    #[test]
    fn formula_maps_names_past_fixed_parameters() {
        let x: Vec<f64> = (0..10).map(|i| i as f64).collect();
        let y: Vec<f64> = x
            .iter()
            .enumerate()
            .map(|(i, v)| 3.0 * v + 2.0 + if i % 3 == 0 { 0.2 } else { -0.1 })
            .collect();
        let spec = FitSpec::new("quadratic", ParamTable::global([("b", 1.0), ("c", 0.0)]))
            .with_fixed(ParamTable::global([("a", 0.0)]));
        let run = fit_all(
            &[ObservationGroup::new("q", x, y)],
            CurveRegistry::builtin(),
            &spec,
            ExecOptions::default(),
            None,
        )
        .unwrap();
        let rec = &run.records["q"];
        let se = rec.std_errors();
        let engine = Engine::new(CurveRegistry::builtin());

        // `a` precedes the free parameters in the curve but is not in Σ.
        let c = engine.formula(rec, &Formula::parse("c").unwrap()).unwrap();
        assert!((c.std_error.unwrap() - se[1].unwrap()).abs() < 1e-6 * se[1].unwrap());
        let b = engine.formula(rec, &Formula::parse("b").unwrap()).unwrap();
        assert!((b.std_error.unwrap() - se[0].unwrap()).abs() < 1e-6 * se[0].unwrap());
        let a = engine.formula(rec, &Formula::parse("a + 1").unwrap()).unwrap();
        assert_eq!(a.predicted_value, 1.0);
        assert_eq!(a.std_error, Some(0.0));
    }

    #[test]
    fn point_prediction_band_widens_for_prediction() {
        let records = fitted_line();
        let rec = &records["l1"];
        let engine = Engine::new(CurveRegistry::builtin()).with_level(0.95).unwrap();

        let conf = engine.point(rec, 4.5, SeInterval::Confidence).unwrap();
        let pred = engine.point(rec, 4.5, SeInterval::Prediction).unwrap();
        assert!((conf.predicted_value - 15.5).abs() < 0.05);
        assert!(pred.std_error.unwrap() > conf.std_error.unwrap());
        assert!(conf.lower.unwrap() < conf.predicted_value);
        assert!(conf.upper.unwrap() > conf.predicted_value);
    }

    #[test]
    fn out_of_domain_and_unknown_group_are_rejected() {
        let records = fitted_line();
        let engine = Engine::new(CurveRegistry::builtin());
        let table = engine.evaluate(
            &records,
            ["l1", "nope"],
            &FunctionalRequest::point(vec![1.0, 12.0]),
        );
        assert_eq!(table.rows.len(), 1);
        assert_eq!(table.rejected.len(), 2);
        assert!(matches!(table.rejected[0].1, InferenceError::OutOfDomain { .. }));
        assert_eq!(
            table.rejected[1].1,
            InferenceError::UnknownGroup("nope".into())
        );
    }

    #[test]
    fn derivative_order_is_checked() {
        let records = fitted_line();
        let engine = Engine::new(CurveRegistry::builtin());
        assert!(matches!(
            engine.derivative(&records["l1"], 2.0, 3),
            Err(InferenceError::InvalidRequest(_))
        ));
        let d2 = engine.derivative(&records["l1"], 2.0, 2).unwrap();
        assert!(d2.predicted_value.abs() < 1e-3);
    }

    #[test]
    fn inverse_recovers_x() {
        let records = fitted_line();
        let rec = &records["l1"];
        let engine = Engine::new(CurveRegistry::builtin());
        let m = rec.estimate("m").unwrap();
        let b = rec.estimate("b").unwrap();
        let row = engine.inverse(rec, 20.0).unwrap();
        assert!((row.predicted_value - (20.0 - b) / m).abs() < 1e-9);
        assert!(row.std_error.unwrap() > 0.0);
        assert!(matches!(
            engine.inverse(rec, 1000.0),
            Err(InferenceError::NoSolution { .. })
        ));
    }

    #[test]
    fn tangent_of_a_line_is_the_line() {
        let records = fitted_line();
        let rec = &records["l1"];
        let t = Engine::new(CurveRegistry::builtin()).tangent(rec, 3.0).unwrap();
        assert!((t.slope - rec.estimate("m").unwrap()).abs() < 1e-8);
        assert!((t.intercept - rec.estimate("b").unwrap()).abs() < 1e-7);
    }

    #[test]
    fn formula_closure_and_unknown_names() {
        let records = fitted_line();
        let rec = &records["l1"];
        let engine = Engine::new(CurveRegistry::builtin());

        let ratio = Formula::from_fn("b / m", &["b", "m"], |p| p[0] / p[1]);
        let row = engine.formula(rec, &ratio).unwrap();
        let expected = rec.estimate("b").unwrap() / rec.estimate("m").unwrap();
        assert!((row.predicted_value - expected).abs() < 1e-12);
        assert!(row.std_error.is_some());

        let bad = Formula::parse("m + q").unwrap();
        assert!(matches!(
            engine.formula(rec, &bad),
            Err(InferenceError::MalformedFormula { .. })
        ));
    }
}
