//! Coefficient tables, confidence intervals and fitted values for a record.

use serde::{Deserialize, Serialize};
use statrs::distribution::{ContinuousCDF, StudentsT};

use crate::domain::{FitRecord, ObservationGroup};
use crate::error::InferenceError;
use crate::models::CurveRegistry;

/// One row of a coefficient table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Coefficient {
    pub name: String,
    pub estimate: f64,
    pub std_error: Option<f64>,
    pub t_value: Option<f64>,
    /// Two-sided, Student's t with the record's residual df.
    pub p_value: Option<f64>,
}

/// One parameter's confidence interval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfInt {
    pub name: String,
    pub estimate: f64,
    pub lower: Option<f64>,
    pub upper: Option<f64>,
}

/// Two-sided Student's t critical value for `level` with `df` degrees of freedom.
pub(crate) fn t_quantile(level: f64, df: usize) -> Option<f64> {
    if df == 0 || !(level > 0.0 && level < 1.0) {
        return None;
    }
    let dist = StudentsT::new(0.0, 1.0, df as f64).ok()?;
    Some(dist.inverse_cdf(0.5 + level / 2.0)).filter(|q| q.is_finite())
}

fn t_dist(df: usize) -> Option<StudentsT> {
    if df == 0 {
        return None;
    }
    StudentsT::new(0.0, 1.0, df as f64).ok()
}

pub(crate) fn check_level(level: f64) -> Result<(), InferenceError> {
    if level > 0.0 && level < 1.0 {
        Ok(())
    } else {
        Err(InferenceError::InvalidRequest(format!(
            "confidence level must lie in (0, 1), got {level}"
        )))
    }
}

impl FitRecord {
    /// Standard error of each free parameter, in curve order.
    pub fn std_errors(&self) -> Vec<Option<f64>> {
        (0..self.p)
            .map(|i| {
                self.covariance
                    .as_ref()
                    .map(|c| c[(i, i)])
                    .filter(|v| v.is_finite() && *v >= 0.0)
                    .map(f64::sqrt)
            })
            .collect()
    }

    /// Estimate, standard error, t value and p value per free parameter.
    pub fn coefficients(&self) -> Vec<Coefficient> {
        let dist = t_dist(self.df);
        self.free_names()
            .into_iter()
            .zip(self.estimates())
            .zip(self.std_errors())
            .map(|((name, estimate), se)| {
                let t_value = se.filter(|s| *s > 0.0).map(|s| estimate / s);
                let p_value = match (t_value, &dist) {
                    (Some(t), Some(d)) => Some(2.0 * d.sf(t.abs())),
                    _ => None,
                };
                Coefficient {
                    name: name.to_string(),
                    estimate,
                    std_error: se,
                    t_value,
                    p_value,
                }
            })
            .collect()
    }

    /// Wald intervals `estimate ± t_{df} · se` at `level`.
    pub fn confint(&self, level: f64) -> Result<Vec<ConfInt>, InferenceError> {
        check_level(level)?;
        let q = t_quantile(level, self.df);
        Ok(self
            .free_names()
            .into_iter()
            .zip(self.estimates())
            .zip(self.std_errors())
            .map(|((name, estimate), se)| {
                let half = se.zip(q).map(|(s, q)| s * q);
                ConfInt {
                    name: name.to_string(),
                    estimate,
                    lower: half.map(|h| estimate - h),
                    upper: half.map(|h| estimate + h),
                }
            })
            .collect())
    }

    /// Curve values at `xs` using the estimates and fixed values.
    pub fn fitted(&self, registry: &CurveRegistry, xs: &[f64]) -> Result<Vec<f64>, InferenceError> {
        let curve = registry
            .get(&self.fn_name)
            .map_err(|_| InferenceError::UnknownCurve(self.fn_name.clone()))?;
        Ok(curve.evaluate_many(xs, &self.full_params()))
    }

    /// `y - fitted` over the group's usable observations.
    pub fn residuals(
        &self,
        registry: &CurveRegistry,
        group: &ObservationGroup,
    ) -> Result<Vec<f64>, InferenceError> {
        let (x, y) = group.clean_columns();
        let fitted = self.fitted(registry, &x)?;
        Ok(y.iter().zip(fitted).map(|(obs, fit)| obs - fit).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ExecOptions, ParamTable};
    use crate::fit::{FitSpec, fit_all};

    fn line_group() -> ObservationGroup {
        let x: Vec<f64> = (0..12).map(|i| i as f64).collect();
        let y = x
            .iter()
            .enumerate()
            .map(|(i, v)| 2.0 * v + 1.0 + if i % 2 == 0 { 0.1 } else { -0.1 })
            .collect();
        ObservationGroup::new("line", x, y)
    }

    fn line_record() -> FitRecord {
        let spec = FitSpec::new("linear", ParamTable::global([("m", 1.0), ("b", 0.0)]));
        let run = fit_all(
            &[line_group()],
            CurveRegistry::builtin(),
            &spec,
            ExecOptions::sequential(),
            None,
        )
        .unwrap();
        run.records["line"].clone()
    }

    #[test]
    fn confint_brackets_the_true_slope() {
        let rec = line_record();
        let cis = rec.confint(0.95).unwrap();
        assert_eq!(cis.len(), 2);
        assert_eq!(cis[0].name, "m");
        let (lo, hi) = (cis[0].lower.unwrap(), cis[0].upper.unwrap());
        assert!(lo < cis[0].estimate && cis[0].estimate < hi);
        assert!(lo < 2.0 && 2.0 < hi);

        // Wider at a higher level.
        let wide = rec.confint(0.99).unwrap();
        assert!(wide[0].upper.unwrap() - wide[0].lower.unwrap() > hi - lo);

        assert!(matches!(
            rec.confint(1.5),
            Err(InferenceError::InvalidRequest(_))
        ));
    }

    #[test]
    fn fitted_and_residuals_reproduce_the_sse() {
        let rec = line_record();
        let reg = CurveRegistry::builtin();

        let fitted = rec.fitted(reg, &[0.0, 1.0]).unwrap();
        let (m, b) = (rec.estimate("m").unwrap(), rec.estimate("b").unwrap());
        assert!((fitted[0] - b).abs() < 1e-12);
        assert!((fitted[1] - (m + b)).abs() < 1e-12);

        let residuals = rec.residuals(reg, &line_group()).unwrap();
        assert_eq!(residuals.len(), 12);
        let sse: f64 = residuals.iter().map(|r| r * r).sum();
        assert!((sse - rec.sse()).abs() < 1e-9);
    }

    #[test]
    fn coefficients_report_significance() {
        let rec = line_record();
        let coefs = rec.coefficients();
        assert_eq!(coefs.len(), 2);
        assert!(coefs[0].t_value.unwrap() > 10.0);
        assert!(coefs[0].p_value.unwrap() < 1e-6);
    }

    #[test]
    fn t_quantile_matches_tables() {
        // t_{0.975, 10} = 2.228139
        let q = t_quantile(0.95, 10).unwrap();
        assert!((q - 2.228_139).abs() < 1e-5);
        assert!(t_quantile(0.95, 0).is_none());
        assert!(t_quantile(1.5, 5).is_none());
    }

    #[test]
    fn level_validation() {
        assert!(check_level(0.9).is_ok());
        assert!(check_level(0.0).is_err());
        assert!(check_level(f64::NAN).is_err());
    }
}
