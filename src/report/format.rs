//! Formatted terminal output.
//!
//! We keep formatting code in one place so:
//! - the math/fitting code stays clean and testable
//! - output changes are localized (important for snapshot tests)

use crate::domain::{FitRecord, InferenceRow};
use crate::fit::{FitRun, FitSpec};
use crate::inference::InferenceTable;
use crate::io::ingest::IngestedData;
use crate::models::CurveRegistry;

/// Dataset + per-group fit summary.
pub fn format_run_summary(ingest: &IngestedData, spec: &FitSpec, run: &FitRun) -> String {
    let mut out = String::new();

    out.push_str("=== flex - per-group curve fit ===\n");
    out.push_str(&format!("Curve: {}\n", spec.curve));
    out.push_str(&format!(
        "Solvers: {}\n",
        spec.solvers
            .iter()
            .map(|s| s.name())
            .collect::<Vec<_>>()
            .join(", ")
    ));
    out.push_str(&format!(
        "Rows: read={} used={} skipped={} | groups={}\n",
        ingest.rows_read,
        ingest.rows_used,
        ingest.row_errors.len(),
        ingest.groups.len()
    ));
    out.push_str(&format!(
        "Fitted: {} | failed: {}\n",
        run.records.len(),
        run.failures.len()
    ));

    out.push_str("\nSolver attempts:\n");
    out.push_str(&format!(
        "  {:<12} {:<12} {:>14} {:>6} {:>6}\n",
        "uid", "solver", "objective", "conv", "iters"
    ));
    for m in &run.metrics {
        let chosen = if m.selected { "*" } else { " " };
        out.push_str(&format!(
            "{chosen} {:<12} {:<12} {:>14} {:>6} {:>6}{}\n",
            truncate(&m.uid, 12),
            truncate(&m.solver, 12),
            fmt_opt(m.objective, 6),
            if m.converged { "yes" } else { "no" },
            m.iterations,
            m.error
                .as_deref()
                .map(|e| format!("  ({e})"))
                .unwrap_or_default(),
        ));
    }

    if !run.failures.is_empty() {
        out.push_str("\nFailed groups:\n");
        for (uid, err) in &run.failures {
            out.push_str(&format!("- {uid}: {err}\n"));
        }
    }
    out.push('\n');
    out
}

/// Coefficient table for each record, with Wald intervals at `level`.
pub fn format_coefficients(records: &[&FitRecord], level: f64) -> String {
    let pct = format!("{:.0}%", level * 100.0);
    let mut out = String::new();
    for rec in records {
        let q = rec.quality();
        out.push_str(&format!(
            "[{}] {} via {} | n={} df={} SSE={:.6} RMSE={:.6} R2={} BIC={:.3}\n",
            rec.uid(),
            rec.fn_name(),
            rec.solver_used(),
            rec.n(),
            rec.df(),
            q.sse,
            q.rmse,
            fmt_opt(q.r_squared, 4),
            q.bic,
        ));
        out.push_str(&format!(
            "  {:<8} {:>14} {:>12} {:>10} {:>10} {:>26}\n",
            "param",
            "estimate",
            "std.error",
            "t",
            "p",
            format!("{pct} CI")
        ));
        let cis = rec.confint(level).unwrap_or_default();
        for (i, c) in rec.coefficients().into_iter().enumerate() {
            let band = match cis.get(i).map(|ci| (ci.lower, ci.upper)) {
                Some((Some(lo), Some(hi))) => format!("[{lo:.4}, {hi:.4}]"),
                _ => "NA".to_string(),
            };
            out.push_str(&format!(
                "  {:<8} {:>14.6} {:>12} {:>10} {:>10} {:>26}\n",
                truncate(&c.name, 8),
                c.estimate,
                fmt_opt(c.std_error, 6),
                fmt_opt(c.t_value, 3),
                fmt_opt(c.p_value, 4),
                band,
            ));
        }
        for (name, value) in rec.fixed() {
            out.push_str(&format!("  {:<8} {:>14.6} {:>12}\n", truncate(name, 8), value, "(fixed)"));
        }
        out.push('\n');
    }
    out
}

/// Inference rows plus rejected requests.
pub fn format_inference(title: &str, table: &InferenceTable) -> String {
    let mut out = String::new();
    out.push_str(&format!("{title}:\n"));
    out.push_str(&format!(
        "  {:<12} {:<18} {:>14} {:>12} {:>26}\n",
        "uid", "at", "value", "std.error", "band"
    ));
    for row in &table.rows {
        out.push_str(&format!(
            "  {:<12} {:<18} {:>14.6} {:>12} {:>26}\n",
            truncate(&row.uid, 12),
            truncate(&describe_at(row), 18),
            row.predicted_value,
            fmt_opt(row.std_error, 6),
            match (row.lower, row.upper) {
                (Some(lo), Some(hi)) => format!("[{lo:.4}, {hi:.4}]"),
                _ => "-".to_string(),
            },
        ));
    }
    for (uid, err) in &table.rejected {
        out.push_str(&format!("  ! {uid}: {err}\n"));
    }
    out
}

/// Registered curves and their parameters.
pub fn format_curves(registry: &CurveRegistry) -> String {
    let mut out = String::from("Registered curves:\n");
    for curve in registry.iter() {
        out.push_str(&format!("  {:<24} ({})\n", curve.name(), curve.params().join(", ")));
    }
    out
}

fn describe_at(row: &InferenceRow) -> String {
    if let Some(expr) = &row.expression {
        return expr.clone();
    }
    match (row.x_min, row.x_max, row.order, row.y, row.x) {
        (Some(lo), Some(hi), ..) => format!("[{lo}, {hi}]"),
        (_, _, Some(order), _, Some(x)) => format!("d{order} @ {x}"),
        (_, _, _, Some(y), _) => format!("y = {y}"),
        (_, _, _, _, Some(x)) => format!("x = {x}"),
        _ => String::new(),
    }
}

fn fmt_opt(v: Option<f64>, decimals: usize) -> String {
    match v {
        Some(v) => format!("{v:.decimals$}"),
        None => "NA".to_string(),
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let mut out: String = s.chars().take(max.saturating_sub(1)).collect();
        out.push('~');
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::FunctionalKind;

    fn row() -> InferenceRow {
        InferenceRow {
            uid: "p1".into(),
            fn_name: "linear".into(),
            kind: FunctionalKind::Auc,
            x: None,
            order: None,
            x_min: Some(0.0),
            x_max: Some(10.0),
            y: None,
            expression: None,
            predicted_value: 12.5,
            std_error: None,
            lower: None,
            upper: None,
        }
    }

    #[test]
    fn missing_values_print_as_na() {
        assert_eq!(fmt_opt(None, 3), "NA");
        assert_eq!(fmt_opt(Some(1.23456), 2), "1.23");
    }

    #[test]
    fn inference_table_lists_rows_and_rejections() {
        let table = InferenceTable {
            rows: vec![row()],
            rejected: vec![(
                "p9".into(),
                crate::error::InferenceError::UnknownGroup("p9".into()),
            )],
        };
        let text = format_inference("AUC", &table);
        assert!(text.contains("[0, 10]"));
        assert!(text.contains("12.500000"));
        assert!(text.contains("! p9: no fit record for group `p9`"));
    }

    #[test]
    fn long_names_are_truncated() {
        assert_eq!(truncate("abcdefghij", 5), "abcd~");
        assert_eq!(truncate("abc", 5), "abc");
    }

    #[test]
    fn coefficient_table_includes_intervals() {
        use crate::domain::{ExecOptions, ObservationGroup, ParamTable};
        use crate::fit::fit_all;

        let x: Vec<f64> = (0..8).map(|i| i as f64).collect();
        let y = x
            .iter()
            .enumerate()
            .map(|(i, v)| 3.0 * v - 2.0 + if i % 2 == 0 { 0.2 } else { -0.2 })
            .collect();
        let spec = FitSpec::new("linear", ParamTable::global([("m", 1.0), ("b", 0.0)]));
        let run = fit_all(
            &[ObservationGroup::new("g", x, y)],
            CurveRegistry::builtin(),
            &spec,
            ExecOptions::sequential(),
            None,
        )
        .unwrap();
        let rec = &run.records["g"];

        let text = format_coefficients(&[rec], 0.9);
        assert!(text.contains("90% CI"));
        let ci = &rec.confint(0.9).unwrap()[0];
        let band = format!("[{:.4}, {:.4}]", ci.lower.unwrap(), ci.upper.unwrap());
        assert!(text.contains(&band));
    }

    #[test]
    fn curve_listing_includes_params() {
        let text = format_curves(CurveRegistry::builtin());
        assert!(text.contains("linear_plateau"));
        assert!(text.contains("(t1, t2, k)"));
    }
}
