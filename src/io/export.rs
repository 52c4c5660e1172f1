//! Export fit records, solver metrics and inference tables.
//!
//! Records go to JSON (they are the unit of reuse and can be read back for
//! later inference); the two tables go to CSV for spreadsheets and scripts.

use std::collections::BTreeMap;
use std::fs::File;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{AttemptMetric, FitRecord, InferenceRow};
use crate::error::AppError;

/// On-disk representation of a fitting run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordsFile {
    pub tool: String,
    pub created_at: DateTime<Utc>,
    pub curve: String,
    pub records: Vec<FitRecord>,
    /// Groups that failed, with the reason.
    #[serde(default)]
    pub failures: BTreeMap<String, String>,
}

impl RecordsFile {
    /// Records keyed by `uid`, ready for the inference engine.
    pub fn into_map(self) -> BTreeMap<String, FitRecord> {
        self.records
            .into_iter()
            .map(|r| (r.uid().to_string(), r))
            .collect()
    }
}

/// Write records (plus failures) as pretty JSON.
pub fn write_records_json<'a, I>(
    path: &Path,
    curve: &str,
    records: I,
    failures: BTreeMap<String, String>,
) -> Result<(), AppError>
where
    I: IntoIterator<Item = &'a FitRecord>,
{
    let file = File::create(path).map_err(|e| {
        AppError::new(4, format!("Failed to create records JSON '{}': {e}", path.display()))
    })?;

    let doc = RecordsFile {
        tool: "flex".to_string(),
        created_at: Utc::now(),
        curve: curve.to_string(),
        records: records.into_iter().cloned().collect(),
        failures,
    };

    serde_json::to_writer_pretty(file, &doc)
        .map_err(|e| AppError::new(4, format!("Failed to write records JSON: {e}")))?;
    Ok(())
}

/// Read a records JSON file written by [`write_records_json`].
pub fn read_records_json(path: &Path) -> Result<RecordsFile, AppError> {
    let file = File::open(path).map_err(|e| {
        AppError::new(2, format!("Failed to open records JSON '{}': {e}", path.display()))
    })?;
    serde_json::from_reader(file)
        .map_err(|e| AppError::new(2, format!("Invalid records JSON: {e}")))
}

/// One `(uid, solver)` row per attempt.
pub fn write_metrics_csv(path: &Path, metrics: &[AttemptMetric]) -> Result<(), AppError> {
    write_csv(path, metrics, "metrics")
}

/// One row per evaluated functional.
pub fn write_inference_csv(path: &Path, rows: &[InferenceRow]) -> Result<(), AppError> {
    write_csv(path, rows, "inference")
}

fn write_csv<T: Serialize>(path: &Path, rows: &[T], what: &str) -> Result<(), AppError> {
    let mut writer = csv::Writer::from_path(path).map_err(|e| {
        AppError::new(4, format!("Failed to create {what} CSV '{}': {e}", path.display()))
    })?;
    for row in rows {
        writer
            .serialize(row)
            .map_err(|e| AppError::new(4, format!("Failed to write {what} CSV row: {e}")))?;
    }
    writer
        .flush()
        .map_err(|e| AppError::new(4, format!("Failed to flush {what} CSV: {e}")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ExecOptions, FunctionalRequest, ObservationGroup, ParamTable, SeInterval};
    use crate::fit::{FitSpec, fit_all};
    use crate::inference::Engine;
    use crate::models::CurveRegistry;
    use tempfile::NamedTempFile;

    fn run() -> crate::fit::FitRun {
        let x = vec![0.0, 29.0, 36.0, 42.0, 56.0, 76.0, 92.0, 100.0, 108.0];
        let y = vec![0.0, 0.0, 0.67, 15.11, 77.38, 99.81, 99.81, 99.81, 99.81];
        let spec = FitSpec::new(
            "linear_plateau",
            ParamTable::global([("t1", 40.0), ("t2", 70.0), ("k", 100.0)]),
        );
        fit_all(
            &[ObservationGroup::new("p1", x, y).with_meta("site", "north")],
            CurveRegistry::builtin(),
            &spec,
            ExecOptions::sequential(),
            None,
        )
        .unwrap()
    }

    #[test]
    fn records_reload_exactly_and_support_inference() {
        let run = run();
        let file = NamedTempFile::new().unwrap();
        let mut failures = BTreeMap::new();
        failures.insert("p2".to_string(), "all solvers failed".to_string());
        write_records_json(file.path(), "linear_plateau", run.records.values(), failures).unwrap();

        let loaded = read_records_json(file.path()).unwrap();
        assert_eq!(loaded.tool, "flex");
        assert_eq!(loaded.curve, "linear_plateau");
        assert_eq!(loaded.failures["p2"], "all solvers failed");

        let records = loaded.into_map();
        let original = &run.records["p1"];
        let reloaded = &records["p1"];
        assert_eq!(reloaded, original);
        assert_eq!(reloaded.covariance(), original.covariance());
        assert_eq!(reloaded.meta()["site"], "north");

        let engine = Engine::new(CurveRegistry::builtin());
        let before = engine.point(original, 45.0, SeInterval::Confidence).unwrap();
        let table = engine.evaluate_all(&records, &FunctionalRequest::point(vec![45.0]));
        assert_eq!(table.rows, vec![before]);
    }

    #[test]
    fn unreadable_records_are_input_errors() {
        let file = NamedTempFile::new().unwrap();
        std::fs::write(file.path(), "{ not json").unwrap();
        assert_eq!(read_records_json(file.path()).unwrap_err().exit_code(), 2);

        let missing = file.path().with_extension("missing");
        assert_eq!(read_records_json(&missing).unwrap_err().exit_code(), 2);
    }

    #[test]
    fn tables_are_written_with_headers() {
        let run = run();
        let metrics = NamedTempFile::new().unwrap();
        write_metrics_csv(metrics.path(), &run.metrics).unwrap();
        let text = std::fs::read_to_string(metrics.path()).unwrap();
        assert!(text.starts_with("uid,solver,objective,converged,iterations,selected,error"));
        assert_eq!(text.lines().count(), 1 + run.metrics.len());

        let engine = Engine::new(CurveRegistry::builtin());
        let rows = engine
            .evaluate_all(&run.records, &FunctionalRequest::point(vec![50.0, 60.0]))
            .rows;
        let inference = NamedTempFile::new().unwrap();
        write_inference_csv(inference.path(), &rows).unwrap();
        let text = std::fs::read_to_string(inference.path()).unwrap();
        assert!(text.starts_with("uid,fn_name,kind,x,"));
        assert_eq!(text.lines().count(), 3);
    }
}
