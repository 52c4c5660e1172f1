//! Long-format CSV ingest.
//!
//! Turns a `(uid, x, y, extra…)` CSV into observation groups that are safe to
//! fit.
//!
//! Design goals:
//! - **Strict schema** for the three required columns (clear errors + exit code 2)
//! - **Row-level validation** (skip bad rows, but report what happened)
//! - **Deterministic behavior** (groups keep first-seen order)
//! - **Separation of concerns**: no fitting logic here

use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use csv::StringRecord;

use crate::domain::ObservationGroup;
use crate::error::AppError;

/// Where to read and which columns hold the group id, `x` and `y`.
#[derive(Debug, Clone)]
pub struct IngestSpec {
    pub path: PathBuf,
    pub uid_col: String,
    pub x_col: String,
    pub y_col: String,
}

impl IngestSpec {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            uid_col: "uid".into(),
            x_col: "x".into(),
            y_col: "y".into(),
        }
    }
}

/// A row-level error encountered during ingest.
#[derive(Debug, Clone, PartialEq)]
pub struct RowError {
    pub line: usize,
    pub uid: Option<String>,
    pub message: String,
}

/// Ingest output: groups + row errors + counters.
#[derive(Debug, Clone)]
pub struct IngestedData {
    pub groups: Vec<ObservationGroup>,
    pub row_errors: Vec<RowError>,
    pub rows_read: usize,
    pub rows_used: usize,
}

/// Load groups from the CSV file named in `spec`.
pub fn load_groups(spec: &IngestSpec) -> Result<IngestedData, AppError> {
    let file = File::open(&spec.path).map_err(|e| {
        AppError::new(
            2,
            format!("Failed to open CSV '{}': {e}", spec.path.display()),
        )
    })?;
    read_groups(file, spec)
}

/// Load groups from any reader (the path in `spec` is only used for messages).
pub fn read_groups<R: Read>(reader: R, spec: &IngestSpec) -> Result<IngestedData, AppError> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(reader);

    let headers = reader
        .headers()
        .map_err(|e| AppError::new(2, format!("Failed to read CSV headers: {e}")))?
        .clone();
    let header_map = build_header_map(&headers);

    let column = |name: &str| {
        header_map
            .get(&normalize_header_name(name))
            .copied()
            .ok_or_else(|| {
                AppError::new(
                    2,
                    format!(
                        "Missing required column '{name}' in '{}'",
                        spec.path.display()
                    ),
                )
            })
    };
    let uid_idx = column(&spec.uid_col)?;
    let x_idx = column(&spec.x_col)?;
    let y_idx = column(&spec.y_col)?;
    let meta_cols: Vec<(usize, String)> = headers
        .iter()
        .enumerate()
        .filter(|(i, _)| ![uid_idx, x_idx, y_idx].contains(i))
        .map(|(i, name)| (i, normalize_header_name(name)))
        .collect();

    let mut groups: Vec<ObservationGroup> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut row_errors = Vec::new();
    let mut rows_read = 0usize;
    let mut rows_used = 0usize;

    for (idx, result) in reader.records().enumerate() {
        // +2: records start after the header line, lines are 1-based.
        let line = idx + 2;
        rows_read += 1;

        let record = match result {
            Ok(r) => r,
            Err(e) => {
                row_errors.push(RowError {
                    line,
                    uid: None,
                    message: format!("CSV parse error: {e}"),
                });
                continue;
            }
        };

        let uid = field(&record, uid_idx).unwrap_or_default().to_string();
        if uid.is_empty() {
            row_errors.push(RowError {
                line,
                uid: None,
                message: format!("empty '{}'", spec.uid_col),
            });
            continue;
        }

        let parsed = parse_f64(&record, x_idx, &spec.x_col)
            .and_then(|x| parse_f64(&record, y_idx, &spec.y_col).map(|y| (x, y)));
        let (x, y) = match parsed {
            Ok(v) => v,
            Err(message) => {
                row_errors.push(RowError {
                    line,
                    uid: Some(uid),
                    message,
                });
                continue;
            }
        };

        let slot = *index.entry(uid.clone()).or_insert_with(|| {
            groups.push(ObservationGroup::new(uid.clone(), Vec::new(), Vec::new()));
            groups.len() - 1
        });
        let group = &mut groups[slot];
        group.x.push(x);
        group.y.push(y);
        for (i, name) in &meta_cols {
            if let Some(v) = field(&record, *i).filter(|v| !v.is_empty()) {
                group.meta.entry(name.clone()).or_insert_with(|| v.to_string());
            }
        }
        rows_used += 1;
    }

    if groups.is_empty() {
        return Err(AppError::new(3, "No valid rows remain after validation."));
    }

    Ok(IngestedData {
        groups,
        row_errors,
        rows_read,
        rows_used,
    })
}

fn build_header_map(headers: &StringRecord) -> HashMap<String, usize> {
    headers
        .iter()
        .enumerate()
        .map(|(idx, name)| (normalize_header_name(name), idx))
        .collect()
}

fn normalize_header_name(name: &str) -> String {
    // Spreadsheet exports may prefix the first header with a BOM.
    let name = name.trim().trim_start_matches('\u{feff}');
    name.to_ascii_lowercase()
}

fn field(record: &StringRecord, idx: usize) -> Option<&str> {
    record.get(idx).map(str::trim)
}

fn parse_f64(record: &StringRecord, idx: usize, name: &str) -> Result<f64, String> {
    let raw = field(record, idx).unwrap_or_default();
    if raw.is_empty() || raw.eq_ignore_ascii_case("na") {
        return Err(format!("missing '{name}'"));
    }
    let v: f64 = raw
        .parse()
        .map_err(|_| format!("non-numeric '{name}': {raw:?}"))?;
    if v.is_finite() {
        Ok(v)
    } else {
        Err(format!("non-finite '{name}': {raw:?}"))
    }
}

/// Path-free spec for in-memory readers.
pub fn default_spec() -> IngestSpec {
    IngestSpec::new(Path::new("<memory>"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn groups_rows_and_reports_bad_ones() {
        let csv = "\u{feff}UID,x,y,site\n\
                   p1,0,0,north\n\
                   p1,29,NA,north\n\
                   p2,0,1.5,south\n\
                   p1,36,0.67,\n\
                   ,1,1,\n\
                   p2,10,abc,south\n";
        let data = read_groups(csv.as_bytes(), &default_spec()).unwrap();

        assert_eq!(data.rows_read, 6);
        assert_eq!(data.rows_used, 3);
        assert_eq!(data.groups.len(), 2);
        assert_eq!(data.groups[0].uid, "p1");
        assert_eq!(data.groups[0].x, vec![0.0, 36.0]);
        assert_eq!(data.groups[0].meta["site"], "north");
        assert_eq!(data.row_errors.len(), 3);
        assert_eq!(data.row_errors[0].line, 3);
    }

    #[test]
    fn missing_column_is_a_schema_error() {
        let err = read_groups("uid,t,y\na,1,2\n".as_bytes(), &default_spec()).unwrap_err();
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn custom_column_names() {
        let spec = IngestSpec {
            x_col: "t".into(),
            uid_col: "plot".into(),
            ..default_spec()
        };
        let data = read_groups("plot,t,y\na,1,2\na,2,4\n".as_bytes(), &spec).unwrap();
        assert_eq!(data.groups[0].y, vec![2.0, 4.0]);
    }
}
