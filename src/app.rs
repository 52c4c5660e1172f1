//! Top-level application orchestration.
//!
//! `src/main.rs` is intentionally tiny; this module is the "real main" that:
//! - parses CLI arguments and sets up logging
//! - runs per-group fits
//! - evaluates requested functionals
//! - prints reports and writes optional exports

use clap::Parser;

use crate::cli::{Command, FitArgs, InferArgs, InferenceArgs};
use crate::domain::FitRecord;
use crate::error::AppError;
use crate::models::CurveRegistry;

pub mod pipeline;

/// Entry point for the `flex` binary.
pub fn run() -> Result<(), AppError> {
    let cli = crate::cli::Cli::parse();

    // Logs go to stderr so reports on stdout stay pipeable.
    let _ = tracing_subscriber::fmt()
        .with_max_level(cli.log_level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();

    let registry = CurveRegistry::builtin();
    match cli.command {
        Command::Fit(args) => handle_fit(args, registry),
        Command::Infer(args) => handle_infer(args, registry),
        Command::Curves => {
            print!("{}", crate::report::format_curves(registry));
            Ok(())
        }
    }
}

fn handle_fit(args: FitArgs, registry: &CurveRegistry) -> Result<(), AppError> {
    let progress: Option<&crate::fit::ProgressFn<'_>> = if args.progress {
        Some(&pipeline::print_progress)
    } else {
        None
    };
    let out = pipeline::run_fit(&args, registry, progress)?;

    print!(
        "{}",
        crate::report::format_run_summary(&out.ingest, &out.spec, &out.run)
    );
    let records: Vec<&FitRecord> = out.run.records.values().collect();
    let level = args.inference.level.unwrap_or(0.95);
    print!("{}", crate::report::format_coefficients(&records, level));

    // Optional exports.
    if let Some(path) = &args.export {
        let failures = out
            .run
            .failures
            .iter()
            .map(|(uid, e)| (uid.clone(), e.to_string()))
            .collect();
        crate::io::export::write_records_json(path, &args.curve, records.iter().copied(), failures)?;
    }
    if let Some(path) = &args.export_metrics {
        crate::io::export::write_metrics_csv(path, &out.run.metrics)?;
    }

    infer_and_report(&args.inference, &out.run.records, registry)
}

fn handle_infer(args: InferArgs, registry: &CurveRegistry) -> Result<(), AppError> {
    if args.inference.is_empty() {
        return Err(AppError::new(
            2,
            "Nothing to evaluate: pass --predict, --derivative, --auc, --formula or --inverse",
        ));
    }
    let file = crate::io::export::read_records_json(&args.records)?;
    let records = file.into_map();
    infer_and_report(&args.inference, &records, registry)
}

fn infer_and_report(
    args: &InferenceArgs,
    records: &std::collections::BTreeMap<String, FitRecord>,
    registry: &CurveRegistry,
) -> Result<(), AppError> {
    if args.is_empty() {
        return Ok(());
    }

    let tables = pipeline::run_inference(args, records, registry)?;
    for (title, table) in &tables {
        println!("{}", crate::report::format_inference(title, table));
    }

    if let Some(path) = &args.export_inference {
        let rows: Vec<_> = tables
            .into_iter()
            .flat_map(|(_, table)| table.rows)
            .collect();
        crate::io::export::write_inference_csv(path, &rows)?;
    }
    Ok(())
}
