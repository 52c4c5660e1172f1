//! Command-line parsing for the per-group curve fitter.
//!
//! The goal of this module is to keep **argument parsing** and **command dispatch**
//! separate from the fitting/inference code.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::domain::SeInterval;

/// Top-level CLI.
#[derive(Debug, Parser)]
#[command(name = "flex", version, about = "Per-group nonlinear curve fitting with delta-method inference")]
pub struct Cli {
    /// Log verbosity level (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "warn")]
    pub log_level: tracing::Level,

    #[command(subcommand)]
    pub command: Command,
}

/// CLI subcommands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Fit a curve to every group of a long-format CSV, print diagnostics, and
    /// optionally evaluate functionals and export results.
    Fit(FitArgs),
    /// Evaluate functionals against records exported by `flex fit --export`.
    Infer(InferArgs),
    /// List the registered curves and their parameters.
    Curves,
}

/// Options for fitting.
#[derive(Debug, Args, Clone)]
pub struct FitArgs {
    /// Long-format CSV with one row per observation.
    #[arg(long, value_name = "CSV")]
    pub data: PathBuf,

    /// Column holding the group id.
    #[arg(long, default_value = "uid")]
    pub uid_col: String,

    /// Column holding the independent variable.
    #[arg(long, default_value = "x")]
    pub x_col: String,

    /// Column holding the response.
    #[arg(long, default_value = "y")]
    pub y_col: String,

    /// Registered curve name (see `flex curves`).
    #[arg(short = 'c', long)]
    pub curve: String,

    /// Initial values shared by all groups, e.g. `t1=40,t2=70,k=100`.
    #[arg(long, value_parser = parse_assignment, value_delimiter = ',', required = true)]
    pub init: Vec<(String, f64)>,

    /// Parameters held fixed for all groups, e.g. `k=100`.
    #[arg(long, value_parser = parse_assignment, value_delimiter = ',')]
    pub fixed: Vec<(String, f64)>,

    /// Lower bounds, e.g. `t1=0,t2=0`.
    #[arg(long, value_parser = parse_assignment, value_delimiter = ',')]
    pub lower: Vec<(String, f64)>,

    /// Upper bounds, e.g. `k=120`.
    #[arg(long, value_parser = parse_assignment, value_delimiter = ',')]
    pub upper: Vec<(String, f64)>,

    /// Solvers to try, in tie-break order.
    #[arg(long, value_delimiter = ',', default_value = "nelder_mead,lbfgsb")]
    pub solvers: Vec<String>,

    /// Iteration cap per solver call.
    #[arg(long, default_value_t = 2000)]
    pub max_iters: u64,

    /// Convergence tolerance.
    #[arg(long, default_value_t = 1e-10)]
    pub tolerance: f64,

    /// Extra random starts for the multistart solver.
    #[arg(long, default_value_t = 5)]
    pub restarts: usize,

    /// Seed for solvers that draw random numbers.
    #[arg(long, default_value_t = 42)]
    pub seed: u64,

    /// Fit groups on a worker pool.
    #[arg(long)]
    pub parallel: bool,

    /// Worker count for `--parallel` (0 = one per core).
    #[arg(long, default_value_t = 0)]
    pub workers: usize,

    /// Print a line to stderr as each group finishes.
    #[arg(long)]
    pub progress: bool,

    /// Write fit records (JSON) for later `flex infer`.
    #[arg(long, value_name = "JSON")]
    pub export: Option<PathBuf>,

    /// Write the per-solver metrics table (CSV).
    #[arg(long = "export-metrics", value_name = "CSV")]
    pub export_metrics: Option<PathBuf>,

    #[command(flatten)]
    pub inference: InferenceArgs,
}

/// Options for inference on saved records.
#[derive(Debug, Args, Clone)]
pub struct InferArgs {
    /// Records JSON produced by `flex fit --export`.
    #[arg(long, value_name = "JSON")]
    pub records: PathBuf,

    #[command(flatten)]
    pub inference: InferenceArgs,
}

/// Functional requests shared by `fit` and `infer`.
#[derive(Debug, Args, Clone, Default)]
pub struct InferenceArgs {
    /// Restrict inference to these groups (default: all).
    #[arg(long, value_delimiter = ',')]
    pub uids: Vec<String>,

    /// Point predictions at these x values.
    #[arg(long, value_delimiter = ',')]
    pub predict: Vec<f64>,

    /// Standard error flavour for `--predict`.
    #[arg(long, value_enum, default_value_t = IntervalArg::Confidence)]
    pub interval: IntervalArg,

    /// Derivatives at these x values.
    #[arg(long, value_delimiter = ',')]
    pub derivative: Vec<f64>,

    /// Derivative order (1 or 2).
    #[arg(long, default_value_t = 1)]
    pub order: u8,

    /// Area under the curve over `lo:hi`.
    #[arg(long, value_parser = parse_range)]
    pub auc: Option<(f64, f64)>,

    /// Trapezoid nodes for `--auc`.
    #[arg(long, default_value_t = 100)]
    pub auc_points: usize,

    /// Formula of the parameters, e.g. `t2 - t1` (repeatable).
    #[arg(long)]
    pub formula: Vec<String>,

    /// Inverse prediction: x at which the curve reaches this y.
    #[arg(long)]
    pub inverse: Option<f64>,

    /// Add confidence bands at this level (e.g. 0.95).
    #[arg(long)]
    pub level: Option<f64>,

    /// Write all inference rows (CSV).
    #[arg(long = "export-inference", value_name = "CSV")]
    pub export_inference: Option<PathBuf>,
}

impl InferenceArgs {
    pub fn is_empty(&self) -> bool {
        self.predict.is_empty()
            && self.derivative.is_empty()
            && self.auc.is_none()
            && self.formula.is_empty()
            && self.inverse.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum IntervalArg {
    #[default]
    Confidence,
    Prediction,
}

impl From<IntervalArg> for SeInterval {
    fn from(arg: IntervalArg) -> Self {
        match arg {
            IntervalArg::Confidence => SeInterval::Confidence,
            IntervalArg::Prediction => SeInterval::Prediction,
        }
    }
}

/// Parse `name=value`.
pub fn parse_assignment(s: &str) -> Result<(String, f64), String> {
    let (name, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected name=value, got '{s}'"))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(format!("missing parameter name in '{s}'"));
    }
    let value: f64 = value
        .trim()
        .parse()
        .map_err(|_| format!("invalid number in '{s}'"))?;
    Ok((name.to_string(), value))
}

/// Parse `lo:hi`.
pub fn parse_range(s: &str) -> Result<(f64, f64), String> {
    let (lo, hi) = s
        .split_once(':')
        .ok_or_else(|| format!("expected lo:hi, got '{s}'"))?;
    let lo: f64 = lo.trim().parse().map_err(|_| format!("invalid lower bound in '{s}'"))?;
    let hi: f64 = hi.trim().parse().map_err(|_| format!("invalid upper bound in '{s}'"))?;
    Ok((lo, hi))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assignments_and_ranges() {
        assert_eq!(parse_assignment(" t1 = 40 ").unwrap(), ("t1".to_string(), 40.0));
        assert!(parse_assignment("t1").is_err());
        assert!(parse_assignment("=3").is_err());
        assert_eq!(parse_range("0:100").unwrap(), (0.0, 100.0));
        assert!(parse_range("0-100").is_err());
    }

    #[test]
    fn fit_command_parses() {
        let cli = Cli::try_parse_from([
            "flex",
            "fit",
            "--data",
            "plots.csv",
            "--curve",
            "linear_plateau",
            "--init",
            "t1=40,t2=70,k=100",
            "--predict",
            "45,50",
            "--formula",
            "t2 - t1",
            "--parallel",
        ])
        .unwrap();
        let Command::Fit(args) = cli.command else {
            panic!("expected fit");
        };
        assert_eq!(args.init.len(), 3);
        assert_eq!(args.solvers, vec!["nelder_mead", "lbfgsb"]);
        assert_eq!(args.inference.predict, vec![45.0, 50.0]);
        assert!(args.parallel);
        assert_eq!(cli.log_level, tracing::Level::WARN);
    }
}
