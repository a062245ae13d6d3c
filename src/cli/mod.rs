//! Command-line parsing for the size-spectrum calibrator.
//!
//! The goal of this module is to keep **argument parsing** and **command dispatch**
//! separate from the modeling/math code.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

/// Top-level CLI.
#[derive(Debug, Parser)]
#[command(name = "scal", version, about = "Size-spectrum fishery model calibration")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

/// CLI subcommands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the full calibration pipeline, print a summary, and optionally export.
    Run(RunArgs),
    /// Evaluate the catch objective of one species at a parameter vector.
    Objective(ObjectiveArgs),
    /// Run the optimizer once on the catch objective of one species.
    Optimize(OptimizeArgs),
    /// Optimize from many jittered starts and report robustness diagnostics.
    Multistart(MultiStartArgs),
    /// Profile the catch objective along one parameter.
    Profile(ProfileArgs),
}

/// Input CSV tables.
#[derive(Debug, Args, Clone)]
pub struct TableArgs {
    /// Species parameter table.
    #[arg(long, value_name = "CSV")]
    pub species: PathBuf,

    /// Gear parameter table (species x gear).
    #[arg(long, value_name = "CSV")]
    pub gears: PathBuf,

    /// Catch-at-length table (species, gear, length, dl, count).
    #[arg(long, value_name = "CSV")]
    pub catch: PathBuf,

    /// Ecopath basic estimates (biomass, Q/B, P/Q) per group.
    #[arg(long, value_name = "CSV")]
    pub ecopath: Option<PathBuf>,

    /// Diet composition (predator, prey, proportion).
    #[arg(long, value_name = "CSV")]
    pub diet: Option<PathBuf>,

    /// Stomach-content kernel fits.
    #[arg(long, value_name = "CSV")]
    pub kernels: Option<PathBuf>,
}

/// Numerical settings shared by all subcommands.
#[derive(Debug, Args, Clone)]
pub struct TuningArgs {
    /// Nodes on the log-spaced weight grid.
    #[arg(long, default_value_t = 200)]
    pub grid_points: usize,

    /// Weight of the relative yield error (0 disables the term).
    #[arg(long, default_value_t = 1.0)]
    pub yield_lambda: f64,

    /// Weight of the relative production error (0 disables the term).
    #[arg(long, default_value_t = 1.0)]
    pub production_lambda: f64,

    /// Catchability is floored at this value before optimization.
    #[arg(long, default_value_t = 1e-8)]
    pub catchability_floor: f64,

    /// Jittered retries after a failed catch fit.
    #[arg(long, default_value_t = 3)]
    pub restarts: usize,

    /// Seed for jittered starts.
    #[arg(long, default_value_t = 42)]
    pub seed: u64,

    /// Optimizer iteration cap.
    #[arg(long, default_value_t = 500)]
    pub max_iterations: usize,
}

#[derive(Debug, Args, Clone)]
pub struct RunArgs {
    #[command(flatten)]
    pub tables: TableArgs,

    #[command(flatten)]
    pub tuning: TuningArgs,

    /// Export the calibrated species table to CSV.
    #[arg(long = "export-species", value_name = "CSV")]
    pub export_species: Option<PathBuf>,

    /// Export the calibrated gear table to CSV.
    #[arg(long = "export-gears", value_name = "CSV")]
    pub export_gears: Option<PathBuf>,

    /// Export the full calibration snapshot to JSON.
    #[arg(long = "export-json", value_name = "JSON")]
    pub export_json: Option<PathBuf>,

    /// Show at most this many skipped input rows.
    #[arg(long, default_value_t = 10)]
    pub show_row_errors: usize,
}

/// Which catch objective to act on.
#[derive(Debug, Args, Clone)]
pub struct TargetArgs {
    #[command(flatten)]
    pub tables: TableArgs,

    #[command(flatten)]
    pub tuning: TuningArgs,

    /// Species to analyse.
    #[arg(long, value_name = "SPECIES")]
    pub name: String,

    /// Gear to analyse (defaults to the first gear with catch data).
    #[arg(long)]
    pub gear: Option<String>,
}

#[derive(Debug, Args, Clone)]
pub struct ObjectiveArgs {
    #[command(flatten)]
    pub target: TargetArgs,

    /// Parameter vector in natural units, comma separated (defaults to the current gear).
    #[arg(long, value_delimiter = ',', allow_hyphen_values = true)]
    pub theta: Vec<f64>,
}

#[derive(Debug, Args, Clone)]
pub struct OptimizeArgs {
    #[command(flatten)]
    pub target: TargetArgs,

    /// Starting vector in natural units, comma separated (defaults to the current gear).
    #[arg(long, value_delimiter = ',', allow_hyphen_values = true)]
    pub start: Vec<f64>,
}

#[derive(Debug, Args, Clone)]
pub struct MultiStartArgs {
    #[command(flatten)]
    pub target: TargetArgs,

    /// Number of jittered starts.
    #[arg(long, default_value_t = 30)]
    pub runs: usize,

    /// Objective distance from the best run that still counts as equivalent.
    #[arg(long, default_value_t = 0.5)]
    pub band: f64,

    /// Export the summary (all runs) to JSON.
    #[arg(long = "export-json", value_name = "JSON")]
    pub export_json: Option<PathBuf>,
}

#[derive(Debug, Args, Clone)]
pub struct ProfileArgs {
    #[command(flatten)]
    pub target: TargetArgs,

    /// Parameter to profile (e.g. mu_mat, l50, catchability).
    #[arg(long, default_value = "mu_mat")]
    pub param: String,

    /// Grid values of the profiled parameter, comma separated.
    #[arg(long, value_delimiter = ',', required = true)]
    pub values: Vec<f64>,

    /// Objective range below which the profile is reported as flat.
    #[arg(long, default_value_t = 0.5)]
    pub band: f64,

    /// Export the profile to JSON.
    #[arg(long = "export-json", value_name = "JSON")]
    pub export_json: Option<PathBuf>,
}
