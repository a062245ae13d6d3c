//! Top-level application orchestration.
//!
//! `src/main.rs` is intentionally tiny; this module is the "real main" that:
//! - loads `.env`, installs the logger and sizes the thread pool
//! - parses CLI arguments
//! - reads the input tables and runs the calibration (or one analysis)
//! - prints reports
//! - writes optional exports

use clap::Parser;
use log::warn;

use crate::cli::{Command, MultiStartArgs, ObjectiveArgs, OptimizeArgs, ProfileArgs, RunArgs, TableArgs, TuningArgs};
use crate::domain::CalibrationConfig;
use crate::error::AppError;
use crate::fit::{multi_start, profile, OptimizerConfig};
use crate::io::InputPaths;

pub mod pipeline;

/// Environment variable sizing the rayon pool.
pub const THREADS_ENV: &str = "SCAL_THREADS";

/// Entry point for the `scal` binary.
pub fn run() -> Result<(), AppError> {
    dotenvy::dotenv().ok();
    init_logging();
    init_thread_pool()?;

    let cli = crate::cli::Cli::parse();
    match cli.command {
        Command::Run(args) => handle_run(args),
        Command::Objective(args) => handle_objective(args),
        Command::Optimize(args) => handle_optimize(args),
        Command::Multistart(args) => handle_multistart(args),
        Command::Profile(args) => handle_profile(args),
    }
}

fn init_logging() {
    let env = env_logger::Env::default().default_filter_or("warn");
    // A logger may already be installed when embedded in another binary.
    let _ = env_logger::Builder::from_env(env).format_timestamp(None).try_init();
}

fn init_thread_pool() -> Result<(), AppError> {
    let Ok(value) = std::env::var(THREADS_ENV) else {
        return Ok(());
    };
    let threads: usize = value
        .trim()
        .parse()
        .map_err(|_| AppError::new(2, format!("{THREADS_ENV} must be a positive integer (got '{value}').")))?;
    if let Err(e) = rayon::ThreadPoolBuilder::new().num_threads(threads).build_global() {
        warn!("{THREADS_ENV} ignored: {e}");
    }
    Ok(())
}

fn handle_run(args: RunArgs) -> Result<(), AppError> {
    let config = config_from_args(&args.tuning);
    let run = pipeline::run_calibration(&input_paths(&args.tables), &config)?;

    println!("{}", crate::report::format_run_summary(&run.ingest, &run.report, &config));
    if !run.ingest.row_errors.is_empty() {
        println!("Skipped rows:");
        println!("{}", crate::report::format_row_errors(&run.ingest.row_errors, args.show_row_errors));
    }

    // Optional exports.
    if let Some(path) = &args.export_species {
        crate::io::write_species_csv(path, &run.report)?;
    }
    if let Some(path) = &args.export_gears {
        crate::io::write_gears_csv(path, &run.report)?;
    }
    if let Some(path) = &args.export_json {
        crate::io::write_snapshot_json(path, &run.report, &config)?;
    }

    Ok(())
}

fn handle_objective(args: ObjectiveArgs) -> Result<(), AppError> {
    let config = config_from_args(&args.target.tuning);
    let target = pipeline::prepare_target(&args.target, &config)?;
    let theta = target.theta_or_initial(&args.theta)?;

    let breakdown = target
        .objective
        .evaluate(&theta)
        .map_err(|e| AppError::new(4, format!("{}: {e}", args.target.name)))?;
    println!(
        "{}",
        crate::report::format_breakdown(&args.target.name, target.objective.layout(), &theta, &breakdown)
    );
    Ok(())
}

fn handle_optimize(args: OptimizeArgs) -> Result<(), AppError> {
    let config = config_from_args(&args.target.tuning);
    let target = pipeline::prepare_target(&args.target, &config)?;
    let start = target.theta_or_initial(&args.start)?;

    let result = target.objective.optimize(&start, &target.optimizer);
    println!(
        "{}",
        crate::report::format_optimization(&args.target.name, target.objective.layout(), &result)
    );
    if let Some(reason) = result.failure() {
        return Err(AppError::new(4, format!("{}: optimizer failed ({reason})", args.target.name)));
    }
    Ok(())
}

fn handle_multistart(args: MultiStartArgs) -> Result<(), AppError> {
    let mut config = config_from_args(&args.target.tuning);
    config.multistart.runs = args.runs;
    config.multistart.band = args.band;
    let target = pipeline::prepare_target(&args.target, &config)?;

    let summary = multi_start(
        &target.objective,
        target.objective.initial_theta(),
        &target.optimizer,
        &config.multistart,
    );
    println!("{}", crate::report::format_multistart(&summary, target.objective.layout()));
    if let Some(path) = &args.export_json {
        crate::io::write_json(path, &summary)?;
    }
    Ok(())
}

fn handle_profile(args: ProfileArgs) -> Result<(), AppError> {
    let config = config_from_args(&args.target.tuning);
    let target = pipeline::prepare_target(&args.target, &config)?;

    let result = profile(
        &target.objective,
        target.objective.initial_theta(),
        &args.param,
        &args.values,
        &target.optimizer,
        args.band,
    )?;
    println!("{}", crate::report::format_profile(&result));
    if let Some(path) = &args.export_json {
        crate::io::write_json(path, &result)?;
    }
    Ok(())
}

pub fn input_paths(args: &TableArgs) -> InputPaths {
    InputPaths {
        species: args.species.clone(),
        gears: args.gears.clone(),
        catch: args.catch.clone(),
        ecopath: args.ecopath.clone(),
        diet: args.diet.clone(),
        kernels: args.kernels.clone(),
    }
}

pub fn config_from_args(args: &TuningArgs) -> CalibrationConfig {
    let defaults = CalibrationConfig::default();
    CalibrationConfig {
        grid_points: args.grid_points,
        yield_lambda: args.yield_lambda,
        production_lambda: args.production_lambda,
        catchability_floor: args.catchability_floor,
        restarts: args.restarts,
        seed: args.seed,
        optimizer: OptimizerConfig {
            max_iterations: args.max_iterations,
            ..defaults.optimizer
        },
        multistart: crate::fit::MultiStartConfig {
            seed: args.seed,
            ..defaults.multistart
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::Cli;

    #[test]
    fn config_follows_flags() {
        let cli = Cli::parse_from([
            "scal", "run", "--species", "s.csv", "--gears", "g.csv", "--catch", "c.csv", "--yield-lambda", "0",
            "--seed", "7", "--max-iterations", "50",
        ]);
        let Command::Run(args) = cli.command else {
            panic!("expected run");
        };
        let config = config_from_args(&args.tuning);
        assert_eq!(config.yield_lambda, 0.0);
        assert_eq!(config.production_lambda, 1.0);
        assert_eq!(config.seed, 7);
        assert_eq!(config.multistart.seed, 7);
        assert_eq!(config.optimizer.max_iterations, 50);
        assert_eq!(input_paths(&args.tables).catch.to_str(), Some("c.csv"));
    }
}
