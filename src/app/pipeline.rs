//! Shared pipeline logic behind the CLI subcommands.
//!
//! Keeping this in one place avoids duplicating the core workflow:
//! table ingest -> calibration (or objective setup) -> report
//!
//! The subcommand handlers can then focus on presentation.

use log::info;

use crate::calibration::{calibrate, prepare_objective, CalibrationReport, SpeciesCalibration};
use crate::cli::TargetArgs;
use crate::domain::CalibrationConfig;
use crate::error::AppError;
use crate::fit::{CatchObjective, Optimizer};
use crate::io::{load_input, IngestedData, InputPaths};

/// All computed outputs of a single `scal run`.
#[derive(Debug, Clone)]
pub struct RunOutput {
    pub ingest: IngestedData,
    pub report: CalibrationReport,
}

/// Read the tables and calibrate every species.
pub fn run_calibration(paths: &InputPaths, config: &CalibrationConfig) -> Result<RunOutput, AppError> {
    let ingest = load_input(paths)?;
    info!(
        "read {} rows ({} skipped) from {} species",
        ingest.rows_read,
        ingest.row_errors.len(),
        ingest.input.species.len()
    );
    let report = calibrate(&ingest.input, config)?;
    Ok(RunOutput { ingest, report })
}

/// A biomass-matched species and the catch objective of one of its gears.
#[derive(Debug, Clone)]
pub struct Target {
    pub record: SpeciesCalibration,
    pub objective: CatchObjective,
    pub optimizer: Optimizer,
}

impl Target {
    /// `theta` when given, else the parameters of the current gear.
    pub fn theta_or_initial(&self, theta: &[f64]) -> Result<Vec<f64>, AppError> {
        if theta.is_empty() {
            return Ok(self.objective.initial_theta().to_vec());
        }
        let layout = self.objective.layout();
        if theta.len() != layout.len() {
            return Err(AppError::new(
                2,
                format!(
                    "Expected {} parameters ({}), got {}.",
                    layout.len(),
                    layout.names().join(", "),
                    theta.len()
                ),
            ));
        }
        Ok(theta.to_vec())
    }
}

/// Read the tables and set up the catch objective named by `args`.
pub fn prepare_target(args: &TargetArgs, config: &CalibrationConfig) -> Result<Target, AppError> {
    let ingest = load_input(&crate::app::input_paths(&args.tables))?;
    let (record, objective) = prepare_objective(&ingest.input, &args.name, args.gear.as_deref(), config)?;
    Ok(Target {
        record,
        objective,
        optimizer: Optimizer::new(config.optimizer.clone()),
    })
}
