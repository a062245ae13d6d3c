//! Calibration snapshot JSON.
//!
//! The snapshot is the complete record of a run:
//! - run settings and a UTC timestamp
//! - per species: final stage, error (if aborted), parameters, gears,
//!   steady-state aggregates and the catch-fit summary
//! - the diet interaction matrix, when diet matching ran

use std::fs::File;
use std::io::Write;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::calibration::{CalibrationReport, InteractionMatrix, SpeciesCalibration};
use crate::domain::{CalibrationConfig, CalibrationStage};
use crate::error::AppError;

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotSettings {
    pub grid_points: usize,
    pub yield_lambda: f64,
    pub production_lambda: f64,
    pub restarts: usize,
    pub seed: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SpeciesAggregates {
    pub biomass: f64,
    pub yield_rate: f64,
    pub production: f64,
    pub consumption: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SpeciesSnapshot<'a> {
    pub species: &'a str,
    pub stage: CalibrationStage,
    pub error: Option<String>,
    pub aggregates: Option<SpeciesAggregates>,
    pub calibration: &'a SpeciesCalibration,
}

#[derive(Debug, Clone, Serialize)]
pub struct CalibrationSnapshot<'a> {
    pub tool: &'static str,
    pub version: &'static str,
    pub created_at: DateTime<Utc>,
    pub settings: SnapshotSettings,
    pub species: Vec<SpeciesSnapshot<'a>>,
    pub interactions: Option<&'a InteractionMatrix>,
}

impl<'a> CalibrationSnapshot<'a> {
    pub fn new(report: &'a CalibrationReport, config: &CalibrationConfig, created_at: DateTime<Utc>) -> Self {
        let species = report
            .outcomes
            .iter()
            .map(|outcome| {
                let record = outcome.record();
                SpeciesSnapshot {
                    species: record.species(),
                    stage: record.stage,
                    error: outcome.error().map(|e| e.to_string()),
                    aggregates: record.state.as_ref().map(|s| SpeciesAggregates {
                        biomass: s.biomass(),
                        yield_rate: s.yield_rate(),
                        production: s.production(),
                        consumption: s.consumption(),
                    }),
                    calibration: record,
                }
            })
            .collect();
        Self {
            tool: "scal",
            version: env!("CARGO_PKG_VERSION"),
            created_at,
            settings: SnapshotSettings {
                grid_points: config.grid_points,
                yield_lambda: config.yield_lambda,
                production_lambda: config.production_lambda,
                restarts: config.restarts,
                seed: config.seed,
            },
            species,
            interactions: report.interactions.as_ref(),
        }
    }
}

/// Write a calibration snapshot JSON file, timestamped now.
pub fn write_snapshot_json(path: &Path, report: &CalibrationReport, config: &CalibrationConfig) -> Result<(), AppError> {
    write_json(path, &CalibrationSnapshot::new(report, config, Utc::now()))
}

/// Write any serializable analysis result (multi-start summary, profile) as JSON.
pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), AppError> {
    let file = File::create(path)
        .map_err(|e| AppError::new(2, format!("Failed to create JSON '{}': {e}", path.display())))?;
    write_json_to(file, value)
}

pub fn write_json_to<W: Write, T: Serialize>(writer: W, value: &T) -> Result<(), AppError> {
    serde_json::to_writer_pretty(writer, value)
        .map_err(|e| AppError::new(2, format!("Failed to write JSON: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::{fixtures, SpeciesOutcome};
    use crate::error::CalibrationError;

    #[test]
    fn snapshot_carries_stage_and_error() {
        let record = fixtures::biomass_matched(fixtures::gear());
        let mut raw = crate::calibration::SpeciesCalibration::new(fixtures::species(), &[]);
        raw.params.species = "whiting".to_string();
        let report = CalibrationReport {
            outcomes: vec![
                SpeciesOutcome::Calibrated(record),
                SpeciesOutcome::Aborted {
                    record: raw,
                    error: CalibrationError::structural("whiting", "w_mat must be below w_max"),
                },
            ],
            interactions: None,
        };
        let created_at = DateTime::parse_from_rfc3339("2024-05-01T12:00:00Z").unwrap().with_timezone(&Utc);
        let snapshot = CalibrationSnapshot::new(&report, &CalibrationConfig::default(), created_at);

        let mut buf = Vec::new();
        write_json_to(&mut buf, &snapshot).unwrap();
        let json: serde_json::Value = serde_json::from_slice(&buf).unwrap();

        assert_eq!(json["tool"], "scal");
        assert_eq!(json["created_at"], "2024-05-01T12:00:00Z");
        assert_eq!(json["species"][0]["stage"], "biomass_matched");
        assert!(json["species"][0]["error"].is_null());
        let biomass = json["species"][0]["aggregates"]["biomass"].as_f64().unwrap();
        assert!((biomass - 1000.0).abs() < 1e-6);
        assert_eq!(json["species"][1]["stage"], "raw");
        assert!(json["species"][1]["error"].as_str().unwrap().contains("w_mat"));
        assert!(json["species"][1]["aggregates"].is_null());
        assert!(json["interactions"].is_null());
    }
}
