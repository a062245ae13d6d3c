//! Diet matching: predator/prey interaction strengths from a diet table.
//!
//! For predator `i` the interaction with prey `j` is proportional to the
//! observed diet share divided by the prey biomass, normalised per row:
//!
//! ```text
//! theta_ij = (diet_ij / B_j) / sum_k (diet_ik / B_k)
//! ```
//!
//! The predator then sees the interaction-weighted prey biomass
//! `sum_j theta_ij B_j` as its prey density, and its search volume is rescaled
//! so the prey encounter rate (and therefore growth) is unchanged.

use std::collections::BTreeMap;

use log::{info, warn};
use serde::Serialize;

use crate::calibration::SpeciesCalibration;
use crate::domain::{CalibrationStage, DietEntry};
use crate::error::CalibrationError;

/// Row-normalised predator x prey interaction matrix.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InteractionMatrix {
    /// Row and column labels.
    pub species: Vec<String>,
    /// `values[i][j]`: interaction of predator `i` with prey `j`.
    pub values: Vec<Vec<f64>>,
}

impl InteractionMatrix {
    pub fn get(&self, predator: &str, prey: &str) -> Option<f64> {
        let i = self.species.iter().position(|s| s == predator)?;
        let j = self.species.iter().position(|s| s == prey)?;
        Some(self.values[i][j])
    }
}

/// Derive interactions from `diet` and rescale predators' search volumes.
///
/// Every species named in the diet table must be at least
/// [`CalibrationStage::ConsumptionMatched`]. Species not named keep their
/// record unchanged. Running this twice on its own output changes nothing.
pub fn match_diet(
    records: &[SpeciesCalibration],
    diet: &[DietEntry],
) -> Result<(Vec<SpeciesCalibration>, InteractionMatrix), CalibrationError> {
    let index: BTreeMap<&str, usize> = records
        .iter()
        .enumerate()
        .map(|(i, r)| (r.species(), i))
        .collect();

    // Validate every row before touching any record.
    for entry in diet {
        for name in [&entry.predator, &entry.prey] {
            let Some(&i) = index.get(name.as_str()) else {
                return Err(CalibrationError::structural(
                    name.as_str(),
                    "species appears in the diet table but not in the species table",
                ));
            };
            let record = &records[i];
            if record.stage < CalibrationStage::ConsumptionMatched {
                return Err(CalibrationError::StageOrder {
                    species: name.clone(),
                    attempted: CalibrationStage::DietMatched,
                    required: CalibrationStage::ConsumptionMatched,
                    current: record.stage,
                });
            }
        }
        if !(entry.proportion.is_finite() && entry.proportion >= 0.0) {
            return Err(CalibrationError::structural(
                &entry.predator,
                format!("diet proportion of '{}' must be non-negative (got {})", entry.prey, entry.proportion),
            ));
        }
    }

    let biomass: Vec<f64> = records.iter().map(prey_biomass).collect::<Result<_, _>>()?;
    let len = records.len();
    let mut values = vec![vec![0.0; len]; len];
    for entry in diet {
        let i = index[entry.predator.as_str()];
        let j = index[entry.prey.as_str()];
        values[i][j] += entry.proportion / biomass[j];
    }

    let mut out = records.to_vec();
    let mut participants = vec![false; len];
    for entry in diet {
        participants[index[entry.predator.as_str()]] = true;
        participants[index[entry.prey.as_str()]] = true;
    }

    for i in 0..len {
        let row_sum: f64 = values[i].iter().sum();
        if row_sum > 0.0 {
            for v in &mut values[i] {
                *v /= row_sum;
            }
            let density: f64 = values[i].iter().zip(&biomass).map(|(t, b)| t * b).sum();
            let params = &mut out[i].params;
            let encounter = params.gamma * params.prey_density;
            params.gamma = encounter / density;
            params.prey_density = density;
            info!(
                "{}: prey density {density:.4e}, search volume {:.4e}",
                params.species, params.gamma
            );
        } else if participants[i] {
            warn!("{}: no diet rows as predator, search volume unchanged", out[i].species());
        }
    }

    let out = out
        .into_iter()
        .zip(&participants)
        .map(|(mut record, &participates)| {
            if participates && record.stage < CalibrationStage::DietMatched {
                info!("{}: {} -> {}", record.species(), record.stage, CalibrationStage::DietMatched);
                record.stage = CalibrationStage::DietMatched;
            }
            record
        })
        .collect();

    let matrix = InteractionMatrix {
        species: records.iter().map(|r| r.species().to_string()).collect(),
        values,
    };
    Ok((out, matrix))
}

/// Biomass a species offers as prey: the observation, else the model value.
fn prey_biomass(record: &SpeciesCalibration) -> Result<f64, CalibrationError> {
    let biomass = match (record.params.biomass_observed, &record.state) {
        (Some(b), _) => b,
        (None, Some(state)) => state.biomass(),
        (None, None) => f64::NAN,
    };
    if biomass.is_finite() && biomass > 0.0 {
        Ok(biomass)
    } else {
        Err(CalibrationError::structural(
            record.species(),
            format!("prey biomass must be positive (got {biomass})"),
        ))
    }
}
