//! Batch entry points: the full pipeline and single-species objective setup.

use std::collections::BTreeSet;

use log::{info, warn};
use rayon::prelude::*;

use crate::calibration::{match_diet, InteractionMatrix, SpeciesCalibration};
use crate::domain::{
    CalibrationConfig, CalibrationStage, DietEntry, EcopathEstimate, GearParams, KernelFit,
    ObservedCatch, SpeciesParams,
};
use crate::error::CalibrationError;
use crate::fit::CatchObjective;

/// Input tables of a calibration run.
#[derive(Debug, Clone, Default)]
pub struct CalibrationInput {
    pub species: Vec<SpeciesParams>,
    pub gears: Vec<GearParams>,
    pub catches: Vec<ObservedCatch>,
    pub ecopath: Vec<EcopathEstimate>,
    pub diet: Vec<DietEntry>,
    pub kernels: Vec<KernelFit>,
}

impl CalibrationInput {
    /// Species table with Ecopath estimates and kernel fits applied.
    pub fn prepared_species(&self) -> Vec<SpeciesParams> {
        self.species
            .iter()
            .map(|sp| {
                let mut sp = sp.clone();
                if let Some(estimate) = self.ecopath.iter().find(|e| e.group == sp.species) {
                    sp.apply_ecopath(estimate);
                }
                if let Some(fit) = self.kernels.iter().find(|k| k.species == sp.species) {
                    sp.apply_kernel_fit(fit);
                }
                sp
            })
            .collect()
    }

    fn catches_for<'a>(&'a self, species: &'a str) -> impl Iterator<Item = &'a ObservedCatch> + 'a {
        self.catches.iter().filter(move |c| c.species == species)
    }
}

/// How far one species got.
#[derive(Debug, Clone)]
pub enum SpeciesOutcome {
    Calibrated(SpeciesCalibration),
    /// Calibration stopped on a non-fatal error; `record` is the last good state.
    Aborted {
        record: SpeciesCalibration,
        error: CalibrationError,
    },
}

impl SpeciesOutcome {
    pub fn record(&self) -> &SpeciesCalibration {
        match self {
            SpeciesOutcome::Calibrated(record) | SpeciesOutcome::Aborted { record, .. } => record,
        }
    }

    pub fn error(&self) -> Option<&CalibrationError> {
        match self {
            SpeciesOutcome::Calibrated(_) => None,
            SpeciesOutcome::Aborted { error, .. } => Some(error),
        }
    }
}

/// Result of [`calibrate`].
#[derive(Debug, Clone)]
pub struct CalibrationReport {
    pub outcomes: Vec<SpeciesOutcome>,
    pub interactions: Option<InteractionMatrix>,
}

impl CalibrationReport {
    /// Updated species table (last good state of every species).
    pub fn species_table(&self) -> Vec<SpeciesParams> {
        self.outcomes.iter().map(|o| o.record().params.clone()).collect()
    }

    /// Updated gear table.
    pub fn gear_table(&self) -> Vec<GearParams> {
        self.outcomes
            .iter()
            .flat_map(|o| o.record().gears.iter().cloned())
            .collect()
    }

    pub fn failures(&self) -> impl Iterator<Item = &SpeciesOutcome> {
        self.outcomes.iter().filter(|o| o.error().is_some())
    }
}

/// Run the ordered pipeline for every species, in parallel across species.
///
/// Stages whose observations are missing are skipped (and end the species'
/// pipeline there). Structural and numeric errors abort only the affected
/// species; a stage-order error aborts the whole run.
pub fn calibrate(input: &CalibrationInput, config: &CalibrationConfig) -> Result<CalibrationReport, CalibrationError> {
    check_unique_species(&input.species)?;
    let species = input.prepared_species();

    let outcomes: Vec<SpeciesOutcome> = species
        .into_par_iter()
        .map(|sp| calibrate_species(sp, input, config))
        .collect::<Result<_, _>>()?;

    for outcome in &outcomes {
        if let Some(err) = outcome.error() {
            warn!("{err}");
        }
    }

    if input.diet.is_empty() {
        return Ok(CalibrationReport {
            outcomes,
            interactions: None,
        });
    }
    diet_stage(outcomes, &input.diet)
}

fn check_unique_species(species: &[SpeciesParams]) -> Result<(), CalibrationError> {
    let mut seen = BTreeSet::new();
    for sp in species {
        if !seen.insert(sp.species.as_str()) {
            return Err(CalibrationError::structural(&sp.species, "species appears twice in the species table"));
        }
    }
    Ok(())
}

fn calibrate_species(
    sp: SpeciesParams,
    input: &CalibrationInput,
    config: &CalibrationConfig,
) -> Result<SpeciesOutcome, CalibrationError> {
    let mut record = SpeciesCalibration::new(sp, &input.gears);
    match advance(&mut record, input, config) {
        Ok(()) => Ok(SpeciesOutcome::Calibrated(record)),
        Err(err) if err.is_fatal() => Err(err),
        Err(error) => Ok(SpeciesOutcome::Aborted { record, error }),
    }
}

/// Push `record` through every stage its data allows, updating it in place
/// after each completed stage.
fn advance(
    record: &mut SpeciesCalibration,
    input: &CalibrationInput,
    config: &CalibrationConfig,
) -> Result<(), CalibrationError> {
    *record = record.match_growth(config)?;
    *record = record.steady_state(config)?;
    if record.params.biomass_observed.is_none() {
        info!("{}: no observed biomass, stopping at {}", record.species(), record.stage);
        return Ok(());
    }
    *record = record.match_biomasses()?;

    let species = record.species().to_string();
    let catches: Vec<&ObservedCatch> = input.catches_for(&species).collect();
    if catches.is_empty() {
        info!("{}: no catch data, stopping at {}", record.species(), record.stage);
        return Ok(());
    }
    for catch in catches {
        *record = record.match_catch(catch, config)?;
    }

    if record.params.consumption_observed.is_none() {
        info!("{}: no observed consumption, stopping at {}", record.species(), record.stage);
        return Ok(());
    }
    *record = record.match_consumption(config)?;
    Ok(())
}

fn diet_stage(outcomes: Vec<SpeciesOutcome>, diet: &[DietEntry]) -> Result<CalibrationReport, CalibrationError> {
    let ready: BTreeSet<String> = outcomes
        .iter()
        .filter(|o| o.error().is_none() && o.record().stage >= CalibrationStage::ConsumptionMatched)
        .map(|o| o.record().species().to_string())
        .collect();
    let usable: Vec<DietEntry> = diet
        .iter()
        .filter(|e| {
            let keep = ready.contains(&e.predator) && ready.contains(&e.prey);
            if !keep {
                warn!(
                    "diet row {} -> {} skipped: species not consumption-matched",
                    e.predator, e.prey
                );
            }
            keep
        })
        .cloned()
        .collect();

    let ready_records: Vec<SpeciesCalibration> = outcomes
        .iter()
        .filter(|o| ready.contains(o.record().species()))
        .map(|o| o.record().clone())
        .collect();
    let (matched, matrix) = match_diet(&ready_records, &usable)?;

    let outcomes = outcomes
        .into_iter()
        .map(|outcome| match matched.iter().find(|r| r.species() == outcome.record().species()) {
            Some(record) if outcome.error().is_none() => SpeciesOutcome::Calibrated(record.clone()),
            _ => outcome,
        })
        .collect();
    Ok(CalibrationReport {
        outcomes,
        interactions: Some(matrix),
    })
}

/// Carry one species to [`CalibrationStage::BiomassMatched`] and build the
/// catch objective of its first (or named) gear.
///
/// Used by standalone objective evaluation, single optimizer runs and
/// robustness analyses.
pub fn prepare_objective(
    input: &CalibrationInput,
    species: &str,
    gear: Option<&str>,
    config: &CalibrationConfig,
) -> Result<(SpeciesCalibration, CatchObjective), CalibrationError> {
    let Some(sp) = input.prepared_species().into_iter().find(|s| s.species == species) else {
        return Err(CalibrationError::structural(species, "species not found in the species table"));
    };
    let Some(catch) = input
        .catches_for(species)
        .find(|c| gear.is_none_or(|g| c.gear == g))
    else {
        return Err(CalibrationError::structural(species, "no catch data for the requested gear"));
    };

    let mut record = SpeciesCalibration::new(sp, &input.gears)
        .match_growth(config)?
        .steady_state(config)?
        .match_biomasses()?;
    if !record.gears.iter().any(|g| g.gear == catch.gear) {
        record.gears.push(GearParams::default_for(catch));
    }
    let objective = record.objective(catch, config)?;
    Ok((record, objective))
}
