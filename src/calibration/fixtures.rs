//! Synthetic species, gears and catch data shared by unit tests.

use crate::calibration::SpeciesCalibration;
use crate::domain::{
    CalibrationConfig, GearParams, LengthBin, ObservedCatch, SelectivityKind, SpeciesParams,
};
use crate::fit::CatchObjective;

/// Total count of a synthetic catch sample.
pub const SAMPLE_SIZE: f64 = 1e4;

/// A cod-like species maturing at 1 kg after about four years.
pub fn species() -> SpeciesParams {
    SpeciesParams {
        species: "cod".to_string(),
        w_min: 0.001,
        w_max: 5000.0,
        w_mat: 1000.0,
        w_mat25: None,
        a: 0.01,
        b: 3.0,
        n: 0.7,
        p: None,
        d: None,
        alpha: 0.8,
        h: 20.0,
        gamma: 20.0,
        prey_density: 1.0,
        ext_encounter: 10.0,
        ks: 2.0,
        mu_mat: Some(0.3),
        age_mat: Some(4.0),
        biomass_observed: Some(1000.0),
        biomass_cutoff: None,
        consumption_observed: None,
        production_observed: None,
        yield_observed: None,
        beta: 100.0,
        sigma: 2.0,
        kernel_exponent: None,
        kernel_ll: None,
        kernel_ul: None,
        kernel_lr: None,
        kernel_ur: None,
    }
}

pub fn gear() -> GearParams {
    GearParams {
        species: "cod".to_string(),
        gear: "trawl".to_string(),
        sel_func: SelectivityKind::Sigmoid,
        l25: 34.0,
        l50: 40.0,
        l50_right: None,
        l25_right: None,
        catchability: 0.3,
        effort: 1.0,
    }
}

pub fn dome_gear() -> GearParams {
    GearParams {
        sel_func: SelectivityKind::DoubleSigmoid,
        l50_right: Some(60.0),
        l25_right: Some(66.0),
        ..gear()
    }
}

/// 2 cm bins from 20 to 76 cm with the given counts.
pub fn catch_with_counts(counts: impl Fn(usize) -> f64) -> ObservedCatch {
    let bins = (0..28)
        .map(|i| LengthBin {
            length: 20.0 + 2.0 * i as f64,
            dl: 2.0,
            count: counts(i),
        })
        .collect();
    ObservedCatch {
        species: "cod".to_string(),
        gear: "trawl".to_string(),
        bins,
        yield_observed: None,
        production_observed: None,
    }
}

pub fn flat_catch() -> ObservedCatch {
    catch_with_counts(|_| 1.0)
}

/// The fixture species carried through biomass matching with one gear.
pub fn biomass_matched(gear: GearParams) -> SpeciesCalibration {
    let config = CalibrationConfig::default();
    SpeciesCalibration::new(species(), &[gear])
        .match_growth(&config)
        .unwrap()
        .steady_state(&config)
        .unwrap()
        .match_biomasses()
        .unwrap()
}

pub fn objective(record: &SpeciesCalibration, catch: &ObservedCatch) -> CatchObjective {
    record.objective(catch, &CalibrationConfig::default()).unwrap()
}

/// A biomass-matched record and the catch, yield and production it predicts
/// for its own gear parameters.
pub fn synthetic_problem(gear: GearParams) -> (SpeciesCalibration, ObservedCatch) {
    let record = biomass_matched(gear);
    let objective = objective(&record, &flat_catch());
    let predicted = objective.evaluate(objective.initial_theta()).unwrap();
    let total: f64 = predicted.predicted_catch.iter().sum();

    let mut catch = catch_with_counts(|i| predicted.predicted_catch[i] * SAMPLE_SIZE / total);
    catch.yield_observed = Some(predicted.predicted_yield);
    catch.production_observed = Some(predicted.predicted_production);
    (record, catch)
}
