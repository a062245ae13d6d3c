//! Per-species calibration record and its ordered stages.
//!
//! Every stage takes the current record by reference and returns the updated
//! record, so a failed stage leaves the caller's copy untouched. A stage may
//! only run once its precondition stage has completed; invoking it earlier is
//! a [`CalibrationError::StageOrder`] error, never silently patched.

use log::{debug, info, warn};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;

use crate::domain::{CalibrationConfig, CalibrationStage, GearParams, ObservedCatch, SpeciesParams};
use crate::error::CalibrationError;
use crate::fit::{
    jittered_start, run_seed, CatchObjective, FailureReason, ObjectiveBreakdown, ObjectiveBuilder,
    OptimizationResult, OptimizationStatus, Optimizer, ParamLayout,
};
use crate::math::solve_decreasing;
use crate::spectrum::{EnergyBudget, SizeSpectrumState, SteadyStateSolver, WeightGrid};

/// Relative tolerance on the growth multiplier.
const GROWTH_TOLERANCE: f64 = 1e-12;
const GROWTH_MAX_ITERATIONS: usize = 200;
/// Tolerance when checking that the metabolic and intake exponents agree.
const EXPONENT_TOLERANCE: f64 = 1e-12;

/// Result of the last catch fit of a species.
#[derive(Debug, Clone, Serialize)]
pub struct CatchFitSummary {
    pub gear: String,
    pub layout: ParamLayout,
    /// Natural parameters at the optimum.
    pub parameters: Vec<f64>,
    pub breakdown: ObjectiveBreakdown,
    pub status: OptimizationStatus,
    /// Optimizer runs used, including the first.
    pub attempts: usize,
    pub iterations: usize,
}

/// Calibration state of one species.
#[derive(Debug, Clone, Serialize)]
pub struct SpeciesCalibration {
    pub params: SpeciesParams,
    /// Gear rows of this species only.
    pub gears: Vec<GearParams>,
    pub stage: CalibrationStage,
    /// Steady state, present from [`CalibrationStage::SteadyState`] on.
    pub state: Option<SizeSpectrumState>,
    pub catch_fit: Option<CatchFitSummary>,
}

impl SpeciesCalibration {
    pub fn new(params: SpeciesParams, gears: &[GearParams]) -> Self {
        let gears = gears
            .iter()
            .filter(|g| g.species == params.species)
            .cloned()
            .collect();
        Self {
            params,
            gears,
            stage: CalibrationStage::Raw,
            state: None,
            catch_fit: None,
        }
    }

    pub fn species(&self) -> &str {
        &self.params.species
    }

    fn require(&self, attempted: CalibrationStage) -> Result<(), CalibrationError> {
        match attempted.precondition() {
            Some(required) if self.stage < required => Err(CalibrationError::StageOrder {
                species: self.params.species.clone(),
                attempted,
                required,
                current: self.stage,
            }),
            _ => Ok(()),
        }
    }

    fn advanced(mut self, stage: CalibrationStage) -> Self {
        if stage > self.stage {
            info!("{}: {} -> {}", self.params.species, self.stage, stage);
            self.stage = stage;
        }
        self
    }

    fn current_state(&self) -> Result<&SizeSpectrumState, CalibrationError> {
        self.state.as_ref().ok_or_else(|| {
            CalibrationError::structural(&self.params.species, "no steady state has been computed")
        })
    }

    fn biomass_target(&self) -> Result<f64, CalibrationError> {
        match self.params.biomass_observed {
            Some(b) if b.is_finite() && b > 0.0 => Ok(b),
            other => Err(CalibrationError::structural(
                &self.params.species,
                format!("observed biomass must be positive (got {other:?})"),
            )),
        }
    }

    /// Re-solve the steady state for the current parameters, keeping the
    /// biomass match if it was already established.
    fn refresh_state(&mut self, config: &CalibrationConfig) -> Result<(), CalibrationError> {
        let mut state = SteadyStateSolver::new(config.grid_points).solve(&self.params, &self.gears)?;
        if self.stage >= CalibrationStage::BiomassMatched {
            state = state.rescaled_to_biomass(&self.params.species, self.biomass_target()?)?.0;
        }
        self.state = Some(state);
        Ok(())
    }

    /// Scale the feeding coefficients (`gamma`, `h`, `ext_encounter`) by a
    /// common factor so that individuals reach `w_mat` at `age_mat`.
    ///
    /// Without an observed age at maturity growth is accepted as given.
    pub fn match_growth(&self, config: &CalibrationConfig) -> Result<Self, CalibrationError> {
        self.require(CalibrationStage::GrowthMatched)?;
        let sp = &self.params;
        sp.validate()?;

        let mut out = self.clone();
        match sp.age_mat {
            None => info!("{}: no age at maturity, growth left unchanged", sp.species),
            Some(age_mat) => {
                if !(age_mat.is_finite() && age_mat > 0.0) {
                    return Err(CalibrationError::structural(
                        &sp.species,
                        format!("age at maturity must be positive (got {age_mat})"),
                    ));
                }
                let grid = WeightGrid::for_species(sp, config.grid_points)?;
                let age_gap = |m: f64| {
                    EnergyBudget::with_multiplier(sp, &grid, m).age_at_maturity(&grid, sp.w_mat) - age_mat
                };
                let root = solve_decreasing(age_gap, 1.0, GROWTH_TOLERANCE, GROWTH_MAX_ITERATIONS)
                    .ok_or_else(|| {
                        CalibrationError::structural(
                            &sp.species,
                            format!("no feeding rate reaches maturity at age {age_mat}"),
                        )
                    })?;
                out.params.gamma *= root.x;
                out.params.h *= root.x;
                out.params.ext_encounter *= root.x;
                EnergyBudget::compute(&out.params, &grid)?;
                info!(
                    "{}: feeding coefficients scaled by {:.6} ({} iterations)",
                    sp.species, root.x, root.iterations
                );
            }
        }

        if out.state.is_some() {
            out.refresh_state(config)?;
        }
        Ok(out.advanced(CalibrationStage::GrowthMatched))
    }

    /// Solve the single-species steady state for the current parameters.
    pub fn steady_state(&self, config: &CalibrationConfig) -> Result<Self, CalibrationError> {
        self.require(CalibrationStage::SteadyState)?;
        let mut out = self.clone();
        out.refresh_state(config)?;
        Ok(out.advanced(CalibrationStage::SteadyState))
    }

    /// Rescale abundance so modelled biomass above the cutoff equals the observation.
    pub fn match_biomasses(&self) -> Result<Self, CalibrationError> {
        self.require(CalibrationStage::BiomassMatched)?;
        let target = self.biomass_target()?;
        let (state, factor) = self.current_state()?.rescaled_to_biomass(&self.params.species, target)?;
        info!("{}: abundance rescaled by {factor:.6e}", self.params.species);
        let mut out = self.clone();
        out.state = Some(state);
        Ok(out.advanced(CalibrationStage::BiomassMatched))
    }

    /// Catch objective for `catch` against the current steady state.
    pub fn objective(&self, catch: &ObservedCatch, config: &CalibrationConfig) -> Result<CatchObjective, CalibrationError> {
        self.require(CalibrationStage::CatchMatched)?;
        ObjectiveBuilder::new(&self.params, &self.gears, self.current_state()?, catch)
            .yield_lambda(config.yield_lambda)
            .production_lambda(config.production_lambda)
            .catchability_floor(config.catchability_floor)
            .build()
    }

    /// Fit selectivity, catchability and `mu_mat` to the observed catch.
    ///
    /// A species with catch data but no row for the gear gets a default
    /// selectivity first. Runs that fail or stop short of convergence are
    /// retried from jittered starts up to `config.restarts` times, and the
    /// best usable run is kept.
    pub fn match_catch(&self, catch: &ObservedCatch, config: &CalibrationConfig) -> Result<Self, CalibrationError> {
        self.require(CalibrationStage::CatchMatched)?;
        let species = &self.params.species;

        let mut out = self.clone();
        if !out.gears.iter().any(|g| g.gear == catch.gear) {
            let gear = GearParams::default_for(catch);
            info!(
                "{species}: no gear row for '{}', starting from default selectivity (l50={:.2})",
                catch.gear, gear.l50
            );
            out.gears.push(gear);
        }

        let objective = out.objective(catch, config)?;
        let optimizer = Optimizer::new(config.optimizer.clone());
        let (result, attempts) = fit_with_retries(&objective, &optimizer, config)?;
        if !result.converged() {
            warn!("{species}: catch fit ended with status {:?}", result.status);
        }

        let theta = &result.parameters;
        let breakdown = objective.evaluate(theta).map_err(|err| CalibrationError::NumericDivergence {
            species: species.clone(),
            attempts,
            reason: FailureReason::from(&err),
        })?;
        let fitted = objective.layout().params(theta);
        for gear in out.gears.iter_mut().filter(|g| g.gear == catch.gear) {
            *gear = fitted.apply_to(gear);
        }
        out.params.mu_mat = Some(fitted.mu_mat);
        out.refresh_state(config)?;

        info!(
            "{species}: catch fit on '{}' objective {:.6e} (deviance {:.6e}) after {} iterations",
            catch.gear, breakdown.total, breakdown.deviance, result.iterations
        );
        out.catch_fit = Some(CatchFitSummary {
            gear: catch.gear.clone(),
            layout: objective.layout(),
            parameters: result.parameters.clone(),
            breakdown,
            status: result.status,
            attempts,
            iterations: result.iterations,
        });
        Ok(out.advanced(CalibrationStage::CatchMatched))
    }

    /// Adjust metabolism and encounter so modelled consumption equals the
    /// observation while growth (and hence the spectrum) stays unchanged.
    ///
    /// Raising `ks` by `dks` and the feeding level by `dks / (alpha h)` leaves
    /// available energy fixed; this needs the metabolic exponent to equal `n`.
    pub fn match_consumption(&self, config: &CalibrationConfig) -> Result<Self, CalibrationError> {
        self.require(CalibrationStage::ConsumptionMatched)?;
        let sp = &self.params;
        let fail = |msg: String| Err(CalibrationError::structural(&sp.species, msg));

        let observed = match sp.consumption_observed {
            Some(c) if c.is_finite() && c > 0.0 => c,
            other => return fail(format!("observed consumption must be positive (got {other:?})")),
        };
        if let Some(p) = sp.p {
            if (p - sp.n).abs() > EXPONENT_TOLERANCE {
                return fail(format!(
                    "consumption matching needs metabolic exponent p ({p}) equal to n ({})",
                    sp.n
                ));
            }
        }

        let state = self.current_state()?;
        let modelled = state.consumption();
        let scale: f64 = (0..state.grid.len())
            .map(|i| state.grid.w[i].powf(sp.n) * state.n[i] * state.grid.dw[i])
            .sum();
        let dks = sp.alpha * (observed - modelled) / scale;
        let ks = sp.ks + dks;
        if ks < 0.0 {
            return fail(format!(
                "observed consumption {observed:.4e} is too low: metabolic rate would be {ks:.4e}"
            ));
        }
        let feeding = sp.feeding_level() + dks / (sp.alpha * sp.h);
        if feeding >= 1.0 {
            return fail(format!(
                "observed consumption {observed:.4e} exceeds maximum intake (feeding level {feeding:.4})"
            ));
        }

        let encounter = feeding * sp.h / (1.0 - feeding);
        let mut out = self.clone();
        out.params.p = Some(sp.n);
        out.params.ks = ks;
        let ext = encounter - sp.gamma * sp.prey_density;
        if ext >= 0.0 {
            out.params.ext_encounter = ext;
        } else {
            out.params.ext_encounter = 0.0;
            out.params.gamma = encounter / sp.prey_density;
        }
        info!(
            "{}: ks {:.4} -> {:.4}, feeding level {:.4} -> {feeding:.4}",
            sp.species,
            sp.ks,
            ks,
            sp.feeding_level()
        );

        out.refresh_state(config)?;
        Ok(out.advanced(CalibrationStage::ConsumptionMatched))
    }
}

/// Optimize from the objective's start, then from jittered starts until a run
/// converges. Returns the best usable run and the number of attempts.
fn fit_with_retries(
    objective: &CatchObjective,
    optimizer: &Optimizer,
    config: &CalibrationConfig,
) -> Result<(OptimizationResult, usize), CalibrationError> {
    let layout = objective.layout();
    let theta0 = objective.initial_theta().to_vec();
    // A floored catchability sits on a flat plateau; jitter around F of order mu_mat instead.
    let mut retry_base = theta0.clone();
    let q = layout.catchability_index();
    if retry_base[q] <= config.catchability_floor {
        retry_base[q] = retry_base[layout.mu_index()] / objective.gear().effort;
    }

    let mut best: Option<OptimizationResult> = None;
    let mut last = FailureReason::NonConvergent;
    let mut attempts = 0;
    for attempt in 0..=config.restarts {
        attempts = attempt + 1;
        let start = if attempt == 0 {
            theta0.clone()
        } else {
            let mut rng = StdRng::seed_from_u64(run_seed(objective.species(), config.seed, attempt));
            jittered_start(layout, &retry_base, &config.multistart, &mut rng).0
        };
        let result = objective.optimize(&start, optimizer);
        if let Some(reason) = result.failure() {
            last = reason;
            warn!("{}: catch fit attempt {attempts} discarded ({reason})", objective.species());
            continue;
        }
        if !result.is_usable() {
            warn!("{}: catch fit attempt {attempts} ended at a non-finite objective", objective.species());
            continue;
        }
        let converged = result.converged();
        if !converged {
            debug!(
                "{}: catch fit attempt {attempts} ended {:?} at {:.6e}",
                objective.species(),
                result.status,
                result.objective
            );
        }
        if best.as_ref().is_none_or(|b| result.objective < b.objective) {
            best = Some(result);
        }
        if converged {
            break;
        }
    }
    match best {
        Some(result) => Ok((result, attempts)),
        None => Err(CalibrationError::NumericDivergence {
            species: objective.species().to_string(),
            attempts,
            reason: last,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::fixtures;

    fn config() -> CalibrationConfig {
        CalibrationConfig::default()
    }

    #[test]
    fn stage_before_precondition_is_rejected() {
        let record = SpeciesCalibration::new(fixtures::species(), &[fixtures::gear()]);
        let err = record.match_catch(&fixtures::flat_catch(), &config()).unwrap_err();
        match err {
            CalibrationError::StageOrder {
                attempted,
                required,
                current,
                ..
            } => {
                assert_eq!(attempted, CalibrationStage::CatchMatched);
                assert_eq!(required, CalibrationStage::BiomassMatched);
                assert_eq!(current, CalibrationStage::Raw);
            }
            other => panic!("expected stage-order error, got {other}"),
        }
        assert!(record.steady_state(&config()).unwrap_err().is_fatal());
        assert!(record.match_biomasses().unwrap_err().is_fatal());
        assert!(record.match_consumption(&config()).unwrap_err().is_fatal());
    }

    #[test]
    fn growth_matching_hits_age_and_is_idempotent() {
        let record = SpeciesCalibration::new(fixtures::species(), &[fixtures::gear()]);
        let once = record.match_growth(&config()).unwrap();
        let twice = once.match_growth(&config()).unwrap();
        assert_eq!(once.stage, CalibrationStage::GrowthMatched);

        let sp = &once.params;
        let grid = WeightGrid::for_species(sp, config().grid_points).unwrap();
        let age = EnergyBudget::compute(sp, &grid).unwrap().age_at_maturity(&grid, sp.w_mat);
        assert!((age - sp.age_mat.unwrap()).abs() < 1e-8);
        assert!((once.params.h - twice.params.h).abs() < 1e-9 * once.params.h);
        assert!((once.params.gamma - twice.params.gamma).abs() < 1e-9 * once.params.gamma);
        // The feeding level is invariant under a common multiplier.
        assert!((once.params.feeding_level() - record.params.feeding_level()).abs() < 1e-12);
    }

    #[test]
    fn biomass_matching_is_idempotent() {
        let record = fixtures::biomass_matched(fixtures::gear());
        let target = record.params.biomass_observed.unwrap();
        let state = record.state.as_ref().unwrap();
        assert!((state.biomass() - target).abs() < 1e-9 * target);

        let again = record.match_biomasses().unwrap();
        let state2 = again.state.as_ref().unwrap();
        for (a, b) in state.n.iter().zip(&state2.n) {
            assert!((a - b).abs() <= 1e-12 * a.abs());
        }
    }

    #[test]
    fn steady_state_after_biomass_match_keeps_biomass() {
        let record = fixtures::biomass_matched(fixtures::gear());
        let resolved = record.steady_state(&config()).unwrap();
        assert_eq!(resolved.stage, CalibrationStage::BiomassMatched);
        let target = record.params.biomass_observed.unwrap();
        assert!((resolved.state.unwrap().biomass() - target).abs() < 1e-9 * target);
    }

    #[test]
    fn catch_fit_recovers_generating_parameters() {
        let (truth, catch) = fixtures::synthetic_problem(fixtures::gear());
        let true_gear = truth.gears[0].clone();
        let true_mu = truth.params.mu_mat.unwrap();

        let mut perturbed = truth.clone();
        perturbed.gears[0].l50 *= 1.15;
        perturbed.gears[0].l25 = 0.8 * perturbed.gears[0].l50;
        perturbed.gears[0].catchability *= 0.85;
        perturbed.params.mu_mat = Some(true_mu * 1.1);
        let perturbed = perturbed
            .steady_state(&config())
            .unwrap()
            .match_biomasses()
            .unwrap();

        let fitted = perturbed.match_catch(&catch, &config()).unwrap();
        assert_eq!(fitted.stage, CalibrationStage::CatchMatched);
        let gear = &fitted.gears[0];
        let rel = |a: f64, b: f64| (a - b).abs() / b.abs();
        assert!(rel(gear.l50, true_gear.l50) < 0.05, "l50 {}", gear.l50);
        assert!(rel(gear.l25, true_gear.l25) < 0.05, "l25 {}", gear.l25);
        assert!(rel(gear.catchability, true_gear.catchability) < 0.05, "q {}", gear.catchability);
        assert!(rel(fitted.params.mu_mat.unwrap(), true_mu) < 0.05);

        // The fitted optimum is no worse than the generating vector.
        let objective = fixtures::objective(&truth, &catch);
        let at_truth = objective.evaluate(objective.initial_theta()).unwrap().total;
        let summary = fitted.catch_fit.unwrap();
        assert!(summary.breakdown.total <= at_truth + 1e-6);
    }

    #[test]
    fn catch_fit_leaves_zero_catchability_plateau() {
        let (truth, catch) = fixtures::synthetic_problem(fixtures::gear());
        let true_q = truth.gears[0].catchability;

        let mut unfished = truth.clone();
        unfished.gears[0].catchability = 0.0;
        let unfished = unfished
            .steady_state(&config())
            .unwrap()
            .match_biomasses()
            .unwrap();

        let fitted = unfished.match_catch(&catch, &config()).unwrap();
        let q = fitted.gears[0].catchability;
        assert!((q - true_q).abs() / true_q < 0.1, "q {q}");
        let summary = fitted.catch_fit.unwrap();
        assert!(summary.breakdown.total < 1e-3, "{:?}", summary.breakdown);
        assert!(!matches!(summary.status, OptimizationStatus::Failed(_)));
    }

    #[test]
    fn dome_catch_fit_recovers_descending_limb() {
        let (truth, catch) = fixtures::synthetic_problem(fixtures::dome_gear());
        let true_gear = truth.gears[0].clone();
        let mut perturbed = truth.clone();
        perturbed.gears[0].l50_right = Some(true_gear.l50_right.unwrap() * 1.1);
        perturbed.gears[0].l25_right = Some(true_gear.l25_right.unwrap() * 1.1);
        perturbed.gears[0].catchability *= 1.2;
        let perturbed = perturbed.steady_state(&config()).unwrap();

        let fitted = perturbed.match_catch(&catch, &config()).unwrap();
        let gear = &fitted.gears[0];
        let l50r = gear.l50_right.unwrap();
        assert!((l50r - true_gear.l50_right.unwrap()).abs() / true_gear.l50_right.unwrap() < 0.05);
    }

    #[test]
    fn missing_gear_row_gets_default_selectivity() {
        let (truth, catch) = fixtures::synthetic_problem(fixtures::gear());
        let mut bare = truth.clone();
        bare.gears.clear();
        let bare = bare.steady_state(&config()).unwrap();
        let fitted = bare.match_catch(&catch, &config()).unwrap();
        assert_eq!(fitted.gears.len(), 1);
        assert_eq!(fitted.gears[0].gear, catch.gear);
        assert!(fitted.catch_fit.is_some());
    }

    #[test]
    fn consumption_matching_is_exact_and_keeps_growth() {
        let (truth, catch) = fixtures::synthetic_problem(fixtures::gear());
        let fitted = truth.match_catch(&catch, &config()).unwrap();
        let before = fitted.state.clone().unwrap();

        let mut target = fitted.clone();
        let observed = 1.3 * before.consumption();
        target.params.consumption_observed = Some(observed);
        let matched = target.match_consumption(&config()).unwrap();
        let after = matched.state.as_ref().unwrap();

        assert_eq!(matched.stage, CalibrationStage::ConsumptionMatched);
        assert!((after.consumption() - observed).abs() < 1e-9 * observed);
        for (g0, g1) in before.growth.iter().zip(&after.growth) {
            assert!((g0 - g1).abs() <= 1e-9 * g0.abs().max(1e-12));
        }
        assert!(matched.params.ks > fitted.params.ks);
        let b = matched.params.biomass_observed.unwrap();
        assert!((after.biomass() - b).abs() < 1e-9 * b);
    }

    #[test]
    fn consumption_below_metabolic_floor_is_rejected() {
        let (truth, catch) = fixtures::synthetic_problem(fixtures::gear());
        let mut fitted = truth.match_catch(&catch, &config()).unwrap();
        fitted.params.consumption_observed = Some(1e-6 * fitted.state.as_ref().unwrap().consumption());
        let err = fitted.match_consumption(&config()).unwrap_err();
        assert!(matches!(err, CalibrationError::StructuralInput { .. }));
    }

    #[test]
    fn consumption_needs_matching_exponents() {
        let (truth, catch) = fixtures::synthetic_problem(fixtures::gear());
        let mut fitted = truth.match_catch(&catch, &config()).unwrap();
        fitted.params.consumption_observed = Some(fitted.state.as_ref().unwrap().consumption());
        fitted.params.p = Some(0.75);
        assert!(fitted.match_consumption(&config()).is_err());
    }
}
