//! Single-species steady state without inter-species feeding.
//!
//! At equilibrium the abundance flux `g N` only decays through mortality. On
//! the weight grid this is the upwind recursion
//!
//! ```text
//! N_i = N_{i-1} g_{i-1} / (g_i + mu_i dw_i)
//! ```
//!
//! which we run in log space so that steep spectra neither underflow nor lose
//! precision. The recursion is generic over [`DualNum`] so the catch objective
//! can differentiate through it.

use num_dual::DualNum;
use serde::{Deserialize, Serialize};

use crate::domain::{GearParams, SpeciesParams};
use crate::error::CalibrationError;
use crate::models::SelectivityCurve;
use crate::spectrum::{EnergyBudget, WeightGrid};

/// Fraction of P/B kept as a floor when deriving `mu_mat`.
const DERIVED_MU_FLOOR: f64 = 0.05;

/// Natural log of the steady-state abundance at each node, `ln N_0 = 0`.
///
/// Fails if a flux denominator `g_i + mu_i dw_i` is not positive.
pub fn log_abundance<T: DualNum<f64> + Copy>(
    growth: &[f64],
    mortality: &[T],
    dw: &[f64],
) -> Result<Vec<T>, String> {
    let len = growth.len();
    let mut ln_n = Vec::with_capacity(len);
    ln_n.push(T::from(0.0));
    for i in 1..len {
        let denom = mortality[i] * dw[i] + growth[i];
        if !(denom.re() > 0.0) {
            return Err(format!(
                "growth plus mortality flux is {:.4e} at node {i}; no steady state exists",
                denom.re()
            ));
        }
        let prev = ln_n[i - 1];
        ln_n.push(prev + growth[i - 1].ln() - denom.ln());
    }
    Ok(ln_n)
}

/// Equilibrium size spectrum of one species plus the rates that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SizeSpectrumState {
    pub grid: WeightGrid,
    /// Abundance density per unit weight.
    pub n: Vec<f64>,
    pub growth: Vec<f64>,
    /// Energy available for growth and reproduction.
    pub available: Vec<f64>,
    pub intake: Vec<f64>,
    /// Total mortality rate.
    pub mortality: Vec<f64>,
    /// Fishing mortality rate summed over gears.
    pub fishing: Vec<f64>,
    /// Natural mortality at maturity used for `mortality`.
    pub mu_mat: f64,
    /// Lower weight bound of the biomass that observations refer to.
    pub biomass_cutoff: f64,
}

impl SizeSpectrumState {
    /// Biomass above the observation cutoff.
    pub fn biomass(&self) -> f64 {
        self.integrate(|i| if self.grid.w[i] >= self.biomass_cutoff { self.grid.w[i] } else { 0.0 })
    }

    /// Mass removed by fishing per unit time.
    pub fn yield_rate(&self) -> f64 {
        self.integrate(|i| self.fishing[i] * self.grid.w[i])
    }

    /// New biomass per unit time (somatic growth plus reproductive investment).
    pub fn production(&self) -> f64 {
        self.integrate(|i| self.available[i])
    }

    /// Food consumed per unit time.
    pub fn consumption(&self) -> f64 {
        self.integrate(|i| self.intake[i])
    }

    /// `sum_i N_i rate_i dw_i`.
    fn integrate<F: Fn(usize) -> f64>(&self, rate: F) -> f64 {
        (0..self.grid.len())
            .map(|i| self.n[i] * rate(i) * self.grid.dw[i])
            .sum()
    }

    /// The same spectrum with abundance multiplied by `factor`.
    pub fn scaled(&self, factor: f64) -> Self {
        let mut out = self.clone();
        for v in &mut out.n {
            *v *= factor;
        }
        out
    }

    /// Rescale so that [`Self::biomass`] equals `target`; returns the factor used.
    pub fn rescaled_to_biomass(&self, species: &str, target: f64) -> Result<(Self, f64), CalibrationError> {
        if !(target.is_finite() && target > 0.0) {
            return Err(CalibrationError::structural(
                species,
                format!("observed biomass must be positive (got {target})"),
            ));
        }
        let current = self.biomass();
        if !(current.is_finite() && current > 0.0) {
            return Err(CalibrationError::structural(
                species,
                format!("model biomass above the cutoff is {current}; cannot rescale"),
            ));
        }
        let factor = target / current;
        Ok((self.scaled(factor), factor))
    }
}

/// Natural mortality at maturity: the table value, or derived from P/B.
///
/// The derived value is P/B less the fishing mortality at maturity, floored
/// at a small fraction of P/B.
pub fn natural_mortality_at_maturity(
    species: &SpeciesParams,
    fishing_at_maturity: f64,
) -> Result<f64, CalibrationError> {
    if let Some(mu) = species.mu_mat {
        return Ok(mu);
    }
    match species.production_per_biomass() {
        Some(pb) if pb.is_finite() && pb > 0.0 => {
            Ok((pb - fishing_at_maturity).max(DERIVED_MU_FLOOR * pb))
        }
        _ => Err(CalibrationError::structural(
            &species.species,
            "mu_mat is missing and no production/biomass ratio is available to derive it",
        )),
    }
}

/// Fishing mortality at each grid node from all gears of a species.
pub fn fishing_mortality(
    species: &SpeciesParams,
    gears: &[GearParams],
    grid: &WeightGrid,
) -> Result<Vec<f64>, CalibrationError> {
    let mut fishing = vec![0.0; grid.len()];
    for gear in gears.iter().filter(|g| g.species == species.species) {
        if !(gear.catchability.is_finite() && gear.catchability >= 0.0) {
            return Err(CalibrationError::structural(
                &species.species,
                format!("gear '{}': catchability must be non-negative (got {})", gear.gear, gear.catchability),
            ));
        }
        if !(gear.effort.is_finite() && gear.effort >= 0.0) {
            return Err(CalibrationError::structural(
                &species.species,
                format!("gear '{}': effort must be non-negative (got {})", gear.gear, gear.effort),
            ));
        }
        let curve = SelectivityCurve::from_gear(gear)?;
        for (f, &l) in fishing.iter_mut().zip(&grid.l) {
            *f += gear.effort * gear.catchability * curve.at(l);
        }
    }
    Ok(fishing)
}

/// Computes equilibrium spectra on a fixed number of grid nodes.
#[derive(Debug, Clone, Copy)]
pub struct SteadyStateSolver {
    grid_points: usize,
}

impl SteadyStateSolver {
    pub fn new(grid_points: usize) -> Self {
        Self { grid_points }
    }

    /// Solve for one species in isolation. Abundance is normalised to `N_0 = 1`.
    pub fn solve(&self, species: &SpeciesParams, gears: &[GearParams]) -> Result<SizeSpectrumState, CalibrationError> {
        species.validate()?;
        let grid = WeightGrid::for_species(species, self.grid_points)?;
        let budget = EnergyBudget::compute(species, &grid)?;
        let fishing = fishing_mortality(species, gears, &grid)?;

        let f_mat = interpolate_at(&grid.w, &fishing, species.w_mat);
        let mu_mat = natural_mortality_at_maturity(species, f_mat)?;
        let d = species.mortality_exponent();
        let mortality: Vec<f64> = grid
            .w
            .iter()
            .zip(&fishing)
            .map(|(&w, &f)| mu_mat * (w / species.w_mat).powf(d) + f)
            .collect();

        let ln_n = log_abundance(&budget.growth, &mortality, &grid.dw)
            .map_err(|msg| CalibrationError::structural(&species.species, msg))?;
        let n: Vec<f64> = ln_n.iter().map(|v| v.exp()).collect();

        Ok(SizeSpectrumState {
            grid,
            n,
            growth: budget.growth,
            available: budget.available,
            intake: budget.intake,
            mortality,
            fishing,
            mu_mat,
            biomass_cutoff: species.biomass_cutoff.unwrap_or(0.0),
        })
    }
}

/// Piecewise-linear interpolation of `values` over sorted `xs`, clamped at the ends.
fn interpolate_at(xs: &[f64], values: &[f64], x: f64) -> f64 {
    let upper = xs.partition_point(|&v| v < x);
    if upper == 0 {
        return values[0];
    }
    if upper >= xs.len() {
        return values[xs.len() - 1];
    }
    let lower = upper - 1;
    let t = (x - xs[lower]) / (xs[upper] - xs[lower]);
    values[lower] + t * (values[upper] - values[lower])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::fixtures;
    use num_dual::Dual64;

    #[test]
    fn steady_state_matches_continuous_power_law() {
        // Unfished, no reproduction investment below w_max and constant mu/g * w
        // gives N(w) ~ w^(-n - mu_mat w_mat^-d / c) in the continuum limit; the
        // discrete recursion should reproduce the exponent closely.
        let mut sp = fixtures::species();
        sp.w_max = 1e6;
        sp.w_mat = 1e5;
        sp.w_mat25 = None;
        let solver = SteadyStateSolver::new(400);
        let state = solver.solve(&sp, &[]).unwrap();

        let c = sp.alpha * sp.feeding_level() * sp.h - sp.ks;
        let expected = -sp.n - sp.mu_mat.unwrap() * sp.w_mat.powf(-sp.mortality_exponent()) / c;
        // Slope between two small sizes where maturation is negligible.
        let (i, j) = (20, 60);
        let slope = (state.n[j].ln() - state.n[i].ln()) / (state.grid.w[j].ln() - state.grid.w[i].ln());
        assert!((slope - expected).abs() < 0.05, "slope {slope} vs {expected}");
    }

    #[test]
    fn abundance_is_non_negative_and_aggregates_finite() {
        let sp = fixtures::species();
        let gear = fixtures::gear();
        let state = SteadyStateSolver::new(200).solve(&sp, &[gear]).unwrap();
        assert!(state.n.iter().all(|&v| v >= 0.0 && v.is_finite()));
        assert!(state.biomass() > 0.0);
        assert!(state.yield_rate() > 0.0);
        assert!(state.production() > 0.0);
        assert!(state.consumption() > state.production());
        assert!(state.fishing.iter().all(|&f| f >= 0.0));
    }

    #[test]
    fn rescaling_hits_biomass_target() {
        let sp = fixtures::species();
        let state = SteadyStateSolver::new(200).solve(&sp, &[fixtures::gear()]).unwrap();
        let (scaled, factor) = state.rescaled_to_biomass(&sp.species, 1234.0).unwrap();
        assert!((scaled.biomass() - 1234.0).abs() < 1e-9 * 1234.0);
        assert!((scaled.yield_rate() - factor * state.yield_rate()).abs() < 1e-9 * scaled.yield_rate());
    }

    #[test]
    fn zero_flux_is_structural_error() {
        let growth = [1.0, 1.0, 0.0];
        let mortality = [0.1, 0.1, 0.0];
        let dw = [1.0, 1.0, 1.0];
        assert!(log_abundance(&growth, &mortality, &dw).is_err());
    }

    #[test]
    fn dual_recursion_matches_f64() {
        let growth = [1.0, 0.8, 0.5, 0.1];
        let dw = [0.5, 1.0, 2.0, 4.0];
        let mu = [0.3, 0.2, 0.15, 0.1];
        let plain = log_abundance(&growth, &mu, &dw).unwrap();

        // Derivative with respect to a common mortality scale s at s = 1.
        let dual_mu: Vec<Dual64> = mu.iter().map(|&m| Dual64::new(1.0, 1.0) * m).collect();
        let dual = log_abundance(&growth, &dual_mu, &dw).unwrap();
        let h = 1e-6;
        let bumped: Vec<f64> = mu.iter().map(|&m| m * (1.0 + h)).collect();
        let bumped = log_abundance(&growth, &bumped, &dw).unwrap();
        for i in 0..growth.len() {
            assert!((dual[i].re - plain[i]).abs() < 1e-14);
            assert!((dual[i].eps - (bumped[i] - plain[i]) / h).abs() < 1e-5);
        }
    }

    #[test]
    fn missing_mu_mat_is_derived_from_production() {
        let mut sp = fixtures::species();
        sp.mu_mat = None;
        sp.biomass_observed = Some(100.0);
        sp.production_observed = Some(50.0);
        assert!((natural_mortality_at_maturity(&sp, 0.1).unwrap() - 0.4).abs() < 1e-12);
        assert!((natural_mortality_at_maturity(&sp, 1.0).unwrap() - 0.025).abs() < 1e-12);

        sp.production_observed = None;
        assert!(natural_mortality_at_maturity(&sp, 0.1).is_err());
    }
}
