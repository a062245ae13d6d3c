//! Energy budget of an individual: intake, available energy, growth.
//!
//! With a single exponent `n` for maximum intake and encounter the feeding
//! level is size independent, so every rate below is an allometric power of
//! weight times a species constant:
//!
//! ```text
//! I(w)   = f h w^n                      intake
//! E_r(w) = alpha I(w) - ks w^p          energy available for growth + reproduction
//! g(w)   = E_r(w) (1 - psi(w))          somatic growth
//! ```

use crate::domain::SpeciesParams;
use crate::error::CalibrationError;
use crate::spectrum::WeightGrid;

/// Per-node energy rates for one species.
#[derive(Debug, Clone, PartialEq)]
pub struct EnergyBudget {
    pub intake: Vec<f64>,
    /// Available energy, floored at zero above maturity.
    pub available: Vec<f64>,
    /// Proportion of available energy invested in reproduction.
    pub psi: Vec<f64>,
    pub growth: Vec<f64>,
}

impl EnergyBudget {
    /// Rates with the feeding coefficients (`gamma`, `h`, `ext_encounter`)
    /// scaled by `multiplier`. No consistency checks.
    pub fn with_multiplier(species: &SpeciesParams, grid: &WeightGrid, multiplier: f64) -> Self {
        let f = species.feeding_level();
        let p = species.metabolic_exponent();
        let u = species.maturity_steepness();

        let len = grid.len();
        let mut intake = Vec::with_capacity(len);
        let mut available = Vec::with_capacity(len);
        let mut psi = Vec::with_capacity(len);
        let mut growth = Vec::with_capacity(len);

        for &w in &grid.w {
            let i = multiplier * f * species.h * w.powf(species.n);
            let mut e = species.alpha * i - species.ks * w.powf(p);
            if w >= species.w_mat {
                e = e.max(0.0);
            }
            let ps = maturity_investment(species, u, w);
            intake.push(i);
            available.push(e);
            psi.push(ps);
            growth.push(e * (1.0 - ps));
        }

        Self {
            intake,
            available,
            psi,
            growth,
        }
    }

    /// Rates for the current parameters; fails if an immature individual
    /// cannot grow.
    pub fn compute(species: &SpeciesParams, grid: &WeightGrid) -> Result<Self, CalibrationError> {
        let budget = Self::with_multiplier(species, grid, 1.0);
        for (i, &w) in grid.w.iter().enumerate() {
            if w >= species.w_mat {
                break;
            }
            if !(budget.growth[i] > 0.0) {
                return Err(CalibrationError::structural(
                    &species.species,
                    format!(
                        "growth rate is {:.4e} at w={w:.4e} below maturity; metabolism exceeds intake",
                        budget.growth[i]
                    ),
                ));
            }
        }
        Ok(budget)
    }

    /// Time to grow from `w_min` to `w_mat`, `+inf` if growth stalls.
    pub fn age_at_maturity(&self, grid: &WeightGrid, w_mat: f64) -> f64 {
        let mut age = 0.0;
        for i in 0..grid.len() - 1 {
            let (w0, w1) = (grid.w[i], grid.w[i + 1]);
            if w0 >= w_mat {
                break;
            }
            let (g0, g1) = (self.growth[i], self.growth[i + 1]);
            if !(g0 > 0.0) {
                return f64::INFINITY;
            }
            if w1 <= w_mat {
                if !(g1 > 0.0) {
                    return f64::INFINITY;
                }
                age += 0.5 * (1.0 / g0 + 1.0 / g1) * (w1 - w0);
            } else {
                let gm = g0 + (w_mat - w0) / (w1 - w0) * (g1 - g0);
                if !(gm > 0.0) {
                    return f64::INFINITY;
                }
                age += 0.5 * (1.0 / g0 + 1.0 / gm) * (w_mat - w0);
                break;
            }
        }
        age
    }
}

/// `psi(w)`: maturity ogive times the allometric investment ramp, 1 at and beyond `w_max`.
pub fn maturity_investment(species: &SpeciesParams, steepness: f64, w: f64) -> f64 {
    if w >= species.w_max {
        return 1.0;
    }
    let ogive = 1.0 / (1.0 + (w / species.w_mat).powf(-steepness));
    (ogive * (w / species.w_max).powf(1.0 - species.n)).min(1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::fixtures;

    #[test]
    fn growth_is_positive_below_maturity() {
        let sp = fixtures::species();
        let grid = WeightGrid::for_species(&sp, 200).unwrap();
        let budget = EnergyBudget::compute(&sp, &grid).unwrap();
        let last = grid.len() - 1;
        assert_eq!(budget.psi[last], 1.0);
        assert_eq!(budget.growth[last], 0.0);
        assert!(budget.growth[..last].iter().all(|&g| g > 0.0));
    }

    #[test]
    fn starving_species_is_structural_error() {
        let mut sp = fixtures::species();
        sp.ks = 1e3;
        let grid = WeightGrid::for_species(&sp, 100).unwrap();
        let err = EnergyBudget::compute(&sp, &grid).unwrap_err();
        assert!(matches!(err, CalibrationError::StructuralInput { .. }));
    }

    #[test]
    fn age_at_maturity_decreases_with_multiplier() {
        let sp = fixtures::species();
        let grid = WeightGrid::for_species(&sp, 200).unwrap();
        let slow = EnergyBudget::with_multiplier(&sp, &grid, 0.8).age_at_maturity(&grid, sp.w_mat);
        let base = EnergyBudget::with_multiplier(&sp, &grid, 1.0).age_at_maturity(&grid, sp.w_mat);
        let fast = EnergyBudget::with_multiplier(&sp, &grid, 1.5).age_at_maturity(&grid, sp.w_mat);
        assert!(slow > base && base > fast);
        assert!(base.is_finite() && base > 0.0);

        let stalled = EnergyBudget::with_multiplier(&sp, &grid, 1e-3).age_at_maturity(&grid, sp.w_mat);
        assert!(stalled.is_infinite());
    }
}
