//! Shared domain types.
//!
//! These types are intentionally kept flat and serializable so they can be:
//!
//! - read from and written to CSV parameter tables
//! - carried by value through the calibration stages
//! - exported as a JSON snapshot of a run

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::CalibrationError;
use crate::fit::{MultiStartConfig, OptimizerConfig};

/// Maturity ogive steepness used when `w_mat25` is not supplied.
pub const DEFAULT_MATURITY_STEEPNESS: f64 = 10.0;

/// Calibration progress of one species.
///
/// Stages advance strictly left to right; each stage's operation requires the
/// previous one (see [`CalibrationStage::precondition`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CalibrationStage {
    Raw,
    GrowthMatched,
    SteadyState,
    BiomassMatched,
    CatchMatched,
    ConsumptionMatched,
    DietMatched,
}

impl CalibrationStage {
    pub const ALL: [CalibrationStage; 7] = [
        CalibrationStage::Raw,
        CalibrationStage::GrowthMatched,
        CalibrationStage::SteadyState,
        CalibrationStage::BiomassMatched,
        CalibrationStage::CatchMatched,
        CalibrationStage::ConsumptionMatched,
        CalibrationStage::DietMatched,
    ];

    /// The stage that must have completed before this one may run.
    pub fn precondition(self) -> Option<CalibrationStage> {
        match self {
            CalibrationStage::Raw => None,
            CalibrationStage::GrowthMatched => Some(CalibrationStage::Raw),
            CalibrationStage::SteadyState => Some(CalibrationStage::GrowthMatched),
            CalibrationStage::BiomassMatched => Some(CalibrationStage::SteadyState),
            CalibrationStage::CatchMatched => Some(CalibrationStage::BiomassMatched),
            CalibrationStage::ConsumptionMatched => Some(CalibrationStage::CatchMatched),
            CalibrationStage::DietMatched => Some(CalibrationStage::ConsumptionMatched),
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            CalibrationStage::Raw => "raw",
            CalibrationStage::GrowthMatched => "growth-matched",
            CalibrationStage::SteadyState => "steady-state",
            CalibrationStage::BiomassMatched => "biomass-matched",
            CalibrationStage::CatchMatched => "catch-matched",
            CalibrationStage::ConsumptionMatched => "consumption-matched",
            CalibrationStage::DietMatched => "diet-matched",
        }
    }
}

impl fmt::Display for CalibrationStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

/// Selectivity function attached to a gear.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SelectivityKind {
    /// Ascending logistic in length.
    #[serde(rename = "sigmoid_length")]
    Sigmoid,
    /// Product of an ascending and a descending logistic limb (dome).
    #[serde(rename = "double_sigmoid_length")]
    DoubleSigmoid,
}

impl SelectivityKind {
    pub fn display_name(self) -> &'static str {
        match self {
            SelectivityKind::Sigmoid => "sigmoid_length",
            SelectivityKind::DoubleSigmoid => "double_sigmoid_length",
        }
    }
}

/// One row of the species parameter table.
///
/// Weights are in grams, lengths in centimetres, rates per year.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpeciesParams {
    pub species: String,

    /// Egg (smallest modelled) weight.
    #[serde(default = "default_w_min")]
    pub w_min: f64,
    /// Maximum (asymptotic) weight.
    pub w_max: f64,
    /// Weight at 50% maturity.
    pub w_mat: f64,
    /// Weight at 25% maturity; sets the ogive steepness when present.
    #[serde(default)]
    pub w_mat25: Option<f64>,

    /// Length-weight coefficient in `w = a * l^b`.
    #[serde(default = "default_a")]
    pub a: f64,
    /// Length-weight exponent in `w = a * l^b`.
    #[serde(default = "default_b")]
    pub b: f64,

    /// Allometric exponent of maximum intake, encounter and (by default) metabolism.
    #[serde(default = "default_n")]
    pub n: f64,
    /// Metabolic exponent. Falls back to `n` when absent.
    #[serde(default)]
    pub p: Option<f64>,
    /// Mortality exponent. Falls back to `n - 1` when absent.
    #[serde(default)]
    pub d: Option<f64>,

    /// Assimilation efficiency.
    #[serde(default = "default_alpha")]
    pub alpha: f64,
    /// Maximum intake rate coefficient.
    pub h: f64,
    /// Search volume coefficient.
    pub gamma: f64,
    /// Prey density seen by the search volume (no-interaction regime).
    #[serde(default = "default_one")]
    pub prey_density: f64,
    /// External (non-prey) encounter rate coefficient.
    #[serde(default)]
    pub ext_encounter: f64,
    /// Metabolic respiration rate coefficient.
    pub ks: f64,

    /// Natural mortality at maturity weight.
    #[serde(default)]
    pub mu_mat: Option<f64>,
    /// Age at maturity (years).
    #[serde(default)]
    pub age_mat: Option<f64>,

    #[serde(default)]
    pub biomass_observed: Option<f64>,
    /// Only individuals heavier than this count towards observed biomass.
    #[serde(default)]
    pub biomass_cutoff: Option<f64>,
    #[serde(default)]
    pub consumption_observed: Option<f64>,
    #[serde(default)]
    pub production_observed: Option<f64>,
    #[serde(default)]
    pub yield_observed: Option<f64>,

    /// Preferred predator/prey mass ratio.
    #[serde(default = "default_beta")]
    pub beta: f64,
    /// Width of the lognormal predation kernel.
    #[serde(default = "default_sigma")]
    pub sigma: f64,
    /// Exponent of a stomach-fitted power-law kernel.
    #[serde(default)]
    pub kernel_exponent: Option<f64>,
    #[serde(default)]
    pub kernel_ll: Option<f64>,
    #[serde(default)]
    pub kernel_ul: Option<f64>,
    #[serde(default)]
    pub kernel_lr: Option<f64>,
    #[serde(default)]
    pub kernel_ur: Option<f64>,
}

fn default_w_min() -> f64 {
    0.001
}
fn default_a() -> f64 {
    0.01
}
fn default_b() -> f64 {
    3.0
}
fn default_n() -> f64 {
    0.7
}
fn default_alpha() -> f64 {
    0.8
}
fn default_one() -> f64 {
    1.0
}
fn default_beta() -> f64 {
    100.0
}
fn default_sigma() -> f64 {
    2.0
}

impl SpeciesParams {
    /// Effective metabolic exponent.
    pub fn metabolic_exponent(&self) -> f64 {
        self.p.unwrap_or(self.n)
    }

    /// Effective mortality exponent.
    pub fn mortality_exponent(&self) -> f64 {
        self.d.unwrap_or(self.n - 1.0)
    }

    /// Exponent `U` of the maturity ogive.
    pub fn maturity_steepness(&self) -> f64 {
        match self.w_mat25 {
            Some(w25) if w25.is_finite() && w25 > 0.0 && w25 < self.w_mat => {
                crate::models::LN_3 / (self.w_mat / w25).ln()
            }
            _ => DEFAULT_MATURITY_STEEPNESS,
        }
    }

    pub fn length_at(&self, w: f64) -> f64 {
        (w / self.a).powf(1.0 / self.b)
    }

    pub fn weight_at(&self, l: f64) -> f64 {
        self.a * l.powf(self.b)
    }

    /// Total encounter coefficient, i.e. `E(w) / w^n`.
    pub fn encounter_coefficient(&self) -> f64 {
        self.gamma * self.prey_density + self.ext_encounter
    }

    /// Size-independent feeding level `E / (E + h w^n)`.
    pub fn feeding_level(&self) -> f64 {
        let e = self.encounter_coefficient();
        e / (e + self.h)
    }

    /// Observed production/biomass ratio, if both targets are known.
    pub fn production_per_biomass(&self) -> Option<f64> {
        match (self.production_observed, self.biomass_observed) {
            (Some(p), Some(b)) if b > 0.0 => Some(p / b),
            _ => None,
        }
    }

    /// Check that every structural trait is finite and mutually consistent.
    pub fn validate(&self) -> Result<(), CalibrationError> {
        let fail = |msg: String| Err(CalibrationError::structural(&self.species, msg));

        let required = [
            ("w_min", self.w_min),
            ("w_max", self.w_max),
            ("w_mat", self.w_mat),
            ("a", self.a),
            ("b", self.b),
            ("n", self.n),
            ("alpha", self.alpha),
            ("h", self.h),
            ("gamma", self.gamma),
            ("prey_density", self.prey_density),
            ("ext_encounter", self.ext_encounter),
            ("ks", self.ks),
        ];
        for (name, value) in required {
            if !value.is_finite() {
                return fail(format!("{name} is not finite ({value})"));
            }
        }
        for (name, value) in [("p", self.p), ("d", self.d), ("mu_mat", self.mu_mat)] {
            if let Some(v) = value {
                if !v.is_finite() {
                    return fail(format!("{name} is not finite ({v})"));
                }
            }
        }

        if !(self.w_min > 0.0 && self.w_min < self.w_mat && self.w_mat < self.w_max) {
            return fail(format!(
                "weights must satisfy 0 < w_min < w_mat < w_max (got {}, {}, {})",
                self.w_min, self.w_mat, self.w_max
            ));
        }
        if self.a <= 0.0 || self.b <= 0.0 {
            return fail(format!("length-weight parameters must be positive (a={}, b={})", self.a, self.b));
        }
        if !(self.alpha > 0.0 && self.alpha <= 1.0) {
            return fail(format!("assimilation efficiency must be in (0, 1] (got {})", self.alpha));
        }
        if self.h <= 0.0 {
            return fail(format!("maximum intake coefficient h must be positive (got {})", self.h));
        }
        if self.gamma < 0.0 || self.ext_encounter < 0.0 || self.prey_density < 0.0 || self.ks < 0.0 {
            return fail("gamma, ext_encounter, prey_density and ks must be non-negative".to_string());
        }
        if self.encounter_coefficient() <= 0.0 {
            return fail("encounter rate is zero; the species cannot feed".to_string());
        }
        if let Some(mu) = self.mu_mat {
            if mu <= 0.0 {
                return fail(format!("mu_mat must be positive (got {mu})"));
            }
        }
        Ok(())
    }

    /// Copy Ecopath basic estimates into the observation targets.
    ///
    /// Consumption is `B * Q/B`, production is `consumption * P/Q`.
    pub fn apply_ecopath(&mut self, estimate: &EcopathEstimate) {
        self.biomass_observed = Some(estimate.biomass);
        let consumption = estimate.biomass * estimate.consumption_per_biomass;
        self.consumption_observed = Some(consumption);
        self.production_observed = Some(consumption * estimate.production_per_consumption);
    }

    /// Copy a stomach-content kernel fit.
    pub fn apply_kernel_fit(&mut self, fit: &KernelFit) {
        self.kernel_exponent = Some(fit.kernel_exponent);
        self.kernel_ll = Some(fit.ll);
        self.kernel_ul = Some(fit.ul);
        self.kernel_lr = Some(fit.lr);
        self.kernel_ur = Some(fit.ur);
    }
}

/// One row of the gear parameter table (species x gear).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GearParams {
    pub species: String,
    pub gear: String,
    pub sel_func: SelectivityKind,
    /// Length at which the ascending limb equals 25%.
    pub l25: f64,
    /// Length at which the ascending limb equals 50%.
    pub l50: f64,
    /// Length at which the descending limb equals 50%.
    #[serde(default)]
    pub l50_right: Option<f64>,
    /// Length at which the descending limb equals 25%.
    #[serde(default)]
    pub l25_right: Option<f64>,
    pub catchability: f64,
    #[serde(default = "default_one")]
    pub effort: f64,
}

impl GearParams {
    /// Default selectivity for a species with catch data but no gear row.
    ///
    /// The ascending limb is centred on the modal catch length; the dome is
    /// left unset so the curve starts as a plain logistic.
    pub fn default_for(catch: &ObservedCatch) -> GearParams {
        let modal = catch
            .bins
            .iter()
            .filter(|b| b.count.is_finite())
            .max_by(|x, y| x.count.partial_cmp(&y.count).unwrap_or(std::cmp::Ordering::Equal))
            .map(|b| b.midpoint())
            .unwrap_or(1.0);
        GearParams {
            species: catch.species.clone(),
            gear: catch.gear.clone(),
            sel_func: SelectivityKind::Sigmoid,
            l25: 0.9 * modal,
            l50: modal,
            l50_right: None,
            l25_right: None,
            catchability: 0.3,
            effort: 1.0,
        }
    }
}

/// One length bin of an observed catch histogram.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LengthBin {
    /// Lower edge of the bin.
    pub length: f64,
    /// Bin width.
    pub dl: f64,
    pub count: f64,
}

impl LengthBin {
    pub fn midpoint(&self) -> f64 {
        self.length + 0.5 * self.dl
    }
}

/// Observed catch-at-length for one species and gear, plus scalar targets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservedCatch {
    pub species: String,
    pub gear: String,
    pub bins: Vec<LengthBin>,
    /// Observed yield (mass/time).
    pub yield_observed: Option<f64>,
    /// Observed production (mass/time).
    pub production_observed: Option<f64>,
}

impl ObservedCatch {
    pub fn total_count(&self) -> f64 {
        self.bins.iter().map(|b| b.count).sum()
    }

    pub fn validate(&self) -> Result<(), CalibrationError> {
        let fail = |msg: String| Err(CalibrationError::structural(&self.species, msg));
        if self.bins.is_empty() {
            return fail("observed catch has no length bins".to_string());
        }
        for bin in &self.bins {
            if !(bin.length.is_finite() && bin.length > 0.0) {
                return fail(format!("catch bin length must be positive (got {})", bin.length));
            }
            if !(bin.dl.is_finite() && bin.dl > 0.0) {
                return fail(format!("catch bin width must be positive (got {})", bin.dl));
            }
            if !(bin.count.is_finite() && bin.count >= 0.0) {
                return fail(format!("catch count must be finite and non-negative (got {})", bin.count));
            }
        }
        if self.total_count() <= 0.0 {
            return fail("observed catch has zero total count".to_string());
        }
        for (name, value) in [("yield", self.yield_observed), ("production", self.production_observed)] {
            if let Some(v) = value {
                if !(v.is_finite() && v >= 0.0) {
                    return fail(format!("observed {name} must be finite and non-negative (got {v})"));
                }
            }
        }
        Ok(())
    }
}

/// Ecopath-style basic estimates for one group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EcopathEstimate {
    pub group: String,
    pub biomass: f64,
    /// Q/B ratio.
    pub consumption_per_biomass: f64,
    /// P/Q ratio.
    pub production_per_consumption: f64,
}

impl EcopathEstimate {
    /// P/B, derived as `Q/B * P/Q`.
    pub fn production_per_biomass(&self) -> f64 {
        self.consumption_per_biomass * self.production_per_consumption
    }
}

/// One cell of the diet-composition table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DietEntry {
    pub predator: String,
    pub prey: String,
    pub proportion: f64,
}

/// Stomach-content kernel fit for one species.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KernelFit {
    pub species: String,
    pub kernel_exponent: f64,
    pub ll: f64,
    pub ul: f64,
    pub lr: f64,
    pub ur: f64,
}

/// Settings of a calibration run.
///
/// Derived from CLI flags (plus defaults) or constructed directly by batch callers.
#[derive(Debug, Clone)]
pub struct CalibrationConfig {
    /// Number of nodes on the log-spaced weight grid.
    pub grid_points: usize,
    /// Weight of the relative yield error term.
    pub yield_lambda: f64,
    /// Weight of the relative production error term.
    pub production_lambda: f64,
    /// Catchability is floored at this value before optimization.
    pub catchability_floor: f64,
    /// Jittered retries after a failed catch fit.
    pub restarts: usize,
    pub seed: u64,
    pub optimizer: OptimizerConfig,
    pub multistart: MultiStartConfig,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            grid_points: 200,
            yield_lambda: 1.0,
            production_lambda: 1.0,
            catchability_floor: 1e-8,
            restarts: 3,
            seed: 42,
            optimizer: OptimizerConfig::default(),
            multistart: MultiStartConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stages_are_ordered_and_chained() {
        for pair in CalibrationStage::ALL.windows(2) {
            assert!(pair[0] < pair[1]);
            assert_eq!(pair[1].precondition(), Some(pair[0]));
        }
        assert_eq!(CalibrationStage::Raw.precondition(), None);
    }

    #[test]
    fn ecopath_targets_are_derived() {
        let mut sp = crate::calibration::fixtures::species();
        let estimate = EcopathEstimate {
            group: sp.species.clone(),
            biomass: 200.0,
            consumption_per_biomass: 3.0,
            production_per_consumption: 0.25,
        };
        sp.apply_ecopath(&estimate);
        assert_eq!(sp.biomass_observed, Some(200.0));
        assert_eq!(sp.consumption_observed, Some(600.0));
        assert_eq!(sp.production_observed, Some(150.0));
        assert!((sp.production_per_biomass().unwrap() - estimate.production_per_biomass()).abs() < 1e-12);
    }

    #[test]
    fn maturity_steepness_from_w_mat25() {
        let mut sp = crate::calibration::fixtures::species();
        sp.w_mat25 = None;
        assert_eq!(sp.maturity_steepness(), DEFAULT_MATURITY_STEEPNESS);
        sp.w_mat25 = Some(sp.w_mat / 2.0);
        let u = sp.maturity_steepness();
        // At w_mat25 the ogive (w/w_mat)^-U term equals 3, i.e. 25% mature.
        let ratio: f64 = 0.5;
        assert!((ratio.powf(-u) - 3.0).abs() < 1e-9);
    }

    #[test]
    fn validate_rejects_non_finite_traits() {
        let mut sp = crate::calibration::fixtures::species();
        sp.ks = f64::NAN;
        let err = sp.validate().unwrap_err();
        assert!(matches!(err, CalibrationError::StructuralInput { .. }));
        assert!(err.to_string().contains("ks"));
    }

    #[test]
    fn default_gear_centres_on_modal_length() {
        let catch = ObservedCatch {
            species: "cod".to_string(),
            gear: "trawl".to_string(),
            bins: vec![
                LengthBin { length: 10.0, dl: 2.0, count: 5.0 },
                LengthBin { length: 12.0, dl: 2.0, count: 50.0 },
                LengthBin { length: 14.0, dl: 2.0, count: 7.0 },
            ],
            yield_observed: None,
            production_observed: None,
        };
        let gear = GearParams::default_for(&catch);
        assert_eq!(gear.l50, 13.0);
        assert!(gear.l25 < gear.l50);
        assert_eq!(gear.sel_func, SelectivityKind::Sigmoid);
    }
}
