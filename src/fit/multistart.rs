//! Robustness diagnostics for the catch fit.
//!
//! - `multi_start`: independent optimizer runs from jittered starting vectors
//! - `profile`: objective along one parameter with the others re-optimized
//!
//! Runs are independent evaluations of the same immutable objective, executed
//! in parallel and reduced only after all of them complete.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use log::{debug, warn};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Uniform};
use rayon::prelude::*;
use serde::Serialize;

use crate::error::CalibrationError;
use crate::fit::{CatchObjective, OptimizationResult, Optimizer, ParamLayout};
use crate::math::{median_mut, quartiles};

/// Settings for multi-start and profile analyses.
#[derive(Debug, Clone)]
pub struct MultiStartConfig {
    pub runs: usize,
    /// Multiplier range for selectivity shape parameters.
    pub shape_jitter: (f64, f64),
    /// Multiplier range for mortality and catchability.
    pub rate_jitter: (f64, f64),
    /// Absolute objective distance from the best run counted as equivalent.
    pub band: f64,
    /// Outliers lie above `Q3 + outlier_iqr * IQR`.
    pub outlier_iqr: f64,
    /// Relative parameter spread among in-band runs that flags a flat ridge.
    pub identifiability_tolerance: f64,
    pub seed: u64,
}

impl Default for MultiStartConfig {
    fn default() -> Self {
        Self {
            runs: 30,
            shape_jitter: (0.8, 1.2),
            rate_jitter: (0.2, 2.0),
            band: 0.5,
            outlier_iqr: 2.0,
            identifiability_tolerance: 0.05,
            seed: 42,
        }
    }
}

/// One optimizer run of a multi-start analysis.
#[derive(Debug, Clone, Serialize)]
pub struct MultiStartRun {
    pub index: usize,
    /// Jitter factor drawn for each parameter.
    pub multipliers: Vec<f64>,
    pub start: Vec<f64>,
    pub result: OptimizationResult,
    pub within_band: bool,
    pub outlier: bool,
}

/// Range of one parameter over the in-band runs.
#[derive(Debug, Clone, Serialize)]
pub struct ParameterSpread {
    pub name: String,
    pub min: f64,
    pub max: f64,
    /// `(max - min) / |median|`.
    pub relative_range: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MultiStartSummary {
    pub species: String,
    pub runs: Vec<MultiStartRun>,
    /// Index of the run with the lowest objective.
    pub best: Option<usize>,
    pub best_objective: f64,
    /// Share of runs that ended without a failure.
    pub success_rate: f64,
    pub quartiles: Option<(f64, f64)>,
    pub outlier_threshold: Option<f64>,
    pub in_band: usize,
    pub spread: Vec<ParameterSpread>,
    /// Distinct parameter vectors reach equivalent objective values.
    pub non_identifiable: bool,
}

impl MultiStartSummary {
    pub fn best_run(&self) -> Option<&MultiStartRun> {
        self.best.map(|i| &self.runs[i])
    }

    pub fn outliers(&self) -> impl Iterator<Item = &MultiStartRun> {
        self.runs.iter().filter(|r| r.outlier)
    }
}

/// Jittered starting vector and the multipliers used to build it.
///
/// Shape multipliers act on `l50` and `d50` directly and on the gaps
/// `1 - ratio` and `r_right - 1`, so every start describes a valid curve.
pub fn jittered_start(
    layout: ParamLayout,
    theta0: &[f64],
    config: &MultiStartConfig,
    rng: &mut StdRng,
) -> (Vec<f64>, Vec<f64>) {
    let mut multipliers = Vec::with_capacity(theta0.len());
    let mut start = Vec::with_capacity(theta0.len());
    for (i, (&value, name)) in theta0.iter().zip(layout.names()).enumerate() {
        let is_rate = i == layout.mu_index() || i == layout.catchability_index();
        let m = draw(rng, if is_rate { config.rate_jitter } else { config.shape_jitter });
        let jittered = match *name {
            "ratio" => (1.0 - (1.0 - value) * m).max(0.5 * value),
            "r_right" => 1.0 + (value - 1.0) * m,
            _ => value * m,
        };
        multipliers.push(m);
        start.push(jittered);
    }
    (start, multipliers)
}

fn draw(rng: &mut StdRng, (lo, hi): (f64, f64)) -> f64 {
    if hi > lo {
        Uniform::new(lo, hi).sample(rng)
    } else {
        lo
    }
}

/// Deterministic seed of one jittered run, independent of scheduling order.
pub fn run_seed(species: &str, base: u64, run: usize) -> u64 {
    let mut hasher = DefaultHasher::new();
    species.hash(&mut hasher);
    base.hash(&mut hasher);
    run.hash(&mut hasher);
    hasher.finish()
}

/// Optimize from `config.runs` jittered copies of `theta0` and summarise.
pub fn multi_start(
    objective: &CatchObjective,
    theta0: &[f64],
    optimizer: &Optimizer,
    config: &MultiStartConfig,
) -> MultiStartSummary {
    let layout = objective.layout();
    let runs: Vec<MultiStartRun> = (0..config.runs)
        .into_par_iter()
        .map(|index| {
            let mut rng = StdRng::seed_from_u64(run_seed(objective.species(), config.seed, index));
            let (start, multipliers) = jittered_start(layout, theta0, config, &mut rng);
            let result = objective.optimize(&start, optimizer);
            if let Some(reason) = result.failure() {
                warn!("{}: multi-start run {index} discarded ({reason})", objective.species());
            }
            MultiStartRun {
                index,
                multipliers,
                start,
                result,
                within_band: false,
                outlier: false,
            }
        })
        .collect();

    summarise(objective.species(), layout, runs, config)
}

/// Classify finished runs: best, band membership, outliers, parameter spread.
pub fn summarise(
    species: &str,
    layout: ParamLayout,
    mut runs: Vec<MultiStartRun>,
    config: &MultiStartConfig,
) -> MultiStartSummary {
    let usable: Vec<usize> = (0..runs.len()).filter(|&i| runs[i].result.is_usable()).collect();
    let best = usable
        .iter()
        .copied()
        .min_by(|&a, &b| runs[a].result.objective.total_cmp(&runs[b].result.objective));
    let best_objective = best.map_or(f64::NAN, |i| runs[i].result.objective);

    let objectives: Vec<f64> = usable.iter().map(|&i| runs[i].result.objective).collect();
    let quartiles = quartiles(&objectives);
    // A run inside the band is never an outlier, however tight the IQR.
    let outlier_threshold =
        quartiles.map(|(q1, q3)| (q3 + config.outlier_iqr * (q3 - q1)).max(best_objective + config.band));

    for &i in &usable {
        let objective = runs[i].result.objective;
        runs[i].within_band = objective - best_objective <= config.band;
        runs[i].outlier = outlier_threshold.is_some_and(|t| objective > t);
    }
    let in_band = runs.iter().filter(|r| r.within_band).count();

    let spread: Vec<ParameterSpread> = layout
        .names()
        .iter()
        .enumerate()
        .filter_map(|(k, name)| {
            let mut values: Vec<f64> = runs
                .iter()
                .filter(|r| r.within_band)
                .map(|r| r.result.parameters[k])
                .collect();
            let min = values.iter().copied().fold(f64::INFINITY, f64::min);
            let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            let median = median_mut(&mut values)?;
            Some(ParameterSpread {
                name: name.to_string(),
                min,
                max,
                relative_range: (max - min) / median.abs().max(f64::MIN_POSITIVE),
            })
        })
        .collect();
    let non_identifiable = spread
        .iter()
        .any(|s| s.relative_range > config.identifiability_tolerance);

    let success_rate = if runs.is_empty() {
        0.0
    } else {
        usable.len() as f64 / runs.len() as f64
    };
    debug!(
        "{species}: multi-start {} runs, {} usable, {in_band} within band, best {best_objective:.6e}",
        runs.len(),
        usable.len()
    );

    MultiStartSummary {
        species: species.to_string(),
        runs,
        best,
        best_objective,
        success_rate,
        quartiles,
        outlier_threshold,
        in_band,
        spread,
        non_identifiable,
    }
}

/// One grid value of a profile.
#[derive(Debug, Clone, Serialize)]
pub struct ProfilePoint {
    pub value: f64,
    pub result: OptimizationResult,
}

#[derive(Debug, Clone, Serialize)]
pub struct Profile {
    pub species: String,
    pub parameter: String,
    pub points: Vec<ProfilePoint>,
    /// Highest minus lowest usable objective along the profile.
    pub objective_range: f64,
    /// The profile stays within `band` of its minimum over the whole grid.
    pub flat: bool,
}

impl Profile {
    pub fn best_point(&self) -> Option<&ProfilePoint> {
        self.points
            .iter()
            .filter(|p| p.result.is_usable())
            .min_by(|a, b| a.result.objective.total_cmp(&b.result.objective))
    }
}

/// Profile the objective along `parameter`, re-optimizing all other parameters.
pub fn profile(
    objective: &CatchObjective,
    theta0: &[f64],
    parameter: &str,
    values: &[f64],
    optimizer: &Optimizer,
    band: f64,
) -> Result<Profile, CalibrationError> {
    let layout = objective.layout();
    let Some(index) = layout.index_of(parameter) else {
        return Err(CalibrationError::structural(
            objective.species(),
            format!(
                "unknown parameter '{parameter}' (expected one of: {})",
                layout.names().join(", ")
            ),
        ));
    };
    if theta0.len() != layout.len() {
        return Err(CalibrationError::structural(
            objective.species(),
            format!("expected {} parameters, got {}", layout.len(), theta0.len()),
        ));
    }

    let mut fixed = vec![false; layout.len()];
    fixed[index] = true;

    let points: Vec<ProfilePoint> = values
        .par_iter()
        .map(|&value| {
            let mut start = theta0.to_vec();
            start[index] = value;
            let result = objective.optimize_with_fixed(&start, &fixed, optimizer);
            ProfilePoint { value, result }
        })
        .collect();

    let usable: Vec<f64> = points
        .iter()
        .filter(|p| p.result.is_usable())
        .map(|p| p.result.objective)
        .collect();
    let lo = usable.iter().copied().fold(f64::INFINITY, f64::min);
    let hi = usable.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let objective_range = if usable.is_empty() { f64::NAN } else { hi - lo };

    Ok(Profile {
        species: objective.species().to_string(),
        parameter: parameter.to_string(),
        flat: usable.len() >= 2 && objective_range <= band,
        points,
        objective_range,
    })
}
