//! Catch-at-length objective for one species and gear.
//!
//! The objective combines
//!
//! - the multinomial deviance of observed vs predicted catch-at-length
//! - relative squared errors of yield and production against their targets
//!
//! as a function of the free parameters (selectivity shape, catchability and
//! natural mortality at maturity). Growth and the weight grid are held fixed
//! at the values of the biomass-matched steady state.
//!
//! Two coordinate systems are used:
//!
//! - natural `theta`, e.g. `(l50, l25/l50, mu_mat, q)` for a sigmoid gear
//! - unconstrained internal `u` (log / logit transforms) seen by the optimizer
//!
//! Gradients are exact: the whole forward model is generic over
//! [`DualNum`] and evaluated once per coordinate with a [`Dual64`] seed.

use num_dual::{Dual64, DualNum};
use serde::Serialize;

use crate::domain::{GearParams, ObservedCatch, SelectivityKind, SpeciesParams};
use crate::error::CalibrationError;
use crate::fit::{Differentiable, EvalError, OptimizationResult, Optimizer};
use crate::math::log_locate;
use crate::models::{effective_kind, logistic_decreasing, SelectivityCurve, SelectivityShape};
use crate::spectrum::{fishing_mortality, log_abundance, SizeSpectrumState};

/// Meaning of each entry of the parameter vector for a selectivity kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ParamLayout {
    /// `(l50, ratio, mu_mat, catchability)` with `ratio = l25 / l50`.
    Sigmoid,
    /// `(l50, ratio, d50, mu_mat, catchability, r_right)` with
    /// `d50 = l50_right - l50` and `r_right = l25_right / l50_right`.
    DoubleSigmoid,
}

const SIGMOID_NAMES: [&str; 4] = ["l50", "ratio", "mu_mat", "catchability"];
const DOUBLE_SIGMOID_NAMES: [&str; 6] = ["l50", "ratio", "d50", "mu_mat", "catchability", "r_right"];

impl ParamLayout {
    /// Layout and natural parameter vector describing `gear` with the given `mu_mat`.
    ///
    /// A dome without a usable descending limb is fitted as a plain sigmoid.
    pub fn from_gear(gear: &GearParams, mu_mat: f64) -> (Self, Vec<f64>) {
        let ratio = gear.l25 / gear.l50;
        match (effective_kind(gear), gear.l50_right.zip(gear.l25_right)) {
            (SelectivityKind::DoubleSigmoid, Some((l50r, l25r))) => (
                ParamLayout::DoubleSigmoid,
                vec![gear.l50, ratio, l50r - gear.l50, mu_mat, gear.catchability, l25r / l50r],
            ),
            _ => (ParamLayout::Sigmoid, vec![gear.l50, ratio, mu_mat, gear.catchability]),
        }
    }

    pub fn names(self) -> &'static [&'static str] {
        match self {
            ParamLayout::Sigmoid => &SIGMOID_NAMES,
            ParamLayout::DoubleSigmoid => &DOUBLE_SIGMOID_NAMES,
        }
    }

    pub fn len(self) -> usize {
        self.names().len()
    }

    pub fn index_of(self, name: &str) -> Option<usize> {
        self.names().iter().position(|n| *n == name)
    }

    pub fn mu_index(self) -> usize {
        match self {
            ParamLayout::Sigmoid => 2,
            ParamLayout::DoubleSigmoid => 3,
        }
    }

    pub fn catchability_index(self) -> usize {
        self.mu_index() + 1
    }

    /// Check that `theta` describes a valid curve and positive rates.
    pub fn validate(self, theta: &[f64]) -> Result<(), EvalError> {
        let fail = |msg: String| Err(EvalError::Construction(msg));
        if theta.len() != self.len() {
            return fail(format!("expected {} parameters, got {}", self.len(), theta.len()));
        }
        if let Some(i) = theta.iter().position(|v| !v.is_finite()) {
            return fail(format!("{} is not finite ({})", self.names()[i], theta[i]));
        }
        if theta[0] <= 0.0 {
            return fail(format!("l50 must be positive (got {})", theta[0]));
        }
        if !(theta[1] > 0.0 && theta[1] < 1.0) {
            return fail(format!("l25 must lie strictly between 0 and l50 (ratio {})", theta[1]));
        }
        if self == ParamLayout::DoubleSigmoid {
            if theta[2] <= 0.0 {
                return fail(format!(
                    "l50_right ({}) must exceed l50 ({}); descending limb is inverted",
                    theta[0] + theta[2],
                    theta[0]
                ));
            }
            if theta[5] <= 1.0 {
                return fail(format!("l25_right must exceed l50_right (ratio {})", theta[5]));
            }
        }
        if theta[self.mu_index()] <= 0.0 {
            return fail(format!("mu_mat must be positive (got {})", theta[self.mu_index()]));
        }
        if theta[self.catchability_index()] <= 0.0 {
            return fail(format!("catchability must be positive (got {})", theta[self.catchability_index()]));
        }
        Ok(())
    }

    /// Natural to internal coordinates.
    pub fn to_internal(self, theta: &[f64]) -> Result<Vec<f64>, EvalError> {
        self.validate(theta)?;
        Ok(theta
            .iter()
            .enumerate()
            .map(|(i, &v)| match (self, i) {
                (_, 1) => (v / (1.0 - v)).ln(),
                (ParamLayout::DoubleSigmoid, 5) => (v - 1.0).ln(),
                _ => v.ln(),
            })
            .collect())
    }

    /// Internal to natural coordinates.
    pub fn to_natural<T: DualNum<f64> + Copy>(self, u: &[T]) -> Vec<T> {
        u.iter()
            .enumerate()
            .map(|(i, &v)| match (self, i) {
                (_, 1) => logistic_decreasing(-v),
                (ParamLayout::DoubleSigmoid, 5) => v.exp() + 1.0,
                _ => v.exp(),
            })
            .collect()
    }

    /// Model quantities described by a natural parameter vector.
    pub fn params<T: DualNum<f64> + Copy>(self, theta: &[T]) -> CatchParams<T> {
        let l50 = theta[0];
        let l25 = theta[1] * l50;
        match self {
            ParamLayout::Sigmoid => CatchParams {
                l25,
                l50,
                right: None,
                mu_mat: theta[2],
                catchability: theta[3],
            },
            ParamLayout::DoubleSigmoid => {
                let l50_right = l50 + theta[2];
                CatchParams {
                    l25,
                    l50,
                    right: Some((l50_right, theta[5] * l50_right)),
                    mu_mat: theta[3],
                    catchability: theta[4],
                }
            }
        }
    }
}

/// Selectivity, mortality and catchability for one objective evaluation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CatchParams<T> {
    pub l25: T,
    pub l50: T,
    /// `(l50_right, l25_right)` for a dome.
    pub right: Option<(T, T)>,
    pub mu_mat: T,
    pub catchability: T,
}

impl CatchParams<f64> {
    /// The gear row with these selectivity and catchability values.
    pub fn apply_to(&self, gear: &GearParams) -> GearParams {
        let mut out = gear.clone();
        out.l25 = self.l25;
        out.l50 = self.l50;
        if let Some((l50_right, l25_right)) = self.right {
            out.l50_right = Some(l50_right);
            out.l25_right = Some(l25_right);
        }
        out.catchability = self.catchability;
        out
    }
}

/// Decomposition of one objective value.
#[derive(Debug, Clone, Serialize)]
pub struct ObjectiveBreakdown {
    pub total: f64,
    pub deviance: f64,
    pub yield_term: f64,
    pub production_term: f64,
    pub predicted_yield: f64,
    pub predicted_production: f64,
    /// Predicted catch per observed bin, in numbers per unit time.
    pub predicted_catch: Vec<f64>,
}

#[derive(Debug, Clone)]
struct BinTerm {
    /// Bin midpoint length.
    length: f64,
    count: f64,
    /// `ln(count / total)`, unused for empty bins.
    log_share: f64,
    /// `dw/dl * dl` at the midpoint.
    width: f64,
    node: usize,
    frac: f64,
}

#[derive(Debug, Clone, Copy)]
struct Penalty {
    lambda: f64,
    target: Option<f64>,
}

impl Penalty {
    fn is_active(&self) -> bool {
        self.lambda > 0.0 && self.target.is_some_and(|t| t > 0.0)
    }

    fn term<T: DualNum<f64> + Copy>(&self, predicted: T) -> T {
        match self.target {
            Some(target) if self.is_active() => {
                let rel = predicted / target - 1.0;
                rel * rel * self.lambda
            }
            _ => T::from(0.0),
        }
    }
}

struct Forward<T> {
    total: T,
    deviance: T,
    yield_term: T,
    production_term: T,
    predicted_yield: T,
    predicted_production: T,
    catch: Vec<T>,
}

/// Assembles a [`CatchObjective`] for one species and one gear.
///
/// All structural checks (bin layout, gear geometry, targets) happen in
/// [`ObjectiveBuilder::build`], before any optimizer run.
#[derive(Debug, Clone)]
pub struct ObjectiveBuilder<'a> {
    species: &'a SpeciesParams,
    gears: &'a [GearParams],
    state: &'a SizeSpectrumState,
    catch: &'a ObservedCatch,
    yield_lambda: f64,
    production_lambda: f64,
    catchability_floor: f64,
}

impl<'a> ObjectiveBuilder<'a> {
    pub fn new(
        species: &'a SpeciesParams,
        gears: &'a [GearParams],
        state: &'a SizeSpectrumState,
        catch: &'a ObservedCatch,
    ) -> Self {
        Self {
            species,
            gears,
            state,
            catch,
            yield_lambda: 1.0,
            production_lambda: 1.0,
            catchability_floor: 1e-8,
        }
    }

    pub fn yield_lambda(mut self, lambda: f64) -> Self {
        self.yield_lambda = lambda;
        self
    }

    pub fn production_lambda(mut self, lambda: f64) -> Self {
        self.production_lambda = lambda;
        self
    }

    /// Lower bound applied to the catchability of every starting vector.
    pub fn catchability_floor(mut self, floor: f64) -> Self {
        self.catchability_floor = floor;
        self
    }

    pub fn build(self) -> Result<CatchObjective, CalibrationError> {
        let sp = self.species;
        let fail = |msg: String| Err(CalibrationError::structural(&sp.species, msg));

        self.catch.validate()?;
        if self.catch.species != sp.species {
            return fail(format!("catch table belongs to species '{}'", self.catch.species));
        }
        let Some(gear) = self
            .gears
            .iter()
            .find(|g| g.species == sp.species && g.gear == self.catch.gear)
        else {
            return fail(format!("no gear row for gear '{}'", self.catch.gear));
        };
        SelectivityCurve::from_gear(gear)?;
        if !(gear.effort.is_finite() && gear.effort > 0.0) {
            return fail(format!("gear '{}' effort must be positive (got {})", gear.gear, gear.effort));
        }

        for (name, lambda) in [("yield", self.yield_lambda), ("production", self.production_lambda)] {
            if !(lambda.is_finite() && lambda >= 0.0) {
                return fail(format!("{name} penalty weight must be finite and non-negative (got {lambda})"));
            }
        }
        let biomass_target = match sp.biomass_observed {
            Some(b) if b.is_finite() && b > 0.0 => b,
            other => return fail(format!("catch fit needs a positive observed biomass (got {other:?})")),
        };

        let grid = &self.state.grid;
        let others: Vec<GearParams> = self
            .gears
            .iter()
            .filter(|g| g.species == sp.species && g.gear != gear.gear)
            .cloned()
            .collect();
        let other_fishing = fishing_mortality(sp, &others, grid)?;

        let cutoff = self.state.biomass_cutoff;
        let d = sp.mortality_exponent();
        let natural_shape = grid.w.iter().map(|&w| (w / sp.w_mat).powf(d)).collect();
        let biomass_weight = grid
            .w
            .iter()
            .zip(&grid.dw)
            .map(|(&w, &dw)| if w >= cutoff { w * dw } else { 0.0 })
            .collect();

        let total = self.catch.total_count();
        let l_max = grid.l[grid.len() - 1];
        let mut bins = Vec::with_capacity(self.catch.bins.len());
        for bin in &self.catch.bins {
            let length = bin.midpoint();
            let Some((node, frac)) = log_locate(&grid.w, sp.weight_at(length)) else {
                return fail(format!(
                    "catch bin at {length} cm lies outside the modelled length range ({:.3}..{l_max:.3} cm)",
                    grid.l[0]
                ));
            };
            bins.push(BinTerm {
                length,
                count: bin.count,
                log_share: if bin.count > 0.0 { (bin.count / total).ln() } else { 0.0 },
                width: sp.a * sp.b * length.powf(sp.b - 1.0) * bin.dl,
                node,
                frac,
            });
        }

        let (layout, mut start) = ParamLayout::from_gear(gear, self.state.mu_mat);
        let q = layout.catchability_index();
        start[q] = start[q].max(self.catchability_floor);

        Ok(CatchObjective {
            species: sp.species.clone(),
            gear: gear.clone(),
            layout,
            start,
            catchability_floor: self.catchability_floor,
            w_dw: grid.w.iter().zip(&grid.dw).map(|(&w, &dw)| w * dw).collect(),
            l: grid.l.clone(),
            dw: grid.dw.clone(),
            growth: self.state.growth.clone(),
            available_dw: self.state.available.iter().zip(&grid.dw).map(|(&e, &dw)| e * dw).collect(),
            natural_shape,
            other_fishing,
            biomass_weight,
            biomass_target,
            bins,
            yield_penalty: Penalty {
                lambda: self.yield_lambda,
                target: self.catch.yield_observed.or(sp.yield_observed),
            },
            production_penalty: Penalty {
                lambda: self.production_lambda,
                target: self.catch.production_observed.or(sp.production_observed),
            },
        })
    }
}

/// The composite catch objective of one species and gear.
///
/// Immutable once built, so one instance can be shared across parallel
/// optimizer runs.
#[derive(Debug, Clone)]
pub struct CatchObjective {
    species: String,
    gear: GearParams,
    layout: ParamLayout,
    start: Vec<f64>,
    catchability_floor: f64,
    w_dw: Vec<f64>,
    l: Vec<f64>,
    dw: Vec<f64>,
    growth: Vec<f64>,
    available_dw: Vec<f64>,
    /// `(w / w_mat)^d` at each node.
    natural_shape: Vec<f64>,
    /// Fishing mortality from the species' other gears.
    other_fishing: Vec<f64>,
    biomass_weight: Vec<f64>,
    biomass_target: f64,
    bins: Vec<BinTerm>,
    yield_penalty: Penalty,
    production_penalty: Penalty,
}

impl CatchObjective {
    pub fn species(&self) -> &str {
        &self.species
    }

    pub fn gear(&self) -> &GearParams {
        &self.gear
    }

    pub fn layout(&self) -> ParamLayout {
        self.layout
    }

    /// Natural starting vector taken from the gear row and current `mu_mat`.
    pub fn initial_theta(&self) -> &[f64] {
        &self.start
    }

    /// Objective value and its decomposition at natural parameters `theta`.
    pub fn evaluate(&self, theta: &[f64]) -> Result<ObjectiveBreakdown, EvalError> {
        self.layout.validate(theta)?;
        let fwd = self.forward(&self.layout.params(theta))?;
        Ok(ObjectiveBreakdown {
            total: fwd.total,
            deviance: fwd.deviance,
            yield_term: fwd.yield_term,
            production_term: fwd.production_term,
            predicted_yield: fwd.predicted_yield,
            predicted_production: fwd.predicted_production,
            predicted_catch: fwd.catch,
        })
    }

    /// Objective value and gradient with respect to natural parameters.
    pub fn gradient(&self, theta: &[f64]) -> Result<(f64, Vec<f64>), EvalError> {
        self.layout.validate(theta)?;
        self.dual_passes(theta, |seeded| self.layout.params(seeded))
    }

    /// Run the optimizer from natural starting vector `theta0`.
    ///
    /// The returned parameters are natural.
    pub fn optimize(&self, theta0: &[f64], optimizer: &Optimizer) -> OptimizationResult {
        self.optimize_with_fixed(theta0, &[], optimizer)
    }

    /// As [`Self::optimize`], keeping coordinates with `fixed[i] == true` at their start value.
    pub fn optimize_with_fixed(&self, theta0: &[f64], fixed: &[bool], optimizer: &Optimizer) -> OptimizationResult {
        let mut start = theta0.to_vec();
        let q = self.layout.catchability_index();
        if q < start.len() && !fixed.get(q).copied().unwrap_or(false) {
            start[q] = start[q].max(self.catchability_floor);
        }
        let u0 = match self.layout.to_internal(&start) {
            Ok(u) => u,
            Err(err) => return OptimizationResult::failed(theta0.to_vec(), 0, 0, &err),
        };
        let mut result = optimizer.minimise(self, &u0, fixed);
        result.parameters = self.layout.to_natural(&result.parameters);
        // Fixed coordinates are returned exactly as supplied.
        for (i, &is_fixed) in fixed.iter().enumerate() {
            if is_fixed && i < theta0.len() {
                result.parameters[i] = theta0[i];
            }
        }
        result
    }

    /// One dual pass per coordinate; `map` turns the seeded vector into model parameters.
    fn dual_passes<F>(&self, x: &[f64], map: F) -> Result<(f64, Vec<f64>), EvalError>
    where
        F: Fn(&[Dual64]) -> CatchParams<Dual64>,
    {
        let mut value = f64::NAN;
        let mut grad = Vec::with_capacity(x.len());
        for j in 0..x.len() {
            let seeded: Vec<Dual64> = x
                .iter()
                .enumerate()
                .map(|(i, &v)| Dual64::new(v, if i == j { 1.0 } else { 0.0 }))
                .collect();
            let total = self.forward(&map(&seeded))?.total;
            value = total.re;
            grad.push(total.eps);
        }
        if grad.iter().any(|g| !g.is_finite()) {
            return Err(EvalError::Gradient);
        }
        Ok((value, grad))
    }

    fn forward<T: DualNum<f64> + Copy>(&self, p: &CatchParams<T>) -> Result<Forward<T>, EvalError> {
        let shape = SelectivityShape {
            l25: p.l25,
            l50: p.l50,
            right: p.right,
        };
        let effort_q = p.catchability * self.gear.effort;

        let len = self.l.len();
        let mut fishing = Vec::with_capacity(len);
        let mut mortality = Vec::with_capacity(len);
        for i in 0..len {
            let f = shape.at(self.l[i]) * effort_q + self.other_fishing[i];
            mortality.push(p.mu_mat * self.natural_shape[i] + f);
            fishing.push(f);
        }

        let ln_n = log_abundance(&self.growth, &mortality, &self.dw).map_err(EvalError::Construction)?;
        let n: Vec<T> = ln_n.iter().map(|v| v.exp()).collect();

        let biomass = weighted_sum(&n, &self.biomass_weight);
        if !(biomass.re().is_finite() && biomass.re() > 0.0) {
            return Err(EvalError::NonFinite);
        }
        // Abundance per unit N_0, rescaled to the observed biomass.
        let scale = biomass.recip() * self.biomass_target;

        let mut catch = Vec::with_capacity(self.bins.len());
        for bin in &self.bins {
            // Exact node hits avoid 0 * (-inf) when the neighbour underflows.
            let ln_nb = if bin.frac == 0.0 {
                ln_n[bin.node]
            } else if bin.frac == 1.0 {
                ln_n[bin.node + 1]
            } else {
                ln_n[bin.node] * (1.0 - bin.frac) + ln_n[bin.node + 1] * bin.frac
            };
            catch.push(shape.at(bin.length) * effort_q * ln_nb.exp() * scale * bin.width);
        }
        let total_catch = catch.iter().fold(T::from(0.0), |acc, &c| acc + c);
        if !(total_catch.re().is_finite() && total_catch.re() > 0.0) {
            return Err(EvalError::NonFinite);
        }

        let ln_total = total_catch.ln();
        let deviance = self
            .bins
            .iter()
            .zip(&catch)
            .filter(|(bin, _)| bin.count > 0.0)
            .fold(T::from(0.0), |acc, (bin, &c)| acc + (ln_total - c.ln() + bin.log_share) * bin.count);

        let fishing_w_dw: Vec<T> = fishing.iter().zip(&self.w_dw).map(|(&f, &x)| f * x).collect();
        let predicted_yield = n
            .iter()
            .zip(&fishing_w_dw)
            .fold(T::from(0.0), |acc, (&ni, &fi)| acc + ni * fi)
            * scale;
        let predicted_production = weighted_sum(&n, &self.available_dw) * scale;

        let yield_term = self.yield_penalty.term(predicted_yield);
        let production_term = self.production_penalty.term(predicted_production);
        let total = deviance + yield_term + production_term;
        if !total.re().is_finite() {
            return Err(EvalError::NonFinite);
        }

        Ok(Forward {
            total,
            deviance,
            yield_term,
            production_term,
            predicted_yield,
            predicted_production,
            catch,
        })
    }
}

fn weighted_sum<T: DualNum<f64> + Copy>(values: &[T], weights: &[f64]) -> T {
    values
        .iter()
        .zip(weights)
        .fold(T::from(0.0), |acc, (&v, &w)| acc + v * w)
}

impl Differentiable for CatchObjective {
    fn value(&self, u: &[f64]) -> Result<f64, EvalError> {
        let theta = self.layout.to_natural(u);
        Ok(self.forward(&self.layout.params(&theta))?.total)
    }

    fn value_and_gradient(&self, u: &[f64]) -> Result<(f64, Vec<f64>), EvalError> {
        self.dual_passes(u, |seeded| {
            let theta = self.layout.to_natural(seeded);
            self.layout.params(&theta)
        })
    }
}
