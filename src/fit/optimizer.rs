//! Quasi-Newton minimisation (BFGS) with backtracking line search.
//!
//! The optimizer works on unconstrained coordinates: feasibility of the model
//! parameters is encoded by the caller's reparameterization, so any finite
//! vector is a valid trial point. Points where the objective cannot be
//! evaluated are treated as rejected line-search steps.

use std::fmt;

use log::debug;
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

/// Why an objective evaluation failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EvalError {
    /// Parameters do not describe a valid model (e.g. inverted selectivity limb).
    Construction(String),
    /// The objective value is not finite.
    NonFinite,
    /// The objective is finite but its gradient is not.
    Gradient,
}

impl fmt::Display for EvalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EvalError::Construction(msg) => write!(f, "invalid parameters: {msg}"),
            EvalError::NonFinite => f.write_str("objective is not finite"),
            EvalError::Gradient => f.write_str("gradient is not finite"),
        }
    }
}

/// Failure classes reported by a discarded optimizer run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    ConstructionFailure,
    NonConvergent,
    GradientFailure,
}

impl From<&EvalError> for FailureReason {
    fn from(err: &EvalError) -> Self {
        match err {
            EvalError::Construction(_) => FailureReason::ConstructionFailure,
            EvalError::NonFinite => FailureReason::NonConvergent,
            EvalError::Gradient => FailureReason::GradientFailure,
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FailureReason::ConstructionFailure => "construction failure",
            FailureReason::NonConvergent => "non-convergent",
            FailureReason::GradientFailure => "gradient failure",
        })
    }
}

/// Termination state of an optimizer run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizationStatus {
    Converged,
    /// Iteration cap reached with the objective still decreasing.
    IterationLimit,
    /// No descent step found although the gradient is not negligible.
    Stalled,
    Failed(FailureReason),
}

/// Outcome of one optimizer run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizationResult {
    pub parameters: Vec<f64>,
    pub objective: f64,
    pub iterations: usize,
    pub evaluations: usize,
    pub status: OptimizationStatus,
}

impl OptimizationResult {
    pub fn converged(&self) -> bool {
        self.status == OptimizationStatus::Converged
    }

    pub fn failure(&self) -> Option<FailureReason> {
        match self.status {
            OptimizationStatus::Failed(reason) => Some(reason),
            _ => None,
        }
    }

    /// A run that did not fail and ended at a finite objective.
    pub fn is_usable(&self) -> bool {
        self.failure().is_none() && self.objective.is_finite()
    }

    pub(crate) fn failed(parameters: Vec<f64>, iterations: usize, evaluations: usize, err: &EvalError) -> Self {
        Self {
            parameters,
            objective: f64::NAN,
            iterations,
            evaluations,
            status: OptimizationStatus::Failed(err.into()),
        }
    }
}

/// A scalar objective with a gradient.
pub trait Differentiable {
    fn value(&self, x: &[f64]) -> Result<f64, EvalError>;

    fn value_and_gradient(&self, x: &[f64]) -> Result<(f64, Vec<f64>), EvalError>;
}

/// Consecutive accepted steps below `objective_tolerance` before a run with a
/// non-negligible gradient is reported as stalled.
const FLAT_STEPS: usize = 3;

/// Configuration for the BFGS solver.
#[derive(Debug, Clone)]
pub struct OptimizerConfig {
    pub max_iterations: usize,
    /// Converged when `max|g| <= gradient_tolerance * (1 + |f|)`.
    pub gradient_tolerance: f64,
    /// Accepted steps improving `f` by less than this (relative) count as flat.
    pub objective_tolerance: f64,
    /// Armijo sufficient-decrease constant.
    pub c1: f64,
    /// Step shrink factor during backtracking.
    pub backtrack: f64,
    pub max_line_search: usize,
    /// Largest change of any coordinate in a single step.
    pub max_step: f64,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            max_iterations: 500,
            gradient_tolerance: 1e-9,
            objective_tolerance: 1e-15,
            c1: 1e-4,
            backtrack: 0.5,
            max_line_search: 50,
            max_step: 1.0,
        }
    }
}

/// BFGS quasi-Newton solver.
///
/// Keeps an approximation of the inverse Hessian, scaled after the first
/// accepted step. Coordinates flagged as fixed keep their starting value.
#[derive(Debug, Clone, Default)]
pub struct Optimizer {
    config: OptimizerConfig,
}

impl Optimizer {
    pub fn new(config: OptimizerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &OptimizerConfig {
        &self.config
    }

    /// Minimise `objective` from `start`. `fixed[i] == true` freezes coordinate `i`.
    pub fn minimise<F>(&self, objective: &F, start: &[f64], fixed: &[bool]) -> OptimizationResult
    where
        F: Differentiable + ?Sized,
    {
        let cfg = &self.config;
        let dim = start.len();
        let free: Vec<bool> = (0..dim).map(|i| !fixed.get(i).copied().unwrap_or(false)).collect();
        let identity = masked_identity(&free);

        let mut evaluations = 1;
        let (mut f, grad) = match objective.value_and_gradient(start) {
            Ok(v) => v,
            Err(err) => {
                debug!("optimizer start rejected: {err}");
                return OptimizationResult::failed(start.to_vec(), 0, evaluations, &err);
            }
        };
        if !f.is_finite() {
            return OptimizationResult::failed(start.to_vec(), 0, evaluations, &EvalError::NonFinite);
        }
        if grad.iter().any(|v| !v.is_finite()) {
            return OptimizationResult::failed(start.to_vec(), 0, evaluations, &EvalError::Gradient);
        }

        let mut x = DVector::from_column_slice(start);
        let mut g = masked(DVector::from_vec(grad), &free);
        let mut h_inv = identity.clone();
        let mut scaled = false;
        let mut flat_steps = 0;

        for iteration in 0..cfg.max_iterations {
            let g_norm = g.amax();
            if g_norm <= cfg.gradient_tolerance * (1.0 + f.abs()) {
                return finish(x, f, iteration, evaluations, OptimizationStatus::Converged);
            }

            // Search direction p = -H g, falling back to steepest descent.
            let mut p = -(&h_inv * &g);
            let mut slope = p.dot(&g);
            if !(slope < 0.0) {
                h_inv = identity.clone();
                p = -g.clone();
                slope = p.dot(&g);
            }
            let p_max = p.amax();
            if p_max > cfg.max_step {
                p *= cfg.max_step / p_max;
                slope = p.dot(&g);
            }

            // Backtracking line search (Armijo condition).
            let mut alpha = 1.0;
            let mut accepted = None;
            for _ in 0..cfg.max_line_search {
                let trial = &x + &p * alpha;
                evaluations += 1;
                if let Ok(f_trial) = objective.value(trial.as_slice()) {
                    if f_trial.is_finite() && f_trial <= f + cfg.c1 * alpha * slope {
                        accepted = Some(trial);
                        break;
                    }
                }
                alpha *= cfg.backtrack;
            }

            // The gradient test above failed, so no descent step means a stall.
            let Some(x_new) = accepted else {
                return finish(x, f, iteration, evaluations, OptimizationStatus::Stalled);
            };

            evaluations += 1;
            let (f_new, grad_new) = match objective.value_and_gradient(x_new.as_slice()) {
                Ok(v) => v,
                Err(err) => {
                    return OptimizationResult::failed(x_new.as_slice().to_vec(), iteration, evaluations, &err);
                }
            };
            if grad_new.iter().any(|v| !v.is_finite()) {
                return OptimizationResult::failed(
                    x_new.as_slice().to_vec(),
                    iteration,
                    evaluations,
                    &EvalError::Gradient,
                );
            }
            let g_new = masked(DVector::from_vec(grad_new), &free);

            let s = &x_new - &x;
            let y = &g_new - &g;
            let sy = s.dot(&y);
            if sy > 1e-12 * s.norm() * y.norm() {
                if !scaled {
                    h_inv = &identity * (sy / y.dot(&y));
                    scaled = true;
                }
                bfgs_update(&mut h_inv, &s, &y, sy);
            }

            let improvement = f - f_new;
            x = x_new;
            f = f_new;
            g = g_new;

            if improvement.abs() <= cfg.objective_tolerance * (1.0 + f.abs()) {
                if g.amax() <= cfg.gradient_tolerance * (1.0 + f.abs()) {
                    return finish(x, f, iteration + 1, evaluations, OptimizationStatus::Converged);
                }
                flat_steps += 1;
                if flat_steps >= FLAT_STEPS {
                    return finish(x, f, iteration + 1, evaluations, OptimizationStatus::Stalled);
                }
            } else {
                flat_steps = 0;
            }
        }

        finish(x, f, cfg.max_iterations, evaluations, OptimizationStatus::IterationLimit)
    }
}

fn finish(
    x: DVector<f64>,
    f: f64,
    iterations: usize,
    evaluations: usize,
    status: OptimizationStatus,
) -> OptimizationResult {
    debug!("optimizer finished: {status:?} after {iterations} iterations, f={f:.6e}");
    OptimizationResult {
        parameters: x.as_slice().to_vec(),
        objective: f,
        iterations,
        evaluations,
        status,
    }
}

fn masked_identity(free: &[bool]) -> DMatrix<f64> {
    let dim = free.len();
    DMatrix::from_fn(dim, dim, |i, j| if i == j && free[i] { 1.0 } else { 0.0 })
}

fn masked(mut g: DVector<f64>, free: &[bool]) -> DVector<f64> {
    for (gi, &is_free) in g.iter_mut().zip(free) {
        if !is_free {
            *gi = 0.0;
        }
    }
    g
}

/// `H <- (I - rho s y^T) H (I - rho y s^T) + rho s s^T`, expanded.
fn bfgs_update(h_inv: &mut DMatrix<f64>, s: &DVector<f64>, y: &DVector<f64>, sy: f64) {
    let rho = 1.0 / sy;
    let hy = &*h_inv * y;
    let yhy = y.dot(&hy);
    let ss = s * s.transpose();
    let cross = &hy * s.transpose() + s * hy.transpose();
    *h_inv += ss * (rho * (1.0 + rho * yhy)) - cross * rho;
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Quadratic;

    impl Differentiable for Quadratic {
        fn value(&self, x: &[f64]) -> Result<f64, EvalError> {
            Ok((x[0] - 2.0).powi(2) + 10.0 * (x[1] - 3.0).powi(2))
        }

        fn value_and_gradient(&self, x: &[f64]) -> Result<(f64, Vec<f64>), EvalError> {
            Ok((self.value(x)?, vec![2.0 * (x[0] - 2.0), 20.0 * (x[1] - 3.0)]))
        }
    }

    struct Rosenbrock;

    impl Differentiable for Rosenbrock {
        fn value(&self, x: &[f64]) -> Result<f64, EvalError> {
            Ok((1.0 - x[0]).powi(2) + 100.0 * (x[1] - x[0] * x[0]).powi(2))
        }

        fn value_and_gradient(&self, x: &[f64]) -> Result<(f64, Vec<f64>), EvalError> {
            let dx = -2.0 * (1.0 - x[0]) - 400.0 * x[0] * (x[1] - x[0] * x[0]);
            let dy = 200.0 * (x[1] - x[0] * x[0]);
            Ok((self.value(x)?, vec![dx, dy]))
        }
    }

    /// Fails with the configured error everywhere.
    struct Broken(EvalError);

    impl Differentiable for Broken {
        fn value(&self, _: &[f64]) -> Result<f64, EvalError> {
            Err(self.0.clone())
        }

        fn value_and_gradient(&self, _: &[f64]) -> Result<(f64, Vec<f64>), EvalError> {
            Err(self.0.clone())
        }
    }

    #[test]
    fn minimises_quadratic() {
        let result = Optimizer::default().minimise(&Quadratic, &[0.0, 0.0], &[]);
        assert!(result.converged());
        assert!((result.parameters[0] - 2.0).abs() < 1e-6);
        assert!((result.parameters[1] - 3.0).abs() < 1e-6);
    }

    #[test]
    fn minimises_rosenbrock() {
        let config = OptimizerConfig {
            max_iterations: 2000,
            ..OptimizerConfig::default()
        };
        let result = Optimizer::new(config).minimise(&Rosenbrock, &[-1.2, 1.0], &[]);
        assert!(result.is_usable());
        assert!((result.parameters[0] - 1.0).abs() < 1e-4, "{:?}", result);
        assert!((result.parameters[1] - 1.0).abs() < 1e-4, "{:?}", result);
    }

    #[test]
    fn fixed_coordinates_do_not_move() {
        let result = Optimizer::default().minimise(&Quadratic, &[0.0, 1.0], &[false, true]);
        assert!(result.converged());
        assert!((result.parameters[0] - 2.0).abs() < 1e-6);
        assert_eq!(result.parameters[1], 1.0);
    }

    #[test]
    fn start_failures_are_classified() {
        let opt = Optimizer::default();
        let cases = [
            (EvalError::Construction("inverted".to_string()), FailureReason::ConstructionFailure),
            (EvalError::NonFinite, FailureReason::NonConvergent),
            (EvalError::Gradient, FailureReason::GradientFailure),
        ];
        for (err, reason) in cases {
            let result = opt.minimise(&Broken(err), &[1.0], &[]);
            assert_eq!(result.failure(), Some(reason));
            assert!(!result.is_usable());
        }
    }

    /// Constant value with a small residual slope, as on a saturated plateau.
    struct Plateau;

    impl Differentiable for Plateau {
        fn value(&self, _: &[f64]) -> Result<f64, EvalError> {
            Ok(7.5)
        }

        fn value_and_gradient(&self, x: &[f64]) -> Result<(f64, Vec<f64>), EvalError> {
            Ok((self.value(x)?, vec![-2e-7, 0.0]))
        }
    }

    #[test]
    fn plateau_with_residual_gradient_is_stalled() {
        let result = Optimizer::default().minimise(&Plateau, &[-18.4, 0.3], &[]);
        assert_eq!(result.status, OptimizationStatus::Stalled);
        assert!(!result.converged());
        assert!(result.is_usable());
        assert_eq!(result.objective, 7.5);
        assert!(result.iterations <= FLAT_STEPS);
    }

    #[test]
    fn iteration_cap_is_reported() {
        let config = OptimizerConfig {
            max_iterations: 2,
            ..OptimizerConfig::default()
        };
        let result = Optimizer::new(config).minimise(&Rosenbrock, &[-1.2, 1.0], &[]);
        assert_eq!(result.status, OptimizationStatus::IterationLimit);
        assert!(result.is_usable());
    }
}
