//! Log-spaced grids.

use crate::error::CalibrationError;

/// Generate `steps` log-spaced points between `min` and `max` (inclusive).
pub fn log_space(min: f64, max: f64, steps: usize) -> Result<Vec<f64>, String> {
    if !(min.is_finite() && max.is_finite() && min > 0.0 && max > 0.0 && max > min) {
        return Err(format!(
            "invalid grid range: min={min}, max={max} (must be finite, >0, and max>min)"
        ));
    }
    if steps < 2 {
        return Err("grid needs at least 2 points".to_string());
    }

    let ln_min = min.ln();
    let ln_max = max.ln();
    let step = (ln_max - ln_min) / (steps as f64 - 1.0);

    let mut out = Vec::with_capacity(steps);
    for i in 0..steps {
        out.push((ln_min + step * i as f64).exp());
    }
    // Pin the endpoints exactly; exp(ln(x)) can drift by an ulp.
    out[0] = min;
    out[steps - 1] = max;
    Ok(out)
}

/// Position of `x` on a sorted log-spaced grid as `(index, fraction)` such that
/// `ln x = (1 - fraction) * ln grid[index] + fraction * ln grid[index + 1]`.
///
/// Returns `None` when `x` lies outside the grid.
pub fn log_locate(grid: &[f64], x: f64) -> Option<(usize, f64)> {
    if grid.len() < 2 || !(x.is_finite() && x > 0.0) {
        return None;
    }
    let last = grid.len() - 1;
    if x < grid[0] || x > grid[last] {
        return None;
    }
    // partition_point gives the first node strictly greater than x.
    let upper = grid.partition_point(|&g| g <= x).clamp(1, last);
    let lower = upper - 1;
    let span = grid[upper].ln() - grid[lower].ln();
    let frac = if span > 0.0 { (x.ln() - grid[lower].ln()) / span } else { 0.0 };
    Some((lower, frac.clamp(0.0, 1.0)))
}

/// Species-tagged wrapper around [`log_space`].
pub fn weight_nodes(species: &str, w_min: f64, w_max: f64, steps: usize) -> Result<Vec<f64>, CalibrationError> {
    log_space(w_min, w_max, steps).map_err(|msg| CalibrationError::structural(species, msg))
}
