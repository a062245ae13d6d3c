//! Bracketing root finder for monotone scalar equations.
//!
//! The growth stage solves for a positive multiplier, so the search runs on
//! `ln x`: the bracket is expanded geometrically and then bisected.

/// Outcome of a successful root search.
#[derive(Debug, Clone, Copy)]
pub struct Root {
    pub x: f64,
    pub iterations: usize,
}

/// Find `x > 0` with `f(x) = 0` for a function that is decreasing in `x`.
///
/// `f` may return non-finite values where the equation is undefined (for
/// example an infinite time to maturity); those count as "too small an `x`".
/// Returns `None` if no sign change is found within the expansion budget.
pub fn solve_decreasing<F>(f: F, start: f64, rel_tol: f64, max_iterations: usize) -> Option<Root>
where
    F: Fn(f64) -> f64,
{
    if !(start.is_finite() && start > 0.0) {
        return None;
    }
    // Positive (or undefined) means x must grow.
    let needs_larger = |v: f64| !v.is_finite() || v > 0.0;

    let mut lo = start;
    let mut hi = start;
    let mut iterations = 0;

    if needs_larger(f(start)) {
        loop {
            hi *= 2.0;
            iterations += 1;
            if !needs_larger(f(hi)) {
                break;
            }
            if iterations >= max_iterations {
                return None;
            }
        }
        lo = hi / 2.0;
    } else {
        loop {
            lo /= 2.0;
            iterations += 1;
            if needs_larger(f(lo)) {
                break;
            }
            if iterations >= max_iterations {
                return None;
            }
        }
        hi = lo * 2.0;
    }

    // Invariant: f(lo) needs a larger x, f(hi) does not.
    let mut ln_lo = lo.ln();
    let mut ln_hi = hi.ln();
    while ln_hi - ln_lo > rel_tol && iterations < max_iterations {
        let mid = 0.5 * (ln_lo + ln_hi);
        let v = f(mid.exp());
        iterations += 1;
        if v == 0.0 {
            return Some(Root { x: mid.exp(), iterations });
        }
        if needs_larger(v) {
            ln_lo = mid;
        } else {
            ln_hi = mid;
        }
    }

    Some(Root {
        x: (0.5 * (ln_lo + ln_hi)).exp(),
        iterations,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_root_of_reciprocal() {
        // 8 / x - 2 = 0  =>  x = 4
        let root = solve_decreasing(|x| 8.0 / x - 2.0, 1.0, 1e-12, 200).unwrap();
        assert!((root.x - 4.0).abs() < 1e-9);
    }

    #[test]
    fn treats_non_finite_as_too_small() {
        // Undefined below 0.5, otherwise 1/(x - 0.5) - 1 => root at 1.5.
        let f = |x: f64| if x <= 0.5 { f64::INFINITY } else { 1.0 / (x - 0.5) - 1.0 };
        let root = solve_decreasing(f, 0.1, 1e-12, 200).unwrap();
        assert!((root.x - 1.5).abs() < 1e-9);
    }

    #[test]
    fn shrinks_bracket_when_start_is_too_large() {
        let root = solve_decreasing(|x| 0.01 / x - 1.0, 10.0, 1e-12, 200).unwrap();
        assert!((root.x - 0.01).abs() < 1e-12);
    }

    #[test]
    fn gives_up_without_sign_change() {
        assert!(solve_decreasing(|_| 1.0, 1.0, 1e-12, 30).is_none());
    }
}
