//! Small robust statistics used to summarise multi-start runs.

/// Median of a slice (sorts in place). `None` for an empty slice.
pub fn median_mut(values: &mut [f64]) -> Option<f64> {
    quantile_mut(values, 0.5)
}

/// Linear-interpolation quantile (type 7) of a slice (sorts in place).
pub fn quantile_mut(values: &mut [f64], q: f64) -> Option<f64> {
    if values.is_empty() || !(0.0..=1.0).contains(&q) {
        return None;
    }
    values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let pos = q * (values.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    let frac = pos - lo as f64;
    Some(values[lo] + frac * (values[hi] - values[lo]))
}

/// First and third quartiles.
pub fn quartiles(values: &[f64]) -> Option<(f64, f64)> {
    let mut v = values.to_vec();
    let q1 = quantile_mut(&mut v, 0.25)?;
    let q3 = quantile_mut(&mut v, 0.75)?;
    Some((q1, q3))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn median_odd_and_even() {
        assert_eq!(median_mut(&mut [3.0, 1.0, 2.0]), Some(2.0));
        assert_eq!(median_mut(&mut [4.0, 1.0, 3.0, 2.0]), Some(2.5));
        assert_eq!(median_mut(&mut []), None);
    }

    #[test]
    fn quartiles_of_range() {
        let v: Vec<f64> = (0..=8).map(|i| i as f64).collect();
        let (q1, q3) = quartiles(&v).unwrap();
        assert_eq!(q1, 2.0);
        assert_eq!(q3, 6.0);
    }
}
