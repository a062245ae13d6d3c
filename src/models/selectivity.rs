//! Length-based fishing selectivity curves.
//!
//! Both limbs share one logistic form parameterized by the lengths at which the
//! limb equals 50% and 25%:
//!
//! ```text
//! S(l) = 1 / (1 + exp(k (l - l50))),   k = ln 3 / (l25 - l50)
//! ```
//!
//! For the ascending limb `l25 < l50`, so `k < 0` and `S` rises to 1. For the
//! descending limb `l25_right > l50_right`, so `k > 0` and `S` falls to 0. The
//! dome is the product of the two limbs.
//!
//! The shape is generic over [`DualNum`] so the catch objective can propagate
//! derivatives through it; plain `f64` is the common case.

use num_dual::DualNum;

use crate::domain::{GearParams, SelectivityKind};
use crate::error::CalibrationError;

/// `ln 3`: logit distance between the 25% and 50% points of a logistic.
pub const LN_3: f64 = 1.098_612_288_668_109_8;

/// Logistic `1 / (1 + exp(x))`, evaluated without overflow for large `|x|`.
pub fn logistic_decreasing<T: DualNum<f64> + Copy>(x: T) -> T {
    if x.re() > 0.0 {
        let e = (-x).exp();
        e / (e + 1.0)
    } else {
        (x.exp() + 1.0).recip()
    }
}

/// One logistic limb evaluated at length `l`.
pub fn limb<T: DualNum<f64> + Copy>(l: f64, l50: T, l25: T) -> T {
    let x = (T::from(l) - l50) * LN_3 / (l25 - l50);
    logistic_decreasing(x)
}

/// A resolved selectivity curve.
///
/// `right` holds `(l50_right, l25_right)` for a dome; `None` means the
/// descending factor is identically 1.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SelectivityShape<T> {
    pub l25: T,
    pub l50: T,
    pub right: Option<(T, T)>,
}

impl<T: DualNum<f64> + Copy> SelectivityShape<T> {
    pub fn sigmoid(l25: T, l50: T) -> Self {
        Self { l25, l50, right: None }
    }

    pub fn double_sigmoid(l25: T, l50: T, l50_right: T, l25_right: T) -> Self {
        Self {
            l25,
            l50,
            right: Some((l50_right, l25_right)),
        }
    }

    /// Capture probability at length `l`, in `[0, 1]`.
    pub fn at(&self, l: f64) -> T {
        let ascending = limb(l, self.l50, self.l25);
        match self.right {
            Some((l50_right, l25_right)) => ascending * limb(l, l50_right, l25_right),
            None => ascending,
        }
    }

    pub fn is_dome(&self) -> bool {
        self.right.is_some()
    }
}

/// The `f64` selectivity curve attached to a gear.
pub type SelectivityCurve = SelectivityShape<f64>;

impl SelectivityCurve {
    /// Resolve and validate the curve described by a gear row.
    ///
    /// A double sigmoid whose descending-limb lengths are absent or non-finite
    /// degenerates to the plain sigmoid. Present but inverted descending-limb
    /// lengths are rejected.
    pub fn from_gear(gear: &GearParams) -> Result<Self, CalibrationError> {
        let fail = |msg: String| {
            Err(CalibrationError::structural(
                &gear.species,
                format!("gear '{}': {msg}", gear.gear),
            ))
        };

        if !(gear.l25.is_finite() && gear.l50.is_finite() && gear.l25 > 0.0) {
            return fail(format!(
                "ascending limb lengths must be finite and positive (l25={}, l50={})",
                gear.l25, gear.l50
            ));
        }
        if gear.l25 >= gear.l50 {
            return fail(format!("l25 ({}) must be below l50 ({})", gear.l25, gear.l50));
        }

        match (gear.sel_func, descending_limb(gear)) {
            (SelectivityKind::Sigmoid, _) | (SelectivityKind::DoubleSigmoid, None) => {
                Ok(SelectivityShape::sigmoid(gear.l25, gear.l50))
            }
            (SelectivityKind::DoubleSigmoid, Some((l50_right, l25_right))) => {
                if l50_right <= gear.l50 {
                    return fail(format!(
                        "l50_right ({l50_right}) must exceed l50 ({}); descending limb is inverted",
                        gear.l50
                    ));
                }
                if l25_right <= l50_right {
                    return fail(format!(
                        "l25_right ({l25_right}) must exceed l50_right ({l50_right})"
                    ));
                }
                Ok(SelectivityShape::double_sigmoid(gear.l25, gear.l50, l50_right, l25_right))
            }
        }
    }
}

/// Descending-limb lengths if both are present and finite.
pub fn descending_limb(gear: &GearParams) -> Option<(f64, f64)> {
    match (gear.l50_right, gear.l25_right) {
        (Some(l50r), Some(l25r)) if l50r.is_finite() && l25r.is_finite() => Some((l50r, l25r)),
        _ => None,
    }
}

/// Effective selectivity kind of a gear after the degenerate-dome rule.
pub fn effective_kind(gear: &GearParams) -> SelectivityKind {
    match (gear.sel_func, descending_limb(gear)) {
        (SelectivityKind::DoubleSigmoid, Some(_)) => SelectivityKind::DoubleSigmoid,
        _ => SelectivityKind::Sigmoid,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use num_dual::Dual64;
    use proptest::prelude::*;

    fn gear(kind: SelectivityKind, right: Option<(f64, f64)>) -> GearParams {
        GearParams {
            species: "cod".to_string(),
            gear: "trawl".to_string(),
            sel_func: kind,
            l25: 34.0,
            l50: 40.0,
            l50_right: right.map(|r| r.0),
            l25_right: right.map(|r| r.1),
            catchability: 0.3,
            effort: 1.0,
        }
    }

    #[test]
    fn ln_3_constant() {
        assert!((LN_3 - 3f64.ln()).abs() < 1e-15);
    }

    #[test]
    fn limb_hits_quartile_and_half() {
        let s = SelectivityShape::sigmoid(34.0, 40.0);
        assert!((s.at(40.0) - 0.5).abs() < 1e-12);
        assert!((s.at(34.0) - 0.25).abs() < 1e-12);

        let d = SelectivityShape::double_sigmoid(34.0, 40.0, 60.0, 66.0);
        let descending = limb(66.0, 60.0, 66.0);
        assert!((descending - 0.25).abs() < 1e-12);
        assert!(d.at(60.0) < s.at(60.0));
    }

    #[test]
    fn logistic_is_finite_at_extremes() {
        assert_eq!(logistic_decreasing(1e4_f64), 0.0);
        assert_eq!(logistic_decreasing(-1e4_f64), 1.0);

        let x = Dual64::new(800.0, 1.0);
        let y = logistic_decreasing(x);
        assert!(y.re.is_finite() && y.eps.is_finite());
        let x = Dual64::new(-800.0, 1.0);
        let y = logistic_decreasing(x);
        assert!(y.re.is_finite() && y.eps.is_finite());
    }

    #[test]
    fn dual_derivative_matches_finite_difference() {
        let l = 37.0;
        let dual = limb(l, Dual64::new(40.0, 1.0), Dual64::from(34.0));
        let h = 1e-6;
        let fd = (limb(l, 40.0 + h, 34.0) - limb(l, 40.0 - h, 34.0)) / (2.0 * h);
        assert!((dual.eps - fd).abs() < 1e-8);
    }

    #[test]
    fn degenerate_dome_equals_sigmoid() {
        let sigmoid = SelectivityCurve::from_gear(&gear(SelectivityKind::Sigmoid, None)).unwrap();
        let absent = SelectivityCurve::from_gear(&gear(SelectivityKind::DoubleSigmoid, None)).unwrap();
        let non_finite =
            SelectivityCurve::from_gear(&gear(SelectivityKind::DoubleSigmoid, Some((f64::NAN, 66.0)))).unwrap();
        assert!(!absent.is_dome());
        assert!(!non_finite.is_dome());
        for l in [10.0, 34.0, 40.0, 55.0, 90.0] {
            assert_eq!(sigmoid.at(l), absent.at(l));
            assert_eq!(sigmoid.at(l), non_finite.at(l));
        }
        assert_eq!(
            effective_kind(&gear(SelectivityKind::DoubleSigmoid, None)),
            SelectivityKind::Sigmoid
        );
    }

    #[test]
    fn inverted_descending_limb_is_rejected() {
        let err = SelectivityCurve::from_gear(&gear(SelectivityKind::DoubleSigmoid, Some((35.0, 45.0))))
            .unwrap_err();
        assert!(matches!(err, CalibrationError::StructuralInput { .. }));
        assert!(err.to_string().contains("l50_right"));

        let err = SelectivityCurve::from_gear(&gear(SelectivityKind::DoubleSigmoid, Some((60.0, 55.0))))
            .unwrap_err();
        assert!(err.to_string().contains("l25_right"));
    }

    #[test]
    fn ascending_order_is_enforced() {
        let mut g = gear(SelectivityKind::Sigmoid, None);
        g.l25 = 45.0;
        assert!(SelectivityCurve::from_gear(&g).is_err());
    }

    proptest! {
        #[test]
        fn sigmoid_is_monotone_and_bounded(
            l50 in 5.0f64..100.0,
            ratio in 0.5f64..0.98,
        ) {
            let s = SelectivityShape::sigmoid(ratio * l50, l50);
            let mut prev = 0.0;
            for i in 0..400 {
                let l = 0.5 * i as f64;
                let v = s.at(l);
                prop_assert!((0.0..=1.0).contains(&v));
                prop_assert!(v >= prev - 1e-15);
                prev = v;
            }
            prop_assert!(s.at(1e6) > 1.0 - 1e-9);
        }

        #[test]
        fn dome_rises_then_falls(
            l50 in 5.0f64..60.0,
            ratio in 0.5f64..0.95,
            d50 in 5.0f64..40.0,
            r_right in 1.02f64..1.5,
        ) {
            let l50_right = l50 + d50;
            let s = SelectivityShape::double_sigmoid(ratio * l50, l50, l50_right, r_right * l50_right);
            let values: Vec<f64> = (0..2000).map(|i| s.at(0.1 * i as f64)).collect();
            let (peak, max) = values
                .iter()
                .enumerate()
                .fold((0, f64::MIN), |acc, (i, &v)| if v > acc.1 { (i, v) } else { acc });
            prop_assert!(max <= 1.0);
            prop_assert!(peak > 0 && peak < values.len() - 1);
            for w in values[..=peak].windows(2) {
                prop_assert!(w[1] >= w[0] - 1e-15);
            }
            for w in values[peak..].windows(2) {
                prop_assert!(w[1] <= w[0] + 1e-15);
            }
        }
    }
}
