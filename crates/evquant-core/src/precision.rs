//! Numeric precision modes.
//!
//! `Half` keeps every stored parameter and intermediate activation on the
//! binary16 grid while still computing in f32, which mirrors how a
//! half-precision model behaves without requiring f16 arithmetic.

use crate::params::{ADAM_EPSILON_FULL, ADAM_EPSILON_HALF};
use serde::{Deserialize, Serialize};

/// Smallest positive binary16 subnormal (2^-24)
const HALF_SUBNORMAL_STEP: f32 = 5.960_464_5e-8;
/// Smallest positive binary16 normal (2^-14)
const HALF_MIN_NORMAL: f32 = 6.103_515_6e-5;
/// Values at or above this magnitude round to infinity
const HALF_OVERFLOW: f32 = 65520.0;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrecisionMode {
    #[default]
    Full,
    Half,
}

impl PrecisionMode {
    pub fn from_use_hp(use_hp: bool) -> Self {
        if use_hp { PrecisionMode::Half } else { PrecisionMode::Full }
    }

    pub fn is_half(self) -> bool {
        matches!(self, PrecisionMode::Half)
    }

    /// Adam epsilon matched to the precision mode
    pub fn epsilon(self) -> f32 {
        match self {
            PrecisionMode::Full => ADAM_EPSILON_FULL,
            PrecisionMode::Half => ADAM_EPSILON_HALF,
        }
    }

    #[inline]
    pub fn round(self, x: f32) -> f32 {
        match self {
            PrecisionMode::Full => x,
            PrecisionMode::Half => round_to_half(x),
        }
    }

    pub fn round_slice(self, xs: &mut [f32]) {
        if self.is_half() {
            for x in xs {
                *x = round_to_half(*x);
            }
        }
    }
}

/// Round an f32 to the nearest binary16 value (ties to even).
///
/// Magnitudes past the binary16 range overflow to infinity; NaN passes through.
pub fn round_to_half(x: f32) -> f32 {
    if !x.is_finite() || x == 0.0 {
        return x;
    }
    let abs = x.abs();
    if abs >= HALF_OVERFLOW {
        return f32::INFINITY.copysign(x);
    }
    if abs < HALF_MIN_NORMAL {
        let steps = (abs / HALF_SUBNORMAL_STEP).round_ties_even();
        return (steps * HALF_SUBNORMAL_STEP).copysign(x);
    }
    // 13 of the 23 mantissa bits are dropped
    let bits = x.to_bits();
    let lsb = (bits >> 13) & 1;
    let rounded = bits + 0x0fff + lsb;
    f32::from_bits(rounded & !0x1fff)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::HALF_MAX;

    #[test]
    fn representable_values_are_unchanged() {
        for v in [1.0f32, -2.5, 0.5, 1024.0, HALF_MAX, -HALF_MAX, 0.099_975_586] {
            assert_eq!(round_to_half(v), v, "{v}");
        }
    }

    #[test]
    fn ties_round_to_even_mantissa() {
        // halfway between 1.0 and 1.0 + 2^-10
        assert_eq!(round_to_half(1.0 + 2f32.powi(-11)), 1.0);
        // halfway between 1 + 2^-10 and 1 + 2^-9 rounds up to the even one
        assert_eq!(round_to_half(1.0 + 3.0 * 2f32.powi(-11)), 1.0 + 2f32.powi(-9));
        assert_eq!(round_to_half(0.1), 0.099_975_586);
    }

    #[test]
    fn overflow_and_subnormals() {
        assert_eq!(round_to_half(65519.0), HALF_MAX);
        assert_eq!(round_to_half(70000.0), f32::INFINITY);
        assert_eq!(round_to_half(-70000.0), f32::NEG_INFINITY);
        assert_eq!(round_to_half(2f32.powi(-24)), 2f32.powi(-24));
        assert_eq!(round_to_half(2f32.powi(-26)), 0.0);
        assert_eq!(round_to_half(3.0 * 2f32.powi(-24)), 3.0 * 2f32.powi(-24));
        assert!(round_to_half(f32::NAN).is_nan());
    }

    #[test]
    fn full_mode_is_identity_and_epsilons_follow_mode() {
        assert_eq!(PrecisionMode::Full.round(0.1), 0.1);
        assert_eq!(PrecisionMode::Full.epsilon(), 1e-8);
        assert_eq!(PrecisionMode::Half.epsilon(), 1e-4);
        assert_eq!(PrecisionMode::from_use_hp(true), PrecisionMode::Half);
        let mut xs = [0.1f32, 1.0];
        PrecisionMode::Half.round_slice(&mut xs);
        assert_eq!(xs, [0.099_975_586, 1.0]);
    }
}
