//! Fixed-point loyalty amount.
//!
//! # Scale
//!
//! All point amounts use a 1e-6 (micros) fixed-point representation stored
//! as `i64`. 1 point = `Points::new(1_000_000)`. The accrual authority and the
//! HTTP surface speak JSON numbers; conversion to and from `f64` happens only
//! at that boundary ([`Points::from_f64`], [`Points::to_f64`]) so balance
//! arithmetic stays exact.
//!
//! There is intentionally no `From<i64>` implementation: callers must be
//! deliberate about when a raw integer represents an amount.

use std::ops::{Add, AddAssign, Sub, SubAssign};

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Number of micros in one whole point.
pub const MICROS_PER_POINT: i64 = 1_000_000;

/// A fixed-point point amount at 1e-6 scale.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Points(i64);

impl Points {
    pub const ZERO: Points = Points(0);

    /// Construct from raw micros.
    #[inline]
    pub const fn new(micros: i64) -> Self {
        Points(micros)
    }

    /// Construct from a whole number of points.
    #[inline]
    pub const fn whole(points: i64) -> Self {
        Points(points * MICROS_PER_POINT)
    }

    /// Raw micros, for storage columns and other integer boundaries.
    #[inline]
    pub const fn micros(self) -> i64 {
        self.0
    }

    /// Convert a wire value, rounding to the nearest micro.
    ///
    /// Returns `None` for NaN, infinities, and values outside the `i64`
    /// micros range.
    pub fn from_f64(value: f64) -> Option<Self> {
        if !value.is_finite() {
            return None;
        }
        let scaled = (value * MICROS_PER_POINT as f64).round();
        if scaled < i64::MIN as f64 || scaled >= i64::MAX as f64 {
            return None;
        }
        Some(Points(scaled as i64))
    }

    /// Wire representation.
    pub fn to_f64(self) -> f64 {
        self.0 as f64 / MICROS_PER_POINT as f64
    }

    #[inline]
    pub fn is_positive(self) -> bool {
        self.0 > 0
    }

    #[inline]
    pub fn is_negative(self) -> bool {
        self.0 < 0
    }

    /// Checked addition; `None` on overflow.
    #[inline]
    pub fn checked_add(self, rhs: Points) -> Option<Points> {
        self.0.checked_add(rhs.0).map(Points)
    }

    /// Checked subtraction; `None` on overflow.
    #[inline]
    pub fn checked_sub(self, rhs: Points) -> Option<Points> {
        self.0.checked_sub(rhs.0).map(Points)
    }
}

impl Add for Points {
    type Output = Points;
    #[inline]
    fn add(self, rhs: Points) -> Points {
        Points(self.0 + rhs.0)
    }
}

impl Sub for Points {
    type Output = Points;
    #[inline]
    fn sub(self, rhs: Points) -> Points {
        Points(self.0 - rhs.0)
    }
}

impl AddAssign for Points {
    #[inline]
    fn add_assign(&mut self, rhs: Points) {
        self.0 += rhs.0;
    }
}

impl SubAssign for Points {
    #[inline]
    fn sub_assign(&mut self, rhs: Points) {
        self.0 -= rhs.0;
    }
}

impl std::iter::Sum for Points {
    fn sum<I: Iterator<Item = Points>>(iter: I) -> Points {
        iter.fold(Points::ZERO, |acc, p| acc + p)
    }
}

impl std::fmt::Display for Points {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let whole = self.0 / MICROS_PER_POINT;
        let frac = (self.0 % MICROS_PER_POINT).abs();
        // Truncation drops the sign for |value| < 1.
        if self.0 < 0 && whole == 0 {
            write!(f, "-{whole}.{frac:06}")
        } else {
            write!(f, "{whole}.{frac:06}")
        }
    }
}

impl Serialize for Points {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(self.to_f64())
    }
}

impl<'de> Deserialize<'de> for Points {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = f64::deserialize(deserializer)?;
        Points::from_f64(raw)
            .ok_or_else(|| serde::de::Error::custom(format!("points out of range: {raw}")))
    }
}
