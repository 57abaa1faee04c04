//! Approximate comparison of [`Real`] values.
//!
//! Host and device paths accumulate in different orders, so their results
//! agree only up to rounding. These helpers grade how closely two values or
//! arrays agree.

use crate::real::Real;

/// Largest difference still graded [`ApproxEquality::Relative`].
#[cfg(not(feature = "f64"))]
pub const MAX_ERROR: Real = 1e-3;
/// Largest difference still graded [`ApproxEquality::Partial`].
#[cfg(not(feature = "f64"))]
pub const AVG_ERROR: Real = 1e-5;
/// Largest difference still graded [`ApproxEquality::Precise`].
#[cfg(not(feature = "f64"))]
pub const MIN_ERROR: Real = 1e-6;

/// Largest difference still graded [`ApproxEquality::Relative`].
#[cfg(feature = "f64")]
pub const MAX_ERROR: Real = 1e-3;
/// Largest difference still graded [`ApproxEquality::Partial`].
#[cfg(feature = "f64")]
pub const AVG_ERROR: Real = 1e-6;
/// Largest difference still graded [`ApproxEquality::Precise`].
#[cfg(feature = "f64")]
pub const MIN_ERROR: Real = 1e-13;

/// Grade of agreement, best first.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ApproxEquality {
    /// Very strong epsilon.
    Precise = 0,
    /// Good epsilon.
    Partial = 1,
    /// Acceptable epsilon.
    Relative = 2,
    /// Not equal.
    Scarce = 3,
}

/// Grades the distance between two values.
pub trait RelativeEq<Rhs: ?Sized = Self> {
    /// Grade of `self` against `rhs`.
    fn approx_eq(&self, rhs: &Rhs) -> ApproxEquality;
}

impl RelativeEq for Real {
    fn approx_eq(&self, rhs: &Self) -> ApproxEquality {
        let dif = (self - rhs).abs();

        if dif < MIN_ERROR {
            ApproxEquality::Precise
        } else if dif < AVG_ERROR {
            ApproxEquality::Partial
        } else if dif < MAX_ERROR {
            ApproxEquality::Relative
        } else {
            ApproxEquality::Scarce
        }
    }
}

impl RelativeEq for [Real] {
    /// The worst grade of any element; arrays of different length are
    /// [`Scarce`](ApproxEquality::Scarce).
    fn approx_eq(&self, rhs: &Self) -> ApproxEquality {
        if self.len() != rhs.len() {
            return ApproxEquality::Scarce;
        }
        self.iter()
            .zip(rhs)
            .map(|(a, b)| a.approx_eq(b))
            .max()
            .unwrap_or(ApproxEquality::Precise)
    }
}

/// Returns `true` if `a` and `b` agree within [`MAX_ERROR`].
pub fn close<A: RelativeEq<B> + ?Sized, B: ?Sized>(a: &A, b: &B) -> bool {
    a.approx_eq(b) <= ApproxEquality::Relative
}

/// Sum of element-wise absolute differences; `None` on length mismatch.
#[must_use]
pub fn sum_abs_diff(a: &[Real], b: &[Real]) -> Option<Real> {
    (a.len() == b.len()).then(|| a.iter().zip(b).map(|(x, y)| (x - y).abs()).sum())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grades_single_values() {
        assert_eq!((1.0 as Real).approx_eq(&1.0), ApproxEquality::Precise);
        assert_eq!((1.0 as Real).approx_eq(&1.0005), ApproxEquality::Relative);
        assert_eq!((1.0 as Real).approx_eq(&1.1), ApproxEquality::Scarce);
    }

    #[test]
    fn slice_takes_worst_grade() {
        let a: &[Real] = &[1.0, 2.0, 3.0];
        let b: &[Real] = &[1.0, 2.0005, 3.0];
        assert_eq!(a.approx_eq(b), ApproxEquality::Relative);
        assert!(close(a, b));
        assert!(!close(a, &[1.0, 2.0][..]));
    }

    #[test]
    fn abs_diff_sums() {
        assert_eq!(sum_abs_diff(&[1.0, -1.0], &[0.5, -0.5]), Some(1.0));
        assert_eq!(sum_abs_diff(&[1.0], &[]), None);
    }
}
