// Small geometry helpers shared by the k-d trees and the ORCA solver.
//
// Every helper here is total: a zero denominator or a zero-length vector
// yields zero instead of NaN/Inf.

use std::ops::Div;

use glam::Vec2;

use super::constants::AVOIDANCE_EPSILON;

/// `numerator / denominator`, or the zero value of `T` when the denominator
/// is within `AVOIDANCE_EPSILON` of zero.
///
/// Works for `f32`, `Vec2` and `Vec3` (all have a zero `Default`).
#[inline]
pub fn safe_divide<T>(numerator: T, denominator: f32) -> T
where
    T: Div<f32, Output = T> + Default,
{
    if denominator.abs() <= AVOIDANCE_EPSILON {
        log::trace!(target: "avoidance", "safe_divide: division by zero replaced with zero");
        return T::default();
    }
    numerator / denominator
}

/// 2D determinant / cross product: det(a, b) = a.x·b.y − a.y·b.x
#[inline]
pub fn det(a: Vec2, b: Vec2) -> f32 {
    a.x * b.y - a.y * b.x
}

/// Signed area term telling which side of the directed line `a -> b` the
/// point `p` is on. Positive: left, negative: right, zero: on the line.
#[inline]
pub fn amount_left_of_line(a: Vec2, b: Vec2, p: Vec2) -> f32 {
    det(a - p, b - a)
}

/// Squared distance from `p` to the segment `a..b`.
///
/// The projection parameter is clamped to the segment, so points beyond
/// either end measure to the nearest endpoint.
pub fn dist_sq_point_segment(a: Vec2, b: Vec2, p: Vec2) -> f32 {
    let ab = b - a;
    let t = safe_divide((p - a).dot(ab), ab.length_squared()).clamp(0.0, 1.0);
    (p - (a + t * ab)).length_squared()
}

/// Unit vector along `v`, or zero when `v` is (nearly) zero-length.
#[inline]
pub fn safe_normalize(v: Vec2) -> Vec2 {
    let length = v.length();
    if length <= AVOIDANCE_EPSILON {
        return Vec2::ZERO;
    }
    v / length
}
