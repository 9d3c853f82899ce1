//! Utility maths functions

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

use num_traits::Float;

// ---------------------------------------------------------------------------
// PUBLIC FUNCTIONS
// ---------------------------------------------------------------------------

/// Limit a value to the range `[min, max]`.
pub fn clamp<T>(value: &T, min: &T, max: &T) -> T
where
    T: Float
{
    let mut ret = *value;

    if ret > *max {
        ret = *max
    }
    if ret < *min {
        ret = *min
    }

    ret
}

/// Square root which returns zero for negative (or NaN) inputs rather than
/// NaN.
pub fn safe_sqrt<T>(value: T) -> T
where
    T: Float
{
    if value > T::zero() {
        value.sqrt()
    }
    else {
        T::zero()
    }
}

/// Calculates the least nonnegative remainder of `lhs (mod rhs)`.
///
/// This function is taken from the std library as num is missing it.
pub fn rem_euclid<T>(lhs: T, rhs: T) -> T
where
    T: Float
{
    let r = lhs % rhs;
    if r < T::zero() { r + rhs.abs() } else { r }
}

/// Wrap an angle in centidegrees into `[0, 36000)`.
pub fn wrap_360_cd<T>(angle_cd: T) -> T
where
    T: Float
{
    let full_turn = T::from(36000.0).unwrap_or_else(T::zero);
    let wrapped = rem_euclid(angle_cd, full_turn);

    // Round off error from rem_euclid can give exactly one full turn
    if wrapped >= full_turn { T::zero() } else { wrapped }
}

/// Square root controller.
///
/// Proportional below `second_ord_lim / p^2` and square-root shaped above it,
/// so the correction can be followed under a constant second order limit
/// (for example a velocity error corrected under an acceleration limit).
/// When `dt` is positive the correction is limited so that it cannot
/// overshoot the error within one step.
pub fn sqrt_controller(error: f64, p: f64, second_ord_lim: f64, dt: f64) -> f64 {
    let correction = if second_ord_lim <= 0.0 {
        // No second order limit, pure proportional
        error * p
    }
    else if p == 0.0 {
        // No proportional band, pure square root
        error.signum() * safe_sqrt(2.0 * second_ord_lim * error.abs())
    }
    else {
        let linear_dist = second_ord_lim / (p * p);
        if error.abs() > linear_dist {
            error.signum()
                * safe_sqrt(2.0 * second_ord_lim * (error.abs() - linear_dist * 0.5))
        }
        else {
            error * p
        }
    };

    if dt > 0.0 {
        let max = error.abs() / dt;
        clamp(&correction, &-max, &max)
    }
    else {
        correction
    }
}
