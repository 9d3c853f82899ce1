//! Kinematic samples and limits shared by the trajectory generators.
//!
//! All quantities are expressed in the local north-east-up (NEU) frame in
//! centimetres, so `+z` is a climb.

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

use nalgebra::{Vector2, Vector3};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// CONSTANTS
// ---------------------------------------------------------------------------

/// Squared lengths below this are treated as zero.
pub const LENGTH_SQ_EPSILON: f64 = 1e-12;

// ---------------------------------------------------------------------------
// DATA STRUCTURES
// ---------------------------------------------------------------------------

/// Position, velocity and acceleration of a target at one instant.
#[derive(Debug, Default, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub struct KinematicSample {
    /// Units: centimetres, Frame: NEU
    pub pos_neu_cm: Vector3<f64>,

    /// Units: centimetres/second, Frame: NEU
    pub vel_neu_cms: Vector3<f64>,

    /// Units: centimetres/second^2, Frame: NEU
    pub accel_neu_cmss: Vector3<f64>,
}

/// The speed, acceleration, jerk and snap bounds a leg is built with.
#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackLimits {
    /// Maximum horizontal speed.
    ///
    /// Units: centimetres/second
    pub speed_ne_cms: f64,

    /// Maximum climb rate.
    ///
    /// Units: centimetres/second
    pub speed_up_cms: f64,

    /// Maximum descent rate, as a positive number.
    ///
    /// Units: centimetres/second
    pub speed_down_cms: f64,

    /// Maximum horizontal acceleration.
    ///
    /// Units: centimetres/second^2
    pub accel_ne_cmss: f64,

    /// Maximum horizontal acceleration while cornering between legs.
    ///
    /// Units: centimetres/second^2
    pub accel_corner_cmss: f64,

    /// Maximum vertical acceleration.
    ///
    /// Units: centimetres/second^2
    pub accel_u_cmss: f64,

    /// Maximum jerk.
    ///
    /// Units: centimetres/second^3
    pub jerk_cmsss: f64,

    /// Maximum snap.
    ///
    /// Units: centimetres/second^4
    pub snap_cmssss: f64,
}

// ---------------------------------------------------------------------------
// IMPLEMENTATIONS
// ---------------------------------------------------------------------------

impl KinematicSample {
    /// A stationary sample at the given position.
    pub fn at_rest(pos_neu_cm: Vector3<f64>) -> Self {
        Self {
            pos_neu_cm,
            ..Default::default()
        }
    }

    /// Return the sample offset by the motion of another leg relative to the
    /// given anchor point.
    ///
    /// Used to superimpose the tail of the previous leg, or the start of the
    /// next leg, onto the current one.
    pub fn with_offset_from(mut self, other: &KinematicSample, anchor: &Vector3<f64>) -> Self {
        self.pos_neu_cm += other.pos_neu_cm - anchor;
        self.vel_neu_cms += other.vel_neu_cms;
        self.accel_neu_cmss += other.accel_neu_cmss;
        self
    }
}

impl TrackLimits {
    /// Speed limit along the given direction, see [`kinematic_limit`].
    pub fn speed_along(&self, direction: &Vector3<f64>) -> f64 {
        kinematic_limit(
            direction,
            self.speed_ne_cms,
            self.speed_up_cms,
            self.speed_down_cms
        )
    }

    /// Acceleration limit along the given direction, see [`kinematic_limit`].
    pub fn accel_along(&self, direction: &Vector3<f64>) -> f64 {
        kinematic_limit(
            direction,
            self.accel_ne_cmss,
            self.accel_u_cmss,
            self.accel_u_cmss
        )
    }
}

// ---------------------------------------------------------------------------
// PUBLIC FUNCTIONS
// ---------------------------------------------------------------------------

/// The horizontal (north, east) part of an NEU vector.
pub fn ne(v: &Vector3<f64>) -> Vector2<f64> {
    Vector2::new(v.x, v.y)
}

/// Unit vector in the direction of `v`, or zero if `v` has no length.
pub fn unit_or_zero(v: &Vector3<f64>) -> Vector3<f64> {
    if v.norm_squared() > LENGTH_SQ_EPSILON {
        v.normalize()
    }
    else {
        Vector3::zeros()
    }
}

/// Maximum magnitude of a vector quantity pointing along `direction` given
/// separate horizontal, upward and downward limits.
///
/// The horizontal limit applies to the horizontal component of the vector and
/// the vertical limits to its vertical component, so a shallow climb is
/// horizontally limited and a steep one vertically limited. Returns zero for a
/// zero direction or if any limit is zero.
pub fn kinematic_limit(
    direction: &Vector3<f64>,
    max_ne: f64,
    max_up: f64,
    max_down: f64
) -> f64 {
    if direction.norm_squared() <= LENGTH_SQ_EPSILON
        || max_ne == 0.0
        || max_up == 0.0
        || max_down == 0.0
    {
        return 0.0;
    }

    let max_ne = max_ne.abs();
    let max_up = max_up.abs();
    let max_down = max_down.abs();

    let dir = direction.normalize();
    let ne_len = ne(&dir).norm();

    if ne_len <= 0.0 {
        return if dir.z > 0.0 { max_up } else { max_down };
    }

    if dir.z == 0.0 {
        return max_ne;
    }

    let slope = dir.z / ne_len;
    let max_vert = if slope > 0.0 { max_up } else { max_down };

    if slope.abs() < max_vert / max_ne {
        max_ne / ne_len
    }
    else {
        (max_vert / dir.z).abs()
    }
}

// ---------------------------------------------------------------------------
// TESTS
// ---------------------------------------------------------------------------
