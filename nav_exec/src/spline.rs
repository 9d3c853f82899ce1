//! Curved legs following a quintic Hermite spline.
//!
//! The path is a quintic in the parameter `u` in `[0, 1]` whose end tangents
//! point along the requested origin and destination velocity directions and
//! whose second derivative is zero at both ends, so the path is locally
//! straight where it joins its neighbours. Arc length is tabulated against
//! `u` once, and progress along the arc is timed by a one dimensional jerk
//! and snap limited profile, the same one straight legs use. The profile's
//! speed limit is the lowest of the kinematic speed limit along the path and
//! the speed at which the tightest point of the path stays within the
//! centripetal acceleration budget.
//!
//! Both ends of a leg have zero acceleration, so promoting into or out of a
//! spline is continuous in acceleration, and a replan only re-times the
//! remaining arc from the current arc length, speed and acceleration.

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

use nalgebra::Vector3;
use std::f64::consts::FRAC_1_SQRT_2;

use crate::kinematics::{unit_or_zero, KinematicSample, TrackLimits, LENGTH_SQ_EPSILON};
use crate::scurve::{SCurve, ZERO_LENGTH_CM};
use util::maths::safe_sqrt;

// ---------------------------------------------------------------------------
// CONSTANTS
// ---------------------------------------------------------------------------

/// Number of intervals in the arc length table.
pub const SPLINE_INTERVALS: usize = 64;

const NUM_SAMPLES: usize = SPLINE_INTERVALS + 1;

// ---------------------------------------------------------------------------
// DATA STRUCTURES
// ---------------------------------------------------------------------------

/// A curved leg from an origin to a destination.
#[derive(Debug, Copy, Clone)]
pub struct SplineCurve {
    origin: Vector3<f64>,
    destination: Vector3<f64>,

    /// Polynomial coefficients, `P(u) = c0 + c1 u + ... + c5 u^5`.
    coeffs: [Vector3<f64>; 6],

    limits: TrackLimits,

    /// Limits of the profile along the arc, derived from `limits` and the
    /// shape of the path.
    arc_limits: TrackLimits,

    /// Unit tangent at the origin.
    origin_dir: Vector3<f64>,

    /// Unit tangent at the destination.
    dest_dir: Vector3<f64>,

    /// Units: centimetres/second
    origin_speed_cms: f64,

    /// Arc length at each of the evenly spaced parameter samples.
    ///
    /// Units: centimetres
    s: [f64; NUM_SAMPLES],

    /// Progress along the arc, held as a straight leg along `+x` from zero
    /// to the arc length.
    along: SCurve,
}

// ---------------------------------------------------------------------------
// IMPLEMENTATIONS
// ---------------------------------------------------------------------------

impl SplineCurve {
    /// Build a curved leg.
    ///
    /// `origin_vel_dir` and `dest_vel_dir` give the tangent directions at
    /// either end and need not be unit vectors; a zero direction is replaced
    /// by the straight line from origin to destination. The leg starts at
    /// exactly `origin_speed_cms` so that it joins the preceding motion
    /// without a jump in speed, use [`SplineCurve::origin_speed_max_cms`] to
    /// pick a feasible entry speed.
    pub fn new(
        origin: Vector3<f64>,
        destination: Vector3<f64>,
        origin_vel_dir: Vector3<f64>,
        dest_vel_dir: Vector3<f64>,
        origin_speed_cms: f64,
        dest_speed_cms: f64,
        limits: &TrackLimits
    ) -> Self {
        let chord = destination - origin;
        let chord_len = chord.norm();

        let tangent = |dir: &Vector3<f64>| {
            if dir.norm_squared() > LENGTH_SQ_EPSILON {
                unit_or_zero(dir) * chord_len
            }
            else {
                chord
            }
        };
        let m0 = tangent(&origin_vel_dir);
        let m1 = tangent(&dest_vel_dir);

        // Quintic Hermite with zero second derivative at both ends
        let coeffs = [
            origin,
            m0,
            Vector3::zeros(),
            10.0 * chord - 6.0 * m0 - 4.0 * m1,
            -15.0 * chord + 8.0 * m0 + 7.0 * m1,
            6.0 * chord - 3.0 * m0 - 3.0 * m1,
        ];

        let origin_speed_cms = origin_speed_cms.max(0.0);
        let mut curve = Self {
            origin,
            destination,
            coeffs,
            limits: *limits,
            arc_limits: *limits,
            origin_dir: unit_or_zero(&m0),
            dest_dir: unit_or_zero(&m1),
            origin_speed_cms,
            s: [0.0; NUM_SAMPLES],
            along: SCurve::new_leg(Vector3::zeros(), Vector3::zeros(), limits, 0.0, 0.0),
        };

        if chord_len > ZERO_LENGTH_CM {
            curve.build_arc_table();
            curve.arc_limits = curve.arc_limits_for(limits);
            curve.along = curve.plan_along(origin_speed_cms, dest_speed_cms);
        }
        else {
            curve.origin_speed_cms = 0.0;
        }

        curve
    }

    /// Re-time the remainder of this leg from its state at `time_s` with new
    /// limits and destination speed.
    ///
    /// The path is unchanged. The remaining arc is replanned from the
    /// current arc length, speed and acceleration and keeps the same time
    /// base, so position, velocity and acceleration are continuous and the
    /// leg's time cursor carries on. Returns `None` if the destination speed
    /// cannot be reached in the remaining arc under the new limits.
    pub fn from_state(
        &self,
        time_s: f64,
        limits: &TrackLimits,
        dest_speed_cms: f64
    ) -> Option<Self> {
        if self.is_zero_length() {
            return Some(Self {
                limits: *limits,
                arc_limits: *limits,
                ..*self
            });
        }

        let arc_limits = self.arc_limits_for(limits);
        let along = self.along.from_state(time_s, &arc_limits, dest_speed_cms)?;

        Some(Self {
            limits: *limits,
            arc_limits,
            along,
            ..*self
        })
    }

    /// The same path flown with a different destination speed.
    pub fn with_dest_speed(&self, dest_speed_cms: f64) -> Self {
        self.rebuild(self.origin_speed_cms, dest_speed_cms)
    }

    /// The same path flown with a different origin speed.
    pub fn with_origin_speed(&self, origin_speed_cms: f64) -> Self {
        self.rebuild(origin_speed_cms, self.dest_speed_cms())
    }

    /// Evaluate the leg at `time_s` seconds from its start.
    pub fn eval(&self, time_s: f64) -> KinematicSample {
        if self.is_zero_length() {
            return KinematicSample::at_rest(self.destination);
        }

        if time_s >= self.duration_s() {
            return KinematicSample {
                pos_neu_cm: self.destination,
                vel_neu_cms: self.dest_dir * self.dest_speed_cms(),
                accel_neu_cmss: Vector3::zeros(),
            };
        }

        let arc = self.along.eval(time_s.max(0.0));
        let (dist, speed, accel_t) = (arc.pos_neu_cm.x, arc.vel_neu_cms.x, arc.accel_neu_cmss.x);

        let u = self.param_at(dist);
        let d1 = self.derivative(u);
        let d2 = self.second_derivative(u);
        let d1_sq = d1.norm_squared();

        if d1_sq <= LENGTH_SQ_EPSILON {
            return KinematicSample::at_rest(self.position(u));
        }

        let tangent = d1 / d1_sq.sqrt();
        let normal_accel = (d2 - tangent * d2.dot(&tangent)) * (speed * speed / d1_sq);

        KinematicSample {
            pos_neu_cm: self.position(u),
            vel_neu_cms: tangent * speed,
            accel_neu_cmss: tangent * accel_t + normal_accel,
        }
    }

    pub fn origin(&self) -> &Vector3<f64> {
        &self.origin
    }

    pub fn destination(&self) -> &Vector3<f64> {
        &self.destination
    }

    /// Unit tangent at the origin.
    pub fn origin_dir(&self) -> &Vector3<f64> {
        &self.origin_dir
    }

    /// Unit tangent at the destination.
    pub fn dest_dir(&self) -> &Vector3<f64> {
        &self.dest_dir
    }

    pub fn limits(&self) -> &TrackLimits {
        &self.limits
    }

    pub fn duration_s(&self) -> f64 {
        self.along.duration_s()
    }

    /// Path length.
    pub fn length_cm(&self) -> f64 {
        self.s[SPLINE_INTERVALS]
    }

    pub fn origin_speed_cms(&self) -> f64 {
        self.origin_speed_cms
    }

    /// Highest speed along the path, set by the speed limit along its
    /// tangent and by the curvature of its tightest point.
    ///
    /// Units: centimetres/second
    pub fn speed_max_cms(&self) -> f64 {
        self.arc_limits.speed_ne_cms
    }

    /// Speed at the destination if it were left unconstrained.
    pub fn dest_speed_max_cms(&self) -> f64 {
        self.with_dest_speed(self.speed_max_cms()).dest_speed_cms()
    }

    /// Speed at the destination.
    pub fn dest_speed_cms(&self) -> f64 {
        self.along.end_speed_cms()
    }

    /// Fastest speed at which this leg can be entered while still being able
    /// to stop at its destination.
    pub fn origin_speed_max_cms(&self) -> f64 {
        if self.is_zero_length() {
            return 0.0;
        }

        SCurve::max_origin_speed(&Vector3::zeros(), &self.arc_end(), &self.arc_limits)
    }

    pub fn is_zero_length(&self) -> bool {
        (self.destination - self.origin).norm() <= ZERO_LENGTH_CM
    }

    // -----------------------------------------------------------------------
    // Construction
    // -----------------------------------------------------------------------

    fn rebuild(&self, origin_speed_cms: f64, dest_speed_cms: f64) -> Self {
        let mut curve = *self;

        if !curve.is_zero_length() {
            curve.origin_speed_cms = origin_speed_cms.max(0.0);
            curve.along = curve.plan_along(curve.origin_speed_cms, dest_speed_cms);
        }

        curve
    }

    /// A fresh profile along the whole arc.
    fn plan_along(&self, origin_speed_cms: f64, dest_speed_cms: f64) -> SCurve {
        SCurve::new_leg(
            Vector3::zeros(),
            self.arc_end(),
            &self.arc_limits,
            origin_speed_cms,
            dest_speed_cms
        )
    }

    /// End point of the straight leg holding the arc profile.
    fn arc_end(&self) -> Vector3<f64> {
        Vector3::new(self.length_cm(), 0.0, 0.0)
    }

    /// Fill the arc length table by Simpson's rule on each interval.
    fn build_arc_table(&mut self) {
        let h = 1.0 / SPLINE_INTERVALS as f64;

        self.s[0] = 0.0;
        for i in 0..SPLINE_INTERVALS {
            let u0 = i as f64 * h;
            self.s[i + 1] = self.s[i] + self.arc_between(u0, u0 + h);
        }
    }

    /// Limits of the arc profile for the given vehicle limits.
    ///
    /// The acceleration budget is shared equally between the tangential and
    /// centripetal directions.
    fn arc_limits_for(&self, limits: &TrackLimits) -> TrackLimits {
        let h = 1.0 / SPLINE_INTERVALS as f64;

        let mut speed = f64::INFINITY;
        let mut accel = f64::INFINITY;
        let mut curvature_max: f64 = 0.0;

        for i in 0..NUM_SAMPLES {
            let u = i as f64 * h;
            let d1 = self.derivative(u);
            let tangent = unit_or_zero(&d1);
            if tangent.norm_squared() == 0.0 {
                continue;
            }

            speed = speed.min(limits.speed_along(&tangent));
            accel = accel.min(limits.accel_along(&tangent) * FRAC_1_SQRT_2);
            curvature_max = curvature_max.max(curvature(&d1, &self.second_derivative(u)));
        }

        if !speed.is_finite() || !accel.is_finite() {
            speed = 0.0;
            accel = 0.0;
        }

        if curvature_max > 0.0 {
            speed = speed.min(safe_sqrt(accel / curvature_max));
        }

        TrackLimits {
            speed_ne_cms: speed,
            speed_up_cms: speed,
            speed_down_cms: speed,
            accel_ne_cmss: accel,
            accel_corner_cmss: accel,
            accel_u_cmss: accel,
            jerk_cmsss: limits.jerk_cmsss,
            snap_cmssss: limits.snap_cmssss,
        }
    }

    // -----------------------------------------------------------------------
    // Evaluation
    // -----------------------------------------------------------------------

    /// Parameter at a distance along the arc.
    ///
    /// Interpolates in the arc length table and refines with one Newton
    /// step.
    fn param_at(&self, dist_cm: f64) -> f64 {
        let h = 1.0 / SPLINE_INTERVALS as f64;
        let dist_cm = dist_cm.max(0.0).min(self.length_cm());

        let i = self.s[1..]
            .partition_point(|&s| s <= dist_cm)
            .min(SPLINE_INTERVALS - 1);

        let (s0, s1) = (self.s[i], self.s[i + 1]);
        let u0 = i as f64 * h;
        if s1 - s0 <= 0.0 {
            return u0;
        }

        let u = u0 + h * (dist_cm - s0) / (s1 - s0);

        let rate = self.derivative(u).norm();
        if rate <= 0.0 {
            return u;
        }

        let err = s0 + self.arc_between(u0, u) - dist_cm;
        (u - err / rate).max(u0).min(u0 + h)
    }

    /// Arc length between two parameter values by Simpson's rule.
    fn arc_between(&self, u0: f64, u1: f64) -> f64 {
        let f0 = self.derivative(u0).norm();
        let fm = self.derivative(0.5 * (u0 + u1)).norm();
        let f1 = self.derivative(u1).norm();
        (u1 - u0) / 6.0 * (f0 + 4.0 * fm + f1)
    }

    fn position(&self, u: f64) -> Vector3<f64> {
        let [c0, c1, c2, c3, c4, c5] = self.coeffs;
        c0 + (c1 + (c2 + (c3 + (c4 + c5 * u) * u) * u) * u) * u
    }

    fn derivative(&self, u: f64) -> Vector3<f64> {
        let [_, c1, c2, c3, c4, c5] = self.coeffs;
        c1 + (c2 * 2.0 + (c3 * 3.0 + (c4 * 4.0 + c5 * (5.0 * u)) * u) * u) * u
    }

    fn second_derivative(&self, u: f64) -> Vector3<f64> {
        let [_, _, c2, c3, c4, c5] = self.coeffs;
        c2 * 2.0 + (c3 * 6.0 + (c4 * 12.0 + c5 * (20.0 * u)) * u) * u
    }
}

// ---------------------------------------------------------------------------
// PRIVATE FUNCTIONS
// ---------------------------------------------------------------------------

/// Curvature of a parametric curve from its first two derivatives.
fn curvature(d1: &Vector3<f64>, d2: &Vector3<f64>) -> f64 {
    let speed = d1.norm();
    if speed * speed <= LENGTH_SQ_EPSILON {
        return 0.0;
    }
    d1.cross(d2).norm() / (speed * speed * speed)
}

// ---------------------------------------------------------------------------
// TESTS
// ---------------------------------------------------------------------------
