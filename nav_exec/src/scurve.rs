//! Jerk and snap limited straight line trajectories ("S-curves").
//!
//! A leg is planned along its track direction as a one dimensional profile
//! built from a small fixed table of segments. Jerk is changed using raised
//! cosine ramps, which bounds snap, so each change of speed is made of
//!
//! 1. a jerk phase raising the acceleration (ramp up, constant jerk, ramp down),
//! 2. a constant acceleration phase,
//! 3. a jerk phase returning the acceleration to zero.
//!
//! A full leg is an optional phase removing any initial acceleration, a
//! change of speed to the cruise speed, a cruise, and a change of speed to the
//! destination speed. Evaluation is a pure function of time.

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

use log::{debug, trace};
use nalgebra::Vector3;
use std::f64::consts::PI;

use crate::kinematics::{unit_or_zero, KinematicSample, TrackLimits};
use util::maths::safe_sqrt;

// ---------------------------------------------------------------------------
// CONSTANTS
// ---------------------------------------------------------------------------

/// Maximum number of segments in a profile, including the initial state.
pub const SEGMENTS_MAX: usize = 20;

/// Legs shorter than this are treated as zero length.
///
/// Units: centimetres
pub const ZERO_LENGTH_CM: f64 = 1e-3;

/// Number of bisection iterations used to find cruise and end speeds.
const BISECTION_ITERATIONS: usize = 40;

/// Speed changes smaller than this are skipped.
///
/// Units: centimetres/second
const SPEED_EPSILON_CMS: f64 = 1e-6;

/// Accelerations smaller than this are treated as zero.
///
/// Units: centimetres/second^2
const ACCEL_EPSILON_CMSS: f64 = 1e-6;

/// Segments shorter than this are not added to the table.
///
/// Units: seconds
const TIME_EPSILON_S: f64 = 1e-9;

// ---------------------------------------------------------------------------
// DATA STRUCTURES
// ---------------------------------------------------------------------------

/// A straight line trajectory from an origin to a destination.
#[derive(Debug, Copy, Clone)]
pub struct SCurve {
    origin: Vector3<f64>,
    destination: Vector3<f64>,

    /// Unit vector from origin to destination, zero for a zero length leg.
    direction: Vector3<f64>,

    /// Units: centimetres
    length_cm: f64,

    /// The limits the leg was built with, kept for rebuilding.
    limits: TrackLimits,

    along: AlongTrackLimits,

    segments: [Segment; SEGMENTS_MAX],
    num_segments: usize,

    /// Speed at the destination.
    ///
    /// Units: centimetres/second
    end_speed_cms: f64,

    /// Midpoint of the initial change of speed.
    turn_in_s: f64,

    /// Time at which the final change of speed starts.
    decel_start_s: f64,

    /// Midpoint of the final change of speed.
    turn_out_s: f64,
}

/// Limits projected onto the track direction.
#[derive(Debug, Default, Copy, Clone, PartialEq)]
struct AlongTrackLimits {
    vel_max: f64,
    accel_max: f64,
    jerk_max: f64,
    snap_max: f64,
}

/// One entry of the segment table. The start state of a segment is the end
/// state of the previous one.
#[derive(Debug, Default, Copy, Clone)]
struct Segment {
    kind: SegmentKind,

    /// Constant jerk, or the peak jerk of a ramp.
    jerk: f64,

    end_time: f64,
    end_accel: f64,
    end_vel: f64,
    end_pos: f64,
}

/// Timing of a single jerk phase changing the acceleration by `jm * (tj + t2)`.
#[derive(Debug, Default, Copy, Clone)]
struct JerkTiming {
    /// Duration of each raised cosine ramp.
    tj: f64,

    /// Peak jerk.
    jm: f64,

    /// Duration of the constant jerk part.
    t2: f64,
}

/// Timing of a complete change of speed.
#[derive(Debug, Default, Copy, Clone)]
struct SpeedChangeTiming {
    jerk: JerkTiming,

    /// Duration of the constant acceleration part.
    t4: f64,
}

// ---------------------------------------------------------------------------
// ENUMERATIONS
// ---------------------------------------------------------------------------

#[derive(Debug, Copy, Clone, PartialEq)]
enum SegmentKind {
    /// The initial state, holds no motion.
    Init,

    /// Constant jerk (zero jerk gives constant acceleration or cruise).
    ConstJerk,

    /// Raised cosine ramp of jerk from zero to `jerk`.
    RampUp,

    /// Raised cosine ramp of jerk from `jerk` to zero.
    RampDown,
}

impl Default for SegmentKind {
    fn default() -> Self {
        SegmentKind::Init
    }
}

// ---------------------------------------------------------------------------
// IMPLEMENTATIONS
// ---------------------------------------------------------------------------

impl SCurve {
    /// Build a new leg from `origin` to `destination`.
    ///
    /// The leg starts at `origin_speed_cms` and finishes at `dest_speed_cms`,
    /// both along the track direction, with zero acceleration at either end.
    /// If the requested end speed cannot be reached within the leg the closest
    /// reachable speed is used instead, see [`SCurve::end_speed_cms`].
    pub fn new_leg(
        origin: Vector3<f64>,
        destination: Vector3<f64>,
        limits: &TrackLimits,
        origin_speed_cms: f64,
        dest_speed_cms: f64
    ) -> Self {
        let mut curve = Self::empty(origin, destination, limits);

        if curve.is_zero_length() {
            return curve;
        }

        let origin_speed = origin_speed_cms.max(0.0);
        let dest_speed = dest_speed_cms.max(0.0);

        if !curve.plan(0.0, 0.0, origin_speed, 0.0, dest_speed) {
            let reachable = curve.along.closest_reachable_speed(
                origin_speed,
                dest_speed.min(curve.along.vel_max),
                curve.length_cm
            );
            debug!(
                "Leg cannot finish at {:.1} cm/s, finishing at {:.1} cm/s instead",
                dest_speed, reachable
            );
            curve.plan(0.0, 0.0, origin_speed, 0.0, reachable);
        }

        curve
    }

    /// Rebuild this leg from its state at `time_s` using new limits and a new
    /// destination speed.
    ///
    /// The rebuilt profile starts from exactly the position, velocity and
    /// acceleration of this one at `time_s`, and keeps the same time base, so
    /// it can replace this leg without resetting the leg's time cursor.
    /// Returns `None` if the destination speed cannot be reached within the
    /// remaining distance under the new limits.
    pub fn from_state(
        &self,
        time_s: f64,
        limits: &TrackLimits,
        dest_speed_cms: f64
    ) -> Option<Self> {
        if self.is_zero_length() {
            return Some(Self::empty(self.origin, self.destination, limits));
        }

        let time_s = time_s.max(0.0).min(self.duration_s());
        let (pos, vel, accel) = self.eval_along(time_s);

        let mut curve = Self::empty(self.origin, self.destination, limits);

        if curve.plan(time_s, pos, vel, accel, dest_speed_cms.max(0.0)) {
            Some(curve)
        }
        else {
            None
        }
    }

    /// Largest speed at which a leg from `origin` to `destination` can be
    /// entered while still being able to stop at its destination.
    pub fn max_origin_speed(
        origin: &Vector3<f64>,
        destination: &Vector3<f64>,
        limits: &TrackLimits
    ) -> f64 {
        let curve = Self::empty(*origin, *destination, limits);

        if curve.is_zero_length() {
            return 0.0;
        }

        let along = curve.along;
        if along.speed_change_dist(along.vel_max, 0.0) <= curve.length_cm {
            return along.vel_max;
        }

        let (mut lo, mut hi) = (0.0, along.vel_max);
        for _ in 0..BISECTION_ITERATIONS {
            let mid = 0.5 * (lo + hi);
            if along.speed_change_dist(mid, 0.0) <= curve.length_cm {
                lo = mid;
            }
            else {
                hi = mid;
            }
        }

        lo
    }

    /// Evaluate the leg at `time_s` seconds from its start.
    ///
    /// Times at or beyond the duration return the destination with the end
    /// speed along the track and zero acceleration.
    pub fn eval(&self, time_s: f64) -> KinematicSample {
        if self.is_zero_length() {
            return KinematicSample::at_rest(self.destination);
        }

        if time_s >= self.duration_s() {
            return KinematicSample {
                pos_neu_cm: self.destination,
                vel_neu_cms: self.direction * self.end_speed_cms,
                accel_neu_cmss: Vector3::zeros(),
            };
        }

        let (pos, vel, accel) = self.eval_along(time_s);

        KinematicSample {
            pos_neu_cm: self.origin + self.direction * pos,
            vel_neu_cms: self.direction * vel,
            accel_neu_cmss: self.direction * accel,
        }
    }

    /// Distance travelled along the track at `time_s`.
    pub fn pos_along_cm(&self, time_s: f64) -> f64 {
        if time_s >= self.duration_s() {
            self.length_cm
        }
        else {
            self.eval_along(time_s).0
        }
    }

    pub fn origin(&self) -> &Vector3<f64> {
        &self.origin
    }

    pub fn destination(&self) -> &Vector3<f64> {
        &self.destination
    }

    /// Unit vector from origin to destination.
    pub fn direction(&self) -> &Vector3<f64> {
        &self.direction
    }

    pub fn length_cm(&self) -> f64 {
        self.length_cm
    }

    pub fn limits(&self) -> &TrackLimits {
        &self.limits
    }

    /// Total duration of the leg in seconds.
    pub fn duration_s(&self) -> f64 {
        self.segments[self.num_segments - 1].end_time
    }

    /// Speed along the track at the start of the profile.
    pub fn origin_speed_cms(&self) -> f64 {
        self.segments[0].end_vel
    }

    /// Speed along the track at the destination.
    pub fn end_speed_cms(&self) -> f64 {
        self.end_speed_cms
    }

    /// Speed limit along the track.
    pub fn speed_max_cms(&self) -> f64 {
        self.along.vel_max
    }

    /// Midpoint of the change of speed at the start of the leg.
    pub fn turn_in_s(&self) -> f64 {
        self.turn_in_s
    }

    /// Midpoint of the change of speed at the end of the leg.
    pub fn turn_out_s(&self) -> f64 {
        self.turn_out_s
    }

    /// Time at which the final change of speed begins.
    pub fn decel_start_s(&self) -> f64 {
        self.decel_start_s
    }

    pub fn is_zero_length(&self) -> bool {
        self.length_cm <= ZERO_LENGTH_CM
    }

    // -----------------------------------------------------------------------
    // Planning
    // -----------------------------------------------------------------------

    /// A leg holding only its initial state at the origin.
    fn empty(origin: Vector3<f64>, destination: Vector3<f64>, limits: &TrackLimits) -> Self {
        let delta = destination - origin;
        let length_cm = delta.norm();
        let direction = if length_cm > ZERO_LENGTH_CM {
            unit_or_zero(&delta)
        }
        else {
            Vector3::zeros()
        };

        Self {
            origin,
            destination,
            direction,
            length_cm,
            limits: *limits,
            along: AlongTrackLimits::new(limits, &direction),
            segments: [Segment::default(); SEGMENTS_MAX],
            num_segments: 1,
            end_speed_cms: 0.0,
            turn_in_s: 0.0,
            decel_start_s: 0.0,
            turn_out_s: 0.0,
        }
    }

    /// Fill the segment table starting from the given along track state.
    ///
    /// Returns false if `dest_speed` cannot be reached in the remaining
    /// distance, in which case the table contents are not meaningful.
    fn plan(
        &mut self,
        start_time: f64,
        start_pos: f64,
        start_vel: f64,
        start_accel: f64,
        dest_speed: f64
    ) -> bool {
        self.segments[0] = Segment {
            kind: SegmentKind::Init,
            jerk: 0.0,
            end_time: start_time,
            end_accel: start_accel,
            end_vel: start_vel,
            end_pos: start_pos,
        };
        self.num_segments = 1;

        // Remove any initial acceleration before planning the speed changes
        if start_accel.abs() > ACCEL_EPSILON_CMSS {
            let timing = self.along.accel_change(start_accel.abs());
            self.push_jerk_phase(-start_accel.signum(), &timing);
        }

        let last = self.last_segment();
        let (vel, remaining) = (last.end_vel, self.length_cm - last.end_pos);
        let v_top = self.along.vel_max;
        let v_end = dest_speed.min(v_top);

        let along = self.along;
        let dist = |v_cruise: f64| {
            along.speed_change_dist(vel, v_cruise) + along.speed_change_dist(v_cruise, v_end)
        };

        let v_floor = if vel <= v_top { vel.max(v_end) } else { v_end };

        let v_cruise = if dist(v_top) <= remaining {
            v_top
        }
        else if v_floor < v_top && dist(v_floor) <= remaining {
            let (mut lo, mut hi) = (v_floor, v_top);
            for _ in 0..BISECTION_ITERATIONS {
                let mid = 0.5 * (lo + hi);
                if dist(mid) <= remaining {
                    lo = mid;
                }
                else {
                    hi = mid;
                }
            }
            lo
        }
        else {
            trace!(
                "Cannot plan from {:.2} cm/s to {:.2} cm/s in {:.2} cm",
                vel, v_end, remaining
            );
            return false;
        };

        // Change to the cruise speed
        let accel_phase_start = self.last_segment().end_time;
        self.push_speed_change(vel, v_cruise);
        self.turn_in_s = 0.5 * (accel_phase_start + self.last_segment().end_time);

        // Cruise for whatever distance is left over
        if v_cruise > SPEED_EPSILON_CMS {
            let cruise_s = ((remaining - dist(v_cruise)) / v_cruise).max(0.0);
            self.push(SegmentKind::ConstJerk, 0.0, cruise_s);
        }

        // Change to the destination speed
        self.decel_start_s = self.last_segment().end_time;
        self.push_speed_change(v_cruise, v_end);
        self.turn_out_s = 0.5 * (self.decel_start_s + self.last_segment().end_time);

        self.end_speed_cms = v_end;

        true
    }

    fn last_segment(&self) -> Segment {
        self.segments[self.num_segments - 1]
    }

    /// Append a segment of the given kind and duration.
    fn push(&mut self, kind: SegmentKind, jerk: f64, duration: f64) {
        if duration <= TIME_EPSILON_S || self.num_segments >= SEGMENTS_MAX {
            return;
        }

        let start = self.last_segment();
        let (pos, vel, accel) = integrate(kind, jerk, duration, duration, &start);

        self.segments[self.num_segments] = Segment {
            kind,
            jerk,
            end_time: start.end_time + duration,
            end_accel: accel,
            end_vel: vel,
            end_pos: pos,
        };
        self.num_segments += 1;
    }

    /// Append a jerk phase changing the acceleration by `sign * jm * (tj + t2)`.
    fn push_jerk_phase(&mut self, sign: f64, timing: &JerkTiming) {
        let jerk = sign * timing.jm;
        self.push(SegmentKind::RampUp, jerk, timing.tj);
        self.push(SegmentKind::ConstJerk, jerk, timing.t2);
        self.push(SegmentKind::RampDown, jerk, timing.tj);
    }

    /// Append a complete change of speed, starting and ending with zero
    /// acceleration.
    fn push_speed_change(&mut self, from: f64, to: f64) {
        let delta = to - from;
        if delta.abs() <= SPEED_EPSILON_CMS {
            return;
        }

        let sign = delta.signum();
        let timing = self.along.speed_change(delta.abs());

        self.push_jerk_phase(sign, &timing.jerk);
        self.push(SegmentKind::ConstJerk, 0.0, timing.t4);
        self.push_jerk_phase(-sign, &timing.jerk);
    }

    /// Position, velocity and acceleration along the track at `time`.
    fn eval_along(&self, time: f64) -> (f64, f64, f64) {
        let init = self.segments[0];
        if time <= init.end_time {
            return (init.end_pos, init.end_vel, init.end_accel);
        }

        for i in 1..self.num_segments {
            let seg = &self.segments[i];
            if time <= seg.end_time {
                let start = &self.segments[i - 1];
                return integrate(
                    seg.kind,
                    seg.jerk,
                    seg.end_time - start.end_time,
                    time - start.end_time,
                    start
                );
            }
        }

        let last = self.last_segment();
        (last.end_pos, last.end_vel, last.end_accel)
    }
}

impl AlongTrackLimits {
    fn new(limits: &TrackLimits, direction: &Vector3<f64>) -> Self {
        if direction.norm_squared() == 0.0 {
            return Self::default();
        }

        Self {
            vel_max: limits.speed_along(direction),
            accel_max: limits.accel_along(direction),
            jerk_max: limits.jerk_cmsss,
            snap_max: limits.snap_cmssss,
        }
    }

    /// Ramp duration at full jerk, which gives peak snap equal to the limit.
    fn nominal_jerk_time(&self) -> f64 {
        self.jerk_max * PI / (2.0 * self.snap_max)
    }

    /// Timing of a jerk phase changing the acceleration by `delta_accel`.
    fn accel_change(&self, delta_accel: f64) -> JerkTiming {
        let tj = self.nominal_jerk_time();

        if delta_accel >= self.jerk_max * tj {
            JerkTiming {
                tj,
                jm: self.jerk_max,
                t2: delta_accel / self.jerk_max - tj,
            }
        }
        else {
            let tj = safe_sqrt(delta_accel * PI / (2.0 * self.snap_max));
            JerkTiming {
                tj,
                jm: 2.0 * self.snap_max * tj / PI,
                t2: 0.0,
            }
        }
    }

    /// Timing of a change of speed of `delta_vel` (positive).
    fn speed_change(&self, delta_vel: f64) -> SpeedChangeTiming {
        if delta_vel <= SPEED_EPSILON_CMS
            || self.accel_max <= 0.0
            || self.jerk_max <= 0.0
            || self.snap_max <= 0.0
        {
            return SpeedChangeTiming::default();
        }

        let mut tj = self.nominal_jerk_time();
        let mut jm = self.jerk_max;
        let mut am = self.accel_max;

        // Acceleration limit reached within the ramps alone
        if am < jm * tj {
            tj = safe_sqrt(am * PI / (2.0 * self.snap_max));
            jm = 2.0 * self.snap_max * tj / PI;
        }

        // Not enough change of speed to reach the acceleration limit
        if am * (tj + am / jm) > delta_vel {
            am = 0.5 * jm * (-tj + safe_sqrt(tj * tj + 4.0 * delta_vel / jm));
        }

        // Not enough change of speed to reach full jerk
        if am < jm * tj {
            let tj = (delta_vel * PI / (4.0 * self.snap_max)).cbrt();
            return SpeedChangeTiming {
                jerk: JerkTiming {
                    tj,
                    jm: 2.0 * self.snap_max * tj / PI,
                    t2: 0.0,
                },
                t4: 0.0,
            };
        }

        let t2 = (am / jm - tj).max(0.0);
        let t4 = (delta_vel / am - 2.0 * tj - t2).max(0.0);

        SpeedChangeTiming {
            jerk: JerkTiming { tj, jm, t2 },
            t4,
        }
    }

    /// Distance covered while changing speed from `from` to `to`.
    ///
    /// The acceleration profile is symmetric in time, so the distance is the
    /// duration times the mean of the two speeds.
    fn speed_change_dist(&self, from: f64, to: f64) -> f64 {
        self.speed_change((to - from).abs()).duration() * 0.5 * (from + to)
    }

    /// The speed closest to `target` which can be reached from `from` within
    /// `distance`.
    fn closest_reachable_speed(&self, from: f64, target: f64, distance: f64) -> f64 {
        if self.speed_change_dist(from, target) <= distance {
            return target;
        }

        // `lo` is the unreachable side, `hi` the reachable side
        let (mut lo, mut hi) = (target, from);
        for _ in 0..BISECTION_ITERATIONS {
            let mid = 0.5 * (lo + hi);
            if self.speed_change_dist(from, mid) <= distance {
                hi = mid;
            }
            else {
                lo = mid;
            }
        }

        hi
    }
}

impl SpeedChangeTiming {
    fn duration(&self) -> f64 {
        4.0 * self.jerk.tj + 2.0 * self.jerk.t2 + self.t4
    }
}

// ---------------------------------------------------------------------------
// PRIVATE FUNCTIONS
// ---------------------------------------------------------------------------

/// Integrate a segment from its start state for `tau` seconds.
///
/// Returns `(position, velocity, acceleration)`.
fn integrate(
    kind: SegmentKind,
    jerk: f64,
    duration: f64,
    tau: f64,
    start: &Segment
) -> (f64, f64, f64) {
    let (p0, v0, a0) = (start.end_pos, start.end_vel, start.end_accel);
    let t = tau;
    let t2 = t * t;
    let t3 = t2 * t;

    match kind {
        SegmentKind::Init | SegmentKind::ConstJerk => (
            p0 + v0 * t + 0.5 * a0 * t2 + jerk * t3 / 6.0,
            v0 + a0 * t + 0.5 * jerk * t2,
            a0 + jerk * t,
        ),
        SegmentKind::RampUp | SegmentKind::RampDown => {
            // jerk(t) = alpha * (1 -/+ cos(beta * t))
            let alpha = 0.5 * jerk;
            let beta = PI / duration;
            let (sin, cos) = (beta * t).sin_cos();
            let k = alpha / (beta * beta);

            let sign = if kind == SegmentKind::RampUp { -1.0 } else { 1.0 };

            (
                p0 + v0 * t + 0.5 * a0 * t2 + alpha * t3 / 6.0
                    - sign * k * (sin / beta - t),
                v0 + a0 * t + 0.5 * alpha * t2 + sign * k * (1.0 - cos),
                a0 + alpha * t + sign * (alpha / beta) * sin,
            )
        }
    }
}

// ---------------------------------------------------------------------------
// TESTS
// ---------------------------------------------------------------------------
