//! Track advancer
//!
//! Steps the legs forward once per control tick. Time along the legs is
//! scaled by three factors:
//!
//! - a lag scaler, which slows progress when the vehicle falls behind its
//!   position target,
//! - a speed scaler, the ratio of a shaped "offset" speed to the desired
//!   speed, which brings the target smoothly to rest when paused, slows it
//!   when the vehicle is outside its terrain margin and follows changes of the
//!   desired speed,
//! - the terrain margin scaler, applied through the offset speed.
//!
//! Velocity and acceleration of the target are rescaled to stay consistent
//! with the scaled time.

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

use nalgebra::Vector3;

use crate::kinematics::{unit_or_zero, KinematicSample, LENGTH_SQ_EPSILON};
use crate::leg_mgr::{LegMgr, LegStep};
use util::maths::{clamp, sqrt_controller};

// ---------------------------------------------------------------------------
// CONSTANTS
// ---------------------------------------------------------------------------

/// Margin added to the lag scaler to allow for short term variation in the
/// vehicle's speed.
const LAG_SCALER_MARGIN: f64 = 0.05;

/// Offset speed errors below this snap to the target speed.
///
/// Units: centimetres/second
const OFFSET_VEL_TOLERANCE_CMS: f64 = 0.5;

// ---------------------------------------------------------------------------
// DATA STRUCTURES
// ---------------------------------------------------------------------------

/// Time scaling state carried between ticks.
#[derive(Debug, Clone)]
pub struct TrackAdvancer {
    /// Smoothed lag scaler.
    track_dt_scalar: f64,

    /// Shaped speed reference used to slow the target.
    ///
    /// Units: centimetres/second
    offset_vel_cms: f64,

    /// Units: centimetres/second^2
    offset_accel_cmss: f64,

    paused: bool,
}

/// Everything the advancer needs from the rest of the system for one tick.
#[derive(Debug, Default, Copy, Clone)]
pub struct TrackInput {
    /// Units: seconds
    pub dt_s: f64,

    /// Units: centimetres/second
    pub desired_speed_cms: f64,

    /// Horizontal acceleration limit.
    ///
    /// Units: centimetres/second^2
    pub accel_cmss: f64,

    /// Jerk limit used to shape the offset speed.
    ///
    /// Units: centimetres/second^3
    pub jerk_cmsss: f64,

    /// Waypoint jerk parameter, sets the lag scaler time constant.
    ///
    /// Units: metres/second^3
    pub jerk_msss: f64,

    /// Time scaler from the terrain margin check, in `(0, 1]`.
    pub terrain_scaler: f64,

    /// Horizontal position controller gain.
    pub pos_ne_p: f64,

    /// Target minus estimated position.
    pub pos_error_neu_cm: Vector3<f64>,

    pub vel_estimate_neu_cms: Vector3<f64>,

    /// The controller's current velocity target, without the terrain rate.
    pub vel_desired_neu_cms: Vector3<f64>,

    /// Terrain offset target shaped by the controller, added to the output.
    pub terrain: KinematicSample,

    pub wp_radius_cm: f64,

    pub fast_waypoint: bool,
}

// ---------------------------------------------------------------------------
// IMPLEMENTATIONS
// ---------------------------------------------------------------------------

impl TrackAdvancer {
    pub fn new(desired_speed_cms: f64) -> Self {
        Self {
            track_dt_scalar: 1.0,
            offset_vel_cms: desired_speed_cms,
            offset_accel_cmss: 0.0,
            paused: false,
        }
    }

    /// Reset for a new route flown at `desired_speed_cms`.
    pub fn reset(&mut self, desired_speed_cms: f64) {
        *self = Self::new(desired_speed_cms);
    }

    pub fn set_paused(&mut self, paused: bool) {
        self.paused = paused;
    }

    pub fn paused(&self) -> bool {
        self.paused
    }

    pub fn offset_vel_cms(&self) -> f64 {
        self.offset_vel_cms
    }

    /// Rescale the offset speed after a change of desired speed.
    pub fn rescale_offset_vel(&mut self, old_speed_cms: f64, new_speed_cms: f64) {
        if old_speed_cms > 0.0 {
            self.offset_vel_cms *= new_speed_cms / old_speed_cms;
        }
        else {
            self.offset_vel_cms = new_speed_cms;
        }
    }

    /// Advance the legs by one tick and return the target to send to the
    /// position controller, relative to the frame origin.
    pub fn advance(&mut self, input: &TrackInput, legs: &mut LegMgr) -> LegStep {
        let dt = input.dt_s;

        // Slow down if the target is running away from the vehicle
        let lag_scaler = self.lag_scaler(input);

        // Bring the offset speed towards the speed we want to be flying
        let mut vel_scaler = 1.0;
        if input.desired_speed_cms > 0.0 {
            let vel_target = if self.paused {
                0.0
            }
            else {
                input.desired_speed_cms * input.terrain_scaler
            };
            self.shape_offset_vel(vel_target, input.accel_cmss, input.jerk_cmsss, dt);
            vel_scaler = self.offset_vel_cms / input.desired_speed_cms;
        }

        // Smooth the lag scaler with a time constant of accel / jerk
        let tc = if input.jerk_msss > 0.0 {
            0.01 * input.accel_cmss / input.jerk_msss
        }
        else {
            1.0
        };
        let alpha = if tc > 0.0 { (dt / tc).min(1.0) } else { 1.0 };
        self.track_dt_scalar += (lag_scaler - self.track_dt_scalar) * alpha;

        let mut step = legs.advance(
            self.track_dt_scalar * vel_scaler * dt,
            input.wp_radius_cm,
            input.fast_waypoint
        );

        // Make velocity and acceleration consistent with the scaled time
        let mut accel_offset = Vector3::zeros();
        let speed = step.target.vel_neu_cms.norm();
        if speed * speed > LENGTH_SQ_EPSILON && input.desired_speed_cms > 0.0 {
            accel_offset = unit_or_zero(&step.target.vel_neu_cms)
                * (self.offset_accel_cmss * speed / input.desired_speed_cms);
        }

        step.target.vel_neu_cms *= vel_scaler;
        step.target.accel_neu_cmss *= vel_scaler * vel_scaler;
        step.target.accel_neu_cmss += accel_offset;

        // Convert to altitude above the origin
        step.target.pos_neu_cm.z += input.terrain.pos_neu_cm.z;
        step.target.vel_neu_cms.z += input.terrain.vel_neu_cms.z;
        step.target.accel_neu_cmss.z += input.terrain.accel_neu_cmss.z;

        step
    }

    /// Ratio of the achievable speed along the current target direction to
    /// the target speed.
    fn lag_scaler(&self, input: &TrackInput) -> f64 {
        let target_vel = &input.vel_desired_neu_cms;
        let target_speed_sq = target_vel.norm_squared();

        if target_speed_sq <= LENGTH_SQ_EPSILON {
            return 1.0;
        }

        let dir = target_vel / target_speed_sq.sqrt();
        let track_error = input.pos_error_neu_cm.dot(&dir);
        let track_vel = input.vel_estimate_neu_cms.dot(&dir);

        clamp(
            &(LAG_SCALER_MARGIN + (track_vel - input.pos_ne_p * track_error) / target_speed_sq.sqrt()),
            &0.0,
            &1.0
        )
    }

    /// Move the offset speed towards `vel_target` under acceleration and
    /// jerk limits.
    fn shape_offset_vel(&mut self, vel_target: f64, accel_max: f64, jerk_max: f64, dt: f64) {
        self.offset_vel_cms += self.offset_accel_cmss * dt;

        if accel_max <= 0.0 || jerk_max <= 0.0 {
            self.offset_vel_cms = vel_target;
            self.offset_accel_cmss = 0.0;
            return;
        }

        let vel_error = vel_target - self.offset_vel_cms;
        let accel_target = clamp(
            &sqrt_controller(vel_error, jerk_max / accel_max, jerk_max, dt),
            &-accel_max,
            &accel_max
        );

        let jerk_step = jerk_max * dt;
        self.offset_accel_cmss += clamp(&(accel_target - self.offset_accel_cmss), &-jerk_step, &jerk_step);

        if vel_error.abs() <= OFFSET_VEL_TOLERANCE_CMS && self.offset_accel_cmss.abs() <= jerk_step {
            self.offset_vel_cms = vel_target;
            self.offset_accel_cmss = 0.0;
        }

        if self.offset_vel_cms < 0.0 {
            self.offset_vel_cms = 0.0;
            self.offset_accel_cmss = self.offset_accel_cmss.max(0.0);
        }
    }
}

// ---------------------------------------------------------------------------
// TESTS
// ---------------------------------------------------------------------------

#[cfg(test)]
mod test {
    use super::*;
    use crate::kinematics::TrackLimits;
    use crate::leg_mgr::Curve;
    use crate::scurve::SCurve;

    fn limits() -> TrackLimits {
        TrackLimits {
            speed_ne_cms: 500.0,
            speed_up_cms: 250.0,
            speed_down_cms: 150.0,
            accel_ne_cmss: 250.0,
            accel_corner_cmss: 500.0,
            accel_u_cmss: 100.0,
            jerk_cmsss: 100.0,
            snap_cmssss: 500.0,
        }
    }

    fn input() -> TrackInput {
        TrackInput {
            dt_s: 0.01,
            desired_speed_cms: 500.0,
            accel_cmss: 250.0,
            jerk_cmsss: 100.0,
            jerk_msss: 1.0,
            terrain_scaler: 1.0,
            pos_ne_p: 1.0,
            wp_radius_cm: 200.0,
            ..Default::default()
        }
    }

    fn legs() -> LegMgr {
        let a = Vector3::zeros();
        let b = Vector3::new(10000.0, 0.0, 0.0);
        let mut legs = LegMgr::new(a, &limits());
        legs.build_this(Curve::Straight(SCurve::new_leg(a, b, &limits(), 0.0, 0.0)));
        legs
    }

    #[test]
    fn test_unscaled_follows_leg() {
        let mut adv = TrackAdvancer::new(500.0);
        let mut legs = legs();
        let reference = legs.this().curve;

        let mut step = None;
        for _ in 0..300 {
            step = Some(adv.advance(&input(), &mut legs));
        }

        let target = step.unwrap().target;
        assert!((target.pos_neu_cm - reference.eval(3.0).pos_neu_cm).norm() < 1e-6);
    }

    #[test]
    fn test_pause_freezes_and_resume_continues() {
        let mut adv = TrackAdvancer::new(500.0);
        let mut legs = legs();

        for _ in 0..300 {
            adv.advance(&input(), &mut legs);
        }

        adv.set_paused(true);
        assert!(adv.paused());

        // Slow to a stop
        let mut last = adv.advance(&input(), &mut legs).target;
        for _ in 0..5000 {
            last = adv.advance(&input(), &mut legs).target;
        }
        assert_eq!(adv.offset_vel_cms(), 0.0);
        let frozen_elapsed = legs.this().elapsed_s;

        // Stays frozen
        for _ in 0..100 {
            let t = adv.advance(&input(), &mut legs).target;
            assert_eq!(t.pos_neu_cm, last.pos_neu_cm);
            assert_eq!(t.vel_neu_cms, Vector3::zeros());
            assert_eq!(t.accel_neu_cmss, Vector3::zeros());
        }
        assert_eq!(legs.this().elapsed_s, frozen_elapsed);

        // Resumes from where it stopped, not from the start of the leg
        adv.set_paused(false);
        for _ in 0..100 {
            adv.advance(&input(), &mut legs);
        }
        assert!(legs.this().elapsed_s > frozen_elapsed);
        assert!(legs.this().sample().pos_neu_cm.x > last.pos_neu_cm.x);
    }

    #[test]
    fn test_terrain_margin_slows_progress() {
        let mut free = TrackAdvancer::new(500.0);
        let mut slowed = TrackAdvancer::new(500.0);
        let mut free_legs = legs();
        let mut slowed_legs = legs();

        let mut slow_input = input();
        slow_input.terrain_scaler = 0.2;

        for _ in 0..4000 {
            free.advance(&input(), &mut free_legs);
            slowed.advance(&slow_input, &mut slowed_legs);
        }

        assert!((slowed.offset_vel_cms() - 100.0).abs() < 1e-9);
        assert!(slowed_legs.this().elapsed_s < free_legs.this().elapsed_s);
    }

    #[test]
    fn test_lag_scaler() {
        let adv = TrackAdvancer::new(500.0);
        let mut inp = input();

        // Stationary target
        assert_eq!(adv.lag_scaler(&inp), 1.0);

        // Vehicle keeping up
        inp.vel_desired_neu_cms = Vector3::new(100.0, 0.0, 0.0);
        inp.vel_estimate_neu_cms = Vector3::new(100.0, 0.0, 0.0);
        assert_eq!(adv.lag_scaler(&inp), 1.0);

        // Vehicle at half speed and 20 cm behind
        inp.vel_estimate_neu_cms = Vector3::new(50.0, 0.0, 0.0);
        inp.pos_error_neu_cm = Vector3::new(20.0, 0.0, 0.0);
        assert!((adv.lag_scaler(&inp) - (0.05 + 30.0 / 100.0)).abs() < 1e-12);
    }

    #[test]
    fn test_terrain_added_to_target() {
        let mut adv = TrackAdvancer::new(500.0);
        let mut legs = legs();
        let mut inp = input();
        inp.terrain = KinematicSample {
            pos_neu_cm: Vector3::new(0.0, 0.0, 300.0),
            vel_neu_cms: Vector3::new(0.0, 0.0, 10.0),
            accel_neu_cmss: Vector3::new(0.0, 0.0, 1.0),
        };
        let step = adv.advance(&inp, &mut legs);
        let bare = legs.this().sample();
        assert!((step.target.pos_neu_cm.z - (bare.pos_neu_cm.z + 300.0)).abs() < 1e-12);
        assert!((step.target.vel_neu_cms.z - 10.0).abs() < 1e-12);
        assert!((step.target.accel_neu_cmss.z - 1.0).abs() < 1e-12);
    }
}
