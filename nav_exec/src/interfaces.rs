//! Interfaces to the collaborators the navigation core drives or consults.
//!
//! The core never owns these. They are borrowed for the lifetime of the
//! waypoint controller, which must therefore not outlive them.

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

use nalgebra::{Vector2, Vector3};

// ---------------------------------------------------------------------------
// TRAITS
// ---------------------------------------------------------------------------

/// The lower level position controller which turns kinematic targets into
/// attitude and thrust demands.
///
/// All positions are in the local NEU frame in centimetres. Vertical
/// positions are above the frame origin unless stated otherwise.
pub trait PositionControl {
    /// Set the target position, velocity and acceleration for this tick.
    fn set_pos_vel_accel_neu_cm(
        &mut self,
        pos_neu_cm: &Vector3<f64>,
        vel_neu_cms: &Vector3<f64>,
        accel_neu_cmss: &Vector3<f64>
    );

    /// Run the horizontal controller on the latest targets.
    fn update_ne_controller(&mut self);

    /// Reset the horizontal controller so its target is the current position
    /// and velocity.
    fn init_ne_controller(&mut self);

    /// Reset the horizontal controller so its target is the stopping point.
    fn init_ne_controller_stopping_point(&mut self);

    /// Reset the vertical controller so its target is the stopping point.
    fn init_u_controller_stopping_point(&mut self);

    fn set_max_speed_accel_ne_cm(&mut self, speed_cms: f64, accel_cmss: f64);

    /// `speed_down_cms` is positive for a descent.
    fn set_max_speed_accel_u_cm(&mut self, speed_down_cms: f64, speed_up_cms: f64, accel_cmss: f64);

    /// Reset the terrain offset the controller tracks, without a transient.
    fn init_pos_terrain_u_cm(&mut self, terrain_cm: f64);

    /// Set the terrain offset the controller should move towards.
    fn set_pos_terrain_target_u_cm(&mut self, terrain_cm: f64);

    /// Current shaped terrain offset.
    fn pos_terrain_u_cm(&self) -> f64;

    fn vel_terrain_u_cms(&self) -> f64;

    fn accel_terrain_u_cmss(&self) -> f64;

    /// Horizontal position at which the vehicle would stop.
    fn stopping_point_ne_cm(&self) -> Vector2<f64>;

    /// Altitude at which the vehicle would stop.
    fn stopping_point_u_cm(&self) -> f64;

    fn pos_estimate_neu_cm(&self) -> Vector3<f64>;

    fn vel_estimate_neu_cms(&self) -> Vector3<f64>;

    /// The velocity target currently held by the controller.
    fn vel_desired_neu_cms(&self) -> Vector3<f64>;

    /// Target minus estimated position.
    fn pos_error_neu_cm(&self) -> Vector3<f64>;

    /// Horizontal position controller proportional gain.
    fn pos_ne_p(&self) -> f64;

    /// Controller period in seconds.
    fn dt_s(&self) -> f64;

    fn roll_rad(&self) -> f64;

    fn pitch_rad(&self) -> f64;

    fn yaw_rad(&self) -> f64;

    /// Unit thrust direction in the NEU frame.
    fn thrust_vector(&self) -> Vector3<f64>;

    /// Horizontal distance from the vehicle to the track.
    fn crosstrack_error_cm(&self) -> f64;
}

/// A store of terrain heights.
pub trait TerrainDatabase {
    /// Height of the terrain above the frame origin at a horizontal position,
    /// or `None` if no data is held for it.
    fn height_above_origin_cm(&self, pos_ne_cm: &Vector2<f64>) -> Option<f64>;
}

/// A monotonic millisecond clock.
pub trait Clock {
    fn now_ms(&self) -> u64;
}
