//! Waypoint navigation module
//!
//! The waypoint controller turns a sequence of destinations into the
//! position, velocity and acceleration targets of the position controller.
//! Straight legs are flown with jerk limited S-curves and blended together at
//! fast waypoints, curved legs are flown with splines.

// ---------------------------------------------------------------------------
// MODULES
// ---------------------------------------------------------------------------

mod oa;
mod params;
mod state;

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

use nalgebra::Vector3;
use serde::Serialize;

// Internal
pub use oa::*;
pub use params::*;
pub use state::*;

use crate::location::Location;
use crate::terrain::TerrainError;

// ---------------------------------------------------------------------------
// CONSTANTS
// ---------------------------------------------------------------------------

/// Lowest horizontal speed that may be commanded.
///
/// Units: centimetres/second
pub const WPNAV_WP_SPEED_MIN_CMS: f64 = 20.0;

/// Horizontal acceleration used when the parameter is not positive.
///
/// Units: centimetres/second^2
pub const WPNAV_ACCELERATION_CMSS: f64 = 250.0;

/// Vertical acceleration used when the parameter is not positive.
///
/// Units: centimetres/second^2
pub const WPNAV_ACCEL_Z_CMSS: f64 = 100.0;

/// The controller counts as active if it was updated within this time.
///
/// Units: milliseconds
pub const IS_ACTIVE_TIMEOUT_MS: u64 = 200;

/// Horizontal target speed above which the track heading is used as the yaw
/// target.
///
/// Units: centimetres/second
pub const WPNAV_YAW_VEL_MIN_CMS: f64 = 10.0;

// ---------------------------------------------------------------------------
// DATA STRUCTURES
// ---------------------------------------------------------------------------

/// Status flags of the waypoint controller.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Serialize)]
pub struct WpFlags {
    /// True once the current destination has been reached.
    pub reached_destination: bool,

    /// True if the destination is passed through at speed rather than
    /// stopped at, in which case it is reached as soon as the target gets
    /// there regardless of the waypoint radius.
    pub fast_waypoint: bool,

    /// True once a yaw target has been taken from the track.
    pub wp_yaw_set: bool,
}

// ---------------------------------------------------------------------------
// ENUMERATIONS
// ---------------------------------------------------------------------------

/// Top level state of the waypoint controller.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
pub enum WpNavMode {
    /// Not yet initialised, no target is produced.
    Uninitialised,

    /// Flying towards a destination, or idle at the initial stopping point
    /// waiting for one.
    Active,

    /// Reached the final destination, holding there.
    Holding,
}

/// Possible errors that can occur during waypoint navigation.
#[derive(Debug, thiserror::Error)]
pub enum WpNavError {
    #[error("The location cannot be converted into the local frame, is the frame origin set?")]
    Conversion,

    #[error("Terrain data is unavailable: {0}")]
    Terrain(#[from] TerrainError),

    #[error("The altitude frames of consecutive destinations do not match")]
    AltFrameMismatch,

    #[error("The waypoint controller has not been initialised")]
    NotInitialised,
}

// ---------------------------------------------------------------------------
// TRAITS
// ---------------------------------------------------------------------------

/// The operations through which a vehicle flies waypoints, shared by the
/// plain controller and the avoidance aware wrapper around it.
pub trait WaypointNav {
    /// Set the destination as a vector from the frame origin.
    ///
    /// `terrain_alt` is true if the destination's `z` is an altitude above
    /// terrain.
    fn set_wp_destination_neu_cm(
        &mut self,
        destination_neu_cm: &Vector3<f64>,
        terrain_alt: bool
    ) -> Result<(), WpNavError>;

    /// The destination currently being flown to, which may differ from the
    /// commanded one while avoiding an obstacle.
    fn get_oa_wp_destination(&self) -> Result<Location, WpNavError>;

    /// Horizontal distance to the commanded destination.
    ///
    /// Units: centimetres
    fn get_wp_distance_to_destination_cm(&self) -> f64;

    /// Bearing to the commanded destination.
    ///
    /// Units: centidegrees in `[0, 36000)`
    fn get_wp_bearing_to_destination_cd(&self) -> f64;

    fn reached_wp_destination(&self) -> bool;

    /// Run one control tick, should be called at 100 Hz or faster.
    fn update_wpnav(&mut self) -> Result<StatusReport, WpNavError>;
}
