//! Parameters structure for waypoint navigation

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// DATA STRUCTURES
// ---------------------------------------------------------------------------

/// Tunables of the waypoint controller.
///
/// Changes made while flying (through `WpNav::params_mut`) are picked up on
/// the next update, speed and acceleration changes replan the legs in flight.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WpNavParams {
    /// Default horizontal speed.
    ///
    /// Units: centimetres/second
    pub speed_cms: f64,

    /// Distance from a stop waypoint within which it counts as reached.
    ///
    /// Units: centimetres
    pub radius_cm: f64,

    /// Default climb speed.
    ///
    /// Units: centimetres/second
    pub speed_up_cms: f64,

    /// Default descent speed, positive down.
    ///
    /// Units: centimetres/second
    pub speed_down_cms: f64,

    /// Horizontal acceleration, 250 cm/s^2 is used if not positive.
    ///
    /// Units: centimetres/second^2
    pub accel_cmss: f64,

    /// Cornering acceleration, twice the horizontal acceleration is used if
    /// not positive.
    ///
    /// Units: centimetres/second^2
    pub accel_c_cmss: f64,

    /// Units: centimetres/second^2
    pub accel_z_cmss: f64,

    /// Jerk limit, the horizontal acceleration divided by 100 if not
    /// positive.
    ///
    /// Units: metres/second^3
    pub jerk_msss: f64,

    /// Vertical error from a terrain-relative target beyond which progress
    /// along the track is slowed.
    ///
    /// Units: metres
    pub terrain_margin_m: f64,

    /// Whether the rangefinder may be used for terrain following.
    pub rangefinder_use: bool,

    /// Snap limit as a multiple of the jerk limit.
    ///
    /// Units: 1/second
    pub snap_jerk_ratio: f64,
}

// ---------------------------------------------------------------------------
// IMPLEMENTATIONS
// ---------------------------------------------------------------------------

impl Default for WpNavParams {
    fn default() -> Self {
        Self {
            speed_cms: 1000.0,
            radius_cm: 200.0,
            speed_up_cms: 250.0,
            speed_down_cms: 150.0,
            accel_cmss: 250.0,
            accel_c_cmss: 0.0,
            accel_z_cmss: 100.0,
            jerk_msss: 1.0,
            terrain_margin_m: 10.0,
            rangefinder_use: true,
            snap_jerk_ratio: 5.0,
        }
    }
}

// ---------------------------------------------------------------------------
// TESTS
// ---------------------------------------------------------------------------

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_partial_file_uses_defaults() {
        let params: WpNavParams = util::params::from_str(
            "speed_cms = 500.0\nrangefinder_use = false\n"
        ).unwrap();

        assert_eq!(params.speed_cms, 500.0);
        assert!(!params.rangefinder_use);
        assert_eq!(params.radius_cm, 200.0);
        assert_eq!(params.snap_jerk_ratio, 5.0);
    }
}
