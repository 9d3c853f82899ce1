//! # Navigation library.
//!
//! Waypoint navigation core of a multicopter. Turns a sequence of
//! destinations into smooth position, velocity and acceleration targets for
//! the position controller, following terrain where asked to.

// ------------------------------------------------------------------------------------------------
// MODULES
// ------------------------------------------------------------------------------------------------

/// Interfaces to the position controller, terrain database and clock
pub mod interfaces;

/// Kinematic samples, limits and shared vector helpers
pub mod kinematics;

/// Leg manager - holds the previous, current and next legs and blends between them
pub mod leg_mgr;

/// Locations and conversion to the local frame
pub mod location;

/// Jerk limited straight line trajectories
pub mod scurve;

/// Simulated position controller, clock and terrain for the mission runner and tests
pub mod sim;

/// Curved trajectories through a waypoint with a given heading
pub mod spline;

/// Terrain resolver - picks the terrain height source and checks the terrain margin
pub mod terrain;

/// Track advancer - moves the target along the legs at the right rate
pub mod track_adv;

/// Waypoint navigation - the waypoint controller and its avoidance wrapper
pub mod wp_nav;
