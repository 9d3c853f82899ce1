//! # Mission runner
//!
//! Feeds a list of waypoints to the waypoint controller, queueing the next
//! one as each destination becomes current so that corners are flown
//! without stopping where the altitude frames allow.

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use log::{debug, info};
use nalgebra::Vector3;
use serde::Deserialize;

use nav_lib::{
    sim::TerrainParams,
    wp_nav::{StatusReport, WpNav, WpNavError, WpNavMode},
};

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

/// Parameters of the simulated mission.
#[derive(Debug, Clone, Deserialize)]
pub struct NavExecParams {
    /// Period of one control cycle.
    ///
    /// Units: seconds
    pub cycle_period_s: f64,

    /// The simulation stops after this time even if the mission is not
    /// complete.
    ///
    /// Units: seconds
    pub max_duration_s: f64,

    /// Horizontal position gain of the simulated position controller.
    pub pos_ne_p: f64,

    /// Units: degrees
    pub origin_lat_deg: f64,

    /// Units: degrees
    pub origin_lon_deg: f64,

    /// Units: centimetres
    pub origin_alt_cm: f64,

    /// Initial vehicle position.
    ///
    /// Units: centimetres
    pub start_neu_cm: [f64; 3],

    /// Simulate a downward rangefinder over the terrain.
    pub rangefinder_enabled: bool,

    /// Height above the terrain beyond which the rangefinder is unhealthy.
    ///
    /// Units: centimetres
    pub rangefinder_max_cm: f64,

    pub terrain: TerrainParams,

    pub waypoints: Vec<Waypoint>,
}

/// One waypoint of the mission.
#[derive(Debug, Copy, Clone, Deserialize)]
pub struct Waypoint {
    /// Units: centimetres
    pub pos_neu_cm: [f64; 3],

    /// The altitude is above terrain rather than above the origin.
    #[serde(default)]
    pub terrain_alt: bool,

    /// Fly a curved leg to this waypoint.
    #[serde(default)]
    pub spline: bool,
}

/// Tracks the progress of the vehicle through the waypoints.
pub struct Mission {
    waypoints: Vec<Waypoint>,

    /// Index of the current destination.
    current: usize,

    /// The waypoint after the current one has been handed to the controller.
    next_queued: bool,

    complete: bool,
}

// ------------------------------------------------------------------------------------------------
// IMPLEMENTATIONS
// ------------------------------------------------------------------------------------------------

impl Waypoint {
    pub fn vector(&self) -> Vector3<f64> {
        Vector3::from(self.pos_neu_cm)
    }
}

impl Mission {
    pub fn new(waypoints: Vec<Waypoint>) -> Self {
        let complete = waypoints.is_empty();

        Self {
            waypoints,
            current: 0,
            next_queued: false,
            complete,
        }
    }

    pub fn complete(&self) -> bool {
        self.complete
    }

    /// Index of the current destination.
    pub fn current(&self) -> usize {
        self.current
    }

    /// Fly to the first waypoint.
    pub fn start(&mut self, nav: &mut WpNav) -> Result<(), WpNavError> {
        if self.complete {
            return Ok(());
        }

        self.set_destination(nav, 0)
    }

    /// Act on the result of a control cycle.
    pub fn update(&mut self, nav: &mut WpNav, report: &StatusReport) -> Result<(), WpNavError> {
        if self.complete {
            return Ok(());
        }

        if report.leg_promoted {
            self.current += 1;
            self.next_queued = false;
            info!("Waypoint {} reached, flying to waypoint {}", self.current - 1, self.current);
            self.queue_next(nav)?;
        }

        if nav.mode() == WpNavMode::Holding {
            // Stopped at a waypoint whose successor could not be queued
            if self.current + 1 < self.waypoints.len() {
                info!("Waypoint {} reached, flying to waypoint {}", self.current, self.current + 1);
                self.set_destination(nav, self.current + 1)?;
            }
            else {
                info!("Mission complete");
                self.complete = true;
            }
        }

        Ok(())
    }

    fn set_destination(&mut self, nav: &mut WpNav, index: usize) -> Result<(), WpNavError> {
        let wp = self.waypoints[index];

        if wp.spline {
            let (next, next_is_spline) = match self.waypoints.get(index + 1) {
                Some(n) if n.terrain_alt == wp.terrain_alt => (n.vector(), n.spline),
                _ => (wp.vector(), false),
            };

            nav.set_spline_destination_neu_cm(
                &wp.vector(),
                wp.terrain_alt,
                &next,
                wp.terrain_alt,
                next_is_spline
            )?;
        }
        else {
            nav.set_wp_destination_neu_cm(&wp.vector(), wp.terrain_alt)?;
        }

        self.current = index;
        self.next_queued = false;

        self.queue_next(nav)
    }

    /// Hand the waypoint after the current one to the controller, if it is in
    /// the same altitude frame.
    fn queue_next(&mut self, nav: &mut WpNav) -> Result<(), WpNavError> {
        if self.next_queued {
            return Ok(());
        }

        let (this, next) = match (self.waypoints.get(self.current), self.waypoints.get(self.current + 1)) {
            (Some(t), Some(n)) => (*t, *n),
            _ => return Ok(()),
        };

        if next.terrain_alt != this.terrain_alt {
            debug!("Waypoint {} changes altitude frame, stopping before it", self.current + 1);
            return Ok(());
        }

        if next.spline {
            let (next_next, next_next_is_spline) = match self.waypoints.get(self.current + 2) {
                Some(nn) if nn.terrain_alt == next.terrain_alt => (nn.vector(), nn.spline),
                _ => (next.vector(), false),
            };

            nav.set_spline_destination_next_neu_cm(
                &next.vector(),
                next.terrain_alt,
                &next_next,
                next.terrain_alt,
                next_next_is_spline
            )?;
        }
        else {
            nav.set_wp_destination_next_neu_cm(&next.vector(), next.terrain_alt)?;
        }

        self.next_queued = true;

        Ok(())
    }
}
