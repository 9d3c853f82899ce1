//! Avoidance aware waypoint navigation
//!
//! [`WpNavOa`] wraps the plain controller and consults an avoidance service
//! on every update. While the service reports a detour the controller flies
//! to the detour's destination, while it is still searching the vehicle is
//! brought to a stop. Once avoidance is no longer needed the original
//! destination is restored.

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

// External
use log::{debug, info, warn};
use nalgebra::{Vector2, Vector3};
use serde::Serialize;

// Internal
use super::state::bearing_cd;
use super::{StatusReport, WaypointNav, WpNav, WpNavError};
use crate::kinematics::{ne, LENGTH_SQ_EPSILON};
use crate::location::Location;

// ---------------------------------------------------------------------------
// DATA STRUCTURES
// ---------------------------------------------------------------------------

/// The route the avoidance service is asked about.
///
/// All vectors are from the frame origin, with `z` above terrain if
/// `terrain_alt` is set.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct OaRequest {
    pub current_neu_cm: Vector3<f64>,
    pub origin_neu_cm: Vector3<f64>,
    pub destination_neu_cm: Vector3<f64>,
    pub next_destination_neu_cm: Option<Vector3<f64>>,
    pub terrain_alt: bool,
}

/// Waypoint controller with obstacle avoidance.
pub struct WpNavOa<'a, O: ObjectAvoidance> {
    nav: WpNav<'a>,
    oa: O,

    state: OaState,

    // Route as commanded, kept while a detour is flown
    origin_backup_neu_cm: Vector3<f64>,
    destination_backup_neu_cm: Vector3<f64>,
    next_destination_backup_neu_cm: Option<Vector3<f64>>,
    terrain_alt_backup: bool,

    /// Destination of the detour being flown. Only the horizontal position
    /// is used to detect a new detour.
    oa_destination_neu_cm: Vector3<f64>,
}

// ---------------------------------------------------------------------------
// ENUMERATIONS
// ---------------------------------------------------------------------------

/// Answer of the avoidance service.
#[derive(Debug, Copy, Clone, PartialEq)]
pub enum OaResponse {
    /// No obstacle on the route.
    NotRequired {
        /// False if the leg after the destination is blocked, in which case
        /// the vehicle must stop at the destination.
        path_to_next_clear: bool,
    },

    /// Still searching for a way round.
    Processing,

    /// No way round could be found.
    Error,

    /// Fly to `destination_neu_cm` instead. Its altitude is ignored, the
    /// altitude is interpolated along the commanded leg.
    Success {
        destination_neu_cm: Vector3<f64>,
        next_destination_neu_cm: Option<Vector3<f64>>,
    },
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
pub enum OaState {
    NotRequired,
    Processing,
    Error,
    Success,
}

// ---------------------------------------------------------------------------
// TRAITS
// ---------------------------------------------------------------------------

/// An obstacle avoidance path planner.
pub trait ObjectAvoidance {
    fn mission_avoidance(&mut self, request: &OaRequest) -> OaResponse;
}

// ---------------------------------------------------------------------------
// IMPLEMENTATIONS
// ---------------------------------------------------------------------------

impl<'a, O: ObjectAvoidance> WpNavOa<'a, O> {
    pub fn new(nav: WpNav<'a>, oa: O) -> Self {
        let origin = *nav.get_wp_origin_neu_cm();
        let destination = *nav.get_wp_destination_neu_cm();

        Self {
            state: OaState::NotRequired,
            origin_backup_neu_cm: origin,
            destination_backup_neu_cm: destination,
            next_destination_backup_neu_cm: nav.get_wp_next_destination_neu_cm().copied(),
            terrain_alt_backup: nav.origin_and_destination_are_terrain_alt(),
            oa_destination_neu_cm: destination,
            nav,
            oa,
        }
    }

    pub fn nav(&self) -> &WpNav<'a> {
        &self.nav
    }

    /// The wrapped controller, for setters not affected by avoidance.
    pub fn nav_mut(&mut self) -> &mut WpNav<'a> {
        &mut self.nav
    }

    pub fn oa(&self) -> &O {
        &self.oa
    }

    pub fn oa_mut(&mut self) -> &mut O {
        &mut self.oa
    }

    pub fn state(&self) -> OaState {
        self.state
    }

    /// The destination as commanded, which may not be the one being flown.
    pub fn get_wp_destination_neu_cm(&self) -> &Vector3<f64> {
        if self.state == OaState::NotRequired {
            self.nav.get_wp_destination_neu_cm()
        }
        else {
            &self.destination_backup_neu_cm
        }
    }

    fn backup_route(&mut self) {
        self.origin_backup_neu_cm = *self.nav.get_wp_origin_neu_cm();
        self.destination_backup_neu_cm = *self.nav.get_wp_destination_neu_cm();
        self.next_destination_backup_neu_cm = self.nav.get_wp_next_destination_neu_cm().copied();
        self.terrain_alt_backup = self.nav.origin_and_destination_are_terrain_alt();
    }

    /// Act on the avoidance service's answer.
    fn apply_response(&mut self, response: OaResponse) -> Result<(), WpNavError> {
        match response {
            OaResponse::NotRequired { path_to_next_clear } => {
                if self.state != OaState::NotRequired {
                    info!("Avoidance no longer required, restoring destination");

                    self.nav.set_wp_destination_neu_cm(
                        &self.destination_backup_neu_cm,
                        self.terrain_alt_backup
                    )?;

                    if let Some(next) = self.next_destination_backup_neu_cm {
                        if path_to_next_clear {
                            self.nav.set_wp_destination_next_neu_cm(&next, self.terrain_alt_backup)?;
                        }
                    }

                    self.state = OaState::NotRequired;
                }

                if !path_to_next_clear {
                    self.nav.force_stop_at_next_wp();
                }
            }
            OaResponse::Processing | OaResponse::Error => {
                let state = if response == OaResponse::Processing {
                    OaState::Processing
                }
                else {
                    OaState::Error
                };

                // Stop until there is a way round
                if self.state != state {
                    if state == OaState::Error {
                        warn!("Avoidance failed, stopping");
                    }
                    else {
                        debug!("Avoidance searching, stopping");
                    }

                    let stopping_point = self.nav.get_wp_stopping_point_neu_cm();
                    self.nav.set_wp_destination_neu_cm(&stopping_point, false)?;
                    self.state = state;
                }
            }
            OaResponse::Success {
                destination_neu_cm,
                next_destination_neu_cm,
            } => {
                let moved = (ne(&destination_neu_cm) - ne(&self.oa_destination_neu_cm)).norm_squared()
                    > LENGTH_SQ_EPSILON;

                if self.state != OaState::Success || moved {
                    let destination = self.with_interpolated_alt(&destination_neu_cm);
                    debug!("Avoidance detour to {:?}", destination);

                    self.nav.set_wp_destination_neu_cm(&destination, self.terrain_alt_backup)?;

                    if let Some(next) = next_destination_neu_cm {
                        let next = self.with_interpolated_alt(&next);
                        self.nav.set_wp_destination_next_neu_cm(&next, self.terrain_alt_backup)?;
                    }

                    self.oa_destination_neu_cm = destination_neu_cm;
                    self.state = OaState::Success;
                }
            }
        }

        Ok(())
    }

    /// Give a point the altitude of the commanded leg at the same proportion
    /// of the way along it.
    fn with_interpolated_alt(&self, point_neu_cm: &Vector3<f64>) -> Vector3<f64> {
        let proportion = line_path_proportion(
            &ne(&self.origin_backup_neu_cm),
            &ne(&self.destination_backup_neu_cm),
            &ne(point_neu_cm)
        );

        let alt = self.origin_backup_neu_cm.z
            + (self.destination_backup_neu_cm.z - self.origin_backup_neu_cm.z) * proportion;

        Vector3::new(point_neu_cm.x, point_neu_cm.y, alt)
    }
}

impl<'a, O: ObjectAvoidance> WaypointNav for WpNavOa<'a, O> {
    fn set_wp_destination_neu_cm(
        &mut self,
        destination_neu_cm: &Vector3<f64>,
        terrain_alt: bool
    ) -> Result<(), WpNavError> {
        self.nav.set_wp_destination_neu_cm(destination_neu_cm, terrain_alt)?;
        self.state = OaState::NotRequired;
        self.backup_route();

        Ok(())
    }

    fn get_oa_wp_destination(&self) -> Result<Location, WpNavError> {
        self.nav.get_wp_destination_loc()
    }

    fn get_wp_distance_to_destination_cm(&self) -> f64 {
        if self.state == OaState::NotRequired {
            return self.nav.get_wp_distance_to_destination_cm();
        }

        let pos_ne = ne(&self.nav.pos_control().pos_estimate_neu_cm());
        (ne(&self.destination_backup_neu_cm) - pos_ne).norm()
    }

    fn get_wp_bearing_to_destination_cd(&self) -> f64 {
        if self.state == OaState::NotRequired {
            return self.nav.get_wp_bearing_to_destination_cd();
        }

        let pos_ne = ne(&self.nav.pos_control().pos_estimate_neu_cm());
        bearing_cd(&pos_ne, &ne(&self.destination_backup_neu_cm))
    }

    /// Detour destinations never count as reached.
    fn reached_wp_destination(&self) -> bool {
        self.state == OaState::NotRequired && self.nav.reached_wp_destination()
    }

    fn update_wpnav(&mut self) -> Result<StatusReport, WpNavError> {
        if self.state == OaState::NotRequired {
            self.backup_route();
        }

        let request = OaRequest {
            current_neu_cm: self.nav.pos_control().pos_estimate_neu_cm(),
            origin_neu_cm: self.origin_backup_neu_cm,
            destination_neu_cm: self.destination_backup_neu_cm,
            next_destination_neu_cm: self.next_destination_backup_neu_cm,
            terrain_alt: self.terrain_alt_backup,
        };

        let response = self.oa.mission_avoidance(&request);
        self.apply_response(response)?;

        let mut report = self.nav.update_wpnav()?;
        if self.state != OaState::NotRequired {
            report.reached_destination = false;
        }

        Ok(report)
    }
}

// ---------------------------------------------------------------------------
// PRIVATE FUNCTIONS
// ---------------------------------------------------------------------------

/// Proportion of the way along the line from `start` to `end` of the point
/// nearest `point`, clamped to `[0, 1]`. One for a line of zero length.
fn line_path_proportion(start: &Vector2<f64>, end: &Vector2<f64>, point: &Vector2<f64>) -> f64 {
    let line = end - start;
    let len_sq = line.norm_squared();

    if len_sq <= LENGTH_SQ_EPSILON {
        return 1.0;
    }

    ((point - start).dot(&line) / len_sq).clamp(0.0, 1.0)
}

// ---------------------------------------------------------------------------
// TESTS
// ---------------------------------------------------------------------------

#[cfg(test)]
mod test {
    use super::*;
    use crate::location::{AltFrame, FlatEarthFrame};
    use crate::sim::{ManualClock, SimPosControl};
    use crate::wp_nav::{WpNavMode, WpNavParams};

    /// Returns a fixed response and records the requests made.
    struct ScriptedOa {
        response: OaResponse,
        requests: Vec<OaRequest>,
    }

    impl ObjectAvoidance for ScriptedOa {
        fn mission_avoidance(&mut self, request: &OaRequest) -> OaResponse {
            self.requests.push(*request);
            self.response
        }
    }

    const CLEAR: OaResponse = OaResponse::NotRequired { path_to_next_clear: true };

    fn params() -> WpNavParams {
        WpNavParams {
            speed_cms: 500.0,
            jerk_msss: 5.0,
            ..Default::default()
        }
    }

    fn frame() -> FlatEarthFrame {
        FlatEarthFrame::with_origin(Location::new(52.0, -1.0, 10000.0, AltFrame::Absolute), 0.0)
    }

    fn scripted() -> ScriptedOa {
        ScriptedOa {
            response: CLEAR,
            requests: Vec::new(),
        }
    }

    fn run<O: ObjectAvoidance>(nav: &mut WpNavOa<O>, clock: &ManualClock, ticks: usize) {
        for _ in 0..ticks {
            clock.advance_ms(10);
            nav.update_wpnav().unwrap();
        }
    }

    #[test]
    fn test_line_path_proportion() {
        let a = Vector2::new(0.0, 0.0);
        let b = Vector2::new(1000.0, 0.0);

        assert_eq!(line_path_proportion(&a, &b, &Vector2::new(500.0, 300.0)), 0.5);
        assert_eq!(line_path_proportion(&a, &b, &Vector2::new(2000.0, 0.0)), 1.0);
        assert_eq!(line_path_proportion(&a, &b, &Vector2::new(-10.0, 0.0)), 0.0);
        assert_eq!(line_path_proportion(&a, &a, &Vector2::new(5.0, 5.0)), 1.0);
    }

    #[test]
    fn test_passes_through_when_not_required() {
        let mut sim = SimPosControl::new(Vector3::zeros(), 0.01, 1.0);
        let clock = ManualClock::new(0);
        let frame = frame();
        let inner = WpNav::new(params(), &mut sim, None, &frame, &clock);
        let mut nav = WpNavOa::new(inner, scripted());

        let dest = Vector3::new(1500.0, 0.0, 200.0);
        nav.set_wp_destination_neu_cm(&dest, false).unwrap();

        let mut reached = false;
        for _ in 0..6000 {
            clock.advance_ms(10);
            nav.update_wpnav().unwrap();
            if nav.reached_wp_destination() {
                reached = true;
                break;
            }
        }

        assert!(reached);
        assert_eq!(nav.state(), OaState::NotRequired);
        assert_eq!(nav.oa().requests.last().map(|r| r.destination_neu_cm), Some(dest));
        assert_eq!(nav.nav().mode(), WpNavMode::Holding);
    }

    #[test]
    fn test_detour_and_restore() {
        let mut sim = SimPosControl::new(Vector3::zeros(), 0.01, 1.0);
        let clock = ManualClock::new(0);
        let frame = frame();
        let inner = WpNav::new(params(), &mut sim, None, &frame, &clock);
        let mut nav = WpNavOa::new(inner, scripted());

        let dest = Vector3::new(4000.0, 0.0, 1000.0);
        nav.set_wp_destination_neu_cm(&dest, false).unwrap();
        run(&mut nav, &clock, 100);

        nav.oa_mut().response = OaResponse::Success {
            destination_neu_cm: Vector3::new(2000.0, 800.0, -5000.0),
            next_destination_neu_cm: None,
        };
        run(&mut nav, &clock, 1);

        // Detour at half the leg's climb
        assert_eq!(nav.state(), OaState::Success);
        let detour = *nav.nav().get_wp_destination_neu_cm();
        assert_eq!(detour.x, 2000.0);
        assert_eq!(detour.y, 800.0);
        assert!((detour.z - 500.0).abs() < 1e-9);

        // The commanded destination is still reported
        assert_eq!(nav.get_wp_destination_neu_cm(), &dest);
        let pos = nav.nav().pos_control().pos_estimate_neu_cm();
        assert!((nav.get_wp_distance_to_destination_cm() - (ne(&dest) - ne(&pos)).norm()).abs() < 1e-9);
        assert!(nav.get_wp_bearing_to_destination_cd() < 100.0 || nav.get_wp_bearing_to_destination_cd() > 35900.0);

        // Reaching the detour is not reaching the destination
        run(&mut nav, &clock, 3000);
        assert!(nav.nav().reached_wp_destination());
        assert!(!nav.reached_wp_destination());

        // The same detour does not restart the leg
        let origin = *nav.nav().get_wp_origin_neu_cm();
        run(&mut nav, &clock, 10);
        assert_eq!(nav.nav().get_wp_origin_neu_cm(), &origin);

        nav.oa_mut().response = CLEAR;
        run(&mut nav, &clock, 1);
        assert_eq!(nav.state(), OaState::NotRequired);
        assert_eq!(nav.nav().get_wp_destination_neu_cm(), &dest);

        run(&mut nav, &clock, 6000);
        assert!(nav.reached_wp_destination());
    }

    #[test]
    fn test_processing_stops_vehicle() {
        let mut sim = SimPosControl::new(Vector3::zeros(), 0.01, 1.0);
        let clock = ManualClock::new(0);
        let frame = frame();
        let inner = WpNav::new(params(), &mut sim, None, &frame, &clock);
        let mut nav = WpNavOa::new(inner, scripted());

        let dest = Vector3::new(5000.0, 0.0, 0.0);
        nav.set_wp_destination_neu_cm(&dest, false).unwrap();
        run(&mut nav, &clock, 300);

        nav.oa_mut().response = OaResponse::Processing;
        let stop = nav.nav().get_wp_stopping_point_neu_cm();
        run(&mut nav, &clock, 1);

        assert_eq!(nav.state(), OaState::Processing);
        assert_eq!(nav.nav().get_wp_destination_neu_cm(), &stop);
        assert_eq!(nav.get_wp_destination_neu_cm(), &dest);

        // Requests still ask about the commanded route
        run(&mut nav, &clock, 500);
        assert_eq!(nav.oa().requests.last().map(|r| r.destination_neu_cm), Some(dest));
        assert!(!nav.reached_wp_destination());
        assert!(nav.nav().pos_control().vel_estimate_neu_cms().norm() < 10.0);

        nav.oa_mut().response = OaResponse::Error;
        run(&mut nav, &clock, 1);
        assert_eq!(nav.state(), OaState::Error);

        // A new destination cancels avoidance
        nav.oa_mut().response = CLEAR;
        nav.set_wp_destination_neu_cm(&Vector3::new(0.0, 0.0, 0.0), false).unwrap();
        assert_eq!(nav.state(), OaState::NotRequired);
    }

    #[test]
    fn test_blocked_next_leg_forces_stop() {
        let mut sim = SimPosControl::new(Vector3::zeros(), 0.01, 1.0);
        let clock = ManualClock::new(0);
        let frame = frame();
        let inner = WpNav::new(params(), &mut sim, None, &frame, &clock);
        let mut nav = WpNavOa::new(inner, scripted());

        nav.set_wp_destination_neu_cm(&Vector3::new(3000.0, 0.0, 0.0), false).unwrap();
        nav.nav_mut()
            .set_wp_destination_next_neu_cm(&Vector3::new(3000.0, 3000.0, 0.0), false)
            .unwrap();
        assert!(nav.nav().flags().fast_waypoint);

        nav.oa_mut().response = OaResponse::NotRequired { path_to_next_clear: false };
        run(&mut nav, &clock, 1);

        assert!(!nav.nav().flags().fast_waypoint);
        assert_eq!(
            nav.oa().requests.last().and_then(|r| r.next_destination_neu_cm),
            Some(Vector3::new(3000.0, 3000.0, 0.0))
        );
    }
}
