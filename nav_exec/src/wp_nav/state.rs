//! Implementations for the WpNav state structure

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

// External
use log::{debug, info, trace, warn};
use nalgebra::{Vector2, Vector3};
use serde::Serialize;

// Internal
use super::{
    WaypointNav, WpFlags, WpNavError, WpNavMode, WpNavParams,
    IS_ACTIVE_TIMEOUT_MS, WPNAV_ACCELERATION_CMSS, WPNAV_ACCEL_Z_CMSS,
    WPNAV_WP_SPEED_MIN_CMS, WPNAV_YAW_VEL_MIN_CMS};
use crate::interfaces::{Clock, PositionControl, TerrainDatabase};
use crate::kinematics::{ne, KinematicSample, TrackLimits, LENGTH_SQ_EPSILON};
use crate::leg_mgr::{Curve, LegMgr};
use crate::location::{AltFrame, LocalFrame, Location};
use crate::scurve::SCurve;
use crate::spline::SplineCurve;
use crate::terrain::{TerrainResolver, TerrainSource};
use crate::track_adv::{TrackAdvancer, TrackInput};
use util::{
    archive::{ArchiveError, Archived, Archiver},
    maths::wrap_360_cd,
    session::Session};

// ---------------------------------------------------------------------------
// CONSTANTS
// ---------------------------------------------------------------------------

/// Snap to jerk ratio used if the parameter is not positive.
const SNAP_JERK_RATIO_DEFAULT: f64 = 5.0;

// ---------------------------------------------------------------------------
// DATA STRUCTURES
// ---------------------------------------------------------------------------

/// Waypoint controller state.
///
/// The controller borrows the position controller, terrain database, local
/// frame and clock it works with, so they must outlive it. It is driven from
/// a single control task: the setters and [`WpNav::update_wpnav`] must not be
/// called concurrently.
pub struct WpNav<'a> {
    pub(crate) params: WpNavParams,

    pos_ctrl: &'a mut dyn PositionControl,
    terrain_db: Option<&'a dyn TerrainDatabase>,
    frame: &'a dyn LocalFrame,
    clock: &'a dyn Clock,

    mode: WpNavMode,
    flags: WpFlags,

    /// Follow changes of the default speed parameter. Only set if no
    /// explicit speed was given at initialisation.
    check_wp_speed_change: bool,
    last_wp_speed_cms: f64,
    last_wp_speed_up_cms: f64,
    last_wp_speed_down_cms: f64,

    /// Units: centimetres/second
    wp_desired_speed_ne_cms: f64,

    /// Units: centimetres/second
    speed_up_cms: f64,

    /// Positive down.
    ///
    /// Units: centimetres/second
    speed_down_cms: f64,

    /// Limits the legs are currently planned with.
    limits: TrackLimits,

    /// Start of the current leg, from the frame origin. `z` is above terrain
    /// if `terrain_alt` is set.
    origin_neu_cm: Vector3<f64>,
    destination_neu_cm: Vector3<f64>,
    next_destination_neu_cm: Option<Vector3<f64>>,

    /// True if the origin and destination altitudes are above terrain rather
    /// than above the frame origin.
    terrain_alt: bool,

    legs: LegMgr,
    track: TrackAdvancer,
    terrain: TerrainResolver,

    /// Track heading, valid once `flags.wp_yaw_set` is set.
    ///
    /// Units: centidegrees
    yaw_cd: f64,

    wp_last_update_ms: u64,

    /// The last target sent to the position controller.
    target: KinematicSample,

    pub(crate) report: StatusReport,
    arch_report: Archiver,
    arch_target: Archiver,
}

/// Status report for one waypoint controller update.
#[derive(Clone, Copy, Default, Serialize, Debug)]
pub struct StatusReport {
    /// The current leg has been flown to its end, or handed over to the next
    /// leg.
    pub leg_finished: bool,

    /// The destination was reached on this update.
    pub reached_destination: bool,

    /// The next destination became the current one on this update.
    pub leg_promoted: bool,

    /// Time scaler from the terrain margin check.
    pub terrain_scaler: f64,

    /// Units: centimetres/second
    pub offset_vel_cms: f64,
}

/// One archived target.
#[derive(Serialize)]
struct TargetRecord {
    time_ms: u64,
    pos_n_cm: f64,
    pos_e_cm: f64,
    pos_u_cm: f64,
    vel_n_cms: f64,
    vel_e_cms: f64,
    vel_u_cms: f64,
    accel_n_cmss: f64,
    accel_e_cmss: f64,
    accel_u_cmss: f64,
}

/// Where a new leg starts, worked out before any state is changed.
struct LegStart {
    /// The controller must be reinitialised from the stopping point.
    reinit: bool,

    stopping_point_neu_cm: Vector3<f64>,

    /// Origin in the new destination's altitude frame.
    origin_neu_cm: Vector3<f64>,

    /// The new leg's altitude frame matches the outgoing leg's.
    same_frame: bool,

    /// Terrain offset to reset the position controller to on a change of
    /// altitude frame.
    terrain_reset_cm: Option<f64>,
}

// ---------------------------------------------------------------------------
// IMPLEMENTATIONS
// ---------------------------------------------------------------------------

impl<'a> WpNav<'a> {
    /// Create a new controller.
    ///
    /// The controller is uninitialised until [`WpNav::wp_and_spline_init_cm`]
    /// or a destination setter is called.
    pub fn new(
        params: WpNavParams,
        pos_ctrl: &'a mut dyn PositionControl,
        terrain_db: Option<&'a dyn TerrainDatabase>,
        frame: &'a dyn LocalFrame,
        clock: &'a dyn Clock
    ) -> Self {
        let speed_ne = params.speed_cms.max(WPNAV_WP_SPEED_MIN_CMS);
        let speed_up = params.speed_up_cms;
        let speed_down = params.speed_down_cms.abs();
        let limits = track_limits(&params, speed_ne, speed_up, speed_down);

        Self {
            terrain: TerrainResolver::new(params.rangefinder_use, params.terrain_margin_m),
            track: TrackAdvancer::new(speed_ne),
            legs: LegMgr::new(Vector3::zeros(), &limits),
            check_wp_speed_change: true,
            last_wp_speed_cms: params.speed_cms,
            last_wp_speed_up_cms: params.speed_up_cms,
            last_wp_speed_down_cms: params.speed_down_cms,
            params,
            pos_ctrl,
            terrain_db,
            frame,
            clock,
            mode: WpNavMode::Uninitialised,
            flags: WpFlags::default(),
            wp_desired_speed_ne_cms: speed_ne,
            speed_up_cms: speed_up,
            speed_down_cms: speed_down,
            limits,
            origin_neu_cm: Vector3::zeros(),
            destination_neu_cm: Vector3::zeros(),
            next_destination_neu_cm: None,
            terrain_alt: false,
            yaw_cd: 0.0,
            wp_last_update_ms: 0,
            target: KinematicSample::default(),
            report: StatusReport::default(),
            arch_report: Archiver::default(),
            arch_target: Archiver::default(),
        }
    }

    /// Create the CSV archives of the status report and target.
    pub fn init_archives(&mut self, session: &Session) -> Result<(), ArchiveError> {
        self.arch_report = Archiver::from_path(session, "wp_nav/status_report.csv")?;
        self.arch_target = Archiver::from_path(session, "wp_nav/target.csv")?;

        Ok(())
    }

    /// Initialise the controller, holding at `stopping_point`.
    ///
    /// A `speed_cms` which is not positive selects the default speed
    /// parameter, which is then followed if it changes. If no stopping point
    /// is given the position controller's stopping point is used.
    pub fn wp_and_spline_init_cm(&mut self, speed_cms: f64, stopping_point: Option<Vector3<f64>>) {
        self.sanitise_params();

        self.pos_ctrl.init_u_controller_stopping_point();
        self.pos_ctrl.init_ne_controller_stopping_point();

        self.check_wp_speed_change = speed_cms <= 0.0;
        self.wp_desired_speed_ne_cms = if speed_cms > 0.0 {
            speed_cms
        }
        else {
            self.params.speed_cms
        }
        .max(WPNAV_WP_SPEED_MIN_CMS);

        self.speed_up_cms = self.params.speed_up_cms;
        self.speed_down_cms = self.params.speed_down_cms.abs();
        self.last_wp_speed_cms = self.params.speed_cms;
        self.last_wp_speed_up_cms = self.params.speed_up_cms;
        self.last_wp_speed_down_cms = self.params.speed_down_cms;

        self.terrain.set_margin_m(self.params.terrain_margin_m);
        self.terrain.set_rangefinder_use(self.params.rangefinder_use);

        self.limits = self.desired_limits();
        self.pos_ctrl.set_max_speed_accel_ne_cm(self.limits.speed_ne_cms, self.limits.accel_ne_cmss);
        self.pos_ctrl.set_max_speed_accel_u_cm(
            self.limits.speed_down_cms,
            self.limits.speed_up_cms,
            self.limits.accel_u_cmss
        );

        let stopping_point = stopping_point.unwrap_or_else(|| self.get_wp_stopping_point_neu_cm());

        self.origin_neu_cm = stopping_point;
        self.destination_neu_cm = stopping_point;
        self.next_destination_neu_cm = None;
        self.terrain_alt = false;

        self.legs = LegMgr::new(stopping_point, &self.limits);
        self.track.reset(self.wp_desired_speed_ne_cms);
        self.target = KinematicSample::at_rest(stopping_point);

        self.flags = WpFlags {
            reached_destination: true,
            fast_waypoint: false,
            wp_yaw_set: false,
        };
        self.mode = WpNavMode::Active;
        self.wp_last_update_ms = self.clock.now_ms();

        debug!(
            "Waypoint navigation initialised at {:?}, speed {:.0} cm/s",
            stopping_point, self.wp_desired_speed_ne_cms
        );
    }

    // ---- DESTINATIONS ----

    /// Set the destination as a vector from the frame origin.
    ///
    /// The previous destination becomes the origin, unless the previous leg
    /// was interrupted before reaching it, in which case the controller is
    /// reinitialised at its stopping point first. On error nothing changes.
    pub fn set_wp_destination_neu_cm(
        &mut self,
        destination_neu_cm: &Vector3<f64>,
        terrain_alt: bool
    ) -> Result<(), WpNavError> {
        let start = self.leg_start(terrain_alt)?;

        let this_is_spline = !start.reinit && self.legs.this().curve.is_spline();

        // Leave a spline at the speed it is currently flying
        let origin_speed_cms = if start.same_frame && this_is_spline {
            self.target_speed_cms()
        }
        else {
            0.0
        };

        // Straight legs which are already blending continue as they are
        let promote_next = start.same_frame
            && !start.reinit
            && !this_is_spline
            && self.flags.fast_waypoint
            && self.next_destination_neu_cm == Some(*destination_neu_cm)
            && self.legs.next().map_or(false, |n| n.curve.is_straight() && !n.finished());

        self.begin_leg(&start);
        self.origin_neu_cm = start.origin_neu_cm;
        self.destination_neu_cm = *destination_neu_cm;
        self.terrain_alt = terrain_alt;

        if promote_next {
            self.legs.promote();
        }
        else {
            let curve = Curve::Straight(SCurve::new_leg(
                self.origin_neu_cm,
                self.destination_neu_cm,
                &self.limits,
                origin_speed_cms,
                0.0
            ));

            if start.same_frame {
                self.legs.build_this(curve);
            }
            else {
                self.legs.reset_this(curve);
            }
        }

        self.legs.clear_next();
        self.next_destination_neu_cm = None;
        self.flags.fast_waypoint = false;
        self.flags.reached_destination = false;
        self.mode = WpNavMode::Active;

        debug!(
            "Destination set to {:?}{}",
            self.destination_neu_cm,
            if terrain_alt { " above terrain" } else { "" }
        );

        Ok(())
    }

    /// Set the destination after the current one, to be flown through
    /// without stopping.
    ///
    /// It must be in the same altitude frame as the current destination.
    pub fn set_wp_destination_next_neu_cm(
        &mut self,
        destination_neu_cm: &Vector3<f64>,
        terrain_alt: bool
    ) -> Result<(), WpNavError> {
        if self.mode == WpNavMode::Uninitialised {
            return Err(WpNavError::NotInitialised);
        }

        if terrain_alt != self.terrain_alt {
            return Err(WpNavError::AltFrameMismatch);
        }

        let curve = Curve::Straight(SCurve::new_leg(
            self.destination_neu_cm,
            *destination_neu_cm,
            &self.limits,
            0.0,
            0.0
        ));
        self.legs.build_next(curve);

        self.next_destination_neu_cm = Some(*destination_neu_cm);
        self.flags.fast_waypoint = true;

        trace!("Next destination set to {:?}", destination_neu_cm);

        Ok(())
    }

    /// Set the destination as a north, east, down vector from the frame
    /// origin. The altitude is above the origin.
    pub fn set_wp_destination_ned_cm(&mut self, destination_ned_cm: &Vector3<f64>) -> Result<(), WpNavError> {
        self.set_wp_destination_neu_cm(&ned_to_neu(destination_ned_cm), false)
    }

    pub fn set_wp_destination_next_ned_cm(&mut self, destination_ned_cm: &Vector3<f64>) -> Result<(), WpNavError> {
        self.set_wp_destination_next_neu_cm(&ned_to_neu(destination_ned_cm), false)
    }

    /// Set the destination as a location.
    pub fn set_wp_destination_loc(&mut self, destination: &Location) -> Result<(), WpNavError> {
        let (destination_neu_cm, terrain_alt) = self.loc_to_neu(destination)?;
        self.set_wp_destination_neu_cm(&destination_neu_cm, terrain_alt)
    }

    pub fn set_wp_destination_next_loc(&mut self, destination: &Location) -> Result<(), WpNavError> {
        let (destination_neu_cm, terrain_alt) = self.loc_to_neu(destination)?;
        self.set_wp_destination_next_neu_cm(&destination_neu_cm, terrain_alt)
    }

    /// Set a curved leg to `destination_neu_cm`.
    ///
    /// The leg leaves its destination heading towards `next_destination_neu_cm`,
    /// or, if the next leg is also curved, parallel to the line from this
    /// leg's origin to the next destination. Both must share an altitude
    /// frame.
    pub fn set_spline_destination_neu_cm(
        &mut self,
        destination_neu_cm: &Vector3<f64>,
        terrain_alt: bool,
        next_destination_neu_cm: &Vector3<f64>,
        next_terrain_alt: bool,
        next_is_spline: bool
    ) -> Result<(), WpNavError> {
        if next_terrain_alt != terrain_alt {
            return Err(WpNavError::AltFrameMismatch);
        }

        let start = self.leg_start(terrain_alt)?;

        // Join the previous leg in its direction of travel
        let mut origin_dir = Vector3::zeros();
        let mut origin_speed_cms = 0.0;
        if start.same_frame && !start.reinit && self.flags.fast_waypoint {
            origin_dir = match &self.legs.this().curve {
                Curve::Spline(c) => *c.dest_dir(),
                Curve::Straight(_) => self.destination_neu_cm - self.origin_neu_cm,
            };
            origin_speed_cms = self.target_speed_cms();
        }

        let dest_dir = if next_is_spline {
            next_destination_neu_cm - start.origin_neu_cm
        }
        else {
            next_destination_neu_cm - destination_neu_cm
        };

        self.begin_leg(&start);
        self.origin_neu_cm = start.origin_neu_cm;
        self.destination_neu_cm = *destination_neu_cm;
        self.terrain_alt = terrain_alt;

        let curve = Curve::Spline(build_spline(
            self.origin_neu_cm,
            self.destination_neu_cm,
            origin_dir,
            dest_dir,
            origin_speed_cms,
            &self.limits
        ));

        if start.same_frame {
            self.legs.build_this(curve);
        }
        else {
            self.legs.reset_this(curve);
        }

        self.legs.clear_next();
        self.next_destination_neu_cm = None;
        self.flags.fast_waypoint = dest_dir.norm_squared() > LENGTH_SQ_EPSILON;
        self.flags.reached_destination = false;
        self.mode = WpNavMode::Active;

        debug!("Spline destination set to {:?}", self.destination_neu_cm);

        Ok(())
    }

    /// Set a curved leg after the current destination.
    ///
    /// `next_next_destination_neu_cm` is the destination of the leg after
    /// that, used for the direction in which this leg finishes. All three
    /// destinations must share an altitude frame.
    pub fn set_spline_destination_next_neu_cm(
        &mut self,
        next_destination_neu_cm: &Vector3<f64>,
        next_terrain_alt: bool,
        next_next_destination_neu_cm: &Vector3<f64>,
        next_next_terrain_alt: bool,
        next_next_is_spline: bool
    ) -> Result<(), WpNavError> {
        if self.mode == WpNavMode::Uninitialised {
            return Err(WpNavError::NotInitialised);
        }

        if next_terrain_alt != self.terrain_alt || next_next_terrain_alt != next_terrain_alt {
            return Err(WpNavError::AltFrameMismatch);
        }

        let origin_dir = match &self.legs.this().curve {
            Curve::Spline(c) => *c.dest_dir(),
            Curve::Straight(_) => self.destination_neu_cm - self.origin_neu_cm,
        };

        let dest_dir = if next_next_is_spline {
            next_next_destination_neu_cm - self.destination_neu_cm
        }
        else {
            next_next_destination_neu_cm - next_destination_neu_cm
        };

        let curve = Curve::Spline(SplineCurve::new(
            self.destination_neu_cm,
            *next_destination_neu_cm,
            origin_dir,
            dest_dir,
            0.0,
            0.0,
            &self.limits
        ));
        self.legs.build_next(curve);

        self.next_destination_neu_cm = Some(*next_destination_neu_cm);
        self.flags.fast_waypoint = true;

        trace!("Next spline destination set to {:?}", next_destination_neu_cm);

        Ok(())
    }

    pub fn set_spline_destination_loc(
        &mut self,
        destination: &Location,
        next_destination: &Location,
        next_is_spline: bool
    ) -> Result<(), WpNavError> {
        let (dest, terrain_alt) = self.loc_to_neu(destination)?;
        let (next, next_terrain_alt) = self.loc_to_neu(next_destination)?;

        self.set_spline_destination_neu_cm(&dest, terrain_alt, &next, next_terrain_alt, next_is_spline)
    }

    pub fn set_spline_destination_next_loc(
        &mut self,
        next_destination: &Location,
        next_next_destination: &Location,
        next_next_is_spline: bool
    ) -> Result<(), WpNavError> {
        let (next, next_terrain_alt) = self.loc_to_neu(next_destination)?;
        let (next_next, next_next_terrain_alt) = self.loc_to_neu(next_next_destination)?;

        self.set_spline_destination_next_neu_cm(
            &next,
            next_terrain_alt,
            &next_next,
            next_next_terrain_alt,
            next_next_is_spline
        )
    }

    /// The destination as a location, with its altitude above the origin or
    /// above terrain.
    pub fn get_wp_destination_loc(&self) -> Result<Location, WpNavError> {
        self.neu_to_loc(&self.destination_neu_cm, self.terrain_alt)
    }

    /// Destination actually being flown to. Always the destination for the
    /// plain controller.
    pub fn get_oa_wp_destination(&self) -> Result<Location, WpNavError> {
        self.get_wp_destination_loc()
    }

    // ---- UPDATE ----

    /// Run one control tick.
    ///
    /// Moves the target along the track and runs the horizontal position
    /// controller. The tick counts towards [`WpNav::is_active`] even if the
    /// target could not be advanced because terrain data was missing.
    pub fn update_wpnav(&mut self) -> Result<StatusReport, WpNavError> {
        if self.mode == WpNavMode::Uninitialised {
            return Err(WpNavError::NotInitialised);
        }

        self.check_param_changes();

        let result = self.advance_wp_target_along_track();

        self.pos_ctrl.update_ne_controller();
        self.wp_last_update_ms = self.clock.now_ms();

        result?;

        Ok(self.report)
    }

    /// True if the controller has been updated recently.
    pub fn is_active(&self) -> bool {
        self.mode != WpNavMode::Uninitialised
            && self.clock.now_ms().saturating_sub(self.wp_last_update_ms) < IS_ACTIVE_TIMEOUT_MS
    }

    pub fn reached_wp_destination(&self) -> bool {
        self.flags.reached_destination
    }

    /// True if the vehicle is horizontally closer to the destination than
    /// the waypoint radius.
    pub fn reached_wp_destination_ne(&self) -> bool {
        self.get_wp_distance_to_destination_cm() < self.params.radius_cm
    }

    // ---- PAUSE, STOP AND SHIFT ----

    /// Bring the target smoothly to a halt on the track.
    pub fn set_pause(&mut self) {
        debug!("Waypoint navigation paused");
        self.track.set_paused(true);
    }

    /// Continue along the track from where the target stopped.
    pub fn set_resume(&mut self) {
        debug!("Waypoint navigation resumed");
        self.track.set_paused(false);
    }

    pub fn paused(&self) -> bool {
        self.track.paused()
    }

    /// Stop at the current destination instead of flying through it.
    ///
    /// Returns true if this changed the path, false if the vehicle was
    /// already going to stop or the corner into the next leg has already
    /// started.
    pub fn force_stop_at_next_wp(&mut self) -> bool {
        if !self.flags.fast_waypoint {
            return false;
        }

        if self.legs.next().is_some() && !self.legs.force_stop_at_next_wp() {
            return false;
        }

        self.flags.fast_waypoint = false;
        debug!("Forced stop at {:?}", self.destination_neu_cm);

        true
    }

    /// Move the start of the current leg horizontally to the vehicle's
    /// position, keeping the destination, altitude frame and leg type.
    ///
    /// Used when horizontal control is enabled again after having been
    /// disabled.
    pub fn shift_wp_origin_to_current_pos_ne(&mut self) {
        if self.mode == WpNavMode::Uninitialised {
            return;
        }

        self.pos_ctrl.init_ne_controller();
        let pos_ne = ne(&self.pos_ctrl.pos_estimate_neu_cm());
        self.shift_origin_ne(&pos_ne);
    }

    /// Move the start of the current leg horizontally to the stopping point,
    /// keeping the destination, altitude frame and leg type.
    pub fn shift_wp_origin_to_stopping_point_ne(&mut self) {
        if self.mode == WpNavMode::Uninitialised {
            return;
        }

        self.pos_ctrl.init_ne_controller_stopping_point();
        let stop_ne = self.pos_ctrl.stopping_point_ne_cm();
        self.shift_origin_ne(&stop_ne);
    }

    // ---- SPEEDS AND LIMITS ----

    /// Change the horizontal speed in flight.
    ///
    /// Speeds below [`WPNAV_WP_SPEED_MIN_CMS`] are ignored.
    pub fn set_speed_ne_cms(&mut self, speed_cms: f64) {
        if speed_cms < WPNAV_WP_SPEED_MIN_CMS || self.wp_desired_speed_ne_cms <= 0.0 {
            debug!("Ignoring horizontal speed of {:.1} cm/s", speed_cms);
            return;
        }

        self.track.rescale_offset_vel(self.wp_desired_speed_ne_cms, speed_cms);
        self.wp_desired_speed_ne_cms = speed_cms;
        self.update_track_with_speed_accel_limits();
    }

    pub fn set_speed_up_cms(&mut self, speed_up_cms: f64) {
        self.speed_up_cms = speed_up_cms;
        self.update_track_with_speed_accel_limits();
    }

    /// Descent speed, the sign is ignored.
    pub fn set_speed_down_cms(&mut self, speed_down_cms: f64) {
        self.speed_down_cms = speed_down_cms.abs();
        self.update_track_with_speed_accel_limits();
    }

    /// Replan the legs if the limits have changed.
    pub fn update_track_with_speed_accel_limits(&mut self) {
        let limits = self.desired_limits();

        if limits == self.limits {
            return;
        }

        trace!("Replanning for new limits {:?}", limits);

        self.limits = limits;
        self.pos_ctrl.set_max_speed_accel_ne_cm(limits.speed_ne_cms, limits.accel_ne_cmss);
        self.pos_ctrl.set_max_speed_accel_u_cm(
            limits.speed_down_cms,
            limits.speed_up_cms,
            limits.accel_u_cmss
        );
        self.legs.replan(&limits);
    }

    /// Current target horizontal speed.
    ///
    /// Units: centimetres/second
    pub fn get_speed_ne_cms(&self) -> f64 {
        self.wp_desired_speed_ne_cms
    }

    pub fn get_default_speed_ne_cms(&self) -> f64 {
        self.params.speed_cms
    }

    pub fn get_default_speed_up_cms(&self) -> f64 {
        self.params.speed_up_cms
    }

    /// Always positive.
    pub fn get_default_speed_down_cms(&self) -> f64 {
        self.params.speed_down_cms.abs()
    }

    pub fn get_accel_ne_cmss(&self) -> f64 {
        accel_ne_cmss(&self.params)
    }

    pub fn get_corner_accel_cmss(&self) -> f64 {
        corner_accel_cmss(&self.params)
    }

    pub fn get_accel_u_cmss(&self) -> f64 {
        accel_u_cmss(&self.params)
    }

    pub fn get_wp_radius_cm(&self) -> f64 {
        self.params.radius_cm
    }

    // ---- TERRAIN ----

    /// Provide the latest rangefinder data.
    ///
    /// `offset_cm` is the terrain's height above the frame origin, as
    /// measured by the rangefinder.
    pub fn set_rangefinder_terrain_offset_cm(&mut self, available: bool, healthy: bool, offset_cm: f64) {
        self.terrain.set_rangefinder_terrain_offset_cm(available, healthy, offset_cm);
    }

    /// Terrain height above the origin below the vehicle.
    pub fn get_terrain_offset_cm(&self) -> Result<f64, WpNavError> {
        let pos_ne = ne(&self.pos_ctrl.pos_estimate_neu_cm());
        Ok(self.terrain.resolve(&pos_ne, true, self.terrain_db)?)
    }

    /// Units: metres
    pub fn get_terrain_margin_m(&self) -> f64 {
        self.terrain.margin_m()
    }

    pub fn get_terrain_source(&self) -> TerrainSource {
        self.terrain.terrain_source(self.terrain_db)
    }

    pub fn rangefinder_used(&self) -> bool {
        self.terrain.rangefinder_used()
    }

    pub fn rangefinder_used_and_healthy(&self) -> bool {
        self.terrain.rangefinder_used_and_healthy()
    }

    // ---- STATE ----

    pub fn params(&self) -> &WpNavParams {
        &self.params
    }

    /// Parameters for modification in flight, changes take effect on the
    /// next update.
    pub fn params_mut(&mut self) -> &mut WpNavParams {
        &mut self.params
    }

    pub fn mode(&self) -> WpNavMode {
        self.mode
    }

    pub fn flags(&self) -> WpFlags {
        self.flags
    }

    pub fn legs(&self) -> &LegMgr {
        &self.legs
    }

    /// The last target sent to the position controller.
    pub fn target(&self) -> &KinematicSample {
        &self.target
    }

    pub fn pos_control(&self) -> &dyn PositionControl {
        &*self.pos_ctrl
    }

    pub fn get_wp_origin_neu_cm(&self) -> &Vector3<f64> {
        &self.origin_neu_cm
    }

    pub fn get_wp_destination_neu_cm(&self) -> &Vector3<f64> {
        &self.destination_neu_cm
    }

    pub fn get_wp_next_destination_neu_cm(&self) -> Option<&Vector3<f64>> {
        self.next_destination_neu_cm.as_ref()
    }

    /// True if the origin and destination altitudes are above terrain.
    pub fn origin_and_destination_are_terrain_alt(&self) -> bool {
        self.terrain_alt
    }

    /// Units: centimetres
    pub fn get_wp_distance_to_destination_cm(&self) -> f64 {
        (ne(&self.pos_ctrl.pos_estimate_neu_cm()) - ne(&self.destination_neu_cm)).norm()
    }

    /// Units: centidegrees
    pub fn get_wp_bearing_to_destination_cd(&self) -> f64 {
        bearing_cd(&ne(&self.pos_ctrl.pos_estimate_neu_cm()), &ne(&self.destination_neu_cm))
    }

    pub fn get_wp_stopping_point_ne_cm(&self) -> Vector2<f64> {
        self.pos_ctrl.stopping_point_ne_cm()
    }

    /// Stopping point, altitude above the origin.
    pub fn get_wp_stopping_point_neu_cm(&self) -> Vector3<f64> {
        let stop_ne = self.pos_ctrl.stopping_point_ne_cm();
        Vector3::new(stop_ne.x, stop_ne.y, self.pos_ctrl.stopping_point_u_cm())
    }

    /// Heading of the track, once the target has moved fast enough for one
    /// to be set.
    ///
    /// Units: centidegrees
    pub fn get_track_yaw_cd(&self) -> Option<f64> {
        if self.flags.wp_yaw_set {
            Some(self.yaw_cd)
        }
        else {
            None
        }
    }

    pub fn get_roll_rad(&self) -> f64 {
        self.pos_ctrl.roll_rad()
    }

    pub fn get_pitch_rad(&self) -> f64 {
        self.pos_ctrl.pitch_rad()
    }

    pub fn get_yaw_rad(&self) -> f64 {
        self.pos_ctrl.yaw_rad()
    }

    /// Units: centidegrees
    pub fn get_roll_cd(&self) -> f64 {
        self.pos_ctrl.roll_rad().to_degrees() * 100.0
    }

    /// Units: centidegrees
    pub fn get_pitch_cd(&self) -> f64 {
        self.pos_ctrl.pitch_rad().to_degrees() * 100.0
    }

    /// Units: centidegrees
    pub fn get_yaw_cd(&self) -> f64 {
        self.pos_ctrl.yaw_rad().to_degrees() * 100.0
    }

    pub fn get_thrust_vector(&self) -> Vector3<f64> {
        self.pos_ctrl.thrust_vector()
    }

    /// Horizontal distance of the vehicle from the track.
    ///
    /// Units: centimetres
    pub fn crosstrack_error_cm(&self) -> f64 {
        self.pos_ctrl.crosstrack_error_cm()
    }

    // ---- PRIVATE ----

    fn sanitise_params(&mut self) {
        if self.params.accel_cmss <= 0.0 {
            warn!(
                "Waypoint acceleration of {} cm/s^2 is not positive, using {} cm/s^2",
                self.params.accel_cmss, WPNAV_ACCELERATION_CMSS
            );
            self.params.accel_cmss = WPNAV_ACCELERATION_CMSS;
        }

        self.params.radius_cm = self.params.radius_cm.max(0.0);
        self.params.speed_cms = self.params.speed_cms.max(WPNAV_WP_SPEED_MIN_CMS);
    }

    fn desired_limits(&self) -> TrackLimits {
        track_limits(
            &self.params,
            self.wp_desired_speed_ne_cms,
            self.speed_up_cms,
            self.speed_down_cms
        )
    }

    /// Pick up parameter changes made since the last update.
    fn check_param_changes(&mut self) {
        if self.check_wp_speed_change && self.params.speed_cms != self.last_wp_speed_cms {
            self.set_speed_ne_cms(self.params.speed_cms);
            self.last_wp_speed_cms = self.params.speed_cms;
        }

        if self.params.speed_up_cms != self.last_wp_speed_up_cms {
            self.set_speed_up_cms(self.params.speed_up_cms);
            self.last_wp_speed_up_cms = self.params.speed_up_cms;
        }

        if self.params.speed_down_cms != self.last_wp_speed_down_cms {
            self.set_speed_down_cms(self.params.speed_down_cms);
            self.last_wp_speed_down_cms = self.params.speed_down_cms;
        }

        self.terrain.set_margin_m(self.params.terrain_margin_m);
        self.terrain.set_rangefinder_use(self.params.rangefinder_use);

        // Acceleration, jerk and snap
        self.update_track_with_speed_accel_limits();
    }

    fn advance_wp_target_along_track(&mut self) -> Result<(), WpNavError> {
        let dt = self.pos_ctrl.dt_s();
        let pos_neu_cm = self.pos_ctrl.pos_estimate_neu_cm();

        let terr_offset_cm = self.terrain.resolve(&ne(&pos_neu_cm), self.terrain_alt, self.terrain_db)?;

        // Slow down while the vehicle is outside the terrain margin
        let pos_error = self.pos_ctrl.pos_error_neu_cm();
        let terrain_error_cm = -pos_error.z - terr_offset_cm + self.pos_ctrl.pos_terrain_u_cm();
        let terrain_scaler = self.terrain.margin_scaler(terrain_error_cm);

        self.pos_ctrl.set_pos_terrain_target_u_cm(terr_offset_cm);

        let mut vel_desired = self.pos_ctrl.vel_desired_neu_cms();
        vel_desired.z -= self.pos_ctrl.vel_terrain_u_cms();

        let input = TrackInput {
            dt_s: dt,
            desired_speed_cms: self.wp_desired_speed_ne_cms,
            accel_cmss: self.limits.accel_ne_cmss,
            jerk_cmsss: self.limits.jerk_cmsss,
            jerk_msss: self.limits.jerk_cmsss * 0.01,
            terrain_scaler,
            pos_ne_p: self.pos_ctrl.pos_ne_p(),
            pos_error_neu_cm: pos_error,
            vel_estimate_neu_cms: self.pos_ctrl.vel_estimate_neu_cms(),
            vel_desired_neu_cms: vel_desired,
            terrain: KinematicSample {
                pos_neu_cm: Vector3::new(0.0, 0.0, self.pos_ctrl.pos_terrain_u_cm()),
                vel_neu_cms: Vector3::new(0.0, 0.0, self.pos_ctrl.vel_terrain_u_cms()),
                accel_neu_cmss: Vector3::new(0.0, 0.0, self.pos_ctrl.accel_terrain_u_cmss()),
            },
            wp_radius_cm: self.params.radius_cm,
            fast_waypoint: self.flags.fast_waypoint,
        };

        let step = self.track.advance(&input, &mut self.legs);

        self.pos_ctrl.set_pos_vel_accel_neu_cm(
            &step.target.pos_neu_cm,
            &step.target.vel_neu_cms,
            &step.target.accel_neu_cmss
        );
        self.target = step.target;

        self.report = StatusReport {
            leg_finished: step.finished,
            terrain_scaler,
            offset_vel_cms: self.track.offset_vel_cms(),
            ..Default::default()
        };

        // Fast waypoints are reached as soon as the target gets there, stop
        // waypoints also need the vehicle to be within the radius
        if !self.flags.reached_destination && step.finished {
            let reached = self.flags.fast_waypoint
                || (ne(&pos_neu_cm) - ne(&self.destination_neu_cm)).norm() < self.params.radius_cm;

            if reached {
                self.flags.reached_destination = true;
                self.report.reached_destination = true;
                self.on_destination_reached();
            }
        }

        // Take the yaw target from the track
        let vel_ne = ne(&step.target.vel_neu_cms);
        if vel_ne.norm() > WPNAV_YAW_VEL_MIN_CMS {
            self.yaw_cd = wrap_360_cd(vel_ne.y.atan2(vel_ne.x).to_degrees() * 100.0);
            self.flags.wp_yaw_set = true;
        }

        Ok(())
    }

    /// Move on to the next destination if there is one, otherwise hold.
    fn on_destination_reached(&mut self) {
        let next = match self.next_destination_neu_cm.take() {
            Some(n) if self.legs.promote() => n,
            _ => {
                info!("Reached final destination {:?}", self.destination_neu_cm);
                self.mode = WpNavMode::Holding;
                return;
            }
        };

        info!("Reached destination {:?}, continuing to {:?}", self.destination_neu_cm, next);

        self.origin_neu_cm = self.destination_neu_cm;
        self.destination_neu_cm = next;
        self.flags.reached_destination = false;
        self.flags.fast_waypoint = false;
        self.report.leg_promoted = true;
    }

    /// Work out where a new leg starts without changing any state.
    fn leg_start(&self, terrain_alt: bool) -> Result<LegStart, WpNavError> {
        // An interrupted leg restarts from the stopping point
        let reinit = !self.is_active() || !self.flags.reached_destination;
        let stopping_point_neu_cm = self.get_wp_stopping_point_neu_cm();

        let (mut origin_neu_cm, prev_terrain_alt) = if reinit {
            (stopping_point_neu_cm, false)
        }
        else {
            (self.destination_neu_cm, self.terrain_alt)
        };

        // Convert the origin into the new altitude frame
        let mut terrain_reset_cm = None;
        if terrain_alt != prev_terrain_alt {
            let offset_cm = self.get_terrain_offset_cm()?;

            if terrain_alt {
                origin_neu_cm.z -= offset_cm;
                terrain_reset_cm = Some(offset_cm);
            }
            else {
                origin_neu_cm.z += offset_cm;
                terrain_reset_cm = Some(0.0);
            }
        }

        Ok(LegStart {
            reinit,
            stopping_point_neu_cm,
            origin_neu_cm,
            same_frame: terrain_alt == prev_terrain_alt,
            terrain_reset_cm,
        })
    }

    fn begin_leg(&mut self, start: &LegStart) {
        if start.reinit {
            self.wp_and_spline_init_cm(self.wp_desired_speed_ne_cms, Some(start.stopping_point_neu_cm));
        }

        if let Some(terrain_cm) = start.terrain_reset_cm {
            self.pos_ctrl.init_pos_terrain_u_cm(terrain_cm);
        }
    }

    fn shift_origin_ne(&mut self, origin_ne_cm: &Vector2<f64>) {
        self.origin_neu_cm.x = origin_ne_cm.x;
        self.origin_neu_cm.y = origin_ne_cm.y;

        let curve = match &self.legs.this().curve {
            Curve::Straight(_) => Curve::Straight(SCurve::new_leg(
                self.origin_neu_cm,
                self.destination_neu_cm,
                &self.limits,
                0.0,
                0.0
            )),
            Curve::Spline(c) => Curve::Spline(SplineCurve::new(
                self.origin_neu_cm,
                self.destination_neu_cm,
                Vector3::zeros(),
                *c.dest_dir(),
                0.0,
                0.0,
                &self.limits
            )),
        };

        let next = self.legs.next().map(|n| n.curve);
        self.legs.reset_this(curve);
        if let Some(next) = next {
            self.legs.build_next(next);
        }

        debug!("Origin shifted to {:?}", self.origin_neu_cm);
    }

    /// Speed of the current target, without the terrain rate.
    fn target_speed_cms(&self) -> f64 {
        let mut vel = self.pos_ctrl.vel_desired_neu_cms();
        vel.z -= self.pos_ctrl.vel_terrain_u_cms();
        vel.norm()
    }

    fn loc_to_neu(&self, loc: &Location) -> Result<(Vector3<f64>, bool), WpNavError> {
        self.frame.vector_neu_from_origin_cm(loc).ok_or(WpNavError::Conversion)
    }

    pub(crate) fn neu_to_loc(&self, vec: &Vector3<f64>, terrain_alt: bool) -> Result<Location, WpNavError> {
        let frame = if terrain_alt {
            AltFrame::AboveTerrain
        }
        else {
            AltFrame::AboveOrigin
        };

        self.frame
            .location_from_vector_neu_cm(vec, frame)
            .ok_or(WpNavError::Conversion)
    }
}

impl<'a> WaypointNav for WpNav<'a> {
    fn set_wp_destination_neu_cm(
        &mut self,
        destination_neu_cm: &Vector3<f64>,
        terrain_alt: bool
    ) -> Result<(), WpNavError> {
        WpNav::set_wp_destination_neu_cm(self, destination_neu_cm, terrain_alt)
    }

    fn get_oa_wp_destination(&self) -> Result<Location, WpNavError> {
        WpNav::get_oa_wp_destination(self)
    }

    fn get_wp_distance_to_destination_cm(&self) -> f64 {
        WpNav::get_wp_distance_to_destination_cm(self)
    }

    fn get_wp_bearing_to_destination_cd(&self) -> f64 {
        WpNav::get_wp_bearing_to_destination_cd(self)
    }

    fn reached_wp_destination(&self) -> bool {
        WpNav::reached_wp_destination(self)
    }

    fn update_wpnav(&mut self) -> Result<StatusReport, WpNavError> {
        WpNav::update_wpnav(self)
    }
}

impl<'a> Archived for WpNav<'a> {
    fn write(&mut self) -> Result<(), ArchiveError> {
        let record = TargetRecord::new(self.clock.now_ms(), &self.target);

        self.arch_report.serialise(self.report)?;
        self.arch_target.serialise(record)?;

        Ok(())
    }
}

impl TargetRecord {
    fn new(time_ms: u64, target: &KinematicSample) -> Self {
        Self {
            time_ms,
            pos_n_cm: target.pos_neu_cm.x,
            pos_e_cm: target.pos_neu_cm.y,
            pos_u_cm: target.pos_neu_cm.z,
            vel_n_cms: target.vel_neu_cms.x,
            vel_e_cms: target.vel_neu_cms.y,
            vel_u_cms: target.vel_neu_cms.z,
            accel_n_cmss: target.accel_neu_cmss.x,
            accel_e_cmss: target.accel_neu_cmss.y,
            accel_u_cmss: target.accel_neu_cmss.z,
        }
    }
}

// ---------------------------------------------------------------------------
// PRIVATE FUNCTIONS
// ---------------------------------------------------------------------------

fn accel_ne_cmss(params: &WpNavParams) -> f64 {
    if params.accel_cmss > 0.0 {
        params.accel_cmss
    }
    else {
        WPNAV_ACCELERATION_CMSS
    }
}

fn corner_accel_cmss(params: &WpNavParams) -> f64 {
    if params.accel_c_cmss > 0.0 {
        params.accel_c_cmss
    }
    else {
        2.0 * accel_ne_cmss(params)
    }
}

fn accel_u_cmss(params: &WpNavParams) -> f64 {
    if params.accel_z_cmss > 0.0 {
        params.accel_z_cmss
    }
    else {
        WPNAV_ACCEL_Z_CMSS
    }
}

/// Jerk limit, defaulting to the acceleration per second.
///
/// Units: metres/second^3
fn jerk_msss(params: &WpNavParams) -> f64 {
    if params.jerk_msss > 0.0 {
        params.jerk_msss
    }
    else {
        accel_ne_cmss(params) * 0.01
    }
}

fn track_limits(params: &WpNavParams, speed_ne_cms: f64, speed_up_cms: f64, speed_down_cms: f64) -> TrackLimits {
    let jerk_cmsss = jerk_msss(params) * 100.0;
    let snap_jerk_ratio = if params.snap_jerk_ratio > 0.0 {
        params.snap_jerk_ratio
    }
    else {
        SNAP_JERK_RATIO_DEFAULT
    };

    TrackLimits {
        speed_ne_cms,
        speed_up_cms,
        speed_down_cms,
        accel_ne_cmss: accel_ne_cmss(params),
        accel_corner_cmss: corner_accel_cmss(params),
        accel_u_cmss: accel_u_cmss(params),
        jerk_cmsss,
        snap_cmssss: jerk_cmsss * snap_jerk_ratio,
    }
}

/// Build a spline entered at up to `origin_speed_cms`.
fn build_spline(
    origin: Vector3<f64>,
    destination: Vector3<f64>,
    origin_dir: Vector3<f64>,
    dest_dir: Vector3<f64>,
    origin_speed_cms: f64,
    limits: &TrackLimits
) -> SplineCurve {
    let spline = SplineCurve::new(origin, destination, origin_dir, dest_dir, 0.0, 0.0, limits);

    if origin_speed_cms > 0.0 {
        spline.with_origin_speed(origin_speed_cms.min(spline.origin_speed_max_cms()))
    }
    else {
        spline
    }
}

fn ned_to_neu(vec_ned: &Vector3<f64>) -> Vector3<f64> {
    Vector3::new(vec_ned.x, vec_ned.y, -vec_ned.z)
}

/// Bearing from one horizontal position to another.
///
/// Units: centidegrees in `[0, 36000)`
pub(crate) fn bearing_cd(from_ne_cm: &Vector2<f64>, to_ne_cm: &Vector2<f64>) -> f64 {
    let d = to_ne_cm - from_ne_cm;
    wrap_360_cd(d.y.atan2(d.x).to_degrees() * 100.0)
}

// ---------------------------------------------------------------------------
// TESTS
// ---------------------------------------------------------------------------

#[cfg(test)]
mod test {
    use super::*;
    use crate::location::FlatEarthFrame;
    use crate::sim::{ManualClock, PerlinTerrain, SimPosControl, TerrainParams};
    use crate::terrain::TerrainError;

    const DT_MS: u64 = 10;

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

    fn sim() -> SimPosControl {
        SimPosControl::new(Vector3::zeros(), DT_MS as f64 * 1e-3, 1.0)
    }

    fn tick(nav: &mut WpNav, clock: &ManualClock) -> StatusReport {
        clock.advance_ms(DT_MS);
        nav.update_wpnav().unwrap()
    }

    /// Tick until the predicate holds, returning the targets flown.
    fn fly_until<F>(nav: &mut WpNav, clock: &ManualClock, max_ticks: usize, mut done: F) -> Vec<KinematicSample>
    where
        F: FnMut(&WpNav, &StatusReport) -> bool
    {
        let mut targets = Vec::new();
        for _ in 0..max_ticks {
            let report = tick(nav, clock);
            targets.push(*nav.target());
            if done(nav, &report) {
                return targets;
            }
        }
        panic!("Condition not met within {} ticks", max_ticks);
    }

    #[test]
    fn test_update_before_init() {
        let mut sim = sim();
        let clock = ManualClock::new(0);
        let frame = frame();
        let mut nav = WpNav::new(params(), &mut sim, None, &frame, &clock);

        assert!(matches!(nav.update_wpnav(), Err(WpNavError::NotInitialised)));
        assert!(!nav.is_active());
        assert_eq!(nav.mode(), WpNavMode::Uninitialised);
        assert!(matches!(
            nav.set_wp_destination_next_neu_cm(&Vector3::zeros(), false),
            Err(WpNavError::NotInitialised)
        ));
    }

    #[test]
    fn test_destination_at_current_position_reached_at_once() {
        let mut sim = SimPosControl::new(Vector3::new(300.0, -200.0, 1000.0), 0.01, 1.0);
        let clock = ManualClock::new(0);
        let frame = frame();
        let mut nav = WpNav::new(params(), &mut sim, None, &frame, &clock);

        nav.set_wp_destination_neu_cm(&Vector3::new(300.0, -200.0, 1000.0), false).unwrap();
        assert!(!nav.reached_wp_destination());

        let report = tick(&mut nav, &clock);
        assert!(report.leg_finished);
        assert!(report.reached_destination);
        assert!(nav.reached_wp_destination());
        assert_eq!(nav.mode(), WpNavMode::Holding);
        assert_eq!(nav.target().vel_neu_cms, Vector3::zeros());
    }

    #[test]
    fn test_terrain_failure_leaves_state_unchanged() {
        let mut sim = sim();
        let clock = ManualClock::new(0);
        let frame = frame();
        let mut nav = WpNav::new(params(), &mut sim, None, &frame, &clock);

        let first = Vector3::new(2000.0, 0.0, 500.0);
        nav.set_wp_destination_neu_cm(&first, false).unwrap();
        for _ in 0..100 {
            tick(&mut nav, &clock);
        }

        // Rangefinder present but unhealthy, no terrain database
        nav.set_rangefinder_terrain_offset_cm(true, false, 0.0);
        let origin = *nav.get_wp_origin_neu_cm();
        let flags = nav.flags();

        let res = nav.set_wp_destination_neu_cm(&Vector3::new(0.0, 2000.0, 300.0), true);
        assert!(matches!(res, Err(WpNavError::Terrain(TerrainError::Unavailable))));
        assert_eq!(nav.get_wp_destination_neu_cm(), &first);
        assert_eq!(nav.get_wp_origin_neu_cm(), &origin);
        assert!(!nav.origin_and_destination_are_terrain_alt());
        assert_eq!(nav.flags(), flags);

        // Flight continues towards the old destination
        tick(&mut nav, &clock);
        assert!(nav.target().vel_neu_cms.x > 0.0);
    }

    #[test]
    fn test_reached_ne_radius_bounds() {
        let mut sim = sim();
        let clock = ManualClock::new(0);
        let frame = frame();
        let mut nav = WpNav::new(params(), &mut sim, None, &frame, &clock);

        nav.set_wp_destination_neu_cm(&Vector3::new(1000.0, 0.0, 0.0), false).unwrap();

        nav.params_mut().radius_cm = 0.0;
        assert!(!nav.reached_wp_destination_ne());

        nav.params_mut().radius_cm = 1.0e9;
        assert!(nav.reached_wp_destination_ne());
    }

    #[test]
    fn test_stop_waypoint_reached_strictly_inside_radius() {
        let mut sim = sim();
        let clock = ManualClock::new(0);
        let frame = frame();
        let mut nav = WpNav::new(params(), &mut sim, None, &frame, &clock);

        let dest = Vector3::new(1000.0, 0.0, 0.0);
        nav.params_mut().radius_cm = 0.0;
        nav.set_wp_destination_neu_cm(&dest, false).unwrap();

        // The target arrives and the vehicle settles on it, but a zero
        // radius is never reached
        fly_until(&mut nav, &clock, 5000, |_, r| r.leg_finished);
        for _ in 0..5000 {
            let report = tick(&mut nav, &clock);
            assert!(!report.reached_destination);
        }
        assert!(!nav.reached_wp_destination());
        assert!(!nav.reached_wp_destination_ne());
        assert_ne!(nav.mode(), WpNavMode::Holding);

        // Both checks agree once the vehicle is inside the radius
        nav.params_mut().radius_cm = 1.0;
        let report = tick(&mut nav, &clock);
        assert!(report.reached_destination);
        assert!(nav.reached_wp_destination());
        assert!(nav.reached_wp_destination_ne());
        assert_eq!(nav.mode(), WpNavMode::Holding);
    }

    #[test]
    fn test_alt_frame_mismatch_rejected() {
        let mut sim = sim();
        let clock = ManualClock::new(0);
        let frame = frame();
        let mut nav = WpNav::new(params(), &mut sim, None, &frame, &clock);

        let dest = Vector3::new(1000.0, 0.0, 0.0);
        nav.set_wp_destination_neu_cm(&dest, false).unwrap();

        let res = nav.set_wp_destination_next_neu_cm(&Vector3::new(1000.0, 1000.0, 200.0), true);
        assert!(matches!(res, Err(WpNavError::AltFrameMismatch)));
        assert!(nav.get_wp_next_destination_neu_cm().is_none());
        assert!(nav.legs().next().is_none());
        assert!(!nav.flags().fast_waypoint);

        let res = nav.set_spline_destination_neu_cm(
            &Vector3::new(0.0, 1000.0, 0.0),
            false,
            &Vector3::new(500.0, 500.0, 200.0),
            true,
            false
        );
        assert!(matches!(res, Err(WpNavError::AltFrameMismatch)));
        assert_eq!(nav.get_wp_destination_neu_cm(), &dest);
    }

    #[test]
    fn test_force_stop_is_idempotent() {
        let mut sim = sim();
        let clock = ManualClock::new(0);
        let frame = frame();
        let mut nav = WpNav::new(params(), &mut sim, None, &frame, &clock);

        // No next destination, already stopping
        nav.set_wp_destination_neu_cm(&Vector3::new(2000.0, 0.0, 0.0), false).unwrap();
        assert!(!nav.force_stop_at_next_wp());

        nav.set_wp_destination_next_neu_cm(&Vector3::new(2000.0, 2000.0, 0.0), false).unwrap();
        assert!(nav.flags().fast_waypoint);

        assert!(nav.force_stop_at_next_wp());
        assert!(!nav.flags().fast_waypoint);
        assert!(!nav.force_stop_at_next_wp());

        // Stops at the corner, then carries on to the next destination
        let targets = fly_until(&mut nav, &clock, 6000, |_, r| r.leg_promoted);
        let corner = Vector3::new(2000.0, 0.0, 0.0);
        assert!(targets
            .iter()
            .any(|t| (t.pos_neu_cm - corner).norm() < 1e-6 && t.vel_neu_cms.norm() < 1e-6));
        assert_eq!(nav.get_wp_destination_neu_cm(), &Vector3::new(2000.0, 2000.0, 0.0));
    }

    #[test]
    fn test_is_active_goes_stale() {
        let mut sim = sim();
        let clock = ManualClock::new(1000);
        let frame = frame();
        let mut nav = WpNav::new(params(), &mut sim, None, &frame, &clock);

        nav.wp_and_spline_init_cm(0.0, None);
        tick(&mut nav, &clock);
        assert!(nav.is_active());

        clock.advance_ms(IS_ACTIVE_TIMEOUT_MS);
        assert!(!nav.is_active());

        tick(&mut nav, &clock);
        assert!(nav.is_active());
    }

    #[test]
    fn test_mission_promotes_and_holds() {
        let mut sim = sim();
        let clock = ManualClock::new(0);
        let frame = frame();
        let mut nav = WpNav::new(params(), &mut sim, None, &frame, &clock);

        let b = Vector3::new(2000.0, 0.0, 0.0);
        let c = Vector3::new(2000.0, 2000.0, 0.0);
        nav.set_wp_destination_neu_cm(&b, false).unwrap();
        nav.set_wp_destination_next_neu_cm(&c, false).unwrap();

        let mut targets = fly_until(&mut nav, &clock, 6000, |_, r| r.leg_promoted);
        assert_eq!(nav.get_wp_origin_neu_cm(), &b);
        assert_eq!(nav.get_wp_destination_neu_cm(), &c);
        assert_eq!(nav.mode(), WpNavMode::Active);
        assert!(!nav.reached_wp_destination());

        // The corner was cut
        assert!(targets.iter().all(|t| (t.pos_neu_cm - b).norm() > 1.0));

        targets.extend(fly_until(&mut nav, &clock, 6000, |n, _| n.mode() == WpNavMode::Holding));
        assert!(nav.reached_wp_destination());
        assert!((nav.target().pos_neu_cm - c).norm() < 1e-6);
        assert!(nav.get_wp_distance_to_destination_cm() <= nav.get_wp_radius_cm());

        for pair in targets.windows(2) {
            let dv = (pair[1].vel_neu_cms - pair[0].vel_neu_cms).norm();
            assert!(dv < 20.0, "velocity step {}", dv);
        }

        assert!(nav.get_track_yaw_cd().is_some());
    }

    #[test]
    fn test_pause_and_resume() {
        let mut sim = sim();
        let clock = ManualClock::new(0);
        let frame = frame();
        let mut nav = WpNav::new(params(), &mut sim, None, &frame, &clock);

        nav.set_wp_destination_neu_cm(&Vector3::new(10000.0, 0.0, 0.0), false).unwrap();
        for _ in 0..300 {
            tick(&mut nav, &clock);
        }

        nav.set_pause();
        assert!(nav.paused());
        for _ in 0..1000 {
            tick(&mut nav, &clock);
        }

        let frozen = *nav.target();
        for _ in 0..100 {
            tick(&mut nav, &clock);
            assert_eq!(nav.target().pos_neu_cm, frozen.pos_neu_cm);
            assert_eq!(nav.target().vel_neu_cms, Vector3::zeros());
            assert_eq!(nav.target().accel_neu_cmss, Vector3::zeros());
        }

        nav.set_resume();
        for _ in 0..300 {
            tick(&mut nav, &clock);
        }
        assert!(nav.target().pos_neu_cm.x > frozen.pos_neu_cm.x);
        assert!(!nav.reached_wp_destination());
    }

    #[test]
    fn test_speed_change_in_flight() {
        let mut sim = sim();
        let clock = ManualClock::new(0);
        let frame = frame();
        let mut nav = WpNav::new(params(), &mut sim, None, &frame, &clock);

        nav.set_wp_destination_neu_cm(&Vector3::new(20000.0, 0.0, 0.0), false).unwrap();
        for _ in 0..800 {
            tick(&mut nav, &clock);
        }

        // Too slow, ignored
        nav.set_speed_ne_cms(5.0);
        assert_eq!(nav.get_speed_ne_cms(), 500.0);

        let before = *nav.target();
        nav.set_speed_ne_cms(200.0);
        assert_eq!(nav.get_speed_ne_cms(), 200.0);
        assert_eq!(nav.legs().this().curve.limits().speed_ne_cms, 200.0);

        tick(&mut nav, &clock);
        assert!((nav.target().vel_neu_cms - before.vel_neu_cms).norm() < 20.0);

        for _ in 0..2000 {
            tick(&mut nav, &clock);
        }
        assert!(nav.target().vel_neu_cms.x <= 200.0 + 1.0);
    }

    #[test]
    fn test_param_change_replans() {
        let mut sim = sim();
        let clock = ManualClock::new(0);
        let frame = frame();
        let mut nav = WpNav::new(params(), &mut sim, None, &frame, &clock);

        nav.wp_and_spline_init_cm(0.0, None);
        nav.set_wp_destination_neu_cm(&Vector3::new(20000.0, 0.0, 0.0), false).unwrap();
        for _ in 0..800 {
            tick(&mut nav, &clock);
        }

        nav.params_mut().accel_cmss = 100.0;
        tick(&mut nav, &clock);
        assert_eq!(nav.legs().this().curve.limits().accel_ne_cmss, 100.0);
        assert_eq!(nav.get_accel_ne_cmss(), 100.0);
        assert_eq!(nav.get_corner_accel_cmss(), 200.0);
    }

    #[test]
    fn test_terrain_following() {
        let terrain = PerlinTerrain::new(TerrainParams {
            seed: 0,
            wavelength_cm: 10000.0,
            amplitude_cm: 0.0,
            base_cm: 500.0,
            extent_cm: 1.0e9,
        });
        let mut sim = sim();
        let clock = ManualClock::new(0);
        let frame = frame();
        let mut nav = WpNav::new(params(), &mut sim, Some(&terrain), &frame, &clock);

        assert_eq!(nav.get_terrain_source(), TerrainSource::TerrainDatabase);

        let dest = Vector3::new(3000.0, 0.0, 300.0);
        nav.set_wp_destination_neu_cm(&dest, true).unwrap();
        assert!(nav.origin_and_destination_are_terrain_alt());

        // Origin was converted to altitude above terrain
        assert!((nav.get_wp_origin_neu_cm().z + 500.0).abs() < 1e-9);

        fly_until(&mut nav, &clock, 10000, |n, _| n.mode() == WpNavMode::Holding);
        for _ in 0..300 {
            tick(&mut nav, &clock);
        }
        assert!((nav.pos_control().pos_estimate_neu_cm().z - 800.0).abs() < 5.0);

        // The rangefinder takes over once healthy
        nav.set_rangefinder_terrain_offset_cm(true, true, 450.0);
        assert_eq!(nav.get_terrain_source(), TerrainSource::Rangefinder);
        assert!((nav.get_terrain_offset_cm().unwrap() - 450.0).abs() < 1e-9);
    }

    #[test]
    fn test_location_destinations() {
        let mut sim = sim();
        let clock = ManualClock::new(0);
        let frame = frame();
        let mut nav = WpNav::new(params(), &mut sim, None, &frame, &clock);

        let dest = Vector3::new(1500.0, -700.0, 1200.0);
        let loc = frame.location_from_vector_neu_cm(&dest, AltFrame::AboveOrigin).unwrap();
        nav.set_wp_destination_loc(&loc).unwrap();
        assert!((nav.get_wp_destination_neu_cm() - dest).norm() < 1e-6);

        let back = nav.get_wp_destination_loc().unwrap();
        assert!((back.lat_deg - loc.lat_deg).abs() < 1e-12);
        assert_eq!(nav.get_oa_wp_destination().unwrap(), back);

        // NED altitudes are flipped
        nav.set_wp_destination_ned_cm(&Vector3::new(0.0, 0.0, -500.0)).unwrap();
        assert_eq!(nav.get_wp_destination_neu_cm().z, 500.0);

        // No frame origin
        let no_origin = FlatEarthFrame::new();
        let mut sim = SimPosControl::new(Vector3::zeros(), 0.01, 1.0);
        let mut nav = WpNav::new(params(), &mut sim, None, &no_origin, &clock);
        assert!(matches!(nav.set_wp_destination_loc(&loc), Err(WpNavError::Conversion)));
        assert!(matches!(nav.get_wp_destination_loc(), Err(WpNavError::Conversion)));
    }

    #[test]
    fn test_spline_then_straight() {
        let mut sim = sim();
        let clock = ManualClock::new(0);
        let frame = frame();
        let mut nav = WpNav::new(params(), &mut sim, None, &frame, &clock);

        let b = Vector3::new(2000.0, 1000.0, 0.0);
        let c = Vector3::new(4000.0, 1000.0, 0.0);
        nav.set_spline_destination_neu_cm(&b, false, &c, false, false).unwrap();
        assert!(nav.flags().fast_waypoint);
        assert!(nav.legs().this().curve.is_spline());

        nav.set_wp_destination_next_neu_cm(&c, false).unwrap();
        assert!(nav.legs().this().curve.dest_speed_cms() > 0.0);

        let mut targets = fly_until(&mut nav, &clock, 6000, |_, r| r.leg_promoted);
        assert!(nav.legs().this().curve.is_straight());
        targets.extend(fly_until(&mut nav, &clock, 6000, |n, _| n.mode() == WpNavMode::Holding));

        // Smooth through the hand-off from the curve to the straight leg,
        // with acceleration steps bounded by the jerk limit and the change
        // of curvature
        for pair in targets.windows(2) {
            let dp = (pair[1].pos_neu_cm - pair[0].pos_neu_cm).norm();
            assert!(dp < 1.5 * 500.0 * 0.01, "position step {}", dp);
            let da = (pair[1].accel_neu_cmss - pair[0].accel_neu_cmss).norm();
            assert!(da < 20.0, "acceleration step {}", da);
        }
        assert!((nav.target().pos_neu_cm - c).norm() < 1e-6);
    }

    #[test]
    fn test_shift_origin_keeps_destination() {
        let mut sim = sim();
        let clock = ManualClock::new(0);
        let frame = frame();
        let mut nav = WpNav::new(params(), &mut sim, None, &frame, &clock);

        let dest = Vector3::new(5000.0, 0.0, 300.0);
        nav.set_wp_destination_neu_cm(&dest, false).unwrap();
        for _ in 0..400 {
            tick(&mut nav, &clock);
        }

        nav.shift_wp_origin_to_current_pos_ne();
        let pos = nav.pos_control().pos_estimate_neu_cm();
        assert_eq!(nav.get_wp_origin_neu_cm().x, pos.x);
        assert_eq!(nav.get_wp_origin_neu_cm().y, pos.y);
        assert_eq!(nav.get_wp_destination_neu_cm(), &dest);
        assert!(nav.legs().this().curve.is_straight());
        assert!(!nav.origin_and_destination_are_terrain_alt());

        nav.shift_wp_origin_to_stopping_point_ne();
        assert_eq!(nav.get_wp_destination_neu_cm(), &dest);

        fly_until(&mut nav, &clock, 6000, |n, _| n.mode() == WpNavMode::Holding);
    }

    #[test]
    fn test_distance_and_bearing() {
        let mut sim = sim();
        let clock = ManualClock::new(0);
        let frame = frame();
        let mut nav = WpNav::new(params(), &mut sim, None, &frame, &clock);

        nav.set_wp_destination_neu_cm(&Vector3::new(0.0, 1000.0, 500.0), false).unwrap();
        assert!((nav.get_wp_distance_to_destination_cm() - 1000.0).abs() < 1e-9);
        assert!((nav.get_wp_bearing_to_destination_cd() - 9000.0).abs() < 1e-6);

        assert!((bearing_cd(&Vector2::zeros(), &Vector2::new(0.0, -1.0)) - 27000.0).abs() < 1e-6);
    }
}
