//! Leg manager
//!
//! Holds the previous, current and next legs of a route and combines them
//! into a single target. Consecutive straight legs are blended by
//! superposition: while the current leg slows into its destination the next
//! leg is started and its motion away from that destination is added on, so
//! the corner is cut without stopping. The tail of the previous leg keeps
//! contributing after promotion, so the combined target is continuous.

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

use log::{debug, trace};
use nalgebra::Vector3;

use crate::kinematics::{ne, KinematicSample, TrackLimits};
use crate::scurve::SCurve;
use crate::spline::SplineCurve;

// ---------------------------------------------------------------------------
// CONSTANTS
// ---------------------------------------------------------------------------

/// Allowance on the slower leg's speed limit when checking the blend
/// midpoint, which sits exactly at that limit for a symmetric corner.
pub const TURN_SPEED_MARGIN: f64 = 1.01;

// ---------------------------------------------------------------------------
// DATA STRUCTURES
// ---------------------------------------------------------------------------

/// A leg and the time flown along it.
#[derive(Debug, Copy, Clone)]
pub struct Leg {
    pub curve: Curve,

    /// Units: seconds
    pub elapsed_s: f64,
}

/// The previous, current and next legs.
#[derive(Debug, Clone)]
pub struct LegMgr {
    /// The leg before this one, still contributing its tail while the corner
    /// into this leg is being flown. Only kept between straight legs.
    prev: Option<Leg>,

    this: Leg,

    next: Option<Leg>,
}

/// Result of advancing the legs by one step.
#[derive(Debug, Copy, Clone)]
pub struct LegStep {
    /// The combined target.
    pub target: KinematicSample,

    /// True once the current leg is complete, either because its time has
    /// run out or because the next leg has taken over.
    pub finished: bool,
}

// ---------------------------------------------------------------------------
// ENUMERATIONS
// ---------------------------------------------------------------------------

/// The geometry of a leg.
#[derive(Debug, Copy, Clone)]
pub enum Curve {
    Straight(SCurve),
    Spline(SplineCurve),
}

// ---------------------------------------------------------------------------
// IMPLEMENTATIONS
// ---------------------------------------------------------------------------

impl Curve {
    pub fn eval(&self, time_s: f64) -> KinematicSample {
        match self {
            Curve::Straight(c) => c.eval(time_s),
            Curve::Spline(c) => c.eval(time_s),
        }
    }

    pub fn duration_s(&self) -> f64 {
        match self {
            Curve::Straight(c) => c.duration_s(),
            Curve::Spline(c) => c.duration_s(),
        }
    }

    pub fn origin(&self) -> &Vector3<f64> {
        match self {
            Curve::Straight(c) => c.origin(),
            Curve::Spline(c) => c.origin(),
        }
    }

    pub fn destination(&self) -> &Vector3<f64> {
        match self {
            Curve::Straight(c) => c.destination(),
            Curve::Spline(c) => c.destination(),
        }
    }

    pub fn limits(&self) -> &TrackLimits {
        match self {
            Curve::Straight(c) => c.limits(),
            Curve::Spline(c) => c.limits(),
        }
    }

    /// Speed at the start of the leg.
    pub fn origin_speed_cms(&self) -> f64 {
        match self {
            Curve::Straight(c) => c.origin_speed_cms(),
            Curve::Spline(c) => c.origin_speed_cms(),
        }
    }

    /// Speed at the end of the leg.
    pub fn dest_speed_cms(&self) -> f64 {
        match self {
            Curve::Straight(c) => c.end_speed_cms(),
            Curve::Spline(c) => c.dest_speed_cms(),
        }
    }

    /// Direction of travel on arrival at the destination.
    pub fn dest_dir(&self) -> Vector3<f64> {
        match self {
            Curve::Straight(c) => *c.direction(),
            Curve::Spline(c) => *c.dest_dir(),
        }
    }

    pub fn is_straight(&self) -> bool {
        matches!(self, Curve::Straight(_))
    }

    pub fn is_spline(&self) -> bool {
        matches!(self, Curve::Spline(_))
    }

    /// The same geometry rebuilt with new limits, for a leg not yet started.
    fn with_limits(&self, limits: &TrackLimits) -> Curve {
        match self {
            Curve::Straight(c) => Curve::Straight(SCurve::new_leg(
                *c.origin(),
                *c.destination(),
                limits,
                c.origin_speed_cms(),
                c.end_speed_cms()
            )),
            Curve::Spline(c) => Curve::Spline(SplineCurve::new(
                *c.origin(),
                *c.destination(),
                *c.origin_dir(),
                *c.dest_dir(),
                c.origin_speed_cms(),
                c.dest_speed_cms(),
                limits
            )),
        }
    }
}

impl Leg {
    pub fn new(curve: Curve) -> Self {
        Self {
            curve,
            elapsed_s: 0.0,
        }
    }

    /// The target at the current elapsed time.
    pub fn sample(&self) -> KinematicSample {
        self.curve.eval(self.elapsed_s)
    }

    pub fn finished(&self) -> bool {
        self.elapsed_s >= self.curve.duration_s()
    }

    pub fn remaining_s(&self) -> f64 {
        (self.curve.duration_s() - self.elapsed_s).max(0.0)
    }

    /// True if the leg has been started by the blend or by promotion.
    pub fn started(&self) -> bool {
        self.elapsed_s > 0.0
    }

    /// Rebuild the leg to arrive at its destination at `dest_speed_cms`
    /// without any jump in the current target.
    ///
    /// Returns false if the leg cannot be rebuilt from its current state.
    fn set_dest_speed(&mut self, dest_speed_cms: f64) -> bool {
        if (self.curve.dest_speed_cms() - dest_speed_cms).abs() <= f64::EPSILON {
            return true;
        }

        match self.curve {
            Curve::Straight(c) => {
                if self.started() {
                    match c.from_state(self.elapsed_s, c.limits(), dest_speed_cms) {
                        Some(c) => self.curve = Curve::Straight(c),
                        None => return false,
                    }
                }
                else {
                    self.curve = Curve::Straight(SCurve::new_leg(
                        *c.origin(),
                        *c.destination(),
                        c.limits(),
                        c.origin_speed_cms(),
                        dest_speed_cms
                    ));
                }
            }
            Curve::Spline(c) => {
                if self.started() {
                    match c.from_state(self.elapsed_s, c.limits(), dest_speed_cms) {
                        Some(c) => self.curve = Curve::Spline(c),
                        None => return false,
                    }
                }
                else {
                    self.curve = Curve::Spline(c.with_dest_speed(dest_speed_cms));
                }
            }
        }

        true
    }

    /// Rebuild a leg which has not started to begin at `origin_speed_cms`.
    fn set_origin_speed(&mut self, origin_speed_cms: f64) {
        self.curve = match self.curve {
            Curve::Straight(c) => Curve::Straight(SCurve::new_leg(
                *c.origin(),
                *c.destination(),
                c.limits(),
                origin_speed_cms,
                c.end_speed_cms()
            )),
            Curve::Spline(c) => Curve::Spline(c.with_origin_speed(origin_speed_cms)),
        };
    }
}

impl LegMgr {
    /// Create a manager holding a stationary leg at `pos_neu_cm`.
    pub fn new(pos_neu_cm: Vector3<f64>, limits: &TrackLimits) -> Self {
        Self {
            prev: None,
            this: Leg::new(Curve::Straight(SCurve::new_leg(
                pos_neu_cm,
                pos_neu_cm,
                limits,
                0.0,
                0.0
            ))),
            next: None,
        }
    }

    pub fn prev(&self) -> Option<&Leg> {
        self.prev.as_ref()
    }

    pub fn this(&self) -> &Leg {
        &self.this
    }

    pub fn next(&self) -> Option<&Leg> {
        self.next.as_ref()
    }

    /// Replace the current leg.
    ///
    /// The outgoing leg is kept as the previous leg if both are straight, so
    /// that any remaining tail of its motion continues to be flown.
    pub fn build_this(&mut self, curve: Curve) {
        self.prev = if self.this.curve.is_straight() && curve.is_straight() {
            Some(self.this)
        }
        else {
            None
        };
        self.this = Leg::new(curve);
        self.link();
    }

    /// Replace the current leg without keeping the outgoing one.
    pub fn reset_this(&mut self, curve: Curve) {
        self.prev = None;
        self.this = Leg::new(curve);
        self.next = None;
    }

    /// Set the next leg and adapt the hand-off between it and the current
    /// leg.
    pub fn build_next(&mut self, curve: Curve) {
        self.next = Some(Leg::new(curve));
        self.link();
    }

    pub fn clear_next(&mut self) {
        self.next = None;
    }

    /// Make the next leg current.
    ///
    /// Returns false if there is no next leg.
    pub fn promote(&mut self) -> bool {
        let next = match self.next.take() {
            Some(n) => n,
            None => return false,
        };

        self.prev = if self.this.curve.is_straight() && next.curve.is_straight() {
            Some(self.this)
        }
        else {
            None
        };
        self.this = next;

        trace!("Promoted next leg, {:.2} s already flown", self.this.elapsed_s);

        true
    }

    /// Advance the legs by `dt_s` seconds and return the combined target.
    pub fn advance(&mut self, dt_s: f64, wp_radius_cm: f64, fast_waypoint: bool) -> LegStep {
        // Previous leg's tail
        let mut prev_tail = None;
        if let Some(prev) = self.prev.as_mut() {
            prev.elapsed_s += dt_s;
            prev_tail = Some((prev.sample(), *prev.curve.destination()));
        }

        self.this.elapsed_s += dt_s;
        let mut target = self.this.sample();
        if let Some((tail, anchor)) = prev_tail {
            target = target.with_offset_from(&tail, &anchor);
        }

        let mut finished = self.this.finished();

        if let (Curve::Straight(this), Some(next)) = (self.this.curve, self.next.as_mut()) {
            if let Curve::Straight(next_curve) = next.curve {
                if next.started() {
                    next.elapsed_s += dt_s;
                    target = target.with_offset_from(&next.sample(), next_curve.origin());
                    finished = next.elapsed_s >= self.this.remaining_s();
                }
                else if fast_waypoint
                    && blend_should_start(&this, self.this.elapsed_s, &next_curve, wp_radius_cm)
                {
                    debug!("Starting blend into the next leg");
                    next.elapsed_s += dt_s;
                    target = target.with_offset_from(&next.sample(), next_curve.origin());
                    finished = next.elapsed_s >= self.this.remaining_s();
                }
            }
        }

        LegStep { target, finished }
    }

    /// Rebuild the legs for new limits without a jump in the target.
    ///
    /// The current leg is left alone while it is slowing into its
    /// destination or while a blend into the next leg is in progress.
    pub fn replan(&mut self, limits: &TrackLimits) {
        let next_started = self.next.map_or(false, |n| n.started());

        match self.this.curve {
            Curve::Straight(c) => {
                let in_decel = self.this.elapsed_s >= c.decel_start_s();
                if !in_decel && !next_started && !c.is_zero_length() {
                    match c.from_state(self.this.elapsed_s, limits, c.end_speed_cms()) {
                        Some(c) => self.this.curve = Curve::Straight(c),
                        None => debug!("Cannot replan the current leg, keeping its old limits"),
                    }
                }
            }
            Curve::Spline(c) => {
                if !next_started && !c.is_zero_length() {
                    match c.from_state(self.this.elapsed_s, limits, c.dest_speed_cms()) {
                        Some(c) => self.this.curve = Curve::Spline(c),
                        None => debug!("Cannot replan the current spline, keeping its old limits"),
                    }
                }
            }
        }

        if let Some(next) = self.next.as_mut() {
            if !next.started() {
                next.curve = next.curve.with_limits(limits);
                self.link();
            }
        }
    }

    /// Change a blended arrival at the current destination into a full stop.
    ///
    /// Returns true if the legs were changed, false if there is no next leg
    /// or the blend into it has already started.
    pub fn force_stop_at_next_wp(&mut self) -> bool {
        match self.next {
            Some(next) if !next.started() => (),
            _ => return false,
        }

        if !self.this.set_dest_speed(0.0) {
            debug!("Cannot stop at the current destination, continuing");
            return false;
        }

        if let Some(next) = self.next.as_mut() {
            next.set_origin_speed(0.0);
        }

        true
    }

    /// Match the speed at which the current leg arrives at its destination to
    /// the speed at which the next leg leaves it.
    fn link(&mut self) {
        let next = match self.next.as_mut() {
            Some(n) if !n.started() => n,
            _ => return,
        };

        let handoff = match (&self.this.curve, &next.curve) {
            // Straight legs stop at their destination, the blend provides the
            // corner
            (Curve::Straight(_), Curve::Straight(_)) => 0.0,
            (Curve::Straight(_), Curve::Spline(n)) => n.origin_speed_max_cms(),
            (Curve::Spline(t), Curve::Straight(n)) => t
                .dest_speed_max_cms()
                .min(SCurve::max_origin_speed(n.origin(), n.destination(), n.limits())),
            (Curve::Spline(t), Curve::Spline(n)) => {
                t.dest_speed_max_cms().min(n.origin_speed_max_cms())
            }
        };

        self.this.set_dest_speed(handoff);

        // The current leg may not reach the requested speed
        let arrival = self.this.curve.dest_speed_cms();
        if (next.curve.origin_speed_cms() - arrival).abs() > f64::EPSILON {
            next.set_origin_speed(arrival);
        }
    }
}

// ---------------------------------------------------------------------------
// PRIVATE FUNCTIONS
// ---------------------------------------------------------------------------

/// Decide whether to start flying the next straight leg.
///
/// The blend starts once the current leg's final slowdown would be centred
/// on the next leg's initial speed-up, and only if the combined target at
/// the middle of the overlap stays within the waypoint radius, below the
/// slower leg's speed limit and below twice the cornering acceleration.
fn blend_should_start(this: &SCurve, elapsed_s: f64, next: &SCurve, wp_radius_cm: f64) -> bool {
    if elapsed_s < this.turn_out_s() - next.turn_in_s() {
        return false;
    }

    if this.pos_along_cm(elapsed_s) < 0.5 * this.length_cm() {
        return false;
    }

    let remaining_s = (this.duration_s() - elapsed_s).max(0.0);
    if remaining_s >= 0.5 * next.duration_s() {
        return false;
    }

    let turn = this
        .eval(elapsed_s + 0.5 * remaining_s)
        .with_offset_from(&next.eval(0.5 * remaining_s), next.origin());

    let speed_min = this.speed_max_cms().min(next.speed_max_cms());
    let accel_corner = this.limits().accel_corner_cmss;

    (turn.pos_neu_cm - this.destination()).norm() < wp_radius_cm
        && ne(&turn.vel_neu_cms).norm() <= speed_min * TURN_SPEED_MARGIN
        && ne(&turn.accel_neu_cmss).norm() < 2.0 * accel_corner
}

// ---------------------------------------------------------------------------
// TESTS
// ---------------------------------------------------------------------------

#[cfg(test)]
mod test {
    use super::*;

    fn limits() -> TrackLimits {
        TrackLimits {
            speed_ne_cms: 500.0,
            speed_up_cms: 250.0,
            speed_down_cms: 150.0,
            accel_ne_cmss: 250.0,
            accel_corner_cmss: 500.0,
            accel_u_cmss: 100.0,
            jerk_cmsss: 500.0,
            snap_cmssss: 2500.0,
        }
    }

    fn straight(origin: Vector3<f64>, dest: Vector3<f64>) -> Curve {
        Curve::Straight(SCurve::new_leg(origin, dest, &limits(), 0.0, 0.0))
    }

    /// Fly the current leg to completion, promoting into the next leg when it
    /// finishes, and return the targets produced.
    fn fly(legs: &mut LegMgr, dt: f64, fast: bool, max_ticks: usize) -> (Vec<KinematicSample>, Option<usize>) {
        let mut targets = Vec::new();
        let mut promoted_at = None;
        for i in 0..max_ticks {
            let step = legs.advance(dt, 200.0, fast);
            targets.push(step.target);
            if step.finished {
                if promoted_at.is_none() && legs.promote() {
                    promoted_at = Some(i);
                }
                else if legs.next().is_none() && legs.this().finished() {
                    break;
                }
            }
        }
        (targets, promoted_at)
    }

    fn spline(origin: Vector3<f64>, dest: Vector3<f64>, origin_dir: Vector3<f64>, dest_dir: Vector3<f64>) -> Curve {
        Curve::Spline(SplineCurve::new(origin, dest, origin_dir, dest_dir, 0.0, 0.0, &limits()))
    }

    /// Fly a route leg by leg, queueing each leg as the one before it becomes
    /// current, and return the targets produced and the ticks at which legs
    /// were promoted.
    fn fly_route(route: Vec<Curve>, dt: f64, max_ticks: usize) -> (Vec<KinematicSample>, Vec<usize>) {
        let mut route = route.into_iter();
        let first = match route.next() {
            Some(c) => c,
            None => return (Vec::new(), Vec::new()),
        };

        let mut legs = LegMgr::new(*first.origin(), &limits());
        legs.build_this(first);
        if let Some(c) = route.next() {
            legs.build_next(c);
        }

        let mut targets = Vec::new();
        let mut promotions = Vec::new();
        for i in 0..max_ticks {
            let step = legs.advance(dt, 200.0, true);
            targets.push(step.target);
            if step.finished {
                if legs.promote() {
                    promotions.push(i);
                    if let Some(c) = route.next() {
                        legs.build_next(c);
                    }
                }
                else {
                    break;
                }
            }
        }
        (targets, promotions)
    }

    /// Largest change in velocity and in acceleration between consecutive
    /// targets.
    fn max_steps(targets: &[KinematicSample]) -> (f64, f64) {
        targets.windows(2).fold((0.0f64, 0.0f64), |(dv, da), pair| {
            (
                dv.max((pair[1].vel_neu_cms - pair[0].vel_neu_cms).norm()),
                da.max((pair[1].accel_neu_cmss - pair[0].accel_neu_cmss).norm()),
            )
        })
    }

    #[test]
    fn test_blend_is_continuous() {
        let a = Vector3::zeros();
        let b = Vector3::new(2000.0, 0.0, 0.0);
        let c = Vector3::new(2000.0, 2000.0, 0.0);

        let mut legs = LegMgr::new(a, &limits());
        legs.build_this(straight(a, b));
        legs.build_next(straight(b, c));

        let dt = 0.01;
        let (targets, promoted_at) = fly(&mut legs, dt, true, 5000);

        // The blend started before the first leg's own end, and the corner
        // was cut
        let promoted_at = promoted_at.expect("next leg promoted");
        let first_duration = SCurve::new_leg(a, b, &limits(), 0.0, 0.0).duration_s();
        assert!((promoted_at as f64) * dt < first_duration);
        assert!(targets.iter().all(|t| (t.pos_neu_cm - b).norm() > 1.0));

        // No velocity jumps anywhere, including across the promotion
        for pair in targets.windows(2) {
            let dv = (pair[1].vel_neu_cms - pair[0].vel_neu_cms).norm();
            assert!(dv < 10.0, "velocity step {}", dv);
        }

        // Ends at rest at the final destination
        let last = targets.last().unwrap();
        assert!((last.pos_neu_cm - c).norm() < 1e-6);
        assert!(last.vel_neu_cms.norm() < 1e-6);
    }

    #[test]
    fn test_no_blend_without_fast_waypoint() {
        let a = Vector3::zeros();
        let b = Vector3::new(2000.0, 0.0, 0.0);
        let c = Vector3::new(2000.0, 2000.0, 0.0);

        let mut legs = LegMgr::new(a, &limits());
        legs.build_this(straight(a, b));
        legs.build_next(straight(b, c));

        let (targets, _) = fly(&mut legs, 0.01, false, 5000);

        // Stops at the corner
        assert!(targets.iter().any(|t| (t.pos_neu_cm - b).norm() < 1e-6 && t.vel_neu_cms.norm() < 1e-6));
    }

    #[test]
    fn test_replan_is_continuous() {
        let a = Vector3::zeros();
        let b = Vector3::new(5000.0, 0.0, 0.0);

        let mut legs = LegMgr::new(a, &limits());
        legs.build_this(straight(a, b));

        for _ in 0..130 {
            legs.advance(0.01, 200.0, false);
        }
        let before = legs.this().sample();

        let mut slower = limits();
        slower.speed_ne_cms = 200.0;
        legs.replan(&slower);

        let after = legs.this().sample();
        assert!((before.pos_neu_cm - after.pos_neu_cm).norm() < 1e-9);
        assert!((before.vel_neu_cms - after.vel_neu_cms).norm() < 1e-9);
        assert!((before.accel_neu_cmss - after.accel_neu_cmss).norm() < 1e-9);

        // Settles at the new limit
        for _ in 0..1000 {
            legs.advance(0.01, 200.0, false);
        }
        assert!((legs.this().sample().vel_neu_cms.norm() - 200.0).abs() < 1e-6);
    }

    #[test]
    fn test_force_stop() {
        let a = Vector3::zeros();
        let b = Vector3::new(2000.0, 0.0, 0.0);
        let c = Vector3::new(2000.0, 2000.0, 0.0);

        // Nothing to stop without a next leg
        let mut legs = LegMgr::new(a, &limits());
        legs.build_this(straight(a, b));
        assert!(!legs.force_stop_at_next_wp());

        // A spline after a straight leg is entered at speed until stopped
        legs.build_next(Curve::Spline(SplineCurve::new(
            b,
            c,
            Vector3::new(1.0, 0.0, 0.0),
            Vector3::new(0.0, 1.0, 0.0),
            0.0,
            0.0,
            &limits()
        )));
        assert!(legs.this().curve.dest_speed_cms() > 0.0);
        assert!((legs.next().unwrap().curve.origin_speed_cms() - legs.this().curve.dest_speed_cms()).abs() < 1e-9);

        for _ in 0..100 {
            legs.advance(0.01, 200.0, true);
        }
        let before = legs.this().sample();
        assert!(legs.force_stop_at_next_wp());
        let after = legs.this().sample();
        assert!((before.vel_neu_cms - after.vel_neu_cms).norm() < 1e-9);
        assert_eq!(legs.this().curve.dest_speed_cms(), 0.0);
        assert_eq!(legs.next().unwrap().curve.origin_speed_cms(), 0.0);
    }

    #[test]
    fn test_spline_promotions_are_continuous() {
        let a = Vector3::zeros();
        let b = Vector3::new(2000.0, 0.0, 0.0);
        let c = Vector3::new(3000.0, 1000.0, 0.0);
        let d = Vector3::new(2000.0, 2000.0, 0.0);
        let e = Vector3::new(0.0, 2000.0, 0.0);

        let north = Vector3::new(1.0, 0.0, 0.0);
        let east = Vector3::new(0.0, 1.0, 0.0);
        let south = Vector3::new(-1.0, 0.0, 0.0);

        // Straight into spline, spline into spline, spline into straight
        let route = vec![
            straight(a, b),
            spline(b, c, north, east),
            spline(c, d, east, south),
            straight(d, e),
        ];

        let dt = 1e-3;
        let (targets, promotions) = fly_route(route, dt, 400_000);
        assert_eq!(promotions.len(), 3);

        // Entered at speed rather than stopping at each waypoint
        for &i in promotions.iter() {
            assert!(targets[i].vel_neu_cms.norm() > 10.0);
        }

        // Neither velocity nor acceleration jump, including around each
        // promotion
        let (dv, da) = max_steps(&targets);
        assert!(dv < 1.0, "velocity step {}", dv);
        assert!(da < 3.0, "acceleration step {}", da);

        for &i in promotions.iter() {
            let (_, da) = max_steps(&targets[i.saturating_sub(5)..(i + 5).min(targets.len())]);
            assert!(da < 3.0, "acceleration step {} at promotion {}", da, i);
        }

        let last = targets.last().unwrap();
        assert!((last.pos_neu_cm - e).norm() < 1e-6);
        assert!(last.vel_neu_cms.norm() < 1e-6);
    }

    #[test]
    fn test_spline_replan_is_continuous() {
        let a = Vector3::zeros();
        let b = Vector3::new(2000.0, 2000.0, 0.0);

        let mut legs = LegMgr::new(a, &limits());
        legs.build_this(spline(a, b, Vector3::new(1.0, 0.0, 0.0), Vector3::new(0.0, 1.0, 0.0)));

        let dt = 1e-3;
        for _ in 0..4000 {
            legs.advance(dt, 200.0, false);
        }
        let elapsed = legs.this().elapsed_s;
        let before = legs.this().sample();

        let mut slower = limits();
        slower.speed_ne_cms = 200.0;
        legs.replan(&slower);

        // Same instant on the same time base
        assert_eq!(legs.this().elapsed_s, elapsed);
        let after = legs.this().sample();
        assert!((before.pos_neu_cm - after.pos_neu_cm).norm() < 1e-9);
        assert!((before.vel_neu_cms - after.vel_neu_cms).norm() < 1e-9);
        assert!((before.accel_neu_cmss - after.accel_neu_cmss).norm() < 1e-9);

        // Slows to the new limit without a step in acceleration
        let mut targets = vec![after];
        while !legs.this().finished() {
            targets.push(legs.advance(dt, 200.0, false).target);
        }
        let (dv, da) = max_steps(&targets);
        assert!(dv < 1.0, "velocity step {}", dv);
        assert!(da < 3.0, "acceleration step {}", da);
        assert!(targets[targets.len() / 2].vel_neu_cms.norm() <= 200.0 + 1e-6);
        assert!((targets.last().unwrap().pos_neu_cm - b).norm() < 1e-6);
    }

    #[test]
    fn test_force_stop_on_spline_is_continuous() {
        let a = Vector3::zeros();
        let b = Vector3::new(1500.0, 1500.0, 0.0);
        let c = Vector3::new(3000.0, 1500.0, 0.0);
        let north = Vector3::new(1.0, 0.0, 0.0);
        let east = Vector3::new(0.0, 1.0, 0.0);

        let mut legs = LegMgr::new(a, &limits());
        legs.build_this(spline(a, b, north, east));
        legs.build_next(spline(b, c, east, north));
        assert!(legs.this().curve.dest_speed_cms() > 0.0);

        let dt = 1e-3;
        for _ in 0..1500 {
            legs.advance(dt, 200.0, true);
        }
        let before = legs.this().sample();

        assert!(legs.force_stop_at_next_wp());
        assert_eq!(legs.this().curve.dest_speed_cms(), 0.0);
        assert_eq!(legs.next().unwrap().curve.origin_speed_cms(), 0.0);

        let after = legs.this().sample();
        assert!((before.pos_neu_cm - after.pos_neu_cm).norm() < 1e-9);
        assert!((before.vel_neu_cms - after.vel_neu_cms).norm() < 1e-9);
        assert!((before.accel_neu_cmss - after.accel_neu_cmss).norm() < 1e-9);

        let next = legs.advance(dt, 200.0, true).target;
        assert!((next.accel_neu_cmss - after.accel_neu_cmss).norm() < 3.0);
    }

    #[test]
    fn test_zero_length_leg_finishes_at_once() {
        let a = Vector3::new(10.0, 10.0, 10.0);
        let mut legs = LegMgr::new(a, &limits());
        legs.build_this(straight(a, a));
        let step = legs.advance(0.01, 0.0, false);
        assert!(step.finished);
        assert_eq!(step.target, KinematicSample::at_rest(a));
    }
}
