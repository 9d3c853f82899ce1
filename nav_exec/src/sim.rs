//! Simulated collaborators
//!
//! A point mass vehicle behind a simple position controller, a manually
//! stepped clock and a synthetic terrain. Used by the `nav_exec` mission
//! runner and by the tests.

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

use std::cell::Cell;

use nalgebra::{Vector2, Vector3};
use noise::{NoiseFn, Perlin, Seedable};
use serde::Deserialize;

use crate::interfaces::{Clock, PositionControl, TerrainDatabase};
use crate::kinematics::{ne, LENGTH_SQ_EPSILON};
use util::maths::clamp;

// ---------------------------------------------------------------------------
// CONSTANTS
// ---------------------------------------------------------------------------

/// Units: centimetres/second^2
const GRAVITY_CMSS: f64 = 980.665;

/// Time constant of the vehicle's velocity response.
///
/// Units: seconds
const VEHICLE_TC_S: f64 = 0.1;

/// Gain of the terrain offset shaping.
///
/// Units: 1/second
const TERRAIN_P: f64 = 2.0;

// ---------------------------------------------------------------------------
// DATA STRUCTURES
// ---------------------------------------------------------------------------

/// A point mass vehicle flown by a proportional position controller with
/// velocity and acceleration feed forward.
#[derive(Debug, Clone)]
pub struct SimPosControl {
    /// Units: seconds
    dt_s: f64,

    pos_ne_p: f64,

    pos_target_neu_cm: Vector3<f64>,
    vel_target_neu_cms: Vector3<f64>,
    accel_target_neu_cmss: Vector3<f64>,

    pos_neu_cm: Vector3<f64>,
    vel_neu_cms: Vector3<f64>,

    max_speed_ne_cms: f64,
    max_accel_ne_cmss: f64,
    max_speed_up_cms: f64,
    max_speed_down_cms: f64,
    max_accel_u_cmss: f64,

    terrain_target_u_cm: f64,
    terrain_u_cm: f64,
    terrain_vel_u_cms: f64,
    terrain_accel_u_cmss: f64,

    /// Units: radians
    yaw_rad: f64,
}

/// A clock advanced by hand.
#[derive(Debug, Default)]
pub struct ManualClock {
    now_ms: Cell<u64>,
}

/// Parameters of the synthetic terrain.
#[derive(Debug, Clone, Deserialize)]
pub struct TerrainParams {
    pub seed: u32,

    /// Horizontal distance over which the noise varies by about one cycle.
    ///
    /// Units: centimetres
    pub wavelength_cm: f64,

    /// Units: centimetres
    pub amplitude_cm: f64,

    /// Height of the mean terrain surface above the frame origin.
    ///
    /// Units: centimetres
    pub base_cm: f64,

    /// Data is only held within this horizontal distance of the origin.
    ///
    /// Units: centimetres
    pub extent_cm: f64,
}

/// Rolling terrain generated from Perlin noise.
pub struct PerlinTerrain {
    perlin: Perlin,
    params: TerrainParams,
}

// ---------------------------------------------------------------------------
// IMPLEMENTATIONS
// ---------------------------------------------------------------------------

impl SimPosControl {
    /// Create a vehicle at rest at `pos_neu_cm`.
    pub fn new(pos_neu_cm: Vector3<f64>, dt_s: f64, pos_ne_p: f64) -> Self {
        Self {
            dt_s,
            pos_ne_p,
            pos_target_neu_cm: pos_neu_cm,
            vel_target_neu_cms: Vector3::zeros(),
            accel_target_neu_cmss: Vector3::zeros(),
            pos_neu_cm,
            vel_neu_cms: Vector3::zeros(),
            max_speed_ne_cms: 0.0,
            max_accel_ne_cmss: 0.0,
            max_speed_up_cms: 0.0,
            max_speed_down_cms: 0.0,
            max_accel_u_cmss: 0.0,
            terrain_target_u_cm: 0.0,
            terrain_u_cm: 0.0,
            terrain_vel_u_cms: 0.0,
            terrain_accel_u_cmss: 0.0,
            yaw_rad: 0.0,
        }
    }

    pub fn pos_target_neu_cm(&self) -> &Vector3<f64> {
        &self.pos_target_neu_cm
    }

    pub fn vel_target_neu_cms(&self) -> &Vector3<f64> {
        &self.vel_target_neu_cms
    }

    pub fn accel_target_neu_cmss(&self) -> &Vector3<f64> {
        &self.accel_target_neu_cmss
    }

    fn shape_terrain(&mut self) {
        let max_up = if self.max_speed_up_cms > 0.0 { self.max_speed_up_cms } else { f64::MAX };
        let max_down = if self.max_speed_down_cms > 0.0 { self.max_speed_down_cms } else { f64::MAX };

        let vel = clamp(
            &((self.terrain_target_u_cm - self.terrain_u_cm) * TERRAIN_P),
            &-max_down,
            &max_up
        );

        self.terrain_accel_u_cmss = (vel - self.terrain_vel_u_cms) / self.dt_s;
        self.terrain_vel_u_cms = vel;
        self.terrain_u_cm += vel * self.dt_s;
    }
}

impl PositionControl for SimPosControl {
    fn set_pos_vel_accel_neu_cm(
        &mut self,
        pos_neu_cm: &Vector3<f64>,
        vel_neu_cms: &Vector3<f64>,
        accel_neu_cmss: &Vector3<f64>
    ) {
        self.pos_target_neu_cm = *pos_neu_cm;
        self.vel_target_neu_cms = *vel_neu_cms;
        self.accel_target_neu_cmss = *accel_neu_cmss;
    }

    fn update_ne_controller(&mut self) {
        self.shape_terrain();

        let vel_cmd = self.vel_target_neu_cms
            + (self.pos_target_neu_cm - self.pos_neu_cm) * self.pos_ne_p;
        let alpha = (self.dt_s / VEHICLE_TC_S).min(1.0);

        self.vel_neu_cms += (vel_cmd - self.vel_neu_cms) * alpha;
        self.pos_neu_cm += self.vel_neu_cms * self.dt_s;

        let vel_ne = ne(&self.vel_target_neu_cms);
        if vel_ne.norm_squared() > LENGTH_SQ_EPSILON {
            self.yaw_rad = vel_ne.y.atan2(vel_ne.x);
        }
    }

    fn init_ne_controller(&mut self) {
        self.pos_target_neu_cm.x = self.pos_neu_cm.x;
        self.pos_target_neu_cm.y = self.pos_neu_cm.y;
        self.vel_target_neu_cms.x = self.vel_neu_cms.x;
        self.vel_target_neu_cms.y = self.vel_neu_cms.y;
        self.accel_target_neu_cmss.x = 0.0;
        self.accel_target_neu_cmss.y = 0.0;
    }

    fn init_ne_controller_stopping_point(&mut self) {
        let stop = self.stopping_point_ne_cm();
        self.pos_target_neu_cm.x = stop.x;
        self.pos_target_neu_cm.y = stop.y;
        self.vel_target_neu_cms.x = 0.0;
        self.vel_target_neu_cms.y = 0.0;
        self.accel_target_neu_cmss.x = 0.0;
        self.accel_target_neu_cmss.y = 0.0;
    }

    fn init_u_controller_stopping_point(&mut self) {
        self.pos_target_neu_cm.z = self.stopping_point_u_cm();
        self.vel_target_neu_cms.z = 0.0;
        self.accel_target_neu_cmss.z = 0.0;
    }

    fn set_max_speed_accel_ne_cm(&mut self, speed_cms: f64, accel_cmss: f64) {
        self.max_speed_ne_cms = speed_cms;
        self.max_accel_ne_cmss = accel_cmss;
    }

    fn set_max_speed_accel_u_cm(&mut self, speed_down_cms: f64, speed_up_cms: f64, accel_cmss: f64) {
        self.max_speed_down_cms = speed_down_cms.abs();
        self.max_speed_up_cms = speed_up_cms;
        self.max_accel_u_cmss = accel_cmss;
    }

    fn init_pos_terrain_u_cm(&mut self, terrain_cm: f64) {
        // Move the target with the terrain so the vehicle does not see a step
        self.pos_target_neu_cm.z -= self.terrain_u_cm - terrain_cm;
        self.terrain_u_cm = terrain_cm;
        self.terrain_target_u_cm = terrain_cm;
        self.terrain_vel_u_cms = 0.0;
        self.terrain_accel_u_cmss = 0.0;
    }

    fn set_pos_terrain_target_u_cm(&mut self, terrain_cm: f64) {
        self.terrain_target_u_cm = terrain_cm;
    }

    fn pos_terrain_u_cm(&self) -> f64 {
        self.terrain_u_cm
    }

    fn vel_terrain_u_cms(&self) -> f64 {
        self.terrain_vel_u_cms
    }

    fn accel_terrain_u_cmss(&self) -> f64 {
        self.terrain_accel_u_cmss
    }

    fn stopping_point_ne_cm(&self) -> Vector2<f64> {
        let pos = ne(&self.pos_neu_cm);
        let vel = ne(&self.vel_neu_cms);

        if self.max_accel_ne_cmss <= 0.0 {
            return pos;
        }

        pos + vel * (vel.norm() / (2.0 * self.max_accel_ne_cmss))
    }

    fn stopping_point_u_cm(&self) -> f64 {
        if self.max_accel_u_cmss <= 0.0 {
            return self.pos_neu_cm.z;
        }

        let vel = self.vel_neu_cms.z;
        self.pos_neu_cm.z + vel * vel.abs() / (2.0 * self.max_accel_u_cmss)
    }

    fn pos_estimate_neu_cm(&self) -> Vector3<f64> {
        self.pos_neu_cm
    }

    fn vel_estimate_neu_cms(&self) -> Vector3<f64> {
        self.vel_neu_cms
    }

    fn vel_desired_neu_cms(&self) -> Vector3<f64> {
        self.vel_target_neu_cms
    }

    fn pos_error_neu_cm(&self) -> Vector3<f64> {
        self.pos_target_neu_cm - self.pos_neu_cm
    }

    fn pos_ne_p(&self) -> f64 {
        self.pos_ne_p
    }

    fn dt_s(&self) -> f64 {
        self.dt_s
    }

    fn roll_rad(&self) -> f64 {
        let accel_right = -self.accel_target_neu_cmss.x * self.yaw_rad.sin()
            + self.accel_target_neu_cmss.y * self.yaw_rad.cos();
        (accel_right * self.pitch_rad().cos() / GRAVITY_CMSS).atan()
    }

    fn pitch_rad(&self) -> f64 {
        let accel_forward = self.accel_target_neu_cmss.x * self.yaw_rad.cos()
            + self.accel_target_neu_cmss.y * self.yaw_rad.sin();
        (-accel_forward / GRAVITY_CMSS).atan()
    }

    fn yaw_rad(&self) -> f64 {
        self.yaw_rad
    }

    fn thrust_vector(&self) -> Vector3<f64> {
        let thrust = Vector3::new(
            self.accel_target_neu_cmss.x,
            self.accel_target_neu_cmss.y,
            GRAVITY_CMSS + self.accel_target_neu_cmss.z
        );
        thrust / thrust.norm()
    }

    fn crosstrack_error_cm(&self) -> f64 {
        let err = ne(&self.pos_error_neu_cm());
        let vel = ne(&self.vel_target_neu_cms);

        if vel.norm_squared() <= LENGTH_SQ_EPSILON {
            return err.norm();
        }

        let along = err.dot(&vel.normalize());
        (err.norm_squared() - along * along).max(0.0).sqrt()
    }
}

impl ManualClock {
    pub fn new(now_ms: u64) -> Self {
        Self {
            now_ms: Cell::new(now_ms),
        }
    }

    pub fn set_ms(&self, now_ms: u64) {
        self.now_ms.set(now_ms);
    }

    pub fn advance_ms(&self, dt_ms: u64) {
        self.now_ms.set(self.now_ms.get() + dt_ms);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now_ms.get()
    }
}

impl PerlinTerrain {
    pub fn new(params: TerrainParams) -> Self {
        Self {
            perlin: Perlin::new().set_seed(params.seed),
            params,
        }
    }

    /// Terrain height above the origin, ignoring the data extent.
    ///
    /// Units: centimetres
    pub fn height_cm(&self, pos_ne_cm: &Vector2<f64>) -> f64 {
        let scale = if self.params.wavelength_cm > 0.0 {
            1.0 / self.params.wavelength_cm
        }
        else {
            0.0
        };

        self.params.base_cm
            + self.params.amplitude_cm * self.perlin.get([pos_ne_cm.x * scale, pos_ne_cm.y * scale])
    }
}

impl TerrainDatabase for PerlinTerrain {
    fn height_above_origin_cm(&self, pos_ne_cm: &Vector2<f64>) -> Option<f64> {
        if pos_ne_cm.norm() > self.params.extent_cm {
            return None;
        }

        Some(self.height_cm(pos_ne_cm))
    }
}

// ---------------------------------------------------------------------------
// TESTS
// ---------------------------------------------------------------------------

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_vehicle_settles_on_target() {
        let mut sim = SimPosControl::new(Vector3::zeros(), 0.01, 1.0);
        let target = Vector3::new(100.0, -50.0, 20.0);
        sim.set_pos_vel_accel_neu_cm(&target, &Vector3::zeros(), &Vector3::zeros());

        for _ in 0..2000 {
            sim.update_ne_controller();
        }

        assert!((sim.pos_estimate_neu_cm() - target).norm() < 1e-3);
        assert!(sim.crosstrack_error_cm() < 1e-3);
    }

    #[test]
    fn test_stopping_point_ahead_of_motion() {
        let mut sim = SimPosControl::new(Vector3::zeros(), 0.01, 1.0);
        sim.set_max_speed_accel_ne_cm(500.0, 250.0);
        sim.set_pos_vel_accel_neu_cm(
            &Vector3::new(1000.0, 0.0, 0.0),
            &Vector3::new(500.0, 0.0, 0.0),
            &Vector3::zeros()
        );
        for _ in 0..10 {
            sim.update_ne_controller();
        }

        let v = sim.vel_estimate_neu_cms().x;
        let stop = sim.stopping_point_ne_cm();
        assert!(v > 0.0);
        assert!((stop.x - (sim.pos_estimate_neu_cm().x + v * v / 500.0)).abs() < 1e-9);
    }

    #[test]
    fn test_terrain_extent() {
        let terrain = PerlinTerrain::new(TerrainParams {
            seed: 1,
            wavelength_cm: 5000.0,
            amplitude_cm: 300.0,
            base_cm: 100.0,
            extent_cm: 10000.0,
        });

        let inside = Vector2::new(1234.0, 567.0);
        let h = terrain.height_above_origin_cm(&inside).unwrap();
        assert!(h >= 100.0 - 300.0 && h <= 100.0 + 300.0);
        assert!(terrain.height_above_origin_cm(&Vector2::new(20000.0, 0.0)).is_none());
    }

    #[test]
    fn test_manual_clock() {
        let clock = ManualClock::new(5);
        clock.advance_ms(10);
        assert_eq!(clock.now_ms(), 15);
        clock.set_ms(1);
        assert_eq!(clock.now_ms(), 1);
    }
}
