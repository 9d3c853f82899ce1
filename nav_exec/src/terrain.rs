//! Terrain offset resolution
//!
//! Terrain-relative altitudes are flown by adding the terrain's height above
//! the frame origin to the target altitude. The height comes from the
//! rangefinder when it is enabled and healthy, and from the terrain database
//! otherwise.

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

use log::trace;
use nalgebra::Vector2;
use serde::Serialize;
use thiserror::Error;

use crate::interfaces::TerrainDatabase;
use util::maths::clamp;

// ---------------------------------------------------------------------------
// CONSTANTS
// ---------------------------------------------------------------------------

/// Smallest terrain margin which will be used.
///
/// Units: metres
pub const TERRAIN_MARGIN_MIN_M: f64 = 0.1;

/// Lower bound of the margin time scaler, so that progress never stops
/// completely.
const MARGIN_SCALER_MIN: f64 = 0.01;

// ---------------------------------------------------------------------------
// DATA STRUCTURES
// ---------------------------------------------------------------------------

/// Resolves the terrain offset from the latest rangefinder data or a terrain
/// database.
#[derive(Debug, Clone)]
pub struct TerrainResolver {
    /// Whether the rangefinder may be used for terrain following at all.
    rangefinder_use: bool,

    /// Whether the owner currently has the rangefinder enabled.
    rangefinder_available: bool,

    rangefinder_healthy: bool,

    /// Latest rangefinder terrain height above the origin.
    ///
    /// Units: centimetres
    rangefinder_terrain_offset_cm: f64,

    /// Units: metres
    margin_m: f64,
}

/// A resolved terrain offset.
#[derive(Debug, Copy, Clone, PartialEq, Serialize)]
pub struct TerrainSample {
    /// Terrain height above the frame origin.
    ///
    /// Units: centimetres
    pub offset_cm: f64,

    pub source: TerrainSource,
}

// ---------------------------------------------------------------------------
// ENUMERATIONS
// ---------------------------------------------------------------------------

/// Where terrain data for terrain-relative altitudes comes from.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
pub enum TerrainSource {
    Unavailable,
    Rangefinder,
    TerrainDatabase,
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum TerrainError {
    #[error("No terrain source is available")]
    Unavailable,

    #[error("The terrain database holds no data at ({0:.0}, {1:.0}) cm")]
    NoData(f64, f64),
}

// ---------------------------------------------------------------------------
// IMPLEMENTATIONS
// ---------------------------------------------------------------------------

impl TerrainResolver {
    pub fn new(rangefinder_use: bool, margin_m: f64) -> Self {
        Self {
            rangefinder_use,
            rangefinder_available: false,
            rangefinder_healthy: false,
            rangefinder_terrain_offset_cm: 0.0,
            margin_m,
        }
    }

    /// Provide the latest rangefinder based terrain offset.
    ///
    /// `offset_cm` is the terrain's height above the frame origin.
    pub fn set_rangefinder_terrain_offset_cm(&mut self, available: bool, healthy: bool, offset_cm: f64) {
        self.rangefinder_available = available;
        self.rangefinder_healthy = healthy;
        self.rangefinder_terrain_offset_cm = offset_cm;
    }

    /// True if the rangefinder may be used for terrain following.
    pub fn rangefinder_used(&self) -> bool {
        self.rangefinder_use
    }

    pub fn rangefinder_used_and_healthy(&self) -> bool {
        self.rangefinder_use && self.rangefinder_healthy
    }

    pub fn set_rangefinder_use(&mut self, rangefinder_use: bool) {
        self.rangefinder_use = rangefinder_use;
    }

    /// The source a terrain-relative command would use.
    pub fn terrain_source(&self, db: Option<&dyn TerrainDatabase>) -> TerrainSource {
        if self.rangefinder_available && self.rangefinder_use {
            TerrainSource::Rangefinder
        }
        else if db.is_some() {
            TerrainSource::TerrainDatabase
        }
        else {
            TerrainSource::Unavailable
        }
    }

    /// Look up the terrain height above the origin at a horizontal position.
    pub fn sample(
        &self,
        pos_ne_cm: &Vector2<f64>,
        db: Option<&dyn TerrainDatabase>
    ) -> Result<TerrainSample, TerrainError> {
        if self.rangefinder_available && self.rangefinder_use && self.rangefinder_healthy {
            return Ok(TerrainSample {
                offset_cm: self.rangefinder_terrain_offset_cm,
                source: TerrainSource::Rangefinder,
            });
        }

        match db {
            Some(db) => match db.height_above_origin_cm(pos_ne_cm) {
                Some(offset_cm) => Ok(TerrainSample {
                    offset_cm,
                    source: TerrainSource::TerrainDatabase,
                }),
                None => {
                    trace!("No terrain data at {:?}", pos_ne_cm);
                    Err(TerrainError::NoData(pos_ne_cm.x, pos_ne_cm.y))
                }
            },
            None => Err(TerrainError::Unavailable),
        }
    }

    /// The offset to add to a target altitude.
    ///
    /// Zero for altitudes above the origin, otherwise the terrain height at
    /// `pos_ne_cm`.
    pub fn resolve(
        &self,
        pos_ne_cm: &Vector2<f64>,
        terrain_alt: bool,
        db: Option<&dyn TerrainDatabase>
    ) -> Result<f64, TerrainError> {
        if !terrain_alt {
            return Ok(0.0);
        }

        self.sample(pos_ne_cm, db).map(|s| s.offset_cm)
    }

    /// Terrain following margin, never below [`TERRAIN_MARGIN_MIN_M`].
    ///
    /// Units: metres
    pub fn margin_m(&self) -> f64 {
        self.margin_m.max(TERRAIN_MARGIN_MIN_M)
    }

    pub fn set_margin_m(&mut self, margin_m: f64) {
        self.margin_m = margin_m;
    }

    /// Time scaler for a vertical error from the terrain-relative target.
    ///
    /// One while the error is within half the margin, falling linearly to
    /// a small floor as the error reaches the full margin.
    pub fn margin_scaler(&self, alt_error_cm: f64) -> f64 {
        let margin_cm = self.margin_m() * 100.0;
        let half = 0.5 * margin_cm;

        clamp(&(1.0 - (alt_error_cm.abs() - half) / half), &MARGIN_SCALER_MIN, &1.0)
    }
}

// ---------------------------------------------------------------------------
// TESTS
// ---------------------------------------------------------------------------
