//! Geodetic locations and their conversion into the local NEU frame.

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

use nalgebra::{Vector2, Vector3};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// DATA STRUCTURES
// ---------------------------------------------------------------------------

/// A geodetic location with an altitude in a given frame.
#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    /// Units: degrees
    pub lat_deg: f64,

    /// Units: degrees
    pub lon_deg: f64,

    /// Altitude in the frame given by `frame`.
    ///
    /// Units: centimetres
    pub alt_cm: f64,

    pub frame: AltFrame,
}

/// A flat earth local frame centred on a fixed origin.
///
/// Adequate over the few kilometres a single mission covers, north and east
/// offsets are scaled by the metres per degree at the origin's latitude.
#[derive(Debug, Default, Copy, Clone)]
pub struct FlatEarthFrame {
    /// The frame origin, `None` until the origin has been set.
    origin: Option<Location>,

    /// Altitude of home above the origin.
    ///
    /// Units: centimetres
    home_above_origin_cm: f64,
}

// ---------------------------------------------------------------------------
// ENUMERATIONS
// ---------------------------------------------------------------------------

/// The reference an altitude is measured from.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AltFrame {
    /// Above mean sea level.
    Absolute,

    /// Above the home position.
    AboveHome,

    /// Above the local frame origin.
    AboveOrigin,

    /// Above the terrain directly below the location.
    AboveTerrain,
}

// ---------------------------------------------------------------------------
// TRAITS
// ---------------------------------------------------------------------------

/// Conversion between geodetic locations and the local NEU frame.
///
/// All methods fail with `None` while the frame origin is undefined.
pub trait LocalFrame {
    /// North and east offset of the location from the origin.
    fn vector_ne_from_origin_cm(&self, loc: &Location) -> Option<Vector2<f64>>;

    /// Altitude of the location above the origin. Not defined for
    /// terrain-relative locations.
    fn alt_above_origin_cm(&self, loc: &Location) -> Option<f64>;

    /// The location of a local vector, with the altitude in the given frame.
    ///
    /// `frame` must be either `AboveOrigin` or `AboveTerrain`, in which case
    /// the vector's `z` is taken to be already relative to that frame.
    fn location_from_vector_neu_cm(&self, vec: &Vector3<f64>, frame: AltFrame) -> Option<Location>;

    /// The local vector of a location, and whether its altitude is terrain
    /// relative.
    ///
    /// Terrain-relative locations keep their altitude above terrain as `z`,
    /// all others are converted to altitude above the origin.
    fn vector_neu_from_origin_cm(&self, loc: &Location) -> Option<(Vector3<f64>, bool)> {
        let ne = self.vector_ne_from_origin_cm(loc)?;

        if loc.frame == AltFrame::AboveTerrain {
            Some((Vector3::new(ne.x, ne.y, loc.alt_cm), true))
        }
        else {
            let alt = self.alt_above_origin_cm(loc)?;
            Some((Vector3::new(ne.x, ne.y, alt), false))
        }
    }
}

// ---------------------------------------------------------------------------
// IMPLEMENTATIONS
// ---------------------------------------------------------------------------

impl Location {
    pub fn new(lat_deg: f64, lon_deg: f64, alt_cm: f64, frame: AltFrame) -> Self {
        Self {
            lat_deg,
            lon_deg,
            alt_cm,
            frame,
        }
    }
}

impl FlatEarthFrame {
    /// Create a frame with no origin set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a frame centred on `origin`, whose altitude must be absolute.
    pub fn with_origin(origin: Location, home_above_origin_cm: f64) -> Self {
        Self {
            origin: Some(Location {
                frame: AltFrame::Absolute,
                ..origin
            }),
            home_above_origin_cm,
        }
    }

    pub fn origin(&self) -> Option<&Location> {
        self.origin.as_ref()
    }
}

impl LocalFrame for FlatEarthFrame {
    fn vector_ne_from_origin_cm(&self, loc: &Location) -> Option<Vector2<f64>> {
        let origin = self.origin?;

        let north_m = (loc.lat_deg - origin.lat_deg) * meters_per_deg_lat(origin.lat_deg);
        let east_m = (loc.lon_deg - origin.lon_deg) * meters_per_deg_lon(origin.lat_deg);

        Some(Vector2::new(north_m, east_m) * 100.0)
    }

    fn alt_above_origin_cm(&self, loc: &Location) -> Option<f64> {
        let origin = self.origin?;

        match loc.frame {
            AltFrame::Absolute => Some(loc.alt_cm - origin.alt_cm),
            AltFrame::AboveHome => Some(loc.alt_cm + self.home_above_origin_cm),
            AltFrame::AboveOrigin => Some(loc.alt_cm),
            AltFrame::AboveTerrain => None,
        }
    }

    fn location_from_vector_neu_cm(&self, vec: &Vector3<f64>, frame: AltFrame) -> Option<Location> {
        let origin = self.origin?;

        let lat_deg = origin.lat_deg + vec.x * 0.01 / meters_per_deg_lat(origin.lat_deg).max(1e-9);
        let lon_deg = origin.lon_deg + vec.y * 0.01 / meters_per_deg_lon(origin.lat_deg).max(1e-9);

        let frame = match frame {
            AltFrame::AboveTerrain => AltFrame::AboveTerrain,
            _ => AltFrame::AboveOrigin,
        };

        Some(Location::new(lat_deg, lon_deg, vec.z, frame))
    }
}

// ---------------------------------------------------------------------------
// PUBLIC FUNCTIONS
// ---------------------------------------------------------------------------

/// Metres per degree of latitude at a given latitude (WGS84 approximation).
pub fn meters_per_deg_lat(lat_deg: f64) -> f64 {
    let lat_rad = lat_deg.to_radians();
    111_132.954 - 559.822 * (2.0 * lat_rad).cos() + 1.175 * (4.0 * lat_rad).cos()
        - 0.0023 * (6.0 * lat_rad).cos()
}

/// Metres per degree of longitude at a given latitude (WGS84 approximation).
pub fn meters_per_deg_lon(lat_deg: f64) -> f64 {
    let lat_rad = lat_deg.to_radians();
    111_412.84 * lat_rad.cos() - 93.5 * (3.0 * lat_rad).cos() + 0.118 * (5.0 * lat_rad).cos()
}

// ---------------------------------------------------------------------------
// TESTS
// ---------------------------------------------------------------------------

#[cfg(test)]
mod test {
    use super::*;

    fn frame() -> FlatEarthFrame {
        FlatEarthFrame::with_origin(Location::new(52.0, -1.0, 10000.0, AltFrame::Absolute), 500.0)
    }

    #[test]
    fn test_no_origin() {
        let f = FlatEarthFrame::new();
        let loc = Location::new(52.0, -1.0, 0.0, AltFrame::AboveOrigin);
        assert!(f.vector_ne_from_origin_cm(&loc).is_none());
        assert!(f.vector_neu_from_origin_cm(&loc).is_none());
        assert!(f.location_from_vector_neu_cm(&Vector3::zeros(), AltFrame::AboveOrigin).is_none());
    }

    #[test]
    fn test_round_trip() {
        let f = frame();
        let v = Vector3::new(12345.0, -6789.0, 1500.0);
        let loc = f.location_from_vector_neu_cm(&v, AltFrame::AboveOrigin).unwrap();
        let (back, terrain) = f.vector_neu_from_origin_cm(&loc).unwrap();
        assert!(!terrain);
        assert!((back - v).norm() < 1e-6);
    }

    #[test]
    fn test_alt_frames() {
        let f = frame();
        let abs = Location::new(52.0, -1.0, 12000.0, AltFrame::Absolute);
        let home = Location::new(52.0, -1.0, 1000.0, AltFrame::AboveHome);
        let terrain = Location::new(52.0, -1.0, 3000.0, AltFrame::AboveTerrain);

        assert_eq!(f.alt_above_origin_cm(&abs), Some(2000.0));
        assert_eq!(f.alt_above_origin_cm(&home), Some(1500.0));
        assert_eq!(f.alt_above_origin_cm(&terrain), None);

        let (v, is_terrain) = f.vector_neu_from_origin_cm(&terrain).unwrap();
        assert!(is_terrain);
        assert_eq!(v.z, 3000.0);
    }
}
