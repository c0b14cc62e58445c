//! # Geodesy helpers
//!
//! Spherical-earth distances and azimuths, antimeridian handling and a local
//! equirectangular projection used by the planar rupture surface.
//!
//! ## Table of Contents
//! 1. Constants
//! 2. Point
//! 3. Great-circle functions
//! 4. Antimeridian helpers
//! 5. LocalProjection

use serde::{Deserialize, Serialize};

// ============================================================================
// 1. Constants
// ============================================================================

/// Mean earth radius in km
pub const EARTH_RADIUS: f64 = 6371.0;

/// Degrees of arc per km along a great circle
pub const KM_TO_DEGREES: f64 = 0.0089932;

/// Degrees to radians
pub const DEGREES_TO_RAD: f64 = std::f64::consts::PI / 180.0;

// ============================================================================
// 2. Point
// ============================================================================

/// A geographic point: longitude and latitude in degrees, depth in km
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    /// Longitude in decimal degrees
    pub lon: f64,
    /// Latitude in decimal degrees
    pub lat: f64,
    /// Depth below the surface in km (positive down)
    #[serde(default)]
    pub depth: f64,
}

impl Point {
    /// Create a point
    pub fn new(lon: f64, lat: f64, depth: f64) -> Self {
        Self { lon, lat, depth }
    }

    /// Surface distance to another point, ignoring depths
    pub fn epicentral_distance(&self, other: &Point) -> f64 {
        geodetic_distance(self.lon, self.lat, other.lon, other.lat)
    }

    /// Straight-line distance to another point, accounting for depths
    pub fn distance(&self, other: &Point) -> f64 {
        let h = self.epicentral_distance(other);
        let v = self.depth - other.depth;
        (h * h + v * v).sqrt()
    }

    /// Distances from this point to a set of surface locations.
    ///
    /// With `with_depths` the distance is hypocentral (sites are assumed at
    /// the surface), otherwise epicentral.
    pub fn distance_to_mesh(&self, lons: &[f64], lats: &[f64], with_depths: bool) -> Vec<f64> {
        lons.iter()
            .zip(lats)
            .map(|(&lon, &lat)| {
                let h = geodetic_distance(self.lon, self.lat, lon, lat);
                if with_depths {
                    (h * h + self.depth * self.depth).sqrt()
                } else {
                    h
                }
            })
            .collect()
    }
}

// ============================================================================
// 3. Great-circle functions
// ============================================================================

/// Haversine distance in km between two surface locations
pub fn geodetic_distance(lon1: f64, lat1: f64, lon2: f64, lat2: f64) -> f64 {
    let (lat1, lat2) = (lat1 * DEGREES_TO_RAD, lat2 * DEGREES_TO_RAD);
    let dlat = lat2 - lat1;
    let dlon = (lon2 - lon1) * DEGREES_TO_RAD;
    let a = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS * a.sqrt().min(1.0).asin()
}

/// Forward azimuth in decimal degrees [0, 360) from the first location to the second
pub fn azimuth(lon1: f64, lat1: f64, lon2: f64, lat2: f64) -> f64 {
    let (lat1, lat2) = (lat1 * DEGREES_TO_RAD, lat2 * DEGREES_TO_RAD);
    let dlon = (lon2 - lon1) * DEGREES_TO_RAD;
    let y = dlon.sin() * lat2.cos();
    let x = lat1.cos() * lat2.sin() - lat1.sin() * lat2.cos() * dlon.cos();
    (y.atan2(x) / DEGREES_TO_RAD).rem_euclid(360.0)
}

/// Location reached travelling `distance` km from a point along `azimuth` degrees
pub fn point_at(lon: f64, lat: f64, azimuth: f64, distance: f64) -> (f64, f64) {
    let lat1 = lat * DEGREES_TO_RAD;
    let lon1 = lon * DEGREES_TO_RAD;
    let az = azimuth * DEGREES_TO_RAD;
    let delta = distance / EARTH_RADIUS;
    let lat2 = (lat1.sin() * delta.cos() + lat1.cos() * delta.sin() * az.cos()).asin();
    let lon2 = lon1
        + (az.sin() * delta.sin() * lat1.cos()).atan2(delta.cos() - lat1.sin() * lat2.sin());
    let lon2 = normalize_lon(lon2 / DEGREES_TO_RAD);
    (lon2, lat2 / DEGREES_TO_RAD)
}

/// Longitudinal width in degrees of `km` kilometres at the given latitude
pub fn angular_distance(km: f64, lat: f64) -> f64 {
    km * KM_TO_DEGREES / (lat * DEGREES_TO_RAD).cos()
}

/// Wrap a longitude into [-180, 180)
pub fn normalize_lon(lon: f64) -> f64 {
    (lon + 180.0).rem_euclid(360.0) - 180.0
}

// ============================================================================
// 4. Antimeridian helpers
// ============================================================================

/// True if the longitudes span the international date line: the extremes have
/// opposite signs and are more than 180 degrees apart.
pub fn cross_idl(lons: &[f64]) -> bool {
    let (mut l1, mut l2) = (f64::INFINITY, f64::NEG_INFINITY);
    for &lon in lons {
        l1 = l1.min(lon);
        l2 = l2.max(lon);
    }
    l1 * l2 < 0.0 && (l1 - l2).abs() > 180.0
}

/// Signed longitudinal extent from `lon1` to `lon2`, in [-180, 180).
///
/// Positive when `lon2` lies east of `lon1` along the shorter arc.
pub fn get_longitudinal_extent(lon1: f64, lon2: f64) -> f64 {
    (lon2 - lon1 + 180.0).rem_euclid(360.0) - 180.0
}

// ============================================================================
// 5. LocalProjection
// ============================================================================

/// Equirectangular projection to km around a reference location
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LocalProjection {
    lon0: f64,
    lat0: f64,
    cos_lat0: f64,
}

impl LocalProjection {
    /// Projection centred on the given location
    pub fn new(lon0: f64, lat0: f64) -> Self {
        Self {
            lon0,
            lat0,
            cos_lat0: (lat0 * DEGREES_TO_RAD).cos(),
        }
    }

    /// Geographic to local (east, north) km
    pub fn project(&self, lon: f64, lat: f64) -> (f64, f64) {
        let dlon = get_longitudinal_extent(self.lon0, lon);
        let x = dlon * self.cos_lat0 / KM_TO_DEGREES;
        let y = (lat - self.lat0) / KM_TO_DEGREES;
        (x, y)
    }

    /// Local (east, north) km to geographic
    pub fn unproject(&self, x: f64, y: f64) -> (f64, f64) {
        let lon = normalize_lon(self.lon0 + x * KM_TO_DEGREES / self.cos_lat0);
        let lat = self.lat0 + y * KM_TO_DEGREES;
        (lon, lat)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_geodetic_distance_one_degree() {
        // one degree of latitude is ~111.19 km on the mean sphere
        let d = geodetic_distance(0.0, 0.0, 0.0, 1.0);
        assert_abs_diff_eq!(d, 111.1949, epsilon = 1e-3);
        assert_abs_diff_eq!(geodetic_distance(10.0, 45.0, 10.0, 45.0), 0.0);
    }

    #[test]
    fn test_azimuth_cardinal_directions() {
        assert_abs_diff_eq!(azimuth(0.0, 0.0, 0.0, 1.0), 0.0, epsilon = 1e-9);
        assert_abs_diff_eq!(azimuth(0.0, 0.0, 1.0, 0.0), 90.0, epsilon = 1e-9);
        assert_abs_diff_eq!(azimuth(0.0, 0.0, 0.0, -1.0), 180.0, epsilon = 1e-9);
        assert_abs_diff_eq!(azimuth(0.0, 0.0, -1.0, 0.0), 270.0, epsilon = 1e-9);
    }

    #[test]
    fn test_point_at_round_trip() {
        let (lon, lat) = point_at(10.0, 45.0, 60.0, 25.0);
        assert_abs_diff_eq!(geodetic_distance(10.0, 45.0, lon, lat), 25.0, epsilon = 1e-6);
        assert_abs_diff_eq!(azimuth(10.0, 45.0, lon, lat), 60.0, epsilon = 1e-2);
    }

    #[test]
    fn test_cross_idl() {
        assert!(cross_idl(&[179.5, -179.5]));
        assert!(!cross_idl(&[-10.0, 10.0]));
        assert!(!cross_idl(&[170.0, 179.0]));
    }

    #[test]
    fn test_longitudinal_extent_across_idl() {
        assert_abs_diff_eq!(get_longitudinal_extent(179.0, -179.0), 2.0);
        assert_abs_diff_eq!(get_longitudinal_extent(-179.0, 179.0), -2.0);
        assert_abs_diff_eq!(get_longitudinal_extent(10.0, 20.0), 10.0);
    }

    #[test]
    fn test_local_projection_inverse() {
        let proj = LocalProjection::new(179.9, -17.0);
        let (x, y) = proj.project(-179.8, -16.9);
        assert!(x > 0.0 && y > 0.0);
        let (lon, lat) = proj.unproject(x, y);
        assert_abs_diff_eq!(lon, -179.8, epsilon = 1e-9);
        assert_abs_diff_eq!(lat, -16.9, epsilon = 1e-9);
    }
}
