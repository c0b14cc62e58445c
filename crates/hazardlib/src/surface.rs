//! # Rupture surfaces
//!
//! The context builder only needs a rupture surface to answer distance and
//! geometry queries; [`RuptureSurface`] is that capability. [`PlanarSurface`]
//! is a rectangular fault plane evaluated in a local equirectangular frame,
//! accurate for the few-hundred-km distances hazard integration uses.
//!
//! ## Table of Contents
//! 1. RuptureSurface trait
//! 2. PlanarSurface
//! 3. Distance kernels

use std::fmt;

use crate::geo::{azimuth, LocalProjection, Point, DEGREES_TO_RAD};

// ============================================================================
// 1. RuptureSurface trait
// ============================================================================

/// Geometry queries a finite rupture must answer.
///
/// All distance methods take the surface locations of the sites and return one
/// value per site, in km.
pub trait RuptureSurface: Send + Sync + fmt::Debug {
    /// Closest distance to the rupture plane (rrup)
    fn min_distance(&self, lons: &[f64], lats: &[f64]) -> Vec<f64>;

    /// Closest distance to the surface projection of the rupture (rjb)
    fn joyner_boore_distance(&self, lons: &[f64], lats: &[f64]) -> Vec<f64>;

    /// Signed distance from the top edge line, positive on the hanging wall (rx)
    fn rx_distance(&self, lons: &[f64], lats: &[f64]) -> Vec<f64>;

    /// Distance beyond the along-strike ends of the rupture (ry0)
    fn ry0_distance(&self, lons: &[f64], lats: &[f64]) -> Vec<f64>;

    /// Azimuth of each site relative to the strike, seen from the first top corner
    fn azimuth(&self, lons: &[f64], lats: &[f64]) -> Vec<f64>;

    /// Azimuth from the closest rupture point to each site
    fn azimuth_of_closest_point(&self, lons: &[f64], lats: &[f64]) -> Vec<f64>;

    /// Closest rupture point to each site
    fn closest_points(&self, lons: &[f64], lats: &[f64]) -> Vec<Point>;

    /// Strike in decimal degrees
    fn strike(&self) -> f64;

    /// Dip in decimal degrees
    fn dip(&self) -> f64;

    /// Depth to the top of rupture (ztor)
    fn top_edge_depth(&self) -> f64;

    /// Depth to the bottom of rupture (zbor)
    fn bottom_edge_depth(&self) -> f64;

    /// Down-dip width
    fn width(&self) -> f64;

    /// Along-strike length
    fn length(&self) -> f64;

    /// True for single-plane rectangular surfaces
    fn is_planar(&self) -> bool {
        false
    }
}

// ============================================================================
// 2. PlanarSurface
// ============================================================================

/// Rectangular fault plane
#[derive(Debug, Clone, PartialEq)]
pub struct PlanarSurface {
    proj: LocalProjection,
    strike: f64,
    dip: f64,
    length: f64,
    width: f64,
    /// Local coordinates (east, north, depth) of the first top corner
    top_left: [f64; 3],
    along_strike: [f64; 3],
    down_dip: [f64; 3],
}

impl PlanarSurface {
    /// Plane centred on `centroid`, with the given orientation and dimensions
    pub fn new(centroid: Point, strike: f64, dip: f64, length: f64, width: f64) -> Self {
        let proj = LocalProjection::new(centroid.lon, centroid.lat);
        let (s, d) = Self::unit_vectors(strike, dip);
        let top_left = [
            -0.5 * length * s[0] - 0.5 * width * d[0],
            -0.5 * length * s[1] - 0.5 * width * d[1],
            centroid.depth - 0.5 * width * d[2],
        ];
        Self {
            proj,
            strike,
            dip,
            length,
            width,
            top_left,
            along_strike: s,
            down_dip: d,
        }
    }

    fn unit_vectors(strike: f64, dip: f64) -> ([f64; 3], [f64; 3]) {
        let (st, dp) = (strike * DEGREES_TO_RAD, dip * DEGREES_TO_RAD);
        let s = [st.sin(), st.cos(), 0.0];
        // horizontal direction perpendicular to strike, towards the hanging wall
        let h = [st.cos(), -st.sin()];
        let d = [h[0] * dp.cos(), h[1] * dp.cos(), dp.sin()];
        (s, d)
    }

    /// Location of the first top corner
    pub fn top_left(&self) -> Point {
        let (lon, lat) = self.proj.unproject(self.top_left[0], self.top_left[1]);
        Point::new(lon, lat, self.top_left[2])
    }

    /// Location of the centre of the plane
    pub fn centroid(&self) -> Point {
        let c = self.at(0.5 * self.length, 0.5 * self.width);
        let (lon, lat) = self.proj.unproject(c[0], c[1]);
        Point::new(lon, lat, c[2])
    }

    fn at(&self, u: f64, v: f64) -> [f64; 3] {
        let mut p = self.top_left;
        for (k, item) in p.iter_mut().enumerate() {
            *item += u * self.along_strike[k] + v * self.down_dip[k];
        }
        p
    }

    /// Plane coordinates (u along strike, v down dip) of a surface site
    /// relative to the first top corner, plus its local position
    fn plane_coords(&self, lon: f64, lat: f64) -> (f64, f64, [f64; 3]) {
        let (x, y) = self.proj.project(lon, lat);
        let site = [x, y, 0.0];
        let rel = [
            site[0] - self.top_left[0],
            site[1] - self.top_left[1],
            site[2] - self.top_left[2],
        ];
        (dot(&rel, &self.along_strike), dot(&rel, &self.down_dip), site)
    }

    /// Horizontal coordinates (along strike, perpendicular) of a site
    fn horizontal_coords(&self, lon: f64, lat: f64) -> (f64, f64) {
        let (x, y) = self.proj.project(lon, lat);
        let (rx, ry) = (x - self.top_left[0], y - self.top_left[1]);
        let st = self.strike * DEGREES_TO_RAD;
        (rx * st.sin() + ry * st.cos(), rx * st.cos() - ry * st.sin())
    }

    fn closest_local(&self, lon: f64, lat: f64) -> ([f64; 3], [f64; 3]) {
        let (u, v, site) = self.plane_coords(lon, lat);
        let p = self.at(u.clamp(0.0, self.length), v.clamp(0.0, self.width));
        (p, site)
    }
}

// ============================================================================
// 3. Distance kernels
// ============================================================================

fn dot(a: &[f64; 3], b: &[f64; 3]) -> f64 {
    a[0] * b[0] + a[1] * b[1] + a[2] * b[2]
}

fn outside(x: f64, lo: f64, hi: f64) -> f64 {
    if x < lo {
        lo - x
    } else if x > hi {
        x - hi
    } else {
        0.0
    }
}

impl RuptureSurface for PlanarSurface {
    fn min_distance(&self, lons: &[f64], lats: &[f64]) -> Vec<f64> {
        lons.iter()
            .zip(lats)
            .map(|(&lon, &lat)| {
                let (p, site) = self.closest_local(lon, lat);
                let d = [site[0] - p[0], site[1] - p[1], site[2] - p[2]];
                dot(&d, &d).sqrt()
            })
            .collect()
    }

    fn joyner_boore_distance(&self, lons: &[f64], lats: &[f64]) -> Vec<f64> {
        let proj_width = self.width * (self.dip * DEGREES_TO_RAD).cos();
        lons.iter()
            .zip(lats)
            .map(|(&lon, &lat)| {
                let (a, b) = self.horizontal_coords(lon, lat);
                let du = outside(a, 0.0, self.length);
                let dv = outside(b, 0.0, proj_width.max(0.0));
                (du * du + dv * dv).sqrt()
            })
            .collect()
    }

    fn rx_distance(&self, lons: &[f64], lats: &[f64]) -> Vec<f64> {
        lons.iter()
            .zip(lats)
            .map(|(&lon, &lat)| self.horizontal_coords(lon, lat).1)
            .collect()
    }

    fn ry0_distance(&self, lons: &[f64], lats: &[f64]) -> Vec<f64> {
        lons.iter()
            .zip(lats)
            .map(|(&lon, &lat)| outside(self.horizontal_coords(lon, lat).0, 0.0, self.length))
            .collect()
    }

    fn azimuth(&self, lons: &[f64], lats: &[f64]) -> Vec<f64> {
        let tl = self.top_left();
        lons.iter()
            .zip(lats)
            .map(|(&lon, &lat)| (azimuth(tl.lon, tl.lat, lon, lat) - self.strike).rem_euclid(360.0))
            .collect()
    }

    fn azimuth_of_closest_point(&self, lons: &[f64], lats: &[f64]) -> Vec<f64> {
        self.closest_points(lons, lats)
            .iter()
            .zip(lons.iter().zip(lats))
            .map(|(cp, (&lon, &lat))| azimuth(cp.lon, cp.lat, lon, lat))
            .collect()
    }

    fn closest_points(&self, lons: &[f64], lats: &[f64]) -> Vec<Point> {
        lons.iter()
            .zip(lats)
            .map(|(&lon, &lat)| {
                let (p, _) = self.closest_local(lon, lat);
                let (plon, plat) = self.proj.unproject(p[0], p[1]);
                Point::new(plon, plat, p[2])
            })
            .collect()
    }

    fn strike(&self) -> f64 {
        self.strike
    }

    fn dip(&self) -> f64 {
        self.dip
    }

    fn top_edge_depth(&self) -> f64 {
        self.top_left[2]
    }

    fn bottom_edge_depth(&self) -> f64 {
        self.top_left[2] + self.width * self.down_dip[2]
    }

    fn width(&self) -> f64 {
        self.width
    }

    fn length(&self) -> f64 {
        self.length
    }

    fn is_planar(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo::{point_at, KM_TO_DEGREES};
    use approx::assert_abs_diff_eq;

    // vertical strike-slip plane, 20 km long, 10 km wide, top at 2 km
    fn vertical() -> PlanarSurface {
        PlanarSurface::new(Point::new(0.0, 0.0, 7.0), 0.0, 90.0, 20.0, 10.0)
    }

    #[test]
    fn test_vertical_plane_geometry() {
        let s = vertical();
        assert_abs_diff_eq!(s.top_edge_depth(), 2.0, epsilon = 1e-9);
        assert_abs_diff_eq!(s.bottom_edge_depth(), 12.0, epsilon = 1e-9);
        let tl = s.top_left();
        assert_abs_diff_eq!(tl.lat, -10.0 * KM_TO_DEGREES, epsilon = 1e-9);
        assert_abs_diff_eq!(tl.lon, 0.0, epsilon = 1e-9);
    }

    #[test]
    fn test_distances_beside_vertical_plane() {
        let s = vertical();
        // 10 km east of the trace, at mid-length
        let lon = 10.0 * KM_TO_DEGREES;
        let rjb = s.joyner_boore_distance(&[lon], &[0.0]);
        let rrup = s.min_distance(&[lon], &[0.0]);
        let rx = s.rx_distance(&[lon], &[0.0]);
        let ry0 = s.ry0_distance(&[lon], &[0.0]);
        assert_abs_diff_eq!(rjb[0], 10.0, epsilon = 1e-6);
        assert_abs_diff_eq!(rrup[0], (100.0f64 + 4.0).sqrt(), epsilon = 1e-6);
        assert_abs_diff_eq!(rx[0], 10.0, epsilon = 1e-6);
        assert_abs_diff_eq!(ry0[0], 0.0, epsilon = 1e-9);
    }

    #[test]
    fn test_site_beyond_the_end() {
        let s = vertical();
        // 15 km north of the centroid, on the trace: 5 km past the end
        let lat = 15.0 * KM_TO_DEGREES;
        assert_abs_diff_eq!(s.ry0_distance(&[0.0], &[lat])[0], 5.0, epsilon = 1e-6);
        assert_abs_diff_eq!(s.joyner_boore_distance(&[0.0], &[lat])[0], 5.0, epsilon = 1e-6);
    }

    #[test]
    fn test_site_above_dipping_plane_has_zero_rjb() {
        let s = PlanarSurface::new(Point::new(10.0, 45.0, 10.0), 0.0, 45.0, 30.0, 20.0);
        let c = s.centroid();
        assert_abs_diff_eq!(c.depth, 10.0, epsilon = 1e-9);
        let rjb = s.joyner_boore_distance(&[c.lon], &[c.lat]);
        assert_abs_diff_eq!(rjb[0], 0.0, epsilon = 1e-9);
        let rrup = s.min_distance(&[c.lon], &[c.lat]);
        // distance from the surface point to a 45 degree plane through depth 10
        assert_abs_diff_eq!(rrup[0], 10.0 * (45.0f64 * DEGREES_TO_RAD).cos(), epsilon = 1e-6);
        assert!(s.is_planar());
    }

    #[test]
    fn test_closest_point_and_azimuth() {
        let s = vertical();
        let (lon, lat) = point_at(0.0, 0.0, 90.0, 30.0);
        let cp = s.closest_points(&[lon], &[lat]);
        assert_abs_diff_eq!(cp[0].lon, 0.0, epsilon = 1e-9);
        assert_abs_diff_eq!(cp[0].depth, 2.0, epsilon = 1e-9);
        let az = s.azimuth_of_closest_point(&[lon], &[lat]);
        assert_abs_diff_eq!(az[0], 90.0, epsilon = 1e-3);
    }
}
