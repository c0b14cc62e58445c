//! Site collections
//!
//! A [`SiteCollection`] is a columnar set of sites with stable integer ids.
//! Filtering keeps the ids, so results computed on a filtered collection can
//! always be scattered back onto the complete one.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{HazardError, Result};
use crate::geo::{geodetic_distance, Point};

/// Site parameters a ground motion model may declare as required
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum SiteParam {
    /// Average shear-wave velocity in the top 30 m (m/s)
    Vs30,
    /// 1 if vs30 was measured, 0 if inferred
    Vs30Measured,
    /// Depth to the 1.0 km/s shear-wave horizon (m)
    Z1pt0,
    /// Depth to the 2.5 km/s shear-wave horizon (km)
    Z2pt5,
}

impl SiteParam {
    /// All known site parameters
    pub const ALL: [SiteParam; 4] = [
        SiteParam::Vs30,
        SiteParam::Vs30Measured,
        SiteParam::Z1pt0,
        SiteParam::Z2pt5,
    ];

    /// Canonical name
    pub fn name(&self) -> &'static str {
        match self {
            SiteParam::Vs30 => "vs30",
            SiteParam::Vs30Measured => "vs30measured",
            SiteParam::Z1pt0 => "z1pt0",
            SiteParam::Z2pt5 => "z2pt5",
        }
    }
}

impl FromStr for SiteParam {
    type Err = HazardError;

    fn from_str(s: &str) -> Result<Self> {
        SiteParam::ALL
            .iter()
            .copied()
            .find(|p| p.name() == s)
            .ok_or_else(|| HazardError::UnknownSiteParameter(s.to_string()))
    }
}

impl fmt::Display for SiteParam {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A single site with its soil parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Site {
    /// Location of the site (depth is normally zero)
    pub location: Point,
    /// Vs30 in m/s
    pub vs30: f64,
    /// Whether vs30 was measured
    #[serde(default)]
    pub vs30measured: bool,
    /// Z1.0 in m
    #[serde(default = "default_z1pt0")]
    pub z1pt0: f64,
    /// Z2.5 in km
    #[serde(default = "default_z2pt5")]
    pub z2pt5: f64,
}

fn default_z1pt0() -> f64 {
    40.0
}

fn default_z2pt5() -> f64 {
    1.0
}

impl Site {
    /// A site with the given location and vs30, other parameters defaulted
    pub fn new(location: Point, vs30: f64) -> Self {
        Self {
            location,
            vs30,
            vs30measured: false,
            z1pt0: default_z1pt0(),
            z2pt5: default_z2pt5(),
        }
    }

    fn param(&self, par: SiteParam) -> f64 {
        match par {
            SiteParam::Vs30 => self.vs30,
            SiteParam::Vs30Measured => f64::from(u8::from(self.vs30measured)),
            SiteParam::Z1pt0 => self.z1pt0,
            SiteParam::Z2pt5 => self.z2pt5,
        }
    }
}

/// Columnar collection of sites with stable ids
#[derive(Debug, Clone, PartialEq)]
pub struct SiteCollection {
    sids: Vec<u32>,
    lons: Vec<f64>,
    lats: Vec<f64>,
    params: BTreeMap<SiteParam, Vec<f64>>,
    total: usize,
}

impl SiteCollection {
    /// Build a complete collection; site ids are the positions in `sites`
    pub fn new(sites: &[Site]) -> Self {
        let params = SiteParam::ALL
            .iter()
            .map(|&p| (p, sites.iter().map(|s| s.param(p)).collect()))
            .collect();
        Self {
            sids: (0..sites.len() as u32).collect(),
            lons: sites.iter().map(|s| s.location.lon).collect(),
            lats: sites.iter().map(|s| s.location.lat).collect(),
            params,
            total: sites.len(),
        }
    }

    /// Number of sites in this (possibly filtered) collection
    pub fn len(&self) -> usize {
        self.sids.len()
    }

    /// True if no site survived filtering
    pub fn is_empty(&self) -> bool {
        self.sids.is_empty()
    }

    /// Number of sites in the complete collection this one was filtered from
    pub fn total_sites(&self) -> usize {
        self.total
    }

    /// Site ids
    pub fn sids(&self) -> &[u32] {
        &self.sids
    }

    /// Longitudes
    pub fn lons(&self) -> &[f64] {
        &self.lons
    }

    /// Latitudes
    pub fn lats(&self) -> &[f64] {
        &self.lats
    }

    /// Location of the i-th site of this collection
    pub fn location(&self, i: usize) -> Point {
        Point::new(self.lons[i], self.lats[i], 0.0)
    }

    /// Values of a site parameter, one per site
    pub fn param(&self, par: SiteParam) -> &[f64] {
        self.params.get(&par).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Values of a site parameter looked up by name
    pub fn param_by_name(&self, name: &str) -> Result<&[f64]> {
        let par: SiteParam = name.parse()?;
        Ok(self.param(par))
    }

    /// Keep the sites where `mask` is true
    pub fn filter(&self, mask: &[bool]) -> SiteCollection {
        let pick = |v: &[f64]| -> Vec<f64> {
            v.iter()
                .zip(mask)
                .filter_map(|(&x, &m)| m.then_some(x))
                .collect()
        };
        SiteCollection {
            sids: self
                .sids
                .iter()
                .zip(mask)
                .filter_map(|(&s, &m)| m.then_some(s))
                .collect(),
            lons: pick(&self.lons),
            lats: pick(&self.lats),
            params: self.params.iter().map(|(&p, v)| (p, pick(v))).collect(),
            total: self.total,
        }
    }

    /// Keep the sites with the given positions in this collection
    pub fn take(&self, indices: &[usize]) -> SiteCollection {
        let mut mask = vec![false; self.len()];
        for &i in indices {
            mask[i] = true;
        }
        self.filter(&mask)
    }

    /// Split into (close, far) sites with respect to a location.
    ///
    /// A site is close when its epicentral distance is strictly below
    /// `distance`. Empty halves are returned as `None`.
    pub fn split(
        &self,
        location: &Point,
        distance: f64,
    ) -> (Option<SiteCollection>, Option<SiteCollection>) {
        let dists = location.distance_to_mesh(&self.lons, &self.lats, false);
        let close: Vec<bool> = dists.iter().map(|&d| d < distance).collect();
        let far: Vec<bool> = close.iter().map(|c| !c).collect();
        let wrap = |mask: &[bool]| {
            if mask.iter().any(|&m| m) {
                Some(self.filter(mask))
            } else {
                None
            }
        };
        (wrap(&close), wrap(&far))
    }

    /// A collection containing only the first site
    pub fn one(&self) -> SiteCollection {
        let mut mask = vec![false; self.len()];
        if let Some(first) = mask.first_mut() {
            *first = true;
        }
        let mut one = self.filter(&mask);
        one.total = one.len();
        one
    }

    /// Epicentral distances from each site to a location
    pub fn distances_to(&self, lon: f64, lat: f64) -> Vec<f64> {
        self.lons
            .iter()
            .zip(&self.lats)
            .map(|(&lo, &la)| geodetic_distance(lo, la, lon, lat))
            .collect()
    }
}
