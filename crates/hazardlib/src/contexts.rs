//! # Context building
//!
//! Turns (rupture, site collection) pairs into [`RuptureContext`] records
//! carrying exactly the parameters the active ground motion models declare.
//!
//! ## Table of Contents
//! 1. Parameter names
//! 2. Requirements
//! 3. DistanceTable
//! 4. RuptureContext and its builder
//! 5. Equivalent distance tables
//! 6. ContextParams
//! 7. ContextMaker

use std::borrow::Cow;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use ndarray::{Array, Array2, Array3, ArrayView, Axis, Dimension};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::collapse;
use crate::error::{FarAwayRupture, HazardError, Result};
use crate::filters::{MagDepDistance, MagKey};
use crate::geo::azimuth;
use crate::gsim::GroundMotionModel;
use crate::imt::Imtls;
use crate::site::{SiteCollection, SiteParam};
use crate::source::{Occurrence, Rupture, SeismicSource};
use crate::stats::TruncatedNormal;
use crate::tom::PoissonTom;

// ============================================================================
// 1. Parameter names
// ============================================================================

/// Distance measures the context builder knows how to compute
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum DistanceParam {
    /// Closest distance to the rupture
    Rrup,
    /// Horizontal distance perpendicular to the strike
    Rx,
    /// Horizontal distance off the ends of the rupture
    Ry0,
    /// Joyner-Boore distance
    Rjb,
    /// Hypocentral distance
    Rhypo,
    /// Epicentral distance
    Repi,
    /// Azimuth from the rupture to the site
    Azimuth,
    /// Azimuth from the closest point of the rupture to the site
    AzimuthCp,
    /// Distance travelled through volcanic zones
    Rvolc,
}

impl DistanceParam {
    /// All known distance measures
    pub const ALL: [DistanceParam; 9] = [
        DistanceParam::Rrup,
        DistanceParam::Rx,
        DistanceParam::Ry0,
        DistanceParam::Rjb,
        DistanceParam::Rhypo,
        DistanceParam::Repi,
        DistanceParam::Azimuth,
        DistanceParam::AzimuthCp,
        DistanceParam::Rvolc,
    ];

    /// Canonical name
    pub fn name(&self) -> &'static str {
        match self {
            DistanceParam::Rrup => "rrup",
            DistanceParam::Rx => "rx",
            DistanceParam::Ry0 => "ry0",
            DistanceParam::Rjb => "rjb",
            DistanceParam::Rhypo => "rhypo",
            DistanceParam::Repi => "repi",
            DistanceParam::Azimuth => "azimuth",
            DistanceParam::AzimuthCp => "azimuth_cp",
            DistanceParam::Rvolc => "rvolc",
        }
    }

    /// Angles are not distances and are never rounded up
    pub fn is_angle(&self) -> bool {
        matches!(self, DistanceParam::Azimuth | DistanceParam::AzimuthCp)
    }
}

impl FromStr for DistanceParam {
    type Err = HazardError;

    fn from_str(s: &str) -> Result<Self> {
        DistanceParam::ALL
            .iter()
            .copied()
            .find(|p| p.name() == s)
            .ok_or_else(|| HazardError::UnknownDistance(s.to_string()))
    }
}

impl fmt::Display for DistanceParam {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Rupture-intrinsic parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum RuptureParam {
    /// Magnitude
    Mag,
    /// Strike of the surface
    Strike,
    /// Dip of the surface
    Dip,
    /// Rake
    Rake,
    /// Depth to the top of the rupture
    Ztor,
    /// Depth to the bottom of the rupture
    Zbor,
    /// Hypocenter longitude
    HypoLon,
    /// Hypocenter latitude
    HypoLat,
    /// Hypocenter depth
    HypoDepth,
    /// Down-dip width
    Width,
}

impl RuptureParam {
    /// All known rupture parameters
    pub const ALL: [RuptureParam; 10] = [
        RuptureParam::Mag,
        RuptureParam::Strike,
        RuptureParam::Dip,
        RuptureParam::Rake,
        RuptureParam::Ztor,
        RuptureParam::Zbor,
        RuptureParam::HypoLon,
        RuptureParam::HypoLat,
        RuptureParam::HypoDepth,
        RuptureParam::Width,
    ];

    /// Canonical name
    pub fn name(&self) -> &'static str {
        match self {
            RuptureParam::Mag => "mag",
            RuptureParam::Strike => "strike",
            RuptureParam::Dip => "dip",
            RuptureParam::Rake => "rake",
            RuptureParam::Ztor => "ztor",
            RuptureParam::Zbor => "zbor",
            RuptureParam::HypoLon => "hypo_lon",
            RuptureParam::HypoLat => "hypo_lat",
            RuptureParam::HypoDepth => "hypo_depth",
            RuptureParam::Width => "width",
        }
    }

    /// Parse a name declared by `model`
    pub fn parse(name: &str, model: &str) -> Result<Self> {
        RuptureParam::ALL
            .iter()
            .copied()
            .find(|p| p.name() == name)
            .ok_or_else(|| HazardError::UnknownRuptureParameter {
                model: model.to_string(),
                param: name.to_string(),
            })
    }

    /// Value of the parameter for a rupture; point ruptures are vertical
    /// with zero width at the hypocentral depth
    pub fn value(&self, rup: &Rupture) -> f64 {
        let surface = rup.surface.as_deref();
        match self {
            RuptureParam::Mag => rup.mag,
            RuptureParam::Rake => rup.rake,
            RuptureParam::HypoLon => rup.hypocenter.lon,
            RuptureParam::HypoLat => rup.hypocenter.lat,
            RuptureParam::HypoDepth => rup.hypocenter.depth,
            RuptureParam::Strike => surface.map_or(0.0, |s| s.strike()),
            RuptureParam::Dip => surface.map_or(90.0, |s| s.dip()),
            RuptureParam::Ztor => surface.map_or(rup.hypocenter.depth, |s| s.top_edge_depth()),
            RuptureParam::Zbor => surface.map_or(rup.hypocenter.depth, |s| s.bottom_edge_depth()),
            RuptureParam::Width => surface.map_or(0.0, |s| s.width()),
        }
    }
}

impl fmt::Display for RuptureParam {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Distances from a rupture to surface locations.
///
/// Ruptures without a surface measure every distance from the hypocenter.
pub fn get_distances(rup: &Rupture, lons: &[f64], lats: &[f64], param: DistanceParam) -> Vec<f64> {
    let hypo = &rup.hypocenter;
    let Some(surface) = rup.surface.as_deref() else {
        return match param {
            DistanceParam::Repi => hypo.distance_to_mesh(lons, lats, false),
            DistanceParam::Azimuth | DistanceParam::AzimuthCp => lons
                .iter()
                .zip(lats)
                .map(|(&lo, &la)| azimuth(hypo.lon, hypo.lat, lo, la))
                .collect(),
            DistanceParam::Rvolc => vec![0.0; lons.len()],
            _ => hypo.distance_to_mesh(lons, lats, true),
        };
    };
    match param {
        DistanceParam::Rrup => surface.min_distance(lons, lats),
        DistanceParam::Rx => surface.rx_distance(lons, lats),
        DistanceParam::Ry0 => surface.ry0_distance(lons, lats),
        DistanceParam::Rjb => surface.joyner_boore_distance(lons, lats),
        DistanceParam::Rhypo => hypo.distance_to_mesh(lons, lats, true),
        DistanceParam::Repi => hypo.distance_to_mesh(lons, lats, false),
        DistanceParam::Azimuth => surface.azimuth(lons, lats),
        DistanceParam::AzimuthCp => surface.azimuth_of_closest_point(lons, lats),
        // no volcanic front is modelled
        DistanceParam::Rvolc => vec![0.0; lons.len()],
    }
}

// ============================================================================
// 2. Requirements
// ============================================================================

/// Union of the parameters declared by a set of ground motion models
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Requirements {
    /// Distance measures
    pub distances: BTreeSet<DistanceParam>,
    /// Site parameters
    pub sites: BTreeSet<SiteParam>,
    /// Rupture parameters
    pub rupture: BTreeSet<RuptureParam>,
}

impl Requirements {
    /// Parse and merge the declarations; unknown names are fatal
    pub fn from_gsims(gsims: &[Arc<dyn GroundMotionModel>]) -> Result<Self> {
        let mut req = Requirements::default();
        for gsim in gsims {
            for name in gsim.requires_distances() {
                req.distances.insert(name.parse()?);
            }
            for name in gsim.requires_sites_parameters() {
                req.sites.insert(name.parse()?);
            }
            for name in gsim.requires_rupture_parameters() {
                req.rupture.insert(RuptureParam::parse(name, gsim.name())?);
            }
        }
        Ok(req)
    }
}

// ============================================================================
// 3. DistanceTable
// ============================================================================

/// Named per-site distance arrays; arrays are shared and never mutated
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DistanceTable(BTreeMap<DistanceParam, Arc<[f64]>>);

impl DistanceTable {
    /// Distances of one kind
    pub fn get(&self, param: DistanceParam) -> Option<&[f64]> {
        self.0.get(&param).map(|a| &a[..])
    }

    /// Attach an array
    pub fn insert(&mut self, param: DistanceParam, values: Vec<f64>) {
        self.0.insert(param, values.into());
    }

    /// Iterate over (kind, distances)
    pub fn iter(&self) -> impl Iterator<Item = (DistanceParam, &[f64])> {
        self.0.iter().map(|(&p, a)| (p, &a[..]))
    }

    /// Number of distance kinds
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True when no distance is attached
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Copy with the distances below `minimum_distance` raised to it.
    ///
    /// Arrays without small values are shared with `self`; a non-positive
    /// minimum returns an unchanged copy.
    pub fn roundup(&self, minimum_distance: f64) -> DistanceTable {
        if minimum_distance <= 0.0 || minimum_distance.is_nan() {
            return self.clone();
        }
        let map = self
            .0
            .iter()
            .map(|(&param, array)| {
                let small = !param.is_angle() && array.iter().any(|&d| d < minimum_distance);
                let array: Arc<[f64]> = if small {
                    array.iter().map(|&d| d.max(minimum_distance)).collect()
                } else {
                    Arc::clone(array)
                };
                (param, array)
            })
            .collect();
        DistanceTable(map)
    }
}

fn pick(values: &[f64], mask: &[bool]) -> Vec<f64> {
    values
        .iter()
        .zip(mask)
        .filter_map(|(&v, &m)| m.then_some(v))
        .collect()
}

// ============================================================================
// 4. RuptureContext and its builder
// ============================================================================

/// One rupture evaluated against the sites that survived filtering.
///
/// Every per-site array has one entry per element of `sids`.
#[derive(Debug, Clone)]
pub struct RuptureContext {
    /// Id of the originating rupture
    pub rup_id: u64,
    /// Id of the originating source
    pub src_id: u32,
    /// Magnitude
    pub mag: f64,
    /// Poissonian rate or occurrence PMF
    pub occurrence: Occurrence,
    /// Temporal occurrence model
    pub tom: PoissonTom,
    /// Weight among mutually exclusive ruptures
    pub weight: f64,
    rparams: BTreeMap<RuptureParam, f64>,
    sids: Arc<[u32]>,
    distances: DistanceTable,
    sites: BTreeMap<SiteParam, Arc<[f64]>>,
    clon: Option<Arc<[f64]>>,
    clat: Option<Arc<[f64]>>,
}

/// Hashable identity of a context: magnitude, rupture parameters, distances
/// and sites, as exact bit patterns
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContextKey(Vec<u64>);

impl RuptureContext {
    /// Start building a context validated against `req`
    pub fn builder(
        req: &Requirements,
        rup_id: u64,
        mag: f64,
        occurrence: Occurrence,
        tom: PoissonTom,
    ) -> RuptureContextBuilder<'_> {
        RuptureContextBuilder {
            req,
            ctx: RuptureContext {
                rup_id,
                src_id: 0,
                mag,
                occurrence,
                tom,
                weight: 1.0,
                rparams: BTreeMap::new(),
                sids: Arc::from(Vec::new()),
                distances: DistanceTable::default(),
                sites: BTreeMap::new(),
                clon: None,
                clat: None,
            },
        }
    }

    /// Surviving site ids
    pub fn sids(&self) -> &[u32] {
        &self.sids
    }

    /// Number of surviving sites
    pub fn num_sites(&self) -> usize {
        self.sids.len()
    }

    /// Distances of one kind
    pub fn distance(&self, param: DistanceParam) -> Result<&[f64]> {
        self.distances
            .get(param)
            .ok_or_else(|| HazardError::MissingField(param.name().to_string()))
    }

    /// All attached distances
    pub fn distances(&self) -> &DistanceTable {
        &self.distances
    }

    /// Values of a site parameter
    pub fn site_param(&self, param: SiteParam) -> Result<&[f64]> {
        self.sites
            .get(&param)
            .map(|a| &a[..])
            .ok_or_else(|| HazardError::MissingField(param.name().to_string()))
    }

    /// Attached site parameters
    pub fn site_params(&self) -> impl Iterator<Item = (SiteParam, &[f64])> + '_ {
        self.sites.iter().map(|(&p, a)| (p, &a[..]))
    }

    /// Value of a rupture parameter
    pub fn rupture_param(&self, param: RuptureParam) -> Result<f64> {
        if param == RuptureParam::Mag {
            return Ok(self.mag);
        }
        self.rparams
            .get(&param)
            .copied()
            .ok_or_else(|| HazardError::MissingField(param.name().to_string()))
    }

    /// Attached rupture parameters, magnitude excluded
    pub fn rupture_params(&self) -> impl Iterator<Item = (RuptureParam, f64)> + '_ {
        self.rparams.iter().map(|(&p, &v)| (p, v))
    }

    /// Longitudes of the closest rupture points, few-sites mode only
    pub fn clon(&self) -> Option<&[f64]> {
        self.clon.as_deref()
    }

    /// Latitudes of the closest rupture points, few-sites mode only
    pub fn clat(&self) -> Option<&[f64]> {
        self.clat.as_deref()
    }

    /// Probability of no exceedance for each conditional probability of exceedance
    pub fn probability_no_exceedance<D: Dimension>(&self, poes: ArrayView<'_, f64, D>) -> Array<f64, D> {
        poes.mapv(|poe| self.occurrence.probability_no_exceedance(&self.tom, poe))
    }

    /// Copy with distances below `minimum_distance` raised to it
    pub fn roundup(&self, minimum_distance: f64) -> RuptureContext {
        let mut ctx = self.clone();
        ctx.distances = self.distances.roundup(minimum_distance);
        ctx
    }

    /// Key used to cache ground motion computations
    pub fn key(&self) -> ContextKey {
        let mut bits = vec![self.mag.to_bits()];
        bits.extend(self.rparams.values().map(|v| v.to_bits()));
        for (param, values) in self.distances.iter() {
            bits.push(param as u64);
            bits.extend(values.iter().map(|v| v.to_bits()));
        }
        bits.push(u64::MAX);
        bits.extend(self.sids.iter().map(|&s| u64::from(s)));
        ContextKey(bits)
    }

    /// One-site view of the context, `None` if the site was filtered out
    pub fn for_site(&self, sid: u32) -> Option<RuptureContext> {
        let idx = self.sids.iter().position(|&s| s == sid)?;
        let one = |a: &Arc<[f64]>| -> Arc<[f64]> { Arc::from(vec![a[idx]]) };
        let mut ctx = self.clone();
        ctx.sids = Arc::from(vec![sid]);
        ctx.distances = DistanceTable(self.distances.0.iter().map(|(&p, a)| (p, one(a))).collect());
        ctx.sites = self.sites.iter().map(|(&p, a)| (p, one(a))).collect();
        ctx.clon = self.clon.as_ref().map(one);
        ctx.clat = self.clat.as_ref().map(one);
        Some(ctx)
    }
}

/// Validating builder for [`RuptureContext`]: every field must be declared
/// in the requirements, and every declared field must be set.
#[derive(Debug)]
pub struct RuptureContextBuilder<'a> {
    req: &'a Requirements,
    ctx: RuptureContext,
}

impl RuptureContextBuilder<'_> {
    /// Set a rupture parameter
    pub fn rupture_param(mut self, param: RuptureParam, value: f64) -> Result<Self> {
        if param == RuptureParam::Mag {
            self.ctx.mag = value;
            return Ok(self);
        }
        if !self.req.rupture.contains(&param) {
            return Err(HazardError::UndeclaredField(param.name().to_string()));
        }
        self.ctx.rparams.insert(param, value);
        Ok(self)
    }

    /// Attach a distance array
    pub fn distance(mut self, param: DistanceParam, values: Vec<f64>) -> Result<Self> {
        if !self.req.distances.contains(&param) {
            return Err(HazardError::UndeclaredField(param.name().to_string()));
        }
        self.ctx.distances.insert(param, values);
        Ok(self)
    }

    /// Attach a site parameter array
    pub fn site_param(mut self, param: SiteParam, values: Vec<f64>) -> Result<Self> {
        if !self.req.sites.contains(&param) {
            return Err(HazardError::UndeclaredField(param.name().to_string()));
        }
        self.ctx.sites.insert(param, values.into());
        Ok(self)
    }

    /// Set the surviving site ids
    pub fn sids(mut self, sids: Vec<u32>) -> Self {
        self.ctx.sids = sids.into();
        self
    }

    /// Set the closest rupture points
    pub fn closest_points(mut self, clon: Vec<f64>, clat: Vec<f64>) -> Self {
        self.ctx.clon = Some(clon.into());
        self.ctx.clat = Some(clat.into());
        self
    }

    /// Set the source id
    pub fn src_id(mut self, src_id: u32) -> Self {
        self.ctx.src_id = src_id;
        self
    }

    /// Set the mutex weight
    pub fn weight(mut self, weight: f64) -> Self {
        self.ctx.weight = weight;
        self
    }

    /// Check completeness and array lengths
    pub fn build(self) -> Result<RuptureContext> {
        let ctx = self.ctx;
        let n = ctx.sids.len();
        for param in &self.req.rupture {
            if *param != RuptureParam::Mag && !ctx.rparams.contains_key(param) {
                return Err(HazardError::MissingField(param.name().to_string()));
            }
        }
        for param in &self.req.distances {
            if ctx.distances.get(*param).is_none() {
                return Err(HazardError::MissingField(param.name().to_string()));
            }
        }
        for param in &self.req.sites {
            if !ctx.sites.contains_key(param) {
                return Err(HazardError::MissingField(param.name().to_string()));
            }
        }
        let lengths = ctx
            .distances
            .iter()
            .map(|(p, a)| (p.name(), a.len()))
            .chain(ctx.sites.iter().map(|(p, a)| (p.name(), a.len())))
            .chain(ctx.clon.iter().map(|a| ("clon", a.len())))
            .chain(ctx.clat.iter().map(|a| ("clat", a.len())));
        for (field, got) in lengths {
            if got != n {
                return Err(HazardError::LengthMismatch {
                    field: field.to_string(),
                    got,
                    expected: n,
                });
            }
        }
        Ok(ctx)
    }
}

// ============================================================================
// 5. Equivalent distance tables
// ============================================================================

/// Regional table of equivalent distances as a function of epicentral
/// distance, one row per magnitude
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReqvTable {
    mags: Vec<f64>,
    repi: Vec<f64>,
    reqv: Vec<Vec<f64>>,
}

impl ReqvTable {
    /// Validate the table shape; `repi` must be increasing
    pub fn new(mags: Vec<f64>, repi: Vec<f64>, reqv: Vec<Vec<f64>>) -> Result<Self> {
        if mags.is_empty() || repi.is_empty() {
            return Err(HazardError::config("empty equivalent distance table"));
        }
        if reqv.len() != mags.len() || reqv.iter().any(|row| row.len() != repi.len()) {
            return Err(HazardError::config(
                "equivalent distance table shape does not match mags x repi",
            ));
        }
        if repi.windows(2).any(|w| w[1] <= w[0]) {
            return Err(HazardError::config("repi values must be increasing"));
        }
        Ok(Self { mags, repi, reqv })
    }

    /// Equivalent distances for the row of the closest magnitude.
    ///
    /// Distances outside the tabulated range are returned unchanged.
    pub fn get(&self, repi: &[f64], mag: f64) -> Vec<f64> {
        let row = self
            .mags
            .iter()
            .enumerate()
            .min_by(|a, b| (a.1 - mag).abs().total_cmp(&(b.1 - mag).abs()))
            .map_or(0, |(i, _)| i);
        let reqv = &self.reqv[row];
        let (lo, hi) = (self.repi[0], self.repi[self.repi.len() - 1]);
        repi.iter()
            .map(|&d| {
                if d <= lo || d > hi {
                    return d;
                }
                let j = self.repi.partition_point(|&x| x < d).max(1);
                let (x0, x1) = (self.repi[j - 1], self.repi[j]);
                reqv[j - 1] + (reqv[j] - reqv[j - 1]) * (d - x0) / (x1 - x0)
            })
            .collect()
    }
}

// ============================================================================
// 6. ContextParams
// ============================================================================

/// How finite-size effects of point-like sources are treated
#[derive(Debug, Clone, PartialEq)]
pub enum PointSourceDistance {
    /// Every point-like source is reduced to point ruptures
    Zero,
    /// The same distance for every magnitude
    Constant(f64),
    /// Finite ruptures only for sites within the distance for the magnitude;
    /// magnitudes without an entry keep their finite ruptures everywhere
    ByMag(BTreeMap<MagKey, f64>),
}

impl PointSourceDistance {
    /// Distance for a magnitude
    pub fn get(&self, mag: f64) -> f64 {
        match self {
            PointSourceDistance::Zero => 0.0,
            PointSourceDistance::Constant(d) => *d,
            PointSourceDistance::ByMag(map) => map
                .get(&MagKey::new(mag))
                .copied()
                .unwrap_or(f64::INFINITY),
        }
    }
}

/// Calculation parameters consumed by [`ContextMaker`]
#[derive(Debug, Clone)]
pub struct ContextParams {
    /// Intensity measure types and levels
    pub imtls: Imtls,
    /// Temporal occurrence model
    pub tom: PoissonTom,
    /// Truncation level of the ground motion distribution
    pub truncation_level: Option<f64>,
    /// Integration distance
    pub maximum_distance: MagDepDistance,
    /// Point-source finite-size treatment; `None` keeps every finite rupture
    pub pointsource_distance: Option<PointSourceDistance>,
    /// Equivalent distance table for this TRT
    pub reqv: Option<ReqvTable>,
    /// Distances below this are raised to it before evaluating the models
    pub minimum_distance: f64,
    /// 0 or 1: no collapsing; 2: collapse on all parameters; 3+: magnitude only
    pub collapse_level: u8,
    /// Maximum number of distance buckets when collapsing point ruptures
    pub point_rupture_bins: usize,
    /// At most this many sites switch on few-sites mode
    pub max_sites_disagg: usize,
}

impl Default for ContextParams {
    fn default() -> Self {
        Self {
            imtls: Imtls::default(),
            tom: PoissonTom { time_span: 50.0 },
            truncation_level: None,
            maximum_distance: MagDepDistance::default(),
            pointsource_distance: None,
            reqv: None,
            minimum_distance: 0.0,
            collapse_level: 0,
            point_rupture_bins: 20,
            max_sites_disagg: 10,
        }
    }
}

// ============================================================================
// 7. ContextMaker
// ============================================================================

/// Builds contexts for one tectonic region type and its ground motion models
#[derive(Debug, Clone)]
pub struct ContextMaker {
    trt: String,
    gsims: Vec<Arc<dyn GroundMotionModel>>,
    params: ContextParams,
    req: Requirements,
    truncnorm: TruncatedNormal,
}

impl ContextMaker {
    /// Collect the model requirements; unknown parameter names are fatal
    pub fn new(
        trt: impl Into<String>,
        gsims: Vec<Arc<dyn GroundMotionModel>>,
        params: ContextParams,
    ) -> Result<Self> {
        let mut req = Requirements::from_gsims(&gsims)?;
        req.distances.insert(DistanceParam::Rrup);
        if params.reqv.is_some() {
            req.distances.insert(DistanceParam::Repi);
        }
        Ok(Self {
            trt: trt.into(),
            truncnorm: TruncatedNormal::new(params.truncation_level),
            gsims,
            params,
            req,
        })
    }

    /// Tectonic region type
    pub fn trt(&self) -> &str {
        &self.trt
    }

    /// Ground motion models
    pub fn gsims(&self) -> &[Arc<dyn GroundMotionModel>] {
        &self.gsims
    }

    /// Calculation parameters
    pub fn params(&self) -> &ContextParams {
        &self.params
    }

    /// Union of the model requirements
    pub fn requirements(&self) -> &Requirements {
        &self.req
    }

    /// Intensity measure types and levels
    pub fn imtls(&self) -> &Imtls {
        &self.params.imtls
    }

    /// Truncated normal of the ground motion residuals
    pub fn truncnorm(&self) -> &TruncatedNormal {
        &self.truncnorm
    }

    /// Keep the sites within the integration distance of the rupture.
    ///
    /// A site exactly at the maximum distance is kept.
    pub fn filter(&self, sites: &SiteCollection, rup: &Rupture) -> Result<(SiteCollection, DistanceTable)> {
        let rrup = get_distances(rup, sites.lons(), sites.lats(), DistanceParam::Rrup);
        let mdist = self.params.maximum_distance.get(&self.trt, rup.mag);
        let mask: Vec<bool> = rrup.iter().map(|&d| d <= mdist).collect();
        if !mask.iter().any(|&m| m) {
            let min_distance = rrup.iter().copied().fold(f64::INFINITY, f64::min);
            return Err(FarAwayRupture {
                rup_id: rup.rup_id,
                min_distance,
            }
            .into());
        }
        let mut dctx = DistanceTable::default();
        dctx.insert(DistanceParam::Rrup, pick(&rrup, &mask));
        Ok((sites.filter(&mask), dctx))
    }

    /// Filter the sites and build the context of a rupture
    pub fn make_contexts(&self, sites: &SiteCollection, rup: &Rupture) -> Result<RuptureContext> {
        self.make_context(sites, rup, false)
    }

    fn make_context(&self, sites: &SiteCollection, rup: &Rupture, fewsites: bool) -> Result<RuptureContext> {
        let (sites, mut dctx) = self.filter(sites, rup)?;
        for &param in &self.req.distances {
            if param != DistanceParam::Rrup {
                dctx.insert(param, get_distances(rup, sites.lons(), sites.lats(), param));
            }
        }
        let planar = rup.surface.as_ref().map_or(false, |s| s.is_planar());
        if let (Some(table), true) = (&self.params.reqv, planar) {
            if let Some(repi) = dctx.get(DistanceParam::Repi) {
                let reqv = table.get(repi, rup.mag);
                let depth = rup.hypocenter.depth;
                let rrup = reqv.iter().map(|r| (r * r + depth * depth).sqrt()).collect();
                if self.req.distances.contains(&DistanceParam::Rjb) {
                    dctx.insert(DistanceParam::Rjb, reqv);
                }
                dctx.insert(DistanceParam::Rrup, rrup);
            }
        }

        let mut builder = RuptureContext::builder(&self.req, rup.rup_id, rup.mag, rup.occurrence.clone(), self.params.tom)
            .sids(sites.sids().to_vec())
            .weight(rup.weight);
        for &param in &self.req.rupture {
            builder = builder.rupture_param(param, param.value(rup))?;
        }
        for (param, values) in dctx.iter() {
            builder = builder.distance(param, values.to_vec())?;
        }
        for &param in &self.req.sites {
            builder = builder.site_param(param, sites.param(param).to_vec())?;
        }
        if fewsites {
            let (clon, clat) = match rup.surface.as_deref() {
                Some(surface) => surface
                    .closest_points(sites.lons(), sites.lats())
                    .into_iter()
                    .map(|p| (p.lon, p.lat))
                    .unzip(),
                None => (
                    vec![rup.hypocenter.lon; sites.len()],
                    vec![rup.hypocenter.lat; sites.len()],
                ),
            };
            builder = builder.closest_points(clon, clat);
        }
        builder.build()
    }

    /// Contexts of the ruptures, each against its own sites; far away
    /// ruptures are skipped
    pub fn make_ctxs<'a>(
        &self,
        ruptures: impl IntoIterator<Item = (&'a Rupture, &'a SiteCollection)>,
        fewsites: bool,
    ) -> Result<Vec<RuptureContext>> {
        let mut ctxs = Vec::new();
        for (rup, sites) in ruptures {
            match self.make_context(sites, rup, fewsites) {
                Ok(ctx) => ctxs.push(ctx),
                Err(HazardError::FarAway(far)) => {
                    debug!(rup_id = far.rup_id, min_distance = far.min_distance, "skipping far away rupture");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(ctxs)
    }

    /// Merge contexts with the same rounded parameters and distances
    pub fn collapse_the_ctxs(&self, ctxs: Vec<RuptureContext>) -> Vec<RuptureContext> {
        collapse::collapse_contexts(ctxs, &self.req, self.params.collapse_level)
    }

    /// Conditional probabilities of exceedance, shape (N, L, G) per context
    pub fn gen_ctx_poes<'c>(
        &self,
        ctxs: impl IntoIterator<Item = &'c RuptureContext>,
    ) -> Result<Vec<(&'c RuptureContext, Array3<f64>)>> {
        let l = self.params.imtls.num_levels();
        let g = self.gsims.len();
        let mut out = Vec::new();
        for ctx in ctxs {
            let rounded: Cow<'_, RuptureContext> = if self.params.minimum_distance > 0.0 {
                Cow::Owned(ctx.roundup(self.params.minimum_distance))
            } else {
                Cow::Borrowed(ctx)
            };
            let mut poes = Array3::zeros((ctx.num_sites(), l, g));
            for (gi, gsim) in self.gsims.iter().enumerate() {
                let p = gsim.poes(&rounded, &self.params.imtls, &self.truncnorm)?;
                poes.index_axis_mut(Axis(2), gi).assign(&p);
            }
            out.push((ctx, poes));
        }
        Ok(out)
    }

    /// Maximum median intensity over the models, shape (mags, dists).
    ///
    /// Models rejecting a magnitude are skipped for it.
    pub fn max_intensity(&self, site1: &SiteCollection, mags: &[f64], dists: &[f64]) -> Result<Array2<f64>> {
        if site1.len() != 1 {
            return Err(HazardError::config(format!(
                "max_intensity needs a single site, got {}",
                site1.len()
            )));
        }
        let mut gmv = Array2::zeros((mags.len(), dists.len()));
        for (m, &mag) in mags.iter().enumerate() {
            for (d, &dist) in dists.iter().enumerate() {
                let mut builder = RuptureContext::builder(&self.req, 0, mag, Occurrence::Rate(1.0), self.params.tom)
                    .sids(site1.sids().to_vec());
                for &param in &self.req.rupture {
                    let value = if param == RuptureParam::Width { 0.01 } else { 0.0 };
                    if param != RuptureParam::Mag {
                        builder = builder.rupture_param(param, value)?;
                    }
                }
                for &param in &self.req.distances {
                    builder = builder.distance(param, vec![dist])?;
                }
                for &param in &self.req.sites {
                    builder = builder.site_param(param, site1.param(param).to_vec())?;
                }
                let ctx = builder.build()?;
                let mut means = Vec::new();
                for gsim in &self.gsims {
                    let mut best = f64::NEG_INFINITY;
                    let mut ok = true;
                    for imt in self.params.imtls.imts() {
                        match gsim.mean_std(&ctx, imt) {
                            Ok((mean, _)) => best = best.max(mean[0]),
                            Err(err) => {
                                debug!(gsim = gsim.name(), %err, "skipping model");
                                ok = false;
                                break;
                            }
                        }
                    }
                    if ok {
                        means.push(best);
                    }
                }
                if let Some(max) = means.into_iter().reduce(f64::max) {
                    gmv[[m, d]] = max.exp();
                }
            }
        }
        Ok(gmv)
    }

    /// Names of the columns stored per rupture
    pub fn get_ctx_params(&self) -> BTreeSet<String> {
        let mut params: BTreeSet<String> = [
            "occurrence_rate",
            "sids_",
            "src_id",
            "probs_occur_",
            "clon_",
            "clat_",
            "rrup_",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        params.extend(self.req.rupture.iter().map(|p| p.name().to_string()));
        params.extend(self.req.distances.iter().map(|d| format!("{}_", d.name())));
        params
    }

    /// Few-sites contexts of every rupture of the sources against one site
    pub fn from_srcs(&self, srcs: &[Arc<dyn SeismicSource>], site1: &SiteCollection) -> Result<Vec<RuptureContext>> {
        let mut all = Vec::new();
        for src in srcs {
            let rups: Vec<Rupture> = src.iter_ruptures(None).collect();
            let ctxs = self.make_ctxs(rups.iter().map(|r| (r, site1)), true)?;
            all.extend(ctxs.into_iter().map(|mut ctx| {
                ctx.src_id = src.id();
                ctx
            }));
        }
        Ok(all)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo::{Point, KM_TO_DEGREES};
    use crate::gsim::LinearAttenuation;
    use crate::site::Site;
    use crate::surface::PlanarSurface;
    use approx::assert_relative_eq;

    fn sites(lons: &[f64]) -> SiteCollection {
        let sites: Vec<Site> = lons
            .iter()
            .map(|&lon| Site::new(Point::new(lon, 0.0, 0.0), 760.0))
            .collect();
        SiteCollection::new(&sites)
    }

    fn cmaker(metric: DistanceParam, maxdist: f64) -> ContextMaker {
        let gsim: Arc<dyn GroundMotionModel> = Arc::new(LinearAttenuation::generic("LA", metric));
        let params = ContextParams {
            imtls: Imtls::from_strs([("PGA", vec![0.01, 0.1, 0.5])]).unwrap(),
            truncation_level: Some(3.0),
            maximum_distance: MagDepDistance::constant(maxdist),
            ..ContextParams::default()
        };
        ContextMaker::new("ASC", vec![gsim], params).unwrap()
    }

    fn point_rupture(rup_id: u64, depth: f64) -> Rupture {
        Rupture::new(rup_id, 6.0, 0.0, Point::new(0.0, 0.0, depth), None, Occurrence::Rate(0.01)).unwrap()
    }

    #[derive(Debug)]
    struct Bogus;

    impl GroundMotionModel for Bogus {
        fn name(&self) -> &str {
            "Bogus"
        }
        fn requires_distances(&self) -> &[&'static str] {
            &["rrup"]
        }
        fn requires_sites_parameters(&self) -> &[&'static str] {
            &[]
        }
        fn requires_rupture_parameters(&self) -> &[&'static str] {
            &["mag", "moment_tensor"]
        }
        fn mean_std(&self, _: &RuptureContext, _: &crate::imt::Imt) -> Result<(Vec<f64>, Vec<f64>)> {
            Err(HazardError::gsim("Bogus", "never evaluated"))
        }
    }

    #[test]
    fn test_unknown_rupture_parameter_is_fatal() {
        let gsim: Arc<dyn GroundMotionModel> = Arc::new(Bogus);
        let err = ContextMaker::new("ASC", vec![gsim], ContextParams::default()).unwrap_err();
        assert!(matches!(err, HazardError::UnknownRuptureParameter { .. }));
        assert!(!err.is_recoverable());
    }

    #[test]
    fn test_filter_boundary_is_inclusive() {
        // hypocentral distance to the second site is exactly 10 km
        let lon = 8.0 * KM_TO_DEGREES;
        let sc = sites(&[0.0, lon, 2.0 * lon]);
        let rup = point_rupture(1, 6.0);
        let d = get_distances(&rup, &[lon], &[0.0], DistanceParam::Rrup)[0];
        let cm = cmaker(DistanceParam::Rrup, d);
        let (close, dctx) = cm.filter(&sc, &rup).unwrap();
        assert_eq!(close.sids(), &[0, 1]);
        assert_eq!(dctx.get(DistanceParam::Rrup).unwrap().len(), 2);

        let cm = cmaker(DistanceParam::Rrup, d - 1.0);
        let (close, _) = cm.filter(&sc, &rup).unwrap();
        assert_eq!(close.sids(), &[0]);
    }

    #[test]
    fn test_far_away_rupture_is_skipped() {
        let sc = sites(&[5.0]);
        let cm = cmaker(DistanceParam::Rrup, 100.0);
        let rup = point_rupture(7, 10.0);
        let err = cm.filter(&sc, &rup).unwrap_err();
        assert!(err.is_recoverable());
        let ctxs = cm.make_ctxs([(&rup, &sc)], false).unwrap();
        assert!(ctxs.is_empty());
    }

    #[test]
    fn test_only_required_distances_are_computed() {
        let sc = sites(&[0.1, 0.2]);
        let cm = cmaker(DistanceParam::Rjb, 300.0);
        let surface = PlanarSurface::new(Point::new(0.0, 0.0, 10.0), 0.0, 90.0, 20.0, 10.0);
        let rup = Rupture::new(3, 6.0, 0.0, Point::new(0.0, 0.0, 10.0), Some(Arc::new(surface)), Occurrence::Rate(0.01))
            .unwrap();
        let ctx = cm.make_contexts(&sc, &rup).unwrap();
        let kinds: Vec<DistanceParam> = ctx.distances().iter().map(|(p, _)| p).collect();
        assert_eq!(kinds, vec![DistanceParam::Rrup, DistanceParam::Rjb]);
        assert!(ctx.distance(DistanceParam::Rx).is_err());
        assert_eq!(ctx.site_param(SiteParam::Vs30).unwrap(), &[760.0, 760.0]);
        assert!(ctx.site_param(SiteParam::Z1pt0).is_err());
        assert!(ctx.clon().is_none());
    }

    #[test]
    fn test_builder_rejects_undeclared_fields() {
        let cm = cmaker(DistanceParam::Rrup, 300.0);
        let tom = PoissonTom::new(1.0).unwrap();
        let err = RuptureContext::builder(cm.requirements(), 0, 5.0, Occurrence::Rate(0.1), tom)
            .distance(DistanceParam::Rx, vec![1.0])
            .unwrap_err();
        assert!(matches!(err, HazardError::UndeclaredField(_)));

        let err = RuptureContext::builder(cm.requirements(), 0, 5.0, Occurrence::Rate(0.1), tom)
            .sids(vec![0, 1])
            .distance(DistanceParam::Rrup, vec![1.0])
            .unwrap()
            .site_param(SiteParam::Vs30, vec![760.0, 760.0])
            .unwrap()
            .build()
            .unwrap_err();
        assert!(matches!(err, HazardError::LengthMismatch { .. }));

        let err = RuptureContext::builder(cm.requirements(), 0, 5.0, Occurrence::Rate(0.1), tom)
            .sids(vec![0])
            .distance(DistanceParam::Rrup, vec![1.0])
            .unwrap()
            .build()
            .unwrap_err();
        assert!(matches!(err, HazardError::MissingField(_)));
    }

    #[test]
    fn test_roundup_is_idempotent() {
        let sc = sites(&[0.0, 0.5]);
        let cm = cmaker(DistanceParam::Rrup, 300.0);
        let ctx = cm.make_contexts(&sc, &point_rupture(1, 5.0)).unwrap();
        let once = ctx.roundup(10.0);
        let twice = once.roundup(10.0);
        assert_eq!(once.distances(), twice.distances());
        let rrup = once.distance(DistanceParam::Rrup).unwrap();
        assert_eq!(rrup[0], 10.0);
        assert_eq!(rrup[1], ctx.distance(DistanceParam::Rrup).unwrap()[1]);
        assert_eq!(ctx.roundup(0.0).distances(), ctx.distances());
        assert_eq!(ctx.roundup(f64::NAN).distances(), ctx.distances());
    }

    #[test]
    fn test_equivalent_distance_substitution() {
        let table = ReqvTable::new(
            vec![5.0, 7.0],
            vec![1.0, 100.0],
            vec![vec![1.0, 50.0], vec![1.0, 20.0]],
        )
        .unwrap();
        let repi = table.get(&[50.5, 200.0, 0.5], 6.9);
        assert_relative_eq!(repi[0], 10.5);
        assert_eq!(repi[1], 200.0);
        assert_eq!(repi[2], 0.5);

        let gsim: Arc<dyn GroundMotionModel> = Arc::new(LinearAttenuation::generic("LA", DistanceParam::Rjb));
        let params = ContextParams {
            imtls: Imtls::from_strs([("PGA", vec![0.1])]).unwrap(),
            maximum_distance: MagDepDistance::constant(500.0),
            reqv: Some(table),
            ..ContextParams::default()
        };
        let cm = ContextMaker::new("ASC", vec![gsim], params).unwrap();
        assert!(cm.requirements().distances.contains(&DistanceParam::Repi));
        let surface = PlanarSurface::new(Point::new(0.0, 0.0, 10.0), 0.0, 90.0, 10.0, 5.0);
        let rup = Rupture::new(1, 7.0, 0.0, Point::new(0.0, 0.0, 10.0), Some(Arc::new(surface)), Occurrence::Rate(0.01))
            .unwrap();
        let sc = sites(&[50.5 * KM_TO_DEGREES]);
        let ctx = cm.make_contexts(&sc, &rup).unwrap();
        let rjb = ctx.distance(DistanceParam::Rjb).unwrap()[0];
        let expected = table_value(50.5);
        assert_relative_eq!(rjb, expected, max_relative = 1e-4);
        let rrup = ctx.distance(DistanceParam::Rrup).unwrap()[0];
        assert_relative_eq!(rrup, (expected * expected + 100.0).sqrt(), max_relative = 1e-4);
    }

    fn table_value(repi: f64) -> f64 {
        1.0 + 19.0 * (repi - 1.0) / 99.0
    }

    #[test]
    fn test_fewsites_contexts_carry_closest_points() {
        let sc = sites(&[0.1]);
        let cm = cmaker(DistanceParam::Rrup, 300.0);
        let rup = point_rupture(1, 5.0);
        let ctxs = cm.make_ctxs([(&rup, &sc)], true).unwrap();
        assert_eq!(ctxs[0].clon().unwrap(), &[0.0]);
        assert_eq!(ctxs[0].clat().unwrap(), &[0.0]);
        let one = ctxs[0].for_site(0).unwrap();
        assert_eq!(one.num_sites(), 1);
        assert!(ctxs[0].for_site(4).is_none());
    }

    #[test]
    fn test_gen_ctx_poes_shape_and_monotonicity() {
        let sc = sites(&[0.0, 0.5, 1.0]);
        let cm = cmaker(DistanceParam::Rrup, 300.0);
        let rup = point_rupture(1, 10.0);
        let ctxs = cm.make_ctxs([(&rup, &sc)], false).unwrap();
        let poes = cm.gen_ctx_poes(&ctxs).unwrap();
        let (_, p) = &poes[0];
        assert_eq!(p.shape(), &[3, 3, 1]);
        // decreasing with the level and with the distance
        assert!(p[[0, 0, 0]] > p[[0, 1, 0]]);
        assert!(p[[0, 1, 0]] > p[[2, 1, 0]]);
    }

    #[test]
    fn test_max_intensity_skips_failing_models() {
        let strict: Arc<dyn GroundMotionModel> =
            Arc::new(LinearAttenuation::generic("strict", DistanceParam::Rrup).with_mag_range(5.0, 6.0));
        let params = ContextParams {
            imtls: Imtls::from_strs([("PGA", vec![0.1])]).unwrap(),
            ..ContextParams::default()
        };
        let cm = ContextMaker::new("ASC", vec![strict], params).unwrap();
        let site1 = sites(&[0.0]);
        let gmv = cm.max_intensity(&site1, &[5.5, 7.0], &[10.0, 50.0]).unwrap();
        assert!(gmv[[0, 0]] > gmv[[0, 1]]);
        assert_eq!(gmv[[1, 0]], 0.0);
        assert!(cm.max_intensity(&sites(&[0.0, 1.0]), &[5.5], &[10.0]).is_err());
    }

    #[test]
    fn test_ctx_params() {
        let cm = cmaker(DistanceParam::Rjb, 300.0);
        let params = cm.get_ctx_params();
        assert!(params.contains("rjb_"));
        assert!(params.contains("mag"));
        assert!(params.contains("sids_"));
        assert!(!params.contains("rx_"));
    }
}
