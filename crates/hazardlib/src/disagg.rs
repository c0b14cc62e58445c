//! # Disaggregation
//!
//! Splits the probability of exceeding an intensity level into the
//! contributions of magnitude, distance, closest-point location, epsilon and
//! tectonic region type bins.
//!
//! ## Table of Contents
//! 1. Bin edges
//! 2. Epsilon bands and ground motion statistics
//! 3. Disaggregation of contexts
//! 4. Matrix building
//! 5. Composition and PMF extraction
//! 6. Single-site disaggregation

use std::borrow::Cow;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use ndarray::{s, Array2, Array3, Array4, Array6, ArrayBase, ArrayD, ArrayView2, Axis, Data, Dimension, Zip};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::contexts::{ContextKey, ContextMaker, ContextParams, DistanceParam, RuptureContext};
use crate::error::{HazardError, Result};
use crate::filters::{linspace, MagDepDistance};
use crate::geo::{angular_distance, cross_idl, get_longitudinal_extent, normalize_lon, KM_TO_DEGREES};
use crate::gsim::GroundMotionModel;
use crate::imt::{to_distribution_value, Imt, Imtls};
use crate::site::{Site, SiteCollection};
use crate::source::SourceGroup;
use crate::stats::TruncatedNormal;

/// Largest accepted number of cells of the (Ma, D, Lo, La, E, T) matrix
pub const MAX_MATRIX_SIZE: u64 = 1_000_000;

/// Names of the six matrix axes
pub const BIN_NAMES: [&str; 6] = ["mag", "dist", "lon", "lat", "eps", "trt"];

// ============================================================================
// 1. Bin edges
// ============================================================================

/// Bin widths and epsilon settings of a disaggregation
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BinWidths {
    /// Magnitude bin width
    pub mag: f64,
    /// Distance bin width in km
    pub distance: f64,
    /// Longitude and latitude bin width in degrees
    pub coordinate: f64,
    /// Number of epsilon bins
    pub num_epsilon_bins: usize,
    /// Truncation level of the ground motion distribution
    pub truncation_level: f64,
}

impl BinWidths {
    /// Widths must be positive, the truncation level too
    pub fn validate(&self) -> Result<()> {
        for (name, w) in [
            ("mag_bin_width", self.mag),
            ("distance_bin_width", self.distance),
            ("coordinate_bin_width", self.coordinate),
        ] {
            if w <= 0.0 || w.is_nan() {
                return Err(HazardError::config(format!("{name} must be positive, got {w}")));
            }
        }
        if self.num_epsilon_bins == 0 {
            return Err(HazardError::config("num_epsilon_bins must be positive"));
        }
        if self.truncation_level <= 0.0 || self.truncation_level.is_nan() {
            return Err(HazardError::config(format!(
                "disaggregation needs a positive truncation level, got {}",
                self.truncation_level
            )));
        }
        Ok(())
    }
}

fn min_max(values: impl IntoIterator<Item = f64>) -> Option<(f64, f64)> {
    values.into_iter().fold(None, |acc, v| match acc {
        None => Some((v, v)),
        Some((lo, hi)) => Some((lo.min(v), hi.max(v))),
    })
}

/// Multiples of `width` from `floor(min / width)` to `ceil(max / width)`,
/// always at least one bin
pub fn edges_between(min: f64, max: f64, width: f64) -> Result<Vec<f64>> {
    if !min.is_finite() || !max.is_finite() || width <= 0.0 || width.is_nan() || min > max {
        return Err(HazardError::binning(format!(
            "cannot bin [{min}, {max}] with width {width}"
        )));
    }
    let lo = (min / width).floor() as i64;
    let hi = ((max / width).ceil() as i64 + 1).max(lo + 2);
    Ok((lo..hi).map(|i| width * i as f64).collect())
}

/// Magnitude edges covering every magnitude
pub fn mag_edges(mags: &[f64], width: f64) -> Result<Vec<f64>> {
    let (min, max) = min_max(mags.iter().copied())
        .ok_or_else(|| HazardError::binning("no magnitudes to bin"))?;
    edges_between(min, max, width)
}

/// Distance edges from zero up to the maximum distance
pub fn dist_edges(maxdist: f64, width: f64) -> Result<Vec<f64>> {
    edges_between(0.0, maxdist, width)
}

/// `num_bins + 1` evenly spaced epsilon edges over `[-level, level]`
pub fn eps_edges(truncation_level: f64, num_bins: usize) -> Vec<f64> {
    linspace(-truncation_level, truncation_level, num_bins + 1)
}

/// Longitude and latitude edges of a box of half-size `size_km` around a site.
///
/// Boxes crossing the antimeridian are wrapped to [-180, 180), so that their
/// first and last edges have opposite signs.
pub fn lon_lat_bins(lon: f64, lat: f64, size_km: f64, coord_bin_width: f64) -> (Vec<f64>, Vec<f64>) {
    let nbins = (size_km * KM_TO_DEGREES / coord_bin_width).ceil().max(1.0);
    let delta_lon = angular_distance(size_km, lat).min(180.0);
    let delta_lat = (size_km * KM_TO_DEGREES).min(90.0);
    let n = 2 * nbins as usize;
    let lons: Vec<f64> = (0..=n)
        .map(|i| lon - delta_lon + i as f64 * delta_lon / nbins)
        .collect();
    let lats = (0..=n)
        .map(|i| lat - delta_lat + i as f64 * delta_lat / nbins)
        .collect();
    let wraps = lons.iter().any(|l| l.abs() > 180.0) || cross_idl(&lons);
    let lons = if wraps {
        lons.into_iter().map(normalize_lon).collect()
    } else {
        lons
    };
    (lons, lats)
}

/// Index of the half-open bin containing `x`; the last edge belongs to the
/// last bin and values outside are clamped
pub fn bin_index(edges: &[f64], x: f64) -> usize {
    let nbins = edges.len().saturating_sub(1).max(1);
    edges
        .partition_point(|&e| e <= x)
        .saturating_sub(1)
        .min(nbins - 1)
}

/// Edges of every axis of the disaggregation matrix
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BinEdges {
    pub mag: Vec<f64>,
    pub dist: Vec<f64>,
    /// Longitude edges, one vector per site
    pub lon: Vec<Vec<f64>>,
    /// Latitude edges, one vector per site
    pub lat: Vec<Vec<f64>>,
    pub eps: Vec<f64>,
    pub trts: Vec<String>,
}

/// The edges relevant to a single site
#[derive(Debug, Clone, Copy)]
pub struct SiteBins<'a> {
    pub dist: &'a [f64],
    pub lon: &'a [f64],
    pub lat: &'a [f64],
    pub eps: &'a [f64],
}

fn nbins(edges: &[f64]) -> usize {
    edges.len().saturating_sub(1)
}

impl BinEdges {
    /// Edges for the given magnitudes per TRT and sites
    pub fn new(
        mags_by_trt: &BTreeMap<String, Vec<f64>>,
        sitecol: &SiteCollection,
        maximum_distance: &MagDepDistance,
        widths: &BinWidths,
    ) -> Result<Self> {
        widths.validate()?;
        let trts: Vec<String> = mags_by_trt.keys().cloned().collect();
        let mags: Vec<f64> = mags_by_trt.values().flatten().copied().collect();
        let mag = mag_edges(&mags, widths.mag)?;
        let maxdist = trts
            .iter()
            .map(|trt| maximum_distance.max(trt))
            .fold(0.0, f64::max);
        if !maxdist.is_finite() {
            return Err(HazardError::config(
                "disaggregation needs a finite maximum distance",
            ));
        }
        let dist = dist_edges(maxdist, widths.distance)?;
        let (lon, lat): (Vec<Vec<f64>>, Vec<Vec<f64>>) = sitecol
            .lons()
            .iter()
            .zip(sitecol.lats())
            .map(|(&lo, &la)| lon_lat_bins(lo, la, maxdist, widths.coordinate))
            .unzip();
        for (l1, l2) in lon.iter().zip(&lat) {
            if l1.len() != lon[0].len() || l2.len() != lat[0].len() {
                return Err(HazardError::binning("inconsistent lon/lat bins across sites"));
            }
        }
        Ok(Self {
            mag,
            dist,
            lon,
            lat,
            eps: eps_edges(widths.truncation_level, widths.num_epsilon_bins),
            trts,
        })
    }

    /// Number of bins per axis (Ma, D, Lo, La, E, T)
    pub fn matrix_shape(&self) -> [usize; 6] {
        [
            nbins(&self.mag),
            nbins(&self.dist),
            self.lon.first().map_or(0, |e| nbins(e)),
            self.lat.first().map_or(0, |e| nbins(e)),
            nbins(&self.eps),
            self.trts.len(),
        ]
    }

    /// Number of cells of the full matrix
    pub fn matrix_size(&self) -> u64 {
        self.matrix_shape().iter().map(|&n| n as u64).product()
    }

    /// Fail when the full matrix would exceed [`MAX_MATRIX_SIZE`] cells
    pub fn check_matrix_size(&self) -> Result<()> {
        let size = self.matrix_size();
        if size > MAX_MATRIX_SIZE {
            return Err(HazardError::MatrixTooLarge(size));
        }
        Ok(())
    }

    /// Magnitude bin of a magnitude
    pub fn mag_index(&self, mag: f64) -> usize {
        bin_index(&self.mag, mag)
    }

    /// Edges used when building the matrix of the site at `idx`
    pub fn site_bins(&self, idx: usize) -> Option<SiteBins<'_>> {
        Some(SiteBins {
            dist: &self.dist,
            lon: self.lon.get(idx)?,
            lat: self.lat.get(idx)?,
            eps: &self.eps,
        })
    }

    /// Shape record for `n` sites, `m` IMTs, `p` PoEs and `z` realizations
    pub fn shape(&self, n: usize, m: usize, p: usize, z: usize) -> DisaggShape {
        let [mag, dist, lon, lat, eps, trt] = self.matrix_shape();
        DisaggShape {
            mag,
            dist,
            lon,
            lat,
            eps,
            trt,
            n,
            m,
            p,
            z,
        }
    }
}

/// Sizes of the bin axes and of the output axes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisaggShape {
    pub mag: usize,
    pub dist: usize,
    pub lon: usize,
    pub lat: usize,
    pub eps: usize,
    pub trt: usize,
    pub n: usize,
    pub m: usize,
    pub p: usize,
    pub z: usize,
}

impl DisaggShape {
    /// Size of a named axis
    pub fn get(&self, key: &str) -> Option<usize> {
        Some(match key {
            "mag" => self.mag,
            "dist" => self.dist,
            "lon" => self.lon,
            "lat" => self.lat,
            "eps" => self.eps,
            "trt" => self.trt,
            "N" => self.n,
            "M" => self.m,
            "P" => self.p,
            "Z" => self.z,
            _ => return None,
        })
    }

    /// Bin sizes of an output kind
    pub fn bins(&self, kind: PmfKind) -> Vec<usize> {
        kind.axes().iter().filter_map(|a| self.get(a)).collect()
    }

    /// Full output shape (N, M, P, bins.., Z)
    pub fn output_shape(&self, kind: PmfKind) -> Vec<usize> {
        let mut shape = vec![self.n, self.m, self.p];
        shape.extend(self.bins(kind));
        shape.push(self.z);
        shape
    }
}

/// Size in bytes of each requested output
pub fn get_outputs_size(shape: &DisaggShape, kinds: &[PmfKind]) -> BTreeMap<PmfKind, u64> {
    kinds
        .iter()
        .map(|&kind| {
            let cells: u64 = shape.output_shape(kind).iter().map(|&n| n as u64).product();
            (kind, 8 * cells)
        })
        .collect()
}

// ============================================================================
// 2. Epsilon bands and ground motion statistics
// ============================================================================

/// Truncated normal with the epsilon edges and the mass of each band
#[derive(Debug, Clone)]
pub struct Eps3 {
    truncnorm: TruncatedNormal,
    edges: Vec<f64>,
    bands: Vec<f64>,
    cum_bands: Vec<f64>,
}

impl Eps3 {
    pub fn new(truncation_level: f64, num_epsilon_bins: usize) -> Result<Self> {
        if truncation_level <= 0.0 || truncation_level.is_nan() || num_epsilon_bins == 0 {
            return Err(HazardError::config(format!(
                "epsilon bins need a positive truncation level and bin count, got {truncation_level} and {num_epsilon_bins}"
            )));
        }
        let truncnorm = TruncatedNormal::new(Some(truncation_level));
        let edges = eps_edges(truncation_level, num_epsilon_bins);
        let bands: Vec<f64> = edges
            .windows(2)
            .map(|w| truncnorm.cdf(w[1]) - truncnorm.cdf(w[0]))
            .collect();
        let mut cum_bands: Vec<f64> = (0..bands.len()).map(|e| bands[e..].iter().sum()).collect();
        cum_bands.push(0.0);
        Ok(Self {
            truncnorm,
            edges,
            bands,
            cum_bands,
        })
    }

    pub fn truncnorm(&self) -> &TruncatedNormal {
        &self.truncnorm
    }

    pub fn edges(&self) -> &[f64] {
        &self.edges
    }

    /// Probability mass of each epsilon band
    pub fn bands(&self) -> &[f64] {
        &self.bands
    }

    pub fn num_bins(&self) -> usize {
        self.bands.len()
    }

    /// Share of the exceedance probability falling in band `e`, given the
    /// epsilon bin of the level and its survival probability
    fn band_poe(&self, e: usize, bin: usize, survival: f64) -> f64 {
        if bin <= e {
            self.bands[e]
        } else if bin == e + 1 {
            survival - self.cum_bands[bin]
        } else {
            0.0
        }
    }
}

/// Mean and standard deviation per context and model, shape (2, U, G).
///
/// Distances below `minimum_distance` are raised to it before the models
/// are evaluated. Contexts with the same rounded key are computed once.
pub fn get_mean_std(
    ctxs: &[RuptureContext],
    gsims: &[Arc<dyn GroundMotionModel>],
    imt: &Imt,
    minimum_distance: f64,
) -> Result<Array3<f64>> {
    let mut cache: HashMap<(u64, ContextKey), Vec<(f64, f64)>> = HashMap::new();
    let mut out = Array3::zeros((2, ctxs.len(), gsims.len()));
    for (u, ctx) in ctxs.iter().enumerate() {
        let ctx: Cow<'_, RuptureContext> = if minimum_distance > 0.0 {
            Cow::Owned(ctx.roundup(minimum_distance))
        } else {
            Cow::Borrowed(ctx)
        };
        let key = (minimum_distance.to_bits(), ctx.key());
        let stats = match cache.get(&key) {
            Some(stats) => stats.clone(),
            None => {
                let stats = gsims
                    .iter()
                    .map(|gsim| {
                        let (mean, std) = gsim.mean_std(&ctx, imt)?;
                        match (mean.first(), std.first()) {
                            (Some(&m), Some(&s)) => Ok((m, s)),
                            _ => Err(HazardError::gsim(gsim.name(), "no values for the context")),
                        }
                    })
                    .collect::<Result<Vec<_>>>()?;
                cache.insert(key, stats.clone());
                stats
            }
        };
        for (g, (mean, std)) in stats.into_iter().enumerate() {
            out[[0, u, g]] = mean;
            out[[1, u, g]] = std;
        }
    }
    Ok(out)
}

// ============================================================================
// 3. Disaggregation of contexts
// ============================================================================

/// Distances, closest points and probabilities of no exceedance of U
/// one-site contexts; `pnes` has shape (U, E, P, Z)
#[derive(Debug, Clone)]
pub struct BinData {
    pub dists: Vec<f64>,
    pub lons: Vec<f64>,
    pub lats: Vec<f64>,
    pub pnes: Array4<f64>,
}

/// Probability of no exceedance of each context split by epsilon band.
///
/// `iml2` has shape (P, Z) and `g_by_z` gives the model of each realization.
/// The contexts must refer to a single site and carry closest points.
/// `minimum_distance` applies to the models only: the distance bins use
/// the actual rupture distance.
pub fn disaggregate(
    ctxs: &[RuptureContext],
    gsims: &[Arc<dyn GroundMotionModel>],
    g_by_z: &[usize],
    imt: &Imt,
    iml2: ArrayView2<'_, f64>,
    eps3: &Eps3,
    minimum_distance: f64,
) -> Result<BinData> {
    let (num_poes, num_rlzs) = iml2.dim();
    if num_rlzs != g_by_z.len() {
        return Err(HazardError::LengthMismatch {
            field: "g_by_z".to_string(),
            got: g_by_z.len(),
            expected: num_rlzs,
        });
    }
    if let Some(g) = g_by_z.iter().find(|&&g| g >= gsims.len()) {
        return Err(HazardError::config(format!(
            "model index {g} out of range for {} models",
            gsims.len()
        )));
    }
    let mut dists = Vec::with_capacity(ctxs.len());
    let mut lons = Vec::with_capacity(ctxs.len());
    let mut lats = Vec::with_capacity(ctxs.len());
    for ctx in ctxs {
        if ctx.num_sites() != 1 {
            return Err(HazardError::binning(format!(
                "rupture {} has {} sites, expected one",
                ctx.rup_id,
                ctx.num_sites()
            )));
        }
        dists.push(ctx.distance(DistanceParam::Rrup)?[0]);
        match (ctx.clon(), ctx.clat()) {
            (Some(clon), Some(clat)) => {
                lons.push(clon[0]);
                lats.push(clat[0]);
            }
            _ => return Err(HazardError::MissingField("clon".to_string())),
        }
    }

    let mean_std = get_mean_std(ctxs, gsims, imt, minimum_distance)?;
    let mut pnes = Array4::ones((ctxs.len(), eps3.num_bins(), num_poes, num_rlzs));
    for (z, &g) in g_by_z.iter().enumerate() {
        for p in 0..num_poes {
            let iml = to_distribution_value(iml2[[p, z]], imt);
            for (u, ctx) in ctxs.iter().enumerate() {
                let lvl = (iml - mean_std[[0, u, g]]) / mean_std[[1, u, g]];
                let survival = eps3.truncnorm.sf(lvl);
                let bin = eps3.edges.partition_point(|&x| x < lvl);
                for e in 0..eps3.num_bins() {
                    let poe = eps3.band_poe(e, bin, survival);
                    pnes[[u, e, p, z]] *= ctx.occurrence.probability_no_exceedance(&ctx.tom, poe);
                }
            }
        }
    }
    Ok(BinData {
        dists,
        lons,
        lats,
        pnes,
    })
}

// ============================================================================
// 4. Matrix building
// ============================================================================

/// Index `i` such that `edges[i] <= x < edges[i + 1]`: -1 below the first
/// edge, `len - 1` at or above the last one
pub fn digitize(values: &[f64], edges: &[f64]) -> Vec<i64> {
    values
        .iter()
        .map(|&x| edges.partition_point(|&e| e <= x) as i64 - 1)
        .collect()
}

/// Like [`digitize`], measuring signed longitudinal extents when the edges
/// cross the antimeridian
pub fn digitize_lons(lons: &[f64], edges: &[f64]) -> Vec<i64> {
    let crosses = match (edges.first(), edges.last()) {
        (Some(&first), Some(&last)) => cross_idl(&[first, last]),
        _ => false,
    };
    if !crosses {
        return digitize(lons, edges);
    }
    lons.iter()
        .map(|&lon| {
            let mut idx = 0;
            for i in 0..edges.len() - 1 {
                let mut inside = get_longitudinal_extent(lon, edges[i + 1]) > 0.0;
                if i != 0 {
                    inside &= get_longitudinal_extent(edges[i], lon) >= 0.0;
                }
                if inside {
                    idx = i as i64;
                }
            }
            idx
        })
        .collect()
}

fn clamp_index(idx: i64, dim: usize) -> Option<usize> {
    match usize::try_from(idx) {
        Ok(i) if i < dim => Some(i),
        Ok(i) if i == dim => Some(dim - 1),
        _ => None,
    }
}

/// Exceedance probabilities binned by (D, Lo, La, E, P, Z).
///
/// Contributions falling in the same cell compose as independent events.
/// Values below the first distance or coordinate edge are dropped; values at
/// or beyond the last edge are clamped into the last bin.
pub fn build_disagg_matrix(bdata: &BinData, bins: &SiteBins<'_>) -> Result<Array6<f64>> {
    let (d, lo, la, e) = (nbins(bins.dist), nbins(bins.lon), nbins(bins.lat), nbins(bins.eps));
    if d == 0 || lo == 0 || la == 0 || e == 0 {
        return Err(HazardError::binning("every axis needs at least one bin"));
    }
    let (u, ne, p, z) = bdata.pnes.dim();
    if ne != e {
        return Err(HazardError::LengthMismatch {
            field: "epsilon bins".to_string(),
            got: ne,
            expected: e,
        });
    }
    let dists_idx = digitize(&bdata.dists, bins.dist);
    let lons_idx = digitize_lons(&bdata.lons, bins.lon);
    let lats_idx = digitize(&bdata.lats, bins.lat);

    let mut mat = Array6::ones((d, lo, la, e, p, z));
    let mut skipped = 0usize;
    for i in 0..u {
        match (
            clamp_index(dists_idx[i], d),
            clamp_index(lons_idx[i], lo),
            clamp_index(lats_idx[i], la),
        ) {
            (Some(di), Some(li), Some(ai)) => {
                let mut cell = mat.slice_mut(s![di, li, ai, .., .., ..]);
                cell *= &bdata.pnes.index_axis(Axis(0), i);
            }
            _ => skipped += 1,
        }
    }
    if skipped > 0 {
        debug!(skipped, "contexts outside the disaggregation bins");
    }
    mat.mapv_inplace(|x| 1.0 - x);
    Ok(mat)
}

/// Contexts split by magnitude bin
pub fn magbin_groups(ctxs: Vec<RuptureContext>, mag_edges: &[f64]) -> Vec<Vec<RuptureContext>> {
    let mut groups: Vec<Vec<RuptureContext>> = vec![Vec::new(); nbins(mag_edges).max(1)];
    for ctx in ctxs {
        let magi = bin_index(mag_edges, ctx.mag);
        groups[magi].push(ctx);
    }
    groups
}

// ============================================================================
// 5. Composition and PMF extraction
// ============================================================================

/// Compose probabilities of independent events along the given axes:
/// `1 - prod(1 - x)`
pub fn pprod<S, D>(x: &ArrayBase<S, D>, axes: &[usize]) -> ArrayD<f64>
where
    S: Data<Elem = f64>,
    D: Dimension,
{
    let mut axes = axes.to_vec();
    axes.sort_unstable();
    axes.dedup();
    let mut q = x.mapv(|v| 1.0 - v).into_dyn();
    for &ax in axes.iter().rev() {
        q = q.map_axis(Axis(ax), |lane| lane.product());
    }
    q.mapv_into(|v| 1.0 - v)
}

/// Cell-wise composition of two probability arrays of the same shape
pub fn agg_probs(a: &ArrayD<f64>, b: &ArrayD<f64>) -> Result<ArrayD<f64>> {
    if a.shape() != b.shape() {
        return Err(HazardError::binning(format!(
            "cannot compose shapes {:?} and {:?}",
            a.shape(),
            b.shape()
        )));
    }
    Ok(Zip::from(a).and(b).map_collect(|&x, &y| 1.0 - (1.0 - x) * (1.0 - y)))
}

/// The two marginals of a (D, Lo, La, E, P, Z) matrix: (D, E, P, Z) and
/// (Lo, La, P, Z)
pub fn output(mat6: &Array6<f64>) -> (ArrayD<f64>, ArrayD<f64>) {
    (pprod(mat6, &[1, 2]), pprod(mat6, &[0, 3]))
}

/// Kinds of disaggregation outputs
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum PmfKind {
    #[serde(rename = "Mag")]
    Mag,
    #[serde(rename = "Dist")]
    Dist,
    #[serde(rename = "Mag_Dist")]
    MagDist,
    #[serde(rename = "Mag_Dist_Eps")]
    MagDistEps,
    #[serde(rename = "Lon_Lat")]
    LonLat,
    #[serde(rename = "Mag_Lon_Lat")]
    MagLonLat,
    #[serde(rename = "Lon_Lat_TRT")]
    LonLatTrt,
    #[serde(rename = "TRT")]
    Trt,
}

impl PmfKind {
    pub const ALL: [PmfKind; 8] = [
        PmfKind::Mag,
        PmfKind::Dist,
        PmfKind::MagDist,
        PmfKind::MagDistEps,
        PmfKind::LonLat,
        PmfKind::MagLonLat,
        PmfKind::LonLatTrt,
        PmfKind::Trt,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            PmfKind::Mag => "Mag",
            PmfKind::Dist => "Dist",
            PmfKind::MagDist => "Mag_Dist",
            PmfKind::MagDistEps => "Mag_Dist_Eps",
            PmfKind::LonLat => "Lon_Lat",
            PmfKind::MagLonLat => "Mag_Lon_Lat",
            PmfKind::LonLatTrt => "Lon_Lat_TRT",
            PmfKind::Trt => "TRT",
        }
    }

    /// Axes kept by the output, in order
    pub fn axes(&self) -> &'static [&'static str] {
        match self {
            PmfKind::Mag => &["mag"],
            PmfKind::Dist => &["dist"],
            PmfKind::MagDist => &["mag", "dist"],
            PmfKind::MagDistEps => &["mag", "dist", "eps"],
            PmfKind::LonLat => &["lon", "lat"],
            PmfKind::MagLonLat => &["mag", "lon", "lat"],
            PmfKind::LonLatTrt => &["lon", "lat", "trt"],
            PmfKind::Trt => &["trt"],
        }
    }

    /// Marginal the output is extracted from: 0 for (D, E), 1 for (Lo, La)
    pub fn marginal(&self) -> usize {
        match self {
            PmfKind::LonLat | PmfKind::MagLonLat | PmfKind::LonLatTrt => 1,
            _ => 0,
        }
    }

    /// Project a full (Ma, D, Lo, La, E, T) matrix on the kept axes
    pub fn extract<S: Data<Elem = f64>, D: Dimension>(&self, matrix: &ArrayBase<S, D>) -> Result<ArrayD<f64>> {
        if matrix.ndim() != 6 {
            return Err(HazardError::binning(format!(
                "expected a 6D matrix, got {} dimensions",
                matrix.ndim()
            )));
        }
        let axes: &[usize] = match self {
            PmfKind::Mag => &[1, 2, 3, 4, 5],
            PmfKind::Dist => &[0, 2, 3, 4, 5],
            PmfKind::MagDist => &[2, 3, 4, 5],
            PmfKind::MagDistEps => &[2, 3, 5],
            PmfKind::LonLat => &[0, 1, 4, 5],
            PmfKind::MagLonLat => &[1, 4, 5],
            PmfKind::LonLatTrt => &[0, 1, 4],
            PmfKind::Trt => &[0, 1, 2, 3, 4],
        };
        Ok(pprod(matrix, axes))
    }

    /// Project a (T, Ma, A, B, Z) stack of marginals on the kept axes,
    /// where (A, B) is (D, E) or (Lo, La) according to [`PmfKind::marginal`]
    pub fn from_marginal(&self, mat5: &ArrayD<f64>) -> Result<ArrayD<f64>> {
        if mat5.ndim() != 5 {
            return Err(HazardError::binning(format!(
                "expected a 5D matrix, got {} dimensions",
                mat5.ndim()
            )));
        }
        let mat4 = pprod(mat5, &[0]);
        Ok(match self {
            PmfKind::Mag => pprod(&mat4, &[1, 2]),
            PmfKind::Dist => pprod(&mat4, &[0, 2]),
            PmfKind::MagDist => pprod(&mat4, &[2]),
            PmfKind::MagDistEps | PmfKind::MagLonLat => mat4,
            PmfKind::Trt => pprod(mat5, &[1, 2, 3]),
            PmfKind::LonLat => pprod(&mat4, &[0]),
            PmfKind::LonLatTrt => pprod(mat5, &[1]).permuted_axes(vec![1, 2, 0, 3]),
        })
    }
}

impl fmt::Display for PmfKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for PmfKind {
    type Err = HazardError;

    fn from_str(s: &str) -> Result<Self> {
        PmfKind::ALL
            .iter()
            .copied()
            .find(|kind| kind.name() == s)
            .ok_or_else(|| HazardError::config(format!("unknown disaggregation output {s:?}")))
    }
}

// ============================================================================
// 6. Single-site disaggregation
// ============================================================================

/// Bin edges and full (Ma, D, Lo, La, E, T) matrix of a site
#[derive(Debug, Clone)]
pub struct Disaggregation {
    pub edges: BinEdges,
    pub matrix: Array6<f64>,
}

/// Disaggregate the probability of exceeding `iml` at a site.
///
/// Distance edges span the distances of the contributing ruptures. Returns
/// `None` when no rupture is within the integration distance.
pub fn disaggregation(
    groups: &[SourceGroup],
    site: &Site,
    imt: Imt,
    iml: f64,
    gsim_by_trt: &BTreeMap<String, Arc<dyn GroundMotionModel>>,
    widths: &BinWidths,
    maximum_distance: &MagDepDistance,
) -> Result<Option<Disaggregation>> {
    widths.validate()?;
    let sitecol = SiteCollection::new(std::slice::from_ref(site));
    let eps3 = Eps3::new(widths.truncation_level, widths.num_epsilon_bins)?;

    let mut rups: BTreeMap<String, (Arc<dyn GroundMotionModel>, Vec<RuptureContext>)> = BTreeMap::new();
    for group in groups {
        let gsim = gsim_by_trt
            .get(&group.trt)
            .ok_or_else(|| HazardError::config(format!("no model for TRT {:?}", group.trt)))?;
        let params = ContextParams {
            imtls: Imtls::new(vec![(imt, vec![iml])])?,
            tom: group.tom,
            truncation_level: Some(widths.truncation_level),
            maximum_distance: maximum_distance.clone(),
            ..ContextParams::default()
        };
        let cmaker = ContextMaker::new(group.trt.clone(), vec![Arc::clone(gsim)], params)?;
        let ctxs = cmaker.from_srcs(&group.sources, &sitecol)?;
        rups.entry(group.trt.clone())
            .or_insert_with(|| (Arc::clone(gsim), Vec::new()))
            .1
            .extend(ctxs);
    }

    let Some((min_mag, max_mag)) = min_max(rups.values().flat_map(|(_, c)| c.iter().map(|ctx| ctx.mag))) else {
        warn!(lon = site.location.lon, lat = site.location.lat, "no ruptures have contributed to the hazard at site");
        return Ok(None);
    };
    let mag = edges_between(min_mag, max_mag, widths.mag)?;
    let trts: Vec<String> = rups.keys().cloned().collect();
    let iml2 = Array2::from_elem((1, 1), iml);

    let mut bdata = Vec::new();
    for (t, (_, (gsim, ctxs))) in rups.into_iter().enumerate() {
        let gsims = [gsim];
        for (magi, ctxs) in magbin_groups(ctxs, &mag).into_iter().enumerate() {
            if !ctxs.is_empty() {
                bdata.push((t, magi, disaggregate(&ctxs, &gsims, &[0], &imt, iml2.view(), &eps3, 0.0)?));
            }
        }
    }

    let (min_dist, max_dist) = min_max(bdata.iter().flat_map(|(_, _, b)| b.dists.iter().copied()))
        .ok_or_else(|| HazardError::binning("no distances to bin"))?;
    let dist = edges_between(min_dist, max_dist, widths.distance)?;
    let (lon, lat) = lon_lat_bins(site.location.lon, site.location.lat, max_dist, widths.coordinate);
    let edges = BinEdges {
        mag,
        dist,
        lon: vec![lon],
        lat: vec![lat],
        eps: eps3.edges().to_vec(),
        trts,
    };
    let [ma, d, lo, la, e, t] = edges.matrix_shape();
    let mut matrix = Array6::zeros((ma, d, lo, la, e, t));
    let bins = edges
        .site_bins(0)
        .ok_or_else(|| HazardError::binning("missing site bins"))?;
    for (ti, magi, bd) in &bdata {
        let mat6 = build_disagg_matrix(bd, &bins)?;
        matrix
            .slice_mut(s![*magi, .., .., .., .., *ti])
            .assign(&mat6.slice(s![.., .., .., .., 0, 0]));
    }
    Ok(Some(Disaggregation { edges, matrix }))
}
