//! # Ruptures and seismic sources
//!
//! ## Table of Contents
//! 1. Occurrence: Poissonian rate or occurrence-count PMF
//! 2. Rupture
//! 3. SeismicSource trait
//! 4. Magnitude-frequency distributions and scaling
//! 5. PointSource
//! 6. CharacteristicSource
//! 7. NonParametricSource
//! 8. SourceGroup

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{HazardError, Result};
use crate::geo::{point_at, Point, DEGREES_TO_RAD};
use crate::site::SiteCollection;
use crate::surface::{PlanarSurface, RuptureSurface};
use crate::tom::PoissonTom;

// ============================================================================
// 1. Occurrence
// ============================================================================

/// How often a rupture occurs: exactly one of a Poissonian rate or a PMF over
/// occurrence counts (first entry is the probability of zero occurrences)
#[derive(Debug, Clone, PartialEq)]
pub enum Occurrence {
    /// Annual occurrence rate
    Rate(f64),
    /// Probability of 0, 1, 2, ... occurrences in the time span
    Pmf(Arc<[f64]>),
}

impl Occurrence {
    /// Validated Poissonian occurrence
    pub fn rate(rate: f64) -> Result<Self> {
        if rate <= 0.0 || !rate.is_finite() {
            return Err(HazardError::InvalidRupture(format!(
                "occurrence rate must be positive, got {rate}"
            )));
        }
        Ok(Occurrence::Rate(rate))
    }

    /// Validated non-parametric occurrence
    pub fn pmf(probs: Vec<f64>) -> Result<Self> {
        if probs.is_empty() {
            return Err(HazardError::InvalidRupture("empty occurrence PMF".into()));
        }
        if probs.iter().any(|&p| !(0.0..=1.0).contains(&p)) {
            return Err(HazardError::InvalidRupture(format!(
                "occurrence probabilities outside [0, 1]: {probs:?}"
            )));
        }
        let total: f64 = probs.iter().sum();
        if (total - 1.0).abs() > 1e-6 {
            return Err(HazardError::InvalidRupture(format!(
                "occurrence probabilities sum to {total}"
            )));
        }
        Ok(Occurrence::Pmf(probs.into()))
    }

    /// True for the Poissonian variant
    pub fn is_parametric(&self) -> bool {
        matches!(self, Occurrence::Rate(_))
    }

    /// Occurrence rate, NaN for non-parametric ruptures
    pub fn occurrence_rate(&self) -> f64 {
        match self {
            Occurrence::Rate(r) => *r,
            Occurrence::Pmf(_) => f64::NAN,
        }
    }

    /// Probability that the rupture never causes an exceedance in the time
    /// span, given the conditional probability of exceedance per occurrence.
    ///
    /// Non-parametric: `sum_k p(k) * (1 - poe)^k`, clipped to [0, 1].
    pub fn probability_no_exceedance(&self, tom: &PoissonTom, poe: f64) -> f64 {
        match self {
            Occurrence::Rate(rate) => tom.probability_no_exceedance(*rate, poe),
            Occurrence::Pmf(probs) => {
                let q = 1.0 - poe;
                let mut qk = 1.0;
                let mut pne = 0.0;
                for &p in probs.iter() {
                    pne += p * qk;
                    qk *= q;
                }
                pne.clamp(0.0, 1.0)
            }
        }
    }
}

// ============================================================================
// 2. Rupture
// ============================================================================

/// A single candidate earthquake
#[derive(Debug, Clone)]
pub struct Rupture {
    /// Unique rupture id
    pub rup_id: u64,
    /// Moment magnitude
    pub mag: f64,
    /// Rake in decimal degrees
    pub rake: f64,
    /// Hypocenter
    pub hypocenter: Point,
    /// Finite surface; `None` for point ruptures
    pub surface: Option<Arc<dyn RuptureSurface>>,
    /// Occurrence model
    pub occurrence: Occurrence,
    /// Weight inside a mutually exclusive rupture set
    pub weight: f64,
}

impl Rupture {
    /// Validated constructor
    pub fn new(
        rup_id: u64,
        mag: f64,
        rake: f64,
        hypocenter: Point,
        surface: Option<Arc<dyn RuptureSurface>>,
        occurrence: Occurrence,
    ) -> Result<Self> {
        if mag <= 0.0 || mag.is_nan() {
            return Err(HazardError::InvalidRupture(format!(
                "magnitude must be positive, got {mag}"
            )));
        }
        if let Occurrence::Rate(r) = occurrence {
            Occurrence::rate(r)?;
        }
        Ok(Self {
            rup_id,
            mag,
            rake,
            hypocenter,
            surface,
            occurrence,
            weight: 1.0,
        })
    }

    /// Set the mutex weight
    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }

    /// True for ruptures without a finite surface
    pub fn is_point(&self) -> bool {
        self.surface.is_none()
    }

    /// Probability of at least one occurrence in the time span
    pub fn probability_one_or_more(&self, tom: &PoissonTom) -> f64 {
        match &self.occurrence {
            Occurrence::Rate(r) => tom.probability_one_or_more(*r),
            Occurrence::Pmf(p) => 1.0 - p[0],
        }
    }

    /// Probability of exactly one occurrence in the time span
    pub fn probability_one_occurrence(&self, tom: &PoissonTom) -> f64 {
        match &self.occurrence {
            Occurrence::Rate(r) => tom.probability_n_occurrences(*r, 1),
            Occurrence::Pmf(p) => p.get(1).copied().unwrap_or(0.0),
        }
    }

    /// Probability of no exceedance for each conditional probability of exceedance
    pub fn probability_no_exceedance(&self, tom: &PoissonTom, poes: &[f64]) -> Vec<f64> {
        poes.iter()
            .map(|&poe| self.occurrence.probability_no_exceedance(tom, poe))
            .collect()
    }
}

// ============================================================================
// 3. SeismicSource trait
// ============================================================================

/// A seismic source: a finite, restartable, lazily generated set of ruptures.
///
/// `iter_ruptures` may be called any number of times and must yield the same
/// sequence each time.
pub trait SeismicSource: Send + Sync + fmt::Debug {
    /// Source identifier as given in the model
    fn source_id(&self) -> &str;

    /// Numeric id, used to key telemetry
    fn id(&self) -> u32;

    /// Tectonic region type
    fn trt(&self) -> &str;

    /// Generate the ruptures, optionally only those of one magnitude
    fn iter_ruptures(&self, mag: Option<f64>) -> Box<dyn Iterator<Item = Rupture> + '_>;

    /// Number of ruptures
    fn num_ruptures(&self) -> usize {
        self.iter_ruptures(None).count()
    }

    /// Scalar cost estimate used by the task partitioner
    fn weight(&self) -> f64 {
        self.num_ruptures() as f64
    }

    /// Distinct magnitudes, sorted
    fn mags(&self) -> Vec<f64> {
        let mut mags: Vec<f64> = self.iter_ruptures(None).map(|r| r.mag).collect();
        mags.sort_by(f64::total_cmp);
        mags.dedup_by(|a, b| (*a - *b).abs() < 1e-9);
        mags
    }

    /// Location of point-like sources
    fn location(&self) -> Option<Point> {
        None
    }

    /// One point rupture per magnitude, for point-like sources
    fn point_ruptures(&self) -> Box<dyn Iterator<Item = Rupture> + '_> {
        self.iter_ruptures(None)
    }

    /// Weight inside a group of mutually exclusive sources
    fn mutex_weight(&self) -> f64 {
        1.0
    }

    /// Lower bound of the distance between the source and each site
    fn distances_to(&self, sites: &SiteCollection) -> Vec<f64> {
        let mut out = vec![f64::INFINITY; sites.len()];
        for rup in self.iter_ruptures(None) {
            let dists = match &rup.surface {
                Some(surface) => surface.joyner_boore_distance(sites.lons(), sites.lats()),
                None => rup
                    .hypocenter
                    .distance_to_mesh(sites.lons(), sites.lats(), false),
            };
            for (o, d) in out.iter_mut().zip(dists) {
                *o = o.min(d);
            }
        }
        out
    }
}

// ============================================================================
// 4. Magnitude-frequency distributions and scaling
// ============================================================================

/// Magnitude-frequency distribution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Mfd {
    /// Explicit rates at evenly spaced magnitudes
    EvenlyDiscretized {
        /// First magnitude
        min_mag: f64,
        /// Magnitude step
        bin_width: f64,
        /// Annual rate per magnitude
        occurrence_rates: Vec<f64>,
    },
    /// Doubly truncated Gutenberg-Richter
    TruncatedGr {
        /// a value
        a_val: f64,
        /// b value
        b_val: f64,
        /// Lower magnitude bound
        min_mag: f64,
        /// Upper magnitude bound
        max_mag: f64,
        /// Magnitude step
        bin_width: f64,
    },
}

impl Mfd {
    /// (magnitude, annual rate) pairs
    pub fn mag_rates(&self) -> Vec<(f64, f64)> {
        match self {
            Mfd::EvenlyDiscretized {
                min_mag,
                bin_width,
                occurrence_rates,
            } => occurrence_rates
                .iter()
                .enumerate()
                .map(|(i, &r)| (min_mag + i as f64 * bin_width, r))
                .collect(),
            Mfd::TruncatedGr {
                a_val,
                b_val,
                min_mag,
                max_mag,
                bin_width,
            } => {
                let mut lo = (min_mag / bin_width).round() * bin_width;
                let mut hi = (max_mag / bin_width).round() * bin_width;
                if hi > lo {
                    lo += bin_width / 2.0;
                    hi -= bin_width / 2.0;
                }
                let nbins = ((hi - lo) / bin_width).round() as usize + 1;
                (0..nbins)
                    .map(|i| {
                        let mag = lo + i as f64 * bin_width;
                        let rate = 10f64.powf(a_val - b_val * (mag - bin_width / 2.0))
                            - 10f64.powf(a_val - b_val * (mag + bin_width / 2.0));
                        (mag, rate)
                    })
                    .collect()
            }
        }
    }
}

/// Wells and Coppersmith (1994) median rupture area in km², by rake
pub fn wc1994_area(mag: f64, rake: f64) -> f64 {
    let rake = rake.rem_euclid(360.0);
    let rake = if rake > 180.0 { rake - 360.0 } else { rake };
    if (-45.0..=45.0).contains(&rake) || rake >= 135.0 || rake <= -135.0 {
        10f64.powf(-3.42 + 0.90 * mag)
    } else if rake > 0.0 {
        10f64.powf(-3.99 + 0.98 * mag)
    } else {
        10f64.powf(-2.87 + 0.82 * mag)
    }
}

/// Orientation of a fault plane
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NodalPlane {
    /// Strike in decimal degrees
    pub strike: f64,
    /// Dip in decimal degrees
    pub dip: f64,
    /// Rake in decimal degrees
    pub rake: f64,
}

// ============================================================================
// 5. PointSource
// ============================================================================

/// Point source generating planar ruptures centred on its location
#[derive(Debug, Clone)]
pub struct PointSource {
    source_id: String,
    id: u32,
    trt: String,
    location: Point,
    mfd: Mfd,
    nodal_planes: Vec<(f64, NodalPlane)>,
    hypo_depths: Vec<(f64, f64)>,
    upper_seismogenic_depth: f64,
    lower_seismogenic_depth: f64,
    rupture_aspect_ratio: f64,
    mutex_weight: f64,
}

impl PointSource {
    /// Validated constructor; nodal plane and depth weights must sum to one
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        source_id: impl Into<String>,
        id: u32,
        trt: impl Into<String>,
        location: Point,
        mfd: Mfd,
        nodal_planes: Vec<(f64, NodalPlane)>,
        hypo_depths: Vec<(f64, f64)>,
        seismogenic_depths: (f64, f64),
        rupture_aspect_ratio: f64,
    ) -> Result<Self> {
        let source_id = source_id.into();
        for (what, total) in [
            ("nodal plane", nodal_planes.iter().map(|p| p.0).sum::<f64>()),
            ("hypocentral depth", hypo_depths.iter().map(|p| p.0).sum::<f64>()),
        ] {
            if (total - 1.0).abs() > 1e-6 {
                return Err(HazardError::InvalidSource(format!(
                    "{source_id}: {what} weights sum to {total}"
                )));
            }
        }
        let (usd, lsd) = seismogenic_depths;
        if lsd <= usd || lsd.is_nan() || usd.is_nan() {
            return Err(HazardError::InvalidSource(format!(
                "{source_id}: lower seismogenic depth {lsd} not below upper {usd}"
            )));
        }
        if hypo_depths.iter().any(|&(_, d)| d < usd || d > lsd) {
            return Err(HazardError::InvalidSource(format!(
                "{source_id}: hypocentral depth outside the seismogenic layer"
            )));
        }
        if rupture_aspect_ratio <= 0.0 || rupture_aspect_ratio.is_nan() {
            return Err(HazardError::InvalidSource(format!(
                "{source_id}: rupture aspect ratio must be positive"
            )));
        }
        Ok(Self {
            source_id,
            id,
            trt: trt.into(),
            location,
            mfd,
            nodal_planes,
            hypo_depths,
            upper_seismogenic_depth: usd,
            lower_seismogenic_depth: lsd,
            rupture_aspect_ratio,
            mutex_weight: 1.0,
        })
    }

    /// Set the weight inside a mutex group
    pub fn with_mutex_weight(mut self, weight: f64) -> Self {
        self.mutex_weight = weight;
        self
    }

    /// (length, width) of the rupture, clipped to the seismogenic layer
    fn rupture_dimensions(&self, mag: f64, np: &NodalPlane) -> (f64, f64) {
        let area = wc1994_area(mag, np.rake);
        let mut length = (area * self.rupture_aspect_ratio).sqrt();
        let mut width = area / length;
        let layer = self.lower_seismogenic_depth - self.upper_seismogenic_depth;
        let max_width = layer / (np.dip * DEGREES_TO_RAD).sin();
        if width > max_width {
            width = max_width;
            length = area / width;
        }
        (length, width)
    }

    fn surface(&self, mag: f64, np: &NodalPlane, hypo_depth: f64) -> PlanarSurface {
        let (length, width) = self.rupture_dimensions(mag, np);
        let dip = np.dip * DEGREES_TO_RAD;
        let half_height = 0.5 * width * dip.sin();
        let mut depth = hypo_depth;
        if depth - half_height < self.upper_seismogenic_depth {
            depth = self.upper_seismogenic_depth + half_height;
        }
        if depth + half_height > self.lower_seismogenic_depth {
            depth = self.lower_seismogenic_depth - half_height;
        }
        // a vertical shift of the centroid moves it along the dip direction
        let shift = depth - hypo_depth;
        let (lon, lat) = if shift.abs() > 1e-12 && np.dip < 90.0 {
            point_at(
                self.location.lon,
                self.location.lat,
                np.strike + 90.0,
                shift / dip.tan(),
            )
        } else {
            (self.location.lon, self.location.lat)
        };
        PlanarSurface::new(Point::new(lon, lat, depth), np.strike, np.dip, length, width)
    }

    fn maximum_radius(&self) -> f64 {
        let max_mag = self
            .mfd
            .mag_rates()
            .iter()
            .map(|&(m, _)| m)
            .fold(f64::NEG_INFINITY, f64::max);
        self.nodal_planes
            .iter()
            .map(|(_, np)| {
                let (l, w) = self.rupture_dimensions(max_mag, np);
                0.5 * (l * l + w * w).sqrt()
            })
            .fold(0.0, f64::max)
    }

    fn rup_id(&self, idx: u64) -> u64 {
        (u64::from(self.id) << 32) | idx
    }
}

fn same_mag(a: f64, b: Option<f64>) -> bool {
    b.map_or(true, |b| (a - b).abs() < 1e-6)
}

impl SeismicSource for PointSource {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn id(&self) -> u32 {
        self.id
    }

    fn trt(&self) -> &str {
        &self.trt
    }

    fn iter_ruptures(&self, mag: Option<f64>) -> Box<dyn Iterator<Item = Rupture> + '_> {
        let mut idx = 0u64;
        let it = self
            .mfd
            .mag_rates()
            .into_iter()
            .filter(move |&(m, r)| r > 0.0 && same_mag(m, mag))
            .flat_map(move |(m, rate)| {
                self.nodal_planes.iter().flat_map(move |&(npw, np)| {
                    self.hypo_depths
                        .iter()
                        .map(move |&(hdw, hd)| (m, rate * npw * hdw, np, hd))
                })
            })
            .map(move |(m, rate, np, hd)| {
                idx += 1;
                let surface: Arc<dyn RuptureSurface> = Arc::new(self.surface(m, &np, hd));
                Rupture {
                    rup_id: self.rup_id(idx - 1),
                    mag: m,
                    rake: np.rake,
                    hypocenter: Point::new(self.location.lon, self.location.lat, hd),
                    surface: Some(surface),
                    occurrence: Occurrence::Rate(rate),
                    weight: 1.0,
                }
            });
        Box::new(it)
    }

    fn num_ruptures(&self) -> usize {
        let nmags = self.mfd.mag_rates().iter().filter(|(_, r)| *r > 0.0).count();
        nmags * self.nodal_planes.len() * self.hypo_depths.len()
    }

    fn location(&self) -> Option<Point> {
        Some(self.location)
    }

    fn point_ruptures(&self) -> Box<dyn Iterator<Item = Rupture> + '_> {
        let depth: f64 = self.hypo_depths.iter().map(|&(w, d)| w * d).sum();
        let rake = self
            .nodal_planes
            .iter()
            .max_by(|a, b| a.0.total_cmp(&b.0))
            .map_or(0.0, |(_, np)| np.rake);
        let it = self
            .mfd
            .mag_rates()
            .into_iter()
            .filter(|&(_, r)| r > 0.0)
            .enumerate()
            .map(move |(i, (mag, rate))| Rupture {
                rup_id: self.rup_id((1 << 31) | i as u64),
                mag,
                rake,
                hypocenter: Point::new(self.location.lon, self.location.lat, depth),
                surface: None,
                occurrence: Occurrence::Rate(rate),
                weight: 1.0,
            });
        Box::new(it)
    }

    fn mutex_weight(&self) -> f64 {
        self.mutex_weight
    }

    fn distances_to(&self, sites: &SiteCollection) -> Vec<f64> {
        let radius = self.maximum_radius();
        self.location
            .distance_to_mesh(sites.lons(), sites.lats(), false)
            .into_iter()
            .map(|d| (d - radius).max(0.0))
            .collect()
    }
}

// ============================================================================
// 6. CharacteristicSource
// ============================================================================

/// A single fault plane rupturing with the magnitudes of its MFD
#[derive(Debug, Clone)]
pub struct CharacteristicSource {
    source_id: String,
    id: u32,
    trt: String,
    surface: Arc<PlanarSurface>,
    mfd: Mfd,
    rake: f64,
    mutex_weight: f64,
}

impl CharacteristicSource {
    /// Create the source
    pub fn new(
        source_id: impl Into<String>,
        id: u32,
        trt: impl Into<String>,
        surface: PlanarSurface,
        mfd: Mfd,
        rake: f64,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            id,
            trt: trt.into(),
            surface: Arc::new(surface),
            mfd,
            rake,
            mutex_weight: 1.0,
        }
    }

    /// Set the weight inside a mutex group
    pub fn with_mutex_weight(mut self, weight: f64) -> Self {
        self.mutex_weight = weight;
        self
    }
}

impl SeismicSource for CharacteristicSource {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn id(&self) -> u32 {
        self.id
    }

    fn trt(&self) -> &str {
        &self.trt
    }

    fn iter_ruptures(&self, mag: Option<f64>) -> Box<dyn Iterator<Item = Rupture> + '_> {
        let hypocenter = self.surface.centroid();
        let it = self
            .mfd
            .mag_rates()
            .into_iter()
            .enumerate()
            .filter(move |&(_, (m, r))| r > 0.0 && same_mag(m, mag))
            .map(move |(i, (m, rate))| {
                let surface: Arc<dyn RuptureSurface> = self.surface.clone();
                Rupture {
                    rup_id: (u64::from(self.id) << 32) | i as u64,
                    mag: m,
                    rake: self.rake,
                    hypocenter,
                    surface: Some(surface),
                    occurrence: Occurrence::Rate(rate),
                    weight: 1.0,
                }
            });
        Box::new(it)
    }

    fn mutex_weight(&self) -> f64 {
        self.mutex_weight
    }
}

// ============================================================================
// 7. NonParametricSource
// ============================================================================

/// Explicit ruptures, each with its own occurrence-count PMF
#[derive(Debug, Clone)]
pub struct NonParametricSource {
    source_id: String,
    id: u32,
    trt: String,
    ruptures: Vec<Rupture>,
    mutex_weight: f64,
}

impl NonParametricSource {
    /// Build from (rupture, PMF) pairs; the PMF replaces the rupture occurrence
    pub fn new(
        source_id: impl Into<String>,
        id: u32,
        trt: impl Into<String>,
        data: Vec<(Rupture, Vec<f64>)>,
    ) -> Result<Self> {
        let ruptures = data
            .into_iter()
            .map(|(mut rup, pmf)| {
                rup.occurrence = Occurrence::pmf(pmf)?;
                Ok(rup)
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            source_id: source_id.into(),
            id,
            trt: trt.into(),
            ruptures,
            mutex_weight: 1.0,
        })
    }

    /// Set the weight inside a mutex group
    pub fn with_mutex_weight(mut self, weight: f64) -> Self {
        self.mutex_weight = weight;
        self
    }
}

impl SeismicSource for NonParametricSource {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn id(&self) -> u32 {
        self.id
    }

    fn trt(&self) -> &str {
        &self.trt
    }

    fn iter_ruptures(&self, mag: Option<f64>) -> Box<dyn Iterator<Item = Rupture> + '_> {
        Box::new(
            self.ruptures
                .iter()
                .filter(move |r| same_mag(r.mag, mag))
                .cloned(),
        )
    }

    fn num_ruptures(&self) -> usize {
        self.ruptures.len()
    }

    fn mutex_weight(&self) -> f64 {
        self.mutex_weight
    }
}

// ============================================================================
// 8. SourceGroup
// ============================================================================

/// Interdependence of the members of a group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Interdep {
    /// Independent events, composed by multiplying no-exceedance probabilities
    #[default]
    Indep,
    /// Mutually exclusive events, composed by weighted summation
    Mutex,
}

/// Sources of one tectonic region type sharing interdependence metadata
#[derive(Debug, Clone)]
pub struct SourceGroup {
    /// Group id
    pub grp_id: u32,
    /// Tectonic region type of every source in the group
    pub trt: String,
    /// Member sources
    pub sources: Vec<Arc<dyn SeismicSource>>,
    /// Source interdependence
    pub src_interdep: Interdep,
    /// Rupture interdependence
    pub rup_interdep: Interdep,
    /// Temporal occurrence model of the group
    pub tom: PoissonTom,
}

impl SourceGroup {
    /// Group of independent sources; all sources must share the group TRT
    pub fn new(
        grp_id: u32,
        trt: impl Into<String>,
        sources: Vec<Arc<dyn SeismicSource>>,
        tom: PoissonTom,
    ) -> Result<Self> {
        let trt = trt.into();
        if let Some(src) = sources.iter().find(|s| s.trt() != trt) {
            return Err(HazardError::InvalidSource(format!(
                "source {} has TRT {:?}, group {grp_id} has {trt:?}",
                src.source_id(),
                src.trt()
            )));
        }
        Ok(Self {
            grp_id,
            trt,
            sources,
            src_interdep: Interdep::Indep,
            rup_interdep: Interdep::Indep,
            tom,
        })
    }

    /// Set the interdependence flags.
    ///
    /// Mutually exclusive sources must carry weights summing to one.
    pub fn with_interdep(mut self, src_interdep: Interdep, rup_interdep: Interdep) -> Result<Self> {
        self.src_interdep = src_interdep;
        self.rup_interdep = rup_interdep;
        if src_interdep == Interdep::Mutex {
            let total: f64 = self.sources.iter().map(|s| s.mutex_weight()).sum();
            if (total - 1.0).abs() > 1e-6 {
                return Err(HazardError::MutexWeights {
                    grp_id: self.grp_id,
                    total,
                });
            }
        }
        Ok(self)
    }

    /// Atomic groups are never split across tasks
    pub fn atomic(&self) -> bool {
        self.src_interdep == Interdep::Mutex || self.rup_interdep == Interdep::Mutex
    }

    /// Total weight of the group
    pub fn weight(&self) -> f64 {
        self.sources.iter().map(|s| s.weight()).sum()
    }

    /// Distinct magnitudes of all the sources, sorted
    pub fn mags(&self) -> Vec<f64> {
        let mut mags: Vec<f64> = self.sources.iter().flat_map(|s| s.mags()).collect();
        mags.sort_by(f64::total_cmp);
        mags.dedup_by(|a, b| (*a - *b).abs() < 1e-9);
        mags
    }
}
