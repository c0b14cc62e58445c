//! Magnitude-dependent integration distances and source/site filtering

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{HazardError, Result};
use crate::site::SiteCollection;
use crate::source::SeismicSource;

/// Magnitude rounded to two decimals, used as a map key.
///
/// Displays as `"%.2f"`, the form used for rupture store keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MagKey(i32);

impl MagKey {
    /// Key of a magnitude
    pub fn new(mag: f64) -> Self {
        MagKey((mag * 100.0).round() as i32)
    }

    /// Magnitude value of the key
    pub fn value(&self) -> f64 {
        f64::from(self.0) / 100.0
    }
}

impl fmt::Display for MagKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.2}", self.value())
    }
}

/// Piecewise-linear magnitude → distance mapping per tectonic region type.
///
/// A single pair means a constant distance. TRTs without an entry use the
/// `"default"` entry; without that the distance is unbounded.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MagDepDistance {
    magdist: BTreeMap<String, Vec<(f64, f64)>>,
}

impl MagDepDistance {
    /// Key of the fallback entry
    pub const DEFAULT: &'static str = "default";

    /// Build from TRT → (magnitude, distance) pairs
    pub fn new(magdist: BTreeMap<String, Vec<(f64, f64)>>) -> Result<Self> {
        let mut out = BTreeMap::new();
        for (trt, mut pairs) in magdist {
            if pairs.is_empty() {
                return Err(HazardError::config(format!("no distances for {trt:?}")));
            }
            if pairs.iter().any(|&(_, d)| d < 0.0 || d.is_nan()) {
                return Err(HazardError::config(format!(
                    "negative maximum distance for {trt:?}"
                )));
            }
            pairs.sort_by(|a, b| a.0.total_cmp(&b.0));
            out.insert(trt, pairs);
        }
        Ok(Self { magdist: out })
    }

    /// The same distance for every TRT and magnitude
    pub fn constant(dist: f64) -> Self {
        let mut magdist = BTreeMap::new();
        magdist.insert(Self::DEFAULT.to_string(), vec![(0.0, dist)]);
        Self { magdist }
    }

    /// Replace the pairs of one TRT
    pub fn set(&mut self, trt: impl Into<String>, mut pairs: Vec<(f64, f64)>) {
        pairs.sort_by(|a, b| a.0.total_cmp(&b.0));
        self.magdist.insert(trt.into(), pairs);
    }

    fn pairs(&self, trt: &str) -> Option<&[(f64, f64)]> {
        self.magdist
            .get(trt)
            .or_else(|| self.magdist.get(Self::DEFAULT))
            .map(Vec::as_slice)
    }

    /// Integration distance for a magnitude, clamped at the tabulated ends
    pub fn get(&self, trt: &str, mag: f64) -> f64 {
        match self.pairs(trt) {
            None => f64::INFINITY,
            Some([(_, d)]) => *d,
            Some(pairs) => interp(mag, pairs),
        }
    }

    /// Largest distance of a TRT
    pub fn max(&self, trt: &str) -> f64 {
        self.pairs(trt).map_or(f64::INFINITY, |pairs| {
            pairs.iter().map(|p| p.1).fold(0.0, f64::max)
        })
    }

    /// `n` evenly spaced distances from 0 to the maximum distance
    pub fn get_dist_bins(&self, trt: &str, n: usize) -> Vec<f64> {
        linspace(0.0, self.max(trt), n)
    }

    /// Distance per magnitude
    pub fn interp(&self, trt: &str, mags: &[f64]) -> BTreeMap<MagKey, f64> {
        mags.iter()
            .map(|&m| (MagKey::new(m), self.get(trt, m)))
            .collect()
    }

    /// Largest distance across all TRTs
    pub fn overall_max(&self) -> f64 {
        self.magdist
            .values()
            .flat_map(|pairs| pairs.iter().map(|p| p.1))
            .fold(0.0, f64::max)
    }
}

fn interp(x: f64, pairs: &[(f64, f64)]) -> f64 {
    let first = pairs[0];
    let last = pairs[pairs.len() - 1];
    if x <= first.0 {
        return first.1;
    }
    if x >= last.0 {
        return last.1;
    }
    for w in pairs.windows(2) {
        let ((x0, y0), (x1, y1)) = (w[0], w[1]);
        if x <= x1 {
            return y0 + (y1 - y0) * (x - x0) / (x1 - x0);
        }
    }
    last.1
}

/// `n` evenly spaced values over `[start, stop]`
pub fn linspace(start: f64, stop: f64, n: usize) -> Vec<f64> {
    match n {
        0 => vec![],
        1 => vec![start],
        _ => {
            let step = (stop - start) / (n - 1) as f64;
            (0..n).map(|i| start + step * i as f64).collect()
        }
    }
}

/// Finds the sites within the integration distance of each source
#[derive(Debug, Clone)]
pub struct SourceFilter {
    sitecol: SiteCollection,
    integration_distance: MagDepDistance,
}

impl SourceFilter {
    /// Filter over the given sites
    pub fn new(sitecol: SiteCollection, integration_distance: MagDepDistance) -> Self {
        Self {
            sitecol,
            integration_distance,
        }
    }

    /// The complete site collection
    pub fn sitecol(&self) -> &SiteCollection {
        &self.sitecol
    }

    /// Integration distances
    pub fn integration_distance(&self) -> &MagDepDistance {
        &self.integration_distance
    }

    /// Sites close to the source, `None` if there are none
    pub fn get_close_sites(&self, src: &dyn SeismicSource) -> Option<SiteCollection> {
        let maxdist = self.integration_distance.max(src.trt());
        let mask: Vec<bool> = src
            .distances_to(&self.sitecol)
            .into_iter()
            .map(|d| d <= maxdist)
            .collect();
        if mask.iter().any(|&m| m) {
            Some(self.sitecol.filter(&mask))
        } else {
            None
        }
    }

    /// Pairs (source, close sites), skipping sources without close sites
    pub fn filter<'a>(
        &'a self,
        sources: &'a [Arc<dyn SeismicSource>],
    ) -> impl Iterator<Item = (Arc<dyn SeismicSource>, SiteCollection)> + 'a {
        sources.iter().filter_map(move |src| {
            self.get_close_sites(src.as_ref())
                .map(|sites| (Arc::clone(src), sites))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo::{Point, KM_TO_DEGREES};
    use crate::site::Site;
    use crate::source::{Mfd, NodalPlane, PointSource};
    use approx::assert_relative_eq;

    fn magdist() -> MagDepDistance {
        let mut map = BTreeMap::new();
        map.insert("ASC".to_string(), vec![(7.0, 300.0), (5.0, 100.0)]);
        map.insert("default".to_string(), vec![(5.0, 50.0)]);
        MagDepDistance::new(map).unwrap()
    }

    #[test]
    fn test_mag_dep_distance_interpolates() {
        let md = magdist();
        assert_relative_eq!(md.get("ASC", 6.0), 200.0);
        assert_relative_eq!(md.get("ASC", 4.0), 100.0);
        assert_relative_eq!(md.get("ASC", 8.0), 300.0);
        assert_relative_eq!(md.get("Volcanic", 8.0), 50.0);
        assert_relative_eq!(md.max("ASC"), 300.0);
        assert_eq!(MagDepDistance::default().get("ASC", 5.0), f64::INFINITY);
    }

    #[test]
    fn test_dist_bins() {
        let bins = magdist().get_dist_bins("ASC", 51);
        assert_eq!(bins.len(), 51);
        assert_eq!(bins[0], 0.0);
        assert_relative_eq!(bins[50], 300.0);
        assert_relative_eq!(bins[1], 6.0);
    }

    #[test]
    fn test_mag_key_format() {
        let key = MagKey::new(5.549999);
        assert_eq!(key.to_string(), "5.55");
        assert!(MagKey::new(5.0) < MagKey::new(10.0));
        let ddic = magdist().interp("ASC", &[5.0, 6.0]);
        assert_relative_eq!(ddic[&MagKey::new(6.0)], 200.0);
    }

    #[test]
    fn test_source_filter_skips_far_sources() {
        let sites: Vec<Site> = [0.1, 3.0]
            .iter()
            .map(|&lon| Site::new(Point::new(lon, 0.0, 0.0), 760.0))
            .collect();
        let filter = SourceFilter::new(SiteCollection::new(&sites), MagDepDistance::constant(100.0));
        let src = PointSource::new(
            "p",
            0,
            "ASC",
            Point::new(0.0, 0.0, 0.0),
            Mfd::EvenlyDiscretized {
                min_mag: 5.0,
                bin_width: 0.1,
                occurrence_rates: vec![0.01],
            },
            vec![(1.0, NodalPlane { strike: 0.0, dip: 90.0, rake: 0.0 })],
            vec![(1.0, 5.0)],
            (0.0, 15.0),
            1.0,
        )
        .unwrap();
        let close = filter.get_close_sites(&src).unwrap();
        assert_eq!(close.sids(), &[0]);
        assert!(3.0 / KM_TO_DEGREES > 100.0);
        let far = PointSource::new(
            "q",
            1,
            "ASC",
            Point::new(10.0, 10.0, 0.0),
            Mfd::EvenlyDiscretized {
                min_mag: 5.0,
                bin_width: 0.1,
                occurrence_rates: vec![0.01],
            },
            vec![(1.0, NodalPlane { strike: 0.0, dip: 90.0, rake: 0.0 })],
            vec![(1.0, 5.0)],
            (0.0, 15.0),
            1.0,
        )
        .unwrap();
        let srcs: Vec<Arc<dyn SeismicSource>> = vec![Arc::new(src), Arc::new(far)];
        assert_eq!(filter.filter(&srcs).count(), 1);
    }
}
