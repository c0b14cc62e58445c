//! Effect of ruptures: maximum median intensity by magnitude and distance.
//!
//! Used to derive magnitude-dependent point-source distances and integration
//! distances from a minimum intensity.

use std::collections::BTreeMap;
use std::sync::Arc;

use ndarray::Array2;
use tracing::info;

use crate::contexts::{ContextMaker, ContextParams, PointSourceDistance};
use crate::error::{HazardError, Result};
use crate::filters::{MagDepDistance, MagKey};
use crate::gsim::GroundMotionModel;
use crate::imt::Imtls;
use crate::site::SiteCollection;

/// Number of distance bins used to tabulate the effect
pub const EFFECT_DIST_BINS: usize = 51;

/// Largest magnitude considered by [`Effect::collapse_value`]
const COLLAPSE_MAG_CUTOFF: f64 = 7.0;

/// Intensities per magnitude over a fixed set of distances
#[derive(Debug, Clone, PartialEq)]
pub struct Effect {
    effect_by_mag: BTreeMap<MagKey, Vec<f64>>,
    dists: Vec<f64>,
}

impl Effect {
    /// Every intensity vector must have one value per distance
    pub fn new(effect_by_mag: BTreeMap<MagKey, Vec<f64>>, dists: Vec<f64>) -> Result<Self> {
        if dists.is_empty() {
            return Err(HazardError::config("effect table without distances"));
        }
        for (mag, intensities) in &effect_by_mag {
            if intensities.len() != dists.len() {
                return Err(HazardError::LengthMismatch {
                    field: format!("effect for magnitude {mag}"),
                    got: intensities.len(),
                    expected: dists.len(),
                });
            }
        }
        Ok(Self { effect_by_mag, dists })
    }

    /// Tabulated distances
    pub fn dists(&self) -> &[f64] {
        &self.dists
    }

    /// Intensities of a magnitude
    pub fn intensities(&self, mag: f64) -> Option<&[f64]> {
        self.effect_by_mag.get(&MagKey::new(mag)).map(Vec::as_slice)
    }

    fn dist_index(&self, dist: f64) -> usize {
        let idx = self.dists.partition_point(|&d| d < dist);
        idx.min(self.dists.len() - 1)
    }

    /// Intensity at `collapse_dist` for the first magnitude above 7, or the
    /// largest magnitude when none is above 7
    pub fn collapse_value(&self, collapse_dist: f64) -> f64 {
        let effect = self
            .effect_by_mag
            .iter()
            .find(|(mag, _)| mag.value() > COLLAPSE_MAG_CUTOFF)
            .or_else(|| self.effect_by_mag.iter().next_back())
            .map(|(_, e)| e);
        match effect {
            Some(effect) => effect[self.dist_index(collapse_dist)],
            None => 0.0,
        }
    }

    /// Intensity of a magnitude at a distance; distances beyond the table
    /// use the last bin
    pub fn call(&self, mag: f64, dist: f64) -> Option<f64> {
        self.intensities(mag).map(|e| e[self.dist_index(dist)])
    }

    /// Distance at which each magnitude drops to `intensity`.
    ///
    /// Below every tabulated value the largest distance is returned, above
    /// every value the smallest; otherwise the distance is interpolated
    /// linearly over the (intensity, distance) pairs sorted by intensity.
    pub fn dist_by_mag(&self, intensity: f64) -> BTreeMap<MagKey, f64> {
        let first = self.dists[0];
        let last = self.dists[self.dists.len() - 1];
        self.effect_by_mag
            .iter()
            .map(|(&mag, intensities)| {
                let min = intensities.iter().copied().fold(f64::INFINITY, f64::min);
                let max = intensities.iter().copied().fold(f64::NEG_INFINITY, f64::max);
                let dist = if intensity < min {
                    last
                } else if intensity > max {
                    first
                } else {
                    interp_sorted(intensity, intensities, &self.dists)
                };
                (mag, dist)
            })
            .collect()
    }

    /// Point-source distances derived from the intensity at `maxdist`
    pub fn suggested_pointsource_distance(&self, maxdist: f64) -> PointSourceDistance {
        PointSourceDistance::ByMag(self.dist_by_mag(self.collapse_value(maxdist)))
    }
}

fn interp_sorted(x: f64, xs: &[f64], ys: &[f64]) -> f64 {
    let mut pairs: Vec<(f64, f64)> = xs.iter().copied().zip(ys.iter().copied()).collect();
    pairs.sort_by(|a, b| a.0.total_cmp(&b.0));
    for w in pairs.windows(2) {
        let ((x0, y0), (x1, y1)) = (w[0], w[1]);
        if x >= x0 && x <= x1 {
            if x1 == x0 {
                return y0;
            }
            return y0 + (y1 - y0) * (x - x0) / (x1 - x0);
        }
    }
    pairs[pairs.len() - 1].1
}

/// Maximum intensity over the models of each TRT, per magnitude an array
/// of shape (distance bins, TRTs) with TRTs in map order
pub fn get_effect_by_mag(
    mags: &[f64],
    site1: &SiteCollection,
    gsims_by_trt: &BTreeMap<String, Vec<Arc<dyn GroundMotionModel>>>,
    maximum_distance: &MagDepDistance,
    imtls: &Imtls,
) -> Result<BTreeMap<MagKey, Array2<f64>>> {
    let mut gmv: Vec<Array2<f64>> = vec![Array2::zeros((EFFECT_DIST_BINS, gsims_by_trt.len())); mags.len()];
    for (t, (trt, gsims)) in gsims_by_trt.iter().enumerate() {
        let dist_bins = maximum_distance.get_dist_bins(trt, EFFECT_DIST_BINS);
        let params = ContextParams {
            imtls: imtls.clone(),
            maximum_distance: maximum_distance.clone(),
            ..ContextParams::default()
        };
        let cmaker = ContextMaker::new(trt.clone(), gsims.clone(), params)?;
        let table = cmaker.max_intensity(site1, mags, &dist_bins)?;
        for (m, row) in table.outer_iter().enumerate() {
            gmv[m].column_mut(t).assign(&row);
        }
    }
    Ok(mags.iter().map(|&m| MagKey::new(m)).zip(gmv).collect())
}

/// Build one [`Effect`] per TRT.
///
/// With a positive `minimum_intensity` the integration distance of every
/// TRT is replaced by the distance at which that intensity is reached.
pub fn get_effect(
    mags_by_trt: &BTreeMap<String, Vec<f64>>,
    site1: &SiteCollection,
    gsims_by_trt: &BTreeMap<String, Vec<Arc<dyn GroundMotionModel>>>,
    maximum_distance: &mut MagDepDistance,
    minimum_intensity: f64,
    imtls: &Imtls,
) -> Result<BTreeMap<String, Effect>> {
    if let Some(trt) = gsims_by_trt.keys().find(|trt| !mags_by_trt.contains_key(*trt)) {
        return Err(HazardError::config(format!("missing magnitudes for TRT {trt:?}")));
    }
    info!("computing the effect of the ruptures");
    let mut allmags: Vec<f64> = mags_by_trt.values().flatten().copied().collect();
    allmags.sort_by(f64::total_cmp);
    allmags.dedup_by_key(|m| MagKey::new(*m));
    let eff_by_mag = get_effect_by_mag(&allmags, site1, gsims_by_trt, maximum_distance, imtls)?;

    let mut effects = BTreeMap::new();
    for (t, trt) in gsims_by_trt.keys().enumerate() {
        let dists = maximum_distance.get_dist_bins(trt, EFFECT_DIST_BINS);
        let table = mags_by_trt[trt]
            .iter()
            .filter_map(|&m| {
                let key = MagKey::new(m);
                eff_by_mag.get(&key).map(|arr| (key, arr.column(t).to_vec()))
            })
            .collect();
        effects.insert(trt.clone(), Effect::new(table, dists)?);
    }
    if minimum_intensity > 0.0 {
        for (trt, eff) in &effects {
            let pairs: Vec<(f64, f64)> = eff
                .dist_by_mag(minimum_intensity)
                .into_iter()
                .map(|(mag, dist)| (mag.value(), dist))
                .collect();
            if !pairs.is_empty() {
                maximum_distance.set(trt.clone(), pairs);
            }
        }
    }
    Ok(effects)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;
    use approx::assert_relative_eq;

    fn effect() -> Effect {
        let table = [
            (4.5, vec![1.0, 0.95, 0.7, 0.6, 0.5, 0.3]),
            (5.0, vec![1.2, 1.1, 0.7, 0.69, 0.6, 0.5]),
            (5.5, vec![1.5, 1.2, 0.89, 0.85, 0.82, 0.6]),
            (6.0, vec![2.0, 1.5, 0.9, 0.85, 0.81, 0.6]),
        ];
        let effect_by_mag = table.into_iter().map(|(m, e)| (MagKey::new(m), e)).collect();
        Effect::new(effect_by_mag, vec![0.0, 10.0, 20.0, 30.0, 40.0, 50.0]).unwrap()
    }

    fn values(map: BTreeMap<MagKey, f64>) -> Vec<f64> {
        map.into_values().collect()
    }

    #[test]
    fn test_dist_by_mag() {
        let eff = effect();
        assert_eq!(values(eff.dist_by_mag(0.0)), vec![50.0; 4]);

        let expected = [12.0, 15.0, 19.677419, 20.0];
        for (got, exp) in values(eff.dist_by_mag(0.9)).iter().zip(expected) {
            assert_relative_eq!(*got, exp, epsilon = 1e-5);
        }
        let expected = [0.0, 10.0, 13.225806, 16.666667];
        for (got, exp) in values(eff.dist_by_mag(1.1)).iter().zip(expected) {
            assert_relative_eq!(*got, exp, epsilon = 1e-5);
        }
    }

    #[test]
    fn test_collapse_value_and_call() {
        let eff = effect();
        assert_relative_eq!(eff.collapse_value(35.0), 0.81);
        assert_relative_eq!(eff.collapse_value(60.0), 0.6);
        assert_eq!(eff.call(5.0, 10.0), Some(1.1));
        assert_eq!(eff.call(5.0, 500.0), Some(0.5));
        assert_eq!(eff.call(7.0, 10.0), None);
    }

    #[test]
    fn test_mismatched_table() {
        let mut table = BTreeMap::new();
        table.insert(MagKey::new(5.0), vec![1.0, 0.5]);
        assert!(Effect::new(table, vec![0.0, 10.0, 20.0]).is_err());
    }

    #[test]
    fn test_effect_from_models() {
        let site1 = testing::sitecol(&[0.0]);
        let mut gsims_by_trt = BTreeMap::new();
        gsims_by_trt.insert(testing::TRT.to_string(), testing::gsims());
        let mut mags_by_trt = BTreeMap::new();
        mags_by_trt.insert(testing::TRT.to_string(), vec![5.0, 6.0, 7.0]);
        let mut maxdist = MagDepDistance::constant(300.0);

        let effects = get_effect(&mags_by_trt, &site1, &gsims_by_trt, &mut maxdist, 0.01, &testing::imtls()).unwrap();
        let eff = &effects[testing::TRT];
        assert_eq!(eff.dists().len(), EFFECT_DIST_BINS);
        for mag in [5.0, 6.0, 7.0] {
            let e = eff.intensities(mag).unwrap();
            assert!(e.windows(2).all(|w| w[0] >= w[1]));
        }
        // bigger magnitudes reach further
        let d5 = maxdist.get(testing::TRT, 5.0);
        let d7 = maxdist.get(testing::TRT, 7.0);
        assert!(d5 <= d7);
        assert!(d7 <= 300.0);

        match eff.suggested_pointsource_distance(300.0) {
            PointSourceDistance::ByMag(map) => assert_eq!(map.len(), 3),
            other => panic!("expected distances by magnitude, got {other:?}"),
        }
    }
}
