//! Per-site probability arrays of shape (levels, models)

use std::collections::BTreeMap;
use std::ops::{AddAssign, BitOrAssign};

use ndarray::Array2;

/// Mapping site id → array (L, G).
///
/// Depending on the stage the arrays hold probabilities of no exceedance
/// (while composing) or of exceedance (after [`ProbabilityMap::invert`]).
/// A missing site means no contribution yet.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbabilityMap {
    num_levels: usize,
    num_gsims: usize,
    curves: BTreeMap<u32, Array2<f64>>,
}

impl ProbabilityMap {
    /// Empty map for `num_levels` levels and `num_gsims` models
    pub fn new(num_levels: usize, num_gsims: usize) -> Self {
        Self {
            num_levels,
            num_gsims,
            curves: BTreeMap::new(),
        }
    }

    /// Number of levels (L)
    pub fn num_levels(&self) -> usize {
        self.num_levels
    }

    /// Number of models (G)
    pub fn num_gsims(&self) -> usize {
        self.num_gsims
    }

    /// Array of a site, created filled with `value` when missing
    pub fn setdefault(&mut self, sid: u32, value: f64) -> &mut Array2<f64> {
        let shape = (self.num_levels, self.num_gsims);
        self.curves
            .entry(sid)
            .or_insert_with(|| Array2::from_elem(shape, value))
    }

    /// Array of a site
    pub fn get(&self, sid: u32) -> Option<&Array2<f64>> {
        self.curves.get(&sid)
    }

    /// Number of sites with a contribution
    pub fn len(&self) -> usize {
        self.curves.len()
    }

    /// True when no site has a contribution
    pub fn is_empty(&self) -> bool {
        self.curves.is_empty()
    }

    /// Site ids, sorted
    pub fn sids(&self) -> impl Iterator<Item = u32> + '_ {
        self.curves.keys().copied()
    }

    /// Iterate over (sid, array)
    pub fn iter(&self) -> impl Iterator<Item = (u32, &Array2<f64>)> {
        self.curves.iter().map(|(&s, a)| (s, a))
    }

    /// Complement of every value
    pub fn invert(&self) -> ProbabilityMap {
        ProbabilityMap {
            num_levels: self.num_levels,
            num_gsims: self.num_gsims,
            curves: self
                .curves
                .iter()
                .map(|(&sid, a)| (sid, a.mapv(|x| 1.0 - x)))
                .collect(),
        }
    }

    /// Multiply every value by `weight`
    pub fn scale(&mut self, weight: f64) {
        for a in self.curves.values_mut() {
            *a *= weight;
        }
    }

    /// Estimated size in bytes of a map over `num_sites` sites
    pub fn estimated_nbytes(num_sites: usize, num_levels: usize, num_gsims: usize) -> u64 {
        (num_sites * num_levels * num_gsims * std::mem::size_of::<f64>()) as u64
    }
}

impl AddAssign<&ProbabilityMap> for ProbabilityMap {
    fn add_assign(&mut self, other: &ProbabilityMap) {
        for (sid, a) in other.iter() {
            *self.setdefault(sid, 0.0) += a;
        }
    }
}

/// Composition of independent exceedance probabilities: `1 - (1 - a)(1 - b)`
impl BitOrAssign<&ProbabilityMap> for ProbabilityMap {
    fn bitor_assign(&mut self, other: &ProbabilityMap) {
        for (sid, b) in other.iter() {
            let a = self.setdefault(sid, 0.0);
            a.zip_mut_with(b, |x, &y| *x = 1.0 - (1.0 - *x) * (1.0 - y));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_setdefault_and_invert() {
        let mut pmap = ProbabilityMap::new(3, 2);
        *pmap.setdefault(4, 1.0) *= 0.9;
        assert_eq!(pmap.len(), 1);
        assert_relative_eq!(pmap.get(4).unwrap()[[2, 1]], 0.9);
        let poes = pmap.invert();
        assert_relative_eq!(poes.get(4).unwrap()[[0, 0]], 0.1, epsilon = 1e-12);
        assert!(pmap.get(3).is_none());
    }

    #[test]
    fn test_bitor_composes_independent_probabilities() {
        let mut a = ProbabilityMap::new(1, 1);
        a.setdefault(0, 0.2);
        let mut b = ProbabilityMap::new(1, 1);
        b.setdefault(0, 0.5);
        b.setdefault(1, 0.3);
        a |= &b;
        assert_relative_eq!(a.get(0).unwrap()[[0, 0]], 0.6);
        assert_relative_eq!(a.get(1).unwrap()[[0, 0]], 0.3);
    }

    #[test]
    fn test_add_and_scale() {
        let mut a = ProbabilityMap::new(2, 1);
        let mut b = ProbabilityMap::new(2, 1);
        b.setdefault(7, 0.5);
        b.scale(0.4);
        a += &b;
        a += &b;
        assert_relative_eq!(a.get(7).unwrap()[[1, 0]], 0.4);
    }
}
