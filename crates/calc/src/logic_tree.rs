//! Ground motion logic tree
//!
//! Every tectonic region type carries weighted alternative models; a
//! realization picks one model per region type and its weight is the
//! product of the branch weights.

use std::collections::BTreeMap;
use std::sync::Arc;

use seisma_hazardlib::gsim::GroundMotionModel;

use crate::error::{CalcError, Result};

/// One weighted alternative
#[derive(Debug, Clone)]
pub struct GsimBranch {
    pub gsim: Arc<dyn GroundMotionModel>,
    pub weight: f64,
}

impl GsimBranch {
    pub fn new(gsim: Arc<dyn GroundMotionModel>, weight: f64) -> Self {
        Self { gsim, weight }
    }
}

/// A path through the tree
#[derive(Debug, Clone, PartialEq)]
pub struct Realization {
    pub ordinal: usize,
    pub weight: f64,
    /// Index of the chosen branch per TRT
    pub gsim_index: BTreeMap<String, usize>,
}

#[derive(Debug, Clone)]
pub struct GsimLogicTree {
    branches: BTreeMap<String, Vec<GsimBranch>>,
}

impl GsimLogicTree {
    /// Branch weights must be positive and sum to one per TRT
    pub fn new(branches: BTreeMap<String, Vec<GsimBranch>>) -> Result<Self> {
        if branches.is_empty() {
            return Err(CalcError::config("empty logic tree"));
        }
        for (trt, brs) in &branches {
            if brs.is_empty() {
                return Err(CalcError::config(format!("no models for TRT {trt:?}")));
            }
            if let Some(br) = brs.iter().find(|b| b.weight <= 0.0 || b.weight.is_nan()) {
                return Err(CalcError::config(format!(
                    "invalid weight {} for {} in {trt:?}",
                    br.weight,
                    br.gsim.name()
                )));
            }
            let total: f64 = brs.iter().map(|b| b.weight).sum();
            if (total - 1.0).abs() > 1e-6 {
                return Err(CalcError::config(format!(
                    "the weights for {trt:?} sum to {total}, not 1"
                )));
            }
        }
        Ok(Self { branches })
    }

    /// Single model with weight 1 for each TRT
    pub fn single(gsims: BTreeMap<String, Arc<dyn GroundMotionModel>>) -> Result<Self> {
        Self::new(
            gsims
                .into_iter()
                .map(|(trt, gsim)| (trt, vec![GsimBranch::new(gsim, 1.0)]))
                .collect(),
        )
    }

    pub fn trts(&self) -> impl Iterator<Item = &str> {
        self.branches.keys().map(String::as_str)
    }

    /// Models of a TRT in branch order
    pub fn gsims(&self, trt: &str) -> Result<Vec<Arc<dyn GroundMotionModel>>> {
        self.branches
            .get(trt)
            .map(|brs| brs.iter().map(|b| Arc::clone(&b.gsim)).collect())
            .ok_or_else(|| CalcError::config(format!("no models for TRT {trt:?}")))
    }

    pub fn num_rlzs(&self) -> usize {
        self.branches.values().map(Vec::len).product()
    }

    /// Cartesian product of the branches, the last TRT varying fastest
    pub fn realizations(&self) -> Vec<Realization> {
        let trts: Vec<&String> = self.branches.keys().collect();
        let sizes: Vec<usize> = self.branches.values().map(Vec::len).collect();
        (0..self.num_rlzs())
            .map(|ordinal| {
                let mut rest = ordinal;
                let mut gsim_index = BTreeMap::new();
                let mut weight = 1.0;
                for (t, trt) in trts.iter().enumerate().rev() {
                    let g = rest % sizes[t];
                    rest /= sizes[t];
                    weight *= self.branches[*trt][g].weight;
                    gsim_index.insert((*trt).clone(), g);
                }
                Realization {
                    ordinal,
                    weight,
                    gsim_index,
                }
            })
            .collect()
    }

    /// Realization ordinals using each model of a TRT
    pub fn rlzs_by_gsim(&self, trt: &str) -> Result<Vec<Vec<usize>>> {
        let n = self
            .branches
            .get(trt)
            .map(Vec::len)
            .ok_or_else(|| CalcError::config(format!("no models for TRT {trt:?}")))?;
        let mut out = vec![Vec::new(); n];
        for rlz in self.realizations() {
            out[rlz.gsim_index[trt]].push(rlz.ordinal);
        }
        Ok(out)
    }

    pub fn weights(&self) -> Vec<f64> {
        self.realizations().iter().map(|r| r.weight).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use seisma_hazardlib::gsim::LinearAttenuation;
    use seisma_hazardlib::DistanceParam;

    fn gsim(name: &str) -> Arc<dyn GroundMotionModel> {
        Arc::new(LinearAttenuation::generic(name, DistanceParam::Rrup))
    }

    fn tree() -> GsimLogicTree {
        let mut branches = BTreeMap::new();
        branches.insert(
            "Active Shallow Crust".to_string(),
            vec![GsimBranch::new(gsim("A"), 0.6), GsimBranch::new(gsim("B"), 0.4)],
        );
        branches.insert(
            "Stable Continental".to_string(),
            vec![
                GsimBranch::new(gsim("C"), 0.5),
                GsimBranch::new(gsim("D"), 0.3),
                GsimBranch::new(gsim("E"), 0.2),
            ],
        );
        GsimLogicTree::new(branches).unwrap()
    }

    #[test]
    fn test_realizations() {
        let lt = tree();
        let rlzs = lt.realizations();
        assert_eq!(rlzs.len(), 6);
        assert_eq!(rlzs[1].gsim_index["Stable Continental"], 1);
        assert_eq!(rlzs[1].gsim_index["Active Shallow Crust"], 0);
        assert_eq!(rlzs[3].gsim_index["Active Shallow Crust"], 1);
        assert_relative_eq!(rlzs[1].weight, 0.18, epsilon = 1e-12);
        assert_relative_eq!(lt.weights().iter().sum::<f64>(), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_rlzs_by_gsim() {
        let lt = tree();
        assert_eq!(lt.rlzs_by_gsim("Active Shallow Crust").unwrap(), vec![vec![0, 1, 2], vec![3, 4, 5]]);
        assert_eq!(lt.rlzs_by_gsim("Stable Continental").unwrap(), vec![vec![0, 3], vec![1, 4], vec![2, 5]]);
        assert!(lt.rlzs_by_gsim("Volcanic").is_err());
    }

    #[test]
    fn test_weights_must_sum_to_one() {
        let mut branches = BTreeMap::new();
        branches.insert(
            "Active Shallow Crust".to_string(),
            vec![GsimBranch::new(gsim("A"), 0.6), GsimBranch::new(gsim("B"), 0.6)],
        );
        assert!(matches!(GsimLogicTree::new(branches), Err(CalcError::Config(_))));
    }
}
