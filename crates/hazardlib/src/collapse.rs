//! Collapsing of near-duplicate contexts and distant point ruptures.
//!
//! Merging keeps the composed probability of no exceedance of independent
//! ruptures: Poissonian rates add up, occurrence PMFs convolve.

use std::collections::HashMap;
use std::sync::Arc;

use crate::contexts::{get_distances, DistanceParam, Requirements, RuptureContext, RuptureParam};
use crate::filters::{MagDepDistance, MagKey};
use crate::site::SiteCollection;
use crate::source::{Occurrence, Rupture};

/// PMF of the sum of two independent occurrence counts.
///
/// The result has length `n1 + n2 - 1`.
pub fn combine_pmf(o1: &[f64], o2: &[f64]) -> Vec<f64> {
    if o1.is_empty() || o2.is_empty() {
        return Vec::new();
    }
    let mut out = vec![0.0; o1.len() + o2.len() - 1];
    for (i, &a) in o1.iter().enumerate() {
        for (j, &b) in o2.iter().enumerate() {
            out[i + j] += a * b;
        }
    }
    out
}

/// Anything carrying an [`Occurrence`] that can be merged
pub trait Collapsible: Clone {
    /// Current occurrence
    fn occurrence(&self) -> &Occurrence;

    /// Replace the occurrence
    fn set_occurrence(&mut self, occurrence: Occurrence);
}

impl Collapsible for Rupture {
    fn occurrence(&self) -> &Occurrence {
        &self.occurrence
    }

    fn set_occurrence(&mut self, occurrence: Occurrence) {
        self.occurrence = occurrence;
    }
}

impl Collapsible for RuptureContext {
    fn occurrence(&self) -> &Occurrence {
        &self.occurrence
    }

    fn set_occurrence(&mut self, occurrence: Occurrence) {
        self.occurrence = occurrence;
    }
}

impl<T: Collapsible> Collapsible for (T, Arc<SiteCollection>) {
    fn occurrence(&self) -> &Occurrence {
        self.0.occurrence()
    }

    fn set_occurrence(&mut self, occurrence: Occurrence) {
        self.0.set_occurrence(occurrence);
    }
}

/// Merge a group into at most two items: one parametric and one
/// non-parametric. The first member of each kind carries the rest of the data.
pub fn collapse_group<T: Collapsible>(items: Vec<T>) -> Vec<T> {
    if items.len() < 2 {
        return items;
    }
    let (prups, nrups): (Vec<T>, Vec<T>) = items
        .into_iter()
        .partition(|item| item.occurrence().is_parametric());
    let mut out = Vec::with_capacity(2);
    if prups.len() > 1 {
        let rate = prups.iter().map(|r| r.occurrence().occurrence_rate()).sum();
        let mut merged = prups[0].clone();
        merged.set_occurrence(Occurrence::Rate(rate));
        out.push(merged);
    } else {
        out.extend(prups);
    }
    if nrups.len() > 1 {
        let pmf = nrups
            .iter()
            .filter_map(|n| match n.occurrence() {
                Occurrence::Pmf(p) => Some(p.to_vec()),
                Occurrence::Rate(_) => None,
            })
            .reduce(|acc, p| combine_pmf(&acc, &p))
            .unwrap_or_default();
        let mut merged = nrups[0].clone();
        merged.set_occurrence(Occurrence::Pmf(pmf.into()));
        out.push(merged);
    } else {
        out.extend(nrups);
    }
    out
}

fn round_to(x: f64, decimals: i32) -> i64 {
    (x * 10f64.powi(decimals)).round() as i64
}

fn collapse_key(ctx: &RuptureContext, req: &Requirements, collapse_level: u8) -> Vec<i64> {
    let mut key = vec![ctx.tom.key() as i64];
    key.extend(ctx.sids().iter().map(|&s| i64::from(s)));
    key.push(-1);
    key.push(ctx.mag.to_bits() as i64);
    let decimals = if collapse_level >= 3 {
        0
    } else {
        for &param in &req.rupture {
            if param != RuptureParam::Mag {
                let value = ctx.rupture_param(param).unwrap_or(f64::NAN);
                key.push(value.to_bits() as i64);
            }
        }
        1
    };
    for (param, values) in ctx.distances().iter() {
        if req.distances.contains(&param) {
            key.extend(values.iter().map(|&d| round_to(d, decimals)));
        }
    }
    key
}

/// Merge contexts with the same site ids, rupture parameters and rounded
/// distances.
///
/// At collapse level 3 and above only the magnitude is compared and distances
/// are rounded to 1 km, otherwise every required rupture parameter is compared
/// and distances are rounded to 100 m. Group order follows first appearance.
pub fn collapse_contexts(ctxs: Vec<RuptureContext>, req: &Requirements, collapse_level: u8) -> Vec<RuptureContext> {
    if ctxs.len() <= 1 {
        return ctxs;
    }
    let mut index: HashMap<Vec<i64>, usize> = HashMap::new();
    let mut groups: Vec<Vec<RuptureContext>> = Vec::new();
    for ctx in ctxs {
        let key = collapse_key(&ctx, req, collapse_level);
        let idx = *index.entry(key).or_insert_with(|| {
            groups.push(Vec::new());
            groups.len() - 1
        });
        groups[idx].push(ctx);
    }
    groups.into_iter().flat_map(collapse_group).collect()
}

/// Collapse point ruptures (no surface) of the same magnitude and site set.
///
/// Ruptures farther than the integration distance are dropped; the others are
/// sorted by closest distance and merged within at most `bins` buckets of
/// near-equal population. Finite ruptures pass through untouched.
pub fn collapse_point_ruptures(
    rups: Vec<(Rupture, Arc<SiteCollection>)>,
    trt: &str,
    maximum_distance: &MagDepDistance,
    bins: usize,
) -> Vec<(Rupture, Arc<SiteCollection>)> {
    let mut output = Vec::new();
    let mut index: HashMap<(MagKey, Vec<u32>), usize> = HashMap::new();
    let mut groups: Vec<Vec<(Rupture, Arc<SiteCollection>)>> = Vec::new();
    for item in rups {
        if !item.0.is_point() {
            output.push(item);
            continue;
        }
        let key = (MagKey::new(item.0.mag), item.1.sids().to_vec());
        let idx = *index.entry(key).or_insert_with(|| {
            groups.push(Vec::new());
            groups.len() - 1
        });
        groups[idx].push(item);
    }
    for group in groups {
        if group.len() == 1 {
            output.extend(group);
            continue;
        }
        let mdist = maximum_distance.get(trt, group[0].0.mag);
        let mut close: Vec<(f64, (Rupture, Arc<SiteCollection>))> = group
            .into_iter()
            .filter_map(|(rup, sites)| {
                let dist = get_distances(&rup, sites.lons(), sites.lats(), DistanceParam::Rrup)
                    .into_iter()
                    .fold(f64::INFINITY, f64::min);
                (dist <= mdist).then_some((dist, (rup, sites)))
            })
            .collect();
        close.sort_by(|a, b| a.0.total_cmp(&b.0));
        let n = close.len();
        let nbins = bins.max(1).min(n.max(1));
        let mut items = close.into_iter().map(|(_, item)| item);
        for b in 0..nbins {
            let size = (b + 1) * n / nbins - b * n / nbins;
            let bucket: Vec<_> = items.by_ref().take(size).collect();
            output.extend(collapse_group(bucket));
        }
    }
    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo::Point;
    use crate::site::Site;
    use crate::tom::PoissonTom;
    use approx::assert_relative_eq;

    fn req() -> Requirements {
        let mut req = Requirements::default();
        req.distances.insert(DistanceParam::Rrup);
        req.rupture.insert(RuptureParam::Mag);
        req
    }

    fn ctx(req: &Requirements, rup_id: u64, occurrence: Occurrence, rrup: f64) -> RuptureContext {
        RuptureContext::builder(req, rup_id, 5.0, occurrence, PoissonTom::new(50.0).unwrap())
            .sids(vec![0])
            .distance(DistanceParam::Rrup, vec![rrup])
            .unwrap()
            .build()
            .unwrap()
    }

    fn total_pne(ctxs: &[RuptureContext], poe: f64) -> f64 {
        ctxs.iter()
            .map(|c| c.occurrence.probability_no_exceedance(&c.tom, poe))
            .product()
    }

    #[test]
    fn test_combine_pmf() {
        let o = combine_pmf(&[0.99, 0.01], &[0.98, 0.02]);
        assert_eq!(o.len(), 3);
        assert_relative_eq!(o[0], 0.9702);
        assert_relative_eq!(o[1], 0.0296);
        assert_relative_eq!(o[2], 0.0002);
    }

    #[test]
    fn test_combine_pmf_properties() {
        let a = [0.7, 0.2, 0.1];
        let b = [0.9, 0.1];
        let c = [0.5, 0.25, 0.125, 0.125];
        let ab_c = combine_pmf(&combine_pmf(&a, &b), &c);
        let a_bc = combine_pmf(&a, &combine_pmf(&b, &c));
        for (x, y) in ab_c.iter().zip(&a_bc) {
            assert_relative_eq!(x, y, epsilon = 1e-15);
        }
        for (x, y) in combine_pmf(&a, &b).iter().zip(&combine_pmf(&b, &a)) {
            assert_relative_eq!(x, y, epsilon = 1e-15);
        }
        assert_relative_eq!(ab_c.iter().sum::<f64>(), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_parametric_rates_add_up() {
        let req = req();
        let ctxs = vec![
            ctx(&req, 1, Occurrence::Rate(0.001), 10.02),
            ctx(&req, 2, Occurrence::Rate(0.002), 9.98),
        ];
        let before = total_pne(&ctxs, 0.3);
        let out = collapse_contexts(ctxs, &req, 2);
        assert_eq!(out.len(), 1);
        assert_relative_eq!(out[0].occurrence.occurrence_rate(), 0.003);
        assert_relative_eq!(total_pne(&out, 0.3), before, max_relative = 1e-12);
    }

    #[test]
    fn test_mixed_populations_stay_apart() {
        let req = req();
        let pmf = |p: Vec<f64>| Occurrence::pmf(p).unwrap();
        let ctxs = vec![
            ctx(&req, 1, Occurrence::Rate(0.001), 10.0),
            ctx(&req, 2, pmf(vec![0.9, 0.1]), 10.0),
            ctx(&req, 3, Occurrence::Rate(0.004), 10.0),
            ctx(&req, 4, pmf(vec![0.8, 0.15, 0.05]), 10.0),
            ctx(&req, 5, Occurrence::Rate(0.004), 30.0),
        ];
        for poe in [0.0, 0.1, 0.5, 1.0] {
            let before = total_pne(&ctxs, poe);
            let out = collapse_contexts(ctxs.clone(), &req, 2);
            assert_eq!(out.len(), 3);
            assert_relative_eq!(total_pne(&out, poe), before, max_relative = 1e-12);
        }
        let out = collapse_contexts(ctxs, &req, 2);
        assert!(out[0].occurrence.is_parametric());
        match &out[1].occurrence {
            Occurrence::Pmf(p) => assert_eq!(p.len(), 4),
            Occurrence::Rate(_) => panic!("expected a PMF"),
        }
    }

    #[test]
    fn test_aggressive_level_rounds_to_km() {
        let req = req();
        let ctxs = vec![
            ctx(&req, 1, Occurrence::Rate(0.001), 10.2),
            ctx(&req, 2, Occurrence::Rate(0.002), 9.9),
        ];
        assert_eq!(collapse_contexts(ctxs.clone(), &req, 2).len(), 2);
        assert_eq!(collapse_contexts(ctxs, &req, 3).len(), 1);
    }

    #[test]
    fn test_time_spans_stay_apart() {
        let req = req();
        let other = RuptureContext::builder(&req, 2, 5.0, Occurrence::Rate(0.002), PoissonTom::new(1.0).unwrap())
            .sids(vec![0])
            .distance(DistanceParam::Rrup, vec![10.0])
            .unwrap()
            .build()
            .unwrap();
        let ctxs = vec![ctx(&req, 1, Occurrence::Rate(0.001), 10.0), other];
        let out = collapse_contexts(ctxs, &req, 3);
        assert_eq!(out.len(), 2);
        assert_relative_eq!(out[1].tom.time_span, 1.0);
    }

    #[test]
    fn test_single_context_is_untouched() {
        let req = req();
        let out = collapse_contexts(vec![ctx(&req, 1, Occurrence::Rate(0.001), 10.0)], &req, 3);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].rup_id, 1);
    }

    #[test]
    fn test_collapse_point_ruptures() {
        let sites = Arc::new(SiteCollection::new(&[Site::new(Point::new(0.0, 0.0, 0.0), 760.0)]));
        let rups: Vec<(Rupture, Arc<SiteCollection>)> = (0..10)
            .map(|i| {
                let hypo = Point::new(0.1 * i as f64, 0.0, 10.0);
                let rup = Rupture::new(i, 5.0, 0.0, hypo, None, Occurrence::Rate(0.001)).unwrap();
                (rup, Arc::clone(&sites))
            })
            .collect();
        // ruptures from 0.6 degrees on are beyond 60 km
        let out = collapse_point_ruptures(rups, "ASC", &MagDepDistance::constant(60.0), 3);
        assert_eq!(out.len(), 3);
        let rate: f64 = out.iter().map(|(r, _)| r.occurrence.occurrence_rate()).sum();
        assert_relative_eq!(rate, 0.006, max_relative = 1e-12);
    }
}
