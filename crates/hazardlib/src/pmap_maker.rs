//! # Probability map composition
//!
//! [`PmapMaker`] drives the context builder over one [`SourceGroup`] and folds
//! the per-rupture probabilities of no exceedance into a [`ProbabilityMap`].
//!
//! ## Table of Contents
//! 1. Telemetry records
//! 2. PmapMaker
//! 3. Rupture generation

use std::collections::BTreeMap;
use std::ops::AddAssign;
use std::sync::Arc;
use std::time::Instant;

use tracing::debug;

use crate::contexts::{ContextMaker, PointSourceDistance, RuptureContext};
use crate::collapse::collapse_point_ruptures;
use crate::error::Result;
use crate::filters::SourceFilter;
use crate::partition::block_splitter;
use crate::pmap::ProbabilityMap;
use crate::site::SiteCollection;
use crate::source::{Interdep, Rupture, SeismicSource, SourceGroup};

/// Number of (site, level, model) cells of the largest poes block
const MAX_BLOCK_CELLS: f64 = 512_000.0;

// ============================================================================
// 1. Telemetry records
// ============================================================================

/// Effective ruptures, effective sites and seconds spent on a source
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CalcTime {
    pub nrups: u64,
    pub nsites: u64,
    pub dt: f64,
}

impl AddAssign for CalcTime {
    fn add_assign(&mut self, other: CalcTime) {
        self.nrups += other.nrups;
        self.nsites += other.nsites;
        self.dt += other.dt;
    }
}

/// Everything produced for one source group
#[derive(Debug, Clone)]
pub struct PmapOutput {
    /// Probabilities of exceedance per site, shape (L, G)
    pub pmap: ProbabilityMap,
    /// Contexts kept in few-sites mode, empty otherwise
    pub rupdata: Vec<RuptureContext>,
    /// Per-source telemetry keyed by source id
    pub calc_times: BTreeMap<u32, CalcTime>,
    /// Ruptures generated before filtering and collapsing
    pub totrups: usize,
}

// ============================================================================
// 2. PmapMaker
// ============================================================================

/// Computes the hazard of a source group
pub struct PmapMaker<'a> {
    cmaker: &'a ContextMaker,
    srcfilter: &'a SourceFilter,
    group: &'a SourceGroup,
    rup_indep: bool,
    fewsites: bool,
    maxsites: f64,
}

impl<'a> PmapMaker<'a> {
    pub fn new(cmaker: &'a ContextMaker, srcfilter: &'a SourceFilter, group: &'a SourceGroup) -> Self {
        let num_levels = cmaker.imtls().num_levels().max(1);
        let num_gsims = cmaker.gsims().len().max(1);
        Self {
            cmaker,
            srcfilter,
            group,
            rup_indep: group.rup_interdep != Interdep::Mutex,
            fewsites: srcfilter.sitecol().total_sites() <= cmaker.params().max_sites_disagg,
            maxsites: (MAX_BLOCK_CELLS / num_gsims as f64 / num_levels as f64).max(1.0),
        }
    }

    /// True when contexts are retained for disaggregation
    pub fn fewsites(&self) -> bool {
        self.fewsites
    }

    /// Compose the group into a map of probabilities of exceedance
    pub fn make(self) -> Result<PmapOutput> {
        let start = Instant::now();
        let mut out = PmapOutput {
            pmap: ProbabilityMap::new(self.cmaker.imtls().num_levels(), self.cmaker.gsims().len()),
            rupdata: Vec::new(),
            calc_times: BTreeMap::new(),
            totrups: 0,
        };
        if self.group.src_interdep == Interdep::Mutex {
            self.make_src_mutex(&mut out)?;
        } else {
            self.make_src_indep(&mut out)?;
        }
        debug!(
            grp_id = self.group.grp_id,
            sites = out.pmap.len(),
            totrups = out.totrups,
            elapsed = ?start.elapsed(),
            "composed group"
        );
        Ok(out)
    }

    fn make_src_indep(&self, out: &mut PmapOutput) -> Result<()> {
        let pairs: Vec<(Arc<dyn SeismicSource>, Arc<SiteCollection>)> = if self.fewsites {
            let sites = Arc::new(self.srcfilter.sitecol().clone());
            self.group
                .sources
                .iter()
                .map(|src| (Arc::clone(src), Arc::clone(&sites)))
                .collect()
        } else {
            self.srcfilter
                .filter(&self.group.sources)
                .map(|(src, sites)| (src, Arc::new(sites)))
                .collect()
        };
        let mut pmap = ProbabilityMap::new(out.pmap.num_levels(), out.pmap.num_gsims());
        for (src, sites) in pairs {
            let t0 = Instant::now();
            out.totrups += src.num_ruptures();
            let rups = self.get_rups(src.as_ref(), &sites);
            let ctxs = self.make_ctxs(rups, src.id(), out)?;
            self.update_pmap(&ctxs, &mut pmap)?;
            *out.calc_times.entry(src.id()).or_default() += calc_time(&ctxs, t0);
        }
        out.pmap = if self.rup_indep { pmap.invert() } else { pmap };
        Ok(())
    }

    fn make_src_mutex(&self, out: &mut PmapOutput) -> Result<()> {
        for (src, sites) in self.srcfilter.filter(&self.group.sources) {
            let t0 = Instant::now();
            out.totrups += src.num_ruptures();
            let sites = Arc::new(sites);
            let rups = src
                .iter_ruptures(None)
                .map(|rup| (rup, Arc::clone(&sites)))
                .collect();
            let ctxs = self.make_ctxs(rups, src.id(), out)?;
            let mut pmap = ProbabilityMap::new(out.pmap.num_levels(), out.pmap.num_gsims());
            self.update_pmap(&ctxs, &mut pmap)?;
            let mut p = if self.rup_indep { pmap.invert() } else { pmap };
            p.scale(src.mutex_weight());
            out.pmap += &p;
            *out.calc_times.entry(src.id()).or_default() += calc_time(&ctxs, t0);
        }
        Ok(())
    }

    fn make_ctxs(
        &self,
        rups: Vec<(Rupture, Arc<SiteCollection>)>,
        src_id: u32,
        out: &mut PmapOutput,
    ) -> Result<Vec<RuptureContext>> {
        let params = self.cmaker.params();
        let rups = if self.rup_indep && params.pointsource_distance.is_some() {
            collapse_point_ruptures(
                rups,
                self.cmaker.trt(),
                &params.maximum_distance,
                params.point_rupture_bins,
            )
        } else {
            rups
        };
        let mut ctxs = self
            .cmaker
            .make_ctxs(rups.iter().map(|(rup, sites)| (rup, sites.as_ref())), self.fewsites)?;
        if params.collapse_level > 1 && self.rup_indep {
            ctxs = self.cmaker.collapse_the_ctxs(ctxs);
        }
        for ctx in &mut ctxs {
            ctx.src_id = src_id;
        }
        if self.fewsites {
            out.rupdata.extend(ctxs.iter().cloned());
        }
        Ok(ctxs)
    }

    /// Fold the contexts into a map of probabilities of no exceedance
    /// (independent ruptures) or of weighted exceedance (mutex ruptures)
    fn update_pmap(&self, ctxs: &[RuptureContext], pmap: &mut ProbabilityMap) -> Result<()> {
        let init = if self.rup_indep { 1.0 } else { 0.0 };
        let blocks = block_splitter(ctxs.iter(), self.maxsites, |ctx| ctx.num_sites() as f64, false)?;
        for block in blocks {
            for (ctx, poes) in self.cmaker.gen_ctx_poes(block.items)? {
                let pnes = ctx.probability_no_exceedance(poes.view());
                for (&sid, pne) in ctx.sids().iter().zip(pnes.outer_iter()) {
                    let probs = pmap.setdefault(sid, init);
                    if self.rup_indep {
                        *probs *= &pne;
                    } else {
                        probs.zip_mut_with(&pne, |p, &q| *p += (1.0 - q) * ctx.weight);
                    }
                }
            }
        }
        Ok(())
    }

    // ========================================================================
    // 3. Rupture generation
    // ========================================================================

    /// Ruptures of a source paired with the sites they are evaluated on.
    ///
    /// Point-like sources are reduced to point ruptures for the sites beyond
    /// the point-source distance of each magnitude.
    fn get_rups(&self, src: &dyn SeismicSource, sites: &Arc<SiteCollection>) -> Vec<(Rupture, Arc<SiteCollection>)> {
        let psd = match (src.location(), &self.cmaker.params().pointsource_distance) {
            (Some(_), Some(psd)) => psd,
            _ => return paired(src.iter_ruptures(None), sites),
        };
        if *psd == PointSourceDistance::Zero {
            return paired(src.point_ruptures(), sites);
        }
        let mut rups = Vec::new();
        for pr in src.point_ruptures() {
            let (close, far) = sites.split(&pr.hypocenter, psd.get(pr.mag));
            let mag = pr.mag;
            if self.fewsites {
                if close.is_none() {
                    rups.push((pr, Arc::clone(sites)));
                } else {
                    rups.extend(paired(src.iter_ruptures(Some(mag)), sites));
                }
                continue;
            }
            if let Some(far) = far {
                rups.push((pr, Arc::new(far)));
            }
            if let Some(close) = close {
                rups.extend(paired(src.iter_ruptures(Some(mag)), &Arc::new(close)));
            }
        }
        rups
    }
}

fn paired(rups: impl Iterator<Item = Rupture>, sites: &Arc<SiteCollection>) -> Vec<(Rupture, Arc<SiteCollection>)> {
    rups.map(|rup| (rup, Arc::clone(sites))).collect()
}

fn calc_time(ctxs: &[RuptureContext], t0: Instant) -> CalcTime {
    CalcTime {
        nrups: ctxs.len() as u64,
        nsites: ctxs.iter().map(|c| c.num_sites() as u64).sum(),
        dt: t0.elapsed().as_secs_f64(),
    }
}
