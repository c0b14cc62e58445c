//! # Classical Calculator
//!
//! Hazard curves of a source model over a site collection.
//!
//! ## Table of Contents
//! 1. Rupture data scoping
//! 2. Preclassical: source weighting and filtering
//! 3. Context makers and resource checks
//! 4. Task submission and splitting
//! 5. Aggregation
//! 6. Hazard curves
//!
//! ## Flow
//!
//! ```text
//! sources ─► preclassical ─► blocks ─► classical_split_filter ─┬─► PmapMaker
//!                                        (heavy blocks resubmitted)  │
//!                                                                    ▼
//!                            hazard curves ◄─ per-group |= ◄─ agg_dicts
//! ```

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use ndarray::{Array2, Array3, ArrayView1, Axis};
use rayon::prelude::*;
use sysinfo::System;
use tracing::{debug, info, warn};

use seisma_hazardlib::contexts::{ContextMaker, RuptureContext};
use seisma_hazardlib::effect::get_effect;
use seisma_hazardlib::filters::{MagDepDistance, SourceFilter};
use seisma_hazardlib::imt::Imtls;
use seisma_hazardlib::partition::{block_splitter, partition};
use seisma_hazardlib::pmap::ProbabilityMap;
use seisma_hazardlib::pmap_maker::{CalcTime, PmapMaker};
use seisma_hazardlib::site::SiteCollection;
use seisma_hazardlib::source::{SeismicSource, SourceGroup};
use seisma_hazardlib::store::{store_contexts, RupData, RuptureStore};

use crate::config::{JobConfig, PointSourceMode};
use crate::error::{CalcError, Result};
use crate::executor::{Executor, Starmap, TaskOutput};
use crate::logic_tree::GsimLogicTree;
use crate::telemetry::{ByTask, CalcMetrics};

// ============================================================================
// 1. Rupture data scoping
// ============================================================================

/// View of a store restricted to the ruptures of one TRT.
///
/// Keys are `"{trti}_{mag}"` in the underlying store.
pub struct ScopedStore<'a> {
    inner: &'a dyn RuptureStore,
    prefix: String,
}

impl<'a> ScopedStore<'a> {
    pub fn new(inner: &'a dyn RuptureStore, trti: usize) -> Self {
        Self {
            inner,
            prefix: format!("{trti}_"),
        }
    }
}

impl RuptureStore for ScopedStore<'_> {
    fn append(&self, mag: &str, data: RupData) -> seisma_hazardlib::Result<()> {
        self.inner.append(&format!("{}{mag}", self.prefix), data)
    }

    fn get(&self, mag: &str) -> seisma_hazardlib::Result<Option<RupData>> {
        self.inner.get(&format!("{}{mag}", self.prefix))
    }

    fn mags(&self) -> seisma_hazardlib::Result<Vec<String>> {
        Ok(self
            .inner
            .mags()?
            .into_iter()
            .filter_map(|key| key.strip_prefix(&self.prefix).map(str::to_string))
            .collect())
    }
}

/// Sources that survived filtering, with their telemetry
#[derive(Debug, Clone)]
pub struct Preclassical {
    pub groups: Vec<SourceGroup>,
    /// Ruptures and close sites per source id
    pub calc_times: BTreeMap<u32, CalcTime>,
    /// Distinct magnitudes per TRT
    pub mags_by_trt: BTreeMap<String, Vec<f64>>,
    pub totweight: f64,
}

// ============================================================================
// Task records and accumulator
// ============================================================================

/// What a classical task returns
#[derive(Debug)]
struct ClassicalResult {
    grp_index: usize,
    pmap: ProbabilityMap,
    rupdata: Vec<RuptureContext>,
    calc_times: BTreeMap<u32, CalcTime>,
    totrups: usize,
    by_task: ByTask,
    dt: f64,
}

/// State owned by the reducing coordinator
#[derive(Debug, Default)]
pub struct HazardAccumulator {
    /// Probabilities of exceedance per group index, shape (L, G) per site
    pub pmaps: BTreeMap<usize, ProbabilityMap>,
    pub eff_ruptures: BTreeMap<String, u64>,
    pub calc_times: BTreeMap<u32, CalcTime>,
    pub by_task: Vec<ByTask>,
    pub totrups: usize,
    /// Contexts written to the rupture store
    pub stored: usize,
}

/// One task: a block of sources of a group
#[derive(Debug)]
struct ClassicalTask {
    task_no: usize,
    grp_index: usize,
    sources: Vec<Arc<dyn SeismicSource>>,
    split: bool,
}

// ============================================================================
// Outputs
// ============================================================================

/// Hazard curves per site and realization
#[derive(Debug, Clone)]
pub struct HazardCurves {
    pub sids: Vec<u32>,
    pub imtls: Imtls,
    /// Realization weights
    pub weights: Vec<f64>,
    /// Probabilities of exceedance, shape (N, L, R)
    pub array: Array3<f64>,
}

impl HazardCurves {
    pub fn num_rlzs(&self) -> usize {
        self.weights.len()
    }

    /// Curve of a site (by index) and realization, all levels
    pub fn curve(&self, n: usize, r: usize) -> ArrayView1<'_, f64> {
        self.array.index_axis(Axis(0), n).index_axis_move(Axis(1), r)
    }

    /// Weighted mean over the realizations, shape (N, L)
    pub fn mean(&self) -> Array2<f64> {
        let (n, l, _) = self.array.dim();
        let mut mean = Array2::zeros((n, l));
        for (r, &w) in self.weights.iter().enumerate() {
            mean.scaled_add(w, &self.array.index_axis(Axis(2), r));
        }
        mean
    }
}

/// Everything the classical calculator produces
#[derive(Debug)]
pub struct ClassicalOutput {
    pub curves: HazardCurves,
    pub groups: Vec<SourceGroup>,
    /// Context maker per TRT, with the final distances
    pub cmakers: BTreeMap<String, ContextMaker>,
    pub maximum_distance: MagDepDistance,
    pub mags_by_trt: BTreeMap<String, Vec<f64>>,
    pub eff_ruptures: BTreeMap<String, u64>,
    pub calc_times: BTreeMap<u32, CalcTime>,
    pub by_task: Vec<ByTask>,
    pub totrups: usize,
}

// ============================================================================
// Calculator
// ============================================================================

/// Broadcast state shared by every task
struct Prepared {
    groups: Vec<SourceGroup>,
    cmakers: BTreeMap<String, ContextMaker>,
    srcfilters: BTreeMap<String, SourceFilter>,
    max_weight: f64,
}

pub struct ClassicalCalculator<'a, E: Executor> {
    config: &'a JobConfig,
    executor: &'a E,
    sitecol: SiteCollection,
    groups: Vec<SourceGroup>,
    logic_tree: GsimLogicTree,
    store: Option<Arc<dyn RuptureStore>>,
    metrics: Option<Arc<CalcMetrics>>,
}

impl<'a, E: Executor> ClassicalCalculator<'a, E> {
    pub fn new(
        config: &'a JobConfig,
        executor: &'a E,
        sitecol: SiteCollection,
        groups: Vec<SourceGroup>,
        logic_tree: GsimLogicTree,
    ) -> Result<Self> {
        config.validate()?;
        if let Some(grp) = groups.iter().find(|g| logic_tree.gsims(&g.trt).is_err()) {
            return Err(CalcError::config(format!(
                "group {} has TRT {:?}, missing in the logic tree",
                grp.grp_id, grp.trt
            )));
        }
        Ok(Self {
            config,
            executor,
            sitecol,
            groups,
            logic_tree,
            store: None,
            metrics: None,
        })
    }

    /// Store the contexts for a later disaggregation
    pub fn with_store(mut self, store: Arc<dyn RuptureStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<CalcMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn sitecol(&self) -> &SiteCollection {
        &self.sitecol
    }

    pub fn logic_tree(&self) -> &GsimLogicTree {
        &self.logic_tree
    }

    /// TRTs in the order used for the rupture store keys
    fn trts(&self) -> Vec<String> {
        self.logic_tree.trts().map(str::to_string).collect()
    }

    // ========================================================================
    // 2. Preclassical
    // ========================================================================

    /// Weight the sources and drop those without close sites
    pub fn preclassical(&self) -> Result<Preclassical> {
        let srcfilter = SourceFilter::new(self.sitecol.clone(), self.config.maximum_distance()?);
        let mut groups = Vec::new();
        let mut calc_times = BTreeMap::new();
        for grp in &self.groups {
            let filtered: Vec<(Arc<dyn SeismicSource>, Option<CalcTime>)> = grp
                .sources
                .par_iter()
                .map(|src| {
                    let t0 = Instant::now();
                    let close = srcfilter.get_close_sites(src.as_ref());
                    let ctime = close.map(|sites| CalcTime {
                        nrups: src.num_ruptures() as u64,
                        nsites: sites.len() as u64,
                        dt: t0.elapsed().as_secs_f64(),
                    });
                    (Arc::clone(src), ctime)
                })
                .collect();
            let num_close = filtered.iter().filter(|(_, c)| c.is_some()).count();
            if num_close == 0 {
                debug!(grp_id = grp.grp_id, "no sources close to the sites");
                continue;
            }
            let mut sources = Vec::new();
            for (src, ctime) in filtered {
                match ctime {
                    Some(ctime) => {
                        calc_times.insert(src.id(), ctime);
                        sources.push(src);
                    }
                    // mutex weights must keep summing to one
                    None if grp.atomic() => sources.push(src),
                    None => debug!(source = src.source_id(), "discarding far away source"),
                }
            }
            groups.push(SourceGroup {
                sources,
                ..grp.clone()
            });
        }
        if groups.is_empty() {
            return Err(CalcError::config("all sources are far away from the sites"));
        }

        let mut mags_by_trt: BTreeMap<String, Vec<f64>> = BTreeMap::new();
        for grp in &groups {
            mags_by_trt.entry(grp.trt.clone()).or_default().extend(grp.mags());
        }
        for mags in mags_by_trt.values_mut() {
            mags.sort_by(f64::total_cmp);
            mags.dedup_by(|a, b| (*a - *b).abs() < 1e-9);
        }
        let totweight: f64 = groups.iter().map(SourceGroup::weight).sum();
        info!(
            groups = groups.len(),
            sources = calc_times.len(),
            totweight,
            "preclassical done"
        );
        Ok(Preclassical {
            groups,
            calc_times,
            mags_by_trt,
            totweight,
        })
    }

    // ========================================================================
    // 3. Context makers and resource checks
    // ========================================================================

    /// Context makers per TRT. The effect of the ruptures is computed on
    /// the first site when the point-source distance is "suggested" or a
    /// minimum intensity is set.
    fn context_makers(
        &self,
        pre: &Preclassical,
    ) -> Result<(BTreeMap<String, ContextMaker>, MagDepDistance)> {
        let mut maxdist = self.config.maximum_distance()?;
        let mode = self.config.pointsource_mode()?;
        let gsims_by_trt = pre
            .mags_by_trt
            .keys()
            .map(|trt| Ok((trt.clone(), self.logic_tree.gsims(trt)?)))
            .collect::<Result<BTreeMap<_, _>>>()?;

        let effects = if mode == PointSourceMode::Suggested || self.config.minimum_intensity > 0.0 {
            get_effect(
                &pre.mags_by_trt,
                &self.sitecol.one(),
                &gsims_by_trt,
                &mut maxdist,
                self.config.minimum_intensity,
                &self.config.imtls()?,
            )?
        } else {
            BTreeMap::new()
        };

        let mut cmakers = BTreeMap::new();
        for (trt, gsims) in gsims_by_trt {
            let mut params = self.config.context_params(&trt)?;
            params.maximum_distance = maxdist.clone();
            if mode == PointSourceMode::Suggested {
                if let Some(effect) = effects.get(&trt) {
                    let psd = effect.suggested_pointsource_distance(maxdist.max(&trt));
                    debug!(trt = %trt, ?psd, "suggested pointsource_distance");
                    params.pointsource_distance = Some(psd);
                }
            }
            cmakers.insert(trt.clone(), ContextMaker::new(trt, gsims, params)?);
        }
        Ok((cmakers, maxdist))
    }

    /// Fail when 1.5 times the size of the maps exceeds the available memory
    fn check_memory(&self, pre: &Preclassical) -> Result<()> {
        let num_levels = self.config.imtls()?.num_levels();
        let num_gsims: usize = pre
            .groups
            .iter()
            .map(|g| self.logic_tree.gsims(&g.trt).map(|v| v.len()))
            .sum::<Result<usize>>()?;
        let nbytes = ProbabilityMap::estimated_nbytes(self.sitecol.len(), num_levels, num_gsims);
        let needed = (nbytes as f64 * 1.5) as u64;

        let mut sys = System::new();
        sys.refresh_memory();
        let available = sys.available_memory();
        debug!(needed, available, "memory check");
        if available > 0 && needed > available {
            return Err(CalcError::OutOfMemory { needed, available });
        }
        Ok(())
    }

    // ========================================================================
    // 4. Task submission and splitting
    // ========================================================================

    /// Run the whole calculation
    pub fn run(&self) -> Result<ClassicalOutput> {
        let start = Instant::now();
        let pre = self.preclassical()?;
        self.check_memory(&pre)?;
        let (cmakers, maximum_distance) = self.context_makers(&pre)?;

        let mut max_weight = (pre.totweight / self.config.concurrent_tasks.max(1) as f64)
            .max(self.config.min_weight);
        if self.config.disagg_by_src {
            max_weight /= 5.0;
        }
        info!(totweight = pre.totweight, max_weight, "sending tasks");

        let srcfilters = cmakers
            .iter()
            .map(|(trt, cm)| {
                (
                    trt.clone(),
                    SourceFilter::new(self.sitecol.clone(), cm.params().maximum_distance.clone()),
                )
            })
            .collect();
        let prepared = Prepared {
            groups: pre.groups,
            cmakers,
            srcfilters,
            max_weight,
        };

        let mut smap = Starmap::new(self.executor, "classical");
        for task in self.submit_tasks(&prepared)? {
            smap.submit(task);
        }
        let counter = AtomicUsize::new(smap.len());
        let trts = self.trts();
        let acc = smap.reduce(
            |task| self.classical_split_filter(&prepared, task, &counter),
            HazardAccumulator::default(),
            |acc, res| self.agg_dicts(&prepared, &trts, acc, res),
        )?;

        for (trt, n) in &acc.eff_ruptures {
            info!(trt = %trt, eff_ruptures = n, "effective ruptures");
        }
        if let Some(metrics) = &self.metrics {
            metrics.record_ruptures(acc.totrups, acc.eff_ruptures.values().sum());
        }
        let curves = self.hazard_curves(&prepared.groups, &acc.pmaps)?;
        info!(
            sites = curves.sids.len(),
            rlzs = curves.num_rlzs(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "classical calculation done"
        );
        Ok(ClassicalOutput {
            curves,
            groups: prepared.groups,
            cmakers: prepared.cmakers,
            maximum_distance,
            mags_by_trt: pre.mags_by_trt,
            eff_ruptures: acc.eff_ruptures,
            calc_times: acc.calc_times,
            by_task: acc.by_task,
            totrups: acc.totrups,
        })
    }

    /// Blocks of sources per group; atomic groups are never split
    fn submit_tasks(&self, prep: &Prepared) -> Result<Vec<ClassicalTask>> {
        let mut tasks = Vec::new();
        for (gi, grp) in prep.groups.iter().enumerate() {
            let blocks: Vec<Vec<Arc<dyn SeismicSource>>> = if grp.atomic() {
                vec![grp.sources.clone()]
            } else if self.config.disagg_by_src {
                let mut by_id: BTreeMap<&str, Vec<Arc<dyn SeismicSource>>> = BTreeMap::new();
                for src in &grp.sources {
                    by_id.entry(src.source_id()).or_default().push(Arc::clone(src));
                }
                by_id.into_values().collect()
            } else {
                block_splitter(grp.sources.iter().cloned(), 2.0 * prep.max_weight, |s| s.weight(), true)?
                    .into_iter()
                    .map(|b| b.items)
                    .collect()
            };
            debug!(grp_id = grp.grp_id, blocks = blocks.len(), "group blocks");
            for sources in blocks {
                tasks.push(ClassicalTask {
                    task_no: tasks.len(),
                    grp_index: gi,
                    sources,
                    split: self.config.split_sources && !grp.atomic(),
                });
            }
        }
        Ok(tasks)
    }

    /// Split the block further: heavy sub-blocks go back to the executor,
    /// the rest is computed here
    fn classical_split_filter(
        &self,
        prep: &Prepared,
        task: ClassicalTask,
        counter: &AtomicUsize,
    ) -> Result<TaskOutput<ClassicalTask, ClassicalResult>> {
        if !task.split {
            return Ok(TaskOutput::done(self.classical(prep, task.task_no, task.grp_index, task.sources)?));
        }
        let split = partition(
            task.sources,
            prep.max_weight / 2.0,
            self.config.min_weight,
            |s| s.weight(),
        )?;
        let subtasks: Vec<ClassicalTask> = split
            .heavy
            .into_iter()
            .map(|blk| ClassicalTask {
                task_no: counter.fetch_add(1, Ordering::Relaxed),
                grp_index: task.grp_index,
                sources: blk.items,
                split: false,
            })
            .collect();
        if !subtasks.is_empty() {
            debug!(task_no = task.task_no, subtasks = subtasks.len(), "resubmitting heavy blocks");
        }
        let result = if split.light.is_empty() {
            None
        } else {
            Some(self.classical(prep, task.task_no, task.grp_index, split.light.items)?)
        };
        Ok(TaskOutput::with_subtasks(result, subtasks))
    }

    /// Compute the map of a block of sources
    fn classical(
        &self,
        prep: &Prepared,
        task_no: usize,
        grp_index: usize,
        sources: Vec<Arc<dyn SeismicSource>>,
    ) -> Result<ClassicalResult> {
        let t0 = Instant::now();
        let grp = &prep.groups[grp_index];
        let cmaker = prep
            .cmakers
            .get(&grp.trt)
            .ok_or_else(|| CalcError::task(format!("no context maker for {:?}", grp.trt)))?;
        let srcfilter = prep
            .srcfilters
            .get(&grp.trt)
            .ok_or_else(|| CalcError::task(format!("no source filter for {:?}", grp.trt)))?;
        let srcids = sources.iter().map(|s| s.source_id().to_string()).collect();
        let block = SourceGroup {
            sources,
            ..grp.clone()
        };
        let out = PmapMaker::new(cmaker, srcfilter, &block).make()?;
        let by_task = ByTask {
            task_no,
            eff_ruptures: out.calc_times.values().map(|c| c.nrups).sum(),
            eff_sites: out.calc_times.values().map(|c| c.nsites).sum(),
            srcids,
        };
        Ok(ClassicalResult {
            grp_index,
            pmap: out.pmap,
            rupdata: out.rupdata,
            calc_times: out.calc_times,
            totrups: out.totrups,
            by_task,
            dt: t0.elapsed().as_secs_f64(),
        })
    }

    // ========================================================================
    // 5. Aggregation
    // ========================================================================

    /// Fold a task result into the accumulator
    fn agg_dicts(
        &self,
        prep: &Prepared,
        trts: &[String],
        acc: &mut HazardAccumulator,
        res: ClassicalResult,
    ) -> Result<()> {
        let grp = &prep.groups[res.grp_index];
        let pmap = acc
            .pmaps
            .entry(res.grp_index)
            .or_insert_with(|| ProbabilityMap::new(res.pmap.num_levels(), res.pmap.num_gsims()));
        *pmap |= &res.pmap;

        *acc.eff_ruptures.entry(grp.trt.clone()).or_default() += res.by_task.eff_ruptures;
        for (src_id, ctime) in res.calc_times {
            *acc.calc_times.entry(src_id).or_default() += ctime;
        }
        acc.totrups += res.totrups;

        if !res.rupdata.is_empty() {
            if let Some(store) = &self.store {
                let trti = trts
                    .iter()
                    .position(|t| *t == grp.trt)
                    .ok_or_else(|| CalcError::task(format!("unknown TRT {:?}", grp.trt)))?;
                acc.stored += store_contexts(&ScopedStore::new(store.as_ref(), trti), &res.rupdata)?;
            }
        }
        if let Some(metrics) = &self.metrics {
            metrics.record_task("classical", std::time::Duration::from_secs_f64(res.dt));
        }
        acc.by_task.push(res.by_task);
        Ok(())
    }

    // ========================================================================
    // 6. Hazard curves
    // ========================================================================

    /// Curves per realization: `1 - prod(1 - poe)` over the groups, each
    /// group contributing the model of the realization for its TRT
    fn hazard_curves(
        &self,
        groups: &[SourceGroup],
        pmaps: &BTreeMap<usize, ProbabilityMap>,
    ) -> Result<HazardCurves> {
        let imtls = self.config.imtls()?;
        let rlzs = self.logic_tree.realizations();
        let (n, l, r) = (self.sitecol.len(), imtls.num_levels(), rlzs.len());
        let index: BTreeMap<u32, usize> = self
            .sitecol
            .sids()
            .iter()
            .enumerate()
            .map(|(i, &sid)| (sid, i))
            .collect();

        let mut pnes = Array3::<f64>::ones((n, l, r));
        for (&gi, pmap) in pmaps {
            let trt = &groups[gi].trt;
            for rlz in &rlzs {
                let g = rlz.gsim_index.get(trt).copied().ok_or_else(|| {
                    CalcError::config(format!("TRT {trt:?} missing in realization {}", rlz.ordinal))
                })?;
                for (sid, poes) in pmap.iter() {
                    let Some(&i) = index.get(&sid) else {
                        warn!(sid, "hazard for an unknown site");
                        continue;
                    };
                    for li in 0..l {
                        pnes[[i, li, rlz.ordinal]] *= 1.0 - poes[[li, g]];
                    }
                }
            }
        }
        Ok(HazardCurves {
            sids: self.sitecol.sids().to_vec(),
            imtls,
            weights: rlzs.iter().map(|r| r.weight).collect(),
            array: pnes.mapv_into(|q| 1.0 - q),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{RayonExecutor, SequentialExecutor};
    use crate::testing::{self, TRT};
    use approx::assert_relative_eq;
    use seisma_hazardlib::store::MemoryRuptureStore;

    fn sources() -> Vec<Arc<dyn SeismicSource>> {
        vec![
            testing::point_source(1, 0.1),
            testing::point_source(2, 0.3),
            testing::point_source(3, -0.2),
            testing::characteristic(4, 0.2),
        ]
    }

    fn direct_poes(config: &JobConfig, sitecol: &SiteCollection, grp: &SourceGroup) -> ProbabilityMap {
        let cmaker = ContextMaker::new(
            TRT,
            testing::single_tree().gsims(TRT).unwrap(),
            config.context_params(TRT).unwrap(),
        )
        .unwrap();
        let srcfilter = SourceFilter::new(sitecol.clone(), config.maximum_distance().unwrap());
        PmapMaker::new(&cmaker, &srcfilter, grp).make().unwrap().pmap
    }

    #[test]
    fn test_curves_match_pmap_maker() {
        let config = testing::config("");
        let sitecol = testing::sitecol(&[0.0, 0.5]);
        let grp = testing::group(0, sources());
        let expected = direct_poes(&config, &sitecol, &grp);

        let exec = RayonExecutor::new();
        let calc = ClassicalCalculator::new(&config, &exec, sitecol, vec![grp], testing::single_tree()).unwrap();
        let out = calc.run().unwrap();
        assert_eq!(out.curves.array.dim(), (2, 7, 1));
        for (sid, poes) in expected.iter() {
            for l in 0..7 {
                assert_relative_eq!(out.curves.array[[sid as usize, l, 0]], poes[[l, 0]], epsilon = 1e-12);
            }
        }
        assert!(out.by_task.len() > 1);
        assert_eq!(out.eff_ruptures[TRT], out.by_task.iter().map(|b| b.eff_ruptures).sum::<u64>());
    }

    #[test]
    fn test_splitting_does_not_change_the_hazard() {
        let sitecol = testing::sitecol(&[0.0, 0.5]);
        let grp = testing::group(0, sources());

        let mut unsplit = testing::config("");
        unsplit.split_sources = false;
        unsplit.concurrent_tasks = 1;
        unsplit.min_weight = 1000.0;
        let exec = SequentialExecutor;
        let a = ClassicalCalculator::new(&unsplit, &exec, sitecol.clone(), vec![grp.clone()], testing::single_tree())
            .unwrap()
            .run()
            .unwrap();
        assert_eq!(a.by_task.len(), 1);

        let split = testing::config("");
        let exec = RayonExecutor::with_threads(2).unwrap();
        let b = ClassicalCalculator::new(&split, &exec, sitecol, vec![grp], testing::single_tree())
            .unwrap()
            .run()
            .unwrap();
        assert!(b.by_task.len() > 1);
        for (x, y) in a.curves.array.iter().zip(b.curves.array.iter()) {
            assert_relative_eq!(x, y, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_mean_of_two_branches() {
        let config = testing::config("");
        let exec = SequentialExecutor;
        let calc = ClassicalCalculator::new(
            &config,
            &exec,
            testing::sitecol(&[0.0]),
            vec![testing::group(0, sources())],
            testing::two_branch_tree(),
        )
        .unwrap();
        let out = calc.run().unwrap();
        let curves = &out.curves;
        assert_eq!(curves.num_rlzs(), 2);
        let mean = curves.mean();
        for l in 0..7 {
            let expected = 0.7 * curves.curve(0, 0)[l] + 0.3 * curves.curve(0, 1)[l];
            assert_relative_eq!(mean[[0, l]], expected, epsilon = 1e-12);
        }
        // curves decrease with the level inside each IMT
        assert!(curves.curve(0, 0)[0] >= curves.curve(0, 0)[3]);
    }

    #[test]
    fn test_independent_groups_compose() {
        let config = testing::config("");
        let sitecol = testing::sitecol(&[0.0]);
        let g1 = testing::group(0, vec![testing::point_source(1, 0.1)]);
        let g2 = testing::group(1, vec![testing::characteristic(2, 0.2)]);
        let p1 = direct_poes(&config, &sitecol, &g1);
        let p2 = direct_poes(&config, &sitecol, &g2);

        let exec = SequentialExecutor;
        let out = ClassicalCalculator::new(&config, &exec, sitecol, vec![g1, g2], testing::single_tree())
            .unwrap()
            .run()
            .unwrap();
        let (a, b) = (p1.get(0).unwrap(), p2.get(0).unwrap());
        for l in 0..7 {
            let expected = 1.0 - (1.0 - a[[l, 0]]) * (1.0 - b[[l, 0]]);
            assert_relative_eq!(out.curves.array[[0, l, 0]], expected, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_preclassical_drops_far_sources() {
        let config = testing::config("");
        let exec = SequentialExecutor;
        let grp = testing::group(0, vec![testing::point_source(1, 0.1), testing::point_source(2, 30.0)]);
        let calc = ClassicalCalculator::new(&config, &exec, testing::sitecol(&[0.0]), vec![grp], testing::single_tree())
            .unwrap();
        let pre = calc.preclassical().unwrap();
        assert_eq!(pre.groups[0].sources.len(), 1);
        assert_eq!(pre.calc_times.keys().copied().collect::<Vec<_>>(), vec![1]);
        assert_eq!(pre.calc_times[&1].nsites, 1);
        assert_eq!(pre.mags_by_trt[TRT], vec![5.0, 5.5, 6.0]);

        let far = testing::group(0, vec![testing::point_source(2, 30.0)]);
        let calc = ClassicalCalculator::new(&config, &exec, testing::sitecol(&[0.0]), vec![far], testing::single_tree())
            .unwrap();
        assert!(matches!(calc.preclassical(), Err(CalcError::Config(_))));
    }

    #[test]
    fn test_fewsites_contexts_are_stored() {
        let config = testing::config("");
        let exec = RayonExecutor::new();
        let store = Arc::new(MemoryRuptureStore::new());
        let calc = ClassicalCalculator::new(
            &config,
            &exec,
            testing::sitecol(&[0.0]),
            vec![testing::group(0, sources())],
            testing::single_tree(),
        )
        .unwrap()
        .with_store(store.clone());
        let out = calc.run().unwrap();
        let keys = store.mags().unwrap();
        assert!(keys.iter().all(|k| k.starts_with("0_")));
        assert_eq!(
            store.num_ruptures().unwrap() as u64,
            out.calc_times.values().map(|c| c.nrups).sum::<u64>()
        );
        let scoped = ScopedStore::new(store.as_ref(), 0);
        assert!(scoped.mags().unwrap().contains(&"6.50".to_string()));
        assert!(ScopedStore::new(store.as_ref(), 1).mags().unwrap().is_empty());
    }

    #[test]
    fn test_unknown_trt_is_rejected() {
        let config = testing::config("");
        let exec = SequentialExecutor;
        let grp = SourceGroup::new(0, "Volcanic", vec![], seisma_hazardlib::tom::PoissonTom::new(50.0).unwrap()).unwrap();
        let res = ClassicalCalculator::new(&config, &exec, testing::sitecol(&[0.0]), vec![grp], testing::single_tree());
        assert!(matches!(res, Err(CalcError::Config(_))));
    }
}
