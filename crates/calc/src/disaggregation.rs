//! # Disaggregation Calculator
//!
//! Splits the hazard of a classical run by magnitude, distance, position,
//! epsilon and tectonic region type, for a few sites.
//!
//! ## Table of Contents
//! 1. Realizations and disaggregation levels
//! 2. Calculator setup
//! 3. Tasks
//! 4. Aggregation and PMF extraction
//!
//! ## Flow
//!
//! ```text
//! curves ─► rlzs (N, Z) ─► iml4 (N, M, P, Z) ─┐
//! rupture store ─► blocks per (trt, mag) ─────┴─► compute_disagg ─► agg_result
//!                                                                     │
//!                               pmfs (N, M, P, bins.., Z) ◄─ post_execute
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Instant;

use ndarray::{s, Array2, Array4, ArrayD, ArrayView1, Axis, IxDyn};
use tracing::{debug, info, warn};

use seisma_hazardlib::contexts::{ContextMaker, RuptureContext};
use seisma_hazardlib::disagg::{
    agg_probs, build_disagg_matrix, disaggregate, get_outputs_size, output, pprod, BinEdges, DisaggShape, Eps3,
    PmfKind,
};
use seisma_hazardlib::imt::Imt;
use seisma_hazardlib::partition::{block_splitter, disagg_max_weight, disagg_weight};
use seisma_hazardlib::site::SiteCollection;
use seisma_hazardlib::store::RuptureStore;

use crate::classical::{ClassicalOutput, HazardCurves, ScopedStore};
use crate::config::JobConfig;
use crate::error::{CalcError, Result};
use crate::executor::{Executor, Starmap, TaskOutput};
use crate::logic_tree::GsimLogicTree;
use crate::telemetry::{CalcMetrics, TaskInfo};

/// Largest number of sites a disaggregation accepts, one less than 2^15
pub const MAX_SITES: usize = 32_767;

/// Relative tolerance between requested and aggregated PoEs
const POE_TOLERANCE: f64 = 0.1;

// ============================================================================
// 1. Realizations and disaggregation levels
// ============================================================================

/// Ordinals of `curves` sorted by RMS distance from `reference`; ties keep
/// the lower ordinal first
pub fn closest_to_ref(curves: &[ArrayView1<'_, f64>], reference: ArrayView1<'_, f64>) -> Vec<usize> {
    let mut dists: Vec<(usize, f64)> = curves
        .iter()
        .enumerate()
        .map(|(r, curve)| {
            let n = curve.len().max(1) as f64;
            let sq: f64 = curve
                .iter()
                .zip(reference.iter())
                .map(|(a, b)| (a - b) * (a - b))
                .sum();
            (r, (sq / n).sqrt())
        })
        .collect();
    dists.sort_by(|a, b| a.1.total_cmp(&b.1));
    dists.into_iter().map(|(r, _)| r).collect()
}

/// Piecewise linear interpolation on increasing `xs`, clamped to the end
/// values outside the range
pub fn interp(x: f64, xs: &[f64], ys: &[f64]) -> f64 {
    let (Some(&x0), Some(&xn)) = (xs.first(), xs.last()) else {
        return f64::NAN;
    };
    if x <= x0 {
        return ys[0];
    }
    if x >= xn {
        return ys[ys.len() - 1];
    }
    let i = xs.partition_point(|&v| v < x);
    let (xa, xb, ya, yb) = (xs[i - 1], xs[i], ys[i - 1], ys[i]);
    if xb == xa {
        return yb;
    }
    ya + (yb - ya) * (x - xa) / (xb - xa)
}

/// Realizations to disaggregate per site, shape (N, Z)
pub fn select_rlzs(config: &JobConfig, curves: &HazardCurves) -> Result<Array2<usize>> {
    let n = curves.sids.len();
    let num_rlzs = curves.num_rlzs();
    if let Some(index) = &config.rlz_index {
        if let Some(r) = index.iter().find(|&&r| r >= num_rlzs) {
            return Err(CalcError::config(format!(
                "rlz_index contains {r}, but there are {num_rlzs} realizations"
            )));
        }
        return Ok(Array2::from_shape_fn((n, index.len()), |(_, z)| index[z]));
    }
    let z = config.num_rlzs_disagg.max(1);
    if z > num_rlzs {
        return Err(CalcError::config(format!(
            "num_rlzs_disagg={z} exceeds the {num_rlzs} realizations"
        )));
    }
    let mut rlzs = Array2::zeros((n, z));
    if num_rlzs > 1 {
        let mean = curves.mean();
        for i in 0..n {
            let site_curves: Vec<ArrayView1<'_, f64>> = (0..num_rlzs).map(|r| curves.curve(i, r)).collect();
            let best = closest_to_ref(&site_curves, mean.row(i));
            for (zi, &r) in best.iter().take(z).enumerate() {
                rlzs[[i, zi]] = r;
            }
        }
    }
    Ok(rlzs)
}

/// Sites whose curves can reach every requested PoE; a warning is logged
/// for every excluded site
pub fn check_poes_disagg(
    curves: &HazardCurves,
    rlzs: &Array2<usize>,
    poes_disagg: &[f64],
) -> Result<Vec<bool>> {
    let imtls = &curves.imtls;
    let mut ok = vec![true; curves.sids.len()];
    'sites: for (i, &sid) in curves.sids.iter().enumerate() {
        let row = rlzs.row(i);
        let site_curves: Vec<ArrayView1<'_, f64>> = row.iter().map(|&r| curves.curve(i, r)).collect();
        // no source affects the site: nothing to check
        if site_curves.iter().all(|c| c.iter().all(|&p| p == 0.0)) {
            continue;
        }
        for (&rlz, curve) in row.iter().zip(&site_curves) {
            for (m, imt) in imtls.imts().iter().enumerate() {
                let max_poe = curve
                    .slice(s![imtls.slice(m)])
                    .fold(0.0_f64, |acc, &p| acc.max(p));
                if let Some(&poe) = poes_disagg.iter().find(|&&poe| poe > max_poe) {
                    warn!(
                        sid,
                        poe,
                        max_poe,
                        rlz,
                        imt = %imt,
                        "the disaggregation PoE is too big or the model produces too small PoEs; skipping the site"
                    );
                    ok[i] = false;
                    continue 'sites;
                }
            }
        }
    }
    if !ok.iter().any(|&o| o) {
        return Err(CalcError::NoDisaggregation(format!(
            "poes_disagg {poes_disagg:?} cannot be reached at any site"
        )));
    }
    let num_ok = ok.iter().filter(|&&o| o).count();
    if num_ok < ok.len() {
        warn!(num_ok, num_sites = ok.len(), "disaggregating a subset of the sites");
    }
    Ok(ok)
}

/// Intensity levels to disaggregate, shape (N, M, P, Z): the levels of
/// `iml_disagg`, or the levels where each curve reaches `poes_disagg`
pub fn build_iml4(
    config: &JobConfig,
    curves: &HazardCurves,
    rlzs: &Array2<usize>,
    imts: &[Imt],
) -> Result<Array4<f64>> {
    let (n, z) = rlzs.dim();
    if !config.iml_disagg.is_empty() {
        let imls = imts
            .iter()
            .map(|imt| {
                config
                    .iml_disagg
                    .iter()
                    .find(|(name, _)| name.parse::<Imt>().ok().as_ref() == Some(imt))
                    .map(|(_, &iml)| iml)
                    .ok_or_else(|| CalcError::config(format!("no iml_disagg for {imt}")))
            })
            .collect::<Result<Vec<f64>>>()?;
        return Ok(Array4::from_shape_fn((n, imts.len(), 1, z), |(_, m, _, _)| imls[m]));
    }
    let imtls = &curves.imtls;
    let poes = &config.poes_disagg;
    let mut iml4 = Array4::zeros((n, imts.len(), poes.len(), z));
    for (m, imt) in imts.iter().enumerate() {
        let mi = imtls
            .imts()
            .iter()
            .position(|i| i == imt)
            .ok_or_else(|| CalcError::config(format!("{imt} is not in imtls")))?;
        let levels: Vec<f64> = imtls.levels(mi).iter().rev().copied().collect();
        for ((i, zi), &r) in rlzs.indexed_iter() {
            let curve = curves.curve(i, r);
            let rev: Vec<f64> = curve.slice(s![imtls.slice(mi)]).iter().rev().copied().collect();
            for (p, &poe) in poes.iter().enumerate() {
                iml4[[i, m, p, zi]] = interp(poe, &rev, &levels);
            }
        }
    }
    Ok(iml4)
}

// ============================================================================
// 2. Calculator setup
// ============================================================================

/// Everything the disaggregation produces
#[derive(Debug, Clone)]
pub struct DisaggOutput {
    pub edges: BinEdges,
    pub shape: DisaggShape,
    pub imts: Vec<Imt>,
    /// Realizations per site, shape (N, Z)
    pub rlzs: Array2<usize>,
    /// Requested PoEs; `None` when disaggregating fixed levels
    pub poes_disagg: Vec<Option<f64>>,
    /// Disaggregated levels, shape (N, M, P, Z)
    pub iml4: Array4<f64>,
    /// PoEs recomposed from the matrices, shape (N, M, P, Z)
    pub poe4: Array4<f64>,
    pub ok_sites: Vec<bool>,
    /// PMFs of shape (N, M, P, bins.., Z) per kind
    pub pmfs: BTreeMap<PmfKind, ArrayD<f64>>,
    pub task_info: Vec<TaskInfo>,
}

/// Broadcast state shared by every task
struct Shared<'a> {
    cmakers: Vec<&'a ContextMaker>,
    /// Model index per TRT index, site index and realization
    g_by_z: Vec<Array2<usize>>,
    imts: &'a [Imt],
    iml4: &'a Array4<f64>,
    edges: &'a BinEdges,
    eps3: Eps3,
    sids: &'a [u32],
    ok_sites: &'a [bool],
}

pub struct DisaggregationCalculator<'a, E: Executor> {
    config: &'a JobConfig,
    executor: &'a E,
    sitecol: &'a SiteCollection,
    logic_tree: &'a GsimLogicTree,
    store: Arc<dyn RuptureStore>,
    metrics: Option<Arc<CalcMetrics>>,
}

impl<'a, E: Executor> DisaggregationCalculator<'a, E> {
    pub fn new(
        config: &'a JobConfig,
        executor: &'a E,
        sitecol: &'a SiteCollection,
        logic_tree: &'a GsimLogicTree,
        store: Arc<dyn RuptureStore>,
    ) -> Result<Self> {
        if !config.is_disaggregation() {
            return Err(CalcError::config("the job has no disaggregation settings"));
        }
        config.validate()?;
        let num_sites = sitecol.len();
        if num_sites > MAX_SITES {
            return Err(CalcError::TooManySites { num_sites, max: MAX_SITES });
        }
        if num_sites > config.max_sites_disagg {
            return Err(CalcError::TooManySites {
                num_sites,
                max: config.max_sites_disagg,
            });
        }
        Ok(Self {
            config,
            executor,
            sitecol,
            logic_tree,
            store,
            metrics: None,
        })
    }

    pub fn with_metrics(mut self, metrics: Arc<CalcMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// IMTs to disaggregate: those of `iml_disagg` if given, else all
    fn imts(&self, curves: &HazardCurves) -> Result<Vec<Imt>> {
        if self.config.iml_disagg.is_empty() {
            return Ok(curves.imtls.imts().to_vec());
        }
        let mut imts = Vec::new();
        for imt in curves.imtls.imts() {
            let wanted = self
                .config
                .iml_disagg
                .keys()
                .any(|name| name.parse::<Imt>().ok().as_ref() == Some(imt));
            if wanted {
                imts.push(*imt);
            }
        }
        Ok(imts)
    }

    /// Run the disaggregation on the output of a classical calculation
    /// that stored its contexts in the same store
    pub fn run(&self, classical: &ClassicalOutput) -> Result<DisaggOutput> {
        let start = Instant::now();
        if let Some(grp) = classical.groups.iter().find(|g| g.atomic()) {
            return Err(CalcError::NotImplemented(format!(
                "disaggregation of atomic group {}",
                grp.grp_id
            )));
        }
        let curves = &classical.curves;
        if curves.sids != self.sitecol.sids() {
            return Err(CalcError::config("the hazard curves refer to other sites"));
        }
        let rlzs = select_rlzs(self.config, curves)?;
        let imts = self.imts(curves)?;
        let (ok_sites, poes_disagg) = if self.config.iml_disagg.is_empty() {
            let ok = check_poes_disagg(curves, &rlzs, &self.config.poes_disagg)?;
            (ok, self.config.poes_disagg.iter().copied().map(Some).collect())
        } else {
            (vec![true; self.sitecol.len()], vec![None])
        };
        let iml4 = build_iml4(self.config, curves, &rlzs, &imts)?;
        let (n, m, p, z) = iml4.dim();

        let edges = BinEdges::new(
            &classical.mags_by_trt,
            self.sitecol,
            &classical.maximum_distance,
            &self.config.bin_widths()?,
        )?;
        edges.check_matrix_size()?;
        let shape = edges.shape(n, m, p, z);
        let kinds = self.config.disagg_outputs()?;
        let sizes = get_outputs_size(&shape, &kinds);
        info!(
            total_bytes = sizes.values().sum::<u64>(),
            matrix = ?edges.matrix_shape(),
            "disaggregation output size"
        );

        let acc = {
            let shared = self.shared(classical, &rlzs, &imts, &iml4, &edges, &ok_sites)?;
            let tasks = self.build_tasks(&edges, &shared)?;
            self.check_data_transfer(&shape, tasks.len())?;

            let mut smap = Starmap::new(self.executor, "disaggregation");
            for task in tasks {
                smap.submit(task);
            }
            smap.reduce(
                |task| compute_disagg(&shared, task).map(TaskOutput::done),
                DisaggAccumulator::default(),
                |acc, res| self.agg_result(acc, res),
            )?
        };

        let (pmfs, poe4) = post_execute(&acc, &shape, &kinds, &poes_disagg, &ok_sites)?;
        info!(
            sites = n,
            imts = m,
            poes = p,
            rlzs = z,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "disaggregation done"
        );
        Ok(DisaggOutput {
            edges,
            shape,
            imts,
            rlzs,
            poes_disagg,
            iml4,
            poe4,
            ok_sites,
            pmfs,
            task_info: acc.task_info,
        })
    }

    fn shared<'b>(
        &self,
        classical: &'b ClassicalOutput,
        rlzs: &Array2<usize>,
        imts: &'b [Imt],
        iml4: &'b Array4<f64>,
        edges: &'b BinEdges,
        ok_sites: &'b [bool],
    ) -> Result<Shared<'b>>
    where
        'a: 'b,
    {
        let realizations = self.logic_tree.realizations();
        let mut cmakers = Vec::new();
        let mut g_by_z = Vec::new();
        for trt in &edges.trts {
            let cmaker = classical
                .cmakers
                .get(trt)
                .ok_or_else(|| CalcError::config(format!("no context maker for {trt:?}")))?;
            let mut gz = Array2::zeros(rlzs.dim());
            for ((i, zi), &r) in rlzs.indexed_iter() {
                gz[[i, zi]] = realizations
                    .get(r)
                    .and_then(|rlz| rlz.gsim_index.get(trt))
                    .copied()
                    .ok_or_else(|| CalcError::config(format!("realization {r} has no model for {trt:?}")))?;
            }
            cmakers.push(cmaker);
            g_by_z.push(gz);
        }
        let truncation_level = self
            .config
            .truncation_level
            .ok_or_else(|| CalcError::config("disaggregation requires a truncation_level"))?;
        Ok(Shared {
            cmakers,
            g_by_z,
            imts,
            iml4,
            edges,
            eps3: Eps3::new(truncation_level, self.config.num_epsilon_bins)?,
            sids: self.sitecol.sids(),
            ok_sites,
        })
    }

    // ========================================================================
    // 3. Tasks
    // ========================================================================

    /// Blocks of stored contexts per TRT and magnitude, weighted by the
    /// square root of the affected sites
    fn build_tasks(&self, edges: &BinEdges, shared: &Shared<'_>) -> Result<Vec<DisaggTask>> {
        let lt_trts: Vec<&str> = self.logic_tree.trts().collect();
        let mut by_key = Vec::new();
        let mut totweight = 0.0;
        for (trti, trt) in edges.trts.iter().enumerate() {
            let pos = lt_trts
                .iter()
                .position(|t| t == trt)
                .ok_or_else(|| CalcError::config(format!("TRT {trt:?} missing in the logic tree")))?;
            let scoped = ScopedStore::new(self.store.as_ref(), pos);
            for key in scoped.mags()? {
                let Some(data) = scoped.get(&key)? else {
                    continue;
                };
                let mag: f64 = key
                    .parse()
                    .map_err(|_| CalcError::task(format!("invalid magnitude key {key:?}")))?;
                let ctxs = data.to_contexts(shared.cmakers[trti].requirements())?;
                totweight += ctxs.iter().map(|c| disagg_weight(c.num_sites())).sum::<f64>();
                by_key.push((trti, mag, ctxs));
            }
        }
        if by_key.is_empty() {
            return Err(CalcError::NoDisaggregation(
                "no contexts were stored by the classical calculation".to_string(),
            ));
        }
        let maxw = disagg_max_weight(totweight, self.config.concurrent_tasks, self.config.ruptures_per_block).max(1.0);
        debug!(totweight, maxw, "disaggregation block weight");

        let mut tasks = Vec::new();
        for (trti, mag, ctxs) in by_key {
            let magi = edges.mag_index(mag);
            for blk in block_splitter(ctxs, maxw, |c| disagg_weight(c.num_sites()), false)? {
                tasks.push(DisaggTask {
                    trti,
                    mag,
                    magi,
                    ctxs: blk.items,
                });
            }
        }
        Ok(tasks)
    }

    /// Fail when the marginals sent back by the tasks would exceed
    /// `max_data_transfer`
    fn check_data_transfer(&self, shape: &DisaggShape, num_tasks: usize) -> Result<()> {
        let cells = shape.dist * shape.eps + shape.lon * shape.lat;
        let estimated = 8.0 * (shape.n * shape.m * shape.p * shape.z * cells) as f64 * num_tasks as f64;
        if estimated > self.config.max_data_transfer {
            return Err(CalcError::DataTransfer {
                estimated,
                max: self.config.max_data_transfer,
            });
        }
        info!(estimated_bytes = estimated, tasks = num_tasks, "estimated data transfer");
        Ok(())
    }

    // ========================================================================
    // 4. Aggregation
    // ========================================================================

    fn agg_result(&self, acc: &mut DisaggAccumulator, res: DisaggResult) -> Result<()> {
        for ((n, m), (k0, k1)) in res.outputs {
            for (k, out) in [(0, k0), (1, k1)] {
                let cells = acc.matrices.entry((n, m, k)).or_default();
                let key = (res.trti, res.magi);
                let composed = match cells.remove(&key) {
                    Some(prev) => agg_probs(&prev, &out)?,
                    None => out,
                };
                cells.insert(key, composed);
            }
        }
        if let Some(metrics) = &self.metrics {
            metrics.record_task("disaggregation", std::time::Duration::from_secs_f64(res.info.dt));
        }
        acc.task_info.push(res.info);
        Ok(())
    }
}

/// Contexts of one TRT and magnitude
struct DisaggTask {
    trti: usize,
    mag: f64,
    magi: usize,
    ctxs: Vec<RuptureContext>,
}

/// Marginal pairs per (site index, IMT index)
struct DisaggResult {
    trti: usize,
    magi: usize,
    outputs: BTreeMap<(usize, usize), (ArrayD<f64>, ArrayD<f64>)>,
    info: TaskInfo,
}

/// Marginals keyed by (site, IMT, kind) then (TRT, magnitude bin)
#[derive(Default)]
struct DisaggAccumulator {
    matrices: BTreeMap<(usize, usize, usize), BTreeMap<(usize, usize), ArrayD<f64>>>,
    task_info: Vec<TaskInfo>,
}

/// Disaggregate a block of contexts at every accepted site and IMT
fn compute_disagg(shared: &Shared<'_>, task: DisaggTask) -> Result<DisaggResult> {
    let t0 = Instant::now();
    let cmaker = shared.cmakers[task.trti];
    let mut outputs = BTreeMap::new();
    for (i, &sid) in shared.sids.iter().enumerate() {
        if !shared.ok_sites[i] {
            continue;
        }
        let close: Vec<RuptureContext> = task.ctxs.iter().filter_map(|c| c.for_site(sid)).collect();
        if close.is_empty() {
            continue;
        }
        let bins = shared
            .edges
            .site_bins(i)
            .ok_or_else(|| CalcError::task(format!("no bins for site {sid}")))?;
        let g_by_z = shared.g_by_z[task.trti].row(i).to_vec();
        for (m, imt) in shared.imts.iter().enumerate() {
            let iml2 = shared.iml4.slice(s![i, m, .., ..]);
            let bdata = disaggregate(
                &close,
                cmaker.gsims(),
                &g_by_z,
                imt,
                iml2,
                &shared.eps3,
                cmaker.params().minimum_distance,
            )?;
            let mat6 = build_disagg_matrix(&bdata, &bins)?;
            if mat6.iter().all(|&x| x == 0.0) {
                continue;
            }
            outputs.insert((i, m), output(&mat6));
        }
    }
    Ok(DisaggResult {
        trti: task.trti,
        magi: task.magi,
        outputs,
        info: TaskInfo {
            trti: task.trti,
            mag: task.mag,
            nrups: task.ctxs.len(),
            dt: t0.elapsed().as_secs_f64(),
        },
    })
}

/// Stack the (TRT, magnitude bin) cells into a (T, Ma, A, B, P, Z) matrix
fn stack(cells: &BTreeMap<(usize, usize), ArrayD<f64>>, num_trts: usize, num_mags: usize) -> Result<Option<ArrayD<f64>>> {
    let Some(first) = cells.values().next() else {
        return Ok(None);
    };
    let mut dims = vec![num_trts, num_mags];
    dims.extend_from_slice(first.shape());
    let mut mat = ArrayD::zeros(IxDyn(&dims));
    for (&(t, ma), arr) in cells {
        if t >= num_trts || ma >= num_mags || arr.shape() != first.shape() {
            return Err(CalcError::task(format!(
                "inconsistent disaggregation cell ({t}, {ma}) of shape {:?}",
                arr.shape()
            )));
        }
        mat.index_axis_mut(Axis(0), t).index_axis_move(Axis(0), ma).assign(arr);
    }
    Ok(Some(mat))
}

/// Extract the PMFs and the recomposed PoEs from the aggregated marginals
fn post_execute(
    acc: &DisaggAccumulator,
    shape: &DisaggShape,
    kinds: &[PmfKind],
    poes_disagg: &[Option<f64>],
    ok_sites: &[bool],
) -> Result<(BTreeMap<PmfKind, ArrayD<f64>>, Array4<f64>)> {
    let mut pmfs: BTreeMap<PmfKind, ArrayD<f64>> = kinds
        .iter()
        .map(|&kind| (kind, ArrayD::zeros(IxDyn(&shape.output_shape(kind)))))
        .collect();
    let mut poe4 = Array4::zeros((shape.n, shape.m, shape.p, shape.z));
    let mut warned = BTreeSet::new();
    info!(
        outputs = shape.n * shape.m * shape.p * shape.z,
        "extracting the PMFs"
    );

    for (&(n, m, k), cells) in &acc.matrices {
        let Some(mat6) = stack(cells, shape.trt, shape.mag)? else {
            continue;
        };
        for (p, poe) in poes_disagg.iter().enumerate() {
            let mat5 = mat6.index_axis(Axis(4), p).to_owned();
            if k == 0 {
                let poe_z = pprod(&mat5, &[0, 1, 2, 3]);
                poe4.slice_mut(s![n, m, p, ..]).assign(&poe_z);
                let poe_agg = poe_z.mean().unwrap_or(0.0);
                if let Some(poe) = poe {
                    if (1.0 - poe_agg / poe).abs() > POE_TOLERANCE && ok_sites[n] && warned.insert(n) {
                        warn!(
                            site = n,
                            imt = m,
                            poe_agg,
                            poe,
                            "aggregated PoE quite different from the requested one; too few intensity levels?"
                        );
                    }
                }
            }
            for (&kind, out) in pmfs.iter_mut() {
                if kind.marginal() != k {
                    continue;
                }
                let pmf = kind.from_marginal(&mat5)?;
                let mut dest = out
                    .index_axis_mut(Axis(0), n)
                    .index_axis_move(Axis(0), m)
                    .index_axis_move(Axis(0), p);
                if dest.shape() != pmf.shape() {
                    return Err(CalcError::task(format!(
                        "{kind} has shape {:?}, expected {:?}",
                        pmf.shape(),
                        dest.shape()
                    )));
                }
                dest.assign(&pmf);
            }
        }
    }
    Ok((pmfs, poe4))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classical::ClassicalCalculator;
    use crate::executor::{RayonExecutor, SequentialExecutor};
    use crate::testing::{self, TRT};
    use approx::assert_relative_eq;
    use ndarray::array;
    use seisma_hazardlib::filters::SourceFilter;
    use seisma_hazardlib::imt::Imtls;
    use seisma_hazardlib::pmap_maker::PmapMaker;
    use seisma_hazardlib::source::{SeismicSource, SourceGroup};
    use seisma_hazardlib::store::MemoryRuptureStore;

    fn sources() -> Vec<Arc<dyn SeismicSource>> {
        vec![
            testing::point_source(1, 0.1),
            testing::point_source(2, -0.3),
            testing::characteristic(3, 0.2),
        ]
    }

    fn classical(
        config: &JobConfig,
        sitecol: &SiteCollection,
        groups: Vec<SourceGroup>,
        lt: &GsimLogicTree,
        store: Arc<dyn RuptureStore>,
    ) -> ClassicalOutput {
        let exec = RayonExecutor::new();
        ClassicalCalculator::new(config, &exec, sitecol.clone(), groups, lt.clone())
            .unwrap()
            .with_store(store)
            .run()
            .unwrap()
    }

    fn run(config: &JobConfig, sitecol: &SiteCollection, lt: &GsimLogicTree) -> Result<DisaggOutput> {
        let store: Arc<dyn RuptureStore> = Arc::new(MemoryRuptureStore::new());
        let out = classical(config, sitecol, vec![testing::group(0, sources())], lt, Arc::clone(&store));
        let exec = SequentialExecutor;
        DisaggregationCalculator::new(config, &exec, sitecol, lt, store)?.run(&out)
    }

    /// Disaggregate at PGA = 0.1 and return the output with the hazard PoE
    /// of the same site and level
    fn disagg_and_hazard(extra: &str) -> (DisaggOutput, f64) {
        let config = testing::disagg_config(extra, "[iml_disagg]\nPGA = 0.1\n");
        let sitecol = testing::sitecol(&[0.0]);
        let out = run(&config, &sitecol, &testing::single_tree()).unwrap();

        let mut params = config.context_params(TRT).unwrap();
        params.imtls = Imtls::new(vec![(Imt::Pga, vec![0.1])]).unwrap();
        let cmaker = ContextMaker::new(TRT, testing::single_tree().gsims(TRT).unwrap(), params).unwrap();
        let srcfilter = SourceFilter::new(sitecol.clone(), config.maximum_distance().unwrap());
        let grp = testing::group(0, sources());
        let hazard = PmapMaker::new(&cmaker, &srcfilter, &grp).make().unwrap().pmap.get(0).unwrap()[[0, 0]];
        assert!(hazard > 0.0);
        (out, hazard)
    }

    #[test]
    fn test_trt_pmf_matches_the_hazard() {
        let (out, expected) = disagg_and_hazard("");
        assert_eq!(out.imts, vec![Imt::Pga]);
        assert_eq!(out.poes_disagg, vec![None]);

        let trt = &out.pmfs[&PmfKind::Trt];
        assert_eq!(trt.shape(), &[1, 1, 1, 1, 1]);
        assert_relative_eq!(trt[[0, 0, 0, 0, 0]], expected, max_relative = 1e-6);
        assert_relative_eq!(out.poe4[[0, 0, 0, 0]], expected, max_relative = 1e-6);

        // the magnitude PMF recomposes to the same probability
        let mag = &out.pmfs[&PmfKind::Mag];
        let q: f64 = mag.iter().map(|&p| 1.0 - p).product();
        assert_relative_eq!(1.0 - q, expected, max_relative = 1e-6);
        assert!(!out.task_info.is_empty());
    }

    #[test]
    fn test_minimum_distance_keeps_the_pmfs_on_the_hazard() {
        let (_, plain_hazard) = disagg_and_hazard("");
        for extra in ["minimum_distance = 40.0", "minimum_distance = 40.0\ncollapse_level = 2"] {
            let (out, hazard) = disagg_and_hazard(extra);
            assert!(hazard < plain_hazard, "{extra}");
            assert_relative_eq!(out.pmfs[&PmfKind::Trt][[0, 0, 0, 0, 0]], hazard, max_relative = 1e-6);
            assert_relative_eq!(out.poe4[[0, 0, 0, 0]], hazard, max_relative = 1e-6);
            let q: f64 = out.pmfs[&PmfKind::Mag].iter().map(|&p| 1.0 - p).product();
            assert_relative_eq!(1.0 - q, hazard, max_relative = 1e-6);
        }
    }

    #[test]
    fn test_site_limit() {
        let config = testing::disagg_config("max_sites_disagg = 40000\npoes_disagg = [0.02]", "");
        let lt = testing::single_tree();
        let exec = SequentialExecutor;
        let store: Arc<dyn RuptureStore> = Arc::new(MemoryRuptureStore::new());

        let lons: Vec<f64> = (0..MAX_SITES).map(|i| i as f64 * 1e-4).collect();
        let sitecol = testing::sitecol(&lons);
        assert!(DisaggregationCalculator::new(&config, &exec, &sitecol, &lt, Arc::clone(&store)).is_ok());

        let lons: Vec<f64> = (0..=MAX_SITES).map(|i| i as f64 * 1e-4).collect();
        let sitecol = testing::sitecol(&lons);
        let res = DisaggregationCalculator::new(&config, &exec, &sitecol, &lt, store);
        assert!(matches!(res, Err(CalcError::TooManySites { num_sites: 32_768, max: MAX_SITES })));
    }

    #[test]
    fn test_output_shapes() {
        let config = testing::disagg_config(
            "poes_disagg = [0.02, 0.01]\ndisagg_outputs = [\"Mag\", \"Mag_Dist_Eps\", \"Lon_Lat_TRT\"]",
            "",
        );
        let sitecol = testing::sitecol(&[0.0]);
        let out = run(&config, &sitecol, &testing::single_tree()).unwrap();
        let sh = out.shape;
        assert_eq!((sh.n, sh.m, sh.p, sh.z), (1, 2, 2, 1));
        assert_eq!(out.pmfs.len(), 3);
        assert_eq!(out.pmfs[&PmfKind::Mag].shape(), &[1, 2, 2, sh.mag, 1]);
        assert_eq!(out.pmfs[&PmfKind::MagDistEps].shape(), &[1, 2, 2, sh.mag, sh.dist, sh.eps, 1]);
        assert_eq!(out.pmfs[&PmfKind::LonLatTrt].shape(), &[1, 2, 2, sh.lon, sh.lat, 1, 1]);
        assert_eq!(sh.eps, 3);
        assert!(out.pmfs.values().all(|a| a.iter().all(|&p| (0.0..=1.0).contains(&p))));
        // levels for the smaller PoE are higher
        assert!(out.iml4[[0, 0, 1, 0]] >= out.iml4[[0, 0, 0, 0]]);
    }

    #[test]
    fn test_unreachable_poe_aborts() {
        let config = testing::disagg_config("poes_disagg = [0.999999]", "");
        let sitecol = testing::sitecol(&[0.0]);
        assert!(matches!(
            run(&config, &sitecol, &testing::single_tree()),
            Err(CalcError::NoDisaggregation(_))
        ));
    }

    #[test]
    fn test_too_many_sites() {
        let config = testing::disagg_config("poes_disagg = [0.02]", "");
        let lons: Vec<f64> = (0..11).map(|i| i as f64 * 0.01).collect();
        let sitecol = testing::sitecol(&lons);
        let lt = testing::single_tree();
        let exec = SequentialExecutor;
        let store: Arc<dyn RuptureStore> = Arc::new(MemoryRuptureStore::new());
        let res = DisaggregationCalculator::new(&config, &exec, &sitecol, &lt, store);
        assert!(matches!(res, Err(CalcError::TooManySites { num_sites: 11, max: 10 })));
    }

    #[test]
    fn test_atomic_groups_are_rejected() {
        let config = testing::disagg_config("poes_disagg = [0.02]", "");
        let sitecol = testing::sitecol(&[0.0]);
        let lt = testing::single_tree();
        let store: Arc<dyn RuptureStore> = Arc::new(MemoryRuptureStore::new());
        let mut out = classical(&config, &sitecol, vec![testing::group(0, sources())], &lt, Arc::clone(&store));
        out.groups[0].src_interdep = seisma_hazardlib::source::Interdep::Mutex;
        let exec = SequentialExecutor;
        let res = DisaggregationCalculator::new(&config, &exec, &sitecol, &lt, store).unwrap().run(&out);
        assert!(matches!(res, Err(CalcError::NotImplemented(_))));
    }

    #[test]
    fn test_closest_to_ref() {
        let a = array![0.1, 0.2, 0.3];
        let b = array![0.5, 0.5, 0.5];
        let c = array![0.12, 0.2, 0.3];
        let mean = array![0.11, 0.2, 0.3];
        let order = closest_to_ref(&[a.view(), b.view(), c.view()], mean.view());
        assert_eq!(order, vec![0, 2, 1]);
    }

    #[test]
    fn test_interp_is_clamped() {
        let xs = [0.01, 0.1, 0.5];
        let ys = [0.5, 0.2, 0.005];
        assert_relative_eq!(interp(0.3, &xs, &ys), 0.1025, epsilon = 1e-12);
        assert_eq!(interp(0.001, &xs, &ys), 0.5);
        assert_eq!(interp(0.9, &xs, &ys), 0.005);
    }

    #[test]
    fn test_rlzs_closest_to_the_mean() {
        let mut config = testing::disagg_config("poes_disagg = [0.02]", "");
        config.num_rlzs_disagg = 2;
        let sitecol = testing::sitecol(&[0.0]);
        let out = run(&config, &sitecol, &testing::two_branch_tree()).unwrap();
        assert_eq!(out.rlzs.dim(), (1, 2));
        let mut picked = out.rlzs.row(0).to_vec();
        picked.sort_unstable();
        assert_eq!(picked, vec![0, 1]);
        assert_eq!(out.shape.z, 2);

        config.num_rlzs_disagg = 3;
        assert!(matches!(
            run(&config, &sitecol, &testing::two_branch_tree()),
            Err(CalcError::Config(_))
        ));
    }
}
