//! Context building, collapsing and disaggregation binning benchmarks
//!
//! ```bash
//! cargo bench --package seisma-hazardlib --bench context_benchmark
//! ```

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use ndarray::Array2;
use seisma_hazardlib::collapse::collapse_contexts;
use seisma_hazardlib::disagg::{build_disagg_matrix, disaggregate, lon_lat_bins, dist_edges, Eps3, SiteBins};
use seisma_hazardlib::gsim::GroundMotionModel;
use seisma_hazardlib::prelude::*;
use seisma_hazardlib::source::{Mfd, NodalPlane, PointSource};

const TRT: &str = "Active Shallow Crust";

fn sites(n: usize) -> SiteCollection {
    let sites: Vec<Site> = (0..n)
        .map(|i| Site::new(Point::new(-1.0 + 2.0 * i as f64 / n as f64, 0.3, 0.0), 400.0 + i as f64))
        .collect();
    SiteCollection::new(&sites)
}

fn cmaker(maxdist: f64) -> ContextMaker {
    let params = ContextParams {
        imtls: Imtls::from_strs([("PGA", vec![0.01, 0.05, 0.1, 0.2, 0.5]), ("SA(1.0)", vec![0.01, 0.1, 0.3])])
            .unwrap(),
        tom: PoissonTom::new(50.0).unwrap(),
        truncation_level: Some(3.0),
        maximum_distance: MagDepDistance::constant(maxdist),
        ..ContextParams::default()
    };
    let gsims: Vec<Arc<dyn GroundMotionModel>> = vec![
        Arc::new(LinearAttenuation::generic("LA-rrup", DistanceParam::Rrup)),
        Arc::new(LinearAttenuation::generic("LA-rjb", DistanceParam::Rjb)),
    ];
    ContextMaker::new(TRT, gsims, params).unwrap()
}

fn point_source(id: u32) -> PointSource {
    PointSource::new(
        format!("ps{id}"),
        id,
        TRT,
        Point::new(0.1 * id as f64, 0.0, 0.0),
        Mfd::EvenlyDiscretized {
            min_mag: 5.0,
            bin_width: 0.25,
            occurrence_rates: vec![0.02, 0.015, 0.01, 0.006, 0.003, 0.001],
        },
        vec![
            (0.5, NodalPlane { strike: 0.0, dip: 90.0, rake: 0.0 }),
            (0.5, NodalPlane { strike: 90.0, dip: 45.0, rake: 90.0 }),
        ],
        vec![(0.4, 5.0), (0.6, 12.0)],
        (0.0, 20.0),
        1.5,
    )
    .unwrap()
}

/// Context building against growing site collections
fn bench_make_ctxs(c: &mut Criterion) {
    let mut group = c.benchmark_group("make_ctxs");
    let cm = cmaker(300.0);
    let src = point_source(1);
    let rups: Vec<Rupture> = src.iter_ruptures(None).collect();

    for nsites in [1usize, 100, 1000] {
        let sitecol = sites(nsites);
        group.bench_with_input(BenchmarkId::from_parameter(nsites), &sitecol, |b, sitecol| {
            b.iter(|| {
                let ctxs = cm.make_ctxs(rups.iter().map(|r| (r, sitecol)), false).unwrap();
                black_box(ctxs.len())
            })
        });
    }
    group.finish();
}

/// Collapsing contexts of many identical-geometry ruptures
fn bench_collapse(c: &mut Criterion) {
    let cm = cmaker(300.0);
    let sitecol = sites(50);
    let srcs: Vec<PointSource> = (0..5).map(|_| point_source(1)).collect();
    let rups: Vec<Rupture> = srcs.iter().flat_map(|s| s.iter_ruptures(None)).collect();
    let ctxs = cm.make_ctxs(rups.iter().map(|r| (r, &sitecol)), false).unwrap();

    c.bench_function("collapse_contexts", |b| {
        b.iter(|| black_box(collapse_contexts(ctxs.clone(), cm.requirements(), 2).len()))
    });
}

/// Epsilon splitting and binning of one-site contexts
fn bench_disagg_binning(c: &mut Criterion) {
    let cm = cmaker(300.0);
    let site1 = sites(1);
    let srcs: Vec<Arc<dyn SeismicSource>> = (0..4).map(|i| Arc::new(point_source(i)) as Arc<dyn SeismicSource>).collect();
    let ctxs = cm.from_srcs(&srcs, &site1).unwrap();
    let eps3 = Eps3::new(3.0, 8).unwrap();
    let iml2 = Array2::from_shape_vec((2, 2), vec![0.05, 0.05, 0.2, 0.2]).unwrap();
    let dist = dist_edges(300.0, 10.0).unwrap();
    let (lon, lat) = lon_lat_bins(site1.lons()[0], site1.lats()[0], 300.0, 0.2);

    c.bench_function("disaggregate", |b| {
        b.iter(|| {
            let bdata = disaggregate(&ctxs, cm.gsims(), &[0, 1], &Imt::Pga, iml2.view(), &eps3, 0.0).unwrap();
            let bins = SiteBins {
                dist: &dist,
                lon: &lon,
                lat: &lat,
                eps: eps3.edges(),
            };
            black_box(build_disagg_matrix(&bdata, &bins).unwrap().sum())
        })
    });
}

criterion_group!(benches, bench_make_ctxs, bench_collapse, bench_disagg_binning);
criterion_main!(benches);
