//! Shared fixtures for the calculator tests

use std::collections::BTreeMap;
use std::sync::Arc;

use seisma_hazardlib::geo::Point;
use seisma_hazardlib::gsim::{GroundMotionModel, LinearAttenuation};
use seisma_hazardlib::site::{Site, SiteCollection};
use seisma_hazardlib::source::{CharacteristicSource, Mfd, NodalPlane, PointSource, SeismicSource, SourceGroup};
use seisma_hazardlib::surface::PlanarSurface;
use seisma_hazardlib::tom::PoissonTom;
use seisma_hazardlib::DistanceParam;

use crate::config::JobConfig;
use crate::logic_tree::{GsimBranch, GsimLogicTree};

pub(crate) const TRT: &str = "Active Shallow Crust";

pub(crate) const JOB: &str = r#"
    description = "test job"
    investigation_time = 50.0
    truncation_level = 3.0
    concurrent_tasks = 4
    min_weight = 1.0

    [imtls]
    PGA = [0.005, 0.05, 0.2, 0.5]
    "SA(0.5)" = [0.01, 0.1, 0.4]

    [maximum_distance]
    default = 200.0
"#;

pub(crate) const DISAGG: &str = r#"
    mag_bin_width = 0.5
    distance_bin_width = 20.0
    coordinate_bin_width = 1.0
    num_epsilon_bins = 3
"#;

pub(crate) fn config(extra: &str) -> JobConfig {
    JobConfig::from_toml_str(&format!("{extra}\n{JOB}")).unwrap()
}

/// Disaggregation job; `extra` goes before the tables, `tables` after
pub(crate) fn disagg_config(extra: &str, tables: &str) -> JobConfig {
    JobConfig::from_toml_str(&format!("{extra}\n{DISAGG}\n{JOB}\n{tables}")).unwrap()
}

/// Sites along the equator at the given longitudes
pub(crate) fn sitecol(lons: &[f64]) -> SiteCollection {
    let sites: Vec<Site> = lons
        .iter()
        .map(|&lon| Site::new(Point::new(lon, 0.0, 0.0), 760.0))
        .collect();
    SiteCollection::new(&sites)
}

pub(crate) fn gsim(name: &str, metric: DistanceParam) -> Arc<dyn GroundMotionModel> {
    Arc::new(LinearAttenuation::generic(name, metric))
}

/// One model for the test TRT
pub(crate) fn single_tree() -> GsimLogicTree {
    let mut gsims = BTreeMap::new();
    gsims.insert(TRT.to_string(), gsim("LA-rrup", DistanceParam::Rrup));
    GsimLogicTree::single(gsims).unwrap()
}

/// Two weighted models for the test TRT
pub(crate) fn two_branch_tree() -> GsimLogicTree {
    let mut branches = BTreeMap::new();
    branches.insert(
        TRT.to_string(),
        vec![
            GsimBranch::new(gsim("LA-rrup", DistanceParam::Rrup), 0.7),
            GsimBranch::new(gsim("LA-rjb", DistanceParam::Rjb), 0.3),
        ],
    );
    GsimLogicTree::new(branches).unwrap()
}

pub(crate) fn point_source(id: u32, lon: f64) -> Arc<dyn SeismicSource> {
    let src = PointSource::new(
        format!("ps{id}"),
        id,
        TRT,
        Point::new(lon, 0.0, 0.0),
        Mfd::EvenlyDiscretized {
            min_mag: 5.0,
            bin_width: 0.5,
            occurrence_rates: vec![0.02, 0.008, 0.003],
        },
        vec![
            (0.5, NodalPlane { strike: 0.0, dip: 90.0, rake: 0.0 }),
            (0.5, NodalPlane { strike: 45.0, dip: 60.0, rake: 90.0 }),
        ],
        vec![(0.5, 5.0), (0.5, 10.0)],
        (0.0, 20.0),
        1.5,
    )
    .unwrap();
    Arc::new(src)
}

pub(crate) fn characteristic(id: u32, lon: f64) -> Arc<dyn SeismicSource> {
    let surface = PlanarSurface::new(Point::new(lon, 0.0, 8.0), 0.0, 60.0, 30.0, 12.0);
    Arc::new(CharacteristicSource::new(
        format!("cs{id}"),
        id,
        TRT,
        surface,
        Mfd::EvenlyDiscretized {
            min_mag: 6.5,
            bin_width: 0.2,
            occurrence_rates: vec![0.002, 0.001],
        },
        90.0,
    ))
}

pub(crate) fn group(grp_id: u32, sources: Vec<Arc<dyn SeismicSource>>) -> SourceGroup {
    SourceGroup::new(grp_id, TRT, sources, PoissonTom::new(50.0).unwrap()).unwrap()
}
