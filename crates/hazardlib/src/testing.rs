//! Shared fixtures for the unit tests

use std::sync::Arc;

use crate::contexts::{ContextMaker, ContextParams, DistanceParam};
use crate::filters::MagDepDistance;
use crate::geo::Point;
use crate::gsim::{GroundMotionModel, LinearAttenuation};
use crate::imt::Imtls;
use crate::site::{Site, SiteCollection};
use crate::source::{CharacteristicSource, Mfd, NodalPlane, PointSource};
use crate::surface::PlanarSurface;
use crate::tom::PoissonTom;

pub(crate) const TRT: &str = "Active Shallow Crust";

/// Sites along the equator at the given longitudes
pub(crate) fn sitecol(lons: &[f64]) -> SiteCollection {
    let sites: Vec<Site> = lons
        .iter()
        .map(|&lon| Site::new(Point::new(lon, 0.0, 0.0), 760.0))
        .collect();
    SiteCollection::new(&sites)
}

pub(crate) fn imtls() -> Imtls {
    Imtls::from_strs([
        ("PGA", vec![0.005, 0.05, 0.2, 0.5]),
        ("SA(0.5)", vec![0.01, 0.1, 0.4]),
    ])
    .unwrap()
}

pub(crate) fn params(maxdist: f64) -> ContextParams {
    ContextParams {
        imtls: imtls(),
        tom: PoissonTom::new(50.0).unwrap(),
        truncation_level: Some(3.0),
        maximum_distance: MagDepDistance::constant(maxdist),
        ..ContextParams::default()
    }
}

pub(crate) fn gsims() -> Vec<Arc<dyn GroundMotionModel>> {
    vec![
        Arc::new(LinearAttenuation::generic("LA-rrup", DistanceParam::Rrup)),
        Arc::new(LinearAttenuation::generic("LA-rjb", DistanceParam::Rjb)),
    ]
}

pub(crate) fn cmaker(params: ContextParams) -> ContextMaker {
    ContextMaker::new(TRT, gsims(), params).unwrap()
}

pub(crate) fn point_source(id: u32, lon: f64, rates: Vec<f64>) -> PointSource {
    PointSource::new(
        format!("ps{id}"),
        id,
        TRT,
        Point::new(lon, 0.0, 0.0),
        Mfd::EvenlyDiscretized {
            min_mag: 5.0,
            bin_width: 0.5,
            occurrence_rates: rates,
        },
        vec![
            (0.5, NodalPlane { strike: 0.0, dip: 90.0, rake: 0.0 }),
            (0.5, NodalPlane { strike: 45.0, dip: 60.0, rake: 90.0 }),
        ],
        vec![(0.5, 5.0), (0.5, 10.0)],
        (0.0, 20.0),
        1.5,
    )
    .unwrap()
}

pub(crate) fn characteristic(id: u32, lon: f64) -> CharacteristicSource {
    let surface = PlanarSurface::new(Point::new(lon, 0.0, 8.0), 0.0, 60.0, 30.0, 12.0);
    CharacteristicSource::new(
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
    )
}
