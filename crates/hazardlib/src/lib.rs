//! # Seisma Hazardlib
//!
//! Core of a probabilistic seismic hazard engine: builds per-rupture
//! contexts against sites, composes them into probability maps, splits work
//! into weighted blocks and disaggregates hazard by magnitude, distance,
//! location, epsilon and tectonic region type.
//!
//! ## Features
//!
//! - **Contexts**: distance and parameter tables per rupture, filtered by a
//!   magnitude-dependent integration distance
//! - **Collapsing**: merge ruptures with identical ground-motion inputs and
//!   collapse point ruptures by distance bin
//! - **Probability maps**: independent and mutually exclusive composition
//!   of sources and ruptures
//! - **Partitioning**: greedy weighted block splitting
//! - **Disaggregation**: 6D exceedance matrices and PMF extraction
//! - **Rupture store**: columnar contexts persisted per magnitude
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use seisma_hazardlib::prelude::*;
//!
//! fn hazard(group: &SourceGroup, sites: SiteCollection) -> seisma_hazardlib::Result<ProbabilityMap> {
//!     let params = ContextParams {
//!         imtls: Imtls::from_strs([("PGA", vec![0.01, 0.1, 0.5])])?,
//!         tom: group.tom,
//!         truncation_level: Some(3.0),
//!         maximum_distance: MagDepDistance::constant(200.0),
//!         ..ContextParams::default()
//!     };
//!     let gsim: Arc<dyn GroundMotionModel> =
//!         Arc::new(LinearAttenuation::generic("LA", DistanceParam::Rrup));
//!     let cmaker = ContextMaker::new(group.trt.clone(), vec![gsim], params.clone())?;
//!     let srcfilter = SourceFilter::new(sites, params.maximum_distance);
//!     Ok(PmapMaker::new(&cmaker, &srcfilter, group).make()?.pmap)
//! }
//! ```

pub mod collapse;
pub mod contexts;
pub mod disagg;
pub mod effect;
pub mod error;
pub mod filters;
pub mod geo;
pub mod gsim;
pub mod imt;
pub mod partition;
pub mod pmap;
pub mod pmap_maker;
pub mod site;
pub mod source;
pub mod stats;
pub mod store;
pub mod surface;
pub mod tom;

#[cfg(test)]
pub(crate) mod testing;

// Re-exports for ergonomic API
pub use contexts::{ContextMaker, ContextParams, DistanceParam, PointSourceDistance, RuptureContext};
pub use disagg::{BinEdges, BinWidths, DisaggShape, Disaggregation, PmfKind};
pub use error::{FarAwayRupture, HazardError, Result};
pub use filters::{MagDepDistance, MagKey, SourceFilter};
pub use partition::{block_splitter, Block};
pub use pmap::ProbabilityMap;
pub use pmap_maker::{PmapMaker, PmapOutput};
pub use store::{FileRuptureStore, MemoryRuptureStore, RupData, RuptureStore};

/// Prelude for common imports
pub mod prelude {
    pub use crate::contexts::{ContextMaker, ContextParams, DistanceParam, PointSourceDistance, RuptureContext};
    pub use crate::disagg::{BinEdges, BinWidths, PmfKind};
    pub use crate::error::{HazardError, Result};
    pub use crate::filters::{MagDepDistance, SourceFilter};
    pub use crate::geo::Point;
    pub use crate::gsim::{GroundMotionModel, LinearAttenuation};
    pub use crate::imt::{Imt, Imtls};
    pub use crate::pmap::ProbabilityMap;
    pub use crate::pmap_maker::PmapMaker;
    pub use crate::site::{Site, SiteCollection};
    pub use crate::source::{Rupture, SeismicSource, SourceGroup};
    pub use crate::tom::PoissonTom;
}
