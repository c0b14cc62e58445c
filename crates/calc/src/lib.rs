//! # Seisma Calc
//!
//! Classical PSHA and disaggregation calculators on top of
//! `seisma-hazardlib`.
//!
//! ## Features
//!
//! - **Job configuration**: TOML or JSON job files with validation
//! - **Classical**: source filtering, weighted task splitting and hazard
//!   curves per logic tree realization
//! - **Disaggregation**: PMFs by magnitude, distance, position, epsilon and
//!   tectonic region type, from the contexts stored by the classical run
//! - **Execution**: rayon-backed fan-out with subtask resubmission
//! - **Telemetry**: tracing logs and Prometheus metrics
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use seisma_calc::prelude::*;
//! use seisma_hazardlib::site::SiteCollection;
//! use seisma_hazardlib::source::SourceGroup;
//!
//! fn hazard(sites: SiteCollection, groups: Vec<SourceGroup>, lt: GsimLogicTree) -> seisma_calc::Result<()> {
//!     seisma_calc::logging::init(None);
//!     let config = JobConfig::load("job.toml")?;
//!     let exec = RayonExecutor::new();
//!     let store: Arc<dyn RuptureStore> = Arc::new(MemoryRuptureStore::new());
//!     let classical = ClassicalCalculator::new(&config, &exec, sites.clone(), groups, lt.clone())?
//!         .with_store(Arc::clone(&store))
//!         .run()?;
//!     if config.is_disaggregation() {
//!         let out = DisaggregationCalculator::new(&config, &exec, &sites, &lt, store)?.run(&classical)?;
//!         println!("{} PMF kinds", out.pmfs.len());
//!     }
//!     Ok(())
//! }
//! ```

pub mod classical;
pub mod config;
pub mod disaggregation;
pub mod error;
pub mod executor;
pub mod logging;
pub mod logic_tree;
pub mod telemetry;

#[cfg(test)]
pub(crate) mod testing;

// Re-exports for ergonomic API
pub use classical::{ClassicalCalculator, ClassicalOutput, HazardCurves, Preclassical, ScopedStore};
pub use config::JobConfig;
pub use disaggregation::{DisaggOutput, DisaggregationCalculator};
pub use error::{CalcError, Result};
pub use executor::{Executor, RayonExecutor, SequentialExecutor, Starmap, TaskOutput};
pub use logic_tree::{GsimBranch, GsimLogicTree, Realization};
pub use telemetry::CalcMetrics;

/// Prelude for common imports
pub mod prelude {
    pub use crate::classical::{ClassicalCalculator, ClassicalOutput};
    pub use crate::config::JobConfig;
    pub use crate::disaggregation::{DisaggOutput, DisaggregationCalculator};
    pub use crate::error::{CalcError, Result};
    pub use crate::executor::{Executor, RayonExecutor, SequentialExecutor};
    pub use crate::logic_tree::{GsimBranch, GsimLogicTree};
    pub use seisma_hazardlib::store::{MemoryRuptureStore, RuptureStore};
}
