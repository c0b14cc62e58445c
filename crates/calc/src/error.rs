//! Error types for seisma-calc
//!
//! ## Table of Contents
//! - **CalcError**: failures of the calculators, the job configuration and
//!   the execution substrate
//! - **Result**: Type alias for `Result<T, CalcError>`

use seisma_hazardlib::HazardError;
use thiserror::Error;

/// Result type alias for calculator operations
pub type Result<T> = std::result::Result<T, CalcError>;

/// Main error type of the calculators
#[derive(Error, Debug)]
pub enum CalcError {
    /// Failure inside the hazard library
    #[error(transparent)]
    Hazard(#[from] HazardError),

    /// Invalid or inconsistent job configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// Unparsable job file
    #[error("invalid job file: {0}")]
    Toml(#[from] toml::de::Error),

    /// Not enough memory for the probability maps
    #[error("not enough memory: {needed} bytes needed, {available} available")]
    OutOfMemory {
        /// Bytes required
        needed: u64,
        /// Bytes available
        available: u64,
    },

    /// Unparsable JSON job file
    #[error("invalid JSON job file: {0}")]
    Json(#[from] serde_json::Error),

    /// Too many sites for a disaggregation
    #[error("too many sites for disaggregation: {num_sites} > {max}")]
    TooManySites {
        /// Number of sites of the job
        num_sites: usize,
        /// Largest accepted number of sites
        max: usize,
    },

    /// Every site was excluded from the disaggregation
    #[error("cannot do any disaggregation: {0}")]
    NoDisaggregation(String),

    /// Estimated transfer above `max_data_transfer`
    #[error("estimated data transfer {estimated:.0} bytes exceeds max_data_transfer {max:.0}")]
    DataTransfer {
        /// Estimated bytes
        estimated: f64,
        /// Configured limit
        max: f64,
    },

    /// Unsupported combination of inputs
    #[error("not implemented: {0}")]
    NotImplemented(String),

    /// Failure of a worker or of the executor
    #[error("task error: {0}")]
    Task(String),

    /// Metrics registration or export failure
    #[error("metrics error: {0}")]
    Metrics(String),

    /// Generic IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl CalcError {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a task error
    pub fn task(msg: impl Into<String>) -> Self {
        Self::Task(msg.into())
    }

    /// Create a metrics error
    pub fn metrics(msg: impl Into<String>) -> Self {
        Self::Metrics(msg.into())
    }
}

impl From<prometheus::Error> for CalcError {
    fn from(err: prometheus::Error) -> Self {
        Self::Metrics(err.to_string())
    }
}
