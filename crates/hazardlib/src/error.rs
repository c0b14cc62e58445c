//! Error types for seisma-hazardlib

use thiserror::Error;

/// Result type alias for hazardlib operations
pub type Result<T> = std::result::Result<T, HazardError>;

/// Raised when no site lies within the maximum distance of a rupture.
///
/// This is the only recoverable condition in the context builder: the
/// caller skips the rupture and moves on.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("rupture {rup_id}: closest site at {min_distance:.0} km")]
pub struct FarAwayRupture {
    /// Identifier of the discarded rupture
    pub rup_id: u64,
    /// Distance of the closest site, in km
    pub min_distance: f64,
}

/// Errors produced by the hazard library
#[derive(Error, Debug)]
pub enum HazardError {
    /// Rupture outside the integration distance for every site
    #[error(transparent)]
    FarAway(#[from] FarAwayRupture),

    /// A model declared a distance measure the engine cannot compute
    #[error("unknown distance measure {0:?}")]
    UnknownDistance(String),

    /// A model declared a rupture parameter the engine cannot compute
    #[error("{model} requires unknown rupture parameter {param:?}")]
    UnknownRuptureParameter {
        /// Name of the requiring model
        model: String,
        /// Offending parameter name
        param: String,
    },

    /// A model or caller asked for a site parameter that does not exist
    #[error("unknown site parameter {0:?}")]
    UnknownSiteParameter(String),

    /// A field was assigned to a context without being declared as required
    #[error("context field {0:?} is not in the required set")]
    UndeclaredField(String),

    /// A required context field was never assigned
    #[error("context field {0:?} is required but missing")]
    MissingField(String),

    /// A per-site array does not match the number of surviving sites
    #[error("context field {field:?} has {got} values, expected {expected}")]
    LengthMismatch {
        /// Field name
        field: String,
        /// Actual length
        got: usize,
        /// Number of sites in the context
        expected: usize,
    },

    /// Invalid intensity measure type string
    #[error("invalid intensity measure type {0:?}")]
    InvalidImt(String),

    /// Invalid rupture definition
    #[error("invalid rupture: {0}")]
    InvalidRupture(String),

    /// Invalid source or source group definition
    #[error("invalid source: {0}")]
    InvalidSource(String),

    /// The mutex weights of a source group do not sum to one
    #[error("mutex weights of group {grp_id} sum to {total}, expected 1")]
    MutexWeights {
        /// Group identifier
        grp_id: u32,
        /// Actual sum of the weights
        total: f64,
    },

    /// A ground motion model cannot handle the given input
    #[error("{model}: {msg}")]
    Gsim {
        /// Model name
        model: String,
        /// Description of the failure
        msg: String,
    },

    /// The disaggregation matrix would exceed the allowed size
    #[error("the disaggregation matrix is too large ({0} elements): fix the binning!")]
    MatrixTooLarge(u64),

    /// Inconsistent disaggregation binning
    #[error("binning error: {0}")]
    Binning(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Rupture store error
    #[error("store error: {0}")]
    Store(String),

    /// Stored data failed the integrity check
    #[error("integrity error: {0}")]
    Integrity(String),

    /// I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Binary encoding error
    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),
}

impl HazardError {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a store error
    pub fn store(msg: impl Into<String>) -> Self {
        Self::Store(msg.into())
    }

    /// Create a ground motion model error
    pub fn gsim(model: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Gsim {
            model: model.into(),
            msg: msg.into(),
        }
    }

    /// Create a binning error
    pub fn binning(msg: impl Into<String>) -> Self {
        Self::Binning(msg.into())
    }

    /// True when the caller may skip the offending item and continue
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::FarAway(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_far_away_is_the_only_recoverable_error() {
        let err: HazardError = FarAwayRupture {
            rup_id: 7,
            min_distance: 312.4,
        }
        .into();
        assert!(err.is_recoverable());
        assert_eq!(err.to_string(), "rupture 7: closest site at 312 km");

        let err = HazardError::UnknownDistance("rfoo".into());
        assert!(!err.is_recoverable());
        assert!(!HazardError::config("bad").is_recoverable());
    }
}
