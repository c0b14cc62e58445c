//! Temporal occurrence models

use serde::{Deserialize, Serialize};

use crate::error::{HazardError, Result};

/// Poissonian temporal occurrence model over a fixed time span.
///
/// Carried explicitly by every context and source group; there is no
/// process-wide default.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PoissonTom {
    /// Investigation time in years
    pub time_span: f64,
}

impl PoissonTom {
    /// Create a model for the given investigation time
    pub fn new(time_span: f64) -> Result<Self> {
        if time_span <= 0.0 || !time_span.is_finite() {
            return Err(HazardError::config(format!(
                "time_span must be positive, got {time_span}"
            )));
        }
        Ok(Self { time_span })
    }

    /// Probability of one or more occurrences within the time span
    pub fn probability_one_or_more(&self, rate: f64) -> f64 {
        -(-rate * self.time_span).exp_m1()
    }

    /// Probability of exactly `n` occurrences within the time span
    pub fn probability_n_occurrences(&self, rate: f64, n: u32) -> f64 {
        let mu = rate * self.time_span;
        let log_fact: f64 = (1..=n).map(|k| (k as f64).ln()).sum();
        (n as f64 * mu.ln() - mu - log_fact).exp()
    }

    /// Probability that a rupture with the given rate never causes an exceedance,
    /// given the conditional probability of exceedance per occurrence
    pub fn probability_no_exceedance(&self, rate: f64, poe: f64) -> f64 {
        (-rate * self.time_span * poe).exp()
    }

    /// Key used to keep contexts under different models apart when merging
    pub(crate) fn key(&self) -> u64 {
        self.time_span.to_bits()
    }
}
